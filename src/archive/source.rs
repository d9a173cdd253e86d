use std::fs::File;
use std::io::{self, Read};
use std::os::unix::fs::FileExt;
use std::path::Path;
use std::sync::Arc;

/// Random-access input shared between compression workers.
#[derive(Clone)]
pub struct EntrySource {
    kind: Kind,
    len: u64,
}

#[derive(Clone)]
enum Kind {
    File(Arc<File>),
    Bytes(Arc<[u8]>),
}

impl EntrySource {
    pub fn open(path: &Path) -> io::Result<Self> {
        let file = File::open(path)?;
        let len = file.metadata()?.len();
        Ok(Self {
            kind: Kind::File(Arc::new(file)),
            len,
        })
    }

    pub fn from_bytes(data: impl Into<Vec<u8>>) -> Self {
        let data: Arc<[u8]> = data.into().into();
        Self {
            len: data.len() as u64,
            kind: Kind::Bytes(data),
        }
    }

    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn read_exact_at(&self, buf: &mut [u8], offset: u64) -> io::Result<()> {
        match &self.kind {
            Kind::File(file) => file.read_exact_at(buf, offset),
            Kind::Bytes(data) => {
                let start = usize::try_from(offset)
                    .ok()
                    .filter(|&start| start + buf.len() <= data.len())
                    .ok_or_else(|| io::Error::from(io::ErrorKind::UnexpectedEof))?;
                buf.copy_from_slice(&data[start..start + buf.len()]);
                Ok(())
            }
        }
    }

    pub fn read_range(&self, offset: u64, len: u64) -> io::Result<Vec<u8>> {
        let mut buf = vec![0; len as usize];
        self.read_exact_at(&mut buf, offset)?;
        Ok(buf)
    }

    /// Sequential reader over the whole source.
    pub fn reader(&self) -> SourceReader {
        SourceReader {
            source: self.clone(),
            pos: 0,
        }
    }
}

pub struct SourceReader {
    source: EntrySource,
    pos: u64,
}

impl Read for SourceReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let left = self.source.len.saturating_sub(self.pos);
        let n = (buf.len() as u64).min(left) as usize;
        if n == 0 {
            return Ok(0);
        }
        self.source.read_exact_at(&mut buf[..n], self.pos)?;
        self.pos += n as u64;
        Ok(n)
    }
}
