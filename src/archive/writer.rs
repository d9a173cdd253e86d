//! Sequential PKZIP writer that accepts already-compressed payloads.

use std::collections::HashSet;
use std::io::{self, Read, Write};

use super::format::{
    encode_central_header, encode_data_descriptor, encode_end_records, encode_local_header,
    strip_zip64_extra, FileHeader,
};

struct CountingWriter<W> {
    inner: W,
    written: u64,
}

impl<W: Write> Write for CountingWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.written += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

/// Writes entries one after another and the central directory on
/// [`close`](ArchiveWriter::close).
///
/// Entry names must be unique; a repeated name is a caller bug and panics.
pub struct ArchiveWriter<W: Write> {
    out: CountingWriter<W>,
    entries: Vec<FileHeader>,
    names: HashSet<String>,
}

impl<W: Write> ArchiveWriter<W> {
    pub fn new(out: W) -> Self {
        Self {
            out: CountingWriter {
                inner: out,
                written: 0,
            },
            entries: Vec::new(),
            names: HashSet::new(),
        }
    }

    /// Bytes written so far.
    pub fn offset(&self) -> u64 {
        self.out.written
    }

    pub fn entries(&self) -> &[FileHeader] {
        &self.entries
    }

    fn begin(&mut self, header: &mut FileHeader) -> io::Result<()> {
        assert!(
            self.names.insert(header.name.clone()),
            "duplicate archive entry {:?}",
            header.name
        );
        header.offset = self.out.written;
        header.extra = strip_zip64_extra(&header.extra);
        self.out.write_all(&encode_local_header(header))
    }

    fn end(&mut self, mut header: FileHeader) -> io::Result<()> {
        header.finalize_versions();
        self.out.write_all(&encode_data_descriptor(&header))?;
        self.entries.push(header);
        Ok(())
    }

    /// Starts an entry whose CRC and uncompressed size are already set in
    /// `header`. Bytes written to the returned writer are the payload exactly
    /// as stored; the compressed size is counted from them.
    pub fn create_compressed_header(
        &mut self,
        mut header: FileHeader,
    ) -> io::Result<CompressedEntryWriter<'_, W>> {
        self.begin(&mut header)?;
        Ok(CompressedEntryWriter {
            archive: self,
            header,
            written: 0,
        })
    }

    /// Copies an entry verbatim from another archive. `header` carries the
    /// source CRC, method and sizes; `payload` yields exactly
    /// `compressed_size` raw bytes.
    pub fn copy_raw<R: Read>(&mut self, mut header: FileHeader, payload: R) -> io::Result<()> {
        self.begin(&mut header)?;
        let expected = header.compressed_size;
        let copied = io::copy(&mut payload.take(expected), &mut self.out)?;
        if copied != expected {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!(
                    "{}: payload ended after {copied} of {expected} bytes",
                    header.name
                ),
            ));
        }
        self.end(header)
    }

    /// Writes the central directory and end records, returning the sink.
    pub fn close(mut self) -> io::Result<W> {
        let start = self.out.written;
        let mut any_zip64 = false;
        for header in &self.entries {
            any_zip64 |= header.is_zip64();
            self.out.write_all(&encode_central_header(header))?;
        }
        let size = self.out.written - start;
        let end = encode_end_records(self.entries.len() as u64, size, start, any_zip64);
        self.out.write_all(&end)?;
        self.out.flush()?;
        Ok(self.out.inner)
    }
}

/// Payload writer for one entry. Call [`finish`](Self::finish) to write the
/// data descriptor and record the entry.
pub struct CompressedEntryWriter<'a, W: Write> {
    archive: &'a mut ArchiveWriter<W>,
    header: FileHeader,
    written: u64,
}

impl<W: Write> Write for CompressedEntryWriter<'_, W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.archive.out.write(buf)?;
        self.written += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.archive.out.flush()
    }
}

impl<W: Write> CompressedEntryWriter<'_, W> {
    pub fn finish(self) -> io::Result<()> {
        let mut header = self.header;
        header.compressed_size = self.written;
        self.archive.end(header)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archive::deflate::{compress_block, crc32};
    use crate::archive::format::{Method, S_IFDIR};
    use flate2::Compression;
    use std::io::Cursor;

    fn stored(name: &str, data: &[u8]) -> FileHeader {
        let mut h = FileHeader::new(name, Method::Stored);
        h.crc32 = crc32(data);
        h.uncompressed_size = data.len() as u64;
        h
    }

    #[test]
    fn readable_by_zip_crate() {
        let mut writer = ArchiveWriter::new(Vec::new());

        let mut dir = FileHeader::new("docs/", Method::Stored);
        dir.set_mode(S_IFDIR | 0o755);
        writer.create_compressed_header(dir).unwrap().finish().unwrap();

        let mut entry = writer
            .create_compressed_header(stored("docs/readme.txt", b"hello"))
            .unwrap();
        entry.write_all(b"hello").unwrap();
        entry.finish().unwrap();

        let text = b"deflate me deflate me deflate me".repeat(10);
        let compressed = compress_block(&text, None, Compression::default(), true).unwrap();
        let mut h = FileHeader::new("docs/long.txt", Method::Deflated);
        h.crc32 = crc32(&text);
        h.uncompressed_size = text.len() as u64;
        let mut entry = writer.create_compressed_header(h).unwrap();
        entry.write_all(&compressed).unwrap();
        entry.finish().unwrap();

        assert_eq!(writer.entries()[2].compressed_size, compressed.len() as u64);
        let bytes = writer.close().unwrap();

        let mut zip = zip::ZipArchive::new(Cursor::new(bytes)).unwrap();
        assert_eq!(zip.len(), 3);
        assert!(zip.by_index(0).unwrap().is_dir());

        let mut out = String::new();
        zip.by_name("docs/readme.txt")
            .unwrap()
            .read_to_string(&mut out)
            .unwrap();
        assert_eq!(out, "hello");

        let mut long = Vec::new();
        zip.by_name("docs/long.txt")
            .unwrap()
            .read_to_end(&mut long)
            .unwrap();
        assert_eq!(long, text);
    }

    #[test]
    fn copy_raw_strips_zip64_extra_and_writes_descriptor() {
        let mut writer = ArchiveWriter::new(Vec::new());
        let mut h = stored("a", b"abc");
        h.compressed_size = 3;
        h.extra = vec![0x01, 0x00, 0x08, 0x00, 0, 0, 0, 0, 0, 0, 0, 0];
        writer.copy_raw(h, &b"abcTRAILING"[..]).unwrap();
        assert!(writer.entries()[0].extra.is_empty());
        let after = writer.offset();
        // local header + name + payload + 16-byte descriptor
        assert_eq!(after, 30 + 1 + 3 + 16);
    }

    #[test]
    fn copy_raw_reports_short_payload() {
        let mut writer = ArchiveWriter::new(Vec::new());
        let mut h = stored("a", b"abcdef");
        h.compressed_size = 6;
        let err = writer.copy_raw(h, &b"abc"[..]).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
    }

    #[test]
    #[should_panic(expected = "duplicate archive entry")]
    fn duplicate_names_panic() {
        let mut writer = ArchiveWriter::new(Vec::new());
        writer
            .create_compressed_header(stored("x", b""))
            .unwrap()
            .finish()
            .unwrap();
        let _ = writer.create_compressed_header(stored("x", b""));
    }
}
