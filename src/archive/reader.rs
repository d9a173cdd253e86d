//! Entry index of archives used as copy sources.
//!
//! Central directory parsing is done by the `zip` crate; this module keeps
//! the metadata and payload offsets needed to copy entries verbatim.

use std::fs::File;
use std::io::{self, Read};
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use flate2::read::DeflateDecoder;
use zip::result::ZipError;
use zip::{CompressionMethod, ZipArchive};

use super::deflate::crc32;
use super::format::{strip_zip64_extra, DosTime, FileHeader, Method, S_IFDIR, S_IFREG};
use super::ArchiveError;

/// One entry of an opened archive.
#[derive(Debug, Clone)]
pub struct SourceEntry {
    pub header: FileHeader,
    /// Extra fields carried over to the copy, without ZIP64 records.
    pub local_extra: Vec<u8>,
    data_offset: u64,
}

impl SourceEntry {
    pub fn name(&self) -> &str {
        &self.header.name
    }
}

pub struct ArchiveReader {
    file: Arc<File>,
    path: PathBuf,
    entries: Vec<SourceEntry>,
}

fn from_zip(err: ZipError) -> ArchiveError {
    match err {
        ZipError::Io(err) => ArchiveError::Io(err),
        other => ArchiveError::Malformed(other.to_string()),
    }
}

impl ArchiveReader {
    pub fn open(path: &Path) -> Result<Self, ArchiveError> {
        let file = File::open(path).map_err(|source| ArchiveError::Open {
            path: path.to_path_buf(),
            source,
        })?;
        let mut archive = ZipArchive::new(&file).map_err(from_zip)?;
        let mut entries = Vec::with_capacity(archive.len());
        for index in 0..archive.len() {
            let entry = archive.by_index_raw(index).map_err(from_zip)?;
            let method = match entry.compression() {
                CompressionMethod::Stored => Method::Stored,
                CompressionMethod::Deflated => Method::Deflated,
                other => {
                    return Err(ArchiveError::Malformed(format!(
                        "{}: unsupported compression method {other:?}",
                        entry.name()
                    )))
                }
            };

            let mut header = FileHeader::new(entry.name(), method);
            let mode = entry.unix_mode().unwrap_or(if entry.is_dir() {
                S_IFDIR | 0o755
            } else {
                S_IFREG | 0o644
            });
            header.set_mode(mode);
            let modified = entry.last_modified();
            header.modified = DosTime {
                date: modified.datepart(),
                time: modified.timepart(),
            };
            header.crc32 = entry.crc32();
            header.compressed_size = entry.compressed_size();
            header.uncompressed_size = entry.size();
            header.offset = entry.header_start();
            header.extra = strip_zip64_extra(entry.extra_data());
            header.finalize_versions();

            let data_offset = entry.data_start();
            entries.push(SourceEntry {
                local_extra: header.extra.clone(),
                header,
                data_offset,
            });
        }
        drop(archive);

        Ok(Self {
            file: Arc::new(file),
            path: path.to_path_buf(),
            entries,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn entries(&self) -> &[SourceEntry] {
        &self.entries
    }

    pub fn find(&self, name: &str) -> Option<&SourceEntry> {
        self.entries.iter().find(|e| e.header.name == name)
    }

    /// Stored payload of `entry`, still compressed.
    pub fn raw_payload(&self, entry: &SourceEntry) -> RawPayload {
        RawPayload {
            file: Arc::clone(&self.file),
            pos: entry.data_offset,
            end: entry.data_offset + entry.header.compressed_size,
        }
    }

    /// Decompressed contents of `entry`, checked against its CRC.
    pub fn open_entry(&self, entry: &SourceEntry) -> Result<Vec<u8>, ArchiveError> {
        let raw = self.raw_payload(entry);
        let mut data = Vec::with_capacity(entry.header.uncompressed_size as usize);
        match entry.header.method {
            Method::Stored => {
                let mut raw = raw;
                raw.read_to_end(&mut data)?;
            }
            Method::Deflated => {
                DeflateDecoder::new(raw).read_to_end(&mut data)?;
            }
        }
        let actual = crc32(&data);
        if actual != entry.header.crc32 {
            return Err(ArchiveError::CrcMismatch {
                name: entry.header.name.clone(),
                expected: entry.header.crc32,
                actual,
            });
        }
        Ok(data)
    }
}

/// Positional reader over one entry's payload; shares the archive's file
/// handle.
pub struct RawPayload {
    file: Arc<File>,
    pos: u64,
    end: u64,
}

impl Read for RawPayload {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = (buf.len() as u64).min(self.end - self.pos) as usize;
        if n == 0 {
            return Ok(0);
        }
        let n = self.file.read_at(&mut buf[..n], self.pos)?;
        if n == 0 {
            return Err(io::Error::from(io::ErrorKind::UnexpectedEof));
        }
        self.pos += n as u64;
        Ok(n)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::TempDir;
    use zip::write::FileOptions;

    fn write_with_zip_crate(path: &Path) {
        let file = File::create(path).unwrap();
        let mut zip = zip::ZipWriter::new(file);
        zip.add_directory("dir/", FileOptions::default()).unwrap();
        zip.start_file(
            "dir/stored.txt",
            FileOptions::default().compression_method(zip::CompressionMethod::Stored),
        )
        .unwrap();
        zip.write_all(b"plain").unwrap();
        zip.start_file("dir/deflated.txt", FileOptions::default())
            .unwrap();
        zip.write_all(&b"squeeze ".repeat(100)).unwrap();
        zip.finish().unwrap();
    }

    #[test]
    fn reads_foreign_archive() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("in.zip");
        write_with_zip_crate(&path);

        let reader = ArchiveReader::open(&path).unwrap();
        let names: Vec<&str> = reader.entries().iter().map(SourceEntry::name).collect();
        assert_eq!(names, ["dir/", "dir/stored.txt", "dir/deflated.txt"]);

        let stored = reader.find("dir/stored.txt").unwrap();
        assert_eq!(stored.header.method, Method::Stored);
        assert_eq!(reader.open_entry(stored).unwrap(), b"plain");

        let deflated = reader.find("dir/deflated.txt").unwrap();
        assert_eq!(deflated.header.method, Method::Deflated);
        assert!(deflated.header.compressed_size < deflated.header.uncompressed_size);
        assert_eq!(reader.open_entry(deflated).unwrap(), b"squeeze ".repeat(100));

        let mut raw = Vec::new();
        reader
            .raw_payload(deflated)
            .read_to_end(&mut raw)
            .unwrap();
        assert_eq!(raw.len() as u64, deflated.header.compressed_size);
    }

    #[test]
    fn keeps_mode_and_timestamp_of_foreign_entries() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("in.zip");
        let modified = zip::DateTime::from_date_and_time(2020, 5, 17, 10, 30, 20).unwrap();
        let mut zip = zip::ZipWriter::new(File::create(&path).unwrap());
        zip.start_file(
            "bin/tool",
            FileOptions::default()
                .unix_permissions(0o755)
                .last_modified_time(modified),
        )
        .unwrap();
        zip.write_all(b"#!/bin/sh\n").unwrap();
        zip.finish().unwrap();

        let reader = ArchiveReader::open(&path).unwrap();
        let tool = reader.find("bin/tool").unwrap();
        assert_eq!(tool.header.mode(), S_IFREG | 0o755);
        assert_eq!(
            tool.header.modified,
            DosTime {
                date: modified.datepart(),
                time: modified.timepart(),
            }
        );
        assert_eq!(tool.header.offset, 0);
        assert!(tool.data_offset > tool.header.offset);
        assert_eq!(reader.open_entry(tool).unwrap(), b"#!/bin/sh\n");
    }

    #[test]
    fn rejects_garbage() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("bad.zip");
        std::fs::write(&path, vec![0u8; 100]).unwrap();
        assert!(matches!(
            ArchiveReader::open(&path),
            Err(ArchiveError::Malformed(_))
        ));
        assert!(matches!(
            ArchiveReader::open(&tmp.path().join("missing.zip")),
            Err(ArchiveError::Open { .. })
        ));
    }
}
