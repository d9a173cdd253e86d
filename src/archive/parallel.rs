//! Ordered, rate-limited archive assembly.
//!
//! Every submitted entry becomes a single-use channel (an entry future) that
//! the sink thread waits on in submission order. Workers fill the futures;
//! the sink writes each payload and then releases its byte charge on the
//! limiter. The first failure travels through its future to the sink, which
//! stops, closes the limiter and makes outstanding workers give up.

use std::collections::HashSet;
use std::fs::{self, File};
use std::io::{self, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, SyncSender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use flate2::{Compression, Crc};

use super::deflate::{compress_block, crc32, BLOCK_SIZE, MIN_PARALLEL_FILE_SIZE, WINDOW_SIZE};
use super::format::{DosTime, FileHeader, Method, S_IFDIR, S_IFLNK, S_IFREG};
use super::reader::{ArchiveReader, SourceEntry};
use super::source::EntrySource;
use super::writer::ArchiveWriter;
use super::ArchiveError;
use crate::rate_limit::{RateLimiter, DEFAULT_MAX_BYTES};

pub const DEFAULT_LEVEL: u32 = 5;
const QUEUE_DEPTH: usize = 1000;
const CRC_CHUNK: usize = 64 << 10;

type BlockFuture = Receiver<Result<Vec<u8>, ArchiveError>>;
type EntryFuture = Receiver<Result<ReadyEntry, ArchiveError>>;

enum Payload {
    Empty,
    /// In-memory payload and the byte charge to release once written.
    Buffer { data: Vec<u8>, charge: i64 },
    /// Payload streamed as-is, uncharged.
    Stream(Box<dyn Read + Send>),
    /// Deflate blocks in order; each block is charged its own length.
    Blocks(Receiver<BlockFuture>),
    /// Raw bytes of an entry copied from another archive.
    Copy(Box<dyn Read + Send>),
}

struct ReadyEntry {
    header: FileHeader,
    payload: Payload,
}

fn ready(entry: ReadyEntry) -> EntryFuture {
    let (tx, rx) = mpsc::sync_channel(1);
    let _ = tx.send(Ok(entry));
    rx
}

#[derive(Debug, Clone)]
pub struct ZipOptions {
    /// Concurrent compression jobs; zero selects the CPU count.
    pub parallelism: usize,
    /// Budget for compressed bytes held in memory.
    pub max_memory: i64,
    pub level: Compression,
    /// Emit every missing ancestor directory before an entry.
    pub emit_directories: bool,
    /// Modification time given to every new entry.
    pub timestamp: DosTime,
}

impl Default for ZipOptions {
    fn default() -> Self {
        Self {
            parallelism: 0,
            max_memory: DEFAULT_MAX_BYTES,
            level: Compression::new(DEFAULT_LEVEL),
            emit_directories: false,
            timestamp: DosTime::DEFAULT,
        }
    }
}

pub struct FileEntry {
    pub name: String,
    pub source: EntrySource,
    pub method: Method,
    pub mode: u32,
}

impl FileEntry {
    pub fn new(name: impl Into<String>, source: EntrySource) -> Self {
        Self {
            name: name.into(),
            source,
            method: Method::Deflated,
            mode: S_IFREG | 0o644,
        }
    }

    pub fn method(mut self, method: Method) -> Self {
        self.method = method;
        self
    }

    /// Permission bits; the regular-file type bits are added.
    pub fn permissions(mut self, perm: u32) -> Self {
        self.mode = S_IFREG | (perm & 0o7777);
        self
    }
}

pub struct ParallelZip {
    path: PathBuf,
    options: ZipOptions,
    limiter: RateLimiter,
    aborted: Arc<AtomicBool>,
    ops: Option<SyncSender<EntryFuture>>,
    sink: Option<JoinHandle<Result<(), ArchiveError>>>,
    names: HashSet<String>,
    directories: DirectoryTracker,
}

/// Directories already written to an archive.
#[derive(Debug, Default)]
pub struct DirectoryTracker {
    seen: HashSet<String>,
}

impl DirectoryTracker {
    /// Records `dir` (ending in `/`). False if it was recorded before.
    pub fn insert(&mut self, dir: &str) -> bool {
        self.seen.insert(dir.to_string())
    }

    /// Ancestors of `name` not yet recorded, root first. They are recorded
    /// as a side effect.
    pub fn missing_ancestors(&mut self, name: &str) -> Vec<String> {
        let trimmed = name.trim_end_matches('/');
        trimmed
            .match_indices('/')
            .map(|(idx, _)| &trimmed[..=idx])
            .filter(|dir| self.seen.insert(dir.to_string()))
            .map(str::to_string)
            .collect()
    }
}

impl ParallelZip {
    pub fn create(path: &Path, options: ZipOptions) -> Result<Self, ArchiveError> {
        let file = File::create(path).map_err(|source| ArchiveError::Create {
            path: path.to_path_buf(),
            source,
        })?;
        let limiter = RateLimiter::new(options.parallelism, options.max_memory);
        let aborted = Arc::new(AtomicBool::new(false));
        let (ops_tx, ops_rx) = mpsc::sync_channel(QUEUE_DEPTH);

        let sink = {
            let limiter = limiter.clone();
            let aborted = Arc::clone(&aborted);
            let archive = ArchiveWriter::new(BufWriter::new(file));
            thread::Builder::new()
                .name("zip-sink".to_string())
                .spawn(move || run_sink(archive, ops_rx, limiter, aborted))?
        };

        Ok(Self {
            path: path.to_path_buf(),
            options,
            limiter,
            aborted,
            ops: Some(ops_tx),
            sink: Some(sink),
            names: HashSet::new(),
            directories: DirectoryTracker::default(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn limiter(&self) -> &RateLimiter {
        &self.limiter
    }

    pub fn add_file(&mut self, entry: FileEntry) -> Result<(), ArchiveError> {
        self.claim_name(&entry.name)?;

        let mut header = FileHeader::new(entry.name, entry.method);
        header.modified = self.options.timestamp;
        header.set_mode(entry.mode);
        header.uncompressed_size = entry.source.len();

        let future = match entry.method {
            Method::Deflated if entry.source.len() >= MIN_PARALLEL_FILE_SIZE => {
                return self.add_blocks(header, entry.source);
            }
            Method::Deflated => self.spawn_whole(header, entry.source),
            Method::Stored => self.spawn_stored(header, entry.source),
        };
        self.submit(future)
    }

    /// Adds a directory entry. Repeated directories are written once.
    pub fn add_directory(&mut self, name: &str) -> Result<(), ArchiveError> {
        let name = if name.ends_with('/') {
            name.to_string()
        } else {
            format!("{name}/")
        };
        check_name(&name)?;
        self.emit_parents(&name)?;
        if !self.directories.insert(&name) {
            return Ok(());
        }
        let mut header = FileHeader::new(name, Method::Stored);
        header.modified = self.options.timestamp;
        header.set_mode(S_IFDIR | 0o755);
        self.submit(ready(ReadyEntry {
            header,
            payload: Payload::Empty,
        }))
    }

    pub fn add_symlink(&mut self, name: &str, target: &str) -> Result<(), ArchiveError> {
        self.claim_name(name)?;
        let mut header = FileHeader::new(name, Method::Stored);
        header.modified = self.options.timestamp;
        header.set_mode(S_IFLNK | 0o777);
        header.crc32 = crc32(target.as_bytes());
        header.uncompressed_size = target.len() as u64;
        self.submit(ready(ReadyEntry {
            header,
            payload: Payload::Buffer {
                data: target.as_bytes().to_vec(),
                charge: 0,
            },
        }))
    }

    /// Copies `entry` from `reader` without recompressing it, optionally
    /// under a new name.
    pub fn copy_from(
        &mut self,
        reader: &ArchiveReader,
        entry: &SourceEntry,
        rename: Option<&str>,
    ) -> Result<(), ArchiveError> {
        let name = rename.unwrap_or(entry.name());
        if name.ends_with('/') {
            check_name(name)?;
            self.emit_parents(name)?;
            if !self.directories.insert(name) {
                return Ok(());
            }
        } else {
            self.claim_name(name)?;
        }

        let mut header = entry.header.clone();
        header.name = name.to_string();
        header.extra = entry.local_extra.clone();
        self.submit(ready(ReadyEntry {
            header,
            payload: Payload::Copy(Box::new(reader.raw_payload(entry))),
        }))
    }

    /// Waits for every entry to be written and closes the archive. On any
    /// failure the partial output is removed.
    pub fn finish(mut self) -> Result<(), ArchiveError> {
        drop(self.ops.take());
        let result = self.join_sink();
        if result.is_err() {
            let _ = fs::remove_file(&self.path);
        }
        result
    }

    fn join_sink(&mut self) -> Result<(), ArchiveError> {
        match self.sink.take() {
            Some(handle) => handle.join().unwrap_or(Err(ArchiveError::WorkerLost)),
            None => Err(ArchiveError::Aborted),
        }
    }

    fn abandon(&mut self) {
        self.aborted.store(true, Ordering::SeqCst);
        self.limiter.close();
        drop(self.ops.take());
        let _ = self.join_sink();
        let _ = fs::remove_file(&self.path);
    }

    fn submit(&mut self, future: EntryFuture) -> Result<(), ArchiveError> {
        if let Some(ops) = &self.ops {
            if ops.send(future).is_ok() {
                return Ok(());
            }
        }
        // The sink is gone; surface its error.
        self.ops = None;
        let err = match self.join_sink() {
            Err(err) => err,
            Ok(()) => ArchiveError::Aborted,
        };
        let _ = fs::remove_file(&self.path);
        Err(err)
    }

    fn claim_name(&mut self, name: &str) -> Result<(), ArchiveError> {
        check_name(name)?;
        if name.ends_with('/') {
            return Err(ArchiveError::InvalidName(name.to_string()));
        }
        if !self.names.insert(name.to_string()) {
            return Err(ArchiveError::DuplicateEntry(name.to_string()));
        }
        self.emit_parents(name)
    }

    fn emit_parents(&mut self, name: &str) -> Result<(), ArchiveError> {
        if !self.options.emit_directories {
            return Ok(());
        }
        for dir in self.directories.missing_ancestors(name) {
            let mut header = FileHeader::new(dir, Method::Stored);
            header.modified = self.options.timestamp;
            header.set_mode(S_IFDIR | 0o755);
            self.submit(ready(ReadyEntry {
                header,
                payload: Payload::Empty,
            }))?;
        }
        Ok(())
    }

    fn spawn_stored(&self, mut header: FileHeader, source: EntrySource) -> EntryFuture {
        let (tx, rx) = mpsc::sync_channel(1);
        let token = self.limiter.request_execution();
        let aborted = Arc::clone(&self.aborted);
        thread::spawn(move || {
            if aborted.load(Ordering::SeqCst) {
                return;
            }
            let result = stream_crc(&source).map(|crc| {
                header.crc32 = crc;
                ReadyEntry {
                    header,
                    payload: Payload::Stream(Box::new(source.reader())),
                }
            });
            token.finish(0);
            let _ = tx.send(result);
        });
        rx
    }

    fn spawn_whole(&self, mut header: FileHeader, source: EntrySource) -> EntryFuture {
        let (tx, rx) = mpsc::sync_channel(1);
        let token = self.limiter.request_execution();
        let aborted = Arc::clone(&self.aborted);
        let limiter = self.limiter.clone();
        let level = self.options.level;
        thread::spawn(move || {
            if aborted.load(Ordering::SeqCst) {
                return;
            }
            let result = source.read_range(0, source.len()).map_err(ArchiveError::from).and_then(
                |data| {
                    let compressed = compress_block(&data, None, level, true)?;
                    Ok((data, compressed))
                },
            );
            let (data, compressed) = match result {
                Ok(pair) => pair,
                Err(err) => {
                    drop(token);
                    let _ = tx.send(Err(err));
                    return;
                }
            };

            header.crc32 = crc32(&data);
            let charge = compressed.len() as i64;
            let data = if compressed.len() < data.len() {
                compressed
            } else {
                header.method = Method::Stored;
                data
            };
            token.finish(charge);
            let entry = ReadyEntry {
                header,
                payload: Payload::Buffer { data, charge },
            };
            if tx.send(Ok(entry)).is_err() {
                limiter.release(charge);
            }
        });
        rx
    }

    fn add_blocks(&mut self, mut header: FileHeader, source: EntrySource) -> Result<(), ArchiveError> {
        let (entry_tx, entry_rx) = mpsc::sync_channel(1);
        self.submit(entry_rx)?;

        let (blocks_tx, blocks_rx) = mpsc::channel::<BlockFuture>();
        let crc_token = self.limiter.request_execution();
        {
            let source = source.clone();
            let aborted = Arc::clone(&self.aborted);
            thread::spawn(move || {
                if aborted.load(Ordering::SeqCst) {
                    return;
                }
                let result = stream_crc(&source);
                crc_token.finish(0);
                let entry = result.map(|crc| {
                    header.crc32 = crc;
                    ReadyEntry {
                        header,
                        payload: Payload::Blocks(blocks_rx),
                    }
                });
                let _ = entry_tx.send(entry);
            });
        }

        let len = source.len();
        let mut start = 0;
        while start < len {
            let end = (start + BLOCK_SIZE).min(len);
            let (block_tx, block_rx) = mpsc::sync_channel(1);
            if blocks_tx.send(block_rx).is_err() {
                break;
            }
            let token = self.limiter.request_execution();
            if token.is_closed() || self.aborted.load(Ordering::SeqCst) {
                break;
            }

            let source = source.clone();
            let limiter = self.limiter.clone();
            let level = self.options.level;
            thread::spawn(move || {
                let result = compress_range(&source, start, end, level);
                match result {
                    Ok(data) => {
                        let charge = data.len() as i64;
                        token.finish(charge);
                        if block_tx.send(Ok(data)).is_err() {
                            limiter.release(charge);
                        }
                    }
                    Err(err) => {
                        drop(token);
                        let _ = block_tx.send(Err(err));
                    }
                }
            });
            start = end;
        }
        Ok(())
    }
}

/// A writer dropped without [`ParallelZip::finish`] leaves no archive
/// behind.
impl Drop for ParallelZip {
    fn drop(&mut self) {
        if self.sink.is_some() {
            tracing::debug!("{} abandoned before finish", self.path.display());
            self.abandon();
        }
    }
}

fn check_name(name: &str) -> Result<(), ArchiveError> {
    if name.is_empty() || name.starts_with('/') || name.len() > u16::MAX as usize {
        return Err(ArchiveError::InvalidName(name.to_string()));
    }
    Ok(())
}

fn stream_crc(source: &EntrySource) -> Result<u32, ArchiveError> {
    let mut crc = Crc::new();
    let mut reader = source.reader();
    let mut buf = vec![0; CRC_CHUNK];
    loop {
        let n = reader.read(&mut buf)?;
        if n == 0 {
            return Ok(crc.sum());
        }
        crc.update(&buf[..n]);
    }
}

fn compress_range(
    source: &EntrySource,
    start: u64,
    end: u64,
    level: Compression,
) -> Result<Vec<u8>, ArchiveError> {
    let data = source.read_range(start, end - start)?;
    let dictionary = if start > 0 {
        let from = start.saturating_sub(WINDOW_SIZE);
        Some(source.read_range(from, start - from)?)
    } else {
        None
    };
    compress_block(&data, dictionary.as_deref(), level, end == source.len())
}

fn run_sink<W: Write>(
    mut archive: ArchiveWriter<BufWriter<W>>,
    ops: Receiver<EntryFuture>,
    limiter: RateLimiter,
    aborted: Arc<AtomicBool>,
) -> Result<(), ArchiveError> {
    let result = ops.iter().try_for_each(|future| {
        if aborted.load(Ordering::SeqCst) {
            return Err(ArchiveError::Aborted);
        }
        let entry = future.recv().map_err(|_| ArchiveError::WorkerLost)??;
        write_entry(&mut archive, entry, &limiter)
    });
    // An abandoned writer must not produce a complete-looking archive.
    let result = result.and_then(|()| {
        if aborted.load(Ordering::SeqCst) {
            Err(ArchiveError::Aborted)
        } else {
            Ok(())
        }
    });
    if let Err(err) = result {
        aborted.store(true, Ordering::SeqCst);
        limiter.close();
        tracing::debug!("archive sink stopped: {err}");
        return Err(err);
    }

    let out = archive.close()?;
    out.into_inner().map_err(|err| err.into_error())?;
    Ok(())
}

fn write_entry<W: Write>(
    archive: &mut ArchiveWriter<W>,
    entry: ReadyEntry,
    limiter: &RateLimiter,
) -> Result<(), ArchiveError> {
    match entry.payload {
        Payload::Empty => archive.create_compressed_header(entry.header)?.finish()?,
        Payload::Buffer { data, charge } => {
            let mut writer = archive.create_compressed_header(entry.header)?;
            writer.write_all(&data)?;
            writer.finish()?;
            limiter.release(charge);
        }
        Payload::Stream(mut reader) => {
            let mut writer = archive.create_compressed_header(entry.header)?;
            io::copy(&mut reader, &mut writer)?;
            writer.finish()?;
        }
        Payload::Blocks(blocks) => {
            let mut writer = archive.create_compressed_header(entry.header)?;
            for block in blocks.iter() {
                let data = block.recv().map_err(|_| ArchiveError::WorkerLost)??;
                writer.write_all(&data)?;
                limiter.release(data.len() as i64);
            }
            writer.finish()?;
        }
        Payload::Copy(reader) => archive.copy_raw(entry.header, reader)?,
    }
    Ok(())
}
