//! Raw deflate helpers for whole-file and block-parallel compression.
//!
//! A large file is cut into fixed-size blocks. Every block except the last
//! ends with a sync flush so the compressed pieces concatenate into one
//! stream, and every block after the first is primed with the preceding
//! window of input so back-references across the seam stay valid.

use flate2::{Compress, Compression, Crc, FlushCompress, Status};

use super::ArchiveError;

pub const BLOCK_SIZE: u64 = 1 << 20;
pub const WINDOW_SIZE: u64 = 32 << 10;
/// Deflated files at least this large are compressed block-parallel.
pub const MIN_PARALLEL_FILE_SIZE: u64 = 6 * BLOCK_SIZE;

pub fn crc32(data: &[u8]) -> u32 {
    let mut crc = Crc::new();
    crc.update(data);
    crc.sum()
}

/// Compresses one block to raw deflate. `last` terminates the stream;
/// otherwise the output ends on a byte boundary after a sync flush.
pub fn compress_block(
    data: &[u8],
    dictionary: Option<&[u8]>,
    level: Compression,
    last: bool,
) -> Result<Vec<u8>, ArchiveError> {
    let mut compressor = Compress::new(level, false);
    if let Some(dictionary) = dictionary {
        compressor
            .set_dictionary(dictionary)
            .map_err(|err| ArchiveError::Compress(err.to_string()))?;
    }

    let flush = if last {
        FlushCompress::Finish
    } else {
        FlushCompress::Sync
    };
    let mut out = Vec::with_capacity(data.len() + data.len() / 8 + 64);
    loop {
        if out.capacity() - out.len() < 64 {
            out.reserve(out.capacity().max(4096));
        }
        let consumed = compressor.total_in() as usize;
        let status = compressor
            .compress_vec(&data[consumed..], &mut out, flush)
            .map_err(|err| ArchiveError::Compress(err.to_string()))?;
        let input_done = compressor.total_in() as usize == data.len();
        let room_left = out.len() < out.capacity();
        match status {
            Status::StreamEnd => break,
            Status::Ok | Status::BufError if !last && input_done && room_left => break,
            Status::Ok | Status::BufError => {}
        }
    }
    Ok(out)
}
