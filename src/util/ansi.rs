//! Removal of `ESC [ ... letter` control sequences from captured output.

const ESC: u8 = 0x1b;

/// Strips CSI control sequences from `buf` in place.
///
/// A sequence starts with `ESC [` and ends at the first ASCII letter. A
/// sequence still open at the end of the buffer is kept as-is, and an `ESC`
/// that is not followed by `[` is ordinary data.
pub fn strip_ansi(buf: &mut Vec<u8>) {
    let mut read = 0;
    let mut write = 0;

    while read < buf.len() {
        if buf[read] == ESC && buf.get(read + 1) == Some(&b'[') {
            let end = buf[read + 2..]
                .iter()
                .position(|b| b.is_ascii_alphabetic())
                .map(|pos| read + 2 + pos);
            match end {
                Some(end) => {
                    read = end + 1;
                    continue;
                }
                None => {
                    // Unterminated: copy the tail through untouched.
                    while read < buf.len() {
                        buf[write] = buf[read];
                        write += 1;
                        read += 1;
                    }
                    break;
                }
            }
        }
        buf[write] = buf[read];
        write += 1;
        read += 1;
    }

    buf.truncate(write);
}
