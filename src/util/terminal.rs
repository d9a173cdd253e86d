//! Terminal detection and size queries.

use std::io::IsTerminal;
use std::os::unix::io::AsRawFd;

/// Returns true when `stream` refers to an interactive terminal.
pub fn is_terminal<F: IsTerminal>(stream: &F) -> bool {
    stream.is_terminal()
}

/// Column count of the terminal behind `stream`, or `None` when it is not a
/// terminal or the query fails.
pub fn term_width<F: AsRawFd>(stream: &F) -> Option<usize> {
    let mut size = libc::winsize {
        ws_row: 0,
        ws_col: 0,
        ws_xpixel: 0,
        ws_ypixel: 0,
    };
    // SAFETY: TIOCGWINSZ writes a winsize into the provided struct.
    let rc = unsafe { libc::ioctl(stream.as_raw_fd(), libc::TIOCGWINSZ, &mut size) };
    if rc != 0 || size.ws_col == 0 {
        return None;
    }
    Some(size.ws_col as usize)
}
