//! Small helpers shared by the status display and terminal-aware diagnostics.

pub mod ansi;
pub mod strings;
pub mod terminal;

pub use ansi::strip_ansi;
pub use strings::{in_list, parse_duration, split_key_value};
pub use terminal::{is_terminal, term_width};
