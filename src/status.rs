//! Compact progress and failure reporting for the multi-product driver.
//!
//! On a terminal every completion overwrites the previous progress line; on
//! anything else each completion is its own line. Failures are always
//! printed in full, with the tail of the product's log.

use std::fs;
use std::io::{self, Write};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use crate::util::{is_terminal, strip_ansi, term_width};

pub const ERROR_LEADING_LINES: usize = 20;
pub const ERROR_TRAILING_LINES: usize = 20;

type WidthQuery = Box<dyn Fn() -> Option<usize> + Send>;

struct State {
    out: Box<dyn Write + Send>,
    smart: bool,
    width: WidthQuery,
    total: usize,
    done: usize,
    failed: usize,
    // A progress line is on screen without its newline.
    line_pending: bool,
}

pub struct Status {
    state: Mutex<State>,
}

impl Status {
    /// Status on stdout, in terminal mode when stdout is a TTY.
    pub fn stdout() -> Self {
        let smart = is_terminal(&io::stdout());
        Self::new(
            Box::new(io::stdout()),
            smart,
            Box::new(|| term_width(&io::stdout())),
        )
    }

    pub fn new(out: Box<dyn Write + Send>, smart: bool, width: WidthQuery) -> Self {
        Self {
            state: Mutex::new(State {
                out,
                smart,
                width,
                total: 0,
                done: 0,
                failed: 0,
                line_pending: false,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn set_total(&self, total: usize) {
        self.lock().total = total;
    }

    pub fn finish(&self, product: &str) {
        let mut state = self.lock();
        finish_locked(&mut state, product);
    }

    /// Reports `product` as failed, echoing `log` if one is given.
    pub fn fail(&self, product: &str, err: &anyhow::Error, log: Option<&Path>) {
        let mut state = self.lock();
        finish_locked(&mut state, product);

        if state.line_pending {
            let _ = writeln!(state.out);
            state.line_pending = false;
        }
        state.failed += 1;

        let _ = writeln!(state.out, "FAILED: {product}");
        let _ = writeln!(state.out, "error: {err:#}");

        if let Some(log) = log {
            if let Ok(mut data) = fs::read(log) {
                if !state.smart {
                    strip_ansi(&mut data);
                }
                let text = String::from_utf8_lossy(&data);
                for line in elide_middle(text.trim()) {
                    let _ = writeln!(state.out, "> {line}");
                }
            }
        }
        let _ = state.out.flush();
    }

    /// Ends any pending progress line and returns the number of failures.
    pub fn finished(&self) -> usize {
        let mut state = self.lock();
        if state.line_pending {
            let _ = writeln!(state.out);
            state.line_pending = false;
        }
        let _ = state.out.flush();
        state.failed
    }

    pub fn counts(&self) -> (usize, usize, usize) {
        let state = self.lock();
        (state.done, state.failed, state.total)
    }
}

fn finish_locked(state: &mut State, product: &str) {
    state.done += 1;
    let line = format!("[{}/{}] {}", state.done, state.total, product);

    if state.smart {
        let line = match (state.width)() {
            Some(width) => clip(&line, width),
            None => line.as_str(),
        };
        let _ = write!(state.out, "\r{line}\x1b[K");
        state.line_pending = true;
    } else {
        let _ = writeln!(state.out, "{line}");
    }
    let _ = state.out.flush();
}

fn clip(line: &str, width: usize) -> &str {
    match line.char_indices().nth(width) {
        Some((idx, _)) => &line[..idx],
        None => line,
    }
}

fn elide_middle(text: &str) -> Vec<String> {
    let lines: Vec<&str> = text.lines().collect();
    if lines.len() <= ERROR_LEADING_LINES + ERROR_TRAILING_LINES + 1 {
        return lines.into_iter().map(str::to_string).collect();
    }

    let skipped = lines.len() - ERROR_LEADING_LINES - ERROR_TRAILING_LINES;
    let mut out: Vec<String> = lines[..ERROR_LEADING_LINES]
        .iter()
        .map(|l| l.to_string())
        .collect();
    out.push(format!("... skipping {skipped} lines ..."));
    out.extend(
        lines[lines.len() - ERROR_TRAILING_LINES..]
            .iter()
            .map(|l| l.to_string()),
    );
    out
}
