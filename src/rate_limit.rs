//! Admission control over concurrent executions and in-flight buffer bytes.
//!
//! Work that produces a buffer asks for an [`ExecutionToken`] first. The
//! request blocks while either the execution count or the byte count is at
//! its cap. Finishing the token frees the execution slot and charges the
//! produced buffer's size; the consumer releases that charge once the buffer
//! has been written out.
//!
//! The byte cap is a soft limit. A request is admitted while the charge is
//! below the cap, and the buffer size is only known when the token finishes,
//! so the charge can exceed the cap by at most one buffer per concurrent
//! execution: `max_bytes + max_execs * largest buffer`.

use std::sync::{Arc, Condvar, Mutex, MutexGuard};

pub const DEFAULT_MAX_BYTES: i64 = 512 * 1024 * 1024;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LimiterSnapshot {
    pub executions: usize,
    pub bytes: i64,
    pub peak_executions: usize,
    pub peak_bytes: i64,
}

#[derive(Debug)]
struct State {
    executions: usize,
    bytes: i64,
    peak_executions: usize,
    peak_bytes: i64,
    closed: bool,
}

#[derive(Debug)]
struct Shared {
    max_execs: usize,
    max_bytes: i64,
    state: Mutex<State>,
    changed: Condvar,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, State> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn add_bytes(&self, state: &mut State, delta: i64) {
        state.bytes += delta;
        state.peak_bytes = state.peak_bytes.max(state.bytes);
        self.changed.notify_all();
    }
}

/// Cloneable handle; all clones share the same counters.
#[derive(Debug, Clone)]
pub struct RateLimiter {
    shared: Arc<Shared>,
}

impl RateLimiter {
    /// `max_execs` of zero selects the number of logical CPUs.
    pub fn new(max_execs: usize, max_bytes: i64) -> Self {
        let max_execs = if max_execs == 0 {
            default_max_execs()
        } else {
            max_execs
        };
        Self {
            shared: Arc::new(Shared {
                max_execs,
                max_bytes: max_bytes.max(1),
                state: Mutex::new(State {
                    executions: 0,
                    bytes: 0,
                    peak_executions: 0,
                    peak_bytes: 0,
                    closed: false,
                }),
                changed: Condvar::new(),
            }),
        }
    }

    pub fn max_execs(&self) -> usize {
        self.shared.max_execs
    }

    /// Blocks until both counters are below their caps.
    pub fn request_execution(&self) -> ExecutionToken {
        let shared = &self.shared;
        let mut state = shared
            .changed
            .wait_while(shared.lock(), |s| {
                !s.closed && (s.executions >= shared.max_execs || s.bytes >= shared.max_bytes)
            })
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        if state.closed {
            return ExecutionToken {
                shared: None,
                finished: true,
            };
        }

        state.executions += 1;
        state.peak_executions = state.peak_executions.max(state.executions);
        ExecutionToken {
            shared: Some(Arc::clone(&self.shared)),
            finished: false,
        }
    }

    /// Subtracts `bytes` from the in-flight charge. A negative value adds a
    /// charge up front for bytes produced without a token.
    pub fn release(&self, bytes: i64) {
        let mut state = self.shared.lock();
        self.shared.add_bytes(&mut state, -bytes);
    }

    /// Makes later requests return closed tokens immediately. Tokens already
    /// issued keep working.
    pub fn close(&self) {
        let mut state = self.shared.lock();
        state.closed = true;
        self.shared.changed.notify_all();
    }

    pub fn snapshot(&self) -> LimiterSnapshot {
        let state = self.shared.lock();
        LimiterSnapshot {
            executions: state.executions,
            bytes: state.bytes,
            peak_executions: state.peak_executions,
            peak_bytes: state.peak_bytes,
        }
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new(0, DEFAULT_MAX_BYTES)
    }
}

pub fn default_max_execs() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

/// Permit for one unit of concurrent work.
///
/// Dropping an unfinished token finishes it with no byte charge.
#[derive(Debug)]
#[must_use = "an execution token holds a slot until it is finished"]
pub struct ExecutionToken {
    shared: Option<Arc<Shared>>,
    finished: bool,
}

impl ExecutionToken {
    /// True for tokens handed out after the limiter was closed.
    pub fn is_closed(&self) -> bool {
        self.shared.is_none()
    }

    /// Frees the execution slot and charges `buffer_size` bytes until a
    /// matching [`RateLimiter::release`].
    pub fn finish(mut self, buffer_size: i64) {
        self.complete(buffer_size);
    }

    fn complete(&mut self, buffer_size: i64) {
        if self.finished {
            return;
        }
        self.finished = true;
        let Some(shared) = self.shared.as_ref() else {
            return;
        };
        let mut state = shared.lock();
        assert!(
            state.executions > 0,
            "rate limiter execution count underflow: finish without request"
        );
        state.executions -= 1;
        shared.add_bytes(&mut state, buffer_size);
    }
}

impl Drop for ExecutionToken {
    fn drop(&mut self) {
        self.complete(0);
    }
}
