//! Bridge from termination signals to a bounded, three-phase shutdown.
//!
//! The first signal starts a timer. When it expires (or as soon as another
//! signal arrives) the caller's `cancel` runs; one phase later `cleanup`
//! runs; one more phase later the process aborts. Shutdown therefore takes
//! at most three phases no matter how stuck child processes are.

use std::fmt;
use std::io;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

pub const DEFAULT_PHASE: Duration = Duration::from_secs(2);

const WATCHED: [libc::c_int; 4] = [libc::SIGINT, libc::SIGHUP, libc::SIGQUIT, libc::SIGTERM];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    Interrupt,
    Hangup,
    Quit,
    Terminate,
}

impl Signal {
    fn from_raw(signo: libc::c_int) -> Option<Self> {
        match signo {
            libc::SIGINT => Some(Self::Interrupt),
            libc::SIGHUP => Some(Self::Hangup),
            libc::SIGQUIT => Some(Self::Quit),
            libc::SIGTERM => Some(Self::Terminate),
            _ => None,
        }
    }
}

impl fmt::Display for Signal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Interrupt => "interrupt",
            Self::Hangup => "hangup",
            Self::Quit => "quit",
            Self::Terminate => "terminated",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Soft,
    Medium,
    Hard,
}

/// Outcome of one wait on a [`SignalSource`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Received {
    Signal(Signal),
    TimedOut,
    /// The source can never deliver another signal.
    Closed,
}

pub trait SignalSource: Send + 'static {
    /// Waits for the next signal, forever when `timeout` is `None`.
    fn next(&mut self, timeout: Option<Duration>) -> Received;
}

/// Phase length and the action taken when the last phase expires.
pub struct Timeline {
    pub phase: Duration,
    pub hard_stop: Box<dyn FnOnce() + Send>,
}

impl Default for Timeline {
    fn default() -> Self {
        Self {
            phase: DEFAULT_PHASE,
            hard_stop: Box::new(abort_with_backtrace),
        }
    }
}

fn abort_with_backtrace() {
    let backtrace = std::backtrace::Backtrace::force_capture();
    tracing::error!("shutdown did not finish in time; aborting\n{backtrace}");
    std::process::abort();
}

/// Background thread running the shutdown timeline.
pub struct SignalBridge {
    handle: JoinHandle<()>,
}

impl SignalBridge {
    /// Watches SIGINT, SIGHUP, SIGQUIT and SIGTERM.
    ///
    /// Blocks those signals on the calling thread, so call it before any other
    /// thread is spawned; threads inherit the mask and the bridge becomes the
    /// only receiver.
    pub fn install<C, L>(cancel: C, cleanup: L) -> io::Result<Self>
    where
        C: FnOnce() + Send + 'static,
        L: FnOnce() + Send + 'static,
    {
        let source = OsSignals::block()?;
        Ok(Self::with_source(source, Timeline::default(), cancel, cleanup))
    }

    pub fn with_source<S, C, L>(source: S, timeline: Timeline, cancel: C, cleanup: L) -> Self
    where
        S: SignalSource,
        C: FnOnce() + Send + 'static,
        L: FnOnce() + Send + 'static,
    {
        let handle = std::thread::Builder::new()
            .name("signal-bridge".to_string())
            .spawn(move || run_timeline(source, timeline, cancel, cleanup))
            .unwrap_or_else(|err| panic!("spawning signal bridge thread: {err}"));
        Self { handle }
    }

    /// Waits for the bridge thread. It only exits when its source closes or
    /// the timeline has run to completion.
    pub fn join(self) {
        let _ = self.handle.join();
    }
}

fn run_timeline<S, C, L>(mut source: S, timeline: Timeline, cancel: C, cleanup: L)
where
    S: SignalSource,
    C: FnOnce() + Send + 'static,
    L: FnOnce() + Send + 'static,
{
    loop {
        match source.next(None) {
            Received::Signal(signal) => {
                tracing::warn!("received signal: {signal}; shutting down");
                break;
            }
            Received::TimedOut => continue,
            Received::Closed => return,
        }
    }

    let mut closed = false;
    let mut cancel = Some(cancel);
    let mut cleanup = Some(cleanup);
    let mut hard_stop = Some(timeline.hard_stop);

    for phase in [Phase::Soft, Phase::Medium, Phase::Hard] {
        let deadline = Instant::now() + timeline.phase;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break;
            }
            if closed {
                std::thread::sleep(remaining);
                break;
            }
            match source.next(Some(remaining)) {
                Received::Signal(signal) => {
                    tracing::warn!("received signal: {signal}; escalating shutdown");
                    break;
                }
                Received::TimedOut => break,
                Received::Closed => closed = true,
            }
        }

        match phase {
            Phase::Soft => {
                tracing::info!("cancelling running work");
                if let Some(cancel) = cancel.take() {
                    std::thread::spawn(cancel);
                }
            }
            Phase::Medium => {
                tracing::info!("flushing logs before exit");
                if let Some(cleanup) = cleanup.take() {
                    std::thread::spawn(cleanup);
                }
            }
            Phase::Hard => {
                if let Some(stop) = hard_stop.take() {
                    stop();
                }
            }
        }
    }
}

/// Real signals received with `sigtimedwait`.
struct OsSignals {
    set: libc::sigset_t,
}

impl OsSignals {
    fn block() -> io::Result<Self> {
        // SAFETY: the set is initialised by sigemptyset before use and only
        // standard signal numbers are added.
        unsafe {
            let mut set: libc::sigset_t = std::mem::zeroed();
            libc::sigemptyset(&mut set);
            for signo in WATCHED {
                libc::sigaddset(&mut set, signo);
            }
            let rc = libc::pthread_sigmask(libc::SIG_BLOCK, &set, std::ptr::null_mut());
            if rc != 0 {
                return Err(io::Error::from_raw_os_error(rc));
            }
            Ok(Self { set })
        }
    }
}

// SAFETY: sigset_t is plain data.
unsafe impl Send for OsSignals {}

impl SignalSource for OsSignals {
    fn next(&mut self, timeout: Option<Duration>) -> Received {
        let deadline = timeout.map(|t| Instant::now() + t);
        loop {
            // SAFETY: `self.set` is a valid signal set; the timespec outlives
            // the call.
            let rc = unsafe {
                match deadline {
                    None => libc::sigwaitinfo(&self.set, std::ptr::null_mut()),
                    Some(deadline) => {
                        let left = deadline.saturating_duration_since(Instant::now());
                        let ts = libc::timespec {
                            tv_sec: left.as_secs() as libc::time_t,
                            tv_nsec: left.subsec_nanos() as libc::c_long,
                        };
                        libc::sigtimedwait(&self.set, std::ptr::null_mut(), &ts)
                    }
                }
            };
            if rc >= 0 {
                if let Some(signal) = Signal::from_raw(rc) {
                    return Received::Signal(signal);
                }
                continue;
            }
            match io::Error::last_os_error().raw_os_error() {
                Some(libc::EINTR) => continue,
                Some(libc::EAGAIN) => return Received::TimedOut,
                _ => return Received::Closed,
            }
        }
    }
}

/// Signals delivered through a channel, for exercising the timeline.
#[cfg(test)]
pub(crate) struct ChannelSignals(pub(crate) std::sync::mpsc::Receiver<Signal>);

#[cfg(test)]
impl SignalSource for ChannelSignals {
    fn next(&mut self, timeout: Option<Duration>) -> Received {
        use std::sync::mpsc::RecvTimeoutError;
        match timeout {
            None => self.0.recv().map_or(Received::Closed, Received::Signal),
            Some(timeout) => match self.0.recv_timeout(timeout) {
                Ok(signal) => Received::Signal(signal),
                Err(RecvTimeoutError::Timeout) => Received::TimedOut,
                Err(RecvTimeoutError::Disconnected) => Received::Closed,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;

    fn bridge_with_events(
        phase: Duration,
    ) -> (
        mpsc::Sender<Signal>,
        mpsc::Receiver<(Phase, Instant)>,
        SignalBridge,
    ) {
        let (signal_tx, signal_rx) = mpsc::channel();
        let (event_tx, event_rx) = mpsc::channel();
        let soft = event_tx.clone();
        let medium = event_tx.clone();
        let timeline = Timeline {
            phase,
            hard_stop: Box::new(move || {
                let _ = event_tx.send((Phase::Hard, Instant::now()));
            }),
        };
        let bridge = SignalBridge::with_source(
            ChannelSignals(signal_rx),
            timeline,
            move || {
                let _ = soft.send((Phase::Soft, Instant::now()));
            },
            move || {
                let _ = medium.send((Phase::Medium, Instant::now()));
            },
        );
        (signal_tx, event_rx, bridge)
    }

    #[test]
    fn phases_run_in_order_after_each_timer() {
        let phase = Duration::from_millis(40);
        let (signals, events, bridge) = bridge_with_events(phase);
        let start = Instant::now();
        signals.send(Signal::Interrupt).unwrap();

        let (first, t1) = events.recv_timeout(Duration::from_secs(5)).unwrap();
        let (second, t2) = events.recv_timeout(Duration::from_secs(5)).unwrap();
        let (third, t3) = events.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(
            (first, second, third),
            (Phase::Soft, Phase::Medium, Phase::Hard)
        );
        assert!(t1.duration_since(start) >= phase);
        assert!(t2.duration_since(start) >= phase * 2);
        assert!(t3.duration_since(start) >= phase * 3);

        drop(signals);
        bridge.join();
    }

    #[test]
    fn repeated_signal_skips_the_timer() {
        let phase = Duration::from_secs(30);
        let (signals, events, bridge) = bridge_with_events(phase);
        let start = Instant::now();
        signals.send(Signal::Terminate).unwrap();
        signals.send(Signal::Terminate).unwrap();
        signals.send(Signal::Hangup).unwrap();
        signals.send(Signal::Quit).unwrap();

        let mut seen = Vec::new();
        for _ in 0..3 {
            seen.push(events.recv_timeout(Duration::from_secs(5)).unwrap().0);
        }
        // Actions run on their own threads, so only the set is deterministic.
        for phase in [Phase::Soft, Phase::Medium, Phase::Hard] {
            assert!(seen.contains(&phase));
        }
        assert!(start.elapsed() < phase);
        bridge.join();
    }

    #[test]
    fn closed_source_without_signal_does_nothing() {
        let (signals, events, bridge) = bridge_with_events(Duration::from_millis(1));
        drop(signals);
        bridge.join();
        assert!(events.try_recv().is_err());
    }

    #[test]
    fn signal_names() {
        assert_eq!(Signal::from_raw(libc::SIGINT), Some(Signal::Interrupt));
        assert_eq!(Signal::from_raw(libc::SIGUSR1), None);
        assert_eq!(Signal::Terminate.to_string(), "terminated");
    }
}
