//! Builds a family of OS image products from one source tree.
//!
//! Two subsystems share a small set of process-level mechanisms:
//!
//! - **Multi-product driver** - configures then builds every product in an
//!   isolated output directory, under a concurrency bound, with cooperative
//!   cancellation and a compact status display
//! - **Parallel archive writer** - streaming ZIP writer with block-parallel
//!   deflate, emitting entries in submission order under a combined
//!   execution and memory budget
//!
//! # Architecture
//!
//! ```text
//! driver ──────────┬── status ── util
//!     │            ├── lock
//!     │            ├── signal / cancel
//!     │            └── environment
//!     │
//!     └── archive ──── rate_limit
//! ```
//!
//! Each binary wires these together: `multiproduct-build` runs the driver,
//! `parallel-zip` exposes the archive writer.

pub mod archive;
pub mod cancel;
pub mod driver;
pub mod environment;
pub mod lock;
pub mod rate_limit;
pub mod signal;
pub mod status;
pub mod util;

pub use cancel::CancellationToken;
pub use environment::Environment;
pub use rate_limit::{ExecutionToken, RateLimiter};
pub use status::Status;
