//! Multi-product build driver.
//!
//! Every selected product is configured on its own thread, in its own output
//! directory. Configured products flow through a bounded channel to the
//! build dispatcher, which runs at most `parallel` builds at a time. Once
//! the cancellation token fires no further build starts, and every product
//! that has not completed is reported as failed.

pub mod config;
pub mod dist;
pub mod installclean;
pub mod job;
pub mod toolchain;

use std::fs;
use std::panic::{self, AssertUnwindSafe};
use std::sync::mpsc::{self, Receiver, SyncSender};
use std::thread::{self, Scope};

use anyhow::{anyhow, Context, Result};

pub use config::{BuildConfig, ConfigError, DriverArgs, Variant};
pub use job::{ProductJob, Stage};
pub use toolchain::{CommandToolchain, ProductToolchain};

use crate::cancel::CancellationToken;
use crate::lock::{ProcessLock, Waiter};
use crate::rate_limit::RateLimiter;
use crate::status::Status;

/// Shared by every worker thread of one run.
#[derive(Clone, Copy)]
struct RunContext<'a> {
    config: &'a BuildConfig,
    toolchain: &'a dyn ProductToolchain,
    status: &'a Status,
    cancel: &'a CancellationToken,
}

/// Configures and builds every selected product. Returns the number of
/// failed products.
pub fn run(
    config: &BuildConfig,
    toolchain: &dyn ProductToolchain,
    status: &Status,
    cancel: &CancellationToken,
    waiter: &mut dyn Waiter,
) -> Result<usize> {
    let mut lock = ProcessLock::acquire(&config.out_root, waiter)?;

    fs::create_dir_all(&config.out_dir)
        .with_context(|| format!("creating output directory '{}'", config.out_dir.display()))?;

    let all = toolchain.list_products(config).context("listing products")?;
    let products = config.select_products(all)?;
    status.set_total(products.len());
    tracing::info!(
        "building {} products, {} at a time",
        products.len(),
        config.parallel
    );
    tracing::debug!(
        "remote jobs {:?}, heartbeat {:?}, build type {:?}, goma {}, host sanitizers {:?}",
        config.remote_jobs,
        config.heartbeat,
        config.build_type,
        config.use_goma,
        config.sanitize_host
    );

    let ctx = RunContext {
        config,
        toolchain,
        status,
        cancel,
    };
    let (jobs_tx, jobs_rx) = mpsc::sync_channel::<ProductJob>(config.parallel.max(1));

    thread::scope(|scope| {
        for product in &products {
            let jobs = jobs_tx.clone();
            scope.spawn(move || configure_product(ctx, product, jobs));
        }
        drop(jobs_tx);
        dispatch_builds(scope, ctx, jobs_rx);
    });

    // The logs archive is written while the output root is still locked.
    let bundled = match &config.dist_dir {
        Some(dist) => dist::bundle_logs(&config.logs_dir(), dist).map(drop),
        None => Ok(()),
    };
    let failures = status.finished();
    lock.release();
    bundled?;
    Ok(failures)
}

fn configure_product(ctx: RunContext<'_>, product: &str, jobs: SyncSender<ProductJob>) {
    if ctx.cancel.is_cancelled() {
        ctx.status.fail(product, &anyhow!("cancelled"), None);
        return;
    }

    let mut job = match ProductJob::create(ctx.config, product) {
        Ok(job) => job,
        Err(err) => {
            ctx.status.fail(product, &err, None);
            return;
        }
    };

    job.event(Stage::Config, "started", None);
    let result = guarded(|| ctx.toolchain.configure(ctx.config, &job, ctx.cancel))
        .and_then(|()| job.load_config_env());
    if result.is_err() || ctx.config.only_config {
        complete(ctx, job, Stage::Config, result);
        return;
    }
    job.event(Stage::Config, "succeeded", None);

    if let Err(mpsc::SendError(job)) = jobs.send(job) {
        complete(ctx, job, Stage::Build, Err(anyhow!("build dispatcher stopped")));
    }
}

fn dispatch_builds<'scope>(
    scope: &'scope Scope<'scope, '_>,
    ctx: RunContext<'scope>,
    jobs: Receiver<ProductJob>,
) {
    let limiter = RateLimiter::new(ctx.config.parallel, i64::MAX);
    for job in jobs {
        let token = limiter.request_execution();
        if ctx.cancel.is_cancelled() {
            drop(token);
            complete(ctx, job, Stage::Build, Err(anyhow!("cancelled")));
            continue;
        }
        scope.spawn(move || {
            build_product(ctx, job);
            token.finish(0);
        });
    }
}

fn build_product(ctx: RunContext<'_>, mut job: ProductJob) {
    job.event(Stage::Build, "started", None);
    let result = guarded(|| {
        installclean::install_clean_if_necessary(
            &job.out_dir,
            &job.product,
            ctx.config.variant,
            ctx.config.disable_installclean,
        )?;
        ctx.toolchain.build(ctx.config, &job, ctx.cancel)
    });
    complete(ctx, job, Stage::Build, result);
}

fn complete(ctx: RunContext<'_>, mut job: ProductJob, stage: Stage, result: Result<()>) {
    match result {
        Ok(()) => {
            job.event(stage, "succeeded", None);
            ctx.status.finish(&job.product);
            job.retire(ctx.config.keep, false);
        }
        Err(err) => {
            job.event(stage, "failed", Some(&format!("{err:#}")));
            ctx.status.fail(&job.product, &err, Some(job.std_log()));
            job.retire(ctx.config.keep, true);
        }
    }
}

/// Runs `f`, turning a panic into an error for the product at hand.
fn guarded<F>(f: F) -> Result<()>
where
    F: FnOnce() -> Result<()>,
{
    match panic::catch_unwind(AssertUnwindSafe(f)) {
        Ok(result) => result,
        Err(payload) => {
            let message = payload
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| payload.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic".to_string());
            Err(anyhow!("panicked: {message}"))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::environment::Environment;
    use crate::lock::DeadlineWaiter;
    use crate::signal::{ChannelSignals, Signal, SignalBridge, Timeline};
    use anyhow::bail;
    use clap::Parser;
    use std::io::{self, Write};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};
    use std::time::{Duration, Instant};
    use tempfile::TempDir;

    #[derive(Clone, Default)]
    struct SharedBuf(Arc<Mutex<Vec<u8>>>);

    impl Write for SharedBuf {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }
        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    impl SharedBuf {
        fn text(&self) -> String {
            String::from_utf8(self.0.lock().unwrap().clone()).unwrap()
        }
    }

    /// Builds beyond the first `succeed_first` block until cancelled.
    struct FakeToolchain {
        products: Vec<String>,
        succeed_first: usize,
        panic_on: Option<&'static str>,
        builds: AtomicUsize,
        blocked: Mutex<mpsc::Sender<String>>,
    }

    impl FakeToolchain {
        fn new(products: &[&str], succeed_first: usize) -> (Self, mpsc::Receiver<String>) {
            let (tx, rx) = mpsc::channel();
            let fake = Self {
                products: products.iter().map(|p| p.to_string()).collect(),
                succeed_first,
                panic_on: None,
                builds: AtomicUsize::new(0),
                blocked: Mutex::new(tx),
            };
            (fake, rx)
        }
    }

    impl ProductToolchain for FakeToolchain {
        fn list_products(&self, _config: &BuildConfig) -> Result<Vec<String>> {
            Ok(self.products.clone())
        }

        fn configure(
            &self,
            _config: &BuildConfig,
            job: &ProductJob,
            _cancel: &CancellationToken,
        ) -> Result<()> {
            if self.panic_on == Some(job.product.as_str()) {
                panic!("boom");
            }
            fs::write(job.std_log(), format!("configured {}\n", job.product))?;
            Ok(())
        }

        fn build(
            &self,
            _config: &BuildConfig,
            job: &ProductJob,
            cancel: &CancellationToken,
        ) -> Result<()> {
            assert_eq!(job.env.get("TARGET_PRODUCT"), Some(job.product.as_str()));
            let started = self.builds.fetch_add(1, Ordering::SeqCst);
            if started < self.succeed_first {
                return Ok(());
            }
            let _ = self.blocked.lock().unwrap().send(job.product.clone());
            cancel.wait_timeout(Duration::from_secs(30));
            bail!("cancelled");
        }
    }

    fn tree() -> TempDir {
        let tmp = TempDir::new().unwrap();
        let sentinel = tmp.path().join(config::SENTINEL_FILE);
        fs::create_dir_all(sentinel.parent().unwrap()).unwrap();
        fs::write(&sentinel, "").unwrap();
        tmp
    }

    fn build_config(tmp: &TempDir, extra: &[&str], env: Environment) -> BuildConfig {
        let mut argv = vec!["multiproduct-build", "--out", "out/multi"];
        argv.extend_from_slice(extra);
        BuildConfig::from_args(&DriverArgs::parse_from(argv), env, tmp.path()).unwrap()
    }

    fn status() -> (Status, SharedBuf) {
        let buf = SharedBuf::default();
        let status = Status::new(Box::new(buf.clone()), false, Box::new(|| None));
        (status, buf)
    }

    #[test]
    fn successful_run_cleans_outputs_and_bundles_logs() {
        let tmp = tree();
        let env = Environment::from_entries(["DIST_DIR=dist"]);
        let config = build_config(&tmp, &["-j", "2", "--dist"], env);
        let (fake, _blocked) = FakeToolchain::new(&["aosp_arm", "aosp_x86"], usize::MAX);
        let (status, out) = status();
        let cancel = CancellationToken::new();

        let failures = run(
            &config,
            &fake,
            &status,
            &cancel,
            &mut DeadlineWaiter::default(),
        )
        .unwrap();
        assert_eq!(failures, 0);
        assert_eq!(status.counts(), (2, 0, 2));
        assert!(out.text().contains("[2/2]"));

        assert!(!config.out_dir.join("aosp_arm").exists());
        let events =
            fs::read_to_string(tmp.path().join("dist/logs/aosp_arm").join(job::EVENT_LOG_NAME))
                .unwrap();
        assert!(events.contains("\"stage\":\"build\""));
        assert!(tmp.path().join("dist").join(dist::LOGS_ARCHIVE).is_file());
    }

    #[test]
    fn bundle_failure_still_reports_products_and_unlocks() {
        let tmp = tree();
        let env = Environment::from_entries(["DIST_DIR=dist"]);
        let config = build_config(&tmp, &["--dist"], env);
        fs::create_dir_all(tmp.path().join("dist").join(dist::LOGS_ARCHIVE)).unwrap();
        let (fake, _blocked) = FakeToolchain::new(&["aosp_arm", "aosp_x86"], usize::MAX);
        let buf = SharedBuf::default();
        let status = Status::new(Box::new(buf.clone()), true, Box::new(|| None));

        let err = run(
            &config,
            &fake,
            &status,
            &CancellationToken::new(),
            &mut DeadlineWaiter::default(),
        )
        .unwrap_err();
        assert!(format!("{err:#}").contains(dist::LOGS_ARCHIVE));
        assert_eq!(status.counts(), (2, 0, 2));
        assert!(buf.text().ends_with('\n'));

        let mut waiter = DeadlineWaiter::new(Duration::from_millis(1), Duration::ZERO);
        assert!(ProcessLock::acquire(&config.out_root, &mut waiter).is_ok());
    }

    #[test]
    fn configure_panic_fails_only_that_product() {
        let tmp = tree();
        let config = build_config(&tmp, &["-j", "2", "--keep"], Environment::new());
        let (mut fake, _blocked) = FakeToolchain::new(&["a", "b", "c"], usize::MAX);
        fake.panic_on = Some("b");
        let (status, out) = status();

        let failures = run(
            &config,
            &fake,
            &status,
            &CancellationToken::new(),
            &mut DeadlineWaiter::default(),
        )
        .unwrap();
        assert_eq!(failures, 1);
        assert_eq!(fake.builds.load(Ordering::SeqCst), 2);
        let text = out.text();
        assert!(text.contains("FAILED: b"));
        assert!(text.contains("panicked: boom"));
        assert!(config.out_dir.join("a").exists());
    }

    #[test]
    fn only_config_skips_builds() {
        let tmp = tree();
        let config = build_config(&tmp, &["--only-config"], Environment::new());
        let (fake, _blocked) = FakeToolchain::new(&["a", "b", "c"], 0);
        let (status, _out) = status();

        let failures = run(
            &config,
            &fake,
            &status,
            &CancellationToken::new(),
            &mut DeadlineWaiter::default(),
        )
        .unwrap();
        assert_eq!(failures, 0);
        assert_eq!(fake.builds.load(Ordering::SeqCst), 0);
        assert_eq!(status.counts(), (3, 0, 3));
    }

    #[test]
    fn interrupt_cancels_remaining_products() {
        let tmp = tree();
        let config = build_config(&tmp, &["-j", "3"], Environment::new());
        let products = ["p0", "p1", "p2", "p3", "p4", "p5", "p6", "p7", "p8", "p9"];
        let (fake, blocked) = FakeToolchain::new(&products, 4);
        let (status, out) = status();
        let cancel = CancellationToken::new();

        let (signals, signal_rx) = mpsc::channel();
        let token = cancel.clone();
        let bridge = SignalBridge::with_source(
            ChannelSignals(signal_rx),
            Timeline {
                phase: Duration::from_millis(50),
                hard_stop: Box::new(|| {}),
            },
            move || token.cancel(),
            || {},
        );

        let start = Instant::now();
        let failures = thread::scope(|scope| {
            scope.spawn(move || {
                for _ in 0..3 {
                    blocked.recv_timeout(Duration::from_secs(10)).unwrap();
                }
                signals.send(Signal::Interrupt).unwrap();
            });
            run(
                &config,
                &fake,
                &status,
                &cancel,
                &mut DeadlineWaiter::default(),
            )
            .unwrap()
        });

        assert_eq!(failures, 6);
        assert!(start.elapsed() < Duration::from_secs(6));
        assert_eq!(status.counts(), (10, 6, 10));
        assert_eq!(fake.builds.load(Ordering::SeqCst), 7);
        assert_eq!(out.text().matches("error: cancelled").count(), 6);

        let mut waiter = DeadlineWaiter::new(Duration::from_millis(1), Duration::ZERO);
        assert!(ProcessLock::acquire(&config.out_root, &mut waiter).is_ok());
        bridge.join();
    }

    #[test]
    fn unknown_product_is_an_input_error() {
        let tmp = tree();
        let config = build_config(&tmp, &["--products", "missing"], Environment::new());
        let (fake, _blocked) = FakeToolchain::new(&["a"], usize::MAX);
        let (status, _out) = status();
        let err = run(
            &config,
            &fake,
            &status,
            &CancellationToken::new(),
            &mut DeadlineWaiter::default(),
        )
        .unwrap_err();
        assert!(err.downcast_ref::<ConfigError>().is_some());
    }
}
