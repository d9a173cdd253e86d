use std::io::Write;

use anyhow::{Context, Result};
use clap::Parser;
use tracing_subscriber::EnvFilter;

use multiproduct_builder::driver::{self, BuildConfig, CommandToolchain, DriverArgs};
use multiproduct_builder::lock::DeadlineWaiter;
use multiproduct_builder::signal::SignalBridge;
use multiproduct_builder::{CancellationToken, Environment, Status};

fn main() {
    let args = DriverArgs::parse();
    init_tracing(args.verbose);

    match run(&args) {
        Ok(0) => {}
        Ok(failures) => {
            eprintln!("{failures} product(s) failed");
            std::process::exit(1);
        }
        Err(err) => {
            eprintln!("error: {err:#}");
            std::process::exit(1);
        }
    }
}

fn run(args: &DriverArgs) -> Result<usize> {
    let cancel = CancellationToken::new();

    // Must precede every other thread so they inherit the blocked mask.
    let token = cancel.clone();
    let _bridge = SignalBridge::install(
        move || token.cancel(),
        || {
            let _ = std::io::stdout().flush();
        },
    )
    .context("installing signal handlers")?;

    let cwd = std::env::current_dir().context("resolving working directory")?;
    let config = BuildConfig::from_args(args, Environment::from_process(), &cwd)?;
    let toolchain = CommandToolchain::load(&config.source_root)?;
    let status = Status::stdout();

    println!("Output directory: {}", config.out_dir.display());
    println!("Logs directory:   {}", config.logs_dir().display());

    driver::run(
        &config,
        &toolchain,
        &status,
        &cancel,
        &mut DeadlineWaiter::default(),
    )
}

fn init_tracing(verbose: u8) {
    let level = match verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(format!(
            "multiproduct_builder={level},multiproduct_build={level}"
        ))
    });
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_level(true)
        .finish();

    let _ = tracing::subscriber::set_global_default(subscriber);
}
