//! Per-product state carried from the configuration pass to the build pass.

use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Serialize;
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;

use super::config::BuildConfig;
use crate::environment::Environment;

pub const STD_LOG_NAME: &str = "std_full.log";
pub const EVENT_LOG_NAME: &str = "build.log";
/// Written by the configuration pass; `export`/`unset` lines applied to the
/// build environment.
pub const CONFIG_ENV_NAME: &str = "config.env";

/// Set per product; inherited values would leak between products.
const PRODUCT_VARS: &[&str] = &["OUT_DIR", "TARGET_PRODUCT", "TARGET_BUILD_VARIANT", "DIST_DIR"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Config,
    Build,
    Cleanup,
}

#[derive(Serialize)]
struct EventRecord<'a> {
    time: String,
    product: &'a str,
    stage: Stage,
    event: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    detail: Option<&'a str>,
}

/// One product's isolated output directory, logs and environment.
pub struct ProductJob {
    pub product: String,
    pub out_dir: PathBuf,
    pub log_dir: PathBuf,
    pub env: Environment,
    std_log: PathBuf,
    events: BufWriter<File>,
}

impl ProductJob {
    pub fn create(config: &BuildConfig, product: &str) -> Result<Self> {
        let out_dir = config.out_dir.join(product);
        let log_dir = config.logs_dir().join(product);
        for dir in [&out_dir, &log_dir] {
            fs::create_dir_all(dir)
                .with_context(|| format!("creating directory '{}'", dir.display()))?;
        }

        let std_log = log_dir.join(STD_LOG_NAME);
        File::create(&std_log)
            .with_context(|| format!("creating log '{}'", std_log.display()))?;
        let event_log = log_dir.join(EVENT_LOG_NAME);
        let events = File::create(&event_log)
            .with_context(|| format!("creating log '{}'", event_log.display()))?;

        let mut env = config.env.snapshot();
        env.unset(PRODUCT_VARS);
        env.set("OUT_DIR", &out_dir.to_string_lossy());
        env.set("TARGET_PRODUCT", product);
        env.set("TARGET_BUILD_VARIANT", config.variant.as_str());
        if let Some(dist) = &config.dist_dir {
            env.set("DIST_DIR", &dist.join(product).to_string_lossy());
        }

        Ok(Self {
            product: product.to_string(),
            out_dir,
            log_dir,
            env,
            std_log,
            events: BufWriter::new(events),
        })
    }

    /// Captured stdout and stderr of every command run for this product.
    pub fn std_log(&self) -> &Path {
        &self.std_log
    }

    /// Appends a structured record to `build.log`.
    pub fn event(&mut self, stage: Stage, event: &str, detail: Option<&str>) {
        let record = EventRecord {
            time: OffsetDateTime::now_utc()
                .format(&Rfc3339)
                .unwrap_or_default(),
            product: &self.product,
            stage,
            event,
            detail,
        };
        let written = serde_json::to_writer(&mut self.events, &record)
            .map_err(std::io::Error::from)
            .and_then(|()| self.events.write_all(b"\n"))
            .and_then(|()| self.events.flush());
        if let Err(err) = written {
            tracing::warn!("{}: writing {EVENT_LOG_NAME}: {err}", self.product);
        }
    }

    /// Merges `config.env` from the product output, if the configuration pass
    /// left one. A malformed file leaves the environment untouched.
    pub fn load_config_env(&mut self) -> Result<()> {
        let path = self.out_dir.join(CONFIG_ENV_NAME);
        let file = match File::open(&path) {
            Ok(file) => file,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(err) => {
                return Err(err).with_context(|| format!("opening '{}'", path.display()))
            }
        };
        self.env
            .merge(std::io::BufReader::new(file))
            .with_context(|| format!("applying '{}'", path.display()))
    }

    fn std_log_is_empty(&self) -> bool {
        fs::metadata(&self.std_log)
            .map(|meta| meta.len() == 0)
            .unwrap_or(true)
    }

    /// Closes the logs and removes the output directory unless `keep` is set
    /// or the job failed with something in its log.
    pub fn retire(mut self, keep: bool, failed: bool) {
        let retain = keep || (failed && !self.std_log_is_empty());
        if !retain {
            self.event(Stage::Cleanup, "removing output", None);
        }
        if let Err(err) = self.events.flush() {
            tracing::warn!("{}: flushing {EVENT_LOG_NAME}: {err}", self.product);
        }
        drop(self.events);

        if !retain {
            if let Err(err) = fs::remove_dir_all(&self.out_dir) {
                tracing::warn!(
                    "{}: removing '{}': {err}",
                    self.product,
                    self.out_dir.display()
                );
            }
        }
    }
}
