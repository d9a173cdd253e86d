//! Driver configuration: command-line flags merged over the environment.

use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use clap::Parser;
use thiserror::Error;

use crate::environment::Environment;
use crate::rate_limit::default_max_execs;
use crate::util::{in_list, parse_duration};

/// Present only at the top of a source tree.
pub const SENTINEL_FILE: &str = "build/soong/root.bp";

const DEFAULT_OUT_DIR: &str = "out";
const BUILD_TYPES: &[&str] = &["release", "debug"];

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("must be run from the top of the source tree: '{}' not found", .0.display())]
    NotTopOfTree(PathBuf),
    #[error("{what} '{}' contains whitespace", path.display())]
    Whitespace { what: &'static str, path: PathBuf },
    #[error("invalid build variant '{0}' (expected user, userdebug or eng)")]
    Variant(String),
    #[error("invalid value '{value}' for {key}: {reason}")]
    Env {
        key: &'static str,
        value: String,
        reason: String,
    },
    #[error("invalid shard {index} of {count}")]
    Shard { index: usize, count: usize },
    #[error("unknown product '{0}'")]
    UnknownProduct(String),
    #[error("product name '{0}' cannot be used as a directory name")]
    InvalidProduct(String),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Variant {
    User,
    UserDebug,
    #[default]
    Eng,
}

impl Variant {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::User => "user",
            Self::UserDebug => "userdebug",
            Self::Eng => "eng",
        }
    }
}

impl std::fmt::Display for Variant {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Variant {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "user" => Ok(Self::User),
            "userdebug" => Ok(Self::UserDebug),
            "eng" => Ok(Self::Eng),
            other => Err(ConfigError::Variant(other.to_string())),
        }
    }
}

/// Builds every product of the tree in isolated output directories.
#[derive(Debug, Clone, Parser)]
#[command(name = "multiproduct-build", version)]
pub struct DriverArgs {
    /// Number of parallel builds (0 = a quarter of the CPUs).
    #[arg(short = 'j', default_value_t = 0)]
    pub jobs: usize,

    /// Failures each product build may tolerate before stopping.
    #[arg(short = 'k', default_value_t = 1)]
    pub keep_going: usize,

    /// Keep product output directories after successful builds.
    #[arg(long)]
    pub keep: bool,

    /// Output directory (default: $OUT_DIR/multiproduct-<timestamp>).
    #[arg(long = "out")]
    pub out: Option<PathBuf>,

    /// Write logs to $DIST_DIR/logs and bundle them into logs.zip.
    #[arg(long)]
    pub dist: bool,

    /// Only run the configuration pass.
    #[arg(long)]
    pub only_config: bool,

    /// Only build the declarative (soong) part of each product.
    #[arg(long)]
    pub only_soong: bool,

    /// Build variant: user, userdebug or eng.
    #[arg(long, default_value = "eng")]
    pub variant: String,

    /// Comma-separated products to build instead of every product.
    #[arg(long, value_delimiter = ',')]
    pub products: Vec<String>,

    /// Comma-separated products to skip.
    #[arg(long, value_delimiter = ',')]
    pub skip_products: Vec<String>,

    /// 1-based shard to build.
    #[arg(long, requires = "shard_count")]
    pub shard: Option<usize>,

    /// Number of shards the product list is split into.
    #[arg(long, requires = "shard")]
    pub shard_count: Option<usize>,

    /// Increase log verbosity (-v, -vv).
    #[arg(short, long, action = clap::ArgAction::Count)]
    pub verbose: u8,
}

#[derive(Debug, Clone)]
pub struct BuildConfig {
    pub source_root: PathBuf,
    /// Shared output root; holds the process lock.
    pub out_root: PathBuf,
    /// Root of the per-product output directories.
    pub out_dir: PathBuf,
    pub dist_dir: Option<PathBuf>,
    pub variant: Variant,
    pub parallel: usize,
    pub keep_going: usize,
    pub keep: bool,
    pub verbose: bool,
    pub only_config: bool,
    pub only_soong: bool,
    pub products: Vec<String>,
    pub skip_products: Vec<String>,
    /// (1-based index, count)
    pub shard: Option<(usize, usize)>,
    pub env: Environment,
    pub remote_jobs: Option<usize>,
    pub heartbeat: Option<Duration>,
    pub sanitize_host: Vec<String>,
    pub use_goma: bool,
    pub build_type: Option<String>,
    pub disable_installclean: bool,
}

impl BuildConfig {
    /// Validates `args` against the tree at `cwd` and the captured `env`.
    pub fn from_args(args: &DriverArgs, env: Environment, cwd: &Path) -> Result<Self, ConfigError> {
        let sentinel = cwd.join(SENTINEL_FILE);
        if !sentinel.is_file() {
            return Err(ConfigError::NotTopOfTree(sentinel));
        }
        let source_root = cwd.to_path_buf();
        check_whitespace("source directory", &source_root)?;

        let out_root = absolute(cwd, env.get("OUT_DIR").unwrap_or(DEFAULT_OUT_DIR));
        check_whitespace("output directory", &out_root)?;

        let out_dir = match &args.out {
            Some(out) => absolute(cwd, out),
            None => out_root.join(format!("multiproduct-{}", timestamp())),
        };
        check_whitespace("output directory", &out_dir)?;

        let dist_dir = if args.dist {
            let dist = match env.get("DIST_DIR") {
                Some(dir) => absolute(cwd, dir),
                None => out_root.join("dist"),
            };
            check_whitespace("dist directory", &dist)?;
            Some(dist)
        } else {
            None
        };

        let shard = match (args.shard, args.shard_count) {
            (Some(index), Some(count)) if index >= 1 && index <= count => Some((index, count)),
            (Some(index), Some(count)) => return Err(ConfigError::Shard { index, count }),
            _ => None,
        };

        let remote_jobs = match env.get("NINJA_REMOTE_NUM_JOBS") {
            Some(value) => Some(value.parse::<usize>().map_err(|err| ConfigError::Env {
                key: "NINJA_REMOTE_NUM_JOBS",
                value: value.to_string(),
                reason: err.to_string(),
            })?),
            None => None,
        };
        let heartbeat = match env.get("NINJA_HEARTBEAT_INTERVAL") {
            Some(value) => Some(parse_duration(value).map_err(|err| ConfigError::Env {
                key: "NINJA_HEARTBEAT_INTERVAL",
                value: value.to_string(),
                reason: err.to_string(),
            })?),
            None => None,
        };
        let build_type = match env.get("TARGET_BUILD_TYPE") {
            None | Some("") => None,
            Some(value) if in_list(value, BUILD_TYPES) => Some(value.to_string()),
            Some(value) => {
                return Err(ConfigError::Env {
                    key: "TARGET_BUILD_TYPE",
                    value: value.to_string(),
                    reason: "expected release or debug".to_string(),
                })
            }
        };
        let sanitize_host = env
            .get("SANITIZE_HOST")
            .map(|value| value.split_whitespace().map(str::to_string).collect())
            .unwrap_or_default();

        Ok(Self {
            source_root,
            out_root,
            out_dir,
            dist_dir,
            variant: args.variant.parse()?,
            parallel: if args.jobs == 0 {
                default_parallel()
            } else {
                args.jobs
            },
            keep_going: args.keep_going,
            keep: args.keep,
            verbose: args.verbose > 0,
            only_config: args.only_config,
            only_soong: args.only_soong,
            products: args.products.clone(),
            skip_products: args.skip_products.clone(),
            shard,
            remote_jobs,
            heartbeat,
            sanitize_host,
            use_goma: env_bool(&env, "USE_GOMA")?,
            build_type,
            disable_installclean: env_bool(&env, "DISABLE_AUTO_INSTALLCLEAN")?,
            env,
        })
    }

    /// Directory holding one log directory per product.
    pub fn logs_dir(&self) -> PathBuf {
        match &self.dist_dir {
            Some(dist) => dist.join("logs"),
            None => self.out_dir.join("logs"),
        }
    }

    /// Applies the include list, the skip list and sharding to `all`.
    pub fn select_products(&self, all: Vec<String>) -> Result<Vec<String>, ConfigError> {
        let mut selected = if self.products.is_empty() {
            all
        } else {
            for product in &self.products {
                if !all.contains(product) {
                    return Err(ConfigError::UnknownProduct(product.clone()));
                }
            }
            all.into_iter()
                .filter(|p| self.products.contains(p))
                .collect()
        };
        selected.retain(|p| !self.skip_products.contains(p));

        if let Some((index, count)) = self.shard {
            selected = selected
                .into_iter()
                .enumerate()
                .filter(|(i, _)| i % count == index - 1)
                .map(|(_, p)| p)
                .collect();
        }
        if let Some(bad) = selected.iter().find(|p| !is_valid_product_name(p)) {
            return Err(ConfigError::InvalidProduct(bad.clone()));
        }
        Ok(selected)
    }
}

/// Product names become single path components under the output and logs
/// directories; `logs` would collide with the logs directory itself.
fn is_valid_product_name(name: &str) -> bool {
    !matches!(name, "" | "." | ".." | "logs") && !name.contains('/')
}

/// A quarter of the CPUs, at least one.
pub fn default_parallel() -> usize {
    (default_max_execs() / 4).max(1)
}

fn absolute(cwd: &Path, path: impl AsRef<Path>) -> PathBuf {
    let path = path.as_ref();
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        cwd.join(path)
    }
}

fn check_whitespace(what: &'static str, path: &Path) -> Result<(), ConfigError> {
    if path.to_string_lossy().chars().any(char::is_whitespace) {
        return Err(ConfigError::Whitespace {
            what,
            path: path.to_path_buf(),
        });
    }
    Ok(())
}

fn env_bool(env: &Environment, key: &'static str) -> Result<bool, ConfigError> {
    match env.get(key) {
        None | Some("") => Ok(false),
        Some(_) if env.is_true(key) => Ok(true),
        Some(_) if env.is_false(key) => Ok(false),
        Some(value) => Err(ConfigError::Env {
            key,
            value: value.to_string(),
            reason: "expected a boolean".to_string(),
        }),
    }
}

fn timestamp() -> String {
    let now = time::OffsetDateTime::now_utc();
    format!(
        "{:04}{:02}{:02}{:02}{:02}{:02}",
        now.year(),
        now.month() as u8,
        now.day(),
        now.hour(),
        now.minute(),
        now.second()
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn tree() -> TempDir {
        let tmp = TempDir::new().unwrap();
        let sentinel = tmp.path().join(SENTINEL_FILE);
        std::fs::create_dir_all(sentinel.parent().unwrap()).unwrap();
        std::fs::write(&sentinel, "").unwrap();
        tmp
    }

    fn args(extra: &[&str]) -> DriverArgs {
        let mut argv = vec!["multiproduct-build"];
        argv.extend_from_slice(extra);
        DriverArgs::parse_from(argv)
    }

    #[test]
    fn requires_top_of_tree() {
        let tmp = TempDir::new().unwrap();
        let err = BuildConfig::from_args(&args(&[]), Environment::new(), tmp.path()).unwrap_err();
        assert!(matches!(err, ConfigError::NotTopOfTree(_)));
    }

    #[test]
    fn defaults_resolve_under_out() {
        let tmp = tree();
        let config = BuildConfig::from_args(&args(&[]), Environment::new(), tmp.path()).unwrap();
        assert_eq!(config.out_root, tmp.path().join("out"));
        assert!(config.out_dir.starts_with(&config.out_root));
        assert!(config
            .out_dir
            .file_name()
            .unwrap()
            .to_string_lossy()
            .starts_with("multiproduct-"));
        assert_eq!(config.variant, Variant::Eng);
        assert_eq!(config.parallel, default_parallel());
        assert!(config.dist_dir.is_none());
        assert_eq!(config.logs_dir(), config.out_dir.join("logs"));
    }

    #[test]
    fn rejects_whitespace_in_paths() {
        let tmp = tree();
        let err = BuildConfig::from_args(&args(&["--out", "my out"]), Environment::new(), tmp.path())
            .unwrap_err();
        assert!(matches!(err, ConfigError::Whitespace { .. }));

        let env = Environment::from_entries(["DIST_DIR=/tmp/dist dir"]);
        let err = BuildConfig::from_args(&args(&["--dist"]), env, tmp.path()).unwrap_err();
        assert!(matches!(err, ConfigError::Whitespace { what: "dist directory", .. }));
    }

    #[test]
    fn environment_contract() {
        let tmp = tree();
        let env = Environment::from_entries([
            "NINJA_REMOTE_NUM_JOBS=64",
            "NINJA_HEARTBEAT_INTERVAL=1m30s",
            "SANITIZE_HOST=address  undefined",
            "USE_GOMA=yes",
            "DISABLE_AUTO_INSTALLCLEAN=1",
            "TARGET_BUILD_TYPE=release",
            "DIST_DIR=dist",
        ]);
        let config =
            BuildConfig::from_args(&args(&["--dist", "-j", "3", "--variant", "userdebug"]), env, tmp.path())
                .unwrap();
        assert_eq!(config.remote_jobs, Some(64));
        assert_eq!(config.heartbeat, Some(Duration::from_secs(90)));
        assert_eq!(config.sanitize_host, ["address", "undefined"]);
        assert!(config.use_goma);
        assert!(config.disable_installclean);
        assert_eq!(config.build_type.as_deref(), Some("release"));
        assert_eq!(config.dist_dir, Some(tmp.path().join("dist")));
        assert_eq!(config.logs_dir(), tmp.path().join("dist/logs"));
        assert_eq!(config.parallel, 3);
        assert_eq!(config.variant, Variant::UserDebug);
    }

    #[test]
    fn malformed_environment_values_are_input_errors() {
        let tmp = tree();
        for entry in [
            "NINJA_REMOTE_NUM_JOBS=many",
            "NINJA_HEARTBEAT_INTERVAL=soon",
            "NINJA_HEARTBEAT_INTERVAL=99999999999999999999999h",
            "USE_GOMA=maybe",
            "TARGET_BUILD_TYPE=fast",
        ] {
            let env = Environment::from_entries([entry]);
            let err = BuildConfig::from_args(&args(&[]), env, tmp.path()).unwrap_err();
            assert!(matches!(err, ConfigError::Env { .. }), "{entry}");
        }
        let err = BuildConfig::from_args(&args(&["--variant", "debug"]), Environment::new(), tmp.path())
            .unwrap_err();
        assert!(matches!(err, ConfigError::Variant(_)));
    }

    #[test]
    fn product_selection() {
        let tmp = tree();
        let all: Vec<String> = ["a", "b", "c", "d", "e"].map(String::from).to_vec();

        let config = BuildConfig::from_args(
            &args(&["--skip-products", "b,d"]),
            Environment::new(),
            tmp.path(),
        )
        .unwrap();
        assert_eq!(config.select_products(all.clone()).unwrap(), ["a", "c", "e"]);

        let config = BuildConfig::from_args(
            &args(&["--shard", "2", "--shard-count", "2"]),
            Environment::new(),
            tmp.path(),
        )
        .unwrap();
        assert_eq!(config.select_products(all.clone()).unwrap(), ["b", "d"]);

        let config = BuildConfig::from_args(
            &args(&["--products", "e,a"]),
            Environment::new(),
            tmp.path(),
        )
        .unwrap();
        assert_eq!(config.select_products(all.clone()).unwrap(), ["a", "e"]);

        let config = BuildConfig::from_args(
            &args(&["--products", "zz"]),
            Environment::new(),
            tmp.path(),
        )
        .unwrap();
        assert!(matches!(
            config.select_products(all),
            Err(ConfigError::UnknownProduct(_))
        ));

        let err = BuildConfig::from_args(
            &args(&["--shard", "3", "--shard-count", "2"]),
            Environment::new(),
            tmp.path(),
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::Shard { index: 3, count: 2 }));
    }

    #[test]
    fn product_names_must_be_plain_directory_names() {
        let tmp = tree();
        let config = BuildConfig::from_args(&args(&[]), Environment::new(), tmp.path()).unwrap();
        for bad in ["..", "../escape", "a/b", "logs", "."] {
            let all = vec!["aosp_arm".to_string(), bad.to_string()];
            match config.select_products(all) {
                Err(ConfigError::InvalidProduct(name)) => assert_eq!(name, bad),
                other => panic!("{bad}: {other:?}"),
            }
        }

        let config = BuildConfig::from_args(
            &args(&["--skip-products", "logs"]),
            Environment::new(),
            tmp.path(),
        )
        .unwrap();
        let all = vec!["aosp_arm".to_string(), "logs".to_string()];
        assert_eq!(config.select_products(all).unwrap(), ["aosp_arm"]);
    }
}
