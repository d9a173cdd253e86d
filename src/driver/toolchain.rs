//! The three capabilities the driver needs from the build system.

use std::fs::{self, OpenOptions};
use std::path::{Path, PathBuf};
use std::process::{Command, ExitStatus, Stdio};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::Deserialize;

use super::config::BuildConfig;
use super::job::ProductJob;
use crate::cancel::CancellationToken;
use crate::environment::Environment;

pub const TOOLCHAIN_FILE: &str = "build/multiproduct.toml";
const CHILD_POLL_INTERVAL: Duration = Duration::from_millis(100);

pub trait ProductToolchain: Send + Sync {
    /// Every product name the tree defines.
    fn list_products(&self, config: &BuildConfig) -> Result<Vec<String>>;

    /// Runs the configuration pass for `job`.
    fn configure(&self, config: &BuildConfig, job: &ProductJob, cancel: &CancellationToken)
        -> Result<()>;

    /// Builds `job`. Must return promptly once `cancel` fires.
    fn build(&self, config: &BuildConfig, job: &ProductJob, cancel: &CancellationToken)
        -> Result<()>;
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StepCommand {
    pub command: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BuildCommand {
    pub command: Vec<String>,
    #[serde(default)]
    pub soong_only_args: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct ToolchainFile {
    pub list: StepCommand,
    pub configure: StepCommand,
    pub build: BuildCommand,
}

impl Default for ToolchainFile {
    fn default() -> Self {
        let ui = "build/soong/soong_ui.bash".to_string();
        Self {
            list: StepCommand {
                command: vec![
                    ui.clone(),
                    "--dumpvar-mode".to_string(),
                    "all_named_products".to_string(),
                ],
            },
            configure: StepCommand {
                command: vec![ui.clone(), "--dumpvars-mode".to_string()],
            },
            build: BuildCommand {
                command: vec![ui, "--make-mode".to_string()],
                soong_only_args: vec!["--soong-only".to_string()],
            },
        }
    }
}

/// Runs external commands described by `build/multiproduct.toml`.
#[derive(Debug, Clone)]
pub struct CommandToolchain {
    source_root: PathBuf,
    file: ToolchainFile,
}

impl CommandToolchain {
    /// Reads the toolchain file under `source_root`, falling back to the
    /// defaults when it does not exist.
    pub fn load(source_root: &Path) -> Result<Self> {
        let path = source_root.join(TOOLCHAIN_FILE);
        let file = if path.is_file() {
            let text = fs::read_to_string(&path)
                .with_context(|| format!("reading toolchain config '{}'", path.display()))?;
            toml::from_str(&text)
                .with_context(|| format!("parsing toolchain config '{}'", path.display()))?
        } else {
            ToolchainFile::default()
        };
        for (name, command) in [
            ("list", &file.list.command),
            ("configure", &file.configure.command),
            ("build", &file.build.command),
        ] {
            if command.is_empty() {
                bail!(
                    "invalid toolchain config '{}': {name}.command is empty",
                    path.display()
                );
            }
        }
        Ok(Self {
            source_root: source_root.to_path_buf(),
            file,
        })
    }

    pub fn commands(&self) -> &ToolchainFile {
        &self.file
    }

    fn resolve(&self, program: &str) -> Result<PathBuf> {
        if program.contains('/') {
            let path = self.source_root.join(program);
            if !path.is_file() {
                bail!("'{}' does not exist", path.display());
            }
            return Ok(path);
        }
        which::which(program).with_context(|| format!("'{program}' not found in PATH"))
    }

    fn command(&self, argv: &[String], env: &Environment) -> Result<Command> {
        let Some((program, args)) = argv.split_first() else {
            bail!("empty command");
        };
        let mut cmd = Command::new(self.resolve(program)?);
        cmd.args(args)
            .env_clear()
            .envs(env.iter())
            .current_dir(&self.source_root)
            .stdin(Stdio::null());
        Ok(cmd)
    }

    fn run_logged(
        &self,
        mut cmd: Command,
        log: &Path,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let out = OpenOptions::new()
            .create(true)
            .append(true)
            .open(log)
            .with_context(|| format!("opening log '{}'", log.display()))?;
        let err = out.try_clone().context("duplicating log handle")?;
        let description = format!("{cmd:?}");
        tracing::debug!("running {description}");

        let mut child = cmd
            .stdout(out)
            .stderr(err)
            .spawn()
            .with_context(|| format!("starting {description}"))?;
        let status = wait_or_kill(&mut child, cancel)?;
        if !status.success() {
            bail!("{description} failed: {status}");
        }
        Ok(())
    }
}

fn wait_or_kill(child: &mut std::process::Child, cancel: &CancellationToken) -> Result<ExitStatus> {
    loop {
        if let Some(status) = child.try_wait().context("waiting for child")? {
            return Ok(status);
        }
        if cancel.wait_timeout(CHILD_POLL_INTERVAL) {
            let _ = child.kill();
            let _ = child.wait();
            bail!("cancelled");
        }
    }
}

impl ProductToolchain for CommandToolchain {
    fn list_products(&self, config: &BuildConfig) -> Result<Vec<String>> {
        let mut cmd = self.command(&self.file.list.command, &config.env)?;
        let output = cmd
            .stderr(Stdio::piped())
            .output()
            .context("listing products")?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            bail!(
                "listing products failed\n  Exit code: {}\n  stderr: {}",
                output.status.code().unwrap_or(-1),
                stderr.trim()
            );
        }
        let stdout = String::from_utf8_lossy(&output.stdout);
        Ok(stdout.split_whitespace().map(str::to_string).collect())
    }

    fn configure(
        &self,
        _config: &BuildConfig,
        job: &ProductJob,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let cmd = self.command(&self.file.configure.command, &job.env)?;
        self.run_logged(cmd, job.std_log(), cancel)
            .with_context(|| format!("configuring {}", job.product))
    }

    fn build(&self, config: &BuildConfig, job: &ProductJob, cancel: &CancellationToken) -> Result<()> {
        let mut cmd = self.command(&self.file.build.command, &job.env)?;
        if config.only_soong {
            cmd.args(&self.file.build.soong_only_args);
        }
        cmd.arg("-k").arg(config.keep_going.to_string());
        if let Some(jobs) = config.remote_jobs {
            cmd.arg(format!("-j{jobs}"));
        }
        self.run_logged(cmd, job.std_log(), cancel)
            .with_context(|| format!("building {}", job.product))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::config::{DriverArgs, SENTINEL_FILE};
    use clap::Parser;
    use std::os::unix::fs::PermissionsExt;
    use std::time::Instant;
    use tempfile::TempDir;

    fn tree() -> TempDir {
        let tmp = TempDir::new().unwrap();
        let sentinel = tmp.path().join(SENTINEL_FILE);
        fs::create_dir_all(sentinel.parent().unwrap()).unwrap();
        fs::write(&sentinel, "").unwrap();
        tmp
    }

    fn script(tmp: &TempDir, rel: &str, body: &str) {
        let path = tmp.path().join(rel);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
        fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
    }

    fn config(tmp: &TempDir) -> BuildConfig {
        let env = Environment::from_entries([format!(
            "PATH={}",
            std::env::var("PATH").unwrap_or_default()
        )]);
        let args = DriverArgs::parse_from(["multiproduct-build", "--out", "out/multi"]);
        BuildConfig::from_args(&args, env, tmp.path()).unwrap()
    }

    #[test]
    fn defaults_without_file() {
        let tmp = tree();
        let toolchain = CommandToolchain::load(tmp.path()).unwrap();
        assert_eq!(toolchain.commands(), &ToolchainFile::default());
        assert_eq!(toolchain.commands().build.soong_only_args, ["--soong-only"]);
    }

    #[test]
    fn runs_configured_commands_with_product_env() {
        let tmp = tree();
        script(&tmp, "tools/list.sh", "echo 'aosp_arm aosp_x86'\necho aosp_cf");
        script(&tmp, "tools/configure.sh", "echo \"configuring $TARGET_PRODUCT-$TARGET_BUILD_VARIANT\"");
        script(&tmp, "tools/build.sh", "echo \"args: $*\" >&2\nexit 3");
        fs::write(
            tmp.path().join(TOOLCHAIN_FILE),
            r#"
[list]
command = ["tools/list.sh"]

[configure]
command = ["tools/configure.sh"]

[build]
command = ["tools/build.sh", "--make-mode"]
"#,
        )
        .unwrap();

        let config = config(&tmp);
        let toolchain = CommandToolchain::load(tmp.path()).unwrap();
        assert_eq!(
            toolchain.list_products(&config).unwrap(),
            ["aosp_arm", "aosp_x86", "aosp_cf"]
        );

        let job = ProductJob::create(&config, "aosp_arm").unwrap();
        let cancel = CancellationToken::new();
        toolchain.configure(&config, &job, &cancel).unwrap();
        let err = toolchain.build(&config, &job, &cancel).unwrap_err();
        assert!(format!("{err:#}").contains("building aosp_arm"));

        let log = fs::read_to_string(job.std_log()).unwrap();
        assert!(log.contains("configuring aosp_arm-eng"));
        assert!(log.contains("args: --make-mode -k 1"));
    }

    #[test]
    fn cancellation_kills_child() {
        let tmp = tree();
        script(&tmp, "tools/slow.sh", "sleep 30");
        fs::write(
            tmp.path().join(TOOLCHAIN_FILE),
            "[list]\ncommand = [\"true\"]\n[configure]\ncommand = [\"true\"]\n[build]\ncommand = [\"tools/slow.sh\"]\n",
        )
        .unwrap();

        let config = config(&tmp);
        let toolchain = CommandToolchain::load(tmp.path()).unwrap();
        let job = ProductJob::create(&config, "slow").unwrap();
        let cancel = CancellationToken::new();
        let remote = cancel.clone();
        std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(100));
            remote.cancel();
        });

        let start = Instant::now();
        let err = toolchain.build(&config, &job, &cancel).unwrap_err();
        assert!(format!("{err:#}").contains("cancelled"));
        assert!(start.elapsed() < Duration::from_secs(10));
    }

    #[test]
    fn rejects_empty_command() {
        let tmp = tree();
        fs::write(
            tmp.path().join(TOOLCHAIN_FILE),
            "[list]\ncommand = []\n[configure]\ncommand = [\"true\"]\n[build]\ncommand = [\"true\"]\n",
        )
        .unwrap();
        assert!(CommandToolchain::load(tmp.path()).is_err());
    }
}
