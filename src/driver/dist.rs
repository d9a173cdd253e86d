//! Bundles the per-product logs into the dist directory.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use walkdir::WalkDir;

use crate::archive::{EntrySource, FileEntry, ParallelZip, ZipOptions};

pub const LOGS_ARCHIVE: &str = "logs.zip";

/// Writes every file under `logs_dir` into `dist_dir/logs.zip` as
/// `logs/<relative path>`.
pub fn bundle_logs(logs_dir: &Path, dist_dir: &Path) -> Result<PathBuf> {
    fs::create_dir_all(dist_dir)
        .with_context(|| format!("creating dist directory '{}'", dist_dir.display()))?;
    let output = dist_dir.join(LOGS_ARCHIVE);

    let options = ZipOptions {
        emit_directories: true,
        ..ZipOptions::default()
    };
    let mut zip = ParallelZip::create(&output, options)
        .with_context(|| format!("creating '{}'", output.display()))?;

    for entry in WalkDir::new(logs_dir).sort_by_file_name() {
        let entry = entry.with_context(|| format!("walking '{}'", logs_dir.display()))?;
        if !entry.file_type().is_file() {
            continue;
        }
        let rel = entry
            .path()
            .strip_prefix(logs_dir)
            .with_context(|| format!("'{}' is outside the logs", entry.path().display()))?;
        let name = format!("logs/{}", rel.to_string_lossy());
        let source = EntrySource::open(entry.path())
            .with_context(|| format!("opening '{}'", entry.path().display()))?;
        zip.add_file(FileEntry::new(name, source))
            .with_context(|| format!("adding '{}'", entry.path().display()))?;
    }

    zip.finish()
        .with_context(|| format!("writing '{}'", output.display()))?;
    tracing::info!("logs bundled into {}", output.display());
    Ok(output)
}
