use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Component, Path, PathBuf};

use anyhow::{bail, Context, Result};
use clap::{ArgAction, Parser};
use flate2::Compression;
use tracing_subscriber::EnvFilter;
use walkdir::WalkDir;

use multiproduct_builder::archive::parallel::DEFAULT_LEVEL;
use multiproduct_builder::archive::{
    ArchiveReader, DosTime, EntrySource, FileEntry, Method, ParallelZip, ZipOptions,
};
use multiproduct_builder::rate_limit::DEFAULT_MAX_BYTES;

/// Writes a ZIP archive, compressing files in parallel.
#[derive(Debug, Parser)]
#[command(name = "parallel-zip", version)]
struct Args {
    /// Output archive.
    #[arg(short = 'o')]
    output: PathBuf,

    /// Entry names are relative to this directory.
    #[arg(short = 'C', default_value = ".")]
    root: PathBuf,

    /// File to add.
    #[arg(short = 'f')]
    files: Vec<PathBuf>,

    /// Directory to add recursively.
    #[arg(short = 'D')]
    dirs: Vec<PathBuf>,

    /// File listing paths to add, one per line.
    #[arg(short = 'l')]
    lists: Vec<PathBuf>,

    /// Write directory entries for every parent directory.
    #[arg(short = 'd')]
    emit_directories: bool,

    /// Store every file without compression.
    #[arg(short = 's')]
    store: bool,

    /// Deflate level; 0 stores.
    #[arg(short = 'L', default_value_t = DEFAULT_LEVEL, value_parser = clap::value_parser!(u32).range(0..=9))]
    level: u32,

    /// Parallel compression jobs (0 = CPU count).
    #[arg(short = 'j', default_value_t = 0)]
    jobs: usize,

    /// Compressed bytes allowed in memory at once.
    #[arg(long, default_value_t = DEFAULT_MAX_BYTES)]
    memory: i64,

    /// Archive what symlinks point to instead of the links.
    #[arg(long)]
    follow_symlinks: bool,

    /// Copy every entry of an existing archive without recompressing.
    #[arg(long)]
    merge: Vec<PathBuf>,

    /// Modification time for new entries, in seconds since the epoch.
    #[arg(long)]
    timestamp: Option<i64>,

    /// Increase log verbosity (-v, -vv).
    #[arg(short, long, action = ArgAction::Count)]
    verbose: u8,
}

fn main() -> Result<()> {
    let args = Args::parse();
    init_tracing(args.verbose);

    let cwd = std::env::current_dir().context("resolving working directory")?;
    let root = normalize(&cwd, &args.root);

    let timestamp = match args.timestamp {
        Some(seconds) => DosTime::from_unix(seconds)?,
        None => DosTime::DEFAULT,
    };
    let options = ZipOptions {
        parallelism: args.jobs,
        max_memory: args.memory,
        level: Compression::new(args.level),
        emit_directories: args.emit_directories,
        timestamp,
    };
    let method = if args.store || args.level == 0 {
        Method::Stored
    } else {
        Method::Deflated
    };

    let mut zip = ParallelZip::create(&args.output, options)
        .with_context(|| format!("creating '{}'", args.output.display()))?;
    let adder = Adder {
        root,
        cwd,
        method,
        follow_symlinks: args.follow_symlinks,
        emit_directories: args.emit_directories,
    };

    for file in &args.files {
        adder.add_path(&mut zip, file)?;
    }
    for list in &args.lists {
        let text = fs::read_to_string(list)
            .with_context(|| format!("reading list '{}'", list.display()))?;
        for line in text.lines().map(str::trim).filter(|line| !line.is_empty()) {
            adder.add_path(&mut zip, Path::new(line))?;
        }
    }
    for dir in &args.dirs {
        adder.add_tree(&mut zip, dir)?;
    }
    for archive in &args.merge {
        let reader = ArchiveReader::open(archive)?;
        for entry in reader.entries() {
            zip.copy_from(&reader, entry, None)
                .with_context(|| format!("merging '{}' from '{}'", entry.name(), archive.display()))?;
        }
    }

    zip.finish()
        .with_context(|| format!("writing '{}'", args.output.display()))?;
    tracing::debug!("wrote {}", args.output.display());
    Ok(())
}

struct Adder {
    root: PathBuf,
    cwd: PathBuf,
    method: Method,
    follow_symlinks: bool,
    emit_directories: bool,
}

impl Adder {
    fn add_tree(&self, zip: &mut ParallelZip, dir: &Path) -> Result<()> {
        let walker = WalkDir::new(dir)
            .follow_links(self.follow_symlinks)
            .sort_by_file_name();
        for entry in walker {
            let entry = entry.with_context(|| format!("walking '{}'", dir.display()))?;
            if entry.file_type().is_dir() {
                if self.emit_directories {
                    let name = self.entry_name(entry.path())?;
                    if !name.is_empty() {
                        zip.add_directory(&name)?;
                    }
                }
                continue;
            }
            self.add_path(zip, entry.path())?;
        }
        Ok(())
    }

    fn add_path(&self, zip: &mut ParallelZip, path: &Path) -> Result<()> {
        let name = self.entry_name(path)?;
        let meta = if self.follow_symlinks {
            fs::metadata(path)
        } else {
            fs::symlink_metadata(path)
        }
        .with_context(|| format!("reading metadata of '{}'", path.display()))?;

        if meta.file_type().is_symlink() {
            let target = fs::read_link(path)
                .with_context(|| format!("reading link '{}'", path.display()))?;
            zip.add_symlink(&name, &target.to_string_lossy())?;
        } else if meta.is_dir() {
            zip.add_directory(&name)?;
        } else {
            let source = EntrySource::open(path)
                .with_context(|| format!("opening '{}'", path.display()))?;
            let entry = FileEntry::new(name, source)
                .method(self.method)
                .permissions(meta.permissions().mode());
            zip.add_file(entry)?;
        }
        Ok(())
    }

    fn entry_name(&self, path: &Path) -> Result<String> {
        let path = normalize(&self.cwd, path);
        let Ok(rel) = path.strip_prefix(&self.root) else {
            bail!(
                "'{}' is not under '{}'",
                path.display(),
                self.root.display()
            );
        };
        Ok(rel.to_string_lossy().into_owned())
    }
}

/// Absolute form of `path` without `.` or `..` components.
fn normalize(cwd: &Path, path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in cwd.join(path).components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            other => out.push(other),
        }
    }
    out
}

fn init_tracing(verbose: u8) {
    let level = match verbose {
        0 => "warn",
        1 => "info",
        _ => "debug",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(format!("multiproduct_builder={level},parallel_zip={level}"))
    });
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_level(true)
        .finish();

    let _ = tracing::subscriber::set_global_default(subscriber);
}
