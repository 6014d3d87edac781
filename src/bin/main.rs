//! CLI for the snapshield parity-protection engine.

use clap::{Parser, Subcommand};
use snapshield::checkfix::{self, CheckOptions, DiskBlockSink};
use snapshield::config::{Config, Options};
use snapshield::error::EngineResult;
use snapshield::hash::{HashAlgo, HashSeed};
use snapshield::index::ContentIndex;
use snapshield::lock::RepoLock;
use snapshield::model::{BlockPos, DiskIndex, Repository};
use snapshield::parityfile::ParityFile;
use snapshield::scanner::{self, BlockReader, ReconcileConfig};
use snapshield::scheduler::{Interrupt, Scheduler};
use snapshield::scrub::{self, ScrubSelection};
use snapshield::sync::{self, DiskBlockSource, SyncOptions};
use snapshield::vfs::UnixVfs;
use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io;
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "snapshield")]
#[command(about = "snapshot-based parity protection for independent disks")]
#[command(arg_required_else_help = true)]
struct Cli {
    /// Configuration file (`-c`).
    #[arg(short = 'c', long = "conf", global = true)]
    conf: Option<PathBuf>,

    /// Filter pattern (`-f`), may be repeated.
    #[arg(short = 'f', long = "filter", global = true)]
    filter: Vec<String>,

    /// Disk filter (`-d`), may be repeated.
    #[arg(short = 'd', long = "disk-filter", global = true)]
    disk_filter: Vec<String>,

    /// Error-state filter (`-e`), may be repeated. Narrows `check`/`fix` to
    /// one kind of damage (`missing`, `parity`, `unrecoverable`).
    #[arg(short = 'e', long = "error-filter", global = true)]
    error_filter: Vec<String>,

    /// Percentage of positions to scrub (`-p`).
    #[arg(short = 'p', long = "percent", global = true)]
    percent: Option<u8>,

    /// Age threshold in days for scrub selection (`-o`).
    #[arg(short = 'o', long = "older", global = true)]
    older: Option<u32>,

    /// Verbose logging (`-v`).
    #[arg(short = 'v', long = "verbose", global = true)]
    verbose: bool,

    /// Quiet logging (`-q`).
    #[arg(short = 'q', long = "quiet", global = true)]
    quiet: bool,

    /// Disable recovery writes (`-N`).
    #[arg(short = 'N', long = "no-recover", global = true)]
    no_recover: bool,

    /// Log file (`-L`).
    #[arg(short = 'L', long = "log", global = true)]
    log: Option<PathBuf>,

    #[command(flatten)]
    force: ForceFlags,

    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Args)]
struct ForceFlags {
    #[arg(long = "force-zero", global = true)]
    force_zero: bool,
    #[arg(long = "force-empty", global = true)]
    force_empty: bool,
    #[arg(long = "force-uuid", global = true)]
    force_uuid: bool,
    #[arg(long = "force-device", global = true)]
    force_device: bool,
    #[arg(long = "force-nocopy", global = true)]
    force_nocopy: bool,
    #[arg(long = "force-full", global = true)]
    force_full: bool,
    #[arg(long = "skip-lock", global = true)]
    skip_lock: bool,
    #[arg(long = "skip-sign", global = true)]
    skip_sign: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Compute parity for new/changed blocks and persist the content index.
    Sync,
    /// Re-verify a sampled subset of blocks for silent corruption.
    Scrub,
    /// Validate every block without writing.
    Check,
    /// Validate and repair recoverable blocks, writing back to disk.
    Fix,
    /// Summarize the repository's current state.
    Status,
    /// List files tracked by the repository.
    List,
}

impl From<&Cli> for Options {
    fn from(cli: &Cli) -> Options {
        Options {
            force_zero: cli.force.force_zero,
            force_empty: cli.force.force_empty,
            force_uuid: cli.force.force_uuid,
            force_device: cli.force.force_device,
            force_nocopy: cli.force.force_nocopy,
            force_full: cli.force.force_full,
            skip_lock: cli.force.skip_lock,
            skip_sign: cli.force.skip_sign,
            ..Options::default()
        }
    }
}

/// Sets up the global subscriber. `-L <log>` routes output to that file
/// through a non-rotating appender instead of stdout; the returned guard
/// must be kept alive for the duration of `main` so buffered lines are
/// flushed on exit.
fn init_logging(verbose: bool, quiet: bool, log: Option<&PathBuf>) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let default_filter = if std::env::var("SNAPRAID_DEBUG").as_deref() == Ok("1") {
        "debug"
    } else if verbose {
        "debug"
    } else if quiet {
        "error"
    } else {
        "info"
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));

    match log {
        Some(path) => {
            let dir = path.parent().filter(|p| !p.as_os_str().is_empty()).unwrap_or_else(|| Path::new("."));
            let file_name = path.file_name().map(|f| f.to_owned()).unwrap_or_else(|| "snapraid.log".into());
            let appender = tracing_appender::rolling::never(dir, file_name);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            tracing_subscriber::fmt().with_env_filter(filter).with_writer(writer).with_ansi(false).init();
            Some(guard)
        }
        None => {
            tracing_subscriber::fmt().with_env_filter(filter).init();
            None
        }
    }
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    let _log_guard = init_logging(cli.verbose, cli.quiet, cli.log.as_ref());

    let conf_path = match &cli.conf {
        Some(p) => p.clone(),
        None => {
            error!("missing -c <conf>; a configuration file is required");
            return ExitCode::from(2);
        }
    };

    let mut config = match Config::load(&conf_path) {
        Ok(c) => c,
        Err(e) => {
            error!("{e}");
            return ExitCode::from(2);
        }
    };
    for pattern in &cli.filter {
        config.filter.include_path(pattern);
    }
    for pattern in &cli.disk_filter {
        config.filter.include_disk(pattern);
    }
    for pattern in &cli.error_filter {
        config.filter.include_error(pattern);
    }

    let options = Options::from(&cli);

    let lock_path = config
        .content_paths
        .first()
        .map(|p| p.with_file_name("snapraid.lock"))
        .unwrap_or_else(|| PathBuf::from("snapraid.lock"));
    let _lock = if options.skip_lock {
        RepoLock::disabled()
    } else {
        match RepoLock::acquire(&lock_path) {
            Ok(l) => l,
            Err(e) => {
                error!("could not acquire repository lock at {lock_path:?}: {e}");
                return ExitCode::from(1);
            }
        }
    };

    let result = match cli.command {
        Commands::Sync => run_sync(&config, &options),
        Commands::Scrub => run_scrub(&config, &options, cli.percent, cli.older),
        Commands::Check => run_checkfix(&config, &options, false, cli.no_recover),
        Commands::Fix => run_checkfix(&config, &options, true, cli.no_recover),
        Commands::Status => run_status(&config, &options),
        Commands::List => run_list(&config, &options),
    };

    match result {
        Ok(code) => code,
        Err(e) => {
            error!("{e}");
            ExitCode::from(1)
        }
    }
}

/// Maps every known `(disk, pos)` to a byte range inside the owning file on
/// the real filesystem, so the generic engine traits can be driven against
/// actual disk content instead of the in-memory fakes the library's own
/// tests use.
struct RealDiskIo {
    locations: HashMap<(DiskIndex, BlockPos), (PathBuf, u64, u64)>,
}

impl RealDiskIo {
    fn build(config: &Config, repo: &Repository) -> Self {
        let mut locations = HashMap::new();
        for disk in &repo.disks {
            let Some(root) = config.data_disks.iter().find(|d| d.name == disk.name).map(|d| d.path.clone()) else {
                continue;
            };
            for file in repo.files.iter_disk(disk.index) {
                for (i, &pos) in file.blocks.iter().enumerate() {
                    let offset = i as u64 * repo.block_size;
                    locations.insert((disk.index, pos), (root.join(&file.path), offset, file.size));
                }
            }
        }
        RealDiskIo { locations }
    }
}

impl DiskBlockSource for RealDiskIo {
    fn read_block(&self, disk: DiskIndex, pos: u64, block_size: u64) -> io::Result<Vec<u8>> {
        let (path, offset, file_size) =
            self.locations.get(&(disk, pos)).ok_or_else(|| io::Error::from(io::ErrorKind::NotFound))?;
        let mut buf = vec![0u8; block_size as usize];
        let readable = file_size.saturating_sub(*offset).min(block_size) as usize;
        if readable > 0 {
            let file = File::open(path)?;
            file.read_exact_at(&mut buf[..readable], *offset)?;
        }
        Ok(buf)
    }
}

impl DiskBlockSink for RealDiskIo {
    fn write_block(&self, disk: DiskIndex, pos: u64, bytes: &[u8]) -> io::Result<()> {
        let (path, offset, _) =
            self.locations.get(&(disk, pos)).ok_or_else(|| io::Error::from(io::ErrorKind::NotFound))?;
        let file = OpenOptions::new().write(true).open(path)?;
        file.write_all_at(bytes, *offset)
    }
}

/// Reads a file relative to a disk's configured root, for the scanner's
/// copy-detection hashing pass.
struct RealBlockReader<'a> {
    root: &'a Path,
}

impl BlockReader for RealBlockReader<'_> {
    fn read_block(&self, path: &str, index: u64, block_size: u64) -> io::Result<Vec<u8>> {
        let full = self.root.join(path);
        let mut buf = vec![0u8; block_size as usize];
        let file = File::open(&full)?;
        let size = file.metadata()?.len();
        let offset = index * block_size;
        let readable = size.saturating_sub(offset).min(block_size) as usize;
        if readable > 0 {
            file.read_exact_at(&mut buf[..readable], offset)?;
        }
        Ok(buf)
    }
}

/// Loads the existing content index if one is present, or starts a fresh
/// repository otherwise. Either way, every disk's mount point is taken from
/// the configuration, never from the persisted index — the wire format
/// carries the disk name but not where it's currently mounted.
fn load_or_init_index(config: &Config, options: &Options) -> EngineResult<ContentIndex> {
    let mut index = {
        let mut found = None;
        for path in &config.content_paths {
            if path.exists() {
                found = Some(ContentIndex::read(path, options.skip_sign)?);
                break;
            }
        }
        match found {
            Some(index) => index,
            None => {
                let repo = Repository::new(config.block_size, config.parity_level());
                let algo = if options.force_spooky2 { HashAlgo::Spooky2 } else { HashAlgo::Murmur3 };
                ContentIndex::new(repo, algo, HashSeed::generate())
            }
        }
    };

    for disk in &config.data_disks {
        let mount_point = disk.path.to_string_lossy().into_owned();
        match index.repo.disks.iter_mut().find(|d| d.name == disk.name) {
            Some(existing) => existing.mount_point = mount_point,
            None => {
                index.repo.add_disk(disk.name.clone(), mount_point);
            }
        }
    }
    Ok(index)
}

fn rescan_disks(index: &mut ContentIndex, config: &Config, options: &Options) -> EngineResult<()> {
    let vfs = UnixVfs;
    let cfg = ReconcileConfig { force_empty: options.force_empty, force_nocopy: options.force_nocopy };
    let disks: Vec<(DiskIndex, PathBuf)> =
        index.repo.disks.iter().map(|d| (d.index, PathBuf::from(d.mount_point.clone()))).collect();
    for (disk, root) in disks {
        let scanned = scanner::scan_disk(&vfs, &root, &config.filter)?;
        let reader = RealBlockReader { root: &root };
        let report = scanner::reconcile(
            &mut index.repo,
            disk,
            &scanned,
            &reader,
            index.hash_algo,
            &index.hash_seed,
            cfg,
        )?;
        info!(disk, ?report, "scan complete");
    }
    Ok(())
}

fn open_parity_files(config: &Config, index: &ContentIndex, options: &Options) -> io::Result<Vec<ParityFile>> {
    let repo = &index.repo;
    let grow_to = repo.row_count().max(index.loaded_paritymax).max(1);
    let mut files = Vec::new();
    for level in 1..=config.parity_level() {
        let Some(paths) = config.parity_paths.get(&level) else {
            continue;
        };
        let Some(path) = paths.first() else { continue };
        files.push(ParityFile::open(path, config.block_size, grow_to, options.skip_fallocate, !options.skip_sequential)?);
    }
    Ok(files)
}

fn now_unix() -> i64 {
    SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_secs() as i64).unwrap_or(0)
}

fn run_sync(config: &Config, options: &Options) -> EngineResult<ExitCode> {
    let mut index = load_or_init_index(config, options)?;
    rescan_disks(&mut index, config, options)?;
    let mut parity = open_parity_files(config, &index, options)?;
    let io = RealDiskIo::build(config, &index.repo);

    let opts = SyncOptions {
        autosave_bytes: config.autosave_bytes,
        skip_sign: options.skip_sign,
        content_paths: config.content_paths.clone(),
        text_content: options.force_content_text,
    };
    let report = sync::sync(&mut index, &mut parity, &io, &Interrupt::new(), &mut Scheduler::new(), &opts)?;
    println!(
        "sync: scanned {} position(s), wrote {}, {} parity byte(s){}",
        report.positions_scanned,
        report.positions_written,
        report.parity_bytes_written,
        if report.interrupted { " (interrupted)" } else { "" }
    );
    Ok(if report.interrupted { ExitCode::from(3) } else { ExitCode::SUCCESS })
}

fn run_scrub(config: &Config, options: &Options, percent: Option<u8>, older: Option<u32>) -> EngineResult<ExitCode> {
    let mut index = load_or_init_index(config, options)?;
    let mut parity = open_parity_files(config, &index, options)?;
    let io = RealDiskIo::build(config, &index.repo);
    let now = now_unix();

    let disks: Vec<DiskIndex> = index.repo.disks.iter().map(|d| d.index).collect();
    let mut positions = Vec::new();
    for disk in disks {
        let sel = ScrubSelection { older_than_days: older, percentage: percent.or(Some(8)), now_unix: now };
        positions.extend(scrub::select_positions(&index, disk, &sel));
    }
    positions.sort_unstable();
    positions.dedup();

    let report = scrub::scrub(&mut index, &mut parity, &io, &positions, now)?;
    println!(
        "scrub: checked {}, clean {}, silent corruption {}, repaired {}, unrecoverable {}",
        report.checked, report.clean, report.silent_corruption, report.repaired, report.unrecoverable
    );
    if !config.content_paths.is_empty() {
        let paths: Vec<&Path> = config.content_paths.iter().map(|p| p.as_path()).collect();
        index.write_all(&paths, options.force_content_text)?;
    }
    Ok(if report.unrecoverable > 0 { ExitCode::from(1) } else { ExitCode::SUCCESS })
}

fn run_checkfix(config: &Config, options: &Options, fix: bool, no_recover: bool) -> EngineResult<ExitCode> {
    let mut index = load_or_init_index(config, options)?;
    let mut parity = open_parity_files(config, &index, options)?;
    let io = RealDiskIo::build(config, &index.repo);

    let write_back = fix && !no_recover;
    let opts = CheckOptions { known_garbage: 0, write_back, error_filter: config.filter.clone() };
    let sink: Option<&dyn DiskBlockSink> = if write_back { Some(&io) } else { None };
    let report = checkfix::run(&mut index, &mut parity, &io, sink, &opts)?;
    println!(
        "{}: verified {}, recovered {}, unrecoverable {}, garbage {}, parity errors {}",
        if fix { "fix" } else { "check" },
        report.verified,
        report.recovered,
        report.unrecoverable,
        report.garbage,
        report.parity_errors
    );
    if write_back && !config.content_paths.is_empty() {
        let paths: Vec<&Path> = config.content_paths.iter().map(|p| p.as_path()).collect();
        index.write_all(&paths, options.force_content_text)?;
    }
    Ok(if report.unrecoverable > 0 || report.parity_errors > 0 { ExitCode::from(1) } else { ExitCode::SUCCESS })
}

fn run_status(config: &Config, options: &Options) -> EngineResult<ExitCode> {
    let index = load_or_init_index(config, options)?;
    println!(
        "status: {} disk(s), {} parity level(s), block size {} bytes, {} row(s), {} file(s)",
        index.repo.disks.len(),
        config.parity_level(),
        config.block_size,
        index.repo.row_count(),
        index.repo.files.len()
    );
    Ok(ExitCode::SUCCESS)
}

fn run_list(config: &Config, options: &Options) -> EngineResult<ExitCode> {
    let index = load_or_init_index(config, options)?;
    for disk in &index.repo.disks {
        for file in index.repo.files.iter_disk(disk.index) {
            println!("{}/{} ({} bytes)", disk.name, file.path, file.size);
        }
    }
    Ok(ExitCode::SUCCESS)
}
