//! # Stowage CLI - Versioned backups from the command line
//!
//! A command-line interface for the Stowage backup library.
//!
//! ## Features
//! - Configure sources and ignore rules for a backup target
//! - Back up incrementally, storing only what changed
//! - Restore any version in place or into another directory
//! - Verify archive digests, alone or with every dependency
//! - Generate X25519 key pairs for encrypted archives
//!
//! ## Usage
//! ```bash
//! # Set up a target and add a source
//! stowage --target /mnt/backup init
//! stowage --target /mnt/backup add ~/documents
//! stowage --target /mnt/backup exclude extension tmp
//!
//! # Back up, then restore the newest version elsewhere
//! stowage --target /mnt/backup backup
//! stowage --target /mnt/backup restore --to /tmp/restored
//!
//! # Check every archive the newest version needs
//! stowage --target /mnt/backup verify --full
//! ```

use anyhow::{bail, Context};
use clap::{Parser, Subcommand, ValueEnum};
use colored::*;
use humantime::format_duration;
use indicatif::{ProgressBar, ProgressStyle};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use stowage::rules::name_rule;
use stowage::utils::format_bytes;
use stowage::{
    ChangeCriterion, CryptoContext, KeyPair, NameIgnoreType, ProgressInfo, RestoreOptions, Stowage,
    StowageConfig, StowageError, VersionNumber,
};
use tracing_subscriber::EnvFilter;

/// Stowage CLI - Versioned, deduplicating, encrypted backups
#[derive(Parser)]
#[command(name = "stowage")]
#[command(version)]
#[command(about = "Versioned, deduplicating, encrypted backups in single-file archives")]
#[command(long_about = None)]
struct Cli {
    /// Backup target directory
    #[arg(short, long, global = true, default_value = ".")]
    target: PathBuf,

    /// Key file for encrypted archives
    #[arg(short, long, global = true)]
    key: Option<PathBuf>,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize a backup target
    Init,

    /// Add a source directory or file
    Add {
        /// Path to back up
        source: PathBuf,
    },

    /// Add an ignore rule
    Exclude {
        #[command(subcommand)]
        rule: ExcludeRule,
    },

    /// Change a setting
    Set {
        #[command(subcommand)]
        setting: Setting,
    },

    /// Back up every source as a new version
    #[command(alias = "b")]
    Backup,

    /// Restore a version
    #[command(alias = "rs")]
    Restore {
        /// Version to restore (negative counts back from the newest)
        #[arg(long, allow_negative_numbers = true, default_value_t = -1)]
        version: VersionNumber,

        /// Restore under this directory instead of the original locations
        #[arg(long)]
        to: Option<PathBuf>,

        /// Worker count
        #[arg(long)]
        workers: Option<usize>,
    },

    /// Verify archive digests
    Verify {
        /// Version to verify (negative counts back from the newest)
        #[arg(long, allow_negative_numbers = true, default_value_t = -1)]
        version: VersionNumber,

        /// Also verify every version it depends on
        #[arg(long)]
        full: bool,
    },

    /// Show information about the target
    Show {
        #[command(subcommand)]
        what: ShowWhat,
    },

    /// Generate a key pair
    Keygen {
        /// Where to write the private key; the public key goes next to it as .pub
        file: PathBuf,
    },
}

#[derive(Subcommand)]
enum ExcludeRule {
    /// Ignore objects by name (literal or glob)
    Name {
        pattern: String,

        /// Object kinds the rule applies to
        #[arg(long, value_enum, default_value = "all")]
        kind: KindArg,
    },
    /// Ignore files by extension
    Extension { extension: String },
    /// Ignore one path
    Path { path: PathBuf },
}

#[derive(Subcommand)]
enum Setting {
    /// How changed files are detected (archive-flag, size, date, hash, hash-auto)
    ChangeCriterion { criterion: ChangeCriterion },
    /// Payload compression
    Compression {
        #[arg(value_enum)]
        state: Toggle,
    },
    /// Default restore worker count
    Workers { workers: usize },
}

#[derive(Subcommand)]
enum ShowWhat {
    /// List versions
    Versions,
    /// Number the next backup will get
    VersionCount,
    /// Versions a version depends on
    Dependencies {
        #[arg(allow_negative_numbers = true)]
        version: VersionNumber,
    },
    /// Every object of a version
    Paths {
        #[arg(allow_negative_numbers = true)]
        version: VersionNumber,
    },
    /// Manifest of a version as JSON
    Manifest {
        #[arg(allow_negative_numbers = true)]
        version: VersionNumber,
    },
}

#[derive(Copy, Clone, PartialEq, Eq, ValueEnum)]
enum KindArg {
    File,
    Dir,
    All,
}

impl From<KindArg> for NameIgnoreType {
    fn from(kind: KindArg) -> Self {
        match kind {
            KindArg::File => NameIgnoreType::File,
            KindArg::Dir => NameIgnoreType::Directory,
            KindArg::All => NameIgnoreType::All,
        }
    }
}

#[derive(Copy, Clone, PartialEq, Eq, ValueEnum)]
enum Toggle {
    On,
    Off,
}

fn main() {
    let cli = Cli::parse();

    // Set up logging
    if cli.verbose || std::env::var_os("RUST_LOG").is_some() {
        let default = if cli.verbose { "stowage=debug" } else { "warn" };
        tracing_subscriber::fmt()
            .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default)))
            .with_writer(std::io::stderr)
            .init();
    }

    // Disable colors if needed
    if std::env::var("NO_COLOR").is_ok() {
        colored::control::set_override(false);
    }

    if let Err(e) = run(cli) {
        let message = match e.downcast_ref::<StowageError>() {
            Some(err) => err.user_message(),
            None => format!("{:#}", e),
        };
        eprintln!("{}: {}", "Error".red().bold(), message);
        std::process::exit(1);
    }
}

/// Main command runner
fn run(cli: Cli) -> anyhow::Result<()> {
    let target = cli.target;
    let key = cli.key;
    match cli.command {
        Commands::Init => cmd_init(&target, key.as_deref()),
        Commands::Add { source } => cmd_add(&target, &source),
        Commands::Exclude { rule } => cmd_exclude(&target, rule),
        Commands::Set { setting } => cmd_set(&target, setting),
        Commands::Backup => cmd_backup(&target, key.as_deref()),
        Commands::Restore { version, to, workers } => cmd_restore(&target, key.as_deref(), version, to, workers),
        Commands::Verify { version, full } => cmd_verify(&target, key.as_deref(), version, full),
        Commands::Show { what } => cmd_show(&target, key.as_deref(), what),
        Commands::Keygen { file } => cmd_keygen(&file),
    }
}

/// Open the target, loading the key file when one is given
fn open_stowage(target: &Path, key: Option<&Path>) -> anyhow::Result<Stowage> {
    let mut stowage = Stowage::open(target).with_context(|| format!("opening backup target {}", target.display()))?;
    if let Some(key) = key {
        let keypair = KeyPair::load(key)?;
        let cipher = stowage.config().cipher;
        stowage.set_crypto(Some(CryptoContext::new(keypair, cipher)));
    }
    Ok(stowage)
}

fn spinner(message: &'static str) -> anyhow::Result<ProgressBar> {
    let pb = ProgressBar::new_spinner();
    pb.set_style(ProgressStyle::default_spinner().template("{spinner:.green} {msg}")?);
    pb.enable_steady_tick(Duration::from_millis(100));
    pb.set_message(message);
    Ok(pb)
}

fn follow_progress(stowage: &mut Stowage, pb: &ProgressBar) {
    let pb = pb.clone();
    stowage.set_progress_callback(Some(Arc::new(move |info: ProgressInfo| {
        let item = info.current_item.unwrap_or_default();
        match info.total {
            Some(total) => pb.set_message(format!("{} {}/{} {}", info.operation, info.processed, total, item)),
            None => pb.set_message(format!("{} {} {}", info.operation, info.processed, item)),
        }
    })));
}

/// Initialize a backup target
///
/// With `--key`, new archives are encrypted for that key.
fn cmd_init(target: &Path, key: Option<&Path>) -> anyhow::Result<()> {
    let mut config = match Stowage::open(target) {
        Ok(existing) if !existing.config().sources.is_empty() => {
            bail!("{} is already configured", target.display())
        }
        _ => StowageConfig::default(),
    };
    if let Some(key) = key {
        KeyPair::load(key)?;
        config.public_key = Some(std::fs::canonicalize(key)?);
    }
    Stowage::init(target, config)?;

    println!("{} Initialized backup target", "✓".green().bold());
    println!("  Target: {}", target.display().to_string().cyan());
    if let Some(key) = key {
        println!("  Encrypted for: {}", key.display().to_string().cyan());
    }
    println!("\nNext steps:");
    println!("  - Add a source: {}", "stowage add <path>".yellow());
    println!("  - Back up: {}", "stowage backup".yellow());
    Ok(())
}

fn cmd_add(target: &Path, source: &Path) -> anyhow::Result<()> {
    let source = std::fs::canonicalize(source).with_context(|| format!("source {}", source.display()))?;
    let mut stowage = Stowage::open(target)?;
    if stowage.config().sources.contains(&source) {
        println!("{} {} is already a source", "•".dimmed(), source.display());
        return Ok(());
    }
    stowage.update_config(|config| config.sources.push(source.clone()))?;
    println!("{} Added source {}", "✓".green().bold(), source.display().to_string().cyan());
    Ok(())
}

fn cmd_exclude(target: &Path, rule: ExcludeRule) -> anyhow::Result<()> {
    let mut stowage = Stowage::open(target)?;
    let description = match rule {
        ExcludeRule::Name { pattern, kind } => {
            let description = format!("name {}", pattern);
            stowage.update_config(|config| config.ignored_names.push(name_rule(pattern, kind.into())))?;
            description
        }
        ExcludeRule::Extension { extension } => {
            let description = format!("extension {}", extension);
            stowage.update_config(|config| config.ignored_extensions.push(extension))?;
            description
        }
        ExcludeRule::Path { path } => {
            let description = format!("path {}", path.display());
            stowage.update_config(|config| config.ignored_paths.push(path))?;
            description
        }
    };
    println!("{} Ignoring {}", "✓".green().bold(), description.cyan());
    Ok(())
}

fn cmd_set(target: &Path, setting: Setting) -> anyhow::Result<()> {
    let mut stowage = Stowage::open(target)?;
    let description = match setting {
        Setting::ChangeCriterion { criterion } => {
            stowage.update_config(|config| config.change_criterion = criterion)?;
            format!("change criterion = {}", criterion)
        }
        Setting::Compression { state } => {
            let enabled = state == Toggle::On;
            stowage.update_config(|config| config.compression = enabled)?;
            format!("compression = {}", if enabled { "on" } else { "off" })
        }
        Setting::Workers { workers } => {
            if workers == 0 {
                bail!("worker count must be at least 1");
            }
            stowage.update_config(|config| config.restore_workers = workers)?;
            format!("restore workers = {}", workers)
        }
    };
    println!("{} Set {}", "✓".green().bold(), description.cyan());
    Ok(())
}

/// Back up every source as a new version
///
/// Only objects that changed since the newest version are stored; the
/// rest refer back to the archive that holds them.
fn cmd_backup(target: &Path, key: Option<&Path>) -> anyhow::Result<()> {
    let mut stowage = open_stowage(target, key)?;
    println!("{}", "Backing up...".blue().bold());

    let start = Instant::now();
    let pb = spinner("Scanning sources...")?;
    follow_progress(&mut stowage, &pb);
    let result = stowage.perform_backup();
    pb.finish_and_clear();
    let report = result?;

    println!(
        "{} Created version {}",
        "✓".green().bold(),
        report.version.to_string().yellow().bold()
    );
    println!("  Entries: {}", report.entry_count.to_string().cyan());
    println!(
        "  Stored: {} streams, {}",
        report.streams_stored.to_string().cyan(),
        format_bytes(report.bytes_stored).cyan()
    );
    println!("  Archive: {}", format_bytes(report.archive_size).cyan());
    if report.unmodified > 0 {
        println!("  Unmodified: {}", report.unmodified.to_string().dimmed());
    }
    if report.deduplicated > 0 {
        println!("  Deduplicated: {}", report.deduplicated.to_string().dimmed());
    }
    if report.ignored > 0 {
        println!("  Ignored: {}", report.ignored.to_string().dimmed());
    }
    if report.skipped > 0 {
        println!("  Skipped: {}", report.skipped.to_string().yellow());
    }
    if !report.dependencies.is_empty() {
        println!("  Depends on: {:?}", report.dependencies);
    }
    println!("  Time: {}", format_duration(round(start.elapsed())).to_string().cyan());
    Ok(())
}

/// Restore a version
///
/// Without `--to`, every root entry is restored to its original location,
/// replacing what is there.
fn cmd_restore(
    target: &Path,
    key: Option<&Path>,
    version: VersionNumber,
    to: Option<PathBuf>,
    workers: Option<usize>,
) -> anyhow::Result<()> {
    let mut stowage = open_stowage(target, key)?;
    println!("{} {}", "Restoring version".blue().bold(), version.to_string().yellow());

    let pb = spinner("Reading archives...")?;
    follow_progress(&mut stowage, &pb);
    let result = stowage.restore(version, RestoreOptions { destination: to, workers });
    pb.finish_and_clear();
    let report = result?;

    println!(
        "{} Restored version {}",
        "✓".green().bold(),
        report.version.to_string().yellow().bold()
    );
    println!("  Files: {}", report.files_restored.to_string().cyan());
    println!("  Bytes written: {}", format_bytes(report.bytes_written).cyan());
    if report.hardlinks_created > 0 {
        println!("  Hardlinks: {}", report.hardlinks_created.to_string().cyan());
    }
    println!("  Other objects: {}", report.objects_restored.to_string().cyan());
    println!("  Archives: {:?}", report.archives_opened);
    println!(
        "  Time: {}",
        format_duration(round(Duration::from_millis(report.duration_ms))).to_string().cyan()
    );
    Ok(())
}

fn cmd_verify(target: &Path, key: Option<&Path>, version: VersionNumber, full: bool) -> anyhow::Result<()> {
    let stowage = open_stowage(target, key)?;
    if !full {
        let resolved = stowage.manifest(version).map(|m| m.version_number).unwrap_or(version);
        if stowage.verify(version)? {
            println!("{} Version {} intact", "✓".green().bold(), resolved);
            return Ok(());
        }
        bail!("version {} failed verification", resolved);
    }

    let report = stowage.verification_report(version)?;
    for (v, ok) in &report.archives {
        if *ok {
            println!("  {} version {}", "✓".green(), v);
        } else {
            println!("  {} version {}", "✗".red(), v);
        }
    }
    if !report.is_valid() {
        bail!("{}", report);
    }
    println!("{} {}", "✓".green().bold(), report);
    Ok(())
}

fn cmd_show(target: &Path, key: Option<&Path>, what: ShowWhat) -> anyhow::Result<()> {
    let stowage = open_stowage(target, key)?;
    match what {
        ShowWhat::Versions => {
            let versions = stowage.list_versions()?;
            if versions.is_empty() {
                println!("{}", "No versions yet".dimmed());
            }
            for version in versions {
                match stowage.manifest(version) {
                    Ok(manifest) => println!(
                        "{}  {}  {} entries",
                        format!("{:>8}", version).yellow(),
                        manifest.creation_time.to_datetime().format("%Y-%m-%d %H:%M:%S"),
                        manifest.entry_count
                    ),
                    Err(e) => println!("{}  {}", format!("{:>8}", version).yellow(), e.to_string().red()),
                }
            }
        }
        ShowWhat::VersionCount => println!("{}", stowage.version_count()?),
        ShowWhat::Dependencies { version } => {
            for dep in stowage.version_dependencies(version)? {
                println!("{}", dep);
            }
        }
        ShowWhat::Paths { version } => {
            let tree = stowage.entries(version)?;
            for id in tree.iter() {
                let node = tree.node(id);
                println!(
                    "{:<9} {:<10} {:>10}  {}",
                    node.kind.to_string(),
                    format!("{:?}", node.backup_mode).dimmed(),
                    format_bytes(node.size),
                    tree.mapped_path(id).display()
                );
            }
        }
        ShowWhat::Manifest { version } => {
            println!("{}", serde_json::to_string_pretty(&stowage.manifest(version)?)?);
        }
    }
    Ok(())
}

fn cmd_keygen(file: &Path) -> anyhow::Result<()> {
    if file.exists() {
        bail!("{} already exists", file.display());
    }
    let keypair = Stowage::generate_keypair(file)?;
    println!("{} Wrote key pair to {}", "✓".green().bold(), file.display().to_string().cyan());
    println!("  Public key: {}", keypair.public_key().yellow());
    Ok(())
}

fn round(duration: Duration) -> Duration {
    Duration::from_millis(duration.as_millis() as u64)
}
