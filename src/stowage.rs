//! Main Stowage implementation
//!
//! This module provides the [`Stowage`] struct, the entry point for backing
//! up source directories into a backup target and restoring any version
//! back out of it.
//!
//! ## Overview
//!
//! `Stowage` ties the subsystems together:
//!
//! - **Scanner**: builds the new version's object forest from the sources
//! - **Orchestrator**: decides per object whether to store new content,
//!   refer back to an earlier version, or store nothing
//! - **Archive Container**: one file per version holding content streams,
//!   the forest and the manifest, closed by a whole-file digest
//! - **Version Graph**: resolves which earlier archives a version needs
//! - **Restore Engine**: replays content from those archives in one pass each
//! - **Verifier**: checks trailer digests
//!
//! ## Target Layout
//!
//! ```text
//! <target>/
//! ├── stowage.json            configuration
//! ├── version00000000.arc
//! ├── version00000001.arc
//! └── .aux/fso00000001.dat    forest side-files
//! ```
//!
//! ## Examples
//!
//! ```rust,no_run
//! use stowage::{RestoreOptions, StowageBuilder};
//! use std::path::PathBuf;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let mut stowage = StowageBuilder::new()
//!     .source("/home/user/documents")
//!     .ignore_extension("tmp")
//!     .open("/mnt/backup/documents")?;
//!
//! // First run stores everything, later runs only what changed
//! let report = stowage.perform_backup()?;
//! println!("{}", report);
//!
//! // Restore the newest version somewhere else
//! stowage.restore(-1, RestoreOptions {
//!     destination: Some(PathBuf::from("/tmp/restored")),
//!     ..Default::default()
//! })?;
//! # Ok(())
//! # }
//! ```

use crate::archive::ArchiveSettings;
use crate::backup::Orchestrator;
use crate::error::{Result, StowageError};
use crate::filesystem::{ErrorReporter, FileSystemAccess, LocalFilesystem, LoggingErrorReporter};
use crate::keys::{CryptoContext, KeyPair};
use crate::manifest::VersionManifest;
use crate::restore::RestoreEngine;
use crate::rules::{name_rule, IgnoreRules};
use crate::scan::TreeBuilder;
use crate::target::BackupTarget;
use crate::tree::{ObjectTree, SerializedNode};
use crate::types::*;
use crate::verification::{VerificationReport, Verifier};
use crate::version_graph::VersionGraph;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, instrument, warn};

/// Main Stowage struct for backup and restore
///
/// A `Stowage` instance owns one backup target and its configuration. All
/// filesystem access goes through a [`FileSystemAccess`] implementation and
/// all per-object scan errors through an [`ErrorReporter`], both replaceable
/// through [`StowageBuilder`].
///
/// # Examples
///
/// ```rust,no_run
/// use stowage::Stowage;
///
/// # fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let stowage = Stowage::open("/mnt/backup/documents")?;
/// for version in stowage.list_versions()? {
///     let manifest = stowage.manifest(version)?;
///     println!("{}: {} entries", version, manifest.entry_count);
/// }
/// # Ok(())
/// # }
/// ```
pub struct Stowage {
    /// Target directory
    target: BackupTarget,
    /// Persisted configuration
    config: StowageConfig,
    /// Compiled ignore rules
    rules: IgnoreRules,
    /// Key material for encrypted archives
    crypto: Option<CryptoContext>,
    /// Filesystem access layer
    fs: Arc<dyn FileSystemAccess>,
    /// Receives per-object scan errors
    reporter: Arc<dyn ErrorReporter>,
    /// Progress callback for backup and restore
    progress: Option<ProgressCallback>,
}

impl std::fmt::Debug for Stowage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Stowage")
            .field("target", &self.target.root())
            .field("config", &self.config)
            .field("crypto", &self.crypto.as_ref().map(|c| c.cipher()))
            .field("progress", &self.progress.is_some())
            .finish()
    }
}

impl Stowage {
    /// Initialize a backup target with a configuration
    ///
    /// Writes `stowage.json` into `target`, creating the directory if
    /// needed. An existing configuration is replaced; existing versions are
    /// left untouched.
    ///
    /// # Errors
    ///
    /// - [`StowageError::InvalidConfiguration`] if `target` exists and is not a directory
    /// - [`StowageError::InvalidPattern`] if an ignore rule does not compile
    #[instrument(skip(config))]
    pub fn init(target: impl AsRef<Path> + std::fmt::Debug, config: StowageConfig) -> Result<Self> {
        let target = BackupTarget::open(target.as_ref())?;
        let rules = IgnoreRules::from_config(&config)?;
        target.save_config(&config)?;
        info!("Initialized backup target {:?}", target.root());
        let crypto = Self::crypto_from_config(&config)?;
        Ok(Self {
            target,
            config,
            rules,
            crypto,
            fs: Arc::new(LocalFilesystem::new()),
            reporter: Arc::new(LoggingErrorReporter),
            progress: None,
        })
    }

    /// Open a backup target
    ///
    /// Loads the persisted configuration, or uses defaults when there is
    /// none. A public key recorded in the configuration is loaded so new
    /// archives are encrypted; restoring them needs the private key, see
    /// [`Stowage::set_crypto`].
    ///
    /// # Errors
    ///
    /// - [`StowageError::InvalidConfiguration`] if `target` exists and is not a directory
    /// - [`StowageError::Json`] if the configuration file is malformed
    pub fn open(target: impl AsRef<Path>) -> Result<Self> {
        let target = BackupTarget::open(target.as_ref())?;
        let config = target.load_config()?.unwrap_or_default();
        let rules = IgnoreRules::from_config(&config)?;
        let crypto = Self::crypto_from_config(&config)?;
        debug!("Opened backup target {:?}", target.root());
        Ok(Self {
            target,
            config,
            rules,
            crypto,
            fs: Arc::new(LocalFilesystem::new()),
            reporter: Arc::new(LoggingErrorReporter),
            progress: None,
        })
    }

    fn crypto_from_config(config: &StowageConfig) -> Result<Option<CryptoContext>> {
        match &config.public_key {
            Some(path) => Ok(Some(CryptoContext::new(KeyPair::load(path)?, config.cipher))),
            None => Ok(None),
        }
    }

    /// Generate a key pair and write it to `path`
    ///
    /// The file holds the private key with the public key as a comment; a
    /// public-only copy is written next to it with a `.pub` extension.
    pub fn generate_keypair(path: &Path) -> Result<KeyPair> {
        let keypair = KeyPair::generate();
        keypair.save(path)?;
        keypair.save_public(&path.with_extension("pub"))?;
        Ok(keypair)
    }

    /// Target directory
    pub fn target(&self) -> &Path {
        self.target.root()
    }

    /// Current configuration
    pub fn config(&self) -> &StowageConfig {
        &self.config
    }

    /// Replace the key material used for archive I/O
    pub fn set_crypto(&mut self, crypto: Option<CryptoContext>) {
        if let Some(ctx) = &crypto {
            self.config.cipher = ctx.cipher();
        }
        self.crypto = crypto;
    }

    /// Set a progress callback for backup and restore
    pub fn set_progress_callback(&mut self, callback: Option<ProgressCallback>) {
        self.progress = callback;
    }

    /// Change the configuration and persist it
    ///
    /// The ignore rules are recompiled; if they do not compile, nothing is
    /// changed.
    ///
    /// # Examples
    ///
    /// ```rust,no_run
    /// # use stowage::{Stowage, ChangeCriterion};
    /// # fn main() -> Result<(), Box<dyn std::error::Error>> {
    /// let mut stowage = Stowage::open("/mnt/backup")?;
    /// stowage.update_config(|config| config.change_criterion = ChangeCriterion::Hash)?;
    /// # Ok(())
    /// # }
    /// ```
    pub fn update_config<F>(&mut self, update: F) -> Result<()>
    where
        F: FnOnce(&mut StowageConfig),
    {
        let mut config = self.config.clone();
        update(&mut config);
        self.rules = IgnoreRules::from_config(&config)?;
        self.target.save_config(&config)?;
        self.config = config;
        Ok(())
    }

    fn settings(&self) -> ArchiveSettings {
        ArchiveSettings {
            compression: self.config.compression,
            chunk_size: self.config.chunk_size,
        }
    }

    /// Back up every configured source as a new version
    ///
    /// Version 0 stores every eligible object. Later versions compare each
    /// object with the newest existing version using the configured change
    /// criterion and store only what changed.
    ///
    /// After the archive is committed, a forest side-file is written for
    /// faster lookups; failing to write it is logged and otherwise ignored.
    ///
    /// # Errors
    ///
    /// - [`StowageError::InvalidConfiguration`] if no source is configured
    /// - [`StowageError::NotFound`] if a source does not exist
    /// - [`StowageError::Aborted`] if the error reporter escalates a scan error
    /// - [`StowageError::UnsupportedOperation`] if an object selects the partial-delta mode
    ///
    /// # Examples
    ///
    /// ```rust,no_run
    /// # use stowage::Stowage;
    /// # fn main() -> Result<(), Box<dyn std::error::Error>> {
    /// let mut stowage = Stowage::open("/mnt/backup")?;
    /// let report = stowage.perform_backup()?;
    /// println!("version {} depends on {:?}", report.version, report.dependencies);
    /// # Ok(())
    /// # }
    /// ```
    #[instrument(skip(self))]
    pub fn perform_backup(&mut self) -> Result<BackupReport> {
        let start = Instant::now();
        let creation_time = Timestamp::now();
        if self.config.sources.is_empty() {
            return Err(StowageError::InvalidConfiguration("no backup sources configured".into()));
        }

        let scan = TreeBuilder::new(self.fs.as_ref(), &self.rules, self.reporter.as_ref()).build(&self.config.sources)?;
        let mut tree = scan.tree;

        let previous = match self.target.list_versions()?.last().copied() {
            Some(newest) => Some(self.load_previous(newest)?),
            None => None,
        };
        let orchestrator = match &previous {
            Some((old_tree, old_manifest)) => {
                Orchestrator::incremental(self.fs.as_ref(), self.config.change_criterion, old_tree, old_manifest)
            }
            None => Orchestrator::initial(self.fs.as_ref(), self.config.change_criterion),
        };
        let version = orchestrator.version();
        if self.target.version_exists(version) {
            return Err(StowageError::invalid_state(format!("version {} already exists", version)));
        }
        info!("Backing up version {}", version);

        let mut plan = orchestrator.generate_streams(&mut tree)?;
        let summary = plan.write(
            &mut tree,
            self.fs.as_ref(),
            &self.target.version_path(version),
            self.settings(),
            self.crypto.as_ref(),
            creation_time,
            self.progress.as_ref(),
        )?;

        let forest: Vec<SerializedNode> = tree.roots().iter().map(|root| tree.to_serialized(*root)).collect();
        if let Err(e) = self
            .target
            .write_aux(version, &forest, self.settings(), self.crypto.as_ref())
        {
            warn!("Could not write forest side-file for version {}: {}", version, e);
        }

        let report = BackupReport {
            version,
            entry_count: summary.manifest.entry_count as usize,
            streams_stored: summary.manifest.archive_metadata.stream_ids.len(),
            unmodified: plan.unmodified,
            deduplicated: plan.deduplicated,
            ignored: scan.ignored,
            skipped: scan.skipped,
            bytes_stored: summary.manifest.archive_metadata.stored_bytes(),
            archive_size: summary.size,
            dependencies: summary.manifest.version_dependencies.clone(),
            duration_ms: start.elapsed().as_millis() as u64,
        };
        info!("Backed up {}", report);
        Ok(report)
    }

    fn load_previous(&self, version: VersionNumber) -> Result<(ObjectTree, VersionManifest)> {
        let manifest = self.manifest(version)?;
        let mut tree = ObjectTree::new();
        for entry in self.target.load_forest(version, self.crypto.as_ref())? {
            tree.graft_root(entry);
        }
        debug!("Comparing against version {} ({} objects)", version, tree.len());
        Ok((tree, manifest))
    }

    /// Restore a version
    ///
    /// Existing on-disk state of every root entry is deleted first; the
    /// restore replaces rather than merges. With
    /// [`RestoreOptions::destination`] set, every root entry is re-rooted
    /// under that directory instead of its original location.
    ///
    /// Negative versions count back from the newest (`-1` is the newest).
    ///
    /// # Errors
    ///
    /// - [`StowageError::NotFound`] if the version or one of its dependencies is missing
    /// - [`StowageError::Corrupt`] if an archive is damaged
    /// - [`StowageError::Crypto`] if the archives are encrypted and no private key is set
    ///
    /// # Examples
    ///
    /// ```rust,no_run
    /// # use stowage::{Stowage, RestoreOptions};
    /// # use std::path::PathBuf;
    /// # fn main() -> Result<(), Box<dyn std::error::Error>> {
    /// let stowage = Stowage::open("/mnt/backup")?;
    /// let report = stowage.restore(3, RestoreOptions {
    ///     destination: Some(PathBuf::from("/tmp/v3")),
    ///     workers: Some(4),
    /// })?;
    /// println!("{} files from {:?}", report.files_restored, report.archives_opened);
    /// # Ok(())
    /// # }
    /// ```
    pub fn restore(&self, version: VersionNumber, options: RestoreOptions) -> Result<RestoreReport> {
        RestoreEngine::new(&self.target, self.crypto.as_ref(), self.fs.as_ref())
            .workers(options.workers.unwrap_or(self.config.restore_workers))
            .progress(self.progress.clone())
            .restore(version, options.destination.as_deref())
    }

    /// Check the trailer digest of one version's archive
    pub fn verify(&self, version: VersionNumber) -> Result<bool> {
        Verifier::new(&self.target, self.crypto.as_ref()).verify(version)
    }

    /// Check a version and every version it depends on
    pub fn full_verify(&self, version: VersionNumber) -> Result<bool> {
        Verifier::new(&self.target, self.crypto.as_ref()).full_verify(version)
    }

    /// Per-archive outcome of [`Stowage::full_verify`]
    pub fn verification_report(&self, version: VersionNumber) -> Result<VerificationReport> {
        Verifier::new(&self.target, self.crypto.as_ref()).full_report(version)
    }

    /// Versions whose archives the given version depends on
    pub fn version_dependencies(&self, version: VersionNumber) -> Result<Vec<VersionNumber>> {
        let version = self.target.resolve_version(version)?;
        VersionGraph::new(&self.target, self.crypto.as_ref()).dependencies(version)
    }

    /// Manifest of a version
    pub fn manifest(&self, version: VersionNumber) -> Result<VersionManifest> {
        let version = self.target.resolve_version(version)?;
        Ok(VersionGraph::new(&self.target, self.crypto.as_ref())
            .manifest(version)?
            .clone())
    }

    /// Object forest of a version
    pub fn entries(&self, version: VersionNumber) -> Result<ObjectTree> {
        let version = self.target.resolve_version(version)?;
        let mut tree = ObjectTree::new();
        for entry in self.target.load_forest(version, self.crypto.as_ref())? {
            tree.graft_root(entry);
        }
        Ok(tree)
    }

    /// Existing versions in ascending order
    pub fn list_versions(&self) -> Result<Vec<VersionNumber>> {
        self.target.list_versions()
    }

    /// Number the next backup will get
    pub fn version_count(&self) -> Result<VersionNumber> {
        self.target.version_count()
    }
}

/// Builder pattern for Stowage configuration
///
/// # Examples
///
/// ```rust,no_run
/// use stowage::{ChangeCriterion, NameIgnoreType, StowageBuilder};
///
/// # fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let stowage = StowageBuilder::new()
///     .source("/srv/data")
///     .ignore_name("node_modules", NameIgnoreType::Directory)
///     .ignore_extension("log")
///     .change_criterion(ChangeCriterion::Date)
///     .restore_workers(4)
///     .open("/mnt/backup/data")?;
/// # Ok(())
/// # }
/// ```
///
/// # Default Values
///
/// - `change_criterion`: `ChangeCriterion::HashAuto`
/// - `compression`: on
/// - `restore_workers`: CPU count, capped at 8
/// - `filesystem`: [`LocalFilesystem`]
/// - `error_reporter`: [`LoggingErrorReporter`]
pub struct StowageBuilder {
    config: StowageConfig,
    crypto: Option<CryptoContext>,
    fs: Arc<dyn FileSystemAccess>,
    reporter: Arc<dyn ErrorReporter>,
}

impl Default for StowageBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl StowageBuilder {
    /// Create a builder with default settings
    pub fn new() -> Self {
        Self {
            config: StowageConfig::default(),
            crypto: None,
            fs: Arc::new(LocalFilesystem::new()),
            reporter: Arc::new(LoggingErrorReporter),
        }
    }

    /// Add a source directory or file
    pub fn source(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.sources.push(path.into());
        self
    }

    /// Ignore objects whose name matches `pattern` (a literal name or a glob)
    pub fn ignore_name(mut self, pattern: impl Into<String>, kind: NameIgnoreType) -> Self {
        self.config.ignored_names.push(name_rule(pattern, kind));
        self
    }

    /// Ignore files with this extension
    pub fn ignore_extension(mut self, extension: impl Into<String>) -> Self {
        self.config.ignored_extensions.push(extension.into());
        self
    }

    /// Ignore one path
    pub fn ignore_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.ignored_paths.push(path.into());
        self
    }

    /// Set the change detection criterion
    pub fn change_criterion(mut self, criterion: ChangeCriterion) -> Self {
        self.config.change_criterion = criterion;
        self
    }

    /// Turn payload compression on or off
    pub fn compression(mut self, enabled: bool) -> Self {
        self.config.compression = enabled;
        self
    }

    /// Encrypt new archives and decrypt existing ones with this context
    pub fn crypto(mut self, crypto: CryptoContext) -> Self {
        self.config.cipher = crypto.cipher();
        self.crypto = Some(crypto);
        self
    }

    /// Set the restore worker count; values below 1 become 1
    pub fn restore_workers(mut self, workers: usize) -> Self {
        self.config.restore_workers = workers.max(1);
        self
    }

    /// Route per-object scan errors to `reporter`
    pub fn error_reporter(mut self, reporter: impl ErrorReporter + 'static) -> Self {
        self.reporter = Arc::new(reporter);
        self
    }

    /// Access the filesystem through `fs`
    pub fn filesystem(mut self, fs: impl FileSystemAccess + 'static) -> Self {
        self.fs = Arc::new(fs);
        self
    }

    /// Open (or initialize) the backup target with this configuration
    ///
    /// The builder's configuration replaces any persisted one.
    ///
    /// # Errors
    ///
    /// - [`StowageError::NotFound`] if a source does not exist
    /// - [`StowageError::InvalidConfiguration`] if `target` exists and is not a directory
    /// - [`StowageError::InvalidPattern`] if an ignore rule does not compile
    pub fn open(self, target: impl AsRef<Path>) -> Result<Stowage> {
        for source in &self.config.sources {
            self.fs
                .metadata(source)
                .map_err(|_| StowageError::not_found(format!("source {:?}", source)))?;
        }
        let target = BackupTarget::open(target.as_ref())?;
        let rules = IgnoreRules::from_config(&self.config)?;
        target.save_config(&self.config)?;
        Ok(Stowage {
            target,
            config: self.config,
            rules,
            crypto: self.crypto,
            fs: self.fs,
            reporter: self.reporter,
            progress: None,
        })
    }
}
