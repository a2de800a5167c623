//! Core types and data structures for Stowage
//!
//! Identifiers, enumerations and small value types shared by the archive
//! container, the backup orchestrator and the restore engine, plus the
//! persisted configuration and the reports returned to callers.

use crate::crypto::Cipher;
use crate::error::{Result, StowageError};
use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Version number of a snapshot; version 0 is the first full backup
pub type VersionNumber = i32;

/// Identifier of a content stream, unique over the lifetime of a target
pub type StreamId = u64;

/// Grouping id reserved for partial-delta stream chains
pub type DifferentialChainId = u64;

/// Marker for "no version"
pub const INVALID_VERSION: VersionNumber = -1;

/// Marker for "no stream"
pub const INVALID_STREAM_ID: StreamId = 0;

/// First id handed out on a fresh target
pub const FIRST_STREAM_ID: StreamId = INVALID_STREAM_ID + 1;

/// Marker for "no differential chain"
pub const INVALID_CHAIN_ID: DifferentialChainId = 0;

/// First differential chain id handed out on a fresh target
pub const FIRST_CHAIN_ID: DifferentialChainId = INVALID_CHAIN_ID + 1;

/// Objects below this size are compared by hash under [`ChangeCriterion::HashAuto`]
pub const AUTO_HASH_THRESHOLD: u64 = 1024 * 1024;

/// Per-object backup decision
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BackupMode {
    /// Excluded by an ignore rule; no stream, no latest version
    NoBackup,
    /// Directory-like container, recursed into
    Directory,
    /// Store full content unless the change criterion says unchanged
    Full,
    /// Store full content unconditionally
    ForceFull,
    /// Content unchanged; refers to bytes stored in an earlier version
    Unmodified,
    /// Reserved partial-delta mode, not implemented
    Rsync,
}

impl BackupMode {
    /// Whether objects in this mode may receive a content stream
    pub fn is_content(self) -> bool {
        matches!(self, BackupMode::Full | BackupMode::ForceFull | BackupMode::Unmodified | BackupMode::Rsync)
    }
}

/// Criterion used to decide whether a file changed since the previous version
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ChangeCriterion {
    /// The OS archive attribute is set
    ArchiveFlag,
    /// Size differs
    Size,
    /// Modification time differs
    Date,
    /// SHA-256 content hash differs
    Hash,
    /// Hash for objects below 1 MiB, modification time otherwise
    #[default]
    HashAuto,
}

impl ChangeCriterion {
    /// Resolve `HashAuto` into a concrete criterion for an object of `size` bytes
    pub fn resolve(self, size: u64) -> ChangeCriterion {
        match self {
            ChangeCriterion::HashAuto if size < AUTO_HASH_THRESHOLD => ChangeCriterion::Hash,
            ChangeCriterion::HashAuto => ChangeCriterion::Date,
            other => other,
        }
    }
}

impl fmt::Display for ChangeCriterion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ChangeCriterion::ArchiveFlag => "archive-flag",
            ChangeCriterion::Size => "size",
            ChangeCriterion::Date => "date",
            ChangeCriterion::Hash => "hash",
            ChangeCriterion::HashAuto => "auto",
        };
        f.write_str(name)
    }
}

impl FromStr for ChangeCriterion {
    type Err = StowageError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "archive-flag" | "archive_flag" | "archiveflag" => Ok(ChangeCriterion::ArchiveFlag),
            "size" => Ok(ChangeCriterion::Size),
            "date" | "mtime" => Ok(ChangeCriterion::Date),
            "hash" => Ok(ChangeCriterion::Hash),
            "auto" | "hash-auto" | "hashauto" | "default" => Ok(ChangeCriterion::HashAuto),
            other => Err(StowageError::InvalidConfiguration(format!(
                "unknown change criterion '{}'",
                other
            ))),
        }
    }
}

/// Which object kinds a name-based ignore rule applies to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum NameIgnoreType {
    /// Only non-directory objects
    File,
    /// Only directory-like objects
    Directory,
    /// Every object
    #[default]
    All,
}

impl NameIgnoreType {
    /// Whether a rule of this type applies to an object
    pub fn applies_to(self, is_directory: bool) -> bool {
        match self {
            NameIgnoreType::File => !is_directory,
            NameIgnoreType::Directory => is_directory,
            NameIgnoreType::All => true,
        }
    }
}

impl FromStr for NameIgnoreType {
    type Err = StowageError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "file" | "files" => Ok(NameIgnoreType::File),
            "dir" | "directory" | "directories" => Ok(NameIgnoreType::Directory),
            "all" | "both" => Ok(NameIgnoreType::All),
            other => Err(StowageError::InvalidConfiguration(format!(
                "unknown ignore kind '{}'",
                other
            ))),
        }
    }
}

/// Nanoseconds since the Unix epoch
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
pub struct Timestamp(pub i64);

impl Timestamp {
    /// Current wall-clock time
    pub fn now() -> Self {
        Self::from(SystemTime::now())
    }

    /// Convert to a `SystemTime`
    pub fn to_system_time(self) -> SystemTime {
        if self.0 >= 0 {
            UNIX_EPOCH + Duration::from_nanos(self.0 as u64)
        } else {
            UNIX_EPOCH - Duration::from_nanos(self.0.unsigned_abs())
        }
    }

    /// Convert to a chrono UTC datetime
    pub fn to_datetime(self) -> DateTime<Utc> {
        Utc.timestamp_nanos(self.0)
    }
}

impl From<SystemTime> for Timestamp {
    fn from(time: SystemTime) -> Self {
        match time.duration_since(UNIX_EPOCH) {
            Ok(d) => Timestamp(d.as_nanos().min(i64::MAX as u128) as i64),
            Err(e) => Timestamp(-(e.duration().as_nanos().min(i64::MAX as u128) as i64)),
        }
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_datetime().format("%Y-%m-%d %H:%M:%S%.3f UTC"))
    }
}

/// 256-bit SHA-256 digest
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Sha256Digest(pub [u8; 32]);

impl Sha256Digest {
    /// Lowercase hex encoding
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Debug for Sha256Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Sha256Digest({})", self.to_hex())
    }
}

impl fmt::Display for Sha256Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

/// Filesystem-assigned identity of a file's content
///
/// Two paths reporting the same valid GUID refer to the same bytes on disk
/// (hardlink peers), so only one of them needs to be stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ContentGuid(pub [u8; 16]);

impl ContentGuid {
    /// Build a GUID from a device and inode pair
    pub fn from_parts(device: u64, inode: u64) -> Self {
        let mut bytes = [0u8; 16];
        bytes[..8].copy_from_slice(&device.to_le_bytes());
        bytes[8..].copy_from_slice(&inode.to_le_bytes());
        ContentGuid(bytes)
    }

    /// An all-zero GUID carries no identity
    pub fn is_valid(&self) -> bool {
        self.0.iter().any(|b| *b != 0)
    }
}

/// A name-based ignore rule as persisted in the configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NameRule {
    /// Literal name or glob pattern, matched case-insensitively
    pub pattern: String,
    /// Object kinds the rule applies to
    pub kind: NameIgnoreType,
}

/// Configuration for a backup target
///
/// Persisted as `stowage.json` inside the target directory.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StowageConfig {
    /// Source directories or files to back up
    pub sources: Vec<PathBuf>,
    /// Name-based ignore rules
    #[serde(default)]
    pub ignored_names: Vec<NameRule>,
    /// Extension-based ignore rules (files only, no leading dot)
    #[serde(default)]
    pub ignored_extensions: Vec<String>,
    /// Explicit paths to ignore
    #[serde(default)]
    pub ignored_paths: Vec<PathBuf>,
    /// Change detection criterion
    #[serde(default)]
    pub change_criterion: ChangeCriterion,
    /// Whether payload sections are LZ4 compressed
    pub compression: bool,
    /// Cipher used when a key pair is configured
    #[serde(default)]
    pub cipher: Cipher,
    /// Public key file used to wrap per-archive session keys
    #[serde(default)]
    pub public_key: Option<PathBuf>,
    /// Restore worker count; 1 selects the single-threaded path
    pub restore_workers: usize,
    /// Codec chunk size in bytes
    pub chunk_size: usize,
    /// Stowage version that wrote this config
    pub version: String,
}

impl Default for StowageConfig {
    fn default() -> Self {
        Self {
            sources: Vec::new(),
            ignored_names: Vec::new(),
            ignored_extensions: Vec::new(),
            ignored_paths: Vec::new(),
            change_criterion: ChangeCriterion::default(),
            compression: true,
            cipher: Cipher::default(),
            public_key: None,
            restore_workers: default_restore_workers(),
            chunk_size: crate::compression::DEFAULT_CHUNK_SIZE,
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}

/// Default worker count for the multi-threaded restore path
pub fn default_restore_workers() -> usize {
    num_cpus::get().clamp(1, 8)
}

/// Options for a restore operation
#[derive(Debug, Clone, Default)]
pub struct RestoreOptions {
    /// Re-root every root entry under this directory instead of its original location
    pub destination: Option<PathBuf>,
    /// Override the configured worker count
    pub workers: Option<usize>,
}

/// Result of a backup operation
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BackupReport {
    /// Version that was written
    pub version: VersionNumber,
    /// Number of root entries
    pub entry_count: usize,
    /// Full streams stored in the archive
    pub streams_stored: usize,
    /// Objects found unchanged since an earlier version
    pub unmodified: usize,
    /// Objects sharing a stream with an earlier object of the same content GUID
    pub deduplicated: usize,
    /// Objects excluded by ignore rules
    pub ignored: usize,
    /// Objects skipped because their attributes could not be read
    pub skipped: usize,
    /// Uncompressed bytes of stored streams
    pub bytes_stored: u64,
    /// Size of the archive file
    pub archive_size: u64,
    /// Versions this version depends on
    pub dependencies: Vec<VersionNumber>,
    /// Time taken in milliseconds
    pub duration_ms: u64,
}

impl fmt::Display for BackupReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "version {}: {} streams ({}), {} unmodified, {} deduplicated, {} ignored, archive {} in {}",
            self.version,
            self.streams_stored,
            crate::utils::format_bytes(self.bytes_stored),
            self.unmodified,
            self.deduplicated,
            self.ignored,
            crate::utils::format_bytes(self.archive_size),
            humantime::format_duration(Duration::from_millis(self.duration_ms)),
        )
    }
}

/// Result of a restore operation
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RestoreReport {
    /// Version that was restored
    pub version: VersionNumber,
    /// Directories, links and other objects restored without stored content
    pub objects_restored: usize,
    /// Files materialized from archived content
    pub files_restored: usize,
    /// Hardlinks created to already materialized peers
    pub hardlinks_created: usize,
    /// Bytes written to restored files
    pub bytes_written: u64,
    /// Archives opened during the restore, each at most once, ascending
    pub archives_opened: Vec<VersionNumber>,
    /// Time taken in milliseconds
    pub duration_ms: u64,
}

impl fmt::Display for RestoreReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "version {}: {} files ({}), {} hardlinks, {} other objects from {} archives in {}",
            self.version,
            self.files_restored,
            crate::utils::format_bytes(self.bytes_written),
            self.hardlinks_created,
            self.objects_restored,
            self.archives_opened.len(),
            humantime::format_duration(Duration::from_millis(self.duration_ms)),
        )
    }
}

/// Progress callback for long-running operations
pub type ProgressCallback = Arc<dyn Fn(ProgressInfo) + Send + Sync>;

/// Information passed to progress callbacks
#[derive(Debug, Clone)]
pub struct ProgressInfo {
    /// Operation being performed
    pub operation: &'static str,
    /// Current item being processed
    pub current_item: Option<String>,
    /// Items processed so far
    pub processed: usize,
    /// Total items to process (if known)
    pub total: Option<usize>,
    /// Bytes processed so far
    pub bytes_processed: u64,
}

impl ProgressInfo {
    /// Get progress as a percentage (0-100)
    pub fn percentage(&self) -> Option<f32> {
        match self.total {
            Some(total) if total > 0 => Some((self.processed as f32 / total as f32) * 100.0),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hash_auto_resolution() {
        assert_eq!(ChangeCriterion::HashAuto.resolve(10), ChangeCriterion::Hash);
        assert_eq!(ChangeCriterion::HashAuto.resolve(AUTO_HASH_THRESHOLD), ChangeCriterion::Date);
        assert_eq!(ChangeCriterion::Size.resolve(0), ChangeCriterion::Size);
    }

    #[test]
    fn test_criterion_parsing() {
        assert_eq!("Hash".parse::<ChangeCriterion>().unwrap(), ChangeCriterion::Hash);
        assert_eq!("auto".parse::<ChangeCriterion>().unwrap(), ChangeCriterion::HashAuto);
        assert!("sometimes".parse::<ChangeCriterion>().is_err());
    }

    #[test]
    fn test_timestamp_round_trip() {
        let now = SystemTime::now();
        let ts = Timestamp::from(now);
        assert_eq!(Timestamp::from(ts.to_system_time()), ts);
        let before_epoch = Timestamp(-1_500_000_000);
        assert_eq!(Timestamp::from(before_epoch.to_system_time()), before_epoch);
    }

    #[test]
    fn test_guid_validity() {
        assert!(!ContentGuid([0; 16]).is_valid());
        assert!(ContentGuid::from_parts(0, 42).is_valid());
    }

    #[test]
    fn test_name_ignore_type() {
        assert!(NameIgnoreType::File.applies_to(false));
        assert!(!NameIgnoreType::File.applies_to(true));
        assert!(NameIgnoreType::All.applies_to(true));
    }

    #[test]
    fn test_progress_percentage() {
        let info = ProgressInfo {
            operation: "backup",
            current_item: None,
            processed: 5,
            total: Some(10),
            bytes_processed: 0,
        };
        assert_eq!(info.percentage(), Some(50.0));
    }
}
