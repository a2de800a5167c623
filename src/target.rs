//! Backup target directory layout
//!
//! ```text
//! <target>/
//! ├── stowage.json            configuration
//! ├── version00000000.arc     one archive per version
//! ├── version00000001.arc
//! └── .aux/
//!     ├── fso00000000.dat     forest side-file per version
//!     └── fso00000001.dat
//! ```
//!
//! The side-file holds the same forest as the archive's base-object section
//! (`[key block?][codec-wrapped bincode forest]`), so loading an earlier
//! version's tree does not require opening its archive. It is optional:
//! when it is missing or unreadable the archive is used instead.

use crate::archive::{ArchiveReader, ArchiveSettings};
use crate::codec::Codec;
use crate::compression::DEFAULT_CHUNK_SIZE;
use crate::error::{from_codec_io, Result, StowageError};
use crate::keys::{CryptoContext, Section};
use crate::tree::SerializedNode;
use crate::types::{StowageConfig, VersionNumber};
use crate::utils::atomic_write;
use std::fs;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Configuration file name inside a target
pub const CONFIG_FILE: &str = "stowage.json";

/// Side-file directory inside a target
pub const AUX_DIR: &str = ".aux";

/// Archive file name for a version
pub fn version_file_name(version: VersionNumber) -> String {
    format!("version{:08}.arc", version)
}

/// Side-file name for a version
pub fn aux_file_name(version: VersionNumber) -> String {
    format!("fso{:08}.dat", version)
}

/// Parse an archive file name, case-insensitively
pub fn parse_version_file_name(name: &str) -> Option<VersionNumber> {
    let lower = name.to_ascii_lowercase();
    let digits = lower.strip_prefix("version")?.strip_suffix(".arc")?;
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    digits.parse().ok()
}

/// A directory holding version archives
#[derive(Debug, Clone)]
pub struct BackupTarget {
    root: PathBuf,
}

impl BackupTarget {
    /// Open a target directory, creating it if needed
    ///
    /// # Errors
    ///
    /// Returns [`StowageError::InvalidConfiguration`] if `root` exists and is
    /// not a directory.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        if root.exists() && !root.is_dir() {
            return Err(StowageError::InvalidConfiguration(format!(
                "backup target {:?} is not a directory",
                root
            )));
        }
        fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    /// Target directory
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Archive path of a version
    pub fn version_path(&self, version: VersionNumber) -> PathBuf {
        self.root.join(version_file_name(version))
    }

    /// Side-file path of a version
    pub fn aux_path(&self, version: VersionNumber) -> PathBuf {
        self.root.join(AUX_DIR).join(aux_file_name(version))
    }

    /// Configuration file path
    pub fn config_path(&self) -> PathBuf {
        self.root.join(CONFIG_FILE)
    }

    /// Existing versions in ascending order
    pub fn list_versions(&self) -> Result<Vec<VersionNumber>> {
        let mut versions = Vec::new();
        for entry in fs::read_dir(&self.root)? {
            let entry = entry?;
            if !entry.file_type()?.is_file() {
                continue;
            }
            if let Some(version) = entry.file_name().to_str().and_then(parse_version_file_name) {
                versions.push(version);
            }
        }
        versions.sort_unstable();
        Ok(versions)
    }

    /// One past the newest version, 0 for an empty target
    pub fn version_count(&self) -> Result<VersionNumber> {
        Ok(self.list_versions()?.last().map_or(0, |v| v + 1))
    }

    /// Whether an archive exists for `version`
    pub fn version_exists(&self, version: VersionNumber) -> bool {
        version >= 0 && self.version_path(version).is_file()
    }

    /// Resolve relative addressing: negative numbers count back from the newest version
    ///
    /// # Errors
    ///
    /// Returns [`StowageError::NotFound`] if the resolved version has no archive.
    pub fn resolve_version(&self, version: VersionNumber) -> Result<VersionNumber> {
        let resolved = if version < 0 {
            let newest = self
                .list_versions()?
                .last()
                .copied()
                .ok_or_else(|| StowageError::not_found("no versions in backup target"))?;
            newest + version + 1
        } else {
            version
        };
        if !self.version_exists(resolved) {
            return Err(StowageError::not_found(format!("version {}", version)));
        }
        Ok(resolved)
    }

    /// Load the persisted configuration, if any
    pub fn load_config(&self) -> Result<Option<StowageConfig>> {
        let path = self.config_path();
        if !path.exists() {
            return Ok(None);
        }
        let content = fs::read(&path)?;
        Ok(Some(serde_json::from_slice(&content)?))
    }

    /// Persist the configuration
    pub fn save_config(&self, config: &StowageConfig) -> Result<()> {
        let content = serde_json::to_vec_pretty(config)?;
        atomic_write(&self.config_path(), &content)
    }

    /// Open the archive of a version
    pub fn open_archive(&self, version: VersionNumber, crypto: Option<&CryptoContext>) -> Result<ArchiveReader> {
        let path = self.version_path(version);
        if !path.exists() {
            return Err(StowageError::not_found(format!("version {}", version)));
        }
        ArchiveReader::open(&path, crypto)
    }

    /// Write the forest side-file of a version
    pub fn write_aux(
        &self,
        version: VersionNumber,
        forest: &[SerializedNode],
        settings: ArchiveSettings,
        crypto: Option<&CryptoContext>,
    ) -> Result<()> {
        let dir = self.root.join(AUX_DIR);
        if dir.exists() && !dir.is_dir() {
            warn!("{:?} is not a directory; not writing forest side-file", dir);
            return Ok(());
        }
        fs::create_dir_all(&dir)?;

        let mut content = Vec::new();
        let keys = match crypto {
            Some(ctx) => {
                let keys = ctx.new_session();
                ctx.write_key_block(&keys, &mut content)?;
                Some(keys)
            }
            None => None,
        };
        let codec = Codec::for_section(settings.compression, settings.chunk_size, keys.as_ref(), Section::BaseObjects);
        let forest_bytes = bincode::serde::encode_to_vec(forest, bincode::config::standard())?;
        let mut writer = codec.wrap_output(content);
        writer.write_all(&forest_bytes)?;
        let content = writer.finish()?;

        atomic_write(&self.aux_path(version), &content)?;
        debug!("Wrote forest side-file for version {} ({} bytes)", version, content.len());
        Ok(())
    }

    /// Read the forest side-file of a version; `None` if there is none
    pub fn read_aux(&self, version: VersionNumber, crypto: Option<&CryptoContext>) -> Result<Option<Vec<SerializedNode>>> {
        let path = self.aux_path(version);
        if !path.is_file() {
            return Ok(None);
        }
        let content = fs::read(&path)?;
        let mut input = &content[..];
        let keys = match crypto {
            Some(ctx) => Some(ctx.read_key_block(&mut input)?.0),
            None => None,
        };
        let codec = Codec::for_section(true, DEFAULT_CHUNK_SIZE, keys.as_ref(), Section::BaseObjects);
        let mut forest_bytes = Vec::new();
        codec
            .wrap_input(input)
            .read_to_end(&mut forest_bytes)
            .map_err(from_codec_io)?;
        let (forest, read): (Vec<SerializedNode>, usize) =
            bincode::serde::decode_from_slice(&forest_bytes, bincode::config::standard())
                .map_err(|e| StowageError::corrupt(format!("side-file does not decode: {}", e)))?;
        if read != forest_bytes.len() {
            return Err(StowageError::corrupt("trailing bytes in forest side-file"));
        }
        Ok(Some(forest))
    }

    /// Forest of a version, from the side-file when possible
    pub fn load_forest(&self, version: VersionNumber, crypto: Option<&CryptoContext>) -> Result<Vec<SerializedNode>> {
        match self.read_aux(version, crypto) {
            Ok(Some(forest)) => return Ok(forest),
            Ok(None) => debug!("No side-file for version {}; reading archive", version),
            Err(e) => warn!("Ignoring unreadable side-file for version {}: {}", version, e),
        }
        self.open_archive(version, crypto)?.read_base_objects()
    }
}
