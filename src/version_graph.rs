//! Version dependency graph
//!
//! Every version lists, in its manifest, the earlier versions whose archives
//! hold content it references. The list is already flattened when the
//! version is written (an object unchanged since version 2 refers to version
//! 2 directly, not to whichever version saw it last), so a version needs its
//! own archive plus its direct dependencies and nothing further back. The
//! graph is a DAG in which every edge points strictly backwards.
//!
//! [`VersionGraph`] opens each archive at most once. The open reader is
//! cached together with its manifest, and the restore engine later takes
//! the same reader to replay content, so a restore touches every archive it
//! needs exactly once.
//!
//! ```text
//! version 9 ──► {2, 5, 7}
//! version 7 ──► {3, 5}      not followed when restoring 9
//! needed(9) = [2, 5, 7, 9]
//! ```

use crate::archive::ArchiveReader;
use crate::error::{Result, StowageError};
use crate::keys::CryptoContext;
use crate::manifest::VersionManifest;
use crate::target::BackupTarget;
use crate::tree::SerializedNode;
use crate::types::VersionNumber;
use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, trace, warn};

/// Memoized view of a target's versions and their dependencies
pub struct VersionGraph<'a> {
    target: &'a BackupTarget,
    crypto: Option<&'a CryptoContext>,
    archives: BTreeMap<VersionNumber, ArchiveReader>,
    opened: Vec<VersionNumber>,
}

impl<'a> VersionGraph<'a> {
    /// Create an empty graph over `target`
    pub fn new(target: &'a BackupTarget, crypto: Option<&'a CryptoContext>) -> Self {
        Self {
            target,
            crypto,
            archives: BTreeMap::new(),
            opened: Vec::new(),
        }
    }

    fn archive(&mut self, version: VersionNumber) -> Result<&mut ArchiveReader> {
        if !self.archives.contains_key(&version) {
            let mut reader = self.target.open_archive(version, self.crypto)?;
            let recorded = reader.read_manifest()?.version_number;
            if recorded != version {
                return Err(StowageError::corrupt(format!(
                    "archive of version {} records version {}",
                    version, recorded
                )));
            }
            trace!("Opened archive of version {}", version);
            self.opened.push(version);
            self.archives.insert(version, reader);
        }
        self.archives
            .get_mut(&version)
            .ok_or_else(|| StowageError::invalid_state(format!("archive of version {} not cached", version)))
    }

    /// Manifest of `version`
    pub fn manifest(&mut self, version: VersionNumber) -> Result<&VersionManifest> {
        self.archive(version)?.read_manifest()
    }

    /// Direct dependencies of `version`
    pub fn dependencies(&mut self, version: VersionNumber) -> Result<Vec<VersionNumber>> {
        Ok(self.manifest(version)?.version_dependencies.clone())
    }

    /// Load `version` and the versions it depends on directly
    ///
    /// Returns them in ascending order. Dependency manifests are decoded
    /// (which also checks the version each archive records) but their own
    /// dependencies are not followed.
    ///
    /// # Errors
    ///
    /// - [`StowageError::NotFound`] if a referenced archive is missing
    /// - [`StowageError::Corrupt`] if a manifest cannot be decoded
    pub fn load(&mut self, version: VersionNumber) -> Result<Vec<VersionNumber>> {
        let mut needed = BTreeSet::from([version]);
        for dep in self.dependencies(version)? {
            if needed.insert(dep) {
                self.manifest(dep)?;
            }
        }
        debug!("Version {} needs versions {:?}", version, needed);
        Ok(needed.into_iter().collect())
    }

    /// Forest of `version`, from the side-file when one is readable
    pub fn forest(&mut self, version: VersionNumber) -> Result<Vec<SerializedNode>> {
        match self.target.read_aux(version, self.crypto) {
            Ok(Some(forest)) => return Ok(forest),
            Ok(None) => trace!("No side-file for version {}", version),
            Err(e) => warn!("Ignoring unreadable side-file for version {}: {}", version, e),
        }
        self.archive(version)?.read_base_objects()
    }

    /// Remove a version's reader from the cache, opening it if needed
    pub fn take_archive(&mut self, version: VersionNumber) -> Result<ArchiveReader> {
        self.archive(version)?;
        self.archives
            .remove(&version)
            .ok_or_else(|| StowageError::invalid_state(format!("archive of version {} not cached", version)))
    }

    /// Versions whose archives were opened, in opening order
    pub fn opened(&self) -> &[VersionNumber] {
        &self.opened
    }
}
