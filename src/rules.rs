//! Ignore rules
//!
//! Three independent rule sets decide whether an object is excluded from a
//! backup:
//!
//! - **names**: glob patterns matched case-insensitively against the object's
//!   file name, each restricted to files, directories or both
//! - **extensions**: matched against files only, case-insensitively
//! - **paths**: explicit unmapped paths, compared component-wise
//!
//! Any match yields [`BackupMode::NoBackup`].

use crate::error::Result;
use crate::types::{BackupMode, NameIgnoreType, NameRule, StowageConfig};
use crate::utils::{extension_of, path_key};
use globset::{GlobBuilder, GlobSet, GlobSetBuilder};
use std::collections::HashSet;
use std::path::Path;

/// Compiled ignore rules
#[derive(Debug, Clone)]
pub struct IgnoreRules {
    files: GlobSet,
    directories: GlobSet,
    extensions: HashSet<String>,
    paths: HashSet<String>,
}

impl Default for IgnoreRules {
    fn default() -> Self {
        Self {
            files: GlobSet::empty(),
            directories: GlobSet::empty(),
            extensions: HashSet::new(),
            paths: HashSet::new(),
        }
    }
}

impl IgnoreRules {
    /// Compile rule lists
    ///
    /// # Errors
    ///
    /// Returns [`crate::StowageError::InvalidPattern`] if a name pattern is not a valid glob.
    pub fn new<'a>(
        names: impl IntoIterator<Item = &'a NameRule>,
        extensions: impl IntoIterator<Item = &'a String>,
        paths: impl IntoIterator<Item = &'a std::path::PathBuf>,
    ) -> Result<Self> {
        let mut files = GlobSetBuilder::new();
        let mut directories = GlobSetBuilder::new();
        for rule in names {
            let glob = GlobBuilder::new(&rule.pattern)
                .case_insensitive(true)
                .literal_separator(true)
                .build()?;
            if rule.kind.applies_to(false) {
                files.add(glob.clone());
            }
            if rule.kind.applies_to(true) {
                directories.add(glob);
            }
        }

        Ok(Self {
            files: files.build()?,
            directories: directories.build()?,
            extensions: extensions
                .into_iter()
                .map(|e| e.trim_start_matches('.').to_lowercase())
                .filter(|e| !e.is_empty())
                .collect(),
            paths: paths.into_iter().map(|p| path_key(p)).collect(),
        })
    }

    /// Compile the rules stored in a configuration
    pub fn from_config(config: &StowageConfig) -> Result<Self> {
        Self::new(&config.ignored_names, &config.ignored_extensions, &config.ignored_paths)
    }

    /// Whether `name` matches a name rule for this object kind
    pub fn name_ignored(&self, name: &str, is_directory: bool) -> bool {
        if is_directory {
            self.directories.is_match(name)
        } else {
            self.files.is_match(name)
        }
    }

    /// Whether a file's extension is ignored
    pub fn extension_ignored(&self, name: &str, is_directory: bool) -> bool {
        if is_directory || self.extensions.is_empty() {
            return false;
        }
        extension_of(name).is_some_and(|ext| self.extensions.contains(&ext))
    }

    /// Whether `path` is explicitly ignored
    pub fn path_ignored(&self, path: &Path) -> bool {
        !self.paths.is_empty() && self.paths.contains(&path_key(path))
    }

    /// Whether any rule excludes the object
    pub fn is_ignored(&self, name: &str, is_directory: bool, path: &Path) -> bool {
        self.name_ignored(name, is_directory)
            || self.extension_ignored(name, is_directory)
            || self.path_ignored(path)
    }

    /// Initial backup mode for an object
    pub fn backup_mode_for(&self, name: &str, is_directory: bool, path: &Path) -> BackupMode {
        if self.is_ignored(name, is_directory, path) {
            BackupMode::NoBackup
        } else if is_directory {
            BackupMode::Directory
        } else {
            BackupMode::Full
        }
    }
}

/// Convenience constructor for a name rule
pub fn name_rule(pattern: impl Into<String>, kind: NameIgnoreType) -> NameRule {
    NameRule {
        pattern: pattern.into(),
        kind,
    }
}
