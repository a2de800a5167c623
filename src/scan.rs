//! Tree construction from the configured sources
//!
//! A source directory is a container: each of its children becomes one root
//! entry of the forest. A source that is not a directory is a root entry by
//! itself. Below the roots, directories are descended in file-name order;
//! ignored directories are kept as `NoBackup` nodes but not descended, and
//! links are never followed.

use crate::error::{Result, StowageError};
use crate::filesystem::{ErrorAction, ErrorReporter, FileSystemAccess};
use crate::rules::IgnoreRules;
use crate::tree::{BasePath, Node, NodeId, NodeKind, ObjectTree};
use crate::types::BackupMode;
use std::path::{Path, PathBuf};
use tracing::{debug, instrument, trace};

/// Forest built by a scan
#[derive(Debug, Default)]
pub struct ScanOutcome {
    /// The new forest
    pub tree: ObjectTree,
    /// Objects recorded as `NoBackup`
    pub ignored: usize,
    /// Objects left out because their attributes could not be read
    pub skipped: usize,
}

/// Builds a forest through a [`FileSystemAccess`]
pub struct TreeBuilder<'a> {
    fs: &'a dyn FileSystemAccess,
    rules: &'a IgnoreRules,
    reporter: &'a dyn ErrorReporter,
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.to_string_lossy().into_owned())
}

impl<'a> TreeBuilder<'a> {
    /// Create a builder
    pub fn new(fs: &'a dyn FileSystemAccess, rules: &'a IgnoreRules, reporter: &'a dyn ErrorReporter) -> Self {
        Self { fs, rules, reporter }
    }

    fn report(&self, error: StowageError, context: String, outcome: &mut ScanOutcome) -> Result<()> {
        if error.is_fatal() {
            return Err(error);
        }
        match self.reporter.report(&error, &context) {
            ErrorAction::Continue => {
                outcome.skipped += 1;
                Ok(())
            }
            ErrorAction::Abort => Err(StowageError::Aborted(format!("{}: {}", context, error))),
        }
    }

    fn make_node(&self, path: &Path, outcome: &mut ScanOutcome) -> Result<Option<Node>> {
        let metadata = match self.fs.metadata(path) {
            Ok(metadata) => metadata,
            Err(e) => {
                self.report(e, format!("reading attributes of {:?}", path), outcome)?;
                return Ok(None);
            }
        };
        let name = file_name(path);
        let mut node = Node::from_metadata(name, metadata);
        node.backup_mode = self
            .rules
            .backup_mode_for(&node.name, node.kind.is_directoryish(), path);
        if node.backup_mode == BackupMode::NoBackup {
            trace!("Ignoring {:?}", path);
            outcome.ignored += 1;
        }
        Ok(Some(node))
    }

    fn children_of(&self, dir: &Path, outcome: &mut ScanOutcome) -> Result<Vec<PathBuf>> {
        match self.fs.list_children(dir) {
            Ok(children) => Ok(children),
            Err(e) => {
                self.report(e, format!("listing {:?}", dir), outcome)?;
                Ok(Vec::new())
            }
        }
    }

    fn should_descend(node: &Node) -> bool {
        node.kind == NodeKind::Directory && node.backup_mode != BackupMode::NoBackup
    }

    /// Scan every source into a new forest
    ///
    /// # Errors
    ///
    /// - [`StowageError::NotFound`] if a source does not exist
    /// - [`StowageError::Aborted`] if the error reporter escalates
    #[instrument(skip(self))]
    pub fn build(&self, sources: &[PathBuf]) -> Result<ScanOutcome> {
        let mut outcome = ScanOutcome::default();
        for source in sources {
            let metadata = self
                .fs
                .metadata(source)
                .map_err(|_| StowageError::not_found(format!("source {:?}", source)))?;
            let roots = if metadata.kind == NodeKind::Directory {
                self.children_of(source, &mut outcome)?
            } else {
                vec![source.clone()]
            };
            for path in roots {
                let Some(node) = self.make_node(&path, &mut outcome)? else {
                    continue;
                };
                let descend = Self::should_descend(&node);
                let root = outcome.tree.add_root(node, BasePath::same(&path));
                if descend {
                    self.descend(root, &path, &mut outcome)?;
                }
            }
        }
        debug!(
            "Scanned {} objects in {} root entries ({} ignored, {} skipped)",
            outcome.tree.len(),
            outcome.tree.entry_count(),
            outcome.ignored,
            outcome.skipped
        );
        Ok(outcome)
    }

    fn descend(&self, root: NodeId, root_path: &Path, outcome: &mut ScanOutcome) -> Result<()> {
        let mut stack = vec![(root, root_path.to_path_buf())];
        while let Some((dir, dir_path)) = stack.pop() {
            let mut pending = Vec::new();
            for child_path in self.children_of(&dir_path, outcome)? {
                let Some(node) = self.make_node(&child_path, outcome)? else {
                    continue;
                };
                let descend = Self::should_descend(&node);
                let id = outcome.tree.add_child(dir, node);
                if descend {
                    pending.push((id, child_path));
                }
            }
            stack.extend(pending.into_iter().rev());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filesystem::{LocalFilesystem, LoggingErrorReporter, StrictErrorReporter};
    use crate::rules::name_rule;
    use crate::types::NameIgnoreType;
    use std::fs;
    use tempfile::TempDir;

    fn names(outcome: &ScanOutcome) -> Vec<String> {
        outcome
            .tree
            .iter()
            .map(|id| outcome.tree.node(id).name.clone())
            .collect()
    }

    #[test]
    fn test_empty_source_has_no_entries() {
        let temp_dir = TempDir::new().unwrap();
        let rules = IgnoreRules::default();
        let outcome = TreeBuilder::new(&LocalFilesystem, &rules, &LoggingErrorReporter)
            .build(&[temp_dir.path().to_path_buf()])
            .unwrap();
        assert_eq!(outcome.tree.entry_count(), 0);
    }

    #[test]
    fn test_children_become_roots_in_name_order() {
        let temp_dir = TempDir::new().unwrap();
        fs::create_dir_all(temp_dir.path().join("b/inner")).unwrap();
        fs::write(temp_dir.path().join("b/inner/deep.txt"), b"deep").unwrap();
        fs::write(temp_dir.path().join("b/z.txt"), b"z").unwrap();
        fs::write(temp_dir.path().join("a.txt"), b"a").unwrap();

        let rules = IgnoreRules::default();
        let outcome = TreeBuilder::new(&LocalFilesystem, &rules, &LoggingErrorReporter)
            .build(&[temp_dir.path().to_path_buf()])
            .unwrap();
        assert_eq!(outcome.tree.entry_count(), 2);
        assert_eq!(names(&outcome), vec!["a.txt", "b", "inner", "deep.txt", "z.txt"]);
        let deep = outcome
            .tree
            .find(&temp_dir.path().join("b/inner/deep.txt"))
            .unwrap();
        assert_eq!(outcome.tree.node(deep).size, 4);
    }

    #[test]
    fn test_file_source_is_a_root() {
        let temp_dir = TempDir::new().unwrap();
        let file = temp_dir.path().join("single.dat");
        fs::write(&file, b"1234").unwrap();
        let rules = IgnoreRules::default();
        let outcome = TreeBuilder::new(&LocalFilesystem, &rules, &LoggingErrorReporter)
            .build(&[file.clone()])
            .unwrap();
        assert_eq!(outcome.tree.entry_count(), 1);
        let root = outcome.tree.roots()[0];
        assert_eq!(outcome.tree.mapped_path(root), file);
    }

    #[test]
    fn test_ignored_directories_not_descended() {
        let temp_dir = TempDir::new().unwrap();
        fs::create_dir_all(temp_dir.path().join("target/debug")).unwrap();
        fs::write(temp_dir.path().join("target/debug/app"), b"bin").unwrap();
        fs::write(temp_dir.path().join("main.rs"), b"fn main() {}").unwrap();

        let names_rules = vec![name_rule("target", NameIgnoreType::Directory)];
        let rules = IgnoreRules::new(&names_rules, &Vec::<String>::new(), &Vec::<PathBuf>::new()).unwrap();
        let outcome = TreeBuilder::new(&LocalFilesystem, &rules, &LoggingErrorReporter)
            .build(&[temp_dir.path().to_path_buf()])
            .unwrap();
        assert_eq!(names(&outcome), vec!["main.rs", "target"]);
        assert_eq!(outcome.ignored, 1);
        let target = outcome.tree.find(&temp_dir.path().join("target")).unwrap();
        assert_eq!(outcome.tree.node(target).backup_mode, BackupMode::NoBackup);
    }

    #[test]
    fn test_missing_source() {
        let temp_dir = TempDir::new().unwrap();
        let rules = IgnoreRules::default();
        let err = TreeBuilder::new(&LocalFilesystem, &rules, &StrictErrorReporter)
            .build(&[temp_dir.path().join("gone")])
            .unwrap_err();
        assert!(matches!(err, StowageError::NotFound(_)));
    }
}
