//! Property-based testing for Stowage
//!
//! Uses proptest to check invariants of backup and restore across
//! randomly generated directory trees and edit sequences.

use ::stowage::*;
use tempfile::TempDir;
use proptest::prelude::*;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

/// An edit applied to the source between backups
#[derive(Debug, Clone)]
pub enum FileOperation {
    Write { path: PathBuf, content: Vec<u8> },
    Delete { path: PathBuf },
}

/// Generate relative file paths; directory names never contain a dot,
/// file names always do, so a file never shadows a directory
fn path_strategy() -> impl Strategy<Value = PathBuf> {
    let dirs = prop::collection::vec("[a-z]{1,6}", 0..=3);
    let file = "[a-z]{1,8}\\.(txt|bin|md)";
    (dirs, file).prop_map(|(dirs, file)| {
        let mut path = PathBuf::new();
        for dir in dirs {
            path.push(dir);
        }
        path.join(file)
    })
}

/// Generate file content
fn content_strategy() -> impl Strategy<Value = Vec<u8>> {
    prop_oneof![
        // Small text files
        "[a-zA-Z0-9 \n]{0,500}".prop_map(|s| s.into_bytes()),
        // Binary data
        prop::collection::vec(any::<u8>(), 0..4000),
        // Repetitive patterns
        (any::<u8>(), 1..20000usize).prop_map(|(byte, count)| vec![byte; count]),
    ]
}

fn operation_strategy() -> impl Strategy<Value = FileOperation> {
    prop_oneof![
        3 => (path_strategy(), content_strategy()).prop_map(|(path, content)| FileOperation::Write { path, content }),
        1 => path_strategy().prop_map(|path| FileOperation::Delete { path }),
    ]
}

fn apply(root: &Path, op: &FileOperation) {
    match op {
        FileOperation::Write { path, content } => {
            let full_path = root.join(path);
            if let Some(parent) = full_path.parent() {
                fs::create_dir_all(parent).unwrap();
            }
            fs::write(full_path, content).unwrap();
        }
        FileOperation::Delete { path } => {
            let full_path = root.join(path);
            if full_path.exists() {
                fs::remove_file(full_path).unwrap();
            }
        }
    }
}

/// Relative path to content for every regular file under `root`
fn files_under(root: &Path) -> BTreeMap<PathBuf, Vec<u8>> {
    walkdir::WalkDir::new(root)
        .sort_by_file_name()
        .into_iter()
        .map(|entry| entry.unwrap())
        .filter(|entry| entry.file_type().is_file())
        .map(|entry| {
            let relative = entry.path().strip_prefix(root).unwrap().to_path_buf();
            (relative, fs::read(entry.path()).unwrap())
        })
        .collect()
}

fn restore_into(stowage: &Stowage, version: VersionNumber, workers: usize) -> BTreeMap<PathBuf, Vec<u8>> {
    let destination = TempDir::new().unwrap();
    stowage
        .restore(version, RestoreOptions {
            destination: Some(destination.path().to_path_buf()),
            workers: Some(workers),
        })
        .unwrap();
    files_under(destination.path())
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    /// Restoring a version reproduces the source exactly as it was
    #[test]
    fn prop_backup_restore_identity(
        files in prop::collection::vec((path_strategy(), content_strategy()), 0..12),
        compression in any::<bool>(),
    ) {
        let source = TempDir::new().unwrap();
        let target = TempDir::new().unwrap();
        for (path, content) in &files {
            apply(source.path(), &FileOperation::Write { path: path.clone(), content: content.clone() });
        }
        let expected = files_under(source.path());

        let mut stowage = StowageBuilder::new()
            .source(source.path())
            .compression(compression)
            .open(target.path())
            .unwrap();
        let report = stowage.perform_backup().unwrap();
        prop_assert_eq!(report.streams_stored, expected.len());
        prop_assert!(stowage.verify(0).unwrap());
        prop_assert_eq!(restore_into(&stowage, 0, 1), expected);
    }

    /// Every version of an edit history restores to its own snapshot
    #[test]
    fn prop_history_restores_every_version(
        rounds in prop::collection::vec(prop::collection::vec(operation_strategy(), 1..6), 1..5),
        workers in 1..4usize,
    ) {
        let source = TempDir::new().unwrap();
        let target = TempDir::new().unwrap();
        let mut stowage = StowageBuilder::new()
            .source(source.path())
            .open(target.path())
            .unwrap();

        let mut snapshots = Vec::new();
        for ops in &rounds {
            for op in ops {
                apply(source.path(), op);
            }
            stowage.perform_backup().unwrap();
            snapshots.push(files_under(source.path()));
        }

        for (version, expected) in snapshots.iter().enumerate() {
            let restored = restore_into(&stowage, version as VersionNumber, workers);
            prop_assert_eq!(&restored, expected, "version {}", version);
        }
    }

    /// An unchanged source stores nothing new and depends only on earlier versions
    #[test]
    fn prop_unchanged_source_stores_nothing(
        files in prop::collection::vec((path_strategy(), content_strategy()), 1..10),
    ) {
        let source = TempDir::new().unwrap();
        let target = TempDir::new().unwrap();
        for (path, content) in &files {
            apply(source.path(), &FileOperation::Write { path: path.clone(), content: content.clone() });
        }
        let mut stowage = StowageBuilder::new()
            .source(source.path())
            .open(target.path())
            .unwrap();
        let first = stowage.perform_backup().unwrap();
        let second = stowage.perform_backup().unwrap();

        prop_assert_eq!(second.streams_stored, 0);
        prop_assert_eq!(second.unmodified, first.streams_stored);
        prop_assert_eq!(second.dependencies, vec![0]);
        let newer = stowage.manifest(1).unwrap();
        let older = stowage.manifest(0).unwrap();
        prop_assert_eq!(newer.first_stream_id, older.next_stream_id);
    }
}
