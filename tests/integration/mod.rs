//! Integration tests for Stowage
//!
//! Drives long multi-version histories through a test harness and checks
//! that every version restores to exactly the tree it was taken from.

use ::stowage::*;
use tempfile::TempDir;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use rand::{Rng, SeedableRng};
use rand::rngs::StdRng;
use walkdir::WalkDir;

/// Files of a directory tree keyed by relative path
pub type Snapshot = BTreeMap<PathBuf, Vec<u8>>;

/// Read every regular file under `root`
pub fn snapshot(root: &Path) -> Snapshot {
    let mut files = Snapshot::new();
    for entry in WalkDir::new(root).sort_by_file_name() {
        let entry = entry.unwrap();
        if entry.file_type().is_file() {
            let relative = entry.path().strip_prefix(root).unwrap().to_path_buf();
            files.insert(relative, fs::read(entry.path()).unwrap());
        }
    }
    files
}

/// Test harness for backup histories
pub struct BackupHarness {
    pub source: TempDir,
    pub target: TempDir,
    pub stowage: Stowage,
    pub rng: StdRng,
    /// Snapshot of the source taken at each backup
    pub history: Vec<Snapshot>,
}

impl BackupHarness {
    /// Create a harness with an empty source directory
    pub fn new(seed: u64) -> Self {
        Self::with_builder(seed, StowageBuilder::new())
    }

    /// Create a harness from a preconfigured builder
    pub fn with_builder(seed: u64, builder: StowageBuilder) -> Self {
        let source = TempDir::new().unwrap();
        let target = TempDir::new().unwrap();
        let stowage = builder.source(source.path()).open(target.path()).unwrap();
        Self {
            source,
            target,
            stowage,
            rng: StdRng::seed_from_u64(seed),
            history: Vec::new(),
        }
    }

    fn random_content(&mut self) -> Vec<u8> {
        let len = self.rng.random_range(0..8192);
        if self.rng.random_bool(0.5) {
            let mut bytes = vec![0u8; len];
            self.rng.fill(&mut bytes[..]);
            bytes
        } else {
            let word = format!("line {} ", self.rng.random_range(0..1000));
            word.repeat(len / word.len() + 1).into_bytes()
        }
    }

    /// Populate the source with `count` files spread over a few directories
    pub fn populate(&mut self, count: usize) {
        for i in 0..count {
            let dir = self.source.path().join(format!("dir{}", i % 4)).join(format!("sub{}", i % 3));
            fs::create_dir_all(&dir).unwrap();
            let content = self.random_content();
            fs::write(dir.join(format!("file{}.dat", i)), content).unwrap();
        }
    }

    /// Modify, delete and add a few files
    pub fn mutate(&mut self) {
        let files: Vec<PathBuf> = snapshot(self.source.path()).into_keys().collect();
        for relative in files {
            let path = self.source.path().join(&relative);
            match self.rng.random_range(0..10) {
                0 => fs::remove_file(&path).unwrap(),
                1 | 2 => {
                    let content = self.random_content();
                    fs::write(&path, content).unwrap();
                }
                _ => {}
            }
        }
        let added = self.rng.random_range(0..4);
        for _ in 0..added {
            let name = format!("new{}.dat", self.rng.random_range(0..1_000_000));
            let content = self.random_content();
            fs::write(self.source.path().join(name), content).unwrap();
        }
    }

    /// Back up and remember what the source looked like
    pub fn backup(&mut self) -> BackupReport {
        let report = self.stowage.perform_backup().unwrap();
        assert_eq!(report.version as usize, self.history.len());
        self.history.push(snapshot(self.source.path()));
        report
    }

    /// Restore `version` into a fresh directory and snapshot it
    pub fn restore_snapshot(&self, version: VersionNumber, workers: usize) -> (Snapshot, RestoreReport) {
        let destination = TempDir::new().unwrap();
        let report = self
            .stowage
            .restore(version, RestoreOptions {
                destination: Some(destination.path().to_path_buf()),
                workers: Some(workers),
            })
            .unwrap();
        (snapshot(destination.path()), report)
    }
}

#[test]
fn test_every_version_restores_exactly() {
    let mut harness = BackupHarness::new(7);
    harness.populate(30);
    harness.backup();
    for _ in 0..5 {
        harness.mutate();
        harness.backup();
    }

    for version in 0..harness.history.len() {
        let (restored, report) = harness.restore_snapshot(version as VersionNumber, 1);
        assert_eq!(restored, harness.history[version], "version {} differs", version);
        assert_eq!(report.files_restored, restored.len());
        assert!(harness.stowage.full_verify(version as VersionNumber).unwrap());
    }
}

#[test]
fn test_parallel_and_sequential_restore_agree() {
    let mut harness = BackupHarness::new(11);
    harness.populate(40);
    harness.backup();
    for _ in 0..4 {
        harness.mutate();
        harness.backup();
    }

    let newest = harness.history.len() as VersionNumber - 1;
    let (sequential, one) = harness.restore_snapshot(newest, 1);
    let (parallel, many) = harness.restore_snapshot(newest, 8);
    assert_eq!(sequential, parallel);
    assert_eq!(sequential, harness.history[newest as usize]);
    assert_eq!(one.archives_opened, many.archives_opened);
    assert_eq!(one.bytes_written, many.bytes_written);
}

#[test]
fn test_dependencies_are_sorted_earlier_and_sufficient() {
    let mut harness = BackupHarness::new(3);
    harness.populate(20);
    harness.backup();
    for _ in 0..6 {
        harness.mutate();
        harness.backup();
    }

    for version in 0..harness.history.len() as VersionNumber {
        let deps = harness.stowage.version_dependencies(version).unwrap();
        assert!(deps.windows(2).all(|w| w[0] < w[1]), "unsorted {:?}", deps);
        assert!(deps.iter().all(|d| *d < version));

        // Dependencies are flattened, so a restore opens the version's own
        // archive and its direct dependencies, nothing further back.
        let (restored, report) = harness.restore_snapshot(version, 2);
        let mut expected = deps.clone();
        expected.push(version);
        assert_eq!(report.archives_opened, expected);
        assert_eq!(restored, harness.history[version as usize]);
    }
}

#[test]
fn test_restore_opens_only_direct_dependencies() {
    let mut harness = BackupHarness::new(13);
    let a = harness.source.path().join("a.txt");
    let b = harness.source.path().join("b.txt");
    fs::write(&a, b"alpha, stored by version 0").unwrap();
    fs::write(&b, b"bravo, first edition").unwrap();
    harness.backup();

    fs::write(&b, b"bravo, second edition").unwrap();
    assert_eq!(harness.backup().dependencies, vec![0]);

    fs::remove_file(&a).unwrap();
    fs::write(harness.source.path().join("c.txt"), b"charlie").unwrap();
    let report = harness.backup();
    // Version 1 still needs version 0, but version 2 no longer does.
    assert_eq!(report.dependencies, vec![1]);
    assert_eq!(harness.stowage.version_dependencies(1).unwrap(), vec![0]);

    let (restored, restore) = harness.restore_snapshot(2, 1);
    assert_eq!(restore.archives_opened, vec![1, 2]);
    assert_eq!(restored, harness.history[2]);
    assert_eq!(restore.files_restored, restored.len());

    // The archive version 2 does not need can go missing.
    fs::remove_file(harness.target.path().join(target::version_file_name(0))).unwrap();
    for workers in [1, 4] {
        let (restored, restore) = harness.restore_snapshot(2, workers);
        assert_eq!(restore.archives_opened, vec![1, 2]);
        assert_eq!(restore.files_restored, 2);
        assert_eq!(restored, harness.history[2]);
    }
    assert!(harness.stowage.full_verify(2).unwrap());
    assert!(matches!(harness.stowage.full_verify(1), Err(StowageError::NotFound(_))));
}

#[test]
fn test_stream_ids_never_reused() {
    let mut harness = BackupHarness::new(5);
    harness.populate(10);
    harness.backup();
    for _ in 0..3 {
        harness.mutate();
        harness.backup();
    }

    let mut previous_next = 1;
    for version in 0..harness.history.len() as VersionNumber {
        let manifest = harness.stowage.manifest(version).unwrap();
        assert_eq!(manifest.first_stream_id, previous_next);
        assert!(manifest.next_stream_id >= manifest.first_stream_id);
        for id in &manifest.archive_metadata.stream_ids {
            assert!(*id >= manifest.first_stream_id && *id < manifest.next_stream_id);
        }
        previous_next = manifest.next_stream_id;
    }
}

#[test]
fn test_change_criteria() {
    // Same size, different content: only hashing notices.
    for (criterion, expect_stored) in [(ChangeCriterion::Size, 0), (ChangeCriterion::Hash, 1)] {
        let mut harness = BackupHarness::with_builder(1, StowageBuilder::new().change_criterion(criterion));
        let file = harness.source.path().join("same-size.txt");
        fs::write(&file, b"aaaa").unwrap();
        harness.backup();
        fs::write(&file, b"bbbb").unwrap();
        let report = harness.stowage.perform_backup().unwrap();
        assert_eq!(report.streams_stored, expect_stored, "criterion {}", criterion);
    }

    // Date notices a new modification time even when content is identical.
    let mut harness = BackupHarness::with_builder(1, StowageBuilder::new().change_criterion(ChangeCriterion::Date));
    let file = harness.source.path().join("touched.txt");
    fs::write(&file, b"same").unwrap();
    filetime::set_file_mtime(&file, filetime::FileTime::from_unix_time(1_000_000_000, 0)).unwrap();
    harness.backup();
    filetime::set_file_mtime(&file, filetime::FileTime::from_unix_time(1_100_000_000, 0)).unwrap();
    assert_eq!(harness.stowage.perform_backup().unwrap().streams_stored, 1);
    assert_eq!(harness.stowage.perform_backup().unwrap().streams_stored, 0);
}

#[test]
fn test_reopened_target_continues_history() {
    let mut harness = BackupHarness::new(9);
    harness.populate(8);
    harness.backup();

    let mut reopened = Stowage::open(harness.target.path()).unwrap();
    fs::write(harness.source.path().join("late.txt"), b"arrived late").unwrap();
    let report = reopened.perform_backup().unwrap();
    assert_eq!(report.version, 1);
    assert_eq!(report.streams_stored, 1);
    assert_eq!(report.dependencies, vec![0]);
}
