//! Main test module for Stowage
//!
//! This module includes all test suites:
//! - Integration tests for multi-version histories
//! - Chaos tests for damaged and missing archives
//! - Property-based tests for invariants

pub mod integration;
pub mod chaos;
pub mod property;

#[cfg(test)]
mod edge_cases {
    use ::stowage::*;
    use tempfile::TempDir;
    use std::fs;
    use std::path::Path;

    fn open(source: &Path, target: &Path) -> Stowage {
        StowageBuilder::new()
            .source(source)
            .open(target)
            .unwrap()
    }

    fn restore_into(stowage: &Stowage, version: VersionNumber, dir: &Path) -> RestoreReport {
        stowage
            .restore(version, RestoreOptions {
                destination: Some(dir.to_path_buf()),
                workers: None,
            })
            .unwrap()
    }

    #[test]
    fn test_special_filenames() {
        let source = TempDir::new().unwrap();
        let target = TempDir::new().unwrap();

        // Create files with special characters
        let special_names = vec![
            "file with spaces.txt",
            "file-with-dashes.txt",
            "file.with.dots.txt",
            "file@with#special$chars.txt",
            "file(with)parens.txt",
            "file[with]brackets.txt",
            "ünïcödé.txt",
        ];
        let mut written = Vec::new();
        for name in &special_names {
            // Skip if OS doesn't support this filename
            if fs::write(source.path().join(name), format!("Content of {}", name)).is_ok() {
                written.push(*name);
            }
        }

        let mut stowage = open(source.path(), target.path());
        let report = stowage.perform_backup().unwrap();
        assert_eq!(report.entry_count, written.len());

        let restored = TempDir::new().unwrap();
        restore_into(&stowage, 0, restored.path());
        for name in written {
            let content = fs::read_to_string(restored.path().join(name)).unwrap();
            assert_eq!(content, format!("Content of {}", name));
        }
    }

    #[test]
    fn test_empty_files_and_directories() {
        let source = TempDir::new().unwrap();
        let target = TempDir::new().unwrap();
        fs::create_dir_all(source.path().join("empty/nested/deeper")).unwrap();
        fs::write(source.path().join("zero.bin"), b"").unwrap();
        fs::write(source.path().join("empty/nested/zero.txt"), b"").unwrap();

        let mut stowage = open(source.path(), target.path());
        stowage.perform_backup().unwrap();

        let restored = TempDir::new().unwrap();
        restore_into(&stowage, 0, restored.path());
        assert!(restored.path().join("empty/nested/deeper").is_dir());
        assert_eq!(fs::metadata(restored.path().join("zero.bin")).unwrap().len(), 0);
        assert_eq!(fs::metadata(restored.path().join("empty/nested/zero.txt")).unwrap().len(), 0);
    }

    #[test]
    fn test_deeply_nested_structure() {
        let source = TempDir::new().unwrap();
        let target = TempDir::new().unwrap();
        let mut deep = source.path().to_path_buf();
        for level in 0..40 {
            deep = deep.join(format!("level{}", level));
        }
        fs::create_dir_all(&deep).unwrap();
        fs::write(deep.join("bottom.txt"), b"at the bottom").unwrap();

        let mut stowage = open(source.path(), target.path());
        stowage.perform_backup().unwrap();

        let restored = TempDir::new().unwrap();
        restore_into(&stowage, 0, restored.path());
        let relative = deep.strip_prefix(source.path()).unwrap();
        assert_eq!(
            fs::read(restored.path().join(relative).join("bottom.txt")).unwrap(),
            b"at the bottom"
        );
    }

    #[test]
    fn test_large_file_spans_many_chunks() {
        let source = TempDir::new().unwrap();
        let target = TempDir::new().unwrap();
        let content: Vec<u8> = (0..1_500_000u32).map(|i| (i.wrapping_mul(2654435761) >> 13) as u8).collect();
        fs::write(source.path().join("big.bin"), &content).unwrap();

        for compression in [true, false] {
            let target_dir = target.path().join(if compression { "packed" } else { "plain" });
            let mut stowage = StowageBuilder::new()
                .source(source.path())
                .compression(compression)
                .open(&target_dir)
                .unwrap();
            let report = stowage.perform_backup().unwrap();
            assert_eq!(report.bytes_stored, content.len() as u64);

            let restored = TempDir::new().unwrap();
            let restore = restore_into(&stowage, 0, restored.path());
            assert_eq!(restore.bytes_written, content.len() as u64);
            assert_eq!(fs::read(restored.path().join("big.bin")).unwrap(), content);
        }
    }

    #[test]
    fn test_single_file_source() {
        let source = TempDir::new().unwrap();
        let target = TempDir::new().unwrap();
        let file = source.path().join("only.txt");
        fs::write(&file, b"just me").unwrap();

        let mut stowage = open(&file, target.path());
        let report = stowage.perform_backup().unwrap();
        assert_eq!(report.entry_count, 1);

        let restored = TempDir::new().unwrap();
        restore_into(&stowage, 0, restored.path());
        assert_eq!(fs::read(restored.path().join("only.txt")).unwrap(), b"just me");
    }

    #[test]
    fn test_restore_preserves_modification_time() {
        let source = TempDir::new().unwrap();
        let target = TempDir::new().unwrap();
        let file = source.path().join("dated.txt");
        fs::write(&file, b"old news").unwrap();
        let mtime = filetime::FileTime::from_unix_time(1_234_567_890, 0);
        filetime::set_file_mtime(&file, mtime).unwrap();

        let mut stowage = open(source.path(), target.path());
        stowage.perform_backup().unwrap();

        let restored = TempDir::new().unwrap();
        restore_into(&stowage, 0, restored.path());
        let meta = fs::metadata(restored.path().join("dated.txt")).unwrap();
        assert_eq!(filetime::FileTime::from_last_modification_time(&meta).unix_seconds(), 1_234_567_890);
    }

    #[cfg(unix)]
    #[test]
    fn test_symlinks_are_recreated_not_followed() {
        let source = TempDir::new().unwrap();
        let target = TempDir::new().unwrap();
        fs::write(source.path().join("real.txt"), b"real").unwrap();
        std::os::unix::fs::symlink("real.txt", source.path().join("alias")).unwrap();
        std::os::unix::fs::symlink("/nonexistent/elsewhere", source.path().join("dangling")).unwrap();

        let mut stowage = open(source.path(), target.path());
        let report = stowage.perform_backup().unwrap();
        assert_eq!(report.streams_stored, 1);

        let restored = TempDir::new().unwrap();
        restore_into(&stowage, 0, restored.path());
        assert_eq!(
            fs::read_link(restored.path().join("alias")).unwrap(),
            Path::new("real.txt")
        );
        assert_eq!(
            fs::read_link(restored.path().join("dangling")).unwrap(),
            Path::new("/nonexistent/elsewhere")
        );
        assert_eq!(fs::read(restored.path().join("alias")).unwrap(), b"real");
    }

    #[test]
    fn test_deleted_files_drop_out_of_later_versions() {
        let source = TempDir::new().unwrap();
        let target = TempDir::new().unwrap();
        fs::write(source.path().join("keep.txt"), b"keep").unwrap();
        fs::write(source.path().join("gone.txt"), b"gone").unwrap();
        let mut stowage = open(source.path(), target.path());
        stowage.perform_backup().unwrap();

        fs::remove_file(source.path().join("gone.txt")).unwrap();
        let report = stowage.perform_backup().unwrap();
        assert_eq!(report.entry_count, 1);
        assert_eq!(report.streams_stored, 0);

        let newest = TempDir::new().unwrap();
        restore_into(&stowage, 1, newest.path());
        assert!(newest.path().join("keep.txt").exists());
        assert!(!newest.path().join("gone.txt").exists());

        let oldest = TempDir::new().unwrap();
        restore_into(&stowage, 0, oldest.path());
        assert_eq!(fs::read(oldest.path().join("gone.txt")).unwrap(), b"gone");
    }
}
