//! Chaos tests for Stowage
//!
//! Damages backup targets in the ways real storage fails (flipped bits,
//! truncation, lost or swapped archives, wrong keys) and checks that
//! every failure is reported instead of restoring wrong content.

use ::stowage::*;
use tempfile::TempDir;
use std::fs;
use std::path::{Path, PathBuf};
use rand::{Rng, SeedableRng};
use rand::rngs::StdRng;

/// A source with a few distinct files and one backed-up version
pub struct DamagedTarget {
    pub source: TempDir,
    pub target: TempDir,
    pub stowage: Stowage,
}

impl DamagedTarget {
    pub fn new() -> Self {
        let source = TempDir::new().unwrap();
        let target = TempDir::new().unwrap();
        let mut rng = StdRng::seed_from_u64(42);
        for name in ["alpha.txt", "bravo.bin", "charlie.md"] {
            let mut content = vec![0u8; 20_000];
            rng.fill(&mut content[..]);
            fs::write(source.path().join(name), content).unwrap();
        }
        fs::create_dir(source.path().join("delta")).unwrap();
        fs::write(source.path().join("delta/echo.txt"), b"echo ".repeat(500)).unwrap();

        let mut stowage = StowageBuilder::new()
            .source(source.path())
            .open(target.path())
            .unwrap();
        stowage.perform_backup().unwrap();
        Self { source, target, stowage }
    }

    pub fn archive(&self, version: VersionNumber) -> PathBuf {
        self.target.path().join(target::version_file_name(version))
    }

    /// Restore into a fresh directory
    pub fn try_restore(&self, version: VersionNumber) -> (TempDir, Result<RestoreReport>) {
        let destination = TempDir::new().unwrap();
        let result = self.stowage.restore(version, RestoreOptions {
            destination: Some(destination.path().to_path_buf()),
            workers: Some(1),
        });
        (destination, result)
    }

    /// Every restored file that carries an original name has the original content
    pub fn assert_no_wrong_content(&self, restored: &Path) {
        for relative in ["alpha.txt", "bravo.bin", "charlie.md", "delta/echo.txt"] {
            let path = restored.join(relative);
            if path.exists() {
                assert_eq!(
                    fs::read(&path).unwrap(),
                    fs::read(self.source.path().join(relative)).unwrap(),
                    "{} restored with wrong content",
                    relative
                );
            }
        }
    }
}

#[test]
fn test_flipped_bytes_never_pass_verification() {
    let damaged = DamagedTarget::new();
    let path = damaged.archive(0);
    let pristine = fs::read(&path).unwrap();
    let mut rng = StdRng::seed_from_u64(7);

    for _ in 0..25 {
        let mut bytes = pristine.clone();
        let offset = rng.random_range(0..bytes.len());
        bytes[offset] ^= 0xff;
        fs::write(&path, &bytes).unwrap();

        assert!(!damaged.stowage.verify(0).unwrap(), "flip at {} undetected", offset);
        let (restored, result) = damaged.try_restore(0);
        if result.is_ok() {
            damaged.assert_no_wrong_content(restored.path());
        }
    }

    fs::write(&path, &pristine).unwrap();
    assert!(damaged.stowage.verify(0).unwrap());
}

#[test]
fn test_truncated_archives() {
    let damaged = DamagedTarget::new();
    let path = damaged.archive(0);
    let pristine = fs::read(&path).unwrap();

    fs::write(&path, &pristine[..pristine.len() / 2]).unwrap();
    assert!(!damaged.stowage.verify(0).unwrap());
    assert!(damaged.try_restore(0).1.is_err());

    fs::write(&path, &pristine[..10]).unwrap();
    assert!(damaged.stowage.verify(0).unwrap_err().is_corruption());
    assert!(damaged.try_restore(0).1.unwrap_err().is_corruption());
}

#[test]
fn test_lost_dependency() {
    let mut damaged = DamagedTarget::new();
    fs::write(damaged.source.path().join("alpha.txt"), b"rewritten").unwrap();
    let report = damaged.stowage.perform_backup().unwrap();
    assert_eq!(report.dependencies, vec![0]);

    fs::remove_file(damaged.archive(0)).unwrap();
    assert!(damaged.stowage.verify(1).unwrap());
    assert!(matches!(damaged.stowage.full_verify(1), Err(StowageError::NotFound(_))));
    assert!(matches!(damaged.try_restore(1).1, Err(StowageError::NotFound(_))));
}

#[test]
fn test_swapped_archives_are_detected() {
    let mut damaged = DamagedTarget::new();
    fs::write(damaged.source.path().join("bravo.bin"), b"new bravo").unwrap();
    damaged.stowage.perform_backup().unwrap();

    let (zero, one) = (damaged.archive(0), damaged.archive(1));
    let parked = damaged.target.path().join("parked");
    fs::rename(&zero, &parked).unwrap();
    fs::rename(&one, &zero).unwrap();
    fs::rename(&parked, &one).unwrap();

    // Digests still match; only the recorded version number gives it away.
    assert!(damaged.stowage.verify(0).unwrap());
    assert!(damaged.stowage.manifest(0).unwrap_err().is_corruption());
    assert!(damaged.try_restore(1).1.unwrap_err().is_corruption());
}

#[test]
fn test_garbage_newest_archive_blocks_backup() {
    let mut damaged = DamagedTarget::new();
    fs::write(damaged.archive(1), vec![0x5a; 200]).unwrap();

    assert!(damaged.stowage.perform_backup().is_err());
    assert_eq!(damaged.stowage.list_versions().unwrap(), vec![0, 1]);

    let (restored, result) = damaged.try_restore(0);
    result.unwrap();
    damaged.assert_no_wrong_content(restored.path());
}

#[test]
fn test_damaged_side_file_falls_back_to_archive() {
    let damaged = DamagedTarget::new();
    let aux = damaged.target.path().join(".aux").join(target::aux_file_name(0));
    assert!(aux.exists());
    fs::write(&aux, b"not a forest").unwrap();

    assert_eq!(damaged.stowage.entries(0).unwrap().entry_count(), 4);
    let (restored, result) = damaged.try_restore(0);
    assert_eq!(result.unwrap().files_restored, 4);
    damaged.assert_no_wrong_content(restored.path());
}

#[test]
fn test_wrong_key_is_a_crypto_error() {
    let source = TempDir::new().unwrap();
    let target = TempDir::new().unwrap();
    fs::write(source.path().join("secret.txt"), b"classified").unwrap();
    let mut stowage = StowageBuilder::new()
        .source(source.path())
        .crypto(CryptoContext::new(KeyPair::generate(), Cipher::ChaCha20Poly1305))
        .open(target.path())
        .unwrap();
    stowage.perform_backup().unwrap();

    stowage.set_crypto(Some(CryptoContext::new(KeyPair::generate(), Cipher::ChaCha20Poly1305)));
    let destination = TempDir::new().unwrap();
    let result = stowage.restore(0, RestoreOptions {
        destination: Some(destination.path().to_path_buf()),
        workers: None,
    });
    assert!(matches!(result, Err(StowageError::Crypto(_))));
    assert!(!destination.path().join("secret.txt").exists());
}
