//! Archive integrity checks
//!
//! Every archive ends with a SHA-256 digest of all bytes before it. A check
//! recomputes that digest over `file[..len - 32]` and compares it with the
//! stored one.
//!
//! ## Levels
//!
//! - [`verify_archive`]: one file, by path.
//! - [`Verifier::verify`]: one version of a target.
//! - [`Verifier::full_verify`]: a version and every version it depends on.
//!
//! A digest mismatch is an expected outcome and is reported as `false`.
//! Errors are reserved for problems that keep the check from running at
//! all: a missing archive, a file too short to have a trailer, or (for the
//! full check) a checked version whose manifest cannot be decoded even
//! though its digest matched. Dependency manifests are never decoded.

use crate::archive::{DIGEST_LEN, TRAILER_LEN};
use crate::error::{Result, StowageError};
use crate::keys::CryptoContext;
use crate::target::BackupTarget;
use crate::types::{Sha256Digest, VersionNumber};
use crate::utils::hash_reader;
use crate::version_graph::VersionGraph;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs::File;
use std::io::{self, BufReader, Read, Seek, SeekFrom};
use std::path::Path;
use std::time::Instant;
use tracing::{debug, info, instrument, warn};

/// Check the trailer digest of one archive file
///
/// # Errors
///
/// - [`StowageError::NotFound`] if the file does not exist
/// - [`StowageError::Corrupt`] if the file is shorter than its trailer
pub fn verify_archive(path: &Path) -> Result<bool> {
    let mut file = match File::open(path) {
        Ok(file) => file,
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            return Err(StowageError::not_found(format!("archive {:?}", path)))
        }
        Err(e) => return Err(e.into()),
    };
    let len = file.metadata()?.len();
    if len < TRAILER_LEN {
        return Err(StowageError::corrupt(format!(
            "{:?} is {} bytes, shorter than its trailer",
            path, len
        )));
    }

    let body_len = len - DIGEST_LEN;
    let (computed, hashed) = hash_reader(BufReader::new(&mut file).take(body_len))?;
    if hashed != body_len {
        return Err(StowageError::corrupt(format!("{:?} shrank while being verified", path)));
    }
    let mut stored = [0u8; DIGEST_LEN as usize];
    file.seek(SeekFrom::Start(body_len))?;
    file.read_exact(&mut stored)?;

    let matches = computed == Sha256Digest(stored);
    if !matches {
        warn!("Digest mismatch in {:?}", path);
    }
    Ok(matches)
}

/// Outcome of checking one version and its dependencies
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct VerificationReport {
    /// Version that was checked
    pub version: VersionNumber,
    /// Every archive checked, with its outcome, in ascending version order
    pub archives: Vec<(VersionNumber, bool)>,
    /// Time taken in milliseconds
    pub duration_ms: u64,
}

impl VerificationReport {
    /// Whether every checked archive passed
    pub fn is_valid(&self) -> bool {
        !self.archives.is_empty() && self.archives.iter().all(|(_, ok)| *ok)
    }

    /// Versions whose digest did not match
    pub fn failed(&self) -> Vec<VersionNumber> {
        self.archives
            .iter()
            .filter(|(_, ok)| !*ok)
            .map(|(v, _)| *v)
            .collect()
    }
}

impl fmt::Display for VerificationReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_valid() {
            write!(
                f,
                "version {}: {} archives intact",
                self.version,
                self.archives.len()
            )
        } else {
            write!(
                f,
                "version {}: {} of {} archives damaged {:?}",
                self.version,
                self.failed().len(),
                self.archives.len(),
                self.failed()
            )
        }
    }
}

/// Checks versions of one backup target
pub struct Verifier<'a> {
    target: &'a BackupTarget,
    crypto: Option<&'a CryptoContext>,
}

impl<'a> Verifier<'a> {
    /// Create a verifier
    pub fn new(target: &'a BackupTarget, crypto: Option<&'a CryptoContext>) -> Self {
        Self { target, crypto }
    }

    /// Check the archive of one version
    pub fn verify(&self, version: VersionNumber) -> Result<bool> {
        let version = self.target.resolve_version(version)?;
        verify_archive(&self.target.version_path(version))
    }

    /// Check a version and every version it depends on
    pub fn full_verify(&self, version: VersionNumber) -> Result<bool> {
        Ok(self.full_report(version)?.is_valid())
    }

    /// Per-archive outcome of a full check
    ///
    /// The dependency list is read from the version's own manifest, so a
    /// version whose digest fails is reported alone. Dependencies are only
    /// digest-checked; their manifests are never decoded, so a damaged
    /// dependency shows up as a failed entry rather than an error.
    #[instrument(skip(self))]
    pub fn full_report(&self, version: VersionNumber) -> Result<VerificationReport> {
        let start = Instant::now();
        let version = self.target.resolve_version(version)?;
        let mut report = VerificationReport {
            version,
            ..Default::default()
        };

        if !verify_archive(&self.target.version_path(version))? {
            report.archives.push((version, false));
            report.duration_ms = start.elapsed().as_millis() as u64;
            return Ok(report);
        }

        let mut dependencies = VersionGraph::new(self.target, self.crypto).dependencies(version)?;
        dependencies.sort_unstable();
        dependencies.dedup();
        for dep in dependencies {
            let ok = verify_archive(&self.target.version_path(dep))?;
            debug!("Version {}: {}", dep, if ok { "intact" } else { "damaged" });
            report.archives.push((dep, ok));
        }
        report.archives.push((version, true));
        report.duration_ms = start.elapsed().as_millis() as u64;
        info!("Verified {}", report);
        Ok(report)
    }
}
