//! # Stowage - Versioned, deduplicating, encrypted backups
//!
//! A backup engine that stores each version of a set of source directories
//! in a single archive file, referring back to earlier archives for content
//! that has not changed.
//!
//! ## Overview
//!
//! Stowage turns a set of source paths into a sequence of numbered versions:
//! - Version 0 stores every eligible file
//! - Every later version stores only files that changed, judged by size,
//!   modification time or content hash
//! - Files sharing one on-disk identity (hardlinks) are stored once
//! - Any version can be restored, pulling content from exactly the earlier
//!   archives it depends on, each opened once
//! - Every archive carries a SHA-256 digest over all of its bytes
//!
//! ## Architecture
//!
//! - **Archive Container**: A version archive has three sections (content
//!   streams, the object forest, the manifest) followed by a fixed trailer.
//!   Each section is wrapped by a codec stack of chunked LZ4 compression and
//!   optional authenticated encryption.
//! - **Backup Orchestrator**: Walks the new object forest, compares each
//!   object with the previous version and decides its backup mode, assigning
//!   stream ids and recording which earlier versions the new one depends on.
//! - **Version Graph**: Loads a version and the versions it depends on
//!   directly, every manifest exactly once.
//! - **Restore Engine**: Rebuilds the object tree at its original location
//!   or a new destination, replaying each needed archive in one forward pass,
//!   optionally with several workers.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use stowage::{RestoreOptions, StowageBuilder};
//! use std::path::PathBuf;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let mut stowage = StowageBuilder::new()
//!     .source("./my_project")
//!     .ignore_extension("tmp")
//!     .open("./backups")?;
//!
//! // Version 0 stores everything
//! let first = stowage.perform_backup()?;
//! println!("Stored {} streams", first.streams_stored);
//!
//! // Make some changes to your files...
//!
//! // Version 1 stores only what changed
//! let second = stowage.perform_backup()?;
//! println!("Version {} depends on {:?}", second.version, second.dependencies);
//!
//! // Restore version 0 into a separate directory
//! let report = stowage.restore(0, RestoreOptions {
//!     destination: Some(PathBuf::from("./restored")),
//!     ..Default::default()
//! })?;
//! println!("Restored {} files", report.files_restored);
//! # Ok(())
//! # }
//! ```
//!
//! ## Advanced Usage
//!
//! ### Encrypted Archives
//!
//! ```rust,no_run
//! use stowage::{Cipher, CryptoContext, KeyPair, Stowage, StowageBuilder};
//! use std::path::Path;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let keypair = Stowage::generate_keypair(Path::new("./backup.key"))?;
//! let mut stowage = StowageBuilder::new()
//!     .source("./secrets")
//!     .crypto(CryptoContext::new(keypair, Cipher::ChaCha20Poly1305))
//!     .open("./backups")?;
//! stowage.perform_backup()?;
//!
//! // Restoring needs the private key
//! let mut stowage = Stowage::open("./backups")?;
//! let keypair = KeyPair::load(Path::new("./backup.key"))?;
//! stowage.set_crypto(Some(CryptoContext::new(keypair, Cipher::ChaCha20Poly1305)));
//! stowage.restore(-1, Default::default())?;
//! # Ok(())
//! # }
//! ```
//!
//! ### Verification
//!
//! ```rust,no_run
//! # use stowage::Stowage;
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! # let stowage = Stowage::open("./backups")?;
//! let report = stowage.verification_report(-1)?;
//! if report.is_valid() {
//!     println!("All {} archives intact", report.archives.len());
//! } else {
//!     println!("Damaged versions: {:?}", report.failed());
//! }
//! # Ok(())
//! # }
//! ```
//!
//! ## Key Concepts
//!
//! ### Versions
//!
//! Versions are numbered from 0 in creation order. Version `n` lives in
//! `version{n:08}.arc` inside the backup target. Negative numbers passed to
//! query and restore operations count back from the newest version.
//!
//! ### Streams
//!
//! A stream is one file's content inside an archive, identified by an id
//! that is unique across all versions of a target. An unchanged file keeps
//! the stream id it was stored under and names the version holding it.
//!
//! ### Dependencies
//!
//! A version depends on every earlier version whose archive holds content
//! it references. Dependencies are flattened when a version is written, so
//! restoring never walks long chains.
//!
//! ## Security Considerations
//!
//! - Session keys are generated per archive and wrapped for an X25519
//!   recipient; only the public key is needed to back up
//! - Every encrypted chunk is authenticated; tampering surfaces as an error
//! - The trailer digest detects accidental damage, not a malicious rewrite
//!   of an unencrypted archive
//!
//! ## Module Organization
//!
//! - [`stowage`]: The [`Stowage`] facade and its builder
//! - [`archive`]: Archive writer and reader
//! - [`backup`]: Backup orchestration
//! - [`restore`]: Restore engine
//! - [`version_graph`]: Dependency resolution
//! - [`verification`]: Trailer digest checks
//! - [`codec`], [`compression`], [`crypto`], [`keys`]: Section codecs and key management
//! - [`tree`], [`scan`], [`rules`], [`filesystem`]: Object forest and the filesystem seam
//! - [`types`]: Common types and data structures
//! - [`error`]: Error types and handling

// Public API modules
pub mod archive;
pub mod backup;
pub mod codec;
pub mod compression;
pub mod crypto;
pub mod error;
pub mod filesystem;
pub mod keys;
pub mod manifest;
pub mod restore;
pub mod rules;
pub mod scan;
pub mod stowage;
pub mod stream;
pub mod target;
pub mod tree;
pub mod types;
pub mod utils;
pub mod verification;
pub mod version_graph;

// Internal modules (not part of public API)
mod collections;

// Re-export main types for convenience
pub use crate::stowage::{Stowage, StowageBuilder};
pub use archive::{ArchiveReader, ArchiveSettings};
pub use crypto::Cipher;
pub use error::{Result, StowageError};
pub use filesystem::{
    ErrorAction, ErrorReporter, FileSystemAccess, LocalFilesystem, LoggingErrorReporter, StrictErrorReporter,
};
pub use keys::{CryptoContext, KeyPair};
pub use manifest::VersionManifest;
pub use tree::{NodeKind, ObjectTree};
pub use types::*;
pub use verification::{verify_archive, VerificationReport};
