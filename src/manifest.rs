//! Version manifest
//!
//! The manifest closes every archive. It records the version number, the id
//! ranges handed out while building the version, the versions it depends on,
//! and the sizes a reader needs to find its way around the container.

use crate::error::{Result, StowageError};
use crate::types::{DifferentialChainId, StreamId, Timestamp, VersionNumber};
use serde::{Deserialize, Serialize};
use crate::collections::FastMap;

/// Section sizes and stream order of one archive
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArchiveMetadata {
    /// Stream ids in physical write order
    pub stream_ids: Vec<StreamId>,
    /// Content size of each stream, parallel to `stream_ids`
    pub stream_sizes: Vec<u64>,
    /// Serialized size of each root forest entry
    pub entry_sizes: Vec<u64>,
    /// Byte length of the forest section inside the archive
    pub entries_size_in_archive: u64,
}

impl ArchiveMetadata {
    /// Total content bytes stored
    pub fn stored_bytes(&self) -> u64 {
        self.stream_sizes.iter().sum()
    }

    /// Map from stream id to its physical position
    pub fn physical_positions(&self) -> FastMap<StreamId, usize> {
        self.stream_ids
            .iter()
            .enumerate()
            .map(|(position, id)| (*id, position))
            .collect()
    }
}

/// Trailer record of a version archive
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionManifest {
    /// Version this archive holds
    pub version_number: VersionNumber,
    /// When the backup started
    pub creation_time: Timestamp,
    /// Number of root forest entries
    pub entry_count: u64,
    /// First stream id issued for this version
    pub first_stream_id: StreamId,
    /// Next stream id the following version continues from
    pub next_stream_id: StreamId,
    /// First differential chain id issued for this version
    pub first_differential_chain_id: DifferentialChainId,
    /// Next differential chain id the following version continues from
    pub next_differential_chain_id: DifferentialChainId,
    /// Earlier versions whose archives hold content this version references
    pub version_dependencies: Vec<VersionNumber>,
    /// Section layout
    pub archive_metadata: ArchiveMetadata,
}

impl VersionManifest {
    /// Manifest for a version about to be written; layout is filled in by the writer
    pub fn new(version_number: VersionNumber, creation_time: Timestamp) -> Self {
        Self {
            version_number,
            creation_time,
            entry_count: 0,
            first_stream_id: 0,
            next_stream_id: 0,
            first_differential_chain_id: 0,
            next_differential_chain_id: 0,
            version_dependencies: Vec::new(),
            archive_metadata: ArchiveMetadata::default(),
        }
    }

    /// Encode with bincode
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(bincode::serde::encode_to_vec(self, bincode::config::standard())?)
    }

    /// Decode from bincode, rejecting trailing bytes and inconsistent layouts
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let (manifest, read): (VersionManifest, usize) =
            bincode::serde::decode_from_slice(bytes, bincode::config::standard())
                .map_err(|e| StowageError::corrupt(format!("manifest does not decode: {}", e)))?;
        if read != bytes.len() {
            return Err(StowageError::corrupt("trailing bytes after manifest"));
        }
        manifest.validate()?;
        Ok(manifest)
    }

    /// Check internal consistency
    pub fn validate(&self) -> Result<()> {
        let meta = &self.archive_metadata;
        if meta.stream_ids.len() != meta.stream_sizes.len() {
            return Err(StowageError::corrupt(format!(
                "{} stream ids but {} stream sizes",
                meta.stream_ids.len(),
                meta.stream_sizes.len()
            )));
        }
        if meta.entry_sizes.len() as u64 != self.entry_count {
            return Err(StowageError::corrupt(format!(
                "entry count {} does not match {} entry sizes",
                self.entry_count,
                meta.entry_sizes.len()
            )));
        }
        if self.next_stream_id < self.first_stream_id {
            return Err(StowageError::corrupt("stream id range runs backwards"));
        }
        if let Some(dep) = self
            .version_dependencies
            .iter()
            .find(|v| **v < 0 || **v >= self.version_number)
        {
            return Err(StowageError::corrupt(format!(
                "version {} cannot depend on version {}",
                self.version_number, dep
            )));
        }
        Ok(())
    }
}
