//! Logical content streams
//!
//! A [`BackupStream`] is one unit of content with a unique id. A `Full`
//! stream's bytes are written into the archive of the version being built;
//! an `Unmodified` stream points at bytes stored by an earlier version. The
//! same stream may back several nodes (content-GUID duplicates), the first of
//! which is the canonical holder whose file is actually read.

use crate::error::{Result, StowageError};
use crate::tree::NodeId;
use crate::types::{StreamId, VersionNumber};
use std::collections::BTreeSet;

/// What a stream stores
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamKind {
    /// New bytes written into this version's archive
    Full,
    /// Bytes stored by an earlier version
    Unmodified {
        /// Version whose archive holds the bytes
        containing_version: VersionNumber,
    },
}

/// One logical content unit and the nodes attached to it
#[derive(Debug, Clone)]
pub struct BackupStream {
    id: StreamId,
    kind: StreamKind,
    physical_size: u64,
    virtual_size: u64,
    objects: Vec<NodeId>,
}

impl BackupStream {
    /// A stream whose bytes go into the current archive
    pub fn full(id: StreamId, size: u64, holder: NodeId) -> Self {
        Self {
            id,
            kind: StreamKind::Full,
            physical_size: size,
            virtual_size: size,
            objects: vec![holder],
        }
    }

    /// A back-reference to bytes stored by `containing_version`
    pub fn unmodified(id: StreamId, containing_version: VersionNumber, size: u64, holder: NodeId) -> Self {
        Self {
            id,
            kind: StreamKind::Unmodified { containing_version },
            physical_size: 0,
            virtual_size: size,
            objects: vec![holder],
        }
    }

    /// Partial-delta streams are reserved
    pub fn rsync(id: StreamId) -> Result<Self> {
        Err(StowageError::unsupported(format!(
            "partial-delta backup mode (stream {})",
            id
        )))
    }

    /// Stream id
    pub fn id(&self) -> StreamId {
        self.id
    }

    /// Stream kind
    pub fn kind(&self) -> StreamKind {
        self.kind
    }

    /// Whether the current archive stores bytes for this stream
    pub fn has_data(&self) -> bool {
        matches!(self.kind, StreamKind::Full)
    }

    /// Bytes the current archive is expected to store
    pub fn physical_size(&self) -> u64 {
        self.physical_size
    }

    /// Size of the content the stream represents
    pub fn virtual_size(&self) -> u64 {
        self.virtual_size
    }

    /// Record the size actually written
    pub fn set_physical_size(&mut self, size: u64) {
        self.physical_size = size;
        self.virtual_size = size;
    }

    /// Canonical holder, the node whose content is read
    pub fn holder(&self) -> NodeId {
        self.objects[0]
    }

    /// Every node backed by this stream
    pub fn objects(&self) -> &[NodeId] {
        &self.objects
    }

    /// Attach another node
    pub fn attach(&mut self, node: NodeId) {
        self.objects.push(node);
    }

    /// Add the versions this stream depends on
    pub fn dependencies(&self, into: &mut BTreeSet<VersionNumber>) {
        if let StreamKind::Unmodified { containing_version } = self.kind {
            into.insert(containing_version);
        }
    }
}
