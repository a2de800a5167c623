//! In-memory object forest for one snapshot
//!
//! A snapshot is a forest: one root entry per backup source, each root
//! owning a tree of directories, regular files and link-like objects. Nodes
//! live in an arena ([`ObjectTree`]) and refer to each other through stable
//! [`NodeId`] handles. Directories own an ordered list of child handles;
//! every node stores its parent handle, which is a plain index and never
//! keeps anything alive.
//!
//! Only root nodes carry a base path (mapped and unmapped). Full paths of
//! other nodes are derived by walking the parent chain.
//!
//! ## Traversal
//!
//! - [`ObjectTree::pre_order`]: self, then children. Used for stream
//!   generation and GUID bookkeeping.
//! - [`ObjectTree::post_order`]: children, then self. Used to delete on-disk
//!   state before a restore.
//!
//! Both are finite single-pass iterators over handles. The tree can be
//! mutated between steps only by collecting the handles first.
//!
//! ## Serialization
//!
//! Each root subtree converts to a self-contained [`SerializedNode`] that is
//! bincode-encoded into the archive's forest section, one length-delimited
//! entry per root.

use crate::filesystem::{FileSystemAccess, ObjectMetadata};
use crate::types::{
    BackupMode, ContentGuid, DifferentialChainId, Sha256Digest, StreamId, Timestamp, VersionNumber,
    INVALID_CHAIN_ID, INVALID_STREAM_ID, INVALID_VERSION,
};
use crate::utils::{hash_reader, path_contains_path, path_key};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use tracing::{debug, trace};

/// Stable handle to a node inside one [`ObjectTree`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(usize);

impl NodeId {
    /// Arena index of this handle
    pub fn index(self) -> usize {
        self.0
    }
}

/// Kind of filesystem object a node represents
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NodeKind {
    /// Plain directory
    Directory,
    /// Regular file with content
    RegularFile,
    /// Symbolic link pointing at a directory
    DirectorySymlink,
    /// Directory junction
    Junction,
    /// Symbolic link pointing at a file
    FileSymlink,
    /// Other reparse point
    FileReparsePoint,
    /// Additional name for a file stored elsewhere in the forest
    FileHardlink,
}

impl NodeKind {
    /// Directory-like objects are never content candidates
    pub fn is_directoryish(self) -> bool {
        matches!(self, NodeKind::Directory | NodeKind::DirectorySymlink | NodeKind::Junction)
    }

    /// Kinds restored from a link target rather than from stored bytes
    pub fn is_link(self) -> bool {
        matches!(
            self,
            NodeKind::DirectorySymlink | NodeKind::Junction | NodeKind::FileSymlink | NodeKind::FileReparsePoint | NodeKind::FileHardlink
        )
    }

    /// Kinds whose restore needs a content stream
    pub fn requires_stream(self) -> bool {
        matches!(self, NodeKind::RegularFile)
    }

    /// Short display name
    pub fn as_str(self) -> &'static str {
        match self {
            NodeKind::Directory => "dir",
            NodeKind::RegularFile => "file",
            NodeKind::DirectorySymlink => "dir-symlink",
            NodeKind::Junction => "junction",
            NodeKind::FileSymlink => "symlink",
            NodeKind::FileReparsePoint => "reparse-point",
            NodeKind::FileHardlink => "hardlink",
        }
    }
}

impl fmt::Display for NodeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Location of a root entry
///
/// `mapped` is where the bytes are read from or written to; `unmapped` is the
/// path the user knows. They differ when a backup reads from a snapshot
/// mount or a restore is redirected to another directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BasePath {
    /// Path used for I/O
    pub mapped: PathBuf,
    /// Original path
    pub unmapped: PathBuf,
}

impl BasePath {
    /// Identical mapped and unmapped paths
    pub fn same(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        Self {
            mapped: path.clone(),
            unmapped: path,
        }
    }
}

/// One filesystem object
#[derive(Debug, Clone)]
pub struct Node {
    /// File name (for roots, the last component of the base path)
    pub name: String,
    /// Object kind
    pub kind: NodeKind,
    parent: Option<NodeId>,
    children: Vec<NodeId>,
    /// Root-only base path
    pub base_path: Option<BasePath>,
    /// Content size in bytes
    pub size: u64,
    /// Last modification time
    pub modified: Timestamp,
    /// OS archive attribute
    pub archive_flag: bool,
    /// Filesystem content identity, if the platform reports one
    pub content_guid: Option<ContentGuid>,
    /// Memoized SHA-256 of the content
    pub hash: Option<Sha256Digest>,
    /// Target of a link-like object
    pub link_target: Option<PathBuf>,
    /// Stream holding (or referenced for) the content
    pub stream_id: StreamId,
    /// Reserved partial-delta chain id
    pub differential_chain_id: DifferentialChainId,
    /// Version whose archive holds the content bytes
    pub latest_version: VersionNumber,
    /// Backup decision for this object
    pub backup_mode: BackupMode,
}

impl Node {
    /// A fresh node with no backup bookkeeping
    pub fn new(name: impl Into<String>, kind: NodeKind) -> Self {
        Self {
            name: name.into(),
            kind,
            parent: None,
            children: Vec::new(),
            base_path: None,
            size: 0,
            modified: Timestamp::default(),
            archive_flag: false,
            content_guid: None,
            hash: None,
            link_target: None,
            stream_id: INVALID_STREAM_ID,
            differential_chain_id: INVALID_CHAIN_ID,
            latest_version: INVALID_VERSION,
            backup_mode: if kind.is_directoryish() {
                BackupMode::Directory
            } else {
                BackupMode::Full
            },
        }
    }

    /// Build a node from filesystem metadata
    pub fn from_metadata(name: impl Into<String>, metadata: ObjectMetadata) -> Self {
        let mut node = Node::new(name, metadata.kind);
        node.size = metadata.size;
        node.modified = metadata.modified;
        node.archive_flag = metadata.archive_flag;
        node.content_guid = metadata.content_guid.filter(|g| g.is_valid());
        node.link_target = metadata.link_target;
        node
    }

    /// Parent handle, `None` for roots
    pub fn parent(&self) -> Option<NodeId> {
        self.parent
    }

    /// Child handles in order
    pub fn children(&self) -> &[NodeId] {
        &self.children
    }

    /// Valid content GUID, if any
    pub fn valid_guid(&self) -> Option<ContentGuid> {
        self.content_guid.filter(|g| g.is_valid())
    }
}

/// Serializable form of a node subtree
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SerializedNode {
    /// File name
    pub name: String,
    /// Object kind
    pub kind: NodeKind,
    /// Root-only base path
    pub base_path: Option<BasePath>,
    /// Content size
    pub size: u64,
    /// Modification time
    pub modified: Timestamp,
    /// Archive attribute
    pub archive_flag: bool,
    /// Content identity
    pub content_guid: Option<ContentGuid>,
    /// Content hash
    pub hash: Option<Sha256Digest>,
    /// Link target
    pub link_target: Option<PathBuf>,
    /// Stream id
    pub stream_id: StreamId,
    /// Differential chain id
    pub differential_chain_id: DifferentialChainId,
    /// Version holding the content
    pub latest_version: VersionNumber,
    /// Backup decision
    pub backup_mode: BackupMode,
    /// Children in order
    pub children: Vec<SerializedNode>,
}

/// Arena-backed forest of object nodes
#[derive(Debug, Clone, Default)]
pub struct ObjectTree {
    nodes: Vec<Node>,
    roots: Vec<NodeId>,
}

impl ObjectTree {
    /// Create an empty forest
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a root entry
    pub fn add_root(&mut self, mut node: Node, base_path: BasePath) -> NodeId {
        node.parent = None;
        node.base_path = Some(base_path);
        let id = NodeId(self.nodes.len());
        self.nodes.push(node);
        self.roots.push(id);
        id
    }

    /// Append a child to `parent`
    pub fn add_child(&mut self, parent: NodeId, mut node: Node) -> NodeId {
        node.parent = Some(parent);
        node.base_path = None;
        let id = NodeId(self.nodes.len());
        self.nodes.push(node);
        self.nodes[parent.0].children.push(id);
        id
    }

    /// Root entries in order
    pub fn roots(&self) -> &[NodeId] {
        &self.roots
    }

    /// Number of root entries
    pub fn entry_count(&self) -> usize {
        self.roots.len()
    }

    /// Total number of nodes
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Whether the forest has no nodes
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Borrow a node
    pub fn node(&self, id: NodeId) -> &Node {
        &self.nodes[id.0]
    }

    /// Mutably borrow a node
    pub fn node_mut(&mut self, id: NodeId) -> &mut Node {
        &mut self.nodes[id.0]
    }

    /// Root entry a node belongs to
    pub fn root_of(&self, mut id: NodeId) -> NodeId {
        while let Some(parent) = self.nodes[id.0].parent {
            id = parent;
        }
        id
    }

    fn path_with(&self, id: NodeId, base: impl Fn(&BasePath) -> &Path) -> PathBuf {
        let mut names = Vec::new();
        let mut current = id;
        loop {
            let node = &self.nodes[current.0];
            match node.parent {
                Some(parent) => {
                    names.push(node.name.as_str());
                    current = parent;
                }
                None => break,
            }
        }
        let root = &self.nodes[current.0];
        let mut path = match &root.base_path {
            Some(bp) => base(bp).to_path_buf(),
            None => PathBuf::from(&root.name),
        };
        for name in names.iter().rev() {
            path.push(name);
        }
        path
    }

    /// Path used for I/O
    pub fn mapped_path(&self, id: NodeId) -> PathBuf {
        self.path_with(id, |bp| &bp.mapped)
    }

    /// Path as the user knows it
    pub fn unmapped_path(&self, id: NodeId) -> PathBuf {
        self.path_with(id, |bp| &bp.unmapped)
    }

    /// Replace the base path of a root entry
    pub fn set_base_path(&mut self, root: NodeId, base_path: BasePath) {
        self.nodes[root.0].base_path = Some(base_path);
    }

    /// Depth-first pre-order traversal of one subtree
    pub fn pre_order(&self, start: NodeId) -> PreOrder<'_> {
        PreOrder {
            tree: self,
            stack: vec![start],
        }
    }

    /// Pre-order traversal of every root in order
    pub fn iter(&self) -> impl Iterator<Item = NodeId> + '_ {
        self.roots.iter().flat_map(move |root| self.pre_order(*root))
    }

    /// Depth-first post-order traversal of one subtree
    pub fn post_order(&self, start: NodeId) -> PostOrder<'_> {
        PostOrder {
            tree: self,
            stack: vec![(start, false)],
        }
    }

    /// Find the node whose mapped path equals `path`, case-insensitively
    pub fn find(&self, path: &Path) -> Option<NodeId> {
        let key = path_key(path);
        for root in &self.roots {
            let root_key = path_key(&self.mapped_path(*root));
            if key == root_key {
                return Some(*root);
            }
            let Some(rest) = key.strip_prefix(&root_key) else {
                continue;
            };
            let Some(rest) = rest.strip_prefix('/').or(if root_key.ends_with('/') { Some(rest) } else { None }) else {
                continue;
            };
            let mut current = *root;
            let mut found = true;
            for part in rest.split('/').filter(|p| !p.is_empty()) {
                match self.nodes[current.0]
                    .children
                    .iter()
                    .find(|c| self.nodes[c.0].name.to_lowercase() == part)
                {
                    Some(child) => current = *child,
                    None => {
                        found = false;
                        break;
                    }
                }
            }
            if found {
                return Some(current);
            }
        }
        None
    }

    /// Whether `path` lies below the node's mapped path
    pub fn contains(&self, id: NodeId, path: &Path) -> bool {
        path_contains_path(&self.mapped_path(id), path)
    }

    /// Content hash, computed at most once per node
    ///
    /// Returns `None` when the content cannot be read; the caller decides
    /// what an unknown hash means.
    pub fn compute_hash(&mut self, id: NodeId, fs: &dyn FileSystemAccess) -> Option<Sha256Digest> {
        if let Some(hash) = self.nodes[id.0].hash {
            return Some(hash);
        }
        if self.nodes[id.0].kind != NodeKind::RegularFile {
            return None;
        }
        let path = self.mapped_path(id);
        let result = fs
            .open_for_exclusive_read(&path)
            .and_then(|(reader, _)| hash_reader(reader).map_err(Into::into));
        match result {
            Ok((digest, _)) => {
                trace!("Hashed {:?}: {}", path, digest);
                self.nodes[id.0].hash = Some(digest);
                Some(digest)
            }
            Err(e) => {
                debug!("Cannot hash {:?}: {}", path, e);
                None
            }
        }
    }

    /// Forget a memoized hash
    pub fn invalidate_hash(&mut self, id: NodeId) {
        self.nodes[id.0].hash = None;
    }

    /// Serialize one subtree
    pub fn to_serialized(&self, id: NodeId) -> SerializedNode {
        // Post-order leaves each finished child on top of `built`
        let mut built = Vec::new();
        for &child in &self.nodes[id.0].children {
            for current in self.post_order(child) {
                let count = self.nodes[current.0].children.len();
                let children = built.split_off(built.len() - count);
                built.push(self.serialize_node(current, children));
            }
        }
        self.serialize_node(id, built)
    }

    fn serialize_node(&self, id: NodeId, children: Vec<SerializedNode>) -> SerializedNode {
        let node = &self.nodes[id.0];
        SerializedNode {
            name: node.name.clone(),
            kind: node.kind,
            base_path: node.base_path.clone(),
            size: node.size,
            modified: node.modified,
            archive_flag: node.archive_flag,
            content_guid: node.content_guid,
            hash: node.hash,
            link_target: node.link_target.clone(),
            stream_id: node.stream_id,
            differential_chain_id: node.differential_chain_id,
            latest_version: node.latest_version,
            backup_mode: node.backup_mode,
            children,
        }
    }

    /// Add a deserialized subtree as a new root entry
    pub fn graft_root(&mut self, serialized: SerializedNode) -> NodeId {
        let base_path = serialized
            .base_path
            .clone()
            .unwrap_or_else(|| BasePath::same(&serialized.name));
        let (node, children) = Self::split(serialized);
        let id = self.add_root(node, base_path);
        self.graft_children(id, children);
        id
    }

    fn graft_children(&mut self, parent: NodeId, children: Vec<SerializedNode>) {
        let mut stack = vec![(parent, children.into_iter())];
        while let Some((parent, pending)) = stack.last_mut() {
            match pending.next() {
                Some(child) => {
                    let parent = *parent;
                    let (node, grandchildren) = Self::split(child);
                    let id = self.add_child(parent, node);
                    stack.push((id, grandchildren.into_iter()));
                }
                None => {
                    stack.pop();
                }
            }
        }
    }

    fn split(s: SerializedNode) -> (Node, Vec<SerializedNode>) {
        let node = Node {
            name: s.name,
            kind: s.kind,
            parent: None,
            children: Vec::new(),
            base_path: s.base_path,
            size: s.size,
            modified: s.modified,
            archive_flag: s.archive_flag,
            content_guid: s.content_guid,
            hash: s.hash,
            link_target: s.link_target,
            stream_id: s.stream_id,
            differential_chain_id: s.differential_chain_id,
            latest_version: s.latest_version,
            backup_mode: s.backup_mode,
        };
        (node, s.children)
    }
}

/// Pre-order iterator over node handles
pub struct PreOrder<'a> {
    tree: &'a ObjectTree,
    stack: Vec<NodeId>,
}

impl Iterator for PreOrder<'_> {
    type Item = NodeId;

    fn next(&mut self) -> Option<NodeId> {
        let id = self.stack.pop()?;
        self.stack.extend(self.tree.nodes[id.0].children.iter().rev().copied());
        Some(id)
    }
}

/// Post-order iterator over node handles
pub struct PostOrder<'a> {
    tree: &'a ObjectTree,
    stack: Vec<(NodeId, bool)>,
}

impl Iterator for PostOrder<'_> {
    type Item = NodeId;

    fn next(&mut self) -> Option<NodeId> {
        loop {
            let (id, expanded) = self.stack.pop()?;
            if expanded {
                return Some(id);
            }
            self.stack.push((id, true));
            self.stack
                .extend(self.tree.nodes[id.0].children.iter().rev().map(|c| (*c, false)));
        }
    }
}
