//! Backup orchestration
//!
//! One orchestration pass walks the new forest in pre-order and decides, per
//! object, what the new version stores for it:
//!
//! 1. Ignored objects (`NoBackup`) get nothing.
//! 2. Directories get a fresh stream id but no content.
//! 3. An object whose valid content GUID was already seen in this pass is
//!    attached to the stream of the first object with that GUID (the
//!    canonical holder) and is neither read nor hashed.
//! 4. Otherwise, when a previous version exists, the change criterion
//!    compares the object with its counterpart in the previous forest. An
//!    unchanged object becomes `Unmodified` and keeps the previous stream id
//!    and version; that version becomes a dependency of the new one.
//! 5. Everything else gets a new `Full` stream with a fresh id.
//!
//! Stream ids come from a counter continued from the previous version's
//! `next_stream_id`, so they never repeat within a target.
//!
//! The pass is strictly sequential: the GUID map and the id counter are
//! mutated in traversal order. [`BackupPlan::write`] then stores the `Full`
//! streams, sorted for compression locality, followed by the forest and the
//! manifest.

use crate::archive::{ArchiveSettings, ArchiveSummary, ArchiveWriter};
use crate::collections::FastMap;
use crate::error::{Result, StowageError};
use crate::filesystem::FileSystemAccess;
use crate::keys::CryptoContext;
use crate::manifest::VersionManifest;
use crate::stream::BackupStream;
use crate::tree::{NodeId, NodeKind, ObjectTree};
use crate::types::{
    BackupMode, ChangeCriterion, ContentGuid, DifferentialChainId, ProgressCallback, ProgressInfo, StreamId,
    Timestamp, VersionNumber, FIRST_CHAIN_ID, FIRST_STREAM_ID, INVALID_STREAM_ID, INVALID_VERSION,
};
use crate::utils::{extension_of, is_known_text_extension, path_key};
use std::collections::BTreeSet;
use std::path::Path;
use tracing::{debug, instrument, trace};

/// The forest of the version a new backup is compared against
struct PreviousVersion<'a> {
    tree: &'a ObjectTree,
    by_path: FastMap<String, NodeId>,
}

impl<'a> PreviousVersion<'a> {
    fn new(tree: &'a ObjectTree) -> Self {
        let mut by_path = FastMap::default();
        for id in tree.iter() {
            if !tree.node(id).kind.is_directoryish() {
                by_path.insert(path_key(&tree.mapped_path(id)), id);
            }
        }
        Self { tree, by_path }
    }
}

/// Outcome of an orchestration pass
#[derive(Debug, Clone)]
pub struct BackupPlan {
    /// Version being built
    pub version: VersionNumber,
    /// First stream id issued by this pass
    pub first_stream_id: StreamId,
    /// Next stream id after this pass
    pub next_stream_id: StreamId,
    /// First differential chain id of this pass
    pub first_differential_chain_id: DifferentialChainId,
    /// Next differential chain id after this pass
    pub next_differential_chain_id: DifferentialChainId,
    /// Streams in assignment order
    pub streams: Vec<BackupStream>,
    /// Earlier versions holding content the new forest references
    pub dependencies: BTreeSet<VersionNumber>,
    /// Objects found unchanged
    pub unmodified: usize,
    /// Objects attached to another object's stream
    pub deduplicated: usize,
}

/// Decides per-object backup modes and stream ids for one version
pub struct Orchestrator<'a> {
    fs: &'a dyn FileSystemAccess,
    criterion: ChangeCriterion,
    version: VersionNumber,
    next_stream_id: StreamId,
    next_chain_id: DifferentialChainId,
    previous: Option<PreviousVersion<'a>>,
}

impl<'a> Orchestrator<'a> {
    /// Orchestrator for version 0: every eligible object is stored in full
    pub fn initial(fs: &'a dyn FileSystemAccess, criterion: ChangeCriterion) -> Self {
        Self {
            fs,
            criterion,
            version: 0,
            next_stream_id: FIRST_STREAM_ID,
            next_chain_id: FIRST_CHAIN_ID,
            previous: None,
        }
    }

    /// Orchestrator for a version following `previous_manifest`
    pub fn incremental(
        fs: &'a dyn FileSystemAccess,
        criterion: ChangeCriterion,
        previous_tree: &'a ObjectTree,
        previous_manifest: &VersionManifest,
    ) -> Self {
        Self {
            fs,
            criterion,
            version: previous_manifest.version_number + 1,
            next_stream_id: previous_manifest.next_stream_id.max(FIRST_STREAM_ID),
            next_chain_id: previous_manifest.next_differential_chain_id.max(FIRST_CHAIN_ID),
            previous: Some(PreviousVersion::new(previous_tree)),
        }
    }

    /// Version this orchestrator builds
    pub fn version(&self) -> VersionNumber {
        self.version
    }

    fn issue_stream_id(&mut self) -> StreamId {
        let id = self.next_stream_id;
        self.next_stream_id += 1;
        id
    }

    /// Run the pass over `tree`, recording decisions on its nodes
    ///
    /// # Errors
    ///
    /// - [`StowageError::UnsupportedOperation`] if a node is in partial-delta mode
    /// - [`StowageError::InvalidState`] if a node's mode cannot be handled
    #[instrument(skip_all, fields(version = self.version))]
    pub fn generate_streams(mut self, tree: &mut ObjectTree) -> Result<BackupPlan> {
        let mut plan = BackupPlan {
            version: self.version,
            first_stream_id: self.next_stream_id,
            next_stream_id: self.next_stream_id,
            first_differential_chain_id: self.next_chain_id,
            next_differential_chain_id: self.next_chain_id,
            streams: Vec::new(),
            dependencies: BTreeSet::new(),
            unmodified: 0,
            deduplicated: 0,
        };
        let mut known_guids: FastMap<ContentGuid, usize> = FastMap::default();

        let order: Vec<NodeId> = tree.iter().collect();
        for id in order {
            self.visit(tree, id, &mut known_guids, &mut plan)?;
        }

        for stream in &plan.streams {
            stream.dependencies(&mut plan.dependencies);
        }
        for id in tree.iter() {
            let latest = tree.node(id).latest_version;
            if latest != INVALID_VERSION && latest != self.version {
                plan.dependencies.insert(latest);
            }
        }
        plan.next_stream_id = self.next_stream_id;
        plan.next_differential_chain_id = self.next_chain_id;

        debug!(
            "Planned {} streams ({} unmodified, {} deduplicated), ids {}..{}, dependencies {:?}",
            plan.streams.len(),
            plan.unmodified,
            plan.deduplicated,
            plan.first_stream_id,
            plan.next_stream_id,
            plan.dependencies
        );
        Ok(plan)
    }

    fn visit(
        &mut self,
        tree: &mut ObjectTree,
        id: NodeId,
        known_guids: &mut FastMap<ContentGuid, usize>,
        plan: &mut BackupPlan,
    ) -> Result<()> {
        match tree.node(id).backup_mode {
            BackupMode::Directory => {
                let stream_id = self.issue_stream_id();
                let node = tree.node_mut(id);
                node.stream_id = stream_id;
                node.latest_version = INVALID_VERSION;
                return Ok(());
            }
            BackupMode::NoBackup => {
                let node = tree.node_mut(id);
                node.stream_id = INVALID_STREAM_ID;
                node.latest_version = INVALID_VERSION;
                return Ok(());
            }
            BackupMode::Full | BackupMode::ForceFull | BackupMode::Unmodified | BackupMode::Rsync => {}
        }

        if !self.should_be_added(tree, id, known_guids) {
            self.fix_up_stream_reference(tree, id, known_guids, plan);
            return Ok(());
        }

        if tree.node(id).backup_mode == BackupMode::Full && !self.file_has_changed(tree, id)? {
            tree.node_mut(id).backup_mode = BackupMode::Unmodified;
        }

        let stream = match tree.node(id).backup_mode {
            BackupMode::Unmodified => {
                let node = tree.node(id);
                if node.latest_version == INVALID_VERSION || node.latest_version >= self.version {
                    return Err(StowageError::invalid_state(format!(
                        "unmodified object {:?} has no earlier version",
                        tree.mapped_path(id)
                    )));
                }
                plan.unmodified += 1;
                BackupStream::unmodified(node.stream_id, node.latest_version, node.size, id)
            }
            BackupMode::Full | BackupMode::ForceFull => {
                let stream_id = self.issue_stream_id();
                let node = tree.node_mut(id);
                node.stream_id = stream_id;
                BackupStream::full(stream_id, node.size, id)
            }
            BackupMode::Rsync => BackupStream::rsync(tree.node(id).stream_id)?,
            other => {
                return Err(StowageError::invalid_state(format!(
                    "backup mode {:?} on a content object",
                    other
                )))
            }
        };
        trace!(
            "{:?}: {:?} stream {}",
            tree.mapped_path(id),
            tree.node(id).backup_mode,
            stream.id()
        );

        let index = plan.streams.len();
        plan.streams.push(stream);
        if let Some(guid) = tree.node(id).valid_guid() {
            known_guids.insert(guid, index);
        }
        Ok(())
    }

    /// Whether the object needs a stream of its own
    ///
    /// Resets `latest_version`; content objects that may be stored get the
    /// new version number even when they turn out to be GUID duplicates.
    fn should_be_added(&self, tree: &mut ObjectTree, id: NodeId, known_guids: &FastMap<ContentGuid, usize>) -> bool {
        let version = self.version;
        let node = tree.node_mut(id);
        node.latest_version = INVALID_VERSION;
        if node.kind.is_directoryish() || node.backup_mode == BackupMode::NoBackup {
            return false;
        }
        // Link targets are restored inline; hardlinks from their peer's stream.
        if !node.kind.requires_stream() {
            node.stream_id = INVALID_STREAM_ID;
            return false;
        }
        node.latest_version = version;
        match node.valid_guid() {
            Some(guid) => !known_guids.contains_key(&guid),
            None => true,
        }
    }

    /// Attach a GUID duplicate to its canonical holder's stream
    fn fix_up_stream_reference(
        &self,
        tree: &mut ObjectTree,
        id: NodeId,
        known_guids: &FastMap<ContentGuid, usize>,
        plan: &mut BackupPlan,
    ) {
        let node = tree.node(id);
        if node.kind == NodeKind::FileHardlink || node.kind.is_directoryish() {
            return;
        }
        let Some(index) = node.valid_guid().and_then(|guid| known_guids.get(&guid).copied()) else {
            return;
        };
        let stream = &mut plan.streams[index];
        let holder = tree.node(stream.holder());
        let (latest_version, hash) = (holder.latest_version, holder.hash);
        let stream_id = stream.id();
        stream.attach(id);

        let node = tree.node_mut(id);
        node.stream_id = stream_id;
        node.latest_version = latest_version;
        node.hash = hash;
        plan.deduplicated += 1;
        trace!("Object {:?} shares stream {}", tree.mapped_path(id), stream_id);
    }

    /// Compare an object with its counterpart in the previous forest
    ///
    /// On "unchanged", copies the previous hash, stream id and version onto
    /// the node.
    fn file_has_changed(&self, tree: &mut ObjectTree, id: NodeId) -> Result<bool> {
        let Some(previous) = &self.previous else {
            return Ok(true);
        };
        let Some(&old_id) = previous.by_path.get(&path_key(&tree.mapped_path(id))) else {
            return Ok(true);
        };
        let old = previous.tree.node(old_id);
        if old.kind != NodeKind::RegularFile || old.latest_version == INVALID_VERSION || old.stream_id == INVALID_STREAM_ID
        {
            return Ok(true);
        }

        let changed = match self.criterion.resolve(tree.node(id).size) {
            ChangeCriterion::ArchiveFlag => tree.node(id).archive_flag,
            ChangeCriterion::Size => tree.node(id).size != old.size,
            ChangeCriterion::Date => tree.node(id).modified != old.modified,
            ChangeCriterion::Hash => match old.hash {
                None => true,
                Some(old_hash) => match tree.compute_hash(id, self.fs) {
                    Some(hash) => hash != old_hash,
                    None => true,
                },
            },
            ChangeCriterion::HashAuto => {
                return Err(StowageError::invalid_state("change criterion did not resolve"));
            }
        };

        if !changed {
            let node = tree.node_mut(id);
            if old.hash.is_some() {
                node.hash = old.hash;
            }
            node.latest_version = old.latest_version;
            node.stream_id = old.stream_id;
        }
        Ok(changed)
    }
}

impl BackupPlan {
    /// Indices of the streams to store, in physical write order
    ///
    /// Known text extensions first, then by extension, then by size; ties
    /// keep assignment order.
    pub fn storage_order(&self, tree: &ObjectTree) -> Vec<usize> {
        let mut order: Vec<(bool, String, u64, usize)> = self
            .streams
            .iter()
            .enumerate()
            .filter(|(_, stream)| stream.has_data())
            .map(|(index, stream)| {
                let holder = tree.node(stream.holder());
                let extension = extension_of(&holder.name).unwrap_or_default();
                (!is_known_text_extension(&extension), extension, holder.size, index)
            })
            .collect();
        order.sort_by(|a, b| (a.0, &a.1, a.2).cmp(&(b.0, &b.1, b.2)));
        order.into_iter().map(|(.., index)| index).collect()
    }

    /// Number of streams the archive will hold
    pub fn stored_stream_count(&self) -> usize {
        self.streams.iter().filter(|s| s.has_data()).count()
    }

    /// Write the version archive
    ///
    /// Content is read from each `Full` stream's canonical holder; its hash is
    /// recorded on every node sharing the stream before the forest is
    /// serialized.
    #[instrument(skip_all, fields(version = self.version))]
    pub fn write(
        &mut self,
        tree: &mut ObjectTree,
        fs: &dyn FileSystemAccess,
        path: &Path,
        settings: ArchiveSettings,
        crypto: Option<&CryptoContext>,
        creation_time: Timestamp,
        progress: Option<&ProgressCallback>,
    ) -> Result<ArchiveSummary> {
        let order = self.storage_order(tree);
        let total = order.len();
        let mut bytes_processed = 0u64;

        let mut phase = ArchiveWriter::create(path, settings, crypto)?;
        for (done, index) in order.into_iter().enumerate() {
            let stream = &mut self.streams[index];
            let holder_path = tree.mapped_path(stream.holder());
            let (reader, _) = fs.open_for_exclusive_read(&holder_path)?;
            let (digest, size) = phase.add_stream(stream.id(), reader)?;
            stream.set_physical_size(size);
            for object in stream.objects() {
                tree.node_mut(*object).hash = Some(digest);
            }
            bytes_processed += size;
            if let Some(callback) = progress {
                callback(ProgressInfo {
                    operation: "backup",
                    current_item: Some(holder_path.to_string_lossy().into_owned()),
                    processed: done + 1,
                    total: Some(total),
                    bytes_processed,
                });
            }
        }

        let mut phase = phase.finish_streams()?;
        for root in tree.roots() {
            phase.add_entry(&tree.to_serialized(*root))?;
        }

        let mut manifest = VersionManifest::new(self.version, creation_time);
        manifest.first_stream_id = self.first_stream_id;
        manifest.next_stream_id = self.next_stream_id;
        manifest.first_differential_chain_id = self.first_differential_chain_id;
        manifest.next_differential_chain_id = self.next_differential_chain_id;
        manifest.version_dependencies = self.dependencies.iter().copied().collect();
        phase.finish(manifest)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filesystem::{LocalFilesystem, LoggingErrorReporter};
    use crate::rules::{name_rule, IgnoreRules};
    use crate::scan::TreeBuilder;
    use crate::stream::StreamKind;
    use crate::types::NameIgnoreType;
    use std::fs;
    use std::path::PathBuf;
    use tempfile::TempDir;

    fn scan(source: &Path, rules: &IgnoreRules) -> ObjectTree {
        TreeBuilder::new(&LocalFilesystem, rules, &LoggingErrorReporter)
            .build(&[source.to_path_buf()])
            .unwrap()
            .tree
    }

    fn manifest_after(plan: &BackupPlan) -> VersionManifest {
        let mut manifest = VersionManifest::new(plan.version, Timestamp::now());
        manifest.first_stream_id = plan.first_stream_id;
        manifest.next_stream_id = plan.next_stream_id;
        manifest.first_differential_chain_id = plan.first_differential_chain_id;
        manifest.next_differential_chain_id = plan.next_differential_chain_id;
        manifest
    }

    fn node_at<'t>(tree: &'t ObjectTree, path: &Path) -> &'t crate::tree::Node {
        tree.node(tree.find(path).unwrap())
    }

    fn populate(dir: &Path) {
        fs::create_dir_all(dir.join("docs")).unwrap();
        fs::write(dir.join("docs/a.txt"), b"alpha").unwrap();
        fs::write(dir.join("docs/b.png"), b"not really a png").unwrap();
        fs::write(dir.join("c.log"), b"log line").unwrap();
    }

    #[test]
    fn test_initial_pass_issues_ids_in_pre_order() {
        let temp_dir = TempDir::new().unwrap();
        populate(temp_dir.path());
        let mut tree = scan(temp_dir.path(), &IgnoreRules::default());
        let plan = Orchestrator::initial(&LocalFilesystem, ChangeCriterion::Size)
            .generate_streams(&mut tree)
            .unwrap();

        let ids: Vec<StreamId> = tree.iter().map(|id| tree.node(id).stream_id).collect();
        assert_eq!(ids, vec![1, 2, 3, 4]);
        assert_eq!(plan.first_stream_id, FIRST_STREAM_ID);
        assert_eq!(plan.next_stream_id, 5);
        assert_eq!(plan.stored_stream_count(), 3);
        assert!(plan.dependencies.is_empty());

        let docs = node_at(&tree, &temp_dir.path().join("docs"));
        assert_eq!(docs.backup_mode, BackupMode::Directory);
        assert_eq!(docs.latest_version, INVALID_VERSION);
        assert_eq!(node_at(&tree, &temp_dir.path().join("c.log")).latest_version, 0);
    }

    #[test]
    fn test_ignored_objects_get_nothing() {
        let temp_dir = TempDir::new().unwrap();
        populate(temp_dir.path());
        let names = vec![name_rule("*.log", NameIgnoreType::File)];
        let rules = IgnoreRules::new(&names, &Vec::<String>::new(), &Vec::<PathBuf>::new()).unwrap();
        let mut tree = scan(temp_dir.path(), &rules);
        let plan = Orchestrator::initial(&LocalFilesystem, ChangeCriterion::Size)
            .generate_streams(&mut tree)
            .unwrap();

        let log = node_at(&tree, &temp_dir.path().join("c.log"));
        assert_eq!(log.backup_mode, BackupMode::NoBackup);
        assert_eq!(log.stream_id, INVALID_STREAM_ID);
        assert_eq!(log.latest_version, INVALID_VERSION);
        assert_eq!(plan.stored_stream_count(), 2);
    }

    #[test]
    fn test_unchanged_files_become_unmodified() {
        let temp_dir = TempDir::new().unwrap();
        populate(temp_dir.path());
        let mut first = scan(temp_dir.path(), &IgnoreRules::default());
        let first_plan = Orchestrator::initial(&LocalFilesystem, ChangeCriterion::Size)
            .generate_streams(&mut first)
            .unwrap();
        let first_manifest = manifest_after(&first_plan);

        fs::write(temp_dir.path().join("c.log"), b"a longer log line").unwrap();
        let mut second = scan(temp_dir.path(), &IgnoreRules::default());
        let plan = Orchestrator::incremental(&LocalFilesystem, ChangeCriterion::Size, &first, &first_manifest)
            .generate_streams(&mut second)
            .unwrap();

        assert_eq!(plan.version, 1);
        assert_eq!(plan.unmodified, 2);
        assert_eq!(plan.stored_stream_count(), 1);
        assert_eq!(plan.dependencies.iter().copied().collect::<Vec<_>>(), vec![0]);

        let old_a = node_at(&first, &temp_dir.path().join("docs/a.txt"));
        let new_a = node_at(&second, &temp_dir.path().join("docs/a.txt"));
        assert_eq!(new_a.backup_mode, BackupMode::Unmodified);
        assert_eq!(new_a.stream_id, old_a.stream_id);
        assert_eq!(new_a.latest_version, 0);

        let log = node_at(&second, &temp_dir.path().join("c.log"));
        assert_eq!(log.backup_mode, BackupMode::Full);
        assert_eq!(log.latest_version, 1);
        assert!(log.stream_id >= first_manifest.next_stream_id);
    }

    #[test]
    fn test_hash_criterion_uses_content() {
        let temp_dir = TempDir::new().unwrap();
        fs::write(temp_dir.path().join("same.txt"), b"12345").unwrap();
        fs::write(temp_dir.path().join("edit.txt"), b"12345").unwrap();
        let mut first = scan(temp_dir.path(), &IgnoreRules::default());
        let mut first_plan = Orchestrator::initial(&LocalFilesystem, ChangeCriterion::Hash)
            .generate_streams(&mut first)
            .unwrap();
        let archive = temp_dir.path().join("v0.arc");
        let summary = first_plan
            .write(&mut first, &LocalFilesystem, &archive, ArchiveSettings::default(), None, Timestamp::now(), None)
            .unwrap();
        fs::remove_file(&archive).unwrap();

        // Same size, different bytes.
        fs::write(temp_dir.path().join("edit.txt"), b"54321").unwrap();
        let mut second = scan(temp_dir.path(), &IgnoreRules::default());
        let plan = Orchestrator::incremental(&LocalFilesystem, ChangeCriterion::Hash, &first, &summary.manifest)
            .generate_streams(&mut second)
            .unwrap();
        assert_eq!(
            node_at(&second, &temp_dir.path().join("same.txt")).backup_mode,
            BackupMode::Unmodified
        );
        assert_eq!(node_at(&second, &temp_dir.path().join("edit.txt")).backup_mode, BackupMode::Full);
        assert_eq!(plan.stored_stream_count(), 1);
    }

    #[cfg(unix)]
    #[test]
    fn test_first_guid_holder_is_canonical() {
        let temp_dir = TempDir::new().unwrap();
        fs::write(temp_dir.path().join("a_original"), b"shared").unwrap();
        fs::hard_link(temp_dir.path().join("a_original"), temp_dir.path().join("b_peer")).unwrap();
        fs::hard_link(temp_dir.path().join("a_original"), temp_dir.path().join("c_peer")).unwrap();

        let mut tree = scan(temp_dir.path(), &IgnoreRules::default());
        let plan = Orchestrator::initial(&LocalFilesystem, ChangeCriterion::Size)
            .generate_streams(&mut tree)
            .unwrap();

        assert_eq!(plan.stored_stream_count(), 1);
        assert_eq!(plan.deduplicated, 2);
        let stream = &plan.streams[0];
        assert_eq!(tree.node(stream.holder()).name, "a_original");
        assert_eq!(stream.objects().len(), 3);
        let ids: Vec<StreamId> = tree.iter().map(|id| tree.node(id).stream_id).collect();
        assert!(ids.iter().all(|id| *id == stream.id()));
        assert!(tree.iter().all(|id| tree.node(id).latest_version == 0));
    }

    #[cfg(unix)]
    #[test]
    fn test_unreadable_canonical_holder_aborts_write() {
        let temp_dir = TempDir::new().unwrap();
        let source = temp_dir.path().join("src");
        fs::create_dir(&source).unwrap();
        fs::write(source.join("a_original"), b"shared").unwrap();
        fs::hard_link(source.join("a_original"), source.join("b_peer")).unwrap();

        let mut tree = scan(&source, &IgnoreRules::default());
        let mut plan = Orchestrator::initial(&LocalFilesystem, ChangeCriterion::Size)
            .generate_streams(&mut tree)
            .unwrap();
        assert_eq!(tree.node(plan.streams[0].holder()).name, "a_original");

        // The holder vanishes after the pass; its peer is not promoted.
        fs::remove_file(source.join("a_original")).unwrap();
        let archive = temp_dir.path().join("version00000000.arc");
        let result = plan.write(
            &mut tree,
            &LocalFilesystem,
            &archive,
            ArchiveSettings::default(),
            None,
            Timestamp::now(),
            None,
        );
        assert!(result.is_err());
        assert!(!archive.exists());
        assert_eq!(tree.node(plan.streams[0].holder()).name, "a_original");
    }

    #[cfg(unix)]
    #[test]
    fn test_duplicates_of_unmodified_holder_reference_old_version() {
        let temp_dir = TempDir::new().unwrap();
        fs::write(temp_dir.path().join("a"), b"payload").unwrap();
        let mut first = scan(temp_dir.path(), &IgnoreRules::default());
        let first_plan = Orchestrator::initial(&LocalFilesystem, ChangeCriterion::Size)
            .generate_streams(&mut first)
            .unwrap();

        fs::hard_link(temp_dir.path().join("a"), temp_dir.path().join("b")).unwrap();
        let mut second = scan(temp_dir.path(), &IgnoreRules::default());
        let plan = Orchestrator::incremental(&LocalFilesystem, ChangeCriterion::Size, &first, &manifest_after(&first_plan))
            .generate_streams(&mut second)
            .unwrap();

        assert_eq!(plan.stored_stream_count(), 0);
        let b = node_at(&second, &temp_dir.path().join("b"));
        assert_eq!(b.latest_version, 0);
        assert_eq!(b.stream_id, node_at(&first, &temp_dir.path().join("a")).stream_id);
        assert_eq!(plan.dependencies.iter().copied().collect::<Vec<_>>(), vec![0]);
    }

    #[test]
    fn test_rsync_mode_is_unsupported() {
        let temp_dir = TempDir::new().unwrap();
        fs::write(temp_dir.path().join("f"), b"x").unwrap();
        let mut tree = scan(temp_dir.path(), &IgnoreRules::default());
        let root = tree.roots()[0];
        tree.node_mut(root).backup_mode = BackupMode::Rsync;
        let err = Orchestrator::initial(&LocalFilesystem, ChangeCriterion::Size)
            .generate_streams(&mut tree)
            .unwrap_err();
        assert!(matches!(err, StowageError::UnsupportedOperation(_)));
    }

    #[test]
    fn test_storage_order() {
        let temp_dir = TempDir::new().unwrap();
        fs::write(temp_dir.path().join("1.png"), vec![0u8; 10]).unwrap();
        fs::write(temp_dir.path().join("2.txt"), vec![0u8; 30]).unwrap();
        fs::write(temp_dir.path().join("3.txt"), vec![0u8; 20]).unwrap();
        fs::write(temp_dir.path().join("4.bin"), vec![0u8; 5]).unwrap();
        fs::write(temp_dir.path().join("5"), vec![0u8; 1]).unwrap();
        let mut tree = scan(temp_dir.path(), &IgnoreRules::default());
        let plan = Orchestrator::initial(&LocalFilesystem, ChangeCriterion::Size)
            .generate_streams(&mut tree)
            .unwrap();
        let names: Vec<String> = plan
            .storage_order(&tree)
            .into_iter()
            .map(|i| tree.node(plan.streams[i].holder()).name.clone())
            .collect();
        assert_eq!(names, vec!["3.txt", "2.txt", "5", "4.bin", "1.png"]);
    }

    #[test]
    fn test_write_records_hashes_and_sizes() {
        let temp_dir = TempDir::new().unwrap();
        let source = temp_dir.path().join("src");
        populate(&source);
        let mut tree = scan(&source, &IgnoreRules::default());
        let mut plan = Orchestrator::initial(&LocalFilesystem, ChangeCriterion::Size)
            .generate_streams(&mut tree)
            .unwrap();
        let summary = plan
            .write(
                &mut tree,
                &LocalFilesystem,
                &temp_dir.path().join("version00000000.arc"),
                ArchiveSettings::default(),
                None,
                Timestamp::now(),
                None,
            )
            .unwrap();

        assert_eq!(summary.manifest.entry_count, 2);
        assert_eq!(summary.manifest.archive_metadata.stream_ids.len(), 3);
        assert_eq!(summary.manifest.archive_metadata.stored_bytes(), 5 + 16 + 8);
        assert!(plan
            .streams
            .iter()
            .all(|s| s.kind() == StreamKind::Full && s.physical_size() > 0));
        let a = node_at(&tree, &source.join("docs/a.txt"));
        assert_eq!(a.hash, Some(crate::utils::hash_reader(&b"alpha"[..]).unwrap().0));
    }
}
