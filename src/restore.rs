//! Restore engine
//!
//! Reconstructs one version's forest on disk:
//!
//! 1. Load the version and its direct dependencies through a [`VersionGraph`].
//! 2. Delete the existing on-disk state of every root entry, children first.
//!    Objects recorded as ignored (and the directories holding them) are
//!    left alone.
//! 3. Walk the forest in pre-order. Directories and links are created on
//!    the spot; regular files with stored content are deferred.
//! 4. Sort the deferred files by source version and, within one version, by
//!    the physical position of their stream in that version's archive. Each
//!    run of one source version is a work unit.
//! 5. Replay each unit's archive once, front to back. Streams the unit does
//!    not need are skipped; the first object of a stream is written out, and
//!    the objects sharing its stream id become hardlinks to it.
//!
//! A single worker processes units in order on the calling thread. More
//! workers run in a rayon pool and pull units off one shared cursor. Within
//! a unit, consumption is strictly sequential because the codec stream can
//! only be decoded forward.

use crate::archive::{ArchiveReader, StreamEntry};
use crate::codec::HashingReader;
use crate::collections::{FastMap, FastSet};
use crate::error::{from_codec_io, Result, StowageError};
use crate::filesystem::FileSystemAccess;
use crate::keys::CryptoContext;
use crate::target::BackupTarget;
use crate::tree::{BasePath, NodeId, NodeKind, ObjectTree};
use crate::types::{
    BackupMode, ProgressCallback, ProgressInfo, RestoreReport, Sha256Digest, StreamId, Timestamp, VersionNumber,
    INVALID_STREAM_ID,
};
use crate::utils::PutBack;
use crate::version_graph::VersionGraph;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;
use tracing::{debug, info, instrument, trace, warn};

/// A regular file waiting for its content
#[derive(Debug, Clone)]
struct Deferred {
    version: VersionNumber,
    position: usize,
    stream_id: StreamId,
    path: PathBuf,
    modified: Timestamp,
    hash: Option<Sha256Digest>,
}

type Cursor = PutBack<std::vec::IntoIter<Deferred>>;

#[derive(Debug, Default)]
struct ReplayStats {
    files: usize,
    hardlinks: usize,
    bytes: u64,
}

/// Pop the next work unit: every object of the next source version
fn next_unit(cursor: &Mutex<Cursor>) -> Result<Vec<Deferred>> {
    let mut cursor = cursor.lock();
    let Some(first) = cursor.next() else {
        return Ok(Vec::new());
    };
    let version = first.version;
    let mut unit = vec![first];
    while let Some(object) = cursor.next() {
        if object.version != version {
            cursor
                .put_back(object)
                .map_err(|_| StowageError::invalid_state("restore cursor already holds an object"))?;
            break;
        }
        unit.push(object);
    }
    Ok(unit)
}

/// Restores versions of one backup target
pub struct RestoreEngine<'a> {
    target: &'a BackupTarget,
    crypto: Option<&'a CryptoContext>,
    fs: &'a dyn FileSystemAccess,
    workers: usize,
    progress: Option<ProgressCallback>,
}

impl<'a> RestoreEngine<'a> {
    /// Single-threaded engine
    pub fn new(target: &'a BackupTarget, crypto: Option<&'a CryptoContext>, fs: &'a dyn FileSystemAccess) -> Self {
        Self {
            target,
            crypto,
            fs,
            workers: 1,
            progress: None,
        }
    }

    /// Number of work units processed concurrently; 1 stays on the calling thread
    pub fn workers(mut self, workers: usize) -> Self {
        self.workers = workers.max(1);
        self
    }

    /// Report each restored file
    pub fn progress(mut self, progress: Option<ProgressCallback>) -> Self {
        self.progress = progress;
        self
    }

    /// Restore `version`, optionally re-rooting every root entry under `destination`
    ///
    /// Negative versions count back from the newest one.
    ///
    /// # Errors
    ///
    /// - [`StowageError::NotFound`] if the version or a dependency is missing
    /// - [`StowageError::Corrupt`] if an archive is damaged or a stream never appears
    /// - [`StowageError::UnsupportedOperation`] for link kinds the filesystem cannot create
    #[instrument(skip(self), fields(workers = self.workers))]
    pub fn restore(&self, version: VersionNumber, destination: Option<&Path>) -> Result<RestoreReport> {
        let start = Instant::now();
        let version = self.target.resolve_version(version)?;
        info!("Restoring version {}", version);

        let mut graph = VersionGraph::new(self.target, self.crypto);
        let needed = graph.load(version)?;

        let mut tree = ObjectTree::new();
        for entry in graph.forest(version)? {
            tree.graft_root(entry);
        }
        if let Some(destination) = destination {
            self.fs.create_directory(destination)?;
            for root in tree.roots().to_vec() {
                let node = tree.node(root);
                let unmapped = node
                    .base_path
                    .as_ref()
                    .map(|bp| bp.unmapped.clone())
                    .unwrap_or_else(|| PathBuf::from(&node.name));
                let mapped = destination.join(&node.name);
                tree.set_base_path(root, BasePath { mapped, unmapped });
            }
        }

        self.clear_existing(&tree)?;

        let mut report = RestoreReport {
            version,
            ..Default::default()
        };
        let deferred = self.restore_inline(&tree, &mut report)?;
        let deferred = Self::schedule(deferred, &needed, &mut graph)?;
        let total = deferred.len();

        let mut archives = BTreeMap::new();
        for object in &deferred {
            if archives.contains_key(&object.version) {
                continue;
            }
            archives.insert(object.version, graph.take_archive(object.version)?);
        }
        let units = archives.len();
        report.archives_opened = graph.opened().to_vec();
        report.archives_opened.sort_unstable();

        let cursor = Mutex::new(PutBack::new(deferred.into_iter()));
        let archives = Mutex::new(archives);
        let stats = Mutex::new(ReplayStats::default());
        let workers = self.workers.min(units.max(1));
        if workers <= 1 {
            self.drain(&cursor, &archives, &stats, &AtomicBool::new(false), total)?;
        } else {
            self.drain_parallel(workers, &cursor, &archives, &stats, total)?;
        }

        let stats = stats.into_inner();
        report.files_restored = stats.files;
        report.hardlinks_created = stats.hardlinks;
        report.bytes_written = stats.bytes;
        report.duration_ms = start.elapsed().as_millis() as u64;
        info!("Restored {}", report);
        Ok(report)
    }

    /// Delete on-disk state of every root entry, children first
    fn clear_existing(&self, tree: &ObjectTree) -> Result<()> {
        let mut preserve: FastSet<NodeId> = FastSet::default();
        for root in tree.roots() {
            for id in tree.post_order(*root) {
                let node = tree.node(id);
                if node.backup_mode == BackupMode::NoBackup || preserve.contains(&id) {
                    if let Some(parent) = node.parent() {
                        preserve.insert(parent);
                    }
                    continue;
                }
                self.fs.delete_path(&tree.mapped_path(id))?;
            }
        }
        Ok(())
    }

    /// Create directories and links; collect regular files with stored content
    fn restore_inline(&self, tree: &ObjectTree, report: &mut RestoreReport) -> Result<Vec<Deferred>> {
        let mut deferred = Vec::new();
        for root in tree.roots() {
            if let Some(parent) = tree.mapped_path(*root).parent() {
                if !parent.as_os_str().is_empty() {
                    self.fs.create_directory(parent)?;
                }
            }
            for id in tree.pre_order(*root) {
                let node = tree.node(id);
                if node.backup_mode == BackupMode::NoBackup {
                    continue;
                }
                let path = tree.mapped_path(id);
                match node.kind {
                    NodeKind::Directory => {
                        self.fs.create_directory(&path)?;
                        report.objects_restored += 1;
                    }
                    NodeKind::DirectorySymlink
                    | NodeKind::FileSymlink
                    | NodeKind::Junction
                    | NodeKind::FileReparsePoint => {
                        let target = node
                            .link_target
                            .as_deref()
                            .ok_or_else(|| StowageError::corrupt(format!("link {:?} has no target", path)))?;
                        match node.kind {
                            NodeKind::DirectorySymlink => self.fs.create_symlink(target, &path, true)?,
                            NodeKind::FileSymlink => self.fs.create_symlink(target, &path, false)?,
                            NodeKind::Junction => self.fs.create_junction(target, &path)?,
                            _ => self.fs.create_reparse_point(target, &path)?,
                        }
                        trace!("Restored {} {:?}", node.kind, path);
                        report.objects_restored += 1;
                    }
                    NodeKind::FileHardlink => {
                        warn!("Hardlink object {:?} carries no content; not restored", path);
                    }
                    NodeKind::RegularFile if node.latest_version >= 0 && node.stream_id != INVALID_STREAM_ID => {
                        deferred.push(Deferred {
                            version: node.latest_version,
                            position: 0,
                            stream_id: node.stream_id,
                            path,
                            modified: node.modified,
                            hash: node.hash,
                        });
                    }
                    NodeKind::RegularFile => {
                        let mut out = self.fs.create_file(&path)?;
                        out.flush()?;
                        drop(out);
                        self.fs.set_modification_time(&path, node.modified)?;
                        report.objects_restored += 1;
                    }
                }
            }
        }
        debug!(
            "Restored {} objects inline, {} files deferred",
            report.objects_restored,
            deferred.len()
        );
        Ok(deferred)
    }

    /// Order deferred files by source version, then by physical stream position
    fn schedule(
        mut deferred: Vec<Deferred>,
        needed: &[VersionNumber],
        graph: &mut VersionGraph<'_>,
    ) -> Result<Vec<Deferred>> {
        let mut positions: BTreeMap<VersionNumber, FastMap<StreamId, usize>> = BTreeMap::new();
        for object in &mut deferred {
            if needed.binary_search(&object.version).is_err() {
                return Err(StowageError::corrupt(format!(
                    "{:?} refers to version {}, which is not a recorded dependency",
                    object.path, object.version
                )));
            }
            if !positions.contains_key(&object.version) {
                let map = graph.manifest(object.version)?.archive_metadata.physical_positions();
                positions.insert(object.version, map);
            }
            object.position = positions
                .get(&object.version)
                .and_then(|map| map.get(&object.stream_id))
                .copied()
                .ok_or_else(|| {
                    StowageError::corrupt(format!(
                        "stream {} for {:?} is not stored in version {}",
                        object.stream_id, object.path, object.version
                    ))
                })?;
        }
        // Stable: objects sharing a stream keep their pre-order.
        deferred.sort_by_key(|o| (o.version, o.position, o.stream_id));
        Ok(deferred)
    }

    fn drain_parallel(
        &self,
        workers: usize,
        cursor: &Mutex<Cursor>,
        archives: &Mutex<BTreeMap<VersionNumber, ArchiveReader>>,
        stats: &Mutex<ReplayStats>,
        total: usize,
    ) -> Result<()> {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(workers)
            .thread_name(|i| format!("stowage-restore-{}", i))
            .build()
            .map_err(|e| StowageError::ThreadPool(e.to_string()))?;
        let failed = AtomicBool::new(false);
        let errors = Mutex::new(Vec::new());
        debug!("Restoring with {} workers", workers);
        pool.scope(|scope| {
            for _ in 0..workers {
                scope.spawn(|_| {
                    if let Err(e) = self.drain(cursor, archives, stats, &failed, total) {
                        failed.store(true, Ordering::Relaxed);
                        errors.lock().push(e);
                    }
                });
            }
        });
        match errors.into_inner().into_iter().next() {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Process work units until the cursor is empty or another worker failed
    fn drain(
        &self,
        cursor: &Mutex<Cursor>,
        archives: &Mutex<BTreeMap<VersionNumber, ArchiveReader>>,
        stats: &Mutex<ReplayStats>,
        failed: &AtomicBool,
        total: usize,
    ) -> Result<()> {
        while !failed.load(Ordering::Relaxed) {
            let unit = next_unit(cursor)?;
            let Some(version) = unit.first().map(|o| o.version) else {
                return Ok(());
            };
            let mut reader = archives
                .lock()
                .remove(&version)
                .ok_or_else(|| StowageError::invalid_state(format!("no archive reader for version {}", version)))?;
            self.replay_unit(version, &unit, &mut reader, stats, total)?;
        }
        Ok(())
    }

    fn replay_unit(
        &self,
        version: VersionNumber,
        unit: &[Deferred],
        reader: &mut ArchiveReader,
        stats: &Mutex<ReplayStats>,
        total: usize,
    ) -> Result<()> {
        debug!("Replaying {} objects from version {}", unit.len(), version);
        let mut replay = reader.read_everything()?;
        let mut cursor = 0;
        while cursor < unit.len() {
            let expected = &unit[cursor];
            let Some(mut entry) = replay.next_stream()? else {
                return Err(StowageError::corrupt(format!(
                    "stream {} for {:?} never appeared in version {}",
                    expected.stream_id, expected.path, version
                )));
            };
            if entry.id() != expected.stream_id {
                trace!("Skipping stream {} ({} bytes)", entry.id(), entry.size());
                entry.skip()?;
                continue;
            }

            let written = self.materialize(expected, &mut entry)?;
            cursor += 1;
            let mut peers = 0;
            while let Some(peer) = unit.get(cursor).filter(|p| p.stream_id == expected.stream_id) {
                self.fs.create_hardlink(&expected.path, &peer.path)?;
                trace!("Linked {:?} to {:?}", peer.path, expected.path);
                peers += 1;
                cursor += 1;
            }

            let processed = {
                let mut stats = stats.lock();
                stats.files += 1;
                stats.hardlinks += peers;
                stats.bytes += written;
                stats.files + stats.hardlinks
            };
            if let Some(callback) = &self.progress {
                callback(ProgressInfo {
                    operation: "restore",
                    current_item: Some(expected.path.to_string_lossy().into_owned()),
                    processed,
                    total: Some(total),
                    bytes_processed: written,
                });
            }
        }
        Ok(())
    }

    /// Write one stream to its first object and check its hash
    fn materialize(&self, object: &Deferred, content: &mut StreamEntry<'_>) -> Result<u64> {
        let mut hashing = HashingReader::new(content);
        let mut out = self.fs.create_file(&object.path)?;
        let written = io::copy(&mut hashing, &mut out).map_err(from_codec_io)?;
        out.flush()?;
        drop(out);

        let (digest, _) = hashing.finalize();
        if let Some(expected) = object.hash {
            if expected != digest {
                return Err(StowageError::corrupt(format!(
                    "content of {:?} does not match its recorded hash",
                    object.path
                )));
            }
        }
        self.fs.set_modification_time(&object.path, object.modified)?;
        trace!("Restored {:?} ({} bytes)", object.path, written);
        Ok(written)
    }
}
