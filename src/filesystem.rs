//! Filesystem access layer and error reporting
//!
//! The backup and restore engines never call `std::fs` directly. They go
//! through [`FileSystemAccess`], which covers everything the engines need:
//! attribute reads, child enumeration, exclusive reads, creation of every
//! object kind, and deletion. [`LocalFilesystem`] is the implementation for
//! the machine the process runs on.
//!
//! Per-object failures while building a tree are not fatal by themselves.
//! They are handed to an [`ErrorReporter`], which decides whether the
//! operation skips the object or aborts.

use crate::error::{Result, StowageError};
use crate::tree::NodeKind;
use crate::types::{ContentGuid, Timestamp};
use crate::utils::remove_path;
use std::fs::{self, File};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use tracing::{error, trace, warn};
use walkdir::WalkDir;

/// Attributes of one filesystem object
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectMetadata {
    /// Object kind
    pub kind: NodeKind,
    /// Content size (0 for directories and links)
    pub size: u64,
    /// Last modification time
    pub modified: Timestamp,
    /// OS archive attribute
    pub archive_flag: bool,
    /// Target of a link-like object
    pub link_target: Option<PathBuf>,
    /// Content identity shared by hardlinked names
    pub content_guid: Option<ContentGuid>,
}

/// Everything the engines need from a filesystem
pub trait FileSystemAccess: Send + Sync {
    /// Read the attributes of `path` without following links
    fn metadata(&self, path: &Path) -> Result<ObjectMetadata>;

    /// Children of a directory, ordered by file name
    fn list_children(&self, dir: &Path) -> Result<Vec<PathBuf>>;

    /// Open a file for reading, returning the reader and its size
    fn open_for_exclusive_read(&self, path: &Path) -> Result<(Box<dyn Read + Send>, u64)>;

    /// Create a directory and any missing parents
    fn create_directory(&self, path: &Path) -> Result<()>;

    /// Create (or truncate) a regular file for writing
    fn create_file(&self, path: &Path) -> Result<Box<dyn Write + Send>>;

    /// Create a symbolic link at `link` pointing at `target`
    fn create_symlink(&self, target: &Path, link: &Path, directory: bool) -> Result<()>;

    /// Create a directory junction
    fn create_junction(&self, target: &Path, link: &Path) -> Result<()>;

    /// Create a generic reparse point
    fn create_reparse_point(&self, target: &Path, link: &Path) -> Result<()>;

    /// Create a hardlink at `link` to the existing file `existing`
    fn create_hardlink(&self, existing: &Path, link: &Path) -> Result<()>;

    /// Set the modification time of a regular file
    fn set_modification_time(&self, path: &Path, time: Timestamp) -> Result<()>;

    /// Remove a file, link or directory tree; missing paths are fine
    fn delete_path(&self, path: &Path) -> Result<()>;
}

/// [`FileSystemAccess`] backed by the local filesystem
#[derive(Debug, Clone, Copy, Default)]
pub struct LocalFilesystem;

impl LocalFilesystem {
    /// Create a local filesystem accessor
    pub fn new() -> Self {
        Self
    }
}

fn attributes_error(path: &Path, source: io::Error) -> StowageError {
    StowageError::Attributes {
        path: path.to_path_buf(),
        source,
    }
}

fn ensure_parent(path: &Path) -> io::Result<()> {
    match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => fs::create_dir_all(parent),
        _ => Ok(()),
    }
}

#[cfg(unix)]
fn content_guid(metadata: &fs::Metadata) -> Option<ContentGuid> {
    use std::os::unix::fs::MetadataExt;
    Some(ContentGuid::from_parts(metadata.dev(), metadata.ino()))
}

#[cfg(not(unix))]
fn content_guid(_metadata: &fs::Metadata) -> Option<ContentGuid> {
    None
}

#[cfg(windows)]
fn archive_flag(metadata: &fs::Metadata) -> bool {
    use std::os::windows::fs::MetadataExt;
    const FILE_ATTRIBUTE_ARCHIVE: u32 = 0x20;
    metadata.file_attributes() & FILE_ATTRIBUTE_ARCHIVE != 0
}

// No archive attribute exists; report every file as due for backup.
#[cfg(not(windows))]
fn archive_flag(_metadata: &fs::Metadata) -> bool {
    true
}

impl FileSystemAccess for LocalFilesystem {
    fn metadata(&self, path: &Path) -> Result<ObjectMetadata> {
        let metadata = fs::symlink_metadata(path).map_err(|e| attributes_error(path, e))?;
        let file_type = metadata.file_type();
        let modified = metadata
            .modified()
            .map(Timestamp::from)
            .map_err(|e| attributes_error(path, e))?;

        let (kind, size, link_target, guid) = if file_type.is_symlink() {
            let target = fs::read_link(path).map_err(|e| attributes_error(path, e))?;
            // Dangling links are recorded as file links.
            let points_to_dir = fs::metadata(path).map(|m| m.is_dir()).unwrap_or(false);
            let kind = if points_to_dir {
                NodeKind::DirectorySymlink
            } else {
                NodeKind::FileSymlink
            };
            (kind, 0, Some(target), None)
        } else if file_type.is_dir() {
            (NodeKind::Directory, 0, None, None)
        } else if file_type.is_file() {
            (NodeKind::RegularFile, metadata.len(), None, content_guid(&metadata))
        } else {
            return Err(attributes_error(
                path,
                io::Error::other("unsupported file type (device, fifo or socket)"),
            ));
        };

        Ok(ObjectMetadata {
            kind,
            size,
            modified,
            archive_flag: archive_flag(&metadata),
            link_target,
            content_guid: guid,
        })
    }

    fn list_children(&self, dir: &Path) -> Result<Vec<PathBuf>> {
        let mut children = Vec::new();
        for entry in WalkDir::new(dir)
            .min_depth(1)
            .max_depth(1)
            .follow_links(false)
            .sort_by_file_name()
        {
            children.push(entry?.into_path());
        }
        Ok(children)
    }

    fn open_for_exclusive_read(&self, path: &Path) -> Result<(Box<dyn Read + Send>, u64)> {
        let file = File::open(path)?;
        let size = file.metadata()?.len();
        Ok((Box::new(BufReader::new(file)), size))
    }

    fn create_directory(&self, path: &Path) -> Result<()> {
        fs::create_dir_all(path)?;
        Ok(())
    }

    fn create_file(&self, path: &Path) -> Result<Box<dyn Write + Send>> {
        ensure_parent(path)?;
        Ok(Box::new(BufWriter::new(File::create(path)?)))
    }

    #[cfg_attr(unix, allow(unused_variables))]
    fn create_symlink(&self, target: &Path, link: &Path, directory: bool) -> Result<()> {
        ensure_parent(link)?;
        // Unix symlinks do not distinguish file and directory targets.
        #[cfg(unix)]
        std::os::unix::fs::symlink(target, link)?;
        #[cfg(windows)]
        {
            if directory {
                std::os::windows::fs::symlink_dir(target, link)?;
            } else {
                std::os::windows::fs::symlink_file(target, link)?;
            }
        }
        trace!("Linked {:?} -> {:?}", link, target);
        Ok(())
    }

    fn create_junction(&self, target: &Path, link: &Path) -> Result<()> {
        self.create_symlink(target, link, true)
    }

    fn create_reparse_point(&self, _target: &Path, link: &Path) -> Result<()> {
        Err(StowageError::unsupported(format!(
            "restoring generic reparse point {:?}",
            link
        )))
    }

    fn create_hardlink(&self, existing: &Path, link: &Path) -> Result<()> {
        ensure_parent(link)?;
        remove_path(link)?;
        fs::hard_link(existing, link)?;
        Ok(())
    }

    fn set_modification_time(&self, path: &Path, time: Timestamp) -> Result<()> {
        let mtime = filetime::FileTime::from_system_time(time.to_system_time());
        filetime::set_file_mtime(path, mtime)?;
        Ok(())
    }

    fn delete_path(&self, path: &Path) -> Result<()> {
        remove_path(path)?;
        Ok(())
    }
}

/// Decision returned by an [`ErrorReporter`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorAction {
    /// Skip the failing object and keep going
    Continue,
    /// Abort the whole operation
    Abort,
}

/// Pluggable policy for per-object errors
pub trait ErrorReporter: Send + Sync {
    /// Report `error`, raised while doing `context`
    fn report(&self, error: &StowageError, context: &str) -> ErrorAction;
}

/// Logs every error and continues
#[derive(Debug, Clone, Copy, Default)]
pub struct LoggingErrorReporter;

impl ErrorReporter for LoggingErrorReporter {
    fn report(&self, error: &StowageError, context: &str) -> ErrorAction {
        warn!("Error while {}: {}", context, error);
        ErrorAction::Continue
    }
}

/// Aborts on the first error
#[derive(Debug, Clone, Copy, Default)]
pub struct StrictErrorReporter;

impl ErrorReporter for StrictErrorReporter {
    fn report(&self, error: &StowageError, context: &str) -> ErrorAction {
        error!("Error while {}: {}", context, error);
        ErrorAction::Abort
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_metadata_kinds() {
        let temp_dir = TempDir::new().unwrap();
        let fs_access = LocalFilesystem::new();
        let file = temp_dir.path().join("a.txt");
        fs::write(&file, b"hello").unwrap();

        let meta = fs_access.metadata(&file).unwrap();
        assert_eq!(meta.kind, NodeKind::RegularFile);
        assert_eq!(meta.size, 5);
        let dir_meta = fs_access.metadata(temp_dir.path()).unwrap();
        assert_eq!(dir_meta.kind, NodeKind::Directory);
        assert_eq!(dir_meta.size, 0);
    }

    #[test]
    fn test_missing_path_is_attribute_error() {
        let temp_dir = TempDir::new().unwrap();
        let err = LocalFilesystem.metadata(&temp_dir.path().join("nope")).unwrap_err();
        assert!(matches!(err, StowageError::Attributes { .. }));
    }

    #[test]
    fn test_list_children_sorted() {
        let temp_dir = TempDir::new().unwrap();
        for name in ["c", "a", "b"] {
            fs::write(temp_dir.path().join(name), name).unwrap();
        }
        fs::create_dir(temp_dir.path().join("d")).unwrap();
        fs::write(temp_dir.path().join("d/nested"), b"x").unwrap();
        let children = LocalFilesystem.list_children(temp_dir.path()).unwrap();
        let names: Vec<_> = children
            .iter()
            .map(|p| p.file_name().unwrap().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec!["a", "b", "c", "d"]);
    }

    #[cfg(unix)]
    #[test]
    fn test_hardlinks_share_guid_and_symlinks_are_links() {
        let temp_dir = TempDir::new().unwrap();
        let original = temp_dir.path().join("orig");
        let peer = temp_dir.path().join("peer");
        let link = temp_dir.path().join("link");
        fs::write(&original, b"data").unwrap();
        fs::hard_link(&original, &peer).unwrap();
        std::os::unix::fs::symlink(&original, &link).unwrap();

        let a = LocalFilesystem.metadata(&original).unwrap();
        let b = LocalFilesystem.metadata(&peer).unwrap();
        assert!(a.content_guid.unwrap().is_valid());
        assert_eq!(a.content_guid, b.content_guid);

        let l = LocalFilesystem.metadata(&link).unwrap();
        assert_eq!(l.kind, NodeKind::FileSymlink);
        assert_eq!(l.link_target.as_deref(), Some(original.as_path()));
    }

    #[test]
    fn test_create_and_delete() {
        let temp_dir = TempDir::new().unwrap();
        let fs_access = LocalFilesystem;
        let file = temp_dir.path().join("x/y/z.bin");
        {
            let mut writer = fs_access.create_file(&file).unwrap();
            writer.write_all(b"abc").unwrap();
            writer.flush().unwrap();
        }
        let when = Timestamp(1_600_000_000_000_000_000);
        fs_access.set_modification_time(&file, when).unwrap();
        assert_eq!(fs_access.metadata(&file).unwrap().modified, when);

        let peer = temp_dir.path().join("peer.bin");
        fs_access.create_hardlink(&file, &peer).unwrap();
        assert_eq!(fs::read(&peer).unwrap(), b"abc");

        fs_access.delete_path(&temp_dir.path().join("x")).unwrap();
        assert!(!file.exists());
        assert!(fs_access
            .create_reparse_point(&peer, &temp_dir.path().join("rp"))
            .is_err());
    }

    #[cfg(unix)]
    #[test]
    fn test_directory_symlink_on_unix() {
        let temp_dir = TempDir::new().unwrap();
        let fs_access = LocalFilesystem;
        let dir = temp_dir.path().join("real");
        fs::create_dir(&dir).unwrap();
        fs::write(dir.join("inner.txt"), b"x").unwrap();

        let link = temp_dir.path().join("alias");
        fs_access.create_symlink(&dir, &link, true).unwrap();
        let meta = fs_access.metadata(&link).unwrap();
        assert_eq!(meta.link_target.as_deref(), Some(dir.as_path()));
        assert_eq!(fs::read(link.join("inner.txt")).unwrap(), b"x");
    }

    #[test]
    fn test_reporters() {
        let err = StowageError::not_found("x");
        assert_eq!(LoggingErrorReporter.report(&err, "testing"), ErrorAction::Continue);
        assert_eq!(StrictErrorReporter.report(&err, "testing"), ErrorAction::Abort);
    }
}
