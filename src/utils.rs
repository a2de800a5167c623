//! Utility functions for Stowage
//!
//! Small helpers shared across the crate: case-insensitive path handling,
//! extension classification for stream ordering, content hashing, atomic
//! file commits and human-readable formatting.

use crate::error::Result;
use crate::types::Sha256Digest;
use sha2::{Digest, Sha256};
use std::ffi::OsStr;
use std::fs;
use std::io::{self, Read, Write};
use std::path::{Component, Path};

/// Extensions treated as text when ordering streams for compression locality
const KNOWN_TEXT_EXTENSIONS: &[&str] = &[
    "asm", "bat", "c", "cpp", "f", "gcl", "gitignore", "gitmodules", "h", "hpp", "hs", "htm",
    "html", "java", "js", "log", "lua", "pas", "py", "qbk", "s", "sh", "ss", "txt", "xml",
];

/// Lowercase extension of a file name, without the leading dot
///
/// Dotfiles such as `.gitignore` report the part after the dot, matching how
/// the text-extension table lists them.
pub fn extension_of(name: &str) -> Option<String> {
    let idx = name.rfind('.')?;
    let ext = &name[idx + 1..];
    if ext.is_empty() {
        None
    } else {
        Some(ext.to_lowercase())
    }
}

/// Whether `ext` (lowercase, no dot) is a known text extension
pub fn is_known_text_extension(ext: &str) -> bool {
    KNOWN_TEXT_EXTENSIONS.binary_search(&ext).is_ok()
}

fn component_key(component: &OsStr) -> String {
    component.to_string_lossy().to_lowercase()
}

/// Normalized, case-insensitive lookup key for a path
///
/// Components are lowercased and joined with `/`; `.` components are dropped.
pub fn path_key(path: &Path) -> String {
    let mut key = String::new();
    for component in path.components() {
        let part = match component {
            Component::CurDir => continue,
            Component::RootDir => {
                key.push('/');
                continue;
            }
            Component::Prefix(p) => component_key(p.as_os_str()),
            Component::ParentDir => "..".to_string(),
            Component::Normal(name) => component_key(name),
        };
        if !key.is_empty() && !key.ends_with('/') {
            key.push('/');
        }
        key.push_str(&part);
    }
    key
}

/// Case-insensitive, component-wise path equality
pub fn paths_equal(a: &Path, b: &Path) -> bool {
    path_key(a) == path_key(b)
}

/// Whether `dir` contains `file`
///
/// True when the directory chain of `file` (its path minus the final
/// component) starts with every component of `dir`, compared
/// case-insensitively.
pub fn path_contains_path(dir: &Path, file: &Path) -> bool {
    let Some(parent) = file.parent() else {
        return false;
    };
    let dir: Vec<String> = dir
        .components()
        .filter(|c| !matches!(c, Component::CurDir))
        .map(|c| component_key(c.as_os_str()))
        .collect();
    let parent: Vec<String> = parent
        .components()
        .filter(|c| !matches!(c, Component::CurDir))
        .map(|c| component_key(c.as_os_str()))
        .collect();
    dir.len() <= parent.len() && dir.iter().zip(parent.iter()).all(|(a, b)| a == b)
}

/// Stream a reader through SHA-256, returning the digest and the byte count
pub fn hash_reader<R: Read>(mut reader: R) -> io::Result<(Sha256Digest, u64)> {
    let mut hasher = Sha256::new();
    let mut buffer = vec![0u8; 64 * 1024];
    let mut total = 0u64;
    loop {
        let n = reader.read(&mut buffer)?;
        if n == 0 {
            break;
        }
        hasher.update(&buffer[..n]);
        total += n as u64;
    }
    Ok((Sha256Digest(hasher.finalize().into()), total))
}

/// Atomic file write (temp file in the same directory, then rename)
///
/// The target is either the complete new content or untouched.
pub fn atomic_write(path: &Path, content: &[u8]) -> Result<()> {
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    let mut temp = tempfile::NamedTempFile::new_in(dir)?;
    temp.write_all(content)?;
    temp.as_file().sync_all()?;
    temp.persist(path).map_err(|e| e.error)?;
    Ok(())
}

/// Remove a file, symlink or directory tree if it exists
pub fn remove_path(path: &Path) -> io::Result<()> {
    let metadata = match fs::symlink_metadata(path) {
        Ok(m) => m,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(e),
    };
    if metadata.is_dir() {
        fs::remove_dir_all(path)
    } else {
        fs::remove_file(path)
    }
}

/// Format bytes as human-readable string
///
/// ```rust
/// use stowage::utils::format_bytes;
///
/// assert_eq!(format_bytes(1023), "1023 B");
/// assert_eq!(format_bytes(1536), "1.50 KB");
/// ```
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: &[&str] = &["B", "KB", "MB", "GB", "TB", "PB"];
    let mut size = bytes as f64;
    let mut unit_idx = 0;

    while size >= 1024.0 && unit_idx < UNITS.len() - 1 {
        size /= 1024.0;
        unit_idx += 1;
    }

    if unit_idx == 0 {
        format!("{} {}", bytes, UNITS[0])
    } else {
        format!("{:.2} {}", size, UNITS[unit_idx])
    }
}

/// Iterator adapter that can un-consume exactly one item
///
/// Used where a consumer has to look at the next item before deciding
/// whether it belongs to the current batch. Putting back a second item
/// before the first was re-read is a logic error and is rejected.
pub struct PutBack<I: Iterator> {
    inner: I,
    slot: Option<I::Item>,
}

impl<I: Iterator> PutBack<I> {
    /// Wrap an iterator
    pub fn new(inner: I) -> Self {
        Self { inner, slot: None }
    }

    /// Return `item` to the front of the sequence
    ///
    /// Hands the item back as `Err` if the slot is already occupied.
    pub fn put_back(&mut self, item: I::Item) -> std::result::Result<(), I::Item> {
        if self.slot.is_some() {
            return Err(item);
        }
        self.slot = Some(item);
        Ok(())
    }
}

impl<I: Iterator> Iterator for PutBack<I> {
    type Item = I::Item;

    fn next(&mut self) -> Option<Self::Item> {
        self.slot.take().or_else(|| self.inner.next())
    }
}
