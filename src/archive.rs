//! Single-file version archive
//!
//! ## Layout
//!
//! ```text
//! [key block]                  only when written with a crypto context
//! [stream payloads]            one codec run; streams concatenated in write order
//! [object forest]              one codec run; one bincode entry per root
//! [version manifest]           one codec run
//! [manifest length: u64 LE]    physical length of the manifest section
//! [SHA-256 of everything above]
//! ```
//!
//! Every byte before the digest, the key block and the length field
//! included, is fed through a streaming hash while it is written. The digest
//! is checked by [`crate::verification`]; the reader itself trusts the
//! layout and reports anything that fails to decode as corruption.
//!
//! ## Writing
//!
//! The writer is a three-phase typestate: [`StreamPhase`] takes content
//! streams, [`BaseObjectPhase`] takes forest entries, and
//! [`BaseObjectPhase::finish`] writes the manifest with the sizes the first
//! two phases produced. The archive is assembled in a temporary file next to
//! its destination and only renamed into place once complete, so a failed or
//! abandoned write leaves nothing behind.
//!
//! ## Reading
//!
//! [`ArchiveReader::read_everything`] replays the stream section once, in
//! write order. Each [`StreamEntry`] borrows the replay; whatever part of an
//! entry is not read is skipped before the next entry is produced.

use crate::codec::{BoundedReader, Codec, CodecReader, CodecWriter, CountingWriter, HashingReader, HashingWriter};
use crate::compression::DEFAULT_CHUNK_SIZE;
use crate::error::{from_codec_io, Result, StowageError};
use crate::keys::{CryptoContext, Section, SessionKeys};
use crate::manifest::{ArchiveMetadata, VersionManifest};
use crate::tree::SerializedNode;
use crate::types::{Sha256Digest, StreamId};
use std::fs::File;
use std::io::{self, BufReader, BufWriter, Read, Seek, SeekFrom, Take, Write};
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use tracing::{debug, trace};

/// Length of the SHA-256 trailer
pub const DIGEST_LEN: u64 = 32;

/// Length of the manifest length field plus the digest
pub const TRAILER_LEN: u64 = 8 + DIGEST_LEN;

/// Codec settings for new archives
#[derive(Debug, Clone, Copy)]
pub struct ArchiveSettings {
    /// Compress payload sections
    pub compression: bool,
    /// Codec chunk size
    pub chunk_size: usize,
}

impl Default for ArchiveSettings {
    fn default() -> Self {
        Self {
            compression: true,
            chunk_size: DEFAULT_CHUNK_SIZE,
        }
    }
}

type Sink = HashingWriter<CountingWriter<BufWriter<NamedTempFile>>>;

fn position(sink: &mut Sink) -> u64 {
    sink.get_mut().count()
}

/// Entry point for writing an archive
pub struct ArchiveWriter;

impl ArchiveWriter {
    /// Start writing an archive that will be committed to `path`
    pub fn create(path: &Path, settings: ArchiveSettings, crypto: Option<&CryptoContext>) -> Result<StreamPhase> {
        let dir = match path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        };
        let temp = NamedTempFile::new_in(&dir)?;
        let mut sink: Sink = HashingWriter::new(CountingWriter::new(BufWriter::new(temp)));

        let keys = match crypto {
            Some(ctx) => {
                let keys = ctx.new_session();
                let written = ctx.write_key_block(&keys, &mut sink)?;
                trace!("Wrote {} byte key block", written);
                Some(keys)
            }
            None => None,
        };

        let codec = Codec::for_section(settings.compression, settings.chunk_size, keys.as_ref(), Section::Streams);
        let section_start = position(&mut sink);
        Ok(StreamPhase {
            path: path.to_path_buf(),
            settings,
            writer: codec.wrap_output(sink),
            keys,
            section_start,
            metadata: ArchiveMetadata::default(),
        })
    }
}

/// First phase: content streams
pub struct StreamPhase {
    path: PathBuf,
    settings: ArchiveSettings,
    writer: CodecWriter<Sink>,
    keys: Option<SessionKeys>,
    section_start: u64,
    metadata: ArchiveMetadata,
}

impl StreamPhase {
    /// Append one stream, returning the content digest and its length
    pub fn add_stream<R: Read>(&mut self, id: StreamId, content: R) -> Result<(Sha256Digest, u64)> {
        let mut reader = HashingReader::new(content);
        io::copy(&mut reader, &mut self.writer)?;
        let (digest, size) = reader.finalize();
        trace!("Stored stream {} ({} bytes)", id, size);
        self.metadata.stream_ids.push(id);
        self.metadata.stream_sizes.push(size);
        Ok((digest, size))
    }

    /// Number of streams written so far
    pub fn stream_count(&self) -> usize {
        self.metadata.stream_ids.len()
    }

    /// Close the stream section and move on to the forest
    pub fn finish_streams(self) -> Result<BaseObjectPhase> {
        let mut sink = self.writer.finish()?;
        let end = position(&mut sink);
        debug!(
            "Stream section: {} streams, {} bytes",
            self.metadata.stream_ids.len(),
            end - self.section_start
        );
        let codec = Codec::for_section(
            self.settings.compression,
            self.settings.chunk_size,
            self.keys.as_ref(),
            Section::BaseObjects,
        );
        Ok(BaseObjectPhase {
            path: self.path,
            settings: self.settings,
            writer: codec.wrap_output(sink),
            keys: self.keys,
            section_start: end,
            metadata: self.metadata,
        })
    }
}

/// Second phase: forest entries
pub struct BaseObjectPhase {
    path: PathBuf,
    settings: ArchiveSettings,
    writer: CodecWriter<Sink>,
    keys: Option<SessionKeys>,
    section_start: u64,
    metadata: ArchiveMetadata,
}

impl BaseObjectPhase {
    /// Append one root entry, returning its serialized size
    pub fn add_entry(&mut self, entry: &SerializedNode) -> Result<u64> {
        let bytes = bincode::serde::encode_to_vec(entry, bincode::config::standard())?;
        self.writer.write_all(&bytes)?;
        self.metadata.entry_sizes.push(bytes.len() as u64);
        Ok(bytes.len() as u64)
    }

    /// Write the manifest and trailer, then commit the archive
    ///
    /// The manifest's `entry_count` and layout fields are filled in here.
    pub fn finish(self, mut manifest: VersionManifest) -> Result<ArchiveSummary> {
        let mut sink = self.writer.finish()?;
        let forest_end = position(&mut sink);
        let mut metadata = self.metadata;
        metadata.entries_size_in_archive = forest_end - self.section_start;
        manifest.entry_count = metadata.entry_sizes.len() as u64;
        manifest.archive_metadata = metadata;
        manifest.validate()?;

        let codec = Codec::for_section(
            self.settings.compression,
            self.settings.chunk_size,
            self.keys.as_ref(),
            Section::Manifest,
        );
        let mut writer = codec.wrap_output(sink);
        writer.write_all(&manifest.to_bytes()?)?;
        let mut sink = writer.finish()?;
        let manifest_length = position(&mut sink) - forest_end;
        sink.write_all(&manifest_length.to_le_bytes())?;

        let (counting, digest) = sink.finalize();
        let size = counting.count() + DIGEST_LEN;
        let mut buffered = counting.into_inner();
        buffered.write_all(&digest.0)?;
        let temp = buffered.into_inner().map_err(|e| e.into_error())?;
        temp.as_file().sync_all()?;
        temp.persist(&self.path).map_err(|e| e.error)?;

        debug!(
            "Committed {:?}: {} bytes, manifest {} bytes",
            self.path, size, manifest_length
        );
        Ok(ArchiveSummary { manifest, digest, size })
    }
}

/// What a committed archive looks like
#[derive(Debug, Clone)]
pub struct ArchiveSummary {
    /// The manifest as written
    pub manifest: VersionManifest,
    /// Trailer digest
    pub digest: Sha256Digest,
    /// File size in bytes
    pub size: u64,
}

/// Decode a forest section split by `entry_sizes`
pub(crate) fn decode_forest(bytes: &[u8], entry_sizes: &[u64]) -> Result<Vec<SerializedNode>> {
    let total: u64 = entry_sizes.iter().sum();
    if total != bytes.len() as u64 {
        return Err(StowageError::corrupt(format!(
            "forest section holds {} bytes, entries declare {}",
            bytes.len(),
            total
        )));
    }
    let mut entries = Vec::with_capacity(entry_sizes.len());
    let mut offset = 0usize;
    for size in entry_sizes {
        let end = offset + *size as usize;
        let (entry, read): (SerializedNode, usize) =
            bincode::serde::decode_from_slice(&bytes[offset..end], bincode::config::standard())
                .map_err(|e| StowageError::corrupt(format!("forest entry does not decode: {}", e)))?;
        if read != *size as usize {
            return Err(StowageError::corrupt("forest entry size mismatch"));
        }
        entries.push(entry);
        offset = end;
    }
    Ok(entries)
}

/// Reader for one archive file
pub struct ArchiveReader {
    path: PathBuf,
    file: File,
    len: u64,
    keys: Option<SessionKeys>,
    data_start: u64,
    manifest_offset: Option<u64>,
    manifest: Option<VersionManifest>,
}

impl ArchiveReader {
    /// Open an archive
    ///
    /// # Errors
    ///
    /// - [`StowageError::NotFound`] if the file does not exist
    /// - [`StowageError::Corrupt`] if the file is too short to hold a trailer
    /// - [`StowageError::Crypto`] if the key block cannot be unwrapped
    pub fn open(path: &Path, crypto: Option<&CryptoContext>) -> Result<Self> {
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

        let (keys, data_start) = match crypto {
            Some(ctx) => {
                let (keys, consumed) = ctx.read_key_block((&mut file).take(len - TRAILER_LEN))?;
                (Some(keys), consumed)
            }
            None => (None, 0),
        };

        Ok(Self {
            path: path.to_path_buf(),
            file,
            len,
            keys,
            data_start,
            manifest_offset: None,
            manifest: None,
        })
    }

    /// Path of the archive
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// File size
    pub fn len(&self) -> u64 {
        self.len
    }

    /// Whether the file is empty; never true for an opened archive
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    fn codec(&self, section: Section) -> Codec {
        Codec::for_section(true, DEFAULT_CHUNK_SIZE, self.keys.as_ref(), section)
    }

    fn read_section(&mut self, offset: u64, len: u64, section: Section) -> Result<Vec<u8>> {
        let codec = self.codec(section);
        self.file.seek(SeekFrom::Start(offset))?;
        let bounded = BoundedReader::new(BufReader::new(&mut self.file), len);
        let mut decoded = Vec::new();
        codec
            .wrap_input(bounded)
            .read_to_end(&mut decoded)
            .map_err(from_codec_io)?;
        Ok(decoded)
    }

    fn manifest_offset(&mut self) -> Result<u64> {
        if let Some(offset) = self.manifest_offset {
            return Ok(offset);
        }
        self.file.seek(SeekFrom::Start(self.len - TRAILER_LEN))?;
        let mut field = [0u8; 8];
        self.file.read_exact(&mut field)?;
        let manifest_len = u64::from_le_bytes(field);
        let available = self.len - TRAILER_LEN - self.data_start;
        if manifest_len == 0 || manifest_len > available {
            return Err(StowageError::corrupt(format!(
                "manifest length {} does not fit in {} bytes",
                manifest_len, available
            )));
        }
        let offset = self.len - TRAILER_LEN - manifest_len;
        self.manifest_offset = Some(offset);
        Ok(offset)
    }

    /// Decode the manifest, cached after the first call
    pub fn read_manifest(&mut self) -> Result<&VersionManifest> {
        if self.manifest.is_none() {
            let offset = self.manifest_offset()?;
            let bytes = self.read_section(offset, self.len - TRAILER_LEN - offset, Section::Manifest)?;
            let manifest = VersionManifest::from_bytes(&bytes)?;
            trace!("Read manifest of version {} from {:?}", manifest.version_number, self.path);
            self.manifest = Some(manifest);
        }
        self.manifest
            .as_ref()
            .ok_or_else(|| StowageError::invalid_state("manifest cache empty after load"))
    }

    /// Offset where the forest section starts
    fn base_offset(&mut self) -> Result<u64> {
        let entries_size = self.read_manifest()?.archive_metadata.entries_size_in_archive;
        let manifest_offset = self.manifest_offset()?;
        manifest_offset
            .checked_sub(entries_size)
            .filter(|offset| *offset >= self.data_start)
            .ok_or_else(|| StowageError::corrupt("forest section overlaps the archive start"))
    }

    /// Decode every root entry of the forest
    pub fn read_base_objects(&mut self) -> Result<Vec<SerializedNode>> {
        let base_offset = self.base_offset()?;
        let metadata = self.read_manifest()?.archive_metadata.clone();
        let bytes = self.read_section(base_offset, metadata.entries_size_in_archive, Section::BaseObjects)?;
        decode_forest(&bytes, &metadata.entry_sizes)
    }

    /// Replay the stream section in write order
    pub fn read_everything(&mut self) -> Result<StreamReplay<'_>> {
        let base_offset = self.base_offset()?;
        let metadata = self.read_manifest()?.archive_metadata.clone();
        let codec = self.codec(Section::Streams);
        let section_len = base_offset - self.data_start;
        self.file.seek(SeekFrom::Start(self.data_start))?;
        let source = BufReader::new(&mut self.file).take(section_len);
        Ok(StreamReplay {
            decoder: codec.wrap_input(source),
            entries: metadata
                .stream_ids
                .into_iter()
                .zip(metadata.stream_sizes)
                .collect::<Vec<_>>()
                .into_iter(),
            remaining: 0,
        })
    }
}

/// Single-pass replay of an archive's streams
pub struct StreamReplay<'a> {
    decoder: CodecReader<Take<BufReader<&'a mut File>>>,
    entries: std::vec::IntoIter<(StreamId, u64)>,
    remaining: u64,
}

impl StreamReplay<'_> {
    /// Streams not yet produced
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether every stream has been produced
    pub fn is_empty(&self) -> bool {
        self.entries.len() == 0
    }

    /// Next stream, after discarding whatever the previous entry left unread
    pub fn next_stream(&mut self) -> Result<Option<StreamEntry<'_>>> {
        if self.remaining > 0 {
            let mut leftover = StreamEntry {
                id: 0,
                size: self.remaining,
                source: &mut self.decoder,
                remaining: &mut self.remaining,
            };
            leftover.skip()?;
        }
        match self.entries.next() {
            None => Ok(None),
            Some((id, size)) => {
                self.remaining = size;
                Ok(Some(StreamEntry {
                    id,
                    size,
                    source: &mut self.decoder,
                    remaining: &mut self.remaining,
                }))
            }
        }
    }
}

/// One stream of a replay, readable up to its declared size
pub struct StreamEntry<'r> {
    id: StreamId,
    size: u64,
    source: &'r mut dyn Read,
    remaining: &'r mut u64,
}

impl StreamEntry<'_> {
    /// Stream id
    pub fn id(&self) -> StreamId {
        self.id
    }

    /// Declared content size
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Discard the rest of this stream
    pub fn skip(&mut self) -> Result<u64> {
        io::copy(self, &mut io::sink()).map_err(from_codec_io)
    }
}

impl Read for StreamEntry<'_> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if *self.remaining == 0 || buf.is_empty() {
            return Ok(0);
        }
        let max = (buf.len() as u64).min(*self.remaining) as usize;
        let n = self.source.read(&mut buf[..max])?;
        if n == 0 {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!("stream {} ended {} bytes early", self.id, *self.remaining),
            ));
        }
        *self.remaining -= n as u64;
        Ok(n)
    }
}
