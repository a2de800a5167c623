//! Chunked LZ4 compression for archive sections
//!
//! Section payloads are written through [`CompressedWriter`], which cuts the
//! plaintext into fixed-size chunks and stores each one as a small frame:
//!
//! ```text
//! [flag: u8][payload_len: u32 LE][payload]
//! ```
//!
//! - flag `1`: payload is an LZ4 block with its uncompressed size prepended
//!   (`lz4_flex::compress_prepend_size`)
//! - flag `0`: payload is stored raw because compression would not shrink it
//!
//! [`CompressedReader`] reverses this as a plain forward-only `Read`, which is
//! what the archive reader needs: sections are decoded strictly in write
//! order and never seeked into.
//!
//! ## Examples
//!
//! ```rust
//! use stowage::compression::{CompressedReader, CompressedWriter};
//! use std::io::{Read, Write};
//!
//! let mut writer = CompressedWriter::new(Vec::new(), 1024, true);
//! writer.write_all(&[b'a'; 10_000]).unwrap();
//! let (encoded, stats) = writer.finish().unwrap();
//! assert!(stats.bytes_saved > 0);
//!
//! let mut decoded = Vec::new();
//! CompressedReader::new(&encoded[..]).read_to_end(&mut decoded).unwrap();
//! assert_eq!(decoded, vec![b'a'; 10_000]);
//! ```

use lz4_flex::{compress_prepend_size, decompress_size_prepended};
use std::io::{self, Read, Write};
use std::time::Instant;
use tracing::trace;

/// Default plaintext chunk size
pub const DEFAULT_CHUNK_SIZE: usize = 64 * 1024;

/// Largest chunk a reader accepts; anything bigger is treated as corruption
const MAX_CHUNK_SIZE: usize = 64 * 1024 * 1024;

const FLAG_RAW: u8 = 0;
const FLAG_LZ4: u8 = 1;

/// Statistics about compression performance
#[derive(Debug, Clone, Default)]
pub struct CompressionStats {
    /// Number of chunks stored compressed
    pub chunks_compressed: usize,
    /// Number of chunks stored raw
    pub chunks_stored_raw: usize,
    /// Plaintext bytes consumed
    pub bytes_in: u64,
    /// Bytes emitted including frame headers
    pub bytes_out: u64,
    /// Total bytes saved by compression
    pub bytes_saved: u64,
    /// Total compression time in milliseconds
    pub compression_time_ms: u64,
}

impl CompressionStats {
    /// Output size relative to input size (1.0 = no gain)
    pub fn ratio(&self) -> f64 {
        if self.bytes_in == 0 {
            1.0
        } else {
            self.bytes_out as f64 / self.bytes_in as f64
        }
    }
}

/// Streaming writer that compresses data in chunks
pub struct CompressedWriter<W: Write> {
    writer: W,
    buffer: Vec<u8>,
    chunk_size: usize,
    enabled: bool,
    stats: CompressionStats,
    started: Instant,
}

impl<W: Write> CompressedWriter<W> {
    /// Create a new compressed writer
    ///
    /// With `enabled == false` every chunk is framed raw, so readers need no
    /// out-of-band knowledge of whether compression was on.
    pub fn new(writer: W, chunk_size: usize, enabled: bool) -> Self {
        let chunk_size = chunk_size.clamp(1, MAX_CHUNK_SIZE);
        Self {
            writer,
            buffer: Vec::with_capacity(chunk_size),
            chunk_size,
            enabled,
            stats: CompressionStats::default(),
            started: Instant::now(),
        }
    }

    /// Get compression statistics
    pub fn stats(&self) -> &CompressionStats {
        &self.stats
    }

    fn flush_buffer(&mut self) -> io::Result<()> {
        if self.buffer.is_empty() {
            return Ok(());
        }
        let uncompressed_size = self.buffer.len();
        let compressed = if self.enabled {
            Some(compress_prepend_size(&self.buffer))
        } else {
            None
        };

        // Only use compressed if beneficial
        let (flag, payload): (u8, &[u8]) = match compressed.as_deref() {
            Some(c) if c.len() < uncompressed_size => {
                self.stats.chunks_compressed += 1;
                self.stats.bytes_saved += (uncompressed_size - c.len()) as u64;
                trace!("Compressed chunk: {} -> {} bytes", uncompressed_size, c.len());
                (FLAG_LZ4, c)
            }
            _ => {
                self.stats.chunks_stored_raw += 1;
                trace!("Stored chunk uncompressed: {} bytes", uncompressed_size);
                (FLAG_RAW, &self.buffer)
            }
        };

        self.writer.write_all(&[flag])?;
        self.writer.write_all(&(payload.len() as u32).to_le_bytes())?;
        self.writer.write_all(payload)?;
        self.stats.bytes_out += 5 + payload.len() as u64;
        self.buffer.clear();
        Ok(())
    }

    /// Finish writing and return the underlying writer and stats
    pub fn finish(mut self) -> io::Result<(W, CompressionStats)> {
        self.flush_buffer()?;
        self.writer.flush()?;
        self.stats.compression_time_ms = self.started.elapsed().as_millis() as u64;
        Ok((self.writer, self.stats))
    }
}

impl<W: Write> Write for CompressedWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut offset = 0;
        while offset < buf.len() {
            let room = self.chunk_size - self.buffer.len();
            let take = room.min(buf.len() - offset);
            self.buffer.extend_from_slice(&buf[offset..offset + take]);
            offset += take;

            if self.buffer.len() >= self.chunk_size {
                self.flush_buffer()?;
            }
        }
        self.stats.bytes_in += buf.len() as u64;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        // Partial chunks stay buffered until `finish`; only pass the flush down.
        self.writer.flush()
    }
}

/// Streaming reader for data produced by [`CompressedWriter`]
pub struct CompressedReader<R: Read> {
    reader: R,
    chunk: Vec<u8>,
    pos: usize,
}

impl<R: Read> CompressedReader<R> {
    /// Wrap a reader positioned at the first frame
    pub fn new(reader: R) -> Self {
        Self {
            reader,
            chunk: Vec::new(),
            pos: 0,
        }
    }

    /// Consume the wrapper and return the underlying reader
    pub fn into_inner(self) -> R {
        self.reader
    }

    /// Load the next frame; `Ok(false)` on a clean end of input
    fn next_chunk(&mut self) -> io::Result<bool> {
        let mut flag = [0u8; 1];
        loop {
            match self.reader.read(&mut flag) {
                Ok(0) => return Ok(false),
                Ok(_) => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }

        let mut len = [0u8; 4];
        self.reader.read_exact(&mut len)?;
        let len = u32::from_le_bytes(len) as usize;
        if len > MAX_CHUNK_SIZE + 4 {
            return Err(invalid_data(format!("chunk of {} bytes exceeds limit", len)));
        }
        let mut payload = vec![0u8; len];
        self.reader.read_exact(&mut payload)?;

        self.chunk = match flag[0] {
            FLAG_RAW => payload,
            FLAG_LZ4 => {
                if payload.len() < 4 {
                    return Err(invalid_data("truncated LZ4 chunk header"));
                }
                let declared = u32::from_le_bytes([payload[0], payload[1], payload[2], payload[3]]) as usize;
                if declared > MAX_CHUNK_SIZE {
                    return Err(invalid_data(format!("LZ4 chunk declares {} bytes", declared)));
                }
                decompress_size_prepended(&payload).map_err(|e| invalid_data(e.to_string()))?
            }
            other => return Err(invalid_data(format!("unknown chunk flag {}", other))),
        };
        self.pos = 0;
        Ok(true)
    }
}

impl<R: Read> Read for CompressedReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        while self.pos >= self.chunk.len() {
            if !self.next_chunk()? {
                return Ok(0);
            }
        }
        let n = (self.chunk.len() - self.pos).min(buf.len());
        buf[..n].copy_from_slice(&self.chunk[self.pos..self.pos + n]);
        self.pos += n;
        Ok(n)
    }
}

fn invalid_data(msg: impl Into<String>) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, msg.into())
}
