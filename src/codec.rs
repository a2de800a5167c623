//! Composable byte-stream codecs
//!
//! The archive container never touches compression or encryption directly;
//! it asks a [`Codec`] to wrap a sink or a source. A codec is an ordered
//! pipeline: LZ4 chunk compression first, then (optionally) chunked
//! authenticated encryption with one section key.
//!
//! The remaining types are the plumbing the container composes around codecs:
//! a SHA-256 hashing writer for the trailer digest, a byte-counting writer for
//! section sizes, a hashing reader for content digests, and a length-bounded
//! reader for replaying individual streams.
//!
//! ```text
//! content ─▶ CompressedWriter ─▶ [SealingWriter] ─▶ CountingWriter ─▶ HashingWriter ─▶ file
//! ```

use crate::compression::{CompressedReader, CompressedWriter};
use crate::crypto::{Cipher, OpeningReader, SealingWriter, SectionKey};
use crate::keys::{Section, SessionKeys};
use crate::types::Sha256Digest;
use sha2::{Digest, Sha256};
use std::io::{self, Read, Write};

/// One stage of a codec pipeline
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Algorithm {
    /// Chunked LZ4 framing
    Compression,
    /// Chunked authenticated encryption
    Cipher(Cipher),
}

/// Factory for section writers and readers
#[derive(Debug, Clone)]
pub struct Codec {
    compression: bool,
    chunk_size: usize,
    sealing: Option<(Cipher, SectionKey)>,
}

impl Codec {
    /// Compression-only codec
    pub fn plain(compression: bool, chunk_size: usize) -> Self {
        Self {
            compression,
            chunk_size,
            sealing: None,
        }
    }

    /// Codec for one archive section, encrypted when session keys are present
    pub fn for_section(compression: bool, chunk_size: usize, keys: Option<&SessionKeys>, section: Section) -> Self {
        Self {
            compression,
            chunk_size,
            sealing: keys.map(|k| (k.cipher(), k.key(section).clone())),
        }
    }

    /// Stages applied to output, in order
    pub fn algorithms(&self) -> Vec<Algorithm> {
        let mut stages = vec![Algorithm::Compression];
        if let Some((cipher, _)) = &self.sealing {
            stages.push(Algorithm::Cipher(*cipher));
        }
        stages
    }

    /// Wrap a sink so that writes pass through every stage
    pub fn wrap_output<W: Write>(&self, sink: W) -> CodecWriter<W> {
        match &self.sealing {
            None => CodecWriter::Plain(CompressedWriter::new(sink, self.chunk_size, self.compression)),
            Some((cipher, key)) => CodecWriter::Sealed(CompressedWriter::new(
                SealingWriter::new(sink, *cipher, key, self.chunk_size),
                self.chunk_size,
                self.compression,
            )),
        }
    }

    /// Wrap a source so that reads undo every stage
    pub fn wrap_input<R: Read>(&self, source: R) -> CodecReader<R> {
        match &self.sealing {
            None => CodecReader::Plain(CompressedReader::new(source)),
            Some((cipher, key)) => CodecReader::Sealed(CompressedReader::new(OpeningReader::new(source, *cipher, key))),
        }
    }
}

/// Writer produced by [`Codec::wrap_output`]
pub enum CodecWriter<W: Write> {
    /// Compression only
    Plain(CompressedWriter<W>),
    /// Compression followed by encryption
    Sealed(CompressedWriter<SealingWriter<W>>),
}

impl<W: Write> CodecWriter<W> {
    /// Flush every stage and return the sink
    ///
    /// Dropping a `CodecWriter` without calling this loses buffered data.
    pub fn finish(self) -> io::Result<W> {
        match self {
            CodecWriter::Plain(w) => Ok(w.finish()?.0),
            CodecWriter::Sealed(w) => w.finish()?.0.finish(),
        }
    }
}

impl<W: Write> Write for CodecWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            CodecWriter::Plain(w) => w.write(buf),
            CodecWriter::Sealed(w) => w.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            CodecWriter::Plain(w) => w.flush(),
            CodecWriter::Sealed(w) => w.flush(),
        }
    }
}

/// Reader produced by [`Codec::wrap_input`]
pub enum CodecReader<R: Read> {
    /// Compression only
    Plain(CompressedReader<R>),
    /// Decryption followed by decompression
    Sealed(CompressedReader<OpeningReader<R>>),
}

impl<R: Read> Read for CodecReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            CodecReader::Plain(r) => r.read(buf),
            CodecReader::Sealed(r) => r.read(buf),
        }
    }
}

/// Writer that feeds every byte written through SHA-256
pub struct HashingWriter<W: Write> {
    inner: W,
    hasher: Sha256,
}

impl<W: Write> HashingWriter<W> {
    /// Wrap a writer
    pub fn new(inner: W) -> Self {
        Self {
            inner,
            hasher: Sha256::new(),
        }
    }

    /// Mutable access to the wrapped writer; bytes written through it are not hashed
    pub fn get_mut(&mut self) -> &mut W {
        &mut self.inner
    }

    /// Digest of everything written so far
    pub fn digest(&self) -> Sha256Digest {
        Sha256Digest(self.hasher.clone().finalize().into())
    }

    /// Return the wrapped writer and the final digest
    pub fn finalize(self) -> (W, Sha256Digest) {
        (self.inner, Sha256Digest(self.hasher.finalize().into()))
    }
}

impl<W: Write> Write for HashingWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.hasher.update(&buf[..n]);
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

/// Writer that counts bytes passed through it
pub struct CountingWriter<W: Write> {
    inner: W,
    count: u64,
}

impl<W: Write> CountingWriter<W> {
    /// Wrap a writer
    pub fn new(inner: W) -> Self {
        Self { inner, count: 0 }
    }

    /// Bytes written so far
    pub fn count(&self) -> u64 {
        self.count
    }

    /// Return the wrapped writer
    pub fn into_inner(self) -> W {
        self.inner
    }
}

impl<W: Write> Write for CountingWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.count += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

/// Reader that hashes and counts every byte read through it
pub struct HashingReader<R: Read> {
    inner: R,
    hasher: Sha256,
    count: u64,
}

impl<R: Read> HashingReader<R> {
    /// Wrap a reader
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            hasher: Sha256::new(),
            count: 0,
        }
    }

    /// Digest and byte count of everything read
    pub fn finalize(self) -> (Sha256Digest, u64) {
        (Sha256Digest(self.hasher.finalize().into()), self.count)
    }
}

impl<R: Read> Read for HashingReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.inner.read(buf)?;
        self.hasher.update(&buf[..n]);
        self.count += n as u64;
        Ok(n)
    }
}

/// Reader limited to a declared number of bytes
///
/// Unlike `Read::take`, an early end of the inner reader is an error: the
/// declared length is a promise made by the archive.
pub struct BoundedReader<R: Read> {
    inner: R,
    remaining: u64,
}

impl<R: Read> BoundedReader<R> {
    /// Limit `inner` to `len` bytes
    pub fn new(inner: R, len: u64) -> Self {
        Self { inner, remaining: len }
    }

    /// Bytes not yet read
    pub fn remaining(&self) -> u64 {
        self.remaining
    }

    /// Discard whatever is left of the bounded range
    pub fn skip_remaining(&mut self) -> io::Result<u64> {
        io::copy(self, &mut io::sink())
    }

    /// Return the wrapped reader
    pub fn into_inner(self) -> R {
        self.inner
    }
}

impl<R: Read> Read for BoundedReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.remaining == 0 || buf.is_empty() {
            return Ok(0);
        }
        let max = (buf.len() as u64).min(self.remaining) as usize;
        let n = self.inner.read(&mut buf[..max])?;
        if n == 0 {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!("stream ended {} bytes early", self.remaining),
            ));
        }
        self.remaining -= n as u64;
        Ok(n)
    }
}
