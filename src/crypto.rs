//! Chunked authenticated encryption for archive sections
//!
//! Each encrypted section is a sequence of frames:
//!
//! ```text
//! [last: u8][ciphertext_len: u32 LE][ciphertext + 16-byte tag]
//! ```
//!
//! The nonce of chunk `n` is `prefix || n (u32 BE) || last`, where the prefix
//! is random per section. Binding the counter and the final-chunk flag into
//! the nonce makes reordered, dropped or truncated chunks fail
//! authentication instead of decoding to wrong plaintext.

use crate::error::{Result, StowageError};
use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce, XChaCha20Poly1305, XNonce};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::io::{self, Read, Write};
use std::str::FromStr;
use zeroize::{Zeroize, ZeroizeOnDrop};

/// Symmetric key length in bytes
pub const KEY_LEN: usize = 32;

/// Stored nonce prefix length; long enough for the widest supported nonce
pub const NONCE_PREFIX_LEN: usize = 19;

/// Serialized length of a [`SectionKey`]
pub const SECTION_KEY_LEN: usize = KEY_LEN + NONCE_PREFIX_LEN;

const TAG_LEN: usize = 16;
const MAX_FRAME_LEN: usize = 64 * 1024 * 1024 + TAG_LEN;

/// Supported symmetric ciphers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Cipher {
    /// ChaCha20-Poly1305 with a 96-bit nonce
    #[default]
    ChaCha20Poly1305,
    /// XChaCha20-Poly1305 with a 192-bit nonce
    XChaCha20Poly1305,
}

impl Cipher {
    /// Stable on-disk identifier
    pub fn id(self) -> u8 {
        match self {
            Cipher::ChaCha20Poly1305 => 1,
            Cipher::XChaCha20Poly1305 => 2,
        }
    }

    /// Parse an on-disk identifier
    pub fn from_id(id: u8) -> Result<Self> {
        match id {
            1 => Ok(Cipher::ChaCha20Poly1305),
            2 => Ok(Cipher::XChaCha20Poly1305),
            other => Err(StowageError::corrupt(format!("unknown cipher id {}", other))),
        }
    }

    /// Nonce length in bytes
    pub fn nonce_len(self) -> usize {
        match self {
            Cipher::ChaCha20Poly1305 => 12,
            Cipher::XChaCha20Poly1305 => 24,
        }
    }

    /// Canonical lowercase name
    pub fn as_str(&self) -> &'static str {
        match self {
            Cipher::ChaCha20Poly1305 => "chacha20poly1305",
            Cipher::XChaCha20Poly1305 => "xchacha20poly1305",
        }
    }
}

impl fmt::Display for Cipher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Cipher {
    type Err = StowageError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().replace('-', "").as_str() {
            "chacha20poly1305" | "chacha" => Ok(Cipher::ChaCha20Poly1305),
            "xchacha20poly1305" | "xchacha" => Ok(Cipher::XChaCha20Poly1305),
            other => Err(StowageError::InvalidConfiguration(format!("unknown cipher '{}'", other))),
        }
    }
}

/// Key material for one archive section
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct SectionKey {
    key: [u8; KEY_LEN],
    nonce_prefix: [u8; NONCE_PREFIX_LEN],
}

impl SectionKey {
    /// Draw a fresh key and nonce prefix from the thread RNG
    pub fn generate() -> Self {
        let mut rng = rand::rng();
        let mut key = [0u8; KEY_LEN];
        let mut nonce_prefix = [0u8; NONCE_PREFIX_LEN];
        rng.fill_bytes(&mut key);
        rng.fill_bytes(&mut nonce_prefix);
        Self { key, nonce_prefix }
    }

    /// Append the serialized key to `out`
    pub fn write_to(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.key);
        out.extend_from_slice(&self.nonce_prefix);
    }

    /// Parse a key from exactly [`SECTION_KEY_LEN`] bytes
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() != SECTION_KEY_LEN {
            return Err(StowageError::corrupt("section key has wrong length"));
        }
        let mut key = [0u8; KEY_LEN];
        let mut nonce_prefix = [0u8; NONCE_PREFIX_LEN];
        key.copy_from_slice(&bytes[..KEY_LEN]);
        nonce_prefix.copy_from_slice(&bytes[KEY_LEN..]);
        Ok(Self { key, nonce_prefix })
    }
}

impl fmt::Debug for SectionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SectionKey(..)")
    }
}

enum AeadState {
    ChaCha(ChaCha20Poly1305),
    XChaCha(XChaCha20Poly1305),
}

/// Seals and opens individual chunks of one section
struct ChunkSealer {
    aead: AeadState,
    cipher: Cipher,
    prefix: [u8; NONCE_PREFIX_LEN],
}

impl ChunkSealer {
    fn new(cipher: Cipher, key: &SectionKey) -> Self {
        let k = Key::from_slice(&key.key);
        let aead = match cipher {
            Cipher::ChaCha20Poly1305 => AeadState::ChaCha(ChaCha20Poly1305::new(k)),
            Cipher::XChaCha20Poly1305 => AeadState::XChaCha(XChaCha20Poly1305::new(k)),
        };
        Self {
            aead,
            cipher,
            prefix: key.nonce_prefix,
        }
    }

    fn nonce(&self, counter: u32, last: bool) -> Vec<u8> {
        let prefix_len = self.cipher.nonce_len() - 5;
        let mut nonce = Vec::with_capacity(self.cipher.nonce_len());
        nonce.extend_from_slice(&self.prefix[..prefix_len]);
        nonce.extend_from_slice(&counter.to_be_bytes());
        nonce.push(last as u8);
        nonce
    }

    fn seal(&self, counter: u32, last: bool, plaintext: &[u8]) -> io::Result<Vec<u8>> {
        let nonce = self.nonce(counter, last);
        let sealed = match &self.aead {
            AeadState::ChaCha(a) => a.encrypt(Nonce::from_slice(&nonce), plaintext),
            AeadState::XChaCha(a) => a.encrypt(XNonce::from_slice(&nonce), plaintext),
        };
        sealed.map_err(|_| io::Error::other("chunk encryption failed"))
    }

    fn open(&self, counter: u32, last: bool, ciphertext: &[u8]) -> io::Result<Vec<u8>> {
        let nonce = self.nonce(counter, last);
        let opened = match &self.aead {
            AeadState::ChaCha(a) => a.decrypt(Nonce::from_slice(&nonce), ciphertext),
            AeadState::XChaCha(a) => a.decrypt(XNonce::from_slice(&nonce), ciphertext),
        };
        opened.map_err(|_| {
            io::Error::new(
                io::ErrorKind::InvalidData,
                format!("authentication failed for chunk {}", counter),
            )
        })
    }
}

/// Streaming writer that encrypts data in authenticated chunks
pub struct SealingWriter<W: Write> {
    writer: W,
    sealer: ChunkSealer,
    buffer: Vec<u8>,
    chunk_size: usize,
    counter: u32,
}

impl<W: Write> SealingWriter<W> {
    /// Create a sealing writer for one section
    pub fn new(writer: W, cipher: Cipher, key: &SectionKey, chunk_size: usize) -> Self {
        let chunk_size = chunk_size.clamp(1, MAX_FRAME_LEN - TAG_LEN);
        Self {
            writer,
            sealer: ChunkSealer::new(cipher, key),
            buffer: Vec::with_capacity(chunk_size),
            chunk_size,
            counter: 0,
        }
    }

    fn emit(&mut self, len: usize, last: bool) -> io::Result<()> {
        let sealed = self.sealer.seal(self.counter, last, &self.buffer[..len])?;
        self.writer.write_all(&[last as u8])?;
        self.writer.write_all(&(sealed.len() as u32).to_le_bytes())?;
        self.writer.write_all(&sealed)?;
        self.buffer.drain(..len);
        self.counter = self
            .counter
            .checked_add(1)
            .ok_or_else(|| io::Error::other("encrypted section exceeds chunk counter"))?;
        Ok(())
    }

    /// Seal the final chunk and return the underlying writer
    ///
    /// A section always ends with exactly one frame flagged `last`, even when
    /// it carries no plaintext.
    pub fn finish(mut self) -> io::Result<W> {
        let len = self.buffer.len();
        self.emit(len, true)?;
        self.writer.flush()?;
        Ok(self.writer)
    }
}

impl<W: Write> Write for SealingWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.buffer.extend_from_slice(buf);
        // Strictly greater: the tail is kept back so `finish` can flag it last.
        while self.buffer.len() > self.chunk_size {
            self.emit(self.chunk_size, false)?;
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.writer.flush()
    }
}

/// Streaming reader for data produced by [`SealingWriter`]
pub struct OpeningReader<R: Read> {
    reader: R,
    sealer: ChunkSealer,
    plain: Vec<u8>,
    pos: usize,
    counter: u32,
    finished: bool,
}

impl<R: Read> OpeningReader<R> {
    /// Wrap a reader positioned at the first frame of a section
    pub fn new(reader: R, cipher: Cipher, key: &SectionKey) -> Self {
        Self {
            reader,
            sealer: ChunkSealer::new(cipher, key),
            plain: Vec::new(),
            pos: 0,
            counter: 0,
            finished: false,
        }
    }

    fn next_frame(&mut self) -> io::Result<()> {
        let mut header = [0u8; 5];
        self.reader.read_exact(&mut header).map_err(|e| {
            if e.kind() == io::ErrorKind::UnexpectedEof {
                io::Error::new(io::ErrorKind::InvalidData, "encrypted section truncated")
            } else {
                e
            }
        })?;
        let last = match header[0] {
            0 => false,
            1 => true,
            other => {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!("bad frame flag {}", other),
                ))
            }
        };
        let len = u32::from_le_bytes([header[1], header[2], header[3], header[4]]) as usize;
        if !(TAG_LEN..=MAX_FRAME_LEN).contains(&len) {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("bad frame length {}", len),
            ));
        }
        let mut sealed = vec![0u8; len];
        self.reader.read_exact(&mut sealed)?;
        self.plain = self.sealer.open(self.counter, last, &sealed)?;
        self.pos = 0;
        self.counter = self.counter.wrapping_add(1);
        self.finished = last;
        Ok(())
    }
}

impl<R: Read> Read for OpeningReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        while self.pos >= self.plain.len() {
            if self.finished {
                return Ok(0);
            }
            self.next_frame()?;
        }
        let n = (self.plain.len() - self.pos).min(buf.len());
        buf[..n].copy_from_slice(&self.plain[self.pos..self.pos + n]);
        self.pos += n;
        Ok(n)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn seal(data: &[u8], cipher: Cipher, key: &SectionKey, chunk: usize) -> Vec<u8> {
        let mut writer = SealingWriter::new(Vec::new(), cipher, key, chunk);
        writer.write_all(data).unwrap();
        writer.finish().unwrap()
    }

    fn open(data: &[u8], cipher: Cipher, key: &SectionKey) -> io::Result<Vec<u8>> {
        let mut out = Vec::new();
        OpeningReader::new(data, cipher, key).read_to_end(&mut out)?;
        Ok(out)
    }

    #[test]
    fn test_both_ciphers_decode() {
        let key = SectionKey::generate();
        let data: Vec<u8> = (0..10_000u32).map(|i| i as u8).collect();
        for cipher in [Cipher::ChaCha20Poly1305, Cipher::XChaCha20Poly1305] {
            let sealed = seal(&data, cipher, &key, 1000);
            assert_ne!(&sealed[5..105], &data[..100]);
            assert_eq!(open(&sealed, cipher, &key).unwrap(), data);
        }
    }

    #[test]
    fn test_empty_section_has_one_last_frame() {
        let key = SectionKey::generate();
        let sealed = seal(&[], Cipher::ChaCha20Poly1305, &key, 64);
        assert_eq!(sealed.len(), 5 + TAG_LEN);
        assert_eq!(sealed[0], 1);
        assert!(open(&sealed, Cipher::ChaCha20Poly1305, &key).unwrap().is_empty());
    }

    #[test]
    fn test_wrong_key_fails() {
        let sealed = seal(b"secret", Cipher::ChaCha20Poly1305, &SectionKey::generate(), 64);
        let err = open(&sealed, Cipher::ChaCha20Poly1305, &SectionKey::generate()).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[test]
    fn test_dropping_final_frame_is_detected() {
        let key = SectionKey::generate();
        let sealed = seal(&[3u8; 200], Cipher::ChaCha20Poly1305, &key, 100);
        // Two frames of 100 bytes; the second carries the last flag.
        let first_frame = 5 + 100 + TAG_LEN;
        let err = open(&sealed[..first_frame], Cipher::ChaCha20Poly1305, &key).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[test]
    fn test_flipped_last_flag_fails_authentication() {
        let key = SectionKey::generate();
        let mut sealed = seal(&[3u8; 200], Cipher::ChaCha20Poly1305, &key, 100);
        sealed[0] = 1;
        assert!(open(&sealed, Cipher::ChaCha20Poly1305, &key).is_err());
    }

    #[test]
    fn test_section_key_bytes() {
        let key = SectionKey::generate();
        let mut bytes = Vec::new();
        key.write_to(&mut bytes);
        assert_eq!(bytes.len(), SECTION_KEY_LEN);
        let parsed = SectionKey::from_bytes(&bytes).unwrap();
        let data = b"payload";
        let sealed = seal(data, Cipher::XChaCha20Poly1305, &key, 64);
        assert_eq!(open(&sealed, Cipher::XChaCha20Poly1305, &parsed).unwrap(), data);
        assert!(SectionKey::from_bytes(&bytes[1..]).is_err());
    }

    #[test]
    fn test_cipher_ids() {
        for cipher in [Cipher::ChaCha20Poly1305, Cipher::XChaCha20Poly1305] {
            assert_eq!(Cipher::from_id(cipher.id()).unwrap(), cipher);
            assert_eq!(cipher.to_string().parse::<Cipher>().unwrap(), cipher);
        }
        assert!(Cipher::from_id(0).is_err());
    }
}
