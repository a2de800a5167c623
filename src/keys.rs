//! Key pairs, per-archive session keys and the explicit crypto context
//!
//! Every encrypted archive starts with a key block: three freshly generated
//! section keys (stream payloads, base objects, manifest) plus the cipher id,
//! wrapped for an X25519 recipient with `age`. Only the holder of the
//! matching identity can unwrap them.
//!
//! There is no process-wide key state. Callers build a [`CryptoContext`] once
//! and pass it to every archive create/open call that needs it.
//!
//! ## Key file format
//!
//! ```text
//! # created: 2026-01-01T00:00:00Z
//! # public key: age1...
//! AGE-SECRET-KEY-1...
//! ```
//!
//! A file holding only the `age1...` line is a public-only key: enough to
//! write backups, not to read them back.

use crate::crypto::{Cipher, SectionKey, SECTION_KEY_LEN};
use crate::error::{Result, StowageError};
use crate::utils::atomic_write;
use age::secrecy::ExposeSecret;
use age::x25519;
use std::fmt;
use std::fs;
use std::io::{Read, Write};
use std::path::Path;
use tracing::{debug, info};
use zeroize::Zeroizing;

/// Upper bound for a wrapped key block
const MAX_KEY_BLOCK_LEN: usize = 64 * 1024;

/// The three independently keyed sections of an archive
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Section {
    /// Content stream payloads
    Streams,
    /// Serialized object forest
    BaseObjects,
    /// Version manifest
    Manifest,
}

impl Section {
    fn index(self) -> usize {
        match self {
            Section::Streams => 0,
            Section::BaseObjects => 1,
            Section::Manifest => 2,
        }
    }
}

/// Asymmetric key pair used to wrap session keys
#[derive(Clone)]
pub struct KeyPair {
    identity: Option<x25519::Identity>,
    recipient: x25519::Recipient,
}

impl KeyPair {
    /// Generate a new X25519 key pair
    pub fn generate() -> Self {
        let identity = x25519::Identity::generate();
        let recipient = identity.to_public();
        Self {
            identity: Some(identity),
            recipient,
        }
    }

    /// Build a public-only key pair from an `age1...` string
    pub fn from_public(public: &str) -> Result<Self> {
        let recipient = public
            .trim()
            .parse::<x25519::Recipient>()
            .map_err(|e| StowageError::crypto(format!("invalid public key: {}", e)))?;
        Ok(Self {
            identity: None,
            recipient,
        })
    }

    /// Whether this key pair can unwrap session keys
    pub fn has_private(&self) -> bool {
        self.identity.is_some()
    }

    /// The public half as an `age1...` string
    pub fn public_key(&self) -> String {
        self.recipient.to_string()
    }

    /// Write the key pair to `path`
    ///
    /// # Errors
    ///
    /// - [`StowageError::Crypto`] if this is a public-only key pair
    /// - [`StowageError::Io`] if the file cannot be written
    pub fn save(&self, path: &Path) -> Result<()> {
        let identity = self
            .identity
            .as_ref()
            .ok_or_else(|| StowageError::crypto("cannot save a public-only key pair"))?;
        let secret = identity.to_string();
        let content = Zeroizing::new(format!(
            "# created: {}\n# public key: {}\n{}\n",
            chrono::Utc::now().to_rfc3339(),
            self.recipient,
            secret.expose_secret()
        ));
        atomic_write(path, content.as_bytes())?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(path, fs::Permissions::from_mode(0o600))?;
        }

        info!("Wrote key pair to {:?}", path);
        Ok(())
    }

    /// Write only the public half to `path`
    pub fn save_public(&self, path: &Path) -> Result<()> {
        atomic_write(path, format!("{}\n", self.recipient).as_bytes())
    }

    /// Load a key pair (or a public-only key) from `path`
    pub fn load(path: &Path) -> Result<Self> {
        let content = Zeroizing::new(fs::read_to_string(path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                StowageError::not_found(format!("key file {:?}", path))
            } else {
                StowageError::Io(e)
            }
        })?);

        let mut public = None;
        for line in content.lines().map(str::trim) {
            if line.starts_with("AGE-SECRET-KEY-") {
                let identity = line
                    .parse::<x25519::Identity>()
                    .map_err(|e| StowageError::crypto(format!("invalid private key: {}", e)))?;
                let recipient = identity.to_public();
                debug!("Loaded private key from {:?}", path);
                return Ok(Self {
                    identity: Some(identity),
                    recipient,
                });
            }
            if let Some(rest) = line.strip_prefix("# public key:") {
                public = Some(rest.trim().to_string());
            } else if line.starts_with("age1") {
                public = Some(line.to_string());
            }
        }

        match public {
            Some(p) => {
                debug!("Loaded public key from {:?}", path);
                Self::from_public(&p)
            }
            None => Err(StowageError::crypto(format!("no key found in {:?}", path))),
        }
    }
}

impl fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyPair")
            .field("public", &self.recipient.to_string())
            .field("has_private", &self.has_private())
            .finish()
    }
}

/// Session keys for one archive
#[derive(Debug, Clone)]
pub struct SessionKeys {
    cipher: Cipher,
    keys: [SectionKey; 3],
}

impl SessionKeys {
    /// Generate fresh keys for every section
    pub fn generate(cipher: Cipher) -> Self {
        Self {
            cipher,
            keys: [SectionKey::generate(), SectionKey::generate(), SectionKey::generate()],
        }
    }

    /// Cipher the archive was written with
    pub fn cipher(&self) -> Cipher {
        self.cipher
    }

    /// Key for one section
    pub fn key(&self, section: Section) -> &SectionKey {
        &self.keys[section.index()]
    }

    fn to_bytes(&self) -> Zeroizing<Vec<u8>> {
        let mut out = Zeroizing::new(Vec::with_capacity(1 + 3 * SECTION_KEY_LEN));
        out.push(self.cipher.id());
        for key in &self.keys {
            key.write_to(&mut out);
        }
        out
    }

    fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() != 1 + 3 * SECTION_KEY_LEN {
            return Err(StowageError::corrupt("key block has wrong length"));
        }
        let cipher = Cipher::from_id(bytes[0])?;
        let key_at = |i: usize| SectionKey::from_bytes(&bytes[1 + i * SECTION_KEY_LEN..1 + (i + 1) * SECTION_KEY_LEN]);
        Ok(Self {
            cipher,
            keys: [key_at(0)?, key_at(1)?, key_at(2)?],
        })
    }
}

/// Everything archive I/O needs to encrypt or decrypt
#[derive(Debug, Clone)]
pub struct CryptoContext {
    keypair: KeyPair,
    cipher: Cipher,
}

impl CryptoContext {
    /// Create a context from a key pair and the cipher used for new archives
    pub fn new(keypair: KeyPair, cipher: Cipher) -> Self {
        Self { keypair, cipher }
    }

    /// Cipher used for new archives
    pub fn cipher(&self) -> Cipher {
        self.cipher
    }

    /// The underlying key pair
    pub fn keypair(&self) -> &KeyPair {
        &self.keypair
    }

    /// Fresh session keys for a new archive
    pub fn new_session(&self) -> SessionKeys {
        SessionKeys::generate(self.cipher)
    }

    /// Wrap `keys` for the recipient and write the key block
    ///
    /// Returns the number of bytes written.
    pub fn write_key_block<W: Write>(&self, keys: &SessionKeys, mut out: W) -> Result<u64> {
        let recipients: Vec<Box<dyn age::Recipient + Send>> = vec![Box::new(self.keypair.recipient.clone())];
        let encryptor = age::Encryptor::with_recipients(recipients)
            .ok_or_else(|| StowageError::crypto("no recipient for key block"))?;

        let mut wrapped = Vec::new();
        let mut writer = encryptor
            .wrap_output(&mut wrapped)
            .map_err(|e| StowageError::crypto(e.to_string()))?;
        writer.write_all(&keys.to_bytes())?;
        writer.finish()?;

        out.write_all(&(wrapped.len() as u32).to_le_bytes())?;
        out.write_all(&wrapped)?;
        Ok(4 + wrapped.len() as u64)
    }

    /// Read and unwrap a key block
    ///
    /// Returns the session keys and the number of bytes consumed.
    ///
    /// # Errors
    ///
    /// - [`StowageError::Crypto`] if no private key is loaded or unwrapping fails
    /// - [`StowageError::Corrupt`] if the block is malformed
    pub fn read_key_block<R: Read>(&self, mut input: R) -> Result<(SessionKeys, u64)> {
        let identity = self
            .keypair
            .identity
            .as_ref()
            .ok_or_else(|| StowageError::crypto("a private key is required to read encrypted archives"))?;

        let mut len = [0u8; 4];
        input
            .read_exact(&mut len)
            .map_err(|_| StowageError::corrupt("archive too short for key block"))?;
        let len = u32::from_le_bytes(len) as usize;
        if len == 0 || len > MAX_KEY_BLOCK_LEN {
            return Err(StowageError::corrupt(format!("bad key block length {}", len)));
        }
        let mut wrapped = vec![0u8; len];
        input
            .read_exact(&mut wrapped)
            .map_err(|_| StowageError::corrupt("key block truncated"))?;

        let decryptor = match age::Decryptor::new(&wrapped[..]).map_err(|e| StowageError::crypto(e.to_string()))? {
            age::Decryptor::Recipients(d) => d,
            _ => return Err(StowageError::crypto("key block is not wrapped for a recipient")),
        };
        let mut reader = decryptor
            .decrypt(std::iter::once(identity as &dyn age::Identity))
            .map_err(|e| StowageError::crypto(e.to_string()))?;
        let mut plain = Zeroizing::new(Vec::new());
        reader.read_to_end(&mut plain)?;

        Ok((SessionKeys::from_bytes(&plain)?, 4 + len as u64))
    }
}
