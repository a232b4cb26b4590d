//! Private key handling: the in-memory newtype, log redaction, and storage backends.
//!
//! The wallet key never lands in `agent-config.json`. [`ConfigStore`](crate::config::ConfigStore)
//! strips it and hands it to a [`SecretStore`] instead.

use crate::errors::{SecretError, SecretResult};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

/// Environment variable read by [`EnvSecretStore`].
pub const PRIVATE_KEY_ENV: &str = "WARDEN_PRIVATE_KEY";

/// Environment variable holding the passphrase for [`EncryptedFileSecretStore`].
pub const PASSPHRASE_ENV: &str = "WARDEN_SECRET_PASSPHRASE";

/// Length of a `0x`-prefixed 32-byte hex key.
pub const PRIVATE_KEY_LEN: usize = 66;

/// Wallet private key. Zeroized on drop and never printed.
#[derive(Clone, Default, PartialEq, Eq, Serialize, Deserialize, Zeroize, ZeroizeOnDrop)]
#[serde(transparent)]
pub struct PrivateKey(String);

impl PrivateKey {
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into().trim().to_string())
    }

    /// Raw key material, for injection into the agent environment.
    pub fn expose(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// `0x` followed by exactly 64 hex digits.
    pub fn has_valid_format(&self) -> bool {
        self.0.len() == PRIVATE_KEY_LEN
            && self.0.starts_with("0x")
            && self.0[2..].bytes().all(|b| b.is_ascii_hexdigit())
    }

    /// Short display form, e.g. `0x1234****...****abcd`.
    pub fn masked(&self) -> String {
        if self.has_valid_format() {
            mask_sensitive_data(&self.0)
        } else if self.0.is_empty() {
            String::new()
        } else {
            "****".to_string()
        }
    }
}

impl fmt::Debug for PrivateKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("PrivateKey(****)")
    }
}

/// Mask every `0x`-prefixed 64-hex-digit run in `line`.
///
/// The first six and last four characters of each match are kept.
pub fn mask_sensitive_data(line: &str) -> String {
    let mut out = String::with_capacity(line.len());
    let mut rest = line;

    while let Some(idx) = rest.find("0x") {
        let (head, tail) = rest.split_at(idx);
        out.push_str(head);

        match tail.get(2..PRIVATE_KEY_LEN) {
            Some(hex) if hex.bytes().all(|b| b.is_ascii_hexdigit()) => {
                out.push_str(&tail[..6]);
                out.push_str("****...****");
                out.push_str(&tail[PRIVATE_KEY_LEN - 4..PRIVATE_KEY_LEN]);
                rest = &tail[PRIVATE_KEY_LEN..];
            }
            _ => {
                out.push_str("0x");
                rest = &tail[2..];
            }
        }
    }

    out.push_str(rest);
    out
}

/// Storage backend for the wallet key.
pub trait SecretStore: Send + Sync {
    /// Short backend name for logs.
    fn name(&self) -> &'static str;

    fn load_private_key(&self) -> SecretResult<Option<PrivateKey>>;

    fn store_private_key(&self, key: &PrivateKey) -> SecretResult<()>;

    fn delete_private_key(&self) -> SecretResult<()>;
}

/// Process-local store, used by tests and embedders that manage keys themselves.
#[derive(Default)]
pub struct MemorySecretStore {
    key: RwLock<Option<PrivateKey>>,
}

impl MemorySecretStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SecretStore for MemorySecretStore {
    fn name(&self) -> &'static str {
        "memory"
    }

    fn load_private_key(&self) -> SecretResult<Option<PrivateKey>> {
        Ok(self.key.read().clone())
    }

    fn store_private_key(&self, key: &PrivateKey) -> SecretResult<()> {
        *self.key.write() = Some(key.clone());
        Ok(())
    }

    fn delete_private_key(&self) -> SecretResult<()> {
        *self.key.write() = None;
        Ok(())
    }
}

/// Read-only store backed by [`PRIVATE_KEY_ENV`].
#[derive(Debug, Default, Clone, Copy)]
pub struct EnvSecretStore;

impl SecretStore for EnvSecretStore {
    fn name(&self) -> &'static str {
        "env"
    }

    fn load_private_key(&self) -> SecretResult<Option<PrivateKey>> {
        match std::env::var(PRIVATE_KEY_ENV) {
            Ok(value) if !value.trim().is_empty() => Ok(Some(PrivateKey::new(value))),
            _ => Ok(None),
        }
    }

    fn store_private_key(&self, _key: &PrivateKey) -> SecretResult<()> {
        Err(SecretError::ReadOnly)
    }

    fn delete_private_key(&self) -> SecretResult<()> {
        Err(SecretError::ReadOnly)
    }
}

mod crypto {
    pub const KEY_SIZE: usize = 32;
    pub const NONCE_SIZE: usize = 12;
    pub const SALT_SIZE: usize = 16;
    pub const FORMAT_VERSION: u8 = 1;
}

/// On-disk envelope for [`EncryptedFileSecretStore`].
#[derive(Debug, Serialize, Deserialize)]
struct SealedKey {
    version: u8,
    salt: String,
    nonce: String,
    ciphertext: String,
}

/// AES-256-GCM encrypted key file. The cipher key is derived from a passphrase with Argon2id.
pub struct EncryptedFileSecretStore {
    path: PathBuf,
    passphrase: Zeroizing<String>,
}

impl EncryptedFileSecretStore {
    pub fn new(path: impl Into<PathBuf>, passphrase: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            passphrase: Zeroizing::new(passphrase.into()),
        }
    }

    /// Build from [`PASSPHRASE_ENV`]; `None` when the variable is unset or empty.
    pub fn from_env(path: impl Into<PathBuf>) -> Option<Self> {
        match std::env::var(PASSPHRASE_ENV) {
            Ok(pass) if !pass.is_empty() => Some(Self::new(path, pass)),
            _ => None,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn derive_key(&self, salt: &[u8]) -> SecretResult<Zeroizing<[u8; crypto::KEY_SIZE]>> {
        let mut key = Zeroizing::new([0u8; crypto::KEY_SIZE]);
        argon2::Argon2::default()
            .hash_password_into(self.passphrase.as_bytes(), salt, key.as_mut_slice())
            .map_err(|e| SecretError::Crypto(format!("Key derivation failed: {}", e)))?;
        Ok(key)
    }

    fn seal(&self, plaintext: &[u8]) -> SecretResult<SealedKey> {
        use aes_gcm::aead::generic_array::GenericArray;
        use aes_gcm::aead::{Aead, KeyInit};
        use aes_gcm::Aes256Gcm;
        use rand::RngCore;

        let mut salt = [0u8; crypto::SALT_SIZE];
        let mut nonce = [0u8; crypto::NONCE_SIZE];
        let mut rng = rand::thread_rng();
        rng.fill_bytes(&mut salt);
        rng.fill_bytes(&mut nonce);

        let key = self.derive_key(&salt)?;
        let cipher = Aes256Gcm::new_from_slice(key.as_slice())
            .map_err(|e| SecretError::Crypto(format!("Failed to create cipher: {}", e)))?;
        let ciphertext = cipher
            .encrypt(GenericArray::from_slice(&nonce), plaintext)
            .map_err(|e| SecretError::Crypto(format!("Encryption failed: {}", e)))?;

        Ok(SealedKey {
            version: crypto::FORMAT_VERSION,
            salt: BASE64.encode(salt),
            nonce: BASE64.encode(nonce),
            ciphertext: BASE64.encode(ciphertext),
        })
    }

    fn open(&self, sealed: &SealedKey) -> SecretResult<Zeroizing<Vec<u8>>> {
        use aes_gcm::aead::generic_array::GenericArray;
        use aes_gcm::aead::{Aead, KeyInit};
        use aes_gcm::Aes256Gcm;

        if sealed.version != crypto::FORMAT_VERSION {
            return Err(SecretError::Encoding(format!(
                "Unsupported key file version {}",
                sealed.version
            )));
        }

        let decode = |field: &str, value: &str| {
            BASE64
                .decode(value)
                .map_err(|e| SecretError::Encoding(format!("Invalid {}: {}", field, e)))
        };
        let salt = decode("salt", &sealed.salt)?;
        let nonce = decode("nonce", &sealed.nonce)?;
        let ciphertext = decode("ciphertext", &sealed.ciphertext)?;

        if nonce.len() != crypto::NONCE_SIZE {
            return Err(SecretError::Encoding(format!(
                "Invalid nonce size: expected {}, got {}",
                crypto::NONCE_SIZE,
                nonce.len()
            )));
        }

        let key = self.derive_key(&salt)?;
        let cipher = Aes256Gcm::new_from_slice(key.as_slice())
            .map_err(|e| SecretError::Crypto(format!("Failed to create cipher: {}", e)))?;
        let plaintext = cipher
            .decrypt(GenericArray::from_slice(&nonce), ciphertext.as_slice())
            .map_err(|_| SecretError::Crypto("Decryption failed (wrong passphrase?)".into()))?;

        Ok(Zeroizing::new(plaintext))
    }

    fn write_private(&self, contents: &[u8]) -> SecretResult<()> {
        use std::io::Write;

        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let mut options = std::fs::OpenOptions::new();
        options.write(true).create(true).truncate(true);
        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            options.mode(0o600);
        }

        let mut file = options.open(&self.path)?;
        file.write_all(contents)?;
        Ok(())
    }
}

impl SecretStore for EncryptedFileSecretStore {
    fn name(&self) -> &'static str {
        "encrypted-file"
    }

    fn load_private_key(&self) -> SecretResult<Option<PrivateKey>> {
        let raw = match std::fs::read_to_string(&self.path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        let sealed: SealedKey = serde_json::from_str(&raw)
            .map_err(|e| SecretError::Encoding(format!("Invalid key file: {}", e)))?;
        let plaintext = self.open(&sealed)?;
        let key = std::str::from_utf8(&plaintext)
            .map_err(|e| SecretError::Encoding(format!("Key is not UTF-8: {}", e)))?;

        Ok(Some(PrivateKey::new(key)))
    }

    fn store_private_key(&self, key: &PrivateKey) -> SecretResult<()> {
        let sealed = self.seal(key.expose().as_bytes())?;
        let json = serde_json::to_vec_pretty(&sealed)
            .map_err(|e| SecretError::Encoding(e.to_string()))?;
        self.write_private(&json)
    }

    fn delete_private_key(&self) -> SecretResult<()> {
        match std::fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}
