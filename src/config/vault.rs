//! Credential Vault - Local Encrypted Secret Fields
//!
//! Secrets (SSH passwords, cluster bearer tokens) live inside otherwise
//! plaintext config records, so every field is sealed on its own:
//!
//! ```text
//! base64( nonce[12] || ChaCha20-Poly1305(plaintext) || tag[16] )
//! ```
//!
//! The symmetric key is derived from a key file under the per-OS config
//! directory (`SHA-256(file contents)`), so the file may hold a seed of any
//! length. The file is created with 32 random bytes on first use, owner-only.
//!
//! A vault is explicit process-scoped state: construct one, share it by
//! `Arc`, and pass it to everything that needs to seal or open a secret.
//! The key is loaded at most once and never changes afterwards.

use std::fs;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use chacha20poly1305::{aead::Aead, ChaCha20Poly1305, KeyInit, Nonce};
use once_cell::sync::OnceCell;
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::{Digest, Sha256};
use zeroize::Zeroizing;

use super::storage::{key_file, StorageError};

/// Symmetric key length in bytes
pub const KEY_LEN: usize = 32;

/// ChaCha20-Poly1305 nonce length in bytes
pub const NONCE_LEN: usize = 12;

/// Poly1305 authentication tag length in bytes
pub const TAG_LEN: usize = 16;

/// Vault errors
#[derive(Debug, thiserror::Error)]
pub enum VaultError {
    #[error("System entropy source unavailable: {0}")]
    Entropy(String),

    #[error("Key file IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to determine config directory")]
    NoConfigDir,

    #[error("Key file {0:?} is empty")]
    EmptyKeyFile(PathBuf),

    #[error("Malformed encrypted value: {0}")]
    Format(String),

    #[error("Decryption failed (wrong key or tampered data)")]
    Authentication,

    #[error("Encryption failed")]
    Encryption,

    #[error("Decrypted secret is not valid UTF-8")]
    Utf8(#[from] std::string::FromUtf8Error),
}

impl VaultError {
    /// The value decoded but did not verify under the current key.
    pub fn is_authentication(&self) -> bool {
        matches!(self, VaultError::Authentication)
    }

    /// The value is not something this vault could have produced.
    pub fn is_format(&self) -> bool {
        matches!(self, VaultError::Format(_))
    }
}

impl From<StorageError> for VaultError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::Io(e) => VaultError::Io(e),
            _ => VaultError::NoConfigDir,
        }
    }
}

type Key = Zeroizing<[u8; KEY_LEN]>;

/// Encrypts and decrypts secret fields with a locally managed key
pub struct CredentialVault {
    key_path: PathBuf,
    key: OnceCell<Key>,
}

impl CredentialVault {
    /// Create a vault backed by the key file at `key_path`.
    ///
    /// Nothing is read until the first `ensure_key`/`encrypt`/`decrypt`.
    pub fn new(key_path: impl Into<PathBuf>) -> Self {
        let key_path = key_path.into();
        tracing::debug!("CredentialVault initialized: path={:?}", key_path);
        Self {
            key_path,
            key: OnceCell::new(),
        }
    }

    /// Create a vault using the fixed per-OS key location
    pub fn open_default() -> Result<Self, VaultError> {
        Ok(Self::new(key_file()?))
    }

    /// Path of the key file backing this vault
    pub fn key_path(&self) -> &Path {
        &self.key_path
    }

    /// Whether the key has been loaded into memory
    pub fn is_loaded(&self) -> bool {
        self.key.get().is_some()
    }

    /// Load the key, creating the key file if it does not exist yet.
    ///
    /// No-op once the key is loaded.
    pub fn ensure_key(&self) -> Result<(), VaultError> {
        self.key().map(|_| ())
    }

    fn key(&self) -> Result<&[u8; KEY_LEN], VaultError> {
        self.key
            .get_or_try_init(|| load_or_create_key(&self.key_path))
            .map(|key| &**key)
    }

    /// Seal a secret. Empty input maps to empty output without touching the key.
    pub fn encrypt(&self, plaintext: &str) -> Result<String, VaultError> {
        if plaintext.is_empty() {
            return Ok(String::new());
        }

        let key = self.key()?;
        let cipher = ChaCha20Poly1305::new_from_slice(key).map_err(|_| VaultError::Encryption)?;

        let mut nonce = [0u8; NONCE_LEN];
        fill_random(&mut nonce)?;

        let sealed = cipher
            .encrypt(Nonce::from_slice(&nonce), plaintext.as_bytes())
            .map_err(|_| VaultError::Encryption)?;

        let mut blob = Vec::with_capacity(NONCE_LEN + sealed.len());
        blob.extend_from_slice(&nonce);
        blob.extend_from_slice(&sealed);

        Ok(BASE64.encode(blob))
    }

    /// Open a sealed secret. Empty input maps to empty output.
    pub fn decrypt(&self, ciphertext: &str) -> Result<String, VaultError> {
        if ciphertext.is_empty() {
            return Ok(String::new());
        }

        let data = BASE64
            .decode(ciphertext)
            .map_err(|e| VaultError::Format(format!("invalid base64: {}", e)))?;

        if data.len() < NONCE_LEN {
            return Err(VaultError::Format(format!(
                "payload is {} bytes, shorter than the {}-byte nonce",
                data.len(),
                NONCE_LEN
            )));
        }

        let key = self.key()?;
        let cipher = ChaCha20Poly1305::new_from_slice(key).map_err(|_| VaultError::Encryption)?;

        let (nonce, sealed) = data.split_at(NONCE_LEN);
        let plaintext = Zeroizing::new(
            cipher
                .decrypt(Nonce::from_slice(nonce), sealed)
                .map_err(|_| VaultError::Authentication)?,
        );

        Ok(String::from_utf8(plaintext.to_vec())?)
    }
}

fn fill_random(buf: &mut [u8]) -> Result<(), VaultError> {
    OsRng
        .try_fill_bytes(buf)
        .map_err(|e| VaultError::Entropy(e.to_string()))
}

fn derive_key(material: &[u8]) -> Key {
    let digest = Sha256::digest(material);
    let mut key = Zeroizing::new([0u8; KEY_LEN]);
    key.copy_from_slice(&digest);
    key
}

fn load_or_create_key(path: &Path) -> Result<Key, VaultError> {
    match fs::read(path) {
        Ok(material) => {
            let material = Zeroizing::new(material);
            tracing::info!("Loaded vault key material from {:?}", path);
            return key_from_material(path, &material);
        }
        Err(e) if e.kind() == ErrorKind::NotFound => {}
        Err(e) => return Err(VaultError::Io(e)),
    }

    let mut material = Zeroizing::new([0u8; KEY_LEN]);
    fill_random(&mut *material)?;

    if let Some(parent) = path.parent() {
        create_private_dir(parent)?;
    }

    let mut suffix = [0u8; 8];
    fill_random(&mut suffix)?;
    let temp_path = path.with_extension(format!("tmp-{:016x}", u64::from_le_bytes(suffix)));

    match publish_private_file(&temp_path, path, &*material) {
        Ok(()) => {
            tracing::info!("Generated new vault key at {:?}", path);
            Ok(derive_key(&*material))
        }
        // Another process won the race; use its key.
        Err(e) if e.kind() == ErrorKind::AlreadyExists => {
            let material = Zeroizing::new(fs::read(path)?);
            key_from_material(path, &material)
        }
        Err(e) => Err(VaultError::Io(e)),
    }
}

/// An empty seed would derive the well-known `SHA-256("")` key
fn key_from_material(path: &Path, material: &[u8]) -> Result<Key, VaultError> {
    if material.is_empty() {
        tracing::error!("Vault key file {:?} is empty, refusing to use it", path);
        return Err(VaultError::EmptyKeyFile(path.to_path_buf()));
    }
    Ok(derive_key(material))
}

/// Write `contents` to `temp_path`, then link it in at `path` only once it
/// is complete. Fails with `AlreadyExists` if `path` is taken. The temp file
/// is always removed.
fn publish_private_file(temp_path: &Path, path: &Path, contents: &[u8]) -> std::io::Result<()> {
    let result = write_private_file(temp_path, contents).and_then(|()| fs::hard_link(temp_path, path));
    if let Err(e) = fs::remove_file(temp_path) {
        if e.kind() != ErrorKind::NotFound {
            tracing::warn!("Failed to remove temporary key file {:?}: {}", temp_path, e);
        }
    }
    result
}

#[cfg(unix)]
fn create_private_dir(dir: &Path) -> std::io::Result<()> {
    use std::os::unix::fs::DirBuilderExt;
    fs::DirBuilder::new().recursive(true).mode(0o700).create(dir)
}

#[cfg(not(unix))]
fn create_private_dir(dir: &Path) -> std::io::Result<()> {
    fs::create_dir_all(dir)
}

fn write_private_file(path: &Path, contents: &[u8]) -> std::io::Result<()> {
    let mut options = fs::OpenOptions::new();
    options.write(true).create_new(true);

    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }

    let mut file = options.open(path)?;
    file.write_all(contents)?;
    file.sync_all()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn temp_vault() -> (TempDir, CredentialVault) {
        let dir = TempDir::new().unwrap();
        let vault = CredentialVault::new(dir.path().join("termhub").join(".encryption_key"));
        (dir, vault)
    }

    #[test]
    fn test_roundtrip() {
        let (_dir, vault) = temp_vault();
        let cases = [
            "simple_password",
            "complex!@#$%^&*()_+-=",
            "unicode_测试密码_😀",
            "very_long_password_that_has_many_characters_to_test_encryption_algorithm_1234567890",
            "",
        ];

        for original in cases {
            let encrypted = vault.encrypt(original).unwrap();
            if !original.is_empty() {
                assert!(!encrypted.is_empty());
                assert_ne!(encrypted, original);
            }
            assert_eq!(vault.decrypt(&encrypted).unwrap(), original);
        }
    }

    #[test]
    fn test_nonce_is_fresh_per_call() {
        let (_dir, vault) = temp_vault();
        let a = vault.encrypt("same").unwrap();
        let b = vault.encrypt("same").unwrap();
        assert_ne!(a, b);

        let a = BASE64.decode(a).unwrap();
        let b = BASE64.decode(b).unwrap();
        assert_ne!(&a[..NONCE_LEN], &b[..NONCE_LEN]);
        assert_eq!(a.len(), NONCE_LEN + "same".len() + TAG_LEN);
    }

    #[test]
    fn test_empty_does_not_touch_key() {
        let (dir, vault) = temp_vault();
        assert_eq!(vault.encrypt("").unwrap(), "");
        assert_eq!(vault.decrypt("").unwrap(), "");
        assert!(!vault.is_loaded());
        assert!(!dir.path().join("termhub").join(".encryption_key").exists());
    }

    #[test]
    fn test_format_errors() {
        let (_dir, vault) = temp_vault();

        let err = vault.decrypt("not_base64!").unwrap_err();
        assert!(err.is_format());
        assert!(!err.is_authentication());

        // "abc" decodes to 3 bytes, too short for a nonce
        let err = vault.decrypt("YWJj").unwrap_err();
        assert!(err.is_format());
    }

    #[test]
    fn test_foreign_payload_fails_authentication() {
        let (_dir, vault) = temp_vault();
        let foreign = BASE64.encode([7u8; 20]);
        let err = vault.decrypt(&foreign).unwrap_err();
        assert!(err.is_authentication());
    }

    #[test]
    fn test_tampered_payload_fails_authentication() {
        let (_dir, vault) = temp_vault();
        let encrypted = vault.encrypt("s3cr3t").unwrap();
        let mut raw = BASE64.decode(encrypted).unwrap();
        let last = raw.len() - 1;
        raw[last] ^= 0x01;

        let err = vault.decrypt(&BASE64.encode(raw)).unwrap_err();
        assert!(matches!(err, VaultError::Authentication));
    }

    #[test]
    fn test_key_persists_across_instances() {
        let (dir, vault) = temp_vault();
        let encrypted = vault.encrypt("persisted").unwrap();

        let reopened = CredentialVault::new(dir.path().join("termhub").join(".encryption_key"));
        assert_eq!(reopened.decrypt(&encrypted).unwrap(), "persisted");
    }

    #[test]
    fn test_key_seed_of_any_length() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("seed");
        fs::write(&path, b"short seed").unwrap();

        let vault = CredentialVault::new(&path);
        let encrypted = vault.encrypt("token").unwrap();
        assert_eq!(vault.decrypt(&encrypted).unwrap(), "token");
        assert_eq!(fs::read(&path).unwrap(), b"short seed");
    }

    #[test]
    fn test_empty_key_file_is_rejected() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("seed");
        fs::write(&path, b"").unwrap();

        let vault = CredentialVault::new(&path);
        assert!(matches!(vault.ensure_key(), Err(VaultError::EmptyKeyFile(_))));
        assert!(matches!(vault.encrypt("token"), Err(VaultError::EmptyKeyFile(_))));
        assert!(!vault.is_loaded());
    }

    #[test]
    fn test_key_creation_leaves_only_the_key_file() {
        let (_dir, vault) = temp_vault();
        vault.ensure_key().unwrap();

        let parent = vault.key_path().parent().unwrap();
        let names: Vec<_> = fs::read_dir(parent)
            .unwrap()
            .map(|e| e.unwrap().file_name())
            .collect();
        assert_eq!(names, vec![std::ffi::OsString::from(".encryption_key")]);
        assert_eq!(fs::read(vault.key_path()).unwrap().len(), KEY_LEN);
    }

    #[cfg(unix)]
    #[test]
    fn test_failed_key_publish_cleans_up() {
        let dir = TempDir::new().unwrap();
        // A dangling symlink reads as missing but blocks the link step
        let path = dir.path().join("key");
        std::os::unix::fs::symlink(dir.path().join("nowhere"), &path).unwrap();

        let vault = CredentialVault::new(&path);
        assert!(matches!(vault.ensure_key(), Err(VaultError::Io(_))));
        assert!(!vault.is_loaded());

        let leftovers = fs::read_dir(dir.path()).unwrap().count();
        assert_eq!(leftovers, 1);
    }

    #[test]
    fn test_different_key_fails_authentication() {
        let (_dir, vault) = temp_vault();
        let encrypted = vault.encrypt("secret").unwrap();

        let (_other_dir, other) = temp_vault();
        let err = other.decrypt(&encrypted).unwrap_err();
        assert!(err.is_authentication());
    }

    #[cfg(unix)]
    #[test]
    fn test_key_file_permissions() {
        use std::os::unix::fs::PermissionsExt;

        let (_dir, vault) = temp_vault();
        vault.ensure_key().unwrap();

        let file_mode = fs::metadata(vault.key_path()).unwrap().permissions().mode();
        assert_eq!(file_mode & 0o777, 0o600);

        let dir_mode = fs::metadata(vault.key_path().parent().unwrap())
            .unwrap()
            .permissions()
            .mode();
        assert_eq!(dir_mode & 0o777, 0o700);
    }
}
