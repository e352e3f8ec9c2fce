//! Crypto sealer
//!
//! One AES-256-GCM key per data directory, stored base64-encoded in
//! `<data_dir>/.encryption.key` with mode 0600. Ciphertext framing is
//! `nonce(12) || sealed`, and nothing outside this module relies on it.

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use rand::rngs::OsRng;
use rand::RngCore;
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info};

/// Key file name inside the data directory
pub const KEY_FILE: &str = ".encryption.key";

const KEY_LEN: usize = 32;
const NONCE_LEN: usize = 12;

#[derive(Error, Debug)]
pub enum CryptoError {
    #[error("key file error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid key file: {0}")]
    InvalidKey(String),

    #[error("encrypted data exists in {0} but the key file is missing; refusing to generate a new key")]
    OrphanedData(String),

    #[error("encryption key file was removed or replaced since load")]
    KeyChanged,

    #[error("ciphertext too short")]
    TooShort,

    #[error("cipher failure")]
    Cipher,
}

pub struct Sealer {
    key: [u8; KEY_LEN],
    key_path: PathBuf,
    cipher: Aes256Gcm,
}

impl std::fmt::Debug for Sealer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Sealer").field("key_path", &self.key_path).finish()
    }
}

impl Sealer {
    /// Load the key for `data_dir`, creating it on first use
    pub fn new(data_dir: &Path) -> Result<Self, CryptoError> {
        create_private_dir(data_dir)?;
        let key_path = data_dir.join(KEY_FILE);

        let key = if key_path.exists() {
            let key = read_key(&key_path)?;
            debug!(path = %key_path.display(), "Loaded encryption key");
            key
        } else {
            if let Some(dir) = find_encrypted_files(data_dir) {
                return Err(CryptoError::OrphanedData(dir));
            }
            let mut key = [0u8; KEY_LEN];
            OsRng.fill_bytes(&mut key);
            write_private_file(&key_path, STANDARD.encode(key).as_bytes())?;
            info!(path = %key_path.display(), "Generated new encryption key");
            key
        };

        let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&key));
        Ok(Self {
            key,
            key_path,
            cipher,
        })
    }

    pub fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        // Writing under a key nobody can find again would lose the data
        match read_key(&self.key_path) {
            Ok(on_disk) if on_disk == self.key => {}
            _ => return Err(CryptoError::KeyChanged),
        }

        let mut nonce = [0u8; NONCE_LEN];
        OsRng.fill_bytes(&mut nonce);
        let sealed = self
            .cipher
            .encrypt(Nonce::from_slice(&nonce), plaintext)
            .map_err(|_| CryptoError::Cipher)?;

        let mut out = Vec::with_capacity(NONCE_LEN + sealed.len());
        out.extend_from_slice(&nonce);
        out.extend_from_slice(&sealed);
        Ok(out)
    }

    pub fn decrypt(&self, ciphertext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        if ciphertext.len() < NONCE_LEN {
            return Err(CryptoError::TooShort);
        }
        let (nonce, sealed) = ciphertext.split_at(NONCE_LEN);
        self.cipher
            .decrypt(Nonce::from_slice(nonce), sealed)
            .map_err(|_| CryptoError::Cipher)
    }

    pub fn key_path(&self) -> &Path {
        &self.key_path
    }
}

fn read_key(path: &Path) -> Result<[u8; KEY_LEN], CryptoError> {
    let raw = fs::read_to_string(path)?;
    let bytes = STANDARD
        .decode(raw.trim())
        .map_err(|e| CryptoError::InvalidKey(e.to_string()))?;
    bytes
        .try_into()
        .map_err(|b: Vec<u8>| CryptoError::InvalidKey(format!("expected {} bytes, got {}", KEY_LEN, b.len())))
}

fn find_encrypted_files(data_dir: &Path) -> Option<String> {
    let mut dirs = vec![data_dir.to_path_buf()];
    if let Ok(entries) = fs::read_dir(data_dir) {
        dirs.extend(entries.flatten().map(|e| e.path()).filter(|p| p.is_dir()));
    }
    dirs.into_iter().find_map(|dir| {
        let has_enc = fs::read_dir(&dir).ok()?.flatten().any(|e| {
            e.path().extension().map(|ext| ext == "enc").unwrap_or(false)
        });
        has_enc.then(|| dir.display().to_string())
    })
}

#[cfg(unix)]
pub(crate) fn create_private_dir(dir: &Path) -> std::io::Result<()> {
    use std::os::unix::fs::DirBuilderExt;
    if dir.exists() {
        return Ok(());
    }
    fs::DirBuilder::new().recursive(true).mode(0o700).create(dir)
}

#[cfg(not(unix))]
pub(crate) fn create_private_dir(dir: &Path) -> std::io::Result<()> {
    fs::create_dir_all(dir)
}

#[cfg(unix)]
fn write_private_file(path: &Path, contents: &[u8]) -> std::io::Result<()> {
    use std::io::Write;
    use std::os::unix::fs::OpenOptionsExt;
    let mut f = fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .mode(0o600)
        .open(path)?;
    f.write_all(contents)?;
    f.sync_all()
}

#[cfg(not(unix))]
fn write_private_file(path: &Path, contents: &[u8]) -> std::io::Result<()> {
    fs::write(path, contents)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let sealer = Sealer::new(dir.path()).unwrap();
        let sealed = sealer.encrypt(b"root password is hunter2").unwrap();
        assert_ne!(&sealed[NONCE_LEN..], b"root password is hunter2");
        assert_eq!(sealer.decrypt(&sealed).unwrap(), b"root password is hunter2");
    }

    #[test]
    fn test_key_reused_across_instances() {
        let dir = tempfile::tempdir().unwrap();
        let sealed = Sealer::new(dir.path()).unwrap().encrypt(b"x").unwrap();
        let again = Sealer::new(dir.path()).unwrap();
        assert_eq!(again.decrypt(&sealed).unwrap(), b"x");
    }

    #[cfg(unix)]
    #[test]
    fn test_key_file_mode() {
        use std::os::unix::fs::PermissionsExt;
        let dir = tempfile::tempdir().unwrap();
        let sealer = Sealer::new(dir.path()).unwrap();
        let mode = fs::metadata(sealer.key_path()).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[test]
    fn test_short_ciphertext() {
        let dir = tempfile::tempdir().unwrap();
        let sealer = Sealer::new(dir.path()).unwrap();
        assert!(matches!(sealer.decrypt(b"short"), Err(CryptoError::TooShort)));
    }

    #[test]
    fn test_refuses_when_key_removed() {
        let dir = tempfile::tempdir().unwrap();
        let sealer = Sealer::new(dir.path()).unwrap();
        fs::remove_file(sealer.key_path()).unwrap();
        assert!(matches!(sealer.encrypt(b"x"), Err(CryptoError::KeyChanged)));
    }

    #[test]
    fn test_orphaned_data_blocks_new_key() {
        let dir = tempfile::tempdir().unwrap();
        let knowledge = dir.path().join("knowledge");
        fs::create_dir_all(&knowledge).unwrap();
        fs::write(knowledge.join("vm-100.enc"), b"opaque").unwrap();
        assert!(matches!(
            Sealer::new(dir.path()),
            Err(CryptoError::OrphanedData(_))
        ));
    }
}
