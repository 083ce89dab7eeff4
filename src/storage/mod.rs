//! Encrypted storage for identity keys and persisted state
//!
//! A filesystem key/value store with AES-256-GCM at rest: every entry is a
//! file holding a random 12-byte nonce followed by the ciphertext. The
//! master key lives beside the store and is created on first use.

use std::path::{Path, PathBuf};

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use rand::RngCore;
use tokio::fs;

use crate::error::{Error, Result};

const MASTER_KEY_FILE: &str = "storage.key";
const KV_DIR: &str = "kv";
const INCOMING_DIR: &str = "files/incoming";

const NONCE_SIZE: usize = 12;

/// Encrypted key/value store rooted at the node's data directory
pub struct SecureStorage {
    root: PathBuf,
    cipher: Aes256Gcm,
}

impl SecureStorage {
    /// Open the store, creating the directory tree and master key on first
    /// use.
    pub async fn open<P: AsRef<Path>>(root: P) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(root.join(KV_DIR))
            .await
            .map_err(storage_err)?;
        fs::create_dir_all(root.join(INCOMING_DIR))
            .await
            .map_err(storage_err)?;

        let master_key = Self::load_or_create_master_key(&root).await?;
        let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&master_key));

        Ok(Self { root, cipher })
    }

    async fn load_or_create_master_key(root: &Path) -> Result<[u8; 32]> {
        let key_path = root.join(MASTER_KEY_FILE);
        if let Ok(bytes) = fs::read(&key_path).await {
            let key: [u8; 32] = bytes
                .as_slice()
                .try_into()
                .map_err(|_| Error::Storage("corrupt master key".into()))?;
            return Ok(key);
        }

        let mut key = [0u8; 32];
        rand::rngs::OsRng.fill_bytes(&mut key);
        fs::write(&key_path, key).await.map_err(storage_err)?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let permissions = std::fs::Permissions::from_mode(0o600);
            let _ = std::fs::set_permissions(&key_path, permissions);
        }
        Ok(key)
    }

    /// Store a value under a stable key, AEAD-sealed
    pub async fn put(&self, key: &str, value: &[u8]) -> Result<()> {
        let mut nonce_bytes = [0u8; NONCE_SIZE];
        rand::rngs::OsRng.fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);

        let ciphertext = self
            .cipher
            .encrypt(nonce, value)
            .map_err(|_| Error::Storage("encryption failed".into()))?;

        let mut sealed = nonce_bytes.to_vec();
        sealed.extend_from_slice(&ciphertext);
        fs::write(self.entry_path(key), sealed)
            .await
            .map_err(storage_err)
    }

    /// Fetch and unseal a value; `None` when the key was never written
    pub async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let path = self.entry_path(key);
        let sealed = match fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(storage_err(e)),
        };
        if sealed.len() < NONCE_SIZE {
            return Err(Error::Storage(format!("corrupt entry {}", key)));
        }
        let (nonce_bytes, ciphertext) = sealed.split_at(NONCE_SIZE);
        let plaintext = self
            .cipher
            .decrypt(Nonce::from_slice(nonce_bytes), ciphertext)
            .map_err(|_| Error::Storage(format!("authentication failed for {}", key)))?;
        Ok(Some(plaintext))
    }

    pub async fn delete(&self, key: &str) -> Result<()> {
        let path = self.entry_path(key);
        match fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(storage_err(e)),
        }
    }

    /// Persist an incoming file blob under `files/incoming/<random>-<name>`
    /// with the name sanitized to a safe character set.
    pub async fn save_incoming_file(&self, file_name: &str, content: &[u8]) -> Result<PathBuf> {
        let sanitized: String = file_name
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_') {
                    c
                } else {
                    '_'
                }
            })
            .take(128)
            .collect();
        let sanitized = if sanitized.is_empty() {
            "unnamed".to_string()
        } else {
            sanitized
        };

        let mut random = [0u8; 8];
        rand::rngs::OsRng.fill_bytes(&mut random);
        let path = self
            .root
            .join(INCOMING_DIR)
            .join(format!("{}-{}", hex::encode(random), sanitized));
        fs::write(&path, content).await.map_err(storage_err)?;
        Ok(path)
    }

    /// Panic-clear: remove every sealed entry and the master key
    pub async fn wipe(&self) -> Result<()> {
        let kv = self.root.join(KV_DIR);
        if kv.exists() {
            fs::remove_dir_all(&kv).await.map_err(storage_err)?;
            fs::create_dir_all(&kv).await.map_err(storage_err)?;
        }
        self.delete_root_file(MASTER_KEY_FILE).await
    }

    async fn delete_root_file(&self, name: &str) -> Result<()> {
        let path = self.root.join(name);
        match fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(storage_err(e)),
        }
    }

    fn entry_path(&self, key: &str) -> PathBuf {
        // Keys are fixed identifiers chosen by this crate, hex-armored so
        // they can never traverse the directory
        self.root.join(KV_DIR).join(hex::encode(key.as_bytes()))
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

fn storage_err(e: std::io::Error) -> Error {
    Error::Storage(e.to_string())
}
