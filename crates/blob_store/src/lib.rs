//! agg_blob_store
//!
//! Content-addressed raw blob store. Bytes in, sha256 hex out. Writes
//! are atomic: a uniquely-named temp file under `<root>/.tmp`, fsync, rename
//! into its sharded final path. No encryption, no compression — this store
//! only ever holds already-public proxy configuration payloads.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use agg_common::sha256_hex;

#[derive(Debug, thiserror::Error)]
pub enum BlobStoreError {
    #[error("io: {0}")]
    Io(#[from] io::Error),
    #[error("blob not found: {0}")]
    NotFound(String),
}

#[derive(Clone, Debug)]
pub struct BlobStore {
    root: PathBuf,
}

impl BlobStore {
    pub fn new(root: impl Into<PathBuf>) -> Result<Self, BlobStoreError> {
        let root = root.into();
        fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    /// Sharded path `<root>/<shard2>/<hash>` for a given hex digest.
    pub fn path_for(&self, hash_hex: &str) -> PathBuf {
        self.root.join(&hash_hex[0..2]).join(hash_hex)
    }

    /// Store bytes, returning the bare hex sha256 digest. Idempotent.
    pub fn save(&self, bytes: &[u8]) -> Result<String, BlobStoreError> {
        let hash_hex = sha256_hex(bytes);
        let final_path = self.path_for(&hash_hex);
        if final_path.exists() {
            return Ok(hash_hex);
        }
        if let Some(parent) = final_path.parent() {
            fs::create_dir_all(parent)?;
        }

        let tmp_dir = self.root.join(".tmp");
        fs::create_dir_all(&tmp_dir)?;
        let tmp_path = unique_tmp_path(&tmp_dir)?;
        {
            let mut f = fs::File::create(&tmp_path)?;
            use io::Write;
            f.write_all(bytes)?;
            f.sync_all()?;
        }
        match fs::rename(&tmp_path, &final_path) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                let _ = fs::remove_file(&tmp_path);
            }
            Err(e) => return Err(BlobStoreError::Io(e)),
        }
        if let Some(parent) = final_path.parent() {
            if let Ok(dirf) = fs::File::open(parent) {
                let _ = dirf.sync_all();
            }
        }
        Ok(hash_hex)
    }

    pub fn exists(&self, hash_hex: &str) -> bool {
        self.path_for(hash_hex).exists()
    }

    pub fn get(&self, hash_hex: &str) -> Result<Vec<u8>, BlobStoreError> {
        let path = self.path_for(hash_hex);
        match fs::read(&path) {
            Ok(bytes) => Ok(bytes),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                Err(BlobStoreError::NotFound(hash_hex.to_string()))
            }
            Err(e) => Err(BlobStoreError::Io(e)),
        }
    }

    /// Remove the blob for `hash_hex`, pruning now-empty shard directories.
    /// Missing blobs are not an error: callers prune from a set of candidate
    /// hashes and some may already be gone.
    pub fn remove(&self, hash_hex: &str) -> Result<(), BlobStoreError> {
        let path = self.path_for(hash_hex);
        match fs::remove_file(&path) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(BlobStoreError::Io(e)),
        }
        if let Some(shard_dir) = path.parent() {
            let _ = fs::remove_dir(shard_dir);
        }
        Ok(())
    }

    /// Remove every blob whose hash is in `prunable`, returning the count
    /// actually removed.
    pub fn prune(&self, prunable: impl IntoIterator<Item = String>) -> Result<usize, BlobStoreError> {
        let mut removed = 0usize;
        for hash in prunable {
            if self.exists(&hash) {
                self.remove(&hash)?;
                removed += 1;
            }
        }
        Ok(removed)
    }
}

fn unique_tmp_path(tmp_dir: &Path) -> Result<PathBuf, BlobStoreError> {
    let mut i = 0u64;
    loop {
        let candidate = tmp_dir.join(format!("blob-{i}.tmp"));
        match fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&candidate)
        {
            Ok(_) => return Ok(candidate),
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                i = i.wrapping_add(1);
            }
            Err(e) => return Err(BlobStoreError::Io(e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn save_is_idempotent_and_sharded() {
        let dir = tempfile::tempdir().unwrap();
        let store = BlobStore::new(dir.path()).unwrap();
        let h1 = store.save(b"hello world").unwrap();
        let h2 = store.save(b"hello world").unwrap();
        assert_eq!(h1, h2);
        assert!(store.exists(&h1));
        let path = store.path_for(&h1);
        assert!(path.starts_with(dir.path()));
        assert_eq!(store.get(&h1).unwrap(), b"hello world");
    }

    #[test]
    fn missing_blob_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let store = BlobStore::new(dir.path()).unwrap();
        let err = store.get("0000000000000000000000000000000000000000000000000000000000000000");
        assert!(matches!(err, Err(BlobStoreError::NotFound(_))));
    }

    #[test]
    fn prune_removes_only_requested_hashes() {
        let dir = tempfile::tempdir().unwrap();
        let store = BlobStore::new(dir.path()).unwrap();
        let h1 = store.save(b"one").unwrap();
        let h2 = store.save(b"two").unwrap();
        let removed = store.prune(vec![h1.clone()]).unwrap();
        assert_eq!(removed, 1);
        assert!(!store.exists(&h1));
        assert!(store.exists(&h2));
    }
}
