//! agg_artifact_store
//!
//! Per-route/per-format artifact persistence: a content-addressed
//! "artifacts/" tree used purely for change detection, a "output/" tree
//! holding the latest bytes per (route, format) for downstream publish, and
//! an "archive/" tree of timestamped snapshots with retention pruning.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use agg_common::sha256_hex;

#[derive(Debug, thiserror::Error)]
pub enum ArtifactStoreError {
    #[error("io: {0}")]
    Io(#[from] io::Error),
    #[error("artifact not found: {route}.{format}@{hash}")]
    NotFound {
        route: String,
        format: String,
        hash: String,
    },
}

#[derive(Clone, Debug)]
pub struct ArtifactStore {
    root: PathBuf,
}

impl ArtifactStore {
    pub fn new(root: impl Into<PathBuf>) -> Result<Self, ArtifactStoreError> {
        let root = root.into();
        for sub in ["artifacts", "output", "archive"] {
            fs::create_dir_all(root.join(sub))?;
        }
        Ok(Self { root })
    }

    fn artifacts_dir(&self, route: &str) -> PathBuf {
        self.root.join("artifacts").join(route)
    }

    /// Persist bytes under the content-addressed artifacts tree, returning
    /// the hex sha256 digest. Used for change detection, not for serving.
    pub fn save_artifact(
        &self,
        route: &str,
        format: &str,
        bytes: &[u8],
    ) -> Result<String, ArtifactStoreError> {
        let hash = sha256_hex(bytes);
        let dir = self.artifacts_dir(route);
        fs::create_dir_all(&dir)?;
        let path = dir.join(format!("{hash}.{format}"));
        if !path.exists() {
            atomic_write(&dir, &path, bytes)?;
        }
        Ok(hash)
    }

    pub fn get_artifact(
        &self,
        route: &str,
        format: &str,
        hash: &str,
    ) -> Result<Vec<u8>, ArtifactStoreError> {
        let path = self.artifacts_dir(route).join(format!("{hash}.{format}"));
        fs::read(&path).map_err(|e| {
            if e.kind() == io::ErrorKind::NotFound {
                ArtifactStoreError::NotFound {
                    route: route.to_string(),
                    format: format.to_string(),
                    hash: hash.to_string(),
                }
            } else {
                ArtifactStoreError::Io(e)
            }
        })
    }

    /// Write the user-facing "latest" output file, filename `<name>`
    /// (already composed by the caller, e.g. "route.npvt" or
    /// "route_npvt_decoded.json"), overwriting any prior content, and mirror
    /// a timestamped copy into the archive tree.
    pub fn save_output(&self, name: &str, bytes: &[u8]) -> Result<PathBuf, ArtifactStoreError> {
        let out_dir = self.root.join("output");
        let out_path = out_dir.join(name);
        atomic_write(&out_dir, &out_path, bytes)?;

        let epoch = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs();
        let archive_dir = self.root.join("archive");
        let archive_name = match name.rsplit_once('.') {
            Some((stem, ext)) => format!("{stem}_{epoch}.{ext}"),
            None => format!("{name}_{epoch}"),
        };
        let archive_path = archive_dir.join(archive_name);
        atomic_write(&archive_dir, &archive_path, bytes)?;

        Ok(out_path)
    }

    pub fn output_dir(&self) -> PathBuf {
        self.root.join("output")
    }

    /// Remove stale files from the output tree: anything whose filename
    /// starts with one of `route_prefixes` but is not in `keep_names`.
    pub fn cleanup_stale_outputs(
        &self,
        route_prefixes: &[String],
        keep_names: &[String],
    ) -> Result<usize, ArtifactStoreError> {
        let out_dir = self.output_dir();
        let mut removed = 0usize;
        for entry in fs::read_dir(&out_dir)? {
            let entry = entry?;
            let name = entry.file_name();
            let name = name.to_string_lossy().to_string();
            let matches_prefix = route_prefixes.iter().any(|p| name.starts_with(p.as_str()));
            if matches_prefix && !keep_names.iter().any(|k| k == &name) {
                fs::remove_file(entry.path())?;
                removed += 1;
            }
        }
        Ok(removed)
    }

    /// Delete archive entries older than `retention_days`.
    pub fn prune_archive(&self, retention_days: u64) -> Result<usize, ArtifactStoreError> {
        let archive_dir = self.root.join("archive");
        let now = SystemTime::now();
        let retention = std::time::Duration::from_secs(retention_days * 24 * 3600);
        let mut removed = 0usize;
        for entry in fs::read_dir(&archive_dir)? {
            let entry = entry?;
            let path = entry.path();
            let modified = entry.metadata()?.modified()?;
            if let Ok(age) = now.duration_since(modified) {
                if age > retention {
                    fs::remove_file(&path)?;
                    removed += 1;
                }
            }
        }
        Ok(removed)
    }

    /// List archive files within the last `days`, newest first.
    pub fn list_archive(&self, days: u64) -> Result<Vec<PathBuf>, ArtifactStoreError> {
        let archive_dir = self.root.join("archive");
        let now = SystemTime::now();
        let window = std::time::Duration::from_secs(days * 24 * 3600);
        let mut entries: Vec<(SystemTime, PathBuf)> = Vec::new();
        for entry in fs::read_dir(&archive_dir)? {
            let entry = entry?;
            let modified = entry.metadata()?.modified()?;
            if now.duration_since(modified).unwrap_or_default() <= window {
                entries.push((modified, entry.path()));
            }
        }
        entries.sort_by(|a, b| b.0.cmp(&a.0));
        Ok(entries.into_iter().map(|(_, p)| p).collect())
    }
}

fn atomic_write(dir: &Path, final_path: &Path, bytes: &[u8]) -> Result<(), ArtifactStoreError> {
    fs::create_dir_all(dir)?;
    let tmp_dir = dir.join(".tmp");
    fs::create_dir_all(&tmp_dir)?;
    let tmp_path = unique_tmp_path(&tmp_dir)?;
    {
        use io::Write;
        let mut f = fs::File::create(&tmp_path)?;
        f.write_all(bytes)?;
        f.sync_all()?;
    }
    fs::rename(&tmp_path, final_path)?;
    if let Ok(dirf) = fs::File::open(dir) {
        let _ = dirf.sync_all();
    }
    Ok(())
}

fn unique_tmp_path(tmp_dir: &Path) -> Result<PathBuf, ArtifactStoreError> {
    let mut i = 0u64;
    loop {
        let candidate = tmp_dir.join(format!("artifact-{i}.tmp"));
        match fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&candidate)
        {
            Ok(_) => return Ok(candidate),
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => i = i.wrapping_add(1),
            Err(e) => return Err(ArtifactStoreError::Io(e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn save_artifact_is_content_addressed() {
        let dir = tempfile::tempdir().unwrap();
        let store = ArtifactStore::new(dir.path()).unwrap();
        let h1 = store.save_artifact("r1", "npvt", b"abc").unwrap();
        let h2 = store.save_artifact("r1", "npvt", b"abc").unwrap();
        assert_eq!(h1, h2);
        assert_eq!(store.get_artifact("r1", "npvt", &h1).unwrap(), b"abc");
    }

    #[test]
    fn save_output_writes_latest_and_archive() {
        let dir = tempfile::tempdir().unwrap();
        let store = ArtifactStore::new(dir.path()).unwrap();
        let path = store.save_output("r1.npvt", b"hello").unwrap();
        assert_eq!(fs::read(&path).unwrap(), b"hello");
        let archived = store.list_archive(365).unwrap();
        assert_eq!(archived.len(), 1);
    }

    #[test]
    fn cleanup_stale_outputs_only_touches_matching_prefix() {
        let dir = tempfile::tempdir().unwrap();
        let store = ArtifactStore::new(dir.path()).unwrap();
        store.save_output("r1.npvt", b"a").unwrap();
        store.save_output("r1.old", b"b").unwrap();
        store.save_output("other.conf", b"c").unwrap();
        let removed = store
            .cleanup_stale_outputs(&["r1".to_string()], &["r1.npvt".to_string()])
            .unwrap();
        assert_eq!(removed, 1);
        assert!(store.output_dir().join("r1.npvt").exists());
        assert!(!store.output_dir().join("r1.old").exists());
        assert!(store.output_dir().join("other.conf").exists());
    }
}
