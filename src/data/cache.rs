//! Local cache of problem data files
//!
//! Every data set lives in `<root>/<problem>/<digest>/`, where the digest
//! is the SHA-256 of the problem's concatenated remote file list, and holds
//! a `.data-<digest>` marker. A set is downloaded into a staging directory
//! and renamed into place, so a judgement never sees a half-populated
//! directory, and once installed it never moves.
//!
//! Judgements hold a [`DataSet`] lease while they read the files.
//! Superseded sets of a problem are pruned only when no lease is held.

use std::collections::HashMap;
use std::io::Cursor;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use sha2::{Digest, Sha256};
use tokio::sync::{OwnedRwLockReadGuard, RwLock};
use tracing::{debug, info, warn};

use crate::core::utils::{extract_zip, sanitize_content};
use crate::core::JudgeError;
use crate::storage::RemoteStore;

/// Executable checker shipped with the data files
pub const SPECIAL_JUDGE_FILE: &str = "spj";

/// Per-problem synchronization
#[derive(Default)]
struct ProblemSlot {
    /// Serializes downloads and pruning
    install: tokio::sync::Mutex<()>,
    /// Read-held by every live `DataSet`
    usage: Arc<RwLock<()>>,
}

/// An installed data set, kept on disk for as long as this value lives
pub struct DataSet {
    dir: PathBuf,
    _lease: OwnedRwLockReadGuard<()>,
}

impl DataSet {
    pub fn path(&self) -> &Path {
        &self.dir
    }
}

pub struct DataCache {
    root: PathBuf,
    store: Arc<dyn RemoteStore>,
    slots: Mutex<HashMap<i64, Arc<ProblemSlot>>>,
}

impl DataCache {
    pub fn new(root: impl Into<PathBuf>, store: Arc<dyn RemoteStore>) -> Self {
        Self {
            root: root.into(),
            store,
            slots: Mutex::new(HashMap::new()),
        }
    }

    fn slot_for(&self, problem_id: i64) -> Arc<ProblemSlot> {
        let mut slots = match self.slots.lock() {
            Ok(slots) => slots,
            Err(poisoned) => poisoned.into_inner(),
        };
        slots.entry(problem_id).or_default().clone()
    }

    /// Make sure the data files of a problem are present locally
    ///
    /// Concurrent calls for the same problem are serialized; only the first
    /// one downloads. The returned lease keeps the set from being pruned.
    pub async fn ensure(&self, problem_id: i64, files: &[String]) -> Result<DataSet> {
        let slot = self.slot_for(problem_id);
        let _install = slot.install.lock().await;

        let problem_dir = self.root.join(problem_id.to_string());
        let digest = data_set_digest(files);
        let dir = problem_dir.join(&digest);

        if dir.join(marker_name(&digest)).is_file() {
            debug!("Test data for problem {} is cached", problem_id);
        } else {
            if dir.exists() {
                // left behind without a marker, never handed out
                tokio::fs::remove_dir_all(&dir)
                    .await
                    .with_context(|| format!("Failed to remove {}", dir.display()))?;
            }
            self.install(problem_id, files, &digest, &dir).await?;
        }

        // nobody reads the problem's data right now, older sets can go
        if let Ok(_exclusive) = slot.usage.clone().try_write_owned() {
            prune(&problem_dir, &digest).await;
        }

        let lease = slot.usage.clone().read_owned().await;
        Ok(DataSet { dir, _lease: lease })
    }

    async fn install(
        &self,
        problem_id: i64,
        files: &[String],
        digest: &str,
        dir: &Path,
    ) -> Result<()> {
        info!(
            "Fetching {} data file(s) for problem {}",
            files.len(),
            problem_id
        );
        tokio::fs::create_dir_all(&self.root)
            .await
            .with_context(|| format!("Failed to create cache root {}", self.root.display()))?;
        let staging = tempfile::Builder::new()
            .prefix(".staging-")
            .tempdir_in(&self.root)
            .context("Failed to create staging directory")?;

        for key in files {
            self.fetch_into(key, staging.path()).await?;
        }

        let spj = staging.path().join(SPECIAL_JUDGE_FILE);
        if spj.is_file() {
            tokio::fs::set_permissions(&spj, std::fs::Permissions::from_mode(0o755)).await?;
        }
        tokio::fs::write(staging.path().join(marker_name(digest)), files.join("\n")).await?;

        if let Some(parent) = dir.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        tokio::fs::rename(staging.path(), dir)
            .await
            .with_context(|| format!("Failed to install {}", dir.display()))?;

        info!("Test data for problem {} ready at {}", problem_id, dir.display());
        Ok(())
    }

    async fn fetch_into(&self, key: &str, staging: &Path) -> Result<()> {
        let name = key.rsplit('/').next().unwrap_or(key);
        if name.is_empty() || name == "." || name == ".." {
            return Err(JudgeError::InvalidPath(key.to_string()).into());
        }

        let data = self.store.download(key).await?;
        debug!("Downloaded {} ({} bytes)", key, data.len());

        if name.ends_with(".zip") {
            let dest = staging.to_path_buf();
            let extracted =
                tokio::task::spawn_blocking(move || extract_zip(Cursor::new(data), &dest))
                    .await
                    .context("Archive extraction task failed")?
                    .with_context(|| format!("Failed to extract {}", key))?;
            debug!("Extracted {} file(s) from {}", extracted.len(), key);
        } else {
            tokio::fs::write(staging.join(name), sanitize_content(data))
                .await
                .with_context(|| format!("Failed to store {}", key))?;
        }
        Ok(())
    }
}

/// Directory name identifying a data set
fn data_set_digest(files: &[String]) -> String {
    let mut hasher = Sha256::new();
    for file in files {
        hasher.update(file.as_bytes());
    }
    format!("{:x}", hasher.finalize())
}

fn marker_name(digest: &str) -> String {
    format!(".data-{}", digest)
}

/// Remove every data set of a problem except `keep`
async fn prune(problem_dir: &Path, keep: &str) {
    let mut entries = match tokio::fs::read_dir(problem_dir).await {
        Ok(entries) => entries,
        Err(_) => return,
    };
    while let Ok(Some(entry)) = entries.next_entry().await {
        if entry.file_name() == keep {
            continue;
        }
        let path = entry.path();
        match tokio::fs::remove_dir_all(&path).await {
            Ok(()) => debug!("Pruned superseded data set {}", path.display()),
            Err(e) => warn!("Failed to prune {}: {}", path.display(), e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingStore {
        files: HashMap<String, Vec<u8>>,
        downloads: AtomicUsize,
    }

    #[async_trait]
    impl RemoteStore for CountingStore {
        async fn download(&self, key: &str) -> Result<Vec<u8>> {
            self.downloads.fetch_add(1, Ordering::SeqCst);
            self.files
                .get(key)
                .cloned()
                .ok_or_else(|| anyhow::anyhow!("no such key {}", key))
        }
    }

    fn store(files: &[(&str, &[u8])]) -> Arc<CountingStore> {
        Arc::new(CountingStore {
            files: files
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_vec()))
                .collect(),
            downloads: AtomicUsize::new(0),
        })
    }

    #[tokio::test]
    async fn test_ensure_downloads_once() {
        let root = tempfile::tempdir().unwrap();
        let store = store(&[("p/1.in", b"1 2\r\n"), ("p/1.out", b"3\r\n")]);
        let cache = DataCache::new(root.path(), store.clone());
        let files = vec!["p/1.in".to_string(), "p/1.out".to_string()];

        let first = cache.ensure(7, &files).await.unwrap();
        assert_eq!(std::fs::read(first.path().join("1.in")).unwrap(), b"1 2\n");
        assert_eq!(store.downloads.load(Ordering::SeqCst), 2);

        // leases are shared
        let again = cache.ensure(7, &files).await.unwrap();
        assert_eq!(again.path(), first.path());
        assert_eq!(store.downloads.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_data_set_survives_refresh_while_leased() {
        let root = tempfile::tempdir().unwrap();
        let store = store(&[
            ("old/1.in", b"a"),
            ("old/1.out", b"a"),
            ("new/2.in", b"b"),
            ("new/2.out", b"b"),
        ]);
        let cache = DataCache::new(root.path(), store);
        let old = vec!["old/1.in".to_string(), "old/1.out".to_string()];
        let new = vec!["new/2.in".to_string(), "new/2.out".to_string()];

        let running = cache.ensure(1, &old).await.unwrap();
        let refreshed = cache.ensure(1, &new).await.unwrap();
        assert_ne!(running.path(), refreshed.path());
        assert!(refreshed.path().join("2.in").exists());
        assert!(!refreshed.path().join("1.in").exists());
        // the judgement still reading the old set keeps it
        assert_eq!(std::fs::read(running.path().join("1.out")).unwrap(), b"a");

        let old_dir = running.path().to_path_buf();
        drop(running);
        drop(refreshed);

        let current = cache.ensure(1, &new).await.unwrap();
        assert!(!old_dir.exists());
        let sets: Vec<_> = std::fs::read_dir(root.path().join("1"))
            .unwrap()
            .map(|e| e.unwrap().path())
            .collect();
        assert_eq!(sets, vec![current.path().to_path_buf()]);
        assert_eq!(std::fs::read_dir(root.path()).unwrap().count(), 1);
    }

    #[tokio::test]
    async fn test_set_without_marker_is_reinstalled() {
        let root = tempfile::tempdir().unwrap();
        let store = store(&[("p/1.in", b"x"), ("p/1.out", b"y")]);
        let cache = DataCache::new(root.path(), store.clone());
        let files = vec!["p/1.in".to_string(), "p/1.out".to_string()];

        let dir = cache.ensure(8, &files).await.unwrap().path().to_path_buf();
        std::fs::remove_file(dir.join(marker_name(&data_set_digest(&files)))).unwrap();
        std::fs::remove_file(dir.join("1.out")).unwrap();

        let data = cache.ensure(8, &files).await.unwrap();
        assert_eq!(store.downloads.load(Ordering::SeqCst), 4);
        assert_eq!(std::fs::read(data.path().join("1.out")).unwrap(), b"y");
    }

    #[tokio::test]
    async fn test_ensure_marks_special_judge_executable() {
        let root = tempfile::tempdir().unwrap();
        let store = store(&[("p/spj", b"#!/bin/sh\nexit 0\n")]);
        let cache = DataCache::new(root.path(), store);

        let data = cache.ensure(3, &["p/spj".to_string()]).await.unwrap();
        let mode = std::fs::metadata(data.path().join(SPECIAL_JUDGE_FILE))
            .unwrap()
            .permissions()
            .mode();
        assert_eq!(mode & 0o777, 0o755);
    }

    #[tokio::test]
    async fn test_failed_download_leaves_no_directory() {
        let root = tempfile::tempdir().unwrap();
        let cache = DataCache::new(root.path(), store(&[]));
        assert!(cache.ensure(4, &["p/missing".to_string()]).await.is_err());
        assert!(!root.path().join("4").exists());
        assert_eq!(std::fs::read_dir(root.path()).unwrap().count(), 0);
    }

    #[test]
    fn test_digest_depends_on_file_list() {
        let a = data_set_digest(&["x".to_string()]);
        let b = data_set_digest(&["y".to_string()]);
        assert_ne!(a, b);
        assert_eq!(a.len(), 64);
        assert_eq!(marker_name(&a), format!(".data-{}", a));
    }
}
