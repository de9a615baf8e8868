//! Object storage for checkpoint chunks and manifests

use crate::error::{FleetError, Result};
use crate::retry::transient;
use async_trait::async_trait;
use dashmap::DashMap;
use std::collections::BTreeMap;
use std::path::{Component, Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use tracing::debug;

/// Flat key/value blob storage
///
/// Keys are `/`-separated strings; the pipeline owns the naming scheme.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn put(&self, key: &str, data: Vec<u8>) -> Result<()>;

    /// `None` when the key does not exist
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;

    /// All keys starting with `prefix`, sorted
    async fn list(&self, prefix: &str) -> Result<Vec<String>>;

    /// Deleting a missing key succeeds
    async fn delete(&self, key: &str) -> Result<()>;
}

/// Directory-backed store, one file per key
pub struct FsObjectStore {
    root: PathBuf,
}

impl FsObjectStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, key: &str) -> Result<PathBuf> {
        let relative = Path::new(key);
        let safe = !key.is_empty()
            && relative
                .components()
                .all(|c| matches!(c, Component::Normal(_)));
        if !safe {
            return Err(FleetError::storage(key, "invalid object key"));
        }
        Ok(self.root.join(relative))
    }
}

#[async_trait]
impl ObjectStore for FsObjectStore {
    async fn put(&self, key: &str, data: Vec<u8>) -> Result<()> {
        let path = self.path_for(key)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| FleetError::storage(key, e))?;
        }

        // Write beside the target, then rename so readers never see a torn object
        let tmp = path.with_extension("partial");
        tokio::fs::write(&tmp, &data)
            .await
            .map_err(|e| FleetError::storage(key, e))?;
        tokio::fs::rename(&tmp, &path)
            .await
            .map_err(|e| FleetError::storage(key, e))?;

        debug!(key = %key, bytes = data.len(), "Stored object");
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let path = self.path_for(key)?;
        match tokio::fs::read(&path).await {
            Ok(data) => Ok(Some(data)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(FleetError::storage(key, e)),
        }
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>> {
        let mut keys = Vec::new();
        let mut pending = vec![self.root.clone()];

        while let Some(dir) = pending.pop() {
            let mut entries = match tokio::fs::read_dir(&dir).await {
                Ok(entries) => entries,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => return Err(FleetError::storage(prefix, e)),
            };

            while let Some(entry) = entries
                .next_entry()
                .await
                .map_err(|e| FleetError::storage(prefix, e))?
            {
                let path = entry.path();
                let file_type = entry
                    .file_type()
                    .await
                    .map_err(|e| FleetError::storage(prefix, e))?;

                if file_type.is_dir() {
                    pending.push(path);
                    continue;
                }
                if path.extension().map(|e| e == "partial").unwrap_or(false) {
                    continue;
                }

                let Ok(relative) = path.strip_prefix(&self.root) else {
                    continue;
                };
                let key = relative
                    .components()
                    .map(|c| c.as_os_str().to_string_lossy())
                    .collect::<Vec<_>>()
                    .join("/");
                if key.starts_with(prefix) {
                    keys.push(key);
                }
            }
        }

        keys.sort();
        Ok(keys)
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let path = self.path_for(key)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(FleetError::storage(key, e)),
        }
    }
}

/// In-process store with failure injection for tests and dry runs
#[derive(Default)]
pub struct MemoryObjectStore {
    objects: Mutex<BTreeMap<String, Vec<u8>>>,
    /// Remaining accepted puts, unlimited when unset
    put_budget: Mutex<Option<usize>>,
    transient_get_failures: DashMap<String, u32>,
    puts: AtomicUsize,
    gets: AtomicUsize,
}

impl MemoryObjectStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Accept only the next `n` puts, failing every later one
    pub fn fail_puts_after(&self, n: usize) {
        if let Ok(mut budget) = self.put_budget.lock() {
            *budget = Some(n);
        }
    }

    /// Fail the next `times` reads of `key` with a transient error
    pub fn fail_gets(&self, key: &str, times: u32) {
        self.transient_get_failures.insert(key.to_string(), times);
    }

    /// Replace an object's bytes without going through `put`
    pub fn corrupt(&self, key: &str, data: Vec<u8>) {
        if let Ok(mut objects) = self.objects.lock() {
            objects.insert(key.to_string(), data);
        }
    }

    pub fn keys(&self) -> Vec<String> {
        self.objects
            .lock()
            .map(|o| o.keys().cloned().collect())
            .unwrap_or_default()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.objects
            .lock()
            .map(|o| o.contains_key(key))
            .unwrap_or(false)
    }

    pub fn put_count(&self) -> usize {
        self.puts.load(Ordering::SeqCst)
    }

    pub fn get_count(&self) -> usize {
        self.gets.load(Ordering::SeqCst)
    }

    fn poisoned(key: &str) -> FleetError {
        FleetError::storage(key, "memory store lock poisoned")
    }
}

#[async_trait]
impl ObjectStore for MemoryObjectStore {
    async fn put(&self, key: &str, data: Vec<u8>) -> Result<()> {
        {
            let mut budget = self.put_budget.lock().map_err(|_| Self::poisoned(key))?;
            if let Some(remaining) = budget.as_mut() {
                if *remaining == 0 {
                    return Err(FleetError::storage(key, "write rejected"));
                }
                *remaining -= 1;
            }
        }

        self.puts.fetch_add(1, Ordering::SeqCst);
        self.objects
            .lock()
            .map_err(|_| Self::poisoned(key))?
            .insert(key.to_string(), data);
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        self.gets.fetch_add(1, Ordering::SeqCst);

        if let Some(mut remaining) = self.transient_get_failures.get_mut(key) {
            if *remaining > 0 {
                *remaining -= 1;
                return Err(transient(key));
            }
        }

        Ok(self
            .objects
            .lock()
            .map_err(|_| Self::poisoned(key))?
            .get(key)
            .cloned())
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>> {
        Ok(self
            .objects
            .lock()
            .map_err(|_| Self::poisoned(prefix))?
            .keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.objects
            .lock()
            .map_err(|_| Self::poisoned(key))?
            .remove(key);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_fs_store_put_get_list_delete() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsObjectStore::new(dir.path());

        store.put("snapshots/a/chunk_000", vec![1, 2, 3]).await.unwrap();
        store.put("snapshots/a/manifest.json", b"{}".to_vec()).await.unwrap();
        store.put("snapshots/b/chunk_000", vec![9]).await.unwrap();

        assert_eq!(
            store.get("snapshots/a/chunk_000").await.unwrap(),
            Some(vec![1, 2, 3])
        );
        assert_eq!(store.get("snapshots/a/chunk_001").await.unwrap(), None);
        assert_eq!(
            store.list("snapshots/a/").await.unwrap(),
            vec!["snapshots/a/chunk_000", "snapshots/a/manifest.json"]
        );

        store.delete("snapshots/a/chunk_000").await.unwrap();
        store.delete("snapshots/a/chunk_000").await.unwrap();
        assert_eq!(store.list("snapshots/a/").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_fs_store_rejects_escaping_keys() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsObjectStore::new(dir.path());

        assert!(store.put("../outside", vec![0]).await.is_err());
        assert!(store.get("/etc/passwd").await.is_err());
    }

    #[tokio::test]
    async fn test_memory_store_failure_injection() {
        let store = MemoryObjectStore::new();
        store.fail_puts_after(1);

        store.put("k1", vec![1]).await.unwrap();
        assert!(store.put("k2", vec![2]).await.is_err());
        assert_eq!(store.keys(), vec!["k1"]);

        store.fail_gets("k1", 1);
        assert!(store.get("k1").await.unwrap_err().is_transient());
        assert_eq!(store.get("k1").await.unwrap(), Some(vec![1]));
    }
}
