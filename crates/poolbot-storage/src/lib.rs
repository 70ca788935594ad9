//! Poolbot Storage
//!
//! Durable credential cache: account identity -> session credential, kept in a
//! JSON document on disk and rewritten on every change

use anyhow::{anyhow, Context, Result};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::sync::Mutex;
use tracing::{debug, warn};

pub struct CredentialCache {
    path: PathBuf,
    entries: Mutex<BTreeMap<String, String>>,
}

impl CredentialCache {
    /// Loads the cache file. A missing or unreadable file yields an empty
    /// cache; it only means more derivations are needed.
    pub fn load<P: AsRef<Path>>(path: P) -> Self {
        let path = path.as_ref().to_path_buf();
        let entries = match Self::read_entries(&path) {
            Ok(entries) => {
                debug!(path = %path.display(), entries = entries.len(), "Credential cache loaded");
                entries
            }
            Err(err) => {
                if path.exists() {
                    warn!(
                        path = %path.display(),
                        error = %err,
                        "Credential cache unreadable, starting empty"
                    );
                }
                BTreeMap::new()
            }
        };

        Self {
            path,
            entries: Mutex::new(entries),
        }
    }

    fn read_entries(path: &Path) -> Result<BTreeMap<String, String>> {
        let content = std::fs::read_to_string(path)?;
        if content.trim().is_empty() {
            return Ok(BTreeMap::new());
        }
        let parsed: BTreeMap<String, String> = serde_json::from_str(&content)
            .map_err(|e| anyhow!("invalid cache document {}: {}", path.display(), e))?;
        Ok(parsed)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn get(&self, key: &str) -> Option<String> {
        self.entries
            .lock()
            .await
            .get(key)
            .filter(|value| !value.is_empty())
            .cloned()
    }

    /// Stores the credential and persists the whole document. The in-memory
    /// value is kept even when the disk write fails.
    pub async fn set(&self, key: &str, value: &str) -> Result<()> {
        let mut entries = self.entries.lock().await;
        entries.insert(key.to_string(), value.to_string());
        self.persist(&entries).await
    }

    pub async fn remove(&self, key: &str) -> Result<bool> {
        let mut entries = self.entries.lock().await;
        if entries.remove(key).is_none() {
            return Ok(false);
        }
        self.persist(&entries).await?;
        Ok(true)
    }

    pub async fn clear(&self) -> Result<usize> {
        let mut entries = self.entries.lock().await;
        let removed = entries.len();
        entries.clear();
        self.persist(&entries).await?;
        Ok(removed)
    }

    pub async fn keys(&self) -> Vec<String> {
        self.entries.lock().await.keys().cloned().collect()
    }

    pub async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.lock().await.is_empty()
    }

    async fn persist(&self, entries: &BTreeMap<String, String>) -> Result<()> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)
                .await
                .with_context(|| format!("create cache dir {}", parent.display()))?;
        }

        let body = serde_json::to_string_pretty(entries)?;
        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, body)
            .await
            .with_context(|| format!("write {}", tmp.display()))?;
        fs::rename(&tmp, &self.path)
            .await
            .with_context(|| format!("replace {}", self.path.display()))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::CredentialCache;
    use std::time::{SystemTime, UNIX_EPOCH};

    fn temp_cache_path(name: &str) -> std::path::PathBuf {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("clock")
            .as_nanos();
        std::env::temp_dir().join(format!("poolbot-{}-{}.json", name, nanos))
    }

    #[tokio::test]
    async fn set_persists_and_reload_sees_value() {
        let path = temp_cache_path("persist");
        let cache = CredentialCache::load(&path);
        assert!(cache.get("a@example.com").await.is_none());

        cache.set("a@example.com", "tok-a").await.expect("set");

        let reloaded = CredentialCache::load(&path);
        assert_eq!(reloaded.get("a@example.com").await.as_deref(), Some("tok-a"));
        let _ = std::fs::remove_file(&path);
    }

    #[tokio::test]
    async fn corrupt_file_falls_back_to_empty_cache() {
        let path = temp_cache_path("corrupt");
        std::fs::write(&path, "{not json").expect("write");

        let cache = CredentialCache::load(&path);
        assert!(cache.is_empty().await);

        cache.set("b", "tok-b").await.expect("set overwrites corrupt file");
        let reloaded = CredentialCache::load(&path);
        assert_eq!(reloaded.get("b").await.as_deref(), Some("tok-b"));
        let _ = std::fs::remove_file(&path);
    }

    #[tokio::test]
    async fn concurrent_sets_keep_every_key() {
        let path = temp_cache_path("concurrent");
        let cache = std::sync::Arc::new(CredentialCache::load(&path));

        let mut tasks = Vec::new();
        for i in 0..8 {
            let cache = cache.clone();
            tasks.push(tokio::spawn(async move {
                cache
                    .set(&format!("acct-{}", i), &format!("tok-{}", i))
                    .await
            }));
        }
        for task in tasks {
            task.await.expect("join").expect("set");
        }

        let reloaded = CredentialCache::load(&path);
        assert_eq!(reloaded.len().await, 8);
        let _ = std::fs::remove_file(&path);
    }

    #[tokio::test]
    async fn remove_and_clear_update_the_file() {
        let path = temp_cache_path("remove");
        let cache = CredentialCache::load(&path);
        cache.set("a", "1").await.expect("set");
        cache.set("b", "2").await.expect("set");

        assert!(cache.remove("a").await.expect("remove"));
        assert!(!cache.remove("a").await.expect("remove again"));
        assert_eq!(CredentialCache::load(&path).keys().await, vec!["b".to_string()]);

        assert_eq!(cache.clear().await.expect("clear"), 1);
        assert!(CredentialCache::load(&path).is_empty().await);
        let _ = std::fs::remove_file(&path);
    }

    #[tokio::test]
    async fn empty_values_read_as_absent() {
        let path = temp_cache_path("empty");
        std::fs::write(&path, r#"{"a": ""}"#).expect("write");
        let cache = CredentialCache::load(&path);
        assert!(cache.get("a").await.is_none());
        let _ = std::fs::remove_file(&path);
    }
}
