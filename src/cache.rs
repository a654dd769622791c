//! Two-tier TTL cache: an in-memory fast tier mirrored by a durable
//! file-per-key tier, so expensive generated values survive a restart.
//!
//! Reads check the fast tier first; a durable-tier hit backfills the fast
//! tier. Expired entries are evicted lazily on read (never returned), and the
//! reclaimer sweeps both tiers periodically via [`Cache::evict_expired`].
//! The memory lock is never held across durable-tier I/O, so a slow disk
//! cannot stall unrelated keys.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::config::CacheConfig;
use crate::error::Result;

#[derive(Debug, Clone)]
struct MemoryEntry {
    value: serde_json::Value,
    stored_at: DateTime<Utc>,
    ttl: Duration,
}

#[derive(Serialize, Deserialize)]
struct DiskEntry {
    value: serde_json::Value,
    stored_at: DateTime<Utc>,
    ttl: Duration,
}

#[derive(Debug)]
pub struct Cache {
    memory: Mutex<HashMap<String, MemoryEntry>>,
    dir: PathBuf,
    default_ttl: Duration,
}

impl Cache {
    /// Create a cache rooted at the configured directory, creating it if needed.
    pub async fn new(config: &CacheConfig) -> Result<Self> {
        tokio::fs::create_dir_all(&config.dir).await?;
        Ok(Self {
            memory: Mutex::new(HashMap::new()),
            dir: config.dir.clone(),
            default_ttl: config.default_ttl,
        })
    }

    /// Look up `key`, returning `None` on miss or expiry. An expired entry
    /// found in either tier is deleted rather than returned, so a later `get`
    /// cannot resurrect it.
    pub async fn get<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let now = Utc::now();
        {
            let mut memory = self.memory.lock();
            if let Some(entry) = memory.get(key) {
                if !is_expired(entry.stored_at, entry.ttl, now) {
                    let value = entry.value.clone();
                    drop(memory);
                    return decode(key, value);
                }
                memory.remove(key);
                // Fall through to the durable tier so the stale file goes too.
            }
        }

        let path = self.entry_path(key);
        let bytes = match tokio::fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(err) => {
                if err.kind() != std::io::ErrorKind::NotFound {
                    tracing::debug!(key, error = %err, "Durable cache read failed");
                }
                return None;
            }
        };
        let entry: DiskEntry = match serde_json::from_slice(&bytes) {
            Ok(entry) => entry,
            Err(err) => {
                tracing::warn!(key, error = %err, "Corrupt cache file, removing");
                let _ = tokio::fs::remove_file(&path).await;
                return None;
            }
        };
        if is_expired(entry.stored_at, entry.ttl, now) {
            let _ = tokio::fs::remove_file(&path).await;
            return None;
        }

        self.backfill_memory(key, &entry);
        decode(key, entry.value)
    }

    /// Backfill the fast tier from a durable-tier hit. A `set` racing with
    /// the durable read may already have landed a newer value for this key;
    /// the stale disk copy must never replace it.
    fn backfill_memory(&self, key: &str, entry: &DiskEntry) {
        let mut memory = self.memory.lock();
        let newer_present = memory
            .get(key)
            .is_some_and(|existing| existing.stored_at >= entry.stored_at);
        if !newer_present {
            memory.insert(
                key.to_string(),
                MemoryEntry {
                    value: entry.value.clone(),
                    stored_at: entry.stored_at,
                    ttl: entry.ttl,
                },
            );
        }
    }

    /// Store `value` in both tiers with the current timestamp. A durable-tier
    /// write failure is logged but non-fatal since the fast tier already
    /// holds the value.
    pub async fn set<T: Serialize>(&self, key: &str, value: &T, ttl: Option<Duration>) {
        let value = match serde_json::to_value(value) {
            Ok(value) => value,
            Err(err) => {
                tracing::warn!(key, error = %err, "Refusing to cache unserializable value");
                return;
            }
        };
        let stored_at = Utc::now();
        let ttl = ttl.unwrap_or(self.default_ttl);

        self.memory.lock().insert(
            key.to_string(),
            MemoryEntry {
                value: value.clone(),
                stored_at,
                ttl,
            },
        );

        let entry = DiskEntry {
            value,
            stored_at,
            ttl,
        };
        match serde_json::to_vec(&entry) {
            Ok(bytes) => {
                if let Err(err) = tokio::fs::write(self.entry_path(key), bytes).await {
                    tracing::warn!(key, error = %err, "Durable cache write failed");
                }
            }
            Err(err) => tracing::warn!(key, error = %err, "Cache entry encoding failed"),
        }
    }

    /// Remove one key from both tiers.
    pub async fn invalidate(&self, key: &str) {
        self.memory.lock().remove(key);
        match tokio::fs::remove_file(self.entry_path(key)).await {
            Ok(()) => {}
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => tracing::warn!(key, error = %err, "Failed to remove cache file"),
        }
    }

    /// Remove everything from both tiers.
    pub async fn clear(&self) {
        self.memory.lock().clear();
        let mut entries = match tokio::fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(err) => {
                tracing::warn!(error = %err, "Failed to scan cache directory");
                return;
            }
        };
        while let Ok(Some(entry)) = entries.next_entry().await {
            let path = entry.path();
            if path.extension().is_some_and(|ext| ext == "cache") {
                if let Err(err) = tokio::fs::remove_file(&path).await {
                    tracing::warn!(path = %path.display(), error = %err, "Failed to remove cache file");
                }
            }
        }
    }

    /// Sweep expired (and corrupt) entries out of both tiers. Returns the
    /// number of entries removed across the two tiers.
    pub async fn evict_expired(&self) -> usize {
        let now = Utc::now();
        let mut removed = 0;
        {
            let mut memory = self.memory.lock();
            let before = memory.len();
            memory.retain(|_, entry| !is_expired(entry.stored_at, entry.ttl, now));
            removed += before - memory.len();
        }

        let mut entries = match tokio::fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(_) => return removed,
        };
        while let Ok(Some(entry)) = entries.next_entry().await {
            let path = entry.path();
            if !path.extension().is_some_and(|ext| ext == "cache") {
                continue;
            }
            let expired = match tokio::fs::read(&path).await {
                Ok(bytes) => match serde_json::from_slice::<DiskEntry>(&bytes) {
                    Ok(entry) => is_expired(entry.stored_at, entry.ttl, now),
                    // Corrupt files are dead weight either way.
                    Err(_) => true,
                },
                Err(_) => false,
            };
            if expired && tokio::fs::remove_file(&path).await.is_ok() {
                removed += 1;
            }
        }
        removed
    }

    fn entry_path(&self, key: &str) -> PathBuf {
        // Keys are normally hex fingerprints; anything else is made
        // filesystem-safe before it becomes a file name.
        let safe: String = key
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                    c
                } else {
                    '_'
                }
            })
            .collect();
        self.dir.join(format!("{safe}.cache"))
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

/// Derive a stable cache key from everything that determines the cached
/// result. The argument set is canonicalized through `serde_json::Value`
/// (object keys sorted), so field order does not change the fingerprint.
pub fn fingerprint<T: Serialize>(args: &T) -> Result<String> {
    let canonical = serde_json::to_vec(&serde_json::to_value(args)?)?;
    let mut hasher = Sha256::new();
    hasher.update(&canonical);
    Ok(format!("{:x}", hasher.finalize()))
}

fn is_expired(stored_at: DateTime<Utc>, ttl: Duration, now: DateTime<Utc>) -> bool {
    match now.signed_duration_since(stored_at).to_std() {
        Ok(age) => age >= ttl,
        // stored_at in the future (clock moved); treat as fresh
        Err(_) => false,
    }
}

fn decode<T: DeserializeOwned>(key: &str, value: serde_json::Value) -> Option<T> {
    match serde_json::from_value(value) {
        Ok(value) => Some(value),
        Err(err) => {
            tracing::warn!(key, error = %err, "Cached value does not match requested type");
            None
        }
    }
}
