// ABOUTME: In-process tiers: the volatile in-memory model copy and the session-scoped store.
// ABOUTME: Both are synchronous maps; the session store enforces a byte quota and outlives engine rebuilds.

use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;

use crate::tier::{StorageTier, SyncStorageTier, TierCapabilities, TierError, TierName, TierScope};

/// Default byte budget for the session store.
pub const DEFAULT_SESSION_QUOTA_BYTES: usize = 5 * 1024 * 1024;

/// A string map guarded by a std lock, with optional total-size accounting.
#[derive(Debug, Default)]
struct MapCell {
    entries: RwLock<BTreeMap<String, String>>,
}

impl MapCell {
    fn write(&self, tier: TierName, quota: Option<usize>, key: &str, value: &str) -> Result<(), TierError> {
        let mut entries = self
            .entries
            .write()
            .map_err(|_| TierError::unavailable(tier, "lock poisoned"))?;

        if let Some(quota) = quota {
            let used: usize = entries
                .iter()
                .filter(|(k, _)| k.as_str() != key)
                .map(|(k, v)| k.len() + v.len())
                .sum();
            let needed = key.len() + value.len();
            if used + needed > quota {
                return Err(TierError::QuotaExceeded {
                    tier,
                    needed,
                    available: quota.saturating_sub(used),
                });
            }
        }

        entries.insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn read(&self, tier: TierName, key: &str) -> Result<Option<String>, TierError> {
        let entries = self
            .entries
            .read()
            .map_err(|_| TierError::unavailable(tier, "lock poisoned"))?;
        Ok(entries.get(key).cloned())
    }

    fn clear(&self, tier: TierName, key: &str) -> Result<(), TierError> {
        let mut entries = self
            .entries
            .write()
            .map_err(|_| TierError::unavailable(tier, "lock poisoned"))?;
        entries.remove(key);
        Ok(())
    }

    fn keys(&self, tier: TierName, prefix: &str) -> Result<Vec<String>, TierError> {
        let entries = self
            .entries
            .read()
            .map_err(|_| TierError::unavailable(tier, "lock poisoned"))?;
        Ok(entries
            .keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect())
    }
}

/// The in-memory model's persisted copy. Never durable, never bounded.
#[derive(Debug, Default)]
pub struct MemoryTier {
    cell: MapCell,
}

impl MemoryTier {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl StorageTier for MemoryTier {
    fn name(&self) -> TierName {
        TierName::Memory
    }

    fn capabilities(&self) -> TierCapabilities {
        TierCapabilities {
            synchronous: true,
            max_entry_size_bytes: None,
            scope: TierScope::Volatile,
            queryable: false,
        }
    }

    async fn write(&self, key: &str, value: &str) -> Result<(), TierError> {
        self.cell.write(TierName::Memory, None, key, value)
    }

    async fn read(&self, key: &str) -> Result<Option<String>, TierError> {
        self.cell.read(TierName::Memory, key)
    }

    async fn clear(&self, key: &str) -> Result<(), TierError> {
        self.cell.clear(TierName::Memory, key)
    }

    async fn keys(&self, prefix: &str) -> Result<Vec<String>, TierError> {
        self.cell.keys(TierName::Memory, prefix)
    }
}

/// Session-scoped store. Clones share the same map, so an engine rebuilt inside the
/// same process session (a "reload") sees what the previous engine wrote.
#[derive(Debug, Clone)]
pub struct SessionTier {
    cell: Arc<MapCell>,
    quota_bytes: usize,
}

impl Default for SessionTier {
    fn default() -> Self {
        Self::with_quota(DEFAULT_SESSION_QUOTA_BYTES)
    }
}

impl SessionTier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_quota(quota_bytes: usize) -> Self {
        Self {
            cell: Arc::new(MapCell::default()),
            quota_bytes,
        }
    }

    /// Drop everything; models the end of a browsing session.
    pub fn end_session(&self) {
        if let Ok(mut entries) = self.cell.entries.write() {
            entries.clear();
        }
    }
}

#[async_trait]
impl StorageTier for SessionTier {
    fn name(&self) -> TierName {
        TierName::Session
    }

    fn capabilities(&self) -> TierCapabilities {
        TierCapabilities {
            synchronous: true,
            max_entry_size_bytes: Some(self.quota_bytes),
            scope: TierScope::TabSession,
            queryable: false,
        }
    }

    async fn write(&self, key: &str, value: &str) -> Result<(), TierError> {
        self.write_now(key, value)
    }

    async fn read(&self, key: &str) -> Result<Option<String>, TierError> {
        self.read_now(key)
    }

    async fn clear(&self, key: &str) -> Result<(), TierError> {
        self.cell.clear(TierName::Session, key)
    }

    async fn keys(&self, prefix: &str) -> Result<Vec<String>, TierError> {
        self.cell.keys(TierName::Session, prefix)
    }
}

impl SyncStorageTier for SessionTier {
    fn write_now(&self, key: &str, value: &str) -> Result<(), TierError> {
        self.cell
            .write(TierName::Session, Some(self.quota_bytes), key, value)
    }

    fn read_now(&self, key: &str) -> Result<Option<String>, TierError> {
        self.cell.read(TierName::Session, key)
    }
}
