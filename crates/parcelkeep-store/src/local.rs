// ABOUTME: Fast synchronous bounded tier backed by one file per key in a data directory.
// ABOUTME: Writes are atomic (tmp + fsync + rename) and the directory as a whole is held to a byte quota.

use std::fs::{self, File};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

use async_trait::async_trait;

use crate::tier::{StorageTier, SyncStorageTier, TierCapabilities, TierError, TierName, TierScope};

/// Default byte budget for the local directory.
pub const DEFAULT_LOCAL_QUOTA_BYTES: usize = 5 * 1024 * 1024;

const ENTRY_EXT: &str = "json";

/// Bounded, device-persistent key-value files. Every operation completes without
/// yielding, so the unload path can use it directly.
#[derive(Debug, Clone)]
pub struct LocalTier {
    dir: PathBuf,
    quota_bytes: usize,
}

impl LocalTier {
    /// Open (or create) the directory backing this tier.
    pub fn open(dir: &Path, quota_bytes: usize) -> Result<Self, TierError> {
        fs::create_dir_all(dir).map_err(|source| TierError::Io {
            tier: TierName::Local,
            source,
        })?;
        Ok(Self {
            dir: dir.to_path_buf(),
            quota_bytes,
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn quota_bytes(&self) -> usize {
        self.quota_bytes
    }

    fn entry_path(&self, key: &str) -> PathBuf {
        self.dir
            .join(format!("{}.{ENTRY_EXT}", hex::encode(key.as_bytes())))
    }

    fn decode_key(path: &Path) -> Option<String> {
        if path.extension().and_then(|e| e.to_str()) != Some(ENTRY_EXT) {
            return None;
        }
        let stem = path.file_stem()?.to_str()?;
        let bytes = hex::decode(stem).ok()?;
        String::from_utf8(bytes).ok()
    }

    /// Bytes used by every entry except `exclude`.
    fn used_bytes(&self, exclude: &Path) -> Result<usize, TierError> {
        let mut used = 0usize;
        for entry in fs::read_dir(&self.dir).map_err(io_err)? {
            let entry = entry.map_err(io_err)?;
            let path = entry.path();
            if path == exclude || Self::decode_key(&path).is_none() {
                continue;
            }
            let len = entry.metadata().map_err(io_err)?.len();
            used += usize::try_from(len).unwrap_or(usize::MAX);
        }
        Ok(used)
    }

    /// Entries currently stored that start with `prefix`, read synchronously.
    pub fn keys_now(&self, prefix: &str) -> Result<Vec<String>, TierError> {
        let mut keys = Vec::new();
        for entry in fs::read_dir(&self.dir).map_err(io_err)? {
            let entry = entry.map_err(io_err)?;
            if let Some(key) = Self::decode_key(&entry.path())
                && key.starts_with(prefix)
            {
                keys.push(key);
            }
        }
        keys.sort();
        Ok(keys)
    }

    pub fn clear_now(&self, key: &str) -> Result<(), TierError> {
        match fs::remove_file(self.entry_path(key)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(source) => Err(io_err(source)),
        }
    }
}

fn io_err(source: std::io::Error) -> TierError {
    TierError::Io {
        tier: TierName::Local,
        source,
    }
}

#[async_trait]
impl StorageTier for LocalTier {
    fn name(&self) -> TierName {
        TierName::Local
    }

    fn capabilities(&self) -> TierCapabilities {
        TierCapabilities {
            synchronous: true,
            max_entry_size_bytes: Some(self.quota_bytes),
            scope: TierScope::PersistentDevice,
            queryable: false,
        }
    }

    async fn is_ready(&self) -> bool {
        self.dir.is_dir()
    }

    async fn write(&self, key: &str, value: &str) -> Result<(), TierError> {
        self.write_now(key, value)
    }

    async fn read(&self, key: &str) -> Result<Option<String>, TierError> {
        self.read_now(key)
    }

    async fn clear(&self, key: &str) -> Result<(), TierError> {
        self.clear_now(key)
    }

    async fn keys(&self, prefix: &str) -> Result<Vec<String>, TierError> {
        self.keys_now(prefix)
    }
}

impl SyncStorageTier for LocalTier {
    fn write_now(&self, key: &str, value: &str) -> Result<(), TierError> {
        let final_path = self.entry_path(key);

        if value.len() > self.quota_bytes {
            return Err(TierError::EntryTooLarge {
                tier: TierName::Local,
                size: value.len(),
                max: self.quota_bytes,
            });
        }
        let used = self.used_bytes(&final_path)?;
        if used + value.len() > self.quota_bytes {
            return Err(TierError::QuotaExceeded {
                tier: TierName::Local,
                needed: value.len(),
                available: self.quota_bytes.saturating_sub(used),
            });
        }

        let tmp_path = final_path.with_extension("tmp");
        let mut file = File::create(&tmp_path).map_err(io_err)?;
        file.write_all(value.as_bytes()).map_err(io_err)?;
        file.sync_all().map_err(io_err)?;
        drop(file);

        fs::rename(&tmp_path, &final_path).map_err(io_err)?;
        Ok(())
    }

    fn read_now(&self, key: &str) -> Result<Option<String>, TierError> {
        match fs::read_to_string(self.entry_path(key)) {
            Ok(contents) => Ok(Some(contents)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(source) => Err(io_err(source)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn write_read_clear_round_trip() {
        let dir = TempDir::new().unwrap();
        let tier = LocalTier::open(dir.path(), DEFAULT_LOCAL_QUOTA_BYTES).unwrap();

        tier.write("parcelkeep:main-dataset", "[1,2]").await.unwrap();
        assert_eq!(
            tier.read("parcelkeep:main-dataset").await.unwrap().as_deref(),
            Some("[1,2]")
        );

        tier.clear("parcelkeep:main-dataset").await.unwrap();
        assert!(tier.read("parcelkeep:main-dataset").await.unwrap().is_none());
        // Clearing a missing key is not an error.
        tier.clear("parcelkeep:main-dataset").await.unwrap();
    }

    #[tokio::test]
    async fn survives_reopen() {
        let dir = TempDir::new().unwrap();
        {
            let tier = LocalTier::open(dir.path(), DEFAULT_LOCAL_QUOTA_BYTES).unwrap();
            tier.write_now("k", "persisted").unwrap();
        }
        let reopened = LocalTier::open(dir.path(), DEFAULT_LOCAL_QUOTA_BYTES).unwrap();
        assert_eq!(reopened.read_now("k").unwrap().as_deref(), Some("persisted"));
    }

    #[tokio::test]
    async fn quota_counts_other_entries_only() {
        let dir = TempDir::new().unwrap();
        let tier = LocalTier::open(dir.path(), 20).unwrap();

        tier.write("a", "0123456789").await.unwrap();
        // Replacing the same key fits because its old size is excluded.
        tier.write("a", "9876543210").await.unwrap();

        let err = tier.write("b", "0123456789AB").await.unwrap_err();
        assert!(err.is_quota(), "expected quota error, got {err}");

        let err = tier.write("c", &"x".repeat(21)).await.unwrap_err();
        assert!(matches!(err, TierError::EntryTooLarge { .. }));
    }

    #[tokio::test]
    async fn keys_are_decoded_and_filtered() {
        let dir = TempDir::new().unwrap();
        let tier = LocalTier::open(dir.path(), DEFAULT_LOCAL_QUOTA_BYTES).unwrap();
        tier.write("snap:2", "b").await.unwrap();
        tier.write("snap:1", "a").await.unwrap();
        tier.write("other", "c").await.unwrap();
        fs::write(dir.path().join("stray.txt"), "ignored").unwrap();

        assert_eq!(tier.keys("snap:").await.unwrap(), vec!["snap:1", "snap:2"]);
        assert_eq!(tier.keys("").await.unwrap().len(), 3);
    }
}
