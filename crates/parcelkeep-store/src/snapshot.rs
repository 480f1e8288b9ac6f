// ABOUTME: Time-ordered full-dataset snapshots appended on every coordinated save.
// ABOUTME: Stored gzip-compressed in SQLite; degrades to a single 24h snapshot in the local tier.

use std::io::{Read, Write};
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use flate2::Compression;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use parcelkeep_core::{DatasetMetadata, ParcelRecord};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::keys::SNAPSHOT_LATEST;
use crate::sqlite::{EmbeddedTier, StoredSnapshot};
use crate::tier::{StorageTier, TierError, TierName};

/// Errors that can occur during snapshot operations.
#[derive(Debug, Error)]
pub enum SnapshotError {
    #[error("tier error: {0}")]
    Tier(#[from] TierError),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("compression error: {0}")]
    Compression(#[from] std::io::Error),

    #[error("stored snapshot has invalid timestamp {0}")]
    BadTimestamp(i64),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SnapshotKind {
    Auto,
    Manual,
}

impl SnapshotKind {
    pub fn as_str(self) -> &'static str {
        match self {
            SnapshotKind::Auto => "auto",
            SnapshotKind::Manual => "manual",
        }
    }

    fn parse(s: &str) -> Self {
        match s {
            "manual" => SnapshotKind::Manual,
            _ => SnapshotKind::Auto,
        }
    }
}

/// A full snapshot of the dataset at one instant. Immutable once written.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotRecord {
    pub timestamp: DateTime<Utc>,
    pub kind: SnapshotKind,
    pub dataset: Vec<ParcelRecord>,
    pub metadata: DatasetMetadata,
    pub compressed: bool,
}

/// Listing entry without the dataset body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SnapshotSummary {
    pub timestamp: DateTime<Utc>,
    pub kind: SnapshotKind,
    pub count: usize,
    pub checksum: String,
    pub compressed: bool,
}

/// Where an appended snapshot ended up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SnapshotLocation {
    Embedded { timestamp_ms: i64 },
    Fallback,
}

/// Retention and encoding settings.
#[derive(Debug, Clone)]
pub struct SnapshotPolicy {
    pub retention: Duration,
    pub fallback_retention: Duration,
    pub compress: bool,
}

impl Default for SnapshotPolicy {
    fn default() -> Self {
        Self {
            retention: Duration::days(7),
            fallback_retention: Duration::hours(24),
            compress: true,
        }
    }
}

/// Appends and prunes snapshots. The embedded tier is optional; without it only the
/// latest snapshot is kept, in the fallback tier.
pub struct SnapshotManager {
    embedded: Option<Arc<EmbeddedTier>>,
    fallback: Arc<dyn StorageTier>,
    policy: SnapshotPolicy,
}

impl SnapshotManager {
    pub fn new(
        embedded: Option<Arc<EmbeddedTier>>,
        fallback: Arc<dyn StorageTier>,
        policy: SnapshotPolicy,
    ) -> Self {
        Self {
            embedded,
            fallback,
            policy,
        }
    }

    pub fn policy(&self) -> &SnapshotPolicy {
        &self.policy
    }

    /// Append a snapshot of `records`. Never skipped; falls back to the bounded tier
    /// when the embedded store is missing or rejects the write.
    pub async fn append(
        &self,
        records: &[ParcelRecord],
        metadata: &DatasetMetadata,
        kind: SnapshotKind,
    ) -> Result<SnapshotLocation, SnapshotError> {
        if let Some(embedded) = &self.embedded {
            match self.append_embedded(embedded, records, metadata, kind) {
                Ok(timestamp_ms) => {
                    tracing::debug!(timestamp_ms, count = records.len(), kind = kind.as_str(), "snapshot appended");
                    return Ok(SnapshotLocation::Embedded { timestamp_ms });
                }
                Err(e) => {
                    tracing::warn!(error = %e, "embedded snapshot failed, degrading to local latest-only snapshot");
                }
            }
        }

        let record = SnapshotRecord {
            timestamp: metadata.timestamp,
            kind,
            dataset: records.to_vec(),
            metadata: metadata.clone(),
            compressed: false,
        };
        let json = serde_json::to_string(&record)?;
        self.fallback.write(SNAPSHOT_LATEST, &json).await?;
        Ok(SnapshotLocation::Fallback)
    }

    fn append_embedded(
        &self,
        embedded: &EmbeddedTier,
        records: &[ParcelRecord],
        metadata: &DatasetMetadata,
        kind: SnapshotKind,
    ) -> Result<i64, SnapshotError> {
        let json = serde_json::to_vec(records)?;
        let payload = if self.policy.compress {
            compress(&json)?
        } else {
            json
        };
        let row = StoredSnapshot {
            timestamp_ms: metadata.timestamp.timestamp_millis(),
            kind: kind.as_str().to_string(),
            checksum: metadata.checksum.clone(),
            count: i64::try_from(records.len()).unwrap_or(i64::MAX),
            metadata: serde_json::to_string(metadata)?,
            payload,
            compressed: self.policy.compress,
        };
        let used = embedded.insert_snapshot_with(&row, |timestamp_ms| {
            if timestamp_ms == row.timestamp_ms {
                return Ok(row.metadata.clone());
            }
            // The row was bumped past a taken millisecond.
            let at = DateTime::from_timestamp_millis(timestamp_ms)
                .ok_or_else(|| TierError::backend(TierName::Embedded, format!("bad snapshot timestamp {timestamp_ms}")))?;
            let restamped = DatasetMetadata {
                timestamp: at,
                ..metadata.clone()
            };
            serde_json::to_string(&restamped).map_err(|e| TierError::backend(TierName::Embedded, e))
        })?;
        Ok(used)
    }

    /// The most recent snapshot from whichever store holds one.
    pub async fn latest(&self) -> Result<Option<SnapshotRecord>, SnapshotError> {
        if let Some(embedded) = &self.embedded {
            match embedded.latest_snapshot() {
                Ok(Some(row)) => return decode_row(row).map(Some),
                Ok(None) => {}
                Err(e) => tracing::warn!(error = %e, "embedded snapshot read failed"),
            }
        }
        match self.fallback.read(SNAPSHOT_LATEST).await? {
            Some(json) => Ok(Some(serde_json::from_str(&json)?)),
            None => Ok(None),
        }
    }

    /// Summaries of every retained snapshot, newest first.
    pub async fn list(&self) -> Result<Vec<SnapshotSummary>, SnapshotError> {
        let mut summaries = Vec::new();
        if let Some(embedded) = &self.embedded {
            for row in embedded.list_snapshots()? {
                summaries.push(SnapshotSummary {
                    timestamp: millis_to_datetime(row.timestamp_ms)?,
                    kind: SnapshotKind::parse(&row.kind),
                    count: usize::try_from(row.count).unwrap_or(0),
                    checksum: row.checksum,
                    compressed: row.compressed,
                });
            }
        }
        if let Some(json) = self.fallback.read(SNAPSHOT_LATEST).await? {
            let record: SnapshotRecord = serde_json::from_str(&json)?;
            summaries.push(SnapshotSummary {
                timestamp: record.timestamp,
                kind: record.kind,
                count: record.dataset.len(),
                checksum: record.metadata.checksum,
                compressed: false,
            });
            summaries.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        }
        Ok(summaries)
    }

    /// Prune with the configured retention windows.
    pub async fn prune(&self, now: DateTime<Utc>) -> Result<usize, SnapshotError> {
        self.prune_older_than(self.policy.retention, now).await
    }

    /// Delete snapshots older than `max_age`. The fallback snapshot is held to the
    /// tighter of `max_age` and the fallback retention window.
    pub async fn prune_older_than(
        &self,
        max_age: Duration,
        now: DateTime<Utc>,
    ) -> Result<usize, SnapshotError> {
        let mut removed = 0;

        if let Some(embedded) = &self.embedded {
            let cutoff = (now - max_age).timestamp_millis();
            removed += embedded.delete_snapshots_before(cutoff)?;
        }

        let fallback_cutoff = now - max_age.min(self.policy.fallback_retention);
        if let Some(json) = self.fallback.read(SNAPSHOT_LATEST).await? {
            let stale = match serde_json::from_str::<SnapshotRecord>(&json) {
                Ok(record) => record.timestamp < fallback_cutoff,
                Err(_) => true,
            };
            if stale {
                self.fallback.clear(SNAPSHOT_LATEST).await?;
                removed += 1;
            }
        }

        if removed > 0 {
            tracing::info!(removed, "pruned snapshots");
        }
        Ok(removed)
    }
}

fn compress(bytes: &[u8]) -> Result<Vec<u8>, std::io::Error> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(bytes)?;
    encoder.finish()
}

fn decompress(bytes: &[u8]) -> Result<Vec<u8>, std::io::Error> {
    let mut decoder = GzDecoder::new(bytes);
    let mut out = Vec::new();
    decoder.read_to_end(&mut out)?;
    Ok(out)
}

fn millis_to_datetime(ms: i64) -> Result<DateTime<Utc>, SnapshotError> {
    DateTime::from_timestamp_millis(ms).ok_or(SnapshotError::BadTimestamp(ms))
}

fn decode_row(row: StoredSnapshot) -> Result<SnapshotRecord, SnapshotError> {
    let json = if row.compressed {
        decompress(&row.payload)?
    } else {
        row.payload
    };
    Ok(SnapshotRecord {
        timestamp: millis_to_datetime(row.timestamp_ms)?,
        kind: SnapshotKind::parse(&row.kind),
        dataset: serde_json::from_slice(&json)?,
        metadata: serde_json::from_str(&row.metadata)?,
        compressed: row.compressed,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryTier;

    fn records(n: usize) -> Vec<ParcelRecord> {
        (0..n)
            .map(|i| ParcelRecord::new(format!("PNU-{i}")).with_memo("memo"))
            .collect()
    }

    fn manager(embedded: bool) -> (SnapshotManager, Arc<MemoryTier>) {
        let fallback = Arc::new(MemoryTier::new());
        let embedded = embedded.then(|| Arc::new(EmbeddedTier::open_in_memory().unwrap()));
        (
            SnapshotManager::new(embedded, fallback.clone(), SnapshotPolicy::default()),
            fallback,
        )
    }

    #[tokio::test]
    async fn append_and_read_back_compressed() {
        let (mgr, _) = manager(true);
        let data = records(3);
        let meta = DatasetMetadata::compute(&data, "test", Utc::now());

        let location = mgr.append(&data, &meta, SnapshotKind::Manual).await.unwrap();
        assert!(matches!(location, SnapshotLocation::Embedded { .. }));

        let latest = mgr.latest().await.unwrap().expect("snapshot present");
        assert_eq!(latest.dataset, data);
        assert_eq!(latest.kind, SnapshotKind::Manual);
        assert!(latest.compressed);
        assert_eq!(latest.metadata.checksum, meta.checksum);
    }

    #[tokio::test]
    async fn retention_prunes_only_snapshots_past_seven_days() {
        let (mgr, _) = manager(true);
        let now = Utc::now();
        let data = records(1);

        // One snapshot per day spanning ten days.
        for days_ago in 0..10 {
            let at = now - Duration::days(days_ago) - Duration::minutes(1);
            let meta = DatasetMetadata::compute(&data, "test", at);
            mgr.append(&data, &meta, SnapshotKind::Auto).await.unwrap();
        }
        assert_eq!(mgr.list().await.unwrap().len(), 10);

        let removed = mgr.prune(now).await.unwrap();
        assert_eq!(removed, 3);

        let remaining = mgr.list().await.unwrap();
        assert_eq!(remaining.len(), 7);
        assert!(remaining.iter().all(|s| s.timestamp >= now - Duration::days(7)));
    }

    #[tokio::test]
    async fn bumped_snapshot_metadata_matches_its_row_timestamp() {
        let embedded = Arc::new(EmbeddedTier::open_in_memory().unwrap());
        let mgr = SnapshotManager::new(
            Some(embedded.clone()),
            Arc::new(MemoryTier::new()),
            SnapshotPolicy::default(),
        );
        let data = records(2);
        let meta = DatasetMetadata::compute(&data, "test", Utc::now());

        mgr.append(&data, &meta, SnapshotKind::Auto).await.unwrap();
        mgr.append(&data, &meta, SnapshotKind::Auto).await.unwrap();

        let rows = embedded.list_snapshots().unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].timestamp_ms, rows[1].timestamp_ms + 1);
        for row in rows {
            let stored: DatasetMetadata = serde_json::from_str(&row.metadata).unwrap();
            assert_eq!(stored.timestamp.timestamp_millis(), row.timestamp_ms);
            assert_eq!(stored.checksum, meta.checksum);
        }
    }

    #[tokio::test]
    async fn degrades_to_single_fallback_snapshot() {
        let (mgr, fallback) = manager(false);
        let now = Utc::now();

        for i in 1..=3 {
            let data = records(i);
            let meta = DatasetMetadata::compute(&data, "test", now + Duration::seconds(i as i64));
            let location = mgr.append(&data, &meta, SnapshotKind::Auto).await.unwrap();
            assert_eq!(location, SnapshotLocation::Fallback);
        }

        let latest = mgr.latest().await.unwrap().unwrap();
        assert_eq!(latest.dataset.len(), 3);
        assert!(!latest.compressed);
        assert_eq!(mgr.list().await.unwrap().len(), 1);
        assert!(fallback.read(SNAPSHOT_LATEST).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn fallback_snapshot_is_trimmed_after_a_day() {
        let (mgr, fallback) = manager(false);
        let now = Utc::now();
        let data = records(1);
        let meta = DatasetMetadata::compute(&data, "test", now - Duration::hours(30));
        mgr.append(&data, &meta, SnapshotKind::Auto).await.unwrap();

        // Within the seven day window, but past the fallback's 24h window.
        let removed = mgr.prune(now).await.unwrap();
        assert_eq!(removed, 1);
        assert!(fallback.read(SNAPSHOT_LATEST).await.unwrap().is_none());
        assert!(mgr.latest().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn fresh_fallback_snapshot_survives_prune() {
        let (mgr, _) = manager(false);
        let now = Utc::now();
        let data = records(1);
        let meta = DatasetMetadata::compute(&data, "test", now - Duration::hours(2));
        mgr.append(&data, &meta, SnapshotKind::Auto).await.unwrap();

        assert_eq!(mgr.prune(now).await.unwrap(), 0);
        assert!(mgr.latest().await.unwrap().is_some());
    }
}
