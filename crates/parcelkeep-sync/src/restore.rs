// ABOUTME: Cold-start restore: walk the durable tiers in fixed priority order, then the latest snapshot.
// ABOUTME: The first valid non-empty dataset wins and is re-saved through the coordinator to heal every tier.

use std::fmt;

use parcelkeep_core::{ParcelRecord, Validator};
use parcelkeep_store::{SnapshotManager, StorageTier, TierName, envelope, keys};
use serde::Serialize;

use crate::coordinator::{PersistenceCoordinator, SaveOptions, SaveResult};

/// Where a restored dataset came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RestoreSource {
    Tier(TierName),
    Snapshot,
}

impl fmt::Display for RestoreSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RestoreSource::Tier(tier) => write!(f, "{tier}"),
            RestoreSource::Snapshot => f.write_str("snapshot"),
        }
    }
}

/// A source that was visited and passed over.
#[derive(Debug, Clone, Serialize)]
pub struct SkippedSource {
    pub source: RestoreSource,
    pub reason: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct RestoreOutcome {
    pub records: Vec<ParcelRecord>,
    /// `None` when nothing has been saved yet.
    pub source: Option<RestoreSource>,
    pub skipped: Vec<SkippedSource>,
    pub resync: Option<SaveResult>,
    pub resync_error: Option<String>,
}

impl RestoreOutcome {
    fn empty(skipped: Vec<SkippedSource>) -> Self {
        Self {
            records: Vec::new(),
            source: None,
            skipped,
            resync: None,
            resync_error: None,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

/// Resolves the authoritative dataset at startup.
pub struct RestoreResolver;

impl RestoreResolver {
    /// Restore from the coordinator's tiers. An empty result is a legitimate
    /// "nothing saved yet" outcome. A failed re-sync is reported, not raised,
    /// so the restored records are never lost to a replication problem.
    pub async fn restore(coordinator: &PersistenceCoordinator) -> RestoreOutcome {
        let validator = coordinator.validator();
        let mut skipped = Vec::new();

        let mut found = None;
        for tier in coordinator.tiers() {
            if !tier.capabilities().durable() {
                continue;
            }
            let source = RestoreSource::Tier(tier.name());
            match read_tier(tier.as_ref(), validator).await {
                Ok(records) => {
                    found = Some((source, records));
                    break;
                }
                Err(reason) => {
                    tracing::debug!(tier = %tier.name(), reason = %reason, "restore skipped tier");
                    skipped.push(SkippedSource { source, reason });
                }
            }
        }

        if found.is_none() {
            match read_snapshot(coordinator.snapshots(), validator).await {
                Ok(records) => found = Some((RestoreSource::Snapshot, records)),
                Err(reason) => {
                    tracing::debug!(reason = %reason, "restore skipped snapshot");
                    skipped.push(SkippedSource {
                        source: RestoreSource::Snapshot,
                        reason,
                    });
                }
            }
        }

        let Some((source, records)) = found else {
            tracing::info!("no saved dataset found, starting empty");
            return RestoreOutcome::empty(skipped);
        };

        tracing::info!(source = %source, count = records.len(), skipped = skipped.len(), "dataset restored");

        let (resync, resync_error) = match coordinator.save(&records, SaveOptions::restore(source)).await {
            Ok(result) => (Some(result), None),
            Err(e) => {
                tracing::warn!(source = %source, reason = %e, "re-sync after restore failed");
                (None, Some(e.to_string()))
            }
        };

        RestoreOutcome {
            records,
            source: Some(source),
            skipped,
            resync,
            resync_error,
        }
    }
}

async fn read_tier(tier: &dyn StorageTier, validator: &Validator) -> Result<Vec<ParcelRecord>, String> {
    let raw = tier
        .read(keys::dataset_key(tier.name()))
        .await
        .map_err(|e| e.to_string())?
        .ok_or_else(|| "empty".to_string())?;
    let decoded = envelope::decode(&raw, validator).map_err(|e| e.to_string())?;
    if decoded.is_empty() {
        return Err("no records".to_string());
    }
    Ok(decoded.records)
}

async fn read_snapshot(snapshots: &SnapshotManager, validator: &Validator) -> Result<Vec<ParcelRecord>, String> {
    let snapshot = snapshots
        .latest()
        .await
        .map_err(|e| e.to_string())?
        .ok_or_else(|| "empty".to_string())?;
    if snapshot.dataset.is_empty() {
        return Err("no records".to_string());
    }
    let report = validator.validate_records(&snapshot.dataset);
    if !report.accepts() {
        return Err("snapshot failed validation".to_string());
    }
    Ok(snapshot.dataset)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use chrono::{Duration, Utc};
    use parcelkeep_core::DatasetMetadata;
    use parcelkeep_store::testing::MemoryRemoteStore;
    use parcelkeep_store::{
        EmbeddedTier, LocalTier, MemoryTier, NetworkMonitor, RemoteStore, RemoteTier, SessionTier,
        SnapshotKind, SnapshotPolicy, SyncQueue,
    };

    use crate::coordinator::CoordinatorParts;

    struct Rig {
        coordinator: PersistenceCoordinator,
        local: Arc<LocalTier>,
        session: Arc<SessionTier>,
        embedded: Arc<EmbeddedTier>,
        remote: Arc<MemoryRemoteStore>,
        network: NetworkMonitor,
    }

    async fn rig(dir: &std::path::Path) -> Rig {
        let local = Arc::new(LocalTier::open(dir, 1024 * 1024).unwrap());
        let session = Arc::new(SessionTier::new());
        let embedded = Arc::new(EmbeddedTier::open_in_memory().unwrap());
        let remote = Arc::new(MemoryRemoteStore::new());
        let network = NetworkMonitor::new(true);

        let coordinator = PersistenceCoordinator::new(CoordinatorParts {
            tiers: vec![
                Arc::new(MemoryTier::new()) as Arc<dyn StorageTier>,
                local.clone(),
                session.clone(),
                embedded.clone(),
            ],
            remote: RemoteTier::new(Some(remote.clone()), network.clone()),
            snapshots: SnapshotManager::new(Some(embedded.clone()), local.clone(), SnapshotPolicy::default()),
            queue: Arc::new(SyncQueue::load(local.clone(), None).await.unwrap()),
            validator: Validator::default(),
            cleanup_interval: Duration::hours(1),
        });

        Rig {
            coordinator,
            local,
            session,
            embedded,
            remote,
            network,
        }
    }

    fn stored(records: &[ParcelRecord]) -> String {
        let meta = DatasetMetadata::compute(records, "test", Utc::now());
        envelope::encode(records, &meta).unwrap()
    }

    fn one(id: &str) -> Vec<ParcelRecord> {
        vec![ParcelRecord::new(id).with_memo("m")]
    }

    #[tokio::test]
    async fn empty_everywhere_is_not_an_error() {
        let dir = tempfile::TempDir::new().unwrap();
        let rig = rig(dir.path()).await;

        let outcome = RestoreResolver::restore(&rig.coordinator).await;
        assert!(outcome.is_empty());
        assert!(outcome.source.is_none());
        assert!(outcome.resync.is_none());
        // local, session, embedded, remote, snapshot
        assert_eq!(outcome.skipped.len(), 5);
    }

    #[tokio::test]
    async fn highest_priority_tier_wins_over_newer_data() {
        let dir = tempfile::TempDir::new().unwrap();
        let rig = rig(dir.path()).await;

        // Session holds an older dataset, embedded a newer one; session has priority.
        rig.session
            .write(keys::SESSION_DATASET, &stored(&one("from-session")))
            .await
            .unwrap();
        rig.embedded
            .write(keys::MAIN_DATASET, &stored(&one("from-embedded")))
            .await
            .unwrap();

        let outcome = RestoreResolver::restore(&rig.coordinator).await;
        assert_eq!(outcome.source, Some(RestoreSource::Tier(TierName::Session)));
        assert_eq!(outcome.records[0].id, "from-session");
        assert!(outcome.resync.is_some());

        // Re-sync converged every tier on the winner.
        let healed = rig.embedded.read(keys::MAIN_DATASET).await.unwrap().unwrap();
        assert!(healed.contains("from-session"));
    }

    #[tokio::test]
    async fn invalid_payload_is_skipped() {
        let dir = tempfile::TempDir::new().unwrap();
        let rig = rig(dir.path()).await;

        rig.local.write(keys::MAIN_DATASET, r#"{"oops":true}"#).await.unwrap();
        rig.session.write(keys::SESSION_DATASET, "[]").await.unwrap();
        rig.embedded
            .write(keys::MAIN_DATASET, &stored(&one("good")))
            .await
            .unwrap();

        let outcome = RestoreResolver::restore(&rig.coordinator).await;
        assert_eq!(outcome.source, Some(RestoreSource::Tier(TierName::Embedded)));
        assert_eq!(outcome.skipped.len(), 2);
        assert_eq!(outcome.skipped[1].reason, "no records");
    }

    #[tokio::test]
    async fn remote_only_then_offline_restore() {
        let dir = tempfile::TempDir::new().unwrap();
        let rig = rig(dir.path()).await;
        let records = vec![
            ParcelRecord::new("PNU-1").with_memo("a"),
            ParcelRecord::new("PNU-2").with_memo("b"),
        ];
        rig.remote.put(keys::MAIN_DATASET, &stored(&records)).await.unwrap();

        let first = RestoreResolver::restore(&rig.coordinator).await;
        assert_eq!(first.source, Some(RestoreSource::Tier(TierName::Remote)));
        assert_eq!(first.records, records);
        assert_eq!(first.skipped.len(), 3);

        rig.network.set_online(false);
        let second = RestoreResolver::restore(&rig.coordinator).await;
        assert_eq!(second.source, Some(RestoreSource::Tier(TierName::Local)));
        assert_eq!(second.records, records);
    }

    #[tokio::test]
    async fn latest_snapshot_is_the_last_resort() {
        let dir = tempfile::TempDir::new().unwrap();
        let rig = rig(dir.path()).await;
        let records = one("snap");
        let meta = DatasetMetadata::compute(&records, "test", Utc::now());
        rig.coordinator
            .snapshots()
            .append(&records, &meta, SnapshotKind::Manual)
            .await
            .unwrap();

        let outcome = RestoreResolver::restore(&rig.coordinator).await;
        assert_eq!(outcome.source, Some(RestoreSource::Snapshot));
        assert_eq!(outcome.records, records);
    }
}
