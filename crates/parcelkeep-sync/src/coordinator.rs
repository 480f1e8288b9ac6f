// ABOUTME: The coordinated save: validate, fan out to every tier independently, snapshot, evaluate quorum.
// ABOUTME: Remote failures are downgraded to sync queue entries; quota errors get one cleanup-and-retry.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use futures::future::join_all;
use parcelkeep_core::{
    CoercedDataset, DatasetMetadata, ParcelRecord, ValidationIssue, ValidationReport, Validator,
};
use parcelkeep_store::keys::{self, DATASET_METADATA, MAIN_DATASET};
use parcelkeep_store::{
    DrainReport, QueueError, RemoteTier, SnapshotError, SnapshotKind, SnapshotManager, StorageTier,
    SyncQueue, TierError, TierName, envelope, free_low_priority,
};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::Mutex;

/// Minimum number of durable tiers that must accept a write for a save to count.
pub const QUORUM: usize = 2;

/// Errors that can occur during a coordinated save.
#[derive(Debug, Error)]
pub enum SaveError {
    #[error("dataset failed validation with {} critical issue(s)", .0.errors.len())]
    ValidationCritical(ValidationReport),

    #[error("quorum not reached: {success_count} of {required} required tiers accepted the write")]
    QuorumFailure {
        success_count: usize,
        required: usize,
        per_tier: BTreeMap<TierName, bool>,
        failures: Vec<TierFailure>,
    },

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Why one tier rejected a write.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TierFailure {
    pub tier: TierName,
    pub reason: String,
}

/// Per-save options.
#[derive(Debug, Clone)]
pub struct SaveOptions {
    pub source: String,
    pub snapshot_kind: SnapshotKind,
}

impl SaveOptions {
    pub fn reason(source: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            snapshot_kind: SnapshotKind::Auto,
        }
    }

    /// Options for the re-sync that follows a successful restore.
    pub fn restore(from: impl std::fmt::Display) -> Self {
        Self::reason(format!("restore:{from}"))
    }

    /// Tag this save's snapshot as manual.
    pub fn manual(mut self) -> Self {
        self.snapshot_kind = SnapshotKind::Manual;
        self
    }
}

impl Default for SaveOptions {
    fn default() -> Self {
        Self::reason("save")
    }
}

/// Outcome of a save that reached quorum.
#[derive(Debug, Clone, Serialize)]
pub struct SaveResult {
    pub per_tier: BTreeMap<TierName, bool>,
    pub metadata: DatasetMetadata,
    pub success_count: usize,
    pub snapshot_saved: bool,
    pub queued: bool,
    /// Set when the remote write should have been queued but the queue could not be persisted.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub queue_error: Option<String>,
    pub warnings: Vec<ValidationIssue>,
}

/// Point-in-time view of the engine.
#[derive(Debug, Clone, Serialize)]
pub struct CoordinatorStatus {
    pub tiers_ready: BTreeMap<TierName, bool>,
    pub last_save_time: Option<DateTime<Utc>>,
    pub pending_count: usize,
    pub dead_letter_count: usize,
    pub is_saving: bool,
    pub online: bool,
}

/// Everything the coordinator fans out to. `tiers` lists the non-remote tiers in
/// restore priority order; the remote tier is appended last.
pub struct CoordinatorParts {
    pub tiers: Vec<Arc<dyn StorageTier>>,
    pub remote: RemoteTier,
    pub snapshots: SnapshotManager,
    pub queue: Arc<SyncQueue>,
    pub validator: Validator,
    pub cleanup_interval: Duration,
}

/// Top-level save orchestrator. Only one coordinated save runs at a time; a save
/// that arrives while another is running waits for it to finish.
pub struct PersistenceCoordinator {
    tiers: Vec<Arc<dyn StorageTier>>,
    remote: RemoteTier,
    snapshots: SnapshotManager,
    queue: Arc<SyncQueue>,
    validator: Validator,
    cleanup_interval: Duration,
    save_lock: Mutex<()>,
    last_save: Mutex<Option<DateTime<Utc>>>,
    last_cleanup: Mutex<Option<DateTime<Utc>>>,
}

impl PersistenceCoordinator {
    pub fn new(parts: CoordinatorParts) -> Self {
        let mut tiers = parts.tiers;
        tiers.push(Arc::new(parts.remote.clone()));
        Self {
            tiers,
            remote: parts.remote,
            snapshots: parts.snapshots,
            queue: parts.queue,
            validator: parts.validator,
            cleanup_interval: parts.cleanup_interval,
            save_lock: Mutex::new(()),
            last_save: Mutex::new(None),
            last_cleanup: Mutex::new(None),
        }
    }

    pub fn tiers(&self) -> &[Arc<dyn StorageTier>] {
        &self.tiers
    }

    pub fn tier(&self, name: TierName) -> Option<&Arc<dyn StorageTier>> {
        self.tiers.iter().find(|t| t.name() == name)
    }

    pub fn snapshots(&self) -> &SnapshotManager {
        &self.snapshots
    }

    pub fn queue(&self) -> &Arc<SyncQueue> {
        &self.queue
    }

    pub fn validator(&self) -> &Validator {
        &self.validator
    }

    pub fn remote(&self) -> &RemoteTier {
        &self.remote
    }

    pub fn is_saving(&self) -> bool {
        self.save_lock.try_lock().is_err()
    }

    /// Save a typed dataset to every tier.
    pub async fn save(&self, records: &[ParcelRecord], options: SaveOptions) -> Result<SaveResult, SaveError> {
        let _saving = self.save_lock.lock().await;
        let report = self.validator.validate_records(records);
        self.check_report(&report, &options)?;
        self.fan_out(records, options, report.warnings).await
    }

    /// Save an untyped candidate. Structural problems abort before any tier is touched.
    pub async fn save_value(&self, candidate: serde_json::Value, options: SaveOptions) -> Result<SaveResult, SaveError> {
        let _saving = self.save_lock.lock().await;
        let CoercedDataset { records, report } = self.validator.coerce(&candidate);
        self.check_report(&report, &options)?;
        self.fan_out(&records, options, report.warnings).await
    }

    fn check_report(&self, report: &ValidationReport, options: &SaveOptions) -> Result<(), SaveError> {
        if report.is_critical {
            for issue in &report.errors {
                tracing::error!(reason = %options.source, issue = %issue, "save rejected by validation");
            }
            return Err(SaveError::ValidationCritical(report.clone()));
        }
        for issue in &report.warnings {
            tracing::warn!(reason = %options.source, issue = %issue, "validation warning");
        }
        Ok(())
    }

    async fn fan_out(
        &self,
        records: &[ParcelRecord],
        options: SaveOptions,
        warnings: Vec<ValidationIssue>,
    ) -> Result<SaveResult, SaveError> {
        let metadata = DatasetMetadata::compute(records, &options.source, Utc::now());
        let payload = envelope::encode(records, &metadata)?;

        // Queued replays must not reach the remote while this save writes to it.
        let delivery = self.queue.hold_delivery().await;
        let outcomes = join_all(self.tiers.iter().map(|tier| {
            let payload = payload.as_str();
            async move {
                let outcome = write_tier(tier.as_ref(), payload).await;
                (tier.name(), tier.capabilities().durable(), outcome)
            }
        }))
        .await;

        let mut per_tier = BTreeMap::new();
        let mut failures = Vec::new();
        let mut success_count = 0;
        let mut remote_ok = false;
        for (tier, durable, outcome) in outcomes {
            match outcome {
                Ok(()) => {
                    tracing::debug!(%tier, count = metadata.count, "tier write ok");
                    if durable {
                        success_count += 1;
                    }
                    remote_ok |= tier == TierName::Remote;
                    per_tier.insert(tier, true);
                }
                Err(e) => {
                    tracing::warn!(%tier, reason = %e, count = metadata.count, "tier write failed");
                    failures.push(TierFailure {
                        tier,
                        reason: e.to_string(),
                    });
                    per_tier.insert(tier, false);
                }
            }
        }

        if let Some(local) = self.tier(TierName::Local) {
            let meta_json = serde_json::to_string(&metadata)?;
            if let Err(e) = local.write(DATASET_METADATA, &meta_json).await {
                tracing::warn!(tier = %TierName::Local, reason = %e, "could not record dataset metadata");
            }
        }

        let mut queued = false;
        let mut queue_error = None;
        if remote_ok {
            // The remote now holds this dataset; older queued copies would overwrite it.
            if let Err(e) = self.queue.supersede(MAIN_DATASET, metadata.timestamp).await {
                tracing::warn!(reason = %e, "could not drop superseded queued writes");
            }
        } else if self.remote.store().is_some() && success_count >= QUORUM {
            match self.queue.enqueue(MAIN_DATASET, payload.clone()).await {
                Ok(item) => {
                    tracing::info!(id = %item.id, count = metadata.count, "remote write deferred to sync queue");
                    queued = true;
                }
                Err(e) => {
                    tracing::error!(reason = %e, count = metadata.count, "could not queue remote write");
                    queue_error = Some(e.to_string());
                }
            }
        }
        drop(delivery);

        let snapshot_saved = match self
            .snapshots
            .append(records, &metadata, options.snapshot_kind)
            .await
        {
            Ok(_) => true,
            Err(e) => {
                tracing::warn!(reason = %e, "snapshot append failed");
                false
            }
        };

        if success_count < QUORUM {
            tracing::error!(
                success_count,
                required = QUORUM,
                reason = %options.source,
                count = metadata.count,
                "coordinated save failed quorum"
            );
            return Err(SaveError::QuorumFailure {
                success_count,
                required: QUORUM,
                per_tier,
                failures,
            });
        }

        *self.last_save.lock().await = Some(metadata.timestamp);
        tracing::info!(
            success_count,
            count = metadata.count,
            reason = %options.source,
            queued,
            "coordinated save complete"
        );

        if remote_ok && !self.queue.is_empty().await {
            if let Err(e) = self.drain_queue().await {
                tracing::warn!(reason = %e, "opportunistic queue drain failed");
            }
        }
        self.maybe_cleanup(metadata.timestamp).await;

        Ok(SaveResult {
            per_tier,
            metadata,
            success_count,
            snapshot_saved,
            queued,
            queue_error,
            warnings,
        })
    }

    /// Flush the sync queue if a remote store is configured and the network is up.
    pub async fn drain_queue(&self) -> Result<Option<DrainReport>, QueueError> {
        let Some(store) = self.remote.reachable_store() else {
            return Ok(None);
        };
        self.queue.drain(store.as_ref()).await.map(Some)
    }

    /// Prune snapshots past retention.
    pub async fn run_cleanup(&self, now: DateTime<Utc>) -> Result<usize, SnapshotError> {
        let removed = self.snapshots.prune(now).await?;
        *self.last_cleanup.lock().await = Some(now);
        Ok(removed)
    }

    async fn maybe_cleanup(&self, now: DateTime<Utc>) {
        let due = match *self.last_cleanup.lock().await {
            Some(last) => now - last >= self.cleanup_interval,
            None => true,
        };
        if due && let Err(e) = self.run_cleanup(now).await {
            tracing::warn!(reason = %e, "cleanup pass failed");
        }
    }

    pub async fn last_save_time(&self) -> Option<DateTime<Utc>> {
        *self.last_save.lock().await
    }

    pub async fn status(&self) -> CoordinatorStatus {
        let ready = join_all(self.tiers.iter().map(|tier| async move { (tier.name(), tier.is_ready().await) })).await;
        CoordinatorStatus {
            tiers_ready: ready.into_iter().collect(),
            last_save_time: self.last_save_time().await,
            pending_count: self.queue.len().await,
            dead_letter_count: self.queue.dead_letters().await.len(),
            is_saving: self.is_saving(),
            online: self.remote.network().is_online(),
        }
    }
}

/// Write the dataset to one tier. A quota error frees low-priority keys on that tier
/// and retries exactly once.
async fn write_tier(tier: &dyn StorageTier, payload: &str) -> Result<(), TierError> {
    let key = keys::dataset_key(tier.name());
    match tier.write(key, payload).await {
        Err(e) if e.is_quota() => {
            tracing::warn!(tier = %tier.name(), reason = %e, "quota exceeded, freeing low-priority keys");
            let freed = free_low_priority(tier).await;
            tracing::info!(tier = %tier.name(), freed, attempt = 2, "retrying write after cleanup");
            tier.write(key, payload).await
        }
        other => other,
    }
}
