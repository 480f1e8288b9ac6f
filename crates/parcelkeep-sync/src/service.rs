// ABOUTME: The assembled persistence engine: tiers, coordinator, scheduler, entity state, and backups.
// ABOUTME: Owns the in-memory parcel model and a watcher task that drains the sync queue on reconnect.

use std::sync::{Arc, PoisonError, RwLock};

use chrono::Utc;
use parcelkeep_core::{ColorState, ParcelRecord, StateEvent};
use parcelkeep_store::{
    BackupKind, EmbeddedTier, EnvelopeError, HttpRemoteStore, LocalTier, MemoryTier, NetworkMonitor, QueueError,
    RemoteError, RemoteStore, RemoteTier, SessionTier, SnapshotManager, StorageTier, SyncQueue, TierError, envelope,
};
use thiserror::Error;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;

use crate::backup::{BackupError, BackupOutcome, BackupService};
use crate::config::EngineConfig;
use crate::coordinator::{
    CoordinatorParts, CoordinatorStatus, PersistenceCoordinator, SaveError, SaveOptions, SaveResult,
};
use crate::restore::{RestoreOutcome, RestoreResolver};
use crate::scheduler::{
    AutoSaveHandle, AutoSaveScheduler, DatasetSource, SaveNotice, SchedulerError, SchedulerSettings, TriggerReason,
};
use crate::state_store::{StateError, StateStore};

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("tier error: {0}")]
    Tier(#[from] TierError),

    #[error("sync queue error: {0}")]
    Queue(#[from] QueueError),

    #[error("remote store error: {0}")]
    Remote(#[from] RemoteError),

    #[error("save failed: {0}")]
    Save(#[from] SaveError),

    #[error("scheduler error: {0}")]
    Scheduler(#[from] SchedulerError),

    #[error("state error: {0}")]
    State(#[from] StateError),

    #[error("backup error: {0}")]
    Backup(#[from] BackupError),

    #[error("import rejected: {0}")]
    Import(#[from] EnvelopeError),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

/// The live dataset the UI edits. The scheduler reads it on every save.
#[derive(Debug, Default)]
pub struct ParcelModel {
    records: RwLock<Vec<ParcelRecord>>,
}

impl ParcelModel {
    pub fn all(&self) -> Vec<ParcelRecord> {
        self.records.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn get(&self, id: &str) -> Option<ParcelRecord> {
        self.records
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .find(|r| r.id == id)
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.records.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn replace_all(&self, records: Vec<ParcelRecord>) {
        *self.records.write().unwrap_or_else(PoisonError::into_inner) = records;
    }

    /// Insert or replace by id.
    pub fn upsert(&self, record: ParcelRecord) {
        let mut records = self.records.write().unwrap_or_else(PoisonError::into_inner);
        match records.iter_mut().find(|r| r.id == record.id) {
            Some(existing) => *existing = record,
            None => records.push(record),
        }
    }

    pub fn remove(&self, id: &str) -> Option<ParcelRecord> {
        let mut records = self.records.write().unwrap_or_else(PoisonError::into_inner);
        let index = records.iter().position(|r| r.id == id)?;
        Some(records.remove(index))
    }

    fn set_color(&self, id: &str, color_index: Option<i64>) -> bool {
        let mut records = self.records.write().unwrap_or_else(PoisonError::into_inner);
        let Some(record) = records.iter_mut().find(|r| r.id == id) else {
            return false;
        };
        record.color_index = color_index;
        record.updated_at = Utc::now();
        true
    }
}

impl DatasetSource for ParcelModel {
    fn current(&self) -> Vec<ParcelRecord> {
        self.all()
    }
}

/// Pieces a host may inject instead of letting the service build them.
pub struct ServiceOptions {
    /// Overrides `config.remote_url`.
    pub remote: Option<Arc<dyn RemoteStore>>,
    /// Hand the same session to a rebuilt service to model a reload.
    pub session: SessionTier,
    pub network: NetworkMonitor,
}

impl Default for ServiceOptions {
    fn default() -> Self {
        Self {
            remote: None,
            session: SessionTier::new(),
            network: NetworkMonitor::new(true),
        }
    }
}

pub struct PersistenceService {
    config: EngineConfig,
    coordinator: Arc<PersistenceCoordinator>,
    state: Arc<StateStore>,
    model: Arc<ParcelModel>,
    scheduler: AutoSaveHandle,
    network: NetworkMonitor,
    backups: BackupService,
    watcher: JoinHandle<()>,
}

impl PersistenceService {
    /// Open every tier under `config.home` and start the scheduler and network watcher.
    /// An embedded database that cannot be opened leaves the engine running without it.
    pub async fn open(config: EngineConfig, options: ServiceOptions) -> Result<Self, ServiceError> {
        let local = Arc::new(LocalTier::open(&config.local_dir(), config.local_quota_bytes)?);
        let embedded = match EmbeddedTier::open(&config.db_path()) {
            Ok(tier) => Some(Arc::new(tier)),
            Err(e) => {
                tracing::warn!(path = %config.db_path().display(), reason = %e, "embedded tier unavailable");
                None
            }
        };

        let remote_store = match (options.remote, config.remote_url.as_deref()) {
            (Some(store), _) => Some(store),
            (None, Some(url)) => Some(Arc::new(HttpRemoteStore::new(url)?) as Arc<dyn RemoteStore>),
            (None, None) => None,
        };
        let remote = RemoteTier::new(remote_store, options.network.clone());

        let mut tiers: Vec<Arc<dyn StorageTier>> = vec![
            Arc::new(MemoryTier::new()) as Arc<dyn StorageTier>,
            local.clone(),
            Arc::new(options.session),
        ];
        if let Some(embedded) = &embedded {
            tiers.push(embedded.clone());
        }

        let queue = Arc::new(SyncQueue::load(local.clone(), config.queue_max_attempts).await?);
        let coordinator = Arc::new(PersistenceCoordinator::new(CoordinatorParts {
            tiers,
            remote: remote.clone(),
            snapshots: SnapshotManager::new(embedded.clone(), local.clone(), config.snapshot_policy()),
            queue,
            validator: config.validator(),
            cleanup_interval: chrono::Duration::from_std(config.cleanup_interval)
                .unwrap_or_else(|_| chrono::Duration::hours(1)),
        }));

        let state = Arc::new(StateStore::load(local.clone(), remote).await);
        let model = Arc::new(ParcelModel::default());
        let scheduler = AutoSaveScheduler::spawn(
            coordinator.clone(),
            model.clone(),
            local.clone(),
            SchedulerSettings::from_config(&config),
        );

        let backup_target = match embedded {
            Some(embedded) => embedded as Arc<dyn StorageTier>,
            None => local as Arc<dyn StorageTier>,
        };

        let watcher = tokio::spawn(watch_network(
            options.network.subscribe(),
            coordinator.clone(),
            scheduler.clone(),
        ));

        tracing::info!(
            home = %config.home.display(),
            tiers = coordinator.tiers().len(),
            remote = coordinator.remote().store().is_some(),
            "persistence service ready"
        );

        Ok(Self {
            config,
            coordinator,
            state,
            model,
            scheduler,
            network: options.network,
            backups: BackupService::new(backup_target),
            watcher,
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn coordinator(&self) -> &Arc<PersistenceCoordinator> {
        &self.coordinator
    }

    pub fn state(&self) -> &StateStore {
        &self.state
    }

    pub fn model(&self) -> &ParcelModel {
        &self.model
    }

    pub fn scheduler(&self) -> &AutoSaveHandle {
        &self.scheduler
    }

    pub fn network(&self) -> &NetworkMonitor {
        &self.network
    }

    /// Resolve the authoritative dataset and load it into the model.
    pub async fn restore(&self) -> Result<RestoreOutcome, ServiceError> {
        let outcome = RestoreResolver::restore(&self.coordinator).await;
        self.model.replace_all(outcome.records.clone());
        for record in &outcome.records {
            self.state.refresh_marker(record).await?;
        }
        Ok(outcome)
    }

    /// An explicit save of the whole model, bypassing the scheduler.
    pub async fn save_now(&self, options: SaveOptions) -> Result<SaveResult, ServiceError> {
        Ok(self.coordinator.save(&self.model.all(), options).await?)
    }

    /// A committed edit: store the record, refresh its marker, save immediately.
    pub async fn upsert_parcel(&self, record: ParcelRecord) -> Result<(), ServiceError> {
        self.apply_edit(record, TriggerReason::ParcelSave).await
    }

    /// Keystroke-level edit. Saves are debounced.
    pub async fn record_input(&self, record: ParcelRecord) -> Result<(), ServiceError> {
        self.apply_edit(record, TriggerReason::FormInput).await
    }

    async fn apply_edit(&self, mut record: ParcelRecord, reason: TriggerReason) -> Result<(), ServiceError> {
        record.updated_at = Utc::now();
        self.state.refresh_marker(&record).await?;
        self.model.upsert(record);
        self.scheduler.trigger(reason).await?;
        Ok(())
    }

    /// Remove a parcel along with its color and marker state.
    pub async fn delete_parcel(&self, parcel_id: &str) -> Result<bool, ServiceError> {
        let removed = self.model.remove(parcel_id).is_some();
        self.state.forget_parcel(parcel_id).await?;
        if removed {
            self.scheduler.trigger(TriggerReason::ParcelDelete).await?;
        }
        Ok(removed)
    }

    /// Apply or toggle off a palette color, mirroring it onto the record.
    pub async fn apply_color(
        &self,
        parcel_id: &str,
        color_index: i64,
        applied_by: &str,
    ) -> Result<Option<ColorState>, ServiceError> {
        let state = self.state.save_color_state(parcel_id, color_index, applied_by).await?;
        let resulting = state.as_ref().map(|s| s.color_index);
        if self.model.set_color(parcel_id, resulting) {
            self.scheduler.trigger(TriggerReason::ColorChange).await?;
        }
        Ok(state)
    }

    pub async fn clear_color(&self, parcel_id: &str) -> Result<(), ServiceError> {
        self.state.remove_color_state(parcel_id).await?;
        if self.model.set_color(parcel_id, None) {
            self.scheduler.trigger(TriggerReason::ColorChange).await?;
        }
        Ok(())
    }

    /// Replace the model with an imported dataset and save it as a manual snapshot.
    pub async fn import(&self, raw: &str) -> Result<SaveResult, ServiceError> {
        let decoded = envelope::decode(raw, self.coordinator.validator())?;
        let result = self
            .coordinator
            .save(&decoded.records, SaveOptions::reason("import").manual())
            .await?;
        for record in &decoded.records {
            self.state.refresh_marker(record).await?;
        }
        self.model.replace_all(decoded.records);
        Ok(result)
    }

    pub fn export(&self) -> Result<String, ServiceError> {
        let records = self.model.all();
        let metadata = parcelkeep_core::DatasetMetadata::compute(&records, "export", Utc::now());
        Ok(envelope::encode(&records, &metadata)?)
    }

    pub async fn run_backup_if_due(&self, kind: BackupKind) -> Result<BackupOutcome, ServiceError> {
        Ok(self.backups.run_if_due(kind, &self.model.all(), Utc::now()).await?)
    }

    pub async fn status(&self) -> CoordinatorStatus {
        self.coordinator.status().await
    }

    pub fn subscribe_state(&self) -> broadcast::Receiver<StateEvent> {
        self.state.subscribe()
    }

    pub fn subscribe_saves(&self) -> broadcast::Receiver<SaveNotice> {
        self.scheduler.subscribe()
    }

    /// Synchronous last-chance write for process teardown.
    pub fn unload(&self) -> Result<(), ServiceError> {
        Ok(self.scheduler.unload()?)
    }

    /// Save anything pending and stop background work.
    pub async fn shutdown(self) -> Result<(), ServiceError> {
        self.watcher.abort();
        self.scheduler.shutdown().await?;
        self.state.flush_pushes().await;
        Ok(())
    }
}

impl Drop for PersistenceService {
    fn drop(&mut self) {
        self.watcher.abort();
    }
}

/// On every offline-to-online flip: drain the queue, then ask for a fresh save.
async fn watch_network(
    mut online: watch::Receiver<bool>,
    coordinator: Arc<PersistenceCoordinator>,
    scheduler: AutoSaveHandle,
) {
    let mut was_online = *online.borrow_and_update();
    while online.changed().await.is_ok() {
        let now_online = *online.borrow_and_update();
        if now_online && !was_online {
            match coordinator.drain_queue().await {
                Ok(Some(report)) => tracing::info!(
                    succeeded = report.succeeded,
                    pending = report.still_pending,
                    dead = report.dead_lettered,
                    "sync queue drained on reconnect"
                ),
                Ok(None) => {}
                Err(e) => tracing::warn!(reason = %e, "sync queue drain failed"),
            }
            if scheduler.trigger(TriggerReason::NetworkReconnect).await.is_err() {
                break;
            }
        }
        was_online = now_online;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use parcelkeep_store::keys;
    use parcelkeep_store::testing::MemoryRemoteStore;
    use tempfile::TempDir;

    fn quiet_config(home: &std::path::Path) -> EngineConfig {
        let mut config = EngineConfig::for_home(home);
        config.periodic_interval = Duration::from_secs(3600);
        config.debounce = Duration::from_millis(20);
        config
    }

    async fn open_with(home: &std::path::Path, remote: Arc<MemoryRemoteStore>, network: NetworkMonitor) -> PersistenceService {
        PersistenceService::open(
            quiet_config(home),
            ServiceOptions {
                remote: Some(remote),
                session: SessionTier::new(),
                network,
            },
        )
        .await
        .unwrap()
    }

    #[test]
    fn model_upsert_replaces_by_id() {
        let model = ParcelModel::default();
        model.upsert(ParcelRecord::new("a").with_memo("one"));
        model.upsert(ParcelRecord::new("b"));
        model.upsert(ParcelRecord::new("a").with_memo("two"));

        assert_eq!(model.len(), 2);
        assert_eq!(model.get("a").unwrap().memo.as_deref(), Some("two"));
        assert!(model.remove("a").is_some());
        assert!(model.remove("a").is_none());
    }

    #[tokio::test]
    async fn manual_save_during_scheduled_flush_is_not_rejected() {
        let dir = TempDir::new().unwrap();
        let remote = Arc::new(MemoryRemoteStore::new());
        let service = open_with(dir.path(), remote.clone(), NetworkMonitor::new(true)).await;
        service.model().upsert(ParcelRecord::new("PNU-1").with_memo("note"));

        remote.hold_puts();
        let (scheduled, manual, ()) = tokio::join!(
            service.scheduler().flush(),
            service.save_now(SaveOptions::reason("manual")),
            async {
                remote.put_started().await;
                remote.release_puts(2);
            }
        );

        assert_eq!(scheduled.unwrap().metadata.count, 1);
        assert_eq!(manual.unwrap().metadata.count, 1);
        assert_eq!(remote.put_calls(), 2);

        service.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn delete_cascades_to_entity_state() {
        let dir = TempDir::new().unwrap();
        let service = open_with(dir.path(), Arc::new(MemoryRemoteStore::new()), NetworkMonitor::new(true)).await;

        service
            .upsert_parcel(ParcelRecord::new("PNU-1").with_memo("note"))
            .await
            .unwrap();
        service.apply_color("PNU-1", 2, "tester").await.unwrap();
        assert!(service.state().color_state("PNU-1").is_some());
        assert!(service.state().marker_state("PNU-1").is_some());

        assert!(service.delete_parcel("PNU-1").await.unwrap());
        assert!(service.model().is_empty());
        assert!(service.state().color_state("PNU-1").is_none());
        assert!(service.state().marker_state("PNU-1").is_none());

        service.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn color_toggle_is_mirrored_on_the_record() {
        let dir = TempDir::new().unwrap();
        let service = open_with(dir.path(), Arc::new(MemoryRemoteStore::new()), NetworkMonitor::new(true)).await;
        service.upsert_parcel(ParcelRecord::new("PNU-1")).await.unwrap();

        let applied = service.apply_color("PNU-1", 3, "tester").await.unwrap();
        assert_eq!(applied.map(|s| s.color_index), Some(3));
        assert_eq!(service.model().get("PNU-1").unwrap().color_index, Some(3));

        let toggled = service.apply_color("PNU-1", 3, "tester").await.unwrap();
        assert!(toggled.is_none());
        assert_eq!(service.model().get("PNU-1").unwrap().color_index, None);

        service.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn reconnect_drains_queued_remote_writes() {
        let dir = TempDir::new().unwrap();
        let remote = Arc::new(MemoryRemoteStore::new());
        let network = NetworkMonitor::new(false);
        let service = open_with(dir.path(), remote.clone(), network.clone()).await;

        service.model().upsert(ParcelRecord::new("PNU-1").with_memo("offline edit"));
        let saved = service.save_now(SaveOptions::default()).await.unwrap();
        assert!(saved.queued);
        assert_eq!(remote.put_calls(), 0);

        network.set_online(true);
        for _ in 0..100 {
            if remote.peek(keys::MAIN_DATASET).is_some() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(remote.peek(keys::MAIN_DATASET).unwrap().contains("offline edit"));

        service.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn import_rejects_critical_payloads() {
        let dir = TempDir::new().unwrap();
        let service = open_with(dir.path(), Arc::new(MemoryRemoteStore::new()), NetworkMonitor::new(true)).await;

        assert!(matches!(
            service.import(r#"{"records": 42}"#).await,
            Err(ServiceError::Import(_))
        ));

        let result = service.import(r#"[{"id":"PNU-9","memo":"imported"}]"#).await.unwrap();
        assert_eq!(result.metadata.count, 1);
        assert_eq!(service.model().len(), 1);
        assert!(service.export().unwrap().contains("PNU-9"));

        service.shutdown().await.unwrap();
    }
}
