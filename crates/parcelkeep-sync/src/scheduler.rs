// ABOUTME: Auto-save actor: classifies trigger reasons into immediate, debounced, and periodic saves.
// ABOUTME: Retries failed saves with backoff, falls back to an emergency backup, and handles unload synchronously.

use std::collections::{BTreeSet, VecDeque};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parcelkeep_core::{DatasetMetadata, ParcelRecord};
use parcelkeep_store::keys::{EMERGENCY_BACKUP, MAIN_DATASET};
use parcelkeep_store::{SyncStorageTier, TierError, envelope};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::time::{Instant, MissedTickBehavior, interval_at, sleep, sleep_until};

use crate::config::EngineConfig;
use crate::coordinator::{PersistenceCoordinator, SaveError, SaveOptions, SaveResult};
use crate::retry::{BackoffPolicy, RetryPolicy};

/// Errors surfaced by the scheduler handle.
#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("scheduler stopped")]
    ChannelClosed,

    #[error(transparent)]
    Save(#[from] SaveError),
}

/// Why a save was requested.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub enum TriggerReason {
    ParcelSave,
    ColorChange,
    ParcelDelete,
    FormInput,
    FormChange,
    UserClick,
    MapClick,
    Periodic,
    NetworkReconnect,
    Retry(Box<TriggerReason>),
    Other(String),
}

/// How soon a trigger leads to a save.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerClass {
    Immediate,
    Debounced,
    Periodic,
}

impl TriggerReason {
    pub fn parse(reason: &str) -> Self {
        match reason {
            "parcel_save" => Self::ParcelSave,
            "color_change" => Self::ColorChange,
            "parcel_delete" => Self::ParcelDelete,
            "form_input" => Self::FormInput,
            "form_change" => Self::FormChange,
            "user_click" => Self::UserClick,
            "map_click" => Self::MapClick,
            "periodic" => Self::Periodic,
            "network_reconnect" => Self::NetworkReconnect,
            other => match other.strip_prefix("retry_") {
                Some(inner) => Self::Retry(Box::new(Self::parse(inner))),
                None => Self::Other(other.to_string()),
            },
        }
    }

    pub fn classify(&self) -> TriggerClass {
        match self {
            Self::ParcelSave | Self::ColorChange | Self::ParcelDelete | Self::NetworkReconnect | Self::Retry(_) => {
                TriggerClass::Immediate
            }
            Self::FormInput | Self::FormChange | Self::UserClick | Self::MapClick | Self::Other(_) => {
                TriggerClass::Debounced
            }
            Self::Periodic => TriggerClass::Periodic,
        }
    }
}

impl fmt::Display for TriggerReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ParcelSave => f.write_str("parcel_save"),
            Self::ColorChange => f.write_str("color_change"),
            Self::ParcelDelete => f.write_str("parcel_delete"),
            Self::FormInput => f.write_str("form_input"),
            Self::FormChange => f.write_str("form_change"),
            Self::UserClick => f.write_str("user_click"),
            Self::MapClick => f.write_str("map_click"),
            Self::Periodic => f.write_str("periodic"),
            Self::NetworkReconnect => f.write_str("network_reconnect"),
            Self::Retry(inner) => write!(f, "retry_{inner}"),
            Self::Other(other) => f.write_str(other),
        }
    }
}

impl From<&str> for TriggerReason {
    fn from(reason: &str) -> Self {
        Self::parse(reason)
    }
}

/// Read access to the current in-memory dataset.
pub trait DatasetSource: Send + Sync {
    fn current(&self) -> Vec<ParcelRecord>;
}

/// Published after every scheduled save attempt.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SaveNotice {
    Saved {
        reason: String,
        count: usize,
        success_count: usize,
    },
    Failed {
        reason: String,
        error: String,
        attempt: u32,
    },
    EmergencyBackup {
        error: String,
        count: usize,
    },
}

/// What lands in the emergency backup slot when retries are exhausted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmergencyBackupRecord {
    pub timestamp: DateTime<Utc>,
    pub error: String,
    pub triggers: Vec<String>,
    pub records: Vec<ParcelRecord>,
}

#[derive(Debug, Clone)]
pub struct SchedulerSettings {
    pub debounce: Duration,
    pub periodic_interval: Duration,
    pub min_save_gap: Duration,
    pub retry: RetryPolicy,
}

impl SchedulerSettings {
    pub fn from_config(config: &EngineConfig) -> Self {
        Self {
            debounce: config.debounce,
            periodic_interval: config.periodic_interval,
            min_save_gap: config.min_save_gap,
            retry: RetryPolicy {
                max_retries: config.save_retries,
                base_backoff: config.retry_base,
            },
        }
    }
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self {
            debounce: Duration::from_millis(1000),
            periodic_interval: Duration::from_secs(5),
            min_save_gap: Duration::from_secs(3),
            retry: RetryPolicy::default(),
        }
    }
}

enum Command {
    Trigger(TriggerReason),
    Flush(oneshot::Sender<Result<SaveResult, SaveError>>),
    Shutdown(oneshot::Sender<()>),
}

/// Public handle for the auto-save actor.
#[derive(Clone)]
pub struct AutoSaveHandle {
    cmd_tx: mpsc::Sender<Command>,
    notice_tx: broadcast::Sender<SaveNotice>,
    source: Arc<dyn DatasetSource>,
    local: Arc<dyn SyncStorageTier>,
}

impl AutoSaveHandle {
    /// Feed one trigger reason to the scheduler.
    pub async fn trigger(&self, reason: impl Into<TriggerReason>) -> Result<(), SchedulerError> {
        self.cmd_tx
            .send(Command::Trigger(reason.into()))
            .await
            .map_err(|_| SchedulerError::ChannelClosed)
    }

    /// Save now, regardless of pending triggers, and wait for the outcome.
    pub async fn flush(&self) -> Result<SaveResult, SchedulerError> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::Flush(tx))
            .await
            .map_err(|_| SchedulerError::ChannelClosed)?;
        Ok(rx.await.map_err(|_| SchedulerError::ChannelClosed)??)
    }

    /// Save anything pending, then stop the actor.
    pub async fn shutdown(&self) -> Result<(), SchedulerError> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::Shutdown(tx))
            .await
            .map_err(|_| SchedulerError::ChannelClosed)?;
        rx.await.map_err(|_| SchedulerError::ChannelClosed)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SaveNotice> {
        self.notice_tx.subscribe()
    }

    /// Teardown path: one blocking write of the current dataset to the local tier.
    /// No remote call, no quorum.
    pub fn unload(&self) -> Result<(), TierError> {
        let records = self.source.current();
        let metadata = DatasetMetadata::compute(&records, "unload", Utc::now());
        let payload = envelope::encode(&records, &metadata)
            .map_err(|e| TierError::backend(parcelkeep_store::TierName::Local, e))?;
        self.local.write_now(MAIN_DATASET, &payload)?;
        tracing::info!(count = records.len(), "dataset written on unload");
        Ok(())
    }
}

/// Spawns the auto-save actor.
pub struct AutoSaveScheduler;

impl AutoSaveScheduler {
    pub fn spawn(
        coordinator: Arc<PersistenceCoordinator>,
        source: Arc<dyn DatasetSource>,
        local: Arc<dyn SyncStorageTier>,
        settings: SchedulerSettings,
    ) -> AutoSaveHandle {
        let (cmd_tx, cmd_rx) = mpsc::channel(256);
        let (notice_tx, _) = broadcast::channel(64);

        let handle = AutoSaveHandle {
            cmd_tx,
            notice_tx: notice_tx.clone(),
            source: Arc::clone(&source),
            local: Arc::clone(&local),
        };

        let actor = SchedulerActor {
            coordinator,
            source,
            local,
            settings,
            cmd_rx,
            notice_tx,
            deferred: VecDeque::new(),
            pending: BTreeSet::new(),
            debounce_deadline: None,
            last_success: None,
        };
        tokio::spawn(actor.run());

        handle
    }
}

enum Wake {
    Command(Option<Command>),
    DebounceElapsed,
    Tick,
}

struct SchedulerActor {
    coordinator: Arc<PersistenceCoordinator>,
    source: Arc<dyn DatasetSource>,
    local: Arc<dyn SyncStorageTier>,
    settings: SchedulerSettings,
    cmd_rx: mpsc::Receiver<Command>,
    notice_tx: broadcast::Sender<SaveNotice>,
    /// Non-trigger commands pulled off the channel while coalescing.
    deferred: VecDeque<Command>,
    pending: BTreeSet<TriggerReason>,
    debounce_deadline: Option<Instant>,
    last_success: Option<Instant>,
}

impl SchedulerActor {
    async fn run(mut self) {
        let period = self.settings.periodic_interval;
        let mut periodic = interval_at(Instant::now() + period, period);
        periodic.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            if let Some(cmd) = self.deferred.pop_front() {
                if !self.handle(cmd).await {
                    break;
                }
                continue;
            }

            let deadline = self.debounce_deadline;
            let wake = tokio::select! {
                cmd = self.cmd_rx.recv() => Wake::Command(cmd),
                _ = sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => Wake::DebounceElapsed,
                _ = periodic.tick() => Wake::Tick,
            };

            match wake {
                Wake::Command(None) => break,
                Wake::Command(Some(cmd)) => {
                    if !self.handle(cmd).await {
                        break;
                    }
                }
                Wake::DebounceElapsed => {
                    self.debounce_deadline = None;
                    self.save_pending().await;
                }
                Wake::Tick => self.on_periodic().await,
            }
        }
        tracing::debug!("auto-save scheduler stopped");
    }

    /// Returns false when the actor should stop.
    async fn handle(&mut self, cmd: Command) -> bool {
        match cmd {
            Command::Trigger(reason) => {
                match reason.classify() {
                    TriggerClass::Immediate => {
                        self.note(reason);
                        self.save_pending().await;
                    }
                    TriggerClass::Debounced => self.note(reason),
                    TriggerClass::Periodic => self.on_periodic().await,
                }
                true
            }
            Command::Flush(reply) => {
                self.pending.insert(TriggerReason::Other("flush".to_string()));
                let result = self.save_with_retry().await;
                let _ = reply.send(result);
                true
            }
            Command::Shutdown(reply) => {
                self.absorb_queued();
                if !self.pending.is_empty() {
                    let _ = self.save_with_retry().await;
                }
                let _ = reply.send(());
                false
            }
        }
    }

    fn note(&mut self, reason: TriggerReason) {
        match reason.classify() {
            // A periodic tick is not itself a change worth saving.
            TriggerClass::Periodic => return,
            // Single slot: a new trigger resets the timer instead of stacking.
            TriggerClass::Debounced => {
                self.debounce_deadline = Some(Instant::now() + self.settings.debounce);
            }
            TriggerClass::Immediate => {}
        }
        self.pending.insert(reason);
    }

    /// Pull triggers already waiting in the channel into the pending set.
    /// Returns whether any of them wants an immediate save.
    fn absorb_queued(&mut self) -> bool {
        let mut immediate = false;
        while let Ok(cmd) = self.cmd_rx.try_recv() {
            match cmd {
                Command::Trigger(reason) => {
                    immediate |= reason.classify() == TriggerClass::Immediate;
                    self.note(reason);
                }
                other => self.deferred.push_back(other),
            }
        }
        immediate
    }

    async fn on_periodic(&mut self) {
        if self.pending.is_empty() {
            return;
        }
        let gap_ok = self
            .last_success
            .is_none_or(|last| last.elapsed() >= self.settings.min_save_gap);
        if gap_ok {
            self.save_pending().await;
        }
    }

    /// Run one save covering every pending trigger, plus at most one follow-up save
    /// if an immediate trigger arrived while it was running.
    async fn save_pending(&mut self) {
        self.absorb_queued();
        if self.pending.is_empty() {
            return;
        }
        let _ = self.save_with_retry().await;

        if self.absorb_queued() {
            let _ = self.save_with_retry().await;
        }
    }

    async fn save_with_retry(&mut self) -> Result<SaveResult, SaveError> {
        let triggers: Vec<String> = self.pending.iter().map(ToString::to_string).collect();
        let reason = triggers.join(",");
        self.pending.clear();
        self.debounce_deadline = None;

        let mut attempt: u32 = 0;
        loop {
            attempt += 1;
            let records = self.source.current();
            let error = match self
                .coordinator
                .save(&records, SaveOptions::reason(reason.as_str()))
                .await
            {
                Ok(result) => {
                    self.last_success = Some(Instant::now());
                    self.notify(SaveNotice::Saved {
                        reason: reason.clone(),
                        count: result.metadata.count,
                        success_count: result.success_count,
                    });
                    return Ok(result);
                }
                Err(e) => e,
            };

            tracing::warn!(reason = %reason, attempt, error = %error, "scheduled save failed");
            self.notify(SaveNotice::Failed {
                reason: reason.clone(),
                error: error.to_string(),
                attempt,
            });

            // Retrying an identical dataset cannot fix a structural failure.
            let retryable = !matches!(error, SaveError::ValidationCritical(_));
            if retryable && attempt <= self.settings.retry.max_retries {
                sleep(self.settings.retry.delay_for_attempt(attempt)).await;
                continue;
            }

            tracing::error!(reason = %reason, attempt, error = %error, "save retries exhausted");
            self.emergency_backup(&records, &triggers, &error);
            return Err(error);
        }
    }

    fn emergency_backup(&self, records: &[ParcelRecord], triggers: &[String], error: &SaveError) {
        let backup = EmergencyBackupRecord {
            timestamp: Utc::now(),
            error: error.to_string(),
            triggers: triggers.to_vec(),
            records: records.to_vec(),
        };
        let written = serde_json::to_string(&backup)
            .map_err(|e| e.to_string())
            .and_then(|json| self.local.write_now(EMERGENCY_BACKUP, &json).map_err(|e| e.to_string()));
        match written {
            Ok(()) => {
                tracing::error!(count = records.len(), error = %error, "emergency backup written");
                self.notify(SaveNotice::EmergencyBackup {
                    error: error.to_string(),
                    count: records.len(),
                });
            }
            Err(e) => {
                tracing::error!(count = records.len(), reason = %e, "emergency backup failed");
            }
        }
    }

    fn notify(&self, notice: SaveNotice) {
        let _ = self.notice_tx.send(notice);
    }
}
