// ABOUTME: Durable FIFO of remote writes that could not be delivered while offline or failing.
// ABOUTME: Persisted in a local tier after every change; items leave only on remote acknowledgment or supersession.

use std::collections::VecDeque;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{Mutex, MutexGuard};
use ulid::Ulid;

use crate::keys::{SYNC_DEAD_LETTER, SYNC_QUEUE};
use crate::remote::RemoteStore;
use crate::tier::{StorageTier, TierError, free_low_priority};

/// Errors that can occur while persisting the queue.
#[derive(Debug, Error)]
pub enum QueueError {
    #[error("tier error: {0}")]
    Tier(#[from] TierError),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

/// One undelivered remote write.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncQueueItem {
    pub id: Ulid,
    pub key: String,
    pub payload: String,
    pub enqueued_at: DateTime<Utc>,
    pub attempts: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

/// Outcome of one drain pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DrainReport {
    pub succeeded: usize,
    pub still_pending: usize,
    pub dead_lettered: usize,
}

#[derive(Debug, Default)]
struct QueueState {
    pending: VecDeque<SyncQueueItem>,
    dead: Vec<SyncQueueItem>,
}

impl QueueState {
    fn position(&self, id: Ulid) -> Option<usize> {
        self.pending.iter().position(|item| item.id == id)
    }

    /// Drop pending and dead-lettered items for `key` enqueued at or before `through`.
    fn supersede(&mut self, key: &str, through: DateTime<Utc>) -> usize {
        let before = self.pending.len() + self.dead.len();
        let stale = |item: &SyncQueueItem| item.key == key && item.enqueued_at <= through;
        self.pending.retain(|item| !stale(item));
        self.dead.retain(|item| !stale(item));
        before - self.pending.len() - self.dead.len()
    }
}

/// The offline write queue. Holds at most one pending write per key: a newer write
/// to a key supersedes the older one. `max_attempts = None` retries forever; otherwise
/// an item that fails that many drains is moved to the dead-letter list.
pub struct SyncQueue {
    store: Arc<dyn StorageTier>,
    max_attempts: Option<u32>,
    state: Mutex<QueueState>,
    delivery: Mutex<()>,
}

impl SyncQueue {
    /// Rebuild the queue from its persisted form.
    pub async fn load(store: Arc<dyn StorageTier>, max_attempts: Option<u32>) -> Result<Self, QueueError> {
        let pending: VecDeque<SyncQueueItem> = load_list(store.as_ref(), SYNC_QUEUE).await?;
        let dead: Vec<SyncQueueItem> = load_list(store.as_ref(), SYNC_DEAD_LETTER).await?;

        if !pending.is_empty() || !dead.is_empty() {
            tracing::info!(
                pending = pending.len(),
                dead_letter = dead.len(),
                tier = %store.name(),
                "sync queue restored"
            );
        }

        Ok(Self {
            store,
            max_attempts,
            state: Mutex::new(QueueState { pending, dead }),
            delivery: Mutex::new(()),
        })
    }

    /// Queue a write for later delivery and persist the queue. Any older write to the
    /// same key, pending or dead-lettered, is replaced.
    pub async fn enqueue(&self, key: &str, payload: String) -> Result<SyncQueueItem, QueueError> {
        let item = SyncQueueItem {
            id: Ulid::new(),
            key: key.to_string(),
            payload,
            enqueued_at: Utc::now(),
            attempts: 0,
            last_error: None,
        };

        let mut state = self.state.lock().await;
        let superseded = state.supersede(key, item.enqueued_at);
        state.pending.push_back(item.clone());
        tracing::info!(key, pending = state.pending.len(), superseded, "queued remote write");
        self.persist(&state).await?;
        Ok(item)
    }

    /// Forget queued writes to `key` made at or before `through`, because a newer value
    /// already reached the remote. Returns how many items were dropped.
    pub async fn supersede(&self, key: &str, through: DateTime<Utc>) -> Result<usize, QueueError> {
        let mut state = self.state.lock().await;
        let dropped = state.supersede(key, through);
        if dropped > 0 {
            tracing::info!(key, dropped, "queued writes superseded by a delivered write");
            self.persist(&state).await?;
        }
        Ok(dropped)
    }

    /// Exclusive access to the remote for queued deliveries. Drains wait while the
    /// guard is held, so a direct remote write cannot interleave with a replay.
    pub async fn hold_delivery(&self) -> MutexGuard<'_, ()> {
        self.delivery.lock().await
    }

    /// Deliver the items pending when the drain starts, in FIFO order. Each item stays
    /// in the persisted queue until the remote acknowledges it. A failed item keeps its
    /// place with `attempts + 1`. Only one drain runs at a time.
    pub async fn drain(&self, remote: &dyn RemoteStore) -> Result<DrainReport, QueueError> {
        let _delivering = self.delivery.lock().await;

        let batch: Vec<Ulid> = self.state.lock().await.pending.iter().map(|item| item.id).collect();
        if batch.is_empty() {
            return Ok(DrainReport::default());
        }

        let mut report = DrainReport::default();
        for id in batch {
            let item = {
                let state = self.state.lock().await;
                match state.position(id) {
                    Some(pos) => state.pending[pos].clone(),
                    // Superseded while an earlier item was in flight.
                    None => continue,
                }
            };

            let outcome = remote.put(&item.key, &item.payload).await;

            let mut state = self.state.lock().await;
            match outcome {
                Ok(()) => {
                    report.succeeded += 1;
                    if let Some(pos) = state.position(id) {
                        state.pending.remove(pos);
                    }
                    tracing::debug!(id = %item.id, key = %item.key, attempts = item.attempts, "queued write delivered");
                }
                Err(e) => {
                    let Some(pos) = state.position(id) else {
                        continue;
                    };
                    let attempts = {
                        let entry = &mut state.pending[pos];
                        entry.attempts += 1;
                        entry.last_error = Some(e.to_string());
                        entry.attempts
                    };
                    if self.max_attempts.is_some_and(|max| attempts >= max) {
                        tracing::error!(
                            id = %item.id,
                            key = %item.key,
                            attempts,
                            error = %e,
                            "queued write moved to dead-letter list"
                        );
                        if let Some(dead) = state.pending.remove(pos) {
                            state.dead.push(dead);
                        }
                        report.dead_lettered += 1;
                    } else {
                        tracing::warn!(id = %item.id, key = %item.key, attempts, error = %e, "queued write failed, kept in queue");
                    }
                }
            }
            self.persist(&state).await?;
        }

        report.still_pending = self.state.lock().await.pending.len();
        tracing::info!(
            succeeded = report.succeeded,
            still_pending = report.still_pending,
            dead_lettered = report.dead_lettered,
            "sync queue drained"
        );
        Ok(report)
    }

    pub async fn len(&self) -> usize {
        self.state.lock().await.pending.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.state.lock().await.pending.is_empty()
    }

    pub async fn pending(&self) -> Vec<SyncQueueItem> {
        self.state.lock().await.pending.iter().cloned().collect()
    }

    pub async fn dead_letters(&self) -> Vec<SyncQueueItem> {
        self.state.lock().await.dead.clone()
    }

    /// Move every dead-lettered item back to the end of the queue with a fresh attempt count.
    pub async fn requeue_dead_letters(&self) -> Result<usize, QueueError> {
        let mut state = self.state.lock().await;
        let dead = std::mem::take(&mut state.dead);
        let count = dead.len();
        for mut item in dead {
            item.attempts = 0;
            state.pending.push_back(item);
        }
        self.persist(&state).await?;
        Ok(count)
    }

    /// Write the queue out. A quota error frees low-priority keys on the store and
    /// retries exactly once.
    async fn persist(&self, state: &QueueState) -> Result<(), QueueError> {
        match self.write_lists(state).await {
            Err(QueueError::Tier(e)) if e.is_quota() => {
                tracing::warn!(tier = %self.store.name(), reason = %e, "queue write over quota, freeing low-priority keys");
                let freed = free_low_priority(self.store.as_ref()).await;
                tracing::info!(tier = %self.store.name(), freed, attempt = 2, "retrying queue write after cleanup");
                self.write_lists(state).await
            }
            other => other,
        }
    }

    async fn write_lists(&self, state: &QueueState) -> Result<(), QueueError> {
        let pending = serde_json::to_string(&state.pending)?;
        self.store.write(SYNC_QUEUE, &pending).await?;
        if state.dead.is_empty() {
            self.store.clear(SYNC_DEAD_LETTER).await?;
        } else {
            let dead = serde_json::to_string(&state.dead)?;
            self.store.write(SYNC_DEAD_LETTER, &dead).await?;
        }
        Ok(())
    }
}

async fn load_list<T>(store: &dyn StorageTier, key: &str) -> Result<T, QueueError>
where
    T: Default + serde::de::DeserializeOwned,
{
    let Some(raw) = store.read(key).await? else {
        return Ok(T::default());
    };
    match serde_json::from_str(&raw) {
        Ok(list) => Ok(list),
        Err(e) => {
            // Keep the unreadable payload around for inspection instead of overwriting it.
            let quarantine = format!("{key}.corrupt");
            tracing::error!(key, error = %e, quarantine = %quarantine, "persisted queue is unreadable");
            store.write(&quarantine, &raw).await?;
            Ok(T::default())
        }
    }
}
