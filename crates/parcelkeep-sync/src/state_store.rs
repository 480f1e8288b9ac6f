// ABOUTME: Per-parcel color and marker state, replicated to the local tier and pushed to the remote in order.
// ABOUTME: Every change is published on a typed broadcast channel for UI observers.

use std::collections::BTreeMap;
use std::sync::{Arc, PoisonError, RwLock};

use parcelkeep_core::{ColorState, MarkerState, ParcelRecord, StateEvent};
use parcelkeep_store::keys::{COLOR_STATE_PREFIX, COLOR_STATES, MARKER_STATE_PREFIX, MARKER_STATES};
use parcelkeep_store::{RemoteTier, StorageTier};
use serde::Serialize;
use serde::de::DeserializeOwned;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc, oneshot};

/// Capacity of the remote push channel.
const PUSH_BUFFER: usize = 256;

/// Errors from entity state mutations.
#[derive(Debug, Error)]
pub enum StateError {
    #[error("unknown palette color index {0}")]
    UnknownColor(i64),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

/// A keyed map of one entity state, persisted as a whole under `storage_key`.
#[derive(Debug)]
pub struct EntityStore<T> {
    storage_key: &'static str,
    entries: RwLock<BTreeMap<String, T>>,
}

impl<T> EntityStore<T>
where
    T: Clone + Serialize + DeserializeOwned,
{
    pub fn new(storage_key: &'static str) -> Self {
        Self {
            storage_key,
            entries: RwLock::new(BTreeMap::new()),
        }
    }

    pub fn from_json(storage_key: &'static str, raw: &str) -> Result<Self, serde_json::Error> {
        let entries: BTreeMap<String, T> = serde_json::from_str(raw)?;
        Ok(Self {
            storage_key,
            entries: RwLock::new(entries),
        })
    }

    pub fn storage_key(&self) -> &'static str {
        self.storage_key
    }

    pub fn set(&self, id: &str, value: T) -> Option<T> {
        self.entries
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id.to_string(), value)
    }

    pub fn get(&self, id: &str) -> Option<T> {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(id)
            .cloned()
    }

    pub fn get_all(&self) -> BTreeMap<String, T> {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn remove(&self, id: &str) -> Option<T> {
        self.entries
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(id)
    }

    pub fn len(&self) -> usize {
        self.entries.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(&*self.entries.read().unwrap_or_else(PoisonError::into_inner))
    }
}

/// One entity write bound for the remote, or a marker that all earlier ones are done.
#[derive(Debug)]
enum EntityPush {
    Put { key: String, value: String },
    Delete { key: String },
    Settled(oneshot::Sender<()>),
}

/// Color and marker maps with persistence and change notification. Remote pushes go
/// through a single worker, so they reach the remote in the order they were made.
pub struct StateStore {
    colors: EntityStore<ColorState>,
    markers: EntityStore<MarkerState>,
    local: Arc<dyn StorageTier>,
    remote: RemoteTier,
    events: broadcast::Sender<StateEvent>,
    pushes: mpsc::Sender<EntityPush>,
}

impl StateStore {
    /// Load both maps from the local tier. Unreadable maps start empty.
    pub async fn load(local: Arc<dyn StorageTier>, remote: RemoteTier) -> Self {
        let colors = load_map(local.as_ref(), COLOR_STATES).await;
        let markers = load_map(local.as_ref(), MARKER_STATES).await;
        tracing::debug!(colors = colors.len(), markers = markers.len(), "entity state loaded");
        let (events, _) = broadcast::channel(256);
        let (pushes, queue) = mpsc::channel(PUSH_BUFFER);
        tokio::spawn(push_entities(remote.clone(), queue));
        Self {
            colors,
            markers,
            local,
            remote,
            events,
            pushes,
        }
    }

    /// Wait until every remote push issued so far has been attempted.
    pub async fn flush_pushes(&self) {
        let (done, settled) = oneshot::channel();
        if self.pushes.send(EntityPush::Settled(done)).await.is_ok() {
            let _ = settled.await;
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StateEvent> {
        self.events.subscribe()
    }

    pub fn color_state(&self, parcel_id: &str) -> Option<ColorState> {
        self.colors.get(parcel_id)
    }

    pub fn color_states(&self) -> BTreeMap<String, ColorState> {
        self.colors.get_all()
    }

    pub fn marker_state(&self, parcel_id: &str) -> Option<MarkerState> {
        self.markers.get(parcel_id)
    }

    pub fn marker_states(&self) -> BTreeMap<String, MarkerState> {
        self.markers.get_all()
    }

    /// Apply a palette color. Applying the color that is already active removes it.
    /// Returns the resulting state, `None` when the parcel ends up uncolored.
    pub async fn save_color_state(
        &self,
        parcel_id: &str,
        color_index: i64,
        applied_by: &str,
    ) -> Result<Option<ColorState>, StateError> {
        let state = ColorState::from_palette(parcel_id, color_index, applied_by)
            .ok_or(StateError::UnknownColor(color_index))?;

        if self
            .colors
            .get(parcel_id)
            .is_some_and(|current| current.color_index == color_index)
        {
            tracing::debug!(parcel_id, color_index, "same color applied again, toggling off");
            self.remove_color_state(parcel_id).await?;
            return Ok(None);
        }

        self.colors.set(parcel_id, state.clone());
        let json = serde_json::to_string(&state)?;
        self.commit(&self.colors, COLOR_STATE_PREFIX, parcel_id, Some(json)).await?;
        self.publish(StateEvent::ColorChanged {
            parcel_id: parcel_id.to_string(),
            state: Some(state.clone()),
        });
        Ok(Some(state))
    }

    pub async fn remove_color_state(&self, parcel_id: &str) -> Result<Option<ColorState>, StateError> {
        let Some(previous) = self.colors.remove(parcel_id) else {
            return Ok(None);
        };
        self.commit(&self.colors, COLOR_STATE_PREFIX, parcel_id, None).await?;
        self.publish(StateEvent::ColorChanged {
            parcel_id: parcel_id.to_string(),
            state: None,
        });
        Ok(Some(previous))
    }

    /// Record a derived marker. A hidden marker has no entry.
    pub async fn save_marker_state(&self, state: MarkerState) -> Result<(), StateError> {
        let parcel_id = state.parcel_id.clone();
        if !state.should_display {
            self.remove_marker_state(&parcel_id).await?;
            return Ok(());
        }

        let unchanged = self
            .markers
            .get(&parcel_id)
            .is_some_and(|current| current.trigger_fields == state.trigger_fields);
        self.markers.set(&parcel_id, state.clone());
        if unchanged {
            return Ok(());
        }

        let json = serde_json::to_string(&state)?;
        self.commit(&self.markers, MARKER_STATE_PREFIX, &parcel_id, Some(json)).await?;
        self.publish(StateEvent::MarkerChanged {
            parcel_id,
            state: Some(state),
        });
        Ok(())
    }

    /// Recompute the marker from the record's current fields and store it.
    pub async fn refresh_marker(&self, record: &ParcelRecord) -> Result<MarkerState, StateError> {
        let state = MarkerState::derive(record);
        self.save_marker_state(state.clone()).await?;
        Ok(state)
    }

    pub async fn remove_marker_state(&self, parcel_id: &str) -> Result<Option<MarkerState>, StateError> {
        let Some(previous) = self.markers.remove(parcel_id) else {
            return Ok(None);
        };
        self.commit(&self.markers, MARKER_STATE_PREFIX, parcel_id, None).await?;
        self.publish(StateEvent::MarkerChanged {
            parcel_id: parcel_id.to_string(),
            state: None,
        });
        Ok(Some(previous))
    }

    /// Drop both states for a deleted parcel.
    pub async fn forget_parcel(&self, parcel_id: &str) -> Result<(), StateError> {
        self.remove_color_state(parcel_id).await?;
        self.remove_marker_state(parcel_id).await?;
        Ok(())
    }

    /// Persist the whole map locally, then hand the single entity to the push worker
    /// without waiting for the remote.
    async fn commit<T>(
        &self,
        map: &EntityStore<T>,
        remote_prefix: &str,
        parcel_id: &str,
        entity_json: Option<String>,
    ) -> Result<(), StateError>
    where
        T: Clone + Serialize + DeserializeOwned,
    {
        let json = map.to_json()?;
        if let Err(e) = self.local.write(map.storage_key(), &json).await {
            tracing::warn!(tier = %self.local.name(), key = map.storage_key(), reason = %e, "entity state not persisted");
        }

        if self.remote.reachable_store().is_none() {
            tracing::debug!(parcel_id, "remote unavailable, entity push skipped");
            return Ok(());
        }
        let key = format!("{remote_prefix}{parcel_id}");
        let push = match entity_json {
            Some(value) => EntityPush::Put { key, value },
            None => EntityPush::Delete { key },
        };
        if self.pushes.send(push).await.is_err() {
            tracing::warn!(parcel_id, "entity push worker stopped, push dropped");
        }
        Ok(())
    }

    fn publish(&self, event: StateEvent) {
        tracing::debug!(event = event.name(), parcel_id = event.parcel_id(), "state changed");
        // No active subscribers is fine.
        let _ = self.events.send(event);
    }
}

/// Deliver entity pushes one at a time until the store is dropped.
async fn push_entities(remote: RemoteTier, mut queue: mpsc::Receiver<EntityPush>) {
    while let Some(push) = queue.recv().await {
        let (key, value) = match push {
            EntityPush::Put { key, value } => (key, Some(value)),
            EntityPush::Delete { key } => (key, None),
            EntityPush::Settled(done) => {
                let _ = done.send(());
                continue;
            }
        };
        let Some(store) = remote.reachable_store() else {
            tracing::debug!(key = %key, "remote went away, entity push skipped");
            continue;
        };
        let outcome = match value {
            Some(value) => store.put(&key, &value).await,
            None => store.delete(&key).await,
        };
        if let Err(e) = outcome {
            tracing::warn!(key = %key, reason = %e, "entity push to remote failed");
        }
    }
}

async fn load_map<T>(local: &dyn StorageTier, key: &'static str) -> EntityStore<T>
where
    T: Clone + Serialize + DeserializeOwned,
{
    match local.read(key).await {
        Ok(Some(raw)) => EntityStore::from_json(key, &raw).unwrap_or_else(|e| {
            tracing::warn!(key, reason = %e, "entity state unreadable, starting empty");
            EntityStore::new(key)
        }),
        Ok(None) => EntityStore::new(key),
        Err(e) => {
            tracing::warn!(key, reason = %e, "entity state could not be read, starting empty");
            EntityStore::new(key)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parcelkeep_store::testing::MemoryRemoteStore;
    use parcelkeep_store::{MemoryTier, NetworkMonitor};

    async fn store_with_remote() -> (StateStore, Arc<MemoryTier>, Arc<MemoryRemoteStore>) {
        let local = Arc::new(MemoryTier::new());
        let remote = Arc::new(MemoryRemoteStore::new());
        let store = StateStore::load(
            local.clone(),
            RemoteTier::new(Some(remote.clone()), NetworkMonitor::new(true)),
        )
        .await;
        (store, local, remote)
    }

    #[tokio::test]
    async fn applying_same_color_twice_removes_the_entry() {
        let (store, local, _) = store_with_remote().await;
        let mut events = store.subscribe();

        let applied = store.save_color_state("PNU-1", 2, "tester").await.unwrap();
        assert_eq!(applied.unwrap().color_value, "#FFD700");
        assert!(store.color_state("PNU-1").is_some());

        let toggled = store.save_color_state("PNU-1", 2, "tester").await.unwrap();
        assert!(toggled.is_none());
        assert!(store.color_state("PNU-1").is_none());
        assert!(!store.color_states().contains_key("PNU-1"));

        let persisted = local.read(COLOR_STATES).await.unwrap().unwrap();
        assert_eq!(persisted, "{}");

        let first = events.recv().await.unwrap();
        assert!(matches!(first, StateEvent::ColorChanged { state: Some(_), .. }));
        let second = events.recv().await.unwrap();
        assert_eq!(
            second,
            StateEvent::ColorChanged {
                parcel_id: "PNU-1".to_string(),
                state: None
            }
        );
    }

    #[tokio::test]
    async fn different_color_replaces_current() {
        let (store, _, _) = store_with_remote().await;
        store.save_color_state("PNU-1", 2, "tester").await.unwrap();
        let replaced = store.save_color_state("PNU-1", 4, "tester").await.unwrap();

        assert_eq!(replaced.unwrap().color_index, 4);
        assert_eq!(store.color_state("PNU-1").unwrap().color_value, "#1E90FF");
    }

    #[tokio::test]
    async fn unknown_palette_index_is_rejected() {
        let (store, _, _) = store_with_remote().await;
        let err = store.save_color_state("PNU-1", 42, "tester").await.unwrap_err();
        assert!(matches!(err, StateError::UnknownColor(42)));
    }

    #[tokio::test]
    async fn entity_changes_are_pushed_to_remote() {
        let (store, _, remote) = store_with_remote().await;
        store.save_color_state("PNU-1", 0, "tester").await.unwrap();
        store.flush_pushes().await;
        assert!(remote.peek("parcelkeep:color-state:PNU-1").is_some());

        store.remove_color_state("PNU-1").await.unwrap();
        store.flush_pushes().await;
        assert!(remote.peek("parcelkeep:color-state:PNU-1").is_none());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn toggled_off_color_stays_off_on_remote() {
        let (store, _, remote) = store_with_remote().await;
        remote.hold_puts();

        store.save_color_state("PNU-1", 2, "tester").await.unwrap();
        remote.put_started().await;
        // Toggle off while the put is still in flight.
        assert!(store.save_color_state("PNU-1", 2, "tester").await.unwrap().is_none());
        remote.release_puts(1);

        store.flush_pushes().await;
        assert!(remote.peek("parcelkeep:color-state:PNU-1").is_none());
    }

    #[tokio::test]
    async fn marker_follows_record_fields() {
        let (store, _, _) = store_with_remote().await;
        let mut events = store.subscribe();
        let mut record = ParcelRecord::new("PNU-1").with_memo("x");

        assert!(store.refresh_marker(&record).await.unwrap().should_display);
        assert!(store.marker_state("PNU-1").is_some());

        // Re-deriving an unchanged record does not publish again.
        store.refresh_marker(&record).await.unwrap();

        record.memo = Some(String::new());
        assert!(!store.refresh_marker(&record).await.unwrap().should_display);
        assert!(store.marker_state("PNU-1").is_none());

        assert!(matches!(events.recv().await.unwrap(), StateEvent::MarkerChanged { state: Some(_), .. }));
        assert!(matches!(events.recv().await.unwrap(), StateEvent::MarkerChanged { state: None, .. }));
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn maps_reload_from_local_tier() {
        let local = Arc::new(MemoryTier::new());
        let offline = || RemoteTier::new(None, NetworkMonitor::new(false));
        {
            let store = StateStore::load(local.clone(), offline()).await;
            store.save_color_state("PNU-9", 1, "tester").await.unwrap();
            store
                .refresh_marker(&ParcelRecord::new("PNU-9").with_memo("note"))
                .await
                .unwrap();
        }

        let reloaded = StateStore::load(local, offline()).await;
        assert_eq!(reloaded.color_state("PNU-9").unwrap().color_index, 1);
        assert!(reloaded.marker_state("PNU-9").unwrap().should_display);
    }

    #[tokio::test]
    async fn forget_parcel_clears_both_maps() {
        let (store, _, _) = store_with_remote().await;
        store.save_color_state("PNU-1", 3, "tester").await.unwrap();
        store
            .refresh_marker(&ParcelRecord::new("PNU-1").with_memo("m"))
            .await
            .unwrap();

        store.forget_parcel("PNU-1").await.unwrap();
        assert!(store.color_states().is_empty());
        assert!(store.marker_states().is_empty());
    }

    #[test]
    fn entity_store_basic_operations() {
        let map: EntityStore<String> = EntityStore::new("k");
        assert!(map.set("a", "1".to_string()).is_none());
        assert_eq!(map.set("a", "2".to_string()).as_deref(), Some("1"));
        assert_eq!(map.get("a").as_deref(), Some("2"));
        assert_eq!(map.get_all().len(), 1);
        assert_eq!(map.remove("a").as_deref(), Some("2"));
        assert!(map.is_empty());
    }
}
