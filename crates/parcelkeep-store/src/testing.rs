// ABOUTME: Test doubles for tiers and the remote store, with failure injection.
// ABOUTME: Used by this crate's tests and by the sync engine's tests to simulate outages.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::{Notify, Semaphore};

use crate::remote::{RemoteError, RemoteStore};
use crate::tier::{StorageTier, TierCapabilities, TierError, TierName};

/// An in-memory remote store. Can be made unreachable, told to fail the next N puts,
/// or made to hold puts until the test releases them.
#[derive(Debug, Default)]
pub struct MemoryRemoteStore {
    entries: Mutex<BTreeMap<String, String>>,
    unreachable: AtomicBool,
    fail_next: AtomicUsize,
    put_calls: AtomicUsize,
    gate: Mutex<Option<Arc<Semaphore>>>,
    put_started: Notify,
}

impl MemoryRemoteStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_reachable(&self, reachable: bool) {
        self.unreachable.store(!reachable, Ordering::SeqCst);
    }

    /// Fail the next `n` puts with a backend error.
    pub fn fail_next(&self, n: usize) {
        self.fail_next.store(n, Ordering::SeqCst);
    }

    /// Number of put attempts seen, successful or not.
    pub fn put_calls(&self) -> usize {
        self.put_calls.load(Ordering::SeqCst)
    }

    /// Block every later put until `release_puts` lets it through.
    pub fn hold_puts(&self) {
        if let Ok(mut gate) = self.gate.lock() {
            *gate = Some(Arc::new(Semaphore::new(0)));
        }
    }

    /// Let `n` held puts proceed.
    pub fn release_puts(&self, n: usize) {
        if let Some(gate) = self.gate.lock().ok().and_then(|g| g.clone()) {
            gate.add_permits(n);
        }
    }

    /// Wait until a held put has started.
    pub async fn put_started(&self) {
        self.put_started.notified().await;
    }

    /// Direct read that bypasses reachability, for assertions.
    pub fn peek(&self, key: &str) -> Option<String> {
        self.entries.lock().ok()?.get(key).cloned()
    }

    fn check_reachable(&self) -> Result<(), RemoteError> {
        if self.unreachable.load(Ordering::SeqCst) {
            Err(RemoteError::Unreachable)
        } else {
            Ok(())
        }
    }

    fn entries(&self) -> Result<std::sync::MutexGuard<'_, BTreeMap<String, String>>, RemoteError> {
        self.entries
            .lock()
            .map_err(|_| RemoteError::Other("lock poisoned".into()))
    }
}

#[async_trait]
impl RemoteStore for MemoryRemoteStore {
    async fn is_reachable(&self) -> bool {
        !self.unreachable.load(Ordering::SeqCst)
    }

    async fn put(&self, key: &str, value: &str) -> Result<(), RemoteError> {
        self.put_calls.fetch_add(1, Ordering::SeqCst);
        let gate = self.gate.lock().ok().and_then(|g| g.clone());
        if let Some(gate) = gate {
            self.put_started.notify_one();
            gate.acquire()
                .await
                .map_err(|_| RemoteError::Other("put gate closed".into()))?
                .forget();
        }
        self.check_reachable()?;
        let injected = self
            .fail_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected {
            return Err(RemoteError::Other("injected failure".into()));
        }
        self.entries()?.insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<String>, RemoteError> {
        self.check_reachable()?;
        Ok(self.entries()?.get(key).cloned())
    }

    async fn delete(&self, key: &str) -> Result<(), RemoteError> {
        self.check_reachable()?;
        self.entries()?.remove(key);
        Ok(())
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>, RemoteError> {
        self.check_reachable()?;
        Ok(self
            .entries()?
            .keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect())
    }
}

/// Wraps a real tier and fails writes or reads on demand.
pub struct FlakyTier {
    inner: Arc<dyn StorageTier>,
    fail_writes: AtomicBool,
    fail_reads: AtomicBool,
    quota_full: AtomicBool,
    writes: AtomicUsize,
}

impl FlakyTier {
    pub fn new(inner: Arc<dyn StorageTier>) -> Self {
        Self {
            inner,
            fail_writes: AtomicBool::new(false),
            fail_reads: AtomicBool::new(false),
            quota_full: AtomicBool::new(false),
            writes: AtomicUsize::new(0),
        }
    }

    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    pub fn set_fail_reads(&self, fail: bool) {
        self.fail_reads.store(fail, Ordering::SeqCst);
    }

    /// Report every write as over quota until turned off.
    pub fn set_quota_full(&self, full: bool) {
        self.quota_full.store(full, Ordering::SeqCst);
    }

    /// Successful writes passed through to the inner tier.
    pub fn writes(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    fn name_of(&self) -> TierName {
        self.inner.name()
    }
}

#[async_trait]
impl StorageTier for FlakyTier {
    fn name(&self) -> TierName {
        self.name_of()
    }

    fn capabilities(&self) -> TierCapabilities {
        self.inner.capabilities()
    }

    async fn is_ready(&self) -> bool {
        self.inner.is_ready().await
    }

    async fn write(&self, key: &str, value: &str) -> Result<(), TierError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(TierError::backend(self.name_of(), "injected write failure"));
        }
        if self.quota_full.load(Ordering::SeqCst) {
            return Err(TierError::QuotaExceeded {
                tier: self.name_of(),
                needed: key.len() + value.len(),
                available: 0,
            });
        }
        self.inner.write(key, value).await?;
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn read(&self, key: &str) -> Result<Option<String>, TierError> {
        if self.fail_reads.load(Ordering::SeqCst) {
            return Err(TierError::backend(self.name_of(), "injected read failure"));
        }
        self.inner.read(key).await
    }

    async fn clear(&self, key: &str) -> Result<(), TierError> {
        self.inner.clear(key).await
    }

    async fn keys(&self, prefix: &str) -> Result<Vec<String>, TierError> {
        self.inner.keys(prefix).await
    }
}
