// ABOUTME: The uniform StorageTier contract every physical backend is adapted to.
// ABOUTME: Defines tier names, capability flags, and the typed TierError returned instead of panics.

use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::keys::LOW_PRIORITY_PREFIXES;

/// Identifies one of the five tier instances.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TierName {
    Memory,
    Local,
    Session,
    Embedded,
    Remote,
}

impl TierName {
    pub const ALL: [TierName; 5] = [
        TierName::Memory,
        TierName::Local,
        TierName::Session,
        TierName::Embedded,
        TierName::Remote,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            TierName::Memory => "memory",
            TierName::Local => "local",
            TierName::Session => "session",
            TierName::Embedded => "embedded",
            TierName::Remote => "remote",
        }
    }
}

impl fmt::Display for TierName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifetime of data held by a tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TierScope {
    /// Gone as soon as the process model is dropped.
    Volatile,
    TabSession,
    PersistentDevice,
    SharedRemote,
}

/// Static description of what a tier can do.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct TierCapabilities {
    pub synchronous: bool,
    pub max_entry_size_bytes: Option<usize>,
    pub scope: TierScope,
    pub queryable: bool,
}

impl TierCapabilities {
    /// Whether a successful write to this tier survives a reload and so counts toward quorum.
    pub fn durable(&self) -> bool {
        self.scope != TierScope::Volatile
    }
}

/// Failures a tier adapter can report.
#[derive(Debug, Error)]
pub enum TierError {
    #[error("{tier}: quota exceeded (needed {needed} bytes, {available} available)")]
    QuotaExceeded {
        tier: TierName,
        needed: usize,
        available: usize,
    },

    #[error("{tier}: entry of {size} bytes exceeds the {max} byte limit")]
    EntryTooLarge {
        tier: TierName,
        size: usize,
        max: usize,
    },

    #[error("{tier}: unavailable: {reason}")]
    Unavailable { tier: TierName, reason: String },

    #[error("{tier}: io error: {source}")]
    Io {
        tier: TierName,
        #[source]
        source: std::io::Error,
    },

    #[error("{tier}: backend error: {message}")]
    Backend { tier: TierName, message: String },
}

impl TierError {
    pub fn tier(&self) -> TierName {
        match self {
            TierError::QuotaExceeded { tier, .. }
            | TierError::EntryTooLarge { tier, .. }
            | TierError::Unavailable { tier, .. }
            | TierError::Io { tier, .. }
            | TierError::Backend { tier, .. } => *tier,
        }
    }

    pub fn is_quota(&self) -> bool {
        matches!(self, TierError::QuotaExceeded { .. })
    }

    pub fn unavailable(tier: TierName, reason: impl Into<String>) -> Self {
        TierError::Unavailable {
            tier,
            reason: reason.into(),
        }
    }

    pub fn backend(tier: TierName, message: impl fmt::Display) -> Self {
        TierError::Backend {
            tier,
            message: message.to_string(),
        }
    }
}

/// A key-value backend behind the uniform tier contract. Values are serialized JSON text.
#[async_trait]
pub trait StorageTier: Send + Sync {
    fn name(&self) -> TierName;

    fn capabilities(&self) -> TierCapabilities;

    /// Whether the backend can currently accept requests.
    async fn is_ready(&self) -> bool {
        true
    }

    async fn write(&self, key: &str, value: &str) -> Result<(), TierError>;

    async fn read(&self, key: &str) -> Result<Option<String>, TierError>;

    async fn clear(&self, key: &str) -> Result<(), TierError>;

    /// Keys currently stored that start with `prefix`.
    async fn keys(&self, prefix: &str) -> Result<Vec<String>, TierError>;
}

/// Tiers that can complete a write without yielding. Used only on teardown paths.
pub trait SyncStorageTier: Send + Sync {
    fn write_now(&self, key: &str, value: &str) -> Result<(), TierError>;

    fn read_now(&self, key: &str) -> Result<Option<String>, TierError>;
}

/// Delete every low-priority key on `tier` to recover space after a quota error.
/// Returns how many keys were removed.
pub async fn free_low_priority(tier: &dyn StorageTier) -> usize {
    let mut freed = 0;
    for prefix in LOW_PRIORITY_PREFIXES {
        let keys = match tier.keys(prefix).await {
            Ok(keys) => keys,
            Err(e) => {
                tracing::debug!(tier = %tier.name(), prefix, reason = %e, "could not list keys for cleanup");
                continue;
            }
        };
        for key in keys {
            if tier.clear(&key).await.is_ok() {
                freed += 1;
            }
        }
    }
    freed
}
