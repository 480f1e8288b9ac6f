// ABOUTME: Storage layer for parcelkeep: the uniform tier contract and its five adapters.
// ABOUTME: Also owns the durable structures built on tiers: snapshots, the sync queue, backup records.

pub mod backup;
pub mod envelope;
pub mod keys;
pub mod local;
pub mod memory;
pub mod network;
pub mod queue;
pub mod remote;
pub mod snapshot;
pub mod sqlite;
pub mod testing;
pub mod tier;

pub use backup::{BackupKind, BackupMetadata, BackupStatus, load_backup_metadata, save_backup_metadata};
pub use envelope::{DatasetEnvelope, DecodedDataset, EnvelopeError};
pub use local::{DEFAULT_LOCAL_QUOTA_BYTES, LocalTier};
pub use memory::{DEFAULT_SESSION_QUOTA_BYTES, MemoryTier, SessionTier};
pub use network::NetworkMonitor;
pub use queue::{DrainReport, QueueError, SyncQueue, SyncQueueItem};
pub use remote::{HttpRemoteStore, RemoteError, RemoteStore, RemoteTier};
pub use snapshot::{
    SnapshotError, SnapshotKind, SnapshotLocation, SnapshotManager, SnapshotPolicy, SnapshotRecord,
    SnapshotSummary,
};
pub use sqlite::{EmbeddedTier, StoredSnapshot};
pub use tier::{
    StorageTier, SyncStorageTier, TierCapabilities, TierError, TierName, TierScope, free_low_priority,
};
