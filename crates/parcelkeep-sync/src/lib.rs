// ABOUTME: Orchestration for parcelkeep: quorum saves across tiers, cascading restore, and auto-save.
// ABOUTME: PersistenceService assembles the pieces; each module is usable on its own for tests and tools.

pub mod backup;
pub mod config;
pub mod coordinator;
pub mod restore;
pub mod retry;
pub mod scheduler;
pub mod service;
pub mod state_store;

pub use backup::{BackupError, BackupOutcome, BackupService};
pub use config::{ConfigError, EngineConfig};
pub use coordinator::{
    CoordinatorParts, CoordinatorStatus, PersistenceCoordinator, QUORUM, SaveError, SaveOptions, SaveResult,
    TierFailure,
};
pub use restore::{RestoreOutcome, RestoreResolver, RestoreSource, SkippedSource};
pub use retry::{BackoffPolicy, RetryPolicy};
pub use scheduler::{
    AutoSaveHandle, AutoSaveScheduler, DatasetSource, EmergencyBackupRecord, SaveNotice, SchedulerError,
    SchedulerSettings, TriggerClass, TriggerReason,
};
pub use service::{ParcelModel, PersistenceService, ServiceError, ServiceOptions};
pub use state_store::{EntityStore, StateError, StateStore};
