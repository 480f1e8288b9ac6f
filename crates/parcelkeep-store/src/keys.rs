// ABOUTME: Logical key namespace shared by every tier.
// ABOUTME: A reload must find exactly the keys a previous run wrote, so all key strings live here.

use chrono::{DateTime, Utc};

use crate::tier::TierName;

pub const MAIN_DATASET: &str = "parcelkeep:main-dataset";
pub const SESSION_DATASET: &str = "parcelkeep:session-dataset";
pub const DATASET_METADATA: &str = "parcelkeep:dataset-metadata";
pub const COLOR_STATES: &str = "parcelkeep:color-states";
pub const MARKER_STATES: &str = "parcelkeep:marker-states";
pub const SNAPSHOT_PREFIX: &str = "parcelkeep:snapshot:";
pub const SNAPSHOT_LATEST: &str = "parcelkeep:snapshot:latest";
pub const SYNC_QUEUE: &str = "parcelkeep:sync-queue";
pub const SYNC_DEAD_LETTER: &str = "parcelkeep:sync-dead-letter";
pub const BACKUP_PREFIX: &str = "parcelkeep:backup:";
pub const BACKUP_METADATA_PREFIX: &str = "parcelkeep:backup-metadata:";
pub const EMERGENCY_BACKUP: &str = "parcelkeep:emergency-backup";

/// Remote keys for single-entity pushes.
pub const COLOR_STATE_PREFIX: &str = "parcelkeep:color-state:";
pub const MARKER_STATE_PREFIX: &str = "parcelkeep:marker-state:";

/// Key the full dataset is stored under on a given tier.
pub fn dataset_key(tier: TierName) -> &'static str {
    match tier {
        TierName::Session => SESSION_DATASET,
        _ => MAIN_DATASET,
    }
}

pub fn snapshot_key(timestamp: DateTime<Utc>) -> String {
    format!("{SNAPSHOT_PREFIX}{}", timestamp.timestamp_millis())
}

pub fn backup_key(kind: &str) -> String {
    format!("{BACKUP_PREFIX}{kind}")
}

pub fn backup_metadata_key(kind: &str) -> String {
    format!("{BACKUP_METADATA_PREFIX}{kind}")
}

/// Keys that may be deleted to recover space when a tier reports its quota is full.
/// Ordered from least to most valuable.
pub const LOW_PRIORITY_PREFIXES: [&str; 4] = [
    SNAPSHOT_PREFIX,
    EMERGENCY_BACKUP,
    BACKUP_PREFIX,
    BACKUP_METADATA_PREFIX,
];
