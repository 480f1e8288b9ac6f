// ABOUTME: Cadence records for daily and monthly dataset backups.
// ABOUTME: One BackupMetadata per kind is kept under its logical key, overwritten by each run.

use chrono::{DateTime, Datelike, Utc};
use serde::{Deserialize, Serialize};
use ulid::Ulid;

use crate::keys::backup_metadata_key;
use crate::tier::{StorageTier, TierError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackupKind {
    Daily,
    Monthly,
}

impl BackupKind {
    pub fn as_str(self) -> &'static str {
        match self {
            BackupKind::Daily => "daily",
            BackupKind::Monthly => "monthly",
        }
    }

    /// Whether `last` falls in the same UTC day (or month) as `now`.
    pub fn same_period(self, last: DateTime<Utc>, now: DateTime<Utc>) -> bool {
        match self {
            BackupKind::Daily => last.date_naive() == now.date_naive(),
            BackupKind::Monthly => last.year() == now.year() && last.month() == now.month(),
        }
    }
}

impl std::str::FromStr for BackupKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "daily" => Ok(BackupKind::Daily),
            "monthly" => Ok(BackupKind::Monthly),
            other => Err(format!("unknown backup kind '{other}' (expected daily or monthly)")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackupStatus {
    Running,
    Completed,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupMetadata {
    pub id: Ulid,
    pub kind: BackupKind,
    pub started_at: DateTime<Utc>,
    pub data_count: usize,
    pub status: BackupStatus,
    pub duration_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl BackupMetadata {
    pub fn started(kind: BackupKind, started_at: DateTime<Utc>) -> Self {
        Self {
            id: Ulid::new(),
            kind,
            started_at,
            data_count: 0,
            status: BackupStatus::Running,
            duration_ms: 0,
            error: None,
        }
    }
}

/// Read the most recent run of `kind`. A record that fails to parse counts as absent.
pub async fn load_backup_metadata(
    tier: &dyn StorageTier,
    kind: BackupKind,
) -> Result<Option<BackupMetadata>, TierError> {
    let Some(raw) = tier.read(&backup_metadata_key(kind.as_str())).await? else {
        return Ok(None);
    };
    match serde_json::from_str(&raw) {
        Ok(meta) => Ok(Some(meta)),
        Err(e) => {
            tracing::warn!(kind = kind.as_str(), error = %e, "ignoring unreadable backup metadata");
            Ok(None)
        }
    }
}

pub async fn save_backup_metadata(tier: &dyn StorageTier, meta: &BackupMetadata) -> Result<(), TierError> {
    let json = serde_json::to_string(meta).map_err(|e| TierError::backend(tier.name(), e))?;
    tier.write(&backup_metadata_key(meta.kind.as_str()), &json).await
}
