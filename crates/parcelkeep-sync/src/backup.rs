// ABOUTME: Daily and monthly full-dataset backups with a cadence record per kind.
// ABOUTME: A backup runs only when no completed backup of that kind exists for the current UTC period.

use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use parcelkeep_core::{DatasetMetadata, ParcelRecord};
use parcelkeep_store::keys::backup_key;
use parcelkeep_store::{
    BackupKind, BackupMetadata, BackupStatus, StorageTier, TierError, envelope, load_backup_metadata,
    save_backup_metadata,
};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum BackupError {
    #[error("tier error: {0}")]
    Tier(#[from] TierError),
}

/// Result of a cadence check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackupOutcome {
    /// A completed backup already covers this period.
    NotDue(BackupMetadata),
    /// A backup ran; its status says whether it succeeded.
    Ran(BackupMetadata),
}

pub struct BackupService {
    target: Arc<dyn StorageTier>,
}

impl BackupService {
    pub fn new(target: Arc<dyn StorageTier>) -> Self {
        Self { target }
    }

    pub async fn last(&self, kind: BackupKind) -> Result<Option<BackupMetadata>, BackupError> {
        Ok(load_backup_metadata(self.target.as_ref(), kind).await?)
    }

    pub async fn run_if_due(
        &self,
        kind: BackupKind,
        records: &[ParcelRecord],
        now: DateTime<Utc>,
    ) -> Result<BackupOutcome, BackupError> {
        if let Some(last) = self.last(kind).await?
            && last.status == BackupStatus::Completed
            && kind.same_period(last.started_at, now)
        {
            tracing::debug!(kind = kind.as_str(), "backup already done for this period");
            return Ok(BackupOutcome::NotDue(last));
        }
        self.run(kind, records, now).await.map(BackupOutcome::Ran)
    }

    /// Run a backup unconditionally. A failed copy is recorded in the metadata, not raised.
    pub async fn run(
        &self,
        kind: BackupKind,
        records: &[ParcelRecord],
        now: DateTime<Utc>,
    ) -> Result<BackupMetadata, BackupError> {
        let started = Instant::now();
        let mut meta = BackupMetadata::started(kind, now);
        save_backup_metadata(self.target.as_ref(), &meta).await?;

        let metadata = DatasetMetadata::compute(records, &format!("backup:{}", kind.as_str()), now);
        let copied = match envelope::encode(records, &metadata) {
            Ok(payload) => self
                .target
                .write(&backup_key(kind.as_str()), &payload)
                .await
                .map_err(|e| e.to_string()),
            Err(e) => Err(e.to_string()),
        };

        meta.duration_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);
        match copied {
            Ok(()) => {
                meta.status = BackupStatus::Completed;
                meta.data_count = records.len();
                tracing::info!(kind = kind.as_str(), count = records.len(), tier = %self.target.name(), "backup completed");
            }
            Err(reason) => {
                meta.status = BackupStatus::Failed;
                tracing::error!(kind = kind.as_str(), reason = %reason, tier = %self.target.name(), "backup failed");
                meta.error = Some(reason);
            }
        }
        save_backup_metadata(self.target.as_ref(), &meta).await?;
        Ok(meta)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};
    use parcelkeep_store::{MemoryTier, SessionTier};

    fn records() -> Vec<ParcelRecord> {
        vec![ParcelRecord::new("PNU-1"), ParcelRecord::new("PNU-2")]
    }

    #[tokio::test]
    async fn daily_backup_runs_once_per_day() {
        let target = Arc::new(MemoryTier::new());
        let service = BackupService::new(target.clone());
        let morning = Utc.with_ymd_and_hms(2026, 5, 4, 8, 0, 0).unwrap();

        let first = service.run_if_due(BackupKind::Daily, &records(), morning).await.unwrap();
        let BackupOutcome::Ran(meta) = first else {
            panic!("first backup of the day should run");
        };
        assert_eq!(meta.status, BackupStatus::Completed);
        assert_eq!(meta.data_count, 2);
        assert!(target.read("parcelkeep:backup:daily").await.unwrap().is_some());

        let later = morning + Duration::hours(6);
        let second = service.run_if_due(BackupKind::Daily, &records(), later).await.unwrap();
        assert!(matches!(second, BackupOutcome::NotDue(_)));

        let tomorrow = morning + Duration::days(1);
        let third = service.run_if_due(BackupKind::Daily, &records(), tomorrow).await.unwrap();
        assert!(matches!(third, BackupOutcome::Ran(_)));

        // Monthly cadence is tracked separately.
        let monthly = service.run_if_due(BackupKind::Monthly, &records(), later).await.unwrap();
        assert!(matches!(monthly, BackupOutcome::Ran(_)));
    }

    #[tokio::test]
    async fn failed_copy_is_recorded_and_retried() {
        // Room for the cadence record but not for the dataset.
        let target = Arc::new(SessionTier::with_quota(1200));
        let service = BackupService::new(target.clone());
        let big = vec![ParcelRecord::new("PNU-1").with_memo("x".repeat(2000))];
        let now = Utc::now();

        let meta = service.run(BackupKind::Daily, &big, now).await.unwrap();
        assert_eq!(meta.status, BackupStatus::Failed);
        assert!(meta.error.is_some());
        assert_eq!(service.last(BackupKind::Daily).await.unwrap(), Some(meta));

        // A failed run does not satisfy the cadence.
        let ran = service.run_if_due(BackupKind::Daily, &records(), now).await.unwrap();
        assert!(matches!(ran, BackupOutcome::Ran(ref m) if m.status == BackupStatus::Completed));
    }
}
