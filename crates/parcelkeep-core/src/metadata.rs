// ABOUTME: Dataset metadata and the deterministic checksum used for integrity signaling.
// ABOUTME: Metadata is computed once per coordinated save and travels with every stored copy.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::model::ParcelRecord;

/// Version tag written into every metadata block.
pub const FORMAT_VERSION: &str = "1";

/// Describes one persisted copy of the dataset.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatasetMetadata {
    pub timestamp: DateTime<Utc>,
    pub version: String,
    pub checksum: String,
    pub source_reason: String,
    pub count: usize,
}

impl DatasetMetadata {
    /// Compute metadata for the given records at the given instant.
    pub fn compute(records: &[ParcelRecord], source_reason: &str, timestamp: DateTime<Utc>) -> Self {
        Self {
            timestamp,
            version: FORMAT_VERSION.to_string(),
            checksum: checksum(records),
            source_reason: source_reason.to_string(),
            count: records.len(),
        }
    }

    /// Whether `records` still hash to this metadata's checksum.
    pub fn matches(&self, records: &[ParcelRecord]) -> bool {
        self.checksum == checksum(records)
    }
}

/// SHA-256 over the serialized record list, hex encoded.
///
/// Serialization of a `ParcelRecord` is field-order stable and `serde_json`
/// sorts object keys inside `geometry`, so equal datasets always hash equally.
pub fn checksum(records: &[ParcelRecord]) -> String {
    let mut hasher = Sha256::new();
    match serde_json::to_vec(records) {
        Ok(bytes) => hasher.update(&bytes),
        // Serializing plain data cannot fail; hash the debug form rather than panic.
        Err(_) => hasher.update(format!("{records:?}").as_bytes()),
    }
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dataset() -> Vec<ParcelRecord> {
        vec![
            ParcelRecord::new("PNU-1").with_memo("north field"),
            ParcelRecord::new("PNU-2").at(37.5, 127.0),
        ]
    }

    #[test]
    fn checksum_is_stable_for_unchanged_dataset() {
        let d = dataset();
        assert_eq!(checksum(&d), checksum(&d));
        assert_eq!(checksum(&d), checksum(&d.clone()));
        assert_eq!(checksum(&d).len(), 64);
    }

    #[test]
    fn checksum_changes_on_add_remove_and_mutate() {
        let d = dataset();
        let base = checksum(&d);

        let mut added = d.clone();
        added.push(ParcelRecord::new("PNU-3"));
        assert_ne!(checksum(&added), base);

        let mut removed = d.clone();
        removed.pop();
        assert_ne!(checksum(&removed), base);

        let mut mutated = d.clone();
        mutated[0].memo = Some("south field".to_string());
        assert_ne!(checksum(&mutated), base);
    }

    #[test]
    fn compute_fills_count_and_reason() {
        let d = dataset();
        let now = Utc::now();
        let meta = DatasetMetadata::compute(&d, "parcel_save", now);

        assert_eq!(meta.count, 2);
        assert_eq!(meta.source_reason, "parcel_save");
        assert_eq!(meta.version, FORMAT_VERSION);
        assert_eq!(meta.timestamp, now);
        assert!(meta.matches(&d));
        assert!(!meta.matches(&d[..1]));
    }
}
