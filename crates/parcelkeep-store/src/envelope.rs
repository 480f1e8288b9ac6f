// ABOUTME: Encoding of the full dataset as stored on each tier: metadata plus the record list.
// ABOUTME: Decoding also accepts a bare record array and repairs mistyped fields through the validator.

use parcelkeep_core::{CoercedDataset, DatasetMetadata, ParcelRecord, ValidationReport, Validator};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Errors from decoding a stored dataset.
#[derive(Debug, Error)]
pub enum EnvelopeError {
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("stored dataset failed validation: {0:?}")]
    Invalid(ValidationReport),
}

/// What every tier stores under its dataset key.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatasetEnvelope {
    pub metadata: DatasetMetadata,
    pub records: Vec<ParcelRecord>,
}

/// A decoded, validated dataset.
#[derive(Debug, Clone)]
pub struct DecodedDataset {
    pub records: Vec<ParcelRecord>,
    pub metadata: Option<DatasetMetadata>,
    pub report: ValidationReport,
}

impl DecodedDataset {
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

pub fn encode(records: &[ParcelRecord], metadata: &DatasetMetadata) -> Result<String, serde_json::Error> {
    #[derive(Serialize)]
    struct Borrowed<'a> {
        metadata: &'a DatasetMetadata,
        records: &'a [ParcelRecord],
    }
    serde_json::to_string(&Borrowed { metadata, records })
}

/// Decode a stored payload. Accepts `{metadata, records}` or a bare array of records.
/// A critical validation failure is an error; warnings are carried in the report.
pub fn decode(raw: &str, validator: &Validator) -> Result<DecodedDataset, EnvelopeError> {
    let value: Value = serde_json::from_str(raw)?;

    let (records_value, metadata) = match value {
        Value::Object(mut obj) if obj.contains_key("records") => {
            let metadata = match obj.remove("metadata") {
                Some(meta) => serde_json::from_value::<DatasetMetadata>(meta).ok(),
                None => None,
            };
            (obj.remove("records").unwrap_or(Value::Null), metadata)
        }
        other => (other, None),
    };

    let CoercedDataset { records, report } = validator.coerce(&records_value);
    if !report.accepts() {
        return Err(EnvelopeError::Invalid(report));
    }

    if let Some(meta) = &metadata
        && !meta.matches(&records)
    {
        tracing::warn!(
            expected = %meta.checksum,
            count = records.len(),
            "stored dataset checksum does not match its contents"
        );
    }

    Ok(DecodedDataset {
        records,
        metadata,
        report,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn records() -> Vec<ParcelRecord> {
        vec![ParcelRecord::new("PNU-1").with_memo("memo")]
    }

    #[test]
    fn envelope_decodes_with_metadata() {
        let records = records();
        let meta = DatasetMetadata::compute(&records, "test", Utc::now());
        let raw = encode(&records, &meta).unwrap();

        let decoded = decode(&raw, &Validator::default()).unwrap();
        assert_eq!(decoded.records, records);
        assert_eq!(decoded.metadata, Some(meta));
        assert!(decoded.report.is_valid);
    }

    #[test]
    fn bare_array_is_accepted() {
        let decoded = decode(r#"[{"id":"a"},{"id":"b"}]"#, &Validator::default()).unwrap();
        assert_eq!(decoded.records.len(), 2);
        assert!(decoded.metadata.is_none());
    }

    #[test]
    fn structural_garbage_is_rejected() {
        let err = decode(r#"{"hello":"world"}"#, &Validator::default()).unwrap_err();
        assert!(matches!(err, EnvelopeError::Invalid(ref r) if r.is_critical));

        let err = decode("{not json", &Validator::default()).unwrap_err();
        assert!(matches!(err, EnvelopeError::Json(_)));
    }

    #[test]
    fn mistyped_fields_do_not_reject_the_dataset() {
        let decoded = decode(
            r#"{"records":[{"id":7,"lat":"37.5","lng":127.0},{"id":"b"}]}"#,
            &Validator::default(),
        )
        .unwrap();

        assert_eq!(decoded.records.len(), 2);
        assert_eq!(decoded.records[0].id, "7");
        assert_eq!(decoded.records[0].lat, Some(37.5));
        assert!(decoded.report.accepts());
        assert!(!decoded.report.warnings.is_empty());
    }

    #[test]
    fn warnings_do_not_block_decoding() {
        let decoded = decode(r#"[{"memo":"no id"}]"#, &Validator::default()).unwrap();
        assert_eq!(decoded.records.len(), 1);
        assert!(!decoded.report.warnings.is_empty());
    }
}
