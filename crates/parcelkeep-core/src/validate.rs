// ABOUTME: Validates a candidate dataset before it is accepted for persistence.
// ABOUTME: Structural failures are critical and abort a save; data-quality issues are warnings only.

use std::collections::HashSet;
use std::fmt;

use serde::Serialize;
use serde_json::{Map, Number, Value};

use crate::model::ParcelRecord;
use crate::state::palette_color;

/// Default ceiling on the serialized dataset size.
pub const DEFAULT_MAX_DATASET_BYTES: usize = 50 * 1024 * 1024;

pub const MAX_ID_LEN: usize = 64;
pub const MAX_PARCEL_NUMBER_LEN: usize = 64;
pub const MAX_OWNER_NAME_LEN: usize = 100;
pub const MAX_OWNER_ADDRESS_LEN: usize = 300;
pub const MAX_OWNER_CONTACT_LEN: usize = 100;
pub const MAX_MEMO_LEN: usize = 2000;

/// One problem found in a dataset.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ValidationIssue {
    NotACollection { found: String },
    RecordNotObject { index: usize },
    MissingId { index: usize },
    FieldCoerced { index: usize, field: String },
    FieldDropped { index: usize, field: String },
    FieldTooLong { id: String, field: &'static str, len: usize, max: usize },
    CoordinateOutOfRange { id: String, lat: f64, lng: f64 },
    MalformedColor { id: String, value: String },
    DuplicateId { id: String },
    DatasetTooLarge { bytes: usize, max: usize },
}

impl fmt::Display for ValidationIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotACollection { found } => write!(f, "dataset is not a list of records (found {found})"),
            Self::RecordNotObject { index } => write!(f, "record {index} is not an object"),
            Self::MissingId { index } => write!(f, "record {index} has no id"),
            Self::FieldCoerced { index, field } => write!(f, "record {index}: {field} converted to the expected type"),
            Self::FieldDropped { index, field } => write!(f, "record {index}: {field} has the wrong type and was dropped"),
            Self::FieldTooLong { id, field, len, max } => {
                write!(f, "record {id}: {field} is {len} chars (max {max})")
            }
            Self::CoordinateOutOfRange { id, lat, lng } => {
                write!(f, "record {id}: coordinate ({lat}, {lng}) out of range")
            }
            Self::MalformedColor { id, value } => write!(f, "record {id}: malformed color {value}"),
            Self::DuplicateId { id } => write!(f, "duplicate id {id}"),
            Self::DatasetTooLarge { bytes, max } => {
                write!(f, "dataset is {bytes} bytes (ceiling {max})")
            }
        }
    }
}

/// Outcome of validating one dataset.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ValidationReport {
    pub is_valid: bool,
    pub is_critical: bool,
    pub errors: Vec<ValidationIssue>,
    pub warnings: Vec<ValidationIssue>,
}

impl ValidationReport {
    fn finish(errors: Vec<ValidationIssue>, warnings: Vec<ValidationIssue>) -> Self {
        Self {
            is_valid: errors.is_empty() && warnings.is_empty(),
            is_critical: !errors.is_empty(),
            errors,
            warnings,
        }
    }

    /// Whether the dataset may be persisted (warnings allowed).
    pub fn accepts(&self) -> bool {
        !self.is_critical
    }
}

/// Records recovered from an untyped candidate, with the report that describes them.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CoercedDataset {
    pub records: Vec<ParcelRecord>,
    pub report: ValidationReport,
}

/// Dataset validator with a configurable size ceiling.
#[derive(Debug, Clone)]
pub struct Validator {
    max_dataset_bytes: usize,
}

impl Default for Validator {
    fn default() -> Self {
        Self {
            max_dataset_bytes: DEFAULT_MAX_DATASET_BYTES,
        }
    }
}

impl Validator {
    pub fn new(max_dataset_bytes: usize) -> Self {
        Self { max_dataset_bytes }
    }

    pub fn max_dataset_bytes(&self) -> usize {
        self.max_dataset_bytes
    }

    /// Validate an untyped candidate. Anything but an array of objects is critical.
    pub fn validate(&self, candidate: &Value) -> ValidationReport {
        self.coerce(candidate).report
    }

    /// Decode an untyped candidate into records. A field of the wrong type is converted
    /// when the value is unambiguous (`42` for a text field, `"37.5"` for a number) and
    /// dropped otherwise. Each repair is reported as a warning.
    pub fn coerce(&self, candidate: &Value) -> CoercedDataset {
        let Some(items) = candidate.as_array() else {
            return CoercedDataset {
                records: Vec::new(),
                report: ValidationReport::finish(
                    vec![ValidationIssue::NotACollection {
                        found: json_kind(candidate).to_string(),
                    }],
                    Vec::new(),
                ),
            };
        };

        let mut errors = Vec::new();
        let mut repairs = Vec::new();
        let mut records = Vec::with_capacity(items.len());
        for (index, item) in items.iter().enumerate() {
            match item.as_object() {
                Some(fields) => records.push(coerce_record(index, fields, &mut repairs)),
                None => errors.push(ValidationIssue::RecordNotObject { index }),
            }
        }
        if !errors.is_empty() {
            return CoercedDataset {
                records: Vec::new(),
                report: ValidationReport::finish(errors, Vec::new()),
            };
        }

        let size = serde_json::to_vec(candidate).map(|b| b.len()).unwrap_or(0);
        let report = self.check_records(&records, size, repairs);
        CoercedDataset { records, report }
    }

    /// Validate typed records, computing their serialized size.
    pub fn validate_records(&self, records: &[ParcelRecord]) -> ValidationReport {
        let size = serde_json::to_vec(records).map(|b| b.len()).unwrap_or(0);
        self.check_records(records, size, Vec::new())
    }

    fn check_records(
        &self,
        records: &[ParcelRecord],
        serialized_bytes: usize,
        mut warnings: Vec<ValidationIssue>,
    ) -> ValidationReport {
        let mut seen = HashSet::with_capacity(records.len());

        for (index, record) in records.iter().enumerate() {
            if !record.has_id() {
                warnings.push(ValidationIssue::MissingId { index });
            } else if !seen.insert(record.id.as_str()) {
                warnings.push(ValidationIssue::DuplicateId {
                    id: record.id.clone(),
                });
            }

            let limits = [
                ("id", Some(record.id.as_str()), MAX_ID_LEN),
                ("parcel_number", record.parcel_number.as_deref(), MAX_PARCEL_NUMBER_LEN),
                ("owner_name", record.owner_name.as_deref(), MAX_OWNER_NAME_LEN),
                ("owner_address", record.owner_address.as_deref(), MAX_OWNER_ADDRESS_LEN),
                ("owner_contact", record.owner_contact.as_deref(), MAX_OWNER_CONTACT_LEN),
                ("memo", record.memo.as_deref(), MAX_MEMO_LEN),
            ];
            for (field, value, max) in limits {
                let len = value.map(|v| v.chars().count()).unwrap_or(0);
                if len > max {
                    warnings.push(ValidationIssue::FieldTooLong {
                        id: record.id.clone(),
                        field,
                        len,
                        max,
                    });
                }
            }

            if let (Some(lat), Some(lng)) = (record.lat, record.lng)
                && !(coordinate_in_range(lat, 90.0) && coordinate_in_range(lng, 180.0))
            {
                warnings.push(ValidationIssue::CoordinateOutOfRange {
                    id: record.id.clone(),
                    lat,
                    lng,
                });
            }

            if let Some(index) = record.color_index
                && palette_color(index).is_none()
            {
                warnings.push(ValidationIssue::MalformedColor {
                    id: record.id.clone(),
                    value: index.to_string(),
                });
            }
        }

        if serialized_bytes > self.max_dataset_bytes {
            warnings.push(ValidationIssue::DatasetTooLarge {
                bytes: serialized_bytes,
                max: self.max_dataset_bytes,
            });
        }

        ValidationReport::finish(Vec::new(), warnings)
    }
}

fn coerce_record(index: usize, fields: &Map<String, Value>, repairs: &mut Vec<ValidationIssue>) -> ParcelRecord {
    if let Ok(record) = serde_json::from_value::<ParcelRecord>(Value::Object(fields.clone())) {
        return record;
    }

    let mut kept = Map::new();
    for (field, value) in fields {
        if field_decodes(field, value) {
            kept.insert(field.clone(), value.clone());
            continue;
        }
        match convert(value).filter(|converted| field_decodes(field, converted)) {
            Some(converted) => {
                tracing::debug!(index, field = %field, "record field converted");
                repairs.push(ValidationIssue::FieldCoerced {
                    index,
                    field: field.clone(),
                });
                kept.insert(field.clone(), converted);
            }
            None => {
                tracing::debug!(index, field = %field, "record field dropped");
                repairs.push(ValidationIssue::FieldDropped {
                    index,
                    field: field.clone(),
                });
            }
        }
    }
    // Every kept field decodes on its own and every field has a default.
    serde_json::from_value(Value::Object(kept)).unwrap_or_default()
}

fn field_decodes(field: &str, value: &Value) -> bool {
    let mut single = Map::new();
    single.insert(field.to_string(), value.clone());
    serde_json::from_value::<ParcelRecord>(Value::Object(single)).is_ok()
}

/// The other scalar reading of a value: numbers as text, numeric text as a number.
fn convert(value: &Value) -> Option<Value> {
    match value {
        Value::Number(n) => Some(Value::String(n.to_string())),
        Value::String(text) => {
            let text = text.trim();
            text.parse::<i64>()
                .ok()
                .map(Value::from)
                .or_else(|| text.parse::<f64>().ok().and_then(Number::from_f64).map(Value::Number))
        }
        _ => None,
    }
}

fn coordinate_in_range(value: f64, bound: f64) -> bool {
    value.is_finite() && (-bound..=bound).contains(&value)
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
