// ABOUTME: Defines ParcelRecord, the user-authored annotation attached to one map parcel.
// ABOUTME: Records are keyed by a stable parcel id and carry owner notes, memo, color, and position.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// How a record entered the dataset.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceMode {
    #[default]
    Manual,
    MapClick,
    Search,
    Import,
    Restore,
    #[serde(other)]
    Unknown,
}

/// A single annotated parcel. Every field except `id` and `updated_at` is optional;
/// an empty `id` is tolerated on decode and reported by the validator.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ParcelRecord {
    #[serde(default)]
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parcel_number: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub geometry: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owner_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owner_address: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owner_contact: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memo: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub color_index: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lat: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lng: Option<f64>,
    #[serde(default)]
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub source_mode: SourceMode,
}

impl ParcelRecord {
    /// Create a record with the given id, stamped with the current time.
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            updated_at: Utc::now(),
            ..Self::default()
        }
    }

    /// Builder-style memo setter.
    pub fn with_memo(mut self, memo: impl Into<String>) -> Self {
        self.memo = Some(memo.into());
        self
    }

    /// Builder-style owner setter.
    pub fn with_owner(
        mut self,
        name: impl Into<String>,
        address: impl Into<String>,
        contact: impl Into<String>,
    ) -> Self {
        self.owner_name = Some(name.into());
        self.owner_address = Some(address.into());
        self.owner_contact = Some(contact.into());
        self
    }

    /// Builder-style position setter.
    pub fn at(mut self, lat: f64, lng: f64) -> Self {
        self.lat = Some(lat);
        self.lng = Some(lng);
        self
    }

    pub fn has_id(&self) -> bool {
        !self.id.trim().is_empty()
    }
}
