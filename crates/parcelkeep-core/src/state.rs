// ABOUTME: Per-parcel entity states: the applied color and the derived marker flag.
// ABOUTME: Also holds the fixed color palette and the marker derivation predicate.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::model::ParcelRecord;

/// Fixed palette users pick parcel colors from, addressed by index.
pub const PALETTE: [&str; 8] = [
    "#FF4444", "#FF8C00", "#FFD700", "#32CD32", "#1E90FF", "#8A2BE2", "#FF69B4", "#808080",
];

/// Values that count as "nothing entered" for marker purposes.
const PLACEHOLDERS: [&str; 6] = ["-", "null", "undefined", "n/a", "none", "없음"];

/// Look up the palette color for an index.
pub fn palette_color(index: i64) -> Option<&'static str> {
    usize::try_from(index).ok().and_then(|i| PALETTE.get(i).copied())
}

/// Whether a string is a well-formed `#RRGGBB` color.
pub fn is_hex_color(value: &str) -> bool {
    value.len() == 7
        && value.starts_with('#')
        && value[1..].chars().all(|c| c.is_ascii_hexdigit())
}

/// An active color on one parcel. Clearing a color removes the entry entirely.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColorState {
    pub parcel_id: String,
    pub color_value: String,
    pub is_colored: bool,
    pub color_index: i64,
    pub applied_at: DateTime<Utc>,
    pub applied_by: String,
}

impl ColorState {
    /// Build a color state from a palette index. Returns None for unknown indices.
    pub fn from_palette(parcel_id: &str, color_index: i64, applied_by: &str) -> Option<Self> {
        let color_value = palette_color(color_index)?;
        Some(Self {
            parcel_id: parcel_id.to_string(),
            color_value: color_value.to_string(),
            is_colored: true,
            color_index,
            applied_at: Utc::now(),
            applied_by: applied_by.to_string(),
        })
    }
}

/// The record fields that can cause a marker to show.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MarkerField {
    ParcelNumber,
    OwnerName,
    OwnerAddress,
    OwnerContact,
    Memo,
}

/// Derived marker visibility for one parcel. Never authored by hand.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MarkerState {
    pub parcel_id: String,
    pub should_display: bool,
    pub trigger_fields: Vec<MarkerField>,
    pub last_evaluated: DateTime<Utc>,
}

impl MarkerState {
    /// Recompute the marker for a record from its current field values.
    pub fn derive(record: &ParcelRecord) -> Self {
        let trigger_fields = trigger_fields(record);
        Self {
            parcel_id: record.id.clone(),
            should_display: !trigger_fields.is_empty(),
            trigger_fields,
            last_evaluated: Utc::now(),
        }
    }
}

fn is_meaningful(value: Option<&str>) -> bool {
    match value.map(str::trim) {
        None | Some("") => false,
        Some(v) => !PLACEHOLDERS.iter().any(|p| p.eq_ignore_ascii_case(v)),
    }
}

/// The fields of `record` that hold a non-empty, non-placeholder value.
pub fn trigger_fields(record: &ParcelRecord) -> Vec<MarkerField> {
    [
        (MarkerField::ParcelNumber, record.parcel_number.as_deref()),
        (MarkerField::OwnerName, record.owner_name.as_deref()),
        (MarkerField::OwnerAddress, record.owner_address.as_deref()),
        (MarkerField::OwnerContact, record.owner_contact.as_deref()),
        (MarkerField::Memo, record.memo.as_deref()),
    ]
    .into_iter()
    .filter(|(_, value)| is_meaningful(*value))
    .map(|(field, _)| field)
    .collect()
}

/// A marker is shown iff any trigger field carries real content.
pub fn should_show_marker(record: &ParcelRecord) -> bool {
    !trigger_fields(record).is_empty()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memo_alone_shows_marker() {
        let record = ParcelRecord::new("PNU-1").with_memo("x");
        assert!(should_show_marker(&record));

        let marker = MarkerState::derive(&record);
        assert!(marker.should_display);
        assert_eq!(marker.trigger_fields, vec![MarkerField::Memo]);
        assert_eq!(marker.parcel_id, "PNU-1");
    }

    #[test]
    fn empty_memo_and_owner_fields_hide_marker() {
        let mut record = ParcelRecord::new("PNU-1").with_memo("");
        record.owner_name = Some(String::new());
        record.owner_address = Some("   ".to_string());
        record.owner_contact = None;

        assert!(!should_show_marker(&record));
        assert!(!MarkerState::derive(&record).should_display);
    }

    #[test]
    fn placeholders_do_not_count() {
        let mut record = ParcelRecord::new("PNU-1").with_memo(" - ");
        record.owner_name = Some("N/A".to_string());
        record.parcel_number = Some("null".to_string());
        assert!(!should_show_marker(&record));

        record.owner_contact = Some("010-1234".to_string());
        assert_eq!(trigger_fields(&record), vec![MarkerField::OwnerContact]);
    }

    #[test]
    fn derivation_tracks_field_changes() {
        let mut record = ParcelRecord::new("PNU-1").with_memo("keep");
        assert!(MarkerState::derive(&record).should_display);

        record.memo = Some(String::new());
        assert!(!MarkerState::derive(&record).should_display);

        record.parcel_number = Some("1111-0001".to_string());
        assert_eq!(
            MarkerState::derive(&record).trigger_fields,
            vec![MarkerField::ParcelNumber]
        );
    }

    #[test]
    fn palette_lookup_rejects_out_of_range() {
        assert_eq!(palette_color(0), Some("#FF4444"));
        assert_eq!(palette_color(7), Some("#808080"));
        assert_eq!(palette_color(8), None);
        assert_eq!(palette_color(-1), None);
    }

    #[test]
    fn color_state_from_palette() {
        let state = ColorState::from_palette("PNU-1", 2, "tester").unwrap();
        assert_eq!(state.color_value, "#FFD700");
        assert!(state.is_colored);
        assert!(ColorState::from_palette("PNU-1", 99, "tester").is_none());
    }

    #[test]
    fn hex_color_shape() {
        assert!(is_hex_color("#1e90ff"));
        assert!(!is_hex_color("1e90ff"));
        assert!(!is_hex_color("#1e90fg"));
        assert!(!is_hex_color("#fff"));
    }
}
