// ABOUTME: Typed change notifications published when per-parcel entity state changes.
// ABOUTME: UI observers subscribe to these instead of polling the state maps.

use serde::{Deserialize, Serialize};

use crate::state::{ColorState, MarkerState};

/// The fixed set of state-change notifications. A `None` state means the entry was removed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum StateEvent {
    ColorChanged {
        parcel_id: String,
        state: Option<ColorState>,
    },
    MarkerChanged {
        parcel_id: String,
        state: Option<MarkerState>,
    },
}

impl StateEvent {
    pub fn parcel_id(&self) -> &str {
        match self {
            StateEvent::ColorChanged { parcel_id, .. } => parcel_id,
            StateEvent::MarkerChanged { parcel_id, .. } => parcel_id,
        }
    }

    /// Wire name used by UI bindings.
    pub fn name(&self) -> &'static str {
        match self {
            StateEvent::ColorChanged { .. } => "parcelColorUpdate",
            StateEvent::MarkerChanged { .. } => "parcelMarkerUpdate",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serializes_with_type_tag() {
        let event = StateEvent::ColorChanged {
            parcel_id: "PNU-1".to_string(),
            state: None,
        };
        let json = serde_json::to_value(&event).unwrap();

        assert_eq!(json["type"], "ColorChanged");
        assert_eq!(json["parcel_id"], "PNU-1");
        assert!(json["state"].is_null());
        assert_eq!(event.name(), "parcelColorUpdate");
        assert_eq!(event.parcel_id(), "PNU-1");
    }
}
