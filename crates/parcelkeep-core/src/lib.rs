// ABOUTME: Core library for parcelkeep, containing the parcel data model and its invariants.
// ABOUTME: Defines records, metadata and checksums, entity states, notifications, and validation.

pub mod event;
pub mod metadata;
pub mod model;
pub mod state;
pub mod validate;

pub use event::StateEvent;
pub use metadata::{DatasetMetadata, checksum};
pub use model::{ParcelRecord, SourceMode};
pub use state::{ColorState, MarkerField, MarkerState, should_show_marker};
pub use validate::{CoercedDataset, ValidationIssue, ValidationReport, Validator};
