//! Record lexicons written by the publisher.
//!
//! Only the collections the publisher creates are modelled here: Whitewind
//! long-form blog entries and Bluesky short-form posts with link facets.

use serde::Serialize;
use serde_json::Value;

#[cfg(feature = "app_bsky")]
pub mod app_bsky;
#[cfg(feature = "com_whtwnd")]
pub mod com_whtwnd;

/// Errors raised when a record violates its lexicon constraints.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("{field} is required")]
    Missing { field: &'static str },
    #[error("{field} exceeds {max} {unit}")]
    TooLong {
        field: &'static str,
        max: usize,
        unit: &'static str,
    },
    #[error("facet range {start}..{end} is outside the text")]
    FacetOutOfRange { start: usize, end: usize },
    #[error("record did not serialize to a JSON object")]
    NotAnObject,
}

/// A record type stored under a fixed collection NSID.
pub trait LexiconRecord: Serialize {
    /// Collection NSID, also used as the record's `$type`.
    const NSID: &'static str;

    /// Checks lexicon constraints before the record leaves the process.
    fn validate(&self) -> Result<(), ValidationError>;

    /// Serializes the record with its `$type` discriminator first.
    fn to_record_json(&self) -> Result<Value, ValidationError> {
        self.validate()?;
        let value = serde_json::to_value(self).map_err(|_| ValidationError::NotAnObject)?;
        let Value::Object(fields) = value else {
            return Err(ValidationError::NotAnObject);
        };

        let mut record = serde_json::Map::with_capacity(fields.len() + 1);
        record.insert("$type".to_string(), Value::String(Self::NSID.to_string()));
        record.extend(fields);
        Ok(Value::Object(record))
    }
}
