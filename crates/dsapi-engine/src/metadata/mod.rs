//! Dataset metadata records and their wire format.
//!
//! Times travel as RFC 3339 strings and URLs as their canonical string; in
//! both cases an absent value is the empty string. Values of the wrong JSON
//! shape (a number where a URL belongs, a string for `derivative`, a mixed
//! array for classifications) are rejected.

mod store;

pub use store::ObjectMetadataStore;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use url::Url;

/// Metadata of one dataset.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DatasetMetadata {
    /// Human name
    pub name: String,
    /// Free-form description
    pub description: String,
    /// Format of the stored data
    pub data_format: String,
    /// Data-storage type; selects the backend and never changes
    pub data_storage: String,
    /// Derivative datasets are writable by policy
    pub derivative: bool,
    /// Classification labels
    pub data_classifications: Vec<String>,
    /// Data use agreement
    #[serde(with = "opt_url")]
    pub dua_url: Option<Url>,
    /// Proctor response document
    #[serde(with = "opt_url")]
    pub proctor_response_url: Option<Url>,
    /// Ids of the datasets this one derives from
    pub source_ids: Vec<String>,
    /// Creator
    pub created_by: String,
    /// Creation time
    #[serde(with = "opt_time")]
    pub created_at: Option<DateTime<Utc>>,
    /// Last modifier
    pub modified_by: String,
    /// Last modification time
    #[serde(with = "opt_time")]
    pub modified_at: Option<DateTime<Utc>>,
    /// Who finalized the dataset
    pub finalized_by: String,
    /// Finalization time
    #[serde(with = "opt_time")]
    pub finalized_at: Option<DateTime<Utc>>,
}

impl DatasetMetadata {
    /// Whether the dataset has been finalized.
    pub fn is_finalized(&self) -> bool {
        self.finalized_at.is_some()
    }

    /// Parses a JSON document, mapping shape errors to `BadRequest`.
    pub fn from_json(raw: &[u8]) -> crate::error::Result<Self> {
        Ok(serde_json::from_slice(raw)?)
    }

    /// Fields that may not change once finalized, compared against `other`.
    pub(crate) fn frozen_fields_equal(&self, other: &Self) -> bool {
        self.name == other.name
            && self.data_format == other.data_format
            && self.derivative == other.derivative
            && self.data_classifications == other.data_classifications
            && self.dua_url == other.dua_url
            && self.proctor_response_url == other.proctor_response_url
            && self.source_ids == other.source_ids
    }
}

mod opt_time {
    use chrono::{DateTime, SecondsFormat, Utc};
    use serde::{de, Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(v: &Option<DateTime<Utc>>, s: S) -> Result<S::Ok, S::Error> {
        match v {
            Some(t) => s.serialize_str(&t.to_rfc3339_opts(SecondsFormat::AutoSi, true)),
            None => s.serialize_str(""),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<DateTime<Utc>>, D::Error> {
        let raw = String::deserialize(d)?;
        if raw.is_empty() {
            return Ok(None);
        }
        DateTime::parse_from_rfc3339(&raw)
            .map(|t| Some(t.with_timezone(&Utc)))
            .map_err(|e| de::Error::custom(format!("invalid time {:?}: {}", raw, e)))
    }
}

mod opt_url {
    use serde::{de, Deserialize, Deserializer, Serializer};
    use url::Url;

    pub fn serialize<S: Serializer>(v: &Option<Url>, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(v.as_ref().map(Url::as_str).unwrap_or(""))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Url>, D::Error> {
        let raw = String::deserialize(d)?;
        if raw.is_empty() {
            return Ok(None);
        }
        Url::parse(&raw)
            .map(Some)
            .map_err(|e| de::Error::custom(format!("invalid url {:?}: {}", raw, e)))
    }
}
