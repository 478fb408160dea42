//! # Notification
//!
//! Object change notifications pushed by Cloud Storage, and the load job requests we derive
//! from the ones that mark a finished export.
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Datelike, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use thiserror::Error;

/// Header carrying the state of the resource a notification refers to.
pub const RESOURCE_STATE_HEADER: &str = "x-goog-resource-state";

/// Enumeration of errors that make an inbound payload unprocessable.
#[derive(Error, Debug)]
pub enum DecodeError {
    #[error("failed to decode json payload: {0}")]
    Json(#[from] serde_json::Error),
    #[error("notification is missing required field '{0}'")]
    MissingField(&'static str),
}

/// An object change notification, as delivered by a Cloud Storage watch channel.
/// Only `bucket` and `name` are required; every other field is informational.
#[derive(Deserialize, Serialize, Debug, PartialEq, Clone, Default)]
#[serde(rename_all = "camelCase")]
pub struct ChangeNotification {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub self_link: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub bucket: String,
    #[serde(default, deserialize_with = "deserialize_lenient_string")]
    pub generation: String,
    #[serde(
        default,
        rename = "metageneration",
        deserialize_with = "deserialize_lenient_string"
    )]
    pub meta_generation: String,
    #[serde(default)]
    pub content_type: String,
    #[serde(default, deserialize_with = "deserialize_size")]
    pub size: u64,
    #[serde(default)]
    pub md5_hash: String,
    #[serde(default)]
    pub media_link: String,
    #[serde(default)]
    pub crc32c: String,
    #[serde(default)]
    pub etag: String,
    #[serde(
        default,
        deserialize_with = "deserialize_timestamp",
        skip_serializing_if = "Option::is_none"
    )]
    pub updated: Option<DateTime<Utc>>,
    #[serde(
        default,
        deserialize_with = "deserialize_timestamp",
        skip_serializing_if = "Option::is_none"
    )]
    pub time_created: Option<DateTime<Utc>>,
    /// Unset unless the object has been deleted.
    #[serde(
        default,
        deserialize_with = "deserialize_timestamp",
        skip_serializing_if = "Option::is_none"
    )]
    pub time_deleted: Option<DateTime<Utc>>,
}

impl ChangeNotification {
    /// Decode a notification from a JSON body, rejecting any without a bucket or object name.
    pub fn decode(body: &[u8]) -> Result<Self, DecodeError> {
        let notification: ChangeNotification = serde_json::from_slice(body)?;

        if notification.bucket.is_empty() {
            return Err(DecodeError::MissingField("bucket"));
        }
        if notification.name.is_empty() {
            return Err(DecodeError::MissingField("name"));
        }

        Ok(notification)
    }

    pub fn is_deleted(&self) -> bool {
        self.time_deleted.is_some()
    }
}

/// The request handed from the notification receiver to the load job receiver.
/// Identifies an export artifact and the table it should be loaded into.
#[derive(Deserialize, Serialize, Debug, PartialEq, Eq, Clone, Default)]
#[serde(rename_all = "camelCase")]
pub struct LoadJobRequest {
    #[serde(default)]
    pub bucket: String,
    #[serde(default)]
    pub file_path: String,
    #[serde(default)]
    pub kind_name: String,
    #[serde(
        default,
        alias = "TimeCreated",
        deserialize_with = "deserialize_timestamp",
        skip_serializing_if = "Option::is_none"
    )]
    pub time_created: Option<DateTime<Utc>>,
}

impl LoadJobRequest {
    pub fn decode(body: &[u8]) -> Result<Self, DecodeError> {
        Ok(serde_json::from_slice(body)?)
    }

    /// A request is only valid when bucket, file path and kind name are all set.
    pub fn is_valid(&self) -> bool {
        !self.bucket.is_empty() && !self.file_path.is_empty() && !self.kind_name.is_empty()
    }

    /// The Cloud Storage URI of the export artifact.
    pub fn source_uri(&self) -> String {
        format!("gs://{}/{}", self.bucket, self.file_path)
    }
}

/// The value of the `X-Goog-Resource-State` header sent along every notification.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum ResourceState {
    /// The object was created or overwritten.
    Exists,
    /// The object was deleted or archived.
    NotExists,
    /// Sent once when a watch channel is opened; carries no object change.
    Sync,
}

impl ResourceState {
    /// Whether a notification in this state can describe a newly written export.
    pub fn may_import(&self) -> bool {
        matches!(self, ResourceState::Exists)
    }
}

#[derive(Error, Debug, PartialEq, Eq)]
#[error("{0} is not a valid ResourceState")]
pub struct ParseResourceStateError(String);

impl FromStr for ResourceState {
    type Err = ParseResourceStateError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_ref() {
            "exists" => Ok(ResourceState::Exists),
            "not_exists" => Ok(ResourceState::NotExists),
            "sync" => Ok(ResourceState::Sync),
            invalid => Err(ParseResourceStateError(invalid.to_owned())),
        }
    }
}

impl fmt::Display for ResourceState {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ResourceState::Exists => write!(f, "exists"),
            ResourceState::NotExists => write!(f, "not_exists"),
            ResourceState::Sync => write!(f, "sync"),
        }
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum StringOrNumber {
    String(String),
    Number(u64),
}

/// Cloud Storage encodes 64-bit integers as JSON strings, but we also accept plain numbers.
fn deserialize_size<'de, D>(deserializer: D) -> Result<u64, D::Error>
where
    D: Deserializer<'de>,
{
    match Option::<StringOrNumber>::deserialize(deserializer)? {
        None => Ok(0),
        Some(StringOrNumber::Number(n)) => Ok(n),
        Some(StringOrNumber::String(s)) if s.is_empty() => Ok(0),
        Some(StringOrNumber::String(s)) => s.parse::<u64>().map_err(serde::de::Error::custom),
    }
}

fn deserialize_lenient_string<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    match Option::<StringOrNumber>::deserialize(deserializer)? {
        None => Ok(String::new()),
        Some(StringOrNumber::String(s)) => Ok(s),
        Some(StringOrNumber::Number(n)) => Ok(n.to_string()),
    }
}

/// Parse an RFC 3339 timestamp. Missing, null, empty and zero-valued (`0001-01-01T00:00:00Z`)
/// timestamps are all read as unset.
fn deserialize_timestamp<'de, D>(deserializer: D) -> Result<Option<DateTime<Utc>>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = Option::<String>::deserialize(deserializer)?;

    match raw.as_deref() {
        None | Some("") => Ok(None),
        Some(s) => {
            let parsed = DateTime::parse_from_rfc3339(s)
                .map_err(serde::de::Error::custom)?
                .with_timezone(&Utc);

            if parsed.year() <= 1 {
                Ok(None)
            } else {
                Ok(Some(parsed))
            }
        }
    }
}
