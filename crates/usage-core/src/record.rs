//! Raw records as produced by the upstream sources.
//!
//! A [`Record`] is an untyped field map. The two physical sources have
//! disjoint shapes, described by [`StatusHistoryRecord`] and
//! [`AllocationChangeRecord`]; which one a record is gets decided
//! structurally by the classifier, never by a kind flag.

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value, json};
use uuid::Uuid;

use crate::error::ClassifyError;
use crate::types::{AllocationSourceId, InstanceId, Username, ValidationError};

/// Event-table name of the only event kind the engine consumes.
pub const ALLOCATION_SOURCE_CHANGED: &str = "instance_allocation_source_changed";

/// One raw record from a source, or the synthetic end-of-window boundary.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Record(Map<String, Value>);

impl Record {
    pub const fn new(fields: Map<String, Value>) -> Self {
        Self(fields)
    }

    /// The boundary marker appended after all sources are exhausted.
    ///
    /// Its only field is `timestamp`, which classifies as a tick.
    pub fn boundary(at: DateTime<Utc>) -> Self {
        let mut fields = Map::new();
        fields.insert("timestamp".to_string(), Value::String(format_timestamp(at)));
        Self(fields)
    }

    pub fn get(&self, field: &str) -> Option<&Value> {
        self.0.get(field)
    }

    pub fn field_names(&self) -> impl Iterator<Item = &str> {
        self.0.keys().map(String::as_str)
    }

    pub const fn fields(&self) -> &Map<String, Value> {
        &self.0
    }

    pub fn into_fields(self) -> Map<String, Value> {
        self.0
    }

    /// The merge key: `timestamp` when present and non-null, else `start_date`.
    pub fn ordering_key(&self) -> Result<DateTime<Utc>, ClassifyError> {
        match self.0.get("timestamp").filter(|value| !value.is_null()) {
            Some(value) => timestamp_field("timestamp", value),
            None => self
                .0
                .get("start_date")
                .ok_or(ClassifyError::MissingTimestamp)
                .and_then(|value| timestamp_field("start_date", value)),
        }
    }
}

impl From<Map<String, Value>> for Record {
    fn from(fields: Map<String, Value>) -> Self {
        Self(fields)
    }
}

fn timestamp_field(field: &'static str, value: &Value) -> Result<DateTime<Utc>, ClassifyError> {
    value
        .as_str()
        .and_then(parse_timestamp)
        .ok_or_else(|| ClassifyError::InvalidTimestamp {
            field,
            value: value.to_string(),
        })
}

/// Parses an ISO-8601 timestamp with offset.
///
/// Accepts RFC 3339 (`2016-12-01T05:00:00Z`) and the space-separated form
/// with a short offset that Postgres emits (`2016-12-01 00:00:00.0-05`).
pub fn parse_timestamp(value: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .or_else(|_| DateTime::parse_from_str(value, "%Y-%m-%d %H:%M:%S%.f%#z"))
        .map(|parsed| parsed.with_timezone(&Utc))
        .ok()
}

/// Formats a timestamp as UTC RFC 3339 with microseconds.
///
/// Fixed width, so lexicographic order matches chronological order.
pub fn format_timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Serde adapter for timestamps in either accepted format.
pub mod timestamp {
    use chrono::{DateTime, Utc};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(at: &DateTime<Utc>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&super::format_timestamp(*at))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<DateTime<Utc>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw = String::deserialize(deserializer)?;
        super::parse_timestamp(&raw)
            .ok_or_else(|| serde::de::Error::custom(format!("invalid timestamp: {raw}")))
    }
}

/// Deserializes an identifier stored either as a JSON string or integer.
fn id_from_string_or_int<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: TryFrom<String, Error = ValidationError>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum RawId {
        Text(String),
        Number(i64),
    }

    let raw = match RawId::deserialize(deserializer)? {
        RawId::Text(text) => text,
        RawId::Number(number) => number.to_string(),
    };
    T::try_from(raw).map_err(serde::de::Error::custom)
}

/// One row of instance status history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StatusHistoryRecord {
    #[serde(deserialize_with = "id_from_string_or_int")]
    pub instance_id: InstanceId,
    /// Transitional activity (e.g. `networking`); null or empty when settled.
    pub activity: Option<String>,
    pub size_cpu: u32,
    pub status_name: String,
    #[serde(with = "timestamp")]
    pub start_date: DateTime<Utc>,
    pub username: Username,
}

/// Payload of an allocation-change event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AllocationChangePayload {
    #[serde(deserialize_with = "id_from_string_or_int")]
    pub instance_id: InstanceId,
    #[serde(deserialize_with = "id_from_string_or_int")]
    pub allocation_source_id: AllocationSourceId,
}

/// One row of the event table, pre-filtered to allocation changes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AllocationChangeRecord {
    pub id: i64,
    pub uuid: Uuid,
    pub entity_id: String,
    pub name: String,
    pub payload: AllocationChangePayload,
    #[serde(with = "timestamp")]
    pub timestamp: DateTime<Utc>,
}

impl From<&StatusHistoryRecord> for Record {
    fn from(record: &StatusHistoryRecord) -> Self {
        let mut fields = Map::new();
        fields.insert("instance_id".to_string(), json!(record.instance_id.as_str()));
        fields.insert("activity".to_string(), json!(record.activity));
        fields.insert("size_cpu".to_string(), json!(record.size_cpu));
        fields.insert("status_name".to_string(), json!(record.status_name));
        fields.insert(
            "start_date".to_string(),
            json!(format_timestamp(record.start_date)),
        );
        fields.insert("username".to_string(), json!(record.username.as_str()));
        Self(fields)
    }
}

impl From<&AllocationChangeRecord> for Record {
    fn from(record: &AllocationChangeRecord) -> Self {
        let mut fields = Map::new();
        fields.insert("id".to_string(), json!(record.id));
        fields.insert("uuid".to_string(), json!(record.uuid.to_string()));
        fields.insert("entity_id".to_string(), json!(record.entity_id));
        fields.insert("name".to_string(), json!(record.name));
        fields.insert(
            "payload".to_string(),
            json!({
                "instance_id": record.payload.instance_id.as_str(),
                "allocation_source_id": record.payload.allocation_source_id.as_str(),
            }),
        );
        fields.insert(
            "timestamp".to_string(),
            json!(format_timestamp(record.timestamp)),
        );
        Self(fields)
    }
}
