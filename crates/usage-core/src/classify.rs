//! Structural classification of merged records into events.
//!
//! The shape of a record (its exact field set) decides its variant.
//! Records matching no shape are a broken upstream contract.

use serde_json::Value;

use crate::error::ClassifyError;
use crate::event::{AllocationChangeEvent, Event, StatusHistoryEvent, TickEvent};
use crate::record::{
    ALLOCATION_SOURCE_CHANGED, AllocationChangeRecord, Record, StatusHistoryRecord,
};

const STATUS_HISTORY_FIELDS: [&str; 6] = [
    "activity",
    "instance_id",
    "size_cpu",
    "start_date",
    "status_name",
    "username",
];

const ALLOCATION_CHANGE_FIELDS: [&str; 6] =
    ["entity_id", "id", "name", "payload", "timestamp", "uuid"];

const TICK_FIELDS: [&str; 1] = ["timestamp"];

/// The known record shapes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordShape {
    StatusHistory,
    AllocationChange,
    Tick,
}

impl RecordShape {
    /// Returns the shape whose field set equals the record's, if any.
    pub fn of(record: &Record) -> Option<Self> {
        let fields = record.fields();
        let matches = |shape: &[&str]| {
            fields.len() == shape.len() && shape.iter().all(|field| fields.contains_key(*field))
        };

        if matches(&STATUS_HISTORY_FIELDS) {
            Some(Self::StatusHistory)
        } else if matches(&ALLOCATION_CHANGE_FIELDS) {
            Some(Self::AllocationChange)
        } else if matches(&TICK_FIELDS) {
            Some(Self::Tick)
        } else {
            None
        }
    }

    const fn name(self) -> &'static str {
        match self {
            Self::StatusHistory => "status history",
            Self::AllocationChange => "allocation change",
            Self::Tick => "tick",
        }
    }
}

/// Maps a raw record to its event variant.
pub fn classify(record: Record) -> Result<Event, ClassifyError> {
    let Some(shape) = RecordShape::of(&record) else {
        return Err(ClassifyError::UnknownShape {
            fields: record.field_names().map(str::to_string).collect(),
        });
    };

    match shape {
        RecordShape::StatusHistory => {
            let parsed: StatusHistoryRecord = parse_as(shape, record)?;
            Ok(Event::StatusHistory(StatusHistoryEvent {
                instance_id: parsed.instance_id,
                activity: parsed.activity.unwrap_or_default(),
                size_cpu: parsed.size_cpu,
                status_name: parsed.status_name,
                timestamp: parsed.start_date,
                username: parsed.username,
            }))
        }
        RecordShape::AllocationChange => {
            let parsed: AllocationChangeRecord = parse_as(shape, record)?;
            if parsed.name != ALLOCATION_SOURCE_CHANGED {
                return Err(ClassifyError::UnexpectedEventName { name: parsed.name });
            }
            Ok(Event::AllocationChange(AllocationChangeEvent {
                instance_id: parsed.payload.instance_id,
                new_allocation_source_id: parsed.payload.allocation_source_id,
                timestamp: parsed.timestamp,
            }))
        }
        RecordShape::Tick => Ok(Event::Tick(TickEvent {
            timestamp: record.ordering_key()?,
        })),
    }
}

fn parse_as<T: serde::de::DeserializeOwned>(
    shape: RecordShape,
    record: Record,
) -> Result<T, ClassifyError> {
    serde_json::from_value(Value::Object(record.into_fields())).map_err(|source| {
        ClassifyError::InvalidRecord {
            shape: shape.name(),
            source,
        }
    })
}
