//! Error types for the replay pipeline.

use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::types::{AllocationSourceId, InstanceId};

/// An error produced by an upstream record source (database cursor, file reader, ...).
pub type SourceError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// A raw record could not be turned into an event.
///
/// Any of these means the upstream schema contract is broken, so the run aborts.
#[derive(Debug, Error)]
pub enum ClassifyError {
    /// Neither `timestamp` nor `start_date` is present.
    #[error("record has no `timestamp` or `start_date` field")]
    MissingTimestamp,

    /// A timestamp field could not be parsed.
    #[error("invalid timestamp {value:?} in field `{field}`")]
    InvalidTimestamp { field: &'static str, value: String },

    /// The field set matches none of the known record shapes.
    #[error("record fields {fields:?} match no known event shape")]
    UnknownShape { fields: Vec<String> },

    /// An event-table record carried a name other than an allocation change.
    #[error("unexpected event name {name:?}")]
    UnexpectedEventName { name: String },

    /// The shape matched but a field value was malformed.
    #[error("invalid {shape} record: {source}")]
    InvalidRecord {
        shape: &'static str,
        #[source]
        source: serde_json::Error,
    },
}

/// An event that cannot be applied to the instance it references.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TransitionError {
    /// The event is older than the instance's last update.
    #[error(
        "allocation change for instance {instance_id} at {event_at} precedes its last update at {last_updated}"
    )]
    Causality {
        instance_id: InstanceId,
        event_at: DateTime<Utc>,
        last_updated: DateTime<Utc>,
    },

    /// The event switches to the source the instance is already charged to.
    #[error(
        "allocation change for instance {instance_id} at {event_at} keeps allocation source {allocation_source_id}"
    )]
    NoOpAllocationChange {
        instance_id: InstanceId,
        event_at: DateTime<Utc>,
        allocation_source_id: AllocationSourceId,
    },
}

/// Failure while merging record sources.
#[derive(Debug, Error)]
pub enum MergeError {
    /// The source itself failed to produce its next record.
    #[error("record source {source_index} failed: {source}")]
    Source {
        source_index: usize,
        #[source]
        source: SourceError,
    },

    /// A record had no usable ordering key.
    #[error("record from source {source_index} has no usable ordering key: {source}")]
    Key {
        source_index: usize,
        #[source]
        source: ClassifyError,
    },

    /// A source yielded a record older than its previous one.
    #[error("record source {source_index} is out of order: {at} follows {previous}")]
    OutOfOrder {
        source_index: usize,
        at: DateTime<Utc>,
        previous: DateTime<Utc>,
    },
}

/// A replay run failed. No partial accumulator is returned alongside.
#[derive(Debug, Error)]
pub enum ReplayError {
    #[error(transparent)]
    Merge(#[from] MergeError),

    /// Merged record at `position` matched no event shape.
    #[error("record {position} is not a known event: {source}")]
    Classify {
        position: u64,
        #[source]
        source: ClassifyError,
    },

    /// Event at `position` was rejected by the instance transition.
    #[error("event {position} rejected: {source}")]
    Transition {
        position: u64,
        #[source]
        source: TransitionError,
    },

    /// The cancellation flag was raised before event `position` was applied.
    #[error("replay cancelled before event {position}")]
    Cancelled { position: u64 },
}
