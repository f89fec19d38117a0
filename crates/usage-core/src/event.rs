//! The closed set of events the fold understands.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::{AllocationSourceId, InstanceId, Username};

/// A classified record, ready to be folded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Event {
    /// An instance entered a new status/activity.
    StatusHistory(StatusHistoryEvent),
    /// An instance was switched to another allocation source.
    AllocationChange(AllocationChangeEvent),
    /// End-of-window boundary; flushes trailing active time.
    Tick(TickEvent),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusHistoryEvent {
    pub instance_id: InstanceId,
    /// Empty when the instance is not in a transitional activity.
    pub activity: String,
    pub size_cpu: u32,
    pub status_name: String,
    pub timestamp: DateTime<Utc>,
    /// The instance creator.
    pub username: Username,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AllocationChangeEvent {
    pub instance_id: InstanceId,
    pub new_allocation_source_id: AllocationSourceId,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TickEvent {
    pub timestamp: DateTime<Utc>,
}

impl Event {
    pub fn timestamp(&self) -> DateTime<Utc> {
        match self {
            Self::StatusHistory(event) => event.timestamp,
            Self::AllocationChange(event) => event.timestamp,
            Self::Tick(event) => event.timestamp,
        }
    }

    /// The instance this event targets; ticks target every active instance.
    pub const fn instance_id(&self) -> Option<&InstanceId> {
        match self {
            Self::StatusHistory(event) => Some(&event.instance_id),
            Self::AllocationChange(event) => Some(&event.instance_id),
            Self::Tick(_) => None,
        }
    }

    pub const fn kind(&self) -> EventKind {
        match self {
            Self::StatusHistory(_) => EventKind::StatusHistory,
            Self::AllocationChange(_) => EventKind::AllocationChange,
            Self::Tick(_) => EventKind::Tick,
        }
    }
}

/// Event variant without its payload, for logging and counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    StatusHistory,
    AllocationChange,
    Tick,
}

impl EventKind {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::StatusHistory => "status_history",
            Self::AllocationChange => "allocation_change",
            Self::Tick => "tick",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}
