//! Event-sourced compute usage accounting.
//!
//! This crate replays instance status history and allocation-source changes
//! up to a report cutoff and attributes active time:
//! - Merge: k-way merge of sorted record sources with a terminal tick
//! - Classify: structural mapping of raw records to events
//! - Instance/user transitions: pure state updates per event
//! - Fold: drives the pipeline over one accumulator, optionally sharded
//! - Report: hours and CPU-hours per user and allocation source

mod accumulator;
pub mod classify;
mod error;
pub mod event;
mod fold;
pub mod instance;
pub mod merge;
pub mod record;
pub mod report;
pub mod shard;
pub mod types;
pub mod user;

pub use accumulator::{Accumulator, AllocationSourceUsage};
pub use classify::classify;
pub use error::{ClassifyError, MergeError, ReplayError, SourceError, TransitionError};
pub use event::{AllocationChangeEvent, Event, EventKind, StatusHistoryEvent, TickEvent};
pub use fold::{CancelFlag, ReplayOptions, batch_calculate, fold, replay, replay_events};
pub use instance::{InstanceState, Transition, apply_event};
pub use merge::{RecordStream, StreamMerger, merge_sources};
pub use record::{ALLOCATION_SOURCE_CHANGED, Record};
pub use report::{UsageReport, to_hours};
pub use shard::{materialize, replay_sharded};
pub use types::{
    AllocationSourceId, CausalityPolicy, InstanceId, RollupPolicy, UNATTRIBUTED, Usage, Username,
    ValidationError,
};
pub use user::{UserState, apply_instance_change};
