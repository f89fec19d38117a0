//! Per-instance state and the instance transition function.
//!
//! # Accounting rule
//!
//! An instance is *active* while its status is `active` and it has no
//! transitional activity. Whenever an event arrives for an active instance,
//! the time since `last_updated` is credited to the allocation source the
//! instance was charged to *during* that interval, before the event's own
//! changes are applied. Inactive intervals are never credited.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::TransitionError;
use crate::event::{AllocationChangeEvent, Event, StatusHistoryEvent, TickEvent};
use crate::types::{AllocationSourceId, InstanceId, Usage, Username};

/// Status name of a running instance.
pub const ACTIVE_STATUS: &str = "active";

/// Everything the fold knows about one instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceState {
    pub id: InstanceId,
    pub current_status: String,
    pub current_activity: String,
    pub current_allocation_source: AllocationSourceId,
    /// Active time per allocation source. Each bucket only ever grows.
    pub allocations_durations: BTreeMap<AllocationSourceId, Usage>,
    pub created_by: Username,
    pub size_cpu: u32,
    /// Timestamp of the first event seen for this instance.
    pub first_seen: DateTime<Utc>,
    pub last_updated: DateTime<Utc>,
    pub event_count: u64,
    /// Always equal to the sum of `allocations_durations`.
    pub active_duration: Usage,
}

impl InstanceState {
    fn from_status(event: &StatusHistoryEvent) -> Self {
        Self {
            id: event.instance_id.clone(),
            current_status: event.status_name.clone(),
            current_activity: event.activity.clone(),
            current_allocation_source: AllocationSourceId::unattributed(),
            allocations_durations: BTreeMap::new(),
            created_by: event.username.clone(),
            size_cpu: event.size_cpu,
            first_seen: event.timestamp,
            last_updated: event.timestamp,
            event_count: 1,
            active_duration: Usage::ZERO,
        }
    }

    pub fn is_active(&self) -> bool {
        self.current_status == ACTIVE_STATUS && self.current_activity.is_empty()
    }

    /// Usage accrued under one allocation source so far.
    pub fn usage_for(&self, allocation_source: &AllocationSourceId) -> Usage {
        self.allocations_durations
            .get(allocation_source)
            .copied()
            .unwrap_or_default()
    }

    /// Credits time since `last_updated` to the current source, if active.
    fn credit_until(&mut self, until: DateTime<Utc>) {
        if !self.is_active() {
            return;
        }
        let usage = Usage::for_interval(elapsed_us(self.last_updated, until), self.size_cpu);
        if usage.is_zero() {
            return;
        }
        *self
            .allocations_durations
            .entry(self.current_allocation_source.clone())
            .or_default() += usage;
        self.active_duration += usage;
    }
}

/// Whole microseconds from `from` to `to`; zero if `to` is not later.
fn elapsed_us(from: DateTime<Utc>, to: DateTime<Utc>) -> i64 {
    (to - from).num_microseconds().unwrap_or(i64::MAX).max(0)
}

/// Result of applying one event to one instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transition {
    /// The instance was created or changed.
    Updated(InstanceState),
    /// The event leaves the instance as it was.
    Unchanged,
    /// An allocation change referenced an instance never seen before.
    MissingInstance,
}

/// Applies `event` to `instance` (absent if the id has not been seen yet).
///
/// Pure: the input state is never modified.
pub fn apply_event(
    instance: Option<&InstanceState>,
    event: &Event,
) -> Result<Transition, TransitionError> {
    match event {
        Event::StatusHistory(status) => Ok(Transition::Updated(instance.map_or_else(
            || InstanceState::from_status(status),
            |instance| apply_status(instance, status),
        ))),
        Event::AllocationChange(change) => match instance {
            Some(instance) => apply_allocation_change(instance, change).map(Transition::Updated),
            None => Ok(Transition::MissingInstance),
        },
        Event::Tick(tick) => Ok(instance
            .and_then(|instance| apply_tick(instance, tick))
            .map_or(Transition::Unchanged, Transition::Updated)),
    }
}

fn apply_status(instance: &InstanceState, event: &StatusHistoryEvent) -> InstanceState {
    debug_assert_eq!(instance.id, event.instance_id);
    let mut updated = instance.clone();
    updated.credit_until(event.timestamp);
    updated.current_status.clone_from(&event.status_name);
    updated.current_activity.clone_from(&event.activity);
    updated.size_cpu = event.size_cpu;
    updated.last_updated = event.timestamp;
    updated.event_count += 1;
    updated
}

fn apply_allocation_change(
    instance: &InstanceState,
    event: &AllocationChangeEvent,
) -> Result<InstanceState, TransitionError> {
    debug_assert_eq!(instance.id, event.instance_id);
    if event.timestamp < instance.last_updated {
        return Err(TransitionError::Causality {
            instance_id: instance.id.clone(),
            event_at: event.timestamp,
            last_updated: instance.last_updated,
        });
    }
    if event.new_allocation_source_id == instance.current_allocation_source {
        return Err(TransitionError::NoOpAllocationChange {
            instance_id: instance.id.clone(),
            event_at: event.timestamp,
            allocation_source_id: event.new_allocation_source_id.clone(),
        });
    }

    let mut updated = instance.clone();
    // Time up to the switch belongs to the old source.
    updated.credit_until(event.timestamp);
    updated
        .current_allocation_source
        .clone_from(&event.new_allocation_source_id);
    updated.last_updated = event.timestamp;
    updated.event_count += 1;
    Ok(updated)
}

fn apply_tick(instance: &InstanceState, tick: &TickEvent) -> Option<InstanceState> {
    if !instance.is_active() || tick.timestamp <= instance.last_updated {
        return None;
    }
    let mut updated = instance.clone();
    updated.credit_until(tick.timestamp);
    updated.last_updated = tick.timestamp;
    updated.event_count += 1;
    Some(updated)
}
