//! The single-owner state of one replay run.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::instance::InstanceState;
use crate::types::{AllocationSourceId, InstanceId, Usage, Username};
use crate::user::UserState;

/// Roll-up of everything charged to one allocation source.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AllocationSourceUsage {
    pub id: AllocationSourceId,
    /// Users whose instances were switched to or charged to this source.
    pub users: BTreeSet<Username>,
    pub usage: Usage,
}

impl AllocationSourceUsage {
    pub fn new(id: AllocationSourceId) -> Self {
        Self {
            id,
            users: BTreeSet::new(),
            usage: Usage::ZERO,
        }
    }
}

/// Run state threaded through the fold.
///
/// Maps are ordered so two runs over the same input compare and serialize
/// identically.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Accumulator {
    pub instances: BTreeMap<InstanceId, InstanceState>,
    /// Ids of instances whose state is currently active.
    pub active_instance_ids: BTreeSet<InstanceId>,
    pub users: BTreeMap<Username, UserState>,
    pub allocation_sources: BTreeMap<AllocationSourceId, AllocationSourceUsage>,
    /// Status-history events seen, per status name.
    pub statuses: BTreeMap<String, u64>,
    /// Status-history events seen, per activity; no activity counts under `""`.
    pub activities: BTreeMap<String, u64>,
    /// Allocation changes that referenced an unseen instance.
    pub instances_missing: BTreeMap<InstanceId, u64>,
    /// Causality violations dropped under the count-and-skip policy.
    pub causality_skipped: BTreeMap<InstanceId, u64>,
    pub last_event_at: Option<DateTime<Utc>>,
}

impl Accumulator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Total usage over every instance and allocation source.
    pub fn total_usage(&self) -> Usage {
        self.instances
            .values()
            .map(|instance| instance.active_duration)
            .sum()
    }

    /// Instance usage summed per allocation source.
    pub fn usage_by_allocation_source(&self) -> BTreeMap<AllocationSourceId, Usage> {
        let mut totals: BTreeMap<AllocationSourceId, Usage> = BTreeMap::new();
        for instance in self.instances.values() {
            for (allocation_source, usage) in &instance.allocations_durations {
                *totals.entry(allocation_source.clone()).or_default() += *usage;
            }
        }
        totals
    }

    /// Combines the result of another shard into this one.
    ///
    /// Shards must hold disjoint instance sets; counters are summed and
    /// sets are unioned.
    pub fn merge(mut self, other: Self) -> Self {
        self.instances.extend(other.instances);
        self.active_instance_ids.extend(other.active_instance_ids);

        for (username, theirs) in other.users {
            match self.users.get_mut(&username) {
                Some(ours) => merge_user(ours, theirs),
                None => {
                    self.users.insert(username, theirs);
                }
            }
        }

        for (id, theirs) in other.allocation_sources {
            let ours = self
                .allocation_sources
                .entry(id.clone())
                .or_insert_with(|| AllocationSourceUsage::new(id));
            ours.users.extend(theirs.users);
            ours.usage += theirs.usage;
        }

        sum_counts(&mut self.statuses, other.statuses);
        sum_counts(&mut self.activities, other.activities);
        sum_counts(&mut self.instances_missing, other.instances_missing);
        sum_counts(&mut self.causality_skipped, other.causality_skipped);
        self.last_event_at = self.last_event_at.max(other.last_event_at);
        self
    }
}

fn merge_user(ours: &mut UserState, theirs: UserState) {
    ours.active_instance_ids.extend(theirs.active_instance_ids);
    ours.inactive_instance_ids.extend(theirs.inactive_instance_ids);
    for (allocation_source, usage) in theirs.allocations_usage {
        *ours.allocations_usage.entry(allocation_source).or_default() += usage;
    }
    ours.rolled_forward.extend(theirs.rolled_forward);
}

fn sum_counts<K: Ord>(into: &mut BTreeMap<K, u64>, from: BTreeMap<K, u64>) {
    for (key, count) in from {
        *into.entry(key).or_default() += count;
    }
}
