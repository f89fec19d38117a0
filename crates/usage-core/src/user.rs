//! Per-user state and the user aggregation function.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::instance::InstanceState;
use crate::types::{AllocationSourceId, InstanceId, RollupPolicy, Usage, Username};

/// Usage and instance membership for one user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserState {
    pub username: Username,
    pub active_instance_ids: BTreeSet<InstanceId>,
    pub inactive_instance_ids: BTreeSet<InstanceId>,
    pub allocations_usage: BTreeMap<AllocationSourceId, Usage>,
    /// Usage already added to `allocations_usage`, per instance and source.
    #[serde(skip)]
    pub rolled_forward: BTreeMap<InstanceId, BTreeMap<AllocationSourceId, Usage>>,
}

impl UserState {
    pub fn new(username: Username) -> Self {
        Self {
            username,
            active_instance_ids: BTreeSet::new(),
            inactive_instance_ids: BTreeSet::new(),
            allocations_usage: BTreeMap::new(),
            rolled_forward: BTreeMap::new(),
        }
    }

    /// Sum over every allocation source.
    pub fn total_usage(&self) -> Usage {
        self.allocations_usage.values().sum()
    }

    fn mark(&mut self, instance_id: &InstanceId, active: bool) {
        let (add_to, remove_from) = if active {
            (&mut self.active_instance_ids, &mut self.inactive_instance_ids)
        } else {
            (&mut self.inactive_instance_ids, &mut self.active_instance_ids)
        };
        remove_from.remove(instance_id);
        add_to.insert(instance_id.clone());
    }

    fn credit(&mut self, allocation_source: &AllocationSourceId, usage: Usage) {
        if usage.is_zero() {
            return;
        }
        *self
            .allocations_usage
            .entry(allocation_source.clone())
            .or_default() += usage;
    }

    /// Adds what `after` accrued since the last roll-forward of each bucket.
    fn roll_forward_delta(&mut self, after: &InstanceState) {
        let ledger = self.rolled_forward.entry(after.id.clone()).or_default();
        let mut deltas = Vec::new();
        for (allocation_source, usage) in &after.allocations_durations {
            let seen = ledger.entry(allocation_source.clone()).or_default();
            let delta = usage.saturating_sub(*seen);
            *seen = *usage;
            deltas.push((allocation_source, delta));
        }
        for (allocation_source, delta) in deltas {
            self.credit(allocation_source, delta);
        }
    }

    /// Adds the whole bucket of the source `before` was charged to.
    fn roll_forward_cumulative(&mut self, before: &InstanceState, after: &InstanceState) {
        let allocation_source = &before.current_allocation_source;
        let usage = after.usage_for(allocation_source);
        self.credit(allocation_source, usage);
    }
}

/// Folds one instance change into its owner's state.
///
/// The owner is `after.created_by`; `user` is that user's current state, if
/// any. Usage is rolled forward only when `before` was active, which is the
/// only case in which the instance transition credits time.
pub fn apply_instance_change(
    user: Option<&UserState>,
    before: Option<&InstanceState>,
    after: &InstanceState,
    policy: RollupPolicy,
) -> UserState {
    let mut updated = user
        .cloned()
        .unwrap_or_else(|| UserState::new(after.created_by.clone()));
    debug_assert_eq!(updated.username, after.created_by);

    updated.mark(&after.id, after.is_active());

    if let Some(before) = before.filter(|before| before.is_active()) {
        match policy {
            RollupPolicy::Delta => updated.roll_forward_delta(after),
            RollupPolicy::CumulativeLegacy => updated.roll_forward_cumulative(before, after),
        }
    }
    updated
}
