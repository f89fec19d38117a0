//! The fold orchestrator: classify, transition, aggregate.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::{DateTime, Utc};

use crate::accumulator::{Accumulator, AllocationSourceUsage};
use crate::classify::classify;
use crate::error::{MergeError, ReplayError, TransitionError};
use crate::event::Event;
use crate::instance::{InstanceState, Transition, apply_event};
use crate::merge::{RecordStream, merge_sources};
use crate::record::Record;
use crate::types::{CausalityPolicy, InstanceId, RollupPolicy};
use crate::user::apply_instance_change;

/// Shared flag that stops a replay between two fold steps.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

/// Run options for a replay.
#[derive(Debug, Clone, Default)]
pub struct ReplayOptions {
    pub causality: CausalityPolicy,
    pub rollup: RollupPolicy,
    pub cancel: Option<CancelFlag>,
}

impl ReplayOptions {
    pub(crate) fn is_cancelled(&self) -> bool {
        self.cancel.as_ref().is_some_and(CancelFlag::is_cancelled)
    }
}

/// Applies one event to the accumulator.
///
/// On error the accumulator is consumed; callers never see a partial state.
pub fn fold(
    mut acc: Accumulator,
    event: &Event,
    options: &ReplayOptions,
) -> Result<Accumulator, TransitionError> {
    match event {
        Event::StatusHistory(status) => {
            *acc.statuses.entry(status.status_name.clone()).or_default() += 1;
            *acc.activities.entry(status.activity.clone()).or_default() += 1;
            apply_to_instance(&mut acc, &status.instance_id, event, options)?;
        }
        Event::AllocationChange(change) => {
            apply_to_instance(&mut acc, &change.instance_id, event, options)?;
        }
        Event::Tick(_) => {
            let active: Vec<InstanceId> = acc.active_instance_ids.iter().cloned().collect();
            for instance_id in &active {
                apply_to_instance(&mut acc, instance_id, event, options)?;
            }
        }
    }
    acc.last_event_at = Some(event.timestamp());
    Ok(acc)
}

fn apply_to_instance(
    acc: &mut Accumulator,
    instance_id: &InstanceId,
    event: &Event,
    options: &ReplayOptions,
) -> Result<(), TransitionError> {
    let before = acc.instances.get(instance_id);
    let after = match apply_event(before, event) {
        Ok(Transition::Updated(after)) => after,
        Ok(Transition::Unchanged) => return Ok(()),
        Ok(Transition::MissingInstance) => {
            tracing::warn!(
                instance_id = %instance_id,
                at = %event.timestamp(),
                "allocation change for unknown instance"
            );
            *acc.instances_missing.entry(instance_id.clone()).or_default() += 1;
            return Ok(());
        }
        Err(TransitionError::Causality {
            instance_id,
            event_at,
            last_updated,
        }) if options.causality == CausalityPolicy::CountAndSkip => {
            tracing::warn!(
                instance_id = %instance_id,
                %event_at,
                %last_updated,
                "skipping out-of-order allocation change"
            );
            *acc.causality_skipped.entry(instance_id).or_default() += 1;
            return Ok(());
        }
        Err(err) => return Err(err),
    };

    let before = acc.instances.remove(instance_id);
    roll_up_allocation_sources(acc, before.as_ref(), &after, event);

    // Cumulative roll-ups happen on status changes only; other events just
    // refresh membership.
    let rolled_from = match (options.rollup, event) {
        (RollupPolicy::CumulativeLegacy, Event::AllocationChange(_) | Event::Tick(_)) => None,
        _ => before.as_ref(),
    };
    let user = acc.users.get(&after.created_by);
    let user = apply_instance_change(user, rolled_from, &after, options.rollup);
    acc.users.insert(user.username.clone(), user);

    if after.is_active() {
        acc.active_instance_ids.insert(after.id.clone());
    } else {
        acc.active_instance_ids.remove(&after.id);
    }
    acc.instances.insert(after.id.clone(), after);
    Ok(())
}

/// Charges newly credited usage to each allocation source's roll-up.
fn roll_up_allocation_sources(
    acc: &mut Accumulator,
    before: Option<&InstanceState>,
    after: &InstanceState,
    event: &Event,
) {
    for (allocation_source, usage) in &after.allocations_durations {
        let previous = before.map(|before| before.usage_for(allocation_source)).unwrap_or_default();
        let delta = usage.saturating_sub(previous);
        if delta.is_zero() {
            continue;
        }
        let roll_up = acc
            .allocation_sources
            .entry(allocation_source.clone())
            .or_insert_with(|| AllocationSourceUsage::new(allocation_source.clone()));
        roll_up.usage += delta;
        roll_up.users.insert(after.created_by.clone());
    }

    if let Event::AllocationChange(change) = event {
        acc.allocation_sources
            .entry(change.new_allocation_source_id.clone())
            .or_insert_with(|| AllocationSourceUsage::new(change.new_allocation_source_id.clone()))
            .users
            .insert(after.created_by.clone());
    }
}

/// Classifies and folds a merged record sequence into a fresh accumulator.
///
/// Positions in errors count merged records from zero.
pub fn replay<I>(records: I, options: &ReplayOptions) -> Result<Accumulator, ReplayError>
where
    I: IntoIterator<Item = Result<Record, MergeError>>,
{
    let mut acc = Accumulator::new();
    let mut position = 0_u64;
    for record in records {
        if options.is_cancelled() {
            return Err(ReplayError::Cancelled { position });
        }
        let event = classify(record?).map_err(|source| ReplayError::Classify { position, source })?;
        tracing::trace!(position, kind = %event.kind(), at = %event.timestamp(), "applying event");
        acc = fold(acc, &event, options)
            .map_err(|source| ReplayError::Transition { position, source })?;
        position += 1;
    }
    tracing::debug!(
        events = position,
        instances = acc.instances.len(),
        users = acc.users.len(),
        "replay finished"
    );
    Ok(acc)
}

/// Folds already classified events into a fresh accumulator.
pub fn replay_events<'a, I>(events: I, options: &ReplayOptions) -> Result<Accumulator, ReplayError>
where
    I: IntoIterator<Item = &'a Event>,
{
    let mut acc = Accumulator::new();
    let mut position = 0_u64;
    for event in events {
        if options.is_cancelled() {
            return Err(ReplayError::Cancelled { position });
        }
        acc = fold(acc, event, options)
            .map_err(|source| ReplayError::Transition { position, source })?;
        position += 1;
    }
    Ok(acc)
}

/// Merges both record sources up to `end_date` and replays them.
pub fn batch_calculate(
    allocation_changes: RecordStream<'_>,
    status_history: RecordStream<'_>,
    end_date: DateTime<Utc>,
    options: &ReplayOptions,
) -> Result<Accumulator, ReplayError> {
    tracing::debug!(
        %end_date,
        causality = %options.causality,
        rollup = %options.rollup,
        "starting replay"
    );
    replay(
        merge_sources(allocation_changes, status_history, end_date),
        options,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{AllocationChangeEvent, StatusHistoryEvent, TickEvent};
    use crate::record::format_timestamp;
    use crate::types::{AllocationSourceId, Usage, Username};
    use chrono::{Duration, TimeZone};
    use serde_json::{Value, json};

    const MINUTE_US: i64 = 60_000_000;

    fn ts(minutes: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2016, 9, 1, 0, 0, 0)
            .single()
            .expect("valid test timestamp")
            + Duration::minutes(minutes)
    }

    fn record(value: Value) -> Record {
        match value {
            Value::Object(fields) => Record::new(fields),
            other => panic!("expected object, got {other}"),
        }
    }

    fn status_record(instance: u64, minutes: i64, status: &str, user: &str) -> Record {
        record(json!({
            "instance_id": instance,
            "activity": "",
            "size_cpu": 2,
            "status_name": status,
            "start_date": format_timestamp(ts(minutes)),
            "username": user,
        }))
    }

    fn switch_record(id: i64, instance: u64, minutes: i64, source: &str) -> Record {
        record(json!({
            "id": id,
            "uuid": format!("00000000-0000-4000-8000-{id:012}"),
            "entity_id": "someone",
            "name": "instance_allocation_source_changed",
            "payload": {"instance_id": instance, "allocation_source_id": source},
            "timestamp": format_timestamp(ts(minutes)),
        }))
    }

    fn stream(records: Vec<Record>) -> RecordStream<'static> {
        Box::new(records.into_iter().map(Ok))
    }

    fn source(id: &str) -> AllocationSourceId {
        AllocationSourceId::new(id).unwrap()
    }

    fn user(name: &str) -> Username {
        Username::new(name).unwrap()
    }

    fn fixture() -> (Vec<Record>, Vec<Record>) {
        let statuses = vec![
            status_record(1, 0, "build", "alice"),
            status_record(1, 5, "active", "alice"),
            status_record(2, 10, "active", "bob"),
            status_record(3, 12, "build", "bob"),
            status_record(3, 20, "error", "bob"),
            status_record(1, 65, "suspended", "alice"),
        ];
        let changes = vec![
            switch_record(1, 1, 5, "TG-A"),
            switch_record(2, 2, 30, "TG-B"),
            switch_record(3, 99, 40, "TG-A"),
            switch_record(4, 1, 50, "TG-B"),
        ];
        (changes, statuses)
    }

    fn run(options: &ReplayOptions) -> Accumulator {
        let (changes, statuses) = fixture();
        batch_calculate(stream(changes), stream(statuses), ts(120), options).unwrap()
    }

    #[test]
    fn replays_fixture() {
        let acc = run(&ReplayOptions::default());

        // Instance 1: active 5..65; TG-A 5..50, TG-B 50..65.
        let one = &acc.instances[&InstanceId::new("1").unwrap()];
        assert_eq!(one.usage_for(&source("TG-A")).active_us, 45 * MINUTE_US);
        assert_eq!(one.usage_for(&source("TG-B")).active_us, 15 * MINUTE_US);
        assert!(!one.is_active());

        // Instance 2: active 10..120; unattributed 10..30, TG-B 30..120.
        let two = &acc.instances[&InstanceId::new("2").unwrap()];
        assert_eq!(
            two.usage_for(&AllocationSourceId::unattributed()).active_us,
            20 * MINUTE_US
        );
        assert_eq!(two.usage_for(&source("TG-B")).active_us, 90 * MINUTE_US);
        assert_eq!(two.last_updated, ts(120));

        // Instance 3 was never active.
        assert!(acc.instances[&InstanceId::new("3").unwrap()]
            .active_duration
            .is_zero());

        assert_eq!(acc.instances_missing[&InstanceId::new("99").unwrap()], 1);
        assert_eq!(acc.statuses["active"], 2);
        assert_eq!(acc.statuses["build"], 2);
        // Every status row has an empty activity.
        assert_eq!(acc.activities.len(), 1);
        assert_eq!(acc.activities[""], 6);
        assert_eq!(acc.active_instance_ids.len(), 1);
        assert_eq!(acc.last_event_at, Some(ts(120)));
    }

    #[test]
    fn user_totals_equal_instance_totals() {
        let acc = run(&ReplayOptions::default());

        let user_total: Usage = acc.users.values().map(|user| user.total_usage()).sum();
        assert_eq!(user_total, acc.total_usage());

        let alice = &acc.users[&user("alice")];
        assert_eq!(
            alice.allocations_usage[&source("TG-A")].active_us,
            45 * MINUTE_US
        );
        let bob = &acc.users[&user("bob")];
        assert_eq!(bob.allocations_usage[&source("TG-B")].active_us, 90 * MINUTE_US);
        assert_eq!(bob.inactive_instance_ids.len(), 1);
        assert_eq!(bob.active_instance_ids.len(), 1);
    }

    #[test]
    fn allocation_roll_up_matches_instance_sums() {
        let acc = run(&ReplayOptions::default());
        let by_source = acc.usage_by_allocation_source();
        for (id, roll_up) in &acc.allocation_sources {
            assert_eq!(by_source.get(id).copied().unwrap_or_default(), roll_up.usage);
        }
        let tg_b = &acc.allocation_sources[&source("TG-B")];
        assert_eq!(tg_b.users, [user("alice"), user("bob")].into_iter().collect());
        assert_eq!(tg_b.usage.active_us, 105 * MINUTE_US);
        assert_eq!(tg_b.usage.cpu_us, 210 * MINUTE_US);
    }

    #[test]
    fn identical_inputs_give_identical_accumulators() {
        let options = ReplayOptions::default();
        assert_eq!(run(&options), run(&options));
    }

    #[test]
    fn conservation_holds_for_every_instance() {
        let acc = run(&ReplayOptions::default());
        for instance in acc.instances.values() {
            let sum: Usage = instance.allocations_durations.values().sum();
            assert_eq!(sum, instance.active_duration);
        }
    }

    #[test]
    fn no_op_allocation_change_names_position() {
        let changes = vec![switch_record(1, 1, 10, "TG-A"), switch_record(2, 1, 20, "TG-A")];
        let statuses = vec![status_record(1, 0, "active", "alice")];
        let err = batch_calculate(
            stream(changes),
            stream(statuses),
            ts(60),
            &ReplayOptions::default(),
        )
        .unwrap_err();

        assert!(matches!(
            err,
            ReplayError::Transition {
                position: 2,
                source: TransitionError::NoOpAllocationChange { .. }
            }
        ));
    }

    #[test]
    fn unknown_record_is_fatal() {
        let statuses = vec![record(json!({"start_date": format_timestamp(ts(0)), "x": 1}))];
        let err = batch_calculate(
            stream(vec![]),
            stream(statuses),
            ts(60),
            &ReplayOptions::default(),
        )
        .unwrap_err();
        assert!(matches!(err, ReplayError::Classify { position: 0, .. }));
    }

    fn stale_switch() -> Vec<Event> {
        let instance_id = InstanceId::new("7").unwrap();
        vec![
            Event::StatusHistory(StatusHistoryEvent {
                instance_id: instance_id.clone(),
                activity: String::new(),
                size_cpu: 1,
                status_name: "active".to_string(),
                timestamp: ts(30),
                username: user("carol"),
            }),
            Event::AllocationChange(AllocationChangeEvent {
                instance_id,
                new_allocation_source_id: source("TG-A"),
                timestamp: ts(10),
            }),
            Event::Tick(TickEvent { timestamp: ts(60) }),
        ]
    }

    #[test]
    fn causality_violation_fails_by_default() {
        let err = replay_events(&stale_switch(), &ReplayOptions::default()).unwrap_err();
        assert!(matches!(
            err,
            ReplayError::Transition {
                position: 1,
                source: TransitionError::Causality { .. }
            }
        ));
    }

    #[test]
    fn causality_violation_can_be_counted_and_skipped() {
        let options = ReplayOptions {
            causality: CausalityPolicy::CountAndSkip,
            ..ReplayOptions::default()
        };
        let acc = replay_events(&stale_switch(), &options).unwrap();
        let instance_id = InstanceId::new("7").unwrap();
        assert_eq!(acc.causality_skipped[&instance_id], 1);

        let instance = &acc.instances[&instance_id];
        assert_eq!(
            instance
                .usage_for(&AllocationSourceId::unattributed())
                .active_us,
            30 * MINUTE_US
        );
        assert_eq!(instance.event_count, 2);
    }

    #[test]
    fn cancelled_replay_stops_with_error() {
        let cancel = CancelFlag::new();
        cancel.cancel();
        let options = ReplayOptions {
            cancel: Some(cancel),
            ..ReplayOptions::default()
        };
        let (changes, statuses) = fixture();
        let err =
            batch_calculate(stream(changes), stream(statuses), ts(120), &options).unwrap_err();
        assert!(matches!(err, ReplayError::Cancelled { position: 0 }));
    }

    fn status_event(instance: &str, minutes: i64, status: &str) -> Event {
        Event::StatusHistory(StatusHistoryEvent {
            instance_id: InstanceId::new(instance).unwrap(),
            activity: String::new(),
            size_cpu: 1,
            status_name: status.to_string(),
            timestamp: ts(minutes),
            username: user("dave"),
        })
    }

    fn switch_event(instance: &str, minutes: i64, allocation_source: &str) -> Event {
        Event::AllocationChange(AllocationChangeEvent {
            instance_id: InstanceId::new(instance).unwrap(),
            new_allocation_source_id: source(allocation_source),
            timestamp: ts(minutes),
        })
    }

    fn tick_event(minutes: i64) -> Event {
        Event::Tick(TickEvent {
            timestamp: ts(minutes),
        })
    }

    fn minutes_by_source(acc: &Accumulator) -> Vec<(String, i64)> {
        acc.users[&user("dave")]
            .allocations_usage
            .iter()
            .map(|(id, usage)| (id.to_string(), usage.active_us / MINUTE_US))
            .collect()
    }

    #[test]
    fn every_unknown_instance_reference_is_counted() {
        let events = [
            status_event("5", 0, "active"),
            switch_event("42", 10, "TG-A"),
            switch_event("42", 20, "TG-B"),
            switch_event("43", 30, "TG-A"),
        ];
        let acc = replay_events(&events, &ReplayOptions::default()).unwrap();
        assert_eq!(acc.instances_missing[&InstanceId::new("42").unwrap()], 2);
        assert_eq!(acc.instances_missing[&InstanceId::new("43").unwrap()], 1);
        assert!(!acc.instances.contains_key(&InstanceId::new("42").unwrap()));
    }

    #[test]
    fn legacy_rollup_only_rolls_forward_on_status_changes() {
        let events = [
            status_event("5", 0, "active"),
            switch_event("5", 30, "TG-A"),
            status_event("5", 60, "suspended"),
            tick_event(90),
        ];
        let legacy = replay_events(
            &events,
            &ReplayOptions {
                rollup: RollupPolicy::CumulativeLegacy,
                ..ReplayOptions::default()
            },
        )
        .unwrap();
        // The switch moves nothing; the suspend adds the TG-A bucket only.
        assert_eq!(minutes_by_source(&legacy), [("TG-A".to_string(), 30)]);

        let delta = replay_events(&events, &ReplayOptions::default()).unwrap();
        assert_eq!(
            minutes_by_source(&delta),
            [("TG-A".to_string(), 30), ("unattributed".to_string(), 30)]
        );
        assert_eq!(legacy.instances, delta.instances);
    }

    #[test]
    fn legacy_rollup_ignores_tick_flushes() {
        let events = [status_event("5", 0, "active"), tick_event(60)];
        let legacy = replay_events(
            &events,
            &ReplayOptions {
                rollup: RollupPolicy::CumulativeLegacy,
                ..ReplayOptions::default()
            },
        )
        .unwrap();
        let dave = &legacy.users[&user("dave")];
        assert!(dave.allocations_usage.is_empty());
        assert!(dave.active_instance_ids.contains(&InstanceId::new("5").unwrap()));

        let delta = replay_events(&events, &ReplayOptions::default()).unwrap();
        assert_eq!(minutes_by_source(&delta), [("unattributed".to_string(), 60)]);
    }

    #[test]
    fn legacy_rollup_only_changes_user_totals() {
        let legacy = run(&ReplayOptions {
            rollup: RollupPolicy::CumulativeLegacy,
            ..ReplayOptions::default()
        });
        let delta = run(&ReplayOptions::default());
        assert_eq!(legacy.instances, delta.instances);
        assert_eq!(legacy.allocation_sources, delta.allocation_sources);
    }
}
