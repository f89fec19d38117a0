//! Turns a finished accumulator into hour totals.
//!
//! All arithmetic before this point is in whole microseconds. Conversion to
//! hours happens here and rounding only in [`UsageReport::rounded`], after
//! every sum has been taken.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::accumulator::Accumulator;
use crate::types::{AllocationSourceId, InstanceId, Usage, Username};

const MICROS_PER_HOUR: f64 = 3_600_000_000.0;

/// Default number of decimal places in rendered reports.
pub const DEFAULT_PRECISION: u32 = 2;

/// Largest precision honoured; `f64` carries no more significant decimals.
pub const MAX_PRECISION: u32 = 15;

/// Converts microseconds to hours.
#[expect(
    clippy::cast_precision_loss,
    reason = "usage below 2^53 microseconds is exact"
)]
pub fn to_hours(micros: i64) -> f64 {
    micros as f64 / MICROS_PER_HOUR
}

fn round_to(value: f64, precision: u32) -> f64 {
    let digits = i32::try_from(precision.min(MAX_PRECISION)).unwrap_or(0);
    let factor = 10_f64.powi(digits);
    (value * factor).round() / factor
}

/// Wall-clock hours and core-weighted hours.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Hours {
    pub hours: f64,
    pub cpu_hours: f64,
}

impl Hours {
    #[must_use]
    pub fn rounded(self, precision: u32) -> Self {
        Self {
            hours: round_to(self.hours, precision),
            cpu_hours: round_to(self.cpu_hours, precision),
        }
    }
}

impl From<Usage> for Hours {
    fn from(usage: Usage) -> Self {
        Self {
            hours: to_hours(usage.active_us),
            cpu_hours: to_hours(usage.cpu_us),
        }
    }
}

/// Usage of one user.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserReport {
    pub allocation_sources: BTreeMap<AllocationSourceId, Hours>,
    pub total: Hours,
    /// Cores the user had running at the end of the window, i.e. CPU-hours
    /// consumed per hour from then on.
    pub burn_rate: f64,
    pub active_instances: usize,
    pub inactive_instances: usize,
}

/// Usage charged to one allocation source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AllocationSourceReport {
    pub users: BTreeSet<Username>,
    pub usage: Hours,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Totals {
    /// Every bucket, including `unattributed`.
    pub all: Hours,
    /// Every bucket except `unattributed`.
    pub attributed: Hours,
}

/// Counters that do not affect totals but explain them.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Diagnostics {
    pub instances_missing: BTreeMap<InstanceId, u64>,
    pub statuses: BTreeMap<String, u64>,
    pub activities: BTreeMap<String, u64>,
    pub causality_skipped: BTreeMap<InstanceId, u64>,
}

/// Per-user and per-allocation-source usage at the end of a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UsageReport {
    pub end_date: Option<DateTime<Utc>>,
    pub users: BTreeMap<Username, UserReport>,
    pub allocation_sources: BTreeMap<AllocationSourceId, AllocationSourceReport>,
    pub totals: Totals,
    pub diagnostics: Diagnostics,
}

impl UsageReport {
    /// Builds the report, restricted to one user's instances if `username` is set.
    ///
    /// User hours come from the user roll-up; allocation-source hours and
    /// totals are summed from instance buckets.
    pub fn from_accumulator(acc: &Accumulator, username: Option<&Username>) -> Self {
        let selected = |owner: &Username| username.is_none_or(|wanted| wanted == owner);

        let users = acc
            .users
            .iter()
            .filter(|(name, _)| selected(name))
            .map(|(name, user)| {
                let burn_rate: u64 = user
                    .active_instance_ids
                    .iter()
                    .filter_map(|id| acc.instances.get(id))
                    .map(|instance| u64::from(instance.size_cpu))
                    .sum();
                #[expect(clippy::cast_precision_loss, reason = "core counts are small")]
                let report = UserReport {
                    allocation_sources: user
                        .allocations_usage
                        .iter()
                        .map(|(id, usage)| (id.clone(), Hours::from(*usage)))
                        .collect(),
                    total: user.total_usage().into(),
                    burn_rate: burn_rate as f64,
                    active_instances: user.active_instance_ids.len(),
                    inactive_instances: user.inactive_instance_ids.len(),
                };
                (name.clone(), report)
            })
            .collect();

        let mut by_source: BTreeMap<AllocationSourceId, Usage> = BTreeMap::new();
        for instance in acc.instances.values().filter(|i| selected(&i.created_by)) {
            for (id, usage) in &instance.allocations_durations {
                *by_source.entry(id.clone()).or_default() += *usage;
            }
        }
        for (id, roll_up) in &acc.allocation_sources {
            if roll_up.users.iter().any(|user| selected(user)) {
                by_source.entry(id.clone()).or_default();
            }
        }

        let all: Usage = by_source.values().sum();
        let attributed: Usage = by_source
            .iter()
            .filter(|(id, _)| !id.is_unattributed())
            .map(|(_, usage)| *usage)
            .sum();

        let allocation_sources = by_source
            .into_iter()
            .map(|(id, usage)| {
                let users = acc
                    .allocation_sources
                    .get(&id)
                    .map(|roll_up| {
                        roll_up
                            .users
                            .iter()
                            .filter(|user| selected(user))
                            .cloned()
                            .collect()
                    })
                    .unwrap_or_default();
                let report = AllocationSourceReport {
                    users,
                    usage: usage.into(),
                };
                (id, report)
            })
            .collect();

        Self {
            end_date: acc.last_event_at,
            users,
            allocation_sources,
            totals: Totals {
                all: all.into(),
                attributed: attributed.into(),
            },
            diagnostics: Diagnostics {
                instances_missing: acc.instances_missing.clone(),
                statuses: acc.statuses.clone(),
                activities: acc.activities.clone(),
                causality_skipped: acc.causality_skipped.clone(),
            },
        }
    }

    /// Rounds every hour figure to `precision` decimal places.
    #[must_use]
    pub fn rounded(mut self, precision: u32) -> Self {
        for user in self.users.values_mut() {
            for hours in user.allocation_sources.values_mut() {
                *hours = hours.rounded(precision);
            }
            user.total = user.total.rounded(precision);
            user.burn_rate = round_to(user.burn_rate, precision);
        }
        for source in self.allocation_sources.values_mut() {
            source.usage = source.usage.rounded(precision);
        }
        self.totals.all = self.totals.all.rounded(precision);
        self.totals.attributed = self.totals.attributed.rounded(precision);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{AllocationChangeEvent, Event, StatusHistoryEvent, TickEvent};
    use crate::fold::{ReplayOptions, replay_events};
    use chrono::{Duration, TimeZone};

    fn ts(minutes: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2016, 9, 1, 0, 0, 0)
            .single()
            .expect("valid test timestamp")
            + Duration::minutes(minutes)
    }

    fn status(instance: &str, user: &str, minutes: i64, status_name: &str, size_cpu: u32) -> Event {
        Event::StatusHistory(StatusHistoryEvent {
            instance_id: InstanceId::new(instance).unwrap(),
            activity: String::new(),
            size_cpu,
            status_name: status_name.to_string(),
            timestamp: ts(minutes),
            username: Username::new(user).unwrap(),
        })
    }

    fn switch(instance: &str, minutes: i64, source: &str) -> Event {
        Event::AllocationChange(AllocationChangeEvent {
            instance_id: InstanceId::new(instance).unwrap(),
            new_allocation_source_id: AllocationSourceId::new(source).unwrap(),
            timestamp: ts(minutes),
        })
    }

    fn accumulator() -> Accumulator {
        let events = [
            status("i-1", "alice", 0, "active", 2),
            switch("i-1", 20, "TG-A"),
            status("i-2", "bob", 30, "active", 4),
            switch("i-2", 30, "TG-A"),
            status("i-1", "alice", 80, "suspended", 2),
            Event::Tick(TickEvent { timestamp: ts(90) }),
        ];
        replay_events(&events, &ReplayOptions::default()).unwrap()
    }

    fn id(value: &str) -> AllocationSourceId {
        AllocationSourceId::new(value).unwrap()
    }

    #[test]
    fn converts_micros_to_hours() {
        assert!((to_hours(5_400_000_000) - 1.5).abs() < f64::EPSILON);
        assert_eq!(to_hours(0), 0.0);
    }

    #[test]
    fn oversized_precision_is_capped() {
        let hours = Hours {
            hours: 0.0,
            cpu_hours: 1.5,
        };
        assert_eq!(hours.rounded(400), hours);

        let third = Hours {
            hours: to_hours(1_200_000_000),
            cpu_hours: 0.0,
        };
        assert!(third.rounded(u32::MAX).hours.is_finite());
        assert_eq!(third.rounded(u32::MAX), third.rounded(MAX_PRECISION));
    }

    #[test]
    fn report_splits_users_and_sources() {
        let report = UsageReport::from_accumulator(&accumulator(), None).rounded(2);

        let alice = &report.users[&Username::new("alice").unwrap()];
        assert_eq!(alice.allocation_sources[&id("unattributed")].hours, 0.33);
        assert_eq!(alice.allocation_sources[&id("TG-A")].hours, 1.0);
        assert_eq!(alice.total.hours, 1.33);
        assert_eq!(alice.total.cpu_hours, 2.67);
        assert_eq!(alice.burn_rate, 0.0);

        let bob = &report.users[&Username::new("bob").unwrap()];
        assert_eq!(bob.allocation_sources[&id("TG-A")].hours, 1.0);
        assert_eq!(bob.allocation_sources[&id("TG-A")].cpu_hours, 4.0);
        assert_eq!(bob.burn_rate, 4.0);
        assert_eq!(bob.active_instances, 1);

        let tg_a = &report.allocation_sources[&id("TG-A")];
        assert_eq!(tg_a.usage.hours, 2.0);
        assert_eq!(tg_a.users.len(), 2);

        assert_eq!(report.totals.all.hours, 2.33);
        assert_eq!(report.totals.attributed.hours, 2.0);
        assert_eq!(report.end_date, Some(ts(90)));
        assert_eq!(report.diagnostics.statuses["active"], 2);
    }

    #[test]
    fn rounding_happens_after_summation() {
        // Three 20-minute buckets: 0.333.. each, 1.0 in total.
        let events = [
            status("i-1", "carol", 0, "active", 1),
            switch("i-1", 20, "TG-A"),
            switch("i-1", 40, "TG-B"),
            Event::Tick(TickEvent { timestamp: ts(60) }),
        ];
        let acc = replay_events(&events, &ReplayOptions::default()).unwrap();
        let report = UsageReport::from_accumulator(&acc, None).rounded(1);
        assert_eq!(report.totals.all.hours, 1.0);
        let carol = &report.users[&Username::new("carol").unwrap()];
        assert_eq!(carol.total.hours, 1.0);
        assert_eq!(carol.allocation_sources[&id("TG-A")].hours, 0.3);
    }

    #[test]
    fn username_filter_restricts_every_section() {
        let bob = Username::new("bob").unwrap();
        let report = UsageReport::from_accumulator(&accumulator(), Some(&bob)).rounded(2);

        assert_eq!(report.users.keys().collect::<Vec<_>>(), [&bob]);
        let tg_a = &report.allocation_sources[&id("TG-A")];
        assert_eq!(tg_a.usage.hours, 1.0);
        assert_eq!(tg_a.users, [bob].into_iter().collect());
        assert!(!report.allocation_sources.contains_key(&id("unattributed")));
        assert_eq!(report.totals.all.hours, 1.0);
    }

    #[test]
    fn empty_accumulator_gives_empty_report() {
        let report = UsageReport::from_accumulator(&Accumulator::new(), None);
        assert!(report.users.is_empty());
        assert!(report.allocation_sources.is_empty());
        assert_eq!(report.totals, Totals::default());
    }
}
