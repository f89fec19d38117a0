//! Parallel replay partitioned by instance id.
//!
//! Instances never interact, so a materialized event list can be split by
//! instance id and each part folded independently. Ticks are broadcast to
//! every shard. Each shard keeps the global order of its events, and the
//! merged result equals a sequential replay.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

use rayon::prelude::*;

use crate::accumulator::Accumulator;
use crate::classify::classify;
use crate::error::{MergeError, ReplayError};
use crate::event::Event;
use crate::fold::{ReplayOptions, fold};
use crate::record::Record;
use crate::types::InstanceId;

/// Shard index for an instance.
pub fn shard_of(instance_id: &InstanceId, shards: usize) -> usize {
    let mut hasher = DefaultHasher::new();
    instance_id.hash(&mut hasher);
    let shards = u64::try_from(shards.max(1)).unwrap_or(u64::MAX);
    usize::try_from(hasher.finish() % shards).unwrap_or_default()
}

/// Classifies a merged record sequence into an event list.
///
/// The cancel flag in `options` is checked before each record is pulled.
pub fn materialize<I>(records: I, options: &ReplayOptions) -> Result<Vec<Event>, ReplayError>
where
    I: IntoIterator<Item = Result<Record, MergeError>>,
{
    let mut events = Vec::new();
    let mut records = records.into_iter();
    for position in 0_u64.. {
        if options.is_cancelled() {
            return Err(ReplayError::Cancelled { position });
        }
        let Some(record) = records.next() else {
            break;
        };
        let event =
            classify(record?).map_err(|source| ReplayError::Classify { position, source })?;
        events.push(event);
    }
    Ok(events)
}

/// Splits events into `shards` lists of (global position, event).
fn partition(events: &[Event], shards: usize) -> Vec<Vec<(u64, &Event)>> {
    let mut parts: Vec<Vec<(u64, &Event)>> = vec![Vec::new(); shards];
    for (position, event) in (0_u64..).zip(events) {
        match event.instance_id() {
            Some(instance_id) => parts[shard_of(instance_id, shards)].push((position, event)),
            None => {
                for part in &mut parts {
                    part.push((position, event));
                }
            }
        }
    }
    parts
}

fn replay_shard(
    events: &[(u64, &Event)],
    options: &ReplayOptions,
) -> Result<Accumulator, ReplayError> {
    let mut acc = Accumulator::new();
    for &(position, event) in events {
        if options.is_cancelled() {
            return Err(ReplayError::Cancelled { position });
        }
        acc = fold(acc, event, options)
            .map_err(|source| ReplayError::Transition { position, source })?;
    }
    Ok(acc)
}

const fn error_position(err: &ReplayError) -> u64 {
    match err {
        ReplayError::Classify { position, .. }
        | ReplayError::Transition { position, .. }
        | ReplayError::Cancelled { position } => *position,
        ReplayError::Merge(_) => 0,
    }
}

/// Folds `events` on `shards` rayon tasks and merges the results.
///
/// If several shards fail, the error with the earliest position is returned.
pub fn replay_sharded(
    events: &[Event],
    shards: usize,
    options: &ReplayOptions,
) -> Result<Accumulator, ReplayError> {
    let shards = shards.max(1);
    let parts = partition(events, shards);
    tracing::debug!(events = events.len(), shards, "starting sharded replay");

    let results: Vec<Result<Accumulator, ReplayError>> = parts
        .par_iter()
        .map(|part| replay_shard(part, options))
        .collect();

    let mut merged = Accumulator::new();
    let mut first_error: Option<ReplayError> = None;
    for result in results {
        match result {
            Ok(acc) => merged = merged.merge(acc),
            Err(err) => {
                let earlier = first_error
                    .as_ref()
                    .is_none_or(|current| error_position(&err) < error_position(current));
                if earlier {
                    first_error = Some(err);
                }
            }
        }
    }
    match first_error {
        Some(err) => Err(err),
        None => Ok(merged),
    }
}
