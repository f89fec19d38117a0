//! Lazy k-way merge of timestamp-ordered record sources.
//!
//! Each source must already be sorted by its ordering key
//! ([`Record::ordering_key`]). The merger holds at most one pending record
//! per source in a min-heap, so sources of any size (database cursors,
//! paged queries) are consumed incrementally.
//!
//! Ties at equal timestamps go to the source with the lower index. Callers
//! using [`merge_sources`] get allocation changes ahead of status history:
//! an allocation switch at the same instant as a status change is treated
//! as a boundary condition that applies first.
//!
//! After every source is exhausted (or has passed `end_date`), exactly one
//! boundary record carrying `end_date` is emitted.

use std::cmp::{Ordering, Reverse};
use std::collections::BinaryHeap;
use std::iter::FusedIterator;

use chrono::{DateTime, Utc};

use crate::error::{MergeError, SourceError};
use crate::record::Record;

/// A lazily evaluated, sorted sequence of raw records.
pub type RecordStream<'a> = Box<dyn Iterator<Item = Result<Record, SourceError>> + 'a>;

/// Source priority of allocation changes in [`merge_sources`].
pub const ALLOCATION_CHANGES: usize = 0;

/// Source priority of status history in [`merge_sources`].
pub const STATUS_HISTORY: usize = 1;

/// A record waiting in the heap, keyed by (timestamp, source priority).
#[derive(Debug)]
struct Pending {
    at: DateTime<Utc>,
    source_index: usize,
    record: Record,
}

impl PartialEq for Pending {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Pending {}

impl PartialOrd for Pending {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Pending {
    fn cmp(&self, other: &Self) -> Ordering {
        self.at
            .cmp(&other.at)
            .then_with(|| self.source_index.cmp(&other.source_index))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Priming,
    Merging,
    Done,
}

/// Merges sorted record sources into one globally ordered, single-pass sequence.
pub struct StreamMerger<'a> {
    /// `None` once a source is exhausted or has passed `end_date`.
    sources: Vec<Option<RecordStream<'a>>>,
    previous: Vec<Option<DateTime<Utc>>>,
    heap: BinaryHeap<Reverse<Pending>>,
    end_date: DateTime<Utc>,
    phase: Phase,
}

impl<'a> StreamMerger<'a> {
    /// Creates a merger; the index of each source is its tie-break priority.
    pub fn new(sources: Vec<RecordStream<'a>>, end_date: DateTime<Utc>) -> Self {
        let previous = vec![None; sources.len()];
        let heap = BinaryHeap::with_capacity(sources.len());
        Self {
            sources: sources.into_iter().map(Some).collect(),
            previous,
            heap,
            end_date,
            phase: Phase::Priming,
        }
    }

    pub const fn end_date(&self) -> DateTime<Utc> {
        self.end_date
    }

    /// Pulls the next record of one source into the heap.
    fn pull(&mut self, source_index: usize) -> Result<(), MergeError> {
        let Some(source) = self.sources[source_index].as_mut() else {
            return Ok(());
        };

        let record = match source.next() {
            None => {
                self.sources[source_index] = None;
                return Ok(());
            }
            Some(Err(source)) => {
                return Err(MergeError::Source {
                    source_index,
                    source,
                });
            }
            Some(Ok(record)) => record,
        };

        let at = record
            .ordering_key()
            .map_err(|source| MergeError::Key {
                source_index,
                source,
            })?;
        if let Some(previous) = self.previous[source_index] {
            if at < previous {
                return Err(MergeError::OutOfOrder {
                    source_index,
                    at,
                    previous,
                });
            }
        }
        self.previous[source_index] = Some(at);

        if at > self.end_date {
            tracing::debug!(source_index, %at, "record source passed report end; closing it");
            self.sources[source_index] = None;
            return Ok(());
        }

        self.heap.push(Reverse(Pending {
            at,
            source_index,
            record,
        }));
        Ok(())
    }

    fn fail(&mut self, err: MergeError) -> Option<Result<Record, MergeError>> {
        self.phase = Phase::Done;
        self.heap.clear();
        Some(Err(err))
    }
}

impl Iterator for StreamMerger<'_> {
    type Item = Result<Record, MergeError>;

    fn next(&mut self) -> Option<Self::Item> {
        match self.phase {
            Phase::Done => return None,
            Phase::Priming => {
                self.phase = Phase::Merging;
                for source_index in 0..self.sources.len() {
                    if let Err(err) = self.pull(source_index) {
                        return self.fail(err);
                    }
                }
            }
            Phase::Merging => {}
        }

        if let Some(Reverse(pending)) = self.heap.pop() {
            if let Err(err) = self.pull(pending.source_index) {
                return self.fail(err);
            }
            return Some(Ok(pending.record));
        }

        self.phase = Phase::Done;
        Some(Ok(Record::boundary(self.end_date)))
    }
}

impl FusedIterator for StreamMerger<'_> {}

/// Merges the two physical sources with allocation changes winning ties.
pub fn merge_sources<'a>(
    allocation_changes: RecordStream<'a>,
    status_history: RecordStream<'a>,
    end_date: DateTime<Utc>,
) -> StreamMerger<'a> {
    // Order must match ALLOCATION_CHANGES / STATUS_HISTORY.
    StreamMerger::new(vec![allocation_changes, status_history], end_date)
}
