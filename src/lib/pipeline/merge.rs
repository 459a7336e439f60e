//! Fan-in stage restoring a global order over split lanes.

use std::cmp::Reverse;
use std::collections::BinaryHeap;

use crate::errors::{BamlineError, Result};
use crate::pipeline::{RecordReceiver, RecordSender, ShutdownFlag, Stage};
use crate::record::Record;
use crate::sort::{CoordinateKey, QuerynameKey, SortKey, SortOrder};

/// Fan-in stage: k-way merge over upstream channels.
///
/// Holds one pending record per upstream and repeatedly emits the minimum
/// under the active comparator, refilling from the lane it came from. Each
/// lane must already be ordered by the same comparator; ties break toward
/// the lower lane index.
pub struct SortedMerge {
    rxs: Vec<RecordReceiver>,
    tx: RecordSender,
    order: SortOrder,
}

impl SortedMerge {
    /// Create a merge of `rxs` ordered by `order`.
    #[must_use]
    pub fn new(rxs: Vec<RecordReceiver>, tx: RecordSender, order: SortOrder) -> Self {
        Self { rxs, tx, order }
    }
}

struct LaneEntry<K> {
    key: K,
    lane: usize,
    record: Record,
}

impl<K: Ord> PartialEq for LaneEntry<K> {
    fn eq(&self, other: &Self) -> bool {
        self.key == other.key && self.lane == other.lane
    }
}

impl<K: Ord> Eq for LaneEntry<K> {}

impl<K: Ord> PartialOrd for LaneEntry<K> {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl<K: Ord> Ord for LaneEntry<K> {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.key.cmp(&other.key).then_with(|| self.lane.cmp(&other.lane))
    }
}

fn merge_lanes<K: SortKey>(
    rxs: &[RecordReceiver],
    tx: &RecordSender,
    shutdown: &ShutdownFlag,
) -> Result<u64> {
    let mut heap: BinaryHeap<Reverse<LaneEntry<K>>> = BinaryHeap::with_capacity(rxs.len());
    for (lane, rx) in rxs.iter().enumerate() {
        if let Ok(record) = rx.recv() {
            heap.push(Reverse(LaneEntry { key: K::from_record(&record), lane, record }));
        }
    }

    let mut count = 0;
    while let Some(Reverse(entry)) = heap.pop() {
        if shutdown.is_triggered() {
            break;
        }
        let lane = entry.lane;
        if tx.send(entry.record).is_err() {
            break;
        }
        count += 1;
        if let Ok(record) = rxs[lane].recv() {
            heap.push(Reverse(LaneEntry { key: K::from_record(&record), lane, record }));
        }
    }
    Ok(count)
}

impl Stage for SortedMerge {
    fn name(&self) -> &'static str {
        "merge"
    }

    fn run(self: Box<Self>, shutdown: &ShutdownFlag) -> Result<u64> {
        let Self { rxs, tx, order } = *self;
        match order {
            SortOrder::Coordinate => merge_lanes::<CoordinateKey>(&rxs, &tx, shutdown),
            SortOrder::Queryname => merge_lanes::<QuerynameKey>(&rxs, &tx, shutdown),
            SortOrder::Unknown => {
                Err(BamlineError::usage("sorted merge requires a concrete sort order"))
            }
        }
    }
}
