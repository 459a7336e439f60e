//! Fan-out stage routing records to lanes by reference.

use crate::errors::Result;
use crate::pipeline::{RecordReceiver, RecordSender, ShutdownFlag, Stage, record_channel};
use crate::record::Record;

/// Fan-out stage: routes each record to lane `ref_id mod k`, with unmapped
/// records (`ref_id = -1`) on lane 0.
///
/// Per-lane ordering follows input order; ordering across lanes is not
/// preserved (a downstream [`SortedMerge`](crate::pipeline::SortedMerge)
/// restores a global order).
pub struct SplitByChromosome {
    rx: RecordReceiver,
    lanes: Vec<RecordSender>,
}

impl SplitByChromosome {
    /// Create a splitter with `lanes` output channels, returning the
    /// receiving ends.
    #[must_use]
    pub fn new(rx: RecordReceiver, lanes: usize) -> (Self, Vec<RecordReceiver>) {
        let (senders, receivers): (Vec<_>, Vec<_>) =
            (0..lanes.max(1)).map(|_| record_channel()).unzip();
        (Self { rx, lanes: senders }, receivers)
    }

    /// The lane a record routes to.
    #[must_use]
    pub fn lane_of(record: &Record, lanes: usize) -> usize {
        if record.ref_id() < 0 { 0 } else { record.ref_id() as usize % lanes }
    }
}

impl Stage for SplitByChromosome {
    fn name(&self) -> &'static str {
        "split"
    }

    fn run(self: Box<Self>, shutdown: &ShutdownFlag) -> Result<u64> {
        let Self { rx, lanes } = *self;
        let mut count = 0;
        for record in rx.iter() {
            if shutdown.is_triggered() {
                break;
            }
            let lane = Self::lane_of(&record, lanes.len());
            if lanes[lane].send(record).is_err() {
                break;
            }
            count += 1;
        }
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::{Pipeline, record_channel};
    use crate::record::RecordBuilder;

    fn at(name: &str, ref_id: i32) -> Record {
        let mut b = RecordBuilder::new().name(name);
        if ref_id >= 0 {
            b = b.mapped(ref_id, 100);
        }
        b.build().unwrap()
    }

    #[test]
    fn test_lane_routing() {
        let unmapped = at("u", -1);
        assert_eq!(SplitByChromosome::lane_of(&unmapped, 3), 0);
        assert_eq!(SplitByChromosome::lane_of(&at("a", 0), 3), 0);
        assert_eq!(SplitByChromosome::lane_of(&at("b", 1), 3), 1);
        assert_eq!(SplitByChromosome::lane_of(&at("c", 5), 3), 2);
    }

    #[test]
    fn test_split_preserves_per_lane_order() {
        let (tx, rx) = record_channel();
        let (split, lane_rxs) = SplitByChromosome::new(rx, 2);

        for (name, ref_id) in [("a", 0), ("b", 1), ("c", 2), ("d", 1), ("e", 0)] {
            tx.send(at(name, ref_id)).unwrap();
        }
        drop(tx);

        let collectors: Vec<_> = lane_rxs
            .into_iter()
            .map(|rx| {
                std::thread::spawn(move || -> Vec<String> {
                    rx.iter().map(|r| r.name().to_string()).collect()
                })
            })
            .collect();

        Pipeline::new().add(split).run_chain().unwrap();

        let lanes: Vec<Vec<String>> =
            collectors.into_iter().map(|c| c.join().unwrap()).collect();
        assert_eq!(lanes[0], vec!["a", "c", "e"]);
        assert_eq!(lanes[1], vec!["b", "d"]);
    }
}
