//! Producer/consumer pipeline framework.
//!
//! A pipeline is a set of stages connected by bounded record channels, one
//! OS thread driving each stage. Records move by ownership: a stage that has
//! sent a record downstream no longer holds it. End of stream is the channel
//! disconnecting when the upstream driver returns.
//!
//! Failure propagation: the first stage to fail trips the shared shutdown
//! flag; other stages notice it (or their channels disconnecting) and wind
//! down without reporting errors of their own. [`Pipeline::run_chain`]
//! returns the originating error.

pub mod merge;
pub mod split;
pub mod stages;

pub use merge::SortedMerge;
pub use split::SplitByChromosome;
pub use stages::{DedupStage, ReaderStage, ReaderStageOptions, SortStage, WriterStage};

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;

use crossbeam_channel::{Receiver, Sender, bounded};

use crate::errors::{BamlineError, Result};
use crate::record::Record;

/// Capacity of the bounded channels between stages.
pub const CHANNEL_CAPACITY: usize = 1024;

/// Sending half of a record channel.
pub type RecordSender = Sender<Record>;
/// Receiving half of a record channel.
pub type RecordReceiver = Receiver<Record>;

/// A bounded channel of owned records.
#[must_use]
pub fn record_channel() -> (RecordSender, RecordReceiver) {
    bounded(CHANNEL_CAPACITY)
}

/// Cooperative shutdown signal shared by every stage of a pipeline.
#[derive(Clone, Debug, Default)]
pub struct ShutdownFlag(Arc<AtomicBool>);

impl ShutdownFlag {
    /// Request that all stages wind down.
    pub fn trigger(&self) {
        self.0.store(true, Ordering::Release);
    }

    /// Whether shutdown has been requested.
    #[must_use]
    pub fn is_triggered(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

/// Error a stage reports when it stopped because the pipeline is shutting
/// down rather than because of its own fault.
pub(crate) const SHUTDOWN_MSG: &str = "pipeline shutdown";

pub(crate) fn shutdown_error() -> BamlineError {
    BamlineError::internal(SHUTDOWN_MSG)
}

fn is_shutdown_error(error: &BamlineError) -> bool {
    matches!(error, BamlineError::Internal { reason } if reason == SHUTDOWN_MSG)
}

/// One pipeline stage, driven to completion on its own thread.
///
/// `run` consumes the stage: input receivers and output senders drop when it
/// returns, which is what signals end-of-stream to its neighbors. The
/// returned count is the number of records the stage processed.
pub trait Stage: Send + 'static {
    /// Short stage name for thread naming and logs.
    fn name(&self) -> &'static str;

    /// Drive the stage until its input is exhausted or shutdown is signaled.
    fn run(self: Box<Self>, shutdown: &ShutdownFlag) -> Result<u64>;
}

/// An assembled chain of stages.
#[derive(Default)]
pub struct Pipeline {
    stages: Vec<Box<dyn Stage>>,
}

impl Pipeline {
    /// An empty pipeline.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a stage. Stages are spawned in insertion order; insert
    /// upstream stages first so error reporting prefers the source fault.
    #[must_use]
    pub fn add(mut self, stage: impl Stage) -> Self {
        self.stages.push(Box::new(stage));
        self
    }

    /// Spawn one driver per stage and block until all complete.
    ///
    /// Succeeds iff every stage succeeded, returning each stage's record
    /// count in insertion order; otherwise returns the first non-shutdown
    /// error in stage order.
    pub fn run_chain(self) -> Result<Vec<(&'static str, u64)>> {
        let shutdown = ShutdownFlag::default();
        let mut handles = Vec::with_capacity(self.stages.len());

        for stage in self.stages {
            let flag = shutdown.clone();
            let name = stage.name();
            let handle = thread::Builder::new()
                .name(format!("bamline-{name}"))
                .spawn(move || {
                    let result = stage.run(&flag);
                    if result.is_err() {
                        flag.trigger();
                    }
                    result
                })
                .map_err(|e| BamlineError::io("Pipeline::run_chain", e))?;
            handles.push((name, handle));
        }

        let mut counts = Vec::with_capacity(handles.len());
        let mut first_error = None;
        let mut first_shutdown = None;
        for (name, handle) in handles {
            match handle.join() {
                Ok(Ok(count)) => {
                    log::debug!("stage {name}: {count} records");
                    counts.push((name, count));
                }
                Ok(Err(e)) => {
                    log::debug!("stage {name} failed: {e}");
                    if is_shutdown_error(&e) {
                        first_shutdown.get_or_insert(e);
                    } else {
                        first_error.get_or_insert(e);
                    }
                }
                Err(_) => {
                    first_error
                        .get_or_insert(BamlineError::internal(format!("stage {name} panicked")));
                }
            }
        }

        match first_error.or(first_shutdown) {
            Some(e) => Err(e),
            None => Ok(counts),
        }
    }
}
