//! Mark or remove PCR/optical duplicates.
//!
//! Duplicates share a library, reference, unclipped 5' position and strand;
//! the representative is the read (or pair) with the highest summed base
//! quality. With threading enabled the input fans out across reference-
//! hashed lanes, each lane deduplicates independently, and a sorted merge
//! restores coordinate order before writing.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use bamline_lib::dedup::{DedupConfig, MarkDuplicates};
use bamline_lib::logging::OperationTimer;
use bamline_lib::pipeline::{
    DedupStage, Pipeline, ReaderStage, ReaderStageOptions, SortedMerge, SplitByChromosome,
    WriterStage, record_channel,
};
use bamline_lib::sort::SortOrder;
use bamline_lib::validation::validate_file_exists;
use clap::Parser;
use log::info;

use crate::commands::command::Command;
use crate::commands::common::CommonOptions;

/// Most lanes a split fan-out will use.
const MAX_LANES: usize = 12;

/// Mark or remove duplicate reads.
#[derive(Debug, Parser)]
#[command(name = "dedup", about = "Mark or remove PCR/optical duplicates")]
pub struct Dedup {
    /// Remove duplicates instead of setting the duplicate flag.
    #[arg(long = "remove", short = 'r')]
    pub remove: bool,

    /// Disable the split-by-chromosome fan-out.
    #[arg(long = "nosplit")]
    pub nosplit: bool,

    /// Output file.
    #[arg(long = "out", short = 'o')]
    pub out: PathBuf,

    #[command(flatten)]
    pub common: CommonOptions,

    /// Input files, concatenated in order.
    #[arg(required = true)]
    pub inputs: Vec<PathBuf>,
}

impl Dedup {
    fn dedup_config(&self) -> DedupConfig {
        DedupConfig {
            remove_duplicates: self.remove,
            tmp_dir: self.common.tmp.clone(),
        }
    }

    fn writer_stage(
        &self,
        rx: bamline_lib::pipeline::RecordReceiver,
        header: Arc<bamline_lib::header::Header>,
        command_line: &str,
    ) -> WriterStage {
        let mut writer = WriterStage::new(rx, self.out.clone(), header)
            .compression_mode(self.common.compression_mode())
            .threads(self.common.effective_threads());
        if !self.common.nopg {
            writer = writer.program_line(crate::version::VERSION, command_line);
        }
        writer
    }

    /// Single chain: reader -> dedup -> writer.
    fn run_single(&self, command_line: &str) -> Result<u64> {
        let (read_tx, read_rx) = record_channel();
        let (dedup_tx, dedup_rx) = record_channel();

        let options = ReaderStageOptions {
            prefetch: self.common.threading_enabled(),
            ..ReaderStageOptions::default()
        };
        let reader = ReaderStage::new(&self.inputs, options, read_tx)
            .context("failed to open input")?;
        let header = reader.header();
        let engine = MarkDuplicates::new(Arc::clone(&header), self.dedup_config());

        let counts = Pipeline::new()
            .add(reader)
            .add(DedupStage::new(read_rx, dedup_tx, engine))
            .add(self.writer_stage(dedup_rx, header, command_line))
            .run_chain()?;
        Ok(stage_count(&counts, "writer"))
    }

    /// Fan-out chain: reader -> split -> dedup per lane -> merge -> writer.
    fn run_split(&self, lanes: usize, command_line: &str) -> Result<u64> {
        let (read_tx, read_rx) = record_channel();
        let (merged_tx, merged_rx) = record_channel();

        let options = ReaderStageOptions { prefetch: true, ..ReaderStageOptions::default() };
        let reader = ReaderStage::new(&self.inputs, options, read_tx)
            .context("failed to open input")?;
        let header = reader.header();

        let (split, lane_rxs) = SplitByChromosome::new(read_rx, lanes);

        let mut pipeline = Pipeline::new().add(reader).add(split);
        let mut dedup_rxs = Vec::with_capacity(lanes);
        for lane_rx in lane_rxs {
            let (lane_tx, dedup_rx) = record_channel();
            let engine = MarkDuplicates::new(Arc::clone(&header), self.dedup_config());
            pipeline = pipeline.add(DedupStage::new(lane_rx, lane_tx, engine));
            dedup_rxs.push(dedup_rx);
        }

        pipeline = pipeline
            .add(SortedMerge::new(dedup_rxs, merged_tx, SortOrder::Coordinate))
            .add(self.writer_stage(merged_rx, header, command_line));

        let counts = pipeline.run_chain()?;
        Ok(stage_count(&counts, "writer"))
    }
}

fn stage_count(counts: &[(&'static str, u64)], name: &str) -> u64 {
    counts.iter().find(|(n, _)| *n == name).map_or(0, |(_, c)| *c)
}

impl Command for Dedup {
    fn execute(&self, command_line: &str) -> Result<()> {
        self.common.validate()?;
        for input in &self.inputs {
            validate_file_exists(input, "Input")?;
        }

        let threads = self.common.effective_threads();
        let lanes = MAX_LANES.min(threads / 2);
        let split = self.common.threading_enabled() && !self.nosplit && lanes > 1;

        info!("Deduplicating {} input(s)", self.inputs.len());
        info!("Output: {}", self.out.display());
        info!("Mode: {}", if self.remove { "remove duplicates" } else { "mark duplicates" });
        if split {
            info!("Split-by-chromosome across {lanes} lanes");
        } else if self.nosplit {
            info!("Split-by-chromosome disabled");
        }

        let timer = OperationTimer::new("Marking duplicates");
        let written = if split {
            self.run_split(lanes, command_line)?
        } else {
            self.run_single(command_line)?
        };
        timer.log_completion(written);
        info!("Output written to {}", self.out.display());
        Ok(())
    }
}
