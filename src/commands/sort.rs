//! Sort records by coordinate or query name.
//!
//! An external merge sort: records buffer in memory until a count or memory
//! limit trips, sorted runs spill to the temp directory, and a single k-way
//! merge produces the output. Small inputs never touch the disk.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use bamline_lib::logging::OperationTimer;
use bamline_lib::pipeline::{
    Pipeline, ReaderStage, ReaderStageOptions, SortStage, WriterStage, record_channel,
};
use bamline_lib::sort::{
    CoordinateKey, ExternalSorter, QuerynameKey, SortKey, SortOrder, SorterConfig, new_sort_pool,
};
use bamline_lib::validation::validate_file_exists;
use bamline_lib::writer::CompressionMode;
use bytesize::ByteSize;
use clap::Parser;
use log::info;

use crate::commands::command::Command;
use crate::commands::common::CommonOptions;

/// Sort a record stream.
#[derive(Debug, Parser)]
#[command(name = "sort", about = "Sort records by coordinate or query name")]
pub struct Sort {
    /// Sort by query name instead of genomic coordinate.
    #[arg(long = "byname")]
    pub byname: bool,

    /// Compress temporary run files (slower spill, less disk).
    #[arg(long = "compresstemp")]
    pub compresstemp: bool,

    /// Output file.
    #[arg(long = "out", short = 'o')]
    pub out: PathBuf,

    /// In-memory buffer size before spilling, as records.
    #[arg(long = "max-buffer-count", default_value_t = 500_000)]
    pub max_buffer_count: usize,

    /// In-memory buffer size before spilling, as memory (e.g. "1GiB", "512MiB").
    #[arg(long = "max-memory", default_value = "1GiB", value_parser = parse_memory_mb)]
    pub max_memory_mb: u64,

    #[command(flatten)]
    pub common: CommonOptions,

    /// Input files, concatenated in order.
    #[arg(required = true)]
    pub inputs: Vec<PathBuf>,
}

/// Parse a memory size like "512MiB" or "2GiB" into mebibytes.
fn parse_memory_mb(s: &str) -> std::result::Result<u64, String> {
    let size = s.parse::<ByteSize>().map_err(|e| format!("invalid memory size '{s}': {e}"))?;
    let mb = size.as_u64() / (1024 * 1024);
    if mb == 0 {
        return Err(format!("memory size '{s}' is below 1 MiB"));
    }
    Ok(mb)
}

impl Sort {
    fn run_with_key<K: SortKey>(&self, order: SortOrder, command_line: &str) -> Result<u64> {
        let threads = self.common.effective_threads();
        let threading = self.common.threading_enabled();

        let (read_tx, read_rx) = record_channel();
        let (sorted_tx, sorted_rx) = record_channel();

        let options =
            ReaderStageOptions { prefetch: threading, ..ReaderStageOptions::default() };
        let reader = ReaderStage::new(&self.inputs, options, read_tx)
            .context("failed to open input")?;
        let header = reader.header();

        let sort_pool = if threading { Some(new_sort_pool(threads)?) } else { None };
        let config = SorterConfig {
            max_buffer_count: self.max_buffer_count,
            max_buffer_memory_mb: self.max_memory_mb,
            temp_compression: if self.compresstemp {
                CompressionMode::Level(1)
            } else {
                CompressionMode::Uncompressed
            },
            ..SorterConfig::default()
        };
        let sorter: ExternalSorter<K> = ExternalSorter::new(
            Arc::clone(&header),
            self.common.tmp.as_deref(),
            sort_pool,
            config,
        )?;

        let mut writer = WriterStage::new(sorted_rx, self.out.clone(), header)
            .sort_order(order)
            .compression_mode(self.common.compression_mode())
            .threads(threads);
        if !self.common.nopg {
            writer = writer.program_line(crate::version::VERSION, command_line);
        }

        let counts = Pipeline::new()
            .add(reader)
            .add(SortStage::new(read_rx, sorted_tx, sorter))
            .add(writer)
            .run_chain()?;
        Ok(stage_count(&counts, "writer"))
    }
}

/// Record count reported by the named stage.
fn stage_count(counts: &[(&'static str, u64)], name: &str) -> u64 {
    counts.iter().find(|(n, _)| *n == name).map_or(0, |(_, c)| *c)
}

impl Command for Sort {
    fn execute(&self, command_line: &str) -> Result<()> {
        self.common.validate()?;
        for input in &self.inputs {
            validate_file_exists(input, "Input")?;
        }
        if self.max_buffer_count == 0 {
            bail!("--max-buffer-count must be greater than 0");
        }

        let order = if self.byname { SortOrder::Queryname } else { SortOrder::Coordinate };
        info!("Sorting {} input(s) by {}", self.inputs.len(), order.as_sam_str());
        info!("Output: {}", self.out.display());
        info!("Threads: {}", self.common.effective_threads());
        info!(
            "Buffer limits: {} records / {} MiB",
            self.max_buffer_count, self.max_memory_mb
        );

        let timer = OperationTimer::new("Sorting records");
        let written = match order {
            SortOrder::Queryname => self.run_with_key::<QuerynameKey>(order, command_line)?,
            _ => self.run_with_key::<CoordinateKey>(order, command_line)?,
        };
        timer.log_completion(written);
        info!("Output written to {}", self.out.display());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_memory_mb() {
        assert_eq!(parse_memory_mb("1GiB").unwrap(), 1024);
        assert_eq!(parse_memory_mb("512MiB").unwrap(), 512);
        // Decimal units round down to whole mebibytes.
        assert_eq!(parse_memory_mb("1GB").unwrap(), 953);
        assert!(parse_memory_mb("1KiB").is_err());
        assert!(parse_memory_mb("garbage").is_err());
    }
}
