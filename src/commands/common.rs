//! CLI options shared across commands.

use std::path::PathBuf;

use anyhow::{Result, bail};
use bamline_lib::load::available_cores;
use bamline_lib::writer::CompressionMode;
use clap::{Args, ValueEnum};

/// Output container format.
#[derive(Clone, Copy, Debug, Eq, PartialEq, ValueEnum)]
pub enum OutputFormat {
    /// Block-compressed binary records.
    Bam,
    /// SAM text (handled by the text-output sibling, not this build).
    Sam,
    /// FASTQ (handled by the fastq-output sibling, not this build).
    Fastq,
}

/// Flags accepted by every command.
#[derive(Args, Clone, Debug)]
pub struct CommonOptions {
    /// Number of threads (0 = all cores, 1 = disable threading).
    #[arg(long = "threads", short = 't', default_value_t = 0)]
    pub threads: usize,

    /// Directory for temporary files.
    #[arg(long = "tmp")]
    pub tmp: Option<PathBuf>,

    /// Verbose logging.
    #[arg(long = "verbose", short = 'v')]
    pub verbose: bool,

    /// Do not add a @PG line to the output header.
    #[arg(long = "nopg")]
    pub nopg: bool,

    /// Output format.
    #[arg(long = "format", value_enum, default_value = "bam")]
    pub format: OutputFormat,

    /// Compression level for the output (0-9).
    #[arg(long = "compression", default_value_t = 6)]
    pub compression: u8,
}

impl CommonOptions {
    /// Thread count with 0 resolved to the core count.
    #[must_use]
    pub fn effective_threads(&self) -> usize {
        if self.threads == 0 { available_cores() } else { self.threads }
    }

    /// Whether background workers and pools are enabled.
    #[must_use]
    pub fn threading_enabled(&self) -> bool {
        self.effective_threads() > 1
    }

    /// The output compression mode.
    #[must_use]
    pub fn compression_mode(&self) -> CompressionMode {
        CompressionMode::Level(self.compression)
    }

    /// Reject configurations this build cannot honor.
    pub fn validate(&self) -> Result<()> {
        if self.compression > 9 {
            bail!("--compression must be between 0 and 9, got {}", self.compression);
        }
        if self.format != OutputFormat::Bam {
            bail!("only --format bam is supported by this tool");
        }
        Ok(())
    }
}
