//! Record encoding to a block-compressed output sink.

use std::fs::File;
use std::io::{self, Write};
use std::num::NonZeroUsize;
use std::path::Path;

use noodles_bgzf as bgzf;

use crate::errors::{BamlineError, Result};
use crate::header::Header;
use crate::record::{BAM_CORE_SIZE, Record};

/// How the output stream is compressed.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum CompressionMode {
    /// BGZF blocks stored without compression (level 0).
    Uncompressed,
    /// Default compression.
    Compressed,
    /// An explicit compression level (0-9).
    Level(u8),
}

impl CompressionMode {
    /// The numeric BGZF level for this mode.
    #[must_use]
    pub fn level(self) -> u8 {
        match self {
            Self::Uncompressed => 0,
            Self::Compressed => 6,
            Self::Level(level) => level,
        }
    }
}

impl Default for CompressionMode {
    fn default() -> Self {
        Self::Compressed
    }
}

enum BgzfOut {
    Single(bgzf::io::Writer<File>),
    Multi(bgzf::io::MultithreadedWriter<File>),
}

impl std::fmt::Debug for BgzfOut {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Single(_) => f.write_str("BgzfOut::Single(..)"),
            Self::Multi(_) => f.write_str("BgzfOut::Multi(..)"),
        }
    }
}

impl Write for BgzfOut {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            Self::Single(w) => w.write(buf),
            Self::Multi(w) => w.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            Self::Single(w) => w.flush(),
            Self::Multi(w) => w.flush(),
        }
    }
}

/// Builder for [`BamWriter`].
#[derive(Debug, Default)]
pub struct BamWriterBuilder {
    mode: CompressionMode,
    threads: usize,
    program_line: Option<(String, String)>,
}

impl BamWriterBuilder {
    /// Set the compression mode (default: compressed at the default level).
    #[must_use]
    pub fn compression_mode(mut self, mode: CompressionMode) -> Self {
        self.mode = mode;
        self
    }

    /// Number of BGZF compression workers; values above 1 enable the
    /// multithreaded writer.
    #[must_use]
    pub fn threads(mut self, threads: usize) -> Self {
        self.threads = threads;
        self
    }

    /// Record a `@PG` header line with this program version and command line.
    #[must_use]
    pub fn program_line(mut self, version: &str, command_line: &str) -> Self {
        self.program_line = Some((version.to_string(), command_line.to_string()));
        self
    }

    /// Open the output file and write the header.
    pub fn create<P: AsRef<Path>>(self, path: P, header: &Header) -> Result<BamWriter> {
        let path = path.as_ref();
        let file = File::create(path)
            .map_err(|e| BamlineError::io(format!("BamWriter::open {}", path.display()), e))?;

        let level = self.mode.level();
        if level > 9 {
            return Err(BamlineError::usage(format!("compression level {level} out of range 0-9")));
        }
        let compression = bgzf::io::writer::CompressionLevel::try_from(level)
            .map_err(|_| BamlineError::usage(format!("invalid compression level {level}")))?;

        let mut out = if self.threads > 1 {
            let workers = NonZeroUsize::new(self.threads).expect("threads > 1");
            BgzfOut::Multi(
                bgzf::io::multithreaded_writer::Builder::default()
                    .set_worker_count(workers)
                    .set_compression_level(compression)
                    .build_from_writer(file),
            )
        } else {
            BgzfOut::Single(
                bgzf::io::writer::Builder::default()
                    .set_compression_level(compression)
                    .build_from_writer(file),
            )
        };

        let mut header = header.clone();
        if let Some((version, command_line)) = &self.program_line {
            header.add_program_line(version, command_line);
        }
        header.write_to(&mut out).map_err(|e| BamlineError::io("BamWriter::open", e))?;

        Ok(BamWriter { out: Some(out), records_written: 0 })
    }
}

/// Serializes records to a BGZF-compressed file.
///
/// Encoding is the exact inverse of the reader: a 4-byte little-endian
/// `block_length`, the 32-byte core, then the variable payload verbatim.
#[derive(Debug)]
pub struct BamWriter {
    out: Option<BgzfOut>,
    records_written: u64,
}

impl BamWriter {
    /// Start building a writer.
    #[must_use]
    pub fn builder() -> BamWriterBuilder {
        BamWriterBuilder::default()
    }

    /// Encode one record.
    pub fn save(&mut self, record: &Record) -> Result<()> {
        let out = self
            .out
            .as_mut()
            .ok_or_else(|| BamlineError::internal("BamWriter::save after finish"))?;

        let mut core = [0u8; BAM_CORE_SIZE];
        record.encode_core(&mut core);

        let io_err = |e| BamlineError::io("BamWriter::save", e);
        out.write_all(&(record.block_length() as u32).to_le_bytes()).map_err(io_err)?;
        out.write_all(&core).map_err(io_err)?;
        out.write_all(record.payload()).map_err(io_err)?;

        self.records_written += 1;
        Ok(())
    }

    /// Number of records written so far.
    #[must_use]
    pub fn records_written(&self) -> u64 {
        self.records_written
    }

    /// Flush pending blocks and write the BGZF end-of-file marker.
    pub fn finish(mut self) -> Result<()> {
        self.finish_inner()
    }

    fn finish_inner(&mut self) -> Result<()> {
        match self.out.take() {
            Some(BgzfOut::Single(w)) => {
                w.finish().map_err(|e| BamlineError::io("BamWriter::finish", e))?;
            }
            Some(BgzfOut::Multi(mut w)) => {
                w.finish().map_err(|e| BamlineError::io("BamWriter::finish", e))?;
            }
            None => {}
        }
        Ok(())
    }
}

impl Drop for BamWriter {
    fn drop(&mut self) {
        if self.out.is_some() {
            if let Err(e) = self.finish_inner() {
                log::warn!("error closing BAM writer: {e}");
            }
        }
    }
}
