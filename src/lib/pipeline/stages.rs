//! Endpoint and transform stages: file reader, sorter, dedup, file writer.

use std::path::PathBuf;
use std::sync::Arc;

use crate::dedup::{DedupStats, MarkDuplicates};
use crate::errors::{BamlineError, Result};
use crate::header::Header;
use crate::load::{SystemLoadProbe, default_probe};
use crate::pipeline::{RecordReceiver, RecordSender, ShutdownFlag, Stage, shutdown_error};
use crate::reader::BamReader;
use crate::region::Region;
use crate::sort::{ExternalSorter, SortKey, SortOrder, SortedStream};
use crate::writer::{BamWriter, CompressionMode};

/// Options for [`ReaderStage`].
pub struct ReaderStageOptions {
    /// Start a prefetch worker per opened file.
    pub prefetch: bool,
    /// Load probe shared by the prefetch workers.
    pub probe: Arc<dyn SystemLoadProbe>,
    /// Optional region restriction, applied per file.
    pub region: Option<Region>,
}

impl std::fmt::Debug for ReaderStageOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReaderStageOptions")
            .field("prefetch", &self.prefetch)
            .field("region", &self.region)
            .finish_non_exhaustive()
    }
}

impl Default for ReaderStageOptions {
    fn default() -> Self {
        Self { prefetch: false, probe: default_probe(), region: None }
    }
}

/// Source stage reading one or more files in argument order.
///
/// All inputs must share the reference directory of the first; the header of
/// the first file is available from [`header`](Self::header) before the
/// pipeline runs so downstream writers can be constructed.
pub struct ReaderStage {
    first: BamReader,
    rest: Vec<PathBuf>,
    options: ReaderStageOptions,
    header: Arc<Header>,
    tx: RecordSender,
}

impl std::fmt::Debug for ReaderStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReaderStage")
            .field("first", &self.first)
            .field("rest", &self.rest)
            .field("options", &self.options)
            .field("header", &self.header)
            .finish_non_exhaustive()
    }
}

impl ReaderStage {
    /// Open the first input eagerly and stage the remainder.
    pub fn new(
        paths: &[PathBuf],
        options: ReaderStageOptions,
        tx: RecordSender,
    ) -> Result<Self> {
        let Some((first_path, rest)) = paths.split_first() else {
            return Err(BamlineError::usage("at least one input file is required"));
        };
        let mut first = BamReader::builder()
            .prefetch(options.prefetch)
            .load_probe(Arc::clone(&options.probe))
            .open(first_path)?;
        if let Some(region) = options.region {
            first.set_region(region)?;
        }
        let header = first.shared_header();
        Ok(Self { first, rest: rest.to_vec(), options, header, tx })
    }

    /// The header of the first input.
    #[must_use]
    pub fn header(&self) -> Arc<Header> {
        Arc::clone(&self.header)
    }

    fn forward(
        reader: &mut BamReader,
        tx: &RecordSender,
        shutdown: &ShutdownFlag,
        count: &mut u64,
    ) -> Result<bool> {
        while let Some(record) = reader.next_record()? {
            if shutdown.is_triggered() {
                return Ok(false);
            }
            if tx.send(record).is_err() {
                return Ok(false);
            }
            *count += 1;
            if *count % 100_000 == 0 {
                log::debug!("read {}K records", *count / 1000);
            }
        }
        Ok(true)
    }
}

impl Stage for ReaderStage {
    fn name(&self) -> &'static str {
        "reader"
    }

    fn run(self: Box<Self>, shutdown: &ShutdownFlag) -> Result<u64> {
        let Self { mut first, rest, options, header, tx } = *self;
        let mut count = 0;

        if !Self::forward(&mut first, &tx, shutdown, &mut count)? {
            return Ok(count);
        }
        drop(first);

        for path in rest {
            let mut reader = BamReader::builder()
                .prefetch(options.prefetch)
                .load_probe(Arc::clone(&options.probe))
                .open(&path)?;
            if reader.header().refs() != header.refs() {
                return Err(BamlineError::format(format!(
                    "input {} has a different reference list than the first input",
                    path.display()
                )));
            }
            if let Some(region) = options.region {
                reader.set_region(region)?;
            }
            if !Self::forward(&mut reader, &tx, shutdown, &mut count)? {
                return Ok(count);
            }
        }
        Ok(count)
    }
}

/// Transform stage running the external sorter: consumes its entire input,
/// then emits the sorted stream.
pub struct SortStage<K: SortKey> {
    rx: RecordReceiver,
    tx: RecordSender,
    sorter: ExternalSorter<K>,
}

impl<K: SortKey> SortStage<K> {
    /// Wrap a sorter between two channels.
    #[must_use]
    pub fn new(rx: RecordReceiver, tx: RecordSender, sorter: ExternalSorter<K>) -> Self {
        Self { rx, tx, sorter }
    }
}

impl<K: SortKey> Stage for SortStage<K> {
    fn name(&self) -> &'static str {
        "sort"
    }

    fn run(self: Box<Self>, shutdown: &ShutdownFlag) -> Result<u64> {
        let Self { rx, tx, mut sorter } = *self;
        for record in rx.iter() {
            if shutdown.is_triggered() {
                return Err(shutdown_error());
            }
            sorter.push(record)?;
        }
        let count = sorter.records_in();

        let stream: SortedStream<K> = sorter.finish()?;
        for record in stream {
            if shutdown.is_triggered() {
                return Err(shutdown_error());
            }
            if tx.send(record?).is_err() {
                break;
            }
        }
        Ok(count)
    }
}

/// Transform stage marking or removing duplicates.
pub struct DedupStage {
    rx: RecordReceiver,
    tx: RecordSender,
    engine: MarkDuplicates,
}

impl DedupStage {
    /// Wrap a dedup engine between two channels.
    #[must_use]
    pub fn new(rx: RecordReceiver, tx: RecordSender, engine: MarkDuplicates) -> Self {
        Self { rx, tx, engine }
    }
}

impl Stage for DedupStage {
    fn name(&self) -> &'static str {
        "dedup"
    }

    fn run(self: Box<Self>, shutdown: &ShutdownFlag) -> Result<u64> {
        let Self { rx, tx, engine } = *self;
        let stats: DedupStats = engine.run(rx.iter().map(Ok), |record| {
            if shutdown.is_triggered() || tx.send(record).is_err() {
                return Err(shutdown_error());
            }
            Ok(())
        })?;
        log::info!(
            "marked {} of {} records as duplicates ({:.2}%)",
            stats.duplicate_records,
            stats.total_records,
            stats.duplicate_rate() * 100.0
        );
        Ok(stats.total_records)
    }
}

/// Sink stage encoding records to an output file.
pub struct WriterStage {
    rx: RecordReceiver,
    path: PathBuf,
    header: Arc<Header>,
    sort_order: Option<SortOrder>,
    mode: CompressionMode,
    threads: usize,
    program_line: Option<(String, String)>,
}

impl WriterStage {
    /// Create a writer sink for `path`.
    #[must_use]
    pub fn new(rx: RecordReceiver, path: PathBuf, header: Arc<Header>) -> Self {
        Self {
            rx,
            path,
            header,
            sort_order: None,
            mode: CompressionMode::Compressed,
            threads: 1,
            program_line: None,
        }
    }

    /// Record this sort order on the output header.
    #[must_use]
    pub fn sort_order(mut self, order: SortOrder) -> Self {
        self.sort_order = Some(order);
        self
    }

    /// Set the output compression mode.
    #[must_use]
    pub fn compression_mode(mut self, mode: CompressionMode) -> Self {
        self.mode = mode;
        self
    }

    /// Number of BGZF compression workers.
    #[must_use]
    pub fn threads(mut self, threads: usize) -> Self {
        self.threads = threads;
        self
    }

    /// Add a `@PG` line to the output header.
    #[must_use]
    pub fn program_line(mut self, version: &str, command_line: &str) -> Self {
        self.program_line = Some((version.to_string(), command_line.to_string()));
        self
    }
}

impl Stage for WriterStage {
    fn name(&self) -> &'static str {
        "writer"
    }

    fn run(self: Box<Self>, shutdown: &ShutdownFlag) -> Result<u64> {
        let Self { rx, path, header, sort_order, mode, threads, program_line } = *self;

        let mut header = (*header).clone();
        if let Some(order) = sort_order {
            header.set_sort_order(order);
        }
        let mut builder = BamWriter::builder().compression_mode(mode).threads(threads);
        if let Some((version, command_line)) = &program_line {
            builder = builder.program_line(version, command_line);
        }
        let mut writer = builder.create(&path, &header)?;

        for record in rx.iter() {
            if shutdown.is_triggered() {
                return Err(shutdown_error());
            }
            writer.save(&record)?;
        }
        let count = writer.records_written();
        writer.finish()?;
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::header::RefSeq;
    use crate::pipeline::{Pipeline, record_channel};
    use crate::record::{Record, RecordBuilder};
    use crate::sort::{CoordinateKey, SorterConfig};
    use tempfile::TempDir;

    fn test_header() -> Header {
        Header::new("@HD\tVN:1.6\n", vec![RefSeq::new("chr1", 100_000)])
    }

    fn write_bam(path: &std::path::Path, records: &[Record]) {
        let mut writer = BamWriter::builder().create(path, &test_header()).unwrap();
        for record in records {
            writer.save(record).unwrap();
        }
        writer.finish().unwrap();
    }

    fn at(name: &str, pos: i32) -> Record {
        RecordBuilder::new().name(name).mapped(0, pos).build().unwrap()
    }

    #[test]
    fn test_reader_sort_writer_chain() {
        let dir = TempDir::new().unwrap();
        let input = dir.path().join("in.bam");
        let output = dir.path().join("out.bam");
        write_bam(&input, &[at("a", 300), at("b", 100), at("c", 200)]);

        let (read_tx, read_rx) = record_channel();
        let (sort_tx, sort_rx) = record_channel();
        let reader =
            ReaderStage::new(&[input], ReaderStageOptions::default(), read_tx).unwrap();
        let header = reader.header();
        let sorter: ExternalSorter<CoordinateKey> =
            ExternalSorter::new(Arc::clone(&header), None, None, SorterConfig::default())
                .unwrap();

        Pipeline::new()
            .add(reader)
            .add(SortStage::new(read_rx, sort_tx, sorter))
            .add(
                WriterStage::new(sort_rx, output.clone(), header)
                    .sort_order(SortOrder::Coordinate),
            )
            .run_chain()
            .unwrap();

        let mut out = BamReader::open(&output).unwrap();
        assert_eq!(out.header().sort_order(), SortOrder::Coordinate);
        let positions: Vec<i32> =
            out.records().map(|r| r.unwrap().position()).collect();
        assert_eq!(positions, vec![100, 200, 300]);
    }

    #[test]
    fn test_multi_file_concatenation() {
        let dir = TempDir::new().unwrap();
        let in1 = dir.path().join("a.bam");
        let in2 = dir.path().join("b.bam");
        write_bam(&in1, &[at("a", 1), at("b", 2)]);
        write_bam(&in2, &[at("c", 3)]);

        let (tx, rx) = record_channel();
        let reader =
            ReaderStage::new(&[in1, in2], ReaderStageOptions::default(), tx).unwrap();

        let collector = std::thread::spawn(move || -> Vec<String> {
            rx.iter().map(|r| r.name().to_string()).collect()
        });
        Pipeline::new().add(reader).run_chain().unwrap();
        assert_eq!(collector.join().unwrap(), vec!["a", "b", "c"]);
    }

    #[test]
    fn test_mismatched_references_rejected() {
        let dir = TempDir::new().unwrap();
        let in1 = dir.path().join("a.bam");
        let in2 = dir.path().join("b.bam");
        write_bam(&in1, &[at("a", 1)]);
        {
            let other = Header::new("@HD\tVN:1.6\n", vec![RefSeq::new("chrX", 5)]);
            let writer = BamWriter::builder().create(&in2, &other).unwrap();
            writer.finish().unwrap();
        }

        let (tx, rx) = record_channel();
        let reader =
            ReaderStage::new(&[in1, in2], ReaderStageOptions::default(), tx).unwrap();
        drop(std::thread::spawn(move || rx.iter().count()));
        let err = Pipeline::new().add(reader).run_chain().unwrap_err();
        assert!(err.to_string().contains("different reference list"));
    }

    #[test]
    fn test_empty_input_list_is_usage_error() {
        let (tx, _rx) = record_channel();
        let err =
            ReaderStage::new(&[], ReaderStageOptions::default(), tx).unwrap_err();
        assert!(matches!(err, BamlineError::Usage { .. }));
    }
}
