//! External merge sort: run generation, spill, and k-way merge.

use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::fs;
use std::mem;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crossbeam_channel::{Receiver, bounded};
use rayon::prelude::*;
use tempfile::TempDir;

use crate::errors::{BamlineError, Result};
use crate::header::Header;
use crate::reader::BamReader;
use crate::record::Record;
use crate::sort::keys::SortKey;
use crate::writer::{BamWriter, CompressionMode};

/// Buffer limits and parallelism thresholds for the sorter.
#[derive(Clone, Copy, Debug)]
pub struct SorterConfig {
    /// Spill when the buffer holds this many records.
    pub max_buffer_count: usize,
    /// Spill when the buffer holds this many megabytes.
    pub max_buffer_memory_mb: u64,
    /// Buffers smaller than this sort single-threaded even with a pool.
    pub min_parallel_sort: usize,
    /// Compression for temp run files.
    pub temp_compression: CompressionMode,
}

impl Default for SorterConfig {
    fn default() -> Self {
        Self {
            max_buffer_count: 500_000,
            max_buffer_memory_mb: 1024,
            min_parallel_sort: 30_000,
            temp_compression: CompressionMode::Uncompressed,
        }
    }
}

/// Build the dedicated pool for sort and spill jobs.
///
/// Sort work runs on its own pool so nested sort tasks cannot starve
/// pipeline stage drivers.
pub fn new_sort_pool(threads: usize) -> Result<Arc<rayon::ThreadPool>> {
    rayon::ThreadPoolBuilder::new()
        .num_threads(threads)
        .thread_name(|i| format!("bamline-sort-{i}"))
        .build()
        .map(Arc::new)
        .map_err(|e| BamlineError::internal(format!("failed to build sort pool: {e}")))
}

/// External sorter: push records, then [`finish`](Self::finish) into a
/// sorted stream.
///
/// Records accumulate in memory until a count or memory limit trips; the
/// buffer is then detached and sorted+spilled on the sort pool while a fresh
/// buffer fills. Spills may complete in any order; correctness only needs
/// each run internally sorted. A single-run (or pool-less) sorter skips the
/// disk entirely.
pub struct ExternalSorter<K: SortKey> {
    config: SorterConfig,
    header: Arc<Header>,
    temp_dir: TempDir,
    sort_pool: Option<Arc<rayon::ThreadPool>>,
    buffer: Vec<(K, Record)>,
    buffer_bytes: u64,
    runs: Vec<PathBuf>,
    pending: Vec<(usize, Receiver<Result<()>>)>,
    records_in: u64,
}

impl<K: SortKey> ExternalSorter<K> {
    /// Create a sorter spilling under `tmp_dir` (system temp when `None`).
    pub fn new(
        header: Arc<Header>,
        tmp_dir: Option<&Path>,
        sort_pool: Option<Arc<rayon::ThreadPool>>,
        config: SorterConfig,
    ) -> Result<Self> {
        let temp_dir = match tmp_dir {
            Some(base) => {
                fs::create_dir_all(base)
                    .map_err(|e| BamlineError::io("ExternalSorter::new", e))?;
                TempDir::new_in(base)
            }
            None => TempDir::new(),
        }
        .map_err(|e| BamlineError::io("ExternalSorter::new", e))?;

        Ok(Self {
            config,
            header,
            temp_dir,
            sort_pool,
            buffer: Vec::new(),
            buffer_bytes: 0,
            runs: Vec::new(),
            pending: Vec::new(),
            records_in: 0,
        })
    }

    /// Number of records pushed so far.
    #[must_use]
    pub fn records_in(&self) -> u64 {
        self.records_in
    }

    /// Number of runs spilled so far.
    #[must_use]
    pub fn runs_spilled(&self) -> usize {
        self.runs.len()
    }

    /// Add one record, spilling the buffer if a limit trips.
    pub fn push(&mut self, record: Record) -> Result<()> {
        let key = K::from_record(&record);
        self.buffer_bytes +=
            (record.heap_size() + mem::size_of::<(K, Record)>()) as u64;
        self.buffer.push((key, record));
        self.records_in += 1;

        if self.buffer.len() >= self.config.max_buffer_count
            || self.buffer_bytes >= self.config.max_buffer_memory_mb * 1024 * 1024
        {
            self.spill()?;
        }
        Ok(())
    }

    fn spill(&mut self) -> Result<()> {
        let buffer = mem::take(&mut self.buffer);
        self.buffer_bytes = 0;
        let run_idx = self.runs.len();
        let path = self.temp_dir.path().join(format!("run_{run_idx}"));
        self.runs.push(path.clone());
        log::debug!("spilling run {run_idx} ({} records)", buffer.len());

        let header = Arc::clone(&self.header);
        let config = self.config;
        match &self.sort_pool {
            Some(pool) => {
                let (tx, rx) = bounded(1);
                self.pending.push((run_idx, rx));
                pool.spawn(move || {
                    let result = sort_and_spill(buffer, &path, &header, &config, true);
                    let _ = tx.send(result);
                });
            }
            None => sort_and_spill(buffer, &path, &header, &config, false)?,
        }
        Ok(())
    }

    /// Spill the tail, wait for outstanding spill jobs, and open the merge.
    ///
    /// Any spill failure surfaces here.
    pub fn finish(mut self) -> Result<SortedStream<K>> {
        if self.runs.is_empty() {
            let mut buffer = mem::take(&mut self.buffer);
            let parallel = self.sort_pool.is_some();
            let min_parallel = self.config.min_parallel_sort;
            match &self.sort_pool {
                Some(pool) if buffer.len() >= min_parallel => {
                    pool.install(|| sort_buffer(&mut buffer, parallel, min_parallel));
                }
                _ => sort_buffer(&mut buffer, false, min_parallel),
            }
            return Ok(SortedStream { inner: StreamInner::Memory(buffer.into_iter()) });
        }

        if !self.buffer.is_empty() {
            self.spill()?;
        }
        for (run_idx, rx) in self.pending.drain(..) {
            rx.recv().map_err(|_| {
                BamlineError::internal(format!("spill worker for run {run_idx} vanished"))
            })??;
        }

        let mut sources = Vec::with_capacity(self.runs.len());
        let mut heap = BinaryHeap::with_capacity(self.runs.len());
        for (run, path) in self.runs.iter().enumerate() {
            let mut reader = BamReader::open(path)?;
            let guard = RunGuard(path.clone());
            match reader.next_record()? {
                Some(record) => {
                    let key = K::from_record(&record);
                    heap.push(Reverse(MergeEntry { key, run, record }));
                    sources.push(Some(RunSource { reader, _guard: guard }));
                }
                None => sources.push(None),
            }
        }

        Ok(SortedStream {
            inner: StreamInner::Merge { heap, sources, _tmp: self.temp_dir },
        })
    }
}

fn sort_and_spill<K: SortKey>(
    mut buffer: Vec<(K, Record)>,
    path: &Path,
    header: &Header,
    config: &SorterConfig,
    parallel: bool,
) -> Result<()> {
    sort_buffer(&mut buffer, parallel, config.min_parallel_sort);
    let mut writer =
        BamWriter::builder().compression_mode(config.temp_compression).create(path, header)?;
    for (_, record) in &buffer {
        writer.save(record)?;
    }
    writer.finish()
}

/// Stable sort by key. Large buffers use rayon's parallel stable sort, which
/// recurses into sequential sorts at its leaves.
fn sort_buffer<K: SortKey>(buffer: &mut [(K, Record)], parallel: bool, min_parallel: usize) {
    if parallel && buffer.len() >= min_parallel {
        buffer.par_sort_by(|a, b| a.0.cmp(&b.0));
    } else {
        buffer.sort_by(|a, b| a.0.cmp(&b.0));
    }
}

/// Deletes one run file when its reader is drained.
struct RunGuard(PathBuf);

impl Drop for RunGuard {
    fn drop(&mut self) {
        let _ = fs::remove_file(&self.0);
    }
}

struct RunSource {
    reader: BamReader,
    _guard: RunGuard,
}

struct MergeEntry<K> {
    key: K,
    run: usize,
    record: Record,
}

impl<K: Ord> PartialEq for MergeEntry<K> {
    fn eq(&self, other: &Self) -> bool {
        self.key == other.key && self.run == other.run
    }
}

impl<K: Ord> Eq for MergeEntry<K> {}

impl<K: Ord> PartialOrd for MergeEntry<K> {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl<K: Ord> Ord for MergeEntry<K> {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        // Ties break toward the earlier run, keeping the merge stable.
        self.key.cmp(&other.key).then_with(|| self.run.cmp(&other.run))
    }
}

enum StreamInner<K: SortKey> {
    Memory(std::vec::IntoIter<(K, Record)>),
    Merge {
        heap: BinaryHeap<Reverse<MergeEntry<K>>>,
        sources: Vec<Option<RunSource>>,
        _tmp: TempDir,
    },
}

/// The sorted output stream of [`ExternalSorter::finish`].
pub struct SortedStream<K: SortKey> {
    inner: StreamInner<K>,
}

impl<K: SortKey> Iterator for SortedStream<K> {
    type Item = Result<Record>;

    fn next(&mut self) -> Option<Self::Item> {
        match &mut self.inner {
            StreamInner::Memory(iter) => iter.next().map(|(_, record)| Ok(record)),
            StreamInner::Merge { heap, sources, .. } => {
                let Reverse(entry) = heap.pop()?;
                let run = entry.run;
                let refill = match sources[run].as_mut() {
                    Some(source) => match source.reader.next_record() {
                        Ok(next) => next,
                        Err(e) => return Some(Err(e)),
                    },
                    None => None,
                };
                match refill {
                    Some(record) => {
                        let key = K::from_record(&record);
                        heap.push(Reverse(MergeEntry { key, run, record }));
                    }
                    // Drained: dropping the source deletes its run file.
                    None => sources[run] = None,
                }
                Some(Ok(entry.record))
            }
        }
    }
}
