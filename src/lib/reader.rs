//! Record reader with an adaptive background prefetch worker.
//!
//! The reader decodes records from a BGZF stream. When prefetch is enabled a
//! background thread owns the decode stream and pushes records into a
//! channel, overlapping block decompression with downstream processing. The
//! worker throttles itself against queue depth and the system load average so
//! many concurrent readers on seek-bound storage degrade gracefully.
//!
//! `seek`, `rewind` and `close` synchronously stop the worker and reclaim the
//! stream before touching it; the worker hands the stream back through its
//! join handle.

use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{Receiver, Sender, unbounded};
use noodles_bgzf as bgzf;
use parking_lot::Mutex;

use crate::errors::{BamlineError, Result};
use crate::header::Header;
use crate::load::{SystemLoadProbe, default_probe};
use crate::record::{BAM_CORE_SIZE, Record};
use crate::region::{Region, RegionState};
use crate::virtual_offset::VirtualOffset;

/// Iterations between load-average checks in the prefetch worker.
const LOAD_CHECK_INTERVAL: u64 = 300;
/// Queue depth that triggers throttling when the system is loaded.
const LOADED_HIGH_WATER: usize = 400;
/// Depth drained to when the system is loaded.
const LOADED_LOW_WATER: usize = 100;
/// Queue depth that triggers throttling regardless of load.
const HIGH_WATER: usize = 20_000;
/// Depth drained to in the unloaded case.
const LOW_WATER: usize = 5_000;
/// Poll interval while draining.
const THROTTLE_POLL: Duration = Duration::from_millis(20);

/// The decode stream: the BGZF device plus the header it was opened with.
struct RecordStream {
    dev: bgzf::io::Reader<File>,
    header: Arc<Header>,
}

impl RecordStream {
    fn tell(&self) -> VirtualOffset {
        VirtualOffset::from(self.dev.virtual_position())
    }

    fn seek(&mut self, offset: VirtualOffset) -> Result<()> {
        self.dev
            .seek(offset.into())
            .map(|_| ())
            .map_err(|e| BamlineError::io("BamReader::seek", e))
    }

    /// Decode the next record. `Ok(None)` is the end of the stream: either no
    /// bytes remain where a block length should start, or the length is zero.
    fn read_record(&mut self) -> Result<Option<Record>> {
        let mut len_buf = [0u8; 4];
        let mut got = 0;
        while got < len_buf.len() {
            let n = self
                .dev
                .read(&mut len_buf[got..])
                .map_err(|e| BamlineError::io("BamReader::next", e))?;
            if n == 0 {
                break;
            }
            got += n;
        }
        if got == 0 {
            return Ok(None);
        }
        if got < len_buf.len() {
            return Err(BamlineError::format("truncated block length at end of stream"));
        }

        let block_length = u32::from_le_bytes(len_buf) as usize;
        if block_length == 0 {
            return Ok(None);
        }
        if block_length < BAM_CORE_SIZE {
            return Err(BamlineError::format(format!(
                "block length {block_length} below core size {BAM_CORE_SIZE}"
            )));
        }

        let mut core = [0u8; BAM_CORE_SIZE];
        self.dev.read_exact(&mut core).map_err(|e| {
            short_read(e, "expected more bytes reading record core; is the file truncated?")
        })?;

        let mut data = vec![0u8; block_length - BAM_CORE_SIZE];
        self.dev.read_exact(&mut data).map_err(|e| {
            short_read(e, "expected more bytes reading record payload; is the file truncated?")
        })?;

        let record = Record::decode(&core, data)?;
        self.validate(&record)?;
        Ok(Some(record))
    }

    fn validate(&self, record: &Record) -> Result<()> {
        let refs = self.header.refs();
        if record.ref_id() < -1 || record.ref_id() >= refs.len() as i32 {
            return Err(BamlineError::format(format!(
                "reference id {} out of range (have {} references)",
                record.ref_id(),
                refs.len()
            )));
        }
        if record.ref_id() >= 0 {
            let ref_len = refs[record.ref_id() as usize].len as i32;
            if record.position() < -1 || record.position() > ref_len {
                return Err(BamlineError::format(format!(
                    "position {} outside reference of length {ref_len}",
                    record.position()
                )));
            }
        }
        Ok(())
    }
}

fn short_read(e: std::io::Error, what: &str) -> BamlineError {
    if e.kind() == std::io::ErrorKind::UnexpectedEof {
        BamlineError::format(what)
    } else {
        BamlineError::io("BamReader::next", e)
    }
}

/// One message from the prefetch worker.
enum Fetched {
    /// A decoded record and the offset one past its end.
    Record { record: Record, end: VirtualOffset },
    /// Clean end of stream.
    Done,
    /// Decode failed; the stream is unusable past this point.
    Failed(BamlineError),
}

struct Prefetcher {
    rx: Receiver<Fetched>,
    stop: Arc<AtomicBool>,
    handle: JoinHandle<RecordStream>,
}

enum Engine {
    Direct(RecordStream),
    Prefetching(Prefetcher),
}

/// The prefetch worker: decode records and enqueue them until end of stream,
/// a failure, or a stop request.
fn prefetch_loop(
    mut stream: RecordStream,
    tx: &Sender<Fetched>,
    stop: &AtomicBool,
    probe: &dyn SystemLoadProbe,
) -> RecordStream {
    let mut iterations: u64 = 0;
    while !stop.load(Ordering::Acquire) {
        match stream.read_record() {
            Ok(Some(record)) => {
                let end = stream.tell();
                if tx.send(Fetched::Record { record, end }).is_err() {
                    break;
                }
            }
            Ok(None) => {
                let _ = tx.send(Fetched::Done);
                break;
            }
            Err(e) => {
                let _ = tx.send(Fetched::Failed(e));
                break;
            }
        }

        if iterations % LOAD_CHECK_INTERVAL == 0 {
            // When the machine is busy, drain the queue almost dry before
            // reading on; otherwise only clamp runaway queue growth.
            if probe.load_fraction() > 0.5 && tx.len() > LOADED_HIGH_WATER {
                while tx.len() > LOADED_LOW_WATER && !stop.load(Ordering::Acquire) {
                    thread::sleep(THROTTLE_POLL);
                }
            } else if tx.len() > HIGH_WATER {
                while tx.len() > LOW_WATER && !stop.load(Ordering::Acquire) {
                    thread::sleep(THROTTLE_POLL);
                }
            }
        }
        iterations += 1;
    }
    stream
}

/// Builder for [`BamReader`].
pub struct BamReaderBuilder {
    prefetch: bool,
    probe: Arc<dyn SystemLoadProbe>,
}

impl Default for BamReaderBuilder {
    fn default() -> Self {
        Self { prefetch: false, probe: default_probe() }
    }
}

impl BamReaderBuilder {
    /// Enable the background prefetch worker.
    #[must_use]
    pub fn prefetch(mut self, enabled: bool) -> Self {
        self.prefetch = enabled;
        self
    }

    /// Replace the system load probe used by the throttle.
    #[must_use]
    pub fn load_probe(mut self, probe: Arc<dyn SystemLoadProbe>) -> Self {
        self.probe = probe;
        self
    }

    /// Open a file: acquire the device, parse the header and reference
    /// directory, record the offset of the first record, and start the
    /// prefetch worker when enabled.
    pub fn open<P: AsRef<Path>>(self, path: P) -> Result<BamReader> {
        let path = path.as_ref().to_path_buf();
        let file = File::open(&path)
            .map_err(|e| BamlineError::io(format!("BamReader::open {}", path.display()), e))?;
        let mut dev = bgzf::io::Reader::new(file);
        let header = Arc::new(Header::read_from(&mut dev)?);
        let alignments_begin = VirtualOffset::from(dev.virtual_position());

        let stream = RecordStream { dev, header: Arc::clone(&header) };
        let mut reader = BamReader {
            path,
            header,
            alignments_begin,
            position: alignments_begin,
            engine: Some(Engine::Direct(stream)),
            region: None,
            region_done: false,
            prefetch: self.prefetch,
            probe: self.probe,
            last_error: Mutex::new(None),
        };
        if reader.prefetch {
            reader.start_prefetch()?;
        }
        Ok(reader)
    }
}

/// Sequential record reader over a block-compressed file, with optional
/// region filtering and background prefetch.
pub struct BamReader {
    path: PathBuf,
    header: Arc<Header>,
    alignments_begin: VirtualOffset,
    /// Start offset of the next unconsumed record.
    position: VirtualOffset,
    engine: Option<Engine>,
    region: Option<Region>,
    region_done: bool,
    prefetch: bool,
    probe: Arc<dyn SystemLoadProbe>,
    last_error: Mutex<Option<String>>,
}

impl std::fmt::Debug for BamReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BamReader")
            .field("path", &self.path)
            .field("position", &self.position)
            .field("region", &self.region)
            .finish_non_exhaustive()
    }
}

impl BamReader {
    /// Open a file with prefetch disabled.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        Self::builder().open(path)
    }

    /// Start building a reader.
    #[must_use]
    pub fn builder() -> BamReaderBuilder {
        BamReaderBuilder::default()
    }

    /// The header parsed at open.
    #[must_use]
    pub fn header(&self) -> &Header {
        &self.header
    }

    /// Shared handle to the header.
    #[must_use]
    pub fn shared_header(&self) -> Arc<Header> {
        Arc::clone(&self.header)
    }

    /// The path this reader was opened on.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Virtual offset of the first record.
    #[must_use]
    pub fn alignments_begin(&self) -> VirtualOffset {
        self.alignments_begin
    }

    /// The next record, honoring any active region: records left of the
    /// region are skipped, and the stream terminates once a record starts
    /// past it.
    pub fn next_record(&mut self) -> Result<Option<Record>> {
        if self.region_done {
            return Ok(None);
        }
        loop {
            let Some(record) = self.read_one()? else {
                return Ok(None);
            };
            let Some(region) = self.region else {
                return Ok(Some(record));
            };
            match region.classify(&record) {
                RegionState::BeforeRegion => {}
                RegionState::OverlapsRegion => return Ok(Some(record)),
                RegionState::AfterRegion => {
                    self.region_done = true;
                    return Ok(None);
                }
            }
        }
    }

    /// Iterator over the remaining records.
    pub fn records(&mut self) -> Records<'_> {
        Records { reader: self }
    }

    fn read_one(&mut self) -> Result<Option<Record>> {
        match self.engine.as_mut() {
            Some(Engine::Direct(stream)) => match stream.read_record() {
                Ok(Some(record)) => {
                    self.position = stream.tell();
                    Ok(Some(record))
                }
                Ok(None) => Ok(None),
                Err(e) => {
                    self.record_error("next", &e);
                    Err(e)
                }
            },
            Some(Engine::Prefetching(p)) => match p.rx.recv() {
                Ok(Fetched::Record { record, end }) => {
                    self.position = end;
                    Ok(Some(record))
                }
                Ok(Fetched::Done) | Err(_) => Ok(None),
                Ok(Fetched::Failed(e)) => {
                    self.record_error("next", &e);
                    Err(e)
                }
            },
            None => Err(BamlineError::internal("reader used after close")),
        }
    }

    /// The virtual offset of the next record `next_record` would return, so
    /// `seek(tell())` is a no-op.
    #[must_use]
    pub fn tell(&self) -> VirtualOffset {
        self.position
    }

    /// Random-access seek. Stops the prefetch worker and discards its queue
    /// before moving the device.
    pub fn seek(&mut self, offset: VirtualOffset) -> Result<()> {
        let mut stream = self.stop_prefetch()?;
        match stream.seek(offset) {
            Ok(()) => {
                self.position = offset;
                self.region_done = false;
                self.engine = Some(Engine::Direct(stream));
                if self.prefetch {
                    self.start_prefetch()?;
                }
                Ok(())
            }
            Err(e) => {
                self.record_error("seek", &e);
                self.engine = Some(Engine::Direct(stream));
                Err(e)
            }
        }
    }

    /// Seek back to the first record and clear any region.
    pub fn rewind(&mut self) -> Result<()> {
        self.region = None;
        self.region_done = false;
        self.seek(self.alignments_begin)
    }

    /// Restrict the stream to records overlapping `region`.
    ///
    /// Without an index the restriction is applied by scanning: records
    /// before the region are skipped and the stream ends at the first record
    /// past it.
    pub fn set_region(&mut self, region: Region) -> Result<()> {
        if let Err(e) = region.validate(self.header.refs()) {
            self.record_error("set_region", &e);
            return Err(e);
        }
        self.region = Some(region);
        self.region_done = false;
        Ok(())
    }

    /// Remove any active region.
    pub fn clear_region(&mut self) {
        self.region = None;
        self.region_done = false;
    }

    /// Whether an index is attached. Index support is delegated to an
    /// external controller; this build always answers `false`.
    #[must_use]
    pub fn has_index(&self) -> bool {
        false
    }

    /// Attach an index file. Not available in this build; sequential region
    /// scans are unaffected.
    pub fn open_index<P: AsRef<Path>>(&mut self, _path: P) -> Result<()> {
        let e = BamlineError::index("no index controller available");
        self.record_error("open_index", &e);
        Err(e)
    }

    /// Locate an index next to the input. Not available in this build.
    pub fn locate_index(&mut self) -> Result<()> {
        let e = BamlineError::index("no index controller available");
        self.record_error("locate_index", &e);
        Err(e)
    }

    /// Create an index for the input. Not available in this build.
    pub fn create_index(&mut self) -> Result<()> {
        let e = BamlineError::index("no index controller available");
        self.record_error("create_index", &e);
        Err(e)
    }

    /// Stop the prefetch worker and release the device.
    pub fn close(mut self) -> Result<()> {
        self.stop_prefetch()?;
        self.engine = None;
        Ok(())
    }

    /// The last error recorded on this reader, as `"BamReader::<op>: <detail>"`.
    #[must_use]
    pub fn error_string(&self) -> String {
        self.last_error.lock().clone().unwrap_or_default()
    }

    fn record_error(&self, op: &str, error: &BamlineError) {
        *self.last_error.lock() = Some(format!("BamReader::{op}: {error}"));
    }

    /// Stop the worker (if running) and reclaim the decode stream. Pending
    /// prefetched records are discarded; the caller is expected to seek.
    fn stop_prefetch(&mut self) -> Result<RecordStream> {
        match self.engine.take() {
            Some(Engine::Direct(stream)) => Ok(stream),
            Some(Engine::Prefetching(p)) => {
                p.stop.store(true, Ordering::Release);
                drop(p.rx);
                p.handle
                    .join()
                    .map_err(|_| BamlineError::internal("prefetch worker panicked"))
            }
            None => Err(BamlineError::internal("reader used after close")),
        }
    }

    fn start_prefetch(&mut self) -> Result<()> {
        let stream = match self.engine.take() {
            Some(Engine::Direct(stream)) => stream,
            other => {
                self.engine = other;
                return Err(BamlineError::internal("prefetch worker already running"));
            }
        };

        let (tx, rx) = unbounded();
        let stop = Arc::new(AtomicBool::new(false));
        let worker_stop = Arc::clone(&stop);
        let probe = Arc::clone(&self.probe);
        let handle = thread::Builder::new()
            .name("bamline-prefetch".into())
            .spawn(move || prefetch_loop(stream, &tx, &worker_stop, probe.as_ref()))
            .map_err(|e| BamlineError::io("BamReader::open", e))?;

        self.engine = Some(Engine::Prefetching(Prefetcher { rx, stop, handle }));
        Ok(())
    }
}

impl Drop for BamReader {
    fn drop(&mut self) {
        // Stop the worker so the thread does not outlive the reader. The
        // receiver is dropped first to unblock any pending send.
        if let Some(Engine::Prefetching(p)) = self.engine.take() {
            p.stop.store(true, Ordering::Release);
            drop(p.rx);
            let _ = p.handle.join();
        }
    }
}

/// Iterator adapter over [`BamReader::next_record`].
pub struct Records<'a> {
    reader: &'a mut BamReader,
}

impl Iterator for Records<'_> {
    type Item = Result<Record>;

    fn next(&mut self) -> Option<Self::Item> {
        self.reader.next_record().transpose()
    }
}
