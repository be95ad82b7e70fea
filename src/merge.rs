//! Run-based external merge sorter.
//!
//! The source is split into runs of a bounded size. Runs are drained one at a time from a single shared
//! reader, then sorted in memory and written to their own files by a bounded pool of workers. The sorted
//! runs are finally k-way merged into a temporary file that atomically replaces the source.
//!
//! Limitations: a record must fit into the I/O buffer, `run_size * max_workers` bytes of records must fit
//! into memory.

use std::mem;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Instant;

use rayon::prelude::*;

use crate::channel::{ChannelStats, LineChannel, DEFAULT_BUF_SIZE, MIN_BUF_SIZE};
use crate::error::SortError;
use crate::heap::{parent_dir, replace_source};
use crate::progress::{CancellationToken, EventSink, Outcome, ProgressHandle, Reporter};
use crate::record::Record;
use crate::stats::Statistics;

/// Default run size in bytes.
pub const DEFAULT_RUN_SIZE: u64 = 1024 * 1024 * 1024;

/// Default number of concurrent run builders.
pub const DEFAULT_MAX_WORKERS: usize = 5;

/// Merge sorter builder. Provides methods for [`MergeSorter`] initialization.
pub struct MergeSorterBuilder {
    /// I/O buffer size.
    buf_size: usize,
    /// Size of a single run in bytes.
    run_size: u64,
    /// Directory the run directory is created in.
    run_dir: Option<Box<Path>>,
    /// Max number of runs built in parallel.
    max_workers: usize,
    event_sink: Option<EventSink>,
}

impl MergeSorterBuilder {
    /// Creates an instance of a builder with default parameters.
    pub fn new() -> Self {
        MergeSorterBuilder::default()
    }

    /// Builds a [`MergeSorter`] instance using provided configuration.
    pub fn build(self) -> Result<MergeSorter, SortError> {
        if self.buf_size < MIN_BUF_SIZE {
            return Err(SortError::Config(format!(
                "buffer size {} is below minimum {}",
                self.buf_size, MIN_BUF_SIZE
            )));
        }
        if self.run_size == 0 {
            return Err(SortError::Config("run size must be positive".to_owned()));
        }
        if self.max_workers == 0 {
            return Err(SortError::Config("at least one worker is required".to_owned()));
        }

        return Ok(MergeSorter {
            thread_pool: MergeSorter::init_thread_pool(self.max_workers)?,
            buf_size: self.buf_size,
            run_size: self.run_size,
            run_dir: self.run_dir,
            reporter: Reporter::new(self.event_sink),
        });
    }

    /// Sets I/O buffer size.
    pub fn with_buf_size(mut self, buf_size: usize) -> MergeSorterBuilder {
        self.buf_size = buf_size;
        return self;
    }

    /// Sets the size of a single run in bytes.
    pub fn with_run_size(mut self, run_size: u64) -> MergeSorterBuilder {
        self.run_size = run_size;
        return self;
    }

    /// Sets directory to be used to store runs.
    pub fn with_run_dir(mut self, path: &Path) -> MergeSorterBuilder {
        self.run_dir = Some(path.into());
        return self;
    }

    /// Sets the max number of runs built in parallel.
    pub fn with_max_workers(mut self, max_workers: usize) -> MergeSorterBuilder {
        self.max_workers = max_workers;
        return self;
    }

    /// Sets a callback receiving status messages.
    pub fn with_event_sink(mut self, sink: impl Fn(&str) + Send + Sync + 'static) -> MergeSorterBuilder {
        self.event_sink = Some(Box::new(sink));
        return self;
    }
}

impl Default for MergeSorterBuilder {
    fn default() -> Self {
        MergeSorterBuilder {
            buf_size: DEFAULT_BUF_SIZE,
            run_size: DEFAULT_RUN_SIZE,
            run_dir: None,
            max_workers: DEFAULT_MAX_WORKERS,
            event_sink: None,
        }
    }
}

/// Sorted run files produced by the first phase.
struct Runs {
    /// Run files in run index order.
    files: Vec<PathBuf>,
    records: u64,
}

/// Run-based external merge sorter.
pub struct MergeSorter {
    /// Run builders thread pool.
    thread_pool: rayon::ThreadPool,
    buf_size: usize,
    run_size: u64,
    run_dir: Option<Box<Path>>,
    reporter: Reporter,
}

impl MergeSorter {
    fn init_thread_pool(max_workers: usize) -> Result<rayon::ThreadPool, SortError> {
        log::info!("initializing thread-pool (threads: {})", max_workers);

        let thread_pool = rayon::ThreadPoolBuilder::new()
            .num_threads(max_workers)
            .thread_name(|i| format!("run-builder-{}", i))
            .build()
            .map_err(|err| SortError::ThreadPoolBuildError(err))?;

        return Ok(thread_pool);
    }

    fn init_run_directory(&self) -> Result<tempfile::TempDir, SortError> {
        let run_dir = if let Some(run_dir) = &self.run_dir {
            std::fs::create_dir_all(run_dir).map_err(|err| SortError::TempDir(err))?;
            tempfile::Builder::new().prefix("runs-").tempdir_in(run_dir)
        } else {
            tempfile::Builder::new().prefix("runs-").tempdir()
        }
        .map_err(|err| SortError::TempDir(err))?;

        log::info!("using {} as a run directory", run_dir.path().display());

        return Ok(run_dir);
    }

    /// Returns a handle to the progress of the running sort.
    pub fn progress(&self) -> ProgressHandle {
        self.reporter.handle()
    }

    /// Sorts a file in place.
    ///
    /// The source is left untouched unless [`Outcome::Sorted`] is returned. Run files are removed on every
    /// exit path.
    ///
    /// # Arguments
    /// * `path` - File to be sorted
    /// * `cancel` - Cancellation flag polled once per record
    pub fn sort(&self, path: &Path, cancel: &CancellationToken) -> Result<Outcome, SortError> {
        self.reporter.reset();
        self.reporter.event("Merge sort started");

        let started = Instant::now();
        let mut stats = Statistics::default();

        let result = if cancel.is_cancelled() {
            Ok(false)
        } else {
            self.sort_runs(path, cancel, &mut stats)
        };

        match result {
            Ok(true) => {
                stats.time = started.elapsed();
                self.reporter.complete();
                self.reporter.event(&stats.to_string());
                Ok(Outcome::Sorted(stats))
            }
            Ok(false) => {
                self.reporter.cancelled();
                Ok(Outcome::Cancelled)
            }
            Err(err) => {
                self.reporter.reset();
                self.reporter.event(&format!("Merge sort failed: {}", err));
                Err(err)
            }
        }
    }

    /// Runs both phases. Returns `false` if cancelled.
    fn sort_runs(&self, path: &Path, cancel: &CancellationToken, stats: &mut Statistics) -> Result<bool, SortError> {
        let run_dir = self.init_run_directory()?;

        let completed = match self.create_runs(path, run_dir.path(), cancel, stats)? {
            Some(runs) => self.merge_runs(path, &runs, cancel, stats)?,
            None => false,
        };

        if let Err(err) = run_dir.close() {
            log::warn!("run directory not removed: {}", err);
        }

        return Ok(completed);
    }

    /// Splits the source into sorted run files. Returns [`None`] if cancelled.
    fn create_runs(
        &self,
        path: &Path,
        run_dir: &Path,
        cancel: &CancellationToken,
        stats: &mut Statistics,
    ) -> Result<Option<Runs>, SortError> {
        self.reporter.event("Creating runs...");
        self.reporter.reset();

        let source = LineChannel::open(path, self.buf_size)?;
        let total = source.len();
        let run_count = (total + self.run_size - 1) / self.run_size;
        log::debug!("splitting {} bytes into {} runs", total, run_count);

        let shared = Mutex::new(source);
        let handled = AtomicU64::new(0);
        let builder = RunBuilder {
            source: &shared,
            run_dir,
            run_size: self.run_size,
            buf_size: self.buf_size,
            handled: &handled,
            // read, sort and write stages each account for the whole input
            progress_total: total.saturating_mul(3),
            reporter: &self.reporter,
            cancel,
        };

        let built: Vec<(Option<PathBuf>, Statistics)> = self.thread_pool.install(|| {
            (0..run_count)
                .into_par_iter()
                .map(|run| builder.build(run))
                .collect::<Result<Vec<_>, SortError>>()
        })?;

        let source = shared.into_inner().map_err(|_| SortError::Poisoned)?;
        stats.add_channel(source.finish()?);

        if cancel.is_cancelled() {
            return Ok(None);
        }

        let mut runs = Runs {
            files: Vec::new(),
            records: 0,
        };
        for (file, run_stats) in built {
            runs.records += run_stats.record_writes;
            *stats += run_stats;
            runs.files.extend(file);
        }
        log::debug!("{} runs created ({} records)", runs.files.len(), runs.records);

        return Ok(Some(runs));
    }

    /// Merges the runs into the source file. Returns `false` if cancelled.
    fn merge_runs(
        &self,
        path: &Path,
        runs: &Runs,
        cancel: &CancellationToken,
        stats: &mut Statistics,
    ) -> Result<bool, SortError> {
        self.reporter.event("Merging runs...");
        self.reporter.reset();

        let mut merger = RunMerger::open(&runs.files, self.buf_size)?;

        let output = tempfile::Builder::new()
            .prefix(".line-sort-")
            .suffix(".tmp")
            .tempfile_in(parent_dir(path))
            .map_err(SortError::TempDir)?;
        let size_hint = std::fs::metadata(path)?.len();
        let mut destination = LineChannel::writer(output.as_file().try_clone()?, self.buf_size, size_hint)?;

        let mut emitted = 0;
        for record in merger.by_ref() {
            if cancel.is_cancelled() {
                return Ok(false);
            }

            destination.write_record(&record?)?;
            emitted += 1;
            self.reporter.update(emitted, runs.records);
        }
        stats.record_writes += emitted;
        stats.add_channel(destination.finish()?);

        let merged = merger.stats();
        stats.record_reads += merged.records;
        stats.add_channel(merged);

        replace_source(output, path)?;

        return Ok(true);
    }
}

/// Run creation state shared by the workers.
struct RunBuilder<'a> {
    source: &'a Mutex<LineChannel>,
    run_dir: &'a Path,
    run_size: u64,
    buf_size: usize,
    handled: &'a AtomicU64,
    progress_total: u64,
    reporter: &'a Reporter,
    cancel: &'a CancellationToken,
}

impl<'a> RunBuilder<'a> {
    /// Drains one run from the shared source, sorts it and saves it.
    /// Returns the run file, [`None`] if the run is empty or the sort was cancelled.
    fn build(&self, run: u64) -> Result<(Option<PathBuf>, Statistics), SortError> {
        let mut stats = Statistics::default();

        let (mut records, run_bytes) = {
            let mut source = self.source.lock().map_err(|_| SortError::Poisoned)?;
            let start = source.consumed();
            let mut records = Vec::new();

            while !source.end_reached() && source.consumed() - start < self.run_size {
                if self.cancel.is_cancelled() {
                    return Ok((None, stats));
                }

                let before = source.consumed();
                records.push(source.read_record()?);
                self.advance(source.consumed() - before);
            }

            (records, source.consumed() - start)
        };
        stats.record_reads += records.len() as u64;

        if records.is_empty() {
            return Ok((None, stats));
        }

        log::debug!("sorting run {} ({} records)", run, records.len());
        records.sort_unstable();
        self.advance(run_bytes);

        let path = self.save(run, &records, run_bytes, &mut stats)?;

        return Ok((path, stats));
    }

    /// Writes sorted records to the run file. Returns [`None`] if cancelled.
    fn save(
        &self,
        run: u64,
        records: &[Record],
        run_bytes: u64,
        stats: &mut Statistics,
    ) -> Result<Option<PathBuf>, SortError> {
        let path = self.run_dir.join(format!("{}.run", run));
        let mut writer = LineChannel::create(&path, self.buf_size, run_bytes)?;
        for record in records {
            if self.cancel.is_cancelled() {
                return Ok(None);
            }

            writer.write_record(record)?;
            self.advance(record.encoded_len() as u64 + 2);
        }
        stats.record_writes += records.len() as u64;
        stats.add_channel(writer.finish()?);

        log::debug!("run {} saved", run);

        return Ok(Some(path));
    }

    fn advance(&self, bytes: u64) {
        let handled = self.handled.fetch_add(bytes, Ordering::Relaxed) + bytes;
        self.reporter.update(handled, self.progress_total);
    }
}

/// An open run and its current record.
struct ActiveRun {
    channel: LineChannel,
    current: Record,
}

/// K-way merger of sorted runs.
///
/// Every step scans the current record of all active runs and yields the smallest one; on ties the run
/// opened first wins. Exhausted runs are closed and dropped from the scan.
pub struct RunMerger {
    runs: Vec<ActiveRun>,
    closed: ChannelStats,
}

impl RunMerger {
    /// Opens every run file and reads its first record.
    /// Run records should be sorted in ascending order otherwise the result is undefined.
    pub fn open(paths: &[PathBuf], buf_size: usize) -> Result<Self, SortError> {
        let mut runs = Vec::with_capacity(paths.len());
        for path in paths {
            let mut channel = LineChannel::open(path, buf_size)?;
            if channel.end_reached() {
                continue;
            }
            let current = channel.read_record()?;
            runs.push(ActiveRun { channel, current });
        }

        return Ok(RunMerger {
            runs,
            closed: ChannelStats::default(),
        });
    }

    /// Returns read counters of all the runs.
    pub fn stats(&self) -> ChannelStats {
        let mut stats = self.closed;
        for run in &self.runs {
            let run_stats = run.channel.stats();
            stats.records += run_stats.records;
            stats.bulk_reads += run_stats.bulk_reads;
        }
        stats
    }
}

impl Iterator for RunMerger {
    type Item = Result<Record, SortError>;

    /// Returns the next record from the runs in ascending order.
    fn next(&mut self) -> Option<Self::Item> {
        let mut min = 0;
        for i in 1..self.runs.len() {
            if self.runs[i].current < self.runs[min].current {
                min = i;
            }
        }

        let run = self.runs.get_mut(min)?;
        if !run.channel.end_reached() {
            return match run.channel.read_record() {
                Ok(next) => Some(Ok(mem::replace(&mut run.current, next))),
                Err(err) => Some(Err(err)),
            };
        }

        let run = self.runs.remove(min);
        let run_stats = run.channel.stats();
        self.closed.records += run_stats.records;
        self.closed.bulk_reads += run_stats.bulk_reads;

        return Some(Ok(run.current));
    }
}
