//! Index-based external heap sorter.
//!
//! The sorter scans the source once to build an index holding the address of every record, heap-sorts the
//! index (records are fetched from the read-only source on every comparison, only index entries move) and
//! finally rewrites the source in index order through a temporary file that atomically replaces it.
//!
//! A sift-down fetches the sinking record once and then each child it is compared with, so
//! [`Statistics::record_reads`] counts fetches, not comparisons.
//!
//! Limitations: a record must fit into the I/O buffer and its length into 16 bits.

use std::ffi::OsString;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Instant;

use crate::channel::{LineChannel, RecordSource, DEFAULT_BUF_SIZE, MIN_BUF_SIZE};
use crate::error::SortError;
use crate::index::{AddressIndex, DiskIndex, RamIndex, DEFAULT_CHUNK_SIZE};
use crate::progress::{CancellationToken, EventSink, Outcome, ProgressHandle, Reporter};
use crate::record::{Address, Record};
use crate::stats::Statistics;

/// Heap sorter builder. Provides methods for [`HeapSorter`] initialization.
pub struct HeapSorterBuilder {
    /// I/O buffer size.
    buf_size: usize,
    /// Keep the index in memory instead of in a file.
    ram_index: bool,
    /// Index file path, `<source>.idx` if not set.
    index_path: Option<PathBuf>,
    /// Number of entries per in-memory index chunk.
    chunk_size: usize,
    event_sink: Option<EventSink>,
}

impl HeapSorterBuilder {
    /// Creates an instance of a builder with default parameters.
    pub fn new() -> Self {
        HeapSorterBuilder::default()
    }

    /// Builds a [`HeapSorter`] instance using provided configuration.
    pub fn build(self) -> Result<HeapSorter, SortError> {
        if self.buf_size < MIN_BUF_SIZE {
            return Err(SortError::Config(format!(
                "buffer size {} is below minimum {}",
                self.buf_size, MIN_BUF_SIZE
            )));
        }
        if self.chunk_size == 0 {
            return Err(SortError::Config("index chunk size must be positive".to_owned()));
        }

        return Ok(HeapSorter {
            buf_size: self.buf_size,
            ram_index: self.ram_index,
            index_path: self.index_path,
            chunk_size: self.chunk_size,
            reporter: Reporter::new(self.event_sink),
        });
    }

    /// Sets I/O buffer size.
    pub fn with_buf_size(mut self, buf_size: usize) -> HeapSorterBuilder {
        self.buf_size = buf_size;
        return self;
    }

    /// Keeps the index in memory (`true`) or in a file (`false`).
    pub fn with_ram_index(mut self, ram_index: bool) -> HeapSorterBuilder {
        self.ram_index = ram_index;
        return self;
    }

    /// Sets the index file path.
    pub fn with_index_path(mut self, path: &Path) -> HeapSorterBuilder {
        self.index_path = Some(path.into());
        return self;
    }

    /// Sets the number of entries per in-memory index chunk.
    pub fn with_chunk_size(mut self, chunk_size: usize) -> HeapSorterBuilder {
        self.chunk_size = chunk_size;
        return self;
    }

    /// Sets a callback receiving status messages.
    pub fn with_event_sink(mut self, sink: impl Fn(&str) + Send + Sync + 'static) -> HeapSorterBuilder {
        self.event_sink = Some(Box::new(sink));
        return self;
    }
}

impl Default for HeapSorterBuilder {
    fn default() -> Self {
        HeapSorterBuilder {
            buf_size: DEFAULT_BUF_SIZE,
            ram_index: false,
            index_path: None,
            chunk_size: DEFAULT_CHUNK_SIZE,
            event_sink: None,
        }
    }
}

/// Index-based external heap sorter.
pub struct HeapSorter {
    buf_size: usize,
    ram_index: bool,
    index_path: Option<PathBuf>,
    chunk_size: usize,
    reporter: Reporter,
}

impl HeapSorter {
    /// Returns a handle to the progress of the running sort.
    pub fn progress(&self) -> ProgressHandle {
        self.reporter.handle()
    }

    /// Sorts a file in place.
    ///
    /// The source is left untouched unless [`Outcome::Sorted`] is returned.
    ///
    /// # Arguments
    /// * `path` - File to be sorted
    /// * `cancel` - Cancellation flag polled once per record or heap step
    pub fn sort(&self, path: &Path, cancel: &CancellationToken) -> Result<Outcome, SortError> {
        self.reporter.reset();
        self.reporter.event("Heap sort started");

        let started = Instant::now();
        let mut stats = Statistics::default();

        let result = if cancel.is_cancelled() {
            Ok(false)
        } else if self.ram_index {
            self.sort_with(path, |_| Ok(RamIndex::new(self.chunk_size)), cancel, &mut stats)
        } else {
            let index_path = self.index_path.clone().unwrap_or_else(|| default_index_path(path));
            check_index_path(&index_path, path).and_then(|_| {
                self.sort_with(
                    path,
                    |source_len| DiskIndex::create(&index_path, DiskIndex::increment_for(source_len)),
                    cancel,
                    &mut stats,
                )
            })
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
                self.reporter.event(&format!("Heap sort failed: {}", err));
                Err(err)
            }
        }
    }

    /// Runs all the phases with the given index storage. Returns `false` if cancelled.
    fn sort_with<I, F>(
        &self,
        path: &Path,
        create_index: F,
        cancel: &CancellationToken,
        stats: &mut Statistics,
    ) -> Result<bool, SortError>
    where
        I: AddressIndex,
        F: FnOnce(u64) -> Result<I, SortError>,
    {
        let source_len = fs::metadata(path)?.len();
        let mut index = create_index(source_len)?;

        if !self.build_index(path, source_len, &mut index, cancel, stats)? {
            return Ok(false);
        }

        let source = RecordSource::open(path)?;
        let mut heap = IndexHeap {
            index: &mut index,
            source: &source,
            stats: &mut *stats,
        };
        if !heap.sort(&self.reporter, cancel)? {
            return Ok(false);
        }

        self.write_output(path, source, &index, cancel, stats)
    }

    fn build_index<I: AddressIndex>(
        &self,
        path: &Path,
        source_len: u64,
        index: &mut I,
        cancel: &CancellationToken,
        stats: &mut Statistics,
    ) -> Result<bool, SortError> {
        self.reporter.event("Creating index...");
        self.reporter.reset();

        let mut source = LineChannel::open(path, self.buf_size)?;
        while !source.end_reached() {
            if cancel.is_cancelled() {
                return Ok(false);
            }

            let address = source.read_address()?;
            index.push(address)?;
            stats.index_writes += 1;
            self.reporter.update(source.consumed(), source_len);
        }
        stats.add_channel(source.finish()?);

        log::debug!("index created ({} entries)", index.len());

        return Ok(true);
    }

    fn write_output<I: AddressIndex>(
        &self,
        path: &Path,
        source: RecordSource,
        index: &I,
        cancel: &CancellationToken,
        stats: &mut Statistics,
    ) -> Result<bool, SortError> {
        self.reporter.event("Writing to output...");
        self.reporter.reset();

        let output = tempfile::Builder::new()
            .prefix(".line-sort-")
            .suffix(".tmp")
            .tempfile_in(parent_dir(path))
            .map_err(SortError::TempDir)?;
        log::debug!("writing sorted records to {}", output.path().display());

        let mut writer = LineChannel::writer(output.as_file().try_clone()?, self.buf_size, source.len())?;
        let count = index.len();
        for i in 0..count {
            if cancel.is_cancelled() {
                return Ok(false);
            }

            let record = source.fetch(index.get(i))?;
            stats.index_reads += 1;
            stats.record_reads += 1;

            writer.write_record(&record)?;
            stats.record_writes += 1;
            self.reporter.update(i + 1, count);
        }
        stats.add_channel(writer.finish()?);

        drop(source);
        replace_source(output, path)?;

        return Ok(true);
    }
}

/// Max-heap over index positions, ordered by the records the entries point at.
struct IndexHeap<'a, I: AddressIndex> {
    index: &'a mut I,
    source: &'a RecordSource,
    stats: &'a mut Statistics,
}

impl<'a, I: AddressIndex> IndexHeap<'a, I> {
    /// Sorts the index in ascending record order. Returns `false` if cancelled.
    fn sort(&mut self, reporter: &Reporter, cancel: &CancellationToken) -> Result<bool, SortError> {
        let count = self.index.len();

        reporter.event("Preparing sort...");
        reporter.reset();

        let parents = count / 2;
        for (done, node) in (0..parents).rev().enumerate() {
            if cancel.is_cancelled() {
                return Ok(false);
            }
            self.sift_down(count, node)?;
            reporter.update(done as u64 + 1, parents);
        }

        reporter.event("Sorting index...");
        reporter.reset();

        for end in (1..count).rev() {
            if cancel.is_cancelled() {
                return Ok(false);
            }
            self.swap(0, end);
            self.sift_down(end, 0)?;
            reporter.update(count - end, count);
        }

        return Ok(true);
    }

    /// Moves the entry at `node` down until it is not smaller than any of its children within `size`.
    fn sift_down(&mut self, size: u64, mut node: u64) -> Result<(), SortError> {
        let sinking = self.record_at(node)?;

        loop {
            let left = 2 * node + 1;
            let right = left + 1;

            let mut largest = node;
            let mut largest_record: Option<Record> = None;

            if left < size {
                let record = self.record_at(left)?;
                if record > sinking {
                    largest = left;
                    largest_record = Some(record);
                }
            }
            if right < size {
                let record = self.record_at(right)?;
                if record > *largest_record.as_ref().unwrap_or(&sinking) {
                    largest = right;
                }
            }

            if largest == node {
                return Ok(());
            }
            self.swap(node, largest);
            node = largest;
        }
    }

    fn address(&mut self, i: u64) -> Address {
        self.stats.index_reads += 1;
        self.index.get(i)
    }

    fn record_at(&mut self, i: u64) -> Result<Record, SortError> {
        let address = self.address(i);
        self.stats.record_reads += 1;
        self.source.fetch(address)
    }

    fn swap(&mut self, a: u64, b: u64) {
        self.index.swap(a, b);
        self.stats.index_reads += 2;
        self.stats.index_writes += 2;
    }
}

/// Moves a fully written output over the source, keeping the source permissions.
pub(crate) fn replace_source(output: tempfile::NamedTempFile, path: &Path) -> Result<(), SortError> {
    output.as_file().set_permissions(fs::metadata(path)?.permissions())?;
    output.persist(path).map_err(|err| SortError::IO(err.error))?;

    return Ok(());
}

pub(crate) fn parent_dir(path: &Path) -> &Path {
    match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    }
}

/// Rejects an index path pointing at the source, the index file is truncated and removed.
fn check_index_path(index_path: &Path, source: &Path) -> Result<(), SortError> {
    let same = match (fs::canonicalize(index_path), fs::canonicalize(source)) {
        (Ok(index_path), Ok(source)) => index_path == source,
        _ => index_path == source,
    };
    if same {
        return Err(SortError::Config(format!(
            "index file {} is the file being sorted",
            index_path.display()
        )));
    }

    return Ok(());
}

fn default_index_path(source: &Path) -> PathBuf {
    let mut name = OsString::from(source.as_os_str());
    name.push(".idx");
    PathBuf::from(name)
}

#[cfg(test)]
mod test {
    use std::fs;
    use std::path::Path;
    use std::sync::{Arc, Mutex};

    use rstest::*;

    use super::{default_index_path, HeapSorter, HeapSorterBuilder};
    use crate::error::SortError;
    use crate::progress::{CancellationToken, Outcome};
    use crate::testing::{dir_entries, expected_sort, random_records, write_records};

    #[fixture]
    fn tmp_dir() -> tempfile::TempDir {
        tempfile::tempdir().unwrap()
    }

    fn sorter(ram_index: bool, buf_size: usize) -> HeapSorter {
        HeapSorterBuilder::new()
            .with_ram_index(ram_index)
            .with_chunk_size(7)
            .with_buf_size(buf_size)
            .build()
            .unwrap()
    }

    #[rstest]
    #[case(false, 16)]
    #[case(true, 16)]
    #[case(false, 4096)]
    #[case(true, 4096)]
    fn test_heap_sorter_example(tmp_dir: tempfile::TempDir, #[case] ram_index: bool, #[case] buf_size: usize) {
        let path = tmp_dir.path().join("data.txt");
        fs::write(&path, "22222222.foo\r\n11111111.foo\r\n33333333.bar").unwrap();

        let sorter = sorter(ram_index, buf_size);
        let outcome = sorter.sort(&path, &CancellationToken::new()).unwrap();

        assert!(matches!(outcome, Outcome::Sorted(_)));
        assert_eq!(
            fs::read_to_string(&path).unwrap(),
            "33333333.bar\r\n11111111.foo\r\n22222222.foo"
        );
        assert_eq!(sorter.progress().get(), 100);
        assert_eq!(dir_entries(tmp_dir.path()), vec!["data.txt"]);
    }

    #[rstest]
    #[case(false, 0)]
    #[case(true, 1)]
    #[case(false, 2)]
    #[case(true, 500)]
    #[case(false, 3000)]
    fn test_heap_sorter_random(tmp_dir: tempfile::TempDir, #[case] ram_index: bool, #[case] count: usize) {
        let path = tmp_dir.path().join("data.txt");
        let records = random_records(count);
        write_records(&path, &records);

        let outcome = sorter(ram_index, 256).sort(&path, &CancellationToken::new()).unwrap();

        let stats = match outcome {
            Outcome::Sorted(stats) => stats,
            Outcome::Cancelled => panic!("sort cancelled"),
        };
        assert_eq!(stats.record_writes, count as u64);
        assert_eq!(fs::read_to_string(&path).unwrap(), expected_sort(&records));
    }

    #[rstest]
    fn test_heap_sorter_idempotent(tmp_dir: tempfile::TempDir) {
        let path = tmp_dir.path().join("data.txt");
        write_records(&path, &random_records(200));

        let sorter = sorter(false, 128);
        sorter.sort(&path, &CancellationToken::new()).unwrap();
        let sorted = fs::read(&path).unwrap();

        sorter.sort(&path, &CancellationToken::new()).unwrap();
        assert_eq!(fs::read(&path).unwrap(), sorted);
    }

    #[rstest]
    #[case(false, "Creating index...")]
    #[case(true, "Preparing sort...")]
    #[case(false, "Sorting index...")]
    #[case(true, "Writing to output...")]
    fn test_heap_sorter_cancellation(
        tmp_dir: tempfile::TempDir,
        #[case] ram_index: bool,
        #[case] cancel_on: &'static str,
    ) {
        let path = tmp_dir.path().join("data.txt");
        write_records(&path, &random_records(100));
        let original = fs::read(&path).unwrap();

        let cancel = CancellationToken::new();
        let events = Arc::new(Mutex::new(Vec::new()));
        let (sink_cancel, sink_events) = (cancel.clone(), events.clone());
        let sorter = HeapSorterBuilder::new()
            .with_ram_index(ram_index)
            .with_buf_size(64)
            .with_event_sink(move |msg| {
                sink_events.lock().unwrap().push(msg.to_owned());
                if msg == cancel_on {
                    sink_cancel.cancel();
                }
            })
            .build()
            .unwrap();

        let outcome = sorter.sort(&path, &cancel).unwrap();

        assert_eq!(outcome, Outcome::Cancelled);
        assert_eq!(sorter.progress().get(), 0);
        assert_eq!(events.lock().unwrap().last().unwrap(), "Cancelled");
        assert_eq!(fs::read(&path).unwrap(), original);
        assert_eq!(dir_entries(tmp_dir.path()), vec!["data.txt"]);
    }

    #[rstest]
    fn test_heap_sorter_cancelled_upfront(tmp_dir: tempfile::TempDir) {
        let path = tmp_dir.path().join("data.txt");
        fs::write(&path, "").unwrap();

        let cancel = CancellationToken::new();
        cancel.cancel();

        assert_eq!(sorter(true, 64).sort(&path, &cancel).unwrap(), Outcome::Cancelled);
    }

    #[rstest]
    fn test_heap_sorter_custom_index_path(tmp_dir: tempfile::TempDir) {
        let path = tmp_dir.path().join("data.txt");
        let index_path = tmp_dir.path().join("custom.bin");
        write_records(&path, &random_records(50));

        let sorter = HeapSorterBuilder::new()
            .with_index_path(&index_path)
            .with_buf_size(64)
            .build()
            .unwrap();
        sorter.sort(&path, &CancellationToken::new()).unwrap();

        assert!(!index_path.exists());
        assert_eq!(dir_entries(tmp_dir.path()), vec!["data.txt"]);
    }

    #[rstest]
    fn test_heap_sorter_failures(tmp_dir: tempfile::TempDir) {
        let err = HeapSorterBuilder::new().with_buf_size(0).build().err().unwrap();
        assert!(matches!(err, SortError::Config(_)));

        let err = HeapSorterBuilder::new().with_chunk_size(0).build().err().unwrap();
        assert!(matches!(err, SortError::Config(_)));

        let missing = tmp_dir.path().join("missing.txt");
        let err = sorter(true, 64).sort(&missing, &CancellationToken::new()).unwrap_err();
        assert!(matches!(err, SortError::IO(_)));

        let path = tmp_dir.path().join("data.txt");
        fs::write(&path, "1.b\r\nbroken\r\n2.a").unwrap();
        let err = sorter(false, 64).sort(&path, &CancellationToken::new()).unwrap_err();
        assert!(matches!(err, SortError::Parse { offset: 5, .. }));
        assert_eq!(fs::read_to_string(&path).unwrap(), "1.b\r\nbroken\r\n2.a");
        assert_eq!(dir_entries(tmp_dir.path()), vec!["data.txt"]);
    }

    #[rstest]
    fn test_heap_sorter_record_length_limit(tmp_dir: tempfile::TempDir) {
        let path = tmp_dir.path().join("data.txt");
        let content = format!("1.{}\r\n2.b", "a".repeat(70_000));
        fs::write(&path, &content).unwrap();

        let sorter = HeapSorterBuilder::new().with_buf_size(1024 * 1024).build().unwrap();
        let err = sorter.sort(&path, &CancellationToken::new()).unwrap_err();

        assert!(matches!(
            err,
            SortError::RecordTooLong {
                offset: 0,
                length: 70_002,
                limit: 65535
            }
        ));
        assert_eq!(fs::read_to_string(&path).unwrap(), content);
        assert_eq!(dir_entries(tmp_dir.path()), vec!["data.txt"]);
    }

    #[rstest]
    fn test_heap_sorter_index_path_is_source(tmp_dir: tempfile::TempDir) {
        let path = tmp_dir.path().join("data.txt");
        fs::write(&path, "2.b\r\n1.a").unwrap();

        let sorter = HeapSorterBuilder::new()
            .with_index_path(&tmp_dir.path().join(".").join("data.txt"))
            .build()
            .unwrap();
        let err = sorter.sort(&path, &CancellationToken::new()).unwrap_err();

        assert!(matches!(err, SortError::Config(_)));
        assert_eq!(fs::read_to_string(&path).unwrap(), "2.b\r\n1.a");
        assert_eq!(dir_entries(tmp_dir.path()), vec!["data.txt"]);
    }

    #[cfg(unix)]
    #[rstest]
    #[case(false)]
    #[case(true)]
    fn test_heap_sorter_keeps_permissions(tmp_dir: tempfile::TempDir, #[case] ram_index: bool) {
        use std::os::unix::fs::PermissionsExt;

        let path = tmp_dir.path().join("data.txt");
        write_records(&path, &random_records(50));
        fs::set_permissions(&path, fs::Permissions::from_mode(0o644)).unwrap();

        sorter(ram_index, 64).sort(&path, &CancellationToken::new()).unwrap();

        assert_eq!(fs::metadata(&path).unwrap().permissions().mode() & 0o777, 0o644);
    }

    #[test]
    fn test_default_index_path() {
        assert_eq!(default_index_path(Path::new("dir/data.txt")), Path::new("dir/data.txt.idx"));
    }
}
