//! `line-sort` sorts files of `<key>.<payload>` records that do not fit into memory.
//!
//! A record is one line made of an unsigned decimal key, a `.` and a text payload. Records are ordered by
//! payload first and by key on ties. Files are ASCII text with records separated by `\r\n`.
//!
//! # Overview
//!
//! `line-sort` provides two independent external sorting strategies and a validator:
//!
//! * **Index-based heap sort** ([`HeapSorter`]):
//!   builds an index holding the address of every record (in memory or in a file), heap-sorts the index by
//!   dereferencing every entry from the read-only source and rewrites the file in index order. Only index
//!   entries are moved, so both the source and the index may be larger than memory.
//! * **Run-based merge sort** ([`MergeSorter`]):
//!   splits the file into runs of a bounded size that are sorted in memory and saved by a pool of workers,
//!   then k-way merges the runs.
//! * **Validation** ([`Validator`]):
//!   checks that every record is well formed and not smaller than its predecessor.
//!
//! Both sorters replace the source atomically, so a failed or cancelled sort leaves it untouched.
//! Operations run synchronously on the calling thread, report their progress through a [`ProgressHandle`]
//! and their status through an event callback, and can be cancelled with a [`CancellationToken`].
//!
//! # Example
//!
//! ```no_run
//! use std::path::Path;
//!
//! use line_sort::{CancellationToken, MergeSorterBuilder, Outcome, Validation, ValidatorBuilder};
//!
//! fn main() {
//!     let sorter = MergeSorterBuilder::new()
//!         .with_run_dir(Path::new("./runs"))
//!         .with_run_size(64 * 1024 * 1024)
//!         .with_max_workers(4)
//!         .build()
//!         .unwrap();
//!
//!     let cancel = CancellationToken::new();
//!     if let Outcome::Sorted(stats) = sorter.sort(Path::new("input.txt"), &cancel).unwrap() {
//!         println!("{}", stats);
//!     }
//!
//!     let validator = ValidatorBuilder::new().build().unwrap();
//!     assert_eq!(validator.validate(Path::new("input.txt"), &cancel).unwrap(), Validation::Valid);
//! }
//! ```

pub mod channel;
pub mod error;
pub mod heap;
pub mod index;
pub mod merge;
pub mod progress;
pub mod record;
pub mod stats;
pub mod validator;

#[cfg(test)]
mod testing;

pub use channel::{ChannelStats, LineChannel, Mode, RecordSource};
pub use error::SortError;
pub use heap::{HeapSorter, HeapSorterBuilder};
pub use index::{AddressIndex, DiskIndex, RamIndex};
pub use merge::{MergeSorter, MergeSorterBuilder, RunMerger};
pub use progress::{CancellationToken, EventSink, Outcome, ProgressHandle};
pub use record::{Address, ParseError, Record};
pub use stats::Statistics;
pub use validator::{Reason, Validation, Validator, ValidatorBuilder, Violation};
