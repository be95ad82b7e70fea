//! Progress reporting, event stream and cancellation.

use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;

use crate::stats::Statistics;

/// Event sink receiving human-readable phase, status and summary messages.
pub type EventSink = Box<dyn Fn(&str) + Send + Sync>;

/// Cooperative cancellation flag shared between a driver and a running operation.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken(Arc<AtomicBool>);

impl CancellationToken {
    pub fn new() -> Self {
        CancellationToken::default()
    }

    /// Requests cancellation. The running operation stops at its next poll.
    pub fn cancel(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

/// Read-only view of an operation progress (0-100), usable from any thread.
#[derive(Debug, Clone, Default)]
pub struct ProgressHandle(Arc<AtomicU8>);

impl ProgressHandle {
    pub fn get(&self) -> u8 {
        self.0.load(Ordering::Relaxed)
    }
}

/// Terminal result of a sort that did not fail.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// The file has been sorted in place.
    Sorted(Statistics),
    /// The operation was cancelled, the source file is untouched.
    Cancelled,
}

/// Progress and event publisher owned by a sorter or a validator.
pub(crate) struct Reporter {
    progress: ProgressHandle,
    sink: Option<EventSink>,
}

impl Reporter {
    pub fn new(sink: Option<EventSink>) -> Self {
        Reporter {
            progress: ProgressHandle::default(),
            sink,
        }
    }

    pub fn handle(&self) -> ProgressHandle {
        self.progress.clone()
    }

    pub fn event(&self, message: &str) {
        log::info!("{}", message);
        if let Some(sink) = &self.sink {
            sink(message);
        }
    }

    /// Sets phase progress. Stays below 100 until [`Reporter::complete`] is called.
    pub fn update(&self, done: u64, total: u64) {
        let percent = if total == 0 {
            0
        } else {
            (done as u128 * 100 / total as u128).min(99) as u8
        };
        self.progress.0.store(percent, Ordering::Relaxed);
    }

    pub fn reset(&self) {
        self.progress.0.store(0, Ordering::Relaxed);
    }

    pub fn complete(&self) {
        self.progress.0.store(100, Ordering::Relaxed);
    }

    pub fn cancelled(&self) {
        self.reset();
        self.event("Cancelled");
    }
}
