//! Sorting error.

use std::error::Error;
use std::fmt;
use std::fmt::Display;
use std::io;

use crate::channel::Mode;
use crate::record::ParseError;

/// Error terminating a sort or validation call.
#[derive(Debug)]
pub enum SortError {
    /// Invalid or out-of-range tunable, rejected before any I/O.
    Config(String),
    /// Temporary directory or file creation error.
    TempDir(io::Error),
    /// Workers thread pool initialization error.
    ThreadPoolBuildError(rayon::ThreadPoolBuildError),
    /// Common I/O error.
    IO(io::Error),
    /// Record could not be decoded.
    Parse { offset: u64, source: ParseError },
    /// Record does not fit into the I/O buffer or into an address.
    RecordTooLong { offset: u64, length: usize, limit: usize },
    /// Record offset does not fit into an address.
    AddressOverflow(u64),
    /// Channel operation does not match the channel mode.
    WrongMode(Mode),
    /// Read attempted after the end of data has been reached.
    EndOfData,
    /// A worker panicked while holding the shared reader.
    Poisoned,
}

impl Error for SortError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match &self {
            SortError::TempDir(err) => Some(err),
            SortError::ThreadPoolBuildError(err) => Some(err),
            SortError::IO(err) => Some(err),
            SortError::Parse { source, .. } => Some(source),
            _ => None,
        }
    }
}

impl Display for SortError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self {
            SortError::Config(msg) => write!(f, "invalid configuration: {}", msg),
            SortError::TempDir(err) => write!(f, "temporary directory or file not created: {}", err),
            SortError::ThreadPoolBuildError(err) => write!(f, "thread pool initialization failed: {}", err),
            SortError::IO(err) => write!(f, "I/O operation failed: {}", err),
            SortError::Parse { offset, source } => write!(f, "malformed record at offset {}: {}", offset, source),
            SortError::RecordTooLong { offset, length, limit } => write!(
                f,
                "record at offset {} is {} bytes long, limit is {}",
                offset, length, limit
            ),
            SortError::AddressOverflow(offset) => write!(f, "record offset {} exceeds address range", offset),
            SortError::WrongMode(mode) => write!(f, "operation not supported in {:?} mode", mode),
            SortError::EndOfData => write!(f, "end of data already reached"),
            SortError::Poisoned => write!(f, "shared reader poisoned by a failed worker"),
        }
    }
}

impl From<io::Error> for SortError {
    fn from(err: io::Error) -> Self {
        SortError::IO(err)
    }
}
