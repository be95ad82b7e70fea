//! Sorted file validator.

use std::fmt;
use std::fmt::Display;
use std::path::Path;
use std::time::Instant;

use crate::channel::{LineChannel, DEFAULT_BUF_SIZE, MIN_BUF_SIZE};
use crate::error::SortError;
use crate::progress::{CancellationToken, EventSink, ProgressHandle, Reporter};
use crate::record::{ParseError, Record};
use crate::stats::Elapsed;

/// Reason a record failed validation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reason {
    /// The record could not be decoded.
    Malformed(ParseError),
    /// The payload is empty, blank or contains a forbidden byte.
    InvalidPayload,
    /// The record is smaller than the one preceding it.
    OutOfOrder,
}

/// First offending record found by the validator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Violation {
    /// 1-based record number.
    pub record: u64,
    /// Byte offset of the record.
    pub offset: u64,
    pub reason: Reason,
}

impl Display for Violation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.reason {
            Reason::Malformed(err) => write!(f, "malformed record {} at offset {}: {}", self.record, self.offset, err),
            Reason::InvalidPayload => write!(f, "invalid record {} at offset {}", self.record, self.offset),
            Reason::OutOfOrder => write!(
                f,
                "records are not in order at record {} (offset {})",
                self.record, self.offset
            ),
        }
    }
}

/// Validation result.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Validation {
    /// Every record is valid and not smaller than its predecessor.
    Valid,
    /// The scan stopped at the first violation.
    Invalid(Violation),
    Cancelled,
}

/// Validator builder. Provides methods for [`Validator`] initialization.
pub struct ValidatorBuilder {
    buf_size: usize,
    event_sink: Option<EventSink>,
}

impl ValidatorBuilder {
    pub fn new() -> Self {
        ValidatorBuilder::default()
    }

    pub fn build(self) -> Result<Validator, SortError> {
        if self.buf_size < MIN_BUF_SIZE {
            return Err(SortError::Config(format!(
                "buffer size {} is below minimum {}",
                self.buf_size, MIN_BUF_SIZE
            )));
        }

        return Ok(Validator {
            buf_size: self.buf_size,
            reporter: Reporter::new(self.event_sink),
        });
    }

    /// Sets I/O buffer size.
    pub fn with_buf_size(mut self, buf_size: usize) -> ValidatorBuilder {
        self.buf_size = buf_size;
        return self;
    }

    /// Sets a callback receiving status messages.
    pub fn with_event_sink(mut self, sink: impl Fn(&str) + Send + Sync + 'static) -> ValidatorBuilder {
        self.event_sink = Some(Box::new(sink));
        return self;
    }
}

impl Default for ValidatorBuilder {
    fn default() -> Self {
        ValidatorBuilder {
            buf_size: DEFAULT_BUF_SIZE,
            event_sink: None,
        }
    }
}

/// Checks that a file is sorted and made of valid records.
pub struct Validator {
    buf_size: usize,
    reporter: Reporter,
}

impl Validator {
    pub fn progress(&self) -> ProgressHandle {
        self.reporter.handle()
    }

    /// Scans the file, stopping at the first malformed, invalid or out-of-order record.
    ///
    /// # Arguments
    /// * `path` - File to be validated
    /// * `cancel` - Cancellation flag polled once per record
    pub fn validate(&self, path: &Path, cancel: &CancellationToken) -> Result<Validation, SortError> {
        self.reporter.reset();
        self.reporter.event("Validation started");
        let started = Instant::now();

        let result = self.scan(path, cancel);
        match &result {
            Ok(Validation::Valid) => {
                self.reporter.complete();
                self.reporter
                    .event(&format!("Validation succeeded in {}", Elapsed(started.elapsed())));
            }
            Ok(Validation::Invalid(violation)) => {
                self.reporter.event(&format!(
                    "Validation failed: {} in {}",
                    violation,
                    Elapsed(started.elapsed())
                ));
            }
            Ok(Validation::Cancelled) => self.reporter.cancelled(),
            Err(err) => {
                self.reporter.reset();
                self.reporter.event(&format!("Validation failed: {}", err));
            }
        }

        return result;
    }

    fn scan(&self, path: &Path, cancel: &CancellationToken) -> Result<Validation, SortError> {
        let mut source = LineChannel::open(path, self.buf_size)?;
        let total = source.len();

        let mut previous: Option<Record> = None;
        let mut number = 0;

        while !source.end_reached() {
            if cancel.is_cancelled() {
                return Ok(Validation::Cancelled);
            }

            number += 1;
            let offset = source.consumed();
            let violation = |reason| {
                Ok(Validation::Invalid(Violation {
                    record: number,
                    offset,
                    reason,
                }))
            };

            let record = match source.read_record() {
                Ok(record) => record,
                Err(SortError::Parse { source, .. }) => return violation(Reason::Malformed(source)),
                Err(err) => return Err(err),
            };
            if !record.is_valid() {
                return violation(Reason::InvalidPayload);
            }
            if previous.as_ref().map_or(false, |previous| *previous > record) {
                return violation(Reason::OutOfOrder);
            }

            previous = Some(record);
            self.reporter.update(source.consumed(), total);
        }

        return Ok(Validation::Valid);
    }
}

#[cfg(test)]
mod test {
    use std::fs;

    use rstest::*;

    use super::{Reason, Validation, Validator, ValidatorBuilder, Violation};
    use crate::error::SortError;
    use crate::progress::CancellationToken;
    use crate::record::ParseError;
    use crate::testing::{expected_sort, random_records};

    #[fixture]
    fn tmp_dir() -> tempfile::TempDir {
        tempfile::tempdir().unwrap()
    }

    fn validate(dir: &tempfile::TempDir, content: &str) -> (Validation, Validator) {
        let path = dir.path().join("data.txt");
        fs::write(&path, content).unwrap();

        let validator = ValidatorBuilder::new().with_buf_size(64).build().unwrap();
        let result = validator.validate(&path, &CancellationToken::new()).unwrap();
        (result, validator)
    }

    #[rstest]
    #[case("")]
    #[case("1.a")]
    #[case("11111111.greshuiosderhghluirt\r\n22222222.greshuiosderhghluirt\r\n33333333.zzzzzzzzzzzzzzzzzzzz")]
    #[case("33333333.bar\r\n11111111.foo\r\n22222222.foo")]
    #[case("5.same\r\n5.same\r\n5.same\n")]
    fn test_valid(tmp_dir: tempfile::TempDir, #[case] content: &str) {
        let (result, validator) = validate(&tmp_dir, content);

        assert_eq!(result, Validation::Valid);
        assert_eq!(validator.progress().get(), 100);
    }

    #[rstest]
    #[case(
        "22222222.greshuiosderhghluirt\r\n11111111.greshuiosderhghluirt\r\n33333333.zzzzzzzzzzzzzzzzzzzz",
        2,
        31,
        Reason::OutOfOrder
    )]
    #[case(
        "33333333.zzzzzzzzzzzzzzzzzzzz\r\n11111111.greshuiosderhghluirt\r\n22222222.greshuiosderhghluirt",
        2,
        31,
        Reason::OutOfOrder
    )]
    #[case(
        "11111111.aaaaaaaaaaaaaaa\naaaaa\r\n22222222.aaaaaaaaaaaaaaa\0aaaaa\r\n33333333.",
        2,
        25,
        Reason::Malformed(ParseError::MissingSeparator)
    )]
    #[case("1.a\r\n2.b\0\r\n3.c", 2, 5, Reason::InvalidPayload)]
    #[case("1.a\r\n2.b\r\n3.", 3, 10, Reason::InvalidPayload)]
    #[case("1.a\r\n2.  \r\n3.c", 2, 5, Reason::InvalidPayload)]
    #[case("1.a\r\nx.b", 2, 5, Reason::Malformed(ParseError::InvalidDigit(b'x')))]
    fn test_invalid(
        tmp_dir: tempfile::TempDir,
        #[case] content: &str,
        #[case] record: u64,
        #[case] offset: u64,
        #[case] reason: Reason,
    ) {
        let (result, validator) = validate(&tmp_dir, content);

        assert_eq!(result, Validation::Invalid(Violation { record, offset, reason }));
        assert_ne!(validator.progress().get(), 100);
    }

    #[rstest]
    fn test_agrees_with_sort(tmp_dir: tempfile::TempDir) {
        let records = random_records(500);
        let (result, _) = validate(&tmp_dir, &expected_sort(&records));
        assert_eq!(result, Validation::Valid);
    }

    #[rstest]
    fn test_cancelled(tmp_dir: tempfile::TempDir) {
        let path = tmp_dir.path().join("data.txt");
        fs::write(&path, "1.a\r\n2.a").unwrap();

        let cancel = CancellationToken::new();
        cancel.cancel();
        let validator = ValidatorBuilder::new().build().unwrap();

        assert_eq!(validator.validate(&path, &cancel).unwrap(), Validation::Cancelled);
        assert_eq!(validator.progress().get(), 0);
    }

    #[rstest]
    fn test_failures(tmp_dir: tempfile::TempDir) {
        let err = ValidatorBuilder::new().with_buf_size(1).build().err().unwrap();
        assert!(matches!(err, SortError::Config(_)));

        let validator = ValidatorBuilder::new().build().unwrap();
        let err = validator
            .validate(&tmp_dir.path().join("missing.txt"), &CancellationToken::new())
            .unwrap_err();
        assert!(matches!(err, SortError::IO(_)));
    }
}
