//! Operation statistics.

use std::fmt;
use std::fmt::Display;
use std::ops::AddAssign;
use std::time::Duration;

use crate::channel::ChannelStats;

/// Counters collected during one sort, reset at its start.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Statistics {
    /// Execution time.
    pub time: Duration,
    /// Single record reads.
    pub record_reads: u64,
    /// Single record writes.
    pub record_writes: u64,
    /// Index entry reads.
    pub index_reads: u64,
    /// Index entry writes.
    pub index_writes: u64,
    /// Buffer refills.
    pub bulk_reads: u64,
    /// Buffer flushes.
    pub bulk_writes: u64,
}

impl Statistics {
    pub fn reset(&mut self) {
        *self = Statistics::default();
    }

    /// Adds the bulk I/O counters of a released channel.
    pub fn add_channel(&mut self, stats: ChannelStats) {
        self.bulk_reads += stats.bulk_reads;
        self.bulk_writes += stats.bulk_writes;
    }
}

impl AddAssign for Statistics {
    fn add_assign(&mut self, other: Self) {
        self.time += other.time;
        self.record_reads += other.record_reads;
        self.record_writes += other.record_writes;
        self.index_reads += other.index_reads;
        self.index_writes += other.index_writes;
        self.bulk_reads += other.bulk_reads;
        self.bulk_writes += other.bulk_writes;
    }
}

/// Formats a duration as `hh:mm:ss`.
pub(crate) struct Elapsed(pub Duration);

impl Display for Elapsed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let secs = self.0.as_secs();
        write!(f, "{:02}:{:02}:{:02}", secs / 3600, secs / 60 % 60, secs % 60)
    }
}

impl Display for Statistics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Sort completed!\nTime: {}", Elapsed(self.time))?;

        let counters = [
            ("Record reads", self.record_reads),
            ("Record writes", self.record_writes),
            ("Index reads", self.index_reads),
            ("Index writes", self.index_writes),
            ("Bulk reads", self.bulk_reads),
            ("Bulk writes", self.bulk_writes),
        ];
        for (name, value) in counters.iter().filter(|(_, value)| *value > 0) {
            write!(f, "\n{}: {}", name, value)?;
        }

        return Ok(());
    }
}

#[cfg(test)]
mod test {
    use std::time::Duration;

    use rstest::*;

    use super::{Elapsed, Statistics};

    #[rstest]
    #[case(0, "00:00:00")]
    #[case(59, "00:00:59")]
    #[case(61, "00:01:01")]
    #[case(3600 * 26 + 125, "26:02:05")]
    fn test_elapsed(#[case] secs: u64, #[case] expected: &str) {
        assert_eq!(Elapsed(Duration::from_secs(secs)).to_string(), expected);
    }

    #[test]
    fn test_summary_skips_zero_counters() {
        let mut stats = Statistics {
            time: Duration::from_secs(3),
            record_reads: 10,
            bulk_writes: 2,
            ..Statistics::default()
        };

        assert_eq!(
            stats.to_string(),
            "Sort completed!\nTime: 00:00:03\nRecord reads: 10\nBulk writes: 2"
        );

        stats += Statistics {
            index_writes: 4,
            ..Statistics::default()
        };
        assert_eq!(stats.index_writes, 4);

        stats.reset();
        assert_eq!(stats, Statistics::default());
    }
}
