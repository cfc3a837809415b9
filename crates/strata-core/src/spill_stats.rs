//! Counters accumulated by spilling operators.
//!
//! All counters are signed so that the difference of two snapshots can be
//! represented even when it is negative. Ordering is only defined when every
//! counter moves in the same direction; mixed-direction comparisons are a
//! programming error (`checked_cmp` reports it, the operators panic).

use std::cmp::Ordering;
use std::fmt;
use std::ops::{Add, AddAssign, Sub};

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::succinct::{succinct_bytes, succinct_nanos};

macro_rules! spill_stats {
    ($($field:ident),* $(,)?) => {
        #[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
        pub struct SpillStats {
            $(pub $field: i64,)*
        }

        impl SpillStats {
            fn zip_with(&self, other: &Self, f: impl Fn(i64, i64) -> i64) -> Self {
                Self {
                    $($field: f(self.$field, other.$field),)*
                }
            }

            /// Number of counters less than / greater than `other`'s.
            fn direction_counts(&self, other: &Self) -> (usize, usize) {
                let mut lt = 0;
                let mut gt = 0;
                $(
                    match self.$field.cmp(&other.$field) {
                        Ordering::Less => lt += 1,
                        Ordering::Greater => gt += 1,
                        Ordering::Equal => {}
                    }
                )*
                (lt, gt)
            }
        }
    };
}

spill_stats!(
    spill_runs,
    spilled_input_bytes,
    spilled_bytes,
    spilled_rows,
    spilled_partitions,
    spilled_files,
    spill_fill_time_nanos,
    spill_sort_time_nanos,
    spill_extract_vector_time_nanos,
    spill_serialization_time_nanos,
    spill_writes,
    spill_flush_time_nanos,
    spill_write_time_nanos,
    spill_max_level_exceeded_count,
    spill_read_bytes,
    spill_reads,
    spill_read_time_nanos,
    spill_deserialization_time_nanos,
);

impl SpillStats {
    pub fn empty(&self) -> bool {
        *self == Self::default()
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }

    /// Compare all counters; errors if some counters are smaller and others
    /// larger than `other`'s.
    pub fn checked_cmp(&self, other: &Self) -> Result<Ordering> {
        let (lt, gt) = self.direction_counts(other);
        match (lt > 0, gt > 0) {
            (true, true) => Err(Error::Invariant(format!(
                "Unexpected spill stats comparison: {} counters less, {} counters greater: {} vs {}",
                lt, gt, self, other
            ))),
            (true, false) => Ok(Ordering::Less),
            (false, true) => Ok(Ordering::Greater),
            (false, false) => Ok(Ordering::Equal),
        }
    }
}

impl PartialOrd for SpillStats {
    /// Panics on mixed-direction counters, see [`SpillStats::checked_cmp`].
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        match self.checked_cmp(other) {
            Ok(ordering) => Some(ordering),
            Err(e) => panic!("{e}"),
        }
    }
}

impl Add for SpillStats {
    type Output = SpillStats;

    fn add(self, rhs: Self) -> Self::Output {
        self.zip_with(&rhs, |a, b| a + b)
    }
}

impl AddAssign for SpillStats {
    fn add_assign(&mut self, rhs: Self) {
        *self = *self + rhs;
    }
}

impl Sub for SpillStats {
    type Output = SpillStats;

    fn sub(self, rhs: Self) -> Self::Output {
        self.zip_with(&rhs, |a, b| a - b)
    }
}

impl fmt::Display for SpillStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "spillRuns[{}] spilledInputBytes[{}] spilledBytes[{}] spilledRows[{}] \
             spilledPartitions[{}] spilledFiles[{}] spillFillTimeNanos[{}] \
             spillSortTimeNanos[{}] spillExtractVectorTime[{}] \
             spillSerializationTimeNanos[{}] spillWrites[{}] spillFlushTimeNanos[{}] \
             spillWriteTimeNanos[{}] maxSpillExceededLimitCount[{}] spillReadBytes[{}] \
             spillReads[{}] spillReadTimeNanos[{}] spillReadDeserializationTimeNanos[{}]",
            self.spill_runs,
            succinct_bytes(self.spilled_input_bytes),
            succinct_bytes(self.spilled_bytes),
            self.spilled_rows,
            self.spilled_partitions,
            self.spilled_files,
            succinct_nanos(self.spill_fill_time_nanos),
            succinct_nanos(self.spill_sort_time_nanos),
            succinct_nanos(self.spill_extract_vector_time_nanos),
            succinct_nanos(self.spill_serialization_time_nanos),
            self.spill_writes,
            succinct_nanos(self.spill_flush_time_nanos),
            succinct_nanos(self.spill_write_time_nanos),
            self.spill_max_level_exceeded_count,
            succinct_bytes(self.spill_read_bytes),
            self.spill_reads,
            succinct_nanos(self.spill_read_time_nanos),
            succinct_nanos(self.spill_deserialization_time_nanos),
        )
    }
}
