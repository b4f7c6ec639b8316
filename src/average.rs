//! Computes a sliding average of recorded durations.
//!
//! An [Average](Average) is used by the cache to keep track of the durations which were
//! required to load values from the backing store. It records the last 100 values and
//! computes their average. All updates are performed using atomic operations, therefore
//! this can be shared across many threads without any further locking.
use crate::fmt::format_micros;
use std::fmt::{Display, Formatter};
use std::sync::atomic::{AtomicU64, Ordering};

/// Represents a sliding average of the last 100 recorded values.
///
/// # Example
///
/// ```
/// let avg = ganymede::average::Average::new();
/// avg.add(10);
/// avg.add(20);
/// avg.add(30);
///
/// assert_eq!(avg.avg(), 20);
/// ```
#[derive(Default, Debug)]
pub struct Average {
    sum_and_count: AtomicU64,
    count: AtomicU64,
}

impl Average {
    /// Creates a new average which is initially empty.
    pub fn new() -> Self {
        Average {
            sum_and_count: AtomicU64::new(0),
            count: AtomicU64::new(0),
        }
    }

    /// Adds another value to the sliding average.
    ///
    /// # Example
    ///
    /// ```
    /// let avg = ganymede::average::Average::new();
    /// avg.add(100);
    ///
    /// assert_eq!(avg.avg(), 100);
    /// assert_eq!(avg.count(), 1);
    /// ```
    pub fn add(&self, value: i32) {
        let _ = self.count.fetch_add(1, Ordering::Relaxed);

        // Both, the sum of the recorded values and their count are kept in a single atomic
        // u64 so that they can be read and replaced in one step. Lost updates of concurrent
        // writers are accepted, as this only needs to deliver a good guess of the effective
        // average.
        let sum_and_count = self.sum_and_count.load(Ordering::Relaxed);
        let mut sum = sum_and_count >> 32;
        let mut count = sum_and_count & 0xFFFF_FFFF;

        // Either slide the window once 100 values have been recorded or shrink it early
        // if the sum would otherwise overflow the 32 bits reserved for it.
        while count > 100 || sum as i64 + value as i64 > i32::MAX as i64 {
            sum = count / 2 * sum / count;
            count /= 2;
        }

        sum += value as u64;
        count += 1;

        self.sum_and_count.store(
            (sum & 0xFFFF_FFFF) << 32 | (count & 0xFFFF_FFFF),
            Ordering::Relaxed,
        );
    }

    /// Returns the total number of values which have been recorded so far.
    ///
    /// Note that in contrast to the average itself, which only considers the last
    /// 100 values, this counts all invocations of [add](Average::add).
    pub fn count(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }

    /// Computes the sliding average of the last 100 recorded values.
    pub fn avg(&self) -> i32 {
        let sum_and_count = self.sum_and_count.load(Ordering::Relaxed);
        let sum = sum_and_count >> 32;
        let count = sum_and_count & 0xFFFF_FFFF;

        if count == 0 {
            0
        } else {
            (sum / count) as i32
        }
    }
}

impl Display for Average {
    /// Renders the average as duration in microseconds along with the total
    /// number of recorded values.
    ///
    /// # Example
    ///
    /// ```
    /// let avg = ganymede::average::Average::new();
    /// avg.add(2_048);
    ///
    /// assert_eq!(format!("{}", avg), "2.05 ms (1)");
    /// ```
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        format_micros(self.avg(), f)?;
        write!(f, " ({})", self.count())
    }
}

impl Clone for Average {
    fn clone(&self) -> Self {
        Average {
            sum_and_count: AtomicU64::new(self.sum_and_count.load(Ordering::Relaxed)),
            count: AtomicU64::new(self.count.load(Ordering::Relaxed)),
        }
    }
}
