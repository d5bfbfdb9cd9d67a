//! Provides a lock free sliding average which is used to track producer durations.
//!
//! Each [StampedeGuard](crate::guard::StampedeGuard) records how long its producer calls take.
//! As these measurements are recorded from many concurrent requests, the [Average](Average) is
//! internally mutable and relies on atomics only.
//!
//! # Example
//!
//! ```
//! # use dogpile::average::Average;
//! # use std::time::Duration;
//! let avg = Average::new();
//! avg.record(Duration::from_millis(10));
//! avg.record(Duration::from_millis(20));
//! avg.record(Duration::from_millis(30));
//!
//! assert_eq!(avg.avg(), 20_000);
//! assert_eq!(avg.count(), 3);
//! assert_eq!(format!("{}", avg), "20.0 ms (3)");
//! ```
use crate::fmt::format_micros;
use std::fmt;
use std::fmt::Display;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Once this many samples have been folded into the window, the window is halved.
const WINDOW_SIZE: i32 = 100;

/// Computes a sliding average of the last (roughly) 100 recorded values.
///
/// The running sum and the number of samples in the window are packed into a single u64 so
/// that both are always read and written together.
#[derive(Default)]
pub struct Average {
    window: AtomicU64,
    total: AtomicU64,
}

impl Clone for Average {
    fn clone(&self) -> Self {
        Average {
            window: AtomicU64::new(self.window.load(Ordering::Relaxed)),
            total: AtomicU64::new(self.total.load(Ordering::Relaxed)),
        }
    }
}

fn unpack(window: u64) -> (i32, i32) {
    ((window >> 32) as u32 as i32, window as u32 as i32)
}

fn pack(sum: i32, count: i32) -> u64 {
    (u64::from(sum as u32) << 32) | u64::from(count as u32)
}

impl Average {
    /// Creates a new and empty average.
    pub fn new() -> Average {
        Average::default()
    }

    /// Records the given duration (in microseconds).
    ///
    /// Durations which do not fit into an i32 worth of microseconds (about 35 minutes) are
    /// clamped.
    pub fn record(&self, duration: Duration) {
        self.add(i32::try_from(duration.as_micros()).unwrap_or(i32::MAX));
    }

    /// Adds another value to the average.
    ///
    /// If the window already holds more than 100 values or if the sum would overflow, the window
    /// is halved (keeping its average) before the new value is added.
    pub fn add(&self, value: i32) {
        let _ = self.total.fetch_add(1, Ordering::Relaxed);

        let (mut sum, mut count) = unpack(self.window.load(Ordering::Relaxed));
        while count > WINDOW_SIZE || i64::from(sum) + i64::from(value) > i64::from(i32::MAX) {
            sum = count / 2 * sum / count;
            count /= 2;
        }

        self.window
            .store(pack(sum + value, count + 1), Ordering::Relaxed);
    }

    /// Returns the total number of recorded values.
    pub fn count(&self) -> u64 {
        self.total.load(Ordering::Relaxed)
    }

    /// Returns the sliding average of the recent values.
    pub fn avg(&self) -> i32 {
        match unpack(self.window.load(Ordering::Relaxed)) {
            (_, 0) => 0,
            (sum, count) => sum / count,
        }
    }
}

impl Display for Average {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        format_micros(self.avg(), f)?;
        write!(f, " ({})", self.count())
    }
}
