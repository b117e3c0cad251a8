//! Core types for the socketchat protocol
//!
//! Timestamps are timezone-naive wall-clock instants with millisecond
//! resolution, carried on the wire as signed milliseconds since the Unix epoch.

use core::fmt;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Local, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};

// ----------------------------------------------------------------------------
// Timestamp
// ----------------------------------------------------------------------------

/// Naive wall-clock timestamp in milliseconds since the Unix epoch
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Timestamp(i64);

impl Timestamp {
    /// Create a timestamp from raw milliseconds
    pub fn from_millis(millis: i64) -> Self {
        Self(millis)
    }

    /// Current local wall-clock time, truncated to milliseconds
    pub fn now() -> Self {
        Self::from_naive(Local::now().naive_local())
    }

    /// Convert a naive date-time, dropping sub-millisecond precision
    pub fn from_naive(datetime: NaiveDateTime) -> Self {
        Self(datetime.and_utc().timestamp_millis())
    }

    /// Get the raw milliseconds
    pub fn as_millis(&self) -> i64 {
        self.0
    }

    /// Convert back to a naive date-time, if representable
    pub fn to_naive(&self) -> Option<NaiveDateTime> {
        DateTime::<Utc>::from_timestamp_millis(self.0).map(|datetime| datetime.naive_utc())
    }
}

impl From<NaiveDateTime> for Timestamp {
    fn from(datetime: NaiveDateTime) -> Self {
        Self::from_naive(datetime)
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.to_naive() {
            Some(datetime) => write!(f, "{}", datetime.format("%Y-%m-%d %H:%M:%S%.3f")),
            None => write!(f, "{}ms", self.0),
        }
    }
}

// ----------------------------------------------------------------------------
// Time Source Trait
// ----------------------------------------------------------------------------

/// Trait for providing timestamps
///
/// Lets callers and tests control the clock used when composing messages.
pub trait TimeSource: Send + Sync {
    /// Get the current timestamp
    fn now(&self) -> Timestamp;
}

impl<T: TimeSource + ?Sized> TimeSource for Arc<T> {
    fn now(&self) -> Timestamp {
        (**self).now()
    }
}

/// Wall-clock implementation of TimeSource
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemTimeSource;

impl SystemTimeSource {
    pub fn new() -> Self {
        Self
    }
}

impl TimeSource for SystemTimeSource {
    fn now(&self) -> Timestamp {
        Timestamp::now()
    }
}

/// Time source that never goes backwards
///
/// Wraps another source and clamps every reading to the largest value handed
/// out so far, so timestamps stamped by one sender are non-decreasing even if
/// the wall clock is adjusted.
#[derive(Debug)]
pub struct MonotonicTimeSource<T = SystemTimeSource> {
    inner: T,
    last: AtomicI64,
}

impl<T: TimeSource> MonotonicTimeSource<T> {
    /// Wrap a time source
    pub fn new(inner: T) -> Self {
        Self {
            inner,
            last: AtomicI64::new(i64::MIN),
        }
    }
}

impl Default for MonotonicTimeSource<SystemTimeSource> {
    fn default() -> Self {
        Self::new(SystemTimeSource)
    }
}

impl<T: TimeSource> TimeSource for MonotonicTimeSource<T> {
    fn now(&self) -> Timestamp {
        let candidate = self.inner.now().as_millis();
        let previous = self.last.fetch_max(candidate, Ordering::SeqCst);
        Timestamp::from_millis(previous.max(candidate))
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
