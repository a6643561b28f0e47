//! Monotonic clock used to timestamp DAQ samples and answer
//! GET_DAQ_CLOCK / TIME_CORRELATION_PROPERTIES.
//!
//! A thin shim over [`std::time::Instant`]; the real socket/clock
//! syscalls are an out-of-scope host-OS concern, this module only adds
//! the monotonic, non-regressing tick semantics the protocol requires.

use crate::config::TimestampUnit;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClockState {
    FreeRunning,
    Synchronizing,
    Synchronized,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Epoch {
    Tai,
    Utc,
    Arbitrary,
}

#[derive(Debug, Clone, Copy)]
pub struct GrandmasterInfo {
    pub uuid: [u8; 8],
    pub epoch: Epoch,
    pub stratum: u8,
}

/// Monotonic 64-bit tick source.
///
/// Ticks never go backwards: a re-read that would be earlier than the
/// last observed value is clamped to the last observed value instead
/// of returned as-is.
pub struct Clock {
    start: Instant,
    unit: TimestampUnit,
    last: AtomicU64,
    state: ClockState,
    grandmaster: Option<GrandmasterInfo>,
}

impl Clock {
    pub fn new(unit: TimestampUnit) -> Self {
        Clock { start: Instant::now(), unit, last: AtomicU64::new(0), state: ClockState::FreeRunning, grandmaster: None }
    }

    /// Ticks since construction, in the configured unit, clamped to be
    /// monotonic.
    pub fn now_ticks(&self) -> u64 {
        let elapsed = self.start.elapsed();
        let raw = match self.unit {
            TimestampUnit::Nanoseconds => elapsed.as_nanos() as u64,
            TimestampUnit::Microseconds => elapsed.as_micros() as u64,
        };
        let mut prev = self.last.load(Ordering::Relaxed);
        loop {
            if raw <= prev {
                return prev;
            }
            match self.last.compare_exchange_weak(prev, raw, Ordering::Relaxed, Ordering::Relaxed) {
                Ok(_) => return raw,
                Err(actual) => prev = actual,
            }
        }
    }

    pub fn state(&self) -> ClockState {
        self.state
    }

    pub fn grandmaster(&self) -> Option<GrandmasterInfo> {
        self.grandmaster
    }

    pub fn unit(&self) -> TimestampUnit {
        self.unit
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ticks_are_monotonic() {
        let clock = Clock::new(TimestampUnit::Nanoseconds);
        let mut prev = clock.now_ticks();
        for _ in 0..1000 {
            let next = clock.now_ticks();
            assert!(next >= prev);
            prev = next;
        }
    }
}
