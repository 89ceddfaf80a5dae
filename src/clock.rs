//! Owner-driven frame clock
//!
//! A client may ask the owner to pace it: every `rate` ticks the owner sends
//! a `StepFrame`. Ticks come from [`MonotonicTicker`], which counts fixed
//! periods on the monotonic clock so a late caller catches up instead of
//! drifting.

use std::time::{Duration, Instant};

/// Default tick length, 40 ticks per second
pub const DEFAULT_TICK: Duration = Duration::from_millis(25);

/// Countdown held by the owner for one segment
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameClock {
    start: u32,
    left: u32,
    once: bool,
}

impl FrameClock {
    /// A clock firing every `rate` ticks; `None` for a rate of zero
    pub fn new(rate: u32, once: bool) -> Option<Self> {
        (rate > 0).then_some(Self {
            start: rate,
            left: rate,
            once,
        })
    }

    pub fn rate(&self) -> u32 {
        self.start
    }

    pub fn is_once(&self) -> bool {
        self.once
    }

    /// Advance by `ticks`; returns how many times the clock fired
    pub fn advance(&mut self, ticks: u32) -> u32 {
        let mut fired = 0;
        let mut ticks = ticks;
        while ticks > 0 {
            let step = ticks.min(self.left);
            self.left -= step;
            ticks -= step;
            if self.left == 0 {
                fired += 1;
                self.left = self.start;
                if self.once {
                    break;
                }
            }
        }
        fired
    }
}

/// Counts elapsed tick periods since a base instant
#[derive(Debug, Clone)]
pub struct MonotonicTicker {
    base: Instant,
    period: Duration,
    consumed: u64,
}

impl MonotonicTicker {
    pub fn new(period: Duration) -> Self {
        Self {
            base: Instant::now(),
            period: period.max(Duration::from_millis(1)),
            consumed: 0,
        }
    }

    pub fn period(&self) -> Duration {
        self.period
    }

    /// Whole periods elapsed since the last call
    pub fn ticks(&mut self) -> u32 {
        self.ticks_at(Instant::now())
    }

    fn ticks_at(&mut self, now: Instant) -> u32 {
        let total = (now.saturating_duration_since(self.base).as_nanos() / self.period.as_nanos()) as u64;
        let elapsed = total.saturating_sub(self.consumed);
        self.consumed = total;
        elapsed.min(u32::MAX as u64) as u32
    }

    /// Time left until the next period boundary
    pub fn until_next(&self) -> Duration {
        let next = self.period * (self.consumed as u32).saturating_add(1);
        (self.base + next).saturating_duration_since(Instant::now())
    }

    /// Restart counting from now
    pub fn rebase(&mut self) {
        self.base = Instant::now();
        self.consumed = 0;
    }
}
