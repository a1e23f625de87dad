//! Fixed-rate scheduling with cooperative shutdown.
//!
//! A [`Ticker`] advances an absolute deadline by a constant period on every tick and sleeps
//! until that deadline, so execution jitter never accumulates into drift. The sleep happens on
//! a [`ShutdownSignal`], which wakes every sleeping loop as soon as shutdown is triggered.

use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::time::{Duration, Instant};

/// Cloneable shutdown flag shared by every loop.
#[derive(Clone, Debug, Default)]
pub struct ShutdownSignal {
    inner: Arc<(Mutex<bool>, Condvar)>,
}

impl ShutdownSignal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request shutdown and wake all sleepers.
    pub fn trigger(&self) {
        let (flag, condvar) = &*self.inner;
        *flag.lock().unwrap_or_else(PoisonError::into_inner) = true;
        condvar.notify_all();
    }

    pub fn is_triggered(&self) -> bool {
        *self.inner.0.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Sleep until `deadline` or until shutdown is triggered, whichever comes first.
    ///
    /// # Returns
    /// `true` if shutdown was triggered.
    pub fn sleep_until(&self, deadline: Instant) -> bool {
        let (flag, condvar) = &*self.inner;
        let mut triggered = flag.lock().unwrap_or_else(PoisonError::into_inner);
        loop {
            if *triggered {
                return true;
            }
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            triggered = condvar
                .wait_timeout(triggered, deadline - now)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
    }
}

/// Drift-free fixed-rate ticker.
#[derive(Clone, Debug)]
pub struct Ticker {
    period: Duration,
    deadline: Instant,
    ticks: u64,
}

impl Ticker {
    pub fn new(period: Duration) -> Self {
        Self::starting_at(period, Instant::now())
    }

    /// Ticker whose first deadline is `start + period`.
    pub fn starting_at(period: Duration, start: Instant) -> Self {
        Ticker {
            period,
            deadline: start,
            ticks: 0,
        }
    }

    pub fn period(&self) -> Duration {
        self.period
    }

    pub fn ticks(&self) -> u64 {
        self.ticks
    }

    /// Advance to the next deadline, computed from the previous deadline.
    pub fn advance(&mut self) -> Instant {
        self.deadline += self.period;
        self.ticks += 1;
        self.deadline
    }

    /// Run `tick` once per period until `shutdown` is triggered.
    ///
    /// The callback receives the tick index, starting at zero. Returns the number of ticks run.
    pub fn run<F>(&mut self, shutdown: &ShutdownSignal, mut tick: F) -> u64
    where
        F: FnMut(u64),
    {
        let start = self.ticks;
        while !shutdown.is_triggered() {
            let index = self.ticks;
            let deadline = self.advance();
            tick(index);
            let now = Instant::now();
            if now > deadline {
                log::debug!(
                    "tick {index} overran its deadline by {:?} (period {:?})",
                    now - deadline,
                    self.period
                );
            }
            if shutdown.sleep_until(deadline) {
                break;
            }
        }
        self.ticks - start
    }
}
