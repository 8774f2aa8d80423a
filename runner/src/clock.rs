//! Time source and retry policy shared by the job clients.
//!
//! All waiting in this crate goes through a `Clock`, which lets tests swap in a `VirtualClock`
//! and observe every requested sleep without spending wall-clock time.

use parking_lot::Mutex;
use std::{
    fmt::Debug,
    sync::Arc,
    thread,
    time::{Duration, Instant},
};

pub trait Clock: Debug + Send + Sync {
    fn now(&self) -> Instant;
    fn sleep(&self, duration: Duration);
}

pub type SharedClock = Arc<dyn Clock>;

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }

    fn sleep(&self, duration: Duration) {
        thread::sleep(duration)
    }
}

/// Manually driven clock, `sleep` advances time instantly and is recorded
#[derive(Debug)]
pub struct VirtualClock {
    origin: Instant,
    state: Mutex<VirtualState>,
}

#[derive(Debug, Default)]
struct VirtualState {
    offset: Duration,
    sleeps: Vec<Duration>,
}

impl VirtualClock {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
            state: Mutex::new(VirtualState::default()),
        }
    }

    pub fn shared() -> Arc<Self> {
        Arc::new(Self::new())
    }

    pub fn advance(&self, duration: Duration) {
        self.state.lock().offset += duration;
    }

    /// total virtual time passed since creation
    pub fn elapsed(&self) -> Duration {
        self.state.lock().offset
    }

    /// every duration passed to `sleep`, in call order
    pub fn sleeps(&self) -> Vec<Duration> {
        self.state.lock().sleeps.clone()
    }
}

impl Default for VirtualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for VirtualClock {
    fn now(&self) -> Instant {
        self.origin + self.state.lock().offset
    }

    fn sleep(&self, duration: Duration) {
        let mut state = self.state.lock();
        state.offset += duration;
        state.sleeps.push(duration);
    }
}

/// Bounded, fixed interval retry policy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub interval: Duration,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, interval: Duration) -> Self {
        Self {
            max_attempts,
            interval,
        }
    }

    /// Run `attempt` until it yields a value, fails hard or the budget is spent.
    ///
    /// `attempt` receives the 1-based attempt number and returns `Ok(None)` to ask for another
    /// try. The clock sleeps between attempts only, never after the last one.
    pub fn run<T, E>(
        &self,
        clock: &dyn Clock,
        mut attempt: impl FnMut(u32) -> Result<Option<T>, E>,
    ) -> RetryOutcome<T, E> {
        for number in 1..=self.max_attempts {
            match attempt(number) {
                Ok(Some(value)) => {
                    return RetryOutcome::Done {
                        value,
                        attempts: number,
                    }
                }
                Ok(None) => {}
                Err(error) => {
                    return RetryOutcome::Aborted {
                        error,
                        attempts: number,
                    }
                }
            }

            if number < self.max_attempts {
                clock.sleep(self.interval);
            }
        }

        RetryOutcome::Exhausted {
            attempts: self.max_attempts,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryOutcome<T, E> {
    Done { value: T, attempts: u32 },
    Aborted { error: E, attempts: u32 },
    Exhausted { attempts: u32 },
}

impl Default for RetryPolicy {
    /// 10 attempts, 3 seconds apart
    fn default() -> Self {
        Self::new(10, Duration::from_secs(3))
    }
}
