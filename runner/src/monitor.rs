//! Poll a job until it reaches a terminal state.

use crate::{
    clients::JobClient,
    clock::SharedClock,
    config::PollingConfig,
    interrupt::Cancellation,
    state::JobState,
};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, instrument, warn};

/// upper bound for a single sleep, keeps the loop responsive to cancellation
const SLICE: Duration = Duration::from_millis(100);

#[derive(Error, Debug, PartialEq, Eq)]
pub enum MonitorError {
    /// monitoring stopped, the job itself keeps running on the cluster
    #[error("Stopped monitoring job {job} (last state {last})")]
    Interrupted { job: String, last: JobState },
    #[error("Job {job} still {last} after {after:?}")]
    DeadlineExceeded {
        job: String,
        last: JobState,
        after: Duration,
    },
    #[error("Job {0} is unknown to the client")]
    UnknownJob(String),
}

#[derive(Debug)]
pub struct Monitor {
    interval: Duration,
    timeout: Option<Duration>,
    clock: SharedClock,
}

impl Monitor {
    pub fn new(config: &PollingConfig, clock: SharedClock) -> Self {
        Self {
            interval: config.interval(),
            timeout: config.timeout(),
            clock,
        }
    }

    #[instrument(skip(self, client, cancel), level = "info")]
    pub fn wait<C: JobClient + ?Sized>(
        &self,
        client: &C,
        job_id: &str,
        cancel: &Cancellation,
    ) -> Result<JobState, MonitorError> {
        let started = self.clock.now();
        let mut last = None;

        loop {
            let state = client.poll_status(job_id);

            if last != Some(state) {
                info!(state = %state, "Job state changed");
                last = Some(state);
            } else {
                debug!(state = %state, "Polled job");
            }

            if state == JobState::Unknown {
                return Err(MonitorError::UnknownJob(job_id.to_string()));
            }

            if state.is_terminal() {
                return Ok(state);
            }

            let waited = self.clock.now().saturating_duration_since(started);
            if let Some(timeout) = self.timeout {
                if waited >= timeout {
                    warn!(after = ?waited, "Giving up on job");

                    return Err(MonitorError::DeadlineExceeded {
                        job: job_id.to_string(),
                        last: state,
                        after: waited,
                    });
                }
            }

            if !self.pause(cancel) {
                warn!(state = %state, "Monitoring interrupted, the job is left running");

                return Err(MonitorError::Interrupted {
                    job: job_id.to_string(),
                    last: state,
                });
            }
        }
    }

    /// sleep one poll interval in slices, false once cancelled
    fn pause(&self, cancel: &Cancellation) -> bool {
        let mut remaining = self.interval;

        while !remaining.is_zero() {
            if cancel.is_cancelled() {
                return false;
            }

            let slice = remaining.min(SLICE);
            self.clock.sleep(slice);
            remaining -= slice;
        }

        !cancel.is_cancelled()
    }
}
