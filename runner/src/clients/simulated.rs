//! In-memory job client with a fixed, time based lifecycle.
//!
//! A job is `PENDING` for its first 2 seconds, `RUNNING` until 5 seconds and `COMPLETED`
//! afterwards. No network is involved, which makes the client a stand-in for the remote one
//! in tests and dry runs.

use super::{
    registry::{JobRecord, JobRegistry},
    ClientError, JobClient, JobOutput, SubmissionError,
};
use crate::{clock::SharedClock, script::OutputPattern, state::JobState};
use std::{
    sync::atomic::{AtomicU64, Ordering},
    time::Duration,
};
use tracing::{debug, info, instrument};

/// jobs leave `PENDING` after this long
pub const PENDING_FOR: Duration = Duration::from_secs(2);
/// jobs are `COMPLETED` from this point on
pub const COMPLETED_AFTER: Duration = Duration::from_secs(5);

const FIRST_JOB_ID: u64 = 1000;

/// state of a simulated job `elapsed` after its submission
pub fn phase(elapsed: Duration) -> JobState {
    if elapsed < PENDING_FOR {
        JobState::Pending
    } else if elapsed < COMPLETED_AFTER {
        JobState::Running
    } else {
        JobState::Completed
    }
}

/// canned output, scripts mentioning python "compute" a result
fn canned_output(script: &str) -> &'static str {
    if script.contains("python") {
        "Result: 42 (Mock Output)"
    } else {
        "Job completed successfully."
    }
}

#[derive(Debug)]
pub struct SimulatedJobClient {
    registry: JobRegistry,
    clock: SharedClock,
    next_id: AtomicU64,
}

impl SimulatedJobClient {
    pub fn new(clock: SharedClock) -> Self {
        info!("Initialized simulated job client");

        Self {
            registry: JobRegistry::new(),
            clock,
            next_id: AtomicU64::new(FIRST_JOB_ID),
        }
    }

    pub fn registry(&self) -> &JobRegistry {
        &self.registry
    }
}

impl JobClient for SimulatedJobClient {
    #[instrument(skip(self, script), level = "debug")]
    fn submit(&self, script: &str) -> Result<String, ClientError> {
        if script.trim().is_empty() {
            return Err(SubmissionError::EmptyScript.into());
        }

        let job_id = self.next_id.fetch_add(1, Ordering::SeqCst).to_string();
        let record = JobRecord::new(
            job_id.clone(),
            Some(script.to_string()),
            self.clock.now(),
            OutputPattern::from_script(script),
        );

        self.registry
            .insert(record)
            .map_err(|record| SubmissionError::DuplicateId(record.id))?;

        info!(job_id = job_id.as_str(), "Simulated job submitted");

        Ok(job_id)
    }

    #[instrument(skip(self), level = "debug")]
    fn poll_status(&self, job_id: &str) -> JobState {
        let Some((submitted_at, script)) = self
            .registry
            .with(job_id, |record| (record.submitted_at, record.script.clone()))
        else {
            debug!("Polled an id this client never issued");
            return JobState::Unknown;
        };

        let state = phase(self.clock.now().saturating_duration_since(submitted_at));

        if state == JobState::Completed {
            let output = canned_output(script.as_deref().unwrap_or_default());
            self.registry.remember_output(job_id, output.to_string());
        }

        self.registry.observe(job_id, state)
    }

    #[instrument(skip(self), level = "debug")]
    fn fetch_output(&self, job_id: &str) -> JobOutput {
        match self.registry.with(job_id, |record| {
            record
                .output()
                .map(str::to_string)
                .ok_or_else(|| record.output_file())
        }) {
            Some(Ok(output)) => JobOutput::Ready(output),
            Some(Err(file)) => JobOutput::NotYetAvailable { file, attempts: 0 },
            None => JobOutput::Error(format!("job {job_id} is unknown to this client")),
        }
    }
}
