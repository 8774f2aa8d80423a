//! Per client bookkeeping of issued jobs.

use crate::{script::OutputPattern, state::JobState};
use once_cell::sync::OnceCell;
use parking_lot::Mutex;
use std::{collections::BTreeMap, time::Instant};
use tracing::debug;

#[derive(Debug)]
pub struct JobRecord {
    pub id: String,
    /// submitted text, only kept by clients that need it after submission
    pub script: Option<String>,
    pub submitted_at: Instant,
    pub status: JobState,
    pub output_pattern: OutputPattern,
    output: OnceCell<String>,
}

impl JobRecord {
    pub fn new(
        id: impl Into<String>,
        script: Option<String>,
        submitted_at: Instant,
        output_pattern: OutputPattern,
    ) -> Self {
        Self {
            id: id.into(),
            script,
            submitted_at,
            status: JobState::Pending,
            output_pattern,
            output: OnceCell::new(),
        }
    }

    pub fn output(&self) -> Option<&str> {
        self.output.get().map(String::as_str)
    }

    /// output file name with the job id substituted
    pub fn output_file(&self) -> String {
        self.output_pattern.resolve(&self.id)
    }
}

/// Thread safe map of job id to `JobRecord`
#[derive(Debug, Default)]
pub struct JobRegistry {
    jobs: Mutex<BTreeMap<String, JobRecord>>,
}

impl JobRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a freshly submitted job, an id can only ever be registered once.
    pub fn insert(&self, record: JobRecord) -> Result<(), JobRecord> {
        let mut jobs = self.jobs.lock();

        if jobs.contains_key(&record.id) {
            return Err(record);
        }

        jobs.insert(record.id.clone(), record);
        Ok(())
    }

    pub fn contains(&self, job_id: &str) -> bool {
        self.jobs.lock().contains_key(job_id)
    }

    pub fn len(&self) -> usize {
        self.jobs.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.lock().is_empty()
    }

    /// run `f` against the record, `None` if the id is unknown
    pub fn with<T>(&self, job_id: &str, f: impl FnOnce(&JobRecord) -> T) -> Option<T> {
        self.jobs.lock().get(job_id).map(f)
    }

    /// last observed state, `Unknown` for ids never registered
    pub fn status(&self, job_id: &str) -> JobState {
        self.with(job_id, |record| record.status)
            .unwrap_or(JobState::Unknown)
    }

    /// Record a new observation and return the resulting state, which never moves backwards.
    pub fn observe(&self, job_id: &str, observed: JobState) -> JobState {
        match self.jobs.lock().get_mut(job_id) {
            Some(record) => {
                let next = JobState::advance(record.status, observed);
                if next != observed {
                    debug!(
                        job_id,
                        cached = %record.status,
                        observed = %observed,
                        "Ignoring backwards state observation"
                    );
                }
                record.status = next;

                next
            }
            None => JobState::Unknown,
        }
    }

    /// Memoize the output of a job, the first stored value wins and is returned.
    pub fn remember_output(&self, job_id: &str, output: String) -> Option<String> {
        self.jobs
            .lock()
            .get(job_id)
            .map(|record| record.output.get_or_init(|| output).clone())
    }
}
