//! Job client for a Slurm cluster reached through a `Session`.
//!
//! Submission uploads the script and runs `sbatch`. State comes from `squeue` while the job is
//! live and from `sacct` once it left the queue. Output is read from the file named by the
//! script's output directive, retried while the shared filesystem catches up.

use super::{
    registry::{JobRecord, JobRegistry},
    ClientError, JobClient, JobOutput, SubmissionError,
};
use crate::{
    clock::{RetryOutcome, RetryPolicy, SharedClock},
    config::RemoteConfig,
    protocol::{
        accounting_command, cat_command, parse_accounting_state, parse_queue_state,
        parse_submission, queue_command, shell_quote, submit_command,
    },
    script::{remote_script_name, OutputPattern},
    session::{CommandOutput, RemoteSession, Session, SessionError},
    state::JobState,
};
use parking_lot::Mutex;
use std::fmt;
use tracing::{debug, error, info, instrument, warn};

pub struct RemoteJobClient<S = RemoteSession> {
    // one operation at a time on the shared connection
    session: Mutex<S>,
    registry: JobRegistry,
    clock: SharedClock,
    retry: RetryPolicy,
    work_dir: Option<String>,
}

impl RemoteJobClient<RemoteSession> {
    /// Connect to the configured host, a failed connect is final.
    pub fn connect(
        config: &RemoteConfig,
        retry: RetryPolicy,
        clock: SharedClock,
    ) -> Result<Self, ClientError> {
        let session = RemoteSession::connect(config).map_err(|error| {
            error!(error = %error, "Failed to open remote session");
            error
        })?;

        let client = Self::new(session, retry, clock).with_work_dir(config.work_dir.clone());
        client.prepare_work_dir()?;

        Ok(client)
    }
}

impl<S: Session> RemoteJobClient<S> {
    pub fn new(session: S, retry: RetryPolicy, clock: SharedClock) -> Self {
        Self {
            session: Mutex::new(session),
            registry: JobRegistry::new(),
            clock,
            retry,
            work_dir: None,
        }
    }

    /// Upload and submit scripts from `work_dir` instead of the remote login directory
    pub fn with_work_dir(mut self, work_dir: Option<String>) -> Self {
        self.work_dir = work_dir
            .map(|dir| dir.trim_end_matches('/').to_string())
            .filter(|dir| !dir.is_empty());
        self
    }

    pub fn registry(&self) -> &JobRegistry {
        &self.registry
    }

    fn prepare_work_dir(&self) -> Result<(), ClientError> {
        let Some(ref dir) = self.work_dir else {
            return Ok(());
        };

        let command = format!("mkdir -p {}", shell_quote(dir));
        let output = self.session.lock().exec(&command)?;

        if output.success() {
            Ok(())
        } else {
            Err(ClientError::Connection(SessionError::Remote {
                command,
                status: output.status,
                stderr: output.stderr.trim().to_string(),
            }))
        }
    }

    /// Relative paths resolve against the work dir, which is where sbatch runs
    fn remote_path(&self, name: &str) -> String {
        match self.work_dir {
            Some(ref dir) if !name.starts_with('/') && !name.starts_with('~') => {
                format!("{dir}/{name}")
            }
            _ => name.to_string(),
        }
    }

    /// Ask the scheduler for the state of a job.
    ///
    /// The live queue is authoritative while it lists the job. Afterwards accounting decides,
    /// and a job missing from both is assumed to be `COMPLETED`. That last step is a heuristic:
    /// accounting lag or a purged record look the same as a finished job.
    fn query_state(&self, session: &S, job_id: &str) -> Result<JobState, SessionError> {
        let command = queue_command(job_id);
        let queue = finished(session.exec(&command)?, command)?;

        if queue.success() {
            if let Some(token) = parse_queue_state(&queue.stdout) {
                return Ok(JobState::from_native(token).unwrap_or_else(|| {
                    warn!(job_id, token, "Unrecognized queue state, treating the job as running");
                    JobState::Running
                }));
            }
        }

        let command = accounting_command(job_id);
        let accounting = finished(session.exec(&command)?, command)?;

        if let Some(token) = parse_accounting_state(&accounting.stdout) {
            return Ok(JobState::from_native(token).unwrap_or_else(|| {
                warn!(job_id, token, "Unrecognized accounting state, assuming the job completed");
                JobState::Completed
            }));
        }

        warn!(job_id, "Job is neither queued nor known to accounting, assuming it completed");

        Ok(JobState::Completed)
    }

    /// One output read attempt.
    ///
    /// `Session::read_file` runs `cat -- '<path>'` with the path quoted, the fallback runs an
    /// unquoted `cat <path>`. Both go over the same connection, the fallback only differs in
    /// letting the remote shell expand `~` and variables in the output pattern.
    fn read_output(&self, path: &str, attempt: u32) -> Result<Option<String>, SessionError> {
        let session = self.session.lock();

        match session.read_file(path) {
            Ok(bytes) => return Ok(Some(String::from_utf8_lossy(&bytes).into_owned())),
            Err(error) => {
                debug!(attempt, error = %error, "Quoted read failed, retrying with shell expansion")
            }
        }

        match session.exec(&cat_command(path)) {
            Ok(output) if output.success() => Ok(Some(output.stdout)),
            Ok(output) => {
                debug!(attempt, status = ?output.status, "Output file not visible yet");
                Ok(None)
            }
            Err(error) if error.is_transport() => Err(error),
            Err(error) => {
                debug!(attempt, error = %error, "Fallback read failed");
                Ok(None)
            }
        }
    }
}

/// Commands killed by a signal produced no usable answer, report them as failed
fn finished(output: CommandOutput, command: String) -> Result<CommandOutput, SessionError> {
    match output.status {
        Some(_) => Ok(output),
        None => Err(SessionError::Remote {
            command,
            status: None,
            stderr: output.stderr,
        }),
    }
}

impl<S: Session> JobClient for RemoteJobClient<S> {
    #[instrument(skip(self, script), fields(bytes = script.len()), level = "info")]
    fn submit(&self, script: &str) -> Result<String, ClientError> {
        if script.trim().is_empty() {
            return Err(SubmissionError::EmptyScript.into());
        }

        // derived now, the script text is not kept after submission
        let output_pattern = OutputPattern::from_script(script);
        let script_name = remote_script_name();
        let script_path = self.remote_path(&script_name);

        let job_id = {
            let session = self.session.lock();

            session
                .write_file(&script_path, script.as_bytes())
                .map_err(|source| SubmissionError::Upload {
                    path: script_path.clone(),
                    source,
                })?;
            debug!(path = script_path.as_str(), "Uploaded script");

            let output = session
                .exec(&submit_command(&script_name, self.work_dir.as_deref()))
                .map_err(SubmissionError::Transport)?;

            if !output.success() {
                let stderr = output.stderr.trim().to_string();
                error!(status = ?output.status, "sbatch rejected the job: {stderr}");

                return Err(SubmissionError::Rejected {
                    status: output.status,
                    stderr,
                }
                .into());
            }

            parse_submission(&output.stdout).map_err(|source| SubmissionError::Unparseable {
                output: output.stdout.trim().to_string(),
                source,
            })?
        };

        self.registry
            .insert(JobRecord::new(
                job_id.clone(),
                None,
                self.clock.now(),
                output_pattern.clone(),
            ))
            .map_err(|record| SubmissionError::DuplicateId(record.id))?;

        info!(
            job_id = job_id.as_str(),
            output = %output_pattern,
            "Job submitted"
        );

        Ok(job_id)
    }

    #[instrument(skip(self), level = "debug")]
    fn poll_status(&self, job_id: &str) -> JobState {
        let cached = self.registry.status(job_id);

        if cached == JobState::Unknown {
            debug!("Polled an id this client never issued");
            return JobState::Unknown;
        }

        // terminal states are final, spare the scheduler the round trip
        if cached.is_terminal() {
            return cached;
        }

        let observed = {
            let session = self.session.lock();
            self.query_state(&session, job_id)
        };

        match observed {
            Ok(state) => self.registry.observe(job_id, state),
            Err(error) => {
                warn!(error = %error, "Failed to query the scheduler, keeping last known state");
                cached
            }
        }
    }

    #[instrument(skip(self), level = "info")]
    fn fetch_output(&self, job_id: &str) -> JobOutput {
        let Some((file, cached)) = self.registry.with(job_id, |record| {
            (record.output_file(), record.output().map(str::to_string))
        }) else {
            return JobOutput::Error(format!("job {job_id} is unknown to this client"));
        };

        if let Some(output) = cached {
            return JobOutput::Ready(output);
        }

        let path = self.remote_path(&file);

        match self
            .retry
            .run(&*self.clock, |attempt| self.read_output(&path, attempt))
        {
            RetryOutcome::Done { value, attempts } => {
                info!(path = path.as_str(), attempts, "Retrieved job output");

                match self.registry.remember_output(job_id, value) {
                    Some(output) => JobOutput::Ready(output),
                    None => JobOutput::Error(format!("job {job_id} is unknown to this client")),
                }
            }
            RetryOutcome::Aborted { error, attempts } => {
                error!(
                    path = path.as_str(),
                    attempts,
                    error = %error,
                    "Session failed while reading output"
                );

                JobOutput::Error(error.to_string())
            }
            RetryOutcome::Exhausted { attempts } => {
                warn!(path = path.as_str(), attempts, "Output file did not appear");

                JobOutput::NotYetAvailable {
                    file: path,
                    attempts,
                }
            }
        }
    }
}

impl<S> fmt::Debug for RemoteJobClient<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemoteJobClient")
            .field("jobs", &self.registry.len())
            .field("retry", &self.retry)
            .field("work_dir", &self.work_dir)
            .finish()
    }
}
