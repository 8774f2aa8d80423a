pub mod registry;
pub mod remote;
pub mod simulated;

use crate::{
    clock::SharedClock,
    config::{ConfigErrors, RunnerConfig},
    protocol::ParseError,
    session::SessionError,
    state::JobState,
};
use std::fmt;
use thiserror::Error;

pub use remote::RemoteJobClient;
pub use simulated::SimulatedJobClient;

#[derive(Error, Debug)]
pub enum SubmissionError {
    #[error("Script is empty")]
    EmptyScript,
    #[error("Failed to upload script to {path}: {source}")]
    Upload {
        path: String,
        #[source]
        source: SessionError,
    },
    #[error("Failed to reach the scheduler: {0}")]
    Transport(#[source] SessionError),
    #[error("sbatch failed ({status:?}): {stderr}")]
    Rejected { status: Option<i32>, stderr: String },
    #[error("Could not parse job id from sbatch output '{output}'")]
    Unparseable {
        output: String,
        #[source]
        source: ParseError,
    },
    #[error("Job id {0} was already issued by this client")]
    DuplicateId(String),
}

#[derive(Error, Debug)]
pub enum ClientError {
    #[error("Connection failed: {0}")]
    Connection(#[from] SessionError),
    #[error("Submission failed: {0}")]
    Submission(#[from] SubmissionError),
    #[error(transparent)]
    Config(#[from] ConfigErrors),
}

/// Result of an output retrieval
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobOutput {
    Ready(String),
    /// the output file did not show up within the retry budget
    NotYetAvailable { file: String, attempts: u32 },
    /// retrieval is impossible, e.g. the job is unknown or the session is gone
    Error(String),
}

impl JobOutput {
    pub fn is_ready(&self) -> bool {
        matches!(self, Self::Ready(_))
    }

    /// the output text, or a readable placeholder describing why there is none
    pub fn into_text(self) -> String {
        match self {
            Self::Ready(text) => text,
            other => other.to_string(),
        }
    }
}

impl fmt::Display for JobOutput {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ready(text) => f.write_str(text),
            Self::NotYetAvailable { file, attempts } => {
                write!(f, "Output file {file} not found after {attempts} retries.")
            }
            Self::Error(reason) => write!(f, "Output unavailable: {reason}"),
        }
    }
}

/// Submit a batch script, follow its state and read its output.
///
/// Job ids are only meaningful to the client instance that issued them.
pub trait JobClient {
    /// Submit `script` and return the new job id
    fn submit(&self, script: &str) -> Result<String, ClientError>;

    /// Current normalized state, `JobState::Unknown` for ids this client never issued
    fn poll_status(&self, job_id: &str) -> JobState;

    /// Output of a finished job, retrying while the output file is not visible yet
    fn fetch_output(&self, job_id: &str) -> JobOutput;
}

impl<C: JobClient + ?Sized> JobClient for &C {
    fn submit(&self, script: &str) -> Result<String, ClientError> {
        (**self).submit(script)
    }

    fn poll_status(&self, job_id: &str) -> JobState {
        (**self).poll_status(job_id)
    }

    fn fetch_output(&self, job_id: &str) -> JobOutput {
        (**self).fetch_output(job_id)
    }
}

/// All job client variants, selected once from the config
pub enum Clients {
    Simulated(SimulatedJobClient),
    Remote(RemoteJobClient),
}

impl Clients {
    pub fn load(config: &RunnerConfig, clock: SharedClock) -> Result<Self, ClientError> {
        match config.client.name.as_str() {
            "simulated" => Ok(Self::Simulated(SimulatedJobClient::new(clock))),
            "remote" => {
                let remote = config.remote.as_ref().ok_or(ConfigErrors::MissingRemote)?;

                Ok(Self::Remote(RemoteJobClient::connect(
                    remote,
                    config.output.retry_policy(),
                    clock,
                )?))
            }
            name => Err(ConfigErrors::UnsupportedClient(name.to_string()).into()),
        }
    }
}

impl JobClient for Clients {
    fn submit(&self, script: &str) -> Result<String, ClientError> {
        match self {
            Self::Simulated(client) => client.submit(script),
            Self::Remote(client) => client.submit(script),
        }
    }

    fn poll_status(&self, job_id: &str) -> JobState {
        match self {
            Self::Simulated(client) => client.poll_status(job_id),
            Self::Remote(client) => client.poll_status(job_id),
        }
    }

    fn fetch_output(&self, job_id: &str) -> JobOutput {
        match self {
            Self::Simulated(client) => client.fetch_output(job_id),
            Self::Remote(client) => client.fetch_output(job_id),
        }
    }
}
