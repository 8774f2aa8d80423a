//! From a request to a finished job: generate, confirm, submit, monitor, fetch.

use crate::{
    clients::{JobClient, JobOutput},
    interrupt::Cancellation,
    monitor::{Monitor, MonitorError},
    script::{extract_script, ExtractedScript},
    state::JobState,
};
use std::{
    fs, io,
    path::{Path, PathBuf},
};
use thiserror::Error;
use tracing::{error, info, instrument, warn};

#[derive(Error, Debug)]
pub enum GeneratorError {
    #[error("Failed to read {path}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("Script generation failed: {0}")]
    Failed(String),
}

/// Anything that turns a request into a batch script
pub trait ScriptGenerator {
    fn generate(&self, request: &str) -> Result<ExtractedScript, GeneratorError>;
}

impl<F> ScriptGenerator for F
where
    F: Fn(&str) -> Result<String, String>,
{
    fn generate(&self, request: &str) -> Result<ExtractedScript, GeneratorError> {
        self(request)
            .map(|script| ExtractedScript {
                reasoning: None,
                script,
            })
            .map_err(GeneratorError::Failed)
    }
}

/// Script stored in a file, the request is ignored.
///
/// Markdown files (anything with a code fence) are treated as a model response and reduced to
/// the script they contain.
#[derive(Debug, Clone)]
pub struct ScriptFile {
    path: PathBuf,
}

impl ScriptFile {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }
}

impl ScriptGenerator for ScriptFile {
    fn generate(&self, _request: &str) -> Result<ExtractedScript, GeneratorError> {
        let content = fs::read_to_string(&self.path).map_err(|source| GeneratorError::Read {
            path: self.path.clone(),
            source,
        })?;

        if content.contains("```") {
            Ok(extract_script(&content))
        } else {
            Ok(ExtractedScript {
                reasoning: None,
                script: content,
            })
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunOutcome {
    /// the generator produced nothing to submit
    NoScript,
    /// the user did not confirm the submission
    Declined,
    /// interrupted before submission, nothing was submitted
    Cancelled,
    SubmissionFailed(String),
    /// monitoring stopped, the job may still be running
    Interrupted { job: String, last: JobState },
    /// monitoring gave up for another reason
    Abandoned { job: String, reason: String },
    /// terminal state reached, output is only fetched for `COMPLETED` jobs
    Finished {
        job: String,
        state: JobState,
        output: Option<JobOutput>,
    },
}

pub struct Pipeline<'a, G: ?Sized, C: ?Sized> {
    generator: &'a G,
    client: &'a C,
    monitor: &'a Monitor,
}

impl<'a, G, C> Pipeline<'a, G, C>
where
    G: ScriptGenerator + ?Sized,
    C: JobClient + ?Sized,
{
    pub fn new(generator: &'a G, client: &'a C, monitor: &'a Monitor) -> Self {
        Self {
            generator,
            client,
            monitor,
        }
    }

    /// Run one request to completion.
    ///
    /// `confirm` sees the generated script and decides whether it gets submitted. An interrupt
    /// that arrived before submission means no job is started at all.
    #[instrument(skip_all, level = "info")]
    pub fn run(
        &self,
        request: &str,
        confirm: impl FnOnce(&ExtractedScript) -> bool,
        cancel: &Cancellation,
    ) -> RunOutcome {
        let generated = match self.generator.generate(request) {
            Ok(generated) if !generated.script.trim().is_empty() => generated,
            Ok(_) => {
                warn!("Generator returned an empty script");
                return RunOutcome::NoScript;
            }
            Err(error) => {
                error!(error = %error, "Failed to generate a script");
                return RunOutcome::NoScript;
            }
        };

        if !confirm(&generated) {
            info!("Submission declined");
            return RunOutcome::Declined;
        }

        // ^C while the prompt was open
        if cancel.is_cancelled() {
            warn!("Interrupted before submission, not submitting");
            return RunOutcome::Cancelled;
        }

        let job = match self.client.submit(&generated.script) {
            Ok(job) => job,
            Err(error) => {
                error!(error = %error, "Submission failed");
                return RunOutcome::SubmissionFailed(error.to_string());
            }
        };

        match self.monitor.wait(self.client, &job, cancel) {
            Ok(state) => {
                let output =
                    (state == JobState::Completed).then(|| self.client.fetch_output(&job));

                RunOutcome::Finished { job, state, output }
            }
            Err(MonitorError::Interrupted { job, last }) => RunOutcome::Interrupted { job, last },
            Err(error) => RunOutcome::Abandoned {
                job,
                reason: error.to_string(),
            },
        }
    }
}
