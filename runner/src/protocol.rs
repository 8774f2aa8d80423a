//! Command construction and response parsing for the scheduler's command line tools.
//!
//! Every parser here has a narrow contract and reports unexpected input as a value instead of
//! panicking, the responses come from a remote host we don't control.

#[cfg(test)]
mod protocol_test;

use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ParseError {
    #[error("scheduler returned an empty response")]
    Empty,
    #[error("'{0}' does not look like a job id")]
    InvalidId(String),
}

fn first_line(stdout: &str) -> Option<&str> {
    stdout.lines().map(str::trim).find(|line| !line.is_empty())
}

/// Extract the job id from the submission response, e.g. `Submitted batch job 123456`.
///
/// The id is the last whitespace delimited token of the first non-empty line.
pub fn parse_submission(stdout: &str) -> Result<String, ParseError> {
    let line = first_line(stdout).ok_or(ParseError::Empty)?;

    let token = line.split_whitespace().last().ok_or(ParseError::Empty)?;

    if token
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.'))
    {
        Ok(token.to_string())
    } else {
        Err(ParseError::InvalidId(token.to_string()))
    }
}

/// State token reported by the active queue, `None` if the job is no longer queued
pub fn parse_queue_state(stdout: &str) -> Option<&str> {
    first_line(stdout).and_then(|line| line.split_whitespace().next())
}

/// Leading state token of the first accounting line, `None` if accounting has no record yet
pub fn parse_accounting_state(stdout: &str) -> Option<&str> {
    first_line(stdout).and_then(|line| line.split_whitespace().next())
}

/// Quote a value for a POSIX shell, embedded single quotes are closed, escaped and reopened.
pub fn shell_quote(value: &str) -> String {
    let mut quoted = String::with_capacity(value.len() + 2);
    quoted.push('\'');
    for c in value.chars() {
        if c == '\'' {
            quoted.push_str("'\\''");
        } else {
            quoted.push(c);
        }
    }
    quoted.push('\'');

    quoted
}

/// sbatch invocation, optionally from a working directory so relative output paths resolve there
pub fn submit_command(script_path: &str, work_dir: Option<&str>) -> String {
    match work_dir {
        Some(dir) => format!(
            "cd {} && sbatch {}",
            shell_quote(dir),
            shell_quote(script_path)
        ),
        None => format!("sbatch {}", shell_quote(script_path)),
    }
}

pub fn queue_command(job_id: &str) -> String {
    format!("squeue -j {} -h -o %T", shell_quote(job_id))
}

pub fn accounting_command(job_id: &str) -> String {
    format!("sacct -j {} -n -o State", shell_quote(job_id))
}

/// Plain `cat` of a path, left unquoted so the remote shell expands `~` and variables
pub fn cat_command(path: &str) -> String {
    format!("cat {path}")
}
