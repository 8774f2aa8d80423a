use serde::{Deserialize, Serialize};
use std::{fmt, str::FromStr};
use thiserror::Error;

/// Client level job states, independent of the scheduler's native vocabulary
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobState {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
    Timeout,
    NodeFail,
    /// the client has no record of the queried id
    Unknown,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("'{0}' is not a normalized job state")]
pub struct InvalidState(pub String);

impl JobState {
    pub const TERMINAL: [JobState; 5] = [
        JobState::Completed,
        JobState::Failed,
        JobState::Cancelled,
        JobState::Timeout,
        JobState::NodeFail,
    ];

    pub fn is_terminal(&self) -> bool {
        Self::TERMINAL.contains(self)
    }

    /// position in the forward-only progression, `None` for `Unknown`
    fn rank(&self) -> Option<u8> {
        match self {
            Self::Pending => Some(0),
            Self::Running => Some(1),
            Self::Unknown => None,
            _ => Some(2),
        }
    }

    /// Map a token reported by squeue/sacct onto the normalized states.
    ///
    /// Accounting decorates some states (`CANCELLED by 1000`, `COMPLETED+`), only the leading
    /// word without trailing markers is considered. Returns `None` for unrecognized tokens.
    pub fn from_native(token: &str) -> Option<Self> {
        let word = token
            .split_whitespace()
            .next()?
            .trim_end_matches('+')
            .to_ascii_uppercase();

        match word.as_str() {
            "PENDING" | "PD" | "REQUEUED" | "REQUEUE_HOLD" | "REQUEUE_FED" | "RESV_DEL_HOLD" => {
                Some(Self::Pending)
            }
            "RUNNING" | "R" | "COMPLETING" | "CG" | "CONFIGURING" | "CF" | "SIGNALING"
            | "STAGE_OUT" | "RESIZING" | "SUSPENDED" | "S" | "STOPPED" | "ST" => {
                Some(Self::Running)
            }
            "COMPLETED" | "CD" => Some(Self::Completed),
            "FAILED" | "F" | "OUT_OF_MEMORY" | "OOM" => Some(Self::Failed),
            "CANCELLED" | "CA" | "PREEMPTED" | "PR" => Some(Self::Cancelled),
            "TIMEOUT" | "TO" | "DEADLINE" | "DL" => Some(Self::Timeout),
            "NODE_FAIL" | "NF" | "BOOT_FAIL" | "BF" => Some(Self::NodeFail),
            _ => None,
        }
    }

    /// Combine the cached state with a new observation, never moving backwards.
    ///
    /// Once terminal, the cached state is final. `Unknown` observations never replace a known
    /// state.
    pub fn advance(cached: JobState, observed: JobState) -> JobState {
        match (cached.rank(), observed.rank()) {
            (_, None) => cached,
            (None, Some(_)) => observed,
            (Some(_), Some(_)) if cached.is_terminal() => cached,
            (Some(old), Some(new)) if new < old => cached,
            _ => observed,
        }
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Pending => "PENDING",
            Self::Running => "RUNNING",
            Self::Completed => "COMPLETED",
            Self::Failed => "FAILED",
            Self::Cancelled => "CANCELLED",
            Self::Timeout => "TIMEOUT",
            Self::NodeFail => "NODE_FAIL",
            Self::Unknown => "UNKNOWN",
        })
    }
}

impl FromStr for JobState {
    type Err = InvalidState;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_uppercase().as_str() {
            "PENDING" => Ok(Self::Pending),
            "RUNNING" => Ok(Self::Running),
            "COMPLETED" => Ok(Self::Completed),
            "FAILED" => Ok(Self::Failed),
            "CANCELLED" => Ok(Self::Cancelled),
            "TIMEOUT" => Ok(Self::Timeout),
            "NODE_FAIL" => Ok(Self::NodeFail),
            "UNKNOWN" => Ok(Self::Unknown),
            _ => Err(InvalidState(value.to_string())),
        }
    }
}
