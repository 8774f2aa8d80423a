//! One authenticated connection to a remote host.
//!
//! `RemoteSession` drives the OpenSSH client. The initial connect starts a master connection
//! (`ControlMaster`), every later command and file transfer is multiplexed over that single
//! socket, so credentials are only negotiated once. A session never reconnects by itself, once
//! the master is gone every operation fails with `SessionError::Disconnected`.

pub mod fake;

use crate::{
    config::{RemoteConfig, Transport},
    protocol::shell_quote,
};
use std::{
    io::{self, Read, Write},
    os::unix::process::CommandExt,
    path::{Path, PathBuf},
    process::{Command, Stdio},
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    thread::{self, JoinHandle},
    time::Duration,
};
use thiserror::Error;
use tracing::{debug, error, info, instrument, trace, warn};
use wait_timeout::ChildExt;

/// ssh reserves this exit status for its own errors
const SSH_FAILURE_STATUS: i32 = 255;

#[derive(Error, Debug)]
pub enum SessionError {
    #[error("Failed to connect to {target}: {reason}")]
    Connect { target: String, reason: String },
    #[error("Failed to spawn {program}")]
    Spawn {
        program: &'static str,
        #[source]
        source: io::Error,
    },
    #[error("`{command}` timed out after {after:?}")]
    Timeout { command: String, after: Duration },
    #[error("Connection lost: {0}")]
    Disconnected(String),
    #[error("`{command}` exited with {status:?}: {stderr}")]
    Remote {
        command: String,
        status: Option<i32>,
        stderr: String,
    },
    #[error("I/O error while waiting for the remote")]
    Io(#[from] io::Error),
}

impl SessionError {
    /// True if the session itself is unusable, as opposed to a single command failing
    pub fn is_transport(&self) -> bool {
        !matches!(self, Self::Remote { .. })
    }
}

/// Exit status and captured streams of a remote command
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CommandOutput {
    /// `None` if the process was terminated by a signal
    pub status: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn ok(stdout: impl Into<String>) -> Self {
        Self {
            status: Some(0),
            stdout: stdout.into(),
            stderr: String::new(),
        }
    }

    pub fn failed(status: i32, stderr: impl Into<String>) -> Self {
        Self {
            status: Some(status),
            stdout: String::new(),
            stderr: stderr.into(),
        }
    }

    pub fn success(&self) -> bool {
        self.status == Some(0)
    }
}

/// Command execution and file transfer on a single remote host.
///
/// Implementations serve one operation at a time, callers sharing a session must serialize
/// access themselves.
pub trait Session: Send {
    /// Run a shell command, a non-zero exit is reported in the output and not as an error
    fn exec(&self, command: &str) -> Result<CommandOutput, SessionError>;

    /// Write `contents` to `path`, replacing any existing file
    fn write_file(&self, path: &str, contents: &[u8]) -> Result<(), SessionError>;

    /// Read the full content of `path`
    fn read_file(&self, path: &str) -> Result<Vec<u8>, SessionError>;
}

impl<S: Session + Sync> Session for Arc<S> {
    fn exec(&self, command: &str) -> Result<CommandOutput, SessionError> {
        self.as_ref().exec(command)
    }

    fn write_file(&self, path: &str, contents: &[u8]) -> Result<(), SessionError> {
        self.as_ref().write_file(path, contents)
    }

    fn read_file(&self, path: &str) -> Result<Vec<u8>, SessionError> {
        self.as_ref().read_file(path)
    }
}

struct RawOutput {
    status: Option<i32>,
    stdout: Vec<u8>,
    stderr: Vec<u8>,
}

impl RawOutput {
    fn stderr_lossy(&self) -> String {
        String::from_utf8_lossy(&self.stderr).trim().to_string()
    }
}

static CONTROL_SEQUENCE: AtomicU64 = AtomicU64::new(0);

fn control_socket_path() -> PathBuf {
    std::env::temp_dir().join(format!(
        "slurmgate-{}-{}.sock",
        std::process::id(),
        CONTROL_SEQUENCE.fetch_add(1, Ordering::SeqCst)
    ))
}

#[derive(Debug)]
pub struct RemoteSession {
    config: RemoteConfig,
    // ssh only, path of the master connection socket
    control_path: Option<PathBuf>,
}

impl RemoteSession {
    /// Open the session, failures are returned and never retried.
    #[instrument(skip(config), fields(target = %config.destination()), level = "info")]
    pub fn connect(config: &RemoteConfig) -> Result<Self, SessionError> {
        match config.transport {
            Transport::Local => {
                debug!("Using the local shell as session");

                Ok(Self {
                    config: config.clone(),
                    control_path: None,
                })
            }
            Transport::Ssh => {
                let control_path = control_socket_path();
                let mut command = Command::new("ssh");
                command
                    .args(base_args(config, &control_path))
                    .args(["-o", "ControlMaster=yes", "-o", "ControlPersist=yes"])
                    .arg(config.destination())
                    .arg("true");

                // a password prompt needs the terminal, everything else stays out of reach of ^C
                if !config.interactive_auth {
                    command.process_group(0);
                }

                // the master detaches once `true` finished, the client process exits right after
                let timeout = config.connect_timeout() + Duration::from_secs(5);
                let stdin = if config.interactive_auth {
                    Stdio::inherit()
                } else {
                    Stdio::null()
                };

                let output = run_process(command, "ssh", stdin, None, timeout).map_err(|error| {
                    SessionError::Connect {
                        target: config.destination(),
                        reason: error.to_string(),
                    }
                })?;

                if output.status != Some(0) {
                    let reason = output.stderr_lossy();
                    error!(status = ?output.status, "ssh refused the connection: {reason}");

                    return Err(SessionError::Connect {
                        target: config.destination(),
                        reason,
                    });
                }

                info!(control_path = ?control_path, "Connected");

                Ok(Self {
                    config: config.clone(),
                    control_path: Some(control_path),
                })
            }
        }
    }

    pub fn config(&self) -> &RemoteConfig {
        &self.config
    }

    fn command(&self, remote_command: &str) -> Result<(Command, &'static str), SessionError> {
        let (mut command, program) = match self.control_path {
            Some(ref control_path) => {
                // without the socket ssh would silently open a fresh connection
                if !control_path.exists() {
                    return Err(SessionError::Disconnected(format!(
                        "master connection to {} is gone",
                        self.config.destination()
                    )));
                }

                let mut command = Command::new("ssh");
                command
                    .args(base_args(&self.config, control_path))
                    .args(["-o", "ControlMaster=no"])
                    .arg(self.config.destination())
                    .arg("--")
                    .arg(remote_command);

                (command, "ssh")
            }
            None => {
                let mut command = Command::new("sh");
                command.arg("-c").arg(remote_command);

                (command, "sh")
            }
        };

        // ^C is handled by the monitor, it must not kill commands in flight
        command.process_group(0);

        Ok((command, program))
    }

    fn run(&self, remote_command: &str, input: Option<Vec<u8>>) -> Result<RawOutput, SessionError> {
        let (command, program) = self.command(remote_command)?;
        let stdin = if input.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        };

        let output = run_process(
            command,
            program,
            stdin,
            input,
            self.config.command_timeout(),
        )
        .map_err(|error| match error {
            SessionError::Timeout { after, .. } => SessionError::Timeout {
                command: remote_command.to_string(),
                after,
            },
            other => other,
        })?;

        if self.control_path.is_some() && output.status == Some(SSH_FAILURE_STATUS) {
            let reason = output.stderr_lossy();
            warn!(command = remote_command, "ssh transport failed: {reason}");

            return Err(SessionError::Disconnected(reason));
        }

        Ok(output)
    }
}

impl Session for RemoteSession {
    #[instrument(skip(self), level = "debug")]
    fn exec(&self, command: &str) -> Result<CommandOutput, SessionError> {
        let output = self.run(command, None)?;
        trace!(status = ?output.status, "Command finished");

        Ok(CommandOutput {
            status: output.status,
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }

    #[instrument(skip(self, contents), fields(bytes = contents.len()), level = "debug")]
    fn write_file(&self, path: &str, contents: &[u8]) -> Result<(), SessionError> {
        let command = format!("cat > {}", shell_quote(path));
        let output = self.run(&command, Some(contents.to_vec()))?;

        if output.status == Some(0) {
            Ok(())
        } else {
            Err(SessionError::Remote {
                status: output.status,
                stderr: output.stderr_lossy(),
                command,
            })
        }
    }

    #[instrument(skip(self), level = "debug")]
    fn read_file(&self, path: &str) -> Result<Vec<u8>, SessionError> {
        let command = format!("cat -- {}", shell_quote(path));
        let output = self.run(&command, None)?;

        if output.status == Some(0) {
            Ok(output.stdout)
        } else {
            Err(SessionError::Remote {
                status: output.status,
                stderr: output.stderr_lossy(),
                command,
            })
        }
    }
}

impl Drop for RemoteSession {
    fn drop(&mut self) {
        if let Some(ref control_path) = self.control_path {
            let result = Command::new("ssh")
                .arg("-S")
                .arg(control_path)
                .args(["-O", "exit"])
                .arg(self.config.destination())
                .stdin(Stdio::null())
                .stdout(Stdio::null())
                .stderr(Stdio::null())
                .status();

            match result {
                Ok(status) => debug!(status = ?status.code(), "Closed master connection"),
                Err(error) => warn!(error = ?error, "Failed to close master connection"),
            }
        }
    }
}

fn base_args(config: &RemoteConfig, control_path: &Path) -> Vec<String> {
    let mut args = vec![
        "-o".to_string(),
        format!("ControlPath={}", control_path.display()),
        "-o".to_string(),
        format!("ConnectTimeout={}", config.connect_timeout_secs),
        "-p".to_string(),
        config.port.to_string(),
    ];

    if !config.interactive_auth {
        args.push("-o".to_string());
        args.push("BatchMode=yes".to_string());
    }

    if let Some(ref identity) = config.identity_file {
        args.push("-i".to_string());
        args.push(identity.clone());
    }

    args
}

fn drain(mut pipe: impl Read + Send + 'static) -> JoinHandle<Vec<u8>> {
    thread::spawn(move || {
        let mut buffer = Vec::new();
        if let Err(error) = pipe.read_to_end(&mut buffer) {
            debug!(error = ?error, "Pipe closed early");
        }
        buffer
    })
}

fn join(handle: Option<JoinHandle<Vec<u8>>>) -> Vec<u8> {
    handle
        .and_then(|handle| handle.join().ok())
        .unwrap_or_default()
}

/// Spawn `command` and wait at most `timeout` for it, streams are drained on helper threads so
/// a chatty process can't fill a pipe and stall.
fn run_process(
    mut command: Command,
    program: &'static str,
    stdin: Stdio,
    input: Option<Vec<u8>>,
    timeout: Duration,
) -> Result<RawOutput, SessionError> {
    let mut child = command
        .stdin(stdin)
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|source| SessionError::Spawn { program, source })?;

    let stdout = child.stdout.take().map(drain);
    let stderr = child.stderr.take().map(drain);
    let writer = match (child.stdin.take(), input) {
        (Some(mut pipe), Some(input)) => Some(thread::spawn(move || {
            // a process exiting early closes the pipe, its exit status tells the real story
            if let Err(error) = pipe.write_all(&input) {
                debug!(error = ?error, "Failed to write process input");
            }
        })),
        _ => None,
    };

    let status = match child.wait_timeout(timeout)? {
        Some(status) => status,
        None => {
            warn!(program, ?timeout, "Process ran into timeout, killing it");
            child.kill()?;
            child.wait()?;

            return Err(SessionError::Timeout {
                command: program.to_string(),
                after: timeout,
            });
        }
    };

    if let Some(writer) = writer {
        let _ = writer.join();
    }

    Ok(RawOutput {
        status: status.code(),
        stdout: join(stdout),
        stderr: join(stderr),
    })
}
