use crate::clock::RetryPolicy;
use serde::{Deserialize, Serialize};
use std::{fs, io::Error, path::Path, time::Duration};
use thiserror::Error;
use tracing::{error, warn};

#[derive(Error, Debug)]
pub enum ConfigErrors {
    #[error("Failed to read config file")]
    Io(#[from] Error),
    #[error("Config is not valid YAML: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("Client '{0}' not supported, use `simulated` or `remote`")]
    UnsupportedClient(String),
    #[error("The remote client requires a `remote` section")]
    MissingRemote,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default)]
#[serde(deny_unknown_fields)]
pub struct RunnerConfig {
    // job client selection, see Clients::load for the selection process
    #[serde(default)]
    pub client: ClientConfig,
    // connection details, only read by the remote client
    pub remote: Option<RemoteConfig>,
    #[serde(default)]
    pub polling: PollingConfig,
    #[serde(default)]
    pub output: OutputConfig,
}

#[derive(Deserialize, Serialize, Clone, Debug)]
#[serde(deny_unknown_fields)]
pub struct ClientConfig {
    // `simulated` or `remote`
    pub name: String,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            name: "remote".to_string(),
        }
    }
}

#[derive(Deserialize, Serialize, Clone, Copy, Debug, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Transport {
    /// OpenSSH client with a multiplexed master connection
    #[default]
    Ssh,
    /// commands run through the local shell, e.g. on a login node
    Local,
}

#[derive(Deserialize, Serialize, Clone, Debug)]
#[serde(deny_unknown_fields)]
pub struct RemoteConfig {
    #[serde(default)]
    pub transport: Transport,
    #[serde(default)]
    pub host: String,
    #[serde(default)]
    pub user: String,
    #[serde(default = "default_port")]
    pub port: u16,
    pub identity_file: Option<String>,
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
    #[serde(default = "default_command_timeout")]
    pub command_timeout_secs: u64,
    // let ssh prompt for credentials on the terminal during connect
    #[serde(default)]
    pub interactive_auth: bool,
    // remote directory scripts are uploaded to and submitted from, defaults to the login dir
    pub work_dir: Option<String>,
}

impl RemoteConfig {
    pub fn new(host: impl Into<String>, user: impl Into<String>) -> Self {
        Self {
            transport: Transport::Ssh,
            host: host.into(),
            user: user.into(),
            port: default_port(),
            identity_file: None,
            connect_timeout_secs: default_connect_timeout(),
            command_timeout_secs: default_command_timeout(),
            interactive_auth: false,
            work_dir: None,
        }
    }

    pub fn local() -> Self {
        Self {
            transport: Transport::Local,
            ..Self::new("localhost", "")
        }
    }

    /// `user@host`, or just the host if no user is configured
    pub fn destination(&self) -> String {
        if self.user.is_empty() {
            self.host.clone()
        } else {
            format!("{}@{}", self.user, self.host)
        }
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_secs)
    }
}

#[derive(Deserialize, Serialize, Clone, Debug)]
#[serde(deny_unknown_fields)]
pub struct PollingConfig {
    #[serde(default = "default_poll_interval")]
    pub interval_ms: u64,
    // give up monitoring after this long, unbounded if missing
    pub timeout_secs: Option<u64>,
}

impl PollingConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_secs.map(Duration::from_secs)
    }
}

impl Default for PollingConfig {
    fn default() -> Self {
        Self {
            interval_ms: default_poll_interval(),
            timeout_secs: None,
        }
    }
}

#[derive(Deserialize, Serialize, Clone, Debug)]
#[serde(deny_unknown_fields)]
pub struct OutputConfig {
    #[serde(default = "default_output_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_output_interval")]
    pub interval_ms: u64,
}

impl OutputConfig {
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.max_attempts, Duration::from_millis(self.interval_ms))
    }
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_output_attempts(),
            interval_ms: default_output_interval(),
        }
    }
}

impl RunnerConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigErrors> {
        Self::from_yaml(&fs::read_to_string(path)?)
    }

    pub fn from_yaml(content: &str) -> Result<Self, ConfigErrors> {
        Ok(serde_yaml::from_str(content)?)
    }

    pub fn simulated() -> Self {
        Self {
            client: ClientConfig {
                name: "simulated".to_string(),
            },
            ..Default::default()
        }
    }

    /// Validate and normalize the config, returns true if any error was found.
    ///
    /// Every problem is logged instead of stopping at the first one, to make fixing a config a
    /// single round trip.
    pub fn preflight_checks(&mut self) -> bool {
        let mut contains_error = false;

        self.client.name = self.client.name.trim().to_lowercase();

        match self.client.name.as_str() {
            "simulated" => {
                if self.remote.is_some() {
                    warn!("client.name is `simulated`, the remote section will be ignored");
                }
            }
            "remote" => match self.remote {
                Some(ref remote) => {
                    if remote.transport == Transport::Ssh {
                        if remote.host.trim().is_empty() {
                            error!("remote.host must not be empty for the ssh transport");
                            contains_error = true;
                        }
                        if remote.user.trim().is_empty() {
                            warn!("remote.user is empty, ssh will pick the local user name");
                        }
                    }
                    if remote.connect_timeout_secs == 0 {
                        error!("remote.connect_timeout_secs cannot be 0");
                        contains_error = true;
                    }
                    if remote.command_timeout_secs == 0 {
                        error!("remote.command_timeout_secs cannot be 0");
                        contains_error = true;
                    }
                }
                None => {
                    error!("client.name is `remote` but no remote section was given");
                    contains_error = true;
                }
            },
            name => {
                error!("client.name ({name}) is not supported, please use `simulated` or `remote`");
                contains_error = true;
            }
        }

        if self.polling.interval_ms == 0 {
            error!("polling.interval_ms cannot be 0, this would poll the scheduler in a busy loop");
            contains_error = true;
        }

        if self.output.max_attempts == 0 {
            error!("output.max_attempts cannot be 0, output would never be read");
            contains_error = true;
        }

        if self.output.interval_ms == 0 {
            warn!("output.interval_ms is 0, retries will not wait for the filesystem to catch up");
        }

        contains_error
    }
}

fn default_port() -> u16 {
    22
}

fn default_connect_timeout() -> u64 {
    10
}

fn default_command_timeout() -> u64 {
    120
}

fn default_poll_interval() -> u64 {
    2000
}

fn default_output_attempts() -> u32 {
    10
}

fn default_output_interval() -> u64 {
    3000
}
