use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, instrument};

pub mod properties;
pub use properties::Properties;

pub const DEFAULT_INSTALL_DIR: &str = "/var/lib/jobdock";
pub const DEFAULT_RUNTIME_BINARY: &str = "docker";
pub const INSTALL_DIR_ENV: &str = "JOBDOCK_INSTALL_DIR";
pub const RUNTIME_BINARY_ENV: &str = "JOBDOCK_CONTAINER_RUNTIME";

const AGENT_DIR_NAME: &str = "agent";
const PROPERTIES_FILE_NAME: &str = "properties.sh";
const LAUNCH_SCRIPT_NAME: &str = "launch_agent.sh";
const INIT_SCRIPT_NAME: &str = "init_agent.sh";

const DEFAULT_ACCEPT_TIMEOUT: Duration = Duration::from_secs(10);
const DEFAULT_BIND_RETRY_DELAY: Duration = Duration::from_millis(250);
const DEFAULT_OUTBOUND_GRACE: Duration = Duration::from_secs(2);

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Config file not found: {path}")]
    ConfigFileNotFound { path: String },

    #[error("Missing required setting: {key}")]
    MissingKey { key: String },

    #[error("Invalid value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error("Failed to parse {source_name}: {message}")]
    ParseError {
        source_name: String,
        message: String,
    },

    #[error("IO error: {message}")]
    IoError { message: String },
}

/// Everything a session needs to know about the host installation and the
/// connection the in-container agent dials back on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionConfig {
    /// Host installation root. The agent directory is mounted read-only at
    /// this same path inside every job container.
    pub install_dir: PathBuf,
    pub agent_dir: PathBuf,
    pub connect_address: String,
    pub connect_port: u16,
    pub accept_timeout: Duration,
    pub bind_retry_delay: Duration,
    pub outbound_grace: Duration,
    pub runtime_binary: String,
}

impl SessionConfig {
    /// Resolve the install directory and runtime binary from the environment,
    /// then load the agent properties file beneath it.
    pub fn from_env() -> Result<Self, ConfigError> {
        let install_dir = env::var(INSTALL_DIR_ENV)
            .ok()
            .filter(|v| !v.trim().is_empty())
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_INSTALL_DIR));

        let mut config = Self::load(install_dir)?;

        if let Ok(binary) = env::var(RUNTIME_BINARY_ENV) {
            if !binary.trim().is_empty() {
                config.runtime_binary = binary.trim().to_string();
            }
        }

        Ok(config)
    }

    #[instrument]
    pub fn load(install_dir: PathBuf) -> Result<Self, ConfigError> {
        let properties_path = install_dir.join(AGENT_DIR_NAME).join(PROPERTIES_FILE_NAME);
        let properties = Properties::load(&properties_path)?;
        Self::from_properties(install_dir, &properties)
    }

    pub fn from_properties(
        install_dir: PathBuf,
        properties: &Properties,
    ) -> Result<Self, ConfigError> {
        let connect_address = properties.require("CONNECT_ADDRESS")?.trim().to_string();
        if connect_address.is_empty() {
            return Err(ConfigError::InvalidValue {
                key: "CONNECT_ADDRESS".to_string(),
                message: "must not be empty".to_string(),
            });
        }

        let port = properties.require("CONNECT_PORT")?;
        let connect_port = port
            .trim()
            .parse::<u16>()
            .map_err(|e| ConfigError::InvalidValue {
                key: "CONNECT_PORT".to_string(),
                message: format!("'{}': {}", port, e),
            })?;

        let config = Self {
            agent_dir: install_dir.join(AGENT_DIR_NAME),
            install_dir,
            connect_address,
            connect_port,
            accept_timeout: duration_setting(properties, "ACCEPT_TIMEOUT", DEFAULT_ACCEPT_TIMEOUT)?,
            bind_retry_delay: duration_setting(
                properties,
                "BIND_RETRY_DELAY",
                DEFAULT_BIND_RETRY_DELAY,
            )?,
            outbound_grace: duration_setting(properties, "OUTBOUND_GRACE", DEFAULT_OUTBOUND_GRACE)?,
            runtime_binary: DEFAULT_RUNTIME_BINARY.to_string(),
        };

        debug!(
            "Agent connects back to {}:{} (accept timeout {:?})",
            config.connect_address, config.connect_port, config.accept_timeout
        );

        Ok(config)
    }

    /// In-container path of the launcher script.
    pub fn launch_script(&self) -> String {
        container_path(&self.install_dir, LAUNCH_SCRIPT_NAME)
    }

    /// Host path of the optional agent initialisation script.
    pub fn init_script(&self) -> PathBuf {
        self.agent_dir.join(INIT_SCRIPT_NAME)
    }

    /// In-container mount point for the agent directory.
    pub fn install_mount_path(&self) -> String {
        self.install_dir.display().to_string()
    }
}

fn container_path(dir: &Path, file: &str) -> String {
    format!("{}/{}", dir.display().to_string().trim_end_matches('/'), file)
}

fn duration_setting(
    properties: &Properties,
    key: &str,
    default: Duration,
) -> Result<Duration, ConfigError> {
    match properties.get(key).map(str::trim) {
        None | Some("") => Ok(default),
        Some(raw) => humantime::parse_duration(raw).map_err(|e| ConfigError::InvalidValue {
            key: key.to_string(),
            message: format!("'{}': {}", raw, e),
        }),
    }
}
