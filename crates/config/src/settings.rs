//! Client settings handed to the coordination components at construction
//!
//! Settings are read once, from an optional JSON file overlaid with
//! `TASKGATE_*` environment variables, and then treated as immutable values.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use taskgate_core::{
    Error, ResultExt, Result, ReusePolicy, DEFAULT_CONNECT_TIMEOUT_SECS, DEFAULT_SOCKET_NAME,
    TASKGATE_CONNECT_TIMEOUT_VAR, TASKGATE_DEBUG_VAR, TASKGATE_REUSE_POLICY_VAR,
    TASKGATE_ROOTS_VAR, TASKGATE_SERVER_VAR, TASKGATE_SOCKET_VAR, TASKGATE_SUPPRESS_CONFIRM_VAR,
};

/// Immutable client configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ClientSettings {
    /// Deadline for the initial connection to the build server, in seconds
    pub connect_timeout_secs: u64,

    /// Output session reuse policy applied before every run
    pub reuse_policy: ReusePolicy,

    /// Verbose logging
    pub debug_logging: bool,

    /// Skip the confirmation prompt before restarting a running task
    pub suppress_confirmation: bool,

    /// Project roots whose tasks make up the catalog
    pub project_roots: Vec<PathBuf>,

    /// Unix socket the build server listens on
    pub socket_path: PathBuf,

    /// Server executable to launch when no server is running
    pub server_executable: Option<PathBuf>,
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self {
            connect_timeout_secs: DEFAULT_CONNECT_TIMEOUT_SECS,
            reuse_policy: ReusePolicy::default(),
            debug_logging: false,
            suppress_confirmation: false,
            project_roots: Vec::new(),
            socket_path: std::env::temp_dir().join(DEFAULT_SOCKET_NAME),
            server_executable: None,
        }
    }
}

impl ClientSettings {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    /// Defaults overlaid with the environment.
    pub fn from_env() -> Result<Self> {
        let mut settings = Self::default();
        settings.apply_env()?;
        Ok(settings)
    }

    /// Read a JSON settings file, then overlay the environment.
    pub fn load(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .map_err(|e| Error::file_system(path, "read settings", e))?;
        let mut settings: ClientSettings = serde_json::from_str(&contents)
            .with_context(|| format!("invalid settings file '{}'", path.display()))?;
        settings.apply_env()?;
        Ok(settings)
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Some(value) = env_value(TASKGATE_CONNECT_TIMEOUT_VAR) {
            self.connect_timeout_secs = value.parse().map_err(|_| {
                Error::configuration(format!(
                    "{TASKGATE_CONNECT_TIMEOUT_VAR} must be a number of seconds, got '{value}'"
                ))
            })?;
        }
        if let Some(value) = env_value(TASKGATE_REUSE_POLICY_VAR) {
            self.reuse_policy = value.parse()?;
        }
        if let Some(value) = env_value(TASKGATE_DEBUG_VAR) {
            self.debug_logging = parse_flag(TASKGATE_DEBUG_VAR, &value)?;
        }
        if let Some(value) = env_value(TASKGATE_SUPPRESS_CONFIRM_VAR) {
            self.suppress_confirmation = parse_flag(TASKGATE_SUPPRESS_CONFIRM_VAR, &value)?;
        }
        if let Some(value) = env_value(TASKGATE_ROOTS_VAR) {
            self.project_roots = std::env::split_paths(&value)
                .filter(|p| !p.as_os_str().is_empty())
                .collect();
        }
        if let Some(value) = env_value(TASKGATE_SOCKET_VAR) {
            self.socket_path = PathBuf::from(value);
        }
        if let Some(value) = env_value(TASKGATE_SERVER_VAR) {
            self.server_executable = Some(PathBuf::from(value));
        }
        self.validate()
    }

    /// Check values after every overlay has been applied.
    pub fn validate(&self) -> Result<()> {
        if self.connect_timeout_secs == 0 {
            return Err(Error::configuration(
                "connect timeout must be at least one second",
            ));
        }
        if self.socket_path.as_os_str().is_empty() {
            return Err(Error::configuration("socket path must not be empty"));
        }
        Ok(())
    }
}

fn env_value(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.trim().is_empty())
}

fn parse_flag(name: &str, value: &str) -> Result<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        other => Err(Error::configuration(format!(
            "{name} must be a boolean, got '{other}'"
        ))),
    }
}
