//! Domain types shared by the coordination layer
//!
//! Everything here is a plain value: identities, discovered task metadata,
//! invocation records and the small state enums that the components report.

use crate::errors::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

/// Composite key of a discovered task.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TaskIdentity {
    pub project_root: PathBuf,
    pub task_path: String,
    #[serde(default)]
    pub project_name: String,
}

impl TaskIdentity {
    pub fn new(
        project_root: impl Into<PathBuf>,
        task_path: impl Into<String>,
        project_name: impl Into<String>,
    ) -> Self {
        Self {
            project_root: project_root.into(),
            task_path: task_path.into(),
            project_name: project_name.into(),
        }
    }

    pub fn project_root(&self) -> &Path {
        &self.project_root
    }
}

impl fmt::Display for TaskIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.project_name.is_empty() {
            write!(f, "{}::{}", self.project_root.display(), self.task_path)
        } else {
            write!(
                f,
                "{}::{}:{}",
                self.project_root.display(),
                self.project_name,
                self.task_path
            )
        }
    }
}

/// Cached metadata for one invocable task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskDefinition {
    pub identity: TaskIdentity,
    /// Human readable path such as `app:build`
    pub script_path: String,
    #[serde(default)]
    pub group: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    pub build_file: PathBuf,
    pub root_project: String,
    #[serde(default)]
    pub is_default: bool,
    #[serde(default)]
    pub debuggable: bool,
}

/// One requested run of a task with a specific argument string.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct InvocationRecord {
    pub identity: TaskIdentity,
    pub args: String,
    #[serde(default)]
    pub debug: bool,
}

impl InvocationRecord {
    pub fn new(identity: TaskIdentity, args: impl Into<String>, debug: bool) -> Self {
        Self {
            identity,
            args: args.into(),
            debug,
        }
    }

    /// Session store key: identity plus argument string.
    pub fn key(&self) -> InvocationKey {
        InvocationKey {
            identity: self.identity.clone(),
            args: self.args.clone(),
        }
    }
}

/// Key under which output sessions are grouped.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct InvocationKey {
    pub identity: TaskIdentity,
    pub args: String,
}

impl fmt::Display for InvocationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.args.is_empty() {
            write!(f, "{}", self.identity)
        } else {
            write!(f, "{} {}", self.identity, self.args)
        }
    }
}

/// Observable lifecycle of an invocation. Absence from the tracker is `Idle`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LifecycleState {
    Idle,
    Running,
    Cancelling,
    QueuedForRestart,
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            LifecycleState::Idle => "idle",
            LifecycleState::Running => "running",
            LifecycleState::Cancelling => "cancelling",
            LifecycleState::QueuedForRestart => "queued-for-restart",
        };
        f.write_str(name)
    }
}

/// Rule deciding which earlier output sessions are disposed before a new run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ReusePolicy {
    #[default]
    Off,
    PerTask,
    Global,
}

impl FromStr for ReusePolicy {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "off" => Ok(ReusePolicy::Off),
            "per-task" | "pertask" | "task" => Ok(ReusePolicy::PerTask),
            "global" | "all" => Ok(ReusePolicy::Global),
            other => Err(Error::configuration(format!(
                "invalid reuse policy '{other}', expected one of: off, per-task, global"
            ))),
        }
    }
}

impl fmt::Display for ReusePolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ReusePolicy::Off => "off",
            ReusePolicy::PerTask => "per-task",
            ReusePolicy::Global => "global",
        };
        f.write_str(name)
    }
}

/// Lifecycle of the build server connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Ready,
    Failed,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Ready => "ready",
            ConnectionState::Failed => "failed",
        };
        f.write_str(name)
    }
}
