//! JSON-RPC protocol types and structures
//!
//! Requests are single JSON-RPC 2.0 lines. Streaming methods answer with a
//! sequence of frame lines terminated by end-of-file; unary methods answer
//! with one response line.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use taskgate_core::TaskDefinition;

pub const METHOD_GET_BUILD: &str = "getBuild";
pub const METHOD_RUN_BUILD: &str = "runBuild";
pub const METHOD_CANCEL_BUILD: &str = "cancelBuild";
pub const METHOD_CANCEL_BUILDS: &str = "cancelBuilds";
pub const METHOD_DAEMON_STATUS: &str = "getDaemonsStatus";
pub const METHOD_STOP_DAEMONS: &str = "stopDaemons";
pub const METHOD_STOP_DAEMON: &str = "stopDaemon";

/// JSON-RPC 2.0 request structure
#[derive(Debug, Serialize, Deserialize)]
pub struct JsonRpcRequest<T> {
    pub jsonrpc: String,
    pub method: String,
    pub params: T,
    pub id: u64,
}

/// JSON-RPC 2.0 response structure for unary calls
#[derive(Debug, Serialize, Deserialize)]
pub struct JsonRpcResponse<T> {
    pub jsonrpc: String,
    pub result: Option<T>,
    #[serde(default)]
    pub error: Option<JsonRpcError>,
    pub id: u64,
}

/// One line of a streaming reply
#[derive(Debug, Serialize, Deserialize)]
pub struct JsonRpcFrame {
    pub jsonrpc: String,
    #[serde(default)]
    pub frame: Option<ServerFrame>,
    #[serde(default)]
    pub error: Option<JsonRpcError>,
    pub id: u64,
}

/// JSON-RPC error structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcError {
    pub code: i32,
    pub message: String,
    #[serde(default)]
    pub data: Option<serde_json::Value>,
}

/// Output stream tag
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputStream {
    Out,
    Err,
}

/// Frame of a streaming call
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum ServerFrame {
    Progress {
        message: String,
    },
    Output {
        stream: OutputStream,
        #[serde(default)]
        text: String,
    },
    Result {
        #[serde(default)]
        value: serde_json::Value,
    },
    Cancelled {
        #[serde(default)]
        message: String,
    },
}

/// Task discovery request parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GetBuildParams {
    pub project_root: PathBuf,
}

/// Result frame payload of a discovery call
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GetBuildResult {
    #[serde(default)]
    pub tasks: Vec<TaskDefinition>,
}

/// Run task request parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunBuildParams {
    pub project_root: PathBuf,
    pub task_path: String,
    #[serde(default)]
    pub project_name: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub debug: bool,
    pub cancellation_key: String,
}

/// Result frame payload of a run call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunBuildResult {
    pub exit_code: i32,
}

/// Cancel one run
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CancelBuildParams {
    pub cancellation_key: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CancelBuildReply {
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub task_running: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CancelBuildsReply {
    #[serde(default)]
    pub message: String,
}

/// Daemon status request parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DaemonStatusParams {
    pub project_root: PathBuf,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DaemonState {
    Idle,
    Busy,
    Stopped,
    Stopping,
    Canceled,
}

impl fmt::Display for DaemonState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(match self {
            DaemonState::Idle => "idle",
            DaemonState::Busy => "busy",
            DaemonState::Stopped => "stopped",
            DaemonState::Stopping => "stopping",
            DaemonState::Canceled => "canceled",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DaemonInfo {
    pub pid: String,
    pub status: DaemonState,
    #[serde(default)]
    pub info: String,
}

/// Daemons known for one project root
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DaemonStatusSnapshot {
    #[serde(default)]
    pub daemons: Vec<DaemonInfo>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StopDaemonsParams {
    pub project_root: PathBuf,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StopDaemonsReply {
    #[serde(default)]
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StopDaemonParams {
    pub pid: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StopDaemonReply {
    #[serde(default)]
    pub message: String,
}
