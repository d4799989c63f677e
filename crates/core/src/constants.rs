/// Constants used throughout the taskgate codebase
// Environment variable names
pub const TASKGATE_CONNECT_TIMEOUT_VAR: &str = "TASKGATE_CONNECT_TIMEOUT";
pub const TASKGATE_REUSE_POLICY_VAR: &str = "TASKGATE_REUSE_TERMINALS";
pub const TASKGATE_DEBUG_VAR: &str = "TASKGATE_DEBUG";
pub const TASKGATE_SUPPRESS_CONFIRM_VAR: &str = "TASKGATE_SUPPRESS_CONFIRMATION";
pub const TASKGATE_ROOTS_VAR: &str = "TASKGATE_PROJECT_ROOTS";
pub const TASKGATE_SOCKET_VAR: &str = "TASKGATE_SOCKET";
pub const TASKGATE_SERVER_VAR: &str = "TASKGATE_SERVER";
pub const TASKGATE_LOG_VAR: &str = "TASKGATE_LOG";

// Defaults
pub const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 30;
pub const DEFAULT_SOCKET_NAME: &str = "taskgate-server.sock";

// JSON-RPC
pub const JSONRPC_VERSION: &str = "2.0";
