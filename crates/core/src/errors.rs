use std::path::PathBuf;
use std::time::Duration;

/// Result type alias for taskgate operations
pub type Result<T> = std::result::Result<T, Error>;

/// Core error type for taskgate operations
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The build server could not be reached or never became ready
    #[error("connection to build server failed: {message}")]
    ConnectionFailed { message: String },

    /// I/O level failure while talking to the build server
    #[error("transport error for '{endpoint}': {message}")]
    Transport {
        endpoint: String,
        message: String,
        #[source]
        source: Option<std::io::Error>,
    },

    /// Malformed or unexpected frame received from the server
    #[error("protocol error: {message}")]
    Protocol { message: String },

    /// The server answered with a JSON-RPC error object
    #[error("server error {code} during '{method}': {message}")]
    Server {
        method: String,
        code: i32,
        message: String,
    },

    /// Operation timeout errors
    #[error("operation '{operation}' timed out after {duration:?}")]
    Timeout {
        operation: String,
        duration: Duration,
    },

    /// A task with the same identity is already running or cancelling
    #[error("task '{task}' is already running")]
    AlreadyRunning { task: String },

    /// Configuration errors
    #[error("configuration error: {message}")]
    Configuration { message: String },

    /// File system operations
    #[error("file system {operation} operation failed for '{path}': {source}")]
    FileSystem {
        path: PathBuf,
        operation: String,
        #[source]
        source: std::io::Error,
    },

    /// JSON serialization/deserialization errors
    #[error("JSON error: {message}")]
    Json {
        message: String,
        #[source]
        source: serde_json::Error,
    },
}

impl From<serde_json::Error> for Error {
    fn from(error: serde_json::Error) -> Self {
        Error::Json {
            message: error.to_string(),
            source: error,
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(error: std::io::Error) -> Self {
        Error::Transport {
            endpoint: "unknown".to_string(),
            message: error.to_string(),
            source: Some(error),
        }
    }
}

// Helper methods for creating errors with context
impl Error {
    /// Create a connection failure error
    #[must_use]
    pub fn connection_failed(message: impl Into<String>) -> Self {
        Error::ConnectionFailed {
            message: message.into(),
        }
    }

    /// Create a transport error without an underlying io error
    #[must_use]
    pub fn transport(endpoint: impl Into<String>, message: impl Into<String>) -> Self {
        Error::Transport {
            endpoint: endpoint.into(),
            message: message.into(),
            source: None,
        }
    }

    /// Create a transport error wrapping an io error
    #[must_use]
    pub fn transport_io(endpoint: impl Into<String>, source: std::io::Error) -> Self {
        Error::Transport {
            endpoint: endpoint.into(),
            message: source.to_string(),
            source: Some(source),
        }
    }

    /// Create a protocol error
    #[must_use]
    pub fn protocol(message: impl Into<String>) -> Self {
        Error::Protocol {
            message: message.into(),
        }
    }

    /// Create a server error from a JSON-RPC error reply
    #[must_use]
    pub fn server(method: impl Into<String>, code: i32, message: impl Into<String>) -> Self {
        Error::Server {
            method: method.into(),
            code,
            message: message.into(),
        }
    }

    /// Create a timeout error
    #[must_use]
    pub fn timeout(operation: impl Into<String>, duration: Duration) -> Self {
        Error::Timeout {
            operation: operation.into(),
            duration,
        }
    }

    /// Create an already-running conflict
    #[must_use]
    pub fn already_running(task: impl Into<String>) -> Self {
        Error::AlreadyRunning { task: task.into() }
    }

    /// Create a configuration error
    #[must_use]
    pub fn configuration(message: impl Into<String>) -> Self {
        Error::Configuration {
            message: message.into(),
        }
    }

    /// Create a file system error with context
    #[must_use]
    pub fn file_system(
        path: impl Into<PathBuf>,
        operation: impl Into<String>,
        source: std::io::Error,
    ) -> Self {
        Error::FileSystem {
            path: path.into(),
            operation: operation.into(),
            source,
        }
    }

    /// Transport and deadline failures, the only kinds surfaced as a
    /// connection-failed notification.
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            Error::ConnectionFailed { .. } | Error::Transport { .. } | Error::Timeout { .. }
        )
    }

    /// Benign local races that callers absorb instead of reporting.
    pub fn is_logical_conflict(&self) -> bool {
        matches!(self, Error::AlreadyRunning { .. })
    }
}

// Extension trait for adding context to Results
pub trait ResultExt<T> {
    /// Add context to a Result
    fn context(self, message: impl Into<String>) -> Result<T>;

    /// Add context with a lazy message
    fn with_context<F>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> String;
}

impl<T, E> ResultExt<T> for std::result::Result<T, E>
where
    E: Into<Error>,
{
    fn context(self, message: impl Into<String>) -> Result<T> {
        self.map_err(|e| {
            let base_error = e.into();
            Error::Configuration {
                message: format!("{}: {}", message.into(), base_error),
            }
        })
    }

    fn with_context<F>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> String,
    {
        self.map_err(|e| {
            let base_error = e.into();
            Error::Configuration {
                message: format!("{}: {}", f(), base_error),
            }
        })
    }
}
