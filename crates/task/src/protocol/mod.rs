//! Build server wire protocol
//!
//! - JSON-RPC 2.0 over a Unix domain socket, one connection per call
//! - Streaming methods (`getBuild`, `runBuild`) answer with frame lines until EOF
//! - Unary methods (cancel, daemon status and stop) answer with one line
//! - The server is launched as `<executable> <socket-path>`

mod launcher;
mod transport;
mod types;
mod unix;

pub use launcher::ExecutableLauncher;
pub use transport::{BuildServerTransport, FrameStream};
pub use types::*;
pub use unix::UnixSocketTransport;
