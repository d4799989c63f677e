//! Transport seam between the client and the build server

use super::types::ServerFrame;
use async_trait::async_trait;
use futures::stream::BoxStream;
use taskgate_core::Result;

/// Frames of one streaming call, in arrival order. The stream ends when the
/// server closes the call; an `Err` item fails the call.
pub type FrameStream = BoxStream<'static, Result<ServerFrame>>;

/// Raw request/response transport to the build server.
///
/// Parameters and replies are untyped JSON here; typing happens in
/// [`crate::client::BuildServerClient`].
#[async_trait]
pub trait BuildServerTransport: Send + Sync {
    /// Start a streaming call.
    async fn open_stream(&self, method: &str, params: serde_json::Value) -> Result<FrameStream>;

    /// Issue a call answered by exactly one reply.
    async fn unary(&self, method: &str, params: serde_json::Value) -> Result<serde_json::Value>;

    /// Human readable endpoint for logs and errors.
    fn endpoint(&self) -> String;
}
