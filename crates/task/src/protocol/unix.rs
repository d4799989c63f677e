//! Newline-delimited JSON-RPC over a Unix domain socket
//!
//! Every call opens its own connection: the request is written as one line,
//! then reply lines are read until the server closes the connection.

use super::transport::{BuildServerTransport, FrameStream};
use super::types::{JsonRpcError, JsonRpcFrame, JsonRpcRequest, JsonRpcResponse, ServerFrame};
use async_trait::async_trait;
use futures::StreamExt;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use taskgate_core::{Error, Result, JSONRPC_VERSION};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixStream;
use tracing::trace;

/// Transport talking to a build server listening on a Unix socket
#[derive(Debug)]
pub struct UnixSocketTransport {
    pub(crate) socket_path: PathBuf,
    next_id: AtomicU64,
}

impl UnixSocketTransport {
    pub fn new(socket_path: impl Into<PathBuf>) -> Self {
        Self {
            socket_path: socket_path.into(),
            next_id: AtomicU64::new(1),
        }
    }

    fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Connect and write the request line
    async fn send_request(&self, method: &str, params: serde_json::Value) -> Result<(UnixStream, u64)> {
        let mut stream = UnixStream::connect(&self.socket_path)
            .await
            .map_err(|e| Error::transport_io(self.endpoint(), e))?;

        let request = JsonRpcRequest {
            jsonrpc: JSONRPC_VERSION.to_string(),
            method: method.to_string(),
            params,
            id: self.next_id(),
        };
        let request_json = serde_json::to_string(&request)?;
        trace!(method, id = request.id, "sending request");

        stream
            .write_all(format!("{request_json}\n").as_bytes())
            .await
            .map_err(|e| Error::transport_io(self.endpoint(), e))?;

        Ok((stream, request.id))
    }
}

#[async_trait]
impl BuildServerTransport for UnixSocketTransport {
    async fn open_stream(&self, method: &str, params: serde_json::Value) -> Result<FrameStream> {
        let (stream, id) = self.send_request(method, params).await?;
        let lines = BufReader::new(stream).lines();
        let method = method.to_string();
        let endpoint = self.endpoint();

        let frames = futures::stream::unfold(Some(lines), move |state| {
            let method = method.clone();
            let endpoint = endpoint.clone();
            async move {
                let mut lines = state?;
                loop {
                    match lines.next_line().await {
                        Ok(Some(line)) if line.trim().is_empty() => continue,
                        Ok(Some(line)) => {
                            return match parse_frame_line(&line, id, &method) {
                                Ok(frame) => Some((Ok(frame), Some(lines))),
                                // Stop reading after the first failure
                                Err(e) => Some((Err(e), None)),
                            };
                        }
                        Ok(None) => return None,
                        Err(e) => return Some((Err(Error::transport_io(endpoint, e)), None)),
                    }
                }
            }
        });

        Ok(frames.boxed())
    }

    async fn unary(&self, method: &str, params: serde_json::Value) -> Result<serde_json::Value> {
        let (stream, id) = self.send_request(method, params).await?;

        let mut buf_reader = BufReader::new(stream);
        let mut response_line = String::new();
        buf_reader
            .read_line(&mut response_line)
            .await
            .map_err(|e| Error::transport_io(self.endpoint(), e))?;

        if response_line.trim().is_empty() {
            return Err(Error::transport(
                self.endpoint(),
                format!("server closed the connection without answering '{method}'"),
            ));
        }

        let response: JsonRpcResponse<serde_json::Value> = serde_json::from_str(&response_line)
            .map_err(|e| {
                Error::protocol(format!(
                    "failed to parse response: {e} - Response: {}",
                    response_line.trim_end()
                ))
            })?;

        validate_envelope(&response.jsonrpc, id, response.id)?;

        if let Some(error) = response.error {
            return Err(server_error(method, error));
        }

        response
            .result
            .ok_or_else(|| Error::protocol(format!("server returned no result for '{method}'")))
    }

    fn endpoint(&self) -> String {
        self.socket_path.display().to_string()
    }
}

fn parse_frame_line(line: &str, id: u64, method: &str) -> Result<ServerFrame> {
    let frame: JsonRpcFrame = serde_json::from_str(line)
        .map_err(|e| Error::protocol(format!("malformed frame: {e} - Line: {line}")))?;

    validate_envelope(&frame.jsonrpc, id, frame.id)?;

    if let Some(error) = frame.error {
        return Err(server_error(method, error));
    }

    frame
        .frame
        .ok_or_else(|| Error::protocol("frame line carried neither a frame nor an error"))
}

fn validate_envelope(jsonrpc: &str, expected_id: u64, id: u64) -> Result<()> {
    if jsonrpc != JSONRPC_VERSION {
        return Err(Error::protocol(format!(
            "invalid JSON-RPC version: expected '{JSONRPC_VERSION}', got '{jsonrpc}'"
        )));
    }
    if id != expected_id {
        return Err(Error::protocol(format!(
            "response ID mismatch: expected {expected_id}, got {id}"
        )));
    }
    Ok(())
}

fn server_error(method: &str, error: JsonRpcError) -> Error {
    let message = match error.data {
        Some(data) => format!("{} - Additional data: {data}", error.message),
        None => error.message,
    };
    Error::server(method, error.code, message)
}
