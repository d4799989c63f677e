//! Streaming call adapter
//!
//! Drives one [`FrameStream`] to completion, dispatching each frame to the
//! registered callback in arrival order, and resolves with the decoded result
//! payload when the stream ends cleanly.

use crate::lifecycle::{InvocationHandle, LifecycleTracker};
use crate::protocol::{FrameStream, OutputStream, ServerFrame};
use futures::StreamExt;
use serde::de::DeserializeOwned;
use std::marker::PhantomData;
use std::sync::Arc;
use taskgate_core::{Error, Result};
use tracing::{trace, warn};

/// Output produced by the task, tagged with the stream it was written to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputChunk {
    pub stream: OutputStream,
    pub bytes: Vec<u8>,
}

impl OutputChunk {
    pub fn new(stream: OutputStream, bytes: impl Into<Vec<u8>>) -> Self {
        Self {
            stream,
            bytes: bytes.into(),
        }
    }
}

type TextCallback = Box<dyn FnMut(&str) + Send>;
type OutputCallback = Box<dyn FnMut(&OutputChunk) + Send>;
type ResultCallback<R> = Box<dyn FnMut(&R) + Send>;

/// Adapter for one streaming call.
pub struct StreamingCall<R> {
    method: String,
    on_progress: Option<TextCallback>,
    on_output: Option<OutputCallback>,
    on_result: Option<ResultCallback<R>>,
    on_cancelled: Option<TextCallback>,
    acknowledge: Option<(Arc<LifecycleTracker>, InvocationHandle)>,
    _result: PhantomData<fn() -> R>,
}

impl<R: DeserializeOwned> StreamingCall<R> {
    pub fn new(method: impl Into<String>) -> Self {
        Self {
            method: method.into(),
            on_progress: None,
            on_output: None,
            on_result: None,
            on_cancelled: None,
            acknowledge: None,
            _result: PhantomData,
        }
    }

    pub fn on_progress(mut self, callback: impl FnMut(&str) + Send + 'static) -> Self {
        self.on_progress = Some(Box::new(callback));
        self
    }

    pub fn on_output(mut self, callback: impl FnMut(&OutputChunk) + Send + 'static) -> Self {
        self.on_output = Some(Box::new(callback));
        self
    }

    pub fn on_result(mut self, callback: impl FnMut(&R) + Send + 'static) -> Self {
        self.on_result = Some(Box::new(callback));
        self
    }

    pub fn on_cancelled(mut self, callback: impl FnMut(&str) + Send + 'static) -> Self {
        self.on_cancelled = Some(Box::new(callback));
        self
    }

    /// Settle `handle` in `tracker` when the server acknowledges cancellation.
    pub fn acknowledge_cancellation(
        mut self,
        tracker: Arc<LifecycleTracker>,
        handle: InvocationHandle,
    ) -> Self {
        self.acknowledge = Some((tracker, handle));
        self
    }

    /// Consume `frames` until the server closes the call.
    ///
    /// Resolves with the last result payload, or `None` when the call carried
    /// none. A `Cancelled` frame does not end the call.
    pub async fn complete(mut self, mut frames: FrameStream) -> Result<Option<R>> {
        let mut result = None;

        while let Some(frame) = frames.next().await {
            let frame = match frame {
                Ok(frame) => frame,
                Err(e) => {
                    if matches!(e, Error::Protocol { .. }) {
                        warn!(method = %self.method, error = %e, "malformed frame, failing call");
                    }
                    return Err(e);
                }
            };
            trace!(method = %self.method, ?frame, "frame received");

            match frame {
                ServerFrame::Progress { message } => {
                    if let Some(callback) = self.on_progress.as_mut() {
                        callback(&message);
                    }
                }
                ServerFrame::Output { stream, text } => {
                    if let Some(callback) = self.on_output.as_mut() {
                        callback(&OutputChunk::new(stream, text));
                    }
                }
                ServerFrame::Result { value } => {
                    let decoded: R = serde_json::from_value(value).map_err(|e| {
                        warn!(method = %self.method, error = %e, "undecodable result frame");
                        Error::protocol(format!("invalid result for '{}': {e}", self.method))
                    })?;
                    if let Some(callback) = self.on_result.as_mut() {
                        callback(&decoded);
                    }
                    result = Some(decoded);
                }
                ServerFrame::Cancelled { message } => {
                    if let Some((tracker, handle)) = &self.acknowledge {
                        tracker.settle(handle);
                    }
                    if let Some(callback) = self.on_cancelled.as_mut() {
                        callback(&message);
                    }
                }
            }
        }

        Ok(result)
    }
}
