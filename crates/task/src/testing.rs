//! In-memory test doubles for the build server
//!
//! [`ScriptedTransport`] answers calls from canned handlers, or hands open
//! streams to the test so frames can be pushed one at a time.
//! [`ManualLauncher`] reports process signals on demand.

use crate::connection::{ProcessSignals, ServerLauncher};
use crate::protocol::{BuildServerTransport, FrameStream, ServerFrame};
use async_trait::async_trait;
use futures::StreamExt;
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use taskgate_core::{Error, Result};
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;

type StreamHandler = Box<dyn Fn(&Value) -> Result<Vec<ServerFrame>> + Send + Sync>;
type UnaryHandler = Box<dyn Fn(&Value) -> Result<Value> + Send + Sync>;

/// Server side of a held stream.
pub struct ScriptedStream {
    pub method: String,
    pub params: Value,
    sender: mpsc::UnboundedSender<Result<ServerFrame>>,
}

impl ScriptedStream {
    pub fn send(&self, frame: ServerFrame) {
        let _ = self.sender.send(Ok(frame));
    }

    pub fn fail(&self, error: Error) {
        let _ = self.sender.send(Err(error));
    }

    /// End the call.
    pub fn close(self) {}
}

pub struct ScriptedTransport {
    streams: Mutex<HashMap<String, StreamHandler>>,
    unaries: Mutex<HashMap<String, UnaryHandler>>,
    held: Mutex<HashSet<String>>,
    stream_calls: Mutex<HashMap<String, usize>>,
    unary_calls: Mutex<HashMap<String, usize>>,
    opened_tx: mpsc::UnboundedSender<ScriptedStream>,
    opened_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<ScriptedStream>>,
}

impl Default for ScriptedTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl ScriptedTransport {
    pub fn new() -> Self {
        let (opened_tx, opened_rx) = mpsc::unbounded_channel();
        Self {
            streams: Mutex::new(HashMap::new()),
            unaries: Mutex::new(HashMap::new()),
            held: Mutex::new(HashSet::new()),
            stream_calls: Mutex::new(HashMap::new()),
            unary_calls: Mutex::new(HashMap::new()),
            opened_tx,
            opened_rx: tokio::sync::Mutex::new(opened_rx),
        }
    }

    /// Answer streaming calls to `method` with a fixed list of frames.
    pub fn on_stream(
        &self,
        method: &str,
        handler: impl Fn(&Value) -> Result<Vec<ServerFrame>> + Send + Sync + 'static,
    ) {
        self.streams
            .lock()
            .insert(method.to_string(), Box::new(handler));
    }

    pub fn on_unary(
        &self,
        method: &str,
        handler: impl Fn(&Value) -> Result<Value> + Send + Sync + 'static,
    ) {
        self.unaries
            .lock()
            .insert(method.to_string(), Box::new(handler));
    }

    /// Keep streams of `method` open; each one is delivered to
    /// [`ScriptedTransport::next_stream`].
    pub fn hold_streams(&self, method: &str) {
        self.held.lock().insert(method.to_string());
    }

    /// Next held stream, in the order the calls were opened.
    pub async fn next_stream(&self) -> Option<ScriptedStream> {
        self.opened_rx.lock().await.recv().await
    }

    pub fn stream_calls(&self, method: &str) -> usize {
        self.stream_calls.lock().get(method).copied().unwrap_or(0)
    }

    pub fn unary_calls(&self, method: &str) -> usize {
        self.unary_calls.lock().get(method).copied().unwrap_or(0)
    }
}

fn method_not_found(method: &str) -> Error {
    Error::server(method, -32601, format!("method '{method}' not found"))
}

#[async_trait]
impl BuildServerTransport for ScriptedTransport {
    async fn open_stream(&self, method: &str, params: Value) -> Result<FrameStream> {
        *self
            .stream_calls
            .lock()
            .entry(method.to_string())
            .or_default() += 1;

        if self.held.lock().contains(method) {
            let (sender, receiver) = mpsc::unbounded_channel();
            let stream = ScriptedStream {
                method: method.to_string(),
                params,
                sender,
            };
            let _ = self.opened_tx.send(stream);
            return Ok(UnboundedReceiverStream::new(receiver).boxed());
        }

        let frames = {
            let streams = self.streams.lock();
            let handler = streams.get(method).ok_or_else(|| method_not_found(method))?;
            handler(&params)?
        };
        Ok(futures::stream::iter(frames.into_iter().map(Ok)).boxed())
    }

    async fn unary(&self, method: &str, params: Value) -> Result<Value> {
        *self
            .unary_calls
            .lock()
            .entry(method.to_string())
            .or_default() += 1;

        let unaries = self.unaries.lock();
        let handler = unaries.get(method).ok_or_else(|| method_not_found(method))?;
        handler(&params)
    }

    fn endpoint(&self) -> String {
        "scripted".to_string()
    }
}

/// Launcher whose process signals are driven by the test.
#[derive(Default)]
pub struct ManualLauncher {
    auto_start: AtomicBool,
    hold_stop: AtomicBool,
    failure: Option<String>,
    launches: AtomicUsize,
    stops: AtomicUsize,
    signals: Mutex<Option<ProcessSignals>>,
}

impl ManualLauncher {
    /// Reports "started" as soon as it is launched.
    pub fn auto_start() -> Self {
        let launcher = Self::default();
        launcher.set_auto_start(true);
        launcher
    }

    /// Never reports anything on its own.
    pub fn manual() -> Self {
        Self::default()
    }

    /// Fails every launch with `message`.
    pub fn failing(message: impl Into<String>) -> Self {
        Self {
            failure: Some(message.into()),
            ..Self::default()
        }
    }

    pub fn set_auto_start(&self, enabled: bool) {
        self.auto_start.store(enabled, Ordering::SeqCst);
    }

    /// When set, `stop()` does not report "ended"; the test does.
    pub fn set_hold_stop(&self, enabled: bool) {
        self.hold_stop.store(enabled, Ordering::SeqCst);
    }

    pub fn launches(&self) -> usize {
        self.launches.load(Ordering::SeqCst)
    }

    pub fn stops(&self) -> usize {
        self.stops.load(Ordering::SeqCst)
    }

    /// Signals of the latest launch.
    pub fn signals(&self) -> Option<ProcessSignals> {
        self.signals.lock().clone()
    }
}

#[async_trait]
impl ServerLauncher for ManualLauncher {
    async fn launch(&self, signals: ProcessSignals) -> Result<()> {
        self.launches.fetch_add(1, Ordering::SeqCst);
        if let Some(message) = &self.failure {
            return Err(Error::connection_failed(message.clone()));
        }
        *self.signals.lock() = Some(signals.clone());
        if self.auto_start.load(Ordering::SeqCst) {
            signals.started();
        }
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        self.stops.fetch_add(1, Ordering::SeqCst);
        if !self.hold_stop.load(Ordering::SeqCst) {
            if let Some(signals) = self.signals() {
                signals.ended();
            }
        }
        Ok(())
    }
}
