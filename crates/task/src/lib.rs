//! Client-side coordination for an out-of-process build server
//!
//! This crate owns the connection to the build server, the task catalog,
//! task lifecycle tracking, output sessions and daemon status polling.
//! Everything the server reports is consumed through streaming calls.

pub mod catalog;
pub mod client;
pub mod connection;
pub mod daemons;
pub mod gate;
pub mod lifecycle;
pub mod protocol;
pub mod runner;
pub mod sessions;
pub mod stream;
pub mod testing;

pub use catalog::{CatalogSnapshot, TaskCatalog, TaskDiscovery};
pub use client::BuildServerClient;
pub use connection::{ConnectionManager, ProcessSignals, ServerLauncher};
pub use daemons::{DaemonControl, DaemonMonitor};
pub use gate::{TaskGate, TaskGateBuilder};
pub use lifecycle::{next_state, InvocationHandle, LifecycleTracker, TaskCanceller, Transition};
pub use runner::{AlwaysConfirm, Confirmer, RunOutcome, RunnerOptions, TaskRunner};
pub use sessions::{
    BufferedSession, BufferedSessionFactory, ConsoleSession, ConsoleSessionFactory,
    OutputSession, SessionFactory, SessionId, SessionStore,
};
pub use stream::{OutputChunk, StreamingCall};
