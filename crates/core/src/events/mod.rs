//! Notification events produced by the coordination layer
//!
//! Components publish plain signals with an optional payload; the presentation
//! layer subscribes and re-renders on its own schedule. Each component receives
//! its emitter at construction, so independent instances never share a bus
//! unless the caller wires them together.

pub mod console;
mod emitter;
mod subscriber;

pub use console::LoggingSubscriber;
pub use emitter::{EventEmitter, DEFAULT_EVENT_CAPACITY};
pub use subscriber::{EventEnvelope, EventSubscriber};

use crate::types::{ConnectionState, InvocationKey, LifecycleState, TaskIdentity};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Top level event published on the bus
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum SystemEvent {
    Connection(ConnectionEvent),
    Catalog(CatalogEvent),
    Task(TaskEvent),
    Session(SessionEvent),
    Daemon(DaemonEvent),
}

/// Build server connection events
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ConnectionEvent {
    /// Connection state machine moved
    StateChanged { state: ConnectionState },
    /// Server became ready to accept calls
    Ready,
    /// Connect attempt or call failed at the transport level; retry is manual
    Failed { message: String },
}

/// Task catalog events
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum CatalogEvent {
    /// A load finished and populated the cache
    Loaded { task_count: usize, root_count: usize },
    /// Cache was cleared
    Invalidated,
}

/// Per-invocation task events
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum TaskEvent {
    /// Lifecycle tracker moved a record
    StateChanged {
        identity: TaskIdentity,
        state: LifecycleState,
    },
    /// Progress text from the server
    Progress {
        identity: TaskIdentity,
        message: String,
    },
    /// Server acknowledged a cancellation
    Cancelled {
        identity: TaskIdentity,
        message: String,
    },
    /// Stream ended cleanly
    Completed { identity: TaskIdentity, run_id: u64 },
    /// Stream ended with an error
    Failed {
        identity: TaskIdentity,
        run_id: u64,
        error: String,
    },
}

/// Output session events
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum SessionEvent {
    /// Sessions were added or disposed; `key` is `None` for store-wide changes
    SetChanged {
        key: Option<InvocationKey>,
        live_sessions: usize,
    },
}

/// Build daemon events
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum DaemonEvent {
    /// Fresh status snapshot for a project root
    StatusUpdated { root: PathBuf, daemon_count: usize },
    /// Daemons of a root were asked to stop
    StopRequested { root: PathBuf },
}

impl From<ConnectionEvent> for SystemEvent {
    fn from(event: ConnectionEvent) -> Self {
        SystemEvent::Connection(event)
    }
}

impl From<CatalogEvent> for SystemEvent {
    fn from(event: CatalogEvent) -> Self {
        SystemEvent::Catalog(event)
    }
}

impl From<TaskEvent> for SystemEvent {
    fn from(event: TaskEvent) -> Self {
        SystemEvent::Task(event)
    }
}

impl From<SessionEvent> for SystemEvent {
    fn from(event: SessionEvent) -> Self {
        SystemEvent::Session(event)
    }
}

impl From<DaemonEvent> for SystemEvent {
    fn from(event: DaemonEvent) -> Self {
        SystemEvent::Daemon(event)
    }
}
