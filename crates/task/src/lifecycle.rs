//! Task lifecycle tracking
//!
//! At most one record per task identity is active at a time. Absence from the
//! tracker is `Idle`. Restart is cancel-then-relaunch: the record is cancelled,
//! and once the server acknowledges it the same arguments are started again
//! and handed to the relaunch channel.
//!
//! ```text
//! Idle -[start]-> Running -[cancel]-> Cancelling -[settle]-> Idle
//! Running -[queue restart]-> QueuedForRestart -[cancel]-> Cancelling -[settle]-> Idle -> Running
//! ```

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use taskgate_core::events::{EventEmitter, TaskEvent};
use taskgate_core::{Error, InvocationRecord, LifecycleState, Result, TaskIdentity};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Sends cancellation requests to the server.
#[async_trait]
pub trait TaskCanceller: Send + Sync {
    async fn cancel(&self, cancellation_key: &str) -> Result<()>;
    async fn cancel_all(&self) -> Result<()>;
}

/// One registered run of an invocation record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvocationHandle {
    pub record: InvocationRecord,
    /// Distinguishes successive runs of the same identity
    pub run_id: u64,
    /// Key the server uses to address this run's cancellation
    pub cancellation_key: String,
}

impl InvocationHandle {
    pub fn identity(&self) -> &TaskIdentity {
        &self.record.identity
    }
}

/// Inputs of the lifecycle state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    Start,
    Cancel,
    QueueRestart,
    /// Cancellation acknowledged or stream ended
    Settle,
}

/// Lifecycle transition table. `None` means the transition is not allowed
/// from `state` and the operation is a no-op.
pub fn next_state(state: LifecycleState, transition: Transition) -> Option<LifecycleState> {
    use LifecycleState::*;
    use Transition::*;

    match (state, transition) {
        (Idle, Start) => Some(Running),
        (Running, Cancel) | (QueuedForRestart, Cancel) => Some(Cancelling),
        (Running, QueueRestart) => Some(QueuedForRestart),
        (Running, Settle) | (Cancelling, Settle) => Some(Idle),
        _ => None,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Running,
    /// `restart` records a queued restart; the queued state itself is
    /// transient and always followed by the cancel
    Cancelling { restart: bool },
}

impl Phase {
    fn state(self) -> LifecycleState {
        match self {
            Phase::Running => LifecycleState::Running,
            Phase::Cancelling { .. } => LifecycleState::Cancelling,
        }
    }
}

#[derive(Debug)]
struct Entry {
    handle: InvocationHandle,
    phase: Phase,
}

/// Owns the lifecycle map.
pub struct LifecycleTracker {
    entries: Mutex<HashMap<TaskIdentity, Entry>>,
    next_run_id: AtomicU64,
    canceller: Arc<dyn TaskCanceller>,
    relaunch_tx: mpsc::UnboundedSender<InvocationHandle>,
    relaunch_rx: Mutex<Option<mpsc::UnboundedReceiver<InvocationHandle>>>,
    events: Arc<EventEmitter>,
}

impl LifecycleTracker {
    pub fn new(canceller: Arc<dyn TaskCanceller>, events: Arc<EventEmitter>) -> Self {
        let (relaunch_tx, relaunch_rx) = mpsc::unbounded_channel();
        Self {
            entries: Mutex::new(HashMap::new()),
            next_run_id: AtomicU64::new(1),
            canceller,
            relaunch_tx,
            relaunch_rx: Mutex::new(Some(relaunch_rx)),
            events,
        }
    }

    fn emit(&self, identity: &TaskIdentity, state: LifecycleState) {
        debug!(task = %identity, %state, "lifecycle state changed");
        self.events.emit(TaskEvent::StateChanged {
            identity: identity.clone(),
            state,
        });
    }

    fn register(
        &self,
        entries: &mut HashMap<TaskIdentity, Entry>,
        record: InvocationRecord,
    ) -> Result<InvocationHandle> {
        if let Some(existing) = entries.get(&record.identity) {
            debug!(
                task = %record.identity,
                state = %existing.phase.state(),
                "rejecting start, task already active"
            );
            return Err(Error::already_running(record.identity.to_string()));
        }

        let handle = InvocationHandle {
            record,
            run_id: self.next_run_id.fetch_add(1, Ordering::Relaxed),
            cancellation_key: uuid::Uuid::new_v4().to_string(),
        };
        entries.insert(
            handle.record.identity.clone(),
            Entry {
                handle: handle.clone(),
                phase: Phase::Running,
            },
        );
        Ok(handle)
    }

    /// Register a new run. Fails with `AlreadyRunning` while a record with the
    /// same identity is active.
    pub fn try_start(&self, record: InvocationRecord) -> Result<InvocationHandle> {
        let handle = {
            let mut entries = self.entries.lock();
            self.register(&mut entries, record)?
        };
        info!(task = %handle.identity(), run_id = handle.run_id, "task started");
        self.emit(handle.identity(), LifecycleState::Running);
        Ok(handle)
    }

    /// Move a running record to `Cancelling`. Returns the handle to cancel, or
    /// `None` when the record is not running.
    pub fn begin_cancel(&self, identity: &TaskIdentity) -> Option<InvocationHandle> {
        let handle = {
            let mut entries = self.entries.lock();
            let entry = entries.get_mut(identity)?;
            next_state(entry.phase.state(), Transition::Cancel)?;
            entry.phase = Phase::Cancelling { restart: false };
            entry.handle.clone()
        };
        self.emit(identity, LifecycleState::Cancelling);
        Some(handle)
    }

    /// Queue a restart and immediately move the record to `Cancelling`.
    pub fn begin_restart(&self, identity: &TaskIdentity) -> Option<InvocationHandle> {
        let handle = {
            let mut entries = self.entries.lock();
            let entry = entries.get_mut(identity)?;
            let queued = next_state(entry.phase.state(), Transition::QueueRestart)?;
            next_state(queued, Transition::Cancel)?;
            entry.phase = Phase::Cancelling { restart: true };
            entry.handle.clone()
        };
        self.emit(identity, LifecycleState::QueuedForRestart);
        self.emit(identity, LifecycleState::Cancelling);
        Some(handle)
    }

    /// Clear the record of `handle` after a cancellation acknowledgement or
    /// the end of its stream.
    ///
    /// Stale handles from an earlier run are ignored. When a restart was
    /// queued, the same record is started again and the new handle is both
    /// returned and sent to the relaunch channel.
    pub fn settle(&self, handle: &InvocationHandle) -> Option<InvocationHandle> {
        let identity = handle.identity();
        let (restart, relaunched) = {
            let mut entries = self.entries.lock();
            match entries.get(identity) {
                Some(entry) if entry.handle.run_id == handle.run_id => {}
                _ => {
                    debug!(task = %identity, run_id = handle.run_id, "settle ignored for inactive run");
                    return None;
                }
            }
            let entry = entries.remove(identity)?;
            let restart = matches!(entry.phase, Phase::Cancelling { restart: true });
            let relaunched = if restart {
                self.register(&mut entries, entry.handle.record).ok()
            } else {
                None
            };
            (restart, relaunched)
        };

        info!(task = %identity, run_id = handle.run_id, "task settled");
        self.emit(identity, LifecycleState::Idle);

        if restart {
            if let Some(relaunched) = &relaunched {
                info!(task = %identity, run_id = relaunched.run_id, "relaunching task");
                self.emit(identity, LifecycleState::Running);
                if self.relaunch_tx.send(relaunched.clone()).is_err() {
                    warn!(task = %identity, "no relaunch consumer, restart will not stream");
                }
            }
        }
        relaunched
    }

    /// Cancel a running record and send the cancel request. A record that is
    /// not running is ignored.
    pub async fn request_cancel(&self, identity: &TaskIdentity) -> Result<()> {
        let Some(handle) = self.begin_cancel(identity) else {
            debug!(task = %identity, "cancel ignored, task not running");
            return Ok(());
        };
        self.canceller.cancel(&handle.cancellation_key).await
    }

    /// Cancel then relaunch a running record. Returns whether a restart was
    /// queued.
    pub async fn queue_restart(&self, identity: &TaskIdentity) -> Result<bool> {
        let Some(handle) = self.begin_restart(identity) else {
            debug!(task = %identity, "restart ignored, task not running");
            return Ok(false);
        };
        self.canceller.cancel(&handle.cancellation_key).await?;
        Ok(true)
    }

    /// Cancel every running record with a single server request.
    pub async fn request_cancel_all(&self) -> Result<usize> {
        let identities: Vec<TaskIdentity> = self
            .entries
            .lock()
            .iter()
            .filter(|(_, entry)| entry.phase == Phase::Running)
            .map(|(identity, _)| identity.clone())
            .collect();

        let cancelled = identities
            .iter()
            .filter(|identity| self.begin_cancel(identity).is_some())
            .count();
        if cancelled > 0 {
            self.canceller.cancel_all().await?;
        }
        Ok(cancelled)
    }

    pub fn state(&self, identity: &TaskIdentity) -> LifecycleState {
        self.entries
            .lock()
            .get(identity)
            .map_or(LifecycleState::Idle, |entry| entry.phase.state())
    }

    pub fn handle(&self, identity: &TaskIdentity) -> Option<InvocationHandle> {
        self.entries
            .lock()
            .get(identity)
            .map(|entry| entry.handle.clone())
    }

    /// Snapshot of all active records.
    pub fn active(&self) -> Vec<(InvocationHandle, LifecycleState)> {
        self.entries
            .lock()
            .values()
            .map(|entry| (entry.handle.clone(), entry.phase.state()))
            .collect()
    }

    /// Receiver of restarted runs. Can be taken once.
    pub fn take_relaunches(&self) -> Option<mpsc::UnboundedReceiver<InvocationHandle>> {
        self.relaunch_rx.lock().take()
    }
}
