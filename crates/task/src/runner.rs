//! Task runner
//!
//! Drives one run end to end: register the record, apply the session reuse
//! policy, stream the run into its session, then settle the record. Restarts
//! queued in the lifecycle tracker are picked up by a background pump and
//! streamed the same way.

use crate::client::BuildServerClient;
use crate::lifecycle::{InvocationHandle, LifecycleTracker};
use crate::protocol::{RunBuildResult, METHOD_RUN_BUILD};
use crate::sessions::{OutputSession, SessionFactory, SessionStore};
use crate::stream::StreamingCall;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use taskgate_core::events::{EventEmitter, TaskEvent};
use taskgate_core::{InvocationRecord, LifecycleState, Result, ReusePolicy, TaskIdentity};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, Instrument};

/// Asks the user before a running task is restarted.
#[async_trait]
pub trait Confirmer: Send + Sync {
    async fn confirm(&self, prompt: &str) -> bool;
}

/// Confirmer that always agrees.
pub struct AlwaysConfirm;

#[async_trait]
impl Confirmer for AlwaysConfirm {
    async fn confirm(&self, _prompt: &str) -> bool {
        true
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunnerOptions {
    pub reuse_policy: ReusePolicy,
    pub suppress_confirmation: bool,
}

/// How a run ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunOutcome {
    Completed { run_id: u64, exit_code: Option<i32> },
    Cancelled { run_id: u64 },
    /// A run with the same identity was already active; nothing was started
    AlreadyRunning,
}

pub struct TaskRunner {
    client: Arc<BuildServerClient>,
    tracker: Arc<LifecycleTracker>,
    sessions: Arc<SessionStore>,
    factory: Arc<dyn SessionFactory>,
    confirmer: Arc<dyn Confirmer>,
    options: RunnerOptions,
    events: Arc<EventEmitter>,
    pump: Mutex<Option<JoinHandle<()>>>,
}

impl TaskRunner {
    /// Create the runner and start the relaunch pump for queued restarts.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        client: Arc<BuildServerClient>,
        tracker: Arc<LifecycleTracker>,
        sessions: Arc<SessionStore>,
        factory: Arc<dyn SessionFactory>,
        confirmer: Arc<dyn Confirmer>,
        options: RunnerOptions,
        events: Arc<EventEmitter>,
    ) -> Arc<Self> {
        let relaunches = tracker.take_relaunches();
        let runner = Arc::new(Self {
            client,
            tracker,
            sessions,
            factory,
            confirmer,
            options,
            events,
            pump: Mutex::new(None),
        });

        if let Some(mut relaunches) = relaunches {
            let weak: Weak<Self> = Arc::downgrade(&runner);
            let pump = tokio::spawn(async move {
                while let Some(handle) = relaunches.recv().await {
                    let Some(runner) = weak.upgrade() else {
                        break;
                    };
                    tokio::spawn(async move {
                        let task = handle.identity().to_string();
                        if let Err(e) = runner.execute(handle).await {
                            error!(%task, error = %e, "restarted task failed");
                        }
                    });
                }
                debug!("relaunch pump stopped");
            });
            *runner.pump.lock() = Some(pump);
        }
        runner
    }

    pub fn tracker(&self) -> &Arc<LifecycleTracker> {
        &self.tracker
    }

    pub fn sessions(&self) -> &Arc<SessionStore> {
        &self.sessions
    }

    /// Run a task to completion.
    ///
    /// A second run of an identity that is still active is absorbed as
    /// [`RunOutcome::AlreadyRunning`].
    pub async fn run(&self, record: InvocationRecord) -> Result<RunOutcome> {
        let handle = match self.tracker.try_start(record) {
            Ok(handle) => handle,
            Err(e) if e.is_logical_conflict() => {
                debug!(error = %e, "run ignored");
                return Ok(RunOutcome::AlreadyRunning);
            }
            Err(e) => return Err(e),
        };
        self.execute(handle).await
    }

    /// Stream an already registered run and settle it afterwards.
    pub async fn execute(&self, handle: InvocationHandle) -> Result<RunOutcome> {
        let span = taskgate_utils::tracing::task_span(&handle.identity().to_string(), handle.run_id);
        async move {
            let key = handle.record.key();
            let disposed = self.sessions.before_launch(&key, self.options.reuse_policy);
            if disposed > 0 {
                debug!(disposed, policy = %self.options.reuse_policy, "reused output sessions");
            }
            let session = self.factory.create(&key);
            self.sessions.track(key, session.clone());

            let cancelled = Arc::new(AtomicBool::new(false));
            let streamed = self.stream(&handle, session, cancelled.clone()).await;

            // No-op when a cancellation frame already settled the run
            self.tracker.settle(&handle);

            let identity = handle.identity().clone();
            let run_id = handle.run_id;
            match streamed {
                Ok(result) => {
                    let exit_code = result.map(|result| result.exit_code);
                    info!(?exit_code, "task finished");
                    self.events.emit(TaskEvent::Completed { identity, run_id });
                    if cancelled.load(Ordering::SeqCst) {
                        Ok(RunOutcome::Cancelled { run_id })
                    } else {
                        Ok(RunOutcome::Completed { run_id, exit_code })
                    }
                }
                Err(e) => {
                    error!(error = %e, "task failed");
                    self.events.emit(TaskEvent::Failed {
                        identity,
                        run_id,
                        error: e.to_string(),
                    });
                    Err(e)
                }
            }
        }
        .instrument(span)
        .await
    }

    async fn stream(
        &self,
        handle: &InvocationHandle,
        session: Arc<dyn OutputSession>,
        cancelled: Arc<AtomicBool>,
    ) -> Result<Option<RunBuildResult>> {
        let frames = self.client.run_task(handle).await?;

        let progress_events = self.events.clone();
        let progress_identity = handle.identity().clone();
        let cancel_events = self.events.clone();
        let cancel_identity = handle.identity().clone();

        StreamingCall::<RunBuildResult>::new(METHOD_RUN_BUILD)
            .on_progress(move |message| {
                progress_events.emit(TaskEvent::Progress {
                    identity: progress_identity.clone(),
                    message: message.to_string(),
                });
            })
            .on_output(move |chunk| session.write(chunk))
            .on_cancelled(move |message| {
                cancelled.store(true, Ordering::SeqCst);
                info!(%message, "cancellation acknowledged");
                cancel_events.emit(TaskEvent::Cancelled {
                    identity: cancel_identity.clone(),
                    message: message.to_string(),
                });
            })
            .acknowledge_cancellation(self.tracker.clone(), handle.clone())
            .complete(frames)
            .await
    }

    pub async fn cancel(&self, identity: &TaskIdentity) -> Result<()> {
        self.tracker.request_cancel(identity).await
    }

    pub async fn cancel_all(&self) -> Result<usize> {
        self.tracker.request_cancel_all().await
    }

    /// Cancel a running task and run it again with the same arguments once
    /// the cancellation is acknowledged.
    ///
    /// Returns `false` when the task is not running or the user declined.
    pub async fn restart(&self, identity: &TaskIdentity) -> Result<bool> {
        if self.tracker.state(identity) != LifecycleState::Running {
            debug!(task = %identity, "restart ignored, task not running");
            return Ok(false);
        }
        if !self.options.suppress_confirmation {
            let prompt = format!("Task '{identity}' is running. Restart it?");
            if !self.confirmer.confirm(&prompt).await {
                debug!(task = %identity, "restart declined");
                return Ok(false);
            }
        }
        self.tracker.queue_restart(identity).await
    }
}

impl Drop for TaskRunner {
    fn drop(&mut self) {
        if let Some(pump) = self.pump.lock().take() {
            pump.abort();
        }
    }
}
