//! Build server connection lifecycle
//!
//! ```text
//! Disconnected -[start]-> Connecting -[process started]-> Ready -[process ended]-> Disconnected
//! Connecting -[deadline / launch error / process ended]-> Failed -[restart]-> Connecting
//! ```
//!
//! The manager never spawns the server itself. It asks a [`ServerLauncher`]
//! to issue the start command and reacts to the process signals delivered
//! through [`ProcessSignals`]. A failed connect is never retried automatically.

use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use taskgate_core::events::{ConnectionEvent, EventEmitter};
use taskgate_core::{ConnectionState, Error, Result};
use taskgate_utils::Waiter;
use tokio::sync::watch;
use tokio::time::timeout;
use tracing::{debug, info, warn};

/// Issues start/stop commands for the build server process.
#[async_trait]
pub trait ServerLauncher: Send + Sync {
    /// Start (or attach to) the server. Readiness is reported later through
    /// `signals.started()`, possibly before this call returns.
    async fn launch(&self, signals: ProcessSignals) -> Result<()>;

    /// Ask the running server to stop. Completion is reported through
    /// `signals.ended()`.
    async fn stop(&self) -> Result<()>;
}

struct Shared {
    state: watch::Sender<ConnectionState>,
    ready: Waiter,
    events: Arc<EventEmitter>,
    /// Bumped on every launch; signals of older launches are ignored
    generation: AtomicU64,
    /// Set while a restart stops the current server
    restart_stopping: AtomicBool,
}

impl Shared {
    /// Move to `next` if the current state satisfies `from`. Returns whether
    /// the state changed.
    fn transition(&self, from: impl Fn(ConnectionState) -> bool, next: ConnectionState) -> bool {
        let changed = self.state.send_if_modified(|state| {
            if from(*state) && *state != next {
                *state = next;
                true
            } else {
                false
            }
        });
        if changed {
            debug!(state = %next, "connection state changed");
            self.events.emit(ConnectionEvent::StateChanged { state: next });
        }
        changed
    }

    fn fail(&self, message: String) {
        if !self.transition(|s| s == ConnectionState::Connecting, ConnectionState::Failed) {
            return;
        }
        if self.restart_stopping.load(Ordering::SeqCst) {
            debug!(%message, "pending build server stopped for restart");
        } else {
            warn!(%message, "build server connection failed");
            self.events.emit(ConnectionEvent::Failed { message });
        }
    }
}

/// Handle through which the host reports server process events.
///
/// Each handle belongs to one launch. Once a newer launch has begun, the
/// handle's signals are ignored.
#[derive(Clone)]
pub struct ProcessSignals {
    shared: Arc<Shared>,
    generation: u64,
}

impl ProcessSignals {
    fn is_current(&self) -> bool {
        let current = self.shared.generation.load(Ordering::SeqCst);
        if current != self.generation {
            debug!(
                generation = self.generation,
                current, "ignoring signal from a previous launch"
            );
            return false;
        }
        true
    }

    /// The server process is up and accepting calls.
    pub fn started(&self) {
        if !self.is_current() {
            return;
        }
        if self
            .shared
            .transition(|s| s == ConnectionState::Connecting, ConnectionState::Ready)
        {
            info!("build server ready");
            self.shared.ready.fire();
            self.shared.events.emit(ConnectionEvent::Ready);
        } else {
            debug!(state = %*self.shared.state.borrow(), "ignoring process start signal");
        }
    }

    /// The server process exited.
    pub fn ended(&self) {
        if !self.is_current() {
            return;
        }
        self.shared.ready.reset();
        let was_connecting = *self.shared.state.borrow() == ConnectionState::Connecting;
        if was_connecting {
            self.shared
                .fail("build server exited before becoming ready".to_string());
        } else if self.shared.transition(
            |s| s == ConnectionState::Ready,
            ConnectionState::Disconnected,
        ) {
            info!("build server stopped");
        }
    }
}

/// Owns the connection state machine and the ready gate.
pub struct ConnectionManager {
    shared: Arc<Shared>,
    launcher: Arc<dyn ServerLauncher>,
    deadline: Duration,
    restarting: AtomicBool,
}

impl ConnectionManager {
    pub fn new(
        launcher: Arc<dyn ServerLauncher>,
        deadline: Duration,
        events: Arc<EventEmitter>,
    ) -> Self {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            shared: Arc::new(Shared {
                state,
                ready: Waiter::new(),
                events,
                generation: AtomicU64::new(0),
                restart_stopping: AtomicBool::new(false),
            }),
            launcher,
            deadline,
            restarting: AtomicBool::new(false),
        }
    }

    pub fn state(&self) -> ConnectionState {
        *self.shared.state.borrow()
    }

    /// Watch state transitions.
    pub fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.shared.state.subscribe()
    }

    /// Signals handle of the current launch, for hosts that observe the
    /// server process directly.
    pub fn signals(&self) -> ProcessSignals {
        ProcessSignals {
            shared: self.shared.clone(),
            generation: self.shared.generation.load(Ordering::SeqCst),
        }
    }

    pub fn deadline(&self) -> Duration {
        self.deadline
    }

    /// Launch or attach to the server and wait for it to become ready.
    ///
    /// No-op while already connecting or ready. Exceeding the deadline moves
    /// the connection to `Failed`; retrying is left to the caller.
    pub async fn start(&self) -> Result<()> {
        if !self.shared.transition(
            |s| matches!(s, ConnectionState::Disconnected | ConnectionState::Failed),
            ConnectionState::Connecting,
        ) {
            debug!(state = %self.state(), "start ignored, connection already active");
            return Ok(());
        }
        self.shared.ready.reset();
        self.shared.generation.fetch_add(1, Ordering::SeqCst);

        let mut state = self.subscribe();

        if let Err(e) = self.launcher.launch(self.signals()).await {
            self.shared.fail(format!("failed to launch build server: {e}"));
            return Err(Error::connection_failed(e.to_string()));
        }

        let settled = timeout(
            self.deadline,
            state.wait_for(|s| *s != ConnectionState::Connecting),
        )
        .await
        .map(|r| r.map(|current| *current));

        match settled {
            Ok(Ok(current)) if current == ConnectionState::Ready => Ok(()),
            Ok(Ok(current)) => {
                Err(Error::connection_failed(format!(
                    "build server did not become ready (state: {current})"
                )))
            }
            Ok(Err(_)) => Err(Error::connection_failed("connection manager dropped")),
            Err(_) => {
                self.shared.fail(format!(
                    "build server did not become ready within {:?}",
                    self.deadline
                ));
                // Do not leave a server that missed its deadline running
                if let Err(e) = self.launcher.stop().await {
                    debug!(error = %e, "stopping build server after timeout");
                }
                Err(Error::timeout("connect to build server", self.deadline))
            }
        }
    }

    /// Stop the current server, wait for it to exit, then start a new one.
    ///
    /// A second call while a restart is in progress is a no-op.
    pub async fn restart(&self) -> Result<()> {
        if self.restarting.swap(true, Ordering::SeqCst) {
            debug!("restart already in progress");
            return Ok(());
        }
        let _guard = FlagGuard(&self.restarting);

        match self.state() {
            ConnectionState::Ready | ConnectionState::Connecting => {
                self.shared.restart_stopping.store(true, Ordering::SeqCst);
                let _stopping = FlagGuard(&self.shared.restart_stopping);
                let mut state = self.subscribe();
                self.launcher.stop().await?;
                timeout(
                    self.deadline,
                    state.wait_for(|s| {
                        matches!(s, ConnectionState::Disconnected | ConnectionState::Failed)
                    }),
                )
                .await
                .map_err(|_| Error::timeout("stop build server", self.deadline))?
                .map_err(|_| Error::connection_failed("connection manager dropped"))?;
            }
            ConnectionState::Failed => {
                // Wait for any earlier server to exit before launching again
                if let Err(e) = self.launcher.stop().await {
                    debug!(error = %e, "stopping failed server");
                }
            }
            ConnectionState::Disconnected => {}
        }

        self.start().await
    }

    /// Gate consulted before every new outbound call.
    ///
    /// Resolves once the connection is ready. Fails immediately when the
    /// connection has failed, and after the deadline when nothing happens.
    pub async fn wait_until_ready(&self) -> Result<()> {
        let ready = self.shared.ready.wait();
        let mut state = self.subscribe();
        let failed = async move {
            let _ = state.wait_for(|s| *s == ConnectionState::Failed).await;
        };

        let outcome = timeout(self.deadline, async {
            tokio::select! {
                biased;
                _ = ready => true,
                _ = failed => false,
            }
        })
        .await;

        match outcome {
            Ok(true) => Ok(()),
            Ok(false) => Err(Error::connection_failed(
                "build server is not available, restart the connection to retry",
            )),
            Err(_) => Err(Error::timeout("wait for build server", self.deadline)),
        }
    }

    /// Ask the server to stop without starting a new one.
    pub async fn shutdown(&self) -> Result<()> {
        if self.state() == ConnectionState::Disconnected {
            return Ok(());
        }
        self.launcher.stop().await
    }
}

/// Clears a flag when dropped.
struct FlagGuard<'a>(&'a AtomicBool);

impl Drop for FlagGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::ManualLauncher;
    use taskgate_core::events::SystemEvent;

    fn manager(launcher: Arc<ManualLauncher>, deadline: Duration) -> ConnectionManager {
        ConnectionManager::new(launcher, deadline, Arc::new(EventEmitter::default()))
    }

    #[tokio::test]
    async fn test_start_becomes_ready_on_process_signal() {
        let launcher = Arc::new(ManualLauncher::auto_start());
        let connection = manager(launcher.clone(), Duration::from_secs(1));
        assert_eq!(connection.state(), ConnectionState::Disconnected);

        connection.start().await.unwrap();
        assert_eq!(connection.state(), ConnectionState::Ready);
        assert_eq!(launcher.launches(), 1);

        connection.wait_until_ready().await.unwrap();
    }

    #[tokio::test]
    async fn test_start_is_idempotent_while_active() {
        let launcher = Arc::new(ManualLauncher::auto_start());
        let connection = manager(launcher.clone(), Duration::from_secs(1));

        connection.start().await.unwrap();
        connection.start().await.unwrap();
        assert_eq!(launcher.launches(), 1);
    }

    #[tokio::test]
    async fn test_deadline_moves_to_failed_without_retry() {
        let launcher = Arc::new(ManualLauncher::manual());
        let events = Arc::new(EventEmitter::default());
        let mut rx = events.subscribe();
        let connection =
            ConnectionManager::new(launcher.clone(), Duration::from_millis(50), events.clone());

        let error = connection.start().await.unwrap_err();
        assert!(matches!(error, Error::Timeout { .. }));
        assert_eq!(connection.state(), ConnectionState::Failed);
        assert_eq!(launcher.launches(), 1);

        let mut saw_failed = false;
        while let Ok(envelope) = rx.try_recv() {
            if matches!(
                envelope.event,
                SystemEvent::Connection(ConnectionEvent::Failed { .. })
            ) {
                saw_failed = true;
            }
        }
        assert!(saw_failed);

        // Gate fails fast once the connection has failed
        let gate = connection.wait_until_ready().await.unwrap_err();
        assert!(matches!(gate, Error::ConnectionFailed { .. }));
    }

    #[tokio::test]
    async fn test_launch_error_fails_connection() {
        let launcher = Arc::new(ManualLauncher::failing("no such executable"));
        let connection = manager(launcher, Duration::from_secs(1));

        let error = connection.start().await.unwrap_err();
        assert!(error.to_string().contains("no such executable"));
        assert_eq!(connection.state(), ConnectionState::Failed);
    }

    #[tokio::test]
    async fn test_gate_waits_for_late_start() {
        let launcher = Arc::new(ManualLauncher::manual());
        let connection = Arc::new(manager(launcher.clone(), Duration::from_secs(2)));

        let gate = {
            let connection = connection.clone();
            tokio::spawn(async move { connection.wait_until_ready().await })
        };
        let start = {
            let connection = connection.clone();
            tokio::spawn(async move { connection.start().await })
        };

        while launcher.launches() == 0 {
            tokio::task::yield_now().await;
        }
        launcher.signals().unwrap().started();

        start.await.unwrap().unwrap();
        gate.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_process_end_disconnects_and_rearms_gate() {
        let launcher = Arc::new(ManualLauncher::auto_start());
        let connection = manager(launcher.clone(), Duration::from_millis(50));
        connection.start().await.unwrap();

        launcher.signals().unwrap().ended();
        assert_eq!(connection.state(), ConnectionState::Disconnected);
        assert!(matches!(
            connection.wait_until_ready().await,
            Err(Error::Timeout { .. })
        ));
    }

    #[tokio::test]
    async fn test_restart_waits_for_stop_then_starts() {
        let launcher = Arc::new(ManualLauncher::auto_start());
        let connection = manager(launcher.clone(), Duration::from_secs(1));
        connection.start().await.unwrap();

        connection.restart().await.unwrap();
        assert_eq!(launcher.stops(), 1);
        assert_eq!(launcher.launches(), 2);
        assert_eq!(connection.state(), ConnectionState::Ready);
    }

    #[tokio::test]
    async fn test_restart_from_failed() {
        let launcher = Arc::new(ManualLauncher::manual());
        let connection = manager(launcher.clone(), Duration::from_millis(50));
        assert!(connection.start().await.is_err());

        launcher.set_auto_start(true);
        connection.restart().await.unwrap();
        assert_eq!(connection.state(), ConnectionState::Ready);
    }

    #[tokio::test]
    async fn test_concurrent_restart_is_noop() {
        let launcher = Arc::new(ManualLauncher::auto_start());
        let connection = Arc::new(manager(launcher.clone(), Duration::from_secs(1)));
        connection.start().await.unwrap();

        launcher.set_hold_stop(true);
        let first = {
            let connection = connection.clone();
            tokio::spawn(async move { connection.restart().await })
        };
        while launcher.stops() == 0 {
            tokio::task::yield_now().await;
        }

        // Second restart returns immediately while the first is stopping
        connection.restart().await.unwrap();
        assert_eq!(launcher.stops(), 1);

        launcher.signals().unwrap().ended();
        first.await.unwrap().unwrap();
        assert_eq!(launcher.launches(), 2);
    }

    #[tokio::test]
    async fn test_signals_from_previous_launch_are_ignored() {
        let launcher = Arc::new(ManualLauncher::auto_start());
        let connection = manager(launcher.clone(), Duration::from_secs(1));
        connection.start().await.unwrap();
        let previous = launcher.signals().unwrap();

        connection.restart().await.unwrap();
        assert_eq!(connection.state(), ConnectionState::Ready);

        // Late reports from the replaced server
        previous.ended();
        assert_eq!(connection.state(), ConnectionState::Ready);
        previous.started();
        assert_eq!(connection.state(), ConnectionState::Ready);

        launcher.signals().unwrap().ended();
        assert_eq!(connection.state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_restart_while_connecting_reports_no_failure() {
        let launcher = Arc::new(ManualLauncher::manual());
        let events = Arc::new(EventEmitter::default());
        let mut rx = events.subscribe();
        let connection = Arc::new(ConnectionManager::new(
            launcher.clone(),
            Duration::from_secs(1),
            events.clone(),
        ));

        let pending = {
            let connection = connection.clone();
            tokio::spawn(async move { connection.start().await })
        };
        while launcher.launches() == 0 {
            tokio::task::yield_now().await;
        }

        launcher.set_auto_start(true);
        connection.restart().await.unwrap();
        assert_eq!(connection.state(), ConnectionState::Ready);
        assert_eq!(launcher.launches(), 2);
        let _ = pending.await.unwrap();

        while let Ok(envelope) = rx.try_recv() {
            assert!(!matches!(
                envelope.event,
                SystemEvent::Connection(ConnectionEvent::Failed { .. })
            ));
        }
    }
}
