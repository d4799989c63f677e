//! Build daemon status monitoring
//!
//! Status polls for a project root can be re-triggered before the previous
//! poll answered. A refresh releases the waiting poll with the last known-good
//! snapshot and starts a fresh one, so callers never see results out of order.

use crate::protocol::DaemonStatusSnapshot;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use taskgate_core::events::{DaemonEvent, EventEmitter};
use taskgate_core::Result;
use taskgate_utils::{PollOutcome, Superseder};
use tracing::{debug, info, warn};

/// Daemon operations offered by the build server.
#[async_trait]
pub trait DaemonControl: Send + Sync {
    async fn status(&self, project_root: &Path) -> Result<DaemonStatusSnapshot>;

    /// Stop every daemon of a root. Returns the server's message.
    async fn stop_all(&self, project_root: &Path) -> Result<String>;

    /// Stop one daemon by pid. Returns the server's message.
    async fn stop_one(&self, pid: &str) -> Result<String>;
}

pub struct DaemonMonitor {
    control: Arc<dyn DaemonControl>,
    pollers: Mutex<HashMap<PathBuf, Arc<Superseder<DaemonStatusSnapshot>>>>,
    stopping: Mutex<HashSet<String>>,
    events: Arc<EventEmitter>,
}

/// Clears a stop request from the in-flight set.
struct StopGuard<'a> {
    stopping: &'a Mutex<HashSet<String>>,
    key: String,
}

impl Drop for StopGuard<'_> {
    fn drop(&mut self) {
        self.stopping.lock().remove(&self.key);
    }
}

impl DaemonMonitor {
    pub fn new(control: Arc<dyn DaemonControl>, events: Arc<EventEmitter>) -> Self {
        Self {
            control,
            pollers: Mutex::new(HashMap::new()),
            stopping: Mutex::new(HashSet::new()),
            events,
        }
    }

    fn poller(&self, project_root: &Path) -> Arc<Superseder<DaemonStatusSnapshot>> {
        self.pollers
            .lock()
            .entry(project_root.to_path_buf())
            .or_insert_with(|| Arc::new(Superseder::new(DaemonStatusSnapshot::default())))
            .clone()
    }

    /// Poll daemon status of a root.
    pub async fn status(&self, project_root: &Path) -> Result<PollOutcome<DaemonStatusSnapshot>> {
        let poller = self.poller(project_root);
        let outcome = poller.poll(self.control.status(project_root)).await?;
        match &outcome {
            PollOutcome::Fresh(snapshot) => {
                debug!(root = %project_root.display(), daemons = snapshot.daemons.len(), "daemon status");
                self.events.emit(DaemonEvent::StatusUpdated {
                    root: project_root.to_path_buf(),
                    daemon_count: snapshot.daemons.len(),
                });
            }
            PollOutcome::Superseded(_) => {
                debug!(root = %project_root.display(), "daemon status poll superseded");
            }
        }
        Ok(outcome)
    }

    /// Release any waiting poll with the last known-good snapshot, then poll
    /// again.
    pub async fn refresh(&self, project_root: &Path) -> Result<PollOutcome<DaemonStatusSnapshot>> {
        let released = self.poller(project_root).supersede();
        if released > 0 {
            debug!(root = %project_root.display(), released, "superseded stale status polls");
        }
        self.status(project_root).await
    }

    pub fn last_known(&self, project_root: &Path) -> DaemonStatusSnapshot {
        self.poller(project_root).last_known_good()
    }

    fn begin_stop(&self, key: String) -> Option<StopGuard<'_>> {
        if !self.stopping.lock().insert(key.clone()) {
            debug!(%key, "stop already in progress, ignoring");
            return None;
        }
        Some(StopGuard {
            stopping: &self.stopping,
            key,
        })
    }

    async fn refresh_after_stop(&self, project_root: &Path) {
        if let Err(e) = self.refresh(project_root).await {
            warn!(root = %project_root.display(), error = %e, "failed to refresh daemon status");
        }
    }

    /// Stop every daemon of a root. Returns `None` when a stop for the same
    /// root is already in flight.
    pub async fn stop_daemons(&self, project_root: &Path) -> Result<Option<String>> {
        let Some(_guard) = self.begin_stop(format!("root:{}", project_root.display())) else {
            return Ok(None);
        };

        self.events.emit(DaemonEvent::StopRequested {
            root: project_root.to_path_buf(),
        });
        let message = self.control.stop_all(project_root).await?;
        info!(root = %project_root.display(), %message, "daemons stopped");

        self.refresh_after_stop(project_root).await;
        Ok(Some(message))
    }

    /// Stop one daemon of a root. Returns `None` when a stop for the same pid
    /// is already in flight.
    pub async fn stop_daemon(&self, project_root: &Path, pid: &str) -> Result<Option<String>> {
        let Some(_guard) = self.begin_stop(format!("pid:{pid}")) else {
            return Ok(None);
        };

        let message = self.control.stop_one(pid).await?;
        info!(root = %project_root.display(), pid, %message, "daemon stopped");

        self.refresh_after_stop(project_root).await;
        Ok(Some(message))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{DaemonInfo, DaemonState};
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::oneshot;

    /// Status answers are released by the test, one channel per poll.
    #[derive(Default)]
    struct ControlledDaemons {
        answers: Mutex<VecDeque<oneshot::Receiver<DaemonStatusSnapshot>>>,
        stop_gate: Mutex<Option<oneshot::Receiver<()>>>,
        stops: AtomicUsize,
    }

    impl ControlledDaemons {
        fn expect_poll(&self) -> oneshot::Sender<DaemonStatusSnapshot> {
            let (tx, rx) = oneshot::channel();
            self.answers.lock().push_back(rx);
            tx
        }
    }

    #[async_trait]
    impl DaemonControl for ControlledDaemons {
        async fn status(&self, _project_root: &Path) -> Result<DaemonStatusSnapshot> {
            let answer = self.answers.lock().pop_front();
            match answer {
                Some(rx) => Ok(rx.await.unwrap_or_default()),
                None => Ok(DaemonStatusSnapshot::default()),
            }
        }

        async fn stop_all(&self, _project_root: &Path) -> Result<String> {
            self.stops.fetch_add(1, Ordering::SeqCst);
            let gate = self.stop_gate.lock().take();
            if let Some(gate) = gate {
                let _ = gate.await;
            }
            Ok("Stopped".to_string())
        }

        async fn stop_one(&self, pid: &str) -> Result<String> {
            self.stops.fetch_add(1, Ordering::SeqCst);
            Ok(format!("Stopped {pid}"))
        }
    }

    fn snapshot(pids: &[&str]) -> DaemonStatusSnapshot {
        DaemonStatusSnapshot {
            daemons: pids
                .iter()
                .map(|pid| DaemonInfo {
                    pid: pid.to_string(),
                    status: DaemonState::Idle,
                    info: String::new(),
                })
                .collect(),
        }
    }

    #[tokio::test]
    async fn test_refresh_supersedes_waiting_poll() {
        let control = Arc::new(ControlledDaemons::default());
        let monitor = Arc::new(DaemonMonitor::new(control.clone(), Arc::new(EventEmitter::default())));
        let root = Path::new("/p");

        // Establish a known-good snapshot
        control.expect_poll().send(snapshot(&["1"])).unwrap();
        monitor.status(root).await.unwrap();

        let slow = control.expect_poll();
        let poll_a = tokio::spawn({
            let monitor = monitor.clone();
            async move { monitor.status(Path::new("/p")).await }
        });
        while monitor.poller(root).pending() == 0 {
            tokio::task::yield_now().await;
        }

        let fast = control.expect_poll();
        fast.send(snapshot(&["3"])).unwrap();
        let poll_b = monitor.refresh(root).await.unwrap();

        let poll_a = poll_a.await.unwrap().unwrap();
        assert_eq!(poll_a, PollOutcome::Superseded(snapshot(&["1"])));
        assert_eq!(poll_b, PollOutcome::Fresh(snapshot(&["3"])));

        // A late answer to the superseded poll is never delivered
        assert!(slow.send(snapshot(&["2"])).is_err());
        assert_eq!(monitor.last_known(root), snapshot(&["3"]));
    }

    #[tokio::test]
    async fn test_duplicate_stop_is_ignored() {
        let control = Arc::new(ControlledDaemons::default());
        let (release, gate) = oneshot::channel();
        *control.stop_gate.lock() = Some(gate);
        let monitor = Arc::new(DaemonMonitor::new(control.clone(), Arc::new(EventEmitter::default())));

        let first = tokio::spawn({
            let monitor = monitor.clone();
            async move { monitor.stop_daemons(Path::new("/p")).await }
        });
        while control.stops.load(Ordering::SeqCst) == 0 {
            tokio::task::yield_now().await;
        }

        assert_eq!(monitor.stop_daemons(Path::new("/p")).await.unwrap(), None);
        release.send(()).unwrap();
        assert_eq!(first.await.unwrap().unwrap(), Some("Stopped".to_string()));
        assert_eq!(control.stops.load(Ordering::SeqCst), 1);

        // Allowed again once the first stop finished
        assert!(monitor.stop_daemons(Path::new("/p")).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_stop_daemon_refreshes_status() {
        let control = Arc::new(ControlledDaemons::default());
        let events = Arc::new(EventEmitter::default());
        let mut rx = events.subscribe();
        let monitor = DaemonMonitor::new(control.clone(), events);

        let message = monitor.stop_daemon(Path::new("/p"), "42").await.unwrap();
        assert_eq!(message.as_deref(), Some("Stopped 42"));

        let envelope = rx.try_recv().unwrap();
        assert!(matches!(
            envelope.event,
            taskgate_core::SystemEvent::Daemon(DaemonEvent::StatusUpdated { daemon_count: 0, .. })
        ));
    }
}
