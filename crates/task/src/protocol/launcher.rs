//! Launching the build server process
//!
//! The server is started as `<executable> [args..] <socket-path>` and counts
//! as started once the socket path appears. Without an executable the launcher
//! attaches to a server that is already listening on the socket.

use crate::connection::{ProcessSignals, ServerLauncher};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use taskgate_core::{Error, Result};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

const SOCKET_POLL_INTERVAL: Duration = Duration::from_millis(100);

enum Running {
    Child {
        kill: oneshot::Sender<()>,
        monitor: JoinHandle<()>,
    },
    Attached {
        signals: ProcessSignals,
    },
}

/// [`ServerLauncher`] that spawns the server executable or attaches to a
/// running server.
pub struct ExecutableLauncher {
    executable: Option<PathBuf>,
    args: Vec<String>,
    socket_path: PathBuf,
    running: Mutex<Option<Running>>,
    /// Id of the latest spawn; only that spawn may remove the socket
    current_launch: Arc<AtomicU64>,
}

impl ExecutableLauncher {
    pub fn new(executable: Option<PathBuf>, socket_path: impl Into<PathBuf>) -> Self {
        Self {
            executable,
            args: Vec::new(),
            socket_path: socket_path.into(),
            running: Mutex::new(None),
            current_launch: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Arguments passed before the socket path.
    pub fn with_args(mut self, args: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    /// Stop whatever this launcher started and wait for the process to exit.
    async fn stop_running(&self) {
        let running = self.running.lock().take();
        match running {
            Some(Running::Child { kill, monitor }) => {
                // Err means the monitor already saw the process exit
                let _ = kill.send(());
                if let Err(e) = monitor.await {
                    warn!(error = %e, "build server monitor failed");
                }
            }
            Some(Running::Attached { signals }) => signals.ended(),
            None => debug!("stop requested with no build server running"),
        }
    }

    async fn spawn(&self, executable: &Path, signals: ProcessSignals) -> Result<()> {
        self.stop_running().await;

        // Remove socket if it exists
        if self.socket_path.exists() {
            tokio::fs::remove_file(&self.socket_path)
                .await
                .map_err(|e| {
                    Error::file_system(self.socket_path.clone(), "remove existing socket", e)
                })?;
        }

        let mut cmd = Command::new(executable);
        cmd.args(&self.args)
            .arg(&self.socket_path)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd.spawn().map_err(|e| {
            Error::connection_failed(format!(
                "failed to launch build server '{}': {e}",
                executable.display()
            ))
        })?;
        info!(
            executable = %executable.display(),
            pid = child.id(),
            socket = %self.socket_path.display(),
            "launched build server"
        );

        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    debug!(target: "taskgate::server", "{line}");
                }
            });
        }

        let launch = self.current_launch.fetch_add(1, Ordering::SeqCst) + 1;
        let owner = SocketOwner {
            path: self.socket_path.clone(),
            current_launch: self.current_launch.clone(),
            launch,
        };
        let (kill, kill_rx) = oneshot::channel();
        let monitor = tokio::spawn(monitor(child, owner, kill_rx, signals));
        *self.running.lock() = Some(Running::Child { kill, monitor });
        Ok(())
    }
}

/// Socket path as seen by one spawn.
struct SocketOwner {
    path: PathBuf,
    current_launch: Arc<AtomicU64>,
    launch: u64,
}

impl SocketOwner {
    fn is_current(&self) -> bool {
        self.current_launch.load(Ordering::SeqCst) == self.launch
    }
}

/// Report readiness once the socket appears and the end of the process when
/// it exits or is killed.
async fn monitor(
    mut child: Child,
    socket: SocketOwner,
    mut kill_rx: oneshot::Receiver<()>,
    signals: ProcessSignals,
) {
    let mut announced = false;
    let mut poll = tokio::time::interval(SOCKET_POLL_INTERVAL);

    loop {
        tokio::select! {
            status = child.wait() => {
                match status {
                    Ok(status) => info!(%status, "build server exited"),
                    Err(e) => warn!(error = %e, "failed to wait for build server"),
                }
                break;
            }
            _ = &mut kill_rx => {
                if let Err(e) = child.kill().await {
                    warn!(error = %e, "failed to kill build server");
                }
                info!("build server stopped");
                break;
            }
            _ = poll.tick(), if !announced => {
                if socket.path.exists() {
                    announced = true;
                    signals.started();
                }
            }
        }
    }

    if socket.is_current() {
        let _ = tokio::fs::remove_file(&socket.path).await;
    } else {
        debug!(launch = socket.launch, "socket belongs to a newer launch, leaving it");
    }
    signals.ended();
}

#[async_trait]
impl ServerLauncher for ExecutableLauncher {
    async fn launch(&self, signals: ProcessSignals) -> Result<()> {
        match &self.executable {
            Some(executable) => self.spawn(executable, signals).await,
            None if self.socket_path.exists() => {
                debug!(socket = %self.socket_path.display(), "attaching to running build server");
                *self.running.lock() = Some(Running::Attached {
                    signals: signals.clone(),
                });
                signals.started();
                Ok(())
            }
            None => Err(Error::connection_failed(format!(
                "no build server listening on '{}' and no server executable configured",
                self.socket_path.display()
            ))),
        }
    }

    async fn stop(&self) -> Result<()> {
        self.stop_running().await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::ConnectionManager;
    use std::sync::Arc;
    use taskgate_core::{ConnectionState, EventEmitter};
    use tempfile::TempDir;

    fn manager(launcher: ExecutableLauncher) -> ConnectionManager {
        ConnectionManager::new(
            Arc::new(launcher),
            Duration::from_secs(5),
            Arc::new(EventEmitter::default()),
        )
    }

    #[tokio::test]
    async fn test_missing_executable_fails() {
        let temp_dir = TempDir::new().unwrap();
        let launcher = ExecutableLauncher::new(
            Some(PathBuf::from("/nonexistent/taskgate-server")),
            temp_dir.path().join("server.sock"),
        );
        let connection = manager(launcher);

        let error = connection.start().await.unwrap_err();
        assert!(error.to_string().contains("failed to launch build server"));
        assert_eq!(connection.state(), ConnectionState::Failed);
    }

    #[tokio::test]
    async fn test_attach_requires_listening_socket() {
        let temp_dir = TempDir::new().unwrap();
        let socket_path = temp_dir.path().join("server.sock");

        let connection = manager(ExecutableLauncher::new(None, &socket_path));
        assert!(connection.start().await.is_err());

        std::fs::write(&socket_path, b"").unwrap();
        let connection = manager(ExecutableLauncher::new(None, &socket_path));
        connection.start().await.unwrap();
        assert_eq!(connection.state(), ConnectionState::Ready);

        connection.shutdown().await.unwrap();
        assert_eq!(connection.state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_spawned_server_ready_then_stopped() {
        let temp_dir = TempDir::new().unwrap();
        let socket_path = temp_dir.path().join("server.sock");
        let launcher = ExecutableLauncher::new(Some(PathBuf::from("/bin/sh")), &socket_path)
            .with_args(["-c", "touch \"$0\" && sleep 30"]);
        let connection = manager(launcher);
        let mut state = connection.subscribe();

        connection.start().await.unwrap();
        assert_eq!(connection.state(), ConnectionState::Ready);

        connection.shutdown().await.unwrap();
        state
            .wait_for(|s| *s == ConnectionState::Disconnected)
            .await
            .unwrap();
        assert!(!socket_path.exists());
    }

    #[tokio::test]
    async fn test_server_exiting_early_fails_connection() {
        let temp_dir = TempDir::new().unwrap();
        let launcher = ExecutableLauncher::new(
            Some(PathBuf::from("/bin/sh")),
            temp_dir.path().join("server.sock"),
        )
        .with_args(["-c", "exit 3"]);
        let connection = manager(launcher);

        assert!(connection.start().await.is_err());
        assert_eq!(connection.state(), ConnectionState::Failed);
    }

    #[tokio::test]
    async fn test_restart_after_timeout_keeps_new_server() {
        let temp_dir = TempDir::new().unwrap();
        let socket_path = temp_dir.path().join("server.sock");
        // Never becomes ready on the first launch, listens on every later one
        let launcher = ExecutableLauncher::new(Some(PathBuf::from("/bin/sh")), &socket_path)
            .with_args([
                "-c",
                "if [ -e \"$0.first\" ]; then touch \"$0\"; else touch \"$0.first\"; fi; exec sleep 30",
            ]);
        let connection = ConnectionManager::new(
            Arc::new(launcher),
            Duration::from_millis(500),
            Arc::new(EventEmitter::default()),
        );

        let error = connection.start().await.unwrap_err();
        assert!(matches!(error, Error::Timeout { .. }));
        assert_eq!(connection.state(), ConnectionState::Failed);

        connection.restart().await.unwrap();
        assert_eq!(connection.state(), ConnectionState::Ready);

        // The first server's exit must not touch the second one
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(connection.state(), ConnectionState::Ready);
        assert!(socket_path.exists());

        connection.shutdown().await.unwrap();
    }
}
