//! Event subscriber that mirrors bus traffic into the tracing log

use crate::events::{
    CatalogEvent, ConnectionEvent, DaemonEvent, EventEnvelope, EventSubscriber, SessionEvent,
    SystemEvent, TaskEvent,
};
use async_trait::async_trait;
use tracing::{debug, info, warn};

/// Logs every event it receives. Progress chatter is only logged when verbose.
pub struct LoggingSubscriber {
    verbose: bool,
}

impl LoggingSubscriber {
    pub fn new(verbose: bool) -> Self {
        Self { verbose }
    }

    fn log_connection(&self, event: &ConnectionEvent) {
        match event {
            ConnectionEvent::StateChanged { state } => debug!(%state, "connection state changed"),
            ConnectionEvent::Ready => info!("build server ready"),
            ConnectionEvent::Failed { message } => {
                warn!(%message, "build server connection failed, restart to retry")
            }
        }
    }

    fn log_task(&self, event: &TaskEvent) {
        match event {
            TaskEvent::StateChanged { identity, state } => {
                debug!(task = %identity, %state, "task state changed")
            }
            TaskEvent::Progress { identity, message } => {
                if self.verbose {
                    debug!(task = %identity, %message, "task progress");
                }
            }
            TaskEvent::Cancelled { identity, message } => {
                info!(task = %identity, %message, "task cancelled")
            }
            TaskEvent::Completed { identity, run_id } => {
                info!(task = %identity, run_id, "task completed")
            }
            TaskEvent::Failed {
                identity,
                run_id,
                error,
            } => warn!(task = %identity, run_id, %error, "task failed"),
        }
    }
}

impl Default for LoggingSubscriber {
    fn default() -> Self {
        Self::new(false)
    }
}

#[async_trait]
impl EventSubscriber for LoggingSubscriber {
    async fn handle_event(
        &self,
        envelope: &EventEnvelope,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        match &envelope.event {
            SystemEvent::Connection(event) => self.log_connection(event),
            SystemEvent::Task(event) => self.log_task(event),
            SystemEvent::Catalog(CatalogEvent::Loaded {
                task_count,
                root_count,
            }) => info!(task_count, root_count, "task catalog loaded"),
            SystemEvent::Catalog(CatalogEvent::Invalidated) => debug!("task catalog invalidated"),
            SystemEvent::Session(SessionEvent::SetChanged { key, live_sessions }) => {
                let key = key.as_ref().map(ToString::to_string).unwrap_or_default();
                debug!(%key, live_sessions, "output sessions changed")
            }
            SystemEvent::Daemon(DaemonEvent::StatusUpdated { root, daemon_count }) => {
                debug!(root = %root.display(), daemon_count, "daemon status updated")
            }
            SystemEvent::Daemon(DaemonEvent::StopRequested { root }) => {
                info!(root = %root.display(), "stopping build daemons")
            }
        }
        Ok(())
    }

    fn name(&self) -> &'static str {
        "logging"
    }
}
