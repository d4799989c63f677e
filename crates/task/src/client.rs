//! Typed build server client
//!
//! Every new call first passes the connection's ready gate. Calls already in
//! flight finish or fail on their own when the connection later drops.

use crate::catalog::TaskDiscovery;
use crate::connection::ConnectionManager;
use crate::daemons::DaemonControl;
use crate::lifecycle::{InvocationHandle, TaskCanceller};
use crate::protocol::{
    BuildServerTransport, CancelBuildParams, CancelBuildReply, CancelBuildsReply,
    DaemonStatusParams, DaemonStatusSnapshot, FrameStream, GetBuildParams, GetBuildResult,
    RunBuildParams, StopDaemonParams, StopDaemonReply, StopDaemonsParams, StopDaemonsReply,
    METHOD_CANCEL_BUILD, METHOD_CANCEL_BUILDS, METHOD_DAEMON_STATUS, METHOD_GET_BUILD,
    METHOD_RUN_BUILD, METHOD_STOP_DAEMON, METHOD_STOP_DAEMONS,
};
use crate::stream::StreamingCall;
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::path::Path;
use std::sync::Arc;
use taskgate_core::events::{ConnectionEvent, EventEmitter};
use taskgate_core::{Error, Result, TaskDefinition};
use taskgate_utils::tracing::rpc_span;
use tracing::{debug, warn, Instrument};

pub struct BuildServerClient {
    transport: Arc<dyn BuildServerTransport>,
    connection: Arc<ConnectionManager>,
    events: Arc<EventEmitter>,
}

impl BuildServerClient {
    pub fn new(
        transport: Arc<dyn BuildServerTransport>,
        connection: Arc<ConnectionManager>,
        events: Arc<EventEmitter>,
    ) -> Self {
        Self {
            transport,
            connection,
            events,
        }
    }

    pub fn connection(&self) -> &Arc<ConnectionManager> {
        &self.connection
    }

    /// Surface transport failures as a connection-failed notification.
    fn observe<T>(&self, result: Result<T>) -> Result<T> {
        if let Err(e) = &result {
            if e.is_transport() {
                warn!(endpoint = %self.transport.endpoint(), error = %e, "build server call failed");
                self.events.emit(ConnectionEvent::Failed {
                    message: e.to_string(),
                });
            }
        }
        result
    }

    async fn open(&self, method: &str, params: impl Serialize) -> Result<FrameStream> {
        self.observe(self.connection.wait_until_ready().await)?;
        let params = serde_json::to_value(params)?;
        let opened = self
            .transport
            .open_stream(method, params)
            .instrument(rpc_span(method))
            .await;
        self.observe(opened)
    }

    async fn call<R: DeserializeOwned>(&self, method: &str, params: impl Serialize) -> Result<R> {
        self.observe(self.connection.wait_until_ready().await)?;
        let params = serde_json::to_value(params)?;
        let reply = self
            .transport
            .unary(method, params)
            .instrument(rpc_span(method))
            .await;
        let reply = self.observe(reply)?;
        serde_json::from_value(reply)
            .map_err(|e| Error::protocol(format!("invalid reply to '{method}': {e}")))
    }

    /// Discover the tasks of one project root.
    pub async fn discover_tasks(&self, project_root: &Path) -> Result<Vec<TaskDefinition>> {
        let frames = self
            .open(
                METHOD_GET_BUILD,
                GetBuildParams {
                    project_root: project_root.to_path_buf(),
                },
            )
            .await?;

        let root = project_root.display().to_string();
        let result = StreamingCall::<GetBuildResult>::new(METHOD_GET_BUILD)
            .on_progress(move |message| debug!(%root, "{message}"))
            .complete(frames)
            .await;

        Ok(self.observe(result)?.map(|found| found.tasks).unwrap_or_default())
    }

    /// Start the streaming run of a registered invocation.
    pub async fn run_task(&self, handle: &InvocationHandle) -> Result<FrameStream> {
        let record = &handle.record;
        let args = shlex::split(&record.args).ok_or_else(|| {
            Error::configuration(format!("invalid task arguments '{}'", record.args))
        })?;

        self.open(
            METHOD_RUN_BUILD,
            RunBuildParams {
                project_root: record.identity.project_root.clone(),
                task_path: record.identity.task_path.clone(),
                project_name: record.identity.project_name.clone(),
                args,
                debug: record.debug,
                cancellation_key: handle.cancellation_key.clone(),
            },
        )
        .await
    }

    pub async fn cancel_run(&self, cancellation_key: &str) -> Result<CancelBuildReply> {
        self.call(
            METHOD_CANCEL_BUILD,
            CancelBuildParams {
                cancellation_key: cancellation_key.to_string(),
            },
        )
        .await
    }

    pub async fn cancel_all(&self) -> Result<CancelBuildsReply> {
        self.call(METHOD_CANCEL_BUILDS, serde_json::json!({})).await
    }

    pub async fn daemon_status(&self, project_root: &Path) -> Result<DaemonStatusSnapshot> {
        self.call(
            METHOD_DAEMON_STATUS,
            DaemonStatusParams {
                project_root: project_root.to_path_buf(),
            },
        )
        .await
    }

    pub async fn stop_daemons(&self, project_root: &Path) -> Result<StopDaemonsReply> {
        self.call(
            METHOD_STOP_DAEMONS,
            StopDaemonsParams {
                project_root: project_root.to_path_buf(),
            },
        )
        .await
    }

    pub async fn stop_daemon(&self, pid: &str) -> Result<StopDaemonReply> {
        self.call(
            METHOD_STOP_DAEMON,
            StopDaemonParams {
                pid: pid.to_string(),
            },
        )
        .await
    }
}

#[async_trait]
impl TaskDiscovery for BuildServerClient {
    async fn discover_tasks(&self, project_root: &Path) -> Result<Vec<TaskDefinition>> {
        BuildServerClient::discover_tasks(self, project_root).await
    }
}

#[async_trait]
impl TaskCanceller for BuildServerClient {
    async fn cancel(&self, cancellation_key: &str) -> Result<()> {
        let reply = self.cancel_run(cancellation_key).await?;
        debug!(
            task_running = reply.task_running,
            message = %reply.message,
            "cancel requested"
        );
        Ok(())
    }

    async fn cancel_all(&self) -> Result<()> {
        let reply = BuildServerClient::cancel_all(self).await?;
        debug!(message = %reply.message, "cancel all requested");
        Ok(())
    }
}

#[async_trait]
impl DaemonControl for BuildServerClient {
    async fn status(&self, project_root: &Path) -> Result<DaemonStatusSnapshot> {
        self.daemon_status(project_root).await
    }

    async fn stop_all(&self, project_root: &Path) -> Result<String> {
        Ok(self.stop_daemons(project_root).await?.message)
    }

    async fn stop_one(&self, pid: &str) -> Result<String> {
        Ok(self.stop_daemon(pid).await?.message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{DaemonState, ServerFrame};
    use crate::testing::{ManualLauncher, ScriptedTransport};
    use serde_json::json;
    use std::time::Duration;
    use taskgate_core::events::SystemEvent;
    use taskgate_core::{InvocationRecord, TaskIdentity};

    async fn ready_client(transport: Arc<ScriptedTransport>) -> (BuildServerClient, Arc<EventEmitter>) {
        let events = Arc::new(EventEmitter::default());
        let connection = Arc::new(ConnectionManager::new(
            Arc::new(ManualLauncher::auto_start()),
            Duration::from_secs(1),
            events.clone(),
        ));
        connection.start().await.unwrap();
        (BuildServerClient::new(transport, connection, events.clone()), events)
    }

    #[tokio::test]
    async fn test_discover_tasks_decodes_result_frame() {
        let transport = Arc::new(ScriptedTransport::new());
        transport.on_stream(METHOD_GET_BUILD, |params| {
            assert_eq!(params["projectRoot"], "/p");
            Ok(vec![
                ServerFrame::Progress {
                    message: "configuring".into(),
                },
                ServerFrame::Result {
                    value: json!({"tasks": [{
                        "identity": {"project_root": "/p", "task_path": "build", "project_name": ""},
                        "script_path": ":build",
                        "build_file": "/p/build.gradle",
                        "root_project": "p"
                    }]}),
                },
            ])
        });
        let (client, _) = ready_client(transport.clone()).await;

        let tasks = client.discover_tasks(Path::new("/p")).await.unwrap();
        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks[0].identity, TaskIdentity::new("/p", "build", ""));
        assert_eq!(transport.stream_calls(METHOD_GET_BUILD), 1);
    }

    #[tokio::test]
    async fn test_run_task_sends_split_arguments() {
        let transport = Arc::new(ScriptedTransport::new());
        transport.on_stream(METHOD_RUN_BUILD, |params| {
            assert_eq!(params["args"], json!(["--info", "-Pname=two words"]));
            assert_eq!(params["debug"], true);
            assert!(params["cancellationKey"].as_str().is_some());
            Ok(Vec::new())
        });
        let (client, _) = ready_client(transport).await;

        let handle = InvocationHandle {
            record: InvocationRecord::new(
                TaskIdentity::new("/p", "build", ""),
                "--info '-Pname=two words'",
                true,
            ),
            run_id: 1,
            cancellation_key: "key-1".into(),
        };
        client.run_task(&handle).await.unwrap();

        let bad = InvocationHandle {
            record: InvocationRecord::new(TaskIdentity::new("/p", "build", ""), "'open", false),
            ..handle
        };
        assert!(matches!(
            client.run_task(&bad).await.err().unwrap(),
            Error::Configuration { .. }
        ));
    }

    #[tokio::test]
    async fn test_unary_calls_decode_replies() {
        let transport = Arc::new(ScriptedTransport::new());
        transport.on_unary(METHOD_DAEMON_STATUS, |_| {
            Ok(json!({"daemons": [{"pid": "42", "status": "busy", "info": ""}]}))
        });
        transport.on_unary(METHOD_CANCEL_BUILD, |params| {
            assert_eq!(params["cancellationKey"], "abc");
            Ok(json!({"message": "Cancel requested", "taskRunning": true}))
        });
        let (client, _) = ready_client(transport).await;

        let snapshot = client.daemon_status(Path::new("/p")).await.unwrap();
        assert_eq!(snapshot.daemons[0].status, DaemonState::Busy);

        let reply = client.cancel_run("abc").await.unwrap();
        assert!(reply.task_running);
    }

    #[tokio::test]
    async fn test_transport_error_emits_connection_failed() {
        let transport = Arc::new(ScriptedTransport::new());
        transport.on_unary(METHOD_CANCEL_BUILDS, |_| {
            Err(Error::transport("/tmp/server.sock", "connection refused"))
        });
        let (client, events) = ready_client(transport).await;
        let mut rx = events.subscribe();

        assert!(client.cancel_all().await.is_err());
        let envelope = rx.try_recv().unwrap();
        assert!(matches!(
            envelope.event,
            SystemEvent::Connection(ConnectionEvent::Failed { .. })
        ));
    }

    #[tokio::test]
    async fn test_calls_wait_for_ready_gate() {
        let events = Arc::new(EventEmitter::default());
        let connection = Arc::new(ConnectionManager::new(
            Arc::new(ManualLauncher::manual()),
            Duration::from_millis(50),
            events.clone(),
        ));
        let transport = Arc::new(ScriptedTransport::new());
        let client = BuildServerClient::new(transport.clone(), connection, events);

        let error = client.daemon_status(Path::new("/p")).await.unwrap_err();
        assert!(matches!(error, Error::Timeout { .. }));
        assert_eq!(transport.unary_calls(METHOD_DAEMON_STATUS), 0);
    }
}
