//! Integration tests for the coordination components wired through `TaskGate`
use serde_json::{json, Value};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use taskgate_config::ClientSettings;
use taskgate_core::{
    ConnectionState, InvocationRecord, LifecycleState, ReusePolicy, TaskIdentity,
};
use taskgate_task::protocol::{
    OutputStream, ServerFrame, METHOD_CANCEL_BUILD, METHOD_GET_BUILD, METHOD_RUN_BUILD,
};
use taskgate_task::testing::{ManualLauncher, ScriptedTransport};
use taskgate_task::{BufferedSessionFactory, OutputSession, RunOutcome, TaskGate};
use tempfile::TempDir;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixListener;

struct Harness {
    gate: TaskGate,
    launcher: Arc<ManualLauncher>,
    transport: Arc<ScriptedTransport>,
    sessions: Arc<BufferedSessionFactory>,
}

fn settings(roots: &[&str], policy: ReusePolicy) -> ClientSettings {
    ClientSettings {
        connect_timeout_secs: 2,
        reuse_policy: policy,
        suppress_confirmation: true,
        project_roots: roots.iter().map(PathBuf::from).collect(),
        ..ClientSettings::default()
    }
}

fn harness(settings: ClientSettings, launcher: ManualLauncher) -> Harness {
    let launcher = Arc::new(launcher);
    let transport = Arc::new(ScriptedTransport::new());
    transport.on_unary(METHOD_CANCEL_BUILD, |_| {
        Ok(json!({"message": "Cancel requested", "taskRunning": true}))
    });
    let sessions = Arc::new(BufferedSessionFactory::new());
    let gate = TaskGate::builder(settings)
        .launcher(launcher.clone())
        .transport(transport.clone())
        .sessions(sessions.clone())
        .build();
    Harness {
        gate,
        launcher,
        transport,
        sessions,
    }
}

fn task_json(root: &str, task: &str) -> Value {
    json!({
        "identity": {"project_root": root, "task_path": task, "project_name": ""},
        "script_path": format!(":{task}"),
        "build_file": format!("{root}/build.gradle"),
        "root_project": "app"
    })
}

async fn wait_for_state(gate: &TaskGate, identity: &TaskIdentity, state: LifecycleState) {
    tokio::time::timeout(Duration::from_secs(2), async {
        while gate.runner().tracker().state(identity) != state {
            tokio::task::yield_now().await;
        }
    })
    .await
    .unwrap();
}

#[tokio::test]
async fn test_connect_run_reject_cancel_rerun() {
    let h = harness(settings(&["/p"], ReusePolicy::Off), ManualLauncher::manual());
    assert_eq!(h.gate.connection().state(), ConnectionState::Disconnected);

    let start = tokio::spawn({
        let connection = h.gate.connection().clone();
        async move { connection.start().await }
    });
    while h.launcher.launches() == 0 {
        tokio::task::yield_now().await;
    }
    assert_eq!(h.gate.connection().state(), ConnectionState::Connecting);
    h.launcher.signals().unwrap().started();
    start.await.unwrap().unwrap();
    assert_eq!(h.gate.connection().state(), ConnectionState::Ready);

    h.transport.hold_streams(METHOD_RUN_BUILD);
    let identity = TaskIdentity::new("/p", "build", "");
    let record = InvocationRecord::new(identity.clone(), "", false);

    let run = tokio::spawn({
        let runner = h.gate.runner().clone();
        let record = record.clone();
        async move { runner.run(record).await }
    });
    let stream = h.transport.next_stream().await.unwrap();
    assert_eq!(
        h.gate.runner().tracker().state(&identity),
        LifecycleState::Running
    );

    let duplicate = h.gate.runner().tracker().try_start(record.clone());
    assert!(duplicate.unwrap_err().is_logical_conflict());

    stream.send(ServerFrame::Cancelled {
        message: "Build cancelled".into(),
    });
    wait_for_state(&h.gate, &identity, LifecycleState::Idle).await;

    let rerun = h.gate.runner().tracker().try_start(record).unwrap();
    h.gate.runner().tracker().settle(&rerun);

    stream.close();
    assert!(matches!(
        run.await.unwrap().unwrap(),
        RunOutcome::Cancelled { .. }
    ));
}

#[tokio::test]
async fn test_restart_waits_for_acknowledgement() {
    let h = harness(settings(&["/p"], ReusePolicy::Off), ManualLauncher::auto_start());
    h.gate.start().await.unwrap();
    h.transport.hold_streams(METHOD_RUN_BUILD);

    let identity = TaskIdentity::new("/p", "test", "");
    let record = InvocationRecord::new(identity.clone(), "--tests Foo", false);
    let run = tokio::spawn({
        let runner = h.gate.runner().clone();
        let record = record.clone();
        async move { runner.run(record).await }
    });
    let first = h.transport.next_stream().await.unwrap();

    assert!(h.gate.runner().restart(&identity).await.unwrap());
    assert_eq!(
        h.gate.runner().tracker().state(&identity),
        LifecycleState::Cancelling
    );
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(h.transport.stream_calls(METHOD_RUN_BUILD), 1);

    first.send(ServerFrame::Cancelled {
        message: "Build cancelled".into(),
    });
    let second = h.transport.next_stream().await.unwrap();
    assert_eq!(second.params["args"], json!(["--tests", "Foo"]));
    assert_eq!(second.params["taskPath"], "test");

    first.close();
    run.await.unwrap().unwrap();
    second.send(ServerFrame::Result {
        value: json!({"exitCode": 0}),
    });
    second.close();
    wait_for_state(&h.gate, &identity, LifecycleState::Idle).await;
}

#[tokio::test]
async fn test_catalog_single_flight_across_roots() {
    let h = harness(
        settings(&["/a", "/b"], ReusePolicy::Off),
        ManualLauncher::auto_start(),
    );
    h.transport.on_stream(METHOD_GET_BUILD, |params| {
        let root = params["projectRoot"].as_str().unwrap_or_default().to_string();
        Ok(vec![ServerFrame::Result {
            value: json!({"tasks": [task_json(&root, "build"), task_json(&root, "test")]}),
        }])
    });
    h.gate.start().await.unwrap();

    let (first, second) = tokio::join!(h.gate.tasks(), h.gate.tasks());
    let (first, second) = (first.unwrap(), second.unwrap());
    assert!(Arc::ptr_eq(&first, &second));
    assert_eq!(first.len(), 4);
    assert_eq!(h.transport.stream_calls(METHOD_GET_BUILD), 2);

    let definition = h.gate.resolve(":build").await.unwrap();
    assert_eq!(definition.identity.task_path, "build");
    assert!(h.gate.resolve("deploy").await.is_err());
}

#[tokio::test]
async fn test_global_policy_clears_all_sessions() {
    let h = harness(settings(&["/p"], ReusePolicy::Global), ManualLauncher::auto_start());
    h.transport.on_stream(METHOD_RUN_BUILD, |_| {
        Ok(vec![ServerFrame::Output {
            stream: OutputStream::Out,
            text: "done\n".into(),
        }])
    });
    h.gate.start().await.unwrap();

    for task in ["build", "test", "build"] {
        let record = InvocationRecord::new(TaskIdentity::new("/p", task, ""), "", false);
        h.gate.runner().run(record).await.unwrap();
    }

    let created = h.sessions.created();
    assert_eq!(created.len(), 3);
    assert!(created[0].is_disposed());
    assert!(created[1].is_disposed());
    assert!(!created[2].is_disposed());
    assert_eq!(h.gate.runner().sessions().len(), 1);
}

/// Serve newline-delimited JSON-RPC calls until the listener is dropped.
fn serve(listener: UnixListener) {
    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            tokio::spawn(async move {
                let (read, mut write) = stream.into_split();
                let mut line = String::new();
                BufReader::new(read).read_line(&mut line).await.unwrap();
                let request: Value = serde_json::from_str(&line).unwrap();
                let id = request["id"].clone();
                let root = request["params"]["projectRoot"]
                    .as_str()
                    .unwrap_or_default()
                    .to_string();

                let replies = match request["method"].as_str().unwrap_or_default() {
                    "getBuild" => vec![json!({"jsonrpc": "2.0", "id": id, "frame": {
                        "kind": "result",
                        "value": {"tasks": [task_json(&root, "assemble")]}
                    }})],
                    "runBuild" => vec![
                        json!({"jsonrpc": "2.0", "id": id, "frame": {"kind": "progress", "message": "Configuring"}}),
                        json!({"jsonrpc": "2.0", "id": id, "frame": {"kind": "output", "stream": "out", "text": "assembled\n"}}),
                        json!({"jsonrpc": "2.0", "id": id, "frame": {"kind": "result", "value": {"exitCode": 0}}}),
                    ],
                    "getDaemonsStatus" => vec![json!({"jsonrpc": "2.0", "id": id, "result": {
                        "daemons": [{"pid": "77", "status": "idle", "info": "8.5"}]
                    }})],
                    method => vec![json!({"jsonrpc": "2.0", "id": id, "error": {
                        "code": -32601, "message": format!("unknown method {method}")
                    }})],
                };
                for reply in replies {
                    write.write_all(format!("{reply}\n").as_bytes()).await.unwrap();
                }
                write.shutdown().await.unwrap();
            });
        }
    });
}

#[tokio::test]
async fn test_unix_socket_server_roundtrip() {
    let temp_dir = TempDir::new().unwrap();
    let socket_path = temp_dir.path().join("server.sock");
    serve(UnixListener::bind(&socket_path).unwrap());

    let settings = ClientSettings {
        socket_path: socket_path.clone(),
        server_executable: None,
        ..settings(&["/repo"], ReusePolicy::Off)
    };
    let sessions = Arc::new(BufferedSessionFactory::new());
    let gate = TaskGate::builder(settings).sessions(sessions.clone()).build();

    gate.start().await.unwrap();
    assert_eq!(gate.connection().state(), ConnectionState::Ready);

    let definition = gate.resolve("assemble").await.unwrap();
    let outcome = gate.run(&definition, "--offline", false).await.unwrap();
    assert_eq!(
        outcome,
        RunOutcome::Completed {
            run_id: 1,
            exit_code: Some(0)
        }
    );
    assert_eq!(sessions.created()[0].text(OutputStream::Out), "assembled\n");

    let status = gate.daemons().refresh(Path::new("/repo")).await.unwrap();
    assert_eq!(status.into_inner().daemons[0].pid, "77");
}
