//! Worker end-to-end test against a scripted coordinator: register, receive
//! an assignment, run a fake assistant CLI, and relay the stream back.

#![cfg(unix)]

use std::io::Write;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpListener;
use tokio::time::timeout;
use tokio_tungstenite::accept_async;
use tokio_tungstenite::tungstenite::protocol::Message;

use taskbridge_protocol::types::{
    RegisterAck, RegisterPayload, TaskAssignPayload, TaskCompletePayload, TaskErrorPayload,
};
use taskbridge_protocol::{Envelope, MessageType, PROTOCOL_VERSION};
use taskbridge_worker::worker::{self, ReconnectBackoff, WorkerConfig};

fn fake_cli(dir: &Path, body: &str) -> PathBuf {
    let path = dir.join("fake-cli.sh");
    let mut file = std::fs::File::create(&path).unwrap();
    writeln!(file, "#!/bin/sh").unwrap();
    writeln!(file, "{}", body).unwrap();
    let mut perms = file.metadata().unwrap().permissions();
    perms.set_mode(0o755);
    std::fs::set_permissions(&path, perms).unwrap();
    path
}

fn config(url: String, cli: &Path, cwd: &Path) -> WorkerConfig {
    WorkerConfig {
        coordinator_url: url,
        shared_secret: "secret".to_string(),
        name: "wtest".to_string(),
        cli_command: cli.to_str().unwrap().to_string(),
        default_cwd: cwd.to_path_buf(),
        allowed_dirs: vec![],
    }
}

#[tokio::test]
async fn test_worker_registers_runs_task_and_reports_completion() {
    let dir = tempfile::tempdir().unwrap();
    let cli = fake_cli(
        dir.path(),
        concat!(
            r#"echo '{"type":"assistant","content":[{"type":"text","text":"Hi"}]}'"#,
            "\n",
            r#"echo '{"type":"result","result":"Hi","session_id":"s1","usage":{"input_tokens":10,"output_tokens":2}}'"#,
        ),
    );

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let worker_config = config(format!("ws://{}", addr), &cli, dir.path());

    // Scripted coordinator side.
    let server = tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let mut ws = accept_async(stream).await.unwrap();

        // Expect the register handshake.
        let register = loop {
            match ws.next().await.unwrap().unwrap() {
                Message::Text(text) => {
                    let envelope = Envelope::decode(text.as_str()).unwrap();
                    if envelope.message_type == MessageType::WorkerRegister {
                        break envelope;
                    }
                }
                _ => continue,
            }
        };
        let payload: RegisterPayload = register.payload_as().unwrap();
        assert_eq!(payload.name, "wtest");
        assert_eq!(payload.secret, "secret");
        assert_eq!(payload.protocol_version, PROTOCOL_VERSION);

        let ack = Envelope::new(
            MessageType::WorkerRegisterAck,
            &RegisterAck {
                success: true,
                message: None,
                protocol_version: PROTOCOL_VERSION.to_string(),
            },
        )
        .unwrap()
        .with_worker("wtest");
        ws.send(Message::text(ack.encode().unwrap())).await.unwrap();

        // Assign one task.
        let assign = Envelope::new(
            MessageType::TaskAssign,
            &TaskAssignPayload {
                prompt: "hello".to_string(),
                cwd: None,
                permission_mode: Default::default(),
                team_mode: false,
                session_id: None,
                attachments: vec![],
            },
        )
        .unwrap()
        .with_task("task-1")
        .with_worker("wtest");
        ws.send(Message::text(assign.encode().unwrap())).await.unwrap();

        // Collect frames until the completion report.
        let mut stream_events = 0usize;
        let complete: TaskCompletePayload = loop {
            match ws.next().await.unwrap().unwrap() {
                Message::Text(text) => {
                    let envelope = Envelope::decode(text.as_str()).unwrap();
                    match envelope.message_type {
                        MessageType::TaskStream => stream_events += 1,
                        MessageType::TaskComplete => {
                            assert_eq!(envelope.task_id.as_deref(), Some("task-1"));
                            break envelope.payload_as().unwrap();
                        }
                        MessageType::TaskError => {
                            let err: TaskErrorPayload = envelope.payload_as().unwrap();
                            panic!("task failed: {} {}", err.code, err.message);
                        }
                        _ => {}
                    }
                }
                Message::Close(_) => panic!("worker closed early"),
                _ => {}
            }
        };
        let _ = ws.send(Message::Close(None)).await;
        (stream_events, complete)
    });

    // Run the worker for this single connection.
    let worker_task = tokio::spawn(async move {
        let mut backoff = ReconnectBackoff::new();
        let _ = worker::run_connection(&worker_config, &mut backoff).await;
    });

    let (stream_events, complete) = timeout(Duration::from_secs(10), server)
        .await
        .unwrap()
        .unwrap();
    assert!(stream_events >= 2, "only {} stream events", stream_events);
    assert_eq!(complete.result_text, "Hi");
    assert_eq!(complete.session_id.as_deref(), Some("s1"));
    assert_eq!(complete.usage.input, 10);
    assert_eq!(complete.usage.output, 2);

    let _ = timeout(Duration::from_secs(5), worker_task).await;
}

#[tokio::test]
async fn test_worker_rejects_disallowed_cwd() {
    let dir = tempfile::tempdir().unwrap();
    let cli = fake_cli(dir.path(), "exit 0");

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let mut worker_config = config(format!("ws://{}", addr), &cli, dir.path());
    worker_config.allowed_dirs = vec![dir.path().to_path_buf()];

    let server = tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let mut ws = accept_async(stream).await.unwrap();

        loop {
            if let Message::Text(text) = ws.next().await.unwrap().unwrap() {
                if Envelope::decode(text.as_str()).unwrap().message_type == MessageType::WorkerRegister {
                    break;
                }
            }
        }
        let ack = Envelope::new(
            MessageType::WorkerRegisterAck,
            &RegisterAck {
                success: true,
                message: None,
                protocol_version: PROTOCOL_VERSION.to_string(),
            },
        )
        .unwrap();
        ws.send(Message::text(ack.encode().unwrap())).await.unwrap();

        let assign = Envelope::new(
            MessageType::TaskAssign,
            &TaskAssignPayload {
                prompt: "nope".to_string(),
                cwd: Some("/etc".to_string()),
                permission_mode: Default::default(),
                team_mode: false,
                session_id: None,
                attachments: vec![],
            },
        )
        .unwrap()
        .with_task("task-9")
        .with_worker("wtest");
        ws.send(Message::text(assign.encode().unwrap())).await.unwrap();

        let error: TaskErrorPayload = loop {
            if let Message::Text(text) = ws.next().await.unwrap().unwrap() {
                let envelope = Envelope::decode(text.as_str()).unwrap();
                if envelope.message_type == MessageType::TaskError {
                    assert_eq!(envelope.task_id.as_deref(), Some("task-9"));
                    break envelope.payload_as().unwrap();
                }
            }
        };
        let _ = ws.send(Message::Close(None)).await;
        error
    });

    let worker_task = tokio::spawn(async move {
        let mut backoff = ReconnectBackoff::new();
        let _ = worker::run_connection(&worker_config, &mut backoff).await;
    });

    let error = timeout(Duration::from_secs(10), server).await.unwrap().unwrap();
    assert_eq!(error.code, "DIRECTORY_NOT_ALLOWED");
    assert!(error.message.contains("/etc"));

    let _ = timeout(Duration::from_secs(5), worker_task).await;
}
