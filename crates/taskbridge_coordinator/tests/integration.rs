//! End-to-end coordinator tests over a real WebSocket transport, with a
//! scripted worker on the other side.

use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpListener;
use tokio::time::timeout;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::protocol::Message;

use taskbridge_coordinator::task::TaskOptions;
use taskbridge_coordinator::{server, Coordinator, CoordinatorEvent, CoordinatorHandle, EventReceiver};
use taskbridge_protocol::types::{
    HeartbeatPayload, RegisterAck, RegisterPayload, StreamEvent, TaskCompletePayload, TaskStatus,
    TokenUsage, WorkerStatus,
};
use taskbridge_protocol::{Envelope, MessageType, PROTOCOL_VERSION};

const SECRET: &str = "integration-secret";

type WsClient = tokio_tungstenite::WebSocketStream<
    tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
>;

async fn start_coordinator() -> (CoordinatorHandle, EventReceiver, String) {
    let (mut coordinator, handle, events) = Coordinator::new(SECRET.to_string());
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let commands = handle.command_sender();
    tokio::spawn(async move {
        let _ = server::serve_on(listener, commands).await;
    });
    tokio::spawn(async move {
        let _ = coordinator.run().await;
    });
    (handle, events, format!("ws://{}", addr))
}

async fn connect_worker(url: &str, name: &str, secret: &str) -> WsClient {
    let (mut ws, _) = connect_async(url).await.unwrap();
    let payload = RegisterPayload {
        name: name.to_string(),
        secret: secret.to_string(),
        protocol_version: PROTOCOL_VERSION.to_string(),
        os: "linux".to_string(),
        runtime_version: "test".to_string(),
        default_cwd: "/work".to_string(),
        allowed_dirs: vec![],
    };
    let envelope = Envelope::new(MessageType::WorkerRegister, &payload)
        .unwrap()
        .with_worker(name);
    ws.send(Message::text(envelope.encode().unwrap()))
        .await
        .unwrap();
    ws
}

async fn next_envelope(ws: &mut WsClient) -> Option<Envelope> {
    loop {
        let frame = timeout(Duration::from_secs(5), ws.next())
            .await
            .ok()??
            .ok()?;
        match frame {
            Message::Text(text) => return Some(Envelope::decode(text.as_str()).unwrap()),
            Message::Close(_) => return None,
            _ => continue,
        }
    }
}

async fn expect_register_ack(ws: &mut WsClient) -> RegisterAck {
    loop {
        let envelope = next_envelope(ws).await.expect("ack before close");
        if envelope.message_type == MessageType::WorkerRegisterAck {
            return envelope.payload_as().unwrap();
        }
    }
}

fn send_from_worker<T: serde::Serialize>(
    message_type: MessageType,
    payload: &T,
    task_id: &str,
    worker: &str,
) -> Message {
    let envelope = Envelope::new(message_type, payload)
        .unwrap()
        .with_task(task_id)
        .with_worker(worker);
    Message::text(envelope.encode().unwrap())
}

#[tokio::test]
async fn test_register_and_run_task_end_to_end() {
    let (handle, mut events, url) = start_coordinator().await;

    let mut ws = connect_worker(&url, "w1", SECRET).await;
    let ack = expect_register_ack(&mut ws).await;
    assert!(ack.success);

    // Worker shows up in the registry.
    let workers = handle.workers().await.unwrap();
    assert_eq!(workers.len(), 1);
    assert_eq!(workers[0].name, "w1");
    assert_eq!(workers[0].status, WorkerStatus::Online);

    // Create a task; the coordinator assigns it to w1.
    let task = handle
        .create_task(TaskOptions {
            prompt: "hello".to_string(),
            ..TaskOptions::default()
        })
        .await
        .unwrap();
    let assign = loop {
        let envelope = next_envelope(&mut ws).await.expect("assign frame");
        if envelope.message_type == MessageType::TaskAssign {
            break envelope;
        }
    };
    assert_eq!(assign.task_id.as_deref(), Some(task.id.as_str()));

    // Stream a little output, then complete.
    ws.send(send_from_worker(
        MessageType::TaskStream,
        &StreamEvent::AssistantMessage {
            text: "Hi".to_string(),
        },
        &task.id,
        "w1",
    ))
    .await
    .unwrap();
    ws.send(send_from_worker(
        MessageType::TaskComplete,
        &TaskCompletePayload {
            result_text: "Hi".to_string(),
            session_id: Some("s1".to_string()),
            usage: TokenUsage {
                input: 10,
                output: 2,
                cache_read: 0,
                cache_write: 0,
            },
        },
        &task.id,
        "w1",
    ))
    .await
    .unwrap();

    // Wait for the completion event, then check final task state.
    let completed = timeout(Duration::from_secs(5), async {
        loop {
            match events.recv().await {
                Some(CoordinatorEvent::TaskCompleted { task }) => break task,
                Some(_) => continue,
                None => panic!("event channel closed"),
            }
        }
    })
    .await
    .unwrap();
    assert_eq!(completed.id, task.id);

    let final_task = handle.task(&task.id).await.unwrap().unwrap();
    assert_eq!(final_task.status, TaskStatus::Completed);
    assert_eq!(final_task.result_text, "Hi");
    assert_eq!(final_task.session_id.as_deref(), Some("s1"));
    assert_eq!(final_task.usage.input, 10);

    let workers = handle.workers().await.unwrap();
    assert_eq!(workers[0].status, WorkerStatus::Online);
    assert!(workers[0].current_task_id.is_none());

    let session = handle
        .latest_session(Some("w1".to_string()), None)
        .await
        .unwrap()
        .expect("continuation record");
    assert_eq!(session.session_id, "s1");
}

#[tokio::test]
async fn test_register_with_wrong_secret_is_rejected_and_closed() {
    let (handle, _events, url) = start_coordinator().await;

    let mut ws = connect_worker(&url, "intruder", "wrong-secret").await;
    let ack = expect_register_ack(&mut ws).await;
    assert!(!ack.success);

    // The server closes the transport after the failed ack.
    let closed = timeout(Duration::from_secs(5), async {
        loop {
            match ws.next().await {
                None => break,
                Some(Ok(Message::Close(_))) => break,
                Some(Ok(_)) => continue,
                Some(Err(_)) => break,
            }
        }
    })
    .await;
    assert!(closed.is_ok(), "connection was not closed");

    // Nothing was recorded.
    let workers = handle.workers().await.unwrap();
    assert!(workers.is_empty());
}

#[tokio::test]
async fn test_worker_disconnect_fails_running_task() {
    let (handle, mut events, url) = start_coordinator().await;

    let mut ws = connect_worker(&url, "w1", SECRET).await;
    assert!(expect_register_ack(&mut ws).await.success);

    let task = handle
        .create_task(TaskOptions {
            prompt: "doomed".to_string(),
            ..TaskOptions::default()
        })
        .await
        .unwrap();
    loop {
        let envelope = next_envelope(&mut ws).await.expect("assign frame");
        if envelope.message_type == MessageType::TaskAssign {
            break;
        }
    }

    // Drop the socket mid-task.
    drop(ws);

    let failed = timeout(Duration::from_secs(5), async {
        loop {
            match events.recv().await {
                Some(CoordinatorEvent::TaskFailed { task }) => break task,
                Some(_) => continue,
                None => panic!("event channel closed"),
            }
        }
    })
    .await
    .unwrap();
    assert_eq!(failed.id, task.id);
    let message = failed.error_message.unwrap();
    assert!(message.contains("worker") && message.contains("disconnect"));

    assert!(handle.workers().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_question_and_team_update_reach_the_event_sink() {
    let (_handle, mut events, url) = start_coordinator().await;

    let mut ws = connect_worker(&url, "w1", SECRET).await;
    assert!(expect_register_ack(&mut ws).await.success);

    ws.send(send_from_worker(
        MessageType::TaskQuestion,
        &taskbridge_protocol::types::TaskQuestionPayload {
            question: "Deploy to prod?".to_string(),
        },
        "task-1",
        "w1",
    ))
    .await
    .unwrap();
    ws.send(send_from_worker(
        MessageType::TeamUpdate,
        &serde_json::json!({"members": 3}),
        "task-1",
        "w1",
    ))
    .await
    .unwrap();

    let mut saw_question = false;
    let mut saw_team_update = false;
    timeout(Duration::from_secs(5), async {
        while !(saw_question && saw_team_update) {
            match events.recv().await {
                Some(CoordinatorEvent::TaskQuestion { task_id, payload }) => {
                    assert_eq!(task_id, "task-1");
                    assert_eq!(payload.question, "Deploy to prod?");
                    saw_question = true;
                }
                Some(CoordinatorEvent::TeamUpdate { worker_id, payload }) => {
                    assert_eq!(worker_id, "w1");
                    assert_eq!(payload["members"], 3);
                    saw_team_update = true;
                }
                Some(_) => continue,
                None => panic!("event channel closed"),
            }
        }
    })
    .await
    .unwrap();
}

#[tokio::test]
async fn test_heartbeat_is_acked() {
    let (_handle, _events, url) = start_coordinator().await;

    let mut ws = connect_worker(&url, "w1", SECRET).await;
    assert!(expect_register_ack(&mut ws).await.success);

    ws.send(send_from_worker(
        MessageType::WorkerHeartbeat,
        &HeartbeatPayload {
            status: WorkerStatus::Online,
            current_task_id: None,
        },
        "",
        "w1",
    ))
    .await
    .unwrap();

    let ack = loop {
        let envelope = next_envelope(&mut ws).await.expect("heartbeat ack");
        if envelope.message_type == MessageType::WorkerHeartbeatAck {
            break envelope;
        }
    };
    assert_eq!(ack.worker_id.as_deref(), Some("w1"));
}
