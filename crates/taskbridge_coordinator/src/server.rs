//! WebSocket server transport.
//!
//! One read task and one write task per connection; the write half is
//! serialised by an mpsc channel so any thread may send through a
//! [`WorkerHandle`]. Connections forward decoded envelopes to the
//! coordinator loop and are torn down when either side closes.

use anyhow::{Context, Result};
use futures_util::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_tungstenite::accept_async;
use tokio_tungstenite::tungstenite::protocol::Message;
use tracing::{debug, info, warn};

use taskbridge_protocol::defaults::AUTH_TIMEOUT_MS;
use taskbridge_protocol::Envelope;

use crate::coordinator::Command;
use crate::registry::{OutboundFrame, WorkerHandle};

/// Bind the transport listener and serve it.
pub async fn run_server(port: u16, commands: mpsc::UnboundedSender<Command>) -> Result<()> {
    let addr = format!("0.0.0.0:{}", port);
    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind transport listener on {}", addr))?;
    serve_on(listener, commands).await
}

/// Accept loop over an already-bound listener. Each connection gets a fresh
/// id and its own read/write tasks; a failure on one connection never takes
/// down the listener.
pub async fn serve_on(listener: TcpListener, commands: mpsc::UnboundedSender<Command>) -> Result<()> {
    if let Ok(addr) = listener.local_addr() {
        info!("Coordinator listening on {}", addr);
    }

    let mut next_conn_id: u64 = 0;
    loop {
        let (stream, peer) = match listener.accept().await {
            Ok(conn) => conn,
            Err(e) => {
                warn!("Accept error: {}", e);
                continue;
            }
        };
        next_conn_id += 1;
        let conn_id = next_conn_id;
        let commands = commands.clone();
        tokio::spawn(async move {
            if let Err(e) = handle_connection(conn_id, stream, peer, commands).await {
                debug!("Connection {} from {} ended: {}", conn_id, peer, e);
            }
        });
    }
}

async fn handle_connection(
    conn_id: u64,
    stream: TcpStream,
    peer: SocketAddr,
    commands: mpsc::UnboundedSender<Command>,
) -> Result<()> {
    let ws = accept_async(stream)
        .await
        .context("WebSocket handshake failed")?;
    debug!("Connection {} open from {}", conn_id, peer);
    let (mut sink, mut source) = ws.split();

    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<OutboundFrame>();
    let writer = tokio::spawn(async move {
        while let Some(frame) = out_rx.recv().await {
            match frame {
                OutboundFrame::Message(text) => {
                    if sink.send(Message::text(text)).await.is_err() {
                        break;
                    }
                }
                OutboundFrame::Close => {
                    let _ = sink.send(Message::Close(None)).await;
                    break;
                }
            }
        }
    });

    commands
        .send(Command::ConnectionOpened {
            conn_id,
            handle: WorkerHandle::new(out_tx),
        })
        .ok();

    // The register must arrive within the auth window; after that the read
    // side just pumps frames until close.
    let mut authenticated_deadline_active = true;
    loop {
        let next = if authenticated_deadline_active {
            match timeout(Duration::from_millis(AUTH_TIMEOUT_MS), source.next()).await {
                Ok(item) => item,
                Err(_) => {
                    warn!("Connection {} closed: no register within auth window", conn_id);
                    break;
                }
            }
        } else {
            source.next().await
        };

        let Some(message) = next else {
            break;
        };
        let message = match message {
            Ok(message) => message,
            Err(e) => {
                debug!("Connection {} transport error: {}", conn_id, e);
                break;
            }
        };

        match message {
            Message::Text(text) => {
                match Envelope::decode(text.as_str()) {
                    Ok(envelope) => {
                        // Any well-formed first frame lifts the deadline; the
                        // coordinator closes connections that speak before
                        // registering.
                        authenticated_deadline_active = false;
                        commands
                            .send(Command::Inbound { conn_id, envelope })
                            .ok();
                    }
                    Err(e) => {
                        // PROTOCOL error: the offender is logged and dropped.
                        warn!("Connection {} sent malformed envelope: {}", conn_id, e);
                    }
                }
            }
            Message::Close(_) => break,
            Message::Ping(_) | Message::Pong(_) => {}
            other => {
                debug!("Connection {} sent unsupported frame: {:?}", conn_id, other);
            }
        }
    }

    commands.send(Command::ConnectionClosed { conn_id }).ok();
    writer.abort();
    Ok(())
}
