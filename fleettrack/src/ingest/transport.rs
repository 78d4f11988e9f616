//! WebSocket broker transport.
//!
//! Owns the connection lifecycle so the dispatch loop never has to: it
//! connects, authenticates, forwards subscribe/unsubscribe commands as
//! control frames, and turns incoming data frames into [`BrokerEvent`]s.
//! On any transport error it emits `Disconnected` and reconnects with
//! exponential backoff (1 s initial, 30 s cap).
//!
//! # Wire format
//!
//! One JSON object per text frame:
//!
//! - data (broker → client): `{"topic": "...", "payload": "..."}`
//! - control (client → broker): `{"action": "subscribe"|"unsubscribe",
//!   "topic": "..."}` and `{"action": "auth", "username": "...",
//!   "password": "..."}`
//!
//! Topic payloads themselves are the newline-free JSON (or plain text)
//! documented on each topic; the envelope never inspects them.

use std::time::Duration;

use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{BrokerCommand, BrokerEvent};

/// First retry delay after a failed connection.
pub const INITIAL_BACKOFF: Duration = Duration::from_secs(1);

/// Ceiling for the reconnect backoff.
pub const MAX_BACKOFF: Duration = Duration::from_secs(30);

/// Broker connection settings.
#[derive(Debug, Clone)]
pub struct BrokerConfig {
    /// WebSocket URL, e.g. `wss://broker.example:8084/ws`.
    pub url: String,
    pub username: Option<String>,
    pub password: Option<String>,
}

/// Incoming data frame envelope.
#[derive(Debug, Deserialize)]
struct DataFrame {
    topic: String,
    payload: String,
}

/// Outgoing control frame.
#[derive(Debug, Serialize)]
#[serde(tag = "action", rename_all = "lowercase")]
enum ControlFrame<'a> {
    Subscribe { topic: &'a str },
    Unsubscribe { topic: &'a str },
    Auth {
        username: &'a str,
        password: &'a str,
    },
}

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Spawn the broker client task.
///
/// The task runs until `cancellation` fires; the returned handle resolves
/// once the connection has been torn down.
pub fn spawn_broker_client(
    config: BrokerConfig,
    events: mpsc::Sender<BrokerEvent>,
    commands: mpsc::Receiver<BrokerCommand>,
    cancellation: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(run_client(config, events, commands, cancellation))
}

async fn run_client(
    config: BrokerConfig,
    events: mpsc::Sender<BrokerEvent>,
    mut commands: mpsc::Receiver<BrokerCommand>,
    cancellation: CancellationToken,
) {
    let mut backoff = INITIAL_BACKOFF;

    loop {
        if cancellation.is_cancelled() {
            break;
        }

        info!(url = %config.url, "Connecting to broker");
        match connect_async(config.url.as_str()).await {
            Ok((mut ws, _)) => {
                backoff = INITIAL_BACKOFF;

                if let Err(e) = authenticate(&mut ws, &config).await {
                    warn!(error = %e, "Broker authentication frame failed");
                    let _ = ws.close(None).await;
                    emit_disconnected(&events, format!("auth failed: {}", e)).await;
                } else {
                    if events.send(BrokerEvent::Connected).await.is_err() {
                        break;
                    }

                    let reason =
                        drive_connection(&mut ws, &events, &mut commands, &cancellation).await;
                    let _ = ws.close(None).await;

                    if cancellation.is_cancelled() {
                        break;
                    }
                    emit_disconnected(&events, reason).await;
                }
            }
            Err(e) => {
                emit_disconnected(&events, format!("connect failed: {}", e)).await;
            }
        }

        // Backoff before the next attempt, abandoned early on shutdown.
        tokio::select! {
            _ = cancellation.cancelled() => break,
            _ = tokio::time::sleep(backoff) => {}
        }
        backoff = (backoff * 2).min(MAX_BACKOFF);
    }

    debug!("Broker client task stopped");
}

async fn authenticate(ws: &mut WsStream, config: &BrokerConfig) -> Result<(), String> {
    let (username, password) = match (&config.username, &config.password) {
        (Some(u), Some(p)) => (u.as_str(), p.as_str()),
        _ => return Ok(()),
    };

    let frame = serde_json::to_string(&ControlFrame::Auth { username, password })
        .map_err(|e| e.to_string())?;
    ws.send(Message::Text(frame))
        .await
        .map_err(|e| e.to_string())
}

/// Pump one live connection. Returns the disconnect reason.
async fn drive_connection(
    ws: &mut WsStream,
    events: &mpsc::Sender<BrokerEvent>,
    commands: &mut mpsc::Receiver<BrokerCommand>,
    cancellation: &CancellationToken,
) -> String {
    loop {
        tokio::select! {
            biased;

            _ = cancellation.cancelled() => {
                // Flush pending unsubscribes before the close frame goes
                // out; the dispatch loop queues them on shutdown.
                while let Ok(command) = commands.try_recv() {
                    let _ = send_command(ws, &command).await;
                }
                return "shutdown".to_string();
            }

            command = commands.recv() => {
                match command {
                    Some(command) => {
                        if let Err(e) = send_command(ws, &command).await {
                            return format!("send failed: {}", e);
                        }
                    }
                    None => return "command channel closed".to_string(),
                }
            }

            frame = ws.next() => {
                match frame {
                    Some(Ok(Message::Text(text))) => {
                        forward_data_frame(events, text.as_bytes()).await;
                    }
                    Some(Ok(Message::Binary(bytes))) => {
                        forward_data_frame(events, &bytes).await;
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        return "closed by broker".to_string();
                    }
                    Some(Ok(_)) => {} // ping/pong handled by tungstenite
                    Some(Err(e)) => return format!("transport error: {}", e),
                }
            }
        }
    }
}

async fn send_command(
    ws: &mut WsStream,
    command: &BrokerCommand,
) -> Result<(), tokio_tungstenite::tungstenite::Error> {
    let frame = match command {
        BrokerCommand::Subscribe(topic) => ControlFrame::Subscribe { topic },
        BrokerCommand::Unsubscribe(topic) => ControlFrame::Unsubscribe { topic },
    };
    let text = serde_json::to_string(&frame).expect("control frame serializes");
    ws.send(Message::Text(text)).await
}

async fn forward_data_frame(events: &mpsc::Sender<BrokerEvent>, raw: &[u8]) {
    match serde_json::from_slice::<DataFrame>(raw) {
        Ok(frame) => {
            let event = BrokerEvent::Message {
                topic: frame.topic,
                payload: frame.payload.into_bytes(),
            };
            if events.send(event).await.is_err() {
                debug!("Broker event channel closed");
            }
        }
        Err(e) => {
            debug!(error = %e, "Unparseable broker frame dropped");
        }
    }
}

async fn emit_disconnected(events: &mpsc::Sender<BrokerEvent>, reason: String) {
    let _ = events.send(BrokerEvent::Disconnected { reason }).await;
}
