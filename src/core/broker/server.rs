//! WebSocket carrier for the broker.
//!
//! Each connection is addressed to a room via the URL path
//! (`ws://host:port/<room_id>`). Per connection: one writer task draining an
//! unbounded channel into the socket, and a read loop feeding parsed
//! messages into [`Broker::handle_message`]. Close handling runs exactly
//! once when the read loop ends, whatever ended it.

use super::{classify_parse_failure, Broker, ConnectionCtx};
use crate::core::protocol::signaling::{BrokerMessage, ClientMessage};
use crate::utils::sos::SignalOfStop;
use anyhow::Result;
use futures_util::{SinkExt, StreamExt};
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, RwLock};
use tokio_tungstenite::tungstenite::handshake::server::{Request, Response};
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Accept connections until cancelled.
pub async fn run(broker: Arc<Broker>, listener: TcpListener, sos: SignalOfStop) -> Result<()> {
    info!(
        event = "broker_listening",
        addr = %listener.local_addr()?,
        "Signaling broker listening"
    );

    loop {
        tokio::select! {
            _ = sos.wait() => break,
            accepted = listener.accept() => {
                let (stream, addr) = match accepted {
                    Ok(pair) => pair,
                    Err(e) => {
                        warn!(event = "accept_failure", error = %e, "Failed to accept connection");
                        continue;
                    }
                };
                debug!(event = "connection_accepted", %addr, "New transport connection");
                let broker = Arc::clone(&broker);
                tokio::spawn(async move {
                    if let Err(e) = handle_connection(broker, stream).await {
                        debug!(event = "connection_ended", error = %e, "Connection handler finished with error");
                    }
                });
            }
        }
    }

    info!(event = "broker_stopped", "Signaling broker shut down");
    Ok(())
}

/// Extract the room id from a websocket URL path.
fn room_from_path(path: &str) -> Option<String> {
    let room = path.trim_matches('/');
    if room.is_empty() || room.contains('/') {
        None
    } else {
        Some(room.to_string())
    }
}

async fn handle_connection(broker: Arc<Broker>, stream: TcpStream) -> Result<()> {
    let addr = stream.peer_addr()?;

    let mut path = None;
    let ws = tokio_tungstenite::accept_hdr_async(stream, |req: &Request, res: Response| {
        path = Some(req.uri().path().to_string());
        Ok(res)
    })
    .await?;

    let Some(room_id) = path.as_deref().and_then(room_from_path) else {
        warn!(event = "bad_room_path", ?path, %addr, "Connection without a usable room path");
        return Ok(());
    };

    let (ws_tx, mut ws_rx) = ws.split();
    let ws_tx = Arc::new(RwLock::new(ws_tx));
    let (tx, mut rx) = mpsc::unbounded_channel::<BrokerMessage>();

    let mut ctx = ConnectionCtx {
        conn_id: Uuid::new_v4(),
        room_id,
        client_key: addr.ip().to_string(),
        tx,
    };

    // Capacity is enforced before anything else can happen on the socket.
    if let Err(code) = broker.accept(&ctx).await {
        let json = serde_json::to_string(&BrokerMessage::error(code))?;
        let mut sink = ws_tx.write().await;
        let _ = sink.send(Message::Text(json)).await;
        let _ = sink.close().await;
        return Ok(());
    }

    // Writer task: everything the broker addresses to this connection.
    let writer_sink = Arc::clone(&ws_tx);
    let writer = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            let json = match serde_json::to_string(&msg) {
                Ok(json) => json,
                Err(e) => {
                    error!(event = "serialize_failure", error = %e, "Failed to serialize outbound message");
                    continue;
                }
            };
            if writer_sink.write().await.send(Message::Text(json)).await.is_err() {
                break;
            }
        }
    });

    while let Some(frame) = ws_rx.next().await {
        match frame {
            Ok(Message::Text(text)) => match serde_json::from_str::<ClientMessage>(&text) {
                Ok(msg) => broker.handle_message(&mut ctx, msg).await,
                Err(e) => match classify_parse_failure(&text) {
                    Some(code) => {
                        debug!(event = "unknown_message_type", %addr, "Unknown message type");
                        let _ = ctx.tx.send(BrokerMessage::error(code));
                    }
                    None => {
                        warn!(event = "malformed_frame", %addr, error = %e, "Dropping malformed frame");
                    }
                },
            },
            Ok(Message::Ping(data)) => {
                let _ = ws_tx.write().await.send(Message::Pong(data)).await;
            }
            Ok(Message::Close(_)) => break,
            Ok(_) => {}
            Err(e) => {
                debug!(event = "socket_error", %addr, error = %e, "Socket error, closing");
                break;
            }
        }
    }

    broker.disconnect(&ctx).await;
    writer.abort();
    Ok(())
}
