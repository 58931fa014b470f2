//! Signaling client: the websocket link between a transfer engine and the
//! broker.
//!
//! Outgoing messages go through an unbounded channel into a writer task;
//! inbound broker messages surface as [`SignalingEvent`]s. A dropped socket
//! is redialed up to [`SIGNALING_RECONNECT_MAX_RETRIES`] times with
//! exponential delays; when the budget runs out the engine gets
//! [`SignalingEvent::Disconnected`].

use crate::core::config::{
    SIGNALING_RECONNECT_CAP, SIGNALING_RECONNECT_DELAYS, SIGNALING_RECONNECT_MAX_RETRIES,
};
use crate::core::protocol::signaling::{BrokerMessage, ClientMessage};
use crate::utils::sos::SignalOfStop;
use anyhow::{Context, Result};
use futures_util::{SinkExt, StreamExt};
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

/// What the engine sees from the signaling side.
#[derive(Debug)]
pub enum SignalingEvent {
    Message(BrokerMessage),
    /// The socket is gone and the reconnect budget is spent.
    Disconnected,
}

/// Outbound half of a signaling connection. Send is fire-and-forget: the
/// writer task owns the socket.
pub trait SignalingLink: Send + Sync {
    fn send(&self, msg: ClientMessage) -> Result<()>;
    fn close(&self);
}

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Websocket-backed [`SignalingLink`].
pub struct WsSignaling {
    out_tx: mpsc::UnboundedSender<ClientMessage>,
    sos: SignalOfStop,
}

impl WsSignaling {
    /// Dial `<broker_url>/<room_id>` and start the socket task. The first
    /// connection failing is an error; later drops go through the
    /// reconnect budget.
    pub async fn connect(
        broker_url: &str,
        room_id: &str,
    ) -> Result<(Arc<Self>, mpsc::UnboundedReceiver<SignalingEvent>)> {
        let url = format!("{}/{}", broker_url.trim_end_matches('/'), room_id);
        let (ws, _) = tokio_tungstenite::connect_async(url.as_str())
            .await
            .with_context(|| format!("connecting to signaling broker at {url}"))?;
        info!(event = "signaling_connected", %url, "Signaling connected");

        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let sos = SignalOfStop::new();

        tokio::spawn(socket_task(ws, url, out_rx, event_tx, sos.clone()));

        Ok((Arc::new(Self { out_tx, sos }), event_rx))
    }
}

impl SignalingLink for WsSignaling {
    fn send(&self, msg: ClientMessage) -> Result<()> {
        self.out_tx
            .send(msg)
            .context("signaling writer task gone")
    }

    fn close(&self) {
        self.sos.cancel();
    }
}

async fn socket_task(
    mut ws: WsStream,
    url: String,
    mut out_rx: mpsc::UnboundedReceiver<ClientMessage>,
    event_tx: mpsc::UnboundedSender<SignalingEvent>,
    sos: SignalOfStop,
) {
    'session: loop {
        let (mut sink, mut stream) = ws.split();

        loop {
            tokio::select! {
                _ = sos.wait() => {
                    let _ = sink.close().await;
                    return;
                }
                out = out_rx.recv() => {
                    let Some(msg) = out else {
                        let _ = sink.close().await;
                        return;
                    };
                    let json = match serde_json::to_string(&msg) {
                        Ok(json) => json,
                        Err(e) => {
                            warn!(event = "signaling_encode_failure", error = %e, "Dropping unencodable message");
                            continue;
                        }
                    };
                    if sink.send(Message::Text(json)).await.is_err() {
                        break;
                    }
                }
                frame = stream.next() => {
                    match frame {
                        Some(Ok(Message::Text(text))) => {
                            match serde_json::from_str::<BrokerMessage>(&text) {
                                Ok(msg) => {
                                    if event_tx.send(SignalingEvent::Message(msg)).is_err() {
                                        return;
                                    }
                                }
                                Err(e) => {
                                    warn!(event = "signaling_malformed", error = %e, "Dropping malformed broker frame");
                                }
                            }
                        }
                        Some(Ok(Message::Ping(data))) => {
                            let _ = sink.send(Message::Pong(data)).await;
                        }
                        Some(Ok(Message::Close(_))) | None => break,
                        Some(Ok(_)) => {}
                        Some(Err(e)) => {
                            debug!(event = "signaling_socket_error", error = %e, "Signaling socket error");
                            break;
                        }
                    }
                }
            }
        }

        // Socket dropped: burn through the reconnect budget.
        for (attempt, delay) in SIGNALING_RECONNECT_DELAYS
            .iter()
            .take(SIGNALING_RECONNECT_MAX_RETRIES as usize)
            .enumerate()
        {
            let delay = (*delay).min(SIGNALING_RECONNECT_CAP);
            debug!(
                event = "signaling_reconnect",
                attempt = attempt + 1,
                delay_secs = delay.as_secs(),
                "Redialing signaling broker"
            );
            tokio::select! {
                _ = sos.wait() => return,
                _ = tokio::time::sleep(delay) => {}
            }
            match tokio_tungstenite::connect_async(url.as_str()).await {
                Ok((new_ws, _)) => {
                    info!(event = "signaling_reconnected", %url, "Signaling reconnected");
                    ws = new_ws;
                    continue 'session;
                }
                Err(e) => {
                    warn!(event = "signaling_reconnect_failure", error = %e, "Reconnect attempt failed");
                }
            }
        }

        let _ = event_tx.send(SignalingEvent::Disconnected);
        return;
    }
}
