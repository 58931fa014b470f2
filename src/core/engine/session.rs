//! The transfer state machine.
//!
//! One [`TransferSession`] drives one side of a transfer:
//!
//! - **receiver**: mint a code, register it via `generate_code`, wait for a
//!   sender, open the datagram channel as initiator, reassemble inbound
//!   chunks into files;
//! - **sender**: `join_room` with the code, answer the receiver's offer,
//!   stream metadata + chunks + `transfer_complete`.
//!
//! The session is a single event loop over signaling events, transport
//! events and commands; the only state shared with the sender's streaming
//! task is the transport handle itself. Terminal states are sticky: once
//! completed or cancelled, later transport hiccups change nothing.

use super::signaling::{SignalingEvent, SignalingLink};
use super::{EngineEvent, OutgoingFile, TransferConfig, TransferStatus};
use crate::core::config::{
    CHUNK_SEND_YIELD, METADATA_DEBOUNCE, STATUS_REPORT_CHUNK_INTERVAL,
};
use crate::core::pipeline::chunk::{split, Chunk, ChunkAccumulator};
use crate::core::pipeline::compress::{compress_chunk, decompress_chunk, should_compress};
use crate::core::protocol::control::{classify, ControlFrame, InboundFrame, TransferMetadata};
use crate::core::protocol::signaling::{BrokerMessage, ClientMessage, ErrorCode, PeerRole};
use crate::core::transport::{
    SignalPayload, TransportEvent, TransportEvents, TransportFactory, TransportHandle,
};
use anyhow::{anyhow, Result};
use bytes::Bytes;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

// ── Commands ──────────────────────────────────────────────────────────────────

#[derive(Debug)]
pub(crate) enum EngineCmd {
    Cancel,
    /// The sender's streaming task finished (logical bytes sent, or error).
    SenderFinished(Result<u64, String>),
}

/// Control handle for a running session.
#[derive(Clone)]
pub struct SessionHandle {
    cmd_tx: mpsc::UnboundedSender<EngineCmd>,
}

impl SessionHandle {
    /// Move the session to `cancelled` and trigger cleanup. Bytes already
    /// buffered in the transport may still reach the peer.
    pub fn cancel(&self) {
        let _ = self.cmd_tx.send(EngineCmd::Cancel);
    }
}

// ── Session ───────────────────────────────────────────────────────────────────

pub struct TransferSession {
    role: PeerRole,
    code: String,
    config: TransferConfig,

    signaling: Arc<dyn SignalingLink>,
    sig_events: Option<mpsc::UnboundedReceiver<SignalingEvent>>,
    factory: TransportFactory,
    transport: Option<TransportHandle>,

    files: Vec<OutgoingFile>,
    events: mpsc::UnboundedSender<EngineEvent>,
    cmd_tx: mpsc::UnboundedSender<EngineCmd>,
    cmd_rx: Option<mpsc::UnboundedReceiver<EngineCmd>>,

    status: TransferStatus,
    self_peer_id: Option<Uuid>,
    target_peer_id: Option<Uuid>,

    accumulator: Option<ChunkAccumulator>,
    current_compressed: bool,
    bytes_transferred: u64,
    total_bytes: u64,
    chunks_since_report: u32,
    window_start: Instant,
    window_bytes: u64,

    sender_task: Option<JoinHandle<()>>,
}

impl TransferSession {
    /// Build a receiver session for `code`. The signaling connection must
    /// already be addressed to the room named by the code.
    pub fn receiver(
        code: &str,
        signaling: Arc<dyn SignalingLink>,
        sig_events: mpsc::UnboundedReceiver<SignalingEvent>,
        factory: TransportFactory,
        config: TransferConfig,
    ) -> (Self, SessionHandle, mpsc::UnboundedReceiver<EngineEvent>) {
        Self::new(PeerRole::Receiver, code, Vec::new(), signaling, sig_events, factory, config)
    }

    /// Build a sender session that will join `code` and stream `files`.
    pub fn sender(
        code: &str,
        files: Vec<OutgoingFile>,
        signaling: Arc<dyn SignalingLink>,
        sig_events: mpsc::UnboundedReceiver<SignalingEvent>,
        factory: TransportFactory,
        config: TransferConfig,
    ) -> (Self, SessionHandle, mpsc::UnboundedReceiver<EngineEvent>) {
        Self::new(PeerRole::Sender, code, files, signaling, sig_events, factory, config)
    }

    fn new(
        role: PeerRole,
        code: &str,
        files: Vec<OutgoingFile>,
        signaling: Arc<dyn SignalingLink>,
        sig_events: mpsc::UnboundedReceiver<SignalingEvent>,
        factory: TransportFactory,
        config: TransferConfig,
    ) -> (Self, SessionHandle, mpsc::UnboundedReceiver<EngineEvent>) {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let handle = SessionHandle {
            cmd_tx: cmd_tx.clone(),
        };
        let session = Self {
            role,
            code: code.to_string(),
            config,
            signaling,
            sig_events: Some(sig_events),
            factory,
            transport: None,
            files,
            events: events_tx,
            cmd_tx,
            cmd_rx: Some(cmd_rx),
            status: TransferStatus::Idle,
            self_peer_id: None,
            target_peer_id: None,
            accumulator: None,
            current_compressed: false,
            bytes_transferred: 0,
            total_bytes: 0,
            chunks_since_report: 0,
            window_start: Instant::now(),
            window_bytes: 0,
            sender_task: None,
        };
        (session, handle, events_rx)
    }

    // ── Event loop ───────────────────────────────────────────────────────

    pub async fn run(mut self) -> Result<()> {
        let mut cmd_rx = self.cmd_rx.take().expect("run called once");
        let mut sig_rx = self.sig_events.take().expect("run called once");
        let mut transport_rx: Option<TransportEvents> = None;

        self.set_status(TransferStatus::Connecting);
        let opener = match self.role {
            PeerRole::Receiver => ClientMessage::GenerateCode,
            PeerRole::Sender => ClientMessage::JoinRoom {
                code: self.code.clone(),
                role: PeerRole::Sender,
            },
        };
        if let Err(e) = self.signaling.send(opener) {
            self.fail(&format!("signaling send failed: {e}"));
        } else {
            self.set_status(TransferStatus::Waiting);
        }

        while !self.status.is_terminal() {
            // Biased: commands outrank network events, so a finished send
            // pipeline lands in `completed` before the peer's teardown
            // (channel close, peer_disconnected) can be mistaken for a
            // failure.
            tokio::select! {
                biased;
                Some(cmd) = cmd_rx.recv() => self.handle_cmd(cmd),
                sig = sig_rx.recv() => match sig {
                    Some(event) => {
                        match self.handle_signaling_event(event).await {
                            Ok(Some(events)) => transport_rx = Some(events),
                            Ok(None) => {}
                            Err(e) => self.fail(&e.to_string()),
                        }
                    }
                    None => self.fail("signaling channel closed"),
                },
                event = next_transport_event(&mut transport_rx), if transport_rx.is_some() => {
                    match event {
                        Some(event) => self.handle_transport_event(event).await,
                        None => {
                            transport_rx = None;
                            self.fail("transport event channel closed");
                        }
                    }
                }
            }
        }

        self.cleanup().await;
        Ok(())
    }

    // ── Commands ─────────────────────────────────────────────────────────

    fn handle_cmd(&mut self, cmd: EngineCmd) {
        match cmd {
            EngineCmd::Cancel => {
                info!(event = "transfer_cancelled", role = ?self.role, "Transfer cancelled");
                self.set_status(TransferStatus::Cancelled);
            }
            EngineCmd::SenderFinished(Ok(bytes)) => {
                info!(event = "transfer_complete", bytes, "All files streamed");
                self.set_status(TransferStatus::Completed);
            }
            EngineCmd::SenderFinished(Err(e)) => {
                self.fail(&format!("send pipeline failed: {e}"));
            }
        }
    }

    // ── Signaling events ─────────────────────────────────────────────────

    /// Returns the transport event receiver when this event caused the
    /// datagram channel to be created.
    async fn handle_signaling_event(
        &mut self,
        event: SignalingEvent,
    ) -> Result<Option<TransportEvents>> {
        let message = match event {
            SignalingEvent::Message(message) => message,
            SignalingEvent::Disconnected => {
                self.fail("signaling connection lost");
                return Ok(None);
            }
        };

        match message {
            BrokerMessage::CodeGenerated { code, peer_id, .. } => {
                self.self_peer_id = Some(peer_id);
                info!(event = "code_ready", code, "Rendezvous code registered");
                let _ = self.events.send(EngineEvent::CodeReady { code });
                Ok(None)
            }
            BrokerMessage::PeerJoined { peer_id, role } => {
                if role == self.role {
                    // Our own broadcast echo carries our connection id.
                    self.self_peer_id.get_or_insert(peer_id);
                    return Ok(None);
                }
                info!(event = "peer_joined", peer_id = %peer_id, role = ?role, "Paired with peer");
                self.target_peer_id = Some(peer_id);
                let _ = self.events.send(EngineEvent::PeerJoined { peer_id, role });

                // The receiver initiates the datagram channel.
                if self.role == PeerRole::Receiver && self.transport.is_none() {
                    let (transport, events) = (self.factory)(true).await?;
                    self.transport = Some(transport);
                    return Ok(Some(events));
                }
                Ok(None)
            }
            BrokerMessage::WebrtcOffer { from_peer_id, payload } => {
                if self.role != PeerRole::Sender {
                    debug!(event = "unexpected_offer", "Offer at non-sender, ignoring");
                    return Ok(None);
                }
                self.target_peer_id = Some(from_peer_id);
                let created = if self.transport.is_none() {
                    let (transport, events) = (self.factory)(false).await?;
                    self.transport = Some(transport);
                    Some(events)
                } else {
                    None
                };
                self.feed_signal(payload).await;
                Ok(created)
            }
            BrokerMessage::WebrtcAnswer { from_peer_id, payload } => {
                self.target_peer_id.get_or_insert(from_peer_id);
                self.feed_signal(payload).await;
                Ok(None)
            }
            BrokerMessage::IceCandidate { from_peer_id, payload } => {
                self.target_peer_id.get_or_insert(from_peer_id);
                self.feed_signal(payload).await;
                Ok(None)
            }
            BrokerMessage::PeerStatus {
                from_peer_id,
                status,
                progress,
                speed,
            } => {
                let _ = self.events.send(EngineEvent::PeerStatus {
                    from_peer_id,
                    status,
                    progress,
                    speed,
                });
                Ok(None)
            }
            BrokerMessage::PeerLeft { peer_id } => {
                debug!(event = "peer_left", peer_id = %peer_id, "Peer left the room");
                Ok(None)
            }
            BrokerMessage::ConnectionLocked { .. } => Ok(None),
            BrokerMessage::Error { code, message } => {
                self.handle_broker_error(code, &message);
                Ok(None)
            }
        }
    }

    /// Feed a relayed signaling payload into the transport.
    async fn feed_signal(&mut self, payload: serde_json::Value) {
        let Some(transport) = &self.transport else {
            debug!(event = "signal_before_transport", "Dropping signal, no channel yet");
            return;
        };
        let signal: SignalPayload = match serde_json::from_value(payload) {
            Ok(signal) => signal,
            Err(e) => {
                warn!(event = "malformed_signal", error = %e, "Dropping malformed signal payload");
                return;
            }
        };
        if let Err(e) = transport.signal(signal).await {
            self.fail(&format!("signaling the transport failed: {e}"));
        }
    }

    fn handle_broker_error(&mut self, code: ErrorCode, message: &str) {
        match code {
            // Pairing and admission failures end the session.
            ErrorCode::PeerDisconnected
            | ErrorCode::LockExpired
            | ErrorCode::LockNotFound
            | ErrorCode::RoomFull
            | ErrorCode::InvalidCode
            | ErrorCode::RateLimited => {
                self.fail(&format!("{code:?}: {message}"));
            }
        }
    }

    // ── Transport events ─────────────────────────────────────────────────

    async fn handle_transport_event(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::Signal(payload) => self.relay_signal(payload),
            TransportEvent::Connected => {
                info!(event = "channel_open", role = ?self.role, "Data channel open");
                self.set_status(TransferStatus::Transferring);
                if self.role == PeerRole::Sender && self.sender_task.is_none() {
                    self.spawn_sender_task();
                }
            }
            TransportEvent::Message(data) => {
                if self.role == PeerRole::Receiver {
                    self.handle_datagram(&data);
                }
            }
            TransportEvent::Disconnected => {
                self.fail("data channel closed");
            }
            TransportEvent::Error(e) => {
                self.fail(&format!("data channel error: {e}"));
            }
        }
    }

    /// Relay a locally-produced signal to the peer through the broker.
    fn relay_signal(&mut self, payload: SignalPayload) {
        let Some(target_peer_id) = self.target_peer_id else {
            warn!(event = "signal_without_target", "No target peer for local signal");
            return;
        };
        let value = match serde_json::to_value(&payload) {
            Ok(value) => value,
            Err(e) => {
                warn!(event = "signal_encode_failure", error = %e, "Failed to encode signal");
                return;
            }
        };
        let message = match payload {
            SignalPayload::Offer { .. } => ClientMessage::WebrtcOffer {
                target_peer_id,
                payload: value,
            },
            SignalPayload::Answer { .. } => ClientMessage::WebrtcAnswer {
                target_peer_id,
                payload: value,
            },
            SignalPayload::Candidate { .. } => ClientMessage::IceCandidate {
                target_peer_id,
                payload: value,
            },
        };
        if let Err(e) = self.signaling.send(message) {
            self.fail(&format!("signaling send failed: {e}"));
        }
    }

    // ── Receiver pipeline ────────────────────────────────────────────────

    fn handle_datagram(&mut self, data: &[u8]) {
        match classify(data) {
            InboundFrame::Control(ControlFrame::FileMetadata { metadata, .. }) => {
                info!(
                    event = "file_metadata",
                    file = %metadata.file_name,
                    size = metadata.total_size,
                    chunks = metadata.total_chunks,
                    compressed = metadata.compressed,
                    "Incoming file announced"
                );
                self.current_compressed = metadata.compressed;
                // Progress counters restart per file.
                self.bytes_transferred = 0;
                self.total_bytes = metadata.total_size;
                self.accumulator = Some(ChunkAccumulator::new(metadata));
                self.finish_file_if_complete();
            }
            InboundFrame::Control(ControlFrame::TransferComplete) => {
                self.set_status(TransferStatus::Completed);
            }
            InboundFrame::Unknown(kind) => {
                debug!(event = "unknown_control", kind, "Ignoring unknown control message");
            }
            InboundFrame::Chunk => self.handle_chunk_record(data),
        }
    }

    fn handle_chunk_record(&mut self, data: &[u8]) {
        let mut chunk = match Chunk::deserialize(data) {
            Ok(chunk) => chunk,
            Err(e) => {
                // Protocol error: surface without killing the transfer.
                warn!(event = "malformed_chunk", error = %e, "Dropping malformed chunk record");
                let _ = self.events.send(EngineEvent::Error(e.to_string()));
                return;
            }
        };

        if self.accumulator.is_none() {
            warn!(event = "chunk_before_metadata", index = chunk.index, "Chunk before metadata, dropping");
            return;
        }

        if self.current_compressed {
            match decompress_chunk(&chunk.payload) {
                Ok(raw) => chunk.payload = raw,
                Err(e) => {
                    self.fail(&format!("chunk {} decompression failed: {e}", chunk.index));
                    return;
                }
            }
        }

        let size = chunk.size as u64;
        let added = self
            .accumulator
            .as_mut()
            .expect("accumulator present")
            .add_chunk(chunk);
        match added {
            Ok(true) => {
                self.bytes_transferred += size;
                self.window_bytes += size;
                self.chunks_since_report += 1;
                let _ = self.events.send(EngineEvent::Progress {
                    bytes_transferred: self.bytes_transferred,
                    total_bytes: self.total_bytes,
                });
                if self.chunks_since_report >= STATUS_REPORT_CHUNK_INTERVAL {
                    self.report_status();
                }
                self.finish_file_if_complete();
            }
            Ok(false) => {
                debug!(event = "duplicate_chunk", "Duplicate chunk ignored");
            }
            Err(e) => {
                // Chunk overflow or size mismatch is fatal for the transfer.
                self.fail(&e.to_string());
            }
        }
    }

    fn finish_file_if_complete(&mut self) {
        let complete = self
            .accumulator
            .as_ref()
            .is_some_and(|acc| acc.is_complete());
        if !complete {
            return;
        }
        let accumulator = self.accumulator.take().expect("checked above");
        match accumulator.into_file() {
            Ok((metadata, bytes)) => {
                info!(
                    event = "file_received",
                    file = %metadata.file_name,
                    bytes = bytes.len(),
                    "File reassembled"
                );
                let _ = self.events.send(EngineEvent::FileReceived { metadata, bytes });
            }
            Err(e) => self.fail(&e.to_string()),
        }
    }

    // ── Sender pipeline ──────────────────────────────────────────────────

    fn spawn_sender_task(&mut self) {
        let transport = self.transport.clone().expect("connected implies transport");
        let signaling = Arc::clone(&self.signaling);
        let files = std::mem::take(&mut self.files);
        let config = self.config.clone();
        let events = self.events.clone();
        let cmd_tx = self.cmd_tx.clone();
        let total_bytes: u64 = files.iter().map(|f| f.data.len() as u64).sum();
        self.total_bytes = total_bytes;

        self.sender_task = Some(tokio::spawn(async move {
            let result = stream_files(transport, signaling, files, config, events, total_bytes)
                .await
                .map_err(|e| e.to_string());
            let _ = cmd_tx.send(EngineCmd::SenderFinished(result));
        }));
    }

    // ── Status plumbing ──────────────────────────────────────────────────

    fn set_status(&mut self, status: TransferStatus) {
        if self.status.is_terminal() || self.status == status {
            return;
        }
        debug!(event = "status_change", from = ?self.status, to = ?status, "Session status change");
        self.status = status;
        let _ = self.events.send(EngineEvent::StatusChanged(status));
        self.report_status();
    }

    /// Best-effort `transfer_status` report through the broker.
    fn report_status(&mut self) {
        let progress = if self.total_bytes > 0 {
            self.bytes_transferred as f64 / self.total_bytes as f64
        } else {
            0.0
        };
        let elapsed = self.window_start.elapsed().as_secs_f64().max(1e-3);
        let speed = self.window_bytes as f64 / elapsed;
        self.window_start = Instant::now();
        self.window_bytes = 0;
        self.chunks_since_report = 0;
        let _ = self.signaling.send(ClientMessage::TransferStatus {
            status: self.status.as_str().to_string(),
            progress,
            speed,
        });
    }

    fn fail(&mut self, message: &str) {
        if self.status.is_terminal() {
            return;
        }
        warn!(event = "transfer_failed", message, role = ?self.role, "Transfer failed");
        let _ = self.events.send(EngineEvent::Error(message.to_string()));
        self.set_status(TransferStatus::Error);
    }

    async fn cleanup(&mut self) {
        if let Some(task) = self.sender_task.take() {
            task.abort();
        }
        if let Some(transport) = self.transport.take() {
            transport.close().await;
        }
        self.signaling.close();
        self.accumulator = None;
    }
}

/// `recv` on a receiver that may not exist yet; pends forever when absent so
/// the `select!` guard can keep the branch disabled.
async fn next_transport_event(rx: &mut Option<TransportEvents>) -> Option<TransportEvent> {
    match rx {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

// ── Sender streaming ──────────────────────────────────────────────────────────

/// Stream every file strictly in sequence: metadata, debounce, chunks with a
/// cooperative yield between each, then `transfer_complete` after the last
/// file. Compression is per-file policy; the chunk header always carries the
/// logical size.
async fn stream_files(
    transport: TransportHandle,
    signaling: Arc<dyn SignalingLink>,
    files: Vec<OutgoingFile>,
    config: TransferConfig,
    events: mpsc::UnboundedSender<EngineEvent>,
    total_bytes: u64,
) -> Result<u64> {
    let mut sent: u64 = 0;
    let mut chunks_since_report: u32 = 0;
    let mut window_start = Instant::now();
    let mut window_bytes: u64 = 0;

    for file in files {
        let file_size = file.data.len() as u64;
        let compressed = config.enable_compression && should_compress(file_size);
        let metadata = TransferMetadata::new(
            &file.name,
            &file.mime,
            file_size,
            config.chunk_size as u32,
            compressed,
        );
        info!(
            event = "file_send_start",
            file = %metadata.file_name,
            size = file_size,
            chunks = metadata.total_chunks,
            compressed,
            "Streaming file"
        );

        let frame = ControlFrame::FileMetadata {
            metadata,
            compressed,
            encrypted: false,
        };
        transport
            .send(Bytes::from(serde_json::to_vec(&frame)?))
            .await
            .map_err(|e| anyhow!("metadata send failed: {e}"))?;
        tokio::time::sleep(METADATA_DEBOUNCE).await;

        for chunk in split(&file.data, config.chunk_size) {
            let logical = chunk.size as u64;
            let wire_chunk = if compressed {
                let payload = compress_chunk(&chunk.payload)?;
                chunk.with_payload(payload)
            } else {
                chunk
            };
            transport
                .send(Bytes::from(wire_chunk.serialize()))
                .await
                .map_err(|e| anyhow!("chunk send failed: {e}"))?;

            sent += logical;
            window_bytes += logical;
            chunks_since_report += 1;
            let _ = events.send(EngineEvent::Progress {
                bytes_transferred: sent,
                total_bytes,
            });
            if chunks_since_report >= STATUS_REPORT_CHUNK_INTERVAL {
                let elapsed = window_start.elapsed().as_secs_f64().max(1e-3);
                let progress = if total_bytes > 0 {
                    sent as f64 / total_bytes as f64
                } else {
                    1.0
                };
                let _ = signaling.send(ClientMessage::TransferStatus {
                    status: TransferStatus::Transferring.as_str().to_string(),
                    progress,
                    speed: window_bytes as f64 / elapsed,
                });
                window_start = Instant::now();
                window_bytes = 0;
                chunks_since_report = 0;
            }

            // Keep the executor responsive and the send buffer honest.
            tokio::time::sleep(CHUNK_SEND_YIELD).await;
        }
    }

    transport
        .send(Bytes::from(serde_json::to_vec(&ControlFrame::TransferComplete)?))
        .await
        .map_err(|e| anyhow!("transfer_complete send failed: {e}"))?;

    Ok(sent)
}
