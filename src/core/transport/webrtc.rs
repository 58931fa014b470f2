//! WebRTC adapter: the reliable-datagram contract over one ordered data
//! channel.
//!
//! The initiator opens a single channel labelled
//! [`DATA_CHANNEL_LABEL`](crate::core::config::DATA_CHANNEL_LABEL); the
//! responder adopts it via `on_data_channel`. Trickle ICE is the default:
//! the local description goes out immediately and candidates follow as they
//! are discovered. With trickle off the description is withheld until
//! gathering completes.

use super::{
    ReliableDatagram, SendError, SignalPayload, TransportConfig, TransportEvent, TransportEvents,
    TransportHandle,
};
use crate::core::config::{
    DATA_CHANNEL_LABEL, DC_BUFFERED_AMOUNT_HIGH, DC_BUFFER_DRAIN_TIMEOUT, DC_BUFFER_POLL_INTERVAL,
    ICE_GATHER_TIMEOUT, MAX_DATAGRAM_SIZE,
};
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use bytes::Bytes;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, Mutex, RwLock};
use tokio::time::timeout;
use tracing::{debug, error, warn};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::APIBuilder;
use webrtc::data_channel::data_channel_init::RTCDataChannelInit;
use webrtc::data_channel::data_channel_state::RTCDataChannelState;
use webrtc::data_channel::RTCDataChannel;
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::ice_transport::ice_gatherer_state::RTCIceGathererState;
use webrtc::ice_transport::ice_gathering_state::RTCIceGatheringState;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;

type SharedDc = Arc<RwLock<Option<Arc<RTCDataChannel>>>>;

/// One WebRTC endpoint implementing [`ReliableDatagram`].
pub struct WebRtcTransport {
    pc: Arc<RTCPeerConnection>,
    dc: SharedDc,
    open: Arc<AtomicBool>,
    remote_set: Arc<AtomicBool>,
    /// Candidates that arrived before the remote description.
    pending_candidates: Arc<Mutex<Vec<RTCIceCandidateInit>>>,
    events: mpsc::UnboundedSender<TransportEvent>,
    trickle: bool,
}

impl WebRtcTransport {
    /// Build an endpoint. The initiator opens the data channel and emits an
    /// offer; the responder waits for the offer through [`Self::signal`].
    pub async fn create(
        initiator: bool,
        config: TransportConfig,
    ) -> Result<(TransportHandle, TransportEvents)> {
        let api = {
            let mut me = MediaEngine::default();
            let registry = register_default_interceptors(Registry::new(), &mut me)?;
            APIBuilder::new()
                .with_media_engine(me)
                .with_interceptor_registry(registry)
                .build()
        };

        let pc = Arc::new(
            api.new_peer_connection(RTCConfiguration {
                ice_servers: vec![RTCIceServer {
                    urls: config.ice_servers.clone(),
                    ..Default::default()
                }],
                ..Default::default()
            })
            .await?,
        );

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let transport = Arc::new(Self {
            pc: Arc::clone(&pc),
            dc: Arc::new(RwLock::new(None)),
            open: Arc::new(AtomicBool::new(false)),
            remote_set: Arc::new(AtomicBool::new(false)),
            pending_candidates: Arc::new(Mutex::new(Vec::new())),
            events: events_tx,
            trickle: config.trickle,
        });

        transport.monitor_connection_state();
        if config.trickle {
            transport.emit_trickle_candidates();
        }

        if initiator {
            let dc = pc
                .create_data_channel(
                    DATA_CHANNEL_LABEL,
                    Some(RTCDataChannelInit {
                        ordered: Some(true),
                        ..Default::default()
                    }),
                )
                .await?;
            transport.attach_dc_handlers(&dc);
            *transport.dc.write().await = Some(dc);

            let offer = pc.create_offer(None).await?;
            pc.set_local_description(offer).await?;
            let sdp = transport.local_sdp().await?;
            transport
                .events
                .send(TransportEvent::Signal(SignalPayload::Offer { sdp }))
                .ok();
        } else {
            // Responder adopts the initiator's channel.
            let adopter = Arc::clone(&transport);
            pc.on_data_channel(Box::new(move |dc| {
                let adopter = Arc::clone(&adopter);
                Box::pin(async move {
                    if dc.label() != DATA_CHANNEL_LABEL {
                        warn!(
                            event = "unexpected_channel",
                            label = %dc.label(),
                            "Ignoring data channel with foreign label"
                        );
                        return;
                    }
                    adopter.attach_dc_handlers(&dc);
                    *adopter.dc.write().await = Some(dc);
                })
            }));
        }

        Ok((transport, events_rx))
    }

    // ── Handlers ─────────────────────────────────────────────────────────

    fn monitor_connection_state(&self) {
        let tx = self.events.clone();
        self.pc.on_peer_connection_state_change(Box::new(move |s| {
            let tx = tx.clone();
            Box::pin(async move {
                match s {
                    RTCPeerConnectionState::Failed => {
                        error!(event = "webrtc_failed", "Peer connection failed");
                        let _ = tx.send(TransportEvent::Error("peer connection failed".into()));
                    }
                    RTCPeerConnectionState::Disconnected => {
                        warn!(
                            event = "webrtc_disconnected",
                            "Transient disconnect (ICE may recover)"
                        );
                    }
                    _ => {}
                }
            })
        }));
    }

    fn emit_trickle_candidates(&self) {
        let tx = self.events.clone();
        self.pc.on_ice_candidate(Box::new(move |candidate| {
            let tx = tx.clone();
            Box::pin(async move {
                let Some(candidate) = candidate else {
                    return; // gathering complete
                };
                match candidate.to_json() {
                    Ok(init) => match serde_json::to_value(&init) {
                        Ok(value) => {
                            let _ = tx.send(TransportEvent::Signal(SignalPayload::Candidate {
                                candidate: value,
                            }));
                        }
                        Err(e) => warn!(event = "candidate_encode_failure", error = %e, "Failed to encode candidate"),
                    },
                    Err(e) => warn!(event = "candidate_to_json_failure", error = %e, "Failed to serialize candidate"),
                }
            })
        }));
    }

    fn attach_dc_handlers(&self, dc: &Arc<RTCDataChannel>) {
        let open = Arc::clone(&self.open);
        let tx = self.events.clone();
        dc.on_open(Box::new(move || {
            open.store(true, Ordering::Release);
            let _ = tx.send(TransportEvent::Connected);
            Box::pin(async {})
        }));

        let tx = self.events.clone();
        dc.on_message(Box::new(move |msg| {
            let _ = tx.send(TransportEvent::Message(msg.data));
            Box::pin(async {})
        }));

        let open = Arc::clone(&self.open);
        let tx = self.events.clone();
        dc.on_close(Box::new(move || {
            open.store(false, Ordering::Release);
            let _ = tx.send(TransportEvent::Disconnected);
            Box::pin(async {})
        }));

        let tx = self.events.clone();
        dc.on_error(Box::new(move |e| {
            let _ = tx.send(TransportEvent::Error(e.to_string()));
            Box::pin(async {})
        }));
    }

    // ── SDP helpers ──────────────────────────────────────────────────────

    /// The local description's SDP: immediately in trickle mode, after
    /// gathering completes otherwise.
    async fn local_sdp(&self) -> Result<String> {
        if !self.trickle {
            self.wait_gathering_complete().await?;
        }
        let desc = self
            .pc
            .local_description()
            .await
            .ok_or_else(|| anyhow!("no local description"))?;
        Ok(desc.sdp)
    }

    async fn wait_gathering_complete(&self) -> Result<()> {
        if self.pc.ice_gathering_state() == RTCIceGatheringState::Complete {
            return Ok(());
        }

        let (tx, rx) = oneshot::channel::<()>();
        let tx = Arc::new(std::sync::Mutex::new(Some(tx)));
        self.pc.on_ice_gathering_state_change(Box::new(move |state| {
            let tx = Arc::clone(&tx);
            Box::pin(async move {
                if state == RTCIceGathererState::Complete {
                    if let Ok(mut guard) = tx.lock() {
                        if let Some(tx) = guard.take() {
                            let _ = tx.send(());
                        }
                    }
                }
            })
        }));

        // Re-check after registering to close the race.
        if self.pc.ice_gathering_state() == RTCIceGatheringState::Complete {
            return Ok(());
        }

        timeout(ICE_GATHER_TIMEOUT, rx)
            .await
            .context("ICE gathering timeout")?
            .context("ICE gathering channel closed")?;
        Ok(())
    }

    async fn drain_pending_candidates(&self) -> Result<()> {
        let pending: Vec<RTCIceCandidateInit> =
            std::mem::take(&mut *self.pending_candidates.lock().await);
        for init in pending {
            self.pc.add_ice_candidate(init).await?;
        }
        Ok(())
    }

    /// Poll until the send buffer has room for `next_msg_size` bytes, or
    /// the drain timeout passes (then proceed anyway, the channel is
    /// reliable).
    async fn wait_for_buffer_space(dc: &Arc<RTCDataChannel>, next_msg_size: usize) -> Result<(), SendError> {
        if dc.buffered_amount().await + next_msg_size <= DC_BUFFERED_AMOUNT_HIGH {
            return Ok(());
        }
        let buffered = dc.buffered_amount().await;
        debug!(
            event = "backpressure",
            buffered = buffered,
            next_msg = next_msg_size,
            "Send buffer above high watermark, waiting"
        );

        let deadline = tokio::time::Instant::now() + DC_BUFFER_DRAIN_TIMEOUT;
        loop {
            if dc.ready_state() != RTCDataChannelState::Open {
                return Err(SendError::NotConnected);
            }
            if dc.buffered_amount().await + next_msg_size <= DC_BUFFERED_AMOUNT_HIGH {
                return Ok(());
            }
            if tokio::time::Instant::now() >= deadline {
                warn!(event = "buffer_drain_timeout", "Send buffer did not drain, proceeding");
                return Ok(());
            }
            tokio::time::sleep(DC_BUFFER_POLL_INTERVAL).await;
        }
    }
}

#[async_trait]
impl ReliableDatagram for WebRtcTransport {
    async fn signal(&self, payload: SignalPayload) -> Result<()> {
        match payload {
            SignalPayload::Offer { sdp } => {
                let desc = RTCSessionDescription::offer(sdp)?;
                self.pc.set_remote_description(desc).await?;
                self.remote_set.store(true, Ordering::Release);
                self.drain_pending_candidates().await?;

                let answer = self.pc.create_answer(None).await?;
                self.pc.set_local_description(answer).await?;
                let sdp = self.local_sdp().await?;
                self.events
                    .send(TransportEvent::Signal(SignalPayload::Answer { sdp }))
                    .ok();
            }
            SignalPayload::Answer { sdp } => {
                let desc = RTCSessionDescription::answer(sdp)?;
                self.pc.set_remote_description(desc).await?;
                self.remote_set.store(true, Ordering::Release);
                self.drain_pending_candidates().await?;
            }
            SignalPayload::Candidate { candidate } => {
                let init: RTCIceCandidateInit = serde_json::from_value(candidate)
                    .context("malformed ICE candidate payload")?;
                if self.remote_set.load(Ordering::Acquire) {
                    self.pc.add_ice_candidate(init).await?;
                } else {
                    self.pending_candidates.lock().await.push(init);
                }
            }
        }
        Ok(())
    }

    async fn send(&self, data: Bytes) -> Result<(), SendError> {
        if data.len() > MAX_DATAGRAM_SIZE {
            return Err(SendError::TooLarge(data.len()));
        }
        let dc = self.dc.read().await.clone();
        let Some(dc) = dc else {
            return Err(SendError::NotConnected);
        };
        if !self.open.load(Ordering::Acquire) || dc.ready_state() != RTCDataChannelState::Open {
            return Err(SendError::NotConnected);
        }

        Self::wait_for_buffer_space(&dc, data.len()).await?;
        dc.send(&data)
            .await
            .map_err(|e| SendError::Transport(e.to_string()))?;
        Ok(())
    }

    async fn buffered_amount(&self) -> usize {
        match self.dc.read().await.as_ref() {
            Some(dc) => dc.buffered_amount().await,
            None => 0,
        }
    }

    async fn close(&self) {
        self.open.store(false, Ordering::Release);
        if let Err(e) = self.pc.close().await {
            debug!(event = "pc_close_failure", error = %e, "Error closing peer connection");
        }
    }
}
