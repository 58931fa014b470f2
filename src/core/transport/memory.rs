//! In-process transport pair used by tests.
//!
//! Mirrors the observable behavior of the WebRTC adapter (offer/answer
//! handshake through signaling, `Connected` only after the handshake,
//! `NotConnected`/`TooLarge` send failures, FIFO delivery) without touching
//! the network. The two endpoints share a [`MemoryWire`]; each side is
//! created independently, the way the engine creates real endpoints.

use super::{
    ReliableDatagram, SendError, SignalPayload, TransportEvent, TransportEvents, TransportFactory,
    TransportHandle,
};
use crate::core::config::MAX_DATAGRAM_SIZE;
use async_trait::async_trait;
use bytes::Bytes;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;

#[derive(Default)]
struct WireInner {
    initiator_events: Option<mpsc::UnboundedSender<TransportEvent>>,
    responder_events: Option<mpsc::UnboundedSender<TransportEvent>>,
}

/// The shared "medium" between two in-process endpoints.
#[derive(Clone, Default)]
pub struct MemoryWire {
    inner: Arc<Mutex<WireInner>>,
}

impl MemoryWire {
    pub fn new() -> Self {
        Self::default()
    }

    /// A [`TransportFactory`] both sessions of a test can share.
    pub fn factory(&self) -> TransportFactory {
        let wire = self.clone();
        Arc::new(move |initiator| {
            let wire = wire.clone();
            Box::pin(async move {
                let (transport, events) = MemoryTransport::create(&wire, initiator);
                let handle: TransportHandle = transport;
                Ok((handle, events))
            })
        })
    }
}

/// One end of an in-process pair.
pub struct MemoryTransport {
    wire: MemoryWire,
    initiator: bool,
    open: AtomicBool,
    remote_set: AtomicBool,
    pending_candidates: Mutex<Vec<serde_json::Value>>,
    events: mpsc::UnboundedSender<TransportEvent>,
}

impl MemoryTransport {
    pub fn create(wire: &MemoryWire, initiator: bool) -> (Arc<MemoryTransport>, TransportEvents) {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        {
            let mut inner = wire.inner.lock().expect("wire lock");
            if initiator {
                inner.initiator_events = Some(events_tx.clone());
            } else {
                inner.responder_events = Some(events_tx.clone());
            }
        }

        let transport = Arc::new(Self {
            wire: wire.clone(),
            initiator,
            open: AtomicBool::new(false),
            remote_set: AtomicBool::new(false),
            pending_candidates: Mutex::new(Vec::new()),
            events: events_tx,
        });

        if initiator {
            transport
                .events
                .send(TransportEvent::Signal(SignalPayload::Offer {
                    sdp: "memory-sdp-offer".into(),
                }))
                .ok();
        }

        (transport, events_rx)
    }

    fn peer_events(&self) -> Option<mpsc::UnboundedSender<TransportEvent>> {
        let inner = self.wire.inner.lock().expect("wire lock");
        if self.initiator {
            inner.responder_events.clone()
        } else {
            inner.initiator_events.clone()
        }
    }

    fn mark_open(&self) {
        self.open.store(true, Ordering::Release);
        let _ = self.events.send(TransportEvent::Connected);
    }
}

#[async_trait]
impl ReliableDatagram for MemoryTransport {
    async fn signal(&self, payload: SignalPayload) -> anyhow::Result<()> {
        match payload {
            SignalPayload::Offer { .. } => {
                self.remote_set.store(true, Ordering::Release);
                self.pending_candidates.lock().expect("lock").clear();
                let _ = self
                    .events
                    .send(TransportEvent::Signal(SignalPayload::Answer {
                        sdp: "memory-sdp-answer".into(),
                    }));
                self.mark_open();
            }
            SignalPayload::Answer { .. } => {
                self.remote_set.store(true, Ordering::Release);
                self.pending_candidates.lock().expect("lock").clear();
                self.mark_open();
            }
            SignalPayload::Candidate { candidate } => {
                // Queued when early, a no-op once the description is set:
                // the wire has no candidates to apply.
                if !self.remote_set.load(Ordering::Acquire) {
                    self.pending_candidates.lock().expect("lock").push(candidate);
                }
            }
        }
        Ok(())
    }

    async fn send(&self, data: Bytes) -> Result<(), SendError> {
        if data.len() > MAX_DATAGRAM_SIZE {
            return Err(SendError::TooLarge(data.len()));
        }
        if !self.open.load(Ordering::Acquire) {
            return Err(SendError::NotConnected);
        }
        let Some(peer) = self.peer_events() else {
            return Err(SendError::Transport("peer endpoint missing".into()));
        };
        peer.send(TransportEvent::Message(data))
            .map_err(|_| SendError::Transport("peer endpoint gone".into()))
    }

    async fn buffered_amount(&self) -> usize {
        0
    }

    async fn close(&self) {
        self.open.store(false, Ordering::Release);
        if let Some(peer) = self.peer_events() {
            let _ = peer.send(TransportEvent::Disconnected);
        }
        let _ = self.events.send(TransportEvent::Disconnected);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn next(rx: &mut TransportEvents) -> TransportEvent {
        rx.recv().await.expect("transport event")
    }

    #[tokio::test]
    async fn test_handshake_then_bidirectional_send() {
        let wire = MemoryWire::new();
        let (initiator, mut init_rx) = MemoryTransport::create(&wire, true);
        let (responder, mut resp_rx) = MemoryTransport::create(&wire, false);

        // Initiator emits an offer at creation.
        let TransportEvent::Signal(SignalPayload::Offer { .. }) = next(&mut init_rx).await else {
            panic!("expected offer");
        };

        // Nothing may be sent before the handshake.
        assert_eq!(
            initiator.send(Bytes::from_static(b"early")).await,
            Err(SendError::NotConnected)
        );

        responder
            .signal(SignalPayload::Offer { sdp: "x".into() })
            .await
            .unwrap();
        let TransportEvent::Signal(SignalPayload::Answer { .. }) = next(&mut resp_rx).await else {
            panic!("expected answer");
        };
        assert!(matches!(next(&mut resp_rx).await, TransportEvent::Connected));

        initiator
            .signal(SignalPayload::Answer { sdp: "y".into() })
            .await
            .unwrap();
        assert!(matches!(next(&mut init_rx).await, TransportEvent::Connected));

        initiator.send(Bytes::from_static(b"ping")).await.unwrap();
        responder.send(Bytes::from_static(b"pong")).await.unwrap();
        let TransportEvent::Message(data) = next(&mut resp_rx).await else {
            panic!("expected message");
        };
        assert_eq!(&data[..], b"ping");
        let TransportEvent::Message(data) = next(&mut init_rx).await else {
            panic!("expected message");
        };
        assert_eq!(&data[..], b"pong");
    }

    #[tokio::test]
    async fn test_ordered_delivery() {
        let wire = MemoryWire::new();
        let (initiator, _init_rx) = MemoryTransport::create(&wire, true);
        let (responder, mut resp_rx) = MemoryTransport::create(&wire, false);
        responder
            .signal(SignalPayload::Offer { sdp: "x".into() })
            .await
            .unwrap();
        next(&mut resp_rx).await; // answer
        next(&mut resp_rx).await; // connected
        initiator
            .signal(SignalPayload::Answer { sdp: "y".into() })
            .await
            .unwrap();

        for i in 0..50u8 {
            initiator.send(Bytes::from(vec![i])).await.unwrap();
        }
        for i in 0..50u8 {
            let TransportEvent::Message(data) = next(&mut resp_rx).await else {
                panic!("expected message");
            };
            assert_eq!(data[0], i);
        }
    }

    #[tokio::test]
    async fn test_too_large_refused() {
        let wire = MemoryWire::new();
        let (initiator, _rx) = MemoryTransport::create(&wire, true);
        let huge = Bytes::from(vec![0u8; MAX_DATAGRAM_SIZE + 1]);
        assert!(matches!(
            initiator.send(huge).await,
            Err(SendError::TooLarge(_))
        ));
    }

    #[tokio::test]
    async fn test_early_candidates_queue_until_description() {
        let wire = MemoryWire::new();
        let (initiator, _rx) = MemoryTransport::create(&wire, true);
        initiator
            .signal(SignalPayload::Candidate {
                candidate: serde_json::json!({"candidate": "host"}),
            })
            .await
            .unwrap();
        assert_eq!(initiator.pending_candidates.lock().unwrap().len(), 1);
        initiator
            .signal(SignalPayload::Answer { sdp: "y".into() })
            .await
            .unwrap();
        assert!(initiator.pending_candidates.lock().unwrap().is_empty());
    }
}
