//! In-process channel realization.
//!
//! `InProcessSwitch` plays the role of the browser messaging substrate: tab
//! providers open channels through it, and the hub side receives them as
//! `AcceptedChannel`s tagged with the originating context id. Used by the
//! demo binary and by every integration test in this workspace.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;

use roomcast_core::{Result, RoomcastError};

use super::{
    AcceptStream, AcceptedChannel, ChannelEvent, ChannelEvents, ClientChannelProvider, ContextId,
    MessageChannel,
};

/// Shared state of one linked pipe pair.
struct PipeShared {
    connected: AtomicBool,
    a_tx: mpsc::UnboundedSender<ChannelEvent>,
    b_tx: mpsc::UnboundedSender<ChannelEvent>,
}

impl PipeShared {
    /// Disconnect once; later calls are no-ops.
    fn disconnect(&self) {
        if self.connected.swap(false, Ordering::SeqCst) {
            let _ = self.a_tx.send(ChannelEvent::Disconnected);
            let _ = self.b_tx.send(ChannelEvent::Disconnected);
        }
    }
}

#[derive(Clone, Copy)]
enum Side {
    A,
    B,
}

/// One end of an in-process pipe.
pub struct PipeEnd {
    shared: Arc<PipeShared>,
    side: Side,
}

impl PipeEnd {
    fn peer_tx(&self) -> &mpsc::UnboundedSender<ChannelEvent> {
        match self.side {
            Side::A => &self.shared.b_tx,
            Side::B => &self.shared.a_tx,
        }
    }
}

#[async_trait]
impl MessageChannel for PipeEnd {
    async fn post(&self, payload: Bytes) -> Result<()> {
        if !self.shared.connected.load(Ordering::SeqCst) {
            return Err(RoomcastError::ChannelClosed);
        }
        self.peer_tx()
            .send(ChannelEvent::Message(payload))
            .map_err(|_| RoomcastError::ChannelClosed)
    }

    fn disconnect(&self) {
        self.shared.disconnect();
    }

    fn is_connected(&self) -> bool {
        self.shared.connected.load(Ordering::SeqCst)
    }
}

/// Create a linked channel pair: `(end_a, events_a, end_b, events_b)`.
pub fn pipe() -> (Arc<PipeEnd>, ChannelEvents, Arc<PipeEnd>, ChannelEvents) {
    let (a_tx, a_rx) = mpsc::unbounded_channel();
    let (b_tx, b_rx) = mpsc::unbounded_channel();
    let shared = Arc::new(PipeShared {
        connected: AtomicBool::new(true),
        a_tx,
        b_tx,
    });
    let a = Arc::new(PipeEnd {
        shared: Arc::clone(&shared),
        side: Side::A,
    });
    let b = Arc::new(PipeEnd {
        shared,
        side: Side::B,
    });
    (a, a_rx, b, b_rx)
}

/// In-process messaging substrate linking tab providers to one hub acceptor.
pub struct InProcessSwitch {
    accept_tx: mpsc::Sender<AcceptedChannel>,
}

impl InProcessSwitch {
    /// The returned receiver is the hub communicator's accept stream.
    pub fn new() -> (Self, AcceptStream) {
        let (accept_tx, accept_rx) = mpsc::channel(64);
        (Self { accept_tx }, accept_rx)
    }

    /// Channel provider for one tab context.
    pub fn provider(&self, context_id: impl Into<ContextId>) -> InProcessProvider {
        InProcessProvider {
            context_id: context_id.into(),
            accept_tx: self.accept_tx.clone(),
        }
    }
}

/// Tab-side provider: each `open` creates a fresh pipe pair and hands the
/// hub end to the acceptor.
pub struct InProcessProvider {
    context_id: ContextId,
    accept_tx: mpsc::Sender<AcceptedChannel>,
}

#[async_trait]
impl ClientChannelProvider for InProcessProvider {
    async fn open(&self) -> Result<(Arc<dyn MessageChannel>, ChannelEvents)> {
        let (tab_end, tab_events, hub_end, hub_events) = pipe();
        self.accept_tx
            .send(AcceptedChannel {
                context_id: self.context_id.clone(),
                channel: hub_end,
                events: hub_events,
            })
            .await
            .map_err(|_| RoomcastError::NotConnected)?;
        Ok((tab_end, tab_events))
    }
}
