//! Channel abstraction between execution contexts.
//!
//! A channel is a single-use, message-oriented connection: once disconnected
//! it never reconnects, and the next connection is a new channel object.
//! Delivery is best effort while connected — a failed post is reported to
//! the caller, never retried down here.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;

use roomcast_core::Result;

pub mod inprocess;

/// Identifier of one content context (one tab).
pub type ContextId = String;

/// What one channel end observes.
#[derive(Debug)]
pub enum ChannelEvent {
    /// One encoded frame from the peer.
    Message(Bytes),
    /// The channel is gone. Fires at most once per channel.
    Disconnected,
}

/// Event stream of one channel end, handed out exactly once at
/// creation/acceptance time.
pub type ChannelEvents = mpsc::UnboundedReceiver<ChannelEvent>;

/// Bidirectional message pipe between two contexts.
#[async_trait]
pub trait MessageChannel: Send + Sync {
    /// Post one encoded frame toward the peer. Best effort: an error means
    /// the frame was not delivered, and nothing retries it here.
    async fn post(&self, payload: Bytes) -> Result<()>;

    /// Tear the channel down. Both ends observe `Disconnected` once.
    fn disconnect(&self);

    fn is_connected(&self) -> bool;
}

/// Client side of the substrate: opens fresh channels toward the hub.
#[async_trait]
pub trait ClientChannelProvider: Send + Sync {
    async fn open(&self) -> Result<(Arc<dyn MessageChannel>, ChannelEvents)>;
}

/// One inbound channel accepted on the hub side, tagged with its origin.
pub struct AcceptedChannel {
    pub context_id: ContextId,
    pub channel: Arc<dyn MessageChannel>,
    pub events: ChannelEvents,
}

/// Stream of accepted channels consumed by the hub communicator.
pub type AcceptStream = mpsc::Receiver<AcceptedChannel>;
