//! roomcast link: the messaging core between content contexts and the hub.
//!
//! This crate wires the channel abstraction, the decode-once codec, and the
//! two communicators into a request/response layer that survives channel
//! rotation, tab reload, and silent message loss. Every `send_request` call
//! resolves exactly once — with the real response or with a synthetic
//! timeout/canceled error — no matter what the transport does.

pub mod channel;
pub mod client;
pub mod codec;
pub mod server;

pub use channel::{AcceptedChannel, ChannelEvent, ContextId, MessageChannel};
pub use client::{ClientCommunicator, RequestHandler};
pub use server::{ContextRequestHandler, ServerCommunicator};
