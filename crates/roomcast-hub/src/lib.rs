//! roomcast hub library entry.
//!
//! This crate layers the room presence synchronizer and the upstream
//! connection manager on top of the link communicators, and wires them into
//! a cohesive hub stack. It is intended to be consumed by the binary
//! (`main.rs`) and by integration tests.

pub mod config;
pub mod presence;
pub mod service;
pub mod xmpp;

pub use service::HubService;
