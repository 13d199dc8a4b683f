//! Protocol modules (link envelopes + XMPP stanzas).
//!
//! Two wire surfaces live here:
//! - the tab<->hub link envelope (JSON request/response frames with
//!   correlation ids), and
//! - the stanza model spoken toward the presence server, including the fixed
//!   interop namespaces.
//!
//! All parsers are panic-free: malformed input is reported as
//! `RoomcastError` instead of panicking, keeping both contexts resilient to
//! hostile or stale traffic.

pub mod frame;
pub mod request;
pub mod stanza;
