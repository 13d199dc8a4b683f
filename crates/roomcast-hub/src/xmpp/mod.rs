//! Upstream presence-server connection.

pub mod manager;

pub use manager::{
    Credentials, SessionEvent, StanzaSink, TrafficSnapshot, TrafficStats, XmppConnectionManager,
    XmppEvent, XmppSession, XmppTransport,
};
