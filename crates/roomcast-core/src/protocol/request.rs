//! Request/response payloads crossing the tab<->hub link.
//!
//! `Request` is a closed tagged set: the wire `type` field maps to exactly
//! one variant, and an unknown type fails decode instead of being routed
//! anywhere.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::ErrorStatus;
use crate::protocol::stanza::Element;

/// One tab's presence wish for one room. Replaced wholesale on every update;
/// the most recent `updated_ms` wins when wishes are merged.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "camelCase")]
pub struct TabPresenceIntent {
    pub updated_ms: u64,
    pub available: bool,
    /// XMPP `show` value ("away", "xa", "dnd", "chat"); absent means plain
    /// available.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub show: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    /// Opaque badge string rendered by the tab layer.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub badge: Option<String>,
}

impl TabPresenceIntent {
    /// Away-like states are deprioritized when merging multiple tabs.
    pub fn is_away_like(&self) -> bool {
        matches!(self.show.as_deref(), Some("away") | Some("xa") | Some("dnd"))
    }
}

/// Closed set of request kinds. Tab-originated unless noted.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum Request {
    /// Keepalive no-op.
    Ping,
    /// Announce or refresh this tab's presence wish for a room.
    #[serde(rename_all = "camelCase")]
    PublishPresence {
        room: String,
        /// Desired display nickname; the hub negotiates the final one.
        nick: String,
        intent: TabPresenceIntent,
    },
    /// Withdraw this tab from a room.
    #[serde(rename_all = "camelCase")]
    LeaveRoom { room: String },
    /// Read upstream traffic counters (diagnostics).
    Stats,
    /// Hub -> tab: verbatim room presence fanout.
    #[serde(rename_all = "camelCase")]
    ParticipantUpdate { room: String, stanza: Element },
}

impl Request {
    /// Stable kind label for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            Request::Ping => "ping",
            Request::PublishPresence { .. } => "publishPresence",
            Request::LeaveRoom { .. } => "leaveRoom",
            Request::Stats => "stats",
            Request::ParticipantUpdate { .. } => "participantUpdate",
        }
    }
}

/// Tagged success-or-error result payload.
///
/// `ok: false` always carries a `status`; `timeout`/`canceled` statuses are
/// synthesized locally and distinguish "we gave up" from "the remote
/// declined".
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Response {
    pub ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<ErrorStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl Response {
    pub fn success() -> Self {
        Self {
            ok: true,
            status: None,
            message: None,
            data: None,
        }
    }

    pub fn with_data(data: Value) -> Self {
        Self {
            ok: true,
            status: None,
            message: None,
            data: Some(data),
        }
    }

    pub fn failure(status: ErrorStatus, message: impl Into<String>) -> Self {
        Self {
            ok: false,
            status: Some(status),
            message: Some(message.into()),
            data: None,
        }
    }

    /// Synthetic resolution: no answer arrived before the deadline.
    pub fn timeout() -> Self {
        Self::failure(ErrorStatus::Timeout, "request timed out")
    }

    /// Synthetic resolution: the pending call was torn down.
    pub fn canceled() -> Self {
        Self::failure(ErrorStatus::Canceled, "request canceled")
    }

    pub fn is_timeout(&self) -> bool {
        self.status == Some(ErrorStatus::Timeout)
    }

    pub fn is_canceled(&self) -> bool {
        self.status == Some(ErrorStatus::Canceled)
    }
}
