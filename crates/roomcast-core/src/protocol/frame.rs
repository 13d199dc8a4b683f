//! Link envelope wire format (JSON).
//!
//! A frame is either a request or a response; the two are told apart by the
//! presence of `responseId`. Correlation is solely by `requestId` — never by
//! arrival order, since frames from superseded channels may arrive late.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use crate::protocol::request::{Request, Response};

/// Request wrapper carrying the correlation id and send timestamp.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "camelCase")]
pub struct RequestEnvelope {
    /// Monotonic per-sender id, never reused while outstanding.
    pub request_id: u64,
    /// Wall-clock milliseconds at send time.
    pub request_time_ms: u64,
    pub request: Request,
}

impl RequestEnvelope {
    pub fn new(request_id: u64, request: Request) -> Self {
        Self {
            request_id,
            request_time_ms: now_ms(),
            request,
        }
    }
}

/// Response wrapper correlated to an earlier request by `request_id`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "camelCase")]
pub struct ResponseEnvelope {
    pub response_id: u64,
    pub request_id: u64,
    pub response: Response,
}

/// One link frame. `Response` is tried first when decoding: a response
/// carries `responseId`, which a request never has.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Frame {
    Response(ResponseEnvelope),
    Request(RequestEnvelope),
}

/// Monotonic request id source, one per sending communicator.
///
/// Ids start at 1 so that 0 can never correlate with a live entry.
#[derive(Debug)]
pub struct RequestIdSource(AtomicU64);

impl Default for RequestIdSource {
    fn default() -> Self {
        Self(AtomicU64::new(1))
    }
}

impl RequestIdSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next(&self) -> u64 {
        self.0.fetch_add(1, Ordering::Relaxed)
    }
}

/// Wall-clock milliseconds since the UNIX epoch.
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
