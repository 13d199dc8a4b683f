//! Shared error type across roomcast crates.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Wire-facing status carried inside failed responses (stable API).
///
/// `Timeout` and `Canceled` mark synthetic resolutions produced locally
/// ("we gave up"); the remaining codes describe answers the remote side
/// actually sent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorStatus {
    /// No response arrived before the deadline.
    Timeout,
    /// The pending call was torn down (context forgotten, communicator stopped).
    Canceled,
    /// The remote handler answered with a failure.
    Declined,
    /// The chat server rejected a nickname (presence error 409).
    Conflict,
    /// Internal error while producing a response.
    Internal,
}

impl ErrorStatus {
    /// String representation used in JSON responses.
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorStatus::Timeout => "timeout",
            ErrorStatus::Canceled => "canceled",
            ErrorStatus::Declined => "declined",
            ErrorStatus::Conflict => "conflict",
            ErrorStatus::Internal => "internal",
        }
    }
}

/// Shared result type.
pub type Result<T> = std::result::Result<T, RoomcastError>;

/// Unified error type used by core, link, and hub.
#[derive(Debug, Error)]
pub enum RoomcastError {
    #[error("channel closed")]
    ChannelClosed,
    #[error("not connected")]
    NotConnected,
    #[error("decode failed: {0}")]
    Decode(String),
    #[error("encode failed: {0}")]
    Encode(String),
    #[error("request timed out")]
    Timeout,
    #[error("request canceled")]
    Canceled,
    #[error("nickname conflict")]
    NickConflict,
    #[error("bad request: {0}")]
    BadRequest(String),
    #[error("internal: {0}")]
    Internal(String),
}

impl RoomcastError {
    /// Map an internal error to the stable wire-facing status.
    pub fn status(&self) -> ErrorStatus {
        match self {
            RoomcastError::Timeout => ErrorStatus::Timeout,
            RoomcastError::Canceled => ErrorStatus::Canceled,
            RoomcastError::NickConflict => ErrorStatus::Conflict,
            RoomcastError::ChannelClosed
            | RoomcastError::NotConnected
            | RoomcastError::Decode(_)
            | RoomcastError::Encode(_)
            | RoomcastError::BadRequest(_) => ErrorStatus::Declined,
            RoomcastError::Internal(_) => ErrorStatus::Internal,
        }
    }
}
