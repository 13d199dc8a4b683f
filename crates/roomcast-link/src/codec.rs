//! Decode-once codec for the link (JSON frames as bytes).

use bytes::Bytes;

use roomcast_core::protocol::frame::Frame;
use roomcast_core::{Result, RoomcastError};

pub fn encode(frame: &Frame) -> Result<Bytes> {
    let v = serde_json::to_vec(frame).map_err(|e| RoomcastError::Encode(e.to_string()))?;
    Ok(Bytes::from(v))
}

pub fn decode(payload: &Bytes) -> Result<Frame> {
    serde_json::from_slice(payload).map_err(|e| RoomcastError::Decode(e.to_string()))
}
