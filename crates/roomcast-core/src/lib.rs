//! roomcast core: transport-agnostic protocol primitives, error types, and
//! provider seams.
//!
//! This crate defines the link envelope format, the stanza model, and the
//! error surface shared by the tab and hub sides. It intentionally carries no
//! transport or runtime dependencies so it can be embedded in either
//! execution context.
//!
//! # Defensive guarantees
//! Panics, `unwrap`, and `expect` are compile-denied here
//! (`#![deny(clippy::panic, clippy::unwrap_used, clippy::expect_used)]`).
//! All fallible paths must surface as `RoomcastError`/`Result` so neither
//! context crashes on malformed input.

#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![deny(clippy::panic)]

pub mod error;
pub mod protocol;
pub mod provider;

pub use error::{ErrorStatus, Result, RoomcastError};
