//! roomcast umbrella crate: re-exports the full stack.

pub use roomcast_core as core;
pub use roomcast_hub as hub;
pub use roomcast_link as link;
