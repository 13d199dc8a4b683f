//! Room presence synchronization.

pub mod merge;
pub mod room;

pub use merge::{merge_intents, EffectivePresence, PresenceCategory};
pub use room::{RoomPresenceManager, TabFanout};
