//! In-memory indices and the typed event bus.

pub mod event;
pub mod maps;

pub use event::Event;
pub use maps::{ConcurrentMap, DualKeyMap};
