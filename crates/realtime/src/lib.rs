#![forbid(unsafe_code)]

//! Per-room collaboration state and lifecycle: the room itself, the
//! process-wide registry that guarantees at most one live room per id, the
//! debounced persist scheduler, and the presence registry.

mod persist;
mod presence;
mod registry;
mod room;

#[cfg(test)]
mod tests;

pub use presence::PresenceRegistry;
pub use registry::{RegistryError, RoomRegistry};
pub use room::{outbound_channel, OutboundFrame, OutboundReceiver, OutboundSender, Room};
