//! Shared value types for the life simulation kernel.
//!
//! These types cross the boundary between the kernel (`lifesim-core`) and
//! the domain modules that plug into it, so they live in their own crate
//! with no dependency on the kernel itself.
//!
//! # Modules
//!
//! - [`ids`] -- Type-safe UUID wrappers for events and participants
//! - [`enums`] -- [`TimeUnit`] calendar increments and [`ControllerStatus`]
//! - [`event`] -- The immutable [`Event`] record and its [`EventType`]

pub mod enums;
pub mod event;
pub mod ids;

// Re-export all public types at crate root for convenience.
pub use enums::{ControllerStatus, TimeUnit};
pub use event::{Event, EventBuilder, EventType};
pub use ids::{EventId, ParticipantId};
