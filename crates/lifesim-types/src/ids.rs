//! Type-safe identifier wrappers around [`Uuid`].
//!
//! The simulation kernel deals in two kinds of identity:
//!
//! - [`EventId`] names one simulation event (a birth, a death, a tick). The
//!   scheduler cancels a pending event by its id, and the bus quotes it
//!   when a processor fails on that event.
//! - [`ParticipantId`] names a person or other entity listed among an
//!   event's participants. The kernel only carries it; domain modules
//!   resolve it against their own population state.
//!
//! Keeping them distinct types means a participant can never be passed
//! where an event is expected. All IDs use UUID v7 (time-ordered), so
//! identifiers created later sort later.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Generates a newtype wrapper around [`Uuid`] with standard derives.
macro_rules! define_id {
    (
        $(#[$meta:meta])*
        $name:ident
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        pub struct $name(pub Uuid);

        impl $name {
            /// Create a new identifier using UUID v7 (time-ordered).
            pub fn new() -> Self {
                Self(Uuid::now_v7())
            }

            /// Return the inner [`Uuid`] value.
            pub const fn into_inner(self) -> Uuid {
                self.0
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl core::fmt::Display for $name {
            fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<Uuid> for $name {
            fn from(id: Uuid) -> Self {
                Self(id)
            }
        }

        impl From<$name> for Uuid {
            fn from(id: $name) -> Self {
                id.0
            }
        }
    };
}

define_id! {
    /// Unique identifier for a simulation event.
    EventId
}

define_id! {
    /// Opaque handle to an entity taking part in an event (a person, a
    /// household, ...). The kernel never dereferences it; the owning domain
    /// module decides what it points at.
    ParticipantId
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_are_not_nil() {
        let event = EventId::new();
        let participant = ParticipantId::new();
        assert_ne!(event.into_inner(), Uuid::nil());
        assert_ne!(participant.into_inner(), Uuid::nil());
    }

    #[test]
    fn wrapping_a_uuid_preserves_it() {
        let raw = Uuid::now_v7();
        let id = EventId::from(raw);
        assert_eq!(Uuid::from(id), raw);
    }

    #[test]
    fn id_display_matches_uuid() {
        let id = ParticipantId::new();
        assert_eq!(id.to_string(), id.into_inner().to_string());
    }
}
