//! Immutable simulation events.
//!
//! An [`Event`] records something that happens at a simulated date. The
//! kernel routes events by their [`EventType`] and never looks inside the
//! participant list or the property bag; those belong to the processors
//! that produce and consume them.

use std::borrow::Cow;
use std::collections::BTreeMap;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use crate::ids::{EventId, ParticipantId};

/// Open-ended event classification.
///
/// New processors may introduce new types at any time, so this is a string
/// newtype rather than a closed enum. The constants below name the types
/// the kernel itself produces plus the common life events.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EventType(Cow<'static, str>);

impl EventType {
    /// Published by the scheduler once per tick, before any scheduled event
    /// for the new date.
    pub const TIME_ADVANCED: Self = Self::from_static("time.advanced");
    /// Published by the controller after a completed `step`.
    pub const SIMULATION_STEPPED: Self = Self::from_static("simulation.stepped");
    /// Published by the controller after a completed `seek_to`.
    pub const SIMULATION_SEEKED: Self = Self::from_static("simulation.seeked");
    /// A person is born.
    pub const BIRTH: Self = Self::from_static("BIRTH");
    /// A person dies.
    pub const DEATH: Self = Self::from_static("DEATH");
    /// Two people form a partnership.
    pub const PARTNERSHIP: Self = Self::from_static("PARTNERSHIP");
    /// A person joins the population from outside.
    pub const IMMIGRATION: Self = Self::from_static("IMMIGRATION");

    /// Build an event type from a string literal.
    pub const fn from_static(name: &'static str) -> Self {
        Self(Cow::Borrowed(name))
    }

    /// Build an event type from any string.
    pub fn new(name: impl Into<String>) -> Self {
        Self(Cow::Owned(name.into()))
    }

    /// The type name.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl core::fmt::Display for EventType {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&'static str> for EventType {
    fn from(name: &'static str) -> Self {
        Self::from_static(name)
    }
}

impl From<String> for EventType {
    fn from(name: String) -> Self {
        Self(Cow::Owned(name))
    }
}

/// Something that happens at a simulated date.
///
/// Events are immutable once built: all fields are private and only
/// exposed through accessors. Use [`Event::new`] for a bare event or
/// [`Event::builder`] to attach participants and properties.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    /// Unique event identifier.
    id: EventId,
    /// Classification used for routing.
    event_type: EventType,
    /// Simulated date the event refers to.
    event_date: NaiveDate,
    /// Ordered participant handles.
    participants: Vec<ParticipantId>,
    /// Processor-specific payload.
    properties: BTreeMap<String, serde_json::Value>,
}

impl Event {
    /// Create an event with no participants and no properties.
    pub fn new(event_type: impl Into<EventType>, event_date: NaiveDate) -> Self {
        Self::builder(event_type, event_date).build()
    }

    /// Start building an event.
    pub fn builder(event_type: impl Into<EventType>, event_date: NaiveDate) -> EventBuilder {
        EventBuilder {
            id: None,
            event_type: event_type.into(),
            event_date,
            participants: Vec::new(),
            properties: BTreeMap::new(),
        }
    }

    /// Unique identifier.
    pub const fn id(&self) -> EventId {
        self.id
    }

    /// Routing classification.
    pub const fn event_type(&self) -> &EventType {
        &self.event_type
    }

    /// Simulated date of the event.
    pub const fn event_date(&self) -> NaiveDate {
        self.event_date
    }

    /// Participant handles, in the order the producer supplied them.
    pub fn participants(&self) -> &[ParticipantId] {
        &self.participants
    }

    /// The whole property bag.
    pub const fn properties(&self) -> &BTreeMap<String, serde_json::Value> {
        &self.properties
    }

    /// A single property, if present.
    pub fn property(&self, key: &str) -> Option<&serde_json::Value> {
        self.properties.get(key)
    }
}

/// Builder for [`Event`].
#[derive(Debug, Clone)]
pub struct EventBuilder {
    id: Option<EventId>,
    event_type: EventType,
    event_date: NaiveDate,
    participants: Vec<ParticipantId>,
    properties: BTreeMap<String, serde_json::Value>,
}

impl EventBuilder {
    /// Use a caller-supplied identifier instead of a fresh one (replays,
    /// restored snapshots).
    #[must_use]
    pub fn id(mut self, id: EventId) -> Self {
        self.id = Some(id);
        self
    }

    /// Append a participant.
    #[must_use]
    pub fn participant(mut self, participant: ParticipantId) -> Self {
        self.participants.push(participant);
        self
    }

    /// Append several participants, keeping their order.
    #[must_use]
    pub fn participants(mut self, participants: impl IntoIterator<Item = ParticipantId>) -> Self {
        self.participants.extend(participants);
        self
    }

    /// Set a property, replacing any previous value under the same key.
    #[must_use]
    pub fn property(mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.properties.insert(key.into(), value.into());
        self
    }

    /// Finish the event.
    pub fn build(self) -> Event {
        Event {
            id: self.id.unwrap_or_default(),
            event_type: self.event_type,
            event_date: self.event_date,
            participants: self.participants,
            properties: self.properties,
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    #[test]
    fn builder_keeps_participant_order() {
        let mother = ParticipantId::new();
        let child = ParticipantId::new();
        let event = Event::builder(EventType::BIRTH, date(2025, 3, 1))
            .participant(mother)
            .participant(child)
            .property("weight_grams", 3400)
            .build();

        assert_eq!(event.participants(), &[mother, child]);
        assert_eq!(event.property("weight_grams"), Some(&serde_json::json!(3400)));
        assert_eq!(event.event_type(), &EventType::BIRTH);
    }

    #[test]
    fn static_and_owned_types_compare_equal() {
        assert_eq!(EventType::new("BIRTH"), EventType::BIRTH);
        assert_eq!(EventType::from("DEATH".to_owned()), EventType::DEATH);
    }

    #[test]
    fn each_event_gets_its_own_id() {
        let a = Event::new(EventType::DEATH, date(2025, 1, 1));
        let b = Event::new(EventType::DEATH, date(2025, 1, 1));
        assert_ne!(a.id(), b.id());
    }

    #[test]
    fn event_type_serializes_as_plain_string() {
        let json = serde_json::to_string(&EventType::IMMIGRATION).unwrap();
        assert_eq!(json, "\"IMMIGRATION\"");
    }

    #[test]
    fn explicit_id_is_kept() {
        let id = EventId::new();
        let event = Event::builder("custom.type", date(2030, 6, 1)).id(id).build();
        assert_eq!(event.id(), id);
        assert_eq!(event.event_type().as_str(), "custom.type");
    }
}
