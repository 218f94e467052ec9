//! Domain event marker and envelope.
//!
//! `DomainEvent` is the lightweight trait every concrete event struct
//! implements. Identity, occurrence time and metadata live on the [`Event`]
//! envelope rather than on the payload, so domain types stay focused on the
//! facts they record.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Serialize, de::DeserializeOwned};

use crate::id::EventId;

/// Free-form string metadata attached to an event (correlation ids, user ids,
/// etc.).
pub type Metadata = BTreeMap<String, String>;

/// Marker trait for events that can be persisted by the event store.
///
/// Each event carries a unique [`Self::KIND`] identifier so stored payloads can
/// be routed back to the correct type when rebuilding aggregates or
/// projections. Kinds must be stable across releases: they are written to
/// the store.
pub trait DomainEvent: Serialize + DeserializeOwned + Send + Sync + 'static {
    const KIND: &'static str;
}

/// Extension trait for getting the event kind from an event instance.
///
/// Blanket-implemented for every [`DomainEvent`]; `kind()` always returns
/// the `KIND` constant.
pub trait EventKind {
    fn kind(&self) -> &'static str;
}

impl<T: DomainEvent> EventKind for T {
    fn kind(&self) -> &'static str {
        T::KIND
    }
}

/// Identity, timestamp and metadata shared by every event envelope.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EventHeader {
    pub id: EventId,
    pub occurred_at: DateTime<Utc>,
    pub metadata: Metadata,
}

impl EventHeader {
    #[must_use]
    pub fn now() -> Self {
        Self {
            id: EventId::new(),
            occurred_at: Utc::now(),
            metadata: Metadata::new(),
        }
    }
}

/// A domain event together with its header.
///
/// Any `E: DomainEvent` converts into an `Event<E>` with a fresh id, the
/// current time and empty metadata, so most callers pass the bare payload.
#[derive(Clone, Debug, PartialEq)]
pub struct Event<E> {
    header: EventHeader,
    payload: E,
}

impl<E> Event<E> {
    #[must_use]
    pub fn new(payload: E) -> Self {
        Self {
            header: EventHeader::now(),
            payload,
        }
    }

    /// Attach a metadata entry.
    #[must_use]
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.header.metadata.insert(key.into(), value.into());
        self
    }

    /// Override the identity (useful for idempotent producers and tests).
    #[must_use]
    pub fn with_id(mut self, id: EventId) -> Self {
        self.header.id = id;
        self
    }

    #[must_use]
    pub fn with_occurred_at(mut self, occurred_at: DateTime<Utc>) -> Self {
        self.header.occurred_at = occurred_at;
        self
    }

    #[must_use]
    pub const fn header(&self) -> &EventHeader {
        &self.header
    }

    #[must_use]
    pub const fn payload(&self) -> &E {
        &self.payload
    }

    pub fn into_parts(self) -> (EventHeader, E) {
        (self.header, self.payload)
    }
}

impl<E: DomainEvent> From<E> for Event<E> {
    fn from(payload: E) -> Self {
        Self::new(payload)
    }
}
