//! Type-keyed dispatch tables for aggregates and their events.
//!
//! A [`Wiring`] maps `(aggregate type, event kind)` pairs to monomorphized
//! creation factories and mutation appliers, and every registered event type
//! to its kind discriminator and serde codec. Aggregates describe themselves
//! through [`Aggregate::wire`]; each registration is bounded by the handler
//! trait it dispatches to, so an aggregate can only be wired for events it
//! actually handles.
//!
//! ```ignore
//! impl Aggregate for Account {
//!     const KIND: &'static str = "account";
//!
//!     fn wire(wiring: &mut AggregateWiring<Self>) {
//!         wiring
//!             .creation::<AccountOpened>()
//!             .mutation::<FundsDeposited>();
//!     }
//! }
//!
//! let wiring = Wiring::new().with::<Account>()?;
//! ```

use std::{
    any::{Any, TypeId, type_name},
    collections::HashMap,
    marker::PhantomData,
};

use thiserror::Error;

use crate::{event::DomainEvent, store::StoredEvent};

/// Command-side entity folded from one event stream.
///
/// The aggregate never persists itself and never stores its own version: the
/// session tracks both.
pub trait Aggregate: Sized + Send + 'static {
    /// Human-readable aggregate type name, used in diagnostics.
    const KIND: &'static str;

    /// Register the events this aggregate is created from and mutated by.
    fn wire(wiring: &mut AggregateWiring<Self>);
}

/// Build an aggregate from the first event of its stream.
pub trait Create<E>: Sized {
    fn create(event: &E) -> Self;
}

/// Mutate an aggregate with a domain event.
///
/// ```ignore
/// impl Apply<FundsDeposited> for Account {
///     fn apply(&mut self, event: &FundsDeposited) {
///         self.balance += event.amount;
///     }
/// }
/// ```
pub trait Apply<E> {
    fn apply(&mut self, event: &E);
}

/// Errors raised while building or merging wiring tables.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum WiringError {
    #[error("event kind `{kind}` is registered for both `{existing}` and `{incoming}`")]
    ConflictingEventKind {
        kind: &'static str,
        existing: &'static str,
        incoming: &'static str,
    },
    #[error("aggregate kind `{kind}` is registered for both `{existing}` and `{incoming}`")]
    ConflictingAggregateKind {
        kind: &'static str,
        existing: &'static str,
        incoming: &'static str,
    },
}

/// Error returned by [`Wiring::decode`].
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("event kind `{0}` is not registered")]
    UnknownEventType(String),
    #[error("stored event has kind `{found}`, expected `{expected}`")]
    KindMismatch {
        expected: &'static str,
        found: String,
    },
    #[error("failed to deserialize event `{kind}`: {source}")]
    Codec {
        kind: String,
        #[source]
        source: serde_json::Error,
    },
}

type CreateFromData = fn(&serde_json::Value) -> Result<Box<dyn Any + Send>, serde_json::Error>;
type CreateFromPayload = fn(&dyn Any) -> Option<Box<dyn Any + Send>>;
type ApplyData = fn(&mut dyn Any, &serde_json::Value) -> Result<bool, serde_json::Error>;
type ApplyPayload = fn(&mut dyn Any, &dyn Any) -> bool;
type Encode = fn(&dyn Any) -> Option<Result<serde_json::Value, serde_json::Error>>;

#[derive(Clone, Copy)]
struct Creator {
    from_data: CreateFromData,
    from_payload: CreateFromPayload,
}

#[derive(Clone, Copy)]
struct Applier {
    data: ApplyData,
    payload: ApplyPayload,
}

#[derive(Clone, Copy)]
struct EventCodec {
    kind: &'static str,
    type_name: &'static str,
    encode: Encode,
}

#[derive(Clone)]
struct AggregateEntry {
    kind: &'static str,
    type_name: &'static str,
    creators: HashMap<&'static str, Creator>,
    appliers: HashMap<&'static str, Applier>,
}

/// Merged dispatch tables for every aggregate known to a repository.
#[derive(Clone, Default)]
pub struct Wiring {
    aggregates: HashMap<TypeId, AggregateEntry>,
    aggregate_kinds: HashMap<&'static str, TypeId>,
    codecs: HashMap<TypeId, EventCodec>,
    event_kinds: HashMap<&'static str, TypeId>,
}

impl std::fmt::Debug for Wiring {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Wiring")
            .field("aggregates", &self.aggregate_kinds.keys().collect::<Vec<_>>())
            .field("event_kinds", &self.event_kinds.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl Wiring {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Build the tables for a single aggregate.
    ///
    /// # Errors
    ///
    /// Returns [`WiringError::ConflictingEventKind`] if two event types wired
    /// by the aggregate share a kind.
    pub fn for_aggregate<A: Aggregate>() -> Result<Self, WiringError> {
        let mut wiring = AggregateWiring::<A>::new();
        A::wire(&mut wiring);
        wiring.finish()
    }

    /// Add an aggregate's tables to this wiring.
    ///
    /// # Errors
    ///
    /// Returns a [`WiringError`] when the aggregate's kinds collide with kinds
    /// already registered by a different Rust type.
    pub fn with<A: Aggregate>(self) -> Result<Self, WiringError> {
        self.merge(Self::for_aggregate::<A>()?)
    }

    /// Combine two independently built wiring tables.
    ///
    /// Registering the same aggregate or event type twice is allowed; the
    /// same kind claimed by two different types is not.
    ///
    /// # Errors
    ///
    /// Returns a [`WiringError`] describing the first conflicting kind.
    pub fn merge(mut self, other: Self) -> Result<Self, WiringError> {
        for (type_id, codec) in other.codecs {
            self.insert_codec(type_id, codec)?;
        }
        for (type_id, entry) in other.aggregates {
            self.insert_aggregate(type_id, entry)?;
        }
        Ok(self)
    }

    fn insert_codec(&mut self, type_id: TypeId, codec: EventCodec) -> Result<(), WiringError> {
        if let Some(existing) = self.event_kinds.get(codec.kind)
            && *existing != type_id
        {
            return Err(WiringError::ConflictingEventKind {
                kind: codec.kind,
                existing: self.codecs[existing].type_name,
                incoming: codec.type_name,
            });
        }
        self.event_kinds.insert(codec.kind, type_id);
        self.codecs.insert(type_id, codec);
        Ok(())
    }

    fn insert_aggregate(
        &mut self,
        type_id: TypeId,
        entry: AggregateEntry,
    ) -> Result<(), WiringError> {
        if let Some(existing) = self.aggregate_kinds.get(entry.kind)
            && *existing != type_id
        {
            return Err(WiringError::ConflictingAggregateKind {
                kind: entry.kind,
                existing: self.aggregates[existing].type_name,
                incoming: entry.type_name,
            });
        }
        self.aggregate_kinds.insert(entry.kind, type_id);
        match self.aggregates.get_mut(&type_id) {
            Some(current) => {
                current.creators.extend(entry.creators);
                current.appliers.extend(entry.appliers);
            }
            None => {
                self.aggregates.insert(type_id, entry);
            }
        }
        Ok(())
    }

    /// Whether an event kind has a registered codec.
    #[must_use]
    pub fn knows_kind(&self, kind: &str) -> bool {
        self.event_kinds.contains_key(kind)
    }

    /// Registered event kinds, in no particular order.
    pub fn event_kinds(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.event_kinds.keys().copied()
    }

    /// Whether aggregate `A` has been wired.
    #[must_use]
    pub fn knows_aggregate<A: Aggregate>(&self) -> bool {
        self.aggregates.contains_key(&TypeId::of::<A>())
    }

    /// Decode a stored event into its typed payload.
    ///
    /// # Errors
    ///
    /// Returns [`DecodeError::UnknownEventType`] if the stored kind is not
    /// registered, [`DecodeError::KindMismatch`] if it belongs to a different
    /// type, or [`DecodeError::Codec`] if the payload does not deserialize.
    pub fn decode<E: DomainEvent>(&self, stored: &StoredEvent) -> Result<E, DecodeError> {
        if !self.knows_kind(&stored.kind) {
            return Err(DecodeError::UnknownEventType(stored.kind.clone()));
        }
        if stored.kind != E::KIND {
            return Err(DecodeError::KindMismatch {
                expected: E::KIND,
                found: stored.kind.clone(),
            });
        }
        E::deserialize(&stored.data).map_err(|source| DecodeError::Codec {
            kind: stored.kind.clone(),
            source,
        })
    }

    /// Build an aggregate from a stored creation event. `None` when no factory
    /// exists for the pair.
    pub(crate) fn create_from_data(
        &self,
        aggregate: TypeId,
        kind: &str,
        data: &serde_json::Value,
    ) -> Option<Result<Box<dyn Any + Send>, serde_json::Error>> {
        let creator = self.aggregates.get(&aggregate)?.creators.get(kind)?;
        Some((creator.from_data)(data))
    }

    pub(crate) fn create_from_payload(
        &self,
        aggregate: TypeId,
        kind: &str,
        payload: &dyn Any,
    ) -> Option<Box<dyn Any + Send>> {
        let creator = self.aggregates.get(&aggregate)?.creators.get(kind)?;
        (creator.from_payload)(payload)
    }

    /// Fold a stored event into an aggregate. `None` when no applier exists
    /// for the pair.
    pub(crate) fn apply_data(
        &self,
        aggregate_type: TypeId,
        aggregate: &mut dyn Any,
        kind: &str,
        data: &serde_json::Value,
    ) -> Option<Result<(), serde_json::Error>> {
        let applier = self.aggregates.get(&aggregate_type)?.appliers.get(kind)?;
        match (applier.data)(aggregate, data) {
            Ok(true) => Some(Ok(())),
            Ok(false) => None,
            Err(error) => Some(Err(error)),
        }
    }

    /// Apply a typed payload to an aggregate. Returns `false` when no applier
    /// exists for the pair.
    pub(crate) fn apply_payload(
        &self,
        aggregate_type: TypeId,
        aggregate: &mut dyn Any,
        kind: &str,
        payload: &dyn Any,
    ) -> bool {
        self.aggregates
            .get(&aggregate_type)
            .and_then(|entry| entry.appliers.get(kind))
            .is_some_and(|applier| (applier.payload)(aggregate, payload))
    }

    /// Serialize a typed payload through its registered codec.
    pub(crate) fn encode(
        &self,
        event_type: TypeId,
        payload: &dyn Any,
    ) -> Option<Result<serde_json::Value, serde_json::Error>> {
        let codec = self.codecs.get(&event_type)?;
        (codec.encode)(payload)
    }
}

/// Registration surface handed to [`Aggregate::wire`].
pub struct AggregateWiring<A> {
    entry: AggregateEntry,
    codecs: Vec<(TypeId, EventCodec)>,
    _aggregate: PhantomData<fn() -> A>,
}

impl<A: Aggregate> AggregateWiring<A> {
    fn new() -> Self {
        Self {
            entry: AggregateEntry {
                kind: A::KIND,
                type_name: type_name::<A>(),
                creators: HashMap::new(),
                appliers: HashMap::new(),
            },
            codecs: Vec::new(),
            _aggregate: PhantomData,
        }
    }

    /// Register `E` as an event that can start a stream of `A`.
    pub fn creation<E>(&mut self) -> &mut Self
    where
        E: DomainEvent,
        A: Create<E>,
    {
        self.codec::<E>();
        self.entry.creators.insert(
            E::KIND,
            Creator {
                from_data: create_from_data::<A, E>,
                from_payload: create_from_payload::<A, E>,
            },
        );
        self
    }

    /// Register `E` as an event that mutates an existing `A`.
    pub fn mutation<E>(&mut self) -> &mut Self
    where
        E: DomainEvent,
        A: Apply<E>,
    {
        self.codec::<E>();
        self.entry.appliers.insert(
            E::KIND,
            Applier {
                data: apply_data::<A, E>,
                payload: apply_payload::<A, E>,
            },
        );
        self
    }

    fn codec<E: DomainEvent>(&mut self) {
        self.codecs.push((
            TypeId::of::<E>(),
            EventCodec {
                kind: E::KIND,
                type_name: type_name::<E>(),
                encode: encode::<E>,
            },
        ));
    }

    fn finish(self) -> Result<Wiring, WiringError> {
        let mut wiring = Wiring::new();
        for (type_id, codec) in self.codecs {
            wiring.insert_codec(type_id, codec)?;
        }
        wiring.insert_aggregate(TypeId::of::<A>(), self.entry)?;
        Ok(wiring)
    }
}

fn create_from_data<A, E>(data: &serde_json::Value) -> Result<Box<dyn Any + Send>, serde_json::Error>
where
    A: Aggregate + Create<E>,
    E: DomainEvent,
{
    let event = E::deserialize(data)?;
    Ok(Box::new(A::create(&event)))
}

fn create_from_payload<A, E>(payload: &dyn Any) -> Option<Box<dyn Any + Send>>
where
    A: Aggregate + Create<E>,
    E: DomainEvent,
{
    let event = payload.downcast_ref::<E>()?;
    Some(Box::new(A::create(event)))
}

fn apply_data<A, E>(aggregate: &mut dyn Any, data: &serde_json::Value) -> Result<bool, serde_json::Error>
where
    A: Aggregate + Apply<E>,
    E: DomainEvent,
{
    let Some(aggregate) = aggregate.downcast_mut::<A>() else {
        return Ok(false);
    };
    let event = E::deserialize(data)?;
    aggregate.apply(&event);
    Ok(true)
}

fn apply_payload<A, E>(aggregate: &mut dyn Any, payload: &dyn Any) -> bool
where
    A: Aggregate + Apply<E>,
    E: DomainEvent,
{
    match (aggregate.downcast_mut::<A>(), payload.downcast_ref::<E>()) {
        (Some(aggregate), Some(event)) => {
            aggregate.apply(event);
            true
        }
        _ => false,
    }
}

fn encode<E: DomainEvent>(payload: &dyn Any) -> Option<Result<serde_json::Value, serde_json::Error>> {
    payload.downcast_ref::<E>().map(serde_json::to_value)
}
