//! Unit of work over one or more event streams.
//!
//! A [`Session`] caches every aggregate it loads or starts, records new events
//! as pending, and commits all pending events of all streams with a single
//! atomic multi-stream append. Sessions are cheap: open one per business
//! transaction and drop it afterwards.
//!
//! ```ignore
//! let mut session = repository.open_session();
//! session.start_stream::<Account, _>(id, AccountOpened { owner: "ada".into() })?;
//! session.append(&id, FundsDeposited { amount: 10 })?;
//! session.save_changes().await?;
//! ```

use std::{
    any::{Any, TypeId},
    fmt,
};

use indexmap::IndexMap;
use nonempty::NonEmpty;
use thiserror::Error;

use crate::{
    concurrency::{ConcurrencyConflict, ExpectedVersion},
    event::{DomainEvent, Event, EventHeader},
    id::StreamId,
    projection::ProjectionError,
    repository::Repository,
    store::{AppendError, AtomicEventStore, EventStore, NewEvent, StreamBatch},
    wiring::Aggregate,
};

/// Errors returned by [`Session`] operations.
#[derive(Debug, Error)]
pub enum SessionError<StoreError>
where
    StoreError: std::error::Error + 'static,
{
    /// Another writer changed a stream since it was loaded; reload and retry.
    #[error(transparent)]
    Concurrency(ConcurrencyConflict),
    #[error("stream {0} has no events")]
    StreamNotFound(StreamId),
    #[error("event kind `{kind}` cannot create aggregate `{aggregate}` (stream {stream_id})")]
    InvalidCreationEvent {
        stream_id: StreamId,
        aggregate: &'static str,
        kind: String,
    },
    #[error("aggregate `{aggregate}` does not handle event kind `{kind}` (stream {stream_id})")]
    UnsupportedEvent {
        stream_id: StreamId,
        aggregate: &'static str,
        kind: String,
    },
    #[error("event kind `{kind}` is not registered")]
    UnknownEventType { kind: String },
    #[error("failed to serialize or deserialize event `{kind}`: {source}")]
    Codec {
        kind: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("stream {0} is not tracked by this session")]
    StreamNotTracked(StreamId),
    #[error("stream {0} is already tracked by this session")]
    StreamAlreadyTracked(StreamId),
    #[error("stream {stream_id} is tracked as `{tracked}`, not `{requested}`")]
    AggregateTypeMismatch {
        stream_id: StreamId,
        tracked: &'static str,
        requested: &'static str,
    },
    #[error("inline projection failed: {0}")]
    Projection(#[source] ProjectionError),
    #[error("store rejected the append: {0}")]
    Append(#[source] AppendError<StoreError>),
    #[error("store error: {0}")]
    Store(#[source] StoreError),
}

impl<StoreError> From<AppendError<StoreError>> for SessionError<StoreError>
where
    StoreError: std::error::Error + 'static,
{
    fn from(error: AppendError<StoreError>) -> Self {
        match error {
            AppendError::Conflict(conflict) => Self::Concurrency(conflict),
            AppendError::Store(error) => Self::Store(error),
            other => Self::Append(other),
        }
    }
}

impl<StoreError> SessionError<StoreError>
where
    StoreError: std::error::Error + 'static,
{
    /// The conflict, if this error is a lost optimistic-concurrency race.
    #[must_use]
    pub const fn as_conflict(&self) -> Option<&ConcurrencyConflict> {
        match self {
            Self::Concurrency(conflict) => Some(conflict),
            _ => None,
        }
    }
}

type SessionResult<T, S> = Result<T, SessionError<<S as EventStore>::Error>>;

struct PendingEvent {
    header: EventHeader,
    kind: &'static str,
    event_type: TypeId,
    payload: Box<dyn Any + Send + Sync>,
}

impl PendingEvent {
    fn new<E: DomainEvent>(header: EventHeader, payload: E) -> Self {
        Self {
            header,
            kind: E::KIND,
            event_type: TypeId::of::<E>(),
            payload: Box::new(payload),
        }
    }
}

struct TrackedStream {
    aggregate: Box<dyn Any + Send>,
    aggregate_type: TypeId,
    aggregate_kind: &'static str,
    /// Version of the last persisted event, `None` for a stream not yet in
    /// the store.
    baseline: Option<u64>,
    pending: Vec<PendingEvent>,
}

/// Unit of work tracking aggregates and their pending events.
///
/// Created by [`Repository::open_session`]. A session is used by one task at
/// a time; it takes no locks until [`Session::save_changes`].
pub struct Session<'r, S> {
    repository: &'r Repository<S>,
    tracked: IndexMap<StreamId, TrackedStream>,
}

impl<S> fmt::Debug for Session<'_, S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_map()
            .entries(
                self.tracked
                    .iter()
                    .map(|(id, tracked)| (id, (tracked.aggregate_kind, tracked.pending.len()))),
            )
            .finish()
    }
}

impl<'r, S> Session<'r, S>
where
    S: AtomicEventStore,
{
    pub(crate) fn new(repository: &'r Repository<S>) -> Self {
        Self {
            repository,
            tracked: IndexMap::new(),
        }
    }

    /// Load an aggregate, reading its stream at most once per session.
    ///
    /// Subsequent loads of the same stream return the cached instance,
    /// including any mutations applied by [`Session::append`].
    ///
    /// # Errors
    ///
    /// - [`SessionError::StreamNotFound`] if the stream has no events
    /// - [`SessionError::InvalidCreationEvent`] if the first event cannot
    ///   create `A`
    /// - [`SessionError::UnsupportedEvent`] if a later event has no applier
    /// - [`SessionError::AggregateTypeMismatch`] if the stream is already
    ///   tracked as a different aggregate
    #[tracing::instrument(skip(self), fields(stream_id = %stream_id, aggregate = A::KIND))]
    pub async fn load<A: Aggregate>(&mut self, stream_id: &StreamId) -> SessionResult<&A, S> {
        if self.tracked.contains_key(stream_id) {
            tracing::trace!("serving cached aggregate");
        } else {
            let tracked = Self::rehydrate::<A>(self.repository, stream_id).await?;
            self.tracked.insert(*stream_id, tracked);
        }
        self.typed::<A>(stream_id)
    }

    async fn rehydrate<A: Aggregate>(
        repository: &Repository<S>,
        stream_id: &StreamId,
    ) -> SessionResult<TrackedStream, S> {
        let wiring = repository.wiring();
        let aggregate_type = TypeId::of::<A>();

        let events = repository
            .store()
            .load_stream(stream_id)
            .await
            .map_err(SessionError::Store)?;
        let Some((first, rest)) = events.split_first() else {
            return Err(SessionError::StreamNotFound(*stream_id));
        };

        let mut aggregate = wiring
            .create_from_data(aggregate_type, &first.kind, &first.data)
            .ok_or_else(|| SessionError::InvalidCreationEvent {
                stream_id: *stream_id,
                aggregate: A::KIND,
                kind: first.kind.clone(),
            })?
            .map_err(|source| SessionError::Codec {
                kind: first.kind.clone(),
                source,
            })?;

        for event in rest {
            wiring
                .apply_data(aggregate_type, aggregate.as_mut(), &event.kind, &event.data)
                .ok_or_else(|| SessionError::UnsupportedEvent {
                    stream_id: *stream_id,
                    aggregate: A::KIND,
                    kind: event.kind.clone(),
                })?
                .map_err(|source| SessionError::Codec {
                    kind: event.kind.clone(),
                    source,
                })?;
        }

        let baseline = events.last().map(|event| event.version);
        tracing::debug!(events = events.len(), ?baseline, "rehydrated aggregate");
        Ok(TrackedStream {
            aggregate,
            aggregate_type,
            aggregate_kind: A::KIND,
            baseline,
            pending: Vec::new(),
        })
    }

    /// Begin a new stream with its creation event.
    ///
    /// The aggregate is built by its creation factory; no mutation handler is
    /// applied to the creation event.
    ///
    /// # Errors
    ///
    /// - [`SessionError::StreamAlreadyTracked`] if the session already tracks
    ///   the stream
    /// - [`SessionError::InvalidCreationEvent`] if `E` cannot create `A`
    pub fn start_stream<A, E>(&mut self, stream_id: StreamId, event: E) -> SessionResult<&A, S>
    where
        A: Aggregate,
        E: DomainEvent,
    {
        self.start_stream_event::<A, E>(stream_id, Event::new(event))
    }

    /// [`Session::start_stream`] with an explicit event header.
    ///
    /// # Errors
    ///
    /// See [`Session::start_stream`].
    pub fn start_stream_event<A, E>(
        &mut self,
        stream_id: StreamId,
        event: Event<E>,
    ) -> SessionResult<&A, S>
    where
        A: Aggregate,
        E: DomainEvent,
    {
        if self.tracked.contains_key(&stream_id) {
            return Err(SessionError::StreamAlreadyTracked(stream_id));
        }

        let repository = self.repository;
        let (header, payload) = event.into_parts();
        let aggregate = repository
            .wiring()
            .create_from_payload(TypeId::of::<A>(), E::KIND, &payload)
            .ok_or_else(|| SessionError::InvalidCreationEvent {
                stream_id,
                aggregate: A::KIND,
                kind: E::KIND.to_string(),
            })?;

        tracing::debug!(%stream_id, aggregate = A::KIND, kind = E::KIND, "started stream");
        self.tracked.insert(
            stream_id,
            TrackedStream {
                aggregate,
                aggregate_type: TypeId::of::<A>(),
                aggregate_kind: A::KIND,
                baseline: None,
                pending: vec![PendingEvent::new(header, payload)],
            },
        );
        self.typed::<A>(&stream_id)
    }

    /// Record an event on a tracked stream and apply it to the cached
    /// aggregate.
    ///
    /// # Errors
    ///
    /// - [`SessionError::StreamNotTracked`] if the stream was neither loaded
    ///   nor started in this session
    /// - [`SessionError::UnsupportedEvent`] if the aggregate has no applier
    ///   for `E`; nothing is recorded
    pub fn append<E: DomainEvent>(&mut self, stream_id: &StreamId, event: E) -> SessionResult<(), S> {
        self.append_event(stream_id, Event::new(event))
    }

    /// [`Session::append`] with an explicit event header.
    ///
    /// # Errors
    ///
    /// See [`Session::append`].
    pub fn append_event<E: DomainEvent>(
        &mut self,
        stream_id: &StreamId,
        event: Event<E>,
    ) -> SessionResult<(), S> {
        let repository = self.repository;
        let tracked = self
            .tracked
            .get_mut(stream_id)
            .ok_or(SessionError::StreamNotTracked(*stream_id))?;
        let (header, payload) = event.into_parts();
        if !repository.wiring().apply_payload(
            tracked.aggregate_type,
            tracked.aggregate.as_mut(),
            E::KIND,
            &payload,
        ) {
            return Err(SessionError::UnsupportedEvent {
                stream_id: *stream_id,
                aggregate: tracked.aggregate_kind,
                kind: E::KIND.to_string(),
            });
        }

        tracked.pending.push(PendingEvent::new(header, payload));
        tracing::trace!(%stream_id, kind = E::KIND, pending = tracked.pending.len(), "appended event");
        Ok(())
    }

    /// Drop the pending events of one stream.
    ///
    /// Mutations already applied to the cached aggregate are kept.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::StreamNotTracked`] for an unknown stream.
    pub fn discard_stream(&mut self, stream_id: &StreamId) -> SessionResult<(), S> {
        let tracked = self
            .tracked
            .get_mut(stream_id)
            .ok_or(SessionError::StreamNotTracked(*stream_id))?;
        tracked.pending.clear();
        Ok(())
    }

    /// Drop the pending events of every tracked stream.
    pub fn discard_all(&mut self) {
        for tracked in self.tracked.values_mut() {
            tracked.pending.clear();
        }
    }

    /// Persist every pending event in one atomic append.
    ///
    /// Inline projections interested in the saved events are updated before
    /// this returns. On any error nothing is persisted, no read model changes
    /// and the pending events stay queued.
    ///
    /// # Errors
    ///
    /// - [`SessionError::Concurrency`] if any stream changed since it was
    ///   loaded
    /// - [`SessionError::Projection`] if an inline projection failed
    /// - [`SessionError::Codec`] if a payload failed to serialize
    /// - [`SessionError::Store`] if the backend failed
    #[tracing::instrument(skip(self))]
    pub async fn save_changes(&mut self) -> SessionResult<(), S> {
        let repository = self.repository;
        let wiring = repository.wiring();

        let mut batches = Vec::new();
        let mut views = Vec::new();
        for (stream_id, tracked) in &self.tracked {
            let mut events = Vec::with_capacity(tracked.pending.len());
            for pending in &tracked.pending {
                let data = wiring
                    .encode(pending.event_type, pending.payload.as_ref())
                    .ok_or_else(|| SessionError::UnknownEventType {
                        kind: pending.kind.to_string(),
                    })?
                    .map_err(|source| SessionError::Codec {
                        kind: pending.kind.to_string(),
                        source,
                    })?;
                events.push(NewEvent {
                    event_id: pending.header.id,
                    kind: pending.kind.to_string(),
                    data,
                    occurred_at: pending.header.occurred_at,
                    metadata: pending.header.metadata.clone(),
                });
            }
            let Some(events) = NonEmpty::from_vec(events) else {
                continue;
            };

            let expected = ExpectedVersion::from_current(tracked.baseline);
            let first_version = expected.next_version();
            views.extend(
                events
                    .iter()
                    .zip(first_version..)
                    .map(|(event, version)| event.clone().into_stored(*stream_id, version, None)),
            );
            batches.push(StreamBatch::new(*stream_id, expected, events));
        }

        if batches.is_empty() {
            tracing::trace!("nothing to save");
            return Ok(());
        }

        let stream_count = batches.len();
        let result = repository.commit(batches, &views).await?;

        for (stream_id, tracked) in &mut self.tracked {
            if tracked.pending.is_empty() {
                continue;
            }
            tracked.baseline = result.version_of(stream_id);
            tracked.pending.clear();
        }
        tracing::debug!(
            streams = stream_count,
            events = views.len(),
            last_global_sequence = result.last_global_sequence,
            "saved changes"
        );
        Ok(())
    }

    /// The cached aggregate for a tracked stream.
    #[must_use]
    pub fn aggregate<A: Aggregate>(&self, stream_id: &StreamId) -> Option<&A> {
        self.tracked.get(stream_id)?.aggregate.downcast_ref::<A>()
    }

    #[must_use]
    pub fn is_tracked(&self, stream_id: &StreamId) -> bool {
        self.tracked.contains_key(stream_id)
    }

    /// Number of pending events on a stream (0 if untracked).
    #[must_use]
    pub fn pending_events(&self, stream_id: &StreamId) -> usize {
        self.tracked
            .get(stream_id)
            .map_or(0, |tracked| tracked.pending.len())
    }

    /// Expected version the next save of this stream will carry, `None` if
    /// the stream is untracked.
    #[must_use]
    pub fn baseline_version(&self, stream_id: &StreamId) -> Option<ExpectedVersion> {
        self.tracked
            .get(stream_id)
            .map(|tracked| ExpectedVersion::from_current(tracked.baseline))
    }

    #[must_use]
    pub fn has_pending_changes(&self) -> bool {
        self.tracked.values().any(|tracked| !tracked.pending.is_empty())
    }

    /// Tracked streams in the order they were first loaded or started.
    pub fn tracked_streams(&self) -> impl Iterator<Item = &StreamId> {
        self.tracked.keys()
    }

    fn typed<A: Aggregate>(&self, stream_id: &StreamId) -> SessionResult<&A, S> {
        let tracked = self
            .tracked
            .get(stream_id)
            .ok_or(SessionError::StreamNotTracked(*stream_id))?;
        tracked
            .aggregate
            .downcast_ref::<A>()
            .ok_or(SessionError::AggregateTypeMismatch {
                stream_id: *stream_id,
                tracked: tracked.aggregate_kind,
                requested: A::KIND,
            })
    }
}
