//! Persistence layer abstractions.
//!
//! This module describes the storage contract ([`EventStore`] and its atomic
//! multi-stream extension [`AtomicEventStore`]), the wire formats
//! ([`NewEvent`], [`StoredEvent`]) and a reference in-memory implementation.
use std::future::Future;

use chrono::{DateTime, Utc};
pub use nonempty::NonEmpty;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{
    concurrency::{ConcurrencyConflict, ExpectedVersion},
    event::Metadata,
    id::{EventId, StreamId},
};

pub mod inmemory;

/// Raw event data ready to be written to a store backend.
///
/// This is the boundary between the session and the store: the session
/// serializes pending events to this form, the store assigns versions and
/// global sequence numbers.
#[derive(Clone, Debug, PartialEq)]
pub struct NewEvent {
    pub event_id: EventId,
    pub kind: String,
    pub data: serde_json::Value,
    pub occurred_at: DateTime<Utc>,
    pub metadata: Metadata,
}

impl NewEvent {
    /// Materialize the envelope this event becomes once committed at
    /// `version`.
    #[must_use]
    pub fn into_stored(
        self,
        stream_id: StreamId,
        version: u64,
        global_sequence: Option<u64>,
    ) -> StoredEvent {
        StoredEvent {
            event_id: self.event_id,
            stream_id,
            version,
            kind: self.kind,
            data: self.data,
            occurred_at: self.occurred_at,
            metadata: self.metadata,
            global_sequence,
        }
    }
}

/// Event materialized from the store.
///
/// `global_sequence` is assigned by the store and is `None` only for the
/// pre-commit views inline projections see while a save is in flight.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StoredEvent {
    pub event_id: EventId,
    pub stream_id: StreamId,
    /// Position within the stream, 0-based and gapless.
    pub version: u64,
    /// Stable type discriminator.
    pub kind: String,
    pub data: serde_json::Value,
    pub occurred_at: DateTime<Utc>,
    pub metadata: Metadata,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub global_sequence: Option<u64>,
}

/// One stream's share of an atomic multi-stream append.
#[derive(Clone, Debug)]
pub struct StreamBatch {
    pub stream_id: StreamId,
    pub expected_version: ExpectedVersion,
    pub events: NonEmpty<NewEvent>,
}

impl StreamBatch {
    #[must_use]
    pub const fn new(
        stream_id: StreamId,
        expected_version: ExpectedVersion,
        events: NonEmpty<NewEvent>,
    ) -> Self {
        Self {
            stream_id,
            expected_version,
            events,
        }
    }
}

/// Error from append operations.
#[derive(Debug, Error)]
pub enum AppendError<StoreError>
where
    StoreError: std::error::Error,
{
    /// Attempted to commit an empty set of batches.
    #[error("cannot append an empty event batch")]
    EmptyAppend,
    /// The same stream appeared twice in one atomic append.
    #[error("stream {0} appears more than once in a single atomic append")]
    DuplicateStream(StreamId),
    /// Concurrency conflict - another writer modified the stream.
    #[error(transparent)]
    Conflict(#[from] ConcurrencyConflict),
    /// Underlying store error.
    #[error("store error: {0}")]
    Store(#[source] StoreError),
}

impl<StoreError: std::error::Error> AppendError<StoreError> {
    /// Create a store error variant.
    pub const fn store(err: StoreError) -> Self {
        Self::Store(err)
    }
}

/// Version a stream reached in a successful append.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct CommittedStream {
    pub stream_id: StreamId,
    pub version: u64,
}

/// Result of a successful append operation.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct AppendResult {
    /// Global sequence of the last event written by the call.
    pub last_global_sequence: u64,
    /// New version of every stream touched, in request order.
    pub streams: Vec<CommittedStream>,
}

impl AppendResult {
    #[must_use]
    pub fn version_of(&self, stream_id: &StreamId) -> Option<u64> {
        self.streams
            .iter()
            .find(|committed| committed.stream_id == *stream_id)
            .map(|committed| committed.version)
    }
}

/// Convenience alias for append outcomes returned by event stores.
pub type AppendOutcome<Err> = Result<AppendResult, AppendError<Err>>;

/// Abstraction over the persistence layer for event streams.
///
/// Implementations must serialize their own check-then-append critical
/// section: one store instance is shared by every open session.
pub trait EventStore: Send + Sync {
    /// Store-specific error type.
    type Error: std::error::Error + Send + Sync + 'static;

    /// Load every event of a stream in version order.
    ///
    /// A stream that was never written yields an empty vector.
    ///
    /// # Errors
    ///
    /// Returns a store-specific error when loading fails.
    fn load_stream<'a>(
        &'a self,
        stream_id: &'a StreamId,
    ) -> impl Future<Output = Result<Vec<StoredEvent>, Self::Error>> + Send + 'a;

    /// Get the current version (latest event version) of a stream.
    ///
    /// Returns `None` for streams with no events.
    ///
    /// # Errors
    ///
    /// Returns a store-specific error when the operation fails.
    fn stream_version<'a>(
        &'a self,
        stream_id: &'a StreamId,
    ) -> impl Future<Output = Result<Option<u64>, Self::Error>> + Send + 'a;

    /// Append events to one stream, checking `expected_version` first.
    ///
    /// # Errors
    ///
    /// Returns [`AppendError::Conflict`] if the stream's version doesn't
    /// match, or [`AppendError::Store`] if persistence fails.
    fn append_events<'a>(
        &'a self,
        stream_id: &'a StreamId,
        expected_version: ExpectedVersion,
        events: NonEmpty<NewEvent>,
    ) -> impl Future<Output = AppendOutcome<Self::Error>> + Send + 'a;

    /// Load up to `limit` events in global-sequence order, starting strictly
    /// after `after` (or from the beginning when `None`).
    ///
    /// # Errors
    ///
    /// Returns a store-specific error when loading fails.
    fn load_events_from_position(
        &self,
        after: Option<u64>,
        limit: usize,
    ) -> impl Future<Output = Result<Vec<StoredEvent>, Self::Error>> + Send + '_;

    /// Highest global sequence assigned so far, `None` for an empty store.
    ///
    /// # Errors
    ///
    /// Returns a store-specific error when the operation fails.
    fn max_global_sequence(
        &self,
    ) -> impl Future<Output = Result<Option<u64>, Self::Error>> + Send + '_;
}

/// Stores that can commit batches for several streams as one unit.
///
/// Every batch's expected version is validated before anything is written;
/// a single mismatch aborts the whole call and leaves every stream unchanged.
pub trait AtomicEventStore: EventStore {
    /// Append all batches atomically.
    ///
    /// # Errors
    ///
    /// Returns [`AppendError::Conflict`] for the first stream whose expected
    /// version doesn't match, [`AppendError::DuplicateStream`] if a stream
    /// appears twice, [`AppendError::EmptyAppend`] for an empty request, or
    /// [`AppendError::Store`] if persistence fails.
    fn append_events_to_streams(
        &self,
        batches: Vec<StreamBatch>,
    ) -> impl Future<Output = AppendOutcome<Self::Error>> + Send + '_;
}

/// Reject requests naming the same stream twice.
///
/// Backends call this before validating expected versions.
///
/// # Errors
///
/// Returns [`AppendError::DuplicateStream`] for the first repeated stream.
pub fn ensure_distinct_streams<E: std::error::Error>(
    batches: &[StreamBatch],
) -> Result<(), AppendError<E>> {
    let mut seen = std::collections::HashSet::with_capacity(batches.len());
    for batch in batches {
        if !seen.insert(batch.stream_id) {
            return Err(AppendError::DuplicateStream(batch.stream_id));
        }
    }
    Ok(())
}
