//! In-memory event store implementation for testing.
//!
//! This module provides [`Store`], a thread-safe in-memory implementation of
//! [`AtomicEventStore`](super::AtomicEventStore) suitable for unit tests,
//! examples and embedded use where durability is not required.
//!
//! # Example
//!
//! ```
//! use eventide_core::store::inmemory;
//!
//! let store = inmemory::Store::new();
//! ```

use std::{
    collections::HashMap,
    future::Future,
    sync::{Arc, RwLock},
};

use nonempty::NonEmpty;

use crate::{
    concurrency::{ConcurrencyConflict, ExpectedVersion},
    id::StreamId,
    store::{
        AppendError, AppendOutcome, AppendResult, AtomicEventStore, CommittedStream, EventStore,
        NewEvent, StoredEvent, StreamBatch, ensure_distinct_streams,
    },
};

/// In-memory event store keeping a single global log.
///
/// Events live in one vector ordered by global sequence (the sequence is the
/// index into the log); each stream keeps the log indices of its events. All
/// writes take the write lock for the whole check-then-append section, so
/// concurrent sessions observe single-writer semantics.
///
/// Cloning the store is cheap and every clone shares the same state.
#[derive(Clone, Default)]
pub struct Store {
    inner: Arc<RwLock<Inner>>,
}

#[derive(Default)]
struct Inner {
    log: Vec<StoredEvent>,
    streams: HashMap<StreamId, Vec<usize>>,
}

impl Inner {
    fn current_version(&self, stream_id: &StreamId) -> Option<u64> {
        self.streams
            .get(stream_id)
            .and_then(|indices| indices.last())
            .map(|&index| self.log[index].version)
    }

    fn validate(&self, batch: &StreamBatch) -> Result<(), ConcurrencyConflict> {
        let current = self.current_version(&batch.stream_id);
        if batch.expected_version.matches(current) {
            Ok(())
        } else {
            tracing::debug!(
                stream_id = %batch.stream_id,
                expected = %batch.expected_version,
                ?current,
                "version mismatch, rejecting append"
            );
            Err(ConcurrencyConflict {
                stream_id: batch.stream_id,
                expected: batch.expected_version,
                actual: current,
            })
        }
    }

    /// Append already-validated batches.
    fn write(&mut self, batches: Vec<StreamBatch>) -> AppendResult {
        let mut streams = Vec::with_capacity(batches.len());
        for batch in batches {
            let mut version = batch.expected_version.next_version();
            let mut last_version = version;
            for event in batch.events {
                let index = self.log.len();
                self.log
                    .push(event.into_stored(batch.stream_id, version, Some(index as u64)));
                self.streams.entry(batch.stream_id).or_default().push(index);
                last_version = version;
                version += 1;
            }
            streams.push(CommittedStream {
                stream_id: batch.stream_id,
                version: last_version,
            });
        }
        AppendResult {
            last_global_sequence: (self.log.len() as u64).saturating_sub(1),
            streams,
        }
    }
}

impl Store {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn commit(&self, batches: Vec<StreamBatch>) -> AppendOutcome<InMemoryError> {
        if batches.is_empty() {
            return Err(AppendError::EmptyAppend);
        }
        ensure_distinct_streams::<InMemoryError>(&batches)?;

        let mut inner = self
            .inner
            .write()
            .map_err(|_| AppendError::Store(InMemoryError::Poisoned))?;

        for batch in &batches {
            inner.validate(batch)?;
        }

        let event_count: usize = batches.iter().map(|batch| batch.events.len()).sum();
        let result = inner.write(batches);
        drop(inner);

        tracing::debug!(
            event_count,
            streams = result.streams.len(),
            last_global_sequence = result.last_global_sequence,
            "events committed"
        );
        Ok(result)
    }

    fn read<T>(&self, f: impl FnOnce(&Inner) -> T) -> Result<T, InMemoryError> {
        let inner = self.inner.read().map_err(|_| InMemoryError::Poisoned)?;
        Ok(f(&inner))
    }
}

/// Error type for in-memory store.
#[derive(Debug, thiserror::Error)]
pub enum InMemoryError {
    /// A writer panicked while holding the store lock.
    #[error("in-memory store lock poisoned")]
    Poisoned,
}

impl EventStore for Store {
    type Error = InMemoryError;

    #[tracing::instrument(skip(self), fields(stream_id = %stream_id))]
    fn load_stream<'a>(
        &'a self,
        stream_id: &'a StreamId,
    ) -> impl Future<Output = Result<Vec<StoredEvent>, Self::Error>> + Send + 'a {
        let result = self.read(|inner| {
            inner
                .streams
                .get(stream_id)
                .map(|indices| {
                    indices
                        .iter()
                        .map(|&index| inner.log[index].clone())
                        .collect::<Vec<_>>()
                })
                .unwrap_or_default()
        });
        if let Ok(events) = &result {
            tracing::trace!(events_loaded = events.len(), "loaded stream");
        }
        std::future::ready(result)
    }

    fn stream_version<'a>(
        &'a self,
        stream_id: &'a StreamId,
    ) -> impl Future<Output = Result<Option<u64>, Self::Error>> + Send + 'a {
        std::future::ready(self.read(|inner| inner.current_version(stream_id)))
    }

    #[tracing::instrument(skip(self, events), fields(stream_id = %stream_id, event_count = events.len()))]
    fn append_events<'a>(
        &'a self,
        stream_id: &'a StreamId,
        expected_version: ExpectedVersion,
        events: NonEmpty<NewEvent>,
    ) -> impl Future<Output = AppendOutcome<Self::Error>> + Send + 'a {
        std::future::ready(self.commit(vec![StreamBatch::new(
            *stream_id,
            expected_version,
            events,
        )]))
    }

    fn load_events_from_position(
        &self,
        after: Option<u64>,
        limit: usize,
    ) -> impl Future<Output = Result<Vec<StoredEvent>, Self::Error>> + Send + '_ {
        let start = after.map_or(0, |position| position.saturating_add(1));
        let result = self.read(|inner| {
            usize::try_from(start)
                .ok()
                .and_then(|start| inner.log.get(start..))
                .map(|tail| tail.iter().take(limit).cloned().collect())
                .unwrap_or_default()
        });
        std::future::ready(result)
    }

    fn max_global_sequence(
        &self,
    ) -> impl Future<Output = Result<Option<u64>, Self::Error>> + Send + '_ {
        std::future::ready(self.read(|inner| {
            inner
                .log
                .last()
                .and_then(|event| event.global_sequence)
        }))
    }
}

impl AtomicEventStore for Store {
    #[tracing::instrument(skip(self, batches), fields(stream_count = batches.len()))]
    fn append_events_to_streams(
        &self,
        batches: Vec<StreamBatch>,
    ) -> impl Future<Output = AppendOutcome<Self::Error>> + Send + '_ {
        std::future::ready(self.commit(batches))
    }
}
