#![doc = include_str!("../README.md")]

#[cfg(feature = "test-util")]
pub use eventide_core::test;
pub use eventide_core::{
    concurrency,
    concurrency::{ConcurrencyConflict, ExpectedVersion},
    event,
    event::{DomainEvent, Event, EventHeader, EventKind, Metadata},
    id,
    id::{EventId, StreamId},
    processor,
    processor::{ProcessorConfig, ProcessorHandle, ProjectionProcessor},
    projection,
    projection::{
        ApplyProjection, Locate, Projection, ProjectionReader, ProjectionRegistry,
        ProjectionWiring, Read,
    },
    repository,
    repository::Repository,
    session,
    session::{Session, SessionError},
    wiring,
    wiring::{Aggregate, AggregateWiring, Apply, Create, Wiring},
};

pub mod store {

    pub use eventide_core::store::{
        AtomicEventStore, CommittedStream, EventStore, NewEvent, NonEmpty, StoredEvent,
        StreamBatch,
    };

    // Re-export low-level append types for EventStore implementors only.
    // Most users should interact with the Session API instead.
    #[doc(hidden)]
    pub use eventide_core::store::{AppendError, AppendOutcome, AppendResult, ensure_distinct_streams};

    pub use eventide_core::store::inmemory;

    #[cfg(feature = "file")]
    #[cfg_attr(docsrs, doc(cfg(feature = "file")))]
    pub mod file {
        pub use eventide_file::{CheckpointStore, Error, Store};
    }
}
