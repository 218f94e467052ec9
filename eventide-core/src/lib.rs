//! Core traits and types for the eventide event-sourcing library.
//!
//! This crate provides the foundational abstractions for event sourcing:
//!
//! - [`wiring`] - Aggregate handler registration (`Aggregate`, `Create`, `Apply`, `Wiring`)
//! - [`session`] - Unit of work over tracked streams (`Session`)
//! - [`repository`] - Composition root and inline projection commits (`Repository`)
//! - [`store`] - Event persistence abstraction (`EventStore`, `AtomicEventStore`)
//! - [`projection`] - Read-side primitives (`Projection`, `ApplyProjection`, `ProjectionRegistry`)
//! - [`processor`] - Background catch-up for async projections (`ProjectionProcessor`)
//! - [`event`] - Event envelopes and marker traits (`DomainEvent`, `Event`)
//! - [`concurrency`] - Optimistic concurrency (`ExpectedVersion`, `ConcurrencyConflict`)
//! - [`id`] - Typed identifiers (`StreamId`, `EventId`)
//!
//! # Example
//!
//! ```
//! use eventide_core::{repository::Repository, store::inmemory, wiring::Wiring};
//!
//! let repository = Repository::new(inmemory::Store::new(), Wiring::new());
//! let session = repository.open_session();
//! assert_eq!(session.tracked_streams().count(), 0);
//! ```
//!
//! Most users should depend on the [`eventide`](https://docs.rs/eventide) crate,
//! which re-exports these types with a flatter API surface.

pub mod concurrency;
pub mod event;
pub mod id;
pub mod processor;
pub mod projection;
pub mod repository;
pub mod session;
pub mod store;
pub mod wiring;
