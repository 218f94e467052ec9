//! File-backed persistence for eventide.
//!
//! - [`Store`] - an [`eventide_core::store::AtomicEventStore`] over an
//!   append-only JSON-lines log with a staging file for crash recovery
//! - [`CheckpointStore`] - an
//!   [`eventide_core::projection::ProjectionPositionStore`] kept in one JSON
//!   file
//!
//! ```no_run
//! use eventide_file::{CheckpointStore, Store};
//!
//! # fn main() -> Result<(), eventide_file::Error> {
//! let store = Store::open("data/events")?;
//! let checkpoints = CheckpointStore::open("data/checkpoints.json")?;
//! # Ok(())
//! # }
//! ```

mod checkpoint;
mod error;
mod store;

pub use checkpoint::CheckpointStore;
pub use error::Error;
pub use store::Store;
