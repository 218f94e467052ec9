//! Read-side primitives.
//!
//! Projections derive query models from persisted events. A projection type
//! wires the events it handles through [`ApplyProjection`]; each handler
//! locates the read-model key an event belongs to and folds the event into
//! that model. Registered projections run either inline with the session's
//! save or asynchronously in the [`ProjectionProcessor`].
//!
//! [`ProjectionProcessor`]: crate::processor::ProjectionProcessor
use std::{
    collections::{BTreeSet, HashMap},
    fmt::Debug,
    future::Future,
    hash::Hash,
    marker::PhantomData,
    sync::{Arc, PoisonError, RwLock},
};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::{event::DomainEvent, id::StreamId, store::StoredEvent};

pub mod inmemory;
mod registry;
pub(crate) mod runner;

pub use registry::{ProjectionInfo, ProjectionReader, ProjectionRegistry, RegistrationError};

/// Boxed error used where heterogeneous store backends meet.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Read model derived from events.
///
/// `Key` identifies one read-model instance: the stream id for single-stream
/// projections, an application-defined grouping key for multi-stream ones.
pub trait Projection: Default + Clone + Send + Sync + 'static {
    /// Stable name, used for checkpoints and schema tracking.
    const NAME: &'static str;

    type Key: Clone + Eq + Hash + Debug + Send + Sync + 'static;

    /// Register the events this projection handles.
    fn wire(wiring: &mut ProjectionWiring<Self>);
}

/// Where an event lands in a projection.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Locate<K> {
    /// Apply to the model with this key.
    Key(K),
    /// Apply to the model with this key and remember that the event's stream
    /// belongs to it.
    Bind(K),
    /// Apply to the model previously bound to the event's stream; skipped when
    /// the stream has no binding.
    Joined,
    /// Skip the event.
    Ignore,
}

/// Apply an event to a projection with access to envelope context.
///
/// ```ignore
/// impl ApplyProjection<FundsDeposited> for Balance {
///     fn locate(_: &FundsDeposited, stream_id: &StreamId) -> Locate<StreamId> {
///         Locate::Key(*stream_id)
///     }
///
///     fn apply_projection(&mut self, event: &FundsDeposited, _: &StoredEvent) {
///         self.total += event.amount;
///     }
/// }
/// ```
pub trait ApplyProjection<E>: Projection {
    fn locate(event: &E, stream_id: &StreamId) -> Locate<Self::Key>;

    fn apply_projection(&mut self, event: &E, envelope: &StoredEvent);
}

/// A decoded event routed to its key, with the fold still to run.
pub(crate) struct Routed<P: Projection> {
    pub locate: Locate<P::Key>,
    pub apply: Box<dyn FnOnce(&mut P, &StoredEvent) + Send>,
}

type Route<P> = fn(&StoredEvent) -> Result<Routed<P>, serde_json::Error>;

/// Registration surface handed to [`Projection::wire`].
pub struct ProjectionWiring<P: Projection> {
    routes: HashMap<&'static str, Route<P>>,
    _projection: PhantomData<fn() -> P>,
}

impl<P: Projection> ProjectionWiring<P> {
    pub(crate) fn build() -> Self {
        let mut wiring = Self {
            routes: HashMap::new(),
            _projection: PhantomData,
        };
        P::wire(&mut wiring);
        wiring
    }

    /// Handle events of type `E`.
    pub fn event<E>(&mut self) -> &mut Self
    where
        E: DomainEvent,
        P: ApplyProjection<E>,
    {
        self.routes.insert(E::KIND, route::<P, E>);
        self
    }

    pub(crate) fn route(&self, kind: &str) -> Option<Route<P>> {
        self.routes.get(kind).copied()
    }

    pub(crate) fn kinds(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.routes.keys().copied()
    }
}

fn route<P, E>(stored: &StoredEvent) -> Result<Routed<P>, serde_json::Error>
where
    P: ApplyProjection<E>,
    E: DomainEvent,
{
    let event = E::deserialize(&stored.data)?;
    let locate = P::locate(&event, &stored.stream_id);
    Ok(Routed {
        locate,
        apply: Box::new(move |projection: &mut P, envelope: &StoredEvent| {
            projection.apply_projection(&event, envelope);
        }),
    })
}

/// Hash identifying the set of event kinds a projection handles.
///
/// SHA-256 (lowercase hex) of the sorted kind names joined by `\n`. Changing
/// the handled set changes the hash and triggers a rebuild.
#[must_use]
pub fn schema_hash<'a>(kinds: impl IntoIterator<Item = &'a str>) -> String {
    let sorted: BTreeSet<&str> = kinds.into_iter().collect();
    let joined = sorted.into_iter().collect::<Vec<_>>().join("\n");
    let digest = Sha256::digest(joined.as_bytes());
    digest.iter().map(|byte| format!("{byte:02x}")).collect()
}

/// When a projection runs.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Lifecycle {
    /// Inside `save_changes`, failure-atomic with the append.
    Inline,
    /// In the background processor, after the append.
    Async,
}

/// Freshness of an async projection's read models.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProjectionState {
    /// Checkpoint equals the store head.
    Fresh,
    /// Checkpoint trails the store head.
    Behind,
    /// Handled events changed; read models were cleared and await a rebuild.
    Stale,
    /// Replaying history after a schema change.
    Rebuilding,
}

impl ProjectionState {
    #[must_use]
    pub const fn is_stale(self) -> bool {
        matches!(self, Self::Stale | Self::Rebuilding)
    }
}

/// Snapshot of a projection's progress.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ProjectionStatus {
    pub state: ProjectionState,
    /// Last processed global sequence, `None` if never run.
    pub checkpoint: Option<u64>,
    /// Store head captured when a rebuild was scheduled.
    pub rebuild_target: Option<u64>,
}

/// Shared status cell updated by the processor and read by readers.
#[derive(Clone, Debug)]
pub(crate) struct StatusCell(Arc<RwLock<ProjectionStatus>>);

impl StatusCell {
    pub(crate) fn new(state: ProjectionState) -> Self {
        Self(Arc::new(RwLock::new(ProjectionStatus {
            state,
            checkpoint: None,
            rebuild_target: None,
        })))
    }

    pub(crate) fn get(&self) -> ProjectionStatus {
        *self.0.read().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn update(&self, f: impl FnOnce(&mut ProjectionStatus)) {
        let mut status = self.0.write().unwrap_or_else(PoisonError::into_inner);
        f(&mut status);
    }

    /// Schedule a rebuild up to `target`.
    pub(crate) fn mark_stale(&self, target: Option<u64>) {
        self.update(|status| {
            status.checkpoint = None;
            status.rebuild_target = target;
            status.state = if target.is_some() {
                ProjectionState::Stale
            } else {
                ProjectionState::Fresh
            };
        });
    }

    /// Continue a rebuild scheduled before a restart.
    pub(crate) fn resume_rebuild(&self, checkpoint: Option<u64>, target: u64) {
        self.update(|status| {
            status.checkpoint = checkpoint;
            status.rebuild_target = Some(target);
            status.state = ProjectionState::Rebuilding;
        });
    }

    /// Record progress and derive the next state.
    pub(crate) fn advance(&self, checkpoint: Option<u64>, head: Option<u64>) {
        self.update(|status| {
            status.checkpoint = checkpoint;
            let caught_up = checkpoint >= head;
            status.state = match status.state {
                ProjectionState::Stale | ProjectionState::Rebuilding => {
                    if checkpoint >= status.rebuild_target {
                        status.rebuild_target = None;
                        if caught_up {
                            ProjectionState::Fresh
                        } else {
                            ProjectionState::Behind
                        }
                    } else {
                        ProjectionState::Rebuilding
                    }
                }
                ProjectionState::Fresh | ProjectionState::Behind => {
                    if caught_up {
                        ProjectionState::Fresh
                    } else {
                        ProjectionState::Behind
                    }
                }
            };
        });
    }
}

/// Result of a projection read.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Read<V> {
    pub value: Option<V>,
    /// True while the projection is being rebuilt after a schema change.
    pub is_stale: bool,
}

/// Key-value persistence for read models.
pub trait ReadModelStore<K, V>: Send + Sync + 'static {
    type Error: std::error::Error + Send + Sync + 'static;

    /// # Errors
    ///
    /// Returns a backend error when the read fails.
    fn load<'a>(
        &'a self,
        key: &'a K,
    ) -> impl Future<Output = Result<Option<V>, Self::Error>> + Send + 'a;

    /// # Errors
    ///
    /// Returns a backend error when the write fails.
    fn save(&self, key: K, value: V) -> impl Future<Output = Result<(), Self::Error>> + Send + '_;

    /// Remove a key; removing an absent key succeeds.
    ///
    /// # Errors
    ///
    /// Returns a backend error when the write fails.
    fn delete<'a>(&'a self, key: &'a K)
    -> impl Future<Output = Result<(), Self::Error>> + Send + 'a;

    /// Remove every key.
    ///
    /// # Errors
    ///
    /// Returns a backend error when the write fails.
    fn clear(&self) -> impl Future<Output = Result<(), Self::Error>> + Send + '_;
}

/// Persistence for projection checkpoints and schema hashes.
pub trait ProjectionPositionStore: Send + Sync + 'static {
    type Error: std::error::Error + Send + Sync + 'static;

    /// Last processed global sequence, `None` if the projection never ran.
    ///
    /// # Errors
    ///
    /// Returns a backend error when the read fails.
    fn load_position<'a>(
        &'a self,
        projection: &'a str,
    ) -> impl Future<Output = Result<Option<u64>, Self::Error>> + Send + 'a;

    /// # Errors
    ///
    /// Returns a backend error when the write fails.
    fn save_position<'a>(
        &'a self,
        projection: &'a str,
        position: u64,
    ) -> impl Future<Output = Result<(), Self::Error>> + Send + 'a;

    /// Forget the checkpoint so the projection replays from the start.
    ///
    /// # Errors
    ///
    /// Returns a backend error when the write fails.
    fn reset_position<'a>(
        &'a self,
        projection: &'a str,
    ) -> impl Future<Output = Result<(), Self::Error>> + Send + 'a;

    /// # Errors
    ///
    /// Returns a backend error when the read fails.
    fn load_schema_hash<'a>(
        &'a self,
        projection: &'a str,
    ) -> impl Future<Output = Result<Option<String>, Self::Error>> + Send + 'a;

    /// # Errors
    ///
    /// Returns a backend error when the write fails.
    fn save_schema_hash<'a>(
        &'a self,
        projection: &'a str,
        hash: &'a str,
    ) -> impl Future<Output = Result<(), Self::Error>> + Send + 'a;

    /// Store head captured when a schema change scheduled a rebuild, `None`
    /// when no rebuild is pending.
    ///
    /// # Errors
    ///
    /// Returns a backend error when the read fails.
    fn load_rebuild_target<'a>(
        &'a self,
        projection: &'a str,
    ) -> impl Future<Output = Result<Option<u64>, Self::Error>> + Send + 'a;

    /// Record a pending rebuild target, or clear it with `None`.
    ///
    /// # Errors
    ///
    /// Returns a backend error when the write fails.
    fn save_rebuild_target<'a>(
        &'a self,
        projection: &'a str,
        target: Option<u64>,
    ) -> impl Future<Output = Result<(), Self::Error>> + Send + 'a;
}

/// Errors raised while folding or persisting projections.
#[derive(Debug, Error)]
pub enum ProjectionError {
    #[error("projection `{projection}` failed to decode event `{kind}`: {source}")]
    Decode {
        projection: &'static str,
        kind: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("projection `{projection}` read-model store failed: {source}")]
    ReadModel {
        projection: &'static str,
        #[source]
        source: BoxError,
    },
    #[error("projection `{projection}` position store failed: {source}")]
    Position {
        projection: &'static str,
        #[source]
        source: BoxError,
    },
}

impl ProjectionError {
    pub(crate) fn read_model(
        projection: &'static str,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::ReadModel {
            projection,
            source: Box::new(source),
        }
    }

    pub(crate) fn position(
        projection: &'static str,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Position {
            projection,
            source: Box::new(source),
        }
    }

    /// Name of the projection that failed.
    #[must_use]
    pub const fn projection(&self) -> &'static str {
        match self {
            Self::Decode { projection, .. }
            | Self::ReadModel { projection, .. }
            | Self::Position { projection, .. } => *projection,
        }
    }
}
