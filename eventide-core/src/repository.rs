//! Composition root.
//!
//! `Repository` owns the event store, the merged aggregate [`Wiring`] and the
//! [`ProjectionRegistry`]. It opens [`Session`]s on demand and builds the
//! background [`ProjectionProcessor`] for async projections.
//!
//! Inline projections are updated inside `save_changes` as one failure-atomic
//! unit with the append: their read models are staged in memory, written with
//! their prior values remembered, and restored if the append is rejected. A
//! repository-wide gate serializes these saves so that one session's restore
//! never overwrites another session's committed read models.
//!
//! The read models are written before the append commits, so a reader
//! running concurrently with `save_changes` can briefly observe values that
//! a rejected append then rolls back. Readers that must only see committed
//! state should use an async projection.

use tokio::sync::Mutex;

use crate::{
    processor::{ProcessorConfig, ProjectionProcessor},
    projection::{ProjectionPositionStore, ProjectionRegistry, runner::StagedChanges},
    session::{Session, SessionError},
    store::{AppendResult, AtomicEventStore, StoredEvent, StreamBatch},
    wiring::Wiring,
};

/// Entry point for reading and writing event-sourced aggregates.
///
/// ```
/// use eventide_core::{repository::Repository, store::inmemory, wiring::Wiring};
///
/// let repository = Repository::new(inmemory::Store::new(), Wiring::new());
/// let session = repository.open_session();
/// assert!(!session.has_pending_changes());
/// ```
pub struct Repository<S> {
    store: S,
    wiring: Wiring,
    projections: ProjectionRegistry,
    inline_gate: Mutex<()>,
}

impl<S> std::fmt::Debug for Repository<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Repository")
            .field("wiring", &self.wiring)
            .field("projections", &self.projections)
            .finish_non_exhaustive()
    }
}

impl<S> Repository<S>
where
    S: AtomicEventStore,
{
    #[must_use]
    pub fn new(store: S, wiring: Wiring) -> Self {
        Self {
            store,
            wiring,
            projections: ProjectionRegistry::new(),
            inline_gate: Mutex::new(()),
        }
    }

    #[must_use]
    pub fn with_projections(mut self, projections: ProjectionRegistry) -> Self {
        self.projections = projections;
        self
    }

    /// Start a new unit of work.
    #[must_use]
    pub fn open_session(&self) -> Session<'_, S> {
        Session::new(self)
    }

    pub const fn store(&self) -> &S {
        &self.store
    }

    pub const fn wiring(&self) -> &Wiring {
        &self.wiring
    }

    pub const fn projections(&self) -> &ProjectionRegistry {
        &self.projections
    }

    /// Build the background processor for this repository's async
    /// projections.
    pub fn projection_processor<C>(
        &self,
        positions: C,
        config: ProcessorConfig,
    ) -> ProjectionProcessor<S, C>
    where
        S: Clone + 'static,
        C: ProjectionPositionStore,
    {
        ProjectionProcessor::new(
            self.store.clone(),
            positions,
            self.projections.asynchronous_runners(),
            config,
        )
    }

    /// Append `batches`, updating interested inline projections as part of
    /// the same unit. `views` are the pre-commit envelopes of the batches.
    pub(crate) async fn commit(
        &self,
        batches: Vec<StreamBatch>,
        views: &[StoredEvent],
    ) -> Result<AppendResult, SessionError<S::Error>> {
        let runners = self.projections.inline_for(views);
        if runners.is_empty() {
            return self
                .store
                .append_events_to_streams(batches)
                .await
                .map_err(SessionError::from);
        }

        let _gate = self.inline_gate.lock().await;

        let mut staged = Vec::with_capacity(runners.len());
        for runner in &runners {
            let changes = runner
                .stage(views)
                .await
                .map_err(SessionError::Projection)?;
            if !changes.is_empty() {
                staged.push(changes);
            }
        }

        let mut committed = 0;
        while committed < staged.len() {
            if let Err(error) = staged[committed].commit().await {
                tracing::warn!(projection = error.projection(), %error, "inline projection write failed");
                rollback(&mut staged[..committed]).await;
                return Err(SessionError::Projection(error));
            }
            committed += 1;
        }

        match self.store.append_events_to_streams(batches).await {
            Ok(result) => {
                tracing::debug!(projections = staged.len(), "inline projections committed");
                Ok(result)
            }
            Err(error) => {
                tracing::debug!(%error, "append rejected, rolling back inline projections");
                rollback(&mut staged).await;
                Err(error.into())
            }
        }
    }
}

async fn rollback(staged: &mut [Box<dyn StagedChanges + '_>]) {
    for changes in staged.iter_mut().rev() {
        if let Err(error) = changes.rollback().await {
            tracing::error!(projection = error.projection(), %error, "inline projection rollback failed");
        }
    }
}
