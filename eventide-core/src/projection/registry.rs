use std::{fmt, marker::PhantomData, sync::Arc};

use thiserror::Error;

use super::{
    Lifecycle, Projection, ProjectionState, ProjectionStatus, Read, ReadModelStore, StatusCell,
    inmemory::InMemoryReadModels,
    runner::{ProjectionRunner, Runner},
};
use crate::{id::StreamId, store::StoredEvent};

/// Error returned when registering a projection.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RegistrationError {
    #[error("a projection named `{0}` is already registered")]
    DuplicateName(&'static str),
}

/// Description of a registered projection.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ProjectionInfo {
    pub name: &'static str,
    pub lifecycle: Lifecycle,
    /// Handled event kinds, sorted.
    pub kinds: Vec<&'static str>,
    pub schema_hash: String,
}

/// The set of projections a repository maintains.
///
/// ```ignore
/// let mut projections = ProjectionRegistry::new();
/// let balances = projections.inline::<Balance, _>(InMemoryReadModels::new())?;
/// let audit = projections.asynchronous::<AuditTrail, _>(InMemoryReadModels::new())?;
///
/// let repository = Repository::new(store, wiring).with_projections(projections);
/// ```
#[derive(Clone, Default)]
pub struct ProjectionRegistry {
    runners: Vec<Arc<dyn ProjectionRunner>>,
}

impl fmt::Debug for ProjectionRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list()
            .entries(self.runners.iter().map(|runner| runner.name()))
            .finish()
    }
}

impl ProjectionRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a projection updated inside `save_changes`.
    ///
    /// Stream-to-key joins are kept in memory.
    ///
    /// # Errors
    ///
    /// Returns [`RegistrationError::DuplicateName`] if `P::NAME` is taken.
    pub fn inline<P, RS>(&mut self, models: RS) -> Result<ProjectionReader<P, RS>, RegistrationError>
    where
        P: Projection,
        RS: ReadModelStore<P::Key, P>,
    {
        self.insert(Lifecycle::Inline, models, InMemoryReadModels::new(), true)
    }

    /// Register a projection updated by the background processor.
    ///
    /// Stream-to-key joins are kept in memory. Paired with a durable
    /// read-model store and checkpoint, a restarted processor resumes with
    /// no joins, so events located through [`Locate::Joined`] on streams
    /// bound before the checkpoint are skipped. Use [`Self::register`] with
    /// a durable join store for those projections.
    ///
    /// [`Locate::Joined`]: super::Locate::Joined
    ///
    /// # Errors
    ///
    /// Returns [`RegistrationError::DuplicateName`] if `P::NAME` is taken.
    pub fn asynchronous<P, RS>(
        &mut self,
        models: RS,
    ) -> Result<ProjectionReader<P, RS>, RegistrationError>
    where
        P: Projection,
        RS: ReadModelStore<P::Key, P>,
    {
        self.insert(Lifecycle::Async, models, InMemoryReadModels::new(), true)
    }

    /// Register a projection with an explicit join store.
    ///
    /// # Errors
    ///
    /// Returns [`RegistrationError::DuplicateName`] if `P::NAME` is taken.
    pub fn register<P, RS, JS>(
        &mut self,
        lifecycle: Lifecycle,
        models: RS,
        joins: JS,
    ) -> Result<ProjectionReader<P, RS>, RegistrationError>
    where
        P: Projection,
        RS: ReadModelStore<P::Key, P>,
        JS: ReadModelStore<StreamId, P::Key>,
    {
        self.insert(lifecycle, models, joins, false)
    }

    fn insert<P, RS, JS>(
        &mut self,
        lifecycle: Lifecycle,
        models: RS,
        joins: JS,
        volatile_joins: bool,
    ) -> Result<ProjectionReader<P, RS>, RegistrationError>
    where
        P: Projection,
        RS: ReadModelStore<P::Key, P>,
        JS: ReadModelStore<StreamId, P::Key>,
    {
        if self.runners.iter().any(|runner| runner.name() == P::NAME) {
            return Err(RegistrationError::DuplicateName(P::NAME));
        }

        let models = Arc::new(models);
        let status = StatusCell::new(match lifecycle {
            Lifecycle::Inline => ProjectionState::Fresh,
            Lifecycle::Async => ProjectionState::Behind,
        });
        let runner = Runner::<P, RS, JS>::new(
            lifecycle,
            Arc::clone(&models),
            joins,
            volatile_joins,
            status.clone(),
        );
        tracing::debug!(
            projection = P::NAME,
            ?lifecycle,
            schema_hash = runner.schema_hash(),
            "registered projection"
        );
        self.runners.push(Arc::new(runner));

        Ok(ProjectionReader {
            models,
            status,
            _projection: PhantomData,
        })
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.runners.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.runners.is_empty()
    }

    /// Registered projections, in registration order.
    #[must_use]
    pub fn projections(&self) -> Vec<ProjectionInfo> {
        self.runners.iter().map(|runner| describe(runner.as_ref())).collect()
    }

    /// Every projection interested in events of `kind`.
    #[must_use]
    pub fn interested_in(&self, kind: &str) -> Vec<ProjectionInfo> {
        self.runners
            .iter()
            .filter(|runner| runner.handles(kind))
            .map(|runner| describe(runner.as_ref()))
            .collect()
    }

    /// Inline projections handling at least one of `events`.
    pub(crate) fn inline_for(&self, events: &[StoredEvent]) -> Vec<Arc<dyn ProjectionRunner>> {
        self.runners
            .iter()
            .filter(|runner| runner.lifecycle() == Lifecycle::Inline)
            .filter(|runner| events.iter().any(|event| runner.handles(&event.kind)))
            .cloned()
            .collect()
    }

    pub(crate) fn asynchronous_runners(&self) -> Vec<Arc<dyn ProjectionRunner>> {
        self.runners
            .iter()
            .filter(|runner| runner.lifecycle() == Lifecycle::Async)
            .cloned()
            .collect()
    }
}

fn describe(runner: &dyn ProjectionRunner) -> ProjectionInfo {
    ProjectionInfo {
        name: runner.name(),
        lifecycle: runner.lifecycle(),
        kinds: runner.kinds(),
        schema_hash: runner.schema_hash().to_string(),
    }
}

/// Typed query handle returned by registration.
pub struct ProjectionReader<P, RS> {
    models: Arc<RS>,
    status: StatusCell,
    _projection: PhantomData<fn() -> P>,
}

impl<P: Projection, RS> fmt::Debug for ProjectionReader<P, RS> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProjectionReader")
            .field("name", &P::NAME)
            .field("status", &self.status.get())
            .finish_non_exhaustive()
    }
}

impl<P, RS> Clone for ProjectionReader<P, RS> {
    fn clone(&self) -> Self {
        Self {
            models: Arc::clone(&self.models),
            status: self.status.clone(),
            _projection: PhantomData,
        }
    }
}

impl<P, RS> ProjectionReader<P, RS>
where
    P: Projection,
    RS: ReadModelStore<P::Key, P>,
{
    /// Load the read model for `key`.
    ///
    /// While a rebuild is in progress the current (partial) contents are
    /// returned with `is_stale` set.
    ///
    /// # Errors
    ///
    /// Returns the read-model store's error.
    pub async fn load(&self, key: &P::Key) -> Result<Read<P>, RS::Error> {
        let is_stale = self.status.get().state.is_stale();
        let value = self.models.load(key).await?;
        Ok(Read { value, is_stale })
    }

    #[must_use]
    pub fn status(&self) -> ProjectionStatus {
        self.status.get()
    }

    #[must_use]
    pub const fn name(&self) -> &'static str {
        P::NAME
    }

    /// The backing read-model store.
    #[must_use]
    pub fn store(&self) -> &RS {
        &self.models
    }
}
