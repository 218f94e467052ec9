//! Background driver for async projections.
//!
//! The processor polls the store's global log from each projection's
//! checkpoint, folds the batch, writes the read models and only then advances
//! the checkpoint. Delivery is at-least-once: a crash between the read-model
//! write and the checkpoint write replays the batch, so folds must be
//! idempotent.
//!
//! # Example
//!
//! ```ignore
//! let processor = repository.projection_processor(InMemoryPositions::new(), ProcessorConfig::default());
//! let handle = processor.start().await?;
//!
//! // Later, shut down gracefully
//! handle.stop().await?;
//! ```

use std::{sync::Arc, time::Duration};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::task::JoinHandle;

use crate::{
    projection::{
        ProjectionError, ProjectionPositionStore, ProjectionStatus, runner::ProjectionRunner,
    },
    store::EventStore,
};

/// Tuning knobs for [`ProjectionProcessor`].
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProcessorConfig {
    /// Maximum number of events folded per projection per batch.
    pub batch_size: usize,
    /// Sleep between polls once every projection has caught up.
    pub poll_interval: Duration,
    /// Sleep before retrying a failed batch.
    pub error_backoff: Duration,
}

impl Default for ProcessorConfig {
    fn default() -> Self {
        Self {
            batch_size: 256,
            poll_interval: Duration::from_millis(100),
            error_backoff: Duration::from_secs(1),
        }
    }
}

impl ProcessorConfig {
    /// Set the batch size (at least 1).
    #[must_use]
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    #[must_use]
    pub const fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    #[must_use]
    pub const fn with_error_backoff(mut self, error_backoff: Duration) -> Self {
        self.error_backoff = error_backoff;
        self
    }
}

/// Errors raised while processing async projections.
#[derive(Debug, Error)]
pub enum ProcessorError<StoreError>
where
    StoreError: std::error::Error + 'static,
{
    #[error("store error: {0}")]
    Store(#[source] StoreError),
    #[error(transparent)]
    Projection(#[from] ProjectionError),
    #[error("store returned an event without a global sequence to projection `{projection}`")]
    MissingGlobalSequence { projection: &'static str },
}

/// The processor task panicked.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
#[error("projection processor task panicked")]
pub struct ProcessorPanicked;

/// Handle to a running processor.
///
/// Dropping the handle stops the processor after its current batch. Call
/// [`stop()`] to wait for it.
///
/// [`stop()`]: ProcessorHandle::stop
#[derive(Debug)]
pub struct ProcessorHandle {
    stop_tx: Option<tokio::sync::oneshot::Sender<()>>,
    task: JoinHandle<()>,
}

impl ProcessorHandle {
    /// Signal the processor and wait for the in-flight batch to finish.
    ///
    /// # Errors
    ///
    /// Returns [`ProcessorPanicked`] if the task panicked.
    pub async fn stop(mut self) -> Result<(), ProcessorPanicked> {
        if let Some(tx) = self.stop_tx.take() {
            let _ = tx.send(());
        }
        self.task.await.map_err(|_| ProcessorPanicked)
    }

    #[must_use]
    pub fn is_running(&self) -> bool {
        !self.task.is_finished()
    }
}

/// Drives every async projection of a repository.
///
/// Created by [`Repository::projection_processor`]. Use [`run_once`] to step
/// it deterministically, or [`start`] to run it as a background task.
///
/// [`Repository::projection_processor`]: crate::repository::Repository::projection_processor
/// [`run_once`]: ProjectionProcessor::run_once
/// [`start`]: ProjectionProcessor::start
pub struct ProjectionProcessor<S, C> {
    store: S,
    positions: C,
    runners: Vec<Arc<dyn ProjectionRunner>>,
    config: ProcessorConfig,
}

impl<S, C> ProjectionProcessor<S, C>
where
    S: EventStore + 'static,
    C: ProjectionPositionStore,
{
    pub(crate) fn new(
        store: S,
        positions: C,
        runners: Vec<Arc<dyn ProjectionRunner>>,
        config: ProcessorConfig,
    ) -> Self {
        Self {
            store,
            positions,
            runners,
            config,
        }
    }

    pub const fn config(&self) -> &ProcessorConfig {
        &self.config
    }

    pub const fn positions(&self) -> &C {
        &self.positions
    }

    /// Status of every async projection, in registration order.
    #[must_use]
    pub fn statuses(&self) -> Vec<(&'static str, ProjectionStatus)> {
        self.runners
            .iter()
            .map(|runner| (runner.name(), runner.status().get()))
            .collect()
    }

    /// Compare each projection's schema hash with the stored one.
    ///
    /// A changed hash clears the projection's read models and joins, resets
    /// its checkpoint, stores the new hash and marks it stale until it has
    /// replayed up to the current store head. The rebuild target is stored
    /// with the checkpoint, so a processor prepared after a restart keeps the
    /// projection stale until the interrupted rebuild completes. A
    /// projection without a stored hash just records it.
    ///
    /// # Errors
    ///
    /// Returns the first store, read-model or position-store failure.
    #[tracing::instrument(skip(self))]
    pub async fn prepare(&self) -> Result<(), ProcessorError<S::Error>> {
        let head = self
            .store
            .max_global_sequence()
            .await
            .map_err(ProcessorError::Store)?;

        for runner in &self.runners {
            let name = runner.name();
            let current = runner.schema_hash();
            let stored = self
                .positions
                .load_schema_hash(name)
                .await
                .map_err(|e| ProjectionError::position(name, e))?;

            match stored {
                Some(previous) if previous != current => {
                    tracing::info!(
                        projection = name,
                        %previous,
                        current,
                        rebuild_target = ?head,
                        "projection schema changed, rebuilding"
                    );
                    runner.reset().await?;
                    self.positions
                        .reset_position(name)
                        .await
                        .map_err(|e| ProjectionError::position(name, e))?;
                    self.positions
                        .save_rebuild_target(name, head)
                        .await
                        .map_err(|e| ProjectionError::position(name, e))?;
                    self.positions
                        .save_schema_hash(name, current)
                        .await
                        .map_err(|e| ProjectionError::position(name, e))?;
                    runner.status().mark_stale(head);
                }
                stored => {
                    if stored.is_none() {
                        self.positions
                            .save_schema_hash(name, current)
                            .await
                            .map_err(|e| ProjectionError::position(name, e))?;
                    }
                    self.resume(runner.as_ref(), head).await?;
                }
            }
        }
        Ok(())
    }

    /// Restore a projection's state from its stored checkpoint and pending
    /// rebuild target.
    async fn resume(
        &self,
        runner: &dyn ProjectionRunner,
        head: Option<u64>,
    ) -> Result<(), ProjectionError> {
        let name = runner.name();
        let checkpoint = self
            .positions
            .load_position(name)
            .await
            .map_err(|e| ProjectionError::position(name, e))?;
        let target = self
            .positions
            .load_rebuild_target(name)
            .await
            .map_err(|e| ProjectionError::position(name, e))?;

        if let Some(target) = target
            && checkpoint < Some(target)
        {
            tracing::info!(
                projection = name,
                ?checkpoint,
                rebuild_target = target,
                "resuming interrupted rebuild"
            );
            runner.status().resume_rebuild(checkpoint, target);
            return Ok(());
        }
        if target.is_some() {
            self.positions
                .save_rebuild_target(name, None)
                .await
                .map_err(|e| ProjectionError::position(name, e))?;
        }

        let previous = runner.status().get();
        if checkpoint.is_some() && previous.checkpoint.is_none() && runner.volatile_joins() {
            tracing::warn!(
                projection = name,
                ?checkpoint,
                "resuming from a stored checkpoint with empty in-memory joins; \
                 joined events on streams bound earlier will be skipped"
            );
        }
        runner.status().advance(checkpoint, head);
        Ok(())
    }

    /// Process at most one batch per async projection.
    ///
    /// Returns the number of events read across all projections; `0` means
    /// every projection is caught up.
    ///
    /// # Errors
    ///
    /// A failing projection does not hold back the others: every projection
    /// gets its batch, and the first failure is returned afterwards. The
    /// failing projection's checkpoint is left untouched so its batch is
    /// retried.
    pub async fn run_once(&self) -> Result<usize, ProcessorError<S::Error>> {
        let head = self
            .store
            .max_global_sequence()
            .await
            .map_err(ProcessorError::Store)?;

        let mut processed = 0;
        let mut first_error = None;
        for runner in &self.runners {
            match self.step(runner.as_ref(), head).await {
                Ok(count) => processed += count,
                Err(error) => {
                    tracing::warn!(projection = runner.name(), %error, "projection batch failed");
                    if first_error.is_none() {
                        first_error = Some(error);
                    }
                }
            }
        }
        first_error.map_or(Ok(processed), Err)
    }

    async fn step(
        &self,
        runner: &dyn ProjectionRunner,
        head: Option<u64>,
    ) -> Result<usize, ProcessorError<S::Error>> {
        let name = runner.name();
        let checkpoint = self
            .positions
            .load_position(name)
            .await
            .map_err(|e| ProjectionError::position(name, e))?;
        let events = self
            .store
            .load_events_from_position(checkpoint, self.config.batch_size.max(1))
            .await
            .map_err(ProcessorError::Store)?;

        let Some(last) = events.last() else {
            self.settle(runner, checkpoint, head).await?;
            return Ok(0);
        };
        let last = last
            .global_sequence
            .ok_or(ProcessorError::MissingGlobalSequence { projection: name })?;

        let mut staged = runner.stage(&events).await?;
        staged.commit().await?;
        drop(staged);

        self.positions
            .save_position(name, last)
            .await
            .map_err(|e| ProjectionError::position(name, e))?;
        self.settle(runner, Some(last), head.max(Some(last))).await?;

        tracing::trace!(
            projection = name,
            events = events.len(),
            checkpoint = last,
            "processed projection batch"
        );
        Ok(events.len())
    }

    /// Advance the status and forget the stored rebuild target once the
    /// rebuild has reached it.
    async fn settle(
        &self,
        runner: &dyn ProjectionRunner,
        checkpoint: Option<u64>,
        head: Option<u64>,
    ) -> Result<(), ProjectionError> {
        let rebuilding = runner.status().get().rebuild_target.is_some();
        runner.status().advance(checkpoint, head);
        if rebuilding && runner.status().get().rebuild_target.is_none() {
            let name = runner.name();
            self.positions
                .save_rebuild_target(name, None)
                .await
                .map_err(|e| ProjectionError::position(name, e))?;
            tracing::info!(projection = name, ?checkpoint, "projection rebuild complete");
        }
        Ok(())
    }

    /// Run [`prepare`] and spawn the polling loop.
    ///
    /// Batch failures are logged and retried after
    /// [`ProcessorConfig::error_backoff`]; they never reach the write path.
    ///
    /// # Errors
    ///
    /// Returns an error if [`prepare`] fails.
    ///
    /// [`prepare`]: ProjectionProcessor::prepare
    pub async fn start(self) -> Result<ProcessorHandle, ProcessorError<S::Error>> {
        self.prepare().await?;

        let (stop_tx, mut stop_rx) = tokio::sync::oneshot::channel();
        let task = tokio::spawn(async move {
            let processor = self;
            loop {
                let delay = match processor.run_once().await {
                    Ok(0) => processor.config.poll_interval,
                    Ok(_) => Duration::ZERO,
                    Err(_) => {
                        tracing::debug!(
                            backoff = ?processor.config.error_backoff,
                            "retrying failed projections after backoff"
                        );
                        processor.config.error_backoff
                    }
                };

                tokio::select! {
                    biased;
                    _ = &mut stop_rx => {
                        tracing::debug!("projection processor stopped");
                        break;
                    }
                    () = tokio::time::sleep(delay) => {}
                }
            }
        });

        Ok(ProcessorHandle {
            stop_tx: Some(stop_tx),
            task,
        })
    }
}

#[cfg(test)]
mod tests {
    use std::{error::Error, io};

    use chrono::Utc;
    use nonempty::NonEmpty;
    use serde::{Deserialize, Serialize};

    use super::*;
    use crate::{
        concurrency::ExpectedVersion,
        event::{DomainEvent, Metadata},
        id::{EventId, StreamId},
        projection::{
            ApplyProjection, Locate, Projection, ProjectionRegistry, ProjectionState,
            ProjectionWiring, ReadModelStore,
            inmemory::{InMemoryPositions, InMemoryReadModels},
            schema_hash,
        },
        store::{NewEvent, StoredEvent, inmemory},
    };

    #[derive(Serialize, Deserialize)]
    struct Pinged;

    impl DomainEvent for Pinged {
        const KIND: &'static str = "pinged";
    }

    #[derive(Clone, Debug, Default, PartialEq)]
    struct Pings(Vec<u64>);

    impl Projection for Pings {
        const NAME: &'static str = "pings";
        type Key = ();

        fn wire(wiring: &mut ProjectionWiring<Self>) {
            wiring.event::<Pinged>();
        }
    }

    impl ApplyProjection<Pinged> for Pings {
        fn locate(_: &Pinged, _: &StreamId) -> Locate<()> {
            Locate::Key(())
        }

        fn apply_projection(&mut self, _: &Pinged, envelope: &StoredEvent) {
            if let Some(sequence) = envelope.global_sequence {
                self.0.push(sequence);
            }
        }
    }

    fn new_event(kind: &str) -> NewEvent {
        NewEvent {
            event_id: EventId::new(),
            kind: kind.to_string(),
            data: serde_json::Value::Null,
            occurred_at: Utc::now(),
            metadata: Metadata::new(),
        }
    }

    async fn append(store: &inmemory::Store, kinds: &[&str]) {
        for kind in kinds {
            store
                .append_events(&StreamId::new(), ExpectedVersion::NoStream, NonEmpty::new(new_event(kind)))
                .await
                .unwrap();
        }
    }

    fn processor(
        store: &inmemory::Store,
        positions: &InMemoryPositions,
        batch_size: usize,
    ) -> (
        ProjectionProcessor<inmemory::Store, InMemoryPositions>,
        InMemoryReadModels<(), Pings>,
    ) {
        let models = InMemoryReadModels::new();
        let mut registry = ProjectionRegistry::new();
        registry.asynchronous::<Pings, _>(models.clone()).unwrap();
        let processor = ProjectionProcessor::new(
            store.clone(),
            positions.clone(),
            registry.asynchronous_runners(),
            ProcessorConfig::default().with_batch_size(batch_size),
        );
        (processor, models)
    }

    #[tokio::test]
    async fn checkpoint_advances_over_unhandled_events() {
        let store = inmemory::Store::new();
        let positions = InMemoryPositions::new();
        append(&store, &["pinged", "ignored", "pinged", "ignored"]).await;
        let (processor, models) = processor(&store, &positions, 3);

        assert_eq!(processor.run_once().await.unwrap(), 3);
        assert_eq!(positions.load_position("pings").await.unwrap(), Some(2));
        assert_eq!(processor.statuses()[0].1.state, ProjectionState::Behind);

        assert_eq!(processor.run_once().await.unwrap(), 1);
        assert_eq!(positions.load_position("pings").await.unwrap(), Some(3));
        assert_eq!(processor.run_once().await.unwrap(), 0);
        assert_eq!(processor.statuses()[0].1.state, ProjectionState::Fresh);

        assert_eq!(models.load(&()).await.unwrap(), Some(Pings(vec![0, 2])));
    }

    #[tokio::test]
    async fn first_prepare_records_hash_without_rebuilding() {
        let store = inmemory::Store::new();
        let positions = InMemoryPositions::new();
        append(&store, &["pinged"]).await;
        let (processor, models) = processor(&store, &positions, 10);
        models.save((), Pings(vec![42])).await.unwrap();

        processor.prepare().await.unwrap();
        assert_eq!(
            positions.load_schema_hash("pings").await.unwrap(),
            Some(schema_hash(["pinged"]))
        );
        assert_eq!(models.load(&()).await.unwrap(), Some(Pings(vec![42])));
        assert_eq!(processor.statuses()[0].1.state, ProjectionState::Behind);
    }

    #[tokio::test]
    async fn schema_change_clears_and_replays() {
        let store = inmemory::Store::new();
        let positions = InMemoryPositions::new();
        append(&store, &["pinged", "pinged", "pinged"]).await;
        positions.save_schema_hash("pings", "outdated").await.unwrap();
        positions.save_position("pings", 2).await.unwrap();

        let (processor, models) = processor(&store, &positions, 2);
        models.save((), Pings(vec![7, 7, 7])).await.unwrap();

        processor.prepare().await.unwrap();
        let status = processor.statuses()[0].1;
        assert_eq!(status.state, ProjectionState::Stale);
        assert_eq!(status.rebuild_target, Some(2));
        assert_eq!(models.load(&()).await.unwrap(), None);
        assert_eq!(positions.load_position("pings").await.unwrap(), None);

        processor.run_once().await.unwrap();
        assert_eq!(processor.statuses()[0].1.state, ProjectionState::Rebuilding);

        processor.run_once().await.unwrap();
        assert_eq!(processor.statuses()[0].1.state, ProjectionState::Fresh);
        assert_eq!(models.load(&()).await.unwrap(), Some(Pings(vec![0, 1, 2])));
    }

    #[tokio::test]
    async fn interrupted_rebuild_stays_stale_after_restart() {
        let store = inmemory::Store::new();
        let positions = InMemoryPositions::new();
        append(&store, &["pinged", "pinged", "pinged"]).await;
        positions.save_schema_hash("pings", "outdated").await.unwrap();

        let (first, _) = processor(&store, &positions, 1);
        first.prepare().await.unwrap();
        first.run_once().await.unwrap();
        assert_eq!(first.statuses()[0].1.state, ProjectionState::Rebuilding);
        assert_eq!(positions.load_rebuild_target("pings").await.unwrap(), Some(2));

        let (restarted, models) = processor(&store, &positions, 1);
        restarted.prepare().await.unwrap();
        let status = restarted.statuses()[0].1;
        assert_eq!(status.state, ProjectionState::Rebuilding);
        assert_eq!(status.checkpoint, Some(0));
        assert_eq!(status.rebuild_target, Some(2));

        restarted.run_once().await.unwrap();
        assert_eq!(restarted.statuses()[0].1.state, ProjectionState::Rebuilding);
        restarted.run_once().await.unwrap();
        assert_eq!(restarted.statuses()[0].1.state, ProjectionState::Fresh);
        assert_eq!(positions.load_rebuild_target("pings").await.unwrap(), None);
        assert_eq!(models.load(&()).await.unwrap(), Some(Pings(vec![1, 2])));

        // Once finished, a later restart resumes normally.
        let (again, _) = processor(&store, &positions, 1);
        again.prepare().await.unwrap();
        assert_eq!(again.statuses()[0].1.state, ProjectionState::Fresh);
    }

    #[tokio::test]
    async fn started_processor_catches_up_and_stops() {
        let store = inmemory::Store::new();
        let positions = InMemoryPositions::new();
        let (processor, models) = processor(&store, &positions, 10);
        let processor = ProjectionProcessor {
            config: processor
                .config
                .clone()
                .with_poll_interval(Duration::from_millis(5)),
            ..processor
        };

        let handle = processor.start().await.unwrap();
        append(&store, &["pinged", "pinged"]).await;

        let mut caught_up = false;
        for _ in 0..200 {
            if positions.load_position("pings").await.unwrap() == Some(1) {
                caught_up = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert!(caught_up, "processor did not catch up");
        assert!(handle.is_running());
        handle.stop().await.unwrap();
        assert_eq!(models.load(&()).await.unwrap(), Some(Pings(vec![0, 1])));
    }

    #[test]
    fn config_builders_clamp_batch_size() {
        let config = ProcessorConfig::default()
            .with_batch_size(0)
            .with_error_backoff(Duration::from_millis(10));
        assert_eq!(config.batch_size, 1);
        assert_eq!(config.error_backoff, Duration::from_millis(10));
    }

    #[test]
    fn config_deserializes_with_defaults() {
        let config: ProcessorConfig = serde_json::from_value(serde_json::json!({
            "batch_size": 32
        }))
        .unwrap();
        assert_eq!(config.batch_size, 32);
        assert_eq!(config.poll_interval, ProcessorConfig::default().poll_interval);
    }

    #[test]
    fn processor_error_store_displays() {
        let err: ProcessorError<io::Error> = ProcessorError::Store(io::Error::other("test"));
        assert!(err.to_string().contains("store error"));
        assert!(err.source().is_some());
    }
}
