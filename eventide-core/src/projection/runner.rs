//! Type-erased projection execution.
//!
//! The registry holds projections of different types behind
//! [`ProjectionRunner`]. Folding a batch never writes: it produces
//! [`StagedChanges`] that remember the prior value of every touched key, so a
//! commit can be undone if the surrounding append fails.

use std::{future::Future, pin::Pin, sync::Arc};

use indexmap::{IndexMap, map::Entry};

use super::{
    Lifecycle, Locate, Projection, ProjectionError, ProjectionWiring, ReadModelStore, StatusCell,
    schema_hash,
};
use crate::{id::StreamId, store::StoredEvent};

pub(crate) type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

pub(crate) trait ProjectionRunner: Send + Sync {
    fn name(&self) -> &'static str;
    fn lifecycle(&self) -> Lifecycle;
    fn handles(&self, kind: &str) -> bool;
    fn kinds(&self) -> Vec<&'static str>;
    fn schema_hash(&self) -> &str;
    fn status(&self) -> &StatusCell;
    /// Joins live only as long as the process.
    fn volatile_joins(&self) -> bool;

    /// Fold `events` against the persisted read models without writing.
    fn stage<'a>(
        &'a self,
        events: &'a [StoredEvent],
    ) -> BoxFuture<'a, Result<Box<dyn StagedChanges + 'a>, ProjectionError>>;

    /// Drop every read model and join entry.
    fn reset(&self) -> BoxFuture<'_, Result<(), ProjectionError>>;
}

pub(crate) trait StagedChanges: Send {
    fn is_empty(&self) -> bool;

    /// Write every staged value. A failed commit restores what it had
    /// already written before returning the error.
    fn commit(&mut self) -> BoxFuture<'_, Result<(), ProjectionError>>;

    /// Restore the prior value of every key written by `commit`.
    fn rollback(&mut self) -> BoxFuture<'_, Result<(), ProjectionError>>;
}

pub(crate) struct Runner<P: Projection, RS, JS> {
    wiring: ProjectionWiring<P>,
    lifecycle: Lifecycle,
    schema_hash: String,
    models: Arc<RS>,
    joins: JS,
    volatile_joins: bool,
    status: StatusCell,
}

impl<P, RS, JS> Runner<P, RS, JS>
where
    P: Projection,
    RS: ReadModelStore<P::Key, P>,
    JS: ReadModelStore<StreamId, P::Key>,
{
    pub(crate) fn new(
        lifecycle: Lifecycle,
        models: Arc<RS>,
        joins: JS,
        volatile_joins: bool,
        status: StatusCell,
    ) -> Self {
        let wiring = ProjectionWiring::<P>::build();
        let schema_hash = schema_hash(wiring.kinds());
        Self {
            wiring,
            lifecycle,
            schema_hash,
            models,
            joins,
            volatile_joins,
            status,
        }
    }
}

impl<P, RS, JS> ProjectionRunner for Runner<P, RS, JS>
where
    P: Projection,
    RS: ReadModelStore<P::Key, P>,
    JS: ReadModelStore<StreamId, P::Key>,
{
    fn name(&self) -> &'static str {
        P::NAME
    }

    fn lifecycle(&self) -> Lifecycle {
        self.lifecycle
    }

    fn handles(&self, kind: &str) -> bool {
        self.wiring.route(kind).is_some()
    }

    fn kinds(&self) -> Vec<&'static str> {
        let mut kinds: Vec<_> = self.wiring.kinds().collect();
        kinds.sort_unstable();
        kinds
    }

    fn schema_hash(&self) -> &str {
        &self.schema_hash
    }

    fn status(&self) -> &StatusCell {
        &self.status
    }

    fn volatile_joins(&self) -> bool {
        self.volatile_joins
    }

    fn stage<'a>(
        &'a self,
        events: &'a [StoredEvent],
    ) -> BoxFuture<'a, Result<Box<dyn StagedChanges + 'a>, ProjectionError>> {
        Box::pin(async move {
            let mut staged = Staged::new(self);
            for event in events {
                staged.fold(event).await?;
            }
            tracing::trace!(
                projection = P::NAME,
                models = staged.models.len(),
                joins = staged.joins.len(),
                "staged projection changes"
            );
            Ok(Box::new(staged) as Box<dyn StagedChanges + 'a>)
        })
    }

    fn reset(&self) -> BoxFuture<'_, Result<(), ProjectionError>> {
        Box::pin(async move {
            self.models
                .clear()
                .await
                .map_err(|e| ProjectionError::read_model(P::NAME, e))?;
            self.joins
                .clear()
                .await
                .map_err(|e| ProjectionError::read_model(P::NAME, e))
        })
    }
}

struct Slot<V> {
    prior: Option<V>,
    value: V,
}

struct Staged<'a, P: Projection, RS, JS> {
    runner: &'a Runner<P, RS, JS>,
    models: IndexMap<P::Key, Slot<P>>,
    joins: IndexMap<StreamId, Slot<P::Key>>,
    written_joins: usize,
    written_models: usize,
}

impl<'a, P, RS, JS> Staged<'a, P, RS, JS>
where
    P: Projection,
    RS: ReadModelStore<P::Key, P>,
    JS: ReadModelStore<StreamId, P::Key>,
{
    fn new(runner: &'a Runner<P, RS, JS>) -> Self {
        Self {
            runner,
            models: IndexMap::new(),
            joins: IndexMap::new(),
            written_joins: 0,
            written_models: 0,
        }
    }

    async fn fold(&mut self, event: &StoredEvent) -> Result<(), ProjectionError> {
        let Some(route) = self.runner.wiring.route(&event.kind) else {
            return Ok(());
        };
        let routed = route(event).map_err(|source| ProjectionError::Decode {
            projection: P::NAME,
            kind: event.kind.clone(),
            source,
        })?;

        let key = match routed.locate {
            Locate::Key(key) => key,
            Locate::Bind(key) => {
                self.bind(event.stream_id, key.clone()).await?;
                key
            }
            Locate::Joined => {
                let Some(key) = self.joined(&event.stream_id).await? else {
                    tracing::trace!(
                        projection = P::NAME,
                        stream_id = %event.stream_id,
                        kind = %event.kind,
                        "no join for stream, skipping event"
                    );
                    return Ok(());
                };
                key
            }
            Locate::Ignore => return Ok(()),
        };

        let model = self.model(key).await?;
        (routed.apply)(model, event);
        Ok(())
    }

    async fn model(&mut self, key: P::Key) -> Result<&mut P, ProjectionError> {
        match self.models.entry(key) {
            Entry::Occupied(slot) => Ok(&mut slot.into_mut().value),
            Entry::Vacant(slot) => {
                let prior = self
                    .runner
                    .models
                    .load(slot.key())
                    .await
                    .map_err(|e| ProjectionError::read_model(P::NAME, e))?;
                let value = prior.clone().unwrap_or_default();
                Ok(&mut slot.insert(Slot { prior, value }).value)
            }
        }
    }

    async fn bind(&mut self, stream_id: StreamId, key: P::Key) -> Result<(), ProjectionError> {
        match self.joins.entry(stream_id) {
            Entry::Occupied(mut slot) => slot.get_mut().value = key,
            Entry::Vacant(slot) => {
                let prior = self
                    .runner
                    .joins
                    .load(&stream_id)
                    .await
                    .map_err(|e| ProjectionError::read_model(P::NAME, e))?;
                slot.insert(Slot { prior, value: key });
            }
        }
        Ok(())
    }

    async fn joined(&self, stream_id: &StreamId) -> Result<Option<P::Key>, ProjectionError> {
        if let Some(slot) = self.joins.get(stream_id) {
            return Ok(Some(slot.value.clone()));
        }
        self.runner
            .joins
            .load(stream_id)
            .await
            .map_err(|e| ProjectionError::read_model(P::NAME, e))
    }

    async fn write_all(&mut self) -> Result<(), ProjectionError> {
        for (stream_id, slot) in &self.joins {
            self.runner
                .joins
                .save(*stream_id, slot.value.clone())
                .await
                .map_err(|e| ProjectionError::read_model(P::NAME, e))?;
            self.written_joins += 1;
        }
        for (key, slot) in &self.models {
            self.runner
                .models
                .save(key.clone(), slot.value.clone())
                .await
                .map_err(|e| ProjectionError::read_model(P::NAME, e))?;
            self.written_models += 1;
        }
        Ok(())
    }

    async fn restore(&mut self) -> Result<(), ProjectionError> {
        let mut first_error = None;

        for (stream_id, slot) in self.joins.iter().take(self.written_joins) {
            let result = match &slot.prior {
                Some(prior) => self.runner.joins.save(*stream_id, prior.clone()).await,
                None => self.runner.joins.delete(stream_id).await,
            };
            if let Err(error) = result {
                tracing::error!(projection = P::NAME, %stream_id, %error, "failed to restore join");
                first_error.get_or_insert(ProjectionError::read_model(P::NAME, error));
            }
        }
        for (key, slot) in self.models.iter().take(self.written_models) {
            let result = match &slot.prior {
                Some(prior) => self.runner.models.save(key.clone(), prior.clone()).await,
                None => self.runner.models.delete(key).await,
            };
            if let Err(error) = result {
                tracing::error!(projection = P::NAME, ?key, %error, "failed to restore read model");
                first_error.get_or_insert(ProjectionError::read_model(P::NAME, error));
            }
        }

        self.written_joins = 0;
        self.written_models = 0;
        first_error.map_or(Ok(()), Err)
    }
}

impl<P, RS, JS> StagedChanges for Staged<'_, P, RS, JS>
where
    P: Projection,
    RS: ReadModelStore<P::Key, P>,
    JS: ReadModelStore<StreamId, P::Key>,
{
    fn is_empty(&self) -> bool {
        self.models.is_empty() && self.joins.is_empty()
    }

    fn commit(&mut self) -> BoxFuture<'_, Result<(), ProjectionError>> {
        Box::pin(async move {
            if let Err(error) = self.write_all().await {
                if let Err(restore_error) = self.restore().await {
                    tracing::error!(
                        projection = P::NAME,
                        error = %restore_error,
                        "partial projection write could not be undone"
                    );
                }
                return Err(error);
            }
            Ok(())
        })
    }

    fn rollback(&mut self) -> BoxFuture<'_, Result<(), ProjectionError>> {
        Box::pin(self.restore())
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use serde::{Deserialize, Serialize};

    use super::*;
    use crate::{
        event::{DomainEvent, Metadata},
        id::EventId,
        projection::{ApplyProjection, ProjectionState, inmemory::InMemoryReadModels},
    };

    #[derive(Serialize, Deserialize)]
    struct Tagged {
        tag: String,
    }

    impl DomainEvent for Tagged {
        const KIND: &'static str = "item.tagged";
    }

    #[derive(Serialize, Deserialize)]
    struct Counted {
        by: u32,
    }

    impl DomainEvent for Counted {
        const KIND: &'static str = "item.counted";
    }

    #[derive(Clone, Debug, Default, PartialEq)]
    struct TagTotals {
        count: u32,
    }

    impl Projection for TagTotals {
        const NAME: &'static str = "tag-totals";
        type Key = String;

        fn wire(wiring: &mut ProjectionWiring<Self>) {
            wiring.event::<Tagged>().event::<Counted>();
        }
    }

    impl ApplyProjection<Tagged> for TagTotals {
        fn locate(event: &Tagged, _: &StreamId) -> Locate<String> {
            Locate::Bind(event.tag.clone())
        }

        fn apply_projection(&mut self, _: &Tagged, _: &StoredEvent) {}
    }

    impl ApplyProjection<Counted> for TagTotals {
        fn locate(_: &Counted, _: &StreamId) -> Locate<String> {
            Locate::Joined
        }

        fn apply_projection(&mut self, event: &Counted, _: &StoredEvent) {
            self.count += event.by;
        }
    }

    type TestRunner = Runner<TagTotals, InMemoryReadModels<String, TagTotals>, InMemoryReadModels<StreamId, String>>;

    fn runner() -> (TestRunner, InMemoryReadModels<String, TagTotals>) {
        let models = InMemoryReadModels::new();
        let runner = Runner::new(
            Lifecycle::Inline,
            Arc::new(models.clone()),
            InMemoryReadModels::new(),
            true,
            StatusCell::new(ProjectionState::Fresh),
        );
        (runner, models)
    }

    fn stored<E: DomainEvent>(stream_id: StreamId, version: u64, event: &E) -> StoredEvent {
        StoredEvent {
            event_id: EventId::new(),
            stream_id,
            version,
            kind: E::KIND.to_string(),
            data: serde_json::to_value(event).unwrap(),
            occurred_at: Utc::now(),
            metadata: Metadata::new(),
            global_sequence: None,
        }
    }

    #[tokio::test]
    async fn joined_events_follow_their_stream_binding() {
        let (runner, models) = runner();
        let stream = StreamId::new();
        let unbound = StreamId::new();
        let events = vec![
            stored(stream, 0, &Tagged { tag: "red".into() }),
            stored(stream, 1, &Counted { by: 2 }),
            stored(unbound, 0, &Counted { by: 10 }),
            stored(stream, 2, &Counted { by: 3 }),
        ];

        let mut staged = runner.stage(&events).await.unwrap();
        assert!(models.is_empty().unwrap());
        staged.commit().await.unwrap();
        drop(staged);

        assert_eq!(
            models.load(&"red".to_string()).await.unwrap(),
            Some(TagTotals { count: 5 })
        );
        assert_eq!(models.len().unwrap(), 1);
    }

    #[tokio::test]
    async fn rollback_restores_prior_values_and_removes_new_keys() {
        let (runner, models) = runner();
        models
            .save("red".to_string(), TagTotals { count: 1 })
            .await
            .unwrap();

        let red = StreamId::new();
        let blue = StreamId::new();
        let events = vec![
            stored(red, 0, &Tagged { tag: "red".into() }),
            stored(red, 1, &Counted { by: 4 }),
            stored(blue, 0, &Tagged { tag: "blue".into() }),
        ];
        let mut staged = runner.stage(&events).await.unwrap();
        staged.commit().await.unwrap();
        assert_eq!(models.len().unwrap(), 2);

        staged.rollback().await.unwrap();
        drop(staged);
        assert_eq!(
            models.load(&"red".to_string()).await.unwrap(),
            Some(TagTotals { count: 1 })
        );
        assert_eq!(models.load(&"blue".to_string()).await.unwrap(), None);
        assert_eq!(runner.joins.load(&red).await.unwrap(), None);
    }

    #[tokio::test]
    async fn undecodable_payload_is_a_decode_error() {
        let (runner, _) = runner();
        let mut event = stored(StreamId::new(), 0, &Counted { by: 1 });
        event.data = serde_json::json!({ "by": "many" });
        let error = runner.stage(std::slice::from_ref(&event)).await.err().unwrap();
        assert!(matches!(error, ProjectionError::Decode { projection: "tag-totals", .. }));
    }

    #[test]
    fn reports_handled_kinds_sorted() {
        let (runner, _) = runner();
        assert_eq!(runner.kinds(), vec!["item.counted", "item.tagged"]);
        assert!(runner.handles("item.tagged"));
        assert!(!runner.handles("item.deleted"));
        assert_eq!(
            runner.schema_hash(),
            schema_hash(["item.tagged", "item.counted"])
        );
    }
}
