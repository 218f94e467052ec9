//! Integration tests for inline projections.

#![cfg(feature = "test-util")]

use std::{
    future::Future,
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, Ordering},
    },
};

use eventide::{
    Aggregate, AggregateWiring, Apply, ApplyProjection, Create, DomainEvent, Locate, Projection,
    ProjectionRegistry, ProjectionWiring, Repository, SessionError, StreamId, Wiring,
    projection::{Lifecycle, ReadModelStore, inmemory::InMemoryReadModels},
    store::{EventStore, NonEmpty, StoredEvent, inmemory},
    test::StoreTestExt,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;

// ============================================================================
// Test Domain: Task board
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
struct TaskOpened {
    board: String,
    title: String,
}

impl DomainEvent for TaskOpened {
    const KIND: &'static str = "task.opened";
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct TaskRenamed {
    title: String,
}

impl DomainEvent for TaskRenamed {
    const KIND: &'static str = "task.renamed";
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct TaskClosed;

impl DomainEvent for TaskClosed {
    const KIND: &'static str = "task.closed";
}

struct Task {
    closed: bool,
}

impl Aggregate for Task {
    const KIND: &'static str = "task";

    fn wire(wiring: &mut AggregateWiring<Self>) {
        wiring
            .creation::<TaskOpened>()
            .mutation::<TaskRenamed>()
            .mutation::<TaskClosed>();
    }
}

impl Create<TaskOpened> for Task {
    fn create(_: &TaskOpened) -> Self {
        Self { closed: false }
    }
}

impl Apply<TaskRenamed> for Task {
    fn apply(&mut self, _: &TaskRenamed) {}
}

impl Apply<TaskClosed> for Task {
    fn apply(&mut self, _: &TaskClosed) {
        self.closed = true;
    }
}

/// Single-stream projection: the current title of each task.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
struct TaskTitle {
    title: String,
    renames: u32,
}

impl Projection for TaskTitle {
    const NAME: &'static str = "task-title";
    type Key = StreamId;

    fn wire(wiring: &mut ProjectionWiring<Self>) {
        wiring.event::<TaskOpened>().event::<TaskRenamed>();
    }
}

impl ApplyProjection<TaskOpened> for TaskTitle {
    fn locate(_: &TaskOpened, stream_id: &StreamId) -> Locate<StreamId> {
        Locate::Key(*stream_id)
    }

    fn apply_projection(&mut self, event: &TaskOpened, _: &StoredEvent) {
        self.title.clone_from(&event.title);
    }
}

impl ApplyProjection<TaskRenamed> for TaskTitle {
    fn locate(_: &TaskRenamed, stream_id: &StreamId) -> Locate<StreamId> {
        Locate::Key(*stream_id)
    }

    fn apply_projection(&mut self, event: &TaskRenamed, _: &StoredEvent) {
        self.title.clone_from(&event.title);
        self.renames += 1;
    }
}

/// Multi-stream projection: open and closed counts per board.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
struct BoardSummary {
    open: u32,
    closed: u32,
}

impl Projection for BoardSummary {
    const NAME: &'static str = "board-summary";
    type Key = String;

    fn wire(wiring: &mut ProjectionWiring<Self>) {
        wiring.event::<TaskOpened>().event::<TaskClosed>();
    }
}

impl ApplyProjection<TaskOpened> for BoardSummary {
    fn locate(event: &TaskOpened, _: &StreamId) -> Locate<String> {
        Locate::Bind(event.board.clone())
    }

    fn apply_projection(&mut self, _: &TaskOpened, _: &StoredEvent) {
        self.open += 1;
    }
}

impl ApplyProjection<TaskClosed> for BoardSummary {
    fn locate(_: &TaskClosed, _: &StreamId) -> Locate<String> {
        Locate::Joined
    }

    fn apply_projection(&mut self, _: &TaskClosed, _: &StoredEvent) {
        self.open -= 1;
        self.closed += 1;
    }
}

/// Counts closings per task; registered against a store that can be made to
/// fail.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
struct Closures {
    count: u32,
}

impl Projection for Closures {
    const NAME: &'static str = "closures";
    type Key = StreamId;

    fn wire(wiring: &mut ProjectionWiring<Self>) {
        wiring.event::<TaskClosed>();
    }
}

impl ApplyProjection<TaskClosed> for Closures {
    fn locate(_: &TaskClosed, stream_id: &StreamId) -> Locate<StreamId> {
        Locate::Key(*stream_id)
    }

    fn apply_projection(&mut self, _: &TaskClosed, _: &StoredEvent) {
        self.count += 1;
    }
}

#[derive(Debug, Error)]
#[error("read-model store unavailable")]
struct Unavailable;

/// In-memory read models whose writes fail while `failing` is set. Every
/// successful write is recorded, `None` for a delete.
#[derive(Clone, Default)]
struct FlakyModels<V> {
    inner: InMemoryReadModels<StreamId, V>,
    failing: Arc<AtomicBool>,
    writes: Arc<Mutex<Vec<Option<V>>>>,
}

impl<V: Clone> FlakyModels<V> {
    fn writes(&self) -> Vec<Option<V>> {
        self.writes.lock().unwrap().clone()
    }

    fn record(&self, write: Option<V>) {
        self.writes.lock().unwrap().push(write);
    }

    fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    fn check(&self) -> Result<(), Unavailable> {
        if self.failing.load(Ordering::SeqCst) {
            Err(Unavailable)
        } else {
            Ok(())
        }
    }
}

impl<V: Clone + Send + Sync + 'static> ReadModelStore<StreamId, V> for FlakyModels<V> {
    type Error = Unavailable;

    fn load<'a>(
        &'a self,
        key: &'a StreamId,
    ) -> impl Future<Output = Result<Option<V>, Self::Error>> + Send + 'a {
        async move { self.inner.load(key).await.map_err(|_| Unavailable) }
    }

    fn save(&self, key: StreamId, value: V) -> impl Future<Output = Result<(), Self::Error>> + Send + '_ {
        async move {
            self.check()?;
            self.record(Some(value.clone()));
            self.inner.save(key, value).await.map_err(|_| Unavailable)
        }
    }

    fn delete<'a>(
        &'a self,
        key: &'a StreamId,
    ) -> impl Future<Output = Result<(), Self::Error>> + Send + 'a {
        async move {
            self.check()?;
            self.record(None);
            self.inner.delete(key).await.map_err(|_| Unavailable)
        }
    }

    fn clear(&self) -> impl Future<Output = Result<(), Self::Error>> + Send + '_ {
        async move {
            self.check()?;
            self.inner.clear().await.map_err(|_| Unavailable)
        }
    }
}

fn wiring() -> Wiring {
    Wiring::new().with::<Task>().unwrap()
}

fn opened(board: &str, title: &str) -> TaskOpened {
    TaskOpened {
        board: board.to_string(),
        title: title.to_string(),
    }
}

// ============================================================================
// Tests
// ============================================================================

#[tokio::test]
async fn inline_projection_is_updated_by_save() {
    let mut projections = ProjectionRegistry::new();
    let titles = projections
        .inline::<TaskTitle, _>(InMemoryReadModels::new())
        .unwrap();
    let repository =
        Repository::new(inmemory::Store::new(), wiring()).with_projections(projections);

    let id = StreamId::new();
    let mut session = repository.open_session();
    session
        .start_stream::<Task, _>(id, opened("inbox", "write docs"))
        .unwrap();
    session
        .append(&id, TaskRenamed { title: "write more docs".into() })
        .unwrap();
    session.save_changes().await.unwrap();

    let read = titles.load(&id).await.unwrap();
    assert!(!read.is_stale);
    assert_eq!(
        read.value,
        Some(TaskTitle {
            title: "write more docs".into(),
            renames: 1,
        })
    );
}

#[tokio::test]
async fn multi_stream_projection_follows_joins() {
    let mut projections = ProjectionRegistry::new();
    let boards = projections
        .inline::<BoardSummary, _>(InMemoryReadModels::new())
        .unwrap();
    let repository =
        Repository::new(inmemory::Store::new(), wiring()).with_projections(projections);

    let a = StreamId::new();
    let b = StreamId::new();
    let c = StreamId::new();
    let mut session = repository.open_session();
    session.start_stream::<Task, _>(a, opened("inbox", "a")).unwrap();
    session.start_stream::<Task, _>(b, opened("inbox", "b")).unwrap();
    session.start_stream::<Task, _>(c, opened("later", "c")).unwrap();
    // Bound earlier in the same save.
    session.append(&a, TaskClosed).unwrap();
    session.save_changes().await.unwrap();

    let mut session = repository.open_session();
    session.load::<Task>(&b).await.unwrap();
    session.append(&b, TaskClosed).unwrap();
    session.save_changes().await.unwrap();

    let inbox = boards.load(&"inbox".to_string()).await.unwrap().value;
    assert_eq!(inbox, Some(BoardSummary { open: 0, closed: 2 }));
    let later = boards.load(&"later".to_string()).await.unwrap().value;
    assert_eq!(later, Some(BoardSummary { open: 1, closed: 0 }));
}

#[tokio::test]
async fn events_on_unbound_streams_are_skipped() {
    let mut projections = ProjectionRegistry::new();
    let boards = projections
        .inline::<BoardSummary, _>(InMemoryReadModels::new())
        .unwrap();
    let repository =
        Repository::new(inmemory::Store::new(), wiring()).with_projections(projections);

    // Opened behind the repository's back, so the projection never saw it.
    let id = StreamId::new();
    repository
        .store()
        .seed(&id, NonEmpty::new(opened("inbox", "hidden")))
        .await
        .unwrap();

    let mut session = repository.open_session();
    session.load::<Task>(&id).await.unwrap();
    session.append(&id, TaskClosed).unwrap();
    session.save_changes().await.unwrap();

    assert!(boards.store().is_empty().unwrap());
}

#[tokio::test]
async fn conflicting_save_leaves_read_models_untouched() {
    let mut projections = ProjectionRegistry::new();
    let titles = projections
        .inline::<TaskTitle, _>(InMemoryReadModels::new())
        .unwrap();
    let repository =
        Repository::new(inmemory::Store::new(), wiring()).with_projections(projections);

    let id = StreamId::new();
    let mut session = repository.open_session();
    session
        .start_stream::<Task, _>(id, opened("inbox", "original"))
        .unwrap();
    session.save_changes().await.unwrap();

    let mut first = repository.open_session();
    let mut second = repository.open_session();
    first.load::<Task>(&id).await.unwrap();
    second.load::<Task>(&id).await.unwrap();

    first
        .append(&id, TaskRenamed { title: "first".into() })
        .unwrap();
    first.save_changes().await.unwrap();

    second
        .append(&id, TaskRenamed { title: "second".into() })
        .unwrap();
    let err = second.save_changes().await.unwrap_err();
    assert!(err.as_conflict().is_some());

    let read = titles.load(&id).await.unwrap();
    assert_eq!(
        read.value,
        Some(TaskTitle {
            title: "first".into(),
            renames: 1,
        })
    );
}

#[tokio::test]
async fn rejected_append_writes_then_restores_inline_read_models() {
    let models = FlakyModels::<TaskTitle>::default();
    let mut projections = ProjectionRegistry::new();
    let titles = projections.inline::<TaskTitle, _>(models.clone()).unwrap();
    let repository =
        Repository::new(inmemory::Store::new(), wiring()).with_projections(projections);

    let id = StreamId::new();
    let mut session = repository.open_session();
    session
        .start_stream::<Task, _>(id, opened("inbox", "original"))
        .unwrap();
    session.save_changes().await.unwrap();

    repository
        .store()
        .inject_concurrent_event(&id, TaskRenamed { title: "elsewhere".into() })
        .await
        .unwrap();
    session
        .append(&id, TaskRenamed { title: "mine".into() })
        .unwrap();
    let err = session.save_changes().await.unwrap_err();
    assert!(err.as_conflict().is_some());

    // The staged value is visible between the write and the rejected append.
    let titles_written: Vec<_> = models
        .writes()
        .into_iter()
        .map(|write| write.map(|model| model.title))
        .collect();
    assert_eq!(
        titles_written,
        [
            Some("original".to_string()),
            Some("mine".to_string()),
            Some("original".to_string()),
        ]
    );
    let current = titles.load(&id).await.unwrap().value.unwrap();
    assert_eq!(current.title, "original");
}

#[tokio::test]
async fn failing_inline_projection_aborts_the_save() {
    let flaky = FlakyModels::<Closures>::default();
    let mut projections = ProjectionRegistry::new();
    let boards = projections
        .inline::<BoardSummary, _>(InMemoryReadModels::new())
        .unwrap();
    let closures = projections.inline::<Closures, _>(flaky.clone()).unwrap();
    let repository =
        Repository::new(inmemory::Store::new(), wiring()).with_projections(projections);

    let id = StreamId::new();
    let mut session = repository.open_session();
    session.start_stream::<Task, _>(id, opened("inbox", "a")).unwrap();
    session.save_changes().await.unwrap();
    let before = boards.store().snapshot().unwrap();

    flaky.set_failing(true);
    session.append(&id, TaskClosed).unwrap();
    let err = session.save_changes().await.unwrap_err();
    let SessionError::Projection(error) = err else {
        panic!("expected a projection error, got {err:?}");
    };
    assert_eq!(error.projection(), "closures");

    // Nothing was appended and the projection committed first was restored.
    assert_eq!(repository.store().stream_version(&id).await.unwrap(), Some(0));
    assert_eq!(boards.store().snapshot().unwrap(), before);
    assert_eq!(closures.load(&id).await.unwrap().value, None);
    assert_eq!(session.pending_events(&id), 1);

    flaky.set_failing(false);
    session.save_changes().await.unwrap();
    assert_eq!(repository.store().stream_version(&id).await.unwrap(), Some(1));
    assert_eq!(
        closures.load(&id).await.unwrap().value,
        Some(Closures { count: 1 })
    );
    let inbox = boards.load(&"inbox".to_string()).await.unwrap().value;
    assert_eq!(inbox, Some(BoardSummary { open: 0, closed: 1 }));
}

#[tokio::test]
async fn saves_without_interested_projections_skip_them() {
    let flaky = FlakyModels::<Closures>::default();
    flaky.set_failing(true);
    let mut projections = ProjectionRegistry::new();
    projections.inline::<Closures, _>(flaky).unwrap();
    let repository =
        Repository::new(inmemory::Store::new(), wiring()).with_projections(projections);

    let id = StreamId::new();
    let mut session = repository.open_session();
    session.start_stream::<Task, _>(id, opened("inbox", "a")).unwrap();
    session.save_changes().await.unwrap();
    assert_eq!(repository.store().stream_version(&id).await.unwrap(), Some(0));
}

#[tokio::test]
async fn folding_the_same_events_twice_is_deterministic() {
    let run = || async {
        let mut projections = ProjectionRegistry::new();
        let titles = projections
            .inline::<TaskTitle, _>(InMemoryReadModels::new())
            .unwrap();
        let repository =
            Repository::new(inmemory::Store::new(), wiring()).with_projections(projections);
        let id = StreamId::new();
        let mut session = repository.open_session();
        session.start_stream::<Task, _>(id, opened("inbox", "a")).unwrap();
        for title in ["b", "c", "d"] {
            session
                .append(&id, TaskRenamed { title: title.into() })
                .unwrap();
        }
        session.save_changes().await.unwrap();
        titles.load(&id).await.unwrap().value
    };

    let first = run().await;
    assert_eq!(first, run().await);
    assert_eq!(first.map(|model| model.renames), Some(3));
}

#[test]
fn registry_describes_projections() {
    let mut projections = ProjectionRegistry::new();
    projections
        .inline::<TaskTitle, _>(InMemoryReadModels::new())
        .unwrap();
    projections
        .asynchronous::<BoardSummary, _>(InMemoryReadModels::new())
        .unwrap();

    let err = projections
        .inline::<TaskTitle, _>(InMemoryReadModels::new())
        .unwrap_err();
    assert_eq!(err.to_string(), "a projection named `task-title` is already registered");

    let infos = projections.projections();
    assert_eq!(infos.len(), 2);
    assert_eq!(infos[0].kinds, ["task.opened", "task.renamed"]);
    assert_eq!(infos[1].lifecycle, Lifecycle::Async);
    assert_eq!(
        infos[1].schema_hash,
        eventide::projection::schema_hash(["task.closed", "task.opened"])
    );

    let interested: Vec<_> = projections
        .interested_in("task.opened")
        .into_iter()
        .map(|info| info.name)
        .collect();
    assert_eq!(interested, ["task-title", "board-summary"]);
}
