//! Append-only JSON-lines event store.
//!
//! Layout of a store directory:
//!
//! ```text
//! <dir>/
//!     events.jsonl   -- one StoredEvent per line, in global-sequence order
//!     staging.json   -- present only while a commit is in flight
//! ```
//!
//! A commit validates every expected version, writes the whole batch to
//! `staging.json` and syncs it, appends the batch to `events.jsonl` and syncs
//! it, then removes the staging file. Opening a directory that still holds a
//! staging file replays it: whatever part of the batch reached the log is cut
//! off and the full batch is written again.
//!
//! Commits run on tokio's blocking pool; reads are served from the in-memory
//! index.

use std::{
    collections::HashMap,
    fs::{self, File, OpenOptions},
    future::Future,
    io::{ErrorKind, Write},
    path::{Path, PathBuf},
    sync::{Arc, Mutex},
};

use eventide_core::{
    concurrency::{ConcurrencyConflict, ExpectedVersion},
    id::StreamId,
    store::{
        AppendError, AppendOutcome, AppendResult, AtomicEventStore, CommittedStream, EventStore,
        NewEvent, NonEmpty, StoredEvent, StreamBatch, ensure_distinct_streams,
    },
};
use serde::{Deserialize, Serialize};
use tracing::Instrument;

use crate::Error;

const LOG_FILE: &str = "events.jsonl";
const STAGING_FILE: &str = "staging.json";

/// The batch a commit is about to append, with versions and sequences
/// already assigned.
#[derive(Debug, Serialize, Deserialize)]
struct Staging {
    first_sequence: u64,
    events: Vec<StoredEvent>,
}

/// Disk-backed [`AtomicEventStore`].
///
/// The full log is indexed in memory when the store is opened; reads never
/// touch the disk. One mutex serializes every operation, so a single process
/// must own the directory.
///
/// Cloning the store is cheap and every clone shares the same state.
#[derive(Clone)]
pub struct Store {
    dir: Arc<PathBuf>,
    inner: Arc<Mutex<Inner>>,
}

impl std::fmt::Debug for Store {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Store")
            .field("dir", &self.dir)
            .finish_non_exhaustive()
    }
}

struct Inner {
    log_path: PathBuf,
    staging_path: PathBuf,
    log: File,
    log_len: u64,
    events: Vec<StoredEvent>,
    /// Byte offset of each event's line.
    offsets: Vec<u64>,
    streams: HashMap<StreamId, Vec<usize>>,
    /// Set when a failed write could not be cut back; the file and the index
    /// disagree until the store is reopened.
    halted: bool,
}

/// Complete records of a log file plus the length of the prefix they span.
struct Parsed {
    events: Vec<StoredEvent>,
    offsets: Vec<u64>,
    valid_len: u64,
    file_len: u64,
}

fn parse_log(path: &Path) -> Result<Parsed, Error> {
    let bytes = match fs::read(path) {
        Ok(bytes) => bytes,
        Err(err) if err.kind() == ErrorKind::NotFound => Vec::new(),
        Err(err) => return Err(Error::io(path)(err)),
    };

    let mut events = Vec::new();
    let mut offsets = Vec::new();
    let mut start = 0;
    while start < bytes.len() {
        let Some(end) = bytes[start..].iter().position(|&b| b == b'\n') else {
            tracing::warn!(
                path = %path.display(),
                discarded_bytes = bytes.len() - start,
                "discarding torn trailing record"
            );
            break;
        };
        let line = &bytes[start..start + end];
        if !line.is_empty() {
            let event: StoredEvent =
                serde_json::from_slice(line).map_err(Error::serialization(path))?;
            offsets.push(start as u64);
            events.push(event);
        }
        start += end + 1;
    }

    Ok(Parsed {
        events,
        offsets,
        valid_len: start.min(bytes.len()) as u64,
        file_len: bytes.len() as u64,
    })
}

fn index(events: &[StoredEvent]) -> Result<HashMap<StreamId, Vec<usize>>, Error> {
    let mut streams: HashMap<StreamId, Vec<usize>> = HashMap::new();
    for (position, event) in events.iter().enumerate() {
        let line = position + 1;
        if event.global_sequence != Some(position as u64) {
            return Err(Error::Corrupt {
                line,
                reason: format!(
                    "expected global sequence {position}, found {:?}",
                    event.global_sequence
                ),
            });
        }
        let indices = streams.entry(event.stream_id).or_default();
        let expected = indices.len() as u64;
        if event.version != expected {
            return Err(Error::Corrupt {
                line,
                reason: format!(
                    "stream {} expected version {expected}, found {}",
                    event.stream_id, event.version
                ),
            });
        }
        indices.push(position);
    }
    Ok(streams)
}

fn read_staging(path: &Path) -> Result<Option<Staging>, Error> {
    let bytes = match fs::read(path) {
        Ok(bytes) => bytes,
        Err(err) if err.kind() == ErrorKind::NotFound => return Ok(None),
        Err(err) => return Err(Error::io(path)(err)),
    };
    match serde_json::from_slice(&bytes) {
        Ok(staging) => Ok(Some(staging)),
        Err(err) => {
            // The log is only touched once the staging file is synced, so a
            // torn staging file means nothing of its batch was written.
            tracing::warn!(path = %path.display(), error = %err, "discarding torn staging file");
            fs::remove_file(path).map_err(Error::io(path))?;
            Ok(None)
        }
    }
}

impl Inner {
    fn open(dir: &Path) -> Result<Self, Error> {
        fs::create_dir_all(dir).map_err(Error::io(dir))?;
        let log_path = dir.join(LOG_FILE);
        let staging_path = dir.join(STAGING_FILE);

        let Parsed {
            mut events,
            mut offsets,
            mut valid_len,
            file_len,
        } = parse_log(&log_path)?;

        let staging = read_staging(&staging_path)?;
        if let Some(staging) = &staging {
            let first = usize::try_from(staging.first_sequence)
                .ok()
                .filter(|&first| first <= events.len())
                .ok_or_else(|| Error::Corrupt {
                    line: events.len() + 1,
                    reason: format!(
                        "staged batch starts at sequence {} past the end of the log",
                        staging.first_sequence
                    ),
                })?;
            let tail = &events[first..];
            let matches = tail.len() <= staging.events.len()
                && tail
                    .iter()
                    .zip(&staging.events)
                    .all(|(logged, staged)| logged.event_id == staged.event_id);
            if !matches {
                return Err(Error::Corrupt {
                    line: first + 1,
                    reason: "log tail does not match the staged batch".to_string(),
                });
            }
            if let Some(&offset) = offsets.get(first) {
                valid_len = offset;
            }
            tracing::info!(
                first_sequence = staging.first_sequence,
                already_written = tail.len(),
                event_count = staging.events.len(),
                "replaying staged batch"
            );
            events.truncate(first);
            offsets.truncate(first);
        }

        let log = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&log_path)
            .map_err(Error::io(&log_path))?;
        if valid_len < file_len {
            log.set_len(valid_len).map_err(Error::io(&log_path))?;
            log.sync_all().map_err(Error::io(&log_path))?;
        }

        let streams = index(&events)?;
        let mut inner = Self {
            log_path,
            staging_path,
            log,
            log_len: valid_len,
            events,
            offsets,
            streams,
            halted: false,
        };

        if let Some(staging) = staging {
            inner.append_records(staging.events)?;
            inner.clear_staging()?;
        }
        Ok(inner)
    }

    fn current_version(&self, stream_id: &StreamId) -> Option<u64> {
        self.streams
            .get(stream_id)
            .and_then(|indices| indices.last())
            .map(|&index| self.events[index].version)
    }

    fn validate(&self, batch: &StreamBatch) -> Result<(), ConcurrencyConflict> {
        let current = self.current_version(&batch.stream_id);
        if batch.expected_version.matches(current) {
            return Ok(());
        }
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

    fn write_staging(&self, staging: &Staging) -> Result<(), Error> {
        let path = &self.staging_path;
        let bytes = serde_json::to_vec(staging).map_err(Error::serialization(path))?;
        let mut file = File::create(path).map_err(Error::io(path))?;
        file.write_all(&bytes).map_err(Error::io(path))?;
        file.sync_all().map_err(Error::io(path))
    }

    fn clear_staging(&self) -> Result<(), Error> {
        fs::remove_file(&self.staging_path).map_err(Error::io(&self.staging_path))
    }

    /// Append records to the log and the in-memory index.
    ///
    /// On a failed write the log is cut back to its previous length.
    fn append_records(&mut self, records: Vec<StoredEvent>) -> Result<(), Error> {
        let mut buffer = Vec::new();
        let mut offsets = Vec::with_capacity(records.len());
        for record in &records {
            offsets.push(self.log_len + buffer.len() as u64);
            serde_json::to_writer(&mut buffer, record)
                .map_err(Error::serialization(&self.log_path))?;
            buffer.push(b'\n');
        }

        let written = self
            .log
            .write_all(&buffer)
            .and_then(|()| self.log.sync_data());
        if let Err(source) = written {
            if let Err(err) = self.log.set_len(self.log_len) {
                tracing::error!(
                    path = %self.log_path.display(),
                    error = %err,
                    "failed to cut back a partial write, halting until the store is reopened"
                );
                self.halted = true;
            }
            return Err(Error::Io {
                path: self.log_path.clone(),
                source,
            });
        }

        self.log_len += buffer.len() as u64;
        for (record, offset) in records.into_iter().zip(offsets) {
            let position = self.events.len();
            self.streams
                .entry(record.stream_id)
                .or_default()
                .push(position);
            self.offsets.push(offset);
            self.events.push(record);
        }
        Ok(())
    }

    fn commit(&mut self, batches: Vec<StreamBatch>) -> AppendOutcome<Error> {
        if self.halted {
            return Err(AppendError::Store(Error::Halted));
        }
        for batch in &batches {
            self.validate(batch)?;
        }

        let first_sequence = self.events.len() as u64;
        let mut sequence = first_sequence;
        let mut records = Vec::new();
        let mut streams = Vec::with_capacity(batches.len());
        for batch in batches {
            let mut version = batch.expected_version.next_version();
            for event in batch.events {
                records.push(event.into_stored(batch.stream_id, version, Some(sequence)));
                sequence += 1;
                version += 1;
            }
            streams.push(CommittedStream {
                stream_id: batch.stream_id,
                version: version - 1,
            });
        }

        let staging = Staging {
            first_sequence,
            events: records,
        };
        self.write_staging(&staging).map_err(AppendError::Store)?;

        if let Err(err) = self.append_records(staging.events) {
            // A halted store keeps the staging file: it is what `open` uses to
            // cut the log back.
            if !self.halted
                && let Err(cleanup) = self.clear_staging()
            {
                tracing::error!(error = %cleanup, "failed to remove staging file after a failed append");
            }
            return Err(AppendError::Store(err));
        }

        if let Err(err) = self.clear_staging() {
            // The batch is durable; replaying the staging file on open is a
            // no-op rewrite of the same events.
            tracing::warn!(error = %err, "failed to remove staging file");
        }

        Ok(AppendResult {
            last_global_sequence: sequence - 1,
            streams,
        })
    }
}

impl Store {
    /// Open the store in `dir`, creating the directory if needed and
    /// recovering from an interrupted commit.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Io`] on filesystem failures, [`Error::Serialization`]
    /// for an unreadable complete record and [`Error::Corrupt`] when the log
    /// breaks its ordering invariants.
    #[tracing::instrument(skip_all, fields(dir = %dir.as_ref().display()))]
    pub fn open(dir: impl AsRef<Path>) -> Result<Self, Error> {
        let dir = dir.as_ref().to_path_buf();
        let inner = Inner::open(&dir)?;
        tracing::debug!(events_loaded = inner.events.len(), "opened file store");
        Ok(Self {
            dir: Arc::new(dir),
            inner: Arc::new(Mutex::new(inner)),
        })
    }

    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn commit(
        &self,
        batches: Vec<StreamBatch>,
    ) -> impl Future<Output = AppendOutcome<Error>> + Send + 'static {
        let inner = Arc::clone(&self.inner);
        async move {
            if batches.is_empty() {
                return Err(AppendError::EmptyAppend);
            }
            ensure_distinct_streams::<Error>(&batches)?;

            let event_count: usize = batches.iter().map(|batch| batch.events.len()).sum();
            let span = tracing::Span::current();
            let result = tokio::task::spawn_blocking(move || {
                let _entered = span.enter();
                inner
                    .lock()
                    .map_err(|_| AppendError::Store(Error::Poisoned))?
                    .commit(batches)
            })
            .await
            .map_err(|err| AppendError::Store(Error::Task(err)))??;

            tracing::debug!(
                event_count,
                streams = result.streams.len(),
                last_global_sequence = result.last_global_sequence,
                "events committed"
            );
            Ok(result)
        }
        .instrument(tracing::Span::current())
    }

    fn read<T>(&self, f: impl FnOnce(&Inner) -> T) -> Result<T, Error> {
        let inner = self.inner.lock().map_err(|_| Error::Poisoned)?;
        if inner.halted {
            return Err(Error::Halted);
        }
        Ok(f(&inner))
    }
}

impl EventStore for Store {
    type Error = Error;

    #[tracing::instrument(skip(self), fields(stream_id = %stream_id))]
    fn load_stream<'a>(
        &'a self,
        stream_id: &'a StreamId,
    ) -> impl Future<Output = Result<Vec<StoredEvent>, Self::Error>> + Send + 'a {
        std::future::ready(self.read(|inner| {
            inner
                .streams
                .get(stream_id)
                .map(|indices| {
                    indices
                        .iter()
                        .map(|&index| inner.events[index].clone())
                        .collect()
                })
                .unwrap_or_default()
        }))
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
        self.commit(vec![StreamBatch::new(*stream_id, expected_version, events)])
    }

    fn load_events_from_position(
        &self,
        after: Option<u64>,
        limit: usize,
    ) -> impl Future<Output = Result<Vec<StoredEvent>, Self::Error>> + Send + '_ {
        std::future::ready(self.read(|inner| {
            let start = after
                .map_or(Some(0), |after| usize::try_from(after).ok()?.checked_add(1))
                .unwrap_or(usize::MAX)
                .min(inner.events.len());
            inner.events[start..].iter().take(limit).cloned().collect()
        }))
    }

    fn max_global_sequence(
        &self,
    ) -> impl Future<Output = Result<Option<u64>, Self::Error>> + Send + '_ {
        std::future::ready(self.read(|inner| inner.events.last().and_then(|e| e.global_sequence)))
    }
}

impl AtomicEventStore for Store {
    #[tracing::instrument(skip_all, fields(streams = batches.len()))]
    fn append_events_to_streams(
        &self,
        batches: Vec<StreamBatch>,
    ) -> impl Future<Output = AppendOutcome<Self::Error>> + Send + '_ {
        self.commit(batches)
    }
}
