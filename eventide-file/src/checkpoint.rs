//! File-backed projection checkpoints.

use std::{
    collections::BTreeMap,
    fs,
    future::Future,
    io::ErrorKind,
    path::{Path, PathBuf},
    sync::{Arc, Mutex},
};

use eventide_core::projection::ProjectionPositionStore;
use serde::{Deserialize, Serialize};

use crate::Error;

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
struct Entry {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    position: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    schema_hash: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    rebuild_target: Option<u64>,
}

/// [`ProjectionPositionStore`] persisting every projection's position and
/// schema hash in one JSON file.
///
/// Every write replaces the file through a temporary sibling and a rename,
/// so a crash leaves either the old or the new contents. Writes run on
/// tokio's blocking pool.
#[derive(Clone, Debug)]
pub struct CheckpointStore {
    path: Arc<PathBuf>,
    entries: Arc<Mutex<BTreeMap<String, Entry>>>,
}

impl CheckpointStore {
    /// Open (or create on first write) the checkpoint file at `path`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Io`] if the file exists but cannot be read, or
    /// [`Error::Serialization`] if its contents are not valid.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, Error> {
        let path = path.into();
        let entries = match fs::read(&path) {
            Ok(bytes) => serde_json::from_slice(&bytes).map_err(Error::serialization(&path))?,
            Err(err) if err.kind() == ErrorKind::NotFound => BTreeMap::new(),
            Err(err) => return Err(Error::io(&path)(err)),
        };
        Ok(Self {
            path: Arc::new(path),
            entries: Arc::new(Mutex::new(entries)),
        })
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn read<T>(&self, projection: &str, f: impl FnOnce(&Entry) -> T) -> Result<Option<T>, Error> {
        let entries = self.entries.lock().map_err(|_| Error::Poisoned)?;
        Ok(entries.get(projection).map(f))
    }

    fn write<F>(&self, projection: &str, f: F) -> impl Future<Output = Result<(), Error>> + Send + 'static
    where
        F: FnOnce(&mut Entry) + Send + 'static,
    {
        let path = Arc::clone(&self.path);
        let entries = Arc::clone(&self.entries);
        let projection = projection.to_string();
        async move {
            tokio::task::spawn_blocking(move || {
                let mut entries = entries.lock().map_err(|_| Error::Poisoned)?;
                let mut updated = entries.clone();
                f(updated.entry(projection).or_default());
                persist(&path, &updated)?;
                *entries = updated;
                Ok(())
            })
            .await
            .map_err(Error::Task)?
        }
    }
}

fn persist(path: &Path, entries: &BTreeMap<String, Entry>) -> Result<(), Error> {
    if let Some(parent) = path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
        fs::create_dir_all(parent).map_err(Error::io(parent))?;
    }
    let tmp = path.with_extension("json.tmp");
    let bytes = serde_json::to_vec_pretty(entries).map_err(Error::serialization(path))?;
    fs::write(&tmp, bytes).map_err(Error::io(&tmp))?;
    fs::rename(&tmp, path).map_err(Error::io(path))
}

impl ProjectionPositionStore for CheckpointStore {
    type Error = Error;

    fn load_position<'a>(
        &'a self,
        projection: &'a str,
    ) -> impl Future<Output = Result<Option<u64>, Self::Error>> + Send + 'a {
        std::future::ready(
            self.read(projection, |entry| entry.position)
                .map(Option::flatten),
        )
    }

    fn save_position<'a>(
        &'a self,
        projection: &'a str,
        position: u64,
    ) -> impl Future<Output = Result<(), Self::Error>> + Send + 'a {
        self.write(projection, move |entry| entry.position = Some(position))
    }

    fn reset_position<'a>(
        &'a self,
        projection: &'a str,
    ) -> impl Future<Output = Result<(), Self::Error>> + Send + 'a {
        self.write(projection, |entry| entry.position = None)
    }

    fn load_schema_hash<'a>(
        &'a self,
        projection: &'a str,
    ) -> impl Future<Output = Result<Option<String>, Self::Error>> + Send + 'a {
        std::future::ready(
            self.read(projection, |entry| entry.schema_hash.clone())
                .map(Option::flatten),
        )
    }

    fn save_schema_hash<'a>(
        &'a self,
        projection: &'a str,
        hash: &'a str,
    ) -> impl Future<Output = Result<(), Self::Error>> + Send + 'a {
        let hash = hash.to_string();
        self.write(projection, move |entry| entry.schema_hash = Some(hash))
    }

    fn load_rebuild_target<'a>(
        &'a self,
        projection: &'a str,
    ) -> impl Future<Output = Result<Option<u64>, Self::Error>> + Send + 'a {
        std::future::ready(
            self.read(projection, |entry| entry.rebuild_target)
                .map(Option::flatten),
        )
    }

    fn save_rebuild_target<'a>(
        &'a self,
        projection: &'a str,
        target: Option<u64>,
    ) -> impl Future<Output = Result<(), Self::Error>> + Send + 'a {
        self.write(projection, move |entry| entry.rebuild_target = target)
    }
}
