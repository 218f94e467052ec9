//! In-memory read-model and checkpoint stores.
//!
//! Both types are cheap to clone; clones share state, which lets a test keep
//! a handle to a store it has handed to the registry.

use std::{
    collections::HashMap,
    future::Future,
    hash::Hash,
    sync::{Arc, RwLock},
};

use thiserror::Error;

use super::{ProjectionPositionStore, ReadModelStore};

/// A writer panicked while holding the store lock.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
#[error("in-memory projection store lock poisoned")]
pub struct LockPoisoned;

/// Hash-map backed [`ReadModelStore`].
#[derive(Debug)]
pub struct InMemoryReadModels<K, V> {
    entries: Arc<RwLock<HashMap<K, V>>>,
}

impl<K, V> Clone for InMemoryReadModels<K, V> {
    fn clone(&self) -> Self {
        Self {
            entries: Arc::clone(&self.entries),
        }
    }
}

impl<K, V> Default for InMemoryReadModels<K, V> {
    fn default() -> Self {
        Self {
            entries: Arc::new(RwLock::new(HashMap::new())),
        }
    }
}

impl<K, V> InMemoryReadModels<K, V>
where
    K: Eq + Hash,
{
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored models.
    ///
    /// # Errors
    ///
    /// Returns [`LockPoisoned`] if a writer panicked.
    pub fn len(&self) -> Result<usize, LockPoisoned> {
        Ok(self.entries.read().map_err(|_| LockPoisoned)?.len())
    }

    /// # Errors
    ///
    /// Returns [`LockPoisoned`] if a writer panicked.
    pub fn is_empty(&self) -> Result<bool, LockPoisoned> {
        self.len().map(|len| len == 0)
    }

    /// Copy of every stored model.
    ///
    /// # Errors
    ///
    /// Returns [`LockPoisoned`] if a writer panicked.
    pub fn snapshot(&self) -> Result<HashMap<K, V>, LockPoisoned>
    where
        K: Clone,
        V: Clone,
    {
        Ok(self.entries.read().map_err(|_| LockPoisoned)?.clone())
    }
}

impl<K, V> ReadModelStore<K, V> for InMemoryReadModels<K, V>
where
    K: Eq + Hash + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    type Error = LockPoisoned;

    fn load<'a>(
        &'a self,
        key: &'a K,
    ) -> impl Future<Output = Result<Option<V>, Self::Error>> + Send + 'a {
        let result = self
            .entries
            .read()
            .map(|entries| entries.get(key).cloned())
            .map_err(|_| LockPoisoned);
        std::future::ready(result)
    }

    fn save(&self, key: K, value: V) -> impl Future<Output = Result<(), Self::Error>> + Send + '_ {
        let result = self
            .entries
            .write()
            .map(|mut entries| {
                entries.insert(key, value);
            })
            .map_err(|_| LockPoisoned);
        std::future::ready(result)
    }

    fn delete<'a>(
        &'a self,
        key: &'a K,
    ) -> impl Future<Output = Result<(), Self::Error>> + Send + 'a {
        let result = self
            .entries
            .write()
            .map(|mut entries| {
                entries.remove(key);
            })
            .map_err(|_| LockPoisoned);
        std::future::ready(result)
    }

    fn clear(&self) -> impl Future<Output = Result<(), Self::Error>> + Send + '_ {
        let result = self
            .entries
            .write()
            .map(|mut entries| entries.clear())
            .map_err(|_| LockPoisoned);
        std::future::ready(result)
    }
}

#[derive(Clone, Debug, Default)]
struct PositionEntry {
    position: Option<u64>,
    schema_hash: Option<String>,
    rebuild_target: Option<u64>,
}

/// Hash-map backed [`ProjectionPositionStore`].
#[derive(Clone, Debug, Default)]
pub struct InMemoryPositions {
    entries: Arc<RwLock<HashMap<String, PositionEntry>>>,
}

impl InMemoryPositions {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn read<T>(&self, projection: &str, f: impl FnOnce(&PositionEntry) -> T) -> Result<Option<T>, LockPoisoned> {
        let entries = self.entries.read().map_err(|_| LockPoisoned)?;
        Ok(entries.get(projection).map(f))
    }

    fn write(&self, projection: &str, f: impl FnOnce(&mut PositionEntry)) -> Result<(), LockPoisoned> {
        let mut entries = self.entries.write().map_err(|_| LockPoisoned)?;
        f(entries.entry(projection.to_string()).or_default());
        Ok(())
    }
}

impl ProjectionPositionStore for InMemoryPositions {
    type Error = LockPoisoned;

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
        std::future::ready(self.write(projection, |entry| entry.position = Some(position)))
    }

    fn reset_position<'a>(
        &'a self,
        projection: &'a str,
    ) -> impl Future<Output = Result<(), Self::Error>> + Send + 'a {
        std::future::ready(self.write(projection, |entry| entry.position = None))
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
        std::future::ready(self.write(projection, |entry| {
            entry.schema_hash = Some(hash.to_string());
        }))
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
        std::future::ready(self.write(projection, |entry| entry.rebuild_target = target))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn read_models_roundtrip_and_clear() {
        let store = InMemoryReadModels::<String, u32>::new();
        let handle = store.clone();
        store.save("a".to_string(), 1).await.unwrap();
        store.save("b".to_string(), 2).await.unwrap();
        assert_eq!(handle.load(&"a".to_string()).await.unwrap(), Some(1));

        store.delete(&"a".to_string()).await.unwrap();
        store.delete(&"missing".to_string()).await.unwrap();
        assert_eq!(handle.load(&"a".to_string()).await.unwrap(), None);
        assert_eq!(handle.len().unwrap(), 1);

        store.clear().await.unwrap();
        assert!(handle.is_empty().unwrap());
    }

    #[tokio::test]
    async fn positions_track_checkpoint_and_hash_independently() {
        let positions = InMemoryPositions::new();
        assert_eq!(positions.load_position("p").await.unwrap(), None);
        assert_eq!(positions.load_schema_hash("p").await.unwrap(), None);

        positions.save_position("p", 0).await.unwrap();
        positions.save_schema_hash("p", "abc").await.unwrap();
        assert_eq!(positions.load_position("p").await.unwrap(), Some(0));

        positions.reset_position("p").await.unwrap();
        assert_eq!(positions.load_position("p").await.unwrap(), None);
        assert_eq!(
            positions.load_schema_hash("p").await.unwrap().as_deref(),
            Some("abc")
        );
        assert_eq!(positions.load_position("other").await.unwrap(), None);

        positions.save_rebuild_target("p", Some(9)).await.unwrap();
        assert_eq!(positions.load_rebuild_target("p").await.unwrap(), Some(9));
        positions.save_rebuild_target("p", None).await.unwrap();
        assert_eq!(positions.load_rebuild_target("p").await.unwrap(), None);
    }
}
