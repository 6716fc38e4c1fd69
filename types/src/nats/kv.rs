use core::fmt::{Debug, Formatter, Result as FmtResult};
use std::marker::PhantomData;

use anyhow::{Context as _, Error as AnyError, Result as AnyResult};
use async_nats::jetstream::kv;
use bytes::Bytes;
use futures::{Stream, StreamExt};
use once_cell::sync::OnceCell;
use serde::{de::DeserializeOwned, Serialize};
use thiserror::Error;
use time::OffsetDateTime;

pub use async_nats::jetstream::kv::Operation;

/// Wildcard matching every key in a bucket.
const ALL_KEYS: &str = ">";

#[derive(Error, Debug)]
pub enum DecodeError {
    #[error("failed to decode entry value as json: {0}")]
    Json(String),
}

/// A single bucket entry as delivered by a get or a watch.
///
/// The value is decoded lazily on first access and the outcome is
/// memoized, including a decode failure.
pub struct Entry<T> {
    bucket:    String,
    key:       String,
    raw:       Bytes,
    revision:  u64,
    delta:     u64,
    created:   OffsetDateTime,
    operation: Operation,
    decoded:   OnceCell<Result<T, String>>,
}

impl<T> Entry<T> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        bucket: String,
        key: String,
        raw: Bytes,
        revision: u64,
        delta: u64,
        created: OffsetDateTime,
        operation: Operation,
    ) -> Self {
        Self {
            bucket,
            key,
            raw,
            revision,
            delta,
            created,
            operation,
            decoded: OnceCell::new(),
        }
    }

    fn from_kv(entry: kv::Entry) -> Self {
        Self::new(
            entry.bucket,
            entry.key,
            entry.value,
            entry.revision,
            entry.delta,
            entry.created,
            entry.operation,
        )
    }

    pub fn bucket(&self) -> &str {
        &self.bucket
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn raw(&self) -> &[u8] {
        &self.raw
    }

    pub const fn revision(&self) -> u64 {
        self.revision
    }

    pub const fn delta(&self) -> u64 {
        self.delta
    }

    pub const fn created(&self) -> OffsetDateTime {
        self.created
    }

    pub const fn operation(&self) -> Operation {
        self.operation
    }
}

impl<T: DeserializeOwned> Entry<T> {
    /// Decode the value, memoizing the result.
    pub fn value(&self) -> Result<&T, DecodeError> {
        self.decoded
            .get_or_init(|| serde_json::from_slice(&self.raw).map_err(|err| err.to_string()))
            .as_ref()
            .map_err(|err| DecodeError::Json(err.clone()))
    }
}

impl<T> Debug for Entry<T> {
    fn fmt(&self, fmt: &mut Formatter) -> FmtResult {
        fmt.debug_struct("Entry")
            .field("bucket", &self.bucket)
            .field("key", &self.key)
            .field("revision", &self.revision)
            .field("operation", &self.operation)
            .finish()
    }
}

/// A KV bucket with values of a single JSON-encoded type.
pub struct TypedKv<T> {
    store:   kv::Store,
    phantom: PhantomData<T>,
}

impl<T> Clone for TypedKv<T> {
    fn clone(&self) -> Self {
        Self {
            store:   self.store.clone(),
            phantom: PhantomData,
        }
    }
}

impl<T> Debug for TypedKv<T> {
    fn fmt(&self, fmt: &mut Formatter) -> FmtResult {
        fmt.debug_tuple("TypedKv").finish()
    }
}

impl<T: Serialize + DeserializeOwned + Send + Sync> TypedKv<T> {
    pub(crate) fn new(store: kv::Store) -> Self {
        Self {
            store,
            phantom: PhantomData,
        }
    }

    pub async fn get(&self, key: &str) -> AnyResult<Option<Entry<T>>> {
        let entry = self
            .store
            .entry(key)
            .await
            .with_context(|| format!("failed to get entry for key = {}", key))?;
        Ok(entry.map(Entry::from_kv))
    }

    /// Store `value` under `key`, returning the new revision.
    pub async fn put(&self, key: &str, value: &T) -> AnyResult<u64> {
        let bytes = serde_json::to_vec(value).context("failed to encode value to json")?;
        let revision = self
            .store
            .put(key, bytes.into())
            .await
            .with_context(|| format!("failed to put key = {}", key))?;
        Ok(revision)
    }

    pub async fn delete(&self, key: &str) -> AnyResult<()> {
        self.store
            .delete(key)
            .await
            .with_context(|| format!("failed to delete key = {}", key))?;
        Ok(())
    }

    pub async fn purge(&self, key: &str) -> AnyResult<()> {
        self.store
            .purge(key)
            .await
            .with_context(|| format!("failed to purge key = {}", key))?;
        Ok(())
    }

    /// Live updates for a single key.
    pub async fn watch(&self, key: &str) -> AnyResult<impl Stream<Item = AnyResult<Entry<T>>> + Send> {
        let watch = self
            .store
            .watch(key)
            .await
            .with_context(|| format!("failed to watch key = {}", key))?;
        Ok(watch.map(|entry| entry.map(Entry::from_kv).map_err(AnyError::from)))
    }

    /// Live updates for every key in the bucket.
    pub async fn watch_all(&self) -> AnyResult<impl Stream<Item = AnyResult<Entry<T>>> + Send> {
        self.watch(ALL_KEYS).await
    }

    /// Current values for every key, followed by live updates.
    pub async fn watch_all_with_history(
        &self,
    ) -> AnyResult<impl Stream<Item = AnyResult<Entry<T>>> + Send> {
        let watch = self
            .store
            .watch_with_history(ALL_KEYS)
            .await
            .context("failed to watch bucket with history")?;
        Ok(watch.map(|entry| entry.map(Entry::from_kv).map_err(AnyError::from)))
    }
}
