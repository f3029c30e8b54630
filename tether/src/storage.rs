//! Browser-local key/value storage
//!
//! These stores model the origin-scoped storage shared by every browsing
//! context of the application. Values are opaque strings.

use async_trait::async_trait;
use std::{io, sync::Arc};
use thiserror::Error;

#[cfg(feature = "file")]
pub mod file;
pub mod memory;

#[cfg(feature = "file")]
pub use file::FileStorage;
pub use memory::MemoryStorage;

/// An error while accessing storage
#[derive(Debug, Error)]
pub enum StorageError {
    /// The storage cannot be used at all, such as in a private browsing mode
    #[error("storage is unavailable")]
    Unavailable,
    /// An I/O error from the underlying medium
    #[error("error accessing storage medium")]
    Io(#[from] io::Error),
}

/// Origin-scoped asynchronous key/value storage
#[async_trait]
pub trait KeyValueStorage: Send + Sync {
    /// Reads the value stored under `key`, if any
    async fn get(&self, key: &str) -> Result<Option<String>, StorageError>;

    /// Stores `value` under `key`, replacing any previous value
    async fn set(&self, key: &str, value: &str) -> Result<(), StorageError>;

    /// Removes any value stored under `key`
    async fn remove(&self, key: &str) -> Result<(), StorageError>;
}

#[async_trait]
impl<S: KeyValueStorage + ?Sized> KeyValueStorage for Arc<S> {
    async fn get(&self, key: &str) -> Result<Option<String>, StorageError> {
        (**self).get(key).await
    }

    async fn set(&self, key: &str, value: &str) -> Result<(), StorageError> {
        (**self).set(key, value).await
    }

    async fn remove(&self, key: &str) -> Result<(), StorageError> {
        (**self).remove(key).await
    }
}
