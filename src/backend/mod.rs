//! Storage backends for dataset pieces.
//!
//! A [`StorageBackend`] is the object-store view of a dataset root: pieces
//! are listed and fetched as whole objects. Local roots are read in place;
//! object-store pieces are downloaded once into a local cache directory (see
//! [`crate::registry`]).

pub mod local;
pub mod memory;
#[cfg(feature = "s3")]
pub mod s3;

use bytes::Bytes;
pub use local::LocalBackend;
pub use memory::MemoryBackend;
#[cfg(feature = "s3")]
pub use s3::S3Backend;
use serde::{Deserialize, Serialize};

use crate::error::Result;

/// A storage backend for reading and writing whole objects.
pub trait StorageBackend: Send + Sync {
    /// Lists all keys with the given prefix, relative to the backend root.
    ///
    /// # Errors
    ///
    /// Returns an error if the listing operation fails.
    fn list(&self, prefix: &str) -> Result<Vec<String>>;

    /// Reads data from the given key.
    ///
    /// # Errors
    ///
    /// Returns an error if the key does not exist or cannot be read.
    fn get(&self, key: &str) -> Result<Bytes>;

    /// Writes data to the given key, creating parent prefixes as needed.
    ///
    /// # Errors
    ///
    /// Returns an error if the write fails.
    fn put(&self, key: &str, data: Bytes) -> Result<()>;

    /// Deletes the given key.
    ///
    /// # Errors
    ///
    /// Returns an error if the key cannot be deleted.
    fn delete(&self, key: &str) -> Result<()>;

    /// Checks if the given key exists.
    ///
    /// # Errors
    ///
    /// Returns an error if the existence check fails.
    fn exists(&self, key: &str) -> Result<bool>;

    /// Returns the size of the data at the given key in bytes.
    ///
    /// # Errors
    ///
    /// Returns an error if the key does not exist.
    fn size(&self, key: &str) -> Result<u64>;
}

/// Credentials for object-store access.
///
/// Object-store sessions are cached per credential pair, so two datasets
/// with the same keys share one client.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(tag = "source", rename_all = "snake_case")]
pub enum CredentialSource {
    /// Use the default provider chain (environment variables, config files).
    #[default]
    Environment,
    /// Use static credentials.
    Static {
        /// Access key ID.
        access_key: String,
        /// Secret access key.
        secret_key: String,
    },
    /// Anonymous/public access.
    Anonymous,
}
