//! Process-wide cache of piece metadata and local download paths.

use std::{
    collections::HashMap,
    path::PathBuf,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
};

use arrow::datatypes::{DataType, SchemaRef};
use once_cell::sync::Lazy;
use parking_lot::RwLock;

#[cfg(feature = "s3")]
use crate::backend::{s3::S3Session, CredentialSource};
use crate::error::Result;

/// Schema and row count of one piece, read from file metadata only.
#[derive(Debug, Clone, PartialEq)]
pub struct PieceMeta {
    schema: SchemaRef,
    num_rows: usize,
}

impl PieceMeta {
    /// Creates metadata from a file schema and row count.
    pub fn new(schema: SchemaRef, num_rows: usize) -> Self {
        Self { schema, num_rows }
    }

    /// The file schema (partition-key columns excluded).
    pub fn schema(&self) -> &SchemaRef {
        &self.schema
    }

    /// Column names in file order.
    pub fn columns(&self) -> Vec<String> {
        self.schema.fields().iter().map(|f| f.name().clone()).collect()
    }

    /// Column types in file order.
    pub fn types(&self) -> Vec<DataType> {
        self.schema
            .fields()
            .iter()
            .map(|f| f.data_type().clone())
            .collect()
    }

    /// Number of rows in the piece.
    pub fn num_rows(&self) -> usize {
        self.num_rows
    }
}

#[cfg(feature = "s3")]
type SessionKey = (String, Option<String>, CredentialSource);

static GLOBAL: Lazy<Arc<PieceCache>> = Lazy::new(|| Arc::new(PieceCache::new()));

/// Metadata, download-path and client-session cache keyed by piece path.
///
/// Entries are append-only and idempotent. Two threads racing on the same
/// key both compute the value and the last insert wins; both values are
/// identical, so readers never observe a conflict.
///
/// Dataset handles share the [`PieceCache::global`] instance by default;
/// tests pass a fresh one for isolation.
#[derive(Debug, Default)]
pub struct PieceCache {
    meta: RwLock<HashMap<String, Arc<PieceMeta>>>,
    local_paths: RwLock<HashMap<String, PathBuf>>,
    #[cfg(feature = "s3")]
    sessions: RwLock<HashMap<SessionKey, Arc<S3Session>>>,
    metadata_reads: AtomicUsize,
    downloads: AtomicUsize,
}

impl PieceCache {
    /// Creates an empty cache.
    pub fn new() -> Self {
        Self::default()
    }

    /// The process-wide shared cache.
    pub fn global() -> Arc<Self> {
        Arc::clone(&GLOBAL)
    }

    /// Returns cached metadata for `piece`, if any.
    pub fn metadata(&self, piece: &str) -> Option<Arc<PieceMeta>> {
        self.meta.read().get(piece).cloned()
    }

    /// Returns cached metadata for `piece`, reading it with `read` on a miss.
    ///
    /// `read` runs without holding the lock.
    ///
    /// # Errors
    ///
    /// Propagates the error from `read`.
    pub fn metadata_or_read(
        &self,
        piece: &str,
        read: impl FnOnce() -> Result<PieceMeta>,
    ) -> Result<Arc<PieceMeta>> {
        if let Some(meta) = self.metadata(piece) {
            return Ok(meta);
        }
        let meta = Arc::new(read()?);
        self.metadata_reads.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(piece, rows = meta.num_rows(), "cached piece metadata");
        self.meta
            .write()
            .insert(piece.to_string(), Arc::clone(&meta));
        Ok(meta)
    }

    /// Returns the local path a remote piece was downloaded to.
    pub fn local_path(&self, piece: &str) -> Option<PathBuf> {
        self.local_paths.read().get(piece).cloned()
    }

    /// Records the local path of a downloaded remote piece.
    pub fn remember_local_path(&self, piece: &str, path: PathBuf) {
        self.downloads.fetch_add(1, Ordering::Relaxed);
        self.local_paths.write().insert(piece.to_string(), path);
    }

    /// How many metadata reads missed the cache.
    pub fn metadata_reads(&self) -> usize {
        self.metadata_reads.load(Ordering::Relaxed)
    }

    /// How many pieces were downloaded.
    pub fn downloads(&self) -> usize {
        self.downloads.load(Ordering::Relaxed)
    }

    /// Number of pieces with cached metadata.
    pub fn len(&self) -> usize {
        self.meta.read().len()
    }

    /// Returns true if no metadata is cached.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns the session for a credential pair, connecting on first use.
    ///
    /// # Errors
    ///
    /// Returns an error if a new session cannot be connected.
    #[cfg(feature = "s3")]
    pub fn s3_session(
        &self,
        region: &str,
        endpoint: Option<&str>,
        credentials: &CredentialSource,
    ) -> Result<Arc<S3Session>> {
        let key = (
            region.to_string(),
            endpoint.map(str::to_string),
            credentials.clone(),
        );
        if let Some(session) = self.sessions.read().get(&key) {
            return Ok(Arc::clone(session));
        }
        let session = S3Session::connect(region, endpoint, credentials)?;
        self.sessions.write().insert(key, Arc::clone(&session));
        Ok(session)
    }
}
