//! Piece registry: discovery, partition keys, metadata and local access.
//!
//! A dataset root is a local directory (or list of paths), an S3 prefix, or
//! any [`StorageBackend`] prefix. Every data file under it is a *piece*,
//! identified by its path string. Object-store pieces are downloaded on
//! first read into `cache_dir/netloc/key`; the mapping lives in the shared
//! [`PieceCache`] so every handle and generator on the same cache reuses it.

mod cache;
pub mod partition;

use std::{
    collections::BTreeMap,
    fmt,
    path::{Path, PathBuf},
    sync::Arc,
};

use arrow::{
    array::RecordBatch,
    compute::concat_batches,
    record_batch::RecordBatchReader,
};
pub use cache::{PieceCache, PieceMeta};
use parquet::arrow::{arrow_reader::ParquetRecordBatchReaderBuilder, ProjectionMask};
pub use partition::{
    attach_partition_columns, parse_partition_kvs, PartitionKvs, PartitionValue,
    DATE_PARTITION_KEY,
};
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::{
    backend::{CredentialSource, LocalBackend, StorageBackend},
    config::LoadOptions,
    error::{Error, Result},
    retry::RetryPolicy,
};

const STORE_SCHEME: &str = "store";

/// Where a dataset's pieces live.
#[derive(Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DatasetRoot {
    /// Local files or directories.
    Local {
        /// Files and/or directories; directories are walked recursively.
        paths: Vec<PathBuf>,
    },
    /// An S3 (or S3-compatible) prefix. Needs the `s3` feature at runtime.
    S3 {
        /// Bucket name.
        bucket: String,
        /// Key prefix, without leading slash.
        prefix: String,
        /// Region.
        region: String,
        /// Custom endpoint for S3-compatible stores.
        #[serde(default)]
        endpoint: Option<String>,
        /// Credentials.
        #[serde(default)]
        credentials: CredentialSource,
    },
    /// An arbitrary in-process object store. Cannot be serialized.
    #[serde(skip)]
    Store {
        /// The backend holding the pieces.
        store: Arc<dyn StorageBackend>,
        /// Name used as the network location in piece paths.
        netloc: String,
        /// Key prefix.
        prefix: String,
    },
}

impl fmt::Debug for DatasetRoot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Local { paths } => f.debug_struct("Local").field("paths", paths).finish(),
            Self::S3 {
                bucket,
                prefix,
                region,
                endpoint,
                ..
            } => f
                .debug_struct("S3")
                .field("bucket", bucket)
                .field("prefix", prefix)
                .field("region", region)
                .field("endpoint", endpoint)
                .finish_non_exhaustive(),
            Self::Store { netloc, prefix, .. } => f
                .debug_struct("Store")
                .field("netloc", netloc)
                .field("prefix", prefix)
                .finish_non_exhaustive(),
        }
    }
}

impl DatasetRoot {
    /// A single local file or directory.
    pub fn local(path: impl Into<PathBuf>) -> Self {
        Self::Local {
            paths: vec![path.into()],
        }
    }

    /// Several local files or directories.
    pub fn local_paths<P: Into<PathBuf>>(paths: impl IntoIterator<Item = P>) -> Self {
        Self::Local {
            paths: paths.into_iter().map(Into::into).collect(),
        }
    }

    /// An S3 prefix.
    pub fn s3(
        bucket: impl Into<String>,
        prefix: impl Into<String>,
        region: impl Into<String>,
        credentials: CredentialSource,
    ) -> Self {
        Self::S3 {
            bucket: bucket.into(),
            prefix: prefix.into().trim_start_matches('/').to_string(),
            region: region.into(),
            endpoint: None,
            credentials,
        }
    }

    /// A prefix on an in-process object store.
    pub fn store(
        store: Arc<dyn StorageBackend>,
        netloc: impl Into<String>,
        prefix: impl Into<String>,
    ) -> Self {
        Self::Store {
            store,
            netloc: netloc.into(),
            prefix: prefix.into().trim_start_matches('/').to_string(),
        }
    }

    /// Parses `s3://bucket/prefix` (region from `AWS_REGION`, else
    /// `us-east-1`) or a local path.
    pub fn parse(location: &str, credentials: CredentialSource) -> Self {
        match location.strip_prefix("s3://") {
            Some(rest) => {
                let (bucket, prefix) = rest.split_once('/').unwrap_or((rest, ""));
                let region =
                    std::env::var("AWS_REGION").unwrap_or_else(|_| "us-east-1".to_string());
                Self::s3(bucket, prefix, region, credentials)
            }
            None => Self::local(location),
        }
    }

    fn scheme_and_netloc(&self) -> Option<(&'static str, &str)> {
        match self {
            Self::Local { .. } => None,
            Self::S3 { bucket, .. } => Some(("s3", bucket)),
            Self::Store { netloc, .. } => Some((STORE_SCHEME, netloc)),
        }
    }
}

/// Resolves pieces of one dataset root against a shared [`PieceCache`].
pub struct PieceRegistry {
    root: DatasetRoot,
    store: Option<Arc<dyn StorageBackend>>,
    cache: Arc<PieceCache>,
    cache_dir: PathBuf,
    retry: RetryPolicy,
}

impl fmt::Debug for PieceRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PieceRegistry")
            .field("root", &self.root)
            .field("cache_dir", &self.cache_dir)
            .field("retry", &self.retry)
            .finish_non_exhaustive()
    }
}

impl PieceRegistry {
    /// Creates a registry, connecting to object storage if needed.
    ///
    /// # Errors
    ///
    /// Returns an error if an S3 root is used without the `s3` feature or
    /// the session cannot be created.
    pub fn new(root: DatasetRoot, cache: Arc<PieceCache>, options: &LoadOptions) -> Result<Self> {
        let store = Self::connect(&root, &cache)?;
        Ok(Self {
            root,
            store,
            cache,
            cache_dir: options.cache_dir.clone(),
            retry: options.retry,
        })
    }

    #[cfg(feature = "s3")]
    fn connect(root: &DatasetRoot, cache: &PieceCache) -> Result<Option<Arc<dyn StorageBackend>>> {
        match root {
            DatasetRoot::Local { .. } => Ok(None),
            DatasetRoot::S3 {
                bucket,
                region,
                endpoint,
                credentials,
                ..
            } => {
                let session = cache.s3_session(region, endpoint.as_deref(), credentials)?;
                Ok(Some(Arc::new(crate::backend::S3Backend::new(
                    session, bucket,
                ))))
            }
            DatasetRoot::Store { store, .. } => Ok(Some(Arc::clone(store))),
        }
    }

    #[cfg(not(feature = "s3"))]
    fn connect(root: &DatasetRoot, _cache: &PieceCache) -> Result<Option<Arc<dyn StorageBackend>>> {
        match root {
            DatasetRoot::Local { .. } => Ok(None),
            DatasetRoot::S3 { .. } => Err(Error::invalid_config(
                "S3 dataset roots require the 's3' feature",
            )),
            DatasetRoot::Store { store, .. } => Ok(Some(Arc::clone(store))),
        }
    }

    /// The dataset root.
    pub fn root(&self) -> &DatasetRoot {
        &self.root
    }

    /// The shared piece cache.
    pub fn cache(&self) -> &Arc<PieceCache> {
        &self.cache
    }

    /// The retry policy used for piece I/O.
    pub fn retry(&self) -> RetryPolicy {
        self.retry
    }

    /// Lists every piece under the root with its partition key/values,
    /// ordered by piece path.
    ///
    /// # Errors
    ///
    /// Returns an error if listing fails or the root holds no piece.
    pub fn discover(&self) -> Result<BTreeMap<String, PartitionKvs>> {
        let mut pieces = BTreeMap::new();
        match &self.root {
            DatasetRoot::Local { paths } => {
                for path in paths {
                    if path.is_file() {
                        let piece = path.to_string_lossy().into_owned();
                        pieces.insert(piece.clone(), parse_partition_kvs(&piece));
                        continue;
                    }
                    let backend = LocalBackend::open(path)?;
                    for key in backend.list("")? {
                        if is_data_file(&key) {
                            let piece = backend.resolve_path(&key).to_string_lossy().into_owned();
                            let kvs = parse_partition_kvs(&piece);
                            pieces.insert(piece, kvs);
                        }
                    }
                }
            }
            DatasetRoot::S3 { prefix, .. } | DatasetRoot::Store { prefix, .. } => {
                let store = self.remote_store()?;
                let (scheme, netloc) = self.root.scheme_and_netloc().unwrap_or(("", ""));
                for key in store.list(prefix)? {
                    if is_data_file(&key) {
                        let piece = format!("{scheme}://{netloc}/{key}");
                        let kvs = parse_partition_kvs(&piece);
                        pieces.insert(piece, kvs);
                    }
                }
            }
        }

        if pieces.is_empty() {
            return Err(Error::EmptyDataset);
        }
        tracing::info!(root = ?self.root, pieces = pieces.len(), "discovered pieces");
        Ok(pieces)
    }

    /// Returns a local path for `piece`, downloading it on first use.
    ///
    /// # Errors
    ///
    /// Returns [`Error::PieceUnavailable`] if the download keeps failing.
    pub fn local_path(&self, piece: &str) -> Result<PathBuf> {
        let Some((scheme, netloc)) = self.root.scheme_and_netloc() else {
            return Ok(PathBuf::from(piece));
        };
        if let Some(path) = self.cache.local_path(piece) {
            if path.exists() {
                return Ok(path);
            }
        }

        let key = piece
            .strip_prefix(&format!("{scheme}://{netloc}/"))
            .ok_or_else(|| Error::storage(format!("Piece '{piece}' is not under {netloc}")))?;
        let store = self.remote_store()?;
        let data = self.retry.run(piece, || store.get(key))?;

        let cache_backend = LocalBackend::new(&self.cache_dir)?;
        let relative = format!("{netloc}/{key}");
        cache_backend.put(&relative, data)?;
        let path = cache_backend.resolve_path(&relative);
        tracing::info!(piece, path = %path.display(), "downloaded piece");
        self.cache.remember_local_path(piece, path.clone());
        Ok(path)
    }

    /// Schema and row count of `piece`, from file metadata only; cached.
    ///
    /// # Errors
    ///
    /// Returns an error if the piece cannot be fetched or is not Parquet.
    pub fn schema_and_row_count(&self, piece: &str) -> Result<Arc<PieceMeta>> {
        self.cache.metadata_or_read(piece, || {
            let path = self.local_path(piece)?;
            self.retry.run(piece, || read_metadata(&path))
        })
    }

    /// Decodes a whole piece, optionally restricted to `columns`.
    ///
    /// Requested columns absent from the file (partition keys, derived
    /// columns) are ignored here.
    ///
    /// # Errors
    ///
    /// Returns [`Error::PieceUnavailable`] if fetching or decoding keeps
    /// failing.
    pub fn read_piece(&self, piece: &str, columns: Option<&[String]>) -> Result<RecordBatch> {
        let path = self.local_path(piece)?;
        self.retry.run(piece, || read_parquet(&path, columns))
    }

    /// Decodes a piece and returns one random aligned chunk of at most
    /// `chunk_size` rows.
    ///
    /// # Errors
    ///
    /// See [`PieceRegistry::read_piece`].
    pub fn read_chunk<R: Rng + ?Sized>(
        &self,
        piece: &str,
        chunk_size: usize,
        rng: &mut R,
    ) -> Result<RecordBatch> {
        let batch = self.read_piece(piece, None)?;
        Ok(random_chunk(&batch, chunk_size, rng))
    }

    fn remote_store(&self) -> Result<&Arc<dyn StorageBackend>> {
        self.store
            .as_ref()
            .ok_or_else(|| Error::storage("Dataset root has no object store"))
    }
}

/// Picks one of the `ceil(rows / chunk_size)` aligned chunks uniformly.
pub(crate) fn random_chunk<R: Rng + ?Sized>(
    batch: &RecordBatch,
    chunk_size: usize,
    rng: &mut R,
) -> RecordBatch {
    let rows = batch.num_rows();
    let chunk_size = chunk_size.max(1);
    if rows <= chunk_size {
        return batch.clone();
    }
    let n_chunks = rows.div_ceil(chunk_size);
    let start = rng.gen_range(0..n_chunks) * chunk_size;
    batch.slice(start, chunk_size.min(rows - start))
}

fn is_data_file(key: &str) -> bool {
    let name = key.rsplit('/').next().unwrap_or(key);
    !name.is_empty() && !name.starts_with('.') && !name.starts_with('_')
}

fn read_metadata(path: &Path) -> Result<PieceMeta> {
    let file = std::fs::File::open(path).map_err(|e| Error::io(e, path))?;
    let builder = ParquetRecordBatchReaderBuilder::try_new(file)?;
    let rows = builder.metadata().file_metadata().num_rows();
    Ok(PieceMeta::new(
        Arc::clone(builder.schema()),
        usize::try_from(rows).unwrap_or(0),
    ))
}

fn read_parquet(path: &Path, columns: Option<&[String]>) -> Result<RecordBatch> {
    let file = std::fs::File::open(path).map_err(|e| Error::io(e, path))?;
    let mut builder = ParquetRecordBatchReaderBuilder::try_new(file)?;

    if let Some(columns) = columns {
        let schema = Arc::clone(builder.schema());
        let indices: Vec<usize> = schema
            .fields()
            .iter()
            .enumerate()
            .filter(|(_, f)| columns.iter().any(|c| c == f.name()))
            .map(|(i, _)| i)
            .collect();
        let mask = ProjectionMask::roots(builder.parquet_schema(), indices);
        builder = builder.with_projection(mask);
    }

    let reader = builder.build()?;
    let schema = reader.schema();
    let batches = reader.collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(concat_batches(&schema, &batches)?)
}
