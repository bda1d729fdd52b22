//! parcela - Out-of-core access to partitioned Parquet datasets
//!
//! Profiles, preps and streams training batches from tabular datasets that
//! are split into many Parquet files ("pieces") on local disk or in object
//! storage, without ever loading the whole dataset.
//!
//! # Design Principles
//!
//! 1. **Sample, don't scan** - statistics come from one bounded repr sample
//! 2. **Transforms are values** - every fitted transform serializes to JSON
//!    plus an equivalent SQL statement, so training and serving agree
//! 3. **Immutable handles** - every operation returns a new
//!    [`FileDataset`] sharing caches where that is sound
//! 4. **Replicable generators** - a [`GeneratorSpec`] rebuilds the same
//!    [`BatchGenerator`] on any worker
//!
//! # Quick Start
//!
//! ```no_run
//! use parcela::{ColumnGroup, DatasetRoot, FileDataset, GeneratorOptions, LoadOptions, PrepOptions};
//!
//! # fn main() -> parcela::Result<()> {
//! let options = LoadOptions::default().with_time_col(Some("ts"));
//! let dataset = FileDataset::load(DatasetRoot::local("data/"), options)?;
//!
//! let (prepped, spec) = dataset.prep(&[], &PrepOptions::default().save_to("prep/"))?;
//! let features = spec.output_columns();
//!
//! let batches = prepped.generator(
//!     &GeneratorOptions::default()
//!         .group(ColumnGroup::windowed(features, -3, 0))
//!         .batch_size(256),
//! )?;
//! for batch in batches.take(10) {
//!     println!("{:?}", batch?[0].shape());
//! }
//! # Ok(())
//! # }
//! ```

#![deny(unsafe_code)]
#![deny(missing_docs)]
#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
// Allow common test patterns
#![cfg_attr(
    test,
    allow(
        clippy::unwrap_used,
        clippy::expect_used,
        clippy::cast_lossless,
        clippy::cast_possible_truncation,
        clippy::cast_possible_wrap,
        clippy::cast_precision_loss,
        clippy::redundant_clone,
        clippy::needless_collect,
        clippy::too_many_lines,
        clippy::float_cmp,
        clippy::similar_names,
        clippy::unreadable_literal
    )
)]
#![allow(clippy::doc_markdown)]
#![allow(clippy::uninlined_format_args)]
#![allow(clippy::redundant_closure_for_method_calls)]
#![allow(clippy::map_unwrap_or)]
#![allow(clippy::module_name_repetitions)]

pub mod backend;
pub mod config;
pub mod dataset;
pub mod error;
pub mod generator;
pub mod parallel;
pub mod prep;
pub mod registry;
pub mod retry;
pub mod sampling;
pub mod stats;
pub mod timeaux;
pub mod transform;

pub use arrow::{
    array::RecordBatch,
    datatypes::{Schema, SchemaRef},
};
pub use backend::{CredentialSource, LocalBackend, MemoryBackend, StorageBackend};
#[cfg(feature = "s3")]
pub use backend::S3Backend;
pub use config::{LoadOptions, PerColumn};
pub use dataset::{FileDataset, MapOptions, PartitionFilter};
pub use error::{Error, Result};
pub use generator::{
    Batch, BatchArray, BatchGenerator, ColumnGroup, GeneratorOptions, GeneratorSpec, RangeFilter,
};
pub use parallel::ParallelGenerator;
pub use prep::{FillOptions, FillRule, PrepOptions, PrepSpec, Scaler};
pub use registry::{
    DatasetRoot, PartitionKvs, PartitionValue, PieceCache, PieceMeta, PieceRegistry,
};
pub use retry::RetryPolicy;
pub use sampling::RowSampler;
pub use stats::{ColumnProfile, SampleStat, StatsCache, Tail};
pub use transform::{
    Cast, CastType, Drop, EncodeCategory, FillMethod, FillWindow, Map, Mapper, NullFillSpec,
    Pipeline, Rename, Scale, ScalerParams, Select, Transform,
};
