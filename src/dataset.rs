//! The dataset façade.
//!
//! A [`FileDataset`] is an immutable handle over a set of Parquet pieces plus
//! a mapper chain. Every operation that changes what the handle describes
//! returns a new handle; handles share the piece registry and, where a
//! transform provably leaves columns untouched, their statistics.
//!
//! # Example
//!
//! ```ignore
//! use parcela::{DatasetRoot, FileDataset, LoadOptions, PrepOptions};
//!
//! let ds = FileDataset::load(DatasetRoot::local("data/"), LoadOptions::default())?;
//! let (prepped, _spec) = ds.prep(&[], &PrepOptions::default())?;
//! let table = prepped.collect(None)?;
//! ```

use std::{
    collections::{BTreeMap, BTreeSet, HashMap},
    fmt,
    sync::Arc,
};

use arrow::{
    array::{new_null_array, ArrayRef, RecordBatch},
    compute::{cast, concat_batches},
    datatypes::{DataType, Field, Schema, SchemaRef},
};
use rand::{rngs::StdRng, seq::index, Rng, SeedableRng};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::{
    config::LoadOptions,
    error::{Error, Result},
    generator::{BatchGenerator, GeneratorOptions},
    parallel::ParallelGenerator,
    prep::{FillOptions, PrepOptions, PrepSpec},
    registry::{
        parse_partition_kvs, DatasetRoot, PartitionKvs, PieceCache, PieceRegistry,
        DATE_PARTITION_KEY,
    },
    sampling::{split_pieces, RowSampler},
    stats::StatsCache,
    timeaux,
    transform::{Cast, CastType, Drop, Mapper, NullFillSpec, Pipeline, Rename, Select, Transform},
};

/// How a mapped handle relates to its parent's statistics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct MapOptions {
    /// Copy cached statistics of columns the mapper leaves unchanged.
    pub inherit_cache: bool,
    /// Keep the parent's row counts; only honored for row-preserving
    /// mappers, and taken as a promise of row preservation by custom ones.
    pub inherit_n_rows: bool,
}

impl MapOptions {
    /// Inherit both column statistics and row counts.
    pub fn inherit() -> Self {
        Self {
            inherit_cache: true,
            inherit_n_rows: true,
        }
    }
}

/// A condition on one partition key, evaluated on path metadata only.
///
/// Values compare as strings, so dates compare in `YYYY-MM-DD` order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PartitionFilter {
    /// Value is one of the given strings.
    In(String, BTreeSet<String>),
    /// Value lies within the inclusive bounds; an absent bound is open.
    Between(String, Option<String>, Option<String>),
}

impl PartitionFilter {
    /// Keeps pieces whose `key` equals one of `values`.
    pub fn one_of<S: Into<String>>(key: impl Into<String>, values: impl IntoIterator<Item = S>) -> Self {
        Self::In(key.into(), values.into_iter().map(Into::into).collect())
    }

    /// Keeps pieces whose `key` lies within `[from, to]`.
    pub fn between(key: impl Into<String>, from: Option<&str>, to: Option<&str>) -> Self {
        Self::Between(key.into(), from.map(str::to_string), to.map(str::to_string))
    }

    fn key(&self) -> &str {
        match self {
            Self::In(key, _) | Self::Between(key, _, _) => key,
        }
    }

    fn matches(&self, kvs: &PartitionKvs) -> bool {
        let Some(value) = kvs.get(self.key()).map(ToString::to_string) else {
            return false;
        };
        match self {
            Self::In(_, values) => values.contains(&value),
            Self::Between(_, from, to) => {
                from.as_ref().map_or(true, |f| value >= *f) && to.as_ref().map_or(true, |t| value <= *t)
            }
        }
    }
}

/// An immutable handle over partitioned Parquet pieces.
#[derive(Clone)]
pub struct FileDataset {
    registry: Arc<PieceRegistry>,
    pieces: Arc<BTreeMap<String, PartitionKvs>>,
    source_schema: SchemaRef,
    schema: SchemaRef,
    pipeline: Arc<Pipeline>,
    options: Arc<LoadOptions>,
    stats: Arc<StatsCache>,
}

impl fmt::Debug for FileDataset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FileDataset")
            .field("root", self.registry.root())
            .field("pieces", &self.pieces.len())
            .field("index_col", &self.pipeline.index_col)
            .field("time_col", &self.pipeline.time_col)
            .field("mappers", &self.pipeline.mappers.len())
            .finish_non_exhaustive()
    }
}

impl FileDataset {
    /// Loads a dataset using the process-wide [`PieceCache`].
    ///
    /// # Errors
    ///
    /// See [`FileDataset::load_with_cache`].
    pub fn load(root: DatasetRoot, options: LoadOptions) -> Result<Self> {
        Self::load_with_cache(root, options, PieceCache::global())
    }

    /// Loads a dataset against an explicit piece cache.
    ///
    /// Pieces are discovered under `root` and the schema is the union of a
    /// random subset of piece schemas plus partition-key columns. A
    /// configured index column absent from the data is ignored; an absent
    /// time column is an error.
    ///
    /// # Errors
    ///
    /// Returns [`Error::EmptyDataset`] when no piece is found,
    /// [`Error::SchemaMismatch`] when a column's type differs between the
    /// inspected pieces, and [`Error::ColumnNotFound`] for a missing time
    /// column.
    pub fn load_with_cache(root: DatasetRoot, options: LoadOptions, cache: Arc<PieceCache>) -> Result<Self> {
        options.validate()?;
        let registry = Arc::new(PieceRegistry::new(root, cache, &options)?);
        let pieces = registry.discover()?;
        let source_schema = source_schema(&registry, &pieces, &options)?;

        let index_col = options
            .index_col
            .clone()
            .filter(|c| source_schema.column_with_name(c).is_some());
        if index_col.is_none() {
            debug!(index_col = ?options.index_col, "index column not in data");
        }
        let time_col = match &options.time_col {
            Some(t) if source_schema.column_with_name(t).is_none() => {
                return Err(Error::column_not_found(t.clone()));
            }
            other => other.clone(),
        };

        let pipeline = Arc::new(Pipeline::new(index_col, time_col));
        let schema = output_schema(&registry, &pieces, &source_schema, &pipeline)?;
        info!(
            pieces = pieces.len(),
            columns = schema.fields().len(),
            "loaded dataset"
        );
        Ok(Self {
            registry,
            pieces: Arc::new(pieces),
            source_schema,
            schema,
            pipeline,
            options: Arc::new(options),
            stats: Arc::new(StatsCache::new()),
        })
    }

    /// Piece paths with their partition key/values.
    pub fn pieces(&self) -> &BTreeMap<String, PartitionKvs> {
        &self.pieces
    }

    /// Piece paths, ordered.
    pub fn piece_paths(&self) -> Vec<String> {
        self.pieces.keys().cloned().collect()
    }

    /// Number of pieces.
    pub fn n_pieces(&self) -> usize {
        self.pieces.len()
    }

    /// Output schema: source and partition columns, time-aux columns, then
    /// whatever the mapper chain adds or removes.
    pub fn schema(&self) -> SchemaRef {
        Arc::clone(&self.schema)
    }

    /// Output column names.
    pub fn columns(&self) -> Vec<String> {
        self.schema.fields().iter().map(|f| f.name().clone()).collect()
    }

    /// Output column names and types.
    pub fn types(&self) -> Vec<(String, DataType)> {
        self.schema
            .fields()
            .iter()
            .map(|f| (f.name().clone(), f.data_type().clone()))
            .collect()
    }

    /// Entity column.
    pub fn index_col(&self) -> Option<&str> {
        self.pipeline.index_col.as_deref()
    }

    /// Time column.
    pub fn time_col(&self) -> Option<&str> {
        self.pipeline.time_col.as_deref()
    }

    /// Returns true with both an entity and a time column.
    pub fn has_time_series(&self) -> bool {
        self.index_col().is_some() && self.time_col().is_some()
    }

    /// Entity, date-partition and time columns present in the output.
    pub fn index_cols(&self) -> Vec<String> {
        [self.index_col(), Some(DATE_PARTITION_KEY), self.time_col()]
            .into_iter()
            .flatten()
            .filter(|c| self.schema.column_with_name(c).is_some())
            .map(str::to_string)
            .collect()
    }

    /// Output columns other than index and time-aux columns.
    pub fn content_cols(&self) -> Vec<String> {
        let mut excluded: BTreeSet<String> = self.index_cols().into_iter().collect();
        excluded.extend(timeaux::t_aux_cols());
        self.columns()
            .into_iter()
            .filter(|c| !excluded.contains(c))
            .collect()
    }

    /// Load options.
    pub fn options(&self) -> &LoadOptions {
        &self.options
    }

    /// The piece registry.
    pub fn registry(&self) -> &PieceRegistry {
        &self.registry
    }

    /// The pipeline every piece goes through.
    pub fn pipeline(&self) -> &Pipeline {
        &self.pipeline
    }

    /// The statistics cache of this handle.
    pub fn stats_cache(&self) -> &StatsCache {
        &self.stats
    }

    /// Seeded from the load options, else from entropy.
    pub(crate) fn rng(&self) -> StdRng {
        match self.options.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        }
    }

    fn partition_kvs(&self, piece: &str) -> PartitionKvs {
        self.pieces
            .get(piece)
            .cloned()
            .unwrap_or_else(|| parse_partition_kvs(piece))
    }

    /// File columns to decode for `cols`; everything when mappers may need
    /// other columns.
    fn projection(&self, cols: Option<&[String]>) -> Option<Vec<String>> {
        let cols = cols?;
        if !self.pipeline.mappers.is_empty() {
            return None;
        }
        let mut projected = cols.to_vec();
        projected.extend(self.index_col().map(str::to_string));
        projected.extend(self.time_col().map(str::to_string));
        Some(projected)
    }

    /// Decodes one piece and runs the full pipeline over it.
    ///
    /// # Errors
    ///
    /// Read, transform and missing-column errors propagate.
    pub fn read_transformed(&self, piece: &str, cols: Option<&[String]>) -> Result<RecordBatch> {
        let batch = self
            .registry
            .read_piece(piece, self.projection(cols).as_deref())?;
        let batch = self.pipeline.run(piece, &self.partition_kvs(piece), batch)?;
        project(&batch, cols)
    }

    /// Materializes `pieces` (all by default), optionally restricted to
    /// `cols` and downsampled per piece.
    ///
    /// Each piece is decoded, given its partition and time-aux columns,
    /// sampled, and only then mapped. Pieces are processed in parallel.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ColumnNotFound`] for unknown columns; read and
    /// transform errors propagate.
    pub fn reduce(
        &self,
        pieces: Option<&[String]>,
        cols: Option<&[String]>,
        sampler: RowSampler,
    ) -> Result<RecordBatch> {
        if let Some(cols) = cols {
            for col in cols {
                self.column_type(col)?;
            }
        }
        let pieces = pieces.map_or_else(|| self.piece_paths(), <[String]>::to_vec);
        let mut rng = self.rng();
        let seeds: Vec<u64> = pieces.iter().map(|_| rng.gen()).collect();

        let batches = pieces
            .par_iter()
            .zip(seeds.par_iter())
            .map(|(piece, seed)| self.reduce_piece(piece, cols, sampler, *seed))
            .collect::<Result<Vec<_>>>()?;

        let schema = match cols {
            Some(cols) => Arc::new(self.schema.project(&self.column_indices(cols)?)?),
            None => self.schema(),
        };
        concat_aligned(&schema, &batches)
    }

    fn reduce_piece(
        &self,
        piece: &str,
        cols: Option<&[String]>,
        sampler: RowSampler,
        seed: u64,
    ) -> Result<RecordBatch> {
        let mut rng = StdRng::seed_from_u64(seed);
        let batch = self
            .registry
            .read_piece(piece, self.projection(cols).as_deref())?;
        let batch = self.pipeline.prepare(batch, &self.partition_kvs(piece))?;
        let batch = sampler.apply(batch, &mut rng)?;
        let batch = self.pipeline.run_mappers(piece, batch, 0)?;
        project(&batch, cols)
    }

    /// Every row of every piece.
    ///
    /// # Errors
    ///
    /// See [`FileDataset::reduce`].
    pub fn collect(&self, cols: Option<&[String]>) -> Result<RecordBatch> {
        self.reduce(None, cols, RowSampler::All)
    }

    fn column_indices(&self, cols: &[String]) -> Result<Vec<usize>> {
        cols.iter()
            .map(|c| self.schema.index_of(c).map_err(|_| Error::column_not_found(c.clone())))
            .collect()
    }

    /// Appends `mapper` to the chain.
    ///
    /// With [`MapOptions::inherit_cache`], statistics of columns the mapper
    /// leaves unchanged are copied, and a row-preserving mapper is applied
    /// to the parent's repr sample instead of drawing a new one. For
    /// [`Mapper::Custom`] the options are taken at their word: every column
    /// kept with the same name and type inherits, and rows count as
    /// preserved when [`MapOptions::inherit_n_rows`] is set.
    ///
    /// # Errors
    ///
    /// Returns an error if the mapper cannot derive the output schema.
    pub fn map(&self, mapper: Mapper, options: MapOptions) -> Result<Self> {
        let pipeline = Arc::new(self.pipeline.with_mapper(mapper.clone()));
        let schema = output_schema(&self.registry, &self.pieces, &self.source_schema, &pipeline)?;

        let stats = if options.inherit_cache {
            let input = self.columns();
            // Custom code is opaque: the caller's flags vouch for it.
            let (unchanged, preserves_rows) = match &mapper {
                Mapper::Custom(_) => (self.common_columns(&schema), options.inherit_n_rows),
                _ => (mapper.unchanged_columns(&input), mapper.preserves_rows()),
            };
            let keep_n_rows = options.inherit_n_rows && preserves_rows;
            let mut cache = self.stats.inherit(
                &unchanged,
                &mapper.renamed_columns(&input),
                keep_n_rows,
            );
            if let Some(sample) = self.stats.repr_sample().filter(|_| preserves_rows) {
                match mapper.apply(sample.as_ref().clone()) {
                    Ok(mapped) => cache = cache.with_repr_sample(Arc::new(mapped)),
                    Err(e) => debug!(error = %e, "repr sample not carried over"),
                }
            }
            cache
        } else {
            StatsCache::new()
        };

        Ok(Self {
            pipeline,
            schema,
            stats: Arc::new(stats),
            ..self.clone()
        })
    }

    /// Columns present with the same type in this handle and in `schema`.
    fn common_columns(&self, schema: &Schema) -> Vec<String> {
        self.schema
            .fields()
            .iter()
            .filter(|f| {
                schema
                    .field_with_name(f.name())
                    .is_ok_and(|o| o.data_type() == f.data_type())
            })
            .map(|f| f.name().clone())
            .collect()
    }

    /// Keeps only `cols`, in that order.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ColumnNotFound`] for unknown columns.
    pub fn select<S: AsRef<str>>(&self, cols: &[S]) -> Result<Self> {
        for col in cols {
            self.column_type(col.as_ref())?;
        }
        let select = Select::new(cols.iter().map(|c| c.as_ref().to_string()));
        self.map(Mapper::Select(select), MapOptions::inherit())
    }

    /// Removes `cols`.
    ///
    /// # Errors
    ///
    /// Returns an error if the output schema cannot be derived.
    pub fn drop<S: AsRef<str>>(&self, cols: &[S]) -> Result<Self> {
        let drop = Drop::new(cols.iter().map(|c| c.as_ref().to_string()));
        self.map(Mapper::Drop(drop), MapOptions::inherit())
    }

    /// Renames columns. Index, time and time-aux columns keep their names;
    /// cached statistics follow renamed columns.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ColumnNotFound`] for unknown source columns.
    pub fn rename<S: AsRef<str>>(&self, pairs: &[(S, S)]) -> Result<Self> {
        let fixed: BTreeSet<String> = self
            .index_cols()
            .into_iter()
            .chain(timeaux::t_aux_cols())
            .collect();
        let mut kept = Vec::new();
        for (old, new) in pairs {
            let (old, new) = (old.as_ref(), new.as_ref());
            self.column_type(old)?;
            if fixed.contains(old) {
                warn!(column = old, "index and time-aux columns cannot be renamed");
                continue;
            }
            kept.push((old.to_string(), new.to_string()));
        }
        if kept.is_empty() {
            return Ok(self.clone());
        }
        self.map(Mapper::Rename(Rename::from_pairs(kept)), MapOptions::inherit())
    }

    /// Casts columns.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ColumnNotFound`] for unknown columns.
    pub fn cast(&self, mappings: &[(&str, CastType)]) -> Result<Self> {
        for (col, _) in mappings {
            self.column_type(col)?;
        }
        let cast = Cast::new(mappings.iter().map(|(c, t)| (c.to_string(), *t)));
        self.map(Mapper::Cast(cast), MapOptions::inherit())
    }

    /// A handle over `pieces` only, with a fresh statistics cache.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidConfig`] for pieces not in this handle and
    /// [`Error::EmptyDataset`] for an empty selection.
    pub fn subset(&self, pieces: &[String]) -> Result<Self> {
        if pieces.is_empty() {
            return Err(Error::EmptyDataset);
        }
        let mut selected = BTreeMap::new();
        for piece in pieces {
            let kvs = self
                .pieces
                .get(piece)
                .ok_or_else(|| Error::invalid_config(format!("Unknown piece '{piece}'")))?;
            selected.insert(piece.clone(), kvs.clone());
        }
        if selected.len() == self.pieces.len() {
            return Ok(self.clone());
        }
        Ok(Self {
            pieces: Arc::new(selected),
            stats: Arc::new(StatsCache::new()),
            ..self.clone()
        })
    }

    /// Restricts pieces by partition-key conditions, without reading data.
    ///
    /// Conditions on keys absent from the first piece's path are ignored.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NoMatchingPieces`] if no piece satisfies every
    /// condition.
    pub fn filter_by_partition_keys(&self, filters: &[PartitionFilter]) -> Result<Self> {
        let Some(sample_kvs) = self.pieces.values().next() else {
            return Err(Error::EmptyDataset);
        };
        let applicable: Vec<&PartitionFilter> = filters
            .iter()
            .filter(|f| {
                let known = sample_kvs.contains_key(f.key());
                if !known {
                    debug!(key = f.key(), "ignoring filter on unknown partition key");
                }
                known
            })
            .collect();
        if applicable.is_empty() {
            return Ok(self.clone());
        }

        let selected: Vec<String> = self
            .pieces
            .iter()
            .filter(|(_, kvs)| applicable.iter().all(|f| f.matches(kvs)))
            .map(|(piece, _)| piece.clone())
            .collect();
        if selected.is_empty() {
            return Err(Error::no_matching_pieces(format!("{applicable:?}")));
        }
        info!(pieces = selected.len(), "filtered by partition keys");
        self.subset(&selected)
    }

    /// A handle over `n` random pieces; a copy when `n` covers them all.
    ///
    /// # Errors
    ///
    /// Returns [`Error::EmptyDataset`] for `n == 0`.
    pub fn sample(&self, n: usize) -> Result<Self> {
        if n >= self.pieces.len() {
            return Ok(self.clone());
        }
        let paths = self.piece_paths();
        let mut rng = self.rng();
        let chosen: Vec<String> = index::sample(&mut rng, paths.len(), n)
            .into_iter()
            .map(|i| paths[i].clone())
            .collect();
        self.subset(&chosen)
    }

    /// Splits the shuffled pieces by cumulative `weights`.
    ///
    /// With fewer than two weights the result is a single copy.
    ///
    /// # Errors
    ///
    /// Returns an error for invalid weights or a split with no piece.
    pub fn split(&self, weights: &[f64]) -> Result<Vec<Self>> {
        if weights.len() < 2 {
            return Ok(vec![self.clone()]);
        }
        let mut rng = self.rng();
        split_pieces(&self.piece_paths(), weights, &mut rng)?
            .iter()
            .map(|pieces| self.subset(pieces))
            .collect()
    }

    /// Fits a null-fill over `cols` and returns the filled handle with the
    /// fitted [`NullFillSpec`]. Filled values land in `__NullFill__<col>__`.
    ///
    /// # Errors
    ///
    /// See [`FileDataset::fit_null_fill`].
    pub fn fillna(&self, cols: &[String], options: &FillOptions) -> Result<(Self, NullFillSpec)> {
        let spec = self.fit_null_fill(cols, options)?;
        if spec.is_empty() {
            return Ok((self.clone(), spec));
        }
        let filled = self.map(Mapper::FillNull(spec.clone()), MapOptions::inherit())?;
        Ok((filled, spec))
    }

    /// Fits a prep and returns the prepped handle with the fitted
    /// [`PrepSpec`]. With no eligible column the handle is an unchanged
    /// copy.
    ///
    /// # Errors
    ///
    /// See [`FileDataset::fit_prep`].
    pub fn prep(&self, cols: &[String], options: &PrepOptions) -> Result<(Self, PrepSpec)> {
        let spec = self.fit_prep(cols, options)?;
        if spec.is_empty() {
            info!("no column to prep");
            return Ok((self.clone(), spec));
        }
        let prepped = self.map(Mapper::Prep(spec.clone()), MapOptions::inherit())?;
        Ok((prepped, spec))
    }

    /// A batch generator over this handle.
    ///
    /// # Errors
    ///
    /// See [`FileDataset::generator_spec`].
    pub fn generator(&self, options: &GeneratorOptions) -> Result<BatchGenerator> {
        BatchGenerator::new(
            self.generator_spec(options)?,
            Arc::clone(self.registry.cache()),
        )
    }

    /// `workers` generators on their own threads, each rebuilt from the
    /// serialized [`GeneratorSpec`](crate::generator::GeneratorSpec), feeding a channel of `prefetch` batches.
    ///
    /// # Errors
    ///
    /// Returns an error if the generator spec cannot be built or serialized.
    pub fn parallel_generator(
        &self,
        options: &GeneratorOptions,
        workers: usize,
        prefetch: usize,
    ) -> Result<ParallelGenerator> {
        ParallelGenerator::spawn(
            &self.generator_spec(options)?,
            Arc::clone(self.registry.cache()),
            workers,
            prefetch,
        )
    }
}

fn project(batch: &RecordBatch, cols: Option<&[String]>) -> Result<RecordBatch> {
    let Some(cols) = cols else {
        return Ok(batch.clone());
    };
    let schema = batch.schema();
    let indices = cols
        .iter()
        .map(|c| schema.index_of(c).map_err(|_| Error::column_not_found(c.clone())))
        .collect::<Result<Vec<_>>>()?;
    Ok(batch.project(&indices)?)
}

/// Union of the schemas of up to `repr_sample_min_pieces` random pieces,
/// then partition-key columns.
fn source_schema(
    registry: &PieceRegistry,
    pieces: &BTreeMap<String, PartitionKvs>,
    options: &LoadOptions,
) -> Result<SchemaRef> {
    let paths: Vec<&String> = pieces.keys().collect();
    let k = options.repr_sample_min_pieces.clamp(1, paths.len().max(1));
    let inspected: Vec<&String> = if k >= paths.len() {
        paths.clone()
    } else {
        let mut rng = match options.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        index::sample(&mut rng, paths.len(), k)
            .into_iter()
            .map(|i| paths[i])
            .collect()
    };

    let mut fields: Vec<Field> = Vec::new();
    let mut types: HashMap<String, (DataType, String)> = HashMap::new();
    for piece in inspected {
        let meta = registry.schema_and_row_count(piece)?;
        for field in meta.schema().fields() {
            match types.get(field.name()) {
                Some((t, first)) if t != field.data_type() => {
                    return Err(Error::schema_mismatch(format!(
                        "column '{}' is {t} in '{first}' but {} in '{piece}'",
                        field.name(),
                        field.data_type()
                    )));
                }
                Some(_) => {}
                None => {
                    types.insert(
                        field.name().clone(),
                        (field.data_type().clone(), piece.clone()),
                    );
                    fields.push(field.as_ref().clone().with_nullable(true));
                }
            }
        }
    }

    if let Some(kvs) = pieces.values().next() {
        for (key, value) in kvs {
            if !types.contains_key(key) {
                fields.push(Field::new(key, value.data_type(), true));
            }
        }
    }
    Ok(Arc::new(Schema::new(fields)))
}

/// Output schema of `pipeline`, derived by running it on an empty batch, or
/// on the first piece when a mapper rejects empty input.
fn output_schema(
    registry: &PieceRegistry,
    pieces: &BTreeMap<String, PartitionKvs>,
    source: &SchemaRef,
    pipeline: &Pipeline,
) -> Result<SchemaRef> {
    let mut fields: Vec<Field> = source.fields().iter().map(|f| f.as_ref().clone()).collect();
    if pipeline
        .time_col
        .as_ref()
        .is_some_and(|t| source.column_with_name(t).is_some())
    {
        fields.retain(|f| !timeaux::t_aux_cols().contains(f.name()));
        fields.extend(timeaux::t_aux_fields());
    }
    let empty = RecordBatch::new_empty(Arc::new(Schema::new(fields)));
    match pipeline.run_mappers("<schema>", empty, 0) {
        Ok(batch) => Ok(batch.schema()),
        Err(e) => {
            let Some((piece, kvs)) = pieces.iter().next() else {
                return Err(e);
            };
            debug!(error = %e, piece, "deriving schema from data");
            let batch = registry.read_piece(piece, None)?;
            Ok(pipeline.run(piece, kvs, batch)?.schema())
        }
    }
}

/// Concatenates `batches` under `schema`: columns are matched by name, cast
/// to the schema type, and missing ones become nulls.
fn concat_aligned(schema: &SchemaRef, batches: &[RecordBatch]) -> Result<RecordBatch> {
    let target = Arc::new(Schema::new(
        schema
            .fields()
            .iter()
            .map(|f| f.as_ref().clone().with_nullable(true))
            .collect::<Vec<_>>(),
    ));
    let aligned = batches
        .iter()
        .map(|batch| {
            let columns = target
                .fields()
                .iter()
                .map(|field| match batch.column_by_name(field.name()) {
                    Some(col) if col.data_type() == field.data_type() => Ok(Arc::clone(col)),
                    Some(col) => Ok(cast(col, field.data_type())?),
                    None => Ok(new_null_array(field.data_type(), batch.num_rows())),
                })
                .collect::<Result<Vec<ArrayRef>>>()?;
            Ok(RecordBatch::try_new(Arc::clone(&target), columns)?)
        })
        .collect::<Result<Vec<_>>>()?;
    Ok(concat_batches(&target, &aligned)?)
}

#[cfg(test)]
mod tests {
    use std::fs::File;

    use arrow::array::{Float64Array, Int64Array, StringArray};
    use parquet::arrow::ArrowWriter;
    use tempfile::TempDir;

    use super::*;
    use crate::stats::SampleStat;

    fn write_piece(dir: &std::path::Path, rel: &str, batch: &RecordBatch) {
        let path = dir.join(rel);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .ok()
                .unwrap_or_else(|| panic!("Should create dirs"));
        }
        let file = File::create(&path)
            .ok()
            .unwrap_or_else(|| panic!("Should create file"));
        let mut writer = ArrowWriter::try_new(file, batch.schema(), None)
            .ok()
            .unwrap_or_else(|| panic!("Should create writer"));
        writer
            .write(batch)
            .ok()
            .unwrap_or_else(|| panic!("Should write"));
        writer
            .close()
            .ok()
            .unwrap_or_else(|| panic!("Should close"));
    }

    fn create_test_batch(offset: i64, rows: i64) -> RecordBatch {
        let schema = Arc::new(Schema::new(vec![
            Field::new("id", DataType::Int64, false),
            Field::new("x", DataType::Float64, true),
            Field::new("c", DataType::Utf8, true),
        ]));
        let ids: Vec<i64> = (offset..offset + rows).collect();
        let xs: Vec<Option<f64>> = ids
            .iter()
            .map(|i| if i % 10 == 0 { None } else { Some(*i as f64) })
            .collect();
        let cs: Vec<&str> = ids.iter().map(|i| if i % 2 == 0 { "even" } else { "odd" }).collect();
        RecordBatch::try_new(
            schema,
            vec![
                Arc::new(Int64Array::from(ids)),
                Arc::new(Float64Array::from(xs)),
                Arc::new(StringArray::from(cs)),
            ],
        )
        .ok()
        .unwrap_or_else(|| panic!("Should create batch"))
    }

    fn create_test_dataset() -> (TempDir, FileDataset) {
        let dir = tempfile::tempdir()
            .ok()
            .unwrap_or_else(|| panic!("Should create temp dir"));
        for (i, site) in ["a", "b", "c", "d"].iter().enumerate() {
            let offset = i64::try_from(i).unwrap_or(0) * 100;
            write_piece(
                dir.path(),
                &format!("site={site}/part-0.parquet"),
                &create_test_batch(offset, 100),
            );
        }
        let options = LoadOptions::default().with_seed(7).with_repr_sample_min_pieces(4);
        let ds = FileDataset::load_with_cache(
            DatasetRoot::local(dir.path()),
            options,
            Arc::new(PieceCache::new()),
        )
        .ok()
        .unwrap_or_else(|| panic!("Should load"));
        (dir, ds)
    }

    #[test]
    fn test_load_discovers_pieces_and_partitions() {
        let (_dir, ds) = create_test_dataset();
        assert_eq!(ds.n_pieces(), 4);
        assert_eq!(ds.columns(), vec!["id", "x", "c", "site"]);
        assert_eq!(ds.index_col(), Some("id"));
        assert_eq!(ds.content_cols(), vec!["x", "c", "site"]);
        assert!(!ds.has_time_series());
    }

    #[test]
    fn test_collect_and_counts() {
        let (_dir, ds) = create_test_dataset();
        let all = ds
            .collect(None)
            .ok()
            .unwrap_or_else(|| panic!("Should collect"));
        assert_eq!(all.num_rows(), 400);
        assert_eq!(ds.n_rows().ok(), Some(400));
        assert_eq!(ds.count("x").ok(), Some(360));

        let cols = vec!["site".to_string()];
        let sites = ds
            .collect(Some(&cols))
            .ok()
            .unwrap_or_else(|| panic!("Should collect"));
        assert_eq!(sites.num_columns(), 1);
    }

    #[test]
    fn test_unknown_column() {
        let (_dir, ds) = create_test_dataset();
        assert!(matches!(
            ds.count("nope"),
            Err(Error::ColumnNotFound { .. })
        ));
        let cols = vec!["nope".to_string()];
        assert!(ds.collect(Some(&cols)).is_err());
    }

    #[test]
    fn test_filter_by_partition_keys() {
        let (_dir, ds) = create_test_dataset();
        let filtered = ds
            .filter_by_partition_keys(&[PartitionFilter::one_of("site", ["a", "c"])])
            .ok()
            .unwrap_or_else(|| panic!("Should filter"));
        assert_eq!(filtered.n_pieces(), 2);

        let ranged = ds
            .filter_by_partition_keys(&[PartitionFilter::between("site", Some("b"), None)])
            .ok()
            .unwrap_or_else(|| panic!("Should filter"));
        assert_eq!(ranged.n_pieces(), 3);

        let ignored = ds
            .filter_by_partition_keys(&[PartitionFilter::one_of("region", ["eu"])])
            .ok()
            .unwrap_or_else(|| panic!("Should ignore"));
        assert_eq!(ignored.n_pieces(), 4);

        assert!(matches!(
            ds.filter_by_partition_keys(&[PartitionFilter::one_of("site", ["z"])]),
            Err(Error::NoMatchingPieces { .. })
        ));
    }

    #[test]
    fn test_rename_carries_cached_stats() {
        let (_dir, ds) = create_test_dataset();
        let max = ds.sample_stat("x", SampleStat::Max).ok();
        let renamed = ds
            .rename(&[("x", "y"), ("id", "key")])
            .ok()
            .unwrap_or_else(|| panic!("Should rename"));
        assert!(renamed.stats_cache().entry("y").is_some());
        assert_eq!(renamed.sample_stat("y", SampleStat::Max).ok(), max);
        assert!(renamed.columns().contains(&"id".to_string()));
        assert!(!renamed.columns().contains(&"x".to_string()));
    }

    #[test]
    fn test_custom_mapper_inherits_on_request() {
        let (_dir, ds) = create_test_dataset();
        let count = ds.count("x").ok();
        assert!(ds.repr_sample().is_ok());
        let identity = || Mapper::custom(crate::transform::Map::new(|batch: RecordBatch| Ok(batch)));

        let kept = ds
            .map(identity(), MapOptions::inherit())
            .ok()
            .unwrap_or_else(|| panic!("Should map"));
        assert!(kept.stats_cache().entry("x").is_some());
        assert!(kept.stats_cache().repr_sample().is_some());
        assert_eq!(kept.count("x").ok(), count);

        let no_rows = MapOptions {
            inherit_cache: true,
            inherit_n_rows: false,
        };
        let reshaped = ds
            .map(identity(), no_rows)
            .ok()
            .unwrap_or_else(|| panic!("Should map"));
        assert!(reshaped.stats_cache().entry("x").is_some());
        assert!(reshaped.stats_cache().repr_sample().is_none());

        let fresh = ds
            .map(identity(), MapOptions::default())
            .ok()
            .unwrap_or_else(|| panic!("Should map"));
        assert!(fresh.stats_cache().entry("x").is_none());
        assert!(fresh.stats_cache().repr_sample().is_none());
    }

    #[test]
    fn test_select_and_drop() {
        let (_dir, ds) = create_test_dataset();
        let selected = ds
            .select(&["x", "id"])
            .ok()
            .unwrap_or_else(|| panic!("Should select"));
        assert_eq!(selected.columns(), vec!["x", "id"]);
        let dropped = ds
            .drop(&["c"])
            .ok()
            .unwrap_or_else(|| panic!("Should drop"));
        assert!(!dropped.columns().contains(&"c".to_string()));
        assert!(ds.select(&["nope"]).is_err());
    }

    #[test]
    fn test_sample_subset_and_split() {
        let (_dir, ds) = create_test_dataset();
        let sampled = ds
            .sample(2)
            .ok()
            .unwrap_or_else(|| panic!("Should sample"));
        assert_eq!(sampled.n_pieces(), 2);
        assert_eq!(ds.sample(10).ok().map(|d| d.n_pieces()), Some(4));

        let parts = ds
            .split(&[0.5, 0.5])
            .ok()
            .unwrap_or_else(|| panic!("Should split"));
        assert_eq!(parts.len(), 2);
        assert_eq!(parts.iter().map(FileDataset::n_pieces).sum::<usize>(), 4);
        assert_eq!(ds.split(&[1.0]).ok().map(|p| p.len()), Some(1));

        assert!(ds.subset(&["missing".to_string()]).is_err());
    }

    #[test]
    fn test_reduce_exact_sampler() {
        let (_dir, ds) = create_test_dataset();
        let batch = ds
            .reduce(None, None, RowSampler::Exact(10))
            .ok()
            .unwrap_or_else(|| panic!("Should reduce"));
        assert_eq!(batch.num_rows(), 40);
    }
}
