//! Infinite randomized batch generation.
//!
//! A [`BatchGenerator`] repeatedly picks a random piece, decodes one random
//! chunk of it, runs the pipeline, filters rows by numeric ranges and cuts
//! the shuffled survivors into fixed-size batches. Each batch holds one
//! array per column group: a `(batch, columns)` matrix for flat groups and a
//! `(batch, window, columns)` tensor for time-windowed groups.
//!
//! Generators are built from a [`GeneratorSpec`], a plain serializable value,
//! so identical generators can be rebuilt on other threads or processes.

use std::{
    collections::{BTreeMap, BTreeSet, HashMap, VecDeque},
    fmt,
    sync::Arc,
};

use arrow::array::RecordBatch;
use ndarray::{Array2, Array3};
use rand::{rngs::StdRng, seq::SliceRandom, Rng, SeedableRng};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::{
    config::LoadOptions,
    dataset::FileDataset,
    error::{Error, Result},
    registry::{parse_partition_kvs, DatasetRoot, PartitionKvs, PieceCache, PieceRegistry},
    sampling::take_rows,
    stats::values::{is_numeric_type, numeric_values},
    timeaux::{self, T_ORD_COL},
    transform::Pipeline,
};

/// Default rows per batch.
pub const DEFAULT_BATCH_SIZE: usize = 512;
/// Default rows per decoded chunk.
pub const DEFAULT_CHUNK_SIZE: usize = 100_000;
/// Consecutive chunks without a full batch after which generation fails.
pub const MAX_EMPTY_CHUNKS: usize = 1_000;

/// Columns assembled into one array of every batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnGroup {
    /// Columns, in output order.
    pub columns: Vec<String>,
    /// Inclusive row offsets `(from, to)` relative to each sampled row, with
    /// `from < to <= 0`. `None` for a flat group.
    #[serde(default)]
    pub window: Option<(i64, i64)>,
}

impl ColumnGroup {
    /// A flat group.
    pub fn flat<S: Into<String>>(columns: impl IntoIterator<Item = S>) -> Self {
        Self {
            columns: columns.into_iter().map(Into::into).collect(),
            window: None,
        }
    }

    /// A group observed over rows `from..=to` before each sampled row.
    pub fn windowed<S: Into<String>>(columns: impl IntoIterator<Item = S>, from: i64, to: i64) -> Self {
        Self {
            columns: columns.into_iter().map(Into::into).collect(),
            window: Some((from, to)),
        }
    }

    /// Parses column names optionally followed by one or two integers.
    ///
    /// One trailing integer `k` means `(k, 0)` when negative and `(0, k)`
    /// otherwise; two trailing integers are `(from, to)`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidConfig`] if no column name is given.
    pub fn parse<S: AsRef<str>>(items: &[S]) -> Result<Self> {
        let items: Vec<&str> = items.iter().map(AsRef::as_ref).collect();
        let offset = |i: usize| items.get(i).and_then(|s| s.trim().parse::<i64>().ok());
        let n = items.len();

        let (names, window) = match (n.checked_sub(2).and_then(offset), n.checked_sub(1).and_then(offset)) {
            (Some(from), Some(to)) => (&items[..n - 2], Some((from, to))),
            (None, Some(k)) if k < 0 => (&items[..n - 1], Some((k, 0))),
            (None, Some(k)) => (&items[..n - 1], Some((0, k))),
            _ => (&items[..], None),
        };
        if names.is_empty() {
            return Err(Error::invalid_config("Column group has no column"));
        }
        Ok(Self {
            columns: names.iter().map(|s| (*s).to_string()).collect(),
            window,
        })
    }

    /// Rows per window; 1 for flat groups.
    pub fn window_len(&self) -> usize {
        self.window
            .map_or(1, |(from, to)| usize::try_from(to - from + 1).unwrap_or(1))
    }

    fn validate(&self) -> Result<()> {
        if self.columns.is_empty() {
            return Err(Error::invalid_config("Column group has no column"));
        }
        match self.window {
            Some((from, to)) if !(from < to && to <= 0) => Err(Error::invalid_config(format!(
                "Window ({from}, {to}) must satisfy from < to <= 0"
            ))),
            _ => Ok(()),
        }
    }
}

/// Inclusive numeric range; an absent bound is open.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct RangeFilter {
    /// Lower bound.
    #[serde(default)]
    pub lower: Option<f64>,
    /// Upper bound.
    #[serde(default)]
    pub upper: Option<f64>,
}

impl RangeFilter {
    /// `[lower, upper]`.
    pub fn between(lower: f64, upper: f64) -> Self {
        Self {
            lower: Some(lower),
            upper: Some(upper),
        }
    }

    /// `[lower, ∞)`.
    pub fn at_least(lower: f64) -> Self {
        Self {
            lower: Some(lower),
            upper: None,
        }
    }

    /// `(-∞, upper]`.
    pub fn at_most(upper: f64) -> Self {
        Self {
            lower: None,
            upper: Some(upper),
        }
    }

    /// NaN never matches.
    pub fn contains(&self, v: f64) -> bool {
        !v.is_nan() && self.lower.map_or(true, |l| v >= l) && self.upper.map_or(true, |u| v <= u)
    }
}

/// One array of a batch.
#[derive(Debug, Clone, PartialEq)]
pub enum BatchArray {
    /// `(batch, columns)`.
    Flat(Array2<f64>),
    /// `(batch, window, columns)`, window rows in time order.
    Windowed(Array3<f64>),
    /// Index and time values of the sampled rows, in their own types.
    Ids(RecordBatch),
}

impl BatchArray {
    /// Array shape; `(rows, columns)` for [`BatchArray::Ids`].
    pub fn shape(&self) -> Vec<usize> {
        match self {
            Self::Flat(a) => a.shape().to_vec(),
            Self::Windowed(a) => a.shape().to_vec(),
            Self::Ids(b) => vec![b.num_rows(), b.num_columns()],
        }
    }

    /// Number of NaN values.
    pub fn nan_count(&self) -> usize {
        match self {
            Self::Flat(a) => a.iter().filter(|v| v.is_nan()).count(),
            Self::Windowed(a) => a.iter().filter(|v| v.is_nan()).count(),
            Self::Ids(_) => 0,
        }
    }

    /// The matrix of a flat group.
    pub fn as_flat(&self) -> Option<&Array2<f64>> {
        match self {
            Self::Flat(a) => Some(a),
            _ => None,
        }
    }

    /// The tensor of a windowed group.
    pub fn as_windowed(&self) -> Option<&Array3<f64>> {
        match self {
            Self::Windowed(a) => Some(a),
            _ => None,
        }
    }
}

/// One batch: an array per column group.
pub type Batch = Vec<BatchArray>;

/// Caller-facing generator parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneratorOptions {
    /// Column groups; empty means one flat group of every numeric feature.
    pub groups: Vec<ColumnGroup>,
    /// Piece subset; `None` uses every piece.
    pub pieces: Option<Vec<String>>,
    /// Per-column inclusive ranges rows must satisfy.
    pub filters: BTreeMap<String, RangeFilter>,
    /// Rows per batch.
    pub batch_size: usize,
    /// Rows per decoded chunk.
    pub chunk_size: usize,
    /// Threads converting group columns.
    pub decode_threads: usize,
    /// Omit the leading index/time group.
    pub anon: bool,
    /// Seed; defaults to the dataset seed.
    pub seed: Option<u64>,
    /// Fail on NaN in any yielded array.
    pub debug: bool,
}

impl Default for GeneratorOptions {
    fn default() -> Self {
        Self {
            groups: Vec::new(),
            pieces: None,
            filters: BTreeMap::new(),
            batch_size: DEFAULT_BATCH_SIZE,
            chunk_size: DEFAULT_CHUNK_SIZE,
            decode_threads: 1,
            anon: true,
            seed: None,
            debug: false,
        }
    }
}

impl GeneratorOptions {
    /// Adds a column group.
    #[must_use]
    pub fn group(mut self, group: ColumnGroup) -> Self {
        self.groups.push(group);
        self
    }

    /// Restricts generation to `pieces`.
    #[must_use]
    pub fn pieces(mut self, pieces: Vec<String>) -> Self {
        self.pieces = Some(pieces);
        self
    }

    /// Keeps only rows whose `column` lies in `range`.
    #[must_use]
    pub fn filter(mut self, column: impl Into<String>, range: RangeFilter) -> Self {
        self.filters.insert(column.into(), range);
        self
    }

    /// Sets the batch size.
    #[must_use]
    pub fn batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    /// Sets the chunk size.
    #[must_use]
    pub fn chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size;
        self
    }

    /// Sets the number of conversion threads.
    #[must_use]
    pub fn decode_threads(mut self, threads: usize) -> Self {
        self.decode_threads = threads;
        self
    }

    /// Sets whether the index/time group is omitted.
    #[must_use]
    pub fn anon(mut self, anon: bool) -> Self {
        self.anon = anon;
        self
    }

    /// Sets the seed.
    #[must_use]
    pub fn seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    /// Enables the NaN check.
    #[must_use]
    pub fn debug(mut self, debug: bool) -> Self {
        self.debug = debug;
        self
    }
}

/// Everything a worker needs to build a [`BatchGenerator`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneratorSpec {
    /// Dataset root.
    pub root: DatasetRoot,
    /// Pieces with their partition key/values.
    pub pieces: BTreeMap<String, PartitionKvs>,
    /// Pipeline run on every chunk.
    pub pipeline: Pipeline,
    /// Options of the source dataset (cache directory, retries).
    pub load_options: LoadOptions,
    /// Column groups.
    pub groups: Vec<ColumnGroup>,
    /// Row filters.
    #[serde(default)]
    pub filters: BTreeMap<String, RangeFilter>,
    /// Rows per batch.
    pub batch_size: usize,
    /// Rows per decoded chunk.
    pub chunk_size: usize,
    /// Threads converting group columns.
    pub decode_threads: usize,
    /// Omit the leading index/time group.
    pub anon: bool,
    /// Seed.
    #[serde(default)]
    pub seed: Option<u64>,
    /// Fail on NaN in any yielded array.
    #[serde(default)]
    pub debug: bool,
}

impl GeneratorSpec {
    /// JSON form shipped to workers.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidConfig`] for process-local roots or mappers.
    pub fn to_json(&self) -> Result<String> {
        if matches!(self.root, DatasetRoot::Store { .. }) {
            return Err(Error::invalid_config(
                "An in-process store root cannot be serialized",
            ));
        }
        if !self.pipeline.is_serializable() {
            return Err(Error::invalid_config(
                "A pipeline with custom mappers cannot be serialized",
            ));
        }
        Ok(serde_json::to_string(self)?)
    }

    /// Parses the JSON form.
    ///
    /// # Errors
    ///
    /// Returns an error for malformed JSON.
    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }
}

impl FileDataset {
    /// Resolves `options` against this handle.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ColumnNotFound`] for unknown group or filter
    /// columns, [`Error::InvalidConfig`] for unknown pieces or malformed
    /// groups.
    pub fn generator_spec(&self, options: &GeneratorOptions) -> Result<GeneratorSpec> {
        let pieces = match &options.pieces {
            Some(subset) => subset
                .iter()
                .map(|p| {
                    self.pieces()
                        .get(p)
                        .map(|kvs| (p.clone(), kvs.clone()))
                        .ok_or_else(|| Error::invalid_config(format!("Unknown piece '{p}'")))
                })
                .collect::<Result<BTreeMap<_, _>>>()?,
            None => self.pieces().clone(),
        };

        let groups = if options.groups.is_empty() {
            vec![self.default_group()]
        } else {
            options.groups.clone()
        };
        for col in groups
            .iter()
            .flat_map(|g| g.columns.iter())
            .chain(options.filters.keys())
        {
            self.column_type(col)?;
        }

        Ok(GeneratorSpec {
            root: self.registry().root().clone(),
            pieces,
            pipeline: self.pipeline().clone(),
            load_options: self.options().clone(),
            groups,
            filters: options.filters.clone(),
            batch_size: options.batch_size,
            chunk_size: options.chunk_size,
            decode_threads: options.decode_threads,
            anon: options.anon,
            seed: options.seed.or(self.options().seed),
            debug: options.debug,
        })
    }

    /// Numeric and boolean time-aux and content columns.
    fn default_group(&self) -> ColumnGroup {
        let schema = self.schema();
        let columns: Vec<String> = timeaux::possible_feature_t_aux_cols()
            .into_iter()
            .chain(self.content_cols())
            .filter(|c| {
                schema.field_with_name(c).is_ok_and(|f| {
                    is_numeric_type(f.data_type()) || *f.data_type() == arrow::datatypes::DataType::Boolean
                })
            })
            .collect();
        ColumnGroup::flat(columns)
    }
}

/// An endless iterator of batches.
///
/// Never returns `None` on its own; after yielding an error it stops.
pub struct BatchGenerator {
    registry: PieceRegistry,
    paths: Vec<String>,
    pieces: BTreeMap<String, PartitionKvs>,
    pipeline: Pipeline,
    groups: Vec<ColumnGroup>,
    id_cols: Vec<String>,
    filters: BTreeMap<String, RangeFilter>,
    batch_size: usize,
    chunk_size: usize,
    debug: bool,
    pool: Option<rayon::ThreadPool>,
    rng: StdRng,
    buffer: VecDeque<Batch>,
    failed: bool,
}

impl fmt::Debug for BatchGenerator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BatchGenerator")
            .field("pieces", &self.paths.len())
            .field("groups", &self.groups)
            .field("filters", &self.filters)
            .field("batch_size", &self.batch_size)
            .field("chunk_size", &self.chunk_size)
            .field("buffered", &self.buffer.len())
            .finish_non_exhaustive()
    }
}

impl BatchGenerator {
    /// Builds a generator.
    ///
    /// Windowed groups additionally require `__tOrd__ >= -from`, so every
    /// window lies within one entity's rows.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidConfig`] for zero sizes, malformed groups or
    /// windows without a time column, [`Error::EmptyDataset`] without
    /// pieces.
    pub fn new(spec: GeneratorSpec, cache: Arc<PieceCache>) -> Result<Self> {
        if spec.batch_size == 0 || spec.chunk_size == 0 {
            return Err(Error::invalid_config("Batch and chunk sizes must be positive"));
        }
        if spec.pieces.is_empty() {
            return Err(Error::EmptyDataset);
        }
        let mut filters = spec.filters;
        let mut min_t_ord: Option<i64> = None;
        for group in &spec.groups {
            group.validate()?;
            if let Some((from, _)) = group.window {
                if spec.pipeline.time_col.is_none() {
                    return Err(Error::invalid_config(
                        "Windowed column groups need a time column",
                    ));
                }
                min_t_ord = Some(min_t_ord.map_or(-from, |m| m.max(-from)));
            }
        }
        if let Some(min_t_ord) = min_t_ord {
            #[allow(clippy::cast_precision_loss)]
            let lower = min_t_ord as f64;
            let entry = filters.entry(T_ORD_COL.to_string()).or_default();
            entry.lower = Some(entry.lower.map_or(lower, |l| l.max(lower)));
        }

        let id_cols: Vec<String> = if spec.anon {
            Vec::new()
        } else {
            [&spec.pipeline.index_col, &spec.pipeline.time_col]
                .into_iter()
                .flatten()
                .cloned()
                .collect()
        };

        let pool = if spec.decode_threads > 1 {
            Some(
                rayon::ThreadPoolBuilder::new()
                    .num_threads(spec.decode_threads)
                    .build()
                    .map_err(|e| Error::invalid_config(format!("Cannot start decode threads: {e}")))?,
            )
        } else {
            None
        };

        let registry = PieceRegistry::new(spec.root, cache, &spec.load_options)?;
        let rng = spec
            .seed
            .map_or_else(StdRng::from_entropy, StdRng::seed_from_u64);
        info!(
            pieces = spec.pieces.len(),
            groups = spec.groups.len(),
            batch_size = spec.batch_size,
            "built batch generator"
        );
        Ok(Self {
            registry,
            paths: spec.pieces.keys().cloned().collect(),
            pieces: spec.pieces,
            pipeline: spec.pipeline,
            groups: spec.groups,
            id_cols,
            filters,
            batch_size: spec.batch_size,
            chunk_size: spec.chunk_size,
            debug: spec.debug,
            pool,
            rng,
            buffer: VecDeque::new(),
            failed: false,
        })
    }

    /// Builds a generator from [`GeneratorSpec::to_json`] output.
    ///
    /// # Errors
    ///
    /// As [`BatchGenerator::new`], plus malformed JSON.
    pub fn from_json(json: &str, cache: Arc<PieceCache>) -> Result<Self> {
        Self::new(GeneratorSpec::from_json(json)?, cache)
    }

    /// Column groups, including the row filter on `__tOrd__` for windows.
    pub fn groups(&self) -> &[ColumnGroup] {
        &self.groups
    }

    /// Effective row filters.
    pub fn filters(&self) -> &BTreeMap<String, RangeFilter> {
        &self.filters
    }

    fn fill_buffer(&mut self) -> Result<()> {
        for _ in 0..MAX_EMPTY_CHUNKS {
            let piece = self.paths[self.rng.gen_range(0..self.paths.len())].clone();
            let chunk = self
                .registry
                .read_chunk(&piece, self.chunk_size, &mut self.rng)?;
            let kvs = self
                .pieces
                .get(&piece)
                .cloned()
                .unwrap_or_else(|| parse_partition_kvs(&piece));
            let chunk = self.pipeline.run(&piece, &kvs, chunk)?;

            let mut rows = self.filter_rows(&chunk)?;
            rows.shuffle(&mut self.rng);
            let n_batches = rows.len() / self.batch_size;
            if n_batches == 0 {
                debug!(piece = %piece, rows = rows.len(), "chunk too small for a batch");
                continue;
            }

            let columns = self.decode_columns(&chunk)?;
            for rows in rows.chunks_exact(self.batch_size) {
                let batch = self.assemble(&chunk, &columns, rows)?;
                self.buffer.push_back(batch);
            }
            return Ok(());
        }
        Err(Error::data(format!(
            "No full batch of {} rows in {MAX_EMPTY_CHUNKS} consecutive chunks",
            self.batch_size
        )))
    }

    /// Rows satisfying every range filter, ascending.
    fn filter_rows(&self, chunk: &RecordBatch) -> Result<Vec<usize>> {
        let mut keep = vec![true; chunk.num_rows()];
        for (col, range) in &self.filters {
            let array = chunk
                .column_by_name(col)
                .ok_or_else(|| Error::column_not_found(col.clone()))?;
            for (k, v) in keep.iter_mut().zip(numeric_values(col, array)?) {
                *k = *k && range.contains(v);
            }
        }
        Ok(keep
            .iter()
            .enumerate()
            .filter_map(|(i, k)| k.then_some(i))
            .collect())
    }

    /// Group columns of `chunk` as `f64`, null as NaN.
    fn decode_columns(&self, chunk: &RecordBatch) -> Result<HashMap<String, Vec<f64>>> {
        let names: BTreeSet<&String> = self.groups.iter().flat_map(|g| g.columns.iter()).collect();
        let decode = |col: &String| -> Result<(String, Vec<f64>)> {
            let array = chunk
                .column_by_name(col)
                .ok_or_else(|| Error::column_not_found(col.clone()))?;
            Ok((col.clone(), numeric_values(col, array)?))
        };
        match &self.pool {
            Some(pool) => {
                let names: Vec<&String> = names.into_iter().collect();
                pool.install(|| names.par_iter().map(|c| decode(*c)).collect())
            }
            None => names.into_iter().map(decode).collect(),
        }
    }

    fn assemble(
        &self,
        chunk: &RecordBatch,
        columns: &HashMap<String, Vec<f64>>,
        rows: &[usize],
    ) -> Result<Batch> {
        let mut batch = Vec::with_capacity(self.groups.len() + 1);
        if !self.id_cols.is_empty() {
            let ids = take_rows(chunk, rows)?;
            let indices = self
                .id_cols
                .iter()
                .map(|c| {
                    ids.schema()
                        .index_of(c)
                        .map_err(|_| Error::column_not_found(c.clone()))
                })
                .collect::<Result<Vec<_>>>()?;
            batch.push(BatchArray::Ids(ids.project(&indices)?));
        }

        for group in &self.groups {
            let values = group
                .columns
                .iter()
                .map(|c| {
                    columns
                        .get(c)
                        .ok_or_else(|| Error::column_not_found(c.clone()))
                })
                .collect::<Result<Vec<_>>>()?;
            let array = match group.window {
                None => BatchArray::Flat(Array2::from_shape_fn(
                    (rows.len(), values.len()),
                    |(i, j)| values[j][rows[i]],
                )),
                Some((from, _)) => {
                    let len = group.window_len();
                    let back = usize::try_from(-from).unwrap_or(0);
                    let mut data = Vec::with_capacity(rows.len() * len * values.len());
                    for &row in rows {
                        let start = row
                            .checked_sub(back)
                            .filter(|s| s + len <= chunk.num_rows())
                            .ok_or_else(|| Error::data(format!("Window of row {row} leaves the chunk")))?;
                        for t in start..start + len {
                            data.extend(values.iter().map(|v| v[t]));
                        }
                    }
                    let tensor = Array3::from_shape_vec((rows.len(), len, values.len()), data)
                        .map_err(|e| Error::data(e.to_string()))?;
                    BatchArray::Windowed(tensor)
                }
            };
            batch.push(array);
        }

        if self.debug {
            for (group, array) in batch.iter().enumerate() {
                let count = array.nan_count();
                if count > 0 {
                    return Err(Error::NanInBatch {
                        group,
                        shape: array.shape(),
                        count,
                    });
                }
            }
        }
        Ok(batch)
    }
}

impl Iterator for BatchGenerator {
    type Item = Result<Batch>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed {
            return None;
        }
        if self.buffer.is_empty() {
            if let Err(e) = self.fill_buffer() {
                self.failed = true;
                return Some(Err(e));
            }
        }
        self.buffer.pop_front().map(Ok)
    }
}
