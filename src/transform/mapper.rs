//! Tagged transform variants and the per-piece pipeline.

use std::{
    collections::{HashMap, HashSet},
    fmt,
    sync::Arc,
};

use arrow::array::RecordBatch;
use serde::{Deserialize, Serialize};

use super::{Cast, Drop, EncodeCategory, NullFillSpec, Rename, Scale, Select, Transform};
use crate::{
    error::{Error, Result},
    prep::PrepSpec,
    registry::{attach_partition_columns, PartitionKvs},
    timeaux,
};

/// One step of a mapper chain.
///
/// Every variant except [`Mapper::Custom`] is a plain serializable value, so
/// a chain can be shipped to another worker and replayed there.
#[derive(Clone, Serialize, Deserialize)]
#[serde(tag = "kind", content = "spec", rename_all = "snake_case")]
pub enum Mapper {
    /// Keep some columns.
    Select(Select),
    /// Rename columns.
    Rename(Rename),
    /// Remove columns.
    Drop(Drop),
    /// Change column types.
    Cast(Cast),
    /// Categorical index encoding.
    EncodeCategory(EncodeCategory),
    /// Fitted null-fill.
    FillNull(NullFillSpec),
    /// Fitted numeric scaling.
    Scale(Scale),
    /// Fitted prep (categorical index plus numeric fill and scale).
    Prep(PrepSpec),
    /// Arbitrary process-local code; not serializable.
    #[serde(skip)]
    Custom(Arc<dyn Transform>),
}

impl fmt::Debug for Mapper {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Select(s) => f.debug_tuple("Select").field(s).finish(),
            Self::Rename(r) => f.debug_tuple("Rename").field(r).finish(),
            Self::Drop(d) => f.debug_tuple("Drop").field(d).finish(),
            Self::Cast(c) => f.debug_tuple("Cast").field(c).finish(),
            Self::EncodeCategory(e) => f.debug_tuple("EncodeCategory").field(e).finish(),
            Self::FillNull(n) => f.debug_tuple("FillNull").field(n).finish(),
            Self::Scale(s) => f.debug_tuple("Scale").field(s).finish(),
            Self::Prep(p) => f.debug_tuple("Prep").field(p).finish(),
            Self::Custom(_) => f.write_str("Custom(..)"),
        }
    }
}

impl Mapper {
    /// Wraps arbitrary code.
    pub fn custom(transform: impl Transform + 'static) -> Self {
        Self::Custom(Arc::new(transform))
    }

    /// Returns false for [`Mapper::Custom`].
    pub fn is_serializable(&self) -> bool {
        !matches!(self, Self::Custom(_))
    }

    /// Returns true if the mapper never adds or removes rows.
    pub fn preserves_rows(&self) -> bool {
        !matches!(self, Self::Custom(_))
    }

    /// Columns of `input` whose values this mapper leaves untouched under
    /// the same name. Empty for [`Mapper::Custom`].
    pub fn unchanged_columns(&self, input: &[String]) -> Vec<String> {
        let touched: HashSet<String> = match self {
            Self::Select(s) => {
                let kept: HashSet<&String> = s.columns().iter().collect();
                return input.iter().filter(|c| kept.contains(c)).cloned().collect();
            }
            Self::Rename(r) => r
                .mapping()
                .iter()
                .flat_map(|(old, new)| [old.clone(), new.clone()])
                .collect(),
            Self::Drop(d) => d.columns().iter().cloned().collect(),
            Self::Cast(c) => c.mappings().iter().map(|(n, _)| n.clone()).collect(),
            Self::EncodeCategory(e) => [e.output.clone().unwrap_or_else(|| e.column.clone())].into(),
            Self::FillNull(spec) => spec.output_columns().into_iter().collect(),
            Self::Scale(s) => [s.output.clone().unwrap_or_else(|| s.column.clone())].into(),
            Self::Prep(spec) => spec.output_columns().into_iter().collect(),
            Self::Custom(_) => return Vec::new(),
        };
        input.iter().filter(|c| !touched.contains(*c)).cloned().collect()
    }

    /// Old to new name of columns carried over under a new name.
    pub fn renamed_columns(&self, input: &[String]) -> HashMap<String, String> {
        match self {
            Self::Rename(r) => r
                .mapping()
                .iter()
                .filter(|(old, _)| input.contains(old))
                .map(|(old, new)| (old.clone(), new.clone()))
                .collect(),
            _ => HashMap::new(),
        }
    }
}

impl Transform for Mapper {
    fn apply(&self, batch: RecordBatch) -> Result<RecordBatch> {
        match self {
            Self::Select(t) => t.apply(batch),
            Self::Rename(t) => t.apply(batch),
            Self::Drop(t) => t.apply(batch),
            Self::Cast(t) => t.apply(batch),
            Self::EncodeCategory(t) => t.apply(batch),
            Self::FillNull(t) => t.apply(batch),
            Self::Scale(t) => t.apply(batch),
            Self::Prep(t) => t.apply(batch),
            Self::Custom(t) => t.apply(batch),
        }
    }
}

/// What happens to every decoded piece before anyone sees it: partition
/// columns, time-auxiliary columns, then the mapper chain.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Pipeline {
    /// Entity column.
    #[serde(default)]
    pub index_col: Option<String>,
    /// Time column; enables time-auxiliary columns.
    #[serde(default)]
    pub time_col: Option<String>,
    /// Mapper chain, applied in order.
    #[serde(default)]
    pub mappers: Vec<Mapper>,
}

impl Pipeline {
    /// A pipeline with an empty mapper chain.
    pub fn new(index_col: Option<String>, time_col: Option<String>) -> Self {
        Self {
            index_col,
            time_col,
            mappers: Vec::new(),
        }
    }

    /// Returns a copy with `mapper` appended.
    #[must_use]
    pub fn with_mapper(&self, mapper: Mapper) -> Self {
        let mut next = self.clone();
        next.mappers.push(mapper);
        next
    }

    /// Returns true if no mapper can add or remove rows.
    pub fn preserves_rows(&self) -> bool {
        self.mappers.iter().all(Mapper::preserves_rows)
    }

    /// Returns true if the chain can be serialized.
    pub fn is_serializable(&self) -> bool {
        self.mappers.iter().all(Mapper::is_serializable)
    }

    /// Adds partition and time-auxiliary columns, without running mappers.
    ///
    /// # Errors
    ///
    /// Returns an error if the time-auxiliary columns cannot be derived.
    pub fn prepare(&self, batch: RecordBatch, kvs: &PartitionKvs) -> Result<RecordBatch> {
        let batch = attach_partition_columns(batch, kvs)?;
        match &self.time_col {
            Some(t) if batch.column_by_name(t).is_some() => {
                timeaux::generate(batch, self.index_col.as_deref(), t)
            }
            _ => Ok(batch),
        }
    }

    /// Prepares a decoded piece and runs the whole mapper chain over it.
    ///
    /// # Errors
    ///
    /// A failing mapper is reported as [`Error::PieceTransform`] with the
    /// piece and the mapper's position.
    pub fn run(&self, piece: &str, kvs: &PartitionKvs, batch: RecordBatch) -> Result<RecordBatch> {
        let batch = self.prepare(batch, kvs)?;
        self.run_mappers(piece, batch, 0)
    }

    /// Runs the mappers from position `start` on an already prepared batch.
    ///
    /// # Errors
    ///
    /// As [`Pipeline::run`].
    pub fn run_mappers(&self, piece: &str, batch: RecordBatch, start: usize) -> Result<RecordBatch> {
        self.mappers
            .iter()
            .enumerate()
            .skip(start)
            .try_fold(batch, |batch, (index, mapper)| {
                mapper
                    .apply(batch)
                    .map_err(|e| Error::piece_transform(piece, index, e))
            })
    }
}
