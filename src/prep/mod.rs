//! Fitted preprocessing: categorical index encoding plus numeric fill and
//! scaling, with SQL emission and persistence.
//!
//! A [`PrepSpec`] is fitted once from the repr sample (see
//! [`FileDataset::fit_prep`](crate::FileDataset::fit_prep)) and then applied
//! piece by piece as a [`Mapper::Prep`](crate::Mapper::Prep). Saved specs
//! are memoized per directory for the lifetime of the process.

mod fill;
mod fit;
mod spec;
pub mod sql;

use std::{
    collections::HashMap,
    path::{Path, PathBuf},
    sync::Arc,
};

use arrow::{
    array::{new_null_array, Array, Float64Array, RecordBatch},
    datatypes::DataType,
};
use once_cell::sync::Lazy;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::debug;

pub use fill::{FillOptions, FillRule, NULL_FILL_DETAILS_FILE, NULL_FILL_SQL_STATEMENT_FILE};
pub use fit::PrepOptions;
pub use spec::{CatDetails, CatPrepMap, NumDetails, NumPrepMap, Scaler};

use self::fill::{read_json, write_json};
use crate::{
    error::{Error, Result},
    stats::values::numeric_values,
    transform::{category_index, set_column, ScalerParams, Transform},
};

/// File holding the categorical map.
pub const CAT_ORIG_TO_PREP_COL_MAP_FILE: &str = "catOrigToPrepColMap.json";
/// File holding the numeric map.
pub const NUM_ORIG_TO_PREP_COL_MAP_FILE: &str = "numOrigToPrepColMap.json";
/// File holding the prep statement as a JSON string.
pub const PREP_SQL_STATEMENT_FILE: &str = "prepSQLStatement.json";

static PREP_CACHE: Lazy<RwLock<HashMap<PathBuf, Arc<PrepSpec>>>> =
    Lazy::new(|| RwLock::new(HashMap::new()));

/// A fitted prep.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct PrepSpec {
    /// Categorical columns.
    #[serde(default)]
    pub cat: CatPrepMap,
    /// Numeric columns.
    #[serde(default)]
    pub num: NumPrepMap,
}

impl PrepSpec {
    /// Returns true if no column is prepped.
    pub fn is_empty(&self) -> bool {
        self.cat.columns.is_empty() && self.num.columns.is_empty()
    }

    /// Prep columns: categorical first, then numeric, each by source name.
    pub fn output_columns(&self) -> Vec<String> {
        self.cat
            .columns
            .values()
            .map(|(out, _)| out.clone())
            .chain(self.num.columns.values().map(|(out, _)| out.clone()))
            .collect()
    }

    /// `SELECT *, ... FROM __THIS__` producing the prep columns.
    pub fn sql_statement(&self) -> String {
        let mut items = Vec::new();
        for (col, (out, details)) in &self.cat.columns {
            let idx = sql::category_index(col, &details.cats);
            let expr = if self.cat.scale {
                index_scaler(details.n_cats).sql(&idx)
            } else {
                idx
            };
            items.push((expr, out.clone()));
        }
        for (col, (out, details)) in &self.num.columns {
            let cond = sql::null_condition(col, details.nulls.0, details.nulls.1, None, None);
            let filled = sql::coalesce(col, &cond, &[sql::float_literal(details.null_fill_value)]);
            let expr = match self.num.scaler.and_then(|s| details.params(s)) {
                Some(params) => params.sql(&filled),
                None => filled,
            };
            items.push((expr, out.clone()));
        }
        sql::select_statement(&items, None)
    }

    /// Writes the two maps and the statement into `dir`.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory or files cannot be written.
    pub fn save(&self, dir: impl AsRef<Path>) -> Result<()> {
        let dir = dir.as_ref();
        std::fs::create_dir_all(dir).map_err(|e| Error::io(e, dir))?;
        write_json(&dir.join(CAT_ORIG_TO_PREP_COL_MAP_FILE), &self.cat)?;
        write_json(&dir.join(NUM_ORIG_TO_PREP_COL_MAP_FILE), &self.num)?;
        write_json(&dir.join(PREP_SQL_STATEMENT_FILE), &self.sql_statement())?;
        PREP_CACHE
            .write()
            .insert(dir.to_path_buf(), Arc::new(self.clone()));
        Ok(())
    }

    /// Reads a spec written by [`PrepSpec::save`], memoized per directory.
    ///
    /// # Errors
    ///
    /// Returns an error if either map is missing or malformed.
    pub fn load(dir: impl AsRef<Path>) -> Result<Arc<Self>> {
        let dir = dir.as_ref();
        if let Some(spec) = PREP_CACHE.read().get(dir) {
            return Ok(Arc::clone(spec));
        }
        let spec = Arc::new(Self {
            cat: read_json(&dir.join(CAT_ORIG_TO_PREP_COL_MAP_FILE))?,
            num: read_json(&dir.join(NUM_ORIG_TO_PREP_COL_MAP_FILE))?,
        });
        debug!(path = %dir.display(), "loaded prep");
        PREP_CACHE.write().insert(dir.to_path_buf(), Arc::clone(&spec));
        Ok(spec)
    }
}

fn index_scaler(n_cats: usize) -> ScalerParams {
    #[allow(clippy::cast_precision_loss)]
    ScalerParams::MinMax {
        orig_min: 0.0,
        orig_max: n_cats as f64,
        target_min: -1.0,
        target_max: 1.0,
    }
}

impl Transform for PrepSpec {
    fn apply(&self, batch: RecordBatch) -> Result<RecordBatch> {
        let n = batch.num_rows();
        let mut out = batch;

        for (col, (prep_col, details)) in &self.cat.columns {
            let array = match out.column_by_name(col) {
                Some(a) => Arc::clone(a),
                None => {
                    let missing = new_null_array(&DataType::Float64, n);
                    out = set_column(&out, col, Arc::clone(&missing))?;
                    missing
                }
            };
            let mut idx = category_index(col, &array, &details.cats)?;
            if self.cat.scale {
                let scaler = index_scaler(details.n_cats);
                idx.iter_mut().for_each(|v| *v = scaler.scale(*v));
            }
            out = set_column(&out, prep_col, Arc::new(Float64Array::from(idx)))?;
        }

        for (col, (prep_col, details)) in &self.num.columns {
            let values = match out.column_by_name(col) {
                Some(a) if a.data_type() != &DataType::Null => numeric_values(col, a)?,
                Some(_) => vec![f64::NAN; n],
                None => {
                    out = set_column(
                        &out,
                        col,
                        Arc::new(Float64Array::from(vec![details.null_fill_value; n])),
                    )?;
                    vec![details.null_fill_value; n]
                }
            };
            let params = self.num.scaler.and_then(|s| details.params(s));
            let prepped: Float64Array = values
                .iter()
                .map(|&v| {
                    let filled = if details.is_null(v) {
                        details.null_fill_value
                    } else {
                        v
                    };
                    Some(params.map_or(filled, |p| p.scale(filled)))
                })
                .collect();
            out = set_column(&out, prep_col, Arc::new(prepped))?;
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use arrow::{
        array::{Int64Array, StringArray},
        datatypes::{Field, Schema},
    };

    use super::*;
    use crate::{stats::values::CategoryValue, transform::STD_SCL_PREFIX};

    fn create_test_batch() -> RecordBatch {
        let schema = Arc::new(Schema::new(vec![
            Field::new("c", DataType::Utf8, true),
            Field::new("x", DataType::Int64, true),
        ]));
        RecordBatch::try_new(
            schema,
            vec![
                Arc::new(StringArray::from(vec![Some("A"), Some("B"), None, Some("Z")])),
                Arc::new(Int64Array::from(vec![Some(1), None, Some(3), Some(-99)])),
            ],
        )
        .ok()
        .unwrap_or_else(|| panic!("Should create batch"))
    }

    fn create_test_spec() -> PrepSpec {
        let mut spec = PrepSpec::default();
        spec.cat.scale = true;
        spec.cat.columns.insert(
            "c".to_string(),
            (
                "__MinMaxScl____CatIdx__c__".to_string(),
                CatDetails {
                    cats: vec![CategoryValue::Str("A".into()), CategoryValue::Str("B".into())],
                    n_cats: 2,
                },
            ),
        );
        spec.num.scaler = Some(Scaler::Standard);
        spec.num.columns.insert(
            "x".to_string(),
            (
                format!("{STD_SCL_PREFIX}x__"),
                NumDetails::fill_only((Some(-99.0), None), 2.0).with_params(
                    ScalerParams::Standard {
                        mean: 2.0,
                        std_dev: 1.0,
                    },
                ),
            ),
        );
        spec
    }

    fn float_column(batch: &RecordBatch, name: &str) -> Vec<f64> {
        batch
            .column_by_name(name)
            .and_then(|a| a.as_any().downcast_ref::<Float64Array>())
            .map(|a| a.values().to_vec())
            .unwrap_or_else(|| panic!("Should have float column {name}"))
    }

    #[test]
    fn test_prep_applies_index_fill_and_scale() {
        let spec = create_test_spec();
        let out = spec
            .apply(create_test_batch())
            .ok()
            .unwrap_or_else(|| panic!("Should apply"));
        assert_eq!(out.num_columns(), 4);
        assert_eq!(
            float_column(&out, "__MinMaxScl____CatIdx__c__"),
            vec![-1.0, 0.0, 1.0, 1.0]
        );
        assert_eq!(float_column(&out, "__StdScl__x__"), vec![-1.0, 0.0, 1.0, 0.0]);
    }

    #[test]
    fn test_missing_columns_are_added() {
        let spec = create_test_spec();
        let batch = create_test_batch();
        let batch = RecordBatch::try_new(
            Arc::new(Schema::new(vec![Field::new("y", DataType::Int64, true)])),
            vec![Arc::clone(batch.column(1))],
        )
        .ok()
        .unwrap_or_else(|| panic!("Should create batch"));
        let out = spec
            .apply(batch)
            .ok()
            .unwrap_or_else(|| panic!("Should apply"));
        assert_eq!(
            float_column(&out, "__MinMaxScl____CatIdx__c__"),
            vec![1.0; 4]
        );
        assert_eq!(float_column(&out, "__StdScl__x__"), vec![0.0; 4]);
        assert!(out.column_by_name("c").is_some());
    }

    #[test]
    fn test_sql_statement() {
        let sql = create_test_spec().sql_statement();
        assert!(sql.starts_with("SELECT *, (2.0 * ((CASE WHEN (c = 'A') THEN 0"));
        assert!(sql.contains("COALESCE(CASE WHEN (STRING(x) = 'NaN') OR (x <= -99.0) THEN NULL ELSE x END, 2.0)"));
        assert!(sql.contains("AS __StdScl__x__"));
        assert!(sql.ends_with("FROM __THIS__"));
    }

    #[test]
    fn test_save_load_parity() {
        let dir = tempfile::tempdir()
            .ok()
            .unwrap_or_else(|| panic!("Should create temp dir"));
        let spec = create_test_spec();
        spec.save(dir.path())
            .ok()
            .unwrap_or_else(|| panic!("Should save"));
        for file in [
            CAT_ORIG_TO_PREP_COL_MAP_FILE,
            NUM_ORIG_TO_PREP_COL_MAP_FILE,
            PREP_SQL_STATEMENT_FILE,
        ] {
            assert!(dir.path().join(file).exists());
        }

        PREP_CACHE.write().remove(dir.path());
        let loaded = PrepSpec::load(dir.path())
            .ok()
            .unwrap_or_else(|| panic!("Should load"));
        assert_eq!(*loaded, spec);

        let a = spec.apply(create_test_batch()).ok();
        let b = loaded.apply(create_test_batch()).ok();
        assert!(a.is_some());
        assert_eq!(a, b);
    }

    #[test]
    fn test_reload_from_copy_keeps_float_bits() {
        let saved = tempfile::tempdir()
            .ok()
            .unwrap_or_else(|| panic!("Should create temp dir"));
        let copied = tempfile::tempdir()
            .ok()
            .unwrap_or_else(|| panic!("Should create temp dir"));
        let fill = 138.989_660_656_826_35;
        let params = ScalerParams::Standard {
            mean: 0.1 + 0.2,
            std_dev: 2.0_f64.sqrt() / 3.0,
        };
        let mut spec = PrepSpec::default();
        spec.num.scaler = Some(Scaler::Standard);
        spec.num.columns.insert(
            "x".to_string(),
            (
                format!("{STD_SCL_PREFIX}x__"),
                NumDetails::fill_only((None, Some(1e300)), fill).with_params(params),
            ),
        );
        spec.save(saved.path())
            .ok()
            .unwrap_or_else(|| panic!("Should save"));
        for file in [
            CAT_ORIG_TO_PREP_COL_MAP_FILE,
            NUM_ORIG_TO_PREP_COL_MAP_FILE,
            PREP_SQL_STATEMENT_FILE,
        ] {
            std::fs::copy(saved.path().join(file), copied.path().join(file))
                .ok()
                .unwrap_or_else(|| panic!("Should copy {file}"));
        }

        let loaded = PrepSpec::load(copied.path())
            .ok()
            .unwrap_or_else(|| panic!("Should load"));
        let (_, details) = loaded
            .num
            .columns
            .get("x")
            .unwrap_or_else(|| panic!("Should keep x"));
        assert_eq!(details.null_fill_value.to_bits(), fill.to_bits());
        assert_eq!(*loaded, spec);
    }
}
