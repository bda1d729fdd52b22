//! Integration tests for parcela.

#![allow(
    clippy::cast_possible_truncation,
    clippy::cast_possible_wrap,
    clippy::cast_precision_loss,
    clippy::uninlined_format_args,
    clippy::cast_lossless,
    clippy::float_cmp
)]

use std::{
    fs::File,
    path::{Path, PathBuf},
    sync::Arc,
};

use arrow::{
    array::{Array, Float64Array, Int64Array, RecordBatch, StringArray, TimestampMicrosecondArray},
    datatypes::{DataType, Field, Schema, TimeUnit},
};
use bytes::Bytes;
use parcela::{
    prep::{CAT_ORIG_TO_PREP_COL_MAP_FILE, NUM_ORIG_TO_PREP_COL_MAP_FILE, PREP_SQL_STATEMENT_FILE},
    stats::values::CategoryValue,
    ColumnGroup, DatasetRoot, Error, FileDataset, FillOptions, GeneratorOptions, LoadOptions,
    MemoryBackend, PieceCache, PrepOptions, PrepSpec, RetryPolicy, SampleStat, Scaler,
    StorageBackend, Tail, Transform,
};
use parquet::arrow::ArrowWriter;

fn write_parquet(path: &Path, batch: &RecordBatch) {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .ok()
            .unwrap_or_else(|| panic!("Should create dirs"));
    }
    let file = File::create(path)
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

fn parquet_bytes(batch: &RecordBatch) -> Bytes {
    let mut writer = ArrowWriter::try_new(Vec::new(), batch.schema(), None)
        .ok()
        .unwrap_or_else(|| panic!("Should create writer"));
    writer
        .write(batch)
        .ok()
        .unwrap_or_else(|| panic!("Should write"));
    Bytes::from(
        writer
            .into_inner()
            .ok()
            .unwrap_or_else(|| panic!("Should finish")),
    )
}

/// `rows` rows of `id` and `x`, with every 20th `x` NaN.
fn create_numeric_batch(offset: i64, rows: i64) -> RecordBatch {
    let schema = Arc::new(Schema::new(vec![
        Field::new("id", DataType::Int64, false),
        Field::new("x", DataType::Float64, false),
    ]));
    let ids: Vec<i64> = (offset..offset + rows).collect();
    let xs: Vec<f64> = (0..rows)
        .map(|i| if i % 20 == 0 { f64::NAN } else { (i % 97) as f64 })
        .collect();
    RecordBatch::try_new(
        schema,
        vec![
            Arc::new(Int64Array::from(ids)),
            Arc::new(Float64Array::from(xs)),
        ],
    )
    .ok()
    .unwrap_or_else(|| panic!("Should create batch"))
}

fn load(root: DatasetRoot, options: LoadOptions) -> FileDataset {
    FileDataset::load_with_cache(root, options, Arc::new(PieceCache::new()))
        .ok()
        .unwrap_or_else(|| panic!("Should load dataset"))
}

fn numeric_dataset(dir: &Path) -> FileDataset {
    for p in 0..3 {
        write_parquet(
            &dir.join(format!("part-{p}.parquet")),
            &create_numeric_batch(p * 1000, 1000),
        );
    }
    load(DatasetRoot::local(dir), LoadOptions::default().with_seed(42))
}

fn float_values(batch: &RecordBatch, name: &str) -> Vec<f64> {
    batch
        .column_by_name(name)
        .and_then(|a| a.as_any().downcast_ref::<Float64Array>())
        .map(|a| a.iter().map(|v| v.unwrap_or(f64::NAN)).collect())
        .unwrap_or_else(|| panic!("Should have float column {name}"))
}

#[test]
fn test_count_and_non_null_proportion() {
    let dir = tempfile::tempdir()
        .ok()
        .unwrap_or_else(|| panic!("Should create temp dir"));
    let ds = numeric_dataset(dir.path());

    assert_eq!(ds.n_pieces(), 3);
    assert_eq!(ds.n_rows().ok(), Some(3000));
    assert_eq!(ds.count("x").ok(), Some(2850));

    let proportion = ds
        .non_null_proportion("x")
        .ok()
        .unwrap_or_else(|| panic!("Should compute proportion"));
    assert!((proportion - 0.95).abs() < 0.02, "proportion = {proportion}");
}

#[test]
fn test_categorical_top_n_coverage() {
    let dir = tempfile::tempdir()
        .ok()
        .unwrap_or_else(|| panic!("Should create temp dir"));
    let mut cats = Vec::new();
    for (value, n) in [("A", 500), ("B", 300), ("C", 150), ("D", 50)] {
        cats.extend(std::iter::repeat(value).take(n));
    }
    let schema = Arc::new(Schema::new(vec![
        Field::new("id", DataType::Int64, false),
        Field::new("c", DataType::Utf8, false),
    ]));
    let batch = RecordBatch::try_new(
        schema,
        vec![
            Arc::new(Int64Array::from((0..1000).collect::<Vec<i64>>())),
            Arc::new(StringArray::from(cats)),
        ],
    )
    .ok()
    .unwrap_or_else(|| panic!("Should create batch"));
    write_parquet(&dir.path().join("part-0.parquet"), &batch);

    let options = LoadOptions::default()
        .with_max_n_cats(2)
        .with_min_proportion_by_max_n_cats(0.75)
        .with_seed(1);
    let ds = load(DatasetRoot::local(dir.path()), options);

    let (prepped, spec) = ds
        .prep(&[], &PrepOptions::default().with_scale_cat(false))
        .ok()
        .unwrap_or_else(|| panic!("Should prep"));
    let (out, details) = spec
        .cat
        .columns
        .get("c")
        .unwrap_or_else(|| panic!("Should treat c as categorical"));
    assert_eq!(out, "__CatIdx__c__");
    assert_eq!(
        details.cats,
        vec![CategoryValue::Str("A".into()), CategoryValue::Str("B".into())]
    );
    assert_eq!(details.n_cats, 2);

    let table = prepped
        .collect(Some(&[out.clone()]))
        .ok()
        .unwrap_or_else(|| panic!("Should collect"));
    let idx = float_values(&table, out);
    let count = |v: f64| idx.iter().filter(|x| **x == v).count();
    assert_eq!((count(0.0), count(1.0), count(2.0)), (500, 300, 200));
}

#[test]
fn test_split_weights_over_many_pieces() {
    let dir = tempfile::tempdir()
        .ok()
        .unwrap_or_else(|| panic!("Should create temp dir"));
    for p in 0..100 {
        write_parquet(
            &dir.path().join(format!("part-{p:03}.parquet")),
            &create_numeric_batch(p * 10, 10),
        );
    }
    let ds = load(
        DatasetRoot::local(dir.path()),
        LoadOptions::default().with_seed(9),
    );
    let parts = ds
        .split(&[0.7, 0.3])
        .ok()
        .unwrap_or_else(|| panic!("Should split"));
    assert_eq!(parts.len(), 2);
    assert_eq!(parts[0].n_pieces() + parts[1].n_pieces(), 100);
    assert!(parts[0].n_pieces().abs_diff(70) <= 1);

    let mut all: Vec<String> = parts.iter().flat_map(FileDataset::piece_paths).collect();
    all.sort();
    all.dedup();
    assert_eq!(all.len(), 100);
}

#[test]
fn test_windowed_generator_shape() {
    let dir = tempfile::tempdir()
        .ok()
        .unwrap_or_else(|| panic!("Should create temp dir"));
    let schema = Arc::new(Schema::new(vec![
        Field::new("id", DataType::Utf8, false),
        Field::new("ts", DataType::Timestamp(TimeUnit::Microsecond, None), false),
        Field::new("y", DataType::Float64, false),
    ]));
    // Rows are written in reverse time order; the pipeline sorts them.
    let mut ids = Vec::new();
    let mut ts = Vec::new();
    let mut ys = Vec::new();
    for entity in ["a", "b", "c", "d"] {
        for step in (0..40i64).rev() {
            ids.push(entity);
            ts.push(step * 60_000_000);
            ys.push(step as f64);
        }
    }
    let batch = RecordBatch::try_new(
        schema,
        vec![
            Arc::new(StringArray::from(ids)),
            Arc::new(TimestampMicrosecondArray::from(ts)),
            Arc::new(Float64Array::from(ys)),
        ],
    )
    .ok()
    .unwrap_or_else(|| panic!("Should create batch"));
    write_parquet(&dir.path().join("date=2024-01-01/part-0.parquet"), &batch);

    let ds = load(
        DatasetRoot::local(dir.path()),
        LoadOptions::default().with_time_col(Some("ts")).with_seed(3),
    );
    assert!(ds.has_time_series());
    assert_eq!(ds.index_cols(), vec!["id", "date", "ts"]);

    let options = GeneratorOptions::default()
        .group(ColumnGroup::windowed(["y", "__tOrd__"], -3, 0))
        .group(ColumnGroup::flat(["y"]))
        .batch_size(32);
    let mut generator = ds
        .generator(&options)
        .ok()
        .unwrap_or_else(|| panic!("Should build generator"));
    for _ in 0..5 {
        let batch = generator
            .next()
            .and_then(|b| b.ok())
            .unwrap_or_else(|| panic!("Should yield batch"));
        let window = batch[0]
            .as_windowed()
            .unwrap_or_else(|| panic!("Should be windowed"));
        assert_eq!(window.shape(), &[32, 4, 2]);
        assert_eq!(batch[1].shape(), vec![32, 1]);
        for i in 0..32 {
            assert!(window[[i, 0, 1]] >= 0.0);
            assert_eq!(window[[i, 3, 0]] - window[[i, 0, 0]], 3.0);
            assert_eq!(window[[i, 3, 0]], batch[1].as_flat().map_or(f64::NAN, |f| f[[i, 0]]));
        }
    }
}

#[test]
fn test_generator_batches_have_exact_size() {
    let dir = tempfile::tempdir()
        .ok()
        .unwrap_or_else(|| panic!("Should create temp dir"));
    let ds = numeric_dataset(dir.path());
    for batch_size in [1, 7, 64, 250] {
        let options = GeneratorOptions::default()
            .group(ColumnGroup::flat(["x"]))
            .group(ColumnGroup::flat(["id", "x"]))
            .batch_size(batch_size)
            .chunk_size(500);
        let generator = ds
            .generator(&options)
            .ok()
            .unwrap_or_else(|| panic!("Should build generator"));
        for batch in generator.take(10) {
            let batch = batch.ok().unwrap_or_else(|| panic!("Should yield batch"));
            assert!(batch.iter().all(|a| a.shape()[0] == batch_size));
        }
    }
}

#[test]
fn test_fillna_is_idempotent() {
    let dir = tempfile::tempdir()
        .ok()
        .unwrap_or_else(|| panic!("Should create temp dir"));
    let ds = numeric_dataset(dir.path());
    let (filled, spec) = ds
        .fillna(&["x".to_string()], &FillOptions::default())
        .ok()
        .unwrap_or_else(|| panic!("Should fill"));
    let out_col = spec
        .columns
        .get("x")
        .map(|(out, _)| out.clone())
        .unwrap_or_else(|| panic!("Should fill x"));
    assert_eq!(out_col, "__NullFill__x__");

    let once = filled
        .collect(None)
        .ok()
        .unwrap_or_else(|| panic!("Should collect"));
    let values = float_values(&once, &out_col);
    assert!(values.iter().all(|v| !v.is_nan()));

    // Feed the filled values back in as `x`.
    let refill = RecordBatch::try_new(
        Arc::new(Schema::new(vec![Field::new("x", DataType::Float64, true)])),
        vec![Arc::new(Float64Array::from(values.clone()))],
    )
    .ok()
    .unwrap_or_else(|| panic!("Should create batch"));
    let twice = spec
        .apply(refill)
        .ok()
        .unwrap_or_else(|| panic!("Should apply"));
    assert_eq!(float_values(&twice, &out_col), values);
}

#[test]
fn test_prep_save_load_parity() {
    let dir = tempfile::tempdir()
        .ok()
        .unwrap_or_else(|| panic!("Should create temp dir"));
    let prep_dir = tempfile::tempdir()
        .ok()
        .unwrap_or_else(|| panic!("Should create temp dir"));
    let shipped_dir = tempfile::tempdir()
        .ok()
        .unwrap_or_else(|| panic!("Should create temp dir"));
    let ds = numeric_dataset(dir.path());

    let options = PrepOptions::default()
        .with_scaler(Some(Scaler::Standard))
        .save_to(prep_dir.path());
    let (prepped, spec) = ds
        .prep(&[], &options)
        .ok()
        .unwrap_or_else(|| panic!("Should prep"));
    assert!(spec.num.columns.contains_key("x"));

    // A fresh directory is only readable from disk, never from memory.
    for file in [
        CAT_ORIG_TO_PREP_COL_MAP_FILE,
        NUM_ORIG_TO_PREP_COL_MAP_FILE,
        PREP_SQL_STATEMENT_FILE,
    ] {
        std::fs::copy(prep_dir.path().join(file), shipped_dir.path().join(file))
            .ok()
            .unwrap_or_else(|| panic!("Should copy {file}"));
    }

    let (reloaded, loaded_spec) = ds
        .prep(&[], &PrepOptions::default().load_from(shipped_dir.path()))
        .ok()
        .unwrap_or_else(|| panic!("Should load prep"));
    assert_eq!(loaded_spec, spec);
    let direct = PrepSpec::load(shipped_dir.path())
        .ok()
        .unwrap_or_else(|| panic!("Should load"));
    assert_eq!(*direct, spec);

    let cols = spec.output_columns();
    let a = prepped
        .collect(Some(&cols))
        .ok()
        .unwrap_or_else(|| panic!("Should collect"));
    let b = reloaded
        .collect(Some(&cols))
        .ok()
        .unwrap_or_else(|| panic!("Should collect"));
    for col in &cols {
        let (a, b) = (float_values(&a, col), float_values(&b, col));
        assert_eq!(a.len(), 3000);
        assert!(a.iter().all(|v| !v.is_nan()));
        let bits = |v: &[f64]| v.iter().map(|x| x.to_bits()).collect::<Vec<_>>();
        assert_eq!(bits(&a), bits(&b));
    }
}

#[test]
fn test_constant_column_is_not_standardized() {
    let dir = tempfile::tempdir()
        .ok()
        .unwrap_or_else(|| panic!("Should create temp dir"));
    let xs: Vec<f64> = (0..100).map(|i| if i == 99 { 10.0 } else { 0.0 }).collect();
    let ys: Vec<f64> = (0..100).map(|i| i as f64).collect();
    let batch = RecordBatch::try_new(
        Arc::new(Schema::new(vec![
            Field::new("x", DataType::Float64, true),
            Field::new("y", DataType::Float64, true),
        ])),
        vec![
            Arc::new(Float64Array::from(xs)),
            Arc::new(Float64Array::from(ys)),
        ],
    )
    .ok()
    .unwrap_or_else(|| panic!("Should create batch"));
    write_parquet(&dir.path().join("part-0.parquet"), &batch);
    let ds = load(DatasetRoot::local(dir.path()), LoadOptions::default());

    // Trimming the lower tail leaves x with a single distinct value.
    let options = PrepOptions::default()
        .with_scaler(Some(Scaler::Standard))
        .with_fill(FillOptions::default().with_outlier_tails(Tail::Lower))
        .force_num("x")
        .force_num("y");
    let (prepped, spec) = ds
        .prep(&[], &options)
        .ok()
        .unwrap_or_else(|| panic!("Should prep"));
    assert!(!spec.num.columns.contains_key("x"));
    let (y_out, _) = spec
        .num
        .columns
        .get("y")
        .unwrap_or_else(|| panic!("Should prep y"));
    let out = prepped
        .collect(Some(&[y_out.clone()]))
        .ok()
        .unwrap_or_else(|| panic!("Should collect"));
    assert!(float_values(&out, y_out).iter().all(|v| v.is_finite()));
    assert!(!spec.sql_statement().contains("CAST('NaN' AS DOUBLE)"));
}

#[test]
fn test_metadata_is_read_once() {
    let dir = tempfile::tempdir()
        .ok()
        .unwrap_or_else(|| panic!("Should create temp dir"));
    for p in 0..3 {
        write_parquet(
            &dir.path().join(format!("part-{p}.parquet")),
            &create_numeric_batch(p * 100, 100),
        );
    }
    let cache = Arc::new(PieceCache::new());
    let ds = FileDataset::load_with_cache(
        DatasetRoot::local(dir.path()),
        LoadOptions::default(),
        Arc::clone(&cache),
    )
    .ok()
    .unwrap_or_else(|| panic!("Should load"));
    let read_all = || {
        for piece in ds.piece_paths() {
            let meta = ds
                .registry()
                .schema_and_row_count(&piece)
                .ok()
                .unwrap_or_else(|| panic!("Should read metadata"));
            assert_eq!(meta.num_rows(), 100);
            assert_eq!(meta.columns(), vec!["id", "x"]);
        }
    };
    read_all();
    let reads = cache.metadata_reads();
    assert_eq!(reads, 3);

    read_all();
    assert_eq!(ds.approx_n_rows().ok(), Some(300));
    assert_eq!(cache.metadata_reads(), reads);

    // A second handle on the same cache does not re-read either.
    let again = FileDataset::load_with_cache(
        DatasetRoot::local(dir.path()),
        LoadOptions::default(),
        Arc::clone(&cache),
    );
    assert!(again.is_ok());
    assert_eq!(cache.metadata_reads(), reads);
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn store_with_pieces(n: i64) -> Arc<MemoryBackend> {
    let store = Arc::new(MemoryBackend::new());
    for p in 0..n {
        store
            .put(
                &format!("data/region=eu/part-{p}.parquet"),
                parquet_bytes(&create_numeric_batch(p * 100, 100)),
            )
            .ok()
            .unwrap_or_else(|| panic!("Should put"));
    }
    store
}

fn store_options(cache_dir: PathBuf, max_attempts: u32) -> LoadOptions {
    LoadOptions::default()
        .with_cache_dir(cache_dir)
        .with_retry(RetryPolicy {
            max_attempts,
            base_delay_ms: 1,
            max_delay_ms: 2,
        })
}

#[test]
fn test_store_pieces_download_once() {
    let cache_dir = tempfile::tempdir()
        .ok()
        .unwrap_or_else(|| panic!("Should create temp dir"));
    let store = store_with_pieces(2);
    let root = DatasetRoot::store(store.clone(), "mem", "data");
    let ds = load(root, store_options(cache_dir.path().to_path_buf(), 3));

    assert_eq!(ds.n_pieces(), 2);
    assert!(ds.piece_paths()[0].starts_with("store://mem/data/region=eu/"));
    assert!(ds.columns().contains(&"region".to_string()));
    assert_eq!(ds.count("x").ok(), Some(190));
    assert_eq!(store.get_count(), 2);
}

#[test]
fn test_transient_failures_are_retried() {
    init_tracing();
    let cache_dir = tempfile::tempdir()
        .ok()
        .unwrap_or_else(|| panic!("Should create temp dir"));
    let store = store_with_pieces(1);
    store.fail_next_gets(2);
    let root = DatasetRoot::store(store.clone(), "mem", "data");
    let ds = load(root, store_options(cache_dir.path().to_path_buf(), 3));
    assert_eq!(ds.n_rows().ok(), Some(100));
    assert_eq!(store.get_count(), 3);
}

#[test]
fn test_exhausted_retries_report_piece_unavailable() {
    init_tracing();
    let cache_dir = tempfile::tempdir()
        .ok()
        .unwrap_or_else(|| panic!("Should create temp dir"));
    let store = store_with_pieces(1);
    store.fail_next_gets(10);
    let root = DatasetRoot::store(store.clone(), "mem", "data");
    let result = FileDataset::load_with_cache(
        root,
        store_options(cache_dir.path().to_path_buf(), 2),
        Arc::new(PieceCache::new()),
    );
    let err = result
        .err()
        .unwrap_or_else(|| panic!("Should fail to load"));
    assert!(err.is_piece_unavailable());
    assert!(matches!(err, Error::PieceUnavailable { attempts: 2, .. }));
    assert_eq!(store.get_count(), 2);
}

#[test]
fn test_outlier_bounds_and_stats_survive_rename() {
    let dir = tempfile::tempdir()
        .ok()
        .unwrap_or_else(|| panic!("Should create temp dir"));
    let ds = numeric_dataset(dir.path());
    let lo = ds.outlier_rst_min("x").ok();
    let hi = ds.outlier_rst_max("x").ok();
    let median = ds.sample_stat("x", SampleStat::Median).ok();
    assert!(lo <= median && median <= hi);

    let renamed = ds
        .rename(&[("x", "z")])
        .ok()
        .unwrap_or_else(|| panic!("Should rename"));
    assert_eq!(renamed.outlier_rst_min("z").ok(), lo);
    assert!(renamed.stats_cache().repr_sample().is_some());
    let z = renamed
        .collect(Some(&["z".to_string()]))
        .ok()
        .unwrap_or_else(|| panic!("Should collect"));
    assert_eq!(z.column(0).len(), 3000);
}

mod properties {
    use proptest::prelude::*;

    use super::*;

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(16))]

        #[test]
        fn prop_outlier_bounds_bracket_median(
            values in prop::collection::vec(-1000.0f64..1000.0, 20..200),
        ) {
            let distinct = values.iter().any(|v| (v - values[0]).abs() > 1e-9);
            prop_assume!(distinct);

            let dir = tempfile::tempdir()
                .ok()
                .unwrap_or_else(|| panic!("Should create temp dir"));
            let n = values.len() as i64;
            let batch = RecordBatch::try_new(
                Arc::new(Schema::new(vec![
                    Field::new("id", DataType::Int64, false),
                    Field::new("x", DataType::Float64, false),
                ])),
                vec![
                    Arc::new(Int64Array::from((0..n).collect::<Vec<_>>())),
                    Arc::new(Float64Array::from(values)),
                ],
            )
            .ok()
            .unwrap_or_else(|| panic!("Should create batch"));
            write_parquet(&dir.path().join("part-0.parquet"), &batch);
            let ds = load(DatasetRoot::local(dir.path()), LoadOptions::default().with_seed(0));

            let lo = ds.outlier_rst_min("x").ok().unwrap_or(f64::NAN);
            let median = ds.sample_stat("x", SampleStat::Median).ok().unwrap_or(f64::NAN);
            let hi = ds.outlier_rst_max("x").ok().unwrap_or(f64::NAN);
            prop_assert!(lo <= median, "{} > {}", lo, median);
            prop_assert!(median <= hi, "{} > {}", median, hi);
        }
    }
}
