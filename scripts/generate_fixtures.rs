//! Fixture generation for local experiments.
//!
//! Writes deterministic partitioned Parquet datasets under `test_fixtures/`
//! and loads each one back as a smoke check.
//! Run: `cargo run --bin generate_fixtures`

#![allow(
    clippy::cast_lossless,
    clippy::cast_precision_loss,
    clippy::cast_possible_truncation,
    clippy::cast_possible_wrap
)]

use std::{
    fs::{self, File},
    io::Write,
    path::{Path, PathBuf},
    sync::Arc,
};

use arrow::{
    array::{Float64Array, Int64Array, StringArray, TimestampMicrosecondArray},
    datatypes::{DataType, Field, Schema, TimeUnit},
    record_batch::RecordBatch,
};
use chrono::{Duration, NaiveDate};
use parcela::{DatasetRoot, FileDataset, LoadOptions};
use parquet::{arrow::ArrowWriter, basic::Compression, file::properties::WriterProperties};
use rand::{rngs::StdRng, Rng, SeedableRng};

const FIXTURE_DIR: &str = "test_fixtures";
const SITES: [&str; 3] = ["north", "south", "west"];
const CATEGORIES: [&str; 5] = ["A", "B", "C", "D", "E"];
const SENTINEL: f64 = -9999.0;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    println!("=== parcela fixture generator ===\n");
    fs::create_dir_all(FIXTURE_DIR)?;

    let series = generate_time_series()?;
    let flat = generate_flat()?;
    generate_corrupt_piece()?;

    for (root, options) in [
        (series, LoadOptions::default().with_time_col(Some("ts"))),
        (flat, LoadOptions::default()),
    ] {
        let dataset = FileDataset::load(DatasetRoot::local(&root), options)?;
        println!(
            "  {}: {} pieces, columns {:?}, ~{} rows",
            root.display(),
            dataset.n_pieces(),
            dataset.columns(),
            dataset.approx_n_rows()?
        );
    }

    println!("\nAll fixtures generated");
    Ok(())
}

fn write_piece(path: &Path, batch: &RecordBatch) -> Result<(), Box<dyn std::error::Error>> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let props = WriterProperties::builder()
        .set_compression(Compression::SNAPPY)
        .build();
    let mut writer = ArrowWriter::try_new(File::create(path)?, batch.schema(), Some(props))?;
    writer.write(batch)?;
    writer.close()?;
    Ok(())
}

/// `site=*/date=*` pieces of hourly readings per entity. About 3% of `x`
/// is null and 1% is the sentinel.
fn generate_time_series() -> Result<PathBuf, Box<dyn std::error::Error>> {
    let root = Path::new(FIXTURE_DIR).join("series");
    let schema = Arc::new(Schema::new(vec![
        Field::new("id", DataType::Int64, false),
        Field::new("ts", DataType::Timestamp(TimeUnit::Microsecond, None), false),
        Field::new("x", DataType::Float64, true),
        Field::new("y", DataType::Float64, false),
        Field::new("c", DataType::Utf8, false),
    ]));
    let mut rng = StdRng::seed_from_u64(42);
    let start = NaiveDate::from_ymd_opt(2024, 1, 1).ok_or("invalid start date")?;

    for (s, site) in SITES.iter().enumerate() {
        for day in 0..4 {
            let date = start + Duration::days(day);
            let midnight = date
                .and_hms_opt(0, 0, 0)
                .ok_or("invalid time")?
                .and_utc()
                .timestamp_micros();

            let mut ids = Vec::new();
            let mut ts = Vec::new();
            let mut xs = Vec::new();
            let mut ys = Vec::new();
            let mut cs = Vec::new();
            for entity in 0..20i64 {
                for hour in 0..24i64 {
                    ids.push(s as i64 * 100 + entity);
                    ts.push(midnight + hour * 3_600_000_000);
                    let roll: f64 = rng.gen();
                    xs.push(if roll < 0.03 {
                        None
                    } else if roll < 0.04 {
                        Some(SENTINEL)
                    } else {
                        Some(rng.gen_range(0.0..100.0))
                    });
                    ys.push((hour as f64 / 24.0 * std::f64::consts::TAU).sin() + entity as f64);
                    cs.push(CATEGORIES[rng.gen_range(0..CATEGORIES.len())]);
                }
            }
            let batch = RecordBatch::try_new(
                Arc::clone(&schema),
                vec![
                    Arc::new(Int64Array::from(ids)),
                    Arc::new(TimestampMicrosecondArray::from(ts)),
                    Arc::new(Float64Array::from(xs)),
                    Arc::new(Float64Array::from(ys)),
                    Arc::new(StringArray::from(cs)),
                ],
            )?;
            let path = root
                .join(format!("site={site}"))
                .join(format!("date={}", date.format("%Y-%m-%d")))
                .join("part-0.parquet");
            write_piece(&path, &batch)?;
        }
    }
    println!("Created {}/", root.display());
    Ok(root)
}

/// Unpartitioned pieces with a skewed categorical column.
fn generate_flat() -> Result<PathBuf, Box<dyn std::error::Error>> {
    let root = Path::new(FIXTURE_DIR).join("flat");
    let schema = Arc::new(Schema::new(vec![
        Field::new("id", DataType::Int64, false),
        Field::new("x", DataType::Float64, false),
        Field::new("c", DataType::Utf8, false),
    ]));
    let mut rng = StdRng::seed_from_u64(7);
    for p in 0..10i64 {
        let ids: Vec<i64> = (p * 1000..(p + 1) * 1000).collect();
        let xs: Vec<f64> = (0..1000).map(|_| rng.gen_range(-50.0..50.0)).collect();
        let cs: Vec<&str> = (0..1000)
            .map(|i| match i % 20 {
                0..=9 => "A",
                10..=15 => "B",
                16..=18 => "C",
                _ => "D",
            })
            .collect();
        let batch = RecordBatch::try_new(
            Arc::clone(&schema),
            vec![
                Arc::new(Int64Array::from(ids)),
                Arc::new(Float64Array::from(xs)),
                Arc::new(StringArray::from(cs)),
            ],
        )?;
        write_piece(&root.join(format!("part-{p:03}.parquet")), &batch)?;
    }
    println!("Created {}/", root.display());
    Ok(root)
}

/// A piece that is not Parquet, for error-path experiments.
fn generate_corrupt_piece() -> Result<(), Box<dyn std::error::Error>> {
    let path = Path::new(FIXTURE_DIR).join("corrupt").join("part-0.parquet");
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let mut file = File::create(&path)?;
    file.write_all(b"PAR1 this is not a parquet file")?;
    println!("Created {}", path.display());
    Ok(())
}
