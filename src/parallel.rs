//! Batch generation on worker threads.
//!
//! Every worker rebuilds its own [`BatchGenerator`] from the JSON form of
//! one [`GeneratorSpec`], with its own seed, and feeds a bounded channel.
//! Workers share nothing but the [`PieceCache`].
//!
//! # Example
//!
//! ```ignore
//! use parcela::{ColumnGroup, GeneratorOptions};
//!
//! let options = GeneratorOptions::default().group(ColumnGroup::flat(["x", "y"]));
//! let batches = dataset.parallel_generator(&options, 4, 8)?;
//! for batch in batches.take(1000) {
//!     let batch = batch?;
//! }
//! ```

use std::{
    sync::{
        mpsc::{self, Receiver, SyncSender},
        Arc,
    },
    thread,
};

use tracing::{debug, info, warn};

use crate::{
    error::{Error, Result},
    generator::{Batch, BatchGenerator, GeneratorSpec},
    registry::PieceCache,
};

/// Batches from several generator threads, in arrival order.
///
/// Dropping it stops the workers once their current chunk is done.
#[derive(Debug)]
pub struct ParallelGenerator {
    receiver: Option<Receiver<Result<Batch>>>,
    handles: Vec<thread::JoinHandle<()>>,
}

impl ParallelGenerator {
    /// Starts `workers` generators feeding a channel of `prefetch` batches.
    ///
    /// Worker `i` uses seed `seed + i` when [`GeneratorSpec::seed`] is set.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidConfig`] for zero workers or a spec that
    /// cannot be serialized, and an I/O error if a thread cannot start.
    pub fn spawn(
        spec: &GeneratorSpec,
        cache: Arc<PieceCache>,
        workers: usize,
        prefetch: usize,
    ) -> Result<Self> {
        if workers == 0 {
            return Err(Error::invalid_config("At least one worker is needed"));
        }
        let json = spec.to_json()?;
        let (tx, rx) = mpsc::sync_channel(prefetch.max(1));

        let mut handles = Vec::with_capacity(workers);
        for worker in 0..workers {
            let json = json.clone();
            let cache = Arc::clone(&cache);
            let tx = tx.clone();
            let handle = thread::Builder::new()
                .name(format!("parcela-gen-{worker}"))
                .spawn(move || run_worker(worker, &json, cache, &tx))
                .map_err(|source| Error::Io { path: None, source })?;
            handles.push(handle);
        }
        info!(workers, prefetch, "started generator workers");
        Ok(Self {
            receiver: Some(rx),
            handles,
        })
    }

    /// Number of worker threads.
    pub fn workers(&self) -> usize {
        self.handles.len()
    }
}

fn run_worker(worker: usize, json: &str, cache: Arc<PieceCache>, tx: &SyncSender<Result<Batch>>) {
    let generator = GeneratorSpec::from_json(json).and_then(|mut spec| {
        spec.seed = spec
            .seed
            .map(|s| s.wrapping_add(u64::try_from(worker).unwrap_or(0)));
        BatchGenerator::new(spec, cache)
    });
    let generator = match generator {
        Ok(g) => g,
        Err(e) => {
            warn!(worker, error = %e, "generator worker failed to start");
            let _ = tx.send(Err(e));
            return;
        }
    };

    for item in generator {
        let failed = item.is_err();
        if let Err(e) = &item {
            warn!(worker, error = %e, "generator worker stopped");
        }
        if tx.send(item).is_err() || failed {
            break;
        }
    }
    debug!(worker, "generator worker exited");
}

impl Iterator for ParallelGenerator {
    type Item = Result<Batch>;

    fn next(&mut self) -> Option<Self::Item> {
        self.receiver.as_ref()?.recv().ok()
    }
}

impl Drop for ParallelGenerator {
    fn drop(&mut self) {
        drop(self.receiver.take());
        for handle in self.handles.drain(..) {
            if handle.join().is_err() {
                warn!("generator worker panicked");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::fs::File;

    use arrow::{
        array::{Float64Array, Int64Array, RecordBatch},
        datatypes::{DataType, Field, Schema},
    };
    use parquet::arrow::ArrowWriter;

    use super::*;
    use crate::{
        config::LoadOptions,
        dataset::FileDataset,
        generator::{ColumnGroup, GeneratorOptions},
        registry::DatasetRoot,
        transform::{Mapper, Map},
    };

    fn create_test_dataset(dir: &std::path::Path) -> FileDataset {
        let schema = Arc::new(Schema::new(vec![
            Field::new("id", DataType::Int64, false),
            Field::new("x", DataType::Float64, false),
        ]));
        for p in 0..3i64 {
            let batch = RecordBatch::try_new(
                Arc::clone(&schema),
                vec![
                    Arc::new(Int64Array::from((0..64).map(|i| p * 64 + i).collect::<Vec<_>>())),
                    Arc::new(Float64Array::from((0..64).map(|i| i as f64).collect::<Vec<_>>())),
                ],
            )
            .ok()
            .unwrap_or_else(|| panic!("Should create batch"));
            let file = File::create(dir.join(format!("part-{p}.parquet")))
                .ok()
                .unwrap_or_else(|| panic!("Should create file"));
            let mut writer = ArrowWriter::try_new(file, Arc::clone(&schema), None)
                .ok()
                .unwrap_or_else(|| panic!("Should create writer"));
            writer
                .write(&batch)
                .ok()
                .unwrap_or_else(|| panic!("Should write"));
            writer
                .close()
                .ok()
                .unwrap_or_else(|| panic!("Should close"));
        }
        FileDataset::load_with_cache(
            DatasetRoot::local(dir),
            LoadOptions::default().with_seed(5),
            Arc::new(PieceCache::new()),
        )
        .ok()
        .unwrap_or_else(|| panic!("Should load"))
    }

    #[test]
    fn test_workers_yield_batches() {
        let dir = tempfile::tempdir()
            .ok()
            .unwrap_or_else(|| panic!("Should create temp dir"));
        let ds = create_test_dataset(dir.path());
        let options = GeneratorOptions::default()
            .group(ColumnGroup::flat(["x"]))
            .batch_size(8);
        let gen = ds
            .parallel_generator(&options, 3, 4)
            .ok()
            .unwrap_or_else(|| panic!("Should spawn"));
        assert_eq!(gen.workers(), 3);
        let batches: Vec<Batch> = gen
            .take(30)
            .map(|b| b.ok().unwrap_or_else(|| panic!("Should yield batch")))
            .collect();
        assert_eq!(batches.len(), 30);
        assert!(batches.iter().all(|b| b[0].shape() == vec![8, 1]));
    }

    #[test]
    fn test_custom_mapper_cannot_be_shipped() {
        let dir = tempfile::tempdir()
            .ok()
            .unwrap_or_else(|| panic!("Should create temp dir"));
        let ds = create_test_dataset(dir.path());
        let mapped = ds
            .map(
                Mapper::custom(Map::new(|batch| Ok(batch))),
                crate::dataset::MapOptions::default(),
            )
            .ok()
            .unwrap_or_else(|| panic!("Should map"));
        let result = mapped.parallel_generator(&GeneratorOptions::default(), 2, 2);
        assert!(matches!(result, Err(Error::InvalidConfig { .. })));
    }

    #[test]
    fn test_zero_workers() {
        let dir = tempfile::tempdir()
            .ok()
            .unwrap_or_else(|| panic!("Should create temp dir"));
        let ds = create_test_dataset(dir.path());
        assert!(ds
            .parallel_generator(&GeneratorOptions::default(), 0, 2)
            .is_err());
    }
}
