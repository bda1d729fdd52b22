//! Piece-level and row-level random sampling.

use std::sync::Arc;

use arrow::{
    array::{Array, RecordBatch, UInt64Array},
    compute::take,
};
use rand::{seq::SliceRandom, Rng};

use crate::error::{Error, Result};

/// Rows per chunk for the first stage of [`RowSampler::TwoStage`].
pub const SAMPLING_CHUNK_SIZE: usize = 100_000;

/// How rows are drawn from each piece during a reduce.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RowSampler {
    /// Keep every row.
    #[default]
    All,
    /// Draw exactly `n` rows uniformly without replacement.
    Exact(usize),
    /// Draw `sqrt(n * rows)` rows worth of whole chunks, then `n` rows from
    /// those chunks.
    TwoStage(usize),
}

impl RowSampler {
    /// Applies the sampler to one decoded piece.
    ///
    /// # Errors
    ///
    /// Returns an error if the rows cannot be gathered.
    pub fn apply<R: Rng + ?Sized>(&self, batch: RecordBatch, rng: &mut R) -> Result<RecordBatch> {
        match *self {
            Self::All => Ok(batch),
            Self::Exact(n) => sample_rows(batch, n, rng),
            Self::TwoStage(n) => two_stage_sample(batch, n, SAMPLING_CHUNK_SIZE, rng),
        }
    }
}

/// Number of pieces to read for a sample of `n` rows.
///
/// Scales with the square root of the sampled fraction of the dataset, never
/// below `min_pieces` and never above `n_pieces`.
#[allow(
    clippy::cast_precision_loss,
    clippy::cast_possible_truncation,
    clippy::cast_sign_loss
)]
pub fn sample_piece_count(n: usize, approx_n_rows: usize, n_pieces: usize, min_pieces: usize) -> usize {
    if approx_n_rows == 0 || n_pieces == 0 {
        return n_pieces.min(min_pieces.max(1));
    }
    let fraction = n.min(approx_n_rows) as f64 / approx_n_rows as f64;
    let wanted = (fraction.sqrt() * n_pieces as f64).ceil() as usize;
    wanted.max(min_pieces).min(n_pieces)
}

/// Gathers the given rows of `batch`, in the given order.
///
/// # Errors
///
/// Returns an error if an index is out of bounds.
pub fn take_rows(batch: &RecordBatch, indices: &[usize]) -> Result<RecordBatch> {
    let indices = UInt64Array::from_iter_values(indices.iter().map(|&i| i as u64));
    let columns = batch
        .columns()
        .iter()
        .map(|col| take(col.as_ref(), &indices, None).map_err(Error::Arrow))
        .collect::<Result<Vec<Arc<dyn Array>>>>()?;
    RecordBatch::try_new(batch.schema(), columns).map_err(Error::Arrow)
}

/// Draws `n` rows without replacement, preserving their original order.
///
/// # Errors
///
/// Returns an error if the rows cannot be gathered.
pub fn sample_rows<R: Rng + ?Sized>(batch: RecordBatch, n: usize, rng: &mut R) -> Result<RecordBatch> {
    let num_rows = batch.num_rows();
    if n >= num_rows {
        return Ok(batch);
    }
    let mut indices = rand::seq::index::sample(rng, num_rows, n).into_vec();
    indices.sort_unstable();
    take_rows(&batch, &indices)
}

/// Two-stage sample: whole chunks first, then rows within them.
///
/// With `rows` rows in the piece the first stage keeps enough random
/// `chunk_size` chunks to cover `sqrt(n * rows)` rows; the second stage
/// draws `ceil(n / chunks_kept)` rows from each kept chunk.
///
/// # Errors
///
/// Returns an error if the rows cannot be gathered.
#[allow(
    clippy::cast_precision_loss,
    clippy::cast_possible_truncation,
    clippy::cast_sign_loss
)]
pub fn two_stage_sample<R: Rng + ?Sized>(
    batch: RecordBatch,
    n: usize,
    chunk_size: usize,
    rng: &mut R,
) -> Result<RecordBatch> {
    let num_rows = batch.num_rows();
    if n >= num_rows {
        return Ok(batch);
    }
    let chunk_size = chunk_size.max(1);
    let intermediate_n = ((n as f64) * (num_rows as f64)).sqrt();
    let n_chunks = num_rows.div_ceil(chunk_size);
    let n_chunks_kept = ((intermediate_n / chunk_size as f64).ceil() as usize).max(1);

    if n_chunks_kept >= n_chunks {
        return sample_rows(batch, n, rng);
    }

    let per_chunk = n.div_ceil(n_chunks_kept);
    let mut chunk_ids = rand::seq::index::sample(rng, n_chunks, n_chunks_kept).into_vec();
    chunk_ids.sort_unstable();

    let mut indices = Vec::with_capacity(per_chunk * n_chunks_kept);
    for chunk in chunk_ids {
        let start = chunk * chunk_size;
        let len = chunk_size.min(num_rows - start);
        let mut picked = rand::seq::index::sample(rng, len, per_chunk.min(len)).into_vec();
        picked.sort_unstable();
        indices.extend(picked.into_iter().map(|i| start + i));
    }
    take_rows(&batch, &indices)
}

/// Shuffles `pieces` and cuts them at the rounded cumulative `weights`.
///
/// Returns one subset per weight; rounding residue is not redistributed.
///
/// # Errors
///
/// Returns an error if a weight is negative or all weights are zero.
#[allow(
    clippy::cast_precision_loss,
    clippy::cast_possible_truncation,
    clippy::cast_sign_loss
)]
pub fn split_pieces<R: Rng + ?Sized>(
    pieces: &[String],
    weights: &[f64],
    rng: &mut R,
) -> Result<Vec<Vec<String>>> {
    if weights.iter().any(|w| *w < 0.0 || !w.is_finite()) {
        return Err(Error::invalid_config("Split weights must be finite and non-negative"));
    }
    let total: f64 = weights.iter().sum();
    if total <= 0.0 {
        return Err(Error::invalid_config("Split weights must not all be zero"));
    }

    let mut shuffled = pieces.to_vec();
    shuffled.shuffle(rng);

    let n = shuffled.len() as f64;
    let mut bounds = vec![0usize];
    let mut cumulative = 0.0;
    for w in weights {
        cumulative += w / total;
        bounds.push(((cumulative * n).round() as usize).min(shuffled.len()));
    }

    Ok(bounds
        .windows(2)
        .map(|w| shuffled[w[0]..w[1].max(w[0])].to_vec())
        .collect())
}

#[cfg(test)]
mod tests {
    use arrow::{
        array::Int64Array,
        datatypes::{DataType, Field, Schema},
    };
    use rand::{rngs::StdRng, SeedableRng};

    use super::*;

    fn create_test_batch(rows: usize) -> RecordBatch {
        let schema = Arc::new(Schema::new(vec![Field::new("id", DataType::Int64, false)]));
        let ids: Vec<i64> = (0..rows as i64).collect();
        RecordBatch::try_new(schema, vec![Arc::new(Int64Array::from(ids))])
            .ok()
            .unwrap_or_else(|| panic!("Should create batch"))
    }

    fn ids(batch: &RecordBatch) -> Vec<i64> {
        batch
            .column(0)
            .as_any()
            .downcast_ref::<Int64Array>()
            .unwrap_or_else(|| panic!("Should be Int64"))
            .values()
            .to_vec()
    }

    #[test]
    fn test_sample_piece_count() {
        // Full sample reads every piece
        assert_eq!(sample_piece_count(3000, 3000, 3, 100), 3);
        // A quarter of the rows reads half the pieces
        assert_eq!(sample_piece_count(250, 1000, 400, 10), 200);
        assert_eq!(sample_piece_count(1, 1_000_000, 400, 10), 10);
    }

    #[test]
    fn test_exact_sample_keeps_order() {
        let mut rng = StdRng::seed_from_u64(1);
        let out = RowSampler::Exact(10)
            .apply(create_test_batch(100), &mut rng)
            .ok()
            .unwrap_or_else(|| panic!("Should sample"));
        let ids = ids(&out);
        assert_eq!(ids.len(), 10);
        assert!(ids.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn test_two_stage_sample_size() {
        let mut rng = StdRng::seed_from_u64(2);
        let out = two_stage_sample(create_test_batch(10_000), 100, 500, &mut rng)
            .ok()
            .unwrap_or_else(|| panic!("Should sample"));
        // sqrt(100 * 10000) = 1000 rows = 2 chunks of 500, 50 rows each
        assert_eq!(out.num_rows(), 100);
        let ids = ids(&out);
        let chunks: std::collections::BTreeSet<i64> = ids.iter().map(|i| i / 500).collect();
        assert_eq!(chunks.len(), 2);
    }

    #[test]
    fn test_sample_larger_than_batch_is_identity() {
        let mut rng = StdRng::seed_from_u64(3);
        let out = RowSampler::TwoStage(50)
            .apply(create_test_batch(20), &mut rng)
            .ok()
            .unwrap_or_else(|| panic!("Should sample"));
        assert_eq!(out.num_rows(), 20);
    }

    #[test]
    fn test_split_seventy_thirty() {
        let pieces: Vec<String> = (0..100).map(|i| format!("p{i}")).collect();
        let mut rng = StdRng::seed_from_u64(4);
        let parts = split_pieces(&pieces, &[0.7, 0.3], &mut rng)
            .ok()
            .unwrap_or_else(|| panic!("Should split"));
        assert_eq!(parts.len(), 2);
        assert_eq!(parts[0].len(), 70);
        assert_eq!(parts[1].len(), 30);

        let mut all: Vec<String> = parts.concat();
        all.sort();
        let mut expected = pieces.clone();
        expected.sort();
        assert_eq!(all, expected);
    }

    #[test]
    fn test_split_rejects_bad_weights() {
        let pieces = vec!["a".to_string()];
        let mut rng = StdRng::seed_from_u64(5);
        assert!(split_pieces(&pieces, &[0.0, 0.0], &mut rng).is_err());
        assert!(split_pieces(&pieces, &[-1.0, 2.0], &mut rng).is_err());
    }
}
