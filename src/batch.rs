//! Fixed-size batching of variable-length sequences

use anyhow::Result;

/// Default number of sequences per encoder batch.
pub const DEFAULT_BATCH_SIZE: usize = 8;

/// Split `items` into contiguous batches of at most `batch_size`.
///
/// Order is preserved and the last batch may be shorter; `N` items yield
/// `ceil(N / batch_size)` batches. No shuffling happens here.
pub fn partition<T>(items: &[T], batch_size: usize) -> Result<Vec<&[T]>> {
    anyhow::ensure!(batch_size > 0, "Batch size must be positive, got {batch_size}");
    Ok(items.chunks(batch_size).collect())
}
