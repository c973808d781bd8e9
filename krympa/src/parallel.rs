//! Minimal parallel-map facility for the marketplace's fan-out stages.

use rayon::prelude::*;

/// Applies `f` to every item, serially or on the current rayon pool.
///
/// Workers receive read-only snapshots and return values; all shared
/// state mutation happens in the driver between map stages, so results
/// do not depend on worker scheduling. `chunk` is the minimum number of
/// items handed to one worker.
pub(crate) fn map<T, R, F>(items: &[T], chunk: usize, single_process: bool, f: F) -> Vec<R>
where
    T: Sync,
    R: Send,
    F: Fn(&T) -> R + Sync + Send,
{
    if single_process {
        items.iter().map(f).collect()
    } else {
        items.par_iter().with_min_len(chunk.max(1)).map(f).collect()
    }
}

/// Chunk sizing for a stage: `ceil(ratio * items)`, at least one.
pub(crate) fn chunk_len(len: usize, ratio: f64) -> usize {
    ((len as f64 * ratio).ceil() as usize).max(1)
}
