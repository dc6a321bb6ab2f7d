//! Worker pool scheduling for the accumulation phase.
//!
//! The pool runs only the accumulation half of a sweep; the draw phase stays
//! on the coordinator thread. Shards are disjoint contiguous observation
//! ranges, results come back in shard order regardless of completion order,
//! and the coordinator folds them serially, so the merged statistics do not
//! depend on the worker count.

use crate::error::ImputeError;
use rayon::iter::{IntoParallelIterator, ParallelIterator};
use std::ops::Range;

pub struct WorkerPool {
    pool: Option<rayon::ThreadPool>,
    nworkers: usize,
}

impl WorkerPool {
    /// Serial scheduler: one coordinator, no worker threads.
    pub fn serial() -> Self {
        Self {
            pool: None,
            nworkers: 1,
        }
    }

    pub fn nworkers(&self) -> usize {
        self.nworkers
    }

    /// Replace the pool with `nworkers` persistent threads. Dropping the old
    /// pool joins its threads, so reconfiguration drains in-flight work first.
    pub fn configure(&mut self, nworkers: usize) -> Result<(), ImputeError> {
        if nworkers == 0 {
            return Err(ImputeError::InvalidArgument(
                "worker pool needs at least one worker".to_string(),
            ));
        }
        self.pool = if nworkers == 1 {
            None
        } else {
            let pool = rayon::ThreadPoolBuilder::new()
                .num_threads(nworkers)
                .build()
                .map_err(|e| {
                    ImputeError::InvalidArgument(format!("failed to build worker pool: {e}"))
                })?;
            Some(pool)
        };
        self.nworkers = nworkers;
        Ok(())
    }

    /// Run `task` over every shard and return results in shard order. Blocks
    /// until all shards complete.
    pub fn run<T, F>(&self, shards: Vec<Range<usize>>, task: F) -> Vec<T>
    where
        T: Send,
        F: Fn(Range<usize>) -> T + Sync + Send,
    {
        match &self.pool {
            None => shards.into_iter().map(task).collect(),
            Some(pool) => pool.install(|| shards.into_par_iter().map(task).collect()),
        }
    }

    /// Disjoint contiguous shards covering `0..n`, one per worker, sized
    /// within one observation of each other.
    pub fn partition(&self, n: usize) -> Vec<Range<usize>> {
        partition(n, self.nworkers)
    }
}

pub fn partition(n: usize, shards: usize) -> Vec<Range<usize>> {
    let shards = shards.max(1).min(n.max(1));
    let base = n / shards;
    let extra = n % shards;
    let mut out = Vec::with_capacity(shards);
    let mut start = 0;
    for s in 0..shards {
        let len = base + usize::from(s < extra);
        out.push(start..start + len);
        start += len;
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partition_covers_range_disjointly() {
        for n in [0usize, 1, 5, 16, 17] {
            for shards in [1usize, 2, 4, 7] {
                let ranges = partition(n, shards);
                let mut covered = 0;
                let mut cursor = 0;
                for range in &ranges {
                    assert_eq!(range.start, cursor);
                    cursor = range.end;
                    covered += range.len();
                }
                assert_eq!(covered, n);
                assert_eq!(cursor, n);
                let sizes: Vec<usize> = ranges.iter().map(|r| r.len()).collect();
                let min = sizes.iter().min().unwrap();
                let max = sizes.iter().max().unwrap();
                assert!(max - min <= 1);
            }
        }
    }

    #[test]
    fn pool_results_arrive_in_shard_order() {
        let mut pool = WorkerPool::serial();
        pool.configure(4).unwrap();
        let shards = pool.partition(100);
        let results = pool.run(shards, |range| range.start);
        let mut sorted = results.clone();
        sorted.sort_unstable();
        assert_eq!(results, sorted);
    }

    #[test]
    fn configure_rejects_zero_workers() {
        let mut pool = WorkerPool::serial();
        assert!(pool.configure(0).is_err());
        assert_eq!(pool.nworkers(), 1);
    }
}
