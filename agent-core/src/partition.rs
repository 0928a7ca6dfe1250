//! Key-range partition table.
//!
//! The key domain `[0, key_range)` is split into contiguous sub-ranges by an
//! ordered boundary vector of `shard_count + 1` values: shard `i` owns keys
//! in `[boundaries[i], boundaries[i + 1])`. The table is immutable; a
//! reconfiguration builds a new one and swaps it in wholesale.

use crate::error::{AgentError, Result};

/// Immutable mapping from key to owning shard index.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionTable {
    key_range: u64,
    boundaries: Vec<u64>,
}

/// A maximal run of consecutive sorted keys owned by one shard.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContiguousRun {
    /// One past the last index of the run.
    pub end: usize,
    /// Index of the owning shard in partition order.
    pub shard: usize,
}

impl PartitionTable {
    /// Build a table from a boundary vector.
    ///
    /// # Errors
    ///
    /// Returns a configuration error unless the boundaries are
    /// non-decreasing, start at 0, end at `key_range`, and number exactly
    /// `shard_count + 1`.
    pub fn new(key_range: u64, shard_count: usize, boundaries: Vec<u64>) -> Result<Self> {
        if shard_count == 0 {
            return Err(AgentError::config("partition needs at least one shard"));
        }
        if key_range == 0 {
            return Err(AgentError::config("key_range must be greater than 0"));
        }
        if boundaries.len() != shard_count + 1 {
            return Err(AgentError::config(format!(
                "expected {} partition boundaries for {} shards, got {}",
                shard_count + 1,
                shard_count,
                boundaries.len()
            )));
        }
        if boundaries[0] != 0 {
            return Err(AgentError::config(format!(
                "first partition boundary must be 0, got {}",
                boundaries[0]
            )));
        }
        if boundaries[shard_count] != key_range {
            return Err(AgentError::config(format!(
                "last partition boundary must equal key_range {}, got {}",
                key_range, boundaries[shard_count]
            )));
        }
        if boundaries.windows(2).any(|w| w[0] > w[1]) {
            return Err(AgentError::config("partition boundaries must be non-decreasing"));
        }

        Ok(Self {
            key_range,
            boundaries,
        })
    }

    /// Size of the key domain.
    pub fn key_range(&self) -> u64 {
        self.key_range
    }

    /// Number of shards the table partitions keys over.
    pub fn shard_count(&self) -> usize {
        self.boundaries.len() - 1
    }

    /// Partition boundaries, `shard_count + 1` values.
    pub fn boundaries(&self) -> &[u64] {
        &self.boundaries
    }

    /// Shard index owning `key`.
    ///
    /// # Errors
    ///
    /// Returns `KeyOutOfRange` if `key >= key_range`.
    pub fn owner_of(&self, key: u64) -> Result<usize> {
        if key >= self.key_range {
            return Err(AgentError::key_out_of_range(key, self.key_range));
        }
        // Last boundary <= key. With duplicate boundaries this lands past
        // every empty shard, on the shard whose sub-range is non-empty.
        let idx = self.boundaries.partition_point(|&b| b <= key);
        Ok(idx - 1)
    }

    /// Extend from `start` over `sorted_keys` while ownership stays with the
    /// shard owning `sorted_keys[start]`.
    ///
    /// Together with a linear outer loop this carves a sorted batch into
    /// maximal same-shard runs, each becoming one request message.
    ///
    /// # Errors
    ///
    /// Returns `KeyOutOfRange` if the run's first key is outside the domain,
    /// and a configuration error if `start` is not a valid index.
    pub fn next_contiguous_run(&self, sorted_keys: &[u64], start: usize) -> Result<ContiguousRun> {
        if start >= sorted_keys.len() {
            return Err(AgentError::config(format!(
                "run start {} beyond batch of {} keys",
                start,
                sorted_keys.len()
            )));
        }
        let shard = self.owner_of(sorted_keys[start])?;
        let upper = self.boundaries[shard + 1];

        let mut end = start + 1;
        while end < sorted_keys.len() && sorted_keys[end] < upper {
            end += 1;
        }
        Ok(ContiguousRun { end, shard })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table(key_range: u64, boundaries: &[u64]) -> PartitionTable {
        PartitionTable::new(key_range, boundaries.len() - 1, boundaries.to_vec()).unwrap()
    }

    #[test]
    fn test_rejects_malformed_boundaries() {
        // Wrong count
        assert!(PartitionTable::new(10, 2, vec![0, 10]).is_err());
        // Does not start at 0
        assert!(PartitionTable::new(10, 1, vec![1, 10]).is_err());
        // Does not end at key_range
        assert!(PartitionTable::new(10, 1, vec![0, 9]).is_err());
        // Decreasing
        assert!(PartitionTable::new(10, 2, vec![0, 7, 5]).is_err());
        // Degenerate domain
        assert!(PartitionTable::new(0, 1, vec![0, 0]).is_err());
        assert!(PartitionTable::new(10, 0, vec![0]).is_err());
    }

    #[test]
    fn test_owner_of_boundary_semantics() {
        let t = table(20, &[0, 10, 20]);

        assert_eq!(t.owner_of(0).unwrap(), 0);
        assert_eq!(t.owner_of(9).unwrap(), 0);
        // Lower boundary is inclusive for the next shard
        assert_eq!(t.owner_of(10).unwrap(), 1);
        assert_eq!(t.owner_of(19).unwrap(), 1);
        assert!(matches!(
            t.owner_of(20),
            Err(AgentError::KeyOutOfRange { key: 20, key_range: 20 })
        ));
    }

    #[test]
    fn test_owner_of_is_total_over_domain() {
        let t = table(30, &[0, 7, 7, 21, 30]);
        for key in 0..30 {
            let shard = t.owner_of(key).unwrap();
            assert!(t.boundaries()[shard] <= key && key < t.boundaries()[shard + 1]);
        }
        // Shard 1 spans [7, 7) and owns nothing
        assert!((0..30).all(|k| t.owner_of(k).unwrap() != 1));
    }

    #[test]
    fn test_contiguous_runs_partition_a_batch() {
        let t = table(20, &[0, 10, 20]);
        let keys = [1, 3, 12, 15];

        let run = t.next_contiguous_run(&keys, 0).unwrap();
        assert_eq!(run, ContiguousRun { end: 2, shard: 0 });
        let run = t.next_contiguous_run(&keys, 2).unwrap();
        assert_eq!(run, ContiguousRun { end: 4, shard: 1 });
    }

    #[test]
    fn test_single_shard_run_covers_everything() {
        let t = table(100, &[0, 100]);
        let keys = [0, 5, 42, 99];
        let run = t.next_contiguous_run(&keys, 0).unwrap();
        assert_eq!(run, ContiguousRun { end: 4, shard: 0 });
    }

    #[test]
    fn test_runs_are_maximal() {
        let t = table(40, &[0, 10, 20, 30, 40]);
        let keys = [0, 9, 10, 11, 35, 36, 39];

        let mut start = 0;
        let mut runs = Vec::new();
        while start < keys.len() {
            let run = t.next_contiguous_run(&keys, start).unwrap();
            runs.push((start, run.end, run.shard));
            start = run.end;
        }
        assert_eq!(runs, vec![(0, 2, 0), (2, 4, 1), (4, 7, 3)]);

        // Every member of each run is owned by the run's shard
        for (s, e, shard) in runs {
            for &k in &keys[s..e] {
                assert_eq!(t.owner_of(k).unwrap(), shard);
            }
        }
    }

    #[test]
    fn test_run_with_out_of_range_key_fails() {
        let t = table(20, &[0, 10, 20]);
        assert!(t.next_contiguous_run(&[25], 0).is_err());
        assert!(t.next_contiguous_run(&[1, 2], 2).is_err());
    }
}
