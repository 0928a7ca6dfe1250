//! Transient key/value batches moved between the worker, the engine, and
//! the wire.

use std::collections::BTreeMap;

/// An ordered pair of equal-length key and value sequences.
///
/// Batches are scoped to one push or one pull cycle: read from the IPC bulk
/// region, routed to shards, and (for pulls) written back accumulated.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct KeyValueBatch {
    pub keys: Vec<u64>,
    pub values: Vec<f32>,
}

impl KeyValueBatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            keys: Vec::with_capacity(capacity),
            values: Vec::with_capacity(capacity),
        }
    }

    pub fn from_parts(keys: Vec<u64>, values: Vec<f32>) -> Self {
        debug_assert_eq!(keys.len(), values.len());
        Self { keys, values }
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    pub fn push(&mut self, key: u64, value: f32) {
        self.keys.push(key);
        self.values.push(value);
    }

    /// Append another batch's pairs.
    pub fn extend_from(&mut self, keys: &[u64], values: &[f32]) {
        debug_assert_eq!(keys.len(), values.len());
        self.keys.extend_from_slice(keys);
        self.values.extend_from_slice(values);
    }

    /// Sort pairs by key and drop duplicate keys, keeping the value of each
    /// key's *first* occurrence in the original order. Downstream consumers
    /// rely on that first-seen tie-break, so this is deliberately not a
    /// plain stable sort.
    pub fn sort_dedup(&mut self) {
        let mut first_seen: BTreeMap<u64, usize> = BTreeMap::new();
        for (i, &key) in self.keys.iter().enumerate() {
            first_seen.entry(key).or_insert(i);
        }

        let old_values = std::mem::take(&mut self.values);
        self.keys = first_seen.keys().copied().collect();
        self.values = first_seen.values().map(|&i| old_values[i]).collect();
    }

    /// Sort keys ascending, values untouched. Used on pull requests, where
    /// values are not yet known; duplicate keys are preserved.
    pub fn sort_keys(&mut self) {
        self.keys.sort_unstable();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sort_dedup_orders_by_key() {
        let mut batch = KeyValueBatch::from_parts(vec![9, 2, 5], vec![0.9, 0.2, 0.5]);
        batch.sort_dedup();
        assert_eq!(batch.keys, vec![2, 5, 9]);
        assert_eq!(batch.values, vec![0.2, 0.5, 0.9]);
    }

    #[test]
    fn test_sort_dedup_keeps_first_occurrence() {
        let mut batch = KeyValueBatch::from_parts(
            vec![7, 3, 7, 3, 1],
            vec![1.0, 2.0, 3.0, 4.0, 5.0],
        );
        batch.sort_dedup();
        // Duplicates collapse to the value first seen for each key
        assert_eq!(batch.keys, vec![1, 3, 7]);
        assert_eq!(batch.values, vec![5.0, 2.0, 1.0]);
    }

    #[test]
    fn test_sort_keys_keeps_duplicates() {
        let mut batch = KeyValueBatch::from_parts(vec![4, 1, 4], vec![0.0; 3]);
        batch.sort_keys();
        assert_eq!(batch.keys, vec![1, 4, 4]);
    }

    #[test]
    fn test_extend_from() {
        let mut batch = KeyValueBatch::new();
        batch.extend_from(&[1, 2], &[0.1, 0.2]);
        batch.extend_from(&[3], &[0.3]);
        assert_eq!(batch.len(), 3);
        assert_eq!(batch.keys, vec![1, 2, 3]);
        assert_eq!(batch.values, vec![0.1, 0.2, 0.3]);
    }
}
