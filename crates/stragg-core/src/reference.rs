//! Single-threaded host aggregator using the same descriptors as the device.
//!
//! Tests compare device results against it; the aggregator never calls it.

use rustc_hash::FxHashMap;

use crate::batch::Batch;
use crate::function::{AggregateDescriptor, AggregateFunction};
use crate::result::{AggregateResult, ResultBuilder};

/// Host-side aggregator over owned keys.
pub struct HostAggregator {
    descriptor: &'static AggregateDescriptor,
    states: FxHashMap<Vec<u8>, Vec<u8>>,
    records: u64,
}

impl HostAggregator {
    /// Creates an empty aggregator for `function`.
    #[must_use]
    pub fn new(function: AggregateFunction) -> Self {
        Self {
            descriptor: function.descriptor(),
            states: FxHashMap::default(),
            records: 0,
        }
    }

    /// Folds one record.
    pub fn update(&mut self, key: &[u8], value: &[u8]) {
        self.records += 1;
        if let Some(state) = self.states.get_mut(key) {
            (self.descriptor.update_host)(state, value);
            return;
        }
        let mut state = vec![0u8; self.descriptor.state_size];
        (self.descriptor.init)(&mut state);
        (self.descriptor.update_host)(&mut state, value);
        self.states.insert(key.to_vec(), state);
    }

    /// Folds every record of `batch`.
    pub fn push_batch(&mut self, batch: &Batch<'_>) {
        for (key, value) in batch.iter() {
            self.update(key, value);
        }
    }

    /// Distinct keys seen so far.
    #[must_use]
    pub fn len(&self) -> usize {
        self.states.len()
    }

    /// Whether no record has been folded.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }

    /// Records folded so far.
    #[must_use]
    pub fn records(&self) -> u64 {
        self.records
    }

    /// Converts the accumulated states into a result.
    #[must_use]
    pub fn finish(mut self) -> AggregateResult {
        let states = std::mem::take(&mut self.states);
        let key_bytes = states.keys().map(Vec::len).sum();
        let mut builder = ResultBuilder::with_capacity(self.descriptor, states.len(), key_bytes);
        for (key, state) in &states {
            builder.upsert(key, state);
        }
        builder.finish()
    }
}

impl Drop for HostAggregator {
    fn drop(&mut self) {
        if let Some(destroy) = self.descriptor.destroy {
            for state in self.states.values_mut() {
                destroy(state);
            }
        }
    }
}

impl std::fmt::Debug for HostAggregator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HostAggregator")
            .field("function", &self.descriptor.function)
            .field("keys", &self.states.len())
            .field("records", &self.records)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::batch::BatchBuilder;

    #[test]
    fn test_count() {
        let batch: BatchBuilder = ["a", "b", "a", "a", "c"].iter().map(|k| (*k, "")).collect();
        let mut agg = HostAggregator::new(AggregateFunction::Count);
        agg.push_batch(&batch.as_batch());
        assert_eq!(agg.len(), 3);
        assert_eq!(agg.records(), 5);
        let r = agg.finish();
        assert_eq!(r.get(b"a"), Some(3));
        assert_eq!(r.get(b"c"), Some(1));
    }

    #[test]
    fn test_uniq() {
        let mut agg = HostAggregator::new(AggregateFunction::UniqHll12);
        for i in 0..100 {
            agg.update(b"k", format!("v{}", i % 10).as_bytes());
        }
        let estimate = agg.finish().get(b"k").unwrap();
        assert!((9..=10).contains(&estimate), "{estimate}");
    }
}
