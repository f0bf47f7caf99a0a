//! Host-side final result: a unique mapping from key bytes to state blobs.
//!
//! Keys are stored back to back in one buffer and states in another, both
//! indexed by entry number. A [`hashbrown::HashTable`] of entry numbers
//! provides lookup without storing keys twice.

use std::fmt;

use hashbrown::hash_table::Entry;
use hashbrown::HashTable;
use rustc_hash::FxHashMap;

use crate::error::{Error, Phase, Result};
use crate::function::{AggregateDescriptor, AggregateFunction};
use crate::hash::key_hash;

/// Owned, immutable aggregation result.
///
/// Iteration order is unspecified. Dropping the result runs the function's
/// state destructor, if it has one. Not `Clone`: states are owned by exactly
/// one result, so share it through the `Arc` returned by `get_result`.
pub struct AggregateResult {
    descriptor: &'static AggregateDescriptor,
    keys: Vec<u8>,
    key_offsets: Vec<usize>,
    states: Vec<u8>,
    index: HashTable<u32>,
}

impl AggregateResult {
    /// A result with no keys.
    #[must_use]
    pub fn empty(function: AggregateFunction) -> Self {
        ResultBuilder::new(function.descriptor()).finish()
    }

    /// Function whose states this result holds.
    #[must_use]
    pub fn function(&self) -> AggregateFunction {
        self.descriptor.function
    }

    /// Number of distinct keys.
    #[must_use]
    pub fn len(&self) -> usize {
        self.key_offsets.len() - 1
    }

    /// Whether the result has no keys.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Key of entry `i`.
    ///
    /// # Panics
    ///
    /// Panics if `i >= len()`.
    #[must_use]
    pub fn key(&self, i: usize) -> &[u8] {
        key_at(&self.keys, &self.key_offsets, i)
    }

    /// State blob of entry `i`.
    ///
    /// # Panics
    ///
    /// Panics if `i >= len()`.
    #[must_use]
    pub fn state(&self, i: usize) -> &[u8] {
        let size = self.descriptor.state_size;
        &self.states[i * size..(i + 1) * size]
    }

    /// Borrowed `(key, state)` pairs.
    pub fn iter(&self) -> impl Iterator<Item = (&[u8], &[u8])> + '_ {
        (0..self.len()).map(move |i| (self.key(i), self.state(i)))
    }

    /// Borrowed keys with their finalized values.
    pub fn iter_finalized(&self) -> impl Iterator<Item = (&[u8], u64)> + '_ {
        let finalize = self.descriptor.finalize;
        self.iter().map(move |(k, s)| (k, finalize(s)))
    }

    /// State blob of `key`.
    #[must_use]
    pub fn get_state(&self, key: &[u8]) -> Option<&[u8]> {
        self.find(key).map(|i| self.state(i))
    }

    /// Finalized value of `key`.
    #[must_use]
    pub fn get(&self, key: &[u8]) -> Option<u64> {
        self.get_state(key).map(self.descriptor.finalize)
    }

    /// Copies the finalized values into a map.
    #[must_use]
    pub fn to_hash_map(&self) -> FxHashMap<Vec<u8>, u64> {
        self.iter_finalized().map(|(k, v)| (k.to_vec(), v)).collect()
    }

    /// Combines two results of the same function. Keys present in both have
    /// their states merged; the rest are copied.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidConfig`] if the functions differ.
    pub fn merge(&self, other: &AggregateResult) -> Result<AggregateResult> {
        if self.function() != other.function() {
            return Err(Error::config(
                Phase::Merge,
                format!(
                    "cannot merge a {} result with a {} result",
                    self.function(),
                    other.function()
                ),
            ));
        }
        let mut builder = ResultBuilder::with_capacity(
            self.descriptor,
            self.len() + other.len(),
            self.keys.len() + other.keys.len(),
        );
        for (key, state) in self.iter().chain(other.iter()) {
            builder.upsert(key, state);
        }
        let merged = builder.finish();
        tracing::debug!(
            function = %self.function(),
            left = self.len(),
            right = other.len(),
            merged = merged.len(),
            "results merged"
        );
        Ok(merged)
    }

    /// Consumes the result, returning owned keys with finalized values.
    #[must_use]
    pub fn into_finalized(self) -> Vec<(Vec<u8>, u64)> {
        self.iter_finalized().map(|(k, v)| (k.to_vec(), v)).collect()
    }

    fn find(&self, key: &[u8]) -> Option<usize> {
        self.index
            .find(key_hash(key), |&i| self.key(i as usize) == key)
            .map(|&i| i as usize)
    }
}

impl Drop for AggregateResult {
    fn drop(&mut self) {
        if let Some(destroy) = self.descriptor.destroy {
            let size = self.descriptor.state_size;
            for state in self.states.chunks_exact_mut(size) {
                destroy(state);
            }
        }
    }
}

impl PartialEq for AggregateResult {
    fn eq(&self, other: &Self) -> bool {
        self.function() == other.function()
            && self.len() == other.len()
            && self.iter().all(|(k, s)| other.get_state(k) == Some(s))
    }
}

impl Eq for AggregateResult {}

impl fmt::Debug for AggregateResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AggregateResult")
            .field("function", &self.function())
            .field("len", &self.len())
            .field("key_bytes", &self.keys.len())
            .finish_non_exhaustive()
    }
}

fn key_at<'a>(keys: &'a [u8], offsets: &[usize], i: usize) -> &'a [u8] {
    &keys[offsets[i]..offsets[i + 1]]
}

/// Accumulates entries, merging states of repeated keys.
pub(crate) struct ResultBuilder {
    descriptor: &'static AggregateDescriptor,
    keys: Vec<u8>,
    key_offsets: Vec<usize>,
    states: Vec<u8>,
    index: HashTable<u32>,
}

impl ResultBuilder {
    pub(crate) fn new(descriptor: &'static AggregateDescriptor) -> Self {
        Self::with_capacity(descriptor, 0, 0)
    }

    pub(crate) fn with_capacity(
        descriptor: &'static AggregateDescriptor,
        entries: usize,
        key_bytes: usize,
    ) -> Self {
        let mut key_offsets = Vec::with_capacity(entries + 1);
        key_offsets.push(0);
        Self {
            descriptor,
            keys: Vec::with_capacity(key_bytes),
            key_offsets,
            states: Vec::with_capacity(entries * descriptor.state_size),
            index: HashTable::with_capacity(entries),
        }
    }

    /// Adds `key` with `state`, or merges `state` into the existing entry.
    pub(crate) fn upsert(&mut self, key: &[u8], state: &[u8]) {
        let size = self.descriptor.state_size;
        debug_assert_eq!(state.len(), size);
        let keys = &self.keys;
        let offsets = &self.key_offsets;
        let entry = self.index.entry(
            key_hash(key),
            |&i| key_at(keys, offsets, i as usize) == key,
            |&i| key_hash(key_at(keys, offsets, i as usize)),
        );
        match entry {
            Entry::Occupied(e) => {
                let i = *e.get() as usize;
                (self.descriptor.merge)(&mut self.states[i * size..(i + 1) * size], state);
            }
            Entry::Vacant(v) => {
                let i = self.key_offsets.len() - 1;
                v.insert(i as u32);
                self.keys.extend_from_slice(key);
                self.key_offsets.push(self.keys.len());
                self.states.extend_from_slice(state);
            }
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.key_offsets.len() - 1
    }

    pub(crate) fn finish(self) -> AggregateResult {
        AggregateResult {
            descriptor: self.descriptor,
            keys: self.keys,
            key_offsets: self.key_offsets,
            states: self.states,
            index: self.index,
        }
    }
}
