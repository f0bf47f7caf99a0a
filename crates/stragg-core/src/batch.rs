//! Input batches: packed NUL-terminated fields plus offset arrays.
//!
//! A batch of `N` records is two packed buffers (keys, values) and two
//! offset arrays of `N + 1` entries. Record `i` occupies
//! `buf[offsets[i]..offsets[i + 1]]`; the last byte of every span is the NUL
//! terminator, which is not part of the field.
//!
//! ```text
//! keys:         a \0 b b \0 \0
//! key_offsets:  0    2       5  6
//! fields:       "a"  "bb"    ""
//! ```

use crate::error::{Error, Result};

/// Borrowed, validated view of one batch.
#[derive(Debug, Clone, Copy)]
pub struct Batch<'a> {
    keys: &'a [u8],
    key_offsets: &'a [u64],
    values: &'a [u8],
    value_offsets: &'a [u64],
}

impl<'a> Batch<'a> {
    /// Validates and wraps packed buffers and their offsets.
    ///
    /// # Errors
    ///
    /// Returns [`Error::MalformedBatch`] if the offset arrays differ in
    /// length, do not start at zero, do not end at the buffer length, or if
    /// any span is empty or lacks its NUL terminator.
    pub fn new(
        keys: &'a [u8],
        key_offsets: &'a [u64],
        values: &'a [u8],
        value_offsets: &'a [u64],
    ) -> Result<Self> {
        if key_offsets.len() != value_offsets.len() {
            return Err(Error::MalformedBatch(format!(
                "key offsets hold {} entries but value offsets hold {}",
                key_offsets.len(),
                value_offsets.len()
            )));
        }
        validate_packed("keys", keys, key_offsets)?;
        validate_packed("values", values, value_offsets)?;
        Ok(Self {
            keys,
            key_offsets,
            values,
            value_offsets,
        })
    }

    /// A batch with no records.
    #[must_use]
    pub fn empty() -> Batch<'static> {
        Batch {
            keys: &[],
            key_offsets: &[0],
            values: &[],
            value_offsets: &[0],
        }
    }

    /// Number of records.
    #[must_use]
    pub fn len(&self) -> usize {
        self.key_offsets.len() - 1
    }

    /// Whether the batch has no records.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Packed key bytes, terminators included.
    #[must_use]
    pub fn keys_buf(&self) -> &'a [u8] {
        self.keys
    }

    /// Packed value bytes, terminators included.
    #[must_use]
    pub fn values_buf(&self) -> &'a [u8] {
        self.values
    }

    /// Key offsets (`len() + 1` entries).
    #[must_use]
    pub fn key_offsets(&self) -> &'a [u64] {
        self.key_offsets
    }

    /// Value offsets (`len() + 1` entries).
    #[must_use]
    pub fn value_offsets(&self) -> &'a [u64] {
        self.value_offsets
    }

    /// Key of record `i`, without its terminator.
    ///
    /// # Panics
    ///
    /// Panics if `i >= len()`.
    #[must_use]
    pub fn key(&self, i: usize) -> &'a [u8] {
        field(self.keys, self.key_offsets, i)
    }

    /// Value of record `i`, without its terminator.
    ///
    /// # Panics
    ///
    /// Panics if `i >= len()`.
    #[must_use]
    pub fn value(&self, i: usize) -> &'a [u8] {
        field(self.values, self.value_offsets, i)
    }

    /// Iterates `(key, value)` pairs without terminators.
    pub fn iter(&self) -> impl Iterator<Item = (&'a [u8], &'a [u8])> + '_ {
        (0..self.len()).map(|i| (self.key(i), self.value(i)))
    }

    /// Splits into owned batches that each respect `max_records` and
    /// `max_bytes` (per packed buffer), preserving record order.
    ///
    /// # Errors
    ///
    /// Returns [`Error::BatchTooLarge`] if a single record does not fit
    /// `max_bytes`, or [`Error::InvalidConfig`] if a limit is zero.
    pub fn split(&self, max_records: usize, max_bytes: usize) -> Result<Vec<BatchBuilder>> {
        if max_records == 0 || max_bytes == 0 {
            return Err(Error::config(
                crate::error::Phase::Queue,
                "split limits must be positive",
            ));
        }
        let mut out = Vec::new();
        let mut current = BatchBuilder::new();
        for (key, value) in self.iter() {
            let (kb, vb) = (key.len() + 1, value.len() + 1);
            let record_bytes = kb.max(vb);
            if record_bytes > max_bytes {
                return Err(Error::BatchTooLarge {
                    limit: "batch_max_bytes",
                    actual: record_bytes as u64,
                    max: max_bytes as u64,
                });
            }
            let full = current.len() == max_records
                || current.keys_bytes() + kb > max_bytes
                || current.values_bytes() + vb > max_bytes;
            if full {
                out.push(std::mem::take(&mut current));
            }
            current.push(key, value);
        }
        if !current.is_empty() {
            out.push(current);
        }
        Ok(out)
    }
}

fn field<'a>(buf: &'a [u8], offsets: &[u64], i: usize) -> &'a [u8] {
    let start = offsets[i] as usize;
    let end = offsets[i + 1] as usize;
    &buf[start..end - 1]
}

fn validate_packed(name: &str, buf: &[u8], offsets: &[u64]) -> Result<()> {
    let Some(&first) = offsets.first() else {
        return Err(Error::MalformedBatch(format!(
            "{name} offsets must hold at least one entry"
        )));
    };
    if first != 0 {
        return Err(Error::MalformedBatch(format!(
            "{name} offsets must start at 0, found {first}"
        )));
    }
    for (i, pair) in offsets.windows(2).enumerate() {
        let (start, end) = (pair[0], pair[1]);
        if end <= start {
            return Err(Error::MalformedBatch(format!(
                "{name} span {i} is empty or reversed ({start}..{end})"
            )));
        }
        if end > buf.len() as u64 {
            return Err(Error::MalformedBatch(format!(
                "{name} span {i} ends at {end}, past the buffer of {} bytes",
                buf.len()
            )));
        }
        if buf[end as usize - 1] != 0 {
            return Err(Error::MalformedBatch(format!(
                "{name} record {i} is not NUL-terminated"
            )));
        }
    }
    let last = offsets[offsets.len() - 1];
    if last != buf.len() as u64 {
        return Err(Error::MalformedBatch(format!(
            "{name} offsets end at {last} but the buffer holds {} bytes",
            buf.len()
        )));
    }
    Ok(())
}

/// Computes offsets for a buffer of back-to-back NUL-terminated fields.
///
/// # Errors
///
/// Returns [`Error::MalformedBatch`] if the buffer does not end with a
/// terminator.
///
/// ```
/// use stragg_core::batch::offsets_from_terminators;
///
/// assert_eq!(offsets_from_terminators(b"a\0bb\0\0").unwrap(), vec![0, 2, 5, 6]);
/// assert!(offsets_from_terminators(b"a\0b").is_err());
/// ```
pub fn offsets_from_terminators(buf: &[u8]) -> Result<Vec<u64>> {
    if buf.last().is_some_and(|&b| b != 0) {
        return Err(Error::MalformedBatch(
            "packed buffer does not end with a NUL terminator".into(),
        ));
    }
    let mut offsets = Vec::with_capacity(buf.len() / 4 + 1);
    offsets.push(0);
    offsets.extend(
        buf.iter()
            .enumerate()
            .filter(|&(_, &b)| b == 0)
            .map(|(i, _)| i as u64 + 1),
    );
    Ok(offsets)
}

/// Owned batch under construction. Always satisfies the batch invariants.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchBuilder {
    keys: Vec<u8>,
    key_offsets: Vec<u64>,
    values: Vec<u8>,
    value_offsets: Vec<u64>,
}

impl Default for BatchBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl BatchBuilder {
    /// Empty builder.
    #[must_use]
    pub fn new() -> Self {
        Self::with_capacity(0, 0)
    }

    /// Empty builder with room for `records` records of `bytes` bytes per
    /// buffer.
    #[must_use]
    pub fn with_capacity(records: usize, bytes: usize) -> Self {
        let mut key_offsets = Vec::with_capacity(records + 1);
        key_offsets.push(0);
        let mut value_offsets = Vec::with_capacity(records + 1);
        value_offsets.push(0);
        Self {
            keys: Vec::with_capacity(bytes),
            key_offsets,
            values: Vec::with_capacity(bytes),
            value_offsets,
        }
    }

    /// Appends one record. Both fields get a NUL terminator.
    pub fn push(&mut self, key: &[u8], value: &[u8]) {
        self.keys.extend_from_slice(key);
        self.keys.push(0);
        self.key_offsets.push(self.keys.len() as u64);
        self.values.extend_from_slice(value);
        self.values.push(0);
        self.value_offsets.push(self.values.len() as u64);
    }

    /// Number of records.
    #[must_use]
    pub fn len(&self) -> usize {
        self.key_offsets.len() - 1
    }

    /// Whether no record has been pushed.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Packed key bytes so far.
    #[must_use]
    pub fn keys_bytes(&self) -> usize {
        self.keys.len()
    }

    /// Packed value bytes so far.
    #[must_use]
    pub fn values_bytes(&self) -> usize {
        self.values.len()
    }

    /// Borrowed view of the records.
    #[must_use]
    pub fn as_batch(&self) -> Batch<'_> {
        Batch {
            keys: &self.keys,
            key_offsets: &self.key_offsets,
            values: &self.values,
            value_offsets: &self.value_offsets,
        }
    }

    /// Removes every record, keeping the allocations.
    pub fn clear(&mut self) {
        self.keys.clear();
        self.values.clear();
        self.key_offsets.truncate(1);
        self.value_offsets.truncate(1);
    }
}

impl<K: AsRef<[u8]>, V: AsRef<[u8]>> FromIterator<(K, V)> for BatchBuilder {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut builder = Self::new();
        for (k, v) in iter {
            builder.push(k.as_ref(), v.as_ref());
        }
        builder
    }
}
