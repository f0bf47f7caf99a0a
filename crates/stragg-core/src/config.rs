//! Configuration for an [`crate::Aggregator`].

use crate::error::Result;
use crate::function::AggregateFunction;
use crate::guard;

/// Default number of device streams.
pub const DEFAULT_CHUNKS_NUM: usize = 2;
/// Default hash table slot count.
pub const DEFAULT_TABLE_CAPACITY: usize = 1 << 16;
/// Default key arena size (4 MiB).
pub const DEFAULT_ARENA_CAPACITY: usize = 4 << 20;
/// Default record limit per batch.
pub const DEFAULT_BATCH_MAX_RECORDS: usize = 8192;
/// Default byte limit per packed buffer per batch (256 KiB).
pub const DEFAULT_BATCH_MAX_BYTES: usize = 256 << 10;
/// Default size of the memcpy worker pool.
pub const DEFAULT_MEMCPY_THREADS: usize = 2;

/// Configuration for an aggregator. Validated on construction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AggregatorConfig {
    /// Device ordinal.
    pub dev_number: usize,
    /// Number of device streams. One means strictly serial execution.
    pub chunks_num: usize,
    /// Hash table slots. Must be a power of two.
    pub table_capacity: usize,
    /// Key arena bytes.
    pub arena_capacity: usize,
    /// Maximum records per batch.
    pub batch_max_records: usize,
    /// Maximum bytes per packed buffer (keys, values) per batch.
    pub batch_max_bytes: usize,
    /// Size of the memcpy worker pool.
    pub memcpy_threads: usize,
    /// Aggregate function registry name.
    pub function_name: String,
}

impl AggregatorConfig {
    /// Configuration with defaults for everything but the function.
    #[must_use]
    pub fn new(function_name: impl Into<String>) -> Self {
        Self {
            dev_number: 0,
            chunks_num: DEFAULT_CHUNKS_NUM,
            table_capacity: DEFAULT_TABLE_CAPACITY,
            arena_capacity: DEFAULT_ARENA_CAPACITY,
            batch_max_records: DEFAULT_BATCH_MAX_RECORDS,
            batch_max_bytes: DEFAULT_BATCH_MAX_BYTES,
            memcpy_threads: DEFAULT_MEMCPY_THREADS,
            function_name: function_name.into(),
        }
    }

    /// Sets the device ordinal.
    #[must_use]
    pub fn with_device(mut self, dev_number: usize) -> Self {
        self.dev_number = dev_number;
        self
    }

    /// Sets the stream count.
    #[must_use]
    pub fn with_chunks(mut self, chunks_num: usize) -> Self {
        self.chunks_num = chunks_num;
        self
    }

    /// Sets the hash table slot count.
    #[must_use]
    pub fn with_table_capacity(mut self, slots: usize) -> Self {
        self.table_capacity = slots;
        self
    }

    /// Sets the key arena size.
    #[must_use]
    pub fn with_arena_capacity(mut self, bytes: usize) -> Self {
        self.arena_capacity = bytes;
        self
    }

    /// Sets both per-batch limits.
    #[must_use]
    pub fn with_batch_limits(mut self, max_records: usize, max_bytes: usize) -> Self {
        self.batch_max_records = max_records;
        self.batch_max_bytes = max_bytes;
        self
    }

    /// Sets the memcpy worker pool size.
    #[must_use]
    pub fn with_memcpy_threads(mut self, threads: usize) -> Self {
        self.memcpy_threads = threads;
        self
    }

    /// Checks every limit and resolves the function.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::InvalidConfig`] or
    /// [`crate::Error::UnknownFunction`].
    pub fn validate(&self) -> Result<AggregateFunction> {
        guard::preflight(self)
    }
}
