//! The aggregation facade and its lifecycle.
//!
//! ```text
//! NEW ──start_processing──▶ OPEN ──wait_processed──▶ DRAINING ──▶ CLOSED
//!                            │                          │
//!                            └──── device fault ────────┴───────▶ FAULTED
//! ```
//!
//! All host-side state (ring occupancy, stream cursor, lifecycle) sits
//! behind one mutex, so an [`Aggregator`] can be shared across threads.
//! Batches queued from different threads are serialized at dispatch; the
//! device work they launch still overlaps across streams.

use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;
use stragg_device::{DeviceContext, DeviceError};

use crate::batch::Batch;
use crate::config::AggregatorConfig;
use crate::error::{Error, Phase, Result};
use crate::function::AggregateFunction;
use crate::guard;
use crate::kernel::BatchDriver;
use crate::materialize::materialize;
use crate::result::AggregateResult;
use crate::staging::{StagingLayout, StagingRing};
use crate::table::DeviceHashTable;

/// Lifecycle state of an [`Aggregator`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AggregatorState {
    /// Constructed; device resources allocated but not initialized.
    New,
    /// Accepting batches.
    Open,
    /// Waiting for in-flight work.
    Draining,
    /// Drained without fault; the result can be collected.
    Closed,
    /// A device fault was observed. Only destruction is possible.
    Faulted,
}

impl fmt::Display for AggregatorState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::New => "NEW",
            Self::Open => "OPEN",
            Self::Draining => "DRAINING",
            Self::Closed => "CLOSED",
            Self::Faulted => "FAULTED",
        };
        f.write_str(s)
    }
}

/// Counters of queued work.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AggregatorStats {
    /// Batches accepted by `queue_data`.
    pub batches: u64,
    /// Records accepted.
    pub records: u64,
    /// Packed key bytes accepted, terminators included.
    pub key_bytes: u64,
    /// Packed value bytes accepted, terminators included.
    pub value_bytes: u64,
    /// Times `queue_data` waited for a staging slot.
    pub backpressure_waits: u64,
}

struct Inner {
    // Streams first: dropping them joins their workers before the buffers
    // their commands point into are freed.
    driver: BatchDriver,
    ring: StagingRing,
    table: DeviceHashTable,
    state: AggregatorState,
    stats: AggregatorStats,
    result: Option<Arc<AggregateResult>>,
}

impl Inner {
    fn require(&self, phase: Phase, expected: AggregatorState) -> Result<()> {
        if self.state == expected {
            Ok(())
        } else {
            Err(Error::StateMisuse {
                phase,
                state: self.state,
            })
        }
    }

    /// Moves to FAULTED and hands the error back.
    fn fail(&mut self, err: Error) -> Error {
        tracing::warn!(
            code = err.code(),
            phase = %err.phase(),
            from = %self.state,
            error = %err,
            "aggregator faulted"
        );
        self.state = AggregatorState::Faulted;
        err
    }

    /// Surfaces a fault already observed by a stream or the table.
    fn check_device(&self, phase: Phase) -> Result<()> {
        guard::check_table(&self.table, phase)?;
        match self.driver.fault() {
            Some(e) => Err(Error::device(phase, e)),
            None => Ok(()),
        }
    }
}

/// Streaming GROUP BY aggregator over NUL-terminated string keys.
///
/// Feed batches with [`Aggregator::queue_data`] between
/// [`Aggregator::start_processing`] and [`Aggregator::wait_processed`], then
/// collect with [`Aggregator::get_result`].
pub struct Aggregator {
    config: AggregatorConfig,
    function: AggregateFunction,
    ctx: DeviceContext,
    inner: Mutex<Inner>,
}

impl Aggregator {
    /// Validates `config`, opens device `config.dev_number` and allocates
    /// every device and pinned resource.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidConfig`] or [`Error::UnknownFunction`] before
    /// touching the device, [`Error::DeviceInit`] if the device does not
    /// exist, and [`Error::OutOfDeviceMemory`] if an allocation fails.
    pub fn new(config: AggregatorConfig) -> Result<Self> {
        let function = config.validate()?;
        let ctx = DeviceContext::new(config.dev_number)
            .map_err(|e| Error::device(Phase::Construct, e))?;
        Self::build(ctx, config, function)
    }

    /// Like [`Aggregator::new`], on an existing device context.
    ///
    /// # Errors
    ///
    /// As [`Aggregator::new`]; also [`Error::InvalidConfig`] if
    /// `config.dev_number` is not the context's ordinal.
    pub fn with_context(ctx: DeviceContext, config: AggregatorConfig) -> Result<Self> {
        let function = config.validate()?;
        if config.dev_number != ctx.ordinal() {
            return Err(Error::config(
                Phase::Construct,
                format!(
                    "dev_number {} does not match context device {}",
                    config.dev_number,
                    ctx.ordinal()
                ),
            ));
        }
        Self::build(ctx, config, function)
    }

    fn build(ctx: DeviceContext, config: AggregatorConfig, function: AggregateFunction) -> Result<Self> {
        let dev = |e: DeviceError| Error::device(Phase::Construct, e);
        let layout = StagingLayout::new(config.batch_max_bytes, config.batch_max_records);
        let table = DeviceHashTable::new(
            &ctx,
            function.descriptor(),
            config.table_capacity,
            config.arena_capacity,
        )
        .map_err(dev)?;
        let driver = BatchDriver::new(&ctx, config.chunks_num, layout).map_err(dev)?;
        let ring = StagingRing::new(&ctx, layout, config.chunks_num * 2, config.memcpy_threads)?;

        tracing::info!(
            device = ctx.ordinal(),
            function = %function,
            chunks_num = config.chunks_num,
            staging_slots = ring.capacity(),
            table_capacity = config.table_capacity,
            arena_capacity = config.arena_capacity,
            device_memory_used = ctx.memory_used(),
            "aggregator constructed"
        );
        Ok(Self {
            config,
            function,
            ctx,
            inner: Mutex::new(Inner {
                driver,
                ring,
                table,
                state: AggregatorState::New,
                stats: AggregatorStats::default(),
                result: None,
            }),
        })
    }

    /// Zeroes the table, the arena cursor and the error flag. NEW → OPEN.
    ///
    /// # Errors
    ///
    /// Returns [`Error::StateMisuse`] outside NEW, or the device error that
    /// stopped initialization (the aggregator is then FAULTED).
    pub fn start_processing(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        inner.require(Phase::Start, AggregatorState::New)?;
        let reset = {
            let stream = inner.driver.stream(0);
            inner.table.reset(stream).and_then(|()| stream.synchronize())
        };
        if let Err(e) = reset {
            return Err(inner.fail(Error::device(Phase::Start, e)));
        }
        inner.state = AggregatorState::Open;
        tracing::debug!(device = self.ctx.ordinal(), "aggregator open");
        Ok(())
    }

    /// Queues one batch.
    ///
    /// Blocks while every staging slot is in flight, then packs the batch
    /// into pinned memory using up to `memcpy_threads` pool workers (clamped
    /// to the pool size). The transfer and the kernel run asynchronously.
    ///
    /// # Errors
    ///
    /// Returns [`Error::StateMisuse`] outside OPEN and
    /// [`Error::BatchTooLarge`] for an oversized batch, both without side
    /// effects. A device fault observed while recycling a slot is returned
    /// and the aggregator becomes FAULTED.
    pub fn queue_data(&self, batch: &Batch<'_>, memcpy_threads: usize) -> Result<()> {
        let mut locked = self.inner.lock();
        let inner = &mut *locked;
        inner.require(Phase::Queue, AggregatorState::Open)?;
        guard::check_batch(batch, &self.config)?;

        if !batch.is_empty() {
            let (slot, waited) = match inner.ring.acquire() {
                Ok(acquired) => acquired,
                Err(e) => return Err(inner.fail(e)),
            };
            if waited {
                inner.stats.backpressure_waits += 1;
            }
            if let Err(e) = inner.check_device(Phase::Queue) {
                inner.ring.release(slot);
                return Err(inner.fail(e));
            }
            let staged = match inner.ring.pack(slot, batch, memcpy_threads) {
                Ok(staged) => staged,
                Err(e) => {
                    inner.ring.release(slot);
                    return Err(inner.fail(e));
                }
            };
            let stream = inner.driver.next_stream();
            let dispatched =
                inner
                    .driver
                    .dispatch(stream, inner.ring.slot(slot), &staged, inner.table.view());
            match dispatched {
                Ok(event) => inner.ring.submit(slot, event),
                Err(e) => {
                    inner.ring.release(slot);
                    return Err(inner.fail(Error::device(Phase::Queue, e)));
                }
            }
            tracing::trace!(
                stream,
                slot,
                records = staged.records,
                in_flight = inner.ring.in_flight(),
                "batch dispatched"
            );
        }

        let stats = &mut inner.stats;
        stats.batches += 1;
        stats.records += batch.len() as u64;
        stats.key_bytes += batch.keys_buf().len() as u64;
        stats.value_bytes += batch.values_buf().len() as u64;
        Ok(())
    }

    /// Waits for all queued work. OPEN → DRAINING → CLOSED, or FAULTED if
    /// a stream or the table reports a fault.
    ///
    /// # Errors
    ///
    /// Returns [`Error::StateMisuse`] outside OPEN,
    /// [`Error::TableCapacityExceeded`] or [`Error::ArenaCapacityExceeded`]
    /// if the device ran out of room, or [`Error::DeviceKernelFault`].
    pub fn wait_processed(&self) -> Result<()> {
        let mut locked = self.inner.lock();
        let inner = &mut *locked;
        inner.require(Phase::Drain, AggregatorState::Open)?;
        inner.state = AggregatorState::Draining;

        inner.ring.drain();
        let synced = inner.driver.synchronize();
        let checked = guard::check_table(&inner.table, Phase::Drain)
            .and_then(|()| synced.map_err(|e| Error::device(Phase::Drain, e)));
        if let Err(e) = checked {
            return Err(inner.fail(e));
        }

        inner.state = AggregatorState::Closed;
        let stats = inner.stats;
        tracing::info!(
            function = %self.function,
            batches = stats.batches,
            records = stats.records,
            keys = inner.table.occupied().unwrap_or(0),
            backpressure_waits = stats.backpressure_waits,
            "aggregator drained"
        );
        Ok(())
    }

    /// The final result. Materialized on the first call and shared after.
    ///
    /// # Errors
    ///
    /// Returns [`Error::StateMisuse`] outside CLOSED, or the device error
    /// that stopped the copy-out (the aggregator is then FAULTED).
    pub fn get_result(&self) -> Result<Arc<AggregateResult>> {
        let mut locked = self.inner.lock();
        let inner = &mut *locked;
        inner.require(Phase::Collect, AggregatorState::Closed)?;
        if let Some(result) = &inner.result {
            return Ok(Arc::clone(result));
        }
        match materialize(&self.ctx, inner.driver.stream(0), &inner.table) {
            Ok(result) => {
                let result = Arc::new(result);
                inner.result = Some(Arc::clone(&result));
                Ok(result)
            }
            Err(e) => Err(inner.fail(e)),
        }
    }

    /// Waits for in-flight device work and releases every resource. Valid
    /// in any state; dropping the aggregator does the same.
    pub fn destroy(self) {
        tracing::debug!(state = %self.state(), "aggregator destroyed");
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> AggregatorState {
        self.inner.lock().state
    }

    /// Counters of queued work.
    #[must_use]
    pub fn stats(&self) -> AggregatorStats {
        self.inner.lock().stats
    }

    /// The validated configuration.
    #[must_use]
    pub fn config(&self) -> &AggregatorConfig {
        &self.config
    }

    /// The resolved aggregate function.
    #[must_use]
    pub fn function(&self) -> AggregateFunction {
        self.function
    }

    /// The device context the aggregator runs on.
    #[must_use]
    pub fn device(&self) -> &DeviceContext {
        &self.ctx
    }
}

impl Drop for Aggregator {
    fn drop(&mut self) {
        let inner = self.inner.get_mut();
        inner.ring.drain();
        if let Err(e) = inner.driver.synchronize() {
            tracing::debug!(error = %e, "device fault pending at drop");
        }
    }
}

impl fmt::Debug for Aggregator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Aggregator")
            .field("device", &self.ctx.ordinal())
            .field("function", &self.function)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::Ordering;
    use std::time::Duration;

    use crate::batch::BatchBuilder;
    use crate::kernel::GateKernel;

    fn small(function: &str) -> AggregatorConfig {
        AggregatorConfig::new(function)
            .with_table_capacity(64)
            .with_arena_capacity(1024)
            .with_batch_limits(16, 256)
    }

    #[test]
    fn test_state_display() {
        let names: Vec<_> = [
            AggregatorState::New,
            AggregatorState::Open,
            AggregatorState::Draining,
            AggregatorState::Closed,
            AggregatorState::Faulted,
        ]
        .iter()
        .map(ToString::to_string)
        .collect();
        assert_eq!(names, ["NEW", "OPEN", "DRAINING", "CLOSED", "FAULTED"]);
    }

    #[test]
    fn test_lifecycle() {
        let agg = Aggregator::new(small("COUNT")).unwrap();
        assert_eq!(agg.state(), AggregatorState::New);
        agg.start_processing().unwrap();
        assert_eq!(agg.state(), AggregatorState::Open);

        let batch: BatchBuilder = [("k", ""), ("k", ""), ("j", "")].into_iter().collect();
        agg.queue_data(&batch.as_batch(), 1).unwrap();
        agg.queue_data(&Batch::empty(), 1).unwrap();
        agg.wait_processed().unwrap();
        assert_eq!(agg.state(), AggregatorState::Closed);

        let stats = agg.stats();
        assert_eq!(stats.batches, 2);
        assert_eq!(stats.records, 3);
        assert_eq!(stats.key_bytes, 6);

        let r = agg.get_result().unwrap();
        assert_eq!(r.get(b"k"), Some(2));
        assert_eq!(r.get(b"j"), Some(1));
        agg.destroy();
    }

    #[test]
    fn test_misuse_leaves_state() {
        let agg = Aggregator::new(small("COUNT")).unwrap();
        let err = agg.queue_data(&Batch::empty(), 1).unwrap_err();
        assert!(matches!(
            err,
            Error::StateMisuse { phase: Phase::Queue, state: AggregatorState::New }
        ));
        assert!(agg.wait_processed().is_err());
        assert!(agg.get_result().is_err());
        assert_eq!(agg.state(), AggregatorState::New);
    }

    #[test]
    fn test_fault_moves_to_faulted() {
        let agg = Aggregator::new(small("COUNT").with_table_capacity(2)).unwrap();
        agg.start_processing().unwrap();
        let batch: BatchBuilder = ["a", "b", "c"].iter().map(|k| (*k, "")).collect();
        agg.queue_data(&batch.as_batch(), 1).unwrap();
        let err = agg.wait_processed().unwrap_err();
        assert!(matches!(err, Error::TableCapacityExceeded { phase: Phase::Drain, capacity: 2 }));
        assert_eq!(agg.state(), AggregatorState::Faulted);
        assert!(matches!(agg.get_result(), Err(Error::StateMisuse { .. })));
    }

    #[test]
    fn test_queue_blocks_when_staging_is_full() {
        let agg = Aggregator::new(small("COUNT").with_chunks(1)).unwrap();
        agg.start_processing().unwrap();
        let open = GateKernel::block(agg.inner.lock().driver.stream(0));

        let batch: BatchBuilder = ["a", "b", "a"].iter().map(|k| (*k, "")).collect();
        agg.queue_data(&batch.as_batch(), 1).unwrap();
        agg.queue_data(&batch.as_batch(), 1).unwrap();
        assert_eq!(agg.stats().backpressure_waits, 0);

        std::thread::scope(|s| {
            let third = s.spawn(|| agg.queue_data(&batch.as_batch(), 1));
            std::thread::sleep(Duration::from_millis(50));
            assert!(!third.is_finished(), "queue_data returned with both slots in flight");
            open.store(true, Ordering::Release);
            third.join().unwrap().unwrap();
        });

        let stats = agg.stats();
        assert_eq!(stats.batches, 3);
        assert_eq!(stats.backpressure_waits, 1);
        agg.wait_processed().unwrap();
        let r = agg.get_result().unwrap();
        assert_eq!(r.get(b"a"), Some(6));
        assert_eq!(r.get(b"b"), Some(3));
    }

    #[test]
    fn test_aggregator_is_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<Aggregator>();
        assert_send_sync::<AggregateResult>();
    }
}
