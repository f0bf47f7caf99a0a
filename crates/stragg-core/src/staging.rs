//! Pinned staging ring.
//!
//! `chunks_num * 2` pinned slots, each large enough for one maximal batch:
//!
//! ```text
//! | keys (bytes_cap) | values (bytes_cap) | key offsets (u64 x N+1) | value offsets (u64 x N+1) |
//! ```
//!
//! A slot is either free, held by `queue_data` while it packs a batch, or in
//! flight until the event recorded after its kernel fires. When no slot is
//! free, [`StagingRing::acquire`] blocks on the oldest in-flight event.

use std::collections::VecDeque;
use std::sync::Arc;

use stragg_device::{DeviceContext, Event, PinnedBuffer};

use crate::batch::Batch;
use crate::error::{Error, Phase, Result};

/// Batches smaller than this are packed on the calling thread.
pub(crate) const PARALLEL_COPY_MIN_BYTES: usize = 64 << 10;

/// Region offsets inside a staging slot (and the matching device scratch).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct StagingLayout {
    bytes_cap: usize,
    offsets_cap: usize,
}

impl StagingLayout {
    pub(crate) fn new(batch_max_bytes: usize, batch_max_records: usize) -> Self {
        Self {
            bytes_cap: batch_max_bytes.next_multiple_of(8),
            offsets_cap: batch_max_records + 1,
        }
    }

    pub(crate) fn slot_len(&self) -> usize {
        2 * self.bytes_cap + 16 * self.offsets_cap
    }

    pub(crate) fn keys_at(&self) -> usize {
        0
    }

    pub(crate) fn values_at(&self) -> usize {
        self.bytes_cap
    }

    pub(crate) fn key_offsets_at(&self) -> usize {
        2 * self.bytes_cap
    }

    pub(crate) fn value_offsets_at(&self) -> usize {
        2 * self.bytes_cap + 8 * self.offsets_cap
    }
}

/// A batch packed into a slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct StagedBatch {
    pub(crate) slot: usize,
    pub(crate) records: usize,
    pub(crate) keys_len: usize,
    pub(crate) values_len: usize,
}

impl StagedBatch {
    pub(crate) fn offsets_len(&self) -> usize {
        8 * (self.records + 1)
    }
}

pub(crate) struct StagingRing {
    layout: StagingLayout,
    slots: Vec<Arc<PinnedBuffer>>,
    free: VecDeque<usize>,
    in_flight: VecDeque<(usize, Event)>,
    pool: rayon::ThreadPool,
    pool_size: usize,
}

impl StagingRing {
    pub(crate) fn new(
        ctx: &DeviceContext,
        layout: StagingLayout,
        slot_count: usize,
        pool_size: usize,
    ) -> Result<Self> {
        let slots = (0..slot_count)
            .map(|_| ctx.alloc_pinned(layout.slot_len()).map(Arc::new))
            .collect::<stragg_device::Result<Vec<_>>>()
            .map_err(|e| Error::device(Phase::Construct, e))?;
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(pool_size)
            .thread_name(|i| format!("stragg-memcpy-{i}"))
            .build()
            .map_err(|e| Error::internal(Phase::Construct, format!("memcpy pool: {e}")))?;
        Ok(Self {
            layout,
            slots,
            free: (0..slot_count).collect(),
            in_flight: VecDeque::with_capacity(slot_count),
            pool,
            pool_size,
        })
    }

    pub(crate) fn capacity(&self) -> usize {
        self.slots.len()
    }

    pub(crate) fn in_flight(&self) -> usize {
        self.in_flight.len()
    }

    pub(crate) fn slot(&self, slot: usize) -> &Arc<PinnedBuffer> {
        &self.slots[slot]
    }

    /// Returns a free slot and whether the call had to wait for one.
    pub(crate) fn acquire(&mut self) -> Result<(usize, bool)> {
        self.reclaim();
        if let Some(slot) = self.free.pop_front() {
            return Ok((slot, false));
        }
        match self.in_flight.pop_front() {
            Some((slot, event)) => {
                tracing::debug!(slot, in_flight = self.in_flight.len() + 1, "staging ring full, waiting");
                event.synchronize();
                Ok((slot, true))
            }
            None => Err(Error::internal(Phase::Queue, "staging ring has no free or in-flight slot")),
        }
    }

    /// Returns an acquired slot that was never submitted.
    pub(crate) fn release(&mut self, slot: usize) {
        self.free.push_front(slot);
    }

    /// Marks `slot` in flight until `event` fires.
    pub(crate) fn submit(&mut self, slot: usize, event: Event) {
        self.in_flight.push_back((slot, event));
    }

    /// Waits for every in-flight slot.
    pub(crate) fn drain(&mut self) {
        while let Some((slot, event)) = self.in_flight.pop_front() {
            event.synchronize();
            self.free.push_back(slot);
        }
    }

    /// Copies `batch` into `slot`, using up to `threads` pool workers.
    pub(crate) fn pack(&mut self, slot: usize, batch: &Batch<'_>, threads: usize) -> Result<StagedBatch> {
        let layout = self.layout;
        let keys = batch.keys_buf();
        let values = batch.values_buf();
        let key_offsets = batch.key_offsets();
        let value_offsets = batch.value_offsets();

        let total = keys.len() + values.len() + 16 * key_offsets.len();
        let workers = if total < PARALLEL_COPY_MIN_BYTES {
            1
        } else {
            threads.clamp(1, self.pool_size)
        };

        let Some(buf) = Arc::get_mut(&mut self.slots[slot]) else {
            return Err(Error::internal(Phase::Queue, "staging slot still referenced by a stream"));
        };
        let (keys_region, rest) = buf.as_mut_slice().split_at_mut(layout.values_at());
        let (values_region, rest) = rest.split_at_mut(layout.key_offsets_at() - layout.values_at());
        let (key_offs_region, value_offs_region) =
            rest.split_at_mut(layout.value_offsets_at() - layout.key_offsets_at());

        let keys_dst = &mut keys_region[..keys.len()];
        let values_dst = &mut values_region[..values.len()];
        let key_offs_dst = &mut key_offs_region[..8 * key_offsets.len()];
        let value_offs_dst = &mut value_offs_region[..8 * value_offsets.len()];

        if workers == 1 {
            keys_dst.copy_from_slice(keys);
            values_dst.copy_from_slice(values);
            write_offsets(key_offs_dst, key_offsets);
            write_offsets(value_offs_dst, value_offsets);
        } else {
            self.pool.scope(|s| {
                copy_partitioned(s, keys_dst, keys, workers);
                copy_partitioned(s, values_dst, values, workers);
                copy_offsets_partitioned(s, key_offs_dst, key_offsets, workers);
                copy_offsets_partitioned(s, value_offs_dst, value_offsets, workers);
            });
        }

        Ok(StagedBatch {
            slot,
            records: batch.len(),
            keys_len: keys.len(),
            values_len: values.len(),
        })
    }

    fn reclaim(&mut self) {
        let free = &mut self.free;
        self.in_flight.retain(|(slot, event)| {
            if event.query() {
                free.push_back(*slot);
                false
            } else {
                true
            }
        });
    }
}

fn copy_partitioned<'s>(scope: &rayon::Scope<'s>, dst: &'s mut [u8], src: &'s [u8], parts: usize) {
    let chunk = src.len().div_ceil(parts).max(1);
    for (d, s) in dst.chunks_mut(chunk).zip(src.chunks(chunk)) {
        scope.spawn(move |_| d.copy_from_slice(s));
    }
}

fn copy_offsets_partitioned<'s>(
    scope: &rayon::Scope<'s>,
    dst: &'s mut [u8],
    src: &'s [u64],
    parts: usize,
) {
    let chunk = src.len().div_ceil(parts).max(1);
    for (d, s) in dst.chunks_mut(8 * chunk).zip(src.chunks(chunk)) {
        scope.spawn(move |_| write_offsets(d, s));
    }
}

fn write_offsets(dst: &mut [u8], src: &[u64]) {
    for (d, offset) in dst.chunks_exact_mut(8).zip(src) {
        d.copy_from_slice(&offset.to_ne_bytes());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::Ordering;
    use std::time::Duration;

    use crate::batch::BatchBuilder;
    use crate::kernel::GateKernel;

    fn read_offsets(bytes: &[u8]) -> Vec<u64> {
        bytes
            .chunks_exact(8)
            .map(|c| u64::from_ne_bytes(c.try_into().unwrap()))
            .collect()
    }

    fn ring(slots: usize, bytes: usize, records: usize) -> StagingRing {
        let ctx = DeviceContext::new(0).unwrap();
        StagingRing::new(&ctx, StagingLayout::new(bytes, records), slots, 4).unwrap()
    }

    #[test]
    fn test_layout_regions() {
        let l = StagingLayout::new(13, 3);
        assert_eq!(l.values_at(), 16);
        assert_eq!(l.key_offsets_at(), 32);
        assert_eq!(l.value_offsets_at(), 64);
        assert_eq!(l.slot_len(), 96);
    }

    #[test]
    fn test_pack_small_batch() {
        let mut ring = ring(2, 64, 4);
        let b: BatchBuilder = [("a", "x"), ("bb", "yy")].into_iter().collect();
        let (slot, waited) = ring.acquire().unwrap();
        assert!(!waited);
        let staged = ring.pack(slot, &b.as_batch(), 4).unwrap();
        assert_eq!(staged.records, 2);
        assert_eq!(staged.keys_len, 5);

        let l = ring.layout;
        let bytes = ring.slot(slot).as_slice();
        assert_eq!(&bytes[..5], b"a\0bb\0");
        assert_eq!(&bytes[l.values_at()..l.values_at() + 5], b"x\0yy\0");
        assert_eq!(read_offsets(&bytes[l.key_offsets_at()..][..24]), vec![0, 2, 5]);
        assert_eq!(read_offsets(&bytes[l.value_offsets_at()..][..24]), vec![0, 2, 5]);
    }

    #[test]
    fn test_pack_parallel_matches_serial() {
        let records = 20_000;
        let b: BatchBuilder = (0..records).map(|i| (format!("key-{i}"), format!("value-{i}"))).collect();
        let batch = b.as_batch();
        let bytes = batch.keys_buf().len().max(batch.values_buf().len());
        assert!(bytes >= PARALLEL_COPY_MIN_BYTES);

        let mut ring = ring(1, bytes, records);
        let (slot, _) = ring.acquire().unwrap();
        ring.pack(slot, &batch, 3).unwrap();

        let l = ring.layout;
        let staged = ring.slot(slot).as_slice();
        assert_eq!(&staged[..batch.keys_buf().len()], batch.keys_buf());
        assert_eq!(
            &staged[l.values_at()..l.values_at() + batch.values_buf().len()],
            batch.values_buf()
        );
        let n = 8 * (records + 1);
        assert_eq!(read_offsets(&staged[l.key_offsets_at()..][..n]), batch.key_offsets());
        assert_eq!(read_offsets(&staged[l.value_offsets_at()..][..n]), batch.value_offsets());
    }

    #[test]
    fn test_acquire_waits_for_oldest() {
        let ctx = DeviceContext::new(0).unwrap();
        let stream = ctx.new_stream().unwrap();
        let mut ring = StagingRing::new(&ctx, StagingLayout::new(8, 1), 2, 1).unwrap();

        let (a, _) = ring.acquire().unwrap();
        ring.submit(a, stream.record_event().unwrap());
        let (b, _) = ring.acquire().unwrap();
        assert_ne!(a, b);
        ring.submit(b, stream.record_event().unwrap());
        assert_eq!(ring.in_flight(), 2);

        stream.synchronize().unwrap();
        let (c, _) = ring.acquire().unwrap();
        assert_eq!(c, a, "oldest completed slot is reused first");
        ring.release(c);
        ring.drain();
        assert_eq!(ring.in_flight(), 0);
        assert_eq!(ring.capacity(), 2);
    }

    #[test]
    fn test_acquire_blocks_while_ring_is_full() {
        let ctx = DeviceContext::new(0).unwrap();
        let stream = ctx.new_stream().unwrap();
        let mut ring = StagingRing::new(&ctx, StagingLayout::new(8, 1), 2, 1).unwrap();

        let open = GateKernel::block(&stream);
        let (a, _) = ring.acquire().unwrap();
        ring.submit(a, stream.record_event().unwrap());
        let (b, _) = ring.acquire().unwrap();
        ring.submit(b, stream.record_event().unwrap());

        std::thread::scope(|s| {
            let waiter = s.spawn(|| ring.acquire().unwrap());
            std::thread::sleep(Duration::from_millis(50));
            assert!(!waiter.is_finished(), "acquire returned with every slot in flight");

            open.store(true, Ordering::Release);
            let (slot, waited) = waiter.join().unwrap();
            assert_eq!(slot, a);
            assert!(waited);
        });
        stream.synchronize().unwrap();
    }
}
