//! Aggregation kernel and the multi-stream batch driver.
//!
//! Each stream owns a device scratch buffer laid out like a staging slot.
//! A dispatch enqueues, in stream order: the four host-to-device copies, the
//! aggregation kernel (one device thread per record), then an event that
//! releases the staging slot. Streams are picked round-robin, so batches on
//! different streams overlap while batches on one stream stay serial.

use std::sync::Arc;

use stragg_device::{
    DeviceBuffer, DeviceContext, DeviceError, DevicePtr, Event, Kernel, LaunchConfig, PinnedBuffer,
    Stream, ThreadIdx,
};

use crate::staging::{StagedBatch, StagingLayout};
use crate::table::TableView;

/// Threads per block for every kernel this crate launches.
pub(crate) const BLOCK_DIM: u32 = 256;

/// Folds one staged batch into the table.
struct AggregateKernel {
    table: TableView,
    keys: DevicePtr,
    values: DevicePtr,
    key_offsets: DevicePtr,
    value_offsets: DevicePtr,
    records: usize,
    _scratch: Arc<DeviceBuffer>,
}

impl Kernel for AggregateKernel {
    fn name(&self) -> &'static str {
        "aggregate_batch"
    }

    fn run(&self, idx: ThreadIdx) {
        let i = idx.global();
        if i >= self.records {
            return;
        }
        // SAFETY: the scratch buffer is kept alive by this kernel, the copies
        // that filled it precede the launch on the same stream, and offsets
        // were validated on the host. The table outlives every stream.
        unsafe {
            if self.table.faulted() {
                return;
            }
            let key = field(self.keys, self.key_offsets, i);
            let value = field(self.values, self.value_offsets, i);
            // Faults are recorded in the control block.
            let _ = self.table.upsert(key, value);
        }
    }
}

/// Field `i` of a packed buffer, without its terminator.
unsafe fn field<'a>(buf: DevicePtr, offsets: DevicePtr, i: usize) -> &'a [u8] {
    let start = offsets.byte_add(8 * i).read_u64() as usize;
    let end = offsets.byte_add(8 * (i + 1)).read_u64() as usize;
    buf.byte_add(start).as_slice(end - start - 1)
}

/// Streams and their scratch buffers.
pub(crate) struct BatchDriver {
    streams: Vec<Stream>,
    scratch: Vec<Arc<DeviceBuffer>>,
    layout: StagingLayout,
    next: usize,
}

impl BatchDriver {
    pub(crate) fn new(
        ctx: &DeviceContext,
        chunks_num: usize,
        layout: StagingLayout,
    ) -> stragg_device::Result<Self> {
        let mut streams = Vec::with_capacity(chunks_num);
        let mut scratch = Vec::with_capacity(chunks_num);
        for _ in 0..chunks_num {
            streams.push(ctx.new_stream()?);
            scratch.push(Arc::new(ctx.alloc_zeros(layout.slot_len())?));
        }
        Ok(Self {
            streams,
            scratch,
            layout,
            next: 0,
        })
    }

    pub(crate) fn stream(&self, i: usize) -> &Stream {
        &self.streams[i]
    }

    /// Picks the next stream round-robin.
    pub(crate) fn next_stream(&mut self) -> usize {
        let i = self.next;
        self.next = (self.next + 1) % self.streams.len();
        i
    }

    /// Enqueues copy, kernel and release event for `staged` on stream `i`.
    pub(crate) fn dispatch(
        &self,
        i: usize,
        src: &Arc<PinnedBuffer>,
        staged: &StagedBatch,
        table: TableView,
    ) -> stragg_device::Result<Event> {
        let stream = &self.streams[i];
        let scratch = &self.scratch[i];
        let l = self.layout;
        let offsets_len = staged.offsets_len();

        let copies = [
            (l.keys_at(), staged.keys_len),
            (l.values_at(), staged.values_len),
            (l.key_offsets_at(), offsets_len),
            (l.value_offsets_at(), offsets_len),
        ];
        for (at, len) in copies {
            if len > 0 {
                stream.memcpy_htod(src, at..at + len, scratch, at)?;
            }
        }

        if staged.records > 0 {
            let base = scratch.device_ptr();
            let kernel = AggregateKernel {
                table,
                keys: base.byte_add(l.keys_at()),
                values: base.byte_add(l.values_at()),
                key_offsets: base.byte_add(l.key_offsets_at()),
                value_offsets: base.byte_add(l.value_offsets_at()),
                records: staged.records,
                _scratch: Arc::clone(scratch),
            };
            let cfg = LaunchConfig::for_num_elems(staged.records as u32, BLOCK_DIM);
            stream.launch(cfg, Arc::new(kernel))?;
        }
        stream.record_event()
    }

    /// Waits for every stream; returns the first fault after all are idle.
    pub(crate) fn synchronize(&self) -> stragg_device::Result<()> {
        let mut first = None;
        for stream in &self.streams {
            if let Err(e) = stream.synchronize() {
                first.get_or_insert(e);
            }
        }
        first.map_or(Ok(()), Err)
    }

    /// First sticky fault across streams, without waiting.
    pub(crate) fn fault(&self) -> Option<DeviceError> {
        self.streams.iter().find_map(Stream::fault)
    }
}

/// A kernel that holds its stream until opened from the host.
#[cfg(test)]
pub(crate) struct GateKernel {
    open: Arc<std::sync::atomic::AtomicBool>,
}

#[cfg(test)]
impl GateKernel {
    /// Enqueues a closed gate on `stream`; storing `true` in the returned
    /// flag lets the stream continue.
    pub(crate) fn block(stream: &Stream) -> Arc<std::sync::atomic::AtomicBool> {
        let open = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let gate = Self {
            open: Arc::clone(&open),
        };
        stream
            .launch(LaunchConfig { grid_dim: 1, block_dim: 1 }, Arc::new(gate))
            .unwrap();
        open
    }
}

#[cfg(test)]
impl Kernel for GateKernel {
    fn name(&self) -> &'static str {
        "gate"
    }

    fn run(&self, _idx: ThreadIdx) {
        while !self.open.load(std::sync::atomic::Ordering::Acquire) {
            std::thread::yield_now();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::batch::BatchBuilder;
    use crate::function::AggregateFunction;
    use crate::staging::StagingRing;
    use crate::table::DeviceHashTable;

    #[test]
    fn test_round_robin() {
        let ctx = DeviceContext::new(0).unwrap();
        let mut d = BatchDriver::new(&ctx, 3, StagingLayout::new(8, 1)).unwrap();
        let picks: Vec<_> = (0..7).map(|_| d.next_stream()).collect();
        assert_eq!(picks, vec![0, 1, 2, 0, 1, 2, 0]);
    }

    #[test]
    fn test_dispatch_counts_keys() {
        let ctx = DeviceContext::new(0).unwrap();
        let layout = StagingLayout::new(256, 16);
        let table =
            DeviceHashTable::new(&ctx, AggregateFunction::Count.descriptor(), 32, 256).unwrap();
        let mut ring = StagingRing::new(&ctx, layout, 2, 1).unwrap();
        let mut driver = BatchDriver::new(&ctx, 2, layout).unwrap();
        table.reset(driver.stream(0)).unwrap();
        driver.stream(0).synchronize().unwrap();

        let batch: BatchBuilder = ["x", "y", "x", "", "x"].iter().map(|k| (*k, "v")).collect();
        for _ in 0..4 {
            let (slot, _) = ring.acquire().unwrap();
            let staged = ring.pack(slot, &batch.as_batch(), 1).unwrap();
            let stream = driver.next_stream();
            let event = driver.dispatch(stream, ring.slot(slot), &staged, table.view()).unwrap();
            ring.submit(slot, event);
        }
        ring.drain();
        driver.synchronize().unwrap();

        assert_eq!(table.occupied().unwrap(), 3);
        assert_eq!(table.fault().unwrap(), None);
        assert!(driver.fault().is_none());
    }
}
