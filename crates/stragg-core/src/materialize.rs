//! Copies a drained device table back to the host.
//!
//! A compaction kernel walks every slot and appends each published one to
//! dense device arrays through an atomic output cursor: a 16-byte entry
//! `(slot: u32, key_len: u32, key_offset: u64)` and the state blob. The host
//! then copies the entries, the states and the used arena prefix, orders the
//! entries by slot and builds an [`AggregateResult`].

use std::sync::atomic::Ordering;
use std::sync::Arc;

use stragg_device::{
    DeviceBuffer, DeviceContext, DeviceError, DevicePtr, Kernel, LaunchConfig, Stream, ThreadIdx,
};

use crate::error::{Error, Phase, Result};
use crate::kernel::BLOCK_DIM;
use crate::result::{AggregateResult, ResultBuilder};
use crate::table::layout::CONTROL_COMPACT_CURSOR;
use crate::table::{DeviceHashTable, TableView};

const ENTRY_SIZE: usize = 16;

struct CompactKernel {
    table: TableView,
    entries: DevicePtr,
    states: DevicePtr,
    cursor: DevicePtr,
    limit: u64,
    _out: [Arc<DeviceBuffer>; 2],
}

impl Kernel for CompactKernel {
    fn name(&self) -> &'static str {
        "compact_table"
    }

    fn run(&self, idx: ThreadIdx) {
        let slot = idx.global() as u64;
        if slot >= self.table.capacity() {
            return;
        }
        let state_size = self.table.layout().state_size;
        // SAFETY: runs after every aggregation kernel has completed; the
        // output buffers are owned by this kernel and sized for `limit`.
        unsafe {
            let Some(entry) = self.table.entry(slot) else {
                return;
            };
            let i = self.cursor.atomic_u64().fetch_add(1, Ordering::Relaxed);
            if i >= self.limit {
                return;
            }
            let out = self.entries.byte_add(i as usize * ENTRY_SIZE);
            out.write_u32(slot as u32);
            out.byte_add(4).write_u32(entry.key_len);
            out.byte_add(8).write_u64(entry.key_offset);
            self.states
                .byte_add(i as usize * state_size)
                .copy_from(entry.state.as_slice(state_size));
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct CompactEntry {
    index: usize,
    slot: u32,
    key_len: usize,
    key_offset: usize,
}

/// Builds the host result for a drained, fault-free table.
///
/// # Errors
///
/// Returns the device error of any allocation, launch or copy, or
/// [`Error::Internal`] if the compacted entries disagree with the table's
/// occupancy counter.
pub(crate) fn materialize(
    ctx: &DeviceContext,
    stream: &Stream,
    table: &DeviceHashTable,
) -> Result<AggregateResult> {
    let phase = Phase::Collect;
    let dev = |e: DeviceError| Error::device(phase, e);
    let descriptor = table.descriptor();

    let occupied = table.occupied().map_err(dev)? as usize;
    if occupied == 0 {
        return Ok(AggregateResult::empty(descriptor.function));
    }
    let state_size = table.layout().state_size;

    let entries = Arc::new(ctx.alloc_zeros(occupied * ENTRY_SIZE).map_err(dev)?);
    let states = Arc::new(ctx.alloc_zeros(occupied * state_size).map_err(dev)?);
    let control = table.control();
    stream
        .memset_zeros(control, CONTROL_COMPACT_CURSOR..CONTROL_COMPACT_CURSOR + 8)
        .map_err(dev)?;

    let kernel = CompactKernel {
        table: table.view(),
        entries: entries.device_ptr(),
        states: states.device_ptr(),
        cursor: control.device_ptr().byte_add(CONTROL_COMPACT_CURSOR),
        limit: occupied as u64,
        _out: [Arc::clone(&entries), Arc::clone(&states)],
    };
    let cfg = LaunchConfig::for_num_elems(table.capacity() as u32, BLOCK_DIM);
    stream.launch(cfg, Arc::new(kernel)).map_err(dev)?;

    let mut cursor = [0u8; 8];
    stream
        .memcpy_dtoh(control, CONTROL_COMPACT_CURSOR, &mut cursor)
        .map_err(dev)?;
    let found = u64::from_ne_bytes(cursor) as usize;
    if found != occupied {
        return Err(Error::internal(
            phase,
            format!("compaction found {found} published slots, counter says {occupied}"),
        ));
    }

    let mut entry_bytes = vec![0u8; occupied * ENTRY_SIZE];
    stream.memcpy_dtoh(&entries, 0, &mut entry_bytes).map_err(dev)?;
    let mut state_bytes = vec![0u8; occupied * state_size];
    stream.memcpy_dtoh(&states, 0, &mut state_bytes).map_err(dev)?;
    let arena_used = table.arena_used().map_err(dev)? as usize;
    let mut arena = vec![0u8; arena_used];
    stream.memcpy_dtoh(table.arena(), 0, &mut arena).map_err(dev)?;

    let mut compacted: Vec<CompactEntry> = entry_bytes
        .chunks_exact(ENTRY_SIZE)
        .enumerate()
        .map(|(index, e)| CompactEntry {
            index,
            slot: u32::from_ne_bytes([e[0], e[1], e[2], e[3]]),
            key_len: u32::from_ne_bytes([e[4], e[5], e[6], e[7]]) as usize,
            key_offset: u64::from_ne_bytes([e[8], e[9], e[10], e[11], e[12], e[13], e[14], e[15]])
                as usize,
        })
        .collect();
    compacted.sort_unstable_by_key(|e| e.slot);

    let mut builder = ResultBuilder::with_capacity(descriptor, occupied, arena_used);
    for e in &compacted {
        let key = arena
            .get(e.key_offset..e.key_offset + e.key_len)
            .ok_or_else(|| {
                Error::internal(
                    phase,
                    format!("slot {} key span exceeds the {arena_used}-byte arena prefix", e.slot),
                )
            })?;
        let state = &state_bytes[e.index * state_size..(e.index + 1) * state_size];
        builder.upsert(key, state);
    }
    if builder.len() != occupied {
        return Err(Error::internal(
            phase,
            format!("{occupied} published slots hold {} distinct keys", builder.len()),
        ));
    }

    tracing::debug!(
        function = %descriptor.function,
        keys = occupied,
        arena_used,
        "result materialized"
    );
    Ok(builder.finish())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::function::AggregateFunction;

    #[test]
    fn test_materialize_table() {
        let ctx = DeviceContext::new(0).unwrap();
        let stream = ctx.new_stream().unwrap();
        let table =
            DeviceHashTable::new(&ctx, AggregateFunction::Count.descriptor(), 16, 128).unwrap();
        table.reset(&stream).unwrap();
        stream.synchronize().unwrap();

        let view = table.view();
        for key in ["a", "b", "a", "", "ccc", "a"] {
            unsafe { view.upsert(key.as_bytes(), b"v").unwrap() };
        }

        let result = materialize(&ctx, &stream, &table).unwrap();
        assert_eq!(result.len(), 4);
        assert_eq!(result.get(b"a"), Some(3));
        assert_eq!(result.get(b"b"), Some(1));
        assert_eq!(result.get(b""), Some(1));
        assert_eq!(result.get(b"ccc"), Some(1));
    }

    #[test]
    fn test_materialize_empty_table() {
        let ctx = DeviceContext::new(0).unwrap();
        let stream = ctx.new_stream().unwrap();
        let table =
            DeviceHashTable::new(&ctx, AggregateFunction::UniqHll12.descriptor(), 4, 16).unwrap();
        table.reset(&stream).unwrap();
        stream.synchronize().unwrap();

        let result = materialize(&ctx, &stream, &table).unwrap();
        assert!(result.is_empty());
        assert_eq!(result.function(), AggregateFunction::UniqHll12);
    }
}
