//! Open-addressed device hash table keyed by byte strings.
//!
//! The table is three device allocations:
//! - `slots`: `capacity` fixed-stride slots (see [`layout`])
//! - `arena`: a bump-allocated byte region holding every inserted key
//! - `control`: the sticky error word, the arena cursor and counters,
//!   polled by the host without synchronizing
//!
//! Device threads insert with [`TableView::upsert`]:
//!
//! 1. hash the key and start at `hash & (capacity - 1)`
//! 2. CAS the slot flag EMPTY → RESERVED; the winner reserves `key_len`
//!    arena bytes with a fetch-add, copies the key, writes the header and
//!    the initial state, then stores OCCUPIED with release ordering
//! 3. a thread that loses the CAS waits for OCCUPIED (acquire), compares
//!    length then bytes, and either updates the state or probes forward
//! 4. after `capacity` probes, or if the arena would overflow, the thread
//!    raises a [`DeviceFault`] in the control block and gives up

pub mod layout;

use std::hint;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use stragg_device::{DeviceBuffer, DeviceContext, DevicePtr, Stream};

use crate::error_codes::DeviceFault;
use crate::function::{AggregateDescriptor, DeviceUpdateFn};
use crate::hash::key_hash;
use layout::{
    SlotLayout, CONTROL_ARENA_CURSOR, CONTROL_ERROR, CONTROL_OCCUPIED, CONTROL_SIZE, FLAG_OFFSET,
    KEY_LEN_OFFSET, KEY_OFFSET_OFFSET, SLOT_EMPTY, SLOT_OCCUPIED, SLOT_POISONED, SLOT_RESERVED,
};

/// Spins before a waiting thread starts yielding its OS thread.
const SPIN_LIMIT: u32 = 10;

/// Device hash table, its key arena and control block.
pub struct DeviceHashTable {
    descriptor: &'static AggregateDescriptor,
    layout: SlotLayout,
    capacity: usize,
    arena_capacity: usize,
    slots: Arc<DeviceBuffer>,
    arena: Arc<DeviceBuffer>,
    control: Arc<DeviceBuffer>,
}

impl DeviceHashTable {
    /// Allocates a table of `capacity` slots (a power of two) and an arena
    /// of `arena_capacity` bytes.
    ///
    /// # Errors
    ///
    /// Returns the device error of the first allocation that fails.
    ///
    /// # Panics
    ///
    /// Panics if `capacity` is not a power of two.
    pub fn new(
        ctx: &DeviceContext,
        descriptor: &'static AggregateDescriptor,
        capacity: usize,
        arena_capacity: usize,
    ) -> stragg_device::Result<Self> {
        assert!(capacity.is_power_of_two(), "table capacity must be a power of two");
        let layout = SlotLayout::new(descriptor.state_size, descriptor.state_align);
        let table_bytes = layout.table_bytes(capacity).unwrap_or(usize::MAX);
        let slots = Arc::new(ctx.alloc_zeros(table_bytes)?);
        let arena = Arc::new(ctx.alloc_zeros(arena_capacity)?);
        let control = Arc::new(ctx.alloc_zeros(CONTROL_SIZE)?);
        tracing::debug!(
            function = descriptor.function.name(),
            capacity,
            arena_capacity,
            slot_stride = layout.stride,
            table_bytes,
            "device hash table allocated"
        );
        Ok(Self {
            descriptor,
            layout,
            capacity,
            arena_capacity,
            slots,
            arena,
            control,
        })
    }

    /// Enqueues zeroing of every slot, the arena and the control block.
    ///
    /// # Errors
    ///
    /// Returns the device error if the stream rejects the commands.
    pub fn reset(&self, stream: &Stream) -> stragg_device::Result<()> {
        stream.memset_zeros(&self.slots, 0..self.slots.len())?;
        stream.memset_zeros(&self.arena, 0..self.arena.len())?;
        stream.memset_zeros(&self.control, 0..CONTROL_SIZE)
    }

    /// Kernel-side handle to the table.
    #[must_use]
    pub fn view(&self) -> TableView {
        TableView {
            slots: self.slots.device_ptr(),
            arena: self.arena.device_ptr(),
            control: self.control.device_ptr(),
            mask: self.capacity as u64 - 1,
            capacity: self.capacity as u64,
            arena_capacity: self.arena_capacity as u64,
            layout: self.layout,
            init: self.descriptor.init,
            update: self.descriptor.update,
        }
    }

    /// The sticky device fault, read without synchronizing.
    ///
    /// # Errors
    ///
    /// Returns the device error if the control word cannot be read.
    pub fn fault(&self) -> stragg_device::Result<Option<DeviceFault>> {
        let word = self.control.load_u32_mapped(CONTROL_ERROR)?;
        Ok(DeviceFault::from_code(word))
    }

    /// Number of published keys, read without synchronizing.
    ///
    /// # Errors
    ///
    /// Returns the device error if the control word cannot be read.
    pub fn occupied(&self) -> stragg_device::Result<u64> {
        self.control.load_u64_mapped(CONTROL_OCCUPIED)
    }

    /// Arena bytes in use, read without synchronizing.
    ///
    /// # Errors
    ///
    /// Returns the device error if the control word cannot be read.
    pub fn arena_used(&self) -> stragg_device::Result<u64> {
        let cursor = self.control.load_u64_mapped(CONTROL_ARENA_CURSOR)?;
        Ok(cursor.min(self.arena_capacity as u64))
    }

    /// Slot count.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Arena size in bytes.
    #[must_use]
    pub fn arena_capacity(&self) -> usize {
        self.arena_capacity
    }

    /// Function whose states the slots hold.
    #[must_use]
    pub fn descriptor(&self) -> &'static AggregateDescriptor {
        self.descriptor
    }

    pub(crate) fn layout(&self) -> SlotLayout {
        self.layout
    }

    pub(crate) fn arena(&self) -> &Arc<DeviceBuffer> {
        &self.arena
    }

    pub(crate) fn control(&self) -> &Arc<DeviceBuffer> {
        &self.control
    }
}

impl std::fmt::Debug for DeviceHashTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceHashTable")
            .field("function", &self.descriptor.function)
            .field("capacity", &self.capacity)
            .field("arena_capacity", &self.arena_capacity)
            .field("layout", &self.layout)
            .finish_non_exhaustive()
    }
}

/// A published slot, as seen by a kernel.
#[derive(Debug, Clone, Copy)]
pub struct SlotEntry {
    /// Key length in bytes.
    pub key_len: u32,
    /// Offset of the key in the arena.
    pub key_offset: u64,
    /// Address of the state blob.
    pub state: DevicePtr,
}

/// Device pointers and parameters captured by kernels. Valid while the
/// owning [`DeviceHashTable`] is alive.
#[derive(Clone, Copy)]
pub struct TableView {
    slots: DevicePtr,
    arena: DevicePtr,
    control: DevicePtr,
    mask: u64,
    capacity: u64,
    arena_capacity: u64,
    layout: SlotLayout,
    init: fn(&mut [u8]),
    update: DeviceUpdateFn,
}

impl TableView {
    /// Inserts `key` if absent, then folds `value` into its state.
    ///
    /// # Errors
    ///
    /// Returns the fault that stopped the insert. The fault is also raised
    /// in the control block unless another thread raised one first.
    ///
    /// # Safety
    ///
    /// Must run on the device while the table is alive, after it has been
    /// reset and before it is read back.
    pub unsafe fn upsert(&self, key: &[u8], value: &[u8]) -> Result<(), DeviceFault> {
        let mut slot = key_hash(key) & self.mask;
        for _ in 0..self.capacity {
            let base = self.slot_ptr(slot);
            let flag = base.byte_add(FLAG_OFFSET).atomic_u32();
            if flag
                .compare_exchange(SLOT_EMPTY, SLOT_RESERVED, Ordering::Acquire, Ordering::Acquire)
                .is_ok()
            {
                return self.claim(base, flag, key, value);
            }
            self.wait_published(flag)?;
            if self.key_matches(base, key) {
                (self.update)(base.byte_add(self.layout.state_offset), value);
                return Ok(());
            }
            slot = (slot + 1) & self.mask;
        }
        Err(self.raise(DeviceFault::TableFull))
    }

    /// Reads slot `slot` if it is published.
    ///
    /// # Safety
    ///
    /// Same contract as [`TableView::upsert`]; `slot` below capacity.
    #[must_use]
    pub unsafe fn entry(&self, slot: u64) -> Option<SlotEntry> {
        let base = self.slot_ptr(slot);
        if base.byte_add(FLAG_OFFSET).atomic_u32().load(Ordering::Acquire) != SLOT_OCCUPIED {
            return None;
        }
        Some(SlotEntry {
            key_len: base.byte_add(KEY_LEN_OFFSET).atomic_u32().load(Ordering::Relaxed),
            key_offset: base.byte_add(KEY_OFFSET_OFFSET).read_u64(),
            state: base.byte_add(self.layout.state_offset),
        })
    }

    /// Whether any device thread has raised a fault.
    ///
    /// # Safety
    ///
    /// The table must be alive.
    #[must_use]
    pub unsafe fn faulted(&self) -> bool {
        self.error_word().load(Ordering::Acquire) != 0
    }

    /// Slot count.
    #[must_use]
    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    /// Layout of the slots.
    #[must_use]
    pub fn layout(&self) -> SlotLayout {
        self.layout
    }

    unsafe fn claim(
        &self,
        base: DevicePtr,
        flag: &AtomicU32,
        key: &[u8],
        value: &[u8],
    ) -> Result<(), DeviceFault> {
        let key_len = key.len() as u64;
        let cursor = self.control.byte_add(CONTROL_ARENA_CURSOR).atomic_u64();
        let key_offset = cursor.fetch_add(key_len, Ordering::Relaxed);
        let fits = key_offset
            .checked_add(key_len)
            .is_some_and(|end| end <= self.arena_capacity);
        if !fits {
            let fault = self.raise(DeviceFault::ArenaFull);
            flag.store(SLOT_POISONED, Ordering::Release);
            return Err(fault);
        }

        self.arena.byte_add(key_offset as usize).copy_from(key);
        base.byte_add(KEY_LEN_OFFSET)
            .atomic_u32()
            .store(key.len() as u32, Ordering::Relaxed);
        base.byte_add(KEY_OFFSET_OFFSET).write_u64(key_offset);
        let state = base.byte_add(self.layout.state_offset);
        (self.init)(state.as_mut_slice(self.layout.state_size));
        self.control
            .byte_add(CONTROL_OCCUPIED)
            .atomic_u64()
            .fetch_add(1, Ordering::Relaxed);
        flag.store(SLOT_OCCUPIED, Ordering::Release);

        (self.update)(state, value);
        Ok(())
    }

    /// Waits while the slot is RESERVED. Gives up if the slot is poisoned or
    /// any fault has been raised, since its claimer may never publish.
    unsafe fn wait_published(&self, flag: &AtomicU32) -> Result<(), DeviceFault> {
        let mut spins = 0u32;
        loop {
            match flag.load(Ordering::Acquire) {
                SLOT_OCCUPIED => return Ok(()),
                SLOT_RESERVED => {}
                _ => return Err(self.current_fault()),
            }
            if self.faulted() {
                return Err(self.current_fault());
            }
            if spins < SPIN_LIMIT {
                for _ in 0..(1u32 << spins) {
                    hint::spin_loop();
                }
                spins += 1;
            } else {
                std::thread::yield_now();
            }
        }
    }

    unsafe fn key_matches(&self, base: DevicePtr, key: &[u8]) -> bool {
        let len = base.byte_add(KEY_LEN_OFFSET).atomic_u32().load(Ordering::Relaxed);
        if len as usize != key.len() {
            return false;
        }
        let offset = base.byte_add(KEY_OFFSET_OFFSET).read_u64();
        self.arena.byte_add(offset as usize).as_slice(key.len()) == key
    }

    /// Raises `fault` unless a fault is already set; returns the winner.
    unsafe fn raise(&self, fault: DeviceFault) -> DeviceFault {
        match self.error_word().compare_exchange(
            0,
            fault.code(),
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            Ok(_) => fault,
            Err(existing) => DeviceFault::from_code(existing).unwrap_or(fault),
        }
    }

    unsafe fn current_fault(&self) -> DeviceFault {
        DeviceFault::from_code(self.error_word().load(Ordering::Acquire))
            .unwrap_or(DeviceFault::ArenaFull)
    }

    unsafe fn error_word(&self) -> &AtomicU32 {
        self.control.byte_add(CONTROL_ERROR).atomic_u32()
    }

    fn slot_ptr(&self, slot: u64) -> DevicePtr {
        self.slots.byte_add(slot as usize * self.layout.stride)
    }
}
