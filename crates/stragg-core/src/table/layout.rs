//! Byte layout of table slots and the control block.
//!
//! ```text
//! slot:    | flag u32 | key_len u32 | key_offset u64 | pad | state ... | pad |
//!          0          4             8                16    state_offset      stride
//!
//! control: | error u32 | pad | arena_cursor u64 | occupied u64 | compact_cursor u64 |
//!          0                 8                  16             24                   32
//! ```

/// Slot never claimed.
pub const SLOT_EMPTY: u32 = 0;
/// Slot claimed by a device thread that is still publishing its key.
pub const SLOT_RESERVED: u32 = 1;
/// Slot holds a published key and an initialized state.
pub const SLOT_OCCUPIED: u32 = 2;
/// Slot whose claimer failed to reserve arena space. Never becomes occupied.
pub const SLOT_POISONED: u32 = 3;

/// Offset of the occupancy flag in a slot.
pub const FLAG_OFFSET: usize = 0;
/// Offset of the key length in a slot.
pub const KEY_LEN_OFFSET: usize = 4;
/// Offset of the arena offset of the key in a slot.
pub const KEY_OFFSET_OFFSET: usize = 8;
/// Size of the slot header.
pub const SLOT_HEADER: usize = 16;

/// Offset of the sticky error word in the control block.
pub const CONTROL_ERROR: usize = 0;
/// Offset of the arena bump cursor in the control block.
pub const CONTROL_ARENA_CURSOR: usize = 8;
/// Offset of the published-slot counter in the control block.
pub const CONTROL_OCCUPIED: usize = 16;
/// Offset of the materializer output cursor in the control block.
pub const CONTROL_COMPACT_CURSOR: usize = 24;
/// Size of the control block.
pub const CONTROL_SIZE: usize = 32;

/// Size and placement of the state blob inside a slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlotLayout {
    /// Offset of the state blob from the start of the slot.
    pub state_offset: usize,
    /// Size of the state blob.
    pub state_size: usize,
    /// Distance between consecutive slots.
    pub stride: usize,
}

impl SlotLayout {
    /// Layout for a state of `state_size` bytes aligned to `state_align`.
    #[must_use]
    pub fn new(state_size: usize, state_align: usize) -> Self {
        let state_offset = SLOT_HEADER.next_multiple_of(state_align);
        let stride = (state_offset + state_size).next_multiple_of(state_align.max(8));
        Self {
            state_offset,
            state_size,
            stride,
        }
    }

    /// Bytes needed for `capacity` slots, or `None` on overflow.
    #[must_use]
    pub fn table_bytes(&self, capacity: usize) -> Option<usize> {
        self.stride.checked_mul(capacity)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_count_layout() {
        let l = SlotLayout::new(8, 8);
        assert_eq!(l.state_offset, 16);
        assert_eq!(l.stride, 24);
    }

    #[test]
    fn test_hll_layout() {
        let l = SlotLayout::new(4096, 1);
        assert_eq!(l.state_offset, 16);
        assert_eq!(l.stride, 4112);
        assert_eq!(l.stride % 8, 0);
    }

    #[test]
    fn test_wide_alignment() {
        let l = SlotLayout::new(8, 32);
        assert_eq!(l.state_offset, 32);
        assert_eq!(l.stride, 64);
        assert_eq!(l.table_bytes(usize::MAX), None);
    }
}
