//! `COUNT`: a 64-bit counter per key.

use std::sync::atomic::Ordering;

use stragg_device::DevicePtr;

use super::{read_u64, write_u64, AggregateDescriptor, AggregateFunction};

pub(crate) static COUNT: AggregateDescriptor = AggregateDescriptor {
    function: AggregateFunction::Count,
    state_size: 8,
    state_align: 8,
    init,
    update,
    update_host,
    merge,
    finalize,
    destroy: None,
};

fn init(state: &mut [u8]) {
    write_u64(state, 0);
}

/// # Safety
///
/// `state` addresses a live, 8-byte aligned counter.
unsafe fn update(state: DevicePtr, _value: &[u8]) {
    state.atomic_u64().fetch_add(1, Ordering::Relaxed);
}

fn update_host(state: &mut [u8], _value: &[u8]) {
    write_u64(state, read_u64(state).wrapping_add(1));
}

fn merge(dst: &mut [u8], src: &[u8]) {
    write_u64(dst, read_u64(dst).wrapping_add(read_u64(src)));
}

fn finalize(state: &[u8]) -> u64 {
    read_u64(state)
}
