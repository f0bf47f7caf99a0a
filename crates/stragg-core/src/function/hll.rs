//! `uniqHLL12`: HyperLogLog with 2^12 one-byte registers.
//!
//! Values are hashed with seeded xxh3. The top [`HLL_PRECISION`] bits of
//! the hash select a register; the rank is the number of leading zeros in
//! the remaining bits plus one. Registers only ever grow, so concurrent
//! device updates use an atomic max per register.

use std::sync::atomic::Ordering;

use stragg_device::DevicePtr;

use super::{AggregateDescriptor, AggregateFunction};
use crate::hash::value_hash;

/// Register-index bits.
pub const HLL_PRECISION: u32 = 12;

/// Number of registers (and bytes of state).
pub const HLL_REGISTERS: usize = 1 << HLL_PRECISION;

const MAX_RANK: u32 = 64 - HLL_PRECISION + 1;

pub(crate) static UNIQ_HLL12: AggregateDescriptor = AggregateDescriptor {
    function: AggregateFunction::UniqHll12,
    state_size: HLL_REGISTERS,
    state_align: 1,
    init,
    update,
    update_host,
    merge,
    finalize,
    destroy: None,
};

/// Register index and rank for a hashed value.
#[inline]
fn register_for(hash: u64) -> (usize, u8) {
    let index = (hash >> (64 - HLL_PRECISION)) as usize;
    let rest = hash << HLL_PRECISION;
    let rank = (rest.leading_zeros() + 1).min(MAX_RANK);
    (index, rank as u8)
}

fn init(state: &mut [u8]) {
    state[..HLL_REGISTERS].fill(0);
}

/// # Safety
///
/// `state` addresses a live register array of [`HLL_REGISTERS`] bytes.
unsafe fn update(state: DevicePtr, value: &[u8]) {
    let (index, rank) = register_for(value_hash(value));
    state.byte_add(index).atomic_u8().fetch_max(rank, Ordering::Relaxed);
}

fn update_host(state: &mut [u8], value: &[u8]) {
    let (index, rank) = register_for(value_hash(value));
    if state[index] < rank {
        state[index] = rank;
    }
}

fn merge(dst: &mut [u8], src: &[u8]) {
    for (d, s) in dst[..HLL_REGISTERS].iter_mut().zip(&src[..HLL_REGISTERS]) {
        *d = (*d).max(*s);
    }
}

#[allow(clippy::cast_precision_loss, clippy::cast_sign_loss)]
fn finalize(state: &[u8]) -> u64 {
    let registers = &state[..HLL_REGISTERS];
    let m = HLL_REGISTERS as f64;
    let alpha = 0.7213 / (1.0 + 1.079 / m);

    let mut harmonic = 0.0f64;
    let mut zeros = 0usize;
    for &r in registers {
        harmonic += 2f64.powi(-i32::from(r));
        if r == 0 {
            zeros += 1;
        }
    }

    let mut estimate = alpha * m * m / harmonic;
    if estimate <= 2.5 * m {
        if zeros != 0 {
            // Linear counting.
            estimate = m * (m / zeros as f64).ln();
        }
    } else {
        let two_64 = 2f64.powi(64);
        if estimate > two_64 / 30.0 {
            estimate = -two_64 * (1.0 - estimate / two_64).ln();
        }
    }

    estimate.max(0.0).round() as u64
}
