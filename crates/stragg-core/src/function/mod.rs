//! Aggregate function registry.
//!
//! Functions form a closed set ([`AggregateFunction`]). Each has a static
//! [`AggregateDescriptor`] describing its state blob and the operations on
//! it. The device updater is race-safe: many device threads may apply it to
//! the same state concurrently.

mod count;
mod hll;

pub use hll::{HLL_PRECISION, HLL_REGISTERS};

use stragg_device::DevicePtr;

use crate::error::{Error, Result};

/// Device-side updater. Folds one value into the state at the pointer.
///
/// # Safety
///
/// The pointer must address a live, initialized state blob of the
/// descriptor's size and alignment.
pub type DeviceUpdateFn = unsafe fn(state: DevicePtr, value: &[u8]);

/// Operations and layout of one aggregate function's state.
///
/// Host-side operations read and write state blobs as native-endian bytes
/// and make no alignment assumptions.
pub struct AggregateDescriptor {
    /// Function this descriptor belongs to.
    pub function: AggregateFunction,
    /// Size of the state blob in bytes.
    pub state_size: usize,
    /// Required alignment of the state blob on the device.
    pub state_align: usize,
    /// Writes the empty state.
    pub init: fn(state: &mut [u8]),
    /// Device updater, safe under concurrent invocation on one state.
    pub update: DeviceUpdateFn,
    /// Host updater for exclusively owned states.
    pub update_host: fn(state: &mut [u8], value: &[u8]),
    /// Folds `src` into `dst`.
    pub merge: fn(dst: &mut [u8], src: &[u8]),
    /// Externally visible value of a state.
    pub finalize: fn(state: &[u8]) -> u64,
    /// Releases resources held by a state, if the function has any.
    pub destroy: Option<fn(state: &mut [u8])>,
}

impl std::fmt::Debug for AggregateDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AggregateDescriptor")
            .field("function", &self.function)
            .field("state_size", &self.state_size)
            .field("state_align", &self.state_align)
            .field("has_destroy", &self.destroy.is_some())
            .finish_non_exhaustive()
    }
}

/// The supported aggregate functions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AggregateFunction {
    /// Exact number of values per key.
    Count,
    /// Approximate number of distinct values per key (HyperLogLog, p = 12).
    UniqHll12,
}

impl AggregateFunction {
    /// Every registered function.
    pub const ALL: [Self; 2] = [Self::Count, Self::UniqHll12];

    /// Resolves a registry name. Names are case-sensitive.
    ///
    /// # Errors
    ///
    /// Returns [`Error::UnknownFunction`] for unregistered names.
    pub fn lookup(name: &str) -> Result<Self> {
        Self::ALL
            .into_iter()
            .find(|f| f.name() == name)
            .ok_or_else(|| Error::UnknownFunction(name.to_string()))
    }

    /// Registry name.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Count => "COUNT",
            Self::UniqHll12 => "uniqHLL12",
        }
    }

    /// Static descriptor of this function.
    #[must_use]
    pub fn descriptor(self) -> &'static AggregateDescriptor {
        match self {
            Self::Count => &count::COUNT,
            Self::UniqHll12 => &hll::UNIQ_HLL12,
        }
    }
}

impl std::fmt::Display for AggregateFunction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Resolves `name` straight to its descriptor.
///
/// # Errors
///
/// Returns [`Error::UnknownFunction`] for unregistered names.
pub fn lookup(name: &str) -> Result<&'static AggregateDescriptor> {
    AggregateFunction::lookup(name).map(AggregateFunction::descriptor)
}

/// Names of every registered function.
#[must_use]
pub fn names() -> [&'static str; 2] {
    AggregateFunction::ALL.map(AggregateFunction::name)
}

fn read_u64(bytes: &[u8]) -> u64 {
    let mut word = [0u8; 8];
    word.copy_from_slice(&bytes[..8]);
    u64::from_ne_bytes(word)
}

fn write_u64(bytes: &mut [u8], value: u64) {
    bytes[..8].copy_from_slice(&value.to_ne_bytes());
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    #[test]
    fn test_lookup_known_names() {
        assert_eq!(AggregateFunction::lookup("COUNT").unwrap(), AggregateFunction::Count);
        assert_eq!(
            AggregateFunction::lookup("uniqHLL12").unwrap(),
            AggregateFunction::UniqHll12
        );
        assert_eq!(names(), ["COUNT", "uniqHLL12"]);
    }

    #[test]
    fn test_lookup_is_exact() {
        for name in ["count", "UNIQHLL12", "SUM", ""] {
            let err = lookup(name).unwrap_err();
            assert_eq!(err.kind(), ErrorKind::UnknownFunction, "{name}");
        }
    }

    #[test]
    fn test_descriptors_match_their_function() {
        for f in AggregateFunction::ALL {
            let d = f.descriptor();
            assert_eq!(d.function, f);
            assert!(d.state_size > 0);
            assert!(d.state_align.is_power_of_two());
            assert!(d.destroy.is_none());
        }
    }

    #[test]
    fn test_host_fold_merge_finalize() {
        for f in AggregateFunction::ALL {
            let d = f.descriptor();
            let mut a = vec![0xAAu8; d.state_size];
            let mut b = vec![0x55u8; d.state_size];
            (d.init)(&mut a);
            (d.init)(&mut b);
            assert_eq!((d.finalize)(&a), 0, "{f}");

            (d.update_host)(&mut a, b"v");
            (d.update_host)(&mut b, b"v");
            (d.merge)(&mut a, &b);
            let expected = match f {
                AggregateFunction::Count => 2,
                AggregateFunction::UniqHll12 => 1,
            };
            assert_eq!((d.finalize)(&a), expected, "{f}");
        }
    }
}
