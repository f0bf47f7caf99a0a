//! Structured error code registry.
//!
//! Every error carries a stable `SAG-NNNN` code that is:
//! - Present in the error message (grep-able in logs)
//! - Present in the source code (grep-able in code)
//! - Stable across versions (codes are never reused)
//!
//! # Code Ranges
//!
//! | Range | Category |
//! |-------|----------|
//! | `SAG-0xxx` | Configuration / lifecycle |
//! | `SAG-1xxx` | Device runtime |
//! | `SAG-2xxx` | Input batches |
//! | `SAG-3xxx` | Device capacity |
//! | `SAG-8xxx` | Internal / should-not-happen |

// ── Configuration / Lifecycle (SAG-0xxx) ──

/// Invalid configuration value.
pub const INVALID_CONFIG: &str = "SAG-0001";
/// Aggregate function name not in the registry.
pub const UNKNOWN_FUNCTION: &str = "SAG-0002";
/// Operation not permitted in the current aggregator state.
pub const STATE_MISUSE: &str = "SAG-0003";

// ── Device Runtime (SAG-1xxx) ──

/// Device selection or context creation failed.
pub const DEVICE_INIT: &str = "SAG-1001";
/// A device allocation failed.
pub const OUT_OF_DEVICE_MEMORY: &str = "SAG-1002";
/// A device command or kernel failed.
pub const DEVICE_KERNEL_FAULT: &str = "SAG-1003";

// ── Input Batches (SAG-2xxx) ──

/// Batch exceeds `batch_max_records` or `batch_max_bytes`.
pub const BATCH_TOO_LARGE: &str = "SAG-2001";
/// Batch offsets or terminators are inconsistent.
pub const MALFORMED_BATCH: &str = "SAG-2002";

// ── Device Capacity (SAG-3xxx) ──

/// Probe sequence exhausted every slot of the hash table.
pub const TABLE_CAPACITY_EXCEEDED: &str = "SAG-3001";
/// Key arena cursor would pass the arena capacity.
pub const ARENA_CAPACITY_EXCEEDED: &str = "SAG-3002";

// ── Internal (SAG-8xxx) ──

/// Internal invariant violated.
pub const INTERNAL: &str = "SAG-8001";

/// Fault code written by device threads into the table's error word.
///
/// The word is sticky: the first fault wins and later faults are dropped.
/// Zero means no fault, so every variant is non-zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum DeviceFault {
    /// Probe sequence visited every slot without placing the key.
    TableFull = 0x0001,
    /// Arena reservation would pass the arena capacity.
    ArenaFull = 0x0002,
}

impl DeviceFault {
    /// Returns a static error message. No allocation.
    #[must_use]
    pub const fn message(self) -> &'static str {
        match self {
            Self::TableFull => "Hash table probe sequence exhausted",
            Self::ArenaFull => "Key arena capacity exceeded",
        }
    }

    /// Raw value stored in the device error word.
    #[must_use]
    pub const fn code(self) -> u32 {
        self as u32
    }

    /// Decodes a device error word. Returns `None` for zero and for unknown
    /// values.
    #[must_use]
    pub const fn from_code(code: u32) -> Option<Self> {
        match code {
            0x0001 => Some(Self::TableFull),
            0x0002 => Some(Self::ArenaFull),
            _ => None,
        }
    }

    /// Returns the `SAG-NNNN` error code string for this fault.
    #[must_use]
    pub const fn sag_code(self) -> &'static str {
        match self {
            Self::TableFull => TABLE_CAPACITY_EXCEEDED,
            Self::ArenaFull => ARENA_CAPACITY_EXCEEDED,
        }
    }
}

impl std::fmt::Display for DeviceFault {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}] {}", self.sag_code(), self.message())
    }
}

impl std::error::Error for DeviceFault {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn device_fault_is_copy_and_word_sized() {
        let f = DeviceFault::TableFull;
        let f2 = f;
        assert_eq!(f, f2);
        assert_eq!(std::mem::size_of::<DeviceFault>(), 4);
    }

    #[test]
    fn device_fault_codes_round_trip() {
        for f in [DeviceFault::TableFull, DeviceFault::ArenaFull] {
            assert!(f.code() > 0, "{f:?} has zero code");
            assert_eq!(DeviceFault::from_code(f.code()), Some(f));
            assert!(f.sag_code().starts_with("SAG-3"));
        }
        assert_eq!(DeviceFault::from_code(0), None);
        assert_eq!(DeviceFault::from_code(0xdead), None);
    }

    #[test]
    fn device_fault_display() {
        let s = DeviceFault::ArenaFull.to_string();
        assert!(s.starts_with("[SAG-3002]"));
        assert!(s.contains("arena"));
    }

    #[test]
    fn error_codes_are_stable_strings() {
        assert_eq!(INVALID_CONFIG, "SAG-0001");
        assert_eq!(DEVICE_INIT, "SAG-1001");
        assert_eq!(BATCH_TOO_LARGE, "SAG-2001");
        assert_eq!(TABLE_CAPACITY_EXCEEDED, "SAG-3001");
        assert_eq!(INTERNAL, "SAG-8001");
    }
}
