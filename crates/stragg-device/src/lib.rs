//! # stragg device runtime
//!
//! A small CUDA-shaped device runtime used by the stragg aggregation engine.
//!
//! This crate provides:
//! - Device contexts selected by ordinal, with a per-device memory budget
//! - Device allocations and raw device pointers with atomic accessors
//! - Page-locked (pinned) host staging buffers
//! - In-order asynchronous streams with events and sticky faults
//! - Grid kernel launches (`grid_dim` blocks of `block_dim` threads)
//!
//! The backend shipped here is emulated: device memory lives in host RAM,
//! every stream is a worker thread draining an in-order command queue, and
//! kernel grids execute on a work-stealing thread pool with one logical
//! device thread per grid index. Atomics on device memory are real hardware
//! atomics, so kernels written against [`DevicePtr`] have the same memory
//! model they would have on a GPU.
//!
//! ```
//! use std::sync::Arc;
//! use stragg_device::{DeviceContext, LaunchConfig};
//!
//! let ctx = DeviceContext::new(0).unwrap();
//! let stream = ctx.new_stream().unwrap();
//! let buf = Arc::new(ctx.alloc_zeros(64).unwrap());
//! stream.memset_zeros(&buf, 0..64).unwrap();
//! stream.synchronize().unwrap();
//! assert_eq!(buf.len(), 64);
//! let cfg = LaunchConfig::for_num_elems(1000, 256);
//! assert_eq!(cfg.grid_dim, 4);
//! ```

#![deny(missing_docs)]
#![warn(clippy::all, clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::uninlined_format_args)]
// Device pointers are plain addresses; casts between widths are intentional.
#![allow(clippy::cast_possible_truncation)]

pub mod context;
pub mod event;
pub mod launch;
pub mod memory;
pub mod stream;

pub use context::{DeviceContext, DeviceProperties};
pub use event::Event;
pub use launch::{Kernel, LaunchConfig, ThreadIdx};
pub use memory::{DeviceBuffer, DevicePtr, PinnedBuffer};
pub use stream::Stream;

/// Result type for device runtime operations.
pub type Result<T> = std::result::Result<T, DeviceError>;

/// Errors reported by the device runtime.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DeviceError {
    /// The requested device ordinal does not exist.
    #[error("invalid device ordinal {ordinal}: {count} device(s) available")]
    InvalidDevice {
        /// Requested ordinal.
        ordinal: usize,
        /// Number of devices present.
        count: usize,
    },

    /// A device allocation would exceed the device memory budget.
    #[error("out of device memory: requested {requested} bytes, {available} of {total} bytes free")]
    OutOfMemory {
        /// Bytes requested.
        requested: usize,
        /// Bytes still free on the device.
        available: usize,
        /// Total device memory.
        total: usize,
    },

    /// A host (pinned or backing) allocation failed.
    #[error("host allocation of {0} bytes failed")]
    HostAlloc(usize),

    /// A copy or memset touched memory outside a buffer.
    #[error("{op} out of bounds: offset {offset} + len {len} exceeds buffer of {size} bytes")]
    OutOfBounds {
        /// Operation name.
        op: &'static str,
        /// Start offset.
        offset: usize,
        /// Length of the access.
        len: usize,
        /// Size of the buffer.
        size: usize,
    },

    /// A launch configuration was rejected.
    #[error("invalid launch configuration: {0}")]
    InvalidLaunch(String),

    /// A kernel aborted while executing.
    #[error("kernel `{kernel}` faulted: {message}")]
    KernelFault {
        /// Kernel name.
        kernel: &'static str,
        /// Fault description.
        message: String,
    },

    /// The stream's worker is gone and can no longer accept work.
    #[error("stream {0} is closed")]
    StreamClosed(usize),
}
