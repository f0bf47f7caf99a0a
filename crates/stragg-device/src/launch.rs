//! Kernel launch geometry and grid execution.

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};

use rayon::prelude::*;

use crate::{DeviceError, Result};

/// Largest block the device accepts.
pub const MAX_THREADS_PER_BLOCK: u32 = 1024;

/// Grid geometry of a launch: `grid_dim` blocks of `block_dim` threads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LaunchConfig {
    /// Number of blocks.
    pub grid_dim: u32,
    /// Threads per block.
    pub block_dim: u32,
}

impl LaunchConfig {
    /// Smallest grid of `block_dim`-sized blocks covering `n` threads.
    ///
    /// The last block may overshoot `n`; kernels bound-check their index.
    #[must_use]
    pub fn for_num_elems(n: u32, block_dim: u32) -> Self {
        let block_dim = block_dim.clamp(1, MAX_THREADS_PER_BLOCK);
        Self {
            grid_dim: n.div_ceil(block_dim),
            block_dim,
        }
    }

    /// Total number of device threads.
    #[must_use]
    pub fn num_threads(&self) -> u64 {
        u64::from(self.grid_dim) * u64::from(self.block_dim)
    }

    pub(crate) fn validate(&self) -> Result<()> {
        if self.grid_dim == 0 {
            return Err(DeviceError::InvalidLaunch("grid_dim must be positive".into()));
        }
        if self.block_dim == 0 || self.block_dim > MAX_THREADS_PER_BLOCK {
            return Err(DeviceError::InvalidLaunch(format!(
                "block_dim {} outside 1..={}",
                self.block_dim, MAX_THREADS_PER_BLOCK
            )));
        }
        Ok(())
    }
}

/// Position of one device thread in its grid.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ThreadIdx {
    /// Block index.
    pub block_idx: u32,
    /// Thread index within the block.
    pub thread_idx: u32,
    /// Threads per block.
    pub block_dim: u32,
}

impl ThreadIdx {
    /// Flat index across the whole grid.
    #[must_use]
    pub fn global(self) -> usize {
        self.block_idx as usize * self.block_dim as usize + self.thread_idx as usize
    }
}

/// Device code. `run` is invoked once per thread of the launch grid, from
/// many host threads at once.
pub trait Kernel: Send + Sync {
    /// Kernel name, used in fault reports and logs.
    fn name(&self) -> &'static str;

    /// Body of one device thread.
    fn run(&self, idx: ThreadIdx);
}

/// Runs every block of the grid in parallel. A panicking thread faults the
/// launch.
pub(crate) fn execute(cfg: LaunchConfig, kernel: &dyn Kernel) -> Result<()> {
    let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
        (0..cfg.grid_dim).into_par_iter().for_each(|block_idx| {
            for thread_idx in 0..cfg.block_dim {
                kernel.run(ThreadIdx {
                    block_idx,
                    thread_idx,
                    block_dim: cfg.block_dim,
                });
            }
        });
    }));
    outcome.map_err(|payload| DeviceError::KernelFault {
        kernel: kernel.name(),
        message: panic_message(payload.as_ref()),
    })
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "kernel panicked".to_string()
    }
}
