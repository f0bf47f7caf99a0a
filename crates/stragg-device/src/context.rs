//! Device selection and memory accounting.

use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crate::memory::{DeviceBuffer, PinnedBuffer};
use crate::stream::Stream;
use crate::{DeviceError, Result};

/// Default device memory budget (8 GiB).
pub const DEFAULT_DEVICE_MEMORY: usize = 8 << 30;

/// Static properties of an emulated device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceProperties {
    /// Human-readable device name.
    pub name: String,
    /// Device memory budget in bytes. Allocations beyond it fail.
    pub total_memory: usize,
    /// Number of devices visible to the process.
    pub device_count: usize,
}

impl Default for DeviceProperties {
    fn default() -> Self {
        Self {
            name: "stragg emulated device".to_string(),
            total_memory: DEFAULT_DEVICE_MEMORY,
            device_count: 1,
        }
    }
}

impl DeviceProperties {
    /// Sets the device memory budget.
    #[must_use]
    pub fn with_total_memory(mut self, bytes: usize) -> Self {
        self.total_memory = bytes;
        self
    }

    /// Sets the number of visible devices.
    #[must_use]
    pub fn with_device_count(mut self, count: usize) -> Self {
        self.device_count = count;
        self
    }
}

pub(crate) struct ContextInner {
    pub(crate) ordinal: usize,
    pub(crate) props: DeviceProperties,
    used: AtomicUsize,
    next_stream: AtomicUsize,
}

impl ContextInner {
    /// Charges `bytes` against the memory budget.
    pub(crate) fn reserve(&self, bytes: usize) -> Result<()> {
        let total = self.props.total_memory;
        let mut current = self.used.load(Ordering::Relaxed);
        loop {
            let next = match current.checked_add(bytes) {
                Some(next) if next <= total => next,
                _ => {
                    return Err(DeviceError::OutOfMemory {
                        requested: bytes,
                        available: total.saturating_sub(current),
                        total,
                    })
                }
            };
            match self.used.compare_exchange_weak(
                current,
                next,
                Ordering::AcqRel,
                Ordering::Relaxed,
            ) {
                Ok(_) => return Ok(()),
                Err(actual) => current = actual,
            }
        }
    }

    pub(crate) fn release(&self, bytes: usize) {
        self.used.fetch_sub(bytes, Ordering::AcqRel);
    }
}

/// Handle to one device. Cheap to clone.
///
/// All allocations and streams created from a context are charged to, and
/// keep alive, that context.
#[derive(Clone)]
pub struct DeviceContext {
    inner: Arc<ContextInner>,
}

impl DeviceContext {
    /// Opens device `ordinal` with default properties.
    ///
    /// # Errors
    ///
    /// Returns [`DeviceError::InvalidDevice`] if no such device exists.
    pub fn new(ordinal: usize) -> Result<Self> {
        Self::with_properties(ordinal, DeviceProperties::default())
    }

    /// Opens device `ordinal` with explicit properties.
    ///
    /// # Errors
    ///
    /// Returns [`DeviceError::InvalidDevice`] if `ordinal` is not below
    /// `props.device_count`.
    pub fn with_properties(ordinal: usize, props: DeviceProperties) -> Result<Self> {
        if ordinal >= props.device_count {
            return Err(DeviceError::InvalidDevice {
                ordinal,
                count: props.device_count,
            });
        }
        tracing::info!(
            ordinal,
            device = %props.name,
            total_memory = props.total_memory,
            backend = "emulated",
            "device context created"
        );
        Ok(Self {
            inner: Arc::new(ContextInner {
                ordinal,
                props,
                used: AtomicUsize::new(0),
                next_stream: AtomicUsize::new(0),
            }),
        })
    }

    /// Device ordinal.
    #[must_use]
    pub fn ordinal(&self) -> usize {
        self.inner.ordinal
    }

    /// Device properties.
    #[must_use]
    pub fn properties(&self) -> &DeviceProperties {
        &self.inner.props
    }

    /// Bytes of device memory currently allocated.
    #[must_use]
    pub fn memory_used(&self) -> usize {
        self.inner.used.load(Ordering::Acquire)
    }

    /// Bytes of device memory still available.
    #[must_use]
    pub fn memory_free(&self) -> usize {
        self.inner.props.total_memory.saturating_sub(self.memory_used())
    }

    /// Allocates `len` bytes of zero-filled device memory.
    ///
    /// # Errors
    ///
    /// Returns [`DeviceError::OutOfMemory`] if the budget would be exceeded,
    /// or [`DeviceError::HostAlloc`] if the backing allocation fails.
    pub fn alloc_zeros(&self, len: usize) -> Result<DeviceBuffer> {
        DeviceBuffer::zeroed(Arc::clone(&self.inner), len)
    }

    /// Allocates `len` bytes of page-locked host memory.
    ///
    /// # Errors
    ///
    /// Returns [`DeviceError::HostAlloc`] if the allocation fails.
    pub fn alloc_pinned(&self, len: usize) -> Result<PinnedBuffer> {
        PinnedBuffer::new(len)
    }

    /// Creates a new in-order stream.
    ///
    /// # Errors
    ///
    /// Returns [`DeviceError::StreamClosed`] if the stream worker cannot be
    /// started.
    pub fn new_stream(&self) -> Result<Stream> {
        let id = self.inner.next_stream.fetch_add(1, Ordering::Relaxed);
        Stream::spawn(Arc::clone(&self.inner), id)
    }
}

impl fmt::Debug for DeviceContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceContext")
            .field("backend", &"emulated")
            .field("ordinal", &self.inner.ordinal)
            .field("name", &self.inner.props.name)
            .field("memory_used", &self.memory_used())
            .field("total_memory", &self.inner.props.total_memory)
            .finish()
    }
}
