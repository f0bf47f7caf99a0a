//! Device allocations, pinned host buffers and raw device pointers.
//!
//! A [`DeviceBuffer`] is only ever written by stream commands and kernels.
//! Host code reads it back through [`crate::Stream::memcpy_dtoh`], or through
//! the `load_*_mapped` accessors for small control words that live in
//! host-mapped memory and may be polled while kernels are running.

use std::alloc::{self, Layout};
use std::fmt;
use std::ptr::{self, NonNull};
use std::sync::atomic::{AtomicU32, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;

use crate::context::ContextInner;
use crate::{DeviceError, Result};

/// Alignment of every device allocation.
pub const DEVICE_ALIGN: usize = 256;

/// Alignment of pinned host buffers.
pub const PINNED_ALIGN: usize = 4096;

struct RawAlloc {
    ptr: NonNull<u8>,
    layout: Layout,
    len: usize,
}

impl RawAlloc {
    fn zeroed(len: usize, align: usize) -> Result<Self> {
        let layout =
            Layout::from_size_align(len.max(1), align).map_err(|_| DeviceError::HostAlloc(len))?;
        // SAFETY: layout has a non-zero size.
        let raw = unsafe { alloc::alloc_zeroed(layout) };
        let ptr = NonNull::new(raw).ok_or(DeviceError::HostAlloc(len))?;
        Ok(Self { ptr, layout, len })
    }
}

impl Drop for RawAlloc {
    fn drop(&mut self) {
        // SAFETY: ptr was returned by alloc_zeroed with this layout.
        unsafe { alloc::dealloc(self.ptr.as_ptr(), self.layout) };
    }
}

fn check_range(op: &'static str, offset: usize, len: usize, size: usize) -> Result<()> {
    match offset.checked_add(len) {
        Some(end) if end <= size => Ok(()),
        _ => Err(DeviceError::OutOfBounds {
            op,
            offset,
            len,
            size,
        }),
    }
}

/// A device memory allocation.
///
/// Freed, and returned to the device budget, on drop.
pub struct DeviceBuffer {
    raw: RawAlloc,
    ctx: Arc<ContextInner>,
}

// SAFETY: the buffer owns its allocation; all shared access goes through
// raw device pointers whose users uphold the device memory model.
unsafe impl Send for DeviceBuffer {}
// SAFETY: see above.
unsafe impl Sync for DeviceBuffer {}

impl DeviceBuffer {
    pub(crate) fn zeroed(ctx: Arc<ContextInner>, len: usize) -> Result<Self> {
        ctx.reserve(len)?;
        match RawAlloc::zeroed(len, DEVICE_ALIGN) {
            Ok(raw) => Ok(Self { raw, ctx }),
            Err(e) => {
                ctx.release(len);
                Err(e)
            }
        }
    }

    /// Size in bytes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.raw.len
    }

    /// Whether the allocation is zero-sized.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.raw.len == 0
    }

    /// Device address of the first byte.
    #[must_use]
    pub fn device_ptr(&self) -> DevicePtr {
        DevicePtr(self.raw.ptr.as_ptr())
    }

    pub(crate) fn check_range(&self, op: &'static str, offset: usize, len: usize) -> Result<()> {
        check_range(op, offset, len, self.raw.len)
    }

    /// Copies device bytes into `dst`. Callers must have synchronized with
    /// every stream that writes the range.
    pub(crate) fn read_into(&self, offset: usize, dst: &mut [u8]) -> Result<()> {
        self.check_range("memcpy_dtoh", offset, dst.len())?;
        // SAFETY: range checked above; no device writer is in flight.
        unsafe {
            ptr::copy_nonoverlapping(
                self.raw.ptr.as_ptr().add(offset),
                dst.as_mut_ptr(),
                dst.len(),
            );
        }
        Ok(())
    }

    /// Reads a `u32` control word without synchronizing any stream.
    ///
    /// # Errors
    ///
    /// Returns [`DeviceError::OutOfBounds`] if the word is outside the buffer
    /// or not 4-byte aligned.
    pub fn load_u32_mapped(&self, offset: usize) -> Result<u32> {
        self.check_mapped("load_u32_mapped", offset, 4)?;
        // SAFETY: in bounds and aligned; accessed atomically by every writer.
        Ok(unsafe { self.device_ptr().byte_add(offset).atomic_u32() }.load(Ordering::Acquire))
    }

    /// Reads a `u64` control word without synchronizing any stream.
    ///
    /// # Errors
    ///
    /// Returns [`DeviceError::OutOfBounds`] if the word is outside the buffer
    /// or not 8-byte aligned.
    pub fn load_u64_mapped(&self, offset: usize) -> Result<u64> {
        self.check_mapped("load_u64_mapped", offset, 8)?;
        // SAFETY: in bounds and aligned; accessed atomically by every writer.
        Ok(unsafe { self.device_ptr().byte_add(offset).atomic_u64() }.load(Ordering::Acquire))
    }

    fn check_mapped(&self, op: &'static str, offset: usize, width: usize) -> Result<()> {
        self.check_range(op, offset, width)?;
        if offset % width != 0 {
            return Err(DeviceError::OutOfBounds {
                op,
                offset,
                len: width,
                size: self.raw.len,
            });
        }
        Ok(())
    }
}

impl Drop for DeviceBuffer {
    fn drop(&mut self) {
        self.ctx.release(self.raw.len);
    }
}

impl fmt::Debug for DeviceBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceBuffer")
            .field("device", &self.ctx.ordinal)
            .field("ptr", &self.raw.ptr)
            .field("len", &self.raw.len)
            .finish()
    }
}

/// Page-locked host memory used as the source of asynchronous copies.
pub struct PinnedBuffer {
    raw: RawAlloc,
}

// SAFETY: uniquely owned heap memory, like `Box<[u8]>`.
unsafe impl Send for PinnedBuffer {}
// SAFETY: shared access is read-only through `&self`.
unsafe impl Sync for PinnedBuffer {}

impl PinnedBuffer {
    pub(crate) fn new(len: usize) -> Result<Self> {
        Ok(Self {
            raw: RawAlloc::zeroed(len, PINNED_ALIGN)?,
        })
    }

    /// Size in bytes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.raw.len
    }

    /// Whether the buffer is zero-sized.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.raw.len == 0
    }

    /// Buffer contents.
    #[must_use]
    pub fn as_slice(&self) -> &[u8] {
        // SAFETY: allocation is initialized (zeroed) and `len` bytes long.
        unsafe { std::slice::from_raw_parts(self.raw.ptr.as_ptr(), self.raw.len) }
    }

    /// Mutable buffer contents.
    #[must_use]
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        // SAFETY: as above, and `&mut self` guarantees exclusivity.
        unsafe { std::slice::from_raw_parts_mut(self.raw.ptr.as_ptr(), self.raw.len) }
    }

    /// The buffer viewed as `u64` words (trailing bytes excluded).
    #[must_use]
    pub fn as_u64_mut_slice(&mut self) -> &mut [u64] {
        // SAFETY: PINNED_ALIGN is a multiple of 8 and every bit pattern is a
        // valid u64.
        unsafe {
            std::slice::from_raw_parts_mut(self.raw.ptr.as_ptr().cast::<u64>(), self.raw.len / 8)
        }
    }
}

impl fmt::Debug for PinnedBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PinnedBuffer")
            .field("ptr", &self.raw.ptr)
            .field("len", &self.raw.len)
            .finish()
    }
}

/// A raw address in device memory.
///
/// Kernels capture device pointers by value. Every dereferencing method is
/// `unsafe`: the caller guarantees the owning [`DeviceBuffer`] outlives the
/// access, the access is in bounds and suitably aligned, and concurrent
/// accesses to the same bytes are atomic or ordered by a release/acquire
/// pair.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct DevicePtr(*mut u8);

// SAFETY: a device pointer is an address; dereferencing is unsafe anyway.
unsafe impl Send for DevicePtr {}
// SAFETY: see above.
unsafe impl Sync for DevicePtr {}

impl DevicePtr {
    /// Numeric address.
    #[must_use]
    pub fn addr(self) -> usize {
        self.0 as usize
    }

    /// Pointer `offset` bytes further on.
    #[must_use]
    pub fn byte_add(self, offset: usize) -> Self {
        Self(self.0.wrapping_add(offset))
    }

    /// Views the pointee as an atomic `u8`.
    ///
    /// # Safety
    ///
    /// See the type-level contract.
    #[must_use]
    pub unsafe fn atomic_u8<'a>(self) -> &'a AtomicU8 {
        AtomicU8::from_ptr(self.0)
    }

    /// Views the pointee as an atomic `u32`.
    ///
    /// # Safety
    ///
    /// See the type-level contract; the address must be 4-byte aligned.
    #[must_use]
    pub unsafe fn atomic_u32<'a>(self) -> &'a AtomicU32 {
        AtomicU32::from_ptr(self.0.cast())
    }

    /// Views the pointee as an atomic `u64`.
    ///
    /// # Safety
    ///
    /// See the type-level contract; the address must be 8-byte aligned.
    #[must_use]
    pub unsafe fn atomic_u64<'a>(self) -> &'a AtomicU64 {
        AtomicU64::from_ptr(self.0.cast())
    }

    /// Reads an aligned `u64`.
    ///
    /// # Safety
    ///
    /// See the type-level contract.
    #[must_use]
    pub unsafe fn read_u64(self) -> u64 {
        self.0.cast::<u64>().read()
    }

    /// Writes an aligned `u64`.
    ///
    /// # Safety
    ///
    /// See the type-level contract.
    pub unsafe fn write_u64(self, value: u64) {
        self.0.cast::<u64>().write(value);
    }

    /// Writes an aligned `u32`.
    ///
    /// # Safety
    ///
    /// See the type-level contract.
    pub unsafe fn write_u32(self, value: u32) {
        self.0.cast::<u32>().write(value);
    }

    /// Borrows `len` bytes starting at the pointer.
    ///
    /// # Safety
    ///
    /// See the type-level contract; nobody may write the bytes while the
    /// slice is alive.
    #[must_use]
    pub unsafe fn as_slice<'a>(self, len: usize) -> &'a [u8] {
        std::slice::from_raw_parts(self.0, len)
    }

    /// Borrows `len` bytes starting at the pointer mutably.
    ///
    /// # Safety
    ///
    /// See the type-level contract; the caller must have exclusive access to
    /// the bytes while the slice is alive.
    #[must_use]
    #[allow(clippy::mut_from_ref)]
    pub unsafe fn as_mut_slice<'a>(self, len: usize) -> &'a mut [u8] {
        std::slice::from_raw_parts_mut(self.0, len)
    }

    /// Copies `src` to the pointee.
    ///
    /// # Safety
    ///
    /// See the type-level contract.
    pub unsafe fn copy_from(self, src: &[u8]) {
        ptr::copy_nonoverlapping(src.as_ptr(), self.0, src.len());
    }

    /// Zeroes `len` bytes at the pointee.
    ///
    /// # Safety
    ///
    /// See the type-level contract.
    pub unsafe fn write_zeros(self, len: usize) {
        ptr::write_bytes(self.0, 0, len);
    }
}

impl fmt::Debug for DevicePtr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "DevicePtr({:p})", self.0)
    }
}
