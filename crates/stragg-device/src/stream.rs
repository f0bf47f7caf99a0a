//! In-order asynchronous streams.
//!
//! Each stream owns a worker thread that drains a FIFO of commands. Copies,
//! memsets and launches are enqueued and return immediately; events mark a
//! position in the queue. The first failing command faults the stream:
//! everything after it is skipped (events still complete) and the fault is
//! reported by [`Stream::synchronize`] and [`Stream::fault`].

use std::fmt;
use std::ops::Range;
use std::sync::Arc;
use std::thread::JoinHandle;

use crossbeam_channel::{Receiver, Sender};
use parking_lot::Mutex;

use crate::context::ContextInner;
use crate::event::Event;
use crate::launch::{self, Kernel, LaunchConfig};
use crate::memory::{DeviceBuffer, PinnedBuffer};
use crate::{DeviceError, Result};

enum Command {
    CopyHtoD {
        src: Arc<PinnedBuffer>,
        src_range: Range<usize>,
        dst: Arc<DeviceBuffer>,
        dst_offset: usize,
    },
    Memset {
        dst: Arc<DeviceBuffer>,
        range: Range<usize>,
    },
    Launch {
        cfg: LaunchConfig,
        kernel: Arc<dyn Kernel>,
    },
    Record(Event),
}

/// An in-order queue of device work.
pub struct Stream {
    id: usize,
    ordinal: usize,
    tx: Option<Sender<Command>>,
    worker: Option<JoinHandle<()>>,
    fault: Arc<Mutex<Option<DeviceError>>>,
    _ctx: Arc<ContextInner>,
}

impl Stream {
    pub(crate) fn spawn(ctx: Arc<ContextInner>, id: usize) -> Result<Self> {
        let (tx, rx) = crossbeam_channel::unbounded();
        let fault = Arc::new(Mutex::new(None));
        let worker_fault = Arc::clone(&fault);
        let ordinal = ctx.ordinal;
        let worker = std::thread::Builder::new()
            .name(format!("stragg-dev{ordinal}-stream{id}"))
            .spawn(move || run_worker(id, &rx, &worker_fault))
            .map_err(|_| DeviceError::StreamClosed(id))?;
        tracing::debug!(ordinal, stream = id, "stream created");
        Ok(Self {
            id,
            ordinal,
            tx: Some(tx),
            worker: Some(worker),
            fault,
            _ctx: ctx,
        })
    }

    /// Stream id, unique per context.
    #[must_use]
    pub fn id(&self) -> usize {
        self.id
    }

    /// Enqueues a host-to-device copy of `src[src_range]` into `dst` at
    /// `dst_offset`.
    ///
    /// # Errors
    ///
    /// Returns [`DeviceError::OutOfBounds`] if either side of the copy is
    /// out of range, or [`DeviceError::StreamClosed`].
    pub fn memcpy_htod(
        &self,
        src: &Arc<PinnedBuffer>,
        src_range: Range<usize>,
        dst: &Arc<DeviceBuffer>,
        dst_offset: usize,
    ) -> Result<()> {
        let len = src_range.end.saturating_sub(src_range.start);
        if src_range.start > src_range.end || src_range.end > src.len() {
            return Err(DeviceError::OutOfBounds {
                op: "memcpy_htod",
                offset: src_range.start,
                len,
                size: src.len(),
            });
        }
        dst.check_range("memcpy_htod", dst_offset, len)?;
        self.submit(Command::CopyHtoD {
            src: Arc::clone(src),
            src_range,
            dst: Arc::clone(dst),
            dst_offset,
        })
    }

    /// Enqueues zeroing of `dst[range]`.
    ///
    /// # Errors
    ///
    /// Returns [`DeviceError::OutOfBounds`] or [`DeviceError::StreamClosed`].
    pub fn memset_zeros(&self, dst: &Arc<DeviceBuffer>, range: Range<usize>) -> Result<()> {
        let len = range.end.saturating_sub(range.start);
        dst.check_range("memset", range.start, len)?;
        self.submit(Command::Memset {
            dst: Arc::clone(dst),
            range,
        })
    }

    /// Enqueues a kernel launch.
    ///
    /// # Errors
    ///
    /// Returns [`DeviceError::InvalidLaunch`] for a bad geometry, or
    /// [`DeviceError::StreamClosed`].
    pub fn launch(&self, cfg: LaunchConfig, kernel: Arc<dyn Kernel>) -> Result<()> {
        cfg.validate()?;
        self.submit(Command::Launch { cfg, kernel })
    }

    /// Records an event after all previously enqueued work.
    ///
    /// # Errors
    ///
    /// Returns [`DeviceError::StreamClosed`].
    pub fn record_event(&self) -> Result<Event> {
        let event = Event::new();
        self.submit(Command::Record(event.clone()))?;
        Ok(event)
    }

    /// Blocks until all enqueued work has finished.
    ///
    /// # Errors
    ///
    /// Returns the stream's sticky fault, if any.
    pub fn synchronize(&self) -> Result<()> {
        self.record_event()?.synchronize();
        match self.fault() {
            Some(fault) => Err(fault),
            None => Ok(()),
        }
    }

    /// Synchronizes the stream, then copies `dst.len()` bytes from `src` at
    /// `src_offset` into `dst`.
    ///
    /// # Errors
    ///
    /// Returns the stream's sticky fault or [`DeviceError::OutOfBounds`].
    pub fn memcpy_dtoh(&self, src: &DeviceBuffer, src_offset: usize, dst: &mut [u8]) -> Result<()> {
        self.synchronize()?;
        src.read_into(src_offset, dst)
    }

    /// The first fault observed on this stream, if any.
    #[must_use]
    pub fn fault(&self) -> Option<DeviceError> {
        self.fault.lock().clone()
    }

    fn submit(&self, cmd: Command) -> Result<()> {
        self.tx
            .as_ref()
            .ok_or(DeviceError::StreamClosed(self.id))?
            .send(cmd)
            .map_err(|_| DeviceError::StreamClosed(self.id))
    }
}

impl Drop for Stream {
    fn drop(&mut self) {
        // Closing the channel lets the worker drain and exit.
        self.tx.take();
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                tracing::warn!(ordinal = self.ordinal, stream = self.id, "stream worker panicked");
            }
        }
    }
}

impl fmt::Debug for Stream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Stream")
            .field("ordinal", &self.ordinal)
            .field("id", &self.id)
            .field("fault", &self.fault())
            .finish_non_exhaustive()
    }
}

fn run_worker(id: usize, rx: &Receiver<Command>, fault: &Mutex<Option<DeviceError>>) {
    for cmd in rx {
        if let Command::Record(event) = &cmd {
            event.complete();
            continue;
        }
        if fault.lock().is_some() {
            continue;
        }
        if let Err(e) = execute(cmd) {
            tracing::warn!(stream = id, error = %e, "stream faulted");
            *fault.lock() = Some(e);
        }
    }
}

fn execute(cmd: Command) -> Result<()> {
    match cmd {
        Command::CopyHtoD {
            src,
            src_range,
            dst,
            dst_offset,
        } => {
            let bytes = &src.as_slice()[src_range];
            // SAFETY: bounds were checked at enqueue; stream order keeps
            // kernels reading this range from racing the copy.
            unsafe { dst.device_ptr().byte_add(dst_offset).copy_from(bytes) };
            Ok(())
        }
        Command::Memset { dst, range } => {
            // SAFETY: bounds were checked at enqueue.
            unsafe {
                dst.device_ptr()
                    .byte_add(range.start)
                    .write_zeros(range.end - range.start);
            }
            Ok(())
        }
        Command::Launch { cfg, kernel } => launch::execute(cfg, kernel.as_ref()),
        Command::Record(event) => {
            event.complete();
            Ok(())
        }
    }
}
