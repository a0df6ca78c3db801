//! The capture handle: buffer-pool ownership and the acquisition cycle.

use std::time::Duration;

use crate::device::V4l2Backend;
use crate::traits::{
    AcquireStatus, BufferSlot, CaptureBackend, CaptureError, CaptureParams, Format, Frame, Result,
};

/// Fixed bound on the readiness wait inside [`CaptureDevice::acquire`].
pub const ACQUIRE_TIMEOUT: Duration = Duration::from_secs(2);

/// Owning handle over one provisioned capture device.
///
/// Aggregates the open device connection, the negotiated format, the
/// kernel buffer pool and its process-space mappings. Constructed
/// all-or-nothing; dropping it stops streaming, unmaps every frame and
/// closes the device.
pub struct CaptureDevice<B: CaptureBackend = V4l2Backend> {
    backend: B,
    format: Format,
    timeout: Duration,
    slots: Vec<BufferSlot>,
    frames: Vec<Frame>,
    streaming: bool,
}

impl CaptureDevice<V4l2Backend> {
    /// Open and fully provision a V4L2 device for mapped-buffer streaming.
    pub fn open(params: &CaptureParams) -> Result<Self> {
        let backend = V4l2Backend::open(&params.path)?;
        Self::with_backend(backend, params)
    }
}

impl<B: CaptureBackend> CaptureDevice<B> {
    /// Provision buffers and start streaming on an opened backend.
    ///
    /// Any failure tears down every mapping made so far and releases the
    /// backend; a handle is only returned once streaming has started.
    pub fn with_backend(mut backend: B, params: &CaptureParams) -> Result<Self> {
        let count = params.frame_count.max(1).unsigned_abs();

        let format = backend
            .apply_format(params.width, params.height, params.format)
            .map_err(CaptureError::FormatNegotiation)?;

        let mut device = Self {
            backend,
            format,
            timeout: ACQUIRE_TIMEOUT,
            slots: Vec::new(),
            frames: Vec::new(),
            streaming: false,
        };
        device.allocate(count)?;

        device
            .backend
            .stream_on()
            .map_err(CaptureError::StreamStart)?;
        device.streaming = true;

        tracing::debug!(buffers = count, "capture device streaming");
        Ok(device)
    }

    fn allocate(&mut self, count: u32) -> Result<()> {
        let granted = self
            .backend
            .request_buffers(count)
            .map_err(CaptureError::BufferRequest)?;
        if granted < count {
            return Err(CaptureError::BufferShortfall {
                requested: count,
                granted,
            });
        }

        self.slots.reserve_exact(count as usize);
        self.frames.reserve_exact(count as usize);
        for index in 0..count {
            let slot = self
                .backend
                .query_buffer(index)
                .map_err(|source| CaptureError::Mapping { index, source })?;
            let frame = self
                .backend
                .map_buffer(&slot)
                .map_err(|source| CaptureError::Mapping { index, source })?;
            // Pushed together so the tables stay index-aligned even when a
            // later slot fails mid-allocation.
            self.slots.push(slot);
            self.frames.push(frame);
        }
        Ok(())
    }

    /// Read-only view of the frame-mapping table.
    #[must_use]
    pub fn frames(&self) -> &[Frame] {
        &self.frames
    }

    /// Kernel-side descriptors, index-aligned with [`frames`](Self::frames).
    #[must_use]
    pub fn slots(&self) -> &[BufferSlot] {
        &self.slots
    }

    /// Number of buffer slots in the pool.
    #[must_use]
    pub fn frame_count(&self) -> usize {
        self.frames.len()
    }

    /// The negotiated format.
    #[must_use]
    pub const fn format(&self) -> &Format {
        &self.format
    }

    /// The fixed bound on each acquisition's readiness wait.
    #[must_use]
    pub const fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Run one enqueue/wait/dequeue cycle across every slot.
    ///
    /// On `Ok` every frame's mapped region holds this cycle's captured
    /// bytes, readable in place until the next call overwrites them. A
    /// timeout leaves the previous contents untouched; already enqueued
    /// buffers stay queued for the next call.
    #[allow(clippy::cast_possible_truncation)]
    pub fn acquire(&mut self) -> Result<AcquireStatus> {
        for (position, slot) in self.slots.iter_mut().enumerate() {
            slot.index = position as u32;
            self.backend
                .enqueue(slot)
                .map_err(|source| CaptureError::MemoryHandle {
                    index: position as u32,
                    source,
                })?;
        }

        // A hard wait failure is folded into the timeout outcome; no
        // dequeue is attempted either way.
        match self.backend.wait_ready(self.timeout) {
            Ok(true) => {}
            Ok(false) | Err(_) => return Err(CaptureError::Timeout),
        }

        let mut corrupted = Vec::new();
        for (position, slot) in self.slots.iter_mut().enumerate() {
            if slot.corrupted() {
                tracing::warn!(slot = position, "frame memory might be corrupted");
                corrupted.push(position as u32);
            }
            self.backend
                .dequeue(slot)
                .map_err(|source| CaptureError::MemoryHandle {
                    index: position as u32,
                    source,
                })?;
        }

        if corrupted.is_empty() {
            Ok(AcquireStatus::Clean)
        } else {
            Ok(AcquireStatus::Corrupted(corrupted))
        }
    }

    fn release(&mut self) {
        if self.streaming {
            self.streaming = false;
            if let Err(err) = self.backend.stream_off() {
                tracing::warn!(error = %err, "failed to stop stream during teardown");
            }
        }
        for frame in &self.frames {
            self.backend.unmap_buffer(frame);
        }
        self.frames.clear();
        self.slots.clear();
    }
}

impl<B: CaptureBackend> Drop for CaptureDevice<B> {
    fn drop(&mut self) {
        self.release();
    }
}
