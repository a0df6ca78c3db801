//! Framegrab: mapped-buffer frame acquisition from V4L2 capture devices.
//!
//! The crate negotiates a pixel format, maps a pool of kernel buffers into
//! process memory, and drives the enqueue/wait/dequeue cycle that fills
//! them in place. Construction is all-or-nothing: a [`CaptureDevice`] is
//! only handed out once streaming has started, and dropping it releases
//! every resource it acquired.

pub mod capture;
pub mod device;
pub mod info;
pub mod traits;

#[cfg(test)]
pub mod mock;

pub use capture::{CaptureDevice, ACQUIRE_TIMEOUT};
pub use device::V4l2Backend;
pub use info::{probe, DeviceReport};
pub use traits::{
    AcquireStatus, BufferSlot, CaptureBackend, CaptureError, CaptureParams, CropBounds, Format,
    Frame, PixelFormat, Rect, Result,
};
