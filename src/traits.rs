//! Core types and the driver-facing seam for mapped-buffer acquisition.

use std::fmt;
use std::io;
use std::path::PathBuf;
use std::ptr::NonNull;
use std::slice;
use std::time::Duration;

use thiserror::Error;
use v4l::buffer::Flags as BufFlags;
use v4l::FourCC;

/// Pixel encodings the acquisition pipeline negotiates.
///
/// The set is closed; the default encoding is greyscale.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PixelFormat {
    /// 8-bit greyscale (GREY).
    #[default]
    Greyscale,
    /// YUYV 4:2:2 packed.
    Yuyv,
    /// UYVY 4:2:2 packed.
    Uyvy,
    /// 32-bit RGB (RGB4).
    Rgb32,
    /// Motion JPEG.
    Mjpeg,
}

impl PixelFormat {
    /// The V4L2 FourCC this encoding is negotiated under.
    #[must_use]
    pub const fn fourcc(self) -> FourCC {
        match self {
            Self::Greyscale => FourCC { repr: *b"GREY" },
            Self::Yuyv => FourCC { repr: *b"YUYV" },
            Self::Uyvy => FourCC { repr: *b"UYVY" },
            Self::Rgb32 => FourCC { repr: *b"RGB4" },
            Self::Mjpeg => FourCC { repr: *b"MJPG" },
        }
    }
}

/// Construction parameters for a capture device.
#[derive(Debug, Clone)]
pub struct CaptureParams {
    /// Path to the video device node.
    pub path: PathBuf,
    /// Number of kernel buffers to request. Values below 1 are coerced to 1.
    pub frame_count: i32,
    /// Pixel encoding to negotiate.
    pub format: PixelFormat,
    /// Horizontal resolution in pixels.
    pub width: u32,
    /// Vertical resolution in pixels.
    pub height: u32,
}

impl CaptureParams {
    /// Create parameters for the given device node with default geometry
    /// (five frames, RGB32, 1024x768).
    pub fn new<P: Into<PathBuf>>(path: P) -> Self {
        Self {
            path: path.into(),
            frame_count: 5,
            format: PixelFormat::Rgb32,
            width: 1024,
            height: 768,
        }
    }

    /// Set the number of buffers to request.
    #[must_use]
    pub fn with_frame_count(mut self, frame_count: i32) -> Self {
        self.frame_count = frame_count;
        self
    }

    /// Set the pixel encoding.
    #[must_use]
    pub fn with_format(mut self, format: PixelFormat) -> Self {
        self.format = format;
        self
    }

    /// Set the capture resolution.
    #[must_use]
    pub fn with_resolution(mut self, width: u32, height: u32) -> Self {
        self.width = width;
        self.height = height;
        self
    }
}

/// The format actually in effect on the device after negotiation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Format {
    /// Frame width in pixels, as acknowledged by the driver.
    pub width: u32,
    /// Frame height in pixels, as acknowledged by the driver.
    pub height: u32,
    /// The negotiated pixel encoding.
    pub pixel: PixelFormat,
    /// Bytes per line reported by the driver.
    pub stride: u32,
    /// Total image size in bytes reported by the driver.
    pub size: u32,
}

/// Kernel-side bookkeeping for one buffer slot.
///
/// Slots exist for the whole handle lifetime and are refreshed in place on
/// every acquisition cycle; the mapped region they describe never moves.
#[derive(Debug, Clone, Copy, Default)]
pub struct BufferSlot {
    /// Slot index in the driver's buffer pool.
    pub index: u32,
    /// Length of the backing region in bytes.
    pub length: u32,
    /// Offset of the region in device memory space.
    pub offset: u32,
    /// Driver status flags from the most recent queue or dequeue.
    pub flags: u32,
    /// Bytes filled by the most recent capture.
    pub bytes_used: u32,
}

impl BufferSlot {
    /// Whether the driver marked this slot's delivery as unreliable.
    #[must_use]
    pub const fn corrupted(&self) -> bool {
        self.flags & BufFlags::ERROR.bits() != 0
    }
}

/// Process-space view of one mapped buffer slot.
///
/// The region is mapped once at construction and stays at the same address
/// until the owning handle is dropped, so contents read through
/// [`data`](Frame::data) remain addressable between acquisition cycles.
/// Holds a raw mapping and is deliberately neither `Send` nor `Sync`.
pub struct Frame {
    ptr: NonNull<u8>,
    len: usize,
}

impl Frame {
    pub(crate) const fn from_raw(ptr: NonNull<u8>, len: usize) -> Self {
        Self { ptr, len }
    }

    /// Length of the mapped region in bytes.
    #[must_use]
    pub const fn len(&self) -> usize {
        self.len
    }

    /// Whether the mapped region is empty.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// The current contents of the mapped region.
    ///
    /// Bytes are overwritten in place by each acquisition cycle.
    #[must_use]
    pub fn data(&self) -> &[u8] {
        // The owning handle keeps the mapping alive for as long as this
        // Frame can be borrowed.
        unsafe { slice::from_raw_parts(self.ptr.as_ptr(), self.len) }
    }

    pub(crate) const fn as_ptr(&self) -> *mut u8 {
        self.ptr.as_ptr()
    }
}

impl fmt::Debug for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Frame")
            .field("ptr", &self.ptr)
            .field("len", &self.len)
            .finish()
    }
}

/// One rectangle of cropping geometry.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Rect {
    /// Horizontal offset of the rectangle.
    pub left: i32,
    /// Vertical offset of the rectangle.
    pub top: i32,
    /// Rectangle width in pixels.
    pub width: u32,
    /// Rectangle height in pixels.
    pub height: u32,
}

/// Cropping geometry reported by the driver.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CropBounds {
    /// Full capture area.
    pub bounds: Rect,
    /// Driver default crop rectangle.
    pub default: Rect,
    /// Pixel aspect ratio as numerator/denominator.
    pub aspect: (u32, u32),
}

/// Outcome of a completed acquisition cycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AcquireStatus {
    /// Every slot delivered clean data.
    Clean,
    /// All slots were drained, but the driver flagged the listed slot
    /// positions as possibly corrupted. The caller decides whether to keep
    /// or discard the affected frames.
    Corrupted(Vec<u32>),
}

/// Error type for capture operations.
#[derive(Debug, Error)]
pub enum CaptureError {
    /// The device node could not be opened.
    #[error("failed to open device {}: {source}", .path.display())]
    DeviceOpen {
        /// Path of the device node that failed to open.
        path: PathBuf,
        /// Underlying open failure.
        source: io::Error,
    },
    /// The device lacks a capability required for mapped streaming.
    #[error("unsupported device: {0}")]
    UnsupportedDevice(&'static str),
    /// Querying device capabilities or cropping bounds failed.
    #[error("capability query failed: {0}")]
    CapabilityQuery(#[source] io::Error),
    /// The driver rejected the requested format.
    #[error("format negotiation failed: {0}")]
    FormatNegotiation(#[source] io::Error),
    /// The buffer request was rejected by the driver.
    #[error("buffer request failed: {0}")]
    BufferRequest(#[source] io::Error),
    /// The driver granted fewer buffers than requested.
    #[error("buffer request granted {granted} of {requested} buffers")]
    BufferShortfall {
        /// Buffers asked for.
        requested: u32,
        /// Buffers the driver actually granted.
        granted: u32,
    },
    /// Querying or mapping a granted buffer failed.
    #[error("mapping buffer {index} failed: {source}")]
    Mapping {
        /// Index of the buffer that failed.
        index: u32,
        /// Underlying query or mmap failure.
        source: io::Error,
    },
    /// Starting the kernel stream failed.
    #[error("stream start failed: {0}")]
    StreamStart(#[source] io::Error),
    /// No frame became ready within the acquisition timeout.
    #[error("acquisition timed out")]
    Timeout,
    /// An enqueue or dequeue call failed mid-cycle.
    #[error("buffer handling failed at slot {index}: {source}")]
    MemoryHandle {
        /// Position of the slot being processed when the call failed.
        index: u32,
        /// Underlying ioctl failure.
        source: io::Error,
    },
}

/// Result type for capture operations.
pub type Result<T> = std::result::Result<T, CaptureError>;

/// Driver-facing operations the acquisition state machine is built on.
///
/// The production implementation speaks V4L2 ioctls; tests substitute a
/// scripted in-memory driver. Implementations retry interrupted system
/// calls internally rather than surfacing `EINTR`.
pub trait CaptureBackend {
    /// Apply the requested format and return what the driver acknowledged.
    fn apply_format(&mut self, width: u32, height: u32, pixel: PixelFormat) -> io::Result<Format>;

    /// Ask the driver for `count` mapped buffers; returns the granted count.
    fn request_buffers(&mut self, count: u32) -> io::Result<u32>;

    /// Read the kernel descriptor for buffer `index`.
    fn query_buffer(&mut self, index: u32) -> io::Result<BufferSlot>;

    /// Map the slot's backing memory into process space.
    fn map_buffer(&mut self, slot: &BufferSlot) -> io::Result<Frame>;

    /// Unmap a region previously returned by
    /// [`map_buffer`](CaptureBackend::map_buffer). Failures are reported
    /// through logging only; teardown must proceed regardless.
    fn unmap_buffer(&mut self, frame: &Frame);

    /// Submit a slot to the driver's incoming queue.
    fn enqueue(&mut self, slot: &mut BufferSlot) -> io::Result<()>;

    /// Block until a filled buffer is ready or `timeout` expires.
    /// Returns `Ok(false)` on timeout.
    fn wait_ready(&mut self, timeout: Duration) -> io::Result<bool>;

    /// Take the next filled buffer from the driver's outgoing queue,
    /// refreshing `slot` with the driver's descriptor.
    fn dequeue(&mut self, slot: &mut BufferSlot) -> io::Result<()>;

    /// Begin streaming.
    fn stream_on(&mut self) -> io::Result<()>;

    /// Stop streaming.
    fn stream_off(&mut self) -> io::Result<()>;
}
