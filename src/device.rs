//! V4L2 backend speaking the kernel's mapped-buffer streaming protocol.

use std::io;
use std::mem;
use std::os::raw::{c_int, c_void};
use std::path::Path;
use std::ptr::{self, NonNull};
use std::sync::Arc;
use std::time::Duration;

use v4l::buffer::Type;
use v4l::capability::Flags;
use v4l::memory::Memory;
use v4l::v4l2;
use v4l::v4l_sys::{v4l2_buffer, v4l2_cropcap, v4l2_requestbuffers};
use v4l::video::Capture;
use v4l::Device;

use crate::traits::{
    BufferSlot, CaptureBackend, CaptureError, CropBounds, Format, Frame, PixelFormat, Rect, Result,
};

/// Retry an interrupted driver call in place instead of surfacing `EINTR`.
pub(crate) fn retry_eintr<F: FnMut() -> io::Result<()>>(mut op: F) -> io::Result<()> {
    loop {
        match op() {
            Err(err) if err.raw_os_error() == Some(libc::EINTR) => {}
            other => return other,
        }
    }
}

/// Query cropping geometry for the capture buffer type.
pub(crate) fn query_crop(fd: c_int) -> io::Result<CropBounds> {
    let mut cropcap = v4l2_cropcap {
        type_: Type::VideoCapture as u32,
        ..unsafe { mem::zeroed() }
    };
    retry_eintr(|| unsafe {
        v4l2::ioctl(
            fd,
            v4l2::vidioc::VIDIOC_CROPCAP,
            ptr::addr_of_mut!(cropcap).cast::<c_void>(),
        )
    })?;

    let rect = |r: &v4l::v4l_sys::v4l2_rect| Rect {
        left: r.left,
        top: r.top,
        width: r.width,
        height: r.height,
    };
    Ok(CropBounds {
        bounds: rect(&cropcap.bounds),
        default: rect(&cropcap.defrect),
        aspect: (cropcap.pixelaspect.numerator, cropcap.pixelaspect.denominator),
    })
}

/// Production backend wrapping one open V4L2 device node.
pub struct V4l2Backend {
    device: Device,
    handle: Arc<v4l::device::Handle>,
    crop: CropBounds,
}

impl V4l2Backend {
    /// Open the device node and verify it can do mapped-buffer streaming.
    ///
    /// The descriptor is closed again on every failure path.
    pub fn open(path: &Path) -> Result<Self> {
        let device = Device::with_path(path).map_err(|source| CaptureError::DeviceOpen {
            path: path.to_path_buf(),
            source,
        })?;

        let caps = device.query_caps().map_err(CaptureError::CapabilityQuery)?;
        if !caps.capabilities.contains(Flags::VIDEO_CAPTURE) {
            return Err(CaptureError::UnsupportedDevice("not a video capture device"));
        }
        if !caps.capabilities.contains(Flags::STREAMING) {
            return Err(CaptureError::UnsupportedDevice(
                "mapped streaming I/O not supported",
            ));
        }

        let handle = device.handle();
        let crop = query_crop(handle.fd()).map_err(CaptureError::CapabilityQuery)?;

        tracing::debug!(
            driver = %caps.driver,
            card = %caps.card,
            bus = %caps.bus,
            "opened capture device"
        );

        Ok(Self {
            device,
            handle,
            crop,
        })
    }

    /// Cropping geometry captured at open time.
    #[must_use]
    pub const fn crop_bounds(&self) -> &CropBounds {
        &self.crop
    }

    fn fd(&self) -> c_int {
        self.handle.fd()
    }
}

impl CaptureBackend for V4l2Backend {
    fn apply_format(&mut self, width: u32, height: u32, pixel: PixelFormat) -> io::Result<Format> {
        let mut fmt = self.device.format()?;
        fmt.width = width;
        fmt.height = height;
        fmt.fourcc = pixel.fourcc();

        let acked = self.device.set_format(&fmt)?;
        tracing::debug!(
            width = acked.width,
            height = acked.height,
            fourcc = ?acked.fourcc,
            size = acked.size,
            "format negotiated"
        );

        Ok(Format {
            width: acked.width,
            height: acked.height,
            pixel,
            stride: acked.stride,
            size: acked.size,
        })
    }

    fn request_buffers(&mut self, count: u32) -> io::Result<u32> {
        let mut request = v4l2_requestbuffers {
            count,
            type_: Type::VideoCapture as u32,
            memory: Memory::Mmap as u32,
            ..unsafe { mem::zeroed() }
        };
        retry_eintr(|| unsafe {
            v4l2::ioctl(
                self.fd(),
                v4l2::vidioc::VIDIOC_REQBUFS,
                ptr::addr_of_mut!(request).cast::<c_void>(),
            )
        })?;
        Ok(request.count)
    }

    fn query_buffer(&mut self, index: u32) -> io::Result<BufferSlot> {
        let mut buf = v4l2_buffer {
            index,
            type_: Type::VideoCapture as u32,
            memory: Memory::Mmap as u32,
            ..unsafe { mem::zeroed() }
        };
        retry_eintr(|| unsafe {
            v4l2::ioctl(
                self.fd(),
                v4l2::vidioc::VIDIOC_QUERYBUF,
                ptr::addr_of_mut!(buf).cast::<c_void>(),
            )
        })?;

        Ok(BufferSlot {
            index,
            length: buf.length,
            offset: unsafe { buf.m.offset },
            flags: buf.flags,
            bytes_used: buf.bytesused,
        })
    }

    fn map_buffer(&mut self, slot: &BufferSlot) -> io::Result<Frame> {
        let start = unsafe {
            v4l2::mmap(
                ptr::null_mut(),
                slot.length as usize,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                self.fd(),
                slot.offset as libc::off_t,
            )
        }?;

        let start = NonNull::new(start.cast::<u8>())
            .ok_or_else(|| io::Error::other("mmap returned a null mapping"))?;
        Ok(Frame::from_raw(start, slot.length as usize))
    }

    fn unmap_buffer(&mut self, frame: &Frame) {
        if let Err(err) = unsafe { v4l2::munmap(frame.as_ptr().cast::<c_void>(), frame.len()) } {
            tracing::warn!(error = %err, "failed to unmap frame region");
        }
    }

    fn enqueue(&mut self, slot: &mut BufferSlot) -> io::Result<()> {
        let mut buf = v4l2_buffer {
            index: slot.index,
            type_: Type::VideoCapture as u32,
            memory: Memory::Mmap as u32,
            ..unsafe { mem::zeroed() }
        };
        retry_eintr(|| unsafe {
            v4l2::ioctl(
                self.fd(),
                v4l2::vidioc::VIDIOC_QBUF,
                ptr::addr_of_mut!(buf).cast::<c_void>(),
            )
        })?;

        slot.flags = buf.flags;
        Ok(())
    }

    fn wait_ready(&mut self, timeout: Duration) -> io::Result<bool> {
        let fd = self.fd();
        #[allow(clippy::cast_possible_truncation, clippy::cast_possible_wrap)]
        let mut tv = libc::timeval {
            tv_sec: timeout.as_secs() as libc::time_t,
            tv_usec: timeout.subsec_micros() as libc::suseconds_t,
        };

        loop {
            let mut readfds: libc::fd_set = unsafe { mem::zeroed() };
            unsafe {
                libc::FD_ZERO(&mut readfds);
                libc::FD_SET(fd, &mut readfds);
            }

            // On Linux, select updates `tv` with the remaining time, so a
            // retry after a signal does not extend the deadline.
            let ready = unsafe {
                libc::select(
                    fd + 1,
                    &mut readfds,
                    ptr::null_mut(),
                    ptr::null_mut(),
                    &mut tv,
                )
            };
            match ready {
                -1 => {
                    let err = io::Error::last_os_error();
                    if err.raw_os_error() != Some(libc::EINTR) {
                        return Err(err);
                    }
                }
                0 => return Ok(false),
                _ => return Ok(true),
            }
        }
    }

    fn dequeue(&mut self, slot: &mut BufferSlot) -> io::Result<()> {
        let mut buf = v4l2_buffer {
            type_: Type::VideoCapture as u32,
            memory: Memory::Mmap as u32,
            ..unsafe { mem::zeroed() }
        };
        retry_eintr(|| unsafe {
            v4l2::ioctl(
                self.fd(),
                v4l2::vidioc::VIDIOC_DQBUF,
                ptr::addr_of_mut!(buf).cast::<c_void>(),
            )
        })?;

        slot.index = buf.index;
        slot.length = buf.length;
        slot.flags = buf.flags;
        slot.bytes_used = buf.bytesused;
        Ok(())
    }

    fn stream_on(&mut self) -> io::Result<()> {
        let mut kind = Type::VideoCapture as u32;
        retry_eintr(|| unsafe {
            v4l2::ioctl(
                self.fd(),
                v4l2::vidioc::VIDIOC_STREAMON,
                ptr::addr_of_mut!(kind).cast::<c_void>(),
            )
        })
    }

    fn stream_off(&mut self) -> io::Result<()> {
        let mut kind = Type::VideoCapture as u32;
        retry_eintr(|| unsafe {
            v4l2::ioctl(
                self.fd(),
                v4l2::vidioc::VIDIOC_STREAMOFF,
                ptr::addr_of_mut!(kind).cast::<c_void>(),
            )
        })
    }
}
