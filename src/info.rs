//! Read-only device diagnostics, independent of any capture handle.

use std::fmt;
use std::path::Path;

use v4l::capability::Flags;
use v4l::Device;

use crate::device::query_crop;
use crate::traits::{CaptureError, CropBounds, Rect, Result};

/// Snapshot of a device's driver identity and cropping geometry.
#[derive(Debug, Clone)]
pub struct DeviceReport {
    /// Kernel driver name.
    pub driver: String,
    /// Card or sensor name.
    pub card: String,
    /// Bus the device hangs off.
    pub bus: String,
    /// Driver version as major, minor, patch.
    pub version: (u8, u8, u8),
    /// Whether plain read()/write() I/O is offered.
    pub read_io: bool,
    /// Whether mapped streaming I/O is offered.
    pub streaming: bool,
    /// Cropping geometry.
    pub crop: CropBounds,
}

/// Query a device's capabilities without provisioning it for capture.
///
/// Opens its own descriptor and closes it again on every path. Requires
/// the capture capability, but merely reports streaming support.
pub fn probe(path: &Path) -> Result<DeviceReport> {
    let device = Device::with_path(path).map_err(|source| CaptureError::DeviceOpen {
        path: path.to_path_buf(),
        source,
    })?;

    let caps = device.query_caps().map_err(CaptureError::CapabilityQuery)?;
    if !caps.capabilities.contains(Flags::VIDEO_CAPTURE) {
        return Err(CaptureError::UnsupportedDevice("not a video capture device"));
    }

    let crop = query_crop(device.handle().fd()).map_err(CaptureError::CapabilityQuery)?;

    Ok(DeviceReport {
        driver: caps.driver,
        card: caps.card,
        bus: caps.bus,
        version: caps.version,
        read_io: caps.capabilities.contains(Flags::READ_WRITE),
        streaming: caps.capabilities.contains(Flags::STREAMING),
        crop,
    })
}

const fn support(available: bool) -> &'static str {
    if available {
        "supported"
    } else {
        "not supported"
    }
}

struct Geometry(Rect);

impl fmt::Display for Geometry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let rect = self.0;
        write!(
            f,
            "{}x{}+{}+{}",
            rect.width, rect.height, rect.left, rect.top
        )
    }
}

impl fmt::Display for DeviceReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (major, minor, patch) = self.version;
        writeln!(f, "Driver caps:")?;
        writeln!(f, "  Driver:    \"{}\"", self.driver)?;
        writeln!(f, "  Card:      \"{}\"", self.card)?;
        writeln!(f, "  Bus:       \"{}\"", self.bus)?;
        writeln!(f, "  Version:   {major}.{minor}.{patch}")?;
        writeln!(f, "  Read I/O:  {}", support(self.read_io))?;
        writeln!(f, "  Streaming: {}", support(self.streaming))?;
        writeln!(f)?;
        writeln!(f, "Cropping:")?;
        writeln!(f, "  Bounds:  {}", Geometry(self.crop.bounds))?;
        writeln!(f, "  Default: {}", Geometry(self.crop.default))?;
        write!(f, "  Aspect:  {}/{}", self.crop.aspect.0, self.crop.aspect.1)
    }
}
