//! Core traits and types for the V4L2 capture abstraction.

use std::fmt;
use std::io;

/// Pixel format representation (e.g., YUYV, MJPG, RGB3).
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct FourCC(pub [u8; 4]);

impl FourCC {
    /// Create a new `FourCC` from a 4-byte array.
    #[must_use]
    pub const fn new(code: &[u8; 4]) -> Self {
        Self(*code)
    }

    /// Build a `FourCC` from the numeric code used by the kernel.
    #[must_use]
    pub const fn from_code(code: u32) -> Self {
        Self(code.to_le_bytes())
    }

    /// Numeric code as the kernel stores it in `pixelformat`.
    #[must_use]
    pub const fn code(self) -> u32 {
        u32::from_le_bytes(self.0)
    }

    /// YUYV pixel format (4:2:2 packed).
    pub const YUYV: Self = Self::new(b"YUYV");
    /// MJPEG pixel format (Motion JPEG).
    pub const MJPG: Self = Self::new(b"MJPG");
    /// RGB3 pixel format (24-bit RGB).
    pub const RGB3: Self = Self::new(b"RGB3");
}

impl fmt::Debug for FourCC {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "FourCC({self})")
    }
}

impl fmt::Display for FourCC {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in self.0 {
            if byte.is_ascii_graphic() || byte == b' ' {
                write!(f, "{}", char::from(byte))?;
            } else {
                write!(f, "\\x{byte:02x}")?;
            }
        }
        Ok(())
    }
}

impl std::str::FromStr for FourCC {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let bytes: [u8; 4] = s
            .as_bytes()
            .try_into()
            .map_err(|_| format!("pixel format must be exactly 4 characters, got {s:?}"))?;
        Ok(Self(bytes))
    }
}

impl From<v4l::FourCC> for FourCC {
    fn from(fourcc: v4l::FourCC) -> Self {
        Self(fourcc.repr)
    }
}

impl From<FourCC> for v4l::FourCC {
    fn from(fourcc: FourCC) -> Self {
        Self::new(&fourcc.0)
    }
}

/// Capture format negotiated with the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Format {
    /// Frame width in pixels.
    pub width: u32,
    /// Frame height in pixels.
    pub height: u32,
    /// Pixel format.
    pub fourcc: FourCC,
}

impl Format {
    /// Width used when the caller does not ask for a format.
    pub const DEFAULT_WIDTH: u32 = 1024;
    /// Height used when the caller does not ask for a format.
    pub const DEFAULT_HEIGHT: u32 = 1024;

    /// Create a new format specification.
    #[must_use]
    pub const fn new(width: u32, height: u32, fourcc: FourCC) -> Self {
        Self {
            width,
            height,
            fourcc,
        }
    }
}

impl Default for Format {
    fn default() -> Self {
        Self::new(Self::DEFAULT_WIDTH, Self::DEFAULT_HEIGHT, FourCC::YUYV)
    }
}

/// Device capability flags.
#[derive(Debug, Clone, Default)]
pub struct DeviceCapabilities {
    /// Driver name.
    pub driver: String,
    /// Card/device name.
    pub card: String,
    /// Bus information.
    pub bus_info: String,
    /// Whether the device can capture video.
    pub can_capture: bool,
    /// Whether the device supports streaming I/O.
    pub can_stream: bool,
}

/// A buffer handed back by the driver after it finished filling it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Dequeued {
    /// Ring index of the buffer.
    pub index: u32,
    /// Number of valid bytes the driver wrote.
    pub bytes_used: u32,
}

/// Kernel control surface of a memory-mapped capture device.
///
/// Implementations stay thin: they issue one device operation per call and
/// report raw I/O errors. Ordering, rollback and error classification belong
/// to [`DeviceBinding`](crate::binding::DeviceBinding).
pub trait CaptureDevice: Send {
    /// Mapping of one ring buffer into process memory. Dropping it unmaps.
    type Buffer: AsRef<[u8]> + Send;

    /// Get device capabilities.
    fn capabilities(&self) -> &DeviceCapabilities;

    /// Set capture format. Returns the format the driver actually applied.
    fn set_format(&mut self, format: &Format) -> io::Result<Format>;

    /// Ask the driver for `count` mmap buffers. Returns the granted count.
    fn request_buffers(&mut self, count: u32) -> io::Result<u32>;

    /// Query the geometry of buffer `index` and map it.
    fn map_buffer(&mut self, index: u32) -> io::Result<Self::Buffer>;

    /// Return every buffer to the driver. Mappings must be dropped first.
    fn release_buffers(&mut self) -> io::Result<()>;

    /// Begin streaming.
    fn stream_on(&mut self) -> io::Result<()>;

    /// End streaming. Also returns every queued buffer to userspace.
    fn stream_off(&mut self) -> io::Result<()>;

    /// Hand buffer `index` to the driver for filling.
    fn queue(&mut self, index: u32) -> io::Result<()>;

    /// Wait for the driver to return a filled buffer.
    fn dequeue(&mut self) -> io::Result<Dequeued>;
}
