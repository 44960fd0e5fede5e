//! V4L2 device implementation using the v4l crate.

use std::io;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use v4l::device::Handle;
use v4l::video::Capture;
use v4l::Device;

use crate::sys::{self, MappedBuffer};
use crate::traits::{CaptureDevice, Dequeued, DeviceCapabilities, Format, FourCC};

/// How long a dequeue waits for the driver before reporting a timeout.
pub const DEFAULT_DEQUEUE_TIMEOUT: Duration = Duration::from_secs(2);

/// V4L2 capture device.
///
/// Format negotiation goes through the v4l crate; the mmap buffer ring is
/// driven slot by slot through [`sys`].
pub struct V4L2Device {
    device: Device,
    handle: Arc<Handle>,
    capabilities: DeviceCapabilities,
    dequeue_timeout: Duration,
}

impl V4L2Device {
    /// Open the device node at `path` and read its capabilities.
    pub fn open(path: &Path) -> io::Result<Self> {
        let device = Device::with_path(path)?;
        let caps = device.query_caps()?;

        let capabilities = DeviceCapabilities {
            driver: caps.driver,
            card: caps.card,
            bus_info: caps.bus,
            can_capture: caps.capabilities.contains(v4l::capability::Flags::VIDEO_CAPTURE),
            can_stream: caps.capabilities.contains(v4l::capability::Flags::STREAMING),
        };

        Ok(Self {
            handle: device.handle(),
            device,
            capabilities,
            dequeue_timeout: DEFAULT_DEQUEUE_TIMEOUT,
        })
    }

    /// Bound how long [`CaptureDevice::dequeue`] waits for a frame.
    #[must_use]
    pub const fn with_dequeue_timeout(mut self, timeout: Duration) -> Self {
        self.dequeue_timeout = timeout;
        self
    }

}

impl CaptureDevice for V4L2Device {
    type Buffer = MappedBuffer;

    fn capabilities(&self) -> &DeviceCapabilities {
        &self.capabilities
    }

    fn set_format(&mut self, format: &Format) -> io::Result<Format> {
        let mut fmt = self.device.format()?;

        fmt.width = format.width;
        fmt.height = format.height;
        fmt.fourcc = format.fourcc.into();

        let fmt = self.device.set_format(&fmt)?;

        Ok(Format {
            width: fmt.width,
            height: fmt.height,
            fourcc: FourCC::from(fmt.fourcc),
        })
    }

    fn request_buffers(&mut self, count: u32) -> io::Result<u32> {
        sys::request_buffers(&self.handle, count)
    }

    fn map_buffer(&mut self, index: u32) -> io::Result<Self::Buffer> {
        let (offset, length) = sys::query_buffer(&self.handle, index)?;
        MappedBuffer::map(&self.handle, offset, length)
    }

    fn release_buffers(&mut self) -> io::Result<()> {
        sys::request_buffers(&self.handle, 0).map(drop)
    }

    fn stream_on(&mut self) -> io::Result<()> {
        sys::stream_on(&self.handle)
    }

    fn stream_off(&mut self) -> io::Result<()> {
        sys::stream_off(&self.handle)
    }

    fn queue(&mut self, index: u32) -> io::Result<()> {
        sys::queue_buffer(&self.handle, index)
    }

    fn dequeue(&mut self) -> io::Result<Dequeued> {
        let (index, bytes_used) = sys::dequeue_buffer(&self.handle, self.dequeue_timeout)?;
        Ok(Dequeued { index, bytes_used })
    }
}
