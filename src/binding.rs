//! Device binding: negotiation, the mmap buffer ring and per-cycle capture.

use std::io;
use std::path::{Path, PathBuf};

use tracing::{debug, info, warn};

use crate::config::{CaptureConfig, DEFAULT_FRAME_COUNT};
use crate::device::V4L2Device;
use crate::error::{Error, Result};
use crate::traits::{CaptureDevice, Format};

/// Opens the device node behind a path.
pub type Opener<D> = Box<dyn Fn(&Path) -> io::Result<D> + Send + Sync>;

/// One buffer of the ring, mapped once at negotiation and reused every cycle.
pub struct BufferSlot<B> {
    index: u32,
    buffer: B,
    bytes_used: u32,
    queued: bool,
}

impl<B: AsRef<[u8]>> BufferSlot<B> {
    /// Position in the ring.
    pub const fn index(&self) -> u32 {
        self.index
    }

    /// Length of the mapped region.
    pub fn len(&self) -> usize {
        self.buffer.as_ref().len()
    }

    /// Whether the mapped region is empty. Never true for a negotiated ring.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Valid bytes written by the device in the last cycle that returned this slot.
    pub const fn bytes_used(&self) -> u32 {
        self.bytes_used
    }

    /// The valid part of the slot: the frame captured into it.
    pub fn frame(&self) -> &[u8] {
        let data = self.buffer.as_ref();
        let used = (self.bytes_used as usize).min(data.len());
        data.get(..used).unwrap_or_default()
    }
}

/// Owns one capture device, its negotiated format and its buffer ring.
///
/// The handle is opened by [`negotiate_and_allocate`](Self::negotiate_and_allocate)
/// and closed by [`stop`](Self::stop) or [`destroy`](Self::destroy). The ring
/// holds exactly `frame_count` slots while the handle is open and none
/// otherwise.
pub struct DeviceBinding<D: CaptureDevice> {
    path: Option<PathBuf>,
    frame_count: u32,
    open: Opener<D>,
    // Declared before `device` so mappings go away before the handle closes.
    ring: Vec<BufferSlot<D::Buffer>>,
    device: Option<D>,
    format: Option<Format>,
    streaming: bool,
}

impl DeviceBinding<V4L2Device> {
    /// Bind the V4L2 device at `path`. Nothing is opened yet.
    pub fn create(path: impl Into<PathBuf>, frame_count: Option<u32>) -> Self {
        Self::with_opener(
            path,
            frame_count.unwrap_or(DEFAULT_FRAME_COUNT),
            Box::new(V4L2Device::open),
        )
    }

    /// Bind the V4L2 device described by `config`.
    pub fn from_config(config: &CaptureConfig) -> Self {
        let timeout = config.dequeue_timeout;
        Self::with_opener(
            config.device.clone(),
            config.frame_count,
            Box::new(move |path: &Path| Ok(V4L2Device::open(path)?.with_dequeue_timeout(timeout))),
        )
    }
}

impl<D: CaptureDevice> DeviceBinding<D> {
    /// Bind a device that `open` produces from `path`.
    pub fn with_opener(path: impl Into<PathBuf>, frame_count: u32, open: Opener<D>) -> Self {
        Self {
            path: Some(path.into()),
            frame_count,
            open,
            ring: Vec::new(),
            device: None,
            format: None,
            streaming: false,
        }
    }

    /// Device path, `None` once destroyed.
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Ring size requested at negotiation.
    pub const fn frame_count(&self) -> u32 {
        self.frame_count
    }

    /// Format applied by the driver, while the device is open.
    pub const fn format(&self) -> Option<Format> {
        self.format
    }

    /// Whether the device handle is open.
    pub const fn is_open(&self) -> bool {
        self.device.is_some()
    }

    /// Whether device-level streaming is on.
    pub const fn is_streaming(&self) -> bool {
        self.streaming
    }

    /// The buffer ring, in index order.
    pub fn ring(&self) -> &[BufferSlot<D::Buffer>] {
        &self.ring
    }

    /// Slots that received data in the last cycle, in index order.
    ///
    /// Slots still held by the driver are never included.
    pub fn frames(&self) -> impl Iterator<Item = &BufferSlot<D::Buffer>> {
        self.ring
            .iter()
            .filter(|slot| !slot.queued && slot.bytes_used > 0)
    }

    /// Open the device, fix its format and map a ring of `frame_count` buffers.
    ///
    /// Uses `format`, or [`Format::default`] when `None`. On failure nothing
    /// stays mapped and the handle is closed again.
    pub fn negotiate_and_allocate(
        &mut self,
        format: Option<Format>,
    ) -> Result<&[BufferSlot<D::Buffer>]> {
        let Some(path) = self.path.clone() else {
            return Err(Error::State("device binding was destroyed".to_owned()));
        };
        if self.device.is_some() {
            return Err(Error::State(format!("{} is already negotiated", path.display())));
        }
        if self.frame_count == 0 {
            return Err(Error::Config("buffer count must be at least 1".to_owned()));
        }

        debug!(path = %path.display(), "opening capture device");
        let mut device = (self.open)(&path).map_err(|err| Error::io("open", err))?;

        let format = Self::configure(&mut device, format.unwrap_or_default())?;
        let ring = Self::allocate(&mut device, self.frame_count)?;

        info!(
            path = %path.display(),
            width = format.width,
            height = format.height,
            fourcc = %format.fourcc,
            buffers = ring.len(),
            "capture device negotiated"
        );

        self.device = Some(device);
        self.format = Some(format);
        self.ring = ring;
        Ok(&self.ring)
    }

    fn configure(device: &mut D, requested: Format) -> Result<Format> {
        let caps = device.capabilities();
        debug!(driver = %caps.driver, card = %caps.card, "queried capabilities");
        if !caps.can_capture {
            return Err(Error::Config(format!("{} cannot capture video", caps.card)));
        }
        if !caps.can_stream {
            return Err(Error::Config(format!("{} does not support streaming I/O", caps.card)));
        }

        debug!(?requested, "setting format");
        let applied = device
            .set_format(&requested)
            .map_err(|err| Error::Config(format!("format {requested:?} rejected: {err}")))?;

        if applied.fourcc != requested.fourcc {
            return Err(Error::Config(format!(
                "pixel format {} not supported, driver chose {}",
                requested.fourcc, applied.fourcc
            )));
        }
        if applied != requested {
            warn!(?requested, ?applied, "driver adjusted frame size");
        }
        Ok(applied)
    }

    fn allocate(device: &mut D, count: u32) -> Result<Vec<BufferSlot<D::Buffer>>> {
        debug!(count, "requesting buffers");
        let granted = device
            .request_buffers(count)
            .map_err(|err| Error::io("request buffers", err))?;
        if granted < count {
            release_or_warn(device);
            return Err(Error::io(
                "request buffers",
                io::Error::new(
                    io::ErrorKind::OutOfMemory,
                    format!("requested {count} buffers, driver granted {granted}"),
                ),
            ));
        }

        let mut ring = Vec::with_capacity(count as usize);
        for index in 0..count {
            match device.map_buffer(index) {
                Ok(buffer) => ring.push(BufferSlot {
                    index,
                    buffer,
                    bytes_used: 0,
                    queued: false,
                }),
                Err(err) => {
                    debug!(index, mapped = ring.len(), "mapping failed, rolling back");
                    drop(ring);
                    release_or_warn(device);
                    return Err(Error::io("map buffer", err));
                }
            }
        }
        Ok(ring)
    }

    /// Turn device-level streaming on.
    pub fn start(&mut self) -> Result<()> {
        if self.streaming {
            return Err(Error::io(
                "stream on",
                io::Error::new(io::ErrorKind::AlreadyExists, "already streaming"),
            ));
        }
        let device = self.device.as_mut().ok_or_else(|| {
            Error::io(
                "stream on",
                io::Error::new(io::ErrorKind::NotConnected, "device not negotiated"),
            )
        })?;
        device.stream_on().map_err(|err| Error::io("stream on", err))?;
        self.streaming = true;
        debug!("device streaming on");
        Ok(())
    }

    /// Turn streaming off, unmap the ring and close the handle.
    ///
    /// Failures are logged, never returned. Safe to call in any state.
    pub fn stop(&mut self) {
        if self.streaming {
            if let Some(device) = self.device.as_mut() {
                if let Err(err) = device.stream_off() {
                    warn!(error = %err, "failed to stop device streaming");
                }
            }
            self.streaming = false;
        }

        self.ring.clear();
        if let Some(mut device) = self.device.take() {
            release_or_warn(&mut device);
            debug!("capture device closed");
        }
        self.format = None;
    }

    /// Run one capture cycle over the whole ring.
    ///
    /// Each slot is submitted and a filled slot retrieved before moving on,
    /// so this blocks for up to one frame interval per slot. On failure the
    /// slots not reached keep their previous `bytes_used`. A slot whose
    /// retrieval failed stays with the driver, reports no frame, and is
    /// reclaimed at the start of the next cycle.
    pub fn capture_once(&mut self) -> Result<()> {
        let device = match self.device.as_mut() {
            Some(device) if self.streaming => device,
            _ => {
                return Err(Error::capture(
                    "capture",
                    io::Error::new(io::ErrorKind::NotConnected, "device is not streaming"),
                ))
            }
        };

        // Whatever the driver fills into an outstanding slot belongs to no cycle.
        while self.ring.iter().any(|slot| slot.queued) {
            let slot = Self::retrieve(device, &mut self.ring)?;
            debug!(index = slot.index, "reclaimed outstanding buffer");
            slot.bytes_used = 0;
        }

        for index in 0..self.frame_count {
            if let Some(slot) = self.ring.get_mut(index as usize) {
                device.queue(index).map_err(|err| Error::capture("queue", err))?;
                slot.queued = true;
                slot.bytes_used = 0;
            }
            Self::retrieve(device, &mut self.ring)?;
        }
        Ok(())
    }

    fn retrieve<'a>(
        device: &mut D,
        ring: &'a mut [BufferSlot<D::Buffer>],
    ) -> Result<&'a mut BufferSlot<D::Buffer>> {
        let filled = device.dequeue().map_err(|err| Error::capture("dequeue", err))?;
        let slot = ring.get_mut(filled.index as usize).ok_or_else(|| {
            Error::capture(
                "dequeue",
                io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!("driver returned unknown buffer {}", filled.index),
                ),
            )
        })?;
        slot.bytes_used = filled.bytes_used;
        slot.queued = false;
        Ok(slot)
    }

    /// Release everything the binding holds. Idempotent.
    pub fn destroy(&mut self) {
        self.stop();
        if let Some(path) = self.path.take() {
            debug!(path = %path.display(), "device binding destroyed");
        }
    }
}

impl<D: CaptureDevice> Drop for DeviceBinding<D> {
    fn drop(&mut self) {
        self.destroy();
    }
}

fn release_or_warn<D: CaptureDevice>(device: &mut D) {
    if let Err(err) = device.release_buffers() {
        warn!(error = %err, "failed to release device buffers");
    }
}
