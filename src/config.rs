//! Capture configuration.

use std::path::PathBuf;
use std::time::Duration;

use crate::device::DEFAULT_DEQUEUE_TIMEOUT;
use crate::traits::Format;

/// Number of ring buffers requested when the caller does not choose one.
pub const DEFAULT_FRAME_COUNT: u32 = 128;

/// Device node opened when the caller does not choose one.
pub const DEFAULT_DEVICE: &str = "/dev/video0";

/// Everything needed to bind and stream one capture device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaptureConfig {
    /// Device node, e.g. `/dev/video0`.
    pub device: PathBuf,
    /// Size of the mmap buffer ring.
    pub frame_count: u32,
    /// Requested format. `None` negotiates [`Format::default`].
    pub format: Option<Format>,
    /// Upper bound on a single wait for a filled buffer.
    pub dequeue_timeout: Duration,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            device: PathBuf::from(DEFAULT_DEVICE),
            frame_count: DEFAULT_FRAME_COUNT,
            format: None,
            dequeue_timeout: DEFAULT_DEQUEUE_TIMEOUT,
        }
    }
}

impl CaptureConfig {
    /// Default configuration for `device`.
    #[must_use]
    pub fn new(device: impl Into<PathBuf>) -> Self {
        Self {
            device: device.into(),
            ..Self::default()
        }
    }

    /// Set the ring size.
    #[must_use]
    pub const fn with_frame_count(mut self, frame_count: u32) -> Self {
        self.frame_count = frame_count;
        self
    }

    /// Request a specific format.
    #[must_use]
    pub const fn with_format(mut self, format: Format) -> Self {
        self.format = Some(format);
        self
    }

    /// Set the dequeue timeout.
    #[must_use]
    pub const fn with_dequeue_timeout(mut self, timeout: Duration) -> Self {
        self.dequeue_timeout = timeout;
        self
    }

    /// Format that negotiation will ask for.
    pub fn effective_format(&self) -> Format {
        self.format.unwrap_or_default()
    }
}
