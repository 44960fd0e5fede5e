//! v4l2-stream: raw frame streaming from memory-mapped V4L2 capture devices.
//!
//! A [`DeviceBinding`] owns the device handle and its ring of mmap buffers.
//! A [`StreamController`] runs one background task that drains every filled
//! buffer into a caller-supplied [`std::io::Write`] sink, back to back, with
//! no framing.
//!
//! Device access goes through the [`CaptureDevice`] trait, enabling both
//! production use with real hardware and testing with mock devices.

pub mod binding;
pub mod config;
pub mod controller;
pub mod device;
pub mod error;
mod sys;
pub mod traits;

#[cfg(test)]
pub mod mock;

pub use binding::{BufferSlot, DeviceBinding};
pub use config::CaptureConfig;
pub use controller::{StreamController, StreamStats, StreamStatus};
pub use device::V4L2Device;
pub use error::{Error, Result};
pub use traits::{CaptureDevice, Dequeued, DeviceCapabilities, Format, FourCC};
