//! Slot-level access to the V4L2 mmap buffer ring.
//!
//! The `v4l` crate's mmap stream hides individual ring slots, so the ring is
//! driven here through the crate's raw layer: `v4l::v4l2::{ioctl, mmap, munmap}`
//! with the `v4l_sys` struct definitions and `vidioc` request codes.

#![allow(unsafe_code)]

use std::io;
use std::mem;
use std::os::raw::{c_int, c_void};
use std::ptr::{self, NonNull};
use std::time::Duration;

use v4l::buffer::Type;
use v4l::device::Handle;
use v4l::memory::Memory;
use v4l::v4l2::{self, vidioc};
use v4l::v4l_sys::{v4l2_buffer, v4l2_requestbuffers};

fn buffer_desc(index: u32) -> v4l2_buffer {
    v4l2_buffer {
        index,
        type_: Type::VideoCapture as u32,
        memory: Memory::Mmap as u32,
        // SAFETY: v4l2_buffer is plain old data; all-zero is its documented
        // initial state.
        ..unsafe { mem::zeroed() }
    }
}

/// Issue `request`, retrying while the call is interrupted.
fn xioctl<T>(handle: &Handle, request: vidioc::_IOC_TYPE, arg: &mut T) -> io::Result<()> {
    loop {
        // SAFETY: `arg` is a live, exclusively borrowed struct of the type
        // `request` encodes.
        let ret = unsafe { v4l2::ioctl(handle.fd(), request, ptr::from_mut(arg).cast::<c_void>()) };
        match ret {
            Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
            other => return other,
        }
    }
}

/// `VIDIOC_REQBUFS` for mmap capture buffers. Returns the granted count.
pub fn request_buffers(handle: &Handle, count: u32) -> io::Result<u32> {
    let mut req = v4l2_requestbuffers {
        count,
        type_: Type::VideoCapture as u32,
        memory: Memory::Mmap as u32,
        // SAFETY: plain old data, zero is the reserved-field convention.
        ..unsafe { mem::zeroed() }
    };
    xioctl(handle, vidioc::VIDIOC_REQBUFS, &mut req)?;
    Ok(req.count)
}

/// `VIDIOC_QUERYBUF`. Returns `(offset, length)` of buffer `index`.
pub fn query_buffer(handle: &Handle, index: u32) -> io::Result<(u32, u32)> {
    let mut buf = buffer_desc(index);
    xioctl(handle, vidioc::VIDIOC_QUERYBUF, &mut buf)?;
    // SAFETY: the driver fills `m.offset` for mmap buffers.
    let offset = unsafe { buf.m.offset };
    Ok((offset, buf.length))
}

/// `VIDIOC_QBUF` for buffer `index`.
pub fn queue_buffer(handle: &Handle, index: u32) -> io::Result<()> {
    let mut buf = buffer_desc(index);
    xioctl(handle, vidioc::VIDIOC_QBUF, &mut buf)
}

/// Wait up to `timeout` for a filled buffer, then `VIDIOC_DQBUF` it.
///
/// Returns `(index, bytes_used)`.
pub fn dequeue_buffer(handle: &Handle, timeout: Duration) -> io::Result<(u32, u32)> {
    let millis = c_int::try_from(timeout.as_millis()).unwrap_or(c_int::MAX);
    let mut buf = buffer_desc(0);
    loop {
        let ready = match handle.poll(libc::POLLIN, millis) {
            Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
            other => other?,
        };
        if ready == 0 {
            return Err(io::Error::new(
                io::ErrorKind::TimedOut,
                format!("no frame within {timeout:?}"),
            ));
        }
        match xioctl(handle, vidioc::VIDIOC_DQBUF, &mut buf) {
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => {}
            other => break other?,
        }
    }
    Ok((buf.index, buf.bytesused))
}

/// `VIDIOC_STREAMON` for video capture.
pub fn stream_on(handle: &Handle) -> io::Result<()> {
    let mut kind = Type::VideoCapture as u32;
    xioctl(handle, vidioc::VIDIOC_STREAMON, &mut kind)
}

/// `VIDIOC_STREAMOFF` for video capture.
pub fn stream_off(handle: &Handle) -> io::Result<()> {
    let mut kind = Type::VideoCapture as u32;
    xioctl(handle, vidioc::VIDIOC_STREAMOFF, &mut kind)
}

/// A driver buffer mapped shared into process memory. Unmapped on drop.
pub struct MappedBuffer {
    ptr: NonNull<u8>,
    len: usize,
}

// SAFETY: the mapping is plain shared memory owned by this value; nothing
// else in the process aliases it mutably.
unsafe impl Send for MappedBuffer {}

impl MappedBuffer {
    /// Map `length` bytes at `offset` of the device behind `handle`.
    pub fn map(handle: &Handle, offset: u32, length: u32) -> io::Result<Self> {
        let len = length as usize;
        if len == 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "driver reported a zero-length buffer",
            ));
        }
        let offset = libc::off_t::try_from(offset)
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "buffer offset out of range"))?;
        // SAFETY: a fresh mapping at a kernel-chosen address; v4l2::mmap
        // reports MAP_FAILED as an error.
        let ptr = unsafe {
            v4l2::mmap(
                ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                handle.fd(),
                offset,
            )?
        };
        let ptr = NonNull::new(ptr.cast::<u8>())
            .ok_or_else(|| io::Error::other("mmap returned null"))?;
        Ok(Self { ptr, len })
    }
}

impl AsRef<[u8]> for MappedBuffer {
    fn as_ref(&self) -> &[u8] {
        // SAFETY: `ptr` points at `len` mapped bytes that live until drop.
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), self.len) }
    }
}

impl Drop for MappedBuffer {
    fn drop(&mut self) {
        // SAFETY: unmapping exactly the region returned by mmap.
        if let Err(err) = unsafe { v4l2::munmap(self.ptr.as_ptr().cast::<c_void>(), self.len) } {
            tracing::warn!(error = %err, len = self.len, "failed to unmap buffer");
        }
    }
}
