//! Mock device implementation for testing without hardware.

use std::collections::VecDeque;
use std::io::{self, Write};
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread;
use std::time::Duration;

use tracing::field::{Field, Visit};
use tracing::{Event, Level, Subscriber};
use tracing_subscriber::layer::Context;
use tracing_subscriber::Layer;

use crate::traits::{CaptureDevice, Dequeued, DeviceCapabilities, Format, FourCC};

/// Device operations recorded by the mock, in call order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Op {
    Open,
    SetFormat,
    RequestBuffers,
    MapBuffer(u32),
    ReleaseBuffers,
    StreamOn,
    StreamOff,
    Queue(u32),
    Dequeue,
}

/// Byte every mapped buffer `index` is filled with.
pub const fn slot_byte(index: u32) -> u8 {
    b'A'.wrapping_add(index as u8)
}

struct Failure {
    op: Op,
    skip: usize,
    kind: io::ErrorKind,
}

#[derive(Default)]
struct State {
    calls: Vec<Op>,
    failures: Vec<Failure>,
    cycles: VecDeque<Vec<u32>>,
    queued: VecDeque<u32>,
    ring_len: u32,
    streaming: bool,
}

/// Scripted capture device.
///
/// Clones share state, so a test keeps one clone to inspect calls while the
/// binding owns another.
#[derive(Clone)]
pub struct MockDevice {
    capabilities: DeviceCapabilities,
    format: Format,
    rejected: Option<FourCC>,
    granted: Option<u32>,
    buffer_len: usize,
    frame_interval: Duration,
    state: Arc<Mutex<State>>,
    live_mappings: Arc<AtomicUsize>,
}

impl Default for MockDevice {
    fn default() -> Self {
        Self::new()
    }
}

impl MockDevice {
    /// Create a new mock device with default settings.
    #[must_use]
    pub fn new() -> Self {
        Self {
            capabilities: DeviceCapabilities {
                driver: "mock".to_owned(),
                card: "Mock Camera".to_owned(),
                bus_info: "mock:0".to_owned(),
                can_capture: true,
                can_stream: true,
            },
            format: Format::new(640, 480, FourCC::YUYV),
            rejected: None,
            granted: None,
            buffer_len: 256,
            frame_interval: Duration::from_millis(1),
            state: Arc::default(),
            live_mappings: Arc::default(),
        }
    }

    /// Set the capabilities for this mock device.
    #[must_use]
    pub fn with_capabilities(mut self, capabilities: DeviceCapabilities) -> Self {
        self.capabilities = capabilities;
        self
    }

    /// Make `set_format` fail for this pixel format.
    #[must_use]
    pub const fn rejecting(mut self, fourcc: FourCC) -> Self {
        self.rejected = Some(fourcc);
        self
    }

    /// Grant this many buffers regardless of the request.
    #[must_use]
    pub const fn granting(mut self, count: u32) -> Self {
        self.granted = Some(count);
        self
    }

    /// Length of every mapped buffer.
    #[must_use]
    pub const fn with_buffer_len(mut self, len: usize) -> Self {
        self.buffer_len = len;
        self
    }

    /// Delay before each dequeue completes.
    #[must_use]
    pub const fn with_frame_interval(mut self, interval: Duration) -> Self {
        self.frame_interval = interval;
        self
    }

    /// Queue the bytes-used values reported for one full capture cycle.
    ///
    /// Once the script runs dry every dequeue reports zero bytes.
    pub fn push_cycle(&self, bytes_used: &[u32]) {
        self.lock().cycles.push_back(bytes_used.to_vec());
    }

    /// Fail the next call matching `op` with `kind`.
    pub fn fail_next(&self, op: Op, kind: io::ErrorKind) {
        self.fail_after(op, 0, kind);
    }

    /// Let `skip` calls matching `op` succeed, then fail the one after.
    pub fn fail_after(&self, op: Op, skip: usize, kind: io::ErrorKind) {
        self.lock().failures.push(Failure { op, skip, kind });
    }

    /// Opener that hands out clones of this device.
    pub fn opener(&self) -> impl Fn(&Path) -> io::Result<Self> + Send + Sync + 'static {
        let device = self.clone();
        move |_path: &Path| {
            device.record(Op::Open)?;
            Ok(device.clone())
        }
    }

    /// Every call recorded so far.
    pub fn calls(&self) -> Vec<Op> {
        self.lock().calls.clone()
    }

    /// Number of calls equal to `op`.
    pub fn count(&self, op: Op) -> usize {
        self.lock().calls.iter().filter(|call| **call == op).count()
    }

    /// Mappings currently alive.
    pub fn live_mappings(&self) -> usize {
        self.live_mappings.load(Ordering::SeqCst)
    }

    /// Cycles still waiting in the script.
    pub fn pending_cycles(&self) -> usize {
        self.lock().cycles.len()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn record(&self, op: Op) -> io::Result<()> {
        let mut state = self.lock();
        state.calls.push(op);
        let Some(pos) = state.failures.iter().position(|failure| failure.op == op) else {
            return Ok(());
        };
        if let Some(failure) = state.failures.get_mut(pos).filter(|failure| failure.skip > 0) {
            failure.skip -= 1;
            return Ok(());
        }
        let kind = state.failures.remove(pos).kind;
        Err(io::Error::new(kind, format!("injected failure for {op:?}")))
    }
}

impl CaptureDevice for MockDevice {
    type Buffer = MockBuffer;

    fn capabilities(&self) -> &DeviceCapabilities {
        &self.capabilities
    }

    fn set_format(&mut self, format: &Format) -> io::Result<Format> {
        self.record(Op::SetFormat)?;
        if self.rejected == Some(format.fourcc) {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("{} not supported", format.fourcc),
            ));
        }
        self.format = *format;
        Ok(self.format)
    }

    fn request_buffers(&mut self, count: u32) -> io::Result<u32> {
        self.record(Op::RequestBuffers)?;
        let granted = self.granted.unwrap_or(count);
        self.lock().ring_len = granted;
        Ok(granted)
    }

    fn map_buffer(&mut self, index: u32) -> io::Result<Self::Buffer> {
        self.record(Op::MapBuffer(index))?;
        self.live_mappings.fetch_add(1, Ordering::SeqCst);
        Ok(MockBuffer {
            data: vec![slot_byte(index); self.buffer_len],
            live: Arc::clone(&self.live_mappings),
        })
    }

    fn release_buffers(&mut self) -> io::Result<()> {
        self.record(Op::ReleaseBuffers)?;
        let mut state = self.lock();
        state.ring_len = 0;
        state.queued.clear();
        Ok(())
    }

    fn stream_on(&mut self) -> io::Result<()> {
        self.record(Op::StreamOn)?;
        let mut state = self.lock();
        if state.streaming {
            return Err(io::Error::new(io::ErrorKind::AlreadyExists, "already streaming"));
        }
        state.streaming = true;
        Ok(())
    }

    fn stream_off(&mut self) -> io::Result<()> {
        self.record(Op::StreamOff)?;
        let mut state = self.lock();
        state.streaming = false;
        state.queued.clear();
        Ok(())
    }

    fn queue(&mut self, index: u32) -> io::Result<()> {
        self.record(Op::Queue(index))?;
        let mut state = self.lock();
        if state.queued.contains(&index) {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("buffer {index} is already queued"),
            ));
        }
        state.queued.push_back(index);
        Ok(())
    }

    fn dequeue(&mut self) -> io::Result<Dequeued> {
        self.record(Op::Dequeue)?;
        thread::sleep(self.frame_interval);

        let mut state = self.lock();
        if !state.streaming {
            return Err(io::Error::new(io::ErrorKind::InvalidInput, "not streaming"));
        }
        let index = state
            .queued
            .pop_front()
            .ok_or_else(|| io::Error::new(io::ErrorKind::WouldBlock, "no buffer queued"))?;

        let bytes_used = state
            .cycles
            .front()
            .and_then(|cycle| cycle.get(index as usize).copied())
            .unwrap_or(0);
        if index + 1 >= state.ring_len {
            state.cycles.pop_front();
        }

        Ok(Dequeued { index, bytes_used })
    }
}

/// Heap-backed stand-in for a mapped buffer.
pub struct MockBuffer {
    data: Vec<u8>,
    live: Arc<AtomicUsize>,
}

impl AsRef<[u8]> for MockBuffer {
    fn as_ref(&self) -> &[u8] {
        &self.data
    }
}

impl Drop for MockBuffer {
    fn drop(&mut self) {
        self.live.fetch_sub(1, Ordering::SeqCst);
    }
}

/// In-memory sink whose contents stay readable while a stream owns it.
#[derive(Clone, Default)]
pub struct SharedSink {
    bytes: Arc<Mutex<Vec<u8>>>,
    flushes: Arc<AtomicUsize>,
}

impl SharedSink {
    /// Bytes written so far.
    pub fn contents(&self) -> Vec<u8> {
        self.bytes.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// Number of successful flushes.
    pub fn flushes(&self) -> usize {
        self.flushes.load(Ordering::SeqCst)
    }
}

impl Write for SharedSink {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.bytes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.flushes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Sink that refuses the first `failures` writes, then behaves like `inner`.
pub struct FlakySink {
    inner: SharedSink,
    failures: usize,
}

impl FlakySink {
    pub const fn new(inner: SharedSink, failures: usize) -> Self {
        Self { inner, failures }
    }
}

impl Write for FlakySink {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.failures > 0 {
            self.failures -= 1;
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "sink closed"));
        }
        self.inner.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

/// Tracing layer that collects the messages of events at or above `WARN`.
#[derive(Clone, Default)]
pub struct WarnCollector {
    messages: Arc<Mutex<Vec<String>>>,
}

impl WarnCollector {
    pub fn messages(&self) -> Vec<String> {
        self.messages
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl<S> Layer<S> for WarnCollector
where
    S: Subscriber,
{
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        if *event.metadata().level() > Level::WARN {
            return;
        }
        let mut visitor = MessageVisitor::default();
        event.record(&mut visitor);
        self.messages
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(visitor.message);
    }
}

#[derive(Default)]
struct MessageVisitor {
    message: String,
}

impl Visit for MessageVisitor {
    fn record_debug(&mut self, field: &Field, value: &dyn std::fmt::Debug) {
        if field.name() == "message" {
            self.message = format!("{value:?}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mock_device_creation() {
        let device = MockDevice::new();
        assert_eq!(device.capabilities().driver, "mock");
        assert!(device.capabilities().can_capture);
        assert!(device.capabilities().can_stream);
    }

    #[test]
    fn test_mock_rejects_configured_format() {
        let mut device = MockDevice::new().rejecting(FourCC::MJPG);
        let ok = device.set_format(&Format::new(1280, 720, FourCC::YUYV));
        assert_eq!(ok.expect("YUYV should be accepted").width, 1280);

        let err = device.set_format(&Format::new(1280, 720, FourCC::MJPG));
        assert!(err.is_err());
    }

    #[test]
    fn test_mock_dequeue_follows_script() {
        let mut device = MockDevice::new();
        device.push_cycle(&[10, 20]);
        device.request_buffers(2).expect("request_buffers should succeed");
        device.stream_on().expect("stream_on should succeed");

        device.queue(0).expect("queue should succeed");
        let first = device.dequeue().expect("dequeue should succeed");
        device.queue(1).expect("queue should succeed");
        let second = device.dequeue().expect("dequeue should succeed");

        assert_eq!(first, Dequeued { index: 0, bytes_used: 10 });
        assert_eq!(second, Dequeued { index: 1, bytes_used: 20 });
        assert_eq!(device.pending_cycles(), 0);
    }

    #[test]
    fn test_mock_mappings_are_counted() {
        let mut device = MockDevice::new();
        let first = device.map_buffer(0).expect("map should succeed");
        let second = device.map_buffer(1).expect("map should succeed");
        assert_eq!(device.live_mappings(), 2);
        assert_eq!(first.as_ref().first(), Some(&b'A'));
        assert_eq!(second.as_ref().first(), Some(&b'B'));

        drop(first);
        drop(second);
        assert_eq!(device.live_mappings(), 0);
    }

    #[test]
    fn test_injected_failure_fires_once() {
        let mut device = MockDevice::new();
        device.fail_next(Op::StreamOn, io::ErrorKind::Other);

        assert!(device.stream_on().is_err());
        assert!(device.stream_on().is_ok());
        assert_eq!(device.count(Op::StreamOn), 2);
    }

    #[test]
    fn test_delayed_failure_skips_matching_calls() {
        let mut device = MockDevice::new();
        device.fail_after(Op::RequestBuffers, 1, io::ErrorKind::Other);

        assert!(device.request_buffers(2).is_ok());
        assert!(device.request_buffers(2).is_err());
        assert!(device.request_buffers(2).is_ok());
    }
}
