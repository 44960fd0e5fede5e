//! Streaming state machine: one background capture task per device.
//!
//! The caller drives [`StreamController::init`], [`StreamController::start`],
//! [`StreamController::stop`] and [`StreamController::destroy`]. A single
//! background task, launched by `init`, parks until `start` hands it a sink
//! and then pushes every captured frame into that sink until `stop`.
//!
//! `stop` latency is bounded by the in-flight capture cycle: the task only
//! notices the status change between cycles. With [`V4L2Device`] each
//! retrieval is bounded by the configured dequeue timeout.
//!
//! Back-to-back capture failures pause the task for a growing interval,
//! capped at half a second; `stop` cuts the pause short.

use std::io::Write;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tracing::{debug, error, info, warn};

use crate::binding::DeviceBinding;
use crate::config::CaptureConfig;
use crate::device::V4L2Device;
use crate::error::{Error, Result};
use crate::traits::{CaptureDevice, Format};

/// Whether frames are currently flowing to a sink.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamStatus {
    /// No sink attached; the capture task is parked or gone.
    Idle,
    /// The device is streaming into the attached sink.
    Streaming,
}

/// Counters accumulated over a controller's lifetime.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StreamStats {
    /// Capture cycles that completed.
    pub cycles: u64,
    /// Capture cycles that failed.
    pub capture_errors: u64,
    /// Frames written to the sink.
    pub frames_written: u64,
    /// Bytes written to the sink.
    pub bytes_written: u64,
    /// Failed writes and flushes.
    pub write_errors: u64,
}

#[derive(Default)]
struct Counters {
    cycles: AtomicU64,
    capture_errors: AtomicU64,
    frames_written: AtomicU64,
    bytes_written: AtomicU64,
    write_errors: AtomicU64,
}

impl Counters {
    fn bump(counter: &AtomicU64, by: u64) {
        counter.fetch_add(by, Ordering::Relaxed);
    }

    fn snapshot(&self) -> StreamStats {
        StreamStats {
            cycles: self.cycles.load(Ordering::Relaxed),
            capture_errors: self.capture_errors.load(Ordering::Relaxed),
            frames_written: self.frames_written.load(Ordering::Relaxed),
            bytes_written: self.bytes_written.load(Ordering::Relaxed),
            write_errors: self.write_errors.load(Ordering::Relaxed),
        }
    }
}

/// First pause after back-to-back capture failures.
const BACKOFF_BASE: Duration = Duration::from_millis(10);
/// Longest pause between failing capture cycles.
const BACKOFF_MAX: Duration = Duration::from_millis(500);

/// Pause before the next cycle after `failures` consecutive capture failures.
///
/// A single failure retries at once; from the second on the pause doubles.
fn backoff(failures: u32) -> Duration {
    match failures {
        0 | 1 => Duration::ZERO,
        n => BACKOFF_BASE
            .checked_mul(1 << (n - 2).min(16))
            .map_or(BACKOFF_MAX, |delay| delay.min(BACKOFF_MAX)),
    }
}

struct Session<W> {
    status: StreamStatus,
    sink: Option<W>,
    format: Option<Format>,
    initialized: bool,
    stop_requested: bool,
}

impl<W> Session<W> {
    const fn can_stream(&self) -> bool {
        matches!(self.status, StreamStatus::Streaming) && self.sink.is_some()
    }

    fn streaming_sink(&mut self) -> Option<&mut W> {
        if self.can_stream() {
            self.sink.as_mut()
        } else {
            None
        }
    }
}

struct Shared<W> {
    session: Mutex<Session<W>>,
    wake: Condvar,
    counters: Counters,
}

impl<W> Shared<W> {
    fn lock(&self) -> MutexGuard<'_, Session<W>> {
        lock(&self.session)
    }

    /// Park until streaming may begin. Returns `false` if stopped first.
    fn wait_for_stream(&self) -> bool {
        let mut session = self.lock();
        while !session.can_stream() && !session.stop_requested {
            session = self
                .wake
                .wait(session)
                .unwrap_or_else(PoisonError::into_inner);
        }
        session.can_stream()
    }

    /// Sleep up to `delay`, returning early once streaming ends.
    fn pause(&self, delay: Duration) {
        if delay.is_zero() {
            return;
        }
        let session = self.lock();
        drop(
            self.wake
                .wait_timeout_while(session, delay, |session| session.can_stream())
                .unwrap_or_else(PoisonError::into_inner),
        );
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Coordinates one device binding with its background capture task.
///
/// Lock order is binding first, then session; no path takes them the other
/// way round.
///
/// A controller streams once: after [`stop`](Self::stop) a further
/// [`start`](Self::start) is rejected with [`Error::State`].
pub struct StreamController<D, W>
where
    D: CaptureDevice + 'static,
    W: Write + Send + 'static,
{
    binding: Arc<Mutex<DeviceBinding<D>>>,
    shared: Arc<Shared<W>>,
    worker: Option<JoinHandle<()>>,
    destroyed: bool,
}

impl<W: Write + Send + 'static> StreamController<V4L2Device, W> {
    /// Controller for the V4L2 device described by `config`.
    pub fn from_config(config: &CaptureConfig) -> Self {
        Self::new(DeviceBinding::from_config(config))
    }
}

impl<D, W> StreamController<D, W>
where
    D: CaptureDevice + 'static,
    W: Write + Send + 'static,
{
    /// Wrap a binding. Nothing is opened and no task runs yet.
    pub fn new(binding: DeviceBinding<D>) -> Self {
        Self {
            binding: Arc::new(Mutex::new(binding)),
            shared: Arc::new(Shared {
                session: Mutex::new(Session {
                    status: StreamStatus::Idle,
                    sink: None,
                    format: None,
                    initialized: false,
                    stop_requested: false,
                }),
                wake: Condvar::new(),
                counters: Counters::default(),
            }),
            worker: None,
            destroyed: false,
        }
    }

    /// Current status.
    pub fn status(&self) -> StreamStatus {
        self.shared.lock().status
    }

    /// Whether `init` succeeded.
    pub fn is_initialized(&self) -> bool {
        self.shared.lock().initialized
    }

    /// Counters so far.
    pub fn stats(&self) -> StreamStats {
        self.shared.counters.snapshot()
    }

    /// Format negotiated by `init`, until `stop`.
    ///
    /// Never waits for the capture task.
    pub fn format(&self) -> Option<Format> {
        self.shared.lock().format
    }

    /// Negotiate the device and launch the parked capture task.
    pub fn init(&mut self, format: Option<Format>) -> Result<()> {
        self.check_alive()?;
        let mut binding = lock(&self.binding);
        {
            let session = self.shared.lock();
            if session.initialized {
                return Err(Error::State("controller is already initialized".to_owned()));
            }
        }

        info!("initiating streaming");
        binding.negotiate_and_allocate(format)?;
        let negotiated = binding.format();

        let task_binding = Arc::clone(&self.binding);
        let task_shared = Arc::clone(&self.shared);
        let dispatch = tracing::dispatcher::get_default(|current| current.clone());
        let spawned = thread::Builder::new()
            .name("v4l2-capture".to_owned())
            .spawn(move || {
                tracing::dispatcher::with_default(&dispatch, || {
                    capture_loop(&task_binding, &task_shared);
                });
            });

        match spawned {
            Ok(handle) => {
                self.worker = Some(handle);
                let mut session = self.shared.lock();
                session.initialized = true;
                session.format = negotiated;
                Ok(())
            }
            Err(err) => {
                binding.stop();
                Err(Error::io("spawn capture task", err))
            }
        }
    }

    /// Attach `sink`, start the device and wake the capture task.
    ///
    /// On failure status stays [`StreamStatus::Idle`] and `sink` is dropped.
    pub fn start(&mut self, sink: W) -> Result<()> {
        self.check_alive()?;
        let mut binding = lock(&self.binding);
        let mut session = self.shared.lock();
        if !session.initialized {
            return Err(Error::State("controller is not initialized".to_owned()));
        }
        if session.status == StreamStatus::Streaming {
            return Err(Error::State("controller is already streaming".to_owned()));
        }
        if session.stop_requested {
            return Err(Error::State(
                "controller was stopped and cannot stream again".to_owned(),
            ));
        }

        binding.start()?;
        session.sink = Some(sink);
        session.status = StreamStatus::Streaming;
        self.shared.wake.notify_one();
        info!("streaming requested");
        Ok(())
    }

    /// Detach the sink, stop the device and wait for the capture task.
    ///
    /// Returns the sink if one was attached. Safe to call in any state.
    pub fn stop(&mut self) -> Option<W> {
        let sink = {
            let mut session = self.shared.lock();
            if session.initialized {
                session.stop_requested = true;
            }
            session.status = StreamStatus::Idle;
            session.format = None;
            self.shared.wake.notify_all();
            session.sink.take()
        };

        lock(&self.binding).stop();

        if let Some(worker) = self.worker.take() {
            debug!("waiting for capture task");
            if worker.join().is_err() {
                warn!("capture task panicked");
            }
            info!("streaming stopped");
        }
        sink
    }

    /// Stop if needed and release the device. Safe to call repeatedly.
    pub fn destroy(&mut self) {
        if self.destroyed {
            debug!("stream controller already destroyed");
            return;
        }
        drop(self.stop());
        lock(&self.binding).destroy();
        self.destroyed = true;
        debug!("stream controller destroyed");
    }

    fn check_alive(&self) -> Result<()> {
        if self.destroyed {
            return Err(Error::State("controller was destroyed".to_owned()));
        }
        Ok(())
    }
}

impl<D, W> Drop for StreamController<D, W>
where
    D: CaptureDevice + 'static,
    W: Write + Send + 'static,
{
    fn drop(&mut self) {
        self.destroy();
    }
}

fn capture_loop<D: CaptureDevice, W: Write>(
    binding: &Mutex<DeviceBinding<D>>,
    shared: &Shared<W>,
) {
    debug!("capture task parked");
    if !shared.wait_for_stream() {
        debug!("capture task stopped before streaming");
        return;
    }
    info!("streaming started");

    let mut failures = 0_u32;
    loop {
        if !shared.lock().can_stream() {
            break;
        }

        let mut binding = lock(binding);
        let captured = binding.capture_once();
        if let Err(err) = captured {
            drop(binding);
            if !shared.lock().can_stream() {
                break;
            }
            failures = failures.saturating_add(1);
            Counters::bump(&shared.counters.capture_errors, 1);
            error!(error = %err, failures, "failed to capture frames");
            shared.pause(backoff(failures));
            continue;
        }
        failures = 0;
        Counters::bump(&shared.counters.cycles, 1);

        let mut session = shared.lock();
        let Some(sink) = session.streaming_sink() else {
            break;
        };
        drain(&binding, sink, &shared.counters);
    }

    debug!("capture task exiting");
}

/// Write every filled slot, in index order, then flush.
fn drain<D: CaptureDevice, W: Write>(
    binding: &DeviceBinding<D>,
    sink: &mut W,
    counters: &Counters,
) {
    for slot in binding.frames() {
        let frame = slot.frame();
        match sink.write_all(frame) {
            Ok(()) => {
                Counters::bump(&counters.frames_written, 1);
                Counters::bump(&counters.bytes_written, frame.len() as u64);
            }
            Err(err) => {
                Counters::bump(&counters.write_errors, 1);
                error!(index = slot.index(), error = %Error::Write(err), "failed to write frame");
            }
        }
    }

    if let Err(err) = sink.flush() {
        Counters::bump(&counters.write_errors, 1);
        error!(error = %Error::Write(err), "failed to flush sink");
    }
}
