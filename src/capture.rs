//! Capture controller and capture loop.
//!
//! `CaptureController` is the one process-scoped owner of the capture state:
//! the run state machine, the supervised capture worker, the shared frame slot
//! and the push hub. Control operations (`start`, `stop`, `status`,
//! `test_source_connection`) take `&self` and never fail; they report
//! structured outcomes instead.
//!
//! State machine:
//!
//! ```text
//!   Idle ──start──▶ Running ──stop──▶ Stopping ──worker joined──▶ Idle
//!                      │
//!                      └── retry budget exhausted / stream ended ──▶ Idle
//! ```
//!
//! Locking: `control` serializes control operations and is held across the
//! bounded join in `stop`. `run` guards the state and is only ever held for a
//! few statements, so the worker can take it on exit while `stop` waits.
//!
//! Sequence numbers are process-wide and never reset when capture restarts.

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, TryRecvError};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crate::config::{interval_for, CameraConfig, CaptureSettings, RelayConfig};
use crate::encode::encode_jpeg;
use crate::frame::{EncodedFrame, Frame, FrameSlot};
use crate::hub::PushHub;
use crate::ingest::{self, ConnectionHandle, HandleCloser, ReconnectPolicy, SourceConnector, SourceError};

/// Measured rate below this fraction of target shrinks the pacing delay.
const LAG_THRESHOLD: f64 = 0.8;
/// Measured rate above this fraction of target lets the delay grow back.
const RECOVER_THRESHOLD: f64 = 1.05;
/// Delay adjustments, as tenths of the current delay.
const SHRINK_TENTHS: u32 = 9;
const GROW_TENTHS: u32 = 11;
const DELAY_FLOOR: Duration = Duration::from_millis(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CaptureState {
    Idle,
    Running,
    Stopping,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct StartOutcome {
    /// False when capture was already active.
    pub started: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct StopOutcome {
    /// False only when the worker did not exit within the stop grace period.
    ///
    /// The state still moves to Idle, but the worker is kept as detached and
    /// `start` reports `started: false` until it has actually exited.
    pub stopped: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct CaptureStatus {
    pub running: bool,
    pub state: CaptureState,
    pub source_connected: bool,
    pub last_frame_age_ms: Option<u64>,
    pub frames_captured: u64,
    pub subscribers: usize,
    pub url: String,
    pub timestamp: String,
}

/// Outcome of a one-shot source probe.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProbeReport {
    pub ok: bool,
    pub detail: String,
    pub resolution: Option<String>,
}

/// Why a capture run ended.
#[derive(Debug)]
enum RunExit {
    Stopped,
    StreamEnded,
    Exhausted(SourceError),
}

struct RunPhase {
    state: CaptureState,
    run_id: u64,
}

struct Inner {
    camera: CameraConfig,
    settings: CaptureSettings,
    push_quality: u8,
    connector: Arc<dyn SourceConnector>,
    slot: Arc<FrameSlot>,
    hub: Arc<PushHub>,
    run: Mutex<RunPhase>,
    connected: AtomicBool,
    sequence: AtomicU64,
    frames_captured: AtomicU64,
}

impl Inner {
    fn lock_run(&self) -> MutexGuard<'_, RunPhase> {
        self.run.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn state(&self) -> CaptureState {
        self.lock_run().state
    }

    /// Called by the worker on its way out. Stale workers change nothing.
    fn finish_run(&self, run_id: u64) {
        let mut run = self.lock_run();
        if run.run_id == run_id && run.state != CaptureState::Idle {
            run.state = CaptureState::Idle;
            self.connected.store(false, Ordering::SeqCst);
            self.slot.clear();
        }
    }
}

struct Worker {
    run_id: u64,
    /// Dropped on stop so the worker sees a disconnected channel from then on.
    stop_tx: Option<Sender<()>>,
    /// Closer for whichever connection the worker currently holds.
    closer: Arc<Mutex<Option<HandleCloser>>>,
    /// Disconnects when the worker thread exits.
    done_rx: Receiver<()>,
    join: JoinHandle<()>,
    /// Set when `stop` gave up waiting; the thread may still be inside the source.
    detached: bool,
}

impl Worker {
    fn exited(&self) -> bool {
        matches!(self.done_rx.try_recv(), Err(TryRecvError::Disconnected))
    }
}

pub struct CaptureController {
    inner: Arc<Inner>,
    control: Mutex<Option<Worker>>,
}

impl CaptureController {
    pub fn new(config: &RelayConfig, connector: Arc<dyn SourceConnector>) -> Self {
        let inner = Inner {
            camera: config.camera.clone(),
            settings: config.capture.clone(),
            push_quality: config.push.quality,
            connector,
            slot: Arc::new(FrameSlot::new()),
            hub: Arc::new(PushHub::new(&config.push)),
            run: Mutex::new(RunPhase {
                state: CaptureState::Idle,
                run_id: 0,
            }),
            connected: AtomicBool::new(false),
            sequence: AtomicU64::new(0),
            frames_captured: AtomicU64::new(0),
        };
        Self {
            inner: Arc::new(inner),
            control: Mutex::new(None),
        }
    }

    pub fn camera(&self) -> &CameraConfig {
        &self.inner.camera
    }

    pub fn slot(&self) -> &Arc<FrameSlot> {
        &self.inner.slot
    }

    pub fn hub(&self) -> &Arc<PushHub> {
        &self.inner.hub
    }

    pub fn state(&self) -> CaptureState {
        self.inner.state()
    }

    /// Idle -> Running. Returns `started: false` when already active.
    pub fn start(&self) -> StartOutcome {
        let mut control = self.lock_control();

        let state = self.inner.state();
        if state != CaptureState::Idle {
            log::warn!("CaptureLoop: start ignored, capture already {:?}", state);
            return StartOutcome { started: false };
        }

        if let Some(previous) = control.take() {
            if previous.detached {
                if !previous.exited() {
                    log::warn!(
                        "CaptureLoop: start refused, run {} has not exited yet",
                        previous.run_id
                    );
                    *control = Some(previous);
                    return StartOutcome { started: false };
                }
                join_worker(previous);
            } else {
                // Went idle on its own and is on its way out.
                reap(previous, self.inner.settings.stop_grace);
            }
        }

        // Only control operations leave Idle, and `control` is held.
        let run_id = {
            let mut run = self.inner.lock_run();
            run.run_id += 1;
            run.state = CaptureState::Running;
            run.run_id
        };

        let (stop_tx, stop_rx) = crossbeam_channel::bounded::<()>(1);
        let (done_tx, done_rx) = crossbeam_channel::bounded::<()>(1);
        let closer = Arc::new(Mutex::new(None));

        let inner = Arc::clone(&self.inner);
        let worker_closer = Arc::clone(&closer);
        let spawned = std::thread::Builder::new()
            .name(format!("capture-{run_id}"))
            .spawn(move || {
                let _done = done_tx;
                run_capture(&inner, run_id, &stop_rx, &worker_closer);
            });

        match spawned {
            Ok(join) => {
                *control = Some(Worker {
                    run_id,
                    stop_tx: Some(stop_tx),
                    closer,
                    done_rx,
                    join,
                    detached: false,
                });
                log::info!(
                    "CaptureLoop: started run {} for {}",
                    run_id,
                    self.inner.camera.redacted_url()
                );
                StartOutcome { started: true }
            }
            Err(e) => {
                log::error!("CaptureLoop: failed to spawn capture worker: {}", e);
                self.inner.finish_run(run_id);
                StartOutcome { started: false }
            }
        }
    }

    /// Running -> Stopping -> Idle. A no-op reporting success when idle.
    pub fn stop(&self) -> StopOutcome {
        let mut control = self.lock_control();

        let stopping = {
            let mut run = self.inner.lock_run();
            if run.state == CaptureState::Idle {
                None
            } else {
                run.state = CaptureState::Stopping;
                Some(run.run_id)
            }
        };

        let Some(worker) = control.take() else {
            if let Some(run_id) = stopping {
                self.inner.finish_run(run_id);
            }
            return StopOutcome { stopped: true };
        };

        if stopping.is_none() {
            if worker.detached {
                if worker.exited() {
                    join_worker(worker);
                } else {
                    *control = Some(worker);
                }
            } else {
                // Worker already went idle on its own.
                reap(worker, self.inner.settings.stop_grace);
            }
            return StopOutcome { stopped: true };
        }

        let run_id = worker.run_id;
        let outcome = signal_and_join(worker, self.inner.settings.stop_grace);
        self.inner.finish_run(run_id);
        match outcome {
            Ok(()) => {
                log::info!("CaptureLoop: run {} stopped", run_id);
                StopOutcome { stopped: true }
            }
            Err(mut worker) => {
                log::error!(
                    "CaptureLoop: run {} did not exit within {:?}; worker detached",
                    run_id,
                    self.inner.settings.stop_grace
                );
                worker.detached = true;
                *control = Some(worker);
                StopOutcome { stopped: false }
            }
        }
    }

    /// Best-known state. Never fails.
    pub fn status(&self) -> CaptureStatus {
        let state = self.inner.state();
        let running = state != CaptureState::Idle;
        CaptureStatus {
            running,
            state,
            source_connected: running && self.inner.connected.load(Ordering::SeqCst),
            last_frame_age_ms: self.inner.slot.last_frame_age_ms(),
            frames_captured: self.inner.frames_captured.load(Ordering::Relaxed),
            subscribers: self.inner.hub.subscriber_count(),
            url: self.inner.camera.redacted_url(),
            timestamp: crate::timestamp_now(),
        }
    }

    /// One-shot probe independent of the running loop: open, read one frame, close.
    pub fn test_source_connection(&self, camera: &CameraConfig) -> ProbeReport {
        probe_source(self.inner.connector.as_ref(), camera)
    }

    fn lock_control(&self) -> MutexGuard<'_, Option<Worker>> {
        self.control.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Drop for CaptureController {
    fn drop(&mut self) {
        if self.inner.state() != CaptureState::Idle {
            self.stop();
        }
    }
}

/// Open `camera` on `connector`, read one frame, close.
pub fn probe_source(connector: &dyn SourceConnector, camera: &CameraConfig) -> ProbeReport {
    log::info!("RtspSource: probing {}", camera.redacted_url());
    let mut handle = match ingest::open(connector, camera) {
        Ok(handle) => handle,
        Err(e) => {
            return ProbeReport {
                ok: false,
                detail: format!("could not connect to camera: {e}"),
                resolution: None,
            }
        }
    };
    let result = handle.read_frame();
    handle.close();
    match result {
        Ok(image) => {
            let resolution = format!("{}x{}", image.width(), image.height());
            ProbeReport {
                ok: true,
                detail: format!("frame received: {resolution}"),
                resolution: Some(resolution),
            }
        }
        Err(e) => ProbeReport {
            ok: false,
            detail: format!("connected but no frames received: {e}"),
            resolution: None,
        },
    }
}

/// Signal, close the live connection, and wait up to `grace` for the worker.
/// Hands the worker back when it is still running.
fn signal_and_join(mut worker: Worker, grace: Duration) -> Result<(), Worker> {
    // Signal first, then close: a connection opened after this point is
    // closed by the worker itself when it sees the signal.
    if let Some(stop_tx) = worker.stop_tx.take() {
        let _ = stop_tx.try_send(());
    }
    if let Some(closer) = worker
        .closer
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .as_ref()
    {
        closer.close();
    }

    match worker.done_rx.recv_timeout(grace) {
        Ok(()) | Err(RecvTimeoutError::Disconnected) => {
            join_worker(worker);
            Ok(())
        }
        Err(RecvTimeoutError::Timeout) => Err(worker),
    }
}

fn reap(worker: Worker, grace: Duration) {
    match worker.done_rx.recv_timeout(grace) {
        Ok(()) | Err(RecvTimeoutError::Disconnected) => join_worker(worker),
        Err(RecvTimeoutError::Timeout) => {
            log::warn!("CaptureLoop: previous worker still exiting; detached");
        }
    }
}

fn join_worker(worker: Worker) {
    if worker.join.join().is_err() {
        log::error!("CaptureLoop: capture worker panicked");
    }
}

fn stop_requested(stop_rx: &Receiver<()>) -> bool {
    !matches!(stop_rx.try_recv(), Err(TryRecvError::Empty))
}

/// Sleep for `duration` unless stop is signalled first. Returns true on stop.
fn sleep_or_stop(stop_rx: &Receiver<()>, duration: Duration) -> bool {
    if duration.is_zero() {
        return stop_requested(stop_rx);
    }
    !matches!(stop_rx.recv_timeout(duration), Err(RecvTimeoutError::Timeout))
}

fn run_capture(
    inner: &Inner,
    run_id: u64,
    stop_rx: &Receiver<()>,
    closer_slot: &Mutex<Option<HandleCloser>>,
) {
    let policy = ReconnectPolicy::from_settings(&inner.settings);
    let mut pacer = Pacer::new(inner.camera.fps);
    let mut push_gate = PushGate::new(inner.camera.fps, inner.camera.push_fps());
    let mut handle: Option<ConnectionHandle> = None;
    let mut failures = 0u32;

    let exit = loop {
        if stop_requested(stop_rx) {
            break RunExit::Stopped;
        }

        let Some(conn) = handle.as_mut() else {
            match ingest::open(inner.connector.as_ref(), &inner.camera) {
                Ok(conn) => {
                    *closer_slot.lock().unwrap_or_else(PoisonError::into_inner) =
                        Some(conn.closer());
                    inner.connected.store(true, Ordering::SeqCst);
                    log::info!("CaptureLoop: source connected");
                    handle = Some(conn);
                }
                Err(e) => {
                    failures += 1;
                    log::warn!(
                        "CaptureLoop: {} (attempt {}/{})",
                        e,
                        failures,
                        policy.retry_budget + 1
                    );
                    if policy.exhausted(failures) {
                        break RunExit::Exhausted(e);
                    }
                    if sleep_or_stop(stop_rx, policy.backoff(failures)) {
                        break RunExit::Stopped;
                    }
                }
            }
            continue;
        };

        let started = Instant::now();
        match conn.read_frame() {
            Ok(image) => {
                failures = 0;
                let sequence = inner.sequence.fetch_add(1, Ordering::SeqCst) + 1;
                let frame = Frame::new(sequence, image);

                let encoded = if push_gate.due(started) && inner.hub.subscriber_count() > 0 {
                    match encode_jpeg(frame.image(), inner.push_quality) {
                        Ok(jpeg) => Some(EncodedFrame::new(&frame, jpeg)),
                        Err(e) => {
                            log::warn!("CaptureLoop: frame {} not encoded: {}", sequence, e);
                            None
                        }
                    }
                } else {
                    None
                };

                inner.slot.set(frame);
                inner.frames_captured.fetch_add(1, Ordering::Relaxed);
                if let Some(encoded) = encoded {
                    inner.hub.publish(encoded);
                }

                let delay = pacer.next_delay(started.elapsed(), Instant::now());
                if sleep_or_stop(stop_rx, delay) {
                    break RunExit::Stopped;
                }
            }
            Err(SourceError::Closed) => break RunExit::Stopped,
            Err(SourceError::StreamEnded) => break RunExit::StreamEnded,
            Err(e) => {
                failures += 1;
                log::warn!(
                    "CaptureLoop: {} ({} consecutive, budget {})",
                    e,
                    failures,
                    policy.retry_budget
                );
                if policy.exhausted(failures) {
                    break RunExit::Exhausted(e);
                }
                if policy.should_reconnect(failures) {
                    log::info!("CaptureLoop: reopening source after {} failures", failures);
                    release(&mut handle, closer_slot, inner);
                }
                if sleep_or_stop(stop_rx, policy.backoff(failures)) {
                    break RunExit::Stopped;
                }
            }
        }
    };

    release(&mut handle, closer_slot, inner);
    match exit {
        RunExit::Stopped => log::info!("CaptureLoop: run {} exiting on stop", run_id),
        RunExit::StreamEnded => log::warn!("CaptureLoop: run {} source stream ended", run_id),
        RunExit::Exhausted(e) => log::error!(
            "CaptureLoop: run {} giving up after {} consecutive failures: {}",
            run_id,
            failures,
            e
        ),
    }
    inner.finish_run(run_id);
}

fn release(
    handle: &mut Option<ConnectionHandle>,
    closer_slot: &Mutex<Option<HandleCloser>>,
    inner: &Inner,
) {
    closer_slot
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .take();
    if let Some(mut conn) = handle.take() {
        conn.close();
        inner.connected.store(false, Ordering::SeqCst);
    }
}

/// Decimates capture rate down to push rate.
struct PushGate {
    interval: Option<Duration>,
    last: Option<Instant>,
}

impl PushGate {
    fn new(capture_fps: u32, push_fps: u32) -> Self {
        let interval = (push_fps < capture_fps).then(|| interval_for(push_fps));
        Self {
            interval,
            last: None,
        }
    }

    fn due(&mut self, now: Instant) -> bool {
        let Some(interval) = self.interval else {
            return true;
        };
        // Tolerate pacing jitter of a tenth of an interval.
        let due = self
            .last
            .map_or(true, |last| now.duration_since(last) + interval / 10 >= interval);
        if due {
            self.last = Some(now);
        }
        due
    }
}

/// Frame pacing with rate feedback.
///
/// Each iteration sleeps `delay - work`. Once per window of `fps` frames the
/// measured rate is compared with the target: persistently lagging shrinks
/// `delay` (never below `floor`), running ahead lets it grow back toward the
/// target interval.
pub(crate) struct Pacer {
    target_fps: f64,
    target: Duration,
    delay: Duration,
    floor: Duration,
    window: u32,
    window_frames: u32,
    window_start: Option<Instant>,
}

impl Pacer {
    pub(crate) fn new(fps: u32) -> Self {
        let target = interval_for(fps);
        Self {
            target_fps: f64::from(fps.max(1)),
            target,
            delay: target,
            floor: DELAY_FLOOR.min(target / 2),
            window: fps.max(1),
            window_frames: 0,
            window_start: None,
        }
    }

    pub(crate) fn delay(&self) -> Duration {
        self.delay
    }

    /// Sleep owed after an iteration that took `work`, finishing at `now`.
    pub(crate) fn next_delay(&mut self, work: Duration, now: Instant) -> Duration {
        let start = *self.window_start.get_or_insert(now);
        self.window_frames += 1;
        if self.window_frames >= self.window {
            self.observe(self.window_frames, now.duration_since(start));
            self.window_frames = 0;
            self.window_start = Some(now);
        }
        self.delay.saturating_sub(work)
    }

    /// Feed one measurement window into the feedback control.
    pub(crate) fn observe(&mut self, frames: u32, elapsed: Duration) {
        if elapsed.is_zero() {
            return;
        }
        let measured = f64::from(frames) / elapsed.as_secs_f64();
        log::debug!(
            "CaptureLoop: {:.1} fps over {} frames, delay {:?}",
            measured,
            frames,
            self.delay
        );
        if measured < self.target_fps * LAG_THRESHOLD {
            let shrunk = (self.delay * SHRINK_TENTHS / 10).max(self.floor);
            if shrunk != self.delay {
                self.delay = shrunk;
                log::info!(
                    "CaptureLoop: {:.1} fps below target {}, delay now {:?}",
                    measured,
                    self.target_fps,
                    self.delay
                );
            }
        } else if measured > self.target_fps * RECOVER_THRESHOLD && self.delay < self.target {
            self.delay = (self.delay * GROW_TENTHS / 10).min(self.target);
        }
    }
}
