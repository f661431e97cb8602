//! Source connector: owns the connection to the upstream camera.
//!
//! A `SourceConnector` opens `FrameStream`s; `open` wraps a stream in a
//! `ConnectionHandle`, the only thing the capture loop reads from.
//!
//! The handle guarantees:
//! - `close` is idempotent and releases the backend exactly once
//! - once closed, `read_frame` returns `SourceError::Closed` without touching the backend
//! - a `HandleCloser` taken from the handle can close it from another thread,
//!   interrupting a blocked read through the backend's interrupt hook
//!
//! Reconnection policy (`ReconnectPolicy`) also lives here: the capture loop
//! asks it when to reopen, how long to back off, and when to give up.

pub mod rtsp;

pub use rtsp::RtspConnector;

use image::RgbImage;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

use crate::config::{CameraConfig, CaptureSettings};

const BASE_BACKOFF: Duration = Duration::from_millis(10);
const MAX_BACKOFF: Duration = Duration::from_millis(500);

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SourceError {
    /// Transport could not be established. Terminal for this attempt.
    #[error("connect failed: {0}")]
    ConnectFailed(String),
    /// Transient; the caller may retry.
    #[error("read failed: {0}")]
    ReadFailed(String),
    /// Terminal for this handle.
    #[error("stream ended")]
    StreamEnded,
    /// The handle was closed locally.
    #[error("connection closed")]
    Closed,
}

/// Unblocks an in-flight `FrameStream::read` from another thread.
pub type Interrupter = Arc<dyn Fn() + Send + Sync>;

pub trait SourceConnector: Send + Sync {
    /// Establish one upstream connection, applying the resolution and frame
    /// rate hints from `config` before the first read.
    fn connect(&self, config: &CameraConfig) -> Result<Box<dyn FrameStream>, SourceError>;
}

pub trait FrameStream: Send {
    /// Decode the next frame. Delivered size may differ from the hints.
    fn read(&mut self) -> Result<RgbImage, SourceError>;

    fn interrupter(&self) -> Option<Interrupter> {
        None
    }

    /// Release the underlying transport. Called at most once by `ConnectionHandle`.
    fn shutdown(&mut self);
}

/// Open a handle on `connector`.
pub fn open(
    connector: &dyn SourceConnector,
    config: &CameraConfig,
) -> Result<ConnectionHandle, SourceError> {
    let stream = connector.connect(config)?;
    Ok(ConnectionHandle::new(stream))
}

/// One live upstream connection.
pub struct ConnectionHandle {
    stream: Box<dyn FrameStream>,
    closer: HandleCloser,
    released: bool,
}

impl ConnectionHandle {
    fn new(stream: Box<dyn FrameStream>) -> Self {
        let closer = HandleCloser {
            closed: Arc::new(AtomicBool::new(false)),
            interrupt: stream.interrupter(),
        };
        Self {
            stream,
            closer,
            released: false,
        }
    }

    pub fn read_frame(&mut self) -> Result<RgbImage, SourceError> {
        if self.closer.is_closed() {
            return Err(SourceError::Closed);
        }
        let result = self.stream.read();
        // A close that raced the read wins; its frame is discarded.
        if self.closer.is_closed() {
            return Err(SourceError::Closed);
        }
        result
    }

    pub fn closer(&self) -> HandleCloser {
        self.closer.clone()
    }

    pub fn is_closed(&self) -> bool {
        self.closer.is_closed()
    }

    pub fn close(&mut self) {
        self.closer.close();
        if !self.released {
            self.released = true;
            self.stream.shutdown();
        }
    }
}

impl Drop for ConnectionHandle {
    fn drop(&mut self) {
        self.close();
    }
}

impl fmt::Debug for ConnectionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionHandle")
            .field("closed", &self.is_closed())
            .field("released", &self.released)
            .finish()
    }
}

/// Cross-thread close for a `ConnectionHandle`.
#[derive(Clone)]
pub struct HandleCloser {
    closed: Arc<AtomicBool>,
    interrupt: Option<Interrupter>,
}

impl HandleCloser {
    pub fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            if let Some(interrupt) = &self.interrupt {
                interrupt();
            }
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

impl fmt::Debug for HandleCloser {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandleCloser")
            .field("closed", &self.is_closed())
            .field("interruptible", &self.interrupt.is_some())
            .finish()
    }
}

/// When to reopen, how long to wait, and when to give up.
///
/// `failures` is the count of consecutive connect or read failures in the
/// current run; any successful read resets it.
#[derive(Clone, Debug)]
pub struct ReconnectPolicy {
    pub retry_budget: u32,
    pub reconnect_after: u32,
    pub base_backoff: Duration,
    pub max_backoff: Duration,
}

impl ReconnectPolicy {
    pub fn from_settings(settings: &CaptureSettings) -> Self {
        Self {
            retry_budget: settings.retry_budget,
            reconnect_after: settings.reconnect_after.max(1),
            base_backoff: BASE_BACKOFF,
            max_backoff: MAX_BACKOFF,
        }
    }

    pub fn exhausted(&self, failures: u32) -> bool {
        failures > self.retry_budget
    }

    pub fn should_reconnect(&self, failures: u32) -> bool {
        failures > 0 && failures % self.reconnect_after == 0
    }

    /// Exponential backoff, doubling per consecutive failure.
    pub fn backoff(&self, failures: u32) -> Duration {
        let shift = failures.saturating_sub(1).min(16);
        self.base_backoff
            .saturating_mul(1u32 << shift)
            .min(self.max_backoff)
    }
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self::from_settings(&CaptureSettings::default())
    }
}
