//! Pull stream generator: multipart MJPEG drawn from the shared frame slot.
//!
//! One `MjpegStream` per pull consumer. It never touches the capture loop or
//! the push hub; it only snapshots the slot at its own pace.

use bytes::{BufMut, Bytes, BytesMut};
use std::io::Write;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use crate::config::PullSettings;
use crate::encode::{encode_jpeg, placeholder_image, EncodeError};
use crate::frame::FrameSlot;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Source {
    Frame(u64),
    Placeholder,
}

/// Build one multipart chunk around a JPEG payload.
pub fn frame_chunk(boundary: &str, jpeg: &[u8]) -> Bytes {
    let header = format!("--{boundary}\r\nContent-Type: image/jpeg\r\n\r\n");
    let mut chunk = BytesMut::with_capacity(header.len() + jpeg.len() + 2);
    chunk.put_slice(header.as_bytes());
    chunk.put_slice(jpeg);
    chunk.put_slice(b"\r\n");
    chunk.freeze()
}

pub struct MjpegStream {
    slot: Arc<FrameSlot>,
    settings: PullSettings,
    /// Last emitted chunk; reused while the slot still holds the same frame.
    cached: Option<(Source, Bytes)>,
    next_due: Option<Instant>,
    chunks: u64,
    finished: bool,
}

impl MjpegStream {
    pub fn new(slot: Arc<FrameSlot>, settings: PullSettings) -> Self {
        Self {
            slot,
            settings,
            cached: None,
            next_due: None,
            chunks: 0,
            finished: false,
        }
    }

    /// `Content-Type` header value for the response carrying this stream.
    pub fn content_type(&self) -> String {
        format!(
            "multipart/x-mixed-replace; boundary={}",
            self.settings.boundary
        )
    }

    pub fn chunks_emitted(&self) -> u64 {
        self.chunks
    }

    /// Encode the current slot contents into a chunk, without pacing.
    ///
    /// A frame that fails to encode is replaced by the placeholder; only a
    /// placeholder failure is returned as an error.
    pub fn next_chunk(&mut self) -> Result<Bytes, EncodeError> {
        let frame = self.slot.get();
        let source = match &frame {
            Some(frame) => Source::Frame(frame.sequence),
            None => Source::Placeholder,
        };
        if let Some((cached, chunk)) = &self.cached {
            if *cached == source {
                self.chunks += 1;
                return Ok(chunk.clone());
            }
        }

        // A frame that fails to encode is cached under its own sequence, so
        // the failure is logged once rather than on every tick.
        let jpeg = match frame {
            Some(frame) => match encode_jpeg(frame.image(), self.settings.quality) {
                Ok(jpeg) => jpeg,
                Err(e) => {
                    log::warn!(
                        "MjpegStream: frame {} not encodable, sending placeholder: {}",
                        frame.sequence,
                        e
                    );
                    self.placeholder_jpeg()?
                }
            },
            None => self.placeholder_jpeg()?,
        };

        let chunk = frame_chunk(&self.settings.boundary, &jpeg);
        self.cached = Some((source, chunk.clone()));
        self.chunks += 1;
        Ok(chunk)
    }

    /// Write chunks to `out` at the pull rate until the consumer goes away,
    /// `shutdown` is raised, or the placeholder cannot be encoded.
    pub fn run<W: Write>(
        &mut self,
        out: &mut W,
        shutdown: &AtomicBool,
    ) -> Result<u64, EncodeError> {
        while !shutdown.load(Ordering::SeqCst) {
            self.wait_turn();
            let chunk = self.next_chunk()?;
            if let Err(e) = out.write_all(&chunk).and_then(|()| out.flush()) {
                log::debug!(
                    "MjpegStream: consumer gone after {} chunks: {}",
                    self.chunks,
                    e
                );
                break;
            }
        }
        Ok(self.chunks)
    }

    fn placeholder_jpeg(&self) -> Result<Vec<u8>, EncodeError> {
        encode_jpeg(placeholder_image(), self.settings.quality)
    }

    /// Sleep until the next pull interval boundary.
    fn wait_turn(&mut self) {
        let interval = self.settings.interval();
        let now = Instant::now();
        if let Some(due) = self.next_due {
            if due > now {
                std::thread::sleep(due - now);
            }
        }
        // Late iterations re-anchor instead of bursting to catch up.
        let base = self.next_due.map_or(now, |due| due.max(now));
        self.next_due = Some(base + interval);
    }
}

/// Endless paced sequence; ends after the first unrecoverable error.
impl Iterator for MjpegStream {
    type Item = Result<Bytes, EncodeError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.finished {
            return None;
        }
        self.wait_turn();
        let item = self.next_chunk();
        if item.is_err() {
            self.finished = true;
        }
        Some(item)
    }
}

impl std::fmt::Debug for MjpegStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MjpegStream")
            .field("boundary", &self.settings.boundary)
            .field("interval", &self.settings.interval())
            .field("chunks", &self.chunks)
            .finish()
    }
}
