//! Frame types and the shared latest-frame slot.
//!
//! - `Frame`: immutable decoded RGB image with a sequence number and capture time.
//! - `EncodedFrame`: JPEG bytes derived from a `Frame`; cheap to clone for fan-out.
//! - `FrameSlot`: single-writer/multi-reader holder of the most recent `Frame`.
//!
//! The capture loop is the only writer of a `FrameSlot`. Readers get an
//! `Arc<Frame>` snapshot, so a concurrent `set` can never hand out a partially
//! written image.

use bytes::Bytes;
use image::RgbImage;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::{Duration, Instant, SystemTime};

/// A decoded frame. Never mutated after construction.
#[derive(Debug)]
pub struct Frame {
    pub sequence: u64,
    /// Wall-clock capture time, reported to consumers.
    pub captured_at: SystemTime,
    /// Monotonic capture instant, used for freshness checks.
    captured_instant: Instant,
    image: RgbImage,
}

impl Frame {
    pub fn new(sequence: u64, image: RgbImage) -> Self {
        Self {
            sequence,
            captured_at: SystemTime::now(),
            captured_instant: Instant::now(),
            image,
        }
    }

    pub fn image(&self) -> &RgbImage {
        &self.image
    }

    pub fn width(&self) -> u32 {
        self.image.width()
    }

    pub fn height(&self) -> u32 {
        self.image.height()
    }

    pub fn age(&self) -> Duration {
        self.captured_instant.elapsed()
    }
}

/// A compressed frame, transient: built for one publish and then dropped.
///
/// `data` is reference counted, so every subscriber shares one allocation.
#[derive(Debug, Clone)]
pub struct EncodedFrame {
    pub sequence: u64,
    pub captured_at: SystemTime,
    pub width: u32,
    pub height: u32,
    pub data: Bytes,
}

impl EncodedFrame {
    pub fn new(frame: &Frame, data: Vec<u8>) -> Self {
        Self {
            sequence: frame.sequence,
            captured_at: frame.captured_at,
            width: frame.width(),
            height: frame.height(),
            data: Bytes::from(data),
        }
    }
}

/// Holds zero or one `Frame`, the latest captured.
#[derive(Debug, Default)]
pub struct FrameSlot {
    latest: RwLock<Option<Arc<Frame>>>,
}

impl FrameSlot {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the held frame. The write lock only covers a pointer swap.
    pub fn set(&self, frame: Frame) {
        let frame = Arc::new(frame);
        let previous = {
            let mut latest = self.latest.write().unwrap_or_else(PoisonError::into_inner);
            latest.replace(frame)
        };
        // Old frame is released outside the lock.
        drop(previous);
    }

    /// Snapshot of the latest frame, if any.
    pub fn get(&self) -> Option<Arc<Frame>> {
        self.latest
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn clear(&self) {
        let previous = self
            .latest
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        drop(previous);
    }

    pub fn is_empty(&self) -> bool {
        self.latest
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .is_none()
    }

    /// Age of the held frame in milliseconds.
    pub fn last_frame_age_ms(&self) -> Option<u64> {
        self.get()
            .map(|frame| frame.age().as_millis().min(u64::MAX as u128) as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    fn solid(sequence: u64, value: u8) -> Frame {
        Frame::new(sequence, RgbImage::from_pixel(8, 4, image::Rgb([value; 3])))
    }

    #[test]
    fn empty_slot_reports_no_age() {
        let slot = FrameSlot::new();
        assert!(slot.is_empty());
        assert!(slot.get().is_none());
        assert!(slot.last_frame_age_ms().is_none());
    }

    #[test]
    fn set_replaces_and_snapshot_survives() {
        let slot = FrameSlot::new();
        slot.set(solid(1, 10));
        let first = slot.get().unwrap();
        slot.set(solid(2, 20));

        // The earlier snapshot is unaffected by the overwrite.
        assert_eq!(first.sequence, 1);
        assert_eq!(first.image().get_pixel(0, 0).0, [10; 3]);
        assert_eq!(slot.get().unwrap().sequence, 2);
    }

    #[test]
    fn clear_empties_slot() {
        let slot = FrameSlot::new();
        slot.set(solid(1, 0));
        slot.clear();
        assert!(slot.is_empty());
    }

    #[test]
    fn concurrent_readers_never_see_torn_frames() {
        let slot = Arc::new(FrameSlot::new());
        slot.set(solid(0, 0));

        let writer = {
            let slot = Arc::clone(&slot);
            thread::spawn(move || {
                for seq in 1..=500u64 {
                    slot.set(solid(seq, (seq % 256) as u8));
                }
            })
        };
        let readers: Vec<_> = (0..4)
            .map(|_| {
                let slot = Arc::clone(&slot);
                thread::spawn(move || {
                    let mut last_seq = 0;
                    for _ in 0..500 {
                        let frame = slot.get().expect("slot never empties");
                        let expected = (frame.sequence % 256) as u8;
                        assert!(frame.image().pixels().all(|p| p.0 == [expected; 3]));
                        assert!(frame.sequence >= last_seq);
                        last_seq = frame.sequence;
                    }
                })
            })
            .collect();

        writer.join().unwrap();
        for reader in readers {
            reader.join().unwrap();
        }
    }

    #[test]
    fn encoded_frame_carries_frame_metadata() {
        let frame = solid(42, 1);
        let encoded = EncodedFrame::new(&frame, vec![0xFF, 0xD8]);
        assert_eq!(encoded.sequence, 42);
        assert_eq!(encoded.captured_at, frame.captured_at);
        assert_eq!((encoded.width, encoded.height), (8, 4));
        assert_eq!(&encoded.data[..], &[0xFF, 0xD8]);
    }
}
