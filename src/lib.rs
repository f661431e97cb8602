//! RTSP camera relay.
//!
//! One upstream camera, many downstream consumers:
//!
//! ```text
//!   SourceConnector ──▶ capture loop ──┬──▶ FrameSlot ──▶ MjpegStream (per pull consumer)
//!                                      └──▶ PushHub   ──▶ Subscriber  (per push consumer)
//! ```
//!
//! # Module Structure
//!
//! - `ingest`: source connector, connection handles and reconnection policy
//! - `capture`: capture controller (start/stop/status/probe) and capture loop
//! - `frame`: `Frame`, `EncodedFrame` and the shared latest-frame slot
//! - `hub`: push fan-out with per-subscriber bounded delivery
//! - `mjpeg`: pull stream generator (multipart JPEG)
//! - `encode`: JPEG codec and the placeholder image
//! - `api`: HTTP control surface, MJPEG and SSE endpoints
//! - `config`: layered configuration

use chrono::{DateTime, SecondsFormat, Utc};
use std::time::SystemTime;

pub mod api;
pub mod capture;
pub mod config;
pub mod encode;
pub mod frame;
pub mod hub;
pub mod ingest;
pub mod mjpeg;

pub use api::{ApiConfig, ApiHandle, ApiServer};
pub use capture::{
    probe_source, CaptureController, CaptureState, CaptureStatus, ProbeReport, StartOutcome,
    StopOutcome,
};
pub use config::{CameraConfig, Credentials, RelayConfig};
pub use encode::EncodeError;
pub use frame::{EncodedFrame, Frame, FrameSlot};
pub use hub::{Accept, PublishReport, PushHub, Subscriber, SubscriberId};
pub use ingest::{
    ConnectionHandle, FrameStream, ReconnectPolicy, RtspConnector, SourceConnector, SourceError,
};
pub use mjpeg::MjpegStream;

/// RFC 3339 UTC with millisecond precision.
pub(crate) fn rfc3339(at: SystemTime) -> String {
    DateTime::<Utc>::from(at).to_rfc3339_opts(SecondsFormat::Millis, true)
}

pub(crate) fn timestamp_now() -> String {
    rfc3339(SystemTime::now())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{Duration, UNIX_EPOCH};

    #[test]
    fn rfc3339_is_utc_millis() {
        let at = UNIX_EPOCH + Duration::from_millis(1_700_000_000_123);
        assert_eq!(rfc3339(at), "2023-11-14T22:13:20.123Z");
    }
}
