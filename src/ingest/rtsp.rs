//! RTSP source connector.
//!
//! `RtspConnector` dispatches on the URI scheme:
//! - `stub://...` opens a synthetic moving test pattern (always connects).
//!   `stub://camera?frames=N` ends the stream after N frames.
//! - `rtsp://` / `rtsps://` opens a GStreamer pipeline (feature: rtsp-gstreamer).
//!
//! The connector never retains frames; each decoded image is handed to the
//! caller and forgotten.

use image::{Rgb, RgbImage};
use url::Url;

use super::{FrameStream, SourceConnector, SourceError};
use crate::config::CameraConfig;

#[cfg(feature = "rtsp-gstreamer")]
use super::Interrupter;
#[cfg(feature = "rtsp-gstreamer")]
use std::time::Duration;

/// Scheme-dispatching connector used by the daemon.
#[derive(Clone, Debug, Default)]
pub struct RtspConnector;

impl RtspConnector {
    pub fn new() -> Self {
        Self
    }
}

impl SourceConnector for RtspConnector {
    fn connect(&self, config: &CameraConfig) -> Result<Box<dyn FrameStream>, SourceError> {
        let location = config
            .source_url()
            .map_err(|e| SourceError::ConnectFailed(e.to_string()))?;
        let url = Url::parse(&location).map_err(|e| SourceError::ConnectFailed(e.to_string()))?;
        match url.scheme() {
            "stub" => {
                let frame_limit = url
                    .query_pairs()
                    .find(|(k, _)| k == "frames")
                    .and_then(|(_, v)| v.parse().ok());
                log::info!(
                    "RtspSource: connected to {} (synthetic)",
                    config.redacted_url()
                );
                Ok(Box::new(SyntheticStream::new(config, frame_limit)))
            }
            "rtsp" | "rtsps" => {
                #[cfg(feature = "rtsp-gstreamer")]
                {
                    let stream = GstreamerStream::connect(config, &location)?;
                    log::info!("RtspSource: connected to {}", config.redacted_url());
                    Ok(Box::new(stream))
                }
                #[cfg(not(feature = "rtsp-gstreamer"))]
                {
                    Err(SourceError::ConnectFailed(
                        "RTSP requires the rtsp-gstreamer feature".to_string(),
                    ))
                }
            }
            other => Err(SourceError::ConnectFailed(format!(
                "unsupported source scheme '{other}'; expected rtsp or stub"
            ))),
        }
    }
}

// ----------------------------------------------------------------------------
// Synthetic source (stub://)
// ----------------------------------------------------------------------------

struct SyntheticStream {
    width: u32,
    height: u32,
    frame_count: u64,
    frame_limit: Option<u64>,
}

impl SyntheticStream {
    fn new(config: &CameraConfig, frame_limit: Option<u64>) -> Self {
        Self {
            width: config.width,
            height: config.height,
            frame_count: 0,
            frame_limit,
        }
    }
}

impl FrameStream for SyntheticStream {
    fn read(&mut self) -> Result<RgbImage, SourceError> {
        if let Some(limit) = self.frame_limit {
            if self.frame_count >= limit {
                return Err(SourceError::StreamEnded);
            }
        }
        self.frame_count += 1;

        // Diagonal bands drifting one pixel per frame.
        let shift = (self.frame_count % 256) as u32;
        let image = RgbImage::from_fn(self.width, self.height, |x, y| {
            let band = (x % 256 + y % 256 + shift) % 256;
            Rgb([band as u8, (x % 256) as u8, (y % 256) as u8])
        });
        Ok(image)
    }

    fn shutdown(&mut self) {
        log::debug!(
            "RtspSource: synthetic stream closed after {} frames",
            self.frame_count
        );
    }
}

// ----------------------------------------------------------------------------
// GStreamer RTSP source
// ----------------------------------------------------------------------------

#[cfg(feature = "rtsp-gstreamer")]
const CONNECT_TIMEOUT_SECS: u64 = 10;

#[cfg(feature = "rtsp-gstreamer")]
struct GstreamerStream {
    pipeline: gstreamer::Pipeline,
    appsink: gstreamer_app::AppSink,
    frame_timeout: Duration,
}

#[cfg(feature = "rtsp-gstreamer")]
impl GstreamerStream {
    /// rtspsrc ! decodebin ! videoconvert ! videoscale ! videorate ! caps ! appsink
    ///
    /// Resolution and rate are requested through caps; upstream may still
    /// deliver something else if negotiation fails over.
    fn connect(config: &CameraConfig, location: &str) -> Result<Self, SourceError> {
        use gstreamer::prelude::*;

        let fail = |what: &str, e: &dyn std::fmt::Display| {
            SourceError::ConnectFailed(format!("{what}: {e}"))
        };

        gstreamer::init().map_err(|e| fail("initialize gstreamer", &e))?;

        let description = format!(
            "rtspsrc location=\"{location}\" latency=0 ! decodebin ! videoconvert ! videoscale ! \
             videorate ! video/x-raw,format=RGB,width={w},height={h},framerate={fps}/1 ! \
             appsink name=appsink sync=false max-buffers=1 drop=true",
            w = config.width,
            h = config.height,
            fps = config.fps,
        );
        let pipeline = gstreamer::parse::launch(&description)
            .map_err(|e| fail("build RTSP pipeline", &e))?
            .downcast::<gstreamer::Pipeline>()
            .map_err(|_| SourceError::ConnectFailed("RTSP pipeline is not a Pipeline".into()))?;

        let appsink = pipeline
            .by_name("appsink")
            .ok_or_else(|| SourceError::ConnectFailed("appsink element missing".into()))?
            .downcast::<gstreamer_app::AppSink>()
            .map_err(|_| SourceError::ConnectFailed("appsink has unexpected type".into()))?;

        pipeline
            .set_state(gstreamer::State::Playing)
            .map_err(|e| fail("set RTSP pipeline to Playing", &e))?;
        let (result, current, _pending) =
            pipeline.state(gstreamer::ClockTime::from_seconds(CONNECT_TIMEOUT_SECS));
        if let Err(e) = result {
            let _ = pipeline.set_state(gstreamer::State::Null);
            return Err(fail("RTSP pipeline failed to start", &e));
        }
        if current != gstreamer::State::Playing {
            let _ = pipeline.set_state(gstreamer::State::Null);
            return Err(SourceError::ConnectFailed(format!(
                "RTSP pipeline not playing after {CONNECT_TIMEOUT_SECS}s (state {current:?})"
            )));
        }

        Ok(Self {
            pipeline,
            appsink,
            frame_timeout: frame_timeout(config.fps),
        })
    }

    fn poll_bus(&self) -> Result<(), SourceError> {
        use gstreamer::prelude::*;

        let Some(bus) = self.pipeline.bus() else {
            return Ok(());
        };
        while let Some(message) = bus.pop() {
            use gstreamer::MessageView;
            match message.view() {
                MessageView::Error(err) => {
                    return Err(SourceError::ReadFailed(format!(
                        "gstreamer error from {:?}: {}",
                        err.src().map(|s| s.path_string()),
                        err.error()
                    )));
                }
                MessageView::Eos(..) => return Err(SourceError::StreamEnded),
                _ => {}
            }
        }
        Ok(())
    }
}

#[cfg(feature = "rtsp-gstreamer")]
impl FrameStream for GstreamerStream {
    fn read(&mut self) -> Result<RgbImage, SourceError> {
        self.poll_bus()?;

        let timeout = gstreamer::ClockTime::from_mseconds(self.frame_timeout.as_millis() as u64);
        let Some(sample) = self.appsink.try_pull_sample(timeout) else {
            if self.appsink.is_eos() {
                return Err(SourceError::StreamEnded);
            }
            return Err(SourceError::ReadFailed("RTSP stream stalled".to_string()));
        };
        sample_to_image(&sample)
    }

    fn interrupter(&self) -> Option<Interrupter> {
        use gstreamer::prelude::*;

        let pipeline = self.pipeline.clone();
        Some(std::sync::Arc::new(move || {
            let _ = pipeline.set_state(gstreamer::State::Null);
        }))
    }

    fn shutdown(&mut self) {
        use gstreamer::prelude::*;

        let _ = self.pipeline.set_state(gstreamer::State::Null);
        log::info!("RtspSource: pipeline released");
    }
}

#[cfg(feature = "rtsp-gstreamer")]
fn frame_timeout(target_fps: u32) -> Duration {
    let base_ms = if target_fps == 0 {
        500
    } else {
        (1000 / target_fps).saturating_mul(4)
    };
    Duration::from_millis(base_ms.max(500) as u64)
}

#[cfg(feature = "rtsp-gstreamer")]
fn sample_to_image(sample: &gstreamer::Sample) -> Result<RgbImage, SourceError> {
    let read_err = |msg: &str| SourceError::ReadFailed(msg.to_string());

    let buffer = sample
        .buffer()
        .ok_or_else(|| read_err("RTSP sample missing buffer"))?;
    let caps = sample
        .caps()
        .ok_or_else(|| read_err("RTSP sample missing caps"))?;
    let info = gstreamer_video::VideoInfo::from_caps(caps)
        .map_err(|_| read_err("RTSP caps are not raw video"))?;

    let width = info.width();
    let height = info.height();
    let row_bytes = (width as usize) * 3;
    let stride = info.stride()[0] as usize;

    let map = buffer
        .map_readable()
        .map_err(|_| read_err("RTSP buffer not readable"))?;
    let data = map.as_slice();

    let pixels = if stride == row_bytes {
        data.get(..row_bytes * height as usize)
            .ok_or_else(|| read_err("RTSP buffer shorter than frame"))?
            .to_vec()
    } else {
        let mut pixels = Vec::with_capacity(row_bytes * height as usize);
        for row in 0..height as usize {
            let start = row * stride;
            pixels.extend_from_slice(
                data.get(start..start + row_bytes)
                    .ok_or_else(|| read_err("RTSP buffer row is out of bounds"))?,
            );
        }
        pixels
    };

    RgbImage::from_raw(width, height, pixels).ok_or_else(|| read_err("RTSP frame size mismatch"))
}
