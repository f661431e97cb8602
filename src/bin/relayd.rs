//! relayd - RTSP camera relay daemon
//!
//! This daemon:
//! 1. Loads the relay configuration (file named by RELAY_CONFIG, then env)
//! 2. Serves the control API, the MJPEG pull stream and the SSE push stream
//! 3. Optionally starts capture at boot
//! 4. Stops capture and the API server on Ctrl-C

use anyhow::{anyhow, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::{mpsc, Arc};

use rtsp_relay::{ApiConfig, ApiServer, CaptureController, RelayConfig, RtspConnector};

#[derive(Parser, Debug)]
#[command(author, version, about = "Relay one RTSP camera to MJPEG and SSE consumers")]
struct Args {
    /// JSON or TOML config file. Overrides RELAY_CONFIG.
    #[arg(long, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Listen address for the HTTP API, e.g. 0.0.0.0:5000.
    #[arg(long, value_name = "ADDR")]
    addr: Option<String>,

    /// Start capture immediately instead of waiting for /api/stream/start.
    #[arg(long, env = "RELAY_AUTOSTART")]
    autostart: bool,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => RelayConfig::load_from(Some(path.as_path()))?,
        None => RelayConfig::load()?,
    };
    if let Some(addr) = args.addr {
        config.api_addr = addr;
    }

    let controller = Arc::new(CaptureController::new(
        &config,
        Arc::new(RtspConnector::new()),
    ));
    let api_handle =
        ApiServer::new(ApiConfig::from_relay(&config), Arc::clone(&controller)).spawn()?;
    log::info!(
        "relayd running. source {} ({}x{} @ {} fps, push {} fps, mjpeg {} fps)",
        config.camera.redacted_url(),
        config.camera.width,
        config.camera.height,
        config.camera.fps,
        config.camera.push_fps(),
        config.pull.fps
    );
    log::info!("  status:     http://{}/api/status", api_handle.addr);
    log::info!("  mjpeg:      http://{}/video_feed", api_handle.addr);
    log::info!("  sse events: http://{}/api/events", api_handle.addr);

    if args.autostart {
        controller.start();
    }

    let (tx, rx) = mpsc::channel();
    ctrlc::set_handler(move || {
        let _ = tx.send(());
    })
    .map_err(|e| anyhow!("error setting Ctrl-C handler: {e}"))?;

    log::info!("relayd waiting for shutdown signal (Ctrl-C)...");
    let _ = rx.recv();
    log::info!("shutdown signal received, stopping capture and API server...");
    if !controller.stop().stopped {
        log::warn!("capture worker did not exit in time");
    }
    api_handle.stop()?;

    Ok(())
}
