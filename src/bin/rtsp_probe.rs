//! rtsp_probe - one-shot camera connectivity check
//!
//! Opens the configured source, reads a single frame and reports the result.
//! Exits non-zero when no frame could be read.

use anyhow::{anyhow, Result};
use clap::Parser;
use std::path::PathBuf;

use rtsp_relay::{probe_source, Credentials, RelayConfig, RtspConnector};

#[derive(Parser, Debug)]
#[command(author, version, about = "Probe an RTSP camera by reading one frame")]
struct Args {
    /// JSON or TOML config file. Overrides RELAY_CONFIG.
    #[arg(long, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Source URI; overrides the configured one.
    #[arg(long, value_name = "URI")]
    url: Option<String>,

    #[arg(long, env = "RTSP_USERNAME")]
    username: Option<String>,

    #[arg(long, env = "RTSP_PASSWORD", hide_env_values = true)]
    password: Option<String>,

    /// Print the report as JSON.
    #[arg(long)]
    json: bool,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();
    let args = Args::parse();

    let config = match &args.config {
        Some(path) => RelayConfig::load_from(Some(path.as_path()))?,
        None => RelayConfig::load()?,
    };
    let mut camera = config.camera;
    if let Some(url) = args.url {
        camera.url = url;
    }
    if let Some(username) = args.username {
        camera.credentials = Some(Credentials {
            username,
            password: args.password.unwrap_or_default(),
        });
    }

    let report = probe_source(&RtspConnector::new(), &camera);
    if args.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        println!(
            "{} {}: {}",
            if report.ok { "OK" } else { "FAIL" },
            camera.redacted_url(),
            report.detail
        );
    }

    if report.ok {
        Ok(())
    } else {
        Err(anyhow!("no frame received from {}", camera.redacted_url()))
    }
}
