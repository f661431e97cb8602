//! HTTP glue for the relay: control endpoints, the MJPEG pull stream and the
//! push channel as a Server-Sent Events stream.
//!
//! Plain std networking. The accept loop runs on one thread with a
//! nonblocking listener; every accepted connection gets its own thread so
//! long-lived streams never hold up control requests.

use anyhow::{anyhow, Result};
use serde::Serialize;
use serde_json::json;
use std::io::{ErrorKind, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use crate::capture::CaptureController;
use crate::config::{PullSettings, RelayConfig};
use crate::encode::{encode_jpeg, placeholder_image};
use crate::frame::EncodedFrame;
use crate::hub::{Accept, Subscriber};
use crate::mjpeg::MjpegStream;

const MAX_REQUEST_BYTES: usize = 8192;
const ACCEPT_POLL: Duration = Duration::from_millis(50);
const REQUEST_READ_TIMEOUT: Duration = Duration::from_secs(2);
const STREAM_POLL: Duration = Duration::from_millis(100);
const EVENT_WRITE_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Clone, Debug)]
pub struct ApiConfig {
    pub addr: String,
    pub pull: PullSettings,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self::from_relay(&RelayConfig::default())
    }
}

impl ApiConfig {
    pub fn from_relay(config: &RelayConfig) -> Self {
        Self {
            addr: config.api_addr.clone(),
            pull: config.pull.clone(),
        }
    }
}

#[derive(Debug)]
pub struct ApiHandle {
    pub addr: SocketAddr,
    shutdown: Arc<AtomicBool>,
    join: Option<JoinHandle<()>>,
}

impl ApiHandle {
    /// Stop accepting, signal open streams, and join the accept thread.
    pub fn stop(mut self) -> Result<()> {
        self.shutdown.store(true, Ordering::SeqCst);
        if let Some(join) = self.join.take() {
            join.join()
                .map_err(|_| anyhow!("api server thread panicked"))?;
        }
        Ok(())
    }
}

pub struct ApiServer {
    cfg: ApiConfig,
    controller: Arc<CaptureController>,
}

impl ApiServer {
    pub fn new(cfg: ApiConfig, controller: Arc<CaptureController>) -> Self {
        Self { cfg, controller }
    }

    pub fn spawn(self) -> Result<ApiHandle> {
        let configured_addr: SocketAddr = self.cfg.addr.parse()?;
        let listener = TcpListener::bind(configured_addr)?;
        let addr = listener.local_addr()?;
        listener.set_nonblocking(true)?;

        let shutdown = Arc::new(AtomicBool::new(false));
        let shutdown_thread = Arc::clone(&shutdown);
        let ctx = Arc::new(Context {
            cfg: self.cfg,
            controller: self.controller,
            shutdown: shutdown_thread,
        });
        let join = std::thread::Builder::new()
            .name("relay-api".to_string())
            .spawn(move || {
                if let Err(err) = run_api(listener, ctx) {
                    log::error!("RelayApi: stopped: {}", err);
                }
            })?;
        log::info!("RelayApi: listening on http://{}", addr);

        Ok(ApiHandle {
            addr,
            shutdown,
            join: Some(join),
        })
    }
}

struct Context {
    cfg: ApiConfig,
    controller: Arc<CaptureController>,
    shutdown: Arc<AtomicBool>,
}

fn run_api(listener: TcpListener, ctx: Arc<Context>) -> Result<()> {
    loop {
        if ctx.shutdown.load(Ordering::SeqCst) {
            break;
        }
        match listener.accept() {
            Ok((stream, peer)) => {
                let ctx = Arc::clone(&ctx);
                let spawned = std::thread::Builder::new()
                    .name(format!("relay-conn-{peer}"))
                    .spawn(move || {
                        if let Err(err) = handle_connection(stream, &ctx) {
                            log::warn!("RelayApi: request from {} failed: {}", peer, err);
                        }
                    });
                if let Err(err) = spawned {
                    log::error!("RelayApi: cannot spawn connection thread: {}", err);
                }
            }
            Err(err) if err.kind() == ErrorKind::WouldBlock => {
                std::thread::sleep(ACCEPT_POLL);
                continue;
            }
            Err(err) => return Err(err.into()),
        }
    }
    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Route {
    Preflight,
    Banner,
    Status,
    Start,
    Stop,
    TestSource,
    TestEncoder,
    Ping,
    VideoFeed,
    Events,
    MethodNotAllowed,
    NotFound,
}

impl Route {
    fn resolve(method: &str, path: &str) -> Self {
        if method == "OPTIONS" {
            return Route::Preflight;
        }
        let (route, expected) = match path {
            "/" => (Route::Banner, "GET"),
            "/api/status" => (Route::Status, "GET"),
            "/api/stream/start" => (Route::Start, "POST"),
            "/api/stream/stop" => (Route::Stop, "POST"),
            "/api/test-rtsp" => (Route::TestSource, "GET"),
            "/api/test-connection" => (Route::TestEncoder, "GET"),
            "/api/ping" => (Route::Ping, "GET"),
            "/video_feed" => (Route::VideoFeed, "GET"),
            "/api/events" => (Route::Events, "GET"),
            _ => return Route::NotFound,
        };
        if method == expected {
            route
        } else {
            Route::MethodNotAllowed
        }
    }
}

fn handle_connection(mut stream: TcpStream, ctx: &Context) -> Result<()> {
    stream.set_nonblocking(false)?;
    let request = read_request(&mut stream)?;
    let route = Route::resolve(&request.method, &request.path);
    log::debug!("RelayApi: {} {} -> {:?}", request.method, request.path, route);

    let controller = &ctx.controller;
    match route {
        Route::Preflight => write_response(&mut stream, 204, "text/plain", b""),
        Route::Banner => write_json(
            &mut stream,
            200,
            &json!({
                "message": "RTSP relay",
                "version": env!("CARGO_PKG_VERSION"),
                "status": "running",
                "timestamp": crate::timestamp_now(),
            }),
        ),
        Route::Status => write_json(&mut stream, 200, &controller.status()),
        Route::Start => {
            let outcome = controller.start();
            let message = if outcome.started {
                "capture started"
            } else {
                "capture already running"
            };
            write_json(
                &mut stream,
                200,
                &json!({ "started": outcome.started, "message": message }),
            )
        }
        Route::Stop => {
            let outcome = controller.stop();
            let status = if outcome.stopped { 200 } else { 500 };
            write_json(&mut stream, status, &json!({ "stopped": outcome.stopped }))
        }
        Route::TestSource => {
            let report = controller.test_source_connection(controller.camera());
            write_json(&mut stream, 200, &report)
        }
        Route::TestEncoder => {
            let body = match encode_jpeg(placeholder_image(), ctx.cfg.pull.quality) {
                Ok(jpeg) => json!({ "ok": true, "detail": "encoder ready", "bytes": jpeg.len() }),
                Err(e) => json!({ "ok": false, "detail": e.to_string() }),
            };
            write_json(&mut stream, 200, &body)
        }
        Route::Ping => write_json(
            &mut stream,
            200,
            &json!({ "timestamp": crate::timestamp_now() }),
        ),
        Route::VideoFeed => serve_mjpeg(stream, ctx),
        Route::Events => serve_events(stream, ctx),
        Route::MethodNotAllowed => {
            write_json(&mut stream, 405, &json!({ "error": "method_not_allowed" }))
        }
        Route::NotFound => write_json(&mut stream, 404, &json!({ "error": "not_found" })),
    }
}

fn serve_mjpeg(mut stream: TcpStream, ctx: &Context) -> Result<()> {
    let mut mjpeg = MjpegStream::new(Arc::clone(ctx.controller.slot()), ctx.cfg.pull.clone());
    write_stream_head(&mut stream, &mjpeg.content_type())?;
    let chunks = mjpeg.run(&mut stream, &ctx.shutdown)?;
    log::info!("RelayApi: mjpeg consumer finished after {} chunks", chunks);
    let _ = stream.shutdown(Shutdown::Both);
    Ok(())
}

/// Push subscriber writing SSE `video_frame` events to one client.
struct EventStreamSubscriber {
    stream: TcpStream,
}

impl Subscriber for EventStreamSubscriber {
    fn accept(&mut self, frame: &EncodedFrame) -> Accept {
        let payload = json!({
            "frame": hex::encode(&frame.data),
            "timestamp": crate::rfc3339(frame.captured_at),
            "frame_number": frame.sequence,
        });
        match write_event(&mut self.stream, "video_frame", &payload) {
            Ok(()) => Accept::Delivered,
            Err(e) => {
                log::debug!("RelayApi: event consumer gone: {}", e);
                Accept::Closed
            }
        }
    }
}

fn serve_events(mut stream: TcpStream, ctx: &Context) -> Result<()> {
    let hub = ctx.controller.hub();
    write_stream_head(&mut stream, "text/event-stream")?;
    write_event(&mut stream, "status_update", &ctx.controller.status())?;

    let writer = stream.try_clone()?;
    writer.set_write_timeout(Some(EVENT_WRITE_TIMEOUT))?;
    let id = hub.register(EventStreamSubscriber { stream: writer })?;

    // Reads only detect the client hanging up; SSE clients send nothing.
    stream.set_read_timeout(Some(STREAM_POLL))?;
    let mut buf = [0u8; 256];
    while !ctx.shutdown.load(Ordering::SeqCst) && hub.is_registered(id) {
        match stream.read(&mut buf) {
            Ok(0) => break,
            Ok(_) => continue,
            Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => {}
            Err(_) => break,
        }
    }

    hub.unregister(id);
    let _ = stream.shutdown(Shutdown::Both);
    Ok(())
}

fn write_event<T: Serialize + ?Sized>(
    stream: &mut TcpStream,
    event: &str,
    data: &T,
) -> Result<()> {
    let data = serde_json::to_string(data)?;
    stream.write_all(format!("event: {event}\ndata: {data}\n\n").as_bytes())?;
    stream.flush()?;
    Ok(())
}

fn write_stream_head(stream: &mut TcpStream, content_type: &str) -> Result<()> {
    let header = format!(
        "HTTP/1.1 200 OK\r\nContent-Type: {content_type}\r\nCache-Control: no-cache, no-store\r\n\
         Connection: close\r\nAccess-Control-Allow-Origin: *\r\n\r\n"
    );
    stream.write_all(header.as_bytes())?;
    stream.flush()?;
    Ok(())
}

fn read_request(stream: &mut TcpStream) -> Result<HttpRequest> {
    stream.set_read_timeout(Some(REQUEST_READ_TIMEOUT))?;
    let mut buf = [0u8; 1024];
    let mut data = Vec::new();
    loop {
        let n = stream.read(&mut buf)?;
        if n == 0 {
            break;
        }
        data.extend_from_slice(&buf[..n]);
        if data.len() > MAX_REQUEST_BYTES {
            return Err(anyhow!("request too large"));
        }
        if data.windows(4).any(|w| w == b"\r\n\r\n") {
            break;
        }
    }
    // Headers and body are not needed by any route.
    let text = String::from_utf8_lossy(&data);
    let request_line = text
        .split("\r\n")
        .next()
        .filter(|line| !line.is_empty())
        .ok_or_else(|| anyhow!("empty request"))?;
    let mut parts = request_line.split_whitespace();
    let method = parts.next().ok_or_else(|| anyhow!("missing method"))?;
    let raw_path = parts.next().ok_or_else(|| anyhow!("missing path"))?;
    let path = raw_path.split('?').next().unwrap_or(raw_path).to_string();
    Ok(HttpRequest {
        method: method.to_ascii_uppercase(),
        path,
    })
}

fn write_json<T: Serialize + ?Sized>(
    stream: &mut TcpStream,
    status: u16,
    body: &T,
) -> Result<()> {
    let payload = serde_json::to_vec(body)?;
    write_response(stream, status, "application/json", &payload)
}

fn write_response(
    stream: &mut TcpStream,
    status: u16,
    content_type: &str,
    body: &[u8],
) -> Result<()> {
    let status_line = match status {
        200 => "HTTP/1.1 200 OK",
        204 => "HTTP/1.1 204 No Content",
        400 => "HTTP/1.1 400 Bad Request",
        404 => "HTTP/1.1 404 Not Found",
        405 => "HTTP/1.1 405 Method Not Allowed",
        _ => "HTTP/1.1 500 Internal Server Error",
    };
    let header = format!(
        "{status_line}\r\nContent-Type: {content_type}\r\nContent-Length: {len}\r\n\
         Cache-Control: no-store\r\nConnection: close\r\n\
         Access-Control-Allow-Origin: *\r\n\
         Access-Control-Allow-Methods: GET, POST, OPTIONS\r\n\
         Access-Control-Allow-Headers: Content-Type\r\n\r\n",
        len = body.len()
    );
    stream.write_all(header.as_bytes())?;
    stream.write_all(body)?;
    stream.flush()?;
    Ok(())
}

#[derive(Debug)]
struct HttpRequest {
    method: String,
    path: String,
}
