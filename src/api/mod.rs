//! HTTP surface.
//!
//! A small blocking HTTP/1.1 server on `std::net`. The listener thread accepts
//! connections and hands each one to its own thread, so a long-lived
//! `/video_feed` client never delays the query endpoints. At most
//! `max_connections` are served at once; beyond that clients get `503`.
//! Accept failures (descriptor exhaustion, aborted handshakes) are logged and
//! retried; only shutdown ends the listener. Every response carries
//! `Access-Control-Allow-Origin: *` and closes the connection.
//!
//! Routes (GET only):
//! - `/video_feed`: multipart JPEG stream of the latest annotated frame
//! - `/api/latest_detected_image`: latest positive frame as base64 JPEG
//! - `/api/status`: service status
//! - `/api/saved_images`: saved detection filenames, newest first
//! - `<base_url><filename>`: a saved detection image
//! - `/health`

use anyhow::{anyhow, Context, Result};
use serde::Serialize;
use std::collections::HashMap;
use std::io::{self, ErrorKind, Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use crate::service::ServiceState;

pub mod stream;

pub use stream::{stream_frames, StreamEnd, StreamSettings, StreamSink};

use self::stream::CONTENT_TYPE as STREAM_CONTENT_TYPE;

const MAX_REQUEST_BYTES: usize = 8192;
const ACCEPT_IDLE: Duration = Duration::from_millis(50);
const READ_TIMEOUT: Duration = Duration::from_secs(2);
const WRITE_TIMEOUT: Duration = Duration::from_secs(5);
/// Time allowed to read a rejected request before answering `503`.
const BUSY_READ_TIMEOUT: Duration = Duration::from_millis(250);
/// Repeated accept failures are logged once per this many.
const ACCEPT_ERROR_LOG_EVERY: u64 = 100;
pub const DEFAULT_MAX_CONNECTIONS: usize = 64;

#[derive(Clone, Debug)]
pub struct ApiConfig {
    pub addr: String,
    pub stream: StreamSettings,
    /// Concurrent connections served, streams included.
    pub max_connections: usize,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            addr: "127.0.0.1:5000".to_string(),
            stream: StreamSettings::default(),
            max_connections: DEFAULT_MAX_CONNECTIONS,
        }
    }
}

#[derive(Debug)]
pub struct ApiHandle {
    pub addr: SocketAddr,
    shutdown: Arc<AtomicBool>,
    active: Arc<AtomicUsize>,
    join: Option<JoinHandle<()>>,
}

impl ApiHandle {
    /// Connections currently being served.
    pub fn active_connections(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    /// Stop accepting connections and end open streams.
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
    state: Arc<ServiceState>,
}

impl ApiServer {
    pub fn new(cfg: ApiConfig, state: Arc<ServiceState>) -> Self {
        Self { cfg, state }
    }

    pub fn spawn(self) -> Result<ApiHandle> {
        let configured_addr: SocketAddr = self
            .cfg
            .addr
            .parse()
            .with_context(|| format!("invalid api address '{}'", self.cfg.addr))?;
        let listener = TcpListener::bind(configured_addr)
            .with_context(|| format!("bind api listener on {}", configured_addr))?;
        let addr = listener.local_addr()?;
        listener.set_nonblocking(true)?;

        let shutdown = Arc::new(AtomicBool::new(false));
        let active = Arc::new(AtomicUsize::new(0));
        let (shutdown_thread, active_thread) = (shutdown.clone(), active.clone());
        let cfg = self.cfg;
        let state = self.state;
        let join = std::thread::Builder::new()
            .name("api-listener".to_string())
            .spawn(move || run_api(listener, cfg, state, shutdown_thread, active_thread))
            .context("spawn api listener thread")?;

        Ok(ApiHandle {
            addr,
            shutdown,
            active,
            join: Some(join),
        })
    }
}

/// Source of inbound connections.
trait Accept: Send + 'static {
    fn accept_conn(&self) -> io::Result<(TcpStream, SocketAddr)>;
}

impl Accept for TcpListener {
    fn accept_conn(&self) -> io::Result<(TcpStream, SocketAddr)> {
        self.accept()
    }
}

/// Holds one of the `max_connections` slots until dropped.
struct ConnectionSlot(Arc<AtomicUsize>);

impl ConnectionSlot {
    fn acquire(active: &Arc<AtomicUsize>, limit: usize) -> Option<Self> {
        active
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| {
                (n < limit).then_some(n + 1)
            })
            .ok()
            .map(|_| Self(active.clone()))
    }
}

impl Drop for ConnectionSlot {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

fn run_api<A: Accept>(
    listener: A,
    cfg: ApiConfig,
    state: Arc<ServiceState>,
    shutdown: Arc<AtomicBool>,
    active: Arc<AtomicUsize>,
) {
    let cfg = Arc::new(cfg);
    let mut accept_errors = 0u64;
    while !shutdown.load(Ordering::SeqCst) {
        let (stream, peer) = match listener.accept_conn() {
            Ok(accepted) => {
                accept_errors = 0;
                accepted
            }
            Err(err) if err.kind() == ErrorKind::WouldBlock => {
                std::thread::sleep(ACCEPT_IDLE);
                continue;
            }
            Err(err) => {
                if accept_errors % ACCEPT_ERROR_LOG_EVERY == 0 {
                    log::warn!(
                        "api accept failed ({} in a row): {}; retrying",
                        accept_errors + 1,
                        err
                    );
                }
                accept_errors += 1;
                std::thread::sleep(ACCEPT_IDLE);
                continue;
            }
        };

        let Some(slot) = ConnectionSlot::acquire(&active, cfg.max_connections) else {
            log::warn!(
                "api at {} connection(s); rejecting {}",
                cfg.max_connections,
                peer
            );
            if let Err(err) = reject_busy(stream) {
                log::debug!("busy response to {} failed: {:#}", peer, err);
            }
            continue;
        };

        let cfg = cfg.clone();
        let state = state.clone();
        let shutdown = shutdown.clone();
        let spawned = std::thread::Builder::new()
            .name("api-conn".to_string())
            .spawn(move || {
                let _slot = slot;
                if let Err(err) = handle_connection(stream, &cfg, &state, &shutdown) {
                    log::warn!("api request from {} rejected: {:#}", peer, err);
                }
            });
        if let Err(err) = spawned {
            log::error!("failed to spawn api connection thread: {}", err);
        }
    }
}

/// Answer `503` on the listener thread. The request is read first so closing
/// the socket does not reset the connection under the response.
fn reject_busy(mut stream: TcpStream) -> Result<()> {
    stream.set_nonblocking(false)?;
    stream.set_read_timeout(Some(BUSY_READ_TIMEOUT))?;
    stream.set_write_timeout(Some(BUSY_READ_TIMEOUT))?;
    let _ = read_request(&mut stream);
    write_json_response(&mut stream, 503, r#"{"error":"busy"}"#)
}

fn handle_connection(
    mut stream: TcpStream,
    cfg: &ApiConfig,
    state: &ServiceState,
    shutdown: &AtomicBool,
) -> Result<()> {
    // Accepted sockets inherit non-blocking mode from the listener on some platforms.
    stream.set_nonblocking(false)?;
    stream.set_read_timeout(Some(READ_TIMEOUT))?;
    stream.set_write_timeout(Some(WRITE_TIMEOUT))?;

    let request = read_request(&mut stream)?;
    if request.method != "GET" {
        write_json_response(&mut stream, 405, r#"{"error":"method_not_allowed"}"#)?;
        return Ok(());
    }

    match request.path.as_str() {
        "/video_feed" => serve_stream(stream, &request, cfg, state, shutdown),
        "/api/latest_detected_image" => {
            let snapshot = match state.snapshot_response() {
                Ok(snapshot) => snapshot,
                Err(err) => {
                    write_json_response(&mut stream, 500, r#"{"error":"encode_failed"}"#)?;
                    return Err(err);
                }
            };
            let status = if snapshot.image_base64.is_some() { 200 } else { 404 };
            write_serialized(&mut stream, status, &snapshot)
        }
        "/api/status" => write_serialized(&mut stream, 200, &state.status()),
        "/api/saved_images" => write_serialized(&mut stream, 200, &state.saved_images()),
        "/health" => write_json_response(&mut stream, 200, r#"{"status":"ok"}"#),
        path => match path.strip_prefix(state.base_url()) {
            Some(filename) => serve_saved_image(&mut stream, state, filename),
            None => write_json_response(&mut stream, 404, r#"{"error":"not_found"}"#),
        },
    }
}

fn serve_stream(
    mut stream: TcpStream,
    request: &HttpRequest,
    cfg: &ApiConfig,
    state: &ServiceState,
    shutdown: &AtomicBool,
) -> Result<()> {
    let peer = stream.peer_addr()?;
    let header = format!(
        "HTTP/1.1 200 OK\r\nContent-Type: {}\r\nCache-Control: no-cache, no-store\r\nAccess-Control-Allow-Origin: *\r\nConnection: close\r\n\r\n",
        STREAM_CONTENT_TYPE
    );
    stream.write_all(header.as_bytes())?;
    log::debug!(
        "stream client {} connected ({})",
        peer,
        request.header("user-agent").unwrap_or("-")
    );
    let end = stream_frames(
        &mut stream,
        &state.frames,
        &state.camera,
        shutdown,
        &cfg.stream,
    );
    log::debug!("stream client {} finished: {:?}", peer, end);
    Ok(())
}

fn serve_saved_image(stream: &mut TcpStream, state: &ServiceState, filename: &str) -> Result<()> {
    if !is_plain_filename(filename) {
        write_json_response(stream, 400, r#"{"error":"invalid_filename"}"#)?;
        return Err(anyhow!("rejected saved image name '{}'", filename));
    }
    let Some(path) = state.store.path_for(filename) else {
        return write_json_response(stream, 404, r#"{"error":"not_found"}"#);
    };
    match std::fs::read(&path) {
        Ok(bytes) => write_response(stream, 200, "image/jpeg", &bytes),
        Err(err) if err.kind() == ErrorKind::NotFound => {
            write_json_response(stream, 404, r#"{"error":"not_found"}"#)
        }
        Err(err) => {
            write_json_response(stream, 500, r#"{"error":"read_failed"}"#)?;
            Err(anyhow!("read saved image {}: {}", path.display(), err))
        }
    }
}

fn is_plain_filename(name: &str) -> bool {
    !name.is_empty()
        && !name.contains('/')
        && !name.contains('\\')
        && !name.contains("..")
        && !name.starts_with('.')
}

fn read_request<R: Read>(stream: &mut R) -> Result<HttpRequest> {
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
    let text = String::from_utf8_lossy(&data);
    let mut lines = text.split("\r\n");
    let request_line = lines.next().ok_or_else(|| anyhow!("empty request"))?;
    let mut parts = request_line.split_whitespace();
    let method = parts.next().ok_or_else(|| anyhow!("missing method"))?;
    let raw_path = parts.next().ok_or_else(|| anyhow!("missing path"))?;
    let mut headers = HashMap::new();
    for line in lines {
        if line.is_empty() {
            break;
        }
        if let Some((k, v)) = line.split_once(':') {
            headers.insert(k.trim().to_lowercase(), v.trim().to_string());
        }
    }
    let path = raw_path.split('?').next().unwrap_or(raw_path).to_string();
    Ok(HttpRequest {
        method: method.to_string(),
        path,
        headers,
    })
}

fn write_serialized<T: Serialize>(stream: &mut TcpStream, status: u16, body: &T) -> Result<()> {
    let payload = serde_json::to_vec(body)?;
    write_response(stream, status, "application/json", &payload)
}

fn write_json_response(stream: &mut TcpStream, status: u16, body: &str) -> Result<()> {
    write_response(stream, status, "application/json", body.as_bytes())
}

fn write_response<W: Write>(stream: &mut W, status: u16, content_type: &str, body: &[u8]) -> Result<()> {
    let status_line = match status {
        200 => "HTTP/1.1 200 OK",
        400 => "HTTP/1.1 400 Bad Request",
        404 => "HTTP/1.1 404 Not Found",
        405 => "HTTP/1.1 405 Method Not Allowed",
        503 => "HTTP/1.1 503 Service Unavailable",
        _ => "HTTP/1.1 500 Internal Server Error",
    };
    let header = format!(
        "{status_line}\r\nContent-Type: {content_type}\r\nContent-Length: {len}\r\nCache-Control: no-store\r\nAccess-Control-Allow-Origin: *\r\nConnection: close\r\n\r\n",
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
    headers: HashMap<String, String>,
}

impl HttpRequest {
    fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(&name.to_lowercase()).map(String::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ServiceConfig;
    use crate::detect::{Detector, StubBackend};
    use crate::pipeline::CameraStatus;
    use crate::service::ModelInfo;
    use std::io::Cursor;
    use std::path::Path;

    fn test_state(dir: &Path) -> Result<Arc<ServiceState>> {
        let mut config = ServiceConfig::load_from(None)?;
        config.storage.dir = dir.to_path_buf();
        let store = Arc::new(config.detection_store());
        store.initialize()?;
        let detector = StubBackend::synthetic_default();
        Ok(Arc::new(ServiceState::new(
            &config,
            Arc::new(config.frame_state()),
            store,
            Arc::new(CameraStatus::new()),
            ModelInfo::from_detector(config.model_path.clone(), &detector as &dyn Detector),
        )))
    }

    /// Fails the first `failures_left` accepts the way an exhausted process does.
    struct FlakyListener {
        inner: TcpListener,
        failures_left: AtomicUsize,
    }

    impl Accept for FlakyListener {
        fn accept_conn(&self) -> io::Result<(TcpStream, SocketAddr)> {
            let failing = self
                .failures_left
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
            if failing {
                return Err(io::Error::new(ErrorKind::Other, "too many open files"));
            }
            self.inner.accept()
        }
    }

    #[test]
    fn listener_keeps_serving_after_accept_failures() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let inner = TcpListener::bind("127.0.0.1:0")?;
        let addr = inner.local_addr()?;
        inner.set_nonblocking(true)?;
        let listener = FlakyListener {
            inner,
            failures_left: AtomicUsize::new(5),
        };

        let shutdown = Arc::new(AtomicBool::new(false));
        let active = Arc::new(AtomicUsize::new(0));
        let state = test_state(dir.path())?;
        let join = {
            let (shutdown, active) = (shutdown.clone(), active.clone());
            std::thread::spawn(move || run_api(listener, ApiConfig::default(), state, shutdown, active))
        };

        let mut client = TcpStream::connect(addr)?;
        client.write_all(b"GET /health HTTP/1.1\r\nHost: localhost\r\n\r\n")?;
        let mut response = String::new();
        client.read_to_string(&mut response)?;
        assert!(response.starts_with("HTTP/1.1 200 OK"), "{response}");

        shutdown.store(true, Ordering::SeqCst);
        join.join().map_err(|_| anyhow!("listener thread panicked"))?;
        Ok(())
    }

    #[test]
    fn connection_slots_are_bounded_and_released_on_drop() {
        let active = Arc::new(AtomicUsize::new(0));
        let first = ConnectionSlot::acquire(&active, 2);
        let second = ConnectionSlot::acquire(&active, 2);
        assert!(first.is_some() && second.is_some());
        assert!(ConnectionSlot::acquire(&active, 2).is_none());

        drop(first);
        assert_eq!(active.load(Ordering::SeqCst), 1);
        let third = ConnectionSlot::acquire(&active, 2);
        assert!(third.is_some());
        assert_eq!(active.load(Ordering::SeqCst), 2);
        drop((second, third));
        assert_eq!(active.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn parses_request_line_and_headers() -> Result<()> {
        let raw = b"GET /api/status?verbose=1 HTTP/1.1\r\nHost: localhost\r\nUser-Agent: curl/8.5\r\n\r\n";
        let request = read_request(&mut Cursor::new(raw.to_vec()))?;
        assert_eq!(request.method, "GET");
        assert_eq!(request.path, "/api/status");
        assert_eq!(request.header("host"), Some("localhost"));
        assert_eq!(request.header("User-Agent"), Some("curl/8.5"));
        Ok(())
    }

    #[test]
    fn rejects_empty_and_oversized_requests() {
        assert!(read_request(&mut Cursor::new(Vec::new())).is_err());
        let huge = vec![b'a'; MAX_REQUEST_BYTES + 10];
        assert!(read_request(&mut Cursor::new(huge)).is_err());
    }

    #[test]
    fn filenames_with_paths_are_not_plain() {
        assert!(is_plain_filename("detection_with_card_20240101_120000_123.jpg"));
        assert!(!is_plain_filename(""));
        assert!(!is_plain_filename("../secret.jpg"));
        assert!(!is_plain_filename("nested/file.jpg"));
        assert!(!is_plain_filename("..\\file.jpg"));
        assert!(!is_plain_filename(".hidden.jpg"));
    }

    #[test]
    fn responses_carry_cors_and_length() -> Result<()> {
        let mut out = Vec::new();
        write_response(&mut out, 404, "application/json", b"{}")?;
        let text = String::from_utf8(out)?;
        assert!(text.starts_with("HTTP/1.1 404 Not Found\r\n"));
        assert!(text.contains("Access-Control-Allow-Origin: *\r\n"));
        assert!(text.contains("Content-Length: 2\r\n"));
        assert!(text.ends_with("\r\n\r\n{}"));
        Ok(())
    }

    #[test]
    fn busy_status_line_is_503() -> Result<()> {
        let mut out = Vec::new();
        write_response(&mut out, 503, "application/json", br#"{"error":"busy"}"#)?;
        assert!(String::from_utf8(out)?.starts_with("HTTP/1.1 503 Service Unavailable\r\n"));
        Ok(())
    }
}
