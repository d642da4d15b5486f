use anyhow::Result;
use serde_json::Value;
use std::io::{Read, Write};
use std::net::TcpStream;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tempfile::tempdir;
use watchpost::api::{ApiConfig, ApiHandle, ApiServer, StreamSettings};
use watchpost::{
    CameraState, CameraStatus, Detector, Frame, ModelInfo, ServiceConfig, ServiceState,
    StubBackend,
};

fn frame(seq: u64) -> Frame {
    Frame::new(vec![120u8; 16 * 16 * 3], 16, 16, seq).expect("frame")
}

fn request(api: &TestApi, method: &str, path: &str) -> Result<(String, Vec<u8>)> {
    let mut stream = TcpStream::connect(api.handle().addr)?;
    let request = format!("{method} {path} HTTP/1.1\r\nHost: localhost\r\n\r\n");
    stream.write_all(request.as_bytes())?;
    read_response(&mut stream)
}

fn read_response(stream: &mut TcpStream) -> Result<(String, Vec<u8>)> {
    let mut response = Vec::new();
    stream.read_to_end(&mut response)?;
    let split = response
        .windows(4)
        .position(|w| w == b"\r\n\r\n")
        .map(|pos| pos + 4)
        .unwrap_or(response.len());
    let headers = String::from_utf8_lossy(&response[..split]).to_string();
    Ok((headers, response[split..].to_vec()))
}

fn json_body(body: &[u8]) -> Result<Value> {
    Ok(serde_json::from_slice(body)?)
}

fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    condition()
}

/// Open `/video_feed` and return once the response header has arrived.
fn open_stream(api: &TestApi) -> Result<TcpStream> {
    let mut stream = TcpStream::connect(api.handle().addr)?;
    stream.set_read_timeout(Some(Duration::from_secs(5)))?;
    stream.write_all(b"GET /video_feed HTTP/1.1\r\nHost: localhost\r\n\r\n")?;
    let mut received = Vec::new();
    let mut buf = [0u8; 1024];
    while !received.windows(4).any(|w| w == b"\r\n\r\n") {
        let n = stream.read(&mut buf)?;
        assert!(n > 0, "stream closed before its header");
        received.extend_from_slice(&buf[..n]);
    }
    assert!(String::from_utf8_lossy(&received).starts_with("HTTP/1.1 200 OK"));
    Ok(stream)
}

struct TestApi {
    _dir: tempfile::TempDir,
    state: Arc<ServiceState>,
    api_handle: Option<ApiHandle>,
}

impl TestApi {
    fn new() -> Result<Self> {
        Self::with_max_connections(64)
    }

    fn with_max_connections(max_connections: usize) -> Result<Self> {
        let dir = tempdir()?;
        let mut config = ServiceConfig::load_from(None)?;
        config.storage.dir = dir.path().join("saved_detections");
        config.storage.max_images = 3;

        let store = Arc::new(config.detection_store());
        store.initialize()?;
        let detector = StubBackend::synthetic_default();
        let state = Arc::new(ServiceState::new(
            &config,
            Arc::new(config.frame_state()),
            store,
            Arc::new(CameraStatus::new()),
            ModelInfo::from_detector(config.model_path.clone(), &detector as &dyn Detector),
        ));

        let api_config = ApiConfig {
            addr: "127.0.0.1:0".to_string(),
            stream: StreamSettings {
                poll_interval: Duration::from_millis(5),
                keepalive: Duration::from_millis(50),
                ..StreamSettings::default()
            },
            max_connections,
        };
        let api_handle = ApiServer::new(api_config, state.clone()).spawn()?;

        Ok(Self {
            _dir: dir,
            state,
            api_handle: Some(api_handle),
        })
    }

    fn handle(&self) -> &ApiHandle {
        self.api_handle
            .as_ref()
            .expect("test API handle should be initialized")
    }
}

impl Drop for TestApi {
    fn drop(&mut self) {
        if let Some(handle) = self.api_handle.take() {
            handle.stop().expect("failed to stop API server");
        }
    }
}

#[test]
fn health_endpoint_reports_ok_with_cors() -> Result<()> {
    let api = TestApi::new()?;
    let (headers, body) = request(&api, "GET", "/health")?;
    assert!(headers.contains("200 OK"));
    assert!(headers.contains("Access-Control-Allow-Origin: *"));
    assert_eq!(json_body(&body)?["status"], "ok");
    Ok(())
}

#[test]
fn status_reports_model_camera_and_snapshot() -> Result<()> {
    let api = TestApi::new()?;
    let (headers, body) = request(&api, "GET", "/api/status")?;
    assert!(headers.contains("200 OK"));
    let status = json_body(&body)?;
    assert_eq!(status["model_loaded"], true);
    assert_eq!(status["model_path"], "stub://model");
    assert_eq!(status["model_class_names_count"], 2);
    assert_eq!(status["camera_active"], false);
    assert_eq!(status["target_class_name"], "with_card");
    assert_eq!(status["confidence_threshold"], 0.5);
    assert_eq!(status["detection_available_single_api"], false);
    assert_eq!(status["saved_images_count"], 0);
    assert!(status["webcam_index"].is_string());

    api.state.camera.set(CameraState::Running);
    api.state.frames.publish(frame(1), true);
    let (_, body) = request(&api, "GET", "/api/status")?;
    let status = json_body(&body)?;
    assert_eq!(status["camera_active"], true);
    assert_eq!(status["detection_available_single_api"], true);
    Ok(())
}

#[test]
fn latest_detected_image_is_404_until_positive() -> Result<()> {
    let api = TestApi::new()?;
    let (headers, body) = request(&api, "GET", "/api/latest_detected_image")?;
    assert!(headers.contains("404 Not Found"));
    let value = json_body(&body)?;
    assert!(value["image_base64"].is_null());
    assert_eq!(
        value["message"],
        "No 'with_card' detection available for single image API."
    );

    api.state.frames.publish(frame(1), false);
    let (headers, _) = request(&api, "GET", "/api/latest_detected_image")?;
    assert!(headers.contains("404 Not Found"));

    api.state.frames.publish(frame(2), true);
    let (headers, body) = request(&api, "GET", "/api/latest_detected_image")?;
    assert!(headers.contains("200 OK"));
    let value = json_body(&body)?;
    assert!(!value["image_base64"].as_str().unwrap_or("").is_empty());
    Ok(())
}

#[test]
fn saved_images_are_listed_and_served() -> Result<()> {
    let api = TestApi::new()?;
    let (_, body) = request(&api, "GET", "/api/saved_images")?;
    let listing = json_body(&body)?;
    assert_eq!(listing["images"], Value::Array(vec![]));
    assert_eq!(listing["base_url"], "/saved_detections/");

    let name = api.state.store.insert(&frame(1), "with_card")?;
    let (_, body) = request(&api, "GET", "/api/saved_images")?;
    let listing = json_body(&body)?;
    assert_eq!(listing["images"][0], name.as_str());

    let (headers, body) = request(&api, "GET", &format!("/saved_detections/{name}"))?;
    assert!(headers.contains("200 OK"));
    assert!(headers.contains("Content-Type: image/jpeg"));
    assert_eq!(&body[..2], &[0xFF, 0xD8]);
    Ok(())
}

#[test]
fn saved_image_requests_are_restricted_to_the_index() -> Result<()> {
    let api = TestApi::new()?;
    let (headers, _) = request(&api, "GET", "/saved_detections/unknown.jpg")?;
    assert!(headers.contains("404 Not Found"));

    let (headers, body) = request(&api, "GET", "/saved_detections/../Cargo.toml")?;
    assert!(headers.contains("400 Bad Request"));
    assert_eq!(json_body(&body)?["error"], "invalid_filename");
    Ok(())
}

#[test]
fn unknown_paths_and_methods_are_rejected() -> Result<()> {
    let api = TestApi::new()?;
    let (headers, body) = request(&api, "GET", "/nope")?;
    assert!(headers.contains("404 Not Found"));
    assert_eq!(json_body(&body)?["error"], "not_found");

    let (headers, _) = request(&api, "POST", "/api/status")?;
    assert!(headers.contains("405 Method Not Allowed"));
    Ok(())
}

#[test]
fn video_feed_ends_immediately_when_camera_stopped() -> Result<()> {
    let api = TestApi::new()?;
    api.state.frames.publish(frame(1), false);
    let (headers, body) = request(&api, "GET", "/video_feed")?;
    assert!(headers.contains("200 OK"));
    assert!(headers.contains("multipart/x-mixed-replace; boundary=frame"));
    assert!(body.is_empty());
    Ok(())
}

#[test]
fn video_feed_streams_parts_until_camera_stops() -> Result<()> {
    let api = TestApi::new()?;
    api.state.camera.set(CameraState::Running);
    api.state.frames.publish(frame(1), false);

    let mut stream = TcpStream::connect(api.handle().addr)?;
    stream.set_read_timeout(Some(Duration::from_secs(5)))?;
    stream.write_all(b"GET /video_feed HTTP/1.1\r\nHost: localhost\r\n\r\n")?;

    let needle = b"Content-Type: image/jpeg";
    let mut received = Vec::new();
    let mut buf = [0u8; 4096];
    while !received.windows(needle.len()).any(|w| w == needle) {
        let n = stream.read(&mut buf)?;
        assert!(n > 0, "stream closed before the first part");
        received.extend_from_slice(&buf[..n]);
    }

    api.state.camera.set(CameraState::Stopped);
    stream.read_to_end(&mut received)?;
    let text = String::from_utf8_lossy(&received);
    assert!(text.starts_with("HTTP/1.1 200 OK"));
    assert!(text.contains("--frame\r\n"));
    Ok(())
}

#[test]
fn clients_leaving_before_the_first_frame_release_their_connections() -> Result<()> {
    let api = TestApi::new()?;
    api.state.camera.set(CameraState::Running);

    let clients = (0..5)
        .map(|_| open_stream(&api))
        .collect::<Result<Vec<_>>>()?;
    assert_eq!(api.handle().active_connections(), 5);
    drop(clients);

    assert!(
        wait_until(Duration::from_secs(3), || api.handle().active_connections() == 0),
        "stream connections still open: {}",
        api.handle().active_connections()
    );
    Ok(())
}

#[test]
fn connections_over_the_limit_get_503_until_streams_close() -> Result<()> {
    let api = TestApi::with_max_connections(2)?;
    api.state.camera.set(CameraState::Running);
    api.state.frames.publish(frame(1), false);

    let first = open_stream(&api)?;
    let second = open_stream(&api)?;
    let (headers, body) = request(&api, "GET", "/health")?;
    assert!(headers.contains("503 Service Unavailable"), "{headers}");
    assert!(headers.contains("Access-Control-Allow-Origin: *"));
    assert_eq!(json_body(&body)?["error"], "busy");

    drop((first, second));
    assert!(wait_until(Duration::from_secs(3), || {
        api.handle().active_connections() == 0
    }));
    let (headers, _) = request(&api, "GET", "/health")?;
    assert!(headers.contains("200 OK"), "{headers}");
    Ok(())
}
