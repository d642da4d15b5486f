//! Multipart JPEG streaming loop for `/video_feed`.
//!
//! Each client runs its own pull loop against [`SharedFrameState`]. A part is
//! written whenever the published sequence advances, and the current frame is
//! re-sent after `keepalive` so a vanished client is noticed by a failed write
//! even while the producer is idle. Before the first frame exists nothing is
//! written, so the socket itself is checked for a closed peer on every poll.
//! The loop never holds the frame lock while encoding, writing or sleeping.

use anyhow::Result;
use std::io::{ErrorKind, Read, Write};
use std::net::TcpStream;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use crate::frame::SharedFrameState;
use crate::pipeline::CameraStatus;

pub const BOUNDARY: &str = "frame";
pub const CONTENT_TYPE: &str = "multipart/x-mixed-replace; boundary=frame";

/// Upper bound on the wait between checks once a frame has been seen.
const FRAME_RECHECK: Duration = Duration::from_millis(5);

#[derive(Clone, Debug)]
pub struct StreamSettings {
    /// Wait before retrying when no frame has been published yet.
    pub poll_interval: Duration,
    /// Re-send an unchanged frame after this long.
    pub keepalive: Duration,
    pub jpeg_quality: u8,
}

impl Default for StreamSettings {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(100),
            keepalive: Duration::from_secs(1),
            jpeg_quality: 85,
        }
    }
}

/// Client side of a stream.
pub trait StreamSink: Write {
    /// True once the client has closed its end of the connection.
    fn peer_closed(&mut self) -> bool;
}

impl StreamSink for TcpStream {
    /// Bytes the client sends after its request are discarded.
    fn peer_closed(&mut self) -> bool {
        if self.set_nonblocking(true).is_err() {
            return true;
        }
        let mut scratch = [0u8; 256];
        let closed = loop {
            match self.read(&mut scratch) {
                Ok(0) => break true,
                Ok(_) => continue,
                Err(err) if err.kind() == ErrorKind::WouldBlock => break false,
                Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(_) => break true,
            }
        };
        closed || self.set_nonblocking(false).is_err()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StreamEnd {
    CameraStopped,
    ClientGone,
    Shutdown,
}

pub fn stream_frames<W: StreamSink>(
    out: &mut W,
    frames: &SharedFrameState,
    camera: &CameraStatus,
    shutdown: &AtomicBool,
    settings: &StreamSettings,
) -> StreamEnd {
    let mut last_sent: Option<(u64, Instant)> = None;
    loop {
        if shutdown.load(Ordering::SeqCst) {
            return StreamEnd::Shutdown;
        }
        if !camera.is_active() {
            return StreamEnd::CameraStopped;
        }

        let Some(frame) = frames.read_annotated() else {
            if out.peer_closed() {
                log::debug!("stream client gone before the first frame");
                return StreamEnd::ClientGone;
            }
            std::thread::sleep(settings.poll_interval);
            continue;
        };
        let due = match last_sent {
            None => true,
            Some((sequence, sent_at)) => {
                sequence != frame.sequence || sent_at.elapsed() >= settings.keepalive
            }
        };
        if due {
            match frame.jpeg(settings.jpeg_quality) {
                Ok(jpeg) => {
                    if let Err(err) = write_part(out, jpeg) {
                        log::debug!("stream client gone: {}", err);
                        return StreamEnd::ClientGone;
                    }
                    last_sent = Some((frame.sequence, Instant::now()));
                }
                Err(err) => {
                    log::warn!("stream encode of frame {} failed: {:#}", frame.sequence, err);
                }
            }
        }
        std::thread::sleep(settings.poll_interval.min(FRAME_RECHECK));
    }
}

/// Write one multipart part carrying a JPEG body.
pub fn write_part<W: Write>(out: &mut W, jpeg: &[u8]) -> Result<()> {
    write!(
        out,
        "--{}\r\nContent-Type: image/jpeg\r\nContent-Length: {}\r\n\r\n",
        BOUNDARY,
        jpeg.len()
    )?;
    out.write_all(jpeg)?;
    out.write_all(b"\r\n")?;
    out.flush()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::Frame;
    use crate::pipeline::CameraState;
    use std::io;
    use std::sync::Arc;

    fn frame(seq: u64) -> Frame {
        Frame::new(vec![(seq * 20) as u8; 8 * 8 * 3], 8, 8, seq).unwrap()
    }

    fn fast_settings() -> StreamSettings {
        StreamSettings {
            poll_interval: Duration::from_millis(2),
            keepalive: Duration::from_secs(30),
            jpeg_quality: 80,
        }
    }

    fn count_parts(data: &[u8]) -> usize {
        let marker: &[u8] = b"--frame\r\n";
        data.windows(marker.len()).filter(|w| *w == marker).count()
    }

    impl StreamSink for Vec<u8> {
        fn peer_closed(&mut self) -> bool {
            false
        }
    }

    struct BrokenPipe;

    impl Write for BrokenPipe {
        fn write(&mut self, _buf: &[u8]) -> io::Result<usize> {
            Err(io::Error::new(io::ErrorKind::BrokenPipe, "client closed"))
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    impl StreamSink for BrokenPipe {
        fn peer_closed(&mut self) -> bool {
            true
        }
    }

    /// Server and client ends of a loopback connection.
    fn socket_pair() -> io::Result<(TcpStream, TcpStream)> {
        let listener = std::net::TcpListener::bind("127.0.0.1:0")?;
        let client = TcpStream::connect(listener.local_addr()?)?;
        let (server, _) = listener.accept()?;
        Ok((server, client))
    }

    #[test]
    fn part_framing_matches_multipart_layout() -> Result<()> {
        let mut out: Vec<u8> = Vec::new();
        write_part(&mut out, &[0xFF, 0xD8, 0xFF, 0xD9])?;
        let mut expected =
            b"--frame\r\nContent-Type: image/jpeg\r\nContent-Length: 4\r\n\r\n".to_vec();
        expected.extend_from_slice(&[0xFF, 0xD8, 0xFF, 0xD9]);
        expected.extend_from_slice(b"\r\n");
        assert_eq!(out, expected);
        Ok(())
    }

    #[test]
    fn stopped_camera_ends_stream_immediately() {
        let frames = SharedFrameState::new();
        frames.publish(frame(1), false);
        let camera = CameraStatus::new();
        let mut out: Vec<u8> = Vec::new();
        let end = stream_frames(
            &mut out,
            &frames,
            &camera,
            &AtomicBool::new(false),
            &fast_settings(),
        );
        assert_eq!(end, StreamEnd::CameraStopped);
        assert!(out.is_empty());
    }

    #[test]
    fn disconnected_client_ends_stream() {
        let frames = SharedFrameState::new();
        frames.publish(frame(1), false);
        let camera = CameraStatus::new();
        camera.set(CameraState::Running);
        let end = stream_frames(
            &mut BrokenPipe,
            &frames,
            &camera,
            &AtomicBool::new(false),
            &fast_settings(),
        );
        assert_eq!(end, StreamEnd::ClientGone);
    }

    #[test]
    fn client_leaving_before_first_frame_ends_stream() -> io::Result<()> {
        let frames = SharedFrameState::new();
        let camera = CameraStatus::new();
        camera.set(CameraState::Running);
        let (mut server, client) = socket_pair()?;
        drop(client);

        let end = stream_frames(
            &mut server,
            &frames,
            &camera,
            &AtomicBool::new(false),
            &fast_settings(),
        );
        assert_eq!(end, StreamEnd::ClientGone);
        Ok(())
    }

    #[test]
    fn connected_client_is_not_reported_closed() -> io::Result<()> {
        let (mut server, mut client) = socket_pair()?;
        assert!(!server.peer_closed());

        client.write_all(b"stray bytes")?;
        std::thread::sleep(Duration::from_millis(20));
        assert!(!server.peer_closed());

        drop(client);
        let deadline = Instant::now() + Duration::from_secs(2);
        while !server.peer_closed() {
            assert!(Instant::now() < deadline, "close was never observed");
            std::thread::sleep(Duration::from_millis(5));
        }
        Ok(())
    }

    #[test]
    fn shutdown_flag_ends_stream() {
        let frames = SharedFrameState::new();
        let camera = CameraStatus::new();
        camera.set(CameraState::Running);
        let end = stream_frames(
            &mut Vec::<u8>::new(),
            &frames,
            &camera,
            &AtomicBool::new(true),
            &fast_settings(),
        );
        assert_eq!(end, StreamEnd::Shutdown);
    }

    #[test]
    fn each_new_frame_is_sent_and_unchanged_frames_are_not_repeated() {
        let frames = Arc::new(SharedFrameState::new());
        let camera = Arc::new(CameraStatus::new());
        camera.set(CameraState::Running);
        frames.publish(frame(1), false);

        let producer = {
            let frames = frames.clone();
            let camera = camera.clone();
            std::thread::spawn(move || {
                std::thread::sleep(Duration::from_millis(60));
                frames.publish(frame(2), false);
                std::thread::sleep(Duration::from_millis(60));
                camera.set(CameraState::Stopped);
            })
        };

        let mut out: Vec<u8> = Vec::new();
        let end = stream_frames(
            &mut out,
            &frames,
            &camera,
            &AtomicBool::new(false),
            &fast_settings(),
        );
        producer.join().unwrap();
        assert_eq!(end, StreamEnd::CameraStopped);
        assert_eq!(count_parts(&out), 2);
    }

    #[test]
    fn keepalive_resends_unchanged_frame() {
        let frames = Arc::new(SharedFrameState::new());
        let camera = Arc::new(CameraStatus::new());
        camera.set(CameraState::Running);
        frames.publish(frame(1), false);

        let stopper = {
            let camera = camera.clone();
            std::thread::spawn(move || {
                std::thread::sleep(Duration::from_millis(100));
                camera.set(CameraState::Stopped);
            })
        };

        let settings = StreamSettings {
            keepalive: Duration::from_millis(20),
            ..fast_settings()
        };
        let mut out: Vec<u8> = Vec::new();
        stream_frames(&mut out, &frames, &camera, &AtomicBool::new(false), &settings);
        stopper.join().unwrap();
        assert!(count_parts(&out) >= 2);
    }
}
