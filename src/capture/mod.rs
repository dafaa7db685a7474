//! Frame producer.
//!
//! Renders a synthetic test pattern on a dedicated thread, JPEG-compresses it
//! and hands frames to the streaming connection at the user-chosen upload
//! frequency. Stands in for a camera pipeline.

use anyhow::Result;
use image::codecs::jpeg::JpegEncoder;
use image::{ImageBuffer, RgbImage};
use log::{debug, info, warn};
use std::io::Cursor;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crate::connection::StreamingConnection;

/// Default capture resolution
pub const DEFAULT_WIDTH: u32 = 320;
pub const DEFAULT_HEIGHT: u32 = 240;
/// JPEG quality (1-100)
pub const JPEG_QUALITY: u8 = 80;

/// Upload throttle: lets a frame through when more than `1000 / hz` ms have
/// passed since the last upload. A frequency of 0 pauses uploads.
#[derive(Debug, Clone)]
pub struct FramePacer {
    frequency_hz: u32,
    last_sent: Option<Instant>,
}

impl FramePacer {
    pub fn new(frequency_hz: u32) -> Self {
        Self {
            frequency_hz,
            last_sent: None,
        }
    }

    pub fn frequency(&self) -> u32 {
        self.frequency_hz
    }

    pub fn set_frequency(&mut self, frequency_hz: u32) {
        self.frequency_hz = frequency_hz;
    }

    /// Minimum spacing between uploads, `None` while paused
    pub fn upload_delay(&self) -> Option<Duration> {
        match self.frequency_hz {
            0 => None,
            hz => Some(Duration::from_millis(1000 / hz as u64)),
        }
    }

    pub fn should_send(&self, now: Instant) -> bool {
        let Some(delay) = self.upload_delay() else {
            return false;
        };
        self.last_sent
            .map_or(true, |last| now.saturating_duration_since(last) > delay)
    }

    pub fn mark_sent(&mut self, now: Instant) {
        self.last_sent = Some(now);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CaptureSettings {
    pub width: u32,
    pub height: u32,
    /// Rate at which the source produces frames
    pub source_fps: u32,
    /// Rate at which frames are uploaded; 0 pauses
    pub upload_hz: u32,
    pub quality: u8,
}

impl Default for CaptureSettings {
    fn default() -> Self {
        Self {
            width: DEFAULT_WIDTH,
            height: DEFAULT_HEIGHT,
            source_fps: 30,
            upload_hz: 10,
            quality: JPEG_QUALITY,
        }
    }
}

/// Running capture thread. Stops when dropped.
pub struct FrameCapture {
    running: Arc<AtomicBool>,
    upload_hz: Arc<AtomicU32>,
    thread: Option<JoinHandle<()>>,
}

impl FrameCapture {
    pub fn start(connection: StreamingConnection, settings: CaptureSettings) -> Result<Self> {
        if settings.width == 0 || settings.height == 0 {
            anyhow::bail!("Invalid capture resolution {}x{}", settings.width, settings.height);
        }
        if settings.source_fps == 0 {
            anyhow::bail!("Source frame rate must be positive");
        }

        let running = Arc::new(AtomicBool::new(true));
        let upload_hz = Arc::new(AtomicU32::new(settings.upload_hz));

        let running_clone = running.clone();
        let upload_hz_clone = upload_hz.clone();
        let thread = std::thread::Builder::new()
            .name("frame-capture".to_string())
            .spawn(move || capture_loop(connection, settings, upload_hz_clone, running_clone))?;

        info!(
            "📷 Capturing {}x{} at {} fps, uploading at {} Hz",
            settings.width, settings.height, settings.source_fps, settings.upload_hz
        );
        Ok(Self {
            running,
            upload_hz,
            thread: Some(thread),
        })
    }

    /// Change the upload frequency while running (0 pauses)
    pub fn set_upload_frequency(&self, hz: u32) {
        self.upload_hz.store(hz, Ordering::Relaxed);
    }

    pub fn stop(&mut self) {
        self.running.store(false, Ordering::Relaxed);
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                warn!("⚠️ Capture thread panicked");
            }
        }
    }
}

impl Drop for FrameCapture {
    fn drop(&mut self) {
        self.stop();
    }
}

fn capture_loop(
    connection: StreamingConnection,
    settings: CaptureSettings,
    upload_hz: Arc<AtomicU32>,
    running: Arc<AtomicBool>,
) {
    let frame_interval = Duration::from_millis(1000 / settings.source_fps as u64);
    let mut pacer = FramePacer::new(upload_hz.load(Ordering::Relaxed));
    let mut seq: u64 = 0;

    while running.load(Ordering::Relaxed) {
        let frame_start = Instant::now();
        pacer.set_frequency(upload_hz.load(Ordering::Relaxed));

        if pacer.should_send(frame_start) {
            let rgb = render_test_pattern(settings.width, settings.height, seq);
            match jpeg_encode(&rgb, settings.width, settings.height, settings.quality) {
                Ok(jpeg) => {
                    connection.send_frame(jpeg);
                    pacer.mark_sent(frame_start);
                }
                Err(e) => debug!("Skipping frame {}: {}", seq, e),
            }
        }
        seq += 1;

        // Maintain source frame rate
        let elapsed = frame_start.elapsed();
        if elapsed < frame_interval {
            std::thread::sleep(frame_interval - elapsed);
        }
    }
    debug!("Capture loop stopped after {} frames", seq);
}

/// RGB test card: horizontal colour gradient with a white bar sweeping across
pub fn render_test_pattern(width: u32, height: u32, seq: u64) -> Vec<u8> {
    let mut rgb = Vec::with_capacity((width * height * 3) as usize);
    let bar_x = (seq % width as u64) as u32;
    let bar_width = (width / 16).max(1);

    for y in 0..height {
        for x in 0..width {
            if x >= bar_x && x < bar_x + bar_width {
                rgb.extend_from_slice(&[255, 255, 255]);
            } else {
                let r = (x * 255 / width.max(1)) as u8;
                let g = (y * 255 / height.max(1)) as u8;
                let b = (seq % 256) as u8;
                rgb.extend_from_slice(&[r, g, b]);
            }
        }
    }

    rgb
}

/// JPEG encode an RGB buffer
pub fn jpeg_encode(rgb: &[u8], width: u32, height: u32, quality: u8) -> Result<Vec<u8>> {
    let mut buf = Cursor::new(Vec::new());
    let encoder = JpegEncoder::new_with_quality(&mut buf, quality);

    let img: RgbImage = ImageBuffer::from_raw(width, height, rgb.to_vec())
        .ok_or_else(|| anyhow::anyhow!("Invalid image dimensions"))?;

    img.write_with_encoder(encoder)
        .map_err(|e| anyhow::anyhow!("JPEG encode failed: {}", e))?;

    Ok(buf.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConnectionOptions;
    use crate::transport::WsConnector;

    #[test]
    fn test_pacer_first_frame_goes_through() {
        let pacer = FramePacer::new(10);
        assert!(pacer.should_send(Instant::now()));
    }

    #[test]
    fn test_pacer_spacing_is_strict() {
        let mut pacer = FramePacer::new(10);
        let t0 = Instant::now();
        pacer.mark_sent(t0);

        assert!(!pacer.should_send(t0 + Duration::from_millis(50)));
        assert!(!pacer.should_send(t0 + Duration::from_millis(100)));
        assert!(pacer.should_send(t0 + Duration::from_millis(101)));
    }

    #[test]
    fn test_pacer_zero_frequency_pauses() {
        let mut pacer = FramePacer::new(0);
        assert_eq!(pacer.upload_delay(), None);
        assert!(!pacer.should_send(Instant::now()));

        pacer.set_frequency(4);
        assert_eq!(pacer.upload_delay(), Some(Duration::from_millis(250)));
        assert!(pacer.should_send(Instant::now()));
    }

    #[test]
    fn test_test_pattern_encodes_to_jpeg() {
        let rgb = render_test_pattern(64, 48, 7);
        assert_eq!(rgb.len(), 64 * 48 * 3);

        let jpeg = jpeg_encode(&rgb, 64, 48, JPEG_QUALITY).unwrap();
        assert_eq!(&jpeg[..2], &[0xFF, 0xD8]);
        assert_eq!(&jpeg[jpeg.len() - 2..], &[0xFF, 0xD9]);
    }

    #[test]
    fn test_jpeg_encode_rejects_short_buffer() {
        assert!(jpeg_encode(&[0u8; 10], 64, 48, JPEG_QUALITY).is_err());
    }

    #[tokio::test]
    async fn test_capture_drops_frames_while_not_ready() {
        let conn = StreamingConnection::new(WsConnector::default(), ConnectionOptions::default());
        let settings = CaptureSettings {
            width: 32,
            height: 24,
            source_fps: 100,
            upload_hz: 50,
            quality: JPEG_QUALITY,
        };

        let mut capture = FrameCapture::start(conn.clone(), settings).unwrap();
        tokio::time::sleep(Duration::from_millis(300)).await;
        capture.stop();

        let stats = conn.stats();
        assert_eq!(stats.queued, 0);
        assert!(stats.dropped > 0);
    }

    #[test]
    fn test_capture_rejects_zero_resolution() {
        let runtime = tokio::runtime::Runtime::new().unwrap();
        let conn = StreamingConnection::with_runtime(
            WsConnector::default(),
            ConnectionOptions::default(),
            runtime.handle().clone(),
        );
        let settings = CaptureSettings {
            width: 0,
            ..CaptureSettings::default()
        };
        assert!(FrameCapture::start(conn, settings).is_err());
    }
}
