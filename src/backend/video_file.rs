//! Video files decoded by an `ffmpeg` subprocess.
//!
//! `ffprobe` supplies the geometry and frame rate, then `ffmpeg` streams raw
//! frames already converted to the canonical pixel format over a pipe. Rewinding
//! respawns the decoder.

use super::{AcquisitionBackend, DequeuePolicy, RawFormat, Slot};
use crate::error::{FrameError, Result};
use crate::frame::ColorMode;
use std::io::{ErrorKind, Read};
use std::path::{Path, PathBuf};
use std::process::{Child, ChildStdout, Command, Stdio};
use std::thread;
use tracing::{debug, error, info, warn};

const DEFAULT_FPS: f64 = 30.0;

pub struct VideoFileBackend {
    path: PathBuf,
    mode: ColorMode,
    format: RawFormat,
    fps: f64,
    decoder: Option<Decoder>,
    buffer: Vec<u8>,
    frame_index: u64,
    checked_out: bool,
}

struct Decoder {
    child: Child,
    stdout: ChildStdout,
}

impl Drop for Decoder {
    fn drop(&mut self) {
        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}

impl VideoFileBackend {
    pub fn open(path: impl AsRef<Path>, mode: ColorMode) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        info!("Opening video via ffmpeg CLI: {:?}", path);

        let path_str = path
            .to_str()
            .ok_or_else(|| FrameError::Init(format!("non UTF-8 path {:?}", path)))?;
        let output = Command::new("ffprobe")
            .args([
                "-v",
                "error",
                "-select_streams",
                "v:0",
                "-show_entries",
                "stream=width,height,r_frame_rate",
                "-of",
                "default=noprint_wrappers=1",
                path_str,
            ])
            .output()
            .map_err(|e| FrameError::Init(format!("failed to run ffprobe: {}", e)))?;

        if !output.status.success() {
            return Err(FrameError::Init(format!(
                "ffprobe failed: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }

        let (width, height, fps) = parse_probe(&String::from_utf8_lossy(&output.stdout))?;
        let format = RawFormat::packed(width, height, mode.canonical_encoding());
        info!("Video: {}, {:.2} fps", format, fps);

        let mut backend = Self {
            path,
            mode,
            format,
            fps,
            decoder: None,
            buffer: vec![0; format.stride * height as usize],
            frame_index: 0,
            checked_out: false,
        };
        backend.spawn_decoder()?;
        Ok(backend)
    }

    fn spawn_decoder(&mut self) -> Result<()> {
        self.decoder = None;
        let pix_fmt = match self.mode {
            ColorMode::Color => "rgb24",
            ColorMode::Grayscale => "gray",
        };

        let mut child = Command::new("ffmpeg")
            .arg("-nostdin")
            .arg("-i")
            .arg(&self.path)
            .args(["-f", "rawvideo", "-pix_fmt", pix_fmt, "-"])
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| FrameError::Init(format!("failed to spawn ffmpeg: {}", e)))?;

        // Log ffmpeg errors on a side thread so a full stderr pipe never stalls decoding
        if let Some(mut stderr) = child.stderr.take() {
            thread::spawn(move || {
                let mut buf = [0u8; 1024];
                loop {
                    match stderr.read(&mut buf) {
                        Ok(0) | Err(_) => break,
                        Ok(n) => {
                            let msg = String::from_utf8_lossy(&buf[..n]);
                            for line in msg.lines() {
                                if line.contains("Error") || line.contains("error") || line.contains("failed") {
                                    error!("ffmpeg: {}", line);
                                }
                            }
                        }
                    }
                }
            });
        }

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| FrameError::Init("ffmpeg stdout was not captured".into()))?;
        self.decoder = Some(Decoder { child, stdout });
        self.frame_index = 0;
        debug!("ffmpeg decoder started for {:?}", self.path);
        Ok(())
    }
}

impl AcquisitionBackend for VideoFileBackend {
    fn format(&self) -> RawFormat {
        self.format
    }

    fn description(&self) -> String {
        format!(
            "video file {} ({}, {:.2} fps)",
            self.path.display(),
            self.format,
            self.fps
        )
    }

    fn is_queued(&self) -> bool {
        false
    }

    fn dequeue(&mut self, _policy: DequeuePolicy) -> Result<Option<Slot>> {
        if self.checked_out {
            return Ok(None);
        }
        let decoder = self.decoder.as_mut().ok_or(FrameError::EndOfStream)?;

        if let Err(e) = decoder.stdout.read_exact(&mut self.buffer) {
            self.decoder = None;
            if e.kind() == ErrorKind::UnexpectedEof {
                info!("End of video {:?} after {} frames", self.path, self.frame_index);
                return Err(FrameError::EndOfStream);
            }
            warn!("Error reading from ffmpeg: {}", e);
            return Err(FrameError::io("reading decoded frame", e));
        }

        let timestamp_us = frame_timestamp_us(self.frame_index, self.fps);
        self.frame_index += 1;
        self.checked_out = true;
        Ok(Some(Slot::new(0, self.buffer.len(), timestamp_us)))
    }

    fn slot_data(&self, _slot: &Slot) -> &[u8] {
        &self.buffer
    }

    fn enqueue(&mut self, _slot: Slot) -> Result<()> {
        self.checked_out = false;
        Ok(())
    }

    // No-op: frames ffmpeg already wrote into the pipe are still served after
    // resume. Files have no live backlog, so nothing stale is delivered.
    fn stop(&mut self) -> Result<()> {
        Ok(())
    }

    fn resume(&mut self) -> Result<()> {
        Ok(())
    }

    fn restart(&mut self) -> Result<()> {
        info!("Rewinding {:?}", self.path);
        self.spawn_decoder()
            .map_err(|e| FrameError::StreamControl(format!("cannot rewind: {}", e)))
    }
}

fn frame_timestamp_us(index: u64, fps: f64) -> u64 {
    (index as f64 * 1_000_000.0 / fps).round() as u64
}

/// Parses `key=value` lines from ffprobe into (width, height, fps).
fn parse_probe(text: &str) -> Result<(u32, u32, f64)> {
    let mut width = None;
    let mut height = None;
    let mut fps = None;
    for line in text.lines() {
        match line.trim().split_once('=') {
            Some(("width", v)) => width = v.parse().ok(),
            Some(("height", v)) => height = v.parse().ok(),
            Some(("r_frame_rate", v)) => fps = parse_fps(v),
            _ => {}
        }
    }
    match (width, height) {
        (Some(w), Some(h)) if w > 0 && h > 0 => Ok((w, h, fps.unwrap_or(DEFAULT_FPS))),
        _ => Err(FrameError::Init(format!(
            "no video stream size in ffprobe output: {:?}",
            text.trim()
        ))),
    }
}

fn parse_fps(s: &str) -> Option<f64> {
    let fps = match s.split_once('/') {
        Some((num, den)) => {
            let n: f64 = num.parse().ok()?;
            let d: f64 = den.parse().ok()?;
            if d == 0.0 {
                return None;
            }
            n / d
        }
        None => s.parse().ok()?,
    };
    (fps.is_finite() && fps > 0.0).then_some(fps)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::{FrameSource, SourceOptions};

    #[test]
    fn test_parse_fps() {
        assert_eq!(parse_fps("25/1"), Some(25.0));
        assert!((parse_fps("30000/1001").unwrap() - 29.97).abs() < 0.01);
        assert_eq!(parse_fps("0/0"), None);
        assert_eq!(parse_fps("N/A"), None);
        assert_eq!(parse_fps("12.5"), Some(12.5));
    }

    #[test]
    fn test_parse_probe_output() {
        let text = "width=320\nheight=240\nr_frame_rate=50/1\n";
        assert_eq!(parse_probe(text).unwrap(), (320, 240, 50.0));

        let no_rate = "width=320\nheight=240\nr_frame_rate=0/0\n";
        assert_eq!(parse_probe(no_rate).unwrap(), (320, 240, DEFAULT_FPS));

        assert!(parse_probe("").is_err());
    }

    #[test]
    fn test_timestamps_follow_frame_rate() {
        assert_eq!(frame_timestamp_us(0, 25.0), 0);
        assert_eq!(frame_timestamp_us(3, 25.0), 120_000);
    }

    #[test]
    fn test_missing_file_fails_to_open() {
        let dir = tempfile::tempdir().unwrap();
        let result = VideoFileBackend::open(dir.path().join("missing.mp4"), ColorMode::Color);
        assert!(matches!(result, Err(FrameError::Init(_))));
    }

    fn ffmpeg_available() -> bool {
        ["ffmpeg", "ffprobe"].iter().all(|tool| {
            Command::new(tool)
                .arg("-version")
                .stdout(Stdio::null())
                .stderr(Stdio::null())
                .status()
                .is_ok_and(|status| status.success())
        })
    }

    #[test]
    fn test_reads_to_end_then_restarts_from_first_frame() {
        if !ffmpeg_available() {
            eprintln!("ffmpeg not installed, skipping");
            return;
        }
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("clip.mkv");
        let status = Command::new("ffmpeg")
            .args(["-v", "error", "-nostdin", "-f", "lavfi", "-i", "testsrc=size=32x16:rate=5"])
            .args(["-frames:v", "3", "-c:v", "ffv1"])
            .arg(&path)
            .status()
            .unwrap();
        assert!(status.success());

        let backend = VideoFileBackend::open(&path, ColorMode::Color).unwrap();
        assert_eq!((backend.format().width, backend.format().height), (32, 16));
        let source = FrameSource::new(backend, SourceOptions::default()).unwrap();

        let mut first = source.new_buffer();
        assert_eq!(source.get_next_frame(&mut first).unwrap(), 0);
        let mut buffer = source.new_buffer();
        assert_eq!(source.get_next_frame(&mut buffer).unwrap(), 200_000);
        assert_eq!(source.get_next_frame(&mut buffer).unwrap(), 400_000);
        assert!(matches!(
            source.get_next_frame(&mut buffer),
            Err(FrameError::EndOfStream)
        ));

        source.restart_stream().unwrap();
        assert_eq!(source.get_next_frame(&mut buffer).unwrap(), 0);
        assert_eq!(buffer, first);
    }
}
