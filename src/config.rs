//! Source configuration and the backend factory.
//!
//! A source is named by a location string, either a filesystem path or a URI:
//!
//! | Location | Backend |
//! |---|---|
//! | `photo.png`, `file:///tmp/photo.jpg` | still image |
//! | `clip.mp4`, `file:///tmp/clip.mkv` | video file |
//! | `/dev/video1`, `v4l2:///dev/video1`, `v4l2://video1`, `v4l2:` | V4L2 camera |
//! | `iidc://0x00b09d0100a1b2c3`, `iidc:` | IIDC camera (0 or no GUID: next free camera) |
//! | `synthetic:?width=320&height=240&encoding=rgb&fps=30` | test pattern |

use crate::backend::{AcquisitionBackend, StillImageBackend, SyntheticBackend, SyntheticConfig, VideoFileBackend};
use crate::crop_scale::CropRect;
use crate::error::{FrameError, Result};
use crate::frame::{ColorMode, PixelEncoding};
use crate::source::{FrameSource, SourceOptions};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;
use url::Url;

const IMAGE_EXTENSIONS: &[&str] = &[
    "png", "jpg", "jpeg", "bmp", "gif", "tif", "tiff", "pnm", "pbm", "pgm", "ppm", "webp", "tga", "qoi",
];

const DEFAULT_V4L2_DEVICE: &str = "/dev/video0";

/// Everything needed to open a [`FrameSource`].
///
/// Loadable from YAML; every field is optional.
///
/// ```yaml
/// source: /dev/video0
/// mode: grayscale
/// crop: { x: 100, y: 50, w: 320, h: 240 }
/// scale: 0.5
/// interval_ms: 100
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SourceConfig {
    /// Path or URI of the source
    pub source: String,
    pub mode: ColorMode,
    pub crop: CropRect,
    pub scale: f64,
    /// Delivery thread period in milliseconds; 0 delivers every frame
    pub interval_ms: u64,
    /// Driver buffers to request (V4L2)
    pub buffers: u32,
    /// Requested capture size and rate; unset lets the device choose
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub fps: Option<u32>,
    /// Release all IIDC bus bandwidth before opening
    pub reset_bus: bool,
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            source: "synthetic:".to_string(),
            mode: ColorMode::Color,
            crop: CropRect::NONE,
            scale: 1.0,
            interval_ms: 0,
            buffers: 4,
            width: None,
            height: None,
            fps: None,
            reset_bus: false,
        }
    }
}

impl SourceConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .map_err(|e| FrameError::io(format!("reading {}", path.display()), e))?;
        serde_yaml::from_str(&content).map_err(|e| FrameError::Config(format!("{}: {}", path.display(), e)))
    }

    pub fn options(&self) -> SourceOptions {
        SourceOptions {
            mode: self.mode,
            crop: self.crop,
            scale: self.scale,
        }
    }

    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    pub fn kind(&self) -> Result<SourceKind> {
        SourceKind::parse(&self.source)
    }
}

/// Which backend a location names.
#[derive(Debug, Clone, PartialEq)]
pub enum SourceKind {
    StillImage(PathBuf),
    VideoFile(PathBuf),
    V4l2(PathBuf),
    Iidc { guid: u64 },
    Synthetic(SyntheticConfig),
}

impl SourceKind {
    pub fn parse(location: &str) -> Result<Self> {
        match Url::parse(location) {
            // Single-letter schemes are Windows drive letters
            Ok(url) if url.scheme().len() > 1 => Self::from_url(&url),
            _ => Ok(Self::from_path(PathBuf::from(location))),
        }
    }

    fn from_path(path: PathBuf) -> Self {
        if path.starts_with("/dev") {
            return SourceKind::V4l2(path);
        }
        let is_image = path
            .extension()
            .and_then(|ext| ext.to_str())
            .map(|ext| IMAGE_EXTENSIONS.contains(&ext.to_ascii_lowercase().as_str()))
            .unwrap_or(false);
        if is_image {
            SourceKind::StillImage(path)
        } else {
            SourceKind::VideoFile(path)
        }
    }

    fn from_url(url: &Url) -> Result<Self> {
        match url.scheme() {
            "file" => url
                .to_file_path()
                .map(Self::from_path)
                .map_err(|_| FrameError::Config(format!("not a local file: {}", url))),
            "v4l2" => {
                let device = match url.host_str().filter(|h| !h.is_empty()) {
                    Some(name) => Path::new("/dev").join(name),
                    None if !url.path().is_empty() => PathBuf::from(url.path()),
                    None => PathBuf::from(DEFAULT_V4L2_DEVICE),
                };
                Ok(SourceKind::V4l2(device))
            }
            "iidc" => {
                let guid = match url.host_str().filter(|h| !h.is_empty()) {
                    Some(host) => parse_guid(host)?,
                    None => 0,
                };
                Ok(SourceKind::Iidc { guid })
            }
            "synthetic" => synthetic_from_query(url).map(SourceKind::Synthetic),
            other => Err(FrameError::Config(format!("unknown source scheme '{}'", other))),
        }
    }
}

fn parse_guid(text: &str) -> Result<u64> {
    let digits = text
        .strip_prefix("0x")
        .or_else(|| text.strip_prefix("0X"))
        .unwrap_or(text);
    u64::from_str_radix(digits, 16).map_err(|e| FrameError::Config(format!("bad IIDC GUID '{}': {}", text, e)))
}

fn synthetic_from_query(url: &Url) -> Result<SyntheticConfig> {
    fn number<T: std::str::FromStr>(key: &str, value: &str) -> Result<T> {
        value
            .parse()
            .map_err(|_| FrameError::Config(format!("synthetic source: bad {} '{}'", key, value)))
    }

    let mut config = SyntheticConfig::default();
    for (key, value) in url.query_pairs() {
        match &*key {
            "width" => config.width = number(&key, &value)?,
            "height" => config.height = number(&key, &value)?,
            "slots" => config.slots = number(&key, &value)?,
            "fps" => {
                let fps: f64 = number(&key, &value)?;
                config.interval = (fps > 0.0).then(|| Duration::from_secs_f64(1.0 / fps));
            }
            "on_demand" => config.on_demand = matches!(&*value, "1" | "true" | "yes"),
            "encoding" => {
                config.encoding = match &*value {
                    "gray" | "grey" | "gray8" => PixelEncoding::Gray8,
                    "rgb" | "rgb24" => PixelEncoding::Rgb24,
                    "yuyv" => PixelEncoding::Yuyv,
                    other => {
                        return Err(FrameError::Config(format!(
                            "synthetic source: unsupported encoding '{}'",
                            other
                        )))
                    }
                }
            }
            other => return Err(FrameError::Config(format!("synthetic source: unknown parameter '{}'", other))),
        }
    }
    Ok(config)
}

/// Opens the backend named by `config.source` and wraps it in a [`FrameSource`].
pub fn open_source(config: &SourceConfig) -> Result<FrameSource> {
    let kind = config.kind()?;
    info!("Opening source {}", config.source);

    let backend: Box<dyn AcquisitionBackend> = match kind {
        SourceKind::StillImage(path) => Box::new(StillImageBackend::open(path, config.mode)?),
        SourceKind::VideoFile(path) => Box::new(VideoFileBackend::open(path, config.mode)?),
        SourceKind::V4l2(device) => open_v4l2(device, config)?,
        SourceKind::Iidc { guid } => open_iidc(guid, config)?,
        SourceKind::Synthetic(mut synthetic) => {
            if let Some(width) = config.width {
                synthetic.width = width;
            }
            if let Some(height) = config.height {
                synthetic.height = height;
            }
            if let Some(fps) = config.fps.filter(|&fps| fps > 0) {
                synthetic.interval = Some(Duration::from_secs_f64(1.0 / fps as f64));
            }
            Box::new(SyntheticBackend::open(synthetic)?)
        }
    };

    FrameSource::from_boxed(backend, config.options())
}

#[cfg(target_os = "linux")]
fn open_v4l2(device: PathBuf, config: &SourceConfig) -> Result<Box<dyn AcquisitionBackend>> {
    use crate::backend::v4l2::{V4l2Backend, V4l2Config};

    let v4l2 = V4l2Config {
        device,
        width: config.width,
        height: config.height,
        fps: config.fps,
        buffers: config.buffers,
        mode: config.mode,
    };
    Ok(Box::new(V4l2Backend::open(&v4l2)?))
}

#[cfg(not(target_os = "linux"))]
fn open_v4l2(device: PathBuf, _config: &SourceConfig) -> Result<Box<dyn AcquisitionBackend>> {
    Err(FrameError::Init(format!(
        "{}: V4L2 is only available on Linux",
        device.display()
    )))
}

#[cfg(all(feature = "iidc", target_os = "linux"))]
fn open_iidc(guid: u64, config: &SourceConfig) -> Result<Box<dyn AcquisitionBackend>> {
    use crate::backend::iidc::{IidcBackend, IidcConfig};

    let iidc = IidcConfig {
        guid,
        reset_bus: config.reset_bus,
        mode: config.mode,
    };
    Ok(Box::new(IidcBackend::open(&iidc)?))
}

#[cfg(not(all(feature = "iidc", target_os = "linux")))]
fn open_iidc(guid: u64, _config: &SourceConfig) -> Result<Box<dyn AcquisitionBackend>> {
    Err(FrameError::Init(format!(
        "IIDC camera {:#x}: built without the `iidc` feature",
        guid
    )))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_paths_pick_backend_by_extension() {
        assert_eq!(
            SourceKind::parse("shots/Frame.PNG").unwrap(),
            SourceKind::StillImage(PathBuf::from("shots/Frame.PNG"))
        );
        assert_eq!(
            SourceKind::parse("/tmp/clip.mp4").unwrap(),
            SourceKind::VideoFile(PathBuf::from("/tmp/clip.mp4"))
        );
        assert_eq!(
            SourceKind::parse("/dev/video2").unwrap(),
            SourceKind::V4l2(PathBuf::from("/dev/video2"))
        );
        assert_eq!(
            SourceKind::parse("file:///srv/still.jpeg").unwrap(),
            SourceKind::StillImage(PathBuf::from("/srv/still.jpeg"))
        );
    }

    #[test]
    fn test_camera_uris() {
        assert_eq!(
            SourceKind::parse("v4l2:///dev/video1").unwrap(),
            SourceKind::V4l2(PathBuf::from("/dev/video1"))
        );
        assert_eq!(
            SourceKind::parse("v4l2://video3").unwrap(),
            SourceKind::V4l2(PathBuf::from("/dev/video3"))
        );
        assert_eq!(
            SourceKind::parse("v4l2:").unwrap(),
            SourceKind::V4l2(PathBuf::from(DEFAULT_V4L2_DEVICE))
        );
        assert_eq!(
            SourceKind::parse("iidc://0x00b09d0100a1b2c3").unwrap(),
            SourceKind::Iidc {
                guid: 0x00b0_9d01_00a1_b2c3
            }
        );
        assert_eq!(SourceKind::parse("iidc:").unwrap(), SourceKind::Iidc { guid: 0 });
        assert!(matches!(
            SourceKind::parse("iidc://camera"),
            Err(FrameError::Config(_))
        ));
        assert!(matches!(
            SourceKind::parse("rtsp://example.com/stream"),
            Err(FrameError::Config(_))
        ));
    }

    #[test]
    fn test_synthetic_query_parameters() {
        let kind = SourceKind::parse("synthetic:?width=32&height=16&encoding=rgb&fps=0&slots=2").unwrap();
        let SourceKind::Synthetic(config) = kind else {
            panic!("expected a synthetic source");
        };
        assert_eq!(config.width, 32);
        assert_eq!(config.height, 16);
        assert_eq!(config.encoding, PixelEncoding::Rgb24);
        assert_eq!(config.slots, 2);
        assert_eq!(config.interval, None);

        assert!(SourceKind::parse("synthetic:?encoding=nv12").is_err());
        assert!(SourceKind::parse("synthetic:?width=wide").is_err());
        assert!(SourceKind::parse("synthetic:?colour=red").is_err());
    }

    #[test]
    fn test_load_yaml_fills_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "source: /dev/video0\nmode: grayscale\ncrop: {{ x: 10, y: 20, w: 64, h: 48 }}\nscale: 0.5\ninterval_ms: 100"
        )
        .unwrap();

        let config = SourceConfig::load(file.path()).unwrap();
        assert_eq!(config.source, "/dev/video0");
        assert_eq!(config.mode, ColorMode::Grayscale);
        assert_eq!(config.crop, CropRect::new(10, 20, 64, 48));
        assert_eq!(config.scale, 0.5);
        assert_eq!(config.interval(), Duration::from_millis(100));
        assert_eq!(config.buffers, 4);
        assert!(!config.reset_bus);
    }

    #[test]
    fn test_load_rejects_unknown_fields() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "source: a.png\nshader: crt.glsl").unwrap();
        assert!(matches!(SourceConfig::load(file.path()), Err(FrameError::Config(_))));
    }

    #[test]
    fn test_open_synthetic_source() {
        let config = SourceConfig {
            source: "synthetic:?encoding=gray&fps=0&on_demand=1".to_string(),
            mode: ColorMode::Grayscale,
            width: Some(40),
            height: Some(30),
            scale: 0.5,
            ..Default::default()
        };
        let source = open_source(&config).unwrap();
        assert_eq!(source.output_size(), (20, 15));

        let mut buffer = source.new_buffer();
        source.get_next_frame(&mut buffer).unwrap();
        assert_eq!(buffer.data.len(), 20 * 15);
    }

    #[test]
    fn test_open_still_image_with_crop() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("still.png");
        image::RgbImage::from_pixel(64, 48, image::Rgb([10, 20, 30]))
            .save(&path)
            .unwrap();

        let config = SourceConfig {
            source: path.to_string_lossy().into_owned(),
            crop: CropRect::new(8, 8, 16, 12),
            ..Default::default()
        };
        let source = open_source(&config).unwrap();
        assert_eq!(source.output_size(), (16, 12));

        let mut buffer = source.new_buffer();
        source.get_latest_frame(&mut buffer).unwrap();
        assert_eq!(&buffer.data[..3], &[10, 20, 30]);
    }
}
