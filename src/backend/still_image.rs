//! A single image file served as an endless stream of identical frames.

use super::{AcquisitionBackend, DequeuePolicy, RawFormat, Slot};
use crate::error::{FrameError, Result};
use crate::frame::ColorMode;
use std::path::{Path, PathBuf};
use tracing::info;

pub struct StillImageBackend {
    path: PathBuf,
    data: Vec<u8>,
    format: RawFormat,
    /// Also the timestamp of the next frame
    served: u64,
    checked_out: bool,
}

impl StillImageBackend {
    /// Decodes the image once, already in the canonical layout for `mode`.
    pub fn open(path: impl AsRef<Path>, mode: ColorMode) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let image = image::open(&path).map_err(|e| {
            FrameError::Init(format!("cannot load image {}: {}", path.display(), e))
        })?;

        let (width, height) = (image.width(), image.height());
        let data = match mode {
            ColorMode::Color => image.to_rgb8().into_raw(),
            ColorMode::Grayscale => image.to_luma8().into_raw(),
        };
        let format = RawFormat::packed(width, height, mode.canonical_encoding());
        info!("Opened still image {:?}: {}", path, format);

        Ok(Self {
            path,
            data,
            format,
            served: 0,
            checked_out: false,
        })
    }
}

impl AcquisitionBackend for StillImageBackend {
    fn format(&self) -> RawFormat {
        self.format
    }

    fn description(&self) -> String {
        format!("image {} ({})", self.path.display(), self.format)
    }

    fn is_queued(&self) -> bool {
        false
    }

    fn dequeue(&mut self, _policy: DequeuePolicy) -> Result<Option<Slot>> {
        if self.checked_out {
            return Ok(None);
        }
        self.checked_out = true;
        let slot = Slot::new(0, self.data.len(), self.served);
        self.served += 1;
        Ok(Some(slot))
    }

    fn slot_data(&self, _slot: &Slot) -> &[u8] {
        &self.data
    }

    fn enqueue(&mut self, _slot: Slot) -> Result<()> {
        self.checked_out = false;
        Ok(())
    }

    fn stop(&mut self) -> Result<()> {
        Ok(())
    }

    fn resume(&mut self) -> Result<()> {
        Ok(())
    }

    fn restart(&mut self) -> Result<()> {
        self.served = 0;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::PixelEncoding;

    fn write_png(dir: &tempfile::TempDir) -> PathBuf {
        let path = dir.path().join("still.png");
        let img = image::RgbImage::from_fn(6, 4, |x, y| image::Rgb([x as u8 * 40, y as u8 * 60, 7]));
        img.save(&path).unwrap();
        path
    }

    #[test]
    fn test_color_image_is_served_as_rgb() {
        let dir = tempfile::tempdir().unwrap();
        let mut backend = StillImageBackend::open(write_png(&dir), ColorMode::Color).unwrap();
        assert_eq!(backend.format(), RawFormat::packed(6, 4, PixelEncoding::Rgb24));
        assert!(!backend.is_queued());

        let slot = backend.dequeue(DequeuePolicy::Poll).unwrap().unwrap();
        let data = backend.slot_data(&slot);
        assert_eq!(&data[3..6], &[40, 0, 7]);
        backend.enqueue(slot).unwrap();
    }

    #[test]
    fn test_grayscale_request_decodes_to_luma() {
        let dir = tempfile::tempdir().unwrap();
        let backend = StillImageBackend::open(write_png(&dir), ColorMode::Grayscale).unwrap();
        assert_eq!(backend.format().encoding, PixelEncoding::Gray8);
        assert_eq!(backend.data.len(), 24);
    }

    #[test]
    fn test_timestamps_advance_per_frame() {
        let dir = tempfile::tempdir().unwrap();
        let mut backend = StillImageBackend::open(write_png(&dir), ColorMode::Color).unwrap();
        for expected in 0..3 {
            let slot = backend.dequeue(DequeuePolicy::Poll).unwrap().unwrap();
            assert_eq!(slot.timestamp_us(), expected);
            backend.enqueue(slot).unwrap();
        }
    }

    #[test]
    fn test_missing_file_fails_to_open() {
        let dir = tempfile::tempdir().unwrap();
        let result = StillImageBackend::open(dir.path().join("nope.png"), ColorMode::Color);
        assert!(matches!(result, Err(FrameError::Init(_))));
    }
}
