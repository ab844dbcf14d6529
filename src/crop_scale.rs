//! Post-conversion crop and rescale stage.

use crate::error::{FrameError, Result};
use crate::frame::{ColorMode, FrameBuffer};
use fast_image_resize as fr;
use serde::{Deserialize, Serialize};

/// Region of the raw frame to keep. A non-positive width disables cropping.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct CropRect {
    pub x: i32,
    pub y: i32,
    pub w: i32,
    pub h: i32,
}

impl CropRect {
    /// No cropping.
    pub const NONE: CropRect = CropRect {
        x: -1,
        y: -1,
        w: -1,
        h: -1,
    };

    pub fn new(x: i32, y: i32, w: i32, h: i32) -> Self {
        Self { x, y, w, h }
    }

    pub fn is_empty(&self) -> bool {
        self.w <= 0
    }
}

/// Crops and/or scales canonical frames into the consumer's buffer.
///
/// Configured once per source. When neither crop nor scale is in effect the stage
/// is a passthrough and no scratch buffer exists, so conversion can write straight
/// into the caller's buffer.
pub struct CropScaler {
    crop: Option<CropRect>,
    scale: f64,
    raw_width: u32,
    raw_height: u32,
    mode: ColorMode,
    out_width: u32,
    out_height: u32,
    /// Raw-sized canonical buffer the converter writes into before cropping/scaling
    scratch: Option<FrameBuffer>,
    resizer: fr::Resizer,
}

impl CropScaler {
    /// Validates the configuration against the raw frame size and computes the
    /// output size `round(scale * (crop or raw size))`.
    pub fn setup(
        raw_width: u32,
        raw_height: u32,
        mode: ColorMode,
        crop: CropRect,
        scale: f64,
    ) -> Result<Self> {
        if !(scale.is_finite() && scale > 0.0) {
            return Err(FrameError::InvalidScale(scale));
        }

        let crop = if crop.is_empty() {
            None
        } else {
            let fits = crop.x >= 0
                && crop.y >= 0
                && crop.h > 0
                && crop.x as i64 + crop.w as i64 <= raw_width as i64
                && crop.y as i64 + crop.h as i64 <= raw_height as i64;
            if !fits {
                return Err(FrameError::InvalidCrop {
                    x: crop.x,
                    y: crop.y,
                    w: crop.w,
                    h: crop.h,
                    width: raw_width,
                    height: raw_height,
                });
            }
            Some(crop)
        };

        let (base_width, base_height) = match crop {
            Some(c) => (c.w as u32, c.h as u32),
            None => (raw_width, raw_height),
        };
        let out_width = scaled(base_width, scale);
        let out_height = scaled(base_height, scale);

        let scratch = if crop.is_some() || scale != 1.0 {
            Some(FrameBuffer::new(raw_width, raw_height, mode))
        } else {
            None
        };

        Ok(Self {
            crop,
            scale,
            raw_width,
            raw_height,
            mode,
            out_width,
            out_height,
            scratch,
            resizer: fr::Resizer::new(),
        })
    }

    /// Size of the frames this stage produces.
    pub fn output_size(&self) -> (u32, u32) {
        (self.out_width, self.out_height)
    }

    pub fn is_passthrough(&self) -> bool {
        self.scratch.is_none()
    }

    /// Crops and rescales `src` (raw size) into `dst` (output size).
    pub fn apply(&mut self, src: &FrameBuffer, dst: &mut FrameBuffer) -> Result<()> {
        let channels = self.mode.channels();
        src.check_geometry(self.raw_width, self.raw_height, channels)?;
        dst.check_geometry(self.out_width, self.out_height, channels)?;

        if self.scale == 1.0 {
            match self.crop {
                Some(crop) => copy_region(src, dst, crop),
                None => dst.data.copy_from_slice(&src.data),
            }
            return Ok(());
        }

        let pixel_type = match self.mode {
            ColorMode::Color => fr::PixelType::U8x3,
            ColorMode::Grayscale => fr::PixelType::U8,
        };
        let src_image = fr::images::ImageRef::new(src.width, src.height, &src.data, pixel_type)
            .map_err(|e| FrameError::Resize(format!("{e:?}")))?;
        let mut dst_image =
            fr::images::Image::from_slice_u8(dst.width, dst.height, &mut dst.data, pixel_type)
                .map_err(|e| FrameError::Resize(format!("{e:?}")))?;

        let mut options = fr::ResizeOptions::new()
            .resize_alg(fr::ResizeAlg::Convolution(fr::FilterType::CatmullRom));
        if let Some(c) = self.crop {
            options = options.crop(c.x as f64, c.y as f64, c.w as f64, c.h as f64);
        }

        self.resizer
            .resize(&src_image, &mut dst_image, &options)
            .map_err(|e| FrameError::Resize(format!("{e:?}")))
    }

    pub(crate) fn take_scratch(&mut self) -> Option<FrameBuffer> {
        self.scratch.take()
    }

    pub(crate) fn restore_scratch(&mut self, scratch: FrameBuffer) {
        self.scratch = Some(scratch);
    }
}

fn scaled(dim: u32, scale: f64) -> u32 {
    ((dim as f64 * scale).round() as u32).max(1)
}

fn copy_region(src: &FrameBuffer, dst: &mut FrameBuffer, crop: CropRect) {
    let channels = src.channels as usize;
    let row_len = crop.w as usize * channels;
    let x0 = crop.x as usize * channels;
    for (y, dst_row) in dst.data.chunks_exact_mut(row_len).enumerate() {
        let start = (crop.y as usize + y) * src.stride + x0;
        dst_row.copy_from_slice(&src.data[start..start + row_len]);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gradient(width: u32, height: u32) -> FrameBuffer {
        let data = (0..width * height).map(|i| (i % width + i / width) as u8).collect();
        FrameBuffer::from_data(width, height, ColorMode::Grayscale, data).unwrap()
    }

    #[test]
    fn test_output_size_follows_crop_then_scale() {
        let s = CropScaler::setup(640, 480, ColorMode::Color, CropRect::new(10, 20, 100, 100), 2.0)
            .unwrap();
        assert_eq!(s.output_size(), (200, 200));

        let s = CropScaler::setup(640, 480, ColorMode::Color, CropRect::NONE, 0.5).unwrap();
        assert_eq!(s.output_size(), (320, 240));

        let s = CropScaler::setup(640, 480, ColorMode::Color, CropRect::new(0, 0, 101, 51), 1.5)
            .unwrap();
        assert_eq!(s.output_size(), (152, 77));
    }

    #[test]
    fn test_trivial_configuration_is_passthrough() {
        let s = CropScaler::setup(640, 480, ColorMode::Grayscale, CropRect::NONE, 1.0).unwrap();
        assert!(s.is_passthrough());
        assert_eq!(s.output_size(), (640, 480));

        let s = CropScaler::setup(640, 480, ColorMode::Grayscale, CropRect::default(), 1.0).unwrap();
        assert!(s.is_passthrough());
    }

    #[test]
    fn test_crop_outside_frame_is_rejected() {
        let err = CropScaler::setup(64, 48, ColorMode::Color, CropRect::new(40, 0, 30, 10), 1.0)
            .err()
            .unwrap();
        assert!(matches!(err, FrameError::InvalidCrop { .. }));

        let err = CropScaler::setup(64, 48, ColorMode::Color, CropRect::new(-1, 0, 10, 10), 1.0)
            .err()
            .unwrap();
        assert!(matches!(err, FrameError::InvalidCrop { .. }));
    }

    #[test]
    fn test_bad_scale_is_rejected() {
        for scale in [0.0, -1.0, f64::NAN, f64::INFINITY] {
            let err = CropScaler::setup(64, 48, ColorMode::Color, CropRect::NONE, scale)
                .err()
                .unwrap();
            assert!(matches!(err, FrameError::InvalidScale(_)));
        }
    }

    #[test]
    fn test_crop_without_scale_copies_region_exactly() {
        let src = gradient(16, 8);
        let mut s = CropScaler::setup(16, 8, ColorMode::Grayscale, CropRect::new(3, 2, 4, 3), 1.0)
            .unwrap();
        let (w, h) = s.output_size();
        let mut dst = FrameBuffer::new(w, h, ColorMode::Grayscale);
        s.apply(&src, &mut dst).unwrap();
        assert_eq!(dst.data, vec![5, 6, 7, 8, 6, 7, 8, 9, 7, 8, 9, 10]);
    }

    #[test]
    fn test_scaling_constant_image_stays_constant() {
        let src = FrameBuffer::from_data(40, 30, ColorMode::Color, vec![90; 40 * 30 * 3]).unwrap();
        let mut s = CropScaler::setup(40, 30, ColorMode::Color, CropRect::new(0, 0, 20, 10), 2.0)
            .unwrap();
        let mut dst = FrameBuffer::new(40, 20, ColorMode::Color);
        s.apply(&src, &mut dst).unwrap();
        assert!(dst.data.iter().all(|&v| v.abs_diff(90) <= 1));
    }

    #[test]
    fn test_apply_checks_buffer_geometry() {
        let src = gradient(16, 8);
        let mut s = CropScaler::setup(16, 8, ColorMode::Grayscale, CropRect::NONE, 0.5).unwrap();
        let mut wrong = FrameBuffer::new(16, 8, ColorMode::Grayscale);
        assert!(matches!(
            s.apply(&src, &mut wrong),
            Err(FrameError::BufferMismatch { .. })
        ));
    }
}
