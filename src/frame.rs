//! Frame types and conversion into the canonical pixel formats.
//!
//! Every backend hands out [`RawFrame`] views in whatever encoding the hardware or
//! decoder produced. Consumers only ever see [`FrameBuffer`]s holding either RGB8
//! (3 bytes per pixel) or MONO8 (1 byte per pixel), selected by [`ColorMode`].

use crate::error::{FrameError, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Canonical output shape of a frame source. Fixed for the lifetime of a source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ColorMode {
    /// 8 bits per channel RGB
    #[default]
    Color,
    /// 8-bit luminance
    Grayscale,
}

impl ColorMode {
    /// Bytes per pixel of the canonical format.
    pub fn channels(self) -> u8 {
        match self {
            ColorMode::Color => 3,
            ColorMode::Grayscale => 1,
        }
    }

    /// The raw encoding that needs no conversion for this mode.
    pub fn canonical_encoding(self) -> PixelEncoding {
        match self {
            ColorMode::Color => PixelEncoding::Rgb24,
            ColorMode::Grayscale => PixelEncoding::Gray8,
        }
    }
}

/// Raw pixel encodings a backend may deliver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PixelEncoding {
    /// 8-bit luminance
    Gray8,
    /// 16-bit luminance, big endian (IIDC MONO16)
    Gray16Be,
    /// 16-bit luminance, little endian (V4L2 Y16)
    Gray16Le,
    /// R G B
    Rgb24,
    /// B G R
    Bgr24,
    /// B G R X
    Bgr32,
    /// YUV 4:2:2 packed (Y0 U0 Y1 V0)
    Yuyv,
    /// YUV 4:2:2 packed (U0 Y0 V0 Y1), the IIDC YUV422 byte order
    Uyvy,
    /// YUV 4:1:1 packed (U Y0 Y1 V Y2 Y3), IIDC only
    Yuv411,
    /// YUV 4:4:4 packed (U Y V)
    Yuv444,
    /// Y plane followed by interleaved UV plane
    Nv12,
    /// Y plane followed by U and V planes
    I420,
    /// Motion JPEG, one JPEG image per frame
    Mjpeg,
}

impl PixelEncoding {
    /// Bytes in one unpadded row of the first plane.
    pub fn row_bytes(&self, width: u32) -> usize {
        let w = width as usize;
        match self {
            PixelEncoding::Gray8 | PixelEncoding::Nv12 | PixelEncoding::I420 => w,
            PixelEncoding::Gray16Be | PixelEncoding::Gray16Le => w * 2,
            PixelEncoding::Yuyv | PixelEncoding::Uyvy => w * 2,
            PixelEncoding::Rgb24 | PixelEncoding::Bgr24 | PixelEncoding::Yuv444 => w * 3,
            PixelEncoding::Bgr32 => w * 4,
            PixelEncoding::Yuv411 => w * 3 / 2,
            PixelEncoding::Mjpeg => 0,
        }
    }

    /// Minimum number of bytes a frame of this geometry occupies. Compressed
    /// encodings report 0 since their size varies per frame.
    pub fn frame_len(&self, width: u32, height: u32, stride: usize) -> usize {
        let h = height as usize;
        if h == 0 {
            return 0;
        }
        match self {
            PixelEncoding::Mjpeg => 0,
            PixelEncoding::Nv12 => stride * h + stride * ((h + 1) / 2),
            PixelEncoding::I420 => stride * h + 2 * ((stride + 1) / 2) * ((h + 1) / 2),
            _ => stride * (h - 1) + self.row_bytes(width),
        }
    }

    fn is_subsampled(&self) -> bool {
        matches!(
            self,
            PixelEncoding::Yuyv
                | PixelEncoding::Uyvy
                | PixelEncoding::Yuv411
                | PixelEncoding::Nv12
                | PixelEncoding::I420
        )
    }
}

/// A borrowed view of one raw frame as the backend produced it.
///
/// For hardware backends `data` points straight into a DMA buffer; the view is only
/// valid while the frame is checked out.
#[derive(Debug, Clone, Copy)]
pub struct RawFrame<'a> {
    pub data: &'a [u8],
    pub width: u32,
    pub height: u32,
    /// Bytes between the starts of consecutive rows of the first plane
    pub stride: usize,
    pub encoding: PixelEncoding,
    /// Source-relative capture time in microseconds
    pub timestamp_us: u64,
}

impl<'a> RawFrame<'a> {
    /// Creates a view over tightly packed data.
    pub fn packed(data: &'a [u8], width: u32, height: u32, encoding: PixelEncoding) -> Self {
        Self {
            data,
            width,
            height,
            stride: encoding.row_bytes(width),
            encoding,
            timestamp_us: 0,
        }
    }

    fn validate(&self) -> Result<()> {
        if self.encoding != PixelEncoding::Mjpeg && self.stride < self.encoding.row_bytes(self.width) {
            return Err(FrameError::Acquisition(format!(
                "stride {} shorter than a {:?} row of width {}",
                self.stride, self.encoding, self.width
            )));
        }
        let needed = self.encoding.frame_len(self.width, self.height, self.stride);
        if self.data.len() < needed {
            return Err(FrameError::Acquisition(format!(
                "short {:?} frame: {} bytes, expected at least {}",
                self.encoding,
                self.data.len(),
                needed
            )));
        }
        if self.encoding.is_subsampled() && (self.width % 2 != 0 || self.height % 2 != 0) {
            return Err(FrameError::Unsupported(format!(
                "{:?} with odd dimensions {}x{}",
                self.encoding, self.width, self.height
            )));
        }
        Ok(())
    }

    /// Iterates the unpadded rows of the first plane.
    fn rows(&self) -> impl Iterator<Item = &'a [u8]> {
        let row_len = self.encoding.row_bytes(self.width);
        let data = self.data;
        let stride = self.stride.max(1);
        (0..self.height as usize).map(move |y| &data[y * stride..y * stride + row_len])
    }
}

/// A frame in canonical format (RGB8 or MONO8), owned by the consumer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameBuffer {
    pub width: u32,
    pub height: u32,
    /// 3 for RGB8, 1 for MONO8
    pub channels: u8,
    /// Always `width * channels`; rows are never padded
    pub stride: usize,
    pub data: Vec<u8>,
}

impl FrameBuffer {
    /// Allocates a zeroed buffer for the given geometry.
    pub fn new(width: u32, height: u32, mode: ColorMode) -> Self {
        let channels = mode.channels();
        let stride = width as usize * channels as usize;
        Self {
            width,
            height,
            channels,
            stride,
            data: vec![0; stride * height as usize],
        }
    }

    /// Wraps existing tightly packed canonical data.
    pub fn from_data(width: u32, height: u32, mode: ColorMode, data: Vec<u8>) -> Result<Self> {
        let channels = mode.channels();
        let stride = width as usize * channels as usize;
        if data.len() != stride * height as usize {
            return Err(FrameError::Conversion(format!(
                "{} bytes cannot hold a {}x{}x{} image",
                data.len(),
                width,
                height,
                channels
            )));
        }
        Ok(Self {
            width,
            height,
            channels,
            stride,
            data,
        })
    }

    pub fn color_mode(&self) -> ColorMode {
        if self.channels == 1 {
            ColorMode::Grayscale
        } else {
            ColorMode::Color
        }
    }

    /// Errors unless this buffer has exactly the given geometry.
    pub fn check_geometry(&self, width: u32, height: u32, channels: u8) -> Result<()> {
        if self.width != width
            || self.height != height
            || self.channels != channels
            || self.data.len() != width as usize * height as usize * channels as usize
        {
            return Err(FrameError::BufferMismatch {
                width,
                height,
                channels,
                actual_width: self.width,
                actual_height: self.height,
                actual_channels: self.channels,
            });
        }
        Ok(())
    }

    /// Writes the buffer to an image file; the format follows the extension.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let color = match self.color_mode() {
            ColorMode::Color => image::ColorType::Rgb8,
            ColorMode::Grayscale => image::ColorType::L8,
        };
        image::save_buffer(path, &self.data, self.width, self.height, color)?;
        Ok(())
    }
}

/// Converts a raw frame into `dst`, which must already have the raw frame's
/// dimensions and `mode`'s channel count.
pub fn convert_to_canonical(raw: &RawFrame<'_>, mode: ColorMode, dst: &mut FrameBuffer) -> Result<()> {
    dst.check_geometry(raw.width, raw.height, mode.channels())?;
    raw.validate()?;

    match mode {
        ColorMode::Color => to_rgb(raw, &mut dst.data),
        ColorMode::Grayscale => to_mono(raw, &mut dst.data),
    }
}

fn to_rgb(raw: &RawFrame<'_>, out: &mut [u8]) -> Result<()> {
    let row = raw.width as usize * 3;

    match raw.encoding {
        PixelEncoding::Rgb24 => {
            for (src, dst) in raw.rows().zip(out.chunks_exact_mut(row)) {
                dst.copy_from_slice(src);
            }
        }
        PixelEncoding::Bgr24 => {
            for (src, dst) in raw.rows().zip(out.chunks_exact_mut(row)) {
                for (s, d) in src.chunks_exact(3).zip(dst.chunks_exact_mut(3)) {
                    d.copy_from_slice(&[s[2], s[1], s[0]]);
                }
            }
        }
        PixelEncoding::Bgr32 => {
            for (src, dst) in raw.rows().zip(out.chunks_exact_mut(row)) {
                for (s, d) in src.chunks_exact(4).zip(dst.chunks_exact_mut(3)) {
                    d.copy_from_slice(&[s[2], s[1], s[0]]);
                }
            }
        }
        PixelEncoding::Gray8 => {
            for (src, dst) in raw.rows().zip(out.chunks_exact_mut(row)) {
                for (&y, d) in src.iter().zip(dst.chunks_exact_mut(3)) {
                    d.fill(y);
                }
            }
        }
        PixelEncoding::Gray16Be | PixelEncoding::Gray16Le => {
            let hi = if raw.encoding == PixelEncoding::Gray16Be { 0 } else { 1 };
            for (src, dst) in raw.rows().zip(out.chunks_exact_mut(row)) {
                for (s, d) in src.chunks_exact(2).zip(dst.chunks_exact_mut(3)) {
                    d.fill(s[hi]);
                }
            }
        }
        PixelEncoding::Yuv444 => {
            for (src, dst) in raw.rows().zip(out.chunks_exact_mut(row)) {
                for (s, d) in src.chunks_exact(3).zip(dst.chunks_exact_mut(3)) {
                    d.copy_from_slice(&yuv_to_rgb(s[1], s[0], s[2]));
                }
            }
        }
        PixelEncoding::Yuv411 => {
            for (src, dst) in raw.rows().zip(out.chunks_exact_mut(row)) {
                for (s, d) in src.chunks_exact(6).zip(dst.chunks_exact_mut(12)) {
                    let (u, v) = (s[0], s[3]);
                    for (i, &y) in [s[1], s[2], s[4], s[5]].iter().enumerate() {
                        d[i * 3..i * 3 + 3].copy_from_slice(&yuv_to_rgb(y, u, v));
                    }
                }
            }
        }
        PixelEncoding::Yuyv => {
            let packed = tight_rows(raw);
            ezk_yuv_to_rgb(ezk_image::PixelFormat::YUYV, &packed, raw, out)?;
        }
        PixelEncoding::Uyvy => {
            // ezk-image has no UYVY input, swap into YUYV order first
            let mut yuyv = tight_rows(raw);
            for pair in yuyv.chunks_exact_mut(2) {
                pair.swap(0, 1);
            }
            ezk_yuv_to_rgb(ezk_image::PixelFormat::YUYV, &yuyv, raw, out)?;
        }
        PixelEncoding::Nv12 => {
            let packed = tight_planes(raw);
            ezk_yuv_to_rgb(ezk_image::PixelFormat::NV12, &packed, raw, out)?;
        }
        PixelEncoding::I420 => {
            let packed = tight_planes(raw);
            ezk_yuv_to_rgb(ezk_image::PixelFormat::I420, &packed, raw, out)?;
        }
        PixelEncoding::Mjpeg => {
            let decoded = decode_jpeg(raw)?.to_rgb8();
            out.copy_from_slice(decoded.as_raw());
        }
    }
    Ok(())
}

fn to_mono(raw: &RawFrame<'_>, out: &mut [u8]) -> Result<()> {
    let row = raw.width as usize;

    match raw.encoding {
        PixelEncoding::Gray8 | PixelEncoding::Nv12 | PixelEncoding::I420 => {
            // planar formats: the first plane is the luminance
            for (src, dst) in raw.rows().zip(out.chunks_exact_mut(row)) {
                dst.copy_from_slice(src);
            }
        }
        PixelEncoding::Gray16Be | PixelEncoding::Gray16Le => {
            let hi = if raw.encoding == PixelEncoding::Gray16Be { 0 } else { 1 };
            for (src, dst) in raw.rows().zip(out.chunks_exact_mut(row)) {
                for (s, d) in src.chunks_exact(2).zip(dst.iter_mut()) {
                    *d = s[hi];
                }
            }
        }
        PixelEncoding::Rgb24 => rgb_rows_to_luma(raw, out.chunks_exact_mut(row), 3, [0, 1, 2]),
        PixelEncoding::Bgr24 => rgb_rows_to_luma(raw, out.chunks_exact_mut(row), 3, [2, 1, 0]),
        PixelEncoding::Bgr32 => rgb_rows_to_luma(raw, out.chunks_exact_mut(row), 4, [2, 1, 0]),
        PixelEncoding::Yuyv | PixelEncoding::Uyvy => {
            let offset = if raw.encoding == PixelEncoding::Yuyv { 0 } else { 1 };
            for (src, dst) in raw.rows().zip(out.chunks_exact_mut(row)) {
                for (s, d) in src.chunks_exact(2).zip(dst.iter_mut()) {
                    *d = s[offset];
                }
            }
        }
        PixelEncoding::Yuv444 => {
            for (src, dst) in raw.rows().zip(out.chunks_exact_mut(row)) {
                for (s, d) in src.chunks_exact(3).zip(dst.iter_mut()) {
                    *d = s[1];
                }
            }
        }
        PixelEncoding::Yuv411 => {
            for (src, dst) in raw.rows().zip(out.chunks_exact_mut(row)) {
                for (s, d) in src.chunks_exact(6).zip(dst.chunks_exact_mut(4)) {
                    d.copy_from_slice(&[s[1], s[2], s[4], s[5]]);
                }
            }
        }
        PixelEncoding::Mjpeg => {
            let decoded = decode_jpeg(raw)?.to_luma8();
            out.copy_from_slice(decoded.as_raw());
        }
    }
    Ok(())
}

fn rgb_rows_to_luma<'a>(
    raw: &RawFrame<'_>,
    out_rows: impl Iterator<Item = &'a mut [u8]>,
    bpp: usize,
    [r, g, b]: [usize; 3],
) {
    for (src, dst) in raw.rows().zip(out_rows) {
        for (s, d) in src.chunks_exact(bpp).zip(dst.iter_mut()) {
            *d = luma(s[r], s[g], s[b]);
        }
    }
}

/// BT.601 luma with 8-bit fixed point weights.
pub(crate) fn luma(r: u8, g: u8, b: u8) -> u8 {
    ((77 * r as u32 + 150 * g as u32 + 29 * b as u32 + 128) >> 8) as u8
}

/// Full range BT.601 YUV to RGB, as the IIDC cameras deliver it.
fn yuv_to_rgb(y: u8, u: u8, v: u8) -> [u8; 3] {
    let y = y as f32;
    let u = u as f32 - 128.0;
    let v = v as f32 - 128.0;
    [
        clamp_to_u8(y + 1.402 * v),
        clamp_to_u8(y - 0.344_136 * u - 0.714_136 * v),
        clamp_to_u8(y + 1.772 * u),
    ]
}

fn clamp_to_u8(value: f32) -> u8 {
    value.round().clamp(0.0, 255.0) as u8
}

fn decode_jpeg(raw: &RawFrame<'_>) -> Result<image::DynamicImage> {
    let decoded = image::load_from_memory_with_format(raw.data, image::ImageFormat::Jpeg)?;
    if decoded.width() != raw.width || decoded.height() != raw.height {
        return Err(FrameError::Acquisition(format!(
            "MJPEG frame decoded to {}x{}, expected {}x{}",
            decoded.width(),
            decoded.height(),
            raw.width,
            raw.height
        )));
    }
    Ok(decoded)
}

/// Copies the rows of a packed frame, dropping any row padding.
fn tight_rows(raw: &RawFrame<'_>) -> Vec<u8> {
    let mut packed = Vec::with_capacity(raw.encoding.row_bytes(raw.width) * raw.height as usize);
    for row in raw.rows() {
        packed.extend_from_slice(row);
    }
    packed
}

/// Copies a planar 4:2:0 frame into the tight layout ezk-image expects.
fn tight_planes(raw: &RawFrame<'_>) -> Vec<u8> {
    let w = raw.width as usize;
    let h = raw.height as usize;
    let stride = raw.stride;
    let mut packed = tight_rows(raw);
    let chroma = &raw.data[stride * h..];
    match raw.encoding {
        PixelEncoding::Nv12 => {
            for y in 0..h / 2 {
                packed.extend_from_slice(&chroma[y * stride..y * stride + w]);
            }
        }
        _ => {
            let c_stride = (stride + 1) / 2;
            let c_plane = c_stride * (h / 2);
            for plane in 0..2 {
                for y in 0..h / 2 {
                    let start = plane * c_plane + y * c_stride;
                    packed.extend_from_slice(&chroma[start..start + w / 2]);
                }
            }
        }
    }
    packed
}

fn ezk_yuv_to_rgb(
    format: ezk_image::PixelFormat,
    src: &[u8],
    raw: &RawFrame<'_>,
    out: &mut [u8],
) -> Result<()> {
    let width = raw.width as usize;
    let height = raw.height as usize;

    let dst_color = ezk_image::ColorInfo::RGB(ezk_image::RgbColorInfo {
        transfer: ezk_image::ColorTransfer::Linear,
        primaries: ezk_image::ColorPrimaries::BT709,
    });
    let mut dst_image = ezk_image::Image::from_buffer(
        ezk_image::PixelFormat::RGB,
        &mut out[..],
        None,
        width,
        height,
        dst_color,
    )
    .map_err(|e| FrameError::Conversion(format!("wrap RGB destination: {e:?}")))?;

    let src_color = ezk_image::ColorInfo::YUV(ezk_image::YuvColorInfo {
        transfer: ezk_image::ColorTransfer::Linear,
        primaries: ezk_image::ColorPrimaries::BT709,
        space: ezk_image::ColorSpace::BT709,
        full_range: false,
    });
    let src_image = ezk_image::Image::from_buffer(format, src, None, width, height, src_color)
        .map_err(|e| FrameError::Conversion(format!("wrap {:?} source: {e:?}", raw.encoding)))?;

    ezk_image::convert(&src_image, &mut dst_image)
        .map_err(|e| FrameError::Conversion(format!("{:?} to RGB: {e:?}", raw.encoding)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn convert(raw: &RawFrame<'_>, mode: ColorMode) -> FrameBuffer {
        let mut out = FrameBuffer::new(raw.width, raw.height, mode);
        convert_to_canonical(raw, mode, &mut out).unwrap();
        out
    }

    #[test]
    fn test_bgr_to_rgb_swaps_channels() {
        let bgr = vec![1, 2, 3, 4, 5, 6];
        let raw = RawFrame::packed(&bgr, 2, 1, PixelEncoding::Bgr24);
        assert_eq!(convert(&raw, ColorMode::Color).data, vec![3, 2, 1, 6, 5, 4]);
    }

    #[test]
    fn test_padded_rows_are_skipped() {
        // 2x2 gray with 2 bytes of padding per row
        let data = vec![10, 20, 0, 0, 30, 40, 0, 0];
        let raw = RawFrame {
            stride: 4,
            ..RawFrame::packed(&data, 2, 2, PixelEncoding::Gray8)
        };
        assert_eq!(convert(&raw, ColorMode::Grayscale).data, vec![10, 20, 30, 40]);
    }

    #[test]
    fn test_rgb_to_mono_uses_luma_weights() {
        let rgb = vec![255, 255, 255, 0, 0, 0, 255, 0, 0];
        let raw = RawFrame::packed(&rgb, 3, 1, PixelEncoding::Rgb24);
        let out = convert(&raw, ColorMode::Grayscale);
        assert_eq!(out.data, vec![255, 0, luma(255, 0, 0)]);
        assert_eq!(out.data[2], 77);
    }

    #[test]
    fn test_padded_bgr32_rows_to_mono() {
        // 1x2 BGRA with 4 bytes of row padding
        let data = vec![0, 0, 255, 0, 9, 9, 9, 9, 255, 0, 0, 0, 9, 9, 9, 9];
        let raw = RawFrame {
            stride: 8,
            ..RawFrame::packed(&data, 1, 2, PixelEncoding::Bgr32)
        };
        let out = convert(&raw, ColorMode::Grayscale);
        assert_eq!(out.data, vec![luma(255, 0, 0), luma(0, 0, 255)]);
    }

    #[test]
    fn test_gray_expands_to_rgb() {
        let gray = vec![7, 9];
        let raw = RawFrame::packed(&gray, 2, 1, PixelEncoding::Gray8);
        assert_eq!(convert(&raw, ColorMode::Color).data, vec![7, 7, 7, 9, 9, 9]);
    }

    #[test]
    fn test_yuyv_mono_takes_luma_bytes() {
        let yuyv = vec![10, 128, 20, 128, 30, 128, 40, 128];
        let raw = RawFrame::packed(&yuyv, 2, 2, PixelEncoding::Yuyv);
        assert_eq!(convert(&raw, ColorMode::Grayscale).data, vec![10, 20, 30, 40]);
    }

    #[test]
    fn test_yuv411_unpacks_four_pixels_per_group() {
        // one row of 4 pixels, repeated twice for an even height
        let row = [128, 1, 2, 128, 3, 4];
        let data = [row, row].concat();
        let raw = RawFrame::packed(&data, 4, 2, PixelEncoding::Yuv411);
        assert_eq!(convert(&raw, ColorMode::Grayscale).data, vec![1, 2, 3, 4, 1, 2, 3, 4]);

        let rgb = convert(&raw, ColorMode::Color);
        assert_eq!(&rgb.data[0..3], &[1, 1, 1]);
        assert_eq!(&rgb.data[9..12], &[4, 4, 4]);
    }

    #[test]
    fn test_big_endian_mono16_keeps_high_byte() {
        let data = vec![0xAB, 0x01, 0xCD, 0x02];
        let raw = RawFrame::packed(&data, 2, 1, PixelEncoding::Gray16Be);
        assert_eq!(convert(&raw, ColorMode::Grayscale).data, vec![0xAB, 0xCD]);
    }

    #[test]
    fn test_uyvy_neutral_chroma_is_gray() {
        let data = [128u8, 100].repeat(4 * 2);
        let raw = RawFrame::packed(&data, 4, 2, PixelEncoding::Uyvy);
        let out = convert(&raw, ColorMode::Color);
        for px in out.data.chunks_exact(3) {
            assert!(px[0].abs_diff(px[1]) <= 1 && px[1].abs_diff(px[2]) <= 1, "{px:?}");
        }
    }

    #[test]
    fn test_short_frame_is_rejected() {
        let data = vec![0u8; 5];
        let raw = RawFrame::packed(&data, 2, 1, PixelEncoding::Rgb24);
        let mut out = FrameBuffer::new(2, 1, ColorMode::Color);
        let err = convert_to_canonical(&raw, ColorMode::Color, &mut out).unwrap_err();
        assert!(matches!(err, FrameError::Acquisition(_)));
    }

    #[test]
    fn test_wrong_buffer_geometry_is_rejected() {
        let data = vec![0u8; 4];
        let raw = RawFrame::packed(&data, 2, 2, PixelEncoding::Gray8);
        let mut out = FrameBuffer::new(2, 2, ColorMode::Color);
        let err = convert_to_canonical(&raw, ColorMode::Grayscale, &mut out).unwrap_err();
        assert!(matches!(err, FrameError::BufferMismatch { channels: 1, actual_channels: 3, .. }));
    }
}
