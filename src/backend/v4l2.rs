//! Video4Linux2 capture through raw ioctls.
//!
//! Prefers memory-mapped streaming, where dequeue/enqueue map one-to-one onto
//! `VIDIOC_DQBUF`/`VIDIOC_QBUF`, and falls back to `read()` for drivers without
//! streaming support.

use super::{AcquisitionBackend, DequeuePolicy, DeviceInfo, RawFormat, Slot};
use crate::error::{FrameError, Result};
use crate::frame::{ColorMode, PixelEncoding};
use std::fs::{self, File, OpenOptions};
use std::io::{self, ErrorKind, Read};
use std::os::unix::fs::OpenOptionsExt;
use std::os::unix::io::{AsRawFd, RawFd};
use std::path::{Path, PathBuf};
use std::ptr;
use tracing::{debug, info, warn};

pub const DEFAULT_DEVICE: &str = "/dev/video0";

// V4L2 Constants
const VIDIOC_QUERYCAP: u64 = 0x80685600; // _IOR('V', 0, struct v4l2_capability)
const VIDIOC_ENUM_FMT: u64 = 0xC0405602; // _IOWR('V', 2, struct v4l2_fmtdesc)
const VIDIOC_G_FMT: u64 = 0xC0D05604; // _IOWR('V', 4, struct v4l2_format)
const VIDIOC_S_FMT: u64 = 0xC0D05605; // _IOWR('V', 5, struct v4l2_format)
const VIDIOC_REQBUFS: u64 = 0xC0145608; // _IOWR('V', 8, struct v4l2_requestbuffers)
const VIDIOC_QUERYBUF: u64 = 0xC0585609; // _IOWR('V', 9, struct v4l2_buffer)
const VIDIOC_QBUF: u64 = 0xC058560F; // _IOWR('V', 15, struct v4l2_buffer)
const VIDIOC_DQBUF: u64 = 0xC0585611; // _IOWR('V', 17, struct v4l2_buffer)
const VIDIOC_STREAMON: u64 = 0x40045612; // _IOW('V', 18, int)
const VIDIOC_STREAMOFF: u64 = 0x40045613; // _IOW('V', 19, int)
const VIDIOC_G_PARM: u64 = 0xC0CC5615; // _IOWR('V', 21, struct v4l2_streamparm)
const VIDIOC_S_PARM: u64 = 0xC0CC5616; // _IOWR('V', 22, struct v4l2_streamparm)

const V4L2_BUF_TYPE_VIDEO_CAPTURE: u32 = 1;
const V4L2_MEMORY_MMAP: u32 = 1;
const V4L2_FIELD_NONE: u32 = 1;
const V4L2_CAP_VIDEO_CAPTURE: u32 = 0x0000_0001;
const V4L2_CAP_READWRITE: u32 = 0x0100_0000;
const V4L2_CAP_STREAMING: u32 = 0x0400_0000;
const V4L2_CAP_DEVICE_CAPS: u32 = 0x8000_0000;
const V4L2_CAP_TIMEPERFRAME: u32 = 0x1000;

/// Asked for when no size is configured; drivers clamp it to their largest mode.
const OVERSIZED: u32 = 16384;

const fn fourcc(code: &[u8; 4]) -> u32 {
    u32::from_le_bytes(*code)
}

/// Pixel formats the converter understands, cheapest and most faithful first.
const COLOR_PREFERENCE: &[(u32, PixelEncoding)] = &[
    (fourcc(b"RGB3"), PixelEncoding::Rgb24),
    (fourcc(b"BGR3"), PixelEncoding::Bgr24),
    (fourcc(b"BGR4"), PixelEncoding::Bgr32),
    (fourcc(b"XR24"), PixelEncoding::Bgr32),
    (fourcc(b"YUYV"), PixelEncoding::Yuyv),
    (fourcc(b"UYVY"), PixelEncoding::Uyvy),
    (fourcc(b"NV12"), PixelEncoding::Nv12),
    (fourcc(b"YU12"), PixelEncoding::I420),
    (fourcc(b"GREY"), PixelEncoding::Gray8),
    (fourcc(b"Y16 "), PixelEncoding::Gray16Le),
    (fourcc(b"MJPG"), PixelEncoding::Mjpeg),
];

/// Luminance-carrying formats first so grayscale needs no color conversion.
const GRAY_PREFERENCE: &[(u32, PixelEncoding)] = &[
    (fourcc(b"GREY"), PixelEncoding::Gray8),
    (fourcc(b"Y16 "), PixelEncoding::Gray16Le),
    (fourcc(b"YUYV"), PixelEncoding::Yuyv),
    (fourcc(b"UYVY"), PixelEncoding::Uyvy),
    (fourcc(b"NV12"), PixelEncoding::Nv12),
    (fourcc(b"YU12"), PixelEncoding::I420),
    (fourcc(b"RGB3"), PixelEncoding::Rgb24),
    (fourcc(b"BGR3"), PixelEncoding::Bgr24),
    (fourcc(b"BGR4"), PixelEncoding::Bgr32),
    (fourcc(b"XR24"), PixelEncoding::Bgr32),
    (fourcc(b"MJPG"), PixelEncoding::Mjpeg),
];

#[allow(non_camel_case_types)]
#[repr(C)]
struct v4l2_capability {
    driver: [u8; 16],
    card: [u8; 32],
    bus_info: [u8; 32],
    version: u32,
    capabilities: u32,
    device_caps: u32,
    reserved: [u32; 3],
}

#[allow(non_camel_case_types)]
#[repr(C)]
struct v4l2_fmtdesc {
    index: u32,
    type_: u32,
    flags: u32,
    description: [u8; 32],
    pixelformat: u32,
    mbus_code: u32,
    reserved: [u32; 3],
}

#[allow(non_camel_case_types)]
#[repr(C)]
struct v4l2_format {
    type_: u32,
    fmt: v4l2_format_union,
}

#[allow(non_camel_case_types)]
#[repr(C)]
union v4l2_format_union {
    pix: v4l2_pix_format,
    raw_data: [u8; 200],
    _align: u64,
}

#[allow(non_camel_case_types)]
#[repr(C)]
#[derive(Debug, Clone, Copy)]
struct v4l2_pix_format {
    width: u32,
    height: u32,
    pixelformat: u32,
    field: u32,
    bytesperline: u32,
    sizeimage: u32,
    colorspace: u32,
    priv_: u32,
    flags: u32,
    ycbcr_enc: u32,
    quantization: u32,
    xfer_func: u32,
}

#[allow(non_camel_case_types)]
#[repr(C)]
struct v4l2_requestbuffers {
    count: u32,
    type_: u32,
    memory: u32,
    capabilities: u32,
    flags: u8,
    reserved: [u8; 3],
}

#[allow(non_camel_case_types)]
#[repr(C)]
struct v4l2_timecode {
    type_: u32,
    flags: u32,
    frames: u8,
    seconds: u8,
    minutes: u8,
    hours: u8,
    userbits: [u8; 4],
}

#[allow(non_camel_case_types)]
#[repr(C)]
union v4l2_buffer_m {
    offset: u32,
    userptr: libc::c_ulong,
    planes: *mut libc::c_void,
    fd: i32,
}

#[allow(non_camel_case_types)]
#[repr(C)]
struct v4l2_buffer {
    index: u32,
    type_: u32,
    bytesused: u32,
    flags: u32,
    field: u32,
    timestamp: libc::timeval,
    timecode: v4l2_timecode,
    sequence: u32,
    memory: u32,
    m: v4l2_buffer_m,
    length: u32,
    reserved2: u32,
    request_fd: i32,
}

#[allow(non_camel_case_types)]
#[repr(C)]
#[derive(Clone, Copy)]
struct v4l2_fract {
    numerator: u32,
    denominator: u32,
}

#[allow(non_camel_case_types)]
#[repr(C)]
struct v4l2_captureparm {
    capability: u32,
    capturemode: u32,
    timeperframe: v4l2_fract,
    extendedmode: u32,
    readbuffers: u32,
    reserved: [u32; 4],
    _rest: [u8; 160],
}

#[allow(non_camel_case_types)]
#[repr(C)]
struct v4l2_streamparm {
    type_: u32,
    parm: v4l2_captureparm,
}

fn zeroed<T>() -> T {
    // SAFETY: only used for the plain-data V4L2 structs above, for which all-zero is valid
    unsafe { std::mem::zeroed() }
}

fn xioctl<T>(fd: RawFd, request: u64, arg: &mut T) -> io::Result<()> {
    loop {
        // SAFETY: `arg` is the struct `request` is encoded for
        let r = unsafe { libc::ioctl(fd, request as _, arg as *mut T) };
        if r != -1 {
            return Ok(());
        }
        let err = io::Error::last_os_error();
        if err.kind() != ErrorKind::Interrupted {
            return Err(err);
        }
    }
}

fn c_string(bytes: &[u8]) -> String {
    let end = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
    String::from_utf8_lossy(&bytes[..end]).into_owned()
}

#[derive(Debug, Clone)]
pub struct V4l2Config {
    pub device: PathBuf,
    /// Requested size; `None` takes the largest the driver offers
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub fps: Option<u32>,
    /// Number of mmap buffers to request
    pub buffers: u32,
    pub mode: ColorMode,
}

impl Default for V4l2Config {
    fn default() -> Self {
        Self {
            device: PathBuf::from(DEFAULT_DEVICE),
            width: None,
            height: None,
            fps: None,
            buffers: 4,
            mode: ColorMode::Color,
        }
    }
}

struct MappedBuffer {
    ptr: *mut libc::c_void,
    length: usize,
}

enum Io {
    Mmap {
        buffers: Vec<MappedBuffer>,
        streaming: bool,
    },
    Read {
        buffer: Vec<u8>,
        checked_out: bool,
    },
}

pub struct V4l2Backend {
    device: File,
    path: PathBuf,
    card: String,
    format: RawFormat,
    fps: Option<f64>,
    io: Io,
    /// Driver timestamp of the first frame, frames are stamped relative to it
    epoch_us: Option<u64>,
}

// SAFETY: the mapped buffers belong to this backend alone and are only touched
// through `&self`/`&mut self`.
unsafe impl Send for V4l2Backend {}

impl V4l2Backend {
    pub fn open(config: &V4l2Config) -> Result<Self> {
        let path = &config.device;
        if !path.exists() {
            return Err(FrameError::Init(format!(
                "video device '{}' not found",
                path.display()
            )));
        }

        let device = OpenOptions::new()
            .read(true)
            .write(true)
            .custom_flags(libc::O_NONBLOCK)
            .open(path)
            .map_err(|e| {
                FrameError::Init(format!("failed to open '{}': {}", path.display(), e))
            })?;
        let fd = device.as_raw_fd();

        let cap = query_capabilities(fd)
            .map_err(|e| FrameError::Init(format!("{} is not a V4L2 device: {}", path.display(), e)))?;
        let caps = effective_caps(&cap);
        if caps & V4L2_CAP_VIDEO_CAPTURE == 0 {
            return Err(FrameError::Init(format!(
                "{} cannot capture video",
                path.display()
            )));
        }
        let card = c_string(&cap.card);

        let available = enumerate_formats(fd);
        let (fourcc, encoding) = choose_encoding(&available, config.mode).ok_or_else(|| {
            FrameError::Init(format!(
                "{} offers no supported pixel format (has {})",
                path.display(),
                available.iter().map(|&f| fourcc_name(f)).collect::<Vec<_>>().join(", ")
            ))
        })?;

        let pix = set_format(
            fd,
            fourcc,
            config.width.unwrap_or(OVERSIZED),
            config.height.unwrap_or(OVERSIZED),
        )?;
        if pix.pixelformat != fourcc {
            return Err(FrameError::Init(format!(
                "driver replaced {} with {}",
                fourcc_name(fourcc),
                fourcc_name(pix.pixelformat)
            )));
        }
        let (stride, size) = sanitize_geometry(encoding, pix.width, pix.height, pix.bytesperline, pix.sizeimage);
        let format = RawFormat {
            width: pix.width,
            height: pix.height,
            encoding,
            stride,
        };

        let fps = negotiate_frame_rate(fd, config.fps);

        let io = if caps & V4L2_CAP_STREAMING != 0 {
            let buffers = map_buffers(fd, config.buffers.max(2))?;
            Io::Mmap {
                buffers,
                streaming: false,
            }
        } else if caps & V4L2_CAP_READWRITE != 0 {
            warn!("{} has no streaming I/O, using read()", path.display());
            Io::Read {
                buffer: vec![0; size],
                checked_out: false,
            }
        } else {
            return Err(FrameError::Init(format!(
                "{} supports neither streaming nor read I/O",
                path.display()
            )));
        };

        let mut backend = Self {
            device,
            path: path.clone(),
            card,
            format,
            fps,
            io,
            epoch_us: None,
        };
        backend.stream_on()?;

        info!("Opened {}", backend.description());
        Ok(backend)
    }

    fn stream_on(&mut self) -> Result<()> {
        let fd = self.device.as_raw_fd();
        if let Io::Mmap { buffers, streaming } = &mut self.io {
            for index in 0..buffers.len() {
                queue_buffer(fd, index as u32).map_err(|e| FrameError::io("VIDIOC_QBUF", e))?;
            }
            let mut type_ = V4L2_BUF_TYPE_VIDEO_CAPTURE as libc::c_int;
            xioctl(fd, VIDIOC_STREAMON, &mut type_)
                .map_err(|e| FrameError::StreamControl(format!("VIDIOC_STREAMON: {}", e)))?;
            *streaming = true;
        }
        Ok(())
    }

    fn stream_off(&mut self) -> Result<()> {
        let fd = self.device.as_raw_fd();
        if let Io::Mmap { streaming, .. } = &mut self.io {
            if *streaming {
                let mut type_ = V4L2_BUF_TYPE_VIDEO_CAPTURE as libc::c_int;
                xioctl(fd, VIDIOC_STREAMOFF, &mut type_)
                    .map_err(|e| FrameError::StreamControl(format!("VIDIOC_STREAMOFF: {}", e)))?;
                *streaming = false;
            }
        }
        Ok(())
    }

    /// Waits until the device is readable. False on timeout.
    fn wait_readable(&self, policy: DequeuePolicy) -> Result<bool> {
        let timeout_ms = match policy {
            DequeuePolicy::Poll => 0,
            DequeuePolicy::Wait(d) => d.as_millis().min(i32::MAX as u128) as libc::c_int,
        };
        let mut pfd = libc::pollfd {
            fd: self.device.as_raw_fd(),
            events: libc::POLLIN,
            revents: 0,
        };
        loop {
            // SAFETY: one valid pollfd
            let r = unsafe { libc::poll(&mut pfd, 1, timeout_ms) };
            if r >= 0 {
                if pfd.revents & libc::POLLERR != 0 {
                    return Err(FrameError::Acquisition(format!(
                        "{} reported an error",
                        self.path.display()
                    )));
                }
                return Ok(r > 0);
            }
            let err = io::Error::last_os_error();
            if err.kind() != ErrorKind::Interrupted {
                return Err(FrameError::io("poll", err));
            }
        }
    }

    fn relative_timestamp(&mut self, absolute_us: u64) -> u64 {
        let epoch = *self.epoch_us.get_or_insert(absolute_us);
        absolute_us.saturating_sub(epoch)
    }
}

impl AcquisitionBackend for V4l2Backend {
    fn format(&self) -> RawFormat {
        self.format
    }

    fn description(&self) -> String {
        let rate = match self.fps {
            Some(fps) => format!("{:.1} fps", fps),
            None => "driver frame rate".to_string(),
        };
        let io = match &self.io {
            Io::Mmap { buffers, .. } => format!("{} mmap buffers", buffers.len()),
            Io::Read { .. } => "read()".to_string(),
        };
        format!(
            "{} ({}) {}, {}, {}",
            self.card,
            self.path.display(),
            self.format,
            rate,
            io
        )
    }

    fn is_queued(&self) -> bool {
        matches!(self.io, Io::Mmap { .. })
    }

    fn dequeue(&mut self, policy: DequeuePolicy) -> Result<Option<Slot>> {
        if let Io::Read { checked_out: true, .. } = self.io {
            return Ok(None);
        }
        if !self.wait_readable(policy)? {
            return Ok(None);
        }
        let fd = self.device.as_raw_fd();

        match &mut self.io {
            Io::Mmap { .. } => {
                let mut buf: v4l2_buffer = zeroed();
                buf.type_ = V4L2_BUF_TYPE_VIDEO_CAPTURE;
                buf.memory = V4L2_MEMORY_MMAP;
                match xioctl(fd, VIDIOC_DQBUF, &mut buf) {
                    Ok(()) => {}
                    Err(e) if e.kind() == ErrorKind::WouldBlock => return Ok(None),
                    Err(e) => return Err(FrameError::io("VIDIOC_DQBUF", e)),
                }
                let absolute =
                    buf.timestamp.tv_sec as u64 * 1_000_000 + buf.timestamp.tv_usec as u64;
                let ts = self.relative_timestamp(absolute);
                Ok(Some(Slot::new(buf.index as usize, buf.bytesused as usize, ts)))
            }
            Io::Read {
                buffer,
                checked_out,
            } => {
                let n = match self.device.read(buffer) {
                    Ok(n) => n,
                    Err(e) if e.kind() == ErrorKind::WouldBlock => return Ok(None),
                    Err(e) => return Err(FrameError::io("read", e)),
                };
                *checked_out = true;
                let now = monotonic_us();
                let ts = self.relative_timestamp(now);
                Ok(Some(Slot::new(0, n, ts)))
            }
        }
    }

    fn slot_data(&self, slot: &Slot) -> &[u8] {
        match &self.io {
            Io::Mmap { buffers, .. } => match buffers.get(slot.index()) {
                Some(b) => {
                    let len = slot.len().min(b.length);
                    // SAFETY: the slot is dequeued, so the driver is not writing this mapping
                    unsafe { std::slice::from_raw_parts(b.ptr as *const u8, len) }
                }
                None => &[],
            },
            Io::Read { buffer, .. } => &buffer[..slot.len().min(buffer.len())],
        }
    }

    fn enqueue(&mut self, slot: Slot) -> Result<()> {
        let fd = self.device.as_raw_fd();
        match &mut self.io {
            Io::Mmap { streaming, .. } => {
                // After STREAMOFF every buffer is back with us and gets queued on resume
                if *streaming {
                    queue_buffer(fd, slot.index() as u32)
                        .map_err(|e| FrameError::io("VIDIOC_QBUF", e))?;
                }
            }
            Io::Read { checked_out, .. } => *checked_out = false,
        }
        Ok(())
    }

    fn stop(&mut self) -> Result<()> {
        self.stream_off()?;
        debug!("{} stopped", self.path.display());
        Ok(())
    }

    fn resume(&mut self) -> Result<()> {
        self.stream_off()?;
        self.stream_on()?;
        debug!("{} resumed", self.path.display());
        Ok(())
    }
}

impl Drop for V4l2Backend {
    fn drop(&mut self) {
        if let Err(e) = self.stream_off() {
            warn!("{}", e);
        }
        if let Io::Mmap { buffers, .. } = &mut self.io {
            for b in buffers.drain(..) {
                // SAFETY: mapped in map_buffers with this length
                unsafe {
                    libc::munmap(b.ptr, b.length);
                }
            }
            let mut req: v4l2_requestbuffers = zeroed();
            req.type_ = V4L2_BUF_TYPE_VIDEO_CAPTURE;
            req.memory = V4L2_MEMORY_MMAP;
            let _ = xioctl(self.device.as_raw_fd(), VIDIOC_REQBUFS, &mut req);
        }
        debug!("Closed {}", self.path.display());
    }
}

fn monotonic_us() -> u64 {
    let mut ts = libc::timespec {
        tv_sec: 0,
        tv_nsec: 0,
    };
    // SAFETY: valid timespec out-pointer
    unsafe {
        libc::clock_gettime(libc::CLOCK_MONOTONIC, &mut ts);
    }
    ts.tv_sec as u64 * 1_000_000 + ts.tv_nsec as u64 / 1_000
}

fn query_capabilities(fd: RawFd) -> io::Result<v4l2_capability> {
    let mut cap: v4l2_capability = zeroed();
    xioctl(fd, VIDIOC_QUERYCAP, &mut cap)?;
    Ok(cap)
}

fn effective_caps(cap: &v4l2_capability) -> u32 {
    if cap.capabilities & V4L2_CAP_DEVICE_CAPS != 0 {
        cap.device_caps
    } else {
        cap.capabilities
    }
}

fn enumerate_formats(fd: RawFd) -> Vec<u32> {
    let mut formats = Vec::new();
    for index in 0.. {
        let mut desc: v4l2_fmtdesc = zeroed();
        desc.index = index;
        desc.type_ = V4L2_BUF_TYPE_VIDEO_CAPTURE;
        if xioctl(fd, VIDIOC_ENUM_FMT, &mut desc).is_err() {
            break;
        }
        debug!(
            "  format {}: {} ({})",
            index,
            fourcc_name(desc.pixelformat),
            c_string(&desc.description)
        );
        formats.push(desc.pixelformat);
    }
    formats
}

fn choose_encoding(available: &[u32], mode: ColorMode) -> Option<(u32, PixelEncoding)> {
    let table = match mode {
        ColorMode::Color => COLOR_PREFERENCE,
        ColorMode::Grayscale => GRAY_PREFERENCE,
    };
    table.iter().copied().find(|(code, _)| available.contains(code))
}

fn fourcc_name(code: u32) -> String {
    code.to_le_bytes().iter().map(|&b| b as char).collect()
}

fn set_format(fd: RawFd, pixelformat: u32, width: u32, height: u32) -> Result<v4l2_pix_format> {
    let mut fmt: v4l2_format = zeroed();
    fmt.type_ = V4L2_BUF_TYPE_VIDEO_CAPTURE;
    fmt.fmt.pix = v4l2_pix_format {
        width,
        height,
        pixelformat,
        field: V4L2_FIELD_NONE,
        bytesperline: 0,
        sizeimage: 0,
        colorspace: 0,
        priv_: 0,
        flags: 0,
        ycbcr_enc: 0,
        quantization: 0,
        xfer_func: 0,
    };
    xioctl(fd, VIDIOC_S_FMT, &mut fmt)
        .map_err(|e| FrameError::Init(format!("VIDIOC_S_FMT {}: {}", fourcc_name(pixelformat), e)))?;

    // Some drivers only fill in the result on a separate G_FMT
    let mut current: v4l2_format = zeroed();
    current.type_ = V4L2_BUF_TYPE_VIDEO_CAPTURE;
    xioctl(fd, VIDIOC_G_FMT, &mut current).map_err(|e| FrameError::io("VIDIOC_G_FMT", e))?;
    // SAFETY: the capture type selects the `pix` member
    let pix = unsafe { current.fmt.pix };
    debug!(
        "Driver accepted {}x{} {} (bytesperline {}, sizeimage {})",
        pix.width,
        pix.height,
        fourcc_name(pix.pixelformat),
        pix.bytesperline,
        pix.sizeimage
    );
    Ok(pix)
}

/// Repairs stride and image size values that buggy drivers under-report.
fn sanitize_geometry(
    encoding: PixelEncoding,
    width: u32,
    height: u32,
    bytesperline: u32,
    sizeimage: u32,
) -> (usize, usize) {
    if encoding == PixelEncoding::Mjpeg {
        return (0, sizeimage as usize);
    }
    let min_stride = encoding.row_bytes(width);
    let stride = if (bytesperline as usize) < min_stride {
        if bytesperline != 0 {
            warn!("Driver bytesperline {} too small, using {}", bytesperline, min_stride);
        }
        min_stride
    } else {
        bytesperline as usize
    };
    let min_size = encoding.frame_len(width, height, stride);
    let size = if (sizeimage as usize) < min_size {
        if sizeimage != 0 {
            warn!("Driver sizeimage {} too small, using {}", sizeimage, min_size);
        }
        min_size
    } else {
        sizeimage as usize
    };
    (stride, size)
}

fn negotiate_frame_rate(fd: RawFd, fps: Option<u32>) -> Option<f64> {
    let mut parm: v4l2_streamparm = zeroed();
    parm.type_ = V4L2_BUF_TYPE_VIDEO_CAPTURE;
    if xioctl(fd, VIDIOC_G_PARM, &mut parm).is_err() {
        return None;
    }
    if let Some(fps) = fps.filter(|&f| f > 0) {
        if parm.parm.capability & V4L2_CAP_TIMEPERFRAME != 0 {
            parm.parm.timeperframe = v4l2_fract {
                numerator: 1,
                denominator: fps,
            };
            if let Err(e) = xioctl(fd, VIDIOC_S_PARM, &mut parm) {
                warn!("Cannot set {} fps: {}", fps, e);
            }
        } else {
            warn!("Device has a fixed frame rate, ignoring {} fps", fps);
        }
    }
    let tpf = parm.parm.timeperframe;
    (tpf.numerator != 0).then(|| tpf.denominator as f64 / tpf.numerator as f64)
}

fn map_buffers(fd: RawFd, count: u32) -> Result<Vec<MappedBuffer>> {
    let mut req: v4l2_requestbuffers = zeroed();
    req.count = count;
    req.type_ = V4L2_BUF_TYPE_VIDEO_CAPTURE;
    req.memory = V4L2_MEMORY_MMAP;
    xioctl(fd, VIDIOC_REQBUFS, &mut req).map_err(|e| FrameError::io("VIDIOC_REQBUFS", e))?;
    if req.count < 2 {
        return Err(FrameError::Init(format!(
            "driver granted only {} capture buffers",
            req.count
        )));
    }

    let mut buffers = Vec::with_capacity(req.count as usize);
    for index in 0..req.count {
        let mut buf: v4l2_buffer = zeroed();
        buf.index = index;
        buf.type_ = V4L2_BUF_TYPE_VIDEO_CAPTURE;
        buf.memory = V4L2_MEMORY_MMAP;
        if let Err(e) = xioctl(fd, VIDIOC_QUERYBUF, &mut buf) {
            unmap_all(&mut buffers);
            return Err(FrameError::io("VIDIOC_QUERYBUF", e));
        }
        let length = buf.length as usize;
        // SAFETY: QUERYBUF fills the `offset` member for the MMAP memory type
        let offset = unsafe { buf.m.offset };
        // SAFETY: maps the driver buffer at the offset QUERYBUF reported
        let ptr = unsafe {
            libc::mmap(
                ptr::null_mut(),
                length,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                fd,
                offset as libc::off_t,
            )
        };
        if ptr == libc::MAP_FAILED {
            unmap_all(&mut buffers);
            return Err(FrameError::last_os_error("mmap capture buffer"));
        }
        buffers.push(MappedBuffer { ptr, length });
    }
    debug!("Mapped {} capture buffers", buffers.len());
    Ok(buffers)
}

fn unmap_all(buffers: &mut Vec<MappedBuffer>) {
    for b in buffers.drain(..) {
        // SAFETY: mapped by map_buffers with this length
        unsafe {
            libc::munmap(b.ptr, b.length);
        }
    }
}

fn queue_buffer(fd: RawFd, index: u32) -> io::Result<()> {
    let mut buf: v4l2_buffer = zeroed();
    buf.index = index;
    buf.type_ = V4L2_BUF_TYPE_VIDEO_CAPTURE;
    buf.memory = V4L2_MEMORY_MMAP;
    xioctl(fd, VIDIOC_QBUF, &mut buf)
}

/// Lists `/dev/video*` nodes that can capture.
pub fn enumerate_devices() -> Vec<DeviceInfo> {
    let Ok(entries) = fs::read_dir("/dev") else {
        return Vec::new();
    };
    let mut paths: Vec<PathBuf> = entries
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| {
            p.file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|n| n.starts_with("video"))
        })
        .collect();
    paths.sort();

    paths
        .into_iter()
        .filter_map(|path| probe_device(&path))
        .collect()
}

fn probe_device(path: &Path) -> Option<DeviceInfo> {
    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .custom_flags(libc::O_NONBLOCK)
        .open(path)
        .ok()?;
    let cap = query_capabilities(file.as_raw_fd()).ok()?;
    if effective_caps(&cap) & V4L2_CAP_VIDEO_CAPTURE == 0 {
        return None;
    }
    Some(DeviceInfo {
        id: format!("v4l2://{}", path.display()),
        name: c_string(&cap.card),
    })
}
