//! IEEE-1394 (IIDC/DCAM) cameras through libdc1394.
//!
//! All cameras share one libdc1394 context and bus enumeration. The context is
//! created when the first camera opens and freed when the last one closes.

mod ffi;

use super::{AcquisitionBackend, DequeuePolicy, DeviceInfo, RawFormat, Slot};
use crate::error::{FrameError, Result};
use crate::frame::{ColorMode, PixelEncoding};
use crate::utils::lock;
use ffi::*;
use std::collections::{HashMap, HashSet};
use std::ffi::CStr;
use std::ptr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use tracing::{debug, info, warn};

const DMA_BUFFERS: u32 = 5;

#[derive(Debug, Clone)]
pub struct IidcConfig {
    /// Camera to open; 0 picks the first camera not already in use
    pub guid: u64,
    /// Release every isochronous channel and all bandwidth before opening.
    /// Breaks any other program reading the bus; done at most once per process.
    pub reset_bus: bool,
    pub mode: ColorMode,
}

impl Default for IidcConfig {
    fn default() -> Self {
        Self {
            guid: 0,
            reset_bus: false,
            mode: ColorMode::Color,
        }
    }
}

fn error_string(err: dc1394error_t) -> String {
    // SAFETY: libdc1394 returns a static string for every error code
    let s = unsafe { dc1394_error_get_string(err) };
    if s.is_null() {
        return format!("dc1394 error {}", err);
    }
    // SAFETY: non-null, NUL-terminated static string
    unsafe { CStr::from_ptr(s) }.to_string_lossy().into_owned()
}

fn check(err: dc1394error_t, what: &str) -> Result<()> {
    if err == DC1394_SUCCESS {
        Ok(())
    } else {
        Err(FrameError::Init(format!("{}: {}", what, error_string(err))))
    }
}

/// The libdc1394 context plus the camera list enumerated with it.
struct Bus {
    context: *mut dc1394_t,
    list: *mut dc1394camera_list_t,
    in_use: Mutex<HashSet<u64>>,
}

// SAFETY: libdc1394 contexts may be used from any thread; camera handles
// derived from it are owned by exactly one backend.
unsafe impl Send for Bus {}
unsafe impl Sync for Bus {}

static BUS: Mutex<Weak<Bus>> = Mutex::new(Weak::new());
static BUS_RESET_DONE: AtomicBool = AtomicBool::new(false);

impl Bus {
    fn shared() -> Result<Arc<Bus>> {
        let mut slot = lock(&BUS);
        if let Some(bus) = slot.upgrade() {
            return Ok(bus);
        }

        // SAFETY: plain constructor
        let context = unsafe { dc1394_new() };
        if context.is_null() {
            return Err(FrameError::Init("libdc1394 initialization failed".into()));
        }
        let mut list = ptr::null_mut();
        // SAFETY: valid context and out-pointer
        let err = unsafe { dc1394_camera_enumerate(context, &mut list) };
        if err != DC1394_SUCCESS || list.is_null() {
            // SAFETY: created above, nothing else references it
            unsafe { dc1394_free(context) };
            return Err(FrameError::Init(format!(
                "failed to enumerate cameras: {}",
                error_string(err)
            )));
        }

        let bus = Arc::new(Bus {
            context,
            list,
            in_use: Mutex::new(HashSet::new()),
        });
        info!("IEEE-1394 bus initialized, {} cameras", bus.guids().len());
        *slot = Arc::downgrade(&bus);
        Ok(bus)
    }

    fn guids(&self) -> Vec<(u64, u16)> {
        // SAFETY: `list` stays valid until Drop
        let list = unsafe { &*self.list };
        if list.ids.is_null() {
            return Vec::new();
        }
        // SAFETY: libdc1394 allocates `num` ids
        let ids = unsafe { std::slice::from_raw_parts(list.ids, list.num as usize) };
        ids.iter().map(|id| (id.guid, id.unit)).collect()
    }
}

impl Drop for Bus {
    fn drop(&mut self) {
        // SAFETY: last reference; every camera created from the context is already freed
        unsafe {
            dc1394_camera_free_list(self.list);
            dc1394_free(self.context);
        }
        debug!("IEEE-1394 bus released");
    }
}

/// Lists cameras on the bus by GUID.
pub fn enumerate_cameras() -> Result<Vec<DeviceInfo>> {
    let bus = Bus::shared()?;
    Ok(bus
        .guids()
        .into_iter()
        .map(|(guid, unit)| DeviceInfo {
            id: format!("iidc://{:016x}", guid),
            name: format!("IIDC camera unit {}", unit),
        })
        .collect())
}

/// Desirability of a mode's resolution; 0 is unusable (format 7, EXIF).
fn resolution_rank(mode: dc1394video_mode_t) -> u8 {
    match mode {
        DC1394_VIDEO_MODE_160X120_YUV444 => 1,
        DC1394_VIDEO_MODE_320X240_YUV422 => 2,
        DC1394_VIDEO_MODE_640X480_MONO8
        | DC1394_VIDEO_MODE_640X480_MONO16
        | DC1394_VIDEO_MODE_640X480_YUV411
        | DC1394_VIDEO_MODE_640X480_YUV422
        | DC1394_VIDEO_MODE_640X480_RGB8 => 3,
        DC1394_VIDEO_MODE_800X600_MONO8
        | DC1394_VIDEO_MODE_800X600_MONO16
        | DC1394_VIDEO_MODE_800X600_YUV422
        | DC1394_VIDEO_MODE_800X600_RGB8 => 4,
        DC1394_VIDEO_MODE_1024X768_YUV422
        | DC1394_VIDEO_MODE_1024X768_RGB8
        | DC1394_VIDEO_MODE_1024X768_MONO8
        | DC1394_VIDEO_MODE_1024X768_MONO16 => 5,
        DC1394_VIDEO_MODE_1280X960_YUV422
        | DC1394_VIDEO_MODE_1280X960_RGB8
        | DC1394_VIDEO_MODE_1280X960_MONO8
        | DC1394_VIDEO_MODE_1280X960_MONO16 => 6,
        DC1394_VIDEO_MODE_1600X1200_YUV422
        | DC1394_VIDEO_MODE_1600X1200_RGB8
        | DC1394_VIDEO_MODE_1600X1200_MONO8
        | DC1394_VIDEO_MODE_1600X1200_MONO16 => 7,
        _ => 0,
    }
}

/// Desirability of a mode's color coding; 0 is unusable. MONO8 ranks above
/// everything when grayscale output was asked for.
fn colormode_rank(mode: dc1394video_mode_t, color: ColorMode) -> u8 {
    match mode {
        DC1394_VIDEO_MODE_640X480_MONO8
        | DC1394_VIDEO_MODE_800X600_MONO8
        | DC1394_VIDEO_MODE_1024X768_MONO8
        | DC1394_VIDEO_MODE_1280X960_MONO8
        | DC1394_VIDEO_MODE_1600X1200_MONO8 => match color {
            ColorMode::Color => 2,
            ColorMode::Grayscale => 7,
        },
        DC1394_VIDEO_MODE_640X480_MONO16
        | DC1394_VIDEO_MODE_800X600_MONO16
        | DC1394_VIDEO_MODE_1024X768_MONO16
        | DC1394_VIDEO_MODE_1280X960_MONO16
        | DC1394_VIDEO_MODE_1600X1200_MONO16 => 1,
        DC1394_VIDEO_MODE_640X480_YUV411 => 3,
        DC1394_VIDEO_MODE_320X240_YUV422
        | DC1394_VIDEO_MODE_640X480_YUV422
        | DC1394_VIDEO_MODE_800X600_YUV422
        | DC1394_VIDEO_MODE_1024X768_YUV422
        | DC1394_VIDEO_MODE_1280X960_YUV422
        | DC1394_VIDEO_MODE_1600X1200_YUV422 => 4,
        DC1394_VIDEO_MODE_160X120_YUV444 => 5,
        DC1394_VIDEO_MODE_640X480_RGB8
        | DC1394_VIDEO_MODE_800X600_RGB8
        | DC1394_VIDEO_MODE_1024X768_RGB8
        | DC1394_VIDEO_MODE_1280X960_RGB8
        | DC1394_VIDEO_MODE_1600X1200_RGB8 => 6,
        _ => 0,
    }
}

/// Highest resolution first, then the best color coding at that resolution.
fn choose_mode(modes: &[dc1394video_mode_t], color: ColorMode) -> Option<dc1394video_mode_t> {
    modes
        .iter()
        .copied()
        .filter(|&m| resolution_rank(m) > 0 && colormode_rank(m, color) > 0)
        .max_by_key(|&m| (resolution_rank(m), colormode_rank(m, color)))
}

fn encoding_for(coding: dc1394color_coding_t) -> Option<PixelEncoding> {
    match coding {
        DC1394_COLOR_CODING_MONO8 => Some(PixelEncoding::Gray8),
        DC1394_COLOR_CODING_MONO16 => Some(PixelEncoding::Gray16Be),
        DC1394_COLOR_CODING_YUV411 => Some(PixelEncoding::Yuv411),
        DC1394_COLOR_CODING_YUV422 => Some(PixelEncoding::Uyvy),
        DC1394_COLOR_CODING_YUV444 => Some(PixelEncoding::Yuv444),
        DC1394_COLOR_CODING_RGB8 => Some(PixelEncoding::Rgb24),
        _ => None,
    }
}

pub struct IidcBackend {
    camera: *mut dc1394camera_t,
    guid: u64,
    format: RawFormat,
    framerate: f32,
    info: String,
    /// Frames handed out, by frame id
    checked_out: HashMap<usize, *mut dc1394video_frame_t>,
    transmitting: bool,
    epoch_us: Option<u64>,
    bus: Arc<Bus>,
}

// SAFETY: the camera handle and its frames are only used through this backend.
unsafe impl Send for IidcBackend {}

impl IidcBackend {
    pub fn open(config: &IidcConfig) -> Result<Self> {
        let bus = Bus::shared()?;
        let (camera, guid) = open_camera(&bus, config.guid)?;

        // Everything after this point frees the camera on failure through Drop
        let mut backend = Self {
            camera,
            guid,
            format: RawFormat::packed(0, 0, PixelEncoding::Gray8),
            framerate: 0.0,
            info: String::new(),
            checked_out: HashMap::new(),
            transmitting: false,
            epoch_us: None,
            bus,
        };

        if config.reset_bus && !BUS_RESET_DONE.swap(true, Ordering::SeqCst) {
            warn!("Cleaning up the IEEE-1394 stack, this may log errors");
            // SAFETY: valid camera handle; failures here are expected and ignored
            unsafe {
                dc1394_iso_release_bandwidth(camera, i32::MAX);
                for channel in 0..64 {
                    dc1394_iso_release_channel(camera, channel);
                }
            }
        }

        backend.configure(config.mode)?;
        info!("Opened {}", backend.description());
        Ok(backend)
    }

    fn configure(&mut self, color: ColorMode) -> Result<()> {
        let camera = self.camera;

        // SAFETY: zeroed out-struct filled by libdc1394
        let mut modes: dc1394video_modes_t = unsafe { std::mem::zeroed() };
        check(
            unsafe { dc1394_video_get_supported_modes(camera, &mut modes) },
            "can't get video modes",
        )?;
        let available = &modes.modes[..(modes.num as usize).min(DC1394_VIDEO_MODE_NUM)];
        let video_mode = choose_mode(available, color).ok_or_else(|| {
            FrameError::Init(
                "no known resolution/colormode supported, maybe a format7-only camera".into(),
            )
        })?;

        // SAFETY: zeroed out-struct filled by libdc1394
        let mut rates: dc1394framerates_t = unsafe { std::mem::zeroed() };
        check(
            unsafe { dc1394_video_get_supported_framerates(camera, video_mode, &mut rates) },
            "could not get framerates",
        )?;
        // The framerate enum is ordered slowest to fastest
        let framerate = rates.framerates[..(rates.num as usize).min(DC1394_FRAMERATE_NUM)]
            .iter()
            .copied()
            .max()
            .unwrap_or(DC1394_FRAMERATE_MIN);

        // SAFETY: valid camera handle for every call below
        unsafe {
            if dc1394_video_set_operation_mode(camera, DC1394_OPERATION_MODE_1394B) == DC1394_SUCCESS {
                check(
                    dc1394_video_set_iso_speed(camera, DC1394_ISO_SPEED_800),
                    "could not set iso speed",
                )?;
            } else {
                check(
                    dc1394_video_set_operation_mode(camera, DC1394_OPERATION_MODE_LEGACY),
                    "could not set operation mode",
                )?;
                check(
                    dc1394_video_set_iso_speed(camera, DC1394_ISO_SPEED_400),
                    "could not set iso speed",
                )?;
            }
            check(dc1394_video_set_mode(camera, video_mode), "could not set video mode")?;
            check(dc1394_video_set_framerate(camera, framerate), "could not set framerate")?;
            check(
                dc1394_capture_setup(camera, DMA_BUFFERS, DC1394_CAPTURE_FLAGS_DEFAULT),
                "could not set up capture",
            )?;
            check(
                dc1394_video_set_transmission(camera, DC1394_ON),
                "could not start iso transmission",
            )?;
        }
        self.transmitting = true;

        let (mut width, mut height) = (0u32, 0u32);
        let mut coding: dc1394color_coding_t = 0;
        let mut fps: f32 = 0.0;
        // SAFETY: valid handle and out-pointers
        unsafe {
            check(
                dc1394_get_image_size_from_video_mode(camera, video_mode, &mut width, &mut height),
                "could not get image size",
            )?;
            check(
                dc1394_get_color_coding_from_video_mode(camera, video_mode, &mut coding),
                "could not get color coding",
            )?;
            dc1394_framerate_as_float(framerate, &mut fps);
        }
        let encoding = encoding_for(coding)
            .ok_or_else(|| FrameError::Init(format!("unsupported color coding {}", coding)))?;

        self.format = RawFormat::packed(width, height, encoding);
        self.framerate = fps;
        self.info = camera_info(camera);
        Ok(())
    }

    fn set_transmission(&mut self, on: bool) -> Result<()> {
        let switch = if on { DC1394_ON } else { DC1394_OFF };
        // SAFETY: valid camera handle
        let err = unsafe { dc1394_video_set_transmission(self.camera, switch) };
        if err != DC1394_SUCCESS {
            return Err(FrameError::StreamControl(error_string(err)));
        }
        self.transmitting = on;
        Ok(())
    }

    /// Drops every frame sitting in the DMA ring.
    fn flush(&mut self) -> Result<()> {
        while let Some(slot) = self.dequeue(DequeuePolicy::Poll)? {
            self.enqueue(slot)?;
        }
        Ok(())
    }

    fn wait_readable(&self, policy: DequeuePolicy) -> Result<bool> {
        let timeout_ms = match policy {
            DequeuePolicy::Poll => return Ok(true),
            DequeuePolicy::Wait(d) => d.as_millis().min(i32::MAX as u128) as libc::c_int,
        };
        // SAFETY: valid camera handle with capture set up
        let fd = unsafe { dc1394_capture_get_fileno(self.camera) };
        let mut pfd = libc::pollfd {
            fd,
            events: libc::POLLIN,
            revents: 0,
        };
        loop {
            // SAFETY: one valid pollfd
            let r = unsafe { libc::poll(&mut pfd, 1, timeout_ms) };
            if r >= 0 {
                return Ok(r > 0);
            }
            let err = std::io::Error::last_os_error();
            if err.kind() != std::io::ErrorKind::Interrupted {
                return Err(FrameError::io("poll", err));
            }
        }
    }
}

fn open_camera(bus: &Bus, guid: u64) -> Result<(*mut dc1394camera_t, u64)> {
    let mut in_use = lock(&bus.in_use);
    let candidates: Vec<u64> = if guid == 0 {
        bus.guids()
            .into_iter()
            .map(|(g, _)| g)
            .filter(|g| !in_use.contains(g))
            .collect()
    } else {
        vec![guid]
    };
    if candidates.is_empty() {
        return Err(FrameError::Init("no more cameras left to open".into()));
    }

    for candidate in candidates {
        // SAFETY: valid context
        let camera = unsafe { dc1394_camera_new(bus.context, candidate) };
        if !camera.is_null() {
            in_use.insert(candidate);
            return Ok((camera, candidate));
        }
        debug!("Camera {:016x} did not open", candidate);
    }
    Err(FrameError::Init("failed to initialize a camera".into()))
}

/// libdc1394's own camera report, which it only writes to a `FILE*`.
fn camera_info(camera: *mut dc1394camera_t) -> String {
    let mut buf: *mut libc::c_char = ptr::null_mut();
    let mut len: libc::size_t = 0;
    // SAFETY: open_memstream allocates `buf`, freed below after fclose
    unsafe {
        let stream = libc::open_memstream(&mut buf, &mut len);
        if stream.is_null() {
            return String::new();
        }
        let err = dc1394_camera_print_info(camera, stream);
        libc::fclose(stream);
        if buf.is_null() {
            return String::new();
        }
        let info = if err == DC1394_SUCCESS {
            CStr::from_ptr(buf).to_string_lossy().trim().to_string()
        } else {
            String::new()
        };
        libc::free(buf as *mut libc::c_void);
        info
    }
}

impl AcquisitionBackend for IidcBackend {
    fn format(&self) -> RawFormat {
        self.format
    }

    fn description(&self) -> String {
        let mut text = format!(
            "IIDC camera {:016x} {}, {:.3} fps",
            self.guid, self.format, self.framerate
        );
        if !self.info.is_empty() {
            text.push('\n');
            text.push_str(&self.info);
        }
        text
    }

    fn is_queued(&self) -> bool {
        true
    }

    fn dequeue(&mut self, policy: DequeuePolicy) -> Result<Option<Slot>> {
        if !self.wait_readable(policy)? {
            return Ok(None);
        }
        let mut frame: *mut dc1394video_frame_t = ptr::null_mut();
        // SAFETY: valid handle and out-pointer
        let err = unsafe { dc1394_capture_dequeue(self.camera, DC1394_CAPTURE_POLICY_POLL, &mut frame) };
        if err != DC1394_SUCCESS {
            return Err(FrameError::Acquisition(format!(
                "could not capture a frame: {}",
                error_string(err)
            )));
        }
        if frame.is_null() {
            return Ok(None);
        }

        // SAFETY: libdc1394 returned a valid frame that stays ours until enqueued
        let (id, len, timestamp) = unsafe { ((*frame).id as usize, (*frame).image_bytes as usize, (*frame).timestamp) };
        let epoch = *self.epoch_us.get_or_insert(timestamp);
        self.checked_out.insert(id, frame);
        Ok(Some(Slot::new(id, len, timestamp.saturating_sub(epoch))))
    }

    fn slot_data(&self, slot: &Slot) -> &[u8] {
        match self.checked_out.get(&slot.index()) {
            // SAFETY: the frame is dequeued so the DMA engine is not writing it
            Some(&frame) => unsafe {
                let image = (*frame).image;
                if image.is_null() {
                    &[]
                } else {
                    std::slice::from_raw_parts(image, slot.len())
                }
            },
            None => &[],
        }
    }

    fn enqueue(&mut self, slot: Slot) -> Result<()> {
        let frame = self.checked_out.remove(&slot.index()).ok_or_else(|| {
            FrameError::Acquisition(format!("frame {} is not checked out", slot.index()))
        })?;
        // SAFETY: frame came from dc1394_capture_dequeue on this camera
        let err = unsafe { dc1394_capture_enqueue(self.camera, frame) };
        if err != DC1394_SUCCESS {
            return Err(FrameError::Acquisition(format!(
                "could not enqueue: {}",
                error_string(err)
            )));
        }
        Ok(())
    }

    fn stop(&mut self) -> Result<()> {
        self.set_transmission(false)?;
        self.flush()
    }

    fn resume(&mut self) -> Result<()> {
        self.flush()?;
        self.set_transmission(true)
    }
}

impl Drop for IidcBackend {
    fn drop(&mut self) {
        // SAFETY: handle and frames belong to this backend; the bus outlives them
        unsafe {
            for (_, frame) in self.checked_out.drain() {
                dc1394_capture_enqueue(self.camera, frame);
            }
            if self.transmitting {
                dc1394_video_set_transmission(self.camera, DC1394_OFF);
            }
            dc1394_capture_stop(self.camera);
            dc1394_camera_free(self.camera);
        }
        lock(&self.bus.in_use).remove(&self.guid);
        debug!("Closed IIDC camera {:016x}", self.guid);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_highest_resolution_wins_over_color() {
        let modes = [
            DC1394_VIDEO_MODE_640X480_RGB8,
            DC1394_VIDEO_MODE_1024X768_MONO8,
        ];
        assert_eq!(
            choose_mode(&modes, ColorMode::Color),
            Some(DC1394_VIDEO_MODE_1024X768_MONO8)
        );
    }

    #[test]
    fn test_best_coding_at_equal_resolution() {
        let modes = [
            DC1394_VIDEO_MODE_640X480_MONO16,
            DC1394_VIDEO_MODE_640X480_YUV411,
            DC1394_VIDEO_MODE_640X480_YUV422,
            DC1394_VIDEO_MODE_640X480_RGB8,
            DC1394_VIDEO_MODE_640X480_MONO8,
        ];
        assert_eq!(
            choose_mode(&modes, ColorMode::Color),
            Some(DC1394_VIDEO_MODE_640X480_RGB8)
        );
        assert_eq!(
            choose_mode(&modes, ColorMode::Grayscale),
            Some(DC1394_VIDEO_MODE_640X480_MONO8)
        );
    }

    #[test]
    fn test_format7_only_camera_has_no_mode() {
        assert_eq!(choose_mode(&[88, 89, 87], ColorMode::Color), None);
    }

    #[test]
    fn test_color_codings_map_to_encodings() {
        assert_eq!(encoding_for(DC1394_COLOR_CODING_YUV422), Some(PixelEncoding::Uyvy));
        assert_eq!(encoding_for(DC1394_COLOR_CODING_MONO16), Some(PixelEncoding::Gray16Be));
        assert_eq!(encoding_for(361), None);
    }
}
