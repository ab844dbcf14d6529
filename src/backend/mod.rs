//! Raw frame producers.
//!
//! Each backend exposes the same small dequeue/enqueue contract so that the
//! buffering policy in [`crate::source::FrameSource`] never needs to know whether
//! frames come from a DMA ring, an ffmpeg pipe or a file on disk.

pub mod still_image;
pub mod synthetic;
pub mod video_file;

#[cfg(target_os = "linux")]
pub mod v4l2;

#[cfg(all(feature = "iidc", target_os = "linux"))]
pub mod iidc;

pub use still_image::StillImageBackend;
pub use synthetic::{SyntheticBackend, SyntheticConfig, SyntheticFeed};
pub use video_file::VideoFileBackend;

use crate::error::Result;
use crate::frame::{PixelEncoding, RawFrame};
use std::fmt;
use std::time::Duration;

/// A raw buffer checked out of a backend.
///
/// Not `Clone`: a slot is handed back exactly once through
/// [`AcquisitionBackend::enqueue`].
#[derive(Debug, PartialEq, Eq)]
pub struct Slot {
    index: usize,
    /// Bytes of valid data; varies per frame for compressed encodings
    len: usize,
    timestamp_us: u64,
}

impl Slot {
    pub(crate) fn new(index: usize, len: usize, timestamp_us: u64) -> Self {
        Self {
            index,
            len,
            timestamp_us,
        }
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn timestamp_us(&self) -> u64 {
        self.timestamp_us
    }
}

/// How long a dequeue may block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DequeuePolicy {
    /// Return `None` immediately when nothing is queued.
    Poll,
    /// Block up to the given time; `None` on timeout.
    Wait(Duration),
}

/// Geometry and encoding of the frames a backend produces.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RawFormat {
    pub width: u32,
    pub height: u32,
    pub encoding: PixelEncoding,
    /// Bytes per row of the first plane, including driver padding
    pub stride: usize,
}

impl RawFormat {
    pub fn packed(width: u32, height: u32, encoding: PixelEncoding) -> Self {
        Self {
            width,
            height,
            encoding,
            stride: encoding.row_bytes(width),
        }
    }
}

impl fmt::Display for RawFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{} {:?}", self.width, self.height, self.encoding)
    }
}

/// A device or file that produces raw frames.
pub trait AcquisitionBackend: Send {
    fn format(&self) -> RawFormat;

    /// Human-readable summary: device, resolution, rate, encoding.
    fn description(&self) -> String;

    /// Whether frames accumulate while nobody is reading. Sources without a queue
    /// produce a frame on demand and have no backlog to purge.
    fn is_queued(&self) -> bool;

    /// Checks out the next raw frame.
    fn dequeue(&mut self, policy: DequeuePolicy) -> Result<Option<Slot>>;

    /// Bytes of a checked-out slot.
    fn slot_data(&self, slot: &Slot) -> &[u8];

    /// Returns a slot to the backend so its buffer can be refilled.
    fn enqueue(&mut self, slot: Slot) -> Result<()>;

    /// Halts transmission and discards anything queued.
    fn stop(&mut self) -> Result<()>;

    /// Re-arms the device after [`AcquisitionBackend::stop`].
    fn resume(&mut self) -> Result<()>;

    /// Rewinds seekable sources, then resumes. Live sources just resume.
    fn restart(&mut self) -> Result<()> {
        self.resume()
    }

    /// Raw view of a checked-out slot.
    fn raw_frame(&self, slot: &Slot) -> RawFrame<'_> {
        let format = self.format();
        RawFrame {
            data: self.slot_data(slot),
            width: format.width,
            height: format.height,
            stride: format.stride,
            encoding: format.encoding,
            timestamp_us: slot.timestamp_us(),
        }
    }
}

impl<B: AcquisitionBackend + ?Sized> AcquisitionBackend for Box<B> {
    fn format(&self) -> RawFormat {
        (**self).format()
    }

    fn description(&self) -> String {
        (**self).description()
    }

    fn is_queued(&self) -> bool {
        (**self).is_queued()
    }

    fn dequeue(&mut self, policy: DequeuePolicy) -> Result<Option<Slot>> {
        (**self).dequeue(policy)
    }

    fn slot_data(&self, slot: &Slot) -> &[u8] {
        (**self).slot_data(slot)
    }

    fn enqueue(&mut self, slot: Slot) -> Result<()> {
        (**self).enqueue(slot)
    }

    fn stop(&mut self) -> Result<()> {
        (**self).stop()
    }

    fn resume(&mut self) -> Result<()> {
        (**self).resume()
    }

    fn restart(&mut self) -> Result<()> {
        (**self).restart()
    }
}

/// A capture device found during enumeration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceInfo {
    /// Value to put in a source URI to open this device
    pub id: String,
    pub name: String,
}

/// Lists every capture device the compiled-in hardware backends can see.
pub fn list_devices() -> Vec<DeviceInfo> {
    #[allow(unused_mut)]
    let mut devices = Vec::new();

    #[cfg(target_os = "linux")]
    devices.extend(v4l2::enumerate_devices());

    #[cfg(all(feature = "iidc", target_os = "linux"))]
    match iidc::enumerate_cameras() {
        Ok(cameras) => devices.extend(cameras),
        Err(e) => tracing::warn!("IIDC enumeration failed: {}", e),
    }

    devices
}
