//! Error type shared by every frame source and backend.

use thiserror::Error;

/// Errors produced while opening, driving or reading a frame source.
#[derive(Debug, Error)]
pub enum FrameError {
    /// The backend could not be opened or configured.
    #[error("initialization failed: {0}")]
    Init(String),

    /// An OS-level call failed.
    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },

    /// A single dequeue/read/decode failed.
    #[error("acquisition failed: {0}")]
    Acquisition(String),

    /// A seekable source ran out of frames.
    #[error("end of stream")]
    EndOfStream,

    /// The backend refused a start/stop/rewind request.
    #[error("stream control failed: {0}")]
    StreamControl(String),

    /// The raw encoding cannot be converted to the requested color mode.
    #[error("unsupported conversion: {0}")]
    Unsupported(String),

    /// Pixel conversion failed part way.
    #[error("pixel conversion failed: {0}")]
    Conversion(String),

    /// The caller's buffer does not match the source's output geometry.
    #[error("buffer is {actual_width}x{actual_height}x{actual_channels}, source produces {width}x{height}x{channels}")]
    BufferMismatch {
        width: u32,
        height: u32,
        channels: u8,
        actual_width: u32,
        actual_height: u32,
        actual_channels: u8,
    },

    #[error("crop rectangle {x},{y} {w}x{h} does not fit in a {width}x{height} frame")]
    InvalidCrop {
        x: i32,
        y: i32,
        w: i32,
        h: i32,
        width: u32,
        height: u32,
    },

    #[error("scale factor must be positive and finite, got {0}")]
    InvalidScale(f64),

    #[error("resize failed: {0}")]
    Resize(String),

    #[error(transparent)]
    Image(#[from] image::ImageError),

    /// The blocking call was abandoned because its delivery thread is shutting down.
    #[error("cancelled")]
    Cancelled,

    /// The peeked frame was already given back, explicitly or by a later peek/get.
    #[error("peeked frame was already released")]
    PeekReleased,

    /// A delivery thread is already attached to this source.
    #[error("a delivery thread is already running")]
    DeliveryRunning,

    #[error("invalid configuration: {0}")]
    Config(String),
}

impl FrameError {
    pub(crate) fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        FrameError::Io {
            context: context.into(),
            source,
        }
    }

    pub(crate) fn last_os_error(context: impl Into<String>) -> Self {
        Self::io(context, std::io::Error::last_os_error())
    }
}

pub type Result<T, E = FrameError> = std::result::Result<T, E>;
