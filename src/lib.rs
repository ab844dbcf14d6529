//! Framegrab: uniform frame acquisition
//!
//! Pulls frames from IIDC and V4L2 cameras, video files and still images, and
//! hands them out as 8-bit gray or RGB buffers, optionally cropped and rescaled,
//! either on demand or from a background delivery thread.

pub mod backend;
pub mod config;
pub mod crop_scale;
pub mod delivery;
pub mod error;
pub mod frame;
pub mod source;
pub mod utils;

pub use config::{open_source, SourceConfig, SourceKind};
pub use crop_scale::CropRect;
pub use delivery::Delivered;
pub use error::{FrameError, Result};
pub use frame::{ColorMode, FrameBuffer};
pub use source::{FrameSource, PeekedFrame, SourceOptions, StreamState};
