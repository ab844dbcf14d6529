//! Minimal libdc1394 (v2) bindings.

#![allow(non_camel_case_types)]

use libc::{c_char, c_float, c_int, c_uint, FILE};

pub type dc1394error_t = c_int;
pub type dc1394video_mode_t = c_uint;
pub type dc1394framerate_t = c_uint;
pub type dc1394color_coding_t = c_uint;
pub type dc1394operation_mode_t = c_uint;
pub type dc1394speed_t = c_uint;
pub type dc1394switch_t = c_uint;
pub type dc1394capture_policy_t = c_uint;
pub type dc1394bool_t = c_uint;

pub const DC1394_SUCCESS: dc1394error_t = 0;

pub const DC1394_VIDEO_MODE_160X120_YUV444: dc1394video_mode_t = 64;
pub const DC1394_VIDEO_MODE_320X240_YUV422: dc1394video_mode_t = 65;
pub const DC1394_VIDEO_MODE_640X480_YUV411: dc1394video_mode_t = 66;
pub const DC1394_VIDEO_MODE_640X480_YUV422: dc1394video_mode_t = 67;
pub const DC1394_VIDEO_MODE_640X480_RGB8: dc1394video_mode_t = 68;
pub const DC1394_VIDEO_MODE_640X480_MONO8: dc1394video_mode_t = 69;
pub const DC1394_VIDEO_MODE_640X480_MONO16: dc1394video_mode_t = 70;
pub const DC1394_VIDEO_MODE_800X600_YUV422: dc1394video_mode_t = 71;
pub const DC1394_VIDEO_MODE_800X600_RGB8: dc1394video_mode_t = 72;
pub const DC1394_VIDEO_MODE_800X600_MONO8: dc1394video_mode_t = 73;
pub const DC1394_VIDEO_MODE_1024X768_YUV422: dc1394video_mode_t = 74;
pub const DC1394_VIDEO_MODE_1024X768_RGB8: dc1394video_mode_t = 75;
pub const DC1394_VIDEO_MODE_1024X768_MONO8: dc1394video_mode_t = 76;
pub const DC1394_VIDEO_MODE_800X600_MONO16: dc1394video_mode_t = 77;
pub const DC1394_VIDEO_MODE_1024X768_MONO16: dc1394video_mode_t = 78;
pub const DC1394_VIDEO_MODE_1280X960_YUV422: dc1394video_mode_t = 79;
pub const DC1394_VIDEO_MODE_1280X960_RGB8: dc1394video_mode_t = 80;
pub const DC1394_VIDEO_MODE_1280X960_MONO8: dc1394video_mode_t = 81;
pub const DC1394_VIDEO_MODE_1600X1200_YUV422: dc1394video_mode_t = 82;
pub const DC1394_VIDEO_MODE_1600X1200_RGB8: dc1394video_mode_t = 83;
pub const DC1394_VIDEO_MODE_1600X1200_MONO8: dc1394video_mode_t = 84;
pub const DC1394_VIDEO_MODE_1280X960_MONO16: dc1394video_mode_t = 85;
pub const DC1394_VIDEO_MODE_1600X1200_MONO16: dc1394video_mode_t = 86;

pub const DC1394_VIDEO_MODE_NUM: usize = 32;
pub const DC1394_FRAMERATE_NUM: usize = 8;
pub const DC1394_FRAMERATE_MIN: dc1394framerate_t = 32;

pub const DC1394_COLOR_CODING_MONO8: dc1394color_coding_t = 352;
pub const DC1394_COLOR_CODING_YUV411: dc1394color_coding_t = 353;
pub const DC1394_COLOR_CODING_YUV422: dc1394color_coding_t = 354;
pub const DC1394_COLOR_CODING_YUV444: dc1394color_coding_t = 355;
pub const DC1394_COLOR_CODING_RGB8: dc1394color_coding_t = 356;
pub const DC1394_COLOR_CODING_MONO16: dc1394color_coding_t = 357;

pub const DC1394_OPERATION_MODE_LEGACY: dc1394operation_mode_t = 480;
pub const DC1394_OPERATION_MODE_1394B: dc1394operation_mode_t = 481;

pub const DC1394_ISO_SPEED_400: dc1394speed_t = 2;
pub const DC1394_ISO_SPEED_800: dc1394speed_t = 3;

pub const DC1394_OFF: dc1394switch_t = 0;
pub const DC1394_ON: dc1394switch_t = 1;

pub const DC1394_CAPTURE_POLICY_POLL: dc1394capture_policy_t = 673;

pub const DC1394_CAPTURE_FLAGS_DEFAULT: c_uint = 0x04;

#[repr(C)]
pub struct dc1394_t {
    _private: [u8; 0],
}

#[repr(C)]
pub struct dc1394camera_t {
    _private: [u8; 0],
}

#[repr(C)]
#[derive(Clone, Copy)]
pub struct dc1394camera_id_t {
    pub unit: u16,
    pub guid: u64,
}

#[repr(C)]
pub struct dc1394camera_list_t {
    pub num: u32,
    pub ids: *mut dc1394camera_id_t,
}

#[repr(C)]
pub struct dc1394video_modes_t {
    pub num: u32,
    pub modes: [dc1394video_mode_t; DC1394_VIDEO_MODE_NUM],
}

#[repr(C)]
pub struct dc1394framerates_t {
    pub num: u32,
    pub framerates: [dc1394framerate_t; DC1394_FRAMERATE_NUM],
}

#[repr(C)]
pub struct dc1394video_frame_t {
    pub image: *mut u8,
    pub size: [u32; 2],
    pub position: [u32; 2],
    pub color_coding: dc1394color_coding_t,
    pub color_filter: c_uint,
    pub yuv_byte_order: u32,
    pub data_depth: u32,
    pub stride: u32,
    pub video_mode: dc1394video_mode_t,
    pub total_bytes: u64,
    pub image_bytes: u32,
    pub padding_bytes: u32,
    pub packet_size: u32,
    pub packets_per_frame: u32,
    pub timestamp: u64,
    pub frames_behind: u32,
    pub camera: *mut dc1394camera_t,
    pub id: u32,
    pub allocated_image_bytes: u64,
    pub little_endian: dc1394bool_t,
    pub data_in_padding: dc1394bool_t,
}

#[link(name = "dc1394")]
extern "C" {
    pub fn dc1394_new() -> *mut dc1394_t;
    pub fn dc1394_free(dc1394: *mut dc1394_t);
    pub fn dc1394_camera_enumerate(
        dc1394: *mut dc1394_t,
        list: *mut *mut dc1394camera_list_t,
    ) -> dc1394error_t;
    pub fn dc1394_camera_free_list(list: *mut dc1394camera_list_t);
    pub fn dc1394_camera_new(dc1394: *mut dc1394_t, guid: u64) -> *mut dc1394camera_t;
    pub fn dc1394_camera_free(camera: *mut dc1394camera_t);
    pub fn dc1394_camera_print_info(camera: *mut dc1394camera_t, fd: *mut FILE) -> dc1394error_t;

    pub fn dc1394_iso_release_bandwidth(camera: *mut dc1394camera_t, bandwidth_units: c_int) -> dc1394error_t;
    pub fn dc1394_iso_release_channel(camera: *mut dc1394camera_t, channel: c_int) -> dc1394error_t;

    pub fn dc1394_video_get_supported_modes(
        camera: *mut dc1394camera_t,
        modes: *mut dc1394video_modes_t,
    ) -> dc1394error_t;
    pub fn dc1394_video_get_supported_framerates(
        camera: *mut dc1394camera_t,
        mode: dc1394video_mode_t,
        framerates: *mut dc1394framerates_t,
    ) -> dc1394error_t;
    pub fn dc1394_video_set_operation_mode(
        camera: *mut dc1394camera_t,
        mode: dc1394operation_mode_t,
    ) -> dc1394error_t;
    pub fn dc1394_video_set_iso_speed(camera: *mut dc1394camera_t, speed: dc1394speed_t) -> dc1394error_t;
    pub fn dc1394_video_set_mode(camera: *mut dc1394camera_t, mode: dc1394video_mode_t) -> dc1394error_t;
    pub fn dc1394_video_set_framerate(
        camera: *mut dc1394camera_t,
        framerate: dc1394framerate_t,
    ) -> dc1394error_t;
    pub fn dc1394_video_set_transmission(camera: *mut dc1394camera_t, pwr: dc1394switch_t) -> dc1394error_t;

    pub fn dc1394_get_image_size_from_video_mode(
        camera: *mut dc1394camera_t,
        mode: dc1394video_mode_t,
        width: *mut u32,
        height: *mut u32,
    ) -> dc1394error_t;
    pub fn dc1394_get_color_coding_from_video_mode(
        camera: *mut dc1394camera_t,
        mode: dc1394video_mode_t,
        color_coding: *mut dc1394color_coding_t,
    ) -> dc1394error_t;
    pub fn dc1394_framerate_as_float(framerate: dc1394framerate_t, value: *mut c_float) -> dc1394error_t;

    pub fn dc1394_capture_setup(camera: *mut dc1394camera_t, num_dma_buffers: u32, flags: u32) -> dc1394error_t;
    pub fn dc1394_capture_stop(camera: *mut dc1394camera_t) -> dc1394error_t;
    pub fn dc1394_capture_get_fileno(camera: *mut dc1394camera_t) -> c_int;
    pub fn dc1394_capture_dequeue(
        camera: *mut dc1394camera_t,
        policy: dc1394capture_policy_t,
        frame: *mut *mut dc1394video_frame_t,
    ) -> dc1394error_t;
    pub fn dc1394_capture_enqueue(
        camera: *mut dc1394camera_t,
        frame: *mut dc1394video_frame_t,
    ) -> dc1394error_t;

    pub fn dc1394_error_get_string(error: dc1394error_t) -> *const c_char;
}
