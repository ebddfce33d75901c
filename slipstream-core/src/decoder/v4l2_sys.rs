// V4L2 SYS - Kernel ABI for the stateful memory-to-memory decoder interface
//
// Only the subset the decoder drives. Layouts match <linux/videodev2.h>
// on 64-bit Linux; the size tests pin them.

#![allow(non_camel_case_types, dead_code)]

use crate::ioctl::{ior, iow, iowr};

pub const fn v4l2_fourcc(code: &[u8; 4]) -> u32 {
    crate::surface::fourcc(code)
}

// Buffer types and memory
pub const V4L2_BUF_TYPE_VIDEO_CAPTURE_MPLANE: u32 = 9;
pub const V4L2_BUF_TYPE_VIDEO_OUTPUT_MPLANE: u32 = 10;
pub const V4L2_MEMORY_MMAP: u32 = 1;
pub const V4L2_FIELD_NONE: u32 = 1;

// Capabilities
pub const V4L2_CAP_VIDEO_M2M_MPLANE: u32 = 0x0000_4000;
pub const V4L2_CAP_STREAMING: u32 = 0x0400_0000;
pub const V4L2_CAP_DEVICE_CAPS: u32 = 0x8000_0000;

// Buffer flags
pub const V4L2_BUF_FLAG_KEYFRAME: u32 = 0x0000_0008;
pub const V4L2_BUF_FLAG_ERROR: u32 = 0x0000_0040;
pub const V4L2_BUF_FLAG_LAST: u32 = 0x0010_0000;

// Events
pub const V4L2_EVENT_EOS: u32 = 2;
pub const V4L2_EVENT_SOURCE_CHANGE: u32 = 5;
pub const V4L2_EVENT_SRC_CH_RESOLUTION: u32 = 1;

// Pixel formats
pub const V4L2_PIX_FMT_H264: u32 = v4l2_fourcc(b"H264");
pub const V4L2_PIX_FMT_HEVC: u32 = v4l2_fourcc(b"HEVC");
pub const V4L2_PIX_FMT_AV1_FRAME: u32 = v4l2_fourcc(b"AV1F");
pub const V4L2_PIX_FMT_AV1: u32 = v4l2_fourcc(b"AV01");
pub const V4L2_PIX_FMT_NV12: u32 = v4l2_fourcc(b"NV12");
pub const V4L2_PIX_FMT_NV12M: u32 = v4l2_fourcc(b"NM12");
pub const V4L2_PIX_FMT_NV24: u32 = v4l2_fourcc(b"NV24");
pub const V4L2_PIX_FMT_P010: u32 = v4l2_fourcc(b"P010");

pub const VIDEO_MAX_PLANES: usize = 8;

// Colour description reported on the capture format
pub const V4L2_COLORSPACE_DEFAULT: u32 = 0;
pub const V4L2_COLORSPACE_SMPTE170M: u32 = 1;
pub const V4L2_COLORSPACE_REC709: u32 = 3;
pub const V4L2_COLORSPACE_470_SYSTEM_BG: u32 = 6;
pub const V4L2_COLORSPACE_JPEG: u32 = 7;
pub const V4L2_COLORSPACE_SRGB: u32 = 8;
pub const V4L2_COLORSPACE_BT2020: u32 = 10;

pub const V4L2_YCBCR_ENC_DEFAULT: u8 = 0;
pub const V4L2_YCBCR_ENC_601: u8 = 1;
pub const V4L2_YCBCR_ENC_709: u8 = 2;
pub const V4L2_YCBCR_ENC_BT2020: u8 = 6;

pub const V4L2_QUANTIZATION_DEFAULT: u8 = 0;
pub const V4L2_QUANTIZATION_FULL_RANGE: u8 = 1;
pub const V4L2_QUANTIZATION_LIM_RANGE: u8 = 2;

// Controls
pub const V4L2_CID_MIN_BUFFERS_FOR_CAPTURE: u32 = 0x0098_0900 + 39;

#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct v4l2_capability {
    pub driver: [u8; 16],
    pub card: [u8; 32],
    pub bus_info: [u8; 32],
    pub version: u32,
    pub capabilities: u32,
    pub device_caps: u32,
    pub reserved: [u32; 3],
}

impl v4l2_capability {
    /// Capabilities of this device node, not the whole physical device
    pub fn node_caps(&self) -> u32 {
        if self.capabilities & V4L2_CAP_DEVICE_CAPS != 0 {
            self.device_caps
        } else {
            self.capabilities
        }
    }

    pub fn driver_name(&self) -> String {
        c_string(&self.driver)
    }

    pub fn card_name(&self) -> String {
        c_string(&self.card)
    }
}

fn c_string(bytes: &[u8]) -> String {
    let end = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
    String::from_utf8_lossy(&bytes[..end]).into_owned()
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct v4l2_fmtdesc {
    pub index: u32,
    pub type_: u32,
    pub flags: u32,
    pub description: [u8; 32],
    pub pixelformat: u32,
    pub mbus_code: u32,
    pub reserved: [u32; 3],
}

#[repr(C, packed)]
#[derive(Debug, Clone, Copy, Default)]
pub struct v4l2_plane_pix_format {
    pub sizeimage: u32,
    pub bytesperline: u32,
    pub reserved: [u16; 6],
}

#[repr(C, packed)]
#[derive(Debug, Clone, Copy, Default)]
pub struct v4l2_pix_format_mplane {
    pub width: u32,
    pub height: u32,
    pub pixelformat: u32,
    pub field: u32,
    pub colorspace: u32,
    pub plane_fmt: [v4l2_plane_pix_format; VIDEO_MAX_PLANES],
    pub num_planes: u8,
    pub flags: u8,
    pub ycbcr_enc: u8,
    pub quantization: u8,
    pub xfer_func: u8,
    pub reserved: [u8; 7],
}

#[repr(C)]
#[derive(Clone, Copy)]
pub union v4l2_format_union {
    pub pix_mp: v4l2_pix_format_mplane,
    pub raw_data: [u64; 25],
}

#[repr(C)]
#[derive(Clone, Copy)]
pub struct v4l2_format {
    pub type_: u32,
    pub fmt: v4l2_format_union,
}

impl v4l2_format {
    pub fn new(type_: u32) -> Self {
        Self { type_, fmt: v4l2_format_union { raw_data: [0; 25] } }
    }

    pub fn pix_mp(&self) -> v4l2_pix_format_mplane {
        // SAFETY: every bit pattern is a valid pix_mp and the union is fully initialised
        unsafe { self.fmt.pix_mp }
    }

    pub fn set_pix_mp(&mut self, pix: v4l2_pix_format_mplane) {
        self.fmt.pix_mp = pix;
    }
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct v4l2_requestbuffers {
    pub count: u32,
    pub type_: u32,
    pub memory: u32,
    pub capabilities: u32,
    pub flags: u8,
    pub reserved: [u8; 3],
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct v4l2_timecode {
    pub type_: u32,
    pub flags: u32,
    pub frames: u8,
    pub seconds: u8,
    pub minutes: u8,
    pub hours: u8,
    pub userbits: [u8; 4],
}

#[repr(C)]
#[derive(Clone, Copy)]
pub union v4l2_plane_m {
    pub mem_offset: u32,
    pub userptr: libc::c_ulong,
    pub fd: i32,
}

#[repr(C)]
#[derive(Clone, Copy)]
pub struct v4l2_plane {
    pub bytesused: u32,
    pub length: u32,
    pub m: v4l2_plane_m,
    pub data_offset: u32,
    pub reserved: [u32; 11],
}

impl Default for v4l2_plane {
    fn default() -> Self {
        Self { bytesused: 0, length: 0, m: v4l2_plane_m { userptr: 0 }, data_offset: 0, reserved: [0; 11] }
    }
}

impl v4l2_plane {
    pub fn mem_offset(&self) -> u32 {
        // SAFETY: MMAP buffers report the offset member
        unsafe { self.m.mem_offset }
    }
}

#[repr(C)]
#[derive(Clone, Copy)]
pub union v4l2_buffer_m {
    pub offset: u32,
    pub userptr: libc::c_ulong,
    pub planes: *mut v4l2_plane,
    pub fd: i32,
}

#[repr(C)]
#[derive(Clone, Copy)]
pub struct v4l2_buffer {
    pub index: u32,
    pub type_: u32,
    pub bytesused: u32,
    pub flags: u32,
    pub field: u32,
    pub timestamp: libc::timeval,
    pub timecode: v4l2_timecode,
    pub sequence: u32,
    pub memory: u32,
    pub m: v4l2_buffer_m,
    pub length: u32,
    pub reserved2: u32,
    pub request_fd: i32,
}

impl v4l2_buffer {
    /// Multi-planar buffer description pointing at `planes`
    pub fn mplane(type_: u32, index: u32, planes: &mut [v4l2_plane]) -> Self {
        Self {
            index,
            type_,
            bytesused: 0,
            flags: 0,
            field: 0,
            timestamp: libc::timeval { tv_sec: 0, tv_usec: 0 },
            timecode: v4l2_timecode::default(),
            sequence: 0,
            memory: V4L2_MEMORY_MMAP,
            m: v4l2_buffer_m { planes: planes.as_mut_ptr() },
            length: planes.len() as u32,
            reserved2: 0,
            request_fd: 0,
        }
    }
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct v4l2_exportbuffer {
    pub type_: u32,
    pub index: u32,
    pub plane: u32,
    pub flags: u32,
    pub fd: i32,
    pub reserved: [u32; 11],
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct v4l2_event_subscription {
    pub type_: u32,
    pub id: u32,
    pub flags: u32,
    pub reserved: [u32; 5],
}

#[repr(C)]
#[derive(Clone, Copy)]
pub struct v4l2_event {
    pub type_: u32,
    pub u: [u64; 8],
    pub pending: u32,
    pub sequence: u32,
    pub timestamp: libc::timespec,
    pub id: u32,
    pub reserved: [u32; 8],
}

impl Default for v4l2_event {
    fn default() -> Self {
        Self {
            type_: 0,
            u: [0; 8],
            pending: 0,
            sequence: 0,
            timestamp: libc::timespec { tv_sec: 0, tv_nsec: 0 },
            id: 0,
            reserved: [0; 8],
        }
    }
}

impl v4l2_event {
    /// `u.src_change.changes` for source change events
    pub fn src_changes(&self) -> u32 {
        let bytes = self.u[0].to_ne_bytes();
        u32::from_ne_bytes([bytes[0], bytes[1], bytes[2], bytes[3]])
    }
}

pub const V4L2_BUF_TYPE_VIDEO_CAPTURE: u32 = 1;
pub const V4L2_SEL_TGT_COMPOSE: u32 = 0x0100;

#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct v4l2_rect {
    pub left: i32,
    pub top: i32,
    pub width: u32,
    pub height: u32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct v4l2_selection {
    pub type_: u32,
    pub target: u32,
    pub flags: u32,
    pub r: v4l2_rect,
    pub reserved: [u32; 9],
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct v4l2_control {
    pub id: u32,
    pub value: i32,
}

// ============================================================================
// Requests
// ============================================================================

pub const VIDIOC_QUERYCAP: u64 = ior::<v4l2_capability>(b'V', 0);
pub const VIDIOC_ENUM_FMT: u64 = iowr::<v4l2_fmtdesc>(b'V', 2);
pub const VIDIOC_G_FMT: u64 = iowr::<v4l2_format>(b'V', 4);
pub const VIDIOC_S_FMT: u64 = iowr::<v4l2_format>(b'V', 5);
pub const VIDIOC_REQBUFS: u64 = iowr::<v4l2_requestbuffers>(b'V', 8);
pub const VIDIOC_QUERYBUF: u64 = iowr::<v4l2_buffer>(b'V', 9);
pub const VIDIOC_QBUF: u64 = iowr::<v4l2_buffer>(b'V', 15);
pub const VIDIOC_EXPBUF: u64 = iowr::<v4l2_exportbuffer>(b'V', 16);
pub const VIDIOC_DQBUF: u64 = iowr::<v4l2_buffer>(b'V', 17);
pub const VIDIOC_STREAMON: u64 = iow::<libc::c_int>(b'V', 18);
pub const VIDIOC_STREAMOFF: u64 = iow::<libc::c_int>(b'V', 19);
pub const VIDIOC_G_CTRL: u64 = iowr::<v4l2_control>(b'V', 27);
pub const VIDIOC_G_SELECTION: u64 = iowr::<v4l2_selection>(b'V', 94);
pub const VIDIOC_DQEVENT: u64 = ior::<v4l2_event>(b'V', 89);
pub const VIDIOC_SUBSCRIBE_EVENT: u64 = iow::<v4l2_event_subscription>(b'V', 90);
