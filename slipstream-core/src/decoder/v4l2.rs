//! # V4L2 Stateful Decoder
//!
//! Memory-to-memory decoders found on SoCs and some PCIe cards:
//!
//! ```text
//!   submit ──► OUTPUT queue (bitstream, CPU-mapped) ──► driver
//!                                                        │
//!   receive ◄── CAPTURE queue (decoded frames) ◄─────────┘
//!                   │
//!                   └── HwSurface ──► EXPBUF ──► DMA-BUF fds for the renderer
//! ```
//!
//! The capture queue is only configured once the driver has parsed the
//! stream headers and raised a source-change event. Every reconfiguration
//! bumps a generation counter so surfaces from the old allocation are
//! never requeued or exported.

use std::fs::OpenOptions;
use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;

use super::v4l2_sys::*;
use super::{DecoderInit, DecoderKind, DecoderProvider, VideoDecoder};
use crate::error::{PipelineError, Result};
use crate::ioctl::{would_block, xioctl};
use crate::network::{AccessUnit, VideoCodec};
use crate::picture::{ColorRange, Colorspace, DecodedPicture, PixelFormat};
use crate::surface::{
    DmaBufObject, HwSurface, PlaneLayout, SurfaceDescriptor, SurfaceSource, DRM_FORMAT_MOD_LINEAR,
    DRM_FORMAT_NV12, DRM_FORMAT_NV24, DRM_FORMAT_P010,
};

const NAME: &str = "v4l2";

/// Drivers shipped by SoC vendors, preferred over anything generic
const VENDOR_DRIVERS: &[&str] = &["bcm2835-codec", "qcom-venus", "mtk-vcodec-dec", "s5p-mfc", "meson-vdec"];

const OUTPUT_BUFFERS: u32 = 6;
const MIN_BITSTREAM_BUFFER: u32 = 1 << 20;
const OUTPUT_WAIT: Duration = Duration::from_millis(100);

// ============================================================================
// Device Discovery
// ============================================================================

#[derive(Debug, Clone, Serialize)]
pub struct V4l2Device {
    pub path: PathBuf,
    pub driver: String,
    pub card: String,
    pub vendor: bool,
    pub codecs: Vec<VideoCodec>,
    /// V4L2 fourccs the capture queue can produce
    pub capture_formats: Vec<u32>,
}

pub fn is_vendor_driver(driver: &str) -> bool {
    VENDOR_DRIVERS.contains(&driver)
}

pub fn codec_fourcc(codec: VideoCodec) -> u32 {
    match codec {
        VideoCodec::H264 => V4L2_PIX_FMT_H264,
        VideoCodec::Hevc => V4L2_PIX_FMT_HEVC,
        VideoCodec::Av1 => V4L2_PIX_FMT_AV1,
    }
}

fn codec_from_fourcc(fourcc: u32) -> Option<VideoCodec> {
    match fourcc {
        V4L2_PIX_FMT_H264 => Some(VideoCodec::H264),
        V4L2_PIX_FMT_HEVC => Some(VideoCodec::Hevc),
        V4L2_PIX_FMT_AV1 | V4L2_PIX_FMT_AV1_FRAME => Some(VideoCodec::Av1),
        _ => None,
    }
}

/// Capture layout to ask the driver for
pub fn capture_fourcc(format: PixelFormat) -> u32 {
    match format {
        PixelFormat::Nv24 | PixelFormat::Yuv444p => V4L2_PIX_FMT_NV24,
        PixelFormat::P010 | PixelFormat::Yuv444p10 => V4L2_PIX_FMT_P010,
        _ => V4L2_PIX_FMT_NV12,
    }
}

/// DRM fourcc a capture layout exports as
pub fn drm_fourcc(v4l2: u32) -> Option<u32> {
    match v4l2 {
        V4L2_PIX_FMT_NV12 | V4L2_PIX_FMT_NV12M => Some(DRM_FORMAT_NV12),
        V4L2_PIX_FMT_NV24 => Some(DRM_FORMAT_NV24),
        V4L2_PIX_FMT_P010 => Some(DRM_FORMAT_P010),
        _ => None,
    }
}

/// Every memory-to-memory decoder under /dev, vendor drivers first
pub fn probe_devices() -> Vec<V4l2Device> {
    probe_devices_in(Path::new("/dev"))
}

pub fn probe_devices_in(dir: &Path) -> Vec<V4l2Device> {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return Vec::new();
    };
    let mut paths: Vec<PathBuf> = entries
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| p.file_name().and_then(|n| n.to_str()).is_some_and(|n| n.starts_with("video")))
        .collect();
    paths.sort();

    let mut devices = Vec::new();
    for path in paths {
        match query_device(&path) {
            Ok(Some(device)) => {
                tracing::debug!(
                    path = %device.path.display(),
                    driver = %device.driver,
                    codecs = ?device.codecs,
                    "found V4L2 decoder"
                );
                devices.push(device);
            }
            Ok(None) => {}
            Err(e) => tracing::trace!(path = %path.display(), "not a usable V4L2 device: {}", e),
        }
    }
    rank_devices(&mut devices);
    devices
}

fn rank_devices(devices: &mut [V4l2Device]) {
    devices.sort_by(|a, b| b.vendor.cmp(&a.vendor).then_with(|| a.path.cmp(&b.path)));
}

fn open_device(path: &Path) -> Result<OwnedFd> {
    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .custom_flags(libc::O_NONBLOCK)
        .open(path)?;
    Ok(OwnedFd::from(file))
}

fn query_device(path: &Path) -> Result<Option<V4l2Device>> {
    let fd = open_device(path)?;
    let mut cap = v4l2_capability::default();
    unsafe { xioctl(fd.as_raw_fd(), VIDIOC_QUERYCAP, &mut cap) }?;

    let caps = cap.node_caps();
    if caps & V4L2_CAP_VIDEO_M2M_MPLANE == 0 || caps & V4L2_CAP_STREAMING == 0 {
        return Ok(None);
    }

    let codecs: Vec<VideoCodec> = enum_formats(fd.as_raw_fd(), V4L2_BUF_TYPE_VIDEO_OUTPUT_MPLANE)
        .into_iter()
        .filter_map(codec_from_fourcc)
        .collect();
    if codecs.is_empty() {
        // an encoder or a scaler
        return Ok(None);
    }
    let capture_formats = enum_formats(fd.as_raw_fd(), V4L2_BUF_TYPE_VIDEO_CAPTURE_MPLANE);

    let driver = cap.driver_name();
    Ok(Some(V4l2Device {
        path: path.to_path_buf(),
        vendor: is_vendor_driver(&driver),
        driver,
        card: cap.card_name(),
        codecs,
        capture_formats,
    }))
}

fn enum_formats(fd: RawFd, type_: u32) -> Vec<u32> {
    let mut formats = Vec::new();
    for index in 0.. {
        let mut desc = v4l2_fmtdesc { index, type_, ..Default::default() };
        if unsafe { xioctl(fd, VIDIOC_ENUM_FMT, &mut desc) }.is_err() {
            break;
        }
        formats.push(desc.pixelformat);
    }
    formats
}

// ============================================================================
// Provider
// ============================================================================

pub struct V4l2Provider {
    device: V4l2Device,
}

impl V4l2Provider {
    pub fn new(device: V4l2Device) -> Self {
        Self { device }
    }
}

impl DecoderProvider for V4l2Provider {
    fn kind(&self) -> DecoderKind {
        if self.device.vendor {
            DecoderKind::V4l2Vendor
        } else {
            DecoderKind::V4l2Generic
        }
    }

    fn name(&self) -> &str {
        &self.device.driver
    }

    fn supports(&self, codec: VideoCodec) -> bool {
        self.device.codecs.contains(&codec)
    }

    fn supports_444(&self, _codec: VideoCodec) -> bool {
        self.device.capture_formats.contains(&V4L2_PIX_FMT_NV24)
    }

    fn open(&self, init: &DecoderInit) -> Result<Box<dyn VideoDecoder>> {
        Ok(Box::new(V4l2Decoder::open(&self.device, init)?))
    }
}

// ============================================================================
// Capture Queue
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaptureFormat {
    /// V4L2 fourcc
    pub fourcc: u32,
    /// Coded size
    pub width: u32,
    pub height: u32,
    /// Displayed size inside the coded frame
    pub visible: (u32, u32),
    /// (bytesperline, sizeimage) per memory plane
    pub planes: Vec<(u32, u32)>,
}

/// DRM fourcc and plane layout of an exported capture buffer
pub fn descriptor_layout(format: &CaptureFormat) -> Result<(u32, Vec<PlaneLayout>)> {
    let drm = drm_fourcc(format.fourcc)
        .ok_or_else(|| PipelineError::Surface(format!("capture format {:#010x} is not exportable", format.fourcc)))?;

    let layout = match format.planes.as_slice() {
        // luma then chroma in one buffer
        [(pitch, _)] => {
            let chroma_pitch = if format.fourcc == V4L2_PIX_FMT_NV24 { pitch * 2 } else { *pitch };
            vec![
                PlaneLayout { object: 0, offset: 0, pitch: *pitch },
                PlaneLayout { object: 0, offset: pitch * format.height, pitch: chroma_pitch },
            ]
        }
        [(luma, _), (chroma, _)] => vec![
            PlaneLayout { object: 0, offset: 0, pitch: *luma },
            PlaneLayout { object: 1, offset: 0, pitch: *chroma },
        ],
        other => {
            return Err(PipelineError::Surface(format!("{} capture planes not supported", other.len())));
        }
    };
    Ok((drm, layout))
}

struct CaptureState {
    format: Option<CaptureFormat>,
    /// Buffers the driver needs to keep decoding
    reserved: usize,
    /// Buffer is owned by the driver
    queued: Vec<bool>,
    generation: u64,
    streaming: bool,
}

/// Decoded-frame side of the device, shared with every surface it hands out
struct CaptureQueue {
    fd: OwnedFd,
    state: Mutex<CaptureState>,
}

impl CaptureQueue {
    fn raw(&self) -> RawFd {
        self.fd.as_raw_fd()
    }

    fn queue_buffer(&self, index: u32, planes: usize) -> io::Result<()> {
        let mut plane_array = [v4l2_plane::default(); VIDEO_MAX_PLANES];
        let mut buf = v4l2_buffer::mplane(V4L2_BUF_TYPE_VIDEO_CAPTURE_MPLANE, index, &mut plane_array[..planes]);
        unsafe { xioctl(self.raw(), VIDIOC_QBUF, &mut buf) }.map(|_| ())
    }

    fn visible_size(&self, coded: (u32, u32)) -> (u32, u32) {
        let mut sel = v4l2_selection {
            type_: V4L2_BUF_TYPE_VIDEO_CAPTURE,
            target: V4L2_SEL_TGT_COMPOSE,
            ..Default::default()
        };
        match unsafe { xioctl(self.raw(), VIDIOC_G_SELECTION, &mut sel) } {
            Ok(_) if sel.r.width > 0 && sel.r.height > 0 => (sel.r.width, sel.r.height),
            _ => coded,
        }
    }

    /// V4L2_CID_MIN_BUFFERS_FOR_CAPTURE, 0 when the driver does not say
    fn min_buffers(&self) -> usize {
        let mut ctrl = v4l2_control { id: V4L2_CID_MIN_BUFFERS_FOR_CAPTURE, value: 0 };
        match unsafe { xioctl(self.raw(), VIDIOC_G_CTRL, &mut ctrl) } {
            Ok(_) => ctrl.value.max(0) as usize,
            Err(e) => {
                tracing::debug!("MIN_BUFFERS_FOR_CAPTURE: {}", e);
                0
            }
        }
    }

    /// Reallocate the capture queue after a source change. `pool_size`
    /// surfaces are for the pipeline; the driver's minimum comes on top.
    fn reconfigure(&self, pool_size: usize) -> Result<(CaptureFormat, Option<(Colorspace, ColorRange)>)> {
        let mut state = self.state.lock();
        if state.streaming {
            stream(self.raw(), V4L2_BUF_TYPE_VIDEO_CAPTURE_MPLANE, false)?;
            state.streaming = false;
        }
        state.generation += 1;
        state.queued.clear();

        let mut release = v4l2_requestbuffers {
            count: 0,
            type_: V4L2_BUF_TYPE_VIDEO_CAPTURE_MPLANE,
            memory: V4L2_MEMORY_MMAP,
            ..Default::default()
        };
        if let Err(e) = unsafe { xioctl(self.raw(), VIDIOC_REQBUFS, &mut release) } {
            tracing::debug!("releasing capture buffers: {}", e);
        }

        let mut fmt = v4l2_format::new(V4L2_BUF_TYPE_VIDEO_CAPTURE_MPLANE);
        unsafe { xioctl(self.raw(), VIDIOC_G_FMT, &mut fmt) }
            .map_err(|e| PipelineError::hw_decode(NAME, format!("G_FMT capture: {}", e)))?;
        let pix = fmt.pix_mp();
        let plane_fmt = pix.plane_fmt;
        let num_planes = (pix.num_planes as usize).clamp(1, VIDEO_MAX_PLANES);
        let (fourcc, width, height) = (pix.pixelformat, pix.width, pix.height);
        let color = stream_color(pix.colorspace, pix.ycbcr_enc, pix.quantization);
        let format = CaptureFormat {
            fourcc,
            width,
            height,
            visible: self.visible_size((width, height)),
            planes: plane_fmt[..num_planes].iter().map(|p| (p.bytesperline, p.sizeimage)).collect(),
        };
        if drm_fourcc(format.fourcc).is_none() {
            return Err(PipelineError::hw_decode(
                NAME,
                format!("driver chose capture format {:#010x}, which cannot be exported", format.fourcc),
            ));
        }

        let min = self.min_buffers();
        let mut req = v4l2_requestbuffers {
            count: (pool_size + min) as u32,
            type_: V4L2_BUF_TYPE_VIDEO_CAPTURE_MPLANE,
            memory: V4L2_MEMORY_MMAP,
            ..Default::default()
        };
        unsafe { xioctl(self.raw(), VIDIOC_REQBUFS, &mut req) }
            .map_err(|e| PipelineError::hw_decode(NAME, format!("REQBUFS capture: {}", e)))?;
        if req.count == 0 {
            return Err(PipelineError::hw_decode(NAME, "driver allocated no capture buffers"));
        }

        for index in 0..req.count {
            self.queue_buffer(index, num_planes)
                .map_err(|e| PipelineError::hw_decode(NAME, format!("QBUF capture {}: {}", index, e)))?;
            state.queued.push(true);
        }
        stream(self.raw(), V4L2_BUF_TYPE_VIDEO_CAPTURE_MPLANE, true)?;
        state.streaming = true;
        state.format = Some(format.clone());
        // never reserve the whole pool
        state.reserved = min.min(req.count as usize - 1);

        tracing::info!(
            buffers = req.count,
            reserved = state.reserved,
            colorspace = ?color.map(|c| c.0),
            range = ?color.map(|c| c.1),
            generation = state.generation,
            "capture queue {}x{} (visible {}x{}), {} plane(s)",
            format.width,
            format.height,
            format.visible.0,
            format.visible.1,
            num_planes
        );
        Ok((format, color))
    }

    /// Next decoded buffer: (index, flags, bytesused, generation)
    fn dequeue(&self) -> Result<Option<(u32, u32, u32, u64)>> {
        let mut state = self.state.lock();
        if !state.streaming {
            return Ok(None);
        }
        let planes = state.format.as_ref().map_or(1, |f| f.planes.len());
        let mut plane_array = [v4l2_plane::default(); VIDEO_MAX_PLANES];
        let mut buf = v4l2_buffer::mplane(V4L2_BUF_TYPE_VIDEO_CAPTURE_MPLANE, 0, &mut plane_array[..planes]);
        match unsafe { xioctl(self.raw(), VIDIOC_DQBUF, &mut buf) } {
            Ok(_) => {}
            Err(e) if would_block(&e) || e.raw_os_error() == Some(libc::EPIPE) => return Ok(None),
            Err(e) => return Err(PipelineError::hw_decode(NAME, format!("DQBUF capture: {}", e))),
        }
        if let Some(q) = state.queued.get_mut(buf.index as usize) {
            *q = false;
        }
        Ok(Some((buf.index, buf.flags, plane_array[0].bytesused, state.generation)))
    }

    fn stop(&self) {
        let mut state = self.state.lock();
        if state.streaming {
            if let Err(e) = stream(self.raw(), V4L2_BUF_TYPE_VIDEO_CAPTURE_MPLANE, false) {
                tracing::warn!("STREAMOFF capture: {}", e);
            }
            state.streaming = false;
        }
        state.generation += 1;
    }

    fn check_current(state: &CaptureState, index: u32, generation: u64) -> Result<()> {
        if generation != state.generation {
            return Err(PipelineError::Surface(format!(
                "surface {} belongs to capture generation {}, current is {}",
                index, generation, state.generation
            )));
        }
        match state.queued.get(index as usize) {
            Some(false) => Ok(()),
            Some(true) => Err(PipelineError::Surface(format!("surface {} is still owned by the decoder", index))),
            None => Err(PipelineError::Surface(format!("no capture buffer {}", index))),
        }
    }
}

impl SurfaceSource for CaptureQueue {
    fn name(&self) -> &'static str {
        NAME
    }

    fn sync(&self, index: u32, generation: u64) -> Result<()> {
        // a dequeued capture buffer is complete; only its ownership needs checking
        Self::check_current(&self.state.lock(), index, generation)
    }

    fn export(&self, index: u32, generation: u64) -> Result<SurfaceDescriptor> {
        let state = self.state.lock();
        Self::check_current(&state, index, generation)?;
        let format = state
            .format
            .as_ref()
            .ok_or_else(|| PipelineError::Surface("capture queue not configured".into()))?;
        let (fourcc, planes) = descriptor_layout(format)?;

        let mut objects = Vec::with_capacity(format.planes.len());
        for (plane, &(_, size)) in format.planes.iter().enumerate() {
            let mut exp = v4l2_exportbuffer {
                type_: V4L2_BUF_TYPE_VIDEO_CAPTURE_MPLANE,
                index,
                plane: plane as u32,
                flags: (libc::O_CLOEXEC | libc::O_RDONLY) as u32,
                ..Default::default()
            };
            // objects exported so far close on this early return
            unsafe { xioctl(self.raw(), VIDIOC_EXPBUF, &mut exp) }
                .map_err(|e| PipelineError::Surface(format!("EXPBUF {}/{}: {}", index, plane, e)))?;
            // SAFETY: EXPBUF returned a new descriptor we now own
            let fd = unsafe { OwnedFd::from_raw_fd(exp.fd) };
            objects.push(DmaBufObject { fd, size: size as u64, modifier: DRM_FORMAT_MOD_LINEAR });
        }

        Ok(SurfaceDescriptor { fourcc, width: format.visible.0, height: format.visible.1, objects, planes })
    }

    fn recycle(&self, index: u32, generation: u64) {
        let mut state = self.state.lock();
        if !state.streaming || Self::check_current(&state, index, generation).is_err() {
            tracing::trace!(index, generation, "stale surface not requeued");
            return;
        }
        let planes = state.format.as_ref().map_or(1, |f| f.planes.len());
        match self.queue_buffer(index, planes) {
            Ok(()) => state.queued[index as usize] = true,
            Err(e) => tracing::warn!(index, "requeueing capture buffer: {}", e),
        }
    }

    fn pool_capacity(&self) -> usize {
        self.state.lock().queued.len()
    }

    fn decoder_reserve(&self) -> usize {
        self.state.lock().reserved
    }
}

/// Map the capture format's colour fields. `None` while the driver has not
/// parsed a colour description.
pub fn stream_color(colorspace: u32, ycbcr_enc: u8, quantization: u8) -> Option<(Colorspace, ColorRange)> {
    let implied = match colorspace {
        V4L2_COLORSPACE_DEFAULT => None,
        V4L2_COLORSPACE_REC709 => Some(Colorspace::Bt709),
        V4L2_COLORSPACE_BT2020 => Some(Colorspace::Bt2020),
        V4L2_COLORSPACE_SMPTE170M
        | V4L2_COLORSPACE_470_SYSTEM_BG
        | V4L2_COLORSPACE_JPEG
        | V4L2_COLORSPACE_SRGB => Some(Colorspace::Bt601),
        other => {
            tracing::debug!(colorspace = other, "unmapped V4L2 colorspace");
            None
        }
    };
    let matrix = match ycbcr_enc {
        V4L2_YCBCR_ENC_601 => Some(Colorspace::Bt601),
        V4L2_YCBCR_ENC_709 => Some(Colorspace::Bt709),
        V4L2_YCBCR_ENC_BT2020 => Some(Colorspace::Bt2020),
        _ => implied,
    }?;
    let range = match quantization {
        V4L2_QUANTIZATION_FULL_RANGE => ColorRange::Full,
        V4L2_QUANTIZATION_LIM_RANGE => ColorRange::Limited,
        // default quantization is full range only for JPEG
        _ if colorspace == V4L2_COLORSPACE_JPEG => ColorRange::Full,
        _ => ColorRange::Limited,
    };
    Some((matrix, range))
}

fn stream(fd: RawFd, type_: u32, on: bool) -> Result<()> {
    let mut t = type_ as libc::c_int;
    let request = if on { VIDIOC_STREAMON } else { VIDIOC_STREAMOFF };
    unsafe { xioctl(fd, request, &mut t) }.map_err(|e| {
        PipelineError::hw_decode(NAME, format!("{} {}: {}", if on { "STREAMON" } else { "STREAMOFF" }, type_, e))
    })?;
    Ok(())
}

// ============================================================================
// Bitstream Buffers
// ============================================================================

/// CPU mapping of one OUTPUT buffer
struct Mapping {
    ptr: *mut u8,
    len: usize,
}

// The mapping is only touched by the decode thread that owns the decoder
unsafe impl Send for Mapping {}

impl Mapping {
    fn new(fd: RawFd, len: usize, offset: u32) -> Result<Self> {
        let ptr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                fd,
                offset as libc::off_t,
            )
        };
        if ptr == libc::MAP_FAILED {
            return Err(PipelineError::hw_decode(
                NAME,
                format!("mmap bitstream buffer: {}", io::Error::last_os_error()),
            ));
        }
        Ok(Self { ptr: ptr.cast(), len })
    }

    fn as_mut_slice(&mut self) -> &mut [u8] {
        unsafe { std::slice::from_raw_parts_mut(self.ptr, self.len) }
    }
}

impl Drop for Mapping {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.ptr.cast(), self.len);
        }
    }
}

struct OutputBuffer {
    map: Mapping,
    queued: bool,
}

// ============================================================================
// Decoder
// ============================================================================

pub struct V4l2Decoder {
    capture: Arc<CaptureQueue>,
    output: Vec<OutputBuffer>,
    driver: String,
    pool_size: usize,
    visible: (u32, u32),
    color: Option<(Colorspace, ColorRange)>,
    submitted: u64,
}

impl V4l2Decoder {
    pub fn open(device: &V4l2Device, init: &DecoderInit) -> Result<Self> {
        let fd = open_device(&device.path)
            .map_err(|e| PipelineError::BackendUnavailable(format!("{}: {}", device.path.display(), e)))?;
        let raw = fd.as_raw_fd();

        set_output_format(raw, init)?;
        request_capture_format(raw, capture_fourcc(init.format));

        let mut sub = v4l2_event_subscription { type_: V4L2_EVENT_SOURCE_CHANGE, ..Default::default() };
        unsafe { xioctl(raw, VIDIOC_SUBSCRIBE_EVENT, &mut sub) }
            .map_err(|e| PipelineError::BackendUnavailable(format!("{}: no source change events: {}", device.driver, e)))?;

        let output = allocate_output(raw)?;
        stream(raw, V4L2_BUF_TYPE_VIDEO_OUTPUT_MPLANE, true)?;

        tracing::info!(
            driver = %device.driver,
            card = %device.card,
            path = %device.path.display(),
            codec = init.codec.name(),
            bitstream_buffers = output.len(),
            "V4L2 decoder opened"
        );

        Ok(Self {
            capture: Arc::new(CaptureQueue {
                fd,
                state: Mutex::new(CaptureState {
                    format: None,
                    reserved: 0,
                    queued: Vec::new(),
                    generation: 0,
                    streaming: false,
                }),
            }),
            output,
            driver: device.driver.clone(),
            pool_size: init.pool_size.max(2),
            visible: (init.width, init.height),
            color: None,
            submitted: 0,
        })
    }

    fn raw(&self) -> RawFd {
        self.capture.raw()
    }

    /// Take back bitstream buffers the driver has consumed
    fn reclaim_output(&mut self) -> Result<()> {
        loop {
            let mut planes = [v4l2_plane::default(); 1];
            let mut buf = v4l2_buffer::mplane(V4L2_BUF_TYPE_VIDEO_OUTPUT_MPLANE, 0, &mut planes);
            match unsafe { xioctl(self.raw(), VIDIOC_DQBUF, &mut buf) } {
                Ok(_) => {
                    if let Some(b) = self.output.get_mut(buf.index as usize) {
                        b.queued = false;
                    }
                }
                Err(e) if would_block(&e) => return Ok(()),
                Err(e) => return Err(PipelineError::hw_decode(NAME, format!("DQBUF output: {}", e))),
            }
        }
    }

    fn free_output(&mut self) -> Result<Option<usize>> {
        self.reclaim_output()?;
        if let Some(i) = self.output.iter().position(|b| !b.queued) {
            return Ok(Some(i));
        }
        if poll_fd(self.raw(), libc::POLLOUT, OUTPUT_WAIT)? {
            self.reclaim_output()?;
        }
        Ok(self.output.iter().position(|b| !b.queued))
    }

    fn handle_events(&mut self) -> Result<()> {
        loop {
            let mut event = v4l2_event::default();
            match unsafe { xioctl(self.raw(), VIDIOC_DQEVENT, &mut event) } {
                Ok(_) => {}
                Err(e) if e.raw_os_error() == Some(libc::ENOENT) || would_block(&e) => return Ok(()),
                Err(e) => return Err(PipelineError::hw_decode(NAME, format!("DQEVENT: {}", e))),
            }
            match event.type_ {
                V4L2_EVENT_SOURCE_CHANGE if event.src_changes() & V4L2_EVENT_SRC_CH_RESOLUTION != 0 => {
                    let (format, color) = self.capture.reconfigure(self.pool_size)?;
                    self.visible = format.visible;
                    self.color = color;
                }
                V4L2_EVENT_SOURCE_CHANGE => tracing::debug!("source change without resolution change"),
                other => tracing::trace!(event = other, "ignored V4L2 event"),
            }
        }
    }
}

fn set_output_format(fd: RawFd, init: &DecoderInit) -> Result<()> {
    let sizeimage = (init.width * init.height * 3 / 4).max(MIN_BITSTREAM_BUFFER);
    let mut plane_fmt = [v4l2_plane_pix_format::default(); VIDEO_MAX_PLANES];
    plane_fmt[0].sizeimage = sizeimage;
    let pix = v4l2_pix_format_mplane {
        width: init.width,
        height: init.height,
        pixelformat: codec_fourcc(init.codec),
        field: V4L2_FIELD_NONE,
        plane_fmt,
        num_planes: 1,
        ..Default::default()
    };
    let mut fmt = v4l2_format::new(V4L2_BUF_TYPE_VIDEO_OUTPUT_MPLANE);
    fmt.set_pix_mp(pix);
    unsafe { xioctl(fd, VIDIOC_S_FMT, &mut fmt) }.map_err(|e| {
        PipelineError::BackendUnavailable(format!("{} bitstream format rejected: {}", init.codec.name(), e))
    })?;
    Ok(())
}

/// Ask for a capture layout up front; the driver has the final say at
/// source change time
fn request_capture_format(fd: RawFd, fourcc: u32) {
    let mut fmt = v4l2_format::new(V4L2_BUF_TYPE_VIDEO_CAPTURE_MPLANE);
    if unsafe { xioctl(fd, VIDIOC_G_FMT, &mut fmt) }.is_err() {
        return;
    }
    let mut pix = fmt.pix_mp();
    pix.pixelformat = fourcc;
    fmt.set_pix_mp(pix);
    if let Err(e) = unsafe { xioctl(fd, VIDIOC_S_FMT, &mut fmt) } {
        tracing::debug!(fourcc = format!("{:#010x}", fourcc), "capture format not accepted yet: {}", e);
    }
}

fn allocate_output(fd: RawFd) -> Result<Vec<OutputBuffer>> {
    let mut req = v4l2_requestbuffers {
        count: OUTPUT_BUFFERS,
        type_: V4L2_BUF_TYPE_VIDEO_OUTPUT_MPLANE,
        memory: V4L2_MEMORY_MMAP,
        ..Default::default()
    };
    unsafe { xioctl(fd, VIDIOC_REQBUFS, &mut req) }
        .map_err(|e| PipelineError::BackendUnavailable(format!("REQBUFS output: {}", e)))?;

    let mut buffers = Vec::with_capacity(req.count as usize);
    for index in 0..req.count {
        let mut planes = [v4l2_plane::default(); 1];
        let mut buf = v4l2_buffer::mplane(V4L2_BUF_TYPE_VIDEO_OUTPUT_MPLANE, index, &mut planes);
        unsafe { xioctl(fd, VIDIOC_QUERYBUF, &mut buf) }
            .map_err(|e| PipelineError::BackendUnavailable(format!("QUERYBUF output {}: {}", index, e)))?;
        let map = Mapping::new(fd, planes[0].length as usize, planes[0].mem_offset())?;
        buffers.push(OutputBuffer { map, queued: false });
    }
    Ok(buffers)
}

fn poll_fd(fd: RawFd, events: libc::c_short, timeout: Duration) -> Result<bool> {
    let mut pfd = libc::pollfd { fd, events, revents: 0 };
    let ret = unsafe { libc::poll(&mut pfd, 1, timeout.as_millis() as libc::c_int) };
    if ret < 0 {
        let err = io::Error::last_os_error();
        if err.raw_os_error() == Some(libc::EINTR) {
            return Ok(false);
        }
        return Err(PipelineError::hw_decode(NAME, format!("poll: {}", err)));
    }
    Ok(ret > 0 && pfd.revents & events != 0)
}

impl VideoDecoder for V4l2Decoder {
    fn name(&self) -> &'static str {
        NAME
    }

    fn is_hardware(&self) -> bool {
        true
    }

    fn output_format(&self) -> PixelFormat {
        PixelFormat::Hardware
    }

    fn submit(&mut self, unit: &AccessUnit) -> Result<()> {
        let index = self
            .free_output()?
            .ok_or_else(|| PipelineError::hw_decode(NAME, format!("{} stopped consuming bitstream", self.driver)))?;

        let raw = self.raw();
        let buffer = &mut self.output[index];
        let dst = buffer.map.as_mut_slice();
        if unit.data.len() > dst.len() {
            return Err(PipelineError::decode(
                NAME,
                format!("access unit of {} bytes exceeds {} byte bitstream buffer", unit.data.len(), dst.len()),
            ));
        }
        dst[..unit.data.len()].copy_from_slice(&unit.data);

        let mut planes = [v4l2_plane::default(); 1];
        planes[0].bytesused = unit.data.len() as u32;
        planes[0].length = dst.len() as u32;
        let mut buf = v4l2_buffer::mplane(V4L2_BUF_TYPE_VIDEO_OUTPUT_MPLANE, index as u32, &mut planes);
        if unit.keyframe {
            buf.flags |= V4L2_BUF_FLAG_KEYFRAME;
        }
        // echoed on the capture buffer; only used for tracing
        buf.timestamp.tv_usec = (self.submitted % 1_000_000) as libc::suseconds_t;
        unsafe { xioctl(raw, VIDIOC_QBUF, &mut buf) }
            .map_err(|e| PipelineError::hw_decode(NAME, format!("QBUF output: {}", e)))?;
        buffer.queued = true;
        self.submitted += 1;
        Ok(())
    }

    fn receive(&mut self, picture: &mut DecodedPicture) -> Result<bool> {
        self.handle_events()?;
        let Some((index, flags, bytesused, generation)) = self.capture.dequeue()? else {
            return Ok(false);
        };

        let source: Arc<dyn SurfaceSource> = self.capture.clone();
        let surface = HwSurface::new(source, index, generation);

        if flags & V4L2_BUF_FLAG_ERROR != 0 {
            // dropping the surface requeues the buffer
            drop(surface);
            return Err(PipelineError::decode(NAME, format!("{} flagged a corrupt frame", self.driver)));
        }
        if bytesused == 0 {
            drop(surface);
            return Ok(false);
        }

        let (width, height) = self.visible;
        picture.reset();
        picture.reshape(PixelFormat::Hardware, width, height);
        picture.surface = Some(surface);
        Ok(true)
    }

    fn wait_output(&mut self, timeout: Duration) -> Result<bool> {
        poll_fd(self.raw(), libc::POLLIN | libc::POLLPRI, timeout)
    }

    fn reset(&mut self) -> Result<()> {
        // OUTPUT STREAMOFF drops queued bitstream; the capture queue keeps its allocation
        stream(self.raw(), V4L2_BUF_TYPE_VIDEO_OUTPUT_MPLANE, false)?;
        self.output.iter_mut().for_each(|b| b.queued = false);
        stream(self.raw(), V4L2_BUF_TYPE_VIDEO_OUTPUT_MPLANE, true)?;
        tracing::debug!(driver = %self.driver, "bitstream queue flushed");
        Ok(())
    }

    fn color(&self) -> Option<(Colorspace, ColorRange)> {
        self.color
    }

    fn surface_pool_capacity(&self) -> usize {
        self.capture.pool_capacity()
    }
}

impl Drop for V4l2Decoder {
    fn drop(&mut self) {
        if let Err(e) = stream(self.raw(), V4L2_BUF_TYPE_VIDEO_OUTPUT_MPLANE, false) {
            tracing::debug!("{}", e);
        }
        // outstanding surfaces become stale; the fd lives until the last one drops
        self.capture.stop();
        tracing::debug!(driver = %self.driver, submitted = self.submitted, "V4L2 decoder closed");
    }
}
