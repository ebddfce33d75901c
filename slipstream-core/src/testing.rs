//! Mock backends shared by the unit tests.
//!
//! Every mock reports into a [`ProbeLog`] so tests can check what was
//! opened, drawn and torn down without real hardware.

use std::collections::VecDeque;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use raw_window_handle::RawDisplayHandle;

use crate::color::ColorConfig;
use crate::decoder::{DecoderInit, DecoderKind, DecoderProvider, VideoDecoder};
use crate::error::{PipelineError, Result};
use crate::network::{AccessUnit, HdrMetadata, SessionLink, VideoCodec};
use crate::picture::{ColorRange, Colorspace, DecodedPicture, PixelFormat};
use crate::platform::{
    DisplayBackend, DisplayKind, DisplayProvider, RenderBackend, RenderCaps, RenderInit, RenderKind,
    RenderProvider, SetupFlags, WindowOp,
};
use crate::surface::{
    DmaBufObject, HwSurface, PlaneLayout, SurfaceDescriptor, SurfaceSource, DRM_FORMAT_MOD_LINEAR,
    DRM_FORMAT_NV12,
};

/// Poll `cond` until it holds or `timeout` passes
pub fn wait_for(timeout: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(2));
    }
    cond()
}

// ============================================================================
// Probe Log
// ============================================================================

#[derive(Default)]
struct ProbeState {
    live_displays: usize,
    live_renders: usize,
    live_decoders: usize,
    opened_decoders: Vec<DecoderKind>,
    presented: Vec<u64>,
    color_syncs: Vec<(Colorspace, ColorRange)>,
    colorimetry: Vec<Option<HdrMetadata>>,
    window_ops: Vec<WindowOp>,
    setup_order: Vec<&'static str>,
    fail_draws: u32,
    fail_puts: u32,
    draw_delay: Duration,
}

/// Shared record of what the mocks did
#[derive(Clone, Default)]
pub struct ProbeLog {
    state: Arc<Mutex<ProbeState>>,
}

impl ProbeLog {
    pub fn live_displays(&self) -> usize {
        self.state.lock().live_displays
    }

    pub fn live_renders(&self) -> usize {
        self.state.lock().live_renders
    }

    pub fn live_decoders(&self) -> usize {
        self.state.lock().live_decoders
    }

    pub fn opened_decoders(&self) -> Vec<DecoderKind> {
        self.state.lock().opened_decoders.clone()
    }

    /// Sequence numbers in the order they reached the screen
    pub fn presented(&self) -> Vec<u64> {
        self.state.lock().presented.clone()
    }

    pub fn color_syncs(&self) -> Vec<(Colorspace, ColorRange)> {
        self.state.lock().color_syncs.clone()
    }

    pub fn colorimetry(&self) -> Vec<Option<HdrMetadata>> {
        self.state.lock().colorimetry.clone()
    }

    pub fn window_ops(&self) -> Vec<WindowOp> {
        self.state.lock().window_ops.clone()
    }

    pub fn setup_order(&self) -> Vec<&'static str> {
        self.state.lock().setup_order.clone()
    }

    /// Make the next `n` draws fail with a render error
    pub fn fail_draws(&self, n: u32) {
        self.state.lock().fail_draws = n;
    }

    /// Make the next `n` put_to_screen calls fail with a display error
    pub fn fail_puts(&self, n: u32) {
        self.state.lock().fail_puts = n;
    }

    /// Time every draw takes
    pub fn set_draw_delay(&self, delay: Duration) {
        self.state.lock().draw_delay = delay;
    }

    fn record(&self, f: impl FnOnce(&mut ProbeState)) {
        f(&mut self.state.lock());
    }
}

// ============================================================================
// Surfaces
// ============================================================================

/// Read end of a pipe whose write end was handed out as a DMA-BUF fd
pub struct FdProbe {
    read: OwnedFd,
}

impl FdProbe {
    /// The handed-out descriptor has been closed
    pub fn is_closed(&self) -> bool {
        let mut pfd = libc::pollfd { fd: self.read.as_raw_fd(), events: libc::POLLIN, revents: 0 };
        let ret = unsafe { libc::poll(&mut pfd, 1, 0) };
        ret > 0 && pfd.revents & libc::POLLHUP != 0
    }
}

fn probe_pair() -> (OwnedFd, FdProbe) {
    let mut fds = [0 as libc::c_int; 2];
    let ret = unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_CLOEXEC) };
    assert_eq!(ret, 0, "pipe2 failed");
    // SAFETY: fresh descriptors from pipe2
    let (read, write) = unsafe { (OwnedFd::from_raw_fd(fds[0]), OwnedFd::from_raw_fd(fds[1])) };
    (write, FdProbe { read })
}

#[derive(Default)]
struct SurfaceState {
    outstanding: usize,
    recycled: Vec<u32>,
    probes: Vec<FdProbe>,
}

/// Surface pool exporting two-object NV12 descriptors backed by pipes
pub struct MockSurfaceSource {
    capacity: usize,
    reserve: usize,
    state: Mutex<SurfaceState>,
}

impl MockSurfaceSource {
    pub fn new(capacity: usize) -> Arc<Self> {
        Self::with_reserve(capacity, 0)
    }

    /// Pool where the decoder keeps `reserve` surfaces for itself
    pub fn with_reserve(capacity: usize, reserve: usize) -> Arc<Self> {
        Arc::new(Self { capacity, reserve, state: Mutex::new(SurfaceState::default()) })
    }

    /// Hand out surface `index` as if the decoder had just filled it
    pub fn surface(self: &Arc<Self>, index: u32) -> HwSurface {
        self.state.lock().outstanding += 1;
        let source: Arc<dyn SurfaceSource> = self.clone();
        HwSurface::new(source, index, 0)
    }

    /// Probes for every fd exported so far
    pub fn take_probes(&self) -> Vec<FdProbe> {
        std::mem::take(&mut self.state.lock().probes)
    }

    /// Surfaces handed out and not yet recycled
    pub fn outstanding(&self) -> usize {
        self.state.lock().outstanding
    }

    pub fn recycled(&self) -> Vec<u32> {
        self.state.lock().recycled.clone()
    }
}

impl SurfaceSource for MockSurfaceSource {
    fn name(&self) -> &'static str {
        "mock-surface"
    }

    fn sync(&self, _index: u32, _generation: u64) -> Result<()> {
        Ok(())
    }

    fn export(&self, _index: u32, _generation: u64) -> Result<SurfaceDescriptor> {
        let mut state = self.state.lock();
        let mut objects = Vec::new();
        for _ in 0..2 {
            let (fd, probe) = probe_pair();
            state.probes.push(probe);
            objects.push(DmaBufObject { fd, size: 4096, modifier: DRM_FORMAT_MOD_LINEAR });
        }
        Ok(SurfaceDescriptor {
            fourcc: DRM_FORMAT_NV12,
            width: 64,
            height: 64,
            objects,
            planes: vec![
                PlaneLayout { object: 0, offset: 0, pitch: 64 },
                PlaneLayout { object: 1, offset: 0, pitch: 64 },
            ],
        })
    }

    fn recycle(&self, index: u32, _generation: u64) {
        let mut state = self.state.lock();
        state.outstanding -= 1;
        state.recycled.push(index);
    }

    fn pool_capacity(&self) -> usize {
        self.capacity
    }

    fn decoder_reserve(&self) -> usize {
        self.reserve
    }
}

// ============================================================================
// Decoders
// ============================================================================

/// Access units starting with this byte fail as corrupt bitstream
pub const CORRUPT_UNIT: u8 = 0xFF;
/// Access units starting with this byte fail as a hardware fault
pub const DEVICE_FAULT_UNIT: u8 = 0xFE;
/// Access units starting with this byte signal BT.2020 full range, as a
/// decoder parsing a new VUI would report
pub const BT2020_FULL_UNIT: u8 = 0xFD;

pub struct MockDecoder {
    kind: DecoderKind,
    width: u32,
    height: u32,
    queued: VecDeque<AccessUnit>,
    surfaces: Option<Arc<MockSurfaceSource>>,
    next_surface: u32,
    color: Option<(Colorspace, ColorRange)>,
    log: ProbeLog,
}

impl VideoDecoder for MockDecoder {
    fn name(&self) -> &'static str {
        self.kind.name()
    }

    fn is_hardware(&self) -> bool {
        self.kind.is_hardware()
    }

    fn output_format(&self) -> PixelFormat {
        if self.kind.is_hardware() {
            PixelFormat::Hardware
        } else {
            PixelFormat::Yuv420p
        }
    }

    fn submit(&mut self, unit: &AccessUnit) -> Result<()> {
        match unit.data.first() {
            Some(&CORRUPT_UNIT) => Err(PipelineError::decode("mock", "corrupt access unit")),
            Some(&DEVICE_FAULT_UNIT) => Err(PipelineError::hw_decode("mock", "device fault")),
            _ => {
                self.queued.push_back(unit.clone());
                Ok(())
            }
        }
    }

    fn receive(&mut self, picture: &mut DecodedPicture) -> Result<bool> {
        let Some(unit) = self.queued.pop_front() else {
            return Ok(false);
        };
        if unit.data.first() == Some(&BT2020_FULL_UNIT) {
            self.color = Some((Colorspace::Bt2020, ColorRange::Full));
        }
        match &self.surfaces {
            Some(source) => {
                picture.reset();
                picture.reshape(PixelFormat::Hardware, self.width, self.height);
                let index = self.next_surface % source.pool_capacity() as u32;
                self.next_surface += 1;
                picture.surface = Some(source.surface(index));
            }
            None => {
                picture.reshape(PixelFormat::Yuv420p, self.width, self.height);
                if let (Some(plane), Some(&byte)) = (picture.planes.first_mut(), unit.data.first()) {
                    plane.data[0] = byte;
                }
            }
        }
        Ok(true)
    }

    fn reset(&mut self) -> Result<()> {
        self.queued.clear();
        Ok(())
    }

    fn color(&self) -> Option<(Colorspace, ColorRange)> {
        self.color
    }

    fn surface_pool_capacity(&self) -> usize {
        self.surfaces.as_ref().map_or(0, |s| s.pool_capacity())
    }
}

impl Drop for MockDecoder {
    fn drop(&mut self) {
        self.log.record(|s| s.live_decoders -= 1);
    }
}

/// Surfaces every hardware decoder opened by one provider draws from
pub const MOCK_SURFACE_POOL: usize = 16;

pub struct MockDecoderProvider {
    kind: DecoderKind,
    ok: bool,
    supports_444: bool,
    surfaces: Option<Arc<MockSurfaceSource>>,
    log: ProbeLog,
}

impl MockDecoderProvider {
    pub fn new(kind: DecoderKind, ok: bool, supports_444: bool, log: &ProbeLog) -> Self {
        let surfaces = kind.is_hardware().then(|| MockSurfaceSource::new(MOCK_SURFACE_POOL));
        Self { kind, ok, supports_444, surfaces, log: log.clone() }
    }

    pub fn surfaces(&self) -> Option<Arc<MockSurfaceSource>> {
        self.surfaces.clone()
    }
}

impl DecoderProvider for MockDecoderProvider {
    fn kind(&self) -> DecoderKind {
        self.kind
    }

    fn name(&self) -> &str {
        self.kind.name()
    }

    fn supports(&self, _codec: VideoCodec) -> bool {
        true
    }

    fn supports_444(&self, _codec: VideoCodec) -> bool {
        self.supports_444
    }

    fn open(&self, init: &DecoderInit) -> Result<Box<dyn VideoDecoder>> {
        if !self.ok {
            return Err(PipelineError::BackendUnavailable(format!("{} refused to open", self.kind.name())));
        }
        self.log.record(|s| {
            s.live_decoders += 1;
            s.opened_decoders.push(self.kind);
        });
        Ok(Box::new(MockDecoder {
            kind: self.kind,
            width: init.width,
            height: init.height,
            queued: VecDeque::new(),
            surfaces: self.surfaces.clone(),
            next_surface: 0,
            color: None,
            log: self.log.clone(),
        }))
    }
}

// ============================================================================
// Display
// ============================================================================

pub struct MockDisplay {
    kind: DisplayKind,
    size: (u32, u32),
    log: ProbeLog,
    closed: bool,
}

impl MockDisplay {
    pub fn new(kind: DisplayKind, log: &ProbeLog) -> Self {
        log.record(|s| s.live_displays += 1);
        Self { kind, size: (0, 0), log: log.clone(), closed: false }
    }

    pub fn window() -> Self {
        Self::new(DisplayKind::Window, &ProbeLog::default())
    }

    fn release(&mut self) {
        if !self.closed {
            self.closed = true;
            self.log.record(|s| s.live_displays -= 1);
        }
    }
}

impl DisplayBackend for MockDisplay {
    fn kind(&self) -> DisplayKind {
        self.kind
    }

    fn display_handle(&self) -> Option<RawDisplayHandle> {
        None
    }

    fn window(&self) -> Option<Arc<winit::window::Window>> {
        None
    }

    fn setup(&mut self, width: u32, height: u32, _flags: SetupFlags) -> Result<()> {
        self.size = (width, height);
        self.log.record(|s| s.setup_order.push("display.setup"));
        Ok(())
    }

    fn setup_post(&mut self) -> Result<()> {
        self.log.record(|s| s.setup_order.push("display.setup_post"));
        Ok(())
    }

    fn put_to_screen(&mut self, _index: usize) -> Result<()> {
        let mut state = self.log.state.lock();
        if state.fail_puts > 0 {
            state.fail_puts -= 1;
            return Err(PipelineError::display("mock", "surface lost"));
        }
        Ok(())
    }

    fn resolution(&self) -> (u32, u32) {
        self.size
    }

    fn modify_window(&mut self, op: WindowOp) -> Result<()> {
        self.log.record(|s| s.window_ops.push(op));
        Ok(())
    }

    fn apply_colorimetry(&mut self, metadata: Option<&HdrMetadata>) -> Result<bool> {
        self.log.record(|s| {
            s.setup_order.push("colorimetry");
            s.colorimetry.push(metadata.copied());
        });
        Ok(self.kind == DisplayKind::Kms)
    }

    fn close(&mut self) {
        self.release();
    }
}

impl Drop for MockDisplay {
    fn drop(&mut self) {
        self.release();
    }
}

pub struct MockDisplayProvider {
    kind: DisplayKind,
    ok: bool,
    log: ProbeLog,
}

impl MockDisplayProvider {
    pub fn new(kind: DisplayKind, ok: bool, log: &ProbeLog) -> Self {
        Self { kind, ok, log: log.clone() }
    }
}

impl DisplayProvider for MockDisplayProvider {
    fn kind(&self) -> DisplayKind {
        self.kind
    }

    fn open(&self) -> Result<Box<dyn DisplayBackend>> {
        if !self.ok {
            return Err(PipelineError::BackendUnavailable(format!("no {} display", self.kind.name())));
        }
        Ok(Box::new(MockDisplay::new(self.kind, &self.log)))
    }
}

// ============================================================================
// Render
// ============================================================================

pub struct MockRender {
    kind: RenderKind,
    caps: RenderCaps,
    log: ProbeLog,
    /// Surface of the picture on screen, held until the next draw
    on_screen: Option<HwSurface>,
    destroyed: bool,
}

impl MockRender {
    fn release(&mut self) {
        self.on_screen = None;
        if !self.destroyed {
            self.destroyed = true;
            self.log.record(|s| s.live_renders -= 1);
        }
    }
}

impl RenderBackend for MockRender {
    fn kind(&self) -> RenderKind {
        self.kind
    }

    fn caps(&self) -> RenderCaps {
        self.caps
    }

    fn init(&mut self, _display: &mut dyn DisplayBackend, _info: &RenderInit) -> Result<()> {
        self.log.record(|s| s.setup_order.push("render.init"));
        Ok(())
    }

    fn sync_config(&mut self, config: &ColorConfig) -> Result<()> {
        self.log.record(|s| s.color_syncs.push((config.colorspace, config.range)));
        Ok(())
    }

    fn draw(&mut self, picture: &mut DecodedPicture, _display: &mut dyn DisplayBackend) -> Result<usize> {
        let delay = {
            let mut state = self.log.state.lock();
            if state.fail_draws > 0 {
                state.fail_draws -= 1;
                return Err(PipelineError::render("mock", "draw failed"));
            }
            state.draw_delay
        };
        if !delay.is_zero() {
            std::thread::sleep(delay);
        }
        if picture.is_hardware() && !self.caps.contains(RenderCaps::HW_SURFACES) {
            return Err(PipelineError::render("mock", "cannot show hardware surfaces"));
        }
        self.on_screen = picture.surface.take();
        self.log.record(|s| s.presented.push(picture.sequence));
        Ok(0)
    }

    fn map_buffer(&mut self, picture: &mut DecodedPicture, display: &mut dyn DisplayBackend) -> Result<usize> {
        if !self.caps.contains(RenderCaps::MAP_BUFFER) {
            return Err(PipelineError::render("mock", "map_buffer unsupported"));
        }
        self.draw(picture, display)
    }

    fn unmap_buffer(&mut self, _index: usize, _display: &mut dyn DisplayBackend) {
        self.on_screen = None;
    }

    fn destroy(&mut self, _display: &mut dyn DisplayBackend) {
        self.release();
    }
}

impl Drop for MockRender {
    fn drop(&mut self) {
        self.release();
    }
}

pub struct MockRenderProvider {
    kind: RenderKind,
    ok: bool,
    caps: RenderCaps,
    log: ProbeLog,
}

impl MockRenderProvider {
    pub fn new(kind: RenderKind, ok: bool, caps: RenderCaps, log: &ProbeLog) -> Self {
        Self { kind, ok, caps, log: log.clone() }
    }
}

impl RenderProvider for MockRenderProvider {
    fn kind(&self) -> RenderKind {
        self.kind
    }

    fn create(&self, _display: &mut dyn DisplayBackend) -> Result<Box<dyn RenderBackend>> {
        if !self.ok {
            return Err(PipelineError::BackendUnavailable(format!("{} unavailable", self.kind.name())));
        }
        self.log.record(|s| s.live_renders += 1);
        Ok(Box::new(MockRender {
            kind: self.kind,
            caps: self.caps,
            log: self.log.clone(),
            on_screen: None,
            destroyed: false,
        }))
    }
}

// ============================================================================
// Session Link
// ============================================================================

#[derive(Default)]
pub struct MockLink {
    keyframes: AtomicUsize,
    hdr: Mutex<Option<HdrMetadata>>,
}

impl MockLink {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn keyframe_requests(&self) -> usize {
        self.keyframes.load(Ordering::SeqCst)
    }

    pub fn set_hdr(&self, metadata: Option<HdrMetadata>) {
        *self.hdr.lock() = metadata;
    }
}

impl SessionLink for MockLink {
    fn request_keyframe(&self) {
        self.keyframes.fetch_add(1, Ordering::SeqCst);
    }

    fn hdr_metadata(&self) -> Option<HdrMetadata> {
        *self.hdr.lock()
    }
}
