//! # Producer-Consumer Pipeline
//!
//! Moves pictures from the decoder to the screen through the frame ring:
//!
//! ```text
//!  Threaded mode:
//!   AccessUnitQueue ─► [decode thread] ─► FrameRing ─► [render thread] ─► display
//!                         DecodeEngine     N slots       Presenter
//!
//!  Direct mode (renderer declares DIRECT_DRAW):
//!   AccessUnitQueue ─► [direct thread] ─► FrameRing slot ─► Presenter ─► display
//! ```
//!
//! The ring is the only state the two threads share. Back-pressure comes
//! from the ring's fixed size: the decode thread waits for a slot instead
//! of dropping frames. Failures are resolved on the thread that saw them
//! when the recovery controller says a resync is enough; anything bigger
//! is parked in the failure slot and the session is woken through the
//! notifier.
//!
//! Backends are torn down on the thread that used them, after it observes
//! the done flag.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::Serialize;

use crate::color::ColorNegotiator;
use crate::decoder::{DecodeEngine, DecoderKind};
use crate::error::{PipelineError, Result};
use crate::network::{AccessUnit, AccessUnitQueue, HdrMetadata, SessionLink};
use crate::picture::{ColorRange, Colorspace, DecodedPicture, PixelFormat};
use crate::platform::{
    DisplayBackend, DisplayKind, PlatformPair, RenderBackend, RenderCaps, RenderInit, RenderKind, SetupFlags,
    WindowOp,
};
use crate::recovery::{RecoveryAction, RecoveryController};
use crate::ring::{FrameRing, PresentSlot};
use crate::signal::Notifier;
use crate::surface::SurfaceBridge;

/// How long the decode thread waits for network input before re-checking flags
const INPUT_WAIT: Duration = Duration::from_millis(100);
/// How long the decode thread waits for a hardware decoder to produce output
const OUTPUT_WAIT: Duration = Duration::from_millis(20);
/// How long the render thread waits for a ready picture before re-checking flags
const PRESENT_WAIT: Duration = Duration::from_millis(100);
const BACKLOG_WARN_INTERVAL: Duration = Duration::from_secs(1);

// ============================================================================
// Statistics
// ============================================================================

/// Session-wide counters, updated lock-free from both threads
#[derive(Debug, Default)]
pub struct StatsCounters {
    decoded: AtomicU64,
    presented: AtomicU64,
    skipped: AtomicU64,
    decode_errors: AtomicU64,
    backlog_warnings: AtomicU64,
    decode_latency_us: AtomicU64,
    present_latency_us: AtomicU64,
}

impl StatsCounters {
    fn add_decoded(&self, latency: Option<Duration>) {
        self.decoded.fetch_add(1, Ordering::Relaxed);
        if let Some(latency) = latency {
            self.decode_latency_us.fetch_add(latency.as_micros() as u64, Ordering::Relaxed);
        }
    }

    fn add_presented(&self, latency: Option<Duration>) {
        self.presented.fetch_add(1, Ordering::Relaxed);
        if let Some(latency) = latency {
            self.present_latency_us.fetch_add(latency.as_micros() as u64, Ordering::Relaxed);
        }
    }

    pub fn snapshot(&self, pending_units: usize) -> PipelineStats {
        let decoded = self.decoded.load(Ordering::Relaxed);
        let presented = self.presented.load(Ordering::Relaxed);
        let average = |total: &AtomicU64, n: u64| {
            if n == 0 { 0.0 } else { total.load(Ordering::Relaxed) as f64 / n as f64 / 1000.0 }
        };
        PipelineStats {
            decoded,
            presented,
            skipped: self.skipped.load(Ordering::Relaxed),
            decode_errors: self.decode_errors.load(Ordering::Relaxed),
            backlog_warnings: self.backlog_warnings.load(Ordering::Relaxed),
            pending_units,
            avg_decode_latency_ms: average(&self.decode_latency_us, decoded),
            avg_present_latency_ms: average(&self.present_latency_us, presented),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct PipelineStats {
    pub decoded: u64,
    pub presented: u64,
    /// Access units skipped while waiting for a keyframe
    pub skipped: u64,
    pub decode_errors: u64,
    pub backlog_warnings: u64,
    /// Access units received but not yet submitted to the decoder
    pub pending_units: usize,
    /// Submit to decoded, in milliseconds
    pub avg_decode_latency_ms: f64,
    /// Submit to on screen, in milliseconds
    pub avg_present_latency_ms: f64,
}

// ============================================================================
// Shared State
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum PipelineMode {
    /// Decode and present on one thread
    Direct,
    /// Decode thread and render thread joined by the ring
    Threaded,
}

/// A failure the pipeline thread could not resolve itself
#[derive(Debug)]
pub struct Failure {
    pub error: PipelineError,
    pub action: RecoveryAction,
}

/// Handles that outlive a single pipeline; the session rebuilds pipelines
/// around them
#[derive(Clone)]
pub struct PipelineContext {
    pub queue: Arc<AccessUnitQueue>,
    pub link: Arc<dyn SessionLink>,
    pub recovery: Arc<Mutex<RecoveryController>>,
    pub notifier: Arc<Notifier>,
    pub stats: Arc<StatsCounters>,
    /// Colour description in effect; a rebuilt decoder starts from it
    pub color: Arc<Mutex<(Colorspace, ColorRange)>>,
    pub backlog_warn_threshold: usize,
}

/// Per-pipeline flags and mailboxes
#[derive(Default)]
struct Control {
    done: AtomicBool,
    failure: Mutex<Option<Failure>>,
    window_ops: Mutex<Vec<WindowOp>>,
    color: Mutex<Option<(Colorspace, ColorRange)>>,
}

impl Control {
    fn is_done(&self) -> bool {
        self.done.load(Ordering::SeqCst)
    }

    /// Park a failure for the session; the first one wins
    fn report(&self, failure: Failure, notifier: &Notifier) {
        {
            let mut slot = self.failure.lock();
            if slot.is_none() {
                *slot = Some(failure);
            }
        }
        notifier.notify();
    }

    fn take_window_ops(&self) -> Vec<WindowOp> {
        std::mem::take(&mut *self.window_ops.lock())
    }
}

/// What a failing thread should do next
fn triage(err: PipelineError, control: &Control, ctx: &PipelineContext) -> Option<RecoveryAction> {
    if matches!(err, PipelineError::ShuttingDown) || control.is_done() {
        return None;
    }
    let action = ctx.recovery.lock().on_failure(&err);
    if action == RecoveryAction::Resync {
        return Some(action);
    }
    control.report(Failure { error: err, action }, &ctx.notifier);
    None
}

// ============================================================================
// Presenter
// ============================================================================

/// Display + renderer + colour state, owned by the presenting thread
struct Presenter {
    display: Box<dyn DisplayBackend>,
    render: Box<dyn RenderBackend>,
    init: RenderInit,
    flags: SetupFlags,
    hdr_stream: bool,
    hdr: Option<HdrMetadata>,
    color: ColorNegotiator,
    zero_copy: bool,
}

impl Presenter {
    fn new(pair: PlatformPair, setup: &PipelineSetup, bridge: SurfaceBridge) -> Self {
        let mut flags = SetupFlags::empty();
        if setup.vsync {
            flags |= SetupFlags::VSYNC;
        }
        if setup.hdr {
            flags |= SetupFlags::HDR;
        }
        let zero_copy = pair.render.caps().contains(RenderCaps::MAP_BUFFER);
        Self {
            display: pair.display,
            render: pair.render,
            init: RenderInit { width: setup.width, height: setup.height, vsync: setup.vsync, bridge },
            flags,
            hdr_stream: setup.hdr,
            hdr: None,
            color: ColorNegotiator::new(),
            zero_copy,
        }
    }

    /// display setup, renderer init, display post-setup, then colorimetry
    fn setup(&mut self, link: &dyn SessionLink) -> Result<()> {
        self.display.setup(self.init.width, self.init.height, self.flags)?;
        self.render.init(self.display.as_mut(), &self.init)?;
        self.display.setup_post()?;

        self.hdr = if self.hdr_stream { link.hdr_metadata() } else { None };
        let committed = self.display.apply_colorimetry(self.hdr.as_ref())?;
        tracing::info!(
            display = self.display.name(),
            render = self.render.name(),
            zero_copy = self.zero_copy,
            hdr = self.hdr.is_some(),
            colorimetry = committed,
            "presenter ready"
        );
        Ok(())
    }

    /// Re-commit colorimetry when the host's HDR state changed
    fn refresh_hdr(&mut self, link: &dyn SessionLink) -> Result<()> {
        if !self.hdr_stream {
            return Ok(());
        }
        let current = link.hdr_metadata();
        if current != self.hdr {
            self.display.apply_colorimetry(current.as_ref())?;
            tracing::info!(hdr = current.is_some(), "HDR metadata changed");
            self.hdr = current;
        }
        Ok(())
    }

    fn present(&mut self, picture: &mut DecodedPicture, link: &dyn SessionLink) -> Result<()> {
        if picture.keyframe {
            self.refresh_hdr(link)?;
        }
        // before the first draw of a new format, never mid-frame
        if let Some(config) = self.color.update(picture.colorspace, picture.range) {
            self.render.sync_config(config)?;
        }

        let mapped = self.zero_copy && picture.is_hardware();
        let index = if mapped {
            self.render.map_buffer(picture, self.display.as_mut())?
        } else {
            self.render.draw(picture, self.display.as_mut())?
        };
        if let Err(e) = self.display.put_to_screen(index) {
            if mapped {
                self.render.unmap_buffer(index, self.display.as_mut());
            }
            return Err(e);
        }
        Ok(())
    }

    fn apply_window_ops(&mut self, ops: Vec<WindowOp>) {
        for op in ops {
            if let Err(e) = self.display.modify_window(op.clone()) {
                tracing::warn!(?op, "window operation failed: {}", e);
            }
        }
    }

    fn teardown(mut self) {
        self.render.destroy(self.display.as_mut());
        self.display.close();
        tracing::debug!(display = self.display.name(), render = self.render.name(), "presenter torn down");
    }
}

/// Present one ring picture and hand its slot back
fn present_slot(presenter: &mut Presenter, ring: &FrameRing, ctx: &PipelineContext, mut slot: PresentSlot) -> Result<()> {
    let result = presenter.present(&mut slot.picture, ctx.link.as_ref());
    let latency = slot.picture.submitted_at.map(|t| t.elapsed());
    ring.release(slot)?;
    result?;
    ctx.stats.add_presented(latency);
    ctx.recovery.lock().on_frame_presented();
    Ok(())
}

fn render_loop(
    mut presenter: Presenter,
    ring: Arc<FrameRing>,
    control: Arc<Control>,
    ctx: PipelineContext,
    ready: mpsc::SyncSender<Result<()>>,
) {
    if let Err(e) = presenter.setup(ctx.link.as_ref()) {
        presenter.teardown();
        let _ = ready.send(Err(e));
        return;
    }
    let _ = ready.send(Ok(()));

    while !control.is_done() {
        presenter.apply_window_ops(control.take_window_ops());

        let result = match ring.acquire_present(Some(PRESENT_WAIT)) {
            Ok(Some(slot)) => present_slot(&mut presenter, &ring, &ctx, slot),
            Ok(None) => continue,
            Err(e) => Err(e),
        };
        if let Err(e) = result {
            match triage(e, &control, &ctx) {
                Some(_) => ctx.link.request_keyframe(),
                None => break,
            }
        }
    }
    presenter.teardown();
}

// ============================================================================
// Decode Stage
// ============================================================================

struct DecodeStage {
    engine: DecodeEngine,
    ring: Arc<FrameRing>,
    control: Arc<Control>,
    ctx: PipelineContext,
    /// Direct mode presents on this thread
    presenter: Option<Presenter>,
    awaiting_keyframe: bool,
    last_backlog_warning: Option<Instant>,
}

impl DecodeStage {
    fn run(mut self) -> (DecodeEngine, Option<Presenter>) {
        while !self.control.is_done() {
            if let Some(presenter) = self.presenter.as_mut() {
                presenter.apply_window_ops(self.control.take_window_ops());
            }

            let result = match self.ctx.queue.pop_blocking(INPUT_WAIT) {
                Some(unit) => self.handle_unit(unit),
                None if self.ctx.queue.is_closed() => break,
                // pick up frames a hardware decoder finished late
                None if self.engine.in_decoder() > 0 => self.drain(),
                None => Ok(()),
            };
            if let Err(e) = result {
                if !self.recover(e) {
                    break;
                }
            }
        }
        (self.engine, self.presenter)
    }

    fn handle_unit(&mut self, unit: AccessUnit) -> Result<()> {
        self.check_backlog();

        if self.awaiting_keyframe {
            if !unit.keyframe {
                self.ctx.stats.skipped.fetch_add(1, Ordering::Relaxed);
                tracing::trace!(frame = unit.frame_number, "skipping until keyframe");
                return Ok(());
            }
            tracing::info!(frame = unit.frame_number, "keyframe received, decoder resynchronised");
            self.awaiting_keyframe = false;
        }

        self.engine.submit(&unit)?;
        if !self.engine.wait_output(OUTPUT_WAIT)? {
            return Ok(());
        }
        self.drain()
    }

    /// Move every picture the decoder has ready into the ring
    fn drain(&mut self) -> Result<()> {
        loop {
            // blocks while the next slot is still on its way to the screen
            let mut slot = self.ring.acquire_fill()?;
            // applied before the picture is stamped
            if let Some((colorspace, range)) = self.control.color.lock().take() {
                self.engine.set_color(colorspace, range);
            }
            match self.engine.receive(&mut slot.picture) {
                Ok(true) => {}
                Ok(false) => return self.ring.cancel(slot),
                Err(e) => {
                    self.ring.cancel(slot)?;
                    return Err(e);
                }
            }
            if let Some(color) = self.engine.take_color_change() {
                *self.ctx.color.lock() = color;
            }
            self.ctx.stats.add_decoded(slot.picture.submitted_at.map(|t| t.elapsed()));
            self.ctx.recovery.lock().on_decoded();
            self.ring.publish(slot)?;

            if let Some(presenter) = self.presenter.as_mut() {
                if let Some(ready) = self.ring.acquire_present(Some(Duration::ZERO))? {
                    present_slot(presenter, &self.ring, &self.ctx, ready)?;
                }
            }
        }
    }

    fn check_backlog(&mut self) {
        let pending = self.ctx.queue.pending();
        if pending <= self.ctx.backlog_warn_threshold {
            return;
        }
        if self.last_backlog_warning.is_some_and(|t| t.elapsed() < BACKLOG_WARN_INTERVAL) {
            return;
        }
        self.last_backlog_warning = Some(Instant::now());
        self.ctx.stats.backlog_warnings.fetch_add(1, Ordering::Relaxed);
        tracing::warn!(
            pending,
            threshold = self.ctx.backlog_warn_threshold,
            "decoder is falling behind the network, consider lowering the bitrate"
        );
    }

    /// Returns false when the thread should stop
    fn recover(&mut self, err: PipelineError) -> bool {
        let Some(_) = triage(err, &self.control, &self.ctx) else {
            return false;
        };
        self.ctx.stats.decode_errors.fetch_add(1, Ordering::Relaxed);
        tracing::info!("requesting keyframe");
        self.ctx.link.request_keyframe();
        if let Err(e) = self.engine.reset() {
            tracing::warn!("decoder reset failed: {}", e);
            let action = self.ctx.recovery.lock().on_failure(&e);
            self.control.report(Failure { error: e, action }, &self.ctx.notifier);
            return false;
        }
        self.awaiting_keyframe = true;
        true
    }
}

// ============================================================================
// Pipeline
// ============================================================================

/// Everything a pipeline needs besides its backends
#[derive(Debug, Clone)]
pub struct PipelineSetup {
    pub ring_size: usize,
    pub width: u32,
    pub height: u32,
    pub vsync: bool,
    pub hdr: bool,
    /// Direct mode allowed by the capability set
    pub direct: bool,
    /// Skip to the next keyframe before decoding
    pub resync: bool,
}

/// Which backends a running pipeline was built from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ChainInfo {
    pub display: DisplayKind,
    pub render: RenderKind,
    pub decoder: DecoderKind,
    pub format: PixelFormat,
    pub mode: PipelineMode,
    pub ring_size: usize,
}

pub struct Pipeline {
    info: ChainInfo,
    ring: Arc<FrameRing>,
    control: Arc<Control>,
    decode: Option<JoinHandle<DecodeEngine>>,
    render: Option<JoinHandle<()>>,
}

impl Pipeline {
    /// Allocate the ring, set up the presenter on its thread and start
    /// decoding. Returns once the presenter is ready.
    pub fn start(ctx: PipelineContext, engine: DecodeEngine, pair: PlatformPair, setup: PipelineSetup) -> Result<Self> {
        let pictures = (0..setup.ring_size).map(|_| engine.allocate_picture()).collect();
        let ring = Arc::new(FrameRing::new(pictures));
        let control = Arc::new(Control::default());

        let direct = setup.direct && pair.render.caps().contains(RenderCaps::DIRECT_DRAW);
        let info = ChainInfo {
            display: pair.display.kind(),
            render: pair.render.kind(),
            decoder: engine.kind(),
            format: engine.output_format(),
            mode: if direct { PipelineMode::Direct } else { PipelineMode::Threaded },
            ring_size: setup.ring_size,
        };
        let presenter = Presenter::new(pair, &setup, SurfaceBridge::new());
        let (ready_tx, ready_rx) = mpsc::sync_channel(1);

        let mut pipeline = Self { info, ring: ring.clone(), control: control.clone(), decode: None, render: None };

        let stage = DecodeStage {
            engine,
            ring: ring.clone(),
            control: control.clone(),
            ctx: ctx.clone(),
            presenter: None,
            awaiting_keyframe: setup.resync,
            last_backlog_warning: None,
        };

        if direct {
            let handle = thread::Builder::new().name("slipstream-direct".into()).spawn(move || {
                let mut stage = stage;
                let mut presenter = presenter;
                if let Err(e) = presenter.setup(stage.ctx.link.as_ref()) {
                    presenter.teardown();
                    let _ = ready_tx.send(Err(e));
                    return stage.engine;
                }
                let _ = ready_tx.send(Ok(()));
                stage.presenter = Some(presenter);
                let (engine, presenter) = stage.run();
                if let Some(presenter) = presenter {
                    presenter.teardown();
                }
                engine
            })?;
            pipeline.decode = Some(handle);
            wait_ready(&ready_rx)?;
        } else {
            let render_ctx = ctx.clone();
            let handle = thread::Builder::new()
                .name("slipstream-render".into())
                .spawn(move || render_loop(presenter, ring, control, render_ctx, ready_tx))?;
            pipeline.render = Some(handle);
            wait_ready(&ready_rx)?;

            let handle = thread::Builder::new().name("slipstream-decode".into()).spawn(move || stage.run().0)?;
            pipeline.decode = Some(handle);
        }

        tracing::info!(
            mode = ?pipeline.info.mode,
            ring = pipeline.info.ring_size,
            decoder = pipeline.info.decoder.name(),
            display = pipeline.info.display.name(),
            render = pipeline.info.render.name(),
            "pipeline running"
        );
        Ok(pipeline)
    }

    pub fn info(&self) -> ChainInfo {
        self.info
    }

    pub fn mode(&self) -> PipelineMode {
        self.info.mode
    }

    pub fn ring(&self) -> &FrameRing {
        &self.ring
    }

    /// Failure waiting for the session, if any
    pub fn take_failure(&self) -> Option<Failure> {
        self.control.failure.lock().take()
    }

    /// Forward a window operation to the presenting thread
    pub fn queue_window_op(&self, op: WindowOp) {
        self.control.window_ops.lock().push(op);
    }

    /// Colour description to stamp on pictures decoded from now on
    pub fn set_color(&self, colorspace: Colorspace, range: ColorRange) {
        *self.control.color.lock() = Some((colorspace, range));
    }

    /// Stop both threads and return the decoder for reuse
    pub fn stop(mut self) -> Option<DecodeEngine> {
        self.stop_threads()
    }

    fn stop_threads(&mut self) -> Option<DecodeEngine> {
        let started = Instant::now();
        self.control.done.store(true, Ordering::SeqCst);
        self.ring.shutdown();

        let engine = self.decode.take().and_then(|h| match h.join() {
            Ok(engine) => Some(engine),
            Err(_) => {
                tracing::error!("decode thread panicked");
                None
            }
        });
        if let Some(h) = self.render.take() {
            if h.join().is_err() {
                tracing::error!("render thread panicked");
            }
        }

        // hardware surfaces parked in the ring go back to the decoder
        let dropped = self.ring.clear();
        tracing::debug!(
            dropped,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "pipeline stopped"
        );
        engine
    }
}

impl Drop for Pipeline {
    fn drop(&mut self) {
        if self.decode.is_some() || self.render.is_some() {
            self.stop_threads();
        }
    }
}

fn wait_ready(ready: &mpsc::Receiver<Result<()>>) -> Result<()> {
    ready
        .recv()
        .map_err(|_| PipelineError::BackendUnavailable("presenter thread exited during setup".into()))?
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PipelineConfig;
    use crate::decoder::{DecoderProvider, EngineOptions};
    use crate::network::StreamParams;
    use crate::platform::RenderProvider;
    use crate::recovery::{ReinitScope, RecoveryState};
    use crate::testing::{
        wait_for, MockDecoderProvider, MockDisplay, MockLink, MockRenderProvider, ProbeLog, BT2020_FULL_UNIT, CORRUPT_UNIT,
        DEVICE_FAULT_UNIT,
    };

    const WAIT: Duration = Duration::from_secs(5);

    fn context(link: &Arc<MockLink>) -> PipelineContext {
        let config = PipelineConfig { hardware_decode: true, ..Default::default() };
        PipelineContext {
            queue: Arc::new(AccessUnitQueue::new()),
            link: link.clone(),
            recovery: Arc::new(Mutex::new(RecoveryController::new(&config))),
            notifier: Arc::new(Notifier::new().unwrap()),
            stats: Arc::new(StatsCounters::default()),
            color: Arc::new(Mutex::new((Colorspace::Bt709, ColorRange::Limited))),
            backlog_warn_threshold: 13,
        }
    }

    fn engine(log: &ProbeLog, kind: DecoderKind) -> DecodeEngine {
        let providers: Vec<Box<dyn DecoderProvider>> = vec![Box::new(MockDecoderProvider::new(kind, true, false, log))];
        let params = StreamParams { width: 64, height: 32, ..Default::default() };
        let options = EngineOptions { hardware: kind.is_hardware(), yuv444: false, pool_size: 7, threads: 0 };
        DecodeEngine::init(&providers, &params, &options).unwrap()
    }

    fn pair(log: &ProbeLog, caps: RenderCaps) -> PlatformPair {
        let mut display: Box<dyn DisplayBackend> = Box::new(MockDisplay::new(DisplayKind::Kms, log));
        let render = MockRenderProvider::new(RenderKind::DrmDirect, true, caps, log).create(display.as_mut()).unwrap();
        PlatformPair { display, render, hardware_decode: caps.contains(RenderCaps::HW_SURFACES) }
    }

    fn setup(direct: bool) -> PipelineSetup {
        PipelineSetup { ring_size: 3, width: 64, height: 32, vsync: true, hdr: false, direct, resync: false }
    }

    fn push(ctx: &PipelineContext, first_byte: u8, keyframe: bool, n: u64) {
        ctx.queue.push(AccessUnit::new(vec![first_byte, 0, 0, 1], keyframe, n));
    }

    #[test]
    fn test_threaded_presents_in_decode_order() {
        let log = ProbeLog::default();
        let link = MockLink::new();
        let ctx = context(&link);
        let pipeline =
            Pipeline::start(ctx.clone(), engine(&log, DecoderKind::Software), pair(&log, RenderCaps::empty()), setup(true))
                .unwrap();
        assert_eq!(pipeline.mode(), PipelineMode::Threaded);

        for n in 0..50 {
            push(&ctx, 0x65, n % 10 == 0, n);
        }
        assert!(wait_for(WAIT, || log.presented().len() == 50));
        assert_eq!(log.presented(), (0..50).collect::<Vec<u64>>());

        let stats = ctx.stats.snapshot(ctx.queue.pending());
        assert_eq!(stats.decoded, 50);
        assert_eq!(stats.presented, 50);
        assert_eq!(stats.skipped, 0);
        pipeline.stop().unwrap();
    }

    #[test]
    fn test_direct_mode_when_renderer_allows() {
        let log = ProbeLog::default();
        let link = MockLink::new();
        let ctx = context(&link);
        let pipeline = Pipeline::start(
            ctx.clone(),
            engine(&log, DecoderKind::Software),
            pair(&log, RenderCaps::DIRECT_DRAW),
            setup(true),
        )
        .unwrap();
        assert_eq!(pipeline.mode(), PipelineMode::Direct);
        assert!(pipeline.render.is_none());

        for n in 0..10 {
            push(&ctx, 0x65, n == 0, n);
        }
        assert!(wait_for(WAIT, || log.presented().len() == 10));
        assert_eq!(log.presented(), (0..10).collect::<Vec<u64>>());
        // nothing ever queues up between decode and present
        assert_eq!(pipeline.ring().fill_waits(), 0);
        pipeline.stop().unwrap();
    }

    #[test]
    fn test_setup_order() {
        let log = ProbeLog::default();
        let link = MockLink::new();
        let pipeline =
            Pipeline::start(context(&link), engine(&log, DecoderKind::Software), pair(&log, RenderCaps::empty()), setup(false))
                .unwrap();
        assert_eq!(log.setup_order(), vec!["display.setup", "render.init", "display.setup_post", "colorimetry"]);
        assert_eq!(log.colorimetry(), vec![None]);
        pipeline.stop();
    }

    #[test]
    fn test_slow_renderer_applies_back_pressure() {
        let log = ProbeLog::default();
        log.set_draw_delay(Duration::from_millis(40));
        let link = MockLink::new();
        let ctx = context(&link);
        let pipeline =
            Pipeline::start(ctx.clone(), engine(&log, DecoderKind::Software), pair(&log, RenderCaps::empty()), setup(false))
                .unwrap();

        for n in 0..12 {
            push(&ctx, 0x65, n == 0, n);
        }
        assert!(wait_for(WAIT, || pipeline.ring().fill_waits() > 0));
        assert!(pipeline.ring().ready_count() <= 3);
        // blocked, not dropped
        assert!(wait_for(WAIT, || log.presented().len() == 12));
        assert_eq!(log.presented(), (0..12).collect::<Vec<u64>>());
        pipeline.stop();
    }

    #[test]
    fn test_bitstream_error_resyncs_on_next_keyframe() {
        let log = ProbeLog::default();
        let link = MockLink::new();
        let ctx = context(&link);
        let pipeline =
            Pipeline::start(ctx.clone(), engine(&log, DecoderKind::Software), pair(&log, RenderCaps::empty()), setup(false))
                .unwrap();

        push(&ctx, 0x65, true, 0);
        push(&ctx, 0x41, false, 1);
        push(&ctx, CORRUPT_UNIT, false, 2);
        push(&ctx, 0x41, false, 3);
        push(&ctx, 0x65, true, 4);
        push(&ctx, 0x41, false, 5);

        assert!(wait_for(WAIT, || log.presented().len() == 4));
        assert_eq!(link.keyframe_requests(), 1);
        let stats = ctx.stats.snapshot(0);
        assert_eq!(stats.skipped, 1);
        assert_eq!(stats.decode_errors, 1);
        assert_eq!(ctx.recovery.lock().state(), RecoveryState::Running);
        assert!(pipeline.take_failure().is_none());
        pipeline.stop();
    }

    #[test]
    fn test_hardware_fault_is_reported_to_session() {
        let log = ProbeLog::default();
        let link = MockLink::new();
        let ctx = context(&link);
        let caps = RenderCaps::HW_SURFACES | RenderCaps::MAP_BUFFER;
        let pipeline =
            Pipeline::start(ctx.clone(), engine(&log, DecoderKind::V4l2Vendor), pair(&log, caps), setup(false)).unwrap();

        push(&ctx, 0x65, true, 0);
        assert!(wait_for(WAIT, || log.presented().len() == 1));
        push(&ctx, DEVICE_FAULT_UNIT, false, 1);

        assert!(wait_for(WAIT, || ctx.notifier.clear() > 0));
        let failure = pipeline.take_failure().unwrap();
        match failure.action {
            RecoveryAction::Reinitialize { scope, caps } => {
                assert_eq!(scope, ReinitScope::Full);
                assert!(!caps.hardware_decode);
            }
            other => panic!("unexpected action {:?}", other),
        }
        assert!(failure.error.class() == crate::error::ErrorClass::Hardware);
        pipeline.stop();
    }

    #[test]
    fn test_display_failure_is_display_scoped() {
        let log = ProbeLog::default();
        log.fail_puts(1);
        let link = MockLink::new();
        let ctx = context(&link);
        let pipeline =
            Pipeline::start(ctx.clone(), engine(&log, DecoderKind::Software), pair(&log, RenderCaps::empty()), setup(false))
                .unwrap();

        push(&ctx, 0x65, true, 0);
        assert!(wait_for(WAIT, || ctx.notifier.clear() > 0));
        let failure = pipeline.take_failure().unwrap();
        assert!(matches!(failure.action, RecoveryAction::Reinitialize { scope: ReinitScope::DisplayOnly, .. }));
        pipeline.stop();
    }

    #[test]
    fn test_color_synced_once_per_change() {
        let log = ProbeLog::default();
        let link = MockLink::new();
        let ctx = context(&link);
        let pipeline =
            Pipeline::start(ctx.clone(), engine(&log, DecoderKind::Software), pair(&log, RenderCaps::empty()), setup(false))
                .unwrap();

        for n in 0..5 {
            push(&ctx, 0x65, n == 0, n);
        }
        assert!(wait_for(WAIT, || log.presented().len() == 5));
        assert_eq!(log.color_syncs(), vec![(Colorspace::Bt709, ColorRange::Limited)]);

        pipeline.set_color(Colorspace::Bt2020, ColorRange::Full);
        for n in 5..10 {
            push(&ctx, 0x41, false, n);
        }
        assert!(wait_for(WAIT, || log.presented().len() == 10));
        assert_eq!(
            log.color_syncs(),
            vec![(Colorspace::Bt709, ColorRange::Limited), (Colorspace::Bt2020, ColorRange::Full)]
        );
        pipeline.stop();
    }

    #[test]
    fn test_stream_colour_change_resyncs_renderer() {
        let log = ProbeLog::default();
        let link = MockLink::new();
        let ctx = context(&link);
        let pipeline =
            Pipeline::start(ctx.clone(), engine(&log, DecoderKind::Software), pair(&log, RenderCaps::empty()), setup(false))
                .unwrap();

        push(&ctx, 0x65, true, 0);
        push(&ctx, BT2020_FULL_UNIT, false, 1);
        push(&ctx, 0x41, false, 2);
        assert!(wait_for(WAIT, || log.presented().len() == 3));
        assert_eq!(
            log.color_syncs(),
            vec![(Colorspace::Bt709, ColorRange::Limited), (Colorspace::Bt2020, ColorRange::Full)]
        );
        assert_eq!(*ctx.color.lock(), (Colorspace::Bt2020, ColorRange::Full));
        pipeline.stop();
    }

    #[test]
    fn test_window_ops_reach_display() {
        let log = ProbeLog::default();
        let link = MockLink::new();
        let pipeline =
            Pipeline::start(context(&link), engine(&log, DecoderKind::Software), pair(&log, RenderCaps::empty()), setup(false))
                .unwrap();
        pipeline.queue_window_op(WindowOp::Grab);
        assert!(wait_for(WAIT, || log.window_ops() == vec![WindowOp::Grab]));
        pipeline.stop();
    }

    #[test]
    fn test_hdr_metadata_committed_at_setup() {
        let log = ProbeLog::default();
        let link = MockLink::new();
        let metadata = HdrMetadata { max_display_luminance: 1000, ..Default::default() };
        link.set_hdr(Some(metadata));
        let mut s = setup(false);
        s.hdr = true;
        let pipeline =
            Pipeline::start(context(&link), engine(&log, DecoderKind::Software), pair(&log, RenderCaps::empty()), s).unwrap();
        assert_eq!(log.colorimetry(), vec![Some(metadata)]);
        pipeline.stop();
    }

    #[test]
    fn test_stop_while_decoder_blocked_releases_everything() {
        let log = ProbeLog::default();
        log.set_draw_delay(Duration::from_millis(50));
        let link = MockLink::new();
        let ctx = context(&link);
        let caps = RenderCaps::HW_SURFACES;
        let provider = MockDecoderProvider::new(DecoderKind::V4l2Vendor, true, false, &log);
        let surfaces = provider.surfaces().unwrap();
        let providers: Vec<Box<dyn DecoderProvider>> = vec![Box::new(provider)];
        let params = StreamParams { width: 64, height: 32, ..Default::default() };
        let options = EngineOptions { hardware: true, yuv444: false, pool_size: 7, threads: 0 };
        let engine = DecodeEngine::init(&providers, &params, &options).unwrap();

        let pipeline = Pipeline::start(ctx.clone(), engine, pair(&log, caps), setup(false)).unwrap();
        for n in 0..30 {
            push(&ctx, 0x65, n == 0, n);
        }
        assert!(wait_for(WAIT, || pipeline.ring().fill_waits() > 0));

        let started = Instant::now();
        let engine = pipeline.stop().unwrap();
        assert!(started.elapsed() < Duration::from_secs(1));
        assert_eq!(log.live_renders(), 0);
        assert_eq!(log.live_displays(), 0);
        assert_eq!(surfaces.outstanding(), 0);
        drop(engine);
        assert_eq!(log.live_decoders(), 0);
    }
}
