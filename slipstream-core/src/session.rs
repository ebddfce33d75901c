//! # Streaming Session
//!
//! Owns everything that survives a pipeline rebuild: the access-unit
//! queue, the link back to the network layer, the recovery controller,
//! the input signal channel and the statistics. The host event loop
//! registers the session's descriptors and calls [`Session::service`]
//! whenever one of them becomes readable.
//!
//! ```text
//!   Running ──failure──► Draining ──stop threads──► Reinitializing
//!      ▲                                               │       │
//!      └──────────────── chain rebuilt ────────────────┘       ▼
//!                                                            Fatal
//! ```

use std::os::fd::{AsFd, AsRawFd};
use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;

use crate::config::PipelineConfig;
use crate::decoder::{DecodeEngine, DecoderProvider, EngineOptions, EXTRA_DECODER_SURFACES};
use crate::error::{PipelineError, Result};
use crate::network::{AccessUnit, AccessUnitQueue, SessionLink, StreamParams};
use crate::picture::{ColorRange, Colorspace};
use crate::pipeline::{ChainInfo, Failure, Pipeline, PipelineContext, PipelineSetup, PipelineStats, StatsCounters};
use crate::platform::PlatformRegistry;
use crate::recovery::{Capabilities, RecoveryAction, RecoveryController, RecoveryState, ReinitScope};
use crate::signal::{EventRegistrar, EventToken, InputSignal, Notifier, SignalReceiver};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionStatus {
    Running,
    /// Quit was requested; call [`Session::shutdown`]
    Quit,
}

pub struct Session {
    config: PipelineConfig,
    params: StreamParams,
    registry: PlatformRegistry,
    decoders: Vec<Box<dyn DecoderProvider>>,
    ctx: PipelineContext,
    signals: Option<SignalReceiver>,
    pipeline: Option<Pipeline>,
    reinits: u32,
}

impl Session {
    /// Select backends, open a decoder and start the pipeline threads
    pub fn start(
        config: PipelineConfig,
        params: StreamParams,
        registry: PlatformRegistry,
        decoders: Vec<Box<dyn DecoderProvider>>,
        link: Arc<dyn SessionLink>,
        signals: Option<SignalReceiver>,
    ) -> Result<Self> {
        config.validate()?;
        params.validate()?;

        let ctx = PipelineContext {
            queue: Arc::new(AccessUnitQueue::new()),
            link,
            recovery: Arc::new(Mutex::new(RecoveryController::new(&config))),
            notifier: Arc::new(Notifier::new()?),
            stats: Arc::new(StatsCounters::default()),
            color: Arc::new(Mutex::new((params.colorspace, params.range()))),
            backlog_warn_threshold: config.backlog_warn_threshold,
        };
        let mut session = Self { config, params, registry, decoders, ctx, signals, pipeline: None, reinits: 0 };

        let mut caps = session.ctx.recovery.lock().caps();
        loop {
            match session.build(caps, None, false) {
                Ok(actual) => {
                    session.ctx.recovery.lock().reinit_succeeded(actual);
                    break;
                }
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => match session.ctx.recovery.lock().reinit_failed(&e) {
                    RecoveryAction::Reinitialize { caps: lower, .. } => caps = lower,
                    _ => return Err(e),
                },
            }
        }

        tracing::info!(
            codec = session.params.codec.name(),
            width = session.params.width,
            height = session.params.height,
            fps = session.params.fps,
            "session started"
        );
        Ok(session)
    }

    /// Build a chain for `caps`. `engine` is kept when the new pair can
    /// still show what it produces.
    fn build(&mut self, caps: Capabilities, engine: Option<DecodeEngine>, reinit: bool) -> Result<Capabilities> {
        let pair = self.registry.select(&self.config, caps.hardware_decode)?;

        let (mut engine, fresh) = match engine {
            Some(engine) if !engine.is_hardware() || pair.hardware_decode => (engine, false),
            previous => {
                drop(previous);
                let options = EngineOptions {
                    hardware: pair.hardware_decode,
                    yuv444: caps.yuv444,
                    pool_size: self.config.ring_size + EXTRA_DECODER_SURFACES,
                    threads: self.config.decoder_threads,
                };
                match DecodeEngine::init(&self.decoders, &self.params, &options) {
                    Ok(engine) => (engine, true),
                    Err(e) => {
                        pair.teardown();
                        return Err(e);
                    }
                }
            }
        };

        let (colorspace, range) = *self.ctx.color.lock();
        engine.set_color(colorspace, range);

        let actual = Capabilities {
            hardware_decode: engine.is_hardware(),
            yuv444: caps.yuv444 && engine.output_format().is_444(),
            direct: caps.direct,
        };
        let resync = reinit && fresh;
        let setup = PipelineSetup {
            ring_size: self.config.ring_size,
            width: self.params.width,
            height: self.params.height,
            vsync: self.config.vsync,
            hdr: self.params.hdr,
            direct: caps.direct,
            resync,
        };
        self.pipeline = Some(Pipeline::start(self.ctx.clone(), engine, pair, setup)?);
        if resync {
            tracing::info!("new decoder context, requesting keyframe");
            self.ctx.link.request_keyframe();
        }
        Ok(actual)
    }

    // ========================================================================
    // Network Side
    // ========================================================================

    /// Queue handle for the network thread
    pub fn queue(&self) -> Arc<AccessUnitQueue> {
        self.ctx.queue.clone()
    }

    /// Returns false once the session is shutting down
    pub fn submit(&self, unit: AccessUnit) -> bool {
        self.ctx.queue.push(unit)
    }

    /// Access units received but not yet handed to the decoder
    pub fn pending_frames(&self) -> usize {
        self.ctx.queue.pending()
    }

    // ========================================================================
    // Event Loop Side
    // ========================================================================

    /// Hand the session's descriptors to the host event loop
    pub fn register(&self, registrar: &mut dyn EventRegistrar) -> Result<()> {
        if let Some(signals) = &self.signals {
            registrar.register(signals.as_fd().as_raw_fd(), EventToken::Signals)?;
        }
        registrar.register(self.ctx.notifier.as_fd().as_raw_fd(), EventToken::Failure)
    }

    /// Consume pending signals and run recovery for a reported failure.
    /// Errors are fatal to the session.
    pub fn service(&mut self) -> Result<SessionStatus> {
        self.ctx.notifier.clear();

        let signals = match &self.signals {
            Some(rx) => rx.drain()?,
            None => Vec::new(),
        };
        for signal in signals {
            if self.handle_signal(signal) == SessionStatus::Quit {
                return Ok(SessionStatus::Quit);
            }
        }

        let failure = self.pipeline.as_ref().and_then(|p| p.take_failure());
        if let Some(failure) = failure {
            self.recover(failure)?;
        }
        Ok(SessionStatus::Running)
    }

    pub fn handle_signal(&mut self, signal: InputSignal) -> SessionStatus {
        match signal.window_op() {
            Some(op) => {
                tracing::debug!(?op, "input signal");
                if let Some(pipeline) = &self.pipeline {
                    pipeline.queue_window_op(op);
                }
                SessionStatus::Running
            }
            None => {
                tracing::info!("quit requested");
                SessionStatus::Quit
            }
        }
    }

    /// Colour description changed in the stream (e.g. a new VUI). Kept
    /// across chain rebuilds.
    pub fn set_color(&self, colorspace: Colorspace, range: ColorRange) {
        *self.ctx.color.lock() = (colorspace, range);
        if let Some(pipeline) = &self.pipeline {
            pipeline.set_color(colorspace, range);
        }
    }

    // ========================================================================
    // Recovery
    // ========================================================================

    fn recover(&mut self, failure: Failure) -> Result<()> {
        let Failure { mut error, mut action } = failure;
        tracing::warn!(class = ?error.class(), "pipeline failure: {}", error);

        loop {
            match action {
                RecoveryAction::Resync => {
                    tracing::info!("requesting keyframe");
                    self.ctx.link.request_keyframe();
                    return Ok(());
                }
                RecoveryAction::Fatal(reason) => {
                    self.stop_pipeline();
                    tracing::error!("session failed: {}", reason);
                    return Err(if error.is_fatal() { error } else { PipelineError::BackendUnavailable(reason) });
                }
                RecoveryAction::Reinitialize { scope, caps } => {
                    let started = Instant::now();
                    let engine = self.stop_pipeline();
                    self.ctx.recovery.lock().begin_reinit();
                    self.reinits += 1;

                    let keep = match scope {
                        ReinitScope::DisplayOnly => engine,
                        ReinitScope::Full => {
                            drop(engine);
                            None
                        }
                    };
                    tracing::info!(
                        ?scope,
                        hardware_decode = caps.hardware_decode,
                        yuv444 = caps.yuv444,
                        direct = caps.direct,
                        "reinitialising"
                    );

                    match self.build(caps, keep, true) {
                        Ok(actual) => {
                            self.ctx.recovery.lock().reinit_succeeded(actual);
                            tracing::info!(elapsed_ms = started.elapsed().as_millis() as u64, "pipeline recovered");
                            return Ok(());
                        }
                        Err(e) => {
                            action = self.ctx.recovery.lock().reinit_failed(&e);
                            error = e;
                        }
                    }
                }
            }
        }
    }

    fn stop_pipeline(&mut self) -> Option<DecodeEngine> {
        self.pipeline.take().and_then(|p| p.stop())
    }

    // ========================================================================
    // Diagnostics
    // ========================================================================

    pub fn stats(&self) -> PipelineStats {
        self.ctx.stats.snapshot(self.ctx.queue.pending())
    }

    /// Backends of the running chain
    pub fn chain(&self) -> Option<ChainInfo> {
        self.pipeline.as_ref().map(|p| p.info())
    }

    pub fn recovery_state(&self) -> RecoveryState {
        self.ctx.recovery.lock().state()
    }

    /// Chain rebuilds since the session started
    pub fn reinit_count(&self) -> u32 {
        self.reinits
    }

    /// Close the queue, stop both threads and release every backend
    pub fn shutdown(mut self) -> PipelineStats {
        let started = Instant::now();
        self.ctx.queue.close();
        drop(self.stop_pipeline());
        let stats = self.stats();
        tracing::info!(
            decoded = stats.decoded,
            presented = stats.presented,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "session shut down"
        );
        stats
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if self.pipeline.is_some() {
            self.ctx.queue.close();
            self.stop_pipeline();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use crate::decoder::DecoderKind;
    use crate::platform::{DisplayKind, DisplayProvider, RenderCaps, RenderKind, RenderProvider, WindowOp};
    use crate::signal::{signal_channel, PollSet};
    use crate::testing::{
        wait_for, MockDecoderProvider, MockDisplayProvider, MockLink, MockRenderProvider, ProbeLog, BT2020_FULL_UNIT,
        CORRUPT_UNIT, DEVICE_FAULT_UNIT,
    };

    const WAIT: Duration = Duration::from_secs(5);

    fn params() -> StreamParams {
        StreamParams { width: 64, height: 32, ..Default::default() }
    }

    /// Window/Wgpu (software only) or Kms/DrmDirect (hardware surfaces)
    fn registry(log: &ProbeLog, hardware: bool) -> PlatformRegistry {
        let (dk, rk, caps) = if hardware {
            (DisplayKind::Kms, RenderKind::DrmDirect, RenderCaps::HW_SURFACES | RenderCaps::MAP_BUFFER)
        } else {
            (DisplayKind::Window, RenderKind::Wgpu, RenderCaps::empty())
        };
        let displays: Vec<Box<dyn DisplayProvider>> = vec![Box::new(MockDisplayProvider::new(dk, true, log))];
        let renders: Vec<Box<dyn RenderProvider>> = vec![Box::new(MockRenderProvider::new(rk, true, caps, log))];
        PlatformRegistry::new(displays, renders)
    }

    fn decoders(log: &ProbeLog) -> Vec<Box<dyn DecoderProvider>> {
        vec![
            Box::new(MockDecoderProvider::new(DecoderKind::V4l2Vendor, true, false, log)),
            Box::new(MockDecoderProvider::new(DecoderKind::Software, true, false, log)),
        ]
    }

    fn start(log: &ProbeLog, link: &Arc<MockLink>, config: PipelineConfig, hardware: bool) -> Session {
        Session::start(config, params(), registry(log, hardware), decoders(log), link.clone(), None).unwrap()
    }

    fn unit(first: u8, keyframe: bool, n: u64) -> AccessUnit {
        AccessUnit::new(vec![first, 0, 0, 1], keyframe, n)
    }

    fn service_until(session: &mut Session, mut cond: impl FnMut(&Session) -> bool) -> bool {
        wait_for(WAIT, || {
            session.service().unwrap();
            cond(session)
        })
    }

    #[test]
    fn test_start_present_shutdown() {
        let log = ProbeLog::default();
        let link = MockLink::new();
        let session = start(&log, &link, PipelineConfig::default(), false);

        let chain = session.chain().unwrap();
        assert_eq!(chain.display, DisplayKind::Window);
        assert_eq!(chain.render, RenderKind::Wgpu);
        // the pair cannot show hardware surfaces
        assert_eq!(chain.decoder, DecoderKind::Software);
        assert_eq!(chain.ring_size, 3);

        for n in 0..10 {
            assert!(session.submit(unit(0x65, n == 0, n)));
        }
        assert!(wait_for(WAIT, || log.presented().len() == 10));

        let queue = session.queue();
        let started = Instant::now();
        let stats = session.shutdown();
        assert!(started.elapsed() < Duration::from_secs(1));
        assert_eq!(stats.presented, 10);
        assert_eq!((log.live_displays(), log.live_renders(), log.live_decoders()), (0, 0, 0));
        assert!(!queue.push(unit(0x65, true, 11)));
    }

    #[test]
    fn test_decode_failure_then_keyframe_keeps_chain() {
        let log = ProbeLog::default();
        let link = MockLink::new();
        let mut session = start(&log, &link, PipelineConfig::default(), false);
        let before = session.chain().unwrap();

        session.submit(unit(0x65, true, 0));
        session.submit(unit(CORRUPT_UNIT, false, 1));
        session.submit(unit(0x41, false, 2));
        session.submit(unit(0x65, true, 3));
        session.submit(unit(0x41, false, 4));

        assert!(service_until(&mut session, |_| log.presented().len() == 3));
        assert_eq!(session.recovery_state(), RecoveryState::Running);
        assert_eq!(session.chain().unwrap(), before);
        assert_eq!(session.reinit_count(), 0);
        assert_eq!(link.keyframe_requests(), 1);
        assert_eq!(session.stats().skipped, 1);
        assert_eq!(log.opened_decoders(), vec![DecoderKind::Software]);
    }

    #[test]
    fn test_hardware_failure_downgrades_to_software() {
        let log = ProbeLog::default();
        let link = MockLink::new();
        let mut session = start(&log, &link, PipelineConfig::default(), true);
        let before = session.chain().unwrap();
        assert_eq!(before.decoder, DecoderKind::V4l2Vendor);

        session.submit(unit(0x65, true, 0));
        session.submit(unit(DEVICE_FAULT_UNIT, false, 1));
        assert!(service_until(&mut session, |s| s.chain().is_some_and(|c| c.decoder == DecoderKind::Software)));

        let after = session.chain().unwrap();
        assert_eq!((after.display, after.render, after.ring_size), (before.display, before.render, before.ring_size));
        assert_eq!(session.recovery_state(), RecoveryState::Running);
        // the new decoder context asked for a keyframe before the chain came back
        assert_eq!(link.keyframe_requests(), 1);

        let presented = log.presented().len();
        session.submit(unit(0x41, false, 2));
        session.submit(unit(0x65, true, 3));
        assert!(wait_for(WAIT, || log.presented().len() == presented + 1));
        assert_eq!(log.live_decoders(), 1);
    }

    #[test]
    fn test_colour_survives_full_reinit() {
        let log = ProbeLog::default();
        let link = MockLink::new();
        let mut session = start(&log, &link, PipelineConfig::default(), true);

        session.set_color(Colorspace::Bt2020, ColorRange::Full);
        session.submit(unit(0x65, true, 0));
        assert!(wait_for(WAIT, || log.presented().len() == 1));

        session.submit(unit(DEVICE_FAULT_UNIT, false, 1));
        assert!(service_until(&mut session, |s| s.reinit_count() == 1));
        session.submit(unit(0x65, true, 2));
        assert!(wait_for(WAIT, || log.presented().len() == 2));
        assert_eq!(log.color_syncs().last(), Some(&(Colorspace::Bt2020, ColorRange::Full)));
        assert!(log.color_syncs().iter().all(|c| *c == (Colorspace::Bt2020, ColorRange::Full)));
    }

    #[test]
    fn test_stream_colour_survives_display_reinit() {
        let log = ProbeLog::default();
        let link = MockLink::new();
        let mut session = start(&log, &link, PipelineConfig::default(), false);

        session.submit(unit(BT2020_FULL_UNIT, true, 0));
        assert!(wait_for(WAIT, || log.presented().len() == 1));
        log.fail_puts(1);
        session.submit(unit(0x41, false, 1));
        assert!(service_until(&mut session, |s| s.reinit_count() == 1));

        session.submit(unit(0x41, false, 2));
        assert!(wait_for(WAIT, || log.presented().contains(&2)));
        assert_eq!(log.color_syncs().last(), Some(&(Colorspace::Bt2020, ColorRange::Full)));
    }

    #[test]
    fn test_display_failure_keeps_decoder() {
        let log = ProbeLog::default();
        log.fail_puts(1);
        let link = MockLink::new();
        let mut session = start(&log, &link, PipelineConfig::default(), false);

        session.submit(unit(0x65, true, 0));
        assert!(service_until(&mut session, |s| s.reinit_count() == 1));
        assert_eq!(session.recovery_state(), RecoveryState::Running);
        assert_eq!(log.opened_decoders(), vec![DecoderKind::Software]);
        assert_eq!(log.live_displays(), 1);
        assert_eq!(log.live_renders(), 1);

        session.submit(unit(0x41, false, 1));
        assert!(wait_for(WAIT, || log.presented().contains(&1)));
    }

    #[test]
    fn test_exhausted_budget_is_fatal() {
        let log = ProbeLog::default();
        let link = MockLink::new();
        let config = PipelineConfig { max_reinit_attempts: 0, ..Default::default() };
        let mut session = start(&log, &link, config, true);

        session.submit(unit(DEVICE_FAULT_UNIT, true, 0));
        let result = wait_for(WAIT, || session.service().is_err());
        assert!(result);
        assert_eq!(session.recovery_state(), RecoveryState::Fatal);
        assert!(session.chain().is_none());
        assert_eq!(log.live_decoders(), 0);
    }

    #[test]
    fn test_no_decoder_fails_start() {
        let log = ProbeLog::default();
        let link = MockLink::new();
        let decoders: Vec<Box<dyn DecoderProvider>> =
            vec![Box::new(MockDecoderProvider::new(DecoderKind::Software, false, false, &log))];
        let result =
            Session::start(PipelineConfig::default(), params(), registry(&log, false), decoders, link.clone(), None);
        assert!(result.err().unwrap().is_fatal());
        assert_eq!((log.live_displays(), log.live_renders()), (0, 0));
    }

    #[test]
    fn test_signals_and_registration() {
        let log = ProbeLog::default();
        let link = MockLink::new();
        let (tx, rx) = signal_channel().unwrap();
        let mut session =
            Session::start(PipelineConfig::default(), params(), registry(&log, false), decoders(&log), link.clone(), Some(rx))
                .unwrap();

        let mut poll = PollSet::new();
        session.register(&mut poll).unwrap();
        assert_eq!(poll.len(), 2);

        tx.send(InputSignal::Grab).unwrap();
        assert_eq!(poll.wait(Some(WAIT)).unwrap(), vec![EventToken::Signals]);
        assert_eq!(session.service().unwrap(), SessionStatus::Running);
        assert!(wait_for(WAIT, || log.window_ops() == vec![WindowOp::Grab]));

        tx.send(InputSignal::Quit).unwrap();
        assert_eq!(session.service().unwrap(), SessionStatus::Quit);
        session.shutdown();
    }

    #[test]
    fn test_failure_wakes_event_loop() {
        let log = ProbeLog::default();
        log.fail_puts(1);
        let link = MockLink::new();
        let mut session = start(&log, &link, PipelineConfig::default(), false);
        let mut poll = PollSet::new();
        session.register(&mut poll).unwrap();
        assert_eq!(poll.len(), 1);

        session.submit(unit(0x65, true, 0));
        assert_eq!(poll.wait(Some(WAIT)).unwrap(), vec![EventToken::Failure]);
        assert_eq!(session.service().unwrap(), SessionStatus::Running);
        assert_eq!(session.reinit_count(), 1);
    }
}
