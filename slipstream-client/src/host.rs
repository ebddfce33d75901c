// HOST - Event loop collaborators around a Session
//
//   windowed:  winit event loop ── keys ──► SignalSender ──► Session::service (every tick)
//   headless:  poll(2) on the session's fds ──► Session::service
//
// Both hosts feed the session from a Replay and stop when the replay has
// run dry and the queue is empty, on quit, or on a fatal session error.

use std::os::fd::{AsFd, AsRawFd};
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use winit::application::ApplicationHandler;
use winit::dpi::PhysicalSize;
use winit::event::{ElementState, KeyEvent, WindowEvent};
use winit::event_loop::{ActiveEventLoop, ControlFlow, EventLoop};
use winit::keyboard::{KeyCode, ModifiersState, PhysicalKey};
use winit::window::{Window, WindowId};

use slipstream_core::config::PipelineConfig;
use slipstream_core::decoder::builtin_providers;
use slipstream_core::network::StreamParams;
use slipstream_core::pipeline::PipelineStats;
use slipstream_core::platform::PlatformRegistry;
use slipstream_core::signal::{signal_channel, InputSignal, PollSet, SignalSender};
use slipstream_core::{Session, SessionStatus};

use crate::replay::{Replay, ReplayLink, ReplayStats, ReplayUnit};

/// Upper bound between two `Session::service` calls
const SERVICE_INTERVAL: Duration = Duration::from_millis(20);
const REPORT_INTERVAL: Duration = Duration::from_secs(5);
/// Time left for the ring to drain after the last access unit was decoded
const DRAIN_GRACE: Duration = Duration::from_millis(500);

#[derive(Debug, Clone, Copy)]
pub struct HostOptions {
    pub looping: bool,
    pub stats_json: bool,
}

// ============================================================================
// Progress
// ============================================================================

struct Monitor {
    last_report: Instant,
    drained_since: Option<Instant>,
}

impl Monitor {
    fn new() -> Self {
        Self { last_report: Instant::now(), drained_since: None }
    }

    /// Replay finished, queue empty and the grace period elapsed
    fn end_of_stream(&mut self, replay: &Replay, session: &Session) -> bool {
        if !replay.finished() || session.pending_frames() > 0 {
            self.drained_since = None;
            return false;
        }
        let since = *self.drained_since.get_or_insert_with(Instant::now);
        since.elapsed() >= DRAIN_GRACE
    }

    fn report(&mut self, session: &Session) {
        if self.last_report.elapsed() < REPORT_INTERVAL {
            return;
        }
        self.last_report = Instant::now();
        let stats = session.stats();
        tracing::info!(
            decoded = stats.decoded,
            presented = stats.presented,
            pending = stats.pending_units,
            decode_ms = %format!("{:.2}", stats.avg_decode_latency_ms),
            present_ms = %format!("{:.2}", stats.avg_present_latency_ms),
            "progress"
        );
    }
}

fn final_report(stats: &PipelineStats, replay: &ReplayStats, link: &ReplayLink, json: bool) -> Result<()> {
    tracing::info!(
        sent = replay.sent,
        decoded = stats.decoded,
        presented = stats.presented,
        skipped = stats.skipped,
        decode_errors = stats.decode_errors,
        keyframe_requests = link.keyframe_requests(),
        "playback complete"
    );
    if json {
        let report = serde_json::json!({ "pipeline": stats, "replay": replay });
        println!("{}", serde_json::to_string_pretty(&report)?);
    }
    Ok(())
}

// ============================================================================
// Headless
// ============================================================================

/// Write end of the signal pipe for the SIGINT/SIGTERM handler
static QUIT_FD: AtomicI32 = AtomicI32::new(-1);

extern "C" fn on_terminate(_: libc::c_int) {
    let fd = QUIT_FD.load(Ordering::Relaxed);
    if fd >= 0 {
        let byte = InputSignal::Quit as u8;
        // write(2) is async-signal-safe
        unsafe { libc::write(fd, (&byte as *const u8).cast(), 1) };
    }
}

/// Route SIGINT/SIGTERM into the signal channel so teardown runs normally
fn install_quit_handler(sender: &SignalSender) {
    QUIT_FD.store(sender.as_fd().as_raw_fd(), Ordering::Relaxed);
    let handler = on_terminate as extern "C" fn(libc::c_int) as libc::sighandler_t;
    unsafe {
        libc::signal(libc::SIGINT, handler);
        libc::signal(libc::SIGTERM, handler);
    }
}

fn remove_quit_handler() {
    unsafe {
        libc::signal(libc::SIGINT, libc::SIG_DFL);
        libc::signal(libc::SIGTERM, libc::SIG_DFL);
    }
    QUIT_FD.store(-1, Ordering::Relaxed);
}

pub fn run_headless(
    config: PipelineConfig,
    params: StreamParams,
    units: Vec<ReplayUnit>,
    link: Arc<ReplayLink>,
    options: HostOptions,
) -> Result<()> {
    let (sender, receiver) = signal_channel()?;
    install_quit_handler(&sender);

    let registry = PlatformRegistry::builtin(None, &config);
    let fps = params.fps;
    let mut session = Session::start(config, params, registry, builtin_providers(), link.clone(), Some(receiver))
        .context("starting headless session")?;

    let mut poll = PollSet::new();
    session.register(&mut poll)?;
    let replay = Replay::spawn(units, fps, options.looping, session.queue(), link.clone())?;
    let mut monitor = Monitor::new();

    let result: Result<()> = loop {
        if let Err(e) = poll.wait(Some(SERVICE_INTERVAL)) {
            break Err(e.into());
        }
        match session.service() {
            Ok(SessionStatus::Quit) => break Ok(()),
            Ok(SessionStatus::Running) => {}
            Err(e) => break Err(anyhow::Error::new(e).context("session failed")),
        }
        if monitor.end_of_stream(&replay, &session) {
            tracing::info!("end of stream");
            break Ok(());
        }
        monitor.report(&session);
    };

    // the fds registered above die with the session
    remove_quit_handler();
    let stats = session.shutdown();
    let replay_stats = replay.stop();
    drop(sender);
    final_report(&stats, &replay_stats, &link, options.stats_json)?;
    result
}

// ============================================================================
// Windowed
// ============================================================================

struct WindowedHost {
    config: PipelineConfig,
    params: StreamParams,
    units: Option<Vec<ReplayUnit>>,
    link: Arc<ReplayLink>,
    options: HostOptions,
    window: Option<Arc<Window>>,
    session: Option<Session>,
    replay: Option<Replay>,
    signals: Option<SignalSender>,
    modifiers: ModifiersState,
    grabbed: bool,
    monitor: Monitor,
    error: Option<anyhow::Error>,
    finished: bool,
}

impl WindowedHost {
    fn start(&mut self, event_loop: &ActiveEventLoop) -> Result<()> {
        let attributes = Window::default_attributes()
            .with_title(format!("Slipstream {}x{}", self.params.width, self.params.height))
            .with_inner_size(PhysicalSize::new(self.params.width, self.params.height));
        let window = Arc::new(event_loop.create_window(attributes).context("creating window")?);

        let (sender, receiver) = signal_channel()?;
        let registry = PlatformRegistry::builtin(Some(window.clone()), &self.config);
        let session = Session::start(
            self.config.clone(),
            self.params.clone(),
            registry,
            builtin_providers(),
            self.link.clone(),
            Some(receiver),
        )
        .context("starting session")?;

        let units = self.units.take().unwrap_or_default();
        let replay = Replay::spawn(units, self.params.fps, self.options.looping, session.queue(), self.link.clone())?;

        self.window = Some(window);
        self.session = Some(session);
        self.replay = Some(replay);
        self.signals = Some(sender);
        Ok(())
    }

    /// Ctrl+Alt+Shift+Q quits, Ctrl+Alt+Shift+Z toggles the input grab
    fn on_key(&mut self, event: &KeyEvent) {
        if event.state != ElementState::Pressed || event.repeat {
            return;
        }
        let combo = ModifiersState::CONTROL | ModifiersState::ALT | ModifiersState::SHIFT;
        if !self.modifiers.contains(combo) {
            return;
        }
        let signal = match event.physical_key {
            PhysicalKey::Code(KeyCode::KeyQ) => InputSignal::Quit,
            PhysicalKey::Code(KeyCode::KeyZ) => {
                self.grabbed = !self.grabbed;
                if self.grabbed { InputSignal::Grab } else { InputSignal::Ungrab }
            }
            _ => return,
        };
        if let Some(sender) = &self.signals {
            if let Err(e) = sender.send(signal) {
                tracing::warn!(?signal, "input signal lost: {}", e);
            }
        }
    }

    fn fail(&mut self, event_loop: &ActiveEventLoop, error: anyhow::Error) {
        tracing::error!("{:#}", error);
        self.error.get_or_insert(error);
        event_loop.exit();
    }

    fn finish(&mut self) {
        if self.finished {
            return;
        }
        self.finished = true;
        let stats = self.session.take().map(Session::shutdown).unwrap_or_default();
        let replay_stats = self.replay.take().map(Replay::stop).unwrap_or_default();
        self.signals = None;
        if let Err(e) = final_report(&stats, &replay_stats, &self.link, self.options.stats_json) {
            self.error.get_or_insert(e);
        }
    }
}

impl ApplicationHandler for WindowedHost {
    fn resumed(&mut self, event_loop: &ActiveEventLoop) {
        if self.window.is_some() || self.finished {
            return;
        }
        if let Err(e) = self.start(event_loop) {
            self.fail(event_loop, e);
            return;
        }
        event_loop.set_control_flow(ControlFlow::WaitUntil(Instant::now() + SERVICE_INTERVAL));
    }

    fn window_event(&mut self, event_loop: &ActiveEventLoop, _id: WindowId, event: WindowEvent) {
        match event {
            WindowEvent::CloseRequested => event_loop.exit(),
            WindowEvent::ModifiersChanged(modifiers) => self.modifiers = modifiers.state(),
            WindowEvent::KeyboardInput { event, .. } => self.on_key(&event),
            // the compositor scales to the surface; the stream size is fixed
            WindowEvent::Resized(size) => tracing::debug!(width = size.width, height = size.height, "window resized"),
            _ => {}
        }
    }

    fn about_to_wait(&mut self, event_loop: &ActiveEventLoop) {
        let Some(session) = self.session.as_mut() else {
            return;
        };
        match session.service() {
            Ok(SessionStatus::Quit) => {
                event_loop.exit();
                return;
            }
            Ok(SessionStatus::Running) => {}
            Err(e) => {
                self.fail(event_loop, anyhow::Error::new(e).context("session failed"));
                return;
            }
        }

        if let (Some(replay), Some(session)) = (&self.replay, &self.session) {
            if self.monitor.end_of_stream(replay, session) {
                tracing::info!("end of stream");
                event_loop.exit();
                return;
            }
            self.monitor.report(session);
        }
        event_loop.set_control_flow(ControlFlow::WaitUntil(Instant::now() + SERVICE_INTERVAL));
    }

    fn exiting(&mut self, _event_loop: &ActiveEventLoop) {
        self.finish();
    }
}

pub fn run_windowed(
    config: PipelineConfig,
    params: StreamParams,
    units: Vec<ReplayUnit>,
    link: Arc<ReplayLink>,
    options: HostOptions,
) -> Result<()> {
    let event_loop = EventLoop::new().context("creating event loop")?;
    let mut host = WindowedHost {
        config,
        params,
        units: Some(units),
        link,
        options,
        window: None,
        session: None,
        replay: None,
        signals: None,
        modifiers: ModifiersState::empty(),
        grabbed: false,
        monitor: Monitor::new(),
        error: None,
        finished: false,
    };
    event_loop.run_app(&mut host)?;
    host.finish();
    match host.error.take() {
        Some(e) => Err(e),
        None => Ok(()),
    }
}
