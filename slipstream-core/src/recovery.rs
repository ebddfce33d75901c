//! # Reconfiguration & Recovery
//!
//! ```text
//!   Running ──failure──► Draining ──threads joined──► Reinitializing
//!      ▲                                                   │
//!      └──────────────────── ok ───────────────────────────┤
//!                                                          └── fail ──► Fatal
//! ```
//!
//! Isolated bitstream errors stay in `Running`: the decode thread asks for
//! a keyframe and skips ahead to it. Hardware errors, and bitstream errors
//! that keep coming back, tear the chain down and rebuild it with the next
//! rung of the capability ladder removed:
//!
//! 1. hardware decode (decode in software, renderer no longer needs surfaces)
//! 2. 4:4:4 chroma
//! 3. direct mode (decode and present on separate threads)
//!
//! Display-side failures rebuild only the display and renderer; the first
//! one keeps the capability set since surface loss is usually external.

use crate::config::PipelineConfig;
use crate::error::{ErrorClass, PipelineError};

/// Frames presented without a failure before the reinit budget refills
pub const STABLE_FRAMES: u64 = 300;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryState {
    Running,
    Draining,
    Reinitializing,
    Fatal,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReinitScope {
    /// Decoder, renderer and display
    Full,
    /// Renderer and display; the decoder keeps its context
    DisplayOnly,
}

/// Features the chain is currently allowed to use
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Capabilities {
    pub hardware_decode: bool,
    pub yuv444: bool,
    pub direct: bool,
}

impl Capabilities {
    pub fn from_config(config: &PipelineConfig) -> Self {
        Self { hardware_decode: config.hardware_decode, yuv444: config.yuv444, direct: config.allow_direct }
    }

    /// Next rung down, `None` once nothing is left to give up
    pub fn degrade(&self) -> Option<Self> {
        if self.hardware_decode {
            Some(Self { hardware_decode: false, ..*self })
        } else if self.yuv444 {
            Some(Self { yuv444: false, ..*self })
        } else if self.direct {
            Some(Self { direct: false, ..*self })
        } else {
            None
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecoveryAction {
    /// Request a keyframe, reset the decoder context and skip to the next IDR
    Resync,
    /// Drain and rebuild the chain
    Reinitialize { scope: ReinitScope, caps: Capabilities },
    /// Terminate the session
    Fatal(String),
}

pub struct RecoveryController {
    state: RecoveryState,
    caps: Capabilities,
    consecutive_failures: u32,
    reinit_attempts: u32,
    display_failures: u32,
    stable_frames: u64,
    persistent_threshold: u32,
    max_reinit: u32,
}

impl RecoveryController {
    pub fn new(config: &PipelineConfig) -> Self {
        Self {
            state: RecoveryState::Running,
            caps: Capabilities::from_config(config),
            consecutive_failures: 0,
            reinit_attempts: 0,
            display_failures: 0,
            stable_frames: 0,
            persistent_threshold: config.persistent_failure_threshold.max(1),
            max_reinit: config.max_reinit_attempts,
        }
    }

    pub fn state(&self) -> RecoveryState {
        self.state
    }

    pub fn caps(&self) -> Capabilities {
        self.caps
    }

    pub fn reinit_attempts(&self) -> u32 {
        self.reinit_attempts
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    /// Decide what to do about a failure observed while running
    pub fn on_failure(&mut self, err: &PipelineError) -> RecoveryAction {
        if self.state == RecoveryState::Fatal {
            return RecoveryAction::Fatal("session already failed".into());
        }
        self.stable_frames = 0;

        match err.class() {
            ErrorClass::BackendUnavailable | ErrorClass::ResourceExhausted => self.fatal(err.to_string()),
            ErrorClass::TransientDecode => {
                self.consecutive_failures += 1;
                if self.consecutive_failures < self.persistent_threshold {
                    tracing::info!(failures = self.consecutive_failures, "decode error, resynchronising: {}", err);
                    return RecoveryAction::Resync;
                }
                tracing::warn!(failures = self.consecutive_failures, "decode failures persist: {}", err);
                self.escalate(ReinitScope::Full, true)
            }
            ErrorClass::Hardware if err.is_display_side() => {
                self.display_failures += 1;
                tracing::warn!(failures = self.display_failures, "display path failed: {}", err);
                let degrade = self.display_failures > 1;
                self.escalate(ReinitScope::DisplayOnly, degrade)
            }
            ErrorClass::Hardware => {
                tracing::warn!("hardware pipeline failed: {}", err);
                self.escalate(ReinitScope::Full, true)
            }
        }
    }

    fn escalate(&mut self, scope: ReinitScope, degrade: bool) -> RecoveryAction {
        self.reinit_attempts += 1;
        if self.reinit_attempts > self.max_reinit {
            return self.fatal(format!("gave up after {} reinitialisations", self.max_reinit));
        }
        if degrade {
            match self.caps.degrade() {
                Some(caps) => self.caps = caps,
                None => tracing::debug!("capability set already minimal"),
            }
        }
        self.transition(RecoveryState::Draining);
        RecoveryAction::Reinitialize { scope, caps: self.caps }
    }

    fn fatal(&mut self, reason: String) -> RecoveryAction {
        tracing::error!("unrecoverable pipeline failure: {}", reason);
        self.transition(RecoveryState::Fatal);
        RecoveryAction::Fatal(reason)
    }

    fn transition(&mut self, next: RecoveryState) {
        if self.state != next {
            tracing::info!(from = ?self.state, to = ?next, "recovery state");
            self.state = next;
        }
    }

    /// Threads are joined and the old chain is torn down
    pub fn begin_reinit(&mut self) {
        self.transition(RecoveryState::Reinitializing);
    }

    /// The rebuilt chain is running with `actual` (which may be lower than
    /// what was asked for when a backend refused)
    pub fn reinit_succeeded(&mut self, actual: Capabilities) {
        self.caps = actual;
        self.consecutive_failures = 0;
        self.transition(RecoveryState::Running);
    }

    /// Rebuilding failed: retry one rung lower or give up
    pub fn reinit_failed(&mut self, err: &PipelineError) -> RecoveryAction {
        if err.class() == ErrorClass::ResourceExhausted {
            return self.fatal(err.to_string());
        }
        tracing::warn!("reinitialisation failed: {}", err);
        self.reinit_attempts += 1;
        if self.reinit_attempts > self.max_reinit {
            return self.fatal(format!("reinitialisation failed: {}", err));
        }
        match self.caps.degrade() {
            Some(caps) => {
                self.caps = caps;
                self.transition(RecoveryState::Draining);
                RecoveryAction::Reinitialize { scope: ReinitScope::Full, caps }
            }
            None => self.fatal(format!("no fallback left: {}", err)),
        }
    }

    /// A picture made it to the screen
    pub fn on_frame_presented(&mut self) {
        self.consecutive_failures = 0;
        self.stable_frames += 1;
        if self.stable_frames == STABLE_FRAMES && (self.reinit_attempts > 0 || self.display_failures > 0) {
            tracing::debug!("pipeline stable, recovery budget restored");
            self.reinit_attempts = 0;
            self.display_failures = 0;
        }
    }

    /// A picture decoded cleanly; the bitstream is back in sync
    pub fn on_decoded(&mut self) {
        self.consecutive_failures = 0;
    }
}
