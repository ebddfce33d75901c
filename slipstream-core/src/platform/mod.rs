//! # Platform Abstraction
//!
//! Two capability-probed roles, selected once per session:
//!
//! ```text
//!   displays (ranked)          renders (ranked, per display)
//!   ┌────────┐                 ┌──────┐ ┌──────┐
//!   │ Window │───────────────► │ Gles │ │ Wgpu │
//!   └────────┘                 └──────┘ └──────┘
//!   ┌────────┐                 ┌───────────┐ ┌──────┐
//!   │  Kms   │───────────────► │ DrmDirect │ │ Blit │
//!   └────────┘                 └───────────┘ └──────┘
//! ```
//!
//! The first pair that constructs and, when hardware decode is wanted, can
//! show hardware surfaces wins. Otherwise the first pair that constructed
//! at all is rebuilt and decode falls back to software.

use std::sync::Arc;

use bitflags::bitflags;
use raw_window_handle::RawDisplayHandle;
use serde::{Deserialize, Serialize};

use crate::color::ColorConfig;
use crate::config::PipelineConfig;
use crate::error::{PipelineError, Result};
use crate::network::HdrMetadata;
use crate::picture::DecodedPicture;
use crate::surface::SurfaceBridge;

pub mod drm;
pub mod egl;
pub mod kms;
pub mod render_blit;
pub mod render_drm;
pub mod render_gles;
#[cfg(feature = "wgpu-render")]
pub mod render_wgpu;
pub mod window;

pub use kms::{KmsDisplay, KmsProvider};
pub use window::{WindowDisplay, WindowProvider};

// ============================================================================
// Kinds and Capabilities
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DisplayKind {
    /// Platform-native window hosted by the client's event loop
    Window,
    /// Headless direct display through DRM/KMS
    Kms,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RenderKind {
    Gles,
    Wgpu,
    DrmDirect,
    Blit,
}

/// GPU interop mechanism a display offers its renderers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Interop {
    Egl,
    Drm,
    None,
}

/// Pixel layout a display scans out most cheaply
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColorFormat {
    Xrgb8888,
    Bgra8,
    Xrgb2101010,
}

impl DisplayKind {
    /// Render backends able to draw on this display, in preference order
    pub fn supported_renders(&self) -> &'static [RenderKind] {
        match self {
            Self::Window => &[RenderKind::Gles, RenderKind::Wgpu],
            Self::Kms => &[RenderKind::DrmDirect, RenderKind::Blit],
        }
    }

    pub fn interop(&self) -> Interop {
        match self {
            Self::Window => Interop::Egl,
            Self::Kms => Interop::Drm,
        }
    }

    pub fn preferred_format(&self) -> ColorFormat {
        match self {
            Self::Window => ColorFormat::Bgra8,
            Self::Kms => ColorFormat::Xrgb8888,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Window => "window",
            Self::Kms => "kms",
        }
    }
}

impl RenderKind {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Gles => "gles",
            Self::Wgpu => "wgpu",
            Self::DrmDirect => "drm-direct",
            Self::Blit => "blit",
        }
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct RenderCaps: u32 {
        /// Draw is cheap enough to run on the decode thread
        const DIRECT_DRAW  = 0x0001;
        /// Can display decoder-owned hardware surfaces
        const HW_SURFACES  = 0x0002;
        /// Implements map_buffer/unmap_buffer
        const MAP_BUFFER   = 0x0004;
        /// Passes 10-bit PQ content through untouched
        const HDR          = 0x0008;
        /// Samples full-resolution chroma
        const YUV444       = 0x0010;
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct SetupFlags: u32 {
        const FULLSCREEN = 0x0001;
        const VSYNC      = 0x0002;
        const HDR        = 0x0004;
    }
}

/// Window operations driven by the input collaborator
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WindowOp {
    Grab,
    Ungrab,
    SetTitle(String),
    ToggleFullscreen,
}

// ============================================================================
// Backend Traits
// ============================================================================

/// Direct scanout access offered by displays that own framebuffers
pub trait Scanout {
    /// DRM device for buffer imports
    fn card(&self) -> &drm::DrmCard;

    /// CPU-mappable framebuffers owned by the display
    fn dumb_buffers(&mut self) -> &mut [drm::DumbBuffer];

    /// Register an imported framebuffer; returns its put_to_screen index
    fn attach_framebuffer(&mut self, fb_id: u32) -> usize;

    /// Forget an imported framebuffer, returning its id for removal
    fn detach_framebuffer(&mut self, index: usize) -> Option<u32>;
}

pub trait DisplayBackend: Send {
    fn kind(&self) -> DisplayKind;

    fn name(&self) -> &'static str {
        self.kind().name()
    }

    /// Native display connection, if the backend has one
    fn display_handle(&self) -> Option<RawDisplayHandle>;

    /// Native window, if the backend has one
    fn window(&self) -> Option<Arc<winit::window::Window>>;

    fn setup(&mut self, width: u32, height: u32, flags: SetupFlags) -> Result<()>;

    /// Called after the renderer attached to the display
    fn setup_post(&mut self) -> Result<()> {
        Ok(())
    }

    /// Show the buffer a renderer drew into
    fn put_to_screen(&mut self, index: usize) -> Result<()>;

    fn resolution(&self) -> (u32, u32);

    fn modify_window(&mut self, op: WindowOp) -> Result<()>;

    /// Commit HDR metadata (or SDR defaults). Returns false when the
    /// display has no colorimetry control.
    fn apply_colorimetry(&mut self, _metadata: Option<&HdrMetadata>) -> Result<bool> {
        Ok(false)
    }

    fn scanout(&mut self) -> Option<&mut dyn Scanout> {
        None
    }

    fn close(&mut self);
}

/// Everything a renderer needs once the decoder is known
#[derive(Clone)]
pub struct RenderInit {
    pub width: u32,
    pub height: u32,
    pub vsync: bool,
    pub bridge: SurfaceBridge,
}

pub trait RenderBackend: Send {
    fn kind(&self) -> RenderKind;

    fn name(&self) -> &'static str {
        self.kind().name()
    }

    fn caps(&self) -> RenderCaps;

    /// Runs on the thread that will call `draw`
    fn init(&mut self, display: &mut dyn DisplayBackend, info: &RenderInit) -> Result<()>;

    /// Colour configuration for subsequent draws
    fn sync_config(&mut self, config: &ColorConfig) -> Result<()>;

    /// Draw `picture` and return the display buffer index to show.
    /// The renderer may take the picture's hardware surface and hold it
    /// until the next draw replaces it on screen.
    fn draw(&mut self, picture: &mut DecodedPicture, display: &mut dyn DisplayBackend) -> Result<usize>;

    /// Import a hardware picture as a display buffer without a GPU pass
    fn map_buffer(&mut self, _picture: &mut DecodedPicture, _display: &mut dyn DisplayBackend) -> Result<usize> {
        Err(PipelineError::render(self.name(), "map_buffer unsupported"))
    }

    fn unmap_buffer(&mut self, _index: usize, _display: &mut dyn DisplayBackend) {}

    /// Release held surfaces and GPU objects
    fn destroy(&mut self, display: &mut dyn DisplayBackend);
}

// ============================================================================
// Providers and Selection
// ============================================================================

pub trait DisplayProvider: Send + Sync {
    fn kind(&self) -> DisplayKind;
    fn open(&self) -> Result<Box<dyn DisplayBackend>>;
}

pub trait RenderProvider: Send + Sync {
    fn kind(&self) -> RenderKind;
    fn create(&self, display: &mut dyn DisplayBackend) -> Result<Box<dyn RenderBackend>>;
}

/// Built-in renderers
impl RenderProvider for RenderKind {
    fn kind(&self) -> RenderKind {
        *self
    }

    fn create(&self, display: &mut dyn DisplayBackend) -> Result<Box<dyn RenderBackend>> {
        match self {
            Self::Gles => Ok(Box::new(render_gles::GlesRenderer::create(display)?)),
            #[cfg(feature = "wgpu-render")]
            Self::Wgpu => Ok(Box::new(render_wgpu::WgpuRenderer::create(display)?)),
            #[cfg(not(feature = "wgpu-render"))]
            Self::Wgpu => Err(PipelineError::BackendUnavailable("built without wgpu-render".into())),
            Self::DrmDirect => Ok(Box::new(render_drm::DrmDirectRenderer::create(display)?)),
            Self::Blit => Ok(Box::new(render_blit::BlitRenderer::create(display)?)),
        }
    }
}

/// Selected display/render pair
pub struct PlatformPair {
    pub display: Box<dyn DisplayBackend>,
    pub render: Box<dyn RenderBackend>,
    /// The pair can show hardware surfaces and hardware decode was wanted
    pub hardware_decode: bool,
}

impl PlatformPair {
    pub fn teardown(mut self) {
        self.render.destroy(self.display.as_mut());
        self.display.close();
    }
}

/// Ranked backend lists
pub struct PlatformRegistry {
    displays: Vec<Box<dyn DisplayProvider>>,
    renders: Vec<Box<dyn RenderProvider>>,
}

impl PlatformRegistry {
    pub fn new(displays: Vec<Box<dyn DisplayProvider>>, renders: Vec<Box<dyn RenderProvider>>) -> Self {
        Self { displays, renders }
    }

    /// Window (when the host has one) then KMS, with every built-in renderer
    pub fn builtin(window: Option<Arc<winit::window::Window>>, config: &PipelineConfig) -> Self {
        let mut displays: Vec<Box<dyn DisplayProvider>> = Vec::new();
        if let Some(window) = window {
            displays.push(Box::new(WindowProvider::new(window)));
        }
        displays.push(Box::new(KmsProvider::new(config.drm_device.clone())));
        let renders: Vec<Box<dyn RenderProvider>> = vec![
            Box::new(RenderKind::Gles),
            Box::new(RenderKind::Wgpu),
            Box::new(RenderKind::DrmDirect),
            Box::new(RenderKind::Blit),
        ];
        Self::new(displays, renders)
    }

    fn candidates<'a>(
        &'a self,
        config: &'a PipelineConfig,
    ) -> impl Iterator<Item = (&'a dyn DisplayProvider, Vec<&'a dyn RenderProvider>)> + 'a {
        self.displays
            .iter()
            .filter(move |d| config.display.map_or(true, |k| k == d.kind()))
            .map(move |d| {
                let renders = self
                    .renders
                    .iter()
                    .filter(|r| d.kind().supported_renders().contains(&r.kind()))
                    .filter(|r| config.render.map_or(true, |k| k == r.kind()))
                    .map(|r| r.as_ref())
                    .collect();
                (d.as_ref(), renders)
            })
    }

    /// Probe pairs in rank order
    pub fn select(&self, config: &PipelineConfig, want_hardware: bool) -> Result<PlatformPair> {
        let mut fallback: Option<(DisplayKind, RenderKind)> = None;

        for (dp, renders) in self.candidates(config) {
            let mut display = match dp.open() {
                Ok(d) => d,
                Err(e) => {
                    tracing::debug!(display = dp.kind().name(), "display probe failed: {}", e);
                    continue;
                }
            };

            for rp in renders {
                let mut render = match rp.create(display.as_mut()) {
                    Ok(r) => r,
                    Err(e) => {
                        tracing::debug!(
                            display = dp.kind().name(),
                            render = rp.kind().name(),
                            "render probe failed: {}",
                            e
                        );
                        continue;
                    }
                };

                let hw_ok = render.caps().contains(RenderCaps::HW_SURFACES);
                if !want_hardware || hw_ok {
                    let (display_name, render_name) = (display.name(), render.name());
                    tracing::info!(
                        display = display_name,
                        render = render_name,
                        hardware_decode = want_hardware && hw_ok,
                        "platform selected"
                    );
                    return Ok(PlatformPair { display, render, hardware_decode: want_hardware && hw_ok });
                }

                if fallback.is_none() {
                    fallback = Some((dp.kind(), rp.kind()));
                }
                render.destroy(display.as_mut());
            }
            display.close();
        }

        let (dk, rk) = fallback.ok_or_else(|| {
            PipelineError::BackendUnavailable("no display/render pair could be constructed".into())
        })?;
        tracing::warn!(
            display = dk.name(),
            render = rk.name(),
            "no pair can show hardware surfaces, decoding in software"
        );
        self.rebuild(dk, rk)
    }

    fn rebuild(&self, dk: DisplayKind, rk: RenderKind) -> Result<PlatformPair> {
        let dp = self
            .displays
            .iter()
            .find(|d| d.kind() == dk)
            .ok_or_else(|| PipelineError::BackendUnavailable(format!("display {} vanished", dk.name())))?;
        let rp = self
            .renders
            .iter()
            .find(|r| r.kind() == rk)
            .ok_or_else(|| PipelineError::BackendUnavailable(format!("render {} vanished", rk.name())))?;
        let mut display = dp.open()?;
        match rp.create(display.as_mut()) {
            Ok(render) => Ok(PlatformPair { display, render, hardware_decode: false }),
            Err(e) => {
                display.close();
                Err(PipelineError::BackendUnavailable(format!(
                    "{}/{} failed on rebuild: {}",
                    dk.name(),
                    rk.name(),
                    e
                )))
            }
        }
    }
}
