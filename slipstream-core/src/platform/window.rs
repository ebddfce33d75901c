//! Platform-native window display.
//!
//! The window itself belongs to the client's winit event loop; this
//! backend only exposes its native handles to renderers and applies
//! window operations (cursor grab, title, fullscreen).

use std::sync::Arc;

use raw_window_handle::{HasDisplayHandle, RawDisplayHandle};
use winit::dpi::PhysicalSize;
use winit::window::{CursorGrabMode, Fullscreen, Window};

use super::{DisplayBackend, DisplayKind, DisplayProvider, SetupFlags, WindowOp};
use crate::error::{PipelineError, Result};

pub struct WindowProvider {
    window: Arc<Window>,
}

impl WindowProvider {
    pub fn new(window: Arc<Window>) -> Self {
        Self { window }
    }
}

impl DisplayProvider for WindowProvider {
    fn kind(&self) -> DisplayKind {
        DisplayKind::Window
    }

    fn open(&self) -> Result<Box<dyn DisplayBackend>> {
        Ok(Box::new(WindowDisplay::new(self.window.clone())?))
    }
}

pub struct WindowDisplay {
    window: Arc<Window>,
    grabbed: bool,
    presented: u64,
    closed: bool,
}

impl WindowDisplay {
    pub fn new(window: Arc<Window>) -> Result<Self> {
        // fail the probe early if the platform gives us nothing to render into
        window
            .display_handle()
            .map_err(|e| PipelineError::display("window", format!("no display handle: {}", e)))?;
        Ok(Self { window, grabbed: false, presented: 0, closed: false })
    }

    pub fn presented_frames(&self) -> u64 {
        self.presented
    }

    fn grab(&mut self) -> Result<()> {
        self.window
            .set_cursor_grab(CursorGrabMode::Confined)
            .or_else(|_| self.window.set_cursor_grab(CursorGrabMode::Locked))
            .map_err(|e| PipelineError::display("window", format!("cursor grab: {}", e)))?;
        self.window.set_cursor_visible(false);
        self.grabbed = true;
        Ok(())
    }

    fn ungrab(&mut self) -> Result<()> {
        self.window
            .set_cursor_grab(CursorGrabMode::None)
            .map_err(|e| PipelineError::display("window", format!("cursor release: {}", e)))?;
        self.window.set_cursor_visible(true);
        self.grabbed = false;
        Ok(())
    }
}

impl DisplayBackend for WindowDisplay {
    fn kind(&self) -> DisplayKind {
        DisplayKind::Window
    }

    fn display_handle(&self) -> Option<RawDisplayHandle> {
        self.window.display_handle().ok().map(|h| h.as_raw())
    }

    fn window(&self) -> Option<Arc<Window>> {
        Some(self.window.clone())
    }

    fn setup(&mut self, width: u32, height: u32, flags: SetupFlags) -> Result<()> {
        if flags.contains(SetupFlags::FULLSCREEN) {
            self.window.set_fullscreen(Some(Fullscreen::Borderless(None)));
        } else if self.window.inner_size() != PhysicalSize::new(width, height) {
            // the compositor may refuse; renderers follow the actual size
            let _ = self.window.request_inner_size(PhysicalSize::new(width, height));
        }
        Ok(())
    }

    fn put_to_screen(&mut self, _index: usize) -> Result<()> {
        // the renderer already swapped; the window has a single front buffer
        self.presented += 1;
        Ok(())
    }

    fn resolution(&self) -> (u32, u32) {
        let size = self.window.inner_size();
        (size.width, size.height)
    }

    fn modify_window(&mut self, op: WindowOp) -> Result<()> {
        match op {
            WindowOp::Grab if !self.grabbed => self.grab(),
            WindowOp::Ungrab if self.grabbed => self.ungrab(),
            WindowOp::Grab | WindowOp::Ungrab => Ok(()),
            WindowOp::SetTitle(title) => {
                self.window.set_title(&title);
                Ok(())
            }
            WindowOp::ToggleFullscreen => {
                let next = match self.window.fullscreen() {
                    Some(_) => None,
                    None => Some(Fullscreen::Borderless(None)),
                };
                self.window.set_fullscreen(next);
                Ok(())
            }
        }
    }

    fn close(&mut self) {
        if self.closed {
            return;
        }
        if self.grabbed {
            let _ = self.ungrab();
        }
        self.closed = true;
    }
}
