//! CPU blit renderer for KMS displays without a usable GPU path.
//!
//! Converts software pictures into the display's dumb framebuffers,
//! rotating through them so the buffer being written is never the one on
//! screen or the one waiting for a flip.

use super::{DisplayBackend, RenderBackend, RenderCaps, RenderInit, RenderKind};
use crate::color::ColorConfig;
use crate::convert::XrgbConverter;
use crate::error::{PipelineError, Result};
use crate::picture::{ColorRange, Colorspace, DecodedPicture};

pub struct BlitRenderer {
    converter: XrgbConverter,
    next: usize,
    frames: u64,
}

impl BlitRenderer {
    pub fn create(display: &mut dyn DisplayBackend) -> Result<Self> {
        if display.scanout().is_none() {
            return Err(PipelineError::BackendUnavailable(format!(
                "blit needs scanout buffers, {} has none",
                display.name()
            )));
        }
        Ok(Self {
            converter: XrgbConverter::new(&ColorConfig::new(Colorspace::Bt709, ColorRange::Limited)),
            next: 0,
            frames: 0,
        })
    }
}

impl RenderBackend for BlitRenderer {
    fn kind(&self) -> RenderKind {
        RenderKind::Blit
    }

    fn caps(&self) -> RenderCaps {
        RenderCaps::DIRECT_DRAW | RenderCaps::YUV444
    }

    fn init(&mut self, display: &mut dyn DisplayBackend, _info: &RenderInit) -> Result<()> {
        let scanout = display
            .scanout()
            .ok_or_else(|| PipelineError::render("blit", "display lost its scanout buffers"))?;
        let buffers = scanout.dumb_buffers();
        if buffers.is_empty() {
            return Err(PipelineError::render("blit", "display was not set up"));
        }
        tracing::info!(buffers = buffers.len(), "blit renderer ready");
        self.next = 0;
        Ok(())
    }

    fn sync_config(&mut self, config: &ColorConfig) -> Result<()> {
        self.converter.set_config(config);
        Ok(())
    }

    fn draw(&mut self, picture: &mut DecodedPicture, display: &mut dyn DisplayBackend) -> Result<usize> {
        if picture.is_hardware() {
            return Err(PipelineError::render("blit", "hardware surfaces need the drm-direct renderer"));
        }
        let scanout = display
            .scanout()
            .ok_or_else(|| PipelineError::render("blit", "display lost its scanout buffers"))?;
        let buffers = scanout.dumb_buffers();
        if buffers.is_empty() {
            return Err(PipelineError::render("blit", "no scanout buffers"));
        }

        let index = self.next % buffers.len();
        let buffer = &mut buffers[index];
        let (pitch, width, height) = (buffer.pitch as usize, buffer.width, buffer.height);
        self.converter.convert(picture, buffer.pixels_mut(), pitch, width, height)?;

        self.next = index + 1;
        self.frames += 1;
        Ok(index)
    }

    fn destroy(&mut self, _display: &mut dyn DisplayBackend) {
        tracing::debug!(frames = self.frames, "blit renderer destroyed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MockDisplay;

    #[test]
    fn test_needs_scanout() {
        let mut window_like = MockDisplay::window();
        assert!(BlitRenderer::create(&mut window_like).is_err());
    }

    #[test]
    fn test_rejects_hardware_pictures() {
        let mut display = MockDisplay::window();
        let mut blit = BlitRenderer {
            converter: XrgbConverter::new(&ColorConfig::new(Colorspace::Bt709, ColorRange::Limited)),
            next: 0,
            frames: 0,
        };
        let source = crate::testing::MockSurfaceSource::new(2);
        let mut picture = DecodedPicture::allocate(crate::picture::PixelFormat::Hardware, 16, 16);
        picture.surface = Some(source.surface(0));
        assert!(blit.draw(&mut picture, &mut display).is_err());
    }
}
