//! Zero-copy KMS renderer.
//!
//! Hardware pictures are exported through the surface bridge, imported
//! into the display's DRM device with PRIME and wrapped in framebuffers
//! that the display flips to directly. No pixel is touched by the CPU or
//! a GPU.
//!
//! ```text
//!   map_buffer(n):   export ─► PRIME import ─► ADDFB2 ─► attach
//!   held frames:     [ n-2 on screen | n-1 pending flip | n drawing ]
//!   oldest beyond that: detach ─► RMFB ─► close fds ─► recycle
//! ```
//!
//! Software pictures fall back to the CPU blit path on the same display.

use std::collections::VecDeque;
use std::os::fd::AsFd;

use super::drm::{DrmCard, FramebufferLayout};
use super::render_blit::BlitRenderer;
use super::{DisplayBackend, RenderBackend, RenderCaps, RenderInit, RenderKind, Scanout};
use crate::color::ColorConfig;
use crate::error::{PipelineError, Result};
use crate::picture::DecodedPicture;
use crate::surface::{GpuImporter, ImportedSurface, SurfaceBridge, SurfaceDescriptor};

const HELD_FRAMES: usize = 3;

// ============================================================================
// PRIME Import
// ============================================================================

/// Framebuffer description for a descriptor whose objects were imported
/// as `handles` (one per object)
pub fn framebuffer_layout(
    descriptor: &SurfaceDescriptor,
    handles: &[u32],
    modifiers_supported: bool,
) -> Result<FramebufferLayout> {
    if descriptor.planes.len() > 4 {
        return Err(PipelineError::Surface(format!("{} planes do not fit a framebuffer", descriptor.planes.len())));
    }
    let mut layout = FramebufferLayout {
        width: descriptor.width,
        height: descriptor.height,
        fourcc: descriptor.fourcc,
        handles: [0; 4],
        pitches: [0; 4],
        offsets: [0; 4],
        modifier: None,
    };
    for (i, plane) in descriptor.planes.iter().enumerate() {
        layout.handles[i] = *handles
            .get(plane.object)
            .ok_or_else(|| PipelineError::Surface(format!("no handle for object {}", plane.object)))?;
        layout.pitches[i] = plane.pitch;
        layout.offsets[i] = plane.offset;
    }
    if modifiers_supported && descriptor.has_explicit_modifier() {
        layout.modifier = descriptor.objects.first().map(|o| o.modifier);
    }
    Ok(layout)
}

/// Wraps descriptors in framebuffers on one DRM device; images are fb ids
struct PrimeImporter<'a> {
    card: &'a DrmCard,
    modifiers: bool,
}

impl GpuImporter for PrimeImporter<'_> {
    type Image = u32;

    fn import(&mut self, descriptor: &SurfaceDescriptor) -> Result<Vec<u32>> {
        let mut handles = Vec::with_capacity(descriptor.objects.len());
        for object in &descriptor.objects {
            match self.card.prime_import(object.fd.as_fd()) {
                Ok(handle) => handles.push(handle),
                Err(e) => {
                    handles.iter().for_each(|&h| self.card.close_handle(h));
                    return Err(PipelineError::Surface(format!("PRIME import failed: {}", e)));
                }
            }
        }

        let result = framebuffer_layout(descriptor, &handles, self.modifiers)
            .and_then(|layout| self.card.add_framebuffer(&layout));

        // the framebuffer keeps its own references to the buffers
        let mut closed = Vec::with_capacity(handles.len());
        for h in handles {
            if !closed.contains(&h) {
                self.card.close_handle(h);
                closed.push(h);
            }
        }

        result
            .map(|fb_id| vec![fb_id])
            .map_err(|e| PipelineError::Surface(format!("ADDFB2 failed: {}", e)))
    }

    fn destroy(&mut self, images: Vec<u32>) {
        for fb_id in images {
            self.card.remove_framebuffer(fb_id);
        }
    }
}

// ============================================================================
// Renderer
// ============================================================================

struct MappedFrame {
    index: usize,
    imported: ImportedSurface<u32>,
}

pub struct DrmDirectRenderer {
    bridge: SurfaceBridge,
    modifiers: bool,
    caps: RenderCaps,
    frames: VecDeque<MappedFrame>,
    software: BlitRenderer,
}

impl DrmDirectRenderer {
    pub fn create(display: &mut dyn DisplayBackend) -> Result<Self> {
        let software = BlitRenderer::create(display)?;
        let scanout = display
            .scanout()
            .ok_or_else(|| PipelineError::BackendUnavailable("drm-direct needs a KMS display".into()))?;
        let card = scanout.card();
        let modifiers = card.supports_modifiers();

        let mut caps = RenderCaps::DIRECT_DRAW | RenderCaps::YUV444;
        if card.can_import_prime() {
            caps |= RenderCaps::HW_SURFACES | RenderCaps::MAP_BUFFER | RenderCaps::HDR;
        } else {
            tracing::info!("DRM device cannot import PRIME buffers, drm-direct limited to software pictures");
        }

        Ok(Self { bridge: SurfaceBridge::new(), modifiers, caps, frames: VecDeque::new(), software })
    }

    fn release_frame(&self, frame: MappedFrame, scanout: &mut dyn Scanout) {
        scanout.detach_framebuffer(frame.index);
        let mut importer = PrimeImporter { card: scanout.card(), modifiers: self.modifiers };
        self.bridge.release(&mut importer, frame.imported);
    }

    fn release_all(&mut self, display: &mut dyn DisplayBackend) {
        let frames: Vec<MappedFrame> = self.frames.drain(..).collect();
        match display.scanout() {
            Some(scanout) => {
                for frame in frames {
                    self.release_frame(frame, scanout);
                }
            }
            // display already gone: dropping still closes fds and recycles
            None => drop(frames),
        }
    }
}

impl RenderBackend for DrmDirectRenderer {
    fn kind(&self) -> RenderKind {
        RenderKind::DrmDirect
    }

    fn caps(&self) -> RenderCaps {
        self.caps
    }

    fn init(&mut self, display: &mut dyn DisplayBackend, info: &RenderInit) -> Result<()> {
        self.bridge = info.bridge.clone();
        self.software.init(display, info)?;
        tracing::info!(modifiers = self.modifiers, caps = ?self.caps, "drm-direct renderer ready");
        Ok(())
    }

    fn sync_config(&mut self, config: &ColorConfig) -> Result<()> {
        // scanout of YUV framebuffers uses the plane's own colour properties
        self.software.sync_config(config)
    }

    fn draw(&mut self, picture: &mut DecodedPicture, display: &mut dyn DisplayBackend) -> Result<usize> {
        if picture.is_hardware() {
            self.map_buffer(picture, display)
        } else {
            self.software.draw(picture, display)
        }
    }

    fn map_buffer(&mut self, picture: &mut DecodedPicture, display: &mut dyn DisplayBackend) -> Result<usize> {
        if !self.caps.contains(RenderCaps::MAP_BUFFER) {
            return Err(PipelineError::render("drm-direct", "PRIME import unavailable"));
        }
        let scanout = display
            .scanout()
            .ok_or_else(|| PipelineError::render("drm-direct", "display lost its scanout"))?;

        let exported = self.bridge.export(picture)?;
        let imported = {
            let mut importer = PrimeImporter { card: scanout.card(), modifiers: self.modifiers };
            self.bridge.import(&mut importer, exported)?
        };
        let fb_id = imported.images()[0];
        let index = scanout.attach_framebuffer(fb_id);
        tracing::trace!(index, fb_id, surface = imported.exported().surface_index(), "mapped surface");
        self.frames.push_back(MappedFrame { index, imported });

        while self.frames.len() > HELD_FRAMES {
            if let Some(oldest) = self.frames.pop_front() {
                self.release_frame(oldest, scanout);
            }
        }
        Ok(index)
    }

    fn unmap_buffer(&mut self, index: usize, display: &mut dyn DisplayBackend) {
        let Some(pos) = self.frames.iter().position(|f| f.index == index) else {
            return;
        };
        let Some(frame) = self.frames.remove(pos) else {
            return;
        };
        match display.scanout() {
            Some(scanout) => self.release_frame(frame, scanout),
            None => drop(frame),
        }
    }

    fn destroy(&mut self, display: &mut dyn DisplayBackend) {
        self.release_all(display);
        self.software.destroy(display);
        tracing::debug!("drm-direct renderer destroyed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::surface::{DmaBufObject, PlaneLayout, DRM_FORMAT_MOD_INVALID, DRM_FORMAT_NV12};
    use std::os::fd::OwnedFd;

    fn object(modifier: u64) -> DmaBufObject {
        let fd: OwnedFd = tempfile::tempfile().unwrap().into();
        DmaBufObject { fd, size: 4096, modifier }
    }

    fn nv12(objects: Vec<DmaBufObject>, second_object: usize) -> SurfaceDescriptor {
        SurfaceDescriptor {
            fourcc: DRM_FORMAT_NV12,
            width: 64,
            height: 32,
            objects,
            planes: vec![
                PlaneLayout { object: 0, offset: 0, pitch: 64 },
                PlaneLayout { object: second_object, offset: if second_object == 0 { 2048 } else { 0 }, pitch: 64 },
            ],
        }
    }

    #[test]
    fn test_single_object_layout() {
        let desc = nv12(vec![object(0x0100_0000_0000_0001)], 0);
        let layout = framebuffer_layout(&desc, &[7], true).unwrap();
        assert_eq!(layout.handles, [7, 7, 0, 0]);
        assert_eq!(layout.offsets, [0, 2048, 0, 0]);
        assert_eq!(layout.pitches[1], 64);
        assert_eq!(layout.modifier, Some(0x0100_0000_0000_0001));
    }

    #[test]
    fn test_multi_object_layout() {
        let desc = nv12(vec![object(0), object(0)], 1);
        let layout = framebuffer_layout(&desc, &[3, 9], true).unwrap();
        assert_eq!(layout.handles, [3, 9, 0, 0]);
        assert_eq!(layout.offsets[1], 0);
    }

    #[test]
    fn test_modifier_only_when_supported_and_explicit() {
        let desc = nv12(vec![object(0)], 0);
        assert_eq!(framebuffer_layout(&desc, &[1], false).unwrap().modifier, None);

        let implicit = nv12(vec![object(DRM_FORMAT_MOD_INVALID)], 0);
        assert_eq!(framebuffer_layout(&implicit, &[1], true).unwrap().modifier, None);
    }

    #[test]
    fn test_missing_handle_rejected() {
        let desc = nv12(vec![object(0), object(0)], 1);
        assert!(framebuffer_layout(&desc, &[3], true).is_err());
    }
}
