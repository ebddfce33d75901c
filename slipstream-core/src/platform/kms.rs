//! Headless direct display through DRM/KMS.
//!
//! Owns the CRTC, three CPU-mapped framebuffers and any framebuffers
//! renderers import. Presents with page flips and waits for the previous
//! flip to complete before queueing the next one. Colorimetry (HDR
//! metadata blob + connector colorspace) is committed atomically where
//! the driver allows it.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use raw_window_handle::RawDisplayHandle;

use super::drm::{DrmCard, DumbBuffer, Output, DRM_MODE_OBJECT_CONNECTOR};
use super::{DisplayBackend, DisplayKind, DisplayProvider, Scanout, SetupFlags, WindowOp};
use crate::error::{PipelineError, Result};
use crate::hdr::{ColorimetrySink, ConnectorColorspace, HdrController};
use crate::network::HdrMetadata;

// one on screen, one pending flip, one being drawn
const SCANOUT_BUFFERS: usize = 3;
const FLIP_TIMEOUT: Duration = Duration::from_millis(100);

pub struct KmsProvider {
    device: PathBuf,
}

impl KmsProvider {
    pub fn new(device: PathBuf) -> Self {
        Self { device }
    }
}

impl DisplayProvider for KmsProvider {
    fn kind(&self) -> DisplayKind {
        DisplayKind::Kms
    }

    fn open(&self) -> Result<Box<dyn DisplayBackend>> {
        Ok(Box::new(KmsDisplay::open(&self.device)?))
    }
}

// ============================================================================
// Framebuffer Table
// ============================================================================

/// put_to_screen indices: own buffers first, imported framebuffers after
#[derive(Debug, Default)]
pub struct FramebufferTable {
    owned: Vec<u32>,
    imported: Vec<Option<u32>>,
}

impl FramebufferTable {
    pub fn set_owned(&mut self, ids: Vec<u32>) {
        self.owned = ids;
    }

    pub fn attach(&mut self, fb_id: u32) -> usize {
        let slot = match self.imported.iter().position(Option::is_none) {
            Some(i) => {
                self.imported[i] = Some(fb_id);
                i
            }
            None => {
                self.imported.push(Some(fb_id));
                self.imported.len() - 1
            }
        };
        self.owned.len() + slot
    }

    pub fn detach(&mut self, index: usize) -> Option<u32> {
        let slot = index.checked_sub(self.owned.len())?;
        self.imported.get_mut(slot)?.take()
    }

    pub fn get(&self, index: usize) -> Option<u32> {
        match index.checked_sub(self.owned.len()) {
            None => self.owned.get(index).copied(),
            Some(slot) => self.imported.get(slot).copied().flatten(),
        }
    }

    pub fn drain_imported(&mut self) -> Vec<u32> {
        self.imported.drain(..).flatten().collect()
    }
}

// ============================================================================
// Display
// ============================================================================

pub struct KmsDisplay {
    card: DrmCard,
    output: Output,
    buffers: Vec<DumbBuffer>,
    table: FramebufferTable,
    crtc_set: bool,
    flip_pending: bool,
    hdr: HdrController,
    colorspace_prop: Option<u32>,
    hdr_prop: Option<u32>,
    closed: bool,
}

impl KmsDisplay {
    pub fn open(device: &Path) -> Result<Self> {
        let card = DrmCard::open(device)?;
        let output = card.find_output()?;

        let colorspace_prop = card
            .find_property(output.connector_id, DRM_MODE_OBJECT_CONNECTOR, "Colorspace")?
            .map(|(id, _, _)| id);
        let hdr_prop = card
            .find_property(output.connector_id, DRM_MODE_OBJECT_CONNECTOR, "HDR_OUTPUT_METADATA")?
            .map(|(id, _, _)| id);

        let (w, h) = output.size();
        tracing::info!(
            device = %device.display(),
            connector = output.connector_id,
            crtc = output.crtc_id,
            "KMS output {}x{}@{}",
            w,
            h,
            output.mode.vrefresh
        );

        Ok(Self {
            card,
            output,
            buffers: Vec::new(),
            table: FramebufferTable::default(),
            crtc_set: false,
            flip_pending: false,
            hdr: HdrController::new(),
            colorspace_prop,
            hdr_prop,
            closed: false,
        })
    }

    fn wait_pending_flip(&mut self) -> Result<()> {
        if !self.flip_pending {
            return Ok(());
        }
        if !self.card.wait_flip(FLIP_TIMEOUT)? {
            tracing::warn!("page flip did not complete within {:?}", FLIP_TIMEOUT);
        }
        self.flip_pending = false;
        Ok(())
    }
}

impl DisplayBackend for KmsDisplay {
    fn kind(&self) -> DisplayKind {
        DisplayKind::Kms
    }

    fn display_handle(&self) -> Option<RawDisplayHandle> {
        None
    }

    fn window(&self) -> Option<Arc<winit::window::Window>> {
        None
    }

    fn setup(&mut self, _width: u32, _height: u32, _flags: SetupFlags) -> Result<()> {
        if !self.buffers.is_empty() {
            return Ok(());
        }
        // scanout always runs at the connector's mode; renderers scale
        let (w, h) = self.output.size();
        for _ in 0..SCANOUT_BUFFERS {
            let mut buffer = self.card.create_dumb(w, h)?;
            buffer.pixels_mut().fill(0);
            self.buffers.push(buffer);
        }
        self.table.set_owned(self.buffers.iter().map(|b| b.fb_id).collect());
        Ok(())
    }

    fn setup_post(&mut self) -> Result<()> {
        if let Some(fb) = self.table.get(0) {
            self.card
                .set_crtc(&self.output, fb)
                .map_err(|e| PipelineError::display("kms", format!("SETCRTC: {}", e)))?;
            self.crtc_set = true;
        }
        Ok(())
    }

    fn put_to_screen(&mut self, index: usize) -> Result<()> {
        let fb = self
            .table
            .get(index)
            .ok_or_else(|| PipelineError::display("kms", format!("no framebuffer at index {}", index)))?;

        if !self.crtc_set {
            self.card
                .set_crtc(&self.output, fb)
                .map_err(|e| PipelineError::display("kms", format!("SETCRTC: {}", e)))?;
            self.crtc_set = true;
            return Ok(());
        }

        self.wait_pending_flip()?;
        self.card
            .page_flip(self.output.crtc_id, fb, index as u64)
            .map_err(|e| PipelineError::display("kms", format!("page flip: {}", e)))?;
        self.flip_pending = true;
        Ok(())
    }

    fn resolution(&self) -> (u32, u32) {
        self.output.size()
    }

    fn modify_window(&mut self, op: WindowOp) -> Result<()> {
        // no cursor or window on a bare CRTC
        tracing::debug!(?op, "ignored on KMS display");
        Ok(())
    }

    fn apply_colorimetry(&mut self, metadata: Option<&HdrMetadata>) -> Result<bool> {
        if self.colorspace_prop.is_none() && self.hdr_prop.is_none() {
            return Ok(false);
        }
        if metadata.is_some() && self.hdr_prop.is_none() {
            tracing::warn!("connector has no HDR_OUTPUT_METADATA, staying SDR");
            return Ok(false);
        }
        let mut hdr = std::mem::take(&mut self.hdr);
        let result = hdr.apply(self, metadata);
        self.hdr = hdr;
        result.map(|_| true)
    }

    fn scanout(&mut self) -> Option<&mut dyn Scanout> {
        Some(self)
    }

    fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        let _ = self.wait_pending_flip();

        let mut hdr = std::mem::take(&mut self.hdr);
        hdr.release(self);

        for fb in self.table.drain_imported() {
            self.card.remove_framebuffer(fb);
        }
        for mut buffer in std::mem::take(&mut self.buffers) {
            self.card.destroy_dumb(&mut buffer);
        }
        tracing::debug!("KMS display closed");
    }
}

impl Scanout for KmsDisplay {
    fn card(&self) -> &DrmCard {
        &self.card
    }

    fn dumb_buffers(&mut self) -> &mut [DumbBuffer] {
        &mut self.buffers
    }

    fn attach_framebuffer(&mut self, fb_id: u32) -> usize {
        self.table.attach(fb_id)
    }

    fn detach_framebuffer(&mut self, index: usize) -> Option<u32> {
        self.table.detach(index)
    }
}

impl ColorimetrySink for KmsDisplay {
    fn create_blob(&mut self, data: &[u8]) -> Result<u32> {
        self.card.create_blob(data)
    }

    fn commit_colorimetry(&mut self, colorspace: ConnectorColorspace, blob: Option<u32>) -> Result<()> {
        let mut props = Vec::with_capacity(2);
        if let Some(prop) = self.colorspace_prop {
            match self.card.enum_value(prop, colorspace.property_name())? {
                Some(value) => props.push((prop, value)),
                None => tracing::debug!("Colorspace has no {} entry", colorspace.property_name()),
            }
        }
        if let Some(prop) = self.hdr_prop {
            props.push((prop, blob.unwrap_or(0) as u64));
        }
        self.card
            .commit_properties(self.output.connector_id, &props)
            .map_err(|e| PipelineError::display("kms", format!("colorimetry commit: {}", e)))
    }

    fn destroy_blob(&mut self, blob: u32) -> Result<()> {
        self.card.destroy_blob(blob)
    }
}

impl Drop for KmsDisplay {
    fn drop(&mut self) {
        self.close();
    }
}
