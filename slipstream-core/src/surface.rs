//! # Hardware Surface Bridge
//!
//! Turns a decoder-owned hardware surface into DMA-BUF handles a GPU or
//! display API can import, and tears everything down again in the only
//! safe order:
//!
//! ```text
//!  HwSurface ──export──► ExportedSurface ──import──► ImportedSurface
//!  (decoder)   sync +     (owned fds)        images    (images + fds)
//!              EXPBUF                                      │
//!                                   release: images first, │
//!                                   then fds, then surface ◄┘
//! ```
//!
//! Every file descriptor is an `OwnedFd`, so early returns and panics
//! close them exactly once. The number of exported-but-unreleased
//! surfaces is capped at the decoder's pool capacity minus the surfaces
//! the decoder needs to keep making progress.

use std::fmt;
use std::os::fd::{AsRawFd, OwnedFd};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crate::error::{PipelineError, Result};
use crate::picture::DecodedPicture;

// ============================================================================
// Decoder Side
// ============================================================================

/// Decoder-side owner of a pool of hardware surfaces
pub trait SurfaceSource: Send + Sync {
    fn name(&self) -> &'static str;

    /// Block until the decoder has finished writing `index`
    fn sync(&self, index: u32, generation: u64) -> Result<()>;

    /// Export `index` as DMA-BUF objects
    fn export(&self, index: u32, generation: u64) -> Result<SurfaceDescriptor>;

    /// Hand `index` back to the decoder for reuse
    fn recycle(&self, index: u32, generation: u64);

    /// Surfaces in the decoder's pool
    fn pool_capacity(&self) -> usize;

    /// Surfaces the decoder must hold on to for references and output
    fn decoder_reserve(&self) -> usize {
        0
    }
}

/// A decoded frame that still lives in decoder memory.
///
/// Dropping it returns the surface to the decoder.
pub struct HwSurface {
    index: u32,
    generation: u64,
    source: Arc<dyn SurfaceSource>,
}

impl HwSurface {
    pub fn new(source: Arc<dyn SurfaceSource>, index: u32, generation: u64) -> Self {
        Self { index, generation, source }
    }

    pub fn index(&self) -> u32 {
        self.index
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn source_name(&self) -> &'static str {
        self.source.name()
    }
}

impl Drop for HwSurface {
    fn drop(&mut self) {
        self.source.recycle(self.index, self.generation);
    }
}

impl fmt::Debug for HwSurface {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HwSurface")
            .field("source", &self.source.name())
            .field("index", &self.index)
            .field("generation", &self.generation)
            .finish()
    }
}

// ============================================================================
// Descriptor
// ============================================================================

/// One exported memory object
#[derive(Debug)]
pub struct DmaBufObject {
    pub fd: OwnedFd,
    pub size: u64,
    /// DRM format modifier, `DRM_FORMAT_MOD_INVALID` when implicit
    pub modifier: u64,
}

/// Where one plane lives inside the exported objects
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlaneLayout {
    pub object: usize,
    pub offset: u32,
    pub pitch: u32,
}

/// Exported view of a hardware surface
#[derive(Debug)]
pub struct SurfaceDescriptor {
    /// DRM fourcc of the whole surface
    pub fourcc: u32,
    pub width: u32,
    pub height: u32,
    pub objects: Vec<DmaBufObject>,
    pub planes: Vec<PlaneLayout>,
}

pub const DRM_FORMAT_MOD_LINEAR: u64 = 0;
pub const DRM_FORMAT_MOD_INVALID: u64 = 0x00ff_ffff_ffff_ffff;

pub const fn fourcc(code: &[u8; 4]) -> u32 {
    (code[0] as u32) | (code[1] as u32) << 8 | (code[2] as u32) << 16 | (code[3] as u32) << 24
}

pub const DRM_FORMAT_NV12: u32 = fourcc(b"NV12");
pub const DRM_FORMAT_NV24: u32 = fourcc(b"NV24");
pub const DRM_FORMAT_P010: u32 = fourcc(b"P010");
pub const DRM_FORMAT_XRGB8888: u32 = fourcc(b"XR24");

impl SurfaceDescriptor {
    /// (fd, pitch, offset, modifier) for each plane
    pub fn plane_tuples(&self) -> impl Iterator<Item = (i32, u32, u32, u64)> + '_ {
        self.planes.iter().filter_map(|p| {
            self.objects
                .get(p.object)
                .map(|o| (o.fd.as_raw_fd(), p.pitch, p.offset, o.modifier))
        })
    }

    /// All objects carry an explicit modifier
    pub fn has_explicit_modifier(&self) -> bool {
        !self.objects.is_empty() && self.objects.iter().all(|o| o.modifier != DRM_FORMAT_MOD_INVALID)
    }

    pub fn validate(&self) -> Result<()> {
        if self.objects.is_empty() || self.planes.is_empty() {
            return Err(PipelineError::Surface("descriptor has no planes".into()));
        }
        if let Some(p) = self.planes.iter().find(|p| p.object >= self.objects.len()) {
            return Err(PipelineError::Surface(format!(
                "plane references object {} of {}",
                p.object,
                self.objects.len()
            )));
        }
        Ok(())
    }
}

// ============================================================================
// GPU Side
// ============================================================================

/// A GPU or display API able to wrap DMA-BUF descriptors in its own images
pub trait GpuImporter {
    type Image;

    /// Create one image per plane or object. On error the importer must
    /// already have destroyed any images it created.
    fn import(&mut self, descriptor: &SurfaceDescriptor) -> Result<Vec<Self::Image>>;

    fn destroy(&mut self, images: Vec<Self::Image>);
}

/// Exported surface holding its descriptors open.
///
/// Field order matters: `descriptor` drops (closing fds) before `surface`
/// goes back to the decoder.
pub struct ExportedSurface {
    descriptor: SurfaceDescriptor,
    surface: HwSurface,
    _slot: InFlightSlot,
}

impl ExportedSurface {
    pub fn descriptor(&self) -> &SurfaceDescriptor {
        &self.descriptor
    }

    pub fn surface_index(&self) -> u32 {
        self.surface.index()
    }

    /// Close every exported fd and return the surface to the decoder
    pub fn release(self) {
        drop(self);
    }
}

/// Imported surface: GPU images plus the descriptors backing them
pub struct ImportedSurface<I> {
    images: Vec<I>,
    exported: ExportedSurface,
}

impl<I> ImportedSurface<I> {
    pub fn images(&self) -> &[I] {
        &self.images
    }

    pub fn exported(&self) -> &ExportedSurface {
        &self.exported
    }
}

/// Counts surfaces between export and release
struct InFlightSlot {
    counter: Arc<AtomicUsize>,
}

impl Drop for InFlightSlot {
    fn drop(&mut self) {
        self.counter.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Export/import/release with the in-flight limit enforced
#[derive(Clone, Default)]
pub struct SurfaceBridge {
    in_flight: Arc<AtomicUsize>,
}

impl SurfaceBridge {
    pub fn new() -> Self {
        Self::default()
    }

    /// Exported surfaces not yet released
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::Acquire)
    }

    /// Take the hardware surface out of `picture`, wait for the decoder to
    /// finish it, and export its DMA-BUF handles
    pub fn export(&self, picture: &mut DecodedPicture) -> Result<ExportedSurface> {
        let surface = picture
            .surface
            .take()
            .ok_or_else(|| PipelineError::Surface("picture has no hardware surface".into()))?;
        self.export_surface(surface)
    }

    pub fn export_surface(&self, surface: HwSurface) -> Result<ExportedSurface> {
        let capacity = surface.source.pool_capacity();
        let reserve = surface.source.decoder_reserve();
        let limit = capacity.saturating_sub(reserve);
        let previous = self.in_flight.fetch_add(1, Ordering::AcqRel);
        let slot = InFlightSlot { counter: self.in_flight.clone() };
        if previous >= limit {
            return Err(PipelineError::ResourceExhausted(format!(
                "{} surfaces in flight, {} pool holds {} with {} kept by the decoder",
                previous + 1,
                surface.source.name(),
                capacity,
                reserve
            )));
        }

        surface.source.sync(surface.index, surface.generation)?;
        let descriptor = surface.source.export(surface.index, surface.generation)?;
        descriptor.validate()?;
        tracing::trace!(
            source = surface.source.name(),
            index = surface.index,
            objects = descriptor.objects.len(),
            "exported surface"
        );
        Ok(ExportedSurface { descriptor, surface, _slot: slot })
    }

    pub fn import<G: GpuImporter>(
        &self,
        importer: &mut G,
        exported: ExportedSurface,
    ) -> Result<ImportedSurface<G::Image>> {
        // on failure `exported` drops here, closing its fds
        let images = importer.import(&exported.descriptor)?;
        Ok(ImportedSurface { images, exported })
    }

    /// Destroy GPU images, then close the descriptors, then recycle
    pub fn release<G: GpuImporter>(&self, importer: &mut G, imported: ImportedSurface<G::Image>) {
        let ImportedSurface { images, exported } = imported;
        importer.destroy(images);
        exported.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::picture::PixelFormat;
    use crate::testing::{FdProbe, MockSurfaceSource};

    struct CountingImporter {
        live: usize,
        fail: bool,
        order: Vec<&'static str>,
    }

    impl GpuImporter for CountingImporter {
        type Image = u32;

        fn import(&mut self, descriptor: &SurfaceDescriptor) -> Result<Vec<u32>> {
            if self.fail {
                return Err(PipelineError::Surface("import refused".into()));
            }
            self.live += descriptor.planes.len();
            Ok((0..descriptor.planes.len() as u32).collect())
        }

        fn destroy(&mut self, images: Vec<u32>) {
            self.live -= images.len();
            self.order.push("images");
        }
    }

    fn hw_picture(source: &Arc<MockSurfaceSource>, index: u32) -> DecodedPicture {
        let mut picture = DecodedPicture::allocate(PixelFormat::Hardware, 64, 64);
        picture.surface = Some(source.surface(index));
        picture
    }

    #[test]
    fn test_export_then_release_without_import_closes_fds() {
        let source = MockSurfaceSource::new(4);
        let bridge = SurfaceBridge::new();
        let mut picture = hw_picture(&source, 1);

        let exported = bridge.export(&mut picture).unwrap();
        assert_eq!(bridge.in_flight(), 1);
        let probes: Vec<FdProbe> = source.take_probes();
        assert_eq!(probes.len(), 2);
        assert!(probes.iter().all(|p| !p.is_closed()));

        exported.release();
        assert!(probes.iter().all(|p| p.is_closed()));
        assert_eq!(bridge.in_flight(), 0);
        assert_eq!(source.outstanding(), 0);
        assert_eq!(source.recycled(), vec![1]);
    }

    #[test]
    fn test_release_destroys_images_before_closing_fds() {
        let source = MockSurfaceSource::new(4);
        let bridge = SurfaceBridge::new();
        let mut importer = CountingImporter { live: 0, fail: false, order: Vec::new() };
        let mut picture = hw_picture(&source, 0);

        let exported = bridge.export(&mut picture).unwrap();
        let probes = source.take_probes();
        let imported = bridge.import(&mut importer, exported).unwrap();
        assert_eq!(importer.live, 2);
        assert_eq!(imported.images().len(), 2);

        bridge.release(&mut importer, imported);
        assert_eq!(importer.live, 0);
        assert_eq!(importer.order, vec!["images"]);
        assert!(probes.iter().all(|p| p.is_closed()));
        assert_eq!(source.outstanding(), 0);
    }

    #[test]
    fn test_failed_import_still_closes_fds() {
        let source = MockSurfaceSource::new(4);
        let bridge = SurfaceBridge::new();
        let mut importer = CountingImporter { live: 0, fail: true, order: Vec::new() };
        let mut picture = hw_picture(&source, 2);

        let exported = bridge.export(&mut picture).unwrap();
        let probes = source.take_probes();
        assert!(bridge.import(&mut importer, exported).is_err());
        assert!(probes.iter().all(|p| p.is_closed()));
        assert_eq!(bridge.in_flight(), 0);
    }

    #[test]
    fn test_in_flight_limit_is_pool_capacity() {
        let source = MockSurfaceSource::new(2);
        let bridge = SurfaceBridge::new();
        let a = bridge.export_surface(source.surface(0)).unwrap();
        let _b = bridge.export_surface(source.surface(1)).unwrap();

        let err = bridge.export_surface(source.surface(0)).err().unwrap();
        assert!(matches!(err, PipelineError::ResourceExhausted(_)));
        assert_eq!(bridge.in_flight(), 2);

        a.release();
        assert!(bridge.export_surface(source.surface(0)).is_ok());
    }

    #[test]
    fn test_decoder_reserve_is_never_exported() {
        let source = MockSurfaceSource::with_reserve(4, 2);
        let bridge = SurfaceBridge::new();
        let a = bridge.export_surface(source.surface(0)).unwrap();
        let _b = bridge.export_surface(source.surface(1)).unwrap();

        assert!(matches!(
            bridge.export_surface(source.surface(2)).err().unwrap(),
            PipelineError::ResourceExhausted(_)
        ));
        assert_eq!(bridge.in_flight(), 2);

        a.release();
        assert!(bridge.export_surface(source.surface(2)).is_ok());
    }

    #[test]
    fn test_software_picture_has_nothing_to_export() {
        let bridge = SurfaceBridge::new();
        let mut picture = DecodedPicture::allocate(PixelFormat::Yuv420p, 16, 16);
        assert!(bridge.export(&mut picture).is_err());
        assert_eq!(bridge.in_flight(), 0);
    }
}
