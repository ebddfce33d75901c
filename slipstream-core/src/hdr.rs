//! HDR static metadata and connector colorimetry.
//!
//! Metadata is packed into the kernel's `hdr_output_metadata` layout and
//! committed as a property blob together with the connector `Colorspace`
//! property. Blobs are versioned: a new one is created only when HDR
//! toggles, and the previous one is destroyed after the commit that
//! replaced it.

use crate::error::Result;
use crate::network::HdrMetadata;

/// CTA-861-G EOTF codes
pub const HDMI_EOTF_TRADITIONAL_GAMMA_SDR: u8 = 0;
pub const HDMI_EOTF_SMPTE_ST2084: u8 = 2;

/// `HDMI_STATIC_METADATA_TYPE1`
pub const HDMI_STATIC_METADATA_TYPE1: u32 = 0;

#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HdrChromaticity {
    pub x: u16,
    pub y: u16,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HdrMetadataInfoframe {
    pub eotf: u8,
    pub metadata_type: u8,
    pub display_primaries: [HdrChromaticity; 3],
    pub white_point: HdrChromaticity,
    pub max_display_mastering_luminance: u16,
    pub min_display_mastering_luminance: u16,
    pub max_cll: u16,
    pub max_fall: u16,
}

/// `struct hdr_output_metadata` from drm_mode.h
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HdrOutputMetadata {
    pub metadata_type: u32,
    pub hdmi_metadata_type1: HdrMetadataInfoframe,
}

impl HdrOutputMetadata {
    pub fn pq(meta: &HdrMetadata) -> Self {
        let chroma = |(x, y): (u16, u16)| HdrChromaticity { x, y };
        Self {
            metadata_type: HDMI_STATIC_METADATA_TYPE1,
            hdmi_metadata_type1: HdrMetadataInfoframe {
                eotf: HDMI_EOTF_SMPTE_ST2084,
                metadata_type: HDMI_STATIC_METADATA_TYPE1 as u8,
                display_primaries: meta.display_primaries.map(chroma),
                white_point: chroma(meta.white_point),
                max_display_mastering_luminance: meta.max_display_luminance,
                min_display_mastering_luminance: meta.min_display_luminance,
                max_cll: meta.max_content_light_level,
                max_fall: meta.max_frame_average_light_level,
            },
        }
    }

    /// Kernel byte layout (little-endian, trailing padding zeroed)
    pub fn to_bytes(&self) -> [u8; 32] {
        let f = &self.hdmi_metadata_type1;
        let mut out = [0u8; 32];
        out[0..4].copy_from_slice(&self.metadata_type.to_le_bytes());
        out[4] = f.eotf;
        out[5] = f.metadata_type;
        let mut words = Vec::with_capacity(12);
        for p in f.display_primaries.iter().chain(std::iter::once(&f.white_point)) {
            words.push(p.x);
            words.push(p.y);
        }
        words.extend([
            f.max_display_mastering_luminance,
            f.min_display_mastering_luminance,
            f.max_cll,
            f.max_fall,
        ]);
        for (i, w) in words.iter().enumerate() {
            out[6 + i * 2..8 + i * 2].copy_from_slice(&w.to_le_bytes());
        }
        out
    }
}

/// Values of the connector `Colorspace` enum property
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectorColorspace {
    Default,
    Bt2020Rgb,
}

impl ConnectorColorspace {
    pub fn property_name(&self) -> &'static str {
        match self {
            Self::Default => "Default",
            Self::Bt2020Rgb => "BT2020_RGB",
        }
    }
}

/// Display-side target for colorimetry commits
pub trait ColorimetrySink {
    fn create_blob(&mut self, data: &[u8]) -> Result<u32>;
    fn commit_colorimetry(&mut self, colorspace: ConnectorColorspace, blob: Option<u32>) -> Result<()>;
    fn destroy_blob(&mut self, blob: u32) -> Result<()>;
}

/// Tracks which HDR blob is live on the connector
#[derive(Debug, Default)]
pub struct HdrController {
    enabled: Option<bool>,
    blob: Option<u32>,
    version: u64,
}

impl HdrController {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled == Some(true)
    }

    /// Bumped each time a commit changes the HDR state
    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn active_blob(&self) -> Option<u32> {
        self.blob
    }

    /// Commit `metadata` (or SDR defaults when `None`). Returns whether
    /// anything was committed.
    pub fn apply(&mut self, sink: &mut dyn ColorimetrySink, metadata: Option<&HdrMetadata>) -> Result<bool> {
        let want = metadata.is_some();
        if self.enabled == Some(want) {
            return Ok(false);
        }

        let new_blob = match metadata {
            Some(meta) => Some(sink.create_blob(&HdrOutputMetadata::pq(meta).to_bytes())?),
            None => None,
        };
        let colorspace = if want { ConnectorColorspace::Bt2020Rgb } else { ConnectorColorspace::Default };

        if let Err(e) = sink.commit_colorimetry(colorspace, new_blob) {
            if let Some(id) = new_blob {
                let _ = sink.destroy_blob(id);
            }
            return Err(e);
        }

        let old = std::mem::replace(&mut self.blob, new_blob);
        if let Some(id) = old {
            if let Err(e) = sink.destroy_blob(id) {
                tracing::warn!("Failed to destroy HDR blob {}: {}", id, e);
            }
        }
        self.enabled = Some(want);
        self.version += 1;
        tracing::info!(hdr = want, version = self.version, "colorimetry committed");
        Ok(true)
    }

    /// Drop the live blob at teardown
    pub fn release(&mut self, sink: &mut dyn ColorimetrySink) {
        if let Some(id) = self.blob.take() {
            let _ = sink.destroy_blob(id);
        }
        self.enabled = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::PipelineError;

    #[derive(Default)]
    struct RecordingSink {
        ops: Vec<String>,
        next: u32,
        fail_commit: bool,
    }

    impl ColorimetrySink for RecordingSink {
        fn create_blob(&mut self, data: &[u8]) -> Result<u32> {
            self.next += 1;
            self.ops.push(format!("create {} ({} bytes)", self.next, data.len()));
            Ok(self.next)
        }

        fn commit_colorimetry(&mut self, colorspace: ConnectorColorspace, blob: Option<u32>) -> Result<()> {
            if self.fail_commit {
                return Err(PipelineError::display("test", "commit rejected"));
            }
            self.ops.push(format!("commit {} {:?}", colorspace.property_name(), blob));
            Ok(())
        }

        fn destroy_blob(&mut self, blob: u32) -> Result<()> {
            self.ops.push(format!("destroy {}", blob));
            Ok(())
        }
    }

    #[test]
    fn test_layout_matches_kernel() {
        assert_eq!(std::mem::size_of::<HdrMetadataInfoframe>(), 26);
        assert_eq!(std::mem::size_of::<HdrOutputMetadata>(), 32);
        let meta = HdrOutputMetadata::pq(&HdrMetadata { max_display_luminance: 1000, ..Default::default() });
        assert_eq!(meta.hdmi_metadata_type1.eotf, HDMI_EOTF_SMPTE_ST2084);
        let bytes = meta.to_bytes();
        assert_eq!(bytes[4], HDMI_EOTF_SMPTE_ST2084);
        // max_display_mastering_luminance follows 4 chromaticity pairs
        assert_eq!(u16::from_le_bytes([bytes[22], bytes[23]]), 1000);
    }

    #[test]
    fn test_blob_created_only_on_toggle() {
        let mut sink = RecordingSink::default();
        let mut hdr = HdrController::new();
        let meta = HdrMetadata::default();

        assert!(hdr.apply(&mut sink, Some(&meta)).unwrap());
        assert!(!hdr.apply(&mut sink, Some(&meta)).unwrap());
        assert!(hdr.apply(&mut sink, None).unwrap());
        assert_eq!(
            sink.ops,
            vec![
                "create 1 (32 bytes)",
                "commit BT2020_RGB Some(1)",
                "commit Default None",
                "destroy 1",
            ]
        );
        assert_eq!(hdr.version(), 2);
        assert_eq!(hdr.active_blob(), None);
    }

    #[test]
    fn test_sdr_default_committed_once() {
        let mut sink = RecordingSink::default();
        let mut hdr = HdrController::new();
        assert!(hdr.apply(&mut sink, None).unwrap());
        assert!(!hdr.apply(&mut sink, None).unwrap());
        assert_eq!(sink.ops, vec!["commit Default None"]);
    }

    #[test]
    fn test_failed_commit_keeps_old_blob() {
        let mut sink = RecordingSink::default();
        let mut hdr = HdrController::new();
        hdr.apply(&mut sink, Some(&HdrMetadata::default())).unwrap();
        sink.fail_commit = true;
        assert!(hdr.apply(&mut sink, None).is_err());
        assert_eq!(hdr.active_blob(), Some(1));
        assert!(hdr.is_enabled());
    }
}
