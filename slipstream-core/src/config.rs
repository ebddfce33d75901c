//! Pipeline configuration.
//!
//! Loaded from JSON (all fields optional, defaults below) and overlaid by
//! the client's command line.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{PipelineError, Result};
use crate::platform::{DisplayKind, RenderKind};

pub const MIN_RING_SIZE: usize = 2;
pub const MAX_RING_SIZE: usize = 8;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Decoded-picture slots shared by the decode and render stages
    pub ring_size: usize,
    /// Try hardware decoders (only used if the render path can show their surfaces)
    pub hardware_decode: bool,
    /// Request 4:4:4 chroma
    pub yuv444: bool,
    /// Decoder thread hint, 0 = let the decoder decide
    pub decoder_threads: u32,
    /// Pending access units before a backlog warning is raised
    pub backlog_warn_threshold: usize,
    /// Consecutive decode failures before a failure counts as persistent
    pub persistent_failure_threshold: u32,
    /// Reinitialisations allowed before the session is declared fatal
    pub max_reinit_attempts: u32,
    /// Force a display backend instead of probing
    pub display: Option<DisplayKind>,
    /// Force a render backend instead of probing
    pub render: Option<RenderKind>,
    /// DRM device for the headless display backend
    pub drm_device: PathBuf,
    /// Allow decode and present on the same thread when the backend supports it
    pub allow_direct: bool,
    pub vsync: bool,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            ring_size: 3,
            hardware_decode: true,
            yuv444: false,
            decoder_threads: 0,
            backlog_warn_threshold: 13,
            persistent_failure_threshold: 3,
            max_reinit_attempts: 3,
            display: None,
            render: None,
            drm_device: PathBuf::from("/dev/dri/card0"),
            allow_direct: true,
            vsync: true,
        }
    }
}

impl PipelineConfig {
    /// Read a JSON configuration file
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&text)
            .map_err(|e| PipelineError::Config(format!("{}: {}", path.display(), e)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if !(MIN_RING_SIZE..=MAX_RING_SIZE).contains(&self.ring_size) {
            return Err(PipelineError::Config(format!(
                "ring_size {} outside {}..={}",
                self.ring_size, MIN_RING_SIZE, MAX_RING_SIZE
            )));
        }
        if self.persistent_failure_threshold == 0 {
            return Err(PipelineError::Config("persistent_failure_threshold must be >= 1".into()));
        }
        if let (Some(display), Some(render)) = (self.display, self.render) {
            if !display.supported_renders().contains(&render) {
                return Err(PipelineError::Config(format!(
                    "render backend {:?} cannot draw on display {:?}",
                    render, display
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults_are_valid() {
        let config = PipelineConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.ring_size, 3);
        assert_eq!(config.backlog_warn_threshold, 13);
    }

    #[test]
    fn test_load_partial_json() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{ "ring_size": 2, "yuv444": true, "render": "Blit" }}"#).unwrap();
        let config = PipelineConfig::load(file.path()).unwrap();
        assert_eq!(config.ring_size, 2);
        assert!(config.yuv444);
        assert_eq!(config.render, Some(RenderKind::Blit));
        assert!(config.hardware_decode);
    }

    #[test]
    fn test_rejects_bad_ring_size() {
        let config = PipelineConfig { ring_size: 1, ..Default::default() };
        assert!(config.validate().is_err());
        let config = PipelineConfig { ring_size: 64, ..Default::default() };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_rejects_incompatible_pair() {
        let config = PipelineConfig {
            display: Some(DisplayKind::Window),
            render: Some(RenderKind::DrmDirect),
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }
}
