//! Pipeline error taxonomy.
//!
//! Every failure the pipeline can observe falls into one of four classes:
//!
//! | Class                | Recovery                                        |
//! |----------------------|-------------------------------------------------|
//! | `TransientDecode`    | keyframe request, decoder context reset         |
//! | `Hardware`           | reconfiguration with a reduced capability set   |
//! | `BackendUnavailable` | fatal, session terminates                       |
//! | `ResourceExhausted`  | fatal, invariant violation                      |

use thiserror::Error;

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("Decode failed ({backend}): {reason}")]
    Decode {
        backend: &'static str,
        reason: String,
        /// Failure is tied to the hardware path rather than the bitstream
        hardware: bool,
    },
    #[error("Hardware surface error: {0}")]
    Surface(String),
    #[error("Render backend {backend} failed: {reason}")]
    Render { backend: &'static str, reason: String },
    #[error("Display backend {backend} failed: {reason}")]
    Display { backend: &'static str, reason: String },
    #[error("No usable backend: {0}")]
    BackendUnavailable(String),
    #[error("Resource exhausted: {0}")]
    ResourceExhausted(String),
    #[error("Library load failed: {0}")]
    Library(String),
    #[error("Invalid configuration: {0}")]
    Config(String),
    #[error("Pipeline is shutting down")]
    ShuttingDown,
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Error classes from the recovery point of view
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    TransientDecode,
    Hardware,
    BackendUnavailable,
    ResourceExhausted,
}

impl PipelineError {
    pub fn decode(backend: &'static str, reason: impl Into<String>) -> Self {
        Self::Decode { backend, reason: reason.into(), hardware: false }
    }

    pub fn hw_decode(backend: &'static str, reason: impl Into<String>) -> Self {
        Self::Decode { backend, reason: reason.into(), hardware: true }
    }

    pub fn render(backend: &'static str, reason: impl Into<String>) -> Self {
        Self::Render { backend, reason: reason.into() }
    }

    pub fn display(backend: &'static str, reason: impl Into<String>) -> Self {
        Self::Display { backend, reason: reason.into() }
    }

    pub fn class(&self) -> ErrorClass {
        match self {
            Self::Decode { hardware: false, .. } => ErrorClass::TransientDecode,
            Self::Decode { hardware: true, .. }
            | Self::Surface(_)
            | Self::Render { .. }
            | Self::Display { .. }
            | Self::Io(_) => ErrorClass::Hardware,
            Self::BackendUnavailable(_) | Self::Library(_) | Self::Config(_) => {
                ErrorClass::BackendUnavailable
            }
            Self::ResourceExhausted(_) => ErrorClass::ResourceExhausted,
            Self::ShuttingDown => ErrorClass::TransientDecode,
        }
    }

    /// Fatal errors terminate the streaming session
    pub fn is_fatal(&self) -> bool {
        matches!(
            self.class(),
            ErrorClass::BackendUnavailable | ErrorClass::ResourceExhausted
        )
    }

    /// Failure scoped to the display/render half of the chain
    pub fn is_display_side(&self) -> bool {
        matches!(self, Self::Render { .. } | Self::Display { .. })
    }
}

pub type Result<T> = std::result::Result<T, PipelineError>;

/// `errno` of the last failed libc call, as a `PipelineError::Io`
pub(crate) fn last_os_error() -> PipelineError {
    PipelineError::Io(std::io::Error::last_os_error())
}
