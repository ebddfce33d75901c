//! # Slipstream Core
//!
//! Decode-to-display pipeline of a remote rendering client: access units
//! in, pictures on screen, with hardware decode and zero-copy display
//! wherever the platform allows it.

// ============================================================================
// Foundations
// ============================================================================
pub mod error;
pub mod config;
pub mod picture;
pub mod network;
pub mod bitstream;
pub(crate) mod ioctl;

// ============================================================================
// Decoding
// ============================================================================
pub mod decoder;
pub mod surface;

// ============================================================================
// Colour
// ============================================================================
pub mod color;
pub mod hdr;
pub mod convert;

// ============================================================================
// Display / Render Backends
// ============================================================================
pub mod platform;

// ============================================================================
// Pipeline
// ============================================================================
pub mod ring;
pub mod pipeline;
pub mod recovery;
pub mod session;
pub mod signal;

#[cfg(test)]
mod testing;

pub use error::{PipelineError, Result};
pub use session::{Session, SessionStatus};

// ============================================================================
// Version
// ============================================================================
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
