//! # Decoded Pictures
//!
//! One decoder output. Pictures are allocated once, as part of the ring's
//! fixed pool, and refilled in place for the lifetime of the pipeline:
//!
//! ```text
//! ┌──────────┐ fill ┌───────────────┐ draw ┌──────────┐
//! │ Decoder  │─────►│DecodedPicture │─────►│ Renderer │
//! └──────────┘      │  (ring slot)  │      └──────────┘
//!                   └───────────────┘
//! ```
//!
//! A picture either carries CPU plane buffers (software decode) or a
//! reference to a decoder-owned hardware surface.

use std::fmt;
use std::time::Instant;

use serde::{Deserialize, Serialize};

use crate::surface::HwSurface;

// ============================================================================
// Pixel Formats
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PixelFormat {
    /// 8-bit planar 4:2:0
    Yuv420p,
    /// 8-bit planar 4:4:4
    Yuv444p,
    /// 8-bit semi-planar 4:2:0
    Nv12,
    /// 8-bit semi-planar 4:4:4
    Nv24,
    /// 10-bit semi-planar 4:2:0 (16-bit little-endian containers)
    P010,
    /// 10-bit planar 4:4:4 (16-bit little-endian containers)
    Yuv444p10,
    /// Opaque decoder-owned surface
    Hardware,
}

impl PixelFormat {
    pub fn plane_count(&self) -> usize {
        match self {
            Self::Yuv420p | Self::Yuv444p | Self::Yuv444p10 => 3,
            Self::Nv12 | Self::Nv24 | Self::P010 => 2,
            Self::Hardware => 0,
        }
    }

    pub fn is_444(&self) -> bool {
        matches!(self, Self::Yuv444p | Self::Nv24 | Self::Yuv444p10)
    }

    pub fn is_10bit(&self) -> bool {
        matches!(self, Self::P010 | Self::Yuv444p10)
    }

    pub fn is_semi_planar(&self) -> bool {
        matches!(self, Self::Nv12 | Self::Nv24 | Self::P010)
    }

    fn bytes_per_sample(&self) -> usize {
        if self.is_10bit() { 2 } else { 1 }
    }

    /// (row bytes, rows) of a plane for a picture of `width` x `height`
    pub fn plane_size(&self, plane: usize, width: u32, height: u32) -> (usize, usize) {
        let w = width as usize;
        let h = height as usize;
        let bps = self.bytes_per_sample();
        if plane == 0 {
            return (w * bps, h);
        }
        let (cw, ch) = if self.is_444() { (w, h) } else { (w.div_ceil(2), h.div_ceil(2)) };
        if self.is_semi_planar() {
            // interleaved Cb/Cr
            (cw * 2 * bps, ch)
        } else {
            (cw * bps, ch)
        }
    }

    /// Equivalent 4:2:0 format when 4:4:4 cannot be honoured
    pub fn to_420(&self) -> Self {
        match self {
            Self::Yuv444p => Self::Yuv420p,
            Self::Nv24 => Self::Nv12,
            Self::Yuv444p10 => Self::P010,
            other => *other,
        }
    }
}

// ============================================================================
// Color Description
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Colorspace {
    Bt601,
    Bt709,
    Bt2020,
}

impl Colorspace {
    /// Luma coefficients (Kr, Kb); Kg = 1 - Kr - Kb
    pub fn coefficients(&self) -> (f32, f32) {
        match self {
            Self::Bt601 => (0.299, 0.114),
            Self::Bt709 => (0.2126, 0.0722),
            Self::Bt2020 => (0.2627, 0.0593),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ColorRange {
    Limited,
    Full,
}

// ============================================================================
// Planes
// ============================================================================

/// One CPU plane buffer
#[derive(Debug, Clone, Default)]
pub struct Plane {
    pub data: Vec<u8>,
    /// Bytes per row in `data`
    pub stride: usize,
    /// Meaningful bytes per row (<= stride)
    pub row_bytes: usize,
    pub rows: usize,
}

impl Plane {
    fn allocate(row_bytes: usize, rows: usize) -> Self {
        // 64-byte rows keep GPU uploads on their fast path
        let stride = row_bytes.next_multiple_of(64);
        Self { data: vec![0u8; stride * rows], stride, row_bytes, rows }
    }

    /// Copy `rows` rows of `row_bytes` out of a strided source
    pub fn copy_from(&mut self, src: &[u8], src_stride: usize) -> bool {
        if self.rows == 0 {
            return true;
        }
        if src_stride < self.row_bytes || src.len() < src_stride * (self.rows - 1) + self.row_bytes {
            return false;
        }
        for row in 0..self.rows {
            let s = &src[row * src_stride..row * src_stride + self.row_bytes];
            let d = row * self.stride;
            self.data[d..d + self.row_bytes].copy_from_slice(s);
        }
        true
    }

    pub fn row(&self, index: usize) -> &[u8] {
        let start = index * self.stride;
        &self.data[start..start + self.row_bytes]
    }
}

// ============================================================================
// Decoded Picture
// ============================================================================

pub struct DecodedPicture {
    pub width: u32,
    pub height: u32,
    pub format: PixelFormat,
    pub colorspace: Colorspace,
    pub range: ColorRange,
    /// CPU planes, empty for hardware pictures
    pub planes: Vec<Plane>,
    /// Decoder-owned surface, set only for hardware pictures
    pub surface: Option<HwSurface>,
    /// Decode order, monotonically increasing per session
    pub sequence: u64,
    pub keyframe: bool,
    /// When the access unit entered the decoder
    pub submitted_at: Option<Instant>,
}

impl DecodedPicture {
    /// Pre-allocate a picture able to hold `format` at `width` x `height`
    pub fn allocate(format: PixelFormat, width: u32, height: u32) -> Self {
        let planes = (0..format.plane_count())
            .map(|i| {
                let (row_bytes, rows) = format.plane_size(i, width, height);
                Plane::allocate(row_bytes, rows)
            })
            .collect();
        Self {
            width,
            height,
            format,
            colorspace: Colorspace::Bt709,
            range: ColorRange::Limited,
            planes,
            surface: None,
            sequence: 0,
            keyframe: false,
            submitted_at: None,
        }
    }

    pub fn is_hardware(&self) -> bool {
        self.surface.is_some()
    }

    /// Drop per-frame state, keeping plane allocations
    pub fn reset(&mut self) {
        self.surface = None;
        self.keyframe = false;
        self.submitted_at = None;
    }

    /// Re-shape the plane pool when a decoder reports a different layout.
    /// Only happens at (re)initialisation, never per frame.
    pub fn reshape(&mut self, format: PixelFormat, width: u32, height: u32) {
        if self.format == format && self.width == width && self.height == height {
            return;
        }
        *self = Self { sequence: self.sequence, ..Self::allocate(format, width, height) };
    }

    /// Exchange pixel buffers and their shape with `other`
    pub fn swap_contents(&mut self, other: &mut DecodedPicture) {
        std::mem::swap(&mut self.width, &mut other.width);
        std::mem::swap(&mut self.height, &mut other.height);
        std::mem::swap(&mut self.format, &mut other.format);
        std::mem::swap(&mut self.planes, &mut other.planes);
    }
}

impl fmt::Debug for DecodedPicture {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DecodedPicture")
            .field("width", &self.width)
            .field("height", &self.height)
            .field("format", &self.format)
            .field("colorspace", &self.colorspace)
            .field("range", &self.range)
            .field("sequence", &self.sequence)
            .field("hardware", &self.is_hardware())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plane_layout() {
        let pic = DecodedPicture::allocate(PixelFormat::Yuv420p, 1920, 1080);
        assert_eq!(pic.planes.len(), 3);
        assert_eq!(pic.planes[0].row_bytes, 1920);
        assert_eq!(pic.planes[1].row_bytes, 960);
        assert_eq!(pic.planes[1].rows, 540);

        let nv12 = DecodedPicture::allocate(PixelFormat::Nv12, 1280, 720);
        assert_eq!(nv12.planes.len(), 2);
        assert_eq!(nv12.planes[1].row_bytes, 1280);
        assert_eq!(nv12.planes[1].rows, 360);

        let p010 = PixelFormat::P010.plane_size(0, 100, 10);
        assert_eq!(p010, (200, 10));
        assert_eq!(PixelFormat::Yuv444p.plane_size(2, 64, 64), (64, 64));
    }

    #[test]
    fn test_odd_dimensions_round_up_chroma() {
        assert_eq!(PixelFormat::Yuv420p.plane_size(1, 11, 7), (6, 4));
    }

    #[test]
    fn test_strided_copy() {
        let mut plane = Plane::allocate(4, 2);
        let src = [1, 2, 3, 4, 0, 0, 5, 6, 7, 8];
        assert!(plane.copy_from(&src, 6));
        assert_eq!(plane.row(0), &[1, 2, 3, 4]);
        assert_eq!(plane.row(1), &[5, 6, 7, 8]);
        assert!(!plane.copy_from(&src[..5], 6));
    }

    #[test]
    fn test_swap_keeps_shape_with_buffers() {
        let mut a = DecodedPicture::allocate(PixelFormat::Yuv420p, 32, 16);
        let mut b = DecodedPicture::allocate(PixelFormat::Yuv444p, 8, 8);
        a.sequence = 7;
        a.swap_contents(&mut b);
        assert_eq!(a.format, PixelFormat::Yuv444p);
        assert_eq!(a.planes[1].rows, 8);
        assert_eq!(b.width, 32);
        assert_eq!(b.planes[0].row_bytes, 32);
        assert_eq!(a.sequence, 7);
    }

    #[test]
    fn test_444_downgrade() {
        assert_eq!(PixelFormat::Yuv444p.to_420(), PixelFormat::Yuv420p);
        assert_eq!(PixelFormat::Nv24.to_420(), PixelFormat::Nv12);
        assert_eq!(PixelFormat::Nv12.to_420(), PixelFormat::Nv12);
    }
}
