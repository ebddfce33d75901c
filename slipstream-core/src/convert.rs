// CONVERT - CPU YUV to XRGB8888 for scanout buffers
//
// Used when no GPU path exists: the blit renderer converts software
// pictures straight into KMS dumb buffers. Coefficients come from the
// negotiated ColorConfig and are baked into fixed-point lookup tables
// (16.16) once per configuration, one table set per bit depth.
//
// Pictures are scaled nearest-neighbour into the largest rectangle with
// the source aspect ratio; the borders are painted black.

use crate::color::ColorConfig;
use crate::error::{PipelineError, Result};
use crate::picture::{DecodedPicture, PixelFormat, Plane};

// ============================================================================
// Lookup Tables
// ============================================================================

const FIXED_ONE: f32 = 65536.0;

/// Per-sample contributions for one bit depth
struct Tables {
    y: Vec<i32>,
    u_g: Vec<i32>,
    u_b: Vec<i32>,
    v_r: Vec<i32>,
    v_g: Vec<i32>,
}

impl Tables {
    fn build(config: &ColorConfig, bits: u32) -> Self {
        let size = 1usize << bits;
        let max = (size - 1) as f32;
        let m = &config.matrix;
        let [oy, ou, ov] = config.offsets;

        let entry = |coef: f32, offset: f32| -> Vec<i32> {
            (0..size)
                .map(|i| (coef * (i as f32 / max - offset) * 255.0 * FIXED_ONE).round() as i32)
                .collect()
        };

        // the luma column is identical for all three rows
        Self {
            y: entry(m[0][0], oy),
            u_g: entry(m[1][1], ou),
            u_b: entry(m[2][1], ou),
            v_r: entry(m[0][2], ov),
            v_g: entry(m[1][2], ov),
        }
    }

    #[inline]
    fn pixel(&self, y: usize, u: usize, v: usize) -> u32 {
        let luma = self.y[y];
        let r = clamp_fixed(luma + self.v_r[v]);
        let g = clamp_fixed(luma + self.u_g[u] + self.v_g[v]);
        let b = clamp_fixed(luma + self.u_b[u]);
        0xff00_0000 | r << 16 | g << 8 | b
    }
}

#[inline]
fn clamp_fixed(value: i32) -> u32 {
    ((value + 0x8000) >> 16).clamp(0, 255) as u32
}

// ============================================================================
// Scaling
// ============================================================================

/// Destination rectangle and nearest-neighbour source indices
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScaleMap {
    pub key: (u32, u32, u32, u32),
    pub x0: usize,
    pub y0: usize,
    pub x_map: Vec<usize>,
    pub y_map: Vec<usize>,
}

impl ScaleMap {
    /// Fit `src` inside `dst`, keeping the aspect ratio
    pub fn new(src_w: u32, src_h: u32, dst_w: u32, dst_h: u32) -> Self {
        let (sw, sh, dw, dh) = (src_w as u64, src_h as u64, dst_w as u64, dst_h as u64);
        let (fit_w, fit_h) = if sw == 0 || sh == 0 || dw == 0 || dh == 0 {
            (0, 0)
        } else if dw * sh <= dh * sw {
            (dw, (dw * sh / sw).max(1))
        } else {
            ((dh * sw / sh).max(1), dh)
        };
        let x0 = ((dw - fit_w) / 2) as usize;
        let y0 = ((dh - fit_h) / 2) as usize;

        let x_map = (0..fit_w).map(|x| ((x * sw / fit_w) as usize).min(src_w as usize - 1)).collect();
        let y_map = (0..fit_h).map(|y| ((y * sh / fit_h) as usize).min(src_h as usize - 1)).collect();

        Self { key: (src_w, src_h, dst_w, dst_h), x0, y0, x_map, y_map }
    }
}

// ============================================================================
// Converter
// ============================================================================

pub struct XrgbConverter {
    config: ColorConfig,
    tables8: Tables,
    tables10: Tables,
    scale: Option<ScaleMap>,
}

#[inline]
fn sample8(plane: &Plane, x: usize, y: usize) -> usize {
    plane.data[y * plane.stride + x] as usize
}

#[inline]
fn sample16(plane: &Plane, x: usize, y: usize) -> u16 {
    let i = y * plane.stride + x * 2;
    u16::from_le_bytes([plane.data[i], plane.data[i + 1]])
}

impl XrgbConverter {
    pub fn new(config: &ColorConfig) -> Self {
        Self {
            config: *config,
            tables8: Tables::build(config, 8),
            tables10: Tables::build(config, 10),
            scale: None,
        }
    }

    pub fn config(&self) -> &ColorConfig {
        &self.config
    }

    pub fn set_config(&mut self, config: &ColorConfig) {
        if *config == self.config {
            return;
        }
        *self = Self { scale: self.scale.take(), ..Self::new(config) };
    }

    /// Convert `picture` into an XRGB8888 buffer of `dst_w` x `dst_h`
    pub fn convert(
        &mut self,
        picture: &DecodedPicture,
        dst: &mut [u8],
        dst_pitch: usize,
        dst_w: u32,
        dst_h: u32,
    ) -> Result<()> {
        if picture.is_hardware() || picture.format == PixelFormat::Hardware {
            return Err(PipelineError::render("blit", "cannot convert a hardware surface on the CPU"));
        }
        if picture.planes.len() < picture.format.plane_count() {
            return Err(PipelineError::render("blit", "picture is missing planes"));
        }
        if dst_pitch < dst_w as usize * 4 || dst.len() < dst_pitch * dst_h as usize {
            return Err(PipelineError::render("blit", "destination buffer too small"));
        }

        let key = (picture.width, picture.height, dst_w, dst_h);
        if self.scale.as_ref().map_or(true, |s| s.key != key) {
            self.scale = Some(ScaleMap::new(picture.width, picture.height, dst_w, dst_h));
        }
        let Some(scale) = self.scale.as_ref() else {
            return Ok(());
        };

        let format = picture.format;
        let subsampled = !format.is_444();
        let planes = &picture.planes;

        for dy in 0..dst_h as usize {
            let row = &mut dst[dy * dst_pitch..dy * dst_pitch + dst_w as usize * 4];
            let inside = dy >= scale.y0 && dy < scale.y0 + scale.y_map.len();
            if !inside {
                fill_black(row);
                continue;
            }
            let sy = scale.y_map[dy - scale.y0];
            let cy = if subsampled { sy / 2 } else { sy };

            for (dx, px) in row.chunks_exact_mut(4).enumerate() {
                let value = match dx.checked_sub(scale.x0).and_then(|i| scale.x_map.get(i)) {
                    None => 0xff00_0000,
                    Some(&sx) => {
                        let cx = if subsampled { sx / 2 } else { sx };
                        match format {
                            PixelFormat::Yuv420p | PixelFormat::Yuv444p => self.tables8.pixel(
                                sample8(&planes[0], sx, sy),
                                sample8(&planes[1], cx, cy),
                                sample8(&planes[2], cx, cy),
                            ),
                            PixelFormat::Nv12 | PixelFormat::Nv24 => self.tables8.pixel(
                                sample8(&planes[0], sx, sy),
                                sample8(&planes[1], cx * 2, cy),
                                sample8(&planes[1], cx * 2 + 1, cy),
                            ),
                            // most-significant-bit aligned
                            PixelFormat::P010 => self.tables10.pixel(
                                (sample16(&planes[0], sx, sy) >> 6) as usize,
                                (sample16(&planes[1], cx * 2, cy) >> 6) as usize,
                                (sample16(&planes[1], cx * 2 + 1, cy) >> 6) as usize,
                            ),
                            PixelFormat::Yuv444p10 => self.tables10.pixel(
                                (sample16(&planes[0], sx, sy) & 0x3ff) as usize,
                                (sample16(&planes[1], cx, cy) & 0x3ff) as usize,
                                (sample16(&planes[2], cx, cy) & 0x3ff) as usize,
                            ),
                            PixelFormat::Hardware => 0xff00_0000,
                        }
                    }
                };
                px.copy_from_slice(&value.to_le_bytes());
            }
        }
        Ok(())
    }
}

fn fill_black(row: &mut [u8]) {
    for px in row.chunks_exact_mut(4) {
        px.copy_from_slice(&0xff00_0000u32.to_le_bytes());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::picture::{ColorRange, Colorspace};

    fn solid(format: PixelFormat, w: u32, h: u32, y: u8, u: u8, v: u8) -> DecodedPicture {
        let mut pic = DecodedPicture::allocate(format, w, h);
        match format {
            PixelFormat::Yuv420p | PixelFormat::Yuv444p => {
                pic.planes[0].data.fill(y);
                pic.planes[1].data.fill(u);
                pic.planes[2].data.fill(v);
            }
            PixelFormat::Nv12 => {
                pic.planes[0].data.fill(y);
                for pair in pic.planes[1].data.chunks_exact_mut(2) {
                    pair.copy_from_slice(&[u, v]);
                }
            }
            _ => unreachable!(),
        }
        pic
    }

    fn pixel(buf: &[u8], pitch: usize, x: usize, y: usize) -> (u8, u8, u8) {
        let i = y * pitch + x * 4;
        (buf[i + 2], buf[i + 1], buf[i])
    }

    #[test]
    fn test_limited_range_black_and_white() {
        let config = ColorConfig::new(Colorspace::Bt709, ColorRange::Limited);
        let mut conv = XrgbConverter::new(&config);
        let mut buf = vec![0u8; 8 * 8 * 4];

        conv.convert(&solid(PixelFormat::Yuv420p, 8, 8, 16, 128, 128), &mut buf, 32, 8, 8).unwrap();
        assert_eq!(pixel(&buf, 32, 3, 3), (0, 0, 0));

        conv.convert(&solid(PixelFormat::Yuv420p, 8, 8, 235, 128, 128), &mut buf, 32, 8, 8).unwrap();
        assert_eq!(pixel(&buf, 32, 3, 3), (255, 255, 255));
        assert_eq!(buf[3], 0xff);
    }

    #[test]
    fn test_range_changes_output() {
        let limited = ColorConfig::new(Colorspace::Bt709, ColorRange::Limited);
        let full = ColorConfig::new(Colorspace::Bt709, ColorRange::Full);
        let pic = solid(PixelFormat::Nv12, 4, 4, 128, 128, 128);
        let mut buf = vec![0u8; 4 * 4 * 4];

        let mut conv = XrgbConverter::new(&full);
        conv.convert(&pic, &mut buf, 16, 4, 4).unwrap();
        let (r_full, _, _) = pixel(&buf, 16, 0, 0);

        conv.set_config(&limited);
        conv.convert(&pic, &mut buf, 16, 4, 4).unwrap();
        let (r_limited, _, _) = pixel(&buf, 16, 0, 0);

        assert_eq!(r_full, 128);
        assert!(r_limited > r_full);
    }

    #[test]
    fn test_red_chroma() {
        let config = ColorConfig::new(Colorspace::Bt601, ColorRange::Full);
        let mut conv = XrgbConverter::new(&config);
        let mut buf = vec![0u8; 4 * 4 * 4];
        conv.convert(&solid(PixelFormat::Yuv444p, 4, 4, 76, 85, 255), &mut buf, 16, 4, 4).unwrap();
        let (r, g, b) = pixel(&buf, 16, 1, 1);
        assert!(r > 250 && g < 5 && b < 5, "got {:?}", (r, g, b));
    }

    #[test]
    fn test_letterbox_keeps_aspect() {
        let map = ScaleMap::new(16, 9, 16, 16);
        assert_eq!(map.x_map.len(), 16);
        assert_eq!(map.y_map.len(), 9);
        assert_eq!(map.y0, 3);

        let config = ColorConfig::new(Colorspace::Bt709, ColorRange::Full);
        let mut conv = XrgbConverter::new(&config);
        let pic = solid(PixelFormat::Yuv420p, 16, 9, 255, 128, 128);
        let mut buf = vec![0x55u8; 16 * 16 * 4];
        conv.convert(&pic, &mut buf, 64, 16, 16).unwrap();
        assert_eq!(pixel(&buf, 64, 0, 0), (0, 0, 0));
        assert_eq!(pixel(&buf, 64, 8, 8), (255, 255, 255));
        assert_eq!(pixel(&buf, 64, 0, 15), (0, 0, 0));
    }

    #[test]
    fn test_pillarbox() {
        let map = ScaleMap::new(4, 4, 8, 4);
        assert_eq!((map.x0, map.y0), (2, 0));
        assert_eq!(map.x_map, vec![0, 1, 2, 3]);
    }

    #[test]
    fn test_p010_uses_high_bits() {
        let config = ColorConfig::new(Colorspace::Bt2020, ColorRange::Full);
        let mut conv = XrgbConverter::new(&config);
        let mut pic = DecodedPicture::allocate(PixelFormat::P010, 2, 2);
        for px in pic.planes[0].data.chunks_exact_mut(2) {
            px.copy_from_slice(&(1023u16 << 6).to_le_bytes());
        }
        for px in pic.planes[1].data.chunks_exact_mut(2) {
            px.copy_from_slice(&(512u16 << 6).to_le_bytes());
        }
        let mut buf = vec![0u8; 2 * 2 * 4];
        conv.convert(&pic, &mut buf, 8, 2, 2).unwrap();
        let (r, g, b) = pixel(&buf, 8, 1, 1);
        assert!(r >= 254 && g >= 254 && b >= 254);
    }

    #[test]
    fn test_small_destination_rejected() {
        let config = ColorConfig::new(Colorspace::Bt709, ColorRange::Full);
        let mut conv = XrgbConverter::new(&config);
        let pic = solid(PixelFormat::Yuv420p, 4, 4, 0, 128, 128);
        let mut buf = vec![0u8; 10];
        assert!(conv.convert(&pic, &mut buf, 16, 4, 4).is_err());
    }
}
