// COLOR - YUV to RGB matrix selection
//
// The active conversion is a pure function of (colorspace, range):
//
//   rgb = M * (yuv - offsets)
//
// Full range uses the plain inverse of the luma equation. Limited range
// scales the luma column by 255/219 and the chroma columns by 255/224, so
// switching range changes the coefficients and offsets but never which
// matrix entries are zero.

use serde::{Deserialize, Serialize};

use crate::picture::{ColorRange, Colorspace};

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ColorConfig {
    pub colorspace: Colorspace,
    pub range: ColorRange,
    /// Row-major 3x3 YUV -> RGB matrix
    pub matrix: [[f32; 3]; 3],
    /// Normalised (Y, Cb, Cr) values subtracted before the matrix
    pub offsets: [f32; 3],
}

impl ColorConfig {
    pub fn new(colorspace: Colorspace, range: ColorRange) -> Self {
        let (kr, kb) = colorspace.coefficients();
        let kg = 1.0 - kr - kb;

        // R = Y + 2(1-Kr) Cr
        // G = Y - 2Kb(1-Kb)/Kg Cb - 2Kr(1-Kr)/Kg Cr
        // B = Y + 2(1-Kb) Cb
        let cr_r = 2.0 * (1.0 - kr);
        let cb_g = -2.0 * kb * (1.0 - kb) / kg;
        let cr_g = -2.0 * kr * (1.0 - kr) / kg;
        let cb_b = 2.0 * (1.0 - kb);

        let (y_scale, c_scale) = match range {
            ColorRange::Full => (1.0, 1.0),
            ColorRange::Limited => (255.0 / 219.0, 255.0 / 224.0),
        };

        let matrix = [
            [y_scale, 0.0, cr_r * c_scale],
            [y_scale, cb_g * c_scale, cr_g * c_scale],
            [y_scale, cb_b * c_scale, 0.0],
        ];

        let offsets = match range {
            ColorRange::Full => [0.0, 128.0 / 255.0, 128.0 / 255.0],
            ColorRange::Limited => [16.0 / 255.0, 128.0 / 255.0, 128.0 / 255.0],
        };

        Self { colorspace, range, matrix, offsets }
    }

    /// Column-major mat3 padded to vec4 columns, the std140 layout shaders expect
    pub fn std140_matrix(&self) -> [[f32; 4]; 3] {
        let m = &self.matrix;
        [
            [m[0][0], m[1][0], m[2][0], 0.0],
            [m[0][1], m[1][1], m[2][1], 0.0],
            [m[0][2], m[1][2], m[2][2], 0.0],
        ]
    }

    /// Column-major mat3 for glUniformMatrix3fv with transpose = GL_FALSE
    pub fn column_major(&self) -> [f32; 9] {
        let m = &self.matrix;
        [
            m[0][0], m[1][0], m[2][0],
            m[0][1], m[1][1], m[2][1],
            m[0][2], m[1][2], m[2][2],
        ]
    }

    /// Convert one normalised YUV sample (test and debugging aid)
    pub fn apply(&self, yuv: [f32; 3]) -> [f32; 3] {
        let d = [yuv[0] - self.offsets[0], yuv[1] - self.offsets[1], yuv[2] - self.offsets[2]];
        let mut rgb = [0.0; 3];
        for (row, out) in self.matrix.iter().zip(rgb.iter_mut()) {
            *out = row[0] * d[0] + row[1] * d[1] + row[2] * d[2];
        }
        rgb
    }
}

/// Caches the active colour configuration so per-frame calls are free
#[derive(Debug, Default)]
pub struct ColorNegotiator {
    active: Option<ColorConfig>,
}

impl ColorNegotiator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the new configuration only when it differs from the active one
    pub fn update(&mut self, colorspace: Colorspace, range: ColorRange) -> Option<&ColorConfig> {
        let unchanged = self
            .active
            .as_ref()
            .is_some_and(|c| c.colorspace == colorspace && c.range == range);
        if unchanged {
            return None;
        }
        tracing::info!(?colorspace, ?range, "colour configuration changed");
        self.active = Some(ColorConfig::new(colorspace, range));
        self.active.as_ref()
    }

    pub fn active(&self) -> Option<&ColorConfig> {
        self.active.as_ref()
    }

    /// Forget the cache so the next picture re-syncs the renderer
    pub fn invalidate(&mut self) {
        self.active = None;
    }
}
