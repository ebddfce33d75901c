//! OpenGL ES 2 renderer over EGL.
//!
//! Draws into the client's window. Software pictures are uploaded plane
//! by plane; hardware pictures are imported through the surface bridge as
//! one EGLImage per plane and sampled as external textures. YUV -> RGB
//! happens in the fragment shader with the negotiated matrix.
//!
//! The hardware frame on screen stays imported until the next swap
//! replaces it, then goes back to the decoder.

use std::ffi::{c_void, CString};
use std::ptr;
use std::sync::Arc;

use raw_window_handle::HasWindowHandle;
use winit::window::Window;

use super::egl::{self, *};
use super::{DisplayBackend, RenderBackend, RenderCaps, RenderInit, RenderKind};
use crate::color::ColorConfig;
use crate::error::{PipelineError, Result};
use crate::picture::{ColorRange, Colorspace, DecodedPicture, PixelFormat, Plane};
use crate::surface::{ImportedSurface, SurfaceBridge};

// ============================================================================
// Shaders
// ============================================================================

const VERTEX_SHADER: &str = r#"
attribute vec2 a_pos;
attribute vec2 a_tex;
uniform vec2 u_scale_y;
uniform vec2 u_scale_c;
varying vec2 v_tex_y;
varying vec2 v_tex_c;
void main() {
    gl_Position = vec4(a_pos, 0.0, 1.0);
    v_tex_y = a_tex * u_scale_y;
    v_tex_c = a_tex * u_scale_c;
}
"#;

const FRAGMENT_PLANAR: &str = r#"
precision mediump float;
varying vec2 v_tex_y;
varying vec2 v_tex_c;
uniform sampler2D s_0;
uniform sampler2D s_1;
uniform sampler2D s_2;
uniform mat3 u_matrix;
uniform vec3 u_offset;
void main() {
    vec3 yuv = vec3(texture2D(s_0, v_tex_y).r, texture2D(s_1, v_tex_c).r, texture2D(s_2, v_tex_c).r);
    gl_FragColor = vec4(u_matrix * (yuv - u_offset), 1.0);
}
"#;

const FRAGMENT_SEMI_PLANAR: &str = r#"
precision mediump float;
varying vec2 v_tex_y;
varying vec2 v_tex_c;
uniform sampler2D s_0;
uniform sampler2D s_1;
uniform mat3 u_matrix;
uniform vec3 u_offset;
void main() {
    vec3 yuv = vec3(texture2D(s_0, v_tex_y).r, texture2D(s_1, v_tex_c).ra);
    gl_FragColor = vec4(u_matrix * (yuv - u_offset), 1.0);
}
"#;

const FRAGMENT_EXTERNAL: &str = r#"
#extension GL_OES_EGL_image_external : require
precision mediump float;
varying vec2 v_tex_y;
varying vec2 v_tex_c;
uniform samplerExternalOES s_0;
uniform samplerExternalOES s_1;
uniform mat3 u_matrix;
uniform vec3 u_offset;
void main() {
    vec3 yuv = vec3(texture2D(s_0, v_tex_y).r, texture2D(s_1, v_tex_c).rg);
    gl_FragColor = vec4(u_matrix * (yuv - u_offset), 1.0);
}
"#;

/// Interleaved (x, y, u, v) triangle strip covering the viewport
const QUAD: [f32; 16] = [
    -1.0, -1.0, 0.0, 1.0, //
    1.0, -1.0, 1.0, 1.0, //
    -1.0, 1.0, 0.0, 0.0, //
    1.0, 1.0, 1.0, 0.0,
];

const ATTRIB_POS: GLuint = 0;
const ATTRIB_TEX: GLuint = 1;

// ============================================================================
// Upload Layout
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ProgramKind {
    Planar = 0,
    SemiPlanar = 1,
    External = 2,
}

/// GL upload format and bytes per texel for each plane of a software picture
fn software_layout(format: PixelFormat) -> Option<(ProgramKind, &'static [(GLenum, usize)])> {
    const PLANAR: &[(GLenum, usize)] = &[(GL_LUMINANCE, 1), (GL_LUMINANCE, 1), (GL_LUMINANCE, 1)];
    const SEMI: &[(GLenum, usize)] = &[(GL_LUMINANCE, 1), (GL_LUMINANCE_ALPHA, 2)];
    match format {
        PixelFormat::Yuv420p | PixelFormat::Yuv444p => Some((ProgramKind::Planar, PLANAR)),
        PixelFormat::Nv12 | PixelFormat::Nv24 => Some((ProgramKind::SemiPlanar, SEMI)),
        // GLES2 has no portable 16-bit texture upload
        PixelFormat::P010 | PixelFormat::Yuv444p10 | PixelFormat::Hardware => None,
    }
}

/// Texture width covering the whole stride, and the horizontal texcoord
/// scale that hides the padding
fn padded_width(plane: &Plane, texel_bytes: usize) -> (usize, f32) {
    let width = plane.stride / texel_bytes;
    let scale = if plane.stride == 0 { 1.0 } else { plane.row_bytes as f32 / plane.stride as f32 };
    (width, scale)
}

// ============================================================================
// GL State
// ============================================================================

struct Program {
    id: GLuint,
    u_matrix: GLint,
    u_offset: GLint,
    u_scale_y: GLint,
    u_scale_c: GLint,
}

/// Everything created on the render thread
struct GlState {
    native: NativeWindow,
    context: EGLContext,
    surface: EGLSurface,
    programs: Vec<Program>,
    textures: [GLuint; 3],
    external: [GLuint; 2],
    size: (u32, u32),
}

pub struct GlesRenderer {
    conn: EglDisplayConnection,
    gl: &'static GlesLibrary,
    window: Arc<Window>,
    caps: RenderCaps,
    state: Option<GlState>,
    color: ColorConfig,
    bridge: SurfaceBridge,
    importer: Option<EglImporter>,
    current: Option<ImportedSurface<EglPlaneImage>>,
}

// EGL and GL handles are only touched from the thread that ran init
unsafe impl Send for GlesRenderer {}

impl GlesRenderer {
    /// Probe EGL on the display's native connection
    pub fn create(display: &mut dyn DisplayBackend) -> Result<Self> {
        let window = display
            .window()
            .ok_or_else(|| PipelineError::BackendUnavailable("gles needs a window".into()))?;
        let handle = display
            .display_handle()
            .ok_or_else(|| PipelineError::BackendUnavailable("gles needs a display connection".into()))?;

        let conn = EglDisplayConnection::open(handle)?;
        let gl = egl::load_gles()?;

        let mut caps = RenderCaps::YUV444;
        if conn.can_import_dmabuf() {
            caps |= RenderCaps::HW_SURFACES;
        } else {
            tracing::info!("EGL lacks DMA-BUF import, gles renderer limited to software pictures");
        }

        Ok(Self {
            conn,
            gl,
            window,
            caps,
            state: None,
            color: ColorConfig::new(Colorspace::Bt709, ColorRange::Limited),
            bridge: SurfaceBridge::new(),
            importer: None,
            current: None,
        })
    }

    fn compile(&self, kind: GLenum, source: &str) -> Result<GLuint> {
        let gl = self.gl;
        let src = CString::new(source).map_err(|_| PipelineError::render("gles", "shader source has NUL"))?;
        unsafe {
            let shader = (gl.create_shader)(kind);
            let ptrs = [src.as_ptr()];
            (gl.shader_source)(shader, 1, ptrs.as_ptr(), ptr::null());
            (gl.compile_shader)(shader);
            let mut ok = 0;
            (gl.get_shader_iv)(shader, GL_COMPILE_STATUS, &mut ok);
            if ok == 0 {
                let mut log = vec![0u8; 1024];
                let mut len = 0;
                (gl.get_shader_info_log)(shader, log.len() as GLsizei, &mut len, log.as_mut_ptr().cast());
                (gl.delete_shader)(shader);
                log.truncate(len.max(0) as usize);
                return Err(PipelineError::render(
                    "gles",
                    format!("shader compile failed: {}", String::from_utf8_lossy(&log)),
                ));
            }
            Ok(shader)
        }
    }

    fn link(&self, fragment: &str, samplers: usize) -> Result<Program> {
        let gl = self.gl;
        let vs = self.compile(GL_VERTEX_SHADER, VERTEX_SHADER)?;
        let fs = match self.compile(GL_FRAGMENT_SHADER, fragment) {
            Ok(fs) => fs,
            Err(e) => {
                unsafe { (gl.delete_shader)(vs) };
                return Err(e);
            }
        };
        unsafe {
            let id = (gl.create_program)();
            (gl.attach_shader)(id, vs);
            (gl.attach_shader)(id, fs);
            (gl.bind_attrib_location)(id, ATTRIB_POS, c"a_pos".as_ptr());
            (gl.bind_attrib_location)(id, ATTRIB_TEX, c"a_tex".as_ptr());
            (gl.link_program)(id);
            (gl.delete_shader)(vs);
            (gl.delete_shader)(fs);
            let mut ok = 0;
            (gl.get_program_iv)(id, GL_LINK_STATUS, &mut ok);
            if ok == 0 {
                (gl.delete_program)(id);
                return Err(PipelineError::render("gles", "program link failed"));
            }

            (gl.use_program)(id);
            for unit in 0..samplers {
                let name = CString::new(format!("s_{}", unit)).unwrap_or_default();
                let loc = (gl.get_uniform_location)(id, name.as_ptr());
                (gl.uniform_1i)(loc, unit as GLint);
            }
            Ok(Program {
                id,
                u_matrix: (gl.get_uniform_location)(id, c"u_matrix".as_ptr()),
                u_offset: (gl.get_uniform_location)(id, c"u_offset".as_ptr()),
                u_scale_y: (gl.get_uniform_location)(id, c"u_scale_y".as_ptr()),
                u_scale_c: (gl.get_uniform_location)(id, c"u_scale_c".as_ptr()),
            })
        }
    }

    fn gen_textures(&self, target: GLenum, names: &mut [GLuint]) {
        let gl = self.gl;
        unsafe {
            (gl.gen_textures)(names.len() as GLsizei, names.as_mut_ptr());
            for &tex in names.iter() {
                (gl.bind_texture)(target, tex);
                (gl.tex_parameter_i)(target, GL_TEXTURE_MIN_FILTER, GL_LINEAR);
                (gl.tex_parameter_i)(target, GL_TEXTURE_MAG_FILTER, GL_LINEAR);
                (gl.tex_parameter_i)(target, GL_TEXTURE_WRAP_S, GL_CLAMP_TO_EDGE);
                (gl.tex_parameter_i)(target, GL_TEXTURE_WRAP_T, GL_CLAMP_TO_EDGE);
            }
        }
    }

    fn create_surface(&self, native: &mut NativeWindow, vsync: bool) -> Result<(EGLContext, EGLSurface)> {
        let egl = self.conn.egl;
        let dpy = self.conn.display;
        let config_attribs = [
            EGL_SURFACE_TYPE,
            EGL_WINDOW_BIT,
            EGL_RENDERABLE_TYPE,
            EGL_OPENGL_ES2_BIT,
            EGL_RED_SIZE,
            8,
            EGL_GREEN_SIZE,
            8,
            EGL_BLUE_SIZE,
            8,
            EGL_NONE,
        ];
        let context_attribs = [EGL_CONTEXT_CLIENT_VERSION, 2, EGL_NONE];

        unsafe {
            if (egl.bind_api)(EGL_OPENGL_ES_API) == EGL_FALSE {
                return Err(PipelineError::render("gles", "eglBindAPI(GLES) failed"));
            }
            let mut config: EGLConfig = ptr::null_mut();
            let mut count = 0;
            if (egl.choose_config)(dpy, config_attribs.as_ptr(), &mut config, 1, &mut count) == EGL_FALSE
                || count == 0
            {
                return Err(PipelineError::render("gles", "no EGL config for a GLES2 window"));
            }
            let context = (egl.create_context)(dpy, config, ptr::null_mut(), context_attribs.as_ptr());
            if context.is_null() {
                return Err(PipelineError::render(
                    "gles",
                    format!("eglCreateContext failed: 0x{:x}", (egl.get_error)()),
                ));
            }
            let surface =
                (self.conn.ext.create_platform_window_surface)(dpy, config, native.as_ptr(), ptr::null());
            if surface.is_null() {
                (egl.destroy_context)(dpy, context);
                return Err(PipelineError::render(
                    "gles",
                    format!("window surface creation failed: 0x{:x}", (egl.get_error)()),
                ));
            }
            if (egl.make_current)(dpy, surface, surface, context) == EGL_FALSE {
                (egl.destroy_surface)(dpy, surface);
                (egl.destroy_context)(dpy, context);
                return Err(PipelineError::render("gles", "eglMakeCurrent failed"));
            }
            (egl.swap_interval)(dpy, vsync as EGLint);
            Ok((context, surface))
        }
    }

    fn release_current(&mut self) {
        if let (Some(held), Some(importer)) = (self.current.take(), self.importer.as_mut()) {
            self.bridge.release(importer, held);
        }
    }

    fn set_uniforms(&self, program: &Program, scale_y: f32, scale_c: f32) {
        let gl = self.gl;
        let matrix = self.color.column_major();
        unsafe {
            (gl.use_program)(program.id);
            (gl.uniform_matrix_3fv)(program.u_matrix, 1, GL_FALSE, matrix.as_ptr());
            (gl.uniform_3fv)(program.u_offset, 1, self.color.offsets.as_ptr());
            (gl.uniform_2f)(program.u_scale_y, scale_y, 1.0);
            (gl.uniform_2f)(program.u_scale_c, scale_c, 1.0);
        }
    }

    fn upload_software(&self, picture: &DecodedPicture) -> Result<ProgramKind> {
        let gl = self.gl;
        let state = self.state.as_ref().ok_or_else(|| PipelineError::render("gles", "draw before init"))?;
        let (kind, layout) = software_layout(picture.format).ok_or_else(|| {
            PipelineError::render("gles", format!("{:?} pictures are not supported", picture.format))
        })?;
        if picture.planes.len() < layout.len() {
            return Err(PipelineError::render("gles", "picture is missing planes"));
        }

        let mut scales = [1.0f32; 2];
        unsafe {
            (gl.pixel_store_i)(GL_UNPACK_ALIGNMENT, 1);
            for (i, (&(format, texel), plane)) in layout.iter().zip(&picture.planes).enumerate() {
                let (width, scale) = padded_width(plane, texel);
                scales[i.min(1)] = scale;
                (gl.active_texture)(GL_TEXTURE0 + i as GLenum);
                (gl.bind_texture)(GL_TEXTURE_2D, state.textures[i]);
                (gl.tex_image_2d)(
                    GL_TEXTURE_2D,
                    0,
                    format as GLint,
                    width as GLsizei,
                    plane.rows as GLsizei,
                    0,
                    format,
                    GL_UNSIGNED_BYTE,
                    plane.data.as_ptr().cast(),
                );
            }
        }
        self.set_uniforms(&state.programs[kind as usize], scales[0], scales[1]);
        Ok(kind)
    }

    fn bind_external(&self, imported: &ImportedSurface<EglPlaneImage>) -> Result<()> {
        let gl = self.gl;
        let state = self.state.as_ref().ok_or_else(|| PipelineError::render("gles", "draw before init"))?;
        let target_texture = self
            .conn
            .ext
            .image_target_texture
            .ok_or_else(|| PipelineError::render("gles", "glEGLImageTargetTexture2DOES missing"))?;
        unsafe {
            for (i, image) in imported.images().iter().take(2).enumerate() {
                (gl.active_texture)(GL_TEXTURE0 + i as GLenum);
                (gl.bind_texture)(GL_TEXTURE_EXTERNAL_OES, state.external[i]);
                target_texture(GL_TEXTURE_EXTERNAL_OES, image.0);
            }
        }
        self.set_uniforms(&state.programs[ProgramKind::External as usize], 1.0, 1.0);
        Ok(())
    }

    fn follow_window_size(&mut self) {
        let size = self.window.inner_size();
        let gl = self.gl;
        if let Some(state) = self.state.as_mut() {
            if state.size != (size.width, size.height) && size.width > 0 && size.height > 0 {
                state.native.resize(size.width, size.height);
                state.size = (size.width, size.height);
                unsafe { (gl.viewport)(0, 0, size.width as GLsizei, size.height as GLsizei) };
            }
        }
    }

    fn draw_quad_and_swap(&self) -> Result<()> {
        let gl = self.gl;
        let state = self.state.as_ref().ok_or_else(|| PipelineError::render("gles", "draw before init"))?;
        unsafe {
            (gl.clear_color)(0.0, 0.0, 0.0, 1.0);
            (gl.clear)(GL_COLOR_BUFFER_BIT);
            let stride = (4 * std::mem::size_of::<f32>()) as GLsizei;
            let base = QUAD.as_ptr();
            (gl.vertex_attrib_pointer)(ATTRIB_POS, 2, GL_FLOAT, GL_FALSE, stride, base.cast::<c_void>());
            (gl.vertex_attrib_pointer)(ATTRIB_TEX, 2, GL_FLOAT, GL_FALSE, stride, base.add(2).cast::<c_void>());
            (gl.enable_vertex_attrib_array)(ATTRIB_POS);
            (gl.enable_vertex_attrib_array)(ATTRIB_TEX);
            (gl.draw_arrays)(GL_TRIANGLE_STRIP, 0, 4);

            let err = (gl.get_error)();
            if err != GL_NO_ERROR {
                return Err(PipelineError::render("gles", format!("GL error 0x{:x}", err)));
            }
            if (self.conn.egl.swap_buffers)(self.conn.display, state.surface) == EGL_FALSE {
                return Err(PipelineError::render(
                    "gles",
                    format!("eglSwapBuffers failed: 0x{:x}", (self.conn.egl.get_error)()),
                ));
            }
        }
        Ok(())
    }
}

impl RenderBackend for GlesRenderer {
    fn kind(&self) -> RenderKind {
        RenderKind::Gles
    }

    fn caps(&self) -> RenderCaps {
        self.caps
    }

    fn init(&mut self, _display: &mut dyn DisplayBackend, info: &RenderInit) -> Result<()> {
        if self.state.is_some() {
            return Ok(());
        }
        let handle = self
            .window
            .window_handle()
            .map_err(|e| PipelineError::render("gles", format!("no window handle: {}", e)))?
            .as_raw();
        let size = self.window.inner_size();
        let (w, h) = if size.width > 0 && size.height > 0 { (size.width, size.height) } else { (info.width, info.height) };

        let mut native = NativeWindow::new(handle, w, h)?;
        let (context, surface) = self.create_surface(&mut native, info.vsync)?;

        let mut programs = Vec::with_capacity(3);
        let sources = [(FRAGMENT_PLANAR, 3), (FRAGMENT_SEMI_PLANAR, 2), (FRAGMENT_EXTERNAL, 2)];
        for (i, (source, samplers)) in sources.into_iter().enumerate() {
            // the external program only matters when surfaces can be imported
            if i == ProgramKind::External as usize && !self.caps.contains(RenderCaps::HW_SURFACES) {
                programs.push(Program { id: 0, u_matrix: -1, u_offset: -1, u_scale_y: -1, u_scale_c: -1 });
                continue;
            }
            match self.link(source, samplers) {
                Ok(p) => programs.push(p),
                Err(e) if i == ProgramKind::External as usize => {
                    tracing::warn!("external texture program unavailable: {}", e);
                    self.caps.remove(RenderCaps::HW_SURFACES);
                    programs.push(Program { id: 0, u_matrix: -1, u_offset: -1, u_scale_y: -1, u_scale_c: -1 });
                }
                Err(e) => return Err(e),
            }
        }

        let mut textures = [0; 3];
        self.gen_textures(GL_TEXTURE_2D, &mut textures);
        let mut external = [0; 2];
        if self.caps.contains(RenderCaps::HW_SURFACES) {
            self.gen_textures(GL_TEXTURE_EXTERNAL_OES, &mut external);
        }
        unsafe { (self.gl.viewport)(0, 0, w as GLsizei, h as GLsizei) };

        if self.caps.contains(RenderCaps::HW_SURFACES) {
            if let (Some(create_image), Some(destroy_image)) =
                (self.conn.ext.create_image, self.conn.ext.destroy_image)
            {
                self.importer = Some(EglImporter {
                    egl: self.conn.egl,
                    display: self.conn.display,
                    create_image,
                    destroy_image,
                    modifiers: self.conn.ext.dma_buf_modifiers,
                });
            }
        }
        self.bridge = info.bridge.clone();
        self.state = Some(GlState { native, context, surface, programs, textures, external, size: (w, h) });
        tracing::info!(width = w, height = h, hw = self.importer.is_some(), "gles renderer ready");
        Ok(())
    }

    fn sync_config(&mut self, config: &ColorConfig) -> Result<()> {
        self.color = *config;
        Ok(())
    }

    fn draw(&mut self, picture: &mut DecodedPicture, _display: &mut dyn DisplayBackend) -> Result<usize> {
        self.follow_window_size();

        if picture.is_hardware() {
            let importer = self
                .importer
                .as_mut()
                .ok_or_else(|| PipelineError::render("gles", "hardware picture without DMA-BUF import"))?;
            let exported = self.bridge.export(picture)?;
            let imported = self.bridge.import(importer, exported)?;
            if let Err(e) = self.bind_external(&imported).and_then(|_| self.draw_quad_and_swap()) {
                if let Some(importer) = self.importer.as_mut() {
                    self.bridge.release(importer, imported);
                }
                return Err(e);
            }
            // the swapped-out frame is no longer scanned out
            self.release_current();
            self.current = Some(imported);
        } else {
            self.upload_software(picture)?;
            self.draw_quad_and_swap()?;
            self.release_current();
        }
        Ok(0)
    }

    fn destroy(&mut self, _display: &mut dyn DisplayBackend) {
        self.release_current();
        self.importer = None;
        let Some(state) = self.state.take() else {
            return;
        };
        let gl = self.gl;
        let egl = self.conn.egl;
        let dpy = self.conn.display;
        unsafe {
            for program in &state.programs {
                if program.id != 0 {
                    (gl.delete_program)(program.id);
                }
            }
            (gl.delete_textures)(state.textures.len() as GLsizei, state.textures.as_ptr());
            if state.external[0] != 0 {
                (gl.delete_textures)(state.external.len() as GLsizei, state.external.as_ptr());
            }
            (egl.make_current)(dpy, ptr::null_mut(), ptr::null_mut(), ptr::null_mut());
            (egl.destroy_surface)(dpy, state.surface);
            (egl.destroy_context)(dpy, state.context);
            (egl.release_thread)();
        }
        drop(state.native);
        tracing::debug!("gles renderer destroyed");
    }
}

impl Drop for GlesRenderer {
    fn drop(&mut self) {
        if self.state.is_some() || self.current.is_some() {
            tracing::warn!("gles renderer dropped without destroy");
            self.release_current();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_software_layouts() {
        let (kind, planes) = software_layout(PixelFormat::Yuv420p).unwrap();
        assert_eq!(kind, ProgramKind::Planar);
        assert_eq!(planes.len(), 3);

        let (kind, planes) = software_layout(PixelFormat::Nv24).unwrap();
        assert_eq!(kind, ProgramKind::SemiPlanar);
        assert_eq!(planes[1], (GL_LUMINANCE_ALPHA, 2));

        assert!(software_layout(PixelFormat::P010).is_none());
        assert!(software_layout(PixelFormat::Hardware).is_none());
    }

    #[test]
    fn test_padding_is_hidden_by_texcoord_scale() {
        let picture = DecodedPicture::allocate(PixelFormat::Nv12, 100, 50);
        // luma: 100 bytes in a 128 byte stride
        let (width, scale) = padded_width(&picture.planes[0], 1);
        assert_eq!(width, 128);
        assert!((scale - 100.0 / 128.0).abs() < 1e-6);
        // chroma: 50 Cb/Cr pairs in a 128 byte stride
        let (width, scale) = padded_width(&picture.planes[1], 2);
        assert_eq!(width, 64);
        assert!((scale - 100.0 / 128.0).abs() < 1e-6);
    }

    #[test]
    fn test_quad_covers_viewport() {
        let xs: Vec<f32> = QUAD.chunks(4).map(|v| v[0]).collect();
        let ys: Vec<f32> = QUAD.chunks(4).map(|v| v[1]).collect();
        assert_eq!(xs.iter().cloned().fold(f32::MAX, f32::min), -1.0);
        assert_eq!(ys.iter().cloned().fold(f32::MIN, f32::max), 1.0);
    }
}
