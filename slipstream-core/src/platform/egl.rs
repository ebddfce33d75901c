// EGL / GLES - Runtime-loaded graphics libraries (Linux)
//
// libEGL, libGLESv2 and libwayland-egl are loaded with libloading the
// first time a GLES renderer is probed, so the binary has no link-time
// dependency on any GPU stack. Extension entry points (image import,
// platform displays) come from eglGetProcAddress.
//
// Also owns the DMA-BUF -> EGLImage attribute building, which needs to
// know whether EGL_EXT_image_dma_buf_import_modifiers is available.

#![allow(non_camel_case_types, non_upper_case_globals)]

use std::ffi::{c_char, c_void, CStr};
use std::ptr;
use std::sync::OnceLock;

use raw_window_handle::{RawDisplayHandle, RawWindowHandle};

use crate::error::{PipelineError, Result};
use crate::surface::{GpuImporter, SurfaceDescriptor, DRM_FORMAT_NV12, DRM_FORMAT_NV24, DRM_FORMAT_P010, fourcc};

// ============================================================================
// Types
// ============================================================================

pub type EGLDisplay = *mut c_void;
pub type EGLConfig = *mut c_void;
pub type EGLContext = *mut c_void;
pub type EGLSurface = *mut c_void;
pub type EGLImageKHR = *mut c_void;
pub type EGLint = i32;
pub type EGLBoolean = u32;
pub type EGLenum = u32;

pub type GLuint = u32;
pub type GLint = i32;
pub type GLenum = u32;
pub type GLsizei = i32;
pub type GLfloat = f32;
pub type GLboolean = u8;
pub type GLbitfield = u32;

// ============================================================================
// Constants
// ============================================================================

pub const EGL_FALSE: EGLBoolean = 0;
pub const EGL_NONE: EGLint = 0x3038;
pub const EGL_SUCCESS: EGLint = 0x3000;
pub const EGL_EXTENSIONS: EGLint = 0x3055;
pub const EGL_SURFACE_TYPE: EGLint = 0x3033;
pub const EGL_WINDOW_BIT: EGLint = 0x0004;
pub const EGL_RENDERABLE_TYPE: EGLint = 0x3040;
pub const EGL_OPENGL_ES2_BIT: EGLint = 0x0004;
pub const EGL_RED_SIZE: EGLint = 0x3024;
pub const EGL_GREEN_SIZE: EGLint = 0x3023;
pub const EGL_BLUE_SIZE: EGLint = 0x3022;
pub const EGL_CONTEXT_CLIENT_VERSION: EGLint = 0x3098;
pub const EGL_OPENGL_ES_API: EGLenum = 0x30A0;
pub const EGL_WIDTH: EGLint = 0x3057;
pub const EGL_HEIGHT: EGLint = 0x3056;

pub const EGL_PLATFORM_X11_KHR: EGLenum = 0x31D5;
pub const EGL_PLATFORM_WAYLAND_KHR: EGLenum = 0x31D8;

pub const EGL_LINUX_DMA_BUF_EXT: EGLenum = 0x3270;
pub const EGL_LINUX_DRM_FOURCC_EXT: EGLint = 0x3271;
pub const EGL_DMA_BUF_PLANE0_FD_EXT: EGLint = 0x3272;
pub const EGL_DMA_BUF_PLANE0_OFFSET_EXT: EGLint = 0x3273;
pub const EGL_DMA_BUF_PLANE0_PITCH_EXT: EGLint = 0x3274;
pub const EGL_DMA_BUF_PLANE0_MODIFIER_LO_EXT: EGLint = 0x3443;
pub const EGL_DMA_BUF_PLANE0_MODIFIER_HI_EXT: EGLint = 0x3444;

pub const GL_VERTEX_SHADER: GLenum = 0x8B31;
pub const GL_FRAGMENT_SHADER: GLenum = 0x8B30;
pub const GL_COMPILE_STATUS: GLenum = 0x8B81;
pub const GL_LINK_STATUS: GLenum = 0x8B82;
pub const GL_TEXTURE_2D: GLenum = 0x0DE1;
pub const GL_TEXTURE_EXTERNAL_OES: GLenum = 0x8D65;
pub const GL_TEXTURE0: GLenum = 0x84C0;
pub const GL_TEXTURE_MIN_FILTER: GLenum = 0x2801;
pub const GL_TEXTURE_MAG_FILTER: GLenum = 0x2800;
pub const GL_TEXTURE_WRAP_S: GLenum = 0x2802;
pub const GL_TEXTURE_WRAP_T: GLenum = 0x2803;
pub const GL_LINEAR: GLint = 0x2601;
pub const GL_CLAMP_TO_EDGE: GLint = 0x812F;
pub const GL_LUMINANCE: GLenum = 0x1909;
pub const GL_LUMINANCE_ALPHA: GLenum = 0x190A;
pub const GL_UNSIGNED_BYTE: GLenum = 0x1401;
pub const GL_UNPACK_ALIGNMENT: GLenum = 0x0CF5;
pub const GL_COLOR_BUFFER_BIT: GLbitfield = 0x4000;
pub const GL_TRIANGLE_STRIP: GLenum = 0x0005;
pub const GL_FLOAT: GLenum = 0x1406;
pub const GL_FALSE: GLboolean = 0;
pub const GL_NO_ERROR: GLenum = 0;

/// Single-channel and two-channel plane formats for per-plane import
pub const DRM_FORMAT_R8: u32 = fourcc(b"R8  ");
pub const DRM_FORMAT_GR88: u32 = fourcc(b"GR88");
pub const DRM_FORMAT_R16: u32 = fourcc(b"R16 ");
pub const DRM_FORMAT_GR1616: u32 = fourcc(b"GR32");

// ============================================================================
// Function Types
// ============================================================================

type EglGetProcAddressFn = unsafe extern "C" fn(*const c_char) -> *mut c_void;
type EglInitializeFn = unsafe extern "C" fn(EGLDisplay, *mut EGLint, *mut EGLint) -> EGLBoolean;
type EglTerminateFn = unsafe extern "C" fn(EGLDisplay) -> EGLBoolean;
type EglBindApiFn = unsafe extern "C" fn(EGLenum) -> EGLBoolean;
type EglChooseConfigFn = unsafe extern "C" fn(EGLDisplay, *const EGLint, *mut EGLConfig, EGLint, *mut EGLint) -> EGLBoolean;
type EglCreateContextFn = unsafe extern "C" fn(EGLDisplay, EGLConfig, EGLContext, *const EGLint) -> EGLContext;
type EglDestroyContextFn = unsafe extern "C" fn(EGLDisplay, EGLContext) -> EGLBoolean;
type EglDestroySurfaceFn = unsafe extern "C" fn(EGLDisplay, EGLSurface) -> EGLBoolean;
type EglMakeCurrentFn = unsafe extern "C" fn(EGLDisplay, EGLSurface, EGLSurface, EGLContext) -> EGLBoolean;
type EglSwapBuffersFn = unsafe extern "C" fn(EGLDisplay, EGLSurface) -> EGLBoolean;
type EglSwapIntervalFn = unsafe extern "C" fn(EGLDisplay, EGLint) -> EGLBoolean;
type EglQueryStringFn = unsafe extern "C" fn(EGLDisplay, EGLint) -> *const c_char;
type EglGetErrorFn = unsafe extern "C" fn() -> EGLint;
type EglReleaseThreadFn = unsafe extern "C" fn() -> EGLBoolean;

type EglGetPlatformDisplayExtFn = unsafe extern "C" fn(EGLenum, *mut c_void, *const EGLint) -> EGLDisplay;
type EglCreatePlatformWindowSurfaceExtFn = unsafe extern "C" fn(EGLDisplay, EGLConfig, *mut c_void, *const EGLint) -> EGLSurface;
type EglCreateImageKhrFn = unsafe extern "C" fn(EGLDisplay, EGLContext, EGLenum, *mut c_void, *const EGLint) -> EGLImageKHR;
type EglDestroyImageKhrFn = unsafe extern "C" fn(EGLDisplay, EGLImageKHR) -> EGLBoolean;
type GlEglImageTargetTexture2dOesFn = unsafe extern "C" fn(GLenum, *mut c_void);

type GlCreateShaderFn = unsafe extern "C" fn(GLenum) -> GLuint;
type GlShaderSourceFn = unsafe extern "C" fn(GLuint, GLsizei, *const *const c_char, *const GLint);
type GlCompileShaderFn = unsafe extern "C" fn(GLuint);
type GlGetShaderivFn = unsafe extern "C" fn(GLuint, GLenum, *mut GLint);
type GlGetShaderInfoLogFn = unsafe extern "C" fn(GLuint, GLsizei, *mut GLsizei, *mut c_char);
type GlDeleteShaderFn = unsafe extern "C" fn(GLuint);
type GlCreateProgramFn = unsafe extern "C" fn() -> GLuint;
type GlAttachShaderFn = unsafe extern "C" fn(GLuint, GLuint);
type GlBindAttribLocationFn = unsafe extern "C" fn(GLuint, GLuint, *const c_char);
type GlLinkProgramFn = unsafe extern "C" fn(GLuint);
type GlGetProgramivFn = unsafe extern "C" fn(GLuint, GLenum, *mut GLint);
type GlDeleteProgramFn = unsafe extern "C" fn(GLuint);
type GlUseProgramFn = unsafe extern "C" fn(GLuint);
type GlGetUniformLocationFn = unsafe extern "C" fn(GLuint, *const c_char) -> GLint;
type GlUniform1iFn = unsafe extern "C" fn(GLint, GLint);
type GlUniform2fFn = unsafe extern "C" fn(GLint, GLfloat, GLfloat);
type GlUniform3fvFn = unsafe extern "C" fn(GLint, GLsizei, *const GLfloat);
type GlUniformMatrix3fvFn = unsafe extern "C" fn(GLint, GLsizei, GLboolean, *const GLfloat);
type GlGenTexturesFn = unsafe extern "C" fn(GLsizei, *mut GLuint);
type GlDeleteTexturesFn = unsafe extern "C" fn(GLsizei, *const GLuint);
type GlBindTextureFn = unsafe extern "C" fn(GLenum, GLuint);
type GlActiveTextureFn = unsafe extern "C" fn(GLenum);
type GlTexParameteriFn = unsafe extern "C" fn(GLenum, GLenum, GLint);
type GlTexImage2dFn = unsafe extern "C" fn(GLenum, GLint, GLint, GLsizei, GLsizei, GLint, GLenum, GLenum, *const c_void);
type GlPixelStoreiFn = unsafe extern "C" fn(GLenum, GLint);
type GlViewportFn = unsafe extern "C" fn(GLint, GLint, GLsizei, GLsizei);
type GlClearColorFn = unsafe extern "C" fn(GLfloat, GLfloat, GLfloat, GLfloat);
type GlClearFn = unsafe extern "C" fn(GLbitfield);
type GlEnableVertexAttribArrayFn = unsafe extern "C" fn(GLuint);
type GlVertexAttribPointerFn = unsafe extern "C" fn(GLuint, GLint, GLenum, GLboolean, GLsizei, *const c_void);
type GlDrawArraysFn = unsafe extern "C" fn(GLenum, GLint, GLsizei);
type GlGetErrorFn = unsafe extern "C" fn() -> GLenum;

type WlEglWindowCreateFn = unsafe extern "C" fn(*mut c_void, i32, i32) -> *mut c_void;
type WlEglWindowDestroyFn = unsafe extern "C" fn(*mut c_void);
type WlEglWindowResizeFn = unsafe extern "C" fn(*mut c_void, i32, i32, i32, i32);

// ============================================================================
// Loaded Libraries
// ============================================================================

pub struct EglLibrary {
    _lib: libloading::Library,
    pub get_proc_address: EglGetProcAddressFn,
    pub initialize: EglInitializeFn,
    pub terminate: EglTerminateFn,
    pub bind_api: EglBindApiFn,
    pub choose_config: EglChooseConfigFn,
    pub create_context: EglCreateContextFn,
    pub destroy_context: EglDestroyContextFn,
    pub destroy_surface: EglDestroySurfaceFn,
    pub make_current: EglMakeCurrentFn,
    pub swap_buffers: EglSwapBuffersFn,
    pub swap_interval: EglSwapIntervalFn,
    pub query_string: EglQueryStringFn,
    pub get_error: EglGetErrorFn,
    pub release_thread: EglReleaseThreadFn,
}

pub struct GlesLibrary {
    _lib: libloading::Library,
    pub create_shader: GlCreateShaderFn,
    pub shader_source: GlShaderSourceFn,
    pub compile_shader: GlCompileShaderFn,
    pub get_shader_iv: GlGetShaderivFn,
    pub get_shader_info_log: GlGetShaderInfoLogFn,
    pub delete_shader: GlDeleteShaderFn,
    pub create_program: GlCreateProgramFn,
    pub attach_shader: GlAttachShaderFn,
    pub bind_attrib_location: GlBindAttribLocationFn,
    pub link_program: GlLinkProgramFn,
    pub get_program_iv: GlGetProgramivFn,
    pub delete_program: GlDeleteProgramFn,
    pub use_program: GlUseProgramFn,
    pub get_uniform_location: GlGetUniformLocationFn,
    pub uniform_1i: GlUniform1iFn,
    pub uniform_2f: GlUniform2fFn,
    pub uniform_3fv: GlUniform3fvFn,
    pub uniform_matrix_3fv: GlUniformMatrix3fvFn,
    pub gen_textures: GlGenTexturesFn,
    pub delete_textures: GlDeleteTexturesFn,
    pub bind_texture: GlBindTextureFn,
    pub active_texture: GlActiveTextureFn,
    pub tex_parameter_i: GlTexParameteriFn,
    pub tex_image_2d: GlTexImage2dFn,
    pub pixel_store_i: GlPixelStoreiFn,
    pub viewport: GlViewportFn,
    pub clear_color: GlClearColorFn,
    pub clear: GlClearFn,
    pub enable_vertex_attrib_array: GlEnableVertexAttribArrayFn,
    pub vertex_attrib_pointer: GlVertexAttribPointerFn,
    pub draw_arrays: GlDrawArraysFn,
    pub get_error: GlGetErrorFn,
}

pub struct WaylandEglLibrary {
    _lib: libloading::Library,
    pub window_create: WlEglWindowCreateFn,
    pub window_destroy: WlEglWindowDestroyFn,
    pub window_resize: WlEglWindowResizeFn,
}

// Function pointers into process-global libraries
unsafe impl Send for EglLibrary {}
unsafe impl Sync for EglLibrary {}
unsafe impl Send for GlesLibrary {}
unsafe impl Sync for GlesLibrary {}
unsafe impl Send for WaylandEglLibrary {}
unsafe impl Sync for WaylandEglLibrary {}

static EGL_LIB: OnceLock<Option<EglLibrary>> = OnceLock::new();
static GLES_LIB: OnceLock<Option<GlesLibrary>> = OnceLock::new();
static WAYLAND_EGL_LIB: OnceLock<Option<WaylandEglLibrary>> = OnceLock::new();

fn open_first(names: &[&str]) -> Option<libloading::Library> {
    for name in names {
        match unsafe { libloading::Library::new(name) } {
            Ok(lib) => return Some(lib),
            Err(e) => tracing::debug!("Failed to load {}: {}", name, e),
        }
    }
    None
}

pub fn load_egl() -> Result<&'static EglLibrary> {
    EGL_LIB
        .get_or_init(|| unsafe {
            let lib = open_first(&["libEGL.so.1", "libEGL.so"])?;
            let egl = EglLibrary {
                get_proc_address: *lib.get(b"eglGetProcAddress\0").ok()?,
                initialize: *lib.get(b"eglInitialize\0").ok()?,
                terminate: *lib.get(b"eglTerminate\0").ok()?,
                bind_api: *lib.get(b"eglBindAPI\0").ok()?,
                choose_config: *lib.get(b"eglChooseConfig\0").ok()?,
                create_context: *lib.get(b"eglCreateContext\0").ok()?,
                destroy_context: *lib.get(b"eglDestroyContext\0").ok()?,
                destroy_surface: *lib.get(b"eglDestroySurface\0").ok()?,
                make_current: *lib.get(b"eglMakeCurrent\0").ok()?,
                swap_buffers: *lib.get(b"eglSwapBuffers\0").ok()?,
                swap_interval: *lib.get(b"eglSwapInterval\0").ok()?,
                query_string: *lib.get(b"eglQueryString\0").ok()?,
                get_error: *lib.get(b"eglGetError\0").ok()?,
                release_thread: *lib.get(b"eglReleaseThread\0").ok()?,
                _lib: lib,
            };
            tracing::info!("EGL library loaded successfully");
            Some(egl)
        })
        .as_ref()
        .ok_or_else(|| PipelineError::Library("libEGL not available".into()))
}

pub fn load_gles() -> Result<&'static GlesLibrary> {
    GLES_LIB
        .get_or_init(|| unsafe {
            let lib = open_first(&["libGLESv2.so.2", "libGLESv2.so"])?;
            let gl = GlesLibrary {
                create_shader: *lib.get(b"glCreateShader\0").ok()?,
                shader_source: *lib.get(b"glShaderSource\0").ok()?,
                compile_shader: *lib.get(b"glCompileShader\0").ok()?,
                get_shader_iv: *lib.get(b"glGetShaderiv\0").ok()?,
                get_shader_info_log: *lib.get(b"glGetShaderInfoLog\0").ok()?,
                delete_shader: *lib.get(b"glDeleteShader\0").ok()?,
                create_program: *lib.get(b"glCreateProgram\0").ok()?,
                attach_shader: *lib.get(b"glAttachShader\0").ok()?,
                bind_attrib_location: *lib.get(b"glBindAttribLocation\0").ok()?,
                link_program: *lib.get(b"glLinkProgram\0").ok()?,
                get_program_iv: *lib.get(b"glGetProgramiv\0").ok()?,
                delete_program: *lib.get(b"glDeleteProgram\0").ok()?,
                use_program: *lib.get(b"glUseProgram\0").ok()?,
                get_uniform_location: *lib.get(b"glGetUniformLocation\0").ok()?,
                uniform_1i: *lib.get(b"glUniform1i\0").ok()?,
                uniform_2f: *lib.get(b"glUniform2f\0").ok()?,
                uniform_3fv: *lib.get(b"glUniform3fv\0").ok()?,
                uniform_matrix_3fv: *lib.get(b"glUniformMatrix3fv\0").ok()?,
                gen_textures: *lib.get(b"glGenTextures\0").ok()?,
                delete_textures: *lib.get(b"glDeleteTextures\0").ok()?,
                bind_texture: *lib.get(b"glBindTexture\0").ok()?,
                active_texture: *lib.get(b"glActiveTexture\0").ok()?,
                tex_parameter_i: *lib.get(b"glTexParameteri\0").ok()?,
                tex_image_2d: *lib.get(b"glTexImage2D\0").ok()?,
                pixel_store_i: *lib.get(b"glPixelStorei\0").ok()?,
                viewport: *lib.get(b"glViewport\0").ok()?,
                clear_color: *lib.get(b"glClearColor\0").ok()?,
                clear: *lib.get(b"glClear\0").ok()?,
                enable_vertex_attrib_array: *lib.get(b"glEnableVertexAttribArray\0").ok()?,
                vertex_attrib_pointer: *lib.get(b"glVertexAttribPointer\0").ok()?,
                draw_arrays: *lib.get(b"glDrawArrays\0").ok()?,
                get_error: *lib.get(b"glGetError\0").ok()?,
                _lib: lib,
            };
            tracing::info!("GLESv2 library loaded successfully");
            Some(gl)
        })
        .as_ref()
        .ok_or_else(|| PipelineError::Library("libGLESv2 not available".into()))
}

pub fn load_wayland_egl() -> Result<&'static WaylandEglLibrary> {
    WAYLAND_EGL_LIB
        .get_or_init(|| unsafe {
            let lib = open_first(&["libwayland-egl.so.1", "libwayland-egl.so"])?;
            Some(WaylandEglLibrary {
                window_create: *lib.get(b"wl_egl_window_create\0").ok()?,
                window_destroy: *lib.get(b"wl_egl_window_destroy\0").ok()?,
                window_resize: *lib.get(b"wl_egl_window_resize\0").ok()?,
                _lib: lib,
            })
        })
        .as_ref()
        .ok_or_else(|| PipelineError::Library("libwayland-egl not available".into()))
}

// ============================================================================
// Display Connection
// ============================================================================

/// Extension entry points resolved through eglGetProcAddress
#[derive(Clone, Copy)]
pub struct EglExtensions {
    pub create_platform_window_surface: EglCreatePlatformWindowSurfaceExtFn,
    pub create_image: Option<EglCreateImageKhrFn>,
    pub destroy_image: Option<EglDestroyImageKhrFn>,
    pub image_target_texture: Option<GlEglImageTargetTexture2dOesFn>,
    pub dma_buf_import: bool,
    pub dma_buf_modifiers: bool,
}

unsafe fn proc_address<T: Copy>(egl: &EglLibrary, name: &CStr) -> Option<T> {
    let ptr = (egl.get_proc_address)(name.as_ptr());
    if ptr.is_null() {
        None
    } else {
        Some(std::mem::transmute_copy::<*mut c_void, T>(&ptr))
    }
}

/// An initialised EGLDisplay on a native display connection
pub struct EglDisplayConnection {
    pub egl: &'static EglLibrary,
    pub display: EGLDisplay,
    pub platform: EGLenum,
    pub ext: EglExtensions,
}

impl EglDisplayConnection {
    pub fn open(handle: RawDisplayHandle) -> Result<Self> {
        let egl = load_egl()?;
        let (platform, native) = match handle {
            RawDisplayHandle::Wayland(h) => (EGL_PLATFORM_WAYLAND_KHR, h.display.as_ptr()),
            RawDisplayHandle::Xlib(h) => match h.display {
                Some(d) => (EGL_PLATFORM_X11_KHR, d.as_ptr()),
                None => return Err(PipelineError::render("gles", "Xlib handle without display")),
            },
            other => {
                return Err(PipelineError::BackendUnavailable(format!(
                    "EGL does not support display {:?}",
                    other
                )))
            }
        };

        unsafe {
            let get_platform_display: EglGetPlatformDisplayExtFn =
                proc_address(egl, c"eglGetPlatformDisplayEXT")
                    .ok_or_else(|| PipelineError::render("gles", "eglGetPlatformDisplayEXT missing"))?;
            let create_platform_window_surface: EglCreatePlatformWindowSurfaceExtFn =
                proc_address(egl, c"eglCreatePlatformWindowSurfaceEXT")
                    .ok_or_else(|| PipelineError::render("gles", "eglCreatePlatformWindowSurfaceEXT missing"))?;

            let display = get_platform_display(platform, native, ptr::null());
            if display.is_null() {
                return Err(PipelineError::render("gles", "eglGetPlatformDisplayEXT returned no display"));
            }
            let (mut major, mut minor) = (0, 0);
            if (egl.initialize)(display, &mut major, &mut minor) == EGL_FALSE {
                return Err(PipelineError::render(
                    "gles",
                    format!("eglInitialize failed: 0x{:x}", (egl.get_error)()),
                ));
            }

            let extensions = {
                let raw = (egl.query_string)(display, EGL_EXTENSIONS);
                if raw.is_null() {
                    String::new()
                } else {
                    CStr::from_ptr(raw).to_string_lossy().into_owned()
                }
            };
            let has = |name: &str| extensions.split_ascii_whitespace().any(|e| e == name);

            let ext = EglExtensions {
                create_platform_window_surface,
                create_image: proc_address(egl, c"eglCreateImageKHR"),
                destroy_image: proc_address(egl, c"eglDestroyImageKHR"),
                image_target_texture: proc_address(egl, c"glEGLImageTargetTexture2DOES"),
                dma_buf_import: has("EGL_EXT_image_dma_buf_import"),
                dma_buf_modifiers: has("EGL_EXT_image_dma_buf_import_modifiers"),
            };
            tracing::debug!(
                "EGL {}.{} dma_buf_import={} modifiers={}",
                major,
                minor,
                ext.dma_buf_import,
                ext.dma_buf_modifiers
            );
            Ok(Self { egl, display, platform, ext })
        }
    }

    /// DMA-BUF import is fully usable
    pub fn can_import_dmabuf(&self) -> bool {
        self.ext.dma_buf_import
            && self.ext.create_image.is_some()
            && self.ext.destroy_image.is_some()
            && self.ext.image_target_texture.is_some()
    }
}

impl Drop for EglDisplayConnection {
    fn drop(&mut self) {
        unsafe {
            (self.egl.terminate)(self.display);
        }
    }
}

/// Native window pointer EGL wants for the given handle
pub enum NativeWindow {
    Wayland { egl_window: *mut c_void, lib: &'static WaylandEglLibrary },
    Xlib { window: Box<std::ffi::c_ulong> },
}

impl NativeWindow {
    pub fn new(handle: RawWindowHandle, width: u32, height: u32) -> Result<Self> {
        match handle {
            RawWindowHandle::Wayland(h) => {
                let lib = load_wayland_egl()?;
                let egl_window = unsafe { (lib.window_create)(h.surface.as_ptr(), width as i32, height as i32) };
                if egl_window.is_null() {
                    return Err(PipelineError::render("gles", "wl_egl_window_create failed"));
                }
                Ok(Self::Wayland { egl_window, lib })
            }
            RawWindowHandle::Xlib(h) => Ok(Self::Xlib { window: Box::new(h.window) }),
            other => Err(PipelineError::BackendUnavailable(format!("EGL does not support window {:?}", other))),
        }
    }

    pub fn as_ptr(&mut self) -> *mut c_void {
        match self {
            Self::Wayland { egl_window, .. } => *egl_window,
            // platform_x11 takes a pointer to the XID
            Self::Xlib { window } => (&mut **window as *mut std::ffi::c_ulong).cast(),
        }
    }

    pub fn resize(&mut self, width: u32, height: u32) {
        if let Self::Wayland { egl_window, lib } = self {
            unsafe { (lib.window_resize)(*egl_window, width as i32, height as i32, 0, 0) };
        }
    }
}

impl Drop for NativeWindow {
    fn drop(&mut self) {
        if let Self::Wayland { egl_window, lib } = self {
            unsafe { (lib.window_destroy)(*egl_window) };
        }
    }
}

// ============================================================================
// DMA-BUF Import
// ============================================================================

/// One plane of a multi-planar surface, imported on its own
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlaneImport {
    pub fourcc: u32,
    pub width: u32,
    pub height: u32,
}

/// Per-plane single/dual channel formats for a YUV surface
pub fn plane_imports(descriptor: &SurfaceDescriptor) -> Result<Vec<PlaneImport>> {
    let (w, h) = (descriptor.width, descriptor.height);
    let (cw, ch) = ((w + 1) / 2, (h + 1) / 2);
    let planes = match descriptor.fourcc {
        DRM_FORMAT_NV12 => vec![(DRM_FORMAT_R8, w, h), (DRM_FORMAT_GR88, cw, ch)],
        DRM_FORMAT_NV24 => vec![(DRM_FORMAT_R8, w, h), (DRM_FORMAT_GR88, w, h)],
        DRM_FORMAT_P010 => vec![(DRM_FORMAT_R16, w, h), (DRM_FORMAT_GR1616, cw, ch)],
        other => {
            return Err(PipelineError::Surface(format!("cannot import fourcc 0x{:08x}", other)));
        }
    };
    if descriptor.planes.len() != planes.len() {
        return Err(PipelineError::Surface(format!(
            "expected {} planes, descriptor has {}",
            planes.len(),
            descriptor.planes.len()
        )));
    }
    Ok(planes
        .into_iter()
        .map(|(fourcc, width, height)| PlaneImport { fourcc, width, height })
        .collect())
}

/// EGL attribute list for importing plane `index` of `descriptor`.
/// Modifier attributes are only emitted when the driver understands them
/// and the exporter gave an explicit modifier.
pub fn plane_attribs(
    descriptor: &SurfaceDescriptor,
    index: usize,
    import: &PlaneImport,
    modifiers_supported: bool,
) -> Result<Vec<EGLint>> {
    use std::os::fd::AsRawFd;

    let plane = descriptor
        .planes
        .get(index)
        .ok_or_else(|| PipelineError::Surface(format!("no plane {}", index)))?;
    let object = descriptor
        .objects
        .get(plane.object)
        .ok_or_else(|| PipelineError::Surface(format!("no object {}", plane.object)))?;

    let mut attribs = vec![
        EGL_WIDTH,
        import.width as EGLint,
        EGL_HEIGHT,
        import.height as EGLint,
        EGL_LINUX_DRM_FOURCC_EXT,
        import.fourcc as EGLint,
        EGL_DMA_BUF_PLANE0_FD_EXT,
        object.fd.as_raw_fd(),
        EGL_DMA_BUF_PLANE0_OFFSET_EXT,
        plane.offset as EGLint,
        EGL_DMA_BUF_PLANE0_PITCH_EXT,
        plane.pitch as EGLint,
    ];
    if modifiers_supported && object.modifier != crate::surface::DRM_FORMAT_MOD_INVALID {
        attribs.extend([
            EGL_DMA_BUF_PLANE0_MODIFIER_LO_EXT,
            (object.modifier & 0xffff_ffff) as u32 as EGLint,
            EGL_DMA_BUF_PLANE0_MODIFIER_HI_EXT,
            (object.modifier >> 32) as u32 as EGLint,
        ]);
    }
    attribs.push(EGL_NONE);
    Ok(attribs)
}

/// EGLImage per plane
pub struct EglPlaneImage(pub EGLImageKHR);

/// Imports descriptors as EGLImages on one display
pub struct EglImporter {
    pub egl: &'static EglLibrary,
    pub display: EGLDisplay,
    pub create_image: EglCreateImageKhrFn,
    pub destroy_image: EglDestroyImageKhrFn,
    pub modifiers: bool,
}

impl GpuImporter for EglImporter {
    type Image = EglPlaneImage;

    fn import(&mut self, descriptor: &SurfaceDescriptor) -> Result<Vec<EglPlaneImage>> {
        let imports = plane_imports(descriptor)?;
        let mut images = Vec::with_capacity(imports.len());
        for (i, import) in imports.iter().enumerate() {
            let attribs = plane_attribs(descriptor, i, import, self.modifiers)?;
            let image = unsafe {
                (self.create_image)(
                    self.display,
                    ptr::null_mut(),
                    EGL_LINUX_DMA_BUF_EXT,
                    ptr::null_mut(),
                    attribs.as_ptr(),
                )
            };
            if image.is_null() {
                let code = unsafe { (self.egl.get_error)() };
                self.destroy(images);
                return Err(PipelineError::Surface(format!(
                    "eglCreateImageKHR plane {} failed: 0x{:x}",
                    i, code
                )));
            }
            images.push(EglPlaneImage(image));
        }
        Ok(images)
    }

    fn destroy(&mut self, images: Vec<EglPlaneImage>) {
        for image in images {
            unsafe { (self.destroy_image)(self.display, image.0) };
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::surface::{DmaBufObject, PlaneLayout, DRM_FORMAT_MOD_INVALID};
    use std::os::fd::OwnedFd;

    fn nv12_descriptor(modifier: u64) -> SurfaceDescriptor {
        let fd: OwnedFd = tempfile::tempfile().unwrap().into();
        SurfaceDescriptor {
            fourcc: DRM_FORMAT_NV12,
            width: 1920,
            height: 1080,
            objects: vec![DmaBufObject { fd, size: 1920 * 1088 * 3 / 2, modifier }],
            planes: vec![
                PlaneLayout { object: 0, offset: 0, pitch: 1920 },
                PlaneLayout { object: 0, offset: 1920 * 1088, pitch: 1920 },
            ],
        }
    }

    #[test]
    fn test_nv12_splits_into_r8_and_gr88() {
        let imports = plane_imports(&nv12_descriptor(0)).unwrap();
        assert_eq!(imports[0], PlaneImport { fourcc: DRM_FORMAT_R8, width: 1920, height: 1080 });
        assert_eq!(imports[1], PlaneImport { fourcc: DRM_FORMAT_GR88, width: 960, height: 540 });
    }

    #[test]
    fn test_modifier_attribs_need_extension() {
        let desc = nv12_descriptor(0x0100_0000_0000_0004);
        let imports = plane_imports(&desc).unwrap();

        let without = plane_attribs(&desc, 1, &imports[1], false).unwrap();
        assert!(!without.contains(&EGL_DMA_BUF_PLANE0_MODIFIER_LO_EXT));
        assert_eq!(*without.last().unwrap(), EGL_NONE);

        let with = plane_attribs(&desc, 1, &imports[1], true).unwrap();
        let lo = with.iter().position(|&a| a == EGL_DMA_BUF_PLANE0_MODIFIER_LO_EXT).unwrap();
        assert_eq!(with[lo + 1], 4);
        assert_eq!(with[lo + 3], 0x0100_0000);
        let off = with.iter().position(|&a| a == EGL_DMA_BUF_PLANE0_OFFSET_EXT).unwrap();
        assert_eq!(with[off + 1], 1920 * 1088);
    }

    #[test]
    fn test_implicit_modifier_is_never_sent() {
        let desc = nv12_descriptor(DRM_FORMAT_MOD_INVALID);
        let imports = plane_imports(&desc).unwrap();
        let attribs = plane_attribs(&desc, 0, &imports[0], true).unwrap();
        assert!(!attribs.contains(&EGL_DMA_BUF_PLANE0_MODIFIER_HI_EXT));
    }

    #[test]
    fn test_unknown_fourcc_rejected() {
        let mut desc = nv12_descriptor(0);
        desc.fourcc = fourcc(b"YUYV");
        assert!(plane_imports(&desc).is_err());
    }
}
