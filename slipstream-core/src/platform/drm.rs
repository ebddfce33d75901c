// DRM - Kernel mode-setting interface (Linux)
//
// Thin safe layer over the DRM ioctls used by the KMS display and the
// direct-scanout renderer. Everything goes through the card fd; no libdrm.
//
//   DrmCard ── resources / connectors / crtcs / properties
//           ── dumb buffers (CPU-mapped framebuffers)
//           ── PRIME import + ADDFB2 (DMA-BUF framebuffers)
//           ── page flips and flip-complete events
//           ── property blobs + atomic / legacy property commits

#![allow(non_camel_case_types)]

use std::ffi::CStr;
use std::fs::OpenOptions;
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, OwnedFd, RawFd};
use std::os::unix::fs::OpenOptionsExt;
use std::path::Path;
use std::ptr;
use std::time::Duration;

use crate::error::{PipelineError, Result};
use crate::ioctl::{iow, iowr, xioctl};

// ============================================================================
// Kernel Structures (drm.h / drm_mode.h)
// ============================================================================

#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
pub struct drm_get_cap {
    pub capability: u64,
    pub value: u64,
}

#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
pub struct drm_set_client_cap {
    pub capability: u64,
    pub value: u64,
}

#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
pub struct drm_mode_card_res {
    pub fb_id_ptr: u64,
    pub crtc_id_ptr: u64,
    pub connector_id_ptr: u64,
    pub encoder_id_ptr: u64,
    pub count_fbs: u32,
    pub count_crtcs: u32,
    pub count_connectors: u32,
    pub count_encoders: u32,
    pub min_width: u32,
    pub max_width: u32,
    pub min_height: u32,
    pub max_height: u32,
}

#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
pub struct drm_mode_modeinfo {
    pub clock: u32,
    pub hdisplay: u16,
    pub hsync_start: u16,
    pub hsync_end: u16,
    pub htotal: u16,
    pub hskew: u16,
    pub vdisplay: u16,
    pub vsync_start: u16,
    pub vsync_end: u16,
    pub vtotal: u16,
    pub vscan: u16,
    pub vrefresh: u32,
    pub flags: u32,
    pub type_: u32,
    pub name: [u8; 32],
}

#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
pub struct drm_mode_crtc {
    pub set_connectors_ptr: u64,
    pub count_connectors: u32,
    pub crtc_id: u32,
    pub fb_id: u32,
    pub x: u32,
    pub y: u32,
    pub gamma_size: u32,
    pub mode_valid: u32,
    pub mode: drm_mode_modeinfo,
}

#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
pub struct drm_mode_get_encoder {
    pub encoder_id: u32,
    pub encoder_type: u32,
    pub crtc_id: u32,
    pub possible_crtcs: u32,
    pub possible_clones: u32,
}

#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
pub struct drm_mode_get_connector {
    pub encoders_ptr: u64,
    pub modes_ptr: u64,
    pub props_ptr: u64,
    pub prop_values_ptr: u64,
    pub count_modes: u32,
    pub count_props: u32,
    pub count_encoders: u32,
    pub encoder_id: u32,
    pub connector_id: u32,
    pub connector_type: u32,
    pub connector_type_id: u32,
    pub connection: u32,
    pub mm_width: u32,
    pub mm_height: u32,
    pub subpixel: u32,
    pub pad: u32,
}

#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
pub struct drm_mode_get_property {
    pub values_ptr: u64,
    pub enum_blob_ptr: u64,
    pub prop_id: u32,
    pub flags: u32,
    pub name: [u8; 32],
    pub count_values: u32,
    pub count_enum_blobs: u32,
}

#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
pub struct drm_mode_property_enum {
    pub value: u64,
    pub name: [u8; 32],
}

#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
pub struct drm_mode_obj_get_properties {
    pub props_ptr: u64,
    pub prop_values_ptr: u64,
    pub count_props: u32,
    pub obj_id: u32,
    pub obj_type: u32,
}

#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
pub struct drm_mode_connector_set_property {
    pub value: u64,
    pub prop_id: u32,
    pub connector_id: u32,
}

#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
pub struct drm_mode_atomic {
    pub flags: u32,
    pub count_objs: u32,
    pub objs_ptr: u64,
    pub count_props_ptr: u64,
    pub props_ptr: u64,
    pub prop_values_ptr: u64,
    pub reserved: u64,
    pub user_data: u64,
}

#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
pub struct drm_mode_create_blob {
    pub data: u64,
    pub length: u32,
    pub blob_id: u32,
}

#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
pub struct drm_mode_destroy_blob {
    pub blob_id: u32,
}

#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
pub struct drm_mode_crtc_page_flip {
    pub crtc_id: u32,
    pub fb_id: u32,
    pub flags: u32,
    pub reserved: u32,
    pub user_data: u64,
}

#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
pub struct drm_mode_create_dumb {
    pub height: u32,
    pub width: u32,
    pub bpp: u32,
    pub flags: u32,
    pub handle: u32,
    pub pitch: u32,
    pub size: u64,
}

#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
pub struct drm_mode_map_dumb {
    pub handle: u32,
    pub pad: u32,
    pub offset: u64,
}

#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
pub struct drm_mode_destroy_dumb {
    pub handle: u32,
}

#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
pub struct drm_mode_fb_cmd2 {
    pub fb_id: u32,
    pub width: u32,
    pub height: u32,
    pub pixel_format: u32,
    pub flags: u32,
    pub handles: [u32; 4],
    pub pitches: [u32; 4],
    pub offsets: [u32; 4],
    pub modifier: [u64; 4],
}

#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
pub struct drm_prime_handle {
    pub handle: u32,
    pub flags: u32,
    pub fd: i32,
}

#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
pub struct drm_gem_close {
    pub handle: u32,
    pub pad: u32,
}

#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
struct drm_event {
    type_: u32,
    length: u32,
}

// ============================================================================
// Constants
// ============================================================================

const DRM_IOCTL_BASE: u8 = b'd';

pub const DRM_IOCTL_GEM_CLOSE: u64 = iow::<drm_gem_close>(DRM_IOCTL_BASE, 0x09);
pub const DRM_IOCTL_GET_CAP: u64 = iowr::<drm_get_cap>(DRM_IOCTL_BASE, 0x0C);
pub const DRM_IOCTL_SET_CLIENT_CAP: u64 = iow::<drm_set_client_cap>(DRM_IOCTL_BASE, 0x0D);
pub const DRM_IOCTL_PRIME_FD_TO_HANDLE: u64 = iowr::<drm_prime_handle>(DRM_IOCTL_BASE, 0x2E);
pub const DRM_IOCTL_MODE_GETRESOURCES: u64 = iowr::<drm_mode_card_res>(DRM_IOCTL_BASE, 0xA0);
pub const DRM_IOCTL_MODE_GETCRTC: u64 = iowr::<drm_mode_crtc>(DRM_IOCTL_BASE, 0xA1);
pub const DRM_IOCTL_MODE_SETCRTC: u64 = iowr::<drm_mode_crtc>(DRM_IOCTL_BASE, 0xA2);
pub const DRM_IOCTL_MODE_GETENCODER: u64 = iowr::<drm_mode_get_encoder>(DRM_IOCTL_BASE, 0xA6);
pub const DRM_IOCTL_MODE_GETCONNECTOR: u64 = iowr::<drm_mode_get_connector>(DRM_IOCTL_BASE, 0xA7);
pub const DRM_IOCTL_MODE_GETPROPERTY: u64 = iowr::<drm_mode_get_property>(DRM_IOCTL_BASE, 0xAA);
pub const DRM_IOCTL_MODE_SETPROPERTY: u64 = iowr::<drm_mode_connector_set_property>(DRM_IOCTL_BASE, 0xAB);
pub const DRM_IOCTL_MODE_RMFB: u64 = iowr::<u32>(DRM_IOCTL_BASE, 0xAF);
pub const DRM_IOCTL_MODE_PAGE_FLIP: u64 = iowr::<drm_mode_crtc_page_flip>(DRM_IOCTL_BASE, 0xB0);
pub const DRM_IOCTL_MODE_CREATE_DUMB: u64 = iowr::<drm_mode_create_dumb>(DRM_IOCTL_BASE, 0xB2);
pub const DRM_IOCTL_MODE_MAP_DUMB: u64 = iowr::<drm_mode_map_dumb>(DRM_IOCTL_BASE, 0xB3);
pub const DRM_IOCTL_MODE_DESTROY_DUMB: u64 = iowr::<drm_mode_destroy_dumb>(DRM_IOCTL_BASE, 0xB4);
pub const DRM_IOCTL_MODE_ADDFB2: u64 = iowr::<drm_mode_fb_cmd2>(DRM_IOCTL_BASE, 0xB8);
pub const DRM_IOCTL_MODE_OBJ_GETPROPERTIES: u64 = iowr::<drm_mode_obj_get_properties>(DRM_IOCTL_BASE, 0xB9);
pub const DRM_IOCTL_MODE_ATOMIC: u64 = iowr::<drm_mode_atomic>(DRM_IOCTL_BASE, 0xBC);
pub const DRM_IOCTL_MODE_CREATEPROPBLOB: u64 = iowr::<drm_mode_create_blob>(DRM_IOCTL_BASE, 0xBD);
pub const DRM_IOCTL_MODE_DESTROYPROPBLOB: u64 = iowr::<drm_mode_destroy_blob>(DRM_IOCTL_BASE, 0xBE);

pub const DRM_CAP_DUMB_BUFFER: u64 = 0x1;
pub const DRM_CAP_PRIME: u64 = 0x5;
pub const DRM_CAP_ADDFB2_MODIFIERS: u64 = 0x10;
pub const DRM_CLIENT_CAP_UNIVERSAL_PLANES: u64 = 2;
pub const DRM_CLIENT_CAP_ATOMIC: u64 = 3;

pub const DRM_PRIME_CAP_IMPORT: u64 = 0x1;

pub const DRM_MODE_CONNECTED: u32 = 1;
pub const DRM_MODE_TYPE_PREFERRED: u32 = 1 << 3;
pub const DRM_MODE_PAGE_FLIP_EVENT: u32 = 0x01;
pub const DRM_MODE_ATOMIC_NONBLOCK: u32 = 0x0200;
pub const DRM_MODE_ATOMIC_ALLOW_MODESET: u32 = 0x0400;
pub const DRM_MODE_FB_MODIFIERS: u32 = 1 << 1;
pub const DRM_MODE_PROP_ENUM: u32 = 1 << 3;
pub const DRM_MODE_PROP_BLOB: u32 = 1 << 4;
pub const DRM_MODE_OBJECT_CONNECTOR: u32 = 0xc0c0c0c0;

const DRM_EVENT_FLIP_COMPLETE: u32 = 0x02;

// ============================================================================
// Card
// ============================================================================

/// Mode and routing for one connected output
#[derive(Debug, Clone, Copy)]
pub struct Output {
    pub connector_id: u32,
    pub crtc_id: u32,
    pub mode: drm_mode_modeinfo,
}

impl Output {
    pub fn size(&self) -> (u32, u32) {
        (self.mode.hdisplay as u32, self.mode.vdisplay as u32)
    }
}

/// An open DRM device
pub struct DrmCard {
    fd: OwnedFd,
    atomic: bool,
}

impl DrmCard {
    pub fn open(path: &Path) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .custom_flags(libc::O_CLOEXEC)
            .open(path)?;
        let fd: OwnedFd = file.into();
        let mut card = Self { fd, atomic: false };

        if card.get_cap(DRM_CAP_DUMB_BUFFER).unwrap_or(0) == 0 {
            return Err(PipelineError::display("kms", format!("{} has no dumb buffers", path.display())));
        }
        card.atomic = card.set_client_cap(DRM_CLIENT_CAP_UNIVERSAL_PLANES, 1).is_ok()
            && card.set_client_cap(DRM_CLIENT_CAP_ATOMIC, 1).is_ok();
        tracing::debug!(device = %path.display(), atomic = card.atomic, "DRM device opened");
        Ok(card)
    }

    pub fn raw(&self) -> RawFd {
        self.fd.as_raw_fd()
    }

    pub fn supports_atomic(&self) -> bool {
        self.atomic
    }

    fn ioctl<T>(&self, request: u64, arg: &mut T) -> Result<()> {
        unsafe { xioctl(self.raw(), request, arg as *mut T) }?;
        Ok(())
    }

    pub fn get_cap(&self, capability: u64) -> Result<u64> {
        let mut cap = drm_get_cap { capability, value: 0 };
        self.ioctl(DRM_IOCTL_GET_CAP, &mut cap)?;
        Ok(cap.value)
    }

    pub fn set_client_cap(&self, capability: u64, value: u64) -> Result<()> {
        let mut cap = drm_set_client_cap { capability, value };
        self.ioctl(DRM_IOCTL_SET_CLIENT_CAP, &mut cap)
    }

    pub fn can_import_prime(&self) -> bool {
        self.get_cap(DRM_CAP_PRIME).is_ok_and(|v| v & DRM_PRIME_CAP_IMPORT != 0)
    }

    pub fn supports_modifiers(&self) -> bool {
        self.get_cap(DRM_CAP_ADDFB2_MODIFIERS).is_ok_and(|v| v != 0)
    }

    // ------------------------------------------------------------------------
    // Mode setting
    // ------------------------------------------------------------------------

    /// First connected connector with its preferred mode and a usable CRTC
    pub fn find_output(&self) -> Result<Output> {
        let mut res = drm_mode_card_res::default();
        self.ioctl(DRM_IOCTL_MODE_GETRESOURCES, &mut res)?;
        let mut crtcs = vec![0u32; res.count_crtcs as usize];
        let mut connectors = vec![0u32; res.count_connectors as usize];
        let mut res = drm_mode_card_res {
            crtc_id_ptr: crtcs.as_mut_ptr() as u64,
            connector_id_ptr: connectors.as_mut_ptr() as u64,
            count_crtcs: crtcs.len() as u32,
            count_connectors: connectors.len() as u32,
            ..Default::default()
        };
        self.ioctl(DRM_IOCTL_MODE_GETRESOURCES, &mut res)?;
        crtcs.truncate(res.count_crtcs as usize);
        connectors.truncate(res.count_connectors as usize);

        for &connector_id in &connectors {
            let (conn, modes, encoders) = match self.connector(connector_id) {
                Ok(c) => c,
                Err(e) => {
                    tracing::debug!(connector_id, "connector query failed: {}", e);
                    continue;
                }
            };
            if conn.connection != DRM_MODE_CONNECTED || modes.is_empty() {
                continue;
            }
            let mode = modes
                .iter()
                .find(|m| m.type_ & DRM_MODE_TYPE_PREFERRED != 0)
                .copied()
                .unwrap_or(modes[0]);

            let encoder_ids = std::iter::once(conn.encoder_id).filter(|&id| id != 0).chain(encoders);
            for encoder_id in encoder_ids {
                let mut enc = drm_mode_get_encoder { encoder_id, ..Default::default() };
                if self.ioctl(DRM_IOCTL_MODE_GETENCODER, &mut enc).is_err() {
                    continue;
                }
                let crtc_id = if enc.crtc_id != 0 {
                    Some(enc.crtc_id)
                } else {
                    crtcs
                        .iter()
                        .enumerate()
                        .find(|(i, _)| enc.possible_crtcs & (1 << i) != 0)
                        .map(|(_, &id)| id)
                };
                if let Some(crtc_id) = crtc_id {
                    return Ok(Output { connector_id, crtc_id, mode });
                }
            }
        }
        Err(PipelineError::display("kms", "no connected output"))
    }

    fn connector(&self, connector_id: u32) -> Result<(drm_mode_get_connector, Vec<drm_mode_modeinfo>, Vec<u32>)> {
        let mut conn = drm_mode_get_connector { connector_id, ..Default::default() };
        self.ioctl(DRM_IOCTL_MODE_GETCONNECTOR, &mut conn)?;
        let mut modes = vec![drm_mode_modeinfo::default(); conn.count_modes as usize];
        let mut encoders = vec![0u32; conn.count_encoders as usize];
        let mut full = drm_mode_get_connector {
            connector_id,
            modes_ptr: modes.as_mut_ptr() as u64,
            count_modes: modes.len() as u32,
            encoders_ptr: encoders.as_mut_ptr() as u64,
            count_encoders: encoders.len() as u32,
            ..Default::default()
        };
        self.ioctl(DRM_IOCTL_MODE_GETCONNECTOR, &mut full)?;
        modes.truncate(full.count_modes.min(conn.count_modes) as usize);
        encoders.truncate(full.count_encoders.min(conn.count_encoders) as usize);
        Ok((full, modes, encoders))
    }

    pub fn set_crtc(&self, output: &Output, fb_id: u32) -> Result<()> {
        let mut connector = output.connector_id;
        let mut crtc = drm_mode_crtc {
            set_connectors_ptr: &mut connector as *mut u32 as u64,
            count_connectors: 1,
            crtc_id: output.crtc_id,
            fb_id,
            mode_valid: 1,
            mode: output.mode,
            ..Default::default()
        };
        self.ioctl(DRM_IOCTL_MODE_SETCRTC, &mut crtc)
    }

    pub fn page_flip(&self, crtc_id: u32, fb_id: u32, user_data: u64) -> Result<()> {
        let mut flip = drm_mode_crtc_page_flip {
            crtc_id,
            fb_id,
            flags: DRM_MODE_PAGE_FLIP_EVENT,
            reserved: 0,
            user_data,
        };
        self.ioctl(DRM_IOCTL_MODE_PAGE_FLIP, &mut flip)
    }

    /// Block until a flip-complete event arrives or `timeout` passes.
    /// Returns false on timeout.
    pub fn wait_flip(&self, timeout: Duration) -> Result<bool> {
        let mut pfd = libc::pollfd { fd: self.raw(), events: libc::POLLIN, revents: 0 };
        let ms = timeout.as_millis().min(i32::MAX as u128) as i32;
        loop {
            let n = unsafe { libc::poll(&mut pfd, 1, ms) };
            if n < 0 {
                let err = std::io::Error::last_os_error();
                if err.raw_os_error() == Some(libc::EINTR) {
                    continue;
                }
                return Err(err.into());
            }
            if n == 0 {
                return Ok(false);
            }
            break;
        }

        let mut buf = [0u8; 1024];
        let len = unsafe { libc::read(self.raw(), buf.as_mut_ptr().cast(), buf.len()) };
        if len < 0 {
            return Err(std::io::Error::last_os_error().into());
        }
        let len = len as usize;
        let header = std::mem::size_of::<drm_event>();
        let mut off = 0;
        let mut flipped = false;
        while off + header <= len {
            let ev: drm_event = unsafe { ptr::read_unaligned(buf[off..].as_ptr().cast()) };
            if ev.type_ == DRM_EVENT_FLIP_COMPLETE {
                flipped = true;
            }
            if ev.length == 0 {
                break;
            }
            off += ev.length as usize;
        }
        Ok(flipped)
    }

    // ------------------------------------------------------------------------
    // Framebuffers
    // ------------------------------------------------------------------------

    pub fn create_dumb(&self, width: u32, height: u32) -> Result<DumbBuffer> {
        let mut create = drm_mode_create_dumb { width, height, bpp: 32, ..Default::default() };
        self.ioctl(DRM_IOCTL_MODE_CREATE_DUMB, &mut create)?;

        let mut buffer = DumbBuffer {
            handle: create.handle,
            fb_id: 0,
            width,
            height,
            pitch: create.pitch,
            map: ptr::null_mut(),
            len: create.size as usize,
        };

        let fb = FramebufferLayout {
            width,
            height,
            fourcc: crate::surface::DRM_FORMAT_XRGB8888,
            handles: [create.handle, 0, 0, 0],
            pitches: [create.pitch, 0, 0, 0],
            offsets: [0; 4],
            modifier: None,
        };
        match self.add_framebuffer(&fb) {
            Ok(id) => buffer.fb_id = id,
            Err(e) => {
                self.destroy_dumb(&mut buffer);
                return Err(e);
            }
        }

        let mut map = drm_mode_map_dumb { handle: create.handle, ..Default::default() };
        if let Err(e) = self.ioctl(DRM_IOCTL_MODE_MAP_DUMB, &mut map) {
            self.destroy_dumb(&mut buffer);
            return Err(e);
        }
        let ptr = unsafe {
            libc::mmap(
                ptr::null_mut(),
                buffer.len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                self.raw(),
                map.offset as libc::off_t,
            )
        };
        if ptr == libc::MAP_FAILED {
            let err = std::io::Error::last_os_error();
            self.destroy_dumb(&mut buffer);
            return Err(err.into());
        }
        buffer.map = ptr.cast();
        Ok(buffer)
    }

    pub fn destroy_dumb(&self, buffer: &mut DumbBuffer) {
        if !buffer.map.is_null() {
            unsafe { libc::munmap(buffer.map.cast(), buffer.len) };
            buffer.map = ptr::null_mut();
        }
        if buffer.fb_id != 0 {
            self.remove_framebuffer(buffer.fb_id);
            buffer.fb_id = 0;
        }
        if buffer.handle != 0 {
            let mut destroy = drm_mode_destroy_dumb { handle: buffer.handle };
            let _ = self.ioctl(DRM_IOCTL_MODE_DESTROY_DUMB, &mut destroy);
            buffer.handle = 0;
        }
    }

    pub fn add_framebuffer(&self, layout: &FramebufferLayout) -> Result<u32> {
        let mut cmd = drm_mode_fb_cmd2 {
            width: layout.width,
            height: layout.height,
            pixel_format: layout.fourcc,
            handles: layout.handles,
            pitches: layout.pitches,
            offsets: layout.offsets,
            ..Default::default()
        };
        if let Some(modifier) = layout.modifier {
            cmd.flags = DRM_MODE_FB_MODIFIERS;
            for (i, h) in layout.handles.iter().enumerate() {
                if *h != 0 {
                    cmd.modifier[i] = modifier;
                }
            }
        }
        self.ioctl(DRM_IOCTL_MODE_ADDFB2, &mut cmd)?;
        Ok(cmd.fb_id)
    }

    pub fn remove_framebuffer(&self, fb_id: u32) {
        let mut id = fb_id;
        if let Err(e) = self.ioctl(DRM_IOCTL_MODE_RMFB, &mut id) {
            tracing::debug!(fb_id, "RMFB failed: {}", e);
        }
    }

    /// Import a DMA-BUF as a GEM handle on this card
    pub fn prime_import(&self, fd: BorrowedFd<'_>) -> Result<u32> {
        let mut prime = drm_prime_handle { fd: fd.as_raw_fd(), ..Default::default() };
        self.ioctl(DRM_IOCTL_PRIME_FD_TO_HANDLE, &mut prime)?;
        Ok(prime.handle)
    }

    pub fn close_handle(&self, handle: u32) {
        let mut close = drm_gem_close { handle, pad: 0 };
        let _ = self.ioctl(DRM_IOCTL_GEM_CLOSE, &mut close);
    }

    // ------------------------------------------------------------------------
    // Properties
    // ------------------------------------------------------------------------

    /// Look up a property on an object by name: (prop id, flags, current value)
    pub fn find_property(&self, obj_id: u32, obj_type: u32, name: &str) -> Result<Option<(u32, u32, u64)>> {
        let mut query = drm_mode_obj_get_properties { obj_id, obj_type, ..Default::default() };
        self.ioctl(DRM_IOCTL_MODE_OBJ_GETPROPERTIES, &mut query)?;
        let mut ids = vec![0u32; query.count_props as usize];
        let mut values = vec![0u64; query.count_props as usize];
        let mut query = drm_mode_obj_get_properties {
            props_ptr: ids.as_mut_ptr() as u64,
            prop_values_ptr: values.as_mut_ptr() as u64,
            count_props: ids.len() as u32,
            obj_id,
            obj_type,
        };
        self.ioctl(DRM_IOCTL_MODE_OBJ_GETPROPERTIES, &mut query)?;
        let count = (query.count_props as usize).min(ids.len());

        for i in 0..count {
            let mut prop = drm_mode_get_property { prop_id: ids[i], ..Default::default() };
            if self.ioctl(DRM_IOCTL_MODE_GETPROPERTY, &mut prop).is_err() {
                continue;
            }
            if c_name(&prop.name) == name {
                return Ok(Some((ids[i], prop.flags, values[i])));
            }
        }
        Ok(None)
    }

    /// Value of the enum entry `entry` of property `prop_id`
    pub fn enum_value(&self, prop_id: u32, entry: &str) -> Result<Option<u64>> {
        let mut prop = drm_mode_get_property { prop_id, ..Default::default() };
        self.ioctl(DRM_IOCTL_MODE_GETPROPERTY, &mut prop)?;
        let mut enums = vec![drm_mode_property_enum::default(); prop.count_enum_blobs as usize];
        let mut values = vec![0u64; prop.count_values as usize];
        let mut prop = drm_mode_get_property {
            prop_id,
            values_ptr: values.as_mut_ptr() as u64,
            enum_blob_ptr: enums.as_mut_ptr() as u64,
            count_values: values.len() as u32,
            count_enum_blobs: enums.len() as u32,
            ..Default::default()
        };
        self.ioctl(DRM_IOCTL_MODE_GETPROPERTY, &mut prop)?;
        Ok(enums.iter().find(|e| c_name(&e.name) == entry).map(|e| e.value))
    }

    pub fn create_blob(&self, data: &[u8]) -> Result<u32> {
        let mut blob = drm_mode_create_blob {
            data: data.as_ptr() as u64,
            length: data.len() as u32,
            blob_id: 0,
        };
        self.ioctl(DRM_IOCTL_MODE_CREATEPROPBLOB, &mut blob)?;
        Ok(blob.blob_id)
    }

    pub fn destroy_blob(&self, blob_id: u32) -> Result<()> {
        let mut blob = drm_mode_destroy_blob { blob_id };
        self.ioctl(DRM_IOCTL_MODE_DESTROYPROPBLOB, &mut blob)
    }

    /// Commit property values on one object, atomically when supported
    pub fn commit_properties(&self, obj_id: u32, props: &[(u32, u64)]) -> Result<()> {
        if self.atomic {
            let mut objs = [obj_id];
            let mut counts = [props.len() as u32];
            let mut ids: Vec<u32> = props.iter().map(|p| p.0).collect();
            let mut values: Vec<u64> = props.iter().map(|p| p.1).collect();
            let mut atomic = drm_mode_atomic {
                flags: DRM_MODE_ATOMIC_ALLOW_MODESET,
                count_objs: 1,
                objs_ptr: objs.as_mut_ptr() as u64,
                count_props_ptr: counts.as_mut_ptr() as u64,
                props_ptr: ids.as_mut_ptr() as u64,
                prop_values_ptr: values.as_mut_ptr() as u64,
                ..Default::default()
            };
            return self.ioctl(DRM_IOCTL_MODE_ATOMIC, &mut atomic);
        }
        for &(prop_id, value) in props {
            let mut set = drm_mode_connector_set_property { value, prop_id, connector_id: obj_id };
            self.ioctl(DRM_IOCTL_MODE_SETPROPERTY, &mut set)?;
        }
        Ok(())
    }
}

impl AsFd for DrmCard {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.fd.as_fd()
    }
}

fn c_name(raw: &[u8; 32]) -> &str {
    CStr::from_bytes_until_nul(raw)
        .ok()
        .and_then(|s| s.to_str().ok())
        .unwrap_or("")
}

/// Inputs to ADDFB2
#[derive(Debug, Clone, Copy)]
pub struct FramebufferLayout {
    pub width: u32,
    pub height: u32,
    pub fourcc: u32,
    pub handles: [u32; 4],
    pub pitches: [u32; 4],
    pub offsets: [u32; 4],
    /// Explicit modifier; `None` lets the driver assume the implicit layout
    pub modifier: Option<u64>,
}

// ============================================================================
// Dumb Buffers
// ============================================================================

/// CPU-mapped XRGB8888 scanout buffer
pub struct DumbBuffer {
    pub handle: u32,
    pub fb_id: u32,
    pub width: u32,
    pub height: u32,
    pub pitch: u32,
    map: *mut u8,
    len: usize,
}

// SAFETY: the mapping is owned by this buffer and only touched through &mut self
unsafe impl Send for DumbBuffer {}

impl DumbBuffer {
    pub fn pixels_mut(&mut self) -> &mut [u8] {
        if self.map.is_null() {
            return &mut [];
        }
        unsafe { std::slice::from_raw_parts_mut(self.map, self.len) }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_struct_sizes_match_kernel() {
        assert_eq!(std::mem::size_of::<drm_mode_modeinfo>(), 68);
        assert_eq!(std::mem::size_of::<drm_mode_crtc>(), 104);
        assert_eq!(std::mem::size_of::<drm_mode_fb_cmd2>(), 104);
        assert_eq!(std::mem::size_of::<drm_mode_get_connector>(), 80);
        assert_eq!(std::mem::size_of::<drm_mode_atomic>(), 56);
        assert_eq!(std::mem::size_of::<drm_mode_obj_get_properties>(), 32);
        assert_eq!(std::mem::size_of::<drm_prime_handle>(), 12);
    }

    #[test]
    fn test_request_numbers() {
        assert_eq!(DRM_IOCTL_MODE_ADDFB2, 0xC068_64B8);
        assert_eq!(DRM_IOCTL_PRIME_FD_TO_HANDLE, 0xC00C_642E);
        assert_eq!(DRM_IOCTL_MODE_PAGE_FLIP, 0xC018_64B0);
    }

    #[test]
    fn test_c_name() {
        let mut raw = [0u8; 32];
        raw[..10].copy_from_slice(b"Colorspace");
        assert_eq!(c_name(&raw), "Colorspace");
    }

    #[test]
    fn test_open_missing_device_fails() {
        assert!(DrmCard::open(Path::new("/nonexistent/card0")).is_err());
    }
}
