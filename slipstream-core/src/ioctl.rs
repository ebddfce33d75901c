// IOCTL - Linux ioctl request encoding and a retrying wrapper
//
// Both the DRM and V4L2 interfaces are driven through raw ioctls.
// Request numbers follow the kernel's asm-generic _IOC layout:
//
//   bits 31..30  direction (none / write / read / read-write)
//   bits 29..16  argument size
//   bits 15..8   type ('d' for DRM, 'V' for V4L2)
//   bits  7..0   number

use std::io;
use std::os::fd::RawFd;

const IOC_NONE: u64 = 0;
const IOC_WRITE: u64 = 1;
const IOC_READ: u64 = 2;

const fn ioc(dir: u64, ty: u8, nr: u8, size: usize) -> u64 {
    (dir << 30) | ((size as u64 & 0x3FFF) << 16) | ((ty as u64) << 8) | nr as u64
}

pub const fn io(ty: u8, nr: u8) -> u64 {
    ioc(IOC_NONE, ty, nr, 0)
}

pub const fn ior<T>(ty: u8, nr: u8) -> u64 {
    ioc(IOC_READ, ty, nr, std::mem::size_of::<T>())
}

pub const fn iow<T>(ty: u8, nr: u8) -> u64 {
    ioc(IOC_WRITE, ty, nr, std::mem::size_of::<T>())
}

pub const fn iowr<T>(ty: u8, nr: u8) -> u64 {
    ioc(IOC_READ | IOC_WRITE, ty, nr, std::mem::size_of::<T>())
}

/// Issue an ioctl, retrying while it is interrupted by a signal.
///
/// # Safety
/// `arg` must point to a value of the type the request encodes.
pub unsafe fn xioctl<T>(fd: RawFd, request: u64, arg: *mut T) -> io::Result<libc::c_int> {
    loop {
        let ret = libc::ioctl(fd, request as _, arg);
        if ret >= 0 {
            return Ok(ret);
        }
        let err = io::Error::last_os_error();
        if err.raw_os_error() != Some(libc::EINTR) {
            return Err(err);
        }
    }
}

/// True for the errno a non-blocking dequeue returns when nothing is ready
pub fn would_block(err: &io::Error) -> bool {
    err.raw_os_error() == Some(libc::EAGAIN)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_encoding() {
        // VIDIOC_STREAMON = _IOW('V', 18, int)
        assert_eq!(iow::<libc::c_int>(b'V', 18), 0x4004_5612);
        // DRM_IOCTL_MODE_RMFB = _IOWR('d', 0xAF, unsigned int)
        assert_eq!(iowr::<u32>(b'd', 0xAF), 0xC004_64AF);
        assert_eq!(io(b'd', 0x1E), 0x641E);
    }

    #[test]
    fn test_bad_fd_reports_error() {
        let mut value = 0i32;
        let err = unsafe { xioctl(-1, iow::<i32>(b'V', 18), &mut value) }.unwrap_err();
        assert_eq!(err.raw_os_error(), Some(libc::EBADF));
    }
}
