//! `LinuxFramebufferDevice`: `FramebufferDevice` backed by a real
//! `/dev/fb*` character device, using the same raw `libc` open/ioctl/mmap
//! style `ingest::file`/`ingest::http` already use for their own syscalls.
//!
//! The `fb_fix_screeninfo`/`fb_var_screeninfo` layouts mirror
//! `linux/fb.h`; only the fields this crate reads are named individually,
//! the rest are kept as opaque padding so the ioctl still writes a
//! correctly sized struct.

use std::ffi::CString;
use std::os::unix::io::RawFd;

use crate::error::PlayerError;

use super::framebuffer::{FramebufferDevice, ScreenInfo};

const FBIOGET_VSCREENINFO: libc::c_ulong = 0x4600;
const FBIOGET_FSCREENINFO: libc::c_ulong = 0x4602;

#[repr(C)]
#[derive(Clone, Copy)]
struct FbBitfield {
    offset: u32,
    length: u32,
    msb_right: u32,
}

#[repr(C)]
#[derive(Clone, Copy)]
struct FbVarScreeninfo {
    xres: u32,
    yres: u32,
    xres_virtual: u32,
    yres_virtual: u32,
    xoffset: u32,
    yoffset: u32,
    bits_per_pixel: u32,
    grayscale: u32,
    red: FbBitfield,
    green: FbBitfield,
    blue: FbBitfield,
    transp: FbBitfield,
    nonstd: u32,
    activate: u32,
    height: u32,
    width: u32,
    accel_flags: u32,
    pixclock: u32,
    left_margin: u32,
    right_margin: u32,
    upper_margin: u32,
    lower_margin: u32,
    hsync_len: u32,
    vsync_len: u32,
    sync: u32,
    vmode: u32,
    rotate: u32,
    colorspace: u32,
    reserved: [u32; 4],
}

#[repr(C)]
#[derive(Clone, Copy)]
struct FbFixScreeninfo {
    id: [u8; 16],
    smem_start: libc::c_ulong,
    smem_len: u32,
    fb_type: u32,
    type_aux: u32,
    visual: u32,
    xpanstep: u16,
    ypanstep: u16,
    ywrapstep: u16,
    line_length: u32,
    mmio_start: libc::c_ulong,
    mmio_len: u32,
    accel: u32,
    capabilities: u16,
    reserved: [u16; 2],
}

pub struct LinuxFramebufferDevice {
    fd: RawFd,
    path: String,
}

impl LinuxFramebufferDevice {
    pub fn open(path: &str) -> Result<Self, PlayerError> {
        let cpath = CString::new(path).map_err(|_| PlayerError::TransientDevice {
            device: path.to_string(),
            reason: "path contains a NUL byte".into(),
        })?;
        // SAFETY: `cpath` is a valid NUL-terminated C string for the
        // duration of this call.
        let fd = unsafe { libc::open(cpath.as_ptr(), libc::O_RDWR) };
        if fd < 0 {
            return Err(PlayerError::TransientDevice {
                device: path.to_string(),
                reason: std::io::Error::last_os_error().to_string(),
            });
        }
        Ok(Self { fd, path: path.to_string() })
    }

    fn ioctl_fixed(&self) -> Result<FbFixScreeninfo, PlayerError> {
        let mut info: FbFixScreeninfo = unsafe { std::mem::zeroed() };
        // SAFETY: `info` is a correctly sized, writable buffer matching
        // `fb_fix_screeninfo`'s kernel layout.
        let rc = unsafe { libc::ioctl(self.fd, FBIOGET_FSCREENINFO, &mut info as *mut FbFixScreeninfo) };
        if rc < 0 {
            return Err(self.ioctl_err("FBIOGET_FSCREENINFO"));
        }
        Ok(info)
    }

    fn ioctl_var(&self) -> Result<FbVarScreeninfo, PlayerError> {
        let mut info: FbVarScreeninfo = unsafe { std::mem::zeroed() };
        // SAFETY: see `ioctl_fixed`.
        let rc = unsafe { libc::ioctl(self.fd, FBIOGET_VSCREENINFO, &mut info as *mut FbVarScreeninfo) };
        if rc < 0 {
            return Err(self.ioctl_err("FBIOGET_VSCREENINFO"));
        }
        Ok(info)
    }

    fn ioctl_err(&self, what: &str) -> PlayerError {
        PlayerError::TransientDevice {
            device: self.path.clone(),
            reason: format!("{what} failed: {}", std::io::Error::last_os_error()),
        }
    }
}

impl Drop for LinuxFramebufferDevice {
    fn drop(&mut self) {
        if self.fd >= 0 {
            unsafe {
                libc::close(self.fd);
            }
        }
    }
}

impl FramebufferDevice for LinuxFramebufferDevice {
    fn screen_info(&self) -> Result<ScreenInfo, PlayerError> {
        let fixed = self.ioctl_fixed()?;
        let var = self.ioctl_var()?;
        Ok(ScreenInfo {
            width: var.xres,
            height: var.yres,
            bits_per_pixel: var.bits_per_pixel,
            bytes_per_line: fixed.line_length,
            r_offset: var.red.offset,
            g_offset: var.green.offset,
            b_offset: var.blue.offset,
            total_size: fixed.smem_len as usize,
        })
    }

    fn mmap_screen(&self) -> Result<(*mut u8, usize), PlayerError> {
        let len = self.ioctl_fixed()?.smem_len as usize;
        // SAFETY: `self.fd` is a valid open framebuffer device fd; `len`
        // comes from the device's own fixed screeninfo.
        let ptr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                self.fd,
                0,
            )
        };
        if ptr == libc::MAP_FAILED {
            return Err(self.ioctl_err("mmap"));
        }
        Ok((ptr as *mut u8, len))
    }
}
