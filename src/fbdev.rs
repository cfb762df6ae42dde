//! Linux framebuffer devices (`/dev/fbN`): geometry queries and memory mapping.

use std::fs::{File, OpenOptions};
use std::num::NonZeroUsize;
use std::ops::{Deref, DerefMut};
use std::os::fd::AsRawFd;
use std::path::Path;
use std::ptr::NonNull;

use drm_fourcc::DrmFourcc;
use nix::sys::mman::{mmap, munmap, MapFlags, ProtFlags};
use serde::Serialize;
use tracing::debug;

use crate::error::DeviceError;

/// Fixed device information: how much pixel memory there is and how it is laid out.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct FixedInfo {
    pub memory_len: u32,
    pub line_length: u32,
}

/// A colour channel's position inside a pixel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct Channel {
    pub offset: u32,
    pub length: u32,
}

/// Variable device information: the current video mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct VarInfo {
    pub xres: u32,
    pub yres: u32,
    pub xoffset: u32,
    pub yoffset: u32,
    pub bits_per_pixel: u32,
    pub red: Channel,
    pub green: Channel,
    pub blue: Channel,
}

impl VarInfo {
    pub fn bytes_per_pixel(&self) -> u32 {
        self.bits_per_pixel.div_ceil(8)
    }

    /// Identify the pixel layout, if it is one we can read.
    pub fn fourcc(&self) -> Option<DrmFourcc> {
        let rgb = (self.red.offset, self.green.offset, self.blue.offset);
        match (self.bits_per_pixel, rgb) {
            (16, (11, 5, 0)) => Some(DrmFourcc::Rgb565),
            (16, (0, 5, 11)) => Some(DrmFourcc::Bgr565),
            (24, (16, 8, 0)) => Some(DrmFourcc::Rgb888),
            (24, (0, 8, 16)) => Some(DrmFourcc::Bgr888),
            (32, (16, 8, 0)) => Some(DrmFourcc::Xrgb8888),
            (32, (0, 8, 16)) => Some(DrmFourcc::Xbgr8888),
            _ => None,
        }
    }
}

/// A raw pixel output device.
pub trait OutputDevice {
    type Mapping: DerefMut<Target = [u8]>;

    fn fixed_info(&self) -> Result<FixedInfo, DeviceError>;
    fn var_info(&self) -> Result<VarInfo, DeviceError>;
    /// Map `len` bytes of writable pixel memory. Unmapped when the mapping drops.
    fn map(&self, len: usize) -> Result<Self::Mapping, DeviceError>;
}

mod ioctl {
    use nix::libc::{c_char, c_ulong};

    #[repr(C)]
    #[derive(Default)]
    pub struct FbBitfield {
        pub offset: u32,
        pub length: u32,
        pub msb_right: u32,
    }

    #[repr(C)]
    #[derive(Default)]
    pub struct FbFixScreeninfo {
        pub id: [c_char; 16],
        pub smem_start: c_ulong,
        pub smem_len: u32,
        pub type_: u32,
        pub type_aux: u32,
        pub visual: u32,
        pub xpanstep: u16,
        pub ypanstep: u16,
        pub ywrapstep: u16,
        pub line_length: u32,
        pub mmio_start: c_ulong,
        pub mmio_len: u32,
        pub accel: u32,
        pub capabilities: u16,
        pub reserved: [u16; 2],
    }

    #[repr(C)]
    #[derive(Default)]
    pub struct FbVarScreeninfo {
        pub xres: u32,
        pub yres: u32,
        pub xres_virtual: u32,
        pub yres_virtual: u32,
        pub xoffset: u32,
        pub yoffset: u32,
        pub bits_per_pixel: u32,
        pub grayscale: u32,
        pub red: FbBitfield,
        pub green: FbBitfield,
        pub blue: FbBitfield,
        pub transp: FbBitfield,
        pub nonstd: u32,
        pub activate: u32,
        pub height: u32,
        pub width: u32,
        pub accel_flags: u32,
        pub pixclock: u32,
        pub left_margin: u32,
        pub right_margin: u32,
        pub upper_margin: u32,
        pub lower_margin: u32,
        pub hsync_len: u32,
        pub vsync_len: u32,
        pub sync: u32,
        pub vmode: u32,
        pub rotate: u32,
        pub colorspace: u32,
        pub reserved: [u32; 4],
    }

    // linux/fb.h uses plain request numbers for these
    nix::ioctl_read_bad!(get_vscreeninfo, 0x4600, FbVarScreeninfo);
    nix::ioctl_read_bad!(get_fscreeninfo, 0x4602, FbFixScreeninfo);
}

/// An open framebuffer device. Closed on drop.
pub struct Framebuffer {
    file: File,
    path: String,
    writable: bool,
}

impl Framebuffer {
    /// Open for mirroring into (read/write, shared writable mappings).
    pub fn open(path: &Path) -> Result<Self, DeviceError> {
        Self::open_with(path, true)
    }

    /// Open for reading pixels only.
    pub fn open_read_only(path: &Path) -> Result<Self, DeviceError> {
        Self::open_with(path, false)
    }

    fn open_with(path: &Path, writable: bool) -> Result<Self, DeviceError> {
        let path = path.display().to_string();
        let file = OpenOptions::new()
            .read(true)
            .write(writable)
            .open(&path)
            .map_err(|source| DeviceError::Open {
                path: path.clone(),
                source,
            })?;
        debug!("Opened {} (writable: {})", path, writable);
        Ok(Self {
            file,
            path,
            writable,
        })
    }

    /// Map the device memory read-only.
    pub fn map_read(&self, len: usize) -> Result<ReadMapping, DeviceError> {
        RawMapping::new(&self.file, len, ProtFlags::PROT_READ).map(ReadMapping)
    }
}

impl OutputDevice for Framebuffer {
    type Mapping = Mapping;

    fn fixed_info(&self) -> Result<FixedInfo, DeviceError> {
        let mut info = ioctl::FbFixScreeninfo::default();
        unsafe { ioctl::get_fscreeninfo(self.file.as_raw_fd(), &mut info) }.map_err(
            |source| DeviceError::Ioctl {
                request: "FBIOGET_FSCREENINFO",
                source,
            },
        )?;
        Ok(FixedInfo {
            memory_len: info.smem_len,
            line_length: info.line_length,
        })
    }

    fn var_info(&self) -> Result<VarInfo, DeviceError> {
        let mut info = ioctl::FbVarScreeninfo::default();
        unsafe { ioctl::get_vscreeninfo(self.file.as_raw_fd(), &mut info) }.map_err(
            |source| DeviceError::Ioctl {
                request: "FBIOGET_VSCREENINFO",
                source,
            },
        )?;
        let channel = |field: &ioctl::FbBitfield| Channel {
            offset: field.offset,
            length: field.length,
        };
        Ok(VarInfo {
            xres: info.xres,
            yres: info.yres,
            xoffset: info.xoffset,
            yoffset: info.yoffset,
            bits_per_pixel: info.bits_per_pixel,
            red: channel(&info.red),
            green: channel(&info.green),
            blue: channel(&info.blue),
        })
    }

    fn map(&self, len: usize) -> Result<Mapping, DeviceError> {
        if !self.writable {
            return Err(DeviceError::ReadOnly {
                path: self.path.clone(),
            });
        }
        let prot = ProtFlags::PROT_READ | ProtFlags::PROT_WRITE;
        RawMapping::new(&self.file, len, prot).map(Mapping)
    }
}

/// A shared mapping of framebuffer memory. Unmapped on drop.
struct RawMapping {
    ptr: NonNull<u8>,
    len: usize,
}

impl RawMapping {
    fn new(file: &File, len: usize, prot: ProtFlags) -> Result<Self, DeviceError> {
        let length = NonZeroUsize::new(len).ok_or(DeviceError::EmptyMemory)?;
        let ptr = unsafe { mmap(None, length, prot, MapFlags::MAP_SHARED, file, 0) }
            .map_err(|source| DeviceError::Map { len, source })?;
        debug!("Mapped {} bytes of framebuffer memory", len);
        Ok(Self {
            ptr: ptr.cast(),
            len,
        })
    }

    fn bytes(&self) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), self.len) }
    }
}

impl Drop for RawMapping {
    fn drop(&mut self) {
        let _ = unsafe { munmap(self.ptr.cast(), self.len) };
    }
}

/// Writable framebuffer memory.
pub struct Mapping(RawMapping);

impl Deref for Mapping {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        self.0.bytes()
    }
}

impl DerefMut for Mapping {
    fn deref_mut(&mut self) -> &mut [u8] {
        // Only created from PROT_WRITE mappings
        unsafe { std::slice::from_raw_parts_mut(self.0.ptr.as_ptr(), self.0.len) }
    }
}

/// Framebuffer memory mapped with `PROT_READ` only.
pub struct ReadMapping(RawMapping);

impl Deref for ReadMapping {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        self.0.bytes()
    }
}
