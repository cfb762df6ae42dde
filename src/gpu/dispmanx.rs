//! VideoCore dispmanx backend, loaded from `libbcm_host.so` at runtime.

use std::ffi::c_void;

use libloading::Library;
use tracing::{debug, info};

use super::{
    required_len, DisplayHandle, ElementHandle, Gpu, PixelFormat, ResourceHandle, UpdateHandle,
};
use crate::error::GpuError;
use crate::geometry::{DisplayInfo, Rect};
use crate::transform::{Rotation, Transform};

const LIBRARY_PATHS: &[&str] = &["libbcm_host.so", "/opt/vc/lib/libbcm_host.so"];

// vc_image_types.h
const VC_IMAGE_RGB565: u32 = 1;

// vc_dispmanx_types.h
const DISPMANX_NO_ROTATE: u32 = 0;
const DISPMANX_ROTATE_90: u32 = 1;
const DISPMANX_ROTATE_180: u32 = 2;
const DISPMANX_ROTATE_270: u32 = 3;
const DISPMANX_FLIP_HRIZ: u32 = 1 << 16;
const DISPMANX_FLIP_VERT: u32 = 1 << 17;
const DISPMANX_PROTECTION_NONE: u32 = 0;
const DISPMANX_FLAGS_ALPHA_FROM_SOURCE: u32 = 0;
const DISPMANX_FLAGS_ALPHA_FIXED_ALL_PIXELS: u32 = 1;
const DISPMANX_NO_HANDLE: u32 = 0;

#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
#[allow(dead_code)]
struct VcRect {
    x: i32,
    y: i32,
    width: i32,
    height: i32,
}

impl From<Rect> for VcRect {
    fn from(rect: Rect) -> Self {
        Self {
            x: rect.x,
            y: rect.y,
            width: rect.width,
            height: rect.height,
        }
    }
}

#[repr(C)]
#[derive(Debug, Default)]
#[allow(dead_code)]
struct ModeInfo {
    width: i32,
    height: i32,
    transform: u32,
    input_format: u32,
    display_num: u32,
}

#[repr(C)]
#[allow(dead_code)]
struct Alpha {
    flags: u32,
    opacity: u32,
    mask: u32,
}

/// Encode a transform as `DISPMANX_TRANSFORM_T` bits.
pub fn transform_bits(transform: Transform) -> u32 {
    let mut bits = match transform.rotation {
        Rotation::None => DISPMANX_NO_ROTATE,
        Rotation::Cw90 => DISPMANX_ROTATE_90,
        Rotation::Cw180 => DISPMANX_ROTATE_180,
        Rotation::Cw270 => DISPMANX_ROTATE_270,
    };
    if transform.flip_vertical {
        bits |= DISPMANX_FLIP_VERT;
    }
    if transform.flip_horizontal {
        bits |= DISPMANX_FLIP_HRIZ;
    }
    bits
}

fn image_type(format: PixelFormat) -> u32 {
    match format {
        PixelFormat::Rgb565 => VC_IMAGE_RGB565,
    }
}

struct Api {
    host_init: unsafe extern "C" fn(),
    host_deinit: unsafe extern "C" fn(),
    display_open: unsafe extern "C" fn(u32) -> u32,
    display_open_offscreen: unsafe extern "C" fn(u32, u32) -> u32,
    display_close: unsafe extern "C" fn(u32) -> i32,
    display_get_info: unsafe extern "C" fn(u32, *mut ModeInfo) -> i32,
    resource_create: unsafe extern "C" fn(u32, u32, u32, *mut u32) -> u32,
    resource_delete: unsafe extern "C" fn(u32) -> i32,
    resource_read_data: unsafe extern "C" fn(u32, *const VcRect, *mut c_void, u32) -> i32,
    snapshot: unsafe extern "C" fn(u32, u32, u32) -> i32,
    update_start: unsafe extern "C" fn(i32) -> u32,
    #[allow(clippy::type_complexity)]
    element_add: unsafe extern "C" fn(
        u32,
        u32,
        i32,
        *const VcRect,
        u32,
        *const VcRect,
        u32,
        *mut Alpha,
        *mut c_void,
        u32,
    ) -> u32,
    element_modified: unsafe extern "C" fn(u32, u32, *const VcRect) -> i32,
    update_submit_sync: unsafe extern "C" fn(u32) -> i32,
}

unsafe fn symbol<T: Copy>(lib: &Library, name: &[u8]) -> Result<T, libloading::Error> {
    Ok(*lib.get::<T>(name)?)
}

impl Api {
    unsafe fn load(lib: &Library) -> Result<Self, libloading::Error> {
        Ok(Self {
            host_init: symbol(lib, b"bcm_host_init\0")?,
            host_deinit: symbol(lib, b"bcm_host_deinit\0")?,
            display_open: symbol(lib, b"vc_dispmanx_display_open\0")?,
            display_open_offscreen: symbol(lib, b"vc_dispmanx_display_open_offscreen\0")?,
            display_close: symbol(lib, b"vc_dispmanx_display_close\0")?,
            display_get_info: symbol(lib, b"vc_dispmanx_display_get_info\0")?,
            resource_create: symbol(lib, b"vc_dispmanx_resource_create\0")?,
            resource_delete: symbol(lib, b"vc_dispmanx_resource_delete\0")?,
            resource_read_data: symbol(lib, b"vc_dispmanx_resource_read_data\0")?,
            snapshot: symbol(lib, b"vc_dispmanx_snapshot\0")?,
            update_start: symbol(lib, b"vc_dispmanx_update_start\0")?,
            element_add: symbol(lib, b"vc_dispmanx_element_add\0")?,
            element_modified: symbol(lib, b"vc_dispmanx_element_modified\0")?,
            update_submit_sync: symbol(lib, b"vc_dispmanx_update_submit_sync\0")?,
        })
    }
}

pub struct Dispmanx {
    api: Api,
    // Keeps the function pointers in `api` valid
    _lib: Library,
}

impl Dispmanx {
    pub fn load() -> Result<Self, GpuError> {
        let mut last_error = GpuError::NoHandle { call: "dlopen" };
        for path in LIBRARY_PATHS {
            match unsafe { Library::new(path) } {
                Ok(lib) => {
                    let api = unsafe { Api::load(&lib) }.map_err(|source| GpuError::Library {
                        library: path.to_string(),
                        source,
                    })?;
                    unsafe { (api.host_init)() };
                    info!("Using dispmanx from {}", path);
                    return Ok(Self { api, _lib: lib });
                }
                Err(e) => {
                    debug!("Could not load {}: {}", path, e);
                    last_error = GpuError::Library {
                        library: path.to_string(),
                        source: e,
                    };
                }
            }
        }
        Err(last_error)
    }
}

fn status(call: &'static str, status: i32) -> Result<(), GpuError> {
    if status == 0 {
        Ok(())
    } else {
        Err(GpuError::Status { call, status })
    }
}

fn handle(call: &'static str, handle: u32) -> Result<u32, GpuError> {
    if handle == DISPMANX_NO_HANDLE {
        Err(GpuError::NoHandle { call })
    } else {
        Ok(handle)
    }
}

impl Gpu for Dispmanx {
    fn open_display(&mut self, index: u32) -> Result<DisplayHandle, GpuError> {
        let display = unsafe { (self.api.display_open)(index) };
        handle("vc_dispmanx_display_open", display).map(DisplayHandle)
    }

    fn display_info(&mut self, display: DisplayHandle) -> Result<DisplayInfo, GpuError> {
        let mut info = ModeInfo::default();
        let ret = unsafe { (self.api.display_get_info)(display.0, &mut info) };
        status("vc_dispmanx_display_get_info", ret)?;
        Ok(DisplayInfo::new(info.width.max(0) as u32, info.height.max(0) as u32))
    }

    fn close_display(&mut self, display: DisplayHandle) {
        let id = display.0;
        let ret = unsafe { (self.api.display_close)(id) };
        if ret != 0 {
            debug!("vc_dispmanx_display_close({}) returned {}", id, ret);
        }
    }

    fn create_resource(
        &mut self,
        format: PixelFormat,
        width: u32,
        height: u32,
    ) -> Result<ResourceHandle, GpuError> {
        let mut native_image = 0u32;
        let resource =
            unsafe { (self.api.resource_create)(image_type(format), width, height, &mut native_image) };
        handle("vc_dispmanx_resource_create", resource).map(ResourceHandle)
    }

    fn delete_resource(&mut self, resource: ResourceHandle) {
        let ret = unsafe { (self.api.resource_delete)(resource.0) };
        if ret != 0 {
            debug!("vc_dispmanx_resource_delete({}) returned {}", resource.0, ret);
        }
    }

    fn snapshot(&mut self, display: DisplayHandle, resource: ResourceHandle) -> Result<(), GpuError> {
        let ret = unsafe { (self.api.snapshot)(display.0, resource.0, DISPMANX_NO_ROTATE) };
        status("vc_dispmanx_snapshot", ret)
    }

    fn open_offscreen(&mut self, resource: ResourceHandle) -> Result<DisplayHandle, GpuError> {
        let display = unsafe { (self.api.display_open_offscreen)(resource.0, DISPMANX_NO_ROTATE) };
        handle("vc_dispmanx_display_open_offscreen", display).map(DisplayHandle)
    }

    fn begin_update(&mut self) -> Result<UpdateHandle, GpuError> {
        let update = unsafe { (self.api.update_start)(0) };
        handle("vc_dispmanx_update_start", update).map(UpdateHandle)
    }

    fn add_element(
        &mut self,
        update: UpdateHandle,
        display: DisplayHandle,
        dest_rect: Rect,
        source: ResourceHandle,
        src_rect: Rect,
        transform: Transform,
    ) -> Result<ElementHandle, GpuError> {
        let dest = VcRect::from(dest_rect);
        let src = VcRect::from(src_rect);
        // Totally opaque
        let mut alpha = Alpha {
            flags: DISPMANX_FLAGS_ALPHA_FROM_SOURCE | DISPMANX_FLAGS_ALPHA_FIXED_ALL_PIXELS,
            opacity: 255,
            mask: DISPMANX_NO_HANDLE,
        };
        let element = unsafe {
            (self.api.element_add)(
                update.0,
                display.0,
                0,
                &dest,
                source.0,
                &src,
                DISPMANX_PROTECTION_NONE,
                &mut alpha,
                std::ptr::null_mut(),
                transform_bits(transform),
            )
        };
        handle("vc_dispmanx_element_add", element).map(ElementHandle)
    }

    fn element_modified(
        &mut self,
        update: UpdateHandle,
        element: ElementHandle,
        rect: Rect,
    ) -> Result<(), GpuError> {
        let rect = VcRect::from(rect);
        let ret = unsafe { (self.api.element_modified)(update.0, element.0, &rect) };
        status("vc_dispmanx_element_modified", ret)
    }

    fn submit_update_sync(&mut self, update: UpdateHandle) -> Result<(), GpuError> {
        let ret = unsafe { (self.api.update_submit_sync)(update.0) };
        status("vc_dispmanx_update_submit_sync", ret)
    }

    fn read_pixels(
        &mut self,
        resource: ResourceHandle,
        rect: Rect,
        out: &mut [u8],
        pitch: usize,
    ) -> Result<(), GpuError> {
        let row_bytes = rect.width.max(0) as usize * PixelFormat::Rgb565.bytes_per_pixel();
        let needed = required_len(row_bytes, rect.height.max(0) as usize, pitch);
        if out.len() < needed || pitch < row_bytes {
            return Err(GpuError::BufferTooSmall {
                needed,
                available: out.len(),
            });
        }
        let vc_rect = VcRect::from(rect);
        let ret = unsafe {
            (self.api.resource_read_data)(
                resource.0,
                &vc_rect,
                out.as_mut_ptr() as *mut c_void,
                pitch as u32,
            )
        };
        status("vc_dispmanx_resource_read_data", ret)
    }
}

impl Drop for Dispmanx {
    fn drop(&mut self) {
        unsafe { (self.api.host_deinit)() };
    }
}
