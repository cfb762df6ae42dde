//! CPU implementation of [`Gpu`]. Primary displays are Linux framebuffers
//! read through a shared mapping.

use std::collections::HashMap;
use std::path::PathBuf;

use drm_fourcc::DrmFourcc;
use tracing::{debug, info};

use super::{
    required_len, DisplayHandle, ElementHandle, Gpu, PixelFormat, ResourceHandle, UpdateHandle,
};
use crate::error::GpuError;
use crate::fbdev::{Framebuffer, OutputDevice, ReadMapping, VarInfo};
use crate::geometry::{scale_index, DisplayInfo, Rect};
use crate::transform::{SampleMap, Transform};

/// An RGB565 image held in memory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Image {
    pub width: u32,
    pub height: u32,
    pub pixels: Vec<u16>,
}

impl Image {
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            pixels: vec![0; width as usize * height as usize],
        }
    }

    #[inline]
    pub fn get(&self, x: u32, y: u32) -> u16 {
        self.pixels[y as usize * self.width as usize + x as usize]
    }

    #[inline]
    pub fn set(&mut self, x: u32, y: u32, value: u16) {
        let width = self.width as usize;
        self.pixels[y as usize * width + x as usize] = value;
    }
}

/// Something that can show pixels: the source of snapshots.
pub trait Screen {
    fn info(&self) -> DisplayInfo;
    /// Write the current screen contents into `dst`, scaled to its size.
    fn capture(&mut self, dst: &mut Image) -> Result<(), GpuError>;
}

type ScreenOpener = Box<dyn FnMut(u32) -> Result<Box<dyn Screen>, GpuError>>;

enum Display {
    Screen(Box<dyn Screen>),
    Offscreen(ResourceHandle),
}

#[derive(Clone, Copy)]
struct Element {
    display: DisplayHandle,
    dest: Rect,
    source: ResourceHandle,
    src: Rect,
    transform: Transform,
}

pub struct SoftwareGpu {
    open_screen: ScreenOpener,
    next_handle: u32,
    displays: HashMap<u32, Display>,
    resources: HashMap<u32, Image>,
    elements: HashMap<u32, Element>,
    updates: HashMap<u32, Vec<ElementHandle>>,
}

impl SoftwareGpu {
    /// Primary display `N` is read from `/dev/fbN`.
    pub fn fbdev() -> Self {
        Self::new(|index| {
            let screen = FbdevScreen::open(index)?;
            Ok(Box::new(screen) as Box<dyn Screen>)
        })
    }

    pub fn new<F>(open_screen: F) -> Self
    where
        F: FnMut(u32) -> Result<Box<dyn Screen>, GpuError> + 'static,
    {
        Self {
            open_screen: Box::new(open_screen),
            next_handle: 1,
            displays: HashMap::new(),
            resources: HashMap::new(),
            elements: HashMap::new(),
            updates: HashMap::new(),
        }
    }

    fn allocate_handle(&mut self) -> u32 {
        let handle = self.next_handle;
        self.next_handle += 1;
        handle
    }

    fn resource(&self, handle: ResourceHandle) -> Result<&Image, GpuError> {
        self.resources.get(&handle.0).ok_or(GpuError::InvalidHandle {
            kind: "resource",
            handle: handle.0,
        })
    }

    fn display(&mut self, handle: DisplayHandle) -> Result<&mut Display, GpuError> {
        self.displays
            .get_mut(&handle.0)
            .ok_or(GpuError::InvalidHandle {
                kind: "display",
                handle: handle.0,
            })
    }

    fn compose(&mut self, element: ElementHandle) -> Result<(), GpuError> {
        let Element {
            display,
            dest,
            source,
            src,
            transform,
        } = *self.elements.get(&element.0).ok_or(GpuError::InvalidHandle {
            kind: "element",
            handle: element.0,
        })?;

        let target = match self.display(display)? {
            Display::Offscreen(resource) => *resource,
            // Elements on real displays are scanned out, nothing to render here
            Display::Screen(_) => return Ok(()),
        };
        if target == source {
            return Err(GpuError::UnsupportedFormat(
                "element renders into its own source".to_string(),
            ));
        }

        let mut out = self
            .resources
            .remove(&target.0)
            .ok_or(GpuError::InvalidHandle {
                kind: "resource",
                handle: target.0,
            })?;
        let result = self
            .resource(source)
            .map(|image| render_element(image, src.from_fixed(), &mut out, dest, transform));
        self.resources.insert(target.0, out);
        result
    }
}

/// Render the `crop` region of `src` into `dest` of `out`, transformed.
fn render_element(src: &Image, crop: Rect, out: &mut Image, dest: Rect, transform: Transform) {
    if crop.is_empty() || dest.is_empty() {
        return;
    }
    let map = SampleMap::new(
        transform,
        crop.width as u32,
        crop.height as u32,
        dest.width as u32,
        dest.height as u32,
    );

    // Clip the destination to the target image
    let x0 = dest.x.max(0);
    let y0 = dest.y.max(0);
    let x1 = (dest.x as i64 + dest.width as i64).min(out.width as i64) as i32;
    let y1 = (dest.y as i64 + dest.height as i64).min(out.height as i64) as i32;

    for y in y0..y1 {
        for x in x0..x1 {
            let (sx, sy) = map.source((x - dest.x) as u32, (y - dest.y) as u32);
            let sx = crop.x as i64 + sx as i64;
            let sy = crop.y as i64 + sy as i64;
            // Outside the source reads as black
            let value = if (0..src.width as i64).contains(&sx) && (0..src.height as i64).contains(&sy)
            {
                src.get(sx as u32, sy as u32)
            } else {
                0
            };
            out.set(x as u32, y as u32, value);
        }
    }
}

impl Gpu for SoftwareGpu {
    fn open_display(&mut self, index: u32) -> Result<DisplayHandle, GpuError> {
        let screen = (self.open_screen)(index)?;
        let handle = self.allocate_handle();
        self.displays.insert(handle, Display::Screen(screen));
        Ok(DisplayHandle(handle))
    }

    fn display_info(&mut self, display: DisplayHandle) -> Result<DisplayInfo, GpuError> {
        let resource = match self.display(display)? {
            Display::Screen(screen) => return Ok(screen.info()),
            Display::Offscreen(resource) => *resource,
        };
        let image = self.resource(resource)?;
        Ok(DisplayInfo::new(image.width, image.height))
    }

    fn close_display(&mut self, display: DisplayHandle) {
        if self.displays.remove(&display.0).is_some() {
            self.elements.retain(|_, element| element.display != display);
        }
    }

    fn create_resource(
        &mut self,
        format: PixelFormat,
        width: u32,
        height: u32,
    ) -> Result<ResourceHandle, GpuError> {
        let PixelFormat::Rgb565 = format;
        if width == 0 || height == 0 {
            return Err(GpuError::NoHandle {
                call: "create_resource",
            });
        }
        let handle = self.allocate_handle();
        self.resources.insert(handle, Image::new(width, height));
        Ok(ResourceHandle(handle))
    }

    fn delete_resource(&mut self, resource: ResourceHandle) {
        self.resources.remove(&resource.0);
    }

    fn snapshot(&mut self, display: DisplayHandle, resource: ResourceHandle) -> Result<(), GpuError> {
        let mut image = self
            .resources
            .remove(&resource.0)
            .ok_or(GpuError::InvalidHandle {
                kind: "resource",
                handle: resource.0,
            })?;
        let result = match self.display(display) {
            Ok(Display::Screen(screen)) => screen.capture(&mut image),
            Ok(Display::Offscreen(_)) => Err(GpuError::UnsupportedFormat(
                "snapshot of an offscreen display".to_string(),
            )),
            Err(e) => Err(e),
        };
        self.resources.insert(resource.0, image);
        result
    }

    fn open_offscreen(&mut self, resource: ResourceHandle) -> Result<DisplayHandle, GpuError> {
        self.resource(resource)?;
        let handle = self.allocate_handle();
        self.displays.insert(handle, Display::Offscreen(resource));
        Ok(DisplayHandle(handle))
    }

    fn begin_update(&mut self) -> Result<UpdateHandle, GpuError> {
        let handle = self.allocate_handle();
        self.updates.insert(handle, Vec::new());
        Ok(UpdateHandle(handle))
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
        self.display(display)?;
        self.resource(source)?;
        if !self.updates.contains_key(&update.0) {
            return Err(GpuError::InvalidHandle {
                kind: "update",
                handle: update.0,
            });
        }

        let handle = ElementHandle(self.allocate_handle());
        self.elements.insert(
            handle.0,
            Element {
                display,
                dest: dest_rect,
                source,
                src: src_rect,
                transform,
            },
        );
        if let Some(pending) = self.updates.get_mut(&update.0) {
            pending.push(handle);
        }
        Ok(handle)
    }

    fn element_modified(
        &mut self,
        update: UpdateHandle,
        element: ElementHandle,
        _rect: Rect,
    ) -> Result<(), GpuError> {
        if !self.elements.contains_key(&element.0) {
            return Err(GpuError::InvalidHandle {
                kind: "element",
                handle: element.0,
            });
        }
        let pending = self
            .updates
            .get_mut(&update.0)
            .ok_or(GpuError::InvalidHandle {
                kind: "update",
                handle: update.0,
            })?;
        if !pending.contains(&element) {
            pending.push(element);
        }
        Ok(())
    }

    fn submit_update_sync(&mut self, update: UpdateHandle) -> Result<(), GpuError> {
        let pending = self
            .updates
            .remove(&update.0)
            .ok_or(GpuError::InvalidHandle {
                kind: "update",
                handle: update.0,
            })?;
        for element in pending {
            self.compose(element)?;
        }
        Ok(())
    }

    fn read_pixels(
        &mut self,
        resource: ResourceHandle,
        rect: Rect,
        out: &mut [u8],
        pitch: usize,
    ) -> Result<(), GpuError> {
        let image = self.resource(resource)?;
        let bpp = PixelFormat::Rgb565.bytes_per_pixel();

        // Only the part of rect that lies inside the image is read
        let x0 = rect.x.clamp(0, image.width as i32) as u32;
        let y0 = rect.y.clamp(0, image.height as i32) as u32;
        let x1 = (rect.x as i64 + rect.width as i64).clamp(0, image.width as i64) as u32;
        let y1 = (rect.y as i64 + rect.height as i64).clamp(0, image.height as i64) as u32;
        if x1 <= x0 || y1 <= y0 {
            return Ok(());
        }

        let row_bytes = (x1 - x0) as usize * bpp;
        let needed = required_len(row_bytes, (y1 - y0) as usize, pitch);
        if out.len() < needed || pitch < row_bytes {
            return Err(GpuError::BufferTooSmall {
                needed,
                available: out.len(),
            });
        }

        for (row, y) in (y0..y1).enumerate() {
            let start = y as usize * image.width as usize;
            let line = &image.pixels[start + x0 as usize..start + x1 as usize];
            let dst = &mut out[row * pitch..row * pitch + row_bytes];
            for (chunk, pixel) in dst.chunks_exact_mut(bpp).zip(line) {
                chunk.copy_from_slice(&pixel.to_ne_bytes());
            }
        }
        Ok(())
    }
}

/// A primary display backed by a Linux framebuffer device.
pub struct FbdevScreen {
    path: PathBuf,
    var: VarInfo,
    fourcc: DrmFourcc,
    line_length: usize,
    memory: ReadMapping,
    _device: Framebuffer,
}

impl FbdevScreen {
    pub fn open(index: u32) -> Result<Self, GpuError> {
        let path = PathBuf::from(format!("/dev/fb{}", index));
        let wrap = |source| GpuError::Screen { index, source };

        let device = Framebuffer::open_read_only(&path).map_err(wrap)?;
        let fix = device.fixed_info().map_err(wrap)?;
        let var = device.var_info().map_err(wrap)?;
        let fourcc = var.fourcc().ok_or_else(|| {
            GpuError::UnsupportedFormat(format!(
                "{}: {} bpp with red/green/blue at {}/{}/{}",
                path.display(),
                var.bits_per_pixel,
                var.red.offset,
                var.green.offset,
                var.blue.offset
            ))
        })?;
        let line_length = match fix.line_length {
            0 => (var.xres * var.bytes_per_pixel()) as usize,
            n => n as usize,
        };
        let memory = device.map_read(fix.memory_len as usize).map_err(wrap)?;

        info!(
            "Reading primary display from {} ({}x{}, {:?})",
            path.display(),
            var.xres,
            var.yres,
            fourcc
        );

        Ok(Self {
            path,
            var,
            fourcc,
            line_length,
            memory,
            _device: device,
        })
    }
}

impl Screen for FbdevScreen {
    fn info(&self) -> DisplayInfo {
        DisplayInfo::new(self.var.xres, self.var.yres)
    }

    fn capture(&mut self, dst: &mut Image) -> Result<(), GpuError> {
        let bpp = self.var.bytes_per_pixel() as usize;
        let origin = self.var.yoffset as usize * self.line_length + self.var.xoffset as usize * bpp;
        let needed = origin
            + required_len(
                self.var.xres as usize * bpp,
                self.var.yres as usize,
                self.line_length,
            );
        if self.memory.len() < needed {
            debug!("{} is smaller than its visible area", self.path.display());
            return Err(GpuError::BufferTooSmall {
                needed,
                available: self.memory.len(),
            });
        }

        for y in 0..dst.height {
            let sy = scale_index(y, dst.height, self.var.yres) as usize;
            let row = origin + sy * self.line_length;
            for x in 0..dst.width {
                let sx = scale_index(x, dst.width, self.var.xres) as usize;
                let offset = row + sx * bpp;
                let pixel = to_rgb565(self.fourcc, &self.memory[offset..offset + bpp]);
                dst.set(x, y, pixel);
            }
        }
        Ok(())
    }
}

#[inline]
fn pack_rgb565(r: u8, g: u8, b: u8) -> u16 {
    ((r as u16 >> 3) << 11) | ((g as u16 >> 2) << 5) | (b as u16 >> 3)
}

/// Convert one native-endian pixel of the given layout to RGB565.
fn to_rgb565(fourcc: DrmFourcc, bytes: &[u8]) -> u16 {
    match fourcc {
        DrmFourcc::Rgb565 => u16::from_ne_bytes([bytes[0], bytes[1]]),
        DrmFourcc::Bgr565 => {
            let p = u16::from_ne_bytes([bytes[0], bytes[1]]);
            ((p & 0x1f) << 11) | (p & 0x07e0) | (p >> 11)
        }
        // Little-endian byte order: B, G, R
        DrmFourcc::Rgb888 | DrmFourcc::Xrgb8888 => pack_rgb565(bytes[2], bytes[1], bytes[0]),
        DrmFourcc::Bgr888 | DrmFourcc::Xbgr8888 => pack_rgb565(bytes[0], bytes[1], bytes[2]),
        _ => 0,
    }
}

/// Synthetic screens for tests.
#[cfg(test)]
pub mod testing {
    use std::cell::Cell;
    use std::rc::Rc;

    use super::*;

    /// A screen whose pixel at (x, y) is a function of the position and a
    /// shared frame counter.
    pub struct PatternScreen {
        pub info: DisplayInfo,
        pub frame: Rc<Cell<u16>>,
    }

    impl PatternScreen {
        pub fn new(width: u32, height: u32) -> Self {
            Self {
                info: DisplayInfo::new(width, height),
                frame: Rc::new(Cell::new(0)),
            }
        }

        pub fn pixel(x: u32, y: u32, frame: u16) -> u16 {
            ((x as u16) << 8 | (y as u16 & 0xff)).wrapping_add(frame)
        }
    }

    impl Screen for PatternScreen {
        fn info(&self) -> DisplayInfo {
            self.info
        }

        fn capture(&mut self, dst: &mut Image) -> Result<(), GpuError> {
            let frame = self.frame.get();
            for y in 0..dst.height {
                let sy = scale_index(y, dst.height, self.info.height);
                for x in 0..dst.width {
                    let sx = scale_index(x, dst.width, self.info.width);
                    dst.set(x, y, Self::pixel(sx, sy, frame));
                }
            }
            Ok(())
        }
    }

    pub fn pattern_gpu(width: u32, height: u32) -> SoftwareGpu {
        SoftwareGpu::new(move |_| Ok(Box::new(PatternScreen::new(width, height)) as Box<dyn Screen>))
    }
}
