pub mod dispmanx;
pub mod software;

#[cfg(test)]
pub mod mock;

pub use dispmanx::Dispmanx;
pub use software::SoftwareGpu;

use drm_fourcc::DrmFourcc;

use crate::error::GpuError;
use crate::geometry::{DisplayInfo, Rect};
use crate::transform::Transform;

/// Pixel format of image resources.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PixelFormat {
    #[default]
    Rgb565,
}

impl PixelFormat {
    pub fn bits_per_pixel(self) -> u32 {
        match self {
            PixelFormat::Rgb565 => 16,
        }
    }

    pub fn bytes_per_pixel(self) -> usize {
        self.bits_per_pixel() as usize / 8
    }

    pub fn fourcc(self) -> DrmFourcc {
        match self {
            PixelFormat::Rgb565 => DrmFourcc::Rgb565,
        }
    }
}

macro_rules! handle {
    ($name:ident) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        pub struct $name(pub u32);
    };
}

handle!(DisplayHandle);
handle!(ResourceHandle);
handle!(ElementHandle);
handle!(UpdateHandle);

/// Display capture and compositing, modelled on the VideoCore dispmanx API.
///
/// Displays are either real (opened by index) or offscreen (rendering into
/// a resource). Elements bind a source rectangle of a resource to a
/// destination rectangle of a display and are re-rendered when an update
/// that adds or modifies them is submitted.
pub trait Gpu {
    fn open_display(&mut self, index: u32) -> Result<DisplayHandle, GpuError>;
    fn display_info(&mut self, display: DisplayHandle) -> Result<DisplayInfo, GpuError>;
    fn close_display(&mut self, display: DisplayHandle);

    fn create_resource(
        &mut self,
        format: PixelFormat,
        width: u32,
        height: u32,
    ) -> Result<ResourceHandle, GpuError>;
    fn delete_resource(&mut self, resource: ResourceHandle);

    /// Copy the current contents of `display` into `resource`, scaled to its size.
    fn snapshot(&mut self, display: DisplayHandle, resource: ResourceHandle) -> Result<(), GpuError>;

    /// Open a display that composes into `resource`.
    fn open_offscreen(&mut self, resource: ResourceHandle) -> Result<DisplayHandle, GpuError>;

    fn begin_update(&mut self) -> Result<UpdateHandle, GpuError>;

    /// Add an opaque element. `src_rect` is in 16.16 fixed point.
    fn add_element(
        &mut self,
        update: UpdateHandle,
        display: DisplayHandle,
        dest_rect: Rect,
        source: ResourceHandle,
        src_rect: Rect,
        transform: Transform,
    ) -> Result<ElementHandle, GpuError>;

    fn element_modified(
        &mut self,
        update: UpdateHandle,
        element: ElementHandle,
        rect: Rect,
    ) -> Result<(), GpuError>;

    /// Apply the update and block until composition has finished.
    fn submit_update_sync(&mut self, update: UpdateHandle) -> Result<(), GpuError>;

    /// Copy `rect` of `resource` into `out`, one row every `pitch` bytes.
    fn read_pixels(
        &mut self,
        resource: ResourceHandle,
        rect: Rect,
        out: &mut [u8],
        pitch: usize,
    ) -> Result<(), GpuError>;
}

/// Bytes needed to hold `height` rows of `row_bytes` spaced `pitch` apart.
pub fn required_len(row_bytes: usize, height: usize, pitch: usize) -> usize {
    if height == 0 {
        0
    } else {
        pitch * (height - 1) + row_bytes
    }
}
