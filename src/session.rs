use std::path::{Path, PathBuf};

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::error::{DeviceError, MirrorError, Result, Stage, Step};
use crate::fbdev::{FixedInfo, OutputDevice, VarInfo};
use crate::geometry::{destination_rect, CropSpec, DisplayInfo, Rect, ScaleMode};
use crate::gpu::{required_len, DisplayHandle, ElementHandle, Gpu, PixelFormat, ResourceHandle};
use crate::mirror::Cycle;
use crate::transform::Transform;

/// What to mirror and how.
#[derive(Debug, Clone)]
pub struct MirrorConfig {
    pub display_index: u32,
    pub device_path: PathBuf,
    pub crop: CropSpec,
    pub transform: Transform,
    pub scale: ScaleMode,
}

impl Default for MirrorConfig {
    fn default() -> Self {
        Self {
            display_index: 0,
            device_path: PathBuf::from("/dev/fb1"),
            crop: CropSpec::default(),
            transform: Transform::default(),
            scale: ScaleMode::default(),
        }
    }
}

impl MirrorConfig {
    /// Anything beyond a straight full-screen copy needs the offscreen stage.
    pub fn needs_transform(&self) -> bool {
        !self.transform.is_identity() || self.crop.is_requested() || self.scale != ScaleMode::Stretch
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    Passthrough,
    Transform,
}

/// Geometry resolved once at startup.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Plan {
    pub primary: DisplayInfo,
    pub secondary: DisplayInfo,
    pub bits_per_pixel: u32,
    pub pitch: usize,
    pub memory_len: usize,
    pub mode: Mode,
    pub crop: Rect,
    /// `crop` in 16.16 fixed point
    #[serde(skip)]
    pub crop_fixed: Rect,
    pub dest: Rect,
    pub transform: Transform,
    pub scale: ScaleMode,
}

impl Plan {
    pub fn resolve(
        config: &MirrorConfig,
        primary: DisplayInfo,
        fix: FixedInfo,
        var: VarInfo,
    ) -> Result<Plan> {
        let format = PixelFormat::Rgb565;
        if var.bits_per_pixel != format.bits_per_pixel() {
            return Err(MirrorError::UnsupportedDepth(var.bits_per_pixel));
        }
        let secondary = DisplayInfo::new(var.xres, var.yres);

        let crop = config.crop.resolve(primary)?;
        if !crop.fits_within(primary) {
            warn!(
                "Crop {}x{}+{}+{} extends beyond the {}x{} primary display",
                crop.width, crop.height, crop.x, crop.y, primary.width, primary.height
            );
        }
        let crop_fixed = crop.to_fixed().ok_or(MirrorError::InvalidCrop {
            left: crop.x,
            top: crop.y,
            width: crop.width,
            height: crop.height,
        })?;

        let mode = if config.needs_transform() {
            Mode::Transform
        } else {
            Mode::Passthrough
        };
        let (src_w, src_h) = config
            .transform
            .output_size(crop.width as u32, crop.height as u32);
        let dest = destination_rect(config.scale, src_w, src_h, secondary);

        let row_bytes = secondary.width as usize * format.bytes_per_pixel();
        let pitch = match fix.line_length as usize {
            0 => row_bytes,
            n => n,
        };
        let memory_len = fix.memory_len as usize;
        if pitch < row_bytes {
            return Err(MirrorError::PitchTooSmall { pitch, row_bytes });
        }
        let needed = required_len(row_bytes, secondary.height as usize, pitch);
        if needed > memory_len {
            return Err(MirrorError::MappingTooSmall {
                needed,
                available: memory_len,
            });
        }

        Ok(Plan {
            primary,
            secondary,
            bits_per_pixel: var.bits_per_pixel,
            pitch,
            memory_len,
            mode,
            crop,
            crop_fixed,
            dest,
            transform: config.transform,
            scale: config.scale,
        })
    }

    /// Size of the snapshot buffer: the whole primary display when it is
    /// re-composed, otherwise the secondary size the snapshot scales to.
    pub fn capture_size(&self) -> DisplayInfo {
        match self.mode {
            Mode::Transform => self.primary,
            Mode::Passthrough => self.secondary,
        }
    }

    /// Bytes written into the secondary mapping per frame.
    pub fn frame_len(&self) -> usize {
        required_len(
            self.secondary.width as usize * PixelFormat::Rgb565.bytes_per_pixel(),
            self.secondary.height as usize,
            self.pitch,
        )
    }
}

/// Query both ends and resolve the plan without allocating any buffer.
pub fn probe<G, D, F>(gpu: &mut G, config: &MirrorConfig, open_device: F) -> Result<Plan>
where
    G: Gpu,
    D: OutputDevice,
    F: FnOnce(&Path) -> Result<D, DeviceError>,
{
    let display = gpu
        .open_display(config.display_index)
        .map_err(MirrorError::gpu(Step::OpenDisplay))?;
    let primary = gpu.display_info(display);
    gpu.close_display(display);
    let primary = primary.map_err(MirrorError::gpu(Step::QueryDisplay))?;

    let device = open_device(&config.device_path).map_err(MirrorError::device(Step::OpenDevice))?;
    let fix = device
        .fixed_info()
        .map_err(MirrorError::device(Step::QueryDevice))?;
    let var = device
        .var_info()
        .map_err(MirrorError::device(Step::QueryDevice))?;
    Plan::resolve(config, primary, fix, var)
}

/// Everything acquired for a session. Dropping releases it, last acquired first.
struct Resources<G: Gpu, D: OutputDevice> {
    gpu: G,
    display: Option<DisplayHandle>,
    device: Option<D>,
    mapping: Option<D::Mapping>,
    capture: Option<ResourceHandle>,
    presentation: Option<ResourceHandle>,
    offscreen: Option<DisplayHandle>,
}

impl<G: Gpu, D: OutputDevice> Resources<G, D> {
    fn new(gpu: G) -> Self {
        Self {
            gpu,
            display: None,
            device: None,
            mapping: None,
            capture: None,
            presentation: None,
            offscreen: None,
        }
    }
}

impl<G: Gpu, D: OutputDevice> Drop for Resources<G, D> {
    fn drop(&mut self) {
        // The offscreen display takes its element with it
        if let Some(offscreen) = self.offscreen.take() {
            self.gpu.close_display(offscreen);
        }
        if let Some(resource) = self.presentation.take() {
            self.gpu.delete_resource(resource);
        }
        if let Some(resource) = self.capture.take() {
            self.gpu.delete_resource(resource);
        }
        drop(self.mapping.take());
        drop(self.device.take());
        if let Some(display) = self.display.take() {
            self.gpu.close_display(display);
        }
        debug!("Released mirror resources");
    }
}

/// The offscreen stage that crops, scales and rotates the snapshot.
struct TransformStage {
    presentation: ResourceHandle,
    element: ElementHandle,
    crop: Rect,
}

/// A fully constructed mirroring session.
pub struct MirrorSession<G: Gpu, D: OutputDevice> {
    res: Resources<G, D>,
    plan: Plan,
    display: DisplayHandle,
    capture: ResourceHandle,
    stage: Option<TransformStage>,
}

impl<G: Gpu, D: OutputDevice> MirrorSession<G, D> {
    /// Acquire everything needed to mirror. On failure, whatever was
    /// acquired so far is released before the error is returned.
    pub fn start<F>(gpu: G, config: &MirrorConfig, open_device: F) -> Result<Self>
    where
        F: FnOnce(&Path) -> Result<D, DeviceError>,
    {
        let mut res = Resources::new(gpu);
        let format = PixelFormat::Rgb565;

        let display = res
            .gpu
            .open_display(config.display_index)
            .map_err(MirrorError::gpu(Step::OpenDisplay))?;
        res.display = Some(display);
        let primary = res
            .gpu
            .display_info(display)
            .map_err(MirrorError::gpu(Step::QueryDisplay))?;
        info!("Primary display is {} x {}", primary.width, primary.height);

        let device = open_device(&config.device_path).map_err(MirrorError::device(Step::OpenDevice))?;
        let device = res.device.insert(device);
        let fix = device
            .fixed_info()
            .map_err(MirrorError::device(Step::QueryDevice))?;
        let var = device
            .var_info()
            .map_err(MirrorError::device(Step::QueryDevice))?;
        info!(
            "Secondary display is {} x {} {}bpp",
            var.xres, var.yres, var.bits_per_pixel
        );

        let plan = Plan::resolve(config, primary, fix, var)?;
        info!("Mirroring in {:?} mode", plan.mode);
        debug!(
            "Writing {} bytes per frame, {} bytes per line",
            plan.frame_len(),
            plan.pitch
        );

        let mapping = device
            .map(plan.memory_len)
            .map_err(MirrorError::device(Step::MapMemory))?;
        res.mapping = Some(mapping);

        // Allocated once, overwritten by every snapshot
        let size = plan.capture_size();
        let capture = res
            .gpu
            .create_resource(format, size.width, size.height)
            .map_err(MirrorError::gpu(Step::CreateCaptureBuffer))?;
        res.capture = Some(capture);

        let stage = match plan.mode {
            Mode::Passthrough => None,
            Mode::Transform => {
                let presentation = res
                    .gpu
                    .create_resource(format, plan.secondary.width, plan.secondary.height)
                    .map_err(MirrorError::gpu(Step::CreatePresentationBuffer))?;
                res.presentation = Some(presentation);

                let offscreen = res
                    .gpu
                    .open_offscreen(presentation)
                    .map_err(MirrorError::gpu(Step::OpenOffscreen))?;
                res.offscreen = Some(offscreen);

                let crop = plan.crop_fixed;
                let element = add_element(&mut res.gpu, offscreen, &plan, capture, crop)?;
                debug!(
                    "Compositing {:?} of the capture into {:?} with {:?}",
                    plan.crop, plan.dest, plan.transform
                );
                Some(TransformStage {
                    presentation,
                    element,
                    crop,
                })
            }
        };

        Ok(Self {
            res,
            plan,
            display,
            capture,
            stage,
        })
    }

    pub fn plan(&self) -> &Plan {
        &self.plan
    }

    /// Mark the crop region modified and re-compose synchronously.
    pub fn commit_crop_region(&mut self) -> Result<()> {
        let Some(stage) = &self.stage else {
            return Ok(());
        };
        let gpu = &mut self.res.gpu;
        let recompose = MirrorError::cycle(Stage::Recompose);
        let update = gpu.begin_update().map_err(recompose)?;
        gpu.element_modified(update, stage.element, stage.crop)
            .map_err(MirrorError::cycle(Stage::Recompose))?;
        gpu.submit_update_sync(update)
            .map_err(MirrorError::cycle(Stage::Recompose))
    }

    /// Capture, transform and present one frame.
    pub fn mirror_frame(&mut self) -> Result<()> {
        self.res
            .gpu
            .snapshot(self.display, self.capture)
            .map_err(MirrorError::cycle(Stage::Snapshot))?;

        self.commit_crop_region()?;

        let source = match &self.stage {
            Some(stage) => stage.presentation,
            None => self.capture,
        };
        let Resources { gpu, mapping, .. } = &mut self.res;
        let frame = mapping.as_deref_mut().unwrap_or_default();
        gpu.read_pixels(source, self.plan.secondary.rect(), frame, self.plan.pitch)
            .map_err(MirrorError::cycle(Stage::Present))
    }

    #[cfg(test)]
    pub fn frame(&self) -> &[u8] {
        self.res.mapping.as_deref().unwrap_or_default()
    }
}

fn add_element<G: Gpu>(
    gpu: &mut G,
    offscreen: DisplayHandle,
    plan: &Plan,
    capture: ResourceHandle,
    crop: Rect,
) -> Result<ElementHandle> {
    let add = MirrorError::gpu(Step::AddElement);
    let update = gpu.begin_update().map_err(add)?;
    let element = gpu
        .add_element(update, offscreen, plan.dest, capture, crop, plan.transform)
        .map_err(MirrorError::gpu(Step::AddElement))?;
    gpu.submit_update_sync(update)
        .map_err(MirrorError::gpu(Step::AddElement))?;
    Ok(element)
}

impl<G: Gpu, D: OutputDevice> Cycle for MirrorSession<G, D> {
    fn cycle(&mut self) -> Result<()> {
        self.mirror_frame()
    }
}
