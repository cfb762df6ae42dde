//! Recording [`Gpu`] and [`OutputDevice`] doubles with failure injection.

use std::cell::RefCell;
use std::collections::HashMap;
use std::ops::{Deref, DerefMut};
use std::path::Path;
use std::rc::Rc;

use super::{
    required_len, DisplayHandle, ElementHandle, Gpu, PixelFormat, ResourceHandle, UpdateHandle,
};
use crate::error::{DeviceError, GpuError};
use crate::fbdev::{Channel, FixedInfo, OutputDevice, VarInfo};
use crate::geometry::{DisplayInfo, Rect};
use crate::transform::Transform;

/// Byte written by `read_pixels`.
pub const PIXEL_BYTE: u8 = 0x5a;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Acquired {
    Display(u32),
    Device,
    Mapping,
    Resource(u32),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    Acquire(Acquired),
    Release(Acquired),
    Element {
        dest: Rect,
        src: Rect,
        transform: Transform,
    },
    Snapshot,
    Modified(Rect),
    Submit,
    Read {
        resource: u32,
        rect: Rect,
        pitch: usize,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailPoint {
    OpenDisplay,
    QueryDisplay,
    OpenDevice,
    QueryDevice,
    Map,
    /// The nth resource allocation, counting from 1.
    CreateResource(usize),
    OpenOffscreen,
    AddElement,
    Snapshot,
}

#[derive(Debug, Default)]
pub struct MockState {
    pub events: Vec<Event>,
    pub fail: Option<FailPoint>,
    pub sizes: HashMap<u32, (u32, u32)>,
    created: usize,
    next: u32,
}

impl MockState {
    fn handle(&mut self) -> u32 {
        self.next += 1;
        self.next
    }

    fn fails(&self, point: FailPoint) -> bool {
        self.fail == Some(point)
    }

    pub fn acquired(&self) -> Vec<Acquired> {
        self.events
            .iter()
            .filter_map(|e| match e {
                Event::Acquire(a) => Some(*a),
                _ => None,
            })
            .collect()
    }

    pub fn released(&self) -> Vec<Acquired> {
        self.events
            .iter()
            .filter_map(|e| match e {
                Event::Release(a) => Some(*a),
                _ => None,
            })
            .collect()
    }

    pub fn count(&self, wanted: &Event) -> usize {
        self.events.iter().filter(|e| *e == wanted).count()
    }
}

pub type Shared = Rc<RefCell<MockState>>;

pub fn shared(fail: Option<FailPoint>) -> Shared {
    Rc::new(RefCell::new(MockState {
        fail,
        ..MockState::default()
    }))
}

/// Everything acquired was released exactly once, last acquired first.
pub fn assert_reverse_teardown(state: &Shared) {
    let state = state.borrow();
    let mut expected = state.acquired();
    expected.reverse();
    assert_eq!(state.released(), expected, "events: {:#?}", state.events);
}

pub struct MockGpu {
    state: Shared,
    primary: DisplayInfo,
}

impl MockGpu {
    pub fn new(state: &Shared, primary: DisplayInfo) -> Self {
        Self {
            state: state.clone(),
            primary,
        }
    }

    fn check(&self, point: FailPoint, call: &'static str) -> Result<(), GpuError> {
        if self.state.borrow().fails(point) {
            Err(GpuError::NoHandle { call })
        } else {
            Ok(())
        }
    }
}

impl Gpu for MockGpu {
    fn open_display(&mut self, _index: u32) -> Result<DisplayHandle, GpuError> {
        self.check(FailPoint::OpenDisplay, "open_display")?;
        let mut state = self.state.borrow_mut();
        let handle = state.handle();
        state.events.push(Event::Acquire(Acquired::Display(handle)));
        Ok(DisplayHandle(handle))
    }

    fn display_info(&mut self, _display: DisplayHandle) -> Result<DisplayInfo, GpuError> {
        self.check(FailPoint::QueryDisplay, "display_info")?;
        Ok(self.primary)
    }

    fn close_display(&mut self, display: DisplayHandle) {
        self.state
            .borrow_mut()
            .events
            .push(Event::Release(Acquired::Display(display.0)));
    }

    fn create_resource(
        &mut self,
        _format: PixelFormat,
        width: u32,
        height: u32,
    ) -> Result<ResourceHandle, GpuError> {
        let mut state = self.state.borrow_mut();
        state.created += 1;
        let nth = state.created;
        if state.fails(FailPoint::CreateResource(nth)) {
            return Err(GpuError::NoHandle {
                call: "create_resource",
            });
        }
        let handle = state.handle();
        state.sizes.insert(handle, (width, height));
        state.events.push(Event::Acquire(Acquired::Resource(handle)));
        Ok(ResourceHandle(handle))
    }

    fn delete_resource(&mut self, resource: ResourceHandle) {
        self.state
            .borrow_mut()
            .events
            .push(Event::Release(Acquired::Resource(resource.0)));
    }

    fn snapshot(&mut self, _display: DisplayHandle, _resource: ResourceHandle) -> Result<(), GpuError> {
        self.check(FailPoint::Snapshot, "snapshot")?;
        self.state.borrow_mut().events.push(Event::Snapshot);
        Ok(())
    }

    fn open_offscreen(&mut self, _resource: ResourceHandle) -> Result<DisplayHandle, GpuError> {
        self.check(FailPoint::OpenOffscreen, "open_offscreen")?;
        let mut state = self.state.borrow_mut();
        let handle = state.handle();
        state.events.push(Event::Acquire(Acquired::Display(handle)));
        Ok(DisplayHandle(handle))
    }

    fn begin_update(&mut self) -> Result<UpdateHandle, GpuError> {
        Ok(UpdateHandle(self.state.borrow_mut().handle()))
    }

    fn add_element(
        &mut self,
        _update: UpdateHandle,
        _display: DisplayHandle,
        dest_rect: Rect,
        _source: ResourceHandle,
        src_rect: Rect,
        transform: Transform,
    ) -> Result<ElementHandle, GpuError> {
        self.check(FailPoint::AddElement, "add_element")?;
        let mut state = self.state.borrow_mut();
        state.events.push(Event::Element {
            dest: dest_rect,
            src: src_rect,
            transform,
        });
        Ok(ElementHandle(state.handle()))
    }

    fn element_modified(
        &mut self,
        _update: UpdateHandle,
        _element: ElementHandle,
        rect: Rect,
    ) -> Result<(), GpuError> {
        self.state.borrow_mut().events.push(Event::Modified(rect));
        Ok(())
    }

    fn submit_update_sync(&mut self, _update: UpdateHandle) -> Result<(), GpuError> {
        self.state.borrow_mut().events.push(Event::Submit);
        Ok(())
    }

    fn read_pixels(
        &mut self,
        resource: ResourceHandle,
        rect: Rect,
        out: &mut [u8],
        pitch: usize,
    ) -> Result<(), GpuError> {
        let row_bytes = rect.width as usize * 2;
        let needed = required_len(row_bytes, rect.height as usize, pitch);
        if out.len() < needed {
            return Err(GpuError::BufferTooSmall {
                needed,
                available: out.len(),
            });
        }
        for row in 0..rect.height as usize {
            out[row * pitch..row * pitch + row_bytes].fill(PIXEL_BYTE);
        }
        self.state
            .borrow_mut()
            .events
            .push(Event::Read {
                resource: resource.0,
                rect,
                pitch,
            });
        Ok(())
    }
}

pub struct MockDevice {
    state: Shared,
    fix: FixedInfo,
    var: VarInfo,
}

/// A 16 bpp RGB565 mode of the given size with tightly packed rows.
pub fn rgb565_mode(width: u32, height: u32) -> (FixedInfo, VarInfo) {
    let fix = FixedInfo {
        memory_len: width * height * 2,
        line_length: width * 2,
    };
    let var = VarInfo {
        xres: width,
        yres: height,
        bits_per_pixel: 16,
        red: Channel { offset: 11, length: 5 },
        green: Channel { offset: 5, length: 6 },
        blue: Channel { offset: 0, length: 5 },
        ..VarInfo::default()
    };
    (fix, var)
}

/// Device opener for `MirrorSession::start`.
pub fn device_opener(
    state: &Shared,
    fix: FixedInfo,
    var: VarInfo,
) -> impl FnOnce(&Path) -> Result<MockDevice, DeviceError> {
    let state = state.clone();
    move |path: &Path| {
        if state.borrow().fails(FailPoint::OpenDevice) {
            return Err(DeviceError::Open {
                path: path.display().to_string(),
                source: std::io::Error::from(std::io::ErrorKind::NotFound),
            });
        }
        state
            .borrow_mut()
            .events
            .push(Event::Acquire(Acquired::Device));
        Ok(MockDevice { state, fix, var })
    }
}

impl OutputDevice for MockDevice {
    type Mapping = MockMapping;

    fn fixed_info(&self) -> Result<FixedInfo, DeviceError> {
        if self.state.borrow().fails(FailPoint::QueryDevice) {
            return Err(DeviceError::EmptyMemory);
        }
        Ok(self.fix)
    }

    fn var_info(&self) -> Result<VarInfo, DeviceError> {
        Ok(self.var)
    }

    fn map(&self, len: usize) -> Result<MockMapping, DeviceError> {
        if self.state.borrow().fails(FailPoint::Map) {
            return Err(DeviceError::Map {
                len,
                source: nix::Error::ENOMEM,
            });
        }
        self.state
            .borrow_mut()
            .events
            .push(Event::Acquire(Acquired::Mapping));
        Ok(MockMapping {
            state: self.state.clone(),
            bytes: vec![0; len],
        })
    }
}

impl Drop for MockDevice {
    fn drop(&mut self) {
        self.state
            .borrow_mut()
            .events
            .push(Event::Release(Acquired::Device));
    }
}

pub struct MockMapping {
    state: Shared,
    bytes: Vec<u8>,
}

impl Deref for MockMapping {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.bytes
    }
}

impl DerefMut for MockMapping {
    fn deref_mut(&mut self) -> &mut [u8] {
        &mut self.bytes
    }
}

impl Drop for MockMapping {
    fn drop(&mut self) {
        self.state
            .borrow_mut()
            .events
            .push(Event::Release(Acquired::Mapping));
    }
}
