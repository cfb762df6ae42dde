use std::fmt;
use thiserror::Error;

/// Failures reported by a display capture / compositing backend.
#[derive(Error, Debug)]
pub enum GpuError {
    #[error("failed to load {library}: {source}")]
    Library {
        library: String,
        #[source]
        source: libloading::Error,
    },

    #[error("{call} returned status {status}")]
    Status { call: &'static str, status: i32 },

    #[error("{call} returned no handle")]
    NoHandle { call: &'static str },

    #[error("unknown {kind} handle {handle}")]
    InvalidHandle { kind: &'static str, handle: u32 },

    #[error("output buffer too small: need {needed} bytes, got {available}")]
    BufferTooSmall { needed: usize, available: usize },

    #[error("unsupported pixel layout: {0}")]
    UnsupportedFormat(String),

    #[error("primary display {index}: {source}")]
    Screen {
        index: u32,
        #[source]
        source: DeviceError,
    },
}

/// Failures reported by the raw framebuffer device.
#[derive(Error, Debug)]
pub enum DeviceError {
    #[error("cannot open {path}: {source}")]
    Open {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{request} ioctl failed: {source}")]
    Ioctl {
        request: &'static str,
        #[source]
        source: nix::Error,
    },

    #[error("mmap of {len} bytes failed: {source}")]
    Map {
        len: usize,
        #[source]
        source: nix::Error,
    },

    #[error("device reports zero-length pixel memory")]
    EmptyMemory,

    #[error("{path} was opened read-only and cannot be mapped for writing")]
    ReadOnly { path: String },
}

/// Startup step that acquires a resource. Used to name the failed step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    OpenDisplay,
    QueryDisplay,
    OpenDevice,
    QueryDevice,
    CreateCaptureBuffer,
    CreatePresentationBuffer,
    MapMemory,
    OpenOffscreen,
    AddElement,
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Step::OpenDisplay => "open primary display",
            Step::QueryDisplay => "query primary display",
            Step::OpenDevice => "open secondary device",
            Step::QueryDevice => "query secondary device",
            Step::CreateCaptureBuffer => "create capture buffer",
            Step::CreatePresentationBuffer => "create presentation buffer",
            Step::MapMemory => "map secondary memory",
            Step::OpenOffscreen => "open offscreen display",
            Step::AddElement => "add compositing element",
        })
    }
}

/// Stage of a single mirror cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Snapshot,
    Recompose,
    Present,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Stage::Snapshot => "snapshot",
            Stage::Recompose => "recompose",
            Stage::Present => "present",
        })
    }
}

#[derive(Error, Debug)]
pub enum MirrorError {
    #[error("invalid rotation angle {0} (expected 0, 90, 180 or 270)")]
    InvalidRotation(i64),

    #[error("invalid flip string {spec:?}: unexpected {found:?} (expected 'v' and/or 'h')")]
    InvalidFlip { spec: String, found: char },

    #[error("invalid crop rectangle {width}x{height}+{left}+{top}")]
    InvalidCrop {
        left: i32,
        top: i32,
        width: i32,
        height: i32,
    },

    #[error("secondary device uses {0} bits per pixel, only 16 (RGB565) is supported")]
    UnsupportedDepth(u32),

    #[error("secondary line length {pitch} is shorter than a {row_bytes}-byte row")]
    PitchTooSmall { pitch: usize, row_bytes: usize },

    #[error("secondary memory too small: frame needs {needed} bytes, device has {available}")]
    MappingTooSmall { needed: usize, available: usize },

    #[error("{step}: {source}")]
    Gpu {
        step: Step,
        #[source]
        source: GpuError,
    },

    #[error("{step}: {source}")]
    Device {
        step: Step,
        #[source]
        source: DeviceError,
    },

    #[error("mirror cycle failed at {stage}: {source}")]
    Cycle {
        stage: Stage,
        #[source]
        source: GpuError,
    },

    #[error("{count} consecutive mirror cycles failed")]
    TooManyFailures {
        count: u32,
        #[source]
        last: Box<MirrorError>,
    },
}

impl MirrorError {
    pub fn gpu(step: Step) -> impl FnOnce(GpuError) -> Self {
        move |source| MirrorError::Gpu { step, source }
    }

    pub fn device(step: Step) -> impl FnOnce(DeviceError) -> Self {
        move |source| MirrorError::Device { step, source }
    }

    pub fn cycle(stage: Stage) -> impl FnOnce(GpuError) -> Self {
        move |source| MirrorError::Cycle { stage, source }
    }

    /// The startup step this error is tagged with, if any.
    pub fn step(&self) -> Option<Step> {
        match self {
            MirrorError::Gpu { step, .. } | MirrorError::Device { step, .. } => Some(*step),
            _ => None,
        }
    }
}

pub type Result<T, E = MirrorError> = std::result::Result<T, E>;
