mod error;
mod fbdev;
mod geometry;
mod gpu;
mod mirror;
mod probe;
mod session;
mod transform;

use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{ArgAction, Parser, ValueEnum};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use fbdev::Framebuffer;
use geometry::{CropSpec, ScaleMode};
use gpu::{Dispmanx, Gpu, SoftwareGpu};
use mirror::{LoopOptions, StopFlag};
use session::{MirrorConfig, MirrorSession};
use transform::{parse_flip_arg, parse_rotation, Flip, Rotation, Transform};

#[derive(Debug, Clone, Copy, ValueEnum, Default, PartialEq, Eq)]
pub enum ScaleModeArg {
    /// Stretch to fill the secondary display, ignoring aspect ratio
    #[default]
    Stretch,
    /// Preserve aspect ratio, fit within the display (letterbox/pillarbox)
    Fit,
    /// Preserve aspect ratio, fill the display completely (crops edges)
    Fill,
    /// Display at 1:1 pixel ratio, centered (no scaling)
    Center,
}

impl From<ScaleModeArg> for ScaleMode {
    fn from(arg: ScaleModeArg) -> Self {
        match arg {
            ScaleModeArg::Stretch => ScaleMode::Stretch,
            ScaleModeArg::Fit => ScaleMode::Fit,
            ScaleModeArg::Fill => ScaleMode::Fill,
            ScaleModeArg::Center => ScaleMode::Center,
        }
    }
}

#[derive(Debug, Clone, Copy, ValueEnum, Default, PartialEq, Eq)]
pub enum BackendArg {
    /// VideoCore dispmanx through libbcm_host
    #[default]
    Dispmanx,
    /// CPU compositing, primary display read from /dev/fbN
    Software,
}

#[derive(Parser, Debug)]
#[command(name = "fb-mirror", version)]
#[command(about = "Mirror the primary display onto a secondary framebuffer")]
#[command(disable_help_flag = true)]
struct Cli {
    /// Primary display index
    #[arg(short, long, default_value_t = 0)]
    primary: u32,

    /// Secondary framebuffer device
    #[arg(short, long, default_value = "/dev/fb1")]
    secondary: PathBuf,

    /// Left edge of the crop region
    #[arg(short, long, default_value_t = 0, allow_negative_numbers = true)]
    left: i32,

    /// Top edge of the crop region
    #[arg(short, long, default_value_t = 0, allow_negative_numbers = true)]
    top: i32,

    /// Crop width, -1 for the rest of the display
    #[arg(short, long, default_value_t = -1, allow_negative_numbers = true)]
    width: i32,

    /// Crop height, -1 for the rest of the display
    #[arg(short, long, default_value_t = -1, allow_negative_numbers = true)]
    height: i32,

    /// Clockwise rotation: 0, 90, 180 or 270
    #[arg(short, long = "rotate", default_value = "0", value_parser = parse_rotation)]
    rotation: Rotation,

    /// Flip the image: any of 'v' (vertical) and 'h' (horizontal)
    #[arg(short, long, value_parser = parse_flip_arg)]
    flip: Option<Flip>,

    /// Scaling mode for the cropped region
    #[arg(long, value_enum, default_value = "stretch")]
    scale: ScaleModeArg,

    /// Display capture and compositing backend
    #[arg(long, value_enum, default_value = "dispmanx")]
    backend: BackendArg,

    /// Milliseconds to sleep between frames
    #[arg(long, default_value_t = 25)]
    interval_ms: u64,

    /// Stop after this many frames (0 runs until interrupted)
    #[arg(long, default_value_t = 0)]
    frames: u64,

    /// Consecutive failed frames before giving up (0 never gives up)
    #[arg(long, default_value_t = 200)]
    max_failures: u32,

    /// Print the resolved geometry and exit
    #[arg(long)]
    probe: bool,

    /// Print probe output as JSON
    #[arg(long, requires = "probe")]
    json: bool,

    /// Enable debug logging
    #[arg(short, long)]
    verbose: bool,

    /// Print help
    #[arg(long, action = ArgAction::Help)]
    help: Option<bool>,
}

impl Cli {
    fn mirror_config(&self) -> MirrorConfig {
        MirrorConfig {
            display_index: self.primary,
            device_path: self.secondary.clone(),
            crop: CropSpec {
                left: self.left,
                top: self.top,
                width: self.width,
                height: self.height,
            },
            transform: Transform::new(self.rotation, self.flip.unwrap_or_default()),
            scale: self.scale.into(),
        }
    }

    fn loop_options(&self) -> LoopOptions {
        LoopOptions {
            interval: Duration::from_millis(self.interval_ms),
            max_frames: (self.frames > 0).then_some(self.frames),
            max_consecutive_failures: self.max_failures,
        }
    }
}

fn init_logging(verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn probe<G: Gpu>(mut gpu: G, cli: &Cli) -> Result<()> {
    let plan = session::probe(&mut gpu, &cli.mirror_config(), Framebuffer::open)
        .context("Probe failed")?;
    if cli.json {
        println!("{}", probe::render_json(&plan)?);
    } else {
        print!("{}", probe::render_text(&plan));
    }
    Ok(())
}

fn mirror<G: Gpu>(gpu: G, cli: &Cli) -> Result<()> {
    let stop = StopFlag::new();
    let handler_stop = stop.clone();
    ctrlc::set_handler(move || handler_stop.stop()).context("Failed to set signal handler")?;

    let mut session = MirrorSession::start(gpu, &cli.mirror_config(), Framebuffer::open)
        .context("Failed to start mirroring")?;

    info!("Mirror active. Press Ctrl+C to stop.");
    let result = mirror::run(&mut session, &cli.loop_options(), &stop);

    info!("Stopping mirror...");
    drop(session);

    let stats = result.context("Mirroring stopped")?;
    info!(
        "Mirrored {} frames ({} skipped)",
        stats.frames, stats.skipped
    );
    Ok(())
}

fn run(cli: &Cli) -> Result<()> {
    match cli.backend {
        BackendArg::Dispmanx => {
            let gpu = Dispmanx::load().context("Dispmanx backend unavailable")?;
            if cli.probe {
                probe(gpu, cli)
            } else {
                mirror(gpu, cli)
            }
        }
        BackendArg::Software => {
            let gpu = SoftwareGpu::fbdev();
            if cli.probe {
                probe(gpu, cli)
            } else {
                mirror(gpu, cli)
            }
        }
    }
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    match run(&cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{:#}", e);
            ExitCode::FAILURE
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Result<Cli, clap::Error> {
        Cli::try_parse_from(std::iter::once("fb-mirror").chain(args.iter().copied()))
    }

    #[test]
    fn defaults_mirror_whole_display_to_fb1() {
        let cli = parse(&[]).unwrap();
        let config = cli.mirror_config();
        assert_eq!(config.display_index, 0);
        assert_eq!(config.device_path, PathBuf::from("/dev/fb1"));
        assert_eq!(config.crop, CropSpec::default());
        assert!(config.transform.is_identity());
        assert!(!config.needs_transform());
        assert_eq!(cli.backend, BackendArg::Dispmanx);

        let options = cli.loop_options();
        assert_eq!(options.interval, Duration::from_millis(25));
        assert_eq!(options.max_frames, None);
        assert_eq!(options.max_consecutive_failures, 200);
    }

    #[test]
    fn short_flags_set_crop_and_transform() {
        let cli = parse(&[
            "-p", "2", "-s", "/dev/fb2", "-l", "10", "-t", "20", "-w", "640", "-h", "480", "-r",
            "90", "-f", "VH",
        ])
        .unwrap();
        let config = cli.mirror_config();
        assert_eq!(config.display_index, 2);
        assert_eq!(config.device_path, PathBuf::from("/dev/fb2"));
        assert_eq!(
            config.crop,
            CropSpec {
                left: 10,
                top: 20,
                width: 640,
                height: 480,
            }
        );
        assert_eq!(
            config.transform,
            Transform {
                rotation: Rotation::Cw90,
                flip_vertical: true,
                flip_horizontal: true,
            }
        );
    }

    #[test]
    fn negative_crop_values_are_accepted() {
        let cli = parse(&["-w", "-1", "-l", "-5"]).unwrap();
        assert_eq!(cli.width, -1);
        assert_eq!(cli.left, -5);
    }

    #[test]
    fn bad_rotation_and_flip_are_rejected() {
        assert!(parse(&["-r", "45"]).is_err());
        assert!(parse(&["-r", "ninety"]).is_err());
        assert!(parse(&["-f", "vx"]).is_err());
    }

    #[test]
    fn help_is_long_only() {
        let err = parse(&["--help"]).unwrap_err();
        assert_eq!(err.kind(), clap::error::ErrorKind::DisplayHelp);
        assert!(parse(&["-h"]).is_err());
    }

    #[test]
    fn loop_flags() {
        let cli = parse(&[
            "--interval-ms", "40", "--frames", "100", "--max-failures", "0", "--scale", "fit",
            "--backend", "software",
        ])
        .unwrap();
        let options = cli.loop_options();
        assert_eq!(options.interval, Duration::from_millis(40));
        assert_eq!(options.max_frames, Some(100));
        assert_eq!(options.max_consecutive_failures, 0);
        assert_eq!(cli.mirror_config().scale, ScaleMode::Fit);
        assert_eq!(cli.backend, BackendArg::Software);
    }

    #[test]
    fn json_requires_probe() {
        assert!(parse(&["--json"]).is_err());
        assert!(parse(&["--probe", "--json"]).unwrap().json);
    }
}
