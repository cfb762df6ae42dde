//! `--probe` output.

use std::fmt::Write as _;

use crate::gpu::PixelFormat;
use crate::session::{Mode, Plan};

pub fn render_text(plan: &Plan) -> String {
    let mut out = String::new();
    let _ = writeln!(
        out,
        "Primary:      {}x{}",
        plan.primary.width, plan.primary.height
    );
    let _ = writeln!(
        out,
        "Secondary:    {}x{} {}bpp, {} bytes/line, {} bytes",
        plan.secondary.width,
        plan.secondary.height,
        plan.bits_per_pixel,
        plan.pitch,
        plan.memory_len
    );
    let _ = writeln!(
        out,
        "Format:       {}, {} bytes per frame",
        PixelFormat::Rgb565.fourcc(),
        plan.frame_len()
    );
    let mode = match plan.mode {
        Mode::Passthrough => "passthrough",
        Mode::Transform => "transform",
    };
    let _ = writeln!(out, "Mode:         {}", mode);
    if plan.mode == Mode::Transform {
        let c = plan.crop;
        let d = plan.dest;
        let _ = writeln!(out, "Crop:         {}x{}+{}+{}", c.width, c.height, c.x, c.y);
        let _ = writeln!(out, "Destination:  {}x{}+{}+{}", d.width, d.height, d.x, d.y);
        let _ = writeln!(out, "Rotation:     {}", plan.transform.rotation.degrees());
        let mut flip = String::new();
        if plan.transform.flip_vertical {
            flip.push('v');
        }
        if plan.transform.flip_horizontal {
            flip.push('h');
        }
        let _ = writeln!(
            out,
            "Flip:         {}",
            if flip.is_empty() { "none" } else { &flip }
        );
        let _ = writeln!(out, "Scale:        {:?}", plan.scale);
    }
    out
}

pub fn render_json(plan: &Plan) -> serde_json::Result<String> {
    serde_json::to_string_pretty(plan)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fbdev::{Channel, FixedInfo, VarInfo};
    use crate::geometry::DisplayInfo;
    use crate::session::MirrorConfig;
    use crate::transform::{Flip, Rotation, Transform};

    fn plan(config: &MirrorConfig) -> Plan {
        let fix = FixedInfo {
            memory_len: 320 * 240 * 2,
            line_length: 640,
        };
        let var = VarInfo {
            xres: 320,
            yres: 240,
            bits_per_pixel: 16,
            red: Channel { offset: 11, length: 5 },
            green: Channel { offset: 5, length: 6 },
            blue: Channel { offset: 0, length: 5 },
            ..VarInfo::default()
        };
        Plan::resolve(config, DisplayInfo::new(1920, 1080), fix, var).unwrap()
    }

    #[test]
    fn text_lists_geometry() {
        let text = render_text(&plan(&MirrorConfig::default()));
        assert!(text.contains("Primary:      1920x1080"));
        assert!(text.contains("Secondary:    320x240 16bpp, 640 bytes/line, 153600 bytes"));
        assert!(text.contains("Format:       RG16, 153600 bytes per frame"));
        assert!(text.contains("passthrough"));
        assert!(!text.contains("Crop"));

        let config = MirrorConfig {
            transform: Transform::new(
                Rotation::Cw270,
                Flip {
                    vertical: false,
                    horizontal: true,
                },
            ),
            ..MirrorConfig::default()
        };
        let text = render_text(&plan(&config));
        assert!(text.contains("Rotation:     270"));
        assert!(text.contains("Flip:         h"));
        assert!(text.contains("Crop:         1920x1080+0+0"));
    }

    #[test]
    fn json_is_machine_readable() {
        let json = render_json(&plan(&MirrorConfig::default())).unwrap();
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(value["mode"], "passthrough");
        assert_eq!(value["secondary"]["width"], 320);
        assert_eq!(value["pitch"], 640);
        assert_eq!(value["scale"], "stretch");
        assert!(value.get("crop_fixed").is_none());
    }
}
