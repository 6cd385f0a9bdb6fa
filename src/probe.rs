//! Read-only interrogation of a device: SDK level, ABI, display geometry,
//! orientation and the touch digitizer's coordinate range.
//!
//! Display information is scattered across Android versions; the probe
//! tries `dumpsys display`, `dumpsys window` and `wm size`/`wm density`
//! in turn, the same cascade AndroidViewClient established.

use anyhow::{Context, Result};
use num_enum::{IntoPrimitive, TryFromPrimitive};
use once_cell::sync::Lazy;
use regex::Regex;

use crate::bridge::BridgeClient;
use crate::error::NotFound;

const BASE_DPI: f64 = 160.0;

static PHYSICAL_DISPLAY: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"PhysicalDisplayInfo\{(?P<width>\d+) x (?P<height>\d+), .*, density (?P<density>[\d.]+)")
        .unwrap()
});
static UNRESTRICTED_SCREEN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"mUnrestrictedScreen=\(\d+,\d+\) (?P<width>\d+)x(?P<height>\d+)").unwrap()
});
static DISPLAY_WH: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"DisplayWidth=(?P<width>\d+) *DisplayHeight=(?P<height>\d+)").unwrap()
});
static WM_SIZE_DENSITY: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?s)Physical size: (?P<width>\d+)x(?P<height>\d+).*Physical density: (?P<density>\d+)")
        .unwrap()
});
static FLINGER_ORIENTATION: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"orientation=(\d+)").unwrap());
static SURFACE_ORIENTATION: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"SurfaceOrientation:\s+(\d+)").unwrap());
static EVENT_MAX: Lazy<Regex> = Lazy::new(|| Regex::new(r"max ([0-9]+)").unwrap());

/// Quarter-turn display orientation as reported by the device.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, TryFromPrimitive, IntoPrimitive)]
#[repr(u8)]
pub enum Orientation {
    #[default]
    Portrait = 0,
    Landscape = 1,
    PortraitFlipped = 2,
    LandscapeFlipped = 3,
}

impl Orientation {
    /// Rotation in degrees; always `orientation * 90`.
    pub fn degrees(self) -> u16 {
        u16::from(u8::from(self)) * 90
    }

    pub fn from_degrees(degrees: u16) -> Result<Orientation> {
        Orientation::try_from((degrees / 90) as u8)
            .with_context(|| format!("invalid rotation {degrees}"))
    }
}

/// Geometry of the device display and its touch digitizer.
///
/// `width`/`height` are the dimensions the screen is currently driven at;
/// `physical_width`/`physical_height` the panel's native ones. `max_x` and
/// `max_y` are the digitizer's raw coordinate maxima, which need not match
/// the pixel dimensions.
#[derive(Debug, Clone, PartialEq)]
pub struct DisplayInfo {
    pub width: u32,
    pub height: u32,
    pub physical_width: u32,
    pub physical_height: u32,
    /// Density factor, `1.0` = 160 dpi.
    pub density: Option<f64>,
    pub orientation: Orientation,
    pub max_x: Option<u32>,
    pub max_y: Option<u32>,
}

impl DisplayInfo {
    pub fn rotation(&self) -> u16 {
        self.orientation.degrees()
    }
}

/// Reads device capabilities through the bridge client.
#[derive(Debug, Clone)]
pub struct DeviceProbe {
    client: BridgeClient,
}

impl DeviceProbe {
    pub fn new(client: BridgeClient) -> DeviceProbe {
        DeviceProbe { client }
    }

    pub fn sdk_level(&self) -> Result<u32> {
        self.client.sdk_version()
    }

    pub fn abi(&self) -> Result<String> {
        let abi = self.client.getprop("ro.product.cpu.abi")?;
        log::info!("device abi is {abi}");
        Ok(abi)
    }

    /// Physical display dimensions and density factor, or `None` when no
    /// known source matched.
    pub fn physical_display(&self) -> Result<Option<(u32, u32, Option<f64>)>> {
        let output = self.client.raw_shell(&["dumpsys", "display"])?;
        if let Some((width, height, density)) = parse_physical_display(&output) {
            return Ok(Some((width, height, density)));
        }

        let output = self.client.raw_shell(&["dumpsys", "window"])?;
        if let Some((width, height)) = parse_window_display(&output) {
            return Ok(Some((width, height, self.prop_density()?)));
        }

        let output = self.client.raw_shell(&["wm", "size", ";", "wm", "density"])?;
        Ok(parse_wm_display(&output))
    }

    /// Density factor from build properties, for display sources that do
    /// not report one.
    fn prop_density(&self) -> Result<Option<f64>> {
        for key in ["ro.sf.lcd_density", "qemu.sf.lcd_density"] {
            let value = self.client.getprop(key)?;
            if let Ok(dpi) = value.parse::<f64>() {
                return Ok(Some(dpi / BASE_DPI));
            }
        }
        Ok(None)
    }

    /// Current display orientation. Older devices only expose it through
    /// SurfaceFlinger, newer ones through the input subsystem.
    pub fn orientation(&self) -> Result<Orientation> {
        let output = self.client.shell(&["dumpsys", "SurfaceFlinger"])?;
        if let Some(orientation) = parse_orientation(&FLINGER_ORIENTATION, &output)? {
            return Ok(orientation);
        }
        let output = self.client.shell(&["dumpsys", "input"])?;
        if let Some(orientation) = parse_orientation(&SURFACE_ORIENTATION, &output)? {
            return Ok(orientation);
        }
        log::warn!("could not obtain display orientation, assuming 0");
        Ok(Orientation::Portrait)
    }

    /// Raw coordinate maxima of the touch digitizer, from `getevent -p`.
    /// Event code 0035 is ABS_MT_POSITION_X, 0036 ABS_MT_POSITION_Y.
    pub fn digitizer_max(&self) -> Result<(Option<u32>, Option<u32>)> {
        let output = self.client.shell(&["getevent", "-p"])?;
        Ok(parse_digitizer_max(&output))
    }

    /// Assemble the full display picture used by the capture and touch
    /// streams.
    pub fn display_info(&self) -> Result<DisplayInfo> {
        let (width, height, density) = self
            .physical_display()?
            .ok_or_else(|| NotFound::new("display dimensions"))?;
        let orientation = self.orientation()?;
        let (max_x, max_y) = self.digitizer_max()?;
        Ok(DisplayInfo {
            width,
            height,
            physical_width: width,
            physical_height: height,
            density,
            orientation,
            max_x,
            max_y,
        })
    }
}

fn parse_physical_display(output: &str) -> Option<(u32, u32, Option<f64>)> {
    let captures = PHYSICAL_DISPLAY.captures(output)?;
    Some((
        captures["width"].parse().ok()?,
        captures["height"].parse().ok()?,
        captures["density"].parse().ok(),
    ))
}

fn parse_window_display(output: &str) -> Option<(u32, u32)> {
    let captures = UNRESTRICTED_SCREEN
        .captures(output)
        .or_else(|| DISPLAY_WH.captures(output))?;
    Some((
        captures["width"].parse().ok()?,
        captures["height"].parse().ok()?,
    ))
}

fn parse_wm_display(output: &str) -> Option<(u32, u32, Option<f64>)> {
    let captures = WM_SIZE_DENSITY.captures(output)?;
    let dpi: f64 = captures["density"].parse().ok()?;
    Some((
        captures["width"].parse().ok()?,
        captures["height"].parse().ok()?,
        Some(dpi / BASE_DPI),
    ))
}

fn parse_orientation(pattern: &Regex, output: &str) -> Result<Option<Orientation>> {
    let Some(captures) = pattern.captures(output) else {
        return Ok(None);
    };
    let value: u8 = captures.get(1).unwrap().as_str().parse()?;
    Ok(Some(
        Orientation::try_from(value).with_context(|| format!("orientation {value} out of range"))?,
    ))
}

fn parse_digitizer_max(output: &str) -> (Option<u32>, Option<u32>) {
    let mut max_x = None;
    let mut max_y = None;
    for line in output.lines() {
        let target = if line.contains("0035") {
            &mut max_x
        } else if line.contains("0036") {
            &mut max_y
        } else {
            continue;
        };
        if let Some(captures) = EVENT_MAX.captures(line) {
            *target = captures.get(1).unwrap().as_str().parse().ok();
        }
    }
    (max_x, max_y)
}

#[cfg(test)]
mod tests {
    use super::*;
    #[cfg(unix)]
    use crate::bridge::DeviceHandle;
    #[cfg(unix)]
    use crate::bridge::tests::fake_bridge;

    #[test]
    fn test_parse_physical_display() {
        let output = "mDisplayInfos=\n  PhysicalDisplayInfo{1080 x 1920, 60.0 fps, \
                      density 3.0, 480.0 x 480.0 dpi, secure true}";
        assert_eq!(
            parse_physical_display(output),
            Some((1080, 1920, Some(3.0)))
        );
        assert_eq!(parse_physical_display("no match here"), None);
    }

    #[test]
    fn test_parse_window_display() {
        let output = "  mUnrestrictedScreen=(0,0) 1200x1920";
        assert_eq!(parse_window_display(output), Some((1200, 1920)));
        let output = "  DisplayWidth=768 DisplayHeight=1024";
        assert_eq!(parse_window_display(output), Some((768, 1024)));
    }

    #[test]
    fn test_parse_wm_display() {
        let output = "Physical size: 1080x1920\nPhysical density: 480";
        assert_eq!(parse_wm_display(output), Some((1080, 1920, Some(3.0))));
    }

    #[test]
    fn test_parse_orientation_sources() {
        let output = "DisplayDevice: ...\n  orientation=1, ...";
        assert_eq!(
            parse_orientation(&FLINGER_ORIENTATION, output).unwrap(),
            Some(Orientation::Landscape)
        );
        let output = "InputReader:\n    SurfaceOrientation: 3";
        assert_eq!(
            parse_orientation(&SURFACE_ORIENTATION, output).unwrap(),
            Some(Orientation::LandscapeFlipped)
        );
        assert_eq!(parse_orientation(&FLINGER_ORIENTATION, "nope").unwrap(), None);
    }

    #[test]
    fn test_parse_digitizer_max() {
        let output = "\
add device 1: /dev/input/event2
  events:
    ABS (0003): 0035  : value 0, min 0, max 32767, fuzz 0, flat 0, resolution 0
                0036  : value 0, min 0, max 32767, fuzz 0, flat 0, resolution 0
";
        assert_eq!(parse_digitizer_max(output), (Some(32767), Some(32767)));
        assert_eq!(parse_digitizer_max("no events"), (None, None));
    }

    #[test]
    fn test_rotation_is_orientation_times_ninety() {
        for (orientation, degrees) in [
            (Orientation::Portrait, 0),
            (Orientation::Landscape, 90),
            (Orientation::PortraitFlipped, 180),
            (Orientation::LandscapeFlipped, 270),
        ] {
            assert_eq!(orientation.degrees(), degrees);
            assert_eq!(Orientation::from_degrees(degrees).unwrap(), orientation);
        }
        assert!(Orientation::from_degrees(360).is_err());
    }

    #[test]
    #[cfg(unix)]
    fn test_display_info_end_to_end() {
        let (_dir, path) = fake_bridge(
            r#"while [ "$1" != "shell" ]; do shift; done
shift
case "$*" in
  "dumpsys display") echo 'PhysicalDisplayInfo{1080 x 1920, 60.0 fps, density 3.0, 480.0 x 480.0 dpi}';;
  "dumpsys SurfaceFlinger") echo 'orientation=1';;
  "getevent -p") printf '    0035  : value 0, min 0, max 32767\n    0036  : value 0, min 0, max 32767\n';;
  *) exit 1;;
esac"#,
        );
        let client = BridgeClient::new(DeviceHandle::new("emulator-5554"), Some(path)).unwrap();
        client.seed_sdk(26);
        let probe = DeviceProbe::new(client);
        let info = probe.display_info().unwrap();
        assert_eq!((info.width, info.height), (1080, 1920));
        assert_eq!(info.density, Some(3.0));
        assert_eq!(info.orientation, Orientation::Landscape);
        assert_eq!(info.rotation(), 90);
        assert_eq!((info.max_x, info.max_y), (Some(32767), Some(32767)));
    }
}
