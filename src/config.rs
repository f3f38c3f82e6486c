//! TOML configuration for a capture run.
//!
//! Every field has a default, so an empty file (or no file) describes the
//! default run: `/dev/video0` and `/dev/video1`, 1280x720 MJPG at 30 fps,
//! three pairs with the first two discarded, output in the working directory.
//!
//! ```toml
//! frames = 3
//! skip = 2
//! output_dir = "captures"
//! reclaim_timeout_ms = 2000
//!
//! [devices]
//! primary = "/dev/video0"
//! secondary = "/dev/video1"
//!
//! [format]
//! width = 1280
//! height = 720
//! fourcc = "MJPG"
//! fps = 30
//!
//! [[controls]]
//! id = 0x00980900
//! value = 210
//! label = "brightness"
//! ```

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::capture::{CaptureSettings, DeviceSetup};
use crate::controls::{default_controls, ControlSetting};
use crate::repair::{MarkerScan, SegmentScan, StrideScan};
use crate::traits::{CameraError, Format, FourCC, FrameInterval, Result};

/// Device node paths.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DevicePaths {
    /// Device whose frames are written to `0.jpg`.
    pub primary: PathBuf,
    /// Device whose frames are written to `1.jpg`.
    pub secondary: PathBuf,
}

impl Default for DevicePaths {
    fn default() -> Self {
        Self {
            primary: PathBuf::from("/dev/video0"),
            secondary: PathBuf::from("/dev/video1"),
        }
    }
}

/// Format and frame rate requested from both devices.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct FormatConfig {
    /// Width in pixels.
    pub width: u32,
    /// Height in pixels.
    pub height: u32,
    /// Four-character pixel format code.
    pub fourcc: String,
    /// Frames per second.
    pub fps: u32,
}

impl Default for FormatConfig {
    fn default() -> Self {
        Self {
            width: 1280,
            height: 720,
            fourcc: "MJPG".to_owned(),
            fps: 30,
        }
    }
}

/// Start-of-scan marker search used by frame repair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum ScanKind {
    /// Sample every fourth byte.
    #[default]
    Stride,
    /// Walk JPEG segments.
    Segment,
}

impl ScanKind {
    /// Instantiate the scan.
    pub fn build(self) -> Box<dyn MarkerScan> {
        match self {
            Self::Stride => Box::new(StrideScan),
            Self::Segment => Box::new(SegmentScan),
        }
    }
}

/// Full capture configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CaptureConfig {
    /// Device paths.
    pub devices: DevicePaths,
    /// Requested format.
    pub format: FormatConfig,
    /// Pairs to capture.
    pub frames: u32,
    /// Leading pairs to discard.
    pub skip: u32,
    /// Directory receiving `0.jpg` and `1.jpg`.
    pub output_dir: PathBuf,
    /// Bound on each buffer reclaim in milliseconds; absent waits forever.
    pub reclaim_timeout_ms: Option<u64>,
    /// Prime the primary before every pair.
    pub prime_every_pair: bool,
    /// Marker search.
    pub scan: ScanKind,
    /// Controls applied to both devices in order.
    pub controls: Vec<ControlSetting>,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        let settings = CaptureSettings::default();
        Self {
            devices: DevicePaths::default(),
            format: FormatConfig::default(),
            frames: settings.frames,
            skip: settings.skip,
            output_dir: PathBuf::from("."),
            reclaim_timeout_ms: None,
            prime_every_pair: settings.prime_every_pair,
            scan: ScanKind::default(),
            controls: default_controls(),
        }
    }
}

impl CaptureConfig {
    /// Read and validate a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path).map_err(|e| {
            CameraError::Config(format!("cannot read {}: {e}", path.display()))
        })?;
        Self::from_toml_str(&content)
    }

    /// Parse and validate TOML text.
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: Self = toml::from_str(content)
            .map_err(|e| CameraError::Config(format!("TOML parse error: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Check values the driver would otherwise reject in a less readable way.
    pub fn validate(&self) -> Result<()> {
        if self.devices.primary == self.devices.secondary {
            return Err(CameraError::Config(format!(
                "primary and secondary are the same device {}",
                self.devices.primary.display()
            )));
        }
        if self.format.width == 0 || self.format.height == 0 {
            return Err(CameraError::Config(format!(
                "resolution must be non-zero, got {}x{}",
                self.format.width, self.format.height
            )));
        }
        if self.format.fps == 0 {
            return Err(CameraError::Config("fps must be > 0".to_owned()));
        }
        self.format.fourcc.parse::<FourCC>()?;
        if self.reclaim_timeout_ms == Some(0) {
            return Err(CameraError::Config(
                "reclaim_timeout_ms must be > 0 or absent".to_owned(),
            ));
        }
        Ok(())
    }

    /// Requested format.
    pub fn format(&self) -> Result<Format> {
        let fourcc = self.format.fourcc.parse()?;
        Ok(Format::new(self.format.width, self.format.height, fourcc))
    }

    /// Requested frame interval.
    pub const fn interval(&self) -> FrameInterval {
        FrameInterval::from_fps(self.format.fps)
    }

    /// Per-device setup, identical for both devices.
    pub fn device_setup(&self) -> Result<DeviceSetup> {
        Ok(DeviceSetup {
            format: self.format()?,
            interval: self.interval(),
            controls: self.controls.clone(),
        })
    }

    /// Capture run parameters.
    pub fn settings(&self) -> CaptureSettings {
        CaptureSettings {
            frames: self.frames,
            skip: self.skip,
            reclaim_timeout: self.reclaim_timeout_ms.map(Duration::from_millis),
            prime_every_pair: self.prime_every_pair,
        }
    }
}
