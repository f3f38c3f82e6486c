//! Sensor control table and the batch/legacy control apply protocol.

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::traits::{CameraError, ControlInterface, ControlValue, Result};

/// One named control assignment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ControlSetting {
    /// V4L2 control identifier.
    pub id: u32,
    /// Value to write.
    pub value: i64,
    /// Optional label for logs.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
}

impl ControlSetting {
    /// Create a labelled setting.
    #[must_use]
    pub fn new(id: u32, value: i64, label: &str) -> Self {
        Self {
            id,
            value,
            label: Some(label.to_owned()),
        }
    }
}

/// Which request accepted a control value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlPath {
    /// `VIDIOC_S_EXT_CTRLS`.
    Batch,
    /// `VIDIOC_S_CTRL`, after the batch path refused the value.
    Legacy,
}

/// Control identifiers used by the default sensor tuning.
pub mod ids {
    /// Brightness.
    pub const BRIGHTNESS: u32 = 0x0098_0900;
    /// Contrast.
    pub const CONTRAST: u32 = 0x0098_0901;
    /// Saturation.
    pub const SATURATION: u32 = 0x0098_0902;
    /// Automatic white balance.
    pub const AUTO_WHITE_BALANCE: u32 = 0x0098_090c;
    /// Power line frequency filter.
    pub const POWER_LINE_FREQUENCY: u32 = 0x0098_0918;
    /// White balance temperature.
    pub const WHITE_BALANCE_TEMPERATURE: u32 = 0x0098_091a;
    /// Sharpness.
    pub const SHARPNESS: u32 = 0x0098_091b;
    /// Backlight compensation.
    pub const BACKLIGHT_COMPENSATION: u32 = 0x0098_091c;
    /// Exposure mode (1 = manual).
    pub const EXPOSURE_AUTO: u32 = 0x009a_0901;
    /// Absolute exposure time.
    pub const EXPOSURE_ABSOLUTE: u32 = 0x009a_0902;
    /// Absolute pan.
    pub const PAN_ABSOLUTE: u32 = 0x009a_0908;
    /// Absolute tilt.
    pub const TILT_ABSOLUTE: u32 = 0x009a_0909;
    /// Absolute focus.
    pub const FOCUS_ABSOLUTE: u32 = 0x009a_090a;
    /// Continuous auto focus.
    pub const FOCUS_AUTO: u32 = 0x009a_090c;
    /// Absolute zoom.
    pub const ZOOM_ABSOLUTE: u32 = 0x009a_090d;
}

/// Sensor tuning applied to both devices unless configuration overrides it.
#[must_use]
pub fn default_controls() -> Vec<ControlSetting> {
    vec![
        ControlSetting::new(ids::BRIGHTNESS, 210, "brightness"),
        ControlSetting::new(ids::CONTRAST, 0, "contrast"),
        ControlSetting::new(ids::SATURATION, 42, "saturation"),
        ControlSetting::new(ids::AUTO_WHITE_BALANCE, 0, "manual white balance"),
        ControlSetting::new(ids::POWER_LINE_FREQUENCY, 0, "no power line filter"),
        ControlSetting::new(ids::WHITE_BALANCE_TEMPERATURE, 2800, "white balance"),
        ControlSetting::new(ids::SHARPNESS, 0, "sharpness"),
        ControlSetting::new(ids::BACKLIGHT_COMPENSATION, 0, "backlight"),
        ControlSetting::new(ids::EXPOSURE_AUTO, 1, "manual exposure"),
        ControlSetting::new(ids::EXPOSURE_ABSOLUTE, 20, "exposure"),
        ControlSetting::new(ids::PAN_ABSOLUTE, 0, "pan"),
        ControlSetting::new(ids::TILT_ABSOLUTE, 0, "tilt"),
        ControlSetting::new(ids::FOCUS_ABSOLUTE, 0, "focus infinity"),
        ControlSetting::new(ids::FOCUS_AUTO, 0, "manual focus"),
        ControlSetting::new(ids::ZOOM_ABSOLUTE, 0, "zoom"),
    ]
}

/// Apply one control value.
///
/// The descriptor decides the value width. The batch request is tried first;
/// an `EINVAL` or `ENOTTY`/`EOPNOTSUPP` refusal retries once through the
/// legacy request. Every other failure is returned.
#[track_caller]
pub fn apply_control<C>(device: &mut C, id: u32, value: i64) -> Result<ControlPath>
where
    C: ControlInterface + ?Sized,
{
    let descriptor = device.query_control(id)?;
    let sized = ControlValue::sized(id, descriptor.width, value)?;

    let rejection = match device.set_control_batch(id, sized) {
        Ok(()) => return Ok(ControlPath::Batch),
        Err(rejection) => rejection,
    };
    if !rejection.allows_fallback() {
        return Err(CameraError::control(id, rejection.into_io()));
    }

    debug!(
        id = format_args!("{id:#010x}"),
        name = %descriptor.name,
        reason = ?rejection,
        "Batch control path refused, using legacy path"
    );

    let legacy_value = i32::try_from(sized.as_i64())
        .map_err(|_| CameraError::ControlValueOutOfRange { id, value })?;
    device
        .set_control_legacy(id, legacy_value)
        .map_err(|err| CameraError::control(id, err))?;
    Ok(ControlPath::Legacy)
}

/// Apply a whole table in order. Stops at the first failure.
#[track_caller]
pub fn apply_all<C>(device: &mut C, table: &[ControlSetting]) -> Result<Vec<ControlPath>>
where
    C: ControlInterface + ?Sized,
{
    let mut paths = Vec::with_capacity(table.len());
    for setting in table {
        let path = apply_control(device, setting.id, setting.value)?;
        debug!(
            id = format_args!("{:#010x}", setting.id),
            label = setting.label.as_deref().unwrap_or(""),
            value = setting.value,
            ?path,
            "Control applied"
        );
        paths.push(path);
    }

    let legacy = paths.iter().filter(|p| **p == ControlPath::Legacy).count();
    if legacy > 0 {
        warn!(legacy, total = paths.len(), "Some controls needed the legacy path");
    }
    info!(count = paths.len(), "Applied control table");
    Ok(paths)
}
