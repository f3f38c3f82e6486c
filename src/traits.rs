//! Core traits and types for the dual-camera capture path.

use std::fmt;
use std::io;
use std::panic::Location;
use std::time::Duration;

/// Pixel format representation (e.g., MJPG, YUYV).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FourCC(pub [u8; 4]);

impl FourCC {
    /// Create a new `FourCC` from a 4-byte array.
    #[must_use]
    pub const fn new(code: &[u8; 4]) -> Self {
        Self(*code)
    }

    /// MJPEG pixel format (Motion JPEG).
    pub const MJPG: Self = Self::new(b"MJPG");
    /// YUYV pixel format (4:2:2 packed).
    pub const YUYV: Self = Self::new(b"YUYV");
}

impl fmt::Display for FourCC {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match std::str::from_utf8(&self.0) {
            Ok(code) => f.write_str(code),
            Err(_) => write!(f, "{:?}", self.0),
        }
    }
}

impl std::str::FromStr for FourCC {
    type Err = CameraError;

    fn from_str(s: &str) -> Result<Self> {
        <[u8; 4]>::try_from(s.as_bytes())
            .map(|code| Self::new(&code))
            .map_err(|_| CameraError::Config(format!("pixel format {s:?} is not four bytes")))
    }
}

impl From<v4l::FourCC> for FourCC {
    fn from(fourcc: v4l::FourCC) -> Self {
        Self(fourcc.repr)
    }
}

impl From<FourCC> for v4l::FourCC {
    fn from(fourcc: FourCC) -> Self {
        Self::new(&fourcc.0)
    }
}

/// Video format specification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Format {
    /// Frame width in pixels.
    pub width: u32,
    /// Frame height in pixels.
    pub height: u32,
    /// Pixel format.
    pub fourcc: FourCC,
    /// Maximum compressed frame size reported by the driver (0 until negotiated).
    pub size: u32,
}

impl Format {
    /// Create a format request. The driver fills in `size` on negotiation.
    #[must_use]
    pub const fn new(width: u32, height: u32, fourcc: FourCC) -> Self {
        Self {
            width,
            height,
            fourcc,
            size: 0,
        }
    }

    /// Whether the driver honoured the requested geometry and pixel format.
    #[must_use]
    pub fn matches(&self, requested: &Self) -> bool {
        self.width == requested.width
            && self.height == requested.height
            && self.fourcc == requested.fourcc
    }
}

/// Time per frame as a fraction of a second (1/30 is 30 fps).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameInterval {
    /// Numerator in seconds.
    pub numerator: u32,
    /// Denominator in seconds.
    pub denominator: u32,
}

impl FrameInterval {
    /// Create a frame interval of `numerator / denominator` seconds.
    #[must_use]
    pub const fn new(numerator: u32, denominator: u32) -> Self {
        Self {
            numerator,
            denominator,
        }
    }

    /// Frame interval for a whole number of frames per second.
    #[must_use]
    pub const fn from_fps(fps: u32) -> Self {
        Self::new(1, fps)
    }
}

/// Device capability flags.
#[derive(Debug, Clone, Default)]
pub struct DeviceCapabilities {
    /// Driver name.
    pub driver: String,
    /// Card/device name.
    pub card: String,
    /// Bus information.
    pub bus_info: String,
    /// Whether the device can capture video.
    pub can_capture: bool,
    /// Whether the device supports streaming.
    pub can_stream: bool,
}

/// Metadata reported by the driver when a buffer is reclaimed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameMetadata {
    /// Frame sequence number.
    pub sequence: u32,
    /// Capture timestamp.
    pub timestamp: Duration,
    /// Actual bytes used in the frame buffer.
    pub bytes_used: u32,
}

/// Storage width of a control value, learned from its descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlWidth {
    /// 32-bit value (integer, boolean, menu).
    Bits32,
    /// 64-bit value.
    Bits64,
}

/// Descriptor of a device control.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControlDescriptor {
    /// Control identifier.
    pub id: u32,
    /// Human readable control name.
    pub name: String,
    /// Value width.
    pub width: ControlWidth,
}

/// A control value sized for the control it is written to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlValue {
    /// 32-bit control value.
    Int32(i32),
    /// 64-bit control value.
    Int64(i64),
}

impl ControlValue {
    /// Size `value` for a control of the given width.
    pub fn sized(id: u32, width: ControlWidth, value: i64) -> Result<Self> {
        match width {
            ControlWidth::Bits64 => Ok(Self::Int64(value)),
            ControlWidth::Bits32 => i32::try_from(value)
                .map(Self::Int32)
                .map_err(|_| CameraError::ControlValueOutOfRange { id, value }),
        }
    }

    /// The value widened to 64 bits.
    #[must_use]
    pub fn as_i64(self) -> i64 {
        match self {
            Self::Int32(value) => i64::from(value),
            Self::Int64(value) => value,
        }
    }
}

/// Why the batch (extended) control path refused a value.
#[derive(Debug)]
pub enum ControlRejection {
    /// The driver reported an invalid argument (`EINVAL`).
    InvalidArgument(io::Error),
    /// The driver does not implement the request (`ENOTTY` / `EOPNOTSUPP`).
    NotSupported(io::Error),
    /// Any other failure.
    Failed(io::Error),
}

impl ControlRejection {
    /// Classify a driver error by its errno.
    #[must_use]
    pub fn classify(err: io::Error) -> Self {
        match err.raw_os_error() {
            Some(libc::EINVAL) => Self::InvalidArgument(err),
            Some(libc::ENOTTY | libc::EOPNOTSUPP) => Self::NotSupported(err),
            _ => Self::Failed(err),
        }
    }

    /// Whether the legacy single-control path should be tried instead.
    #[must_use]
    pub const fn allows_fallback(&self) -> bool {
        matches!(self, Self::InvalidArgument(_) | Self::NotSupported(_))
    }

    /// The underlying driver error.
    #[must_use]
    pub fn into_io(self) -> io::Error {
        match self {
            Self::InvalidArgument(err) | Self::NotSupported(err) | Self::Failed(err) => err,
        }
    }
}

/// Error type for camera operations.
#[derive(Debug, thiserror::Error)]
pub enum CameraError {
    /// Failed to open device.
    #[error("Failed to open device {path}: {source}")]
    DeviceOpenFailed {
        /// Device node path.
        path: String,
        /// Underlying error.
        source: io::Error,
    },
    /// Device lacks a capability the capture path needs.
    #[error("Device {path} cannot be used: {reason}")]
    NotCapable {
        /// Device node path.
        path: String,
        /// Missing capability.
        reason: &'static str,
    },
    /// Requested format was rejected by the driver.
    #[error("Format not supported: {0:?}")]
    FormatNotSupported(Format),
    /// A driver request failed.
    #[error("{op} failed at {location}: {source}")]
    Ioctl {
        /// Name of the failing request.
        op: &'static str,
        /// Call site that issued the request.
        location: &'static Location<'static>,
        /// Underlying error.
        source: io::Error,
    },
    /// The device does not expose the requested control.
    #[error("Control {id:#010x} not found")]
    UnknownControl {
        /// Control identifier.
        id: u32,
    },
    /// A value does not fit the control's storage width.
    #[error("Value {value} out of range for control {id:#010x}")]
    ControlValueOutOfRange {
        /// Control identifier.
        id: u32,
        /// Requested value.
        value: i64,
    },
    /// Setting a control failed on every available path.
    #[error("Failed to set control {id:#010x} at {location}: {source}")]
    Control {
        /// Control identifier.
        id: u32,
        /// Call site that applied the control.
        location: &'static Location<'static>,
        /// Underlying error.
        source: io::Error,
    },
    /// Operation is not allowed in the current streaming state.
    #[error("Invalid streaming state: {0}")]
    StreamState(&'static str),
    /// Buffer allocation failed.
    #[error("Failed to allocate {len} byte frame buffer")]
    Alloc {
        /// Requested length.
        len: usize,
    },
    /// Captured data does not have the expected structure.
    #[error("Invalid frame: {0}")]
    InvalidFrame(String),
    /// Operation timed out.
    #[error("Operation timed out after {0:?}")]
    Timeout(Duration),
    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(String),
    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl CameraError {
    /// Wrap a failed driver request, recording the caller's location.
    #[track_caller]
    #[must_use]
    pub fn ioctl(op: &'static str, source: io::Error) -> Self {
        Self::Ioctl {
            op,
            location: Location::caller(),
            source,
        }
    }

    /// Wrap a failed control write, recording the caller's location.
    #[track_caller]
    #[must_use]
    pub fn control(id: u32, source: io::Error) -> Self {
        Self::Control {
            id,
            location: Location::caller(),
            source,
        }
    }
}

/// Result type for camera operations.
pub type Result<T> = std::result::Result<T, CameraError>;

/// Abstraction over one capture device with a single user-pointer buffer.
///
/// Buffer queueing methods are raw driver calls; [`crate::queue::FrameQueue`]
/// is the type that enforces the one-outstanding-buffer discipline.
pub trait CaptureDevice {
    /// Device node path, used in diagnostics.
    fn path(&self) -> &str;

    /// Get device capabilities.
    fn capabilities(&self) -> &DeviceCapabilities;

    /// Request a capture format. Returns the format the driver settled on,
    /// which may differ from the request.
    fn configure(&mut self, format: &Format) -> Result<Format>;

    /// Request a frame interval. Returns the interval the driver settled on.
    fn set_frame_interval(&mut self, interval: FrameInterval) -> Result<FrameInterval>;

    /// Request exactly one buffer slot and allocate its backing memory.
    /// Returns the buffer length.
    fn allocate_buffer(&mut self) -> Result<usize>;

    /// Release the buffer slot and its memory. Safe to call more than once.
    fn release_buffer(&mut self) -> Result<()>;

    /// Start streaming.
    fn stream_on(&mut self) -> Result<()>;

    /// Stop streaming. Any queued buffer is returned to the application.
    fn stream_off(&mut self) -> Result<()>;

    /// Hand the owned buffer to the driver queue (slot 0).
    fn queue_buffer(&mut self) -> Result<()>;

    /// Wait for the driver to fill the queued buffer.
    fn dequeue_buffer(&mut self, timeout: Option<Duration>) -> Result<FrameMetadata>;

    /// The owned buffer (full allocated length).
    fn buffer(&self) -> &[u8];
}

/// The three control operations a device exposes.
pub trait ControlInterface {
    /// Query a control's descriptor.
    fn query_control(&self, id: u32) -> Result<ControlDescriptor>;

    /// Set one control through the batch (extended) control request.
    fn set_control_batch(
        &mut self,
        id: u32,
        value: ControlValue,
    ) -> std::result::Result<(), ControlRejection>;

    /// Set one control through the legacy single-control request.
    fn set_control_legacy(&mut self, id: u32, value: i32) -> io::Result<()>;
}
