//! Stereo-Cam-Capture: synchronized MJPEG capture from two V4L2 cameras
//!
//! This library drives two capture devices through a paired single-buffer
//! submit/reclaim protocol, repairs each frame by splicing in the standard
//! Huffman tables the sensors omit, and hands the pairs to a sink. Device
//! access sits behind traits, so the capture logic is tested against mock
//! devices.

mod buffer;
mod sys;

pub mod capture;
pub mod config;
pub mod controls;
pub mod device;
pub mod queue;
pub mod repair;
pub mod sink;
pub mod traits;
pub mod validation;

#[cfg(test)]
pub mod mock;

pub use capture::{prepare, CaptureReport, CaptureSettings, DeviceSetup, SyncCapture};
pub use config::CaptureConfig;
pub use device::V4L2Device;
pub use repair::{repair, RepairedImage};
pub use sink::{FileSink, FramePair, FrameSink};
pub use traits::{
    CameraError, CaptureDevice, ControlInterface, DeviceCapabilities, Format, FourCC,
    FrameInterval, FrameMetadata,
};
