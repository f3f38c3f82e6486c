//! Mock device implementation for testing without hardware.

use std::cell::RefCell;
use std::collections::HashSet;
use std::io;
use std::rc::Rc;
use std::time::Duration;

use crate::traits::{
    CameraError, CaptureDevice, ControlDescriptor, ControlInterface, ControlRejection,
    ControlValue, ControlWidth, DeviceCapabilities, Format, FourCC, FrameInterval, FrameMetadata,
    Result,
};

/// Driver calls observed by a mock device, tagged with the device path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceEvent {
    /// Buffer slot requested and allocated.
    Allocate(String),
    /// Buffer slot released.
    Release(String),
    /// Streaming started.
    StreamOn(String),
    /// Streaming stopped.
    StreamOff(String),
    /// Buffer queued.
    Queue(String),
    /// Buffer dequeued with the given sequence number.
    Dequeue(String, u32),
}

/// Control calls observed by a mock device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlCall {
    /// Descriptor query.
    Query(u32),
    /// Batch write.
    Batch(u32, ControlValue),
    /// Legacy write.
    Legacy(u32, i32),
}

/// Event log shared between devices to observe cross-device ordering.
pub type Journal = Rc<RefCell<Vec<DeviceEvent>>>;

const MOCK_BUFFER_LEN: usize = 64 * 1024;

/// Mock device for testing without hardware.
pub struct MockDevice {
    path: String,
    capabilities: DeviceCapabilities,
    format: Format,
    interval: FrameInterval,
    buffer: Option<Vec<u8>>,
    streaming: bool,
    queued: bool,
    frame_count: u32,
    journal: Journal,
    control_calls: RefCell<Vec<ControlCall>>,
    batch_error: Option<i32>,
    legacy_error: Option<i32>,
    missing_controls: HashSet<u32>,
    wide_controls: HashSet<u32>,
    stalled: bool,
    bytes_used_override: Option<u32>,
    fail_dequeue_at: Option<u32>,
}

impl Default for MockDevice {
    fn default() -> Self {
        Self::new()
    }
}

impl MockDevice {
    /// Create a new mock device with default settings.
    #[must_use]
    pub fn new() -> Self {
        Self::named("/dev/mock0")
    }

    /// Create a mock device with the given node path.
    #[must_use]
    pub fn named(path: &str) -> Self {
        Self {
            path: path.to_owned(),
            capabilities: DeviceCapabilities {
                driver: "mock".to_owned(),
                card: "Mock Camera".to_owned(),
                bus_info: "mock:0".to_owned(),
                can_capture: true,
                can_stream: true,
            },
            format: Format::new(640, 480, FourCC::YUYV),
            interval: FrameInterval::from_fps(30),
            buffer: None,
            streaming: false,
            queued: false,
            frame_count: 0,
            journal: Journal::default(),
            control_calls: RefCell::default(),
            batch_error: None,
            legacy_error: None,
            missing_controls: HashSet::new(),
            wide_controls: HashSet::new(),
            stalled: false,
            bytes_used_override: None,
            fail_dequeue_at: None,
        }
    }

    /// Record events into a shared journal.
    #[must_use]
    pub fn with_journal(mut self, journal: &Journal) -> Self {
        self.journal = Rc::clone(journal);
        self
    }

    /// Fail every batch control write with `errno`.
    #[must_use]
    pub const fn with_batch_error(mut self, errno: i32) -> Self {
        self.batch_error = Some(errno);
        self
    }

    /// Fail every legacy control write with `errno`.
    #[must_use]
    pub const fn with_legacy_error(mut self, errno: i32) -> Self {
        self.legacy_error = Some(errno);
        self
    }

    /// Pretend the device has no control `id`.
    #[must_use]
    pub fn without_control(mut self, id: u32) -> Self {
        self.missing_controls.insert(id);
        self
    }

    /// Report control `id` as 64 bits wide.
    #[must_use]
    pub fn with_wide_control(mut self, id: u32) -> Self {
        self.wide_controls.insert(id);
        self
    }

    /// Never complete a dequeue.
    #[must_use]
    pub const fn with_stalled_dequeue(mut self) -> Self {
        self.stalled = true;
        self
    }

    /// Report `bytes_used` instead of the real frame length.
    #[must_use]
    pub const fn with_bytes_used_override(mut self, bytes_used: u32) -> Self {
        self.bytes_used_override = Some(bytes_used);
        self
    }

    /// Fail the `nth` (0-based) dequeue with `EIO`.
    #[must_use]
    pub const fn with_dequeue_failure_at(mut self, nth: u32) -> Self {
        self.fail_dequeue_at = Some(nth);
        self
    }

    /// Events recorded in this device's journal.
    pub fn events(&self) -> Vec<DeviceEvent> {
        self.journal.borrow().clone()
    }

    /// Control calls made on this device.
    pub fn control_calls(&self) -> Vec<ControlCall> {
        self.control_calls.borrow().clone()
    }

    /// Whether streaming is on.
    pub const fn is_streaming(&self) -> bool {
        self.streaming
    }

    /// Whether a buffer is allocated.
    pub const fn has_buffer(&self) -> bool {
        self.buffer.is_some()
    }

    /// Last frame interval set.
    pub const fn interval(&self) -> FrameInterval {
        self.interval
    }

    fn record(&self, event: DeviceEvent) {
        self.journal.borrow_mut().push(event);
    }

    fn driver_error(op: &'static str, errno: i32) -> CameraError {
        CameraError::ioctl(op, io::Error::from_raw_os_error(errno))
    }
}

impl CaptureDevice for MockDevice {
    fn path(&self) -> &str {
        &self.path
    }

    fn capabilities(&self) -> &DeviceCapabilities {
        &self.capabilities
    }

    fn configure(&mut self, format: &Format) -> Result<Format> {
        self.format = format.clone();
        self.format.size = format.width * format.height;
        Ok(self.format.clone())
    }

    fn set_frame_interval(&mut self, interval: FrameInterval) -> Result<FrameInterval> {
        self.interval = interval;
        Ok(interval)
    }

    fn allocate_buffer(&mut self) -> Result<usize> {
        if self.streaming {
            return Err(CameraError::StreamState(
                "buffers cannot be allocated while streaming",
            ));
        }
        self.buffer = Some(vec![0; MOCK_BUFFER_LEN]);
        self.record(DeviceEvent::Allocate(self.path.clone()));
        Ok(MOCK_BUFFER_LEN)
    }

    fn release_buffer(&mut self) -> Result<()> {
        if self.streaming {
            return Err(CameraError::StreamState(
                "buffers cannot be released while streaming",
            ));
        }
        if self.buffer.take().is_some() {
            self.record(DeviceEvent::Release(self.path.clone()));
        }
        Ok(())
    }

    fn stream_on(&mut self) -> Result<()> {
        if self.buffer.is_none() {
            return Err(CameraError::StreamState(
                "streaming requires an allocated buffer",
            ));
        }
        self.streaming = true;
        self.record(DeviceEvent::StreamOn(self.path.clone()));
        Ok(())
    }

    fn stream_off(&mut self) -> Result<()> {
        self.streaming = false;
        self.queued = false;
        self.record(DeviceEvent::StreamOff(self.path.clone()));
        Ok(())
    }

    fn queue_buffer(&mut self) -> Result<()> {
        if self.buffer.is_none() || self.queued {
            return Err(Self::driver_error("VIDIOC_QBUF", libc::EINVAL));
        }
        self.queued = true;
        self.record(DeviceEvent::Queue(self.path.clone()));
        Ok(())
    }

    fn dequeue_buffer(&mut self, timeout: Option<Duration>) -> Result<FrameMetadata> {
        if !self.streaming || !self.queued {
            return Err(Self::driver_error("VIDIOC_DQBUF", libc::EINVAL));
        }
        if self.stalled {
            return match timeout {
                Some(timeout) => Err(CameraError::Timeout(timeout)),
                None => Err(CameraError::StreamState("dequeue would block forever")),
            };
        }

        let sequence = self.frame_count;
        if self.fail_dequeue_at == Some(sequence) {
            return Err(Self::driver_error("VIDIOC_DQBUF", libc::EIO));
        }
        self.frame_count += 1;
        self.queued = false;

        let frame = truncated_jpeg(19, 1024, sequence.to_le_bytes()[0]);
        let buffer = self
            .buffer
            .as_mut()
            .ok_or(CameraError::StreamState("no buffer allocated"))?;
        let len = frame.len().min(buffer.len());
        buffer[..len].copy_from_slice(&frame[..len]);

        self.record(DeviceEvent::Dequeue(self.path.clone(), sequence));

        #[allow(clippy::cast_possible_truncation)]
        let bytes_used = self.bytes_used_override.unwrap_or(len as u32);
        Ok(FrameMetadata {
            sequence,
            timestamp: Duration::from_millis(u64::from(sequence) * 33), // ~30fps
            bytes_used,
        })
    }

    fn buffer(&self) -> &[u8] {
        self.buffer.as_deref().unwrap_or_default()
    }
}

impl ControlInterface for MockDevice {
    fn query_control(&self, id: u32) -> Result<ControlDescriptor> {
        self.control_calls.borrow_mut().push(ControlCall::Query(id));
        if self.missing_controls.contains(&id) {
            return Err(CameraError::UnknownControl { id });
        }
        let width = if self.wide_controls.contains(&id) {
            ControlWidth::Bits64
        } else {
            ControlWidth::Bits32
        };
        Ok(ControlDescriptor {
            id,
            name: format!("Mock control {id:#x}"),
            width,
        })
    }

    fn set_control_batch(
        &mut self,
        id: u32,
        value: ControlValue,
    ) -> std::result::Result<(), ControlRejection> {
        self.control_calls.borrow_mut().push(ControlCall::Batch(id, value));
        self.batch_error.map_or(Ok(()), |errno| {
            Err(ControlRejection::classify(io::Error::from_raw_os_error(
                errno,
            )))
        })
    }

    fn set_control_legacy(&mut self, id: u32, value: i32) -> io::Result<()> {
        self.control_calls.borrow_mut().push(ControlCall::Legacy(id, value));
        self.legacy_error
            .map_or(Ok(()), |errno| Err(io::Error::from_raw_os_error(errno)))
    }
}

/// Build an MJPEG frame the way the target sensors emit it: no DHT segment.
///
/// Layout: SOI, APP0 of `app0_len` bytes (marker included, at least 4), DQT,
/// SOF0 (1280x720), SOS, `scan_len` bytes of scan data and EOI. The SOS
/// marker's `0xFF` sits at `app0_len + 90`. Scan data never contains `0xFF` or
/// `0xDA`.
pub fn truncated_jpeg(app0_len: usize, scan_len: usize, seed: u8) -> Vec<u8> {
    let app0_len = app0_len.max(4);
    let mut out = Vec::with_capacity(app0_len + scan_len + 128);

    out.extend_from_slice(&[0xFF, 0xD8]);

    #[allow(clippy::cast_possible_truncation)]
    let app0_field = (app0_len - 2) as u16;
    out.extend_from_slice(&[0xFF, 0xE0]);
    out.extend_from_slice(&app0_field.to_be_bytes());
    let mut app0_body = b"AVI1".to_vec();
    app0_body.resize(app0_len - 4, 0);
    out.extend_from_slice(&app0_body);

    // One 8-bit quantisation table
    out.extend_from_slice(&[0xFF, 0xDB, 0x00, 0x43, 0x00]);
    out.extend(1..=64u8);

    out.extend_from_slice(&[
        0xFF, 0xC0, 0x00, 0x11, 0x08, 0x02, 0xD0, 0x05, 0x00, 0x03, 0x01, 0x21, 0x00, 0x02,
        0x11, 0x01, 0x03, 0x11, 0x01,
    ]);

    out.extend_from_slice(&[
        0xFF, 0xDA, 0x00, 0x0C, 0x03, 0x01, 0x00, 0x02, 0x11, 0x03, 0x11, 0x00, 0x3F, 0x00,
    ]);

    #[allow(clippy::cast_possible_truncation)]
    out.extend((0..scan_len).map(|i| ((i * 31 + usize::from(seed)) % 200) as u8));

    out.extend_from_slice(&[0xFF, 0xD9]);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mock_device_creation() {
        let device = MockDevice::new();
        assert_eq!(device.capabilities().driver, "mock");
        assert!(device.capabilities().can_capture);
        assert!(device.capabilities().can_stream);
    }

    #[test]
    fn test_mock_device_configure() {
        let mut device = MockDevice::new();
        let requested = Format::new(1280, 720, FourCC::MJPG);
        let actual = device.configure(&requested).expect("configure should succeed");
        assert!(actual.matches(&requested));
    }

    #[test]
    fn test_mock_queue_requires_buffer() {
        let mut device = MockDevice::new();
        assert!(device.queue_buffer().is_err());
    }

    #[test]
    fn test_mock_double_queue_rejected() {
        let mut device = MockDevice::new();
        device.allocate_buffer().expect("allocate failed");
        device.queue_buffer().expect("first queue failed");
        assert!(device.queue_buffer().is_err());
    }

    #[test]
    fn test_mock_allocate_while_streaming_rejected() {
        let mut device = MockDevice::new();
        device.allocate_buffer().expect("allocate failed");
        device.stream_on().expect("stream_on failed");
        assert!(matches!(
            device.allocate_buffer(),
            Err(CameraError::StreamState(_))
        ));
        assert!(device.release_buffer().is_err());
    }

    #[test]
    fn test_mock_stream_capture() {
        let mut device = MockDevice::new();
        device.allocate_buffer().expect("allocate failed");
        device.stream_on().expect("stream_on failed");

        device.queue_buffer().expect("queue failed");
        let first = device.dequeue_buffer(None).expect("dequeue failed");
        assert_eq!(first.sequence, 0);
        assert_eq!(device.buffer()[..2], [0xFF, 0xD8]);

        device.queue_buffer().expect("queue failed");
        let second = device.dequeue_buffer(None).expect("dequeue failed");
        assert_eq!(second.sequence, 1);
        assert!(second.timestamp > first.timestamp);
    }

    #[test]
    fn test_truncated_jpeg_layout() {
        let frame = truncated_jpeg(19, 64, 0);
        assert_eq!(frame[109..111], [0xFF, 0xDA]);
        assert_eq!(frame[frame.len() - 2..], [0xFF, 0xD9]);
        assert!(!frame.windows(2).any(|w| w == [0xFF, 0xC4]));
    }
}
