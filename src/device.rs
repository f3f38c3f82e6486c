//! V4L2 device implementation using the v4l crate.

use std::io;
use std::os::raw::c_int;
use std::time::{Duration, Instant};

use tracing::{debug, info, instrument, warn};
use v4l::control::{Control, Value};
use v4l::video::capture::Parameters;
use v4l::video::Capture;
use v4l::{Device, Fraction};

use crate::buffer::PageAlignedBuffer;
use crate::sys;
use crate::traits::{
    CameraError, CaptureDevice, ControlDescriptor, ControlInterface, ControlRejection,
    ControlValue, ControlWidth, DeviceCapabilities, Format, FourCC, FrameInterval, FrameMetadata,
    Result,
};

/// The single buffer slot used by the capacity-1 queue.
const BUFFER_INDEX: u32 = 0;

/// V4L2 capture device with one user-pointer buffer.
///
/// Dropping the device releases the buffer slot, frees the buffer and closes
/// the handle. [`V4L2Device::close`] does the same but reports failures.
pub struct V4L2Device {
    path: String,
    // Declared before `buffer`: closing the handle returns any queued buffer
    device: Device,
    capabilities: DeviceCapabilities,
    buffer: Option<PageAlignedBuffer>,
    streaming: bool,
    closed: bool,
}

impl V4L2Device {
    /// Open a V4L2 device by node path (e.g. `/dev/video0`).
    #[instrument(level = "debug")]
    pub fn open(path: &str) -> Result<Self> {
        let device = Device::with_path(path).map_err(|source| CameraError::DeviceOpenFailed {
            path: path.to_owned(),
            source,
        })?;

        let caps = device
            .query_caps()
            .map_err(|err| CameraError::ioctl("VIDIOC_QUERYCAP", err))?;

        let capabilities = DeviceCapabilities {
            driver: caps.driver,
            card: caps.card,
            bus_info: caps.bus,
            can_capture: caps.capabilities.contains(v4l::capability::Flags::VIDEO_CAPTURE),
            can_stream: caps.capabilities.contains(v4l::capability::Flags::STREAMING),
        };

        if !capabilities.can_capture {
            return Err(CameraError::NotCapable {
                path: path.to_owned(),
                reason: "no video capture support",
            });
        }
        if !capabilities.can_stream {
            return Err(CameraError::NotCapable {
                path: path.to_owned(),
                reason: "no streaming I/O support",
            });
        }

        info!(
            path,
            card = %capabilities.card,
            driver = %capabilities.driver,
            "Opened capture device"
        );

        Ok(Self {
            path: path.to_owned(),
            device,
            capabilities,
            buffer: None,
            streaming: false,
            closed: false,
        })
    }

    /// Stop streaming if needed, release the buffer slot, free the buffer and
    /// close the handle.
    pub fn close(mut self) -> Result<()> {
        let result = self.teardown();
        self.closed = true;
        result
    }

    fn teardown(&mut self) -> Result<()> {
        if self.streaming {
            self.stream_off()?;
        }
        self.release_buffer()
    }

    fn fd(&self) -> c_int {
        self.device.handle().fd()
    }
}

impl Drop for V4L2Device {
    fn drop(&mut self) {
        if !self.closed {
            if let Err(err) = self.teardown() {
                warn!(path = %self.path, error = %err, "Device teardown failed");
            }
        }
    }
}

impl CaptureDevice for V4L2Device {
    fn path(&self) -> &str {
        &self.path
    }

    fn capabilities(&self) -> &DeviceCapabilities {
        &self.capabilities
    }

    fn configure(&mut self, format: &Format) -> Result<Format> {
        let mut fmt = self
            .device
            .format()
            .map_err(|err| CameraError::ioctl("VIDIOC_G_FMT", err))?;

        fmt.width = format.width;
        fmt.height = format.height;
        fmt.fourcc = format.fourcc.into();

        let fmt = self.device.set_format(&fmt).map_err(|err| {
            if err.raw_os_error() == Some(libc::EINVAL) {
                CameraError::FormatNotSupported(format.clone())
            } else {
                CameraError::ioctl("VIDIOC_S_FMT", err)
            }
        })?;

        let actual = Format {
            width: fmt.width,
            height: fmt.height,
            fourcc: FourCC::from(fmt.fourcc),
            size: fmt.size,
        };

        // Drivers silently adjust what they cannot do; the capture carries on
        if actual.matches(format) {
            debug!(
                path = %self.path,
                width = actual.width,
                height = actual.height,
                fourcc = %actual.fourcc,
                "Format set"
            );
        } else {
            warn!(
                path = %self.path,
                requested = ?format,
                actual = ?actual,
                "Driver adjusted the requested format"
            );
        }
        Ok(actual)
    }

    fn set_frame_interval(&mut self, interval: FrameInterval) -> Result<FrameInterval> {
        let params = Parameters::new(Fraction::new(interval.numerator, interval.denominator));
        let params = self
            .device
            .set_params(&params)
            .map_err(|err| CameraError::ioctl("VIDIOC_S_PARM", err))?;

        let actual = FrameInterval::new(params.interval.numerator, params.interval.denominator);
        debug!(path = %self.path, ?actual, "Frame interval set");
        Ok(actual)
    }

    fn allocate_buffer(&mut self) -> Result<usize> {
        if self.streaming {
            return Err(CameraError::StreamState(
                "buffers cannot be allocated while streaming",
            ));
        }
        let fd = self.fd();

        let granted = sys::request_buffers(fd, 1)
            .map_err(|err| CameraError::ioctl("VIDIOC_REQBUFS", err))?;
        if granted < 1 {
            return Err(CameraError::ioctl(
                "VIDIOC_REQBUFS",
                io::Error::new(io::ErrorKind::OutOfMemory, "driver granted no buffers"),
            ));
        }

        let length = sys::query_buffer_length(fd, BUFFER_INDEX)
            .map_err(|err| CameraError::ioctl("VIDIOC_QUERYBUF", err))?;
        let buffer = PageAlignedBuffer::new(length as usize)?;

        debug!(path = %self.path, length, "Allocated frame buffer");
        self.buffer = Some(buffer);
        Ok(length as usize)
    }

    fn release_buffer(&mut self) -> Result<()> {
        if self.streaming {
            return Err(CameraError::StreamState(
                "buffers cannot be released while streaming",
            ));
        }
        if self.buffer.is_none() {
            return Ok(());
        }
        sys::request_buffers(self.fd(), 0)
            .map_err(|err| CameraError::ioctl("VIDIOC_REQBUFS", err))?;
        self.buffer = None;
        debug!(path = %self.path, "Released frame buffer");
        Ok(())
    }

    fn stream_on(&mut self) -> Result<()> {
        if self.buffer.is_none() {
            return Err(CameraError::StreamState(
                "streaming requires an allocated buffer",
            ));
        }
        sys::stream_on(self.fd()).map_err(|err| CameraError::ioctl("VIDIOC_STREAMON", err))?;
        self.streaming = true;
        Ok(())
    }

    fn stream_off(&mut self) -> Result<()> {
        sys::stream_off(self.fd()).map_err(|err| CameraError::ioctl("VIDIOC_STREAMOFF", err))?;
        self.streaming = false;
        Ok(())
    }

    fn queue_buffer(&mut self) -> Result<()> {
        let fd = self.fd();
        let buffer = self
            .buffer
            .as_mut()
            .ok_or(CameraError::StreamState("no buffer allocated"))?;
        let len = u32::try_from(buffer.len()).map_err(|_| CameraError::Alloc { len: buffer.len() })?;

        // SAFETY: the buffer is owned by self and is only freed by
        // release_buffer, which refuses while streaming; stream_off returns
        // the buffer from the driver before that can happen. FrameQueue keeps
        // the contents unread until the buffer is dequeued.
        #[allow(unsafe_code)]
        let queued = unsafe { sys::queue_user_buffer(fd, BUFFER_INDEX, buffer.as_mut_ptr(), len) };
        queued.map_err(|err| CameraError::ioctl("VIDIOC_QBUF", err))
    }

    fn dequeue_buffer(&mut self, timeout: Option<Duration>) -> Result<FrameMetadata> {
        let fd = self.fd();
        // Spurious wakeups and signals wait out the remainder, not a fresh timeout
        let deadline = timeout.map(|timeout| Instant::now() + timeout);
        loop {
            let ready = sys::wait_readable(fd, deadline)
                .map_err(|err| CameraError::ioctl("poll", err))?;
            if !ready {
                return Err(CameraError::Timeout(timeout.unwrap_or_default()));
            }

            match sys::dequeue_user_buffer(fd) {
                Ok(dequeued) if dequeued.index != BUFFER_INDEX => {
                    return Err(CameraError::StreamState(
                        "driver returned a buffer slot that was never queued",
                    ));
                }
                Ok(dequeued) => {
                    return Ok(FrameMetadata {
                        sequence: dequeued.sequence,
                        timestamp: dequeued.timestamp,
                        bytes_used: dequeued.bytes_used,
                    });
                }
                // The handle is non-blocking; a spurious wakeup just polls again
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => {}
                Err(err) => return Err(CameraError::ioctl("VIDIOC_DQBUF", err)),
            }
        }
    }

    fn buffer(&self) -> &[u8] {
        self.buffer.as_ref().map_or(&[][..], PageAlignedBuffer::as_slice)
    }
}

/// Map a `VIDIOC_QUERYCTRL` answer to a descriptor. Disabled controls are
/// reported as unknown.
fn describe_control(id: u32, queried: sys::QueriedControl) -> Result<ControlDescriptor> {
    if queried.flags & sys::CTRL_FLAG_DISABLED != 0 {
        return Err(CameraError::UnknownControl { id });
    }
    let width = if queried.typ == sys::CTRL_TYPE_INTEGER64 {
        ControlWidth::Bits64
    } else {
        ControlWidth::Bits32
    };
    Ok(ControlDescriptor {
        id,
        name: queried.name,
        width,
    })
}

#[track_caller]
fn query_error(id: u32, err: io::Error) -> CameraError {
    if err.raw_os_error() == Some(libc::EINVAL) {
        CameraError::UnknownControl { id }
    } else {
        CameraError::ioctl("VIDIOC_QUERYCTRL", err)
    }
}

impl ControlInterface for V4L2Device {
    fn query_control(&self, id: u32) -> Result<ControlDescriptor> {
        let queried = sys::query_control(self.fd(), id).map_err(|err| query_error(id, err))?;
        describe_control(id, queried)
    }

    fn set_control_batch(
        &mut self,
        id: u32,
        value: ControlValue,
    ) -> std::result::Result<(), ControlRejection> {
        let control = Control {
            id,
            value: Value::Integer(value.as_i64()),
        };
        self.device
            .set_controls(vec![control])
            .map_err(ControlRejection::classify)
    }

    fn set_control_legacy(&mut self, id: u32, value: i32) -> io::Result<()> {
        sys::set_control(self.fd(), id, value)
    }
}
