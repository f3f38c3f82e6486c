//! Capacity-1 submit/reclaim protocol over one device.
//!
//! The queue is a typestate: [`FrameQueue::submit`] consumes the idle queue and
//! yields an [`Outstanding`] buffer, whose only operation is
//! [`Outstanding::reclaim`]. Submitting twice without a reclaim, or reading a
//! buffer the driver still owns, does not type-check.

use std::time::Duration;

use tracing::trace;

use crate::traits::{CaptureDevice, FrameMetadata, Result};

/// Idle queue: the device's buffer is owned by the application.
#[derive(Debug)]
pub struct FrameQueue<'d, D: ?Sized> {
    device: &'d mut D,
    timeout: Option<Duration>,
}

/// The buffer has been handed to the driver and not yet returned.
#[derive(Debug)]
#[must_use = "an outstanding buffer must be reclaimed"]
pub struct Outstanding<'d, D: ?Sized> {
    device: &'d mut D,
    timeout: Option<Duration>,
}

/// A filled buffer, readable until it is turned back into a queue.
#[derive(Debug)]
pub struct Reclaimed<'d, D: ?Sized> {
    device: &'d mut D,
    timeout: Option<Duration>,
    metadata: FrameMetadata,
}

impl<'d, D: CaptureDevice + ?Sized> FrameQueue<'d, D> {
    /// Wrap a streaming-capable device. Reclaim waits forever by default.
    pub fn new(device: &'d mut D) -> Self {
        Self {
            device,
            timeout: None,
        }
    }

    /// Bound how long [`Outstanding::reclaim`] waits for the driver.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    /// Hand the buffer to the driver.
    pub fn submit(self) -> Result<Outstanding<'d, D>> {
        self.device.queue_buffer()?;
        trace!(path = self.device.path(), "Buffer submitted");
        Ok(Outstanding {
            device: self.device,
            timeout: self.timeout,
        })
    }
}

impl<'d, D: CaptureDevice + ?Sized> Outstanding<'d, D> {
    /// Block until the driver has filled the buffer.
    pub fn reclaim(self) -> Result<Reclaimed<'d, D>> {
        let metadata = self.device.dequeue_buffer(self.timeout)?;
        trace!(
            path = self.device.path(),
            sequence = metadata.sequence,
            bytes_used = metadata.bytes_used,
            "Buffer reclaimed"
        );
        Ok(Reclaimed {
            device: self.device,
            timeout: self.timeout,
            metadata,
        })
    }
}

impl<'d, D: CaptureDevice + ?Sized> Reclaimed<'d, D> {
    /// Driver metadata for the filled buffer.
    pub fn metadata(&self) -> &FrameMetadata {
        &self.metadata
    }

    /// The valid bytes of the frame (`bytes_used` clamped to the buffer).
    pub fn data(&self) -> &[u8] {
        let buffer = self.device.buffer();
        let used = (self.metadata.bytes_used as usize).min(buffer.len());
        buffer.get(..used).unwrap_or_default()
    }

    /// Give up read access so the buffer can be submitted again.
    pub fn into_queue(self) -> FrameQueue<'d, D> {
        FrameQueue {
            device: self.device,
            timeout: self.timeout,
        }
    }
}
