//! Synchronized capture from a primary and a secondary device.
//!
//! There is no hardware trigger between the two sensors. Alignment comes from
//! keeping the two buffer submissions back to back: nothing runs between the
//! primary and the secondary submit, and the primary is always reclaimed
//! first.

use std::time::Duration;

use tracing::{debug, info, info_span};

use crate::controls::{self, ControlSetting};
use crate::queue::FrameQueue;
use crate::repair::{repair_with, MarkerScan, StrideScan};
use crate::sink::{FramePair, FrameSink};
use crate::traits::{CaptureDevice, ControlInterface, Format, FrameInterval, Result};

/// Per-device setup applied before capture.
#[derive(Debug, Clone)]
pub struct DeviceSetup {
    /// Requested format.
    pub format: Format,
    /// Requested frame interval.
    pub interval: FrameInterval,
    /// Control table.
    pub controls: Vec<ControlSetting>,
}

/// Configure format and rate, apply the control table and allocate the
/// single frame buffer.
pub fn prepare<D>(device: &mut D, setup: &DeviceSetup) -> Result<Format>
where
    D: CaptureDevice + ControlInterface + ?Sized,
{
    let span = info_span!("prepare", path = device.path());
    let _enter = span.enter();

    let format = device.configure(&setup.format)?;
    device.set_frame_interval(setup.interval)?;
    controls::apply_all(device, &setup.controls)?;
    let len = device.allocate_buffer()?;
    info!(width = format.width, height = format.height, buffer_len = len, "Device ready");
    Ok(format)
}

/// Capture run parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CaptureSettings {
    /// Pairs to capture, skipped ones included.
    pub frames: u32,
    /// Leading pairs to discard.
    pub skip: u32,
    /// Bound on each reclaim; `None` waits forever.
    pub reclaim_timeout: Option<Duration>,
    /// Repeat the primary-only priming cycle before every pair instead of
    /// once after streaming starts.
    pub prime_every_pair: bool,
}

impl Default for CaptureSettings {
    fn default() -> Self {
        Self {
            frames: 3,
            skip: 2,
            reclaim_timeout: None,
            prime_every_pair: false,
        }
    }
}

/// Phases of a capture run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptureState {
    /// Streaming on both devices.
    Armed,
    /// Primary pipeline phase absorbed by one throwaway frame.
    Primed,
    /// The given pair (0-based) has been reclaimed from both devices.
    Captured(u32),
    /// Streaming stopped on both devices.
    Drained,
}

/// Outcome of a capture run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CaptureReport {
    /// Pairs captured.
    pub captured: u32,
    /// Pairs discarded as stale.
    pub skipped: u32,
    /// Pairs handed to the sink.
    pub delivered: u32,
    /// Largest timestamp difference among delivered pairs.
    pub max_skew: Duration,
}

/// Drives two devices through the synchronized capture protocol.
pub struct SyncCapture {
    settings: CaptureSettings,
    scan: Box<dyn MarkerScan>,
}

impl SyncCapture {
    /// Create a capture run with the default stride marker scan.
    #[must_use]
    pub fn new(settings: CaptureSettings) -> Self {
        Self {
            settings,
            scan: Box::new(StrideScan),
        }
    }

    /// Replace the marker scan used when repairing frames.
    #[must_use]
    pub fn with_scan(mut self, scan: Box<dyn MarkerScan>) -> Self {
        self.scan = scan;
        self
    }

    /// Capture `frames` pairs, deliver all but the first `skip`.
    ///
    /// Both devices must have a buffer allocated and must not be streaming.
    /// Any failure aborts the run; a pair is delivered only once both of its
    /// frames were reclaimed and repaired.
    pub fn run<P, S, K>(&self, primary: &mut P, secondary: &mut S, sink: &mut K) -> Result<CaptureReport>
    where
        P: CaptureDevice + ?Sized,
        S: CaptureDevice + ?Sized,
        K: FrameSink + ?Sized,
    {
        let span = info_span!(
            "capture",
            primary = primary.path(),
            secondary = secondary.path(),
            frames = self.settings.frames,
            skip = self.settings.skip
        );
        let _enter = span.enter();

        primary.stream_on()?;
        secondary.stream_on()?;
        transition(CaptureState::Armed);

        let report = self.capture_pairs(primary, secondary, sink)?;

        primary.stream_off()?;
        secondary.stream_off()?;
        transition(CaptureState::Drained);

        info!(
            captured = report.captured,
            delivered = report.delivered,
            skipped = report.skipped,
            max_skew_us = u64::try_from(report.max_skew.as_micros()).unwrap_or(u64::MAX),
            "Capture finished"
        );
        Ok(report)
    }

    fn capture_pairs<P, S, K>(
        &self,
        primary: &mut P,
        secondary: &mut S,
        sink: &mut K,
    ) -> Result<CaptureReport>
    where
        P: CaptureDevice + ?Sized,
        S: CaptureDevice + ?Sized,
        K: FrameSink + ?Sized,
    {
        let timeout = self.settings.reclaim_timeout;
        let mut primary_queue = FrameQueue::new(primary).with_timeout(timeout);
        let mut secondary_queue = FrameQueue::new(secondary).with_timeout(timeout);

        primary_queue = primary_queue.submit()?.reclaim()?.into_queue();
        transition(CaptureState::Primed);

        let mut report = CaptureReport::default();
        let mut skip = self.settings.skip;

        for index in 0..self.settings.frames {
            if self.settings.prime_every_pair && index > 0 {
                primary_queue = primary_queue.submit()?.reclaim()?.into_queue();
            }

            let primary_out = primary_queue.submit()?;
            let secondary_out = secondary_queue.submit()?;
            let primary_frame = primary_out.reclaim()?;
            let secondary_frame = secondary_out.reclaim()?;
            report.captured += 1;
            transition(CaptureState::Captured(index));

            if skip > 0 {
                skip -= 1;
                report.skipped += 1;
                debug!(index, "Discarded stale pair");
            } else {
                let pair = FramePair {
                    index,
                    primary: repair_with(
                        self.scan.as_ref(),
                        primary_frame.data(),
                        primary_frame.data().len(),
                    ),
                    secondary: repair_with(
                        self.scan.as_ref(),
                        secondary_frame.data(),
                        secondary_frame.data().len(),
                    ),
                    primary_meta: *primary_frame.metadata(),
                    secondary_meta: *secondary_frame.metadata(),
                };
                let skew = pair.skew();
                debug!(
                    index,
                    primary_seq = pair.primary_meta.sequence,
                    secondary_seq = pair.secondary_meta.sequence,
                    skew_us = u64::try_from(skew.as_micros()).unwrap_or(u64::MAX),
                    "Delivering pair"
                );
                sink.deliver(&pair)?;
                report.delivered += 1;
                report.max_skew = report.max_skew.max(skew);
            }

            primary_queue = primary_frame.into_queue();
            secondary_queue = secondary_frame.into_queue();
        }

        Ok(report)
    }
}

fn transition(state: CaptureState) {
    debug!(?state, "Capture state");
}
