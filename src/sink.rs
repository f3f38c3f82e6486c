//! Destinations for repaired frame pairs.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;

use tempfile::NamedTempFile;
use tracing::debug;

use crate::repair::RepairedImage;
use crate::traits::{FrameMetadata, Result};

/// One retained, repaired capture from both devices.
#[derive(Debug, Clone)]
pub struct FramePair {
    /// Index of the capture among all captured pairs, skipped ones included.
    pub index: u32,
    /// Repaired primary frame.
    pub primary: RepairedImage,
    /// Repaired secondary frame.
    pub secondary: RepairedImage,
    /// Driver metadata of the primary frame.
    pub primary_meta: FrameMetadata,
    /// Driver metadata of the secondary frame.
    pub secondary_meta: FrameMetadata,
}

impl FramePair {
    /// Difference between the two driver timestamps.
    pub fn skew(&self) -> Duration {
        let (a, b) = (self.primary_meta.timestamp, self.secondary_meta.timestamp);
        if a > b {
            a - b
        } else {
            b - a
        }
    }

    /// The repaired frames in device-index order.
    pub fn images(&self) -> [&RepairedImage; 2] {
        [&self.primary, &self.secondary]
    }
}

/// Receives every retained pair.
pub trait FrameSink {
    /// Persist or forward one pair.
    fn deliver(&mut self, pair: &FramePair) -> Result<()>;
}

impl FrameSink for Vec<FramePair> {
    fn deliver(&mut self, pair: &FramePair) -> Result<()> {
        self.push(pair.clone());
        Ok(())
    }
}

/// Writes `<dir>/0.jpg` and `<dir>/1.jpg`, overwriting them for every pair.
///
/// Both frames are staged in the output directory and renamed into place, so
/// a failed delivery leaves `0.jpg` holding the previous pair's frame.
#[derive(Debug, Clone)]
pub struct FileSink {
    dir: PathBuf,
}

impl FileSink {
    /// Create the sink, creating `dir` if needed.
    pub fn new<P: Into<PathBuf>>(dir: P) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    /// Output path for a device index.
    pub fn path_for(&self, device_index: usize) -> PathBuf {
        self.dir.join(format!("{device_index}.jpg"))
    }

    /// Output directory.
    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

impl FileSink {
    fn stage(&self, image: &RepairedImage) -> Result<NamedTempFile> {
        let mut staged = tempfile::Builder::new()
            .prefix(".")
            .suffix(".jpg.tmp")
            .tempfile_in(&self.dir)?;
        staged.write_all(image.as_bytes())?;
        Ok(staged)
    }
}

impl FrameSink for FileSink {
    fn deliver(&mut self, pair: &FramePair) -> Result<()> {
        let staged = [self.stage(&pair.primary)?, self.stage(&pair.secondary)?];

        // Secondary first: if it cannot be placed, 0.jpg still belongs to the
        // pair already on disk
        for (device_index, file) in staged.into_iter().enumerate().rev() {
            let path = self.path_for(device_index);
            file.persist(&path).map_err(|err| err.error)?;
            debug!(path = %path.display(), "Wrote frame");
        }
        Ok(())
    }
}
