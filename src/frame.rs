//! Frames and the latest-frame store.
//!
//! - `Frame`: one decoded RGB image tagged with its camera and capture sequence.
//! - `Canvas`: one composited output image handed to the render surface.
//! - `FrameStore`: camera id -> newest `Frame`. Overwrite-only, no queueing.
//!
//! The store is the only structure written from multiple threads. Its critical
//! sections are a map insert or a clone of `Arc` handles; pixel data is never
//! copied under the lock.

use anyhow::{anyhow, Result};
use image::RgbImage;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, PoisonError};

use crate::{CameraId, MAX_SLOTS};

/// Channel order of every `Frame` and `Canvas` buffer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ChannelOrder {
    Rgb,
}

// ----------------------------------------------------------------------------
// Frame
// ----------------------------------------------------------------------------

/// A decoded frame owned by whoever holds it last.
///
/// Dimensions are always non-zero; the buffer is `height * width * 3` bytes in
/// RGB order.
#[derive(Debug)]
pub struct Frame {
    camera_id: CameraId,
    sequence: u64,
    image: RgbImage,
}

impl Frame {
    pub fn new(camera_id: CameraId, sequence: u64, image: RgbImage) -> Result<Self> {
        if image.width() == 0 || image.height() == 0 {
            return Err(anyhow!(
                "{} delivered an empty frame ({}x{})",
                camera_id,
                image.width(),
                image.height()
            ));
        }
        Ok(Self {
            camera_id,
            sequence,
            image,
        })
    }

    pub fn camera_id(&self) -> CameraId {
        self.camera_id
    }

    /// Per-source capture counter. Strictly increasing within one `StreamSource` run.
    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    pub fn width(&self) -> u32 {
        self.image.width()
    }

    pub fn height(&self) -> u32 {
        self.image.height()
    }

    pub fn image(&self) -> &RgbImage {
        &self.image
    }
}

// ----------------------------------------------------------------------------
// Canvas
// ----------------------------------------------------------------------------

/// Output of one composite pass.
#[derive(Clone, Debug)]
pub struct Canvas {
    /// Monotonic pass counter assigned by the pipeline (0 for standalone compositing).
    pub pass: u64,
    image: RgbImage,
}

impl Canvas {
    pub(crate) fn new(pass: u64, image: RgbImage) -> Self {
        Self { pass, image }
    }

    pub fn width(&self) -> u32 {
        self.image.width()
    }

    pub fn height(&self) -> u32 {
        self.image.height()
    }

    pub fn channel_order(&self) -> ChannelOrder {
        ChannelOrder::Rgb
    }

    /// Packed pixel rows, `width * 3` bytes each.
    pub fn as_raw(&self) -> &[u8] {
        self.image.as_raw()
    }

    pub fn image(&self) -> &RgbImage {
        &self.image
    }
}

// ----------------------------------------------------------------------------
// FrameStore
// ----------------------------------------------------------------------------

/// Point-in-time view of the store, ordered by camera id.
pub type Snapshot = BTreeMap<CameraId, Arc<Frame>>;

/// Thread-safe map from camera id to the newest delivered frame.
///
/// - `put` overwrites unconditionally; the previous frame is dropped (or lives on
///   only in snapshots still holding it)
/// - `snapshot` clones the handles, so readers never hold the lock while compositing
pub struct FrameStore {
    frames: Mutex<HashMap<CameraId, Arc<Frame>>>,
    capacity: usize,
}

impl FrameStore {
    pub fn new() -> Self {
        Self::with_capacity(MAX_SLOTS as usize)
    }

    /// A store accepting at most `capacity` distinct cameras (ids `1..=capacity`).
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            frames: Mutex::new(HashMap::with_capacity(capacity)),
            capacity,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Store `frame` as the latest for its camera.
    pub fn put(&self, frame: Frame) -> Result<()> {
        let camera_id = frame.camera_id();
        if camera_id.get() as usize > self.capacity {
            return Err(anyhow!(
                "{} exceeds frame store capacity {}",
                camera_id,
                self.capacity
            ));
        }
        let frame = Arc::new(frame);
        // The map holds only Arc handles; a panic mid-insert cannot leave it inconsistent.
        let mut frames = self.frames.lock().unwrap_or_else(PoisonError::into_inner);
        frames.insert(camera_id, frame);
        Ok(())
    }

    pub fn snapshot(&self) -> Snapshot {
        let frames = self.frames.lock().unwrap_or_else(PoisonError::into_inner);
        frames
            .iter()
            .map(|(id, frame)| (*id, Arc::clone(frame)))
            .collect()
    }

    pub fn latest(&self, camera_id: CameraId) -> Option<Arc<Frame>> {
        let frames = self.frames.lock().unwrap_or_else(PoisonError::into_inner);
        frames.get(&camera_id).cloned()
    }

    /// Drop every entry for which `keep` returns false.
    pub fn retain(&self, mut keep: impl FnMut(CameraId) -> bool) {
        let mut frames = self.frames.lock().unwrap_or_else(PoisonError::into_inner);
        frames.retain(|id, _| keep(*id));
    }

    pub fn len(&self) -> usize {
        let frames = self.frames.lock().unwrap_or_else(PoisonError::into_inner);
        frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for FrameStore {
    fn default() -> Self {
        Self::new()
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
