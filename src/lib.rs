//! Camera Mosaic
//!
//! This crate implements the core of a multi-camera monitoring display: up to
//! four live streams are ingested independently, the newest frame of each is
//! kept, and all of them are composed into one fixed-resolution tiled canvas.
//!
//! # Architecture
//!
//! ```text
//! StreamSource (one thread per camera) --put--> FrameStore
//!        |                                          |
//!        +--errors--+        +--trigger--+     snapshot()
//!                   v        v           |          v
//!              DisplayPipeline worker ---+--> Compositor --> OverlayRenderer (per tile)
//!                   |
//!                   v
//!             RenderSurface (present canvas / report errors)
//! ```
//!
//! The pipeline guarantees:
//!
//! 1. **Freshness over completeness**: the store keeps one frame per camera, producers never block.
//! 2. **Isolation**: blocking network I/O happens only on the owning camera's thread.
//! 3. **Self-healing sources**: open and read failures are reported and retried until `stop()`.
//! 4. **Total canvases**: every pass produces a fully written canvas of the configured size,
//!    even with no cameras or no frames.
//! 5. **Non-fatal overlays**: a missing annotation file degrades a tile, never the composite.
//!
//! # Module Structure
//!
//! - `frame`: Frames, canvases and the latest-frame store
//! - `config`: Stream/display configuration and the daemon config loader
//! - `ingest`: Frame sources (RTSP via GStreamer, synthetic `stub://`)
//! - `stream`: Per-camera acquisition worker with reconnect
//! - `compositor`: Grid layout, fit-scaling, placeholders, rotation
//! - `overlay`: Annotation files, label styles, polygon drawing
//! - `detect`: Optional detection hook drawn onto tiles
//! - `pipeline`: The control loop tying it all together

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use std::fmt;

pub mod compositor;
pub mod config;
pub mod detect;
pub mod frame;
pub mod ingest;
pub mod overlay;
pub mod pipeline;
pub mod stream;
mod text;

pub use compositor::{Compositor, FitRect, GridShape, Layout, Slot, SlotStatus};
pub use config::{
    validate_stream_configs, AspectMode, Credentials, DisplayConfig, MosaicdConfig, Resolution,
    StreamConfig,
};
pub use detect::{Detection, DetectionHook};
pub use frame::{Canvas, ChannelOrder, Frame, FrameStore, Snapshot};
pub use ingest::{rtsp::RtspConfig, Connector, FrameSource, RtspConnector, RtspSource};
pub use overlay::{AnnotationSet, LabelAppearance, LabelStyle, LabelType, StyleLookup};
pub use pipeline::{DisplayPipeline, PipelineOptions, RenderSurface, Trigger};
pub use stream::StreamSource;

/// Number of camera slots in the reference deployment (2x2 grid).
pub const DEFAULT_SLOTS: u8 = 4;

/// Hard upper bound on camera slots. The grid generalizes, the store is sized to this.
pub const MAX_SLOTS: u8 = 16;

// -------------------- Camera IDs --------------------

/// Identifier of one camera slot, `1..=MAX_SLOTS`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub struct CameraId(u8);

impl CameraId {
    pub fn new(id: u8) -> Result<Self> {
        if id == 0 || id > MAX_SLOTS {
            return Err(anyhow!(
                "camera id {} out of range (expected 1..={})",
                id,
                MAX_SLOTS
            ));
        }
        Ok(Self(id))
    }

    pub fn get(self) -> u8 {
        self.0
    }
}

impl TryFrom<u8> for CameraId {
    type Error = anyhow::Error;

    fn try_from(id: u8) -> Result<Self> {
        Self::new(id)
    }
}

impl From<CameraId> for u8 {
    fn from(id: CameraId) -> u8 {
        id.0
    }
}

impl fmt::Display for CameraId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "camera {}", self.0)
    }
}

// -------------------- Error Events --------------------

/// Category of a non-fatal runtime failure surfaced to the render surface.
///
/// - `Unreachable`: the stream could not be opened (retried after backoff)
/// - `ReadFailure`: an open stream failed mid-read (connection released, retried)
/// - `OverlayFailure`: annotation file missing/corrupt, or the detection hook failed
///
/// Invalid configuration is never an event; it is rejected synchronously.
#[non_exhaustive]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Unreachable,
    ReadFailure,
    OverlayFailure,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorKind::Unreachable => "unreachable",
            ErrorKind::ReadFailure => "read-failure",
            ErrorKind::OverlayFailure => "overlay-failure",
        };
        f.write_str(name)
    }
}

/// A reported failure tagged with the camera it concerns.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorEvent {
    pub camera_id: CameraId,
    pub kind: ErrorKind,
    pub message: String,
}

impl ErrorEvent {
    pub fn new(camera_id: CameraId, kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            camera_id,
            kind,
            message: message.into(),
        }
    }
}

impl fmt::Display for ErrorEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} [{}]: {}", self.camera_id, self.kind, self.message)
    }
}
