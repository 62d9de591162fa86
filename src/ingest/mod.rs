//! Frame ingestion sources.
//!
//! A `Connector` turns a `StreamConfig` into an open `FrameSource`; the
//! `StreamSource` worker owns the source and drives it. Two backends exist:
//! - RTSP via GStreamer (feature: rtsp-gstreamer)
//! - Synthetic `stub://` streams (always available, used by tests and demos)
//!
//! Sources own all blocking network I/O. Every read is bounded so the worker can
//! observe a stop request within one read timeout.

use anyhow::Result;
use image::RgbImage;

use crate::config::StreamConfig;

pub mod normalize;
pub mod rtsp;

pub use normalize::PixelFormat;
pub use rtsp::{RtspConfig, RtspSource};

/// An open, decoding video connection.
pub trait FrameSource: Send {
    /// Read the next decoded frame.
    ///
    /// - `Ok(Some(image))`: a new frame
    /// - `Ok(None)`: nothing arrived within the read timeout; the connection is still usable
    /// - `Err(_)`: the connection failed and must be released
    fn next_frame(&mut self) -> Result<Option<RgbImage>>;
}

/// Opens connections for a stream configuration.
pub trait Connector: Send + Sync {
    fn open(&self, config: &StreamConfig) -> Result<Box<dyn FrameSource>>;
}

/// Production connector: RTSP for network addresses, synthetic for `stub://`.
#[derive(Clone, Debug)]
pub struct RtspConnector {
    pub target_fps: u32,
    /// Frame size produced by synthetic sources.
    pub width: u32,
    pub height: u32,
}

impl Default for RtspConnector {
    fn default() -> Self {
        let defaults = RtspConfig::default();
        Self {
            target_fps: defaults.target_fps,
            width: defaults.width,
            height: defaults.height,
        }
    }
}

impl Connector for RtspConnector {
    fn open(&self, config: &StreamConfig) -> Result<Box<dyn FrameSource>> {
        let mut source = RtspSource::new(RtspConfig {
            url: config.url(),
            target_fps: self.target_fps,
            width: self.width,
            height: self.height,
        })?;
        source.connect()?;
        Ok(Box::new(source))
    }
}
