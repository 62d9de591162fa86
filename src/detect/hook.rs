use anyhow::Result;

use crate::detect::result::Detection;

/// Optional per-tile detector.
///
/// The hook sees each fitted tile before annotations are drawn on it. Pixels are
/// packed RGB, `width * height * 3` bytes, valid only for the duration of the
/// call.
///
/// Failures are contained to the tile and reported as overlay failures for that
/// camera. After an `Err` the tile is still shown without boxes; after a panic it
/// falls back to its fault placeholder.
pub trait DetectionHook: Send {
    /// Detector identifier, used in logs and error messages.
    fn name(&self) -> &'static str;

    /// Run detection on one tile. Boxes are normalized to the tile.
    fn detect(&mut self, pixels: &[u8], width: u32, height: u32) -> Result<Vec<Detection>>;

    /// Called once when the hook is installed.
    fn warm_up(&mut self) -> Result<()> {
        Ok(())
    }
}
