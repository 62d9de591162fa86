//! Annotation overlays.
//!
//! Annotation files are produced by an external labelling tool:
//!
//! ```json
//! { "labels": [ { "label_type": "car", "points_normalized": [[0.1, 0.2], [0.4, 0.2], [0.4, 0.6]] } ] }
//! ```
//!
//! Points are normalized to the image they were drawn on, so they are mapped
//! through the tile's own width and height at render time. Unknown label types
//! and unknown fields are ignored.

use anyhow::{anyhow, Context, Result};
use image::{Rgb, RgbImage};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;

/// Outline thickness of annotation polygons, in pixels.
pub const POLYGON_THICKNESS: u32 = 2;

// -------------------- Label types and styles --------------------

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LabelType {
    Car,
    Parking,
    Plate,
}

impl LabelType {
    pub const ALL: [LabelType; 3] = [LabelType::Car, LabelType::Parking, LabelType::Plate];

    /// Recognized label names; anything else is ignored by the renderer.
    pub fn parse(name: &str) -> Option<Self> {
        match name.trim() {
            "car" => Some(LabelType::Car),
            "parking" => Some(LabelType::Parking),
            "plate" => Some(LabelType::Plate),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            LabelType::Car => "car",
            LabelType::Parking => "parking",
            LabelType::Plate => "plate",
        }
    }
}

impl fmt::Display for LabelType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The capability the renderer needs from whoever owns label styling.
pub trait StyleLookup {
    fn visible(&self, label: LabelType) -> bool;
    fn color(&self, label: LabelType) -> Rgb<u8>;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LabelAppearance {
    pub visible: bool,
    pub normal_color: Rgb<u8>,
    pub trigger_color: Rgb<u8>,
    /// Selects `trigger_color`. Nothing in the core raises it yet.
    pub triggered: bool,
}

impl LabelAppearance {
    pub fn new(normal_color: Rgb<u8>, trigger_color: Rgb<u8>) -> Self {
        Self {
            visible: true,
            normal_color,
            trigger_color,
            triggered: false,
        }
    }

    pub fn active_color(&self) -> Rgb<u8> {
        if self.triggered {
            self.trigger_color
        } else {
            self.normal_color
        }
    }
}

/// Per-label visibility and colours, supplied by the UI collaborator.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LabelStyle {
    car: LabelAppearance,
    parking: LabelAppearance,
    plate: LabelAppearance,
}

impl LabelStyle {
    pub fn appearance(&self, label: LabelType) -> &LabelAppearance {
        match label {
            LabelType::Car => &self.car,
            LabelType::Parking => &self.parking,
            LabelType::Plate => &self.plate,
        }
    }

    pub fn appearance_mut(&mut self, label: LabelType) -> &mut LabelAppearance {
        match label {
            LabelType::Car => &mut self.car,
            LabelType::Parking => &mut self.parking,
            LabelType::Plate => &mut self.plate,
        }
    }

    pub fn set_visible(&mut self, label: LabelType, visible: bool) {
        self.appearance_mut(label).visible = visible;
    }

    pub fn set_triggered(&mut self, label: LabelType, triggered: bool) {
        self.appearance_mut(label).triggered = triggered;
    }
}

impl Default for LabelStyle {
    fn default() -> Self {
        Self {
            car: LabelAppearance::new(Rgb([0, 255, 0]), Rgb([0, 0, 255])),
            parking: LabelAppearance::new(Rgb([0, 255, 255]), Rgb([255, 0, 255])),
            plate: LabelAppearance::new(Rgb([255, 255, 0]), Rgb([255, 0, 0])),
        }
    }
}

impl StyleLookup for LabelStyle {
    fn visible(&self, label: LabelType) -> bool {
        self.appearance(label).visible
    }

    fn color(&self, label: LabelType) -> Rgb<u8> {
        self.appearance(label).active_color()
    }
}

// -------------------- Annotation files --------------------

#[derive(Debug, Deserialize)]
struct AnnotationFile {
    #[serde(default)]
    labels: Option<Vec<serde_json::Value>>,
}

/// One labelled polygon. `label_type` stays a raw string so unknown types survive parsing.
#[derive(Clone, Debug, PartialEq, Deserialize)]
pub struct Annotation {
    #[serde(default)]
    pub label_type: String,
    #[serde(default)]
    pub points_normalized: Vec<[f64; 2]>,
}

impl Annotation {
    pub fn label(&self) -> Option<LabelType> {
        LabelType::parse(&self.label_type)
    }
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct AnnotationSet {
    pub annotations: Vec<Annotation>,
}

impl AnnotationSet {
    /// Parse an annotation file. Entries that are not a well-formed annotation
    /// are skipped; only a file that is not a JSON object is an error.
    pub fn parse(json: &str) -> Result<Self> {
        let file: AnnotationFile =
            serde_json::from_str(json).map_err(|e| anyhow!("invalid annotation file: {}", e))?;
        let entries = file.labels.unwrap_or_default();
        let total = entries.len();
        let annotations: Vec<Annotation> = entries
            .into_iter()
            .filter_map(|entry| serde_json::from_value(entry).ok())
            .collect();
        if annotations.len() < total {
            log::debug!(
                "skipped {} malformed annotation(s) of {}",
                total - annotations.len(),
                total
            );
        }
        Ok(Self { annotations })
    }

    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("read annotation file {}", path.display()))?;
        Self::parse(&raw).with_context(|| format!("parse annotation file {}", path.display()))
    }
}

// -------------------- Rendering --------------------

/// Draw the annotations stored at `source` onto `tile`.
///
/// The file is read before any pixel is touched, so on error the tile is
/// returned unmodified and the caller decides how to report it.
/// Returns the number of polygons drawn.
pub fn render(tile: &mut RgbImage, source: &Path, style: &dyn StyleLookup) -> Result<usize> {
    let set = AnnotationSet::load(source)?;
    Ok(draw_annotations(tile, &set, style))
}

pub fn draw_annotations(tile: &mut RgbImage, set: &AnnotationSet, style: &dyn StyleLookup) -> usize {
    let (width, height) = tile.dimensions();
    if width == 0 || height == 0 {
        return 0;
    }
    let mut drawn = 0;
    for annotation in &set.annotations {
        let Some(label) = annotation.label() else {
            continue;
        };
        if !style.visible(label) || annotation.points_normalized.is_empty() {
            continue;
        }
        let polygon: Vec<(i64, i64)> = annotation
            .points_normalized
            .iter()
            .map(|[nx, ny]| {
                let (x, y) = to_tile_pixel(*nx, *ny, width, height);
                (x as i64, y as i64)
            })
            .collect();
        draw_polyline(tile, &polygon, true, style.color(label), POLYGON_THICKNESS);
        drawn += 1;
    }
    drawn
}

/// Map a normalized point to a pixel: `(nx * width, ny * height)` truncated,
/// clamped into the image so `(1, 1)` lands on the last pixel.
pub fn to_tile_pixel(nx: f64, ny: f64, width: u32, height: u32) -> (u32, u32) {
    (scale_axis(nx, width), scale_axis(ny, height))
}

fn scale_axis(n: f64, extent: u32) -> u32 {
    let max = extent.saturating_sub(1) as i64;
    // `as` saturates and maps NaN to 0.
    ((n * extent as f64) as i64).clamp(0, max) as u32
}

pub(crate) fn draw_polyline(
    img: &mut RgbImage,
    points: &[(i64, i64)],
    closed: bool,
    color: Rgb<u8>,
    thickness: u32,
) {
    match points {
        [] => {}
        [single] => plot(img, single.0, single.1, color, thickness),
        _ => {
            for pair in points.windows(2) {
                draw_line(img, pair[0], pair[1], color, thickness);
            }
            if closed {
                if let (Some(&last), Some(&first)) = (points.last(), points.first()) {
                    draw_line(img, last, first, color, thickness);
                }
            }
        }
    }
}

/// Bresenham line, each step stamping a `thickness` square clipped to the image.
pub(crate) fn draw_line(
    img: &mut RgbImage,
    from: (i64, i64),
    to: (i64, i64),
    color: Rgb<u8>,
    thickness: u32,
) {
    let (mut x, mut y) = from;
    let dx = (to.0 - x).abs();
    let dy = -(to.1 - y).abs();
    let sx = if x < to.0 { 1 } else { -1 };
    let sy = if y < to.1 { 1 } else { -1 };
    let mut err = dx + dy;
    loop {
        plot(img, x, y, color, thickness);
        if x == to.0 && y == to.1 {
            break;
        }
        let e2 = 2 * err;
        if e2 >= dy {
            err += dy;
            x += sx;
        }
        if e2 <= dx {
            err += dx;
            y += sy;
        }
    }
}

fn plot(img: &mut RgbImage, x: i64, y: i64, color: Rgb<u8>, thickness: u32) {
    let (width, height) = (img.width() as i64, img.height() as i64);
    let t = thickness.max(1) as i64;
    for py in y..y + t {
        for px in x..x + t {
            if px >= 0 && py >= 0 && px < width && py < height {
                img.put_pixel(px as u32, py as u32, color);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    const BLACK: Rgb<u8> = Rgb([0, 0, 0]);

    fn square_set(label: &str) -> AnnotationSet {
        AnnotationSet::parse(&format!(
            r#"{{"labels": [{{"label_type": "{}", "points_normalized": [[0,0],[1,0],[1,1],[0,1]]}}]}}"#,
            label
        ))
        .expect("annotation json")
    }

    #[test]
    fn corner_points_map_to_first_and_last_pixel() {
        for (w, h) in [(1, 1), (2, 3), (960, 540), (641, 479)] {
            assert_eq!(to_tile_pixel(0.0, 0.0, w, h), (0, 0));
            assert_eq!(to_tile_pixel(1.0, 1.0, w, h), (w - 1, h - 1));
        }
    }

    #[test]
    fn interior_points_truncate() {
        assert_eq!(to_tile_pixel(0.5, 0.25, 100, 10), (50, 2));
        assert_eq!(to_tile_pixel(0.999, 0.0, 100, 10), (99, 0));
        assert_eq!(to_tile_pixel(-0.5, f64::NAN, 100, 10), (0, 0));
    }

    #[test]
    fn visible_polygon_outlines_tile_in_label_color() {
        let style = LabelStyle::default();
        let mut tile = RgbImage::from_pixel(40, 30, BLACK);
        let drawn = draw_annotations(&mut tile, &square_set("car"), &style);

        assert_eq!(drawn, 1);
        let green = style.color(LabelType::Car);
        assert_eq!(*tile.get_pixel(0, 0), green);
        assert_eq!(*tile.get_pixel(39, 29), green);
        assert_eq!(*tile.get_pixel(20, 0), green);
        assert_eq!(*tile.get_pixel(20, 15), BLACK);
    }

    #[test]
    fn hidden_and_unknown_labels_draw_nothing() {
        let mut style = LabelStyle::default();
        style.set_visible(LabelType::Plate, false);
        let mut tile = RgbImage::from_pixel(10, 10, BLACK);

        assert_eq!(draw_annotations(&mut tile, &square_set("plate"), &style), 0);
        assert_eq!(draw_annotations(&mut tile, &square_set("bicycle"), &style), 0);
        assert!(tile.pixels().all(|p| *p == BLACK));
    }

    #[test]
    fn triggered_label_uses_trigger_color() {
        let mut style = LabelStyle::default();
        style.set_triggered(LabelType::Parking, true);
        assert_eq!(
            style.color(LabelType::Parking),
            style.appearance(LabelType::Parking).trigger_color
        );
    }

    #[test]
    fn missing_list_and_unknown_fields_are_accepted() -> Result<()> {
        let empty = AnnotationSet::parse(r#"{"version": 2}"#)?;
        assert!(empty.annotations.is_empty());

        let extra = AnnotationSet::parse(
            r#"{"labels": [{"label_type": "car", "id": 7, "points_normalized": [[0.5, 0.5]]}]}"#,
        )?;
        assert_eq!(extra.annotations[0].label(), Some(LabelType::Car));
        Ok(())
    }

    #[test]
    fn malformed_entries_are_skipped_and_valid_polygons_still_draw() -> Result<()> {
        let set = AnnotationSet::parse(
            r#"{"labels": [
                {"label_type": null, "points_normalized": [[0,0],[1,1]]},
                {"label_type": "car", "points_normalized": null},
                {"label_type": "car", "points_normalized": "nope"},
                42,
                {"label_type": "car", "points_normalized": [[0,0],[1,0],[1,1],[0,1]]}
            ]}"#,
        )?;
        assert_eq!(set.annotations.len(), 1);

        let style = LabelStyle::default();
        let mut tile = RgbImage::from_pixel(20, 20, BLACK);
        assert_eq!(draw_annotations(&mut tile, &set, &style), 1);
        assert_eq!(*tile.get_pixel(0, 0), style.color(LabelType::Car));

        let null_list = AnnotationSet::parse(r#"{"labels": null}"#)?;
        assert!(null_list.annotations.is_empty());
        assert!(AnnotationSet::parse("not json").is_err());
        Ok(())
    }

    #[test]
    fn render_leaves_tile_untouched_when_source_missing() {
        let mut tile = RgbImage::from_pixel(8, 8, BLACK);
        let result = render(
            &mut tile,
            Path::new("/nonexistent/labels.json"),
            &LabelStyle::default(),
        );
        assert!(result.is_err());
        assert!(tile.pixels().all(|p| *p == BLACK));
    }

    #[test]
    fn render_reads_file_from_disk() -> Result<()> {
        let mut file = NamedTempFile::new()?;
        file.write_all(
            br#"{"labels": [{"label_type": "plate", "points_normalized": [[0.1,0.1],[0.9,0.1],[0.5,0.9]]}]}"#,
        )?;
        let mut tile = RgbImage::from_pixel(100, 100, BLACK);
        let drawn = render(&mut tile, file.path(), &LabelStyle::default())?;
        assert_eq!(drawn, 1);
        assert_eq!(*tile.get_pixel(10, 10), Rgb([255, 255, 0]));
        Ok(())
    }
}
