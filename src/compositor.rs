//! Tiled canvas composition.
//!
//! One pass turns the current `Snapshot` into a canvas of exactly the size the
//! `DisplayConfig` names:
//!
//! 1. Grid shape from the slot count, cells sized by integer division.
//! 2. Slots in ascending camera id, assigned to cells row-major.
//! 3. Each tile is a placeholder (disabled / no signal) or the latest frame
//!    fit-scaled and centered on black.
//! 4. Live tiles run the detection hook, then the annotation overlay.
//! 5. Tiles are stamped into a black canvas, which is rotated last.
//!
//! Nothing in here returns an error. Per-tile problems are handed to the
//! caller's report callback and the tile degrades.

use image::imageops::{self, FilterType};
use image::{Rgb, RgbImage};
use std::panic::{self, AssertUnwindSafe};
use std::path::PathBuf;

use crate::config::{DisplayConfig, StreamConfig};
use crate::detect::{draw_detections, DetectionHook};
use crate::frame::{Canvas, Snapshot};
use crate::overlay::{self, StyleLookup};
use crate::text::{draw_text, text_width, GLYPH_HEIGHT};
use crate::{CameraId, ErrorEvent, ErrorKind};

const FILL: Rgb<u8> = Rgb([0, 0, 0]);
const CAPTION_COLOR: Rgb<u8> = Rgb([255, 0, 0]);
const CAPTION_X: i64 = 10;

// -------------------- Layout --------------------

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct GridShape {
    pub rows: u32,
    pub cols: u32,
}

impl GridShape {
    /// Smallest near-square grid holding `slots` cells: 4 -> 2x2, 3 -> 2x2, 6 -> 2x3.
    pub fn for_slots(slots: usize) -> Self {
        let slots = slots.max(1) as u32;
        let mut cols = 1;
        while cols * cols < slots {
            cols += 1;
        }
        let rows = slots.div_ceil(cols);
        Self { rows, cols }
    }

    pub fn cells(&self) -> u32 {
        self.rows * self.cols
    }
}

/// Pre-rotation geometry of one composite pass.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Layout {
    pub canvas_width: u32,
    pub canvas_height: u32,
    pub grid: GridShape,
    pub cell_width: u32,
    pub cell_height: u32,
}

impl Layout {
    pub fn new(display: &DisplayConfig, slots: usize) -> Self {
        let (canvas_width, canvas_height) = display.target_size();
        let grid = GridShape::for_slots(slots);
        Self {
            canvas_width,
            canvas_height,
            grid,
            cell_width: canvas_width / grid.cols,
            cell_height: canvas_height / grid.rows,
        }
    }

    /// Top-left corner `(x, y)` of the cell at row-major `index`.
    pub fn cell_origin(&self, index: usize) -> (u32, u32) {
        let index = index as u32;
        let row = index / self.grid.cols;
        let col = index % self.grid.cols;
        (col * self.cell_width, row * self.cell_height)
    }
}

/// Placement of fit-scaled content inside a cell.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FitRect {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

impl FitRect {
    /// Uniform scale `min(cell_w / src_w, cell_h / src_h)`, computed in integers
    /// so the limiting side fills the cell exactly.
    pub fn compute(src_width: u32, src_height: u32, cell_width: u32, cell_height: u32) -> Self {
        let (sw, sh) = (src_width.max(1) as u64, src_height.max(1) as u64);
        let (cw, ch) = (cell_width as u64, cell_height as u64);
        let (width, height) = if cw * sh <= ch * sw {
            (cw, sh * cw / sw)
        } else {
            (sw * ch / sh, ch)
        };
        let width = (width as u32).clamp(1, cell_width.max(1));
        let height = (height as u32).clamp(1, cell_height.max(1));
        Self {
            x: cell_width.saturating_sub(width) / 2,
            y: cell_height.saturating_sub(height) / 2,
            width,
            height,
        }
    }
}

/// Resize `source` into a `cell_width x cell_height` tile, centered on black.
pub fn fit_into_cell(source: &RgbImage, cell_width: u32, cell_height: u32) -> RgbImage {
    let mut tile = RgbImage::from_pixel(cell_width, cell_height, FILL);
    if cell_width == 0 || cell_height == 0 || source.width() == 0 || source.height() == 0 {
        return tile;
    }
    let rect = FitRect::compute(source.width(), source.height(), cell_width, cell_height);
    if rect.width == source.width() && rect.height == source.height() {
        imageops::replace(&mut tile, source, rect.x as i64, rect.y as i64);
    } else {
        let resized = imageops::resize(source, rect.width, rect.height, FilterType::Triangle);
        imageops::replace(&mut tile, &resized, rect.x as i64, rect.y as i64);
    }
    tile
}

// -------------------- Slots and placeholders --------------------

/// What a slot shows when no live frame is drawn.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SlotStatus {
    Disabled,
    NoSignal,
    /// The detection hook panicked on this tile.
    Fault,
}

impl SlotStatus {
    pub fn caption(self) -> &'static str {
        match self {
            SlotStatus::Disabled => "DISABLED",
            SlotStatus::NoSignal => "NO SIGNAL",
            SlotStatus::Fault => "TILE ERROR",
        }
    }
}

/// The part of a `StreamConfig` the compositor reads.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Slot {
    pub camera_id: CameraId,
    pub enabled: bool,
    pub annotation_source: Option<PathBuf>,
}

impl From<&StreamConfig> for Slot {
    fn from(config: &StreamConfig) -> Self {
        Self {
            camera_id: config.camera_id,
            enabled: config.enabled,
            annotation_source: config.annotation_source.clone(),
        }
    }
}

/// Black tile with `CAMERA <id>` over the status, red, left-aligned at x=10.
pub fn placeholder(camera_id: CameraId, status: SlotStatus, width: u32, height: u32) -> RgbImage {
    let mut tile = RgbImage::from_pixel(width, height, FILL);
    let scale = (height / 120).max(1);
    let line_height = (GLYPH_HEIGHT * scale) as i64;
    let gap = (scale * 2) as i64;
    let title = format!("CAMERA {}", camera_id.get());
    let status = status.caption();
    let scale = fit_scale(scale, width, &[&title, status]);

    let block = line_height * 2 + gap;
    let top = (height as i64 - block) / 2;
    draw_text(&mut tile, CAPTION_X, top, &title, CAPTION_COLOR, scale);
    draw_text(
        &mut tile,
        CAPTION_X,
        top + line_height + gap,
        status,
        CAPTION_COLOR,
        scale,
    );
    tile
}

fn fit_scale(mut scale: u32, width: u32, lines: &[&str]) -> u32 {
    let available = width.saturating_sub(2 * CAPTION_X as u32);
    while scale > 1 && lines.iter().any(|line| text_width(line, scale) > available) {
        scale -= 1;
    }
    scale
}

// -------------------- Compositor --------------------

/// Stateless apart from the optional detection hook.
#[derive(Default)]
pub struct Compositor {
    detection: Option<Box<dyn DetectionHook>>,
}

impl Compositor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_detection_hook(&mut self, hook: Option<Box<dyn DetectionHook>>) {
        self.detection = hook;
    }

    /// Compose one canvas. Always returns a canvas of `display.output_size()`.
    pub fn compose(
        &mut self,
        slots: &[Slot],
        snapshot: &Snapshot,
        display: &DisplayConfig,
        style: &dyn StyleLookup,
        pass: u64,
        report: &mut dyn FnMut(ErrorEvent),
    ) -> Canvas {
        let layout = Layout::new(display, slots.len());
        let mut canvas = RgbImage::from_pixel(layout.canvas_width, layout.canvas_height, FILL);

        let mut ordered: Vec<&Slot> = slots.iter().collect();
        ordered.sort_by_key(|slot| slot.camera_id);

        for (index, slot) in ordered.into_iter().enumerate() {
            let tile = self.render_tile(slot, snapshot, &layout, style, report);
            let (x, y) = layout.cell_origin(index);
            imageops::replace(&mut canvas, &tile, x as i64, y as i64);
        }

        if display.rotate {
            canvas = imageops::rotate90(&canvas);
        }
        Canvas::new(pass, canvas)
    }

    fn render_tile(
        &mut self,
        slot: &Slot,
        snapshot: &Snapshot,
        layout: &Layout,
        style: &dyn StyleLookup,
        report: &mut dyn FnMut(ErrorEvent),
    ) -> RgbImage {
        let (width, height) = (layout.cell_width, layout.cell_height);
        if !slot.enabled {
            return placeholder(slot.camera_id, SlotStatus::Disabled, width, height);
        }
        let Some(frame) = snapshot.get(&slot.camera_id) else {
            return placeholder(slot.camera_id, SlotStatus::NoSignal, width, height);
        };

        let mut tile = fit_into_cell(frame.image(), width, height);

        if let Some(hook) = self.detection.as_mut() {
            let name = hook.name();
            let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
                hook.detect(tile.as_raw(), width, height)
            }));
            match outcome {
                Ok(Ok(detections)) => draw_detections(&mut tile, &detections),
                Ok(Err(err)) => report(ErrorEvent::new(
                    slot.camera_id,
                    ErrorKind::OverlayFailure,
                    format!("detector {} failed: {:#}", name, err),
                )),
                Err(_) => {
                    log::warn!("detector {} panicked on {}", name, slot.camera_id);
                    report(ErrorEvent::new(
                        slot.camera_id,
                        ErrorKind::OverlayFailure,
                        format!("detector {} panicked", name),
                    ));
                    return placeholder(slot.camera_id, SlotStatus::Fault, width, height);
                }
            }
        }

        if let Some(source) = slot.annotation_source.as_deref() {
            if let Err(err) = overlay::render(&mut tile, source, style) {
                report(ErrorEvent::new(
                    slot.camera_id,
                    ErrorKind::OverlayFailure,
                    format!("{:#}", err),
                ));
            }
        }
        tile
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{AspectMode, Resolution};
    use crate::detect::Detection;
    use crate::frame::{Frame, FrameStore};
    use crate::overlay::LabelStyle;
    use anyhow::{anyhow, Result};
    use std::io::Write;
    use tempfile::NamedTempFile;

    const LIVE: Rgb<u8> = Rgb([10, 200, 30]);

    fn cam(id: u8) -> CameraId {
        CameraId::new(id).expect("camera id")
    }

    fn slots(ids: &[u8]) -> Vec<Slot> {
        ids.iter()
            .map(|id| Slot {
                camera_id: cam(*id),
                enabled: true,
                annotation_source: None,
            })
            .collect()
    }

    fn store_with(ids: &[u8], width: u32, height: u32) -> FrameStore {
        let store = FrameStore::new();
        for id in ids {
            let image = RgbImage::from_pixel(width, height, LIVE);
            store
                .put(Frame::new(cam(*id), 1, image).expect("frame"))
                .expect("put");
        }
        store
    }

    fn compose(slots: &[Slot], snapshot: &Snapshot, display: &DisplayConfig) -> (Canvas, Vec<ErrorEvent>) {
        let mut errors = Vec::new();
        let canvas = Compositor::new().compose(
            slots,
            snapshot,
            display,
            &LabelStyle::default(),
            0,
            &mut |event| errors.push(event),
        );
        (canvas, errors)
    }

    fn count_in_region(img: &RgbImage, x0: u32, y0: u32, w: u32, h: u32, color: Rgb<u8>) -> usize {
        let mut count = 0;
        for y in y0..y0 + h {
            for x in x0..x0 + w {
                if *img.get_pixel(x, y) == color {
                    count += 1;
                }
            }
        }
        count
    }

    #[test]
    fn grid_shapes() {
        assert_eq!(GridShape::for_slots(0), GridShape { rows: 1, cols: 1 });
        assert_eq!(GridShape::for_slots(1), GridShape { rows: 1, cols: 1 });
        assert_eq!(GridShape::for_slots(2), GridShape { rows: 1, cols: 2 });
        assert_eq!(GridShape::for_slots(4), GridShape { rows: 2, cols: 2 });
        assert_eq!(GridShape::for_slots(5), GridShape { rows: 2, cols: 3 });
        assert_eq!(GridShape::for_slots(9), GridShape { rows: 3, cols: 3 });
        for n in 1..=16 {
            assert!(GridShape::for_slots(n).cells() as usize >= n);
        }
    }

    #[test]
    fn layout_uses_integer_cells_and_row_major_origins() {
        let display = DisplayConfig {
            resolution: Resolution::Hd720,
            aspect_mode: AspectMode::Wide,
            rotate: false,
        };
        let layout = Layout::new(&display, 3);
        assert_eq!((layout.cell_width, layout.cell_height), (640, 360));
        assert_eq!(layout.cell_origin(0), (0, 0));
        assert_eq!(layout.cell_origin(1), (640, 0));
        assert_eq!(layout.cell_origin(2), (0, 360));

        let odd = Layout::new(&DisplayConfig::default(), 9);
        assert_eq!((odd.cell_width, odd.cell_height), (640, 360));
    }

    #[test]
    fn fit_rect_preserves_aspect_and_centers() {
        assert_eq!(
            FitRect::compute(640, 480, 960, 540),
            FitRect { x: 120, y: 0, width: 720, height: 540 }
        );
        assert_eq!(
            FitRect::compute(1920, 1080, 540, 960),
            FitRect { x: 0, y: 328, width: 540, height: 303 }
        );
        assert_eq!(
            FitRect::compute(960, 540, 960, 540),
            FitRect { x: 0, y: 0, width: 960, height: 540 }
        );
        for (sw, sh, cw, ch) in [(641, 479, 960, 540), (100, 1000, 640, 360), (3, 2, 7, 5)] {
            let rect = FitRect::compute(sw, sh, cw, ch);
            assert!(rect.width == cw || rect.height == ch);
            let src_ratio = sw as f64 / sh as f64;
            let fit_ratio = rect.width as f64 / rect.height as f64;
            let tolerance = 1.0 / rect.height.min(rect.width) as f64 + 1e-9;
            assert!((src_ratio - fit_ratio).abs() <= src_ratio * tolerance * 2.0);
            let left = rect.x;
            let right = cw - rect.x - rect.width;
            assert!(left.abs_diff(right) <= 1);
        }
    }

    #[test]
    fn canvas_matches_table_for_every_display_mode() {
        for resolution in [Resolution::Hd720, Resolution::Hd1080] {
            for aspect_mode in [AspectMode::Wide, AspectMode::Tall] {
                for rotate in [false, true] {
                    let display = DisplayConfig { resolution, aspect_mode, rotate };
                    let (canvas, _) = compose(&slots(&[1, 2, 3, 4]), &Snapshot::new(), &display);
                    assert_eq!((canvas.width(), canvas.height()), display.output_size());
                    assert_eq!(canvas.as_raw().len(), (canvas.width() * canvas.height() * 3) as usize);
                }
            }
        }
    }

    #[test]
    fn zero_slots_still_produce_full_canvas() {
        let (canvas, errors) = compose(&[], &Snapshot::new(), &DisplayConfig::default());
        assert_eq!((canvas.width(), canvas.height()), (1920, 1080));
        assert!(canvas.image().pixels().all(|p| *p == FILL));
        assert!(errors.is_empty());
    }

    #[test]
    fn no_signal_placeholders_are_captioned() {
        let (canvas, _) = compose(&slots(&[1, 2, 3, 4]), &Snapshot::new(), &DisplayConfig::default());
        for index in 0..4 {
            let x = (index % 2) * 960;
            let y = (index / 2) * 540;
            assert!(count_in_region(canvas.image(), x, y, 960, 540, CAPTION_COLOR) > 0);
        }
    }

    #[test]
    fn live_frames_are_fit_scaled_with_side_borders() {
        let store = store_with(&[1], 640, 480);
        let (canvas, _) = compose(&slots(&[1]), &store.snapshot(), &DisplayConfig::default());
        // One slot -> the whole 1920x1080 canvas is the cell; content is 1440x1080 at x=240.
        let img = canvas.image();
        assert_eq!(*img.get_pixel(239, 540), FILL);
        assert_eq!(*img.get_pixel(240, 540), LIVE);
        assert_eq!(*img.get_pixel(1679, 540), LIVE);
        assert_eq!(*img.get_pixel(1680, 540), FILL);
    }

    #[test]
    fn disabled_slot_never_shows_live_pixels() {
        let store = store_with(&[1, 2, 3, 4], 640, 480);
        let mut slots = slots(&[1, 2, 3, 4]);
        slots[1].enabled = false;
        let (canvas, _) = compose(&slots, &store.snapshot(), &DisplayConfig::default());
        let img = canvas.image();
        assert_eq!(count_in_region(img, 960, 0, 960, 540, LIVE), 0);
        assert!(count_in_region(img, 960, 0, 960, 540, CAPTION_COLOR) > 0);
        assert_eq!(count_in_region(img, 0, 0, 960, 540, LIVE), 720 * 540);
    }

    #[test]
    fn slots_are_placed_in_ascending_camera_order() {
        let store = store_with(&[3], 64, 36);
        let (canvas, _) = compose(&slots(&[4, 3, 2, 1]), &store.snapshot(), &DisplayConfig::default());
        let img = canvas.image();
        assert_eq!(count_in_region(img, 0, 540, 960, 540, LIVE), 960 * 540);
        assert_eq!(count_in_region(img, 0, 0, 960, 540, LIVE), 0);
    }

    #[test]
    fn rotation_is_clockwise_over_unrotated_layout() {
        let store = store_with(&[1], 960, 540);
        let mut display = DisplayConfig::default();
        let (flat, _) = compose(&slots(&[1, 2, 3, 4]), &store.snapshot(), &display);
        display.rotate = true;
        let (rotated, _) = compose(&slots(&[1, 2, 3, 4]), &store.snapshot(), &display);

        assert_eq!((rotated.width(), rotated.height()), (1080, 1920));
        // Clockwise: source (x, y) lands at (h - 1 - y, x).
        for (x, y) in [(0, 0), (959, 539), (1919, 1079), (500, 700)] {
            assert_eq!(
                rotated.image().get_pixel(1079 - y, x),
                flat.image().get_pixel(x, y)
            );
        }
    }

    #[test]
    fn missing_annotation_file_reports_and_keeps_tile() {
        let store = store_with(&[1], 960, 540);
        let mut slots = slots(&[1, 2, 3, 4]);
        slots[0].annotation_source = Some(PathBuf::from("/nonexistent/cam1.json"));
        let (canvas, errors) = compose(&slots, &store.snapshot(), &DisplayConfig::default());

        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].kind, ErrorKind::OverlayFailure);
        assert_eq!(errors[0].camera_id, cam(1));
        assert_eq!(count_in_region(canvas.image(), 0, 0, 960, 540, LIVE), 960 * 540);
    }

    #[test]
    fn annotations_are_normalized_to_the_tile() -> Result<()> {
        let mut file = NamedTempFile::new()?;
        file.write_all(
            br#"{"labels": [{"label_type": "car", "points_normalized": [[0,0],[1,0],[1,1],[0,1]]}]}"#,
        )?;
        let store = store_with(&[2], 640, 480);
        let mut slots = slots(&[1, 2, 3, 4]);
        slots[1].annotation_source = Some(file.path().to_path_buf());
        let (canvas, errors) = compose(&slots, &store.snapshot(), &DisplayConfig::default());

        assert!(errors.is_empty());
        let green = Rgb([0, 255, 0]);
        assert_eq!(*canvas.image().get_pixel(960, 0), green);
        assert_eq!(*canvas.image().get_pixel(1919, 539), green);
        Ok(())
    }

    struct BoxEverything;

    impl DetectionHook for BoxEverything {
        fn name(&self) -> &'static str {
            "box-everything"
        }

        fn detect(&mut self, _pixels: &[u8], _width: u32, _height: u32) -> Result<Vec<Detection>> {
            Ok(vec![Detection {
                x: 0.0,
                y: 0.0,
                w: 1.0,
                h: 1.0,
                label: "car".to_string(),
                class_id: 2,
                confidence: 0.5,
            }])
        }
    }

    struct Failing {
        panic: bool,
    }

    impl DetectionHook for Failing {
        fn name(&self) -> &'static str {
            "failing"
        }

        fn detect(&mut self, _pixels: &[u8], _width: u32, _height: u32) -> Result<Vec<Detection>> {
            if self.panic {
                panic!("detector bug");
            }
            Err(anyhow!("model not loaded"))
        }
    }

    fn compose_with_hook(hook: Box<dyn DetectionHook>) -> (Canvas, Vec<ErrorEvent>) {
        let store = store_with(&[1], 960, 540);
        let mut compositor = Compositor::new();
        compositor.set_detection_hook(Some(hook));
        let mut errors = Vec::new();
        let canvas = compositor.compose(
            &slots(&[1, 2, 3, 4]),
            &store.snapshot(),
            &DisplayConfig::default(),
            &LabelStyle::default(),
            7,
            &mut |event| errors.push(event),
        );
        (canvas, errors)
    }

    #[test]
    fn detections_are_drawn_on_live_tiles() {
        let (canvas, errors) = compose_with_hook(Box::new(BoxEverything));
        assert!(errors.is_empty());
        assert_eq!(canvas.pass, 7);
        assert_eq!(*canvas.image().get_pixel(0, 0), Rgb([0, 0, 255]));
    }

    #[test]
    fn detector_error_keeps_tile_and_reports() {
        let (canvas, errors) = compose_with_hook(Box::new(Failing { panic: false }));
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].kind, ErrorKind::OverlayFailure);
        assert_eq!(*canvas.image().get_pixel(480, 270), LIVE);
    }

    #[test]
    fn detector_panic_degrades_tile_to_placeholder() {
        let (canvas, errors) = compose_with_hook(Box::new(Failing { panic: true }));
        assert_eq!(errors.len(), 1);
        assert_eq!(count_in_region(canvas.image(), 0, 0, 960, 540, LIVE), 0);
        assert!(count_in_region(canvas.image(), 0, 0, 960, 540, CAPTION_COLOR) > 0);
    }
}
