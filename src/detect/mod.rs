mod hook;
mod result;

pub use hook::DetectionHook;
pub use result::Detection;

use image::{Rgb, RgbImage};

use crate::overlay::draw_polyline;
use crate::text::{draw_text, GLYPH_HEIGHT};

/// Box colours, indexed by `class_id % PALETTE.len()`.
pub const PALETTE: [Rgb<u8>; 6] = [
    Rgb([255, 0, 0]),
    Rgb([0, 255, 0]),
    Rgb([0, 0, 255]),
    Rgb([255, 255, 0]),
    Rgb([255, 0, 255]),
    Rgb([0, 255, 255]),
];

const BOX_THICKNESS: u32 = 2;
const CAPTION_GAP: i64 = 3;

pub fn class_color(class_id: u32) -> Rgb<u8> {
    PALETTE[class_id as usize % PALETTE.len()]
}

/// Draw boxes and captions for `detections` onto `tile`.
pub fn draw_detections(tile: &mut RgbImage, detections: &[Detection]) {
    let (width, height) = tile.dimensions();
    if width == 0 || height == 0 {
        return;
    }
    for detection in detections {
        let color = class_color(detection.class_id);
        let (x1, y1, x2, y2) = detection.pixel_bounds(width, height);
        draw_polyline(
            tile,
            &[(x1, y1), (x2, y1), (x2, y2), (x1, y2)],
            true,
            color,
            BOX_THICKNESS,
        );
        let caption_y = y1 - GLYPH_HEIGHT as i64 - CAPTION_GAP;
        // Above the box when there is room, otherwise just inside it.
        let caption_y = if caption_y < 0 { y1 + CAPTION_GAP } else { caption_y };
        draw_text(tile, x1, caption_y, &detection.caption(), color, 1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn car(confidence: f32) -> Detection {
        Detection {
            x: 0.25,
            y: 0.5,
            w: 0.5,
            h: 0.25,
            label: "car".to_string(),
            class_id: 8,
            confidence,
        }
    }

    #[test]
    fn caption_rounds_confidence_to_two_places() {
        assert_eq!(car(0.876).caption(), "car 0.88");
    }

    #[test]
    fn palette_wraps_on_class_id() {
        assert_eq!(class_color(1), class_color(7));
        assert_eq!(class_color(2), Rgb([0, 0, 255]));
    }

    #[test]
    fn bounds_clamp_to_tile() {
        let mut wide = car(0.5);
        wide.w = 4.0;
        assert_eq!(wide.pixel_bounds(100, 40), (25, 20, 99, 30));
    }

    #[test]
    fn draws_box_outline_in_class_color() {
        let mut tile = RgbImage::new(100, 40);
        draw_detections(&mut tile, &[car(0.9)]);
        let color = class_color(8);
        assert_eq!(*tile.get_pixel(25, 20), color);
        assert_eq!(*tile.get_pixel(75, 30), color);
        assert_eq!(*tile.get_pixel(50, 25), Rgb([0, 0, 0]));
    }
}
