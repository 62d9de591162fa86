/// One detected object.
///
/// `x`, `y` are the top-left corner and `w`, `h` the size, all normalized to
/// the tile (0..1).
#[derive(Clone, Debug, PartialEq)]
pub struct Detection {
    pub x: f32,
    pub y: f32,
    pub w: f32,
    pub h: f32,
    pub label: String,
    pub class_id: u32,
    pub confidence: f32,
}

impl Detection {
    /// Caption drawn above the box, e.g. `car 0.87`.
    pub fn caption(&self) -> String {
        format!("{} {:.2}", self.label, self.confidence)
    }

    /// Box corners in tile pixels, clamped to the tile.
    pub fn pixel_bounds(&self, width: u32, height: u32) -> (i64, i64, i64, i64) {
        let max_x = width.saturating_sub(1) as i64;
        let max_y = height.saturating_sub(1) as i64;
        let scale = |v: f32, extent: u32, max: i64| ((v * extent as f32) as i64).clamp(0, max);
        (
            scale(self.x, width, max_x),
            scale(self.y, height, max_y),
            scale(self.x + self.w, width, max_x),
            scale(self.y + self.h, height, max_y),
        )
    }
}
