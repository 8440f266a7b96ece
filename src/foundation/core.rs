pub use kurbo::Rect;

/// Axis-aligned integer rectangle in buffer pixel space, half-open:
/// `[min_x, max_x) x [min_y, max_y)`.
///
/// A rectangle with `min >= max` on either axis is *invalid*. Invalid rectangles never overlap
/// anything, which is how "no target rectangle set" is expressed.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub struct RectI {
    /// Inclusive left edge.
    pub min_x: i32,
    /// Inclusive top edge.
    pub min_y: i32,
    /// Exclusive right edge.
    pub max_x: i32,
    /// Exclusive bottom edge.
    pub max_y: i32,
}

impl RectI {
    /// Create a rectangle from its edges. No validation is performed.
    pub const fn new(min_x: i32, min_y: i32, max_x: i32, max_y: i32) -> Self {
        Self {
            min_x,
            min_y,
            max_x,
            max_y,
        }
    }

    /// The canonical unset rectangle.
    pub const fn invalid() -> Self {
        Self::new(0, 0, 0, 0)
    }

    /// Rectangle covering `[0, width) x [0, height)`.
    pub fn from_size(width: u32, height: u32) -> Self {
        let w = i32::try_from(width).unwrap_or(i32::MAX);
        let h = i32::try_from(height).unwrap_or(i32::MAX);
        Self::new(0, 0, w, h)
    }

    /// Return `true` when the rectangle has a non-empty area.
    pub fn is_valid(self) -> bool {
        self.min_x < self.max_x && self.min_y < self.max_y
    }

    /// Width in pixels (0 when invalid).
    pub fn width(self) -> u32 {
        if self.is_valid() {
            self.max_x.abs_diff(self.min_x)
        } else {
            0
        }
    }

    /// Height in pixels (0 when invalid).
    pub fn height(self) -> u32 {
        if self.is_valid() {
            self.max_y.abs_diff(self.min_y)
        } else {
            0
        }
    }

    /// Return `true` when both rectangles are valid and share at least one pixel.
    ///
    /// Touching edges do not overlap.
    pub fn intersects(self, other: Self) -> bool {
        self.is_valid()
            && other.is_valid()
            && self.min_x < other.max_x
            && other.min_x < self.max_x
            && self.min_y < other.max_y
            && other.min_y < self.max_y
    }
}

impl Default for RectI {
    fn default() -> Self {
        Self::invalid()
    }
}

impl std::fmt::Display for RectI {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "({}, {})-({}, {})",
            self.min_x, self.min_y, self.max_x, self.max_y
        )
    }
}

#[cfg(test)]
#[path = "../../tests/unit/foundation/core.rs"]
mod tests;
