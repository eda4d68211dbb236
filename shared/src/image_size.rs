//! Frame dimensions and window bounds checks

use ndarray::Array2;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Frame dimensions
///
/// Width and height of a detector frame or a derived output grid. Arrays are
/// row-major: shape is always (height, width).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ImageSize {
    /// Width in pixels
    pub width: usize,
    /// Height in pixels
    pub height: usize,
}

impl ImageSize {
    pub fn from_width_height(width: usize, height: usize) -> Self {
        Self { width, height }
    }

    /// Size of an existing array
    pub fn of<T>(array: &Array2<T>) -> Self {
        let (height, width) = array.dim();
        Self { width, height }
    }

    /// Array shape (rows, cols)
    pub fn shape(&self) -> (usize, usize) {
        (self.height, self.width)
    }

    /// Zero-filled f32 array with this size
    pub fn zeros_f32(&self) -> Array2<f32> {
        Array2::zeros(self.shape())
    }

    /// Array of this size filled with `value`
    pub fn filled_f32(&self, value: f32) -> Array2<f32> {
        Array2::from_elem(self.shape(), value)
    }

    /// Get total number of pixels
    pub fn pixel_count(&self) -> usize {
        self.width * self.height
    }

    /// True if a `w`x`h` window whose first pixel is at column `x`, row `y`
    /// lies entirely inside the frame
    pub fn contains_window(&self, x: usize, y: usize, w: usize, h: usize) -> bool {
        x.checked_add(w).is_some_and(|end| end <= self.width)
            && y.checked_add(h).is_some_and(|end| end <= self.height)
    }
}

impl From<(usize, usize)> for ImageSize {
    /// From (width, height)
    fn from(dimensions: (usize, usize)) -> Self {
        Self::from_width_height(dimensions.0, dimensions.1)
    }
}

impl fmt::Display for ImageSize {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}
