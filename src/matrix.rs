// matrix.rs -- Runtime-sized f32 matrix, row-major, no padding.
//
// This is the host-side value type that flows in and out of the pipeline.
// Callers own their input and kernel matrices; the pipeline returns a freshly
// allocated output matrix. Device-resident copies live in `gpu::buffer` and
// never appear in this type.
//
// Memory layout (width = 4, height = 3):
//
//   data index:  0  1  2  3 | 4  5  6  7 | 8  9 10 11
//   row:         |-- row 0 -| |-- row 1 -| |-- row 2 -|
//
// Element (x, y) lives at `y * width + x`. There is no stride: the flat
// slice is exactly what gets uploaded to the GPU, byte for byte.

use std::fmt;

use crate::error::ConvError;

/// A 2D grid of `f32` with dimensions known only at runtime.
#[derive(Clone, PartialEq)]
pub struct Matrix {
    /// Row-major values. Length = width * height.
    data: Vec<f32>,
    width: usize,
    height: usize,
}

impl Matrix {
    /// Create a zero-filled matrix.
    pub fn new(width: usize, height: usize) -> Self {
        Matrix { data: vec![0.0; width * height], width, height }
    }

    /// Create a matrix from a row-major vector.
    ///
    /// # Panics
    /// Panics if `data.len() != width * height`. Use [`Matrix::try_from_vec`]
    /// when the length comes from untrusted input.
    pub fn from_vec(width: usize, height: usize, data: Vec<f32>) -> Self {
        assert_eq!(
            data.len(),
            width * height,
            "data length ({}) must equal width * height ({})",
            data.len(),
            width * height,
        );
        Matrix { data, width, height }
    }

    /// Fallible counterpart of [`Matrix::from_vec`].
    pub fn try_from_vec(width: usize, height: usize, data: Vec<f32>) -> Result<Self, ConvError> {
        if data.len() != width * height {
            return Err(ConvError::Shape { width, height, len: data.len() });
        }
        Ok(Matrix { data, width, height })
    }

    /// Build a matrix by evaluating `f(x, y)` at every element.
    pub fn from_fn(width: usize, height: usize, mut f: impl FnMut(usize, usize) -> f32) -> Self {
        let mut data = Vec::with_capacity(width * height);
        for y in 0..height {
            for x in 0..width {
                data.push(f(x, y));
            }
        }
        Matrix { data, width, height }
    }

    #[inline]
    pub fn width(&self) -> usize {
        self.width
    }

    #[inline]
    pub fn height(&self) -> usize {
        self.height
    }

    /// Number of elements (width * height).
    #[inline]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// True when either dimension is zero.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Size of the flattened data in bytes, as uploaded to the device.
    #[inline]
    pub fn byte_len(&self) -> u64 {
        (self.data.len() * std::mem::size_of::<f32>()) as u64
    }

    /// Value at column `x`, row `y`.
    ///
    /// # Panics
    /// Panics if (x, y) is out of bounds.
    #[inline]
    pub fn get(&self, x: usize, y: usize) -> f32 {
        self.bounds_check(x, y);
        self.data[y * self.width + x]
    }

    #[inline]
    pub fn set(&mut self, x: usize, y: usize, value: f32) {
        self.bounds_check(x, y);
        self.data[y * self.width + x] = value;
    }

    /// Borrow row `y` as a slice of length `width`.
    #[inline]
    pub fn row(&self, y: usize) -> &[f32] {
        assert!(y < self.height, "row {y} out of bounds (height {})", self.height);
        let start = y * self.width;
        &self.data[start..start + self.width]
    }

    /// Iterate over all elements as `(x, y, value)` in row-major order.
    pub fn elements(&self) -> impl Iterator<Item = (usize, usize, f32)> + '_ {
        self.data
            .iter()
            .enumerate()
            .map(move |(i, &v)| (i % self.width, i / self.width, v))
    }

    /// The flat row-major data.
    pub fn as_slice(&self) -> &[f32] {
        &self.data
    }

    /// Consume the matrix and return its data.
    pub fn into_vec(self) -> Vec<f32> {
        self.data
    }

    #[inline]
    fn bounds_check(&self, x: usize, y: usize) {
        assert!(
            x < self.width && y < self.height,
            "element ({x},{y}) out of bounds for matrix {}×{}",
            self.width,
            self.height,
        );
    }
}

// Display prints one row per line, values separated by a single space.
// Intended for small results printed by the demo.
impl fmt::Display for Matrix {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for y in 0..self.height {
            for (i, v) in self.row(y).iter().enumerate() {
                if i > 0 {
                    write!(f, " ")?;
                }
                write!(f, "{v}")?;
            }
            writeln!(f)?;
        }
        Ok(())
    }
}

// Debug shows the shape and at most an 8×16 corner, like a small image dump.
impl fmt::Debug for Matrix {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Matrix {{ {}×{} }}", self.width, self.height)?;
        for y in 0..self.height.min(8) {
            write!(f, "  row {y}: [")?;
            for x in 0..self.width.min(16) {
                if x > 0 {
                    write!(f, ", ")?;
                }
                write!(f, "{:?}", self.get(x, y))?;
            }
            if self.width > 16 {
                write!(f, ", ...")?;
            }
            writeln!(f, "]")?;
        }
        if self.height > 8 {
            writeln!(f, "  ...")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_is_zeroed() {
        let m = Matrix::new(4, 3);
        assert_eq!(m.len(), 12);
        assert!(m.as_slice().iter().all(|&v| v == 0.0));
    }

    #[test]
    fn test_row_major_layout() {
        let m = Matrix::from_vec(3, 2, vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0]);
        assert_eq!(m.get(2, 0), 3.0);
        assert_eq!(m.get(0, 1), 4.0);
        assert_eq!(m.row(1), &[4.0, 5.0, 6.0]);
    }

    #[test]
    fn test_try_from_vec_rejects_bad_length() {
        let err = Matrix::try_from_vec(3, 3, vec![0.0; 8]).unwrap_err();
        assert!(matches!(err, ConvError::Shape { width: 3, height: 3, len: 8 }));
    }

    #[test]
    fn test_from_fn_matches_indices() {
        let m = Matrix::from_fn(4, 3, |x, y| (y * 10 + x) as f32);
        for (x, y, v) in m.elements() {
            assert_eq!(v, (y * 10 + x) as f32);
        }
    }

    #[test]
    fn test_display_rows() {
        let m = Matrix::from_vec(2, 2, vec![-6.0, -6.0, 1.5, 0.0]);
        assert_eq!(m.to_string(), "-6 -6\n1.5 0\n");
    }

    #[test]
    #[should_panic(expected = "out of bounds")]
    fn test_get_out_of_bounds_panics() {
        let m = Matrix::new(2, 2);
        m.get(2, 0);
    }
}
