use crate::core::element::{Element, RoundStyle};

/// Register-resident values for one epilogue subtile, row-major `rows x cols`.
#[derive(Debug, Clone, PartialEq)]
pub struct Fragment<T> {
    data: Vec<T>,
    rows: usize,
    cols: usize,
}

impl<T: Copy> Fragment<T> {
    pub fn filled(rows: usize, cols: usize, value: T) -> Self {
        Self { data: vec![value; rows * cols], rows, cols }
    }

    pub fn from_fn(rows: usize, cols: usize, mut f: impl FnMut(usize, usize) -> T) -> Self {
        let mut data = Vec::with_capacity(rows * cols);
        for r in 0..rows {
            for c in 0..cols {
                data.push(f(r, c));
            }
        }
        Self { data, rows, cols }
    }

    pub fn from_vec(rows: usize, cols: usize, data: Vec<T>) -> Self {
        assert_eq!(data.len(), rows * cols, "fragment data does not match {}x{}", rows, cols);
        Self { data, rows, cols }
    }

    pub fn rows(&self) -> usize {
        self.rows
    }

    pub fn cols(&self) -> usize {
        self.cols
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    #[inline]
    pub fn get(&self, r: usize, c: usize) -> T {
        self.data[r * self.cols + c]
    }

    #[inline]
    pub fn set(&mut self, r: usize, c: usize, value: T) {
        self.data[r * self.cols + c] = value;
    }

    pub fn as_slice(&self) -> &[T] {
        &self.data
    }

    pub fn row(&self, r: usize) -> &[T] {
        &self.data[r * self.cols..(r + 1) * self.cols]
    }

    pub fn row_mut(&mut self, r: usize) -> &mut [T] {
        &mut self.data[r * self.cols..(r + 1) * self.cols]
    }

    pub fn map<U: Copy>(&self, f: impl FnMut(T) -> U) -> Fragment<U> {
        Fragment { data: self.data.iter().copied().map(f).collect(), rows: self.rows, cols: self.cols }
    }

    pub fn into_vec(self) -> Vec<T> {
        self.data
    }
}

impl<T: Element> Fragment<T> {
    /// Element-wise conversion at a node boundary.
    pub fn cast<U: Element>(&self, round: RoundStyle) -> Fragment<U> {
        self.map(|v| v.convert::<U>(round))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_row_major_layout() {
        let f = Fragment::from_fn(2, 3, |r, c| (r * 10 + c) as f32);
        assert_eq!(f.get(1, 2), 12.0);
        assert_eq!(f.row(1), &[10.0, 11.0, 12.0]);
    }

    #[test]
    fn test_cast_rounds_at_boundary() {
        let f = Fragment::filled(1, 2, 1.1f32);
        let g: Fragment<half::f16> = f.cast(RoundStyle::TowardZero);
        assert!(g.get(0, 0).to_f32() <= 1.1);
    }
}
