//! Global-memory model shared by every tile.
//!
//! A [`DeviceBuffer`] is a cheaply clonable handle to element storage. Clones alias the same
//! cells, the way a device pointer does, and every access is atomic so that concurrently
//! evaluated tiles can store disjoint outputs and merge reductions without locks.

use std::fmt;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::core::element::{Element, RoundStyle};
use crate::core::error::EpilogueError;
use crate::core::shape::{ProblemShape, Stride};

pub struct DeviceBuffer<E: Element> {
    cells: Arc<[AtomicU64]>,
    _marker: PhantomData<E>,
}

impl<E: Element> Clone for DeviceBuffer<E> {
    fn clone(&self) -> Self {
        Self { cells: Arc::clone(&self.cells), _marker: PhantomData }
    }
}

impl<E: Element> fmt::Debug for DeviceBuffer<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceBuffer")
            .field("element", &E::KIND.name())
            .field("len", &self.len())
            .finish()
    }
}

impl<E: Element> DeviceBuffer<E> {
    pub fn filled(len: usize, value: E) -> Self {
        let raw = value.to_raw();
        let cells: Vec<AtomicU64> = (0..len).map(|_| AtomicU64::new(raw)).collect();
        Self { cells: cells.into(), _marker: PhantomData }
    }

    pub fn zeroed(len: usize) -> Self {
        Self::filled(len, E::default())
    }

    pub fn from_slice(values: &[E]) -> Self {
        let cells: Vec<AtomicU64> = values.iter().map(|v| AtomicU64::new(v.to_raw())).collect();
        Self { cells: cells.into(), _marker: PhantomData }
    }

    /// Builds a buffer from `f64` data, rounding each value to nearest.
    pub fn from_f64s(values: &[f64]) -> Self {
        let converted: Vec<E> = values
            .iter()
            .map(|&v| E::from_f64_rounded(v, RoundStyle::ToNearest))
            .collect();
        Self::from_slice(&converted)
    }

    pub fn len(&self) -> usize {
        self.cells.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cells.is_empty()
    }

    #[inline]
    pub fn load(&self, index: usize) -> E {
        E::from_raw(self.cells[index].load(Ordering::Relaxed))
    }

    #[inline]
    pub fn store(&self, index: usize, value: E) {
        self.cells[index].store(value.to_raw(), Ordering::Relaxed);
    }

    pub fn to_vec(&self) -> Vec<E> {
        (0..self.len()).map(|i| self.load(i)).collect()
    }

    pub fn to_f64_vec(&self) -> Vec<f64> {
        (0..self.len()).map(|i| self.load(i).into_f64()).collect()
    }

    pub fn fill(&self, value: E) {
        for i in 0..self.len() {
            self.store(i, value);
        }
    }

    /// Read-modify-write under a compare-and-swap loop. Returns the previous value.
    pub fn fetch_update(&self, index: usize, mut f: impl FnMut(E) -> E) -> E {
        let cell = &self.cells[index];
        let mut current = cell.load(Ordering::Relaxed);
        loop {
            let next = f(E::from_raw(current)).to_raw();
            match cell.compare_exchange_weak(current, next, Ordering::AcqRel, Ordering::Relaxed) {
                Ok(previous) => return E::from_raw(previous),
                Err(observed) => current = observed,
            }
        }
    }

    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.cells, &other.cells)
    }

    /// Checks the buffer covers every element `stride` reaches for `problem`.
    pub fn check_extent(&self, name: &'static str, stride: &Stride, problem: &ProblemShape) -> Result<(), EpilogueError> {
        let required = stride.extent(problem);
        if self.len() < required {
            return Err(EpilogueError::BufferTooSmall { tensor: name, required, actual: self.len() });
        }
        Ok(())
    }
}

/// A buffer plus the stride it is addressed with.
#[derive(Debug, Clone)]
pub struct TensorRef<E: Element> {
    pub buffer: DeviceBuffer<E>,
    pub stride: Stride,
}

impl<E: Element> TensorRef<E> {
    pub fn new(buffer: DeviceBuffer<E>, stride: Stride) -> Self {
        Self { buffer, stride }
    }

    /// Dense row-major `m x n x l` tensor.
    pub fn row_major(problem: &ProblemShape) -> Self {
        Self::new(DeviceBuffer::zeroed(problem.output_len()), Stride::packed_row_major(problem))
    }

    #[inline]
    pub fn load(&self, m: usize, n: usize, l: usize) -> E {
        self.buffer.load(self.stride.offset(m, n, l))
    }

    #[inline]
    pub fn store(&self, m: usize, n: usize, l: usize, value: E) {
        self.buffer.store(self.stride.offset(m, n, l), value)
    }
}

/// Checks that the contiguous extent of a strided tensor allows 128-bit accesses.
pub fn check_alignment<E: Element>(name: &'static str, stride: &Stride, problem: &ProblemShape) -> Result<(), EpilogueError> {
    let required = E::KIND.alignment();
    let contiguous = if stride.n == 1 {
        Some((problem.n, stride.m))
    } else if stride.m == 1 {
        Some((problem.m, stride.n))
    } else {
        None
    };
    if let Some((extent, leading)) = contiguous {
        if extent % required != 0 || (leading as usize) % required != 0 {
            return Err(EpilogueError::Misaligned { tensor: name, required, extent });
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use half::f16;

    #[test]
    fn test_clones_alias_storage() {
        let a = DeviceBuffer::<f32>::zeroed(4);
        let b = a.clone();
        b.store(2, 7.5);
        assert_eq!(a.load(2), 7.5);
        assert!(a.ptr_eq(&b));
    }

    #[test]
    fn test_fetch_update_concurrent_adds() {
        use rayon::prelude::*;
        let buf = DeviceBuffer::<f32>::zeroed(1);
        (0..1000).into_par_iter().for_each(|_| {
            buf.fetch_update(0, |v| v + 1.0);
        });
        assert_eq!(buf.load(0), 1000.0);
    }

    #[test]
    fn test_alignment_check() {
        let p = ProblemShape::new(8, 12, 1, 1);
        let s = Stride::packed_row_major(&p);
        assert!(check_alignment::<f16>("aux", &s, &p).is_err());
        assert!(check_alignment::<f32>("aux", &s, &p).is_ok());
        // broadcast vectors have no contiguous extent to check
        assert!(check_alignment::<f16>("bias", &Stride::broadcast(), &p).is_ok());
    }
}
