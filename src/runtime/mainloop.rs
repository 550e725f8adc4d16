//! Accumulator producers feeding the epilogue.

use rayon::prelude::*;

use crate::core::element::Element;
use crate::core::error::EpilogueError;
use crate::core::memory::{DeviceBuffer, TensorRef};
use crate::core::shape::{ProblemShape, Stride, TileContext};
use crate::semantic::fragment::Fragment;

/// Produces the f32 accumulator tile for each CTA tile of the problem.
pub trait AccumulatorSource: Send + Sync {
    fn problem(&self) -> ProblemShape;

    /// The full CTA tile, zero past the problem edge.
    fn tile_accumulators(&self, tile: &TileContext) -> Fragment<f32>;
}

/// Reference GEMM mainloop: `acc(m, n, l) = sum_k A(m, k, l) * B(k, n, l)` in f32, summed
/// in ascending `k`.
///
/// `A` is addressed as `(m, k, l)` through `stride_a` and `B` as `(k, n, l)` through
/// `stride_b`.
pub struct ReferenceMainloop<A: Element, B: Element> {
    problem: ProblemShape,
    a: DeviceBuffer<A>,
    b: DeviceBuffer<B>,
    stride_a: Stride,
    stride_b: Stride,
}

impl<A: Element, B: Element> ReferenceMainloop<A, B> {
    pub fn new(
        problem: ProblemShape,
        a: DeviceBuffer<A>,
        stride_a: Stride,
        b: DeviceBuffer<B>,
        stride_b: Stride,
    ) -> Result<Self, EpilogueError> {
        let view_a = ProblemShape::new(problem.m, problem.k, 0, problem.l);
        let view_b = ProblemShape::new(problem.k, problem.n, 0, problem.l);
        a.check_extent("A", &stride_a, &view_a)?;
        b.check_extent("B", &stride_b, &view_b)?;
        Ok(Self { problem, a, b, stride_a, stride_b })
    }

    /// Packed row-major A (`m x k`) and B (`k x n`).
    pub fn row_major(problem: ProblemShape, a: DeviceBuffer<A>, b: DeviceBuffer<B>) -> Result<Self, EpilogueError> {
        let stride_a = Stride::row_major(problem.k as i64, (problem.m * problem.k) as i64);
        let stride_b = Stride::row_major(problem.n as i64, (problem.k * problem.n) as i64);
        Self::new(problem, a, stride_a, b, stride_b)
    }
}

impl<A: Element, B: Element> AccumulatorSource for ReferenceMainloop<A, B> {
    fn problem(&self) -> ProblemShape {
        self.problem
    }

    fn tile_accumulators(&self, tile: &TileContext) -> Fragment<f32> {
        let [rows, cols] = tile.cta;
        let (row0, col0, l) = (tile.row_origin(), tile.col_origin(), tile.coord.l);
        let valid_rows = self.problem.m.saturating_sub(row0).min(rows);
        let valid_cols = self.problem.n.saturating_sub(col0).min(cols);

        // B panel for this tile, converted once: k x valid_cols
        let panel: Vec<f32> = (0..self.problem.k)
            .flat_map(|k| {
                (0..valid_cols).map(move |c| self.b.load(self.stride_b.offset(k, col0 + c, l)).into_f64() as f32)
            })
            .collect();

        let mut data = vec![0.0f32; rows * cols];
        data.par_chunks_mut(cols).take(valid_rows).enumerate().for_each(|(r, out)| {
            let a_row: Vec<f32> = (0..self.problem.k)
                .map(|k| self.a.load(self.stride_a.offset(row0 + r, k, l)).into_f64() as f32)
                .collect();
            for (k, &a) in a_row.iter().enumerate() {
                let b_row = &panel[k * valid_cols..(k + 1) * valid_cols];
                for (acc, &b) in out[..valid_cols].iter_mut().zip(b_row) {
                    *acc += a * b;
                }
            }
        });
        Fragment::from_vec(rows, cols, data)
    }
}

/// Precomputed accumulators, read from an `(m, n, l)` tensor.
pub struct AccumulatorTensor {
    problem: ProblemShape,
    acc: TensorRef<f32>,
}

impl AccumulatorTensor {
    pub fn new(problem: ProblemShape, acc: TensorRef<f32>) -> Result<Self, EpilogueError> {
        acc.buffer.check_extent("accumulator", &acc.stride, &problem)?;
        Ok(Self { problem, acc })
    }

    pub fn row_major(problem: ProblemShape, values: &[f32]) -> Result<Self, EpilogueError> {
        let acc = TensorRef::new(DeviceBuffer::from_slice(values), Stride::packed_row_major(&problem));
        Self::new(problem, acc)
    }
}

impl AccumulatorSource for AccumulatorTensor {
    fn problem(&self) -> ProblemShape {
        self.problem
    }

    fn tile_accumulators(&self, tile: &TileContext) -> Fragment<f32> {
        let [rows, cols] = tile.cta;
        let (row0, col0, l) = (tile.row_origin(), tile.col_origin(), tile.coord.l);
        Fragment::from_fn(rows, cols, |r, c| {
            let (m, n) = (row0 + r, col0 + c);
            if m < self.problem.m && n < self.problem.n {
                self.acc.load(m, n, l)
            } else {
                0.0
            }
        })
    }
}
