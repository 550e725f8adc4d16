//! Reduction ops. Both kinds pass their input through unchanged; the reduced value is a side
//! output, folded per tile with `Red` and merged into global memory with `Atom`.
//!
//! The destination must hold the identity of `Atom` (zero for sums and absolute maxima)
//! before the launch.

use std::marker::PhantomData;

use crate::core::element::{ComputeElement, Element, RoundStyle, Rounding};
use crate::core::error::EpilogueError;
use crate::core::memory::DeviceBuffer;
use crate::core::shape::{ProblemShape, Stride, Subtile, TileContext, TileShape};
use crate::nodes::broadcast::VectorAxis;
use crate::semantic::fragment::Fragment;
use crate::semantic::functor::{AtomicFn, ReduceFn};
use crate::semantic::visitor::NodeOp;

#[derive(Debug, Clone, Default)]
pub struct ReductionArgs<E: Element> {
    pub ptr: Option<DeviceBuffer<E>>,
    pub stride: Stride,
}

impl<E: Element> ReductionArgs<E> {
    pub fn new(ptr: Option<DeviceBuffer<E>>, stride: Stride) -> Self {
        Self { ptr, stride }
    }
}

fn merge<E: Element, Atom: AtomicFn>(ptr: &DeviceBuffer<E>, index: usize, partial: f64, round: RoundStyle) {
    ptr.fetch_update(index, |current| {
        E::from_f64_rounded(Atom::combine(current.into_f64(), partial), round)
    });
}

/// Reduces the whole problem (per batch) to one value.
pub struct ScalarReduction<Red, Atom, E: Element, Cmp, R> {
    args: ReductionArgs<E>,
    _marker: PhantomData<(Red, Atom, Cmp, R)>,
}

impl<Red, Atom, E, Cmp, R> NodeOp<1> for ScalarReduction<Red, Atom, E, Cmp, R>
where
    Red: ReduceFn,
    Atom: AtomicFn,
    E: Element,
    Cmp: ComputeElement,
    R: Rounding,
{
    type Arguments = ReductionArgs<E>;
    type Input = Cmp;
    type Output = Cmp;
    type TileState = Cmp;

    fn new(args: Self::Arguments) -> Self {
        Self { args, _marker: PhantomData }
    }

    fn can_implement(args: &Self::Arguments, problem: &ProblemShape) -> Result<(), EpilogueError> {
        match &args.ptr {
            Some(buffer) => buffer.check_extent("scalar reduction", &args.stride, problem),
            None => Ok(()),
        }
    }

    fn begin_tile(&self, _tile: &TileContext) -> Cmp {
        Red::identity()
    }

    fn apply(&self, partial: &mut Cmp, _tile: &TileContext, sub: &Subtile, [input]: [Fragment<Cmp>; 1]) -> Fragment<Cmp> {
        if self.args.ptr.is_some() {
            for r in 0..sub.valid_rows() {
                for &v in &input.row(r)[..sub.valid_cols()] {
                    *partial = Red::reduce(*partial, v);
                }
            }
        }
        input
    }

    fn end_tile(&self, partial: Cmp, tile: &TileContext) {
        if let Some(ptr) = &self.args.ptr {
            let index = self.args.stride.offset(0, 0, tile.coord.l);
            merge::<E, Atom>(ptr, index, partial.into_f64(), R::STYLE);
        }
    }
}

/// Reduces across one axis, producing a per-row or per-column vector.
///
/// `PerRow` folds each row across columns into an `M`-vector; `PerCol` folds each column
/// across rows into an `N`-vector.
pub struct VectorReduction<Ax, Red, Atom, Cta, E: Element, Cmp, R> {
    args: ReductionArgs<E>,
    _marker: PhantomData<(Ax, Red, Atom, Cta, Cmp, R)>,
}

impl<Ax, Red, Atom, Cta, E, Cmp, R> NodeOp<1> for VectorReduction<Ax, Red, Atom, Cta, E, Cmp, R>
where
    Ax: VectorAxis,
    Red: ReduceFn,
    Atom: AtomicFn,
    Cta: TileShape,
    E: Element,
    Cmp: ComputeElement,
    R: Rounding,
{
    type Arguments = ReductionArgs<E>;
    type Input = Cmp;
    type Output = Cmp;
    type TileState = Vec<Cmp>;

    fn new(args: Self::Arguments) -> Self {
        Self { args, _marker: PhantomData }
    }

    fn can_implement(args: &Self::Arguments, problem: &ProblemShape) -> Result<(), EpilogueError> {
        match &args.ptr {
            Some(buffer) => buffer.check_extent("vector reduction", &args.stride, problem),
            None => Ok(()),
        }
    }

    fn begin_tile(&self, tile: &TileContext) -> Vec<Cmp> {
        debug_assert_eq!(tile.cta, [Cta::M, Cta::N], "tile shape differs from the node's CTA tile");
        vec![Red::identity(); Ax::tile_extent::<Cta>()]
    }

    fn apply(&self, partial: &mut Vec<Cmp>, tile: &TileContext, sub: &Subtile, [input]: [Fragment<Cmp>; 1]) -> Fragment<Cmp> {
        if self.args.ptr.is_some() {
            let base = Ax::subtile_origin(tile, sub);
            for r in 0..sub.valid_rows() {
                for c in 0..sub.valid_cols() {
                    let slot = &mut partial[base + Ax::select(r, c)];
                    *slot = Red::reduce(*slot, input.get(r, c));
                }
            }
        }
        input
    }

    fn end_tile(&self, partial: Vec<Cmp>, tile: &TileContext) {
        let Some(ptr) = &self.args.ptr else {
            return;
        };
        let origin = Ax::tile_origin(tile);
        let limit = Ax::problem_extent(&tile.problem);
        for (i, value) in partial.into_iter().enumerate() {
            let index = origin + i;
            if index >= limit {
                break;
            }
            let offset = Ax::offset(&self.args.stride, index, tile.coord.l);
            merge::<E, Atom>(ptr, offset, value.into_f64(), R::STYLE);
        }
    }
}
