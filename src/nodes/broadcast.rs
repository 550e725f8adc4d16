//! Broadcast leaves: scalars and per-row / per-column vectors replicated across a fragment.

use std::marker::PhantomData;

use crate::core::element::{Element, RoundStyle};
use crate::core::error::EpilogueError;
use crate::core::memory::DeviceBuffer;
use crate::core::shape::{ProblemShape, Stride, Subtile, TileContext, TileShape};
use crate::semantic::fragment::Fragment;
use crate::semantic::visitor::{VisitInputs, Visitor};

/// Arguments of a [`ScalarBroadcast`]. With `COUNT > 1` the broadcast value is the product of
/// all entries; each entry comes from its pointer (indexed by batch through its stride) when
/// set, otherwise from the inline scalar.
#[derive(Debug, Clone)]
pub struct ScalarArgs<E: Element, const COUNT: usize = 1> {
    pub scalars: [E; COUNT],
    pub scalar_ptrs: [Option<DeviceBuffer<E>>; COUNT],
    pub strides: [Stride; COUNT],
}

impl<E: Element, const COUNT: usize> Default for ScalarArgs<E, COUNT> {
    fn default() -> Self {
        Self {
            scalars: [E::from_f64_rounded(1.0, RoundStyle::ToNearest); COUNT],
            scalar_ptrs: std::array::from_fn(|_| None),
            strides: [Stride::broadcast(); COUNT],
        }
    }
}

impl<E: Element> ScalarArgs<E, 1> {
    pub fn single(scalar: E, ptr: Option<DeviceBuffer<E>>, stride: Stride) -> Self {
        Self { scalars: [scalar], scalar_ptrs: [ptr], strides: [stride] }
    }
}

impl<E: Element, const COUNT: usize> ScalarArgs<E, COUNT> {
    pub fn new(scalars: [E; COUNT], scalar_ptrs: [Option<DeviceBuffer<E>>; COUNT], strides: [Stride; COUNT]) -> Self {
        Self { scalars, scalar_ptrs, strides }
    }
}

fn check_scalar_ptrs<E: Element>(
    ptrs: &[Option<DeviceBuffer<E>>],
    strides: &[Stride],
    problem: &ProblemShape,
) -> Result<(), EpilogueError> {
    for (ptr, stride) in ptrs.iter().zip(strides) {
        if let Some(buffer) = ptr {
            let required = (problem.l.saturating_sub(1) as i64 * stride.l) as usize + 1;
            if buffer.len() < required {
                return Err(EpilogueError::BufferTooSmall { tensor: "scalar", required, actual: buffer.len() });
            }
        }
    }
    Ok(())
}

/// Product of the resolved entries, rounded to `E` after every step.
fn fold_scalars<E: Element>(mut entry: impl FnMut(usize) -> E, count: usize) -> E {
    let mut value = entry(0);
    for i in 1..count {
        value = E::from_f64_rounded(value.into_f64() * entry(i).into_f64(), RoundStyle::ToNearest);
    }
    value
}

pub struct ScalarBroadcast<E: Element, const COUNT: usize = 1> {
    args: ScalarArgs<E, COUNT>,
}

impl<E: Element, const COUNT: usize> ScalarBroadcast<E, COUNT> {
    pub fn value_for_batch(&self, l: usize) -> E {
        fold_scalars(
            |i| match &self.args.scalar_ptrs[i] {
                Some(ptr) => ptr.load(self.args.strides[i].offset(0, 0, l)),
                None => self.args.scalars[i],
            },
            COUNT,
        )
    }
}

impl<E: Element, const COUNT: usize> Visitor for ScalarBroadcast<E, COUNT> {
    type Arguments = ScalarArgs<E, COUNT>;
    type Output = E;
    type TileState = E;

    fn new(args: Self::Arguments) -> Self {
        Self { args }
    }

    fn can_implement(args: &Self::Arguments, problem: &ProblemShape) -> Result<(), EpilogueError> {
        check_scalar_ptrs(&args.scalar_ptrs, &args.strides, problem)
    }

    fn begin_tile(&self, tile: &TileContext) -> E {
        self.value_for_batch(tile.coord.l)
    }

    fn visit(&self, value: &mut E, _tile: &TileContext, sub: &Subtile, _inputs: &VisitInputs<'_>) -> Fragment<E> {
        Fragment::filled(sub.rows, sub.cols, *value)
    }
}

/// [`ScalarArgs`] plus one pointer per batch for grouped and pointer-array GEMMs.
#[derive(Debug, Clone)]
pub struct ScalarPtrArrayArgs<E: Element, const COUNT: usize = 1> {
    pub scalars: [E; COUNT],
    pub scalar_ptrs: [Option<DeviceBuffer<E>>; COUNT],
    pub scalar_ptr_arrays: [Option<Vec<DeviceBuffer<E>>>; COUNT],
    pub strides: [Stride; COUNT],
}

impl<E: Element, const COUNT: usize> Default for ScalarPtrArrayArgs<E, COUNT> {
    fn default() -> Self {
        Self {
            scalars: [E::from_f64_rounded(1.0, RoundStyle::ToNearest); COUNT],
            scalar_ptrs: std::array::from_fn(|_| None),
            scalar_ptr_arrays: std::array::from_fn(|_| None),
            strides: [Stride::broadcast(); COUNT],
        }
    }
}

impl<E: Element> ScalarPtrArrayArgs<E, 1> {
    pub fn single(
        scalar: E,
        ptr: Option<DeviceBuffer<E>>,
        ptr_array: Option<Vec<DeviceBuffer<E>>>,
        stride: Stride,
    ) -> Self {
        Self { scalars: [scalar], scalar_ptrs: [ptr], scalar_ptr_arrays: [ptr_array], strides: [stride] }
    }
}

/// Scalar broadcast where each batch may read its scalar through its own pointer.
///
/// Resolution order per entry: strided pointer, then the batch's pointer-array entry, then
/// the inline scalar.
pub struct ScalarBroadcastPtrArray<E: Element, const COUNT: usize = 1> {
    args: ScalarPtrArrayArgs<E, COUNT>,
}

impl<E: Element, const COUNT: usize> ScalarBroadcastPtrArray<E, COUNT> {
    pub fn value_for_batch(&self, l: usize) -> E {
        fold_scalars(
            |i| {
                if let Some(ptr) = &self.args.scalar_ptrs[i] {
                    ptr.load(self.args.strides[i].offset(0, 0, l))
                } else if let Some(array) = &self.args.scalar_ptr_arrays[i] {
                    array[l].load(0)
                } else {
                    self.args.scalars[i]
                }
            },
            COUNT,
        )
    }
}

impl<E: Element, const COUNT: usize> Visitor for ScalarBroadcastPtrArray<E, COUNT> {
    type Arguments = ScalarPtrArrayArgs<E, COUNT>;
    type Output = E;
    type TileState = E;

    fn new(args: Self::Arguments) -> Self {
        Self { args }
    }

    fn can_implement(args: &Self::Arguments, problem: &ProblemShape) -> Result<(), EpilogueError> {
        check_scalar_ptrs(&args.scalar_ptrs, &args.strides, problem)?;
        for array in args.scalar_ptr_arrays.iter().flatten() {
            if array.len() < problem.l {
                return Err(EpilogueError::BufferTooSmall {
                    tensor: "scalar_ptr_array",
                    required: problem.l,
                    actual: array.len(),
                });
            }
            if array.iter().any(|ptr| ptr.is_empty()) {
                return Err(EpilogueError::MissingTensor("scalar_ptr_array entry"));
            }
        }
        Ok(())
    }

    fn begin_tile(&self, tile: &TileContext) -> E {
        self.value_for_batch(tile.coord.l)
    }

    fn visit(&self, value: &mut E, _tile: &TileContext, sub: &Subtile, _inputs: &VisitInputs<'_>) -> Fragment<E> {
        Fragment::filled(sub.rows, sub.cols, *value)
    }
}

/// The axis a vector runs along: one value per row or one value per column.
pub trait VectorAxis: Send + Sync + 'static {
    const NAME: &'static str;

    /// Packed vector stride with the given batch stride.
    fn vector_stride(batch: i64) -> Stride;
    fn tile_extent<T: TileShape>() -> usize;
    fn problem_extent(problem: &ProblemShape) -> usize;
    /// Global index of the tile's first element along the axis.
    fn tile_origin(tile: &TileContext) -> usize;
    /// Offset of a subtile's first element from the tile origin.
    fn subtile_origin(tile: &TileContext, sub: &Subtile) -> usize;
    /// Fragment coordinate along the axis.
    fn select(r: usize, c: usize) -> usize;
    fn offset(stride: &Stride, index: usize, l: usize) -> usize;
}

/// One value per row (an `M`-vector), constant across columns.
pub struct PerRow;
/// One value per column (an `N`-vector), constant across rows.
pub struct PerCol;

impl VectorAxis for PerRow {
    const NAME: &'static str = "row";

    fn vector_stride(batch: i64) -> Stride {
        Stride::per_row(batch)
    }
    fn tile_extent<T: TileShape>() -> usize {
        T::M
    }
    fn problem_extent(problem: &ProblemShape) -> usize {
        problem.m
    }
    fn tile_origin(tile: &TileContext) -> usize {
        tile.row_origin()
    }
    fn subtile_origin(tile: &TileContext, sub: &Subtile) -> usize {
        sub.epi_m * tile.epi[0]
    }
    #[inline]
    fn select(r: usize, _c: usize) -> usize {
        r
    }
    fn offset(stride: &Stride, index: usize, l: usize) -> usize {
        stride.offset(index, 0, l)
    }
}

impl VectorAxis for PerCol {
    const NAME: &'static str = "column";

    fn vector_stride(batch: i64) -> Stride {
        Stride::per_col(batch)
    }
    fn tile_extent<T: TileShape>() -> usize {
        T::N
    }
    fn problem_extent(problem: &ProblemShape) -> usize {
        problem.n
    }
    fn tile_origin(tile: &TileContext) -> usize {
        tile.col_origin()
    }
    fn subtile_origin(tile: &TileContext, sub: &Subtile) -> usize {
        sub.epi_n * tile.epi[1]
    }
    #[inline]
    fn select(_r: usize, c: usize) -> usize {
        c
    }
    fn offset(stride: &Stride, index: usize, l: usize) -> usize {
        stride.offset(0, index, l)
    }
}

/// Arguments of a vector broadcast. Without a pointer every element reads `null_default`.
/// A zero stride on the vector axis turns the pointer into a per-batch scalar.
#[derive(Debug, Clone, Default)]
pub struct VectorArgs<E: Element> {
    pub ptr: Option<DeviceBuffer<E>>,
    pub null_default: E,
    pub stride: Stride,
}

impl<E: Element> VectorArgs<E> {
    pub fn new(ptr: Option<DeviceBuffer<E>>, null_default: E, stride: Stride) -> Self {
        Self { ptr, null_default, stride }
    }
}

/// Broadcasts a per-row or per-column vector across the fragment.
///
/// The CTA tile's slice of the vector is staged once in `begin_tile`; subtiles read from the
/// staged copy.
pub struct VectorBroadcast<Ax, Cta, E: Element> {
    args: VectorArgs<E>,
    _marker: PhantomData<(Ax, Cta)>,
}

pub type RowVectorBroadcast<Cta, E> = VectorBroadcast<PerRow, Cta, E>;
pub type ColVectorBroadcast<Cta, E> = VectorBroadcast<PerCol, Cta, E>;

impl<Ax, Cta, E> Visitor for VectorBroadcast<Ax, Cta, E>
where
    Ax: VectorAxis,
    Cta: TileShape,
    E: Element,
{
    type Arguments = VectorArgs<E>;
    type Output = E;
    type TileState = Vec<E>;

    fn new(args: Self::Arguments) -> Self {
        Self { args, _marker: PhantomData }
    }

    fn can_implement(args: &Self::Arguments, problem: &ProblemShape) -> Result<(), EpilogueError> {
        match &args.ptr {
            Some(buffer) => buffer.check_extent("broadcast vector", &args.stride, problem),
            None => Ok(()),
        }
    }

    fn begin_tile(&self, tile: &TileContext) -> Vec<E> {
        debug_assert_eq!(tile.cta, [Cta::M, Cta::N], "tile shape differs from the node's CTA tile");
        let extent = Ax::tile_extent::<Cta>();
        let origin = Ax::tile_origin(tile);
        let limit = Ax::problem_extent(&tile.problem);
        match &self.args.ptr {
            None => vec![self.args.null_default; extent],
            Some(ptr) => (0..extent)
                .map(|i| {
                    let index = origin + i;
                    if index < limit {
                        ptr.load(Ax::offset(&self.args.stride, index, tile.coord.l))
                    } else {
                        E::default()
                    }
                })
                .collect(),
        }
    }

    fn visit(&self, staged: &mut Vec<E>, tile: &TileContext, sub: &Subtile, _inputs: &VisitInputs<'_>) -> Fragment<E> {
        let base = Ax::subtile_origin(tile, sub);
        Fragment::from_fn(sub.rows, sub.cols, |r, c| {
            staged.get(base + Ax::select(r, c)).copied().unwrap_or_default()
        })
    }
}
