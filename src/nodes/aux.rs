//! Auxiliary tensor load and store through a staging ring.
//!
//! Both nodes move whole subtiles. The ring holds `STAGES` subtiles: loads are issued
//! `STAGES` subtiles ahead of their consumer, and a staged store is written back only when its
//! slot is reused or the tile ends.

use std::collections::VecDeque;
use std::marker::PhantomData;

use crate::core::element::{ComputeElement, Element, Rounding};
use crate::core::error::EpilogueError;
use crate::core::memory::{check_alignment, DeviceBuffer};
use crate::core::shape::{ProblemShape, Stride, Subtile, TileContext};
use crate::semantic::fragment::Fragment;
use crate::semantic::visitor::{NodeOp, VisitInputs, Visitor};

/// Memory order of an auxiliary tensor, used when no explicit stride is given.
pub trait LayoutTag: Send + Sync + 'static {
    fn packed(problem: &ProblemShape) -> Stride;
}

pub struct RowMajor;
pub struct ColumnMajor;

impl LayoutTag for RowMajor {
    fn packed(problem: &ProblemShape) -> Stride {
        Stride::packed_row_major(problem)
    }
}

impl LayoutTag for ColumnMajor {
    fn packed(problem: &ProblemShape) -> Stride {
        Stride::packed_col_major(problem)
    }
}

fn check_aux<E: Element>(
    name: &'static str,
    ptr: &Option<DeviceBuffer<E>>,
    stride: Stride,
    problem: &ProblemShape,
) -> Result<(), EpilogueError> {
    if let Some(buffer) = ptr {
        buffer.check_extent(name, &stride, problem)?;
        check_alignment::<E>(name, &stride, problem)?;
    }
    Ok(())
}

#[derive(Debug, Clone, Default)]
pub struct AuxLoadArgs<E: Element> {
    pub ptr: Option<DeviceBuffer<E>>,
    /// Value of every element when `ptr` is unset.
    pub null_default: E,
    /// `None` selects the packed stride of the layout tag.
    pub stride: Option<Stride>,
}

impl<E: Element> AuxLoadArgs<E> {
    pub fn new(ptr: Option<DeviceBuffer<E>>, null_default: E, stride: Option<Stride>) -> Self {
        Self { ptr, null_default, stride }
    }
}

pub struct AuxLoad<const STAGES: usize, E: Element, L> {
    args: AuxLoadArgs<E>,
    _marker: PhantomData<L>,
}

pub struct LoadRing<E> {
    stride: Stride,
    inflight: VecDeque<(usize, Fragment<E>)>,
    issued: usize,
}

impl<const STAGES: usize, E: Element, L: LayoutTag> AuxLoad<STAGES, E, L> {
    fn load_subtile(&self, ptr: &DeviceBuffer<E>, stride: &Stride, sub: &Subtile) -> Fragment<E> {
        Fragment::from_fn(sub.rows, sub.cols, |r, c| {
            if sub.is_valid(r, c) {
                ptr.load(stride.offset(sub.row0 + r, sub.col0 + c, sub.batch))
            } else {
                self.args.null_default
            }
        })
    }

    fn issue(&self, ring: &mut LoadRing<E>, tile: &TileContext) {
        let Some(ptr) = &self.args.ptr else {
            return;
        };
        while ring.issued < tile.subtile_count() && ring.inflight.len() < STAGES.max(1) {
            let sub = tile.subtile(ring.issued);
            ring.inflight.push_back((ring.issued, self.load_subtile(ptr, &ring.stride, &sub)));
            ring.issued += 1;
        }
    }
}

impl<const STAGES: usize, E: Element, L: LayoutTag> Visitor for AuxLoad<STAGES, E, L> {
    type Arguments = AuxLoadArgs<E>;
    type Output = E;
    type TileState = LoadRing<E>;

    fn new(args: Self::Arguments) -> Self {
        Self { args, _marker: PhantomData }
    }

    fn can_implement(args: &Self::Arguments, problem: &ProblemShape) -> Result<(), EpilogueError> {
        check_aux("aux load", &args.ptr, args.stride.unwrap_or_else(|| L::packed(problem)), problem)
    }

    fn begin_tile(&self, tile: &TileContext) -> LoadRing<E> {
        let stride = self.args.stride.unwrap_or_else(|| L::packed(&tile.problem));
        let mut ring = LoadRing { stride, inflight: VecDeque::with_capacity(STAGES.max(1)), issued: 0 };
        self.issue(&mut ring, tile);
        ring
    }

    fn visit(&self, ring: &mut LoadRing<E>, tile: &TileContext, sub: &Subtile, _inputs: &VisitInputs<'_>) -> Fragment<E> {
        let Some(ptr) = &self.args.ptr else {
            return Fragment::filled(sub.rows, sub.cols, self.args.null_default);
        };
        let fragment = match ring.inflight.pop_front() {
            Some((index, fragment)) if index == sub.index => fragment,
            _ => {
                // out-of-order visit: drop the prefetch window and restart after this subtile
                ring.inflight.clear();
                ring.issued = sub.index + 1;
                self.load_subtile(ptr, &ring.stride, sub)
            }
        };
        self.issue(ring, tile);
        fragment
    }
}

#[derive(Debug, Clone, Default)]
pub struct AuxStoreArgs<E: Element> {
    pub ptr: Option<DeviceBuffer<E>>,
    /// `None` selects the packed stride of the layout tag.
    pub stride: Option<Stride>,
    /// Multiplier applied to the stored copy only.
    pub scale: Option<f32>,
}

impl<E: Element> AuxStoreArgs<E> {
    pub fn new(ptr: Option<DeviceBuffer<E>>, stride: Option<Stride>) -> Self {
        Self { ptr, stride, scale: None }
    }
}

/// Stores its input to an auxiliary tensor and passes it through unchanged.
pub struct AuxStore<const STAGES: usize, E: Element, Cmp, R, L> {
    args: AuxStoreArgs<E>,
    _marker: PhantomData<(Cmp, R, L)>,
}

pub struct StoreRing<E> {
    stride: Stride,
    slots: Vec<Option<(Subtile, Vec<E>)>>,
}

impl<const STAGES: usize, E: Element, Cmp, R, L> AuxStore<STAGES, E, Cmp, R, L> {
    fn flush(&self, stride: &Stride, sub: &Subtile, staged: &[E]) {
        let Some(ptr) = &self.args.ptr else {
            return;
        };
        for r in 0..sub.valid_rows() {
            for c in 0..sub.valid_cols() {
                ptr.store(stride.offset(sub.row0 + r, sub.col0 + c, sub.batch), staged[r * sub.cols + c]);
            }
        }
    }
}

impl<const STAGES: usize, E, Cmp, R, L> NodeOp<1> for AuxStore<STAGES, E, Cmp, R, L>
where
    E: Element,
    Cmp: ComputeElement,
    R: Rounding,
    L: LayoutTag,
{
    type Arguments = AuxStoreArgs<E>;
    type Input = Cmp;
    type Output = Cmp;
    type TileState = StoreRing<E>;

    fn new(args: Self::Arguments) -> Self {
        Self { args, _marker: PhantomData }
    }

    fn can_implement(args: &Self::Arguments, problem: &ProblemShape) -> Result<(), EpilogueError> {
        check_aux("aux store", &args.ptr, args.stride.unwrap_or_else(|| L::packed(problem)), problem)
    }

    fn begin_tile(&self, tile: &TileContext) -> StoreRing<E> {
        StoreRing {
            stride: self.args.stride.unwrap_or_else(|| L::packed(&tile.problem)),
            slots: (0..STAGES.max(1)).map(|_| None).collect(),
        }
    }

    fn apply(&self, ring: &mut StoreRing<E>, _tile: &TileContext, sub: &Subtile, [input]: [Fragment<Cmp>; 1]) -> Fragment<Cmp> {
        if self.args.ptr.is_none() {
            return input;
        }
        let slot = sub.index % ring.slots.len();
        if let Some((pending, staged)) = ring.slots[slot].take() {
            self.flush(&ring.stride, &pending, &staged);
        }
        let scale = self.args.scale.map(|s| s as f64);
        let staged = input
            .as_slice()
            .iter()
            .map(|&v| {
                let v = v.into_f64();
                E::from_f64_rounded(scale.map_or(v, |s| v * s), R::STYLE)
            })
            .collect();
        ring.slots[slot] = Some((*sub, staged));
        input
    }

    fn end_tile(&self, ring: StoreRing<E>, _tile: &TileContext) {
        let mut pending: Vec<(Subtile, Vec<E>)> = ring.slots.into_iter().flatten().collect();
        pending.sort_by_key(|(sub, _)| sub.index);
        for (sub, staged) in &pending {
            self.flush(&ring.stride, sub, staged);
        }
    }
}
