use std::marker::PhantomData;

use crate::core::element::{Element, RoundStyle};
use crate::core::shape::{Subtile, TileContext};
use crate::semantic::fragment::Fragment;
use crate::semantic::visitor::{VisitInputs, Visitor};

/// The accumulator fragment, unchanged.
pub struct AccFetch;

impl Visitor for AccFetch {
    type Arguments = ();
    type Output = f32;
    type TileState = ();

    fn new(_args: ()) -> Self {
        AccFetch
    }

    fn begin_tile(&self, _tile: &TileContext) {}

    fn visit(&self, _state: &mut (), _tile: &TileContext, _sub: &Subtile, inputs: &VisitInputs<'_>) -> Fragment<f32> {
        inputs.acc.clone()
    }
}

/// The source tensor C fragment, in its storage type.
pub struct SrcFetch<E>(PhantomData<E>);

impl<E: Element> Visitor for SrcFetch<E> {
    type Arguments = ();
    type Output = E;
    type TileState = ();

    fn new(_args: ()) -> Self {
        Self(PhantomData)
    }

    fn needs_source(&self) -> bool {
        true
    }

    fn begin_tile(&self, _tile: &TileContext) {}

    fn visit(&self, _state: &mut (), _tile: &TileContext, _sub: &Subtile, inputs: &VisitInputs<'_>) -> Fragment<E> {
        inputs.source.cast(RoundStyle::ToNearest)
    }
}

/// Accumulator fetch for grouped weight-gradient convolution.
///
/// A CTA tile covers `GROUPS` groups laid out along its diagonal: rows and columns are split
/// into `GROUPS` equal bands, and only products where the row band equals the column band
/// belong to one group. Cross-group elements are zeroed.
pub struct AccFetchGroupedWgrad<const GROUPS: usize>;

impl<const GROUPS: usize> Visitor for AccFetchGroupedWgrad<GROUPS> {
    type Arguments = ();
    type Output = f32;
    type TileState = ();

    fn new(_args: ()) -> Self {
        AccFetchGroupedWgrad
    }

    fn begin_tile(&self, _tile: &TileContext) {}

    fn visit(&self, _state: &mut (), tile: &TileContext, sub: &Subtile, inputs: &VisitInputs<'_>) -> Fragment<f32> {
        let band_m = (tile.cta[0] / GROUPS).max(1);
        let band_n = (tile.cta[1] / GROUPS).max(1);
        let local_m = sub.epi_m * tile.epi[0];
        let local_n = sub.epi_n * tile.epi[1];
        Fragment::from_fn(sub.rows, sub.cols, |r, c| {
            if (local_m + r) / band_m == (local_n + c) / band_n {
                inputs.acc.get(r, c)
            } else {
                0.0
            }
        })
    }
}
