use std::marker::PhantomData;

use crate::core::element::{ComputeElement, Element, Rounding};
use crate::core::shape::{Subtile, TileContext};
use crate::semantic::fragment::Fragment;
use crate::semantic::functor::Functor;
use crate::semantic::visitor::NodeOp;

/// Pointwise `F` over `N` child fragments. Inputs arrive in `Cmp`, the result is rounded to
/// `Out` with `R`.
pub struct Compute<F, Out, Cmp, R, const N: usize>
where
    F: Functor<N>,
{
    args: F::Arguments,
    _marker: PhantomData<(F, Out, Cmp, R)>,
}

impl<F, Out, Cmp, R, const N: usize> Compute<F, Out, Cmp, R, N>
where
    F: Functor<N>,
{
    pub fn arguments(&self) -> &F::Arguments {
        &self.args
    }
}

impl<F, Out, Cmp, R, const N: usize> NodeOp<N> for Compute<F, Out, Cmp, R, N>
where
    F: Functor<N>,
    Out: Element,
    Cmp: ComputeElement,
    R: Rounding,
{
    type Arguments = F::Arguments;
    type Input = Cmp;
    type Output = Out;
    type TileState = ();

    fn new(args: Self::Arguments) -> Self {
        Self { args, _marker: PhantomData }
    }

    fn begin_tile(&self, _tile: &TileContext) {}

    fn apply(&self, _state: &mut (), _tile: &TileContext, sub: &Subtile, inputs: [Fragment<Cmp>; N]) -> Fragment<Out> {
        let values: [&[Cmp]; N] = std::array::from_fn(|k| inputs[k].as_slice());
        let data = (0..sub.rows * sub.cols)
            .map(|i| {
                let operands: [Cmp; N] = std::array::from_fn(|k| values[k][i]);
                F::apply(&self.args, operands).convert::<Out>(R::STYLE)
            })
            .collect();
        Fragment::from_vec(sub.rows, sub.cols, data)
    }
}
