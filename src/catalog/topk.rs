use std::marker::PhantomData;

use crate::catalog::linear::{lincomb_nested, LinCombNested, LinCombTree};
use crate::catalog::one;
use crate::core::element::{ComputeElement, Element, RoundNearest, Rounding};
use crate::core::memory::DeviceBuffer;
use crate::core::shape::{Stride, TileShape};
use crate::nodes::broadcast::{ScalarArgs, ScalarBroadcast};
use crate::nodes::topk::TopKSoftmaxCol;
use crate::policy::dispatch::FusionCallbacks;
use crate::policy::epilogue::TmaWarpSpecialized;
use crate::semantic::tree::Tree;
use crate::semantic::visitor::Visitor;

/// `D = softmax(top_k(alpha * acc + beta * C))` per row, zero outside the top `K`.
pub struct LinCombTopKSoftmaxCol<const K: usize, Out, Cmp = f32, Src = Out, Scalar = Cmp, R = RoundNearest>(
    PhantomData<(Out, Cmp, Src, Scalar, R)>,
);

pub type LinCombTopKSoftmaxColTree<const K: usize, Epi, Out, Cmp, Src, Scalar, R> =
    Tree<TopKSoftmaxCol<K, Epi, Out, Cmp, R>, (LinCombTree<Cmp, Cmp, Src, R, ScalarBroadcast<Scalar>>,)>;

#[derive(Debug, Clone)]
pub struct TopKArgs<S: Element> {
    pub alpha: S,
    pub beta: S,
    pub alpha_ptr: Option<DeviceBuffer<S>>,
    pub beta_ptr: Option<DeviceBuffer<S>>,
}

impl<S: Element> Default for TopKArgs<S> {
    fn default() -> Self {
        Self { alpha: one(), beta: S::default(), alpha_ptr: None, beta_ptr: None }
    }
}

impl<S: Element> TopKArgs<S> {
    pub fn lower(&self) -> (LinCombNested<ScalarArgs<S>>, ()) {
        let broadcast = Stride::broadcast();
        (
            lincomb_nested(
                ScalarArgs::single(self.beta, self.beta_ptr.clone(), broadcast),
                ScalarArgs::single(self.alpha, self.alpha_ptr.clone(), broadcast),
            ),
            (),
        )
    }
}

impl<const SC: usize, const SD: usize, const FRAG: usize, const REUSE: bool, const DELAY: bool, const K: usize, Cta, Epi, Out, Cmp, Src, Scalar, R>
    FusionCallbacks<TmaWarpSpecialized<SC, SD, FRAG, REUSE, DELAY>, Cta, Epi>
    for LinCombTopKSoftmaxCol<K, Out, Cmp, Src, Scalar, R>
where
    Epi: TileShape,
    Out: Element,
    Cmp: ComputeElement,
    Src: Element,
    Scalar: Element,
    R: Rounding,
{
    type Impl = LinCombTopKSoftmaxColTree<K, Epi, Out, Cmp, Src, Scalar, R>;
    type Arguments = TopKArgs<Scalar>;

    fn lower(args: &Self::Arguments) -> <Self::Impl as Visitor>::Arguments {
        args.lower()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_read_accumulator_only() {
        let ((beta, (), (alpha, (), ()), ()), ()) = TopKArgs::<f32>::default().lower();
        assert_eq!(alpha.scalars, [1.0]);
        assert_eq!(beta.scalars, [0.0]);
        assert!(alpha.scalar_ptrs[0].is_none());
    }

    #[test]
    fn test_scalar_pointers_broadcast_across_batches() {
        let args = TopKArgs { alpha_ptr: Some(DeviceBuffer::from_slice(&[2.0f32])), ..Default::default() };
        let ((beta, (), (alpha, (), ()), ()), ()) = args.lower();
        assert!(alpha.scalar_ptrs[0].is_some());
        assert_eq!(alpha.strides[0], Stride::broadcast());
        assert_eq!(beta.strides[0], Stride::broadcast());
    }
}
