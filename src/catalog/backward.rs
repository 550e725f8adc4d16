//! Backward pipelines: the gradient through an activation, and the bias gradient.
//!
//! The incoming gradient is the linear combination `alpha * acc + beta * C`; the
//! pre-activation values saved by the forward pass are read back from the aux tensor.

use std::marker::PhantomData;

use crate::catalog::linear::{lincomb_nested, LinCombNested, LinCombTree};
use crate::catalog::one;
use crate::core::element::{ComputeElement, Element, NumericKind, RoundNearest, Rounding};
use crate::core::memory::DeviceBuffer;
use crate::core::shape::{Stride, TileShape};
use crate::nodes::aux::{AuxLoad, AuxLoadArgs, LayoutTag};
use crate::nodes::broadcast::{PerRow, ScalarArgs, ScalarBroadcast};
use crate::nodes::compute::Compute;
use crate::nodes::reduction::{ReductionArgs, VectorReduction};
use crate::policy::dispatch::FusionCallbacks;
use crate::policy::epilogue::TmaWarpSpecialized;
use crate::semantic::functor::{AtomicAdd, Functor, Identity, ReducePlus};
use crate::semantic::tree::Tree;
use crate::semantic::visitor::Visitor;

/// `D = d_activation(alpha * acc + beta * C, aux)`
pub struct LinCombDeEltAct<L, DAct, Out, Cmp = f32, Aux = Out, Src = Out, Scalar = Cmp, R = RoundNearest>(
    PhantomData<(L, DAct, Out, Cmp, Aux, Src, Scalar, R)>,
);

/// As [`LinCombDeEltAct`], and the row sums of the result are accumulated into `dbias`.
#[allow(clippy::type_complexity)]
pub struct LinCombDeEltActDePerRowBias<
    L,
    DAct,
    Out,
    Cmp = f32,
    Aux = Out,
    Bias = Out,
    Src = Out,
    Scalar = Cmp,
    R = RoundNearest,
>(PhantomData<(L, DAct, Out, Cmp, Aux, Bias, Src, Scalar, R)>);

pub type DeEltActTree<const STAGES: usize, L, DAct, Out, Cmp, Aux, Src, Scalar, R> = Tree<
    Compute<DAct, Out, Cmp, R, 2>,
    (LinCombTree<Cmp, Cmp, Src, R, ScalarBroadcast<Scalar>>, AuxLoad<STAGES, Aux, L>),
>;

pub type DeEltActDePerRowBiasTree<const STAGES: usize, Cta, L, DAct, Out, Cmp, Aux, Bias, Src, Scalar, R> = Tree<
    Compute<Identity, Out, Cmp, R, 1>,
    (
        Tree<
            VectorReduction<PerRow, ReducePlus, AtomicAdd, Cta, Bias, Cmp, R>,
            (DeEltActTree<STAGES, L, DAct, Cmp, Cmp, Aux, Src, Scalar, R>,),
        >,
    ),
>;

pub type DeEltActNested<S, X, A> = (LinCombNested<ScalarArgs<S>>, AuxLoadArgs<X>, A);

#[derive(Debug, Clone)]
pub struct DeEltActArgs<S: Element, X: Element, A> {
    pub alpha: S,
    pub beta: S,
    pub alpha_ptr: Option<DeviceBuffer<S>>,
    pub beta_ptr: Option<DeviceBuffer<S>>,
    pub d_alpha: Stride,
    pub d_beta: Stride,
    pub activation: A,
    /// Pre-activation values from the forward pass.
    pub aux_ptr: Option<DeviceBuffer<X>>,
    pub d_aux: Option<Stride>,
}

impl<S: Element, X: Element, A: Default> Default for DeEltActArgs<S, X, A> {
    fn default() -> Self {
        Self {
            alpha: one(),
            beta: S::default(),
            alpha_ptr: None,
            beta_ptr: None,
            d_alpha: Stride::broadcast(),
            d_beta: Stride::broadcast(),
            activation: A::default(),
            aux_ptr: None,
            d_aux: None,
        }
    }
}

impl<S: Element, X: Element, A: Clone> DeEltActArgs<S, X, A> {
    pub fn lower(&self) -> DeEltActNested<S, X, A> {
        (
            lincomb_nested(
                ScalarArgs::single(self.beta, self.beta_ptr.clone(), self.d_beta),
                ScalarArgs::single(self.alpha, self.alpha_ptr.clone(), self.d_alpha),
            ),
            AuxLoadArgs::new(self.aux_ptr.clone(), X::default(), self.d_aux),
            self.activation.clone(),
        )
    }
}

#[derive(Debug, Clone)]
pub struct DeEltActDeBiasArgs<S: Element, X: Element, B: Element, A> {
    pub alpha: S,
    pub beta: S,
    pub alpha_ptr: Option<DeviceBuffer<S>>,
    pub beta_ptr: Option<DeviceBuffer<S>>,
    pub d_alpha: Stride,
    pub d_beta: Stride,
    pub activation: A,
    pub aux_ptr: Option<DeviceBuffer<X>>,
    pub d_aux: Option<Stride>,
    /// Bias gradient, one value per row. Must hold zero before the launch.
    pub dbias_ptr: Option<DeviceBuffer<B>>,
    pub d_dbias: Stride,
}

impl<S: Element, X: Element, B: Element, A: Default> Default for DeEltActDeBiasArgs<S, X, B, A> {
    fn default() -> Self {
        Self {
            alpha: one(),
            beta: S::default(),
            alpha_ptr: None,
            beta_ptr: None,
            d_alpha: Stride::broadcast(),
            d_beta: Stride::broadcast(),
            activation: A::default(),
            aux_ptr: None,
            d_aux: None,
            dbias_ptr: None,
            d_dbias: Stride::per_row(0),
        }
    }
}

impl<S: Element, X: Element, B: Element, A: Clone> DeEltActDeBiasArgs<S, X, B, A> {
    pub fn lower(&self) -> ((DeEltActNested<S, X, A>, ReductionArgs<B>), ()) {
        let de_act = DeEltActArgs {
            alpha: self.alpha,
            beta: self.beta,
            alpha_ptr: self.alpha_ptr.clone(),
            beta_ptr: self.beta_ptr.clone(),
            d_alpha: self.d_alpha,
            d_beta: self.d_beta,
            activation: self.activation.clone(),
            aux_ptr: self.aux_ptr.clone(),
            d_aux: self.d_aux,
        };
        ((de_act.lower(), ReductionArgs::new(self.dbias_ptr.clone(), self.d_dbias)), ())
    }
}

impl<
        const SC: usize,
        const SD: usize,
        const FRAG: usize,
        const REUSE: bool,
        const DELAY: bool,
        Cta,
        Epi,
        L,
        DAct,
        Out,
        Cmp,
        Aux,
        Src,
        Scalar,
        R,
    > FusionCallbacks<TmaWarpSpecialized<SC, SD, FRAG, REUSE, DELAY>, Cta, Epi>
    for LinCombDeEltAct<L, DAct, Out, Cmp, Aux, Src, Scalar, R>
where
    L: LayoutTag,
    DAct: Functor<2>,
    Out: Element,
    Cmp: ComputeElement,
    Aux: Element,
    Src: Element,
    Scalar: Element,
    R: Rounding,
{
    type Impl = DeEltActTree<SC, L, DAct, Out, Cmp, Aux, Src, Scalar, R>;
    type Arguments = DeEltActArgs<Scalar, Aux, DAct::Arguments>;

    const AUX_KIND: Option<NumericKind> = Some(Aux::KIND);

    fn lower(args: &Self::Arguments) -> <Self::Impl as Visitor>::Arguments {
        args.lower()
    }
}

impl<
        const SC: usize,
        const SD: usize,
        const FRAG: usize,
        const REUSE: bool,
        const DELAY: bool,
        Cta,
        Epi,
        L,
        DAct,
        Out,
        Cmp,
        Aux,
        Bias,
        Src,
        Scalar,
        R,
    > FusionCallbacks<TmaWarpSpecialized<SC, SD, FRAG, REUSE, DELAY>, Cta, Epi>
    for LinCombDeEltActDePerRowBias<L, DAct, Out, Cmp, Aux, Bias, Src, Scalar, R>
where
    Cta: TileShape,
    L: LayoutTag,
    DAct: Functor<2>,
    Out: Element,
    Cmp: ComputeElement,
    Aux: Element,
    Bias: Element,
    Src: Element,
    Scalar: Element,
    R: Rounding,
{
    type Impl = DeEltActDePerRowBiasTree<SC, Cta, L, DAct, Out, Cmp, Aux, Bias, Src, Scalar, R>;
    type Arguments = DeEltActDeBiasArgs<Scalar, Aux, Bias, DAct::Arguments>;

    const AUX_KIND: Option<NumericKind> = Some(Aux::KIND);

    fn lower(args: &Self::Arguments) -> <Self::Impl as Visitor>::Arguments {
        args.lower()
    }
}
