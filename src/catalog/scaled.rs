//! Scaled low-precision pipelines.
//!
//! `Z = scale_a * scale_b * alpha * acc + scale_c * beta * C + bias`. The output scale
//! `scale_d` is applied only when D is stored as fp8; for wider outputs it is ignored.
//! The amax variants additionally record `max |act(Z)|` (when D is fp8) and an auxiliary
//! copy of Z. When the auxiliary tensor is fp8 the copy is scaled by `scale_aux`, its own
//! amax is recorded, and Z is shared between both consumers through a split tree.

use std::marker::PhantomData;

use crate::catalog::one;
use crate::core::element::{ComputeElement, Element, Narrow, NumericKind, RoundNearest, Rounding, StorageWidth, Wide};
use crate::core::memory::DeviceBuffer;
use crate::core::shape::{Stride, TileShape};
use crate::nodes::aux::{AuxStore, AuxStoreArgs, LayoutTag};
use crate::nodes::broadcast::{PerCol, PerRow, ScalarArgs, ScalarBroadcast, VectorArgs, VectorAxis, VectorBroadcast};
use crate::nodes::compute::Compute;
use crate::nodes::fetch::{AccFetch, SrcFetch};
use crate::nodes::reduction::{ReductionArgs, ScalarReduction};
use crate::policy::dispatch::FusionCallbacks;
use crate::policy::epilogue::TmaWarpSpecialized;
use crate::semantic::functor::{AtomicMaximum, First, Functor, Multiplies, MultiplyAdd, ReduceMaxAbs};
use crate::semantic::split::{SplitTree, SplitTreeArgs, SplitTreeFetch};
use crate::semantic::tree::Tree;
use crate::semantic::visitor::Visitor;

/// Output scaling functor selected by the storage width of D.
pub trait OutputScaling: StorageWidth {
    type ScaleOp: Functor<2, Arguments = ()>;
}

impl OutputScaling for Narrow {
    type ScaleOp = Multiplies;
}

impl OutputScaling for Wide {
    type ScaleOp = First;
}

pub type ScaleOut<Out> = <<Out as Element>::Width as OutputScaling>::ScaleOp;

/// `D = scale_d * activation(Z)`
pub struct ScaledLinCombBiasEltAct<Ax, Act, Out, Cmp = f32, Bias = Out, Src = Out, Scalar = Cmp, R = RoundNearest>(
    PhantomData<(Ax, Act, Out, Cmp, Bias, Src, Scalar, R)>,
);

pub type ScaledLinCombPerRowBiasEltAct<Act, Out, Cmp = f32, Bias = Out, Src = Out, Scalar = Cmp, R = RoundNearest> =
    ScaledLinCombBiasEltAct<PerRow, Act, Out, Cmp, Bias, Src, Scalar, R>;
pub type ScaledLinCombPerColBiasEltAct<Act, Out, Cmp = f32, Bias = Out, Src = Out, Scalar = Cmp, R = RoundNearest> =
    ScaledLinCombBiasEltAct<PerCol, Act, Out, Cmp, Bias, Src, Scalar, R>;

/// `D = scale_d * activation(Z)`, `Aux = scale_aux * Z`, with amax of both.
#[allow(clippy::type_complexity)]
pub struct ScaledLinCombBiasEltActAmaxAux<
    Ax,
    L,
    Act,
    Out,
    Cmp = f32,
    Aux = Out,
    Amax = Cmp,
    Bias = Out,
    Src = Out,
    Scalar = Cmp,
    R = RoundNearest,
>(PhantomData<(Ax, L, Act, Out, Cmp, Aux, Amax, Bias, Src, Scalar, R)>);

pub type ScaledLinCombPerRowBiasEltActAmaxAux<
    L,
    Act,
    Out,
    Cmp = f32,
    Aux = Out,
    Amax = Cmp,
    Bias = Out,
    Src = Out,
    Scalar = Cmp,
    R = RoundNearest,
> = ScaledLinCombBiasEltActAmaxAux<PerRow, L, Act, Out, Cmp, Aux, Amax, Bias, Src, Scalar, R>;
pub type ScaledLinCombPerColBiasEltActAmaxAux<
    L,
    Act,
    Out,
    Cmp = f32,
    Aux = Out,
    Amax = Cmp,
    Bias = Out,
    Src = Out,
    Scalar = Cmp,
    R = RoundNearest,
> = ScaledLinCombBiasEltActAmaxAux<PerCol, L, Act, Out, Cmp, Aux, Amax, Bias, Src, Scalar, R>;

/// `Z`: the beta leaf multiplies `{beta, scale_c}`, the alpha leaf `{alpha, scale_a, scale_b}`.
pub type ScaledLinCombBiasTree<Ax, Cta, Out, Cmp, Bias, Src, Scalar, R> = Tree<
    Compute<MultiplyAdd, Out, Cmp, R, 3>,
    (
        ScalarBroadcast<Scalar, 2>,
        SrcFetch<Src>,
        Tree<Compute<MultiplyAdd, Cmp, Cmp, R, 3>, (ScalarBroadcast<Scalar, 3>, AccFetch, VectorBroadcast<Ax, Cta, Bias>)>,
    ),
>;

pub type ScaledLinCombBiasEltActTree<Ax, Cta, Act, Out, Cmp, Bias, Src, Scalar, R> = Tree<
    Compute<ScaleOut<Out>, Out, Cmp, R, 2>,
    (
        Tree<Compute<Act, Cmp, Cmp, R, 1>, (ScaledLinCombBiasTree<Ax, Cta, Cmp, Cmp, Bias, Src, Scalar, R>,)>,
        ScalarBroadcast<Scalar>,
    ),
>;

pub type AmaxReduction<Amax, Cmp, R> = ScalarReduction<ReduceMaxAbs, AtomicMaximum, Amax, Cmp, R>;

/// D consumer of the fp8-aux split tree: `scale_d * amax_D(act(Z))`.
pub type AmaxOutputTree<Act, Out, Cmp, Amax, Scalar, R> = Tree<
    Compute<ScaleOut<Out>, Out, Cmp, R, 2>,
    (
        Tree<AmaxReduction<Amax, Cmp, R>, (Tree<Compute<Act, Cmp, Cmp, R, 1>, (SplitTreeFetch<Cmp>,)>,)>,
        ScalarBroadcast<Scalar>,
    ),
>;

/// Aux consumer of the fp8-aux split tree: `store(amax_aux(Z) * scale_aux)`.
pub type AmaxAuxStoreTree<const STAGES: usize, L, Cmp, Aux, Amax, Scalar, R> = Tree<
    AuxStore<STAGES, Aux, Cmp, R, L>,
    (
        Tree<
            Compute<Multiplies, Cmp, Cmp, R, 2>,
            (Tree<AmaxReduction<Amax, Cmp, R>, (SplitTreeFetch<Cmp>,)>, ScalarBroadcast<Scalar>),
        >,
    ),
>;

pub type Fp8AuxAmaxTree<const STAGES: usize, Ax, Cta, L, Act, Out, Cmp, Aux, Amax, Bias, Src, Scalar, R> = SplitTree<
    ScaledLinCombBiasTree<Ax, Cta, Cmp, Cmp, Bias, Src, Scalar, R>,
    AmaxAuxStoreTree<STAGES, L, Cmp, Aux, Amax, Scalar, R>,
    AmaxOutputTree<Act, Out, Cmp, Amax, Scalar, R>,
>;

/// Non-fp8 aux: the stored copy is unscaled and sits inline between Z and the activation.
pub type WideAuxAmaxTree<const STAGES: usize, Ax, Cta, L, Act, Out, Cmp, Aux, Amax, Bias, Src, Scalar, R> = Tree<
    Compute<ScaleOut<Out>, Out, Cmp, R, 2>,
    (
        Tree<
            AmaxReduction<Amax, Cmp, R>,
            (
                Tree<
                    Compute<Act, Cmp, Cmp, R, 1>,
                    (Tree<AuxStore<STAGES, Aux, Cmp, R, L>, (ScaledLinCombBiasTree<Ax, Cta, Cmp, Cmp, Bias, Src, Scalar, R>,)>,),
                >,
            ),
        >,
        ScalarBroadcast<Scalar>,
    ),
>;

/// Nested arguments of a [`ScaledLinCombBiasTree`].
pub type ScaledLinCombBiasNested<S, B> =
    (ScalarArgs<S, 2>, (), (ScalarArgs<S, 3>, (), VectorArgs<B>, ()), ());

#[derive(Debug, Clone)]
pub struct ScaledLinCombBiasEltActArgs<S: Element, B: Element, A> {
    pub alpha: S,
    pub beta: S,
    pub scale_a: S,
    pub scale_b: S,
    pub scale_c: S,
    pub scale_d: S,
    pub alpha_ptr: Option<DeviceBuffer<S>>,
    pub beta_ptr: Option<DeviceBuffer<S>>,
    pub scale_a_ptr: Option<DeviceBuffer<S>>,
    pub scale_b_ptr: Option<DeviceBuffer<S>>,
    pub scale_c_ptr: Option<DeviceBuffer<S>>,
    pub scale_d_ptr: Option<DeviceBuffer<S>>,
    pub d_alpha: Stride,
    pub d_beta: Stride,
    pub bias_ptr: Option<DeviceBuffer<B>>,
    pub d_bias: Option<Stride>,
    pub activation: A,
}

impl<S: Element, B: Element, A: Default> Default for ScaledLinCombBiasEltActArgs<S, B, A> {
    fn default() -> Self {
        Self {
            alpha: one(),
            beta: S::default(),
            scale_a: one(),
            scale_b: one(),
            scale_c: one(),
            scale_d: one(),
            alpha_ptr: None,
            beta_ptr: None,
            scale_a_ptr: None,
            scale_b_ptr: None,
            scale_c_ptr: None,
            scale_d_ptr: None,
            d_alpha: Stride::broadcast(),
            d_beta: Stride::broadcast(),
            bias_ptr: None,
            d_bias: None,
            activation: A::default(),
        }
    }
}

impl<S: Element, B: Element, A: Clone> ScaledLinCombBiasEltActArgs<S, B, A> {
    pub fn lower_z<Ax: VectorAxis>(&self) -> ScaledLinCombBiasNested<S, B> {
        let broadcast = Stride::broadcast();
        (
            ScalarArgs::new(
                [self.beta, self.scale_c],
                [self.beta_ptr.clone(), self.scale_c_ptr.clone()],
                [self.d_beta, broadcast],
            ),
            (),
            (
                ScalarArgs::new(
                    [self.alpha, self.scale_a, self.scale_b],
                    [self.alpha_ptr.clone(), self.scale_a_ptr.clone(), self.scale_b_ptr.clone()],
                    [self.d_alpha, broadcast, broadcast],
                ),
                (),
                VectorArgs::new(self.bias_ptr.clone(), B::default(), self.d_bias.unwrap_or(Ax::vector_stride(0))),
                (),
            ),
            (),
        )
    }

    pub fn scale_d_args(&self) -> ScalarArgs<S> {
        ScalarArgs::single(self.scale_d, self.scale_d_ptr.clone(), Stride::broadcast())
    }

    #[allow(clippy::type_complexity)]
    pub fn lower<Ax: VectorAxis>(&self) -> ((ScaledLinCombBiasNested<S, B>, A), ScalarArgs<S>, ()) {
        ((self.lower_z::<Ax>(), self.activation.clone()), self.scale_d_args(), ())
    }
}

#[derive(Debug, Clone)]
pub struct ScaledAmaxAuxArgs<S: Element, B: Element, X: Element, M: Element, A> {
    pub alpha: S,
    pub beta: S,
    pub scale_a: S,
    pub scale_b: S,
    pub scale_c: S,
    pub scale_d: S,
    pub scale_aux: S,
    pub alpha_ptr: Option<DeviceBuffer<S>>,
    pub beta_ptr: Option<DeviceBuffer<S>>,
    pub scale_a_ptr: Option<DeviceBuffer<S>>,
    pub scale_b_ptr: Option<DeviceBuffer<S>>,
    pub scale_c_ptr: Option<DeviceBuffer<S>>,
    pub scale_d_ptr: Option<DeviceBuffer<S>>,
    pub scale_aux_ptr: Option<DeviceBuffer<S>>,
    pub d_alpha: Stride,
    pub d_beta: Stride,
    pub bias_ptr: Option<DeviceBuffer<B>>,
    pub d_bias: Option<Stride>,
    pub activation: A,
    /// Written only when D is fp8. Must hold zero before the launch.
    pub amax_d_ptr: Option<DeviceBuffer<M>>,
    /// Written only when the aux tensor is fp8. Must hold zero before the launch.
    pub amax_aux_ptr: Option<DeviceBuffer<M>>,
    pub aux_ptr: Option<DeviceBuffer<X>>,
    pub d_aux: Option<Stride>,
}

impl<S: Element, B: Element, X: Element, M: Element, A: Default> Default for ScaledAmaxAuxArgs<S, B, X, M, A> {
    fn default() -> Self {
        Self {
            alpha: one(),
            beta: S::default(),
            scale_a: one(),
            scale_b: one(),
            scale_c: one(),
            scale_d: one(),
            scale_aux: one(),
            alpha_ptr: None,
            beta_ptr: None,
            scale_a_ptr: None,
            scale_b_ptr: None,
            scale_c_ptr: None,
            scale_d_ptr: None,
            scale_aux_ptr: None,
            d_alpha: Stride::broadcast(),
            d_beta: Stride::broadcast(),
            bias_ptr: None,
            d_bias: None,
            activation: A::default(),
            amax_d_ptr: None,
            amax_aux_ptr: None,
            aux_ptr: None,
            d_aux: None,
        }
    }
}

impl<S: Element, B: Element, X: Element, M: Element, A: Clone> ScaledAmaxAuxArgs<S, B, X, M, A> {
    /// The part shared with [`ScaledLinCombBiasEltActArgs`].
    pub fn scaled(&self) -> ScaledLinCombBiasEltActArgs<S, B, A> {
        ScaledLinCombBiasEltActArgs {
            alpha: self.alpha,
            beta: self.beta,
            scale_a: self.scale_a,
            scale_b: self.scale_b,
            scale_c: self.scale_c,
            scale_d: self.scale_d,
            alpha_ptr: self.alpha_ptr.clone(),
            beta_ptr: self.beta_ptr.clone(),
            scale_a_ptr: self.scale_a_ptr.clone(),
            scale_b_ptr: self.scale_b_ptr.clone(),
            scale_c_ptr: self.scale_c_ptr.clone(),
            scale_d_ptr: self.scale_d_ptr.clone(),
            d_alpha: self.d_alpha,
            d_beta: self.d_beta,
            bias_ptr: self.bias_ptr.clone(),
            d_bias: self.d_bias,
            activation: self.activation.clone(),
        }
    }

    fn amax_d_args<Out: Element>(&self) -> ReductionArgs<M> {
        let ptr = if Out::KIND.is_fp8() { self.amax_d_ptr.clone() } else { None };
        ReductionArgs::new(ptr, Stride::broadcast())
    }
}

/// Chooses the amax-aux tree shape from the storage width of the aux element.
pub trait AmaxAuxBranch<Tag, Args, const STAGES: usize, Cta> {
    type Impl: Visitor;

    fn lower(args: &Args) -> <Self::Impl as Visitor>::Arguments;
}

impl<const STAGES: usize, Cta, Ax, L, Act, Out, Cmp, Aux, Amax, Bias, Src, Scalar, R>
    AmaxAuxBranch<
        ScaledLinCombBiasEltActAmaxAux<Ax, L, Act, Out, Cmp, Aux, Amax, Bias, Src, Scalar, R>,
        ScaledAmaxAuxArgs<Scalar, Bias, Aux, Amax, Act::Arguments>,
        STAGES,
        Cta,
    > for Narrow
where
    Cta: TileShape,
    Ax: VectorAxis,
    L: LayoutTag,
    Act: Functor<1>,
    Out: Element,
    Out::Width: OutputScaling,
    Cmp: ComputeElement,
    Aux: Element,
    Amax: Element,
    Bias: Element,
    Src: Element,
    Scalar: Element,
    R: Rounding,
{
    type Impl = Fp8AuxAmaxTree<STAGES, Ax, Cta, L, Act, Out, Cmp, Aux, Amax, Bias, Src, Scalar, R>;

    fn lower(
        args: &ScaledAmaxAuxArgs<Scalar, Bias, Aux, Amax, Act::Arguments>,
    ) -> <Self::Impl as Visitor>::Arguments {
        let scaled = args.scaled();
        let amax_aux = ReductionArgs::new(args.amax_aux_ptr.clone(), Stride::broadcast());
        let scale_aux = ScalarArgs::single(args.scale_aux, args.scale_aux_ptr.clone(), Stride::broadcast());
        SplitTreeArgs {
            split: scaled.lower_z::<Ax>(),
            aux: ((((), amax_aux), scale_aux, ()), AuxStoreArgs::new(args.aux_ptr.clone(), args.d_aux)),
            output: ((((), args.activation.clone()), args.amax_d_args::<Out>()), scaled.scale_d_args(), ()),
        }
    }
}

impl<const STAGES: usize, Cta, Ax, L, Act, Out, Cmp, Aux, Amax, Bias, Src, Scalar, R>
    AmaxAuxBranch<
        ScaledLinCombBiasEltActAmaxAux<Ax, L, Act, Out, Cmp, Aux, Amax, Bias, Src, Scalar, R>,
        ScaledAmaxAuxArgs<Scalar, Bias, Aux, Amax, Act::Arguments>,
        STAGES,
        Cta,
    > for Wide
where
    Cta: TileShape,
    Ax: VectorAxis,
    L: LayoutTag,
    Act: Functor<1>,
    Out: Element,
    Out::Width: OutputScaling,
    Cmp: ComputeElement,
    Aux: Element,
    Amax: Element,
    Bias: Element,
    Src: Element,
    Scalar: Element,
    R: Rounding,
{
    type Impl = WideAuxAmaxTree<STAGES, Ax, Cta, L, Act, Out, Cmp, Aux, Amax, Bias, Src, Scalar, R>;

    fn lower(
        args: &ScaledAmaxAuxArgs<Scalar, Bias, Aux, Amax, Act::Arguments>,
    ) -> <Self::Impl as Visitor>::Arguments {
        let scaled = args.scaled();
        let z = (scaled.lower_z::<Ax>(), AuxStoreArgs::new(args.aux_ptr.clone(), args.d_aux));
        (((z, args.activation.clone()), args.amax_d_args::<Out>()), scaled.scale_d_args(), ())
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
        Ax,
        Act,
        Out,
        Cmp,
        Bias,
        Src,
        Scalar,
        R,
    > FusionCallbacks<TmaWarpSpecialized<SC, SD, FRAG, REUSE, DELAY>, Cta, Epi>
    for ScaledLinCombBiasEltAct<Ax, Act, Out, Cmp, Bias, Src, Scalar, R>
where
    Cta: TileShape,
    Ax: VectorAxis,
    Act: Functor<1>,
    Out: Element,
    Out::Width: OutputScaling,
    Cmp: ComputeElement,
    Bias: Element,
    Src: Element,
    Scalar: Element,
    R: Rounding,
{
    type Impl = ScaledLinCombBiasEltActTree<Ax, Cta, Act, Out, Cmp, Bias, Src, Scalar, R>;
    type Arguments = ScaledLinCombBiasEltActArgs<Scalar, Bias, Act::Arguments>;

    fn lower(args: &Self::Arguments) -> <Self::Impl as Visitor>::Arguments {
        args.lower::<Ax>()
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
        Ax,
        L,
        Act,
        Out,
        Cmp,
        Aux,
        Amax,
        Bias,
        Src,
        Scalar,
        R,
    > FusionCallbacks<TmaWarpSpecialized<SC, SD, FRAG, REUSE, DELAY>, Cta, Epi>
    for ScaledLinCombBiasEltActAmaxAux<Ax, L, Act, Out, Cmp, Aux, Amax, Bias, Src, Scalar, R>
where
    Act: Functor<1>,
    Aux: Element,
    Amax: Element,
    Bias: Element,
    Scalar: Element,
    Aux::Width: AmaxAuxBranch<
        ScaledLinCombBiasEltActAmaxAux<Ax, L, Act, Out, Cmp, Aux, Amax, Bias, Src, Scalar, R>,
        ScaledAmaxAuxArgs<Scalar, Bias, Aux, Amax, Act::Arguments>,
        SD,
        Cta,
    >,
{
    type Impl = <Aux::Width as AmaxAuxBranch<
        ScaledLinCombBiasEltActAmaxAux<Ax, L, Act, Out, Cmp, Aux, Amax, Bias, Src, Scalar, R>,
        ScaledAmaxAuxArgs<Scalar, Bias, Aux, Amax, Act::Arguments>,
        SD,
        Cta,
    >>::Impl;
    type Arguments = ScaledAmaxAuxArgs<Scalar, Bias, Aux, Amax, Act::Arguments>;

    const AUX_KIND: Option<NumericKind> = Some(Aux::KIND);

    fn lower(args: &Self::Arguments) -> <Self::Impl as Visitor>::Arguments {
        <Aux::Width as AmaxAuxBranch<
            ScaledLinCombBiasEltActAmaxAux<Ax, L, Act, Out, Cmp, Aux, Amax, Bias, Src, Scalar, R>,
            ScaledAmaxAuxArgs<Scalar, Bias, Aux, Amax, Act::Arguments>,
            SD,
            Cta,
        >>::lower(args)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::element::Float8E4M3;

    #[test]
    fn test_scaled_leaves_carry_all_factors() {
        let args = ScaledLinCombBiasEltActArgs::<f32, f32, ()> {
            alpha: 2.0,
            scale_a: 3.0,
            scale_b: 5.0,
            beta: 0.5,
            scale_c: 4.0,
            ..Default::default()
        };
        let (beta, (), (alpha, (), _, ()), ()) = args.lower_z::<PerRow>();
        assert_eq!(alpha.scalars, [2.0, 3.0, 5.0]);
        assert_eq!(beta.scalars, [0.5, 4.0]);
    }

    #[test]
    fn test_amax_d_dropped_for_wide_output() {
        let args = ScaledAmaxAuxArgs::<f32, f32, f32, f32, ()> {
            amax_d_ptr: Some(DeviceBuffer::zeroed(1)),
            ..Default::default()
        };
        assert!(args.amax_d_args::<f32>().ptr.is_none());
        assert!(args.amax_d_args::<Float8E4M3>().ptr.is_some());
    }
}
