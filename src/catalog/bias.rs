//! Bias-carrying pipelines: linear combination plus a per-row or per-column bias vector,
//! optionally followed by an activation and an auxiliary store of the pre-activation value.
//!
//! Every entry is generic over the bias axis ([`PerRow`] or [`PerCol`]); the named aliases
//! fix it. Unless set explicitly, vector strides default to the packed layout of the axis.

use std::marker::PhantomData;

use crate::catalog::one;
use crate::core::element::{ComputeElement, Element, NumericKind, RoundNearest, Rounding};
use crate::core::memory::DeviceBuffer;
use crate::core::shape::{Stride, TileShape};
use crate::nodes::aux::{AuxStore, AuxStoreArgs, LayoutTag};
use crate::nodes::broadcast::{PerCol, PerRow, ScalarArgs, ScalarBroadcast, VectorArgs, VectorAxis, VectorBroadcast};
use crate::nodes::compute::Compute;
use crate::nodes::fetch::{AccFetch, SrcFetch};
use crate::policy::dispatch::FusionCallbacks;
use crate::policy::epilogue::TmaWarpSpecialized;
use crate::semantic::functor::{Functor, MultiplyAdd};
use crate::semantic::tree::Tree;
use crate::semantic::visitor::Visitor;

/// `D = alpha * acc + bias + beta * C`
pub struct LinCombBias<Ax, Out, Cmp = f32, Bias = Out, Src = Out, Scalar = Cmp, R = RoundNearest>(
    PhantomData<(Ax, Out, Cmp, Bias, Src, Scalar, R)>,
);

pub type LinCombPerRowBias<Out, Cmp = f32, Bias = Out, Src = Out, Scalar = Cmp, R = RoundNearest> =
    LinCombBias<PerRow, Out, Cmp, Bias, Src, Scalar, R>;
pub type LinCombPerColBias<Out, Cmp = f32, Bias = Out, Src = Out, Scalar = Cmp, R = RoundNearest> =
    LinCombBias<PerCol, Out, Cmp, Bias, Src, Scalar, R>;

/// `D = activation(alpha * acc + bias + beta * C)`
pub struct LinCombBiasEltAct<Ax, Act, Out, Cmp = f32, Bias = Out, Src = Out, Scalar = Cmp, R = RoundNearest>(
    PhantomData<(Ax, Act, Out, Cmp, Bias, Src, Scalar, R)>,
);

pub type LinCombPerRowBiasEltAct<Act, Out, Cmp = f32, Bias = Out, Src = Out, Scalar = Cmp, R = RoundNearest> =
    LinCombBiasEltAct<PerRow, Act, Out, Cmp, Bias, Src, Scalar, R>;
pub type LinCombPerColBiasEltAct<Act, Out, Cmp = f32, Bias = Out, Src = Out, Scalar = Cmp, R = RoundNearest> =
    LinCombBiasEltAct<PerCol, Act, Out, Cmp, Bias, Src, Scalar, R>;

/// `Z = alpha * acc + bias + beta * C`, `Aux = Z`, `D = activation(Z)`. `L` is the memory
/// order of the auxiliary tensor.
#[allow(clippy::type_complexity)]
pub struct LinCombBiasEltActAux<
    Ax,
    L,
    Act,
    Out,
    Cmp = f32,
    Aux = Out,
    Bias = Out,
    Src = Out,
    Scalar = Cmp,
    R = RoundNearest,
>(PhantomData<(Ax, L, Act, Out, Cmp, Aux, Bias, Src, Scalar, R)>);

pub type LinCombPerRowBiasEltActAux<L, Act, Out, Cmp = f32, Aux = Out, Bias = Out, Src = Out, Scalar = Cmp, R = RoundNearest> =
    LinCombBiasEltActAux<PerRow, L, Act, Out, Cmp, Aux, Bias, Src, Scalar, R>;
pub type LinCombPerColBiasEltActAux<L, Act, Out, Cmp = f32, Aux = Out, Bias = Out, Src = Out, Scalar = Cmp, R = RoundNearest> =
    LinCombBiasEltActAux<PerCol, L, Act, Out, Cmp, Aux, Bias, Src, Scalar, R>;

/// `D = activation(alpha * acc + bias + beta * C)` where alpha and beta are vectors along the
/// bias axis. A zero stride on that axis turns either one back into a scalar.
pub struct VecLinCombBiasEltAct<Ax, Act, Out, Cmp = f32, Bias = Out, Src = Out, Scalar = Cmp, R = RoundNearest>(
    PhantomData<(Ax, Act, Out, Cmp, Bias, Src, Scalar, R)>,
);

pub type PerRowLinCombPerRowBiasEltAct<Act, Out, Cmp = f32, Bias = Out, Src = Out, Scalar = Cmp, R = RoundNearest> =
    VecLinCombBiasEltAct<PerRow, Act, Out, Cmp, Bias, Src, Scalar, R>;
pub type PerColLinCombPerColBiasEltAct<Act, Out, Cmp = f32, Bias = Out, Src = Out, Scalar = Cmp, R = RoundNearest> =
    VecLinCombBiasEltAct<PerCol, Act, Out, Cmp, Bias, Src, Scalar, R>;

/// `D = beta * C + activation(alpha * acc + bias)` with per-column alpha, beta and bias:
/// a residual add after the activation.
pub struct PerColResAddPerColBiasEltAct<Act, Out, Cmp = f32, Bias = Out, Src = Out, Scalar = Cmp, R = RoundNearest>(
    PhantomData<(Act, Out, Cmp, Bias, Src, Scalar, R)>,
);

pub type LinCombBiasTree<Ax, Cta, Out, Cmp, Bias, Src, Scalar, R> = Tree<
    Compute<MultiplyAdd, Out, Cmp, R, 3>,
    (
        ScalarBroadcast<Scalar>,
        SrcFetch<Src>,
        Tree<Compute<MultiplyAdd, Cmp, Cmp, R, 3>, (ScalarBroadcast<Scalar>, AccFetch, VectorBroadcast<Ax, Cta, Bias>)>,
    ),
>;

pub type LinCombBiasEltActTree<Ax, Cta, Act, Out, Cmp, Bias, Src, Scalar, R> =
    Tree<Compute<Act, Out, Cmp, R, 1>, (LinCombBiasTree<Ax, Cta, Cmp, Cmp, Bias, Src, Scalar, R>,)>;

pub type LinCombBiasEltActAuxTree<const STAGES: usize, Ax, Cta, L, Act, Out, Cmp, Aux, Bias, Src, Scalar, R> = Tree<
    Compute<Act, Out, Cmp, R, 1>,
    (Tree<AuxStore<STAGES, Aux, Cmp, R, L>, (LinCombBiasTree<Ax, Cta, Cmp, Cmp, Bias, Src, Scalar, R>,)>,),
>;

pub type VecLinCombBiasEltActTree<Ax, Cta, Act, Out, Cmp, Bias, Src, Scalar, R> = Tree<
    Compute<Act, Out, Cmp, R, 1>,
    (
        Tree<
            Compute<MultiplyAdd, Cmp, Cmp, R, 3>,
            (
                VectorBroadcast<Ax, Cta, Scalar>,
                SrcFetch<Src>,
                Tree<
                    Compute<MultiplyAdd, Cmp, Cmp, R, 3>,
                    (VectorBroadcast<Ax, Cta, Scalar>, AccFetch, VectorBroadcast<Ax, Cta, Bias>),
                >,
            ),
        >,
    ),
>;

pub type ResAddBiasEltActTree<Cta, Act, Out, Cmp, Bias, Src, Scalar, R> = Tree<
    Compute<MultiplyAdd, Out, Cmp, R, 3>,
    (
        VectorBroadcast<PerCol, Cta, Scalar>,
        SrcFetch<Src>,
        Tree<
            Compute<Act, Cmp, Cmp, R, 1>,
            (
                Tree<
                    Compute<MultiplyAdd, Cmp, Cmp, R, 3>,
                    (VectorBroadcast<PerCol, Cta, Scalar>, AccFetch, VectorBroadcast<PerCol, Cta, Bias>),
                >,
            ),
        >,
    ),
>;

/// Nested arguments of a [`LinCombBiasTree`].
pub type LinCombBiasNested<S, B> = (ScalarArgs<S>, (), (ScalarArgs<S>, (), VectorArgs<B>, ()), ());

#[derive(Debug, Clone)]
pub struct LinCombBiasArgs<S: Element, B: Element> {
    pub alpha: S,
    pub beta: S,
    pub alpha_ptr: Option<DeviceBuffer<S>>,
    pub beta_ptr: Option<DeviceBuffer<S>>,
    pub d_alpha: Stride,
    pub d_beta: Stride,
    pub bias_ptr: Option<DeviceBuffer<B>>,
    /// `None` selects the packed stride of the bias axis.
    pub d_bias: Option<Stride>,
}

impl<S: Element, B: Element> Default for LinCombBiasArgs<S, B> {
    fn default() -> Self {
        Self {
            alpha: one(),
            beta: S::default(),
            alpha_ptr: None,
            beta_ptr: None,
            d_alpha: Stride::broadcast(),
            d_beta: Stride::broadcast(),
            bias_ptr: None,
            d_bias: None,
        }
    }
}

impl<S: Element, B: Element> LinCombBiasArgs<S, B> {
    pub fn lower<Ax: VectorAxis>(&self) -> LinCombBiasNested<S, B> {
        (
            ScalarArgs::single(self.beta, self.beta_ptr.clone(), self.d_beta),
            (),
            (
                ScalarArgs::single(self.alpha, self.alpha_ptr.clone(), self.d_alpha),
                (),
                VectorArgs::new(self.bias_ptr.clone(), B::default(), self.d_bias.unwrap_or(Ax::vector_stride(0))),
                (),
            ),
            (),
        )
    }
}

#[derive(Debug, Clone)]
pub struct LinCombBiasEltActArgs<S: Element, B: Element, A> {
    pub alpha: S,
    pub beta: S,
    pub alpha_ptr: Option<DeviceBuffer<S>>,
    pub beta_ptr: Option<DeviceBuffer<S>>,
    pub d_alpha: Stride,
    pub d_beta: Stride,
    pub bias_ptr: Option<DeviceBuffer<B>>,
    pub d_bias: Option<Stride>,
    pub activation: A,
}

impl<S: Element, B: Element, A: Default> Default for LinCombBiasEltActArgs<S, B, A> {
    fn default() -> Self {
        Self {
            alpha: one(),
            beta: S::default(),
            alpha_ptr: None,
            beta_ptr: None,
            d_alpha: Stride::broadcast(),
            d_beta: Stride::broadcast(),
            bias_ptr: None,
            d_bias: None,
            activation: A::default(),
        }
    }
}

impl<S: Element, B: Element, A: Clone> LinCombBiasEltActArgs<S, B, A> {
    fn bias_args(&self) -> LinCombBiasArgs<S, B> {
        LinCombBiasArgs {
            alpha: self.alpha,
            beta: self.beta,
            alpha_ptr: self.alpha_ptr.clone(),
            beta_ptr: self.beta_ptr.clone(),
            d_alpha: self.d_alpha,
            d_beta: self.d_beta,
            bias_ptr: self.bias_ptr.clone(),
            d_bias: self.d_bias,
        }
    }

    pub fn lower<Ax: VectorAxis>(&self) -> (LinCombBiasNested<S, B>, A) {
        (self.bias_args().lower::<Ax>(), self.activation.clone())
    }
}

#[derive(Debug, Clone)]
pub struct LinCombBiasEltActAuxArgs<S: Element, B: Element, X: Element, A> {
    pub alpha: S,
    pub beta: S,
    pub alpha_ptr: Option<DeviceBuffer<S>>,
    pub beta_ptr: Option<DeviceBuffer<S>>,
    pub d_alpha: Stride,
    pub d_beta: Stride,
    pub bias_ptr: Option<DeviceBuffer<B>>,
    pub d_bias: Option<Stride>,
    pub activation: A,
    pub aux_ptr: Option<DeviceBuffer<X>>,
    /// `None` selects the packed stride of the aux layout.
    pub d_aux: Option<Stride>,
}

impl<S: Element, B: Element, X: Element, A: Default> Default for LinCombBiasEltActAuxArgs<S, B, X, A> {
    fn default() -> Self {
        Self {
            alpha: one(),
            beta: S::default(),
            alpha_ptr: None,
            beta_ptr: None,
            d_alpha: Stride::broadcast(),
            d_beta: Stride::broadcast(),
            bias_ptr: None,
            d_bias: None,
            activation: A::default(),
            aux_ptr: None,
            d_aux: None,
        }
    }
}

impl<S: Element, B: Element, X: Element, A: Clone> LinCombBiasEltActAuxArgs<S, B, X, A> {
    #[allow(clippy::type_complexity)]
    pub fn lower<Ax: VectorAxis>(&self) -> ((LinCombBiasNested<S, B>, AuxStoreArgs<X>), A) {
        let bias = LinCombBiasArgs {
            alpha: self.alpha,
            beta: self.beta,
            alpha_ptr: self.alpha_ptr.clone(),
            beta_ptr: self.beta_ptr.clone(),
            d_alpha: self.d_alpha,
            d_beta: self.d_beta,
            bias_ptr: self.bias_ptr.clone(),
            d_bias: self.d_bias,
        };
        (
            (bias.lower::<Ax>(), AuxStoreArgs::new(self.aux_ptr.clone(), self.d_aux)),
            self.activation.clone(),
        )
    }
}

/// Arguments shared by the vector-scaled pipelines. Without a pointer, alpha and beta
/// broadcast their inline values.
#[derive(Debug, Clone)]
pub struct VecLinCombBiasEltActArgs<S: Element, B: Element, A> {
    pub alpha: S,
    pub beta: S,
    pub alpha_ptr: Option<DeviceBuffer<S>>,
    pub beta_ptr: Option<DeviceBuffer<S>>,
    pub bias_ptr: Option<DeviceBuffer<B>>,
    pub d_alpha: Option<Stride>,
    pub d_beta: Option<Stride>,
    pub d_bias: Option<Stride>,
    pub activation: A,
}

impl<S: Element, B: Element, A: Default> Default for VecLinCombBiasEltActArgs<S, B, A> {
    fn default() -> Self {
        Self {
            alpha: one(),
            beta: S::default(),
            alpha_ptr: None,
            beta_ptr: None,
            bias_ptr: None,
            d_alpha: None,
            d_beta: None,
            d_bias: None,
            activation: A::default(),
        }
    }
}

type VecNested<S, B> = (VectorArgs<S>, (), (VectorArgs<S>, (), VectorArgs<B>, ()), ());

impl<S: Element, B: Element, A: Clone> VecLinCombBiasEltActArgs<S, B, A> {
    fn leaves<Ax: VectorAxis>(&self) -> (VectorArgs<S>, VectorArgs<S>, VectorArgs<B>) {
        let packed = Ax::vector_stride(0);
        (
            VectorArgs::new(self.alpha_ptr.clone(), self.alpha, self.d_alpha.unwrap_or(packed)),
            VectorArgs::new(self.beta_ptr.clone(), self.beta, self.d_beta.unwrap_or(packed)),
            VectorArgs::new(self.bias_ptr.clone(), B::default(), self.d_bias.unwrap_or(packed)),
        )
    }

    pub fn lower<Ax: VectorAxis>(&self) -> (VecNested<S, B>, A) {
        let (alpha, beta, bias) = self.leaves::<Ax>();
        ((beta, (), (alpha, (), bias, ()), ()), self.activation.clone())
    }

    #[allow(clippy::type_complexity)]
    pub fn lower_residual(&self) -> (VectorArgs<S>, (), ((VectorArgs<S>, (), VectorArgs<B>, ()), A), ()) {
        let (alpha, beta, bias) = self.leaves::<PerCol>();
        (beta, (), ((alpha, (), bias, ()), self.activation.clone()), ())
    }
}

impl<const SC: usize, const SD: usize, const FRAG: usize, const REUSE: bool, const DELAY: bool, Cta, Epi, Ax, Out, Cmp, Bias, Src, Scalar, R>
    FusionCallbacks<TmaWarpSpecialized<SC, SD, FRAG, REUSE, DELAY>, Cta, Epi>
    for LinCombBias<Ax, Out, Cmp, Bias, Src, Scalar, R>
where
    Cta: TileShape,
    Ax: VectorAxis,
    Out: Element,
    Cmp: ComputeElement,
    Bias: Element,
    Src: Element,
    Scalar: Element,
    R: Rounding,
{
    type Impl = LinCombBiasTree<Ax, Cta, Out, Cmp, Bias, Src, Scalar, R>;
    type Arguments = LinCombBiasArgs<Scalar, Bias>;

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
        Act,
        Out,
        Cmp,
        Bias,
        Src,
        Scalar,
        R,
    > FusionCallbacks<TmaWarpSpecialized<SC, SD, FRAG, REUSE, DELAY>, Cta, Epi>
    for LinCombBiasEltAct<Ax, Act, Out, Cmp, Bias, Src, Scalar, R>
where
    Cta: TileShape,
    Ax: VectorAxis,
    Act: Functor<1>,
    Out: Element,
    Cmp: ComputeElement,
    Bias: Element,
    Src: Element,
    Scalar: Element,
    R: Rounding,
{
    type Impl = LinCombBiasEltActTree<Ax, Cta, Act, Out, Cmp, Bias, Src, Scalar, R>;
    type Arguments = LinCombBiasEltActArgs<Scalar, Bias, Act::Arguments>;

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
        Bias,
        Src,
        Scalar,
        R,
    > FusionCallbacks<TmaWarpSpecialized<SC, SD, FRAG, REUSE, DELAY>, Cta, Epi>
    for LinCombBiasEltActAux<Ax, L, Act, Out, Cmp, Aux, Bias, Src, Scalar, R>
where
    Cta: TileShape,
    Ax: VectorAxis,
    L: LayoutTag,
    Act: Functor<1>,
    Out: Element,
    Cmp: ComputeElement,
    Aux: Element,
    Bias: Element,
    Src: Element,
    Scalar: Element,
    R: Rounding,
{
    type Impl = LinCombBiasEltActAuxTree<SD, Ax, Cta, L, Act, Out, Cmp, Aux, Bias, Src, Scalar, R>;
    type Arguments = LinCombBiasEltActAuxArgs<Scalar, Bias, Aux, Act::Arguments>;

    const AUX_KIND: Option<NumericKind> = Some(Aux::KIND);

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
        Act,
        Out,
        Cmp,
        Bias,
        Src,
        Scalar,
        R,
    > FusionCallbacks<TmaWarpSpecialized<SC, SD, FRAG, REUSE, DELAY>, Cta, Epi>
    for VecLinCombBiasEltAct<Ax, Act, Out, Cmp, Bias, Src, Scalar, R>
where
    Cta: TileShape,
    Ax: VectorAxis,
    Act: Functor<1>,
    Out: Element,
    Cmp: ComputeElement,
    Bias: Element,
    Src: Element,
    Scalar: Element,
    R: Rounding,
{
    type Impl = VecLinCombBiasEltActTree<Ax, Cta, Act, Out, Cmp, Bias, Src, Scalar, R>;
    type Arguments = VecLinCombBiasEltActArgs<Scalar, Bias, Act::Arguments>;

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
        Act,
        Out,
        Cmp,
        Bias,
        Src,
        Scalar,
        R,
    > FusionCallbacks<TmaWarpSpecialized<SC, SD, FRAG, REUSE, DELAY>, Cta, Epi>
    for PerColResAddPerColBiasEltAct<Act, Out, Cmp, Bias, Src, Scalar, R>
where
    Cta: TileShape,
    Act: Functor<1>,
    Out: Element,
    Cmp: ComputeElement,
    Bias: Element,
    Src: Element,
    Scalar: Element,
    R: Rounding,
{
    type Impl = ResAddBiasEltActTree<Cta, Act, Out, Cmp, Bias, Src, Scalar, R>;
    type Arguments = VecLinCombBiasEltActArgs<Scalar, Bias, Act::Arguments>;

    fn lower(args: &Self::Arguments) -> <Self::Impl as Visitor>::Arguments {
        args.lower_residual()
    }
}
