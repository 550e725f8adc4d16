//! Scaled accumulator and linear combination pipelines, with their pointer-array and grouped
//! wgrad forms.

use std::marker::PhantomData;

use crate::catalog::one;
use crate::core::element::{ComputeElement, Element, RoundNearest, Rounding};
use crate::core::memory::DeviceBuffer;
use crate::core::shape::Stride;
use crate::nodes::broadcast::{ScalarArgs, ScalarBroadcast, ScalarBroadcastPtrArray, ScalarPtrArrayArgs};
use crate::nodes::compute::Compute;
use crate::nodes::fetch::{AccFetch, AccFetchGroupedWgrad, SrcFetch};
use crate::policy::dispatch::FusionCallbacks;
use crate::policy::epilogue::{PtrArrayTmaWarpSpecialized, TmaWarpSpecialized};
use crate::semantic::functor::{Functor, Multiplies, MultiplyAdd};
use crate::semantic::tree::Tree;
use crate::semantic::visitor::Visitor;

/// `D = alpha * acc`
pub struct ScaledAcc<Out, Cmp = f32, Scalar = Cmp, R = RoundNearest>(PhantomData<(Out, Cmp, Scalar, R)>);

/// `D = alpha * acc + beta * C`
pub struct LinearCombination<Out, Cmp = f32, Src = Out, Scalar = Cmp, R = RoundNearest>(
    PhantomData<(Out, Cmp, Src, Scalar, R)>,
);

/// `D = activation(alpha * acc + beta * C)`
pub struct LinCombEltAct<Act, Out, Cmp = f32, Src = Out, Scalar = Cmp, R = RoundNearest>(
    PhantomData<(Act, Out, Cmp, Src, Scalar, R)>,
);

/// Linear combination over a grouped weight-gradient accumulator: only same-group blocks of
/// each tile contribute.
pub struct LinearCombinationGroupedWgrad<const GROUPS: usize, Out, Cmp = f32, Src = Out, Scalar = Cmp, R = RoundNearest>(
    PhantomData<(Out, Cmp, Src, Scalar, R)>,
);

pub type ScaledAccTree<Out, Cmp, Scalar, R> =
    Tree<Compute<Multiplies, Out, Cmp, R, 2>, (ScalarBroadcast<Scalar>, AccFetch)>;

/// `beta * C + (alpha * acc)`, both scalars read through `Leaf`.
pub type LinCombTree<Out, Cmp, Src, R, Leaf, Acc = AccFetch> = Tree<
    Compute<MultiplyAdd, Out, Cmp, R, 3>,
    (Leaf, SrcFetch<Src>, Tree<Compute<Multiplies, Cmp, Cmp, R, 2>, (Leaf, Acc)>),
>;

pub type LinCombEltActTree<Act, Out, Cmp, Src, R, Leaf> =
    Tree<Compute<Act, Out, Cmp, R, 1>, (LinCombTree<Cmp, Cmp, Src, R, Leaf>,)>;

/// Nested arguments of a [`LinCombTree`] whose scalar leaves take `A`.
pub type LinCombNested<A> = (A, (), (A, (), ()), ());

pub(crate) fn lincomb_nested<A>(beta: A, alpha: A) -> LinCombNested<A> {
    (beta, (), (alpha, (), ()), ())
}

#[derive(Debug, Clone)]
pub struct ScaledAccArgs<S: Element> {
    pub alpha: S,
    pub alpha_ptr: Option<DeviceBuffer<S>>,
    pub d_alpha: Stride,
}

impl<S: Element> Default for ScaledAccArgs<S> {
    fn default() -> Self {
        Self { alpha: one(), alpha_ptr: None, d_alpha: Stride::broadcast() }
    }
}

impl<S: Element> ScaledAccArgs<S> {
    pub fn lower(&self) -> (ScalarArgs<S>, (), ()) {
        (ScalarArgs::single(self.alpha, self.alpha_ptr.clone(), self.d_alpha), (), ())
    }
}

#[derive(Debug, Clone)]
pub struct LinCombArgs<S: Element> {
    pub alpha: S,
    pub beta: S,
    pub alpha_ptr: Option<DeviceBuffer<S>>,
    pub beta_ptr: Option<DeviceBuffer<S>>,
    pub d_alpha: Stride,
    pub d_beta: Stride,
}

impl<S: Element> Default for LinCombArgs<S> {
    fn default() -> Self {
        Self {
            alpha: one(),
            beta: S::default(),
            alpha_ptr: None,
            beta_ptr: None,
            d_alpha: Stride::broadcast(),
            d_beta: Stride::broadcast(),
        }
    }
}

impl<S: Element> LinCombArgs<S> {
    pub fn new(alpha: S, beta: S) -> Self {
        Self { alpha, beta, ..Self::default() }
    }

    pub fn lower(&self) -> LinCombNested<ScalarArgs<S>> {
        lincomb_nested(
            ScalarArgs::single(self.beta, self.beta_ptr.clone(), self.d_beta),
            ScalarArgs::single(self.alpha, self.alpha_ptr.clone(), self.d_alpha),
        )
    }
}

#[derive(Debug, Clone)]
pub struct LinCombEltActArgs<S: Element, A> {
    pub alpha: S,
    pub beta: S,
    pub alpha_ptr: Option<DeviceBuffer<S>>,
    pub beta_ptr: Option<DeviceBuffer<S>>,
    pub d_alpha: Stride,
    pub d_beta: Stride,
    pub activation: A,
}

impl<S: Element, A: Default> Default for LinCombEltActArgs<S, A> {
    fn default() -> Self {
        Self {
            alpha: one(),
            beta: S::default(),
            alpha_ptr: None,
            beta_ptr: None,
            d_alpha: Stride::broadcast(),
            d_beta: Stride::broadcast(),
            activation: A::default(),
        }
    }
}

impl<S: Element, A: Clone + Default> LinCombEltActArgs<S, A> {
    pub fn new(alpha: S, beta: S, activation: A) -> Self {
        Self { alpha, beta, activation, ..Self::default() }
    }

    pub fn lower(&self) -> (LinCombNested<ScalarArgs<S>>, A) {
        (
            lincomb_nested(
                ScalarArgs::single(self.beta, self.beta_ptr.clone(), self.d_beta),
                ScalarArgs::single(self.alpha, self.alpha_ptr.clone(), self.d_alpha),
            ),
            self.activation.clone(),
        )
    }
}

/// Linear combination arguments for pointer-array GEMMs. Each scalar resolves from its
/// strided pointer, then from its per-batch pointer array, then from the inline value.
#[derive(Debug, Clone)]
pub struct LinCombPtrArrayArgs<S: Element> {
    pub alpha: S,
    pub beta: S,
    pub alpha_ptr: Option<DeviceBuffer<S>>,
    pub beta_ptr: Option<DeviceBuffer<S>>,
    pub alpha_ptr_array: Option<Vec<DeviceBuffer<S>>>,
    pub beta_ptr_array: Option<Vec<DeviceBuffer<S>>>,
    pub d_alpha: Stride,
    pub d_beta: Stride,
}

impl<S: Element> Default for LinCombPtrArrayArgs<S> {
    fn default() -> Self {
        Self {
            alpha: one(),
            beta: S::default(),
            alpha_ptr: None,
            beta_ptr: None,
            alpha_ptr_array: None,
            beta_ptr_array: None,
            d_alpha: Stride::broadcast(),
            d_beta: Stride::broadcast(),
        }
    }
}

impl<S: Element> LinCombPtrArrayArgs<S> {
    pub fn lower(&self) -> LinCombNested<ScalarPtrArrayArgs<S>> {
        lincomb_nested(
            ScalarPtrArrayArgs::single(self.beta, self.beta_ptr.clone(), self.beta_ptr_array.clone(), self.d_beta),
            ScalarPtrArrayArgs::single(self.alpha, self.alpha_ptr.clone(), self.alpha_ptr_array.clone(), self.d_alpha),
        )
    }
}

#[derive(Debug, Clone)]
pub struct LinCombEltActPtrArrayArgs<S: Element, A> {
    pub alpha: S,
    pub beta: S,
    pub alpha_ptr: Option<DeviceBuffer<S>>,
    pub beta_ptr: Option<DeviceBuffer<S>>,
    pub alpha_ptr_array: Option<Vec<DeviceBuffer<S>>>,
    pub beta_ptr_array: Option<Vec<DeviceBuffer<S>>>,
    pub d_alpha: Stride,
    pub d_beta: Stride,
    pub activation: A,
}

impl<S: Element, A: Default> Default for LinCombEltActPtrArrayArgs<S, A> {
    fn default() -> Self {
        Self {
            alpha: one(),
            beta: S::default(),
            alpha_ptr: None,
            beta_ptr: None,
            alpha_ptr_array: None,
            beta_ptr_array: None,
            d_alpha: Stride::broadcast(),
            d_beta: Stride::broadcast(),
            activation: A::default(),
        }
    }
}

impl<S: Element, A: Clone> LinCombEltActPtrArrayArgs<S, A> {
    pub fn lower(&self) -> (LinCombNested<ScalarPtrArrayArgs<S>>, A) {
        (
            lincomb_nested(
                ScalarPtrArrayArgs::single(self.beta, self.beta_ptr.clone(), self.beta_ptr_array.clone(), self.d_beta),
                ScalarPtrArrayArgs::single(
                    self.alpha,
                    self.alpha_ptr.clone(),
                    self.alpha_ptr_array.clone(),
                    self.d_alpha,
                ),
            ),
            self.activation.clone(),
        )
    }
}

impl<const SC: usize, const SD: usize, const FRAG: usize, const REUSE: bool, const DELAY: bool, Cta, Epi, Out, Cmp, Scalar, R>
    FusionCallbacks<TmaWarpSpecialized<SC, SD, FRAG, REUSE, DELAY>, Cta, Epi> for ScaledAcc<Out, Cmp, Scalar, R>
where
    Out: Element,
    Cmp: ComputeElement,
    Scalar: Element,
    R: Rounding,
{
    type Impl = ScaledAccTree<Out, Cmp, Scalar, R>;
    type Arguments = ScaledAccArgs<Scalar>;

    fn lower(args: &Self::Arguments) -> <Self::Impl as Visitor>::Arguments {
        args.lower()
    }
}

impl<const SC: usize, const SD: usize, const FRAG: usize, const REUSE: bool, const DELAY: bool, Cta, Epi, Out, Cmp, Src, Scalar, R>
    FusionCallbacks<TmaWarpSpecialized<SC, SD, FRAG, REUSE, DELAY>, Cta, Epi> for LinearCombination<Out, Cmp, Src, Scalar, R>
where
    Out: Element,
    Cmp: ComputeElement,
    Src: Element,
    Scalar: Element,
    R: Rounding,
{
    type Impl = LinCombTree<Out, Cmp, Src, R, ScalarBroadcast<Scalar>>;
    type Arguments = LinCombArgs<Scalar>;

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
        const WG: usize,
        Cta,
        Epi,
        Out,
        Cmp,
        Src,
        Scalar,
        R,
    > FusionCallbacks<PtrArrayTmaWarpSpecialized<SC, SD, FRAG, REUSE, DELAY, WG>, Cta, Epi>
    for LinearCombination<Out, Cmp, Src, Scalar, R>
where
    Out: Element,
    Cmp: ComputeElement,
    Src: Element,
    Scalar: Element,
    R: Rounding,
{
    type Impl = LinCombTree<Out, Cmp, Src, R, ScalarBroadcastPtrArray<Scalar>>;
    type Arguments = LinCombPtrArrayArgs<Scalar>;

    fn lower(args: &Self::Arguments) -> <Self::Impl as Visitor>::Arguments {
        args.lower()
    }
}

impl<const SC: usize, const SD: usize, const FRAG: usize, const REUSE: bool, const DELAY: bool, Cta, Epi, Act, Out, Cmp, Src, Scalar, R>
    FusionCallbacks<TmaWarpSpecialized<SC, SD, FRAG, REUSE, DELAY>, Cta, Epi> for LinCombEltAct<Act, Out, Cmp, Src, Scalar, R>
where
    Act: Functor<1>,
    Out: Element,
    Cmp: ComputeElement,
    Src: Element,
    Scalar: Element,
    R: Rounding,
{
    type Impl = LinCombEltActTree<Act, Out, Cmp, Src, R, ScalarBroadcast<Scalar>>;
    type Arguments = LinCombEltActArgs<Scalar, Act::Arguments>;

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
        const WG: usize,
        Cta,
        Epi,
        Act,
        Out,
        Cmp,
        Src,
        Scalar,
        R,
    > FusionCallbacks<PtrArrayTmaWarpSpecialized<SC, SD, FRAG, REUSE, DELAY, WG>, Cta, Epi>
    for LinCombEltAct<Act, Out, Cmp, Src, Scalar, R>
where
    Act: Functor<1>,
    Out: Element,
    Cmp: ComputeElement,
    Src: Element,
    Scalar: Element,
    R: Rounding,
{
    type Impl = LinCombEltActTree<Act, Out, Cmp, Src, R, ScalarBroadcastPtrArray<Scalar>>;
    type Arguments = LinCombEltActPtrArrayArgs<Scalar, Act::Arguments>;

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
        const GROUPS: usize,
        Cta,
        Epi,
        Out,
        Cmp,
        Src,
        Scalar,
        R,
    > FusionCallbacks<TmaWarpSpecialized<SC, SD, FRAG, REUSE, DELAY>, Cta, Epi>
    for LinearCombinationGroupedWgrad<GROUPS, Out, Cmp, Src, Scalar, R>
where
    Out: Element,
    Cmp: ComputeElement,
    Src: Element,
    Scalar: Element,
    R: Rounding,
{
    type Impl = LinCombTree<Out, Cmp, Src, R, ScalarBroadcast<Scalar>, AccFetchGroupedWgrad<GROUPS>>;
    type Arguments = LinCombArgs<Scalar>;

    fn lower(args: &Self::Arguments) -> <Self::Impl as Visitor>::Arguments {
        args.lower()
    }
}
