//! Directed-acyclic composition: one value, several consumers.

use std::marker::PhantomData;

use crate::core::element::{Element, RoundStyle};
use crate::core::error::EpilogueError;
use crate::core::shape::{ProblemShape, Subtile, TileContext};
use crate::semantic::fragment::Fragment;
use crate::semantic::visitor::{VisitInputs, Visitor};

/// Arguments of a [`SplitTree`], one named slot per sub-tree.
#[derive(Debug, Clone, Default)]
pub struct SplitTreeArgs<S, A, O> {
    pub split: S,
    pub aux: A,
    pub output: O,
}

/// Evaluates `Split` once per subtile, then `Aux` and `Output` in that order. Both consumers
/// read the cached split value through [`SplitTreeFetch`] leaves. `Aux` runs for its side
/// effects (stores, reductions); the tree's fragment is the one `Output` produces.
pub struct SplitTree<Split, Aux, Output> {
    split: Split,
    aux: Aux,
    output: Output,
}

impl<S, A, O> Visitor for SplitTree<S, A, O>
where
    S: Visitor,
    A: Visitor,
    O: Visitor,
{
    type Arguments = SplitTreeArgs<S::Arguments, A::Arguments, O::Arguments>;
    type Output = O::Output;
    type TileState = (S::TileState, A::TileState, O::TileState);

    fn new(args: Self::Arguments) -> Self {
        let split = S::new(args.split);
        let aux = A::new(args.aux);
        let output = O::new(args.output);
        Self { split, aux, output }
    }

    fn can_implement(args: &Self::Arguments, problem: &ProblemShape) -> Result<(), EpilogueError> {
        S::can_implement(&args.split, problem)?;
        A::can_implement(&args.aux, problem)?;
        O::can_implement(&args.output, problem)
    }

    fn needs_source(&self) -> bool {
        self.split.needs_source() || self.aux.needs_source() || self.output.needs_source()
    }

    fn begin_tile(&self, tile: &TileContext) -> Self::TileState {
        (self.split.begin_tile(tile), self.aux.begin_tile(tile), self.output.begin_tile(tile))
    }

    fn visit(
        &self,
        state: &mut Self::TileState,
        tile: &TileContext,
        sub: &Subtile,
        inputs: &VisitInputs<'_>,
    ) -> Fragment<Self::Output> {
        let (split_state, aux_state, output_state) = state;
        let cached: Fragment<f64> = self
            .split
            .visit(split_state, tile, sub, inputs)
            .cast(RoundStyle::ToNearest);
        let inner = inputs.with_split(&cached);
        let _ = self.aux.visit(aux_state, tile, sub, &inner);
        self.output.visit(output_state, tile, sub, &inner)
    }

    fn end_tile(&self, state: Self::TileState, tile: &TileContext) {
        let (split_state, aux_state, output_state) = state;
        self.split.end_tile(split_state, tile);
        self.aux.end_tile(aux_state, tile);
        self.output.end_tile(output_state, tile);
    }
}

/// Leaf returning the enclosing split point's cached value.
pub struct SplitTreeFetch<E = f32>(PhantomData<E>);

impl<E: Element> Visitor for SplitTreeFetch<E> {
    type Arguments = ();
    type Output = E;
    type TileState = ();

    fn new(_args: ()) -> Self {
        Self(PhantomData)
    }

    fn begin_tile(&self, _tile: &TileContext) {}

    fn visit(&self, _state: &mut (), _tile: &TileContext, sub: &Subtile, inputs: &VisitInputs<'_>) -> Fragment<E> {
        match inputs.split {
            Some(split) => split.cast(RoundStyle::ToNearest),
            None => {
                debug_assert!(false, "SplitTreeFetch evaluated outside a SplitTree");
                Fragment::filled(sub.rows, sub.cols, E::default())
            }
        }
    }
}
