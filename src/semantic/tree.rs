use crate::core::element::RoundStyle;
use crate::core::error::EpilogueError;
use crate::core::shape::{ProblemShape, Subtile, TileContext};
use crate::semantic::fragment::Fragment;
use crate::semantic::visitor::{NodeOp, VisitInputs, Visitor};

/// An op node over an ordered tuple of child visitors.
///
/// Arguments are the tuple of the children's arguments in declared order, followed by the
/// op's own arguments: `Tree<Op, (A, B)>` takes `(A::Arguments, B::Arguments, Op::Arguments)`.
/// Children are constructed first, then the op. Per subtile the children are visited in
/// declared order and their fragments, converted to `Op::Input`, are passed to the op in the
/// same order.
pub struct Tree<Op, Children> {
    op: Op,
    children: Children,
}

impl<Op, Children> Tree<Op, Children> {
    pub fn op(&self) -> &Op {
        &self.op
    }

    pub fn children(&self) -> &Children {
        &self.children
    }
}

macro_rules! impl_tree {
    ($arity:tt; $($child:ident $arg:ident $idx:tt),+) => {
        impl<Op, $($child),+> Visitor for Tree<Op, ($($child,)+)>
        where
            Op: NodeOp<$arity>,
            $($child: Visitor,)+
        {
            type Arguments = ($($child::Arguments,)+ Op::Arguments);
            type Output = Op::Output;
            type TileState = (($($child::TileState,)+), Op::TileState);

            fn new(args: Self::Arguments) -> Self {
                let ($($arg,)+ op_args) = args;
                $(let $arg = $child::new($arg);)+
                let op = Op::new(op_args);
                Tree { op, children: ($($arg,)+) }
            }

            fn can_implement(args: &Self::Arguments, problem: &ProblemShape) -> Result<(), EpilogueError> {
                $($child::can_implement(&args.$idx, problem)?;)+
                Op::can_implement(&args.$arity, problem)
            }

            fn needs_source(&self) -> bool {
                $(self.children.$idx.needs_source() ||)+ false
            }

            fn begin_tile(&self, tile: &TileContext) -> Self::TileState {
                (($(self.children.$idx.begin_tile(tile),)+), self.op.begin_tile(tile))
            }

            fn visit(
                &self,
                state: &mut Self::TileState,
                tile: &TileContext,
                sub: &Subtile,
                inputs: &VisitInputs<'_>,
            ) -> Fragment<Self::Output> {
                let (child_states, op_state) = state;
                let fragments = [$(
                    self.children.$idx
                        .visit(&mut child_states.$idx, tile, sub, inputs)
                        .cast::<Op::Input>(RoundStyle::ToNearest),
                )+];
                self.op.apply(op_state, tile, sub, fragments)
            }

            fn end_tile(&self, state: Self::TileState, tile: &TileContext) {
                let (child_states, op_state) = state;
                $(self.children.$idx.end_tile(child_states.$idx, tile);)+
                self.op.end_tile(op_state, tile);
            }
        }
    };
}

impl_tree!(1; A a 0);
impl_tree!(2; A a 0, B b 1);
impl_tree!(3; A a 0, B b 1, C c 2);
impl_tree!(4; A a 0, B b 1, C c 2, D d 3);
