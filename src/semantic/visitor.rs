//! The epilogue visitor protocol.
//!
//! A fused epilogue is a tree of nodes. Each node is built once per launch from its slot of the
//! nested argument structure, is shared read-only by every tile, and keeps whatever it needs
//! across the subtiles of one tile in its `TileState`:
//!
//! 1. `begin_tile` creates the tile state (staging buffers, partial reductions),
//! 2. `visit` runs once per epilogue subtile and returns this node's fragment,
//! 3. `end_tile` flushes staged stores and merges partial reductions into global memory.
//!
//! Leaves implement [`Visitor`] directly. Interior operations implement [`NodeOp`] and are
//! placed into a tree with [`Tree`](crate::semantic::tree::Tree), which evaluates children
//! first and converts their fragments to the op's input type.

use crate::core::element::Element;
use crate::core::error::EpilogueError;
use crate::core::shape::{ProblemShape, Subtile, TileContext};
use crate::semantic::fragment::Fragment;

/// Per-subtile inputs handed to every leaf.
#[derive(Debug, Clone, Copy)]
pub struct VisitInputs<'a> {
    pub acc: &'a Fragment<f32>,
    pub source: &'a Fragment<f64>,
    /// The cached value of the innermost enclosing split point, if any.
    pub split: Option<&'a Fragment<f64>>,
}

impl<'a> VisitInputs<'a> {
    pub fn new(acc: &'a Fragment<f32>, source: &'a Fragment<f64>) -> Self {
        Self { acc, source, split: None }
    }

    pub fn with_split(self, split: &'a Fragment<f64>) -> Self {
        Self { split: Some(split), ..self }
    }
}

pub trait Visitor: Send + Sync + Sized {
    type Arguments: Clone + Default + Send + Sync;
    type Output: Element;
    type TileState: Send;

    fn new(args: Self::Arguments) -> Self;

    /// Host-side validation of arguments against a problem.
    fn can_implement(_args: &Self::Arguments, _problem: &ProblemShape) -> Result<(), EpilogueError> {
        Ok(())
    }

    /// Whether any node reads the source tensor C.
    fn needs_source(&self) -> bool {
        false
    }

    fn begin_tile(&self, tile: &TileContext) -> Self::TileState;

    fn visit(
        &self,
        state: &mut Self::TileState,
        tile: &TileContext,
        sub: &Subtile,
        inputs: &VisitInputs<'_>,
    ) -> Fragment<Self::Output>;

    fn end_tile(&self, _state: Self::TileState, _tile: &TileContext) {}
}

/// An interior node consuming the fragments of `N` children.
pub trait NodeOp<const N: usize>: Send + Sync + Sized {
    type Arguments: Clone + Default + Send + Sync;
    type Input: Element;
    type Output: Element;
    type TileState: Send;

    fn new(args: Self::Arguments) -> Self;

    fn can_implement(_args: &Self::Arguments, _problem: &ProblemShape) -> Result<(), EpilogueError> {
        Ok(())
    }

    fn begin_tile(&self, tile: &TileContext) -> Self::TileState;

    fn apply(
        &self,
        state: &mut Self::TileState,
        tile: &TileContext,
        sub: &Subtile,
        inputs: [Fragment<Self::Input>; N],
    ) -> Fragment<Self::Output>;

    fn end_tile(&self, _state: Self::TileState, _tile: &TileContext) {}
}
