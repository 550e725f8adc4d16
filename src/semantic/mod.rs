//! # Visitor Semantics
//!
//! - **[`visitor`]:** The per-tile node protocol.
//! - **[`tree`]:** Composition of an operation with its children.
//! - **[`split`]:** Shared sub-trees feeding two consumers.
//! - **[`functor`]:** Pointwise, reduction and atomic operations.

pub mod fragment;
pub mod functor;
pub mod split;
pub mod tree;
pub mod visitor;
