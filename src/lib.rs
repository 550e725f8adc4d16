//! # Tracea EVT: Fused GEMM Epilogues
//!
//! A reference implementation of epilogue visitor trees: the per-tile post-processing of a
//! GEMM accumulator (`D = activation(alpha * acc + beta * C + bias)` and friends) expressed as
//! a compile-time tree of nodes, evaluated subtile by subtile the way a warp-specialized
//! epilogue would.
//!
//! ## Modules
//!
//! - **[`core`]**: Elements, shapes, buffers, configuration.
//! - **[`semantic`]**: The visitor protocol, tree composition and functors.
//! - **[`nodes`]**: Fetch, broadcast, compute, reduction, aux and top-k nodes.
//! - **[`catalog`]**: Named pipelines and their flat arguments.
//! - **[`policy`]**: Epilogue schedules and `FusionCallbacks` dispatch.
//! - **[`runtime`]**: Tile executor, reference mainloop and the JSON-driven registry.

pub mod catalog;
pub mod core;
pub mod nodes;
pub mod policy;
pub mod runtime;
pub mod semantic;

pub use crate::core::config::{EpilogueConfig, TileOrder};
pub use crate::core::element::{Element, Float8E4M3, Float8E5M2, NumericKind};
pub use crate::core::error::EpilogueError;
pub use crate::core::memory::{DeviceBuffer, TensorRef};
pub use crate::core::op::{ActivationKind, PipelineKind};
pub use crate::core::shape::{ProblemShape, Shape, Stride, TileShape};
pub use crate::policy::{make_callbacks, FusionCallbacks, PtrArrayTmaWarpSpecialized, TmaWarpSpecialized};
pub use crate::runtime::{
    build_epilogue, make_epilogue, AccumulatorSource, AccumulatorTensor, AnyBuffer, AnyTensor, AuxLayout, Epilogue,
    EpilogueBindings, EpilogueKernel, EpilogueSpec, ReferenceMainloop,
};
pub use crate::semantic::fragment::Fragment;
