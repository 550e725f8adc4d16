//! # Core Abstractions
//!
//! Storage types, shapes and buffers shared by every epilogue node.
//!
//! - **[`element`]:** Numeric storage types and rounding.
//! - **[`shape`]:** Problem, tile and stride geometry.
//! - **[`memory`]:** Host-resident device buffers with atomic element access.
//! - **[`config`]:** Execution settings and their environment overrides.

pub mod config;
pub mod element;
pub mod error;
pub mod loader;
pub mod memory;
pub mod op;
pub mod shape;
