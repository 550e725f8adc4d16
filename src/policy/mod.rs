//! Epilogue schedules and the tag-to-tree resolution they key.

pub mod dispatch;
pub mod epilogue;

pub use dispatch::{make_callbacks, FusionCallbacks, NestedArguments};
pub use epilogue::{EpiloguePolicy, PolicyKind, PtrArrayTmaWarpSpecialized, TmaWarpSpecialized};
