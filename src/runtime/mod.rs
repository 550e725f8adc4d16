//! Host-side execution: accumulator producers, the tile executor and the runtime registry.

pub mod epilogue;
pub mod mainloop;
pub mod registry;

pub use epilogue::{make_epilogue, Epilogue, SourceTensor};
pub use mainloop::{AccumulatorSource, AccumulatorTensor, ReferenceMainloop};
pub use registry::{build_epilogue, AnyBuffer, AnyTensor, AuxLayout, EpilogueBindings, EpilogueKernel, EpilogueSpec};
