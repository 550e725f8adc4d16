//! Named pipelines.
//!
//! Every entry is a zero-sized tag, a tree type alias, a flat arguments struct with a
//! `lower()` into the tree's nested arguments, and the `FusionCallbacks` impls binding them
//! together for the policies the entry supports.

pub mod backward;
pub mod bias;
pub mod linear;
pub mod scaled;
pub mod topk;

use crate::core::element::{Element, RoundStyle};

pub use backward::{LinCombDeEltAct, LinCombDeEltActDePerRowBias};
pub use bias::{
    LinCombBias, LinCombBiasEltAct, LinCombBiasEltActAux, LinCombPerColBias, LinCombPerColBiasEltAct,
    LinCombPerColBiasEltActAux, LinCombPerRowBias, LinCombPerRowBiasEltAct, LinCombPerRowBiasEltActAux,
    PerColLinCombPerColBiasEltAct, PerColResAddPerColBiasEltAct, PerRowLinCombPerRowBiasEltAct,
    VecLinCombBiasEltAct,
};
pub use linear::{LinCombEltAct, LinearCombination, LinearCombinationGroupedWgrad, ScaledAcc};
pub use scaled::{
    ScaledLinCombBiasEltAct, ScaledLinCombBiasEltActAmaxAux, ScaledLinCombPerColBiasEltAct,
    ScaledLinCombPerColBiasEltActAmaxAux, ScaledLinCombPerRowBiasEltAct, ScaledLinCombPerRowBiasEltActAmaxAux,
};
pub use topk::LinCombTopKSoftmaxCol;

pub(crate) fn one<E: Element>() -> E {
    E::from_f64_rounded(1.0, RoundStyle::ToNearest)
}
