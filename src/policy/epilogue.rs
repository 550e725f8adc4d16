//! Epilogue schedule policies.
//!
//! A policy fixes the pipelining parameters of the epilogue: how many source (C) and output
//! (D) subtiles are staged at once, the register fragment width, and whether the C staging
//! buffer is reused for D. Catalog entries read the stage counts when they size auxiliary
//! load/store rings.

use serde::{Deserialize, Serialize};

pub trait EpiloguePolicy: Send + Sync + 'static {
    const NAME: &'static str;
    const KIND: PolicyKind;
    const STAGES_C: usize;
    const STAGES_D: usize;
    const FRAGMENT_SIZE: usize;
    const REUSE_SMEM_C: bool;
    const DELAY_TMA_STORE: bool;
    /// Number of warp groups sharing one epilogue (1 for the dense schedule).
    const WARP_GROUPS: usize = 1;
}

/// Warp-specialized epilogue with staged C loads and D stores.
pub struct TmaWarpSpecialized<
    const STAGES_C: usize = 4,
    const STAGES_D: usize = 2,
    const FRAGMENT_SIZE: usize = 4,
    const REUSE_SMEM_C: bool = false,
    const DELAY_TMA_STORE: bool = false,
>;

/// Grouped / pointer-array variant: every batch may carry its own scalar pointers.
pub struct PtrArrayTmaWarpSpecialized<
    const STAGES_C: usize = 4,
    const STAGES_D: usize = 2,
    const FRAGMENT_SIZE: usize = 4,
    const REUSE_SMEM_C: bool = false,
    const DELAY_TMA_STORE: bool = false,
    const WARP_GROUPS: usize = 1,
>;

impl<const SC: usize, const SD: usize, const FRAG: usize, const REUSE: bool, const DELAY: bool> EpiloguePolicy
    for TmaWarpSpecialized<SC, SD, FRAG, REUSE, DELAY>
{
    const NAME: &'static str = "tma_warp_specialized";
    const KIND: PolicyKind = PolicyKind::TmaWarpSpecialized;
    const STAGES_C: usize = SC;
    const STAGES_D: usize = SD;
    const FRAGMENT_SIZE: usize = FRAG;
    const REUSE_SMEM_C: bool = REUSE;
    const DELAY_TMA_STORE: bool = DELAY;
}

impl<const SC: usize, const SD: usize, const FRAG: usize, const REUSE: bool, const DELAY: bool, const WG: usize>
    EpiloguePolicy for PtrArrayTmaWarpSpecialized<SC, SD, FRAG, REUSE, DELAY, WG>
{
    const NAME: &'static str = "ptr_array_tma_warp_specialized";
    const KIND: PolicyKind = PolicyKind::PtrArrayTmaWarpSpecialized;
    const STAGES_C: usize = SC;
    const STAGES_D: usize = SD;
    const FRAGMENT_SIZE: usize = FRAG;
    const REUSE_SMEM_C: bool = REUSE;
    const DELAY_TMA_STORE: bool = DELAY;
    const WARP_GROUPS: usize = WG;
}

/// Runtime name of a policy family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum PolicyKind {
    #[default]
    TmaWarpSpecialized,
    PtrArrayTmaWarpSpecialized,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_policy_defaults() {
        type Dense = TmaWarpSpecialized;
        assert_eq!(Dense::STAGES_C, 4);
        assert_eq!(Dense::STAGES_D, 2);
        assert!(!Dense::REUSE_SMEM_C);
        assert_eq!(Dense::WARP_GROUPS, 1);

        type Grouped = PtrArrayTmaWarpSpecialized<3, 1, 8, true, false, 2>;
        assert_eq!(Grouped::STAGES_C, 3);
        assert_eq!(Grouped::WARP_GROUPS, 2);
        assert_eq!(Grouped::KIND, PolicyKind::PtrArrayTmaWarpSpecialized);
    }

    #[test]
    fn test_policy_kind_serde() {
        let json = serde_json::to_string(&PolicyKind::PtrArrayTmaWarpSpecialized).unwrap();
        assert_eq!(json, "\"ptr_array_tma_warp_specialized\"");
    }
}
