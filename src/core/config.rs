use serde::{Deserialize, Serialize};
use tracing::warn;

pub const ENV_PARALLEL: &str = "TRACEA_EVT_PARALLEL";
pub const ENV_TILE_ORDER: &str = "TRACEA_EVT_TILE_ORDER";

/// Shared memory per SM on the target generation, in bytes.
pub const DEFAULT_SMEM_CAPACITY: usize = 232_448;

/// Bytes reserved per CTA for barriers and bookkeeping.
const MBAR_HELPER_BYTES: usize = 1024;

/// Order in which CTA tiles are issued.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TileOrder {
    #[default]
    RowMajor,
    ColumnMajor,
    Reversed,
}

impl TileOrder {
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "row_major" | "row" => Some(Self::RowMajor),
            "column_major" | "col_major" | "column" => Some(Self::ColumnMajor),
            "reversed" | "reverse" => Some(Self::Reversed),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct EpilogueConfig {
    /// Evaluate CTA tiles concurrently on the rayon pool.
    pub parallel: bool,
    pub tile_order: TileOrder,
    /// Shared memory budget in bytes, used for stage sizing.
    pub smem_capacity: usize,
    /// Target CTAs per SM.
    pub occupancy: usize,
}

impl Default for EpilogueConfig {
    fn default() -> Self {
        Self {
            parallel: true,
            tile_order: TileOrder::RowMajor,
            smem_capacity: DEFAULT_SMEM_CAPACITY,
            occupancy: 1,
        }
    }
}

/// Stage counts that fit a shared memory budget.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StagePlan {
    pub mainloop_stages: usize,
    pub epilogue_stages: usize,
}

impl EpilogueConfig {
    pub fn sequential() -> Self {
        Self { parallel: false, ..Self::default() }
    }

    /// Default configuration with `TRACEA_EVT_*` environment overrides applied.
    pub fn from_env() -> Self {
        Self::default().with_env_overrides()
    }

    pub fn with_env_overrides(self) -> Self {
        let parallel = std::env::var(ENV_PARALLEL).ok();
        let order = std::env::var(ENV_TILE_ORDER).ok();
        self.with_overrides(parallel.as_deref(), order.as_deref())
    }

    /// Applies raw override values. Malformed values are ignored with a warning.
    pub fn with_overrides(mut self, parallel: Option<&str>, tile_order: Option<&str>) -> Self {
        if let Some(raw) = parallel {
            match raw.trim() {
                "1" | "true" | "on" => self.parallel = true,
                "0" | "false" | "off" => self.parallel = false,
                other => warn!(var = ENV_PARALLEL, value = other, "ignoring malformed override"),
            }
        }
        if let Some(raw) = tile_order {
            match TileOrder::parse(raw) {
                Some(order) => self.tile_order = order,
                None => warn!(var = ENV_TILE_ORDER, value = raw, "ignoring malformed override"),
            }
        }
        self
    }

    /// Splits the shared memory budget between mainloop operand stages and epilogue stages.
    ///
    /// The epilogue starts with two stages; the mainloop takes as many operand stages as fit
    /// after that, and whatever remains goes back to the epilogue.
    pub fn epilogue_stages(&self, ab_bytes_per_stage: usize, c_bytes_per_stage: usize) -> StagePlan {
        let slots = self.occupancy.max(1) + 1;
        let base_epi = 2;
        let reserved = slots * (MBAR_HELPER_BYTES + c_bytes_per_stage * base_epi);
        let available = self.smem_capacity.saturating_sub(reserved);
        let mainloop_stages = if ab_bytes_per_stage == 0 { 0 } else { available / ab_bytes_per_stage };
        let leftover = available - mainloop_stages * ab_bytes_per_stage;
        let extra = if c_bytes_per_stage == 0 { 0 } else { leftover / (slots * c_bytes_per_stage) };
        StagePlan { mainloop_stages, epilogue_stages: base_epi + extra }
    }
}
