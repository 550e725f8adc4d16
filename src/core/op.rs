use serde::{Deserialize, Serialize};

/// Runtime name of a catalog pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum PipelineKind {
    ScaledAcc,
    LinearCombination,
    LinCombEltAct,
    LinCombPerRowBias,
    LinCombPerColBias,
    LinCombPerRowBiasEltAct,
    LinCombPerColBiasEltAct,
    LinCombPerRowBiasEltActAux,
    LinCombPerColBiasEltActAux,
    PerRowLinCombPerRowBiasEltAct,
    PerColLinCombPerColBiasEltAct,
    PerColResAddPerColBiasEltAct,
    ScaledLinCombPerRowBiasEltAct,
    ScaledLinCombPerColBiasEltAct,
    ScaledLinCombPerRowBiasEltActAmaxAux,
    ScaledLinCombPerColBiasEltActAmaxAux,
    LinCombDeEltAct,
    LinCombDeEltActDePerRowBias,
    LinCombTopKSoftmaxCol { k: usize },
    LinearCombinationGroupedWgrad { groups: usize },
}

impl PipelineKind {
    pub fn uses_activation(self) -> bool {
        !matches!(
            self,
            Self::ScaledAcc
                | Self::LinearCombination
                | Self::LinCombPerRowBias
                | Self::LinCombPerColBias
                | Self::LinCombTopKSoftmaxCol { .. }
                | Self::LinearCombinationGroupedWgrad { .. }
        )
    }

    /// Backward pipelines take the gradient of the activation instead of the activation.
    pub fn is_backward(self) -> bool {
        matches!(self, Self::LinCombDeEltAct | Self::LinCombDeEltActDePerRowBias)
    }

    pub fn has_aux(self) -> bool {
        matches!(
            self,
            Self::LinCombPerRowBiasEltActAux
                | Self::LinCombPerColBiasEltActAux
                | Self::ScaledLinCombPerRowBiasEltActAmaxAux
                | Self::ScaledLinCombPerColBiasEltActAmaxAux
                | Self::LinCombDeEltAct
                | Self::LinCombDeEltActDePerRowBias
        )
    }
}

/// Elementwise activation applied by the activation-carrying pipelines. For backward
/// pipelines the same kind selects the matching gradient.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum ActivationKind {
    #[default]
    Identity,
    Relu,
    LeakyRelu { alpha: f32 },
    Clamp { lower: f32, upper: f32 },
    Sigmoid,
    Silu,
    Tanh,
    Gelu,
    GeluTaylor,
    HardSwish,
}

impl ActivationKind {
    pub fn name(self) -> &'static str {
        match self {
            Self::Identity => "identity",
            Self::Relu => "relu",
            Self::LeakyRelu { .. } => "leaky_relu",
            Self::Clamp { .. } => "clamp",
            Self::Sigmoid => "sigmoid",
            Self::Silu => "silu",
            Self::Tanh => "tanh",
            Self::Gelu => "gelu",
            Self::GeluTaylor => "gelu_taylor",
            Self::HardSwish => "hard_swish",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pipeline_kind_json() {
        let kind: PipelineKind = serde_json::from_str(r#"{"kind":"lin_comb_top_k_softmax_col","k":2}"#).unwrap();
        assert_eq!(kind, PipelineKind::LinCombTopKSoftmaxCol { k: 2 });
        assert!(!kind.uses_activation());
        assert!(PipelineKind::LinCombDeEltAct.is_backward());
        assert!(PipelineKind::ScaledLinCombPerRowBiasEltActAmaxAux.has_aux());
    }

    #[test]
    fn test_activation_kind_json() {
        let act: ActivationKind = serde_json::from_str(r#"{"kind":"leaky_relu","alpha":0.1}"#).unwrap();
        assert_eq!(act, ActivationKind::LeakyRelu { alpha: 0.1 });
        assert_eq!(act.name(), "leaky_relu");
    }
}
