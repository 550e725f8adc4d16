//! Runtime selection of a fused epilogue from a serializable description.
//!
//! Catalog pipelines are resolved at compile time. The registry instantiates a fixed set of
//! them behind [`EpilogueKernel`] so a pipeline can be chosen from JSON:
//!
//! - compute, scalar and bias elements are `f32`, and C is read as `f32`,
//! - the aux tensor takes the output element and is row-major unless `aux` and
//!   `aux_layout` say otherwise; it may also be a `Bit` mask,
//! - CTA tile `64x64`, epilogue subtile `16x64`,
//! - the ptr-array policy serves `linear_combination` and `lin_comb_elt_act` only,
//! - backward pipelines take the gradient of `relu`, `silu` or `gelu`.
//!
//! Anything else is reported as [`EpilogueError::UnsupportedPipeline`].

use std::any::Any;

use half::{bf16, f16};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::catalog::backward::{DeEltActArgs, DeEltActDeBiasArgs};
use crate::catalog::bias::{LinCombBiasArgs, LinCombBiasEltActArgs, LinCombBiasEltActAuxArgs, VecLinCombBiasEltActArgs};
use crate::catalog::linear::{
    LinCombArgs, LinCombEltActArgs, LinCombEltActPtrArrayArgs, LinCombPtrArrayArgs, ScaledAccArgs,
};
use crate::catalog::scaled::{ScaledAmaxAuxArgs, ScaledLinCombBiasEltActArgs};
use crate::catalog::topk::TopKArgs;
use crate::catalog::{
    LinCombDeEltAct, LinCombDeEltActDePerRowBias, LinCombEltAct, LinCombPerColBias, LinCombPerColBiasEltAct,
    LinCombPerColBiasEltActAux, LinCombPerRowBias, LinCombPerRowBiasEltAct, LinCombPerRowBiasEltActAux,
    LinCombTopKSoftmaxCol, LinearCombination, LinearCombinationGroupedWgrad, PerColLinCombPerColBiasEltAct,
    PerColResAddPerColBiasEltAct, PerRowLinCombPerRowBiasEltAct, ScaledAcc, ScaledLinCombPerColBiasEltAct,
    ScaledLinCombPerColBiasEltActAmaxAux, ScaledLinCombPerRowBiasEltAct, ScaledLinCombPerRowBiasEltActAmaxAux,
};
use crate::core::config::EpilogueConfig;
use crate::core::element::{Bit, Element, Float8E4M3, Float8E5M2, NumericKind};
use crate::core::error::EpilogueError;
use crate::core::memory::{DeviceBuffer, TensorRef};
use crate::core::op::{ActivationKind, PipelineKind};
use crate::core::shape::{ProblemShape, Shape, TileShape};
use crate::nodes::aux::{ColumnMajor, RowMajor};
use crate::policy::dispatch::FusionCallbacks;
use crate::policy::epilogue::{PolicyKind, PtrArrayTmaWarpSpecialized, TmaWarpSpecialized};
use crate::runtime::epilogue::{make_epilogue, Epilogue, SourceTensor};
use crate::runtime::mainloop::AccumulatorSource;
use crate::semantic::functor::{
    Clamp, ClampArgs, DGELU, DReLU, DSiLU, GELU, GeluTaylor, HardSwish, Identity, LeakyReLU, LeakyReLUArgs, ReLU,
    SiLU, Sigmoid, Tanh,
};
use crate::semantic::visitor::Visitor;

pub type RegistryCta = Shape<64, 64, 1>;
pub type RegistryEpi = Shape<16, 64, 1>;

/// Memory order of the aux tensor when no stride is bound.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum AuxLayout {
    #[default]
    RowMajor,
    ColumnMajor,
}

/// Serializable description of a fused epilogue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EpilogueSpec {
    pub policy: PolicyKind,
    pub pipeline: PipelineKind,
    pub activation: ActivationKind,
    /// Element of D.
    pub output: NumericKind,
    /// Element of the aux tensor. `None` uses `output`.
    pub aux: Option<NumericKind>,
    pub aux_layout: AuxLayout,
    pub alpha: f32,
    pub beta: f32,
    pub scale_a: f32,
    pub scale_b: f32,
    pub scale_c: f32,
    pub scale_d: f32,
    pub scale_aux: f32,
    pub config: EpilogueConfig,
}

impl Default for EpilogueSpec {
    fn default() -> Self {
        Self {
            policy: PolicyKind::default(),
            pipeline: PipelineKind::LinearCombination,
            activation: ActivationKind::Identity,
            output: NumericKind::F32,
            aux: None,
            aux_layout: AuxLayout::RowMajor,
            alpha: 1.0,
            beta: 0.0,
            scale_a: 1.0,
            scale_b: 1.0,
            scale_c: 1.0,
            scale_d: 1.0,
            scale_aux: 1.0,
            config: EpilogueConfig::default(),
        }
    }
}

impl EpilogueSpec {
    pub fn new(pipeline: PipelineKind, output: NumericKind) -> Self {
        Self { pipeline, output, ..Self::default() }
    }

    pub fn aux_kind(&self) -> NumericKind {
        self.aux.unwrap_or(self.output)
    }

    pub fn describe(&self) -> String {
        let pipeline = serde_json::to_value(self.pipeline)
            .ok()
            .and_then(|v| v.get("kind").and_then(|k| k.as_str()).map(str::to_owned))
            .unwrap_or_else(|| format!("{:?}", self.pipeline));
        let mut name = if self.pipeline.uses_activation() {
            format!("{}<{}>/{}", pipeline, self.activation.name(), self.output.name())
        } else {
            format!("{}/{}", pipeline, self.output.name())
        };
        if self.aux_kind() != self.output {
            name.push_str(&format!("+aux:{}", self.aux_kind().name()));
        }
        name
    }
}

/// A device buffer of any supported storage element.
#[derive(Debug, Clone)]
pub enum AnyBuffer {
    F64(DeviceBuffer<f64>),
    F32(DeviceBuffer<f32>),
    F16(DeviceBuffer<f16>),
    BF16(DeviceBuffer<bf16>),
    E4M3(DeviceBuffer<Float8E4M3>),
    E5M2(DeviceBuffer<Float8E5M2>),
    /// Aux-only.
    Bit(DeviceBuffer<Bit>),
}

impl AnyBuffer {
    pub fn kind(&self) -> NumericKind {
        match self {
            Self::F64(_) => NumericKind::F64,
            Self::F32(_) => NumericKind::F32,
            Self::F16(_) => NumericKind::F16,
            Self::BF16(_) => NumericKind::BF16,
            Self::E4M3(_) => NumericKind::E4M3,
            Self::E5M2(_) => NumericKind::E5M2,
            Self::Bit(_) => NumericKind::Bit,
        }
    }

    fn as_any(&self) -> &dyn Any {
        match self {
            Self::F64(b) => b,
            Self::F32(b) => b,
            Self::F16(b) => b,
            Self::BF16(b) => b,
            Self::E4M3(b) => b,
            Self::E5M2(b) => b,
            Self::Bit(b) => b,
        }
    }

    pub fn downcast<E: Element>(&self, tensor: &'static str) -> Result<&DeviceBuffer<E>, EpilogueError> {
        self.as_any().downcast_ref::<DeviceBuffer<E>>().ok_or(EpilogueError::ElementMismatch {
            tensor,
            expected: E::KIND.name(),
            actual: self.kind().name(),
        })
    }
}

/// A strided tensor of any supported storage element.
#[derive(Debug, Clone)]
pub enum AnyTensor {
    F64(TensorRef<f64>),
    F32(TensorRef<f32>),
    F16(TensorRef<f16>),
    BF16(TensorRef<bf16>),
    E4M3(TensorRef<Float8E4M3>),
    E5M2(TensorRef<Float8E5M2>),
}

impl AnyTensor {
    /// Zeroed packed row-major tensor for a problem.
    pub fn row_major(kind: NumericKind, problem: &ProblemShape) -> Result<Self, EpilogueError> {
        Ok(match kind {
            NumericKind::F64 => Self::F64(TensorRef::row_major(problem)),
            NumericKind::F32 => Self::F32(TensorRef::row_major(problem)),
            NumericKind::F16 => Self::F16(TensorRef::row_major(problem)),
            NumericKind::BF16 => Self::BF16(TensorRef::row_major(problem)),
            NumericKind::E4M3 => Self::E4M3(TensorRef::row_major(problem)),
            NumericKind::E5M2 => Self::E5M2(TensorRef::row_major(problem)),
            NumericKind::Bit => {
                return Err(EpilogueError::InvalidConfig("bit tensors are aux-only".to_string()));
            }
        })
    }

    pub fn kind(&self) -> NumericKind {
        match self {
            Self::F64(_) => NumericKind::F64,
            Self::F32(_) => NumericKind::F32,
            Self::F16(_) => NumericKind::F16,
            Self::BF16(_) => NumericKind::BF16,
            Self::E4M3(_) => NumericKind::E4M3,
            Self::E5M2(_) => NumericKind::E5M2,
        }
    }

    fn as_any(&self) -> &dyn Any {
        match self {
            Self::F64(t) => t,
            Self::F32(t) => t,
            Self::F16(t) => t,
            Self::BF16(t) => t,
            Self::E4M3(t) => t,
            Self::E5M2(t) => t,
        }
    }

    pub fn downcast<E: Element>(&self, tensor: &'static str) -> Result<&TensorRef<E>, EpilogueError> {
        self.as_any().downcast_ref::<TensorRef<E>>().ok_or(EpilogueError::ElementMismatch {
            tensor,
            expected: E::KIND.name(),
            actual: self.kind().name(),
        })
    }

    pub fn as_source(&self) -> &dyn SourceTensor {
        match self {
            Self::F64(t) => t,
            Self::F32(t) => t,
            Self::F16(t) => t,
            Self::BF16(t) => t,
            Self::E4M3(t) => t,
            Self::E5M2(t) => t,
        }
    }

    /// Values widened to f64.
    pub fn to_f64_vec(&self) -> Vec<f64> {
        match self {
            Self::F64(t) => t.buffer.to_f64_vec(),
            Self::F32(t) => t.buffer.to_f64_vec(),
            Self::F16(t) => t.buffer.to_f64_vec(),
            Self::BF16(t) => t.buffer.to_f64_vec(),
            Self::E4M3(t) => t.buffer.to_f64_vec(),
            Self::E5M2(t) => t.buffer.to_f64_vec(),
        }
    }
}

/// Device tensors a pipeline reads or writes besides C and D.
#[derive(Debug, Clone, Default)]
pub struct EpilogueBindings {
    /// Per-batch scalars, or per-row / per-column vectors for the vector-scaled pipelines.
    pub alpha_ptr: Option<DeviceBuffer<f32>>,
    pub beta_ptr: Option<DeviceBuffer<f32>>,
    /// One scalar buffer per group, ptr-array policy only.
    pub alpha_ptr_array: Option<Vec<DeviceBuffer<f32>>>,
    pub beta_ptr_array: Option<Vec<DeviceBuffer<f32>>>,
    pub bias: Option<DeviceBuffer<f32>>,
    /// Pre-activation output for forward pipelines, forward pre-activation input for backward ones.
    /// Its element must match [`EpilogueSpec::aux_kind`].
    pub aux: Option<AnyBuffer>,
    pub amax_d: Option<DeviceBuffer<f32>>,
    pub amax_aux: Option<DeviceBuffer<f32>>,
    pub dbias: Option<DeviceBuffer<f32>>,
}

/// A type-erased fused epilogue.
pub trait EpilogueKernel: Send + Sync {
    fn name(&self) -> &str;

    fn needs_source(&self) -> bool;

    fn output_kind(&self) -> NumericKind;

    fn can_implement(&self, problem: &ProblemShape) -> Result<(), EpilogueError>;

    fn run(
        &self,
        mainloop: &dyn AccumulatorSource,
        source: Option<&dyn SourceTensor>,
        output: &AnyTensor,
    ) -> Result<(), EpilogueError>;
}

struct Kernel<V: Visitor> {
    name: String,
    epilogue: Epilogue<RegistryCta, RegistryEpi, V>,
}

impl<V: Visitor + 'static> EpilogueKernel for Kernel<V> {
    fn name(&self) -> &str {
        &self.name
    }

    fn needs_source(&self) -> bool {
        self.epilogue.needs_source()
    }

    fn output_kind(&self) -> NumericKind {
        V::Output::KIND
    }

    fn can_implement(&self, problem: &ProblemShape) -> Result<(), EpilogueError> {
        self.epilogue.can_implement(problem)
    }

    fn run(
        &self,
        mainloop: &dyn AccumulatorSource,
        source: Option<&dyn SourceTensor>,
        output: &AnyTensor,
    ) -> Result<(), EpilogueError> {
        let output = output.downcast::<V::Output>("D")?;
        self.epilogue.run(mainloop, source, output)
    }
}

fn boxed<Policy, Tag>(
    name: String,
    args: Tag::Arguments,
    config: EpilogueConfig,
) -> Result<Box<dyn EpilogueKernel>, EpilogueError>
where
    Tag: FusionCallbacks<Policy, RegistryCta, RegistryEpi>,
    Tag::Impl: 'static,
{
    let epilogue = make_epilogue::<Policy, Tag, RegistryCta, RegistryEpi>(&args, config);
    debug!(name = %name, cta = ?RegistryCta::dims(), epi = ?RegistryEpi::dims(), "built epilogue kernel");
    Ok(Box::new(Kernel { name, epilogue }))
}

fn unsupported(what: String) -> EpilogueError {
    warn!(what = %what, "no registered epilogue");
    EpilogueError::UnsupportedPipeline(what)
}

macro_rules! with_element {
    ($role:literal, $kind:expr, $ty:ident => $body:expr) => {
        match $kind {
            NumericKind::F32 => {
                type $ty = f32;
                $body
            }
            NumericKind::F16 => {
                type $ty = f16;
                $body
            }
            NumericKind::BF16 => {
                type $ty = bf16;
                $body
            }
            NumericKind::E4M3 => {
                type $ty = Float8E4M3;
                $body
            }
            NumericKind::E5M2 => {
                type $ty = Float8E5M2;
                $body
            }
            other => Err(unsupported(format!("{} element {}", $role, other.name()))),
        }
    };
}

macro_rules! with_output {
    ($kind:expr, $out:ident => $body:expr) => {
        with_element!("output", $kind, $out => $body)
    };
}

macro_rules! with_aux_layout {
    ($layout_kind:expr, $layout:ident => $body:expr) => {
        match $layout_kind {
            AuxLayout::RowMajor => {
                type $layout = RowMajor;
                $body
            }
            AuxLayout::ColumnMajor => {
                type $layout = ColumnMajor;
                $body
            }
        }
    };
}

/// Aux element and layout tag of a spec. Unlike D, the aux tensor may be a bit mask.
macro_rules! with_aux {
    ($spec:expr, $aux:ident, $layout:ident => $body:expr) => {
        match $spec.aux_kind() {
            NumericKind::Bit => {
                type $aux = Bit;
                with_aux_layout!($spec.aux_layout, $layout => $body)
            }
            kind => with_element!("aux", kind, $aux => with_aux_layout!($spec.aux_layout, $layout => $body)),
        }
    };
}

macro_rules! with_activation {
    ($kind:expr, $act:ident, $args:ident => $body:expr) => {
        match $kind {
            ActivationKind::Identity => {
                type $act = Identity;
                let $args = ();
                $body
            }
            ActivationKind::Relu => {
                type $act = ReLU;
                let $args = ();
                $body
            }
            ActivationKind::LeakyRelu { alpha } => {
                type $act = LeakyReLU;
                let $args = LeakyReLUArgs { leaky_alpha: alpha };
                $body
            }
            ActivationKind::Clamp { lower, upper } => {
                type $act = Clamp;
                let $args = ClampArgs { lower, upper };
                $body
            }
            ActivationKind::Sigmoid => {
                type $act = Sigmoid;
                let $args = ();
                $body
            }
            ActivationKind::Silu => {
                type $act = SiLU;
                let $args = ();
                $body
            }
            ActivationKind::Tanh => {
                type $act = Tanh;
                let $args = ();
                $body
            }
            ActivationKind::Gelu => {
                type $act = GELU;
                let $args = ();
                $body
            }
            ActivationKind::GeluTaylor => {
                type $act = GeluTaylor;
                let $args = ();
                $body
            }
            ActivationKind::HardSwish => {
                type $act = HardSwish;
                let $args = ();
                $body
            }
        }
    };
}

macro_rules! with_gradient {
    ($kind:expr, $act:ident => $body:expr) => {
        match $kind {
            ActivationKind::Relu => {
                type $act = DReLU;
                $body
            }
            ActivationKind::Silu => {
                type $act = DSiLU;
                $body
            }
            ActivationKind::Gelu => {
                type $act = DGELU;
                $body
            }
            other => Err(unsupported(format!("gradient of {}", other.name()))),
        }
    };
}

fn lincomb(spec: &EpilogueSpec, b: &EpilogueBindings) -> LinCombArgs<f32> {
    LinCombArgs {
        alpha_ptr: b.alpha_ptr.clone(),
        beta_ptr: b.beta_ptr.clone(),
        ..LinCombArgs::new(spec.alpha, spec.beta)
    }
}

fn lincomb_act<A: Clone + Default>(spec: &EpilogueSpec, b: &EpilogueBindings, activation: A) -> LinCombEltActArgs<f32, A> {
    LinCombEltActArgs {
        alpha_ptr: b.alpha_ptr.clone(),
        beta_ptr: b.beta_ptr.clone(),
        ..LinCombEltActArgs::new(spec.alpha, spec.beta, activation)
    }
}

fn lincomb_bias(spec: &EpilogueSpec, b: &EpilogueBindings) -> LinCombBiasArgs<f32, f32> {
    LinCombBiasArgs {
        alpha: spec.alpha,
        beta: spec.beta,
        alpha_ptr: b.alpha_ptr.clone(),
        beta_ptr: b.beta_ptr.clone(),
        bias_ptr: b.bias.clone(),
        ..Default::default()
    }
}

fn lincomb_bias_act<A: Default>(spec: &EpilogueSpec, b: &EpilogueBindings, activation: A) -> LinCombBiasEltActArgs<f32, f32, A> {
    LinCombBiasEltActArgs {
        alpha: spec.alpha,
        beta: spec.beta,
        alpha_ptr: b.alpha_ptr.clone(),
        beta_ptr: b.beta_ptr.clone(),
        bias_ptr: b.bias.clone(),
        activation,
        ..Default::default()
    }
}

fn lincomb_bias_act_aux<X: Element, A: Default>(
    spec: &EpilogueSpec,
    b: &EpilogueBindings,
    activation: A,
) -> Result<LinCombBiasEltActAuxArgs<f32, f32, X, A>, EpilogueError> {
    Ok(LinCombBiasEltActAuxArgs {
        alpha: spec.alpha,
        beta: spec.beta,
        alpha_ptr: b.alpha_ptr.clone(),
        beta_ptr: b.beta_ptr.clone(),
        bias_ptr: b.bias.clone(),
        activation,
        aux_ptr: aux_buffer::<X>(b)?,
        ..Default::default()
    })
}

fn vec_lincomb_bias_act<A: Default>(
    spec: &EpilogueSpec,
    b: &EpilogueBindings,
    activation: A,
) -> VecLinCombBiasEltActArgs<f32, f32, A> {
    VecLinCombBiasEltActArgs {
        alpha: spec.alpha,
        beta: spec.beta,
        alpha_ptr: b.alpha_ptr.clone(),
        beta_ptr: b.beta_ptr.clone(),
        bias_ptr: b.bias.clone(),
        activation,
        ..Default::default()
    }
}

fn scaled_lincomb<A: Default>(spec: &EpilogueSpec, b: &EpilogueBindings, activation: A) -> ScaledLinCombBiasEltActArgs<f32, f32, A> {
    ScaledLinCombBiasEltActArgs {
        alpha: spec.alpha,
        beta: spec.beta,
        scale_a: spec.scale_a,
        scale_b: spec.scale_b,
        scale_c: spec.scale_c,
        scale_d: spec.scale_d,
        alpha_ptr: b.alpha_ptr.clone(),
        beta_ptr: b.beta_ptr.clone(),
        bias_ptr: b.bias.clone(),
        activation,
        ..Default::default()
    }
}

fn scaled_amax_aux<X: Element, A: Default>(
    spec: &EpilogueSpec,
    b: &EpilogueBindings,
    activation: A,
) -> Result<ScaledAmaxAuxArgs<f32, f32, X, f32, A>, EpilogueError> {
    Ok(ScaledAmaxAuxArgs {
        alpha: spec.alpha,
        beta: spec.beta,
        scale_a: spec.scale_a,
        scale_b: spec.scale_b,
        scale_c: spec.scale_c,
        scale_d: spec.scale_d,
        scale_aux: spec.scale_aux,
        alpha_ptr: b.alpha_ptr.clone(),
        beta_ptr: b.beta_ptr.clone(),
        bias_ptr: b.bias.clone(),
        activation,
        amax_d_ptr: b.amax_d.clone(),
        amax_aux_ptr: b.amax_aux.clone(),
        aux_ptr: aux_buffer::<X>(b)?,
        ..Default::default()
    })
}

fn de_elt_act<X: Element, A: Default>(
    spec: &EpilogueSpec,
    b: &EpilogueBindings,
) -> Result<DeEltActArgs<f32, X, A>, EpilogueError> {
    let aux = aux_buffer::<X>(b)?.ok_or(EpilogueError::MissingTensor("aux"))?;
    Ok(DeEltActArgs {
        alpha: spec.alpha,
        beta: spec.beta,
        alpha_ptr: b.alpha_ptr.clone(),
        beta_ptr: b.beta_ptr.clone(),
        aux_ptr: Some(aux),
        ..Default::default()
    })
}

fn de_elt_act_dbias<X: Element, A: Default>(
    spec: &EpilogueSpec,
    b: &EpilogueBindings,
) -> Result<DeEltActDeBiasArgs<f32, X, f32, A>, EpilogueError> {
    let aux = aux_buffer::<X>(b)?.ok_or(EpilogueError::MissingTensor("aux"))?;
    let dbias = b.dbias.clone().ok_or(EpilogueError::MissingTensor("dbias"))?;
    Ok(DeEltActDeBiasArgs {
        alpha: spec.alpha,
        beta: spec.beta,
        alpha_ptr: b.alpha_ptr.clone(),
        beta_ptr: b.beta_ptr.clone(),
        aux_ptr: Some(aux),
        dbias_ptr: Some(dbias),
        ..Default::default()
    })
}

fn topk(spec: &EpilogueSpec, b: &EpilogueBindings) -> TopKArgs<f32> {
    TopKArgs { alpha: spec.alpha, beta: spec.beta, alpha_ptr: b.alpha_ptr.clone(), beta_ptr: b.beta_ptr.clone() }
}

fn lincomb_ptr_array(spec: &EpilogueSpec, b: &EpilogueBindings) -> LinCombPtrArrayArgs<f32> {
    LinCombPtrArrayArgs {
        alpha: spec.alpha,
        beta: spec.beta,
        alpha_ptr: b.alpha_ptr.clone(),
        beta_ptr: b.beta_ptr.clone(),
        alpha_ptr_array: b.alpha_ptr_array.clone(),
        beta_ptr_array: b.beta_ptr_array.clone(),
        ..Default::default()
    }
}

fn lincomb_act_ptr_array<A: Default>(
    spec: &EpilogueSpec,
    b: &EpilogueBindings,
    activation: A,
) -> LinCombEltActPtrArrayArgs<f32, A> {
    LinCombEltActPtrArrayArgs {
        alpha: spec.alpha,
        beta: spec.beta,
        alpha_ptr: b.alpha_ptr.clone(),
        beta_ptr: b.beta_ptr.clone(),
        alpha_ptr_array: b.alpha_ptr_array.clone(),
        beta_ptr_array: b.beta_ptr_array.clone(),
        activation,
        ..Default::default()
    }
}

fn aux_buffer<X: Element>(b: &EpilogueBindings) -> Result<Option<DeviceBuffer<X>>, EpilogueError> {
    b.aux.as_ref().map(|aux| aux.downcast::<X>("aux").cloned()).transpose()
}

/// Instantiates the epilogue a spec describes, with its tensors bound.
pub fn build_epilogue(
    spec: &EpilogueSpec,
    bindings: &EpilogueBindings,
) -> Result<Box<dyn EpilogueKernel>, EpilogueError> {
    debug!(pipeline = %spec.describe(), policy = ?spec.policy, "building epilogue");
    match spec.policy {
        PolicyKind::TmaWarpSpecialized => build_warp_specialized(spec, bindings),
        PolicyKind::PtrArrayTmaWarpSpecialized => build_ptr_array(spec, bindings),
    }
}

fn build_warp_specialized(
    spec: &EpilogueSpec,
    b: &EpilogueBindings,
) -> Result<Box<dyn EpilogueKernel>, EpilogueError> {
    type P = TmaWarpSpecialized;
    let name = spec.describe();
    let config = spec.config.clone();

    match spec.pipeline {
        PipelineKind::ScaledAcc => with_output!(spec.output, Out => {
            let args = ScaledAccArgs { alpha: spec.alpha, alpha_ptr: b.alpha_ptr.clone(), ..Default::default() };
            boxed::<P, ScaledAcc<Out>>(name, args, config)
        }),
        PipelineKind::LinearCombination => with_output!(spec.output, Out => {
            boxed::<P, LinearCombination<Out, f32, f32>>(name, lincomb(spec, b), config)
        }),
        PipelineKind::LinCombEltAct => with_activation!(spec.activation, Act, act => with_output!(spec.output, Out => {
            boxed::<P, LinCombEltAct<Act, Out, f32, f32>>(name, lincomb_act(spec, b, act), config)
        })),
        PipelineKind::LinCombPerRowBias => with_output!(spec.output, Out => {
            boxed::<P, LinCombPerRowBias<Out, f32, f32, f32>>(name, lincomb_bias(spec, b), config)
        }),
        PipelineKind::LinCombPerColBias => with_output!(spec.output, Out => {
            boxed::<P, LinCombPerColBias<Out, f32, f32, f32>>(name, lincomb_bias(spec, b), config)
        }),
        PipelineKind::LinCombPerRowBiasEltAct => with_activation!(spec.activation, Act, act => with_output!(spec.output, Out => {
            boxed::<P, LinCombPerRowBiasEltAct<Act, Out, f32, f32, f32>>(name, lincomb_bias_act(spec, b, act), config)
        })),
        PipelineKind::LinCombPerColBiasEltAct => with_activation!(spec.activation, Act, act => with_output!(spec.output, Out => {
            boxed::<P, LinCombPerColBiasEltAct<Act, Out, f32, f32, f32>>(name, lincomb_bias_act(spec, b, act), config)
        })),
        PipelineKind::LinCombPerRowBiasEltActAux => with_activation!(spec.activation, Act, act => with_output!(spec.output, Out => with_aux!(spec, Aux, L => {
            let args = lincomb_bias_act_aux::<Aux, _>(spec, b, act)?;
            boxed::<P, LinCombPerRowBiasEltActAux<L, Act, Out, f32, Aux, f32, f32>>(name, args, config)
        }))),
        PipelineKind::LinCombPerColBiasEltActAux => with_activation!(spec.activation, Act, act => with_output!(spec.output, Out => with_aux!(spec, Aux, L => {
            let args = lincomb_bias_act_aux::<Aux, _>(spec, b, act)?;
            boxed::<P, LinCombPerColBiasEltActAux<L, Act, Out, f32, Aux, f32, f32>>(name, args, config)
        }))),
        PipelineKind::PerRowLinCombPerRowBiasEltAct => with_activation!(spec.activation, Act, act => with_output!(spec.output, Out => {
            boxed::<P, PerRowLinCombPerRowBiasEltAct<Act, Out, f32, f32, f32>>(name, vec_lincomb_bias_act(spec, b, act), config)
        })),
        PipelineKind::PerColLinCombPerColBiasEltAct => with_activation!(spec.activation, Act, act => with_output!(spec.output, Out => {
            boxed::<P, PerColLinCombPerColBiasEltAct<Act, Out, f32, f32, f32>>(name, vec_lincomb_bias_act(spec, b, act), config)
        })),
        PipelineKind::PerColResAddPerColBiasEltAct => with_activation!(spec.activation, Act, act => with_output!(spec.output, Out => {
            boxed::<P, PerColResAddPerColBiasEltAct<Act, Out, f32, f32, f32>>(name, vec_lincomb_bias_act(spec, b, act), config)
        })),
        PipelineKind::ScaledLinCombPerRowBiasEltAct => with_activation!(spec.activation, Act, act => with_output!(spec.output, Out => {
            boxed::<P, ScaledLinCombPerRowBiasEltAct<Act, Out, f32, f32, f32>>(name, scaled_lincomb(spec, b, act), config)
        })),
        PipelineKind::ScaledLinCombPerColBiasEltAct => with_activation!(spec.activation, Act, act => with_output!(spec.output, Out => {
            boxed::<P, ScaledLinCombPerColBiasEltAct<Act, Out, f32, f32, f32>>(name, scaled_lincomb(spec, b, act), config)
        })),
        PipelineKind::ScaledLinCombPerRowBiasEltActAmaxAux => with_activation!(spec.activation, Act, act => with_output!(spec.output, Out => with_aux!(spec, Aux, L => {
            let args = scaled_amax_aux::<Aux, _>(spec, b, act)?;
            boxed::<P, ScaledLinCombPerRowBiasEltActAmaxAux<L, Act, Out, f32, Aux, f32, f32, f32>>(name, args, config)
        }))),
        PipelineKind::ScaledLinCombPerColBiasEltActAmaxAux => with_activation!(spec.activation, Act, act => with_output!(spec.output, Out => with_aux!(spec, Aux, L => {
            let args = scaled_amax_aux::<Aux, _>(spec, b, act)?;
            boxed::<P, ScaledLinCombPerColBiasEltActAmaxAux<L, Act, Out, f32, Aux, f32, f32, f32>>(name, args, config)
        }))),
        PipelineKind::LinCombDeEltAct => with_gradient!(spec.activation, DAct => with_output!(spec.output, Out => with_aux!(spec, Aux, L => {
            let args = de_elt_act::<Aux, ()>(spec, b)?;
            boxed::<P, LinCombDeEltAct<L, DAct, Out, f32, Aux, f32>>(name, args, config)
        }))),
        PipelineKind::LinCombDeEltActDePerRowBias => with_gradient!(spec.activation, DAct => with_output!(spec.output, Out => with_aux!(spec, Aux, L => {
            let args = de_elt_act_dbias::<Aux, ()>(spec, b)?;
            boxed::<P, LinCombDeEltActDePerRowBias<L, DAct, Out, f32, Aux, f32, f32>>(name, args, config)
        }))),
        PipelineKind::LinCombTopKSoftmaxCol { k } => with_output!(spec.output, Out => match k {
            1 => boxed::<P, LinCombTopKSoftmaxCol<1, Out, f32, f32>>(name, topk(spec, b), config),
            2 => boxed::<P, LinCombTopKSoftmaxCol<2, Out, f32, f32>>(name, topk(spec, b), config),
            4 => boxed::<P, LinCombTopKSoftmaxCol<4, Out, f32, f32>>(name, topk(spec, b), config),
            other => Err(unsupported(format!("top-k softmax with k = {other}"))),
        }),
        PipelineKind::LinearCombinationGroupedWgrad { groups } => with_output!(spec.output, Out => match groups {
            1 => boxed::<P, LinearCombinationGroupedWgrad<1, Out, f32, f32>>(name, lincomb(spec, b), config),
            2 => boxed::<P, LinearCombinationGroupedWgrad<2, Out, f32, f32>>(name, lincomb(spec, b), config),
            4 => boxed::<P, LinearCombinationGroupedWgrad<4, Out, f32, f32>>(name, lincomb(spec, b), config),
            other => Err(unsupported(format!("grouped wgrad with {other} groups"))),
        }),
    }
}

fn build_ptr_array(spec: &EpilogueSpec, b: &EpilogueBindings) -> Result<Box<dyn EpilogueKernel>, EpilogueError> {
    type P = PtrArrayTmaWarpSpecialized;
    let name = spec.describe();
    let config = spec.config.clone();

    match spec.pipeline {
        PipelineKind::LinearCombination => with_output!(spec.output, Out => {
            boxed::<P, LinearCombination<Out, f32, f32>>(name, lincomb_ptr_array(spec, b), config)
        }),
        PipelineKind::LinCombEltAct => with_activation!(spec.activation, Act, act => with_output!(spec.output, Out => {
            boxed::<P, LinCombEltAct<Act, Out, f32, f32>>(name, lincomb_act_ptr_array(spec, b, act), config)
        })),
        other => Err(unsupported(format!("{other:?} under the ptr-array policy"))),
    }
}
