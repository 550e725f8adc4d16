//! Pointwise functors applied by compute nodes.
//!
//! A functor is a zero-sized type with an associated `Arguments` type (unit for functors
//! without parameters) and an `apply` over `N` values of the compute type.

use serde::{Deserialize, Serialize};

use crate::core::element::ComputeElement;

pub trait Functor<const N: usize>: Send + Sync + 'static {
    type Arguments: Clone + Default + Send + Sync + std::fmt::Debug;

    fn apply<C: ComputeElement>(args: &Self::Arguments, inputs: [C; N]) -> C;
}

macro_rules! binary_functor {
    ($(#[$doc:meta])* $name:ident, |$a:ident, $b:ident| $body:expr) => {
        $(#[$doc])*
        pub struct $name;

        impl Functor<2> for $name {
            type Arguments = ();

            #[inline]
            fn apply<C: ComputeElement>(_args: &(), [$a, $b]: [C; 2]) -> C {
                $body
            }
        }
    };
}

macro_rules! unary_functor {
    ($(#[$doc:meta])* $name:ident, |$x:ident| $body:expr) => {
        $(#[$doc])*
        pub struct $name;

        impl Functor<1> for $name {
            type Arguments = ();

            #[inline]
            fn apply<C: ComputeElement>(_args: &(), [$x]: [C; 1]) -> C {
                $body
            }
        }
    };
}

binary_functor!(Multiplies, |a, b| a * b);
binary_functor!(Plus, |a, b| a + b);
binary_functor!(Minus, |a, b| a - b);
binary_functor!(
    /// NaN-propagating maximum.
    Maximum,
    |a, b| if a.is_nan() || b.is_nan() { C::nan() } else { a.max(b) }
);
binary_functor!(
    /// NaN-propagating minimum.
    Minimum,
    |a, b| if a.is_nan() || b.is_nan() { C::nan() } else { a.min(b) }
);
binary_functor!(
    /// Returns its first input; the second is evaluated but ignored.
    First,
    |a, _b| a
);

/// `a * b + c`, fused.
pub struct MultiplyAdd;

impl Functor<3> for MultiplyAdd {
    type Arguments = ();

    #[inline]
    fn apply<C: ComputeElement>(_args: &(), [a, b, c]: [C; 3]) -> C {
        a.mul_add(b, c)
    }
}

unary_functor!(Identity, |x| x);
unary_functor!(ReLU, |x| if x > C::zero() { x } else if x.is_nan() { x } else { C::zero() });
unary_functor!(Sigmoid, |x| sigmoid(x));
unary_functor!(SiLU, |x| x * sigmoid(x));
unary_functor!(Tanh, |x| x.tanh());
unary_functor!(
    /// Exact GELU, `x * Phi(x)`.
    GELU,
    |x| x * C::lit(0.5) * (C::one() + (x * C::lit(std::f64::consts::FRAC_1_SQRT_2)).erf())
);
unary_functor!(
    /// GELU with the tanh approximation.
    GeluTaylor,
    |x| {
        let k0 = C::lit(0.797_884_560_802_865_4);
        let k1 = C::lit(0.044_715);
        C::lit(0.5) * x * (C::one() + (k0 * (x + k1 * x * x * x)).tanh())
    }
);
unary_functor!(
    HardSwish,
    |x| x * (x + C::lit(3.0)).max(C::zero()).min(C::lit(6.0)) / C::lit(6.0)
);

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LeakyReLUArgs {
    pub leaky_alpha: f32,
}

impl Default for LeakyReLUArgs {
    fn default() -> Self {
        Self { leaky_alpha: 0.0 }
    }
}

pub struct LeakyReLU;

impl Functor<1> for LeakyReLU {
    type Arguments = LeakyReLUArgs;

    #[inline]
    fn apply<C: ComputeElement>(args: &LeakyReLUArgs, [x]: [C; 1]) -> C {
        if x > C::zero() {
            x
        } else {
            x * C::lit(args.leaky_alpha as f64)
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ClampArgs {
    pub lower: f32,
    pub upper: f32,
}

impl Default for ClampArgs {
    fn default() -> Self {
        Self { lower: f32::NEG_INFINITY, upper: f32::INFINITY }
    }
}

pub struct Clamp;

impl Functor<1> for Clamp {
    type Arguments = ClampArgs;

    #[inline]
    fn apply<C: ComputeElement>(args: &ClampArgs, [x]: [C; 1]) -> C {
        if x.is_nan() {
            return x;
        }
        x.max(C::lit(args.lower as f64)).min(C::lit(args.upper as f64))
    }
}

// Gradients of activations: inputs are (incoming gradient, pre-activation value).

binary_functor!(
    DReLU,
    |grad, z| if z > C::zero() { grad } else { C::zero() }
);
binary_functor!(
    DSiLU,
    |grad, z| {
        let s = sigmoid(z);
        grad * s * (C::one() + z * (C::one() - s))
    }
);
binary_functor!(
    DGELU,
    |grad, z| {
        let cdf = C::lit(0.5) * (C::one() + (z * C::lit(std::f64::consts::FRAC_1_SQRT_2)).erf());
        let pdf = (-(z * z) * C::lit(0.5)).exp() * C::lit(0.398_942_280_401_432_7);
        grad * (cdf + z * pdf)
    }
);

/// Associative combine used by reduction nodes. `identity` is the fold seed.
pub trait ReduceFn: Send + Sync + 'static {
    fn identity<C: ComputeElement>() -> C;
    fn reduce<C: ComputeElement>(acc: C, value: C) -> C;
}

pub struct ReducePlus;
/// NaN-propagating maximum.
pub struct ReduceMax;
/// Maximum of absolute values; NaN-propagating.
pub struct ReduceMaxAbs;

impl ReduceFn for ReducePlus {
    fn identity<C: ComputeElement>() -> C {
        C::zero()
    }
    #[inline]
    fn reduce<C: ComputeElement>(acc: C, value: C) -> C {
        acc + value
    }
}

impl ReduceFn for ReduceMax {
    fn identity<C: ComputeElement>() -> C {
        C::neg_infinity()
    }
    #[inline]
    fn reduce<C: ComputeElement>(acc: C, value: C) -> C {
        Maximum::apply(&(), [acc, value])
    }
}

impl ReduceFn for ReduceMaxAbs {
    fn identity<C: ComputeElement>() -> C {
        C::zero()
    }
    #[inline]
    fn reduce<C: ComputeElement>(acc: C, value: C) -> C {
        Maximum::apply(&(), [acc, value.abs()])
    }
}

/// Combine applied atomically when a tile merges its partial result into global memory.
pub trait AtomicFn: Send + Sync + 'static {
    fn combine(current: f64, value: f64) -> f64;
}

pub struct AtomicAdd;
/// NaN-propagating atomic maximum.
pub struct AtomicMaximum;

impl AtomicFn for AtomicAdd {
    fn combine(current: f64, value: f64) -> f64 {
        current + value
    }
}

impl AtomicFn for AtomicMaximum {
    fn combine(current: f64, value: f64) -> f64 {
        Maximum::apply(&(), [current, value])
    }
}

#[inline]
fn sigmoid<C: ComputeElement>(x: C) -> C {
    C::one() / (C::one() + (-x).exp())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_multiply_add_is_fused() {
        let v: f32 = MultiplyAdd::apply(&(), [2.0, 3.0, 1.0]);
        assert_eq!(v, 7.0);
    }

    #[test]
    fn test_activation_values() {
        assert_eq!(ReLU::apply(&(), [-2.0f32]), 0.0);
        assert_eq!(ReLU::apply(&(), [2.0f32]), 2.0);
        assert!((Sigmoid::apply(&(), [0.0f64]) - 0.5).abs() < 1e-12);
        assert!((GELU::apply(&(), [1.0f64]) - 0.841_344_746_068_543).abs() < 1e-9);
        assert!((GeluTaylor::apply(&(), [1.0f64]) - 0.841_192).abs() < 1e-5);
        assert_eq!(LeakyReLU::apply(&LeakyReLUArgs { leaky_alpha: 0.1 }, [-10.0f32]), -1.0);
        assert_eq!(Clamp::apply(&ClampArgs { lower: -1.0, upper: 1.0 }, [5.0f32]), 1.0);
        assert_eq!(HardSwish::apply(&(), [3.0f32]), 3.0);
    }

    #[test]
    fn test_gelu_tails_and_precision() {
        // Phi(-0.5) = 0.308_537_538_725_986_9
        assert!((GELU::apply(&(), [-0.5f64]) + 0.154_268_769_362_993_4).abs() < 1e-14);
        assert_eq!(GELU::apply(&(), [10.0f64]), 10.0);
        assert_eq!(GELU::apply(&(), [-10.0f32]), -0.0);
        assert!((GELU::apply(&(), [2.5f32]) - 2.484_475_8).abs() < 1e-6);
        assert!(GELU::apply(&(), [f32::NAN]).is_nan());
    }

    #[test]
    fn test_dgelu_matches_finite_difference() {
        let z = 0.7f64;
        let h = 1e-6;
        let numeric = (GELU::apply(&(), [z + h]) - GELU::apply(&(), [z - h])) / (2.0 * h);
        let analytic = DGELU::apply(&(), [1.0, z]);
        assert!((numeric - analytic).abs() < 1e-6);
    }

    #[test]
    fn test_max_abs_propagates_nan() {
        let r = ReduceMaxAbs::reduce(3.0f32, f32::NAN);
        assert!(r.is_nan());
        let r = ReduceMaxAbs::reduce(r, 100.0f32);
        assert!(r.is_nan());
        assert!(AtomicMaximum::combine(f64::NAN, 1.0).is_nan());
    }
}
