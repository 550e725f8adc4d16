//! Numeric element types and conversions.
//!
//! Every storage type the epilogue touches implements [`Element`]. Values move between
//! element types through `f64`, which represents every supported type exactly, so a
//! conversion only rounds once: at the destination, under the requested [`RoundStyle`].

use std::fmt;

use half::{bf16, f16};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoundStyle {
    /// Round to nearest, ties to even.
    #[default]
    ToNearest,
    TowardZero,
    TowardInfinity,
    TowardNegInfinity,
}

/// Type-level carrier of a [`RoundStyle`], used as a node parameter.
pub trait Rounding: Send + Sync + 'static {
    const STYLE: RoundStyle;
}

pub struct RoundNearest;
pub struct RoundTowardZero;
pub struct RoundUp;
pub struct RoundDown;

impl Rounding for RoundNearest {
    const STYLE: RoundStyle = RoundStyle::ToNearest;
}
impl Rounding for RoundTowardZero {
    const STYLE: RoundStyle = RoundStyle::TowardZero;
}
impl Rounding for RoundUp {
    const STYLE: RoundStyle = RoundStyle::TowardInfinity;
}
impl Rounding for RoundDown {
    const STYLE: RoundStyle = RoundStyle::TowardNegInfinity;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NumericKind {
    F64,
    F32,
    F16,
    #[serde(rename = "bf16")]
    BF16,
    #[serde(rename = "e4m3")]
    E4M3,
    #[serde(rename = "e5m2")]
    E5M2,
    Bit,
}

impl NumericKind {
    pub const fn bits(self) -> usize {
        match self {
            Self::F64 => 64,
            Self::F32 => 32,
            Self::F16 | Self::BF16 => 16,
            Self::E4M3 | Self::E5M2 => 8,
            Self::Bit => 1,
        }
    }

    pub const fn is_fp8(self) -> bool {
        matches!(self, Self::E4M3 | Self::E5M2)
    }

    /// Elements per 128-bit vectorized access.
    pub const fn alignment(self) -> usize {
        128 / self.bits()
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::F64 => "f64",
            Self::F32 => "f32",
            Self::F16 => "f16",
            Self::BF16 => "bf16",
            Self::E4M3 => "e4m3",
            Self::E5M2 => "e5m2",
            Self::Bit => "u1",
        }
    }
}

/// Storage width class. Selects sub-tree shapes at compile time.
pub trait StorageWidth: Send + Sync + 'static {
    const NARROW: bool;
}

/// 8-bit floating point storage.
pub enum Narrow {}
/// Anything wider than 8-bit float, plus boolean storage.
pub enum Wide {}

impl StorageWidth for Narrow {
    const NARROW: bool = true;
}
impl StorageWidth for Wide {
    const NARROW: bool = false;
}

pub trait Element: Copy + Default + PartialEq + fmt::Debug + Send + Sync + 'static {
    type Width: StorageWidth;
    const KIND: NumericKind;

    fn into_f64(self) -> f64;
    fn from_f64_rounded(value: f64, round: RoundStyle) -> Self;
    fn to_raw(self) -> u64;
    fn from_raw(raw: u64) -> Self;

    #[inline]
    fn convert<T: Element>(self, round: RoundStyle) -> T {
        T::from_f64_rounded(self.into_f64(), round)
    }
}

/// Arithmetic types used for intermediate epilogue math.
pub trait ComputeElement: Element + num_traits::Float {
    #[inline]
    fn lit(value: f64) -> Self {
        Self::from_f64_rounded(value, RoundStyle::ToNearest)
    }

    /// Error function.
    fn erf(self) -> Self;
}

impl ComputeElement for f32 {
    #[inline]
    fn erf(self) -> Self {
        libm::erff(self)
    }
}

impl ComputeElement for f64 {
    #[inline]
    fn erf(self) -> Self {
        libm::erf(self)
    }
}

fn step_up(bits: u64, sign_mask: u64) -> u64 {
    if bits & sign_mask == 0 {
        bits + 1
    } else if bits == sign_mask {
        1
    } else {
        bits - 1
    }
}

fn step_down(bits: u64, sign_mask: u64) -> u64 {
    if bits & sign_mask != 0 {
        bits + 1
    } else if bits == 0 {
        sign_mask | 1
    } else {
        bits - 1
    }
}

/// Adjusts a round-to-nearest result of a sign-magnitude format toward the requested direction.
fn directed<E: Element>(value: f64, nearest: E, round: RoundStyle, sign_mask: u64) -> E {
    let got = nearest.into_f64();
    if value.is_nan() || got == value {
        return nearest;
    }
    let bits = nearest.to_raw();
    let adjusted = match round {
        RoundStyle::ToNearest => bits,
        RoundStyle::TowardZero if got.abs() > value.abs() => {
            if got > 0.0 {
                step_down(bits, sign_mask)
            } else {
                step_up(bits, sign_mask)
            }
        }
        RoundStyle::TowardInfinity if got < value => step_up(bits, sign_mask),
        RoundStyle::TowardNegInfinity if got > value => step_down(bits, sign_mask),
        _ => bits,
    };
    E::from_raw(adjusted)
}

impl Element for f64 {
    type Width = Wide;
    const KIND: NumericKind = NumericKind::F64;

    #[inline]
    fn into_f64(self) -> f64 {
        self
    }
    #[inline]
    fn from_f64_rounded(value: f64, _round: RoundStyle) -> Self {
        value
    }
    fn to_raw(self) -> u64 {
        self.to_bits()
    }
    fn from_raw(raw: u64) -> Self {
        f64::from_bits(raw)
    }
}

impl Element for f32 {
    type Width = Wide;
    const KIND: NumericKind = NumericKind::F32;

    #[inline]
    fn into_f64(self) -> f64 {
        self as f64
    }
    #[inline]
    fn from_f64_rounded(value: f64, round: RoundStyle) -> Self {
        let nearest = value as f32;
        match round {
            RoundStyle::ToNearest => nearest,
            _ => directed(value, nearest, round, 1 << 31),
        }
    }
    fn to_raw(self) -> u64 {
        self.to_bits() as u64
    }
    fn from_raw(raw: u64) -> Self {
        f32::from_bits(raw as u32)
    }
}

impl Element for f16 {
    type Width = Wide;
    const KIND: NumericKind = NumericKind::F16;

    fn into_f64(self) -> f64 {
        self.to_f64()
    }
    fn from_f64_rounded(value: f64, round: RoundStyle) -> Self {
        let nearest = f16::from_f64(value);
        match round {
            RoundStyle::ToNearest => nearest,
            _ => directed(value, nearest, round, 1 << 15),
        }
    }
    fn to_raw(self) -> u64 {
        self.to_bits() as u64
    }
    fn from_raw(raw: u64) -> Self {
        f16::from_bits(raw as u16)
    }
}

impl Element for bf16 {
    type Width = Wide;
    const KIND: NumericKind = NumericKind::BF16;

    fn into_f64(self) -> f64 {
        self.to_f64()
    }
    fn from_f64_rounded(value: f64, round: RoundStyle) -> Self {
        let nearest = bf16::from_f64(value);
        match round {
            RoundStyle::ToNearest => nearest,
            _ => directed(value, nearest, round, 1 << 15),
        }
    }
    fn to_raw(self) -> u64 {
        self.to_bits() as u64
    }
    fn from_raw(raw: u64) -> Self {
        bf16::from_bits(raw as u16)
    }
}

/// Bit layout of an 8-bit float format.
struct MiniFloat {
    mantissa_bits: u32,
    bias: i32,
    max_finite: u8,
    nan: u8,
    has_infinity: bool,
}

const E4M3_FORMAT: MiniFloat = MiniFloat {
    mantissa_bits: 3,
    bias: 7,
    max_finite: 0x7E,
    nan: 0x7F,
    has_infinity: false,
};

const E5M2_FORMAT: MiniFloat = MiniFloat {
    mantissa_bits: 2,
    bias: 15,
    max_finite: 0x7B,
    nan: 0x7F,
    has_infinity: true,
};

fn round_half_even(x: f64) -> f64 {
    let floor = x.floor();
    let diff = x - floor;
    if diff > 0.5 || (diff == 0.5 && floor % 2.0 != 0.0) {
        floor + 1.0
    } else {
        floor
    }
}

fn binade(value: f64) -> i32 {
    ((value.to_bits() >> 52) & 0x7ff) as i32 - 1023
}

impl MiniFloat {
    fn decode(&self, bits: u8) -> f64 {
        let sign = if bits & 0x80 != 0 { -1.0 } else { 1.0 };
        let magnitude = bits & 0x7F;
        let exponent = (magnitude >> self.mantissa_bits) as i32;
        let mantissa = (magnitude & ((1 << self.mantissa_bits) - 1)) as f64;
        let exponent_all_ones = (0x7F >> self.mantissa_bits) as i32;
        if self.has_infinity && exponent == exponent_all_ones {
            return if mantissa == 0.0 { sign * f64::INFINITY } else { f64::NAN };
        }
        if !self.has_infinity && magnitude == self.nan {
            return f64::NAN;
        }
        let scale = 2f64.powi(self.mantissa_bits as i32);
        let value = if exponent == 0 {
            mantissa / scale * 2f64.powi(1 - self.bias)
        } else {
            (1.0 + mantissa / scale) * 2f64.powi(exponent - self.bias)
        };
        sign * value
    }

    /// Saturating encode: values past the largest finite magnitude clamp to it.
    fn encode(&self, value: f64, round: RoundStyle) -> u8 {
        if value.is_nan() {
            return self.nan;
        }
        let negative = value.is_sign_negative();
        let sign: u8 = if negative { 0x80 } else { 0 };
        let magnitude = value.abs();
        if magnitude == 0.0 {
            return sign;
        }
        let max = self.decode(self.max_finite);
        if magnitude.is_infinite() {
            return sign | self.max_finite;
        }

        let min_exponent = 1 - self.bias;
        let exponent = binade(magnitude).max(min_exponent);
        let quantum = 2f64.powi(exponent - self.mantissa_bits as i32);
        let scaled = magnitude / quantum;
        let units = match round {
            RoundStyle::ToNearest => round_half_even(scaled),
            RoundStyle::TowardZero => scaled.floor(),
            RoundStyle::TowardInfinity if negative => scaled.floor(),
            RoundStyle::TowardInfinity => scaled.ceil(),
            RoundStyle::TowardNegInfinity if negative => scaled.ceil(),
            RoundStyle::TowardNegInfinity => scaled.floor(),
        };
        let rounded = units * quantum;
        if rounded > max {
            return sign | self.max_finite;
        }
        if rounded == 0.0 {
            return sign;
        }

        let scale = 2f64.powi(self.mantissa_bits as i32);
        let exponent = binade(rounded);
        if exponent < min_exponent {
            let mantissa = (rounded / 2f64.powi(min_exponent) * scale) as u8;
            sign | mantissa
        } else {
            let mantissa = ((rounded / 2f64.powi(exponent) - 1.0) * scale) as u8;
            let field = (exponent + self.bias) as u8;
            sign | (field << self.mantissa_bits) | mantissa
        }
    }
}

macro_rules! float8_type {
    ($name:ident, $format:ident, $kind:ident, $doc:literal) => {
        #[doc = $doc]
        #[derive(Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
        #[repr(transparent)]
        pub struct $name(u8);

        impl $name {
            pub const fn from_bits(bits: u8) -> Self {
                Self(bits)
            }

            pub const fn to_bits(self) -> u8 {
                self.0
            }

            pub fn from_f32(value: f32) -> Self {
                Self($format.encode(value as f64, RoundStyle::ToNearest))
            }

            pub fn to_f32(self) -> f32 {
                $format.decode(self.0) as f32
            }

            pub fn max_finite() -> Self {
                Self($format.max_finite)
            }

            pub fn is_nan(self) -> bool {
                $format.decode(self.0).is_nan()
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}({})", stringify!($name), $format.decode(self.0))
            }
        }

        impl Element for $name {
            type Width = Narrow;
            const KIND: NumericKind = NumericKind::$kind;

            fn into_f64(self) -> f64 {
                $format.decode(self.0)
            }
            fn from_f64_rounded(value: f64, round: RoundStyle) -> Self {
                Self($format.encode(value, round))
            }
            fn to_raw(self) -> u64 {
                self.0 as u64
            }
            fn from_raw(raw: u64) -> Self {
                Self(raw as u8)
            }
        }
    };
}

float8_type!(Float8E4M3, E4M3_FORMAT, E4M3, "8-bit float with 4 exponent and 3 mantissa bits, no infinities, max 448.");
float8_type!(Float8E5M2, E5M2_FORMAT, E5M2, "8-bit float with 5 exponent and 2 mantissa bits, max finite 57344.");

/// One-bit storage. Holds the positivity mask of the converted value.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Bit(pub bool);

impl Element for Bit {
    type Width = Wide;
    const KIND: NumericKind = NumericKind::Bit;

    fn into_f64(self) -> f64 {
        if self.0 {
            1.0
        } else {
            0.0
        }
    }
    fn from_f64_rounded(value: f64, _round: RoundStyle) -> Self {
        Bit(value > 0.0)
    }
    fn to_raw(self) -> u64 {
        self.0 as u64
    }
    fn from_raw(raw: u64) -> Self {
        Bit(raw & 1 != 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_e4m3_exact_values() {
        for v in [0.0f32, 1.0, -1.0, 0.5, 1.75, 448.0, -448.0, 0.015625] {
            assert_eq!(Float8E4M3::from_f32(v).to_f32(), v, "value {}", v);
        }
        // smallest subnormal: 2^-9
        assert_eq!(Float8E4M3::from_f32(2f32.powi(-9)).to_bits(), 0x01);
    }

    #[test]
    fn test_fp8_saturates() {
        assert_eq!(Float8E4M3::from_f32(1.0e6).to_f32(), 448.0);
        assert_eq!(Float8E4M3::from_f32(f32::NEG_INFINITY).to_f32(), -448.0);
        assert_eq!(Float8E5M2::from_f32(1.0e9).to_f32(), 57344.0);
        assert!(Float8E4M3::from_f32(f32::NAN).is_nan());
    }

    #[test]
    fn test_e5m2_infinity_decodes() {
        assert_eq!(Float8E5M2::from_bits(0x7C).to_f32(), f32::INFINITY);
        assert_eq!(Float8E5M2::from_bits(0xFC).to_f32(), f32::NEG_INFINITY);
    }

    #[test]
    fn test_fp8_round_ties_to_even() {
        // 1.0625 lies halfway between 1.0 and 1.125 in e4m3
        assert_eq!(Float8E4M3::from_f32(1.0625).to_f32(), 1.0);
        // 1.1875 lies halfway between 1.125 and 1.25, the even neighbour is 1.25
        assert_eq!(Float8E4M3::from_f32(1.1875).to_f32(), 1.25);
    }

    #[test]
    fn test_directed_rounding_fp8() {
        let v = 1.1;
        let down = Float8E4M3::from_f64_rounded(v, RoundStyle::TowardZero);
        let up = Float8E4M3::from_f64_rounded(v, RoundStyle::TowardInfinity);
        assert_eq!(down.to_f32(), 1.0);
        assert_eq!(up.to_f32(), 1.125);
        let neg = Float8E4M3::from_f64_rounded(-1.1, RoundStyle::TowardInfinity);
        assert_eq!(neg.to_f32(), -1.0);
    }

    #[test]
    fn test_directed_rounding_f32() {
        let v = 1.0 + 2f64.powi(-30);
        assert_eq!(f32::from_f64_rounded(v, RoundStyle::ToNearest), 1.0);
        assert_eq!(f32::from_f64_rounded(v, RoundStyle::TowardZero), 1.0);
        assert!(f32::from_f64_rounded(v, RoundStyle::TowardInfinity) > 1.0);
        assert_eq!(f32::from_f64_rounded(-v, RoundStyle::TowardInfinity), -1.0);
        assert!(f32::from_f64_rounded(-v, RoundStyle::TowardNegInfinity) < -1.0);
    }

    #[test]
    fn test_f16_toward_zero_does_not_overflow() {
        let v = f16::from_f64_rounded(70000.0, RoundStyle::TowardZero);
        assert_eq!(v, f16::MAX);
        let v = f16::from_f64_rounded(70000.0, RoundStyle::ToNearest);
        assert!(v.is_infinite());
    }

    #[test]
    fn test_bit_mask() {
        assert_eq!(Bit::from_f64_rounded(0.3, RoundStyle::ToNearest), Bit(true));
        assert_eq!(Bit::from_f64_rounded(-2.0, RoundStyle::ToNearest), Bit(false));
        assert_eq!(Bit(true).into_f64(), 1.0);
    }

    #[test]
    fn test_kind_properties() {
        assert!(Float8E5M2::KIND.is_fp8());
        assert!(!<f16 as Element>::KIND.is_fp8());
        assert_eq!(<f16 as Element>::KIND.alignment(), 8);
        assert_eq!(Float8E4M3::KIND.alignment(), 16);
        assert!(<<Float8E4M3 as Element>::Width as StorageWidth>::NARROW);
    }
}
