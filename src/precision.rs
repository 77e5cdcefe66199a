//! Numeric-representation descriptors and the arithmetic rules for deriving
//! one precision from another.
//!
//! Precisions are immutable value types: compared and combined by value,
//! never by identity. The closed set mirrors what the synthesis backends
//! can express: plain two's-complement integers, fixed-point with a
//! rounding/saturation policy, the 1-bit XNOR encoding used by binary
//! networks (stored 0 is -1, stored 1 is +1) and the 2-bit ternary
//! encoding for {-1, 0, +1}.

use std::{env, fmt};

use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};

use crate::error::{CompileError, Result};

/// Default element precision used when a loader does not declare one.
/// Overridable through `HLSML_DEFAULT_PRECISION`, accepting either
/// `ap_fixed<W,I>` or the bare `W,I` form.
pub static DEFAULT_PRECISION: Lazy<Precision> = Lazy::new(|| {
    env::var("HLSML_DEFAULT_PRECISION")
        .ok()
        .and_then(|val| parse_fixed_spec(&val))
        .unwrap_or(Precision::Fixed {
            width: 16,
            integer_bits: 6,
            signed: true,
            rounding: RoundingMode::Truncate,
            saturation: SaturationMode::Wrap,
        })
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RoundingMode {
    Truncate,
    RoundNearest,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SaturationMode {
    Wrap,
    Saturate,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Precision {
    /// Two's-complement integer.
    Integer { width: usize, signed: bool },
    /// Fixed point with `width - integer_bits` fractional bits.
    Fixed {
        width: usize,
        integer_bits: usize,
        signed: bool,
        rounding: RoundingMode,
        saturation: SaturationMode,
    },
    /// Single-bit sign-magnitude XNOR encoding.
    Xnor,
    /// Two-bit encoding of {-1, 0, +1}.
    Ternary,
}

impl Precision {
    pub fn integer(width: usize, signed: bool) -> Self {
        Self::Integer { width, signed }
    }

    /// Signed fixed point with the backend's default truncate/wrap policy.
    /// `integer_bits > width` is rejected: such a descriptor has no
    /// representable fractional grid.
    pub fn fixed(width: usize, integer_bits: usize) -> Result<Self> {
        Self::fixed_with(
            width,
            integer_bits,
            true,
            RoundingMode::Truncate,
            SaturationMode::Wrap,
        )
    }

    pub fn fixed_with(
        width: usize,
        integer_bits: usize,
        signed: bool,
        rounding: RoundingMode,
        saturation: SaturationMode,
    ) -> Result<Self> {
        if integer_bits > width {
            return Err(CompileError::InvalidPrecision(format!(
                "fixed<{width},{integer_bits}> has more integer bits than total bits"
            )));
        }
        Ok(Self::Fixed {
            width,
            integer_bits,
            signed,
            rounding,
            saturation,
        })
    }

    /// Parse a fixed-point spec string (`ap_fixed<W,I>` or bare `W,I`).
    pub fn parse(spec: &str) -> Result<Self> {
        parse_fixed_spec(spec).ok_or_else(|| {
            CompileError::InvalidPrecision(format!("unparseable precision `{spec}`"))
        })
    }

    pub fn width(&self) -> usize {
        match self {
            Self::Integer { width, .. } | Self::Fixed { width, .. } => *width,
            Self::Xnor => 1,
            Self::Ternary => 2,
        }
    }

    /// Number of fractional bits. Zero for every kind that has no
    /// fractional grid.
    pub fn fractional_bits(&self) -> usize {
        match self {
            Self::Fixed {
                width,
                integer_bits,
                ..
            } => width - integer_bits,
            _ => 0,
        }
    }

    /// Snap `value` onto this precision's representable grid.
    ///
    /// For fixed point the value is floored onto the fractional grid
    /// (`floor(v * 2^F) / 2^F`), or rounded under `RoundNearest`. Integers
    /// floor to whole values, which is what threshold re-flooring after
    /// requantization relies on. The sub-byte encodings are identity.
    /// Idempotent for every kind.
    pub fn quantize_threshold(&self, value: f64) -> f64 {
        match self {
            Self::Fixed { rounding, .. } => {
                // 2^F as a float; a u64 shift would overflow at F >= 64.
                let grid = 2f64.powi(self.fractional_bits() as i32);
                match rounding {
                    RoundingMode::Truncate => (value * grid).floor() / grid,
                    RoundingMode::RoundNearest => (value * grid).round() / grid,
                }
            }
            Self::Integer { .. } => value.floor(),
            Self::Xnor | Self::Ternary => value,
        }
    }

    /// Same kind, width rounded up to the next multiple of 8. Required at
    /// stream/bus boundaries where byte alignment is mandatory. `Xnor`
    /// and `Ternary` have their width fixed by the encoding and are
    /// returned unchanged; packing sub-byte lanes is the bus adapter's
    /// concern.
    pub fn next_byte_aligned(&self) -> Self {
        let align = |w: usize| w.div_ceil(8) * 8;
        match *self {
            Self::Integer { width, signed } => Self::Integer {
                width: align(width),
                signed,
            },
            Self::Fixed {
                width,
                integer_bits,
                signed,
                rounding,
                saturation,
            } => Self::Fixed {
                width: align(width),
                integer_bits,
                signed,
                rounding,
                saturation,
            },
            Self::Xnor => Self::Xnor,
            Self::Ternary => Self::Ternary,
        }
    }
}

/// Accumulator precision for a sum of `n_terms` one-bit (+1/-1)
/// contributions, as produced by a binary dense layer: `ceil(log2(n))`
/// bits for the magnitude plus two to hold the signed range without
/// overflow.
pub fn accumulator_for_sum(n_terms: usize) -> Precision {
    debug_assert!(n_terms > 0);
    let nbits = n_terms.next_power_of_two().trailing_zeros() as usize + 2;
    Precision::Integer {
        width: nbits,
        signed: true,
    }
}

/// Accepts `ap_fixed<W,I>` or the bare `W,I` form.
fn parse_fixed_spec(spec: &str) -> Option<Precision> {
    let inner = spec
        .trim()
        .strip_prefix("ap_fixed<")
        .and_then(|s| s.strip_suffix('>'))
        .unwrap_or(spec.trim());
    let (width, integer_bits) = inner.split_once(',')?;
    let width = width.trim().parse().ok()?;
    let integer_bits = integer_bits.trim().parse().ok()?;
    Precision::fixed(width, integer_bits).ok()
}

impl fmt::Display for Precision {
    /// Canonical backend type string, interpolated verbatim by emission
    /// templates.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Self::Integer { width, signed } => {
                write!(f, "ap_{}int<{width}>", if signed { "" } else { "u" })
            }
            Self::Fixed {
                width,
                integer_bits,
                signed,
                rounding,
                saturation,
            } => {
                let prefix = if signed { "" } else { "u" };
                write!(f, "ap_{prefix}fixed<{width},{integer_bits}")?;
                if rounding != RoundingMode::Truncate || saturation != SaturationMode::Wrap {
                    let rnd = match rounding {
                        RoundingMode::Truncate => "AP_TRN",
                        RoundingMode::RoundNearest => "AP_RND",
                    };
                    let sat = match saturation {
                        SaturationMode::Wrap => "AP_WRAP",
                        SaturationMode::Saturate => "AP_SAT",
                    };
                    write!(f, ",{rnd},{sat}")?;
                }
                write!(f, ">")
            }
            Self::Xnor => write!(f, "ap_uint<1>"),
            Self::Ternary => write!(f, "ap_int<2>"),
        }
    }
}
