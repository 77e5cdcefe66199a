//! Weight quantizers for binary/ternary dense layers.
//!
//! A dense layer trained with a quantization-aware scheme records which
//! quantizer governed its weights as a plain attribute string; the
//! requantization pass parses it here. Unrecognized strings stay
//! unparsed and trigger the non-fatal skip path in the pass.

use serde::{Deserialize, Serialize};

use crate::precision::Precision;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WeightQuantizer {
    Binary,
    Ternary,
}

impl WeightQuantizer {
    pub fn parse(kind: &str) -> Option<Self> {
        match kind {
            "binary" => Some(Self::Binary),
            "ternary" => Some(Self::Ternary),
            _ => None,
        }
    }

    /// Native storage precision of the quantized weights.
    pub fn precision(&self) -> Precision {
        match self {
            Self::Binary => Precision::Xnor,
            Self::Ternary => Precision::Ternary,
        }
    }

    pub fn bits(&self) -> usize {
        self.precision().width()
    }

    /// Re-quantize trained float weights to the quantizer's native
    /// values: sign for binary, a symmetric dead band of +-0.5 for
    /// ternary.
    pub fn quantize(&self, data: &[f64]) -> Vec<f64> {
        match self {
            Self::Binary => data
                .iter()
                .map(|&v| if v > 0.0 { 1.0 } else { -1.0 })
                .collect(),
            Self::Ternary => data
                .iter()
                .map(|&v| {
                    if v > 0.5 {
                        1.0
                    } else if v < -0.5 {
                        -1.0
                    } else {
                        0.0
                    }
                })
                .collect(),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_parse() {
        assert_eq!(WeightQuantizer::parse("binary"), Some(WeightQuantizer::Binary));
        assert_eq!(
            WeightQuantizer::parse("ternary"),
            Some(WeightQuantizer::Ternary)
        );
        assert_eq!(WeightQuantizer::parse("po2"), None);
    }

    #[test]
    fn test_binary_quantize() {
        let q = WeightQuantizer::Binary;
        assert_eq!(q.quantize(&[0.3, -0.3, 0.0]), vec![1.0, -1.0, -1.0]);
        assert_eq!(q.precision(), Precision::Xnor);
        assert_eq!(q.bits(), 1);
    }

    #[test]
    fn test_ternary_quantize() {
        let q = WeightQuantizer::Ternary;
        assert_eq!(
            q.quantize(&[0.8, 0.2, -0.2, -0.9]),
            vec![1.0, 0.0, 0.0, -1.0]
        );
        assert_eq!(q.precision(), Precision::Ternary);
        assert_eq!(q.bits(), 2);
    }
}
