//! Merged batch-normalization and quantized (binary or ternary) tanh.
//!
//! The folded scale and bias of the batch norm become the threshold(s) at
//! which the sign of the input flips after the quantized tanh, so the
//! whole normalization collapses to one or two comparisons per element.

use serde::{Deserialize, Serialize};

use crate::{
    emit::HwConfig,
    error::{CompileError, Result},
    layers::{Attributes, Layer, LayerKind, OpInfo},
    precision::Precision,
    tensor::Variable,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum QuantizeLevel {
    Binary,
    Ternary,
}

impl QuantizeLevel {
    /// Distinct representable levels: 2 for binary, 3 for ternary. This
    /// is the value stored in the `quantize` attribute.
    pub fn levels(&self) -> i64 {
        match self {
            Self::Binary => 2,
            Self::Ternary => 3,
        }
    }

    pub fn output_precision(&self) -> Precision {
        match self {
            Self::Binary => Precision::Xnor,
            Self::Ternary => Precision::Ternary,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BnQuantTanh {
    pub n_in: usize,
    pub quantize: QuantizeLevel,
}

impl OpInfo for BnQuantTanh {
    fn kind_name(&self) -> &'static str {
        "BatchNormalizationQuantizedTanh"
    }

    fn describe(&self) -> String {
        let kind = match self.quantize {
            QuantizeLevel::Binary => "binary",
            QuantizeLevel::Ternary => "ternary",
        };
        format!("BatchNormQuantTanh[{kind}]: {}", self.n_in)
    }

    fn expected_inputs(&self) -> usize {
        1
    }

    fn infer_output(&self, layer_name: &str, inputs: &[&Variable]) -> Result<Variable> {
        Ok(Variable::output(
            crate::layers::output_name(layer_name),
            inputs[0].shape.clone(),
            self.quantize.output_precision(),
        ))
    }

    fn emit_template(&self) -> &'static str {
        match self.quantize {
            QuantizeLevel::Binary => "nnet::normalize_binary_tanh",
            QuantizeLevel::Ternary => "nnet::normalize_ternary_tanh",
        }
    }

    fn config_params(&self, _layer: &Layer, hw: &HwConfig) -> Attributes {
        let mut params = Attributes::default();
        params.set("n_in", self.n_in);
        params.set("quantize", self.quantize.levels());
        params.set("io_type", hw.io_type.to_string());
        params.set("reuse_factor", hw.reuse_factor);
        params
    }

    fn weight_order(&self) -> Vec<&'static str> {
        match self.quantize {
            QuantizeLevel::Binary => vec!["threshold"],
            QuantizeLevel::Ternary => vec!["threshold_hi", "threshold_lo"],
        }
    }
}

/// Build the fused layer from a batch-norm node. The fused node takes
/// over the batch norm's name and output variable so every downstream
/// reference keeps resolving, and its thresholds are floored onto the
/// fractional grid of the batch norm's input so they are exactly
/// representable by the comparison hardware.
pub fn fuse(
    bn: &Layer,
    quantize: QuantizeLevel,
    margin: f64,
    input_precision: Precision,
) -> Result<Layer> {
    let scale = bn.weight("scale")?.data()?;
    let bias = bn.weight("bias")?.data()?;
    if scale.len() != bias.len() {
        return Err(CompileError::structural(
            &bn.name,
            format!(
                "scale/bias length mismatch: {} vs {}",
                scale.len(),
                bias.len()
            ),
        ));
    }

    let n_in = scale.len();
    let threshold: Vec<f64> = scale
        .iter()
        .zip(bias.iter())
        .map(|(s, b)| -b / s)
        .collect();

    let mut fused = Layer::new(
        bn.name.clone(),
        LayerKind::BnQuantTanh(BnQuantTanh { n_in, quantize }),
        bn.inputs.clone(),
    );
    fused.attributes.set("n_in", n_in);
    fused.attributes.set("quantize", quantize.levels());

    let floored = |data: Vec<f64>| {
        data.into_iter()
            .map(|v| input_precision.quantize_threshold(v))
            .collect::<Vec<_>>()
    };
    match quantize {
        QuantizeLevel::Binary => {
            fused.add_weight(Variable::weight(
                "threshold",
                vec![n_in],
                input_precision,
                floored(threshold),
            ));
        }
        QuantizeLevel::Ternary => {
            let hi: Vec<f64> = scale
                .iter()
                .zip(threshold.iter())
                .map(|(s, t)| margin / s + t)
                .collect();
            let lo: Vec<f64> = scale
                .iter()
                .zip(threshold.iter())
                .map(|(s, t)| -margin / s + t)
                .collect();
            fused.add_weight(Variable::weight(
                "threshold_hi",
                vec![n_in],
                input_precision,
                floored(hi),
            ));
            fused.add_weight(Variable::weight(
                "threshold_lo",
                vec![n_in],
                input_precision,
                floored(lo),
            ));
        }
    }

    let bn_out = bn.output()?;
    fused.outputs = vec![Variable::output(
        bn_out.name.clone(),
        bn_out.shape.clone(),
        quantize.output_precision(),
    )];
    Ok(fused)
}
