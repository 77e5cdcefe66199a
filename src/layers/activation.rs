//! Elementwise nonlinearity, identified by name the way loaders report
//! it (`relu`, `linear`, `binary_tanh`, `ternary_tanh`, ...).

use serde::{Deserialize, Serialize};

use crate::{
    emit::HwConfig,
    error::Result,
    layers::{bn_quant_tanh::QuantizeLevel, output_name, Attributes, Layer, OpInfo},
    tensor::Variable,
};

/// Attribute key overriding the ternary dead-band margin (default 0.5).
pub const MARGIN_ATTR: &str = "margin";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Activation {
    pub activation: String,
}

impl Activation {
    pub fn new(activation: impl Into<String>) -> Self {
        Self {
            activation: activation.into(),
        }
    }

    pub fn is_linear(&self) -> bool {
        self.activation == "linear"
    }

    /// The quantized-tanh family eligible for batch-norm fusion.
    pub fn quantize_level(&self) -> Option<QuantizeLevel> {
        match self.activation.as_str() {
            "binary" | "binary_tanh" => Some(QuantizeLevel::Binary),
            "ternary" | "ternary_tanh" => Some(QuantizeLevel::Ternary),
            _ => None,
        }
    }
}

impl OpInfo for Activation {
    fn kind_name(&self) -> &'static str {
        "Activation"
    }

    fn describe(&self) -> String {
        format!("Activation: {}", self.activation)
    }

    fn expected_inputs(&self) -> usize {
        1
    }

    fn infer_output(&self, layer_name: &str, inputs: &[&Variable]) -> Result<Variable> {
        let precision = match self.quantize_level() {
            Some(level) => level.output_precision(),
            None => inputs[0].precision,
        };
        Ok(Variable::output(
            output_name(layer_name),
            inputs[0].shape.clone(),
            precision,
        ))
    }

    fn emit_template(&self) -> &'static str {
        "nnet::activation"
    }

    fn config_params(&self, layer: &Layer, hw: &HwConfig) -> Attributes {
        let mut params = Attributes::default();
        let n_in = layer
            .outputs
            .first()
            .map(|v| v.size())
            .unwrap_or_default();
        params.set("n_in", n_in);
        params.set("activation", self.activation.as_str());
        params.set("io_type", hw.io_type.to_string());
        params.set("reuse_factor", hw.reuse_factor);
        params
    }
}
