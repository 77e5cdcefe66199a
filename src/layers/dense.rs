//! Fully-connected layer.

use serde::{Deserialize, Serialize};

use crate::{
    emit::HwConfig,
    error::Result,
    layers::{output_name, Attributes, Layer, OpInfo},
    precision::DEFAULT_PRECISION,
    tensor::Variable,
};

/// Attribute key naming the quantizer that governed the trained weights
/// (`binary`, `ternary`). Absent for float-trained layers.
pub const WEIGHT_QUANTIZER_ATTR: &str = "weight_quantizer";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Dense {
    pub fan_in: usize,
    pub fan_out: usize,
}

impl OpInfo for Dense {
    fn kind_name(&self) -> &'static str {
        "Dense"
    }

    fn describe(&self) -> String {
        format!("Dense: ({},{})", self.fan_in, self.fan_out)
    }

    fn expected_inputs(&self) -> usize {
        1
    }

    fn infer_output(&self, layer_name: &str, _inputs: &[&Variable]) -> Result<Variable> {
        // The accumulator precision is refined later by the
        // requantization pass; until then the default element type holds.
        Ok(Variable::output(
            output_name(layer_name),
            vec![self.fan_out],
            *DEFAULT_PRECISION,
        ))
    }

    fn emit_template(&self) -> &'static str {
        "nnet::compute_layer"
    }

    fn config_params(&self, layer: &Layer, hw: &HwConfig) -> Attributes {
        let mut params = Attributes::default();
        params.set("n_in", self.fan_in);
        params.set("n_out", self.fan_out);
        params.set("io_type", hw.io_type.to_string());
        params.set("reuse_factor", hw.reuse_factor);
        if let Ok(out) = layer.output() {
            params.set("accum_t", out.precision.to_string());
        }
        params
    }

    fn weight_order(&self) -> Vec<&'static str> {
        vec!["weight", "bias"]
    }
}
