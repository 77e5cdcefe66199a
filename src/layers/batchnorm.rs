//! Batch normalization, already folded to an affine per-channel
//! `scale * x + bias` by the loader (mean/variance/gamma/beta/epsilon are
//! reduced before the graph is built).

use serde::{Deserialize, Serialize};

use crate::{
    emit::HwConfig,
    error::Result,
    layers::{output_name, Attributes, Layer, OpInfo},
    tensor::Variable,
};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchNorm {
    pub n_in: usize,
}

impl OpInfo for BatchNorm {
    fn kind_name(&self) -> &'static str {
        "BatchNormalization"
    }

    fn describe(&self) -> String {
        format!("BatchNorm: {}", self.n_in)
    }

    fn expected_inputs(&self) -> usize {
        1
    }

    fn infer_output(&self, layer_name: &str, inputs: &[&Variable]) -> Result<Variable> {
        // Shape and precision pass straight through the affine transform.
        Ok(Variable::output(
            output_name(layer_name),
            inputs[0].shape.clone(),
            inputs[0].precision,
        ))
    }

    fn emit_template(&self) -> &'static str {
        "nnet::normalize"
    }

    fn config_params(&self, _layer: &Layer, hw: &HwConfig) -> Attributes {
        let mut params = Attributes::default();
        params.set("n_in", self.n_in);
        params.set("io_type", hw.io_type.to_string());
        params.set("reuse_factor", hw.reuse_factor);
        params
    }

    fn weight_order(&self) -> Vec<&'static str> {
        vec!["scale", "bias"]
    }
}
