//! Graph source node declaring a model input tensor.

use itertools::Itertools;
use serde::{Deserialize, Serialize};

use crate::{
    emit::HwConfig,
    error::Result,
    layers::{output_name, Attributes, Layer, OpInfo},
    precision::Precision,
    tensor::{Shape, Variable},
};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Input {
    pub shape: Shape,
    pub precision: Precision,
}

impl OpInfo for Input {
    fn kind_name(&self) -> &'static str {
        "Input"
    }

    fn describe(&self) -> String {
        format!(
            "Input: [{}] {}",
            self.shape.iter().join("x"),
            self.precision
        )
    }

    fn expected_inputs(&self) -> usize {
        0
    }

    fn infer_output(&self, layer_name: &str, _inputs: &[&Variable]) -> Result<Variable> {
        Ok(Variable::input(
            output_name(layer_name),
            self.shape.clone(),
            self.precision,
        ))
    }

    fn emit_template(&self) -> &'static str {
        // Inputs are wired, not called.
        ""
    }

    fn config_params(&self, _layer: &Layer, _hw: &HwConfig) -> Attributes {
        let mut params = Attributes::default();
        params.set("n_in", self.shape.iter().product::<usize>());
        params.set("precision", self.precision.to_string());
        params
    }
}
