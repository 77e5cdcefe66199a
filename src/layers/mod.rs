//! Layer nodes of the model graph.
//!
//! Each layer kind lives in its own module and implements [`OpInfo`], the
//! capability seam the graph builder, the optimizer passes and the
//! emission collaborator all go through. The shared structure (name,
//! attribute map, input references, owned output and weight variables)
//! lives on [`Layer`]; the per-kind configuration lives in the
//! [`LayerKind`] variants.

pub mod activation;
pub mod batchnorm;
pub mod bn_quant_tanh;
pub mod dense;
pub mod input;

use std::collections::BTreeMap;

use derive_more::From;
use serde::{Deserialize, Serialize};

use crate::{
    emit::{EmitCall, EmitConfig, HwConfig},
    error::{CompileError, Result},
    tensor::Variable,
};
pub use activation::Activation;
pub use batchnorm::BatchNorm;
pub use bn_quant_tanh::{BnQuantTanh, QuantizeLevel};
pub use dense::Dense;
pub use input::Input;

/// Numeric/string configuration attached to a layer by the loader or by
/// passes (fan-in, activation kind, quantizer, ...).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Attributes(BTreeMap<String, AttrValue>);

#[derive(Debug, Clone, PartialEq, From, Serialize, Deserialize)]
pub enum AttrValue {
    Int(i64),
    Float(f64),
    Text(String),
}

impl From<&str> for AttrValue {
    fn from(value: &str) -> Self {
        Self::Text(value.to_string())
    }
}

impl From<usize> for AttrValue {
    fn from(value: usize) -> Self {
        Self::Int(value as i64)
    }
}

impl Attributes {
    pub fn set(&mut self, key: impl Into<String>, value: impl Into<AttrValue>) {
        self.0.insert(key.into(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<&AttrValue> {
        self.0.get(key)
    }

    pub fn get_int(&self, key: &str) -> Option<i64> {
        match self.0.get(key) {
            Some(AttrValue::Int(v)) => Some(*v),
            _ => None,
        }
    }

    /// Integer attributes are readable as floats; loaders are not
    /// consistent about `0.5` vs `1`.
    pub fn get_float(&self, key: &str) -> Option<f64> {
        match self.0.get(key) {
            Some(AttrValue::Float(v)) => Some(*v),
            Some(AttrValue::Int(v)) => Some(*v as f64),
            _ => None,
        }
    }

    pub fn get_text(&self, key: &str) -> Option<&str> {
        match self.0.get(key) {
            Some(AttrValue::Text(v)) => Some(v.as_str()),
            _ => None,
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &AttrValue)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v))
    }
}

/// Capability surface every layer kind provides.
pub trait OpInfo {
    fn kind_name(&self) -> &'static str;

    /// Textual description of the operation.
    fn describe(&self) -> String;

    /// Number of upstream producers this kind consumes.
    fn expected_inputs(&self) -> usize;

    /// Declare the output variable given the resolved input variables.
    /// `layer_name` seeds the process-wide-unique output name.
    fn infer_output(&self, layer_name: &str, inputs: &[&Variable]) -> Result<Variable>;

    /// Key of the backend function template this kind is emitted with.
    fn emit_template(&self) -> &'static str;

    /// Numeric parameters substituted into the kind's config template.
    fn config_params(&self, layer: &Layer, hw: &HwConfig) -> Attributes;

    /// Weight variables in the order the emitted call expects them.
    /// Empty means the kind carries no weights.
    fn weight_order(&self) -> Vec<&'static str> {
        Vec::new()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum LayerKind {
    Input(Input),
    Dense(Dense),
    BatchNorm(BatchNorm),
    Activation(Activation),
    BnQuantTanh(BnQuantTanh),
}

impl LayerKind {
    pub fn op(&self) -> &dyn OpInfo {
        match self {
            LayerKind::Input(op) => op,
            LayerKind::Dense(op) => op,
            LayerKind::BatchNorm(op) => op,
            LayerKind::Activation(op) => op,
            LayerKind::BnQuantTanh(op) => op,
        }
    }
}

/// A named node: kind tag, attribute map, ordered input references (names
/// of upstream output variables), owned outputs and owned weights.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Layer {
    pub name: String,
    pub kind: LayerKind,
    pub attributes: Attributes,
    pub inputs: Vec<String>,
    pub outputs: Vec<Variable>,
    pub weights: BTreeMap<String, Variable>,
}

impl Layer {
    pub fn new(name: impl Into<String>, kind: LayerKind, inputs: Vec<String>) -> Self {
        Self {
            name: name.into(),
            kind,
            attributes: Attributes::default(),
            inputs,
            outputs: Vec::new(),
            weights: BTreeMap::new(),
        }
    }

    /// The sole output variable. Every kind currently declares exactly
    /// one; a layer without it has not been through output inference.
    pub fn output(&self) -> Result<&Variable> {
        self.outputs
            .first()
            .ok_or_else(|| CompileError::structural(&self.name, "layer declares no output"))
    }

    pub fn output_mut(&mut self) -> Result<&mut Variable> {
        let name = self.name.clone();
        self.outputs
            .first_mut()
            .ok_or_else(|| CompileError::structural(name, "layer declares no output"))
    }

    pub fn weight(&self, name: &str) -> Result<&Variable> {
        self.weights.get(name).ok_or_else(|| {
            CompileError::structural(&self.name, format!("missing weight `{name}`"))
        })
    }

    pub fn weight_mut(&mut self, name: &str) -> Result<&mut Variable> {
        let layer = self.name.clone();
        self.weights.get_mut(name).ok_or_else(|| {
            CompileError::structural(layer, format!("missing weight `{name}`"))
        })
    }

    pub fn add_weight(&mut self, var: Variable) {
        self.weights.insert(var.name.clone(), var);
    }

    /// Resolve the input variables and declare this layer's output.
    pub fn infer_output_from(&mut self, inputs: &[&Variable]) -> Result<()> {
        if inputs.len() != self.kind.op().expected_inputs() {
            return Err(CompileError::structural(
                &self.name,
                format!(
                    "{} expects {} input(s), got {}",
                    self.kind.op().kind_name(),
                    self.kind.op().expected_inputs(),
                    inputs.len()
                ),
            ));
        }
        let out = self.kind.op().infer_output(&self.name, inputs)?;
        self.outputs = vec![out];
        Ok(())
    }

    pub fn describe(&self) -> String {
        self.kind.op().describe()
    }

    pub fn is_input(&self) -> bool {
        matches!(self.kind, LayerKind::Input(_))
    }

    /// Canonical configuration record for templated emission.
    pub fn emit_config(&self, hw: &HwConfig) -> EmitConfig {
        EmitConfig {
            layer: self.name.clone(),
            kind: self.kind.op().kind_name().to_string(),
            params: self.kind.op().config_params(self, hw),
        }
    }

    /// Canonical call record: operand, output and weight variable names.
    pub fn emit_call(&self) -> EmitCall {
        let weights = self
            .kind
            .op()
            .weight_order()
            .into_iter()
            .filter(|name| self.weights.contains_key(*name))
            .map(str::to_string)
            .collect();
        EmitCall {
            layer: self.name.clone(),
            template: self.kind.op().emit_template().to_string(),
            inputs: self.inputs.clone(),
            output: self
                .outputs
                .first()
                .map(|v| v.name.clone())
                .unwrap_or_default(),
            weights,
        }
    }
}

impl std::fmt::Display for Layer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.describe())
    }
}

/// Conventional name of a layer's output variable.
pub(crate) fn output_name(layer_name: &str) -> String {
    format!("{layer_name}_out")
}
