//! Backend-neutral emission records.
//!
//! Nothing here renders text. The records carry everything a backend
//! writer needs to instantiate its templates: per-layer configuration
//! parameters ([`EmitConfig`]), the call wiring ([`EmitCall`]) and the
//! field-ordered node tables of a compiled tree ensemble. The
//! [`Registry`] is the one table mapping external kind names to layer
//! constructors and template keys; it is built once and passed by
//! reference, never consulted through a global.

use std::collections::BTreeMap;

use derive_more::Display;
use serde::Serialize;

use crate::{
    bdt::{Ensemble, Tree},
    error::{CompileError, Result},
    layers::{Activation, Attributes, BatchNorm, BnQuantTanh, Dense, Input, LayerKind, QuantizeLevel},
    model::ModelGraph,
    precision::Precision,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, Serialize)]
pub enum IoType {
    #[display("io_parallel")]
    Parallel,
    #[display("io_serial")]
    Serial,
}

/// Hardware knobs shared by every layer of one build.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct HwConfig {
    pub reuse_factor: usize,
    pub io_type: IoType,
}

impl Default for HwConfig {
    fn default() -> Self {
        Self {
            reuse_factor: 1,
            io_type: IoType::Parallel,
        }
    }
}

/// One layer's configuration record: kind name plus the numeric and
/// string parameters its config template interpolates.
#[derive(Debug, Clone, Serialize)]
pub struct EmitConfig {
    pub layer: String,
    pub kind: String,
    pub params: Attributes,
}

/// One layer's call record: template key plus the operand, output and
/// weight variable names in call order.
#[derive(Debug, Clone, Serialize)]
pub struct EmitCall {
    pub layer: String,
    pub template: String,
    pub inputs: Vec<String>,
    pub output: String,
    pub weights: Vec<String>,
}

/// Full emission plan for a network, in topological order. Input layers
/// contribute a config record (the port declaration) but no call.
#[derive(Debug, Clone, Serialize)]
pub struct EmitPlan {
    pub configs: Vec<EmitConfig>,
    pub calls: Vec<EmitCall>,
}

impl EmitPlan {
    /// JSON form handed to out-of-process backend writers.
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(self).map_err(|e| {
            CompileError::UnsupportedConfig(format!("emission plan not serializable: {e}"))
        })
    }
}

pub fn plan_network(graph: &ModelGraph, hw: &HwConfig) -> EmitPlan {
    let mut configs = Vec::new();
    let mut calls = Vec::new();
    for layer in graph.iter() {
        configs.push(layer.emit_config(hw));
        if !layer.is_input() {
            calls.push(layer.emit_call());
        }
    }
    EmitPlan { configs, calls }
}

type KindBuilder = fn(&Attributes) -> Result<LayerKind>;

pub struct RegistryEntry {
    pub build: KindBuilder,
    pub template: &'static str,
}

/// Kind-name dispatch table shared by the loader (attribute record to
/// layer kind) and the emitter (kind to template key).
pub struct Registry {
    entries: BTreeMap<&'static str, RegistryEntry>,
}

impl Registry {
    /// The supported layer kinds.
    pub fn standard() -> Self {
        let mut reg = Self {
            entries: BTreeMap::new(),
        };
        reg.insert("Input", build_input, "");
        reg.insert("Dense", build_dense, "nnet::compute_layer");
        reg.insert("BatchNormalization", build_batchnorm, "nnet::normalize");
        reg.insert("Activation", build_activation, "nnet::activation");
        reg.insert(
            "BatchNormalizationQuantizedTanh",
            build_bn_quant_tanh,
            "nnet::normalize_binary_tanh",
        );
        reg
    }

    fn insert(&mut self, kind: &'static str, build: KindBuilder, template: &'static str) {
        self.entries.insert(kind, RegistryEntry { build, template });
    }

    pub fn get(&self, kind: &str) -> Option<&RegistryEntry> {
        self.entries.get(kind)
    }

    /// Construct a layer kind from a loader attribute record.
    pub fn build(&self, kind: &str, attrs: &Attributes) -> Result<LayerKind> {
        let entry = self.get(kind).ok_or_else(|| {
            CompileError::UnsupportedConfig(format!("unknown layer kind `{kind}`"))
        })?;
        (entry.build)(attrs)
    }

    pub fn kinds(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.entries.keys().copied()
    }
}

fn require_size(attrs: &Attributes, key: &str) -> Result<usize> {
    let v = attrs.get_int(key).ok_or_else(|| {
        CompileError::UnsupportedConfig(format!("missing integer attribute `{key}`"))
    })?;
    usize::try_from(v).map_err(|_| {
        CompileError::UnsupportedConfig(format!("attribute `{key}` is negative: {v}"))
    })
}

fn build_input(attrs: &Attributes) -> Result<LayerKind> {
    let n_in = require_size(attrs, "n_in")?;
    let precision = match attrs.get_text("precision") {
        Some(spec) => Precision::parse(spec)?,
        None => *crate::precision::DEFAULT_PRECISION,
    };
    Ok(LayerKind::Input(Input {
        shape: vec![n_in],
        precision,
    }))
}

fn build_dense(attrs: &Attributes) -> Result<LayerKind> {
    Ok(LayerKind::Dense(Dense {
        fan_in: require_size(attrs, "n_in")?,
        fan_out: require_size(attrs, "n_out")?,
    }))
}

fn build_batchnorm(attrs: &Attributes) -> Result<LayerKind> {
    Ok(LayerKind::BatchNorm(BatchNorm {
        n_in: require_size(attrs, "n_in")?,
    }))
}

fn build_activation(attrs: &Attributes) -> Result<LayerKind> {
    let activation = attrs.get_text("activation").ok_or_else(|| {
        CompileError::UnsupportedConfig("missing text attribute `activation`".to_string())
    })?;
    Ok(LayerKind::Activation(Activation::new(activation)))
}

fn build_bn_quant_tanh(attrs: &Attributes) -> Result<LayerKind> {
    let n_in = require_size(attrs, "n_in")?;
    let quantize = match attrs.get_int("quantize") {
        Some(2) => QuantizeLevel::Binary,
        Some(3) => QuantizeLevel::Ternary,
        other => {
            return Err(CompileError::UnsupportedConfig(format!(
                "attribute `quantize` must be 2 or 3, got {other:?}"
            )))
        }
    };
    Ok(LayerKind::BnQuantTanh(BnQuantTanh { n_in, quantize }))
}

/// One column of a tree's node table.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum Column {
    Int(Vec<i32>),
    Float(Vec<f64>),
    Size(Vec<usize>),
}

/// The node table of one compiled tree as `(field, column)` pairs, in
/// the field order the target's table literal expects.
pub fn tree_columns(tree: &Tree) -> Vec<(&'static str, Column)> {
    vec![
        ("feature", Column::Int(tree.feature.clone())),
        ("threshold", Column::Float(tree.threshold.clone())),
        ("value", Column::Float(tree.value.clone())),
        ("children_left", Column::Int(tree.children_left.clone())),
        ("children_right", Column::Int(tree.children_right.clone())),
        ("parent", Column::Int(tree.parent.clone())),
        ("depth", Column::Size(tree.depth.clone())),
    ]
}

/// Node tables for a whole ensemble, indexed `[round][class_group]`.
pub fn ensemble_tables(ensemble: &Ensemble) -> Vec<Vec<Vec<(&'static str, Column)>>> {
    ensemble
        .trees
        .iter()
        .map(|group| group.iter().map(tree_columns).collect())
        .collect()
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{
        layers::{bn_quant_tanh, Layer},
        precision::Precision,
        tensor::Variable,
        testing,
    };

    #[test]
    fn test_dense_config_params() {
        let graph = testing::binary_mlp(4, 3);
        let hw = HwConfig::default();
        let config = graph.get("fc1").unwrap().emit_config(&hw);
        assert_eq!(config.kind, "Dense");
        assert_eq!(config.params.get_int("n_in"), Some(4));
        assert_eq!(config.params.get_int("n_out"), Some(3));
        assert_eq!(config.params.get_int("reuse_factor"), Some(1));
        assert_eq!(config.params.get_text("io_type"), Some("io_parallel"));
    }

    #[test]
    fn test_plan_skips_input_call() {
        let graph = testing::binary_mlp(4, 4);
        let plan = plan_network(&graph, &HwConfig::default());
        assert_eq!(plan.configs.len(), 4);
        let called: Vec<&str> = plan.calls.iter().map(|c| c.layer.as_str()).collect();
        assert_eq!(called, vec!["fc1", "bn1", "act1"]);
        assert_eq!(plan.calls[0].inputs, vec!["in1_out".to_string()]);
        assert_eq!(plan.calls[0].output, "fc1_out");
        assert_eq!(plan.calls[0].weights, vec!["weight", "bias"]);

        let json = plan.to_json().unwrap();
        assert!(json.contains("nnet::compute_layer"));
        assert!(json.contains("io_parallel"));
    }

    #[test]
    fn test_fused_call_weight_names() {
        let p = Precision::fixed(16, 6).unwrap();
        let mut bn = Layer::new(
            "bn1",
            LayerKind::BatchNorm(BatchNorm { n_in: 2 }),
            vec!["fc1_out".to_string()],
        );
        bn.add_weight(Variable::weight("scale", vec![2], p, vec![1.0, 1.0]));
        bn.add_weight(Variable::weight("bias", vec![2], p, vec![0.0, 0.0]));
        bn.outputs = vec![Variable::output("bn1_out", vec![2], p)];

        let binary = bn_quant_tanh::fuse(&bn, QuantizeLevel::Binary, 0.5, p).unwrap();
        assert_eq!(binary.emit_call().weights, vec!["threshold"]);
        assert_eq!(binary.emit_call().template, "nnet::normalize_binary_tanh");

        let ternary = bn_quant_tanh::fuse(&bn, QuantizeLevel::Ternary, 0.5, p).unwrap();
        // hi before lo, matching the comparison order in hardware
        assert_eq!(
            ternary.emit_call().weights,
            vec!["threshold_hi", "threshold_lo"]
        );
    }

    #[test]
    fn test_registry_builds_kinds() {
        let reg = Registry::standard();
        let mut attrs = Attributes::default();
        attrs.set("n_in", 8usize);
        attrs.set("n_out", 4usize);
        let kind = reg.build("Dense", &attrs).unwrap();
        match kind {
            LayerKind::Dense(d) => {
                assert_eq!(d.fan_in, 8);
                assert_eq!(d.fan_out, 4);
            }
            other => panic!("expected Dense, got {other:?}"),
        }
        assert_eq!(reg.get("Dense").unwrap().template, "nnet::compute_layer");
        assert!(reg.build("Conv2D", &attrs).is_err());
    }

    #[test]
    fn test_registry_parses_input_precision() {
        let reg = Registry::standard();
        let mut attrs = Attributes::default();
        attrs.set("n_in", 16usize);
        attrs.set("precision", "ap_fixed<10,4>");
        match reg.build("Input", &attrs).unwrap() {
            LayerKind::Input(input) => {
                assert_eq!(input.shape, vec![16]);
                assert_eq!(input.precision, Precision::fixed(10, 4).unwrap());
            }
            other => panic!("expected Input, got {other:?}"),
        }
    }

    #[test]
    fn test_tree_columns_field_order() {
        let tree = Tree {
            feature: vec![-2],
            threshold: vec![-2.0],
            value: vec![0.5],
            children_left: vec![-1],
            children_right: vec![-1],
            parent: vec![-1],
            depth: vec![0],
        };
        let fields: Vec<&str> = tree_columns(&tree).iter().map(|(f, _)| *f).collect();
        assert_eq!(
            fields,
            vec![
                "feature",
                "threshold",
                "value",
                "children_left",
                "children_right",
                "parent",
                "depth"
            ]
        );
    }
}
