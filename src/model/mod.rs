//! The layer-graph intermediate representation.
//!
//! A [`ModelGraph`] is an insertion-ordered association of layer name to
//! [`Layer`]; iteration order is load-bearing and doubles as the
//! topological/dataflow order. The structural-edit operations defined
//! here are the only sanctioned mutation path: built once by the loader,
//! mutated in place by optimizer passes, consumed read-only by emission.
//! After any sequence of edits the graph must still pass
//! [`ModelGraph::check_integrity`]; the optimizer driver checks this
//! after every pass traversal rather than assuming it.

use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};

use crate::{
    error::{CompileError, Result},
    layers::{Layer, OpInfo},
    precision::Precision,
    tensor::Variable,
};

#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct ModelGraph {
    order: Vec<String>,
    layers: HashMap<String, Layer>,
}

impl ModelGraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.layers.contains_key(name)
    }

    pub fn get(&self, name: &str) -> Option<&Layer> {
        self.layers.get(name)
    }

    pub fn get_mut(&mut self, name: &str) -> Option<&mut Layer> {
        self.layers.get_mut(name)
    }

    /// Layers in dataflow order.
    pub fn iter(&self) -> impl Iterator<Item = &Layer> {
        self.order.iter().filter_map(|name| self.layers.get(name))
    }

    /// Snapshot of the current iteration order; passes traverse this so
    /// that their own edits do not invalidate the walk.
    pub fn names(&self) -> Vec<String> {
        self.order.clone()
    }

    /// The layer producing the output variable `var_name`, with the
    /// variable itself.
    pub fn producer_of(&self, var_name: &str) -> Option<(&Layer, &Variable)> {
        self.iter().find_map(|layer| {
            layer
                .outputs
                .iter()
                .find(|v| v.name == var_name)
                .map(|v| (layer, v))
        })
    }

    /// Names of every layer referencing the output variable `var_name`.
    pub fn consumers_of(&self, var_name: &str) -> Vec<String> {
        self.iter()
            .filter(|layer| layer.inputs.iter().any(|i| i == var_name))
            .map(|layer| layer.name.clone())
            .collect()
    }

    /// The sole upstream producer of `layer_name`. Structural error if
    /// the layer has more or fewer than one input reference.
    pub fn single_producer(&self, layer_name: &str) -> Result<&Layer> {
        let layer = self.expect(layer_name)?;
        if layer.inputs.len() != 1 {
            return Err(CompileError::structural(
                layer_name,
                format!("expected a sole producer, found {}", layer.inputs.len()),
            ));
        }
        self.producer_of(&layer.inputs[0])
            .map(|(producer, _)| producer)
            .ok_or_else(|| {
                CompileError::structural(
                    layer_name,
                    format!("input reference `{}` does not resolve", layer.inputs[0]),
                )
            })
    }

    /// Loader-facing append: resolves the input references, infers the
    /// output variable and pushes the layer at the end of the order.
    pub fn append(&mut self, mut layer: Layer) -> Result<()> {
        if self.contains(&layer.name) {
            return Err(CompileError::structural(
                &layer.name,
                "a layer with this name already exists",
            ));
        }
        if layer.outputs.is_empty() {
            let inputs = self.resolve_inputs(&layer)?;
            layer.infer_output_from(&inputs)?;
        }
        self.check_new_outputs(&layer)?;
        self.order.push(layer.name.clone());
        self.layers.insert(layer.name.clone(), layer);
        Ok(())
    }

    /// Atomic swap of the layer at `name`, preserving its position so the
    /// name keeps anchoring the dataflow for every downstream reference.
    pub fn replace(&mut self, name: &str, new_layer: Layer) -> Result<()> {
        if new_layer.name != name {
            return Err(CompileError::structural(
                name,
                format!("replacement is named `{}`; the anchor name must be kept", new_layer.name),
            ));
        }
        if !self.contains(name) {
            return Err(CompileError::structural(name, "no such layer to replace"));
        }
        self.layers.insert(name.to_string(), new_layer);
        Ok(())
    }

    /// Delete a layer. With `rewire`, every consumer of the removed
    /// layer's outputs is repointed at the removed layer's sole upstream
    /// producer; a removed layer with more than one producer is a
    /// structural error (fusion passes only ever remove single-input
    /// nodes).
    pub fn remove(&mut self, name: &str, rewire: bool) -> Result<()> {
        let layer = self.expect(name)?;
        if rewire {
            if layer.inputs.len() != 1 {
                return Err(CompileError::structural(
                    name,
                    format!(
                        "cannot rewire around a layer with {} producers",
                        layer.inputs.len()
                    ),
                ));
            }
            let upstream = layer.inputs[0].clone();
            let removed: HashSet<String> =
                layer.outputs.iter().map(|v| v.name.clone()).collect();
            for other in self.layers.values_mut() {
                for input in other.inputs.iter_mut() {
                    if removed.contains(input) {
                        *input = upstream.clone();
                    }
                }
            }
        }
        self.order.retain(|n| n != name);
        self.layers.remove(name);
        Ok(())
    }

    /// Insert `layer` immediately after `anchor` in iteration order,
    /// keeping topological order consistent with dataflow order when a
    /// fusion introduces a new node.
    pub fn insert_after(&mut self, anchor: &str, mut layer: Layer) -> Result<()> {
        let pos = self
            .order
            .iter()
            .position(|n| n == anchor)
            .ok_or_else(|| CompileError::structural(anchor, "no such anchor layer"))?;
        if self.contains(&layer.name) {
            return Err(CompileError::structural(
                &layer.name,
                "a layer with this name already exists",
            ));
        }
        if layer.outputs.is_empty() {
            let inputs = self.resolve_inputs(&layer)?;
            layer.infer_output_from(&inputs)?;
        }
        self.check_new_outputs(&layer)?;
        self.order.insert(pos + 1, layer.name.clone());
        self.layers.insert(layer.name.clone(), layer);
        Ok(())
    }

    /// Walk every layer once: input references matching `old` are
    /// repointed at `new`, and an owned output variable named `old` is
    /// renamed to `new` with its precision set to `new_type`. Renames are
    /// visible to every consumer because references are by name only.
    pub fn rename_consumers(&mut self, old: &str, new: &str, new_type: Precision) {
        for layer in self.layers.values_mut() {
            for input in layer.inputs.iter_mut() {
                if input == old {
                    *input = new.to_string();
                }
            }
            for out in layer.outputs.iter_mut() {
                if out.name == old {
                    out.name = new.to_string();
                    out.precision = new_type;
                }
            }
        }
    }

    /// Layers tagged as graph sources.
    pub fn graph_inputs(&self) -> Vec<&Layer> {
        self.iter().filter(|l| l.is_input()).collect()
    }

    /// Output variables no layer consumes.
    pub fn graph_outputs(&self) -> Vec<&Variable> {
        let consumed: HashSet<&str> = self
            .iter()
            .flat_map(|l| l.inputs.iter().map(String::as_str))
            .collect();
        self.iter()
            .flat_map(|l| l.outputs.iter())
            .filter(|v| !consumed.contains(v.name.as_str()))
            .collect()
    }

    /// Verify the invariants every edit sequence must preserve: the graph
    /// is acyclic and topologically sorted (every input reference
    /// resolves to an output defined earlier in the order), output names
    /// are unique process-wide, and each layer's declared input count
    /// matches its kind.
    pub fn check_integrity(&self) -> Result<()> {
        if self.order.len() != self.layers.len() {
            return Err(CompileError::structural(
                "<graph>",
                "iteration order and layer map disagree",
            ));
        }
        let mut seen: HashSet<&str> = HashSet::new();
        for name in &self.order {
            let layer = self.layers.get(name).ok_or_else(|| {
                CompileError::structural(name, "ordered name missing from the layer map")
            })?;
            let expected = layer.kind.op().expected_inputs();
            if layer.inputs.len() != expected {
                return Err(CompileError::structural(
                    name,
                    format!(
                        "{} expects {} input(s), got {}",
                        layer.kind.op().kind_name(),
                        expected,
                        layer.inputs.len()
                    ),
                ));
            }
            for input in &layer.inputs {
                if !seen.contains(input.as_str()) {
                    return Err(CompileError::structural(
                        name,
                        format!("input reference `{input}` does not resolve to an earlier output"),
                    ));
                }
            }
            for out in &layer.outputs {
                if !seen.insert(out.name.as_str()) {
                    return Err(CompileError::structural(
                        name,
                        format!("duplicate output variable name `{}`", out.name),
                    ));
                }
            }
        }
        Ok(())
    }

    fn expect(&self, name: &str) -> Result<&Layer> {
        self.get(name)
            .ok_or_else(|| CompileError::structural(name, "no such layer"))
    }

    fn resolve_inputs(&self, layer: &Layer) -> Result<Vec<&Variable>> {
        layer
            .inputs
            .iter()
            .map(|input| {
                self.producer_of(input).map(|(_, v)| v).ok_or_else(|| {
                    CompileError::structural(
                        &layer.name,
                        format!("input reference `{input}` does not resolve"),
                    )
                })
            })
            .collect()
    }

    fn check_new_outputs(&self, layer: &Layer) -> Result<()> {
        for out in &layer.outputs {
            if self.producer_of(&out.name).is_some() {
                return Err(CompileError::structural(
                    &layer.name,
                    format!("duplicate output variable name `{}`", out.name),
                ));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{
        layers::{Activation, BatchNorm, Dense, Input, LayerKind},
        testing,
    };

    fn mlp() -> ModelGraph {
        testing::binary_mlp(4, 4)
    }

    #[test]
    fn test_append_resolves_and_orders() {
        let g = mlp();
        assert_eq!(g.len(), 4);
        let names: Vec<&str> = g.iter().map(|l| l.name.as_str()).collect();
        assert_eq!(names, vec!["in1", "fc1", "bn1", "act1"]);
        g.check_integrity().unwrap();
    }

    #[test]
    fn test_append_rejects_dangling_reference() {
        let mut g = ModelGraph::new();
        let layer = Layer::new(
            "fc1",
            LayerKind::Dense(Dense {
                fan_in: 4,
                fan_out: 4,
            }),
            vec!["nope_out".to_string()],
        );
        let err = g.append(layer).unwrap_err();
        assert!(matches!(err, CompileError::Structural { .. }));
    }

    #[test]
    fn test_append_rejects_duplicate_name() {
        let mut g = mlp();
        let layer = Layer::new(
            "fc1",
            LayerKind::Dense(Dense {
                fan_in: 4,
                fan_out: 4,
            }),
            vec!["in1_out".to_string()],
        );
        assert!(g.append(layer).is_err());
    }

    #[test]
    fn test_remove_with_rewire_repoints_consumers() {
        let mut g = mlp();
        g.remove("bn1", true).unwrap();
        assert_eq!(g.len(), 3);
        assert_eq!(g.get("act1").unwrap().inputs, vec!["fc1_out".to_string()]);
        g.check_integrity().unwrap();
    }

    #[test]
    fn test_remove_without_rewire_leaves_dangling() {
        let mut g = mlp();
        g.remove("bn1", false).unwrap();
        let err = g.check_integrity().unwrap_err();
        assert!(err.to_string().contains("bn1_out"));
    }

    #[test]
    fn test_insert_after_keeps_order() {
        let mut g = mlp();
        let mut extra = Layer::new(
            "bn2",
            LayerKind::BatchNorm(BatchNorm { n_in: 4 }),
            vec!["fc1_out".to_string()],
        );
        extra.outputs = vec![Variable::output(
            "bn2_out",
            vec![4],
            Precision::fixed(16, 6).unwrap(),
        )];
        g.insert_after("fc1", extra).unwrap();
        let names: Vec<&str> = g.iter().map(|l| l.name.as_str()).collect();
        assert_eq!(names, vec!["in1", "fc1", "bn2", "bn1", "act1"]);
    }

    #[test]
    fn test_rename_consumers_updates_refs_and_variable() {
        let mut g = mlp();
        let p = Precision::integer(6, true);
        g.rename_consumers("fc1_out", "fc1_acc", p);
        assert_eq!(g.get("bn1").unwrap().inputs, vec!["fc1_acc".to_string()]);
        let fc1_out = g.get("fc1").unwrap().output().unwrap();
        assert_eq!(fc1_out.name, "fc1_acc");
        assert_eq!(fc1_out.precision, p);
        g.check_integrity().unwrap();
    }

    #[test]
    fn test_single_producer() {
        let g = mlp();
        assert_eq!(g.single_producer("act1").unwrap().name, "bn1");
        assert!(g.single_producer("in1").is_err());
    }

    #[test]
    fn test_graph_io_discovery() {
        let g = mlp();
        assert_eq!(g.graph_inputs().len(), 1);
        let outs = g.graph_outputs();
        assert_eq!(outs.len(), 1);
        assert_eq!(outs[0].name, "act1_out");
    }

    #[test]
    fn test_replace_requires_anchor_name() {
        let mut g = mlp();
        let imposter = Layer::new(
            "something_else",
            LayerKind::Activation(Activation::new("relu")),
            vec!["bn1_out".to_string()],
        );
        assert!(g.replace("act1", imposter).is_err());
    }

    #[test]
    fn test_input_layer_has_no_producers() {
        let mut g = ModelGraph::new();
        g.append(Layer::new(
            "in1",
            LayerKind::Input(Input {
                shape: vec![4],
                precision: Precision::fixed(16, 6).unwrap(),
            }),
            vec![],
        ))
        .unwrap();
        g.check_integrity().unwrap();
    }
}
