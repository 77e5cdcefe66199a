//! Folds away `linear` activations: pure pass-throughs the trainer
//! leaves behind. The consumer ends up referencing the prior producer's
//! output under its original name and type.

use crate::{
    error::{CompileError, Result},
    layers::{Layer, LayerKind},
    model::ModelGraph,
    optimizer::{Diagnostics, OptimizerPass},
};

pub struct EliminateLinearActivation;

impl OptimizerPass for EliminateLinearActivation {
    fn name(&self) -> &'static str {
        "eliminate_linear_activation"
    }

    fn matches(&self, layer: &Layer, _graph: &ModelGraph) -> bool {
        match &layer.kind {
            LayerKind::Activation(act) => act.is_linear() && layer.inputs.len() == 1,
            _ => false,
        }
    }

    fn transform(
        &self,
        node: &str,
        graph: &mut ModelGraph,
        _diags: &mut Diagnostics,
    ) -> Result<bool> {
        let layer = graph
            .get(node)
            .ok_or_else(|| CompileError::structural(node, "matched layer vanished"))?;
        let upstream = layer.inputs[0].clone();
        let out_name = layer.output()?.name.clone();
        let (_, upstream_var) = graph.producer_of(&upstream).ok_or_else(|| {
            CompileError::structural(node, format!("input reference `{upstream}` does not resolve"))
        })?;
        let upstream_precision = upstream_var.precision;

        graph.remove(node, false)?;
        graph.rename_consumers(&out_name, &upstream, upstream_precision);
        Ok(true)
    }
}
