//! Compiler core turning trained model descriptions into
//! hardware-ready intermediate form.
//!
//! Two front doors: [`compile_network`] lowers a layer graph through the
//! rewrite pipeline (batch-norm fusion into quantized-tanh thresholds,
//! requantization of binary/ternary dense layers), and
//! [`compile_ensemble`] normalizes a boosted-decision-tree ensemble into
//! perfectly balanced trees ready for static table emission. Both return
//! structured [`CompileError`]s on malformed input; recoverable
//! quantizer findings come back as warnings, never as failures.

pub mod bdt;
pub mod emit;
pub mod error;
pub mod layers;
pub mod model;
pub mod optimizer;
pub mod precision;
pub mod quantization;
pub mod tensor;
#[cfg(test)]
pub mod testing;

pub use bdt::{Ensemble, RawEnsemble};
pub use error::{CompileError, Result};
pub use layers::{Layer, LayerKind};
pub use model::ModelGraph;
pub use optimizer::{OptimizeReport, Optimizer, PassPolicy};
pub use precision::Precision;

use tracing::info;

/// Lower a network graph. Validates integrity and the single
/// input/single output interface contract, then runs the optimizer's
/// pass pipeline. The graph is mutated in place; the report carries
/// transform counts and collected warnings.
pub fn compile_network(
    graph: &mut ModelGraph,
    optimizer: &Optimizer,
) -> Result<OptimizeReport> {
    graph.check_integrity()?;
    let inputs = graph.graph_inputs().len();
    if inputs != 1 {
        return Err(CompileError::UnsupportedConfig(format!(
            "expected exactly one model input, found {inputs}"
        )));
    }
    let outputs = graph.graph_outputs().len();
    if outputs != 1 {
        return Err(CompileError::UnsupportedConfig(format!(
            "expected exactly one model output, found {outputs}"
        )));
    }
    let report = optimizer.optimize(graph)?;
    info!(
        layers = graph.len(),
        transforms = report.transforms,
        warnings = report.warnings.len(),
        "network lowered"
    );
    Ok(report)
}

/// Normalize a boosted-decision-tree ensemble for table emission.
pub fn compile_ensemble(raw: &RawEnsemble) -> Result<Ensemble> {
    let ensemble = bdt::compile_ensemble(raw)?;
    info!(
        trees = ensemble.n_trees,
        max_depth = ensemble.max_depth,
        "ensemble balanced"
    );
    Ok(ensemble)
}
