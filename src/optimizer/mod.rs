//! Pass-based graph-rewrite optimizer.
//!
//! A pass is a match predicate plus a transform over the graph. The
//! driver walks the graph once per pass in the current topological
//! order; a transform may mutate the graph freely, including removing or
//! inserting nodes other than the matched one, and reports whether the
//! matched node itself should be treated as removed for the remainder of
//! the traversal. Passes run in registration order: this is an open
//! pipeline of order-sensitive rewrites (structural fusion before
//! requantization), not a confluent rewrite system.

pub mod bn_quant;
pub mod eliminate_linear;

use std::collections::HashSet;
use std::fmt;

use tracing::{debug, warn};

use crate::{
    error::Result,
    layers::Layer,
    model::ModelGraph,
};
pub use bn_quant::{MergeBatchNormQuantTanh, QuantizeDenseOutput};
pub use eliminate_linear::EliminateLinearActivation;

/// Non-fatal finding attached to a layer, reported alongside a still
/// usable result.
#[derive(Debug, Clone)]
pub struct Diagnostic {
    pub layer: String,
    pub message: String,
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.layer, self.message)
    }
}

#[derive(Debug, Default)]
pub struct Diagnostics {
    warnings: Vec<Diagnostic>,
}

impl Diagnostics {
    pub fn warn(&mut self, layer: impl Into<String>, message: impl Into<String>) {
        let layer = layer.into();
        let message = message.into();
        warn!(layer = %layer, "{message}");
        self.warnings.push(Diagnostic { layer, message });
    }

    pub fn warnings(&self) -> &[Diagnostic] {
        &self.warnings
    }
}

pub trait OptimizerPass {
    fn name(&self) -> &'static str;

    /// Whether `layer` is a rewrite candidate in the current graph.
    fn matches(&self, layer: &Layer, graph: &ModelGraph) -> bool;

    /// Rewrite the graph at the matched node. Returns whether the node
    /// itself was removed, so the driver does not revisit it within the
    /// current traversal.
    fn transform(
        &self,
        node: &str,
        graph: &mut ModelGraph,
        diags: &mut Diagnostics,
    ) -> Result<bool>;
}

/// Pass scheduling policy. The original system runs each pass as a
/// single traversal, relying on registration order to sequence the
/// lowering; `ToFixpoint` re-runs the whole pipeline until no transform
/// fires, catching opportunities a mis-ordered pipeline would miss.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PassPolicy {
    SinglePass,
    ToFixpoint,
}

/// Safety valve for `ToFixpoint` against a pass that never quiesces.
const MAX_FIXPOINT_ITERATIONS: usize = 10;

#[derive(Debug)]
pub struct OptimizeReport {
    /// Total number of transforms that fired.
    pub transforms: usize,
    /// Pipeline iterations executed (always 1 under `SinglePass`).
    pub iterations: usize,
    pub warnings: Vec<Diagnostic>,
}

/// Pass pipeline with an explicit registration table; construct once and
/// pass by reference wherever optimization runs.
pub struct Optimizer {
    passes: Vec<Box<dyn OptimizerPass>>,
    policy: PassPolicy,
}

impl Optimizer {
    pub fn new(policy: PassPolicy) -> Self {
        Self {
            passes: Vec::new(),
            policy,
        }
    }

    /// The standard lowering pipeline: fold pass-through activations,
    /// fuse batch norm into quantized tanh thresholds, then requantize
    /// dense outputs against their fused producers.
    pub fn standard(policy: PassPolicy) -> Self {
        let mut opt = Self::new(policy);
        opt.register(Box::new(EliminateLinearActivation));
        opt.register(Box::new(MergeBatchNormQuantTanh));
        opt.register(Box::new(QuantizeDenseOutput));
        opt
    }

    pub fn register(&mut self, pass: Box<dyn OptimizerPass>) {
        self.passes.push(pass);
    }

    /// Run every pass over the graph per the scheduling policy. Graph
    /// integrity is re-checked after each pass traversal; a violation
    /// aborts the whole compilation.
    pub fn optimize(&self, graph: &mut ModelGraph) -> Result<OptimizeReport> {
        let mut diags = Diagnostics::default();
        let mut transforms = 0;
        let mut iterations = 0;
        loop {
            iterations += 1;
            let mut fired = 0;
            for pass in &self.passes {
                fired += self.run_traversal(pass.as_ref(), graph, &mut diags)?;
                graph.check_integrity()?;
            }
            transforms += fired;
            match self.policy {
                PassPolicy::SinglePass => break,
                PassPolicy::ToFixpoint if fired == 0 => break,
                PassPolicy::ToFixpoint if iterations >= MAX_FIXPOINT_ITERATIONS => {
                    warn!("fixpoint not reached after {iterations} iterations, stopping");
                    break;
                }
                PassPolicy::ToFixpoint => {}
            }
        }
        Ok(OptimizeReport {
            transforms,
            iterations,
            warnings: diags.warnings,
        })
    }

    fn run_traversal(
        &self,
        pass: &dyn OptimizerPass,
        graph: &mut ModelGraph,
        diags: &mut Diagnostics,
    ) -> Result<usize> {
        let mut fired = 0;
        let mut removed: HashSet<String> = HashSet::new();
        // Traverse a snapshot of the order so the pass's own edits do
        // not invalidate the walk.
        for name in graph.names() {
            if removed.contains(&name) {
                continue;
            }
            let matched = match graph.get(&name) {
                Some(layer) => pass.matches(layer, graph),
                // deleted by an earlier transform in this traversal
                None => continue,
            };
            if !matched {
                continue;
            }
            debug!(pass = pass.name(), node = %name, "applying transform");
            if pass.transform(&name, graph, diags)? {
                removed.insert(name);
            }
            fired += 1;
        }
        Ok(fired)
    }
}
