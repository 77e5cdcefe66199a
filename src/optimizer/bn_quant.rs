//! The binary/ternary fast-path passes: batch-norm + quantized-tanh
//! fusion, then backward requantization of the dense layer feeding a
//! fused node.

use crate::{
    error::{CompileError, Result},
    layers::{
        activation::MARGIN_ATTR,
        bn_quant_tanh,
        dense::WEIGHT_QUANTIZER_ATTR,
        Layer, LayerKind, OpInfo,
    },
    model::ModelGraph,
    optimizer::{Diagnostics, OptimizerPass},
    precision::accumulator_for_sum,
    quantization::WeightQuantizer,
};

/// Marker left on a dense layer whose quantizer could not be parsed, so
/// later traversals do not re-report the same bail-out.
const UNSUPPORTED_QUANTIZER_ATTR: &str = "weight_quantizer_unsupported";

/// Default dead-band half-width for ternary tanh.
const DEFAULT_MARGIN: f64 = 0.5;

/// Merge a batch-norm node with the binary/ternary tanh activation it
/// feeds. The affine transform folds into one (binary) or two (ternary)
/// comparison thresholds; the fused node takes the batch norm's place
/// and the activation is removed with rewiring, so two nodes become one.
pub struct MergeBatchNormQuantTanh;

impl OptimizerPass for MergeBatchNormQuantTanh {
    fn name(&self) -> &'static str {
        "merge_batchnorm_quantized_tanh"
    }

    fn matches(&self, layer: &Layer, graph: &ModelGraph) -> bool {
        let LayerKind::Activation(act) = &layer.kind else {
            return false;
        };
        if act.quantize_level().is_none() || layer.inputs.len() != 1 {
            return false;
        }
        matches!(
            graph.producer_of(&layer.inputs[0]),
            Some((producer, _)) if matches!(producer.kind, LayerKind::BatchNorm(_))
        )
    }

    fn transform(
        &self,
        node: &str,
        graph: &mut ModelGraph,
        _diags: &mut Diagnostics,
    ) -> Result<bool> {
        let act = graph
            .get(node)
            .ok_or_else(|| CompileError::structural(node, "matched layer vanished"))?;
        let LayerKind::Activation(kind) = &act.kind else {
            return Err(CompileError::structural(node, "expected an activation"));
        };
        let quantize = kind
            .quantize_level()
            .ok_or_else(|| CompileError::structural(node, "activation is not quantized"))?;
        let margin = act
            .attributes
            .get_float(MARGIN_ATTR)
            .unwrap_or(DEFAULT_MARGIN);

        let bn = graph.single_producer(node)?.clone();
        // The threshold grid is the batch norm's input precision: that is
        // the type the comparison hardware sees.
        let (_, bn_input) = graph.producer_of(&bn.inputs[0]).ok_or_else(|| {
            CompileError::structural(
                &bn.name,
                format!("input reference `{}` does not resolve", bn.inputs[0]),
            )
        })?;
        let fused = bn_quant_tanh::fuse(&bn, quantize, margin, bn_input.precision)?;

        graph.replace(&bn.name, fused)?;
        graph.remove(node, true)?;
        Ok(true)
    }
}

/// Once a dense layer's consumer is the fused batch-norm + quantized
/// tanh, its weights can be held at the quantizer's native bit width and
/// its accumulator sized exactly for a sum of +-1 terms. The new
/// accumulator precision is propagated backward into the fused
/// consumer's thresholds, re-floored onto the integer grid.
pub struct QuantizeDenseOutput;

impl OptimizerPass for QuantizeDenseOutput {
    fn name(&self) -> &'static str {
        "quantize_dense_output"
    }

    fn matches(&self, layer: &Layer, graph: &ModelGraph) -> bool {
        let LayerKind::Dense(_) = &layer.kind else {
            return false;
        };
        if layer.attributes.get_text(WEIGHT_QUANTIZER_ATTR).is_none()
            || layer.attributes.get("accum_t").is_some()
            || layer.attributes.get(UNSUPPORTED_QUANTIZER_ATTR).is_some()
            || layer.inputs.len() != 1
        {
            return false;
        }
        matches!(
            graph.producer_of(&layer.inputs[0]),
            Some((producer, _)) if matches!(producer.kind, LayerKind::BnQuantTanh(_))
        )
    }

    fn transform(
        &self,
        node: &str,
        graph: &mut ModelGraph,
        diags: &mut Diagnostics,
    ) -> Result<bool> {
        let layer = graph
            .get(node)
            .ok_or_else(|| CompileError::structural(node, "matched layer vanished"))?;
        let LayerKind::Dense(dense) = &layer.kind else {
            return Err(CompileError::structural(node, "expected a dense layer"));
        };
        let fan_in = dense.fan_in;
        let quantizer_name = layer
            .attributes
            .get_text(WEIGHT_QUANTIZER_ATTR)
            .unwrap_or_default()
            .to_string();

        let Some(quantizer) = WeightQuantizer::parse(&quantizer_name) else {
            diags.warn(
                node,
                format!("unknown weight quantizer `{quantizer_name}`, leaving layer untransformed"),
            );
            if let Some(layer) = graph.get_mut(node) {
                layer.attributes.set(UNSUPPORTED_QUANTIZER_ATTR, 1i64);
            }
            return Ok(false);
        };

        // Output precision is the accumulator of fan_in one-bit terms.
        let accum = accumulator_for_sum(fan_in);
        let layer = graph
            .get_mut(node)
            .ok_or_else(|| CompileError::structural(node, "matched layer vanished"))?;
        layer.attributes.set("accum_t", accum.to_string());
        layer.output_mut()?.precision = accum;

        let weight = layer.weight_mut("weight")?;
        let quantized = quantizer.quantize(weight.data()?);
        weight.set_data(quantized);
        weight.precision = quantizer.precision();

        // Binary/ternary layers fold the bias into the *following* batch
        // norm's threshold, so it is zeroed here, at the quantized width.
        let bias = layer.weight_mut("bias")?;
        let zeros = vec![0.0; bias.size()];
        bias.set_data(zeros);
        bias.precision = quantizer.precision();

        // Re-floor the thresholds of an immediately following fused node
        // onto the new accumulator grid.
        let out_name = layer.output()?.name.clone();
        for consumer in graph.consumers_of(&out_name) {
            let Some(consumer_layer) = graph.get_mut(&consumer) else {
                continue;
            };
            let LayerKind::BnQuantTanh(kind) = &consumer_layer.kind else {
                continue;
            };
            for threshold_name in kind.weight_order() {
                let threshold = consumer_layer.weight_mut(threshold_name)?;
                threshold.precision = accum;
                threshold.map_data(|v| accum.quantize_threshold(v));
            }
        }
        Ok(false)
    }
}
