//! Test support: tracing initialization and shared graph fixtures.

use std::sync::Once;

use tracing_subscriber::EnvFilter;

use crate::{
    layers::{dense::WEIGHT_QUANTIZER_ATTR, Activation, BatchNorm, Dense, Input, Layer, LayerKind},
    model::ModelGraph,
    precision::Precision,
    tensor::Variable,
};

static INIT: Once = Once::new();

/// Install a subscriber honouring `RUST_LOG`; safe to call from every
/// test.
pub fn init_logger() {
    INIT.call_once(|| {
        tracing_subscriber::fmt()
            .with_env_filter(EnvFilter::from_default_env())
            .with_test_writer()
            .try_init()
            .ok();
    });
}

/// `Input -> (Dense -> BatchNorm -> Activation) x stages`, the shape a
/// quantization-aware trainer hands the loader. Dense weights carry a
/// binary quantizer attribute; activations are `binary_tanh`.
pub fn binary_mlp_stages(fan_in: usize, fan_out: usize, stages: usize) -> ModelGraph {
    let mut g = ModelGraph::new();
    g.append(Layer::new(
        "in1",
        LayerKind::Input(Input {
            shape: vec![fan_in],
            precision: Precision::fixed(16, 6).expect("valid"),
        }),
        vec![],
    ))
    .expect("append input");

    let mut upstream = "in1_out".to_string();
    let mut stage_fan_in = fan_in;
    for s in 1..=stages {
        let fc = format!("fc{s}");
        let mut dense = Layer::new(
            &fc,
            LayerKind::Dense(Dense {
                fan_in: stage_fan_in,
                fan_out,
            }),
            vec![upstream.clone()],
        );
        dense.attributes.set("n_in", stage_fan_in);
        dense.attributes.set("n_out", fan_out);
        dense.attributes.set(WEIGHT_QUANTIZER_ATTR, "binary");
        let p = Precision::fixed(16, 6).expect("valid");
        dense.add_weight(Variable::weight(
            "weight",
            vec![stage_fan_in, fan_out],
            p,
            vec![0.5; stage_fan_in * fan_out],
        ));
        dense.add_weight(Variable::weight(
            "bias",
            vec![fan_out],
            p,
            vec![0.1; fan_out],
        ));
        g.append(dense).expect("append dense");

        let bn = format!("bn{s}");
        let mut batchnorm = Layer::new(
            &bn,
            LayerKind::BatchNorm(BatchNorm { n_in: fan_out }),
            vec![format!("{fc}_out")],
        );
        batchnorm.add_weight(Variable::weight(
            "scale",
            vec![fan_out],
            p,
            vec![2.0; fan_out],
        ));
        batchnorm.add_weight(Variable::weight(
            "bias",
            vec![fan_out],
            p,
            vec![-1.0; fan_out],
        ));
        g.append(batchnorm).expect("append batchnorm");

        let act = format!("act{s}");
        g.append(Layer::new(
            &act,
            LayerKind::Activation(Activation::new("binary_tanh")),
            vec![format!("{bn}_out")],
        ))
        .expect("append activation");

        upstream = format!("{act}_out");
        stage_fan_in = fan_out;
    }
    g
}

/// Single-stage binary MLP: `in1 -> fc1 -> bn1 -> act1`.
pub fn binary_mlp(fan_in: usize, fan_out: usize) -> ModelGraph {
    binary_mlp_stages(fan_in, fan_out, 1)
}
