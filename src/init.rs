// Parameter initialization over VarBuilder.
//
// BERT style: linear weights N(0, 0.02), biases 0, LayerNorm (1, 0).
// Xavier uniform: U(-a, a) with a = sqrt(6 / (fan_in + fan_out)).

use anyhow::Result;
use candle_core::{Shape, Tensor};
use candle_nn::{Init, LayerNorm, Linear, VarBuilder};

pub const BERT_INIT_STD: f64 = 0.02;
pub const LAYER_NORM_EPS: f64 = 1e-5;

pub fn bert_linear(in_dim: usize, out_dim: usize, vb: VarBuilder) -> Result<Linear> {
    let weight = vb.get_with_hints(
        (out_dim, in_dim),
        "weight",
        Init::Randn {
            mean: 0.0,
            stdev: BERT_INIT_STD,
        },
    )?;
    let bias = vb.get_with_hints(out_dim, "bias", Init::Const(0.0))?;
    Ok(Linear::new(weight, Some(bias)))
}

pub fn xavier_init(fan_in: usize, fan_out: usize) -> Init {
    let bound = (6.0 / (fan_in + fan_out) as f64).sqrt();
    Init::Uniform {
        lo: -bound,
        up: bound,
    }
}

pub fn xavier_linear(in_dim: usize, out_dim: usize, vb: VarBuilder) -> Result<Linear> {
    let weight = vb.get_with_hints((out_dim, in_dim), "weight", xavier_init(in_dim, out_dim))?;
    let bias = vb.get_with_hints(out_dim, "bias", Init::Const(0.0))?;
    Ok(Linear::new(weight, Some(bias)))
}

pub fn layer_norm(dim: usize, vb: VarBuilder) -> Result<LayerNorm> {
    let weight = vb.get_with_hints(dim, "weight", Init::Const(1.0))?;
    let bias = vb.get_with_hints(dim, "bias", Init::Const(0.0))?;
    Ok(LayerNorm::new(weight, bias, LAYER_NORM_EPS))
}

/// A free parameter tensor drawn from N(0, std).
pub fn normal_param<S: Into<Shape>>(shape: S, name: &str, std: f64, vb: &VarBuilder) -> Result<Tensor> {
    vb.get_with_hints(shape, name, Init::Randn { mean: 0.0, stdev: std })
        .map_err(Into::into)
}
