// Per-object point-cloud encoders.
//
// The fusion module only relies on the PointBackbone contract:
// (B, N, P, 6) xyz + rgb points in, (B, N, out_dim) object features out.

use anyhow::Result;
use candle_core::{Module, Tensor};
use candle_nn::{linear, Linear, VarBuilder};

use crate::config::BackboneConfig;

pub trait PointBackbone: Send + Sync {
    fn out_dim(&self) -> usize;

    fn forward(&self, obj_fts: &Tensor, train: bool) -> Result<Tensor>;
}

/// Shared per-point MLP followed by a max-pool over the points of each object.
pub struct PointNetBackbone {
    layers: Vec<Linear>,
    out_dim: usize,
}

impl PointNetBackbone {
    pub const POINT_DIM: usize = 6;

    pub fn new(cfg: &BackboneConfig, vb: VarBuilder) -> Result<Self> {
        let mut layers = Vec::with_capacity(cfg.hidden_dims.len() + 1);
        let mut in_dim = Self::POINT_DIM;
        for (i, &dim) in cfg.hidden_dims.iter().chain(std::iter::once(&cfg.out_dim)).enumerate() {
            layers.push(linear(in_dim, dim, vb.pp(format!("mlp.{i}")))?);
            in_dim = dim;
        }
        Ok(Self {
            layers,
            out_dim: cfg.out_dim,
        })
    }
}

impl PointBackbone for PointNetBackbone {
    fn out_dim(&self) -> usize {
        self.out_dim
    }

    fn forward(&self, obj_fts: &Tensor, _train: bool) -> Result<Tensor> {
        let (b, n, p, c) = obj_fts.dims4()?;
        let mut x = obj_fts.reshape((b * n, p, c))?;
        for (i, layer) in self.layers.iter().enumerate() {
            x = layer.forward(&x)?;
            if i + 1 < self.layers.len() {
                x = x.relu()?;
            }
        }
        // max over points
        x.max(1)?.reshape((b, n, self.out_dim)).map_err(Into::into)
    }
}
