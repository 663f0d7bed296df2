// Name -> constructor tables for scene encoders and point backbones.

use anyhow::Result;
use candle_nn::VarBuilder;

use crate::backbone::{PointBackbone, PointNetBackbone};
use crate::config::{BackboneConfig, Ose3dConfig};
use crate::error::ConfigError;
use crate::ose3d::{Ose3d, SceneEncoder};

type EncoderCtor = fn(&Ose3dConfig, VarBuilder) -> Result<Box<dyn SceneEncoder>>;
type BackboneCtor = fn(&BackboneConfig, VarBuilder) -> Result<Box<dyn PointBackbone>>;

const SCENE_ENCODERS: &[(&str, EncoderCtor)] = &[(Ose3d::NAME, build_ose3d)];

const BACKBONES: &[(&str, BackboneCtor)] = &[("pointnet", build_pointnet)];

fn build_ose3d(cfg: &Ose3dConfig, vb: VarBuilder) -> Result<Box<dyn SceneEncoder>> {
    Ok(Box::new(Ose3d::new(cfg, vb)?))
}

fn build_pointnet(cfg: &BackboneConfig, vb: VarBuilder) -> Result<Box<dyn PointBackbone>> {
    Ok(Box::new(PointNetBackbone::new(cfg, vb)?))
}

/// Registered scene encoder names.
pub fn module_names() -> impl Iterator<Item = &'static str> {
    SCENE_ENCODERS.iter().map(|(name, _)| *name)
}

pub fn build_module(name: &str, cfg: &Ose3dConfig, vb: VarBuilder) -> Result<Box<dyn SceneEncoder>> {
    let (_, ctor) = SCENE_ENCODERS
        .iter()
        .find(|(n, _)| *n == name)
        .ok_or_else(|| ConfigError::UnknownModule {
            kind: "scene encoder",
            name: name.to_string(),
        })?;
    ctor(cfg, vb)
}

/// Build the backbone named by `cfg.name`.
pub fn build_backbone(cfg: &BackboneConfig, vb: VarBuilder) -> Result<Box<dyn PointBackbone>> {
    let (_, ctor) = BACKBONES
        .iter()
        .find(|(n, _)| *n == cfg.name)
        .ok_or_else(|| ConfigError::UnknownModule {
            kind: "point backbone",
            name: cfg.name.clone(),
        })?;
    ctor(cfg, vb)
}
