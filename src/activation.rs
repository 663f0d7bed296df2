// Feed-forward nonlinearities, selected by name from config.

use std::fmt;
use std::str::FromStr;

use anyhow::Result;
use candle_core::{Tensor, D};
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase", try_from = "String")]
pub enum Activation {
    Relu,
    Gelu,
    /// Gated linear unit: halves the last dimension.
    Glu,
}

impl Activation {
    pub fn apply(&self, x: &Tensor) -> Result<Tensor> {
        match self {
            Self::Relu => x.relu().map_err(Into::into),
            Self::Gelu => x.gelu_erf().map_err(Into::into),
            Self::Glu => {
                let half = x.dim(D::Minus1)? / 2;
                let a = x.narrow(D::Minus1, 0, half)?;
                let b = x.narrow(D::Minus1, half, half)?;
                (a * candle_nn::ops::sigmoid(&b)?).map_err(Into::into)
            }
        }
    }

    /// Width of the output for an input of width `d`.
    pub fn output_dim(&self, d: usize) -> usize {
        match self {
            Self::Glu => d / 2,
            _ => d,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Relu => "relu",
            Self::Gelu => "gelu",
            Self::Glu => "glu",
        }
    }
}

impl FromStr for Activation {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "relu" => Ok(Self::Relu),
            "gelu" => Ok(Self::Gelu),
            "glu" => Ok(Self::Glu),
            other => Err(ConfigError::UnsupportedActivation(other.to_string())),
        }
    }
}

impl TryFrom<String> for Activation {
    type Error = ConfigError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl fmt::Display for Activation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}
