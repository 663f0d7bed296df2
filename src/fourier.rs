// Fourier positional features for low-dimensional continuous inputs
// (anchor orientation). Deterministic, no parameters.

use anyhow::Result;
use candle_core::{Tensor, D};

use crate::config::FourierConfig;

/// `steps` values evenly spaced over [start, end], both ends included.
fn linspace(start: f64, end: f64, steps: usize) -> Vec<f32> {
    match steps {
        0 => Vec::new(),
        1 => vec![start as f32],
        n => {
            let step = (end - start) / (n - 1) as f64;
            (0..n).map(|i| (start + step * i as f64) as f32).collect()
        }
    }
}

/// Encode `pos` of shape (B, N, C) into (B, N, C').
///
/// Each component x is expanded to phases pi * x * f over the frequency bands,
/// component-major. The output is `[pos | sin | cos]`, dropping `cos` when
/// `sine_only` and `pos` when `concat_pos` is false.
pub fn generate_fourier_features(pos: &Tensor, cfg: &FourierConfig) -> Result<Tensor> {
    let (b, n, c) = pos.dims3()?;
    let bands = Tensor::from_vec(
        linspace(1.0, cfg.max_freq, cfg.num_bands),
        cfg.num_bands,
        pos.device(),
    )?
    .to_dtype(pos.dtype())?;

    // (B, N, C, bands) -> (B, N, C * bands)
    let phases = pos
        .unsqueeze(D::Minus1)?
        .broadcast_mul(&bands)?
        .reshape((b, n, c * cfg.num_bands))?
        .affine(std::f64::consts::PI, 0.0)?;

    let mut parts = Vec::with_capacity(3);
    if cfg.concat_pos {
        parts.push(pos.clone());
    }
    parts.push(phases.sin()?);
    if !cfg.sine_only {
        parts.push(phases.cos()?);
    }
    Tensor::cat(&parts, D::Minus1).map_err(Into::into)
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};

    #[test]
    fn test_linspace_endpoints() {
        let v = linspace(1.0, 15.0, 10);
        assert_eq!(v.len(), 10);
        assert_eq!(v[0], 1.0);
        assert!((v[9] - 15.0).abs() < 1e-6);
        assert_eq!(linspace(1.0, 15.0, 1), vec![1.0]);
    }

    #[test]
    fn test_output_width() -> Result<()> {
        let device = Device::Cpu;
        let pos = Tensor::randn(0f32, 1.0, (2, 1, 3), &device)?;
        for concat_pos in [true, false] {
            for sine_only in [true, false] {
                let cfg = FourierConfig {
                    num_bands: 6,
                    max_freq: 8.0,
                    concat_pos,
                    sine_only,
                };
                let out = generate_fourier_features(&pos, &cfg)?;
                assert_eq!(out.dims3()?, (2, 1, cfg.output_dim(3)));
            }
        }
        Ok(())
    }

    #[test]
    fn test_deterministic() -> Result<()> {
        let device = Device::Cpu;
        let cfg = FourierConfig::default();
        let pos = Tensor::randn(0f32, 1.0, (4, 1, 4), &device)?;
        let a = generate_fourier_features(&pos, &cfg)?.flatten_all()?.to_vec1::<f32>()?;
        let b = generate_fourier_features(&pos, &cfg)?.flatten_all()?.to_vec1::<f32>()?;
        assert_eq!(a, b);
        Ok(())
    }

    #[test]
    fn test_zero_input_layout() -> Result<()> {
        let device = Device::Cpu;
        let cfg = FourierConfig {
            num_bands: 4,
            max_freq: 4.0,
            concat_pos: true,
            sine_only: false,
        };
        let pos = Tensor::zeros((1, 1, 2), DType::F32, &device)?;
        let out = generate_fourier_features(&pos, &cfg)?.flatten_all()?.to_vec1::<f32>()?;
        // [pos(2) | sin(8) | cos(8)]
        assert_eq!(out.len(), 18);
        assert!(out[..10].iter().all(|v| v.abs() < 1e-6));
        assert!(out[10..].iter().all(|v| (v - 1.0).abs() < 1e-6));
        Ok(())
    }

    #[test]
    fn test_raw_position_prefix() -> Result<()> {
        let device = Device::Cpu;
        let cfg = FourierConfig::default();
        let pos = Tensor::new(&[[[0.25f32, -0.5, 0.75]]], &device)?;
        let out = generate_fourier_features(&pos, &cfg)?.flatten_all()?.to_vec1::<f32>()?;
        assert_eq!(&out[..3], &[0.25, -0.5, 0.75]);
        // first band is frequency 1.0: sin(pi * 0.25)
        let expected = (std::f32::consts::PI * 0.25).sin();
        assert!((out[3] - expected).abs() < 1e-5);
        Ok(())
    }
}
