// Object mask conventions.
//
// Callers speak ValidMask (1 = real object, 0 = padding). Attention layers
// speak PaddingMask (1 = ignore). The only way across is the pair of named
// conversions below, applied once at the fusion module's entry and exit.

use anyhow::Result;
use candle_core::{DType, Tensor};

fn invert(mask: &Tensor) -> Result<Tensor> {
    mask.eq(&mask.zeros_like()?).map_err(Into::into)
}

/// (B, N) u8 mask, 1 = valid.
#[derive(Debug, Clone)]
pub struct ValidMask(Tensor);

impl ValidMask {
    /// Accepts a mask of any dtype; nonzero means valid. Stored as u8 0/1.
    pub fn new(mask: &Tensor) -> Result<Self> {
        Ok(Self(mask.ne(&mask.zeros_like()?)?))
    }

    pub fn to_padding(&self) -> Result<PaddingMask> {
        Ok(PaddingMask(invert(&self.0)?))
    }

    pub fn as_tensor(&self) -> &Tensor {
        &self.0
    }

    pub fn into_tensor(self) -> Tensor {
        self.0
    }
}

/// (B, N) u8 mask, 1 = masked out of attention.
#[derive(Debug, Clone)]
pub struct PaddingMask(Tensor);

impl PaddingMask {
    pub fn to_valid(&self) -> Result<ValidMask> {
        Ok(ValidMask(invert(&self.0)?))
    }

    /// Prepend `n` always-valid slots.
    pub fn with_leading_valid(&self, n: usize) -> Result<Self> {
        let b = self.0.dim(0)?;
        let open = Tensor::zeros((b, n), DType::U8, self.0.device())?;
        Ok(Self(Tensor::cat(&[&open, &self.0], 1)?))
    }

    pub fn as_tensor(&self) -> &Tensor {
        &self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    #[test]
    fn test_round_trip_is_identity() -> Result<()> {
        let device = Device::Cpu;
        let valid = Tensor::new(&[[1u8, 1, 0, 1], [0, 0, 0, 0]], &device)?;
        let padding = ValidMask::new(&valid)?.to_padding()?;
        assert_eq!(
            padding.as_tensor().to_vec2::<u8>()?,
            vec![vec![0, 0, 1, 0], vec![1, 1, 1, 1]]
        );
        let back = padding.to_valid()?.into_tensor();
        assert_eq!(back.to_vec2::<u8>()?, valid.to_vec2::<u8>()?);
        Ok(())
    }

    #[test]
    fn test_float_masks_accepted() -> Result<()> {
        let device = Device::Cpu;
        let valid = Tensor::new(&[[1.0f32, 0.0, 1.0]], &device)?;
        let mask = ValidMask::new(&valid)?;
        assert_eq!(mask.as_tensor().to_vec2::<u8>()?, vec![vec![1, 0, 1]]);
        Ok(())
    }

    #[test]
    fn test_u8_masks_normalized() -> Result<()> {
        let device = Device::Cpu;
        let mask = ValidMask::new(&Tensor::new(&[[2u8, 0, 1]], &device)?)?;
        assert_eq!(mask.as_tensor().to_vec2::<u8>()?, vec![vec![1, 0, 1]]);
        let back = mask.to_padding()?.to_valid()?.into_tensor();
        assert_eq!(back.to_vec2::<u8>()?, vec![vec![1, 0, 1]]);
        Ok(())
    }

    #[test]
    fn test_leading_valid_slot() -> Result<()> {
        let device = Device::Cpu;
        let padding = ValidMask::new(&Tensor::zeros((2, 3), DType::U8, &device)?)?.to_padding()?;
        let with_anchor = padding.with_leading_valid(1)?.to_valid()?.into_tensor();
        assert_eq!(
            with_anchor.to_vec2::<u8>()?,
            vec![vec![1, 0, 0, 0], vec![1, 0, 0, 0]]
        );
        Ok(())
    }
}
