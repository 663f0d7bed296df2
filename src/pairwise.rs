// Pairwise relative-location features between every pair of tokens.
//
// Output (B, M, M, spatial_dim), entry [b, i, j] describes token i relative
// to token j.

use anyhow::Result;
use candle_core::{Tensor, D};

use crate::config::PairwiseRelType;

const DIST_EPS: f64 = 1e-10;

/// (B, M, 3) -> (B, M, M, 3) with [b, i, j] = x_i - x_j.
fn pairwise_diff(x: &Tensor) -> Result<Tensor> {
    x.unsqueeze(2)?
        .broadcast_sub(&x.unsqueeze(1)?)
        .map_err(Into::into)
}

/// Euclidean norm over the first `dims` components of the last axis.
fn norm_over(diff: &Tensor, dims: usize) -> Result<Tensor> {
    (diff.narrow(D::Minus1, 0, dims)?.sqr()?.sum(D::Minus1)? + DIST_EPS)?
        .sqrt()
        .map_err(Into::into)
}

fn component(diff: &Tensor, i: usize) -> Result<Tensor> {
    diff.narrow(D::Minus1, i, 1)?.squeeze(D::Minus1).map_err(Into::into)
}

/// Compute the pairwise location matrix from box centers and sizes, both (B, M, 3).
///
/// `center` / `vertical_bottom` give `[dist, dz/dist, dist_xy/dist, dy/dist_xy, dx/dist_xy]`;
/// `vertical_bottom` measures the two elevation terms between box bottoms.
/// `spatial_dim` 1 keeps only the distance, 4 drops it. `mlp` ignores
/// `spatial_dim` and concatenates both boxes (width 12).
pub fn calc_pairwise_locs(
    centers: &Tensor,
    sizes: &Tensor,
    rel_type: PairwiseRelType,
    dist_norm: bool,
    spatial_dim: usize,
) -> Result<Tensor> {
    if rel_type == PairwiseRelType::Mlp {
        let locs = Tensor::cat(&[centers, sizes], D::Minus1)?;
        let (b, m, d) = locs.dims3()?;
        let rows = locs.unsqueeze(2)?.broadcast_as((b, m, m, d))?.contiguous()?;
        let cols = locs.unsqueeze(1)?.broadcast_as((b, m, m, d))?.contiguous()?;
        return Tensor::cat(&[&rows, &cols], D::Minus1).map_err(Into::into);
    }

    let diff = pairwise_diff(centers)?;
    let dists = norm_over(&diff, 3)?;
    let norm_dists = if dist_norm {
        let max_dists = dists.flatten_from(1)?.max_keepdim(1)?.unsqueeze(2)?;
        dists.broadcast_div(&max_dists)?
    } else {
        dists.clone()
    };

    if spatial_dim == 1 {
        return norm_dists.unsqueeze(3).map_err(Into::into);
    }

    let dists_2d = norm_over(&diff, 2)?;
    let (elev_diff, elev_dists, elev_dists_2d) = match rel_type {
        PairwiseRelType::VerticalBottom => {
            let z = centers.narrow(D::Minus1, 2, 1)?;
            let h = sizes.narrow(D::Minus1, 2, 1)?;
            let bottoms = Tensor::cat(&[&centers.narrow(D::Minus1, 0, 2)?, &(z - h)?], D::Minus1)?;
            let bdiff = pairwise_diff(&bottoms)?;
            let bd = norm_over(&bdiff, 3)?;
            let bd2 = norm_over(&bdiff, 2)?;
            (bdiff, bd, bd2)
        }
        _ => (diff.clone(), dists.clone(), dists_2d.clone()),
    };

    let features = Tensor::stack(
        &[
            norm_dists,
            (component(&elev_diff, 2)? / &elev_dists)?,
            (elev_dists_2d / &elev_dists)?,
            (component(&diff, 1)? / &dists_2d)?,
            (component(&diff, 0)? / &dists_2d)?,
        ],
        3,
    )?;

    if spatial_dim == 4 {
        features.narrow(3, 1, 4).map_err(Into::into)
    } else {
        Ok(features)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{Device, IndexOp};

    fn boxes() -> Result<(Tensor, Tensor)> {
        let device = Device::Cpu;
        let centers = Tensor::new(
            &[[[0.0f32, 0.0, 0.0], [3.0, 4.0, 0.0], [0.0, 0.0, 2.0]]],
            &device,
        )?;
        let sizes = Tensor::new(
            &[[[1.0f32, 1.0, 1.0], [1.0, 1.0, 2.0], [0.5, 0.5, 0.5]]],
            &device,
        )?;
        Ok((centers, sizes))
    }

    #[test]
    fn test_center_widths() -> Result<()> {
        let (c, s) = boxes()?;
        for dim in [1usize, 4, 5] {
            let p = calc_pairwise_locs(&c, &s, PairwiseRelType::Center, true, dim)?;
            assert_eq!(p.dims4()?, (1, 3, 3, dim));
        }
        Ok(())
    }

    #[test]
    fn test_normalized_distances() -> Result<()> {
        let (c, s) = boxes()?;
        let p = calc_pairwise_locs(&c, &s, PairwiseRelType::Center, true, 1)?;
        let d = p.i((0, .., .., 0))?.to_vec2::<f32>()?;
        for (i, row) in d.iter().enumerate() {
            assert!(row[i] < 1e-4, "self distance should vanish");
        }
        let max = d.iter().flatten().cloned().fold(0.0f32, f32::max);
        assert!((max - 1.0).abs() < 1e-5);
        // |(3,4,0)| = 5, the largest gap is |(3,4,-2)| = sqrt(29)
        assert!((d[0][1] - 5.0 / 29f32.sqrt()).abs() < 1e-5);
        Ok(())
    }

    #[test]
    fn test_center_direction_terms() -> Result<()> {
        let (c, s) = boxes()?;
        let p = calc_pairwise_locs(&c, &s, PairwiseRelType::Center, false, 5)?;
        let f = p.i((0, 1, 0))?.to_vec1::<f32>()?;
        // token 1 relative to token 0: (3, 4, 0)
        assert!((f[0] - 5.0).abs() < 1e-5);
        assert!(f[1].abs() < 1e-5);
        assert!((f[2] - 1.0).abs() < 1e-5);
        assert!((f[3] - 0.8).abs() < 1e-5);
        assert!((f[4] - 0.6).abs() < 1e-5);
        Ok(())
    }

    #[test]
    fn test_vertical_bottom_uses_box_bottoms() -> Result<()> {
        let (c, s) = boxes()?;
        let center = calc_pairwise_locs(&c, &s, PairwiseRelType::Center, false, 5)?;
        let bottom = calc_pairwise_locs(&c, &s, PairwiseRelType::VerticalBottom, false, 5)?;
        let fc = center.i((0, 1, 0))?.to_vec1::<f32>()?;
        let fb = bottom.i((0, 1, 0))?.to_vec1::<f32>()?;
        // bottoms: z0 = -1, z1 = -2 -> dz = -1 while centers share z
        assert!(fc[1].abs() < 1e-5);
        assert!(fb[1] < 0.0);
        // horizontal direction terms are unchanged
        assert_eq!(fc[3], fb[3]);
        assert_eq!(fc[4], fb[4]);
        Ok(())
    }

    #[test]
    fn test_mlp_concatenates_both_boxes() -> Result<()> {
        let (c, s) = boxes()?;
        let p = calc_pairwise_locs(&c, &s, PairwiseRelType::Mlp, true, 12)?;
        assert_eq!(p.dims4()?, (1, 3, 3, 12));
        let f = p.i((0, 1, 2))?.to_vec1::<f32>()?;
        assert_eq!(&f[..6], &[3.0, 4.0, 0.0, 1.0, 1.0, 2.0]);
        assert_eq!(&f[6..], &[0.0, 0.0, 2.0, 0.5, 0.5, 0.5]);
        Ok(())
    }
}
