// Voxelwise apparent T1 from the multi-PLD calibration series
// the Look-Locker readout train samples the recovery of the M0 dynamic at every PLD. A log-linear
// fit of PLD time against log signal gives an apparent relaxation constant per voxel.

use crate::array_utils::{index_to_subscript_col_maj3, subscript_to_index_col_maj3};
use crate::error::{AslError, Result};
use crate::outlier::median;
use crate::params::T1Validity;
use ndarray::{Array3, ArrayView3, ArrayView4, ShapeBuilder};
use rayon::prelude::*;
use tracing::{debug, info};

/// fitted T1 map together with the upper bound that was applied to it
#[derive(Debug, Clone, PartialEq)]
pub struct T1Map {
    /// ms-scaled apparent T1, zero outside the mask or where the fit was rejected
    pub values: Array3<f32>,
    pub upper_bound: f64,
    pub n_valid: usize,
}

/// least squares fit of `times ≈ c0 + c1 * log_signal`. Returns [0, 0] when the design matrix is
/// rank deficient (log signal constant to within rounding, fewer than 2 samples) or when the two
/// inputs differ in length.
pub fn fit_log_linear(log_signal: &[f64], times: &[f64]) -> [f64; 2] {
    let n = log_signal.len();
    if n < 2 || n != times.len() {
        return [0., 0.];
    }
    let (lo, hi) = log_signal.iter().fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), &x| (lo.min(x), hi.max(x)));
    let x_mean = log_signal.iter().sum::<f64>() / n as f64;
    // spread below a few ulps of the mean is rounding noise, not signal
    if !(hi - lo > 4. * f64::EPSILON * x_mean.abs().max(1.)) {
        return [0., 0.];
    }
    let t_mean = times.iter().sum::<f64>() / n as f64;

    let mut sxx = 0.;
    let mut sxt = 0.;
    log_signal.iter().zip(times).for_each(|(&x, &t)| {
        let dx = x - x_mean;
        sxx += dx * dx;
        sxt += dx * (t - t_mean);
    });

    if !(sxx > 0.) || !sxx.is_finite() {
        return [0., 0.];
    }
    let c1 = sxt / sxx;
    let c0 = t_mean - c1 * x_mean;
    [c0, c1]
}

/// Estimates an apparent T1 per voxel from `data` (x, y, z, pld) sampled at `pld_times_s`. Voxels
/// outside `mask`, voxels with a non-positive sample and voxels with a singular fit are left at 0.
/// Only values in (0, upper bound] survive, with the bound chosen by `validity`. The robust policy
/// works on the magnitude of the fitted value, so recovering and decaying series both give a map.
pub fn estimate_t1(data: ArrayView4<f32>, mask: ArrayView3<bool>, pld_times_s: &[f64], validity: T1Validity) -> Result<T1Map> {
    let (nx, ny, nz, n_pld) = data.dim();
    if mask.dim() != (nx, ny, nz) {
        return Err(AslError::shape("T1 brain mask", (nx, ny, nz), mask.dim()));
    }
    if n_pld != pld_times_s.len() {
        return Err(AslError::shape("T1 PLD times", n_pld, pld_times_s.len()));
    }

    let vol_size = [nx, ny, nz];
    let n_vox = nx * ny * nz;

    let in_mask = mask_flags(&mask);

    // slope of the fit for every voxel, column-major
    let mut slopes = vec![0f64; n_vox];
    slopes.par_iter_mut().enumerate().for_each(|(i, slope)| {
        if !in_mask[i] {
            return;
        }
        let [ix, iy, iz] = index_to_subscript_col_maj3(i, &vol_size);
        let log_signal = (0..n_pld).map(|p| (data[[ix, iy, iz, p]] as f64).ln()).collect::<Vec<f64>>();
        if log_signal.iter().any(|x| !x.is_finite()) {
            return;
        }
        *slope = fit_log_linear(&log_signal, pld_times_s)[1];
    });

    let magnitude = matches!(validity, T1Validity::RobustThreshold);
    let t1 = slopes.iter().zip(&in_mask).map(|(&c1, &m)| {
        let m = if m { 1. } else { 0. };
        let v = (-1. / c1) * m * 1e3;
        match (v.is_finite(), magnitude) {
            (false, _) => 0.,
            (true, true) => v.abs(),
            (true, false) => v,
        }
    }).collect::<Vec<f64>>();

    let upper_bound = match validity {
        T1Validity::FixedUpperBound { upper_bound } => upper_bound,
        T1Validity::RobustThreshold => {
            let fitted = t1.iter().zip(&in_mask).filter(|(_, m)| **m).map(|(v, _)| *v).collect::<Vec<f64>>();
            robust_upper_bound(&fitted)
        }
    };
    debug!(?validity, upper_bound, "T1 validity bound");

    let mut n_valid = 0;
    let values = t1.iter().map(|&v| {
        if v > 0. && v <= upper_bound {
            n_valid += 1;
            v as f32
        } else {
            0.
        }
    }).collect::<Vec<f32>>();

    let values = Array3::from_shape_vec((nx, ny, nz).f(), values)
        .map_err(|e| AslError::shape("T1 map", (nx, ny, nz), e.to_string()))?;

    info!(n_valid, upper_bound, "estimated T1 map");
    Ok(T1Map { values, upper_bound, n_valid })
}

/// mask flattened in column-major order
fn mask_flags(mask: &ArrayView3<bool>) -> Vec<bool> {
    let (nx, ny, nz) = mask.dim();
    let size = [nx, ny, nz];
    let mut flags = vec![false; nx * ny * nz];
    mask.indexed_iter().for_each(|((ix, iy, iz), &m)| {
        flags[subscript_to_index_col_maj3(&[ix, iy, iz], &size)] = m;
    });
    flags
}

/// median + 2 * std (population) of the in-mask values
fn robust_upper_bound(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.;
    }
    let n = values.len() as f64;
    let mean = values.iter().sum::<f64>() / n;
    let var = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n;
    median(values) + 2. * var.sqrt()
}
