// NaN-aware Gaussian smoothing of 3-D images
// the kernel width is given as a FWHM in mm and converted per axis with the voxel size. NaN voxels
// carry no weight; every output sample is normalised by the kernel weight that actually landed on
// finite input, so edges of a NaN-masked image are not pulled towards zero.

use crate::error::{AslError, Result};
use ndarray::{Array3, ArrayView3, Axis, Zip};
use tracing::debug;

/// FWHM = 2 sqrt(2 ln 2) sigma
const FWHM_TO_SIGMA: f64 = 2.355;

/// number of standard deviations covered by the kernel on either side
const KERNEL_TRUNCATE: f64 = 4.;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SmoothingMode {
    /// smooth within each slice only
    Slice2d,
    /// smooth across slices as well
    Volume3d,
}

/// Gaussian smoothing with a `fwhm_mm` kernel. NaN voxels stay NaN in the output and do not
/// contribute to their neighbours. A zero width returns the input unchanged.
pub fn smooth_image(data: ArrayView3<f32>, mode: SmoothingMode, fwhm_mm: f64, voxel_size: [f64; 3]) -> Result<Array3<f32>> {
    if !(fwhm_mm >= 0.) || !fwhm_mm.is_finite() {
        return Err(AslError::Config(format!("smoothing FWHM must be finite and >= 0, got {}", fwhm_mm)));
    }
    if voxel_size.iter().any(|v| !(*v > 0.) || !v.is_finite()) {
        return Err(AslError::InvalidGeometry(format!("voxel sizes must be positive: {:?}", voxel_size)));
    }

    let sigma_mm = fwhm_mm / FWHM_TO_SIGMA;
    let n_axes = match mode {
        SmoothingMode::Slice2d => 2,
        SmoothingMode::Volume3d => 3,
    };

    // values with NaN replaced by 0, and the weight each voxel carries
    let mut values = data.mapv(|v| if v.is_nan() { 0. } else { v as f64 });
    let mut weights = data.mapv(|v| if v.is_nan() { 0. } else { 1f64 });

    for axis in 0..n_axes {
        let sigma = sigma_mm / voxel_size[axis];
        if sigma <= 0. {
            continue;
        }
        let kernel = gaussian_kernel(sigma);
        debug!(axis, sigma_voxels = sigma, taps = kernel.len(), "smoothing axis");
        values = convolve_axis(&values, Axis(axis), &kernel);
        weights = convolve_axis(&weights, Axis(axis), &kernel);
    }

    let mut out = Array3::<f32>::zeros(data.raw_dim());
    Zip::from(&mut out).and(&data).and(&values).and(&weights).for_each(|o, &d, &v, &w| {
        *o = if d.is_nan() || w <= 0. { f32::NAN } else { (v / w) as f32 };
    });
    Ok(out)
}

/// normalised 1-D Gaussian truncated at [KERNEL_TRUNCATE] standard deviations
fn gaussian_kernel(sigma: f64) -> Vec<f64> {
    let radius = (KERNEL_TRUNCATE * sigma).ceil() as isize;
    let two_sigma_sq = 2. * sigma * sigma;
    let mut kernel = (-radius..=radius).map(|x| (-(x * x) as f64 / two_sigma_sq).exp()).collect::<Vec<f64>>();
    let sum = kernel.iter().sum::<f64>();
    kernel.iter_mut().for_each(|k| *k /= sum);
    kernel
}

/// convolution along one axis with half-sample symmetric reflection at the borders
fn convolve_axis(x: &Array3<f64>, axis: Axis, kernel: &[f64]) -> Array3<f64> {
    let n = x.len_of(axis);
    let radius = (kernel.len() / 2) as isize;
    let mut out = Array3::<f64>::zeros(x.raw_dim());
    Zip::from(out.lanes_mut(axis)).and(x.lanes(axis)).par_for_each(|mut dst, src| {
        for i in 0..n {
            dst[i] = kernel.iter().enumerate().map(|(k, w)| {
                let j = reflect(i as isize + k as isize - radius, n);
                w * src[j]
            }).sum();
        }
    });
    out
}

/// maps an index outside [0, n) back inside: ... c b a | a b c ... | c b a ...
fn reflect(mut i: isize, n: usize) -> usize {
    let n = n as isize;
    let period = 2 * n;
    i = i.rem_euclid(period);
    if i >= n { (period - 1 - i) as usize } else { i as usize }
}
