// Outlier dynamic rejection
// a repeat is rejected as a whole when its mean label-control difference inside the mask sits too
// far from the other repeats, measured with median / MAD so the outliers don't inflate the scale.

use crate::assemble::InterleavedVolume;
use crate::decode::{Condition, DecodedTensor};
use crate::error::{AslError, Result};
use ndarray::{s, Array3, ArrayView3, Axis, Zip};
use tracing::{debug, info, warn};

/// scales the median absolute deviation to a standard deviation estimate for normal data
pub const MAD_TO_SIGMA: f64 = 1.4826;

pub const DEFAULT_OUTLIER_FACTOR: f64 = 2.5;

/// audit record of one outlier decision
#[derive(Debug, Clone, PartialEq)]
pub struct OutlierReport {
    /// masked mean of the PLD-summed label-control difference, one per repeat
    pub means: Vec<f64>,
    pub center: f64,
    pub sigma: f64,
    pub outlier_factor: f64,
    /// one flag per repeat, true = keep
    pub keep: Vec<bool>,
    /// 0-based indices of rejected repeats
    pub outliers: Vec<usize>,
}

impl OutlierReport {
    pub fn n_kept(&self) -> usize {
        self.keep.iter().filter(|k| **k).count()
    }

    pub fn has_outliers(&self) -> bool {
        !self.outliers.is_empty()
    }
}

/// median of a slice. Returns NaN for an empty slice.
pub fn median(values: &[f64]) -> f64 {
    if values.is_empty() {
        return f64::NAN;
    }
    let mut sorted = values.to_vec();
    sorted.sort_by(|a, b| a.total_cmp(b));
    let n = sorted.len();
    if n % 2 == 0 {
        (sorted[n / 2 - 1] + sorted[n / 2]) / 2.
    } else {
        sorted[n / 2]
    }
}

/// median absolute deviation from the median
pub fn mad(values: &[f64]) -> f64 {
    let m = median(values);
    let deviations = values.iter().map(|v| (v - m).abs()).collect::<Vec<f64>>();
    median(&deviations)
}

/// combines the brain mask with an optional region mask (e.g. grey matter)
fn combined_mask(vol_dim: [usize; 3], brain_mask: ArrayView3<bool>, region_mask: Option<ArrayView3<bool>>) -> Result<Array3<bool>> {
    let dim = (vol_dim[0], vol_dim[1], vol_dim[2]);
    if brain_mask.dim() != dim {
        return Err(AslError::shape("brain mask", dim, brain_mask.dim()));
    }
    let mut mask = brain_mask.to_owned();
    if let Some(region) = region_mask {
        if region.dim() != dim {
            return Err(AslError::shape("region mask", dim, region.dim()));
        }
        Zip::from(&mut mask).and(&region).for_each(|m, &r| *m = *m && r);
    }
    Ok(mask)
}

/// Mean over masked voxels of the PLD-summed label-control difference for every repeat. Infinite
/// voxel values count as 0 and NaN voxels are skipped. A repeat with no usable voxel yields NaN.
pub fn mean_delta_m_per_repeat(decoded: &DecodedTensor, mask: ArrayView3<bool>) -> Vec<f64> {
    let label = decoded.condition(Condition::Label);
    let control = decoded.condition(Condition::Control);
    let delta = &label.slice(s![.., .., .., 1.., ..]) - &control.slice(s![.., .., .., 1.., ..]);
    let delta = delta.sum_axis(Axis(4));

    delta.axis_iter(Axis(3)).map(|vol| {
        let mut sum = 0f64;
        let mut count = 0usize;
        Zip::from(&vol).and(&mask).for_each(|&d, &m| {
            if !m || d.is_nan() {
                return;
            }
            sum += if d.is_infinite() { 0. } else { d as f64 };
            count += 1;
        });
        if count == 0 { f64::NAN } else { sum / count as f64 }
    }).collect()
}

/// A repeat is kept when its deviation from the center is strictly below `outlier_factor * sigma`.
/// A zero scale means most repeats agree exactly; only those are kept.
fn is_inlier(mean: f64, center: f64, sigma: f64, outlier_factor: f64) -> bool {
    let dev = (mean - center).abs();
    if sigma > 0. { dev < outlier_factor * sigma } else { dev == 0. }
}

/// Flags repeats whose masked mean label-control difference lies `outlier_factor` robust standard
/// deviations or more from the median repeat. Fails with [AslError::CorruptSignal] when any repeat
/// mean is NaN.
pub fn detect_outliers(decoded: &DecodedTensor, brain_mask: ArrayView3<bool>, region_mask: Option<ArrayView3<bool>>, outlier_factor: f64) -> Result<OutlierReport> {
    if !(outlier_factor > 0.) {
        return Err(AslError::Config(format!("outlier factor must be positive, got {}", outlier_factor)));
    }
    let mask = combined_mask(decoded.vol_dim(), brain_mask, region_mask)?;
    let means = mean_delta_m_per_repeat(decoded, mask.view());

    let nan_repeats = means.iter().enumerate().filter(|(_, m)| m.is_nan()).map(|(i, _)| i).collect::<Vec<usize>>();
    if !nan_repeats.is_empty() {
        return Err(AslError::CorruptSignal(format!("NaN found in deltaM means at repeats {:?}", nan_repeats)));
    }

    let center = median(&means);
    let sigma = MAD_TO_SIGMA * mad(&means);
    let threshold = outlier_factor * sigma;

    let keep = means.iter().map(|&m| is_inlier(m, center, sigma, outlier_factor)).collect::<Vec<bool>>();

    let outliers = keep.iter().enumerate().filter(|(_, k)| !**k).map(|(i, _)| i).collect::<Vec<usize>>();
    debug!(?means, center, sigma, threshold, "outlier statistics");

    Ok(OutlierReport {
        means,
        center,
        sigma,
        outlier_factor,
        keep,
        outliers,
    })
}

/// Runs [detect_outliers] and drops the rejected repeats from the interleaved volumes. With no
/// outliers the volumes are returned unchanged, and so they are when every repeat is flagged: the
/// report then lists all repeats and the caller decides what to do with the context.
pub fn detect_and_filter(
    decoded: &DecodedTensor,
    volumes: &InterleavedVolume,
    brain_mask: ArrayView3<bool>,
    region_mask: Option<ArrayView3<bool>>,
    outlier_factor: f64,
) -> Result<(InterleavedVolume, OutlierReport)> {
    if volumes.n_repeats() != decoded.n_repeats() || volumes.n_pld() != decoded.n_pld() {
        return Err(AslError::shape(
            "interleaved volumes (n_repeats, n_pld)",
            (decoded.n_repeats(), decoded.n_pld()),
            (volumes.n_repeats(), volumes.n_pld()),
        ));
    }
    let report = detect_outliers(decoded, brain_mask, region_mask, outlier_factor)?;

    if !report.has_outliers() {
        info!("outlier removal: no outliers detected");
        return Ok((volumes.clone(), report));
    }
    if report.n_kept() == 0 {
        warn!(
            rejected = report.outliers.len(),
            outlier_factor,
            "outlier removal: every repeat was flagged, keeping all of them"
        );
        return Ok((volumes.clone(), report));
    }

    info!(
        removed_1_based = ?report.outliers.iter().map(|i| i + 1).collect::<Vec<usize>>(),
        kept = report.n_kept(),
        "outlier removal: repeats removed"
    );
    let filtered = volumes.filter_repeats(&report.keep)?;
    Ok((filtered, report))
}
