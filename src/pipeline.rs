// Per-context reconstruction pipeline
// a context is one scan phase (e.g. baseline or stimulus) with its own geometry, raw series and
// masks. Contexts share nothing, so several of them can be processed on the rayon pool at once.

use crate::assemble::{assemble, InterleavedVolume, NamedVolume};
use crate::decode::decode;
use crate::error::{AslError, Result};
use crate::look_locker::{compute_correction_factors, remove_look_locker_correction};
use crate::mask::{dilate_mask, DilationMode};
use crate::outlier::{detect_and_filter, OutlierReport};
use crate::params::{AcquisitionGeometry, AslParams};
use crate::smooth::{smooth_image, SmoothingMode};
use crate::t1::{estimate_t1, T1Map};
use ndarray::{Array3, Array4, ArrayView3, ArrayView4, Zip};
use rayon::prelude::*;
use tracing::{info, info_span, warn};

/// everything needed to reconstruct one context
#[derive(Debug, Clone)]
pub struct ContextInput {
    pub name: String,
    pub geometry: AcquisitionGeometry,
    /// raw series (x, y, z, time) in acquisition order
    pub raw: Array4<f32>,
    /// brain mask aligned with the calibration image
    pub brain_mask: Array3<bool>,
    /// optional tissue mask (e.g. grey matter) restricting the outlier statistic
    pub region_mask: Option<Array3<bool>>,
}

/// kinetic model constants handed to the perfusion solver with every run
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SolverConstants {
    /// bolus duration (s)
    pub tau: f64,
    /// blood T1 (s)
    pub t1_blood: f64,
    /// tissue T1 (s)
    pub t1_tissue: f64,
    pub label_efficiency: f64,
    /// blood-brain partition coefficient (g/ml)
    pub lambda: f64,
    /// background suppression pulses
    pub n_bs: usize,
}

impl SolverConstants {
    pub fn new(geometry: &AcquisitionGeometry, params: &AslParams) -> Self {
        Self {
            tau: geometry.tau,
            t1_blood: geometry.t1_blood,
            t1_tissue: geometry.t1_tissue,
            label_efficiency: geometry.label_efficiency,
            lambda: params.lambda,
            n_bs: params.n_bs,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ContextOutput {
    pub name: String,
    /// Look-Locker correction factor per PLD
    pub correction: Vec<f64>,
    /// outlier-filtered control/label series
    pub volumes: InterleavedVolume,
    pub m0: Array3<f32>,
    /// calibration image for flow quantification: smoothed with `fwhm_m0` inside the in-plane
    /// dilated brain mask, NaN outside it
    pub m0_smooth: Array3<f32>,
    pub m0_all_pld: Array4<f32>,
    pub brain_mask: Array3<bool>,
    pub outliers: OutlierReport,
    pub t1: T1Map,
    pub constants: SolverConstants,
    /// voxel size in mm
    pub voxel_size: [f64; 3],
}

/// one solver invocation: a named PLD subset with its timing and calibration image
#[derive(Debug, Clone)]
pub struct QuantificationRun<'a> {
    pub kind: NamedVolume,
    pub volume: ArrayView4<'a, f32>,
    /// PLD times in seconds, one per PLD in `volume`
    pub pld_times: &'a [f64],
    pub m0: ArrayView3<'a, f32>,
    pub mask: ArrayView3<'a, bool>,
    pub arterial_component: bool,
    pub constants: &'a SolverConstants,
}

impl ContextOutput {
    /// the three solver runs, in [NamedVolume::ALL] order
    pub fn quantification_runs(&self) -> Vec<QuantificationRun<'_>> {
        NamedVolume::ALL.iter().map(|&kind| QuantificationRun {
            kind,
            volume: self.volumes.view(kind),
            pld_times: self.volumes.pld_times(kind),
            m0: self.m0.view(),
            mask: self.brain_mask.view(),
            arterial_component: kind.arterial_component(),
            constants: &self.constants,
        }).collect()
    }

    /// Smooths a quantified map (e.g. CBF or arrival time from the solver) in-plane with `fwhm`,
    /// ignoring everything outside the brain mask. Voxels outside the mask come back NaN.
    pub fn smooth_map(&self, map: ArrayView3<f32>, fwhm: f64) -> Result<Array3<f32>> {
        if map.dim() != self.brain_mask.dim() {
            return Err(AslError::shape("quantified map", self.brain_mask.dim(), map.dim()));
        }
        let masked = mask_to_nan(map, self.brain_mask.view());
        smooth_image(masked.view(), SmoothingMode::Slice2d, fwhm, self.voxel_size)
    }
}

/// copy of `image` with every voxel outside `mask` set to NaN
fn mask_to_nan(image: ArrayView3<f32>, mask: ArrayView3<bool>) -> Array3<f32> {
    let mut out = image.to_owned();
    Zip::from(&mut out).and(&mask).for_each(|v, &m| {
        if !m {
            *v = f32::NAN;
        }
    });
    out
}

/// Runs Look-Locker correction, decoding, assembly, outlier rejection and T1 estimation for one
/// context. Any failure is wrapped with the context name.
pub fn process_context(input: &ContextInput, params: &AslParams) -> Result<ContextOutput> {
    let span = info_span!("asl_context", context = %input.name);
    let _guard = span.enter();
    run(input, params).map_err(|e| {
        warn!(error = %e, "context failed");
        e.in_context(input.name.as_str())
    })
}

fn run(input: &ContextInput, params: &AslParams) -> Result<ContextOutput> {
    params.validate()?;
    let geometry = &input.geometry;
    geometry.validate()?;

    let correction = compute_correction_factors(geometry.flip_angle, &geometry.plds_ms(), geometry.t1_blood * 1e3)?;
    let decoded = decode(input.raw.view(), geometry, &correction, params.acquisition_order)?;
    let assembled = assemble(&decoded, geometry)?;

    let (volumes, outliers) = detect_and_filter(
        &decoded,
        &assembled.interleaved,
        input.brain_mask.view(),
        input.region_mask.as_ref().map(|m| m.view()),
        params.outlier_factor,
    )?;

    let native = remove_look_locker_correction(assembled.m0_all_pld.view(), &correction)?;
    let t1 = estimate_t1(native.view(), input.brain_mask.view(), &geometry.plds, params.t1_validity)?;

    let m0_mask = dilate_mask(input.brain_mask.view(), DilationMode::Slice2d, 1, false);
    let m0_smooth = smooth_image(
        mask_to_nan(assembled.m0.view(), m0_mask.view()).view(),
        SmoothingMode::Volume3d,
        params.fwhm_m0,
        geometry.voxel_size,
    )?;

    info!(repeats_kept = outliers.n_kept(), t1_valid = t1.n_valid, "context done");

    Ok(ContextOutput {
        name: input.name.clone(),
        correction,
        volumes,
        m0: assembled.m0,
        m0_smooth,
        m0_all_pld: assembled.m0_all_pld,
        brain_mask: input.brain_mask.clone(),
        outliers,
        t1,
        constants: SolverConstants::new(geometry, params),
        voxel_size: geometry.voxel_size,
    })
}

/// Processes independent contexts in parallel. Results come back in input order, each tagged with
/// its context name, and a failing context leaves the others untouched.
pub fn process_contexts(inputs: Vec<ContextInput>, params: &AslParams) -> Vec<(String, Result<ContextOutput>)> {
    info!(n_contexts = inputs.len(), "processing contexts");
    inputs.into_par_iter().map(|input| {
        let result = process_context(&input, params);
        (input.name, result)
    }).collect()
}

/// convenience for callers that want to abort on the first failed context
pub fn collect_outputs(results: Vec<(String, Result<ContextOutput>)>) -> Result<Vec<ContextOutput>> {
    results.into_iter().map(|(_, r)| r).collect::<std::result::Result<Vec<_>, AslError>>()
}
