// Look-Locker readout correction for multi-delay pCASL
// every PLD is read out with a small flip angle without waiting for full recovery, so each readout
// eats into the label/control difference seen by the following ones. The factors computed here
// describe that attenuation relative to a fully relaxed single readout.

use crate::error::{AslError, Result};
use ndarray::{Array1, Array4, ArrayView4, Axis, Zip};
use tracing::info;

/// Computes one Look-Locker correction factor per PLD by simulating blood longitudinal magnetization
/// on a 1 ms grid spanning [1, 1.1 * last PLD] with and without the readout train. The factor is the
/// ratio of the two control-label differences at each PLD, converted to the transverse plane with
/// sin(flip angle) and rounded to 3 decimals. Equilibrium magnetization is taken as 1.
///
/// `plds_ms` must be strictly increasing and at least 1 ms, `t1_blood_ms` positive.
pub fn compute_correction_factors(flip_angle_deg: f64, plds_ms: &[f64], t1_blood_ms: f64) -> Result<Vec<f64>> {
    if plds_ms.is_empty() {
        return Err(AslError::InvalidGeometry("no PLDs given for Look-Locker correction".to_string()));
    }
    if !flip_angle_deg.is_finite() || flip_angle_deg == 0. || flip_angle_deg == 180. {
        return Err(AslError::InvalidGeometry(format!("degenerate flip angle for Look-Locker correction: {}", flip_angle_deg)));
    }
    if plds_ms.iter().any(|p| !p.is_finite() || *p < 1.) || plds_ms.windows(2).any(|w| w[1] <= w[0]) {
        return Err(AslError::InvalidGeometry(format!("PLDs (ms) must be >= 1 and strictly increasing: {:?}", plds_ms)));
    }
    if !(t1_blood_ms > 0.) {
        return Err(AslError::InvalidGeometry(format!("blood T1 must be positive, got {} ms", t1_blood_ms)));
    }

    let alpha = flip_angle_deg.to_radians();
    let first_pld = plds_ms[0];
    let last_pld = plds_ms[plds_ms.len() - 1];

    // 1 ms time grid, t = 1, 2, ..., n
    let n = (last_pld * 1.1) as usize;
    let t = Array1::from_shape_fn(n, |i| (i + 1) as f64);

    // a single PLD leaves the spacing undefined. Only the free recovery part of the curve is sampled
    // in that case, so the NaN never reaches a factor.
    let n_gaps = plds_ms.len() - 1;
    let delta_pld = plds_ms.windows(2).map(|w| w[1] - w[0]).sum::<f64>() / n_gaps as f64;

    // effective relaxation and steady state under the readout train (Brix et al. MRI 1990)
    let t1_eff = 1. / (1. / t1_blood_ms - alpha.cos().ln() / delta_pld);
    let e_delta = (-delta_pld / t1_blood_ms).exp();
    let m_eq = (1. - e_delta) / (1. - alpha.cos() * e_delta);

    // without Look-Locker
    let m_control_free = t.mapv(|t| 1. - (-t / t1_blood_ms).exp());
    let m_label_free = t.mapv(|t| 1. - 2. * (-t / t1_blood_ms).exp());
    let delta_m_free = &m_control_free - &m_label_free;

    // with Look-Locker: free recovery up to the first readout, perturbed recovery afterwards
    let n_free = (first_pld as usize).min(n);
    let offset = first_pld.round() as usize;
    let mut m_control_ll = Array1::<f64>::zeros(n);
    let mut m_label_ll = Array1::<f64>::zeros(n);
    m_control_ll.slice_mut(ndarray::s![..n_free]).assign(&m_control_free.slice(ndarray::s![..n_free]));
    m_label_ll.slice_mut(ndarray::s![..n_free]).assign(&m_label_free.slice(ndarray::s![..n_free]));

    // magnetization at the start of the readout train. Only samples already written by the free
    // recovery are valid anchors.
    let (anchor_control, anchor_label) = if offset >= 1 && offset <= n_free {
        (m_control_ll[offset - 1], m_label_ll[offset - 1])
    } else {
        (0., 0.)
    };

    for idx in n_free..n {
        let elapsed = (idx + 1) as f64 - offset as f64;
        let decay = (-elapsed / t1_eff).exp();
        let recovery = m_eq * (1. - decay);
        m_control_ll[idx] = anchor_control * decay + recovery;
        m_label_ll[idx] = anchor_label * decay + recovery;
    }
    let delta_m_ll = &m_control_ll - &m_label_ll;

    let mut ratio = delta_m_ll / &delta_m_free;
    ratio.mapv_inplace(|r| if r.is_finite() { r } else { 0. });

    let sin_alpha = alpha.sin();
    let factors = plds_ms.iter().map(|&pld| {
        let idx = pld as usize - 1;
        round_to(ratio[idx] * sin_alpha, 3)
    }).collect::<Vec<f64>>();

    info!(
        flip_angle = flip_angle_deg,
        plds_ms = ?plds_ms,
        delta_pld_ms = delta_pld,
        factors = ?factors,
        "computed Look-Locker correction factors"
    );

    Ok(factors)
}

fn round_to(x: f64, decimals: i32) -> f64 {
    let scale = 10f64.powi(decimals);
    (x * scale).round() / scale
}

/// Re-applies the Look-Locker attenuation to a per-PLD series (x, y, z, pld) that was previously
/// divided by the correction factors, recovering the native readout-train recovery curve.
pub fn remove_look_locker_correction(series: ArrayView4<f32>, factors: &[f64]) -> Result<Array4<f32>> {
    let n_pld = series.len_of(Axis(3));
    if n_pld != factors.len() {
        return Err(AslError::shape("Look-Locker factors per PLD", n_pld, factors.len()));
    }
    let mut out = series.to_owned();
    out.axis_iter_mut(Axis(3)).zip(factors).for_each(|(mut vol, &f)| {
        let f = f as f32;
        Zip::from(&mut vol).for_each(|x| *x *= f);
    });
    Ok(out)
}
