use asl_reco::{
    assemble, compute_correction_factors, decode, detect_and_filter, dilate_mask, process_context, process_contexts,
    AcquisitionGeometry, AcquisitionOrder, AslError, AslParams, Condition, ContextInput, DilationMode, NamedVolume,
};
use ndarray::{s, Array3, Array4, Axis, ShapeBuilder};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

const DIM: (usize, usize, usize) = (4, 4, 2);

fn control_value(dynamic: usize, pld: usize) -> f32 {
    100. + 10. * dynamic as f32 + pld as f32
}

fn label_value(dynamic: usize, pld: usize) -> f32 {
    60. + 10. * dynamic as f32 + 2. * pld as f32
}

/// raw series in label-first order: label PLDs then control PLDs for every dynamic
fn raw_from(n_pld: usize, n_dyn: usize, value: impl Fn(usize, usize, Condition) -> f32) -> Array4<f32> {
    let (nx, ny, nz) = DIM;
    Array4::from_shape_fn((nx, ny, nz, 2 * n_pld * n_dyn).f(), |(_, _, _, t)| {
        let dynamic = t / (2 * n_pld);
        let within = t % (2 * n_pld);
        let (condition, pld) = if within < n_pld {
            (Condition::Label, within)
        } else {
            (Condition::Control, within - n_pld)
        };
        value(dynamic, pld, condition)
    })
}

#[test]
fn canonical_fixture_decodes_and_assembles() {
    let params = AslParams::default();
    let geometry = AcquisitionGeometry::new(2, 3, vec![0.5, 1.0], 25., [3., 3., 6.], &params).unwrap();
    let raw = raw_from(2, 3, |d, p, c| match c {
        Condition::Control => control_value(d, p),
        Condition::Label => label_value(d, p),
    });
    assert_eq!(raw.dim(), (4, 4, 2, 12));

    let factors = [0.5, 0.25];
    let decoded = decode(raw.view(), &geometry, &factors, AcquisitionOrder::LabelFirst).unwrap();
    for d in 0..3 {
        for p in 0..2 {
            let f = factors[p] as f32;
            assert!(decoded.volume(d, p, Condition::Control).iter().all(|v| *v == control_value(d, p) / f));
            assert!(decoded.volume(d, p, Condition::Label).iter().all(|v| *v == label_value(d, p) / f));
        }
    }

    let assembled = assemble(&decoded, &geometry).unwrap();
    let volumes = &assembled.interleaved;
    assert_eq!(volumes.len(NamedVolume::AllPld), 8);
    assert_eq!(volumes.len(NamedVolume::Pld2ToLast), 4);
    assert_eq!(volumes.len(NamedVolume::Pld1To2), 8);

    // t = pld * 4 + 2 * repeat + condition, repeat r is dynamic r + 1
    let data = volumes.data();
    for p in 0..2 {
        let f = factors[p] as f32;
        for r in 0..2 {
            let t = p * 4 + 2 * r;
            assert_eq!(data[[1, 2, 1, t]], control_value(r + 1, p) / f);
            assert_eq!(data[[1, 2, 1, t + 1]], label_value(r + 1, p) / f);
        }
    }
    assert_eq!(volumes.pld2_to_last()[[0, 0, 0, 0]], control_value(1, 1) / 0.25);

    assert!(assembled.m0.iter().all(|v| *v == 302.));
    assert!(assembled.m0_all_pld.index_axis(Axis(3), 0).iter().all(|v| *v == 160.));
    assert!(assembled.m0_all_pld.index_axis(Axis(3), 1).iter().all(|v| *v == 326.));
}

/// five repeats with masked mean deltaM [1.0, 1.2, 0.8, 3.0, 1.1]: repeat 3 sits far outside the
/// robust spread of the others
fn outlier_input(order: AcquisitionOrder, seed: u64) -> (ContextInput, AslParams) {
    let params = AslParams { acquisition_order: order, ..AslParams::default() };
    let plds = vec![0.5, 1.0];
    let geometry = AcquisitionGeometry::new(2, 6, plds, 25., [3., 3., 6.], &params).unwrap();
    let factors = compute_correction_factors(25., &geometry.plds_ms(), params.t1_blood * 1e3).unwrap();
    let deltas = [1.0f32, 1.2, 0.8, 3.0, 1.1];

    // the first block of every dynamic carries the perfusion signal, so the sign of deltaM depends
    // on the order the raw series is decoded with
    let mut raw = raw_from(2, 6, |d, p, c| {
        let control = 200. + 5. * p as f32;
        let delta = if d == 0 { 0. } else { deltas[d - 1] * factors[p] as f32 / 2. };
        match c {
            Condition::Label => control + delta,
            Condition::Control => control,
        }
    });
    let mut rng = StdRng::seed_from_u64(seed);
    raw.map_inplace(|v| *v += rng.random_range(-0.002f32..0.002));

    let input = ContextInput {
        name: "baseline".to_string(),
        geometry,
        raw,
        brain_mask: Array3::from_elem(DIM, true),
        region_mask: None,
    };
    (input, params)
}

#[test]
fn outlier_repeat_is_removed_end_to_end() {
    let (input, params) = outlier_input(AcquisitionOrder::LabelFirst, 7);
    let out = process_context(&input, &params).unwrap();
    assert_eq!(out.outliers.outliers, vec![3]);
    assert_eq!(out.volumes.n_repeats(), 4);
    assert_eq!(out.volumes.len(NamedVolume::AllPld), 2 * 4 * 2);
    assert_eq!(out.volumes.len(NamedVolume::Pld1To2), 4 * 4);
    assert!((out.outliers.means[3] - 3.).abs() < 1e-2);

    // the last kept repeat is the original repeat 4
    let last = out.volumes.volume(0, 3, Condition::Label);
    let control = out.volumes.volume(0, 3, Condition::Control);
    let diff = (&last - &control).mean().unwrap();
    assert!((diff - 0.55).abs() < 1e-2);
}

#[test]
fn outlier_detection_without_correction() {
    let params = AslParams::default();
    let geometry = AcquisitionGeometry::new(2, 6, vec![0.5, 1.0], 25., [3., 3., 6.], &params).unwrap();
    let deltas = [1.0f32, 1.2, 0.8, 1.1 + 10. * 0.14826, 1.1];
    let raw = raw_from(2, 6, |d, _, c| match (c, d) {
        (Condition::Label, d) if d > 0 => 100. + deltas[d - 1] / 2.,
        _ => 100.,
    });
    let decoded = decode(raw.view(), &geometry, &[1., 1.], AcquisitionOrder::LabelFirst).unwrap();
    let assembled = assemble(&decoded, &geometry).unwrap();
    let mask = Array3::from_elem(DIM, true);

    let (filtered, report) = detect_and_filter(&decoded, &assembled.interleaved, mask.view(), None, 2.5).unwrap();
    assert_eq!(report.outliers, vec![3]);
    assert_eq!(filtered.n_repeats(), 4);

    // a factor large enough to accept everything leaves the volumes untouched
    let (same, report) = detect_and_filter(&decoded, &assembled.interleaved, mask.view(), None, 50.).unwrap();
    assert!(report.outliers.is_empty());
    assert_eq!(same, assembled.interleaved);
}

#[test]
fn acquisition_order_flips_the_difference_sign() {
    let (label_first, params_lf) = outlier_input(AcquisitionOrder::LabelFirst, 11);
    let (control_first, params_cf) = outlier_input(AcquisitionOrder::ControlFirst, 11);
    assert_eq!(label_first.raw, control_first.raw);

    let lf = process_context(&label_first, &params_lf).unwrap();
    let cf = process_context(&control_first, &params_cf).unwrap();
    for (a, b) in lf.outliers.means.iter().zip(&cf.outliers.means) {
        assert!((a + b).abs() < 1e-6, "{} vs {}", a, b);
    }
    assert_eq!(lf.outliers.outliers, cf.outliers.outliers);
    assert_eq!(lf.t1.values, cf.t1.values);
    assert_eq!(lf.m0_all_pld, cf.m0_all_pld);
}

#[test]
fn degenerate_flip_angle_is_rejected() {
    let r = compute_correction_factors(0., &[500., 1000.], 1650.);
    assert!(matches!(r, Err(AslError::InvalidGeometry(_))));

    let (mut input, params) = outlier_input(AcquisitionOrder::LabelFirst, 3);
    input.geometry.flip_angle = 0.;
    let err = process_context(&input, &params).unwrap_err();
    assert!(matches!(err.root(), AslError::InvalidGeometry(_)));
}

#[test]
fn contexts_fail_independently() {
    let (baseline, params) = outlier_input(AcquisitionOrder::LabelFirst, 5);
    let (mut stimulus, _) = outlier_input(AcquisitionOrder::LabelFirst, 6);
    stimulus.name = "stimulus".to_string();
    stimulus.raw = stimulus.raw.slice(s![.., .., .., ..20]).to_owned();

    let results = process_contexts(vec![baseline, stimulus], &params);
    assert_eq!(results[0].0, "baseline");
    assert!(results[0].1.is_ok());
    assert_eq!(results[1].0, "stimulus");
    let err = results[1].1.as_ref().unwrap_err();
    assert!(matches!(err.root(), AslError::ShapeMismatch { .. }));
    assert!(err.to_string().contains("stimulus"));
}

#[test]
fn dilated_region_mask_drives_outlier_statistic() {
    let (mut input, params) = outlier_input(AcquisitionOrder::LabelFirst, 9);
    let mut seed = Array3::from_elem(DIM, false);
    seed[[0, 1, 0]] = true;
    let region = dilate_mask(seed.view(), DilationMode::Volume3d, 1, true);
    assert_eq!(region.iter().filter(|m| **m).count(), 5);
    input.region_mask = Some(region);

    let out = process_context(&input, &params).unwrap();
    assert_eq!(out.outliers.outliers, vec![3]);
    assert!(out.t1.values.iter().all(|v| *v >= 0.));
}
