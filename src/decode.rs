// Acquisition-order decoding
// the scanner packs slices, dynamics, PLDs and the two labeling conditions into one time axis.
// This module unpacks that axis into an explicit (x, y, z, dynamic, pld, condition) tensor.

use crate::error::{AslError, Result};
use crate::params::{AcquisitionGeometry, AcquisitionOrder};
use ndarray::{s, Array6, ArrayView3, ArrayView4, ArrayView5, Axis, ShapeBuilder, Zip};
use tracing::debug;

/// magnetization state of one acquired volume. The discriminant is the index along the condition
/// axis of [DecodedTensor].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Condition {
    Control = 0,
    Label = 1,
}

impl Condition {
    pub const ALL: [Condition; 2] = [Condition::Control, Condition::Label];

    #[inline]
    pub fn index(self) -> usize {
        self as usize
    }
}

impl AcquisitionOrder {
    /// position of a condition block within one dynamic (0 = first NPLD volumes, 1 = next NPLD)
    fn block(self, condition: Condition) -> usize {
        match (self, condition) {
            (AcquisitionOrder::LabelFirst, Condition::Label) => 0,
            (AcquisitionOrder::LabelFirst, Condition::Control) => 1,
            (AcquisitionOrder::ControlFirst, Condition::Control) => 0,
            (AcquisitionOrder::ControlFirst, Condition::Label) => 1,
        }
    }

    /// raw time index of a (dynamic, pld, condition) volume for a scan with `n_pld` delays
    pub fn raw_index(self, dynamic: usize, pld: usize, condition: Condition, n_pld: usize) -> usize {
        2 * n_pld * dynamic + n_pld * self.block(condition) + pld
    }
}

/// Look-Locker corrected ASL data with axes (x, y, z, dynamic, pld, condition). Dynamic 0 is the
/// calibration (M0) acquisition, dynamics 1.. are the label/control repeats.
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedTensor {
    data: Array6<f32>,
}

impl DecodedTensor {
    /// wraps an existing 6-D array. The last axis must hold exactly the two conditions.
    pub fn from_array(data: Array6<f32>) -> Result<Self> {
        let dim = data.dim();
        if dim.5 != 2 {
            return Err(AslError::shape("condition axis", 2, dim.5));
        }
        if dim.3 < 2 {
            return Err(AslError::shape("dynamic axis (M0 + repeats)", ">= 2", dim.3));
        }
        Ok(Self { data })
    }

    pub fn data(&self) -> &Array6<f32> {
        &self.data
    }

    pub fn into_inner(self) -> Array6<f32> {
        self.data
    }

    pub fn vol_dim(&self) -> [usize; 3] {
        let d = self.data.dim();
        [d.0, d.1, d.2]
    }

    pub fn n_dyn(&self) -> usize {
        self.data.len_of(Axis(3))
    }

    pub fn n_repeats(&self) -> usize {
        self.n_dyn() - 1
    }

    pub fn n_pld(&self) -> usize {
        self.data.len_of(Axis(4))
    }

    pub fn volume(&self, dynamic: usize, pld: usize, condition: Condition) -> ArrayView3<f32> {
        self.data.slice(s![.., .., .., dynamic, pld, condition.index()])
    }

    /// all dynamics and PLDs of one condition: (x, y, z, dynamic, pld)
    pub fn condition(&self, condition: Condition) -> ArrayView5<f32> {
        self.data.index_axis(Axis(5), condition.index())
    }

    /// calibration dynamic: (x, y, z, pld, condition)
    pub fn m0(&self) -> ArrayView5<f32> {
        self.data.index_axis(Axis(3), 0)
    }

    /// repeats of one condition at one PLD: (x, y, z, repeat)
    pub fn repeats(&self, pld: usize, condition: Condition) -> ArrayView4<f32> {
        self.data.slice(s![.., .., .., 1.., pld, condition.index()])
    }
}

/// Splits the packed raw time axis into a [DecodedTensor], dividing every volume by the
/// correction factor of its PLD. The condition order within a dynamic is taken from `order`; it is
/// never inferred from the data.
pub fn decode(raw: ArrayView4<f32>, geometry: &AcquisitionGeometry, correction: &[f64], order: AcquisitionOrder) -> Result<DecodedTensor> {
    geometry.validate()?;

    let (nx, ny, nz, nt) = raw.dim();
    let n_pld = geometry.n_pld;
    let n_dyn = geometry.n_dyn;

    if nt != geometry.raw_time_len() {
        return Err(AslError::shape("raw time axis (n_pld * n_dyn * 2)", geometry.raw_time_len(), nt));
    }
    if nz != geometry.n_slices {
        return Err(AslError::shape("raw slice axis", geometry.n_slices, nz));
    }
    if correction.len() != n_pld {
        return Err(AslError::shape("correction factors per PLD", n_pld, correction.len()));
    }
    if let Some(bad) = correction.iter().find(|f| !(f.is_finite() && **f > 0.)) {
        return Err(AslError::InvalidGeometry(format!("correction factors must be positive, found {}", bad)));
    }

    let mut data = Array6::<f32>::zeros((nx, ny, nz, n_dyn, n_pld, 2).f());

    for (pld, &factor) in correction.iter().enumerate() {
        let factor = factor as f32;
        for dynamic in 0..n_dyn {
            for condition in Condition::ALL {
                let t = order.raw_index(dynamic, pld, condition, n_pld);
                let src = raw.index_axis(Axis(3), t);
                let dst = data.slice_mut(s![.., .., .., dynamic, pld, condition.index()]);
                Zip::from(dst).and(&src).for_each(|d, &r| *d = r / factor);
            }
        }
    }

    debug!(shape = ?data.shape(), ?order, "decoded raw acquisition");
    Ok(DecodedTensor { data })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::params::AslParams;
    use ndarray::Array4;

    fn geometry(n_pld: usize, n_dyn: usize) -> AcquisitionGeometry {
        let plds = (0..n_pld).map(|i| 0.5 + 0.5 * i as f64).collect();
        AcquisitionGeometry::new(2, n_dyn, plds, 25., [3., 3., 7.], &AslParams::default()).unwrap()
    }

    /// raw volume t holds the constant t
    fn ramp_raw(nt: usize) -> Array4<f32> {
        Array4::from_shape_fn((3, 2, 2, nt).f(), |(_, _, _, t)| t as f32)
    }

    #[test]
    fn raw_index_layout() {
        let n_pld = 3;
        assert_eq!(AcquisitionOrder::LabelFirst.raw_index(0, 0, Condition::Label, n_pld), 0);
        assert_eq!(AcquisitionOrder::LabelFirst.raw_index(0, 0, Condition::Control, n_pld), 3);
        assert_eq!(AcquisitionOrder::LabelFirst.raw_index(1, 2, Condition::Label, n_pld), 8);
        assert_eq!(AcquisitionOrder::LabelFirst.raw_index(1, 2, Condition::Control, n_pld), 11);
        assert_eq!(AcquisitionOrder::ControlFirst.raw_index(1, 2, Condition::Control, n_pld), 8);
        assert_eq!(AcquisitionOrder::ControlFirst.raw_index(1, 2, Condition::Label, n_pld), 11);
    }

    #[test]
    fn decode_label_first() {
        let g = geometry(2, 3);
        let raw = ramp_raw(g.raw_time_len());
        let decoded = decode(raw.view(), &g, &[1., 1.], AcquisitionOrder::LabelFirst).unwrap();
        assert_eq!(decoded.data().shape(), &[3, 2, 2, 3, 2, 2]);
        // dynamic 1, pld 1: label at t = 4 + 1, control at t = 4 + 2 + 1
        assert!(decoded.volume(1, 1, Condition::Label).iter().all(|&x| x == 5.));
        assert!(decoded.volume(1, 1, Condition::Control).iter().all(|&x| x == 7.));
        assert!(decoded.volume(2, 0, Condition::Label).iter().all(|&x| x == 8.));
    }

    #[test]
    fn control_first_swaps_conditions_only() {
        let g = geometry(2, 3);
        let raw = ramp_raw(g.raw_time_len());
        let lf = decode(raw.view(), &g, &[1., 1.], AcquisitionOrder::LabelFirst).unwrap();
        let cf = decode(raw.view(), &g, &[1., 1.], AcquisitionOrder::ControlFirst).unwrap();
        assert_eq!(lf.condition(Condition::Label), cf.condition(Condition::Control));
        assert_eq!(lf.condition(Condition::Control), cf.condition(Condition::Label));
    }

    #[test]
    fn first_dynamic_is_m0_for_either_order() {
        let g = geometry(2, 3);
        let raw = ramp_raw(g.raw_time_len());
        for order in [AcquisitionOrder::LabelFirst, AcquisitionOrder::ControlFirst] {
            let decoded = decode(raw.view(), &g, &[0.5, 0.5], order).unwrap();
            let m0 = decoded.m0();
            let mut values = m0.iter().cloned().collect::<Vec<f32>>();
            values.sort_by(|a, b| a.partial_cmp(b).unwrap());
            values.dedup();
            // raw volumes 0..4 divided by their PLD factor
            assert_eq!(values, vec![0., 2., 4., 6.]);
        }
    }

    #[test]
    fn correction_divides_per_pld() {
        let g = geometry(2, 2);
        let raw = Array4::<f32>::from_elem((2, 2, 2, g.raw_time_len()).f(), 6.);
        let decoded = decode(raw.view(), &g, &[0.5, 2.], AcquisitionOrder::LabelFirst).unwrap();
        assert!(decoded.repeats(0, Condition::Control).iter().all(|&x| x == 12.));
        assert!(decoded.repeats(1, Condition::Label).iter().all(|&x| x == 3.));
    }

    #[test]
    fn shape_mismatch_is_fatal() {
        let g = geometry(2, 3);
        let raw = ramp_raw(g.raw_time_len() - 1);
        let r = decode(raw.view(), &g, &[1., 1.], AcquisitionOrder::LabelFirst);
        assert!(matches!(r, Err(AslError::ShapeMismatch { .. })));

        let raw = ramp_raw(g.raw_time_len());
        let r = decode(raw.view(), &g, &[1.], AcquisitionOrder::LabelFirst);
        assert!(matches!(r, Err(AslError::ShapeMismatch { .. })));
    }
}
