use crate::error::{AslError, Result};
use serde::{Deserialize, Serialize};

/// order of the two magnetization conditions within one acquired dynamic. For `LabelFirst` the
/// scanner writes all PLDs of the label condition, then all PLDs of the control condition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AcquisitionOrder {
    LabelFirst,
    ControlFirst,
}

impl Default for AcquisitionOrder {
    fn default() -> Self {
        AcquisitionOrder::LabelFirst
    }
}

/// upper bound policy for accepting a fitted T1 value
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "policy", rename_all = "snake_case")]
pub enum T1Validity {
    /// accept values in (0, upper_bound]
    FixedUpperBound { upper_bound: f64 },
    /// accept values in (0, median + 2 * std] where the statistics are taken over the
    /// in-mask fitted values of the subject
    RobustThreshold,
}

impl Default for T1Validity {
    fn default() -> Self {
        T1Validity::FixedUpperBound { upper_bound: 300. }
    }
}

/// protocol and analysis constants that stay the same across subjects of one study
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AslParams {
    /// bolus duration in seconds
    pub tau: f64,
    /// number of background suppression pulses
    pub n_bs: usize,
    pub label_efficiency: f64,
    /// blood-brain partition coefficient (g/ml)
    pub lambda: f64,
    /// tissue T1 in seconds
    pub t1_tissue: f64,
    /// blood T1 in seconds
    pub t1_blood: f64,
    /// smoothing kernel width for perfusion maps (mm)
    pub fwhm: f64,
    /// smoothing kernel width for the calibration image (mm)
    pub fwhm_m0: f64,
    pub outlier_factor: f64,
    pub acquisition_order: AcquisitionOrder,
    pub t1_validity: T1Validity,
}

impl Default for AslParams {
    fn default() -> Self {
        Self {
            tau: 2.,
            n_bs: 4,
            label_efficiency: 0.85,
            lambda: 0.9,
            t1_tissue: 1.3,
            t1_blood: 1.65,
            fwhm: 6.,
            fwhm_m0: 5.,
            outlier_factor: 2.5,
            acquisition_order: AcquisitionOrder::default(),
            t1_validity: T1Validity::default(),
        }
    }
}

impl AslParams {
    pub fn from_toml_str(s: &str) -> Result<Self> {
        let params: AslParams = toml::from_str(s)?;
        params.validate()?;
        Ok(params)
    }

    pub fn to_toml_string(&self) -> Result<String> {
        let mut s = toml::to_string(self)?;
        s.push('\n');
        Ok(s)
    }

    pub fn from_json_str(s: &str) -> Result<Self> {
        let params: AslParams = serde_json::from_str(s)?;
        params.validate()?;
        Ok(params)
    }

    pub fn validate(&self) -> Result<()> {
        if !(self.outlier_factor > 0.) {
            return Err(AslError::Config(format!("outlier factor must be positive, got {}", self.outlier_factor)));
        }
        if !(self.t1_blood > 0.) || !(self.t1_tissue > 0.) {
            return Err(AslError::Config("T1 values must be positive".to_string()));
        }
        if !(self.tau > 0.) {
            return Err(AslError::Config(format!("bolus duration must be positive, got {}", self.tau)));
        }
        if !(self.fwhm >= 0.) || !(self.fwhm_m0 >= 0.) || !self.fwhm.is_finite() || !self.fwhm_m0.is_finite() {
            return Err(AslError::Config(format!("smoothing widths must be finite and >= 0, got {} / {}", self.fwhm, self.fwhm_m0)));
        }
        if let T1Validity::FixedUpperBound { upper_bound } = self.t1_validity {
            if !(upper_bound > 0.) {
                return Err(AslError::Config(format!("T1 upper bound must be positive, got {}", upper_bound)));
            }
        }
        Ok(())
    }
}

/// immutable description of one multi-delay acquisition. Everything downstream of the scanner
/// metadata reads from this record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AcquisitionGeometry {
    pub n_slices: usize,
    pub n_pld: usize,
    /// number of dynamics including the calibration (M0) dynamic
    pub n_dyn: usize,
    /// post-labeling delays in seconds
    pub plds: Vec<f64>,
    /// bolus duration in seconds
    pub tau: f64,
    /// readout flip angle in degrees
    pub flip_angle: f64,
    /// blood T1 in seconds
    pub t1_blood: f64,
    /// tissue T1 in seconds
    pub t1_tissue: f64,
    pub label_efficiency: f64,
    /// voxel size in mm
    pub voxel_size: [f64; 3],
}

impl AcquisitionGeometry {
    /// builds and validates a geometry from scanner-derived values and the study constants
    pub fn new(n_slices: usize, n_dyn: usize, plds: Vec<f64>, flip_angle: f64, voxel_size: [f64; 3], params: &AslParams) -> Result<Self> {
        let geom = Self {
            n_slices,
            n_pld: plds.len(),
            n_dyn,
            plds,
            tau: params.tau,
            flip_angle,
            t1_blood: params.t1_blood,
            t1_tissue: params.t1_tissue,
            label_efficiency: params.label_efficiency,
            voxel_size,
        };
        geom.validate()?;
        Ok(geom)
    }

    /// number of label/control repeats, excluding the calibration dynamic
    pub fn n_repeats(&self) -> usize {
        self.n_dyn.saturating_sub(1)
    }

    /// expected length of the packed raw time axis
    pub fn raw_time_len(&self) -> usize {
        self.n_pld * self.n_dyn * 2
    }

    /// post-labeling delays in milliseconds
    pub fn plds_ms(&self) -> Vec<f64> {
        self.plds.iter().map(|p| p * 1000.).collect()
    }

    pub fn validate(&self) -> Result<()> {
        let invalid = |msg: String| Err(AslError::InvalidGeometry(msg));
        if self.n_slices == 0 {
            return invalid("slice count must be non-zero".to_string());
        }
        if self.n_pld < 2 {
            return invalid(format!("at least 2 PLDs are required, got {}", self.n_pld));
        }
        if self.plds.len() != self.n_pld {
            return invalid(format!("{} PLD times given for {} PLDs", self.plds.len(), self.n_pld));
        }
        if self.n_dyn < 2 {
            return invalid(format!("at least 2 dynamics (M0 + 1 repeat) are required, got {}", self.n_dyn));
        }
        if self.plds.iter().any(|p| !p.is_finite() || *p <= 0.) {
            return invalid(format!("PLDs must be finite and positive: {:?}", self.plds));
        }
        if self.plds.windows(2).any(|w| w[1] <= w[0]) {
            return invalid(format!("PLDs must be strictly increasing: {:?}", self.plds));
        }
        if !(self.tau > 0.) {
            return invalid(format!("bolus duration must be positive, got {}", self.tau));
        }
        if !(self.flip_angle > 0. && self.flip_angle < 180.) {
            return invalid(format!("flip angle must lie in (0, 180) degrees, got {}", self.flip_angle));
        }
        if !(self.t1_blood > 0.) {
            return invalid(format!("blood T1 must be positive, got {}", self.t1_blood));
        }
        if self.voxel_size.iter().any(|v| !(*v > 0.)) {
            return invalid(format!("voxel sizes must be positive: {:?}", self.voxel_size));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn geometry(plds: Vec<f64>, flip_angle: f64) -> Result<AcquisitionGeometry> {
        AcquisitionGeometry::new(2, 3, plds, flip_angle, [3., 3., 7.], &AslParams::default())
    }

    #[test]
    fn geometry_counts() {
        let g = geometry(vec![0.5, 1.0, 1.5], 25.).unwrap();
        assert_eq!(g.n_pld, 3);
        assert_eq!(g.n_repeats(), 2);
        assert_eq!(g.raw_time_len(), 18);
        assert_eq!(g.plds_ms(), vec![500., 1000., 1500.]);
        assert_eq!(g.t1_blood, 1.65);
    }

    #[test]
    fn geometry_rejects_bad_input() {
        assert!(matches!(geometry(vec![0.5], 25.), Err(AslError::InvalidGeometry(_))));
        assert!(matches!(geometry(vec![1.0, 0.5], 25.), Err(AslError::InvalidGeometry(_))));
        assert!(matches!(geometry(vec![0.5, 1.0], 0.), Err(AslError::InvalidGeometry(_))));
        assert!(matches!(geometry(vec![0.5, 1.0], 180.), Err(AslError::InvalidGeometry(_))));
        let r = AcquisitionGeometry::new(2, 1, vec![0.5, 1.0], 25., [3., 3., 7.], &AslParams::default());
        assert!(matches!(r, Err(AslError::InvalidGeometry(_))));
    }

    #[test]
    fn params_toml_round_trip() {
        let mut params = AslParams::default();
        params.acquisition_order = AcquisitionOrder::ControlFirst;
        params.t1_validity = T1Validity::RobustThreshold;
        let s = params.to_toml_string().unwrap();
        assert!(s.contains("control_first"));
        let parsed = AslParams::from_toml_str(&s).unwrap();
        assert_eq!(parsed, params);
    }

    #[test]
    fn params_partial_json_uses_defaults() {
        let params = AslParams::from_json_str(r#"{"outlier_factor": 3.0, "t1_blood": 1.6}"#).unwrap();
        assert_eq!(params.outlier_factor, 3.0);
        assert_eq!(params.t1_blood, 1.6);
        assert_eq!(params.tau, 2.0);
        assert_eq!(params.acquisition_order, AcquisitionOrder::LabelFirst);
        assert_eq!(params.t1_validity, T1Validity::FixedUpperBound { upper_bound: 300. });
    }

    #[test]
    fn params_reject_negative_smoothing() {
        let r = AslParams::from_json_str(r#"{"fwhm_m0": -1.0}"#);
        assert!(matches!(r, Err(AslError::Config(_))));
        assert!(AslParams::from_json_str(r#"{"fwhm": 0.0}"#).is_ok());
    }

    #[test]
    fn params_reject_non_positive_outlier_factor() {
        let r = AslParams::from_json_str(r#"{"outlier_factor": 0.0}"#);
        assert!(matches!(r, Err(AslError::Config(_))));
    }
}
