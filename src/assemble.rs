// Derived volume assembly
// the kinetic model fits downstream each want a different subset of PLDs, but all of them must
// come from one reordering of the decoded data so that PLD timing stays in sync with the volumes.

use crate::decode::{Condition, DecodedTensor};
use crate::error::{AslError, Result};
use crate::interleave::interleave;
use crate::params::AcquisitionGeometry;
use ndarray::{s, Array3, Array4, ArrayView3, ArrayView4, Axis, ShapeBuilder};
use std::ops::Range;
use tracing::{debug, info};

/// the three PLD subsets handed to the perfusion solver
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NamedVolume {
    /// all PLDs, for arrival time fitting
    AllPld,
    /// second PLD onward, for flow fitting. The first PLD carries macro-vascular signal.
    Pld2ToLast,
    /// first two PLDs, for arterial transit artifact fitting
    Pld1To2,
}

impl NamedVolume {
    pub const ALL: [NamedVolume; 3] = [NamedVolume::AllPld, NamedVolume::Pld2ToLast, NamedVolume::Pld1To2];

    /// PLD indices covered by this subset
    pub fn pld_range(self, n_pld: usize) -> Range<usize> {
        match self {
            NamedVolume::AllPld => 0..n_pld,
            NamedVolume::Pld2ToLast => 1..n_pld,
            NamedVolume::Pld1To2 => 0..2.min(n_pld),
        }
    }

    /// whether the downstream fit should model a macro-vascular (arterial) component
    pub fn arterial_component(self) -> bool {
        !matches!(self, NamedVolume::Pld1To2)
    }

    pub fn purpose(self) -> &'static str {
        match self {
            NamedVolume::AllPld => "arrival time",
            NamedVolume::Pld2ToLast => "perfusion",
            NamedVolume::Pld1To2 => "arterial transit artifact",
        }
    }
}

/// Control/label interleaved ASL series with time axis ordered PLD-major:
/// `t = pld * (2 * n_repeats) + 2 * repeat + {0 = control, 1 = label}`
#[derive(Debug, Clone, PartialEq)]
pub struct InterleavedVolume {
    data: Array4<f32>,
    n_pld: usize,
    n_repeats: usize,
    /// PLD times in seconds
    plds: Vec<f64>,
}

impl InterleavedVolume {
    pub fn new(data: Array4<f32>, n_pld: usize, n_repeats: usize, plds: Vec<f64>) -> Result<Self> {
        let nt = data.len_of(Axis(3));
        if nt != 2 * n_pld * n_repeats {
            return Err(AslError::shape("interleaved time axis (2 * n_repeats * n_pld)", 2 * n_pld * n_repeats, nt));
        }
        if plds.len() != n_pld {
            return Err(AslError::shape("PLD times", n_pld, plds.len()));
        }
        Ok(Self { data, n_pld, n_repeats, plds })
    }

    pub fn data(&self) -> &Array4<f32> {
        &self.data
    }

    pub fn n_pld(&self) -> usize {
        self.n_pld
    }

    pub fn n_repeats(&self) -> usize {
        self.n_repeats
    }

    pub fn plds(&self) -> &[f64] {
        &self.plds
    }

    /// number of volumes in one PLD block
    pub fn block_len(&self) -> usize {
        2 * self.n_repeats
    }

    /// time index of a single volume
    pub fn time_index(&self, pld: usize, repeat: usize, condition: Condition) -> usize {
        pld * self.block_len() + 2 * repeat + condition.index()
    }

    pub fn volume(&self, pld: usize, repeat: usize, condition: Condition) -> ArrayView3<f32> {
        self.data.index_axis(Axis(3), self.time_index(pld, repeat, condition))
    }

    pub fn time_range(&self, kind: NamedVolume) -> Range<usize> {
        let plds = kind.pld_range(self.n_pld);
        plds.start * self.block_len()..plds.end * self.block_len()
    }

    /// one of the three named volumes, as a view into the shared reordering
    pub fn view(&self, kind: NamedVolume) -> ArrayView4<f32> {
        let r = self.time_range(kind);
        self.data.slice(s![.., .., .., r])
    }

    pub fn len(&self, kind: NamedVolume) -> usize {
        self.time_range(kind).len()
    }

    /// PLD times (seconds) matching the volumes of `kind`
    pub fn pld_times(&self, kind: NamedVolume) -> &[f64] {
        &self.plds[kind.pld_range(self.n_pld)]
    }

    pub fn all_pld(&self) -> ArrayView4<f32> {
        self.view(NamedVolume::AllPld)
    }

    pub fn pld2_to_last(&self) -> ArrayView4<f32> {
        self.view(NamedVolume::Pld2ToLast)
    }

    pub fn pld1_to_2(&self) -> ArrayView4<f32> {
        self.view(NamedVolume::Pld1To2)
    }

    /// Drops whole repeats, keeping the PLD-major ordering. `keep` holds one flag per repeat.
    pub fn filter_repeats(&self, keep: &[bool]) -> Result<InterleavedVolume> {
        if keep.len() != self.n_repeats {
            return Err(AslError::shape("repeat keep mask", self.n_repeats, keep.len()));
        }
        let kept = keep.iter().enumerate().filter(|(_, k)| **k).map(|(r, _)| r).collect::<Vec<usize>>();
        if kept.is_empty() {
            return Err(AslError::CorruptSignal("every repeat was rejected".to_string()));
        }
        let n_kept = kept.len();
        let (nx, ny, nz, _) = self.data.dim();
        let mut data = Array4::<f32>::zeros((nx, ny, nz, 2 * n_kept * self.n_pld).f());
        for pld in 0..self.n_pld {
            for (new_r, &old_r) in kept.iter().enumerate() {
                for condition in Condition::ALL {
                    let t = pld * 2 * n_kept + 2 * new_r + condition.index();
                    data.index_axis_mut(Axis(3), t).assign(&self.volume(pld, old_r, condition));
                }
            }
        }
        InterleavedVolume::new(data, self.n_pld, n_kept, self.plds.clone())
    }
}

/// everything the perfusion and T1 fits need from one decoded acquisition
#[derive(Debug, Clone, PartialEq)]
pub struct AssembledVolumes {
    pub interleaved: InterleavedVolume,
    /// calibration image: control condition of the M0 dynamic averaged over PLDs
    pub m0: Array3<f32>,
    /// M0 dynamic per PLD, averaged over the two conditions: (x, y, z, pld)
    pub m0_all_pld: Array4<f32>,
}

/// builds the interleaved series and calibration images from a decoded acquisition
pub fn assemble(decoded: &DecodedTensor, geometry: &AcquisitionGeometry) -> Result<AssembledVolumes> {
    let n_pld = decoded.n_pld();
    let n_repeats = decoded.n_repeats();
    if n_pld != geometry.n_pld || decoded.n_dyn() != geometry.n_dyn {
        return Err(AslError::shape("decoded (n_dyn, n_pld)", (geometry.n_dyn, geometry.n_pld), (decoded.n_dyn(), n_pld)));
    }
    let [nx, ny, nz] = decoded.vol_dim();

    let m0_control = decoded.m0().index_axis(Axis(4), Condition::Control.index()).to_owned();
    let m0 = m0_control.mean_axis(Axis(3)).ok_or_else(|| AslError::shape("PLD axis", ">= 1", 0))?;
    let m0_all_pld = decoded.m0().mean_axis(Axis(4)).ok_or_else(|| AslError::shape("condition axis", 2, 0))?;

    let block = 2 * n_repeats;
    let mut data = Array4::<f32>::zeros((nx, ny, nz, n_pld * block).f());
    for pld in 0..n_pld {
        let pair = interleave(decoded.repeats(pld, Condition::Control), decoded.repeats(pld, Condition::Label))?;
        data.slice_mut(s![.., .., .., pld * block..(pld + 1) * block]).assign(&pair);
        debug!(pld, volumes = block, "interleaved control/label");
    }

    let interleaved = InterleavedVolume::new(data, n_pld, n_repeats, geometry.plds.clone())?;
    info!(
        all_pld = interleaved.len(NamedVolume::AllPld),
        pld2_to_last = interleaved.len(NamedVolume::Pld2ToLast),
        pld1_to_2 = interleaved.len(NamedVolume::Pld1To2),
        "assembled interleaved control/label volumes"
    );

    Ok(AssembledVolumes { interleaved, m0, m0_all_pld })
}
