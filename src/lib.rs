//! Reconstruction core for multi-delay pCASL with a Look-Locker readout.
//!
//! Raw scanner series go through Look-Locker correction, decoding into a
//! (x, y, z, dynamic, PLD, condition) tensor, assembly of the interleaved control/label volumes
//! for the perfusion solver, robust rejection of corrupted repeats, a voxelwise apparent T1
//! fit of the calibration series and NaN-aware smoothing of the calibration image.
//! [pipeline::process_context] chains the stages for one scan phase.

pub mod error;
pub mod params;
pub mod look_locker;
pub mod decode;
pub mod interleave;
pub mod assemble;
pub mod outlier;
pub mod t1;
pub mod mask;
pub mod smooth;
pub mod pipeline;
mod array_utils;

pub use error::{AslError, Result};
pub use params::{AcquisitionGeometry, AcquisitionOrder, AslParams, T1Validity};
pub use decode::{decode, Condition, DecodedTensor};
pub use assemble::{assemble, AssembledVolumes, InterleavedVolume, NamedVolume};
pub use look_locker::{compute_correction_factors, remove_look_locker_correction};
pub use outlier::{detect_and_filter, detect_outliers, OutlierReport};
pub use t1::{estimate_t1, T1Map};
pub use mask::{dilate_mask, DilationMode};
pub use smooth::{smooth_image, SmoothingMode};
pub use pipeline::{process_context, process_contexts, ContextInput, ContextOutput, QuantificationRun, SolverConstants};
