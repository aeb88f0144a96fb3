//! Binary mask utilities
//!
//! Masks are boolean volumes aligned with the calibration image. Dilation pads a brain mask so
//! that edge voxels survive later resampling.

use crate::array_utils::{neighbour_offsets, offset_subscript};
use ndarray::{Array3, ArrayView3, Zip};

/// neighbourhood used for dilation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DilationMode {
    /// grow within each slice only
    Slice2d,
    /// grow across slices as well
    Volume3d,
}

/// Binary dilation with a 3x3 (slice) or 3x3x3 (volume) structuring element. `conservative`
/// restricts growth to face neighbours, otherwise edge neighbours are included too (8 in-plane,
/// 18 in 3D). `iterations == 0` repeats until the mask stops changing. Voxels outside the volume
/// count as background.
pub fn dilate_mask(mask: ArrayView3<bool>, mode: DilationMode, iterations: usize, conservative: bool) -> Array3<bool> {
    let rank = match mode {
        DilationMode::Slice2d => 2,
        DilationMode::Volume3d => 3,
    };
    let connectivity = if conservative { 1 } else { 2 };
    let offsets = neighbour_offsets(rank, connectivity);

    let (nx, ny, nz) = mask.dim();
    let size = [nx, ny, nz];
    let mut current = mask.to_owned();
    let mut iteration = 0;
    loop {
        let mut next = current.clone();
        Zip::indexed(&mut next).for_each(|(ix, iy, iz), v| {
            if *v {
                return;
            }
            *v = offsets.iter().any(|off| {
                offset_subscript(&[ix, iy, iz], off, &size).map_or(false, |[x, y, z]| current[[x, y, z]])
            });
        });
        iteration += 1;
        let changed = next != current;
        current = next;
        if !changed || (iterations > 0 && iteration >= iterations) {
            break;
        }
    }
    current
}

/// number of true voxels in a mask
pub fn count(mask: ArrayView3<bool>) -> usize {
    mask.iter().filter(|m| **m).count()
}
