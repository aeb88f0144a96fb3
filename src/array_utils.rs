// Array utilities for column-major memory layouts

#[inline(always)]
pub fn index_to_subscript_col_maj3(index: usize, size: &[usize; 3]) -> [usize; 3] {
    let iz = index / (size[0] * size[1]);
    let rem = index % (size[0] * size[1]);
    let iy = rem / size[0];
    let ix = rem % size[0];
    [ix, iy, iz]
}

#[inline(always)]
pub fn subscript_to_index_col_maj3(subscript: &[usize; 3], size: &[usize; 3]) -> usize {
    let z_stride = size[0] * size[1];
    let y_stride = size[0];
    subscript[2] * z_stride + subscript[1] * y_stride + subscript[0]
}

/// offsets of the neighbours of a voxel within a 3x3(x3) structuring element. `rank` 2 keeps the
/// neighbourhood within the slice. A neighbour is included when at most `connectivity` of its
/// coordinates differ from the centre, so connectivity 1 gives face neighbours only.
pub fn neighbour_offsets(rank: usize, connectivity: usize) -> Vec<[isize; 3]> {
    assert!(rank == 2 || rank == 3, "only rank 2 and 3 neighbourhoods are supported");
    let z_range = if rank == 3 { -1..=1 } else { 0..=0 };
    let mut offsets = vec![];
    for dz in z_range {
        for dy in -1isize..=1 {
            for dx in -1isize..=1 {
                let n_nonzero = [dx, dy, dz].iter().filter(|d| **d != 0).count();
                if n_nonzero > 0 && n_nonzero <= connectivity {
                    offsets.push([dx, dy, dz]);
                }
            }
        }
    }
    offsets
}

/// applies an offset to a subscript, returning None when the result leaves the volume
#[inline(always)]
pub fn offset_subscript(subscript: &[usize; 3], offset: &[isize; 3], size: &[usize; 3]) -> Option<[usize; 3]> {
    let mut out = [0usize; 3];
    for i in 0..3 {
        let c = subscript[i] as isize + offset[i];
        if c < 0 || c >= size[i] as isize {
            return None;
        }
        out[i] = c as usize;
    }
    Some(out)
}
