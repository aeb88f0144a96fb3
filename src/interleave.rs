use crate::error::{AslError, Result};
use ndarray::{s, Array4, ArrayView4, Axis, ShapeBuilder};

/// interleaves two equally sized 4-D series along the last axis: first[0], second[0], first[1],
/// second[1], ... The first input lands on even (0-based) positions, i.e. the odd positions when
/// counting from 1.
pub fn interleave(first: ArrayView4<f32>, second: ArrayView4<f32>) -> Result<Array4<f32>> {
    if first.dim() != second.dim() {
        return Err(AslError::shape("interleave inputs", first.dim(), second.dim()));
    }
    let (nx, ny, nz, n) = first.dim();
    let mut out = Array4::<f32>::zeros((nx, ny, nz, 2 * n).f());
    out.slice_mut(s![.., .., .., 0..;2]).assign(&first);
    out.slice_mut(s![.., .., .., 1..;2]).assign(&second);
    Ok(out)
}

/// splits an interleaved series back into its (even, odd) position series
pub fn deinterleave(x: ArrayView4<f32>) -> Result<(Array4<f32>, Array4<f32>)> {
    let n = x.len_of(Axis(3));
    if n % 2 != 0 {
        return Err(AslError::shape("interleaved series length (even)", n + 1, n));
    }
    let (nx, ny, nz, _) = x.dim();
    let mut first = Array4::<f32>::zeros((nx, ny, nz, n / 2).f());
    let mut second = Array4::<f32>::zeros((nx, ny, nz, n / 2).f());
    first.assign(&x.slice(s![.., .., .., 0..;2]));
    second.assign(&x.slice(s![.., .., .., 1..;2]));
    Ok((first, second))
}
