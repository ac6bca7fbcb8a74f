//! Conversion between dense row-major buffers and arbitrarily strided ones.
//!
//! Both directions copy raw element bytes, so floating data is never
//! reinterpreted. Positions of a strided buffer that no logical index
//! reaches are left untouched.

use anyhow::Result;
use optest_core::ContractError;
use smallvec::SmallVec;

/// Row-major strides of a dense buffer with this shape.
pub fn dense_strides(shape: &[usize]) -> SmallVec<[usize; 6]> {
    let mut strides: SmallVec<[usize; 6]> = SmallVec::from_elem(0, shape.len());
    let mut base = 1usize;
    for d in (0..shape.len()).rev() {
        strides[d] = base;
        base *= shape[d];
    }
    strides
}

/// Elements needed to hold every offset `stride` reaches for `shape`.
pub fn strided_extent(shape: &[usize], stride: &[usize]) -> usize {
    if shape.iter().any(|&n| n == 0) {
        return 0;
    }
    1 + shape
        .iter()
        .zip(stride)
        .map(|(&n, &s)| (n - 1) * s)
        .sum::<usize>()
}

/// Scatter dense `src` into `dst` laid out with `dst_stride`.
pub fn dense_to_strided(
    dst: &mut [u8],
    src: &[u8],
    shape: &[usize],
    dst_stride: &[usize],
    elem_size: usize,
) -> Result<()> {
    check_rank(shape, dst_stride)?;
    let src_stride = dense_strides(shape);
    check_len("dense source", src, shape.iter().product::<usize>(), elem_size)?;
    check_len("strided destination", dst, strided_extent(shape, dst_stride), elem_size)?;
    stride_map(dst, dst_stride, src, &src_stride, shape, elem_size);
    Ok(())
}

/// Gather strided `src` (laid out with `src_stride`) into dense `dst`.
pub fn strided_to_dense(
    dst: &mut [u8],
    src: &[u8],
    shape: &[usize],
    src_stride: &[usize],
    elem_size: usize,
) -> Result<()> {
    check_rank(shape, src_stride)?;
    let dst_stride = dense_strides(shape);
    check_len("strided source", src, strided_extent(shape, src_stride), elem_size)?;
    check_len("dense destination", dst, shape.iter().product::<usize>(), elem_size)?;
    stride_map(dst, &dst_stride, src, src_stride, shape, elem_size);
    Ok(())
}

fn check_rank(shape: &[usize], stride: &[usize]) -> Result<()> {
    if shape.len() != stride.len() {
        return Err(ContractError::RankMismatch {
            shape: shape.len(),
            stride: stride.len(),
        }
        .into());
    }
    Ok(())
}

fn check_len(what: &'static str, buf: &[u8], elems: usize, elem_size: usize) -> Result<()> {
    let required = elems * elem_size;
    if buf.len() < required {
        return Err(ContractError::BufferTooSmall {
            what,
            required,
            actual: buf.len(),
        }
        .into());
    }
    Ok(())
}

/// Walks every multi-index with an explicit counter over the outer
/// dimensions; the innermost dimension is copied as one run.
fn stride_map(
    dst: &mut [u8],
    dst_stride: &[usize],
    src: &[u8],
    src_stride: &[usize],
    shape: &[usize],
    elem_size: usize,
) {
    if shape.iter().any(|&n| n == 0) {
        return;
    }
    let Some((&inner, outer)) = shape.split_last() else {
        // rank 0: a single element
        dst[..elem_size].copy_from_slice(&src[..elem_size]);
        return;
    };
    let last = shape.len() - 1;
    let (d_inner, s_inner) = (dst_stride[last], src_stride[last]);

    let mut index: SmallVec<[usize; 6]> = SmallVec::from_elem(0, outer.len());
    let mut dst_base = 0usize;
    let mut src_base = 0usize;
    loop {
        copy_run(dst, dst_base, d_inner, src, src_base, s_inner, inner, elem_size);

        // advance the outer counter, carrying like an odometer
        let mut d = outer.len();
        loop {
            if d == 0 {
                return;
            }
            d -= 1;
            index[d] += 1;
            dst_base += dst_stride[d];
            src_base += src_stride[d];
            if index[d] < outer[d] {
                break;
            }
            dst_base -= dst_stride[d] * index[d];
            src_base -= src_stride[d] * index[d];
            index[d] = 0;
        }
    }
}

#[allow(clippy::too_many_arguments)]
fn copy_run(
    dst: &mut [u8],
    dst_base: usize,
    dst_step: usize,
    src: &[u8],
    src_base: usize,
    src_step: usize,
    len: usize,
    elem_size: usize,
) {
    if dst_step == 1 && src_step == 1 {
        let (d, s) = (dst_base * elem_size, src_base * elem_size);
        let n = len * elem_size;
        dst[d..d + n].copy_from_slice(&src[s..s + n]);
        return;
    }
    for i in 0..len {
        let d = (dst_base + i * dst_step) * elem_size;
        let s = (src_base + i * src_step) * elem_size;
        dst[d..d + elem_size].copy_from_slice(&src[s..s + elem_size]);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn as_bytes(v: &[u32]) -> Vec<u8> {
        v.iter().flat_map(|x| x.to_ne_bytes()).collect()
    }

    fn as_u32(b: &[u8]) -> Vec<u32> {
        b.chunks_exact(4)
            .map(|c| u32::from_ne_bytes([c[0], c[1], c[2], c[3]]))
            .collect()
    }

    #[test]
    fn column_major_scatter_and_gather() {
        let shape = [2, 3];
        let stride = [1, 2];
        let dense = as_bytes(&[1, 2, 3, 4, 5, 6]);

        let mut strided = vec![0u8; strided_extent(&shape, &stride) * 4];
        dense_to_strided(&mut strided, &dense, &shape, &stride, 4).unwrap();
        assert_eq!(as_u32(&strided), vec![1, 4, 2, 5, 3, 6]);

        let mut back = vec![0u8; 6 * 4];
        strided_to_dense(&mut back, &strided, &shape, &stride, 4).unwrap();
        assert_eq!(back, dense);
    }

    #[test]
    fn padded_rows_leave_gaps_untouched() {
        let shape = [2, 2];
        let stride = [3, 1];
        let dense = as_bytes(&[1, 2, 3, 4]);
        let mut strided = as_bytes(&[9, 9, 9, 9, 9]);
        dense_to_strided(&mut strided, &dense, &shape, &stride, 4).unwrap();
        assert_eq!(as_u32(&strided), vec![1, 2, 9, 3, 4]);
    }

    #[test]
    fn rank_mismatch_is_a_contract_error() {
        let mut dst = vec![0u8; 16];
        let err = dense_to_strided(&mut dst, &[0u8; 16], &[2, 2], &[1], 4).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<ContractError>(),
            Some(ContractError::RankMismatch { shape: 2, stride: 1 })
        ));
    }

    #[test]
    fn undersized_destination_is_rejected() {
        let mut dst = vec![0u8; 8];
        let err = dense_to_strided(&mut dst, &[0u8; 16], &[2, 2], &[4, 1], 4).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<ContractError>(),
            Some(ContractError::BufferTooSmall { .. })
        ));
    }

    #[test]
    fn zero_extent_is_a_noop() {
        let mut dst: Vec<u8> = Vec::new();
        dense_to_strided(&mut dst, &[], &[0, 3], &[3, 1], 4).unwrap();
        assert_eq!(strided_extent(&[0, 3], &[3, 1]), 0);
    }

    #[test]
    fn dense_strides_are_row_major() {
        assert_eq!(dense_strides(&[2, 3, 4]).as_slice(), &[12, 4, 1]);
        assert!(dense_strides(&[]).is_empty());
    }
}
