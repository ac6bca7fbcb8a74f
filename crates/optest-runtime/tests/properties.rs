//! Property tests for the transcoding pipeline.
//!
//! - strided -> dense inverts dense -> strided for any injective layout
//! - software quantization round-trips within half a step
//! - reference dtype selection covers the whole dtype enumeration

use optest_core::{DType, HostBuffer, QuantParams};
use optest_runtime::{
    cast_in, cast_out, dense_to_strided, dequantize, quantize, strided_extent, strided_to_dense,
    CastOptions, QuantMode,
};
use proptest::prelude::*;

/// Shape plus strides for a layout with optional padding and any dimension
/// order.
fn layout() -> impl Strategy<Value = (Vec<usize>, Vec<usize>)> {
    prop::collection::vec((1usize..5, 0usize..3, any::<u8>()), 1..=6).prop_map(|dims| {
        let shape: Vec<usize> = dims.iter().map(|d| d.0).collect();
        let mut order: Vec<usize> = (0..dims.len()).collect();
        order.sort_by_key(|&d| dims[d].2);
        let mut stride = vec![0; dims.len()];
        let mut running = 1;
        for d in order {
            stride[d] = running;
            running *= dims[d].0 + dims[d].1;
        }
        (shape, stride)
    })
}

proptest! {
    #[test]
    fn stride_round_trip((shape, stride) in layout(), elem in prop::sample::select(vec![1usize, 2, 4, 8])) {
        let n: usize = shape.iter().product();
        let dense: Vec<u8> = (0..n * elem).map(|i| (i % 251) as u8).collect();

        let mut strided = vec![0u8; strided_extent(&shape, &stride) * elem];
        dense_to_strided(&mut strided, &dense, &shape, &stride, elem).unwrap();
        let mut back = vec![0u8; n * elem];
        strided_to_dense(&mut back, &strided, &shape, &stride, elem).unwrap();
        prop_assert_eq!(back, dense);
    }

    #[test]
    fn fitted_quantization_is_within_half_a_step(
        values in prop::collection::vec(-1000f32..1000f32, 1..64),
        wide in any::<bool>(),
    ) {
        let dtype = if wide { DType::Int16 } else { DType::Int8 };
        let q = quantize(&values, dtype, QuantMode::Software, None).unwrap();
        let mut back = vec![0f32; values.len()];
        dequantize(q.data.as_bytes(), dtype, q.params, &mut back).unwrap();

        let half_step = q.params.step() / 2.0;
        for (x, y) in values.iter().zip(&back) {
            let err = (f64::from(*x) - f64::from(*y)).abs();
            prop_assert!(err <= half_step + f64::from(x.abs()) * 1e-6 + 1e-6, "{} -> {} (step {})", x, y, q.params.step());
        }
    }

    #[test]
    fn caller_params_round_trip_in_range(
        position in -8i32..4,
        scale in 0.5f32..1.0,
        codes in prop::collection::vec(-127i32..=127, 1..32),
    ) {
        let params = QuantParams { position, scale, offset: 0 };
        let step = params.step();
        // values inside the representable range, jittered off the grid
        let values: Vec<f32> = codes
            .iter()
            .map(|&c| (f64::from(c) * step + step * 0.3) as f32)
            .map(|v| v.clamp((-127.0 * step) as f32, (127.0 * step) as f32))
            .collect();

        let mut src: Vec<u8> = values.iter().flat_map(|v| v.to_ne_bytes()).collect();
        let mut dst = vec![0u8; values.len()];
        let opts = CastOptions { mode: QuantMode::Software, params: Some(params), dequantify: false };
        let used = cast_in(&mut src, DType::Float, &mut dst, DType::Int8, values.len(), &opts).unwrap();
        prop_assert_eq!(used, params);

        let mut out = vec![0u8; values.len() * 4];
        cast_out(&dst, DType::Int8, &mut out, DType::Float, values.len(), QuantMode::Software, params).unwrap();
        let back = HostBuffer::from_bytes(DType::Float, &out).to_f32_vec();
        for (x, y) in values.iter().zip(&back) {
            let err = (f64::from(*x) - f64::from(*y)).abs();
            prop_assert!(err <= step / 2.0 + step * 1e-4, "{} -> {}", x, y);
        }
    }
}

#[test]
fn reference_dtype_rule_is_exhaustive() {
    for dtype in DType::ALL {
        let expected = match dtype {
            DType::Double => DType::Double,
            DType::ComplexHalf | DType::ComplexFloat => DType::ComplexFloat,
            _ => DType::Float,
        };
        assert_eq!(dtype.reference_dtype(), expected, "{dtype}");
    }
}

#[test]
fn every_dtype_casts_to_itself_bit_exactly() {
    for dtype in DType::ALL {
        let n = 5;
        let mut src: Vec<u8> = (0..n * dtype.size_of()).map(|i| (i * 37 % 256) as u8).collect();
        let original = src.clone();
        let mut dst = vec![0u8; src.len()];
        cast_in(&mut src, dtype, &mut dst, dtype, n, &CastOptions::default()).unwrap();
        assert_eq!(dst, original, "{dtype}");
        assert_eq!(src, original, "{dtype}");
    }
}
