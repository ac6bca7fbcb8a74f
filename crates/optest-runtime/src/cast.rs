//! Conversion between reference (host) data and device-native dtypes.
//!
//! Reference data is float, double or complex float (see
//! [`DType::reference_dtype`]). Casting in goes reference -> device, casting
//! out goes device -> reference. Narrow signed fixed-point targets (int8,
//! int16) go through an affine quantization step.

use anyhow::Result;
use half::f16;
use optest_core::{ContractError, DType, HostBuffer, QuantParams};
use tracing::{debug, warn};

/// How float data reaches a fixed-point dtype.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum QuantMode {
    /// The device runtime's own fixed-point cast: parameters are pinned to
    /// position 0, scale 1, offset 0.
    #[default]
    NoQuant,
    /// Software emulation of the fixed-point cast; parameters are taken from
    /// the caller or fitted to the data.
    Software,
}

#[derive(Clone, Copy, Debug, Default)]
pub struct CastOptions {
    pub mode: QuantMode,
    /// Caller-supplied parameters. Fitted from the data when `None`.
    pub params: Option<QuantParams>,
    /// Overwrite the source with the value the device will actually see.
    pub dequantify: bool,
}

/// Fixed-point data together with the parameters that produced it.
#[derive(Clone, Debug)]
pub struct Quantized {
    pub data: HostBuffer,
    pub params: QuantParams,
}

fn fixed_range(dtype: DType) -> Result<(i64, i64)> {
    match dtype {
        DType::Int8 => Ok((i64::from(i8::MIN), i64::from(i8::MAX))),
        DType::Int16 => Ok((i64::from(i16::MIN), i64::from(i16::MAX))),
        other => Err(ContractError::UnsupportedCast {
            src: DType::Float,
            dst: other,
        }
        .into()),
    }
}

/// Parameters whose range covers the largest finite magnitude in `values`.
pub fn fit_params(values: &[f32], dtype: DType) -> Result<QuantParams> {
    let (_, qmax) = fixed_range(dtype)?;
    let absmax = values
        .iter()
        .filter(|v| v.is_finite())
        .fold(0.0f64, |acc, &v| acc.max(f64::from(v).abs()));
    if absmax == 0.0 {
        return Ok(QuantParams::default());
    }
    let qmax = qmax as f64;
    let position = (absmax / qmax).log2().ceil() as i32;
    let scale = (absmax / (qmax * 2f64.powi(position))) as f32;
    Ok(QuantParams {
        position,
        scale,
        offset: 0,
    })
}

/// `q = round(x / (scale * 2^position)) + offset`, clamped to the dtype range.
pub fn quantize(values: &[f32], dtype: DType, mode: QuantMode, params: Option<QuantParams>) -> Result<Quantized> {
    let (qmin, qmax) = fixed_range(dtype)?;
    let params = match mode {
        QuantMode::NoQuant => QuantParams::default(),
        QuantMode::Software => match params {
            Some(p) => p,
            None => fit_params(values, dtype)?,
        },
    };
    let step = params.step();
    let mut data = HostBuffer::zeroed(dtype, values.len());
    let codes = values.iter().map(|&x| {
        let x = f64::from(x);
        if x.is_nan() {
            return i64::from(params.offset).clamp(qmin, qmax);
        }
        ((x / step).round() as i64 + i64::from(params.offset)).clamp(qmin, qmax)
    });
    match dtype {
        DType::Int8 => encode(data.as_bytes_mut(), codes.map(|q| (q as i8).to_ne_bytes())),
        _ => encode(data.as_bytes_mut(), codes.map(|q| (q as i16).to_ne_bytes())),
    }
    Ok(Quantized { data, params })
}

/// Inverse of [`quantize`]: `x = (q - offset) * scale * 2^position`.
pub fn dequantize(codes: &[u8], dtype: DType, params: QuantParams, dst: &mut [f32]) -> Result<()> {
    fixed_range(dtype)?;
    let step = params.step();
    let offset = i64::from(params.offset);
    let decode = |q: i64| ((q - offset) as f64 * step) as f32;
    match dtype {
        DType::Int8 => {
            for (d, b) in dst.iter_mut().zip(codes.iter()) {
                *d = decode(i64::from(*b as i8));
            }
        }
        _ => {
            for (d, b) in dst.iter_mut().zip(codes.chunks_exact(2)) {
                *d = decode(i64::from(i16::from_ne_bytes([b[0], b[1]])));
            }
        }
    }
    Ok(())
}

/// Reference -> device. Returns the quantization parameters that apply to
/// `dst` (the caller's parameters, or the defaults, when no quantization
/// takes place).
pub fn cast_in(
    src: &mut [u8],
    src_dtype: DType,
    dst: &mut [u8],
    dst_dtype: DType,
    count: usize,
    opts: &CastOptions,
) -> Result<QuantParams> {
    let passthrough = opts.params.unwrap_or_default();
    if count == 0 {
        debug!("skip cast in: count is zero");
        return Ok(passthrough);
    }
    check_len("cast source", src, count * src_dtype.size_of())?;
    check_len("cast destination", dst, count * dst_dtype.size_of())?;

    if src_dtype == dst_dtype {
        let n = count * src_dtype.size_of();
        dst[..n].copy_from_slice(&src[..n]);
        return Ok(passthrough);
    }

    match (src_dtype, dst_dtype) {
        (DType::Float, DType::Int8 | DType::Int16) => {
            let values = decode_f32(&src[..count * 4]);
            let q = quantize(&values, dst_dtype, opts.mode, opts.params)?;
            let n = count * dst_dtype.size_of();
            dst[..n].copy_from_slice(&q.data.as_bytes()[..n]);
            if opts.dequantify {
                let mut back = vec![0f32; count];
                dequantize(&dst[..n], dst_dtype, q.params, &mut back)?;
                encode(&mut src[..count * 4], back.iter().map(|v| v.to_ne_bytes()));
            }
            Ok(q.params)
        }
        (
            DType::Float,
            DType::Int64
            | DType::Uint64
            | DType::Int32
            | DType::Uint32
            | DType::Uint16
            | DType::Half
            | DType::Uint8
            | DType::Bool,
        )
        | (DType::ComplexFloat, DType::ComplexHalf) => {
            float_to_normal(&src[..count * src_dtype.size_of()], dst, dst_dtype);
            if opts.dequantify {
                let n = count * dst_dtype.size_of();
                let back = dst[..n].to_vec();
                normal_to_float(&back, dst_dtype, src);
            }
            Ok(passthrough)
        }
        (src, dst) => {
            warn!(%src, %dst, "cast in is not supported");
            Err(ContractError::UnsupportedCast { src, dst }.into())
        }
    }
}

/// Device -> reference.
pub fn cast_out(
    src: &[u8],
    src_dtype: DType,
    dst: &mut [u8],
    dst_dtype: DType,
    count: usize,
    mode: QuantMode,
    params: QuantParams,
) -> Result<()> {
    if count == 0 {
        debug!("skip cast out: count is zero");
        return Ok(());
    }
    check_len("cast source", src, count * src_dtype.size_of())?;
    check_len("cast destination", dst, count * dst_dtype.size_of())?;
    let src = &src[..count * src_dtype.size_of()];

    match (src_dtype, dst_dtype) {
        (s, d) if s == d => {
            dst[..src.len()].copy_from_slice(src);
            Ok(())
        }
        (DType::ComplexHalf, DType::ComplexFloat) => {
            normal_to_float(src, src_dtype, dst);
            Ok(())
        }
        (DType::Int8 | DType::Int16, DType::Float) => {
            let params = match mode {
                QuantMode::NoQuant => QuantParams::default(),
                QuantMode::Software => params,
            };
            let mut values = vec![0f32; count];
            dequantize(src, src_dtype, params, &mut values)?;
            encode(&mut dst[..count * 4], values.iter().map(|v| v.to_ne_bytes()));
            Ok(())
        }
        (
            DType::Half
            | DType::Bool
            | DType::Int32
            | DType::Int64
            | DType::Uint8
            | DType::Uint16
            | DType::Uint32
            | DType::Uint64,
            DType::Float,
        ) => {
            normal_to_float(src, src_dtype, dst);
            Ok(())
        }
        (DType::Uint8, DType::Half) => {
            encode(
                &mut dst[..count * 2],
                src.iter().map(|&b| f16::from_f32(f32::from(b)).to_ne_bytes()),
            );
            Ok(())
        }
        (src, dst) => {
            warn!(%src, %dst, "cast out is not supported");
            Err(ContractError::UnsupportedCast { src, dst }.into())
        }
    }
}

/// Round float data through half precision, in place.
pub fn round_trip_half(values: &mut [u8]) {
    for chunk in values.chunks_exact_mut(4) {
        let v = f32::from_ne_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
        chunk.copy_from_slice(&f16::from_f32(v).to_f32().to_ne_bytes());
    }
}

fn check_len(what: &'static str, buf: &[u8], required: usize) -> Result<()> {
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

fn decode_f32(bytes: &[u8]) -> Vec<f32> {
    bytes
        .chunks_exact(4)
        .map(|b| f32::from_ne_bytes([b[0], b[1], b[2], b[3]]))
        .collect()
}

fn encode<const N: usize>(dst: &mut [u8], values: impl Iterator<Item = [u8; N]>) {
    for (chunk, v) in dst.chunks_exact_mut(N).zip(values) {
        chunk.copy_from_slice(&v);
    }
}

/// Float (or complex float, component-wise) to a plain numeric dtype.
/// Integers truncate toward zero and saturate; NaN becomes zero.
fn float_to_normal(src: &[u8], dst: &mut [u8], dst_dtype: DType) {
    let values = decode_f32(src);
    let it = values.iter().copied();
    match dst_dtype {
        DType::Int64 => encode(dst, it.map(|x| (x as i64).to_ne_bytes())),
        DType::Uint64 => encode(dst, it.map(|x| (x as u64).to_ne_bytes())),
        DType::Int32 => encode(dst, it.map(|x| (x as i32).to_ne_bytes())),
        DType::Uint32 => encode(dst, it.map(|x| (x as u32).to_ne_bytes())),
        DType::Uint16 => encode(dst, it.map(|x| (x as u16).to_ne_bytes())),
        DType::Uint8 => encode(dst, it.map(|x| [x as u8])),
        DType::Bool => encode(dst, it.map(|x| [u8::from(x != 0.0)])),
        DType::Half | DType::ComplexHalf => {
            encode(dst, it.map(|x| f16::from_f32(x).to_ne_bytes()))
        }
        _ => {}
    }
}

/// Plain numeric dtype to float (complex half to complex float component-wise).
fn normal_to_float(src: &[u8], src_dtype: DType, dst: &mut [u8]) {
    let out = |dst: &mut [u8], it: &mut dyn Iterator<Item = f32>| {
        for (chunk, v) in dst.chunks_exact_mut(4).zip(it) {
            chunk.copy_from_slice(&v.to_ne_bytes());
        }
    };
    match src_dtype {
        DType::Half | DType::ComplexHalf => out(
            dst,
            &mut src
                .chunks_exact(2)
                .map(|b| f16::from_ne_bytes([b[0], b[1]]).to_f32()),
        ),
        DType::Bool => out(dst, &mut src.iter().map(|&b| if b != 0 { 1.0 } else { 0.0 })),
        DType::Uint8 => out(dst, &mut src.iter().map(|&b| f32::from(b))),
        DType::Uint16 => out(
            dst,
            &mut src
                .chunks_exact(2)
                .map(|b| f32::from(u16::from_ne_bytes([b[0], b[1]]))),
        ),
        DType::Int32 => out(
            dst,
            &mut src
                .chunks_exact(4)
                .map(|b| i32::from_ne_bytes([b[0], b[1], b[2], b[3]]) as f32),
        ),
        DType::Uint32 => out(
            dst,
            &mut src
                .chunks_exact(4)
                .map(|b| u32::from_ne_bytes([b[0], b[1], b[2], b[3]]) as f32),
        ),
        DType::Int64 => out(
            dst,
            &mut src.chunks_exact(8).map(|b| {
                i64::from_ne_bytes([b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7]]) as f32
            }),
        ),
        DType::Uint64 => out(
            dst,
            &mut src.chunks_exact(8).map(|b| {
                u64::from_ne_bytes([b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7]]) as f32
            }),
        ),
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn f32_bytes(v: &[f32]) -> Vec<u8> {
        v.iter().flat_map(|x| x.to_ne_bytes()).collect()
    }

    #[test]
    fn identity_cast_is_a_byte_copy() {
        for dtype in DType::ALL {
            let n = 5;
            let mut src: Vec<u8> = (0..n * dtype.size_of()).map(|i| i as u8 ^ 0xA5).collect();
            let mut dst = vec![0u8; src.len()];
            cast_in(&mut src, dtype, &mut dst, dtype, n, &CastOptions::default()).unwrap();
            assert_eq!(dst, src, "{dtype}");

            let mut out = vec![0u8; src.len()];
            cast_out(&src, dtype, &mut out, dtype, n, QuantMode::NoQuant, QuantParams::default())
                .unwrap();
            assert_eq!(out, src, "{dtype}");
        }
    }

    #[test]
    fn zero_count_is_a_noop() {
        let mut src: Vec<u8> = Vec::new();
        let mut dst: Vec<u8> = Vec::new();
        // even an unsupported pairing is fine when there is nothing to cast
        cast_in(&mut src, DType::Double, &mut dst, DType::Int8, 0, &CastOptions::default())
            .unwrap();
    }

    #[test]
    fn unsupported_pairs_are_fatal() {
        let mut src = vec![0u8; 8];
        let mut dst = vec![0u8; 8];
        let err = cast_in(&mut src, DType::Double, &mut dst, DType::Int32, 1, &CastOptions::default())
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<ContractError>(),
            Some(ContractError::UnsupportedCast {
                src: DType::Double,
                dst: DType::Int32
            })
        ));

        let err = cast_out(&src, DType::Int8, &mut dst, DType::Double, 1, QuantMode::NoQuant, QuantParams::default())
            .unwrap_err();
        assert!(err.downcast_ref::<ContractError>().is_some());
    }

    #[test]
    fn no_quant_mode_pins_default_params() {
        let mut src = f32_bytes(&[1.4, -2.6, 300.0]);
        let mut dst = vec![0u8; 3];
        let params = cast_in(
            &mut src,
            DType::Float,
            &mut dst,
            DType::Int8,
            3,
            &CastOptions {
                mode: QuantMode::NoQuant,
                params: Some(QuantParams { position: 3, scale: 0.5, offset: 2 }),
                dequantify: true,
            },
        )
        .unwrap();
        assert_eq!(params, QuantParams::default());
        assert_eq!(dst.iter().map(|&b| b as i8).collect::<Vec<_>>(), vec![1, -3, 127]);
        assert_eq!(decode_f32(&src), vec![1.0, -3.0, 127.0]);
    }

    #[test]
    fn software_mode_returns_fitted_params() {
        let values = [0.5f32, -3.0, 2.25, 7.9];
        let mut src = f32_bytes(&values);
        let mut dst = vec![0u8; 8];
        let opts = CastOptions {
            mode: QuantMode::Software,
            params: None,
            dequantify: false,
        };
        let params = cast_in(&mut src, DType::Float, &mut dst, DType::Int16, 4, &opts).unwrap();
        assert_eq!(params, fit_params(&values, DType::Int16).unwrap());
        assert!(params.scale > 0.5 && params.scale <= 1.0);
        // source untouched without dequantify
        assert_eq!(decode_f32(&src), values.to_vec());

        let mut back = vec![0u8; 16];
        cast_out(&dst, DType::Int16, &mut back, DType::Float, 4, QuantMode::Software, params).unwrap();
        for (b, v) in decode_f32(&back).iter().zip(values) {
            assert!((f64::from(*b) - f64::from(v)).abs() <= params.step() / 2.0 + 1e-6);
        }
    }

    #[test]
    fn half_and_bool_conversions() {
        let mut src = f32_bytes(&[0.0, 1.5, -2.0]);
        let mut dst = vec![0u8; 3];
        cast_in(&mut src, DType::Float, &mut dst, DType::Bool, 3, &CastOptions::default()).unwrap();
        assert_eq!(dst, vec![0, 1, 1]);

        let mut half = vec![0u8; 6];
        cast_in(&mut src, DType::Float, &mut half, DType::Half, 3, &CastOptions::default()).unwrap();
        let mut back = vec![0u8; 12];
        cast_out(&half, DType::Half, &mut back, DType::Float, 3, QuantMode::NoQuant, QuantParams::default())
            .unwrap();
        assert_eq!(decode_f32(&back), vec![0.0, 1.5, -2.0]);
    }

    #[test]
    fn dequantify_aligns_reference_with_half_rounding() {
        let v = 0.1f32;
        let mut src = f32_bytes(&[v]);
        let mut dst = vec![0u8; 2];
        let opts = CastOptions {
            dequantify: true,
            ..CastOptions::default()
        };
        cast_in(&mut src, DType::Float, &mut dst, DType::Half, 1, &opts).unwrap();
        assert_eq!(decode_f32(&src), vec![f16::from_f32(v).to_f32()]);
    }

    #[test]
    fn complex_half_round_trip_is_component_wise() {
        let mut src = f32_bytes(&[1.0, -0.5, 2.0, 4.0]);
        let mut dst = vec![0u8; 8];
        cast_in(&mut src, DType::ComplexFloat, &mut dst, DType::ComplexHalf, 2, &CastOptions::default())
            .unwrap();
        let mut back = vec![0u8; 16];
        cast_out(&dst, DType::ComplexHalf, &mut back, DType::ComplexFloat, 2, QuantMode::NoQuant, QuantParams::default())
            .unwrap();
        assert_eq!(decode_f32(&back), vec![1.0, -0.5, 2.0, 4.0]);
    }

    #[test]
    fn integer_outputs_widen_to_float() {
        let src: Vec<u8> = [-7i32, 42].iter().flat_map(|v| v.to_ne_bytes()).collect();
        let mut dst = vec![0u8; 8];
        cast_out(&src, DType::Int32, &mut dst, DType::Float, 2, QuantMode::NoQuant, QuantParams::default())
            .unwrap();
        assert_eq!(decode_f32(&dst), vec![-7.0, 42.0]);
    }

    #[test]
    fn half_round_trip_in_place() {
        let mut buf = f32_bytes(&[1.0 / 3.0]);
        round_trip_half(&mut buf);
        assert_eq!(decode_f32(&buf), vec![f16::from_f32(1.0 / 3.0).to_f32()]);
    }
}
