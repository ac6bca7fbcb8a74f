//! Numeric encoding of values into typed host bytes and back.

use anyhow::{bail, Result};
use half::f16;
use optest_core::{DType, HostBuffer};

/// Scalars per element: two for complex dtypes.
pub fn lanes(dtype: DType) -> usize {
    if dtype.is_complex() {
        2
    } else {
        1
    }
}

/// Encode `values` as `dtype`. Complex dtypes take interleaved (re, im)
/// pairs, so `values.len()` must be a multiple of [`lanes`].
pub fn encode(values: &[f64], dtype: DType) -> Result<HostBuffer> {
    let lanes = lanes(dtype);
    if values.len() % lanes != 0 {
        bail!("{} values cannot form whole {dtype} elements", values.len());
    }
    let mut out = Vec::with_capacity(values.len() / lanes * dtype.size_of());
    for &v in values {
        match dtype {
            DType::Half | DType::ComplexHalf => out.extend(f16::from_f64(v).to_ne_bytes()),
            DType::Float | DType::ComplexFloat => out.extend((v as f32).to_ne_bytes()),
            DType::Double => out.extend(v.to_ne_bytes()),
            DType::Int8 => out.extend((v as i8).to_ne_bytes()),
            DType::Int16 => out.extend((v as i16).to_ne_bytes()),
            DType::Int32 => out.extend((v as i32).to_ne_bytes()),
            DType::Int64 => out.extend((v as i64).to_ne_bytes()),
            DType::Uint8 => out.extend((v as u8).to_ne_bytes()),
            DType::Uint16 => out.extend((v as u16).to_ne_bytes()),
            DType::Uint32 => out.extend((v as u32).to_ne_bytes()),
            DType::Uint64 => out.extend((v as u64).to_ne_bytes()),
            DType::Bool => out.push(u8::from(v != 0.0)),
        }
    }
    Ok(HostBuffer::from_bytes(dtype, &out))
}

/// Every scalar of `bytes` read as `dtype`, widened to f64.
pub fn decode(bytes: &[u8], dtype: DType) -> Vec<f64> {
    let width = dtype.size_of() / lanes(dtype);
    bytes
        .chunks_exact(width)
        .map(|b| match dtype {
            DType::Half | DType::ComplexHalf => f16::from_ne_bytes([b[0], b[1]]).to_f64(),
            DType::Float | DType::ComplexFloat => {
                f64::from(f32::from_ne_bytes([b[0], b[1], b[2], b[3]]))
            }
            DType::Double => f64::from_ne_bytes([b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7]]),
            DType::Int8 => f64::from(b[0] as i8),
            DType::Int16 => f64::from(i16::from_ne_bytes([b[0], b[1]])),
            DType::Int32 => f64::from(i32::from_ne_bytes([b[0], b[1], b[2], b[3]])),
            DType::Int64 => {
                i64::from_ne_bytes([b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7]]) as f64
            }
            DType::Uint8 => f64::from(b[0]),
            DType::Uint16 => f64::from(u16::from_ne_bytes([b[0], b[1]])),
            DType::Uint32 => f64::from(u32::from_ne_bytes([b[0], b[1], b[2], b[3]])),
            DType::Uint64 => {
                u64::from_ne_bytes([b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7]]) as f64
            }
            DType::Bool => f64::from(u8::from(b[0] != 0)),
        })
        .collect()
}
