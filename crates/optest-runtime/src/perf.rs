//! Derived performance metrics: peak compute, IO bandwidth, efficiencies.

use anyhow::Result;
use optest_core::{Arch, ContractError, DType, DeviceHandle, TensorDescriptor};
use tracing::{debug, warn};

// vector unit, ops per cycle per core
const CT_PEAK_FLOAT16: f64 = 64.0;
const CT_PEAK_FLOAT32: f64 = 32.0;

// matrix unit, ops per cycle per core
const LT_PEAK_INT8_INT8_220: f64 = 1024.0;
const LT_PEAK_INT16_INT8_220: f64 = 512.0;
const LT_PEAK_INT16_INT16_220: f64 = 256.0;
const LT_PEAK_INT8_INT8_270_290: f64 = 2048.0;
const LT_PEAK_INT16_INT8_270_290: f64 = 1024.0;
const LT_PEAK_INT16_INT16_270_290: f64 = 512.0;
const LT_PEAK_FP16_FP16: f64 = 1024.0;
const LT_PEAK_FP32_FP16: f64 = 512.0;
const LT_PEAK_FP32_FP32: f64 = 256.0;

const CLOCK_HZ: f64 = 1e9;

/// Device IO bandwidth in GB/s, or `-1` for an unknown architecture.
pub fn io_bandwidth(arch: Arch) -> f64 {
    let bw = match arch {
        Arch::Mlu220 => 25.6,
        Arch::Mlu270 => 102.4,
        Arch::Mlu290 => 1024.0,
        Arch::Mlu370 => 307.2,
        other => {
            warn!(arch = ?other, "unsupported arch for io bandwidth");
            -1.0
        }
    };
    debug!(bw, "io bandwidth (GB/s)");
    bw
}

/// Peak compute force in op/s, or `-1` when the dtype/arch pair has no entry.
pub fn peak_compute_force(
    handle: &DeviceHandle,
    inputs: &[TensorDescriptor],
    matrix_unit: bool,
) -> Result<f64> {
    let units = f64::from(handle.cluster_capability()) * f64::from(handle.core_num_per_cluster);
    let per_cycle = if matrix_unit {
        matrix_peak(handle.arch, inputs)?
    } else {
        vector_peak(inputs)?
    };
    if per_cycle < 0.0 {
        return Ok(-1.0);
    }
    Ok(per_cycle * units * CLOCK_HZ)
}

fn vector_peak(inputs: &[TensorDescriptor]) -> Result<f64> {
    let first = inputs.first().ok_or(ContractError::CountMismatch {
        what: "inputs for vector peak compute",
        expected: 1,
        actual: 0,
    })?;
    Ok(match first.dtype {
        DType::Half | DType::Int16 => CT_PEAK_FLOAT16,
        _ => CT_PEAK_FLOAT32,
    })
}

fn matrix_peak(arch: Arch, inputs: &[TensorDescriptor]) -> Result<f64> {
    if inputs.len() < 2 {
        return Err(ContractError::CountMismatch {
            what: "inputs for matrix peak compute",
            expected: 2,
            actual: inputs.len(),
        }
        .into());
    }
    let effective = |t: &TensorDescriptor| t.onchip_dtype.unwrap_or(t.dtype);
    let pair = (effective(&inputs[0]), effective(&inputs[1]));

    use DType::{Float, Half, Int16, Int8};
    let peak = match arch {
        Arch::Mlu220 => match pair {
            (Int8, Int8) => Some(LT_PEAK_INT8_INT8_220),
            (Int8, Int16) | (Int16, Int8) => Some(LT_PEAK_INT16_INT8_220),
            (Int16, Int16) => Some(LT_PEAK_INT16_INT16_220),
            _ => None,
        },
        Arch::Mlu270 | Arch::Mlu290 => match pair {
            (Int8, Int8) => Some(LT_PEAK_INT8_INT8_270_290),
            (Int8, Int16) | (Int16, Int8) => Some(LT_PEAK_INT16_INT8_270_290),
            (Int16, Int16) => Some(LT_PEAK_INT16_INT16_270_290),
            _ => None,
        },
        _ => match pair {
            (Half, Half) => Some(LT_PEAK_FP16_FP16),
            (Float, Half) | (Half, Float) => Some(LT_PEAK_FP32_FP16),
            (Float, Float) => Some(LT_PEAK_FP32_FP32),
            _ => None,
        },
    };
    Ok(peak.unwrap_or_else(|| {
        warn!(?arch, ?pair, "unsupported arch/dtype pair for peak compute force");
        -1.0
    }))
}

/// Fraction of `peak` (work per second) achieved doing `work` in `time_us`.
/// `-1` when time or peak is not positive.
pub fn efficiency(work: f64, time_us: f64, peak: f64) -> f64 {
    if time_us <= 0.0 || peak <= 0.0 {
        return -1.0;
    }
    work / (time_us * 1e-6 * peak)
}

pub fn compute_efficiency(theory_ops: i64, hardware_time_us: f64, peak_ops: f64) -> f64 {
    efficiency(theory_ops as f64, hardware_time_us, peak_ops)
}

/// `bandwidth_gbs` is in GB/s, `theory_io` in bytes.
pub fn io_efficiency(theory_io: i64, hardware_time_us: f64, bandwidth_gbs: f64) -> f64 {
    efficiency(theory_io as f64, hardware_time_us, bandwidth_gbs * 1e9)
}

#[cfg(test)]
mod tests {
    use super::*;
    use optest_core::{KernelClass, TensorRole};

    fn handle(arch: Arch) -> DeviceHandle {
        DeviceHandle {
            arch,
            cluster_num: 8,
            core_num_per_cluster: 4,
            job_limit: KernelClass::Union4,
            cluster_limit: 3,
        }
    }

    fn input(dtype: DType) -> TensorDescriptor {
        TensorDescriptor::new("x", TensorRole::Input, dtype, &[4])
    }

    #[test]
    fn vector_peak_scales_with_visible_clusters() {
        let peak = peak_compute_force(&handle(Arch::Mlu370), &[input(DType::Half)], false).unwrap();
        assert_eq!(peak, CT_PEAK_FLOAT16 * 2.0 * 4.0 * CLOCK_HZ);
    }

    #[test]
    fn matrix_peak_prefers_onchip_dtype() {
        let a = input(DType::Float).with_onchip_dtype(DType::Int8);
        let b = input(DType::Int8);
        let peak = peak_compute_force(&handle(Arch::Mlu270), &[a, b], true).unwrap();
        assert_eq!(peak, LT_PEAK_INT8_INT8_270_290 * 2.0 * 4.0 * CLOCK_HZ);
    }

    #[test]
    fn missing_inputs_are_fatal() {
        assert!(peak_compute_force(&handle(Arch::Mlu370), &[], false).is_err());
        assert!(peak_compute_force(&handle(Arch::Mlu370), &[input(DType::Half)], true).is_err());
    }

    #[test]
    fn unknown_arch_degrades_to_negative_one() {
        assert_eq!(io_bandwidth(Arch::Unknown), -1.0);
        assert_eq!(io_efficiency(1024, 10.0, -1.0), -1.0);
    }

    #[test]
    fn efficiency_is_work_over_capacity() {
        // 1e6 ops in 1000us against 2e9 op/s peak -> 0.5
        assert!((compute_efficiency(1_000_000, 1000.0, 2e9) - 0.5).abs() < 1e-12);
        assert_eq!(compute_efficiency(10, 0.0, 1e9), -1.0);
    }
}
