//! Relative-error metrics between reference and device outputs.

use optest_core::{CriterionSpec, DType, ErrorEvaluator, ErrorFunc, ErrorRecord, HostBuffer};
use tracing::{debug, warn};

use crate::codec;

/// Points whose reference magnitude is below this are compared absolutely.
const RELATIVE_FLOOR: f64 = 1e-10;

#[derive(Default)]
pub struct DiffEvaluator {
    records: Vec<ErrorRecord>,
    what: Vec<String>,
}

impl DiffEvaluator {
    pub fn new() -> Self {
        Self::default()
    }
}

/// Scalar pairs to compare. With `skip_nan_inf` every position where either
/// side is not finite is dropped. Otherwise matching non-finite values
/// (same NaN-ness, same infinity) count as equal and any other non-finite
/// position makes the whole comparison infinitely wrong.
fn paired(base: &[f64], dev: &[f64], skip_nan_inf: bool) -> Result<Vec<(f64, f64)>, (f64, f64)> {
    let mut pairs = Vec::with_capacity(base.len());
    for (&b, &d) in base.iter().zip(dev) {
        if b.is_finite() && d.is_finite() {
            pairs.push((b, d));
            continue;
        }
        if skip_nan_inf {
            continue;
        }
        let same = (b.is_nan() && d.is_nan()) || b == d;
        if !same {
            return Err((b, d));
        }
    }
    Ok(pairs)
}

fn diff1(pairs: &[(f64, f64)]) -> f64 {
    let num: f64 = pairs.iter().map(|(b, d)| (b - d).abs()).sum();
    let den: f64 = pairs.iter().map(|(b, _)| b.abs()).sum();
    ratio(num, den)
}

fn diff2(pairs: &[(f64, f64)]) -> f64 {
    let num: f64 = pairs.iter().map(|(b, d)| (b - d) * (b - d)).sum();
    let den: f64 = pairs.iter().map(|(b, _)| b * b).sum();
    ratio(num, den).sqrt()
}

fn diff3(pairs: &[(f64, f64)]) -> f64 {
    pairs
        .iter()
        .map(|(b, d)| {
            let err = (b - d).abs();
            if b.abs() < RELATIVE_FLOOR {
                err
            } else {
                err / b.abs()
            }
        })
        .fold(0.0, f64::max)
}

fn diff3_2(pairs: &[(f64, f64)]) -> f64 {
    pairs.iter().map(|(b, d)| (b - d).abs()).fold(0.0, f64::max)
}

/// `num / den`, falling back to the absolute numerator for an all-zero
/// reference.
fn ratio(num: f64, den: f64) -> f64 {
    if den < RELATIVE_FLOOR {
        num
    } else {
        num / den
    }
}

impl ErrorEvaluator for DiffEvaluator {
    fn compute_error(
        &mut self,
        baseline: &HostBuffer,
        device: &HostBuffer,
        count: usize,
        criterion: &CriterionSpec,
        name: &str,
        dtype: DType,
        skip_nan_inf: bool,
    ) {
        let scalars = count * codec::lanes(dtype);
        let base = baseline.to_f64_vec();
        let dev = device.to_f64_vec();
        let n = scalars.min(base.len()).min(dev.len());
        if n < scalars {
            warn!(tensor = name, expected = scalars, actual = n, "comparison buffers are short");
        }

        let value = match criterion.func {
            ErrorFunc::Diff4 => {
                if criterion.enabled {
                    self.what.push(format!(
                        "{name}: {:?} is not computed by this evaluator",
                        criterion.func
                    ));
                }
                f64::NAN
            }
            func => match paired(&base[..n], &dev[..n], skip_nan_inf) {
                Ok(pairs) => match func {
                    ErrorFunc::Diff1 => diff1(&pairs),
                    ErrorFunc::Diff2 => diff2(&pairs),
                    ErrorFunc::Diff3 => diff3(&pairs),
                    _ => diff3_2(&pairs),
                },
                Err((b, d)) => {
                    debug!(tensor = name, baseline = b, device = d, "non-finite mismatch");
                    f64::INFINITY
                }
            },
        };

        let passed = if criterion.func == ErrorFunc::Diff4 {
            !criterion.enabled
        } else {
            !criterion.enabled || value <= criterion.threshold
        };
        if !passed && criterion.func != ErrorFunc::Diff4 {
            self.what.push(format!(
                "{name}: {:?} = {value:e} exceeds threshold {:e}",
                criterion.func, criterion.threshold
            ));
        }
        debug!(tensor = name, func = ?criterion.func, value, passed, "error computed");
        self.records.push(ErrorRecord {
            tensor: name.to_string(),
            func: criterion.func,
            value,
            threshold: criterion.threshold,
            passed,
        });
    }

    fn errors(&self) -> Vec<ErrorRecord> {
        self.records.clone()
    }

    fn is_passed(&self) -> bool {
        self.records.iter().all(|r| r.passed)
    }

    fn what(&self) -> Vec<String> {
        self.what.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn eval(base: &[f32], dev: &[f32], func: ErrorFunc, skip: bool) -> ErrorRecord {
        let mut e = DiffEvaluator::new();
        e.compute_error(
            &HostBuffer::from_f32(base),
            &HostBuffer::from_f32(dev),
            base.len(),
            &CriterionSpec::new(func, 0.01),
            "y",
            DType::Float,
            skip,
        );
        e.errors().remove(0)
    }

    #[test]
    fn metrics_on_a_known_pair() {
        let base = [1.0, -2.0, 4.0, 0.0];
        let dev = [1.0, -2.0, 3.0, 0.5];
        assert!((eval(&base, &dev, ErrorFunc::Diff1, false).value - 1.5 / 7.0).abs() < 1e-9);
        assert!((eval(&base, &dev, ErrorFunc::Diff2, false).value - (1.25f64 / 21.0).sqrt()).abs() < 1e-9);
        // 0.5 against a zero reference is taken absolutely
        assert_eq!(eval(&base, &dev, ErrorFunc::Diff3, false).value, 0.5);
        assert_eq!(eval(&base, &dev, ErrorFunc::Diff3_2, false).value, 1.0);
    }

    #[test]
    fn non_finite_handling() {
        let base = [1.0, f32::NAN, f32::INFINITY];
        assert!(eval(&base, &[1.0, f32::NAN, f32::INFINITY], ErrorFunc::Diff1, false).passed);
        assert!(!eval(&base, &[1.0, 0.0, f32::INFINITY], ErrorFunc::Diff1, false).passed);
        assert!(eval(&base, &[1.0, 0.0, 7.0], ErrorFunc::Diff1, true).passed);
    }

    #[test]
    fn complex_outputs_compare_both_lanes() {
        let mut e = DiffEvaluator::new();
        let base = HostBuffer::from_bytes(
            DType::ComplexFloat,
            &[1f32, 1.0].iter().flat_map(|v| v.to_ne_bytes()).collect::<Vec<_>>(),
        );
        let dev = HostBuffer::from_bytes(
            DType::ComplexFloat,
            &[1f32, 0.0].iter().flat_map(|v| v.to_ne_bytes()).collect::<Vec<_>>(),
        );
        e.compute_error(&base, &dev, 1, &CriterionSpec::new(ErrorFunc::Diff3_2, 0.5), "z", DType::ComplexHalf, false);
        assert!(!e.is_passed());
        assert_eq!(e.what().len(), 1);
    }

    #[test]
    fn diff4_is_reported_not_computed() {
        let rec = eval(&[1.0], &[1.0], ErrorFunc::Diff4, false);
        assert!(!rec.passed);
        assert!(rec.value.is_nan());
    }
}
