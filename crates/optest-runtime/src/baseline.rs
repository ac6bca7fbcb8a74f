//! Performance regression check against recorded baselines.

use std::collections::HashMap;
use std::path::Path;

use anyhow::Result;
use optest_core::{BaselineStore, ContractError, EvaluateResult, PerfRecord};
use tracing::{error, info};

/// Tolerance bands for hardware time. Each gate is independent and all of
/// them must pass.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct BaselineThresholds {
    /// Allowed slowdown in microseconds.
    pub absolute_us: f64,
    /// Allowed slowdown as a fraction of the baseline time.
    pub relative: f64,
    /// Upper bound on `measured / baseline`.
    pub scale_bound: f64,
}

impl Default for BaselineThresholds {
    fn default() -> Self {
        Self {
            absolute_us: 50.0,
            relative: 0.1,
            scale_bound: 2.0,
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct BaselineVerdict {
    pub passed: bool,
    /// Whether a record existed for the case.
    pub found: bool,
    pub hardware_time_base: f64,
    /// Measured workspace, clamped to the baseline on regression.
    pub workspace_size: f64,
    pub reasons: Vec<String>,
}

/// Compare a measurement with the record for `case_id`. A case without a
/// record passes and becomes its own baseline.
pub fn check_baseline(
    store: &dyn BaselineStore,
    case_id: &str,
    hardware_time: f64,
    workspace_size: f64,
    thresholds: &BaselineThresholds,
) -> BaselineVerdict {
    let Some(record) = store.lookup(case_id) else {
        info!(case_id, "case is new and has no baseline data");
        return BaselineVerdict {
            passed: true,
            found: false,
            hardware_time_base: hardware_time,
            workspace_size,
            reasons: Vec::new(),
        };
    };
    info!(
        case_id,
        hardware_time_us = record.hardware_time,
        workspace_bytes = record.workspace_size,
        "baseline found"
    );

    let mut reasons = time_gates(record, hardware_time, thresholds);
    if !reasons.is_empty() {
        error!(
            base_us = record.hardware_time,
            measured_us = hardware_time,
            ?thresholds,
            "hardware time exceeds baseline"
        );
    }

    let mut reported_workspace = workspace_size;
    if workspace_size > record.workspace_size {
        error!(
            base_bytes = record.workspace_size,
            measured_bytes = workspace_size,
            "workspace size exceeds baseline"
        );
        reasons.push(format!(
            "workspace size {workspace_size} bytes exceeds baseline {} bytes",
            record.workspace_size
        ));
        reported_workspace = record.workspace_size;
    }

    BaselineVerdict {
        passed: reasons.is_empty(),
        found: true,
        hardware_time_base: record.hardware_time,
        workspace_size: reported_workspace,
        reasons,
    }
}

fn time_gates(record: PerfRecord, measured: f64, t: &BaselineThresholds) -> Vec<String> {
    let base = record.hardware_time;
    let slowdown = measured - base;
    let mut reasons = Vec::new();
    if slowdown > t.absolute_us {
        reasons.push(format!(
            "hardware time {measured:.3}us is {slowdown:.3}us over baseline {base:.3}us (absolute limit {}us)",
            t.absolute_us
        ));
    }
    if base > 0.0 {
        let relative = slowdown / base;
        if relative > t.relative {
            reasons.push(format!(
                "hardware time {measured:.3}us is {:.2}% over baseline {base:.3}us (relative limit {:.2}%)",
                relative * 100.0,
                t.relative * 100.0
            ));
        }
        let ratio = measured / base;
        if ratio > t.scale_bound {
            reasons.push(format!(
                "hardware time {measured:.3}us is {ratio:.2}x baseline {base:.3}us (scale bound {}x)",
                t.scale_bound
            ));
        }
    }
    reasons
}

/// Fold the baseline verdict into `result`. The overall verdict becomes the
/// AND of correctness and baseline.
pub fn apply_baseline(
    result: &mut EvaluateResult,
    store: &dyn BaselineStore,
    thresholds: &BaselineThresholds,
) -> Result<BaselineVerdict> {
    if result.op_name.is_empty() {
        return Err(ContractError::MissingOpName("performance baseline lookup").into());
    }
    let case_id = case_id_from_path(&result.case_path);
    let verdict = check_baseline(
        store,
        &case_id,
        result.perf.hardware_time,
        result.perf.workspace_size,
        thresholds,
    );
    result.perf.hardware_time_base = verdict.hardware_time_base;
    result.perf.workspace_size = verdict.workspace_size;
    if !verdict.passed {
        result.what.push(format!(
            "The performance result exceeds the baseline threshold: {}",
            verdict.reasons.join("; ")
        ));
    }
    result.is_passed = result.is_passed && verdict.passed;
    Ok(verdict)
}

/// `dir/op/case_3.json` -> `op/case_3`.
pub fn case_id_from_path(path: impl AsRef<Path>) -> String {
    let path = path.as_ref();
    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    match path
        .parent()
        .and_then(Path::file_name)
        .map(|p| p.to_string_lossy())
    {
        Some(parent) if !parent.is_empty() => format!("{parent}/{stem}"),
        _ => stem,
    }
}

/// Baselines held in memory.
#[derive(Clone, Debug, Default)]
pub struct MemoryBaselineStore {
    records: HashMap<String, PerfRecord>,
}

impl MemoryBaselineStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, case_id: impl Into<String>, record: PerfRecord) {
        self.records.insert(case_id.into(), record);
    }
}

impl BaselineStore for MemoryBaselineStore {
    fn lookup(&self, case_id: &str) -> Option<PerfRecord> {
        self.records.get(case_id).copied()
    }
}

impl FromIterator<(String, PerfRecord)> for MemoryBaselineStore {
    fn from_iter<I: IntoIterator<Item = (String, PerfRecord)>>(iter: I) -> Self {
        Self {
            records: iter.into_iter().collect(),
        }
    }
}
