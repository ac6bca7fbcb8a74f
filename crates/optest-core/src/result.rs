use serde::{Deserialize, Serialize};

use crate::ErrorRecord;

/// Persisted performance baseline of one case.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct PerfRecord {
    /// Hardware time in microseconds.
    pub hardware_time: f64,
    /// Workspace size in bytes.
    pub workspace_size: f64,
}

/// Keyed read-only access to recorded baselines.
pub trait BaselineStore {
    fn lookup(&self, case_id: &str) -> Option<PerfRecord>;
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PerfInfo {
    pub interface_time: f64,
    pub hardware_time: f64,
    pub hardware_time_base: f64,
    pub h2d_time: f64,
    pub d2h_time: f64,
    pub compute_force: f64,
    pub theory_ops: i64,
    pub compute_efficiency: f64,
    pub io_bandwidth: f64,
    pub theory_io: i64,
    pub io_efficiency: f64,
    pub workspace_size: f64,
}

impl Default for PerfInfo {
    fn default() -> Self {
        Self {
            interface_time: -1.0,
            hardware_time: 0.0,
            hardware_time_base: 0.0,
            h2d_time: 0.0,
            d2h_time: 0.0,
            compute_force: -1.0,
            theory_ops: 0,
            compute_efficiency: -1.0,
            io_bandwidth: -1.0,
            theory_io: 0,
            io_efficiency: -1.0,
            workspace_size: 0.0,
        }
    }
}

/// Outcome of one case.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct EvaluateResult {
    pub case_path: String,
    pub op_name: String,
    pub errors: Vec<ErrorRecord>,
    pub is_passed: bool,
    pub what: Vec<String>,
    pub perf: PerfInfo,
}
