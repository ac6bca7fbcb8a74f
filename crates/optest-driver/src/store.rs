//! Performance baselines persisted as a JSON map from case id to record.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use optest_core::{BaselineStore, EvaluateResult, PerfRecord};
use optest_runtime::case_id_from_path;
use tracing::{debug, info};

#[derive(Debug, Default)]
pub struct JsonBaselineStore {
    path: Option<PathBuf>,
    records: BTreeMap<String, PerfRecord>,
}

impl JsonBaselineStore {
    /// Read `path`; a missing file is an empty store that will be created
    /// on [`save`](Self::save).
    pub fn load(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let records = if path.exists() {
            let raw = std::fs::read_to_string(&path)
                .with_context(|| format!("reading baseline {}", path.display()))?;
            serde_json::from_str(&raw)
                .with_context(|| format!("parsing baseline {}", path.display()))?
        } else {
            debug!(path = %path.display(), "no baseline file yet");
            BTreeMap::new()
        };
        Ok(Self {
            path: Some(path),
            records,
        })
    }

    pub fn insert(&mut self, case_id: impl Into<String>, record: PerfRecord) {
        self.records.insert(case_id.into(), record);
    }

    /// Record a passing result as the new baseline of its case. Failing
    /// results leave the store untouched.
    pub fn update_from(&mut self, result: &EvaluateResult) -> bool {
        if !result.is_passed {
            return false;
        }
        self.insert(
            case_id_from_path(&result.case_path),
            PerfRecord {
                hardware_time: result.perf.hardware_time,
                workspace_size: result.perf.workspace_size,
            },
        );
        true
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn save(&self) -> Result<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let raw = serde_json::to_string_pretty(&self.records)?;
        std::fs::write(path, raw).with_context(|| format!("writing baseline {}", path.display()))?;
        info!(path = %path.display(), cases = self.records.len(), "baseline saved");
        Ok(())
    }
}

impl BaselineStore for JsonBaselineStore {
    fn lookup(&self, case_id: &str) -> Option<PerfRecord> {
        self.records.get(case_id).copied()
    }
}
