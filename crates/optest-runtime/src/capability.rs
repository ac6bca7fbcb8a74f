use anyhow::{Context, Result};
use optest_core::{DeviceRuntime, KernelClass};
use tracing::{debug, warn};

pub const JOB_LIMIT_ENV: &str = "MLUOP_SET_JOB_LIMIT_CAPABILITY";
pub const CLUSTER_LIMIT_ENV: &str = "MLUOP_SET_CLUSTER_LIMIT_CAPABILITY";

pub const DEFAULT_KERNEL_CLASS: KernelClass = KernelClass::Union4;
/// Four visible clusters.
pub const DEFAULT_CLUSTER_MASK: u32 = 15;
/// Masks for one through eight visible clusters.
pub const CLUSTER_MASKS: [u32; 8] = [1, 3, 7, 15, 31, 63, 127, 255];

/// Job-limit and cluster-visibility overrides, resolved once per case.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CapabilityConfig {
    pub job_limit: Option<KernelClass>,
    pub cluster_limit: Option<u32>,
}

impl CapabilityConfig {
    pub fn from_env() -> Self {
        let job = std::env::var(JOB_LIMIT_ENV).ok();
        let cluster = std::env::var(CLUSTER_LIMIT_ENV).ok();
        Self::from_values(job.as_deref(), cluster.as_deref())
    }

    /// Unrecognized values fall back to the defaults with a warning.
    pub fn from_values(job: Option<&str>, cluster: Option<&str>) -> Self {
        Self {
            job_limit: job.map(parse_job_limit),
            cluster_limit: cluster.map(parse_cluster_limit),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.job_limit.is_none() && self.cluster_limit.is_none()
    }

    pub fn apply(&self, runtime: &dyn DeviceRuntime) -> Result<()> {
        if let Some(class) = self.job_limit {
            debug!(before = ?runtime.handle().job_limit, "set job limit");
            runtime
                .set_job_limit(class)
                .context("setting job limit capability")?;
            debug!(after = ?runtime.handle().job_limit, "job limit set");
        }
        if let Some(mask) = self.cluster_limit {
            debug!(before = runtime.handle().cluster_limit, "set cluster limit");
            runtime
                .set_cluster_limit(mask)
                .context("setting cluster limit capability")?;
            debug!(after = runtime.handle().cluster_limit, "cluster limit set");
        }
        Ok(())
    }
}

fn parse_job_limit(raw: &str) -> KernelClass {
    match raw.trim().parse::<u32>().unwrap_or(0) {
        1 => KernelClass::Union1,
        2 => KernelClass::Union2,
        3 => KernelClass::Union4,
        4 => KernelClass::Union8,
        5 => KernelClass::Union16,
        6 => KernelClass::Block,
        7 => KernelClass::None,
        _ => {
            warn!(value = raw, "unsupported job limit, using {:?}", DEFAULT_KERNEL_CLASS);
            DEFAULT_KERNEL_CLASS
        }
    }
}

fn parse_cluster_limit(raw: &str) -> u32 {
    match raw.trim().parse::<u32>() {
        Ok(mask) if CLUSTER_MASKS.contains(&mask) => mask,
        _ => {
            warn!(value = raw, "unsupported cluster limit, using 4 clusters");
            DEFAULT_CLUSTER_MASK
        }
    }
}
