use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use optest_core::{BaselineStore, CaseSource, EvaluateResult};
use optest_runtime::{ExecuteConfig, ExecutionContext, Executor};
use tracing::{error, info, info_span};

use crate::case::JsonCase;
use crate::evaluator::DiffEvaluator;
use crate::registry::OpRegistry;

/// Run one case file end to end. Every buffer of the case is released
/// before returning, whatever the outcome.
pub fn run_case(
    path: &Path,
    registry: &OpRegistry,
    ctx: &Arc<ExecutionContext>,
    config: &ExecuteConfig,
    baseline: Option<&dyn BaselineStore>,
) -> Result<EvaluateResult> {
    let case = JsonCase::load(path)?;
    let op = registry
        .create(case.op_name())
        .with_context(|| format!("no operator named `{}`", case.op_name()))?;

    let mut executor = Executor::new(op, config.clone());
    executor.init(Arc::clone(ctx), Box::new(DiffEvaluator::new()))?;
    executor.run(path.display().to_string(), Box::new(case), baseline)
}

/// Run every case in order. A case that errors out is reported as a failed
/// result carrying the error chain.
pub fn run_cases(
    paths: &[impl AsRef<Path>],
    registry: &OpRegistry,
    ctx: &Arc<ExecutionContext>,
    config: &ExecuteConfig,
    baseline: Option<&dyn BaselineStore>,
) -> Vec<EvaluateResult> {
    paths
        .iter()
        .map(|path| {
            let path = path.as_ref();
            let _span = info_span!("case", path = %path.display()).entered();
            match run_case(path, registry, ctx, config, baseline) {
                Ok(result) => {
                    info!(passed = result.is_passed, "case finished");
                    result
                }
                Err(err) => {
                    error!(error = %format!("{err:#}"), "case aborted");
                    EvaluateResult {
                        case_path: path.display().to_string(),
                        is_passed: false,
                        what: vec![format!("{err:#}")],
                        ..EvaluateResult::default()
                    }
                }
            }
        })
        .collect()
}
