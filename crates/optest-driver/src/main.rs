mod cli;

use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use cli::{Cli, Command};
use optest_backend_host::HostRuntime;
use optest_core::{BaselineStore, DeviceRuntime};
use optest_driver::{run_cases, JsonBaselineStore, OpRegistry};
use optest_runtime::{ExecuteConfig, ExecutionContext};
use tracing::info;
use tracing_subscriber::EnvFilter;

fn main() -> Result<ExitCode> {
    let cli = Cli::parse();
    let registry = OpRegistry::default();

    match cli.command {
        Command::Ops => {
            for name in registry.names() {
                println!("{name}");
            }
            Ok(ExitCode::SUCCESS)
        }
        Command::Run {
            cases,
            perf_repeat,
            mlu_only,
            zero_input,
            fixed_criterion,
            quant,
            baseline,
            update_baseline,
            log,
        } => {
            std::env::set_var("RUST_LOG", &log);
            tracing_subscriber::fmt()
                .with_env_filter(EnvFilter::from_default_env())
                .with_writer(std::io::stderr)
                .init();

            let mut store = baseline.map(JsonBaselineStore::load).transpose()?;
            let config = ExecuteConfig {
                perf_repeat: perf_repeat.max(1),
                mlu_only,
                zero_input,
                fixed_criterion,
                perf_baseline: store.is_some(),
                quant_mode: quant.into(),
                ..ExecuteConfig::default()
            };

            let runtime: Arc<dyn DeviceRuntime> = Arc::new(HostRuntime::new());
            info!(backend = runtime.name(), cases = cases.len(), "starting run");
            let ctx = Arc::new(ExecutionContext::new(runtime).context("creating execution context")?);

            let results = run_cases(
                &cases,
                &registry,
                &ctx,
                &config,
                store.as_ref().map(|s| s as &dyn BaselineStore),
            );
            println!("{}", serde_json::to_string_pretty(&results)?);

            let failed = results.iter().filter(|r| !r.is_passed).count();
            info!(total = results.len(), failed, "run finished");

            if update_baseline {
                if let Some(store) = store.as_mut() {
                    for result in &results {
                        store.update_from(result);
                    }
                    store.save()?;
                }
            }
            Ok(if failed == 0 {
                ExitCode::SUCCESS
            } else {
                ExitCode::FAILURE
            })
        }
    }
}
