use anyhow::Result;
use optest_core::{ContractError, EvaluateResult, PerfInfo, PerfRecord};
use optest_runtime::{
    apply_baseline, case_id_from_path, check_baseline, BaselineThresholds, MemoryBaselineStore,
};

fn store(case_id: &str, hardware_time: f64, workspace_size: f64) -> MemoryBaselineStore {
    let mut store = MemoryBaselineStore::new();
    store.insert(
        case_id,
        PerfRecord {
            hardware_time,
            workspace_size,
        },
    );
    store
}

fn measured(path: &str, hardware_time: f64, workspace_size: f64) -> EvaluateResult {
    EvaluateResult {
        case_path: path.into(),
        op_name: "abs".into(),
        is_passed: true,
        perf: PerfInfo {
            hardware_time,
            workspace_size,
            ..PerfInfo::default()
        },
        ..EvaluateResult::default()
    }
}

#[test]
fn first_run_passes_and_becomes_its_own_baseline() {
    let empty = MemoryBaselineStore::new();
    let verdict = check_baseline(&empty, "abs/case_0", 123.5, 4096.0, &BaselineThresholds::default());
    assert!(verdict.passed);
    assert!(!verdict.found);
    assert_eq!(verdict.hardware_time_base, 123.5);
    assert_eq!(verdict.workspace_size, 4096.0);
}

#[test]
fn workspace_regression_fails_and_clamps() -> Result<()> {
    let store = store("abs/case_1", 100.0, 1000.0);
    let mut result = measured("cases/abs/case_1.json", 100.0, 1200.0);

    let verdict = apply_baseline(&mut result, &store, &BaselineThresholds::default())?;
    assert!(!verdict.passed);
    assert!(!result.is_passed);
    assert_eq!(result.perf.workspace_size, 1000.0);
    assert_eq!(result.perf.hardware_time_base, 100.0);
    assert_eq!(result.what.len(), 1);
    assert!(result.what[0].contains("exceeds the baseline threshold"));
    Ok(())
}

#[test]
fn every_time_gate_is_checked_independently() {
    let thresholds = BaselineThresholds {
        absolute_us: 10.0,
        relative: 0.5,
        scale_bound: 10.0,
    };
    // 20us slower: relative 20% is fine, absolute 10us is not
    let v = check_baseline(&store("c", 100.0, 0.0), "c", 120.0, 0.0, &thresholds);
    assert!(!v.passed);
    assert_eq!(v.reasons.len(), 1);
    assert!(v.reasons[0].contains("absolute"));

    // 8us slower on a 10us case: absolute fine, relative 80% is not
    let v = check_baseline(&store("c", 10.0, 0.0), "c", 18.0, 0.0, &thresholds);
    assert!(!v.passed);
    assert!(v.reasons[0].contains("relative"));

    // 5us slower on a 0.5us case trips relative and scale, 10.5us slower trips all three
    let v = check_baseline(&store("c", 0.5, 0.0), "c", 5.5, 0.0, &thresholds);
    assert_eq!(v.reasons.len(), 2);
    let v = check_baseline(&store("c", 0.5, 0.0), "c", 11.0, 0.0, &thresholds);
    assert_eq!(v.reasons.len(), 3);

    // faster than baseline always passes
    let v = check_baseline(&store("c", 100.0, 10.0), "c", 50.0, 5.0, &thresholds);
    assert!(v.passed);
    assert_eq!(v.workspace_size, 5.0);
}

#[test]
fn baseline_verdict_is_anded_with_correctness() -> Result<()> {
    let store = store("abs/case_2", 100.0, 1000.0);
    let mut result = measured("abs/case_2.pb", 100.0, 100.0);
    result.is_passed = false;
    let verdict = apply_baseline(&mut result, &store, &BaselineThresholds::default())?;
    assert!(verdict.passed);
    assert!(!result.is_passed);
    assert!(result.what.is_empty());
    Ok(())
}

#[test]
fn missing_operator_name_is_fatal() {
    let mut result = measured("abs/case_3.json", 1.0, 0.0);
    result.op_name.clear();
    let err = apply_baseline(&mut result, &MemoryBaselineStore::new(), &BaselineThresholds::default())
        .unwrap_err();
    assert!(matches!(
        err.downcast_ref::<ContractError>(),
        Some(ContractError::MissingOpName(_))
    ));
}

#[test]
fn case_id_uses_parent_directory_and_stem() {
    assert_eq!(case_id_from_path("foo/abs/case_3.json"), "abs/case_3");
    assert_eq!(case_id_from_path("/data/cases/add/case_10.prototxt"), "add/case_10");
    assert_eq!(case_id_from_path("case_1.json"), "case_1");
}
