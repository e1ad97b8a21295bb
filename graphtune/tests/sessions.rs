use graphtune::common::Aggregation;
use graphtune::engine::{KernelTuningEngine, SessionState, TuningOptions};
use graphtune::measure::{FailureKind, MeasureResult, MeasurementPipeline, PipelineError};
use graphtune::records::KernelLog;
use graphtune::space::{ConfigIdx, Configuration, Knob, KnobValue};
use graphtune::strategy::StrategyKind;
use graphtune::task::{Task, TaskDef};

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};

const STRATEGIES: [StrategyKind; 4] = [
    StrategyKind::ModelGuided,
    StrategyKind::Genetic,
    StrategyKind::Random,
    StrategyKind::Exhaustive,
];

/// Counts measurements per configuration and reports a cost that depends on the knob values.
#[derive(Default)]
struct CountingPipeline {
    calls: Mutex<HashMap<ConfigIdx, usize>>,
}

/// Alternates between success and timeout across all calls.
#[derive(Default)]
struct FlakyPipeline {
    calls: AtomicUsize,
}

impl MeasurementPipeline for CountingPipeline {
    fn measure_batch(
        &self,
        _task: &Task,
        configs: &[Configuration],
    ) -> Vec<Result<MeasureResult, PipelineError>> {
        let mut calls = self.calls.lock();
        configs
            .iter()
            .map(|c| {
                *calls.entry(c.index()).or_default() += 1;
                Ok(MeasureResult::success(synthetic_cost(c)))
            })
            .collect()
    }
}

impl MeasurementPipeline for FlakyPipeline {
    fn measure_batch(
        &self,
        _task: &Task,
        configs: &[Configuration],
    ) -> Vec<Result<MeasureResult, PipelineError>> {
        configs
            .iter()
            .map(|c| {
                if self.calls.fetch_add(1, Ordering::SeqCst) % 2 == 0 {
                    Ok(MeasureResult::success(synthetic_cost(c)))
                } else {
                    Ok(MeasureResult::failed(FailureKind::Timeout, "exceeded 10s"))
                }
            })
            .collect()
    }
}

fn synthetic_cost(config: &Configuration) -> f64 {
    let tile = match config.get("tile") {
        Some(KnobValue::Int(t)) => *t as f64,
        _ => 1.0,
    };
    let unroll = match config.get("unroll") {
        Some(KnobValue::Int(u)) => *u as f64,
        _ => 1.0,
    };
    (1e-3 / tile + 1e-5 * (unroll - 4.0).abs()).max(1e-6)
}

fn task() -> Task {
    Task::new(TaskDef {
        name: "conv".to_string(),
        op: "conv2d".to_string(),
        shapes: vec![vec![1, 64, 56, 56]],
        dtype: "float32".to_string(),
        target: Default::default(),
        knobs: vec![
            Knob::ints("tile", [1, 2, 4, 8, 16]),
            Knob::ints("unroll", [1, 2, 4, 8]),
        ],
        source: None,
    })
    .unwrap()
}

#[test]
fn test_resumed_sessions_never_remeasure() {
    for strategy in STRATEGIES {
        let log = KernelLog::open(None).unwrap();
        let pipeline = CountingPipeline::default();
        let options = TuningOptions {
            strategy,
            n_trial: 6,
            batch_size: 4,
            early_stopping: None,
            resume: true,
            ..TuningOptions::default()
        };
        let task = task();
        let mut last_state = SessionState::Idle;
        for _ in 0..5 {
            let report = KernelTuningEngine::new(&pipeline, &log, options.clone())
                .run_session(&task)
                .unwrap();
            last_state = report.state;
        }
        let calls = pipeline.calls.lock();
        assert!(
            calls.values().all(|&n| n == 1),
            "{strategy} re-measured: {calls:?}"
        );
        // Five sessions of six trials cover the 20 configurations.
        assert_eq!(calls.len(), 20, "{strategy}");
        assert_eq!(last_state, SessionState::Exhausted, "{strategy}");
        assert_eq!(log.load().unwrap().len(), 20);
    }
}

#[test]
fn test_flaky_pipeline_never_aborts_and_logs_every_call() {
    for strategy in STRATEGIES {
        let log = KernelLog::open(None).unwrap();
        let pipeline = FlakyPipeline::default();
        let report = KernelTuningEngine::new(
            &pipeline,
            &log,
            TuningOptions {
                strategy,
                n_trial: 13,
                batch_size: 4,
                early_stopping: Some(2),
                ..TuningOptions::default()
            },
        )
        .run_session(&task())
        .unwrap();
        assert!(
            matches!(
                report.state,
                SessionState::Converged | SessionState::Exhausted
            ),
            "{strategy} ended {}",
            report.state
        );
        let records = log.load().unwrap();
        assert_eq!(records.len(), pipeline.calls.load(Ordering::SeqCst));
        assert_eq!(records.len() as u64, report.measured);
        assert!(records
            .iter()
            .any(|r| r.result.failure() == Some(FailureKind::Timeout)));
        assert!(report.best.is_some());
    }
}

#[test]
fn test_exhaustive_measures_each_configuration_once() {
    let log = KernelLog::open(None).unwrap();
    let pipeline = CountingPipeline::default();
    let report = KernelTuningEngine::new(
        &pipeline,
        &log,
        TuningOptions {
            strategy: StrategyKind::Exhaustive,
            batch_size: 3,
            early_stopping: None,
            ..TuningOptions::default()
        },
    )
    .run_session(&task())
    .unwrap();
    assert_eq!(report.state, SessionState::Exhausted);
    assert_eq!(report.measured, 20);
    let calls = pipeline.calls.lock();
    assert_eq!(calls.len(), 20);
    assert!(calls.values().all(|&n| n == 1));
    let logged = log.load().unwrap().iter().map(|r| r.config).collect::<Vec<_>>();
    assert_eq!(logged, (0..20).collect::<Vec<_>>());
}

#[test]
fn test_best_matches_log_after_reload() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("kernels.jsonl");
    let task = task();
    let report = {
        let log = KernelLog::open(Some(&path)).unwrap();
        let pipeline = CountingPipeline::default();
        let engine = KernelTuningEngine::new(
            &pipeline,
            &log,
            TuningOptions {
                strategy: StrategyKind::Random,
                n_trial: 12,
                ..TuningOptions::default()
            },
        );
        let report = engine.run_session(&task).unwrap();
        report
    };
    let reloaded = KernelLog::open(Some(&path)).unwrap();
    let best = reloaded.best(task.signature()).unwrap().unwrap();
    assert_eq!(report.best, Some((best.config, best.cost().unwrap())));
    assert_eq!(
        reloaded
            .best_aggregated(task.signature(), Aggregation::Min)
            .unwrap(),
        report.best
    );
}
