//! Closed-loop kernel tuning.
//!
//! A session walks `Idle -> Seeding -> Searching` and stops in one of three terminal states:
//! [SessionState::Converged] when the trial budget is spent or the best cost stops improving,
//! [SessionState::Exhausted] when every configuration has been measured, and
//! [SessionState::Aborted] on a pipeline failure or cancellation. Every measurement is appended to
//! the [KernelLog] as soon as its batch completes, so an aborted session can be resumed.

use crate::common::{Aggregation, CostSecs};
use crate::cost_model::CostModel;
use crate::measure::{MeasurementPipeline, PipelineError};
use crate::records::{KernelLog, LogError, TuningRecord};
use crate::space::{ConfigIdx, Configuration};
use crate::strategy::{History, SearchStrategy, Strategy, StrategyKind};
use crate::task::{Task, TaskSignature};

use itertools::Itertools;
use log::{debug, error, info, warn};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::fmt::{self, Display};
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct TuningOptions {
    pub strategy: StrategyKind,
    /// Measurements per task per session.
    pub n_trial: u64,
    pub batch_size: usize,
    /// Stop after this many consecutive batches without improving the best cost.
    pub early_stopping: Option<u32>,
    /// Seed the session from the task's records already in the log.
    pub resume: bool,
    /// After searching, measure the best configurations this many more times.
    pub remeasure_best: u32,
    pub remeasure_top_k: usize,
    /// How repeated measurements of a configuration are combined when re-measuring.
    pub aggregation: Aggregation,
    pub seed: u64,
    /// Tasks tuned at once. Each task keeps its own cost model.
    pub jobs: NonZeroUsize,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Idle,
    Seeding,
    Searching,
    Converged,
    Exhausted,
    Aborted,
}

#[derive(Debug)]
pub enum AbortCause {
    Pipeline(PipelineError),
    Cancelled,
}

#[derive(Debug)]
pub struct SessionReport {
    pub task: TaskSignature,
    pub task_name: String,
    pub state: SessionState,
    pub abort_cause: Option<AbortCause>,
    /// Records seeded from the log.
    pub prior: usize,
    /// Measurements made by this session, including re-measurements.
    pub measured: u64,
    /// The best configuration and its cost, or `None` if nothing succeeded.
    pub best: Option<(ConfigIdx, CostSecs)>,
}

#[derive(thiserror::Error, Debug)]
pub enum EngineError {
    #[error(transparent)]
    Log(#[from] LogError),
    #[error("No viable configuration found for {0}")]
    NoViableConfiguration(TaskSignature),
    #[error("Cannot build task pool: {0}")]
    ThreadPool(#[from] rayon::ThreadPoolBuildError),
}

/// Stops sessions between batches. Clones share the same flag.
#[derive(Clone, Debug, Default)]
pub struct CancelToken(Arc<AtomicBool>);

/// Receives progress from running sessions, possibly from several threads at once.
#[allow(unused_variables)]
pub trait SessionObserver: Sync {
    fn session_started(&self, task: &Task, prior: usize, budget: u64) {}

    fn batch_measured(&self, task: &Task, records: &[TuningRecord], best: Option<CostSecs>) {}

    fn session_finished(&self, task: &Task, report: &SessionReport) {}
}

pub struct KernelTuningEngine<'a, P> {
    pipeline: &'a P,
    log: &'a KernelLog,
    options: TuningOptions,
    cancel: CancelToken,
    observer: Option<&'a dyn SessionObserver>,
}

impl Default for TuningOptions {
    fn default() -> Self {
        TuningOptions {
            strategy: StrategyKind::ModelGuided,
            n_trial: 1000,
            batch_size: 16,
            early_stopping: Some(20),
            resume: true,
            remeasure_best: 0,
            remeasure_top_k: 3,
            aggregation: Aggregation::Min,
            seed: 0,
            jobs: NonZeroUsize::MIN,
        }
    }
}

impl SessionState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SessionState::Converged | SessionState::Exhausted | SessionState::Aborted
        )
    }
}

impl Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionState::Idle => "idle",
            SessionState::Seeding => "seeding",
            SessionState::Searching => "searching",
            SessionState::Converged => "converged",
            SessionState::Exhausted => "exhausted",
            SessionState::Aborted => "aborted",
        };
        f.write_str(name)
    }
}

impl Display for AbortCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AbortCause::Pipeline(e) => write!(f, "{e}"),
            AbortCause::Cancelled => write!(f, "cancelled"),
        }
    }
}

impl SessionReport {
    /// The best configuration, or [EngineError::NoViableConfiguration] if every measurement
    /// failed. Callers decide whether that is fatal.
    pub fn require_best(&self) -> Result<(ConfigIdx, CostSecs), EngineError> {
        self.best
            .ok_or_else(|| EngineError::NoViableConfiguration(self.task.clone()))
    }
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

impl<'a, P: MeasurementPipeline> KernelTuningEngine<'a, P> {
    pub fn new(pipeline: &'a P, log: &'a KernelLog, options: TuningOptions) -> Self {
        KernelTuningEngine {
            pipeline,
            log,
            options,
            cancel: CancelToken::new(),
            observer: None,
        }
    }

    pub fn with_cancel_token(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn with_observer(mut self, observer: &'a dyn SessionObserver) -> Self {
        self.observer = Some(observer);
        self
    }

    pub fn options(&self) -> &TuningOptions {
        &self.options
    }

    /// Tune every distinct task, in parallel when `jobs` allows. Tasks sharing a signature are
    /// tuned once, under the first of them; reports are in the order of those first occurrences.
    ///
    /// Log failures stop everything; a pipeline failure only aborts its own session.
    pub fn tune_tasks(&self, tasks: &[Task]) -> Result<Vec<SessionReport>, EngineError> {
        let tasks = tasks
            .iter()
            .unique_by(|t| t.signature())
            .collect::<Vec<_>>();
        if self.options.jobs.get() == 1 {
            return tasks.iter().map(|t| self.run_session(t)).collect();
        }
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(self.options.jobs.get())
            .thread_name(|i| format!("tune-{i}"))
            .build()?;
        pool.install(|| tasks.par_iter().map(|t| self.run_session(t)).collect())
    }

    pub fn run_session(&self, task: &Task) -> Result<SessionReport, EngineError> {
        let space = task.space();
        let signature = task.signature();
        let mut state = SessionState::Idle;
        debug!("{task}: {state}");

        state = SessionState::Seeding;
        let mut history = History::new();
        let mut model = self.options.strategy.cost_model(space);
        let mut strategy = Strategy::new(self.options.strategy, self.options.seed);
        let mut prior = vec![];
        if self.options.resume {
            for record in self.log.load_task(signature)? {
                if record.config >= space.size() {
                    warn!(
                        "{task}: ignoring logged config {} outside a space of {}",
                        record.config,
                        space.size()
                    );
                    continue;
                }
                history.observe(record.config, &record.result);
                prior.push(record);
            }
            model.update(&prior);
        }
        info!(
            "{task}: {state} from {} prior records over {} configurations",
            prior.len(),
            space.size()
        );
        if let Some(observer) = self.observer {
            observer.session_started(task, prior.len(), self.options.n_trial);
        }

        state = SessionState::Searching;
        debug!("{task}: {state}");
        let mut measured = 0u64;
        let mut stale_batches = 0u32;
        let mut abort_cause = None;
        loop {
            if self.cancel.is_cancelled() {
                state = SessionState::Aborted;
                abort_cause = Some(AbortCause::Cancelled);
                break;
            }
            if history.is_exhausted(space) {
                state = SessionState::Exhausted;
                break;
            }
            if measured >= self.options.n_trial {
                state = SessionState::Converged;
                break;
            }

            let remaining = usize::try_from(self.options.n_trial - measured).unwrap_or(usize::MAX);
            let want = self.options.batch_size.max(1).min(remaining);
            let batch = strategy.propose(space, &model, &history, want);
            if batch.is_empty() {
                state = if history.is_exhausted(space) {
                    SessionState::Exhausted
                } else {
                    SessionState::Converged
                };
                break;
            }

            let best_before = history.best().map(|(_, c)| c);
            let (records, failure) = self.measure_and_log(task, &batch)?;
            measured += records.len() as u64;
            for record in &records {
                history.observe(record.config, &record.result);
            }
            // The batch is complete, so the model sees it all at once.
            model.update(&records);

            let best_after = history.best().map(|(_, c)| c);
            debug!(
                "{task}: measured {} configs ({measured} this session), best {:?}",
                records.len(),
                best_after
            );
            if let Some(observer) = self.observer {
                observer.batch_measured(task, &records, best_after);
            }

            if let Some(e) = failure {
                error!("{task}: aborting: {e}");
                state = SessionState::Aborted;
                abort_cause = Some(AbortCause::Pipeline(e));
                break;
            }

            let improved = match (best_before, best_after) {
                (None, Some(_)) => true,
                (Some(before), Some(after)) => after < before,
                _ => false,
            };
            stale_batches = if improved { 0 } else { stale_batches + 1 };
            if let Some(limit) = self.options.early_stopping {
                if stale_batches >= limit {
                    info!("{task}: no improvement in {stale_batches} batches");
                    state = SessionState::Converged;
                    break;
                }
            }
        }

        let mut best = history.best();
        if state != SessionState::Aborted && self.options.remeasure_best > 0 {
            match self.remeasure(task, &history)? {
                Ok(n) => {
                    measured += n;
                    best = self
                        .log
                        .best_aggregated(signature, self.options.aggregation)?
                        .or(best);
                }
                Err(cause) => {
                    state = SessionState::Aborted;
                    abort_cause = Some(cause);
                }
            }
        }

        debug_assert!(state.is_terminal());
        let report = SessionReport {
            task: signature.clone(),
            task_name: task.name().to_string(),
            state,
            abort_cause,
            prior: prior.len(),
            measured,
            best,
        };
        match report.best {
            Some((config, cost)) => info!(
                "{task}: {state} after {measured} measurements; best is #{config} at {:.3}us",
                cost * 1e6
            ),
            None => warn!("{task}: {state} with no viable configuration"),
        }
        if let Some(observer) = self.observer {
            observer.session_finished(task, &report);
        }
        Ok(report)
    }

    /// Measure `batch`, appending a record for every slot the pipeline measured. Returns those
    /// records and the first pipeline failure, if any.
    fn measure_and_log(
        &self,
        task: &Task,
        batch: &[Configuration],
    ) -> Result<(Vec<TuningRecord>, Option<PipelineError>), EngineError> {
        let results = self.pipeline.measure_batch(task, batch);
        let mut records = Vec::with_capacity(batch.len());
        let mut failure = None;
        for (config, result) in batch.iter().zip(results) {
            match result {
                Ok(result) => {
                    let record = TuningRecord::new(task.signature().clone(), config.index(), result);
                    self.log.append(&record)?;
                    records.push(record);
                }
                Err(e) => {
                    failure.get_or_insert(e);
                }
            }
        }
        Ok((records, failure))
    }

    /// Re-measure the best few configurations to average out noise. Returns the number of
    /// measurements made, or why re-measuring stopped early.
    fn remeasure(&self, task: &Task, history: &History) -> Result<Result<u64, AbortCause>, EngineError> {
        let top = history
            .ranked()
            .into_iter()
            .take(self.options.remeasure_top_k)
            .filter_map(|(i, _)| task.space().decode(i).ok())
            .collect::<Vec<_>>();
        if top.is_empty() {
            return Ok(Ok(0));
        }
        info!(
            "{task}: re-measuring the best {} configurations {} times",
            top.len(),
            self.options.remeasure_best
        );
        let mut measured = 0;
        for _ in 0..self.options.remeasure_best {
            if self.cancel.is_cancelled() {
                return Ok(Err(AbortCause::Cancelled));
            }
            let (records, failure) = self.measure_and_log(task, &top)?;
            measured += records.len() as u64;
            if let Some(e) = failure {
                error!("{task}: aborting re-measurement: {e}");
                return Ok(Err(AbortCause::Pipeline(e)));
            }
        }
        Ok(Ok(measured))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::measure::{FailureKind, MeasureResult};
    use crate::space::Knob;
    use crate::task::test_task;
    use parking_lot::Mutex;
    use std::collections::HashMap;

    /// Costs `index + 1` seconds, except where `outcome` says otherwise. Counts every call.
    struct StubPipeline<F> {
        outcome: F,
        calls: Mutex<HashMap<ConfigIdx, usize>>,
    }

    impl<F> StubPipeline<F>
    where
        F: Fn(ConfigIdx, usize) -> Result<MeasureResult, PipelineError> + Sync,
    {
        fn new(outcome: F) -> Self {
            StubPipeline {
                outcome,
                calls: Mutex::new(HashMap::new()),
            }
        }

        fn total_calls(&self) -> usize {
            self.calls.lock().values().sum()
        }
    }

    impl<F> MeasurementPipeline for StubPipeline<F>
    where
        F: Fn(ConfigIdx, usize) -> Result<MeasureResult, PipelineError> + Sync,
    {
        fn measure_batch(
            &self,
            _task: &Task,
            configs: &[Configuration],
        ) -> Vec<Result<MeasureResult, PipelineError>> {
            configs
                .iter()
                .map(|c| {
                    let mut calls = self.calls.lock();
                    let n = calls.entry(c.index()).or_default();
                    *n += 1;
                    let call = *n;
                    drop(calls);
                    (self.outcome)(c.index(), call)
                })
                .collect()
        }
    }

    fn ok(index: ConfigIdx, _call: usize) -> Result<MeasureResult, PipelineError> {
        Ok(MeasureResult::success(index as f64 + 1.0))
    }

    fn task(n: i64) -> Task {
        test_task("t", vec![Knob::ints("x", 0..n)])
    }

    fn options(strategy: StrategyKind) -> TuningOptions {
        TuningOptions {
            strategy,
            n_trial: 1000,
            batch_size: 4,
            early_stopping: None,
            ..TuningOptions::default()
        }
    }

    #[test]
    fn test_exhaustive_session_ends_exhausted() {
        let log = KernelLog::open(None).unwrap();
        let pipeline = StubPipeline::new(ok);
        let engine = KernelTuningEngine::new(&pipeline, &log, options(StrategyKind::Exhaustive));
        let report = engine.run_session(&task(10)).unwrap();
        assert_eq!(report.state, SessionState::Exhausted);
        assert_eq!(report.measured, 10);
        assert_eq!(report.best, Some((0, 1.0)));
        assert_eq!(pipeline.total_calls(), 10);
        assert_eq!(log.load().unwrap().len(), 10);
    }

    #[test]
    fn test_budget_ends_converged() {
        let log = KernelLog::open(None).unwrap();
        let pipeline = StubPipeline::new(ok);
        let engine = KernelTuningEngine::new(
            &pipeline,
            &log,
            TuningOptions {
                n_trial: 6,
                ..options(StrategyKind::Random)
            },
        );
        let report = engine.run_session(&task(50)).unwrap();
        assert_eq!(report.state, SessionState::Converged);
        assert_eq!(report.measured, 6);
        assert_eq!(pipeline.total_calls(), 6);
    }

    #[test]
    fn test_stagnation_ends_converged() {
        let log = KernelLog::open(None).unwrap();
        // Ascending costs: nothing after the first batch improves on it.
        let pipeline = StubPipeline::new(ok);
        let engine = KernelTuningEngine::new(
            &pipeline,
            &log,
            TuningOptions {
                early_stopping: Some(2),
                ..options(StrategyKind::Exhaustive)
            },
        );
        let report = engine.run_session(&task(100)).unwrap();
        assert_eq!(report.state, SessionState::Converged);
        assert_eq!(report.measured, 12);
    }

    #[test]
    fn test_resume_skips_measured_configs() {
        let log = KernelLog::open(None).unwrap();
        let t = task(12);
        let first = StubPipeline::new(ok);
        let opts = TuningOptions {
            n_trial: 5,
            ..options(StrategyKind::Random)
        };
        KernelTuningEngine::new(&first, &log, opts.clone())
            .run_session(&t)
            .unwrap();

        let second = StubPipeline::new(ok);
        let report = KernelTuningEngine::new(&second, &log, opts)
            .run_session(&t)
            .unwrap();
        assert_eq!(report.prior, 5);
        let first_calls = first.calls.lock();
        for config in second.calls.lock().keys() {
            assert!(!first_calls.contains_key(config));
        }
    }

    #[test]
    fn test_pipeline_failure_aborts_but_keeps_records() {
        let log = KernelLog::open(None).unwrap();
        let pipeline = StubPipeline::new(|i, _| {
            if i == 5 {
                Err(PipelineError::TargetUnreachable("unplugged".to_string()))
            } else {
                ok(i, 0)
            }
        });
        let engine = KernelTuningEngine::new(&pipeline, &log, options(StrategyKind::Exhaustive));
        let report = engine.run_session(&task(10)).unwrap();
        assert_eq!(report.state, SessionState::Aborted);
        assert!(matches!(
            report.abort_cause,
            Some(AbortCause::Pipeline(PipelineError::TargetUnreachable(_)))
        ));
        // Batches are [0..4) and [4..8); only config 5 went unrecorded.
        let logged = log.load().unwrap().iter().map(|r| r.config).collect::<Vec<_>>();
        assert_eq!(logged, [0, 1, 2, 3, 4, 6, 7]);
    }

    #[test]
    fn test_cancelled_session_is_aborted() {
        let log = KernelLog::open(None).unwrap();
        let cancel = CancelToken::new();
        let token = cancel.clone();
        let pipeline = StubPipeline::new(move |i, _| {
            token.cancel();
            ok(i, 0)
        });
        let report = KernelTuningEngine::new(&pipeline, &log, options(StrategyKind::Exhaustive))
            .with_cancel_token(cancel)
            .run_session(&task(10))
            .unwrap();
        assert_eq!(report.state, SessionState::Aborted);
        assert!(matches!(report.abort_cause, Some(AbortCause::Cancelled)));
        // The in-flight batch finished and was logged.
        assert_eq!(log.load().unwrap().len(), 4);
    }

    #[test]
    fn test_all_failures_is_not_viable_but_not_fatal() {
        let log = KernelLog::open(None).unwrap();
        let pipeline =
            StubPipeline::new(|_, _| Ok(MeasureResult::failed(FailureKind::BuildFailed, "no")));
        let report = KernelTuningEngine::new(&pipeline, &log, options(StrategyKind::ModelGuided))
            .run_session(&task(6))
            .unwrap();
        assert_eq!(report.state, SessionState::Exhausted);
        assert_eq!(report.best, None);
        assert!(matches!(
            report.require_best(),
            Err(EngineError::NoViableConfiguration(_))
        ));
    }

    #[test]
    fn test_remeasure_uses_aggregated_costs() {
        let log = KernelLog::open(None).unwrap();
        // Config 0 is lucky once, then slow.
        let pipeline = StubPipeline::new(|i, call| {
            Ok(MeasureResult::success(match (i, call) {
                (0, 1) => 0.5,
                (0, _) => 10.0,
                (i, _) => i as f64 + 1.0,
            }))
        });
        let report = KernelTuningEngine::new(
            &pipeline,
            &log,
            TuningOptions {
                remeasure_best: 4,
                remeasure_top_k: 2,
                aggregation: Aggregation::Mean,
                ..options(StrategyKind::Exhaustive)
            },
        )
        .run_session(&task(4))
        .unwrap();
        assert_eq!(report.state, SessionState::Exhausted);
        assert_eq!(report.measured, 4 + 4 * 2);
        assert_eq!(report.best, Some((1, 2.0)));
    }

    #[test]
    fn test_parallel_tasks_each_get_a_report() {
        let log = KernelLog::open(None).unwrap();
        let pipeline = StubPipeline::new(ok);
        let tasks = (1..=4)
            .map(|n| test_task(&format!("t{n}"), vec![Knob::ints("x", 0..n * 3)]))
            .collect::<Vec<_>>();
        let reports = KernelTuningEngine::new(
            &pipeline,
            &log,
            TuningOptions {
                jobs: NonZeroUsize::new(3).unwrap(),
                ..options(StrategyKind::Exhaustive)
            },
        )
        .tune_tasks(&tasks)
        .unwrap();
        assert_eq!(reports.len(), 4);
        for (task, report) in tasks.iter().zip(&reports) {
            assert_eq!(&report.task, task.signature());
            assert_eq!(report.state, SessionState::Exhausted);
        }
    }

    #[test]
    fn test_identical_tasks_are_tuned_once() {
        let log = KernelLog::open(None).unwrap();
        let pipeline = StubPipeline::new(ok);
        let tasks = vec![
            test_task("conv0", vec![Knob::ints("x", 0..4)]),
            test_task("conv1", vec![Knob::ints("x", 0..4)]),
        ];
        let engine = KernelTuningEngine::new(
            &pipeline,
            &log,
            TuningOptions {
                jobs: NonZeroUsize::new(2).unwrap(),
                ..options(StrategyKind::Exhaustive)
            },
        );
        let reports = engine.tune_tasks(&tasks).unwrap();
        assert_eq!(reports.len(), 1);
        assert_eq!(&reports[0].task, tasks[0].signature());
        assert_eq!(pipeline.total_calls(), 4);
        assert_eq!(log.load_task(tasks[0].signature()).unwrap().len(), 4);
    }
}
