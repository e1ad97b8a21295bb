//! Turning candidate configurations into measured costs.
//!
//! [LocalPipeline] splits a batch into a build phase, run in parallel on a bounded rayon pool,
//! and a run phase, in which every candidate leases one device from a [DevicePool] for its
//! warm-up and timed repeats. Per-candidate failures become failure-tagged [MeasureResult]s;
//! only [PipelineError]s, which say nothing about the candidate itself, escape.

mod pool;

pub use pool::{DevicePool, DeviceLease};

use crate::common::{Aggregation, CostSecs};
use crate::space::Configuration;
use crate::task::Task;

use log::{debug, warn};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::fmt::{self, Display};
use std::num::NonZeroUsize;
use std::time::Duration;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[cfg_attr(test, derive(proptest_derive::Arbitrary))]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    BuildFailed,
    RunFailed,
    Timeout,
    InvalidConfig,
}

/// The outcome of measuring one configuration. Never partially valid.
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum MeasureResult {
    Ok {
        cost: CostSecs,
    },
    Failed {
        kind: FailureKind,
        #[serde(default, skip_serializing_if = "String::is_empty")]
        message: String,
    },
}

#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct MeasureOptions {
    /// Inner-loop iterations per timed run. The run's cost is the per-iteration mean.
    pub number: u32,
    /// Timed runs per candidate.
    pub repeat: u32,
    /// Untimed runs before the timed ones.
    pub warmup: u32,
    /// Bound on each individual run.
    pub timeout: Duration,
    /// Ask the device to evict caches before each timed run.
    pub flush_cache: bool,
    /// How timed runs are reduced to one cost.
    pub aggregation: Aggregation,
    /// Parallelism of the build phase. Defaults to the rayon default.
    pub build_jobs: Option<NonZeroUsize>,
}

/// What a [Device] needs to know for one run.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RunOptions {
    pub number: u32,
    pub timeout: Duration,
    pub flush_cache: bool,
}

/// A failure of the pipeline itself rather than of a candidate.
#[derive(thiserror::Error, Debug)]
pub enum PipelineError {
    #[error("Target unreachable: {0}")]
    TargetUnreachable(String),
    #[error("Resource exhausted: {0}")]
    ResourceExhausted(String),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(thiserror::Error, Debug)]
pub enum BuildError {
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
    #[error("Build failed: {0}")]
    Failed(String),
    #[error(transparent)]
    Pipeline(#[from] PipelineError),
}

#[derive(thiserror::Error, Debug)]
pub enum RunError {
    #[error("Run failed: {0}")]
    Failed(String),
    #[error("Run exceeded {0:?}")]
    Timeout(Duration),
    #[error(transparent)]
    Pipeline(#[from] PipelineError),
}

/// Materializes and compiles a configuration. Must be safe to call from many threads at once.
pub trait Builder: Sync {
    type Artifact: Send + Sync;

    fn build(&self, task: &Task, config: &Configuration) -> Result<Self::Artifact, BuildError>;
}

/// One physical execution resource.
pub trait Device: Send {
    type Artifact;

    fn name(&self) -> &str;

    /// Execute `artifact` and return the mean time of one inner iteration.
    ///
    /// Implementations should stop the run once `options.timeout` elapses. [LocalPipeline]
    /// additionally treats any returned duration above the bound as a timeout.
    fn run(&mut self, artifact: &Self::Artifact, options: &RunOptions) -> Result<Duration, RunError>;
}

pub trait MeasurementPipeline: Sync {
    /// Measure every configuration in `configs`, returning results in the same order.
    ///
    /// An `Err` entry means that slot could not be measured because the pipeline itself failed.
    fn measure_batch(
        &self,
        task: &Task,
        configs: &[Configuration],
    ) -> Vec<Result<MeasureResult, PipelineError>>;

    fn measure(&self, task: &Task, config: &Configuration) -> Result<MeasureResult, PipelineError> {
        self.measure_batch(task, std::slice::from_ref(config))
            .pop()
            .unwrap_or_else(|| {
                Err(PipelineError::ResourceExhausted(
                    "pipeline returned no result".to_string(),
                ))
            })
    }
}

pub struct LocalPipeline<B, D> {
    builder: B,
    devices: DevicePool<D>,
    options: MeasureOptions,
    workers: rayon::ThreadPool,
}

impl MeasureResult {
    pub fn success(cost: CostSecs) -> Self {
        debug_assert!(cost.is_finite() && cost >= 0.0, "invalid cost: {cost}");
        MeasureResult::Ok { cost }
    }

    pub fn failed(kind: FailureKind, message: impl Into<String>) -> Self {
        MeasureResult::Failed {
            kind,
            message: message.into(),
        }
    }

    pub fn cost(&self) -> Option<CostSecs> {
        match self {
            MeasureResult::Ok { cost } => Some(*cost),
            MeasureResult::Failed { .. } => None,
        }
    }

    pub fn failure(&self) -> Option<FailureKind> {
        match self {
            MeasureResult::Ok { .. } => None,
            MeasureResult::Failed { kind, .. } => Some(*kind),
        }
    }

    pub fn is_ok(&self) -> bool {
        matches!(self, MeasureResult::Ok { .. })
    }
}

impl Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureKind::BuildFailed => write!(f, "build failed"),
            FailureKind::RunFailed => write!(f, "run failed"),
            FailureKind::Timeout => write!(f, "timeout"),
            FailureKind::InvalidConfig => write!(f, "invalid config"),
        }
    }
}

impl Display for MeasureResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MeasureResult::Ok { cost } => write!(f, "{:.3}us", cost * 1e6),
            MeasureResult::Failed { kind, .. } => write!(f, "{kind}"),
        }
    }
}

impl Default for MeasureOptions {
    fn default() -> Self {
        MeasureOptions {
            number: 4,
            repeat: 10,
            warmup: 1,
            timeout: Duration::from_secs(10),
            flush_cache: true,
            aggregation: Aggregation::Min,
            build_jobs: None,
        }
    }
}

impl<B, D> LocalPipeline<B, D>
where
    B: Builder,
    D: Device<Artifact = B::Artifact>,
{
    pub fn new(
        builder: B,
        devices: DevicePool<D>,
        options: MeasureOptions,
    ) -> Result<Self, PipelineError> {
        let mut workers = rayon::ThreadPoolBuilder::new().thread_name(|i| format!("measure-{i}"));
        if let Some(jobs) = options.build_jobs {
            workers = workers.num_threads(jobs.get());
        }
        let workers = workers
            .build()
            .map_err(|e| PipelineError::ResourceExhausted(e.to_string()))?;
        Ok(LocalPipeline {
            builder,
            devices,
            options,
            workers,
        })
    }

    pub fn options(&self) -> &MeasureOptions {
        &self.options
    }

    fn build_one(
        &self,
        task: &Task,
        config: &Configuration,
    ) -> Result<Result<B::Artifact, MeasureResult>, PipelineError> {
        match self.builder.build(task, config) {
            Ok(artifact) => Ok(Ok(artifact)),
            Err(BuildError::InvalidConfig(msg)) => {
                debug!("{} {config}: invalid configuration: {msg}", task.name());
                Ok(Err(MeasureResult::failed(FailureKind::InvalidConfig, msg)))
            }
            Err(BuildError::Failed(msg)) => {
                debug!("{} {config}: build failed: {msg}", task.name());
                Ok(Err(MeasureResult::failed(FailureKind::BuildFailed, msg)))
            }
            Err(BuildError::Pipeline(e)) => Err(e),
        }
    }

    fn run_one(&self, task: &Task, config: &Configuration, artifact: &B::Artifact) -> Result<MeasureResult, PipelineError> {
        let mut device = self.devices.lease();
        let warmup_options = RunOptions {
            number: 1,
            timeout: self.options.timeout,
            flush_cache: false,
        };
        for _ in 0..self.options.warmup {
            if let Err(failure) = self.timed_run(&mut device, artifact, &warmup_options)? {
                return Ok(failure);
            }
        }

        let run_options = RunOptions {
            number: self.options.number.max(1),
            timeout: self.options.timeout,
            flush_cache: self.options.flush_cache,
        };
        let mut samples = Vec::with_capacity(self.options.repeat as usize);
        for _ in 0..self.options.repeat.max(1) {
            match self.timed_run(&mut device, artifact, &run_options)? {
                Ok(t) => samples.push(t.as_secs_f64()),
                Err(failure) => return Ok(failure),
            }
        }
        let Some(cost) = self.options.aggregation.apply(&samples) else {
            return Ok(MeasureResult::failed(FailureKind::RunFailed, "no samples"));
        };
        debug!(
            "{} {config} on {}: {:.3}us",
            task.name(),
            device.name(),
            cost * 1e6
        );
        Ok(MeasureResult::success(cost))
    }

    /// Run once, sorting the outcome into a sample, a failed candidate, or a pipeline error.
    fn timed_run(
        &self,
        device: &mut D,
        artifact: &B::Artifact,
        options: &RunOptions,
    ) -> Result<Result<Duration, MeasureResult>, PipelineError> {
        match device.run(artifact, options) {
            Ok(t) if t.saturating_mul(options.number) > options.timeout => Ok(Err(
                MeasureResult::failed(FailureKind::Timeout, format!("exceeded {:?}", options.timeout)),
            )),
            Ok(t) => Ok(Ok(t)),
            Err(RunError::Timeout(bound)) => Ok(Err(MeasureResult::failed(
                FailureKind::Timeout,
                format!("exceeded {bound:?}"),
            ))),
            Err(RunError::Failed(msg)) => Ok(Err(MeasureResult::failed(FailureKind::RunFailed, msg))),
            Err(RunError::Pipeline(e)) => Err(e),
        }
    }
}

impl<B, D> MeasurementPipeline for LocalPipeline<B, D>
where
    B: Builder,
    D: Device<Artifact = B::Artifact>,
{
    fn measure_batch(
        &self,
        task: &Task,
        configs: &[Configuration],
    ) -> Vec<Result<MeasureResult, PipelineError>> {
        self.workers.install(|| {
            let built = configs
                .par_iter()
                .map(|config| self.build_one(task, config))
                .collect::<Vec<_>>();
            let results = configs
                .par_iter()
                .zip(built)
                .map(|(config, built)| match built? {
                    Ok(artifact) => self.run_one(task, config, &artifact),
                    Err(failure) => Ok(failure),
                })
                .collect::<Vec<_>>();
            let failed = results
                .iter()
                .filter(|r| r.as_ref().map_or(false, |m| !m.is_ok()))
                .count();
            if failed > 0 {
                warn!(
                    "{}: {failed} of {} candidates failed to measure",
                    task.name(),
                    configs.len()
                );
            }
            results
        })
    }
}
