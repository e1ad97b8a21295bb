#[cfg(not(target_env = "msvc"))]
use tikv_jemallocator::Jemalloc;

use anyhow::{bail, Context, Result};
use clap::Parser;
use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use indicatif_log_bridge::LogWrapper;
use log::{info, warn};
use parking_lot::Mutex;

use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::path;
use std::time::Duration;

use graphtune::codegen::{ClangBuilder, LocalCpuDevice};
use graphtune::common::{Aggregation, CostSecs, TargetId};
use graphtune::emit::{GraphLog, TunedGraph, TunedGraphEmitter};
use graphtune::engine::{
    AbortCause, CancelToken, KernelTuningEngine, SessionObserver, SessionReport, TuningOptions,
};
use graphtune::graph::Graph;
use graphtune::job::Job;
use graphtune::layout_opt::GraphLayoutOptimizer;
use graphtune::measure::{DevicePool, LocalPipeline, MeasureOptions};
use graphtune::pprint::{best_table, records_table, sessions_table, tuned_graph_table};
use graphtune::records::{KernelLog, TuningRecord};
use graphtune::strategy::StrategyKind;
use graphtune::task::{Task, TaskSignature};

#[cfg(not(target_env = "msvc"))]
#[global_allocator]
static GLOBAL: Jemalloc = Jemalloc;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Args {
    #[command(subcommand)]
    subcmd: Subcommand,
}

#[derive(clap::Subcommand)]
enum Subcommand {
    /// Tune every task of a job, appending measurements to the kernel log
    TuneKernels(TuneKernelsCmd),
    /// Choose an implementation for every graph node from the kernel log
    TuneGraph(TuneGraphCmd),
    /// Tune the kernels of a job, then its graph
    Tune(TuneCmd),
    /// Print a kernel log and the best configuration of each task
    Inspect(InspectCmd),
}

#[derive(clap::Args)]
struct TuneKernelsCmd {
    job: path::PathBuf,
    #[arg(long)]
    kernel_log: path::PathBuf,
    #[command(flatten)]
    tuning: TuningArgs,
}

#[derive(clap::Args)]
struct TuneGraphCmd {
    job: path::PathBuf,
    #[arg(long)]
    kernel_log: path::PathBuf,
    #[command(flatten)]
    graph: GraphArgs,
}

#[derive(clap::Args)]
struct TuneCmd {
    job: path::PathBuf,
    #[arg(long)]
    kernel_log: path::PathBuf,
    #[command(flatten)]
    tuning: TuningArgs,
    #[command(flatten)]
    graph: GraphArgs,
}

#[derive(clap::Args)]
struct InspectCmd {
    log: path::PathBuf,
    /// Only show records of the task with this signature
    #[arg(long)]
    task: Option<String>,
}

#[derive(clap::Args)]
struct TuningArgs {
    #[arg(long, value_enum, default_value_t = StrategyKind::default())]
    tuner: StrategyKind,
    #[arg(long, default_value = "1000", help = "Measurements per task.")]
    n_trial: u64,
    #[arg(long, default_value = "16")]
    batch_size: usize,
    /// Stop a task after this many batches without improvement. 0 disables.
    #[arg(long, default_value = "20")]
    early_stopping: u32,
    /// Ignore records already in the kernel log
    #[arg(long, default_value_t = false)]
    no_resume: bool,
    /// Re-measure the best configurations this many times after searching
    #[arg(long, default_value = "0")]
    remeasure_best: u32,
    /// How many of the best configurations are re-measured
    #[arg(long, default_value = "3")]
    remeasure_top_k: usize,
    /// Reduction of a configuration's re-measured costs
    #[arg(long, value_enum, default_value_t = Aggregation::default())]
    remeasure_aggregation: Aggregation,
    #[arg(long, default_value = "0")]
    seed: u64,
    /// Number of tasks tuned in parallel
    #[arg(long, short)]
    jobs: Option<NonZeroUsize>,
    #[arg(long, help = "Stop tuning after this many seconds.")]
    timeout: Option<u64>,

    /// Target architecture
    #[arg(long, value_enum, hide_default_value = true, default_value_t = TargetId::default())]
    target: TargetId,
    #[arg(long, default_value = "3")]
    opt_level: u8,
    /// Inner-loop iterations per timed run
    #[arg(long, default_value = "4")]
    number: u32,
    /// Timed runs per configuration
    #[arg(long, default_value = "10")]
    repeat: u32,
    /// Reduction of the timed runs of one measurement
    #[arg(long, value_enum, default_value_t = Aggregation::default())]
    run_aggregation: Aggregation,
    #[arg(long, default_value = "10", help = "Per-run timeout in seconds.")]
    run_timeout: u64,
    #[arg(long, default_value_t = false)]
    no_cache_flush: bool,
    /// Number of parallel compiler invocations
    #[arg(long)]
    build_jobs: Option<NonZeroUsize>,
}

#[derive(clap::Args)]
struct GraphArgs {
    #[arg(long)]
    graph_log: path::PathBuf,
    /// Also print the tuned graph as JSON
    #[arg(long, default_value_t = false)]
    json: bool,
}

/// One progress bar per running session.
struct ProgressObserver {
    multi: MultiProgress,
    style: ProgressStyle,
    bars: Mutex<HashMap<TaskSignature, ProgressBar>>,
}

impl ProgressObserver {
    fn new(multi: MultiProgress) -> Result<Self> {
        let style =
            ProgressStyle::with_template("{prefix:>16.cyan.bold} [{bar:24}] {pos}/{len} {msg}")?
                .progress_chars("=> ");
        Ok(ProgressObserver {
            multi,
            style,
            bars: Mutex::new(HashMap::new()),
        })
    }
}

impl SessionObserver for ProgressObserver {
    fn session_started(&self, task: &Task, prior: usize, budget: u64) {
        let bar = self.multi.add(ProgressBar::new(budget));
        bar.set_style(self.style.clone());
        bar.set_prefix(task.name().to_string());
        if prior > 0 {
            bar.set_message(format!("resumed from {prior} records"));
        }
        self.bars.lock().insert(task.signature().clone(), bar);
    }

    fn batch_measured(&self, task: &Task, records: &[TuningRecord], best: Option<CostSecs>) {
        if let Some(bar) = self.bars.lock().get(task.signature()) {
            bar.inc(records.len() as u64);
            if let Some(best) = best {
                bar.set_message(format!("best {:.3}us", best * 1e6));
            }
        }
    }

    fn session_finished(&self, task: &Task, report: &SessionReport) {
        if let Some(bar) = self.bars.lock().remove(task.signature()) {
            bar.finish_with_message(report.state.to_string());
        }
    }
}

impl TuningArgs {
    fn tuning_options(&self) -> TuningOptions {
        TuningOptions {
            strategy: self.tuner,
            n_trial: self.n_trial,
            batch_size: self.batch_size,
            early_stopping: Some(self.early_stopping).filter(|&n| n > 0),
            resume: !self.no_resume,
            remeasure_best: self.remeasure_best,
            remeasure_top_k: self.remeasure_top_k,
            aggregation: self.remeasure_aggregation,
            seed: self.seed,
            jobs: self.jobs.unwrap_or(NonZeroUsize::MIN),
            ..TuningOptions::default()
        }
    }

    fn measure_options(&self) -> MeasureOptions {
        MeasureOptions {
            number: self.number,
            repeat: self.repeat,
            timeout: Duration::from_secs(self.run_timeout),
            flush_cache: !self.no_cache_flush,
            aggregation: self.run_aggregation,
            build_jobs: self.build_jobs,
            ..MeasureOptions::default()
        }
    }
}

fn main() -> Result<()> {
    let multi = init_logging()?;
    let args = Args::parse();
    match &args.subcmd {
        Subcommand::TuneKernels(cmd) => {
            let job = Job::load(&cmd.job)?;
            let kernel_log = KernelLog::open(Some(&cmd.kernel_log))?;
            tune_kernels(&job, &kernel_log, &cmd.tuning, &multi)?;
        }
        Subcommand::TuneGraph(cmd) => {
            let job = Job::load(&cmd.job)?;
            let kernel_log = KernelLog::open(Some(&cmd.kernel_log))?;
            tune_graph(&job, &kernel_log, &cmd.graph)?;
        }
        Subcommand::Tune(cmd) => {
            let job = Job::load(&cmd.job)?;
            if job.graph.is_none() {
                bail!("{} has no graph to tune", cmd.job.display());
            }
            let kernel_log = KernelLog::open(Some(&cmd.kernel_log))?;
            tune_kernels(&job, &kernel_log, &cmd.tuning, &multi)?;
            tune_graph(&job, &kernel_log, &cmd.graph)?;
        }
        Subcommand::Inspect(cmd) => inspect(cmd)?,
    }
    Ok(())
}

/// Install `env_logger` behind a bridge that keeps log lines from tearing progress bars.
fn init_logging() -> Result<MultiProgress> {
    let logger =
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).build();
    let level = logger.filter();
    let multi = MultiProgress::new();
    LogWrapper::new(multi.clone(), logger).try_init()?;
    log::set_max_level(level);
    Ok(multi)
}

fn tune_kernels(
    job: &Job,
    kernel_log: &KernelLog,
    args: &TuningArgs,
    multi: &MultiProgress,
) -> Result<Vec<SessionReport>> {
    let tasks = job.tasks()?;
    let pipeline = LocalPipeline::new(
        ClangBuilder::new(args.target, args.opt_level),
        DevicePool::single(LocalCpuDevice::default()),
        args.measure_options(),
    )?;

    let cancel = CancelToken::new();
    if let Some(secs) = args.timeout {
        let cancel = cancel.clone();
        std::thread::spawn(move || {
            std::thread::sleep(Duration::from_secs(secs));
            warn!("Timed out after {secs}s; stopping after the current batches");
            cancel.cancel();
        });
    }

    let observer = ProgressObserver::new(multi.clone())?;
    let options = args.tuning_options();
    info!(
        "Tuning {} tasks with {} ({} trials each)",
        tasks.len(),
        options.strategy,
        options.n_trial
    );
    let start_time = std::time::Instant::now();
    let reports = KernelTuningEngine::new(&pipeline, kernel_log, options)
        .with_cancel_token(cancel)
        .with_observer(&observer)
        .tune_tasks(&tasks)?;
    info!("Kernel tuning took {:?}", start_time.elapsed());

    sessions_table(&reports).printstd();
    if let Some(report) = reports
        .iter()
        .find(|r| matches!(r.abort_cause, Some(AbortCause::Pipeline(_))))
    {
        bail!(
            "Measurement failed while tuning {}; rerun to resume from {}",
            report.task_name,
            kernel_log.path().display()
        );
    }
    Ok(reports)
}

fn tune_graph(job: &Job, kernel_log: &KernelLog, args: &GraphArgs) -> Result<TunedGraph> {
    let Some(graph_def) = &job.graph else {
        bail!("The job has no graph to tune");
    };
    let graph = Graph::resolve(graph_def, &job.signatures(), kernel_log)
        .with_context(|| format!("Cannot resolve graph {}", graph_def.name))?;

    let start_time = std::time::Instant::now();
    let solution = GraphLayoutOptimizer::new().solve(&graph)?;
    info!(
        "Solved {} ({}) in {:?}",
        graph.name(),
        solution.mode,
        start_time.elapsed()
    );

    let graph_log = GraphLog::open(Some(&args.graph_log))?;
    let plan = TunedGraphEmitter::new(&graph_log).emit(&graph, &solution)?;
    tuned_graph_table(&plan).printstd();
    println!("\nTotal cost: {:.3}us", plan.total_cost * 1e6);
    if args.json {
        println!("{}", serde_json::to_string_pretty(&plan)?);
    }
    Ok(plan)
}

fn inspect(cmd: &InspectCmd) -> Result<()> {
    if !cmd.log.exists() {
        bail!("No log at {}", cmd.log.display());
    }
    let log = KernelLog::open(Some(&cmd.log))?;
    let mut records = log.load()?;
    let mut best = graphtune::records::best_by_task(&records);
    if let Some(task) = &cmd.task {
        records.retain(|r| r.task.as_str() == task);
        best.retain(|sig, _| sig.as_str() == task);
    }
    records_table(&records).printstd();
    println!();
    best_table(&best).printstd();
    Ok(())
}
