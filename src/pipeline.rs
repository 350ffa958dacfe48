use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use chrono::{Months, NaiveDate};
use rayon::prelude::*;
use serde::Serialize;
use tracing::{error, info};
use uuid::Uuid;

use crate::aggregate::{Aggregator, RollingAggregator};
use crate::config::StrategyConfig;
use crate::error::{PipelineError, SearchError, Stage};
use crate::genetic::GenerationReport;
use crate::metrics::{PerformanceMetrics, SelectionMetric};
use crate::simulator::{PortfolioSimulator, SimulationOptions, StrategySet};
use crate::trades::{GapSeries, NewsCalendar, SourceTrades};

/// Months of history every optimizer run skips so all candidates start warm.
pub const OPTIMIZER_WARMUP_MONTHS: u32 = 12;

#[derive(Clone, Debug, PartialEq)]
pub struct Candidate {
    pub lineage: Uuid,
    pub config: StrategyConfig,
}

#[derive(Clone, Debug, Serialize)]
pub struct OptimizerResult {
    pub config: StrategyConfig,
    pub lineage: Uuid,
    pub selection_metric: SelectionMetric,
    pub metrics: Option<PerformanceMetrics>,
    pub elapsed: Duration,
}

impl OptimizerResult {
    /// Selection-metric value; NaN until scored.
    pub fn score(&self) -> f64 {
        self.metrics
            .as_ref()
            .map(|m| self.selection_metric.value(m))
            .unwrap_or(f64::NAN)
    }
}

impl fmt::Display for OptimizerResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{}", self.config)?;
        write!(f, "{}: {:.4}", self.selection_metric, self.score())?;
        if let Some(m) = &self.metrics {
            let others = [
                (SelectionMetric::DrawdownPct, m.drawdown_pct),
                (SelectionMetric::DaysInDrawdown, m.days_in_drawdown as f64),
                (SelectionMetric::TotalReturn, m.total_return),
                (SelectionMetric::Cagr, m.cagr),
                (SelectionMetric::Sharpe, m.sharpe),
                (SelectionMetric::Mar, m.mar),
                (SelectionMetric::LargestMonth, m.largest_month.pnl),
                (SelectionMetric::SmallestMonth, m.smallest_month.pnl),
            ];
            for (metric, v) in others {
                if metric != self.selection_metric {
                    write!(f, " | {metric}: {v:.4}")?;
                }
            }
        }
        Ok(())
    }
}

/// Best scored result, NaN and unscored last. Ties keep the earlier one.
pub fn best_of<'r>(
    metric: SelectionMetric,
    results: impl IntoIterator<Item = &'r OptimizerResult>,
) -> Option<&'r OptimizerResult> {
    results
        .into_iter()
        .filter(|r| r.metrics.is_some())
        .fold(None, |best: Option<&OptimizerResult>, r| match best {
            Some(b) if !metric.better(r.score(), b.score()) => Some(b),
            _ => Some(r),
        })
}

/// Scores one candidate. Shared read-only across workers.
pub trait Evaluator: Sync {
    fn evaluate(&self, candidate: &Candidate) -> Result<OptimizerResult, PipelineError>;
}

/// Aggregate, simulate, then score one configuration against one trade log.
pub struct EvaluationPipeline<A: Aggregator = RollingAggregator> {
    pub source: SourceTrades,
    pub news: NewsCalendar,
    pub gaps: Option<GapSeries>,
    pub options: SimulationOptions,
    pub metric: SelectionMetric,
    pub aggregator: A,
}

impl EvaluationPipeline<RollingAggregator> {
    pub fn new(
        source: SourceTrades,
        news: NewsCalendar,
        gaps: Option<GapSeries>,
        mut options: SimulationOptions,
        metric: SelectionMetric,
    ) -> Self {
        options.use_scaling = true;
        if options.start.is_none() {
            options.start = optimizer_start(&source);
        }
        Self {
            source,
            news,
            gaps,
            options,
            metric,
            aggregator: RollingAggregator,
        }
    }
}

/// First trade date plus the fixed optimizer warm-up.
pub fn optimizer_start(source: &SourceTrades) -> Option<NaiveDate> {
    source
        .first_date()
        .map(|d| d + Months::new(OPTIMIZER_WARMUP_MONTHS))
}

impl<A: Aggregator> EvaluationPipeline<A> {
    fn fail(&self, stage: Stage, candidate: &Candidate, err: impl fmt::Display) -> PipelineError {
        let message = err.to_string();
        error!(
            %stage,
            lineage = %candidate.lineage,
            config = %candidate.config,
            error = %message,
            "candidate evaluation failed"
        );
        PipelineError {
            stage,
            lineage: candidate.lineage,
            message,
        }
    }
}

impl<A: Aggregator> Evaluator for EvaluationPipeline<A> {
    fn evaluate(&self, candidate: &Candidate) -> Result<OptimizerResult, PipelineError> {
        let started = Instant::now();
        candidate
            .config
            .validate()
            .map_err(|e| self.fail(Stage::Aggregate, candidate, e))?;

        // keyed by source label, so the metrics come from the Portfolio lane
        let strategies = StrategySet::Portfolio(BTreeMap::from([(
            self.source.label.clone(),
            candidate.config.clone(),
        )]));
        let jobs = strategies
            .jobs(std::slice::from_ref(&self.source))
            .map_err(|e| self.fail(Stage::Aggregate, candidate, e))?;
        let store = self
            .aggregator
            .aggregate(&jobs, &self.news, self.gaps.as_ref())
            .map_err(|e| self.fail(Stage::Aggregate, candidate, e))?;

        let output = PortfolioSimulator::new(&store, &self.news, self.gaps.as_ref(), &self.options)
            .run(&strategies)
            .map_err(|e| self.fail(Stage::Simulate, candidate, e))?;

        let curve = output
            .primary()
            .ok_or_else(|| self.fail(Stage::Score, candidate, "simulation produced no equity curve"))?;
        let metrics = PerformanceMetrics::from_curve(&curve.rows)
            .map_err(|e| self.fail(Stage::Score, candidate, e))?;

        Ok(OptimizerResult {
            config: candidate.config.clone(),
            lineage: candidate.lineage,
            selection_metric: self.metric,
            metrics: Some(metrics),
            elapsed: started.elapsed(),
        })
    }
}

/// Cooperative stop flag shared between the caller and a running search.
#[derive(Clone, Debug, Default)]
pub struct CancelToken(Arc<AtomicBool>);

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

    /// Cancels once `signal` resolves. The future runs on its own thread with
    /// a single-threaded runtime, so the rayon pool is left alone.
    pub fn cancel_when<F>(&self, signal: F) -> io::Result<JoinHandle<()>>
    where
        F: Future<Output = io::Result<()>> + Send + 'static,
    {
        let runtime = tokio::runtime::Builder::new_current_thread().enable_all().build()?;
        let token = self.clone();
        thread::Builder::new()
            .name("cancel-signal".into())
            .spawn(move || match runtime.block_on(signal) {
                Ok(()) => {
                    info!("interrupt received, stopping after the current batch");
                    token.cancel();
                }
                Err(e) => error!(error = %e, "failed to listen for interrupt"),
            })
    }

    pub fn cancel_on_ctrl_c(&self) -> io::Result<JoinHandle<()>> {
        self.cancel_when(tokio::signal::ctrl_c())
    }
}

pub struct WorkerPool {
    pool: rayon::ThreadPool,
    workers: usize,
}

impl WorkerPool {
    /// All logical CPUs but one unless `workers` is given.
    pub fn new(workers: Option<usize>) -> Result<Self, SearchError> {
        let workers = workers
            .unwrap_or_else(|| {
                std::thread::available_parallelism()
                    .map(|n| n.get().saturating_sub(1))
                    .unwrap_or(1)
            })
            .max(1);
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(workers)
            .thread_name(|i| format!("evaluator-{i}"))
            .build()?;
        Ok(Self { pool, workers })
    }

    pub fn workers(&self) -> usize {
        self.workers
    }

    /// Runs a batch to completion; output order matches `batch`.
    pub fn evaluate_batch<E: Evaluator + ?Sized>(
        &self,
        evaluator: &E,
        batch: &[Candidate],
    ) -> Vec<Result<OptimizerResult, PipelineError>> {
        self.pool
            .install(|| batch.par_iter().map(|c| evaluator.evaluate(c)).collect())
    }
}

#[derive(Clone, Debug, Serialize)]
pub struct SearchReport {
    pub best: OptimizerResult,
    pub evaluated: usize,
    pub failed: usize,
    pub time_per_test: Duration,
    pub total_time: Duration,
    /// Per-generation lineage bests; empty for exhaustive runs.
    pub history: Vec<GenerationReport>,
}

#[derive(Clone, Debug, Serialize)]
pub enum SearchOutcome {
    Completed(SearchReport),
    Cancelled { evaluated: usize },
}

impl SearchOutcome {
    pub fn best(&self) -> Option<&OptimizerResult> {
        match self {
            SearchOutcome::Completed(report) => Some(&report.best),
            SearchOutcome::Cancelled { .. } => None,
        }
    }
}

pub(crate) fn log_cancelled(search: &str, evaluated: usize) -> SearchOutcome {
    info!(search, evaluated, "search cancelled");
    SearchOutcome::Cancelled { evaluated }
}

pub(crate) fn time_per_test(total: Duration, tests: usize) -> Duration {
    if tests == 0 {
        return Duration::ZERO;
    }
    total / tests.min(u32::MAX as usize) as u32
}
