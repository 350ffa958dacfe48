use std::time::Instant;

use tracing::info;
use uuid::Uuid;

use crate::error::SearchError;
use crate::metrics::SelectionMetric;
use crate::pipeline::{
    Candidate, CancelToken, Evaluator, OptimizerResult, SearchOutcome, SearchReport, WorkerPool,
    log_cancelled, time_per_test,
};
use crate::space::ParameterSpace;

pub const DEFAULT_CHUNK_SIZE: usize = 24;

/// Evaluates every configuration of the space and keeps the best.
pub struct ExhaustiveSearch {
    pub space: ParameterSpace,
    pub metric: SelectionMetric,
    pub chunk_size: usize,
}

impl ExhaustiveSearch {
    pub fn new(space: ParameterSpace, metric: SelectionMetric) -> Self {
        Self {
            space,
            metric,
            chunk_size: DEFAULT_CHUNK_SIZE,
        }
    }

    pub fn run<E: Evaluator + ?Sized>(
        &self,
        evaluator: &E,
        pool: WorkerPool,
        cancel: &CancelToken,
    ) -> Result<SearchOutcome, SearchError> {
        let started = Instant::now();
        let configs = self.space.enumerate()?;
        if configs.is_empty() {
            return Err(SearchError::EmptyDomain);
        }
        let chunk_size = self.chunk_size.max(1);
        let chunks = configs.len().div_ceil(chunk_size);
        info!(
            candidates = configs.len(),
            chunks,
            workers = pool.workers(),
            metric = %self.metric,
            "starting exhaustive search"
        );

        let mut best: Option<OptimizerResult> = None;
        let mut evaluated = 0_usize;
        let mut failed = 0_usize;
        for (i, chunk) in configs.chunks(chunk_size).enumerate() {
            if cancel.is_cancelled() {
                drop(pool);
                return Ok(log_cancelled("exhaustive", evaluated));
            }
            let batch: Vec<Candidate> = chunk
                .iter()
                .map(|config| Candidate {
                    lineage: Uuid::new_v4(),
                    config: config.clone(),
                })
                .collect();

            for result in pool.evaluate_batch(evaluator, &batch) {
                evaluated += 1;
                let Ok(r) = result else {
                    failed += 1;
                    continue;
                };
                let replace = best
                    .as_ref()
                    .is_none_or(|b| self.metric.better(r.score(), b.score()));
                if replace {
                    best = Some(r);
                }
            }
            info!(
                chunk = i + 1,
                chunks,
                evaluated,
                failed,
                best = best.as_ref().map(|b| b.score()).unwrap_or(f64::NAN),
                "exhaustive progress"
            );

            if cancel.is_cancelled() {
                drop(pool);
                return Ok(log_cancelled("exhaustive", evaluated));
            }
        }

        let best = best.ok_or(SearchError::NoViableCandidate)?;
        let total_time = started.elapsed();
        info!(
            evaluated,
            failed,
            total_secs = total_time.as_secs_f64(),
            "exhaustive search finished\n{best}"
        );
        Ok(SearchOutcome::Completed(SearchReport {
            best,
            evaluated,
            failed,
            time_per_test: time_per_test(total_time, evaluated),
            total_time,
            history: Vec::new(),
        }))
    }
}
