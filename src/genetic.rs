use std::collections::HashSet;
use std::time::Instant;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use uuid::Uuid;

use crate::config::StrategyConfig;
use crate::error::SearchError;
use crate::metrics::SelectionMetric;
use crate::pipeline::{
    Candidate, CancelToken, Evaluator, OptimizerResult, SearchOutcome, SearchReport, WorkerPool,
    best_of, log_cancelled, time_per_test,
};
use crate::space::{FixedTraits, ParameterSpace, Trait};

/// Resamples of a duplicate before the search widens or gives up.
pub const DUPLICATE_RETRY_LIMIT: u32 = 100;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct GeneticSettings {
    pub parents: usize,
    pub children: usize,
    pub generations: usize,
    /// Upper bound of traits mutated per child.
    pub max_mutations: usize,
    pub seed: u64,
}

impl Default for GeneticSettings {
    fn default() -> Self {
        Self {
            parents: 10,
            children: 5,
            generations: 10,
            max_mutations: 1,
            seed: 20_240_101,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct LineageBest {
    pub lineage: Uuid,
    pub score: f64,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct GenerationReport {
    /// 0 for the initial parents.
    pub generation: usize,
    pub lineages: Vec<LineageBest>,
}

struct Lineage {
    id: Uuid,
    members: Vec<OptimizerResult>,
}

pub struct GeneticSearch {
    pub space: ParameterSpace,
    pub metric: SelectionMetric,
    pub settings: GeneticSettings,
}

impl GeneticSearch {
    pub fn new(space: ParameterSpace, metric: SelectionMetric, settings: GeneticSettings) -> Self {
        Self {
            space,
            metric,
            settings,
        }
    }

    fn unique_parent(&self, rng: &mut StdRng, seen: &mut HashSet<String>) -> Result<StrategyConfig, SearchError> {
        let none = FixedTraits::default();
        let mut cfg = self.space.sample(rng, &none)?;
        let mut counter = 0;
        while seen.contains(&cfg.fingerprint()) {
            if counter >= DUPLICATE_RETRY_LIMIT {
                debug!("no unique configuration for initial parent, accepting duplicate");
                break;
            }
            cfg = self.space.sample(rng, &none)?;
            counter += 1;
        }
        seen.insert(cfg.fingerprint());
        Ok(cfg)
    }

    /// Copies `parent` and redraws 1..=max_mutations of its free traits. While
    /// the result was already tried it is redrawn; every
    /// `DUPLICATE_RETRY_LIMIT` misses one more inherited trait is freed, and
    /// once none are left the duplicate is accepted.
    fn mutate(
        &self,
        rng: &mut StdRng,
        parent: &StrategyConfig,
        seen: &mut HashSet<String>,
    ) -> Result<StrategyConfig, SearchError> {
        let free = self.space.free_traits();
        if free.is_empty() {
            seen.insert(parent.fingerprint());
            return Ok(parent.clone());
        }

        let k = rng.random_range(1..=self.settings.max_mutations.clamp(1, free.len()));
        let mut inherited_traits = free.clone();
        let mut mutated: Vec<Trait> = Vec::with_capacity(k);
        for _ in 0..k {
            let i = rng.random_range(0..inherited_traits.len());
            mutated.push(inherited_traits.remove(i));
        }

        let mut inherited = FixedTraits::from_config(parent);
        for t in &mutated {
            inherited.clear(*t);
        }

        let mut cfg = self.space.sample(rng, &inherited)?;
        let mut counter = 0;
        while seen.contains(&cfg.fingerprint()) {
            if counter >= DUPLICATE_RETRY_LIMIT {
                if inherited_traits.is_empty() {
                    debug!("every trait already mutated without a new configuration, accepting duplicate");
                    break;
                }
                let i = rng.random_range(0..inherited_traits.len());
                let t = inherited_traits.remove(i);
                debug!(mutated = ?t, "no new configuration found, mutating an additional trait");
                inherited.clear(t);
                counter = 0;
            }
            cfg = self.space.sample(rng, &inherited)?;
            counter += 1;
        }
        seen.insert(cfg.fingerprint());
        Ok(cfg)
    }

    fn report(&self, generation: usize, lineages: &[Lineage]) -> GenerationReport {
        GenerationReport {
            generation,
            lineages: lineages
                .iter()
                .filter_map(|l| {
                    best_of(self.metric, &l.members).map(|b| LineageBest {
                        lineage: l.id,
                        score: b.score(),
                    })
                })
                .collect(),
        }
    }

    pub fn run<E: Evaluator + ?Sized>(
        &self,
        evaluator: &E,
        pool: WorkerPool,
        cancel: &CancelToken,
    ) -> Result<SearchOutcome, SearchError> {
        let started = Instant::now();
        let s = self.settings;
        let mut rng = StdRng::seed_from_u64(s.seed);
        let mut seen: HashSet<String> = HashSet::new();
        let mut evaluated = 0_usize;
        let mut failed = 0_usize;
        let mut history = Vec::with_capacity(s.generations + 1);

        info!(
            parents = s.parents,
            children = s.children,
            generations = s.generations,
            workers = pool.workers(),
            metric = %self.metric,
            "starting genetic search"
        );

        let mut parents = Vec::with_capacity(s.parents);
        for _ in 0..s.parents {
            let config = self.unique_parent(&mut rng, &mut seen)?;
            let lineage = uuid::Builder::from_random_bytes(rng.random()).into_uuid();
            parents.push(Candidate { lineage, config });
        }

        if cancel.is_cancelled() {
            drop(pool);
            return Ok(log_cancelled("genetic", evaluated));
        }
        let mut lineages: Vec<Lineage> = Vec::with_capacity(parents.len());
        for result in pool.evaluate_batch(evaluator, &parents) {
            evaluated += 1;
            match result {
                Ok(r) => lineages.push(Lineage {
                    id: r.lineage,
                    members: vec![r],
                }),
                Err(_) => failed += 1,
            }
        }
        history.push(self.report(0, &lineages));
        for (i, l) in lineages.iter().enumerate() {
            debug!("parent {}: {}", i + 1, l.members[0]);
        }
        if cancel.is_cancelled() {
            drop(pool);
            return Ok(log_cancelled("genetic", evaluated));
        }

        for generation in 1..=s.generations {
            let mut batch = Vec::with_capacity(lineages.len() * s.children);
            for l in &lineages {
                let Some(parent) = best_of(self.metric, &l.members) else {
                    continue;
                };
                let parent = parent.config.clone();
                for _ in 0..s.children {
                    let config = self.mutate(&mut rng, &parent, &mut seen)?;
                    batch.push(Candidate {
                        lineage: l.id,
                        config,
                    });
                }
            }

            if cancel.is_cancelled() {
                drop(pool);
                return Ok(log_cancelled("genetic", evaluated));
            }
            for result in pool.evaluate_batch(evaluator, &batch) {
                evaluated += 1;
                let Ok(r) = result else {
                    failed += 1;
                    continue;
                };
                if let Some(l) = lineages.iter_mut().find(|l| l.id == r.lineage) {
                    l.members.push(r);
                }
            }

            let report = self.report(generation, &lineages);
            let gen_best = report
                .lineages
                .iter()
                .map(|l| l.score)
                .fold(f64::NAN, |a, b| if self.metric.better(b, a) { b } else { a });
            info!(generation, evaluated, failed, best = gen_best, "generation finished");
            history.push(report);

            if cancel.is_cancelled() {
                drop(pool);
                return Ok(log_cancelled("genetic", evaluated));
            }
        }

        let best = best_of(self.metric, lineages.iter().flat_map(|l| l.members.iter()))
            .cloned()
            .ok_or(SearchError::NoViableCandidate)?;
        let total_time = started.elapsed();
        let per_test = time_per_test(total_time, evaluated);
        info!(
            evaluated,
            failed,
            total_secs = total_time.as_secs_f64(),
            per_test_secs = per_test.as_secs_f64(),
            "genetic search finished\n{best}"
        );
        Ok(SearchOutcome::Completed(SearchReport {
            best,
            evaluated,
            failed,
            time_per_test: per_test,
            total_time,
            history,
        }))
    }
}
