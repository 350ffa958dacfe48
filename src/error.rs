use std::path::PathBuf;

use thiserror::Error;
use uuid::Uuid;

/// Trade log files whose layout cannot be used.
#[derive(Debug, Error)]
pub enum DataShapeError {
    #[error("unrecognized trade log schema in {path}: first column is {first_column:?}")]
    UnknownSchema { path: PathBuf, first_column: String },

    #[error("missing column {column:?} in {path}")]
    MissingColumn { path: PathBuf, column: String },

    #[error("trade log {path} holds no trades")]
    Empty { path: PathBuf },

    #[error(transparent)]
    Csv(#[from] csv::Error),
}

/// Strategy settings that break an invariant.
#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("weights must sum to 100, got {short} + {long}")]
    WeightSum { short: u32, long: u32 },

    #[error("short window {short} exceeds long window {long}")]
    WindowOrder { short: u32, long: u32 },

    #[error("averaging windows must be at least one period, got {short}/{long}")]
    NonPositiveWindow { short: u32, long: u32 },

    #[error("tranche bounds out of order: min={min} tranches={tranches} max={max}")]
    TrancheBounds { min: u32, tranches: u32, max: u32 },

    #[error("capital per contract must be positive, got {0}")]
    CapitalPerContract(f64),

    #[error("portfolio weight must be within (0, 100], got {0}")]
    PortfolioWeight(f64),
}

#[derive(Debug, Error, PartialEq)]
pub enum AggregateError {
    #[error("no trade sources to aggregate")]
    NoSources,

    #[error("source {0:?} has no trades")]
    NoTrades(String),

    #[error(transparent)]
    Config(#[from] ConfigError),
}

#[derive(Debug, Error)]
pub enum SimulationError {
    #[error("no strategies to simulate")]
    NoStrategies,

    #[error("trade record store has no combined data for source {0:?}")]
    MissingSource(String),

    #[error("trade record store is empty")]
    EmptyStore,

    #[error("simulation window is empty: {start} > {end}")]
    EmptyWindow {
        start: chrono::NaiveDate,
        end: chrono::NaiveDate,
    },
}

#[derive(Debug, Error, PartialEq)]
pub enum MetricsError {
    #[error("equity curve has no rows")]
    EmptyCurve,

    #[error("initial value must be non-zero")]
    ZeroInitialValue,
}

/// Pipeline stages, in execution order.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Stage {
    Aggregate,
    Simulate,
    Score,
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Stage::Aggregate => "aggregate",
            Stage::Simulate => "simulate",
            Stage::Score => "score",
        };
        f.write_str(s)
    }
}

/// A candidate that failed inside one of its stages. Carried back to the
/// orchestrator as a value so the rest of the batch keeps going.
#[derive(Debug, Error)]
#[error("candidate {lineage} failed in {stage} stage: {message}")]
pub struct PipelineError {
    pub stage: Stage,
    pub lineage: Uuid,
    pub message: String,
}

#[derive(Debug, Error)]
pub enum SearchError {
    #[error("no candidate produced a usable score")]
    NoViableCandidate,

    #[error("search domain is empty")]
    EmptyDomain,

    #[error("failed to build worker pool: {0}")]
    Pool(#[from] rayon::ThreadPoolBuildError),

    #[error("invalid configuration in search space: {0}")]
    Config(#[from] ConfigError),
}
