//! Walk-forward backtester for best-entry-time option strategies, plus
//! exhaustive and genetic searches over its configuration space.

pub mod aggregate;
pub mod config;
pub mod error;
pub mod exclusion;
pub mod exhaustive;
pub mod export;
pub mod genetic;
pub mod metrics;
pub mod pipeline;
pub mod simulator;
pub mod space;
pub mod trades;
pub mod tranche;
