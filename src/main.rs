use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use chrono::{NaiveDate, Utc, Weekday};
use clap::{Parser, Subcommand};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::{Value, json};
use tracing::{info, warn};

use tranche_optimizer::aggregate::{Aggregator, RollingAggregator};
use tranche_optimizer::config::StrategyConfig;
use tranche_optimizer::exclusion::DEFAULT_TRADING_WEEKDAYS;
use tranche_optimizer::exhaustive::{DEFAULT_CHUNK_SIZE, ExhaustiveSearch};
use tranche_optimizer::export::export_output;
use tranche_optimizer::genetic::{GeneticSearch, GeneticSettings};
use tranche_optimizer::metrics::{PerformanceMetrics, SelectionMetric};
use tranche_optimizer::pipeline::{CancelToken, EvaluationPipeline, SearchOutcome, WorkerPool};
use tranche_optimizer::simulator::{PortfolioSimulator, SimulationOptions, StrategySet};
use tranche_optimizer::space::{FixedTraits, ParameterSpace, SearchDomain, SearchPlan, Trait};
use tranche_optimizer::trades::{GapSeries, NewsCalendar, load_gaps, load_trade_log, load_trade_logs};

#[derive(Parser, Debug)]
#[command(author, version, about = "Best entry-time walk-forward tester and optimizer")]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Walk-forward test of one configuration or a portfolio.
    Simulate(SimulateArgs),
    /// Search the configuration space of one trade log.
    Optimize(OptimizeArgs),
}

#[derive(clap::Args, Debug)]
struct SimulateArgs {
    #[arg(long, required = true, num_args = 1..)]
    trades: Vec<PathBuf>,
    /// `{"single": {...}}` or `{"portfolio": {"<file stem>": {...}}}`
    #[arg(long)]
    strategies: PathBuf,
    #[arg(long)]
    news: Option<PathBuf>,
    #[arg(long)]
    gaps: Option<PathBuf>,
    #[arg(long)]
    start: Option<NaiveDate>,
    #[arg(long)]
    end: Option<NaiveDate>,
    #[arg(long, default_value_t = 100_000.0)]
    initial_value: f64,
    #[arg(long)]
    no_scaling: bool,
    /// Trading weekdays, e.g. `Mon,Tue,Wed`.
    #[arg(long, value_delimiter = ',')]
    weekdays: Option<Vec<Weekday>>,
    #[arg(long)]
    export_dir: Option<PathBuf>,
    #[arg(long, default_value = "simulation_result.json")]
    out: PathBuf,
}

#[derive(clap::Args, Debug)]
struct OptimizeArgs {
    #[arg(long)]
    trades: PathBuf,
    /// Settings that are not searched, and the values of `--static-*` traits.
    #[arg(long)]
    template: Option<PathBuf>,
    #[arg(long)]
    news: Option<PathBuf>,
    #[arg(long)]
    gaps: Option<PathBuf>,
    #[arg(long)]
    exhaustive: bool,
    #[arg(long, default_value_t = 10)]
    parents: usize,
    #[arg(long, default_value_t = 5)]
    children: usize,
    #[arg(long, default_value_t = 10)]
    generations: usize,
    #[arg(long, default_value_t = 1)]
    mutations: usize,
    #[arg(long, default_value = "MAR")]
    metric: SelectionMetric,
    #[arg(long, default_value_t = 15)]
    max_tranches: u32,
    #[arg(long, default_value_t = 5)]
    weight_step: u32,
    #[arg(long, default_value_t = 12)]
    max_window: u32,
    #[arg(long)]
    static_tranches: bool,
    #[arg(long)]
    static_calc_type: bool,
    #[arg(long)]
    static_agg: bool,
    #[arg(long)]
    static_put_or_call: bool,
    #[arg(long)]
    static_weekday: bool,
    /// Only the short average counts: long window pinned at 12 months with 0% weight.
    #[arg(long)]
    single_avg: bool,
    #[arg(long, default_value_t = DEFAULT_CHUNK_SIZE)]
    chunk_size: usize,
    #[arg(long, default_value_t = 20240101)]
    seed: u64,
    #[arg(long)]
    workers: Option<usize>,
    #[arg(long, default_value_t = 100_000.0)]
    initial_value: f64,
    #[arg(long)]
    start: Option<NaiveDate>,
    /// Seconds per evaluation used for the up-front run-time estimate.
    #[arg(long, default_value_t = 15.0)]
    time_per_test: f64,
    #[arg(long, default_value = "optimizer_result.json")]
    out: PathBuf,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "snake_case")]
enum StrategiesFile {
    Single(StrategyConfig),
    Portfolio(BTreeMap<String, StrategyConfig>),
}

fn read_json<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let raw = fs::read_to_string(path).with_context(|| format!("failed to read {}", path.display()))?;
    serde_json::from_str(&raw).with_context(|| format!("failed to parse {}", path.display()))
}

fn load_strategies(path: &Path) -> Result<StrategySet> {
    let set = match read_json::<StrategiesFile>(path)? {
        StrategiesFile::Single(cfg) => StrategySet::single(cfg),
        StrategiesFile::Portfolio(members) => {
            if members.is_empty() {
                bail!("{} lists no portfolio members", path.display());
            }
            StrategySet::Portfolio(members)
        }
    };
    for cfg in set.configs() {
        cfg.validate()
            .with_context(|| format!("invalid strategy in {}: {cfg}", path.display()))?;
    }
    Ok(set)
}

fn load_news(path: Option<&Path>) -> Result<NewsCalendar> {
    match path {
        Some(p) => NewsCalendar::from_json_file(p),
        None => Ok(NewsCalendar::default()),
    }
}

fn load_gap_series(path: Option<&Path>) -> Result<Option<GapSeries>> {
    path.map(load_gaps).transpose()
}

fn metrics_json(metrics: &PerformanceMetrics) -> Value {
    json!({
        "final_value": metrics.final_value,
        "total_return": metrics.total_return,
        "cagr": metrics.cagr,
        "sharpe": metrics.sharpe,
        "mar": metrics.mar,
        "drawdown_pct": metrics.drawdown_pct,
        "days_in_drawdown": metrics.days_in_drawdown,
        "largest_month": metrics.largest_month,
        "smallest_month": metrics.smallest_month,
        "max_win_streak": metrics.max_win_streak,
        "max_loss_streak": metrics.max_loss_streak,
        "trading_days": metrics.trading_days,
    })
}

fn write_payload(out: &Path, payload: &Value) -> Result<()> {
    fs::write(out, serde_json::to_string_pretty(payload)?)
        .with_context(|| format!("failed to write {}", out.display()))?;
    info!(path = %out.display(), "saved result");
    Ok(())
}

fn simulate(args: SimulateArgs) -> Result<()> {
    let sources = load_trade_logs(&args.trades);
    if sources.is_empty() {
        bail!("none of the {} trade logs could be loaded", args.trades.len());
    }
    let news = load_news(args.news.as_deref())?;
    let gaps = load_gap_series(args.gaps.as_deref())?;
    let strategies = load_strategies(&args.strategies)?;
    let options = SimulationOptions {
        start: args.start,
        end: args.end,
        initial_value: args.initial_value,
        use_scaling: !args.no_scaling,
        trading_weekdays: args
            .weekdays
            .unwrap_or_else(|| DEFAULT_TRADING_WEEKDAYS.to_vec()),
    };

    let jobs = strategies.jobs(&sources)?;
    let store = RollingAggregator
        .aggregate(&jobs, &news, gaps.as_ref())
        .context("failed to build top-times tables")?;
    let output = PortfolioSimulator::new(&store, &news, gaps.as_ref(), &options)
        .run(&strategies)
        .context("walk-forward test failed")?;

    let mut lanes = Vec::new();
    for curve in &output.curves {
        let metrics = match PerformanceMetrics::from_curve(&curve.rows) {
            Ok(m) => {
                info!(
                    lane = %curve.name,
                    final_value = m.final_value,
                    cagr = m.cagr,
                    drawdown = m.drawdown_pct,
                    mar = m.mar,
                    "lane result"
                );
                Some(metrics_json(&m))
            }
            Err(e) => {
                warn!(lane = %curve.name, error = %e, "no metrics for lane");
                None
            }
        };
        lanes.push(json!({
            "lane": curve.name,
            "days": curve.rows.len(),
            "trades": curve.trades.len(),
            "metrics": metrics,
        }));
    }

    let exported = match &args.export_dir {
        Some(dir) => export_output(dir, &output)?,
        None => Vec::new(),
    };

    let payload = json!({
        "generated_at_utc": Utc::now().to_rfc3339(),
        "trade_logs": args.trades,
        "portfolio_mode": strategies.is_portfolio(),
        "window": output.window,
        "options": options,
        "lanes": lanes,
        "exported": exported,
    });
    write_payload(&args.out, &payload)
}

fn static_traits(args: &OptimizeArgs, template: &StrategyConfig) -> FixedTraits {
    let mut picked = Vec::new();
    for (flag, t) in [
        (args.static_tranches, Trait::Tranches),
        (args.static_calc_type, Trait::CalcType),
        (args.static_agg, Trait::AggPeriod),
        (args.static_put_or_call, Trait::PutOrCall),
        (args.static_weekday, Trait::PerWeekday),
    ] {
        if flag {
            picked.push(t);
        }
    }
    let statics = FixedTraits::pick(template, &picked);
    if args.single_avg {
        statics.single_average()
    } else {
        statics
    }
}

fn optimize(args: OptimizeArgs) -> Result<()> {
    if args.time_per_test < 0.0 || !args.time_per_test.is_finite() {
        bail!("--time-per-test must be a non-negative number of seconds");
    }
    let source = load_trade_log(&args.trades)
        .with_context(|| format!("failed to load {}", args.trades.display()))?;
    let news = load_news(args.news.as_deref())?;
    let gaps = load_gap_series(args.gaps.as_deref())?;
    let template: StrategyConfig = match &args.template {
        Some(p) => read_json(p)?,
        None => StrategyConfig::default(),
    };

    let domain = SearchDomain {
        max_window: args.max_window,
        weight_step: args.weight_step,
        max_tranches: args.max_tranches,
    };
    let statics = static_traits(&args, &template);
    let space = ParameterSpace::new(domain, statics, template)?;

    let options = SimulationOptions {
        start: args.start,
        initial_value: args.initial_value,
        ..SimulationOptions::default()
    };
    let pipeline = EvaluationPipeline::new(source, news, gaps, options, args.metric);
    let pool = WorkerPool::new(args.workers)?;
    let cancel = CancelToken::new();
    if let Err(e) = cancel.cancel_on_ctrl_c() {
        warn!(error = %e, "ctrl-c will not cancel this run");
    }

    let per_test = Duration::from_secs_f64(args.time_per_test);
    let plan = if args.exhaustive {
        SearchPlan::exhaustive(&space, per_test)
    } else {
        SearchPlan::genetic(&space, args.parents as u32, args.children as u32, args.generations as u32, per_test)
    };
    info!(
        source = %pipeline.source.label,
        start = ?pipeline.options.start,
        possible = plan.total_possible,
        tests = plan.total_tests,
        eta = %plan.eta_label(),
        "search plan"
    );

    let (algorithm, outcome) = if args.exhaustive {
        let search = ExhaustiveSearch {
            chunk_size: args.chunk_size,
            ..ExhaustiveSearch::new(space, args.metric)
        };
        ("exhaustive", search.run(&pipeline, pool, &cancel)?)
    } else {
        let settings = GeneticSettings {
            parents: args.parents,
            children: args.children,
            generations: args.generations,
            max_mutations: args.mutations,
            seed: args.seed,
        };
        let search = GeneticSearch::new(space, args.metric, settings);
        ("genetic", search.run(&pipeline, pool, &cancel)?)
    };

    let SearchOutcome::Completed(report) = outcome else {
        warn!("optimizer cancelled before finishing");
        return Ok(());
    };

    let payload = json!({
        "generated_at_utc": Utc::now().to_rfc3339(),
        "trade_log": args.trades,
        "algorithm": algorithm,
        "selection_metric": args.metric.name(),
        "seed": args.seed,
        "start": pipeline.options.start,
        "plan": plan,
        "evaluated": report.evaluated,
        "failed": report.failed,
        "time_per_test_secs": report.time_per_test.as_secs_f64(),
        "total_time_secs": report.total_time.as_secs_f64(),
        "best": {
            "lineage": report.best.lineage,
            "score": report.best.score(),
            "config": report.best.config,
            "metrics": report.best.metrics.as_ref().map(metrics_json),
        },
        "history": report.history,
    });
    write_payload(&args.out, &payload)?;
    println!("\nBest configuration:\n{}", report.best);
    Ok(())
}

fn main() -> Result<()> {
    let subscriber = tracing_subscriber::FmtSubscriber::builder()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .finish();
    if let Err(e) = tracing::subscriber::set_global_default(subscriber) {
        eprintln!("failed to install tracing subscriber: {e}");
    }

    let args = Args::parse();
    match args.command {
        Command::Simulate(a) => simulate(a),
        Command::Optimize(a) => optimize(a),
    }
}
