use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet, HashMap};

use chrono::{NaiveDate, NaiveTime, Weekday};
use tracing::{debug, warn};

use crate::config::{AggPeriod, CalcType, StrategyConfig};
use crate::error::AggregateError;
use crate::trades::{GapSeries, NewsCalendar, OptionRight, SourceTrades, TradeRow};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum RightSet {
    /// Puts and calls ranked together.
    Combined,
    /// Put-only and call-only tables pooled, so a slot can come from either.
    BestOfPutCall,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum GapSide {
    Up,
    Down,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Variant {
    pub rights: RightSet,
    pub gap: Option<GapSide>,
}

impl Variant {
    pub const COMBINED: Variant = Variant {
        rights: RightSet::Combined,
        gap: None,
    };

    pub fn new(rights: RightSet, gap: Option<GapSide>) -> Self {
        Self { rights, gap }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum WeekdayBucket {
    All,
    Day(Weekday),
}

/// Ranked entry-time scores, one row per aggregation period.
#[derive(Clone, Debug, PartialEq)]
pub struct AggregatedTable {
    pub period: AggPeriod,
    pub rows: BTreeMap<NaiveDate, Vec<(NaiveTime, f64)>>,
}

impl AggregatedTable {
    pub fn empty(period: AggPeriod) -> Self {
        Self {
            period,
            rows: BTreeMap::new(),
        }
    }

    /// Scores of the period containing `date`.
    pub fn row_for(&self, date: NaiveDate) -> Option<&[(NaiveTime, f64)]> {
        self.rows
            .get(&self.period.period_start(date))
            .map(Vec::as_slice)
    }
}

#[derive(Clone, Debug)]
pub struct SourceTable {
    /// Strategy/source the rows came from, without any right prefix.
    pub source: String,
    pub trades: Vec<TradeRow>,
    pub table: AggregatedTable,
}

impl SourceTable {
    pub fn trades_at(&self, at: chrono::NaiveDateTime) -> impl Iterator<Item = &TradeRow> {
        let start = self.trades.partition_point(|t| t.entry_time < at);
        self.trades[start..]
            .iter()
            .take_while(move |t| t.entry_time == at)
    }

    pub fn trades_on(&self, date: NaiveDate) -> &[TradeRow] {
        let start = self.trades.partition_point(|t| t.date() < date);
        let end = self.trades.partition_point(|t| t.date() <= date);
        &self.trades[start..end]
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct RankedTime {
    pub label: String,
    pub time: NaiveTime,
    pub value: f64,
}

/// variant -> weekday bucket -> source label -> rows and top-times table.
#[derive(Clone, Debug, Default)]
pub struct TradeRecordStore {
    buckets: HashMap<(Variant, WeekdayBucket), BTreeMap<String, SourceTable>>,
}

impl TradeRecordStore {
    pub fn insert(
        &mut self,
        variant: Variant,
        bucket: WeekdayBucket,
        label: impl Into<String>,
        table: SourceTable,
    ) {
        self.buckets
            .entry((variant, bucket))
            .or_default()
            .insert(label.into(), table);
    }

    pub fn sources(
        &self,
        variant: Variant,
        bucket: WeekdayBucket,
    ) -> Option<&BTreeMap<String, SourceTable>> {
        self.buckets.get(&(variant, bucket))
    }

    /// Unfiltered per-source data, used for date ranges and passthrough replay.
    pub fn combined(&self) -> Option<&BTreeMap<String, SourceTable>> {
        self.sources(Variant::COMBINED, WeekdayBucket::All)
    }

    pub fn is_empty(&self) -> bool {
        self.buckets.is_empty()
    }

    /// Best `n` entry times for the period containing `date`, across every
    /// source of the bucket (or only those of `only_source`).
    pub fn top_times(
        &self,
        variant: Variant,
        bucket: WeekdayBucket,
        date: NaiveDate,
        n: usize,
        threshold: Option<f64>,
        only_source: Option<&str>,
    ) -> Vec<RankedTime> {
        let Some(sources) = self.sources(variant, bucket) else {
            return Vec::new();
        };
        let mut ranked = Vec::new();
        for (label, st) in sources {
            if only_source.is_some_and(|s| s != st.source) {
                continue;
            }
            let Some(row) = st.table.row_for(date) else {
                continue;
            };
            for &(time, value) in row {
                if !value.is_finite() || threshold.is_some_and(|t| value <= t) {
                    continue;
                }
                ranked.push(RankedTime {
                    label: label.clone(),
                    time,
                    value,
                });
            }
        }
        ranked.sort_by(|a, b| {
            b.value
                .partial_cmp(&a.value)
                .unwrap_or(Ordering::Equal)
                .then_with(|| a.time.cmp(&b.time))
                .then_with(|| a.label.cmp(&b.label))
        });
        ranked.truncate(n);
        ranked
    }
}

/// One source file analysed under one configuration.
#[derive(Clone, Copy, Debug)]
pub struct AnalysisJob<'a> {
    pub source: &'a SourceTrades,
    pub config: &'a StrategyConfig,
}

/// Builds the trade record store a simulation reads its best times from.
pub trait Aggregator: Send + Sync {
    fn aggregate(
        &self,
        jobs: &[AnalysisJob<'_>],
        news: &NewsCalendar,
        gaps: Option<&GapSeries>,
    ) -> Result<TradeRecordStore, AggregateError>;
}

/// Weighted blend of a short and a long rolling mean of each entry time's
/// per-period score.
#[derive(Clone, Copy, Debug, Default)]
pub struct RollingAggregator;

impl Aggregator for RollingAggregator {
    fn aggregate(
        &self,
        jobs: &[AnalysisJob<'_>],
        news: &NewsCalendar,
        gaps: Option<&GapSeries>,
    ) -> Result<TradeRecordStore, AggregateError> {
        if jobs.is_empty() {
            return Err(AggregateError::NoSources);
        }
        let mut store = TradeRecordStore::default();
        for job in jobs {
            job.config.validate()?;
            if job.source.trades.is_empty() {
                return Err(AggregateError::NoTrades(job.source.label.clone()));
            }
            aggregate_source(&mut store, job, news, gaps);
        }
        Ok(store)
    }
}

fn gap_side(gaps: &GapSeries, date: NaiveDate, threshold: f64, use_percent: bool) -> Option<GapSide> {
    let reading = gaps.get(&date)?;
    let v = if use_percent {
        reading.percent
    } else {
        reading.points
    };
    if v > threshold {
        Some(GapSide::Up)
    } else if v < -threshold {
        Some(GapSide::Down)
    } else {
        None
    }
}

fn aggregate_source(
    store: &mut TradeRecordStore,
    job: &AnalysisJob<'_>,
    news: &NewsCalendar,
    gaps: Option<&GapSeries>,
) {
    let cfg = job.config;
    let src = job.source;

    let excluded = |t: &TradeRow| {
        cfg.exclusion_scope.applies_to_analysis()
            && (cfg.weekday_exclusions.contains(&t.weekday())
                || news.is_listed(&cfg.news_exclusions, t.date()))
    };

    let mut buckets = vec![WeekdayBucket::All];
    if cfg.per_weekday {
        let days: BTreeSet<u32> = src
            .trades
            .iter()
            .filter(|&t| !excluded(t))
            .map(|t| t.weekday().num_days_from_monday())
            .collect();
        buckets.extend(
            days.into_iter()
                .filter_map(|d| weekday_from_index(d))
                .filter(|wd| !cfg.weekday_exclusions.contains(wd))
                .map(WeekdayBucket::Day),
        );
    }

    let mut gap_sides: Vec<Option<GapSide>> = vec![None];
    if cfg.gap_filter.is_some() {
        if gaps.is_some() {
            gap_sides.extend([Some(GapSide::Up), Some(GapSide::Down)]);
        } else {
            warn!(source = %src.label, "gap filter configured without gap data, using plain variants");
        }
    }

    // (variant rights, right filter, label prefix)
    let mut right_sets: Vec<(RightSet, Option<OptionRight>, &str)> =
        vec![(RightSet::Combined, None, "")];
    if cfg.put_or_call {
        right_sets.push((RightSet::BestOfPutCall, Some(OptionRight::Put), "Put||"));
        right_sets.push((RightSet::BestOfPutCall, Some(OptionRight::Call), "Call||"));
    }

    for &gap in &gap_sides {
        for &(rights, right, prefix) in &right_sets {
            for &bucket in &buckets {
                let keep = |t: &TradeRow| {
                    right.is_none_or(|r| t.right == r)
                        && match bucket {
                            WeekdayBucket::All => true,
                            WeekdayBucket::Day(wd) => t.weekday() == wd,
                        }
                        && match (gap, cfg.gap_filter, gaps) {
                            (None, _, _) => true,
                            (Some(side), Some(f), Some(g)) => {
                                gap_side(g, t.date(), f.threshold, f.use_percent) == Some(side)
                            }
                            _ => false,
                        }
                };
                let trades: Vec<TradeRow> = src.trades.iter().filter(|&t| keep(t)).cloned().collect();
                let table = if cfg.passthrough {
                    AggregatedTable::empty(cfg.agg_period)
                } else {
                    let analysed: Vec<&TradeRow> = trades.iter().filter(|&t| !excluded(t)).collect();
                    build_table(&analysed, cfg)
                };
                debug!(
                    source = %src.label,
                    ?rights,
                    ?gap,
                    ?bucket,
                    trades = trades.len(),
                    periods = table.rows.len(),
                    "built top-times table"
                );
                store.insert(
                    Variant::new(rights, gap),
                    bucket,
                    format!("{prefix}{}", src.label),
                    SourceTable {
                        source: src.label.clone(),
                        trades,
                        table,
                    },
                );
            }
        }
    }
}

fn weekday_from_index(d: u32) -> Option<Weekday> {
    Weekday::try_from(d as u8).ok()
}

fn round_to(v: f64, digits: i32) -> f64 {
    let f = 10_f64.powi(digits);
    (v * f).round() / f
}

fn rolling_mean(values: &[Option<f64>], end: usize, window: usize) -> Option<f64> {
    let start = (end + 1).saturating_sub(window);
    let mut sum = 0.0;
    let mut n = 0_usize;
    for v in values[start..=end].iter().flatten() {
        sum += v;
        n += 1;
    }
    (n > 0).then(|| sum / n as f64)
}

/// Per-period, per-time weighted rolling score.
pub fn build_table(trades: &[&TradeRow], cfg: &StrategyConfig) -> AggregatedTable {
    let period = cfg.agg_period;
    let mut cells: BTreeMap<(NaiveDate, NaiveTime), (f64, f64)> = BTreeMap::new();
    for t in trades {
        let (num, den) = t.score_parts(cfg.calc_type);
        let cell = cells
            .entry((period.period_start(t.date()), t.time()))
            .or_insert((0.0, 0.0));
        cell.0 += num;
        cell.1 += den;
    }

    let periods: Vec<NaiveDate> = cells
        .keys()
        .map(|(p, _)| *p)
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect();
    let times: BTreeSet<NaiveTime> = cells.keys().map(|(_, t)| *t).collect();

    let short_n = period.periods_in_months(cfg.short_window);
    let long_n = period.periods_in_months(cfg.long_window);
    let w_short = cfg.short_weight as f64 / 100.0;
    let w_long = cfg.long_weight as f64 / 100.0;
    let digits = match cfg.calc_type {
        CalcType::Pcr => 4,
        CalcType::Pnl => 2,
    };

    let mut rows: BTreeMap<NaiveDate, Vec<(NaiveTime, f64)>> = BTreeMap::new();
    for time in times {
        let series: Vec<Option<f64>> = periods
            .iter()
            .map(|p| {
                cells.get(&(*p, time)).and_then(|&(num, den)| {
                    let v = num / den;
                    v.is_finite().then_some(v)
                })
            })
            .collect();
        for (i, p) in periods.iter().enumerate() {
            let short = rolling_mean(&series, i, short_n);
            let long = rolling_mean(&series, i, long_n);
            if let (Some(s), Some(l)) = (short, long) {
                rows.entry(*p)
                    .or_default()
                    .push((time, round_to(w_short * s + w_long * l, digits)));
            }
        }
    }

    AggregatedTable { period, rows }
}
