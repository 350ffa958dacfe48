use std::collections::BTreeMap;

use chrono::{Datelike, Months, NaiveDate, NaiveDateTime, Weekday};
use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use crate::aggregate::{AnalysisJob, GapSide, RightSet, TradeRecordStore, Variant, WeekdayBucket};
use crate::config::{StrategyConfig, first_of_month, weekday_label};
use crate::error::SimulationError;
use crate::exclusion::{DEFAULT_TRADING_WEEKDAYS, DayExclusionPolicy};
use crate::trades::{GapSeries, NewsCalendar, OptionRight, SourceTrades, TradeRow};
use crate::tranche::{TrancheAllocation, allocate};

pub const PORTFOLIO_LANE: &str = "Portfolio";

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SimulationOptions {
    pub start: Option<NaiveDate>,
    pub end: Option<NaiveDate>,
    pub initial_value: f64,
    /// Size tranches from current capital instead of one contract per slot.
    pub use_scaling: bool,
    pub trading_weekdays: Vec<Weekday>,
}

impl Default for SimulationOptions {
    fn default() -> Self {
        Self {
            start: None,
            end: None,
            initial_value: 100_000.0,
            use_scaling: true,
            trading_weekdays: DEFAULT_TRADING_WEEKDAYS.to_vec(),
        }
    }
}

/// What one simulation run trades.
#[derive(Clone, Debug, PartialEq)]
pub enum StrategySet {
    /// One configuration over every loaded source, run as several lanes.
    Single(StrategyConfig),
    /// Source label -> that source's configuration.
    Portfolio(BTreeMap<String, StrategyConfig>),
}

impl StrategySet {
    /// Passthrough only means something for a portfolio member.
    pub fn single(cfg: StrategyConfig) -> Self {
        StrategySet::Single(StrategyConfig {
            passthrough: false,
            ..cfg
        })
    }

    pub fn is_portfolio(&self) -> bool {
        matches!(self, StrategySet::Portfolio(_))
    }

    pub fn configs(&self) -> Vec<&StrategyConfig> {
        match self {
            StrategySet::Single(cfg) => vec![cfg],
            StrategySet::Portfolio(members) => members.values().collect(),
        }
    }

    pub fn max_window(&self) -> u32 {
        self.configs()
            .iter()
            .map(|c| c.max_window())
            .max()
            .unwrap_or(1)
    }

    /// Pairs each source with the configuration it is analysed under.
    pub fn jobs<'a>(
        &'a self,
        sources: &'a [SourceTrades],
    ) -> Result<Vec<AnalysisJob<'a>>, SimulationError> {
        match self {
            StrategySet::Single(config) => {
                if sources.is_empty() {
                    return Err(SimulationError::EmptyStore);
                }
                Ok(sources
                    .iter()
                    .map(|source| AnalysisJob { source, config })
                    .collect())
            }
            StrategySet::Portfolio(members) => {
                if members.is_empty() {
                    return Err(SimulationError::NoStrategies);
                }
                members
                    .iter()
                    .map(|(label, config)| {
                        let source = sources
                            .iter()
                            .find(|s| &s.label == label)
                            .ok_or_else(|| SimulationError::MissingSource(label.clone()))?;
                        Ok(AnalysisJob { source, config })
                    })
                    .collect()
            }
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DailyResultRow {
    pub date: NaiveDate,
    pub current_value: f64,
    pub peak_value: f64,
    pub max_drawdown: f64,
    pub current_drawdown: f64,
    pub drawdown_days: u32,
    pub day_pnl: f64,
    pub win_streak: u32,
    pub loss_streak: u32,
    pub initial_value: f64,
    pub weekday: String,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct LoggedTrade {
    pub source: String,
    pub entry_time: NaiveDateTime,
    pub right: OptionRight,
    pub premium: f64,
    pub quantity: u32,
    pub pnl: f64,
}

/// Running state of one lane.
#[derive(Clone, Debug)]
pub struct SimulationState {
    pub current_value: f64,
    pub peak_value: f64,
    pub current_drawdown: f64,
    pub max_drawdown: f64,
    pub drawdown_days: u32,
    pub win_streak: u32,
    pub loss_streak: u32,
    pub day_pnl: f64,
    pub tranches: TrancheAllocation,
    /// Sizing of this member's contribution to the aggregate portfolio.
    pub portfolio_tranches: TrancheAllocation,
    pub trade_log: Vec<LoggedTrade>,
    /// Every trade the lane would have taken, warm or not, skipped or not.
    pub warmup_log: Vec<TradeRow>,
}

impl SimulationState {
    pub fn new(initial_value: f64) -> Self {
        Self {
            current_value: initial_value,
            peak_value: initial_value,
            current_drawdown: 0.0,
            max_drawdown: 0.0,
            drawdown_days: 0,
            win_streak: 0,
            loss_streak: 0,
            day_pnl: 0.0,
            tranches: TrancheAllocation::default(),
            portfolio_tranches: TrancheAllocation::default(),
            trade_log: Vec::new(),
            warmup_log: Vec::new(),
        }
    }

    fn apply(&mut self, fills: &[Fill<'_>], live: bool) {
        for f in fills {
            self.warmup_log.push(f.row.clone());
            if !live {
                continue;
            }
            let pnl = f.row.pnl_at(f.quantity);
            self.current_value += pnl;
            self.day_pnl += pnl;
            self.trade_log.push(LoggedTrade {
                source: f.source.to_string(),
                entry_time: f.row.entry_time,
                right: f.row.right,
                premium: f.row.premium,
                quantity: f.quantity,
                pnl,
            });
        }
    }

    /// Updates peak, drawdown and streaks for a simulated day.
    pub fn close_day(&mut self, date: NaiveDate, initial_value: f64) -> DailyResultRow {
        if self.current_value >= self.peak_value {
            self.peak_value = self.current_value;
            self.current_drawdown = 0.0;
            self.drawdown_days = 0;
        } else {
            let dd = if self.peak_value > 0.0 {
                (self.peak_value - self.current_value) / self.peak_value
            } else {
                0.0
            };
            self.current_drawdown = dd;
            self.max_drawdown = self.max_drawdown.max(dd);
            self.drawdown_days += 1;
        }

        if self.day_pnl > 0.0 {
            self.win_streak += 1;
            self.loss_streak = 0;
        } else if self.day_pnl < 0.0 {
            self.win_streak = 0;
            self.loss_streak += 1;
        }

        DailyResultRow {
            date,
            current_value: self.current_value,
            peak_value: self.peak_value,
            max_drawdown: self.max_drawdown,
            current_drawdown: self.current_drawdown,
            drawdown_days: self.drawdown_days,
            day_pnl: self.day_pnl,
            win_streak: self.win_streak,
            loss_streak: self.loss_streak,
            initial_value,
            weekday: weekday_label(date),
        }
    }

    /// A skipped day still counts toward an open drawdown.
    pub fn note_skipped_day(&mut self) {
        if self.drawdown_days > 0 {
            self.drawdown_days += 1;
        }
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct EquityCurve {
    pub name: String,
    pub rows: Vec<DailyResultRow>,
    pub trades: Vec<LoggedTrade>,
}

/// Key dates of a run.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SimulationWindow {
    pub data_start: NaiveDate,
    pub data_end: NaiveDate,
    pub warm_start: NaiveDate,
    pub test_start: NaiveDate,
    /// First day whose trades count.
    pub warm_up_threshold: NaiveDate,
    /// First day replayed; earlier than the threshold when the warm-up log
    /// needs filling.
    pub replay_start: NaiveDate,
    pub end: NaiveDate,
    pub max_window: u32,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SimulationOutput {
    pub window: SimulationWindow,
    pub curves: Vec<EquityCurve>,
}

impl SimulationOutput {
    pub fn curve(&self, name: &str) -> Option<&EquityCurve> {
        self.curves.iter().find(|c| c.name == name)
    }

    /// `Portfolio` in portfolio mode, `All-Combined` otherwise.
    pub fn primary(&self) -> Option<&EquityCurve> {
        self.curves.first()
    }
}

struct Lane<'c> {
    name: String,
    config: &'c StrategyConfig,
    rights: RightSet,
    per_weekday: bool,
    gap: bool,
    source: Option<&'c str>,
    passthrough: bool,
    state: SimulationState,
}

struct Fill<'s> {
    source: &'s str,
    row: &'s TradeRow,
    quantity: u32,
}

pub struct PortfolioSimulator<'a> {
    store: &'a TradeRecordStore,
    news: &'a NewsCalendar,
    gaps: Option<&'a GapSeries>,
    options: &'a SimulationOptions,
}

impl<'a> PortfolioSimulator<'a> {
    pub fn new(
        store: &'a TradeRecordStore,
        news: &'a NewsCalendar,
        gaps: Option<&'a GapSeries>,
        options: &'a SimulationOptions,
    ) -> Self {
        Self {
            store,
            news,
            gaps,
            options,
        }
    }

    pub fn plan_window(&self, strategies: &StrategySet) -> Result<SimulationWindow, SimulationError> {
        let combined = self.store.combined().ok_or(SimulationError::EmptyStore)?;

        // (first, last, passthrough)
        let mut spans = Vec::new();
        match strategies {
            StrategySet::Single(_) => {
                for st in combined.values() {
                    spans.push((st.trades.first(), st.trades.last(), false));
                }
            }
            StrategySet::Portfolio(members) => {
                if members.is_empty() {
                    return Err(SimulationError::NoStrategies);
                }
                for (label, cfg) in members {
                    let st = combined
                        .get(label)
                        .ok_or_else(|| SimulationError::MissingSource(label.clone()))?;
                    spans.push((st.trades.first(), st.trades.last(), cfg.passthrough));
                }
            }
        }

        let mut data_start: Option<NaiveDate> = None;
        let mut passthrough_start = NaiveDate::MIN;
        let mut data_end: Option<NaiveDate> = None;
        for (first, last, passthrough) in spans {
            let (Some(first), Some(last)) = (first, last) else {
                continue;
            };
            if passthrough {
                passthrough_start = passthrough_start.max(first.date());
            } else {
                data_start = Some(data_start.map_or(first.date(), |d| d.max(first.date())));
            }
            data_end = Some(data_end.map_or(last.date(), |d| d.min(last.date())));
        }
        let data_start = data_start
            .or((passthrough_start > NaiveDate::MIN).then_some(passthrough_start))
            .ok_or(SimulationError::EmptyStore)?;
        let data_end = data_end.ok_or(SimulationError::EmptyStore)?;

        let max_window = strategies.max_window();
        let warm_start = first_of_month(data_start + Months::new(max_window));
        let test_start = self.options.start.unwrap_or(warm_start);
        let end = self.options.end.unwrap_or(data_end);

        let auto = strategies.configs().iter().any(|c| c.auto_exclusions);
        let mut threshold = if auto {
            test_start.max(warm_start + Months::new(max_window))
        } else {
            test_start
        };
        threshold = threshold.max(passthrough_start);
        let replay_start = if auto {
            warm_start
        } else {
            test_start.max(passthrough_start)
        };

        if replay_start > end {
            return Err(SimulationError::EmptyWindow {
                start: replay_start,
                end,
            });
        }
        Ok(SimulationWindow {
            data_start,
            data_end,
            warm_start,
            test_start,
            warm_up_threshold: threshold,
            replay_start,
            end,
            max_window,
        })
    }

    fn lanes<'c>(&self, strategies: &'c StrategySet) -> Vec<Lane<'c>> {
        let initial = self.options.initial_value;
        match strategies {
            StrategySet::Single(cfg) => {
                let mut kinds = vec![("All-Combined", RightSet::Combined, false)];
                if cfg.per_weekday {
                    kinds.push(("Weekday-Combined", RightSet::Combined, true));
                }
                if cfg.put_or_call {
                    kinds.push(("All-BestPC", RightSet::BestOfPutCall, false));
                }
                if cfg.per_weekday && cfg.put_or_call {
                    kinds.push(("Weekday-BestPC", RightSet::BestOfPutCall, true));
                }
                let mut gaps = vec![false];
                if cfg.gap_filter.is_some() {
                    gaps.push(true);
                }
                gaps.into_iter()
                    .flat_map(|gap| {
                        kinds.iter().map(move |&(name, rights, per_weekday)| Lane {
                            name: if gap {
                                format!("{name}-Gap")
                            } else {
                                name.to_string()
                            },
                            config: cfg,
                            rights,
                            per_weekday,
                            gap,
                            source: None,
                            passthrough: false,
                            state: SimulationState::new(initial),
                        })
                    })
                    .collect()
            }
            StrategySet::Portfolio(members) => members
                .iter()
                .map(|(label, cfg)| Lane {
                    name: label.clone(),
                    config: cfg,
                    rights: if cfg.put_or_call {
                        RightSet::BestOfPutCall
                    } else {
                        RightSet::Combined
                    },
                    per_weekday: cfg.per_weekday,
                    gap: cfg.gap_filter.is_some(),
                    source: Some(label.as_str()),
                    passthrough: cfg.passthrough,
                    state: SimulationState::new(initial),
                })
                .collect(),
        }
    }

    fn gap_today(&self, cfg: &StrategyConfig, date: NaiveDate) -> Option<GapSide> {
        let filter = cfg.gap_filter?;
        let reading = self.gaps?.get(&date)?;
        let v = if filter.use_percent {
            reading.percent
        } else {
            reading.points
        };
        if v > filter.threshold {
            Some(GapSide::Up)
        } else if v < -filter.threshold {
            Some(GapSide::Down)
        } else {
            None
        }
    }

    /// Trades `lane` takes on `date` with the given sizing.
    fn fills(
        &self,
        lane: &Lane<'_>,
        date: NaiveDate,
        allocation: &TrancheAllocation,
        sizing_value: f64,
    ) -> Vec<Fill<'a>> {
        let cfg = lane.config;

        if lane.passthrough {
            let Some(st) = lane
                .source
                .and_then(|s| self.store.combined().and_then(|m| m.get(s)))
            else {
                return Vec::new();
            };
            let rows = st.trades_on(date);
            let mut times: Vec<NaiveDateTime> = rows.iter().map(|r| r.entry_time).collect();
            times.dedup();
            let quantity = if self.options.use_scaling && !times.is_empty() {
                let total = sizing_value * cfg.portfolio_weight / 100.0 / cfg.capital_per_contract;
                ((total / times.len() as f64).floor() as i64).max(1) as u32
            } else {
                1
            };
            return rows
                .iter()
                .map(|row| Fill {
                    source: st.source.as_str(),
                    row,
                    quantity,
                })
                .collect();
        }

        let gap = if lane.gap { self.gap_today(cfg, date) } else { None };
        let variant = Variant::new(lane.rights, gap);
        let bucket = if lane.per_weekday {
            WeekdayBucket::Day(date.weekday())
        } else {
            WeekdayBucket::All
        };
        let Some(sources) = self.store.sources(variant, bucket) else {
            return Vec::new();
        };
        let ranked = self.store.top_times(
            variant,
            bucket,
            cfg.agg_period.lookback_date(date),
            allocation.tranches(),
            cfg.top_time_threshold,
            lane.source,
        );

        let mut fills = Vec::new();
        for (i, pick) in ranked.iter().enumerate() {
            let Some(st) = sources.get(&pick.label) else {
                continue;
            };
            let quantity = allocation.quantity(i);
            for row in st.trades_at(date.and_time(pick.time)) {
                fills.push(Fill {
                    source: st.source.as_str(),
                    row,
                    quantity,
                });
            }
        }
        fills
    }

    pub fn run(&self, strategies: &StrategySet) -> Result<SimulationOutput, SimulationError> {
        let window = self.plan_window(strategies)?;
        let initial = self.options.initial_value;
        let policy = DayExclusionPolicy::new(self.news, &self.options.trading_weekdays, window.max_window);

        let mut lanes = self.lanes(strategies);
        let mut rows: Vec<Vec<DailyResultRow>> = vec![Vec::new(); lanes.len()];
        let mut portfolio = strategies
            .is_portfolio()
            .then(|| (SimulationState::new(initial), Vec::<DailyResultRow>::new()));

        debug!(
            lanes = lanes.len(),
            replay_start = %window.replay_start,
            threshold = %window.warm_up_threshold,
            end = %window.end,
            "starting walk-forward replay"
        );

        let mut date = window.replay_start;
        while date <= window.end {
            trace!(%date, "walk-forward day");
            let warmed_up = date >= window.warm_up_threshold;
            let trading_day = policy.is_trading_day(date);
            let mut portfolio_traded = false;
            if let Some((p, _)) = portfolio.as_mut() {
                p.day_pnl = 0.0;
            }

            for (lane, lane_rows) in lanes.iter_mut().zip(rows.iter_mut()) {
                let cfg = lane.config;
                lane.state.day_pnl = 0.0;
                let skip = policy
                    .check(cfg, date, warmed_up, &lane.state.warmup_log)
                    .is_some();
                let live = warmed_up && !skip;

                if !lane.passthrough {
                    if self.options.use_scaling {
                        lane.state.tranches = allocate(
                            lane.state.current_value,
                            cfg.capital_per_contract,
                            cfg.min_tranches,
                            cfg.max_tranches,
                        );
                        if let Some((p, _)) = portfolio.as_ref() {
                            lane.state.portfolio_tranches = allocate(
                                p.current_value * cfg.portfolio_weight / 100.0,
                                cfg.capital_per_contract,
                                cfg.min_tranches,
                                cfg.max_tranches,
                            );
                        }
                    } else {
                        lane.state.tranches = TrancheAllocation::unit(cfg.tranches);
                        lane.state.portfolio_tranches = TrancheAllocation::unit(cfg.tranches);
                    }
                }

                if trading_day {
                    let fills = self.fills(lane, date, &lane.state.tranches, lane.state.current_value);
                    lane.state.apply(&fills, live);
                    if let Some((p, _)) = portfolio.as_mut() {
                        let fills = self.fills(lane, date, &lane.state.portfolio_tranches, p.current_value);
                        p.apply(&fills, live);
                    }
                }

                if live {
                    lane_rows.push(lane.state.close_day(date, initial));
                    portfolio_traded = true;
                }
                if skip {
                    lane.state.note_skipped_day();
                }
            }

            if let Some((p, p_rows)) = portfolio.as_mut() {
                if portfolio_traded {
                    p_rows.push(p.close_day(date, initial));
                } else if warmed_up {
                    p.note_skipped_day();
                }
            }

            let Some(next) = date.succ_opt() else {
                break;
            };
            date = next;
        }

        let mut curves = Vec::with_capacity(lanes.len() + 1);
        if let Some((p, p_rows)) = portfolio {
            curves.push(EquityCurve {
                name: PORTFOLIO_LANE.to_string(),
                rows: p_rows,
                trades: p.trade_log,
            });
        }
        for (lane, lane_rows) in lanes.into_iter().zip(rows) {
            curves.push(EquityCurve {
                name: lane.name,
                rows: lane_rows,
                trades: lane.state.trade_log,
            });
        }
        for c in &curves {
            debug!(
                lane = %c.name,
                days = c.rows.len(),
                trades = c.trades.len(),
                final_value = c.rows.last().map(|r| r.current_value).unwrap_or(initial),
                "lane finished"
            );
        }
        Ok(SimulationOutput { window, curves })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregate::{Aggregator, RollingAggregator};
    use chrono::Timelike;

    use crate::config::{AggPeriod, CalcType};
    use crate::trades::{Dialect, PnlFields};

    fn d(y: i32, m: u32, day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, day).unwrap()
    }

    fn daily_trades(from: NaiveDate, to: NaiveDate, pnl: impl Fn(NaiveDate) -> f64) -> Vec<TradeRow> {
        let mut out = Vec::new();
        let mut day = from;
        while day <= to {
            if day.weekday().num_days_from_monday() < 5 {
                out.push(TradeRow {
                    entry_time: day.and_hms_opt(10, 0, 0).unwrap(),
                    right: OptionRight::Put,
                    premium: 2.0,
                    fields: PnlFields::Direct {
                        pnl: pnl(day),
                        contracts: 1.0,
                    },
                });
            }
            day = day.succ_opt().unwrap();
        }
        out
    }

    fn one_contract_config() -> StrategyConfig {
        StrategyConfig {
            short_window: 1,
            long_window: 1,
            short_weight: 100,
            long_weight: 0,
            tranches: 1,
            min_tranches: 1,
            max_tranches: 1,
            calc_type: CalcType::Pnl,
            // one contract anywhere between 60k and 120k
            capital_per_contract: 60_000.0,
            ..StrategyConfig::default()
        }
    }

    fn run(
        sources: &[SourceTrades],
        strategies: &StrategySet,
        options: &SimulationOptions,
    ) -> SimulationOutput {
        let news = NewsCalendar::default();
        let store = RollingAggregator
            .aggregate(&strategies.jobs(sources).unwrap(), &news, None)
            .unwrap();
        PortfolioSimulator::new(&store, &news, None, options)
            .run(strategies)
            .unwrap()
    }

    #[test]
    fn window_starts_after_the_longest_average() {
        let src = SourceTrades::new(
            "a",
            Dialect::Direct,
            daily_trades(d(2023, 1, 16), d(2023, 6, 30), |_| 10.0),
        );
        let strategies = StrategySet::single(StrategyConfig {
            short_window: 2,
            long_window: 3,
            ..one_contract_config()
        });
        let out = run(&[src], &strategies, &SimulationOptions::default());
        assert_eq!(out.window.warm_start, d(2023, 4, 1));
        assert_eq!(out.window.replay_start, d(2023, 4, 1));
        assert_eq!(out.window.end, d(2023, 6, 30));
        assert_eq!(out.primary().unwrap().rows.first().unwrap().date, d(2023, 4, 3));
    }

    #[test]
    fn drawdown_resets_at_a_new_high() {
        let src = SourceTrades::new(
            "a",
            Dialect::Direct,
            daily_trades(d(2023, 1, 2), d(2023, 3, 31), |day| {
                if day == d(2023, 2, 7) { -500.0 } else { 100.0 }
            }),
        );
        let out = run(
            &[src],
            &StrategySet::single(one_contract_config()),
            &SimulationOptions::default(),
        );
        let rows = &out.primary().unwrap().rows;
        let dip = rows.iter().find(|r| r.date == d(2023, 2, 7)).unwrap();
        assert!(dip.current_drawdown > 0.0);
        assert_eq!(dip.drawdown_days, 1);
        assert_eq!(dip.loss_streak, 1);
        let last = rows.last().unwrap();
        assert_eq!(last.current_drawdown, 0.0);
        assert_eq!(last.drawdown_days, 0);
        assert_eq!(last.max_drawdown, dip.max_drawdown);
    }

    #[test]
    fn single_mode_lanes_follow_flags() {
        let src = SourceTrades::new(
            "a",
            Dialect::Direct,
            daily_trades(d(2023, 1, 2), d(2023, 3, 31), |_| 10.0),
        );
        let strategies = StrategySet::single(StrategyConfig {
            per_weekday: true,
            put_or_call: true,
            ..one_contract_config()
        });
        let out = run(&[src], &strategies, &SimulationOptions::default());
        let names: Vec<&str> = out.curves.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(
            names,
            ["All-Combined", "Weekday-Combined", "All-BestPC", "Weekday-BestPC"]
        );
    }

    #[test]
    fn portfolio_tracks_members() {
        let a = SourceTrades::new(
            "a",
            Dialect::Direct,
            daily_trades(d(2023, 1, 2), d(2023, 3, 31), |_| 10.0),
        );
        let b = SourceTrades::new(
            "b",
            Dialect::Direct,
            daily_trades(d(2023, 1, 2), d(2023, 3, 31), |_| 20.0),
        );
        let mut members = BTreeMap::new();
        members.insert("a".to_string(), StrategyConfig {
            capital_per_contract: 50_000.0,
            portfolio_weight: 50.0,
            ..one_contract_config()
        });
        members.insert("b".to_string(), StrategyConfig {
            capital_per_contract: 50_000.0,
            portfolio_weight: 50.0,
            ..one_contract_config()
        });
        let out = run(&[a, b], &StrategySet::Portfolio(members), &SimulationOptions::default());
        let names: Vec<&str> = out.curves.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names, ["Portfolio", "a", "b"]);

        let portfolio = out.curve(PORTFOLIO_LANE).unwrap();
        let first = portfolio.rows.first().unwrap();
        // each member trades one contract from half of the portfolio
        assert_eq!(first.day_pnl, 30.0);
        assert!(out.curve("a").unwrap().trades.iter().all(|t| t.source == "a"));
    }

    #[test]
    fn semi_monthly_picks_ignore_the_current_half() {
        let windfall = d(2024, 1, 31);
        let mut trades = daily_trades(d(2023, 12, 1), windfall, |_| 100.0);
        trades.extend(
            daily_trades(d(2023, 12, 1), windfall, |day| {
                if day == windfall { 100_000.0 } else { 50.0 }
            })
            .into_iter()
            .map(|mut t| {
                t.entry_time = t.date().and_hms_opt(11, 0, 0).unwrap();
                t
            }),
        );
        let src = SourceTrades::new("a", Dialect::Direct, trades);
        let strategies = StrategySet::single(StrategyConfig {
            agg_period: AggPeriod::SemiMonthly,
            ..one_contract_config()
        });
        let out = run(&[src], &strategies, &SimulationOptions::default());
        let curve = out.primary().unwrap();
        let last = curve.rows.iter().find(|r| r.date == windfall).unwrap();
        assert_eq!(last.day_pnl, 100.0);
        assert!(curve.trades.iter().all(|t| t.entry_time.hour() == 10));
    }

    #[test]
    fn flat_day_keeps_both_streaks() {
        let mut state = SimulationState::new(100_000.0);
        state.day_pnl = 50.0;
        state.current_value += 50.0;
        state.close_day(d(2024, 1, 2), 100_000.0);
        state.day_pnl = 50.0;
        state.current_value += 50.0;
        state.close_day(d(2024, 1, 3), 100_000.0);
        state.loss_streak = 1;

        state.day_pnl = 0.0;
        let row = state.close_day(d(2024, 1, 4), 100_000.0);
        assert_eq!(row.win_streak, 2);
        assert_eq!(row.loss_streak, 1);
        assert_eq!(row.current_value, 100_100.0);
    }

    #[test]
    fn start_after_the_data_is_an_empty_window() {
        let src = SourceTrades::new(
            "a",
            Dialect::Direct,
            daily_trades(d(2023, 1, 2), d(2023, 3, 31), |_| 10.0),
        );
        let strategies = StrategySet::single(one_contract_config());
        let news = NewsCalendar::default();
        let store = RollingAggregator
            .aggregate(&strategies.jobs(&[src]).unwrap(), &news, None)
            .unwrap();
        let options = SimulationOptions {
            start: Some(d(2023, 5, 1)),
            ..SimulationOptions::default()
        };
        let err = PortfolioSimulator::new(&store, &news, None, &options)
            .run(&strategies)
            .unwrap_err();
        assert!(matches!(
            err,
            SimulationError::EmptyWindow { start, end } if start == d(2023, 5, 1) && end == d(2023, 3, 31)
        ));
    }

    #[test]
    fn missing_member_source_is_an_error() {
        let mut members = BTreeMap::new();
        members.insert("missing".to_string(), one_contract_config());
        let strategies = StrategySet::Portfolio(members);
        let err = strategies.jobs(&[]).unwrap_err();
        assert!(matches!(err, SimulationError::MissingSource(label) if label == "missing"));
    }
}
