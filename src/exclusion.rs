use std::collections::BTreeMap;

use chrono::{Datelike, NaiveDate, Weekday};

use crate::config::{AggPeriod, StrategyConfig};
use crate::trades::{NewsCalendar, TradeRow};

pub const DEFAULT_TRADING_WEEKDAYS: [Weekday; 5] = [
    Weekday::Mon,
    Weekday::Tue,
    Weekday::Wed,
    Weekday::Thu,
    Weekday::Fri,
];

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SkipReason {
    NotTradingDay,
    ExcludedWeekday(Weekday),
    NewsRelease(String),
    NegativeNewsExpectancy(String),
    NegativeWeekdayExpectancy(Weekday),
}

/// Decides whether a strategy sits out a calendar day.
#[derive(Clone, Copy, Debug)]
pub struct DayExclusionPolicy<'a> {
    news: &'a NewsCalendar,
    trading_weekdays: &'a [Weekday],
    /// Rolling window of the auto rule, in months.
    rolling_months: u32,
}

impl<'a> DayExclusionPolicy<'a> {
    pub fn new(news: &'a NewsCalendar, trading_weekdays: &'a [Weekday], rolling_months: u32) -> Self {
        Self {
            news,
            trading_weekdays,
            rolling_months,
        }
    }

    pub fn is_trading_day(&self, date: NaiveDate) -> bool {
        self.trading_weekdays.contains(&date.weekday())
    }

    /// The auto rule only takes over once `warmed_up`; before that the
    /// static lists apply.
    pub fn check(
        &self,
        cfg: &StrategyConfig,
        date: NaiveDate,
        warmed_up: bool,
        warmup_log: &[TradeRow],
    ) -> Option<SkipReason> {
        if !self.is_trading_day(date) {
            return Some(SkipReason::NotTradingDay);
        }
        if cfg.auto_exclusions && warmed_up {
            self.auto_skip(cfg.agg_period, date, warmup_log)
        } else {
            self.static_skip(cfg, date)
        }
    }

    pub fn static_skip(&self, cfg: &StrategyConfig, date: NaiveDate) -> Option<SkipReason> {
        if !cfg.exclusion_scope.applies_to_walk_forward() {
            return None;
        }
        let wd = date.weekday();
        if cfg.weekday_exclusions.contains(&wd) {
            return Some(SkipReason::ExcludedWeekday(wd));
        }
        cfg.news_exclusions
            .iter()
            .find(|name| self.news.is_listed(std::slice::from_ref(name), date))
            .map(|name| SkipReason::NewsRelease(name.clone()))
    }

    /// Skips when today's news events, then today's weekday, have a negative
    /// rolling expectancy in the warm-up log.
    pub fn auto_skip(
        &self,
        period: AggPeriod,
        date: NaiveDate,
        warmup_log: &[TradeRow],
    ) -> Option<SkipReason> {
        for (event, dates) in self.news.events_on(date) {
            let hits = warmup_log.iter().filter(|t| dates.contains(&t.date()));
            if rolling_expectancy(hits, period, self.rolling_months).is_some_and(|v| v < 0.0) {
                return Some(SkipReason::NegativeNewsExpectancy(event.to_string()));
            }
        }
        let wd = date.weekday();
        let same_day = warmup_log.iter().filter(|t| t.weekday() == wd);
        if rolling_expectancy(same_day, period, self.rolling_months).is_some_and(|v| v < 0.0) {
            return Some(SkipReason::NegativeWeekdayExpectancy(wd));
        }
        None
    }
}

/// Mean per-period PnL over the last `months` worth of periods. Periods
/// without trades between the first and last count as zero. `None` when
/// there are no trades.
pub fn rolling_expectancy<'t>(
    trades: impl Iterator<Item = &'t TradeRow>,
    period: AggPeriod,
    months: u32,
) -> Option<f64> {
    let mut sums: BTreeMap<NaiveDate, f64> = BTreeMap::new();
    for t in trades {
        *sums.entry(period.period_start(t.date())).or_insert(0.0) += t.unit_pnl();
    }
    let (&first, _) = sums.first_key_value()?;
    let (&last, _) = sums.last_key_value()?;

    let mut series = Vec::new();
    let mut p = first;
    while p <= last {
        series.push(sums.get(&p).copied().unwrap_or(0.0));
        p = period.next_period_start(p);
    }

    let window = period.periods_in_months(months);
    let tail = &series[series.len().saturating_sub(window)..];
    Some(tail.iter().sum::<f64>() / tail.len() as f64)
}
