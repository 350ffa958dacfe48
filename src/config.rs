use std::fmt;

use chrono::{Datelike, Months, NaiveDate, Weekday};
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// How an entry time is scored inside one aggregation period.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CalcType {
    /// Premium capture rate: PnL over premium collected.
    Pcr,
    /// Average PnL per contract.
    Pnl,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum AggPeriod {
    Weekly,
    SemiMonthly,
    Monthly,
}

impl AggPeriod {
    pub const ALL: [AggPeriod; 3] = [AggPeriod::Weekly, AggPeriod::SemiMonthly, AggPeriod::Monthly];

    /// First day of the period that contains `date`. Weeks start on Monday,
    /// half-months on the 1st and the 16th.
    pub fn period_start(self, date: NaiveDate) -> NaiveDate {
        match self {
            AggPeriod::Weekly => {
                date - chrono::Duration::days(date.weekday().num_days_from_monday() as i64)
            }
            AggPeriod::SemiMonthly => {
                let day = if date.day() <= 15 { 1 } else { 16 };
                date.with_day(day).unwrap_or(date)
            }
            AggPeriod::Monthly => date.with_day(1).unwrap_or(date),
        }
    }

    pub fn next_period_start(self, start: NaiveDate) -> NaiveDate {
        match self {
            AggPeriod::Weekly => start + chrono::Duration::days(7),
            AggPeriod::SemiMonthly => {
                if start.day() < 16 {
                    start.with_day(16).unwrap_or(start)
                } else {
                    first_of_month(start) + Months::new(1)
                }
            }
            AggPeriod::Monthly => first_of_month(start) + Months::new(1),
        }
    }

    /// Start of the period before the one containing `date`; its row
    /// supplies today's best times, so today's own trades never count.
    pub fn lookback_date(self, date: NaiveDate) -> NaiveDate {
        self.period_start(self.period_start(date) - chrono::Duration::days(1))
    }

    /// Number of periods covering `months` calendar months.
    pub fn periods_in_months(self, months: u32) -> usize {
        let n = match self {
            AggPeriod::Monthly => months as f64,
            AggPeriod::SemiMonthly => months as f64 * 2.0,
            AggPeriod::Weekly => (months as f64 * 4.33).floor(),
        };
        (n as usize).max(1)
    }
}

impl fmt::Display for AggPeriod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            AggPeriod::Weekly => "Weekly",
            AggPeriod::SemiMonthly => "Semi-Monthly",
            AggPeriod::Monthly => "Monthly",
        };
        f.write_str(s)
    }
}

/// Which runs honour the static weekday/news exclusions.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExclusionScope {
    Analysis,
    WalkForward,
    #[default]
    Both,
}

impl ExclusionScope {
    pub fn applies_to_analysis(self) -> bool {
        matches!(self, ExclusionScope::Analysis | ExclusionScope::Both)
    }

    pub fn applies_to_walk_forward(self) -> bool {
        matches!(self, ExclusionScope::WalkForward | ExclusionScope::Both)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct GapFilter {
    pub threshold: f64,
    /// Compare the percent gap instead of the point gap.
    pub use_percent: bool,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StrategyConfig {
    pub short_window: u32,
    pub long_window: u32,
    pub short_weight: u32,
    pub long_weight: u32,
    pub tranches: u32,
    pub calc_type: CalcType,
    pub agg_period: AggPeriod,
    pub put_or_call: bool,
    pub per_weekday: bool,
    pub weekday_exclusions: Vec<Weekday>,
    pub news_exclusions: Vec<String>,
    pub auto_exclusions: bool,
    pub exclusion_scope: ExclusionScope,
    pub capital_per_contract: f64,
    pub min_tranches: u32,
    pub max_tranches: u32,
    pub portfolio_weight: f64,
    pub passthrough: bool,
    pub top_time_threshold: Option<f64>,
    pub gap_filter: Option<GapFilter>,
}

impl Default for StrategyConfig {
    fn default() -> Self {
        Self {
            short_window: 3,
            long_window: 12,
            short_weight: 50,
            long_weight: 50,
            tranches: 5,
            calc_type: CalcType::Pcr,
            agg_period: AggPeriod::Monthly,
            put_or_call: false,
            per_weekday: false,
            weekday_exclusions: Vec::new(),
            news_exclusions: Vec::new(),
            auto_exclusions: false,
            exclusion_scope: ExclusionScope::Both,
            capital_per_contract: 6_000.0,
            min_tranches: 5,
            max_tranches: 5,
            portfolio_weight: 100.0,
            passthrough: false,
            top_time_threshold: None,
            gap_filter: None,
        }
    }
}

impl StrategyConfig {
    /// Averaging windows, short weight and top-N on top of `rest`, which
    /// supplies every other setting. The long weight is the complement of
    /// the short one and the tranche bounds collapse onto `tranches`.
    pub fn new(
        short_window: u32,
        long_window: u32,
        short_weight: u32,
        tranches: u32,
        rest: StrategyConfig,
    ) -> Result<Self, ConfigError> {
        let long_weight = 100_u32
            .checked_sub(short_weight)
            .ok_or(ConfigError::WeightSum {
                short: short_weight,
                long: 0,
            })?;
        let cfg = StrategyConfig {
            short_window,
            long_window,
            short_weight,
            long_weight,
            tranches,
            min_tranches: tranches,
            max_tranches: tranches,
            ..rest
        };
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.short_window == 0 || self.long_window == 0 {
            return Err(ConfigError::NonPositiveWindow {
                short: self.short_window,
                long: self.long_window,
            });
        }
        if self.short_window > self.long_window {
            return Err(ConfigError::WindowOrder {
                short: self.short_window,
                long: self.long_window,
            });
        }
        if self.short_weight + self.long_weight != 100 {
            return Err(ConfigError::WeightSum {
                short: self.short_weight,
                long: self.long_weight,
            });
        }
        if self.min_tranches > self.max_tranches
            || (!self.passthrough
                && (self.tranches < self.min_tranches || self.tranches > self.max_tranches))
        {
            return Err(ConfigError::TrancheBounds {
                min: self.min_tranches,
                tranches: self.tranches,
                max: self.max_tranches,
            });
        }
        if !(self.capital_per_contract > 0.0) {
            return Err(ConfigError::CapitalPerContract(self.capital_per_contract));
        }
        if !(self.portfolio_weight > 0.0 && self.portfolio_weight <= 100.0) {
            return Err(ConfigError::PortfolioWeight(self.portfolio_weight));
        }
        Ok(())
    }

    /// Longest averaging window, in months.
    pub fn max_window(&self) -> u32 {
        self.short_window.max(self.long_window)
    }

    /// Stable identity used to detect configurations that were already tried.
    pub fn fingerprint(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| "{}".to_string())
    }
}

impl fmt::Display for StrategyConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[Avg1: {}mo({}%) | Avg2: {}mo({}%) | Tranches: {} | Calc Type: {:?} | Agg: {} | Best P or C: {} | Weekday: {}]",
            self.short_window,
            self.short_weight,
            self.long_window,
            self.long_weight,
            self.tranches,
            self.calc_type,
            self.agg_period,
            self.put_or_call,
            self.per_weekday,
        )
    }
}

pub fn first_of_month(date: NaiveDate) -> NaiveDate {
    date.with_day(1).unwrap_or(date)
}

pub fn weekday_label(date: NaiveDate) -> String {
    date.format("%a").to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn d(y: i32, m: u32, day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, day).unwrap()
    }

    #[test]
    fn default_config_is_valid() {
        assert!(StrategyConfig::default().validate().is_ok());
    }

    #[test]
    fn rejects_bad_weights_and_windows() {
        let cfg = StrategyConfig {
            short_weight: 40,
            long_weight: 50,
            ..StrategyConfig::default()
        };
        assert_eq!(
            cfg.validate(),
            Err(ConfigError::WeightSum { short: 40, long: 50 })
        );

        let cfg = StrategyConfig {
            short_window: 6,
            long_window: 2,
            ..StrategyConfig::default()
        };
        assert_eq!(
            cfg.validate(),
            Err(ConfigError::WindowOrder { short: 6, long: 2 })
        );

        let cfg = StrategyConfig {
            short_window: 0,
            ..StrategyConfig::default()
        };
        assert!(matches!(
            cfg.validate(),
            Err(ConfigError::NonPositiveWindow { .. })
        ));
    }

    #[test]
    fn period_starts() {
        // 2024-03-20 is a Wednesday
        assert_eq!(AggPeriod::Weekly.period_start(d(2024, 3, 20)), d(2024, 3, 18));
        assert_eq!(AggPeriod::SemiMonthly.period_start(d(2024, 3, 15)), d(2024, 3, 1));
        assert_eq!(AggPeriod::SemiMonthly.period_start(d(2024, 3, 16)), d(2024, 3, 16));
        assert_eq!(AggPeriod::Monthly.period_start(d(2024, 3, 20)), d(2024, 3, 1));
    }

    #[test]
    fn next_periods() {
        assert_eq!(AggPeriod::SemiMonthly.next_period_start(d(2024, 1, 1)), d(2024, 1, 16));
        assert_eq!(AggPeriod::SemiMonthly.next_period_start(d(2024, 1, 16)), d(2024, 2, 1));
        assert_eq!(AggPeriod::Monthly.next_period_start(d(2024, 12, 1)), d(2025, 1, 1));
    }

    #[test]
    fn lookback_is_the_previous_period() {
        assert_eq!(AggPeriod::Monthly.lookback_date(d(2024, 3, 31)), d(2024, 2, 1));
        // Friday -> Monday of the week before
        assert_eq!(AggPeriod::Weekly.lookback_date(d(2024, 3, 8)), d(2024, 2, 26));
        assert_eq!(AggPeriod::SemiMonthly.lookback_date(d(2024, 1, 31)), d(2024, 1, 1));
        assert_eq!(AggPeriod::SemiMonthly.lookback_date(d(2024, 1, 15)), d(2023, 12, 16));
    }

    #[test]
    fn lookback_never_lands_in_the_current_period() {
        for period in AggPeriod::ALL {
            let mut day = d(2023, 1, 1);
            while day <= d(2024, 12, 31) {
                let back = period.lookback_date(day);
                assert!(
                    period.period_start(back) < period.period_start(day),
                    "{period} {day}"
                );
                assert_eq!(period.next_period_start(back), period.period_start(day));
                day = day.succ_opt().unwrap();
            }
        }
    }

    #[test]
    fn new_collapses_tranche_bounds_and_checks_weights() {
        let cfg = StrategyConfig::new(2, 6, 30, 4, StrategyConfig::default()).unwrap();
        assert_eq!((cfg.long_weight, cfg.min_tranches, cfg.max_tranches), (70, 4, 4));
        assert!(matches!(
            StrategyConfig::new(2, 6, 130, 4, StrategyConfig::default()),
            Err(ConfigError::WeightSum { short: 130, .. })
        ));
        assert!(matches!(
            StrategyConfig::new(7, 6, 50, 4, StrategyConfig::default()),
            Err(ConfigError::WindowOrder { short: 7, long: 6 })
        ));
    }

    #[test]
    fn fingerprint_tracks_every_field() {
        let a = StrategyConfig::default();
        let mut b = a.clone();
        assert_eq!(a.fingerprint(), b.fingerprint());
        b.per_weekday = true;
        assert_ne!(a.fingerprint(), b.fingerprint());
    }
}
