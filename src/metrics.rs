use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::Datelike;
use serde::{Deserialize, Serialize};

use crate::error::MetricsError;
use crate::simulator::DailyResultRow;

const TRADING_DAYS_PER_YEAR: f64 = 252.0;
const RISK_FREE_ANNUAL: f64 = 0.02;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MonthPnl {
    /// `YYYY-MM`
    pub month: String,
    pub pnl: f64,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PerformanceMetrics {
    pub initial_value: f64,
    pub final_value: f64,
    pub total_return: f64,
    pub cagr: f64,
    pub sharpe: f64,
    pub mar: f64,
    /// Worst peak-to-trough loss as a fraction of the peak.
    pub drawdown_pct: f64,
    pub days_in_drawdown: u32,
    pub largest_month: MonthPnl,
    pub smallest_month: MonthPnl,
    pub max_win_streak: u32,
    pub max_loss_streak: u32,
    pub trading_days: usize,
}

impl PerformanceMetrics {
    pub fn from_curve(rows: &[DailyResultRow]) -> Result<Self, MetricsError> {
        let (Some(first), Some(last)) = (rows.first(), rows.last()) else {
            return Err(MetricsError::EmptyCurve);
        };
        let initial = rows
            .iter()
            .map(|r| r.initial_value)
            .fold(f64::INFINITY, f64::min);
        if initial == 0.0 {
            return Err(MetricsError::ZeroInitialValue);
        }
        let final_value = last.current_value;
        let total_return = (final_value - initial) / initial;

        let years = (last.date - first.date).num_days() as f64 / 365.25;
        let cagr = if years > 0.0 {
            (final_value / initial).powf(1.0 / years) - 1.0
        } else {
            f64::NAN
        };

        let drawdown = rows.iter().map(|r| r.max_drawdown).fold(0.0_f64, f64::max);
        let mar = if drawdown == 0.0 {
            f64::INFINITY
        } else {
            cagr / drawdown
        };

        let mut months: BTreeMap<(i32, u32), f64> = BTreeMap::new();
        for r in rows {
            *months.entry((r.date.year(), r.date.month())).or_insert(0.0) += r.day_pnl;
        }
        let month_pnl = |((y, m), pnl): (&(i32, u32), &f64)| MonthPnl {
            month: format!("{y:04}-{m:02}"),
            pnl: *pnl,
        };
        let by_pnl = |a: &(&(i32, u32), &f64), b: &(&(i32, u32), &f64)| {
            a.1.partial_cmp(b.1).unwrap_or(Ordering::Equal)
        };
        // non-empty rows means at least one month
        let largest_month = months
            .iter()
            .max_by(by_pnl)
            .map(month_pnl)
            .ok_or(MetricsError::EmptyCurve)?;
        let smallest_month = months
            .iter()
            .min_by(by_pnl)
            .map(month_pnl)
            .ok_or(MetricsError::EmptyCurve)?;

        Ok(Self {
            initial_value: initial,
            final_value,
            total_return,
            cagr,
            sharpe: sharpe_ratio(rows),
            mar,
            drawdown_pct: drawdown,
            days_in_drawdown: rows.iter().map(|r| r.drawdown_days).max().unwrap_or(0),
            largest_month,
            smallest_month,
            max_win_streak: rows.iter().map(|r| r.win_streak).max().unwrap_or(0),
            max_loss_streak: rows.iter().map(|r| r.loss_streak).max().unwrap_or(0),
            trading_days: rows.len(),
        })
    }
}

/// Annualised Sharpe of day-over-day value changes against a 2% risk-free
/// rate. NaN with fewer than two returns or zero variance.
pub fn sharpe_ratio(rows: &[DailyResultRow]) -> f64 {
    let returns: Vec<f64> = rows
        .windows(2)
        .map(|w| (w[1].current_value - w[0].current_value) / w[0].current_value)
        .filter(|r| r.is_finite())
        .collect();
    if returns.len() < 2 {
        return f64::NAN;
    }
    let n = returns.len() as f64;
    let mean = returns.iter().sum::<f64>() / n;
    let var = returns.iter().map(|r| (r - mean).powi(2)).sum::<f64>() / (n - 1.0);
    let std = var.sqrt();
    if std == 0.0 {
        return f64::NAN;
    }
    let rf = RISK_FREE_ANNUAL / TRADING_DAYS_PER_YEAR;
    TRADING_DAYS_PER_YEAR.sqrt() * (mean - rf) / std
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SelectionMetric {
    #[default]
    Mar,
    Sharpe,
    Cagr,
    DrawdownPct,
    DaysInDrawdown,
    TotalReturn,
    LargestMonth,
    SmallestMonth,
}

impl SelectionMetric {
    pub const ALL: [SelectionMetric; 8] = [
        SelectionMetric::Mar,
        SelectionMetric::Sharpe,
        SelectionMetric::Cagr,
        SelectionMetric::DrawdownPct,
        SelectionMetric::DaysInDrawdown,
        SelectionMetric::TotalReturn,
        SelectionMetric::LargestMonth,
        SelectionMetric::SmallestMonth,
    ];

    pub fn name(self) -> &'static str {
        match self {
            SelectionMetric::Mar => "MAR",
            SelectionMetric::Sharpe => "Sharpe",
            SelectionMetric::Cagr => "CAGR",
            SelectionMetric::DrawdownPct => "Drawdown%",
            SelectionMetric::DaysInDrawdown => "Days in Drawdown",
            SelectionMetric::TotalReturn => "Total Return",
            SelectionMetric::LargestMonth => "Largest Month",
            SelectionMetric::SmallestMonth => "Smallest Month",
        }
    }

    pub fn higher_is_better(self) -> bool {
        match self {
            SelectionMetric::Mar
            | SelectionMetric::Sharpe
            | SelectionMetric::Cagr
            | SelectionMetric::TotalReturn
            | SelectionMetric::LargestMonth
            | SelectionMetric::SmallestMonth => true,
            SelectionMetric::DrawdownPct | SelectionMetric::DaysInDrawdown => false,
        }
    }

    pub fn value(self, m: &PerformanceMetrics) -> f64 {
        match self {
            SelectionMetric::Mar => m.mar,
            SelectionMetric::Sharpe => m.sharpe,
            SelectionMetric::Cagr => m.cagr,
            SelectionMetric::DrawdownPct => m.drawdown_pct,
            SelectionMetric::DaysInDrawdown => m.days_in_drawdown as f64,
            SelectionMetric::TotalReturn => m.total_return,
            SelectionMetric::LargestMonth => m.largest_month.pnl,
            SelectionMetric::SmallestMonth => m.smallest_month.pnl,
        }
    }

    /// Orders best first. NaN sorts after everything.
    pub fn rank(self, a: f64, b: f64) -> Ordering {
        match (a.is_nan(), b.is_nan()) {
            (true, true) => Ordering::Equal,
            (true, false) => Ordering::Greater,
            (false, true) => Ordering::Less,
            (false, false) => {
                let ord = a.partial_cmp(&b).unwrap_or(Ordering::Equal);
                if self.higher_is_better() {
                    ord.reverse()
                } else {
                    ord
                }
            }
        }
    }

    /// Whether `a` strictly beats `b`.
    pub fn better(self, a: f64, b: f64) -> bool {
        self.rank(a, b) == Ordering::Less
    }
}

impl fmt::Display for SelectionMetric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for SelectionMetric {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let want = s.trim();
        Self::ALL
            .into_iter()
            .find(|m| {
                m.name().eq_ignore_ascii_case(want)
                    || format!("{m:?}").eq_ignore_ascii_case(want)
            })
            .ok_or_else(|| {
                let names: Vec<&str> = Self::ALL.iter().map(|m| m.name()).collect();
                format!("unknown selection metric {s:?}, expected one of {}", names.join(", "))
            })
    }
}
