use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::Path;

use anyhow::Context;
use chrono::{Datelike, NaiveDate, NaiveDateTime, NaiveTime, Weekday};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::config::CalcType;
use crate::error::DataShapeError;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OptionRight {
    Put,
    Call,
}

impl OptionRight {
    fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_uppercase().as_str() {
            "P" | "PUT" | "PUTS" => Some(OptionRight::Put),
            "C" | "CALL" | "CALLS" => Some(OptionRight::Call),
            _ => None,
        }
    }
}

/// Source export formats.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Dialect {
    /// Carries a finished `P/L` column (first header column `Date Opened`).
    Direct,
    /// Carries per-contract PnL after slippage plus a commission fee
    /// (first header column `TradeID`).
    Slippage,
}

impl Dialect {
    pub fn detect(first_column: &str) -> Option<Self> {
        match first_column.trim().trim_start_matches('\u{feff}') {
            "Date Opened" => Some(Dialect::Direct),
            "TradeID" => Some(Dialect::Slippage),
            _ => None,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub enum PnlFields {
    Direct { pnl: f64, contracts: f64 },
    Slippage { pnl_after_slippage: f64, commission: f64 },
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TradeRow {
    pub entry_time: NaiveDateTime,
    pub right: OptionRight,
    pub premium: f64,
    pub fields: PnlFields,
}

impl TradeRow {
    pub fn date(&self) -> NaiveDate {
        self.entry_time.date()
    }

    pub fn time(&self) -> NaiveTime {
        self.entry_time.time()
    }

    pub fn weekday(&self) -> Weekday {
        self.entry_time.weekday()
    }

    /// Realised PnL when the trade is taken `qty` times.
    pub fn pnl_at(&self, qty: u32) -> f64 {
        let q = qty as f64;
        match self.fields {
            PnlFields::Direct { pnl, .. } => pnl * q,
            PnlFields::Slippage {
                pnl_after_slippage,
                commission,
            } => pnl_after_slippage * 100.0 * q - commission * q,
        }
    }

    /// PnL of the trade as logged, before any tranche scaling.
    pub fn unit_pnl(&self) -> f64 {
        self.pnl_at(1)
    }

    /// Numerator and denominator this trade contributes to a period score.
    pub fn score_parts(&self, calc: CalcType) -> (f64, f64) {
        match (self.fields, calc) {
            (PnlFields::Direct { pnl, contracts }, CalcType::Pnl) => (pnl, contracts),
            (PnlFields::Direct { pnl, contracts }, CalcType::Pcr) => {
                (pnl, self.premium * contracts)
            }
            (
                PnlFields::Slippage {
                    pnl_after_slippage,
                    commission,
                },
                CalcType::Pnl,
            ) => ((pnl_after_slippage - commission / 100.0) * 100.0, 1.0),
            (
                PnlFields::Slippage {
                    pnl_after_slippage,
                    commission,
                },
                CalcType::Pcr,
            ) => (pnl_after_slippage - commission / 100.0, self.premium),
        }
    }
}

/// All trades from one input file.
#[derive(Clone, Debug)]
pub struct SourceTrades {
    pub label: String,
    pub dialect: Dialect,
    pub trades: Vec<TradeRow>,
}

impl SourceTrades {
    pub fn new(label: impl Into<String>, dialect: Dialect, mut trades: Vec<TradeRow>) -> Self {
        trades.sort_by_key(|t| t.entry_time);
        Self {
            label: label.into(),
            dialect,
            trades,
        }
    }

    pub fn first_date(&self) -> Option<NaiveDate> {
        self.trades.first().map(TradeRow::date)
    }

    pub fn last_date(&self) -> Option<NaiveDate> {
        self.trades.last().map(TradeRow::date)
    }
}

struct Columns<'a> {
    path: &'a Path,
    headers: csv::StringRecord,
}

impl Columns<'_> {
    fn index(&self, name: &str) -> Result<usize, DataShapeError> {
        self.headers
            .iter()
            .position(|h| h.trim().trim_start_matches('\u{feff}') == name)
            .ok_or_else(|| DataShapeError::MissingColumn {
                path: self.path.to_path_buf(),
                column: name.to_string(),
            })
    }
}

fn parse_f64(s: Option<&str>) -> Option<f64> {
    s.map(|x| x.trim().replace(',', "")).and_then(|x| {
        if x.is_empty() {
            Some(0.0)
        } else {
            x.parse::<f64>().ok()
        }
    })
}

fn parse_entry_time(s: &str) -> Option<NaiveDateTime> {
    let s = s.trim();
    ["%Y-%m-%d %H:%M:%S", "%Y-%m-%d %H:%M", "%m/%d/%Y %H:%M:%S", "%m/%d/%Y %H:%M"]
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(s, fmt).ok())
}

fn parse_time(s: &str) -> Option<NaiveTime> {
    let s = s.trim();
    NaiveTime::parse_from_str(s, "%H:%M:%S")
        .or_else(|_| NaiveTime::parse_from_str(s, "%H:%M"))
        .ok()
}

/// Right of the first leg: `<qty> <month> <day> <strike> <P|C> <action> ...`.
fn right_from_legs(legs: &str) -> Option<OptionRight> {
    let first = legs.split('|').next()?;
    let token = first.split_whitespace().nth(4)?;
    OptionRight::parse(token)
}

/// Reads one trade log, detecting its dialect from the header row.
pub fn load_trade_log(path: &Path) -> Result<SourceTrades, DataShapeError> {
    let mut rdr = csv::ReaderBuilder::new()
        .has_headers(true)
        .flexible(true)
        .from_path(path)?;
    let headers = rdr.headers()?.clone();
    let first_column = headers.get(0).unwrap_or_default().to_string();
    let Some(dialect) = Dialect::detect(&first_column) else {
        return Err(DataShapeError::UnknownSchema {
            path: path.to_path_buf(),
            first_column,
        });
    };
    let cols = Columns { path, headers };

    let mut trades = Vec::new();
    let mut skipped = 0_usize;
    match dialect {
        Dialect::Direct => {
            let date_i = cols.index("Date Opened")?;
            let time_i = cols.index("Time Opened")?;
            let pnl_i = cols.index("P/L")?;
            let qty_i = cols.index("No. of Contracts")?;
            let prem_i = cols.index("Premium")?;
            let legs_i = cols.index("Legs")?;
            for rec in rdr.records() {
                let Ok(r) = rec else {
                    skipped += 1;
                    continue;
                };
                let date = r
                    .get(date_i)
                    .and_then(|x| NaiveDate::parse_from_str(x.trim(), "%Y-%m-%d").ok());
                let time = r.get(time_i).and_then(parse_time);
                let right = r.get(legs_i).and_then(right_from_legs);
                let pnl = parse_f64(r.get(pnl_i));
                let contracts = parse_f64(r.get(qty_i));
                let premium = parse_f64(r.get(prem_i));
                if let (Some(date), Some(time), Some(right), Some(pnl), Some(contracts), Some(premium)) =
                    (date, time, right, pnl, contracts, premium)
                {
                    trades.push(TradeRow {
                        entry_time: date.and_time(time),
                        right,
                        premium,
                        fields: PnlFields::Direct { pnl, contracts },
                    });
                } else {
                    skipped += 1;
                }
            }
        }
        Dialect::Slippage => {
            let entry_i = cols.index("EntryTime")?;
            let right_i = cols.index("OptionType")?;
            let pnl_i = cols.index("ProfitLossAfterSlippage")?;
            let fee_i = cols.index("CommissionFees")?;
            let prem_i = cols.index("Premium")?;
            for rec in rdr.records() {
                let Ok(r) = rec else {
                    skipped += 1;
                    continue;
                };
                let entry = r.get(entry_i).and_then(parse_entry_time);
                let right = r.get(right_i).and_then(OptionRight::parse);
                let pnl = parse_f64(r.get(pnl_i));
                let fee = parse_f64(r.get(fee_i));
                let premium = parse_f64(r.get(prem_i));
                if let (Some(entry_time), Some(right), Some(pnl_after_slippage), Some(commission), Some(premium)) =
                    (entry, right, pnl, fee, premium)
                {
                    trades.push(TradeRow {
                        entry_time,
                        right,
                        premium,
                        fields: PnlFields::Slippage {
                            pnl_after_slippage,
                            commission,
                        },
                    });
                } else {
                    skipped += 1;
                }
            }
        }
    }

    if trades.is_empty() {
        return Err(DataShapeError::Empty {
            path: path.to_path_buf(),
        });
    }
    if skipped > 0 {
        debug!(path = %path.display(), skipped, "skipped unparsable trade rows");
    }

    let label = path
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("source")
        .to_string();
    info!(source = %label, ?dialect, trades = trades.len(), "loaded trade log");
    Ok(SourceTrades::new(label, dialect, trades))
}

/// Loads every file it can; a bad file is logged and left out.
pub fn load_trade_logs(paths: &[impl AsRef<Path>]) -> Vec<SourceTrades> {
    let mut out = Vec::new();
    for p in paths {
        match load_trade_log(p.as_ref()) {
            Ok(src) => out.push(src),
            Err(e) => tracing::error!(error = %e, "skipping trade log"),
        }
    }
    out
}

/// Named news releases and the dates they occur on.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct NewsCalendar {
    events: BTreeMap<String, BTreeSet<NaiveDate>>,
}

impl NewsCalendar {
    pub fn new(events: BTreeMap<String, BTreeSet<NaiveDate>>) -> Self {
        Self { events }
    }

    pub fn from_json_file(path: &Path) -> anyhow::Result<Self> {
        let raw = fs::read_to_string(path)
            .with_context(|| format!("failed to read news events: {}", path.display()))?;
        let events: BTreeMap<String, BTreeSet<NaiveDate>> = serde_json::from_str(&raw)
            .with_context(|| format!("failed to parse news events: {}", path.display()))?;
        Ok(Self { events })
    }

    pub fn insert(&mut self, name: impl Into<String>, dates: impl IntoIterator<Item = NaiveDate>) {
        self.events.entry(name.into()).or_default().extend(dates);
    }

    /// Events falling on `date`, in name order.
    pub fn events_on(&self, date: NaiveDate) -> impl Iterator<Item = (&str, &BTreeSet<NaiveDate>)> {
        self.events
            .iter()
            .filter(move |(_, dates)| dates.contains(&date))
            .map(|(name, dates)| (name.as_str(), dates))
    }

    /// Whether `date` is a release date of any of `names`.
    pub fn is_listed(&self, names: &[String], date: NaiveDate) -> bool {
        names.iter().any(|n| {
            self.events
                .get(n)
                .map(|dates| dates.contains(&date))
                .unwrap_or(false)
        })
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct GapReading {
    pub points: f64,
    pub percent: f64,
}

/// Opening gap of the underlying per trading day.
pub type GapSeries = BTreeMap<NaiveDate, GapReading>;

#[derive(Debug, Deserialize)]
struct GapCsvRow {
    #[serde(rename = "Date")]
    date: NaiveDate,
    #[serde(rename = "Gap")]
    gap: f64,
    #[serde(rename = "Gap%")]
    gap_pct: f64,
}

pub fn load_gaps(path: &Path) -> anyhow::Result<GapSeries> {
    let mut rdr = csv::Reader::from_path(path)
        .with_context(|| format!("failed to open gaps csv: {}", path.display()))?;
    let mut out = GapSeries::new();
    for row in rdr.deserialize::<GapCsvRow>() {
        let row = row.with_context(|| format!("bad row in {}", path.display()))?;
        out.insert(
            row.date,
            GapReading {
                points: row.gap,
                percent: row.gap_pct,
            },
        );
    }
    Ok(out)
}
