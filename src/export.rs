use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Serialize;
use tracing::info;
use uuid::Uuid;

use crate::simulator::{DailyResultRow, LoggedTrade, SimulationOutput};

/// `base.ext`, or `base (n).ext` for the first `n` not taken yet.
fn next_free_path(dir: &Path, base: &str, ext: &str) -> PathBuf {
    let first = dir.join(format!("{base}.{ext}"));
    if !first.exists() {
        return first;
    }
    (1..)
        .map(|n| dir.join(format!("{base} ({n}).{ext}")))
        .find(|p| !p.exists())
        .unwrap_or(first)
}

fn write_rows<T: Serialize>(path: &Path, rows: &[T]) -> Result<()> {
    let mut w = csv::Writer::from_path(path)
        .with_context(|| format!("failed to create {}", path.display()))?;
    for r in rows {
        w.serialize(r)
            .with_context(|| format!("failed to write {}", path.display()))?;
    }
    w.flush()
        .with_context(|| format!("failed to flush {}", path.display()))?;
    Ok(())
}

pub fn write_trade_log(path: &Path, trades: &[LoggedTrade]) -> Result<()> {
    write_rows(path, trades)
}

pub fn write_equity_curve(path: &Path, rows: &[DailyResultRow]) -> Result<()> {
    write_rows(path, rows)
}

/// Writes the trade log and equity curve of every lane that simulated at
/// least one day. Returns the files written.
pub fn export_output(dir: &Path, output: &SimulationOutput) -> Result<Vec<PathBuf>> {
    fs::create_dir_all(dir).with_context(|| format!("failed to create {}", dir.display()))?;
    let mut written = Vec::new();
    for curve in &output.curves {
        if curve.rows.is_empty() {
            continue;
        }
        let tag: String = Uuid::new_v4().simple().to_string().chars().take(8).collect();

        let path = next_free_path(dir, &format!("{} - TradeLog_{tag}", curve.name), "csv");
        write_trade_log(&path, &curve.trades)?;
        written.push(path);

        let path = next_free_path(dir, &format!("{} - EquityCurve_{tag}", curve.name), "csv");
        write_equity_curve(&path, &curve.rows)?;
        written.push(path);
    }
    info!(dir = %dir.display(), files = written.len(), "exported simulation results");
    Ok(written)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::trades::OptionRight;
    use chrono::NaiveDate;

    /// A fresh directory per call, so reruns never see earlier files.
    fn scratch_dir() -> PathBuf {
        let dir = std::env::temp_dir().join(format!("tranche_optimizer_export_{}", Uuid::new_v4().simple()));
        fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[test]
    fn next_free_path_skips_taken_names() {
        let dir = scratch_dir();
        let first = next_free_path(&dir, "lane", "csv");
        assert_eq!(first, dir.join("lane.csv"));
        fs::write(&first, "x").unwrap();
        let second = next_free_path(&dir, "lane", "csv");
        assert_eq!(second, dir.join("lane (1).csv"));
        assert_ne!(scratch_dir(), dir);
    }

    #[test]
    fn trade_log_has_a_header_row() {
        let dir = scratch_dir();
        let path = dir.join("trades.csv");
        let trade = LoggedTrade {
            source: "spx".into(),
            entry_time: NaiveDate::from_ymd_opt(2024, 1, 2)
                .unwrap()
                .and_hms_opt(10, 30, 0)
                .unwrap(),
            right: OptionRight::Put,
            premium: 2.5,
            quantity: 3,
            pnl: 120.0,
        };
        write_trade_log(&path, &[trade]).unwrap();
        let body = fs::read_to_string(&path).unwrap();
        let mut lines = body.lines();
        assert_eq!(
            lines.next(),
            Some("source,entry_time,right,premium,quantity,pnl")
        );
        assert_eq!(lines.next(), Some("spx,2024-01-02T10:30:00,Put,2.5,3,120.0"));
    }
}
