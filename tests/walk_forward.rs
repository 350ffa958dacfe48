use std::collections::BTreeMap;
use std::fs;
use std::path::PathBuf;

use chrono::{Datelike, NaiveDate, Timelike, Weekday};
use uuid::Uuid;

use tranche_optimizer::aggregate::{Aggregator, RollingAggregator};
use tranche_optimizer::config::{CalcType, GapFilter, StrategyConfig};
use tranche_optimizer::metrics::PerformanceMetrics;
use tranche_optimizer::simulator::{
    EquityCurve, PORTFOLIO_LANE, PortfolioSimulator, SimulationOptions, SimulationOutput, StrategySet,
};
use tranche_optimizer::trades::{
    Dialect, NewsCalendar, OptionRight, PnlFields, SourceTrades, TradeRow, load_gaps, load_trade_log,
};

fn d(y: i32, m: u32, day: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(y, m, day).unwrap()
}

fn scratch_dir(name: &str) -> PathBuf {
    let dir = std::env::temp_dir().join(format!("tranche_optimizer_{name}_{}", Uuid::new_v4().simple()));
    fs::create_dir_all(&dir).unwrap();
    dir
}

/// One 10:00 put per weekday in `[from, to]`, in the `Date Opened` export format.
fn write_log(name: &str, from: NaiveDate, to: NaiveDate, pnl: impl Fn(NaiveDate) -> f64) -> SourceTrades {
    let mut body = String::from("Date Opened,Time Opened,P/L,No. of Contracts,Premium,Legs\n");
    let mut day = from;
    while day <= to {
        if day.weekday().num_days_from_monday() < 5 {
            body.push_str(&format!(
                "{},10:00:00,{},1,2.00,1 Jan 1 4700 P STO 2.00\n",
                day.format("%Y-%m-%d"),
                pnl(day)
            ));
        }
        day = day.succ_opt().unwrap();
    }
    let path = scratch_dir(name).join(format!("{name}.csv"));
    fs::write(&path, body).unwrap();
    load_trade_log(&path).unwrap()
}

/// Puts at each listed hour on every weekday in `[from, to]`, built in memory.
fn hourly_puts(
    label: &str,
    from: NaiveDate,
    to: NaiveDate,
    hours: &[u32],
    pnl: impl Fn(NaiveDate, u32) -> f64,
) -> SourceTrades {
    let mut trades = Vec::new();
    let mut day = from;
    while day <= to {
        if day.weekday().num_days_from_monday() < 5 {
            for &hour in hours {
                trades.push(TradeRow {
                    entry_time: day.and_hms_opt(hour, 0, 0).unwrap(),
                    right: OptionRight::Put,
                    premium: 2.0,
                    fields: PnlFields::Direct {
                        pnl: pnl(day, hour),
                        contracts: 1.0,
                    },
                });
            }
        }
        day = day.succ_opt().unwrap();
    }
    SourceTrades::new(label, Dialect::Direct, trades)
}

/// Entry hours `curve` traded on `day`.
fn hours_on(curve: &EquityCurve, day: NaiveDate) -> Vec<u32> {
    curve
        .trades
        .iter()
        .filter(|t| t.entry_time.date() == day)
        .map(|t| t.entry_time.hour())
        .collect()
}

fn one_contract() -> StrategyConfig {
    StrategyConfig {
        short_window: 1,
        long_window: 1,
        short_weight: 100,
        long_weight: 0,
        tranches: 1,
        min_tranches: 1,
        max_tranches: 1,
        calc_type: CalcType::Pnl,
        capital_per_contract: 60_000.0,
        ..StrategyConfig::default()
    }
}

fn simulate(source: SourceTrades, cfg: StrategyConfig, options: &SimulationOptions) -> SimulationOutput {
    let news = NewsCalendar::default();
    let sources = [source];
    let strategies = StrategySet::single(cfg);
    let store = RollingAggregator
        .aggregate(&strategies.jobs(&sources).unwrap(), &news, None)
        .unwrap();
    PortfolioSimulator::new(&store, &news, None, options)
        .run(&strategies)
        .unwrap()
}

#[test]
fn profitable_single_contract_run() {
    let source = write_log("steady", d(2023, 12, 1), d(2024, 2, 9), |_| 100.0);
    assert_eq!(source.label, "steady");
    let options = SimulationOptions {
        start: Some(d(2024, 1, 1)),
        ..SimulationOptions::default()
    };
    let out = simulate(source, one_contract(), &options);
    let curve = out.primary().unwrap();

    // 23 weekdays in January plus 7 in February
    assert_eq!(curve.rows.len(), 30);
    assert_eq!(curve.trades.len(), 30);
    assert!(curve.trades.iter().all(|t| t.quantity == 1));
    assert!(curve.rows.windows(2).all(|w| w[1].current_value > w[0].current_value));
    assert!(curve.rows.iter().all(|r| r.max_drawdown == 0.0 && r.drawdown_days == 0));
    let last = curve.rows.last().unwrap();
    assert_eq!(last.win_streak, 30);
    assert_eq!(last.current_value, 103_000.0);

    let metrics = PerformanceMetrics::from_curve(&curve.rows).unwrap();
    assert_eq!(metrics.drawdown_pct, 0.0);
    assert!(metrics.mar.is_infinite());
    assert_eq!(metrics.max_win_streak, 30);
}

#[test]
fn excluded_weekday_never_trades() {
    let source = write_log("no_wednesday", d(2023, 12, 1), d(2024, 2, 29), |_| 100.0);
    let cfg = StrategyConfig {
        weekday_exclusions: vec![Weekday::Wed],
        ..one_contract()
    };
    let out = simulate(source, cfg, &SimulationOptions::default());
    let curve = out.primary().unwrap();
    assert!(!curve.rows.is_empty());
    assert!(curve.rows.iter().all(|r| r.date.weekday() != Weekday::Wed));
    assert!(curve.trades.iter().all(|t| t.entry_time.weekday() != Weekday::Wed));
}

#[test]
fn skipped_day_extends_the_drawdown_clock() {
    let source = write_log("dip", d(2023, 12, 1), d(2024, 1, 31), |day| {
        if day == d(2024, 1, 8) { -500.0 } else { 100.0 }
    });
    let cfg = StrategyConfig {
        weekday_exclusions: vec![Weekday::Tue],
        ..one_contract()
    };
    let out = simulate(source, cfg, &SimulationOptions::default());
    let rows = &out.primary().unwrap().rows;

    let monday = rows.iter().find(|r| r.date == d(2024, 1, 8)).unwrap();
    assert_eq!(monday.drawdown_days, 1);
    assert!(rows.iter().all(|r| r.date != d(2024, 1, 9)));
    // Tuesday sat out but still counted
    let wednesday = rows.iter().find(|r| r.date == d(2024, 1, 10)).unwrap();
    assert!(wednesday.current_drawdown > 0.0);
    assert_eq!(wednesday.drawdown_days, 3);
}

#[test]
fn auto_exclusion_skips_a_losing_weekday() {
    let source = write_log("losing_mondays", d(2023, 10, 2), d(2024, 2, 29), |day| {
        if day.weekday() == Weekday::Mon { -50.0 } else { 100.0 }
    });
    let cfg = StrategyConfig {
        auto_exclusions: true,
        ..one_contract()
    };
    let out = simulate(source, cfg, &SimulationOptions::default());
    assert_eq!(out.window.replay_start, d(2023, 11, 1));
    assert_eq!(out.window.warm_up_threshold, d(2023, 12, 1));

    let curve = out.primary().unwrap();
    assert!(curve.rows.iter().all(|r| r.date >= d(2023, 12, 1)));
    assert!(curve.rows.iter().all(|r| r.date.weekday() != Weekday::Mon));
    assert!(curve.rows.iter().any(|r| r.date.weekday() == Weekday::Tue));
}

#[test]
fn passthrough_member_trades_every_entry_time() {
    let from = d(2023, 12, 1);
    let to = d(2024, 1, 31);
    let a = hourly_puts("a", from, to, &[10], |_, _| 10.0);
    let p = hourly_puts("p", from, to, &[10, 11], |_, _| 1.0);

    let mut members = BTreeMap::new();
    members.insert("a".to_string(), StrategyConfig {
        capital_per_contract: 50_000.0,
        portfolio_weight: 50.0,
        ..one_contract()
    });
    members.insert("p".to_string(), StrategyConfig {
        passthrough: true,
        capital_per_contract: 10_000.0,
        portfolio_weight: 50.0,
        ..one_contract()
    });
    let strategies = StrategySet::Portfolio(members);
    let sources = [a, p];
    let news = NewsCalendar::default();
    let store = RollingAggregator
        .aggregate(&strategies.jobs(&sources).unwrap(), &news, None)
        .unwrap();
    let out = PortfolioSimulator::new(&store, &news, None, &SimulationOptions::default())
        .run(&strategies)
        .unwrap();

    let names: Vec<&str> = out.curves.iter().map(|c| c.name.as_str()).collect();
    assert_eq!(names, ["Portfolio", "a", "p"]);
    assert_eq!(out.window.replay_start, d(2024, 1, 1));

    // 100k * 50% / 10k over two entry times
    let member = out.curve("p").unwrap();
    assert_eq!(member.rows.len(), 23);
    assert_eq!(member.trades.len(), 46);
    assert!(member.trades.iter().all(|t| t.quantity == 2));
    assert_eq!(hours_on(member, d(2024, 1, 2)), [10, 11]);
    // the member lane sizes from its own 100k
    assert!(out.curve("a").unwrap().trades.iter().all(|t| t.quantity == 2));

    let portfolio = out.curve(PORTFOLIO_LANE).unwrap();
    for t in &portfolio.trades {
        let expected = if t.source == "p" { 2 } else { 1 };
        assert_eq!(t.quantity, expected, "{} at {}", t.source, t.entry_time);
    }
    assert_eq!(portfolio.rows.len(), 23);
    assert!(portfolio.rows.iter().all(|r| r.day_pnl == 14.0));
    assert_eq!(portfolio.rows.last().unwrap().current_value, 100_000.0 + 23.0 * 14.0);
}

#[test]
fn gap_lanes_use_the_gap_side_tables() {
    let up = [d(2023, 12, 4), d(2023, 12, 11), d(2024, 1, 8)];
    let down = [d(2023, 12, 5), d(2023, 12, 12), d(2024, 1, 9)];
    let mut csv = String::from("Date,Gap,Gap%\n");
    for day in up {
        csv.push_str(&format!("{day},10.0,0.2\n"));
    }
    for day in down {
        csv.push_str(&format!("{day},-10.0,-0.2\n"));
    }
    // inside the threshold: a plain day
    csv.push_str("2024-01-10,2.0,0.04\n");
    let path = scratch_dir("gaps").join("gaps.csv");
    fs::write(&path, csv).unwrap();
    let gaps = load_gaps(&path).unwrap();
    assert_eq!(gaps.len(), 7);
    assert_eq!(gaps[&d(2024, 1, 9)].points, -10.0);

    let source = hourly_puts("spx", d(2023, 12, 1), d(2024, 1, 31), &[10, 11, 12], |day, hour| {
        match hour {
            11 if up.contains(&day) => 300.0,
            12 if down.contains(&day) => 300.0,
            10 if !up.contains(&day) && !down.contains(&day) => 100.0,
            _ => 0.0,
        }
    });
    let strategies = StrategySet::single(StrategyConfig {
        gap_filter: Some(GapFilter {
            threshold: 5.0,
            use_percent: false,
        }),
        ..one_contract()
    });
    let news = NewsCalendar::default();
    let sources = [source];
    let store = RollingAggregator
        .aggregate(&strategies.jobs(&sources).unwrap(), &news, Some(&gaps))
        .unwrap();
    let out = PortfolioSimulator::new(&store, &news, Some(&gaps), &SimulationOptions::default())
        .run(&strategies)
        .unwrap();

    let names: Vec<&str> = out.curves.iter().map(|c| c.name.as_str()).collect();
    assert_eq!(names, ["All-Combined", "All-Combined-Gap"]);

    let gap = out.curve("All-Combined-Gap").unwrap();
    assert_eq!(hours_on(gap, d(2024, 1, 8)), [11]);
    assert_eq!(hours_on(gap, d(2024, 1, 9)), [12]);
    assert_eq!(hours_on(gap, d(2024, 1, 10)), [10]);

    let plain = out.curve("All-Combined").unwrap();
    for day in [d(2024, 1, 8), d(2024, 1, 9), d(2024, 1, 10)] {
        assert_eq!(hours_on(plain, day), [10]);
    }
    let gap_total = gap.rows.last().unwrap().current_value;
    let plain_total = plain.rows.last().unwrap().current_value;
    assert_eq!(gap_total - plain_total, 600.0);
}
