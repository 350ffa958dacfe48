use std::collections::HashSet;
use std::time::Duration;

use rand::Rng;
use rand::rngs::StdRng;
use serde::{Deserialize, Serialize};

use crate::config::{AggPeriod, CalcType, StrategyConfig};
use crate::error::{ConfigError, SearchError};

/// Long window of the "one average" preset, in months.
pub const SINGLE_AVERAGE_WINDOW: u32 = 12;

/// Searchable traits, in mutation order.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Trait {
    ShortWindow,
    /// Both averaging weights; the long weight is always `100 - short`.
    Weights,
    LongWindow,
    Tranches,
    CalcType,
    AggPeriod,
    PutOrCall,
    PerWeekday,
}

impl Trait {
    pub const ALL: [Trait; 8] = [
        Trait::ShortWindow,
        Trait::Weights,
        Trait::LongWindow,
        Trait::Tranches,
        Trait::CalcType,
        Trait::AggPeriod,
        Trait::PutOrCall,
        Trait::PerWeekday,
    ];
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchDomain {
    /// Upper bound of both averaging windows, in months.
    pub max_window: u32,
    pub weight_step: u32,
    pub max_tranches: u32,
}

impl Default for SearchDomain {
    fn default() -> Self {
        Self {
            max_window: 12,
            weight_step: 5,
            max_tranches: 15,
        }
    }
}

impl SearchDomain {
    pub fn validate(&self) -> Result<(), SearchError> {
        if self.max_window == 0
            || self.max_tranches == 0
            || self.weight_step == 0
            || self.weight_step > 100
        {
            return Err(SearchError::EmptyDomain);
        }
        Ok(())
    }

    pub fn weights(&self) -> impl Iterator<Item = u32> {
        (self.weight_step..=100).step_by(self.weight_step.max(1) as usize)
    }
}

/// Trait values held fixed while the rest are drawn. Used both for
/// user-supplied static overrides and for what a child inherits.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FixedTraits {
    pub short_window: Option<u32>,
    pub short_weight: Option<u32>,
    pub long_window: Option<u32>,
    pub tranches: Option<u32>,
    pub calc_type: Option<CalcType>,
    pub agg_period: Option<AggPeriod>,
    pub put_or_call: Option<bool>,
    pub per_weekday: Option<bool>,
}

impl FixedTraits {
    pub fn from_config(cfg: &StrategyConfig) -> Self {
        Self {
            short_window: Some(cfg.short_window),
            short_weight: Some(cfg.short_weight),
            long_window: Some(cfg.long_window),
            tranches: Some(cfg.tranches),
            calc_type: Some(cfg.calc_type),
            agg_period: Some(cfg.agg_period),
            put_or_call: Some(cfg.put_or_call),
            per_weekday: Some(cfg.per_weekday),
        }
    }

    /// Takes the listed traits from `cfg`.
    pub fn pick(cfg: &StrategyConfig, traits: &[Trait]) -> Self {
        let all = Self::from_config(cfg);
        let mut out = Self::default();
        for &t in traits {
            out.copy_from(&all, t);
        }
        out
    }

    /// Long window pinned at `SINGLE_AVERAGE_WINDOW` with zero weight, so
    /// only the short average matters.
    pub fn single_average(mut self) -> Self {
        self.long_window = Some(SINGLE_AVERAGE_WINDOW);
        self.short_weight = Some(100);
        self
    }

    pub fn is_fixed(&self, t: Trait) -> bool {
        match t {
            Trait::ShortWindow => self.short_window.is_some(),
            Trait::Weights => self.short_weight.is_some(),
            Trait::LongWindow => self.long_window.is_some(),
            Trait::Tranches => self.tranches.is_some(),
            Trait::CalcType => self.calc_type.is_some(),
            Trait::AggPeriod => self.agg_period.is_some(),
            Trait::PutOrCall => self.put_or_call.is_some(),
            Trait::PerWeekday => self.per_weekday.is_some(),
        }
    }

    pub fn clear(&mut self, t: Trait) {
        match t {
            Trait::ShortWindow => self.short_window = None,
            Trait::Weights => self.short_weight = None,
            Trait::LongWindow => self.long_window = None,
            Trait::Tranches => self.tranches = None,
            Trait::CalcType => self.calc_type = None,
            Trait::AggPeriod => self.agg_period = None,
            Trait::PutOrCall => self.put_or_call = None,
            Trait::PerWeekday => self.per_weekday = None,
        }
    }

    fn copy_from(&mut self, other: &FixedTraits, t: Trait) {
        match t {
            Trait::ShortWindow => self.short_window = other.short_window,
            Trait::Weights => self.short_weight = other.short_weight,
            Trait::LongWindow => self.long_window = other.long_window,
            Trait::Tranches => self.tranches = other.tranches,
            Trait::CalcType => self.calc_type = other.calc_type,
            Trait::AggPeriod => self.agg_period = other.agg_period,
            Trait::PutOrCall => self.put_or_call = other.put_or_call,
            Trait::PerWeekday => self.per_weekday = other.per_weekday,
        }
    }

    /// Every trait set in `over` replaces the one here.
    pub fn overlaid(&self, over: &FixedTraits) -> FixedTraits {
        let mut out = self.clone();
        for t in Trait::ALL {
            if over.is_fixed(t) {
                out.copy_from(over, t);
            }
        }
        out
    }
}

#[derive(Clone, Debug)]
pub struct ParameterSpace {
    pub domain: SearchDomain,
    pub statics: FixedTraits,
    /// Supplies every setting that is not searched: capital per contract,
    /// exclusions, threshold and so on.
    pub template: StrategyConfig,
}

impl ParameterSpace {
    /// Fails when the domain is empty or the template and statics do not
    /// make a valid configuration.
    pub fn new(domain: SearchDomain, statics: FixedTraits, template: StrategyConfig) -> Result<Self, SearchError> {
        domain.validate()?;
        let space = Self {
            domain,
            statics,
            template,
        };
        space.assemble(&space.statics)?;
        Ok(space)
    }

    /// Traits the search is allowed to change.
    pub fn free_traits(&self) -> Vec<Trait> {
        Trait::ALL
            .into_iter()
            .filter(|t| !self.statics.is_fixed(*t))
            .collect()
    }

    fn assemble(&self, t: &FixedTraits) -> Result<StrategyConfig, ConfigError> {
        let long_window = t.long_window.unwrap_or(self.template.long_window);
        let short_window = t.short_window.unwrap_or(self.template.short_window).min(long_window);
        StrategyConfig::new(
            short_window,
            long_window,
            t.short_weight.unwrap_or(self.template.short_weight),
            t.tranches.unwrap_or(self.template.tranches),
            StrategyConfig {
                calc_type: t.calc_type.unwrap_or(self.template.calc_type),
                agg_period: t.agg_period.unwrap_or(self.template.agg_period),
                put_or_call: t.put_or_call.unwrap_or(self.template.put_or_call),
                per_weekday: t.per_weekday.unwrap_or(self.template.per_weekday),
                passthrough: false,
                portfolio_weight: 100.0,
                ..self.template.clone()
            },
        )
    }

    /// Draws every trait not fixed by `fixed` or by the static overrides.
    pub fn sample(&self, rng: &mut StdRng, fixed: &FixedTraits) -> Result<StrategyConfig, SearchError> {
        let d = &self.domain;
        let mut t = fixed.overlaid(&self.statics);

        let long = match (t.short_window, t.long_window) {
            (_, Some(long)) => long,
            (Some(short), None) => rng.random_range(short.clamp(1, d.max_window)..=d.max_window),
            (None, None) => rng.random_range(1..=d.max_window),
        };
        t.long_window = Some(long);
        if t.short_window.is_none() {
            t.short_window = Some(rng.random_range(1..=long.min(d.max_window).max(1)));
        }
        if t.short_weight.is_none() {
            let steps = 100 / d.weight_step;
            t.short_weight = Some(rng.random_range(1..=steps) * d.weight_step);
        }
        if t.tranches.is_none() {
            t.tranches = Some(rng.random_range(1..=d.max_tranches));
        }
        if t.calc_type.is_none() {
            t.calc_type = Some(if rng.random_bool(0.5) {
                CalcType::Pcr
            } else {
                CalcType::Pnl
            });
        }
        if t.agg_period.is_none() {
            t.agg_period = Some(AggPeriod::ALL[rng.random_range(0..AggPeriod::ALL.len())]);
        }
        if t.put_or_call.is_none() {
            t.put_or_call = Some(rng.random_bool(0.5));
        }
        if t.per_weekday.is_none() {
            t.per_weekday = Some(rng.random_bool(0.5));
        }
        Ok(self.assemble(&t)?)
    }

    fn window_pairs(&self) -> Vec<(u32, u32)> {
        let max = self.domain.max_window;
        let longs: Vec<u32> = match self.statics.long_window {
            Some(long) => vec![long],
            None => (1..=max).collect(),
        };
        let mut out = Vec::new();
        for long in longs {
            match self.statics.short_window {
                Some(short) if short <= long => out.push((short, long)),
                Some(_) => {}
                None => out.extend((1..=long.min(max)).map(|short| (short, long))),
            }
        }
        // a static short above every long still makes one candidate
        if out.is_empty() {
            let long = self.statics.long_window.unwrap_or(max);
            let short = self.statics.short_window.unwrap_or(1).min(long);
            out.push((short, long));
        }
        out
    }

    fn axis<T: Copy>(fixed: Option<T>, all: &[T]) -> Vec<T> {
        match fixed {
            Some(v) => vec![v],
            None => all.to_vec(),
        }
    }

    /// Every distinct configuration of the domain.
    pub fn enumerate(&self) -> Result<Vec<StrategyConfig>, SearchError> {
        let s = &self.statics;
        let weights: Vec<u32> = match s.short_weight {
            Some(w) => vec![w],
            None => self.domain.weights().collect(),
        };
        let tranches: Vec<u32> = match s.tranches {
            Some(n) => vec![n],
            None => (1..=self.domain.max_tranches).collect(),
        };
        let calcs = Self::axis(s.calc_type, &[CalcType::Pcr, CalcType::Pnl]);
        let aggs = Self::axis(s.agg_period, &AggPeriod::ALL);
        let bools = [false, true];
        let pcs = Self::axis(s.put_or_call, &bools);
        let wds = Self::axis(s.per_weekday, &bools);

        let mut seen = HashSet::new();
        let mut out = Vec::new();
        for (short, long) in self.window_pairs() {
            for &w in &weights {
                for &n in &tranches {
                    for &calc in &calcs {
                        for &agg in &aggs {
                            for &pc in &pcs {
                                for &wd in &wds {
                                    let cfg = self.assemble(&FixedTraits {
                                        short_window: Some(short),
                                        short_weight: Some(w),
                                        long_window: Some(long),
                                        tranches: Some(n),
                                        calc_type: Some(calc),
                                        agg_period: Some(agg),
                                        put_or_call: Some(pc),
                                        per_weekday: Some(wd),
                                    })?;
                                    if seen.insert(cfg.fingerprint()) {
                                        out.push(cfg);
                                    }
                                }
                            }
                        }
                    }
                }
            }
        }
        Ok(out)
    }

    /// Size of the domain without materialising it.
    pub fn combination_count(&self) -> u64 {
        let s = &self.statics;
        let count = |fixed: bool, n: u64| if fixed { 1 } else { n };
        self.window_pairs().len() as u64
            * count(s.short_weight.is_some(), self.domain.weights().count() as u64)
            * count(s.tranches.is_some(), self.domain.max_tranches as u64)
            * count(s.calc_type.is_some(), 2)
            * count(s.agg_period.is_some(), AggPeriod::ALL.len() as u64)
            * count(s.put_or_call.is_some(), 2)
            * count(s.per_weekday.is_some(), 2)
    }
}

/// Up-front size and duration estimate of a search.
#[derive(Clone, Copy, Debug, PartialEq, Serialize)]
pub struct SearchPlan {
    pub total_possible: u64,
    pub total_tests: u64,
    pub estimated: Duration,
}

impl SearchPlan {
    pub fn exhaustive(space: &ParameterSpace, time_per_test: Duration) -> Self {
        let total = space.combination_count();
        Self {
            total_possible: total,
            total_tests: total,
            estimated: time_per_test.saturating_mul(total.min(u32::MAX as u64) as u32),
        }
    }

    pub fn genetic(
        space: &ParameterSpace,
        parents: u32,
        children: u32,
        generations: u32,
        time_per_test: Duration,
    ) -> Self {
        let tests = generations as u64 * children as u64 * parents as u64 + parents as u64;
        Self {
            total_possible: space.combination_count(),
            total_tests: tests,
            estimated: time_per_test.saturating_mul(tests.min(u32::MAX as u64) as u32),
        }
    }

    pub fn eta_label(&self) -> String {
        let secs = self.estimated.as_secs();
        format!("{}h:{}m:{}s", secs / 3600, (secs / 60) % 60, secs % 60)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;

    fn space(domain: SearchDomain, statics: FixedTraits) -> ParameterSpace {
        ParameterSpace::new(domain, statics, StrategyConfig::default()).unwrap()
    }

    #[test]
    fn samples_stay_inside_the_domain() {
        let sp = space(SearchDomain::default(), FixedTraits::default());
        let mut rng = StdRng::seed_from_u64(7);
        for _ in 0..500 {
            let cfg = sp.sample(&mut rng, &FixedTraits::default()).unwrap();
            assert!(cfg.validate().is_ok(), "{cfg}");
            assert!(cfg.long_window <= 12);
            assert_eq!(cfg.short_weight % 5, 0);
            assert!((1..=15).contains(&cfg.tranches));
            assert_eq!(cfg.min_tranches, cfg.tranches);
        }
    }

    #[test]
    fn statics_are_never_sampled() {
        let statics = FixedTraits {
            calc_type: Some(CalcType::Pnl),
            per_weekday: Some(true),
            ..FixedTraits::default()
        }
        .single_average();
        let sp = space(SearchDomain::default(), statics);
        assert!(!sp.free_traits().contains(&Trait::Weights));
        assert!(!sp.free_traits().contains(&Trait::LongWindow));
        let mut rng = StdRng::seed_from_u64(1);
        for _ in 0..100 {
            let cfg = sp.sample(&mut rng, &FixedTraits::default()).unwrap();
            assert_eq!(cfg.calc_type, CalcType::Pnl);
            assert!(cfg.per_weekday);
            assert_eq!((cfg.long_window, cfg.long_weight), (12, 0));
        }
    }

    #[test]
    fn enumeration_matches_count() {
        let statics = FixedTraits {
            tranches: Some(3),
            agg_period: Some(AggPeriod::Monthly),
            ..FixedTraits::default()
        };
        let domain = SearchDomain {
            max_window: 3,
            weight_step: 50,
            max_tranches: 15,
        };
        let sp = space(domain, statics);
        let all = sp.enumerate().unwrap();
        // 6 window pairs * 2 weights * 2 calc * 2 pc * 2 weekday
        assert_eq!(all.len(), 96);
        assert_eq!(sp.combination_count(), 96);
        let unique: HashSet<String> = all.iter().map(|c| c.fingerprint()).collect();
        assert_eq!(unique.len(), all.len());
    }

    #[test]
    fn default_domain_count_matches_formula() {
        let sp = space(SearchDomain::default(), FixedTraits::default());
        // 20 weights * 78 window pairs * 15 tranches * 2 * 3 * 2 * 2
        assert_eq!(sp.combination_count(), 20 * 78 * 15 * 2 * 3 * 2 * 2);
    }

    #[test]
    fn plan_estimates_genetic_runs() {
        let sp = space(SearchDomain::default(), FixedTraits::default());
        let plan = SearchPlan::genetic(&sp, 10, 5, 10, Duration::from_secs(15));
        assert_eq!(plan.total_tests, 510);
        assert_eq!(plan.eta_label(), "2h:7m:30s");
    }

    #[test]
    fn bad_domain_is_rejected() {
        let domain = SearchDomain {
            weight_step: 0,
            ..SearchDomain::default()
        };
        assert!(matches!(
            ParameterSpace::new(domain, FixedTraits::default(), StrategyConfig::default()),
            Err(SearchError::EmptyDomain)
        ));
    }

    #[test]
    fn single_average_keeps_a_twelve_month_long_window() {
        let statics = FixedTraits {
            short_weight: Some(50),
            tranches: Some(1),
            calc_type: Some(CalcType::Pnl),
            agg_period: Some(AggPeriod::Monthly),
            put_or_call: Some(false),
            per_weekday: Some(false),
            ..FixedTraits::default()
        }
        .single_average();
        let domain = SearchDomain {
            max_window: 4,
            ..SearchDomain::default()
        };
        let sp = space(domain, statics);
        let all = sp.enumerate().unwrap();
        let pairs: Vec<(u32, u32)> = all.iter().map(|c| (c.short_window, c.long_window)).collect();
        assert_eq!(pairs, [(1, 12), (2, 12), (3, 12), (4, 12)]);
        assert!(all.iter().all(|c| c.short_weight == 100 && c.long_weight == 0));
        assert_eq!(sp.combination_count(), 4);

        let mut rng = StdRng::seed_from_u64(3);
        for _ in 0..50 {
            let cfg = sp.sample(&mut rng, &FixedTraits::default()).unwrap();
            assert_eq!(cfg.long_window, SINGLE_AVERAGE_WINDOW);
            assert!((1..=4).contains(&cfg.short_window));
        }
    }

    #[test]
    fn invalid_template_is_rejected_up_front() {
        let template = StrategyConfig {
            capital_per_contract: 0.0,
            ..StrategyConfig::default()
        };
        let err = ParameterSpace::new(SearchDomain::default(), FixedTraits::default(), template).unwrap_err();
        assert!(matches!(err, SearchError::Config(ConfigError::CapitalPerContract(_))));

        let statics = FixedTraits {
            short_weight: Some(120),
            ..FixedTraits::default()
        };
        let err = ParameterSpace::new(SearchDomain::default(), statics, StrategyConfig::default()).unwrap_err();
        assert!(matches!(err, SearchError::Config(ConfigError::WeightSum { short: 120, .. })));
    }
}
