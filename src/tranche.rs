/// Per-day split of contracts across entry-time slots.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TrancheAllocation {
    pub quantities: Vec<u32>,
}

impl TrancheAllocation {
    /// `count` slots of one contract each, used when scaling is off.
    pub fn unit(count: u32) -> Self {
        Self {
            quantities: vec![1; count as usize],
        }
    }

    pub fn tranches(&self) -> usize {
        self.quantities.len()
    }

    pub fn contracts(&self) -> u64 {
        self.quantities.iter().map(|&q| q as u64).sum()
    }

    /// Quantity for slot `i`; slots past the end trade nothing.
    pub fn quantity(&self, i: usize) -> u32 {
        self.quantities.get(i).copied().unwrap_or(0)
    }
}

/// Contracts affordable with `capital`.
pub fn affordable_contracts(capital: f64, capital_per_contract: f64) -> u32 {
    if !(capital > 0.0) || !(capital_per_contract > 0.0) {
        return 0;
    }
    (capital / capital_per_contract).floor().min(u32::MAX as f64) as u32
}

/// Number of tranches for `contracts`, starting from `max` and stepping down
/// while the leftover after an even fill would be a short, non-empty set.
pub fn tranche_count(min: u32, max: u32, contracts: u32) -> u32 {
    let mut tranches = max;
    loop {
        if contracts <= tranches {
            return contracts;
        }
        let per = contracts / tranches;
        let remain = contracts - tranches * per;
        if remain == 0 || remain >= min {
            return tranches;
        }
        if tranches <= min.max(1) {
            return tranches;
        }
        tranches -= 1;
    }
}

/// Spreads `contracts` over `tranches` slots, front-loading the remainder.
pub fn tranche_quantities(tranches: u32, contracts: u32) -> Vec<u32> {
    if tranches == 0 {
        return Vec::new();
    }
    let per = contracts / tranches;
    let extra = contracts % tranches;
    (0..tranches)
        .map(|i| if i < extra { per + 1 } else { per })
        .collect()
}

pub fn allocate(capital: f64, capital_per_contract: f64, min: u32, max: u32) -> TrancheAllocation {
    let contracts = affordable_contracts(capital, capital_per_contract);
    let tranches = tranche_count(min, max.max(1), contracts);
    TrancheAllocation {
        quantities: tranche_quantities(tranches, contracts),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fewer_contracts_than_tranches() {
        let a = allocate(18_000.0, 6_000.0, 2, 5);
        assert_eq!(a.quantities, vec![1, 1, 1]);
    }

    #[test]
    fn even_fill_keeps_max() {
        let a = allocate(60_000.0, 6_000.0, 2, 5);
        assert_eq!(a.quantities, vec![2, 2, 2, 2, 2]);
    }

    #[test]
    fn short_remainder_steps_down() {
        // 11 over 5 leaves 1 (< min 2), 11 over 4 leaves 3 (>= 2)
        assert_eq!(tranche_count(2, 5, 11), 4);
        let a = allocate(66_000.0, 6_000.0, 2, 5);
        assert_eq!(a.quantities, vec![3, 3, 3, 2]);
    }

    #[test]
    fn never_drops_below_min() {
        // 7 over 4 leaves 3 (< 4), cannot step down further
        assert_eq!(tranche_count(4, 4, 7), 4);
        assert_eq!(tranche_quantities(4, 7), vec![2, 2, 2, 1]);
    }

    #[test]
    fn broke_account_trades_nothing() {
        assert_eq!(allocate(-500.0, 6_000.0, 1, 3).contracts(), 0);
        assert_eq!(allocate(5_999.0, 6_000.0, 1, 3).tranches(), 0);
    }

    #[test]
    fn quantities_always_sum_to_contracts() {
        for capital in (0..400).map(|k| k as f64 * 1_537.0) {
            for per in [500.0, 1_000.0, 6_000.0, 7_250.5] {
                for max in 1..=8 {
                    for min in 1..=max {
                        let a = allocate(capital, per, min, max);
                        assert_eq!(
                            a.contracts(),
                            affordable_contracts(capital, per) as u64,
                            "capital={capital} per={per} min={min} max={max}"
                        );
                    }
                }
            }
        }
    }
}
