//! Quota arithmetic: per-resource accumulation of quantities and the
//! estimate used to size quota objects shared between projects.

mod quantity;

pub use quantity::{Amount, Format, QuantityError};

use std::collections::BTreeMap;

use k8s_openapi::apimachinery::pkg::api::resource::Quantity;

/// resource name -> amount
pub type Quota = BTreeMap<String, Amount>;

pub fn parse_quota(raw: &BTreeMap<String, Quantity>) -> Result<Quota, QuantityError> {
    raw.iter()
        .map(|(name, q)| Ok((name.clone(), Amount::from_quantity(q)?)))
        .collect()
}

pub fn to_quantities(quota: &Quota) -> BTreeMap<String, Quantity> {
    quota
        .iter()
        .map(|(name, amount)| (name.clone(), amount.to_quantity()))
        .collect()
}

/// Entries in `overrides` replace the matching entries in `defaults`.
pub fn merge(defaults: &Quota, overrides: &Quota) -> Quota {
    let mut merged = defaults.clone();
    merged.extend(overrides.iter().map(|(k, v)| (k.clone(), *v)));
    merged
}

/// Semantic comparison of two raw resource lists, so `1Gi` and `1024Mi`
/// count as the same value.
pub fn same_values(a: &BTreeMap<String, Quantity>, b: &BTreeMap<String, Quantity>) -> bool {
    match (parse_quota(a), parse_quota(b)) {
        (Ok(a), Ok(b)) => a == b,
        _ => a == b,
    }
}

fn combine(candidates: &[&Quota], pick: fn(Amount, Amount) -> Amount) -> Quota {
    let mut result = Quota::new();
    for candidate in candidates {
        for (name, amount) in candidate.iter() {
            result
                .entry(name.clone())
                .and_modify(|current| *current = pick(*current, *amount))
                .or_insert(*amount);
        }
    }
    result
}

/// Scratch structure holding, per resource name, every contributed amount in
/// the order it was appended.
#[derive(Debug, Default, Clone)]
pub struct QuotaAccumulator {
    values: BTreeMap<String, Vec<Amount>>,
}

impl QuotaAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a resource name without contributing to it; aggregates for
    /// it come out as an explicit zero until something is appended.
    pub fn track(&mut self, resource: &str) {
        self.values.entry(resource.to_string()).or_default();
    }

    pub fn append(&mut self, quota: &Quota) {
        for (name, amount) in quota {
            self.values.entry(name.clone()).or_default().push(*amount);
        }
    }

    pub fn contributions(&self, resource: &str) -> &[Amount] {
        self.values.get(resource).map(Vec::as_slice).unwrap_or(&[])
    }

    fn fold(&self, f: impl Fn(&[Amount]) -> Amount) -> Quota {
        self.values
            .iter()
            .map(|(name, amounts)| (name.clone(), f(amounts)))
            .collect()
    }

    pub fn sum(&self) -> Quota {
        self.fold(sum_of)
    }

    pub fn max(&self) -> Quota {
        self.fold(|amounts| {
            amounts
                .iter()
                .copied()
                .max()
                .unwrap_or_else(|| Amount::zero(Format::DecimalSI))
        })
    }

    pub fn min(&self) -> Quota {
        self.fold(|amounts| {
            amounts
                .iter()
                .copied()
                .min()
                .unwrap_or_else(|| Amount::zero(Format::DecimalSI))
        })
    }

    /// Per resource, the sum of the two largest contributions (or of all of
    /// them when there are fewer than two).
    pub fn largest_two(&self) -> Quota {
        self.fold(|amounts| {
            let mut sorted = amounts.to_vec();
            sorted.sort_by(|a, b| b.cmp(a));
            sum_of(&sorted[..sorted.len().min(2)])
        })
    }

    /// Per resource: `min(max(sum * ratio, largest_two, min_quota), max_quota)`.
    ///
    /// A resource missing from a candidate simply does not take part in that
    /// comparison; a resource missing from `max_quota` is not capped. Callers
    /// are expected to configure `max_quota >= min_quota`.
    pub fn optimal_values(&self, ratio: f64, min_quota: &Quota, max_quota: &Quota) -> Quota {
        let scaled: Quota = self
            .sum()
            .into_iter()
            .map(|(name, amount)| (name, amount.scale(ratio)))
            .collect();
        let largest_two = self.largest_two();

        let generous = combine(&[&scaled, &largest_two, min_quota], std::cmp::max);
        generous
            .into_iter()
            .map(|(name, amount)| {
                let capped = match max_quota.get(&name) {
                    Some(ceiling) => std::cmp::min(amount, *ceiling),
                    None => amount,
                };
                (name, capped)
            })
            .collect()
    }
}

fn sum_of(amounts: &[Amount]) -> Amount {
    let format = amounts.first().map(Amount::format).unwrap_or_default();
    amounts
        .iter()
        .fold(Amount::zero(format), |total, amount| total + *amount)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn quota(entries: &[(&str, &str)]) -> Quota {
        entries
            .iter()
            .map(|(k, v)| (k.to_string(), Amount::parse(v).unwrap()))
            .collect()
    }

    fn example_accumulator() -> QuotaAccumulator {
        let mut acc = QuotaAccumulator::new();
        acc.append(&quota(&[("cpu", "3"), ("memory", "6Gi")]));
        acc.append(&quota(&[("cpu", "6"), ("memory", "12Gi")]));
        acc.append(&quota(&[("cpu", "3"), ("memory", "12Gi")]));
        acc
    }

    #[test]
    fn test_sum() {
        let acc = example_accumulator();
        assert_eq!(acc.sum(), quota(&[("cpu", "12"), ("memory", "30Gi")]));
    }

    #[test]
    fn test_largest_two() {
        let acc = example_accumulator();
        assert_eq!(acc.largest_two(), quota(&[("cpu", "9"), ("memory", "24Gi")]));

        let mut single = QuotaAccumulator::new();
        single.append(&quota(&[("cpu", "2")]));
        assert_eq!(single.largest_two(), quota(&[("cpu", "2")]));
    }

    #[test]
    fn test_min_max() {
        let acc = example_accumulator();
        assert_eq!(acc.max(), quota(&[("cpu", "6"), ("memory", "12Gi")]));
        assert_eq!(acc.min(), quota(&[("cpu", "3"), ("memory", "6Gi")]));
    }

    #[test]
    fn test_tracked_resource_without_contributions_is_zero() {
        let mut acc = QuotaAccumulator::new();
        acc.track("storage");
        assert_eq!(acc.max().get("storage"), Some(&Amount::zero(Format::DecimalSI)));
        assert_eq!(acc.min().get("storage"), Some(&Amount::zero(Format::DecimalSI)));
        assert_eq!(acc.sum().get("storage"), Some(&Amount::zero(Format::DecimalSI)));
        assert!(acc.contributions("storage").is_empty());
    }

    #[test]
    fn test_optimal_values_floor_and_ceiling() {
        let acc = example_accumulator();
        let result = acc.optimal_values(
            0.7,
            &quota(&[("cpu", "10")]),
            &quota(&[("memory", "9Gi")]),
        );
        assert_eq!(result, quota(&[("cpu", "10"), ("memory", "9Gi")]));
        assert_eq!(result["memory"].to_string(), "9Gi");
    }

    #[test]
    fn test_optimal_values_scaled_sum_wins() {
        let mut acc = QuotaAccumulator::new();
        for _ in 0..5 {
            acc.append(&quota(&[("cpu", "2")]));
        }
        // sum*0.9 = 9, largest two = 4
        let result = acc.optimal_values(0.9, &Quota::new(), &Quota::new());
        assert_eq!(result, quota(&[("cpu", "9")]));
    }

    #[test]
    fn test_optimal_values_matches_clamp_formula() {
        let acc = example_accumulator();
        let min = quota(&[("cpu", "1"), ("memory", "1Gi")]);
        let max = quota(&[("cpu", "100"), ("memory", "100Gi")]);
        for ratio in [0.0, 0.25, 0.5, 0.75, 1.0] {
            let result = acc.optimal_values(ratio, &min, &max);
            let sum = acc.sum();
            let two = acc.largest_two();
            for name in ["cpu", "memory"] {
                let expected = sum[name]
                    .scale(ratio)
                    .max(two[name])
                    .max(min[name])
                    .min(max[name]);
                assert_eq!(result[name], expected, "ratio {ratio} resource {name}");
                assert!(result[name] >= min[name]);
            }
        }
    }

    #[test]
    fn test_merge_overrides_defaults() {
        let merged = merge(
            &quota(&[("cpu", "1"), ("memory", "1Gi")]),
            &quota(&[("memory", "4Gi")]),
        );
        assert_eq!(merged, quota(&[("cpu", "1"), ("memory", "4Gi")]));
    }

    #[test]
    fn test_same_values_is_semantic() {
        let a = BTreeMap::from([("memory".to_string(), Quantity("1Gi".into()))]);
        let b = BTreeMap::from([("memory".to_string(), Quantity("1024Mi".into()))]);
        assert!(same_values(&a, &b));
    }
}
