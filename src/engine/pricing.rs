use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use crate::model::*;

/// Resolved price of one night.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct NightlyPrice {
    pub date: NaiveDate,
    pub price: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StayPrice {
    pub nights: Vec<NightlyPrice>,
    pub total: f64,
}

impl StayPrice {
    pub fn average_nightly(&self) -> f64 {
        if self.nights.is_empty() {
            0.0
        } else {
            self.total / self.nights.len() as f64
        }
    }
}

/// Price for a single date: first override whose inclusive span contains the
/// date, else the default price, else zero.
pub fn resolve_price<'a>(
    default_price: Option<f64>,
    overrides: impl IntoIterator<Item = &'a PriceOverride>,
    date: NaiveDate,
) -> f64 {
    overrides
        .into_iter()
        .find(|o| o.deleted_at.is_none() && o.span.contains(date))
        .map(|o| o.price)
        .or(default_price)
        .unwrap_or(0.0)
        .max(0.0)
}

/// Per-night prices and their sum over `[check_in, check_out)`.
pub fn price_stay(
    default_price: Option<f64>,
    overrides: &[PriceOverride],
    stay: &StayRange,
) -> StayPrice {
    let nights: Vec<NightlyPrice> = stay
        .nights_iter()
        .map(|date| NightlyPrice {
            date,
            price: resolve_price(default_price, overrides, date),
        })
        .collect();
    let total = nights.iter().map(|n| n.price).sum();
    StayPrice { nights, total }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn d(s: &str) -> NaiveDate {
        s.parse().unwrap()
    }

    fn ovr(start: &str, end: &str, price: f64) -> PriceOverride {
        PriceOverride {
            span: DateSpan::new(d(start), d(end)),
            price,
            deleted_at: None,
        }
    }

    #[test]
    fn default_price_without_overrides() {
        assert_eq!(resolve_price(Some(100.0), &[], d("2024-06-01")), 100.0);
    }

    #[test]
    fn zero_when_nothing_is_set() {
        assert_eq!(resolve_price(None, &[], d("2024-06-01")), 0.0);
    }

    #[test]
    fn override_range_is_inclusive() {
        let overrides = vec![ovr("2024-06-01", "2024-06-03", 150.0)];
        assert_eq!(resolve_price(Some(100.0), &overrides, d("2024-05-31")), 100.0);
        assert_eq!(resolve_price(Some(100.0), &overrides, d("2024-06-01")), 150.0);
        assert_eq!(resolve_price(Some(100.0), &overrides, d("2024-06-03")), 150.0);
        assert_eq!(resolve_price(Some(100.0), &overrides, d("2024-06-04")), 100.0);
    }

    #[test]
    fn first_matching_override_wins() {
        let overrides = vec![
            ovr("2024-06-01", "2024-06-10", 150.0),
            ovr("2024-06-05", "2024-06-06", 300.0),
        ];
        assert_eq!(resolve_price(Some(100.0), &overrides, d("2024-06-05")), 150.0);
    }

    #[test]
    fn deleted_override_is_ignored() {
        let mut o = ovr("2024-06-01", "2024-06-10", 150.0);
        o.deleted_at = Some(1);
        assert_eq!(resolve_price(Some(100.0), &[o], d("2024-06-05")), 100.0);
    }

    #[test]
    fn stay_total_is_sum_of_nights() {
        // Override covers the 2nd and 3rd; checkout day is not charged.
        let overrides = vec![ovr("2024-06-02", "2024-06-03", 200.0)];
        let stay = StayRange::new(d("2024-06-01"), d("2024-06-05"));
        let price = price_stay(Some(100.0), &overrides, &stay);
        let per_night: Vec<f64> = price.nights.iter().map(|n| n.price).collect();
        assert_eq!(per_night, vec![100.0, 200.0, 200.0, 100.0]);
        assert_eq!(price.total, 600.0);
        assert_eq!(price.average_nightly(), 150.0);
    }

    #[test]
    fn repeated_resolution_is_stable() {
        let overrides = vec![ovr("2024-06-02", "2024-06-03", 200.0)];
        let stay = StayRange::new(d("2024-06-01"), d("2024-06-05"));
        let a = price_stay(Some(100.0), &overrides, &stay);
        let b = price_stay(Some(100.0), &overrides, &stay);
        assert_eq!(a, b);
    }
}
