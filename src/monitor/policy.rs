use std::f64::consts::TAU;
use std::time::Duration;

use crate::collab::{PRICE_FEATURES, RESTOCK_FEATURES};
use crate::types::{ProfitableProduct, RestockPrediction};

/// Weight of the restock probability in the urgency score; the remainder
/// goes to profit margin.
const PROBABILITY_WEIGHT: f64 = 0.7;
const MARGIN_WEIGHT: f64 = 0.3;

/// Maps a prediction onto a queue priority and a next-check delay.
///
/// Priority falls as probability or margin rise. The check interval shrinks
/// as probability rises and stays within `[min_interval, max_interval]`.
#[derive(Debug, Clone, Copy)]
pub struct SchedulePolicy {
    pub min_interval: Duration,
    pub max_interval: Duration,
}

impl SchedulePolicy {
    pub fn new(min_interval: Duration, max_interval: Duration) -> Self {
        Self {
            min_interval: min_interval.min(max_interval),
            max_interval,
        }
    }

    /// 0 (most urgent) ..= 100.
    pub fn priority(&self, probability: f64, profit_margin: f64) -> u32 {
        let margin = if profit_margin.is_finite() {
            (profit_margin.max(0.0) / 100.0).min(1.0)
        } else {
            0.0
        };
        let urgency = PROBABILITY_WEIGHT * sanitize(probability) + MARGIN_WEIGHT * margin;
        ((1.0 - urgency) * 100.0).round().clamp(0.0, 100.0) as u32
    }

    pub fn interval(&self, probability: f64, priority: u32) -> Duration {
        let p = sanitize(probability);
        let spread = self.max_interval.saturating_sub(self.min_interval);
        let factor = (1.0 - p) * (0.5 + 0.5 * f64::from(priority.min(100)) / 100.0);
        (self.min_interval + spread.mul_f64(factor.clamp(0.0, 1.0)))
            .clamp(self.min_interval, self.max_interval)
    }

    /// Priority and absolute next-check time (unix seconds) for a
    /// probability observed at `now`.
    pub fn schedule(&self, probability: f64, profit_margin: f64, now: u64) -> (u32, u64) {
        let priority = self.priority(probability, profit_margin);
        let next = now + self.interval(probability, priority).as_secs();
        (priority, next)
    }

    /// Delay before rechecking a SKU after `failures` failed checks in a row:
    /// `min_interval` doubling per failure, capped at `max_interval`.
    pub fn failure_backoff(&self, failures: u32) -> Duration {
        let factor = 2u32.saturating_pow(failures.saturating_sub(1));
        self.min_interval
            .saturating_mul(factor)
            .min(self.max_interval)
    }
}

fn sanitize(probability: f64) -> f64 {
    if probability.is_finite() {
        probability.clamp(0.0, 1.0)
    } else {
        0.0
    }
}

/// Restock model input for `prediction` as seen at `now`.
pub fn restock_features(prediction: &RestockPrediction, now: u64) -> [f64; RESTOCK_FEATURES] {
    let hours_since = now.saturating_sub(prediction.last_check) as f64 / 3600.0;
    let hour_of_day = (now % 86_400) as f64 / 3600.0;
    let angle = TAU * hour_of_day / 24.0;
    let velocity = prediction.sales_velocity.max(0.0);
    [
        sanitize(prediction.probability),
        prediction.profit_margin,
        velocity,
        hours_since,
        f64::from(prediction.check_count),
        (prediction.profit_margin.max(0.0) / 100.0).min(1.0),
        velocity.ln_1p(),
        angle.sin(),
        angle.cos(),
        1.0,
    ]
}

/// Price model input for `product`, with the current restock probability.
pub fn price_features(product: &ProfitableProduct, probability: f64) -> [f64; PRICE_FEATURES] {
    let roi = if product.resale_price > 0.0 {
        (product.resale_price - product.retail_price) / product.resale_price * 100.0
    } else {
        0.0
    };
    [
        product.retail_price,
        product.resale_price,
        product.profit_margin,
        roi,
        f64::from(product.monthly_sales),
        product.sales_velocity,
        sanitize(probability),
        1.0,
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> SchedulePolicy {
        SchedulePolicy::new(Duration::from_secs(60), Duration::from_secs(900))
    }

    fn prediction(probability: f64, margin: f64) -> RestockPrediction {
        RestockPrediction {
            sku: "S".into(),
            probability,
            next_check: 0,
            priority: 0,
            last_check: 0,
            profit_margin: margin,
            sales_velocity: 1.0,
            check_count: 0,
        }
    }

    #[test]
    fn likely_restock_is_checked_sooner() {
        let p = policy();
        let (hi_prio, hi_next) = p.schedule(0.9, 20.0, 1_000);
        let (lo_prio, lo_next) = p.schedule(0.1, 20.0, 1_000);
        assert!(hi_prio < lo_prio);
        assert!(hi_next < lo_next);
    }

    #[test]
    fn interval_is_monotonic_in_probability() {
        let p = policy();
        let mut last = Duration::ZERO;
        for step in (0..=20).rev() {
            let prob = f64::from(step) / 20.0;
            let interval = p.interval(prob, p.priority(prob, 20.0));
            assert!(interval >= last, "{prob}: {interval:?} < {last:?}");
            assert!(interval >= p.min_interval && interval <= p.max_interval);
            last = interval;
        }
    }

    #[test]
    fn priority_falls_with_margin() {
        let p = policy();
        assert!(p.priority(0.5, 80.0) < p.priority(0.5, 10.0));
        assert_eq!(p.priority(1.0, 100.0), 0);
        assert_eq!(p.priority(0.0, 0.0), 100);
        assert_eq!(p.priority(0.0, -50.0), 100);
    }

    #[test]
    fn interval_hits_bounds() {
        let p = policy();
        assert_eq!(p.interval(1.0, 0), Duration::from_secs(60));
        assert_eq!(p.interval(0.0, 100), Duration::from_secs(900));
    }

    #[test]
    fn failure_backoff_doubles_up_to_max() {
        let p = policy();
        assert_eq!(p.failure_backoff(1), Duration::from_secs(60));
        assert_eq!(p.failure_backoff(2), Duration::from_secs(120));
        assert_eq!(p.failure_backoff(4), Duration::from_secs(480));
        assert_eq!(p.failure_backoff(5), Duration::from_secs(900));
        assert_eq!(p.failure_backoff(40), Duration::from_secs(900));
    }

    #[test]
    fn bad_probability_is_treated_as_zero() {
        let p = policy();
        assert_eq!(p.priority(f64::NAN, 0.0), 100);
        assert_eq!(p.interval(f64::NAN, 100), Duration::from_secs(900));
    }

    #[test]
    fn restock_features_follow_documented_order() {
        let mut pred = prediction(0.4, 50.0);
        pred.last_check = 0;
        pred.check_count = 3;
        let f = restock_features(&pred, 7_200);
        assert_eq!(f[0], 0.4);
        assert_eq!(f[1], 50.0);
        assert_eq!(f[3], 2.0);
        assert_eq!(f[4], 3.0);
        assert_eq!(f[5], 0.5);
        assert!((f[6] - 2f64.ln()).abs() < 1e-12);
        assert_eq!(f[9], 1.0);
        // 02:00 UTC
        assert!((f[7] - (TAU / 12.0).sin()).abs() < 1e-12);
    }

    #[test]
    fn price_features_include_roi() {
        let product = ProfitableProduct {
            sku: "S".into(),
            name: "Shoe".into(),
            retail_price: 100.0,
            resale_price: 200.0,
            net_profit: 100.0,
            profit_margin: 100.0,
            monthly_sales: 12,
            sales_velocity: 0.4,
            restock_probability: 0.2,
            last_restock: None,
        };
        let f = price_features(&product, 0.6);
        assert_eq!(f[3], 50.0);
        assert_eq!(f[4], 12.0);
        assert_eq!(f[6], 0.6);
    }
}
