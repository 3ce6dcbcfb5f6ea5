use super::RestockModel;

/// Restock feature vector length. Order:
/// previous probability, profit margin %, sales velocity (per day),
/// hours since last check, check count, min(margin / 100, 1),
/// ln(1 + velocity), hour-of-day sine, hour-of-day cosine, bias 1.0.
pub const RESTOCK_FEATURES: usize = 10;

/// Price feature vector length. Order:
/// retail price, resale price, profit margin %, ROI %, monthly sales,
/// sales velocity, previous restock probability, bias 1.0.
pub const PRICE_FEATURES: usize = 8;

const RESTOCK_WEIGHTS: [f64; RESTOCK_FEATURES] =
    [2.0, 0.005, 0.2, 0.04, -0.02, 0.8, 0.4, 0.1, 0.1, -2.0];

/// Logistic scoring over hand-tuned weights. Stands in for a trained model
/// behind the same trait.
#[derive(Debug, Default, Clone)]
pub struct HeuristicModel;

impl RestockModel for HeuristicModel {
    fn predict_restock(&self, features: &[f64; RESTOCK_FEATURES]) -> f64 {
        let z: f64 = features
            .iter()
            .zip(RESTOCK_WEIGHTS.iter())
            .map(|(x, w)| if x.is_finite() { x * w } else { 0.0 })
            .sum();
        let p = 1.0 / (1.0 + (-z).exp());
        if p.is_finite() {
            p.clamp(0.0, 1.0)
        } else {
            0.0
        }
    }

    fn predict_price(&self, features: &[f64; PRICE_FEATURES]) -> f64 {
        let resale = features[1].max(0.0);
        let monthly_sales = features[4].max(0.0);
        let restock_prob = features[6].clamp(0.0, 1.0);
        // Demand lifts the price a little, an imminent restock pulls it down.
        let demand = (monthly_sales / 100.0).min(0.1);
        resale * (1.0 + demand - 0.05 * restock_prob)
    }
}
