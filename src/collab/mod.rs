//! Collaborators the engine drives but does not own: persistence, the
//! prediction cache, notifications, the prediction model, page parsing and
//! the resale-market API.
//!
//! Every async collaborator returns `CollabError` (or `RequestFailure` for
//! network-backed ones); callers log and continue.

pub mod cache;
pub mod market;
pub mod model;
pub mod notifier;
pub mod parser;

use std::time::Duration;

use async_trait::async_trait;

use crate::error::{CollabError, RequestFailure};
use crate::types::{
    DealRecord, MarketSnapshot, Payload, ProductRecord, ProductUpdate, ProfitEstimate,
    ProfitableProduct, RestockPrediction, RestockRecord, RunSummary,
};

pub use cache::{MemoryCache, NoCache};
pub use market::MarketClient;
pub use model::{HeuristicModel, PRICE_FEATURES, RESTOCK_FEATURES};
pub use notifier::{DiscordNotifier, ErrorAlert, LogNotifier};
pub use parser::JsonProductParser;

#[async_trait]
pub trait Persistence: Send + Sync {
    async fn get_profitable_products(
        &self,
        min_profit: f64,
        min_monthly_sales: u32,
    ) -> Result<Vec<ProfitableProduct>, CollabError>;

    /// Inserts a freshly scanned product or refreshes its retail fields.
    async fn upsert_product(&self, product: &ProductRecord) -> Result<(), CollabError>;

    async fn update_product(&self, sku: &str, update: &ProductUpdate) -> Result<(), CollabError>;

    async fn save_deal(&self, deal: &DealRecord) -> Result<(), CollabError>;

    async fn save_restock(&self, record: &RestockRecord) -> Result<(), CollabError>;
}

/// Prediction cache keyed by string with a per-entry TTL.
#[async_trait]
pub trait PredictionCache: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<RestockPrediction>, CollabError>;

    async fn set(
        &self,
        key: &str,
        value: &RestockPrediction,
        ttl: Duration,
    ) -> Result<(), CollabError>;

    async fn delete(&self, key: &str) -> Result<(), CollabError>;
}

/// Best-effort external notifications.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify_deal(&self, deal: &DealRecord) -> Result<(), CollabError>;

    async fn notify_restock(&self, record: &RestockRecord) -> Result<(), CollabError>;

    async fn notify_error(&self, message: &str) -> Result<(), CollabError>;

    async fn notify_startup(&self) -> Result<(), CollabError> {
        Ok(())
    }

    async fn notify_shutdown(&self, _summary: &RunSummary) -> Result<(), CollabError> {
        Ok(())
    }
}

/// Pure prediction functions over fixed-length feature vectors.
pub trait RestockModel: Send + Sync {
    /// Probability in [0, 1] that the SKU restocks soon.
    fn predict_restock(&self, features: &[f64; RESTOCK_FEATURES]) -> f64;

    /// Expected resale price.
    fn predict_price(&self, features: &[f64; PRICE_FEATURES]) -> f64;

    /// Margin is relative to the buy price, ROI relative to the sell price.
    fn estimate_profit(&self, buy: f64, sell: f64) -> ProfitEstimate {
        if !(buy > 0.0 && sell > 0.0) {
            return ProfitEstimate::ZERO;
        }
        let net_profit = sell - buy;
        ProfitEstimate {
            net_profit,
            margin_pct: net_profit / buy * 100.0,
            roi_pct: net_profit / sell * 100.0,
        }
    }
}

pub trait PageParser: Send + Sync {
    fn parse(&self, payload: &Payload) -> Vec<ProductRecord>;
}

/// Resale-market lookups.
#[async_trait]
pub trait MarketData: Send + Sync {
    async fn check_availability(&self, sku: &str) -> Result<bool, RequestFailure>;

    async fn market_snapshot(&self, sku: &str) -> Result<MarketSnapshot, RequestFailure>;
}


#[cfg(test)]
mod tests {
    use super::fakes::FixedModel;
    use super::*;

    #[test]
    fn profit_estimate_uses_buy_for_margin_and_sell_for_roi() {
        let m = FixedModel(0.5);
        let p = m.estimate_profit(100.0, 150.0);
        assert_eq!(p.net_profit, 50.0);
        assert_eq!(p.margin_pct, 50.0);
        assert!((p.roi_pct - 33.333).abs() < 0.01);
    }

    #[test]
    fn profit_estimate_is_zero_for_missing_prices() {
        let m = FixedModel(0.5);
        assert_eq!(m.estimate_profit(0.0, 150.0), ProfitEstimate::ZERO);
        assert_eq!(m.estimate_profit(100.0, -1.0), ProfitEstimate::ZERO);
        assert_eq!(m.estimate_profit(f64::NAN, 10.0), ProfitEstimate::ZERO);
    }
}
