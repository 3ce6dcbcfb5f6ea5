use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use super::MarketData;
use crate::error::RequestFailure;
use crate::http::ResilientRequester;
use crate::types::{MarketSnapshot, Payload};

/// Resale-market API over the shared requester. The requester is expected
/// to carry the mobile-app header profile and the market base URL.
pub struct MarketClient {
    requester: Arc<ResilientRequester>,
}

impl MarketClient {
    pub fn new(requester: Arc<ResilientRequester>) -> Self {
        Self { requester }
    }

    async fn get_json(&self, path: &str, sku: &str) -> Result<Value, RequestFailure> {
        let resp = self
            .requester
            .get(path, &[("sku", sku.to_string())])
            .await?;
        match resp.payload {
            Payload::Json(v) => Ok(v),
            Payload::Text(_) => Err(RequestFailure::Decode(format!(
                "expected JSON from {path} for {sku}"
            ))),
        }
    }
}

#[async_trait]
impl MarketData for MarketClient {
    async fn check_availability(&self, sku: &str) -> Result<bool, RequestFailure> {
        let v = self.get_json("availability", sku).await?;
        v.get("available")
            .and_then(Value::as_bool)
            .ok_or_else(|| RequestFailure::Decode(format!("missing `available` for {sku}")))
    }

    async fn market_snapshot(&self, sku: &str) -> Result<MarketSnapshot, RequestFailure> {
        let v = self.get_json("", sku).await?;
        snapshot_from_json(sku, &v)
    }
}

fn snapshot_from_json(sku: &str, v: &Value) -> Result<MarketSnapshot, RequestFailure> {
    let lowest_ask = v
        .get("lowest_ask")
        .and_then(Value::as_f64)
        .ok_or_else(|| RequestFailure::Decode(format!("missing `lowest_ask` for {sku}")))?;
    let monthly_sales = v
        .get("monthly_sales")
        .and_then(Value::as_u64)
        .or_else(|| {
            v.get("sales_history")
                .and_then(Value::as_array)
                .map(|a| a.len() as u64)
        })
        .unwrap_or(0);
    let available = v
        .get("available")
        .and_then(Value::as_bool)
        .unwrap_or(lowest_ask > 0.0);
    Ok(MarketSnapshot {
        sku: sku.to_string(),
        lowest_ask,
        monthly_sales: u32::try_from(monthly_sales).unwrap_or(u32::MAX),
        available,
    })
}
