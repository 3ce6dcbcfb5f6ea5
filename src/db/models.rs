/// Row types for the tables in `migrations/0001_init.sql`.
use serde::Serialize;

use crate::types::ProfitableProduct;

#[derive(Debug, sqlx::FromRow)]
pub struct ProfitableRow {
    pub sku: String,
    pub name: String,
    pub retail_price: f64,
    pub resale_price: Option<f64>,
    pub net_profit: Option<f64>,
    pub profit_margin: Option<f64>,
    pub monthly_sales: i64,
    pub sales_velocity: f64,
    pub restock_probability: f64,
    pub last_restock: Option<i64>,
}

impl From<ProfitableRow> for ProfitableProduct {
    fn from(r: ProfitableRow) -> Self {
        ProfitableProduct {
            sku: r.sku,
            name: r.name,
            retail_price: r.retail_price,
            resale_price: r.resale_price.unwrap_or(0.0),
            net_profit: r.net_profit.unwrap_or(0.0),
            profit_margin: r.profit_margin.unwrap_or(0.0),
            monthly_sales: u32::try_from(r.monthly_sales.max(0)).unwrap_or(u32::MAX),
            sales_velocity: r.sales_velocity,
            restock_probability: r.restock_probability,
            last_restock: r.last_restock.map(|t| t.max(0) as u64),
        }
    }
}

#[derive(Debug, Serialize, sqlx::FromRow)]
pub struct DealRow {
    pub id: i64,
    pub sku: String,
    pub retail_price: f64,
    pub resale_price: f64,
    pub net_profit: f64,
    pub profit_margin: f64,
    pub roi: f64,
    pub monthly_sales: i64,
    pub found_at: i64,
}

#[derive(Debug, Serialize, sqlx::FromRow)]
pub struct RestockRow {
    pub id: i64,
    pub sku: String,
    pub detected_at: i64,
    pub probability: f64,
    pub profit_margin: f64,
    pub sales_velocity: f64,
    pub expected_resale: f64,
    pub lowest_ask: Option<f64>,
    pub monthly_sales: Option<i64>,
}
