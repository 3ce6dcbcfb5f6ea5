use std::str::FromStr;

use async_trait::async_trait;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::SqlitePool;
use tracing::info;

use crate::collab::Persistence;
use crate::config::PROFITABLE_QUERY_LIMIT;
use crate::db::models::{DealRow, ProfitableRow, RestockRow};
use crate::error::{CollabError, Result};
use crate::types::{
    now_secs, DealRecord, ProductRecord, ProductUpdate, ProfitableProduct, RestockRecord,
};

/// SQLite-backed persistence for products, deals and restocks.
#[derive(Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    pub async fn connect(path: &str) -> Result<Self> {
        let opts = SqliteConnectOptions::from_str(&format!("sqlite:{path}"))?.create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(opts)
            .await?;
        let store = Self::from_pool(pool).await?;
        info!("Database ready at {path}");
        Ok(store)
    }

    /// Wraps an existing pool and applies migrations.
    pub async fn from_pool(pool: SqlitePool) -> Result<Self> {
        sqlx::migrate!("./migrations").run(&pool).await?;
        Ok(Self { pool })
    }

    pub async fn recent_deals(&self, limit: i64) -> Result<Vec<DealRow>> {
        let rows = sqlx::query_as::<_, DealRow>(
            r#"
            SELECT id, sku, retail_price, resale_price, net_profit, profit_margin, roi,
                   monthly_sales, found_at
            FROM deals
            ORDER BY found_at DESC, id DESC
            LIMIT ?
            "#,
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    pub async fn recent_restocks(&self, limit: i64) -> Result<Vec<RestockRow>> {
        let rows = sqlx::query_as::<_, RestockRow>(
            r#"
            SELECT id, sku, detected_at, probability, profit_margin, sales_velocity,
                   expected_resale, lowest_ask, monthly_sales
            FROM restocks
            ORDER BY detected_at DESC, id DESC
            LIMIT ?
            "#,
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }
}

#[async_trait]
impl Persistence for SqliteStore {
    async fn get_profitable_products(
        &self,
        min_profit: f64,
        min_monthly_sales: u32,
    ) -> std::result::Result<Vec<ProfitableProduct>, CollabError> {
        let rows = sqlx::query_as::<_, ProfitableRow>(
            r#"
            SELECT sku, name, retail_price, resale_price, net_profit, profit_margin,
                   monthly_sales, sales_velocity, restock_probability, last_restock
            FROM products
            WHERE is_active = 1 AND net_profit >= ? AND monthly_sales >= ?
            ORDER BY net_profit DESC
            LIMIT ?
            "#,
        )
        .bind(min_profit)
        .bind(i64::from(min_monthly_sales))
        .bind(PROFITABLE_QUERY_LIMIT)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(ProfitableProduct::from).collect())
    }

    async fn upsert_product(&self, product: &ProductRecord) -> std::result::Result<(), CollabError> {
        sqlx::query(
            r#"
            INSERT INTO products (sku, name, brand, model, url, retail_price, is_active, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, 1, ?)
            ON CONFLICT(sku) DO UPDATE SET
                name = excluded.name,
                brand = excluded.brand,
                model = excluded.model,
                url = excluded.url,
                retail_price = excluded.retail_price,
                is_active = 1,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(&product.sku)
        .bind(product.name())
        .bind(&product.brand)
        .bind(&product.model)
        .bind(&product.url)
        .bind(product.price)
        .bind(now_secs() as i64)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn update_product(
        &self,
        sku: &str,
        update: &ProductUpdate,
    ) -> std::result::Result<(), CollabError> {
        sqlx::query(
            r#"
            UPDATE products SET
                resale_price = COALESCE(?, resale_price),
                net_profit = COALESCE(?, net_profit),
                profit_margin = COALESCE(?, profit_margin),
                monthly_sales = COALESCE(?, monthly_sales),
                sales_velocity = COALESCE(?, sales_velocity),
                restock_probability = COALESCE(?, restock_probability),
                last_restock = COALESCE(?, last_restock),
                updated_at = ?
            WHERE sku = ?
            "#,
        )
        .bind(update.resale_price)
        .bind(update.net_profit)
        .bind(update.profit_margin)
        .bind(update.monthly_sales.map(i64::from))
        .bind(update.sales_velocity)
        .bind(update.restock_probability)
        .bind(update.last_restock.map(|t| t as i64))
        .bind(now_secs() as i64)
        .bind(sku)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn save_deal(&self, deal: &DealRecord) -> std::result::Result<(), CollabError> {
        sqlx::query(
            r#"
            INSERT INTO deals (sku, retail_price, resale_price, net_profit, profit_margin, roi,
                               monthly_sales, found_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&deal.sku)
        .bind(deal.retail_price)
        .bind(deal.resale_price)
        .bind(deal.profit.net_profit)
        .bind(deal.profit.margin_pct)
        .bind(deal.profit.roi_pct)
        .bind(i64::from(deal.monthly_sales))
        .bind(deal.found_at as i64)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn save_restock(&self, record: &RestockRecord) -> std::result::Result<(), CollabError> {
        sqlx::query(
            r#"
            INSERT INTO restocks (sku, detected_at, probability, profit_margin, sales_velocity,
                                  expected_resale, lowest_ask, monthly_sales)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&record.sku)
        .bind(record.detected_at as i64)
        .bind(record.probability)
        .bind(record.profit_margin)
        .bind(record.sales_velocity)
        .bind(record.expected_resale)
        .bind(record.market.as_ref().map(|m| m.lowest_ask))
        .bind(record.market.as_ref().map(|m| i64::from(m.monthly_sales)))
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}
