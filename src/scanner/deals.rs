use std::sync::atomic::Ordering;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::collab::{ErrorAlert, MarketData, Notifier, Persistence, RestockModel};
use crate::config::DEFAULT_ENRICH_PRIORITY;
use crate::error::CollabError;
use crate::queue::{WorkItem, WorkQueue};
use crate::scanner::orchestrator::ScanRecord;
use crate::scanner::stats::ScanStats;
use crate::types::{now_secs, DealRecord, ProductRecord, ProductUpdate};

/// Turns scanned products into market-enriched records and deals.
///
/// Products are upserted and queued by SKU; `drain` prices each against the
/// resale market and emits a deal when the net profit clears `min_profit`.
pub struct DealPipeline {
    queue: Arc<WorkQueue<ProductRecord>>,
    store: Arc<dyn Persistence>,
    market: Arc<dyn MarketData>,
    model: Arc<dyn RestockModel>,
    notifier: Arc<dyn Notifier>,
    stats: Arc<ScanStats>,
    min_profit: f64,
    store_alert: ErrorAlert,
}

impl DealPipeline {
    pub fn new(
        queue: Arc<WorkQueue<ProductRecord>>,
        store: Arc<dyn Persistence>,
        market: Arc<dyn MarketData>,
        model: Arc<dyn RestockModel>,
        notifier: Arc<dyn Notifier>,
        stats: Arc<ScanStats>,
        min_profit: f64,
    ) -> Self {
        Self {
            queue,
            store,
            market,
            model,
            notifier,
            stats,
            min_profit,
            store_alert: ErrorAlert::new(),
        }
    }

    pub fn queue(&self) -> &Arc<WorkQueue<ProductRecord>> {
        &self.queue
    }

    /// Persists every scanned product and queues it for enrichment. Returns
    /// how many were newly queued.
    pub async fn ingest(&self, records: &[ScanRecord]) -> usize {
        let mut queued = 0;
        for product in records.iter().flat_map(|r| r.products.iter()) {
            match self.store.upsert_product(product).await {
                Ok(()) => self.store_alert.clear(),
                Err(e) => {
                    warn!(sku = %product.sku, "Product upsert failed: {e}");
                    self.store_alert
                        .raise(
                            self.notifier.as_ref(),
                            &format!("Scanned products are not being saved: {e}"),
                        )
                        .await;
                }
            }
            if self.queue.push(WorkItem::new(
                product.sku.clone(),
                DEFAULT_ENRICH_PRIORITY,
                product.clone(),
            )) {
                queued += 1;
            }
        }
        debug!("Queued {queued} products for enrichment");
        queued
    }

    /// Processes queued products until the queue is empty or `cancel` fires.
    /// Every popped item is completed, whatever the outcome.
    pub async fn drain(&self, cancel: &CancellationToken) -> usize {
        let mut deals = 0;
        while let Some(item) = self.queue.pop() {
            if cancel.is_cancelled() {
                self.queue.release(item);
                break;
            }
            match self.process(&item.payload).await {
                Ok(Some(_)) => deals += 1,
                Ok(None) => {}
                Err(e) => warn!(sku = %item.key, attempts = item.attempts, "Enrichment failed, dropping: {e}"),
            }
            self.queue.complete(&item.key);
        }
        deals
    }

    async fn process(&self, product: &ProductRecord) -> Result<Option<DealRecord>, CollabError> {
        let snapshot = self.market.market_snapshot(&product.sku).await?;
        let profit = self.model.estimate_profit(product.price, snapshot.lowest_ask);

        let update = ProductUpdate {
            resale_price: Some(snapshot.lowest_ask),
            net_profit: Some(profit.net_profit),
            profit_margin: Some(profit.margin_pct),
            monthly_sales: Some(snapshot.monthly_sales),
            sales_velocity: Some(f64::from(snapshot.monthly_sales) / 30.0),
            ..Default::default()
        };
        if let Err(e) = self.store.update_product(&product.sku, &update).await {
            warn!(sku = %product.sku, "Product update failed: {e}");
        }

        if profit.net_profit < self.min_profit {
            debug!(sku = %product.sku, profit = profit.net_profit, "Below profit threshold");
            return Ok(None);
        }

        let deal = DealRecord {
            sku: product.sku.clone(),
            name: product.name(),
            url: product.url.clone(),
            retail_price: product.price,
            resale_price: snapshot.lowest_ask,
            profit,
            monthly_sales: snapshot.monthly_sales,
            found_at: now_secs(),
        };
        info!(
            sku = %deal.sku,
            profit = profit.net_profit,
            roi = profit.roi_pct,
            "Deal found"
        );
        self.stats.deals_found.fetch_add(1, Ordering::Relaxed);

        if let Err(e) = self.store.save_deal(&deal).await {
            warn!(sku = %deal.sku, "Saving deal failed: {e}");
            self.store_alert
                .raise(
                    self.notifier.as_ref(),
                    &format!("Deal for {} was not saved: {e}", deal.sku),
                )
                .await;
        }
        if let Err(e) = self.notifier.notify_deal(&deal).await {
            warn!(sku = %deal.sku, "Deal notification failed: {e}");
        }
        Ok(Some(deal))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collab::fakes::{FakeMarket, FakeStore, FixedModel, RecordingNotifier};
    use crate::types::MarketSnapshot;
    use std::sync::atomic::Ordering as AtomicOrdering;
    use std::time::Duration;

    fn product(sku: &str, price: f64) -> ProductRecord {
        ProductRecord {
            sku: sku.into(),
            brand: "Nike".into(),
            model: "Dunk".into(),
            price,
            url: format!("https://shop.test/{sku}"),
        }
    }

    fn snapshot(sku: &str, ask: f64) -> MarketSnapshot {
        MarketSnapshot {
            sku: sku.into(),
            lowest_ask: ask,
            monthly_sales: 30,
            available: true,
        }
    }

    struct Harness {
        pipeline: DealPipeline,
        store: Arc<FakeStore>,
        market: Arc<FakeMarket>,
        notifier: Arc<RecordingNotifier>,
    }

    fn harness() -> Harness {
        let store = Arc::new(FakeStore::default());
        let market = Arc::new(FakeMarket::default());
        let notifier = Arc::new(RecordingNotifier::default());
        let pipeline = DealPipeline::new(
            Arc::new(WorkQueue::new("enrich", 100, Duration::from_secs(300))),
            store.clone(),
            market.clone(),
            Arc::new(FixedModel(0.5)),
            notifier.clone(),
            Arc::new(ScanStats::new()),
            10.0,
        );
        Harness {
            pipeline,
            store,
            market,
            notifier,
        }
    }

    fn record(products: Vec<ProductRecord>) -> ScanRecord {
        ScanRecord {
            url: "/page".into(),
            products,
            latency: Duration::from_millis(10),
        }
    }

    #[tokio::test]
    async fn profitable_products_become_deals() {
        let h = harness();
        h.market.set_snapshot(snapshot("WIN", 180.0));
        h.market.set_snapshot(snapshot("THIN", 105.0));

        let queued = h
            .pipeline
            .ingest(&[record(vec![
                product("WIN", 100.0),
                product("THIN", 100.0),
                product("UNKNOWN", 100.0),
            ])])
            .await;
        assert_eq!(queued, 3);
        assert_eq!(h.store.upserts.lock().unwrap().len(), 3);

        let deals = h.pipeline.drain(&CancellationToken::new()).await;
        assert_eq!(deals, 1);
        assert_eq!(h.notifier.deals.lock().unwrap()[0].sku, "WIN");
        assert_eq!(h.store.deals.lock().unwrap().len(), 1);
        // Both priced products get their market fields stored.
        assert_eq!(h.store.updates.lock().unwrap().len(), 2);
        assert!(h.pipeline.queue().is_empty());
        assert_eq!(h.pipeline.queue().stats().in_flight, 0);
    }

    #[tokio::test]
    async fn duplicate_skus_are_queued_once() {
        let h = harness();
        let queued = h
            .pipeline
            .ingest(&[
                record(vec![product("A", 100.0)]),
                record(vec![product("A", 100.0)]),
            ])
            .await;
        assert_eq!(queued, 1);
    }

    #[tokio::test]
    async fn collaborator_failures_do_not_stop_the_drain() {
        let h = harness();
        h.market.set_snapshot(snapshot("A", 200.0));
        h.market.set_snapshot(snapshot("B", 200.0));
        h.notifier.fail.store(true, AtomicOrdering::SeqCst);
        h.pipeline
            .ingest(&[record(vec![product("A", 100.0), product("B", 100.0)])])
            .await;
        h.store.fail.store(true, AtomicOrdering::SeqCst);

        let deals = h.pipeline.drain(&CancellationToken::new()).await;
        assert_eq!(deals, 2);
        assert_eq!(h.notifier.deals.lock().unwrap().len(), 2);
        // Two failed deal saves, one alert.
        assert_eq!(h.notifier.errors.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn persistence_outage_is_reported_once_until_it_recovers() {
        let h = harness();
        h.store.fail.store(true, AtomicOrdering::SeqCst);
        h.pipeline
            .ingest(&[record(vec![product("A", 100.0), product("B", 100.0)])])
            .await;
        assert_eq!(h.notifier.errors.lock().unwrap().len(), 1);

        h.store.fail.store(false, AtomicOrdering::SeqCst);
        h.pipeline.ingest(&[record(vec![product("C", 100.0)])]).await;
        h.store.fail.store(true, AtomicOrdering::SeqCst);
        h.pipeline.ingest(&[record(vec![product("D", 100.0)])]).await;
        let errors = h.notifier.errors.lock().unwrap();
        assert_eq!(errors.len(), 2);
        assert!(errors[0].contains("not being saved"));
    }

    #[tokio::test]
    async fn cancelled_drain_leaves_items_queued() {
        let h = harness();
        h.pipeline
            .ingest(&[record(vec![product("A", 100.0)])])
            .await;
        let cancel = CancellationToken::new();
        cancel.cancel();
        assert_eq!(h.pipeline.drain(&cancel).await, 0);
        assert_eq!(h.pipeline.queue().len(), 1);
    }
}
