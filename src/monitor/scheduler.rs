use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use futures_util::future::join_all;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::collab::{ErrorAlert, MarketData, Notifier, Persistence, PredictionCache, RestockModel};
use crate::config::{
    Config, MONITOR_CHECK_CONCURRENCY, MONITOR_MIN_SLEEP_SECS, RESTOCK_COOLDOWN_SECS,
};
use crate::error::RequestFailure;
use crate::monitor::policy::{price_features, restock_features, SchedulePolicy};
use crate::queue::{WorkItem, WorkQueue};
use crate::types::{now_secs, ProductUpdate, ProfitableProduct, RestockPrediction, RestockRecord};

#[derive(Debug, Clone)]
pub struct MonitorConfig {
    pub min_profit: f64,
    pub min_monthly_sales: u32,
    pub min_profit_margin: f64,
    pub min_sales_velocity: f64,
    /// Reseed cadence and the longest sleep between drain cycles.
    pub monitor_interval: Duration,
    pub prediction_ttl: Duration,
    /// How long after a confirmed restock a SKU stays out of monitoring.
    pub restock_cooldown: Duration,
    pub policy: SchedulePolicy,
    pub check_concurrency: usize,
}

impl MonitorConfig {
    pub fn from_config(cfg: &Config) -> Self {
        Self {
            min_profit: cfg.min_profit,
            min_monthly_sales: cfg.min_monthly_sales,
            min_profit_margin: cfg.min_profit_margin,
            min_sales_velocity: cfg.min_sales_velocity,
            monitor_interval: cfg.monitor_interval,
            prediction_ttl: cfg.prediction_ttl,
            restock_cooldown: Duration::from_secs(RESTOCK_COOLDOWN_SECS),
            policy: SchedulePolicy::new(cfg.min_check_interval, cfg.max_check_interval),
            check_concurrency: MONITOR_CHECK_CONCURRENCY,
        }
    }
}

#[derive(Default)]
pub struct MonitorStats {
    pub seeded: AtomicU64,
    pub checks: AtomicU64,
    pub check_failures: AtomicU64,
    pub restocks: AtomicU64,
    pub expired: AtomicU64,
    pub cooling_down: AtomicU64,
}

#[derive(Debug, Clone, Serialize)]
pub struct MonitorStatsSnapshot {
    pub active: usize,
    pub seeded: u64,
    pub checks: u64,
    pub check_failures: u64,
    pub restocks: u64,
    pub expired: u64,
    pub cooling_down: u64,
}

/// Active monitor as exposed by the stats API.
#[derive(Debug, Clone, Serialize)]
pub struct MonitorView {
    pub sku: String,
    pub name: String,
    pub probability: f64,
    pub priority: u32,
    pub next_check: u64,
    pub last_check: u64,
    pub check_count: u32,
    pub profit_margin: f64,
}

/// What one drain cycle did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CycleReport {
    pub expired: usize,
    pub checked: usize,
    pub restocked: usize,
    pub requeued: usize,
    pub failed: usize,
}

enum CheckOutcome {
    Restocked,
    Requeued,
    Failed,
    Dropped,
}

struct Monitored {
    prediction: RestockPrediction,
    product: ProfitableProduct,
    /// Consecutive failed checks.
    failures: u32,
}

fn cache_key(sku: &str) -> String {
    format!("prediction:{sku}")
}

/// Watches profitable SKUs for restocks.
///
/// A SKU enters the active set from `seed`, lives in the queue between
/// checks and is popped by `drain_cycle` once its `next_check` has passed.
/// It leaves the active set when a restock is confirmed or its prediction
/// goes stale. Membership in the active set guards every restock emission,
/// so a SKU produces at most one restock record per monitoring period, and
/// a restocked SKU is not readmitted until `restock_cooldown` has passed.
pub struct RestockScheduler {
    cfg: MonitorConfig,
    queue: Arc<WorkQueue<RestockPrediction>>,
    active: Mutex<HashMap<String, Monitored>>,
    /// SKU -> unix seconds of restocks confirmed by this process.
    restocked: Mutex<HashMap<String, u64>>,
    store: Arc<dyn Persistence>,
    cache: Arc<dyn PredictionCache>,
    market: Arc<dyn MarketData>,
    model: Arc<dyn RestockModel>,
    notifier: Arc<dyn Notifier>,
    pool_alert: ErrorAlert,
    store_alert: ErrorAlert,
    stats: MonitorStats,
}

impl RestockScheduler {
    pub fn new(
        cfg: MonitorConfig,
        queue: Arc<WorkQueue<RestockPrediction>>,
        store: Arc<dyn Persistence>,
        cache: Arc<dyn PredictionCache>,
        market: Arc<dyn MarketData>,
        model: Arc<dyn RestockModel>,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        Self {
            cfg,
            queue,
            active: Mutex::new(HashMap::new()),
            restocked: Mutex::new(HashMap::new()),
            store,
            cache,
            market,
            model,
            notifier,
            pool_alert: ErrorAlert::new(),
            store_alert: ErrorAlert::new(),
            stats: MonitorStats::default(),
        }
    }

    fn lock_active(&self) -> MutexGuard<'_, HashMap<String, Monitored>> {
        self.active
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn lock_restocked(&self) -> MutexGuard<'_, HashMap<String, u64>> {
        self.restocked
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// True while the last restock of `product`, as persisted or as seen by
    /// this process, is inside the cooldown.
    fn cooling_down(&self, product: &ProfitableProduct, now: u64) -> bool {
        let seen = self.lock_restocked().get(&product.sku).copied();
        product
            .last_restock
            .max(seen)
            .is_some_and(|at| now.saturating_sub(at) < self.cfg.restock_cooldown.as_secs())
    }

    pub fn queue(&self) -> &Arc<WorkQueue<RestockPrediction>> {
        &self.queue
    }

    pub fn is_monitoring(&self, sku: &str) -> bool {
        self.lock_active().contains_key(sku)
    }

    pub fn active_count(&self) -> usize {
        self.lock_active().len()
    }

    /// Pulls profitable products from persistence and starts monitoring the
    /// ones that qualify. A persistence failure leaves the active set as is.
    pub async fn seed(&self, now: u64) -> usize {
        match self
            .store
            .get_profitable_products(self.cfg.min_profit, self.cfg.min_monthly_sales)
            .await
        {
            Ok(products) => {
                self.store_alert.clear();
                self.admit(products, now).await
            }
            Err(e) => {
                warn!("Loading profitable products failed, keeping current monitors: {e}");
                self.store_alert
                    .raise(
                        self.notifier.as_ref(),
                        &format!("Restock monitor cannot load products: {e}"),
                    )
                    .await;
                0
            }
        }
    }

    /// Starts monitoring every product above the margin and velocity
    /// thresholds that is neither monitored nor cooling down after a restock.
    /// Cached predictions are reused when present.
    pub async fn admit(&self, products: Vec<ProfitableProduct>, now: u64) -> usize {
        let mut added = 0;
        for product in products {
            if product.profit_margin < self.cfg.min_profit_margin
                || product.sales_velocity < self.cfg.min_sales_velocity
            {
                debug!(sku = %product.sku, margin = product.profit_margin, velocity = product.sales_velocity, "Below monitoring thresholds");
                continue;
            }
            if self.is_monitoring(&product.sku) {
                continue;
            }
            if self.cooling_down(&product, now) {
                debug!(sku = %product.sku, "Restocked recently, not monitoring yet");
                self.stats.cooling_down.fetch_add(1, Ordering::Relaxed);
                continue;
            }

            let key = cache_key(&product.sku);
            let cached = match self.cache.get(&key).await {
                Ok(hit) => hit.filter(|p| p.sku == product.sku),
                Err(e) => {
                    warn!(sku = %product.sku, "Prediction cache read failed: {e}");
                    None
                }
            };
            let prediction = match cached {
                Some(mut p) => {
                    // Restart the staleness clock.
                    p.last_check = p.last_check.max(now);
                    p
                }
                None => self.initial_prediction(&product, now),
            };

            let item = WorkItem::new(product.sku.clone(), prediction.priority, prediction.clone());
            if !self.queue.push(item) {
                continue;
            }
            info!(
                sku = %product.sku,
                probability = prediction.probability,
                priority = prediction.priority,
                next_check = prediction.next_check,
                "Monitoring SKU"
            );
            self.lock_active().insert(
                product.sku.clone(),
                Monitored {
                    prediction: prediction.clone(),
                    product,
                    failures: 0,
                },
            );
            if let Err(e) = self.cache.set(&key, &prediction, self.cfg.prediction_ttl).await {
                warn!(sku = %prediction.sku, "Prediction cache write failed: {e}");
            }
            added += 1;
        }
        self.stats.seeded.fetch_add(added as u64, Ordering::Relaxed);
        added
    }

    fn initial_prediction(&self, product: &ProfitableProduct, now: u64) -> RestockPrediction {
        let mut prediction = RestockPrediction {
            sku: product.sku.clone(),
            probability: product.restock_probability,
            next_check: now,
            priority: 0,
            last_check: now,
            profit_margin: product.profit_margin,
            sales_velocity: product.sales_velocity,
            check_count: 0,
        };
        prediction.probability = self.model.predict_restock(&restock_features(&prediction, now));
        let (priority, next_check) =
            self.cfg
                .policy
                .schedule(prediction.probability, prediction.profit_margin, now);
        prediction.priority = priority;
        prediction.next_check = next_check;
        prediction
    }

    /// Expires stale monitors, then checks every due SKU once.
    pub async fn drain_cycle(&self, now: u64) -> CycleReport {
        let mut report = CycleReport {
            expired: self.expire_stale(now).await,
            ..Default::default()
        };

        let mut due = Vec::new();
        while let Some(item) = self.queue.pop_ready(|i| i.payload.next_check <= now) {
            due.push(item);
        }
        if due.is_empty() {
            return report;
        }
        debug!(due = due.len(), "Checking due SKUs");

        let width = self.cfg.check_concurrency.max(1);
        let mut outcomes = Vec::with_capacity(due.len());
        while !due.is_empty() {
            let batch: Vec<_> = due.drain(..width.min(due.len())).collect();
            outcomes.extend(join_all(batch.into_iter().map(|item| self.check(item, now))).await);
        }

        for outcome in outcomes {
            match outcome {
                CheckOutcome::Restocked => {
                    report.checked += 1;
                    report.restocked += 1;
                }
                CheckOutcome::Requeued => {
                    report.checked += 1;
                    report.requeued += 1;
                }
                CheckOutcome::Failed => report.failed += 1,
                CheckOutcome::Dropped => {}
            }
        }
        report
    }

    async fn expire_stale(&self, now: u64) -> usize {
        let cooldown = self.cfg.restock_cooldown.as_secs();
        self.lock_restocked()
            .retain(|_, at| now.saturating_sub(*at) < cooldown);

        let ttl = self.cfg.prediction_ttl.as_secs();
        let mut stale: Vec<String> = {
            let mut active = self.lock_active();
            let keys: Vec<String> = active
                .iter()
                .filter(|(_, m)| now.saturating_sub(m.prediction.last_check) > ttl)
                .map(|(sku, _)| sku.clone())
                .collect();
            for sku in &keys {
                active.remove(sku);
            }
            keys
        };
        for sku in &stale {
            self.queue.remove(sku);
        }

        // Items that sat in the queue past its own TTL.
        for item in self.queue.sweep_expired() {
            if self.lock_active().remove(&item.key).is_some() {
                stale.push(item.key);
            }
        }

        for sku in &stale {
            info!(sku = %sku, "Prediction went stale, no longer monitoring");
            if let Err(e) = self.cache.delete(&cache_key(sku)).await {
                warn!(sku = %sku, "Prediction cache delete failed: {e}");
            }
        }
        self.stats
            .expired
            .fetch_add(stale.len() as u64, Ordering::Relaxed);
        stale.len()
    }

    async fn check(&self, item: WorkItem<RestockPrediction>, now: u64) -> CheckOutcome {
        self.stats.checks.fetch_add(1, Ordering::Relaxed);
        let result = self.market.check_availability(&item.key).await;
        if result.is_ok() {
            self.pool_alert.clear();
        }
        match result {
            Ok(true) => {
                if self.confirm_restock(&item.key, now).await {
                    CheckOutcome::Restocked
                } else {
                    self.queue.complete(&item.key);
                    CheckOutcome::Dropped
                }
            }
            Ok(false) => self.reschedule(item, now).await,
            Err(e) => {
                self.stats.check_failures.fetch_add(1, Ordering::Relaxed);
                if matches!(e, RequestFailure::PoolExhausted) {
                    self.pool_alert
                        .raise(
                            self.notifier.as_ref(),
                            "Availability checks failing: every proxy is blacklisted",
                        )
                        .await;
                }
                self.retry_later(item, now, &e)
            }
        }
    }

    /// Pushes a failed SKU back by `failure_backoff` without touching its
    /// prediction, so it is not rechecked on every wake.
    fn retry_later(
        &self,
        mut item: WorkItem<RestockPrediction>,
        now: u64,
        error: &RequestFailure,
    ) -> CheckOutcome {
        let backoff = self.lock_active().get_mut(&item.key).map(|monitored| {
            monitored.failures += 1;
            let delay = self.cfg.policy.failure_backoff(monitored.failures);
            monitored.prediction.next_check = now + delay.as_secs();
            (monitored.failures, monitored.prediction.next_check)
        });
        let Some((failures, next_check)) = backoff else {
            self.queue.complete(&item.key);
            return CheckOutcome::Dropped;
        };
        warn!(
            sku = %item.key,
            failures,
            retry_in_secs = next_check - now,
            "Availability check failed: {error}"
        );
        item.payload.next_check = next_check;
        let priority = item.priority;
        self.queue.requeue(item, priority);
        CheckOutcome::Failed
    }

    async fn reschedule(&self, mut item: WorkItem<RestockPrediction>, now: u64) -> CheckOutcome {
        let updated = self.lock_active().get_mut(&item.key).map(|monitored| {
            let mut p = monitored.prediction.clone();
            p.probability = self.model.predict_restock(&restock_features(&p, now));
            let (priority, next_check) = self.cfg.policy.schedule(p.probability, p.profit_margin, now);
            p.priority = priority;
            p.next_check = next_check;
            p.last_check = now;
            p.check_count += 1;
            monitored.prediction = p.clone();
            monitored.failures = 0;
            p
        });
        let Some(updated) = updated else {
            // Expired or restocked while the check was running.
            self.queue.complete(&item.key);
            return CheckOutcome::Dropped;
        };

        debug!(
            sku = %updated.sku,
            probability = updated.probability,
            priority = updated.priority,
            next_check = updated.next_check,
            "Not restocked, rescheduled"
        );
        if let Err(e) = self
            .cache
            .set(&cache_key(&updated.sku), &updated, self.cfg.prediction_ttl)
            .await
        {
            warn!(sku = %updated.sku, "Prediction cache write failed: {e}");
        }
        let update = ProductUpdate {
            restock_probability: Some(updated.probability),
            ..Default::default()
        };
        if let Err(e) = self.store.update_product(&updated.sku, &update).await {
            warn!(sku = %updated.sku, "Product update failed: {e}");
        }

        let priority = updated.priority;
        item.payload = updated;
        self.queue.requeue(item, priority);
        CheckOutcome::Requeued
    }

    /// Records and announces a restock for `sku`. Returns false, doing
    /// nothing, when the SKU is not actively monitored.
    pub async fn confirm_restock(&self, sku: &str, now: u64) -> bool {
        let removed = self.lock_active().remove(sku);
        let Some(Monitored {
            prediction,
            product,
            ..
        }) = removed
        else {
            debug!(sku = %sku, "Restock already handled");
            return false;
        };
        self.queue.remove(sku);
        self.lock_restocked().insert(sku.to_string(), now);

        let market = match self.market.market_snapshot(sku).await {
            Ok(snapshot) => Some(snapshot),
            Err(e) => {
                warn!(sku = %sku, "Market snapshot unavailable for restock: {e}");
                None
            }
        };
        let record = RestockRecord {
            sku: sku.to_string(),
            detected_at: now,
            probability: prediction.probability,
            profit_margin: prediction.profit_margin,
            sales_velocity: prediction.sales_velocity,
            expected_resale: self
                .model
                .predict_price(&price_features(&product, prediction.probability)),
            market,
        };
        info!(
            sku = %sku,
            probability = record.probability,
            margin = record.profit_margin,
            checks = prediction.check_count,
            "Restock detected"
        );
        self.stats.restocks.fetch_add(1, Ordering::Relaxed);

        if let Err(e) = self.store.save_restock(&record).await {
            warn!(sku = %sku, "Saving restock failed: {e}");
            self.store_alert
                .raise(
                    self.notifier.as_ref(),
                    &format!("Restock for {sku} was not saved: {e}"),
                )
                .await;
        }
        if let Err(e) = self.notifier.notify_restock(&record).await {
            warn!(sku = %sku, "Restock notification failed: {e}");
        }
        let update = ProductUpdate {
            restock_probability: Some(prediction.probability),
            last_restock: Some(now),
            ..Default::default()
        };
        if let Err(e) = self.store.update_product(sku, &update).await {
            warn!(sku = %sku, "Product update failed: {e}");
        }
        if let Err(e) = self.cache.delete(&cache_key(sku)).await {
            warn!(sku = %sku, "Prediction cache delete failed: {e}");
        }
        true
    }

    /// Time until the earliest monitored check is due, within
    /// `[MONITOR_MIN_SLEEP_SECS, monitor_interval]`.
    pub fn next_wake(&self, now: u64) -> Duration {
        let min = Duration::from_secs(MONITOR_MIN_SLEEP_SECS);
        let max = self.cfg.monitor_interval.max(min);
        self.lock_active()
            .values()
            .map(|m| m.prediction.next_check.saturating_sub(now))
            .min()
            .map_or(max, |secs| Duration::from_secs(secs).clamp(min, max))
    }

    /// Seeds and drains until `cancel` fires. Reseeds every
    /// `monitor_interval`.
    pub async fn run(&self, cancel: CancellationToken) {
        info!(
            interval_secs = self.cfg.monitor_interval.as_secs(),
            "Restock monitor started"
        );
        let mut next_seed = 0u64;
        loop {
            let now = now_secs();
            if now >= next_seed {
                let added = self.seed(now).await;
                if added > 0 {
                    info!(added, active = self.active_count(), "Monitor seeded");
                }
                next_seed = now + self.cfg.monitor_interval.as_secs();
            }

            let report = self.drain_cycle(now).await;
            if report != CycleReport::default() {
                debug!(?report, "Monitor cycle finished");
            }

            let wait = self.next_wake(now_secs());
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(wait) => {}
            }
        }
        info!(active = self.active_count(), "Restock monitor stopped");
    }

    pub fn monitors(&self) -> Vec<MonitorView> {
        let mut views: Vec<MonitorView> = self
            .lock_active()
            .values()
            .map(|m| MonitorView {
                sku: m.prediction.sku.clone(),
                name: m.product.name.clone(),
                probability: m.prediction.probability,
                priority: m.prediction.priority,
                next_check: m.prediction.next_check,
                last_check: m.prediction.last_check,
                check_count: m.prediction.check_count,
                profit_margin: m.prediction.profit_margin,
            })
            .collect();
        views.sort_by(|a, b| a.next_check.cmp(&b.next_check).then(a.sku.cmp(&b.sku)));
        views
    }

    pub fn stats(&self) -> MonitorStatsSnapshot {
        MonitorStatsSnapshot {
            active: self.active_count(),
            seeded: self.stats.seeded.load(Ordering::Relaxed),
            checks: self.stats.checks.load(Ordering::Relaxed),
            check_failures: self.stats.check_failures.load(Ordering::Relaxed),
            restocks: self.stats.restocks.load(Ordering::Relaxed),
            expired: self.stats.expired.load(Ordering::Relaxed),
            cooling_down: self.stats.cooling_down.load(Ordering::Relaxed),
        }
    }
}
