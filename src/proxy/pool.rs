use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use rand::seq::SliceRandom;
use rand::Rng;
use serde::Serialize;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::config::{
    PROXY_EXPLORATION_RATIO, PROXY_FAILURE_THRESHOLD, PROXY_INITIAL_SCORE, PROXY_LOCAL_PENALTY,
    PROXY_PROBE_TIMEOUT_SECS, PROXY_SCORE_CAP, PROXY_SCORE_FLOOR, PROXY_SCORE_GAIN, PROXY_TOP_K,
    TARGET_LIMITED_PENALTY,
};
use crate::error::{AppError, Result};
use crate::proxy::list::{parse_list, ProxyEndpoint};
use crate::types::{now_secs, FailureKind};

#[derive(Debug, Clone)]
pub struct Proxy {
    pub endpoint: ProxyEndpoint,
    pub score: f64,
    pub consecutive_failures: u32,
    pub blacklisted: bool,
    /// Unix seconds of the last successful request, 0 = never.
    pub last_success: u64,
    pub last_latency: Option<Duration>,
}

impl Proxy {
    fn new(endpoint: ProxyEndpoint) -> Self {
        Self {
            endpoint,
            score: PROXY_INITIAL_SCORE,
            consecutive_failures: 0,
            blacklisted: false,
            last_success: 0,
            last_latency: None,
        }
    }

    pub fn address(&self) -> String {
        self.endpoint.address()
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct PoolMetrics {
    pub total: usize,
    pub active: usize,
    pub blacklisted: usize,
    pub avg_score: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct ProxyView {
    pub address: String,
    pub score: f64,
    pub consecutive_failures: u32,
    pub blacklisted: bool,
    pub last_success: u64,
    pub last_latency_ms: Option<u64>,
}

/// Scored set of proxies, keyed by `host:port`.
///
/// Proxies are never removed, only blacklisted. A blacklisted proxy comes
/// back only through a successful [`ProxyPool::revalidate`] probe.
pub struct ProxyPool {
    proxies: DashMap<String, Proxy>,
    probe_url: String,
    probe_timeout: Duration,
    /// Held while an exhausted pool is revalidated, so concurrent
    /// `acquire` callers wait for one pass instead of each revalidating.
    revalidation: Mutex<()>,
}

impl ProxyPool {
    pub fn new(endpoints: Vec<ProxyEndpoint>, probe_url: impl Into<String>) -> Arc<Self> {
        let proxies = DashMap::new();
        for ep in endpoints {
            proxies.entry(ep.address()).or_insert_with(|| Proxy::new(ep));
        }
        Arc::new(Self {
            proxies,
            probe_url: probe_url.into(),
            probe_timeout: Duration::from_secs(PROXY_PROBE_TIMEOUT_SECS),
            revalidation: Mutex::new(()),
        })
    }

    /// Reads a proxy list file. A missing or empty file is a configuration
    /// error; running without proxies is chosen by not configuring a file.
    pub async fn load(path: impl AsRef<Path>, probe_url: impl Into<String>) -> Result<Arc<Self>> {
        let path = path.as_ref();
        let text = tokio::fs::read_to_string(path).await.map_err(|e| {
            AppError::ProxyList(format!("cannot read {}: {e}", path.display()))
        })?;
        let endpoints = parse_list(&text);
        if endpoints.is_empty() {
            return Err(AppError::ProxyList(format!(
                "{} contains no usable proxies",
                path.display()
            )));
        }
        let pool = Self::new(endpoints, probe_url);
        info!("Loaded {} proxies from {}", pool.len(), path.display());
        Ok(pool)
    }

    /// Writes the current proxy set back, sorted and de-duplicated.
    pub async fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let mut lines: Vec<String> = self
            .proxies
            .iter()
            .map(|e| e.value().endpoint.to_line())
            .collect();
        lines.sort();
        lines.dedup();
        let mut body = lines.join("\n");
        body.push('\n');
        tokio::fs::write(path.as_ref(), body).await?;
        info!("Saved {} proxies to {}", lines.len(), path.as_ref().display());
        Ok(())
    }

    #[cfg(test)]
    fn with_probe_timeout(mut self: Arc<Self>, timeout: Duration) -> Arc<Self> {
        if let Some(pool) = Arc::get_mut(&mut self) {
            pool.probe_timeout = timeout;
        }
        self
    }

    pub fn len(&self) -> usize {
        self.proxies.len()
    }

    /// Proxies that are not blacklisted.
    pub fn available(&self) -> usize {
        self.proxies.iter().filter(|e| !e.value().blacklisted).count()
    }

    /// Synchronous selection over non-blacklisted proxies. Most of the time
    /// picks uniformly among the top-K by score; otherwise uniformly among
    /// all of them so low-score proxies still get traffic.
    pub fn pick(&self) -> Option<Proxy> {
        let mut candidates: Vec<Proxy> = self
            .proxies
            .iter()
            .filter(|e| !e.value().blacklisted)
            .map(|e| e.value().clone())
            .collect();
        if candidates.is_empty() {
            return None;
        }

        let mut rng = rand::thread_rng();
        if !rng.gen_bool(PROXY_EXPLORATION_RATIO) {
            candidates.sort_by(|a, b| {
                b.score
                    .total_cmp(&a.score)
                    .then_with(|| a.address().cmp(&b.address()))
            });
            candidates.truncate(PROXY_TOP_K);
        }
        candidates.choose(&mut rng).cloned()
    }

    /// Returns a proxy for the next request. When every proxy is blacklisted,
    /// revalidates them best-score first and returns `None` only if none of
    /// them come back. One revalidation pass runs at a time; callers that
    /// waited on it pick from whatever it restored.
    pub async fn acquire(&self) -> Option<Proxy> {
        if let Some(p) = self.pick() {
            return Some(p);
        }

        let _pass = self.revalidation.lock().await;
        if let Some(p) = self.pick() {
            return Some(p);
        }

        let mut blacklisted: Vec<(String, f64)> = self
            .proxies
            .iter()
            .filter(|e| e.value().blacklisted)
            .map(|e| (e.key().clone(), e.value().score))
            .collect();
        blacklisted.sort_by(|a, b| b.1.total_cmp(&a.1));

        warn!(
            "Proxy pool exhausted, revalidating {} blacklisted proxies",
            blacklisted.len()
        );
        for (address, _) in blacklisted {
            if self.revalidate(&address).await {
                return self.pick();
            }
        }
        warn!("No proxy survived revalidation");
        None
    }

    pub fn report_success(&self, address: &str, latency: Duration) {
        if let Some(mut p) = self.proxies.get_mut(address) {
            p.score = (p.score * PROXY_SCORE_GAIN).min(PROXY_SCORE_CAP);
            p.consecutive_failures = 0;
            p.last_success = now_secs();
            p.last_latency = Some(latency);
        }
    }

    pub fn report_failure(&self, address: &str, kind: FailureKind) {
        let Some(mut p) = self.proxies.get_mut(address) else {
            return;
        };
        match kind {
            FailureKind::TargetLimited => {
                p.score = (p.score * TARGET_LIMITED_PENALTY).max(PROXY_SCORE_FLOOR);
                debug!(proxy = %address, score = p.score, "Target limited request through proxy");
            }
            FailureKind::ProxyLocal => {
                p.consecutive_failures += 1;
                p.score = (p.score * PROXY_LOCAL_PENALTY).max(PROXY_SCORE_FLOOR);
                if !p.blacklisted && p.consecutive_failures >= PROXY_FAILURE_THRESHOLD {
                    p.blacklisted = true;
                    warn!(
                        proxy = %address,
                        failures = p.consecutive_failures,
                        "Proxy blacklisted"
                    );
                }
            }
        }
    }

    /// Probes the known-good endpoint through the proxy. Success clears the
    /// blacklist and resets the score.
    pub async fn revalidate(&self, address: &str) -> bool {
        // Clone out of the map: never hold a shard guard across the probe.
        let Some(endpoint) = self.proxies.get(address).map(|p| p.endpoint.clone()) else {
            return false;
        };

        let started = Instant::now();
        let ok = match probe(&endpoint, &self.probe_url, self.probe_timeout).await {
            Ok(status) if status.is_success() => true,
            Ok(status) => {
                debug!(proxy = %address, status = status.as_u16(), "Revalidation probe rejected");
                false
            }
            Err(e) => {
                debug!(proxy = %address, "Revalidation probe failed: {e}");
                false
            }
        };

        if ok {
            if let Some(mut p) = self.proxies.get_mut(address) {
                p.blacklisted = false;
                p.consecutive_failures = 0;
                p.score = PROXY_INITIAL_SCORE;
                p.last_latency = Some(started.elapsed());
            }
            info!(proxy = %address, "Proxy revalidated");
        }
        ok
    }

    pub fn metrics(&self) -> PoolMetrics {
        let mut m = PoolMetrics::default();
        let mut score_sum = 0.0;
        for entry in self.proxies.iter() {
            m.total += 1;
            if entry.blacklisted {
                m.blacklisted += 1;
            } else {
                m.active += 1;
            }
            score_sum += entry.score;
        }
        if m.total > 0 {
            m.avg_score = score_sum / m.total as f64;
        }
        m
    }

    pub fn snapshot(&self) -> Vec<ProxyView> {
        let mut out: Vec<ProxyView> = self
            .proxies
            .iter()
            .map(|e| ProxyView {
                address: e.key().clone(),
                score: e.score,
                consecutive_failures: e.consecutive_failures,
                blacklisted: e.blacklisted,
                last_success: e.last_success,
                last_latency_ms: e.last_latency.map(|d| d.as_millis() as u64),
            })
            .collect();
        out.sort_by(|a, b| b.score.total_cmp(&a.score));
        out
    }
}

async fn probe(
    endpoint: &ProxyEndpoint,
    url: &str,
    timeout: Duration,
) -> std::result::Result<reqwest::StatusCode, reqwest::Error> {
    let client = reqwest::Client::builder()
        .proxy(endpoint.to_reqwest()?)
        .timeout(timeout)
        .build()?;
    let resp = client.get(url).send().await?;
    Ok(resp.status())
}
