use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use reqwest::{Method, Url};
use serde::Serialize;
use tracing::{debug, warn};

use crate::config::{Config, DIRECT_MAX_RETRIES};
use crate::error::RequestFailure;
use crate::http::backoff::BackoffPolicy;
use crate::http::headers::{build_headers, to_header_map, Fingerprint, HeaderProfile};
use crate::http::pacing::AdaptivePacer;
use crate::proxy::{Proxy, ProxyMode};
use crate::types::{FailureKind, OutcomeKind, Payload, TransportKind};

const DIRECT_SESSION: &str = "direct";

#[derive(Debug, Clone)]
pub struct RequesterConfig {
    /// Prefix for relative request paths.
    pub base_url: Option<String>,
    pub profile: HeaderProfile,
    pub timeout: Duration,
    pub min_delay: Duration,
    pub max_delay: Duration,
    pub backoff: BackoffPolicy,
    /// Attempts per call. `None` means one per usable proxy (or
    /// `DIRECT_MAX_RETRIES` in direct mode).
    pub max_retries: Option<u32>,
    pub session_lifetime: Duration,
    pub session_max_requests: u32,
}

impl RequesterConfig {
    pub fn from_config(cfg: &Config, base_url: Option<String>, profile: HeaderProfile) -> Self {
        Self {
            base_url,
            profile,
            timeout: cfg.request_timeout,
            min_delay: cfg.min_delay,
            max_delay: cfg.max_delay,
            backoff: BackoffPolicy::new(cfg.backoff_cap),
            max_retries: None,
            session_lifetime: cfg.session_lifetime,
            session_max_requests: cfg.session_max_requests,
        }
    }
}

#[derive(Debug, Clone)]
pub struct FetchResponse {
    pub payload: Payload,
    pub status: u16,
    pub latency: Duration,
    /// `host:port` of the proxy that served the request, `None` when direct.
    pub proxy: Option<String>,
}

#[derive(Debug, Default)]
pub struct RequestStats {
    pub attempts: AtomicU64,
    pub successes: AtomicU64,
    pub target_limited: AtomicU64,
    pub transport_errors: AtomicU64,
    pub other_status: AtomicU64,
    pub exhausted: AtomicU64,
}

#[derive(Debug, Clone, Serialize)]
pub struct RequestStatsSnapshot {
    pub attempts: u64,
    pub successes: u64,
    pub target_limited: u64,
    pub transport_errors: u64,
    pub other_status: u64,
    pub exhausted: u64,
}

impl RequestStats {
    fn inc(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> RequestStatsSnapshot {
        RequestStatsSnapshot {
            attempts: self.attempts.load(Ordering::Relaxed),
            successes: self.successes.load(Ordering::Relaxed),
            target_limited: self.target_limited.load(Ordering::Relaxed),
            transport_errors: self.transport_errors.load(Ordering::Relaxed),
            other_status: self.other_status.load(Ordering::Relaxed),
            exhausted: self.exhausted.load(Ordering::Relaxed),
        }
    }
}

struct Session {
    client: reqwest::Client,
    fingerprint: Fingerprint,
    created: Instant,
    requests: u32,
}

/// One logical HTTP call with proxy rotation, header randomization, adaptive
/// pacing and bounded retries.
///
/// Clients are cached per route (`direct` or a proxy address) and rebuilt
/// with a fresh fingerprint once they exceed the session lifetime or
/// request count.
pub struct ResilientRequester {
    cfg: RequesterConfig,
    mode: ProxyMode,
    sessions: Mutex<HashMap<String, Session>>,
    pacer: AdaptivePacer,
    stats: RequestStats,
}

impl ResilientRequester {
    pub fn new(cfg: RequesterConfig, mode: ProxyMode) -> Self {
        let pacer = AdaptivePacer::new(cfg.min_delay, cfg.max_delay);
        debug!(
            mode = mode.label(),
            max_backoff_ms = cfg.backoff.max_total(DIRECT_MAX_RETRIES).as_millis() as u64,
            "Requester ready"
        );
        Self {
            cfg,
            mode,
            sessions: Mutex::new(HashMap::new()),
            pacer,
            stats: RequestStats::default(),
        }
    }

    pub fn stats(&self) -> &RequestStats {
        &self.stats
    }

    pub fn pacer(&self) -> &AdaptivePacer {
        &self.pacer
    }

    /// Attempts for the next call. Pooled mode allows one per proxy that is
    /// not blacklisted, and at least one so an exhausted pool still gets a
    /// revalidation pass.
    pub fn max_attempts(&self) -> u32 {
        let default = match &self.mode {
            ProxyMode::Direct => DIRECT_MAX_RETRIES,
            ProxyMode::Pooled(pool) => u32::try_from(pool.available()).unwrap_or(u32::MAX),
        };
        self.cfg.max_retries.unwrap_or(default).max(1)
    }

    pub async fn get(
        &self,
        url: &str,
        params: &[(&str, String)],
    ) -> Result<FetchResponse, RequestFailure> {
        self.execute(Method::GET, url, params).await
    }

    pub async fn execute(
        &self,
        method: Method,
        url: &str,
        params: &[(&str, String)],
    ) -> Result<FetchResponse, RequestFailure> {
        let url = self.resolve_url(url)?;
        let max_attempts = self.max_attempts();
        let mut last = OutcomeKind::Other(0);

        for attempt in 0..max_attempts {
            let is_last = attempt + 1 == max_attempts;

            let proxy = match &self.mode {
                ProxyMode::Direct => None,
                ProxyMode::Pooled(pool) => match pool.acquire().await {
                    Some(p) => Some(p),
                    None => {
                        warn!(url = %url, attempt, "Proxy pool exhausted, giving up");
                        return Err(RequestFailure::PoolExhausted);
                    }
                },
            };
            let route = proxy.as_ref().map_or_else(|| DIRECT_SESSION.to_string(), Proxy::address);

            let (client, fingerprint) = match self.session_for(&route, proxy.as_ref()) {
                Ok(s) => s,
                Err(e) if proxy.is_some() => {
                    warn!(proxy = %route, attempt, "Cannot build client for proxy: {e}");
                    self.report(&route, FailureKind::ProxyLocal);
                    last = OutcomeKind::Transport(TransportKind::Other);
                    continue;
                }
                Err(e) => return Err(RequestFailure::InvalidRequest(e.to_string())),
            };

            let headers = to_header_map(&build_headers(&self.cfg.profile, &fingerprint))
                .map_err(RequestFailure::InvalidRequest)?;
            let request = client
                .request(method.clone(), url.clone())
                .query(params)
                .headers(headers)
                .build()
                .map_err(|e| RequestFailure::InvalidRequest(e.to_string()))?;

            self.pacer.wait_turn().await;
            RequestStats::inc(&self.stats.attempts);
            let started = Instant::now();

            let kind = match client.execute(request).await {
                Ok(resp) => {
                    let status = resp.status().as_u16();
                    let kind = OutcomeKind::from_status(status);
                    if kind == OutcomeKind::Success {
                        match read_payload(resp).await {
                            Ok(payload) => {
                                let latency = started.elapsed();
                                if let Some(pool) = self.mode.pool() {
                                    if proxy.is_some() {
                                        pool.report_success(&route, latency);
                                    }
                                }
                                self.pacer.record_success(latency);
                                RequestStats::inc(&self.stats.successes);
                                debug!(url = %url, proxy = %route, attempt, latency_ms = latency.as_millis() as u64, "Request succeeded");
                                return Ok(FetchResponse {
                                    payload,
                                    status,
                                    latency,
                                    proxy: proxy.map(|p| p.address()),
                                });
                            }
                            Err(e) => OutcomeKind::Transport(classify(&e)),
                        }
                    } else {
                        kind
                    }
                }
                Err(e) => OutcomeKind::Transport(classify(&e)),
            };

            let latency = started.elapsed();
            last = kind;
            match kind.failure_kind() {
                Some(FailureKind::TargetLimited) => {
                    RequestStats::inc(&self.stats.target_limited);
                    self.report(&route, FailureKind::TargetLimited);
                    self.pacer.record_failure(Some(latency));
                    let delay = self.cfg.backoff.target_delay(attempt);
                    warn!(
                        url = %url,
                        proxy = %route,
                        status = %kind,
                        attempt = attempt + 1,
                        max = max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        "Target limited request"
                    );
                    if !is_last {
                        tokio::time::sleep(delay).await;
                    }
                }
                Some(FailureKind::ProxyLocal) => {
                    RequestStats::inc(&self.stats.transport_errors);
                    self.report(&route, FailureKind::ProxyLocal);
                    self.pacer.record_failure(None);
                    let transport = match kind {
                        OutcomeKind::Transport(t) => t,
                        _ => TransportKind::Other,
                    };
                    let delay = self.cfg.backoff.transport_delay(transport);
                    warn!(
                        url = %url,
                        proxy = %route,
                        kind = %kind,
                        attempt = attempt + 1,
                        max = max_attempts,
                        "Proxy-local request failure"
                    );
                    if !is_last {
                        tokio::time::sleep(delay).await;
                    }
                }
                None => {
                    RequestStats::inc(&self.stats.other_status);
                    debug!(
                        url = %url,
                        proxy = %route,
                        status = %kind,
                        attempt = attempt + 1,
                        "Unexpected status, moving to next attempt"
                    );
                }
            }
        }

        RequestStats::inc(&self.stats.exhausted);
        warn!(url = %url, attempts = max_attempts, last = %last, "Retry budget exhausted");
        Err(RequestFailure::Exhausted {
            attempts: max_attempts,
            last,
        })
    }

    fn report(&self, route: &str, kind: FailureKind) {
        if let Some(pool) = self.mode.pool() {
            pool.report_failure(route, kind);
        }
    }

    fn resolve_url(&self, url: &str) -> Result<Url, RequestFailure> {
        let full = if url.starts_with("http://") || url.starts_with("https://") {
            url.to_string()
        } else {
            let base = self.cfg.base_url.as_deref().ok_or_else(|| {
                RequestFailure::InvalidRequest(format!("relative url {url:?} without a base url"))
            })?;
            format!("{}/{}", base.trim_end_matches('/'), url.trim_start_matches('/'))
        };
        Url::parse(&full).map_err(|e| RequestFailure::InvalidRequest(format!("{full}: {e}")))
    }

    /// Returns the route's client and fingerprint, rotating the session when
    /// it has outlived its lifetime or request budget.
    fn session_for(
        &self,
        route: &str,
        proxy: Option<&Proxy>,
    ) -> Result<(reqwest::Client, Fingerprint), reqwest::Error> {
        let mut sessions = self
            .sessions
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        let expired = sessions.get(route).map_or(true, |s| {
            s.created.elapsed() >= self.cfg.session_lifetime
                || s.requests >= self.cfg.session_max_requests
        });
        if expired {
            let client = self.build_client(proxy)?;
            if sessions.contains_key(route) {
                debug!(route, "Rotating session");
            }
            sessions.insert(
                route.to_string(),
                Session {
                    client,
                    fingerprint: Fingerprint::generate(),
                    created: Instant::now(),
                    requests: 0,
                },
            );
        }

        match sessions.get_mut(route) {
            Some(s) => {
                s.requests += 1;
                Ok((s.client.clone(), s.fingerprint.clone()))
            }
            // Inserted above whenever missing.
            None => self.build_client(proxy).map(|c| (c, Fingerprint::generate())),
        }
    }

    fn build_client(&self, proxy: Option<&Proxy>) -> Result<reqwest::Client, reqwest::Error> {
        let builder = reqwest::Client::builder()
            .timeout(self.cfg.timeout)
            .connect_timeout(self.cfg.timeout.min(Duration::from_secs(10)))
            .pool_idle_timeout(self.cfg.session_lifetime);
        let builder = match proxy {
            Some(p) => builder.proxy(p.endpoint.to_reqwest()?),
            None => builder.no_proxy(),
        };
        builder.build()
    }

    #[cfg(test)]
    fn session_id(&self, route: &str) -> Option<String> {
        self.sessions
            .lock()
            .ok()
            .and_then(|s| s.get(route).map(|s| s.fingerprint.session_id.clone()))
    }
}

async fn read_payload(resp: reqwest::Response) -> Result<Payload, reqwest::Error> {
    let is_json = resp
        .headers()
        .get(reqwest::header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map_or(false, |ct| ct.contains("json"));
    let body = resp.bytes().await?;
    if is_json {
        if let Ok(value) = serde_json::from_slice(&body) {
            return Ok(Payload::Json(value));
        }
    }
    Ok(Payload::Text(String::from_utf8_lossy(&body).into_owned()))
}

fn classify(e: &reqwest::Error) -> TransportKind {
    if e.is_timeout() {
        TransportKind::Timeout
    } else if e.is_connect() {
        TransportKind::Connect
    } else {
        TransportKind::Other
    }
}
