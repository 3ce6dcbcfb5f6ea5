pub mod list;
pub mod pool;

pub use pool::{PoolMetrics, Proxy, ProxyPool};

use std::sync::Arc;

use crate::config::Config;
use crate::error::Result;

/// How outbound requests are routed. Running without a proxy list is an
/// explicit, degraded mode rather than an error.
#[derive(Clone)]
pub enum ProxyMode {
    Direct,
    Pooled(Arc<ProxyPool>),
}

impl ProxyMode {
    pub async fn from_config(cfg: &Config) -> Result<Self> {
        match &cfg.proxy_file {
            None => Ok(ProxyMode::Direct),
            Some(path) => Ok(ProxyMode::Pooled(
                ProxyPool::load(path, cfg.proxy_probe_url.clone()).await?,
            )),
        }
    }

    pub fn pool(&self) -> Option<&Arc<ProxyPool>> {
        match self {
            ProxyMode::Direct => None,
            ProxyMode::Pooled(pool) => Some(pool),
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            ProxyMode::Direct => "direct",
            ProxyMode::Pooled(_) => "pooled",
        }
    }
}
