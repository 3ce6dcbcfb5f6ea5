use std::time::Duration;

use rand::Rng;

use crate::types::TransportKind;

/// Delay schedule between request attempts.
#[derive(Debug, Clone)]
pub struct BackoffPolicy {
    /// Delay after the first target-limited attempt. Doubles per attempt.
    pub base: Duration,
    /// Hard cap on any computed delay, jitter included.
    pub cap: Duration,
    /// Upper bound of the uniform jitter added to the exponential delay.
    pub jitter: Duration,
}

impl BackoffPolicy {
    pub fn new(cap: Duration) -> Self {
        Self {
            base: Duration::from_secs(1),
            cap,
            jitter: Duration::from_secs(1),
        }
    }

    /// `min(cap, base * 2^attempt + jitter)` for a 0-indexed attempt.
    pub fn target_delay(&self, attempt: u32) -> Duration {
        let multiplier = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
        let exp = self.base.checked_mul(multiplier).unwrap_or(self.cap);
        (exp + random_up_to(self.jitter)).min(self.cap)
    }

    /// Short randomized pause after a transport failure before moving on to
    /// the next proxy.
    pub fn transport_delay(&self, kind: TransportKind) -> Duration {
        let (lo, hi) = match kind {
            TransportKind::Timeout => (2_000, 5_000),
            TransportKind::Connect => (1_000, 3_000),
            TransportKind::Other => (500, 2_000),
        };
        let ms = rand::thread_rng().gen_range(lo..=hi);
        Duration::from_millis(ms).min(self.cap)
    }

    /// Largest total sleep `attempts` target-limited attempts can incur.
    /// Nothing sleeps after the last attempt.
    pub fn max_total(&self, attempts: u32) -> Duration {
        (0..attempts.saturating_sub(1))
            .map(|a| {
                let multiplier = 1u32.checked_shl(a).unwrap_or(u32::MAX);
                let exp = self.base.checked_mul(multiplier).unwrap_or(self.cap);
                (exp + self.jitter).min(self.cap)
            })
            .sum()
    }
}

fn random_up_to(max: Duration) -> Duration {
    let ms = u64::try_from(max.as_millis()).unwrap_or(u64::MAX);
    if ms == 0 {
        return Duration::ZERO;
    }
    Duration::from_millis(rand::thread_rng().gen_range(0..ms))
}
