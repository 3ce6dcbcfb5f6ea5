use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

use tokio::time::Instant;

use crate::config::PACER_LATENCY_WINDOW;

/// Minimum spacing between request starts, adapted to observed latency.
///
/// Sustained success shrinks the delay toward `min`; failures grow it toward
/// `max`. Callers reserve a slot under the lock and sleep outside it.
pub struct AdaptivePacer {
    min: Duration,
    max: Duration,
    state: Mutex<PacerState>,
}

struct PacerState {
    delay: Duration,
    latencies: VecDeque<Duration>,
    next_slot: Option<Instant>,
}

impl AdaptivePacer {
    pub fn new(min: Duration, max: Duration) -> Self {
        let max = max.max(min);
        Self {
            min,
            max,
            state: Mutex::new(PacerState {
                delay: min,
                latencies: VecDeque::with_capacity(PACER_LATENCY_WINDOW),
                next_slot: None,
            }),
        }
    }

    /// Waits until this caller's slot comes up.
    pub async fn wait_turn(&self) {
        let slot = {
            let Ok(mut st) = self.state.lock() else {
                return;
            };
            let now = Instant::now();
            let slot = st.next_slot.map_or(now, |s| s.max(now));
            st.next_slot = Some(slot + st.delay);
            slot
        };
        tokio::time::sleep_until(slot).await;
    }

    pub fn record_success(&self, latency: Duration) {
        if let Ok(mut st) = self.state.lock() {
            push_latency(&mut st.latencies, latency);
            let avg = average(&st.latencies).unwrap_or(st.delay);
            let target = avg.mul_f64(0.8).min(st.delay.mul_f64(0.95));
            st.delay = target.clamp(self.min, self.max);
        }
    }

    pub fn record_failure(&self, latency: Option<Duration>) {
        if let Ok(mut st) = self.state.lock() {
            if let Some(l) = latency {
                push_latency(&mut st.latencies, l);
            }
            let avg = average(&st.latencies).unwrap_or(st.delay);
            let grown = st.delay.mul_f64(1.5).max(self.min);
            st.delay = avg.mul_f64(1.2).max(grown).clamp(self.min, self.max);
        }
    }

    pub fn current_delay(&self) -> Duration {
        self.state.lock().map(|st| st.delay).unwrap_or(self.min)
    }

    pub fn average_latency(&self) -> Option<Duration> {
        self.state.lock().ok().and_then(|st| average(&st.latencies))
    }
}

fn push_latency(window: &mut VecDeque<Duration>, latency: Duration) {
    if window.len() == PACER_LATENCY_WINDOW {
        window.pop_front();
    }
    window.push_back(latency);
}

fn average(window: &VecDeque<Duration>) -> Option<Duration> {
    if window.is_empty() {
        return None;
    }
    let total: Duration = window.iter().sum();
    Some(total / window.len() as u32)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn failures_grow_delay_up_to_max() {
        let pacer = AdaptivePacer::new(Duration::from_millis(100), Duration::from_secs(2));
        for _ in 0..20 {
            pacer.record_failure(Some(Duration::from_millis(300)));
        }
        assert_eq!(pacer.current_delay(), Duration::from_secs(2));
    }

    #[test]
    fn success_shrinks_delay_down_to_min() {
        let pacer = AdaptivePacer::new(Duration::from_millis(100), Duration::from_secs(2));
        for _ in 0..5 {
            pacer.record_failure(None);
        }
        let raised = pacer.current_delay();
        assert!(raised > Duration::from_millis(100));
        for _ in 0..100 {
            pacer.record_success(Duration::from_millis(50));
        }
        assert_eq!(pacer.current_delay(), Duration::from_millis(100));
    }

    #[test]
    fn latency_window_is_bounded() {
        let pacer = AdaptivePacer::new(Duration::ZERO, Duration::from_secs(1));
        for _ in 0..PACER_LATENCY_WINDOW {
            pacer.record_success(Duration::from_millis(900));
        }
        for _ in 0..PACER_LATENCY_WINDOW {
            pacer.record_success(Duration::from_millis(100));
        }
        assert_eq!(pacer.average_latency(), Some(Duration::from_millis(100)));
    }

    #[tokio::test(start_paused = true)]
    async fn consecutive_turns_are_spaced_by_delay() {
        let pacer = AdaptivePacer::new(Duration::from_millis(200), Duration::from_secs(1));
        let start = Instant::now();
        pacer.wait_turn().await;
        pacer.wait_turn().await;
        pacer.wait_turn().await;
        assert!(start.elapsed() >= Duration::from_millis(400));
        assert!(start.elapsed() < Duration::from_millis(450));
    }
}
