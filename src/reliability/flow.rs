use parking_lot::Mutex;
use rand::Rng;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use tokio_util::sync::CancellationToken;

use crate::buffer::backpressure::BackpressureMonitor;
use crate::config::FlowControlConfig;

#[derive(Debug, Clone)]
pub struct FlowControlMetrics {
    pub admitted: u64,
    pub rejected: u64,
    pub rate_limit_per_tier: usize,
    /// Remaining tokens per tier, index 0 = priority 1.
    pub available_per_tier: Vec<usize>,
}

/// Admission gate in front of the buffer: a token bucket per priority
/// tier (priority 1 is the highest), replenished on a fixed interval
/// with a little jitter to avoid replenish/burst phase alignment.
///
/// A tier that runs out may borrow unused capacity from *lower* priority
/// tiers, but only while backpressure is inactive. Under pressure each
/// tier is strictly confined to its own budget, so high-priority traffic
/// keeps a guaranteed share.
pub struct FlowControlManager {
    config: FlowControlConfig,
    monitor: Arc<BackpressureMonitor>,
    tokens: Mutex<Vec<usize>>,
    rate_limit: AtomicUsize,
    admitted: AtomicU64,
    rejected: AtomicU64,
    cancel: CancellationToken,
}

impl FlowControlManager {
    /// Creates the gate with full buckets and spawns the replenish task.
    pub fn start(config: FlowControlConfig, monitor: Arc<BackpressureMonitor>) -> Arc<Self> {
        let tiers = config.priority_tiers as usize;
        let rate = config.rate_limit_per_tier;
        let manager = Arc::new(Self {
            config,
            monitor,
            tokens: Mutex::new(vec![rate; tiers]),
            rate_limit: AtomicUsize::new(rate),
            admitted: AtomicU64::new(0),
            rejected: AtomicU64::new(0),
            cancel: CancellationToken::new(),
        });

        let task = Arc::clone(&manager);
        let cancel = manager.cancel.clone();
        tokio::spawn(async move {
            loop {
                let interval = task.jittered_interval();
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(interval) => task.replenish(),
                }
            }
        });

        manager
    }

    /// Decides whether `count` events may enter the buffer right now.
    /// Lower numeric priority is more likely to be admitted: tier 1
    /// borrows from every other tier, tier N only from tiers below it.
    pub fn request_permission(&self, count: usize, priority: u8) -> bool {
        if count == 0 {
            return true;
        }
        let tier = self.tier_index(priority);
        let borrowing_allowed = !self.monitor.is_active();

        let mut tokens = self.tokens.lock();
        let own = tokens[tier];

        if own >= count {
            tokens[tier] = own - count;
            self.admitted.fetch_add(count as u64, Ordering::Relaxed);
            return true;
        }

        if borrowing_allowed {
            let lower_capacity: usize = tokens[tier + 1..].iter().sum();
            if own + lower_capacity >= count {
                let mut deficit = count - own;
                tokens[tier] = 0;
                for lower in &mut tokens[tier + 1..] {
                    let take = deficit.min(*lower);
                    *lower -= take;
                    deficit -= take;
                    if deficit == 0 {
                        break;
                    }
                }
                self.admitted.fetch_add(count as u64, Ordering::Relaxed);
                return true;
            }
        }

        self.rejected.fetch_add(count as u64, Ordering::Relaxed);
        tracing::trace!(count, priority, "admission rejected");
        false
    }

    /// Refills every bucket to the current per-tier ceiling. Public so
    /// tests can drive replenishment deterministically.
    pub fn replenish(&self) {
        let rate = self.rate_limit.load(Ordering::Relaxed);
        let mut tokens = self.tokens.lock();
        for bucket in &mut *tokens {
            *bucket = rate;
        }
    }

    /// Runtime override of the admitted-events-per-interval ceiling.
    /// Takes effect at the next replenish.
    pub fn adjust_rate_limit(&self, new_rate: usize) {
        self.rate_limit.store(new_rate, Ordering::Relaxed);
        tracing::info!(new_rate, "flow control rate limit adjusted");
    }

    pub fn metrics(&self) -> FlowControlMetrics {
        FlowControlMetrics {
            admitted: self.admitted.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
            rate_limit_per_tier: self.rate_limit.load(Ordering::Relaxed),
            available_per_tier: self.tokens.lock().clone(),
        }
    }

    /// Stops the replenish task.
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }

    fn tier_index(&self, priority: u8) -> usize {
        let clamped = priority.clamp(1, self.config.priority_tiers);
        (clamped - 1) as usize
    }

    fn jittered_interval(&self) -> std::time::Duration {
        let base = self.config.replenish_interval;
        if self.config.replenish_jitter <= 0.0 {
            return base;
        }
        let jitter = rand::rng().random_range(-self.config.replenish_jitter..=self.config.replenish_jitter);
        base.mul_f64((1.0 + jitter).max(0.1))
    }
}

impl Drop for FlowControlManager {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BackpressureConfig;
    use std::time::Duration;

    fn quiet_monitor() -> Arc<BackpressureMonitor> {
        BackpressureMonitor::start(BackpressureConfig {
            monitoring_interval: Duration::from_secs(3600),
            ..BackpressureConfig::default()
        })
    }

    fn gate(rate: usize, tiers: u8) -> (Arc<FlowControlManager>, Arc<BackpressureMonitor>) {
        let monitor = quiet_monitor();
        let manager = FlowControlManager::start(
            FlowControlConfig {
                priority_tiers: tiers,
                rate_limit_per_tier: rate,
                replenish_interval: Duration::from_secs(3600), // driven manually
                replenish_jitter: 0.0,
            },
            Arc::clone(&monitor),
        );
        (manager, monitor)
    }

    #[tokio::test]
    async fn admits_within_tier_budget() {
        let (gate, monitor) = gate(100, 2);
        assert!(gate.request_permission(60, 1));
        assert!(gate.request_permission(40, 1));
        let metrics = gate.metrics();
        assert_eq!(metrics.admitted, 100);
        assert_eq!(metrics.available_per_tier[0], 0);
        gate.shutdown();
        monitor.shutdown();
    }

    #[tokio::test]
    async fn high_priority_borrows_from_lower_tiers() {
        let (gate, monitor) = gate(100, 3);
        // 250 > own 100, but tiers 2 and 3 hold 200 unused.
        assert!(gate.request_permission(250, 1));
        let metrics = gate.metrics();
        assert_eq!(metrics.available_per_tier, vec![0, 0, 50]);
        gate.shutdown();
        monitor.shutdown();
    }

    #[tokio::test]
    async fn lowest_tier_cannot_borrow_upward() {
        let (gate, monitor) = gate(100, 2);
        assert!(!gate.request_permission(150, 2));
        assert_eq!(gate.metrics().rejected, 150);
        // Tier 1's budget is untouched by the rejected request.
        assert!(gate.request_permission(100, 1));
        gate.shutdown();
        monitor.shutdown();
    }

    #[tokio::test]
    async fn borrowing_disabled_under_backpressure() {
        let (gate, monitor) = gate(100, 3);
        monitor.update_queue_depth(usize::MAX);
        monitor.evaluate();
        assert!(monitor.is_active());

        assert!(!gate.request_permission(150, 1));
        assert!(gate.request_permission(100, 1));
        gate.shutdown();
        monitor.shutdown();
    }

    #[tokio::test]
    async fn replenish_restores_budgets_and_applies_new_rate() {
        let (gate, monitor) = gate(100, 2);
        assert!(gate.request_permission(100, 1));
        assert!(!gate.request_permission(150, 1));

        gate.adjust_rate_limit(500);
        gate.replenish();
        assert!(gate.request_permission(450, 1));
        assert_eq!(gate.metrics().rate_limit_per_tier, 500);
        gate.shutdown();
        monitor.shutdown();
    }

    #[tokio::test]
    async fn out_of_range_priority_is_clamped() {
        let (gate, monitor) = gate(10, 2);
        assert!(gate.request_permission(5, 0)); // treated as priority 1
        assert!(gate.request_permission(5, 200)); // treated as lowest tier
        assert_eq!(gate.metrics().admitted, 10);
        gate.shutdown();
        monitor.shutdown();
    }
}
