use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

use crate::config::BackpressureConfig;

const LATENCY_WINDOW: usize = 1_000;
const THROUGHPUT_WINDOW: usize = 60;
/// Adaptive thresholds may relax up to 1.5x and tighten down to 0.5x of
/// the static configuration.
const RELAX_CEILING: f64 = 1.5;
const TIGHTEN_FLOOR: f64 = 0.5;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackpressureEvent {
    Activated,
    Deactivated,
}

#[derive(Debug, Clone)]
pub struct BackpressureSnapshot {
    pub queue_depth: usize,
    pub average_latency_ms: f64,
    pub error_rate: f64,
    pub throughput: f64,
    pub active: bool,
    pub activation_count: u64,
    /// Present only when adaptive thresholds are enabled.
    pub adjusted_queue_depth_threshold: Option<usize>,
    pub adjusted_latency_threshold_ms: Option<f64>,
}

#[derive(Debug)]
struct MonitorWindows {
    latencies_ms: VecDeque<f64>,
    throughput: VecDeque<f64>,
    errors: u64,
    requests: u64,
    queue_depth: usize,
    adjusted_queue_depth: f64,
    adjusted_latency_ms: f64,
}

/// Rolling-window health monitor driving the system-wide "slow down"
/// signal. Subscribers receive activation/deactivation events over a
/// broadcast channel; the snapshot itself is read-only to them.
///
/// With adaptive thresholds enabled, the queue-depth and latency
/// thresholds drift: while inactive and the error rate is well below its
/// threshold, they relax by `recovery_factor` per evaluation (capped at
/// 1.5x static); while active they tighten by the same step (floored at
/// 0.5x static). Graceful expansion when healthy, rapid contraction
/// under stress.
pub struct BackpressureMonitor {
    config: BackpressureConfig,
    windows: Mutex<MonitorWindows>,
    active: AtomicBool,
    activation_count: AtomicU64,
    events: broadcast::Sender<BackpressureEvent>,
    cancel: CancellationToken,
}

impl BackpressureMonitor {
    /// Creates the monitor and spawns its evaluation task on the
    /// configured interval. The task stops when `shutdown` is called.
    pub fn start(config: BackpressureConfig) -> Arc<Self> {
        let (events, _) = broadcast::channel(64);
        let static_queue_depth = config.queue_depth_threshold as f64;
        let static_latency_ms = config.latency_threshold_ms;
        let monitor = Arc::new(Self {
            config,
            windows: Mutex::new(MonitorWindows {
                latencies_ms: VecDeque::with_capacity(LATENCY_WINDOW),
                throughput: VecDeque::with_capacity(THROUGHPUT_WINDOW),
                errors: 0,
                requests: 0,
                queue_depth: 0,
                adjusted_queue_depth: static_queue_depth,
                adjusted_latency_ms: static_latency_ms,
            }),
            active: AtomicBool::new(false),
            activation_count: AtomicU64::new(0),
            events,
            cancel: CancellationToken::new(),
        });

        let task_monitor = Arc::clone(&monitor);
        let cancel = monitor.cancel.clone();
        let interval = monitor.config.monitoring_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => task_monitor.evaluate(),
                }
            }
        });

        monitor
    }

    /// Records one request outcome into the rolling windows.
    pub fn record_sample(&self, latency_ms: f64, success: bool) {
        let mut windows = self.windows.lock();
        if windows.latencies_ms.len() == LATENCY_WINDOW {
            windows.latencies_ms.pop_front();
        }
        windows.latencies_ms.push_back(latency_ms);
        windows.requests += 1;
        if !success {
            windows.errors += 1;
        }
    }

    pub fn update_queue_depth(&self, depth: usize) {
        self.windows.lock().queue_depth = depth;
    }

    /// Records one events/sec sample, computed by the caller over a
    /// window of at least one second.
    pub fn record_throughput(&self, events_per_sec: f64) {
        let mut windows = self.windows.lock();
        if windows.throughput.len() == THROUGHPUT_WINDOW {
            windows.throughput.pop_front();
        }
        windows.throughput.push_back(events_per_sec);
    }

    /// One evaluation tick: recompute the snapshot, decide the active
    /// flag, drift adaptive thresholds, and notify on transitions.
    /// Public so tests can drive it deterministically.
    pub fn evaluate(&self) {
        let (should_activate, error_rate) = {
            let mut windows = self.windows.lock();
            let avg_latency = average(&windows.latencies_ms);
            let error_rate = if windows.requests == 0 {
                0.0
            } else {
                windows.errors as f64 / windows.requests as f64
            };

            let (queue_threshold, latency_threshold) = if self.config.adaptive_thresholds {
                (windows.adjusted_queue_depth, windows.adjusted_latency_ms)
            } else {
                (
                    self.config.queue_depth_threshold as f64,
                    self.config.latency_threshold_ms,
                )
            };

            let should_activate = windows.queue_depth as f64 > queue_threshold
                || avg_latency > latency_threshold
                || error_rate > self.config.error_rate_threshold;

            if self.config.adaptive_thresholds {
                self.drift_thresholds(&mut windows, should_activate, error_rate);
            }

            (should_activate, error_rate)
        };

        let was_active = self.active.swap(should_activate, Ordering::SeqCst);
        if should_activate && !was_active {
            self.activation_count.fetch_add(1, Ordering::Relaxed);
            tracing::warn!(error_rate, "backpressure activated");
            let _ = self.events.send(BackpressureEvent::Activated);
        } else if !should_activate && was_active {
            tracing::info!("backpressure deactivated");
            let _ = self.events.send(BackpressureEvent::Deactivated);
        }
    }

    fn drift_thresholds(&self, windows: &mut MonitorWindows, active: bool, error_rate: f64) {
        let static_queue = self.config.queue_depth_threshold as f64;
        let static_latency = self.config.latency_threshold_ms;
        let step = self.config.recovery_factor;

        if active {
            windows.adjusted_queue_depth =
                (windows.adjusted_queue_depth * (1.0 - step)).max(static_queue * TIGHTEN_FLOOR);
            windows.adjusted_latency_ms =
                (windows.adjusted_latency_ms * (1.0 - step)).max(static_latency * TIGHTEN_FLOOR);
        } else if error_rate < self.config.error_rate_threshold * 0.5 {
            windows.adjusted_queue_depth =
                (windows.adjusted_queue_depth * (1.0 + step)).min(static_queue * RELAX_CEILING);
            windows.adjusted_latency_ms =
                (windows.adjusted_latency_ms * (1.0 + step)).min(static_latency * RELAX_CEILING);
        }
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<BackpressureEvent> {
        self.events.subscribe()
    }

    pub fn snapshot(&self) -> BackpressureSnapshot {
        let windows = self.windows.lock();
        let error_rate = if windows.requests == 0 {
            0.0
        } else {
            windows.errors as f64 / windows.requests as f64
        };
        let adaptive = self.config.adaptive_thresholds;
        BackpressureSnapshot {
            queue_depth: windows.queue_depth,
            average_latency_ms: average(&windows.latencies_ms),
            error_rate,
            throughput: average(&windows.throughput),
            active: self.active.load(Ordering::SeqCst),
            activation_count: self.activation_count.load(Ordering::Relaxed),
            adjusted_queue_depth_threshold: adaptive
                .then_some(windows.adjusted_queue_depth as usize),
            adjusted_latency_threshold_ms: adaptive.then_some(windows.adjusted_latency_ms),
        }
    }

    /// Clears rolling state and restores static thresholds.
    pub fn reset(&self) {
        let mut windows = self.windows.lock();
        windows.latencies_ms.clear();
        windows.throughput.clear();
        windows.errors = 0;
        windows.requests = 0;
        windows.queue_depth = 0;
        windows.adjusted_queue_depth = self.config.queue_depth_threshold as f64;
        windows.adjusted_latency_ms = self.config.latency_threshold_ms;
        self.active.store(false, Ordering::SeqCst);
    }

    /// Stops the evaluation task; subscribers see their channel close.
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }
}

impl Drop for BackpressureMonitor {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

fn average(samples: &VecDeque<f64>) -> f64 {
    if samples.is_empty() {
        0.0
    } else {
        samples.iter().sum::<f64>() / samples.len() as f64
    }
}
