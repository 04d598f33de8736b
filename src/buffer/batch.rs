use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

use crate::buffer::backpressure::{BackpressureEvent, BackpressureMonitor};
use crate::buffer::metrics::MetricsSink;
use crate::config::AdaptiveBatchConfig;

const SAMPLE_WINDOW: usize = 100;
const ADJUSTMENT_HISTORY: usize = 50;
const MIN_SAMPLES_FOR_EVALUATION: usize = 5;
/// Reactive nudges applied on backpressure transitions.
const ACTIVATION_SHRINK: f64 = 0.7;
const DEACTIVATION_GROW: f64 = 1.1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdjustmentReason {
    LatencyHigh,
    LatencyLow,
    ThroughputLow,
    BackpressureActivated,
    BackpressureDeactivated,
    Manual,
}

impl AdjustmentReason {
    fn as_label(self) -> &'static str {
        match self {
            Self::LatencyHigh => "latency_high",
            Self::LatencyLow => "latency_low",
            Self::ThroughputLow => "throughput_low",
            Self::BackpressureActivated => "backpressure_activated",
            Self::BackpressureDeactivated => "backpressure_deactivated",
            Self::Manual => "manual",
        }
    }
}

#[derive(Debug, Clone)]
pub struct BatchAdjustment {
    pub at: Instant,
    pub from: usize,
    pub to: usize,
    pub reason: AdjustmentReason,
}

#[derive(Debug, Clone)]
pub struct BatchSizingStats {
    pub current_batch_size: usize,
    pub average_latency_ms: f64,
    pub average_throughput: f64,
    /// Combined latency/throughput score in [0, 1].
    pub performance_score: f64,
    pub adjustments: Vec<BatchAdjustment>,
}

#[derive(Debug)]
struct BatchWindows {
    latencies_ms: VecDeque<f64>,
    throughput: VecDeque<f64>,
    adjustments: VecDeque<BatchAdjustment>,
    performance_score: f64,
}

/// Self-tuning drain batch sizer.
///
/// The periodic evaluation loop adjusts `current_batch_size` from
/// observed batch latency and throughput, but only while backpressure is
/// inactive and enough samples exist. Backpressure transitions bypass
/// that gating entirely: activation shrinks the batch by 30%,
/// deactivation grows it by 10%, always clamped to the configured
/// bounds.
pub struct AdaptiveBatchManager {
    config: AdaptiveBatchConfig,
    monitor: Arc<BackpressureMonitor>,
    metrics: Arc<dyn MetricsSink>,
    current_batch_size: AtomicUsize,
    windows: Mutex<BatchWindows>,
    cancel: CancellationToken,
}

impl AdaptiveBatchManager {
    /// Creates the manager, subscribes to the monitor's notifications,
    /// and (when adaptive sizing is enabled) spawns the evaluation task.
    pub fn start(
        config: AdaptiveBatchConfig,
        monitor: Arc<BackpressureMonitor>,
        metrics: Arc<dyn MetricsSink>,
    ) -> Arc<Self> {
        let initial = config.initial_batch_size;
        let manager = Arc::new(Self {
            config,
            monitor: Arc::clone(&monitor),
            metrics,
            current_batch_size: AtomicUsize::new(initial),
            windows: Mutex::new(BatchWindows {
                latencies_ms: VecDeque::with_capacity(SAMPLE_WINDOW),
                throughput: VecDeque::with_capacity(SAMPLE_WINDOW),
                adjustments: VecDeque::with_capacity(ADJUSTMENT_HISTORY),
                performance_score: 1.0,
            }),
            cancel: CancellationToken::new(),
        });

        // Reactive path: apply backpressure transitions as they arrive.
        let reactive = Arc::clone(&manager);
        let mut events = monitor.subscribe();
        let cancel = manager.cancel.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    event = events.recv() => match event {
                        Ok(event) => reactive.apply_backpressure_event(event),
                        Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => {}
                        Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                    },
                }
            }
        });

        if manager.config.adaptive_enabled {
            let periodic = Arc::clone(&manager);
            let cancel = periodic.cancel.clone();
            let interval = periodic.config.evaluation_interval;
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(interval);
                ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
                loop {
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = ticker.tick() => periodic.evaluate(),
                    }
                }
            });
        }

        manager
    }

    /// Records the outcome of one processed batch.
    pub fn record_batch(&self, _size: usize, duration: Duration, events_per_sec: f64) {
        let mut windows = self.windows.lock();
        if windows.latencies_ms.len() == SAMPLE_WINDOW {
            windows.latencies_ms.pop_front();
        }
        windows.latencies_ms.push_back(duration.as_secs_f64() * 1_000.0);
        if windows.throughput.len() == SAMPLE_WINDOW {
            windows.throughput.pop_front();
        }
        windows.throughput.push_back(events_per_sec);
    }

    pub fn batch_size(&self) -> usize {
        self.current_batch_size.load(Ordering::Relaxed)
    }

    /// One evaluation tick. Skipped while backpressure is active or with
    /// fewer than five samples. Public so tests can drive it directly.
    pub fn evaluate(&self) {
        if self.monitor.is_active() {
            return;
        }

        let target_latency = self.config.target_latency_ms;
        let target_throughput = self.config.throughput_target;
        let factor = self.config.adjustment_factor;

        let mut windows = self.windows.lock();
        if windows.latencies_ms.len() < MIN_SAMPLES_FOR_EVALUATION {
            return;
        }

        let avg_latency = average(&windows.latencies_ms);
        let avg_throughput = average(&windows.throughput);

        let latency_score = target_latency / avg_latency.max(target_latency);
        let throughput_score = (avg_throughput / target_throughput).min(1.0);
        windows.performance_score = (latency_score + throughput_score) / 2.0;

        let latency_deviates = (avg_latency - target_latency).abs() > target_latency * 0.2;
        let throughput_low = avg_throughput < target_throughput * 0.9;
        if !latency_deviates && !throughput_low {
            return;
        }

        let current = self.batch_size();
        let mut scaled = current as f64;
        let reason = if avg_latency > target_latency * 1.2 {
            scaled *= 1.0 - factor;
            AdjustmentReason::LatencyHigh
        } else {
            if avg_latency < target_latency * 0.8 {
                scaled *= 1.0 + factor;
            }
            if throughput_low && avg_latency <= target_latency {
                scaled *= 1.0 + factor / 2.0;
                AdjustmentReason::ThroughputLow
            } else {
                AdjustmentReason::LatencyLow
            }
        };

        let next = self.clamp(scaled.round() as usize);
        if next != current {
            self.current_batch_size.store(next, Ordering::Relaxed);
            self.push_adjustment(&mut windows, current, next, reason);
            tracing::debug!(
                from = current,
                to = next,
                avg_latency_ms = avg_latency,
                "batch size adjusted"
            );
        }
    }

    /// Reactive adjustment, bypassing evaluation gating entirely.
    pub fn apply_backpressure_event(&self, event: BackpressureEvent) {
        let (multiplier, reason) = match event {
            BackpressureEvent::Activated => {
                (ACTIVATION_SHRINK, AdjustmentReason::BackpressureActivated)
            }
            BackpressureEvent::Deactivated => {
                (DEACTIVATION_GROW, AdjustmentReason::BackpressureDeactivated)
            }
        };
        let current = self.batch_size();
        let next = self.clamp((current as f64 * multiplier).round() as usize);
        if next != current {
            self.current_batch_size.store(next, Ordering::Relaxed);
            let mut windows = self.windows.lock();
            self.push_adjustment(&mut windows, current, next, reason);
            tracing::debug!(from = current, to = next, ?event, "reactive batch adjustment");
        }
    }

    /// Clamped manual override.
    pub fn set_batch_size(&self, size: usize) {
        let current = self.batch_size();
        let next = self.clamp(size);
        if next != current {
            self.current_batch_size.store(next, Ordering::Relaxed);
            let mut windows = self.windows.lock();
            self.push_adjustment(&mut windows, current, next, AdjustmentReason::Manual);
        }
    }

    pub fn stats(&self) -> BatchSizingStats {
        let windows = self.windows.lock();
        BatchSizingStats {
            current_batch_size: self.batch_size(),
            average_latency_ms: average(&windows.latencies_ms),
            average_throughput: average(&windows.throughput),
            performance_score: windows.performance_score,
            adjustments: windows.adjustments.iter().cloned().collect(),
        }
    }

    /// Restores the initial size and clears history.
    pub fn reset(&self) {
        self.current_batch_size
            .store(self.config.initial_batch_size, Ordering::Relaxed);
        let mut windows = self.windows.lock();
        windows.latencies_ms.clear();
        windows.throughput.clear();
        windows.adjustments.clear();
        windows.performance_score = 1.0;
    }

    pub fn shutdown(&self) {
        self.cancel.cancel();
    }

    fn clamp(&self, size: usize) -> usize {
        size.clamp(self.config.min_batch_size, self.config.max_batch_size)
    }

    fn push_adjustment(
        &self,
        windows: &mut BatchWindows,
        from: usize,
        to: usize,
        reason: AdjustmentReason,
    ) {
        if windows.adjustments.len() == ADJUSTMENT_HISTORY {
            windows.adjustments.pop_front();
        }
        windows.adjustments.push_back(BatchAdjustment {
            at: Instant::now(),
            from,
            to,
            reason,
        });
        self.metrics.increment_counter(
            "ingest_batch_adjustments_total",
            &[("reason", reason.as_label())],
            1,
        );
        self.metrics.set_gauge("ingest_batch_size", to as f64);
    }
}

impl Drop for AdaptiveBatchManager {
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
