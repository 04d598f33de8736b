use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Instant;

use crate::buffer::backpressure::{BackpressureMonitor, BackpressureSnapshot};
use crate::buffer::batch::{AdaptiveBatchManager, BatchSizingStats};
use crate::buffer::error::BufferError;
use crate::buffer::metrics::MetricsSink;
use crate::buffer::ring::RingBuffer;
use crate::config::Config;
use crate::domain::BufferItem;
use crate::reliability::circuit::{CircuitBreaker, CircuitStats};
use crate::reliability::disk::{DiskStore, DiskStoreConfig};
use crate::reliability::flow::{FlowControlManager, FlowControlMetrics};

/// Outcome of one `add_events` call that passed admission.
#[derive(Debug, Default, Clone)]
pub struct AddReport {
    pub buffered_memory: usize,
    pub spilled_to_disk: usize,
    /// Oldest-item evictions from the memory ring.
    pub dropped: usize,
    /// Disk writes that fell back to the memory tier.
    pub disk_fallbacks: usize,
}

#[derive(Debug, Clone)]
pub struct BufferStats {
    pub memory_size: usize,
    pub disk_size: usize,
    pub spilling: bool,
    pub recovering: bool,
    pub total_dropped: u64,
    pub total_disk_fallbacks: u64,
    pub corrupt_disk_records: u64,
}

/// Orchestrator of the two-tier buffer: admission via
/// [`FlowControlManager`], spill routing through the
/// [`CircuitBreaker`] into the [`DiskStore`], drain batches sized by
/// [`AdaptiveBatchManager`], with live queue-depth and latency samples
/// fed to the [`BackpressureMonitor`].
///
/// Ordering: FIFO is preserved within each tier. Spillover does not
/// guarantee global cross-tier order; an event spilled to disk while
/// memory still holds older items may be delivered after them.
pub struct BufferManager<T: BufferItem> {
    memory: Mutex<RingBuffer<T>>,
    disk: tokio::sync::Mutex<DiskStore<T>>,
    breaker: CircuitBreaker,
    monitor: Arc<BackpressureMonitor>,
    batcher: Arc<AdaptiveBatchManager>,
    flow: Arc<FlowControlManager>,
    metrics: Arc<dyn MetricsSink>,
    high_water_mark: f64,
    low_water_mark: f64,
    spilling: AtomicBool,
    recovering: AtomicBool,
    total_dropped: AtomicU64,
    total_disk_fallbacks: AtomicU64,
}

impl<T: BufferItem> BufferManager<T> {
    /// Opens the disk store and starts every control component. A
    /// backlog persisted by a prior run puts the manager into
    /// `recovering` mode, preferring the disk path until drained.
    pub async fn new(config: Config, metrics: Arc<dyn MetricsSink>) -> Result<Self, BufferError> {
        config.validate()?;

        let disk = DiskStore::open(DiskStoreConfig {
            path: config.buffer.disk_path.clone(),
            max_records: config.buffer.disk_capacity,
            max_bytes: config.buffer.max_disk_bytes,
            compression: config.buffer.compression_enabled,
            retention_period: config.buffer.retention_period,
        })
        .await?;

        let recovering = !disk.is_empty();
        if recovering {
            tracing::info!(backlog = disk.len(), "entering recovery mode");
        }

        let monitor = BackpressureMonitor::start(config.backpressure.clone());
        let batcher = AdaptiveBatchManager::start(
            config.batching.clone(),
            Arc::clone(&monitor),
            Arc::clone(&metrics),
        );
        let flow = FlowControlManager::start(config.flow_control.clone(), Arc::clone(&monitor));

        Ok(Self {
            memory: Mutex::new(RingBuffer::new(config.buffer.memory_capacity)),
            disk: tokio::sync::Mutex::new(disk),
            breaker: CircuitBreaker::new(config.circuit_breaker.clone(), Arc::clone(&metrics)),
            monitor,
            batcher,
            flow,
            metrics,
            high_water_mark: config.buffer.high_water_mark_percent,
            low_water_mark: config.buffer.low_water_mark_percent,
            spilling: AtomicBool::new(false),
            recovering: AtomicBool::new(recovering),
            total_dropped: AtomicU64::new(0),
            total_disk_fallbacks: AtomicU64::new(0),
        })
    }

    /// Admits a single event at top priority.
    pub async fn add_event(&self, event: T) -> Result<AddReport, BufferError> {
        self.add_events(vec![event], 1).await
    }

    /// Admits a batch of events at the given priority (1 = highest).
    ///
    /// A flow-control denial drops the whole batch and returns
    /// [`BufferError::AdmissionRejected`]; that is shed load, not a
    /// buffer failure. Storage and breaker failures never surface here;
    /// they fall back to the memory tier and are counted.
    pub async fn add_events(&self, events: Vec<T>, priority: u8) -> Result<AddReport, BufferError> {
        let count = events.len();
        if count == 0 {
            return Ok(AddReport::default());
        }

        if !self.flow.request_permission(count, priority) {
            self.metrics.increment_counter(
                "ingest_admission_rejected_total",
                &[],
                count as u64,
            );
            return Err(BufferError::AdmissionRejected { count, priority });
        }
        self.metrics
            .increment_counter("ingest_events_admitted_total", &[], count as u64);

        let total = self.total_size().await;
        self.monitor.update_queue_depth(total);
        self.metrics.set_gauge("ingest_queue_depth", total as f64);
        self.update_watermark();

        let started = Instant::now();
        let mut report = AddReport::default();

        if self.spilling.load(Ordering::SeqCst) || self.recovering.load(Ordering::SeqCst) {
            let mut disk = self.disk.lock().await;
            for event in events {
                match self.breaker.execute(|| disk.write(&event)).await {
                    Ok(()) => report.spilled_to_disk += 1,
                    Err(err) => {
                        // Memory fallback keeps the event; only the
                        // eviction it may cause is lost.
                        tracing::debug!(error = %err, "disk write failed, falling back to memory");
                        self.metrics
                            .increment_counter("ingest_disk_fallback_total", &[], 1);
                        report.disk_fallbacks += 1;
                        if self.memory.lock().add(event).is_some() {
                            report.dropped += 1;
                        }
                        report.buffered_memory += 1;
                    }
                }
            }
        } else {
            let mut memory = self.memory.lock();
            for event in events {
                if memory.add(event).is_some() {
                    report.dropped += 1;
                }
                report.buffered_memory += 1;
            }
        }

        if report.dropped > 0 {
            self.total_dropped
                .fetch_add(report.dropped as u64, Ordering::Relaxed);
            self.metrics.increment_counter(
                "ingest_events_dropped_total",
                &[("reason", "capacity")],
                report.dropped as u64,
            );
        }
        self.total_disk_fallbacks
            .fetch_add(report.disk_fallbacks as u64, Ordering::Relaxed);

        let elapsed = started.elapsed();
        let elapsed_ms = elapsed.as_secs_f64() * 1_000.0;
        self.monitor
            .record_sample(elapsed_ms, report.disk_fallbacks == 0);
        self.metrics
            .record_histogram("ingest_add_latency_ms", elapsed_ms);
        let throughput = count as f64 / elapsed.as_secs_f64().max(1e-9);
        self.batcher.record_batch(count, elapsed, throughput);

        Ok(report)
    }

    /// Drains one batch, memory first (FIFO), topping up from disk only
    /// while spilling or recovering. `size` defaults to the adaptive
    /// batch size.
    pub async fn get_batch(&self, size: Option<usize>) -> Vec<T> {
        let target = size.unwrap_or_else(|| self.batcher.batch_size());
        let mut batch = Vec::with_capacity(target.min(1024));

        {
            let mut memory = self.memory.lock();
            while batch.len() < target {
                let Some(event) = memory.get() else { break };
                batch.push(event);
            }
        }

        if batch.len() < target
            && (self.spilling.load(Ordering::SeqCst) || self.recovering.load(Ordering::SeqCst))
        {
            let mut disk = self.disk.lock().await;
            let corrupt_before = disk.corrupt_records();
            batch.extend(disk.read(target - batch.len()).await);
            let skipped = disk.corrupt_records() - corrupt_before;
            if skipped > 0 {
                self.total_dropped.fetch_add(skipped, Ordering::Relaxed);
                self.metrics.increment_counter(
                    "ingest_events_dropped_total",
                    &[("reason", "unreadable")],
                    skipped,
                );
            }
            if disk.is_empty() && self.recovering.swap(false, Ordering::SeqCst) {
                tracing::info!("disk backlog drained, leaving recovery mode");
            }
        }

        batch
    }

    /// Repeatedly drains `get_batch(size)` until empty. Flush/shutdown
    /// helper.
    pub async fn get_batches(&self, size: usize) -> Vec<Vec<T>> {
        let mut batches = Vec::new();
        loop {
            let batch = self.get_batch(Some(size)).await;
            if batch.is_empty() {
                break;
            }
            batches.push(batch);
        }
        batches
    }

    /// Reinserts failed-delivery events at the front of the memory ring
    /// in their original order, so they are redelivered before newer
    /// arrivals.
    pub fn requeue_events(&self, events: Vec<T>) {
        let count = events.len();
        let mut dropped = 0usize;
        {
            let mut memory = self.memory.lock();
            for event in events.into_iter().rev() {
                if memory.add_front(event).is_some() {
                    dropped += 1;
                }
            }
        }
        if dropped > 0 {
            self.total_dropped.fetch_add(dropped as u64, Ordering::Relaxed);
            self.metrics.increment_counter(
                "ingest_events_dropped_total",
                &[("reason", "requeue")],
                dropped as u64,
            );
        }
        self.metrics
            .increment_counter("ingest_events_requeued_total", &[], count as u64);
    }

    /// Drains everything from both tiers without regard to batch size.
    /// Shutdown path only.
    pub async fn flush(&self) -> Vec<T> {
        let mut drained = Vec::new();
        {
            let mut memory = self.memory.lock();
            while let Some(event) = memory.get() {
                drained.push(event);
            }
        }

        let mut disk = self.disk.lock().await;
        while !disk.is_empty() {
            drained.extend(disk.read(1_024).await);
        }
        self.recovering.store(false, Ordering::SeqCst);

        tracing::info!(events = drained.len(), "buffer flushed");
        drained
    }

    /// Tears down consumers before the storage they depend on.
    pub async fn close(&self) {
        self.breaker.reset();
        self.monitor.shutdown();
        self.batcher.shutdown();
        self.flow.shutdown();
        self.disk.lock().await.close();
    }

    /// Removes spilled records older than the configured retention.
    pub async fn sweep_expired(&self) -> Result<u32, BufferError> {
        let removed = self.disk.lock().await.sweep_expired().await?;
        if removed > 0 {
            self.metrics
                .increment_counter("ingest_records_expired_total", &[], removed as u64);
        }
        Ok(removed)
    }

    pub fn memory_size(&self) -> usize {
        self.memory.lock().len()
    }

    pub async fn disk_size(&self) -> usize {
        self.disk.lock().await.len()
    }

    pub async fn total_size(&self) -> usize {
        self.memory_size() + self.disk_size().await
    }

    pub fn is_spilling(&self) -> bool {
        self.spilling.load(Ordering::SeqCst)
    }

    pub fn is_recovering(&self) -> bool {
        self.recovering.load(Ordering::SeqCst)
    }

    pub fn is_backpressure_active(&self) -> bool {
        self.monitor.is_active()
    }

    pub fn is_circuit_breaker_open(&self) -> bool {
        self.breaker.is_open()
    }

    pub fn reset_circuit_breaker(&self) {
        self.breaker.reset();
    }

    /// Clamped manual override of the drain batch size.
    pub fn adjust_batch_size(&self, size: usize) {
        self.batcher.set_batch_size(size);
    }

    pub fn adjust_flow_control_rate(&self, rate: usize) {
        self.flow.adjust_rate_limit(rate);
    }

    /// Forwards a caller-computed events/sec sample (over a window of
    /// at least one second) to the backpressure monitor.
    pub fn record_throughput(&self, events_per_sec: f64) {
        self.monitor.record_throughput(events_per_sec);
    }

    pub fn backpressure_snapshot(&self) -> BackpressureSnapshot {
        self.monitor.snapshot()
    }

    pub fn batch_stats(&self) -> BatchSizingStats {
        self.batcher.stats()
    }

    pub fn flow_metrics(&self) -> FlowControlMetrics {
        self.flow.metrics()
    }

    pub fn circuit_stats(&self) -> CircuitStats {
        self.breaker.stats()
    }

    pub async fn stats(&self) -> BufferStats {
        let disk = self.disk.lock().await;
        BufferStats {
            memory_size: self.memory_size(),
            disk_size: disk.len(),
            spilling: self.spilling.load(Ordering::SeqCst),
            recovering: self.recovering.load(Ordering::SeqCst),
            total_dropped: self.total_dropped.load(Ordering::Relaxed),
            total_disk_fallbacks: self.total_disk_fallbacks.load(Ordering::Relaxed),
            corrupt_disk_records: disk.corrupt_records(),
        }
    }

    /// Hysteresis: enter spill at or above the high watermark, leave
    /// only strictly below the low watermark.
    fn update_watermark(&self) {
        let usage = self.memory.lock().usage_percent();
        if self.spilling.load(Ordering::SeqCst) {
            if usage < self.low_water_mark {
                self.spilling.store(false, Ordering::SeqCst);
                self.metrics.increment_counter(
                    "ingest_spill_transitions_total",
                    &[("direction", "exit")],
                    1,
                );
                tracing::info!(usage_percent = usage, "spillover deactivated");
            }
        } else if usage >= self.high_water_mark {
            self.spilling.store(true, Ordering::SeqCst);
            self.metrics.increment_counter(
                "ingest_spill_transitions_total",
                &[("direction", "enter")],
                1,
            );
            tracing::warn!(usage_percent = usage, "spillover activated");
        }
        self.metrics.set_gauge("ingest_memory_usage_percent", usage);
    }
}
