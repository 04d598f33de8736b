pub mod backpressure;
pub mod batch;
pub mod error;
pub mod manager;
pub mod metrics;
pub mod ring;

pub use backpressure::{BackpressureEvent, BackpressureMonitor, BackpressureSnapshot};
pub use batch::{AdaptiveBatchManager, AdjustmentReason, BatchAdjustment, BatchSizingStats};
pub use error::BufferError;
pub use manager::{AddReport, BufferManager, BufferStats};
pub use metrics::{AtomicMetricsSink, MetricsSink, NoopMetricsSink};
pub use ring::RingBuffer;

#[cfg(feature = "metrics")]
pub use metrics::PrometheusSink;
