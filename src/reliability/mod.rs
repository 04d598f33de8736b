pub mod circuit;
pub mod disk;
pub mod flow;

pub use circuit::{CircuitBreaker, CircuitError, CircuitState, CircuitStats};
pub use disk::{DiskStore, DiskStoreConfig, StorageError};
pub use flow::{FlowControlManager, FlowControlMetrics};
