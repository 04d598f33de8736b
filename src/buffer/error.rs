use crate::config::ConfigError;
use crate::reliability::circuit::CircuitError;
use crate::reliability::disk::StorageError;
use thiserror::Error;

/// Failure taxonomy for the buffering core.
///
/// `AdmissionRejected` is expected under load and is shed load, not a
/// buffer failure. `Storage` and `CircuitOpen` trigger the memory
/// fallback path inside `BufferManager` and never surface to producers;
/// they appear here so initialization/teardown paths can propagate them.
#[derive(Error, Debug)]
pub enum BufferError {
    #[error("Admission rejected: {count} events at priority {priority}")]
    AdmissionRejected { count: usize, priority: u8 },

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Circuit breaker is open")]
    CircuitOpen,

    #[error("Downstream delivery failed: {0}")]
    DeliveryFailure(String),

    #[error("Invalid configuration: {0}")]
    Config(#[from] ConfigError),
}

impl From<CircuitError<StorageError>> for BufferError {
    fn from(err: CircuitError<StorageError>) -> Self {
        match err {
            CircuitError::Open => BufferError::CircuitOpen,
            CircuitError::Inner(storage) => BufferError::Storage(storage),
        }
    }
}
