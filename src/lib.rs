#![deny(warnings, rust_2024_compatibility)]
// Specific pedantic lints enforced (not blanket allow):
#![deny(
    clippy::explicit_iter_loop,
    clippy::manual_let_else,
    clippy::semicolon_if_nothing_returned,
    clippy::inconsistent_struct_constructor
)]
// Noisy pedantic lints suppressed with justification:
#![allow(
    clippy::cast_lossless,            // Infallible casts are clear enough with `as`
    clippy::cast_possible_truncation, // Safe within realistic value bounds (durations, sizes)
    clippy::cast_possible_wrap,       // Safe in non-negative contexts
    clippy::cast_precision_loss,      // Acceptable for metrics/display
    clippy::cast_sign_loss,           // Safe where values are known non-negative
    clippy::missing_errors_doc,       // Internal API
    clippy::missing_panics_doc,       // Internal API
    clippy::module_name_repetitions,  // e.g. BufferError in buffer module
    clippy::must_use_candidate,       // Annotated selectively on critical APIs
    clippy::doc_markdown              // Internal API
)]

//! Ingestion-side buffering and admission control for a log-collection
//! pipeline. Sits between protocol adapters and the downstream broker
//! publisher: absorbs bursts, survives downstream outages via disk
//! spillover, and sheds load under overload while preserving per-tier
//! FIFO order.

pub mod buffer;
pub mod config;
pub mod domain;
pub mod reliability;

// Re-export main types for easy access
pub use buffer::{BufferError, BufferManager, MetricsSink};
pub use config::{Config, ConfigError};
pub use domain::Event;

// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
