//! Domain layer for rask-ingest-buffer.
//!
//! Contains the canonical types shared across all modules:
//! - `Event`: the opaque ingestion item the buffer carries
//! - `BufferItem`: the bound the generic core requires of items

pub mod event;

pub use event::{BufferItem, Event};
