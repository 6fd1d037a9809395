//! # Loggers Module
//!
//! Global `tracing` subscriber setup shared by the binaries.

/// Console + rolling JSON file subscriber.
pub mod setup;

pub use setup::{setup_logging, LoggingError};
