// Declare the modules to re-export
pub mod core;
pub mod directory;
pub mod ingestors;
pub mod metrics;
pub mod models;

#[cfg(feature = "connections")]
pub mod connections;
#[cfg(feature = "loggers")]
pub mod loggers;

#[cfg(test)]
mod test_support;

// Re-export the types every caller needs
pub use crate::core::{DeliveryError, Hub, SessionEnd, SessionError, SessionId, SessionManager, SessionSink};
pub use directory::{Authenticator, DirectoryError, Identity, SnapshotStore, UnitDirectory, UserId};
pub use ingestors::{BridgeConfig, InboundMessage, MessageSource, StreamBridge, StreamError};
pub use models::{ParamValue, Position, Record, UnitId};
