//! Metric names recorded through the `metrics` facade.
//!
//! Nothing is exported unless the binary installs a recorder; without one
//! every update below is a no-op.

/// Sessions currently past authentication (gauge).
pub const SESSIONS_CONNECTED: &str = "realtime_sessions_connected";
/// Sessions accepted since start (counter).
pub const SESSIONS_TOTAL: &str = "realtime_sessions_total";
/// Sessions removed by the hub after a failed push (counter).
pub const SESSIONS_REAPED_TOTAL: &str = "realtime_sessions_reaped_total";
/// Record pushes that reached a session (counter).
pub const BROADCASTS_DELIVERED_TOTAL: &str = "realtime_broadcasts_delivered_total";
/// Stream messages consumed (counter, labels: partition).
pub const MESSAGES_CONSUMED_TOTAL: &str = "realtime_messages_consumed_total";
/// Stream messages that did not decode (counter).
pub const MESSAGES_MALFORMED_TOTAL: &str = "realtime_messages_malformed_total";
/// Stream receive errors (counter).
pub const STREAM_ERRORS_TOTAL: &str = "realtime_stream_errors_total";
