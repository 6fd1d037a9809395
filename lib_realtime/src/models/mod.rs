//! # Models Module
//!
//! Data carried from the event stream to connected sessions.

/// The per-unit state update and its auxiliary value type.
pub mod record;

pub use record::{ParamValue, Position, Record, UnitId};
