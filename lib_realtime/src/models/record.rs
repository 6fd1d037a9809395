//! # Unit Record
//!
//! One state update for a tracked unit, exactly as it travels on the wire:
//! the stream produces it as JSON and sessions receive the same JSON back.
//!
//! Field names are the short forms used by the upstream producers
//! (`id`, `t`, `st`, `pos{x,y,z,a,s,st}`, `params`, `address`). Everything
//! except `id` falls back to zero/empty when a producer leaves it out, so a
//! sparse update such as `{"id":586,"pos":{"x":1,"y":2}}` still decodes.

use serde::{Deserialize, Deserializer, Serialize};
use std::collections::BTreeMap;

/// Routing key of a unit. Records are fanned out by this value.
pub type UnitId = i64;

/// # Record
///
/// Immutable once decoded; the hub serializes it once per broadcast and
/// sends the same text to every subscribed session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    /// Unit identifier, used as the routing key.
    #[serde(rename = "id")]
    pub unit_id: UnitId,
    /// Record type.
    #[serde(rename = "t", default)]
    pub record_type: i32,
    /// Record subtype.
    #[serde(rename = "st", default)]
    pub subtype: i32,
    /// Last reported position.
    #[serde(default, deserialize_with = "null_as_default")]
    pub pos: Position,
    /// Open set of auxiliary named values (sensor readings, counters, ...).
    #[serde(default, deserialize_with = "null_as_default", skip_serializing_if = "BTreeMap::is_empty")]
    pub params: BTreeMap<String, ParamValue>,
    /// Free-text address, when the producer resolved one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,
}

/// Position part of a [`Record`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Position {
    #[serde(default)]
    pub x: f64,
    #[serde(default)]
    pub y: f64,
    #[serde(default)]
    pub z: i32,
    /// Heading.
    #[serde(rename = "a", default)]
    pub heading: i32,
    /// Speed state.
    #[serde(rename = "s", default)]
    pub speed_state: i32,
    /// Position status.
    #[serde(rename = "st", default)]
    pub status: i32,
}

/// # Auxiliary Value
///
/// Closed set of shapes a `params` entry may take. Untagged, so the JSON
/// stays a plain value: `52.3`, `"on"`, `true`, `{"fuel": 40}`.
///
/// Variant order matters for decoding: integers are tried before floats so
/// `7` stays an integer and `7.5` becomes a float.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ParamValue {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    List(Vec<ParamValue>),
    Map(BTreeMap<String, ParamValue>),
}

/// Treats an explicit `null` like an absent field.
fn null_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

impl Record {
    /// Creates a record for `unit_id` with every other field zeroed.
    pub fn new(unit_id: UnitId) -> Self {
        Self {
            unit_id,
            record_type: 0,
            subtype: 0,
            pos: Position::default(),
            params: BTreeMap::new(),
            address: None,
        }
    }
}
