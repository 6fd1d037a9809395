//! # Redis Snapshot Store
//!
//! Reads the last-known Record of each unit from keys `{prefix}{unit_id}`
//! holding the Record's JSON text. Whoever writes the stream also keeps
//! these keys fresh; this side only reads.

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::Client;
use tracing::{debug, warn};

use super::ConnectionError;
use crate::directory::{DirectoryError, SnapshotStore};
use crate::models::{Record, UnitId};

pub const DEFAULT_KEY_PREFIX: &str = "unit:last:";

#[derive(Clone)]
pub struct RedisSnapshotStore {
    manager: ConnectionManager,
    key_prefix: String,
}

impl RedisSnapshotStore {
    /// Opens a managed connection to `url` (e.g. "redis://127.0.0.1/").
    pub async fn connect(url: &str, key_prefix: impl Into<String>) -> Result<Self, ConnectionError> {
        let client = Client::open(url)?;
        let manager = ConnectionManager::new(client).await?;
        Ok(Self {
            manager,
            key_prefix: key_prefix.into(),
        })
    }

    fn key_for(&self, unit_id: UnitId) -> String {
        unit_key(&self.key_prefix, unit_id)
    }
}

fn unit_key(prefix: &str, unit_id: UnitId) -> String {
    format!("{prefix}{unit_id}")
}

/// Pairs MGET replies with their units, dropping misses and bad JSON.
fn collect_records(unit_ids: &[UnitId], values: Vec<Option<String>>) -> Vec<Record> {
    unit_ids
        .iter()
        .zip(values)
        .filter_map(|(unit_id, value)| {
            let raw = value?;
            match serde_json::from_str::<Record>(&raw) {
                Ok(record) => Some(record),
                Err(e) => {
                    warn!(unit_id, error = %e, "Skipping undecodable cached record");
                    None
                }
            }
        })
        .collect()
}

#[async_trait]
impl SnapshotStore for RedisSnapshotStore {
    async fn last_known(&self, unit_ids: &[UnitId]) -> Result<Vec<Record>, DirectoryError> {
        if unit_ids.is_empty() {
            return Ok(Vec::new());
        }

        let keys: Vec<String> = unit_ids.iter().map(|id| self.key_for(*id)).collect();
        let mut conn = self.manager.clone();
        let values: Vec<Option<String>> = redis::cmd("MGET")
            .arg(&keys)
            .query_async(&mut conn)
            .await
            .map_err(|e| DirectoryError::Backend(e.to_string()))?;

        let records = collect_records(unit_ids, values);
        debug!(requested = unit_ids.len(), found = records.len(), "Snapshot read from redis");
        Ok(records)
    }
}
