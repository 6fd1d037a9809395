//! Fixed-data collaborators. They answer every call from memory, which is
//! what a local setup without an identity service or cache needs.

use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use tracing::debug;

use super::{Authenticator, DirectoryError, Identity, SnapshotStore, UnitDirectory, UserId};
use crate::models::{ParamValue, Position, Record, UnitId};

/// Accepts any non-empty credential as the same user.
pub struct StaticAuthenticator {
    user_id: UserId,
}

impl StaticAuthenticator {
    pub fn new(user_id: UserId) -> Self {
        Self { user_id }
    }
}

impl Default for StaticAuthenticator {
    fn default() -> Self {
        Self::new(1)
    }
}

#[async_trait]
impl Authenticator for StaticAuthenticator {
    async fn validate(&self, credential: &str) -> Result<Identity, DirectoryError> {
        if credential.trim().is_empty() {
            return Err(DirectoryError::Rejected("empty credential".into()));
        }
        Ok(Identity { user_id: self.user_id })
    }
}

/// Unit directory backed by a fixed map, with a fallback list for users
/// not in the map.
pub struct StaticUnitDirectory {
    per_user: HashMap<UserId, Vec<UnitId>>,
    fallback: Vec<UnitId>,
}

impl StaticUnitDirectory {
    /// Every user gets `units`.
    pub fn uniform(units: Vec<UnitId>) -> Self {
        Self {
            per_user: HashMap::new(),
            fallback: units,
        }
    }

    /// Only the listed users get units; everyone else gets none.
    pub fn per_user(per_user: HashMap<UserId, Vec<UnitId>>) -> Self {
        Self {
            per_user,
            fallback: Vec::new(),
        }
    }
}

impl Default for StaticUnitDirectory {
    fn default() -> Self {
        Self::uniform(vec![586, 102, 103])
    }
}

#[async_trait]
impl UnitDirectory for StaticUnitDirectory {
    async fn units_for(&self, user_id: UserId) -> Result<Vec<UnitId>, DirectoryError> {
        let units = self
            .per_user
            .get(&user_id)
            .unwrap_or(&self.fallback)
            .clone();
        debug!(user_id, unit_ids = ?units, "Resolved units");
        Ok(units)
    }
}

/// Snapshot store that synthesizes one parked record per requested unit.
pub struct StaticSnapshotStore {
    address: String,
    pos: Position,
}

impl StaticSnapshotStore {
    pub fn new(address: impl Into<String>, pos: Position) -> Self {
        Self {
            address: address.into(),
            pos,
        }
    }
}

impl Default for StaticSnapshotStore {
    fn default() -> Self {
        Self::new(
            "Almaty",
            Position {
                x: 77.0,
                y: 43.0,
                ..Position::default()
            },
        )
    }
}

#[async_trait]
impl SnapshotStore for StaticSnapshotStore {
    async fn last_known(&self, unit_ids: &[UnitId]) -> Result<Vec<Record>, DirectoryError> {
        let records = unit_ids
            .iter()
            .map(|unit_id| Record {
                unit_id: *unit_id,
                record_type: 1,
                subtype: 0,
                pos: self.pos,
                params: BTreeMap::from([("speed".to_string(), ParamValue::Float(52.3))]),
                address: Some(self.address.clone()),
            })
            .collect::<Vec<_>>();
        debug!(result_count = records.len(), "Returning static snapshot");
        Ok(records)
    }
}
