//! Picks the authenticator, unit directory and snapshot store from config.

use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::info;

use lib_realtime::connections::{PostgresUnitDirectory, RedisSnapshotStore};
use lib_realtime::directory::{
    Authenticator, JwtAuthenticator, SnapshotStore, StaticAuthenticator, StaticSnapshotStore, StaticUnitDirectory,
    UnitDirectory,
};

use crate::realtime_logic::config::{AuthMode, Config};

pub struct Collaborators {
    pub authenticator: Arc<dyn Authenticator>,
    pub units: Arc<dyn UnitDirectory>,
    pub snapshots: Arc<dyn SnapshotStore>,
}

pub fn build_authenticator(config: &Config) -> Arc<dyn Authenticator> {
    match config.auth_mode() {
        AuthMode::Jwt => {
            info!("Authenticating clients with HS256 tokens");
            Arc::new(JwtAuthenticator::new_with_secret(config.jwt_secret().as_bytes()))
        }
        AuthMode::Static => {
            info!("Authenticating clients with the static development user");
            Arc::new(StaticAuthenticator::default())
        }
    }
}

pub async fn build(config: &Config) -> Result<Collaborators> {
    let authenticator = build_authenticator(config);

    let units: Arc<dyn UnitDirectory> = match &config.database_url {
        Some(url) => {
            let directory = PostgresUnitDirectory::connect(url)
                .await
                .context("Failed to connect unit directory database")?;
            info!("Unit directory: postgres");
            Arc::new(directory)
        }
        None => {
            info!("Unit directory: static");
            Arc::new(StaticUnitDirectory::default())
        }
    };

    let snapshots: Arc<dyn SnapshotStore> = match &config.redis_url {
        Some(url) => {
            let store = RedisSnapshotStore::connect(url, config.redis_key_prefix())
                .await
                .context("Failed to connect snapshot cache")?;
            info!(key_prefix = config.redis_key_prefix(), "Snapshot store: redis");
            Arc::new(store)
        }
        None => {
            info!("Snapshot store: static");
            Arc::new(StaticSnapshotStore::default())
        }
    };

    Ok(Collaborators {
        authenticator,
        units,
        snapshots,
    })
}
