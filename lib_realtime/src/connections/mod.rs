//! # Connections Module
//!
//! Collaborators backed by external services: the Redis snapshot cache and
//! the Postgres unit directory.

use thiserror::Error;

/// Redis-backed last-known state.
pub mod cache_redis;

/// Postgres-backed user to unit mapping.
pub mod db_postgres;

pub use cache_redis::RedisSnapshotStore;
pub use db_postgres::PostgresUnitDirectory;

#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("Failed to connect to redis: {0}")]
    Redis(#[from] redis::RedisError),
    #[error("Failed to create database pool: {0}")]
    Pool(#[from] deadpool_postgres::CreatePoolError),
    #[error("Database check failed: {0}")]
    Database(String),
}
