//! # Directory Module
//!
//! The three collaborators a session consults before it starts streaming:
//! who the caller is, which units they may watch, and what those units
//! last reported.
//!
//! ## Contained Modules:
//! - **`static_impl`**: fixed-data implementations used in development and tests.
//! - **`jwt`**: HS256 token validation (feature `jwt`).
//!
//! Redis and Postgres backed implementations live in `crate::connections`.

use async_trait::async_trait;
use thiserror::Error;

use crate::models::{Record, UnitId};

/// Fixed-data collaborators.
pub mod static_impl;
/// JSON Web Token authenticator.
#[cfg(feature = "jwt")]
pub mod jwt;

pub use static_impl::{StaticAuthenticator, StaticSnapshotStore, StaticUnitDirectory};
#[cfg(feature = "jwt")]
pub use jwt::JwtAuthenticator;

pub type UserId = i64;

/// Authenticated caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Identity {
    pub user_id: UserId,
}

#[derive(Debug, Error)]
pub enum DirectoryError {
    #[error("credential rejected: {0}")]
    Rejected(String),
    #[error("backend error: {0}")]
    Backend(String),
}

/// Validates a presented credential.
#[async_trait]
pub trait Authenticator: Send + Sync {
    async fn validate(&self, credential: &str) -> Result<Identity, DirectoryError>;
}

/// Maps an identity to the units it may observe.
#[async_trait]
pub trait UnitDirectory: Send + Sync {
    async fn units_for(&self, user_id: UserId) -> Result<Vec<UnitId>, DirectoryError>;
}

/// Last-known state per unit.
#[async_trait]
pub trait SnapshotStore: Send + Sync {
    async fn last_known(&self, unit_ids: &[UnitId]) -> Result<Vec<Record>, DirectoryError>;
}
