//! Error types for the snapshot store and the family normalizer.

use thiserror::Error;

/// Errors produced while resolving a (family, version) partition key.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FamilyError {
    #[error("unknown os family: {0}")]
    UnknownFamily(String),

    #[error("invalid {family} version: {version:?}")]
    InvalidVersion { family: String, version: String },
}

/// Errors surfaced by every storage backend.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("unsupported database backend: {0}")]
    UnsupportedBackend(String),

    #[error("invalid store configuration: {0}")]
    InvalidConfig(String),

    #[error(
        "database was created with an incompatible legacy schema, delete it and fetch again"
    )]
    IncompatibleSchema,

    #[error(
        "schema version is outdated (database: {stored}, latest: {latest}), rebuild the database"
    )]
    SchemaOutdated { stored: u32, latest: u32 },

    #[error(transparent)]
    Normalize(#[from] FamilyError),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("invalid timestamp {value:?}: {reason}")]
    InvalidTimestamp { value: String, reason: String },

    #[error("insert into {0} did not return a generated id")]
    MissingGeneratedId(&'static str),

    #[error("connection timed out after {0} seconds")]
    ConnectTimeout(u64),
}

impl StoreError {
    /// True when the error was caused by the caller's family/version arguments.
    pub fn is_normalize(&self) -> bool {
        matches!(self, StoreError::Normalize(_))
    }
}

pub type Result<T, E = StoreError> = std::result::Result<T, E>;
