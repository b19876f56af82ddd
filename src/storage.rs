//! Storage layer for oval-store
//!
//! One `Store` contract over two structurally different backends.
//!
//! # Module Structure
//! - `rdb`: relational store (SQLite, MySQL, PostgreSQL) with transactional partition replacement
//! - `redis_store`: key-value store with a hash per CVE and a sorted-set package index

mod rdb;
mod redis_store;

use chrono::{DateTime, Utc};
use clap::ValueEnum;
use serde::Serialize;
use std::fmt;
use std::str::FromStr;
use tracing::info;

pub use rdb::{Dialect, RdbStore};
pub use redis_store::RedisStore;

use crate::config::StoreConfig;
use crate::error::{Result, StoreError};
use crate::family::{Partition, normalize};
use crate::meta::{FetchMeta, SourceFile};
use crate::models::Definition;
use crate::query::{Lookup, post_filter, requested_arch};

/// Supported database backends
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum BackendKind {
    #[value(name = "sqlite3", alias = "sqlite")]
    Sqlite3,
    Mysql,
    #[value(alias = "postgresql")]
    Postgres,
    Redis,
}

impl FromStr for BackendKind {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "sqlite3" | "sqlite" => Ok(BackendKind::Sqlite3),
            "mysql" => Ok(BackendKind::Mysql),
            "postgres" | "postgresql" => Ok(BackendKind::Postgres),
            "redis" => Ok(BackendKind::Redis),
            _ => Err(StoreError::UnsupportedBackend(s.to_string())),
        }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackendKind::Sqlite3 => write!(f, "sqlite3"),
            BackendKind::Mysql => write!(f, "mysql"),
            BackendKind::Postgres => write!(f, "postgres"),
            BackendKind::Redis => write!(f, "redis"),
        }
    }
}

/// Result of one `insert_snapshot` call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "outcome")]
pub enum InsertOutcome {
    Inserted { definitions: usize },
    /// The same source file with the same timestamp was already ingested
    Skipped,
}

/// A snapshot store opened on one backend
pub enum Store {
    Rdb(RdbStore),
    Redis(RedisStore),
}

impl Store {
    pub async fn open(kind: BackendKind, connection: &str, config: StoreConfig) -> Result<Self> {
        config.validate()?;
        let store = match Dialect::from_backend(kind) {
            Some(dialect) => Store::Rdb(RdbStore::open(dialect, connection, &config).await?),
            None => Store::Redis(RedisStore::open(connection, &config).await?),
        };
        info!(backend = %kind, "Store opened");
        Ok(store)
    }

    pub fn name(&self) -> &'static str {
        match self {
            Store::Rdb(store) => match store.dialect() {
                Dialect::Sqlite => "sqlite3",
                Dialect::Mysql => "mysql",
                Dialect::Postgres => "postgres",
            },
            Store::Redis(_) => "redis",
        }
    }

    /// Store a vendor snapshot for the (family, version) partition.
    ///
    /// On a relational backend the previous snapshot is replaced atomically and an unchanged
    /// source file is skipped. The key-value backend overwrites entries in place.
    pub async fn insert_snapshot(
        &self,
        family: &str,
        raw_version: &str,
        defs: Vec<Definition>,
        source: SourceFile,
    ) -> Result<InsertOutcome> {
        let partition = normalize(family, raw_version)?;
        info!(
            partition = %partition,
            definitions = defs.len(),
            file = %source.name,
            backend = self.name(),
            "Inserting snapshot"
        );

        match self {
            Store::Rdb(store) => {
                let mut meta = store.fetch_meta().await?;
                meta.ensure_current()?;
                meta.last_fetched_at = Utc::now();
                store.upsert_fetch_meta(meta).await?;

                store.replace_partition(&partition, &defs, &source).await
            }
            Store::Redis(store) => store.put_partition(&partition, &defs).await,
        }
    }

    pub async fn get_by_pack_name(
        &self,
        family: &str,
        raw_version: &str,
        package: &str,
        arch: Option<&str>,
    ) -> Result<Vec<Definition>> {
        let partition = normalize(family, raw_version)?;
        let defs = match self {
            Store::Rdb(store) => {
                store
                    .definitions_by_package(&partition, package, scoped_arch(&partition, arch))
                    .await?
            }
            Store::Redis(store) => store.definitions_by_package(&partition, package).await?,
        };
        Ok(post_filter(&partition, Lookup::Package(package), arch, defs))
    }

    pub async fn get_by_cve_id(
        &self,
        family: &str,
        raw_version: &str,
        cve_id: &str,
        arch: Option<&str>,
    ) -> Result<Vec<Definition>> {
        let partition = normalize(family, raw_version)?;
        let defs = match self {
            Store::Rdb(store) => {
                store
                    .definitions_by_cve(&partition, cve_id, scoped_arch(&partition, arch))
                    .await?
            }
            Store::Redis(store) => store.definitions_by_cve(&partition, cve_id).await?,
        };
        Ok(post_filter(&partition, Lookup::Cve(cve_id), arch, defs))
    }

    pub async fn count_definitions(&self, family: &str, raw_version: &str) -> Result<usize> {
        let partition = normalize(family, raw_version)?;
        match self {
            Store::Rdb(store) => store.count_definitions(&partition).await,
            Store::Redis(store) => store.count_definitions(&partition).await,
        }
    }

    pub async fn get_last_modified(
        &self,
        family: &str,
        raw_version: &str,
    ) -> Result<DateTime<Utc>> {
        let partition = normalize(family, raw_version)?;
        match self {
            Store::Rdb(store) => store.last_modified(&partition).await,
            Store::Redis(store) => Ok(store.last_modified(&partition)),
        }
    }

    pub async fn get_fetch_meta(&self) -> Result<FetchMeta> {
        match self {
            Store::Rdb(store) => store.fetch_meta().await,
            Store::Redis(store) => Ok(store.fetch_meta()),
        }
    }

    /// Persist fetch metadata, re-stamped with this build's revision and schema version.
    pub async fn upsert_fetch_meta(&self, meta: FetchMeta) -> Result<FetchMeta> {
        match self {
            Store::Rdb(store) => store.upsert_fetch_meta(meta).await,
            Store::Redis(_) => {
                let mut meta = meta;
                meta.restamp();
                Ok(meta)
            }
        }
    }

    pub async fn close(&self) {
        if let Store::Rdb(store) = self {
            store.close().await;
        }
        info!(backend = self.name(), "Store closed");
    }
}

/// Architecture pushed down into the relational join, only for arch-multiplexed families.
fn scoped_arch<'a>(partition: &Partition, arch: Option<&'a str>) -> Option<&'a str> {
    requested_arch(arch).filter(|_| partition.family.filters_by_arch())
}
