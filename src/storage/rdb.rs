//! Relational snapshot store (SQLite, MySQL, PostgreSQL)
//!
//! # Module Structure
//! - `dialect`: placeholder, DDL and generated-id differences between databases
//! - `schema`: table layout and the legacy-schema gate
//! - `write`: partition replacement and metadata upserts
//! - `read`: paged definition lookups

mod dialect;
mod read;
mod schema;
mod write;

use chrono::{DateTime, Utc};
use sqlx::any::{AnyConnectOptions, AnyPoolOptions};
use sqlx::{Any, AnyConnection, AnyPool, ConnectOptions, Executor, Transaction};
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;
use tracing::{debug, info, warn};

pub use dialect::Dialect;
use read::Match;

use crate::config::StoreConfig;
use crate::error::{Result, StoreError};
use crate::family::Partition;
use crate::meta::{FetchMeta, SourceFile, parse_timestamp, stale_sentinel};
use crate::models::Definition;
use crate::storage::InsertOutcome;

/// Snapshot store backed by a sqlx connection pool
pub struct RdbStore {
    pool: AnyPool,
    dialect: Dialect,
    batch_size: usize,
    /// Fail the ingestion right after this batch has been written
    #[cfg(test)]
    fail_on_batch: Option<usize>,
}

impl RdbStore {
    pub async fn open(dialect: Dialect, connection: &str, config: &StoreConfig) -> Result<Self> {
        config.validate()?;
        sqlx::any::install_default_drivers();
        info!(dialect = %dialect, "Opening relational store");

        let in_memory = dialect.is_in_memory(connection);
        if dialect == Dialect::Sqlite && !in_memory {
            prepare_sqlite_path(connection)?;
        }

        let mut options = AnyConnectOptions::from_str(&dialect.connection_url(connection))?;
        if !config.debug_sql {
            options = options.disable_statement_logging();
        }

        let mut pool_options = AnyPoolOptions::new().max_connections(config.max_connections);
        if in_memory {
            // every connection would open its own empty database
            pool_options = pool_options
                .max_connections(1)
                .min_connections(1)
                .idle_timeout(None::<Duration>)
                .max_lifetime(None::<Duration>);
        }
        if dialect == Dialect::Sqlite {
            pool_options = pool_options.after_connect(|conn, _meta| {
                Box::pin(async move {
                    conn.execute("PRAGMA foreign_keys = ON").await?;
                    Ok(())
                })
            });
        }
        let pool = pool_options.connect_with(options).await?;

        schema::ensure_compatible(&pool, dialect).await?;
        schema::init_schema(&pool, dialect).await?;

        info!(
            dialect = %dialect,
            batch_size = config.batch_size,
            max_connections = config.max_connections,
            "Relational store ready"
        );

        Ok(Self {
            pool,
            dialect,
            batch_size: config.batch_size,
            #[cfg(test)]
            fail_on_batch: None,
        })
    }

    pub fn dialect(&self) -> Dialect {
        self.dialect
    }

    /// Replace everything stored for `partition` with `defs` in one transaction.
    pub async fn replace_partition(
        &self,
        partition: &Partition,
        defs: &[Definition],
        source: &SourceFile,
    ) -> Result<InsertOutcome> {
        let mut tx = self.begin_write().await?;

        match self.write_snapshot(&mut tx, partition, defs, source).await {
            Ok(InsertOutcome::Skipped) => {
                tx.rollback().await?;
                info!(
                    partition = %partition,
                    file = %source.name,
                    "Source file unchanged, skipping"
                );
                Ok(InsertOutcome::Skipped)
            }
            Ok(outcome) => {
                tx.commit().await?;
                info!(
                    partition = %partition,
                    definitions = defs.len(),
                    file = %source.name,
                    "Snapshot replaced"
                );
                Ok(outcome)
            }
            Err(e) => {
                warn!(partition = %partition, error = %e, "Snapshot failed, rolling back");
                if let Err(rollback) = tx.rollback().await {
                    warn!(error = %rollback, "Rollback failed");
                }
                Err(e)
            }
        }
    }

    async fn write_snapshot(
        &self,
        conn: &mut AnyConnection,
        partition: &Partition,
        defs: &[Definition],
        source: &SourceFile,
    ) -> Result<InsertOutcome> {
        let dialect = self.dialect;

        if write::source_unchanged(conn, dialect, partition, source).await? {
            return Ok(InsertOutcome::Skipped);
        }
        write::upsert_file_meta(conn, dialect, partition, source).await?;

        for root_id in write::root_ids(conn, dialect, partition).await? {
            info!(partition = %partition, root_id, "Deleting previous snapshot");
            write::delete_subtree(conn, dialect, root_id).await?;
        }

        let root_id = write::insert_root(conn, dialect, partition, Utc::now()).await?;

        for (index, batch) in defs.chunks(self.batch_size).enumerate() {
            write::insert_definitions(conn, dialect, root_id, batch).await?;
            debug!(
                partition = %partition,
                batch = index,
                definitions = batch.len(),
                "Inserted batch"
            );
            self.injected_failure(index)?;
        }

        Ok(InsertOutcome::Inserted {
            definitions: defs.len(),
        })
    }

    #[cfg(test)]
    fn injected_failure(&self, batch: usize) -> Result<()> {
        if self.fail_on_batch == Some(batch) {
            return Err(StoreError::Database(sqlx::Error::Protocol(format!(
                "injected failure after batch {batch}"
            ))));
        }
        Ok(())
    }

    #[cfg(not(test))]
    fn injected_failure(&self, _batch: usize) -> Result<()> {
        Ok(())
    }

    pub async fn definitions_by_package(
        &self,
        partition: &Partition,
        package: &str,
        arch: Option<&str>,
    ) -> Result<Vec<Definition>> {
        self.read(
            partition,
            Match::Package {
                name: package,
                arch,
            },
            arch,
        )
        .await
    }

    pub async fn definitions_by_cve(
        &self,
        partition: &Partition,
        cve_id: &str,
        arch: Option<&str>,
    ) -> Result<Vec<Definition>> {
        self.read(partition, Match::Cve { cve_id }, arch).await
    }

    async fn read(
        &self,
        partition: &Partition,
        filter: Match<'_>,
        package_arch: Option<&str>,
    ) -> Result<Vec<Definition>> {
        let mut tx = self.pool.begin().await?;
        if let Some(statement) = self.dialect.snapshot_isolation() {
            sqlx::query(statement).execute(&mut *tx).await?;
        }
        let defs = read::definitions(&mut tx, self.dialect, partition, filter, package_arch).await?;
        tx.commit().await?;
        Ok(defs)
    }

    pub async fn count_definitions(&self, partition: &Partition) -> Result<usize> {
        let count: i64 = sqlx::query_scalar(&self.dialect.rebind(
            "SELECT COUNT(*) FROM definitions d JOIN roots r ON r.id = d.root_id \
             WHERE r.family = ? AND r.os_version = ?",
        ))
        .bind(partition.family_name())
        .bind(partition.version.as_str())
        .fetch_one(&self.pool)
        .await?;
        Ok(usize::try_from(count).unwrap_or_default())
    }

    /// When the partition was last replaced, or a century ago if it never was.
    pub async fn last_modified(&self, partition: &Partition) -> Result<DateTime<Utc>> {
        let fetched_at: Option<String> = sqlx::query_scalar(&self.dialect.rebind(
            "SELECT fetched_at FROM roots WHERE family = ? AND os_version = ? \
             ORDER BY id DESC LIMIT 1",
        ))
        .bind(partition.family_name())
        .bind(partition.version.as_str())
        .fetch_optional(&self.pool)
        .await?;

        match fetched_at {
            Some(ts) => parse_timestamp(&ts),
            None => Ok(stale_sentinel(Utc::now())),
        }
    }

    pub async fn fetch_meta(&self) -> Result<FetchMeta> {
        let mut conn = self.pool.acquire().await?;
        Ok(write::select_fetch_meta(&mut conn, self.dialect)
            .await?
            .unwrap_or_else(FetchMeta::current))
    }

    /// Store `meta` stamped with this build's revision and schema version.
    pub async fn upsert_fetch_meta(&self, mut meta: FetchMeta) -> Result<FetchMeta> {
        meta.restamp();
        let mut tx = self.begin_write().await?;
        write::upsert_fetch_meta(&mut tx, self.dialect, &meta).await?;
        tx.commit().await?;
        Ok(meta)
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }

    async fn begin_write(&self) -> Result<Transaction<'static, Any>> {
        let tx = match self.dialect.begin_write() {
            Some(statement) => self.pool.begin_with(statement).await?,
            None => self.pool.begin().await?,
        };
        Ok(tx)
    }
}

/// Create the parent directory of a bare SQLite path.
fn prepare_sqlite_path(connection: &str) -> Result<()> {
    if connection.starts_with("sqlite:") {
        return Ok(());
    }
    let path = Path::new(connection);
    if path.exists() {
        info!(path = %connection, "Found existing database file");
    } else {
        info!(path = %connection, "Creating new database file");
    }
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
        && !parent.exists()
    {
        info!(directory = %parent.display(), "Creating database directory");
        std::fs::create_dir_all(parent).map_err(|e| {
            StoreError::InvalidConfig(format!(
                "failed to create database directory {}: {e}",
                parent.display()
            ))
        })?;
    }
    Ok(())
}
