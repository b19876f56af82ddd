//! Subcommand handlers for the CLI

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;
use tracing::info;

use crate::config::{Command, Config, SelectBy};
use crate::meta::{SourceFile, format_timestamp};
use crate::models::Definition;
use crate::server;
use crate::storage::Store;

/// A normalized vendor snapshot as written by a fetcher
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotFile {
    pub family: String,
    pub os_version: String,
    /// When the vendor published the source feed
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub definitions: Vec<Definition>,
}

impl SnapshotFile {
    pub async fn load(path: &Path) -> Result<Self> {
        let raw = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("Failed to read {}", path.display()))?;
        serde_json::from_str(&raw).with_context(|| format!("Failed to parse {}", path.display()))
    }

    /// Source identity: file name plus feed timestamp
    pub fn source(&self, path: &Path) -> SourceFile {
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| path.display().to_string());
        SourceFile::new(name, self.timestamp)
    }
}

/// Run the configured subcommand against a freshly opened store.
pub async fn run(config: Config) -> Result<()> {
    let kind = config.db_type;
    let store = Store::open(kind, &config.db_path, config.store_config())
        .await
        .with_context(|| format!("Failed to open {kind} database"))?;

    if let Command::Server = config.command {
        return server::run(&config, Arc::new(store)).await;
    }

    let result = run_command(&config.command, &store).await;
    store.close().await;
    result
}

async fn run_command(command: &Command, store: &Store) -> Result<()> {
    match command {
        Command::Import { file } => import(store, file).await,
        Command::Select { by } => {
            let defs = match by {
                SelectBy::Package {
                    family,
                    release,
                    package,
                    arch,
                } => {
                    store
                        .get_by_pack_name(family, release, package, arch.as_deref())
                        .await?
                }
                SelectBy::Cve {
                    family,
                    release,
                    cve_id,
                    arch,
                } => {
                    store
                        .get_by_cve_id(family, release, cve_id, arch.as_deref())
                        .await?
                }
            };
            print_json(&defs)
        }
        Command::Count { family, release } => {
            let count = store.count_definitions(family, release).await?;
            print_json(&serde_json::json!({ "count": count }))
        }
        Command::LastModified { family, release } => {
            let ts = store.get_last_modified(family, release).await?;
            print_json(&serde_json::json!({ "last_modified": format_timestamp(&ts) }))
        }
        Command::Server | Command::Version => Ok(()),
    }
}

async fn import(store: &Store, file: &Path) -> Result<()> {
    let snapshot = SnapshotFile::load(file).await?;
    let source = snapshot.source(file);

    let meta = store.get_fetch_meta().await?;
    info!(
        revision = %meta.revision,
        schema_version = meta.schema_version,
        last_fetched_at = %format_timestamp(&meta.last_fetched_at),
        "Fetch metadata"
    );

    let outcome = store
        .insert_snapshot(
            &snapshot.family,
            &snapshot.os_version,
            snapshot.definitions,
            source,
        )
        .await
        .with_context(|| {
            format!(
                "Failed to insert {} {} from {}",
                snapshot.family,
                snapshot.os_version,
                file.display()
            )
        })?;
    print_json(&outcome)
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[tokio::test]
    async fn test_snapshot_file_load() {
        let mut file = NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{
                "family": "redhat",
                "os_version": "8",
                "timestamp": "2024-02-01T00:00:00Z",
                "definitions": [{{"definition_id": "oval:com.redhat.rhsa:def:20240001"}}]
            }}"#
        )
        .unwrap();

        let snapshot = SnapshotFile::load(file.path()).await.unwrap();
        assert_eq!(snapshot.family, "redhat");
        assert_eq!(snapshot.definitions.len(), 1);

        let source = snapshot.source(file.path());
        assert_eq!(
            source.name,
            file.path().file_name().unwrap().to_string_lossy()
        );
        assert_eq!(format_timestamp(&source.timestamp), "2024-02-01T00:00:00Z");
    }

    #[tokio::test]
    async fn test_snapshot_file_load_invalid() {
        let mut file = NamedTempFile::new().unwrap();
        write!(file, "{{\"family\": \"debian\"}}").unwrap();
        let err = SnapshotFile::load(file.path()).await.unwrap_err();
        assert!(err.to_string().contains("Failed to parse"));
    }

    #[tokio::test]
    async fn test_import_same_file_name_for_two_releases() {
        let dir = tempfile::TempDir::new().unwrap();
        let store = Store::open(
            crate::storage::BackendKind::Sqlite3,
            dir.path().join("oval.sqlite3").to_str().unwrap(),
            crate::config::StoreConfig::default(),
        )
        .await
        .unwrap();

        for release in ["3.16", "3.17"] {
            let feed_dir = dir.path().join(format!("v{release}"));
            std::fs::create_dir_all(&feed_dir).unwrap();
            let path = feed_dir.join("main.json");
            std::fs::write(
                &path,
                format!(
                    r#"{{
                        "family": "alpine",
                        "os_version": "{release}",
                        "timestamp": "2024-03-01T00:00:00Z",
                        "definitions": [{{
                            "definition_id": "CVE-2024-0001",
                            "affected_packs": [{{"name": "openssl", "version": "3.0.13-r0"}}]
                        }}]
                    }}"#
                ),
            )
            .unwrap();
            import(&store, &path).await.unwrap();
        }

        assert_eq!(store.count_definitions("alpine", "3.16").await.unwrap(), 1);
        assert_eq!(store.count_definitions("alpine", "3.17").await.unwrap(), 1);
    }
}
