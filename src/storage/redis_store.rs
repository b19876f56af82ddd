//! Key-value snapshot store on Redis
//!
//! Layout:
//! - HASH `OVAL#{family}::{version}::{CVE}`: field = definition id, value = the definition as JSON
//! - ZSET `{package name}`: member = one of the hash keys above, score 0
//!
//! Writes overwrite in place and never delete, so definitions dropped by a newer feed stay
//! reachable until the keys are removed by hand.

use chrono::{DateTime, Utc};
use redis::AsyncCommands;
use redis::aio::ConnectionManager;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::time::Duration;
use tokio::time::timeout;
use tracing::{debug, info};

use crate::config::StoreConfig;
use crate::error::{Result, StoreError};
use crate::family::Partition;
use crate::meta::{FetchMeta, stale_sentinel};
use crate::models::Definition;
use crate::query::dedupe_by_definition_id;
use crate::storage::InsertOutcome;

const KEY_PREFIX: &str = "OVAL#";
const SEPARATOR: &str = "::";
const SCAN_COUNT: usize = 1000;

/// Prefix shared by every hash key of a partition
pub fn partition_prefix(partition: &Partition) -> String {
    format!(
        "{KEY_PREFIX}{}{SEPARATOR}{}{SEPARATOR}",
        partition.family_name(),
        partition.version
    )
}

pub fn hash_key(partition: &Partition, cve_id: &str) -> String {
    format!("{}{}", partition_prefix(partition), cve_id)
}

/// Snapshot store backed by a Redis connection manager
pub struct RedisStore {
    manager: ConnectionManager,
    batch_size: usize,
}

impl RedisStore {
    pub async fn open(connection: &str, config: &StoreConfig) -> Result<Self> {
        config.validate()?;
        info!("Opening redis store");
        let client = redis::Client::open(connection)?;

        let secs = config.redis_timeout_secs;
        let manager = timeout(Duration::from_secs(secs), ConnectionManager::new(client))
            .await
            .map_err(|_| StoreError::ConnectTimeout(secs))??;

        info!(batch_size = config.batch_size, "Redis store ready");
        Ok(Self {
            manager,
            batch_size: config.batch_size,
        })
    }

    /// Write every definition of the partition, one pipeline per batch.
    ///
    /// A failing pipeline leaves the earlier batches in place.
    pub async fn put_partition(
        &self,
        partition: &Partition,
        defs: &[Definition],
    ) -> Result<InsertOutcome> {
        let mut conn = self.manager.clone();

        for (index, batch) in defs.chunks(self.batch_size).enumerate() {
            let mut pipe = redis::pipe();
            for def in batch {
                let json = serde_json::to_string(def)?;
                for cve_id in def.cve_ids() {
                    let key = hash_key(partition, cve_id);
                    pipe.hset(&key, def.key(), &json).ignore();
                    for pack in &def.affected_packs {
                        pipe.zadd(&pack.name, &key, 0).ignore();
                    }
                }
            }
            let _: () = pipe.query_async(&mut conn).await?;
            debug!(
                partition = %partition,
                batch = index,
                definitions = batch.len(),
                "Wrote batch"
            );
        }

        info!(partition = %partition, definitions = defs.len(), "Snapshot written");
        Ok(InsertOutcome::Inserted {
            definitions: defs.len(),
        })
    }

    pub async fn definitions_by_cve(
        &self,
        partition: &Partition,
        cve_id: &str,
    ) -> Result<Vec<Definition>> {
        let mut conn = self.manager.clone();
        let entries: HashMap<String, String> = conn.hgetall(hash_key(partition, cve_id)).await?;
        decode_entries(entries)
    }

    pub async fn definitions_by_package(
        &self,
        partition: &Partition,
        package: &str,
    ) -> Result<Vec<Definition>> {
        let mut conn = self.manager.clone();
        let prefix = partition_prefix(partition);

        let members: Vec<String> = conn.zrange(package, 0, -1).await?;
        let keys = partition_members(&members, &prefix);
        if keys.is_empty() {
            return Ok(Vec::new());
        }

        let mut pipe = redis::pipe();
        for key in &keys {
            pipe.hgetall(*key);
        }
        let hashes: Vec<HashMap<String, String>> = pipe.query_async(&mut conn).await?;
        package_definitions(hashes, package)
    }

    /// Distinct definition ids across the partition's hash keys
    pub async fn count_definitions(&self, partition: &Partition) -> Result<usize> {
        let mut conn = self.manager.clone();
        let pattern = format!("{}*", partition_prefix(partition));

        let mut ids = HashSet::new();
        for key in scan_keys(&mut conn, &pattern).await? {
            let fields: Vec<String> = conn.hkeys(&key).await?;
            ids.extend(fields);
        }
        Ok(ids.len())
    }

    /// This layout keeps no per-partition timestamp, so every partition reads as stale.
    pub fn last_modified(&self, _partition: &Partition) -> DateTime<Utc> {
        stale_sentinel(Utc::now())
    }

    pub fn fetch_meta(&self) -> FetchMeta {
        FetchMeta::current()
    }
}

async fn scan_keys(conn: &mut ConnectionManager, pattern: &str) -> Result<Vec<String>> {
    let mut keys = Vec::new();
    let mut cursor: u64 = 0;
    loop {
        let (next, batch): (u64, Vec<String>) = redis::cmd("SCAN")
            .cursor_arg(cursor)
            .arg("MATCH")
            .arg(pattern)
            .arg("COUNT")
            .arg(SCAN_COUNT)
            .query_async(conn)
            .await?;
        keys.extend(batch);
        if next == 0 {
            break;
        }
        cursor = next;
    }
    keys.sort();
    keys.dedup();
    Ok(keys)
}

/// Package index members that belong to the partition
fn partition_members<'a>(members: &'a [String], prefix: &str) -> Vec<&'a str> {
    members
        .iter()
        .map(String::as_str)
        .filter(|m| m.starts_with(prefix))
        .collect()
}

/// Decode the hashes a package index points at, keeping definitions that name the package.
///
/// A definition listing several CVEs is stored under each of them and comes back once.
fn package_definitions(
    hashes: Vec<HashMap<String, String>>,
    package: &str,
) -> Result<Vec<Definition>> {
    let mut defs = Vec::new();
    for entries in hashes {
        defs.extend(
            decode_entries(entries)?
                .into_iter()
                .filter(|def| def.affects(package)),
        );
    }
    Ok(dedupe_by_definition_id(defs))
}

/// Decode hash values, ordered by field for a stable result.
fn decode_entries(entries: HashMap<String, String>) -> Result<Vec<Definition>> {
    entries
        .into_iter()
        .collect::<BTreeMap<_, _>>()
        .into_values()
        .map(|json| serde_json::from_str(&json).map_err(StoreError::from))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::family::normalize;
    use crate::meta::SourceFile;
    use crate::models::{Advisory, Cve, Package};
    use crate::storage::{BackendKind, Store};

    #[test]
    fn test_key_layout() {
        let partition = normalize("ubuntu", "16.04.3").unwrap();
        assert_eq!(partition_prefix(&partition), "OVAL#ubuntu::16.04::");
        assert_eq!(
            hash_key(&partition, "CVE-2016-5195"),
            "OVAL#ubuntu::16.04::CVE-2016-5195"
        );

        // a shorter version must not be a prefix match for a longer one
        let short = normalize("alpine", "3.1").unwrap();
        let long = normalize("alpine", "3.15").unwrap();
        assert!(!hash_key(&long, "CVE-1").starts_with(&partition_prefix(&short)));
    }

    #[test]
    fn test_decode_entries_sorted_by_field() {
        let mut entries = HashMap::new();
        for id in ["b", "a", "c"] {
            let def = Definition {
                definition_id: id.to_string(),
                ..Default::default()
            };
            entries.insert(id.to_string(), serde_json::to_string(&def).unwrap());
        }
        let defs = decode_entries(entries).unwrap();
        let ids: Vec<&str> = defs.iter().map(|d| d.definition_id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b", "c"]);
    }

    #[test]
    fn test_decode_entries_invalid_json() {
        let entries = HashMap::from([("a".to_string(), "{not json".to_string())]);
        assert!(matches!(
            decode_entries(entries),
            Err(StoreError::Serialization(_))
        ));
    }

    fn stored(id: &str, cves: &[&str], packages: &[&str]) -> Definition {
        Definition {
            definition_id: id.to_string(),
            advisory: Advisory {
                cves: cves
                    .iter()
                    .map(|c| Cve {
                        cve_id: c.to_string(),
                        ..Default::default()
                    })
                    .collect(),
                ..Default::default()
            },
            affected_packs: packages
                .iter()
                .map(|p| Package {
                    name: p.to_string(),
                    version: "1.0".to_string(),
                    ..Default::default()
                })
                .collect(),
            ..Default::default()
        }
    }

    fn hash_of(defs: &[Definition]) -> HashMap<String, String> {
        defs.iter()
            .map(|d| (d.key().to_string(), serde_json::to_string(d).unwrap()))
            .collect()
    }

    #[test]
    fn test_partition_members_filters_other_partitions() {
        let v3_1 = normalize("alpine", "3.1").unwrap();
        let v3_15 = normalize("alpine", "3.15").unwrap();
        let members = vec![
            hash_key(&v3_1, "CVE-2014-0001"),
            hash_key(&v3_15, "CVE-2022-0001"),
            hash_key(&normalize("debian", "11").unwrap(), "CVE-2022-0001"),
            hash_key(&v3_1, "CVE-2015-0002"),
        ];

        let keys = partition_members(&members, &partition_prefix(&v3_1));
        assert_eq!(
            keys,
            vec!["OVAL#alpine::3.1::CVE-2014-0001", "OVAL#alpine::3.1::CVE-2015-0002"]
        );
        let v3_2 = normalize("alpine", "3.2").unwrap();
        assert!(partition_members(&members, &partition_prefix(&v3_2)).is_empty());
    }

    #[test]
    fn test_package_definitions_drops_other_packages_and_duplicates() {
        let shared = stored("DSA-1", &["CVE-1", "CVE-2"], &["openssl"]);
        let other = stored("DSA-2", &["CVE-1"], &["libssl-dev"]);
        let hashes = vec![
            hash_of(&[shared.clone(), other]),
            hash_of(std::slice::from_ref(&shared)),
        ];

        let defs = package_definitions(hashes, "openssl").unwrap();
        assert_eq!(defs, vec![shared]);
        assert!(package_definitions(Vec::new(), "openssl").unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_open_rejects_invalid_config() {
        let config = StoreConfig {
            batch_size: 0,
            ..Default::default()
        };
        let result = RedisStore::open("redis://127.0.0.1:1/0", &config).await;
        assert!(matches!(result, Err(StoreError::InvalidConfig(_))));
    }

    /// Needs a Redis server on `REDIS_URL` (default redis://127.0.0.1:6379/15).
    #[tokio::test]
    #[ignore]
    async fn test_redis_round_trip() {
        let url = std::env::var("REDIS_URL")
            .unwrap_or_else(|_| "redis://127.0.0.1:6379/15".to_string());
        let store = Store::open(BackendKind::Redis, &url, StoreConfig::default())
            .await
            .expect("Failed to connect to redis");

        let def = Definition {
            definition_id: "oval:org.debian:def:1".to_string(),
            title: "CVE-2099-0001".to_string(),
            advisory: Advisory {
                cves: vec![Cve {
                    cve_id: "CVE-2099-0001".to_string(),
                    ..Default::default()
                }],
                ..Default::default()
            },
            affected_packs: vec![Package {
                name: "roundtrip-test-pkg".to_string(),
                version: "1.0-1".to_string(),
                ..Default::default()
            }],
            ..Default::default()
        };

        store
            .insert_snapshot(
                "debian",
                "12.1",
                vec![def.clone()],
                SourceFile::new("test.json", Utc::now()),
            )
            .await
            .unwrap();

        let by_pack = store
            .get_by_pack_name("debian", "12", "roundtrip-test-pkg", None)
            .await
            .unwrap();
        assert_eq!(by_pack, vec![def.clone()]);

        let by_cve = store
            .get_by_cve_id("debian", "12", "CVE-2099-0001", None)
            .await
            .unwrap();
        assert_eq!(by_cve, vec![def]);

        assert!(store.count_definitions("debian", "12").await.unwrap() >= 1);
    }
}
