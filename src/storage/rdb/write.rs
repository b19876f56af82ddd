//! Partition replacement and metadata writes

use chrono::{DateTime, Utc};
use sqlx::{AnyConnection, Row};
use tracing::debug;

use super::dialect::{Dialect, Value, bind_values, value_groups};
use crate::error::{Result, StoreError};
use crate::family::Partition;
use crate::meta::{FetchMeta, SourceFile, format_timestamp, parse_timestamp};
use crate::models::Definition;

/// Stored entities of one partition, in the order they have to be deleted
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Entity {
    Cve,
    Bugzilla,
    Cpe,
    Advisory,
    Package,
    Reference,
    Debian,
    Definition,
    Root,
}

const DEFINITIONS_OF_ROOT: &str = "SELECT id FROM definitions WHERE root_id = ?";

impl Entity {
    pub const DELETE_ORDER: [Entity; 9] = [
        Entity::Cve,
        Entity::Bugzilla,
        Entity::Cpe,
        Entity::Advisory,
        Entity::Package,
        Entity::Reference,
        Entity::Debian,
        Entity::Definition,
        Entity::Root,
    ];

    pub fn table(self) -> &'static str {
        match self {
            Entity::Cve => "cves",
            Entity::Bugzilla => "bugzillas",
            Entity::Cpe => "cpes",
            Entity::Advisory => "advisories",
            Entity::Package => "packages",
            Entity::Reference => "definition_references",
            Entity::Debian => "debians",
            Entity::Definition => "definitions",
            Entity::Root => "roots",
        }
    }

    /// DELETE statement removing this entity's rows under one root; binds the root id once.
    fn delete_under_root(self) -> String {
        let filter = match self {
            Entity::Cve | Entity::Bugzilla | Entity::Cpe => format!(
                "advisory_id IN (SELECT id FROM advisories WHERE def_id IN ({DEFINITIONS_OF_ROOT}))"
            ),
            Entity::Advisory | Entity::Package | Entity::Reference | Entity::Debian => {
                format!("def_id IN ({DEFINITIONS_OF_ROOT})")
            }
            Entity::Definition => "root_id = ?".to_string(),
            Entity::Root => "id = ?".to_string(),
        };
        format!("DELETE FROM {} WHERE {}", self.table(), filter)
    }
}

/// Rows of one child table collected for a multi-row insert
struct PendingRows {
    table: &'static str,
    columns: &'static [&'static str],
    values: Vec<Value>,
}

impl PendingRows {
    fn new(table: &'static str, columns: &'static [&'static str]) -> Self {
        Self {
            table,
            columns,
            values: Vec::new(),
        }
    }

    fn push(&mut self, row: Vec<Value>) {
        debug_assert_eq!(row.len(), self.columns.len());
        self.values.extend(row);
    }

    fn row_count(&self) -> usize {
        self.values.len() / self.columns.len()
    }

    /// Write every pending row, splitting statements to stay under the bind-parameter ceiling.
    async fn flush(&mut self, conn: &mut AnyConnection, dialect: Dialect) -> Result<()> {
        let width = self.columns.len();
        let rows_per_statement = (dialect.max_bind_params() / width).max(1);

        for chunk in self.values.chunks(rows_per_statement * width) {
            let sql = dialect.rebind(&format!(
                "INSERT INTO {} ({}) VALUES {}",
                self.table,
                self.columns.join(", "),
                value_groups(width, chunk.len() / width)
            ));
            bind_values(sqlx::query(&sql), chunk)
                .execute(&mut *conn)
                .await?;
        }

        debug!(table = self.table, rows = self.row_count(), "Inserted rows");
        self.values.clear();
        Ok(())
    }
}

/// Insert one row and return its generated id.
async fn insert_returning_id(
    conn: &mut AnyConnection,
    dialect: Dialect,
    table: &'static str,
    columns: &[&str],
    values: &[Value],
) -> Result<i64> {
    let mut sql = format!(
        "INSERT INTO {} ({}) VALUES {}",
        table,
        columns.join(", "),
        value_groups(columns.len(), 1)
    );

    if dialect.returns_generated_id() {
        sql.push_str(" RETURNING id");
        let row = bind_values(sqlx::query(&dialect.rebind(&sql)), values)
            .fetch_one(&mut *conn)
            .await?;
        return Ok(row.try_get::<i64, _>(0)?);
    }

    let result = bind_values(sqlx::query(&dialect.rebind(&sql)), values)
        .execute(&mut *conn)
        .await?;
    result
        .last_insert_id()
        .ok_or(StoreError::MissingGeneratedId(table))
}

/// Insert several rows and return their generated ids in row order.
async fn insert_returning_ids(
    conn: &mut AnyConnection,
    dialect: Dialect,
    table: &'static str,
    columns: &[&str],
    values: &[Value],
) -> Result<Vec<i64>> {
    let width = columns.len();
    let mut ids = Vec::with_capacity(values.len() / width);

    if !dialect.returns_generated_id() {
        for row in values.chunks(width) {
            ids.push(insert_returning_id(conn, dialect, table, columns, row).await?);
        }
        return Ok(ids);
    }

    let rows_per_statement = (dialect.max_bind_params() / width).max(1);
    for chunk in values.chunks(rows_per_statement * width) {
        let rows = chunk.len() / width;
        let sql = dialect.rebind(&format!(
            "INSERT INTO {} ({}) VALUES {} RETURNING id",
            table,
            columns.join(", "),
            value_groups(width, rows)
        ));
        let returned = bind_values(sqlx::query(&sql), chunk)
            .fetch_all(&mut *conn)
            .await?;

        let mut chunk_ids = Vec::with_capacity(rows);
        for row in &returned {
            chunk_ids.push(row.try_get::<i64, _>(0)?);
        }
        if chunk_ids.len() != rows {
            return Err(StoreError::MissingGeneratedId(table));
        }
        // RETURNING yields rows in no particular order; ids grow in VALUES order
        chunk_ids.sort_unstable();
        ids.extend(chunk_ids);
    }

    debug!(table, rows = ids.len(), "Inserted rows");
    Ok(ids)
}

/// True when this exact source file was already ingested into the partition.
pub async fn source_unchanged(
    conn: &mut AnyConnection,
    dialect: Dialect,
    partition: &Partition,
    source: &SourceFile,
) -> Result<bool> {
    let stored: Option<String> = sqlx::query_scalar(&dialect.rebind(
        "SELECT file_timestamp FROM file_meta \
         WHERE family = ? AND os_version = ? AND file_name = ? ORDER BY id DESC LIMIT 1",
    ))
    .bind(partition.family_name())
    .bind(partition.version.as_str())
    .bind(source.name.as_str())
    .fetch_optional(&mut *conn)
    .await?;

    match stored {
        Some(ts) => Ok(parse_timestamp(&ts)? == source.timestamp),
        None => Ok(false),
    }
}

pub async fn upsert_file_meta(
    conn: &mut AnyConnection,
    dialect: Dialect,
    partition: &Partition,
    source: &SourceFile,
) -> Result<()> {
    let timestamp = format_timestamp(&source.timestamp);
    let updated = sqlx::query(&dialect.rebind(
        "UPDATE file_meta SET file_timestamp = ? \
         WHERE family = ? AND os_version = ? AND file_name = ?",
    ))
    .bind(timestamp.as_str())
    .bind(partition.family_name())
    .bind(partition.version.as_str())
    .bind(source.name.as_str())
    .execute(&mut *conn)
    .await?;

    if updated.rows_affected() == 0 {
        sqlx::query(&dialect.rebind(
            "INSERT INTO file_meta (family, os_version, file_name, file_timestamp) \
             VALUES (?, ?, ?, ?)",
        ))
        .bind(partition.family_name())
        .bind(partition.version.as_str())
        .bind(source.name.as_str())
        .bind(timestamp.as_str())
        .execute(&mut *conn)
        .await?;
    }
    Ok(())
}

/// Root ids currently stored for a partition
pub async fn root_ids(
    conn: &mut AnyConnection,
    dialect: Dialect,
    partition: &Partition,
) -> Result<Vec<i64>> {
    let ids = sqlx::query_scalar(&dialect.rebind(
        "SELECT id FROM roots WHERE family = ? AND os_version = ? ORDER BY id",
    ))
    .bind(partition.family_name())
    .bind(partition.version.as_str())
    .fetch_all(&mut *conn)
    .await?;
    Ok(ids)
}

/// Delete a root and everything below it, children first.
pub async fn delete_subtree(
    conn: &mut AnyConnection,
    dialect: Dialect,
    root_id: i64,
) -> Result<()> {
    for entity in Entity::DELETE_ORDER {
        let result = sqlx::query(&dialect.rebind(&entity.delete_under_root()))
            .bind(root_id)
            .execute(&mut *conn)
            .await?;
        debug!(
            table = entity.table(),
            root_id,
            rows = result.rows_affected(),
            "Deleted rows"
        );
    }
    Ok(())
}

pub async fn insert_root(
    conn: &mut AnyConnection,
    dialect: Dialect,
    partition: &Partition,
    fetched_at: DateTime<Utc>,
) -> Result<i64> {
    insert_returning_id(
        conn,
        dialect,
        "roots",
        &["family", "os_version", "fetched_at"],
        &[
            partition.family_name().into(),
            partition.version.as_str().into(),
            format_timestamp(&fetched_at).into(),
        ],
    )
    .await
}

/// Insert one batch of definitions under a root.
pub async fn insert_definitions(
    conn: &mut AnyConnection,
    dialect: Dialect,
    root_id: i64,
    defs: &[Definition],
) -> Result<()> {
    let mut packages = PendingRows::new(
        "packages",
        &["def_id", "name", "version", "arch", "not_fixed_yet", "modularity_label"],
    );
    let mut references = PendingRows::new(
        "definition_references",
        &["def_id", "source", "ref_id", "ref_url"],
    );
    let mut debians = PendingRows::new("debians", &["def_id", "cve_id", "more_info"]);
    let mut cves = PendingRows::new(
        "cves",
        &[
            "advisory_id",
            "cve_id",
            "cvss2",
            "cvss3",
            "cwe",
            "impact",
            "href",
            "public_date",
        ],
    );
    let mut bugzillas = PendingRows::new(
        "bugzillas",
        &["advisory_id", "bugzilla_id", "url", "title"],
    );
    let mut cpes = PendingRows::new("cpes", &["advisory_id", "cpe"]);

    let definition_rows: Vec<Value> = defs
        .iter()
        .flat_map(|def| {
            [
                Value::from(root_id),
                def.definition_id.as_str().into(),
                def.title.as_str().into(),
                def.description.as_str().into(),
            ]
        })
        .collect();
    let def_ids = insert_returning_ids(
        conn,
        dialect,
        "definitions",
        &["root_id", "definition_id", "title", "description"],
        &definition_rows,
    )
    .await?;

    let advisory_rows: Vec<Value> = defs
        .iter()
        .zip(&def_ids)
        .flat_map(|(def, def_id)| {
            [
                Value::from(*def_id),
                def.advisory.severity.as_str().into(),
                format_timestamp(&def.advisory.issued).into(),
                format_timestamp(&def.advisory.updated).into(),
            ]
        })
        .collect();
    let advisory_ids = insert_returning_ids(
        conn,
        dialect,
        "advisories",
        &["def_id", "severity", "issued", "updated"],
        &advisory_rows,
    )
    .await?;

    for ((def, def_id), advisory_id) in defs.iter().zip(def_ids).zip(advisory_ids) {
        let advisory = &def.advisory;
        for p in &def.affected_packs {
            packages.push(vec![
                def_id.into(),
                p.name.as_str().into(),
                p.version.as_str().into(),
                p.arch.as_str().into(),
                p.not_fixed_yet.into(),
                p.modularity_label.as_str().into(),
            ]);
        }
        for r in &def.references {
            references.push(vec![
                def_id.into(),
                r.source.as_str().into(),
                r.ref_id.as_str().into(),
                r.ref_url.as_str().into(),
            ]);
        }
        if let Some(debian) = &def.debian {
            debians.push(vec![
                def_id.into(),
                debian.cve_id.as_str().into(),
                debian.more_info.as_str().into(),
            ]);
        }
        for c in &advisory.cves {
            cves.push(vec![
                advisory_id.into(),
                c.cve_id.as_str().into(),
                c.cvss2.as_str().into(),
                c.cvss3.as_str().into(),
                c.cwe.as_str().into(),
                c.impact.as_str().into(),
                c.href.as_str().into(),
                c.public.as_str().into(),
            ]);
        }
        for b in &advisory.bugzillas {
            bugzillas.push(vec![
                advisory_id.into(),
                b.bugzilla_id.as_str().into(),
                b.url.as_str().into(),
                b.title.as_str().into(),
            ]);
        }
        for cpe in &advisory.affected_cpe_list {
            cpes.push(vec![advisory_id.into(), cpe.cpe.as_str().into()]);
        }
    }

    for rows in [
        &mut packages,
        &mut references,
        &mut debians,
        &mut cves,
        &mut bugzillas,
        &mut cpes,
    ] {
        rows.flush(conn, dialect).await?;
    }
    Ok(())
}

pub async fn select_fetch_meta(
    conn: &mut AnyConnection,
    dialect: Dialect,
) -> Result<Option<FetchMeta>> {
    let row = sqlx::query(&dialect.rebind(
        "SELECT revision, schema_version, last_fetched_at FROM fetch_meta ORDER BY id LIMIT 1",
    ))
    .fetch_optional(&mut *conn)
    .await?;

    let Some(row) = row else {
        return Ok(None);
    };
    let schema_version: i64 = row.try_get("schema_version")?;
    let last_fetched_at: String = row.try_get("last_fetched_at")?;
    Ok(Some(FetchMeta {
        revision: row.try_get("revision")?,
        schema_version: u32::try_from(schema_version).unwrap_or(0),
        last_fetched_at: parse_timestamp(&last_fetched_at)?,
    }))
}

pub async fn upsert_fetch_meta(
    conn: &mut AnyConnection,
    dialect: Dialect,
    meta: &FetchMeta,
) -> Result<()> {
    let values = [
        Value::from(meta.revision.as_str()),
        Value::from(i64::from(meta.schema_version)),
        Value::from(format_timestamp(&meta.last_fetched_at)),
    ];

    let existing: Option<i64> =
        sqlx::query_scalar(&dialect.rebind("SELECT id FROM fetch_meta ORDER BY id LIMIT 1"))
            .fetch_optional(&mut *conn)
            .await?;

    match existing {
        Some(id) => {
            let sql = dialect.rebind(
                "UPDATE fetch_meta SET revision = ?, schema_version = ?, last_fetched_at = ? \
                 WHERE id = ?",
            );
            let mut values = values.to_vec();
            values.push(Value::Int(id));
            bind_values(sqlx::query(&sql), &values)
                .execute(&mut *conn)
                .await?;
        }
        None => {
            insert_returning_id(
                conn,
                dialect,
                "fetch_meta",
                &["revision", "schema_version", "last_fetched_at"],
                &values,
            )
            .await?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::super::RdbStore;
    use super::*;
    use crate::config::StoreConfig;
    use crate::family::normalize;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_batched_ids_follow_row_order() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("ids.sqlite3");
        let store = RdbStore::open(Dialect::Sqlite, path.to_str().unwrap(), &StoreConfig::default())
            .await
            .unwrap();
        let mut conn = store.pool.acquire().await.unwrap();
        let partition = normalize("debian", "12").unwrap();
        let root_id = insert_root(&mut conn, Dialect::Sqlite, &partition, Utc::now())
            .await
            .unwrap();

        // wide enough to need three statements under the SQLite bind ceiling
        let rows: Vec<Value> = (0..600)
            .flat_map(|i| {
                [
                    Value::from(root_id),
                    Value::from(format!("DSA-{i:04}")),
                    Value::from(""),
                    Value::from(""),
                ]
            })
            .collect();
        let ids = insert_returning_ids(
            &mut conn,
            Dialect::Sqlite,
            "definitions",
            &["root_id", "definition_id", "title", "description"],
            &rows,
        )
        .await
        .unwrap();
        assert_eq!(ids.len(), 600);

        for (i, id) in ids.iter().enumerate() {
            let stored: String =
                sqlx::query_scalar("SELECT definition_id FROM definitions WHERE id = ?")
                    .bind(*id)
                    .fetch_one(&mut *conn)
                    .await
                    .unwrap();
            assert_eq!(stored, format!("DSA-{i:04}"));
        }
    }

    #[test]
    fn test_delete_order_children_first() {
        let position = |e: Entity| Entity::DELETE_ORDER.iter().position(|x| *x == e).unwrap();
        assert!(position(Entity::Cve) < position(Entity::Advisory));
        assert!(position(Entity::Advisory) < position(Entity::Definition));
        assert!(position(Entity::Package) < position(Entity::Definition));
        assert!(position(Entity::Definition) < position(Entity::Root));
    }

    #[test]
    fn test_delete_under_root_binds_root_once() {
        for entity in Entity::DELETE_ORDER {
            let sql = entity.delete_under_root();
            assert_eq!(sql.matches('?').count(), 1, "{sql}");
            assert!(sql.starts_with(&format!("DELETE FROM {} ", entity.table())));
        }
        assert_eq!(
            Entity::Cve.delete_under_root(),
            "DELETE FROM cves WHERE advisory_id IN (SELECT id FROM advisories WHERE def_id IN \
             (SELECT id FROM definitions WHERE root_id = ?))"
        );
    }
}
