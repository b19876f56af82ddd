//! Table layout and the legacy-schema gate

use sqlx::AnyPool;
use tracing::{debug, info};

use super::dialect::Dialect;
use crate::error::{Result, StoreError};

#[derive(Debug, Clone, Copy)]
enum ColumnType {
    Integer,
    KeyText,
    Text,
    LongText,
    /// Foreign key onto another table's `id`
    Ref(&'static str),
}

struct TableDef {
    name: &'static str,
    columns: &'static [(&'static str, ColumnType)],
    indexes: &'static [&'static [&'static str]],
}

use ColumnType::*;

/// Creation order; parents come before their children.
const TABLES: &[TableDef] = &[
    TableDef {
        name: "fetch_meta",
        columns: &[
            ("revision", Text),
            ("schema_version", Integer),
            ("last_fetched_at", Text),
        ],
        indexes: &[],
    },
    TableDef {
        name: "file_meta",
        columns: &[
            ("family", KeyText),
            ("os_version", KeyText),
            ("file_name", KeyText),
            ("file_timestamp", Text),
        ],
        indexes: &[&["family", "os_version", "file_name"]],
    },
    TableDef {
        name: "roots",
        columns: &[
            ("family", KeyText),
            ("os_version", KeyText),
            ("fetched_at", Text),
        ],
        indexes: &[&["family", "os_version"]],
    },
    TableDef {
        name: "definitions",
        columns: &[
            ("root_id", Ref("roots")),
            ("definition_id", KeyText),
            ("title", Text),
            ("description", LongText),
        ],
        indexes: &[&["root_id"]],
    },
    TableDef {
        name: "packages",
        columns: &[
            ("def_id", Ref("definitions")),
            ("name", KeyText),
            ("version", Text),
            ("arch", KeyText),
            ("not_fixed_yet", Integer),
            ("modularity_label", Text),
        ],
        indexes: &[&["def_id"], &["name"]],
    },
    TableDef {
        name: "definition_references",
        columns: &[
            ("def_id", Ref("definitions")),
            ("source", Text),
            ("ref_id", Text),
            ("ref_url", Text),
        ],
        indexes: &[&["def_id"]],
    },
    TableDef {
        name: "advisories",
        columns: &[
            ("def_id", Ref("definitions")),
            ("severity", Text),
            ("issued", Text),
            ("updated", Text),
        ],
        indexes: &[&["def_id"]],
    },
    TableDef {
        name: "cves",
        columns: &[
            ("advisory_id", Ref("advisories")),
            ("cve_id", KeyText),
            ("cvss2", Text),
            ("cvss3", Text),
            ("cwe", Text),
            ("impact", Text),
            ("href", Text),
            ("public_date", Text),
        ],
        indexes: &[&["advisory_id"], &["cve_id"]],
    },
    TableDef {
        name: "bugzillas",
        columns: &[
            ("advisory_id", Ref("advisories")),
            ("bugzilla_id", Text),
            ("url", Text),
            ("title", Text),
        ],
        indexes: &[&["advisory_id"]],
    },
    TableDef {
        name: "cpes",
        columns: &[("advisory_id", Ref("advisories")), ("cpe", Text)],
        indexes: &[&["advisory_id"]],
    },
    TableDef {
        name: "debians",
        columns: &[
            ("def_id", Ref("definitions")),
            ("cve_id", Text),
            ("more_info", LongText),
        ],
        indexes: &[&["def_id"]],
    },
];

/// Column that only the legacy layout had
const LEGACY_TABLE: &str = "fetch_meta";
const LEGACY_COLUMN: &str = "file_name";

/// Refuse to open a database written with the legacy layout.
pub async fn ensure_compatible(pool: &AnyPool, dialect: Dialect) -> Result<()> {
    if column_exists(pool, dialect, LEGACY_TABLE, LEGACY_COLUMN).await? {
        return Err(StoreError::IncompatibleSchema);
    }
    Ok(())
}

/// Create every table and index that does not exist yet.
pub async fn init_schema(pool: &AnyPool, dialect: Dialect) -> Result<()> {
    debug!(dialect = %dialect, "Initializing database schema");

    let mut tx = pool.begin().await?;
    for statement in create_statements(dialect) {
        sqlx::query(&statement).execute(&mut *tx).await?;
    }
    tx.commit().await?;

    info!(dialect = %dialect, tables = TABLES.len(), "Database schema initialized");
    Ok(())
}

async fn column_exists(
    pool: &AnyPool,
    dialect: Dialect,
    table: &str,
    column: &str,
) -> Result<bool> {
    let sql = dialect.rebind(dialect.column_probe());
    let count: i64 = sqlx::query_scalar(&sql)
        .bind(table)
        .bind(column)
        .fetch_one(pool)
        .await?;
    Ok(count > 0)
}

fn create_statements(dialect: Dialect) -> Vec<String> {
    let mut statements = Vec::new();
    for table in TABLES {
        let mut parts = vec![format!("id {}", dialect.primary_key())];
        let mut foreign_keys = Vec::new();

        for (name, ty) in table.columns {
            let sql_type = match ty {
                Integer => dialect.integer(),
                KeyText => dialect.key_text(),
                Text => dialect.text(),
                LongText => dialect.long_text(),
                Ref(parent) => {
                    foreign_keys.push(format!("FOREIGN KEY ({name}) REFERENCES {parent}(id)"));
                    dialect.integer()
                }
            };
            let not_null = if matches!(ty, Ref(_)) { " NOT NULL" } else { "" };
            parts.push(format!("{name} {sql_type}{not_null}"));
        }

        if dialect.inline_indexes() {
            for columns in table.indexes {
                parts.push(format!(
                    "INDEX {} ({})",
                    index_name(table.name, columns),
                    columns.join(", ")
                ));
            }
        }
        parts.extend(foreign_keys);

        statements.push(format!(
            "CREATE TABLE IF NOT EXISTS {} ({})",
            table.name,
            parts.join(", ")
        ));

        if !dialect.inline_indexes() {
            for columns in table.indexes {
                statements.push(format!(
                    "CREATE INDEX IF NOT EXISTS {} ON {} ({})",
                    index_name(table.name, columns),
                    table.name,
                    columns.join(", ")
                ));
            }
        }
    }
    statements
}

fn index_name(table: &str, columns: &[&str]) -> String {
    format!("idx_{}_{}", table, columns.join("_"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_statements_sqlite() {
        let statements = create_statements(Dialect::Sqlite);
        let packages = statements
            .iter()
            .find(|s| s.starts_with("CREATE TABLE IF NOT EXISTS packages"))
            .expect("packages table");
        assert!(packages.contains("id INTEGER PRIMARY KEY AUTOINCREMENT"));
        assert!(packages.contains("FOREIGN KEY (def_id) REFERENCES definitions(id)"));
        assert!(statements.contains(
            &"CREATE INDEX IF NOT EXISTS idx_packages_name ON packages (name)".to_string()
        ));
        assert!(statements.contains(
            &"CREATE INDEX IF NOT EXISTS idx_roots_family_os_version ON roots (family, os_version)"
                .to_string()
        ));
    }

    #[test]
    fn test_create_statements_mysql_inlines_indexes() {
        let statements = create_statements(Dialect::Mysql);
        assert_eq!(statements.len(), TABLES.len());
        let cves = statements
            .iter()
            .find(|s| s.starts_with("CREATE TABLE IF NOT EXISTS cves"))
            .expect("cves table");
        assert!(cves.contains("INDEX idx_cves_cve_id (cve_id)"));
        assert!(cves.contains("cve_id VARCHAR(255)"));
        assert!(cves.contains("advisory_id BIGINT NOT NULL"));
    }

    #[test]
    fn test_file_meta_is_keyed_by_partition() {
        let statements = create_statements(Dialect::Sqlite);
        assert!(statements.contains(
            &"CREATE INDEX IF NOT EXISTS idx_file_meta_family_os_version_file_name \
              ON file_meta (family, os_version, file_name)"
                .to_string()
        ));
    }

    #[test]
    fn test_every_parent_key_is_indexed() {
        for table in TABLES {
            for (name, ty) in table.columns {
                if matches!(ty, Ref(_)) {
                    assert!(
                        table.indexes.iter().any(|cols| cols.first() == Some(name)),
                        "{}.{} is not indexed",
                        table.name,
                        name
                    );
                }
            }
        }
    }
}
