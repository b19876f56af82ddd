//! Per-dialect SQL differences
//!
//! All statements are written with `?` placeholders and passed through [`Dialect::rebind`] before
//! execution. Values are bound through [`Value`] so one multi-row statement can mix integer and
//! text columns.

use sqlx::any::AnyArguments;
use sqlx::query::Query;
use sqlx::Any;
use std::fmt;

use crate::storage::BackendKind;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dialect {
    Sqlite,
    Mysql,
    Postgres,
}

impl Dialect {
    pub fn from_backend(kind: BackendKind) -> Option<Self> {
        match kind {
            BackendKind::Sqlite3 => Some(Dialect::Sqlite),
            BackendKind::Mysql => Some(Dialect::Mysql),
            BackendKind::Postgres => Some(Dialect::Postgres),
            BackendKind::Redis => None,
        }
    }

    /// Turn a user-supplied connection string into a sqlx URL.
    ///
    /// A bare SQLite path is opened in read-write-create mode.
    pub fn connection_url(self, connection: &str) -> String {
        match self {
            Dialect::Sqlite if connection == ":memory:" => "sqlite::memory:".to_string(),
            Dialect::Sqlite if !connection.starts_with("sqlite:") => {
                format!("sqlite://{connection}?mode=rwc")
            }
            _ => connection.to_string(),
        }
    }

    /// True for SQLite URLs whose database lives in the memory of a single connection.
    pub fn is_in_memory(self, connection: &str) -> bool {
        self == Dialect::Sqlite
            && (connection == ":memory:"
                || connection.starts_with("sqlite::memory:")
                || connection.contains("mode=memory"))
    }

    /// Rewrite `?` placeholders into the dialect's own syntax.
    pub fn rebind(self, sql: &str) -> String {
        if self != Dialect::Postgres {
            return sql.to_string();
        }
        let mut out = String::with_capacity(sql.len() + 16);
        let mut n = 0;
        for c in sql.chars() {
            if c == '?' {
                n += 1;
                out.push('$');
                out.push_str(&n.to_string());
            } else {
                out.push(c);
            }
        }
        out
    }

    pub fn primary_key(self) -> &'static str {
        match self {
            Dialect::Sqlite => "INTEGER PRIMARY KEY AUTOINCREMENT",
            Dialect::Mysql => "BIGINT NOT NULL AUTO_INCREMENT PRIMARY KEY",
            Dialect::Postgres => "BIGSERIAL PRIMARY KEY",
        }
    }

    pub fn integer(self) -> &'static str {
        match self {
            Dialect::Sqlite => "INTEGER",
            Dialect::Mysql | Dialect::Postgres => "BIGINT",
        }
    }

    /// String column that takes part in an index
    pub fn key_text(self) -> &'static str {
        match self {
            Dialect::Sqlite => "TEXT",
            Dialect::Mysql | Dialect::Postgres => "VARCHAR(255)",
        }
    }

    pub fn text(self) -> &'static str {
        "TEXT"
    }

    pub fn long_text(self) -> &'static str {
        match self {
            Dialect::Mysql => "LONGTEXT",
            Dialect::Sqlite | Dialect::Postgres => "TEXT",
        }
    }

    /// MySQL declares indexes inside CREATE TABLE; the others use CREATE INDEX IF NOT EXISTS.
    pub fn inline_indexes(self) -> bool {
        self == Dialect::Mysql
    }

    /// Generated ids come back through `RETURNING id` instead of the driver's last-insert id.
    ///
    /// The Any driver only reports a last-insert id for MySQL.
    pub fn returns_generated_id(self) -> bool {
        self != Dialect::Mysql
    }

    /// Statement opening a transaction that is going to write
    ///
    /// SQLite takes the write lock up front so a competing writer waits on the busy timeout
    /// instead of failing when its deferred transaction tries to upgrade.
    pub fn begin_write(self) -> Option<&'static str> {
        match self {
            Dialect::Sqlite => Some("BEGIN IMMEDIATE"),
            Dialect::Mysql | Dialect::Postgres => None,
        }
    }

    /// Bind parameters allowed in one statement
    pub fn max_bind_params(self) -> usize {
        match self {
            // lowest ceiling of the SQLite builds still in circulation
            Dialect::Sqlite => 999,
            Dialect::Mysql | Dialect::Postgres => 65_535,
        }
    }

    /// Statement that makes the current read transaction see a single snapshot
    pub fn snapshot_isolation(self) -> Option<&'static str> {
        match self {
            Dialect::Postgres => Some("SET TRANSACTION ISOLATION LEVEL REPEATABLE READ"),
            // InnoDB already defaults to REPEATABLE READ; SQLite transactions are serializable
            Dialect::Mysql | Dialect::Sqlite => None,
        }
    }

    /// Query listing a table's columns by name
    pub fn column_probe(self) -> &'static str {
        match self {
            Dialect::Sqlite => "SELECT COUNT(*) FROM pragma_table_info(?) WHERE name = ?",
            Dialect::Mysql => {
                "SELECT COUNT(*) FROM information_schema.columns \
                 WHERE table_schema = DATABASE() AND table_name = ? AND column_name = ?"
            }
            Dialect::Postgres => {
                "SELECT COUNT(*) FROM information_schema.columns \
                 WHERE table_name::text = ? AND column_name::text = ?"
            }
        }
    }
}

impl fmt::Display for Dialect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Dialect::Sqlite => write!(f, "sqlite3"),
            Dialect::Mysql => write!(f, "mysql"),
            Dialect::Postgres => write!(f, "postgres"),
        }
    }
}

/// A bind parameter
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Value {
    Int(i64),
    Text(String),
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int(v)
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Int(i64::from(v))
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Text(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Text(v)
    }
}

pub fn bind_values<'q>(
    mut query: Query<'q, Any, AnyArguments<'q>>,
    values: &'q [Value],
) -> Query<'q, Any, AnyArguments<'q>> {
    for value in values {
        query = match value {
            Value::Int(v) => query.bind(*v),
            Value::Text(v) => query.bind(v.as_str()),
        };
    }
    query
}

/// `(?, ?, ?), (?, ?, ?)` for `rows` rows of `columns` columns
pub fn value_groups(columns: usize, rows: usize) -> String {
    let group = format!("({})", vec!["?"; columns].join(", "));
    vec![group; rows].join(", ")
}

/// `?, ?, ?` for an `IN` list
pub fn in_list(len: usize) -> String {
    vec!["?"; len].join(", ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rebind_postgres() {
        let sql = "SELECT id FROM roots WHERE family = ? AND os_version = ?";
        assert_eq!(
            Dialect::Postgres.rebind(sql),
            "SELECT id FROM roots WHERE family = $1 AND os_version = $2"
        );
        assert_eq!(Dialect::Mysql.rebind(sql), sql);
        assert_eq!(Dialect::Sqlite.rebind(sql), sql);
    }

    #[test]
    fn test_connection_url() {
        assert_eq!(
            Dialect::Sqlite.connection_url("/var/lib/oval.sqlite3"),
            "sqlite:///var/lib/oval.sqlite3?mode=rwc"
        );
        assert_eq!(
            Dialect::Sqlite.connection_url("sqlite::memory:"),
            "sqlite::memory:"
        );
        assert_eq!(Dialect::Sqlite.connection_url(":memory:"), "sqlite::memory:");
        assert_eq!(
            Dialect::Postgres.connection_url("postgres://u:p@localhost/oval"),
            "postgres://u:p@localhost/oval"
        );
    }

    #[test]
    fn test_generated_id_strategy() {
        assert!(Dialect::Sqlite.returns_generated_id());
        assert!(Dialect::Postgres.returns_generated_id());
        assert!(!Dialect::Mysql.returns_generated_id());
    }

    #[test]
    fn test_begin_write() {
        assert_eq!(Dialect::Sqlite.begin_write(), Some("BEGIN IMMEDIATE"));
        assert_eq!(Dialect::Mysql.begin_write(), None);
        assert_eq!(Dialect::Postgres.begin_write(), None);
    }

    #[test]
    fn test_is_in_memory() {
        assert!(Dialect::Sqlite.is_in_memory("sqlite::memory:"));
        assert!(Dialect::Sqlite.is_in_memory(":memory:"));
        assert!(Dialect::Sqlite.is_in_memory("sqlite://oval?mode=memory&cache=shared"));
        assert!(!Dialect::Sqlite.is_in_memory("/var/lib/oval.sqlite3"));
        assert!(!Dialect::Postgres.is_in_memory("postgres://localhost/memory"));
    }

    #[test]
    fn test_value_groups() {
        assert_eq!(value_groups(2, 3), "(?, ?), (?, ?), (?, ?)");
        assert_eq!(in_list(3), "?, ?, ?");
    }

    #[test]
    fn test_from_backend() {
        assert_eq!(
            Dialect::from_backend(BackendKind::Postgres),
            Some(Dialect::Postgres)
        );
        assert_eq!(Dialect::from_backend(BackendKind::Redis), None);
    }
}
