use clap::{Parser, Subcommand};
use std::path::PathBuf;

use crate::error::StoreError;
use crate::storage::BackendKind;

// ============================================
// Environment variable name constants
// ============================================
pub mod env {
    pub const DB_TYPE: &str = "DB_TYPE";
    pub const DB_PATH: &str = "DB_PATH";
    pub const BATCH_SIZE: &str = "BATCH_SIZE";
    pub const DEBUG_SQL: &str = "DEBUG_SQL";
    pub const MAX_CONNECTIONS: &str = "MAX_CONNECTIONS";
    pub const REDIS_TIMEOUT_SECS: &str = "REDIS_TIMEOUT_SECS";
    pub const LOG_FORMAT: &str = "LOG_FORMAT";
    pub const LOG_LEVEL: &str = "LOG_LEVEL";
    pub const BIND: &str = "BIND";
    pub const SERVER_PORT: &str = "SERVER_PORT";
}

/// Default number of definitions written per batch.
///
/// Small enough that a batch of child rows stays far below SQLite's bind-parameter ceiling.
pub const DEFAULT_BATCH_SIZE: usize = 50;

/// Settings handed to `Store::open`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreConfig {
    /// Definitions per insert batch (relational) or per pipeline (redis)
    pub batch_size: usize,
    /// Log every SQL statement through tracing
    pub debug_sql: bool,
    /// Relational connection pool size
    pub max_connections: u32,
    /// Redis connect timeout
    pub redis_timeout_secs: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            batch_size: DEFAULT_BATCH_SIZE,
            debug_sql: false,
            max_connections: 5,
            redis_timeout_secs: 5,
        }
    }
}

impl StoreConfig {
    pub fn validate(&self) -> Result<(), StoreError> {
        if self.batch_size < 1 {
            return Err(StoreError::InvalidConfig(
                "batch-size must be at least 1".to_string(),
            ));
        }
        if self.max_connections < 1 {
            return Err(StoreError::InvalidConfig(
                "max-connections must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Import a normalized snapshot file (JSON) into the database
    Import {
        /// Snapshot file produced by a vendor fetcher
        file: PathBuf,
    },
    /// Select definitions from the database
    Select {
        #[command(subcommand)]
        by: SelectBy,
    },
    /// Count definitions stored for a family and release
    Count { family: String, release: String },
    /// Show when a family and release was last refreshed
    LastModified { family: String, release: String },
    /// Serve the query API over HTTP
    Server,
    /// Show version information
    Version,
}

#[derive(Subcommand, Debug, Clone)]
pub enum SelectBy {
    /// Definitions affecting a package
    Package {
        family: String,
        release: String,
        package: String,
        arch: Option<String>,
    },
    /// Definitions referencing a CVE
    Cve {
        family: String,
        release: String,
        cve_id: String,
        arch: Option<String>,
    },
}

#[derive(Parser, Debug, Clone)]
#[command(
    name = "oval-store",
    version,
    about = "OVAL advisory snapshot store and query engine",
    long_about = "Stores normalized OS vendor advisory snapshots (OVAL and updateinfo feeds) per OS family and release, and answers package and CVE lookups against them."
)]
pub struct Config {
    #[command(subcommand)]
    pub command: Command,

    /// Database type
    #[arg(
        long,
        global = true,
        env = env::DB_TYPE,
        value_enum,
        ignore_case = true,
        default_value_t = BackendKind::Sqlite3
    )]
    pub db_type: BackendKind,

    /// SQLite file path or connection string
    #[arg(long, global = true, env = env::DB_PATH, default_value = "oval.sqlite3")]
    pub db_path: String,

    /// Definitions written per batch
    #[arg(long, global = true, env = env::BATCH_SIZE, default_value_t = DEFAULT_BATCH_SIZE)]
    pub batch_size: usize,

    /// Log SQL statements
    #[arg(long, global = true, env = env::DEBUG_SQL)]
    pub debug_sql: bool,

    /// Relational connection pool size
    #[arg(long, global = true, env = env::MAX_CONNECTIONS, default_value = "5")]
    pub max_connections: u32,

    /// Redis connect timeout in seconds
    #[arg(long, global = true, env = env::REDIS_TIMEOUT_SECS, default_value = "5")]
    pub redis_timeout_secs: u64,

    /// Log format: json or pretty
    #[arg(long, global = true, env = env::LOG_FORMAT, default_value = "json")]
    pub log_format: String,

    /// Log level: trace, debug, info, warn, error
    #[arg(long, global = true, env = env::LOG_LEVEL, default_value = "info")]
    pub log_level: String,

    /// Server bind address (server mode only)
    #[arg(long, global = true, env = env::BIND, default_value = "127.0.0.1")]
    pub bind: String,

    /// Server port (server mode only)
    #[arg(long, global = true, env = env::SERVER_PORT, default_value = "1324")]
    pub server_port: u16,
}

impl Config {
    pub fn from_args() -> Self {
        Config::parse()
    }

    /// Validate configuration before opening the store
    pub fn validate(&self) -> Result<(), StoreError> {
        self.store_config().validate()
    }

    pub fn store_config(&self) -> StoreConfig {
        StoreConfig {
            batch_size: self.batch_size,
            debug_sql: self.debug_sql,
            max_connections: self.max_connections,
            redis_timeout_secs: self.redis_timeout_secs,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn default_config() -> Config {
        Config {
            command: Command::Version,
            db_type: BackendKind::Sqlite3,
            db_path: "oval.sqlite3".to_string(),
            batch_size: DEFAULT_BATCH_SIZE,
            debug_sql: false,
            max_connections: 5,
            redis_timeout_secs: 5,
            log_format: "json".to_string(),
            log_level: "info".to_string(),
            bind: "127.0.0.1".to_string(),
            server_port: 1324,
        }
    }

    #[test]
    fn test_validate_default() {
        assert!(default_config().validate().is_ok());
    }

    #[test]
    fn test_parse_db_type() {
        let parse = |db_type: &str| {
            Config::try_parse_from(["oval-store", "--db-type", db_type, "version"])
                .map(|config| config.db_type)
        };
        assert_eq!(parse("postgres").unwrap(), BackendKind::Postgres);
        assert_eq!(parse("postgresql").unwrap(), BackendKind::Postgres);
        assert_eq!(parse("SQLite3").unwrap(), BackendKind::Sqlite3);
        assert_eq!(parse("sqlite").unwrap(), BackendKind::Sqlite3);
        assert!(parse("oracle").is_err());

        let config = Config::try_parse_from(["oval-store", "version"]).unwrap();
        assert_eq!(config.db_type, BackendKind::Sqlite3);
    }

    #[test]
    fn test_validate_zero_batch_size() {
        let mut config = default_config();
        config.batch_size = 0;
        assert!(matches!(
            config.validate(),
            Err(StoreError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_store_config_from_flags() {
        let mut config = default_config();
        config.batch_size = 200;
        config.debug_sql = true;
        let store_config = config.store_config();
        assert_eq!(store_config.batch_size, 200);
        assert!(store_config.debug_sql);
        assert_eq!(store_config.redis_timeout_secs, 5);
    }

    #[test]
    fn test_parse_select_package() {
        let config = Config::try_parse_from([
            "oval-store",
            "--db-type",
            "redis",
            "select",
            "package",
            "amazon",
            "2",
            "kernel",
            "x86_64",
        ])
        .expect("Failed to parse args");

        assert_eq!(config.db_type, BackendKind::Redis);
        match config.command {
            Command::Select {
                by: SelectBy::Package { package, arch, .. },
            } => {
                assert_eq!(package, "kernel");
                assert_eq!(arch.as_deref(), Some("x86_64"));
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }
}
