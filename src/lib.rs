pub mod commands;
pub mod config;
pub mod error;
pub mod family;
pub mod logging;
pub mod meta;
pub mod models;
pub mod query;
pub mod server;
pub mod storage;

pub use error::{FamilyError, Result, StoreError};
pub use family::{Family, Partition, normalize};
pub use meta::{FetchMeta, SourceFile};
pub use models::Definition;
pub use storage::{BackendKind, InsertOutcome, Store};
