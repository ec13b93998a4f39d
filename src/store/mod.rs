//! Persistence layer: libSQL-backed storage for flagged messages.

pub mod libsql_backend;
pub mod migrations;
pub mod traits;

pub use libsql_backend::LibSqlFlagStore;
pub use traits::FlagStore;
