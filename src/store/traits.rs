//! Storage interface for flagged messages.

use async_trait::async_trait;

use crate::error::DatabaseError;
use crate::pipeline::lifecycle::FlaggedRecord;

/// Backend-agnostic store of flagged messages, keyed by source message id.
#[async_trait]
pub trait FlagStore: Send + Sync {
    /// Insert a new record. A record with the same id already stored is a
    /// `DatabaseError::Constraint`.
    async fn save(&self, record: &FlaggedRecord) -> Result<(), DatabaseError>;

    /// Overwrite the mutable fields of an existing record.
    /// An unknown id is `DatabaseError::NotFound`.
    async fn update(&self, record: &FlaggedRecord) -> Result<(), DatabaseError>;

    /// Get a record by id.
    async fn get(&self, id: &str) -> Result<Option<FlaggedRecord>, DatabaseError>;

    /// Records whose alert was never confirmed delivered, oldest first.
    async fn list_undelivered(&self, limit: usize) -> Result<Vec<FlaggedRecord>, DatabaseError>;

    /// Number of records whose alert was never confirmed delivered.
    async fn count_undelivered(&self) -> Result<u64, DatabaseError>;
}
