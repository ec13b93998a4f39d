//! libSQL backend: async `FlagStore` implementation.
//!
//! Supports local file and in-memory databases.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use libsql::{Connection, Database as LibSqlDatabase, params};
use tracing::{debug, info, warn};

use crate::error::DatabaseError;
use crate::pipeline::lifecycle::{FlagDraft, FlaggedRecord};
use crate::pipeline::types::EmergencyCategory;
use crate::store::migrations;
use crate::store::traits::FlagStore;

/// libSQL flagged-message store.
///
/// Stores a single connection that is reused for all operations.
/// `libsql::Connection` is `Send + Sync` and safe for concurrent async use.
pub struct LibSqlFlagStore {
    #[allow(dead_code)]
    db: Arc<LibSqlDatabase>,
    conn: Connection,
}

impl LibSqlFlagStore {
    /// Open (or create) a local database file and run migrations.
    pub async fn new_local(path: &Path) -> Result<Self, DatabaseError> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).map_err(|e| {
                DatabaseError::Pool(format!("Failed to create database directory: {e}"))
            })?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| DatabaseError::Pool(format!("Failed to open libSQL database: {e}")))?;

        let store = Self::from_database(db).await?;
        info!(path = %path.display(), "Database opened");
        Ok(store)
    }

    /// Create an in-memory database (for tests and dry runs).
    pub async fn new_memory() -> Result<Self, DatabaseError> {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .map_err(|e| {
                DatabaseError::Pool(format!("Failed to create in-memory database: {e}"))
            })?;
        Self::from_database(db).await
    }

    async fn from_database(db: LibSqlDatabase) -> Result<Self, DatabaseError> {
        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Pool(format!("Failed to create connection: {e}")))?;

        migrations::run_migrations(&conn).await?;
        Ok(Self {
            db: Arc::new(db),
            conn,
        })
    }

    /// Get the connection.
    fn conn(&self) -> &Connection {
        &self.conn
    }
}

// ── Helper functions ────────────────────────────────────────────────

/// Parse an RFC 3339 or SQLite datetime string into DateTime<Utc>.
fn parse_datetime(s: &str) -> Result<DateTime<Utc>, DatabaseError> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Ok(dt.with_timezone(&Utc));
    }
    chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f")
        .or_else(|_| chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S"))
        .map(|ndt| ndt.and_utc())
        .map_err(|e| DatabaseError::Serialization(format!("timestamp '{s}': {e}")))
}

/// Map an insert error, singling out primary-key collisions.
fn map_insert_error(id: &str, e: libsql::Error) -> DatabaseError {
    let message = e.to_string();
    if message.contains("UNIQUE constraint failed") || message.contains("PRIMARY KEY") {
        DatabaseError::Constraint(format!("flagged message {id} already exists"))
    } else {
        DatabaseError::Query(format!("save: {message}"))
    }
}

fn row_to_record(row: &libsql::Row) -> Result<FlaggedRecord, DatabaseError> {
    let col = |e: libsql::Error| DatabaseError::Query(format!("flagged_messages row parse: {e}"));

    let id: String = row.get(0).map_err(col)?;
    let category_str: String = row.get(5).map_err(col)?;
    let category = EmergencyCategory::parse(&category_str).ok_or_else(|| {
        DatabaseError::Serialization(format!("unknown category '{category_str}' on {id}"))
    })?;
    let context_str: String = row.get(7).map_err(col)?;
    let context: Vec<String> = serde_json::from_str(&context_str)
        .map_err(|e| DatabaseError::Serialization(format!("context of {id}: {e}")))?;
    let occurred_str: String = row.get(4).map_err(col)?;
    let created_str: String = row.get(10).map_err(col)?;
    let updated_str: String = row.get(11).map_err(col)?;

    let draft = FlagDraft {
        id,
        conversation_id: row.get(1).map_err(col)?,
        sender_id: row.get(2).map_err(col)?,
        message_text: row.get(3).map_err(col)?,
        occurred_at: parse_datetime(&occurred_str)?,
        category,
        confidence_score: row.get(6).map_err(col)?,
        context,
    };
    let processed: i64 = row.get(8).map_err(col)?;
    let notification_sent: i64 = row.get(9).map_err(col)?;

    FlaggedRecord::restore(
        draft,
        processed != 0,
        notification_sent != 0,
        parse_datetime(&created_str)?,
        parse_datetime(&updated_str)?,
    )
}

// ── Trait implementation ────────────────────────────────────────────

const FLAG_COLUMNS: &str = "id, conversation_id, sender_id, message_text, occurred_at, category, confidence_score, context, processed, notification_sent, created_at, updated_at";

#[async_trait]
impl FlagStore for LibSqlFlagStore {
    async fn save(&self, record: &FlaggedRecord) -> Result<(), DatabaseError> {
        let context_json = serde_json::to_string(&record.context)
            .map_err(|e| DatabaseError::Serialization(format!("context of {}: {e}", record.id)))?;

        self.conn()
            .execute(
                &format!(
                    "INSERT INTO flagged_messages ({FLAG_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)"
                ),
                params![
                    record.id.as_str(),
                    record.conversation_id.as_str(),
                    record.sender_id.as_str(),
                    record.message_text.as_str(),
                    record.occurred_at.to_rfc3339(),
                    record.category.as_str(),
                    record.confidence_score,
                    context_json,
                    i64::from(record.processed()),
                    i64::from(record.notification_sent()),
                    record.created_at.to_rfc3339(),
                    record.updated_at.to_rfc3339(),
                ],
            )
            .await
            .map_err(|e| map_insert_error(&record.id, e))?;

        debug!(id = %record.id, category = %record.category, "Flagged message inserted into DB");
        Ok(())
    }

    async fn update(&self, record: &FlaggedRecord) -> Result<(), DatabaseError> {
        let affected = self
            .conn()
            .execute(
                "UPDATE flagged_messages SET processed = ?1, notification_sent = ?2, updated_at = ?3 WHERE id = ?4",
                params![
                    i64::from(record.processed()),
                    i64::from(record.notification_sent()),
                    record.updated_at.to_rfc3339(),
                    record.id.as_str(),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("update: {e}")))?;

        if affected == 0 {
            return Err(DatabaseError::NotFound {
                entity: "flagged_message".into(),
                id: record.id.clone(),
            });
        }
        debug!(
            id = %record.id,
            notification_sent = record.notification_sent(),
            "Flagged message updated in DB"
        );
        Ok(())
    }

    async fn get(&self, id: &str) -> Result<Option<FlaggedRecord>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!("SELECT {FLAG_COLUMNS} FROM flagged_messages WHERE id = ?1"),
                params![id],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("get: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => row_to_record(&row).map(Some),
            Ok(None) => Ok(None),
            Err(e) => Err(DatabaseError::Query(format!("get: {e}"))),
        }
    }

    async fn list_undelivered(&self, limit: usize) -> Result<Vec<FlaggedRecord>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {FLAG_COLUMNS} FROM flagged_messages WHERE notification_sent = 0 ORDER BY created_at ASC LIMIT ?1"
                ),
                params![limit as i64],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("list_undelivered: {e}")))?;

        let mut records = Vec::new();
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(format!("list_undelivered: {e}")))?
        {
            match row_to_record(&row) {
                Ok(record) => records.push(record),
                Err(e) => warn!("Skipping flagged message row: {e}"),
            }
        }
        Ok(records)
    }

    async fn count_undelivered(&self) -> Result<u64, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT COUNT(*) FROM flagged_messages WHERE notification_sent = 0",
                (),
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("count_undelivered: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => {
                let count: i64 = row
                    .get(0)
                    .map_err(|e| DatabaseError::Query(format!("count_undelivered: {e}")))?;
                Ok(count.max(0) as u64)
            }
            Ok(None) => Ok(0),
            Err(e) => Err(DatabaseError::Query(format!("count_undelivered: {e}"))),
        }
    }
}
