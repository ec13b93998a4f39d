//! Schema versions for the flagged-message database.
//!
//! `_migrations` records which steps have run. A step's DDL and its version
//! row are committed together, so a crash mid-upgrade leaves the database at
//! the previous version.

use libsql::Connection;

use crate::error::DatabaseError;

/// `(version, name, ddl)`, ascending. Append only.
const SCHEMA: &[(i64, &str, &str)] = &[
    (
        1,
        "flagged_messages",
        "CREATE TABLE IF NOT EXISTS flagged_messages (
            id TEXT PRIMARY KEY NOT NULL,
            conversation_id TEXT NOT NULL,
            sender_id TEXT NOT NULL,
            message_text TEXT NOT NULL,
            occurred_at TEXT NOT NULL,
            category TEXT NOT NULL,
            confidence_score REAL NOT NULL,
            context TEXT NOT NULL DEFAULT '[]',
            processed INTEGER NOT NULL DEFAULT 0,
            notification_sent INTEGER NOT NULL DEFAULT 0,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_flagged_conversation ON flagged_messages(conversation_id);
        CREATE INDEX IF NOT EXISTS idx_flagged_sender ON flagged_messages(sender_id);",
    ),
    (
        2,
        "undelivered_index",
        "CREATE INDEX IF NOT EXISTS idx_flagged_undelivered
            ON flagged_messages(notification_sent, created_at);",
    ),
];

/// Bring the schema up to date.
pub async fn run_migrations(conn: &Connection) -> Result<(), DatabaseError> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS _migrations (
            version INTEGER PRIMARY KEY,
            name TEXT NOT NULL,
            applied_at TEXT NOT NULL DEFAULT (datetime('now'))
        );",
    )
    .await
    .map_err(|e| DatabaseError::Migration(format!("create _migrations: {e}")))?;

    let from = schema_version(conn).await?;
    let pending: Vec<_> = SCHEMA.iter().filter(|(v, _, _)| *v > from).collect();
    if pending.is_empty() {
        tracing::debug!(version = from, "Schema up to date");
        return Ok(());
    }

    for &(version, name, ddl) in pending {
        apply(conn, version, name, ddl).await?;
        tracing::info!(version, name, "Applied schema migration");
    }
    Ok(())
}

async fn apply(conn: &Connection, version: i64, name: &str, ddl: &str) -> Result<(), DatabaseError> {
    // Names are crate constants; quoting keeps the batch well-formed anyway.
    let batch = format!(
        "BEGIN;\n{ddl}\nINSERT INTO _migrations (version, name) VALUES ({version}, '{}');\nCOMMIT;",
        name.replace('\'', "''")
    );
    if let Err(e) = conn.execute_batch(&batch).await {
        let _ = conn.execute("ROLLBACK", ()).await;
        return Err(DatabaseError::Migration(format!("V{version} {name}: {e}")));
    }
    Ok(())
}

/// Highest applied version; 0 for a fresh database.
async fn schema_version(conn: &Connection) -> Result<i64, DatabaseError> {
    let query_err = |e: libsql::Error| DatabaseError::Migration(format!("read schema version: {e}"));
    let mut rows = conn
        .query("SELECT COALESCE(MAX(version), 0) FROM _migrations", ())
        .await
        .map_err(query_err)?;
    match rows.next().await.map_err(query_err)? {
        Some(row) => row.get::<i64>(0).map_err(query_err),
        None => Ok(0),
    }
}
