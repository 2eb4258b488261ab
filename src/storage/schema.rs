//! Database schema and migrations.

use anyhow::Result;
use rusqlite::Connection;

/// Run all pending migrations.
pub fn migrate(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY,
            applied_at TEXT NOT NULL DEFAULT (datetime('now'))
        );

        CREATE TABLE IF NOT EXISTS signatures (
            key TEXT PRIMARY KEY,
            status TEXT NOT NULL,
            error_type TEXT NOT NULL,
            service TEXT NOT NULL,
            message_template TEXT NOT NULL,
            sample_message TEXT NOT NULL,
            occurrence_count INTEGER NOT NULL CHECK (occurrence_count >= 1),
            first_seen TEXT NOT NULL,
            last_seen TEXT NOT NULL,
            sample_trace_ids_json TEXT NOT NULL DEFAULT '[]',
            diagnosis_json TEXT,
            investigating_since TEXT,
            resolved_at TEXT,
            history_json TEXT NOT NULL DEFAULT '[]',
            last_failure TEXT,
            created_at TEXT NOT NULL DEFAULT (datetime('now')),
            updated_at TEXT NOT NULL DEFAULT (datetime('now'))
        );

        CREATE INDEX IF NOT EXISTS idx_signatures_status ON signatures(status);
        CREATE INDEX IF NOT EXISTS idx_signatures_last_seen ON signatures(last_seen);

        CREATE TABLE IF NOT EXISTS spend_journal (
            id INTEGER PRIMARY KEY,
            signature_key TEXT NOT NULL,
            cost_usd REAL NOT NULL,
            outcome TEXT NOT NULL,
            spent_at TEXT NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_spend_journal_spent_at ON spend_journal(spent_at);",
    )?;

    conn.execute(
        "INSERT OR IGNORE INTO schema_version (version) VALUES (1)",
        [],
    )?;

    Ok(())
}
