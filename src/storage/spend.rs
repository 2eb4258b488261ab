//! SQLite spend journal backing the diagnosis budget.

use chrono::{DateTime, Utc};
use rusqlite::params;

use super::{to_db_time, Pool, StoreError, StoreOp};
use crate::budget::{SpendEntry, SpendJournal};

#[derive(Clone)]
pub struct SqliteSpendJournal {
    pool: Pool,
}

impl SqliteSpendJournal {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }
}

impl SpendJournal for SqliteSpendJournal {
    fn record(&self, entry: &SpendEntry) -> Result<(), StoreError> {
        let err = |e: rusqlite::Error| StoreError::new(StoreOp::Create, Some(&entry.key), e);
        let conn = self
            .pool
            .get()
            .map_err(|e| StoreError::new(StoreOp::Create, Some(&entry.key), e))?;
        conn.execute(
            "INSERT INTO spend_journal (signature_key, cost_usd, outcome, spent_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![
                entry.key.as_str(),
                entry.cost_usd,
                entry.outcome,
                to_db_time(entry.spent_at)
            ],
        )
        .map_err(err)?;
        Ok(())
    }

    fn total_since(&self, since: DateTime<Utc>) -> Result<f64, StoreError> {
        let conn = self
            .pool
            .get()
            .map_err(|e| StoreError::new(StoreOp::Read, None, e))?;
        conn.query_row(
            "SELECT COALESCE(SUM(cost_usd), 0.0) FROM spend_journal WHERE spent_at >= ?1",
            params![to_db_time(since)],
            |row| row.get::<_, f64>(0),
        )
        .map_err(|e| StoreError::new(StoreOp::Read, None, e))
    }
}
