//! SQLite-backed [`SignatureStore`].
//!
//! `update` and `upsert` run inside a `BEGIN IMMEDIATE` transaction, so
//! concurrent read-modify-write cycles on the same database are serialized
//! and the `INVESTIGATING` status can act as a lease.

use rusqlite::{params, params_from_iter, Connection, OptionalExtension, Row, TransactionBehavior};
use tracing::debug;

use super::{
    from_db_time, to_db_time, BoxError, Mutation, Pool, SignatureFilter, SignatureStore, StoreError,
    StoreOp, UpdateError,
};
use crate::signature::{Signature, SignatureError, SignatureKey, SignatureRecord};

const COLUMNS: &str = "key, status, error_type, service, message_template, sample_message,
    occurrence_count, first_seen, last_seen, sample_trace_ids_json, diagnosis_json,
    investigating_since, resolved_at, history_json, last_failure";

#[derive(Clone)]
pub struct SqliteSignatureStore {
    pool: Pool,
}

impl SqliteSignatureStore {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &Pool {
        &self.pool
    }
}

/// Raw column values, decoded outside the rusqlite row callback so that JSON
/// and invariant failures keep their own error types.
struct RawRow {
    key: String,
    status: String,
    error_type: String,
    service: String,
    message_template: String,
    sample_message: String,
    occurrence_count: i64,
    first_seen: String,
    last_seen: String,
    sample_trace_ids_json: String,
    diagnosis_json: Option<String>,
    investigating_since: Option<String>,
    resolved_at: Option<String>,
    history_json: String,
    last_failure: Option<String>,
}

impl RawRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            key: row.get(0)?,
            status: row.get(1)?,
            error_type: row.get(2)?,
            service: row.get(3)?,
            message_template: row.get(4)?,
            sample_message: row.get(5)?,
            occurrence_count: row.get(6)?,
            first_seen: row.get(7)?,
            last_seen: row.get(8)?,
            sample_trace_ids_json: row.get(9)?,
            diagnosis_json: row.get(10)?,
            investigating_since: row.get(11)?,
            resolved_at: row.get(12)?,
            history_json: row.get(13)?,
            last_failure: row.get(14)?,
        })
    }

    fn decode(self) -> Result<Signature, BoxError> {
        let occurrence_count = u64::try_from(self.occurrence_count)
            .map_err(|_| SignatureError::Invalid(format!("negative occurrence_count {}", self.occurrence_count)))?;
        let record = SignatureRecord {
            key: self.key.parse()?,
            status: self.status.parse()?,
            error_type: self.error_type,
            service: self.service,
            message_template: self.message_template,
            sample_message: self.sample_message,
            occurrence_count,
            first_seen: from_db_time(&self.first_seen)?,
            last_seen: from_db_time(&self.last_seen)?,
            sample_trace_ids: serde_json::from_str(&self.sample_trace_ids_json)?,
            diagnosis: self.diagnosis_json.as_deref().map(serde_json::from_str).transpose()?,
            investigating_since: self.investigating_since.as_deref().map(from_db_time).transpose()?,
            resolved_at: self.resolved_at.as_deref().map(from_db_time).transpose()?,
            history: serde_json::from_str(&self.history_json)?,
            last_failure: self.last_failure,
        };
        Ok(Signature::try_from(record)?)
    }
}

fn read_row(conn: &Connection, key: &SignatureKey) -> Result<Option<Signature>, BoxError> {
    let raw = conn
        .query_row(
            &format!("SELECT {} FROM signatures WHERE key = ?1", COLUMNS),
            params![key.as_str()],
            RawRow::from_row,
        )
        .optional()?;
    raw.map(RawRow::decode).transpose()
}

fn write_row(conn: &Connection, signature: &Signature) -> Result<(), BoxError> {
    let record = SignatureRecord::from(signature.clone());
    let occurrence_count = i64::try_from(record.occurrence_count).unwrap_or(i64::MAX);
    let diagnosis_json = record.diagnosis.as_ref().map(serde_json::to_string).transpose()?;

    conn.execute(
        "INSERT INTO signatures (
            key, status, error_type, service, message_template, sample_message,
            occurrence_count, first_seen, last_seen, sample_trace_ids_json, diagnosis_json,
            investigating_since, resolved_at, history_json, last_failure
         ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)
         ON CONFLICT(key) DO UPDATE SET
            status = excluded.status,
            error_type = excluded.error_type,
            service = excluded.service,
            message_template = excluded.message_template,
            sample_message = excluded.sample_message,
            occurrence_count = excluded.occurrence_count,
            first_seen = excluded.first_seen,
            last_seen = excluded.last_seen,
            sample_trace_ids_json = excluded.sample_trace_ids_json,
            diagnosis_json = excluded.diagnosis_json,
            investigating_since = excluded.investigating_since,
            resolved_at = excluded.resolved_at,
            history_json = excluded.history_json,
            last_failure = excluded.last_failure,
            updated_at = datetime('now')",
        params![
            record.key.as_str(),
            record.status.as_str(),
            record.error_type,
            record.service,
            record.message_template,
            record.sample_message,
            occurrence_count,
            to_db_time(record.first_seen),
            to_db_time(record.last_seen),
            serde_json::to_string(&record.sample_trace_ids)?,
            diagnosis_json,
            record.investigating_since.map(to_db_time),
            record.resolved_at.map(to_db_time),
            serde_json::to_string(&record.history)?,
            record.last_failure,
        ],
    )?;
    Ok(())
}

impl SignatureStore for SqliteSignatureStore {
    fn get(&self, key: &SignatureKey) -> Result<Option<Signature>, StoreError> {
        let conn = self
            .pool
            .get()
            .map_err(|e| StoreError::new(StoreOp::Read, Some(key), e))?;
        read_row(&conn, key).map_err(|e| StoreError::new(StoreOp::Read, Some(key), e))
    }

    fn upsert(&self, signature: &Signature) -> Result<(), StoreError> {
        let key = signature.key();
        let mut conn = self
            .pool
            .get()
            .map_err(|e| StoreError::new(StoreOp::Read, Some(key), e))?;
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(|e| StoreError::new(StoreOp::Read, Some(key), e))?;

        let exists: bool = tx
            .query_row(
                "SELECT EXISTS(SELECT 1 FROM signatures WHERE key = ?1)",
                params![key.as_str()],
                |row| row.get(0),
            )
            .map_err(|e| StoreError::new(StoreOp::Read, Some(key), e))?;
        let op = if exists { StoreOp::Update } else { StoreOp::Create };

        write_row(&tx, signature).map_err(|e| StoreError::new(op, Some(key), e))?;
        tx.commit().map_err(|e| StoreError::new(op, Some(key), e))
    }

    fn list(&self, filter: &SignatureFilter) -> Result<Vec<Signature>, StoreError> {
        let list_err = |e: BoxError| StoreError::new(StoreOp::List, None, e);

        let mut clauses = Vec::new();
        let mut values = Vec::new();
        if let Some(status) = filter.status {
            values.push(status.as_str().to_string());
            clauses.push(format!("status = ?{}", values.len()));
        }
        if let Some(service) = &filter.service {
            values.push(service.clone());
            clauses.push(format!("service = ?{}", values.len()));
        }

        let mut sql = format!("SELECT {} FROM signatures", COLUMNS);
        if !clauses.is_empty() {
            sql.push_str(" WHERE ");
            sql.push_str(&clauses.join(" AND "));
        }
        sql.push_str(" ORDER BY last_seen DESC");
        if let Some(limit) = filter.limit {
            sql.push_str(&format!(" LIMIT {}", limit));
        }

        let conn = self.pool.get().map_err(|e| list_err(e.into()))?;
        let mut stmt = conn.prepare(&sql).map_err(|e| list_err(e.into()))?;
        let rows = stmt
            .query_map(params_from_iter(values.iter()), RawRow::from_row)
            .map_err(|e| list_err(e.into()))?;

        let mut signatures = Vec::new();
        for row in rows {
            let raw = row.map_err(|e| list_err(e.into()))?;
            let key = raw.key.clone();
            let signature = raw.decode().map_err(|e| {
                StoreError::new(StoreOp::List, key.parse::<SignatureKey>().ok().as_ref(), e)
            })?;
            signatures.push(signature);
        }
        Ok(signatures)
    }

    fn update(&self, key: &SignatureKey, mutate: Mutation<'_>) -> Result<Signature, UpdateError> {
        let mut conn = self
            .pool
            .get()
            .map_err(|e| StoreError::new(StoreOp::Read, Some(key), e))?;
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(|e| StoreError::new(StoreOp::Read, Some(key), e))?;

        let current = read_row(&tx, key).map_err(|e| StoreError::new(StoreOp::Read, Some(key), e))?;
        let op = if current.is_some() {
            StoreOp::Update
        } else {
            StoreOp::Create
        };

        let next = mutate(current.clone())?;
        if next.key() != key {
            return Err(SignatureError::Invalid(format!(
                "mutation of {} produced signature {}",
                key.short(),
                next.key().short()
            ))
            .into());
        }
        if current.as_ref() == Some(&next) {
            debug!(key = %key.short(), "signature unchanged, skipping write");
            return Ok(next);
        }

        write_row(&tx, &next).map_err(|e| StoreError::new(op, Some(key), e))?;
        tx.commit().map_err(|e| StoreError::new(op, Some(key), e))?;
        Ok(next)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signature::{
        Confidence, Diagnosis, ErrorEvent, Evidence, Fingerprinter, SignatureStatus,
    };
    use crate::storage::open_in_memory;
    use chrono::{Duration, Utc};

    fn store() -> SqliteSignatureStore {
        SqliteSignatureStore::new(open_in_memory().unwrap())
    }

    fn signature(service: &str) -> Signature {
        let event = ErrorEvent {
            error_type: "KeyError".into(),
            message: "missing 'user_id'".into(),
            service: service.into(),
            stack: vec![],
            trace_id: Some("trace-1".into()),
            span_id: None,
            timestamp: Utc::now(),
        };
        let fp = Fingerprinter::default().fingerprint(&event).unwrap();
        Signature::first_sighting(&fp, &event)
    }

    fn reject_writes(store: &SqliteSignatureStore, on: &str) {
        let conn = store.pool().get().unwrap();
        conn.execute_batch(&format!(
            "CREATE TRIGGER reject_{on} BEFORE {on} ON signatures
             BEGIN SELECT RAISE(ABORT, 'read-only replica'); END;"
        ))
        .unwrap();
    }

    #[test]
    fn test_failed_upsert_of_new_row_is_a_create() {
        let store = store();
        reject_writes(&store, "INSERT");
        let s = signature("api");

        let err = store.upsert(&s).unwrap_err();
        assert_eq!(err.op, StoreOp::Create);
        assert_eq!(err.key.as_ref(), Some(s.key()));
    }

    #[test]
    fn test_failed_upsert_of_existing_row_is_an_update() {
        let store = store();
        let mut s = signature("api");
        store.upsert(&s).unwrap();
        reject_writes(&store, "UPDATE");
        s.record_occurrence(Utc::now(), Some("trace-2"));

        let err = store.upsert(&s).unwrap_err();
        assert_eq!(err.op, StoreOp::Update);
        assert_eq!(store.get(s.key()).unwrap().unwrap().occurrence_count(), 1);
    }

    #[test]
    fn test_get_missing_is_none() {
        let s = signature("api");
        assert!(store().get(s.key()).unwrap().is_none());
    }

    #[test]
    fn test_upsert_then_get_round_trips() {
        let store = store();
        let mut s = signature("api");
        s.begin_investigation(Utc::now()).unwrap();
        let d = Diagnosis::new(
            "dict access without default",
            vec![Evidence::new("stack", "handlers.py: user_id lookup")],
            "use .get()",
            Confidence::Medium,
            0.12,
            Utc::now(),
        )
        .unwrap();
        s.complete_investigation(d).unwrap();
        store.upsert(&s).unwrap();

        let loaded = store.get(s.key()).unwrap().unwrap();
        assert_eq!(loaded, s);
        assert_eq!(loaded.status(), SignatureStatus::Diagnosed);
    }

    #[test]
    fn test_update_creates_then_mutates() {
        let store = store();
        let s = signature("api");
        let key = s.key().clone();

        let created = store
            .update(&key, &mut |current| {
                assert!(current.is_none());
                Ok(s.clone())
            })
            .unwrap();
        assert_eq!(created.occurrence_count(), 1);

        let later = Utc::now() + Duration::seconds(5);
        let updated = store
            .update(&key, &mut |current| {
                let mut sig = current.ok_or(SignatureError::Absent)?;
                sig.record_occurrence(later, None);
                Ok(sig)
            })
            .unwrap();
        assert_eq!(updated.occurrence_count(), 2);
        assert_eq!(store.get(&key).unwrap().unwrap().occurrence_count(), 2);
    }

    #[test]
    fn test_rejected_update_writes_nothing() {
        let store = store();
        let s = signature("api");
        store.upsert(&s).unwrap();

        let err = store
            .update(s.key(), &mut |current| {
                let mut sig = current.ok_or(SignatureError::Absent)?;
                sig.complete_investigation(
                    Diagnosis::new("x", vec![Evidence::new("a", "b")], "y", Confidence::Low, 0.0, Utc::now())
                        .unwrap(),
                )?;
                Ok(sig)
            })
            .unwrap_err();
        assert!(matches!(err, UpdateError::Rejected(SignatureError::IllegalTransition { .. })));
        assert_eq!(store.get(s.key()).unwrap().unwrap().status(), SignatureStatus::New);
    }

    #[test]
    fn test_list_filters_by_status_and_service() {
        let store = store();
        let a = signature("api");
        let mut b = signature("worker");
        b.mute().unwrap();
        store.upsert(&a).unwrap();
        store.upsert(&b).unwrap();

        assert_eq!(store.list(&SignatureFilter::default()).unwrap().len(), 2);
        let muted = store.list(&SignatureFilter::status(SignatureStatus::Muted)).unwrap();
        assert_eq!(muted.len(), 1);
        assert_eq!(muted[0].service(), "worker");

        let api = store
            .list(&SignatureFilter {
                service: Some("api".into()),
                limit: Some(10),
                ..SignatureFilter::default()
            })
            .unwrap();
        assert_eq!(api.len(), 1);
    }

    #[test]
    fn test_corrupt_row_is_a_read_failure() {
        let store = store();
        let s = signature("api");
        store.upsert(&s).unwrap();
        store
            .pool()
            .get()
            .unwrap()
            .execute("UPDATE signatures SET status = 'DIAGNOSED'", [])
            .unwrap();

        let err = store.get(s.key()).unwrap_err();
        assert_eq!(err.op, StoreOp::Read);
        assert_eq!(err.key.as_ref(), Some(s.key()));
    }
}
