//! SQLite storage layer: the signature store port, pool, and migrations.

pub mod schema;
pub mod signatures;
pub mod spend;

use anyhow::Result;
use chrono::{DateTime, SecondsFormat, Utc};
use r2d2::Pool as R2D2Pool;
use r2d2_sqlite::SqliteConnectionManager;
use thiserror::Error;

use crate::signature::{Signature, SignatureError, SignatureKey, SignatureStatus};

pub use signatures::SqliteSignatureStore;
pub use spend::SqliteSpendJournal;

/// Connection Pool type
pub type Pool = R2D2Pool<SqliteConnectionManager>;

pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Open (or create) the SQLite database and return a connection pool.
pub fn open_pool(path: &str) -> Result<Pool> {
    let manager = SqliteConnectionManager::file(path).with_init(|c| {
        c.execute_batch(
            "PRAGMA journal_mode = WAL;
                 PRAGMA synchronous = NORMAL;
                 PRAGMA temp_store = MEMORY;
                 PRAGMA foreign_keys = ON;
                 PRAGMA busy_timeout = 5000;",
        )
    });

    let pool = R2D2Pool::new(manager)?;

    // Run migrations on a single connection
    let conn = pool.get()?;
    schema::migrate(&conn)?;

    Ok(pool)
}

/// Single-connection in-memory database, for tests and dry runs.
pub fn open_in_memory() -> Result<Pool> {
    let manager = SqliteConnectionManager::memory();
    let pool = R2D2Pool::builder().max_size(1).build(manager)?;
    let conn = pool.get()?;
    schema::migrate(&conn)?;
    Ok(pool)
}

/// Fixed-width RFC 3339 so stored timestamps sort lexicographically.
pub(crate) fn to_db_time(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub(crate) fn from_db_time(s: &str) -> Result<DateTime<Utc>, chrono::ParseError> {
    Ok(DateTime::parse_from_rfc3339(s)?.with_timezone(&Utc))
}

// ---------------------------------------------------------------------------
// Signature store port
// ---------------------------------------------------------------------------

/// Which store operation failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreOp {
    Read,
    Create,
    Update,
    List,
}

impl std::fmt::Display for StoreOp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreOp::Read => write!(f, "read"),
            StoreOp::Create => write!(f, "create"),
            StoreOp::Update => write!(f, "update"),
            StoreOp::List => write!(f, "list"),
        }
    }
}

fn key_label(key: &Option<SignatureKey>) -> String {
    match key {
        Some(k) => format!("signature {}", k.short()),
        None => "signatures".to_string(),
    }
}

#[derive(Debug, Error)]
#[error("store {op} failed for {}: {source}", key_label(.key))]
pub struct StoreError {
    pub op: StoreOp,
    pub key: Option<SignatureKey>,
    pub source: BoxError,
}

impl StoreError {
    pub fn new(op: StoreOp, key: Option<&SignatureKey>, source: impl Into<BoxError>) -> Self {
        Self {
            op,
            key: key.cloned(),
            source: source.into(),
        }
    }
}

/// Failure of a transactional [`SignatureStore::update`].
#[derive(Debug, Error)]
pub enum UpdateError {
    /// The mutation refused the current state; nothing was written.
    #[error(transparent)]
    Rejected(#[from] SignatureError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Mutation applied by [`SignatureStore::update`] to the current row
/// (`None` when the key is not stored yet).
pub type Mutation<'a> = &'a mut dyn FnMut(Option<Signature>) -> Result<Signature, SignatureError>;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SignatureFilter {
    pub status: Option<SignatureStatus>,
    pub service: Option<String>,
    pub limit: Option<usize>,
}

impl SignatureFilter {
    pub fn status(status: SignatureStatus) -> Self {
        Self {
            status: Some(status),
            ..Self::default()
        }
    }
}

/// Durable owner of every signature. Each call is atomic.
pub trait SignatureStore: Send + Sync {
    fn get(&self, key: &SignatureKey) -> Result<Option<Signature>, StoreError>;

    fn upsert(&self, signature: &Signature) -> Result<(), StoreError>;

    /// Most recently seen first.
    fn list(&self, filter: &SignatureFilter) -> Result<Vec<Signature>, StoreError>;

    /// Read the current row, apply `mutate`, and write the result, all in one
    /// transaction. Nothing is written if `mutate` fails or returns the
    /// signature unchanged.
    fn update(&self, key: &SignatureKey, mutate: Mutation<'_>) -> Result<Signature, UpdateError>;
}

/// Apply a transition to an existing signature in one store transaction.
/// A missing key is rejected with [`SignatureError::Absent`].
pub fn transition(
    store: &dyn SignatureStore,
    key: &SignatureKey,
    mut apply: impl FnMut(&mut Signature) -> Result<(), SignatureError>,
) -> Result<Signature, UpdateError> {
    store.update(key, &mut |current| {
        let mut signature = current.ok_or(SignatureError::Absent)?;
        apply(&mut signature)?;
        Ok(signature)
    })
}
