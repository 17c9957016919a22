use std::time::Duration;
use thiserror::Error;

/// Crate-wide error taxonomy (see spec §7). Kept close to the teacher
/// crate's flat `SyncError` enum and extended with one variant per
/// documented error kind.
#[derive(Error, Debug)]
pub enum SyncError {
    #[error("sqlite: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("serde: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("zip: {0}")]
    Zip(#[from] zip::result::ZipError),
    #[error("invalid state: {0}")]
    State(&'static str),
    #[error("config missing required key: {0}")]
    ConfigMissing(&'static str),
    #[error("network store unavailable: {0}")]
    NetworkUnavailable(String),
    #[error("global lock busy")]
    LockBusy,
    #[error("global lock acquire timed out after {0:?}")]
    LockTimeout(Duration),
    #[error("conflict on {table}/{record_id}")]
    Conflict { table: String, record_id: String },
    #[error("transient error: {0}")]
    Transient(String),
    #[error("fatal: {0}")]
    Fatal(String),
}

pub type Result<T> = std::result::Result<T, SyncError>;

/// Jet/OLE lock error codes the source retries on (§4.4, §4.5, §7).
const LOCK_CODES: [i32; 5] = [3218, 3260, 3050, 3188, 3197];

/// True when a raw driver error message looks like the kind of lock
/// contention the source retries rather than fails on.
pub fn is_transient_message(msg: &str) -> bool {
    let lower = msg.to_ascii_lowercase();
    lower.contains("locked")
        || lower.contains("verrou")
        || lower.contains("sharing violation")
        || LOCK_CODES.iter().any(|c| lower.contains(&c.to_string()))
}

impl SyncError {
    pub fn is_transient(&self) -> bool {
        match self {
            SyncError::Transient(_) => true,
            SyncError::Sqlite(e) => is_transient_message(&e.to_string()),
            _ => false,
        }
    }
}
