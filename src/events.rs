use chrono::{DateTime, Utc};

/// Observable sync state for a country, surfaced to whatever UI or
/// diagnostics layer is listening (§3 "SyncStateChanged").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncState {
    UpToDate,
    SyncInProgress,
    OfflinePending,
    Error,
}

/// Event emitted whenever a country's sync state transitions (§4.9,
/// §4.10). Non-goals keep this crate from wiring the event to any
/// specific UI toolkit; callers subscribe however their host app does.
#[derive(Debug, Clone)]
pub struct SyncStateChanged {
    pub country_id: String,
    pub state: SyncState,
    pub pending_count: i64,
    pub last_error: Option<String>,
    pub timestamp_utc: DateTime<Utc>,
}
