use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};

use crate::error::Result;

const KEY_TIMESTAMP: &str = "LastSyncTimestamp";
const KEY_VERSION: &str = "LastSyncVersion";

/// Persisted high-water mark for incremental pulls (§3 `SyncWatermark`,
/// §6 `_SyncConfig`). `last_sync_timestamp` drives `LastModified`-based
/// filtering; `last_sync_version` is the fallback when a table has no
/// `LastModified` column.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SyncWatermark {
    pub last_sync_timestamp: Option<DateTime<Utc>>,
    pub last_sync_version: Option<i64>,
}

pub fn init_schema(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r#"
CREATE TABLE IF NOT EXISTS _SyncConfig (
    ConfigKey TEXT PRIMARY KEY,
    ConfigValue TEXT
);
"#,
    )?;
    Ok(())
}

pub fn load_watermark(conn: &Connection, table: &str) -> Result<SyncWatermark> {
    init_schema(conn)?;
    let ts_key = format!("{KEY_TIMESTAMP}:{table}");
    let ver_key = format!("{KEY_VERSION}:{table}");

    let ts: Option<String> = conn
        .query_row("SELECT ConfigValue FROM _SyncConfig WHERE ConfigKey = ?1", params![ts_key], |r| r.get(0))
        .optional()?;
    let ver: Option<String> = conn
        .query_row("SELECT ConfigValue FROM _SyncConfig WHERE ConfigKey = ?1", params![ver_key], |r| r.get(0))
        .optional()?;

    Ok(SyncWatermark {
        last_sync_timestamp: ts.and_then(|s| DateTime::parse_from_rfc3339(&s).ok()).map(|dt| dt.with_timezone(&Utc)),
        last_sync_version: ver.and_then(|s| s.parse().ok()),
    })
}

pub fn store_watermark(conn: &Connection, table: &str, wm: &SyncWatermark) -> Result<()> {
    init_schema(conn)?;
    let ts_key = format!("{KEY_TIMESTAMP}:{table}");
    let ver_key = format!("{KEY_VERSION}:{table}");

    if let Some(ts) = wm.last_sync_timestamp {
        conn.execute(
            "INSERT INTO _SyncConfig (ConfigKey, ConfigValue) VALUES (?1, ?2)
             ON CONFLICT(ConfigKey) DO UPDATE SET ConfigValue = excluded.ConfigValue",
            params![ts_key, ts.to_rfc3339()],
        )?;
    }
    if let Some(version) = wm.last_sync_version {
        conn.execute(
            "INSERT INTO _SyncConfig (ConfigKey, ConfigValue) VALUES (?1, ?2)
             ON CONFLICT(ConfigKey) DO UPDATE SET ConfigValue = excluded.ConfigValue",
            params![ver_key, version.to_string()],
        )?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_watermark_through_config_table() {
        let conn = Connection::open_in_memory().unwrap();
        let wm = SyncWatermark { last_sync_timestamp: Some(Utc::now()), last_sync_version: Some(7) };
        store_watermark(&conn, "T_Reconciliation", &wm).unwrap();
        let loaded = load_watermark(&conn, "T_Reconciliation").unwrap();
        assert_eq!(loaded.last_sync_version, Some(7));
        assert!(loaded.last_sync_timestamp.is_some());
    }

    #[test]
    fn missing_watermark_is_default() {
        let conn = Connection::open_in_memory().unwrap();
        let loaded = load_watermark(&conn, "T_Reconciliation").unwrap();
        assert_eq!(loaded, SyncWatermark::default());
    }

    #[test]
    fn watermarks_are_scoped_per_table() {
        let conn = Connection::open_in_memory().unwrap();
        store_watermark(&conn, "T_Reconciliation", &SyncWatermark { last_sync_version: Some(1), ..Default::default() })
            .unwrap();
        store_watermark(&conn, "T_Other", &SyncWatermark { last_sync_version: Some(99), ..Default::default() })
            .unwrap();
        assert_eq!(load_watermark(&conn, "T_Reconciliation").unwrap().last_sync_version, Some(1));
        assert_eq!(load_watermark(&conn, "T_Other").unwrap().last_sync_version, Some(99));
    }
}
