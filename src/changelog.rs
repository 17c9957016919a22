use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};

use crate::error::Result;

/// Logical operation recorded against a row (§3 "ChangeLog").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationKind {
    Insert,
    Update,
    Delete,
}

impl OperationKind {
    pub fn as_str(self) -> &'static str {
        match self {
            OperationKind::Insert => "INSERT",
            OperationKind::Update => "UPDATE",
            OperationKind::Delete => "DELETE",
        }
    }
}

/// One durable row of the local mutation journal. Unlike the teacher's
/// `Change`, this carries no JSON row snapshot: §3 only asks for table,
/// record id, operation kind and an optional changed-column list encoded
/// inline in `operation` as `UPDATE(col1,col2,...)`.
#[derive(Debug, Clone)]
pub struct ChangeLogEntry {
    pub change_id: i64,
    pub table_name: String,
    pub record_id: String,
    pub operation: String,
    pub timestamp_utc: DateTime<Utc>,
    pub synchronized: bool,
}

impl ChangeLogEntry {
    pub fn operation_kind(&self) -> OperationKind {
        let head = self.operation.split('(').next().unwrap_or(&self.operation);
        match head {
            "INSERT" => OperationKind::Insert,
            "DELETE" => OperationKind::Delete,
            _ => OperationKind::Update,
        }
    }

    /// Parses the `col1,col2,...` list out of `UPDATE(col1,col2,...)`.
    /// Empty for INSERT/DELETE or a bare `UPDATE` with no column list.
    pub fn changed_columns(&self) -> Vec<String> {
        let Some(open) = self.operation.find('(') else {
            return Vec::new();
        };
        let Some(close) = self.operation.rfind(')') else {
            return Vec::new();
        };
        if close <= open {
            return Vec::new();
        }
        self.operation[open + 1..close]
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect()
    }
}

/// Builds the `operation` text stored for a change: `INSERT`, `DELETE`, or
/// `UPDATE(col1,col2)` when a changed-column set is known.
pub fn encode_operation(kind: OperationKind, changed_columns: &[String]) -> String {
    match kind {
        OperationKind::Insert => "INSERT".to_string(),
        OperationKind::Delete => "DELETE".to_string(),
        OperationKind::Update if changed_columns.is_empty() => "UPDATE".to_string(),
        OperationKind::Update => format!("UPDATE({})", changed_columns.join(",")),
    }
}

/// Per-connection handle onto the `ChangeLog` table (§3, §4.4). Entries
/// are appended by the batch applier as it writes rows, and drained by
/// the push engine in `ChangeID` order.
pub struct ChangeLogStore<'c> {
    conn: &'c Connection,
}

impl<'c> ChangeLogStore<'c> {
    pub fn new(conn: &'c Connection) -> ChangeLogStore<'c> {
        ChangeLogStore { conn }
    }

    pub fn init_schema(&self) -> Result<()> {
        self.conn.execute_batch(
            r#"
CREATE TABLE IF NOT EXISTS ChangeLog (
    ChangeID INTEGER PRIMARY KEY AUTOINCREMENT,
    TableName TEXT NOT NULL,
    RecordID TEXT NOT NULL,
    Operation TEXT NOT NULL,
    TimestampUtc TEXT NOT NULL,
    Synchronized INTEGER NOT NULL DEFAULT 0
);
CREATE INDEX IF NOT EXISTS idx_changelog_unsynced
ON ChangeLog(Synchronized, ChangeID);
"#,
        )?;
        Ok(())
    }

    /// Appends one entry per row written by a batch (§4.4 "emits one
    /// ChangeLog row per affected record, unless suppressed"). `when`
    /// is passed in rather than read from the clock so a whole batch
    /// shares one timestamp.
    pub fn record_change(
        &self,
        table_name: &str,
        record_id: &str,
        kind: OperationKind,
        changed_columns: &[String],
        when: DateTime<Utc>,
    ) -> Result<i64> {
        let operation = encode_operation(kind, changed_columns);
        self.conn.execute(
            "INSERT INTO ChangeLog (TableName, RecordID, Operation, TimestampUtc, Synchronized)
             VALUES (?1, ?2, ?3, ?4, 0)",
            params![table_name, record_id, operation, when.to_rfc3339()],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    pub fn get_unsynced_changes(&self, table_name: &str, limit: i64) -> Result<Vec<ChangeLogEntry>> {
        let mut stmt = self.conn.prepare(
            "SELECT ChangeID, TableName, RecordID, Operation, TimestampUtc, Synchronized
             FROM ChangeLog
             WHERE TableName = ?1 AND Synchronized = 0
             ORDER BY ChangeID ASC
             LIMIT ?2",
        )?;
        let rows = stmt.query_map(params![table_name, limit], row_to_entry)?;
        let mut out = Vec::new();
        for r in rows {
            out.push(r?);
        }
        Ok(out)
    }

    pub fn get_unsynced_count(&self, table_name: &str) -> Result<i64> {
        Ok(self.conn.query_row(
            "SELECT COUNT(*) FROM ChangeLog WHERE TableName = ?1 AND Synchronized = 0",
            params![table_name],
            |r| r.get(0),
        )?)
    }

    pub fn mark_changes_as_synced(&self, change_ids: &[i64]) -> Result<()> {
        if change_ids.is_empty() {
            return Ok(());
        }
        let tx = self.conn.unchecked_transaction()?;
        for id in change_ids {
            tx.execute("UPDATE ChangeLog SET Synchronized = 1 WHERE ChangeID = ?1", params![id])?;
        }
        tx.commit()?;
        Ok(())
    }

    /// Looks up a single entry by id; used by the push engine to recheck
    /// state after a lock-contention retry (§4.5).
    pub fn get_entry(&self, change_id: i64) -> Result<Option<ChangeLogEntry>> {
        Ok(self
            .conn
            .query_row(
                "SELECT ChangeID, TableName, RecordID, Operation, TimestampUtc, Synchronized
                 FROM ChangeLog WHERE ChangeID = ?1",
                params![change_id],
                row_to_entry,
            )
            .optional()?)
    }
}

fn row_to_entry(row: &rusqlite::Row<'_>) -> rusqlite::Result<ChangeLogEntry> {
    let timestamp_raw: String = row.get(4)?;
    let timestamp_utc = DateTime::parse_from_rfc3339(&timestamp_raw)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now());
    let synchronized: i64 = row.get(5)?;
    Ok(ChangeLogEntry {
        change_id: row.get(0)?,
        table_name: row.get(1)?,
        record_id: row.get(2)?,
        operation: row.get(3)?,
        timestamp_utc,
        synchronized: synchronized != 0,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store(conn: &Connection) -> ChangeLogStore<'_> {
        let store = ChangeLogStore::new(conn);
        store.init_schema().unwrap();
        store
    }

    #[test]
    fn encodes_and_decodes_update_columns() {
        let op = encode_operation(OperationKind::Update, &["Kpi".into(), "Comment".into()]);
        assert_eq!(op, "UPDATE(Kpi,Comment)");
        let entry = ChangeLogEntry {
            change_id: 1,
            table_name: "T_Reconciliation".into(),
            record_id: "R1".into(),
            operation: op,
            timestamp_utc: Utc::now(),
            synchronized: false,
        };
        assert_eq!(entry.operation_kind(), OperationKind::Update);
        assert_eq!(entry.changed_columns(), vec!["Kpi".to_string(), "Comment".to_string()]);
    }

    #[test]
    fn insert_and_delete_have_no_column_list() {
        let entry = ChangeLogEntry {
            change_id: 1,
            table_name: "T_Reconciliation".into(),
            record_id: "R1".into(),
            operation: "INSERT".into(),
            timestamp_utc: Utc::now(),
            synchronized: false,
        };
        assert_eq!(entry.operation_kind(), OperationKind::Insert);
        assert!(entry.changed_columns().is_empty());
    }

    #[test]
    fn records_and_drains_unsynced_changes() {
        let conn = Connection::open_in_memory().unwrap();
        let store = store(&conn);
        let now = Utc::now();
        store.record_change("T_Reconciliation", "R1", OperationKind::Insert, &[], now).unwrap();
        store
            .record_change("T_Reconciliation", "R2", OperationKind::Update, &["Kpi".into()], now)
            .unwrap();

        assert_eq!(store.get_unsynced_count("T_Reconciliation").unwrap(), 2);
        let pending = store.get_unsynced_changes("T_Reconciliation", 10).unwrap();
        assert_eq!(pending.len(), 2);

        store.mark_changes_as_synced(&[pending[0].change_id]).unwrap();
        assert_eq!(store.get_unsynced_count("T_Reconciliation").unwrap(), 1);
    }
}
