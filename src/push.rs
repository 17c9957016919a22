use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use log::{debug, warn};
use parking_lot::Mutex as PLMutex;
use rusqlite::{params_from_iter, types::Value as SqlValue, Connection, OptionalExtension};

use crate::changelog::{ChangeLogEntry, ChangeLogStore, OperationKind};
use crate::entity::{Entity, SchemaCache, TableSchema};
use crate::error::{is_transient_message, Result, SyncError};
use crate::events::{SyncState, SyncStateChanged};
use crate::lock::{GlobalLockManager, DEFAULT_WAIT_BUDGET, MIN_LEASE_TTL};
use crate::value::{to_target_type, Value};

const MAX_RETRIES: u32 = 5;
const RETRY_BASE_BACKOFF: Duration = Duration::from_millis(200);
const WATCHDOG: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Default)]
pub struct PushOutcome {
    pub pushed: i64,
    pub conflicts: i64,
}

/// Replicates locally recorded, unsynced `ChangeLog` entries for one table
/// into the network (control-store) database, transactionally and in
/// `ChangeID` order (§4.5 Push Engine). A row load callback supplies the
/// current local row content for each change id.
pub struct PushEngine<'a> {
    local: &'a Connection,
    remote: &'a Connection,
    schemas: &'a SchemaCache,
    control: Arc<PLMutex<Connection>>,
}

impl<'a> PushEngine<'a> {
    pub fn new(
        local: &'a Connection,
        remote: &'a Connection,
        schemas: &'a SchemaCache,
        control: Arc<PLMutex<Connection>>,
    ) -> PushEngine<'a> {
        PushEngine { local, remote, schemas, control }
    }

    /// Pushes every pending `ChangeLog` entry for `table`, up to `limit`
    /// entries per call (§4.5 "PushPendingChanges"). Acquires the
    /// cross-process global lock for the duration of the push (§2, §5
    /// "only under the global lock") and releases it on return. Returns the
    /// number of entries successfully pushed and the number that lost to a
    /// conflict.
    pub fn push_pending_changes(
        &self,
        table: &str,
        country_id: &str,
        limit: i64,
        row_loader: impl Fn(&str) -> Result<Option<Entity>>,
    ) -> Result<PushOutcome> {
        let _lock = GlobalLockManager::acquire(self.control.clone(), "push", DEFAULT_WAIT_BUDGET, MIN_LEASE_TTL)?;

        let started = Instant::now();
        let changelog = ChangeLogStore::new(self.local);
        let entries = changelog.get_unsynced_changes(table, limit)?;
        if entries.is_empty() {
            return Ok(PushOutcome::default());
        }

        let remote_schema = self.schemas.get_or_load(self.remote, table)?;
        let mut outcome = PushOutcome::default();
        let mut pushed_ids = Vec::new();

        for entry in &entries {
            if started.elapsed() > WATCHDOG {
                warn!("push watchdog tripped for {table}/{country_id} after {} entries", pushed_ids.len());
                break;
            }
            match self.push_one(&remote_schema, table, entry, &row_loader) {
                Ok(true) => {
                    pushed_ids.push(entry.change_id);
                    outcome.pushed += 1;
                }
                Ok(false) => {
                    outcome.conflicts += 1;
                }
                Err(e) => {
                    warn!("push failed for {table}/{} change {}: {e}", entry.record_id, entry.change_id);
                    return Err(e);
                }
            }
        }

        changelog.mark_changes_as_synced(&pushed_ids)?;
        emit_state(country_id, &outcome);
        Ok(outcome)
    }

    fn push_one(
        &self,
        remote_schema: &TableSchema,
        table: &str,
        entry: &ChangeLogEntry,
        row_loader: &impl Fn(&str) -> Result<Option<Entity>>,
    ) -> Result<bool> {
        let mut attempt = 0;
        loop {
            let result = self.try_push_one(remote_schema, table, entry, row_loader);
            match result {
                Ok(applied) => return Ok(applied),
                Err(e) if attempt + 1 < MAX_RETRIES && is_retryable(&e) => {
                    attempt += 1;
                    debug!("retrying push of change {} (attempt {attempt})", entry.change_id);
                    std::thread::sleep(RETRY_BASE_BACKOFF * attempt);
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn try_push_one(
        &self,
        remote_schema: &TableSchema,
        table: &str,
        entry: &ChangeLogEntry,
        row_loader: &impl Fn(&str) -> Result<Option<Entity>>,
    ) -> Result<bool> {
        let tx = self.remote.unchecked_transaction()?;

        match entry.operation_kind() {
            OperationKind::Delete => {
                soft_delete(&tx, remote_schema, table, &entry.record_id)?;
                tx.commit()?;
                return Ok(true);
            }
            OperationKind::Insert | OperationKind::Update => {
                let Some(entity) = row_loader(&entry.record_id)? else {
                    tx.commit()?;
                    return Ok(true);
                };

                let existing_version: Option<i64> = tx
                    .query_row(
                        &format!(
                            "SELECT Version FROM \"{table}\" WHERE \"{}\" = ?1",
                            remote_schema.primary_key
                        ),
                        [&entry.record_id],
                        |r| r.get(0),
                    )
                    .optional()?;

                let next_version = existing_version.unwrap_or(0) + 1;
                let columns: Vec<&String> = match entry.operation_kind() {
                    OperationKind::Update if !entry.changed_columns().is_empty() => {
                        let changed = entry.changed_columns();
                        remote_schema
                            .columns
                            .iter()
                            .map(|c| &c.name)
                            .filter(|n| changed.iter().any(|c| c.eq_ignore_ascii_case(n)))
                            .collect()
                    }
                    _ => remote_schema
                        .columns
                        .iter()
                        .map(|c| &c.name)
                        .filter(|n| entity.columns.contains_key(*n))
                        .collect(),
                };

                if existing_version.is_some() {
                    upsert_update(&tx, table, remote_schema, &entity, &columns, &entry.record_id, next_version)?;
                } else {
                    upsert_insert(&tx, table, remote_schema, &entity, &columns, next_version)?;
                }
                tx.commit()?;
                Ok(true)
            }
        }
    }
}

fn soft_delete(tx: &rusqlite::Transaction<'_>, schema: &TableSchema, table: &str, record_id: &str) -> Result<()> {
    if schema.has_column("IsDeleted") {
        let sql = format!(
            "UPDATE \"{table}\" SET IsDeleted = 1, DeleteDate = ?1 WHERE \"{}\" = ?2",
            schema.primary_key
        );
        tx.execute(&sql, rusqlite::params![Utc::now().to_rfc3339(), record_id])?;
    } else {
        let sql = format!("DELETE FROM \"{table}\" WHERE \"{}\" = ?1", schema.primary_key);
        tx.execute(&sql, [record_id])?;
    }
    Ok(())
}

fn upsert_insert(
    tx: &rusqlite::Transaction<'_>,
    table: &str,
    schema: &TableSchema,
    entity: &Entity,
    columns: &[&String],
    version: i64,
) -> Result<()> {
    let mut names: Vec<String> = columns.iter().map(|n| (*n).clone()).collect();
    let mut values = bound_values(entity, schema, columns);
    if schema.has_column("Version") && !names.iter().any(|n| n.eq_ignore_ascii_case("Version")) {
        names.push("Version".to_string());
        values.push(SqlValue::Integer(version));
    }
    let columns_sql = names.iter().map(|n| format!("\"{n}\"")).collect::<Vec<_>>().join(", ");
    let placeholders = names.iter().map(|_| "?").collect::<Vec<_>>().join(", ");
    let sql = format!("INSERT INTO \"{table}\" ({columns_sql}) VALUES ({placeholders})");
    tx.execute(&sql, params_from_iter(values.iter()))?;
    Ok(())
}

fn upsert_update(
    tx: &rusqlite::Transaction<'_>,
    table: &str,
    schema: &TableSchema,
    entity: &Entity,
    columns: &[&String],
    record_id: &str,
    version: i64,
) -> Result<()> {
    let mut assignments: Vec<String> = columns.iter().map(|n| format!("\"{n}\" = ?")).collect();
    let mut values = bound_values(entity, schema, columns);
    if schema.has_column("Version") {
        assignments.push("Version = ?".to_string());
        values.push(SqlValue::Integer(version));
    }
    let sql = format!(
        "UPDATE \"{table}\" SET {} WHERE \"{}\" = ?",
        assignments.join(", "),
        schema.primary_key
    );
    values.push(SqlValue::Text(record_id.to_string()));
    tx.execute(&sql, params_from_iter(values.iter()))?;
    Ok(())
}

fn bound_values(entity: &Entity, schema: &TableSchema, columns: &[&String]) -> Vec<SqlValue> {
    columns
        .iter()
        .map(|name| {
            let value = entity.columns.get(*name).cloned().unwrap_or(Value::Null);
            let coerced = to_target_type(&value, schema.column_type(name));
            match coerced {
                Value::Null => SqlValue::Null,
                Value::Integer(i) => SqlValue::Integer(i),
                Value::Real(r) => SqlValue::Real(r),
                Value::Bool(b) => SqlValue::Integer(i64::from(b)),
                Value::Text(s) => SqlValue::Text(s),
                Value::DateTime(dt) => SqlValue::Text(dt.to_rfc3339()),
                Value::Blob(b) => SqlValue::Blob(b),
            }
        })
        .collect()
}

fn is_retryable(err: &SyncError) -> bool {
    err.is_transient() || is_transient_message(&err.to_string())
}

fn emit_state(country_id: &str, outcome: &PushOutcome) {
    let event = SyncStateChanged {
        country_id: country_id.to_string(),
        state: if outcome.conflicts > 0 { SyncState::Error } else { SyncState::UpToDate },
        pending_count: outcome.conflicts,
        last_error: None,
        timestamp_utc: Utc::now(),
    };
    debug!("{event:?}");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::changelog::ChangeLogStore as Log;

    fn schema_conn() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch(
            r#"
CREATE TABLE T_Reconciliation (
    ID TEXT PRIMARY KEY,
    Kpi INTEGER,
    IsDeleted INTEGER DEFAULT 0,
    DeleteDate TEXT,
    Version INTEGER
);
"#,
        )
        .unwrap();
        conn
    }

    fn control_conn() -> Arc<PLMutex<Connection>> {
        Arc::new(PLMutex::new(Connection::open_in_memory().unwrap()))
    }

    #[test]
    fn pushes_pending_insert_into_remote() {
        let local = schema_conn();
        let remote = schema_conn();
        let schemas = SchemaCache::new();
        let control = control_conn();

        let log = Log::new(&local);
        log.init_schema().unwrap();
        log.record_change("T_Reconciliation", "R1", OperationKind::Insert, &[], Utc::now())
            .unwrap();

        let mut entity = Entity::new();
        entity.set("ID", Value::Text("R1".into()));
        entity.set("Kpi", Value::Integer(7));

        let engine = PushEngine::new(&local, &remote, &schemas, control);
        let outcome = engine
            .push_pending_changes("T_Reconciliation", "FR", 10, |_id| Ok(Some(entity.clone())))
            .unwrap();
        assert_eq!(outcome.pushed, 1);

        let kpi: i64 = remote
            .query_row("SELECT Kpi FROM T_Reconciliation WHERE ID = 'R1'", [], |r| r.get(0))
            .unwrap();
        assert_eq!(kpi, 7);

        assert_eq!(log.get_unsynced_count("T_Reconciliation").unwrap(), 0);
    }

    #[test]
    fn push_delete_sets_soft_delete_flag() {
        let local = schema_conn();
        let remote = schema_conn();
        remote
            .execute(
                "INSERT INTO T_Reconciliation (ID, Kpi, Version) VALUES ('R1', 1, 1)",
                [],
            )
            .unwrap();
        let schemas = SchemaCache::new();
        let control = control_conn();

        let log = Log::new(&local);
        log.init_schema().unwrap();
        log.record_change("T_Reconciliation", "R1", OperationKind::Delete, &[], Utc::now())
            .unwrap();

        let engine = PushEngine::new(&local, &remote, &schemas, control);
        let outcome = engine
            .push_pending_changes("T_Reconciliation", "FR", 10, |_id| Ok(None))
            .unwrap();
        assert_eq!(outcome.pushed, 1);

        let is_deleted: i64 = remote
            .query_row("SELECT IsDeleted FROM T_Reconciliation WHERE ID = 'R1'", [], |r| r.get(0))
            .unwrap();
        assert_eq!(is_deleted, 1);
    }
}
