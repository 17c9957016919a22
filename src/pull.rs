use chrono::{DateTime, Duration as ChronoDuration, Utc};
use rusqlite::{params_from_iter, types::Value as SqlValue, Connection};

use crate::entity::{Entity, SchemaCache, TableSchema};
use crate::error::Result;
use crate::value::{to_target_type, Value};
use crate::watermark::{self, SyncWatermark};

/// Tolerance applied when comparing a remote row's `LastModified` against
/// the local watermark before falling back to `Version` (§4.6 "2 second
/// tolerance, then Version fallback").
const TIMESTAMP_TOLERANCE: ChronoDuration = ChronoDuration::seconds(2);

#[derive(Debug, Clone, Default)]
pub struct PullOutcome {
    pub inserted: i64,
    pub updated: i64,
    pub new_watermark: Option<DateTime<Utc>>,
    pub new_watermark_version: Option<i64>,
}

/// Scans a network (control-store) table for rows changed since the last
/// watermark and applies them locally (§4.6 Pull Engine). The scan column
/// is whichever of `LastModified`/`Version` both schemas share. The
/// watermark itself is tracked internally via `_SyncConfig` (§3, §6)
/// rather than supplied by the caller.
pub struct PullEngine<'a> {
    remote: &'a Connection,
    local: &'a Connection,
    schemas: &'a SchemaCache,
}

impl<'a> PullEngine<'a> {
    pub fn new(remote: &'a Connection, local: &'a Connection, schemas: &'a SchemaCache) -> PullEngine<'a> {
        PullEngine { remote, local, schemas }
    }

    pub fn pull_since(&self, table: &str, limit: i64) -> Result<PullOutcome> {
        let remote_schema = self.schemas.get_or_load(self.remote, table)?;
        let local_schema = self.schemas.get_or_load(self.local, table)?;
        let shared_columns = intersect_columns(&remote_schema, &local_schema);

        let stored = watermark::load_watermark(self.local, table)?;
        let rows = self.scan(table, &remote_schema, &shared_columns, &stored, limit)?;
        let mut outcome = PullOutcome::default();
        let mut bumped = stored.clone();

        let tx = self.local.unchecked_transaction()?;
        for entity in &rows {
            let Some(pk) = entity.pk_string(&local_schema) else {
                continue;
            };
            let exists: Option<i64> = tx
                .query_row(
                    &format!("SELECT 1 FROM \"{table}\" WHERE \"{}\" = ?1", local_schema.primary_key),
                    [&pk],
                    |r| r.get(0),
                )
                .ok();
            if exists.is_some() {
                apply_update(&tx, table, &local_schema, entity, &shared_columns, &pk)?;
                outcome.updated += 1;
            } else {
                apply_insert(&tx, table, &local_schema, entity, &shared_columns)?;
                outcome.inserted += 1;
            }
            bump_watermark(&mut bumped, entity);
        }
        tx.commit()?;

        if bumped != stored {
            watermark::store_watermark(self.local, table, &bumped)?;
        }
        outcome.new_watermark = bumped.last_sync_timestamp;
        outcome.new_watermark_version = bumped.last_sync_version;
        Ok(outcome)
    }

    fn scan(
        &self,
        table: &str,
        schema: &TableSchema,
        columns: &[String],
        watermark: &SyncWatermark,
        limit: i64,
    ) -> Result<Vec<Entity>> {
        let select_list = columns.iter().map(|c| format!("\"{c}\"")).collect::<Vec<_>>().join(", ");
        let has_last_modified = schema.has_column("LastModified");
        let has_version = schema.has_column("Version");

        let (where_clause, order_by) = match (has_last_modified, watermark.last_sync_timestamp) {
            (true, Some(ts)) => (
                format!("WHERE LastModified > '{}'", (ts - TIMESTAMP_TOLERANCE).to_rfc3339()),
                "ORDER BY LastModified ASC",
            ),
            (false, _) if has_version && watermark.last_sync_version.is_some() => {
                (format!("WHERE Version > {}", watermark.last_sync_version.unwrap()), "ORDER BY Version ASC")
            }
            _ => (String::new(), if has_last_modified { "ORDER BY LastModified ASC" } else { "" }),
        };

        let sql = format!("SELECT {select_list} FROM \"{table}\" {where_clause} {order_by} LIMIT {limit}");
        let mut stmt = self.remote.prepare(&sql)?;
        let column_names = columns.to_vec();
        let rows = stmt.query_map([], move |row| {
            let mut entity = Entity::new();
            for (idx, name) in column_names.iter().enumerate() {
                let v: Value = row.get(idx)?;
                entity.set(name.clone(), v);
            }
            Ok(entity)
        })?;

        let mut out = Vec::new();
        for r in rows {
            let entity = r?;
            if has_last_modified {
                if let Some(ts) = watermark.last_sync_timestamp {
                    if let Some(Value::DateTime(lm)) = entity.get("LastModified") {
                        if *lm <= ts - TIMESTAMP_TOLERANCE {
                            continue;
                        }
                    }
                }
            } else if has_version {
                if let Some(wm_version) = watermark.last_sync_version {
                    if let Some(version) = entity.get("Version") {
                        let version_i = match version {
                            Value::Integer(i) => *i,
                            _ => 0,
                        };
                        if version_i <= wm_version {
                            continue;
                        }
                    }
                }
            }
            out.push(entity);
        }
        Ok(out)
    }
}

fn intersect_columns(remote: &TableSchema, local: &TableSchema) -> Vec<String> {
    remote
        .columns
        .iter()
        .map(|c| &c.name)
        .filter(|name| local.has_column(name))
        .cloned()
        .collect()
}

fn bump_watermark(current: &mut SyncWatermark, entity: &Entity) {
    if let Some(Value::DateTime(lm)) = entity.get("LastModified") {
        if current.last_sync_timestamp.map(|c| *lm > c).unwrap_or(true) {
            current.last_sync_timestamp = Some(*lm);
        }
    }
    if let Some(Value::Integer(v)) = entity.get("Version") {
        if current.last_sync_version.map(|c| *v > c).unwrap_or(true) {
            current.last_sync_version = Some(*v);
        }
    }
}

fn apply_insert(
    tx: &rusqlite::Transaction<'_>,
    table: &str,
    schema: &TableSchema,
    entity: &Entity,
    columns: &[String],
) -> Result<()> {
    let present: Vec<&String> = columns.iter().filter(|c| entity.columns.contains_key(*c)).collect();
    let columns_sql = present.iter().map(|n| format!("\"{n}\"")).collect::<Vec<_>>().join(", ");
    let placeholders = present.iter().map(|_| "?").collect::<Vec<_>>().join(", ");
    let sql = format!("INSERT INTO \"{table}\" ({columns_sql}) VALUES ({placeholders})");
    let values = bound_values(entity, schema, &present);
    tx.execute(&sql, params_from_iter(values.iter()))?;
    Ok(())
}

fn apply_update(
    tx: &rusqlite::Transaction<'_>,
    table: &str,
    schema: &TableSchema,
    entity: &Entity,
    columns: &[String],
    pk: &str,
) -> Result<()> {
    let present: Vec<&String> = columns
        .iter()
        .filter(|c| entity.columns.contains_key(*c) && !c.eq_ignore_ascii_case(&schema.primary_key))
        .collect();
    if present.is_empty() {
        return Ok(());
    }
    let assignments = present.iter().map(|n| format!("\"{n}\" = ?")).collect::<Vec<_>>().join(", ");
    let sql = format!("UPDATE \"{table}\" SET {assignments} WHERE \"{}\" = ?", schema.primary_key);
    let mut values = bound_values(entity, schema, &present);
    values.push(SqlValue::Text(pk.to_string()));
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

#[cfg(test)]
mod tests {
    use super::*;

    fn schema_conn() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch(
            r#"
CREATE TABLE T_Reconciliation (
    ID TEXT PRIMARY KEY,
    Kpi INTEGER,
    LastModified TEXT,
    Version INTEGER
);
"#,
        )
        .unwrap();
        conn
    }

    #[test]
    fn pulls_new_rows_since_watermark() {
        let remote = schema_conn();
        let local = schema_conn();
        let schemas = SchemaCache::new();

        let old = Utc::now() - ChronoDuration::hours(2);
        let fresh = Utc::now();
        remote
            .execute(
                "INSERT INTO T_Reconciliation (ID, Kpi, LastModified, Version) VALUES ('R1', 1, ?1, 1)",
                [old.to_rfc3339()],
            )
            .unwrap();
        remote
            .execute(
                "INSERT INTO T_Reconciliation (ID, Kpi, LastModified, Version) VALUES ('R2', 2, ?1, 2)",
                [fresh.to_rfc3339()],
            )
            .unwrap();

        watermark::store_watermark(
            &local,
            "T_Reconciliation",
            &SyncWatermark { last_sync_timestamp: Some(old + ChronoDuration::seconds(30)), last_sync_version: None },
        )
        .unwrap();

        let engine = PullEngine::new(&remote, &local, &schemas);
        let outcome = engine.pull_since("T_Reconciliation", 100).unwrap();
        assert_eq!(outcome.inserted, 1);

        let count: i64 = local.query_row("SELECT COUNT(*) FROM T_Reconciliation", [], |r| r.get(0)).unwrap();
        assert_eq!(count, 1);
    }

    #[test]
    fn pulls_existing_rows_as_updates() {
        let remote = schema_conn();
        let local = schema_conn();
        let schemas = SchemaCache::new();
        local
            .execute(
                "INSERT INTO T_Reconciliation (ID, Kpi, LastModified, Version) VALUES ('R1', 1, ?1, 1)",
                [Utc::now().to_rfc3339()],
            )
            .unwrap();
        remote
            .execute(
                "INSERT INTO T_Reconciliation (ID, Kpi, LastModified, Version) VALUES ('R1', 42, ?1, 2)",
                [Utc::now().to_rfc3339()],
            )
            .unwrap();

        let engine = PullEngine::new(&remote, &local, &schemas);
        let outcome = engine.pull_since("T_Reconciliation", 100).unwrap();
        assert_eq!(outcome.updated, 1);
        let kpi: i64 = local.query_row("SELECT Kpi FROM T_Reconciliation WHERE ID='R1'", [], |r| r.get(0)).unwrap();
        assert_eq!(kpi, 42);
    }

    #[test]
    fn version_fallback_filters_out_already_seen_rows() {
        let remote = Connection::open_in_memory().unwrap();
        let local = Connection::open_in_memory().unwrap();
        for conn in [&remote, &local] {
            conn.execute_batch(
                "CREATE TABLE T_NoTimestamp (ID TEXT PRIMARY KEY, Kpi INTEGER, Version INTEGER);",
            )
            .unwrap();
        }
        let schemas = SchemaCache::new();

        remote.execute("INSERT INTO T_NoTimestamp (ID, Kpi, Version) VALUES ('R1', 1, 1)", []).unwrap();
        remote.execute("INSERT INTO T_NoTimestamp (ID, Kpi, Version) VALUES ('R2', 2, 2)", []).unwrap();

        watermark::store_watermark(
            &local,
            "T_NoTimestamp",
            &SyncWatermark { last_sync_timestamp: None, last_sync_version: Some(1) },
        )
        .unwrap();

        let engine = PullEngine::new(&remote, &local, &schemas);
        let outcome = engine.pull_since("T_NoTimestamp", 100).unwrap();
        assert_eq!(outcome.inserted, 1);
        assert_eq!(outcome.new_watermark_version, Some(2));
    }

    #[test]
    fn pull_persists_bumped_watermark_for_next_call() {
        let remote = schema_conn();
        let local = schema_conn();
        let schemas = SchemaCache::new();
        let fresh = Utc::now();
        remote
            .execute(
                "INSERT INTO T_Reconciliation (ID, Kpi, LastModified, Version) VALUES ('R1', 1, ?1, 1)",
                [fresh.to_rfc3339()],
            )
            .unwrap();

        let engine = PullEngine::new(&remote, &local, &schemas);
        engine.pull_since("T_Reconciliation", 100).unwrap();
        let again = engine.pull_since("T_Reconciliation", 100).unwrap();
        assert_eq!(again.inserted, 0);
        assert_eq!(again.updated, 0);
    }
}
