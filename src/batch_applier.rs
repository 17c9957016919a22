use std::collections::HashMap;
use std::time::Duration;

use chrono::Utc;
use crc32fast::Hasher;
use rusqlite::{params_from_iter, types::Value as SqlValue, Connection};

use crate::changelog::{ChangeLogStore, OperationKind};
use crate::entity::{Entity, SchemaCache, TableSchema};
use crate::error::{is_transient_message, Result, SyncError};
use crate::value::Value;

const MAX_RETRIES: u32 = 4;
const RETRY_BACKOFF: Duration = Duration::from_millis(250);
const CRC_CHUNK_SIZE: usize = 200;

/// Columns excluded from the CRC32 fingerprint used to decide whether an
/// incoming row is a no-op UPDATE (§4.4, §9 "CRC32 excludes PK, CRC,
/// LastModified, IsDeleted, DeleteDate, CreationDate, ModifiedBy, Version").
const EXCLUDED_CRC_COLUMNS: &[&str] = &[
    "CRC",
    "LastModified",
    "IsDeleted",
    "DeleteDate",
    "CreationDate",
    "ModifiedBy",
    "Version",
];

/// Computes the CRC32 fingerprint of a row's non-excluded, non-primary-key
/// columns. Column names are sorted case-insensitively and values are
/// joined with the ASCII unit separator (0x1F) before hashing, so column
/// reordering never changes the fingerprint.
pub fn compute_row_crc(entity: &Entity, schema: &TableSchema) -> u32 {
    let mut names: Vec<&String> = entity
        .columns
        .keys()
        .filter(|name| !name.eq_ignore_ascii_case(&schema.primary_key))
        .filter(|name| !EXCLUDED_CRC_COLUMNS.iter().any(|ex| name.eq_ignore_ascii_case(ex)))
        .collect();
    names.sort_by_key(|n| n.to_ascii_lowercase());

    let mut hasher = Hasher::new();
    for name in names {
        let value = entity.columns.get(name).unwrap_or(&Value::Null);
        hasher.update(serialize_for_crc(value).as_bytes());
        hasher.update(&[0x1F]);
    }
    hasher.finalize()
}

fn serialize_for_crc(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::Integer(i) => i.to_string(),
        Value::Real(r) => r.to_string(),
        Value::Bool(b) => b.to_string(),
        Value::Text(s) => s.clone(),
        Value::DateTime(dt) => dt.to_rfc3339(),
        Value::Blob(b) => b.iter().map(|byte| format!("{byte:02x}")).collect(),
    }
}

#[derive(Debug, Clone, Default)]
pub struct ImportRunStats {
    pub rows_inserted: i64,
    pub rows_updated: i64,
    pub rows_skipped: i64,
    pub rows_archived: i64,
}

/// Writes a batch of incoming rows (from an AMBRE import, a pull, or any
/// other bulk producer) into one table in a single transaction, emitting
/// change-log entries and bracketing the work with an `ImportRun` audit
/// record (§3 ImportRun, §4.4 Batch Applier).
pub struct BatchApplier<'c> {
    conn: &'c Connection,
    schemas: &'c SchemaCache,
}

impl<'c> BatchApplier<'c> {
    pub fn new(conn: &'c Connection, schemas: &'c SchemaCache) -> BatchApplier<'c> {
        BatchApplier { conn, schemas }
    }

    /// Applies `{to_add, to_update, to_archive}` to `table` in a single
    /// transaction (§4.4). `to_add`/`to_update` are merged and classified
    /// by CRC presence rather than trusting the caller's split, since a row
    /// the caller labeled "add" may already exist after a prior partial
    /// run; `to_archive` rows are soft-deleted (or hard-deleted if the
    /// table has no `IsDeleted` column) by primary key. Records one
    /// `ChangeLog` entry per inserted/updated/archived row unless
    /// `suppress_change_log` is set (§4.4 "unless suppressed").
    pub fn apply_batch(
        &self,
        table: &str,
        country_id: &str,
        to_add: Vec<Entity>,
        to_update: Vec<Entity>,
        to_archive: Vec<Entity>,
        suppress_change_log: bool,
    ) -> Result<ImportRunStats> {
        let schema = self.schemas.get_or_load(self.conn, table)?;
        let run_id = begin_import_run(self.conn, country_id, table)?;

        let mut upserts = to_add;
        upserts.extend(to_update);

        let result = self.apply_with_retry(&schema, table, upserts, to_archive, suppress_change_log);

        match &result {
            Ok(stats) => finish_import_run(self.conn, run_id, stats, None)?,
            Err(e) => finish_import_run(self.conn, run_id, &ImportRunStats::default(), Some(&e.to_string()))?,
        }
        result
    }

    fn apply_with_retry(
        &self,
        schema: &TableSchema,
        table: &str,
        upserts: Vec<Entity>,
        to_archive: Vec<Entity>,
        suppress_change_log: bool,
    ) -> Result<ImportRunStats> {
        let mut attempt = 0;
        loop {
            match self.apply_once(schema, table, &upserts, &to_archive, suppress_change_log) {
                Ok(stats) => return Ok(stats),
                Err(e) if attempt + 1 < MAX_RETRIES && is_retryable(&e) => {
                    attempt += 1;
                    std::thread::sleep(RETRY_BACKOFF * attempt);
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn apply_once(
        &self,
        schema: &TableSchema,
        table: &str,
        upserts: &[Entity],
        to_archive: &[Entity],
        suppress_change_log: bool,
    ) -> Result<ImportRunStats> {
        let existing_crcs = self.fetch_existing_crcs(schema, table, upserts)?;
        let tx = self.conn.unchecked_transaction()?;
        let changelog = ChangeLogStore::new(&tx);
        if !suppress_change_log {
            changelog.init_schema()?;
        }
        let when = Utc::now();
        let mut stats = ImportRunStats::default();

        for entity in upserts {
            let Some(pk) = entity.pk_string(schema) else {
                continue;
            };

            match existing_crcs.get(&pk) {
                None => {
                    let mut stamped = entity.clone();
                    stamp_for_insert(&mut stamped, schema, when);
                    let column_names: Vec<&String> = schema
                        .columns
                        .iter()
                        .map(|c| &c.name)
                        .filter(|n| stamped.columns.contains_key(*n))
                        .collect();
                    if column_names.is_empty() {
                        continue;
                    }
                    insert_row(&tx, table, schema, &stamped, &column_names)?;
                    stats.rows_inserted += 1;
                    if !suppress_change_log {
                        changelog.record_change(table, &pk, OperationKind::Insert, &[], when)?;
                    }
                }
                Some(existing_crc) => {
                    let column_names: Vec<&String> = schema
                        .columns
                        .iter()
                        .map(|c| &c.name)
                        .filter(|n| entity.columns.contains_key(*n))
                        .collect();
                    if column_names.is_empty() {
                        continue;
                    }
                    let new_crc = compute_row_crc(entity, schema);
                    if new_crc == *existing_crc {
                        stats.rows_skipped += 1;
                        continue;
                    }
                    let changed = column_names.iter().map(|n| (*n).clone()).collect::<Vec<_>>();
                    update_row(&tx, table, schema, entity, &column_names, &pk)?;
                    stats.rows_updated += 1;
                    if !suppress_change_log {
                        changelog.record_change(table, &pk, OperationKind::Update, &changed, when)?;
                    }
                }
            }
        }

        for entity in to_archive {
            let Some(pk) = entity.pk_string(schema) else {
                continue;
            };
            archive_row(&tx, table, schema, &pk, when)?;
            stats.rows_archived += 1;
            if !suppress_change_log {
                changelog.record_change(table, &pk, OperationKind::Delete, &[], when)?;
            }
        }

        tx.commit()?;
        Ok(stats)
    }

    /// Prefetches existing CRCs for the rows about to be applied, in
    /// chunks of `CRC_CHUNK_SIZE` primary keys per `IN (...)` query
    /// (§4.4 "chunked CRC pre-fetch, 200 keys").
    fn fetch_existing_crcs(
        &self,
        schema: &TableSchema,
        table: &str,
        rows: &[Entity],
    ) -> Result<HashMap<String, u32>> {
        let mut out = HashMap::new();
        if !schema.has_column("CRC") {
            return Ok(out);
        }
        let pks: Vec<String> = rows.iter().filter_map(|e| e.pk_string(schema)).collect();
        for chunk in pks.chunks(CRC_CHUNK_SIZE) {
            if chunk.is_empty() {
                continue;
            }
            let placeholders = chunk.iter().map(|_| "?").collect::<Vec<_>>().join(",");
            let sql = format!(
                "SELECT \"{}\", CRC FROM \"{}\" WHERE \"{}\" IN ({})",
                schema.primary_key, table, schema.primary_key, placeholders
            );
            let mut stmt = self.conn.prepare(&sql)?;
            let args = params_from_iter(chunk.iter());
            let mapped = stmt.query_map(args, |row| {
                let pk: String = row.get(0)?;
                let crc: i64 = row.get(1)?;
                Ok((pk, crc as u32))
            })?;
            for r in mapped {
                let (pk, crc) = r?;
                out.insert(pk, crc);
            }
        }
        Ok(out)
    }
}

/// Stamps `LastModified`/`IsDeleted`/`DeleteDate` on a row about to be
/// inserted, regardless of what the caller's entity already carries
/// (§4.4 "on insert the applier itself stamps LastModified=now,
/// IsDeleted=false, DeleteDate=null").
fn stamp_for_insert(entity: &mut Entity, schema: &TableSchema, when: chrono::DateTime<Utc>) {
    if schema.has_column("LastModified") {
        entity.set("LastModified", Value::DateTime(when));
    }
    if schema.has_column("IsDeleted") {
        entity.set("IsDeleted", Value::Bool(false));
    }
    if schema.has_column("DeleteDate") {
        entity.set("DeleteDate", Value::Null);
    }
}

fn archive_row(
    tx: &rusqlite::Transaction<'_>,
    table: &str,
    schema: &TableSchema,
    pk: &str,
    when: chrono::DateTime<Utc>,
) -> Result<()> {
    if schema.has_column("IsDeleted") {
        let mut assignments = vec!["IsDeleted = 1".to_string()];
        let mut values = Vec::new();
        if schema.has_column("DeleteDate") {
            assignments.push("DeleteDate = ?".to_string());
            values.push(SqlValue::Text(when.to_rfc3339()));
        }
        if schema.has_column("LastModified") {
            assignments.push("LastModified = ?".to_string());
            values.push(SqlValue::Text(when.to_rfc3339()));
        }
        let sql = format!("UPDATE \"{table}\" SET {} WHERE \"{}\" = ?", assignments.join(", "), schema.primary_key);
        values.push(SqlValue::Text(pk.to_string()));
        tx.execute(&sql, params_from_iter(values.iter()))?;
    } else {
        let sql = format!("DELETE FROM \"{table}\" WHERE \"{}\" = ?1", schema.primary_key);
        tx.execute(&sql, [pk])?;
    }
    Ok(())
}

fn is_retryable(err: &SyncError) -> bool {
    err.is_transient() || is_transient_message(&err.to_string())
}

fn insert_row(
    tx: &rusqlite::Transaction<'_>,
    table: &str,
    schema: &TableSchema,
    entity: &Entity,
    column_names: &[&String],
) -> Result<()> {
    let columns_sql = column_names
        .iter()
        .map(|n| format!("\"{n}\""))
        .collect::<Vec<_>>()
        .join(", ");
    let placeholders = column_names.iter().map(|_| "?").collect::<Vec<_>>().join(", ");
    let sql = format!("INSERT INTO \"{table}\" ({columns_sql}) VALUES ({placeholders})");
    let values = bound_values(entity, schema, column_names);
    tx.execute(&sql, params_from_iter(values.iter()))?;
    Ok(())
}

fn update_row(
    tx: &rusqlite::Transaction<'_>,
    table: &str,
    schema: &TableSchema,
    entity: &Entity,
    column_names: &[&String],
    pk: &str,
) -> Result<()> {
    let assignments = column_names
        .iter()
        .map(|n| format!("\"{n}\" = ?"))
        .collect::<Vec<_>>()
        .join(", ");
    let sql = format!(
        "UPDATE \"{table}\" SET {assignments} WHERE \"{}\" = ?",
        schema.primary_key
    );
    let mut values = bound_values(entity, schema, column_names);
    values.push(SqlValue::Text(pk.to_string()));
    tx.execute(&sql, params_from_iter(values.iter()))?;
    Ok(())
}

fn bound_values(entity: &Entity, schema: &TableSchema, column_names: &[&String]) -> Vec<SqlValue> {
    column_names
        .iter()
        .map(|name| {
            let value = entity.columns.get(*name).cloned().unwrap_or(Value::Null);
            let target_type = schema.column_type(name);
            let coerced = crate::value::to_target_type(&value, target_type);
            to_sql_value(&coerced)
        })
        .collect()
}

fn to_sql_value(value: &Value) -> SqlValue {
    match value {
        Value::Null => SqlValue::Null,
        Value::Integer(i) => SqlValue::Integer(*i),
        Value::Real(r) => SqlValue::Real(*r),
        Value::Bool(b) => SqlValue::Integer(i64::from(*b)),
        Value::Text(s) => SqlValue::Text(s.clone()),
        Value::DateTime(dt) => SqlValue::Text(dt.to_rfc3339()),
        Value::Blob(b) => SqlValue::Blob(b.clone()),
    }
}

fn begin_import_run(conn: &Connection, country_id: &str, table: &str) -> Result<i64> {
    conn.execute_batch(
        r#"
CREATE TABLE IF NOT EXISTS ImportRun (
    RunID INTEGER PRIMARY KEY AUTOINCREMENT,
    CountryID TEXT NOT NULL,
    TableName TEXT NOT NULL,
    StartedAtUtc TEXT NOT NULL,
    FinishedAtUtc TEXT,
    RowsInserted INTEGER NOT NULL DEFAULT 0,
    RowsUpdated INTEGER NOT NULL DEFAULT 0,
    RowsArchived INTEGER NOT NULL DEFAULT 0,
    Outcome TEXT,
    ErrorMessage TEXT
);
"#,
    )?;
    conn.execute(
        "INSERT INTO ImportRun (CountryID, TableName, StartedAtUtc) VALUES (?1, ?2, ?3)",
        rusqlite::params![country_id, table, Utc::now().to_rfc3339()],
    )?;
    Ok(conn.last_insert_rowid())
}

fn finish_import_run(
    conn: &Connection,
    run_id: i64,
    stats: &ImportRunStats,
    error_message: Option<&str>,
) -> Result<()> {
    let outcome = if error_message.is_some() { "Failed" } else { "Succeeded" };
    conn.execute(
        "UPDATE ImportRun SET FinishedAtUtc = ?1, RowsInserted = ?2, RowsUpdated = ?3,
         RowsArchived = ?4, Outcome = ?5, ErrorMessage = ?6 WHERE RunID = ?7",
        rusqlite::params![
            Utc::now().to_rfc3339(),
            stats.rows_inserted,
            stats.rows_updated,
            stats.rows_archived,
            outcome,
            error_message,
            run_id,
        ],
    )?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn setup() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch(
            r#"
CREATE TABLE T_Reconciliation (
    ID TEXT PRIMARY KEY,
    Kpi INTEGER,
    Comment TEXT,
    CRC INTEGER,
    IsDeleted INTEGER DEFAULT 0,
    DeleteDate TEXT,
    LastModified TEXT,
    Version INTEGER
);
"#,
        )
        .unwrap();
        conn
    }

    fn entity(id: &str, kpi: i64, comment: &str) -> Entity {
        let mut e = Entity::new();
        e.set("ID", Value::Text(id.into()));
        e.set("Kpi", Value::Integer(kpi));
        e.set("Comment", Value::Text(comment.into()));
        e.set("CRC", Value::Integer(0));
        e.set("LastModified", Value::DateTime(Utc::now()));
        e.set("Version", Value::Integer(1));
        e
    }

    #[test]
    fn crc_excludes_bookkeeping_columns() {
        let conn = setup();
        let schema = TableSchema::load(&conn, "T_Reconciliation").unwrap();
        let mut a = entity("R1", 10, "hello");
        let mut b = a.clone();
        b.set("Version", Value::Integer(99));
        b.set("LastModified", Value::DateTime(Utc::now() + chrono::Duration::days(1)));
        assert_eq!(compute_row_crc(&a, &schema), compute_row_crc(&b, &schema));

        a.set("Kpi", Value::Integer(11));
        assert_ne!(compute_row_crc(&a, &schema), compute_row_crc(&b, &schema));
    }

    #[test]
    fn apply_batch_inserts_then_skips_identical_update() {
        let conn = setup();
        let schemas = SchemaCache::new();
        let applier = BatchApplier::new(&conn, &schemas);

        let row = entity("R1", 5, "first");
        let crc = {
            let schema = TableSchema::load(&conn, "T_Reconciliation").unwrap();
            compute_row_crc(&row, &schema)
        };
        let mut row_with_crc = row.clone();
        row_with_crc.set("CRC", Value::Integer(crc as i64));

        let stats = applier
            .apply_batch("T_Reconciliation", "FR", vec![row_with_crc.clone()], vec![], vec![], false)
            .unwrap();
        assert_eq!(stats.rows_inserted, 1);

        let stats2 = applier
            .apply_batch("T_Reconciliation", "FR", vec![], vec![row_with_crc], vec![], false)
            .unwrap();
        assert_eq!(stats2.rows_skipped, 1);
        assert_eq!(stats2.rows_updated, 0);
    }

    #[test]
    fn apply_batch_updates_when_crc_differs() {
        let conn = setup();
        let schemas = SchemaCache::new();
        let applier = BatchApplier::new(&conn, &schemas);

        let row = entity("R1", 5, "first");
        applier.apply_batch("T_Reconciliation", "FR", vec![row], vec![], vec![], false).unwrap();

        let changed = entity("R1", 99, "changed");
        let stats = applier.apply_batch("T_Reconciliation", "FR", vec![], vec![changed], vec![], false).unwrap();
        assert_eq!(stats.rows_updated, 1);

        let kpi: i64 = conn
            .query_row("SELECT Kpi FROM T_Reconciliation WHERE ID = 'R1'", [], |r| r.get(0))
            .unwrap();
        assert_eq!(kpi, 99);
    }

    #[test]
    fn insert_stamps_last_modified_and_clears_delete_markers() {
        let conn = setup();
        let schemas = SchemaCache::new();
        let applier = BatchApplier::new(&conn, &schemas);

        let mut row = Entity::new();
        row.set("ID", Value::Text("R2".into()));
        row.set("Kpi", Value::Integer(1));

        applier.apply_batch("T_Reconciliation", "FR", vec![row], vec![], vec![], false).unwrap();

        let (is_deleted, last_modified): (i64, Option<String>) = conn
            .query_row("SELECT IsDeleted, LastModified FROM T_Reconciliation WHERE ID = 'R2'", [], |r| {
                Ok((r.get(0)?, r.get(1)?))
            })
            .unwrap();
        assert_eq!(is_deleted, 0);
        assert!(last_modified.is_some());
    }

    #[test]
    fn archive_soft_deletes_and_increments_stats() {
        let conn = setup();
        let schemas = SchemaCache::new();
        let applier = BatchApplier::new(&conn, &schemas);

        let row = entity("R3", 5, "first");
        applier.apply_batch("T_Reconciliation", "FR", vec![row], vec![], vec![], false).unwrap();

        let mut archived = Entity::new();
        archived.set("ID", Value::Text("R3".into()));
        let stats = applier.apply_batch("T_Reconciliation", "FR", vec![], vec![], vec![archived], false).unwrap();
        assert_eq!(stats.rows_archived, 1);

        let is_deleted: i64 = conn
            .query_row("SELECT IsDeleted FROM T_Reconciliation WHERE ID = 'R3'", [], |r| r.get(0))
            .unwrap();
        assert_eq!(is_deleted, 1);
    }

    #[test]
    fn archive_hard_deletes_when_no_soft_delete_columns() {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch("CREATE TABLE T_Plain (ID TEXT PRIMARY KEY, Kpi INTEGER);").unwrap();
        let schemas = SchemaCache::new();
        let applier = BatchApplier::new(&conn, &schemas);

        let mut row = Entity::new();
        row.set("ID", Value::Text("R4".into()));
        row.set("Kpi", Value::Integer(1));
        applier.apply_batch("T_Plain", "FR", vec![row], vec![], vec![], false).unwrap();

        let mut archived = Entity::new();
        archived.set("ID", Value::Text("R4".into()));
        let stats = applier.apply_batch("T_Plain", "FR", vec![], vec![], vec![archived], false).unwrap();
        assert_eq!(stats.rows_archived, 1);

        let count: i64 = conn.query_row("SELECT COUNT(*) FROM T_Plain", [], |r| r.get(0)).unwrap();
        assert_eq!(count, 0);
    }
}
