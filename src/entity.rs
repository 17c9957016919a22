use std::collections::{BTreeMap, HashMap};

use parking_lot::Mutex;
use rusqlite::Connection;

use crate::error::{Result, SyncError};
use crate::value::{ColumnType, Value};

#[derive(Debug, Clone)]
pub struct ColumnDef {
    pub name: String,
    pub sql_type: ColumnType,
    pub not_null: bool,
}

/// Per-table schema: column set, primary key, and column type map, loaded
/// once and cached (§4.4 "determines target schema once per table").
/// Records are keyed by a single primary key column; composite keys are
/// out of scope (§4.4).
#[derive(Debug, Clone)]
pub struct TableSchema {
    pub table: String,
    pub primary_key: String,
    pub columns: Vec<ColumnDef>,
}

impl TableSchema {
    pub fn load(conn: &Connection, table: &str) -> Result<TableSchema> {
        let mut stmt = conn.prepare(&format!("PRAGMA table_info(\"{table}\")"))?;
        let mut columns = Vec::new();
        let mut primary_key = None;
        let rows = stmt.query_map([], |row| {
            let name: String = row.get(1)?;
            let decl: String = row.get(2)?;
            let not_null: i64 = row.get(3)?;
            let pk: i64 = row.get(5)?;
            Ok((name, decl, not_null != 0, pk != 0))
        })?;
        for r in rows {
            let (name, decl, not_null, is_pk) = r?;
            if is_pk {
                primary_key = Some(name.clone());
            }
            columns.push(ColumnDef {
                name,
                sql_type: ColumnType::from_sql_decltype(&decl),
                not_null,
            });
        }
        if columns.is_empty() {
            return Err(SyncError::Fatal(format!("unknown table {table}")));
        }
        let primary_key = primary_key.unwrap_or_else(|| columns[0].name.clone());
        Ok(TableSchema { table: table.to_string(), primary_key, columns })
    }

    pub fn has_column(&self, name: &str) -> bool {
        self.columns.iter().any(|c| c.name.eq_ignore_ascii_case(name))
    }

    pub fn column_type(&self, name: &str) -> ColumnType {
        self.columns
            .iter()
            .find(|c| c.name.eq_ignore_ascii_case(name))
            .map(|c| c.sql_type)
            .unwrap_or(ColumnType::Unknown)
    }

    pub fn column_names(&self) -> Vec<String> {
        self.columns.iter().map(|c| c.name.clone()).collect()
    }
}

/// A row keyed by the owning table's primary key, carrying an open-ended
/// mapping of column name to typed value (§3 "Entity"). `BTreeMap` keeps
/// column order deterministic, which the CRC computation in §4.4 relies on.
#[derive(Debug, Clone, Default)]
pub struct Entity {
    pub columns: BTreeMap<String, Value>,
}

impl Entity {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.columns.get(name)
    }

    pub fn set(&mut self, name: impl Into<String>, value: Value) {
        self.columns.insert(name.into(), value);
    }

    pub fn pk_value(&self, schema: &TableSchema) -> Option<&Value> {
        self.columns.get(&schema.primary_key)
    }

    pub fn pk_string(&self, schema: &TableSchema) -> Option<String> {
        self.pk_value(schema).map(value_to_record_id)
    }
}

/// Stringifies a value the way a `RecordId` is stored in the change log:
/// text as-is, numbers via their decimal form, everything else best-effort.
pub fn value_to_record_id(v: &Value) -> String {
    match v {
        Value::Text(s) => s.clone(),
        Value::Integer(i) => i.to_string(),
        Value::Real(r) => r.to_string(),
        Value::Bool(b) => b.to_string(),
        Value::DateTime(dt) => dt.to_rfc3339(),
        Value::Blob(_) | Value::Null => String::new(),
    }
}

/// Caches `TableSchema` per `(table)` for the lifetime of the owning
/// connection handle (§9 "prepared-statement caches ... keyed by (table,
/// column signature)" — the schema cache is the same idea one level up).
pub struct SchemaCache {
    cache: Mutex<HashMap<String, TableSchema>>,
}

impl SchemaCache {
    pub fn new() -> Self {
        Self { cache: Mutex::new(HashMap::new()) }
    }

    pub fn get_or_load(&self, conn: &Connection, table: &str) -> Result<TableSchema> {
        if let Some(schema) = self.cache.lock().get(table) {
            return Ok(schema.clone());
        }
        let schema = TableSchema::load(conn, table)?;
        self.cache.lock().insert(table.to_string(), schema.clone());
        Ok(schema)
    }

    pub fn invalidate(&self, table: &str) {
        self.cache.lock().remove(table);
    }
}

impl Default for SchemaCache {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn memory_conn() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch(
            "CREATE TABLE t_reconciliation (
                id TEXT PRIMARY KEY,
                kpi INTEGER,
                last_modified TEXT,
                version INTEGER
            );",
        )
        .unwrap();
        conn
    }

    #[test]
    fn loads_schema_and_finds_primary_key() {
        let conn = memory_conn();
        let schema = TableSchema::load(&conn, "t_reconciliation").unwrap();
        assert_eq!(schema.primary_key, "id");
        assert!(schema.has_column("kpi"));
        assert_eq!(schema.column_type("version"), ColumnType::Integer);
    }

    #[test]
    fn schema_cache_loads_once() {
        let conn = memory_conn();
        let cache = SchemaCache::new();
        let first = cache.get_or_load(&conn, "t_reconciliation").unwrap();
        let second = cache.get_or_load(&conn, "t_reconciliation").unwrap();
        assert_eq!(first.primary_key, second.primary_key);
        cache.invalidate("t_reconciliation");
        assert!(cache.cache.lock().is_empty());
    }

    #[test]
    fn entity_pk_lookup() {
        let conn = memory_conn();
        let schema = TableSchema::load(&conn, "t_reconciliation").unwrap();
        let mut e = Entity::new();
        e.set("id", Value::Text("R1".into()));
        e.set("kpi", Value::Integer(10));
        assert_eq!(e.pk_string(&schema).as_deref(), Some("R1"));
    }
}
