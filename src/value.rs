use chrono::{DateTime, NaiveDate, NaiveDateTime, TimeZone, Utc};
use rusqlite::types::{FromSql, FromSqlError, FromSqlResult, ToSql, ToSqlOutput, ValueRef};
use serde::{Deserialize, Serialize};

/// Tagged union over every column value the core ever shuttles between a
/// local and a network table (§9: "replace inheritance and object maps
/// with tagged variants").
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Value {
    Null,
    Integer(i64),
    Real(f64),
    Bool(bool),
    Text(String),
    DateTime(DateTime<Utc>),
    Blob(Vec<u8>),
}

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }
}

/// The declared type of a column, inferred from SQLite's `PRAGMA
/// table_info` decltype string. Stands in for the source's `OleDbType`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnType {
    Integer,
    Real,
    Boolean,
    Text,
    DateTime,
    Blob,
    Unknown,
}

impl ColumnType {
    pub fn from_sql_decltype(decl: &str) -> ColumnType {
        let upper = decl.to_ascii_uppercase();
        if upper.contains("BOOL") {
            ColumnType::Boolean
        } else if upper.contains("INT") {
            ColumnType::Integer
        } else if upper.contains("REAL") || upper.contains("FLOA") || upper.contains("DOUB") || upper.contains("DECIMAL") || upper.contains("NUMERIC") {
            ColumnType::Real
        } else if upper.contains("DATE") || upper.contains("TIME") {
            ColumnType::DateTime
        } else if upper.contains("BLOB") {
            ColumnType::Blob
        } else if upper.contains("CHAR") || upper.contains("TEXT") || upper.contains("CLOB") {
            ColumnType::Text
        } else {
            ColumnType::Unknown
        }
    }

    /// Best-effort inference from a loosely typed value when the target
    /// schema's column type could not be determined (§4.5 step 5).
    pub fn infer(value: &Value) -> ColumnType {
        match value {
            Value::Null => ColumnType::Unknown,
            Value::Integer(_) => ColumnType::Integer,
            Value::Real(_) => ColumnType::Real,
            Value::Bool(_) => ColumnType::Boolean,
            Value::Text(_) => ColumnType::Text,
            Value::DateTime(_) => ColumnType::DateTime,
            Value::Blob(_) => ColumnType::Blob,
        }
    }
}

/// Mirrors the OLE coercion helper in the source: a single function that
/// converts a loosely typed value into the shape demanded by a target
/// column type. Null is always preserved.
pub fn to_target_type(value: &Value, target: ColumnType) -> Value {
    if value.is_null() {
        return Value::Null;
    }
    match target {
        ColumnType::Integer => Value::Integer(as_i64(value)),
        ColumnType::Real => Value::Real(as_f64(value)),
        ColumnType::Boolean => Value::Bool(as_bool(value)),
        ColumnType::Text => Value::Text(as_text(value)),
        ColumnType::DateTime => as_datetime(value)
            .map(Value::DateTime)
            .unwrap_or_else(|| Value::Text(as_text(value))),
        ColumnType::Blob | ColumnType::Unknown => value.clone(),
    }
}

fn as_i64(v: &Value) -> i64 {
    match v {
        Value::Integer(i) => *i,
        Value::Real(r) => *r as i64,
        Value::Bool(b) => i64::from(*b),
        Value::Text(s) => s.trim().parse::<i64>().unwrap_or(0),
        Value::DateTime(dt) => dt.timestamp(),
        Value::Blob(_) | Value::Null => 0,
    }
}

fn as_f64(v: &Value) -> f64 {
    match v {
        Value::Integer(i) => *i as f64,
        Value::Real(r) => *r,
        Value::Bool(b) => {
            if *b {
                1.0
            } else {
                0.0
            }
        }
        Value::Text(s) => s.trim().replace(',', ".").parse::<f64>().unwrap_or(0.0),
        Value::DateTime(dt) => dt.timestamp() as f64,
        Value::Blob(_) | Value::Null => 0.0,
    }
}

fn as_bool(v: &Value) -> bool {
    match v {
        Value::Bool(b) => *b,
        Value::Integer(i) => *i != 0,
        Value::Real(r) => *r != 0.0,
        Value::Text(s) => matches!(
            s.trim().to_ascii_lowercase().as_str(),
            "1" | "true" | "yes" | "y" | "oui"
        ),
        Value::DateTime(_) | Value::Blob(_) | Value::Null => false,
    }
}

fn as_text(v: &Value) -> String {
    match v {
        Value::Text(s) => s.clone(),
        Value::Integer(i) => i.to_string(),
        Value::Real(r) => r.to_string(),
        Value::Bool(b) => b.to_string(),
        Value::DateTime(dt) => dt.to_rfc3339(),
        Value::Blob(b) => b.iter().map(|byte| format!("{byte:02x}")).collect(),
        Value::Null => String::new(),
    }
}

fn as_datetime(v: &Value) -> Option<DateTime<Utc>> {
    match v {
        Value::DateTime(dt) => Some(*dt),
        Value::Integer(i) => Utc.timestamp_opt(*i, 0).single(),
        Value::Text(s) => parse_datetime_invariant(s),
        _ => None,
    }
}

/// Parses a datetime string the invariant (ISO-8601) way first, then falls
/// back to the fr-FR `dd/MM/yyyy[ HH:mm:ss]` shape the source also accepts
/// (§4.5 step 5, §9 "always invariant culture ... then fr-FR fallback").
pub fn parse_datetime_invariant(s: &str) -> Option<DateTime<Utc>> {
    let s = s.trim();
    if s.is_empty() {
        return None;
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.with_timezone(&Utc));
    }
    for fmt in ["%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%d %H:%M:%S", "%Y-%m-%dT%H:%M:%S%.f"] {
        if let Ok(ndt) = NaiveDateTime::parse_from_str(s, fmt) {
            return Some(Utc.from_utc_datetime(&ndt));
        }
    }
    if let Ok(nd) = NaiveDate::parse_from_str(s, "%Y-%m-%d") {
        return nd.and_hms_opt(0, 0, 0).map(|ndt| Utc.from_utc_datetime(&ndt));
    }
    if let Ok(ndt) = NaiveDateTime::parse_from_str(s, "%d/%m/%Y %H:%M:%S") {
        return Some(Utc.from_utc_datetime(&ndt));
    }
    if let Ok(nd) = NaiveDate::parse_from_str(s, "%d/%m/%Y") {
        return nd.and_hms_opt(0, 0, 0).map(|ndt| Utc.from_utc_datetime(&ndt));
    }
    None
}

impl ToSql for Value {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(match self {
            Value::Null => ToSqlOutput::Owned(rusqlite::types::Value::Null),
            Value::Integer(i) => ToSqlOutput::Owned(rusqlite::types::Value::Integer(*i)),
            Value::Real(r) => ToSqlOutput::Owned(rusqlite::types::Value::Real(*r)),
            Value::Bool(b) => ToSqlOutput::Owned(rusqlite::types::Value::Integer(i64::from(*b))),
            Value::Text(s) => ToSqlOutput::Owned(rusqlite::types::Value::Text(s.clone())),
            Value::DateTime(dt) => ToSqlOutput::Owned(rusqlite::types::Value::Text(dt.to_rfc3339())),
            Value::Blob(b) => ToSqlOutput::Owned(rusqlite::types::Value::Blob(b.clone())),
        })
    }
}

impl FromSql for Value {
    fn column_result(v: ValueRef<'_>) -> FromSqlResult<Self> {
        Ok(match v {
            ValueRef::Null => Value::Null,
            ValueRef::Integer(i) => Value::Integer(i),
            ValueRef::Real(r) => Value::Real(r),
            ValueRef::Text(t) => {
                let s = std::str::from_utf8(t)
                    .map_err(|e| FromSqlError::Other(Box::new(e)))?
                    .to_string();
                Value::Text(s)
            }
            ValueRef::Blob(b) => Value::Blob(b.to_vec()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn coerces_text_to_integer_and_real() {
        assert_eq!(to_target_type(&Value::Text(" 42 ".into()), ColumnType::Integer), Value::Integer(42));
        assert_eq!(to_target_type(&Value::Text("3,14".into()), ColumnType::Real), Value::Real(3.14));
    }

    #[test]
    fn null_survives_coercion() {
        assert_eq!(to_target_type(&Value::Null, ColumnType::Integer), Value::Null);
    }

    #[test]
    fn decltype_classification() {
        assert_eq!(ColumnType::from_sql_decltype("BIGINT"), ColumnType::Integer);
        assert_eq!(ColumnType::from_sql_decltype("BOOLEAN"), ColumnType::Boolean);
        assert_eq!(ColumnType::from_sql_decltype("DATETIME"), ColumnType::DateTime);
        assert_eq!(ColumnType::from_sql_decltype("VARCHAR(255)"), ColumnType::Text);
    }

    #[test]
    fn parses_invariant_and_fr_fr_dates() {
        assert!(parse_datetime_invariant("2024-07-01T12:30:00Z").is_some());
        assert!(parse_datetime_invariant("2024-07-01 12:30:00").is_some());
        assert!(parse_datetime_invariant("01/07/2024").is_some());
        assert!(parse_datetime_invariant("").is_none());
    }
}
