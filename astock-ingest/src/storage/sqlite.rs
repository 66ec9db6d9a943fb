//! SQLite warehouse.
//!
//! One connection behind an async mutex is the single writer. Upserts use
//! `INSERT … ON CONFLICT(key) DO UPDATE`, so writing the same row twice
//! leaves the table as if it had been written once.

use async_trait::async_trait;
use rusqlite::types::{ToSql, ToSqlOutput, Value as SqlValue};
use rusqlite::{Connection, ErrorCode};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::pipeline::{ColumnKind, FieldValue, Row, Storage, StorageError, TableSchema};

// ============================================================================
// Value Conversion
// ============================================================================

impl ToSql for FieldValue {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        let value = match self {
            FieldValue::Null => SqlValue::Null,
            FieldValue::Text(s) => return Ok(ToSqlOutput::from(s.as_str())),
            FieldValue::Real(v) => SqlValue::Real(*v),
            FieldValue::Integer(v) => SqlValue::Integer(*v),
            FieldValue::Date(d) => SqlValue::Text(d.format("%Y-%m-%d").to_string()),
            FieldValue::Timestamp(ts) => SqlValue::Text(ts.format("%Y-%m-%d %H:%M:%S%.3f").to_string()),
        };
        Ok(ToSqlOutput::Owned(value))
    }
}

fn classify(err: rusqlite::Error) -> StorageError {
    if let rusqlite::Error::SqliteFailure(failure, _) = &err {
        match failure.code {
            ErrorCode::CannotOpen
            | ErrorCode::NotADatabase
            | ErrorCode::DatabaseCorrupt
            | ErrorCode::SystemIoFailure
            | ErrorCode::DiskFull
            | ErrorCode::ReadOnly => return StorageError::Unavailable(err.to_string()),
            _ => {}
        }
    }
    StorageError::Statement(err.to_string())
}

// ============================================================================
// SQL Generation
// ============================================================================

/// Quote a plain identifier, rejecting anything else.
pub fn quote_ident(name: &str) -> Result<String, StorageError> {
    let mut chars = name.chars();
    let valid = matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_');
    if valid {
        Ok(format!("\"{}\"", name))
    } else {
        Err(StorageError::InvalidIdentifier(name.to_string()))
    }
}

fn quote_all<'a>(names: impl IntoIterator<Item = &'a str>) -> Result<Vec<String>, StorageError> {
    names.into_iter().map(quote_ident).collect()
}

fn sql_type(kind: ColumnKind) -> &'static str {
    match kind {
        ColumnKind::Text | ColumnKind::Date | ColumnKind::Timestamp => "TEXT",
        ColumnKind::Integer => "INTEGER",
        ColumnKind::Real { .. } => "REAL",
    }
}

/// `CREATE TABLE IF NOT EXISTS` plus an index on the first date key column.
pub fn create_table_sql(relation: &str, schema: &TableSchema) -> Result<String, StorageError> {
    let table = quote_ident(relation)?;
    let mut defs = Vec::with_capacity(schema.columns.len() + 1);
    for column in &schema.columns {
        let mut def = format!("    {} {}", quote_ident(&column.name)?, sql_type(column.kind));
        if column.required {
            def.push_str(" NOT NULL");
        }
        defs.push(def);
    }
    defs.push(format!(
        "    PRIMARY KEY ({})",
        quote_all(schema.key_names())?.join(", ")
    ));

    let mut sql = format!("CREATE TABLE IF NOT EXISTS {} (\n{}\n);\n", table, defs.join(",\n"));

    let date_key = schema.key_columns.iter().find(|k| {
        schema
            .column(k)
            .is_some_and(|c| c.kind == ColumnKind::Date)
    });
    if let Some(date_key) = date_key {
        let index = quote_ident(&format!("idx_{}_{}", relation, date_key))?;
        sql.push_str(&format!(
            "CREATE INDEX IF NOT EXISTS {} ON {}({} DESC);\n",
            index,
            table,
            quote_ident(date_key)?
        ));
    }
    Ok(sql)
}

fn conflict_clause(schema: &TableSchema) -> Result<String, StorageError> {
    let keys = quote_all(schema.key_names())?;
    let updates: Vec<String> = schema
        .columns
        .iter()
        .filter(|c| !schema.key_columns.contains(&c.name))
        .map(|c| quote_ident(&c.name).map(|q| format!("{q} = excluded.{q}")))
        .collect::<Result<_, _>>()?;

    if updates.is_empty() {
        Ok(format!("ON CONFLICT ({}) DO NOTHING", keys.join(", ")))
    } else {
        Ok(format!(
            "ON CONFLICT ({}) DO UPDATE SET {}",
            keys.join(", "),
            updates.join(", ")
        ))
    }
}

/// Keyed insert-or-update of one row.
pub fn upsert_sql(relation: &str, schema: &TableSchema) -> Result<String, StorageError> {
    let columns = quote_all(schema.column_names())?;
    let placeholders: Vec<String> = (1..=columns.len()).map(|i| format!("?{}", i)).collect();
    Ok(format!(
        "INSERT INTO {} ({}) VALUES ({}) {}",
        quote_ident(relation)?,
        columns.join(", "),
        placeholders.join(", "),
        conflict_clause(schema)?
    ))
}

/// Keyed insert-or-update of every row of `source` into `target`.
pub fn merge_sql(source: &str, target: &str, schema: &TableSchema) -> Result<String, StorageError> {
    let columns = quote_all(schema.column_names())?.join(", ");
    // `WHERE true` disambiguates ON CONFLICT from a join constraint.
    Ok(format!(
        "INSERT INTO {} ({}) SELECT {} FROM {} WHERE true {}",
        quote_ident(target)?,
        columns,
        columns,
        quote_ident(source)?,
        conflict_clause(schema)?
    ))
}

// ============================================================================
// Warehouse
// ============================================================================

/// SQLite-backed [`Storage`].
pub struct SqliteWarehouse {
    /// rusqlite::Connection is Send but not Sync; the mutex also makes this
    /// the single writer
    db: Mutex<Connection>,
    path: Option<PathBuf>,
}

impl SqliteWarehouse {
    /// Open (or create) the warehouse file.
    pub fn open(path: &Path) -> Result<Self, StorageError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                StorageError::Unavailable(format!("cannot create {}: {}", parent.display(), e))
            })?;
        }

        let conn = Connection::open(path).map_err(|e| StorageError::Unavailable(e.to_string()))?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")
            .map_err(classify)?;

        info!(db_path = %path.display(), "Opened warehouse");
        Ok(Self {
            db: Mutex::new(conn),
            path: Some(path.to_path_buf()),
        })
    }

    /// Private in-memory warehouse, for tests and dry runs.
    pub fn open_in_memory() -> Result<Self, StorageError> {
        let conn = Connection::open_in_memory().map_err(|e| StorageError::Unavailable(e.to_string()))?;
        Ok(Self {
            db: Mutex::new(conn),
            path: None,
        })
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Every row of `relation`, ordered by `order_by`, as column → SQL value.
    pub async fn dump(
        &self,
        relation: &str,
        order_by: &[&str],
    ) -> Result<Vec<BTreeMap<String, SqlValue>>, StorageError> {
        let mut sql = format!("SELECT * FROM {}", quote_ident(relation)?);
        if !order_by.is_empty() {
            sql.push_str(&format!(" ORDER BY {}", quote_all(order_by.iter().copied())?.join(", ")));
        }

        let db = self.db.lock().await;
        let mut stmt = db.prepare(&sql).map_err(classify)?;
        let names: Vec<String> = stmt.column_names().iter().map(|n| n.to_string()).collect();
        let rows = stmt
            .query_map([], |row| {
                let mut values = BTreeMap::new();
                for (i, name) in names.iter().enumerate() {
                    values.insert(name.clone(), row.get::<_, SqlValue>(i)?);
                }
                Ok(values)
            })
            .map_err(classify)?;
        let dumped = rows.collect::<Result<Vec<_>, _>>().map_err(classify)?;
        Ok(dumped)
    }
}

#[async_trait]
impl Storage for SqliteWarehouse {
    async fn ensure_relation(&self, relation: &str, schema: &TableSchema) -> Result<(), StorageError> {
        let sql = create_table_sql(relation, schema)?;
        let db = self.db.lock().await;
        db.execute_batch(&sql).map_err(classify)?;
        debug!(relation, "Ensured relation");
        Ok(())
    }

    async fn upsert(&self, relation: &str, schema: &TableSchema, rows: &[Row]) -> Result<usize, StorageError> {
        if rows.is_empty() {
            return Ok(0);
        }
        let sql = upsert_sql(relation, schema)?;
        let columns = schema.column_names();

        let mut db = self.db.lock().await;
        let tx = db.transaction().map_err(classify)?;
        {
            let mut stmt = tx.prepare_cached(&sql).map_err(classify)?;
            for row in rows {
                let params = columns.iter().map(|c| row.get(c));
                stmt.execute(rusqlite::params_from_iter(params))
                    .map_err(classify)?;
            }
        }
        tx.commit().map_err(classify)?;
        Ok(rows.len())
    }

    async fn merge_relation(
        &self,
        source: &str,
        target: &str,
        schema: &TableSchema,
    ) -> Result<usize, StorageError> {
        let sql = merge_sql(source, target, schema)?;
        let mut db = self.db.lock().await;
        let tx = db.transaction().map_err(classify)?;
        let merged = tx.execute(&sql, []).map_err(classify)?;
        tx.commit().map_err(classify)?;
        Ok(merged)
    }

    async fn drop_relation(&self, relation: &str) -> Result<(), StorageError> {
        let sql = format!("DROP TABLE IF EXISTS {}", quote_ident(relation)?);
        let db = self.db.lock().await;
        db.execute_batch(&sql).map_err(classify)
    }

    async fn count(&self, relation: &str) -> Result<u64, StorageError> {
        let sql = format!("SELECT COUNT(*) FROM {}", quote_ident(relation)?);
        let db = self.db.lock().await;
        let count: i64 = db.query_row(&sql, [], |row| row.get(0)).map_err(classify)?;
        Ok(count as u64)
    }
}
