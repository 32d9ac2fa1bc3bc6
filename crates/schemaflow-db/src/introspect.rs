//! Read-only views of the store's schema metadata.
//!
//! Guards use the single-object lookups to decide whether a step's target
//! state already exists; `SchemaSnapshot` captures the whole shape so tests
//! and tooling can compare schemas before and after a migration.

use std::collections::BTreeMap;

use rusqlite::types::Value;
use rusqlite::{Connection, OptionalExtension, params};
use schemaflow_common::{Error, Result};
use serde::Serialize;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ColumnShape {
    pub decl_type: String,
    pub not_null: bool,
    pub default: Option<String>,
    pub primary_key: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IndexShape {
    pub table: String,
    pub unique: bool,
    pub columns: Vec<String>,
}

/// Columns keyed by name; declaration order is not part of the shape.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TableShape {
    pub columns: BTreeMap<String, ColumnShape>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SchemaSnapshot {
    pub tables: BTreeMap<String, TableShape>,
    pub indexes: BTreeMap<String, IndexShape>,
}

impl SchemaSnapshot {
    /// Capture every user table and explicitly created index, skipping SQLite
    /// internals and the tables named in `exclude` (the ledger and lock).
    pub fn capture(conn: &Connection, exclude: &[&str]) -> Result<Self> {
        let excluded = |name: &str| exclude.iter().any(|e| e.eq_ignore_ascii_case(name));

        let mut snapshot = Self::default();
        for table in table_names(conn).map_err(db_err)? {
            if excluded(&table) {
                continue;
            }
            let columns = columns(conn, &table).map_err(db_err)?;
            snapshot.tables.insert(table.clone(), TableShape { columns });

            for (name, shape) in indexes(conn, &table).map_err(db_err)? {
                snapshot.indexes.insert(name, shape);
            }
        }
        Ok(snapshot)
    }

    pub fn table(&self, name: &str) -> Option<&TableShape> {
        self.tables.get(name)
    }
}

fn db_err(e: rusqlite::Error) -> Error {
    Error::Database(format!("schema introspection failed: {e}"))
}

fn table_names(conn: &Connection) -> rusqlite::Result<Vec<String>> {
    let mut stmt = conn.prepare(
        "SELECT name FROM sqlite_master
         WHERE type = 'table' AND name NOT LIKE 'sqlite_%'
         ORDER BY name",
    )?;
    let rows = stmt.query_map([], |row| row.get(0))?;
    rows.collect()
}

pub fn table_exists(conn: &Connection, table: &str) -> rusqlite::Result<bool> {
    conn.query_row(
        "SELECT count(*) > 0 FROM sqlite_master
         WHERE type = 'table' AND name = ?1 COLLATE NOCASE",
        params![table],
        |row| row.get(0),
    )
}

pub fn index_exists(conn: &Connection, index: &str) -> rusqlite::Result<bool> {
    conn.query_row(
        "SELECT count(*) > 0 FROM sqlite_master
         WHERE type = 'index' AND name = ?1 COLLATE NOCASE",
        params![index],
        |row| row.get(0),
    )
}

pub fn columns(conn: &Connection, table: &str) -> rusqlite::Result<BTreeMap<String, ColumnShape>> {
    let mut stmt = conn.prepare(
        "SELECT name, type, \"notnull\", dflt_value, pk FROM pragma_table_info(?1)",
    )?;
    let rows = stmt.query_map(params![table], |row| {
        Ok((
            row.get::<_, String>(0)?,
            ColumnShape {
                decl_type: row.get(1)?,
                not_null: row.get(2)?,
                default: row.get(3)?,
                primary_key: row.get::<_, i64>(4)? > 0,
            },
        ))
    })?;
    rows.collect()
}

/// Shape of a single column, matched case-insensitively like SQLite does.
pub fn column(conn: &Connection, table: &str, column: &str) -> rusqlite::Result<Option<ColumnShape>> {
    Ok(columns(conn, table)?
        .into_iter()
        .find(|(name, _)| name.eq_ignore_ascii_case(column))
        .map(|(_, shape)| shape))
}

fn indexes(conn: &Connection, table: &str) -> rusqlite::Result<Vec<(String, IndexShape)>> {
    let mut stmt = conn.prepare(
        "SELECT name, \"unique\" FROM pragma_index_list(?1) WHERE origin = 'c' ORDER BY name",
    )?;
    let listed = stmt
        .query_map(params![table], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, bool>(1)?))
        })?
        .collect::<rusqlite::Result<Vec<_>>>()?;

    let mut out = Vec::with_capacity(listed.len());
    for (name, unique) in listed {
        out.push((
            name.clone(),
            IndexShape {
                table: table.to_string(),
                unique,
                columns: index_columns(conn, &name)?,
            },
        ));
    }
    Ok(out)
}

fn index_columns(conn: &Connection, index: &str) -> rusqlite::Result<Vec<String>> {
    let mut stmt = conn.prepare("SELECT name FROM pragma_index_info(?1) ORDER BY seqno")?;
    let rows = stmt.query_map(params![index], |row| row.get(0))?;
    rows.collect()
}

/// Explicitly created indexes on `table` that include `column`, with the SQL
/// needed to recreate them.
pub fn indexes_covering(
    conn: &Connection,
    table: &str,
    column: &str,
) -> rusqlite::Result<Vec<(String, String)>> {
    let mut stmt = conn.prepare(
        "SELECT name, sql FROM sqlite_master
         WHERE type = 'index' AND tbl_name = ?1 COLLATE NOCASE AND sql IS NOT NULL
         ORDER BY name",
    )?;
    let candidates = stmt
        .query_map(params![table], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
        })?
        .collect::<rusqlite::Result<Vec<_>>>()?;

    let mut covering = Vec::new();
    for (name, sql) in candidates {
        let cols = index_columns(conn, &name)?;
        if cols.iter().any(|c| c.eq_ignore_ascii_case(column)) {
            covering.push((name, sql));
        }
    }
    Ok(covering)
}

/// Current value of a pragma rendered as text (`1`, `wal`, ...). `pragma`
/// must already be a validated identifier.
pub fn pragma_value(conn: &Connection, pragma: &str) -> rusqlite::Result<Option<String>> {
    let value = conn
        .query_row(&format!("PRAGMA {pragma}"), [], |row| {
            row.get::<_, Value>(0)
        })
        .optional()?;

    Ok(value.map(|v| match v {
        Value::Null => String::new(),
        Value::Integer(i) => i.to_string(),
        Value::Real(f) => f.to_string(),
        Value::Text(s) => s,
        Value::Blob(b) => String::from_utf8_lossy(&b).into_owned(),
    }))
}
