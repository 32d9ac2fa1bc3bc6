//! Typed DDL steps for SQLite.
//!
//! Every [`SchemaOp`] other than alter-column checks whether its target state
//! is already present before mutating, so a step left behind by an interrupted
//! non-transactional prologue is safe to run again. How a kind interacts with
//! the migration transaction is declared up front by [`SchemaOpKind::ddl_mode`].

use rusqlite::Connection;
use serde::Serialize;
use tracing::debug;

use crate::ident::{self, quote};
use crate::introspect;
use crate::migration::{StepError, StepOutcome, StepResult};

/// How a schema step relates to the enclosing migration transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DdlMode {
    /// Executed natively inside the migration transaction.
    Transactional,
    /// Not expressible as one native statement; rewritten as a sequence of
    /// transaction-safe statements executed inside the migration transaction.
    Emulated,
    /// Cannot take effect inside a transaction. Runs before the transaction
    /// opens, guarded so that a re-run after a crash is harmless.
    NonTransactional,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SchemaOpKind {
    CreateTable,
    DropTable,
    RenameTable,
    AddColumn,
    DropColumn,
    RenameColumn,
    AlterColumn,
    CreateIndex,
    DropIndex,
    SetPragma,
}

impl SchemaOpKind {
    pub fn ddl_mode(self) -> DdlMode {
        match self {
            SchemaOpKind::AlterColumn => DdlMode::Emulated,
            SchemaOpKind::SetPragma => DdlMode::NonTransactional,
            _ => DdlMode::Transactional,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            SchemaOpKind::CreateTable => "create_table",
            SchemaOpKind::DropTable => "drop_table",
            SchemaOpKind::RenameTable => "rename_table",
            SchemaOpKind::AddColumn => "add_column",
            SchemaOpKind::DropColumn => "drop_column",
            SchemaOpKind::RenameColumn => "rename_column",
            SchemaOpKind::AlterColumn => "alter_column",
            SchemaOpKind::CreateIndex => "create_index",
            SchemaOpKind::DropIndex => "drop_index",
            SchemaOpKind::SetPragma => "set_pragma",
        }
    }
}

/// Column definition used by create-table, add-column and alter-column.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ColumnDef {
    pub name: String,
    pub sql_type: String,
    pub nullable: bool,
    /// Default as SQL text, e.g. `0` or `'none'`.
    pub default: Option<String>,
    pub primary_key: bool,
    pub auto_increment: bool,
    pub collation: Option<String>,
}

impl ColumnDef {
    pub fn new(name: impl Into<String>, sql_type: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            sql_type: sql_type.into(),
            nullable: true,
            default: None,
            primary_key: false,
            auto_increment: false,
            collation: None,
        }
    }

    /// `INTEGER NOT NULL PRIMARY KEY AUTOINCREMENT` surrogate key.
    pub fn id(name: impl Into<String>) -> Self {
        let mut col = Self::new(name, "INTEGER").primary_key();
        col.auto_increment = true;
        col
    }

    pub fn not_null(mut self) -> Self {
        self.nullable = false;
        self
    }

    pub fn default_value(mut self, expr: impl Into<String>) -> Self {
        self.default = Some(expr.into());
        self
    }

    pub fn primary_key(mut self) -> Self {
        self.primary_key = true;
        self.nullable = false;
        self
    }

    pub fn collate(mut self, collation: impl Into<String>) -> Self {
        self.collation = Some(collation.into());
        self
    }

    fn to_sql(&self, inline_primary_key: bool) -> String {
        let mut sql = format!("{} {}", quote(&self.name), self.sql_type);
        if inline_primary_key && self.primary_key {
            sql.push_str(" PRIMARY KEY");
            if self.auto_increment {
                sql.push_str(" AUTOINCREMENT");
            }
        }
        if !self.nullable {
            sql.push_str(" NOT NULL");
        }
        if let Some(default) = &self.default {
            sql.push_str(" DEFAULT ");
            sql.push_str(default);
        }
        if let Some(collation) = &self.collation {
            sql.push_str(" COLLATE ");
            sql.push_str(collation);
        }
        sql
    }

    fn validate(&self) -> Result<(), String> {
        if !ident::is_identifier(&self.name) {
            return Err(format!("invalid column name `{}`", self.name));
        }
        if !ident::is_type_name(&self.sql_type) {
            return Err(format!("invalid type `{}` for column {}", self.sql_type, self.name));
        }
        if let Some(collation) = &self.collation {
            if !ident::is_identifier(collation) {
                return Err(format!("invalid collation `{collation}`"));
            }
        }
        if let Some(default) = &self.default {
            if default.trim().is_empty() {
                return Err(format!("empty default for column {}", self.name));
            }
        }
        let integer_key = self.primary_key && self.sql_type.eq_ignore_ascii_case("INTEGER");
        if self.auto_increment && !integer_key {
            return Err(format!(
                "AUTOINCREMENT column {} must be an INTEGER PRIMARY KEY",
                self.name
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ReferentialAction {
    Cascade,
    Restrict,
    SetNull,
    NoAction,
}

impl ReferentialAction {
    fn as_sql(self) -> &'static str {
        match self {
            ReferentialAction::Cascade => "CASCADE",
            ReferentialAction::Restrict => "RESTRICT",
            ReferentialAction::SetNull => "SET NULL",
            ReferentialAction::NoAction => "NO ACTION",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ForeignKey {
    pub column: String,
    pub references_table: String,
    pub references_column: String,
    pub on_delete: ReferentialAction,
}

impl ForeignKey {
    pub fn new(
        column: impl Into<String>,
        references_table: impl Into<String>,
        references_column: impl Into<String>,
        on_delete: ReferentialAction,
    ) -> Self {
        Self {
            column: column.into(),
            references_table: references_table.into(),
            references_column: references_column.into(),
            on_delete,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IndexDef {
    pub name: String,
    pub table: String,
    pub columns: Vec<String>,
    pub unique: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SchemaOp {
    CreateTable {
        table: String,
        columns: Vec<ColumnDef>,
        foreign_keys: Vec<ForeignKey>,
    },
    DropTable {
        table: String,
    },
    RenameTable {
        from: String,
        to: String,
    },
    AddColumn {
        table: String,
        column: ColumnDef,
    },
    DropColumn {
        table: String,
        column: String,
    },
    RenameColumn {
        table: String,
        from: String,
        to: String,
    },
    /// Change a column's type, nullability, default or collation.
    AlterColumn {
        table: String,
        column: ColumnDef,
    },
    CreateIndex(IndexDef),
    DropIndex {
        name: String,
    },
    SetPragma {
        name: String,
        value: String,
    },
}

impl SchemaOp {
    pub fn create_table(
        table: impl Into<String>,
        columns: Vec<ColumnDef>,
        foreign_keys: Vec<ForeignKey>,
    ) -> Self {
        SchemaOp::CreateTable {
            table: table.into(),
            columns,
            foreign_keys,
        }
    }

    pub fn drop_table(table: impl Into<String>) -> Self {
        SchemaOp::DropTable { table: table.into() }
    }

    pub fn rename_table(from: impl Into<String>, to: impl Into<String>) -> Self {
        SchemaOp::RenameTable {
            from: from.into(),
            to: to.into(),
        }
    }

    pub fn add_column(table: impl Into<String>, column: ColumnDef) -> Self {
        SchemaOp::AddColumn {
            table: table.into(),
            column,
        }
    }

    pub fn drop_column(table: impl Into<String>, column: impl Into<String>) -> Self {
        SchemaOp::DropColumn {
            table: table.into(),
            column: column.into(),
        }
    }

    pub fn rename_column(
        table: impl Into<String>,
        from: impl Into<String>,
        to: impl Into<String>,
    ) -> Self {
        SchemaOp::RenameColumn {
            table: table.into(),
            from: from.into(),
            to: to.into(),
        }
    }

    pub fn alter_column(table: impl Into<String>, column: ColumnDef) -> Self {
        SchemaOp::AlterColumn {
            table: table.into(),
            column,
        }
    }

    pub fn create_index(
        name: impl Into<String>,
        table: impl Into<String>,
        columns: &[&str],
    ) -> Self {
        SchemaOp::CreateIndex(IndexDef {
            name: name.into(),
            table: table.into(),
            columns: columns.iter().map(|c| c.to_string()).collect(),
            unique: false,
        })
    }

    pub fn create_unique_index(
        name: impl Into<String>,
        table: impl Into<String>,
        columns: &[&str],
    ) -> Self {
        SchemaOp::CreateIndex(IndexDef {
            name: name.into(),
            table: table.into(),
            columns: columns.iter().map(|c| c.to_string()).collect(),
            unique: true,
        })
    }

    pub fn drop_index(name: impl Into<String>) -> Self {
        SchemaOp::DropIndex { name: name.into() }
    }

    pub fn set_pragma(name: impl Into<String>, value: impl Into<String>) -> Self {
        SchemaOp::SetPragma {
            name: name.into(),
            value: value.into(),
        }
    }

    pub fn kind(&self) -> SchemaOpKind {
        match self {
            SchemaOp::CreateTable { .. } => SchemaOpKind::CreateTable,
            SchemaOp::DropTable { .. } => SchemaOpKind::DropTable,
            SchemaOp::RenameTable { .. } => SchemaOpKind::RenameTable,
            SchemaOp::AddColumn { .. } => SchemaOpKind::AddColumn,
            SchemaOp::DropColumn { .. } => SchemaOpKind::DropColumn,
            SchemaOp::RenameColumn { .. } => SchemaOpKind::RenameColumn,
            SchemaOp::AlterColumn { .. } => SchemaOpKind::AlterColumn,
            SchemaOp::CreateIndex(_) => SchemaOpKind::CreateIndex,
            SchemaOp::DropIndex { .. } => SchemaOpKind::DropIndex,
            SchemaOp::SetPragma { .. } => SchemaOpKind::SetPragma,
        }
    }

    pub fn describe(&self) -> String {
        match self {
            SchemaOp::CreateTable { table, columns, .. } => {
                format!("create table {table} ({} columns)", columns.len())
            }
            SchemaOp::DropTable { table } => format!("drop table {table}"),
            SchemaOp::RenameTable { from, to } => format!("rename table {from} to {to}"),
            SchemaOp::AddColumn { table, column } => {
                format!("add column {table}.{} {}", column.name, column.sql_type)
            }
            SchemaOp::DropColumn { table, column } => format!("drop column {table}.{column}"),
            SchemaOp::RenameColumn { table, from, to } => {
                format!("rename column {table}.{from} to {to}")
            }
            SchemaOp::AlterColumn { table, column } => {
                format!("alter column {table}.{} to {}", column.name, column.sql_type)
            }
            SchemaOp::CreateIndex(def) => format!(
                "create {}index {} on {} ({})",
                if def.unique { "unique " } else { "" },
                def.name,
                def.table,
                def.columns.join(", ")
            ),
            SchemaOp::DropIndex { name } => format!("drop index {name}"),
            SchemaOp::SetPragma { name, value } => format!("set pragma {name} = {value}"),
        }
    }

    pub fn validate(&self) -> Result<(), String> {
        fn check(what: &str, name: &str) -> Result<(), String> {
            if ident::is_identifier(name) {
                Ok(())
            } else {
                Err(format!("invalid {what} name `{name}`"))
            }
        }

        match self {
            SchemaOp::CreateTable {
                table,
                columns,
                foreign_keys,
            } => {
                check("table", table)?;
                if columns.is_empty() {
                    return Err(format!("table {table} has no columns"));
                }
                for col in columns {
                    col.validate()?;
                }
                if columns.iter().filter(|c| c.primary_key).count() > 1
                    && columns.iter().any(|c| c.auto_increment)
                {
                    return Err(format!(
                        "table {table}: AUTOINCREMENT requires a single-column primary key"
                    ));
                }
                for fk in foreign_keys {
                    check("column", &fk.column)?;
                    check("table", &fk.references_table)?;
                    check("column", &fk.references_column)?;
                    if !columns.iter().any(|c| c.name == fk.column) {
                        return Err(format!(
                            "foreign key column {} is not defined on {table}",
                            fk.column
                        ));
                    }
                }
                Ok(())
            }
            SchemaOp::DropTable { table } => check("table", table),
            SchemaOp::RenameTable { from, to } => {
                check("table", from)?;
                check("table", to)
            }
            SchemaOp::AddColumn { table, column } | SchemaOp::AlterColumn { table, column } => {
                check("table", table)?;
                column.validate()?;
                if column.primary_key {
                    return Err(format!(
                        "{} cannot introduce primary key column {}",
                        self.kind().as_str(),
                        column.name
                    ));
                }
                if !column.nullable && column.default.is_none() {
                    return Err(format!(
                        "NOT NULL column {table}.{} needs a default",
                        column.name
                    ));
                }
                Ok(())
            }
            SchemaOp::DropColumn { table, column } => {
                check("table", table)?;
                check("column", column)
            }
            SchemaOp::RenameColumn { table, from, to } => {
                check("table", table)?;
                check("column", from)?;
                check("column", to)
            }
            SchemaOp::CreateIndex(def) => {
                check("index", &def.name)?;
                check("table", &def.table)?;
                if def.columns.is_empty() {
                    return Err(format!("index {} has no columns", def.name));
                }
                for col in &def.columns {
                    check("column", col)?;
                }
                Ok(())
            }
            SchemaOp::DropIndex { name } => check("index", name),
            SchemaOp::SetPragma { name, value } => {
                check("pragma", name)?;
                let plain = |c: char| c.is_ascii_alphanumeric() || c == '_' || c == '-';
                if value.is_empty() || !value.chars().all(plain) {
                    return Err(format!("invalid value `{value}` for pragma {name}"));
                }
                Ok(())
            }
        }
    }

    /// Whether the store already reflects this step.
    pub fn is_satisfied(&self, conn: &Connection) -> rusqlite::Result<bool> {
        match self {
            SchemaOp::CreateTable { table, .. } => introspect::table_exists(conn, table),
            SchemaOp::DropTable { table } => Ok(!introspect::table_exists(conn, table)?),
            SchemaOp::RenameTable { from, to } => Ok(!introspect::table_exists(conn, from)?
                && introspect::table_exists(conn, to)?),
            SchemaOp::AddColumn { table, column } => {
                Ok(introspect::column(conn, table, &column.name)?.is_some())
            }
            SchemaOp::DropColumn { table, column } => {
                Ok(introspect::column(conn, table, column)?.is_none())
            }
            SchemaOp::RenameColumn { table, from, to } => {
                Ok(introspect::column(conn, table, from)?.is_none()
                    && introspect::column(conn, table, to)?.is_some())
            }
            // table_info does not report collation, so the current shape cannot
            // be compared. The rewrite converges, so it always runs.
            SchemaOp::AlterColumn { .. } => Ok(false),
            SchemaOp::CreateIndex(def) => introspect::index_exists(conn, &def.name),
            SchemaOp::DropIndex { name } => Ok(!introspect::index_exists(conn, name)?),
            SchemaOp::SetPragma { name, value } => {
                let current = introspect::pragma_value(conn, name)?;
                Ok(current.is_some_and(|current| pragma_eq(&current, value)))
            }
        }
    }

    /// Apply the step unless its guard reports it as already satisfied.
    pub fn apply(&self, conn: &Connection) -> StepResult {
        if self.is_satisfied(conn)? {
            debug!("skipping satisfied step: {}", self.describe());
            return Ok(StepOutcome::Skipped);
        }

        match self {
            SchemaOp::CreateTable {
                table,
                columns,
                foreign_keys,
            } => conn.execute_batch(&create_table_sql(table, columns, foreign_keys))?,
            SchemaOp::DropTable { table } => {
                conn.execute_batch(&format!("DROP TABLE {}", quote(table)))?
            }
            SchemaOp::RenameTable { from, to } => conn.execute_batch(&format!(
                "ALTER TABLE {} RENAME TO {}",
                quote(from),
                quote(to)
            ))?,
            SchemaOp::AddColumn { table, column } => conn.execute_batch(&format!(
                "ALTER TABLE {} ADD COLUMN {}",
                quote(table),
                column.to_sql(false)
            ))?,
            SchemaOp::DropColumn { table, column } => conn.execute_batch(&format!(
                "ALTER TABLE {} DROP COLUMN {}",
                quote(table),
                quote(column)
            ))?,
            SchemaOp::RenameColumn { table, from, to } => conn.execute_batch(&format!(
                "ALTER TABLE {} RENAME COLUMN {} TO {}",
                quote(table),
                quote(from),
                quote(to)
            ))?,
            SchemaOp::AlterColumn { table, column } => alter_column(conn, table, column)?,
            SchemaOp::CreateIndex(def) => conn.execute_batch(&create_index_sql(def))?,
            SchemaOp::DropIndex { name } => {
                conn.execute_batch(&format!("DROP INDEX {}", quote(name)))?
            }
            SchemaOp::SetPragma { name, value } => {
                conn.execute_batch(&format!("PRAGMA {name} = {value}"))?;
                if !self.is_satisfied(conn)? {
                    return Err(StepError::Invalid(format!(
                        "pragma {name} did not take the value {value}"
                    )));
                }
            }
        }

        Ok(StepOutcome::Applied { rows_affected: 0 })
    }
}

fn create_table_sql(table: &str, columns: &[ColumnDef], foreign_keys: &[ForeignKey]) -> String {
    let pk_columns: Vec<&ColumnDef> = columns.iter().filter(|c| c.primary_key).collect();
    let inline_pk = pk_columns.len() == 1;

    let mut parts: Vec<String> = columns.iter().map(|c| c.to_sql(inline_pk)).collect();
    if pk_columns.len() > 1 {
        let names: Vec<String> = pk_columns.iter().map(|c| quote(&c.name)).collect();
        parts.push(format!("PRIMARY KEY ({})", names.join(", ")));
    }
    for fk in foreign_keys {
        parts.push(format!(
            "FOREIGN KEY ({}) REFERENCES {} ({}) ON DELETE {}",
            quote(&fk.column),
            quote(&fk.references_table),
            quote(&fk.references_column),
            fk.on_delete.as_sql()
        ));
    }

    format!("CREATE TABLE {} (\n    {}\n)", quote(table), parts.join(",\n    "))
}

fn create_index_sql(def: &IndexDef) -> String {
    let columns: Vec<String> = def.columns.iter().map(|c| quote(c)).collect();
    format!(
        "CREATE {}INDEX {} ON {} ({})",
        if def.unique { "UNIQUE " } else { "" },
        quote(&def.name),
        quote(&def.table),
        columns.join(", ")
    )
}

/// SQLite has no `ALTER COLUMN`; emulate it with statements that all run in
/// the caller's transaction: drop dependent indexes, add a replacement
/// column, copy the converted values, drop the old column, rename the
/// replacement into place and recreate the indexes.
fn alter_column(conn: &Connection, table: &str, column: &ColumnDef) -> Result<(), StepError> {
    if introspect::column(conn, table, &column.name)?.is_none() {
        return Err(StepError::Invalid(format!(
            "no such column: {table}.{}",
            column.name
        )));
    }

    let covering = introspect::indexes_covering(conn, table, &column.name)?;
    for (index, _) in &covering {
        conn.execute_batch(&format!("DROP INDEX {}", quote(index)))?;
    }

    let temp = ColumnDef {
        name: format!("__sf_tmp_{}", column.name),
        ..column.clone()
    };
    let converted = format!("CAST({} AS {})", quote(&column.name), column.sql_type);
    let value = match (&column.default, column.nullable) {
        (Some(default), false) => format!("COALESCE({converted}, {default})"),
        _ => converted,
    };

    conn.execute_batch(&format!(
        "ALTER TABLE {table_q} ADD COLUMN {temp_def};
         UPDATE {table_q} SET {temp_q} = {value};
         ALTER TABLE {table_q} DROP COLUMN {old_q};
         ALTER TABLE {table_q} RENAME COLUMN {temp_q} TO {old_q};",
        table_q = quote(table),
        temp_def = temp.to_sql(false),
        temp_q = quote(&temp.name),
        old_q = quote(&column.name),
    ))?;

    for (_, sql) in &covering {
        conn.execute_batch(sql)?;
    }
    Ok(())
}

fn pragma_eq(current: &str, wanted: &str) -> bool {
    fn normalize(v: &str) -> String {
        match v.to_ascii_lowercase().as_str() {
            "on" | "true" | "yes" => "1".to_string(),
            "off" | "false" | "no" => "0".to_string(),
            other => other.to_string(),
        }
    }
    normalize(current) == normalize(wanted)
}
