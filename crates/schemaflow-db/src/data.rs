//! Data transformation steps and their executor.

use rusqlite::hooks::{AuthAction, AuthContext, Authorization};
use rusqlite::{Connection, ErrorCode};
use serde::Serialize;
use tracing::debug;

use crate::migration::{StepError, StepOutcome, StepResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DataPurpose {
    /// Populate a newly added column from existing data.
    Backfill,
    /// Delete rows that are regenerated from other data (caches, schedules).
    InvalidateDerived,
    /// Rewrite values in place, e.g. renumbering enum codes.
    Remap,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Invertibility {
    Invertible,
    /// The down path cannot restore what this step changes or removes.
    Lossy,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Idempotency {
    Idempotent,
    NotIdempotent,
}

/// A set-based SQL statement run inside the migration transaction, with its
/// declared invertibility and idempotency.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DataOp {
    pub purpose: DataPurpose,
    pub description: String,
    pub statement: String,
    pub invertibility: Invertibility,
    pub idempotency: Idempotency,
}

impl DataOp {
    pub fn new(
        purpose: DataPurpose,
        description: impl Into<String>,
        statement: impl Into<String>,
        invertibility: Invertibility,
        idempotency: Idempotency,
    ) -> Self {
        Self {
            purpose,
            description: description.into(),
            statement: statement.into(),
            invertibility,
            idempotency,
        }
    }

    /// Backfills write a fresh column from existing ones, so repeating one
    /// is harmless. Whether the down path undoes it is up to the caller.
    pub fn backfill(
        description: impl Into<String>,
        statement: impl Into<String>,
        invertibility: Invertibility,
    ) -> Self {
        Self::new(
            DataPurpose::Backfill,
            description,
            statement,
            invertibility,
            Idempotency::Idempotent,
        )
    }

    pub fn remap(
        description: impl Into<String>,
        statement: impl Into<String>,
        invertibility: Invertibility,
        idempotency: Idempotency,
    ) -> Self {
        Self::new(DataPurpose::Remap, description, statement, invertibility, idempotency)
    }

    /// Deleting derived rows is always lossy and always safe to repeat.
    pub fn invalidate_derived(
        description: impl Into<String>,
        statement: impl Into<String>,
    ) -> Self {
        Self::new(
            DataPurpose::InvalidateDerived,
            description,
            statement,
            Invertibility::Lossy,
            Idempotency::Idempotent,
        )
    }

    pub fn is_invertible(&self) -> bool {
        self.invertibility == Invertibility::Invertible
    }

    pub fn is_idempotent(&self) -> bool {
        self.idempotency == Idempotency::Idempotent
    }

    pub fn describe(&self) -> String {
        let purpose = match self.purpose {
            DataPurpose::Backfill => "backfill",
            DataPurpose::InvalidateDerived => "invalidate derived",
            DataPurpose::Remap => "remap",
        };
        format!("{purpose}: {}", self.description)
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.description.trim().is_empty() {
            return Err("data step has an empty description".into());
        }
        let statement = self.statement.trim();
        if statement.is_empty() {
            return Err(format!("data step `{}` has an empty statement", self.description));
        }

        for part in statements(statement) {
            let keyword = part
                .split(|c: char| c.is_whitespace() || c == '(')
                .next()
                .unwrap_or_default()
                .to_ascii_uppercase();
            if TX_CONTROL.contains(&keyword.as_str()) {
                return Err(format!(
                    "data step `{}` must not control transactions ({keyword})",
                    self.description
                ));
            }
        }
        Ok(())
    }
}

const TX_CONTROL: [&str; 7] = [
    "BEGIN", "COMMIT", "END", "ROLLBACK", "SAVEPOINT", "RELEASE", "VACUUM",
];

/// Split a batch into its statements, ignoring `;` inside quotes and
/// comments. Comments are dropped from the returned statements' starts.
fn statements(sql: &str) -> Vec<&str> {
    let bytes = sql.as_bytes();
    let mut parts = Vec::new();
    let mut start = 0;
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            quote @ (b'\'' | b'"' | b'`') => {
                i += 1;
                while i < bytes.len() && bytes[i] != quote {
                    i += 1;
                }
            }
            b'[' => {
                while i < bytes.len() && bytes[i] != b']' {
                    i += 1;
                }
            }
            b'-' if bytes.get(i + 1) == Some(&b'-') => {
                while i < bytes.len() && bytes[i] != b'\n' {
                    i += 1;
                }
            }
            b'/' if bytes.get(i + 1) == Some(&b'*') => {
                i += 2;
                while i + 1 < bytes.len() && !(bytes[i] == b'*' && bytes[i + 1] == b'/') {
                    i += 1;
                }
                i += 1;
            }
            b';' => {
                parts.push(&sql[start..i]);
                start = i + 1;
            }
            _ => {}
        }
        i += 1;
    }
    parts.push(&sql[start.min(sql.len())..]);

    parts
        .into_iter()
        .map(strip_leading_comments)
        .filter(|part| !part.is_empty())
        .collect()
}

fn strip_leading_comments(mut part: &str) -> &str {
    loop {
        part = part.trim_start();
        if let Some(rest) = part.strip_prefix("--") {
            part = rest.split_once('\n').map_or("", |(_, tail)| tail);
        } else if let Some(rest) = part.strip_prefix("/*") {
            part = rest.split_once("*/").map_or("", |(_, tail)| tail);
        } else {
            return part;
        }
    }
}

fn deny_transaction_control(ctx: AuthContext<'_>) -> Authorization {
    match ctx.action {
        AuthAction::Transaction { .. } | AuthAction::Savepoint { .. } => Authorization::Deny,
        _ => Authorization::Allow,
    }
}

/// Runs [`DataOp`]s against a connection that is already inside the
/// migration transaction.
pub struct DataTransformExecutor;

impl DataTransformExecutor {
    pub fn execute(conn: &Connection, op: &DataOp) -> StepResult {
        let before = total_changes(conn)?;

        // Transaction control is refused while the statement is prepared, so
        // a `COMMIT` in the middle of a batch cannot split the migration.
        conn.authorizer(Some(deny_transaction_control));
        let executed = conn.execute_batch(&op.statement);
        conn.authorizer(None::<fn(AuthContext<'_>) -> Authorization>);
        match executed {
            Err(e) if e.sqlite_error_code() == Some(ErrorCode::AuthorizationForStatementDenied) => {
                return Err(StepError::Invalid(format!(
                    "data step `{}` must not control transactions",
                    op.description
                )));
            }
            executed => executed?,
        }

        if conn.is_autocommit() {
            return Err(StepError::Invalid(format!(
                "data step `{}` ended the enclosing transaction",
                op.description
            )));
        }

        let rows_affected = total_changes(conn)?.saturating_sub(before);
        debug!("{} affected {rows_affected} rows", op.describe());
        Ok(StepOutcome::Applied { rows_affected })
    }
}

fn total_changes(conn: &Connection) -> rusqlite::Result<u64> {
    conn.query_row("SELECT total_changes()", [], |row| row.get::<_, i64>(0))
        .map(|n| n.max(0) as u64)
}
