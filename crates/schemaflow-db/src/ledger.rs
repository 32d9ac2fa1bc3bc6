use std::collections::BTreeSet;

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{Connection, Transaction, params};
use schemaflow_common::{Error, MigrationId, Result};
use serde::Serialize;
use tracing::debug;

use crate::ident::quote;
use crate::introspect;

/// A row of the version ledger: one applied migration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MigrationRecord {
    pub id: MigrationId,
    pub name: String,
    pub applied_at: DateTime<Utc>,
}

/// Durable record of which migrations have been applied, kept as a table in
/// the migrated store itself.
///
/// Rows are only written or removed through a [`Transaction`], so a ledger
/// change always commits together with the steps it describes.
#[derive(Debug, Clone)]
pub struct VersionLedger {
    table: String,
}

impl VersionLedger {
    /// `table` must be a validated identifier (see `AppConfig::validate`).
    pub fn new(table: impl Into<String>) -> Self {
        Self {
            table: table.into(),
        }
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    pub fn exists(&self, conn: &Connection) -> Result<bool> {
        introspect::table_exists(conn, &self.table)
            .map_err(|e| Error::Database(format!("failed to inspect ledger: {e}")))
    }

    pub fn ensure(&self, conn: &Connection) -> Result<()> {
        conn.execute_batch(&format!(
            "CREATE TABLE IF NOT EXISTS {} (
                Id TEXT NOT NULL PRIMARY KEY,
                Name TEXT NOT NULL,
                AppliedAtUtc TEXT NOT NULL
            )",
            quote(&self.table)
        ))
        .map_err(|e| Error::Database(format!("failed to create ledger table: {e}")))
    }

    /// Applied migrations in ascending id order. A store without a ledger
    /// table has applied nothing; the table is not created here.
    pub fn applied(&self, conn: &Connection) -> Result<Vec<MigrationRecord>> {
        if !self.exists(conn)? {
            return Ok(Vec::new());
        }

        let mut stmt = conn
            .prepare(&format!(
                "SELECT Id, Name, AppliedAtUtc FROM {} ORDER BY Id",
                quote(&self.table)
            ))
            .map_err(|e| Error::Database(format!("failed to prepare ledger query: {e}")))?;

        let rows = stmt
            .query_map([], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                ))
            })
            .map_err(|e| Error::Database(format!("failed to query ledger: {e}")))?;

        let mut records = Vec::new();
        for row in rows {
            let (id, name, applied_at) =
                row.map_err(|e| Error::Database(format!("failed to read ledger row: {e}")))?;
            let id = MigrationId::parse(&id).map_err(|_| {
                Error::Divergence(format!("ledger contains malformed migration id `{id}`"))
            })?;
            let applied_at = DateTime::parse_from_rfc3339(&applied_at)
                .map(|dt| dt.with_timezone(&Utc))
                .map_err(|e| {
                    Error::Database(format!(
                        "ledger row {id} has an invalid timestamp `{applied_at}`: {e}"
                    ))
                })?;
            records.push(MigrationRecord {
                id,
                name,
                applied_at,
            });
        }
        Ok(records)
    }

    pub fn applied_ids(&self, conn: &Connection) -> Result<BTreeSet<MigrationId>> {
        Ok(self.applied(conn)?.into_iter().map(|r| r.id).collect())
    }

    pub fn contains(&self, conn: &Connection, id: &MigrationId) -> Result<bool> {
        if !self.exists(conn)? {
            return Ok(false);
        }
        conn.query_row(
            &format!("SELECT count(*) > 0 FROM {} WHERE Id = ?1", quote(&self.table)),
            params![id.as_str()],
            |row| row.get(0),
        )
        .map_err(|e| Error::Database(format!("failed to query ledger: {e}")))
    }

    /// Record `id` as applied. Fails with [`Error::Conflict`] if it already is.
    pub fn record(
        &self,
        tx: &Transaction<'_>,
        id: &MigrationId,
        name: &str,
        applied_at: DateTime<Utc>,
    ) -> Result<()> {
        if self.contains(tx, id)? {
            return Err(Error::Conflict { id: id.to_string() });
        }
        tx.execute(
            &format!(
                "INSERT INTO {} (Id, Name, AppliedAtUtc) VALUES (?1, ?2, ?3)",
                quote(&self.table)
            ),
            params![
                id.as_str(),
                name,
                applied_at.to_rfc3339_opts(SecondsFormat::Millis, true)
            ],
        )
        .map_err(|e| Error::Database(format!("failed to record migration {id}: {e}")))?;
        debug!("ledger: recorded {id}");
        Ok(())
    }

    /// Remove the record for `id`. Fails with [`Error::NotFound`] if absent.
    pub fn remove(&self, tx: &Transaction<'_>, id: &MigrationId) -> Result<()> {
        let removed = tx
            .execute(
                &format!("DELETE FROM {} WHERE Id = ?1", quote(&self.table)),
                params![id.as_str()],
            )
            .map_err(|e| Error::Database(format!("failed to remove migration {id}: {e}")))?;
        if removed == 0 {
            return Err(Error::NotFound(format!("migration {id} is not in the ledger")));
        }
        debug!("ledger: removed {id}");
        Ok(())
    }
}
