//! Applies and reverts registry migrations against a store.
//!
//! Each migration runs as one unit: its non-transactional prologue (if any),
//! then one immediate transaction holding every remaining step plus the
//! ledger change. A failing step drops the transaction, so the store and the
//! ledger stay exactly as they were before that migration, and the run stops.
//! Every mutating entry point holds the run lock for its whole duration and
//! refreshes it before each migration.

use std::time::Instant;

use chrono::Utc;
use rusqlite::{Connection, TransactionBehavior};
use schemaflow_common::{Direction, Error, MigrationId, Result};
use schemaflow_config::AppConfig;
use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::introspect::SchemaSnapshot;
use crate::ledger::{MigrationRecord, VersionLedger};
use crate::lock::{LockGuard, LockPolicy, RunLock};
use crate::migration::{MigrationDefinition, Operation, StepOutcome};
use crate::registry::MigrationRegistry;

/// What the ledger says relative to the registry.
#[derive(Debug, Clone, Serialize)]
pub struct MigrationStatus {
    pub applied: Vec<MigrationRecord>,
    pub pending: Vec<MigrationId>,
    /// Ledger ids that this registry does not know, e.g. written by a newer
    /// release.
    pub unknown: Vec<MigrationId>,
}

impl MigrationStatus {
    pub fn is_up_to_date(&self) -> bool {
        self.pending.is_empty() && self.unknown.is_empty()
    }

    /// Newest applied migration.
    pub fn current(&self) -> Option<&MigrationId> {
        self.applied.last().map(|r| &r.id)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct MigrationOutcome {
    pub id: MigrationId,
    pub name: String,
    pub direction: Direction,
    pub steps_applied: usize,
    pub steps_skipped: usize,
    pub rows_affected: u64,
    pub elapsed_ms: u64,
    /// Reverted through a down path that cannot restore all data.
    pub lossy: bool,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ApplyReport {
    pub migrations: Vec<MigrationOutcome>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct RollbackReport {
    pub migrations: Vec<MigrationOutcome>,
}

impl ApplyReport {
    pub fn is_empty(&self) -> bool {
        self.migrations.is_empty()
    }

    pub fn ids(&self) -> Vec<&MigrationId> {
        self.migrations.iter().map(|m| &m.id).collect()
    }
}

impl RollbackReport {
    pub fn is_empty(&self) -> bool {
        self.migrations.is_empty()
    }

    pub fn ids(&self) -> Vec<&MigrationId> {
        self.migrations.iter().map(|m| &m.id).collect()
    }
}

#[derive(Default)]
struct Tally {
    applied: usize,
    skipped: usize,
    rows: u64,
}

pub struct MigrationRunner<'r> {
    registry: &'r MigrationRegistry,
    ledger: VersionLedger,
    lock: RunLock,
    allow_lossy: bool,
}

impl<'r> MigrationRunner<'r> {
    pub fn new(registry: &'r MigrationRegistry, config: &AppConfig) -> Self {
        Self::with_parts(
            registry,
            VersionLedger::new(&config.ledger.table),
            RunLock::new(&config.ledger.lock_table, LockPolicy::from(&config.lock)),
        )
        .allow_lossy_rollback(config.rollback.allow_lossy)
    }

    pub fn with_parts(registry: &'r MigrationRegistry, ledger: VersionLedger, lock: RunLock) -> Self {
        Self {
            registry,
            ledger,
            lock,
            allow_lossy: false,
        }
    }

    /// Permit rolling back migrations whose down path loses data.
    pub fn allow_lossy_rollback(mut self, allow: bool) -> Self {
        self.allow_lossy = allow;
        self
    }

    pub fn registry(&self) -> &'r MigrationRegistry {
        self.registry
    }

    pub fn ledger(&self) -> &VersionLedger {
        &self.ledger
    }

    pub fn lock(&self) -> &RunLock {
        &self.lock
    }

    /// Compare ledger and registry. Read-only: creates nothing, takes no lock.
    pub fn status(&self, conn: &Connection) -> Result<MigrationStatus> {
        let applied = self.ledger.applied(conn)?;
        let pending = self
            .registry
            .ids()
            .filter(|id| !applied.iter().any(|r| &r.id == *id))
            .cloned()
            .collect();
        let unknown = applied
            .iter()
            .filter(|r| !self.registry.contains(&r.id))
            .map(|r| r.id.clone())
            .collect();
        Ok(MigrationStatus {
            applied,
            pending,
            unknown,
        })
    }

    /// Schema of the store without the ledger and lock tables.
    pub fn snapshot(&self, conn: &Connection) -> Result<SchemaSnapshot> {
        SchemaSnapshot::capture(conn, &[self.ledger.table(), self.lock.table()])
    }

    /// Migrations that `apply_pending_to(target)` would run, in order.
    /// Fails with [`Error::Divergence`] when the ledger is not a prefix of the
    /// registry.
    pub fn pending_for(
        &self,
        conn: &Connection,
        target: Option<&MigrationId>,
    ) -> Result<Vec<&'r MigrationDefinition>> {
        if let Some(target) = target {
            self.registry.lookup(target)?;
        }

        let status = self.status(conn)?;
        if !status.unknown.is_empty() {
            let ids: Vec<&str> = status.unknown.iter().map(MigrationId::as_str).collect();
            return Err(Error::Divergence(format!(
                "ledger records migrations unknown to this release: {}",
                ids.join(", ")
            )));
        }
        if let (Some(first), Some(newest)) = (status.pending.first(), status.current()) {
            if first < newest {
                return Err(Error::Divergence(format!(
                    "pending migration {first} predates already applied {newest}"
                )));
            }
        }

        status
            .pending
            .iter()
            .filter(|id| target.is_none_or(|target| *id <= target))
            .map(|id| self.registry.lookup(id))
            .collect()
    }

    pub fn apply_pending(&self, conn: &mut Connection) -> Result<ApplyReport> {
        self.apply_pending_to(conn, None)
    }

    /// Apply pending migrations in ascending order, stopping after `target`
    /// when one is given.
    pub fn apply_pending_to(
        &self,
        conn: &mut Connection,
        target: Option<&MigrationId>,
    ) -> Result<ApplyReport> {
        self.with_lock(conn, |conn, guard| {
            self.ledger.ensure(conn)?;
            let pending = self.pending_for(conn, target)?;
            if pending.is_empty() {
                info!("store is up to date");
                return Ok(ApplyReport::default());
            }

            info!("{} pending migration(s)", pending.len());
            let mut report = ApplyReport::default();
            for def in pending {
                self.lock.refresh(conn, guard)?;
                report
                    .migrations
                    .push(self.run_migration(conn, def, Direction::Up)?);
            }
            Ok(report)
        })
    }

    /// The last `n` applied migrations, newest first. `n` larger than the
    /// ledger is clamped.
    pub fn plan_rollback(&self, conn: &Connection, n: usize) -> Result<Vec<&'r MigrationDefinition>> {
        let applied = self.ledger.applied(conn)?;
        applied
            .iter()
            .rev()
            .take(n)
            .map(|record| {
                self.registry.lookup(&record.id).map_err(|_| {
                    Error::Divergence(format!(
                        "cannot roll back {}: not in this release's registry",
                        record.id
                    ))
                })
            })
            .collect()
    }

    /// Revert the last `n` applied migrations, newest first. Lossy migrations
    /// are refused up front unless lossy rollback is allowed.
    pub fn rollback(&self, conn: &mut Connection, n: usize) -> Result<RollbackReport> {
        self.with_lock(conn, |conn, guard| {
            let targets = self.plan_rollback(conn, n)?;
            if targets.is_empty() {
                info!("nothing to roll back");
                return Ok(RollbackReport::default());
            }

            for def in &targets {
                if def.is_lossy() {
                    if !self.allow_lossy {
                        return Err(Error::Irreversible {
                            id: def.id().to_string(),
                        });
                    }
                    warn!("rolling back {} cannot restore all of its data", def.id());
                }
            }

            let mut report = RollbackReport::default();
            for def in targets {
                self.lock.refresh(conn, guard)?;
                report
                    .migrations
                    .push(self.run_migration(conn, def, Direction::Down)?);
            }
            Ok(report)
        })
    }

    fn with_lock<T>(
        &self,
        conn: &mut Connection,
        f: impl FnOnce(&mut Connection, &LockGuard) -> Result<T>,
    ) -> Result<T> {
        let guard = self.lock.acquire(conn)?;
        let result = f(&mut *conn, &guard);
        let released = self.lock.release(conn, guard);

        match (result, released) {
            (Ok(value), Ok(())) => Ok(value),
            (Ok(_), Err(e)) => Err(e),
            (Err(e), Ok(())) => Err(e),
            (Err(e), Err(release_err)) => {
                warn!("failed to release run lock after error: {release_err}");
                Err(e)
            }
        }
    }

    fn run_migration(
        &self,
        conn: &mut Connection,
        def: &MigrationDefinition,
        direction: Direction,
    ) -> Result<MigrationOutcome> {
        let started = Instant::now();
        let steps = def.steps(direction);
        let prologue = def.prologue_len(direction);
        info!(
            "migrating {direction}: {} ({}, {} steps)",
            def.id(),
            def.name(),
            steps.len()
        );

        let mut tally = Tally::default();
        for (index, op) in steps.iter().enumerate().take(prologue) {
            run_step(conn, def, direction, index, op, &mut tally)?;
        }

        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(|e| {
                Error::Database(format!("failed to begin transaction for {}: {e}", def.id()))
            })?;
        for (index, op) in steps.iter().enumerate().skip(prologue) {
            run_step(&tx, def, direction, index, op, &mut tally)?;
        }
        match direction {
            Direction::Up => self.ledger.record(&tx, def.id(), def.name(), Utc::now())?,
            Direction::Down => self.ledger.remove(&tx, def.id())?,
        }
        tx.commit()
            .map_err(|e| Error::Database(format!("failed to commit {}: {e}", def.id())))?;

        let elapsed_ms = started.elapsed().as_millis() as u64;
        info!(
            "migrated {direction}: {} ({} applied, {} skipped, {} rows, {elapsed_ms} ms)",
            def.id(),
            tally.applied,
            tally.skipped,
            tally.rows
        );

        Ok(MigrationOutcome {
            id: def.id().clone(),
            name: def.name().to_string(),
            direction,
            steps_applied: tally.applied,
            steps_skipped: tally.skipped,
            rows_affected: tally.rows,
            elapsed_ms,
            lossy: direction == Direction::Down && def.is_lossy(),
        })
    }
}

fn run_step(
    conn: &Connection,
    def: &MigrationDefinition,
    direction: Direction,
    index: usize,
    op: &Operation,
    tally: &mut Tally,
) -> Result<()> {
    debug!("{} {direction} step {index}: {}", def.id(), op.describe());
    match op.execute(conn) {
        Ok(StepOutcome::Applied { rows_affected }) => {
            tally.applied += 1;
            tally.rows += rows_affected;
            Ok(())
        }
        Ok(StepOutcome::Skipped) => {
            tally.skipped += 1;
            Ok(())
        }
        Err(e) => {
            error!(
                "migration {} failed at {direction} step {index} ({}): {e}",
                def.id(),
                op.describe()
            );
            Err(Error::Operation {
                id: def.id().to_string(),
                name: def.name().to_string(),
                direction,
                step: index,
                cause: e.to_string(),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::{DataOp, Idempotency, Invertibility};
    use crate::schema::{ColumnDef, SchemaOp};

    const LEDGER: &str = "__SchemaLedger";
    const LOCK: &str = "__SchemaLedgerLock";

    fn runner(registry: &MigrationRegistry) -> MigrationRunner<'_> {
        MigrationRunner::with_parts(
            registry,
            VersionLedger::new(LEDGER),
            RunLock::new(LOCK, LockPolicy::default()),
        )
    }

    fn id(s: &str) -> MigrationId {
        MigrationId::parse(s).unwrap()
    }

    fn item_store() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch(
            "CREATE TABLE Item (Id INTEGER PRIMARY KEY, Bar INTEGER);
             INSERT INTO Item (Id, Bar) VALUES (1, 20), (2, 5);",
        )
        .unwrap();
        conn
    }

    fn add_foo() -> MigrationDefinition {
        MigrationDefinition::new("20240101000000_Add_Foo")
            .unwrap()
            .up(SchemaOp::add_column(
                "Item",
                ColumnDef::new("Foo", "INTEGER").not_null().default_value("0"),
            ))
            .down(SchemaOp::drop_column("Item", "Foo"))
    }

    fn flag_high_bars() -> MigrationDefinition {
        MigrationDefinition::new("20240102000000_Flag_High_Bars")
            .unwrap()
            .up(DataOp::backfill(
                "flag rows with Bar > 10",
                "UPDATE Item SET Foo = 1 WHERE Bar > 10",
                Invertibility::Invertible,
            ))
    }

    fn foo_of(conn: &Connection, id: i64) -> i64 {
        conn.query_row("SELECT Foo FROM Item WHERE Id = ?1", [id], |r| r.get(0))
            .unwrap()
    }

    #[test]
    fn applies_schema_then_data_in_order() {
        let registry = MigrationRegistry::new(vec![add_foo(), flag_high_bars()]).unwrap();
        let runner = runner(&registry);
        let mut conn = item_store();

        let report = runner.apply_pending(&mut conn).unwrap();
        assert_eq!(
            report.ids(),
            vec![&id("20240101000000_Add_Foo"), &id("20240102000000_Flag_High_Bars")]
        );
        assert_eq!(report.migrations[1].rows_affected, 1);
        assert_eq!(foo_of(&conn, 1), 1);
        assert_eq!(foo_of(&conn, 2), 0);

        let status = runner.status(&conn).unwrap();
        assert!(status.is_up_to_date());
        assert_eq!(status.current(), Some(&id("20240102000000_Flag_High_Bars")));
        assert!(runner.lock().holder(&conn).unwrap().is_none());
    }

    #[test]
    fn second_run_is_a_no_op() {
        let registry = MigrationRegistry::new(vec![add_foo(), flag_high_bars()]).unwrap();
        let runner = runner(&registry);
        let mut conn = item_store();

        runner.apply_pending(&mut conn).unwrap();
        let before = runner.snapshot(&conn).unwrap();
        let ledger_before = runner.ledger().applied(&conn).unwrap();

        let report = runner.apply_pending(&mut conn).unwrap();
        assert!(report.is_empty());
        assert_eq!(runner.snapshot(&conn).unwrap(), before);
        assert_eq!(runner.ledger().applied(&conn).unwrap(), ledger_before);
    }

    #[test]
    fn recorded_migration_is_not_reapplied() {
        let conn_setup = |conn: &mut Connection| {
            conn.execute_batch("ALTER TABLE Item ADD COLUMN Baz TEXT").unwrap();
            let ledger = VersionLedger::new(LEDGER);
            ledger.ensure(conn).unwrap();
            let tx = conn.transaction().unwrap();
            ledger
                .record(&tx, &id("20240101000000_Drop_Baz"), "Drop_Baz", Utc::now())
                .unwrap();
            tx.commit().unwrap();
        };
        let drop_baz = MigrationDefinition::new("20240101000000_Drop_Baz")
            .unwrap()
            .up(SchemaOp::drop_column("Item", "Baz"))
            .down(SchemaOp::add_column("Item", ColumnDef::new("Baz", "TEXT")));
        let registry = MigrationRegistry::new(vec![drop_baz]).unwrap();
        let runner = runner(&registry);
        let mut conn = item_store();
        conn_setup(&mut conn);

        assert!(runner.status(&conn).unwrap().pending.is_empty());
        let report = runner.apply_pending(&mut conn).unwrap();
        assert!(report.is_empty());
        // The column is still there: nothing ran.
        assert!(crate::introspect::column(&conn, "Item", "Baz").unwrap().is_some());
    }

    #[test]
    fn failing_step_discards_only_that_migration() {
        let broken = MigrationDefinition::new("20240102000000_Broken")
            .unwrap()
            .up(SchemaOp::add_column("Item", ColumnDef::new("Qux", "TEXT")))
            .up(DataOp::backfill(
                "copy from nowhere",
                "UPDATE Missing SET Qux = 1",
                Invertibility::Invertible,
            ))
            .down(SchemaOp::drop_column("Item", "Qux"));
        let later = MigrationDefinition::new("20240103000000_Later")
            .unwrap()
            .up(SchemaOp::add_column("Item", ColumnDef::new("Later", "TEXT")))
            .down(SchemaOp::drop_column("Item", "Later"));
        let registry = MigrationRegistry::new(vec![add_foo(), broken, later]).unwrap();
        let runner = runner(&registry);
        let mut conn = item_store();

        let err = runner.apply_pending(&mut conn).unwrap_err();
        match &err {
            Error::Operation {
                id, step, direction, ..
            } => {
                assert_eq!(id, "20240102000000_Broken");
                assert_eq!(*step, 1);
                assert_eq!(*direction, Direction::Up);
            }
            other => panic!("unexpected error: {other}"),
        }

        let status = runner.status(&conn).unwrap();
        let applied: Vec<&str> = status.applied.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(applied, ["20240101000000_Add_Foo"]);
        assert!(crate::introspect::column(&conn, "Item", "Qux").unwrap().is_none());
        assert!(crate::introspect::column(&conn, "Item", "Later").unwrap().is_none());
        assert!(runner.lock().holder(&conn).unwrap().is_none());
    }

    #[test]
    fn up_then_down_restores_schema() {
        let create = MigrationDefinition::new("20240101000000_Create_Channel")
            .unwrap()
            .up(SchemaOp::create_table(
                "Channel",
                vec![ColumnDef::id("Id"), ColumnDef::new("Number", "TEXT").not_null()],
                vec![],
            ))
            .up(SchemaOp::create_unique_index("IX_Channel_Number", "Channel", &["Number"]))
            .down(SchemaOp::drop_index("IX_Channel_Number"))
            .down(SchemaOp::drop_table("Channel"));
        let alter = MigrationDefinition::new("20240102000000_Bar_As_Text")
            .unwrap()
            .up(SchemaOp::alter_column("Item", ColumnDef::new("Bar", "TEXT").collate("NOCASE")))
            .down(SchemaOp::alter_column("Item", ColumnDef::new("Bar", "INTEGER")));
        let rename = MigrationDefinition::new("20240103000000_Rename_Bar")
            .unwrap()
            .up(SchemaOp::rename_column("Item", "Bar", "Score"))
            .down(SchemaOp::rename_column("Item", "Score", "Bar"));
        let registry = MigrationRegistry::new(vec![create, alter, rename]).unwrap();
        let runner = runner(&registry);

        let mut conn = item_store();
        conn.execute_batch("CREATE INDEX IX_Item_Bar ON Item (Bar)").unwrap();
        let before = runner.snapshot(&conn).unwrap();

        runner.apply_pending(&mut conn).unwrap();
        let after_up = runner.snapshot(&conn).unwrap();
        assert_ne!(after_up, before);
        assert!(after_up.table("Channel").is_some());

        let report = runner.rollback(&mut conn, 3).unwrap();
        assert_eq!(
            report.ids(),
            vec![
                &id("20240103000000_Rename_Bar"),
                &id("20240102000000_Bar_As_Text"),
                &id("20240101000000_Create_Channel"),
            ]
        );
        assert_eq!(runner.snapshot(&conn).unwrap(), before);
        assert!(runner.status(&conn).unwrap().applied.is_empty());

        let bars: Vec<i64> = conn
            .prepare("SELECT Bar FROM Item ORDER BY Id")
            .unwrap()
            .query_map([], |r| r.get(0))
            .unwrap()
            .collect::<rusqlite::Result<_>>()
            .unwrap();
        assert_eq!(bars, vec![20, 5]);
    }

    #[test]
    fn rollback_count_is_clamped() {
        let registry = MigrationRegistry::new(vec![add_foo(), flag_high_bars()]).unwrap();
        let runner = runner(&registry);
        let mut conn = item_store();
        runner.apply_pending(&mut conn).unwrap();

        let runner = runner.allow_lossy_rollback(true);
        let report = runner.rollback(&mut conn, 10).unwrap();
        assert_eq!(report.migrations.len(), 2);
        assert!(runner.rollback(&mut conn, 1).unwrap().is_empty());
        assert!(crate::introspect::column(&conn, "Item", "Foo").unwrap().is_none());
    }

    #[test]
    fn lossy_rollback_needs_permission() {
        let reset = MigrationDefinition::new("20240102000000_Reset_Bars")
            .unwrap()
            .up(DataOp::invalidate_derived("forget bars", "UPDATE Item SET Bar = NULL"));
        let registry = MigrationRegistry::new(vec![add_foo(), reset]).unwrap();
        let mut conn = item_store();
        runner(&registry).apply_pending(&mut conn).unwrap();

        let err = runner(&registry).rollback(&mut conn, 1).unwrap_err();
        assert!(matches!(err, Error::Irreversible { ref id } if id == "20240102000000_Reset_Bars"));
        assert_eq!(runner(&registry).status(&conn).unwrap().applied.len(), 2);
        assert!(runner(&registry).lock().holder(&conn).unwrap().is_none());

        let report = runner(&registry)
            .allow_lossy_rollback(true)
            .rollback(&mut conn, 1)
            .unwrap();
        assert!(report.migrations[0].lossy);
        assert_eq!(runner(&registry).status(&conn).unwrap().applied.len(), 1);
    }

    #[test]
    fn backfill_without_down_steps_is_not_silently_rolled_back() {
        let double = MigrationDefinition::new("20240101000000_Double_Bars")
            .unwrap()
            .up(DataOp::backfill(
                "double bars",
                "UPDATE Item SET Bar = Bar * 2",
                Invertibility::Invertible,
            ));
        let registry = MigrationRegistry::new(vec![double]).unwrap();
        let runner = runner(&registry);
        let mut conn = item_store();
        runner.apply_pending(&mut conn).unwrap();

        let err = runner.rollback(&mut conn, 1).unwrap_err();
        assert!(matches!(err, Error::Irreversible { ref id } if id == "20240101000000_Double_Bars"));
        assert_eq!(runner.status(&conn).unwrap().applied.len(), 1);
        let bar: i64 = conn
            .query_row("SELECT Bar FROM Item WHERE Id = 1", [], |r| r.get(0))
            .unwrap();
        assert_eq!(bar, 40);
    }

    #[test]
    fn transaction_control_in_a_data_step_is_refused_at_startup() {
        let split = MigrationDefinition::new("20240101000000_Split")
            .unwrap()
            .up(DataOp::remap(
                "split the migration",
                "UPDATE Item SET Bar = 999; COMMIT; BEGIN; UPDATE Missing SET x = 1",
                Invertibility::Lossy,
                Idempotency::NotIdempotent,
            ));
        assert!(matches!(
            MigrationRegistry::new(vec![split]),
            Err(Error::Config(_))
        ));
    }

    #[test]
    fn losing_the_lock_mid_run_halts_before_the_next_migration() {
        let registry = MigrationRegistry::new(vec![add_foo(), flag_high_bars()]).unwrap();
        let runner = runner(&registry);
        let mut conn = item_store();
        // Another runner evicts this one as soon as the first ledger row lands.
        runner.ledger().ensure(&conn).unwrap();
        conn.execute_batch(&format!(
            "CREATE TRIGGER Steal_Lock AFTER INSERT ON {LEDGER}
            BEGIN
                UPDATE {LOCK} SET Owner = 'other-runner';
            END;"
        ))
        .unwrap();

        let err = runner.apply_pending(&mut conn).unwrap_err();
        assert!(matches!(err, Error::Lock(_)), "{err}");
        let applied = runner.status(&conn).unwrap().applied;
        assert_eq!(applied.len(), 1);
        assert!(crate::introspect::column(&conn, "Item", "Foo").unwrap().is_some());
    }

    #[test]
    fn applies_up_to_target() {
        let third = MigrationDefinition::new("20240103000000_Remap_Bars")
            .unwrap()
            .up(DataOp::remap(
                "double bars",
                "UPDATE Item SET Bar = Bar * 2",
                Invertibility::Invertible,
                Idempotency::NotIdempotent,
            ))
            .down(DataOp::remap(
                "halve bars",
                "UPDATE Item SET Bar = Bar / 2",
                Invertibility::Invertible,
                Idempotency::NotIdempotent,
            ));
        let registry = MigrationRegistry::new(vec![add_foo(), flag_high_bars(), third]).unwrap();
        let runner = runner(&registry);
        let mut conn = item_store();

        let target = id("20240102000000_Flag_High_Bars");
        let report = runner.apply_pending_to(&mut conn, Some(&target)).unwrap();
        assert_eq!(report.migrations.len(), 2);
        assert_eq!(
            runner.status(&conn).unwrap().pending,
            vec![id("20240103000000_Remap_Bars")]
        );

        let missing = id("20240109000000_Missing");
        assert!(matches!(
            runner.apply_pending_to(&mut conn, Some(&missing)),
            Err(Error::NotFound(_))
        ));
    }

    #[test]
    fn unknown_ledger_entries_are_divergence() {
        let registry = MigrationRegistry::new(vec![add_foo()]).unwrap();
        let runner = runner(&registry);
        let mut conn = item_store();
        runner.ledger().ensure(&conn).unwrap();
        let tx = conn.transaction().unwrap();
        runner
            .ledger()
            .record(&tx, &id("20230101000000_From_Elsewhere"), "x", Utc::now())
            .unwrap();
        tx.commit().unwrap();

        let status = runner.status(&conn).unwrap();
        assert_eq!(status.unknown, vec![id("20230101000000_From_Elsewhere")]);
        assert!(!status.is_up_to_date());
        assert!(matches!(runner.apply_pending(&mut conn), Err(Error::Divergence(_))));
        assert!(crate::introspect::column(&conn, "Item", "Foo").unwrap().is_none());
    }

    #[test]
    fn gap_before_newest_applied_is_divergence() {
        let registry = MigrationRegistry::new(vec![add_foo(), flag_high_bars()]).unwrap();
        let runner = runner(&registry);
        let mut conn = item_store();
        runner.ledger().ensure(&conn).unwrap();
        let tx = conn.transaction().unwrap();
        runner
            .ledger()
            .record(&tx, &id("20240102000000_Flag_High_Bars"), "x", Utc::now())
            .unwrap();
        tx.commit().unwrap();

        let err = runner.pending_for(&conn, None).unwrap_err();
        assert!(matches!(err, Error::Divergence(_)), "{err}");
    }

    #[test]
    fn status_does_not_touch_the_store() {
        let registry = MigrationRegistry::new(vec![add_foo()]).unwrap();
        let runner = runner(&registry);
        let conn = item_store();

        let status = runner.status(&conn).unwrap();
        assert_eq!(status.pending, vec![id("20240101000000_Add_Foo")]);
        assert!(!runner.ledger().exists(&conn).unwrap());
        assert!(!crate::introspect::table_exists(&conn, LOCK).unwrap());
    }

    #[test]
    fn pragma_prologue_runs_outside_the_transaction() {
        let relax = MigrationDefinition::new("20240101000000_Relax_Foreign_Keys")
            .unwrap()
            .up(SchemaOp::set_pragma("foreign_keys", "OFF"))
            .up(SchemaOp::add_column("Item", ColumnDef::new("Note", "TEXT")))
            .down(SchemaOp::set_pragma("foreign_keys", "ON"))
            .down(SchemaOp::drop_column("Item", "Note"));
        let registry = MigrationRegistry::new(vec![relax]).unwrap();
        let runner = runner(&registry);
        let mut conn = item_store();
        conn.execute_batch("PRAGMA foreign_keys = ON").unwrap();

        let report = runner.apply_pending(&mut conn).unwrap();
        assert_eq!(report.migrations[0].steps_applied, 2);
        assert_eq!(
            crate::introspect::pragma_value(&conn, "foreign_keys").unwrap().as_deref(),
            Some("0")
        );

        runner.rollback(&mut conn, 1).unwrap();
        assert_eq!(
            crate::introspect::pragma_value(&conn, "foreign_keys").unwrap().as_deref(),
            Some("1")
        );
    }
}
