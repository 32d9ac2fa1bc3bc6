//! Exclusive run lock shared by every runner pointed at the same store.
//!
//! The lock is a single-row table. Claiming it is an `INSERT` of row `Id = 1`;
//! a primary key violation means another runner holds it. Because the row
//! lives in the store, the lock works across processes and hosts without any
//! side channel.

use std::thread;
use std::time::Duration;

use chrono::{DateTime, SecondsFormat, Utc};
use rand::Rng;
use rusqlite::{Connection, ErrorCode, OptionalExtension, params};
use schemaflow_common::{Error, Result};
use schemaflow_config::LockConfig;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::ident::quote;

/// Exponential backoff with jitter between claim attempts.
#[derive(Debug, Clone, PartialEq)]
pub struct LockPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub factor: f64,
    pub jitter: f64,
    pub cap: Duration,
    pub stale_after: Duration,
}

impl Default for LockPolicy {
    fn default() -> Self {
        Self::from(&LockConfig::default())
    }
}

impl From<&LockConfig> for LockPolicy {
    fn from(config: &LockConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            base_delay: Duration::from_millis(config.base_delay_ms),
            factor: config.factor,
            jitter: config.jitter,
            cap: Duration::from_millis(config.cap_ms),
            stale_after: Duration::from_secs(config.stale_after_secs),
        }
    }
}

impl LockPolicy {
    /// Delay to wait after failed attempt number `attempt` (1-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }
        let exp = (attempt - 1) as f64;
        let cap = self.cap.as_millis() as f64;
        let mut delay = (self.base_delay.as_millis() as f64 * self.factor.powf(exp)).min(cap);
        if self.jitter > 0.0 {
            let jitter = rand::rng().random_range(-self.jitter..self.jitter);
            delay *= 1.0 + jitter;
        }
        Duration::from_millis(delay.max(0.0).round() as u64)
    }
}

/// The current holder of the lock as recorded in the lock table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockHolder {
    pub owner: String,
    pub acquired_at: DateTime<Utc>,
}

/// Proof of holding the lock. Hand it back to [`RunLock::release`].
#[derive(Debug)]
#[must_use = "the run lock must be released"]
pub struct LockGuard {
    owner: String,
}

impl LockGuard {
    pub fn owner(&self) -> &str {
        &self.owner
    }
}

enum Claim {
    Acquired,
    Held(LockHolder),
    Busy,
}

#[derive(Debug, Clone)]
pub struct RunLock {
    table: String,
    policy: LockPolicy,
}

impl RunLock {
    pub fn new(table: impl Into<String>, policy: LockPolicy) -> Self {
        Self {
            table: table.into(),
            policy,
        }
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    pub fn ensure(&self, conn: &Connection) -> Result<()> {
        conn.execute_batch(&format!(
            "CREATE TABLE IF NOT EXISTS {} (
                Id INTEGER NOT NULL PRIMARY KEY CHECK (Id = 1),
                Owner TEXT NOT NULL,
                AcquiredAtUtc TEXT NOT NULL
            )",
            quote(&self.table)
        ))
        .map_err(|e| Error::Database(format!("failed to create lock table: {e}")))
    }

    /// Claim the lock, retrying with backoff while another runner holds it.
    /// A holder older than the policy's `stale_after` is assumed dead and its
    /// claim is taken over.
    pub fn acquire(&self, conn: &Connection) -> Result<LockGuard> {
        self.ensure(conn)?;
        let owner = Uuid::new_v4().to_string();

        let mut last_holder = None;
        for attempt in 1..=self.policy.max_attempts {
            match self.try_claim(conn, &owner)? {
                Claim::Acquired => {
                    info!("acquired run lock ({owner}) on attempt {attempt}");
                    return Ok(LockGuard { owner });
                }
                Claim::Held(holder) if self.is_stale(&holder) => {
                    warn!(
                        "reclaiming stale run lock held by {} since {}",
                        holder.owner, holder.acquired_at
                    );
                    if self.evict(conn, &holder)? {
                        if let Claim::Acquired = self.try_claim(conn, &owner)? {
                            info!("acquired run lock ({owner}) after reclaiming it");
                            return Ok(LockGuard { owner });
                        }
                    } else {
                        debug!("store busy while reclaiming run lock (attempt {attempt})");
                    }
                }
                Claim::Held(holder) => {
                    debug!(
                        "run lock held by {} (attempt {attempt}/{})",
                        holder.owner, self.policy.max_attempts
                    );
                    last_holder = Some(holder);
                }
                Claim::Busy => {
                    debug!("store busy while claiming run lock (attempt {attempt})");
                }
            }

            if attempt < self.policy.max_attempts {
                thread::sleep(self.policy.delay_for(attempt));
            }
        }

        Err(Error::Lock(match last_holder {
            Some(holder) => format!(
                "run lock is held by {} since {} (gave up after {} attempts)",
                holder.owner, holder.acquired_at, self.policy.max_attempts
            ),
            None => format!(
                "could not claim run lock after {} attempts",
                self.policy.max_attempts
            ),
        }))
    }

    /// Move the holder's timestamp to now so a long run is not mistaken for
    /// an abandoned one. Fails with [`Error::Lock`] if the lock was lost.
    pub fn refresh(&self, conn: &Connection, guard: &LockGuard) -> Result<()> {
        let now = Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true);
        let updated = conn
            .execute(
                &format!(
                    "UPDATE {} SET AcquiredAtUtc = ?2 WHERE Owner = ?1",
                    quote(&self.table)
                ),
                params![guard.owner, now],
            )
            .map_err(|e| Error::Database(format!("failed to refresh run lock: {e}")))?;
        if updated == 0 {
            return Err(Error::Lock(format!(
                "run lock was taken over while held by {}",
                guard.owner
            )));
        }
        debug!("refreshed run lock ({})", guard.owner);
        Ok(())
    }

    /// Release a lock obtained from [`RunLock::acquire`].
    pub fn release(&self, conn: &Connection, guard: LockGuard) -> Result<()> {
        let removed = conn
            .execute(
                &format!("DELETE FROM {} WHERE Owner = ?1", quote(&self.table)),
                params![guard.owner],
            )
            .map_err(|e| Error::Database(format!("failed to release run lock: {e}")))?;
        if removed == 0 {
            return Err(Error::Lock(format!(
                "run lock was no longer held by {}",
                guard.owner
            )));
        }
        info!("released run lock ({})", guard.owner);
        Ok(())
    }

    pub fn holder(&self, conn: &Connection) -> Result<Option<LockHolder>> {
        let row = conn
            .query_row(
                &format!(
                    "SELECT Owner, AcquiredAtUtc FROM {} WHERE Id = 1",
                    quote(&self.table)
                ),
                [],
                |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)),
            )
            .optional();

        let row = match row {
            Ok(row) => row,
            // No lock table yet: nobody holds the lock.
            Err(rusqlite::Error::SqliteFailure(_, Some(msg))) if msg.contains("no such table") => {
                return Ok(None);
            }
            Err(e) => return Err(Error::Database(format!("failed to read run lock: {e}"))),
        };

        row.map(|(owner, acquired_at)| -> Result<LockHolder> {
            let acquired_at = DateTime::parse_from_rfc3339(&acquired_at)
                .map(|dt| dt.with_timezone(&Utc))
                .map_err(|e| {
                    Error::Database(format!("run lock has an invalid timestamp `{acquired_at}`: {e}"))
                })?;
            Ok(LockHolder { owner, acquired_at })
        })
        .transpose()
    }

    fn try_claim(&self, conn: &Connection, owner: &str) -> Result<Claim> {
        let now = Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true);
        let inserted = conn.execute(
            &format!(
                "INSERT INTO {} (Id, Owner, AcquiredAtUtc) VALUES (1, ?1, ?2)",
                quote(&self.table)
            ),
            params![owner, now],
        );

        match inserted {
            Ok(_) => Ok(Claim::Acquired),
            Err(rusqlite::Error::SqliteFailure(err, _)) => match err.code {
                ErrorCode::ConstraintViolation => match self.holder(conn)? {
                    Some(holder) => Ok(Claim::Held(holder)),
                    // Released between our insert and the read.
                    None => Ok(Claim::Busy),
                },
                ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked => Ok(Claim::Busy),
                _ => Err(Error::Database(format!("failed to claim run lock: {err}"))),
            },
            Err(e) => Err(Error::Database(format!("failed to claim run lock: {e}"))),
        }
    }

    fn is_stale(&self, holder: &LockHolder) -> bool {
        (Utc::now() - holder.acquired_at)
            .to_std()
            .is_ok_and(|age| age >= self.policy.stale_after)
    }

    /// Remove a stale holder's row. `false` means the store was busy and the
    /// caller should retry later.
    fn evict(&self, conn: &Connection, holder: &LockHolder) -> Result<bool> {
        let deleted = conn.execute(
            &format!(
                "DELETE FROM {} WHERE Owner = ?1 AND AcquiredAtUtc = ?2",
                quote(&self.table)
            ),
            params![
                holder.owner,
                holder.acquired_at.to_rfc3339_opts(SecondsFormat::Millis, true)
            ],
        );
        match deleted {
            Ok(_) => Ok(true),
            Err(rusqlite::Error::SqliteFailure(err, _))
                if matches!(err.code, ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked) =>
            {
                Ok(false)
            }
            Err(e) => Err(Error::Database(format!("failed to reclaim stale run lock: {e}"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn quick_policy(max_attempts: u32) -> LockPolicy {
        LockPolicy {
            max_attempts,
            base_delay: Duration::from_millis(1),
            factor: 2.0,
            jitter: 0.0,
            cap: Duration::from_millis(5),
            stale_after: Duration::from_secs(60),
        }
    }

    #[test]
    fn backoff_grows_and_caps() {
        let policy = LockPolicy {
            max_attempts: 10,
            base_delay: Duration::from_millis(100),
            factor: 2.0,
            jitter: 0.0,
            cap: Duration::from_millis(500),
            stale_after: Duration::from_secs(60),
        };
        assert_eq!(policy.delay_for(0), Duration::ZERO);
        assert_eq!(policy.delay_for(1), Duration::from_millis(100));
        assert_eq!(policy.delay_for(2), Duration::from_millis(200));
        assert_eq!(policy.delay_for(3), Duration::from_millis(400));
        assert_eq!(policy.delay_for(4), Duration::from_millis(500));
    }

    #[test]
    fn jitter_stays_within_bounds() {
        let policy = LockPolicy {
            jitter: 0.2,
            ..quick_policy(3)
        };
        let policy = LockPolicy {
            base_delay: Duration::from_millis(1000),
            cap: Duration::from_millis(1000),
            ..policy
        };
        for _ in 0..50 {
            let ms = policy.delay_for(1).as_millis();
            assert!((800..=1200).contains(&ms), "{ms}");
        }
    }

    #[test]
    fn acquire_and_release() {
        let conn = Connection::open_in_memory().unwrap();
        let lock = RunLock::new("__SchemaLedgerLock", quick_policy(3));
        assert!(lock.holder(&conn).unwrap().is_none());

        let guard = lock.acquire(&conn).unwrap();
        let holder = lock.holder(&conn).unwrap().unwrap();
        assert_eq!(holder.owner, guard.owner());

        lock.release(&conn, guard).unwrap();
        assert!(lock.holder(&conn).unwrap().is_none());

        let again = lock.acquire(&conn).unwrap();
        lock.release(&conn, again).unwrap();
    }

    #[test]
    fn held_lock_exhausts_attempts() {
        let conn = Connection::open_in_memory().unwrap();
        let lock = RunLock::new("__SchemaLedgerLock", quick_policy(3));
        let _held = lock.acquire(&conn).unwrap();

        let err = lock.acquire(&conn).unwrap_err();
        assert!(matches!(err, Error::Lock(_)));
        assert!(err.to_string().contains("3 attempts"), "{err}");
    }

    #[test]
    fn stale_lock_is_reclaimed() {
        let conn = Connection::open_in_memory().unwrap();
        let lock = RunLock::new("__SchemaLedgerLock", quick_policy(1));
        lock.ensure(&conn).unwrap();
        conn.execute(
            "INSERT INTO __SchemaLedgerLock (Id, Owner, AcquiredAtUtc)
             VALUES (1, 'crashed-runner', '2020-01-01T00:00:00.000Z')",
            [],
        )
        .unwrap();

        let guard = lock.acquire(&conn).unwrap();
        assert_ne!(guard.owner(), "crashed-runner");
        lock.release(&conn, guard).unwrap();
    }

    #[test]
    fn refreshed_lock_is_not_reclaimed() {
        let conn = Connection::open_in_memory().unwrap();
        let lock = RunLock::new("__SchemaLedgerLock", quick_policy(1));
        let guard = lock.acquire(&conn).unwrap();
        conn.execute(
            "UPDATE __SchemaLedgerLock SET AcquiredAtUtc = '2020-01-01T00:00:00.000Z'",
            [],
        )
        .unwrap();

        lock.refresh(&conn, &guard).unwrap();
        let holder = lock.holder(&conn).unwrap().unwrap();
        assert!(!lock.is_stale(&holder));
        assert!(matches!(lock.acquire(&conn), Err(Error::Lock(_))));

        lock.release(&conn, guard).unwrap();
    }

    #[test]
    fn refreshing_a_lost_lock_fails() {
        let conn = Connection::open_in_memory().unwrap();
        let lock = RunLock::new("__SchemaLedgerLock", quick_policy(1));
        let guard = lock.acquire(&conn).unwrap();
        conn.execute("DELETE FROM __SchemaLedgerLock", []).unwrap();

        assert!(matches!(lock.refresh(&conn, &guard), Err(Error::Lock(_))));
    }

    #[test]
    fn busy_store_during_reclaim_is_retried() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("store.sqlite3");
        let lock = RunLock::new("__SchemaLedgerLock", quick_policy(1));

        let holder = Connection::open(&path).unwrap();
        lock.ensure(&holder).unwrap();
        holder
            .execute(
                "INSERT INTO __SchemaLedgerLock (Id, Owner, AcquiredAtUtc)
                 VALUES (1, 'crashed-runner', '2020-01-01T00:00:00.000Z')",
                [],
            )
            .unwrap();

        // Another connection holds a write lock on the store.
        let writer = Connection::open(&path).unwrap();
        writer.execute_batch("BEGIN IMMEDIATE").unwrap();

        let conn = Connection::open(&path).unwrap();
        conn.busy_timeout(Duration::ZERO).unwrap();
        let stale = lock.holder(&conn).unwrap().unwrap();
        assert!(!lock.evict(&conn, &stale).unwrap());

        writer.execute_batch("COMMIT").unwrap();
        assert!(lock.evict(&conn, &stale).unwrap());
        assert!(lock.holder(&conn).unwrap().is_none());
    }

    #[test]
    fn releasing_a_lost_lock_fails() {
        let conn = Connection::open_in_memory().unwrap();
        let lock = RunLock::new("__SchemaLedgerLock", quick_policy(1));
        let guard = lock.acquire(&conn).unwrap();
        conn.execute("DELETE FROM __SchemaLedgerLock", []).unwrap();

        assert!(matches!(lock.release(&conn, guard), Err(Error::Lock(_))));
    }
}
