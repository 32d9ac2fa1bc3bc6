use std::path::PathBuf;

use schemaflow_common::{Error, Result, is_identifier};
use serde::{Deserialize, Serialize};

/// Top-level configuration for the migration runner.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub database: DatabaseConfig,
    pub ledger: LedgerConfig,
    pub lock: LockConfig,
    pub rollback: RollbackConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    /// Path to the SQLite database file. `None` means the CLI must be told.
    pub path: Option<PathBuf>,
    pub busy_timeout_ms: u64,
    pub journal_mode: String,
    pub foreign_keys: bool,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: None,
            busy_timeout_ms: 5_000,
            journal_mode: "wal".to_string(),
            foreign_keys: true,
        }
    }
}

/// Names of the bookkeeping tables kept inside the migrated store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LedgerConfig {
    pub table: String,
    pub lock_table: String,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            table: "__SchemaLedger".to_string(),
            lock_table: "__SchemaLedgerLock".to_string(),
        }
    }
}

/// Retry policy for acquiring the exclusive run lock.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LockConfig {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub factor: f64,
    pub jitter: f64,
    pub cap_ms: u64,
    /// A lock held longer than this is treated as abandoned by a crashed runner.
    pub stale_after_secs: u64,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            max_attempts: 10,
            base_delay_ms: 100,
            factor: 2.0,
            jitter: 0.2,
            cap_ms: 5_000,
            stale_after_secs: 900,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RollbackConfig {
    /// Permit reverting migrations whose down path cannot restore data.
    pub allow_lossy: bool,
}

impl AppConfig {
    pub fn validate(&self) -> Result<()> {
        for (field, name) in [
            ("ledger.table", &self.ledger.table),
            ("ledger.lock_table", &self.ledger.lock_table),
        ] {
            if !is_identifier(name) {
                return Err(Error::Config(format!(
                    "{field} `{name}` is not a valid table name"
                )));
            }
        }
        if self.ledger.table == self.ledger.lock_table {
            return Err(Error::Config(
                "ledger.table and ledger.lock_table must differ".into(),
            ));
        }

        if !is_identifier(&self.database.journal_mode) {
            return Err(Error::Config(format!(
                "database.journal_mode `{}` is not a valid mode",
                self.database.journal_mode
            )));
        }

        let lock = &self.lock;
        if lock.max_attempts == 0 {
            return Err(Error::Config("lock.max_attempts must be at least 1".into()));
        }
        if lock.factor.is_nan() || lock.factor < 1.0 {
            return Err(Error::Config("lock.factor must be >= 1.0".into()));
        }
        if !(0.0..1.0).contains(&lock.jitter) {
            return Err(Error::Config("lock.jitter must be in [0, 1)".into()));
        }
        if lock.cap_ms < lock.base_delay_ms {
            return Err(Error::Config(
                "lock.cap_ms must not be smaller than lock.base_delay_ms".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = AppConfig::default();
        config.validate().unwrap();
        assert_eq!(config.ledger.table, "__SchemaLedger");
        assert_eq!(config.lock.max_attempts, 10);
        assert!(!config.rollback.allow_lossy);
    }

    #[test]
    fn rejects_unsafe_table_names() {
        let mut config = AppConfig::default();
        config.ledger.table = "ledger; DROP TABLE x".into();
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.ledger.lock_table = config.ledger.table.clone();
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_bad_lock_policy() {
        let mut config = AppConfig::default();
        config.lock.max_attempts = 0;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.lock.jitter = 1.5;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.lock.cap_ms = 10;
        assert!(config.validate().is_err());
    }
}
