use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// Which half of a migration a step belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Up,
    Down,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Up => f.write_str("up"),
            Direction::Down => f.write_str("down"),
        }
    }
}

#[derive(Error, Debug)]
pub enum Error {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("ledger conflict: migration {id} is already recorded")]
    Conflict { id: String },

    #[error("migration {id} ({name}) failed at {direction} step {step}: {cause}")]
    Operation {
        id: String,
        name: String,
        direction: Direction,
        step: usize,
        cause: String,
    },

    #[error("lock error: {0}")]
    Lock(String),

    #[error("ledger diverges from registry: {0}")]
    Divergence(String),

    #[error("migration {id} has lossy down steps; rollback requires explicit permission")]
    Irreversible { id: String },

    #[error("database error: {0}")]
    Database(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("not found: {0}")]
    NotFound(String),
}

impl Error {
    /// Id of the migration this error is attributed to, if any.
    pub fn migration_id(&self) -> Option<&str> {
        match self {
            Error::Conflict { id } | Error::Operation { id, .. } | Error::Irreversible { id } => {
                Some(id)
            }
            _ => None,
        }
    }
}
