//! Migration definitions as plain data.
//!
//! A migration is an id, a name and two ordered lists of [`Operation`]s. The
//! runner interprets them; nothing here touches the store except
//! [`Operation::execute`].

use rusqlite::Connection;
use schemaflow_common::{Direction, Error, MigrationId, Result};
use serde::Serialize;
use thiserror::Error as ThisError;

use crate::data::{DataOp, DataTransformExecutor};
use crate::schema::{DdlMode, SchemaOp};

/// Result of executing one step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepOutcome {
    Applied { rows_affected: u64 },
    /// The idempotent guard found the target state already in place.
    Skipped,
}

#[derive(Debug, ThisError)]
pub enum StepError {
    #[error(transparent)]
    Sqlite(#[from] rusqlite::Error),

    #[error("{0}")]
    Invalid(String),
}

pub type StepResult = std::result::Result<StepOutcome, StepError>;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Operation {
    Schema(SchemaOp),
    Data(DataOp),
}

impl Operation {
    pub fn ddl_mode(&self) -> DdlMode {
        match self {
            Operation::Schema(op) => op.kind().ddl_mode(),
            Operation::Data(_) => DdlMode::Transactional,
        }
    }

    /// A data step whose effect the down path cannot undo.
    pub fn is_lossy(&self) -> bool {
        matches!(self, Operation::Data(op) if !op.is_invertible())
    }

    pub fn describe(&self) -> String {
        match self {
            Operation::Schema(op) => op.describe(),
            Operation::Data(op) => op.describe(),
        }
    }

    pub fn validate(&self) -> std::result::Result<(), String> {
        match self {
            Operation::Schema(op) => op.validate(),
            Operation::Data(op) => op.validate(),
        }
    }

    /// Run the step against `conn`. The caller decides whether `conn` is
    /// inside a transaction; see [`DdlMode`].
    pub fn execute(&self, conn: &Connection) -> StepResult {
        match self {
            Operation::Schema(op) => op.apply(conn),
            Operation::Data(op) => DataTransformExecutor::execute(conn, op),
        }
    }
}

impl From<SchemaOp> for Operation {
    fn from(op: SchemaOp) -> Self {
        Operation::Schema(op)
    }
}

impl From<DataOp> for Operation {
    fn from(op: DataOp) -> Self {
        Operation::Data(op)
    }
}

/// One immutable, versioned unit of schema and/or data transformation.
///
/// Released definitions are never edited; a change ships as a new definition
/// with a later id.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MigrationDefinition {
    id: MigrationId,
    name: String,
    up: Vec<Operation>,
    down: Vec<Operation>,
}

impl MigrationDefinition {
    /// Start a definition; the name defaults to the id's descriptive suffix.
    pub fn new(id: &str) -> Result<Self> {
        let id = MigrationId::parse(id)?;
        let name = id.suffix().to_string();
        Ok(Self {
            id,
            name,
            up: Vec::new(),
            down: Vec::new(),
        })
    }

    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn up(mut self, op: impl Into<Operation>) -> Self {
        self.up.push(op.into());
        self
    }

    pub fn down(mut self, op: impl Into<Operation>) -> Self {
        self.down.push(op.into());
        self
    }

    pub fn id(&self) -> &MigrationId {
        &self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn up_steps(&self) -> &[Operation] {
        &self.up
    }

    pub fn down_steps(&self) -> &[Operation] {
        &self.down
    }

    pub fn steps(&self, direction: Direction) -> &[Operation] {
        match direction {
            Direction::Up => &self.up,
            Direction::Down => &self.down,
        }
    }

    /// Number of leading non-transactional steps in `direction`. These run
    /// before the migration's transaction is opened.
    pub fn prologue_len(&self, direction: Direction) -> usize {
        self.steps(direction)
            .iter()
            .take_while(|op| op.ddl_mode() == DdlMode::NonTransactional)
            .count()
    }

    /// Whether applying the down steps after the up steps can lose
    /// information: some up data step is declared lossy, or there are no down
    /// steps at all. Without down steps a rollback only forgets the ledger
    /// row, whatever the up steps declare.
    pub fn is_lossy(&self) -> bool {
        self.down.is_empty() || self.up.iter().any(Operation::is_lossy)
    }

    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(Error::Config(format!("migration {} has an empty name", self.id)));
        }
        if self.up.is_empty() {
            return Err(Error::Config(format!("migration {} has no up steps", self.id)));
        }

        for direction in [Direction::Up, Direction::Down] {
            let steps = self.steps(direction);
            let prologue = self.prologue_len(direction);
            for (index, op) in steps.iter().enumerate() {
                op.validate().map_err(|reason| {
                    Error::Config(format!(
                        "migration {} {direction} step {index}: {reason}",
                        self.id
                    ))
                })?;
                if index >= prologue && op.ddl_mode() == DdlMode::NonTransactional {
                    return Err(Error::Config(format!(
                        "migration {} {direction} step {index}: non-transactional step must \
                         precede all transactional steps",
                        self.id
                    )));
                }
            }
        }
        Ok(())
    }
}
