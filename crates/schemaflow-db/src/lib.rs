pub mod data;
pub mod ident;
pub mod introspect;
pub mod ledger;
pub mod lock;
pub mod migration;
pub mod registry;
pub mod runner;
pub mod schema;
pub mod store;

pub use data::{DataOp, DataPurpose, DataTransformExecutor, Idempotency, Invertibility};
pub use introspect::SchemaSnapshot;
pub use ledger::{MigrationRecord, VersionLedger};
pub use lock::{LockGuard, LockHolder, LockPolicy, RunLock};
pub use migration::{MigrationDefinition, Operation, StepError, StepOutcome};
pub use registry::MigrationRegistry;
pub use runner::{ApplyReport, MigrationOutcome, MigrationRunner, MigrationStatus, RollbackReport};
pub use schema::{
    ColumnDef, DdlMode, ForeignKey, IndexDef, ReferentialAction, SchemaOp, SchemaOpKind,
};
pub use store::{open_in_memory_store, open_store, open_store_read_only};
