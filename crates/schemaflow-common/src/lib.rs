pub mod error;
pub mod types;

pub use error::{Direction, Error, Result};
pub use types::{MigrationId, is_identifier};
