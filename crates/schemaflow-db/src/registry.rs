use std::collections::HashSet;

use schemaflow_common::{Error, MigrationId, Result};

use crate::migration::MigrationDefinition;

/// The ordered, immutable catalog of migrations compiled into a release.
///
/// Construction validates the whole catalog at once: ids are unique, listed
/// in strictly ascending order, and every definition passes its own checks.
#[derive(Debug, Clone)]
pub struct MigrationRegistry {
    migrations: Vec<MigrationDefinition>,
}

impl MigrationRegistry {
    pub fn new(migrations: Vec<MigrationDefinition>) -> Result<Self> {
        let mut seen = HashSet::with_capacity(migrations.len());
        for (index, def) in migrations.iter().enumerate() {
            if !seen.insert(def.id()) {
                return Err(Error::Config(format!("duplicate migration id {}", def.id())));
            }
            if index > 0 && migrations[index - 1].id() >= def.id() {
                return Err(Error::Config(format!(
                    "migration {} is listed after {}; ids must be ascending",
                    def.id(),
                    migrations[index - 1].id()
                )));
            }
            def.validate()?;
        }
        Ok(Self { migrations })
    }

    /// All definitions in ascending id order.
    pub fn enumerate(&self) -> &[MigrationDefinition] {
        &self.migrations
    }

    pub fn lookup(&self, id: &MigrationId) -> Result<&MigrationDefinition> {
        self.migrations
            .binary_search_by(|def| def.id().cmp(id))
            .map(|index| &self.migrations[index])
            .map_err(|_| Error::NotFound(format!("migration {id} is not in the registry")))
    }

    pub fn contains(&self, id: &MigrationId) -> bool {
        self.lookup(id).is_ok()
    }

    pub fn ids(&self) -> impl Iterator<Item = &MigrationId> {
        self.migrations.iter().map(MigrationDefinition::id)
    }

    pub fn latest(&self) -> Option<&MigrationDefinition> {
        self.migrations.last()
    }

    pub fn len(&self) -> usize {
        self.migrations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.migrations.is_empty()
    }
}
