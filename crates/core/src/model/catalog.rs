use std::collections::HashSet;

use thiserror::Error;

use crate::model::ids::ModuleId;
use crate::model::module::Module;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum CatalogError {
    #[error("duplicate module id {0}")]
    DuplicateId(ModuleId),

    #[error("duplicate sequence number {0}")]
    DuplicateSequence(u32),
}

/// Read-only, sequence-ordered view of the training modules.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ModuleCatalog {
    modules: Vec<Module>,
}

impl ModuleCatalog {
    /// Build a catalog, ordering modules by sequence number.
    ///
    /// # Errors
    ///
    /// Returns `CatalogError` if two modules share an id or a sequence number.
    pub fn new(mut modules: Vec<Module>) -> Result<Self, CatalogError> {
        modules.sort_by_key(Module::sequence_number);

        let mut ids = HashSet::with_capacity(modules.len());
        for pair in modules.windows(2) {
            if pair[0].sequence_number() == pair[1].sequence_number() {
                return Err(CatalogError::DuplicateSequence(pair[1].sequence_number()));
            }
        }
        for module in &modules {
            if !ids.insert(module.id()) {
                return Err(CatalogError::DuplicateId(module.id()));
            }
        }

        Ok(Self { modules })
    }

    #[must_use]
    pub fn modules(&self) -> &[Module] {
        &self.modules
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.modules.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.modules.is_empty()
    }

    #[must_use]
    pub fn get(&self, id: ModuleId) -> Option<&Module> {
        self.modules.iter().find(|m| m.id() == id)
    }

    #[must_use]
    pub fn by_sequence(&self, sequence_number: u32) -> Option<&Module> {
        self.modules
            .binary_search_by_key(&sequence_number, Module::sequence_number)
            .ok()
            .map(|idx| &self.modules[idx])
    }

    /// The module whose sequence number immediately follows `id`'s.
    ///
    /// Returns `None` for the final module or an unknown id. Gaps in the
    /// numbering are not bridged.
    #[must_use]
    pub fn next_after(&self, id: ModuleId) -> Option<&Module> {
        let current = self.get(id)?;
        self.by_sequence(current.sequence_number().checked_add(1)?)
    }
}
