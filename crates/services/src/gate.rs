use std::collections::HashMap;
use std::sync::Arc;

use course_core::model::{Module, ModuleCatalog, ModuleId, Percent, UnlockState, UserId};
use storage::repository::{CatalogRepository, ProgressRepository};

use crate::error::GateError;

/// One catalog entry as a user currently sees it.
#[derive(Debug, Clone, PartialEq)]
pub struct ModuleStatus {
    pub module: Module,
    pub state: UnlockState,
    pub percent_complete: Percent,
    pub last_position: f64,
}

/// Answers "may this user open this module" for UI gating.
#[derive(Clone)]
pub struct ModuleGate {
    catalog: Arc<dyn CatalogRepository>,
    progress: Arc<dyn ProgressRepository>,
}

impl ModuleGate {
    #[must_use]
    pub fn new(catalog: Arc<dyn CatalogRepository>, progress: Arc<dyn ProgressRepository>) -> Self {
        Self { catalog, progress }
    }

    /// # Errors
    ///
    /// Returns `GateError` if the catalog cannot be read or is inconsistent.
    pub async fn catalog(&self) -> Result<ModuleCatalog, GateError> {
        let modules = self.catalog.list_modules().await?;
        Ok(ModuleCatalog::new(modules)?)
    }

    /// Resolve the unlock state of one module for `user`.
    ///
    /// # Errors
    ///
    /// Returns `GateError::UnknownModule` if the module is not in the catalog.
    pub async fn state(&self, user: UserId, module_id: ModuleId) -> Result<UnlockState, GateError> {
        let catalog = self.catalog().await?;
        let module = catalog
            .get(module_id)
            .ok_or(GateError::UnknownModule(module_id))?;
        let record = self.progress.get_progress(user, module_id).await?;
        Ok(UnlockState::for_module(module, record.as_ref()))
    }

    /// Record exists, or the module is the entry point.
    ///
    /// # Errors
    ///
    /// Returns `GateError` for unknown modules or storage failures.
    pub async fn is_unlocked(&self, user: UserId, module_id: ModuleId) -> Result<bool, GateError> {
        Ok(self.state(user, module_id).await?.is_unlocked())
    }

    /// Every catalog module, in sequence order, with the user's state.
    ///
    /// # Errors
    ///
    /// Returns `GateError` on catalog or storage failures.
    pub async fn overview(&self, user: UserId) -> Result<Vec<ModuleStatus>, GateError> {
        let catalog = self.catalog().await?;
        let records: HashMap<ModuleId, _> = self
            .progress
            .list_progress(user)
            .await?
            .into_iter()
            .map(|r| (r.module_id(), r))
            .collect();

        Ok(catalog
            .modules()
            .iter()
            .map(|module| {
                let record = records.get(&module.id());
                ModuleStatus {
                    module: module.clone(),
                    state: UnlockState::for_module(module, record),
                    percent_complete: record.map_or(Percent::ZERO, |r| r.percent_complete()),
                    last_position: record.map_or(0.0, |r| r.last_position()),
                }
            })
            .collect())
    }
}
