use std::sync::Arc;

use course_core::model::{MediaKind, MediaLocator, Module, ModuleId};
use storage::repository::{CatalogRepository, Storage};
use tracing::info;

use crate::Clock;
use crate::config::TrackingConfig;
use crate::error::AppServicesError;
use crate::gate::ModuleGate;
use crate::session::WatchSessionService;

/// Assembles the gate and the watch-session service over one storage.
#[derive(Clone)]
pub struct AppServices {
    storage: Storage,
    gate: Arc<ModuleGate>,
    sessions: Arc<WatchSessionService>,
}

impl AppServices {
    /// Build services backed by `SQLite` storage.
    ///
    /// # Errors
    ///
    /// Returns `AppServicesError` if the config is invalid or storage
    /// initialization fails.
    pub async fn new_sqlite(
        db_url: &str,
        clock: Clock,
        config: TrackingConfig,
    ) -> Result<Self, AppServicesError> {
        config.validate()?;
        let storage = Storage::sqlite(db_url).await?;
        Ok(Self::from_storage(storage, clock, config))
    }

    /// Build services over in-memory storage.
    ///
    /// # Errors
    ///
    /// Returns `AppServicesError::Config` if the config is invalid.
    pub fn in_memory(clock: Clock, config: TrackingConfig) -> Result<Self, AppServicesError> {
        config.validate()?;
        Ok(Self::from_storage(Storage::in_memory(), clock, config))
    }

    fn from_storage(storage: Storage, clock: Clock, config: TrackingConfig) -> Self {
        let sessions = Arc::new(WatchSessionService::new(
            Arc::clone(&storage.modules),
            Arc::clone(&storage.progress),
            clock,
            config,
        ));
        let gate = Arc::new(sessions.gate().clone());
        Self {
            storage,
            gate,
            sessions,
        }
    }

    #[must_use]
    pub fn storage(&self) -> &Storage {
        &self.storage
    }

    #[must_use]
    pub fn gate(&self) -> Arc<ModuleGate> {
        Arc::clone(&self.gate)
    }

    #[must_use]
    pub fn sessions(&self) -> Arc<WatchSessionService> {
        Arc::clone(&self.sessions)
    }

    /// Write the demo catalog unless modules already exist.
    ///
    /// Returns how many modules were written.
    ///
    /// # Errors
    ///
    /// Returns `AppServicesError` on storage failures.
    pub async fn ensure_demo_catalog(&self) -> Result<usize, AppServicesError> {
        ensure_demo_catalog(self.storage.modules.as_ref()).await
    }
}

async fn ensure_demo_catalog(catalog: &dyn CatalogRepository) -> Result<usize, AppServicesError> {
    if !catalog.list_modules().await?.is_empty() {
        return Ok(0);
    }

    let modules = [
        Module::new(
            ModuleId::new(1),
            1,
            "Orientation",
            MediaLocator::from_file("media/orientation.mp4")?,
            MediaKind::NativeStream,
        )?,
        Module::with_inferred_kind(
            ModuleId::new(2),
            2,
            "Safety walkthrough",
            MediaLocator::from_url("https://www.youtube.com/watch?v=dQw4w9WgXcQ")?,
        )?,
        Module::new(
            ModuleId::new(3),
            3,
            "Field practice",
            MediaLocator::from_file("media/field-practice.mp4")?,
            MediaKind::NativeStream,
        )?,
    ];
    for module in &modules {
        catalog.upsert_module(module).await?;
    }
    info!(count = modules.len(), "seeded demo catalog");
    Ok(modules.len())
}
