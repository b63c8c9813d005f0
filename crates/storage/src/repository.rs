use async_trait::async_trait;
use chrono::{DateTime, Utc};
use course_core::model::{
    Module, ModuleId, ProgressRecord, ProgressUpdate, UnlockState, UserId,
};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tracing::debug;

/// Errors surfaced by storage adapters.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum StorageError {
    #[error("not found")]
    NotFound,

    #[error("connection error: {0}")]
    Connection(String),

    #[error("serialization error: {0}")]
    Serialization(String),
}

/// Result of the combined completion + unlock write.
#[derive(Debug, Clone, PartialEq)]
pub struct CompletionWrite {
    /// The record after the write (or as found, when already completed).
    pub record: ProgressRecord,
    /// The stored record was already completed; nothing was written.
    pub already_completed: bool,
    /// The next module whose unlock record this write created.
    pub unlocked: Option<ModuleId>,
}

/// Repository contract for the module catalog.
#[async_trait]
pub trait CatalogRepository: Send + Sync {
    /// Persist or update a module.
    ///
    /// # Errors
    ///
    /// Returns `StorageError` if the module cannot be stored.
    async fn upsert_module(&self, module: &Module) -> Result<(), StorageError>;

    /// All modules, ordered by sequence number.
    ///
    /// # Errors
    ///
    /// Returns `StorageError` on read or decode failures.
    async fn list_modules(&self) -> Result<Vec<Module>, StorageError>;
}

/// Durable progress keyed by (user, module).
#[async_trait]
pub trait ProgressRepository: Send + Sync {
    /// Fetch the record for a (user, module) pair, if any.
    ///
    /// # Errors
    ///
    /// Returns `StorageError` on read or decode failures.
    async fn get_progress(
        &self,
        user: UserId,
        module: ModuleId,
    ) -> Result<Option<ProgressRecord>, StorageError>;

    /// All records for a user.
    ///
    /// # Errors
    ///
    /// Returns `StorageError` on read or decode failures.
    async fn list_progress(&self, user: UserId) -> Result<Vec<ProgressRecord>, StorageError>;

    /// Upsert merging `percent = max(existing, new)`, overwriting the
    /// position, and keeping `completed` sticky.
    ///
    /// # Errors
    ///
    /// Returns `StorageError::Serialization` for an invalid update, or other
    /// storage errors.
    async fn upsert_progress(
        &self,
        user: UserId,
        module: ModuleId,
        update: &ProgressUpdate,
        now: DateTime<Utc>,
    ) -> Result<ProgressRecord, StorageError>;

    /// Atomically mark `module` completed and unlock `next`.
    ///
    /// A no-op returning `already_completed` when the stored record is
    /// already completed.
    ///
    /// # Errors
    ///
    /// Returns `StorageError` if the transaction fails; nothing is written then.
    async fn complete_and_unlock(
        &self,
        user: UserId,
        module: ModuleId,
        last_position: f64,
        next: Option<ModuleId>,
        now: DateTime<Utc>,
    ) -> Result<CompletionWrite, StorageError>;
}

/// Simple in-memory repository implementation for testing and prototyping.
#[derive(Clone, Default)]
pub struct InMemoryRepository {
    modules: Arc<Mutex<HashMap<ModuleId, Module>>>,
    progress: Arc<Mutex<HashMap<(UserId, ModuleId), ProgressRecord>>>,
}

impl InMemoryRepository {
    #[must_use]
    pub fn new() -> Self {
        Self {
            modules: Arc::new(Mutex::new(HashMap::new())),
            progress: Arc::new(Mutex::new(HashMap::new())),
        }
    }
}

#[async_trait]
impl CatalogRepository for InMemoryRepository {
    async fn upsert_module(&self, module: &Module) -> Result<(), StorageError> {
        let mut guard = self
            .modules
            .lock()
            .map_err(|e| StorageError::Connection(e.to_string()))?;
        guard.insert(module.id(), module.clone());
        Ok(())
    }

    async fn list_modules(&self) -> Result<Vec<Module>, StorageError> {
        let guard = self
            .modules
            .lock()
            .map_err(|e| StorageError::Connection(e.to_string()))?;
        let mut modules: Vec<Module> = guard.values().cloned().collect();
        modules.sort_by_key(Module::sequence_number);
        Ok(modules)
    }
}

#[async_trait]
impl ProgressRepository for InMemoryRepository {
    async fn get_progress(
        &self,
        user: UserId,
        module: ModuleId,
    ) -> Result<Option<ProgressRecord>, StorageError> {
        let guard = self
            .progress
            .lock()
            .map_err(|e| StorageError::Connection(e.to_string()))?;
        Ok(guard.get(&(user, module)).cloned())
    }

    async fn list_progress(&self, user: UserId) -> Result<Vec<ProgressRecord>, StorageError> {
        let guard = self
            .progress
            .lock()
            .map_err(|e| StorageError::Connection(e.to_string()))?;
        let mut records: Vec<ProgressRecord> = guard
            .values()
            .filter(|r| r.user_id() == user)
            .cloned()
            .collect();
        records.sort_by_key(ProgressRecord::module_id);
        Ok(records)
    }

    async fn upsert_progress(
        &self,
        user: UserId,
        module: ModuleId,
        update: &ProgressUpdate,
        now: DateTime<Utc>,
    ) -> Result<ProgressRecord, StorageError> {
        update
            .validate()
            .map_err(|e| StorageError::Serialization(e.to_string()))?;
        let mut guard = self
            .progress
            .lock()
            .map_err(|e| StorageError::Connection(e.to_string()))?;
        let record = guard
            .entry((user, module))
            .and_modify(|r| r.apply(update, now))
            .or_insert_with(|| ProgressRecord::from_update(user, module, update, now));
        debug!(%user, %module, percent = %record.percent_complete(), "progress upserted");
        Ok(record.clone())
    }

    async fn complete_and_unlock(
        &self,
        user: UserId,
        module: ModuleId,
        last_position: f64,
        next: Option<ModuleId>,
        now: DateTime<Utc>,
    ) -> Result<CompletionWrite, StorageError> {
        let update = ProgressUpdate::completion(last_position);
        update
            .validate()
            .map_err(|e| StorageError::Serialization(e.to_string()))?;

        // one guard for both writes keeps them atomic
        let mut guard = self
            .progress
            .lock()
            .map_err(|e| StorageError::Connection(e.to_string()))?;

        if let Some(existing) = guard.get(&(user, module)) {
            if existing.unlock_state() == UnlockState::Completed {
                return Ok(CompletionWrite {
                    record: existing.clone(),
                    already_completed: true,
                    unlocked: None,
                });
            }
        }

        let record = guard
            .entry((user, module))
            .and_modify(|r| r.apply(&update, now))
            .or_insert_with(|| ProgressRecord::from_update(user, module, &update, now))
            .clone();

        let unlocked = match next {
            Some(next) if !guard.contains_key(&(user, next)) => {
                guard.insert((user, next), ProgressRecord::unlocked(user, next, now));
                Some(next)
            }
            _ => None,
        };

        Ok(CompletionWrite {
            record,
            already_completed: false,
            unlocked,
        })
    }
}

/// Aggregates catalog and progress repositories behind trait objects for easy backend swapping.
#[derive(Clone)]
pub struct Storage {
    pub modules: Arc<dyn CatalogRepository>,
    pub progress: Arc<dyn ProgressRepository>,
}

impl Storage {
    #[must_use]
    pub fn in_memory() -> Self {
        let repo = InMemoryRepository::new();
        let modules: Arc<dyn CatalogRepository> = Arc::new(repo.clone());
        let progress: Arc<dyn ProgressRepository> = Arc::new(repo);
        Self { modules, progress }
    }
}
