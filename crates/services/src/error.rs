//! Shared error types for the services crate.

use thiserror::Error;

use course_core::model::{CatalogError, MediaKind, ModuleError, ModuleId};
use storage::repository::StorageError;
use storage::sqlite::SqliteInitError;

/// Errors raised by media backends.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum BackendError {
    #[error("media backend disconnected")]
    Disconnected,
    #[error("backend plays {actual:?} media but the module needs {expected:?}")]
    KindMismatch {
        expected: MediaKind,
        actual: MediaKind,
    },
    #[error("media locator is not playable by this backend: {0}")]
    UnsupportedLocator(String),
    #[error("seek to {0}s rejected")]
    Seek(f64),
    #[error(transparent)]
    Encode(#[from] serde_json::Error),
}

/// Errors raised while loading tracking configuration.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ConfigError {
    #[error(transparent)]
    Parse(#[from] toml::de::Error),
    #[error("invalid `{field}`: {reason}")]
    Invalid {
        field: &'static str,
        reason: &'static str,
    },
}

/// Errors emitted by `CompletionCoordinator`.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum CompletionError {
    #[error("completion write timed out after {attempts} attempt(s)")]
    TimedOut { attempts: u32 },
    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// Errors emitted by `ModuleGate`.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum GateError {
    #[error("module {0} is not in the catalog")]
    UnknownModule(ModuleId),
    #[error(transparent)]
    Catalog(#[from] CatalogError),
    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// Errors emitted by watch sessions.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum SessionError {
    #[error("module {0} is locked")]
    Locked(ModuleId),
    #[error("session already closed")]
    Closed,
    #[error("session task aborted: {0}")]
    Aborted(String),
    #[error(transparent)]
    Backend(#[from] BackendError),
    #[error(transparent)]
    Gate(#[from] GateError),
    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// Errors emitted while bootstrapping app services.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum AppServicesError {
    #[error(transparent)]
    Sqlite(#[from] SqliteInitError),
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Module(#[from] ModuleError),
    #[error(transparent)]
    Gate(#[from] GateError),
}
