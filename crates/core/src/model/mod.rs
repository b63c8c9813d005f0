mod catalog;
mod ids;
mod module;
mod progress;

pub use ids::{ModuleId, ParseIdError, UserId};

pub use catalog::{CatalogError, ModuleCatalog};
pub use module::{MediaKind, MediaLocator, Module, ModuleError};
pub use progress::{Percent, ProgressError, ProgressRecord, ProgressUpdate, UnlockState};
