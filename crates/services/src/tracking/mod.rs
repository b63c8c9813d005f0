//! Buffered persistence and the completion/unlock transition.

mod completion;
mod scheduler;

pub use completion::{CompletionCoordinator, CompletionOutcome, CompletionPhase};
pub use scheduler::{FlushOutcome, PersistenceScheduler, SchedulerState};
