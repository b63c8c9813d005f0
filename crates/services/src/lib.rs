#![forbid(unsafe_code)]

pub mod app_services;
pub mod config;
pub mod error;
pub mod gate;
pub mod playback;
pub mod session;
pub mod tracking;

pub use course_core::Clock;

pub use app_services::AppServices;
pub use config::TrackingConfig;
pub use error::{
    AppServicesError, BackendError, CompletionError, ConfigError, GateError, SessionError,
};
pub use gate::{ModuleGate, ModuleStatus};
pub use session::{ProgressSnapshot, SessionHandle, SessionReport, WatchSessionService};
pub use tracking::{
    CompletionCoordinator, CompletionOutcome, CompletionPhase, FlushOutcome,
    PersistenceScheduler, SchedulerState,
};
