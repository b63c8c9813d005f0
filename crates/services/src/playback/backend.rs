use async_trait::async_trait;
use course_core::model::{MediaKind, Module};

use crate::error::BackendError;

/// Coarse playback state shared by both backends.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlayerState {
    Unstarted,
    Playing,
    Paused,
    Buffering,
    Seeking,
    Cued,
    Ended,
}

impl PlayerState {
    /// Maps the embed's numeric state codes. Unknown codes yield `None`.
    #[must_use]
    pub fn from_embed_code(code: i32) -> Option<Self> {
        match code {
            -1 => Some(PlayerState::Unstarted),
            0 => Some(PlayerState::Ended),
            1 => Some(PlayerState::Playing),
            2 => Some(PlayerState::Paused),
            3 => Some(PlayerState::Buffering),
            5 => Some(PlayerState::Cued),
            _ => None,
        }
    }

    /// Seeking has no embed code; embeds report it as buffering.
    #[must_use]
    pub fn embed_code(self) -> i32 {
        match self {
            PlayerState::Unstarted => -1,
            PlayerState::Ended => 0,
            PlayerState::Playing => 1,
            PlayerState::Paused => 2,
            PlayerState::Buffering | PlayerState::Seeking => 3,
            PlayerState::Cued => 5,
        }
    }

    #[must_use]
    pub fn is_playing(self) -> bool {
        matches!(self, PlayerState::Playing)
    }
}

/// One position reading taken from a backend.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BackendReading {
    pub position: f64,
    pub duration: Option<f64>,
    pub state: PlayerState,
}

/// Something the backend reported on its own.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum BackendEvent {
    /// Asynchronous answer to an earlier [`MediaBackend::sample_position`].
    Report(BackendReading),
    StateChanged(PlayerState),
    Ended,
    Ready,
}

/// Capability contract every media backend implements.
///
/// Native backends answer `sample_position` directly. Embedded backends
/// only fire a request and deliver the answer later through `next_event`,
/// so no call here ever waits on the media.
#[async_trait]
pub trait MediaBackend: Send {
    fn kind(&self) -> MediaKind;

    fn state(&self) -> PlayerState;

    /// Take a reading now, or request one to arrive as
    /// [`BackendEvent::Report`].
    ///
    /// # Errors
    ///
    /// Returns `BackendError::Disconnected` once the media is gone.
    fn sample_position(&mut self) -> Result<Option<BackendReading>, BackendError>;

    /// # Errors
    ///
    /// Returns `BackendError` if the backend refuses or is gone.
    fn seek(&mut self, seconds: f64) -> Result<(), BackendError>;

    /// Next backend-originated event; `None` once the backend closed.
    ///
    /// Must be cancel safe: it is polled inside `tokio::select!`.
    async fn next_event(&mut self) -> Option<BackendEvent>;
}

/// Builds the backend that renders a module's media.
pub trait BackendConnector: Send + Sync {
    /// # Errors
    ///
    /// Returns `BackendError` if the module's media cannot be opened.
    fn connect(&self, module: &Module) -> Result<Box<dyn MediaBackend>, BackendError>;
}
