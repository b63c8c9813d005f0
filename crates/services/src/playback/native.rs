use std::sync::Arc;

use async_trait::async_trait;
use course_core::model::MediaKind;
use tokio::sync::watch;

use super::backend::{BackendEvent, BackendReading, MediaBackend, PlayerState};
use crate::error::BackendError;

/// Direct property access to a locally rendered player.
pub trait NativePlayer: Send + Sync {
    fn current_position(&self) -> f64;

    /// `None` until the media metadata has loaded.
    fn duration(&self) -> Option<f64>;

    /// # Errors
    ///
    /// Returns `BackendError::Seek` if the player rejects the position.
    fn seek(&self, seconds: f64) -> Result<(), BackendError>;
}

/// Native backend: readings are synchronous, state changes (including the
/// natural end event) arrive through a `watch` channel.
pub struct NativeBackend {
    player: Arc<dyn NativePlayer>,
    states: watch::Receiver<PlayerState>,
    last: PlayerState,
}

impl NativeBackend {
    #[must_use]
    pub fn new(player: Arc<dyn NativePlayer>, mut states: watch::Receiver<PlayerState>) -> Self {
        let last = *states.borrow_and_update();
        Self {
            player,
            states,
            last,
        }
    }
}

#[async_trait]
impl MediaBackend for NativeBackend {
    fn kind(&self) -> MediaKind {
        MediaKind::NativeStream
    }

    fn state(&self) -> PlayerState {
        self.last
    }

    fn sample_position(&mut self) -> Result<Option<BackendReading>, BackendError> {
        if self.states.has_changed().is_err() {
            return Err(BackendError::Disconnected);
        }
        let position = self.player.current_position();
        Ok(Some(BackendReading {
            position,
            duration: self.player.duration(),
            state: *self.states.borrow(),
        }))
    }

    fn seek(&mut self, seconds: f64) -> Result<(), BackendError> {
        self.player.seek(seconds)
    }

    async fn next_event(&mut self) -> Option<BackendEvent> {
        loop {
            self.states.changed().await.ok()?;
            let state = *self.states.borrow_and_update();
            if state == self.last {
                continue;
            }
            self.last = state;
            return Some(match state {
                PlayerState::Ended => BackendEvent::Ended,
                other => BackendEvent::StateChanged(other),
            });
        }
    }
}
