use course_core::Clock;
use course_core::calculator::PlaybackSample;
use course_core::model::MediaKind;
use tracing::debug;

use super::backend::{BackendEvent, BackendReading, MediaBackend, PlayerState};
use crate::error::BackendError;

/// What the observer hands to the session loop.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ObserverEvent {
    Sample(PlaybackSample),
    /// Playback left the playing state; sampling is suspended.
    Suspended(PlayerState),
    /// End of media, with the best known final position.
    Ended { position: f64 },
}

/// Turns either backend into one stream of samples and end signals.
///
/// Sampling only happens while the backend is playing; buffering, seeking
/// and pauses suspend it. The observer never touches storage.
pub struct PlaybackObserver {
    backend: Box<dyn MediaBackend>,
    clock: Clock,
    state: PlayerState,
    last_position: f64,
    last_duration: Option<f64>,
    ended: bool,
}

impl PlaybackObserver {
    /// Wrap `backend`, seeking to `resume_from` first when it is past zero.
    ///
    /// # Errors
    ///
    /// Returns `BackendError` if the resume seek fails.
    pub fn attach(
        mut backend: Box<dyn MediaBackend>,
        clock: Clock,
        resume_from: Option<f64>,
    ) -> Result<Self, BackendError> {
        let mut last_position = 0.0;
        if let Some(position) = resume_from.filter(|p| p.is_finite() && *p > 0.0) {
            backend.seek(position)?;
            last_position = position;
            debug!(position, "resumed playback");
        }
        let state = backend.state();
        Ok(Self {
            backend,
            clock,
            state,
            last_position,
            last_duration: None,
            ended: false,
        })
    }

    #[must_use]
    pub fn kind(&self) -> MediaKind {
        self.backend.kind()
    }

    #[must_use]
    pub fn state(&self) -> PlayerState {
        self.state
    }

    #[must_use]
    pub fn is_sampling(&self) -> bool {
        self.state.is_playing()
    }

    #[must_use]
    pub fn last_position(&self) -> f64 {
        self.last_position
    }

    /// Called on every sampling tick.
    ///
    /// Native backends yield a sample right away and are only read while
    /// playing. Embedded ones are asked on every tick, since an embed may
    /// never announce a state change; the reply's own state decides whether
    /// it becomes a sample, and it arrives later from [`Self::next_event`].
    ///
    /// # Errors
    ///
    /// Returns `BackendError::Disconnected` once the media is gone.
    pub fn poll(&mut self) -> Result<Option<ObserverEvent>, BackendError> {
        if self.backend.kind() == MediaKind::NativeStream && !self.is_sampling() {
            return Ok(None);
        }
        Ok(self
            .backend
            .sample_position()?
            .and_then(|reading| self.on_reading(reading)))
    }

    /// Next event pushed by the backend. `None` once it closed.
    pub async fn next_event(&mut self) -> Option<ObserverEvent> {
        loop {
            let event = self.backend.next_event().await?;
            let translated = match event {
                BackendEvent::Report(reading) => self.on_reading(reading),
                BackendEvent::StateChanged(state) => self.on_state(state),
                BackendEvent::Ended => self.on_state(PlayerState::Ended),
                BackendEvent::Ready => None,
            };
            if translated.is_some() {
                return translated;
            }
        }
    }

    fn on_reading(&mut self, reading: BackendReading) -> Option<ObserverEvent> {
        if reading.duration.is_some() {
            self.last_duration = reading.duration;
        }
        if reading.state != self.state {
            if let Some(event) = self.on_state(reading.state) {
                return Some(event);
            }
        }
        if !reading.state.is_playing() {
            return None;
        }
        self.last_position = reading.position;
        Some(ObserverEvent::Sample(PlaybackSample::new(
            reading.position,
            reading.duration,
            self.clock.now(),
        )))
    }

    fn on_state(&mut self, state: PlayerState) -> Option<ObserverEvent> {
        let was_playing = self.state.is_playing();
        self.state = state;
        match state {
            PlayerState::Ended if !self.ended => {
                self.ended = true;
                Some(ObserverEvent::Ended {
                    position: self.final_position(),
                })
            }
            PlayerState::Ended => None,
            PlayerState::Playing => {
                self.ended = false;
                None
            }
            other if was_playing => Some(ObserverEvent::Suspended(other)),
            _ => None,
        }
    }

    fn final_position(&mut self) -> f64 {
        // native players can still be read at the end
        if self.backend.kind() == MediaKind::NativeStream {
            if let Ok(Some(reading)) = self.backend.sample_position() {
                self.last_position = reading.position;
                if reading.duration.is_some() {
                    self.last_duration = reading.duration;
                }
            }
        }
        self.last_duration
            .filter(|d| d.is_finite() && *d > 0.0)
            .unwrap_or(self.last_position)
    }
}
