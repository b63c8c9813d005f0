use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use course_core::model::MediaKind;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::time::Instant;
use tracing::debug;

use super::backend::{BackendEvent, BackendReading, MediaBackend, PlayerState};
use crate::error::BackendError;

/// Messages sent to the embed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "camelCase")]
pub enum EmbedCommand {
    GetState { id: u64 },
    SeekTo { id: u64, seconds: f64 },
}

/// Messages the embed posts back.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "camelCase")]
pub enum EmbedMessage {
    StateReport {
        id: u64,
        #[serde(rename = "currentTime")]
        current_time: f64,
        duration: Option<f64>,
        state: i32,
    },
    OnStateChange {
        info: i32,
    },
    OnReady,
}

impl EmbedMessage {
    /// Anything that is not a known JSON message yields `None`.
    #[must_use]
    pub fn parse(raw: &str) -> Option<Self> {
        serde_json::from_str(raw).ok()
    }
}

/// Third-party embed reachable only through posted text messages.
///
/// Requests are tagged with a correlation id and never awaited; replies
/// come back through [`MediaBackend::next_event`]. A reply that misses its
/// deadline, or carries an unknown id, is dropped.
pub struct EmbeddedBackend {
    video_id: String,
    outbound: mpsc::Sender<String>,
    inbound: mpsc::Receiver<String>,
    reply_timeout: Duration,
    next_id: u64,
    pending: HashMap<u64, Instant>,
    state: PlayerState,
}

impl EmbeddedBackend {
    #[must_use]
    pub fn new(
        video_id: impl Into<String>,
        outbound: mpsc::Sender<String>,
        inbound: mpsc::Receiver<String>,
        reply_timeout: Duration,
    ) -> Self {
        Self {
            video_id: video_id.into(),
            outbound,
            inbound,
            reply_timeout,
            next_id: 1,
            pending: HashMap::new(),
            state: PlayerState::Unstarted,
        }
    }

    #[must_use]
    pub fn video_id(&self) -> &str {
        &self.video_id
    }

    /// Requests still waiting for a reply.
    #[must_use]
    pub fn pending_requests(&self) -> usize {
        self.pending.len()
    }

    fn post(&mut self, command: &EmbedCommand) -> Result<bool, BackendError> {
        let raw = serde_json::to_string(command)?;
        match self.outbound.try_send(raw) {
            Ok(()) => Ok(true),
            Err(TrySendError::Full(_)) => {
                debug!(video = %self.video_id, "embed outbox full, dropping request");
                Ok(false)
            }
            Err(TrySendError::Closed(_)) => Err(BackendError::Disconnected),
        }
    }

    fn allocate_id(&mut self) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    fn expire_pending(&mut self, now: Instant) {
        let before = self.pending.len();
        self.pending.retain(|_, deadline| *deadline > now);
        let expired = before - self.pending.len();
        if expired > 0 {
            debug!(video = %self.video_id, expired, "embed replies timed out");
        }
    }

    fn accept(&mut self, message: EmbedMessage) -> Option<BackendEvent> {
        match message {
            EmbedMessage::StateReport {
                id,
                current_time,
                duration,
                state,
            } => {
                self.pending.remove(&id)?;
                let state = PlayerState::from_embed_code(state)?;
                self.state = state;
                Some(BackendEvent::Report(BackendReading {
                    position: current_time,
                    duration,
                    state,
                }))
            }
            EmbedMessage::OnStateChange { info } => {
                let state = PlayerState::from_embed_code(info)?;
                if state == self.state {
                    return None;
                }
                self.state = state;
                Some(match state {
                    PlayerState::Ended => BackendEvent::Ended,
                    other => BackendEvent::StateChanged(other),
                })
            }
            EmbedMessage::OnReady => Some(BackendEvent::Ready),
        }
    }
}

#[async_trait]
impl MediaBackend for EmbeddedBackend {
    fn kind(&self) -> MediaKind {
        MediaKind::EmbeddedThirdParty
    }

    fn state(&self) -> PlayerState {
        self.state
    }

    fn sample_position(&mut self) -> Result<Option<BackendReading>, BackendError> {
        let now = Instant::now();
        self.expire_pending(now);
        let id = self.allocate_id();
        if self.post(&EmbedCommand::GetState { id })? {
            self.pending.insert(id, now + self.reply_timeout);
        }
        Ok(None)
    }

    fn seek(&mut self, seconds: f64) -> Result<(), BackendError> {
        let id = self.allocate_id();
        if self.post(&EmbedCommand::SeekTo { id, seconds })? {
            Ok(())
        } else {
            Err(BackendError::Seek(seconds))
        }
    }

    async fn next_event(&mut self) -> Option<BackendEvent> {
        loop {
            let raw = self.inbound.recv().await?;
            self.expire_pending(Instant::now());
            let Some(message) = EmbedMessage::parse(&raw) else {
                debug!(video = %self.video_id, "ignoring unrecognised embed message");
                continue;
            };
            if let Some(event) = self.accept(message) {
                return Some(event);
            }
        }
    }
}
