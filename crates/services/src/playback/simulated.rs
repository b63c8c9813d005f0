//! In-process players for the command-line binary and for tests.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use course_core::model::{MediaKind, Module};
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tracing::debug;

use super::backend::{BackendConnector, MediaBackend, PlayerState};
use super::embedded::{EmbedCommand, EmbedMessage, EmbeddedBackend};
use super::native::{NativeBackend, NativePlayer};
use crate::error::BackendError;

const EMBED_CHANNEL_CAPACITY: usize = 32;

#[derive(Debug)]
struct Timeline {
    duration: Option<f64>,
    rate: f64,
    /// Position at `anchor`, or the frozen position when not playing.
    base: f64,
    anchor: Option<Instant>,
    seeks: Vec<f64>,
}

impl Timeline {
    fn position_at(&self, now: Instant) -> f64 {
        let elapsed = self
            .anchor
            .map_or(0.0, |anchor| now.duration_since(anchor).as_secs_f64());
        let position = self.base + elapsed * self.rate;
        match self.duration {
            Some(duration) => position.min(duration),
            None => position,
        }
    }

    fn freeze(&mut self, now: Instant) {
        self.base = self.position_at(now);
        self.anchor = None;
    }
}

/// Clock-driven player: the position advances with tokio time at `rate`
/// seconds of media per second while playing, and the player ends itself
/// once it reaches the duration.
#[derive(Debug)]
pub struct SimulatedPlayer {
    timeline: Mutex<Timeline>,
    states: watch::Sender<PlayerState>,
}

impl SimulatedPlayer {
    /// A player that has not started yet.
    #[must_use]
    pub fn new(duration: Option<f64>) -> Arc<Self> {
        let (states, _) = watch::channel(PlayerState::Unstarted);
        Arc::new(Self {
            timeline: Mutex::new(Timeline {
                duration,
                rate: 1.0,
                base: 0.0,
                anchor: None,
                seeks: Vec::new(),
            }),
            states,
        })
    }

    /// A player already playing at the given rate.
    #[must_use]
    pub fn playing(duration: f64, rate: f64) -> Arc<Self> {
        let player = Self::new(Some(duration));
        player.set_rate(rate);
        player.play();
        player
    }

    fn timeline(&self) -> std::sync::MutexGuard<'_, Timeline> {
        self.timeline.lock().unwrap_or_else(PoisonError::into_inner)
    }

    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<PlayerState> {
        self.states.subscribe()
    }

    #[must_use]
    pub fn state(&self) -> PlayerState {
        *self.states.borrow()
    }

    pub fn play(&self) {
        let now = Instant::now();
        let mut timeline = self.timeline();
        if timeline.anchor.is_none() {
            timeline.anchor = Some(now);
        }
        drop(timeline);
        self.states.send_replace(PlayerState::Playing);
    }

    pub fn pause(&self) {
        self.hold(PlayerState::Paused);
    }

    pub fn buffer(&self) {
        self.hold(PlayerState::Buffering);
    }

    /// Jump to the end and fire the end event.
    pub fn finish(&self) {
        let mut timeline = self.timeline();
        timeline.anchor = None;
        if let Some(duration) = timeline.duration {
            timeline.base = duration;
        }
        drop(timeline);
        self.states.send_replace(PlayerState::Ended);
    }

    pub fn set_rate(&self, rate: f64) {
        let now = Instant::now();
        let mut timeline = self.timeline();
        if timeline.anchor.is_some() {
            timeline.base = timeline.position_at(now);
            timeline.anchor = Some(now);
        }
        timeline.rate = rate;
    }

    pub fn set_duration(&self, duration: Option<f64>) {
        self.timeline().duration = duration;
    }

    /// Every position a seek was requested to, in order.
    #[must_use]
    pub fn seeks(&self) -> Vec<f64> {
        self.timeline().seeks.clone()
    }

    /// Native backend reading this player directly.
    #[must_use]
    pub fn native_backend(self: &Arc<Self>) -> NativeBackend {
        let player: Arc<dyn NativePlayer> = Arc::clone(self) as Arc<dyn NativePlayer>;
        NativeBackend::new(player, self.subscribe())
    }

    fn hold(&self, state: PlayerState) {
        self.timeline().freeze(Instant::now());
        self.states.send_replace(state);
    }

    fn observe_end(&self, position: f64, duration: Option<f64>) {
        if duration.is_some_and(|d| position >= d) && self.state().is_playing() {
            self.timeline().freeze(Instant::now());
            self.states.send_replace(PlayerState::Ended);
        }
    }
}

impl NativePlayer for SimulatedPlayer {
    fn current_position(&self) -> f64 {
        let (position, duration) = {
            let timeline = self.timeline();
            (timeline.position_at(Instant::now()), timeline.duration)
        };
        self.observe_end(position, duration);
        position
    }

    fn duration(&self) -> Option<f64> {
        self.timeline().duration
    }

    fn seek(&self, seconds: f64) -> Result<(), BackendError> {
        if !seconds.is_finite() || seconds < 0.0 {
            return Err(BackendError::Seek(seconds));
        }
        let now = Instant::now();
        let mut timeline = self.timeline();
        timeline.seeks.push(seconds);
        timeline.base = timeline.duration.map_or(seconds, |d| seconds.min(d));
        if timeline.anchor.is_some() {
            timeline.anchor = Some(now);
        }
        Ok(())
    }
}

/// Embed stand-in speaking the JSON message protocol on top of a
/// [`SimulatedPlayer`].
pub struct SimulatedEmbed;

impl SimulatedEmbed {
    /// Spawn the embed side and return the backend talking to it.
    ///
    /// While `drop_replies` is set, state requests go unanswered.
    /// Must be called within a tokio runtime.
    #[must_use]
    pub fn spawn(
        player: Arc<SimulatedPlayer>,
        video_id: String,
        drop_replies: Arc<AtomicBool>,
        reply_timeout: Duration,
    ) -> EmbeddedBackend {
        let (command_tx, command_rx) = mpsc::channel(EMBED_CHANNEL_CAPACITY);
        let (message_tx, message_rx) = mpsc::channel(EMBED_CHANNEL_CAPACITY);
        tokio::spawn(serve_embed(
            player,
            video_id.clone(),
            drop_replies,
            command_rx,
            message_tx,
        ));
        EmbeddedBackend::new(video_id, command_tx, message_rx, reply_timeout)
    }
}

async fn serve_embed(
    player: Arc<SimulatedPlayer>,
    video_id: String,
    drop_replies: Arc<AtomicBool>,
    mut commands: mpsc::Receiver<String>,
    messages: mpsc::Sender<String>,
) {
    let mut states = player.subscribe();
    let initial = *states.borrow_and_update();
    let greeting = [
        EmbedMessage::OnReady,
        EmbedMessage::OnStateChange {
            info: initial.embed_code(),
        },
    ];
    for message in &greeting {
        if !post(&messages, message).await {
            return;
        }
    }

    loop {
        let message = tokio::select! {
            command = commands.recv() => {
                let Some(raw) = command else { break };
                match serde_json::from_str::<EmbedCommand>(&raw) {
                    Ok(EmbedCommand::GetState { id }) => {
                        if drop_replies.load(Ordering::SeqCst) {
                            continue;
                        }
                        let position = player.current_position();
                        EmbedMessage::StateReport {
                            id,
                            current_time: position,
                            duration: player.duration(),
                            state: player.state().embed_code(),
                        }
                    }
                    Ok(EmbedCommand::SeekTo { seconds, .. }) => {
                        if let Err(err) = player.seek(seconds) {
                            debug!(%video_id, error = %err, "embed ignored seek");
                        }
                        continue;
                    }
                    Err(err) => {
                        debug!(%video_id, error = %err, "embed ignored command");
                        continue;
                    }
                }
            }
            changed = states.changed() => {
                if changed.is_err() {
                    break;
                }
                let state = *states.borrow_and_update();
                EmbedMessage::OnStateChange { info: state.embed_code() }
            }
        };
        if !post(&messages, &message).await {
            break;
        }
    }
    debug!(%video_id, "simulated embed closed");
}

async fn post(messages: &mpsc::Sender<String>, message: &EmbedMessage) -> bool {
    match serde_json::to_string(message) {
        Ok(raw) => messages.send(raw).await.is_ok(),
        Err(_) => false,
    }
}

/// Connects every module to one shared [`SimulatedPlayer`], natively or
/// through a simulated embed depending on the module's media kind.
#[derive(Clone)]
pub struct SimulatedConnector {
    player: Arc<SimulatedPlayer>,
    drop_replies: Arc<AtomicBool>,
    reply_timeout: Duration,
}

impl SimulatedConnector {
    #[must_use]
    pub fn new(player: Arc<SimulatedPlayer>, reply_timeout: Duration) -> Self {
        Self {
            player,
            drop_replies: Arc::new(AtomicBool::new(false)),
            reply_timeout,
        }
    }

    #[must_use]
    pub fn player(&self) -> Arc<SimulatedPlayer> {
        Arc::clone(&self.player)
    }

    /// Make simulated embeds stop (or resume) answering state requests.
    pub fn drop_replies(&self, drop: bool) {
        self.drop_replies.store(drop, Ordering::SeqCst);
    }
}

impl BackendConnector for SimulatedConnector {
    fn connect(&self, module: &Module) -> Result<Box<dyn MediaBackend>, BackendError> {
        match module.media_kind() {
            MediaKind::NativeStream => Ok(Box::new(self.player.native_backend())),
            MediaKind::EmbeddedThirdParty => {
                let video_id = module.media_locator().embed_video_id().ok_or_else(|| {
                    BackendError::UnsupportedLocator(module.media_locator().to_persisted())
                })?;
                Ok(Box::new(SimulatedEmbed::spawn(
                    Arc::clone(&self.player),
                    video_id,
                    Arc::clone(&self.drop_replies),
                    self.reply_timeout,
                )))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::playback::backend::BackendEvent;

    #[tokio::test(start_paused = true)]
    async fn player_advances_with_time_and_ends() {
        let player = SimulatedPlayer::playing(10.0, 2.0);
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert!((player.current_position() - 4.0).abs() < 1e-6);

        player.pause();
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert!((player.current_position() - 4.0).abs() < 1e-6);

        player.play();
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert!((player.current_position() - 10.0).abs() < 1e-6);
        assert_eq!(player.state(), PlayerState::Ended);
    }

    #[tokio::test(start_paused = true)]
    async fn seek_moves_the_position() {
        let player = SimulatedPlayer::playing(100.0, 0.0);
        player.seek(42.0).unwrap();
        assert!((player.current_position() - 42.0).abs() < 1e-6);
        assert!(player.seek(-1.0).is_err());
        assert_eq!(player.seeks(), vec![42.0]);
    }

    #[tokio::test(start_paused = true)]
    async fn embed_answers_state_requests() {
        let player = SimulatedPlayer::playing(60.0, 0.0);
        player.seek(15.0).unwrap();
        let mut backend = SimulatedEmbed::spawn(
            Arc::clone(&player),
            "dQw4w9WgXcQ".into(),
            Arc::new(AtomicBool::new(false)),
            Duration::from_secs(1),
        );

        assert_eq!(backend.next_event().await, Some(BackendEvent::Ready));
        assert_eq!(
            backend.next_event().await,
            Some(BackendEvent::StateChanged(PlayerState::Playing))
        );

        backend.sample_position().unwrap();
        let Some(BackendEvent::Report(reading)) = backend.next_event().await else {
            panic!("expected a state report");
        };
        assert!((reading.position - 15.0).abs() < 1e-6);
        assert_eq!(reading.duration, Some(60.0));
    }
}
