//! One cooperative event loop per viewing session.
//!
//! A session owns its observer, calculator and scheduler outright; the only
//! shared piece is the completion coordinator. Completion writes run in
//! their own task so retries never hold up sampling or a detach. Timers
//! live inside the session task and are dropped before the final flush runs.

use std::sync::Arc;
use std::time::Duration;

use course_core::Clock;
use course_core::calculator::ProgressCalculator;
use course_core::model::{ModuleCatalog, ModuleId, Percent, ProgressRecord, UnlockState, UserId};
use storage::repository::{CatalogRepository, ProgressRepository};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior, interval, interval_at, timeout_at};
use tracing::{debug, info, warn};

use crate::config::TrackingConfig;
use crate::error::{BackendError, CompletionError, GateError, SessionError};
use crate::gate::ModuleGate;
use crate::playback::{BackendConnector, ObserverEvent, PlaybackObserver, PlayerState};
use crate::tracking::{
    CompletionCoordinator, CompletionOutcome, FlushOutcome, PersistenceScheduler,
};

const COMMAND_CAPACITY: usize = 8;

type CompletionTask = JoinHandle<(f64, Result<CompletionOutcome, CompletionError>)>;

/// Latest progress of a running session, for display.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ProgressSnapshot {
    pub module: ModuleId,
    /// Percent at the current position; moves backward on a rewind.
    pub display: Percent,
    pub watermark: Percent,
    pub position: f64,
    pub state: PlayerState,
    pub completed: bool,
}

/// Summary returned once a session has shut down.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SessionReport {
    pub module: ModuleId,
    /// Successful progress writes, the final flush included.
    pub writes: u32,
    pub failed_writes: u32,
    pub final_flush: FlushOutcome,
    pub completed: bool,
    pub unlocked: Option<ModuleId>,
}

#[derive(Debug, Clone, Copy)]
enum SessionCommand {
    MarkComplete,
    Detach,
}

/// Handle to a running session.
///
/// Dropping it detaches the session as well; [`SessionHandle::detach`]
/// additionally waits for the final flush and returns the report.
pub struct SessionHandle {
    user: UserId,
    module: ModuleId,
    commands: mpsc::Sender<SessionCommand>,
    progress: watch::Receiver<ProgressSnapshot>,
    task: JoinHandle<SessionReport>,
}

impl SessionHandle {
    #[must_use]
    pub fn user(&self) -> UserId {
        self.user
    }

    #[must_use]
    pub fn module(&self) -> ModuleId {
        self.module
    }

    /// Live feed of snapshots.
    #[must_use]
    pub fn progress(&self) -> watch::Receiver<ProgressSnapshot> {
        self.progress.clone()
    }

    #[must_use]
    pub fn snapshot(&self) -> ProgressSnapshot {
        *self.progress.borrow()
    }

    /// The session ended on its own (backend closed or lost).
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Treat the module as played to the end.
    ///
    /// # Errors
    ///
    /// Returns `SessionError::Closed` if the session already ended.
    pub async fn mark_complete(&self) -> Result<(), SessionError> {
        self.commands
            .send(SessionCommand::MarkComplete)
            .await
            .map_err(|_| SessionError::Closed)
    }

    /// Stop the session: timers are cancelled, then one bounded final flush
    /// runs.
    ///
    /// # Errors
    ///
    /// Returns `SessionError::Aborted` if the session task panicked.
    pub async fn detach(self) -> Result<SessionReport, SessionError> {
        if self.commands.send(SessionCommand::Detach).await.is_err() {
            debug!(user = %self.user, module = %self.module, "session already ended");
        }
        self.task
            .await
            .map_err(|err| SessionError::Aborted(err.to_string()))
    }
}

/// Starts watch sessions for unlocked modules.
#[derive(Clone)]
pub struct WatchSessionService {
    gate: ModuleGate,
    progress: Arc<dyn ProgressRepository>,
    coordinator: Arc<CompletionCoordinator>,
    clock: Clock,
    config: TrackingConfig,
}

impl WatchSessionService {
    #[must_use]
    pub fn new(
        catalog: Arc<dyn CatalogRepository>,
        progress: Arc<dyn ProgressRepository>,
        clock: Clock,
        config: TrackingConfig,
    ) -> Self {
        let coordinator = Arc::new(CompletionCoordinator::new(
            Arc::clone(&progress),
            clock,
            &config,
        ));
        Self {
            gate: ModuleGate::new(catalog, Arc::clone(&progress)),
            progress,
            coordinator,
            clock,
            config,
        }
    }

    #[must_use]
    pub fn gate(&self) -> &ModuleGate {
        &self.gate
    }

    #[must_use]
    pub fn coordinator(&self) -> Arc<CompletionCoordinator> {
        Arc::clone(&self.coordinator)
    }

    #[must_use]
    pub fn config(&self) -> &TrackingConfig {
        &self.config
    }

    /// Open `module_id` for `user` and start tracking it.
    ///
    /// A stored position past zero is sought to before the first sample.
    ///
    /// # Errors
    ///
    /// Returns `SessionError::Locked` for a locked module,
    /// `SessionError::Backend` if the media cannot be opened or the backend
    /// does not match the module's media kind, and gate or storage errors.
    pub async fn attach(
        &self,
        user: UserId,
        module_id: ModuleId,
        connector: &dyn BackendConnector,
    ) -> Result<SessionHandle, SessionError> {
        let catalog = self.gate.catalog().await?;
        let module = catalog
            .get(module_id)
            .ok_or(GateError::UnknownModule(module_id))?
            .clone();
        let record = self.progress.get_progress(user, module_id).await?;
        if !UnlockState::for_module(&module, record.as_ref()).is_unlocked() {
            return Err(SessionError::Locked(module_id));
        }

        let backend = connector.connect(&module)?;
        if backend.kind() != module.media_kind() {
            return Err(BackendError::KindMismatch {
                expected: module.media_kind(),
                actual: backend.kind(),
            }
            .into());
        }

        let resume_from = record.as_ref().map(ProgressRecord::last_position);
        let observer = PlaybackObserver::attach(backend, self.clock, resume_from)?;
        let calculator = ProgressCalculator::new(
            self.config.threshold(),
            record
                .as_ref()
                .map_or(Percent::ZERO, ProgressRecord::percent_complete),
            record.as_ref().is_some_and(ProgressRecord::completed),
        );
        let scheduler = PersistenceScheduler::new(
            user,
            module_id,
            Arc::clone(&self.progress),
            self.clock,
            &self.config,
            record.as_ref(),
        );
        self.coordinator.track(user, module_id, record.as_ref());

        let initial = ProgressSnapshot {
            module: module_id,
            display: calculator.display(),
            watermark: calculator.watermark(),
            position: observer.last_position(),
            state: observer.state(),
            completed: calculator.completion_recorded(),
        };
        let (progress_tx, progress_rx) = watch::channel(initial);
        let (command_tx, command_rx) = mpsc::channel(COMMAND_CAPACITY);

        let runtime = SessionRuntime {
            user,
            module: module_id,
            catalog,
            observer,
            calculator,
            scheduler,
            coordinator: Arc::clone(&self.coordinator),
            commands: command_rx,
            progress: progress_tx,
            sample_interval: self.config.sample_interval(),
            flush_interval: self.config.flush_interval(),
            final_flush_timeout: self.config.final_flush_timeout(),
            position: initial.position,
            unlocked: None,
            completion: None,
        };
        let task = tokio::spawn(runtime.run());

        Ok(SessionHandle {
            user,
            module: module_id,
            commands: command_tx,
            progress: progress_rx,
            task,
        })
    }
}

struct SessionRuntime {
    user: UserId,
    module: ModuleId,
    catalog: ModuleCatalog,
    observer: PlaybackObserver,
    calculator: ProgressCalculator,
    scheduler: PersistenceScheduler,
    coordinator: Arc<CompletionCoordinator>,
    commands: mpsc::Receiver<SessionCommand>,
    progress: watch::Sender<ProgressSnapshot>,
    sample_interval: Duration,
    flush_interval: Duration,
    final_flush_timeout: Duration,
    position: f64,
    unlocked: Option<ModuleId>,
    completion: Option<CompletionTask>,
}

/// Resolves when the in-flight completion task finishes; pending without one.
async fn completion_done(
    task: &mut Option<CompletionTask>,
) -> Result<(f64, Result<CompletionOutcome, CompletionError>), tokio::task::JoinError> {
    match task.as_mut() {
        Some(task) => task.await,
        None => std::future::pending().await,
    }
}

impl SessionRuntime {
    async fn run(mut self) -> SessionReport {
        info!(
            user = %self.user,
            module = %self.module,
            kind = self.observer.kind().as_str(),
            "watch session started"
        );

        let mut sample_timer = interval(self.sample_interval);
        sample_timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut flush_timer =
            interval_at(Instant::now() + self.flush_interval, self.flush_interval);
        flush_timer.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;

                command = self.commands.recv() => match command {
                    Some(SessionCommand::MarkComplete) => {
                        let position = self.position.max(self.observer.last_position());
                        self.on_ended(position);
                    }
                    Some(SessionCommand::Detach) | None => break,
                },
                event = self.observer.next_event() => match event {
                    Some(event) => self.on_event(event).await,
                    None => {
                        debug!(user = %self.user, module = %self.module, "media backend closed");
                        break;
                    }
                },
                _ = sample_timer.tick() => match self.observer.poll() {
                    Ok(Some(event)) => self.on_event(event).await,
                    Ok(None) => {}
                    Err(err) => {
                        warn!(user = %self.user, module = %self.module, error = %err, "media backend lost");
                        break;
                    }
                },
                finished = completion_done(&mut self.completion) => {
                    self.completion = None;
                    match finished {
                        Ok((position, outcome)) => self.on_completion(position, outcome),
                        Err(err) => {
                            warn!(user = %self.user, module = %self.module, error = %err, "completion task failed");
                        }
                    }
                },
                _ = flush_timer.tick() => {
                    self.scheduler.tick().await;
                }
            }
        }

        drop(sample_timer);
        drop(flush_timer);

        // the final flush and an unfinished completion share one deadline
        let deadline = Instant::now() + self.final_flush_timeout;
        let completion = self.completion.take();
        let (final_flush, finished) = tokio::join!(
            self.scheduler.stop(self.final_flush_timeout),
            async move {
                match completion {
                    Some(task) => Some(timeout_at(deadline, task).await),
                    None => None,
                }
            }
        );
        match finished {
            Some(Ok(Ok((position, outcome)))) => self.on_completion(position, outcome),
            Some(Ok(Err(err))) => {
                warn!(user = %self.user, module = %self.module, error = %err, "completion task failed");
            }
            Some(Err(_)) => {
                // the task keeps running and clears the coordinator entry when done
                info!(user = %self.user, module = %self.module, "completion still in flight at detach");
            }
            None => {}
        }
        self.coordinator.release(self.user, self.module);

        let report = SessionReport {
            module: self.module,
            writes: self.scheduler.writes(),
            failed_writes: self.scheduler.failures(),
            final_flush,
            completed: self.calculator.completion_recorded(),
            unlocked: self.unlocked,
        };
        info!(
            user = %self.user,
            module = %self.module,
            writes = report.writes,
            final_flush = ?report.final_flush,
            completed = report.completed,
            "watch session detached"
        );
        report
    }

    async fn on_event(&mut self, event: ObserverEvent) {
        match event {
            ObserverEvent::Sample(sample) => {
                let Some(observation) = self.calculator.observe(&sample) else {
                    debug!(
                        user = %self.user,
                        module = %self.module,
                        position = sample.position,
                        "sample skipped, duration unknown"
                    );
                    return;
                };
                self.coordinator.note_progress(self.user, self.module);
                self.position = sample.position;
                self.scheduler.record(observation.watermark, sample.position);
                self.publish();
                if observation.crossed_threshold {
                    self.complete(sample.position);
                }
            }
            ObserverEvent::Ended { position } => self.on_ended(position),
            ObserverEvent::Suspended(state) => {
                debug!(user = %self.user, module = %self.module, ?state, "sampling suspended");
                self.publish();
                self.scheduler.tick().await;
            }
        }
    }

    fn on_ended(&mut self, position: f64) {
        let observation = self.calculator.observe_ended();
        self.position = position;
        self.scheduler.record(observation.watermark, position);
        self.publish();
        if observation.crossed_threshold {
            self.complete(position);
        }
    }

    fn complete(&mut self, position: f64) {
        if self.completion.is_some() {
            debug!(user = %self.user, module = %self.module, "completion task already running");
            return;
        }
        let coordinator = Arc::clone(&self.coordinator);
        let catalog = self.catalog.clone();
        let (user, module) = (self.user, self.module);
        self.completion = Some(tokio::spawn(async move {
            let outcome = coordinator.complete(user, &catalog, module, position).await;
            (position, outcome)
        }));
    }

    fn on_completion(
        &mut self,
        position: f64,
        outcome: Result<CompletionOutcome, CompletionError>,
    ) {
        match outcome {
            Ok(CompletionOutcome::Completed { unlocked }) => {
                self.calculator.mark_completion_recorded();
                self.scheduler.note_persisted(position);
                self.unlocked = unlocked;
            }
            Ok(CompletionOutcome::AlreadyCompleted) => {
                self.calculator.mark_completion_recorded();
            }
            Ok(CompletionOutcome::InFlight) => {
                debug!(user = %self.user, module = %self.module, "completion already in flight");
            }
            Err(err) => {
                warn!(
                    user = %self.user,
                    module = %self.module,
                    error = %err,
                    "completion not recorded, will retry on the next signal"
                );
            }
        }
        self.publish();
    }

    fn publish(&self) {
        self.progress.send_replace(ProgressSnapshot {
            module: self.module,
            display: self.calculator.display(),
            watermark: self.calculator.watermark(),
            position: self.position,
            state: self.observer.state(),
            completed: self.calculator.completion_recorded(),
        });
    }
}
