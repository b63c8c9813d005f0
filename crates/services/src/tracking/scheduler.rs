use std::sync::Arc;
use std::time::Duration;

use course_core::Clock;
use course_core::model::{ModuleId, Percent, ProgressRecord, ProgressUpdate, UserId};
use storage::repository::ProgressRepository;
use tracing::{debug, warn};

use crate::config::TrackingConfig;

/// Lifecycle of a [`PersistenceScheduler`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerState {
    Idle,
    /// A write is in flight.
    Flushing,
    /// Final flush running; no further periodic flushes.
    Stopping,
    Stopped,
}

/// Result of one flush attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushOutcome {
    Written,
    /// Buffered progress moved less than the epsilon.
    Suppressed,
    /// Nothing buffered since the last successful write.
    Clean,
    Failed,
    TimedOut,
    /// Already stopping or stopped.
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq)]
struct Pending {
    percent: Percent,
    position: f64,
}

/// Buffers the latest derived progress and writes it on a cadence.
///
/// Only the owning session drives it, and every write is awaited before the
/// next one starts, so at most one write is ever in flight.
pub struct PersistenceScheduler {
    user: UserId,
    module: ModuleId,
    store: Arc<dyn ProgressRepository>,
    clock: Clock,
    epsilon: f64,
    write_timeout: Duration,
    state: SchedulerState,
    pending: Option<Pending>,
    written: Option<Pending>,
    flushed_position: f64,
    writes: u32,
    failures: u32,
}

impl PersistenceScheduler {
    /// `stored` seeds the baseline for the epsilon rule.
    #[must_use]
    pub fn new(
        user: UserId,
        module: ModuleId,
        store: Arc<dyn ProgressRepository>,
        clock: Clock,
        config: &TrackingConfig,
        stored: Option<&ProgressRecord>,
    ) -> Self {
        Self {
            user,
            module,
            store,
            clock,
            epsilon: config.flush_epsilon_secs,
            write_timeout: config.write_timeout(),
            state: SchedulerState::Idle,
            pending: None,
            written: None,
            flushed_position: stored.map_or(0.0, ProgressRecord::last_position),
            writes: 0,
            failures: 0,
        }
    }

    #[must_use]
    pub fn state(&self) -> SchedulerState {
        self.state
    }

    /// Successful writes so far.
    #[must_use]
    pub fn writes(&self) -> u32 {
        self.writes
    }

    #[must_use]
    pub fn failures(&self) -> u32 {
        self.failures
    }

    /// Buffered progress differs from the last successful write.
    #[must_use]
    pub fn is_dirty(&self) -> bool {
        self.pending.is_some() && self.pending != self.written
    }

    fn dirty_pending(&self) -> Option<Pending> {
        self.pending.filter(|_| self.is_dirty())
    }

    /// Buffer the latest watermark and position. Ignored once stopping.
    pub fn record(&mut self, watermark: Percent, position: f64) {
        if matches!(self.state, SchedulerState::Stopping | SchedulerState::Stopped) {
            return;
        }
        self.pending = Some(Pending {
            percent: watermark,
            position,
        });
    }

    /// Another writer already persisted this position (the completion
    /// write); it becomes the new baseline.
    pub fn note_persisted(&mut self, position: f64) {
        self.flushed_position = position;
        if self
            .pending
            .is_some_and(|p| (p.position - position).abs() <= f64::EPSILON)
        {
            self.written = self.pending;
        }
    }

    /// Periodic flush: writes only if the position moved more than the
    /// epsilon since the last successful write.
    pub async fn tick(&mut self) -> FlushOutcome {
        if self.state != SchedulerState::Idle {
            return FlushOutcome::Closed;
        }
        let Some(pending) = self.dirty_pending() else {
            return FlushOutcome::Clean;
        };
        let moved = (pending.position - self.flushed_position).abs();
        if moved <= self.epsilon {
            debug!(
                user = %self.user,
                module = %self.module,
                position = pending.position,
                moved,
                "flush suppressed"
            );
            return FlushOutcome::Suppressed;
        }

        self.state = SchedulerState::Flushing;
        let outcome = self.write(pending).await;
        self.state = SchedulerState::Idle;
        outcome
    }

    /// Final best-effort flush, bypassing the epsilon rule, bounded by
    /// `timeout`. Runs once; later calls return [`FlushOutcome::Closed`].
    pub async fn stop(&mut self, timeout: Duration) -> FlushOutcome {
        if matches!(self.state, SchedulerState::Stopping | SchedulerState::Stopped) {
            return FlushOutcome::Closed;
        }
        self.state = SchedulerState::Stopping;
        let outcome = match self.dirty_pending() {
            Some(pending) => {
                let bound = timeout.min(self.write_timeout);
                match tokio::time::timeout(bound, self.write(pending)).await {
                    Ok(outcome) => outcome,
                    Err(_) => {
                        warn!(user = %self.user, module = %self.module, "final flush timed out");
                        self.failures += 1;
                        FlushOutcome::TimedOut
                    }
                }
            }
            None => FlushOutcome::Clean,
        };
        self.state = SchedulerState::Stopped;
        outcome
    }

    async fn write(&mut self, pending: Pending) -> FlushOutcome {
        let update = ProgressUpdate::progress(pending.percent, pending.position);
        let now = self.clock.now();
        let result = tokio::time::timeout(
            self.write_timeout,
            self.store
                .upsert_progress(self.user, self.module, &update, now),
        )
        .await;

        match result {
            Ok(Ok(record)) => {
                self.writes += 1;
                self.flushed_position = pending.position;
                self.written = Some(pending);
                debug!(
                    user = %self.user,
                    module = %self.module,
                    position = pending.position,
                    percent = %record.percent_complete(),
                    "progress flushed"
                );
                FlushOutcome::Written
            }
            Ok(Err(err)) => {
                self.failures += 1;
                warn!(
                    user = %self.user,
                    module = %self.module,
                    error = %err,
                    "progress flush failed"
                );
                FlushOutcome::Failed
            }
            Err(_) => {
                self.failures += 1;
                warn!(user = %self.user, module = %self.module, "progress flush timed out");
                FlushOutcome::TimedOut
            }
        }
    }
}
