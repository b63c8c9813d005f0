use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use course_core::Clock;
use course_core::model::{Module, ModuleCatalog, ModuleId, ProgressRecord, UserId};
use storage::repository::{CompletionWrite, ProgressRepository};
use tracing::{debug, info, warn};

use crate::config::TrackingConfig;
use crate::error::CompletionError;

/// Per-(user, module) completion lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompletionPhase {
    NotStarted,
    InProgress,
    /// A completion write is in flight.
    Completing,
    Completed,
}

/// What a threshold crossing led to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompletionOutcome {
    /// This call recorded the completion.
    Completed { unlocked: Option<ModuleId> },
    /// Completion was already recorded; nothing was written.
    AlreadyCompleted,
    /// Another trigger for the same pair is writing right now.
    InFlight,
}

#[derive(Debug, Clone, Copy)]
struct Entry {
    phase: CompletionPhase,
    /// Attached sessions tracking this pair.
    sessions: usize,
}

impl Entry {
    fn new(phase: CompletionPhase) -> Self {
        Self { phase, sessions: 0 }
    }
}

type Entries = HashMap<(UserId, ModuleId), Entry>;

/// Fires the completion + unlock transition exactly once per (user, module).
///
/// Shared by every session. The in-memory phase is flipped to `Completing`
/// before any I/O, so a second trigger racing the first sees it and backs
/// off; the persisted completed flag is checked next, which covers replays
/// and other processes.
///
/// An entry lives while a session tracks the pair or a write is in flight,
/// and is dropped after that.
pub struct CompletionCoordinator {
    store: Arc<dyn ProgressRepository>,
    clock: Clock,
    attempts: u32,
    backoff: Duration,
    write_timeout: Duration,
    entries: Mutex<Entries>,
}

impl CompletionCoordinator {
    #[must_use]
    pub fn new(store: Arc<dyn ProgressRepository>, clock: Clock, config: &TrackingConfig) -> Self {
        Self {
            store,
            clock,
            attempts: config.completion_retry_attempts.max(1),
            backoff: config.completion_retry_backoff(),
            write_timeout: config.write_timeout(),
            entries: Mutex::new(HashMap::new()),
        }
    }

    fn entries(&self) -> std::sync::MutexGuard<'_, Entries> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Untracked pairs report `NotStarted`; the store is the authority.
    #[must_use]
    pub fn phase(&self, user: UserId, module: ModuleId) -> CompletionPhase {
        self.entries()
            .get(&(user, module))
            .map_or(CompletionPhase::NotStarted, |entry| entry.phase)
    }

    /// Pairs currently held in memory.
    #[must_use]
    pub fn tracked(&self) -> usize {
        self.entries().len()
    }

    /// Seed the phase from the stored record when a session attaches.
    ///
    /// Every call must be paired with [`Self::release`].
    pub fn track(&self, user: UserId, module: ModuleId, record: Option<&ProgressRecord>) {
        let seeded = match record {
            Some(r) if r.completed() => CompletionPhase::Completed,
            Some(_) => CompletionPhase::InProgress,
            None => CompletionPhase::NotStarted,
        };
        let mut entries = self.entries();
        let entry = entries
            .entry((user, module))
            .or_insert_with(|| Entry::new(seeded));
        entry.sessions += 1;
        if entry.phase == CompletionPhase::NotStarted || seeded == CompletionPhase::Completed {
            entry.phase = seeded;
        }
    }

    /// A session on the pair detached. The entry goes away with the last
    /// one, unless a completion write is still running.
    pub fn release(&self, user: UserId, module: ModuleId) {
        let mut entries = self.entries();
        let Some(entry) = entries.get_mut(&(user, module)) else {
            return;
        };
        entry.sessions = entry.sessions.saturating_sub(1);
        if entry.sessions == 0 && entry.phase != CompletionPhase::Completing {
            entries.remove(&(user, module));
        }
    }

    /// First observed progress moves `NotStarted` to `InProgress`.
    pub fn note_progress(&self, user: UserId, module: ModuleId) {
        let mut entries = self.entries();
        if let Some(entry) = entries.get_mut(&(user, module)) {
            if entry.phase == CompletionPhase::NotStarted {
                entry.phase = CompletionPhase::InProgress;
            }
        }
    }

    /// Handle a threshold crossing for `module`.
    ///
    /// On a genuine transition, marks the module completed and unlocks the
    /// next one by sequence number in a single store transaction, retrying
    /// with exponential backoff. On failure the phase falls back to
    /// `InProgress` so the next natural signal tries again.
    ///
    /// # Errors
    ///
    /// Returns `CompletionError` once every attempt failed or timed out.
    pub async fn complete(
        &self,
        user: UserId,
        catalog: &ModuleCatalog,
        module: ModuleId,
        last_position: f64,
    ) -> Result<CompletionOutcome, CompletionError> {
        {
            let mut entries = self.entries();
            let entry = entries
                .entry((user, module))
                .or_insert_with(|| Entry::new(CompletionPhase::NotStarted));
            match entry.phase {
                CompletionPhase::Completed => return Ok(CompletionOutcome::AlreadyCompleted),
                CompletionPhase::Completing => return Ok(CompletionOutcome::InFlight),
                CompletionPhase::NotStarted | CompletionPhase::InProgress => {
                    entry.phase = CompletionPhase::Completing;
                }
            }
        }

        let result = self.persist(user, catalog, module, last_position).await;
        let next_phase = match &result {
            Ok(_) => CompletionPhase::Completed,
            Err(_) => CompletionPhase::InProgress,
        };
        let mut entries = self.entries();
        if let Some(entry) = entries.get_mut(&(user, module)) {
            if entry.sessions == 0 {
                entries.remove(&(user, module));
            } else {
                entry.phase = next_phase;
            }
        }
        result
    }

    async fn persist(
        &self,
        user: UserId,
        catalog: &ModuleCatalog,
        module: ModuleId,
        last_position: f64,
    ) -> Result<CompletionOutcome, CompletionError> {
        if let Some(record) = self.store.get_progress(user, module).await? {
            if record.completed() {
                debug!(%user, %module, "completion already recorded");
                return Ok(CompletionOutcome::AlreadyCompleted);
            }
        }

        let next = catalog.next_after(module).map(Module::id);
        let write = self.write_with_retry(user, module, last_position, next).await?;
        if write.already_completed {
            return Ok(CompletionOutcome::AlreadyCompleted);
        }

        info!(%user, %module, next = ?write.unlocked, "module completed");
        Ok(CompletionOutcome::Completed {
            unlocked: write.unlocked,
        })
    }

    async fn write_with_retry(
        &self,
        user: UserId,
        module: ModuleId,
        last_position: f64,
        next: Option<ModuleId>,
    ) -> Result<CompletionWrite, CompletionError> {
        let mut delay = self.backoff;
        let mut attempt = 1;
        loop {
            let write = self.store.complete_and_unlock(
                user,
                module,
                last_position,
                next,
                self.clock.now(),
            );
            let error = match tokio::time::timeout(self.write_timeout, write).await {
                Ok(Ok(write)) => return Ok(write),
                Ok(Err(err)) => {
                    warn!(%user, %module, attempt, error = %err, "completion write failed");
                    CompletionError::Storage(err)
                }
                Err(_) => {
                    warn!(%user, %module, attempt, "completion write timed out");
                    CompletionError::TimedOut { attempts: attempt }
                }
            };
            if attempt >= self.attempts {
                return Err(error);
            }
            tokio::time::sleep(delay).await;
            delay = delay.saturating_mul(2);
            attempt += 1;
        }
    }
}
