use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

use crate::model::ids::{ModuleId, UserId};
use crate::model::module::Module;

//
// ─── ERRORS ────────────────────────────────────────────────────────────────────
//

#[derive(Debug, Error, Clone, PartialEq)]
#[non_exhaustive]
pub enum ProgressError {
    #[error("percent must be within 0..=100, got {0}")]
    InvalidPercent(i64),

    #[error("position must be a finite, non-negative number of seconds, got {0}")]
    InvalidPosition(f64),

    #[error("completed record is missing completed_at")]
    MissingCompletedAt,

    #[error("unknown unlock state: {0}")]
    UnknownUnlockState(String),
}

//
// ─── PERCENT ───────────────────────────────────────────────────────────────────
//

/// Whole-number percentage in `0..=100`.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct Percent(u8);

impl Percent {
    pub const ZERO: Percent = Percent(0);
    pub const FULL: Percent = Percent(100);
    /// Default point at which a module counts as finished.
    pub const COMPLETION_THRESHOLD: Percent = Percent(95);

    /// # Errors
    ///
    /// Returns `ProgressError::InvalidPercent` above 100.
    pub fn new(value: u8) -> Result<Self, ProgressError> {
        if value > 100 {
            return Err(ProgressError::InvalidPercent(i64::from(value)));
        }
        Ok(Self(value))
    }

    /// Saturates into `0..=100`.
    #[must_use]
    pub fn clamped(value: i64) -> Self {
        // clamp keeps the value within u8 range
        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        Self(value.clamp(0, 100) as u8)
    }

    #[must_use]
    pub fn value(self) -> u8 {
        self.0
    }
}

impl fmt::Display for Percent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}%", self.0)
    }
}

impl TryFrom<i64> for Percent {
    type Error = ProgressError;

    fn try_from(value: i64) -> Result<Self, Self::Error> {
        u8::try_from(value)
            .map_err(|_| ProgressError::InvalidPercent(value))
            .and_then(Percent::new)
    }
}

//
// ─── UNLOCK STATE ──────────────────────────────────────────────────────────────
//

/// Whether a user may start a module.
///
/// `Unlocked` and `Completed` are persisted on the progress record;
/// `Locked` is the absence of a record for a module past the first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum UnlockState {
    Locked,
    Unlocked,
    Completed,
}

impl UnlockState {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            UnlockState::Locked => "locked",
            UnlockState::Unlocked => "unlocked",
            UnlockState::Completed => "completed",
        }
    }

    /// Parses a persisted state. `locked` is accepted for completeness even
    /// though stores never write it.
    ///
    /// # Errors
    ///
    /// Returns `ProgressError::UnknownUnlockState` for unknown input.
    pub fn parse(raw: &str) -> Result<Self, ProgressError> {
        match raw {
            "locked" => Ok(UnlockState::Locked),
            "unlocked" => Ok(UnlockState::Unlocked),
            "completed" => Ok(UnlockState::Completed),
            other => Err(ProgressError::UnknownUnlockState(other.to_owned())),
        }
    }

    /// Resolve the state of `module` for a user from its record, if any.
    ///
    /// The entry-point module is unlocked even without a record.
    #[must_use]
    pub fn for_module(module: &Module, record: Option<&ProgressRecord>) -> Self {
        match record {
            Some(r) => r.unlock_state(),
            None if module.is_entry_point() => UnlockState::Unlocked,
            None => UnlockState::Locked,
        }
    }

    #[must_use]
    pub fn is_unlocked(&self) -> bool {
        !matches!(self, UnlockState::Locked)
    }
}

//
// ─── UPDATE (write shape) ──────────────────────────────────────────────────────
//

/// One upsert against a progress record.
///
/// Stores merge it as: `percent = max(existing, new)`, `last_position`
/// overwritten, `completed` sticky once true.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ProgressUpdate {
    pub percent_complete: Percent,
    pub last_position: f64,
    pub completed: bool,
}

impl ProgressUpdate {
    /// A regular, non-completing progress write.
    #[must_use]
    pub fn progress(percent_complete: Percent, last_position: f64) -> Self {
        Self {
            percent_complete,
            last_position,
            completed: false,
        }
    }

    /// The completion write: full percent, completed flag set.
    #[must_use]
    pub fn completion(last_position: f64) -> Self {
        Self {
            percent_complete: Percent::FULL,
            last_position,
            completed: true,
        }
    }

    /// # Errors
    ///
    /// Returns `ProgressError::InvalidPosition` for negative or non-finite positions.
    pub fn validate(&self) -> Result<(), ProgressError> {
        validate_position(self.last_position)
    }
}

fn validate_position(position: f64) -> Result<(), ProgressError> {
    if position.is_finite() && position >= 0.0 {
        Ok(())
    } else {
        Err(ProgressError::InvalidPosition(position))
    }
}

//
// ─── RECORD ────────────────────────────────────────────────────────────────────
//

/// Durable progress of one user through one module.
#[derive(Debug, Clone, PartialEq)]
pub struct ProgressRecord {
    user_id: UserId,
    module_id: ModuleId,
    percent_complete: Percent,
    last_position: f64,
    state: UnlockState,
    completed_at: Option<DateTime<Utc>>,
    updated_at: DateTime<Utc>,
}

impl ProgressRecord {
    /// The initial record whose existence unlocks a module.
    #[must_use]
    pub fn unlocked(user_id: UserId, module_id: ModuleId, now: DateTime<Utc>) -> Self {
        Self {
            user_id,
            module_id,
            percent_complete: Percent::ZERO,
            last_position: 0.0,
            state: UnlockState::Unlocked,
            completed_at: None,
            updated_at: now,
        }
    }

    /// Rehydrate a record from storage.
    ///
    /// # Errors
    ///
    /// Returns `ProgressError` for a negative position, a `Locked` state, or a
    /// completed record without `completed_at`.
    pub fn from_persisted(
        user_id: UserId,
        module_id: ModuleId,
        percent_complete: Percent,
        last_position: f64,
        state: UnlockState,
        completed_at: Option<DateTime<Utc>>,
        updated_at: DateTime<Utc>,
    ) -> Result<Self, ProgressError> {
        validate_position(last_position)?;
        match state {
            UnlockState::Locked => {
                return Err(ProgressError::UnknownUnlockState(state.as_str().to_owned()));
            }
            UnlockState::Completed if completed_at.is_none() => {
                return Err(ProgressError::MissingCompletedAt);
            }
            _ => {}
        }
        Ok(Self {
            user_id,
            module_id,
            percent_complete,
            last_position,
            state,
            completed_at,
            updated_at,
        })
    }

    /// First write for a module that had no record yet.
    #[must_use]
    pub fn from_update(
        user_id: UserId,
        module_id: ModuleId,
        update: &ProgressUpdate,
        now: DateTime<Utc>,
    ) -> Self {
        let mut record = Self::unlocked(user_id, module_id, now);
        record.apply(update, now);
        record
    }

    /// Merge an update into this record.
    ///
    /// Percent never decreases and completion is never reset.
    pub fn apply(&mut self, update: &ProgressUpdate, now: DateTime<Utc>) {
        self.percent_complete = self.percent_complete.max(update.percent_complete);
        self.last_position = update.last_position;
        if update.completed && self.state != UnlockState::Completed {
            self.state = UnlockState::Completed;
            self.completed_at = Some(now);
        }
        self.updated_at = now;
    }

    #[must_use]
    pub fn user_id(&self) -> UserId {
        self.user_id
    }

    #[must_use]
    pub fn module_id(&self) -> ModuleId {
        self.module_id
    }

    #[must_use]
    pub fn percent_complete(&self) -> Percent {
        self.percent_complete
    }

    #[must_use]
    pub fn last_position(&self) -> f64 {
        self.last_position
    }

    #[must_use]
    pub fn completed(&self) -> bool {
        self.state == UnlockState::Completed
    }

    #[must_use]
    pub fn unlock_state(&self) -> UnlockState {
        self.state
    }

    #[must_use]
    pub fn completed_at(&self) -> Option<DateTime<Utc>> {
        self.completed_at
    }

    #[must_use]
    pub fn updated_at(&self) -> DateTime<Utc> {
        self.updated_at
    }
}
