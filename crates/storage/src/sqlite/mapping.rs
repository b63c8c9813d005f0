use course_core::model::{
    MediaKind, MediaLocator, Module, ModuleId, Percent, ProgressRecord, UnlockState, UserId,
};
use sqlx::Row;

use crate::repository::StorageError;

fn ser<E: core::fmt::Display>(e: E) -> StorageError {
    StorageError::Serialization(e.to_string())
}

pub(crate) fn module_id_to_i64(id: ModuleId) -> Result<i64, StorageError> {
    i64::try_from(id.value()).map_err(|_| StorageError::Serialization("module_id overflow".into()))
}

pub(crate) fn module_id_from_i64(v: i64) -> Result<ModuleId, StorageError> {
    u64::try_from(v)
        .map(ModuleId::new)
        .map_err(|_| StorageError::Serialization("module_id sign overflow".into()))
}

pub(crate) fn user_id_to_text(id: UserId) -> String {
    id.to_string()
}

pub(crate) fn user_id_from_text(raw: &str) -> Result<UserId, StorageError> {
    raw.parse::<UserId>().map_err(ser)
}

pub(crate) fn map_module_row(row: &sqlx::sqlite::SqliteRow) -> Result<Module, StorageError> {
    let sequence: i64 = row.try_get("sequence_number").map_err(ser)?;
    let sequence = u32::try_from(sequence)
        .map_err(|_| StorageError::Serialization(format!("invalid sequence_number: {sequence}")))?;

    let locator: String = row.try_get("media_locator").map_err(ser)?;
    let kind: String = row.try_get("media_kind").map_err(ser)?;

    Module::new(
        module_id_from_i64(row.try_get::<i64, _>("id").map_err(ser)?)?,
        sequence,
        row.try_get::<String, _>("title").map_err(ser)?,
        MediaLocator::parse(&locator).map_err(ser)?,
        MediaKind::parse(&kind).map_err(ser)?,
    )
    .map_err(ser)
}

pub(crate) fn map_progress_row(
    row: &sqlx::sqlite::SqliteRow,
) -> Result<ProgressRecord, StorageError> {
    let user: String = row.try_get("user_id").map_err(ser)?;
    let percent: i64 = row.try_get("percent_complete").map_err(ser)?;
    let state: String = row.try_get("unlock_state").map_err(ser)?;

    ProgressRecord::from_persisted(
        user_id_from_text(&user)?,
        module_id_from_i64(row.try_get::<i64, _>("module_id").map_err(ser)?)?,
        Percent::try_from(percent).map_err(ser)?,
        row.try_get("last_position").map_err(ser)?,
        UnlockState::parse(&state).map_err(ser)?,
        row.try_get("completed_at").map_err(ser)?,
        row.try_get("updated_at").map_err(ser)?,
    )
    .map_err(ser)
}
