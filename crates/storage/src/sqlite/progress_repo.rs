use async_trait::async_trait;
use chrono::{DateTime, Utc};
use course_core::model::{ModuleId, ProgressRecord, ProgressUpdate, UnlockState, UserId};
use sqlx::SqliteConnection;
use tracing::debug;

use super::SqliteRepository;
use super::mapping::{map_progress_row, module_id_to_i64, user_id_to_text};
use crate::repository::{CompletionWrite, ProgressRepository, StorageError};

const PROGRESS_COLUMNS: &str = "user_id, module_id, percent_complete, last_position, \
                                unlock_state, completed_at, updated_at";

fn conn_err(e: sqlx::Error) -> StorageError {
    StorageError::Connection(e.to_string())
}

async fn fetch_record(
    conn: &mut SqliteConnection,
    user: UserId,
    module: ModuleId,
) -> Result<Option<ProgressRecord>, StorageError> {
    let sql = format!(
        "SELECT {PROGRESS_COLUMNS} FROM module_progress WHERE user_id = ?1 AND module_id = ?2"
    );
    let row = sqlx::query(&sql)
        .bind(user_id_to_text(user))
        .bind(module_id_to_i64(module)?)
        .fetch_optional(&mut *conn)
        .await
        .map_err(conn_err)?;
    row.as_ref().map(map_progress_row).transpose()
}

/// Inserts the bare unlock record; existing rows are left untouched.
async fn insert_unlock(
    conn: &mut SqliteConnection,
    user: UserId,
    module: ModuleId,
    now: DateTime<Utc>,
) -> Result<bool, StorageError> {
    let result = sqlx::query(
        r"
        INSERT INTO module_progress (
            user_id, module_id, percent_complete, last_position,
            unlock_state, completed_at, created_at, updated_at
        )
        VALUES (?1, ?2, 0, 0.0, ?3, NULL, ?4, ?4)
        ON CONFLICT(user_id, module_id) DO NOTHING
        ",
    )
    .bind(user_id_to_text(user))
    .bind(module_id_to_i64(module)?)
    .bind(UnlockState::Unlocked.as_str())
    .bind(now)
    .execute(&mut *conn)
    .await
    .map_err(conn_err)?;
    Ok(result.rows_affected() == 1)
}

#[async_trait]
impl ProgressRepository for SqliteRepository {
    async fn get_progress(
        &self,
        user: UserId,
        module: ModuleId,
    ) -> Result<Option<ProgressRecord>, StorageError> {
        let mut conn = self.pool.acquire().await.map_err(conn_err)?;
        fetch_record(&mut conn, user, module).await
    }

    async fn list_progress(&self, user: UserId) -> Result<Vec<ProgressRecord>, StorageError> {
        let sql = format!(
            "SELECT {PROGRESS_COLUMNS} FROM module_progress WHERE user_id = ?1 ORDER BY module_id"
        );
        let rows = sqlx::query(&sql)
            .bind(user_id_to_text(user))
            .fetch_all(&self.pool)
            .await
            .map_err(conn_err)?;

        let mut records = Vec::with_capacity(rows.len());
        for row in rows {
            records.push(map_progress_row(&row)?);
        }
        Ok(records)
    }

    async fn upsert_progress(
        &self,
        user: UserId,
        module: ModuleId,
        update: &ProgressUpdate,
        now: DateTime<Utc>,
    ) -> Result<ProgressRecord, StorageError> {
        update
            .validate()
            .map_err(|e| StorageError::Serialization(e.to_string()))?;

        let state = if update.completed {
            UnlockState::Completed
        } else {
            UnlockState::Unlocked
        };
        let completed_at = update.completed.then_some(now);

        let sql = format!(
            r"
            INSERT INTO module_progress (
                user_id, module_id, percent_complete, last_position,
                unlock_state, completed_at, created_at, updated_at
            )
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?7)
            ON CONFLICT(user_id, module_id) DO UPDATE SET
                -- percent only grows, completion only sticks
                percent_complete = MAX(module_progress.percent_complete, excluded.percent_complete),
                last_position = excluded.last_position,
                unlock_state = CASE
                    WHEN module_progress.unlock_state = 'completed' THEN 'completed'
                    ELSE excluded.unlock_state
                END,
                completed_at = COALESCE(module_progress.completed_at, excluded.completed_at),
                updated_at = excluded.updated_at
            RETURNING {PROGRESS_COLUMNS}
            "
        );

        let row = sqlx::query(&sql)
            .bind(user_id_to_text(user))
            .bind(module_id_to_i64(module)?)
            .bind(i64::from(update.percent_complete.value()))
            .bind(update.last_position)
            .bind(state.as_str())
            .bind(completed_at)
            .bind(now)
            .fetch_one(&self.pool)
            .await
            .map_err(conn_err)?;

        let record = map_progress_row(&row)?;
        debug!(%user, %module, percent = %record.percent_complete(), "progress upserted");
        Ok(record)
    }

    async fn complete_and_unlock(
        &self,
        user: UserId,
        module: ModuleId,
        last_position: f64,
        next: Option<ModuleId>,
        now: DateTime<Utc>,
    ) -> Result<CompletionWrite, StorageError> {
        let update = ProgressUpdate::completion(last_position);
        update
            .validate()
            .map_err(|e| StorageError::Serialization(e.to_string()))?;

        let mut tx = self.pool.begin().await.map_err(conn_err)?;

        // Writing first takes the write lock before anything is read, so a
        // concurrent completion waits here and then matches zero rows.
        let completed = sqlx::query(
            r"
            INSERT INTO module_progress (
                user_id, module_id, percent_complete, last_position,
                unlock_state, completed_at, created_at, updated_at
            )
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?6, ?6)
            ON CONFLICT(user_id, module_id) DO UPDATE SET
                percent_complete = excluded.percent_complete,
                last_position = excluded.last_position,
                unlock_state = excluded.unlock_state,
                completed_at = excluded.completed_at,
                updated_at = excluded.updated_at
            WHERE module_progress.unlock_state <> 'completed'
            ",
        )
        .bind(user_id_to_text(user))
        .bind(module_id_to_i64(module)?)
        .bind(i64::from(update.percent_complete.value()))
        .bind(update.last_position)
        .bind(UnlockState::Completed.as_str())
        .bind(now)
        .execute(&mut *tx)
        .await
        .map_err(conn_err)?
        .rows_affected()
            == 1;

        let unlocked = match next {
            Some(next) if completed => insert_unlock(&mut tx, user, next, now)
                .await?
                .then_some(next),
            _ => None,
        };

        let record = fetch_record(&mut tx, user, module)
            .await?
            .ok_or(StorageError::NotFound)?;

        tx.commit().await.map_err(conn_err)?;

        Ok(CompletionWrite {
            record,
            already_completed: !completed,
            unlocked,
        })
    }
}
